//! Lock acquisition state machine.
//!
//! The machine never performs I/O. Every timer fire, store response, signal
//! or child exit reaches it as an [`Event`]; it answers with the
//! [`Command`]s the runner must execute.

use std::time::Duration;

use log::{debug, error, info, warn};

use super::signals::ForwardedSignal;
use crate::config::LockConfig;
use crate::kv::{owned_by, Indexed};
use crate::watch::{WatchCursor, WatchOutcome};

/// Exit code used when the tool stops without a child exit code to report.
const EXIT_NO_CHILD: i32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Acquiring,
    Verifying,
    Held,
    Watching,
    ShuttingDown,
    Released,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Start,
    SessionCreated(String),
    /// Result of a CAS acquire.
    AcquireResponded(bool),
    RetryElapsed,
    /// Read-back of the lock key after an accepted acquire.
    OwnerRead { owner: Option<String>, index: u64 },
    ChildStarted { pid: u32 },
    /// Response of the loss-watch.
    WatchResponded { owner: Option<String>, index: u64 },
    Signal(ForwardedSignal),
    EscalationElapsed,
    ChildExited(i32),
    /// Any store call failed.
    ApiFailed(String),
    /// Best-effort release and session destroy finished.
    Released,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    CreateSession,
    StartRenewal(String),
    StopRenewal,
    /// Stop using a session for good. Never followed by another call with it.
    DiscardSession(String),
    Acquire(String),
    RetryAfter(Duration),
    ReadOwner,
    InstallSignals,
    Spawn,
    WatchOwner(u64),
    /// Drop the in-flight store request, if any.
    CancelRequest,
    ForwardSignal(ForwardedSignal),
    ArmEscalation(Duration),
    CancelEscalation,
    Kill,
    Release(String),
    Exit(i32),
}

pub struct LockMachine {
    key: String,
    config: LockConfig,
    state: LockState,
    session: Option<String>,
    cursor: Option<WatchCursor>,
    child_running: bool,
    escalation_armed: bool,
    restart_pending: bool,
    exit_code: Option<i32>,
}

impl LockMachine {
    pub fn new(key: impl Into<String>, config: LockConfig) -> Self {
        Self {
            key: key.into(),
            config,
            state: LockState::Idle,
            session: None,
            cursor: None,
            child_running: false,
            escalation_armed: false,
            restart_pending: false,
            exit_code: None,
        }
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn handle(&mut self, event: Event) -> Vec<Command> {
        use LockState::*;

        match (self.state, event) {
            (Idle, Event::Start) | (Idle, Event::RetryElapsed) => vec![Command::CreateSession],
            (Idle, Event::SessionCreated(id)) => {
                info!("{}: created session {}", self.key, id);
                self.session = Some(id.clone());
                self.state = Acquiring;
                vec![Command::StartRenewal(id.clone()), Command::Acquire(id)]
            }
            (Acquiring, Event::AcquireResponded(true)) => {
                self.state = Verifying;
                vec![Command::ReadOwner]
            }
            (Acquiring, Event::AcquireResponded(false)) => {
                debug!(
                    "{}: held by another session, retrying in {:?}",
                    self.key, self.config.contention_delay
                );
                vec![Command::RetryAfter(self.config.contention_delay)]
            }
            (Acquiring, Event::RetryElapsed) => self.acquire(),
            (Verifying, Event::OwnerRead { owner, index }) => self.verify(owner, index),
            (Held, Event::ChildStarted { pid }) => {
                info!("{}: lock held, child {} started", self.key, pid);
                self.child_running = true;
                self.state = Watching;
                vec![Command::WatchOwner(self.watch_index())]
            }
            (Watching, Event::WatchResponded { owner, index }) => self.on_watch(owner, index),
            (Held, Event::Signal(signal)) | (Watching, Event::Signal(signal)) => {
                info!("{}: received {}, shutting down", self.key, signal);
                self.begin_shutdown(signal)
            }
            (ShuttingDown, Event::Signal(signal)) => {
                if self.restart_pending {
                    info!(
                        "{}: received {} during restart, exiting once the child stops",
                        self.key, signal
                    );
                    self.restart_pending = false;
                } else {
                    warn!("{}: ignoring {}, shutdown already in progress", self.key, signal);
                }
                Vec::new()
            }
            (Idle, Event::Signal(signal))
            | (Acquiring, Event::Signal(signal))
            | (Verifying, Event::Signal(signal)) => {
                info!("{}: received {} before the lock was held", self.key, signal);
                self.state = ShuttingDown;
                self.exit_code = Some(signal.exit_code());
                self.release_or_exit(vec![Command::StopRenewal, Command::CancelRequest])
            }
            (ShuttingDown, Event::EscalationElapsed) => {
                self.escalation_armed = false;
                if self.child_running {
                    warn!(
                        "{}: child still running {:?} after signal, killing",
                        self.key, self.config.kill_grace
                    );
                    vec![Command::Kill]
                } else {
                    Vec::new()
                }
            }
            (Held, Event::ChildExited(code))
            | (Watching, Event::ChildExited(code))
            | (ShuttingDown, Event::ChildExited(code)) => self.on_child_exit(code),
            (ShuttingDown, Event::Released) => {
                self.state = Released;
                vec![Command::Exit(self.exit_code.unwrap_or(EXIT_NO_CHILD))]
            }
            (Idle, Event::ApiFailed(reason))
            | (Acquiring, Event::ApiFailed(reason))
            | (Verifying, Event::ApiFailed(reason)) => self.restart(&reason),
            (Held, Event::ApiFailed(reason)) | (Watching, Event::ApiFailed(reason)) => {
                error!(
                    "{}: {}; stopping child before rebuilding the session",
                    self.key, reason
                );
                self.restart_pending = true;
                self.begin_shutdown(ForwardedSignal::Terminate)
            }
            (state, event) => {
                debug!("{}: ignoring {:?} in {:?}", self.key, event, state);
                Vec::new()
            }
        }
    }

    fn acquire(&mut self) -> Vec<Command> {
        match &self.session {
            Some(id) => {
                self.state = LockState::Acquiring;
                vec![Command::Acquire(id.clone())]
            }
            None => self.restart("acquire without a session"),
        }
    }

    fn verify(&mut self, owner: Option<String>, index: u64) -> Vec<Command> {
        let Some(session) = self.session.as_deref() else {
            return self.restart("verify without a session");
        };
        if !owned_by(owner.as_deref(), session) {
            warn!(
                "{}: acquire accepted but owner is {:?}, retrying",
                self.key, owner
            );
            return self.acquire();
        }
        self.state = LockState::Held;
        self.cursor = Some(WatchCursor::at(self.key.clone(), index));
        vec![Command::InstallSignals, Command::Spawn]
    }

    fn on_watch(&mut self, owner: Option<String>, index: u64) -> Vec<Command> {
        let Some(session) = self.session.clone() else {
            return self.restart("watch without a session");
        };
        let Some(cursor) = self.cursor.as_mut() else {
            return self.restart("watch without a cursor");
        };
        match cursor.observe(Indexed::new(owner, index)) {
            WatchOutcome::Unchanged => vec![Command::WatchOwner(cursor.last_index())],
            WatchOutcome::Changed(change) if owned_by(change.value.as_deref(), &session) => {
                vec![Command::WatchOwner(cursor.last_index())]
            }
            WatchOutcome::Changed(change) => {
                warn!(
                    "{}: lock lost at index {}, owner is now {:?}",
                    self.key, change.index, change.value
                );
                self.begin_shutdown(ForwardedSignal::Terminate)
            }
        }
    }

    fn watch_index(&self) -> u64 {
        self.cursor.as_ref().map(WatchCursor::last_index).unwrap_or(0)
    }

    fn begin_shutdown(&mut self, signal: ForwardedSignal) -> Vec<Command> {
        self.state = LockState::ShuttingDown;
        let mut commands = vec![Command::CancelRequest];
        if self.child_running {
            self.escalation_armed = true;
            commands.push(Command::ForwardSignal(signal));
            commands.push(Command::ArmEscalation(self.config.kill_grace));
        }
        commands
    }

    fn on_child_exit(&mut self, code: i32) -> Vec<Command> {
        info!("{}: child exited with {}", self.key, code);
        self.child_running = false;
        self.state = LockState::ShuttingDown;
        let mut commands = vec![Command::StopRenewal, Command::CancelRequest];
        if self.escalation_armed {
            self.escalation_armed = false;
            commands.push(Command::CancelEscalation);
        }
        if self.restart_pending {
            self.restart_pending = false;
            commands.extend(self.restart("child stopped for session rebuild"));
            return commands;
        }
        self.exit_code = Some(code);
        self.release_or_exit(commands)
    }

    fn release_or_exit(&mut self, mut commands: Vec<Command>) -> Vec<Command> {
        match &self.session {
            Some(id) => commands.push(Command::Release(id.clone())),
            None => {
                self.state = LockState::Released;
                commands.push(Command::Exit(self.exit_code.unwrap_or(EXIT_NO_CHILD)));
            }
        }
        commands
    }

    /// Throws away the session and cursor and starts over from a new session.
    fn restart(&mut self, reason: &str) -> Vec<Command> {
        error!("{}: {}; restarting with a new session", self.key, reason);
        let mut commands = vec![Command::CancelRequest];
        if let Some(id) = self.session.take() {
            commands.push(Command::DiscardSession(id));
        }
        self.cursor = None;
        self.state = LockState::Idle;
        commands.push(Command::RetryAfter(self.config.restart_delay));
        commands
    }
}
