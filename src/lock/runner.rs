//! Executes [`LockMachine`] commands against a store and a child process.
//!
//! One task owns everything: the in-flight store request, the renewal
//! request, the lease, retry and escalation timers, the child and the
//! signal listener. Each slot is an `Option`; an empty slot never wakes the
//! loop, so dropping a slot is how a command cancels work.

use std::collections::VecDeque;
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep, Sleep};

use super::machine::{Command, Event, LockMachine};
use super::session::{self, SessionLease};
use super::signals::{ForwardedSignal, SignalListener, SignalSource};
use super::supervisor::{spawn_failure_code, ChildSupervisor, CommandSpec};
use crate::config::LockConfig;
use crate::kv::{KvStore, PutMode, QueryOptions};

type Pending = Pin<Box<dyn Future<Output = Event> + Send>>;

/// Runs a command while holding a session-backed lock on `key`.
pub struct LockRunner<S: ?Sized> {
    store: Arc<S>,
    key: String,
    command: CommandSpec,
    config: LockConfig,
    signals: SignalSource,
}

impl<S: KvStore + ?Sized + 'static> LockRunner<S> {
    pub fn new(store: Arc<S>, key: impl Into<String>, command: CommandSpec, config: LockConfig) -> Self {
        Self {
            store,
            key: key.into(),
            command,
            config,
            signals: SignalSource::Os,
        }
    }

    /// Takes signals from `rx` instead of installing process handlers.
    pub fn with_signals(mut self, rx: mpsc::UnboundedReceiver<ForwardedSignal>) -> Self {
        self.signals = SignalSource::Channel(rx);
        self
    }

    /// Runs until the lock is released. Returns the process exit code.
    pub async fn run(self) -> i32 {
        let mut driver = Driver {
            machine: LockMachine::new(self.key.clone(), self.config.clone()),
            store: self.store,
            key: self.key,
            command: self.command,
            config: self.config,
            inbox: VecDeque::new(),
            request: None,
            renewal: None,
            lease: None,
            retry: None,
            escalation: None,
            child: None,
            signal_source: Some(self.signals),
            signals: None,
        };
        driver.run().await
    }
}

enum Wake {
    Request(Event),
    /// Renewal finished; `None` when it succeeded.
    Renewal(Option<Event>),
    RenewalDue,
    Retry,
    Escalation,
    ChildExited(i32),
    Signal(ForwardedSignal),
}

struct Driver<S: ?Sized> {
    store: Arc<S>,
    key: String,
    command: CommandSpec,
    config: LockConfig,
    machine: LockMachine,
    inbox: VecDeque<Event>,
    request: Option<Pending>,
    renewal: Option<Pin<Box<dyn Future<Output = Option<Event>> + Send>>>,
    lease: Option<SessionLease>,
    retry: Option<Pin<Box<Sleep>>>,
    escalation: Option<Pin<Box<Sleep>>>,
    child: Option<ChildSupervisor>,
    signal_source: Option<SignalSource>,
    signals: Option<SignalListener>,
}

impl<S: KvStore + ?Sized + 'static> Driver<S> {
    async fn run(&mut self) -> i32 {
        self.inbox.push_back(Event::Start);
        loop {
            while let Some(event) = self.inbox.pop_front() {
                for command in self.machine.handle(event) {
                    if let Some(code) = self.execute(command) {
                        return code;
                    }
                }
            }
            let wake = self.next_wake().await;
            self.dispatch(wake);
        }
    }

    async fn next_wake(&mut self) -> Wake {
        let renewing = self.renewal.is_some();
        tokio::select! {
            event = poll_slot(&mut self.request) => Wake::Request(event),
            outcome = poll_slot(&mut self.renewal) => Wake::Renewal(outcome),
            _ = lease_due(&mut self.lease), if !renewing => Wake::RenewalDue,
            _ = poll_slot(&mut self.retry) => Wake::Retry,
            _ = poll_slot(&mut self.escalation) => Wake::Escalation,
            code = child_exit(&mut self.child) => Wake::ChildExited(code),
            signal = next_signal(&mut self.signals) => Wake::Signal(signal),
        }
    }

    /// Clears the slot that fired and queues its event.
    fn dispatch(&mut self, wake: Wake) {
        let event = match wake {
            Wake::Request(event) => {
                self.request = None;
                event
            }
            Wake::Renewal(outcome) => {
                self.renewal = None;
                match outcome {
                    Some(event) => event,
                    None => return,
                }
            }
            Wake::RenewalDue => {
                self.renew();
                return;
            }
            Wake::Retry => {
                self.retry = None;
                Event::RetryElapsed
            }
            Wake::Escalation => {
                self.escalation = None;
                Event::EscalationElapsed
            }
            Wake::ChildExited(code) => {
                self.child = None;
                Event::ChildExited(code)
            }
            Wake::Signal(signal) => Event::Signal(signal),
        };
        self.inbox.push_back(event);
    }

    fn renew(&mut self) {
        let Some(lease) = &self.lease else {
            return;
        };
        let store = Arc::clone(&self.store);
        let id = lease.id().to_string();
        self.renewal = Some(Box::pin(async move {
            match session::renew(&*store, &id).await {
                Ok(()) => None,
                Err(err) => Some(Event::ApiFailed(format!("session renew: {err}"))),
            }
        }));
    }

    /// Returns the exit code once the machine asks to exit.
    fn execute(&mut self, command: Command) -> Option<i32> {
        match command {
            Command::CreateSession => {
                let store = Arc::clone(&self.store);
                let key = self.key.clone();
                let ttl = self.config.session_ttl;
                self.request = Some(Box::pin(async move {
                    match store.create_session(&key, ttl).await {
                        Ok(id) => Event::SessionCreated(id),
                        Err(err) => Event::ApiFailed(format!("session create: {err}")),
                    }
                }));
            }
            Command::StartRenewal(id) => {
                self.renewal = None;
                self.lease = Some(SessionLease::start(id, self.config.renew_interval));
            }
            Command::StopRenewal => {
                self.lease = None;
                self.renewal = None;
            }
            Command::DiscardSession(id) => {
                self.lease = None;
                self.renewal = None;
                let store = Arc::clone(&self.store);
                tokio::spawn(async move {
                    session::destroy_quietly(&*store, &id).await;
                });
            }
            Command::Acquire(id) => {
                let store = Arc::clone(&self.store);
                let key = self.key.clone();
                self.request = Some(Box::pin(async move {
                    match store.put(&key, b"", PutMode::Acquire(id)).await {
                        Ok(accepted) => Event::AcquireResponded(accepted),
                        Err(err) => Event::ApiFailed(format!("acquire: {err}")),
                    }
                }));
            }
            Command::RetryAfter(delay) => self.retry = Some(Box::pin(sleep(delay))),
            Command::ReadOwner => {
                let store = Arc::clone(&self.store);
                let key = self.key.clone();
                self.request = Some(Box::pin(async move {
                    match store.get(&key, QueryOptions::default()).await {
                        Ok(read) => {
                            let index = read
                                .value
                                .as_ref()
                                .map(|entry| entry.modify_index)
                                .unwrap_or(read.index);
                            Event::OwnerRead {
                                owner: read.value.and_then(|entry| entry.session),
                                index,
                            }
                        }
                        Err(err) => Event::ApiFailed(format!("verify: {err}")),
                    }
                }));
            }
            Command::InstallSignals => self.install_signals(),
            Command::Spawn => match ChildSupervisor::spawn(&self.command) {
                Ok(child) => {
                    self.inbox.push_back(Event::ChildStarted { pid: child.pid() });
                    self.child = Some(child);
                }
                Err(err) => {
                    error!("{}: cannot start {}: {}", self.key, self.command.display_name(), err);
                    self.inbox.push_back(Event::ChildExited(spawn_failure_code(&err)));
                }
            },
            Command::WatchOwner(index) => {
                let store = Arc::clone(&self.store);
                let key = self.key.clone();
                let opts = QueryOptions::blocking(index, self.config.watch_wait);
                self.request = Some(Box::pin(async move {
                    match store.get(&key, opts).await {
                        Ok(read) => Event::WatchResponded {
                            owner: read.value.and_then(|entry| entry.session),
                            index: read.index,
                        },
                        Err(err) => Event::ApiFailed(format!("watch: {err}")),
                    }
                }));
            }
            Command::CancelRequest => self.request = None,
            Command::ForwardSignal(signal) => {
                if let Some(child) = &self.child {
                    match child.signal(signal) {
                        Ok(()) => info!("{}: sent {} to child {}", self.key, signal, child.pid()),
                        Err(err) => warn!("{}: sending {} to child: {}", self.key, signal, err),
                    }
                }
            }
            Command::ArmEscalation(grace) => self.escalation = Some(Box::pin(sleep(grace))),
            Command::CancelEscalation => self.escalation = None,
            Command::Kill => {
                if let Some(child) = &self.child {
                    if let Err(err) = child.kill() {
                        warn!("{}: killing child {}: {}", self.key, child.pid(), err);
                    }
                }
            }
            Command::Release(id) => {
                let store = Arc::clone(&self.store);
                let key = self.key.clone();
                self.request = Some(Box::pin(async move {
                    match store.put(&key, b"", PutMode::Release(id.clone())).await {
                        Ok(true) => info!("{key}: released"),
                        Ok(false) => warn!("{key}: not held at release"),
                        Err(err) => warn!("{key}: release failed: {err}"),
                    }
                    session::destroy_quietly(&*store, &id).await;
                    Event::Released
                }));
            }
            Command::Exit(code) => return Some(code),
        }
        None
    }

    /// Installs handlers once, when the lock is first held.
    ///
    /// They are not removed when the child exits. A signal that arrives while
    /// the lock is being released is ignored; one that arrives while a restart
    /// is pending cancels the restart and exits with 128+n.
    fn install_signals(&mut self) {
        let Some(source) = self.signal_source.take() else {
            return;
        };
        match SignalListener::install(source) {
            Ok(listener) => self.signals = Some(listener),
            Err(err) => error!("installing signal handlers: {err}"),
        }
    }
}

async fn poll_slot<F: Future + Unpin>(slot: &mut Option<F>) -> F::Output {
    match slot {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn lease_due(lease: &mut Option<SessionLease>) {
    match lease {
        Some(lease) => lease.due().await,
        None => pending().await,
    }
}

async fn child_exit(child: &mut Option<ChildSupervisor>) -> i32 {
    match child {
        Some(child) => child.exited().await,
        None => pending().await,
    }
}

async fn next_signal(signals: &mut Option<SignalListener>) -> ForwardedSignal {
    match signals {
        Some(listener) => listener.recv().await,
        None => pending().await,
    }
}
