use std::fmt;
use std::future::pending;
use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

/// Terminating signals the lock holder relays to its child.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ForwardedSignal {
    Interrupt,
    Terminate,
    Hangup,
}

impl ForwardedSignal {
    pub fn as_raw(self) -> libc::c_int {
        match self {
            ForwardedSignal::Interrupt => libc::SIGINT,
            ForwardedSignal::Terminate => libc::SIGTERM,
            ForwardedSignal::Hangup => libc::SIGHUP,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ForwardedSignal::Interrupt => "SIGINT",
            ForwardedSignal::Terminate => "SIGTERM",
            ForwardedSignal::Hangup => "SIGHUP",
        }
    }

    /// Shell convention for a process that dies of this signal.
    pub fn exit_code(self) -> i32 {
        128 + self.as_raw()
    }
}

impl fmt::Display for ForwardedSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the runner takes terminating signals from.
pub enum SignalSource {
    /// Process signal handlers for SIGINT, SIGTERM and SIGHUP.
    Os,
    /// Signals injected by the caller.
    Channel(mpsc::UnboundedReceiver<ForwardedSignal>),
}

/// Installed signal source. Handlers stay registered until dropped.
pub struct SignalListener {
    inner: Listener,
}

enum Listener {
    Os {
        interrupt: Signal,
        terminate: Signal,
        hangup: Signal,
    },
    Channel(mpsc::UnboundedReceiver<ForwardedSignal>),
}

impl SignalListener {
    pub fn install(source: SignalSource) -> io::Result<Self> {
        let inner = match source {
            SignalSource::Os => Listener::Os {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
                hangup: signal(SignalKind::hangup())?,
            },
            SignalSource::Channel(rx) => Listener::Channel(rx),
        };
        Ok(Self { inner })
    }

    /// Next signal. Never resolves once the source is exhausted.
    pub async fn recv(&mut self) -> ForwardedSignal {
        match &mut self.inner {
            Listener::Os {
                interrupt,
                terminate,
                hangup,
            } => {
                tokio::select! {
                    Some(()) = interrupt.recv() => ForwardedSignal::Interrupt,
                    Some(()) = terminate.recv() => ForwardedSignal::Terminate,
                    Some(()) = hangup.recv() => ForwardedSignal::Hangup,
                    else => pending().await,
                }
            }
            Listener::Channel(rx) => match rx.recv().await {
                Some(signal) => signal,
                None => pending().await,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn exit_codes_follow_shell_convention() {
        assert_eq!(ForwardedSignal::Interrupt.exit_code(), 130);
        assert_eq!(ForwardedSignal::Terminate.exit_code(), 143);
        assert_eq!(ForwardedSignal::Hangup.exit_code(), 129);
        assert_eq!(ForwardedSignal::Terminate.to_string(), "SIGTERM");
    }

    #[tokio::test]
    async fn channel_source_delivers_then_parks() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listener = SignalListener::install(SignalSource::Channel(rx)).expect("install");
        tx.send(ForwardedSignal::Hangup).expect("send");
        drop(tx);
        assert_eq!(listener.recv().await, ForwardedSignal::Hangup);
        let parked = tokio::time::timeout(Duration::from_millis(20), listener.recv()).await;
        assert!(parked.is_err());
    }
}
