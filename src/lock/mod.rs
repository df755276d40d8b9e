//! Run a command while holding a session-backed lock.
//!
//! [`machine`] decides, [`runner`] does. The remaining modules are the
//! pieces the runner drives: the session lease, the child process and the
//! signal listener.

pub mod machine;
pub mod runner;
pub mod session;
pub mod signals;
pub mod supervisor;

pub use machine::{Command, Event, LockMachine, LockState};
pub use runner::LockRunner;
pub use signals::ForwardedSignal;
pub use supervisor::CommandSpec;
