pub mod engine;
pub mod pair;
pub mod reconcile;

pub use engine::{SyncEngine, SyncHandle, SyncReport};
pub use pair::{PairError, SyncPair};
pub use reconcile::{CycleReport, DestSnapshot, PendingWrites};
