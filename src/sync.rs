mod clock;
mod engine;
mod ledger;
mod scheduler;

pub use clock::{Clock, ManualClock, TimerCallback, TimerHandle, TokioClock};
pub use engine::{CommitOutcome, EngineOptions, PullReport, SyncEngine};
pub use ledger::{hash_content, LedgerSnapshot, PendingState, PendingWrite};
pub use scheduler::{CommitFn, CommitScheduler};
