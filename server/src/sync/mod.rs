//! Change processing: the per-event dispatcher, the partitioned worker
//! pipeline that feeds it, and the initial bulk load.

mod dispatcher;
mod initial;
mod worker;

pub use dispatcher::{Dispatcher, Disposition};
pub use initial::{initial_sync, InitialSyncReport};
pub use worker::{Pipeline, RetryPolicy};
