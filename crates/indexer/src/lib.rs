//! Indexing and aggregation engine.
//!
//! Every long-running component exposes a `tick` that does one unit of work
//! and a `run` loop that ticks on a timer until its cancellation token fires.

pub mod activity;
pub mod contract_cache;
pub mod notifier;
pub mod poller;
pub mod processor;
pub mod records;
pub mod stats;
pub mod supervisor;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use activity::{ActivityAggregator, DirtyPeriods, WriteBack};
pub use contract_cache::ContractCache;
pub use notifier::{Alert, AlertSink, LogSink, Notifier, TelegramSink};
pub use poller::LogPoller;
pub use processor::BlockProcessor;
pub use stats::StatsAccumulator;
pub use supervisor::Supervisor;
