//! Main application logic, generally exposed via `QueueManager`.

mod events;
mod manager;
mod metrics;
mod monitor;
mod processor;
mod queue;
mod shutdown;
mod worker;

pub use self::manager::QueueManager;
pub use self::metrics::{MetricsAggregator, MetricsHandle};
pub use self::processor::{processor_fn, FnProcessor, JobContext, Processor, ProcessorError, ProcessorRegistry};
pub use self::queue::{AttemptOutcome, Queue};
pub use self::shutdown::{DrainReport, Lifecycle, ShutdownCoordinator};
pub use self::worker::Worker;
