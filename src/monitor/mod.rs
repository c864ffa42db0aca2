pub mod detector;
pub mod lifecycle;
pub mod pipeline;
pub mod scheduler;
pub mod store;

pub use detector::{DetectorConfig, EventDetector};
pub use pipeline::Pipeline;
pub use scheduler::{Scheduler, SchedulerSettings};
pub use store::SnapshotStore;
