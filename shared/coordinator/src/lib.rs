mod coordinator;
mod heartbeat;
mod scheduler;

pub use coordinator::{CoordinatorConfig, TrainingCoordinator};
pub use heartbeat::HeartbeatMonitor;
pub use scheduler::{SchedulerConfig, ScoreWeights, select_devices};
