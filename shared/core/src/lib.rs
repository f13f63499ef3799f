mod architecture;
mod command;
mod device;
mod error;
mod job;
mod model;
mod submission;

pub use architecture::{
    ArchitectureDescriptor, DenseLayer, TensorSpec, get_architecture, list_architectures,
};
pub use command::{CommandKind, DeviceCommand};
pub use device::{BatteryState, DeviceRecord, DeviceStatus, DeviceTelemetry, HardwareProfile};
pub use error::{ErrorKind, OrchestraError};
pub use job::{JobStatus, RoundMetrics, RoundRecord, TrainingJobRecord};
pub use model::{ModelRecord, ModelStatus};
pub use submission::GradientSubmission;
