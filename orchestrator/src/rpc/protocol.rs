use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orchestra_core::{CommandKind, DeviceRecord, DeviceTelemetry, ErrorKind, HardwareProfile};
use orchestra_store::ModelMeta;

/// Model downloads stream the blob in slices of this size.
pub const DOWNLOAD_CHUNK_SIZE: usize = 32 * 1024;

/// Everything a device can send. One frame per message; streams are
/// sequences of frames on the same connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DeviceToServerMessage {
    Register {
        /// Present on re-registration; a fresh id is minted otherwise.
        device_id: Option<Uuid>,
        name: String,
        hardware: HardwareProfile,
    },
    Unregister {
        device_id: Uuid,
    },
    GetDevice {
        device_id: Uuid,
    },
    ListDevices,
    Heartbeat(HeartbeatRequest),
    DownloadModel {
        model_id: Uuid,
    },
    /// Client-stream upload: metadata first, then chunks, then finish.
    BeginModelUpload {
        model_id: Uuid,
        name: String,
    },
    ModelUploadChunk {
        data: Vec<u8>,
    },
    FinishModelUpload,
    SubmitGradients(GradientUpload),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub device_id: Uuid,
    pub sequence: u64,
    pub telemetry: DeviceTelemetry,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub command: CommandKind,
    pub ack_sequence: u64,
    pub parameters: BTreeMap<String, String>,
    /// Latest training scalars, piggy-backed for the device UI.
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GradientUpload {
    pub device_id: Uuid,
    pub model_id: Uuid,
    pub round: u32,
    pub num_samples: u32,
    /// Layered float32 blob, optionally wire-compressed.
    pub gradients: Vec<u8>,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ServerToDeviceMessage {
    Registered { device: DeviceRecord },
    Unregistered { removed: bool },
    Device { device: DeviceRecord },
    DeviceList { devices: Vec<DeviceRecord> },
    Heartbeat(HeartbeatResponse),
    /// First frame of a model download.
    ModelInfo { meta: ModelMeta },
    ModelChunk { data: Vec<u8>, last: bool },
    ModelUploadAccepted { size_bytes: usize },
    GradientsAccepted { accepted: bool },
    Error { kind: ErrorKind, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn messages_round_trip_through_postcard() {
        let request = DeviceToServerMessage::Heartbeat(HeartbeatRequest {
            device_id: Uuid::new_v4(),
            sequence: 42,
            telemetry: DeviceTelemetry {
                cpu_usage: Some(0.25),
                ..Default::default()
            },
        });
        let bytes = postcard::to_stdvec(&request).unwrap();
        let back: DeviceToServerMessage = postcard::from_bytes(&bytes).unwrap();
        match back {
            DeviceToServerMessage::Heartbeat(hb) => {
                assert_eq!(hb.sequence, 42);
                assert_eq!(hb.telemetry.cpu_usage, Some(0.25));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
