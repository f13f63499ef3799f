use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use data_encoding::BASE64;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use orchestra_core::{CommandKind, GradientSubmission, OrchestraError};
use orchestra_modeling::decompress_gradients;
use orchestra_store::{ModelMeta, NewDevice};

use crate::app::AppContext;
use crate::rpc::protocol::{
    DOWNLOAD_CHUNK_SIZE, DeviceToServerMessage, GradientUpload, HeartbeatRequest,
    HeartbeatResponse, ServerToDeviceMessage,
};

const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;
const MODEL_FRAMEWORK: &str = "orchestra";

struct PendingUpload {
    model_id: Uuid,
    name: String,
    data: Vec<u8>,
}

/// One task per device connection. Requests are answered in arrival
/// order, which gives the heartbeat stream its one-for-one ordering.
pub(super) async fn handle_connection<S>(
    ctx: Arc<AppContext>,
    stream: S,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec();
    let mut framed = Framed::new(stream, codec);
    let mut upload: Option<PendingUpload> = None;

    debug!(%peer, "device connection opened");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = framed.next() => {
                let Some(frame) = frame else {
                    debug!(%peer, "device connection closed");
                    return Ok(());
                };
                let bytes = frame?;
                let request_id = request_id();

                let message: DeviceToServerMessage = match postcard::from_bytes(&bytes) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(%peer, %request_id, "unparseable frame: {err}");
                        send(
                            &mut framed,
                            &ServerToDeviceMessage::Error {
                                kind: orchestra_core::ErrorKind::InvalidArgument,
                                message: "malformed frame".to_string(),
                            },
                        )
                        .await?;
                        continue;
                    }
                };

                if let Err(err) = handle_message(&ctx, &mut framed, &mut upload, message).await {
                    warn!(%peer, %request_id, "rpc request failed: {err}");
                    send(
                        &mut framed,
                        &ServerToDeviceMessage::Error {
                            kind: err.kind(),
                            message: public_message(&err),
                        },
                    )
                    .await?;
                }
            }
        }
    }
}

fn request_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Unexpected errors surface as a bare `internal error`; details stay in
/// the server log.
fn public_message(err: &OrchestraError) -> String {
    match err {
        OrchestraError::Internal(_) => "internal error".to_string(),
        other => other.to_string(),
    }
}

async fn send<S>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
    message: &ServerToDeviceMessage,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = postcard::to_stdvec(message)?;
    framed.send(Bytes::from(bytes)).await?;
    Ok(())
}

async fn handle_message<S>(
    ctx: &AppContext,
    framed: &mut Framed<S, LengthDelimitedCodec>,
    upload: &mut Option<PendingUpload>,
    message: DeviceToServerMessage,
) -> Result<(), OrchestraError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match message {
        DeviceToServerMessage::Register {
            device_id,
            name,
            hardware,
        } => {
            if name.trim().is_empty() {
                return Err(OrchestraError::invalid_argument("device name must not be empty"));
            }
            let device = ctx
                .devices
                .create(NewDevice {
                    id: device_id,
                    name,
                    hardware,
                })
                .await?;
            info!(device_id = %device.id, name = %device.name, "device registered");
            send_rpc(framed, &ServerToDeviceMessage::Registered { device }).await
        }

        DeviceToServerMessage::Unregister { device_id } => {
            let removed = ctx.devices.delete(device_id).await?;
            if removed {
                info!(device_id = %device_id, "device unregistered");
            }
            send_rpc(framed, &ServerToDeviceMessage::Unregistered { removed }).await
        }

        DeviceToServerMessage::GetDevice { device_id } => {
            let device = ctx
                .devices
                .get(device_id)
                .await?
                .ok_or_else(|| OrchestraError::not_found(format!("device {device_id}")))?;
            send_rpc(framed, &ServerToDeviceMessage::Device { device }).await
        }

        DeviceToServerMessage::ListDevices => {
            let devices = ctx.devices.list_all(None).await?;
            send_rpc(framed, &ServerToDeviceMessage::DeviceList { devices }).await
        }

        DeviceToServerMessage::Heartbeat(request) => handle_heartbeat(ctx, framed, request).await,

        DeviceToServerMessage::DownloadModel { model_id } => {
            handle_download(ctx, framed, model_id).await
        }

        DeviceToServerMessage::BeginModelUpload { model_id, name } => {
            if upload.is_some() {
                return Err(OrchestraError::failed_precondition(
                    "model upload already in progress on this connection",
                ));
            }
            *upload = Some(PendingUpload {
                model_id,
                name,
                data: Vec::new(),
            });
            Ok(())
        }

        DeviceToServerMessage::ModelUploadChunk { data } => {
            let pending = upload.as_mut().ok_or_else(|| {
                OrchestraError::failed_precondition("upload chunk before metadata")
            })?;
            pending.data.extend_from_slice(&data);
            Ok(())
        }

        DeviceToServerMessage::FinishModelUpload => {
            let pending = upload.take().ok_or_else(|| {
                OrchestraError::failed_precondition("no model upload in progress")
            })?;
            if pending.data.is_empty() {
                return Err(OrchestraError::invalid_argument("empty model upload"));
            }

            let version = ctx
                .blob
                .model_meta(pending.model_id)
                .await?
                .map(|meta| meta.version)
                .unwrap_or(0);
            ctx.blob.set_model_blob(pending.model_id, &pending.data).await?;
            ctx.blob
                .set_model_meta(
                    pending.model_id,
                    &ModelMeta {
                        model_id: pending.model_id.to_string(),
                        name: pending.name,
                        version,
                        framework: MODEL_FRAMEWORK.to_string(),
                        size_bytes: pending.data.len(),
                    },
                )
                .await?;
            info!(
                model_id = %pending.model_id,
                size_bytes = pending.data.len(),
                "model uploaded"
            );
            send_rpc(
                framed,
                &ServerToDeviceMessage::ModelUploadAccepted {
                    size_bytes: pending.data.len(),
                },
            )
            .await
        }

        DeviceToServerMessage::SubmitGradients(request) => {
            handle_submit_gradients(ctx, framed, request).await
        }
    }
}

async fn handle_heartbeat<S>(
    ctx: &AppContext,
    framed: &mut Framed<S, LengthDelimitedCodec>,
    request: HeartbeatRequest,
) -> Result<(), OrchestraError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    ctx.heartbeat
        .process_heartbeat(request.device_id, &request.telemetry)
        .await?;
    let command = ctx.heartbeat.pop_pending_command(request.device_id).await?;

    let mut metadata = BTreeMap::new();
    if let Some(scalars) = ctx.blob.latest_metrics().await? {
        for key in ["server_accuracy", "server_loss"] {
            if let Some(value) = scalars.get(key) {
                metadata.insert(key.to_string(), value.to_string());
            }
        }
    }

    let response = match command {
        Some(command) => HeartbeatResponse {
            command: command.kind,
            ack_sequence: request.sequence,
            parameters: command.parameters,
            metadata,
        },
        None => HeartbeatResponse {
            command: CommandKind::Ack,
            ack_sequence: request.sequence,
            parameters: BTreeMap::new(),
            metadata,
        },
    };
    send_rpc(framed, &ServerToDeviceMessage::Heartbeat(response)).await
}

async fn handle_download<S>(
    ctx: &AppContext,
    framed: &mut Framed<S, LengthDelimitedCodec>,
    model_id: Uuid,
) -> Result<(), OrchestraError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let meta = ctx
        .blob
        .model_meta(model_id)
        .await?
        .ok_or_else(|| OrchestraError::not_found(format!("model {model_id}")))?;
    let blob = ctx
        .blob
        .model_blob(model_id)
        .await?
        .ok_or_else(|| OrchestraError::not_found(format!("model {model_id} blob")))?;

    send_rpc(framed, &ServerToDeviceMessage::ModelInfo { meta }).await?;

    if blob.is_empty() {
        return send_rpc(
            framed,
            &ServerToDeviceMessage::ModelChunk {
                data: Vec::new(),
                last: true,
            },
        )
        .await;
    }
    let chunk_count = blob.len().div_ceil(DOWNLOAD_CHUNK_SIZE);
    for (index, chunk) in blob.chunks(DOWNLOAD_CHUNK_SIZE).enumerate() {
        send_rpc(
            framed,
            &ServerToDeviceMessage::ModelChunk {
                data: chunk.to_vec(),
                last: index + 1 == chunk_count,
            },
        )
        .await?;
    }
    debug!(model_id = %model_id, size_bytes = blob.len(), "model download streamed");
    Ok(())
}

async fn handle_submit_gradients<S>(
    ctx: &AppContext,
    framed: &mut Framed<S, LengthDelimitedCodec>,
    request: GradientUpload,
) -> Result<(), OrchestraError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if request.round == 0 {
        return Err(OrchestraError::invalid_argument("round must be >= 1"));
    }
    if request.num_samples == 0 {
        return Err(OrchestraError::invalid_argument("num_samples must be positive"));
    }
    if request.gradients.len() < 4 {
        return Err(OrchestraError::invalid_argument(
            "gradient payload below format minimum",
        ));
    }

    let raw = decompress_gradients(&request.gradients)
        .map_err(|err| OrchestraError::invalid_argument(format!("gradient payload invalid: {err}")))?;

    let submission = GradientSubmission {
        device_id: request.device_id.to_string(),
        gradients: BASE64.encode(&raw),
        num_samples: request.num_samples,
        metrics: request.metrics,
    };
    ctx.blob
        .push_gradient_submission(request.model_id, request.round, &submission)
        .await?;

    info!(
        device_id = %request.device_id,
        model_id = %request.model_id,
        round = request.round,
        num_samples = request.num_samples,
        "gradient submission accepted"
    );
    send_rpc(framed, &ServerToDeviceMessage::GradientsAccepted { accepted: true }).await
}

async fn send_rpc<S>(
    framed: &mut Framed<S, LengthDelimitedCodec>,
    message: &ServerToDeviceMessage,
) -> Result<(), OrchestraError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send(framed, message)
        .await
        .map_err(|err| OrchestraError::Unavailable(format!("connection write failed: {err}")))
}
