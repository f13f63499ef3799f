use std::collections::BTreeMap;

use chrono::Utc;
use data_encoding::BASE64;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use orchestra_core::{DeviceCommand, GradientSubmission};

use crate::error::StoreError;

/// Metadata record stored next to the global model blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub model_id: String,
    pub name: String,
    pub version: u32,
    pub framework: String,
    pub size_bytes: usize,
}

/// The shared blob/key-value bus. All cross-task coordination state lives
/// under this keyspace:
///
/// | key | value |
/// |---|---|
/// | `model:<model_id>:global` | base64 of the model blob |
/// | `model:<model_id>:meta` | JSON [`ModelMeta`] |
/// | `gradients:<model_id>:<round>` | list of JSON submission envelopes |
/// | `training:<job_id>:stop` | `"1"` |
/// | `training:latest_metrics` | JSON scalars |
/// | `heartbeat:<device_id>` | timestamp, with TTL |
/// | `command:<device_id>` | FIFO list of JSON commands |
#[derive(Clone)]
pub struct BlobStore {
    conn: ConnectionManager,
}

fn model_global_key(model_id: Uuid) -> String {
    format!("model:{model_id}:global")
}

fn model_meta_key(model_id: Uuid) -> String {
    format!("model:{model_id}:meta")
}

fn gradients_key(model_id: Uuid, round: u32) -> String {
    format!("gradients:{model_id}:{round}")
}

fn stop_key(job_id: Uuid) -> String {
    format!("training:{job_id}:stop")
}

fn heartbeat_key(device_id: Uuid) -> String {
    format!("heartbeat:{device_id}")
}

fn command_key(device_id: Uuid) -> String {
    format!("command:{device_id}")
}

const LATEST_METRICS_KEY: &str = "training:latest_metrics";

impl BlobStore {
    pub async fn connect(cache_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(cache_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(BlobStore { conn })
    }

    // model blobs

    pub async fn set_model_blob(&self, model_id: Uuid, blob: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let () = conn
            .set(model_global_key(model_id), BASE64.encode(blob))
            .await?;
        Ok(())
    }

    pub async fn model_blob(&self, model_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let encoded: Option<String> = conn.get(model_global_key(model_id)).await?;
        encoded
            .map(|s| {
                BASE64
                    .decode(s.as_bytes())
                    .map_err(|e| StoreError::Corrupt(format!("model blob base64: {e}")))
            })
            .transpose()
    }

    pub async fn set_model_meta(&self, model_id: Uuid, meta: &ModelMeta) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let () = conn
            .set(model_meta_key(model_id), serde_json::to_string(meta)?)
            .await?;
        Ok(())
    }

    pub async fn model_meta(&self, model_id: Uuid) -> Result<Option<ModelMeta>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(model_meta_key(model_id)).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(StoreError::Json))
            .transpose()
    }

    pub async fn delete_model_blob(&self, model_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let () = conn
            .del(vec![model_global_key(model_id), model_meta_key(model_id)])
            .await?;
        Ok(())
    }

    // gradient buckets

    pub async fn push_gradient_submission(
        &self,
        model_id: Uuid,
        round: u32,
        submission: &GradientSubmission,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let () = conn
            .rpush(gradients_key(model_id, round), serde_json::to_string(submission)?)
            .await?;
        Ok(())
    }

    pub async fn gradient_count(&self, model_id: Uuid, round: u32) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(gradients_key(model_id, round)).await?)
    }

    /// All submissions in FIFO order. Entries that fail to parse are
    /// dropped with a warning; validation of parsed entries is the
    /// coordinator's job.
    pub async fn gradient_submissions(
        &self,
        model_id: Uuid,
        round: u32,
    ) -> Result<Vec<GradientSubmission>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(gradients_key(model_id, round), 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(submission) => Some(submission),
                Err(err) => {
                    warn!(%model_id, round, "dropping unparseable gradient envelope: {err}");
                    None
                }
            })
            .collect())
    }

    pub async fn clear_gradients(&self, model_id: Uuid, round: u32) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let () = conn.del(gradients_key(model_id, round)).await?;
        Ok(())
    }

    /// Remove every per-round bucket for the model, used on job teardown.
    pub async fn clear_all_gradients(
        &self,
        model_id: Uuid,
        num_rounds: u32,
    ) -> Result<(), StoreError> {
        let keys: Vec<String> = (1..=num_rounds)
            .map(|round| gradients_key(model_id, round))
            .collect();
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let () = conn.del(keys).await?;
        Ok(())
    }

    // stop flags

    pub async fn request_stop(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let () = conn.set(stop_key(job_id), "1").await?;
        Ok(())
    }

    pub async fn stop_requested(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(stop_key(job_id)).await?)
    }

    pub async fn clear_stop(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let () = conn.del(stop_key(job_id)).await?;
        Ok(())
    }

    // training metrics

    pub async fn publish_latest_metrics(
        &self,
        scalars: &BTreeMap<String, f64>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let () = conn
            .set(LATEST_METRICS_KEY, serde_json::to_string(scalars)?)
            .await?;
        Ok(())
    }

    pub async fn latest_metrics(&self) -> Result<Option<BTreeMap<String, f64>>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(LATEST_METRICS_KEY).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(StoreError::Json))
            .transpose()
    }

    // heartbeat liveness

    pub async fn mark_heartbeat(
        &self,
        device_id: Uuid,
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let () = conn
            .set_ex(heartbeat_key(device_id), Utc::now().to_rfc3339(), ttl_seconds)
            .await?;
        Ok(())
    }

    pub async fn heartbeat_alive(&self, device_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(heartbeat_key(device_id)).await?)
    }

    // command queues

    pub async fn queue_command(
        &self,
        device_id: Uuid,
        command: &DeviceCommand,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let () = conn
            .rpush(command_key(device_id), serde_json::to_string(command)?)
            .await?;
        Ok(())
    }

    pub async fn pop_pending_command(
        &self,
        device_id: Uuid,
    ) -> Result<Option<DeviceCommand>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.lpop(command_key(device_id), None).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(StoreError::Json))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn keyspace_layout_is_stable() {
        let model = Uuid::nil();
        assert_eq!(
            model_global_key(model),
            "model:00000000-0000-0000-0000-000000000000:global"
        );
        assert_eq!(
            gradients_key(model, 3),
            "gradients:00000000-0000-0000-0000-000000000000:3"
        );
        assert_eq!(
            stop_key(model),
            "training:00000000-0000-0000-0000-000000000000:stop"
        );
        assert_eq!(
            heartbeat_key(model),
            "heartbeat:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            command_key(model),
            "command:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn model_meta_round_trips() {
        let meta = ModelMeta {
            model_id: Uuid::nil().to_string(),
            name: "fedavg-demo".to_string(),
            version: 4,
            framework: "orchestra".to_string(),
            size_bytes: 1024,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(serde_json::from_str::<ModelMeta>(&json).unwrap(), meta);
    }
}
