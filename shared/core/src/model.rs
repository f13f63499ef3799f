use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrchestraError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    #[default]
    Initial,
    Training,
    Trained,
    Error,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Initial => "initial",
            ModelStatus::Training => "training",
            ModelStatus::Trained => "trained",
            ModelStatus::Error => "error",
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelStatus {
    type Err = OrchestraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(ModelStatus::Initial),
            "training" => Ok(ModelStatus::Training),
            "trained" => Ok(ModelStatus::Trained),
            "error" => Ok(ModelStatus::Error),
            other => Err(OrchestraError::invalid_argument(format!(
                "unknown model status {other:?}"
            ))),
        }
    }
}

/// A model row. The durable row carries only identity, version and status;
/// the weight bytes live in the blob store between rounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: Uuid,
    pub name: String,
    pub architecture: String,
    pub version: i32,
    pub status: ModelStatus,
    /// Provenance link; the chain must stay acyclic.
    pub parent_model_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
