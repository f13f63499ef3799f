use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OrchestraError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Stopped => "stopped",
            JobStatus::Failed => "failed",
        }
    }

    /// Terminal statuses are sticky, except for the explicit
    /// `failed -> running` retry transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Stopped | JobStatus::Failed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = OrchestraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "stopped" => Ok(JobStatus::Stopped),
            "failed" => Ok(JobStatus::Failed),
            other => Err(OrchestraError::invalid_argument(format!(
                "unknown job status {other:?}"
            ))),
        }
    }
}

/// Outcome record for one training round, appended to the job's
/// `round_metrics` after the round's aggregation persists.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    pub participants: u32,
    pub dispatched: u32,
    pub avg_loss: f64,
    pub avg_accuracy: f64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_metrics: Vec<BTreeMap<String, f64>>,
}

fn is_false(v: &bool) -> bool {
    !v
}

impl RoundRecord {
    pub fn skipped(round: u32, dispatched: u32, reason: &str) -> Self {
        RoundRecord {
            round,
            dispatched,
            skipped: true,
            reason: Some(reason.to_string()),
            ..Default::default()
        }
    }
}

/// The checkpoint payload persisted in the `round_metrics` job column.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundMetrics {
    pub rounds: Vec<RoundRecord>,
}

impl RoundMetrics {
    /// Highest round with a persisted record, 0 when none.
    pub fn last_recorded_round(&self) -> u32 {
        self.rounds.iter().map(|r| r.round).max().unwrap_or(0)
    }
}

/// A training job row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingJobRecord {
    pub id: Uuid,
    pub model_id: Option<Uuid>,
    pub status: JobStatus,
    pub num_rounds: u32,
    /// Last round whose aggregation persisted; 0 at creation.
    pub current_round: u32,
    pub min_devices: u32,
    pub learning_rate: f64,
    pub round_metrics: RoundMetrics,
    /// Free-form overrides, including the scheduler block.
    pub config: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TrainingJobRecord {
    /// Round the coordinator should execute next. `current_round` is
    /// written before a round dispatches, so a job that died mid-round has
    /// a checkpoint one ahead of its last metrics record; that round is
    /// re-run rather than skipped.
    pub fn resume_from_round(&self) -> u32 {
        if self.round_metrics.last_recorded_round() >= self.current_round {
            self.current_round + 1
        } else {
            self.current_round.max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job(current_round: u32, recorded: &[u32]) -> TrainingJobRecord {
        TrainingJobRecord {
            id: Uuid::nil(),
            model_id: None,
            status: JobStatus::Running,
            num_rounds: 10,
            current_round,
            min_devices: 1,
            learning_rate: 0.01,
            round_metrics: RoundMetrics {
                rounds: recorded
                    .iter()
                    .map(|&round| RoundRecord {
                        round,
                        ..Default::default()
                    })
                    .collect(),
            },
            config: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn fresh_job_resumes_at_round_one() {
        assert_eq!(job(0, &[]).resume_from_round(), 1);
    }

    #[test]
    fn mid_round_failure_reruns_the_checkpointed_round() {
        assert_eq!(job(5, &[1, 2, 3, 4]).resume_from_round(), 5);
    }

    #[test]
    fn completed_round_resumes_at_the_next() {
        assert_eq!(job(5, &[1, 2, 3, 4, 5]).resume_from_round(), 6);
    }

    #[test]
    fn skipped_rounds_count_as_recorded() {
        let mut j = job(3, &[1, 2]);
        j.round_metrics.rounds.push(RoundRecord::skipped(3, 2, "no_submissions"));
        assert_eq!(j.resume_from_round(), 4);
    }
}
