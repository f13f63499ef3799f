use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use orchestra_core::{JobStatus, RoundMetrics, TrainingJobRecord};

use crate::error::StoreError;

const JOB_COLUMNS: &str = "id, model_id, status, num_rounds, current_round, min_devices, \
     learning_rate, round_metrics, config, created_at, updated_at, completed_at";

pub struct NewTrainingJob {
    pub model_id: Option<Uuid>,
    pub num_rounds: u32,
    pub min_devices: u32,
    pub learning_rate: f64,
    pub config: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct TrainingJobRepository {
    pool: PgPool,
}

impl TrainingJobRepository {
    pub fn new(pool: PgPool) -> Self {
        TrainingJobRepository { pool }
    }

    pub async fn create(&self, job: NewTrainingJob) -> Result<TrainingJobRecord, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO training_jobs \
             (id, model_id, status, num_rounds, min_devices, learning_rate, config) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {JOB_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(job.model_id)
        .bind(JobStatus::Pending.as_str())
        .bind(job.num_rounds as i32)
        .bind(job.min_devices as i32)
        .bind(job.learning_rate)
        .bind(job.config)
        .fetch_one(&self.pool)
        .await?;
        job_from_row(&row)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<TrainingJobRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM training_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn list_all(
        &self,
        status: Option<JobStatus>,
    ) -> Result<Vec<TrainingJobRecord>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM training_jobs WHERE status = $1 \
                     ORDER BY created_at DESC"
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM training_jobs ORDER BY created_at DESC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(job_from_row).collect()
    }

    pub async fn set_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
    ) -> Result<Option<TrainingJobRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE training_jobs SET status = $2, updated_at = $3 WHERE id = $1 \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn set_model(&self, job_id: Uuid, model_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE training_jobs SET model_id = $2, updated_at = $3 WHERE id = $1")
            .bind(job_id)
            .bind(model_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist the round checkpoint before any dispatching happens.
    pub async fn checkpoint_round(&self, job_id: Uuid, round: u32) -> Result<(), StoreError> {
        sqlx::query("UPDATE training_jobs SET current_round = $2, updated_at = $3 WHERE id = $1")
            .bind(job_id)
            .bind(round as i32)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomically overwrite the full `round_metrics` payload.
    pub async fn save_round_metrics(
        &self,
        job_id: Uuid,
        metrics: &RoundMetrics,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE training_jobs SET round_metrics = $2, updated_at = $3 WHERE id = $1")
            .bind(job_id)
            .bind(serde_json::to_value(metrics)?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn complete(
        &self,
        job_id: Uuid,
        metrics: &RoundMetrics,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE training_jobs SET status = $2, round_metrics = $3, completed_at = $4, \
             updated_at = $4 WHERE id = $1",
        )
        .bind(job_id)
        .bind(JobStatus::Completed.as_str())
        .bind(serde_json::to_value(metrics)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The `failed -> running` retry transition. Conditional on the row
    /// still being `failed`; `None` means the precondition did not hold.
    pub async fn retry(&self, job_id: Uuid) -> Result<Option<TrainingJobRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE training_jobs SET status = $3, updated_at = $4 \
             WHERE id = $1 AND status = $2 RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(JobStatus::Failed.as_str())
        .bind(JobStatus::Running.as_str())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Jobs in `pending` or `running` referencing the model; guards model
    /// deletion.
    pub async fn count_active_for_model(&self, model_id: Uuid) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM training_jobs WHERE model_id = $1 AND status IN ($2, $3)",
        )
        .bind(model_id)
        .bind(JobStatus::Pending.as_str())
        .bind(JobStatus::Running.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn delete(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM training_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn job_from_row(row: &PgRow) -> Result<TrainingJobRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let round_metrics: Option<serde_json::Value> = row.try_get("round_metrics")?;
    let round_metrics = match round_metrics {
        Some(value) => serde_json::from_value(value)?,
        None => RoundMetrics::default(),
    };
    let num_rounds: i32 = row.try_get("num_rounds")?;
    let current_round: i32 = row.try_get("current_round")?;
    let min_devices: i32 = row.try_get("min_devices")?;

    Ok(TrainingJobRecord {
        id: row.try_get("id")?,
        model_id: row.try_get("model_id")?,
        status: status
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("job status {status:?}")))?,
        num_rounds: num_rounds as u32,
        current_round: current_round as u32,
        min_devices: min_devices as u32,
        learning_rate: row.try_get("learning_rate")?,
        round_metrics,
        config: row.try_get("config")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}
