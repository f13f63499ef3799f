use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use orchestra_core::{ModelRecord, ModelStatus};

use crate::error::StoreError;

const MODEL_COLUMNS: &str =
    "id, name, architecture, version, status, parent_model_id, created_at, updated_at";

pub struct NewModel {
    pub name: String,
    pub architecture: String,
    pub parent_model_id: Option<Uuid>,
}

#[derive(Clone)]
pub struct ModelRepository {
    pool: PgPool,
}

impl ModelRepository {
    pub fn new(pool: PgPool) -> Self {
        ModelRepository { pool }
    }

    pub async fn create(&self, model: NewModel) -> Result<ModelRecord, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO models (id, name, architecture, status, parent_model_id) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {MODEL_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&model.name)
        .bind(&model.architecture)
        .bind(ModelStatus::Initial.as_str())
        .bind(model.parent_model_id)
        .fetch_one(&self.pool)
        .await?;
        model_from_row(&row)
    }

    pub async fn get(&self, model_id: Uuid) -> Result<Option<ModelRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {MODEL_COLUMNS} FROM models WHERE id = $1"))
            .bind(model_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(model_from_row).transpose()
    }

    pub async fn list_all(
        &self,
        status: Option<ModelStatus>,
    ) -> Result<Vec<ModelRecord>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {MODEL_COLUMNS} FROM models WHERE status = $1 \
                     ORDER BY created_at DESC"
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {MODEL_COLUMNS} FROM models ORDER BY created_at DESC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(model_from_row).collect()
    }

    pub async fn set_status(
        &self,
        model_id: Uuid,
        status: ModelStatus,
    ) -> Result<Option<ModelRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE models SET status = $2, updated_at = $3 WHERE id = $1 \
             RETURNING {MODEL_COLUMNS}"
        ))
        .bind(model_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(model_from_row).transpose()
    }

    /// Bump the version to the round whose aggregation just persisted.
    pub async fn set_version(&self, model_id: Uuid, version: i32) -> Result<(), StoreError> {
        sqlx::query("UPDATE models SET version = $2, updated_at = $3 WHERE id = $1")
            .bind(model_id)
            .bind(version)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete(&self, model_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM models WHERE id = $1")
            .bind(model_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn model_from_row(row: &PgRow) -> Result<ModelRecord, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(ModelRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        architecture: row.try_get("architecture")?,
        version: row.try_get("version")?,
        status: status
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("model status {status:?}")))?,
        parent_model_id: row.try_get("parent_model_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
