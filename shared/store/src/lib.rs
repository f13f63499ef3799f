mod blob;
mod devices;
mod error;
mod jobs;
mod models;

pub use blob::{BlobStore, ModelMeta};
pub use devices::{DeviceRepository, NewDevice};
pub use error::StoreError;
pub use jobs::{NewTrainingJob, TrainingJobRepository};
pub use models::{ModelRepository, NewModel};

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Open the relational pool and apply the embedded migrations.
pub async fn connect_database(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}
