mod api;
mod app;
mod config;
mod rpc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use app::App;
use config::{LogOutput, ServerSettings};

fn init_logging(settings: &ServerSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    match settings.log_format {
        LogOutput::Console => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogOutput::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = ServerSettings::parse();
    init_logging(&settings);
    App::new(settings).await?.run().await
}
