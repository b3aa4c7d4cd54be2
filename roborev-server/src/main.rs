use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let data_dir = roborev_core::paths::data_dir();
    info!(data_dir = %data_dir.display(), "starting roborev daemon");
    roborev_server::daemon::run(data_dir).await
}
