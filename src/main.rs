use tracing_subscriber::EnvFilter;

use companion_core::api;
use companion_core::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,companion_core=debug")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!(
        "Starting companion-core v{} (data dir: {})",
        env!("CARGO_PKG_VERSION"),
        config.data_dir.display()
    );

    api::serve(config).await
}
