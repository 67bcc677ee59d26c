use cadence::{bot, config::AppConfig, db};
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging first
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Cadence v{}", env!("CARGO_PKG_VERSION"));

    // Fatal configuration errors exit non-zero before any loop starts
    let config = match AppConfig::init() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration invalid: {}", e);
            error!("Set values in config/default.toml or CADENCE_* env vars");
            return Err(anyhow::anyhow!("Configuration invalid: {e}"));
        }
    };
    info!("Configuration loaded");

    tokio::fs::create_dir_all(&config.work_dir).await?;
    tokio::fs::create_dir_all(config.cache_dir()).await?;
    tokio::fs::create_dir_all(config.tmp_dir()).await?;

    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    info!("Database connected: {}", config.database.url);

    db::init_db(&pool).await?;

    info!("Starting Discord bot...");
    match bot::start_bot(config, pool).await {
        Ok(()) => info!("Discord bot shut down gracefully"),
        Err(e) => {
            error!("Discord bot error: {}", e);
            return Err(anyhow::anyhow!("{}", e));
        }
    }

    Ok(())
}
