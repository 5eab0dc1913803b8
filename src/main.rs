use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use busboard::config::Config;
use busboard::ingest::Ingestor;
use busboard::reader::TransitReader;
use busboard::reference::ReferenceStore;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    if !config.feeds.any_configured() {
        tracing::warn!("No feed URLs configured; nothing will be ingested");
    }
    tracing::info!(prefix = %config.redis.key_prefix, "Loaded configuration");

    // Connect Redis
    let redis_client =
        redis::Client::open(config.redis.url.as_str()).expect("Invalid Redis URL");
    let redis = ConnectionManager::new(redis_client)
        .await
        .expect("Failed to connect to Redis");

    // Connect the GTFS reference database
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database.url)
        .await
        .expect("Failed to connect to Postgres");
    let reference = ReferenceStore::new(pool, config.database.schema.clone());
    if let Err(e) = reference.ping().await {
        tracing::warn!(error = %e, "Reference database not reachable yet, reads will be unenriched");
    }

    let reader = TransitReader::new(
        redis.clone(),
        reference,
        config.redis.key_prefix.clone(),
        config.ingest.vehicle_positions_staleness_secs,
        config.ingest.trip_updates_staleness_secs,
    );

    // Start the ingest loop in the background
    let ingestor = Ingestor::new(redis, &config.redis, config.feeds.clone(), config.ingest.clone())
        .expect("Failed to initialize ingestor");
    tokio::spawn(ingestor.run());

    // Periodic freshness report until the process is stopped
    let health_interval =
        std::time::Duration::from_secs(config.ingest.refresh_secs.max(15) * 4);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            _ = tokio::time::sleep(health_interval) => {
                match reader.health().await {
                    Ok(health) => tracing::info!(
                        ok = health.ok,
                        vehicle_positions_stale = health.vehicle_positions_stale,
                        "Cache health"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Health check failed"),
                }
            }
        }
    }
}
