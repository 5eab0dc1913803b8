//! Background ingestion of GTFS-RT feeds into the cache.
//!
//! One ingestor replica at a time holds a TTL lock and, every refresh
//! interval, fetches each configured feed conditionally, decodes it, and
//! rewrites the cache. Feed failures are isolated: one broken feed never
//! blocks the others, and nothing in this loop is fatal to the process.

pub mod decode;
pub mod fetch;
pub mod lock;
pub mod writer;

use chrono::Utc;
use prost::Message;
use redis::aio::ConnectionManager;
use tracing::{debug, info, warn};

use crate::config::{FeedsConfig, IngestConfig, RedisConfig};
use crate::error::BusboardError;
use crate::keys::{self, FeedKind};

use fetch::{fetch_feed, FeedPollState, FetchOutcome};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct Ingestor {
    redis: ConnectionManager,
    client: reqwest::Client,
    feeds: FeedsConfig,
    config: IngestConfig,
    prefix: String,
    lock_key: String,
    token: String,
    vehicle_state: FeedPollState,
    trip_state: FeedPollState,
    alert_state: FeedPollState,
}

impl Ingestor {
    pub fn new(
        redis: ConnectionManager,
        redis_config: &RedisConfig,
        feeds: FeedsConfig,
        config: IngestConfig,
    ) -> Result<Self, BusboardError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            redis,
            client,
            feeds,
            config,
            prefix: redis_config.key_prefix.clone(),
            lock_key: keys::ingestor_lock(&redis_config.key_prefix),
            token: lock::new_token(),
            vehicle_state: FeedPollState::default(),
            trip_state: FeedPollState::default(),
            alert_state: FeedPollState::default(),
        })
    }

    /// Run the poll loop forever. Terminates only when the surrounding task
    /// is dropped (process shutdown).
    pub async fn run(mut self) {
        info!(
            refresh_secs = self.config.refresh_secs,
            lock_ttl_secs = self.config.lock_ttl_secs,
            "Starting ingest loop"
        );
        let refresh = std::time::Duration::from_secs(self.config.refresh_secs);

        loop {
            if !self.try_lock().await {
                debug!("Another ingestor holds the lock, skipping cycle");
                tokio::time::sleep(refresh).await;
                continue;
            }

            // Renew immediately so a slow cycle starts with a full TTL
            self.renew_lock().await;
            self.poll_all_feeds().await;
            self.renew_lock().await;

            tokio::time::sleep(refresh).await;
        }
    }

    async fn try_lock(&mut self) -> bool {
        match lock::acquire(
            &mut self.redis,
            &self.lock_key,
            self.config.lock_ttl_secs,
            &self.token,
        )
        .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(error = %e, "Lock acquisition failed, skipping cycle");
                false
            }
        }
    }

    async fn renew_lock(&mut self) {
        if let Err(e) = lock::renew(
            &mut self.redis,
            &self.lock_key,
            self.config.lock_ttl_secs,
            &self.token,
        )
        .await
        {
            warn!(error = %e, "Lock renewal failed");
        }
    }

    /// Fetch and process each configured feed, isolating failures per feed.
    async fn poll_all_feeds(&mut self) {
        if let Some(url) = self.feeds.vehicle_positions_url.clone() {
            if let Some(blob) = self.fetch(&url, FeedKind::VehiclePositions).await {
                if let Err(e) = self.process_vehicle_positions(&blob).await {
                    warn!(error = %e, "Vehicle positions processing failed");
                }
            }
        }

        if let Some(url) = self.feeds.trip_updates_url.clone() {
            if let Some(blob) = self.fetch(&url, FeedKind::TripUpdates).await {
                if let Err(e) = self.process_trip_updates(&blob).await {
                    warn!(error = %e, "Trip updates processing failed");
                }
            }
        }

        if let Some(url) = self.feeds.alerts_url.clone() {
            if let Some(blob) = self.fetch(&url, FeedKind::Alerts).await {
                if let Err(e) = self.process_alerts(&blob).await {
                    warn!(error = %e, "Alerts processing failed");
                }
            }
        }
    }

    async fn fetch(&mut self, url: &str, kind: FeedKind) -> Option<Vec<u8>> {
        let timeout = std::time::Duration::from_secs(self.config.request_timeout_secs);
        let state = match kind {
            FeedKind::VehiclePositions => &mut self.vehicle_state,
            FeedKind::TripUpdates => &mut self.trip_state,
            FeedKind::Alerts => &mut self.alert_state,
        };
        match fetch_feed(&self.client, url, state, timeout).await {
            FetchOutcome::Fetched(blob) => Some(blob),
            FetchOutcome::NotModified | FetchOutcome::Failed => None,
        }
    }

    async fn process_vehicle_positions(&mut self, blob: &[u8]) -> Result<(), BusboardError> {
        let raw_ttl = self.config.refresh_secs * 4;
        writer::write_raw(
            &mut self.redis,
            &self.prefix,
            FeedKind::VehiclePositions,
            blob,
            raw_ttl,
        )
        .await?;

        let feed = gtfs_realtime::FeedMessage::decode(blob)?;
        let batch = decode::decode_vehicle_positions(&feed, now_ms());
        writer::write_vehicles(&mut self.redis, &self.prefix, &batch).await
    }

    async fn process_trip_updates(&mut self, blob: &[u8]) -> Result<(), BusboardError> {
        let raw_ttl = self.config.refresh_secs * 4;
        writer::write_raw(
            &mut self.redis,
            &self.prefix,
            FeedKind::TripUpdates,
            blob,
            raw_ttl,
        )
        .await?;

        let feed = gtfs_realtime::FeedMessage::decode(blob)?;
        let per_stop = decode::decode_trip_updates(&feed);
        writer::write_arrivals(&mut self.redis, &self.prefix, &per_stop).await
    }

    async fn process_alerts(&mut self, blob: &[u8]) -> Result<(), BusboardError> {
        // Alerts change rarely; keep the raw snapshot around longer
        let raw_ttl = self.config.refresh_secs * 8;
        writer::write_raw(&mut self.redis, &self.prefix, FeedKind::Alerts, blob, raw_ttl).await?;

        let feed = gtfs_realtime::FeedMessage::decode(blob)?;
        let alerts = decode::decode_alerts(&feed);
        writer::write_alerts(&mut self.redis, &self.prefix, alerts, now_ms() / 1000).await
    }
}
