//! Cache writer: full-replace, TTL-bounded writes.
//!
//! Grouped keys (global id set, per-route sets, per-stop arrival zsets) are
//! deleted and recreated inside one pipeline per feed, so a cycle never
//! accumulates entries from the previous one. Writes across keys are not
//! transactional; readers may observe a partially applied cycle for one
//! refresh interval, which the per-key TTLs bound.

use std::collections::BTreeMap;

use redis::aio::ConnectionManager;
use tracing::info;

use crate::error::BusboardError;
use crate::keys::{self, FeedKind};
use crate::models::{AlertRecord, AlertsBlob, ArrivalRecord};

use super::decode::VehicleBatch;

pub const VEHICLE_DOC_TTL_SECS: u64 = 120;
pub const VEHICLE_SET_TTL_SECS: u64 = 60;
pub const ARRIVALS_TTL_SECS: u64 = 90;
pub const ALERTS_TTL_SECS: u64 = 300;

/// Persist the untouched feed bytes for debugging/replay.
pub async fn write_raw(
    conn: &mut ConnectionManager,
    prefix: &str,
    kind: FeedKind,
    blob: &[u8],
    ttl_secs: u64,
) -> Result<(), BusboardError> {
    let key = keys::raw_feed(prefix, kind);
    let mut pipe = redis::pipe();
    pipe.set(&key, blob).ignore();
    pipe.expire(&key, ttl_secs as i64).ignore();
    let _: () = pipe.query_async(conn).await?;
    Ok(())
}

pub async fn write_vehicles(
    conn: &mut ConnectionManager,
    prefix: &str,
    batch: &VehicleBatch,
) -> Result<(), BusboardError> {
    let mut pipe = redis::pipe();

    for record in &batch.records {
        let key = keys::vehicle(prefix, &record.vehicle_id);
        let payload = serde_json::to_string(record)?;
        pipe.set(&key, payload).ignore();
        pipe.expire(&key, VEHICLE_DOC_TTL_SECS as i64).ignore();
    }

    let all_key = keys::vehicles_all(prefix);
    let all_ids = batch.vehicle_ids();
    pipe.del(&all_key).ignore();
    if !all_ids.is_empty() {
        pipe.sadd(&all_key, &all_ids).ignore();
    }
    pipe.expire(&all_key, VEHICLE_SET_TTL_SECS as i64).ignore();

    for (route_id, vehicle_ids) in &batch.by_route {
        let key = keys::route_vehicles(prefix, route_id);
        pipe.del(&key).ignore();
        if !vehicle_ids.is_empty() {
            pipe.sadd(&key, vehicle_ids).ignore();
        }
        pipe.expire(&key, VEHICLE_SET_TTL_SECS as i64).ignore();
    }

    let _: () = pipe.query_async(conn).await?;
    info!(
        vehicles = batch.records.len(),
        routes = batch.by_route.len(),
        "Wrote vehicle positions"
    );
    Ok(())
}

pub async fn write_arrivals(
    conn: &mut ConnectionManager,
    prefix: &str,
    per_stop: &BTreeMap<String, Vec<ArrivalRecord>>,
) -> Result<(), BusboardError> {
    let mut pipe = redis::pipe();

    for (stop_id, records) in per_stop {
        let key = keys::stop_arrivals(prefix, stop_id);
        pipe.del(&key).ignore();

        let mut zadd = redis::cmd("ZADD");
        zadd.arg(&key);
        let mut members = 0usize;
        for record in records {
            let Some(when) = record.when() else {
                continue;
            };
            zadd.arg(when).arg(serde_json::to_string(record)?);
            members += 1;
        }
        if members > 0 {
            pipe.add_command(zadd).ignore();
        }
        pipe.expire(&key, ARRIVALS_TTL_SECS as i64).ignore();
    }

    let _: () = pipe.query_async(conn).await?;
    info!(stops = per_stop.len(), "Wrote stop arrivals");
    Ok(())
}

pub async fn write_alerts(
    conn: &mut ConnectionManager,
    prefix: &str,
    alerts: Vec<AlertRecord>,
    as_of: i64,
) -> Result<(), BusboardError> {
    let count = alerts.len();
    let blob = AlertsBlob { as_of, alerts };
    let key = keys::alerts(prefix);
    let payload = serde_json::to_string(&blob)?;

    let mut pipe = redis::pipe();
    pipe.set(&key, payload).ignore();
    pipe.expire(&key, ALERTS_TTL_SECS as i64).ignore();
    let _: () = pipe.query_async(conn).await?;
    info!(count, "Wrote alerts");
    Ok(())
}
