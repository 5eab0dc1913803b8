//! GTFS-RT feed decoders.
//!
//! Each decoder walks the feed entity list and produces typed cache records,
//! skipping malformed or under-specified entities individually. A bad entity
//! never fails the whole feed.

use std::collections::{BTreeMap, HashMap};

use gtfs_realtime::FeedMessage;
use tracing::debug;

use crate::models::{ActivePeriod, AlertRecord, ArrivalRecord, InformedEntity, VehicleRecord,
    RECORD_SCHEMA_VERSION};

/// Decoded vehicle positions for one cycle.
#[derive(Debug, Default)]
pub struct VehicleBatch {
    pub records: Vec<VehicleRecord>,
    /// Vehicle ids grouped by feed-supplied route id. Routes are never
    /// inferred; an entity without a route id lands only in `records`.
    pub by_route: HashMap<String, Vec<String>>,
}

impl VehicleBatch {
    pub fn vehicle_ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.vehicle_id.clone()).collect()
    }
}

/// Trim and drop empty strings; GTFS-RT feeds routinely send "".
fn normalize(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn normalize_opt(value: Option<&str>) -> Option<String> {
    value.and_then(normalize)
}

pub fn decode_vehicle_positions(feed: &FeedMessage, now_ms: i64) -> VehicleBatch {
    let mut batch = VehicleBatch::default();
    let mut total = 0usize;

    for entity in &feed.entity {
        let Some(vehicle) = &entity.vehicle else {
            continue;
        };
        total += 1;

        // Descriptor id first, entity id as fallback
        let descriptor_id = vehicle.vehicle.as_ref().and_then(|d| d.id.as_deref());
        let Some(vehicle_id) =
            normalize_opt(descriptor_id).or_else(|| normalize(&entity.id))
        else {
            continue;
        };

        let trip_id = vehicle
            .trip
            .as_ref()
            .and_then(|t| normalize_opt(t.trip_id.as_deref()));
        let route_id = vehicle
            .trip
            .as_ref()
            .and_then(|t| normalize_opt(t.route_id.as_deref()));
        let label = vehicle
            .vehicle
            .as_ref()
            .and_then(|d| normalize_opt(d.label.as_deref()));

        let position = vehicle.position.as_ref();
        let record = VehicleRecord {
            v: RECORD_SCHEMA_VERSION,
            vehicle_id: vehicle_id.clone(),
            trip_id,
            route_id: route_id.clone(),
            lat: position.map(|p| p.latitude),
            lon: position.map(|p| p.longitude),
            speed: position.and_then(|p| p.speed),
            bearing: position.and_then(|p| p.bearing),
            label,
            updated_at: vehicle
                .timestamp
                .map(|ts| ts as i64)
                .unwrap_or(now_ms / 1000),
            ingested_at_ms: now_ms,
        };
        batch.records.push(record);

        if let Some(route_id) = route_id {
            batch.by_route.entry(route_id).or_default().push(vehicle_id);
        }
    }

    debug!(
        total,
        kept = batch.records.len(),
        routes = batch.by_route.len(),
        "Decoded vehicle positions"
    );
    batch
}

pub fn decode_trip_updates(feed: &FeedMessage) -> BTreeMap<String, Vec<ArrivalRecord>> {
    let mut per_stop: BTreeMap<String, Vec<ArrivalRecord>> = BTreeMap::new();
    let mut skipped = 0usize;

    for entity in &feed.entity {
        let Some(trip_update) = &entity.trip_update else {
            continue;
        };
        let trip_id = normalize_opt(trip_update.trip.trip_id.as_deref());
        let route_id = normalize_opt(trip_update.trip.route_id.as_deref());

        for stu in &trip_update.stop_time_update {
            let stop_id = normalize_opt(stu.stop_id.as_deref());
            let arrival = stu.arrival.as_ref().and_then(|e| e.time);
            let departure = stu.departure.as_ref().and_then(|e| e.time);

            // No addressable stop or no usable time: nothing to cache
            let (Some(stop_id), true) = (stop_id, arrival.or(departure).is_some()) else {
                skipped += 1;
                continue;
            };

            let delay_s = stu
                .arrival
                .as_ref()
                .and_then(|e| e.delay)
                .or_else(|| stu.departure.as_ref().and_then(|e| e.delay));

            per_stop.entry(stop_id).or_default().push(ArrivalRecord {
                v: RECORD_SCHEMA_VERSION,
                trip_id: trip_id.clone(),
                route_id: route_id.clone(),
                stop_sequence: stu.stop_sequence,
                arrival,
                departure,
                delay_s,
            });
        }
    }

    // Stable ascending order by effective time within each stop
    for records in per_stop.values_mut() {
        records.sort_by_key(|r| r.when());
    }

    debug!(
        stops = per_stop.len(),
        skipped, "Decoded trip updates"
    );
    per_stop
}

pub fn decode_alerts(feed: &FeedMessage) -> Vec<AlertRecord> {
    let mut alerts = Vec::new();

    for entity in &feed.entity {
        let Some(alert) = &entity.alert else {
            continue;
        };

        let informed = alert
            .informed_entity
            .iter()
            .map(|ie| InformedEntity {
                route_id: normalize_opt(ie.route_id.as_deref()),
                stop_id: normalize_opt(ie.stop_id.as_deref()),
                trip_id: ie
                    .trip
                    .as_ref()
                    .and_then(|t| normalize_opt(t.trip_id.as_deref())),
            })
            .collect();

        alerts.push(AlertRecord {
            id: entity.id.clone(),
            cause: alert.cause,
            effect: alert.effect,
            active_period: alert
                .active_period
                .iter()
                .map(|p| ActivePeriod {
                    start: p.start,
                    end: p.end,
                })
                .collect(),
            header: join_translations(alert.header_text.as_ref()),
            description: join_translations(alert.description_text.as_ref()),
            informed,
        });
    }

    debug!(count = alerts.len(), "Decoded alerts");
    alerts
}

/// Concatenate all translations of a text field, space-separated.
fn join_translations(text: Option<&gtfs_realtime::TranslatedString>) -> String {
    let Some(text) = text else {
        return String::new();
    };
    text.translation
        .iter()
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}
