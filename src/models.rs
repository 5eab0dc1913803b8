//! Cache record schema and enriched read-side shapes.
//!
//! Records written to Redis carry a `v` schema version field so readers can
//! detect incompatible payloads after a deploy. Current version: 1.

use serde::{Deserialize, Serialize};

pub const RECORD_SCHEMA_VERSION: u8 = 1;

fn schema_version() -> u8 {
    RECORD_SCHEMA_VERSION
}

/// One vehicle position snapshot, stored under `{prefix}:vehicle:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    #[serde(default = "schema_version")]
    pub v: u8,
    pub vehicle_id: String,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub lat: Option<f32>,
    pub lon: Option<f32>,
    pub speed: Option<f32>,
    pub bearing: Option<f32>,
    pub label: Option<String>,
    /// Feed-reported timestamp (unix seconds), falling back to ingest time
    pub updated_at: i64,
    pub ingested_at_ms: i64,
}

/// One stop-time update, stored as a zset member under
/// `{prefix}:stop:{stop_id}:arrivals`, scored by [`ArrivalRecord::when`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalRecord {
    #[serde(default = "schema_version")]
    pub v: u8,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub stop_sequence: Option<u32>,
    pub arrival: Option<i64>,
    pub departure: Option<i64>,
    pub delay_s: Option<i32>,
}

impl ArrivalRecord {
    /// Effective event time: arrival if present, else departure.
    pub fn when(&self) -> Option<i64> {
        self.arrival.or(self.departure)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePeriod {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InformedEntity {
    pub route_id: Option<String>,
    pub stop_id: Option<String>,
    pub trip_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub cause: Option<i32>,
    pub effect: Option<i32>,
    pub active_period: Vec<ActivePeriod>,
    pub header: String,
    pub description: String,
    pub informed: Vec<InformedEntity>,
}

/// Singleton payload stored under `{prefix}:alerts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsBlob {
    /// Capture time, unix seconds
    pub as_of: i64,
    pub alerts: Vec<AlertRecord>,
}

// ---------------------------------------------------------------------------
// Enriched read-side shapes
// ---------------------------------------------------------------------------

/// An arrival joined against the reference store, with a derived ETA.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrivalItem {
    pub trip_id: Option<String>,
    pub route_id: String,
    pub stop_sequence: Option<u32>,
    pub arrival: Option<i64>,
    pub departure: Option<i64>,
    pub delay_s: Option<i32>,
    pub eta_seconds: i64,
}

/// A vehicle with its route resolved through the trip -> route join where
/// possible. `route_id` stays `None` when the join has nothing to offer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Vehicle {
    pub vehicle_id: String,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub lat: Option<f32>,
    pub lon: Option<f32>,
    pub speed: Option<f32>,
    pub bearing: Option<f32>,
    pub label: Option<String>,
    pub updated_at: i64,
    pub ingested_at_ms: i64,
}

impl Vehicle {
    pub fn from_record(record: VehicleRecord, route_id: Option<String>) -> Self {
        Self {
            route_id: route_id.or(record.route_id),
            vehicle_id: record.vehicle_id,
            trip_id: record.trip_id,
            lat: record.lat,
            lon: record.lon,
            speed: record.speed,
            bearing: record.bearing,
            label: record.label,
            updated_at: record.updated_at,
            ingested_at_ms: record.ingested_at_ms,
        }
    }
}

/// Route metadata from the reference store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteMeta {
    pub long_name: String,
    pub color: String,
}

/// One row of the active-routes summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveRoute {
    pub id: String,
    pub name: String,
    pub color: String,
    pub stops: Vec<String>,
    pub active_vehicle_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetArrival {
    pub eta_seconds: i64,
    pub route_long_name: String,
    pub route_color: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetStop {
    pub stop_id: String,
    pub stop_name: String,
    pub arrivals: Vec<WidgetArrival>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrival_when_prefers_arrival_time() {
        let record = ArrivalRecord {
            v: 1,
            trip_id: Some("t1".into()),
            route_id: None,
            stop_sequence: Some(3),
            arrival: Some(1000),
            departure: Some(1010),
            delay_s: None,
        };
        assert_eq!(record.when(), Some(1000));
    }

    #[test]
    fn arrival_when_falls_back_to_departure() {
        let record = ArrivalRecord {
            v: 1,
            trip_id: None,
            route_id: None,
            stop_sequence: None,
            arrival: None,
            departure: Some(1010),
            delay_s: None,
        };
        assert_eq!(record.when(), Some(1010));
    }

    #[test]
    fn vehicle_record_roundtrip_preserves_fields() {
        let record = VehicleRecord {
            v: RECORD_SCHEMA_VERSION,
            vehicle_id: "bus42".into(),
            trip_id: Some("t1".into()),
            route_id: None,
            lat: Some(40.5),
            lon: Some(-74.4),
            speed: None,
            bearing: Some(180.0),
            label: None,
            updated_at: 1_700_000_000,
            ingested_at_ms: 1_700_000_000_123,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: VehicleRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn schema_version_defaults_when_absent() {
        // Payloads written before versioning still deserialize
        let json = r#"{"vehicle_id":"b1","trip_id":null,"route_id":null,
            "lat":null,"lon":null,"speed":null,"bearing":null,"label":null,
            "updated_at":1,"ingested_at_ms":1000}"#;
        let record: VehicleRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.v, RECORD_SCHEMA_VERSION);
    }

    #[test]
    fn vehicle_from_record_prefers_resolved_route() {
        let record = VehicleRecord {
            v: 1,
            vehicle_id: "b1".into(),
            trip_id: Some("t1".into()),
            route_id: Some("feed_route".into()),
            lat: None,
            lon: None,
            speed: None,
            bearing: None,
            label: None,
            updated_at: 0,
            ingested_at_ms: 0,
        };
        let vehicle = Vehicle::from_record(record.clone(), Some("mapped_route".into()));
        assert_eq!(vehicle.route_id.as_deref(), Some("mapped_route"));

        let vehicle = Vehicle::from_record(record, None);
        assert_eq!(vehicle.route_id.as_deref(), Some("feed_route"));
    }
}
