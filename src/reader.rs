//! Cache read path: joins live Redis records against the reference store.
//!
//! Redis is the source of truth for live data, so Redis failures surface as
//! errors. The reference store only enriches; when a lookup fails the reader
//! logs it and serves what the cache alone can answer.

use std::collections::{BTreeMap, HashMap, HashSet};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::BusboardError;
use crate::keys::{self, FeedKind};
use crate::models::{
    ActiveRoute, AlertsBlob, ArrivalItem, ArrivalRecord, RouteMeta, Vehicle, VehicleRecord,
    WidgetArrival, WidgetStop,
};
use crate::reference::{sanitize_color, ReferenceStore, DEFAULT_ROUTE_COLOR};

/// How far back arrivals remain visible, so a bus at the platform does not
/// vanish from the board the second its scheduled time passes.
pub const ARRIVAL_LOOKBACK_SECS: i64 = 3600;

const STALE_TTL_FRACTION: i64 = 4;

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Score window for arrival zset queries.
fn arrival_window(now: i64, horizon_secs: i64) -> (i64, i64) {
    (now - ARRIVAL_LOOKBACK_SECS, now + horizon_secs)
}

fn eta_seconds(when: i64, now: i64) -> i64 {
    (when - now).max(0)
}

/// A raw-feed key is stale when it is missing (TTL -2), has no expiry (-1),
/// or has decayed below a quarter of the configured threshold.
fn ttl_indicates_stale(ttl: i64, threshold_secs: i64) -> bool {
    if ttl < 0 {
        return true;
    }
    ttl < (threshold_secs / STALE_TTL_FRACTION).max(1)
}

/// Deserialize zset members, order by event time, cap at `limit`. Entries
/// that fail to parse or carry no event time are dropped.
fn parse_arrival_members(members: &[String], limit: usize) -> Vec<ArrivalRecord> {
    let mut records: Vec<ArrivalRecord> = members
        .iter()
        .filter_map(|payload| match serde_json::from_str::<ArrivalRecord>(payload) {
            Ok(record) if record.when().is_some() => Some(record),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Dropping undecodable arrival entry");
                None
            }
        })
        .collect();
    records.sort_by_key(|r| r.when());
    records.truncate(limit);
    records
}

/// The route a record resolves to: strictly through the trip -> route join.
/// No trip, or a trip the schedule does not know, means no route.
fn mapped_route(trip_id: Option<&str>, trip_map: &HashMap<String, String>) -> Option<String> {
    trip_id.and_then(|t| trip_map.get(t).cloned())
}

/// Join arrivals against the trip map, dropping any that do not resolve to
/// a route. A record the schedule cannot place is more misleading than
/// useful on a departure board.
fn resolve_arrival_items(
    records: &[ArrivalRecord],
    trip_map: &HashMap<String, String>,
    now: i64,
) -> Vec<ArrivalItem> {
    records
        .iter()
        .filter_map(|record| {
            let route_id = mapped_route(record.trip_id.as_deref(), trip_map)?;
            let when = record.when()?;
            Some(ArrivalItem {
                trip_id: record.trip_id.clone(),
                route_id,
                stop_sequence: record.stop_sequence,
                arrival: record.arrival,
                departure: record.departure,
                delay_s: record.delay_s,
                eta_seconds: eta_seconds(when, now),
            })
        })
        .collect()
}

fn default_route_meta(route_id: &str) -> RouteMeta {
    RouteMeta {
        long_name: route_id.to_string(),
        color: DEFAULT_ROUTE_COLOR.to_string(),
    }
}

fn trip_ids_of<'a, I: IntoIterator<Item = Option<&'a str>>>(ids: I) -> HashSet<String> {
    ids.into_iter().flatten().map(str::to_string).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub ok: bool,
    pub vehicle_positions_stale: bool,
}

#[derive(Clone)]
pub struct TransitReader {
    redis: ConnectionManager,
    reference: ReferenceStore,
    prefix: String,
    vehicle_staleness_secs: i64,
    trip_staleness_secs: i64,
}

impl TransitReader {
    pub fn new(
        redis: ConnectionManager,
        reference: ReferenceStore,
        prefix: String,
        vehicle_staleness_secs: i64,
        trip_staleness_secs: i64,
    ) -> Self {
        Self {
            redis,
            reference,
            prefix,
            vehicle_staleness_secs,
            trip_staleness_secs,
        }
    }

    /// Cache liveness plus vehicle feed freshness, for the health endpoint.
    pub async fn health(&self) -> Result<Health, BusboardError> {
        let mut conn = self.redis.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        let stale = self
            .feed_stale(FeedKind::VehiclePositions, self.vehicle_staleness_secs)
            .await?;
        Ok(Health {
            ok: pong == "PONG",
            vehicle_positions_stale: stale,
        })
    }

    /// Upcoming (and just-passed) arrivals for one stop, joined to routes.
    /// The flag reports whether the trip updates feed has gone stale.
    pub async fn stop_arrivals(
        &self,
        stop_id: &str,
        limit: usize,
        horizon_secs: i64,
    ) -> Result<(Vec<ArrivalItem>, bool), BusboardError> {
        let now = now_secs();
        let stop_key = [stop_id.to_string()];
        let per_stop = self
            .load_arrival_records(&stop_key, horizon_secs, limit)
            .await?;
        let records = per_stop.get(stop_id).cloned().unwrap_or_default();

        let trip_map = self
            .trip_map_or_empty(trip_ids_of(records.iter().map(|r| r.trip_id.as_deref())))
            .await;
        let arrivals = resolve_arrival_items(&records, &trip_map, now);

        let stale = self
            .feed_stale(FeedKind::TripUpdates, self.trip_staleness_secs)
            .await?;
        Ok((arrivals, stale))
    }

    /// Vehicles currently resolving to the given route. Membership comes
    /// from the trip -> route join, not from whatever route the feed claims.
    pub async fn route_vehicles(
        &self,
        route_id: &str,
    ) -> Result<(Vec<Vehicle>, bool), BusboardError> {
        let records = self.load_vehicle_records().await?;
        let trip_map = self
            .trip_map_or_empty(trip_ids_of(records.iter().map(|r| r.trip_id.as_deref())))
            .await;

        let mut vehicles: Vec<Vehicle> = records
            .into_iter()
            .filter_map(|record| {
                let mapped = mapped_route(record.trip_id.as_deref(), &trip_map)?;
                (mapped == route_id).then(|| Vehicle::from_record(record, Some(mapped)))
            })
            .collect();
        vehicles.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));

        let stale = self
            .feed_stale(FeedKind::VehiclePositions, self.vehicle_staleness_secs)
            .await?;
        Ok((vehicles, stale))
    }

    /// A single vehicle by id, enriched with its route where resolvable.
    pub async fn vehicle(&self, vehicle_id: &str) -> Result<Option<Vehicle>, BusboardError> {
        let mut conn = self.redis.clone();
        let key = keys::vehicle(&self.prefix, vehicle_id);
        let payload: Option<String> = conn.get(&key).await?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let record: VehicleRecord = match serde_json::from_str(&payload) {
            Ok(record) => record,
            Err(e) => {
                warn!(vehicle_id, error = %e, "Undecodable vehicle payload");
                return Ok(None);
            }
        };

        let trip_map = self
            .trip_map_or_empty(trip_ids_of([record.trip_id.as_deref()]))
            .await;
        let mapped = mapped_route(record.trip_id.as_deref(), &trip_map);
        Ok(Some(Vehicle::from_record(record, mapped)))
    }

    /// Cached service alerts, or an empty payload stamped with the current
    /// time when nothing is cached.
    pub async fn alerts(&self) -> Result<AlertsBlob, BusboardError> {
        let mut conn = self.redis.clone();
        let payload: Option<String> = conn.get(keys::alerts(&self.prefix)).await?;
        match payload {
            Some(payload) => match serde_json::from_str(&payload) {
                Ok(blob) => Ok(blob),
                Err(e) => {
                    warn!(error = %e, "Undecodable alerts payload, serving empty");
                    Ok(AlertsBlob {
                        as_of: now_secs(),
                        alerts: Vec::new(),
                    })
                }
            },
            None => Ok(AlertsBlob {
                as_of: now_secs(),
                alerts: Vec::new(),
            }),
        }
    }

    /// Routes with at least one active vehicle, with metadata and the stop
    /// sequence of a representative trip.
    pub async fn active_routes(&self) -> Result<Vec<ActiveRoute>, BusboardError> {
        let records = self.load_vehicle_records().await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let trip_map = self
            .trip_map_or_empty(trip_ids_of(records.iter().map(|r| r.trip_id.as_deref())))
            .await;

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in &records {
            if let Some(route_id) = mapped_route(record.trip_id.as_deref(), &trip_map) {
                *counts.entry(route_id).or_default() += 1;
            }
        }
        if counts.is_empty() {
            return Ok(Vec::new());
        }

        let route_ids: HashSet<String> = counts.keys().cloned().collect();
        let (meta, stops_map) = futures::join!(
            self.routes_meta_or_empty(&route_ids),
            self.route_stops_map(&route_ids),
        );

        // BTreeMap iteration gives the route-id ordering for free
        Ok(counts
            .into_iter()
            .map(|(route_id, count)| {
                let meta = meta
                    .get(&route_id)
                    .cloned()
                    .unwrap_or_else(|| default_route_meta(&route_id));
                let name = if meta.long_name.is_empty() {
                    route_id.clone()
                } else {
                    meta.long_name
                };
                ActiveRoute {
                    name,
                    color: sanitize_color(Some(&meta.color)),
                    stops: stops_map.get(&route_id).cloned().unwrap_or_default(),
                    active_vehicle_count: count,
                    id: route_id,
                }
            })
            .collect())
    }

    /// Display-ready arrivals for a set of stops, one Redis round trip for
    /// the whole board.
    pub async fn arrivals_widget(
        &self,
        stop_ids: &[String],
        horizon_secs: i64,
        per_stop_limit: usize,
    ) -> Result<Vec<WidgetStop>, BusboardError> {
        let now = now_secs();
        let per_stop = self
            .load_arrival_records(stop_ids, horizon_secs, per_stop_limit)
            .await?;

        let trip_map = self
            .trip_map_or_empty(trip_ids_of(
                per_stop
                    .values()
                    .flatten()
                    .map(|r| r.trip_id.as_deref()),
            ))
            .await;

        let route_ids: HashSet<String> = per_stop
            .values()
            .flatten()
            .filter_map(|r| mapped_route(r.trip_id.as_deref(), &trip_map))
            .collect();

        let stop_id_set: HashSet<String> = stop_ids.iter().cloned().collect();
        let (routes_meta, stop_names) = futures::join!(
            self.routes_meta_or_empty(&route_ids),
            self.stop_names_or_empty(&stop_id_set),
        );

        Ok(stop_ids
            .iter()
            .map(|stop_id| {
                let arrivals = per_stop
                    .get(stop_id)
                    .map(|records| {
                        build_widget_arrivals(records, &trip_map, &routes_meta, now)
                    })
                    .unwrap_or_default();
                WidgetStop {
                    stop_id: stop_id.clone(),
                    stop_name: stop_names.get(stop_id).cloned().unwrap_or_default(),
                    arrivals,
                }
            })
            .collect())
    }

    async fn feed_stale(&self, kind: FeedKind, threshold_secs: i64) -> Result<bool, BusboardError> {
        let mut conn = self.redis.clone();
        let key = keys::raw_feed(&self.prefix, kind);
        let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await?;
        Ok(ttl_indicates_stale(ttl, threshold_secs))
    }

    /// One ZRANGEBYSCORE per stop, pipelined, parsed and capped per stop.
    async fn load_arrival_records(
        &self,
        stop_ids: &[String],
        horizon_secs: i64,
        per_stop_limit: usize,
    ) -> Result<HashMap<String, Vec<ArrivalRecord>>, BusboardError> {
        if stop_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let (min, max) = arrival_window(now_secs(), horizon_secs);

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for stop_id in stop_ids {
            let mut cmd = redis::cmd("ZRANGEBYSCORE");
            cmd.arg(keys::stop_arrivals(&self.prefix, stop_id))
                .arg(min)
                .arg(max)
                .arg("LIMIT")
                .arg(0)
                .arg(per_stop_limit);
            pipe.add_command(cmd);
        }
        let results: Vec<Vec<String>> = pipe.query_async(&mut conn).await?;

        Ok(stop_ids
            .iter()
            .zip(results)
            .map(|(stop_id, members)| {
                (
                    stop_id.clone(),
                    parse_arrival_members(&members, per_stop_limit),
                )
            })
            .collect())
    }

    /// All live vehicle records: the global id set, then one pipelined GET
    /// per id. Entries that expired between the two steps are skipped.
    async fn load_vehicle_records(&self) -> Result<Vec<VehicleRecord>, BusboardError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.smembers(keys::vehicles_all(&self.prefix)).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.get(keys::vehicle(&self.prefix, id));
        }
        let payloads: Vec<Option<String>> = pipe.query_async(&mut conn).await?;

        Ok(payloads
            .into_iter()
            .flatten()
            .filter_map(|payload| match serde_json::from_str(&payload) {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!(error = %e, "Dropping undecodable vehicle entry");
                    None
                }
            })
            .collect())
    }

    async fn trip_map_or_empty(&self, trip_ids: HashSet<String>) -> HashMap<String, String> {
        match self.reference.trip_route_map(&trip_ids).await {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "Trip -> route lookup failed, serving unenriched");
                HashMap::new()
            }
        }
    }

    async fn routes_meta_or_empty(
        &self,
        route_ids: &HashSet<String>,
    ) -> HashMap<String, RouteMeta> {
        match self.reference.routes_metadata(route_ids).await {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "Route metadata lookup failed");
                HashMap::new()
            }
        }
    }

    async fn stop_names_or_empty(&self, stop_ids: &HashSet<String>) -> HashMap<String, String> {
        match self.reference.stop_names(stop_ids).await {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "Stop name lookup failed");
                HashMap::new()
            }
        }
    }

    async fn route_stops_map(&self, route_ids: &HashSet<String>) -> HashMap<String, Vec<String>> {
        let lookups = route_ids.iter().map(|route_id| async move {
            let stops = match self.reference.route_stop_names(route_id).await {
                Ok(stops) => stops,
                Err(e) => {
                    warn!(route_id, error = %e, "Route stop lookup failed");
                    Vec::new()
                }
            };
            (route_id.clone(), stops)
        });
        futures::future::join_all(lookups).await.into_iter().collect()
    }
}

fn build_widget_arrivals(
    records: &[ArrivalRecord],
    trip_map: &HashMap<String, String>,
    routes_meta: &HashMap<String, RouteMeta>,
    now: i64,
) -> Vec<WidgetArrival> {
    records
        .iter()
        .filter_map(|record| {
            let route_id = mapped_route(record.trip_id.as_deref(), trip_map)?;
            let when = record.when()?;
            let meta = routes_meta
                .get(&route_id)
                .cloned()
                .unwrap_or_else(|| default_route_meta(&route_id));
            Some(WidgetArrival {
                eta_seconds: eta_seconds(when, now),
                route_long_name: meta.long_name,
                route_color: meta.color,
                // TODO: resolve the trip headsign for the destination label
                to: "TBD".to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arrival(trip_id: Option<&str>, arrival: Option<i64>, departure: Option<i64>) -> ArrivalRecord {
        ArrivalRecord {
            v: 1,
            trip_id: trip_id.map(str::to_string),
            route_id: None,
            stop_sequence: None,
            arrival,
            departure,
            delay_s: None,
        }
    }

    fn trip_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(t, r)| (t.to_string(), r.to_string()))
            .collect()
    }

    #[test]
    fn window_spans_lookback_and_horizon() {
        let (min, max) = arrival_window(10_000, 2700);
        assert_eq!(min, 10_000 - ARRIVAL_LOOKBACK_SECS);
        assert_eq!(max, 12_700);
    }

    #[test]
    fn eta_clamps_past_arrivals_to_zero() {
        assert_eq!(eta_seconds(990, 1000), 0);
        assert_eq!(eta_seconds(1000, 1000), 0);
        assert_eq!(eta_seconds(1060, 1000), 60);
    }

    #[test]
    fn staleness_from_ttl() {
        // missing key / no expiry
        assert!(ttl_indicates_stale(-2, 90));
        assert!(ttl_indicates_stale(-1, 90));
        // 90s threshold: stale below 22
        assert!(ttl_indicates_stale(21, 90));
        assert!(!ttl_indicates_stale(22, 90));
        // tiny thresholds still need at least 1s of TTL
        assert!(ttl_indicates_stale(0, 2));
        assert!(!ttl_indicates_stale(1, 2));
    }

    #[test]
    fn parse_orders_by_event_time_and_caps() {
        let members: Vec<String> = [
            arrival(Some("t1"), Some(300), None),
            arrival(Some("t2"), Some(100), None),
            arrival(Some("t3"), None, Some(200)),
        ]
        .iter()
        .map(|r| serde_json::to_string(r).unwrap())
        .collect();

        let records = parse_arrival_members(&members, 2);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].trip_id.as_deref(), Some("t2"));
        assert_eq!(records[1].trip_id.as_deref(), Some("t3"));
    }

    #[test]
    fn parse_drops_garbage_and_timeless_entries() {
        let members = vec![
            "not json".to_string(),
            serde_json::to_string(&arrival(Some("t1"), None, None)).unwrap(),
            serde_json::to_string(&arrival(Some("t2"), Some(500), None)).unwrap(),
        ];
        let records = parse_arrival_members(&members, 10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].trip_id.as_deref(), Some("t2"));
    }

    #[test]
    fn unresolved_trips_are_dropped_from_arrivals() {
        let records = vec![
            arrival(Some("known"), Some(1100), None),
            arrival(Some("unknown"), Some(1200), None),
            arrival(None, Some(1300), None),
        ];
        let map = trip_map(&[("known", "R1")]);

        let items = resolve_arrival_items(&records, &map, 1000);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].route_id, "R1");
        assert_eq!(items[0].eta_seconds, 100);
    }

    #[test]
    fn widget_arrivals_fall_back_to_default_meta() {
        let records = vec![
            arrival(Some("t1"), Some(1060), None),
            arrival(Some("t2"), Some(1120), None),
        ];
        let map = trip_map(&[("t1", "R1"), ("t2", "R2")]);
        let mut meta = HashMap::new();
        meta.insert(
            "R1".to_string(),
            RouteMeta {
                long_name: "Campus Loop".to_string(),
                color: "#CC0033".to_string(),
            },
        );

        let arrivals = build_widget_arrivals(&records, &map, &meta, 1000);
        assert_eq!(arrivals.len(), 2);
        assert_eq!(arrivals[0].route_long_name, "Campus Loop");
        assert_eq!(arrivals[0].route_color, "#CC0033");
        assert_eq!(arrivals[0].eta_seconds, 60);
        // R2 has no metadata row
        assert_eq!(arrivals[1].route_long_name, "R2");
        assert_eq!(arrivals[1].route_color, DEFAULT_ROUTE_COLOR);
    }

    #[test]
    fn mapped_route_requires_trip_and_mapping() {
        let map = trip_map(&[("t1", "R1")]);
        assert_eq!(mapped_route(Some("t1"), &map), Some("R1".to_string()));
        assert_eq!(mapped_route(Some("t9"), &map), None);
        assert_eq!(mapped_route(None, &map), None);
    }
}
