//! Redis key scheme.
//!
//! Every key is prefix-scoped so multiple deployments can share one Redis.
//! The writer fully replaces set/zset keys each cycle; TTLs are attached in
//! the writer, not here.

/// Kind of raw GTFS-RT feed, used for the `:raw` debugging keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    VehiclePositions,
    TripUpdates,
    Alerts,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::VehiclePositions => "vehicle_positions",
            FeedKind::TripUpdates => "trip_updates",
            FeedKind::Alerts => "alerts",
        }
    }
}

pub fn vehicle(prefix: &str, vehicle_id: &str) -> String {
    format!("{prefix}:vehicle:{vehicle_id}")
}

pub fn vehicles_all(prefix: &str) -> String {
    format!("{prefix}:vehicles:all")
}

pub fn route_vehicles(prefix: &str, route_id: &str) -> String {
    format!("{prefix}:route:{route_id}:vehicles")
}

pub fn stop_arrivals(prefix: &str, stop_id: &str) -> String {
    format!("{prefix}:stop:{stop_id}:arrivals")
}

pub fn alerts(prefix: &str) -> String {
    format!("{prefix}:alerts")
}

pub fn raw_feed(prefix: &str, kind: FeedKind) -> String {
    format!("{prefix}:{}:raw", kind.as_str())
}

pub fn ingestor_lock(prefix: &str) -> String {
    format!("{prefix}:ingestor:lock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes() {
        assert_eq!(vehicle("gtfsrt", "bus42"), "gtfsrt:vehicle:bus42");
        assert_eq!(vehicles_all("gtfsrt"), "gtfsrt:vehicles:all");
        assert_eq!(route_vehicles("gtfsrt", "A"), "gtfsrt:route:A:vehicles");
        assert_eq!(stop_arrivals("gtfsrt", "S1"), "gtfsrt:stop:S1:arrivals");
        assert_eq!(alerts("gtfsrt"), "gtfsrt:alerts");
        assert_eq!(ingestor_lock("gtfsrt"), "gtfsrt:ingestor:lock");
    }

    #[test]
    fn raw_feed_keys() {
        assert_eq!(
            raw_feed("gtfsrt", FeedKind::VehiclePositions),
            "gtfsrt:vehicle_positions:raw"
        );
        assert_eq!(
            raw_feed("gtfsrt", FeedKind::TripUpdates),
            "gtfsrt:trip_updates:raw"
        );
        assert_eq!(raw_feed("gtfsrt", FeedKind::Alerts), "gtfsrt:alerts:raw");
    }
}
