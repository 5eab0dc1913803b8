//! Read-only access to the static GTFS reference schema in Postgres.
//!
//! The nightly schedule rebuild owns these tables; this module only joins
//! against them. Callers treat a failed lookup as "no enrichment data" and
//! degrade to partial results instead of erroring.

use std::collections::{HashMap, HashSet};

use sqlx::postgres::PgPool;

use crate::error::BusboardError;
use crate::models::RouteMeta;

pub const DEFAULT_ROUTE_COLOR: &str = "#666666";

/// Normalize a GTFS route color: trim, `#`-prefix, default when missing.
pub fn sanitize_color(raw: Option<&str>) -> String {
    let color = raw.map(str::trim).unwrap_or("");
    if color.is_empty() {
        DEFAULT_ROUTE_COLOR.to_string()
    } else if color.starts_with('#') {
        color.to_string()
    } else {
        format!("#{color}")
    }
}

#[derive(Clone)]
pub struct ReferenceStore {
    pool: PgPool,
    schema: String,
}

impl ReferenceStore {
    pub fn new(pool: PgPool, schema: String) -> Self {
        Self { pool, schema }
    }

    pub async fn ping(&self) -> Result<(), BusboardError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// trip_id -> route_id for the requested trips. Trips without a route
    /// are omitted.
    pub async fn trip_route_map(
        &self,
        trip_ids: &HashSet<String>,
    ) -> Result<HashMap<String, String>, BusboardError> {
        if trip_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = format!(
            r#"SELECT trip_id, route_id FROM "{}".trips WHERE trip_id = ANY($1)"#,
            self.schema
        );
        let ids: Vec<String> = trip_ids.iter().cloned().collect();
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(&sql)
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(trip_id, route_id)| route_id.map(|r| (trip_id, r)))
            .collect())
    }

    /// Route display metadata keyed by route_id, with colors sanitized.
    pub async fn routes_metadata(
        &self,
        route_ids: &HashSet<String>,
    ) -> Result<HashMap<String, RouteMeta>, BusboardError> {
        if route_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = format!(
            r#"SELECT route_id, route_long_name, route_color
               FROM "{}".routes WHERE route_id = ANY($1)"#,
            self.schema
        );
        let ids: Vec<String> = route_ids.iter().cloned().collect();
        let rows: Vec<(String, Option<String>, Option<String>)> = sqlx::query_as(&sql)
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(route_id, long_name, color)| {
                (
                    route_id,
                    RouteMeta {
                        long_name: long_name.unwrap_or_default(),
                        color: sanitize_color(color.as_deref()),
                    },
                )
            })
            .collect())
    }

    /// stop_id -> stop_name for the requested stops.
    pub async fn stop_names(
        &self,
        stop_ids: &HashSet<String>,
    ) -> Result<HashMap<String, String>, BusboardError> {
        if stop_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = format!(
            r#"SELECT stop_id, stop_name FROM "{}".stops WHERE stop_id = ANY($1)"#,
            self.schema
        );
        let ids: Vec<String> = stop_ids.iter().cloned().collect();
        let rows: Vec<(String, String)> = sqlx::query_as(&sql)
            .bind(&ids)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().collect())
    }

    /// Ordered stop names for a representative trip on the route: the trip
    /// with the most stops, ties broken by trip_id for determinism.
    pub async fn route_stop_names(&self, route_id: &str) -> Result<Vec<String>, BusboardError> {
        let sql = format!(
            r#"
            WITH route_trips AS (
                SELECT trip_id
                FROM "{schema}".trips
                WHERE route_id = $1
            ),
            longest_trip AS (
                SELECT trip_id
                FROM (
                    SELECT st.trip_id,
                           COUNT(*) AS stop_cnt,
                           ROW_NUMBER() OVER (ORDER BY COUNT(*) DESC, st.trip_id) AS rn
                    FROM "{schema}".stop_times st
                    JOIN route_trips rt USING (trip_id)
                    GROUP BY st.trip_id
                ) ranked
                WHERE rn = 1
            )
            SELECT s.stop_name
            FROM "{schema}".stop_times st
            JOIN longest_trip lt ON lt.trip_id = st.trip_id
            JOIN "{schema}".stops s ON s.stop_id = st.stop_id
            ORDER BY st.stop_sequence
            "#,
            schema = self.schema
        );
        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .bind(route_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}
