//! Live transit cache: GTFS-RT ingestion into Redis plus an enriched read
//! path over it.
//!
//! The write side ([`ingest`]) polls GTFS-RT protobuf feeds under a
//! single-writer TTL lock and rewrites TTL-bounded Redis keys each cycle.
//! The read side ([`reader::TransitReader`]) serves arrivals, vehicles,
//! alerts and route summaries from those keys, joined against the static
//! GTFS schedule in Postgres ([`reference::ReferenceStore`]).

pub mod config;
pub mod error;
pub mod ingest;
pub mod keys;
pub mod models;
pub mod reader;
pub mod reference;
