use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusboardError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),
    #[error("Reference store error: {0}")]
    Database(#[from] sqlx::Error),
}
