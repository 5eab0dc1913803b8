//! Writer lock for ingestor replicas.
//!
//! A plain Redis `SET NX EX` token with periodic renewal. There is no release
//! path: if the holder dies the lock simply expires, so another replica takes
//! over after at most one lock TTL.

use redis::aio::ConnectionManager;
use tracing::debug;

use crate::error::BusboardError;

/// Opaque token identifying this process as the lock holder.
pub fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Try to become the active writer. Succeeds only when no valid lock exists.
pub async fn acquire(
    conn: &mut ConnectionManager,
    key: &str,
    ttl_secs: u64,
    token: &str,
) -> Result<bool, BusboardError> {
    let reply: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg(token)
        .arg("NX")
        .arg("EX")
        .arg(ttl_secs)
        .query_async(conn)
        .await?;
    Ok(reply.is_some())
}

/// Extend the lock if this process still holds it. A `false` return means
/// another replica took over; the caller should treat the cycle as lost.
pub async fn renew(
    conn: &mut ConnectionManager,
    key: &str,
    ttl_secs: u64,
    token: &str,
) -> Result<bool, BusboardError> {
    let holder: Option<String> = redis::cmd("GET").arg(key).query_async(conn).await?;
    match holder {
        Some(current) if current == token => {
            let extended: bool = redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs)
                .query_async(conn)
                .await?;
            Ok(extended)
        }
        _ => {
            debug!(key, "Lock held by another replica, renewal skipped");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_per_process_start() {
        let a = new_token();
        let b = new_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
