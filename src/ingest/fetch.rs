//! Conditional HTTP fetch for GTFS-RT feeds.
//!
//! Tracks `ETag`/`Last-Modified` per feed so unchanged payloads short-circuit
//! with a 304. All failures are soft: the caller sees [`FetchOutcome::Failed`]
//! and the previous cache contents age out on their own.

use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use tracing::{debug, info, warn};

/// Maximum allowed protobuf response size (50 MB)
const MAX_PROTOBUF_SIZE: usize = 50 * 1024 * 1024;

/// Conditional-request state for one feed URL. Lives for the process
/// lifetime; mutated only after a successful 200 response.
#[derive(Debug, Default, Clone)]
pub struct FeedPollState {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl FeedPollState {
    /// Update validators from a 2xx response, keeping the previous value for
    /// any header the server omitted.
    pub fn absorb(&mut self, etag: Option<String>, last_modified: Option<String>) {
        if etag.is_some() {
            self.etag = etag;
        }
        if last_modified.is_some() {
            self.last_modified = last_modified;
        }
    }
}

/// Outcome of one conditional fetch. `Failed` has already been logged.
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(Vec<u8>),
    NotModified,
    Failed,
}

pub async fn fetch_feed(
    client: &reqwest::Client,
    url: &str,
    state: &mut FeedPollState,
    timeout: std::time::Duration,
) -> FetchOutcome {
    let mut request = client.get(url).timeout(timeout);
    if let Some(etag) = &state.etag {
        request = request.header(IF_NONE_MATCH, etag);
    }
    if let Some(last_modified) = &state.last_modified {
        request = request.header(IF_MODIFIED_SINCE, last_modified);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(url, error = %e, "Feed fetch failed");
            return FetchOutcome::Failed;
        }
    };

    if response.status() == StatusCode::NOT_MODIFIED {
        debug!(url, "Feed not modified (304)");
        return FetchOutcome::NotModified;
    }

    if !response.status().is_success() {
        warn!(url, status = %response.status(), "Feed returned non-success status");
        return FetchOutcome::Failed;
    }

    let etag = header_value(&response, ETAG);
    let last_modified = header_value(&response, LAST_MODIFIED);

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            warn!(url, error = %e, "Failed to read feed body");
            return FetchOutcome::Failed;
        }
    };

    if body.len() > MAX_PROTOBUF_SIZE {
        warn!(
            url,
            bytes = body.len(),
            max = MAX_PROTOBUF_SIZE,
            "Feed response too large, discarding"
        );
        return FetchOutcome::Failed;
    }

    state.absorb(etag, last_modified);
    info!(url, bytes = body.len(), "Fetched feed");
    FetchOutcome::Fetched(body.to_vec())
}

fn header_value(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_takes_new_validators() {
        let mut state = FeedPollState::default();
        state.absorb(Some("\"abc\"".into()), Some("Mon, 01 Jan 2026 00:00:00 GMT".into()));
        assert_eq!(state.etag.as_deref(), Some("\"abc\""));
        assert!(state.last_modified.is_some());
    }

    #[test]
    fn absorb_keeps_previous_value_when_header_absent() {
        let mut state = FeedPollState {
            etag: Some("\"abc\"".into()),
            last_modified: Some("Mon, 01 Jan 2026 00:00:00 GMT".into()),
        };
        state.absorb(Some("\"def\"".into()), None);
        assert_eq!(state.etag.as_deref(), Some("\"def\""));
        assert_eq!(
            state.last_modified.as_deref(),
            Some("Mon, 01 Jan 2026 00:00:00 GMT")
        );
    }

    #[test]
    fn absorb_noop_when_both_absent() {
        let mut state = FeedPollState {
            etag: Some("\"abc\"".into()),
            last_modified: None,
        };
        state.absorb(None, None);
        assert_eq!(state.etag.as_deref(), Some("\"abc\""));
        assert!(state.last_modified.is_none());
    }
}
