//! HTTP transport for a single remote collection endpoint.
//!
//! One request/response exchange per call, no retries. Every response,
//! success or failure, is first inspected for a backoff hint and for an
//! authentication failure; both are reported on the transport's event
//! channel before the primary result is returned, so the scheduler can
//! slow down even when the call itself succeeded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::AuthProvider;
use crate::error::SyncError;
use crate::protocol::{DeleteReason, Delta, PushResponse};
use crate::record::SyncRecord;

/// Any retry-after value above two days is treated as nonsense.
const MAX_SANE_RETRY_AFTER_SECS: i64 = 60 * 60 * 24 * 2;

/// Explicit retry-duration header, checked first.
const RETRY_AFTER: &str = "Retry-After";
/// Server-suggested poll interval, checked second.
const POLL_TIME: &str = "X-Sync-Poll-Time";

/// A server directive to slow down polling.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSignal {
    /// Explicit duration from a retry header, when one parsed sanely
    pub retry_after: Option<Duration>,
    /// Response status; 0 means the request never got a response
    pub status: u16,
}

/// Out-of-band observations the transport makes on responses.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Backoff(BackoffSignal),
    AuthFailure { status: u16 },
}

/// One authenticated exchange with the collection endpoint per call.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetches all updates after `since`. The caller passes its cached
    /// collection identity so the server can detect a stale client.
    async fn fetch(&self, since: u64, collection_id: Option<&str>) -> Result<Delta, SyncError>;

    /// Pushes local records, conditional on `since` still being the
    /// latest remote position.
    async fn push(&self, since: u64, records: &[SyncRecord]) -> Result<PushResponse, SyncError>;

    /// Deletes the remote collection. A deliberate admin action, so it
    /// takes no part in backoff signaling.
    async fn delete_collection(&self, reason: &DeleteReason) -> Result<(), SyncError>;
}

/// [`Transport`] over HTTP, against a single collection URL.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    auth: Arc<dyn AuthProvider>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl HttpTransport {
    /// Creates a transport for `url` and returns the receiving end of its
    /// event channel, which the scheduler should consume.
    pub fn new(
        url: impl Into<String>,
        auth: Arc<dyn AuthProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                client: reqwest::Client::new(),
                url: url.into(),
                auth,
                events,
            },
            receiver,
        )
    }

    fn require_login(&self) -> Result<(), SyncError> {
        if self.auth.logged_in() {
            Ok(())
        } else {
            Err(SyncError::NotLoggedIn)
        }
    }

    /// Inspects status and headers of every response, emitting backoff
    /// and auth events before the caller sees the primary outcome.
    fn check_response(&self, status: u16, headers: &HeaderMap) {
        if let Some(signal) = extract_backoff(status, headers, Utc::now()) {
            debug!(status, retry_after = ?signal.retry_after, "server requested backoff");
            let _ = self.events.send(TransportEvent::Backoff(signal));
        }
        if status == 401 {
            warn!("authentication rejected by server");
            self.auth.logout();
            let _ = self.events.send(TransportEvent::AuthFailure { status });
        }
    }

    /// A request that produced no response at all counts as status 0 for
    /// backoff purposes.
    fn check_network_failure(&self) {
        self.check_response(0, &HeaderMap::new());
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        check_backoff: bool,
    ) -> Result<reqwest::Response, SyncError> {
        let request = self.auth.modify_request(request);
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                if check_backoff {
                    self.check_network_failure();
                }
                return Err(SyncError::RequestFailed(e.to_string()));
            }
        };
        let status = response.status().as_u16();
        if check_backoff {
            self.check_response(status, response.headers());
        } else if status == 401 {
            self.auth.logout();
            let _ = self.events.send(TransportEvent::AuthFailure { status });
        }
        if status != 200 {
            let detail = response.text().await.unwrap_or_default();
            return Err(SyncError::TransportError {
                code: status,
                detail,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, since: u64, collection_id: Option<&str>) -> Result<Delta, SyncError> {
        self.require_login()?;
        let mut url = format!("{}?since={}", self.url, since);
        if let Some(id) = collection_id {
            url.push_str("&collection_id=");
            url.push_str(&urlencoding::encode(id));
        }
        let url = self.auth.modify_url(url);
        debug!(%url, "GET updates");

        let response = self.send(self.client.get(&url), true).await?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SyncError::InvalidBody(e.to_string()))?;
        if body.get("collection_deleted").is_some() {
            return Err(SyncError::CollectionDeleted);
        }
        serde_json::from_value(body).map_err(|e| SyncError::InvalidBody(e.to_string()))
    }

    async fn push(&self, since: u64, records: &[SyncRecord]) -> Result<PushResponse, SyncError> {
        self.require_login()?;
        let url = self
            .auth
            .modify_url(format!("{}?since={}", self.url, since));
        debug!(%url, count = records.len(), "POST records");

        let response = self.send(self.client.post(&url).json(records), true).await?;
        response
            .json()
            .await
            .map_err(|e| SyncError::InvalidBody(e.to_string()))
    }

    async fn delete_collection(&self, reason: &DeleteReason) -> Result<(), SyncError> {
        self.require_login()?;
        let url = self.auth.modify_url(format!("{}?delete", self.url));
        debug!(%url, reason = %reason.reason, "POST collection delete");

        self.send(self.client.post(&url).json(reason), false)
            .await?;
        Ok(())
    }
}

/// Pulls a backoff signal out of a response, if it carries one.
///
/// Reads the retry directive header, falling back to the poll-time
/// header. A value that parses as an integer is seconds; otherwise it is
/// tried as a calendar date and converted to a delta from `now`. Values
/// that are non-positive or further out than two days are discarded, in
/// which case an overloaded status (0 or 5xx) still produces a signal
/// without a duration.
fn extract_backoff(status: u16, headers: &HeaderMap, now: DateTime<Utc>) -> Option<BackoffSignal> {
    let raw = headers
        .get(RETRY_AFTER)
        .or_else(|| headers.get(POLL_TIME))
        .and_then(|value| value.to_str().ok());
    if let Some(raw) = raw {
        let seconds = raw
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| parse_retry_date(raw, now));
        if let Some(seconds) = seconds {
            if is_sane_retry_after(seconds) {
                return Some(BackoffSignal {
                    retry_after: Some(Duration::from_secs(seconds as u64)),
                    status,
                });
            }
        }
    }
    if status == 0 || (500..600).contains(&status) {
        return Some(BackoffSignal {
            retry_after: None,
            status,
        });
    }
    None
}

/// Interprets a header value as an HTTP date, yielding seconds from `now`.
fn parse_retry_date(raw: &str, now: DateTime<Utc>) -> Option<i64> {
    let date = DateTime::parse_from_rfc2822(raw.trim()).ok()?;
    Some((date.with_timezone(&Utc) - now).num_seconds())
}

fn is_sane_retry_after(seconds: i64) -> bool {
    seconds > 0 && seconds <= MAX_SANE_RETRY_AFTER_SECS
}
