use crate::{events::Stream, Error, Result};
use chipledger_types::{
    api::{
        Affected, ChangeEvent, ChangeFilter, ChipsUpdate, ErrorBody, MembershipUpsert, NewRoom,
        PlayerRename, TransferRequest,
    },
    ledger::{
        Membership, MembershipView, Participant, ParticipantId, Room, TransferReceipt,
        TransferRecord,
    },
};
use reqwest::Client as HttpClient;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tracing::{debug, info};
use url::Url;

/// Timeout for connections and requests
const TIMEOUT: Duration = Duration::from_secs(30);

/// Retry policy for transient HTTP failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per request (including the first attempt).
    pub max_attempts: usize,
    /// Initial backoff delay after the first retryable failure.
    pub initial_backoff: Duration,
    /// Maximum backoff delay between attempts.
    pub max_backoff: Duration,
    /// Whether non-idempotent requests (e.g., POST) may be retried.
    pub retry_non_idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            retry_non_idempotent: false,
        }
    }
}

/// Chipledger gateway client
#[derive(Clone)]
pub struct Client {
    pub base_url: Url,
    pub ws_url: Url,
    pub http_client: HttpClient,

    retry_policy: RetryPolicy,
    feed_capacity: usize,
}

impl Client {
    /// Create a new client
    #[allow(clippy::result_large_err)]
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;

        // Convert http(s) to ws(s) for WebSocket URL
        let ws_scheme = match base_url.scheme() {
            "http" => "ws",
            "https" => "wss",
            scheme => {
                return Err(Error::InvalidScheme(scheme.to_string()));
            }
        };

        // Endpoints are appended as path segments
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut ws_url = base_url.clone();
        ws_url
            .set_scheme(ws_scheme)
            .map_err(|_| Error::InvalidScheme(ws_scheme.to_string()))?;

        let http_client = HttpClient::builder()
            .timeout(TIMEOUT)
            .pool_max_idle_per_host(100) // More connections per host
            .pool_idle_timeout(Duration::from_secs(60)) // Keep connections alive
            .tcp_keepalive(Duration::from_secs(30)) // TCP keepalive
            .build()?;

        Ok(Self {
            base_url,
            ws_url,
            http_client,
            retry_policy: RetryPolicy::default(),
            feed_capacity: 0,
        })
    }

    /// Returns a copy of the current retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Sets the retry policy for subsequent HTTP requests.
    pub fn set_retry_policy(&mut self, retry_policy: RetryPolicy) {
        self.retry_policy = retry_policy;
    }

    /// Returns a new client with the provided retry policy.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Returns a new client whose change feeds buffer up to `capacity`
    /// events (`0` keeps the default).
    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity;
        self
    }

    #[allow(clippy::result_large_err)]
    fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidScheme(base.scheme().to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send_with_retry(
        &self,
        method: reqwest::Method,
        make_request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let max_attempts = if is_idempotent(&method) || self.retry_policy.retry_non_idempotent {
            self.retry_policy.max_attempts.max(1)
        } else {
            1
        };

        let mut attempt = 0usize;
        let mut backoff = self.retry_policy.initial_backoff;
        loop {
            attempt += 1;
            let result = make_request().send().await;
            match result {
                Ok(response) => {
                    let status = response.status();
                    if !is_retryable_status(status) || attempt >= max_attempts {
                        return Ok(response);
                    }
                    debug!(%method, %status, attempt, "Retrying request");
                }
                Err(err) => {
                    if attempt >= max_attempts || !is_retryable_error(&err) {
                        return Err(Error::Reqwest(err));
                    }
                    debug!(%method, ?err, attempt, "Retrying request");
                }
            }

            if backoff > Duration::ZERO {
                sleep(backoff).await;
                backoff = std::cmp::min(backoff.saturating_mul(2), self.retry_policy.max_backoff);
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self
            .send_with_retry(reqwest::Method::GET, || self.http_client.get(url.clone()))
            .await?;
        decode(response).await
    }

    async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: Url,
        body: &B,
    ) -> Result<T> {
        debug!(%method, %url, "Sending request");
        let response = self
            .send_with_retry(method.clone(), || {
                self.http_client
                    .request(method.clone(), url.clone())
                    .json(body)
            })
            .await?;
        decode(response).await
    }

    /// Insert a room. Returns the stored room and whether this call created
    /// it (`false` when the code was already taken).
    pub async fn insert_room(&self, code: &str) -> Result<(Room, bool)> {
        let url = Self::endpoint(&self.base_url, &["rooms"])?;
        let body = NewRoom {
            id: code.to_string(),
        };
        let response = self
            .send_with_retry(reqwest::Method::POST, || {
                self.http_client.post(url.clone()).json(&body)
            })
            .await?;
        let created = response.status() == reqwest::StatusCode::CREATED;
        let room = decode(response).await?;
        Ok((room, created))
    }

    /// Look a room up by code
    pub async fn get_room(&self, code: &str) -> Result<Option<Room>> {
        let url = Self::endpoint(&self.base_url, &["rooms", code])?;
        let response = self
            .send_with_retry(reqwest::Method::GET, || self.http_client.get(url.clone()))
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    pub async fn upsert_player(&self, player: &Participant) -> Result<Participant> {
        let url = Self::endpoint(&self.base_url, &["players"])?;
        self.send_json(reqwest::Method::PUT, url, player).await
    }

    pub async fn rename_player(&self, id: ParticipantId, name: &str) -> Result<Affected> {
        let url = Self::endpoint(&self.base_url, &["players", &id.to_string()])?;
        let body = PlayerRename {
            name: name.to_string(),
        };
        self.send_json(reqwest::Method::PATCH, url, &body).await
    }

    /// Memberships of a room joined with display names, optionally narrowed
    /// to one participant
    pub async fn list_memberships(
        &self,
        room: &str,
        participant: Option<ParticipantId>,
    ) -> Result<Vec<MembershipView>> {
        let mut url = Self::endpoint(&self.base_url, &["rooms", room, "members"])?;
        if let Some(participant) = participant {
            url.query_pairs_mut()
                .append_pair("participant", &participant.to_string());
        }
        self.get(url).await
    }

    pub async fn upsert_membership(
        &self,
        room: &str,
        upsert: &MembershipUpsert,
    ) -> Result<Membership> {
        let url = Self::endpoint(&self.base_url, &["rooms", room, "members"])?;
        self.send_json(reqwest::Method::PUT, url, upsert).await
    }

    /// Overwrite a membership's balance
    pub async fn update_chips(
        &self,
        room: &str,
        participant: ParticipantId,
        chips: i64,
    ) -> Result<Affected> {
        let url = Self::endpoint(
            &self.base_url,
            &["rooms", room, "members", &participant.to_string()],
        )?;
        self.send_json(reqwest::Method::PATCH, url, &ChipsUpdate { chips })
            .await
    }

    pub async fn delete_membership(
        &self,
        room: &str,
        participant: ParticipantId,
    ) -> Result<Affected> {
        let url = Self::endpoint(
            &self.base_url,
            &["rooms", room, "members", &participant.to_string()],
        )?;
        let response = self
            .send_with_retry(reqwest::Method::DELETE, || {
                self.http_client.delete(url.clone())
            })
            .await?;
        decode(response).await
    }

    pub async fn list_transfers(&self, room: &str) -> Result<Vec<TransferRecord>> {
        let url = Self::endpoint(&self.base_url, &["rooms", room, "transfers"])?;
        self.get(url).await
    }

    /// Append a transfer record. Balances are not touched.
    pub async fn insert_transfer(
        &self,
        room: &str,
        request: &TransferRequest,
    ) -> Result<TransferRecord> {
        let url = Self::endpoint(&self.base_url, &["rooms", room, "transfers"])?;
        self.send_json(reqwest::Method::POST, url, request).await
    }

    /// Run the gateway's atomic transfer procedure
    pub async fn transfer(&self, room: &str, request: &TransferRequest) -> Result<TransferReceipt> {
        let url = Self::endpoint(&self.base_url, &["rooms", room, "transfer"])?;
        self.send_json(reqwest::Method::POST, url, request).await
    }

    /// Connect to the change feed of one table, filtered by room
    pub async fn connect_changes(&self, filter: &ChangeFilter) -> Result<Stream<ChangeEvent>> {
        self.connect_changes_with_capacity(filter, self.feed_capacity)
            .await
    }

    /// Connect to the change feed with a configurable channel capacity.
    ///
    /// A `channel_capacity` of `0` uses the default capacity.
    pub async fn connect_changes_with_capacity(
        &self,
        filter: &ChangeFilter,
        channel_capacity: usize,
    ) -> Result<Stream<ChangeEvent>> {
        let ws_url = Self::endpoint(
            &self.ws_url,
            &["changes", filter.table.as_str(), &filter.room_id],
        )?;
        info!(ws_url = %ws_url, ?filter, "Connecting to changes WebSocket");

        let (ws_stream, _) = timeout(TIMEOUT, connect_async(ws_url.as_str()))
            .await
            .map_err(|_| Error::DialTimeout)??;
        info!("WebSocket connected");

        Ok(Stream::new_with_capacity(ws_stream, channel_capacity))
    }
}

/// Decode a successful JSON response or turn the error body into
/// [Error::Failed].
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let bytes = response.bytes().await?;
    if !status.is_success() {
        let message = serde_json::from_slice::<ErrorBody>(&bytes)
            .map(|body| body.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
        return Err(Error::Failed { status, message });
    }
    Ok(serde_json::from_slice(&bytes)?)
}

fn is_idempotent(method: &reqwest::Method) -> bool {
    use reqwest::Method;
    *method == Method::GET || *method == Method::PUT || *method == Method::DELETE
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    use reqwest::StatusCode;
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_segments() {
        let client = Client::new("http://localhost:8080/api").unwrap();
        assert_eq!(client.base_url.as_str(), "http://localhost:8080/api/");
        assert_eq!(client.ws_url.as_str(), "ws://localhost:8080/api/");

        let url = Client::endpoint(&client.base_url, &["rooms", "ab12cd", "members"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/api/rooms/ab12cd/members");

        // Segments are percent-encoded rather than interpreted
        let url = Client::endpoint(&client.base_url, &["rooms", "a/b"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/api/rooms/a%2Fb");
    }

    #[test]
    fn test_retry_classification() {
        assert!(is_idempotent(&reqwest::Method::PUT));
        assert!(!is_idempotent(&reqwest::Method::POST));
        assert!(!is_idempotent(&reqwest::Method::PATCH));
        assert!(is_retryable_status(reqwest::StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(reqwest::StatusCode::CONFLICT));
    }
}
