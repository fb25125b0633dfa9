//! HTTP implementations of the payment core's collaborator traits.
//!
//! Every call carries a per-request timeout. A 404 from a lookup endpoint
//! maps to "not found"; any other non-success status is an upstream error.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use alias_pay::memory::LoopbackRelay;
use alias_pay::{
    AliasDirectory, Cart, CartStore, Catalog, FinalizeRequest, Ledger, PaymentError,
    PaymentRequestMessage, Relay, RelayEvent, StockLevel, EVENT_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared client with the timeouts every adapter uses.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_default()
}

/// `base` with `segments` appended as escaped path segments.
fn endpoint(base: &str, segments: &[&str]) -> Result<Url, PaymentError> {
    let mut url =
        Url::parse(base).map_err(|e| PaymentError::Upstream(format!("bad base URL {base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| PaymentError::Upstream(format!("base URL {base} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

async fn optional_json<T: serde::de::DeserializeOwned>(
    request: reqwest::RequestBuilder,
    what: &str,
) -> Result<Option<T>, PaymentError> {
    let resp = request
        .send()
        .await
        .map_err(|e| PaymentError::Upstream(format!("{what} request failed: {e}")))?;
    if resp.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !resp.status().is_success() {
        return Err(PaymentError::Upstream(format!(
            "{what} returned {}",
            resp.status()
        )));
    }
    resp.json::<T>()
        .await
        .map(Some)
        .map_err(|e| PaymentError::Upstream(format!("{what} response parse failed: {e}")))
}

pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[derive(Deserialize)]
struct AliasRecord {
    address: String,
}

#[async_trait]
impl AliasDirectory for HttpDirectory {
    async fn lookup(&self, name: &str) -> Result<Option<String>, PaymentError> {
        let url = endpoint(&self.base_url, &["aliases", name])?;
        let record: Option<AliasRecord> =
            optional_json(self.client.get(url), "alias directory").await?;
        Ok(record.map(|r| r.address))
    }
}

/// Outbound requests go to the relay over HTTP; inbound events arrive via
/// the `/relay/events` endpoint and are pushed in through [`EventIngress`].
pub struct HttpRelay {
    client: reqwest::Client,
    base_url: String,
    subscriber: Mutex<Option<mpsc::Sender<RelayEvent>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestError {
    /// Nobody is subscribed (service not running).
    Closed,
    /// The subscription buffer is full.
    Busy,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssuedRequest {
    request_id: String,
}

/// Entry point for relay events received over HTTP.
pub trait EventIngress: Send + Sync {
    fn ingest(&self, event: RelayEvent) -> Result<(), IngestError>;
}

fn ingest_error<T>(e: mpsc::error::TrySendError<T>) -> IngestError {
    match e {
        mpsc::error::TrySendError::Full(_) => IngestError::Busy,
        mpsc::error::TrySendError::Closed(_) => IngestError::Closed,
    }
}

impl EventIngress for LoopbackRelay {
    fn ingest(&self, event: RelayEvent) -> Result<(), IngestError> {
        self.try_deliver(event).map_err(ingest_error)
    }
}

impl HttpRelay {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            subscriber: Mutex::new(None),
        }
    }
}

impl EventIngress for HttpRelay {
    fn ingest(&self, event: RelayEvent) -> Result<(), IngestError> {
        let guard = self.subscriber.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return Err(IngestError::Closed);
        };
        tx.try_send(event).map_err(ingest_error)
    }
}

#[async_trait]
impl Relay for HttpRelay {
    async fn issue_request(&self, request: &PaymentRequestMessage) -> Result<String, PaymentError> {
        let url = endpoint(&self.base_url, &["requests"])?;
        let resp = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| PaymentError::Relay(format!("request publish failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(PaymentError::Relay(format!(
                "relay rejected request: {}",
                resp.status()
            )));
        }
        let issued: IssuedRequest = resp
            .json()
            .await
            .map_err(|e| PaymentError::Relay(format!("relay response parse failed: {e}")))?;
        Ok(issued.request_id)
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<RelayEvent>, PaymentError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        *self.subscriber.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Ok(rx)
    }

    async fn unsubscribe(&self) {
        self.subscriber
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

pub struct HttpLedger {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLedger {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, PaymentError> {
        let url = endpoint(&self.base_url, &[path])?;
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| PaymentError::Finalization(format!("ledger {path} failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(PaymentError::Finalization(format!(
                "ledger {path} returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| PaymentError::Finalization(format!("ledger {path} parse failed: {e}")))
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn finalize(&self, request: &FinalizeRequest) -> Result<Value, PaymentError> {
        let body = serde_json::to_value(request)?;
        let resp = self.post("finalize", &body).await?;
        Ok(resp.get("token").cloned().unwrap_or(resp))
    }

    async fn persist_token(&self, token: &Value) -> Result<(), PaymentError> {
        self.post("tokens", &serde_json::json!({ "token": token }))
            .await
            .map(|_| ())
    }
}

/// Cart persistence and stock levels from the storefront service.
pub struct HttpCartStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCartStore {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl CartStore for HttpCartStore {
    async fn get_cart(&self, cart_id: &str) -> Result<Option<Cart>, PaymentError> {
        let url = endpoint(&self.base_url, &["carts", cart_id])?;
        optional_json(self.client.get(url), "cart service").await
    }

    async fn set_locked(&self, cart_id: &str, locked: bool) -> Result<(), PaymentError> {
        let url = endpoint(&self.base_url, &["carts", cart_id, "lock"])?;
        let resp = self
            .client
            .put(url)
            .json(&serde_json::json!({ "locked": locked }))
            .send()
            .await
            .map_err(|e| PaymentError::Upstream(format!("cart lock failed: {e}")))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(PaymentError::Upstream(format!(
                "cart lock returned {}",
                resp.status()
            )))
        }
    }
}

#[async_trait]
impl Catalog for HttpCartStore {
    async fn stock(&self, item_id: &str) -> Result<Option<StockLevel>, PaymentError> {
        let url = endpoint(&self.base_url, &["items", item_id, "stock"])?;
        optional_json(self.client.get(url), "stock lookup").await
    }
}
