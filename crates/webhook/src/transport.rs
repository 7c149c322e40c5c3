use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub const DELIVERY_ID_HEADER: &str = "X-Vigil-Delivery-Id";
pub const EVENT_ID_HEADER: &str = "X-Vigil-Event-Id";
pub const TIMESTAMP_HEADER: &str = "X-Vigil-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Vigil-Signature";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("webhook request timed out: {0}")]
    Timeout(String),
    #[error("webhook connection failed: {0}")]
    Connect(String),
    #[error("webhook send failed: {0}")]
    Send(String),
}

impl TransportError {
    /// Stable code recorded in the delivery ledger.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Connect(_) => "connect",
            Self::Send(_) => "send",
        }
    }
}

/// One outbound delivery, fully rendered: the dispatcher owns signing and
/// header assembly, the transport only moves bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookRequest {
    pub endpoint_url: String,
    pub delivery_id: String,
    pub event_id: String,
    pub timestamp: i64,
    pub signature: Option<String>,
    pub payload_json: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(&self, request: &WebhookRequest) -> Result<WebhookResponse, TransportError>;
}

pub struct HttpWebhookTransport {
    client: reqwest::Client,
}

impl HttpWebhookTransport {
    pub fn new(timeout_secs: u64) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn deliver(&self, request: &WebhookRequest) -> Result<WebhookResponse, TransportError> {
        let mut builder = self
            .client
            .post(&request.endpoint_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(DELIVERY_ID_HEADER, &request.delivery_id)
            .header(EVENT_ID_HEADER, &request.event_id)
            .header(TIMESTAMP_HEADER, request.timestamp.to_string())
            .body(request.payload_json.clone());
        if let Some(signature) = &request.signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }

        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                TransportError::Timeout(error.to_string())
            } else if error.is_connect() {
                TransportError::Connect(error.to_string())
            } else {
                TransportError::Send(error.to_string())
            }
        })?;

        Ok(WebhookResponse { status: response.status().as_u16() })
    }
}
