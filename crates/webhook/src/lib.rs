//! Outbound webhook delivery: HTTP transport, request signing, response
//! classification, and the claim-then-process dispatcher over the
//! notification outbox.

pub mod dispatcher;
pub mod transport;

pub use dispatcher::{
    classify_response, disposition_for, DispatchError, DispatchSummary, DispatcherConfig,
    WebhookDispatcher,
};
pub use transport::{
    HttpWebhookTransport, TransportError, WebhookRequest, WebhookResponse, WebhookTransport,
    DELIVERY_ID_HEADER, EVENT_ID_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
