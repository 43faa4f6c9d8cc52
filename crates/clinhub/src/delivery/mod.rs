//! Outbound command delivery.
//!
//! Commands are written to the outbox before any attempt. The delivery
//! worker claims them, pushes them through a [`SpokeTransport`] and records
//! the outcome; failures back off according to [`RetryPolicy`] until the
//! command is exhausted and left for an operator.

mod retry;
mod transport;

pub use retry::RetryPolicy;
pub use transport::{
    Ack, DeliveryRequest, HttpSpokeTransport, IDEMPOTENCY_KEY_HEADER, SpokeTransport,
    TransportError,
};
