//! The boundary to the parent controller process.
//!
//! Inbound requests and notifications arrive already framed and parsed; the
//! embedder feeds them to [`Worker::process`](crate::worker::Worker::process)
//! or through the [`Worker::run`](crate::worker::Worker::run) pump. Outbound
//! traffic (responses, events, binary payloads) leaves through the sink
//! capabilities bundled in [`ControlPipe`]. JSON stops here: everything past
//! this module works on typed records.

use crate::messages::{Internal, PayloadEvent, PayloadMethod, RequestMethod};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Error returned to the controller in place of a response.
///
/// Recoverable kinds terminate the current request only. `Fatal` signals an
/// invariant violation; the embedder is expected to exit so the controller
/// can respawn the worker.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum RequestError {
    /// Malformed or missing fields.
    #[error("{0}")]
    InvalidRequest(String),
    /// Well-formed but semantically invalid.
    #[error("{0}")]
    TypeError(String),
    /// Addressed entity does not exist.
    #[error("{0}")]
    NotFound(String),
    /// Creation with an id already in use.
    #[error("{0}")]
    DuplicateId(String),
    /// Operation not valid in the current state.
    #[error("{0}")]
    IllegalState(String),
    /// DTLS/SRTP failure surfaced from the transport driver.
    #[error("{0}")]
    CryptoError(String),
    /// Invariant violation; the worker must exit.
    #[error("{0}")]
    Fatal(String),
}

impl RequestError {
    /// Wire name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::InvalidRequest(_) => "INVALID_REQUEST",
            RequestError::TypeError(_) => "TYPE_ERROR",
            RequestError::NotFound(_) => "NOT_FOUND",
            RequestError::DuplicateId(_) => "DUPLICATE_ID",
            RequestError::IllegalState(_) => "ILLEGAL_STATE",
            RequestError::CryptoError(_) => "CRYPTO_ERROR",
            RequestError::Fatal(_) => "FATAL",
        }
    }
}

/// Outcome of one request: `accept` with optional data, or `error`.
pub type RequestResult = Result<Option<Value>, RequestError>;

/// A request from the control channel.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelRequest {
    pub id: u32,
    pub method: RequestMethod,
    #[serde(default)]
    pub internal: Internal,
    #[serde(default)]
    pub data: Value,
}

/// A request from the payload channel; its body carries a binary payload.
#[derive(Debug, Clone)]
pub struct PayloadChannelRequest {
    pub id: u32,
    pub method: PayloadMethod,
    pub internal: Internal,
    pub data: Value,
    pub payload: Bytes,
}

/// A notification from the payload channel.
#[derive(Debug, Clone)]
pub struct PayloadChannelNotification {
    pub event: PayloadEvent,
    pub internal: Internal,
    pub data: Value,
    pub payload: Bytes,
}

/// Everything the pipe can deliver, for the single-consumer request pump.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    Request(ChannelRequest),
    PayloadRequest(PayloadChannelRequest),
    PayloadNotification(PayloadChannelNotification),
}

/// Outbound half of the control channel: responses to requests.
pub trait ResponseSink: Send + Sync {
    fn respond(&self, id: u32, result: RequestResult);
}

/// Outbound half of the control channel: unsolicited events.
///
/// `target_id` is the id of the entity the event belongs to (or the worker
/// pid for worker-level events), matching how the controller demultiplexes.
pub trait ChannelNotificationSink: Send + Sync {
    fn notify(&self, target_id: &str, event: &'static str, data: Value);
}

/// Outbound half of the payload channel: events with a binary payload.
pub trait PayloadNotificationSink: Send + Sync {
    fn notify(&self, target_id: &str, event: &'static str, data: Value, payload: Bytes);
}

/// The controller-facing capabilities handed to the worker at construction.
#[derive(Clone)]
pub struct ControlPipe {
    pub responses: Arc<dyn ResponseSink>,
    pub notifications: Arc<dyn ChannelNotificationSink>,
    pub payload_notifications: Arc<dyn PayloadNotificationSink>,
}
