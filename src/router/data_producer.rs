//! A data producer ingests one endpoint's SCTP (or directly injected)
//! messages and hands them to the router for fan-out to data consumers.

use crate::channel::RequestError;
use crate::messages::to_response_data;
use crate::router::WeakRouter;
use crate::sctp_parameters::SctpStreamParameters;
use crate::string_based_wrapper_type;
use bytes::Bytes;
use event_listener_primitives::{BagOnce, HandlerId};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

string_based_wrapper_type!(
    /// [`DataProducer`] identifier.
    DataProducerId
);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataProducerType {
    /// Messages arrive over the transport's SCTP association.
    Sctp,
    /// Messages are injected through the payload channel.
    Direct,
}

/// Creation data of a data producer, as sent by the controller.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataProducerOptions {
    pub r#type: DataProducerType,
    /// Required for SCTP data producers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DataProducerDump {
    pub id: DataProducerId,
    pub r#type: DataProducerType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
    pub label: String,
    pub protocol: String,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataProducerStat {
    pub label: String,
    pub protocol: String,
    pub messages_received: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct Handlers {
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

pub(crate) struct Inner {
    id: DataProducerId,
    r#type: DataProducerType,
    sctp_stream_parameters: Option<SctpStreamParameters>,
    label: String,
    protocol: String,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    router: WeakRouter,
    handlers: Handlers,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("drop()");

        self.handlers.close.call_simple();
    }
}

/// A data (SCTP message) source being injected into a router.
#[derive(Clone)]
pub struct DataProducer {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakDataProducer {
    inner: Weak<Inner>,
}

impl WeakDataProducer {
    pub(crate) fn upgrade(&self) -> Option<DataProducer> {
        Some(DataProducer {
            inner: self.inner.upgrade()?,
        })
    }
}

impl DataProducer {
    pub(crate) fn new(
        id: DataProducerId,
        options: DataProducerOptions,
        router: WeakRouter,
    ) -> Result<Self, RequestError> {
        debug!("new()");

        let DataProducerOptions {
            r#type,
            sctp_stream_parameters,
            label,
            protocol,
        } = options;

        match r#type {
            DataProducerType::Sctp => match sctp_stream_parameters {
                Some(parameters) if !parameters.is_valid() => {
                    return Err(RequestError::TypeError(
                        "invalid sctpStreamParameters reliability combination".into(),
                    ));
                }
                Some(_) => (),
                None => {
                    return Err(RequestError::TypeError(
                        "sctpStreamParameters are required for SCTP data producers".into(),
                    ));
                }
            },
            DataProducerType::Direct => {
                if sctp_stream_parameters.is_some() {
                    return Err(RequestError::TypeError(
                        "sctpStreamParameters must not be given for direct data producers".into(),
                    ));
                }
            }
        }

        let inner = Arc::new(Inner {
            id,
            r#type,
            sctp_stream_parameters,
            label,
            protocol,
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            router,
            handlers: Handlers::default(),
            closed: AtomicBool::new(false),
        });

        Ok(Self { inner })
    }

    /// DataProducer identifier.
    pub fn id(&self) -> &DataProducerId {
        &self.inner.id
    }

    /// DataProducer type.
    pub fn r#type(&self) -> DataProducerType {
        self.inner.r#type
    }

    /// SCTP stream parameters (absent for direct data producers).
    pub fn sctp_stream_parameters(&self) -> Option<SctpStreamParameters> {
        self.inner.sctp_stream_parameters
    }

    /// DataChannel label.
    pub fn label(&self) -> &String {
        &self.inner.label
    }

    /// DataChannel sub-protocol.
    pub fn protocol(&self) -> &String {
        &self.inner.protocol
    }

    /// Whether the data producer is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Messages received so far.
    pub fn messages_received(&self) -> u64 {
        self.inner.messages_received.load(Ordering::Relaxed)
    }

    /// Bytes received so far.
    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    pub(crate) fn downgrade(&self) -> WeakDataProducer {
        WeakDataProducer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Ingest one message and fan it out to subscribed data consumers.
    ///
    /// Counters are updated whether or not anyone is subscribed.
    pub fn receive_message(
        &self,
        ppid: u32,
        payload: Bytes,
        subchannels: Option<Vec<u16>>,
        required_subchannel: Option<u16>,
    ) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        self.inner.messages_received.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_received
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        if let Some(router) = self.inner.router.upgrade() {
            router.on_transport_data_producer_message_received(
                &self.inner.id,
                ppid,
                &payload,
                subchannels.as_deref(),
                required_subchannel,
            );
        }
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn dump(&self) -> Result<Option<Value>, RequestError> {
        debug!("dump()");

        to_response_data(&DataProducerDump {
            id: self.inner.id.clone(),
            r#type: self.inner.r#type,
            sctp_stream_parameters: self.inner.sctp_stream_parameters,
            label: self.inner.label.clone(),
            protocol: self.inner.protocol.clone(),
        })
    }

    pub(crate) fn stats(&self) -> DataProducerStat {
        DataProducerStat {
            label: self.inner.label.clone(),
            protocol: self.inner.protocol.clone(),
            messages_received: self.messages_received(),
            bytes_received: self.bytes_received(),
        }
    }

    /// Callback is called when the data producer is closed for whatever
    /// reason.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }
}
