//! A data consumer forwards messages of its bound data producer over its own
//! transport, with optional subchannel filtering and outbound buffer
//! monitoring.

use crate::channel::RequestError;
use crate::messages::to_response_data;
use crate::router::data_producer::DataProducerId;
use crate::router::transport::WeakTransport;
use crate::sctp_parameters::SctpStreamParameters;
use crate::string_based_wrapper_type;
use bytes::Bytes;
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use hash_hasher::HashedSet;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

string_based_wrapper_type!(
    /// [`DataConsumer`] identifier.
    DataConsumerId
);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataConsumerType {
    /// Messages leave over the transport's SCTP association.
    Sctp,
    /// Messages leave through the payload channel.
    Direct,
}

/// Creation data of a data consumer, as sent by the controller.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConsumerOptions {
    /// The id of the data producer to consume.
    pub data_producer_id: DataProducerId,
    pub r#type: DataConsumerType,
    /// Required for SCTP data consumers (the outbound stream).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub protocol: String,
    /// Subscribed subchannels; an empty set receives untagged messages only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subchannels: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DataConsumerDump {
    pub id: DataConsumerId,
    pub data_producer_id: DataProducerId,
    pub r#type: DataConsumerType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sctp_stream_parameters: Option<SctpStreamParameters>,
    pub label: String,
    pub protocol: String,
    pub subchannels: Vec<u16>,
    pub buffered_amount_low_threshold: u32,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConsumerStat {
    pub label: String,
    pub protocol: String,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub buffered_amount: u32,
}

#[derive(Default)]
struct Handlers {
    message: Bag<Arc<dyn Fn(u32, &Bytes) + Send + Sync>>,
    buffered_amount_low: Bag<Arc<dyn Fn(u32) + Send + Sync>>,
    data_producer_close: BagOnce<Box<dyn FnOnce() + Send>>,
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

pub(crate) struct Inner {
    id: DataConsumerId,
    data_producer_id: DataProducerId,
    r#type: DataConsumerType,
    sctp_stream_parameters: Option<SctpStreamParameters>,
    label: String,
    protocol: String,
    subchannels: Mutex<HashedSet<u16>>,
    buffered_amount: AtomicU32,
    buffered_amount_low_threshold: AtomicU32,
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    transport: WeakTransport,
    handlers: Handlers,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("drop()");

        self.handlers.close.call_simple();
    }
}

/// A subscriber of one data producer within a router.
#[derive(Clone)]
pub struct DataConsumer {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakDataConsumer {
    inner: Weak<Inner>,
}

impl WeakDataConsumer {
    pub(crate) fn upgrade(&self) -> Option<DataConsumer> {
        Some(DataConsumer {
            inner: self.inner.upgrade()?,
        })
    }
}

impl DataConsumer {
    pub(crate) fn new(
        id: DataConsumerId,
        options: DataConsumerOptions,
        transport: WeakTransport,
    ) -> Result<Self, RequestError> {
        debug!("new()");

        let DataConsumerOptions {
            data_producer_id,
            r#type,
            sctp_stream_parameters,
            label,
            protocol,
            subchannels,
        } = options;

        if r#type == DataConsumerType::Sctp && sctp_stream_parameters.is_none() {
            return Err(RequestError::TypeError(
                "sctpStreamParameters are required for SCTP data consumers".into(),
            ));
        }

        let inner = Arc::new(Inner {
            id,
            data_producer_id,
            r#type,
            sctp_stream_parameters,
            label,
            protocol,
            subchannels: Mutex::new(subchannels.into_iter().collect()),
            buffered_amount: AtomicU32::new(0),
            buffered_amount_low_threshold: AtomicU32::new(0),
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            transport,
            handlers: Handlers::default(),
            closed: AtomicBool::new(false),
        });

        Ok(Self { inner })
    }

    /// DataConsumer identifier.
    pub fn id(&self) -> &DataConsumerId {
        &self.inner.id
    }

    /// Bound data producer id.
    pub fn data_producer_id(&self) -> &DataProducerId {
        &self.inner.data_producer_id
    }

    /// DataConsumer type.
    pub fn r#type(&self) -> DataConsumerType {
        self.inner.r#type
    }

    /// SCTP stream parameters (absent for direct data consumers).
    pub fn sctp_stream_parameters(&self) -> Option<SctpStreamParameters> {
        self.inner.sctp_stream_parameters
    }

    /// DataChannel label (mirrored from the data producer).
    pub fn label(&self) -> &String {
        &self.inner.label
    }

    /// DataChannel sub-protocol (mirrored from the data producer).
    pub fn protocol(&self) -> &String {
        &self.inner.protocol
    }

    /// Whether the data consumer is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Outbound buffered amount as last reported by the driver.
    pub fn buffered_amount(&self) -> u32 {
        self.inner.buffered_amount.load(Ordering::SeqCst)
    }

    pub(crate) fn downgrade(&self) -> WeakDataConsumer {
        WeakDataConsumer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Forward one message from the bound data producer.
    ///
    /// A message tagged with subchannels is delivered only when this consumer
    /// subscribes to at least one of them (and to the required one, when
    /// present); untagged messages are delivered to everyone.
    pub(crate) fn send_message(
        &self,
        ppid: u32,
        payload: &Bytes,
        subchannels: Option<&[u16]>,
        required_subchannel: Option<u16>,
    ) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        {
            let subscribed = self.inner.subchannels.lock();
            if let Some(required) = required_subchannel {
                if !subscribed.contains(&required) {
                    return;
                }
            }
            if let Some(tags) = subchannels {
                if !tags.iter().any(|tag| subscribed.contains(tag)) {
                    return;
                }
            }
        }

        self.inner.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_sent
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        self.inner.handlers.message.call(|callback| {
            callback(ppid, payload);
        });

        if let Some(transport) = self.inner.transport.upgrade() {
            transport.send_sctp_message_for_data_consumer(
                &self.inner.id,
                self.inner.sctp_stream_parameters,
                ppid,
                payload,
            );
        }
    }

    /// Driver-reported outbound buffer level for this consumer's stream.
    pub(crate) fn update_buffered_amount(&self, buffered_amount: u32) {
        let previous = self
            .inner
            .buffered_amount
            .swap(buffered_amount, Ordering::SeqCst);
        let threshold = self
            .inner
            .buffered_amount_low_threshold
            .load(Ordering::SeqCst);

        if previous > threshold && buffered_amount <= threshold {
            self.inner.handlers.buffered_amount_low.call(|callback| {
                callback(buffered_amount);
            });
            if let Some(transport) = self.inner.transport.upgrade() {
                transport.notify_for(
                    self.inner.id.as_str(),
                    "bufferedamountlow",
                    serde_json::json!({ "bufferedAmount": buffered_amount }),
                );
            }
        }
    }

    pub(crate) fn set_buffered_amount_low_threshold(&self, threshold: u32) {
        self.inner
            .buffered_amount_low_threshold
            .store(threshold, Ordering::SeqCst);
    }

    pub(crate) fn set_subchannels(&self, subchannels: Vec<u16>) {
        *self.inner.subchannels.lock() = subchannels.into_iter().collect();
    }

    /// The bound data producer closed: self-destruct. The owning transport
    /// drops the consumer; router index cleanup is the caller's
    /// responsibility.
    pub(crate) fn data_producer_closed(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("data_producer_closed()");

        self.inner.handlers.data_producer_close.call_simple();

        if let Some(transport) = self.inner.transport.upgrade() {
            transport.notify_for(self.inner.id.as_str(), "dataproducerclose", Value::Null);
            transport.remove_data_consumer(&self.inner.id);
        }
    }

    pub(crate) fn mark_closed(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn dump(&self) -> Result<Option<Value>, RequestError> {
        debug!("dump()");

        let mut subchannels = self
            .inner
            .subchannels
            .lock()
            .iter()
            .copied()
            .collect::<Vec<_>>();
        subchannels.sort_unstable();

        to_response_data(&DataConsumerDump {
            id: self.inner.id.clone(),
            data_producer_id: self.inner.data_producer_id.clone(),
            r#type: self.inner.r#type,
            sctp_stream_parameters: self.inner.sctp_stream_parameters,
            label: self.inner.label.clone(),
            protocol: self.inner.protocol.clone(),
            subchannels,
            buffered_amount_low_threshold: self
                .inner
                .buffered_amount_low_threshold
                .load(Ordering::SeqCst),
        })
    }

    pub(crate) fn stats(&self) -> DataConsumerStat {
        DataConsumerStat {
            label: self.inner.label.clone(),
            protocol: self.inner.protocol.clone(),
            messages_sent: self.inner.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            buffered_amount: self.buffered_amount(),
        }
    }

    /// Callback is called for every message forwarded to the endpoint.
    pub fn on_message<F: Fn(u32, &Bytes) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.message.add(Arc::new(callback))
    }

    /// Callback is called when the outbound buffer drops to the configured
    /// threshold.
    pub fn on_buffered_amount_low<F: Fn(u32) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner
            .handlers
            .buffered_amount_low
            .add(Arc::new(callback))
    }

    /// Callback is called when the bound data producer closes.
    pub fn on_data_producer_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner
            .handlers
            .data_producer_close
            .add(Box::new(callback))
    }

    /// Callback is called when the data consumer is closed for whatever
    /// reason.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }
}
