//! A transport terminates one peer's network session and hosts its
//! producers, consumers and their data counterparts.
//!
//! This is the only component that talks to the [`TransportDriver`]
//! capability. Inbound packets are resolved to the owning producer by SSRC
//! (or RID), inbound messages to the owning data producer by SCTP stream id;
//! outbound traffic is offered by consumers. Everything else is delegated
//! upward to the router through its listener methods.

use crate::channel::{PayloadChannelNotification, RequestError, RequestResult};
use crate::data_structures::{
    DtlsParameters, DtlsRole, DtlsState, IceParameters, IceState, SctpState, TransportTuple,
};
use crate::messages::{parse_request_data, to_response_data, Internal, PayloadEvent, RequestMethod};
use crate::router::consumer::{Consumer, ConsumerId, ConsumerLayers, ConsumerOptions};
use crate::router::data_consumer::{DataConsumer, DataConsumerId, DataConsumerOptions};
use crate::router::data_producer::{DataProducer, DataProducerId, DataProducerOptions};
use crate::router::direct_transport::DirectTransportData;
use crate::router::pipe_transport::PipeTransportData;
use crate::router::plain_transport::PlainTransportData;
use crate::router::producer::{Producer, ProducerId, ProducerOptions, RtcpSenderReport};
use crate::router::webrtc_transport::WebRtcTransportData;
use crate::router::WeakRouter;
use crate::rtp_packet::RtpPacket;
use crate::rtp_parameters::MediaKind;
use crate::sctp_parameters::SctpStreamParameters;
use crate::srtp_parameters::SrtpParameters;
use crate::string_based_wrapper_type;
use crate::worker::WorkerContext;
use bytes::Bytes;
use event_listener_primitives::{BagOnce, HandlerId};
use hash_hasher::HashedMap;
use log::{debug, warn};
use nohash_hasher::IntMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

string_based_wrapper_type!(
    /// [`Transport`] identifier.
    TransportId
);

/// Error surfaced by a [`TransportDriver`] implementation.
#[derive(Debug, Error)]
pub enum TransportDriverError {
    /// DTLS/SRTP handshake or transform failure.
    #[error("crypto failure: {0}")]
    Crypto(String),
    /// The driver cannot perform the operation in its current state.
    #[error("{0}")]
    InvalidState(String),
    /// The driver does not implement the operation.
    #[error("operation not supported by this transport driver")]
    Unsupported,
}

impl From<TransportDriverError> for RequestError {
    fn from(error: TransportDriverError) -> Self {
        match error {
            TransportDriverError::Crypto(message) => RequestError::CryptoError(message),
            TransportDriverError::InvalidState(message) => RequestError::IllegalState(message),
            TransportDriverError::Unsupported => {
                RequestError::IllegalState("operation not supported by this transport".into())
            }
        }
    }
}

/// Remote-side parameters handed to the driver on `transport.connect`.
#[derive(Debug, Clone)]
pub enum TransportRemoteParameters {
    WebRtc {
        dtls_parameters: DtlsParameters,
    },
    Plain {
        ip: IpAddr,
        port: u16,
        rtcp_port: Option<u16>,
        srtp_parameters: Option<SrtpParameters>,
    },
    Pipe {
        ip: IpAddr,
        port: u16,
        srtp_parameters: Option<SrtpParameters>,
    },
}

/// Wire-level session capability consumed by a transport.
///
/// Implementations own sockets, ICE, DTLS, SRTP and SCTP packetization. All
/// callbacks into the core must be marshaled onto the worker's event loop.
pub trait TransportDriver: Send + Sync {
    /// Apply the remote side's parameters; returns the resulting transport
    /// tuple when the driver knows it.
    fn connect(
        &self,
        parameters: &TransportRemoteParameters,
    ) -> Result<Option<TransportTuple>, TransportDriverError>;

    /// Transmit one RTP packet to the peer.
    fn send_rtp_packet(&self, packet: &RtpPacket);

    /// Transmit one SCTP message to the peer.
    fn send_sctp_message(&self, stream_id: u16, ppid: u32, payload: &Bytes);

    /// Send a PLI/FIR upstream asking the peer for a keyframe on `ssrc`.
    fn request_key_frame(&self, ssrc: u32);

    /// Local ICE parameters of the session, when ICE is used.
    fn ice_parameters(&self) -> Option<IceParameters> {
        None
    }

    /// Generate fresh ICE credentials.
    fn restart_ice(&self) -> Result<IceParameters, TransportDriverError> {
        Err(TransportDriverError::Unsupported)
    }

    /// Congestion-control hook; the core never allocates bitrate itself.
    fn set_max_incoming_bitrate(&self, _bitrate: u32) {}

    /// Release sockets and associations.
    fn close(&self) {}
}

/// Driver allocation requests, one per transport kind that owns a session.
#[derive(Debug, Clone)]
pub enum TransportDriverOptions<'a> {
    WebRtc(&'a crate::router::webrtc_transport::WebRtcTransportOptions),
    Plain(&'a crate::router::plain_transport::PlainTransportOptions),
    Pipe(&'a crate::router::pipe_transport::PipeTransportOptions),
}

/// Capability that allocates a [`TransportDriver`] session when a transport
/// is created. Not called for DIRECT transports.
pub trait TransportDriverFactory: Send + Sync {
    fn create_driver(
        &self,
        transport_id: &TransportId,
        options: &TransportDriverOptions<'_>,
    ) -> Result<Arc<dyn TransportDriver>, TransportDriverError>;
}

pub(crate) enum TransportVariant {
    WebRtc(WebRtcTransportData),
    Plain(PlainTransportData),
    Pipe(PipeTransportData),
    Direct(DirectTransportData),
}

impl TransportVariant {
    fn kind(&self) -> &'static str {
        match self {
            TransportVariant::WebRtc(_) => "webrtc",
            TransportVariant::Plain(_) => "plain",
            TransportVariant::Pipe(_) => "pipe",
            TransportVariant::Direct(_) => "direct",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TransportDump {
    pub id: TransportId,
    pub kind: String,
    pub producer_ids: Vec<ProducerId>,
    pub consumer_ids: Vec<ConsumerId>,
    pub data_producer_ids: Vec<DataProducerId>,
    pub data_consumer_ids: Vec<DataConsumerId>,
    /// Inbound SSRC to producer id.
    pub rtp_listener: BTreeMap<String, ProducerId>,
    /// Inbound SCTP stream id to data producer id.
    pub sctp_listener: BTreeMap<String, DataProducerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_parameters: Option<IceParameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_state: Option<IceState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtls_state: Option<DtlsState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tuple: Option<TransportTuple>,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct TransportStat {
    pub transport_id: TransportId,
    pub timestamp: u64,
    pub recv_rtp_packet_count: u64,
    pub ignored_rtp_packet_count: u64,
    pub sent_rtp_packet_count: u64,
    pub recv_sctp_message_count: u64,
    pub sent_sctp_message_count: u64,
    pub max_incoming_bitrate: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectWebRtcData {
    dtls_parameters: DtlsParameters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectPlainData {
    ip: IpAddr,
    port: u16,
    #[serde(default)]
    rtcp_port: Option<u16>,
    #[serde(default)]
    srtp_parameters: Option<SrtpParameters>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectPipeData {
    ip: IpAddr,
    port: u16,
    #[serde(default)]
    srtp_parameters: Option<SrtpParameters>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetMaxIncomingBitrateData {
    bitrate: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetPriorityData {
    priority: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetBufferedAmountLowThresholdData {
    threshold: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetSubchannelsData {
    subchannels: Vec<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataProducerSendData {
    ppid: u32,
    #[serde(default)]
    subchannels: Option<Vec<u16>>,
    #[serde(default)]
    required_subchannel: Option<u16>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProduceResponse {
    r#type: crate::router::producer::ProducerType,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeResponse {
    paused: bool,
    producer_paused: bool,
    score: crate::router::consumer::ConsumerScore,
    #[serde(skip_serializing_if = "Option::is_none")]
    preferred_layers: Option<ConsumerLayers>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProduceDataResponse {
    r#type: crate::router::data_producer::DataProducerType,
    #[serde(skip_serializing_if = "Option::is_none")]
    sctp_stream_parameters: Option<SctpStreamParameters>,
    label: String,
    protocol: String,
}

#[derive(Default)]
struct Handlers {
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

pub(crate) struct Inner {
    id: TransportId,
    variant: TransportVariant,
    driver: Option<Arc<dyn TransportDriver>>,
    producers: Mutex<HashedMap<ProducerId, Producer>>,
    consumers: Mutex<HashedMap<ConsumerId, Consumer>>,
    data_producers: Mutex<HashedMap<DataProducerId, DataProducer>>,
    data_consumers: Mutex<HashedMap<DataConsumerId, DataConsumer>>,
    /// Inbound SSRC (media and RTX) to producer.
    rtp_listener: Mutex<IntMap<u32, ProducerId>>,
    /// Inbound RID to producer, for simulcast streams without declared SSRCs.
    rid_listener: Mutex<HashedMap<String, ProducerId>>,
    /// Outbound SSRC to consumer, for RTCP feedback resolution.
    ssrc_consumer: Mutex<IntMap<u32, ConsumerId>>,
    /// Inbound SCTP stream id to data producer.
    sctp_listener: Mutex<IntMap<u16, DataProducerId>>,
    sctp_state: Mutex<Option<SctpState>>,
    max_incoming_bitrate: AtomicU32,
    recv_rtp_packets: AtomicU64,
    ignored_rtp_packets: AtomicU64,
    sent_rtp_packets: AtomicU64,
    recv_sctp_messages: AtomicU64,
    sent_sctp_messages: AtomicU64,
    context: Arc<WorkerContext>,
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

/// One peer's session within a router.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakTransport {
    inner: Weak<Inner>,
}

impl WeakTransport {
    pub(crate) fn upgrade(&self) -> Option<Transport> {
        Some(Transport {
            inner: self.inner.upgrade()?,
        })
    }
}

impl Transport {
    pub(crate) fn new(
        id: TransportId,
        variant: TransportVariant,
        driver: Option<Arc<dyn TransportDriver>>,
        context: Arc<WorkerContext>,
        router: WeakRouter,
    ) -> Self {
        debug!("new()");

        Self {
            inner: Arc::new(Inner {
                id,
                variant,
                driver,
                producers: Mutex::default(),
                consumers: Mutex::default(),
                data_producers: Mutex::default(),
                data_consumers: Mutex::default(),
                rtp_listener: Mutex::default(),
                rid_listener: Mutex::default(),
                ssrc_consumer: Mutex::default(),
                sctp_listener: Mutex::default(),
                sctp_state: Mutex::default(),
                max_incoming_bitrate: AtomicU32::new(0),
                recv_rtp_packets: AtomicU64::new(0),
                ignored_rtp_packets: AtomicU64::new(0),
                sent_rtp_packets: AtomicU64::new(0),
                recv_sctp_messages: AtomicU64::new(0),
                sent_sctp_messages: AtomicU64::new(0),
                context,
                router,
                handlers: Handlers::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Transport identifier.
    pub fn id(&self) -> &TransportId {
        &self.inner.id
    }

    /// Whether the transport is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Producer hosted on this transport.
    pub fn producer(&self, producer_id: &ProducerId) -> Option<Producer> {
        self.inner.producers.lock().get(producer_id).cloned()
    }

    /// Consumer hosted on this transport.
    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<Consumer> {
        self.inner.consumers.lock().get(consumer_id).cloned()
    }

    /// DataProducer hosted on this transport.
    pub fn data_producer(&self, data_producer_id: &DataProducerId) -> Option<DataProducer> {
        self.inner
            .data_producers
            .lock()
            .get(data_producer_id)
            .cloned()
    }

    /// DataConsumer hosted on this transport.
    pub fn data_consumer(&self, data_consumer_id: &DataConsumerId) -> Option<DataConsumer> {
        self.inner
            .data_consumers
            .lock()
            .get(data_consumer_id)
            .cloned()
    }

    /// Current ICE state (WebRTC transports).
    pub fn ice_state(&self) -> Option<IceState> {
        match &self.inner.variant {
            TransportVariant::WebRtc(data) => Some(*data.ice_state.lock()),
            _ => None,
        }
    }

    /// Current DTLS state (WebRTC transports).
    pub fn dtls_state(&self) -> Option<DtlsState> {
        match &self.inner.variant {
            TransportVariant::WebRtc(data) => Some(*data.dtls_state.lock()),
            _ => None,
        }
    }

    /// Remote DTLS parameters received in `connect` (WebRTC transports).
    pub fn dtls_remote_parameters(&self) -> Option<DtlsParameters> {
        match &self.inner.variant {
            TransportVariant::WebRtc(data) => data.dtls_remote_parameters.lock().clone(),
            _ => None,
        }
    }

    /// Current SCTP association state, when the driver has reported one.
    pub fn sctp_state(&self) -> Option<SctpState> {
        *self.inner.sctp_state.lock()
    }

    /// Transport tuple once known (plain and pipe transports).
    pub fn tuple(&self) -> Option<TransportTuple> {
        match &self.inner.variant {
            TransportVariant::Plain(data) => *data.tuple.lock(),
            TransportVariant::Pipe(data) => *data.tuple.lock(),
            _ => None,
        }
    }

    /// Whether an SCTP association is available for data entities.
    pub fn sctp_enabled(&self) -> bool {
        match &self.inner.variant {
            TransportVariant::WebRtc(data) => data.sctp_enabled,
            TransportVariant::Plain(data) => data.sctp_enabled,
            TransportVariant::Pipe(data) => data.sctp_enabled,
            TransportVariant::Direct(_) => false,
        }
    }

    /// Maximum accepted message size (direct transports).
    pub fn max_message_size(&self) -> Option<u32> {
        match &self.inner.variant {
            TransportVariant::Direct(data) => Some(data.max_message_size),
            _ => None,
        }
    }

    /// Local ICE role (WebRTC transports; always the controlled side).
    pub fn ice_role(&self) -> Option<crate::data_structures::IceRole> {
        match &self.inner.variant {
            TransportVariant::WebRtc(data) => Some(data.ice_role),
            _ => None,
        }
    }

    /// Local ICE username fragment, for listen-server demultiplexing.
    pub fn ice_username_fragment(&self) -> Option<String> {
        match &self.inner.variant {
            TransportVariant::WebRtc(data) => data
                .ice_parameters
                .lock()
                .as_ref()
                .map(|parameters| parameters.username_fragment.clone()),
            _ => None,
        }
    }

    pub(crate) fn downgrade(&self) -> WeakTransport {
        WeakTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn set_web_rtc_server(&self, server: crate::webrtc_server::WeakWebRtcServer) {
        if let TransportVariant::WebRtc(data) = &self.inner.variant {
            data.web_rtc_server.lock().replace(server);
        }
    }

    /// Callback is called when the transport is closed for whatever reason.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }

    // ===== Control plane =====

    /// Handle a request addressed to this transport or one of its children.
    pub(crate) fn handle_request(
        &self,
        method: RequestMethod,
        internal: &Internal,
        data: &Value,
    ) -> RequestResult {
        match method {
            RequestMethod::TransportDump => to_response_data(&self.dump_data()),
            RequestMethod::TransportGetStats => to_response_data(&vec![self.stats()]),
            RequestMethod::TransportConnect => self.connect(data),
            RequestMethod::TransportRestartIce => self.restart_ice(),
            RequestMethod::TransportSetMaxIncomingBitrate => {
                let SetMaxIncomingBitrateData { bitrate } = parse_request_data(data)?;
                self.inner
                    .max_incoming_bitrate
                    .store(bitrate, Ordering::SeqCst);
                if let Some(driver) = &self.inner.driver {
                    driver.set_max_incoming_bitrate(bitrate);
                }
                Ok(None)
            }
            RequestMethod::TransportProduce => self.produce(internal, data),
            RequestMethod::TransportConsume => self.consume(internal, data),
            RequestMethod::TransportProduceData => self.produce_data(internal, data),
            RequestMethod::TransportConsumeData => self.consume_data(internal, data),
            RequestMethod::ProducerClose => self.close_producer(internal),
            RequestMethod::ProducerDump => self.producer_from_internal(internal)?.dump(),
            RequestMethod::ProducerGetStats => {
                to_response_data(&self.producer_from_internal(internal)?.stats())
            }
            RequestMethod::ProducerPause => {
                self.producer_from_internal(internal)?.pause();
                Ok(None)
            }
            RequestMethod::ProducerResume => {
                self.producer_from_internal(internal)?.resume();
                Ok(None)
            }
            RequestMethod::ConsumerClose => self.close_consumer(internal),
            RequestMethod::ConsumerDump => self.consumer_from_internal(internal)?.dump(),
            RequestMethod::ConsumerGetStats => {
                to_response_data(&self.consumer_from_internal(internal)?.stats())
            }
            RequestMethod::ConsumerPause => {
                self.consumer_from_internal(internal)?.pause();
                Ok(None)
            }
            RequestMethod::ConsumerResume => {
                self.consumer_from_internal(internal)?.resume();
                Ok(None)
            }
            RequestMethod::ConsumerSetPreferredLayers => {
                let preferred: ConsumerLayers = parse_request_data(data)?;
                let applied = self
                    .consumer_from_internal(internal)?
                    .set_preferred_layers(preferred)?;
                to_response_data(&applied)
            }
            RequestMethod::ConsumerSetPriority => {
                let SetPriorityData { priority } = parse_request_data(data)?;
                self.consumer_from_internal(internal)?.set_priority(priority)?;
                Ok(None)
            }
            RequestMethod::ConsumerUnsetPriority => {
                self.consumer_from_internal(internal)?.unset_priority();
                Ok(None)
            }
            RequestMethod::ConsumerRequestKeyFrame => {
                self.consumer_from_internal(internal)?.request_key_frame();
                Ok(None)
            }
            RequestMethod::DataProducerClose => self.close_data_producer(internal),
            RequestMethod::DataProducerDump => self.data_producer_from_internal(internal)?.dump(),
            RequestMethod::DataProducerGetStats => {
                to_response_data(&vec![self.data_producer_from_internal(internal)?.stats()])
            }
            RequestMethod::DataConsumerClose => self.close_data_consumer(internal),
            RequestMethod::DataConsumerDump => self.data_consumer_from_internal(internal)?.dump(),
            RequestMethod::DataConsumerGetStats => {
                to_response_data(&vec![self.data_consumer_from_internal(internal)?.stats()])
            }
            RequestMethod::DataConsumerGetBufferedAmount => {
                let data_consumer = self.data_consumer_from_internal(internal)?;
                to_response_data(
                    &serde_json::json!({ "bufferedAmount": data_consumer.buffered_amount() }),
                )
            }
            RequestMethod::DataConsumerSetBufferedAmountLowThreshold => {
                let SetBufferedAmountLowThresholdData { threshold } = parse_request_data(data)?;
                self.data_consumer_from_internal(internal)?
                    .set_buffered_amount_low_threshold(threshold);
                Ok(None)
            }
            RequestMethod::DataConsumerSetSubchannels => {
                let SetSubchannelsData { subchannels } = parse_request_data(data)?;
                self.data_consumer_from_internal(internal)?
                    .set_subchannels(subchannels);
                Ok(None)
            }
            _ => Err(RequestError::InvalidRequest(format!(
                "unhandled method {} for transport",
                method.as_str()
            ))),
        }
    }

    /// Handle a payload-channel message addressed to one of the children.
    pub(crate) fn handle_payload_notification(
        &self,
        notification: &PayloadChannelNotification,
    ) -> Result<(), RequestError> {
        match notification.event {
            PayloadEvent::ProducerSend => {
                let producer = self.producer_from_internal(&notification.internal)?;
                let packet = self
                    .inner
                    .context
                    .rtp_packet_decoder
                    .decode(&notification.payload)
                    .map_err(|error| RequestError::TypeError(error.to_string()))?;
                producer.receive_rtp_packet(packet);
                Ok(())
            }
            PayloadEvent::DataProducerSend => {
                if let Some(max_message_size) = self.max_message_size() {
                    if notification.payload.len() > max_message_size as usize {
                        return Err(RequestError::TypeError(format!(
                            "message size exceeds maxMessageSize ({})",
                            max_message_size
                        )));
                    }
                }

                let data_producer = self.data_producer_from_internal(&notification.internal)?;
                let DataProducerSendData {
                    ppid,
                    subchannels,
                    required_subchannel,
                } = parse_request_data(&notification.data)?;
                data_producer.receive_message(
                    ppid,
                    notification.payload.clone(),
                    subchannels,
                    required_subchannel,
                );
                Ok(())
            }
        }
    }

    fn connect(&self, data: &Value) -> RequestResult {
        debug!("connect()");

        let driver = self.driver()?;

        match &self.inner.variant {
            TransportVariant::WebRtc(variant) => {
                {
                    let dtls_state = variant.dtls_state.lock();
                    if *dtls_state != DtlsState::New {
                        return Err(RequestError::IllegalState(
                            "connect() already called".into(),
                        ));
                    }
                }

                let ConnectWebRtcData { dtls_parameters } = parse_request_data(data)?;
                driver.connect(&TransportRemoteParameters::WebRtc {
                    dtls_parameters: dtls_parameters.clone(),
                })?;

                variant.dtls_remote_parameters.lock().replace(dtls_parameters);
                *variant.dtls_state.lock() = DtlsState::Connecting;

                to_response_data(&serde_json::json!({ "dtlsLocalRole": DtlsRole::Server }))
            }
            TransportVariant::Plain(variant) => {
                if variant.comedia {
                    return Err(RequestError::IllegalState(
                        "cannot call connect() when comedia mode is enabled".into(),
                    ));
                }
                if variant.connected.swap(true, Ordering::SeqCst) {
                    return Err(RequestError::IllegalState(
                        "connect() already called".into(),
                    ));
                }

                let ConnectPlainData {
                    ip,
                    port,
                    rtcp_port,
                    srtp_parameters,
                } = parse_request_data(data)?;
                let tuple = driver.connect(&TransportRemoteParameters::Plain {
                    ip,
                    port,
                    rtcp_port,
                    srtp_parameters,
                })?;
                *variant.tuple.lock() = tuple;

                to_response_data(&serde_json::json!({ "tuple": tuple }))
            }
            TransportVariant::Pipe(variant) => {
                if variant.connected.swap(true, Ordering::SeqCst) {
                    return Err(RequestError::IllegalState(
                        "connect() already called".into(),
                    ));
                }

                let ConnectPipeData {
                    ip,
                    port,
                    srtp_parameters,
                } = parse_request_data(data)?;
                if srtp_parameters.is_some() && !variant.srtp {
                    return Err(RequestError::TypeError(
                        "srtpParameters given but SRTP is not enabled".into(),
                    ));
                }
                let tuple = driver.connect(&TransportRemoteParameters::Pipe {
                    ip,
                    port,
                    srtp_parameters,
                })?;
                *variant.tuple.lock() = tuple;

                to_response_data(&serde_json::json!({ "tuple": tuple }))
            }
            TransportVariant::Direct(_) => Err(RequestError::IllegalState(
                "connect() is not valid for direct transports".into(),
            )),
        }
    }

    fn restart_ice(&self) -> RequestResult {
        debug!("restart_ice()");

        let variant = match &self.inner.variant {
            TransportVariant::WebRtc(variant) => variant,
            _ => {
                return Err(RequestError::IllegalState(
                    "restartIce() is only valid for WebRTC transports".into(),
                ));
            }
        };

        let driver = self.driver()?;
        let ice_parameters = driver.restart_ice().map_err(RequestError::from)?;

        let previous_ufrag = variant
            .ice_parameters
            .lock()
            .replace(ice_parameters.clone())
            .map(|parameters| parameters.username_fragment);

        // Re-register the new ufrag with the attached listen server.
        let server = variant
            .web_rtc_server
            .lock()
            .as_ref()
            .and_then(|server| server.upgrade());
        if let Some(server) = server {
            server.update_ice_username_fragment(
                &self.inner.id,
                previous_ufrag.as_deref(),
                &ice_parameters.username_fragment,
            );
        }

        to_response_data(&serde_json::json!({ "iceParameters": ice_parameters }))
    }

    fn produce(&self, internal: &Internal, data: &Value) -> RequestResult {
        debug!("produce()");

        let producer_id = internal.producer_id()?.clone();
        let options: ProducerOptions = parse_request_data(data)?;

        if matches!(self.inner.variant, TransportVariant::Pipe(_))
            && options.kind == MediaKind::Video
            && options.rtp_parameters.encodings.len() > 1
        {
            return Err(RequestError::TypeError(
                "pipe transports carry a single encoding per producer".into(),
            ));
        }

        // Pipe transports carry RTX only when enabled at creation.
        let with_rtx = match &self.inner.variant {
            TransportVariant::Pipe(variant) => variant.rtx,
            _ => true,
        };

        // Reserve the RTP listener entries first so a conflicting SSRC fails
        // before anything is registered.
        let mut ssrcs = Vec::new();
        let mut rids = Vec::new();
        for encoding in &options.rtp_parameters.encodings {
            if let Some(ssrc) = encoding.ssrc {
                ssrcs.push(ssrc);
            }
            if let Some(rtx) = &encoding.rtx {
                if with_rtx {
                    ssrcs.push(rtx.ssrc);
                }
            }
            if let Some(rid) = &encoding.rid {
                rids.push(rid.clone());
            }
        }

        {
            let rtp_listener = self.inner.rtp_listener.lock();
            if ssrcs.iter().any(|ssrc| rtp_listener.contains_key(ssrc)) {
                return Err(RequestError::TypeError(
                    "ssrc already exists in RTP listener".into(),
                ));
            }
        }
        {
            let rid_listener = self.inner.rid_listener.lock();
            if rids.iter().any(|rid| rid_listener.contains_key(rid)) {
                return Err(RequestError::TypeError(
                    "rid already exists in RTP listener".into(),
                ));
            }
        }

        let router = self.router()?;
        let producer = Producer::new(
            producer_id.clone(),
            options,
            Arc::clone(&self.inner.context),
            self.downgrade(),
            router.downgrade(),
        )?;

        // The router refuses duplicate producer ids; nothing was allocated in
        // that case.
        router.on_transport_new_producer(&producer)?;

        {
            let mut rtp_listener = self.inner.rtp_listener.lock();
            for ssrc in ssrcs {
                rtp_listener.insert(ssrc, producer_id.clone());
            }
        }
        {
            let mut rid_listener = self.inner.rid_listener.lock();
            for rid in rids {
                rid_listener.insert(rid, producer_id.clone());
            }
        }

        let response = ProduceResponse {
            r#type: producer.r#type(),
        };
        self.inner
            .producers
            .lock()
            .insert(producer_id, producer);

        to_response_data(&response)
    }

    fn consume(&self, internal: &Internal, data: &Value) -> RequestResult {
        debug!("consume()");

        let consumer_id = internal.consumer_id()?.clone();
        let options: ConsumerOptions = parse_request_data(data)?;

        let router = self.router()?;
        let producer = router.get_producer(&options.producer_id).ok_or_else(|| {
            RequestError::NotFound(format!(
                "producer with id \"{}\" not found",
                options.producer_id
            ))
        })?;

        let consumer = Consumer::new(
            consumer_id.clone(),
            options,
            producer.paused(),
            Arc::clone(&self.inner.context),
            self.downgrade(),
        )?;

        router.on_transport_new_consumer(&consumer)?;

        if let Some(ssrc) = consumer.outbound_ssrc() {
            self.inner
                .ssrc_consumer
                .lock()
                .insert(ssrc, consumer_id.clone());
        }

        let response = ConsumeResponse {
            paused: consumer.paused(),
            producer_paused: consumer.producer_paused(),
            score: consumer.score(),
            preferred_layers: consumer.preferred_layers(),
        };

        let request_key_frame =
            consumer.kind() == MediaKind::Video && !consumer.paused() && !consumer.producer_paused();
        self.inner
            .consumers
            .lock()
            .insert(consumer_id, consumer.clone());

        if request_key_frame {
            consumer.request_key_frame();
        }

        to_response_data(&response)
    }

    fn produce_data(&self, internal: &Internal, data: &Value) -> RequestResult {
        debug!("produce_data()");

        let data_producer_id = internal.data_producer_id()?.clone();
        let options: DataProducerOptions = parse_request_data(data)?;

        let expects_direct = matches!(self.inner.variant, TransportVariant::Direct(_));
        let is_direct = options.r#type == crate::router::data_producer::DataProducerType::Direct;
        if expects_direct != is_direct {
            return Err(RequestError::TypeError(format!(
                "data producer type \"{}\" does not match the transport",
                if is_direct { "direct" } else { "sctp" }
            )));
        }
        if !is_direct && !self.sctp_enabled() {
            return Err(RequestError::IllegalState(
                "SCTP is not enabled on this transport".into(),
            ));
        }

        let stream_id = options
            .sctp_stream_parameters
            .as_ref()
            .map(|parameters| parameters.stream_id);
        if let Some(stream_id) = stream_id {
            let sctp_listener = self.inner.sctp_listener.lock();
            if sctp_listener.contains_key(&stream_id) {
                return Err(RequestError::TypeError(
                    "streamId already exists in SCTP listener".into(),
                ));
            }
        }

        let router = self.router()?;
        let data_producer =
            DataProducer::new(data_producer_id.clone(), options, router.downgrade())?;

        router.on_transport_new_data_producer(&data_producer)?;

        if let Some(stream_id) = stream_id {
            self.inner
                .sctp_listener
                .lock()
                .insert(stream_id, data_producer_id.clone());
        }

        let response = ProduceDataResponse {
            r#type: data_producer.r#type(),
            sctp_stream_parameters: data_producer.sctp_stream_parameters(),
            label: data_producer.label().clone(),
            protocol: data_producer.protocol().clone(),
        };
        self.inner
            .data_producers
            .lock()
            .insert(data_producer_id, data_producer);

        to_response_data(&response)
    }

    fn consume_data(&self, internal: &Internal, data: &Value) -> RequestResult {
        debug!("consume_data()");

        let data_consumer_id = internal.data_consumer_id()?.clone();
        let options: DataConsumerOptions = parse_request_data(data)?;

        let expects_direct = matches!(self.inner.variant, TransportVariant::Direct(_));
        let is_direct = options.r#type == crate::router::data_consumer::DataConsumerType::Direct;
        if expects_direct != is_direct {
            return Err(RequestError::TypeError(format!(
                "data consumer type \"{}\" does not match the transport",
                if is_direct { "direct" } else { "sctp" }
            )));
        }
        if !is_direct && !self.sctp_enabled() {
            return Err(RequestError::IllegalState(
                "SCTP is not enabled on this transport".into(),
            ));
        }

        let router = self.router()?;
        let data_consumer =
            DataConsumer::new(data_consumer_id.clone(), options, self.downgrade())?;

        router.on_transport_new_data_consumer(&data_consumer)?;

        let response = ProduceDataResponse {
            r#type: match data_consumer.r#type() {
                crate::router::data_consumer::DataConsumerType::Sctp => {
                    crate::router::data_producer::DataProducerType::Sctp
                }
                crate::router::data_consumer::DataConsumerType::Direct => {
                    crate::router::data_producer::DataProducerType::Direct
                }
            },
            sctp_stream_parameters: data_consumer.sctp_stream_parameters(),
            label: data_consumer.label().clone(),
            protocol: data_consumer.protocol().clone(),
        };
        self.inner
            .data_consumers
            .lock()
            .insert(data_consumer_id, data_consumer);

        to_response_data(&response)
    }

    fn close_producer(&self, internal: &Internal) -> RequestResult {
        debug!("close_producer()");

        let producer_id = internal.producer_id()?;
        // Closing an already-closed entity is a no-op returning success.
        let producer = match self.inner.producers.lock().remove(producer_id) {
            Some(producer) => producer,
            None => return Ok(None),
        };

        self.unregister_producer_listeners(producer_id);

        if producer.mark_closed() {
            if let Ok(router) = self.router() {
                router.on_transport_producer_closed(&producer);
            }
        }

        Ok(None)
    }

    fn close_consumer(&self, internal: &Internal) -> RequestResult {
        debug!("close_consumer()");

        let consumer_id = internal.consumer_id()?;
        let consumer = match self.inner.consumers.lock().remove(consumer_id) {
            Some(consumer) => consumer,
            None => return Ok(None),
        };

        self.unregister_consumer_ssrcs(consumer_id);

        if consumer.mark_closed() {
            if let Ok(router) = self.router() {
                router.on_transport_consumer_closed(consumer_id);
            }
        }

        Ok(None)
    }

    fn close_data_producer(&self, internal: &Internal) -> RequestResult {
        debug!("close_data_producer()");

        let data_producer_id = internal.data_producer_id()?;
        let data_producer = match self.inner.data_producers.lock().remove(data_producer_id) {
            Some(data_producer) => data_producer,
            None => return Ok(None),
        };

        self.inner
            .sctp_listener
            .lock()
            .retain(|_, id| id != data_producer_id);

        if data_producer.mark_closed() {
            if let Ok(router) = self.router() {
                router.on_transport_data_producer_closed(&data_producer);
            }
        }

        Ok(None)
    }

    fn close_data_consumer(&self, internal: &Internal) -> RequestResult {
        debug!("close_data_consumer()");

        let data_consumer_id = internal.data_consumer_id()?;
        let data_consumer = match self.inner.data_consumers.lock().remove(data_consumer_id) {
            Some(data_consumer) => data_consumer,
            None => return Ok(None),
        };

        if data_consumer.mark_closed() {
            if let Ok(router) = self.router() {
                router.on_transport_data_consumer_closed(data_consumer_id);
            }
        }

        Ok(None)
    }

    // ===== Driver events =====

    /// Raw RTP bytes from the wire; decoded through the decoder capability.
    pub fn receive_rtp_data(&self, data: &[u8]) {
        match self.inner.context.rtp_packet_decoder.decode(data) {
            Ok(packet) => self.receive_rtp_packet(packet),
            Err(error) => {
                self.inner.ignored_rtp_packets.fetch_add(1, Ordering::Relaxed);
                warn!("receive_rtp_data() | {}", error);
            }
        }
    }

    /// One decoded RTP packet from the wire, resolved to the owning producer
    /// by SSRC (or RID for simulcast streams without declared SSRCs).
    pub fn receive_rtp_packet(&self, packet: RtpPacket) {
        if self.closed() {
            return;
        }

        self.inner.recv_rtp_packets.fetch_add(1, Ordering::Relaxed);

        let producer_id = {
            let rtp_listener = self.inner.rtp_listener.lock();
            rtp_listener.get(&packet.ssrc).cloned()
        };

        let producer_id = match producer_id {
            Some(producer_id) => Some(producer_id),
            None => match &packet.rid {
                Some(rid) => {
                    let producer_id = self.inner.rid_listener.lock().get(rid).cloned();
                    if let Some(producer_id) = &producer_id {
                        // Learn the SSRC so the next packets resolve directly.
                        self.inner
                            .rtp_listener
                            .lock()
                            .insert(packet.ssrc, producer_id.clone());
                    }
                    producer_id
                }
                None => None,
            },
        };

        let producer = producer_id.and_then(|producer_id| self.producer(&producer_id));

        match producer {
            Some(producer) => producer.receive_rtp_packet(packet),
            None => {
                self.inner.ignored_rtp_packets.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "receive_rtp_packet() | no producer for ssrc {}",
                    packet.ssrc
                );
            }
        }
    }

    /// One SCTP message from the wire, resolved by stream id.
    pub fn receive_sctp_message(&self, stream_id: u16, ppid: u32, payload: Bytes) {
        if self.closed() {
            return;
        }

        self.inner.recv_sctp_messages.fetch_add(1, Ordering::Relaxed);

        let data_producer = self
            .inner
            .sctp_listener
            .lock()
            .get(&stream_id)
            .cloned()
            .and_then(|data_producer_id| self.data_producer(&data_producer_id));

        match data_producer {
            Some(data_producer) => data_producer.receive_message(ppid, payload, None, None),
            None => {
                warn!(
                    "receive_sctp_message() | no data producer for stream {}",
                    stream_id
                );
            }
        }
    }

    /// RTCP sender report from the publishing endpoint.
    pub fn receive_rtcp_sender_report(&self, report: RtcpSenderReport) {
        let producer = self
            .inner
            .rtp_listener
            .lock()
            .get(&report.ssrc)
            .cloned()
            .and_then(|producer_id| self.producer(&producer_id));

        if let Some(producer) = producer {
            producer.receive_rtcp_sender_report(report);
        }
    }

    /// RTCP receiver report from the consuming endpoint about one of our
    /// outbound streams.
    pub fn receive_rtcp_receiver_report(&self, ssrc: u32, fraction_lost: u8) {
        let consumer = self
            .inner
            .ssrc_consumer
            .lock()
            .get(&ssrc)
            .cloned()
            .and_then(|consumer_id| self.consumer(&consumer_id));

        if let Some(consumer) = consumer {
            consumer.receive_rtcp_receiver_report(fraction_lost);
        }
    }

    /// PLI/FIR from the consuming endpoint, resolved by outbound SSRC and
    /// forwarded to the producing side.
    pub fn receive_key_frame_request(&self, ssrc: u32) {
        let consumer = self
            .inner
            .ssrc_consumer
            .lock()
            .get(&ssrc)
            .cloned()
            .and_then(|consumer_id| self.consumer(&consumer_id));

        if let Some(consumer) = consumer {
            consumer.request_key_frame();
        }
    }

    /// ICE state change reported by the driver.
    pub fn on_ice_state_change(&self, ice_state: IceState) {
        if let TransportVariant::WebRtc(variant) = &self.inner.variant {
            *variant.ice_state.lock() = ice_state;
            self.notify_self("icestatechange", serde_json::json!({ "iceState": ice_state }));
        }
    }

    /// DTLS state change reported by the driver.
    pub fn on_dtls_state_change(&self, dtls_state: DtlsState) {
        if let TransportVariant::WebRtc(variant) = &self.inner.variant {
            *variant.dtls_state.lock() = dtls_state;
            self.notify_self(
                "dtlsstatechange",
                serde_json::json!({ "dtlsState": dtls_state }),
            );
        }
    }

    /// SCTP association state change reported by the driver.
    pub fn on_sctp_state_change(&self, sctp_state: SctpState) {
        self.inner.sctp_state.lock().replace(sctp_state);
        self.notify_self(
            "sctpstatechange",
            serde_json::json!({ "sctpState": sctp_state }),
        );
    }

    /// Outbound SCTP buffer level for one stream, reported by the driver.
    pub fn on_sctp_buffered_amount(&self, stream_id: u16, buffered_amount: u32) {
        let data_consumer = {
            let data_consumers = self.inner.data_consumers.lock();
            data_consumers
                .values()
                .find(|data_consumer| {
                    data_consumer
                        .sctp_stream_parameters()
                        .map(|parameters| parameters.stream_id == stream_id)
                        .unwrap_or_default()
                })
                .cloned()
        };

        if let Some(data_consumer) = data_consumer {
            data_consumer.update_buffered_amount(buffered_amount);
        }
    }

    // ===== Children plumbing =====

    /// Transmit a packet offered by one of our consumers.
    pub(crate) fn send_rtp_packet_for_consumer(&self, consumer_id: &ConsumerId, packet: RtpPacket) {
        if self.closed() {
            return;
        }

        self.inner.sent_rtp_packets.fetch_add(1, Ordering::Relaxed);

        match &self.inner.variant {
            TransportVariant::Direct(_) => {
                let data = serde_json::json!({
                    "ssrc": packet.ssrc,
                    "sequenceNumber": packet.sequence_number,
                    "timestamp": packet.timestamp,
                    "payloadType": packet.payload_type,
                    "marker": packet.marker,
                });
                self.inner.context.control.payload_notifications.notify(
                    consumer_id.as_str(),
                    "rtp",
                    data,
                    packet.payload,
                );
            }
            _ => {
                if let Some(driver) = &self.inner.driver {
                    driver.send_rtp_packet(&packet);
                }
            }
        }
    }

    /// Transmit a message offered by one of our data consumers.
    pub(crate) fn send_sctp_message_for_data_consumer(
        &self,
        data_consumer_id: &DataConsumerId,
        sctp_stream_parameters: Option<SctpStreamParameters>,
        ppid: u32,
        payload: &Bytes,
    ) {
        if self.closed() {
            return;
        }

        self.inner.sent_sctp_messages.fetch_add(1, Ordering::Relaxed);

        match &self.inner.variant {
            TransportVariant::Direct(_) => {
                self.inner.context.control.payload_notifications.notify(
                    data_consumer_id.as_str(),
                    "message",
                    serde_json::json!({ "ppid": ppid }),
                    payload.clone(),
                );
            }
            _ => {
                let stream_id = match sctp_stream_parameters {
                    Some(parameters) => parameters.stream_id,
                    None => {
                        warn!(
                            "send_sctp_message_for_data_consumer() | no stream for data consumer {}",
                            data_consumer_id
                        );
                        return;
                    }
                };
                if let Some(driver) = &self.inner.driver {
                    driver.send_sctp_message(stream_id, ppid, payload);
                }
            }
        }
    }

    /// Send a PLI/FIR toward the publishing endpoint of one of our producers.
    pub(crate) fn request_key_frame_upstream(&self, ssrc: u32) {
        if let Some(driver) = &self.inner.driver {
            driver.request_key_frame(ssrc);
        }
    }

    /// A consumer asks for a keyframe; resolved to the producing side through
    /// the router.
    pub(crate) fn on_consumer_key_frame_requested(
        &self,
        consumer_id: &ConsumerId,
        mapped_ssrc: u32,
    ) {
        if let Ok(router) = self.router() {
            router.on_transport_consumer_key_frame_requested(consumer_id, mapped_ssrc);
        }
    }

    /// Drop a consumer that destroyed itself because its producer closed.
    /// Router indices are cleaned up by the caller.
    pub(crate) fn remove_consumer(&self, consumer_id: &ConsumerId) {
        self.inner.consumers.lock().remove(consumer_id);
        self.unregister_consumer_ssrcs(consumer_id);
    }

    /// Drop a data consumer that destroyed itself because its data producer
    /// closed.
    pub(crate) fn remove_data_consumer(&self, data_consumer_id: &DataConsumerId) {
        self.inner.data_consumers.lock().remove(data_consumer_id);
    }

    /// Emit a notification on behalf of one of the children.
    pub(crate) fn notify_for(&self, target_id: &str, event: &'static str, data: Value) {
        self.inner
            .context
            .control
            .notifications
            .notify(target_id, event, data);
    }

    /// The listen server this transport was attached to closed; self-close
    /// and ask the router to drop us.
    pub(crate) fn listen_server_closed(&self) {
        if self.closed() {
            return;
        }

        debug!("listen_server_closed()");

        self.notify_self("listenserverclose", Value::Null);
        self.close();

        if let Ok(router) = self.router() {
            router.on_transport_listen_server_closed(&self.inner.id);
        }
    }

    /// Orderly teardown: producers first (their consumers elsewhere are told
    /// and self-destruct), then the remaining local children. Idempotent.
    pub(crate) fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("close()");

        let router = self.inner.router.upgrade();

        let producers = {
            let mut producers = self.inner.producers.lock();
            producers.drain().map(|(_, producer)| producer).collect::<Vec<_>>()
        };
        self.inner.rtp_listener.lock().clear();
        self.inner.rid_listener.lock().clear();
        for producer in producers {
            if producer.mark_closed() {
                if let Some(router) = &router {
                    router.on_transport_producer_closed(&producer);
                }
            }
        }

        let data_producers = {
            let mut data_producers = self.inner.data_producers.lock();
            data_producers
                .drain()
                .map(|(_, data_producer)| data_producer)
                .collect::<Vec<_>>()
        };
        self.inner.sctp_listener.lock().clear();
        for data_producer in data_producers {
            if data_producer.mark_closed() {
                if let Some(router) = &router {
                    router.on_transport_data_producer_closed(&data_producer);
                }
            }
        }

        let consumers = {
            let mut consumers = self.inner.consumers.lock();
            consumers.drain().map(|(_, consumer)| consumer).collect::<Vec<_>>()
        };
        self.inner.ssrc_consumer.lock().clear();
        for consumer in consumers {
            if consumer.mark_closed() {
                if let Some(router) = &router {
                    router.on_transport_consumer_closed(consumer.id());
                }
            }
        }

        let data_consumers = {
            let mut data_consumers = self.inner.data_consumers.lock();
            data_consumers
                .drain()
                .map(|(_, data_consumer)| data_consumer)
                .collect::<Vec<_>>()
        };
        for data_consumer in data_consumers {
            if data_consumer.mark_closed() {
                if let Some(router) = &router {
                    router.on_transport_data_consumer_closed(data_consumer.id());
                }
            }
        }

        if let Some(driver) = &self.inner.driver {
            driver.close();
        }

        // Detach from the shared listen server, if any.
        if let TransportVariant::WebRtc(variant) = &self.inner.variant {
            let server = variant
                .web_rtc_server
                .lock()
                .take()
                .and_then(|server| server.upgrade());
            if let Some(server) = server {
                server.unregister_web_rtc_transport(&self.inner.id);
            }
        }

        self.inner.handlers.close.call_simple();
    }

    pub(crate) fn dump_data(&self) -> TransportDump {
        let mut producer_ids = self.inner.producers.lock().keys().cloned().collect::<Vec<_>>();
        producer_ids.sort();
        let mut consumer_ids = self.inner.consumers.lock().keys().cloned().collect::<Vec<_>>();
        consumer_ids.sort();
        let mut data_producer_ids = self
            .inner
            .data_producers
            .lock()
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        data_producer_ids.sort();
        let mut data_consumer_ids = self
            .inner
            .data_consumers
            .lock()
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        data_consumer_ids.sort();

        let rtp_listener = self
            .inner
            .rtp_listener
            .lock()
            .iter()
            .map(|(ssrc, producer_id)| (ssrc.to_string(), producer_id.clone()))
            .collect();
        let sctp_listener = self
            .inner
            .sctp_listener
            .lock()
            .iter()
            .map(|(stream_id, data_producer_id)| (stream_id.to_string(), data_producer_id.clone()))
            .collect();

        let (ice_parameters, ice_state, dtls_state) = match &self.inner.variant {
            TransportVariant::WebRtc(variant) => (
                variant.ice_parameters.lock().clone(),
                Some(*variant.ice_state.lock()),
                Some(*variant.dtls_state.lock()),
            ),
            _ => (None, None, None),
        };
        let tuple = match &self.inner.variant {
            TransportVariant::Plain(variant) => *variant.tuple.lock(),
            TransportVariant::Pipe(variant) => *variant.tuple.lock(),
            _ => None,
        };

        TransportDump {
            id: self.inner.id.clone(),
            kind: self.inner.variant.kind().to_string(),
            producer_ids,
            consumer_ids,
            data_producer_ids,
            data_consumer_ids,
            rtp_listener,
            sctp_listener,
            ice_parameters,
            ice_state,
            dtls_state,
            tuple,
        }
    }

    pub(crate) fn stats(&self) -> TransportStat {
        TransportStat {
            transport_id: self.inner.id.clone(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis() as u64)
                .unwrap_or_default(),
            recv_rtp_packet_count: self.inner.recv_rtp_packets.load(Ordering::Relaxed),
            ignored_rtp_packet_count: self.inner.ignored_rtp_packets.load(Ordering::Relaxed),
            sent_rtp_packet_count: self.inner.sent_rtp_packets.load(Ordering::Relaxed),
            recv_sctp_message_count: self.inner.recv_sctp_messages.load(Ordering::Relaxed),
            sent_sctp_message_count: self.inner.sent_sctp_messages.load(Ordering::Relaxed),
            max_incoming_bitrate: self.inner.max_incoming_bitrate.load(Ordering::SeqCst),
        }
    }

    fn unregister_producer_listeners(&self, producer_id: &ProducerId) {
        self.inner
            .rtp_listener
            .lock()
            .retain(|_, id| id != producer_id);
        self.inner
            .rid_listener
            .lock()
            .retain(|_, id| id != producer_id);
    }

    fn unregister_consumer_ssrcs(&self, consumer_id: &ConsumerId) {
        self.inner
            .ssrc_consumer
            .lock()
            .retain(|_, id| id != consumer_id);
    }

    fn producer_from_internal(&self, internal: &Internal) -> Result<Producer, RequestError> {
        let producer_id = internal.producer_id()?;
        self.producer(producer_id)
            .ok_or_else(|| RequestError::NotFound(format!("producer with id \"{}\" not found", producer_id)))
    }

    fn consumer_from_internal(&self, internal: &Internal) -> Result<Consumer, RequestError> {
        let consumer_id = internal.consumer_id()?;
        self.consumer(consumer_id)
            .ok_or_else(|| RequestError::NotFound(format!("consumer with id \"{}\" not found", consumer_id)))
    }

    fn data_producer_from_internal(
        &self,
        internal: &Internal,
    ) -> Result<DataProducer, RequestError> {
        let data_producer_id = internal.data_producer_id()?;
        self.data_producer(data_producer_id).ok_or_else(|| {
            RequestError::NotFound(format!(
                "data producer with id \"{}\" not found",
                data_producer_id
            ))
        })
    }

    fn data_consumer_from_internal(
        &self,
        internal: &Internal,
    ) -> Result<DataConsumer, RequestError> {
        let data_consumer_id = internal.data_consumer_id()?;
        self.data_consumer(data_consumer_id).ok_or_else(|| {
            RequestError::NotFound(format!(
                "data consumer with id \"{}\" not found",
                data_consumer_id
            ))
        })
    }

    fn driver(&self) -> Result<&Arc<dyn TransportDriver>, RequestError> {
        self.inner.driver.as_ref().ok_or_else(|| {
            RequestError::IllegalState("transport has no driver session".into())
        })
    }

    fn router(&self) -> Result<crate::router::Router, RequestError> {
        self.inner
            .router
            .upgrade()
            .ok_or_else(|| RequestError::IllegalState("router is gone".into()))
    }

    fn notify_self(&self, event: &'static str, data: Value) {
        self.inner
            .context
            .control
            .notifications
            .notify(self.inner.id.as_str(), event, data);
    }
}
