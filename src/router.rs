//! A router is the routing domain: it owns transports and RTP observers,
//! indexes every producer and consumer living on them, and fans packets,
//! messages and feedback out across the subscription index.
//!
//! All index relations are non-owning back-pointers (weak handles) kept
//! consistent with the owned entities: a consumer appears in
//! `producer_consumers[p]` exactly when `consumer_producer[c] = p`, and both
//! sides are updated together.

pub mod active_speaker_observer;
pub mod audio_level_observer;
pub mod consumer;
pub mod data_consumer;
pub mod data_producer;
pub mod direct_transport;
pub mod pipe_transport;
pub mod plain_transport;
pub mod producer;
pub mod rtp_observer;
pub mod transport;
pub mod webrtc_transport;

use crate::channel::{PayloadChannelNotification, RequestError, RequestResult};
use crate::messages::{parse_request_data, to_response_data, Internal, RequestMethod};
use crate::router::active_speaker_observer::{ActiveSpeakerObserver, ActiveSpeakerObserverOptions};
use crate::router::audio_level_observer::{AudioLevelObserver, AudioLevelObserverOptions};
use crate::router::consumer::{Consumer, ConsumerId, WeakConsumer};
use crate::router::data_consumer::{DataConsumer, DataConsumerId, WeakDataConsumer};
use crate::router::data_producer::{DataProducer, DataProducerId, WeakDataProducer};
use crate::router::direct_transport::{DirectTransportData, DirectTransportOptions};
use crate::router::pipe_transport::{PipeTransportData, PipeTransportOptions};
use crate::router::plain_transport::{PlainTransportData, PlainTransportOptions};
use crate::router::producer::{Producer, ProducerId, WeakProducer};
use crate::router::rtp_observer::{RtpObserver, RtpObserverId, WeakRtpObserver};
use crate::router::transport::{Transport, TransportDriverOptions, TransportId, TransportVariant};
use crate::router::webrtc_transport::{WebRtcTransportData, WebRtcTransportOptions};
use crate::rtp_packet::RtpPacket;
use crate::string_based_wrapper_type;
use crate::webrtc_server::{WebRtcServer, WebRtcServerId};
use crate::worker::WorkerContext;
use bytes::Bytes;
use event_listener_primitives::{BagOnce, HandlerId};
use hash_hasher::HashedMap;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

string_based_wrapper_type!(
    /// [`Router`] identifier.
    RouterId
);

/// Capability the worker hands to each router for resolving shared listen
/// servers during WebRTC transport creation.
pub(crate) type WebRtcServerProvider =
    Box<dyn Fn(&WebRtcServerId) -> Option<WebRtcServer> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct RouterDump {
    pub id: RouterId,
    pub transport_ids: BTreeSet<TransportId>,
    pub rtp_observer_ids: BTreeSet<RtpObserverId>,
    pub map_producer_id_consumer_ids: BTreeMap<ProducerId, BTreeSet<ConsumerId>>,
    pub map_consumer_id_producer_id: BTreeMap<ConsumerId, ProducerId>,
    pub map_data_producer_id_data_consumer_ids: BTreeMap<DataProducerId, BTreeSet<DataConsumerId>>,
    pub map_data_consumer_id_data_producer_id: BTreeMap<DataConsumerId, DataProducerId>,
    pub map_producer_id_observer_ids: BTreeMap<ProducerId, BTreeSet<RtpObserverId>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddRemoveProducerData {
    producer_id: ProducerId,
}

#[derive(Default)]
struct Handlers {
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

pub(crate) struct Inner {
    id: RouterId,
    context: Arc<WorkerContext>,
    web_rtc_server_provider: WebRtcServerProvider,
    transports: Mutex<HashedMap<TransportId, Transport>>,
    rtp_observers: Mutex<HashedMap<RtpObserverId, RtpObserver>>,
    producers: Mutex<HashedMap<ProducerId, WeakProducer>>,
    data_producers: Mutex<HashedMap<DataProducerId, WeakDataProducer>>,
    // Subscription indices. Values keep insertion order so fan-out order is
    // deterministic.
    producer_consumers: Mutex<HashedMap<ProducerId, Vec<(ConsumerId, WeakConsumer)>>>,
    consumer_producer: Mutex<HashedMap<ConsumerId, ProducerId>>,
    data_producer_data_consumers:
        Mutex<HashedMap<DataProducerId, Vec<(DataConsumerId, WeakDataConsumer)>>>,
    data_consumer_data_producer: Mutex<HashedMap<DataConsumerId, DataProducerId>>,
    producer_rtp_observers: Mutex<HashedMap<ProducerId, Vec<(RtpObserverId, WeakRtpObserver)>>>,
    handlers: Handlers,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("drop()");

        self.handlers.close.call_simple();
    }
}

/// A routing domain; the unit of isolation between unrelated sessions.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakRouter {
    inner: Weak<Inner>,
}

impl WeakRouter {
    pub(crate) fn upgrade(&self) -> Option<Router> {
        Some(Router {
            inner: self.inner.upgrade()?,
        })
    }
}

impl Router {
    pub(crate) fn new(
        id: RouterId,
        context: Arc<WorkerContext>,
        web_rtc_server_provider: WebRtcServerProvider,
    ) -> Self {
        debug!("new()");

        Self {
            inner: Arc::new(Inner {
                id,
                context,
                web_rtc_server_provider,
                transports: Mutex::default(),
                rtp_observers: Mutex::default(),
                producers: Mutex::default(),
                data_producers: Mutex::default(),
                producer_consumers: Mutex::default(),
                consumer_producer: Mutex::default(),
                data_producer_data_consumers: Mutex::default(),
                data_consumer_data_producer: Mutex::default(),
                producer_rtp_observers: Mutex::default(),
                handlers: Handlers::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Router identifier.
    pub fn id(&self) -> &RouterId {
        &self.inner.id
    }

    /// Whether the router is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Transport owned by this router.
    pub fn transport(&self, transport_id: &TransportId) -> Option<Transport> {
        self.inner.transports.lock().get(transport_id).cloned()
    }

    /// RTP observer owned by this router.
    pub fn rtp_observer(&self, rtp_observer_id: &RtpObserverId) -> Option<RtpObserver> {
        self.inner.rtp_observers.lock().get(rtp_observer_id).cloned()
    }

    /// Producer living on any of this router's transports.
    pub fn get_producer(&self, producer_id: &ProducerId) -> Option<Producer> {
        self.inner.producers.lock().get(producer_id)?.upgrade()
    }

    /// DataProducer living on any of this router's transports.
    pub fn get_data_producer(&self, data_producer_id: &DataProducerId) -> Option<DataProducer> {
        self.inner
            .data_producers
            .lock()
            .get(data_producer_id)?
            .upgrade()
    }

    pub(crate) fn downgrade(&self) -> WeakRouter {
        WeakRouter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Callback is called when the router is closed for whatever reason.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }

    // ===== Control plane =====

    /// Handle a request addressed to this router or something inside it.
    pub(crate) fn handle_request(
        &self,
        method: RequestMethod,
        internal: &Internal,
        data: &Value,
    ) -> RequestResult {
        match method {
            RequestMethod::RouterDump => to_response_data(&self.dump_data()),
            RequestMethod::RouterCreateWebRtcTransport
            | RequestMethod::RouterCreatePlainTransport
            | RequestMethod::RouterCreatePipeTransport
            | RequestMethod::RouterCreateDirectTransport => {
                self.create_transport(method, internal, data)
            }
            RequestMethod::RouterCreateAudioLevelObserver
            | RequestMethod::RouterCreateActiveSpeakerObserver => {
                self.create_rtp_observer(method, internal, data)
            }
            RequestMethod::TransportClose => {
                let transport_id = internal.transport_id()?;
                // Closing an already-closed entity is a no-op returning
                // success.
                let transport = self.inner.transports.lock().remove(transport_id);
                if let Some(transport) = transport {
                    transport.close();
                }
                Ok(None)
            }
            RequestMethod::RtpObserverClose => {
                let rtp_observer_id = internal.rtp_observer_id()?;
                let rtp_observer = self.inner.rtp_observers.lock().remove(rtp_observer_id);
                if let Some(rtp_observer) = rtp_observer {
                    rtp_observer.mark_closed();
                    self.detach_rtp_observer_everywhere(rtp_observer_id);
                }
                Ok(None)
            }
            RequestMethod::RtpObserverPause => {
                self.rtp_observer_from_internal(internal)?.pause();
                Ok(None)
            }
            RequestMethod::RtpObserverResume => {
                self.rtp_observer_from_internal(internal)?.resume();
                Ok(None)
            }
            RequestMethod::RtpObserverAddProducer => {
                let rtp_observer = self.rtp_observer_from_internal(internal)?;
                let AddRemoveProducerData { producer_id } = parse_request_data(data)?;
                let producer = self.get_producer(&producer_id).ok_or_else(|| {
                    RequestError::NotFound(format!(
                        "producer with id \"{}\" not found",
                        producer_id
                    ))
                })?;

                rtp_observer.add_producer(&producer)?;

                let mut producer_rtp_observers = self.inner.producer_rtp_observers.lock();
                producer_rtp_observers
                    .entry(producer_id)
                    .or_default()
                    .push((rtp_observer.id().clone(), rtp_observer.downgrade()));

                Ok(None)
            }
            RequestMethod::RtpObserverRemoveProducer => {
                let rtp_observer = self.rtp_observer_from_internal(internal)?;
                let AddRemoveProducerData { producer_id } = parse_request_data(data)?;

                rtp_observer.remove_producer(&producer_id)?;

                let mut producer_rtp_observers = self.inner.producer_rtp_observers.lock();
                if let Some(observers) = producer_rtp_observers.get_mut(&producer_id) {
                    observers.retain(|(id, _)| id != rtp_observer.id());
                }

                Ok(None)
            }
            _ => {
                // Finer-addressed requests belong to a transport.
                let transport_id = internal.transport_id()?;
                let transport = self.transport(transport_id).ok_or_else(|| {
                    RequestError::NotFound(format!(
                        "transport with id \"{}\" not found",
                        transport_id
                    ))
                })?;

                transport.handle_request(method, internal, data)
            }
        }
    }

    /// Handle a payload-channel message addressed to something inside this
    /// router.
    pub(crate) fn handle_payload_notification(
        &self,
        notification: &PayloadChannelNotification,
    ) -> Result<(), RequestError> {
        let transport_id = notification.internal.transport_id()?;
        let transport = self.transport(transport_id).ok_or_else(|| {
            RequestError::NotFound(format!(
                "transport with id \"{}\" not found",
                transport_id
            ))
        })?;

        transport.handle_payload_notification(notification)
    }

    fn create_transport(
        &self,
        method: RequestMethod,
        internal: &Internal,
        data: &Value,
    ) -> RequestResult {
        let transport_id = internal.transport_id()?.clone();

        if self.inner.transports.lock().contains_key(&transport_id) {
            return Err(RequestError::DuplicateId(format!(
                "a transport with same id \"{}\" already exists",
                transport_id
            )));
        }

        let mut web_rtc_server = None;

        let (variant, driver) = match method {
            RequestMethod::RouterCreateWebRtcTransport => {
                let options: WebRtcTransportOptions = parse_request_data(data)?;

                if let Some(web_rtc_server_id) = &options.web_rtc_server_id {
                    // Shared listen server. Absence is a configuration error.
                    let server = (self.inner.web_rtc_server_provider)(web_rtc_server_id)
                        .ok_or_else(|| {
                            RequestError::TypeError(format!(
                                "webRtcServer with id \"{}\" not found",
                                web_rtc_server_id
                            ))
                        })?;
                    web_rtc_server = Some(server);
                } else if options.listen_ips.is_empty() {
                    return Err(RequestError::TypeError(
                        "missing listenIps or webRtcServerId".into(),
                    ));
                }

                let driver = self
                    .inner
                    .context
                    .transport_driver_factory
                    .create_driver(&transport_id, &TransportDriverOptions::WebRtc(&options))
                    .map_err(RequestError::from)?;
                let ice_parameters = driver.ice_parameters();

                (
                    TransportVariant::WebRtc(WebRtcTransportData::new(&options, ice_parameters)),
                    Some(driver),
                )
            }
            RequestMethod::RouterCreatePlainTransport => {
                let options: PlainTransportOptions = parse_request_data(data)?;
                let driver = self
                    .inner
                    .context
                    .transport_driver_factory
                    .create_driver(&transport_id, &TransportDriverOptions::Plain(&options))
                    .map_err(RequestError::from)?;

                (
                    TransportVariant::Plain(PlainTransportData::new(&options)),
                    Some(driver),
                )
            }
            RequestMethod::RouterCreatePipeTransport => {
                let options: PipeTransportOptions = parse_request_data(data)?;
                let driver = self
                    .inner
                    .context
                    .transport_driver_factory
                    .create_driver(&transport_id, &TransportDriverOptions::Pipe(&options))
                    .map_err(RequestError::from)?;

                (
                    TransportVariant::Pipe(PipeTransportData::new(&options)),
                    Some(driver),
                )
            }
            RequestMethod::RouterCreateDirectTransport => {
                let options: DirectTransportOptions = parse_request_data(data)?;

                (
                    TransportVariant::Direct(DirectTransportData {
                        max_message_size: options.max_message_size,
                    }),
                    None,
                )
            }
            _ => unreachable!("create_transport called with a non-create method"),
        };

        let transport = Transport::new(
            transport_id.clone(),
            variant,
            driver,
            Arc::clone(&self.inner.context),
            self.downgrade(),
        );

        if let Some(server) = web_rtc_server {
            transport.set_web_rtc_server(server.downgrade());
            server.register_web_rtc_transport(&transport);
        }

        let dump = transport.dump_data();
        self.inner
            .transports
            .lock()
            .insert(transport_id, transport);

        debug!("create_transport() | transport created [id:{}]", dump.id);

        to_response_data(&dump)
    }

    fn create_rtp_observer(
        &self,
        method: RequestMethod,
        internal: &Internal,
        data: &Value,
    ) -> RequestResult {
        let rtp_observer_id = internal.rtp_observer_id()?.clone();

        if self
            .inner
            .rtp_observers
            .lock()
            .contains_key(&rtp_observer_id)
        {
            return Err(RequestError::DuplicateId(format!(
                "an RtpObserver with same id \"{}\" already exists",
                rtp_observer_id
            )));
        }

        let rtp_observer = match method {
            RequestMethod::RouterCreateAudioLevelObserver => {
                let options: AudioLevelObserverOptions = parse_request_data(data)?;
                RtpObserver::AudioLevel(AudioLevelObserver::new(
                    rtp_observer_id.clone(),
                    options,
                    Arc::clone(&self.inner.context),
                )?)
            }
            RequestMethod::RouterCreateActiveSpeakerObserver => {
                let options: ActiveSpeakerObserverOptions = parse_request_data(data)?;
                RtpObserver::ActiveSpeaker(ActiveSpeakerObserver::new(
                    rtp_observer_id.clone(),
                    options,
                    Arc::clone(&self.inner.context),
                )?)
            }
            _ => unreachable!("create_rtp_observer called with a non-create method"),
        };

        self.inner
            .rtp_observers
            .lock()
            .insert(rtp_observer_id, rtp_observer);

        Ok(None)
    }

    /// Orderly teardown: every owned transport cascades, then observers are
    /// dropped. Idempotent.
    pub(crate) fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("close()");

        let transports = {
            let mut transports = self.inner.transports.lock();
            transports
                .drain()
                .map(|(_, transport)| transport)
                .collect::<Vec<_>>()
        };
        for transport in transports {
            transport.close();
        }

        let rtp_observers = {
            let mut rtp_observers = self.inner.rtp_observers.lock();
            rtp_observers
                .drain()
                .map(|(_, rtp_observer)| rtp_observer)
                .collect::<Vec<_>>()
        };
        for rtp_observer in rtp_observers {
            rtp_observer.mark_closed();
        }

        self.inner.producer_rtp_observers.lock().clear();
        self.inner.handlers.close.call_simple();
    }

    pub(crate) fn dump_data(&self) -> RouterDump {
        RouterDump {
            id: self.inner.id.clone(),
            transport_ids: self.inner.transports.lock().keys().cloned().collect(),
            rtp_observer_ids: self.inner.rtp_observers.lock().keys().cloned().collect(),
            map_producer_id_consumer_ids: self
                .inner
                .producer_consumers
                .lock()
                .iter()
                .map(|(producer_id, consumers)| {
                    (
                        producer_id.clone(),
                        consumers.iter().map(|(id, _)| id.clone()).collect(),
                    )
                })
                .collect(),
            map_consumer_id_producer_id: self
                .inner
                .consumer_producer
                .lock()
                .iter()
                .map(|(consumer_id, producer_id)| (consumer_id.clone(), producer_id.clone()))
                .collect(),
            map_data_producer_id_data_consumer_ids: self
                .inner
                .data_producer_data_consumers
                .lock()
                .iter()
                .map(|(data_producer_id, data_consumers)| {
                    (
                        data_producer_id.clone(),
                        data_consumers.iter().map(|(id, _)| id.clone()).collect(),
                    )
                })
                .collect(),
            map_data_consumer_id_data_producer_id: self
                .inner
                .data_consumer_data_producer
                .lock()
                .iter()
                .map(|(data_consumer_id, data_producer_id)| {
                    (data_consumer_id.clone(), data_producer_id.clone())
                })
                .collect(),
            map_producer_id_observer_ids: self
                .inner
                .producer_rtp_observers
                .lock()
                .iter()
                .map(|(producer_id, observers)| {
                    (
                        producer_id.clone(),
                        observers.iter().map(|(id, _)| id.clone()).collect(),
                    )
                })
                .collect(),
        }
    }

    // ===== Listener contract (upward from transports) =====

    /// A transport created a producer; index it. Fails on duplicate id, in
    /// which case the transport rejects the creation request.
    pub(crate) fn on_transport_new_producer(
        &self,
        producer: &Producer,
    ) -> Result<(), RequestError> {
        let mut producers = self.inner.producers.lock();
        if producers.contains_key(producer.id()) {
            return Err(RequestError::DuplicateId(format!(
                "a producer with same id \"{}\" already exists",
                producer.id()
            )));
        }
        producers.insert(producer.id().clone(), producer.downgrade());
        drop(producers);

        self.inner
            .producer_consumers
            .lock()
            .entry(producer.id().clone())
            .or_default();

        Ok(())
    }

    /// A producer is gone: destroy every subscribed consumer, detach every
    /// observer, then erase the indices.
    pub(crate) fn on_transport_producer_closed(&self, producer: &Producer) {
        debug!("on_transport_producer_closed() [producerId:{}]", producer.id());

        let consumers = self
            .inner
            .producer_consumers
            .lock()
            .remove(producer.id())
            .unwrap_or_default();
        self.inner.producers.lock().remove(producer.id());
        {
            let mut consumer_producer = self.inner.consumer_producer.lock();
            for (consumer_id, _) in &consumers {
                consumer_producer.remove(consumer_id);
            }
        }
        let observers = self
            .inner
            .producer_rtp_observers
            .lock()
            .remove(producer.id())
            .unwrap_or_default();

        for (_, consumer) in consumers {
            if let Some(consumer) = consumer.upgrade() {
                consumer.producer_closed();
            }
        }
        for (_, observer) in observers {
            if let Some(observer) = observer.upgrade() {
                observer.producer_closed(producer.id());
            }
        }
    }

    pub(crate) fn on_transport_producer_paused(&self, producer_id: &ProducerId) {
        for consumer in self.consumers_of(producer_id) {
            consumer.on_producer_paused();
        }
        for observer in self.observers_of(producer_id) {
            observer.producer_paused(producer_id);
        }
    }

    pub(crate) fn on_transport_producer_resumed(&self, producer_id: &ProducerId) {
        for consumer in self.consumers_of(producer_id) {
            consumer.producer_resumed();
        }
    }

    pub(crate) fn on_transport_producer_new_rtp_stream(
        &self,
        producer: &Producer,
        mapped_ssrc: u32,
        score: u8,
    ) {
        for consumer in self.consumers_of(producer.id()) {
            consumer.producer_new_rtp_stream(mapped_ssrc, score);
        }
    }

    pub(crate) fn on_transport_producer_rtp_stream_score(
        &self,
        producer: &Producer,
        mapped_ssrc: u32,
        score: u8,
        previous_score: u8,
    ) {
        for consumer in self.consumers_of(producer.id()) {
            consumer.producer_rtp_stream_score(mapped_ssrc, score, previous_score);
        }
    }

    pub(crate) fn on_transport_producer_rtcp_sender_report(
        &self,
        producer: &Producer,
        mapped_ssrc: u32,
        first: bool,
    ) {
        for consumer in self.consumers_of(producer.id()) {
            consumer.producer_rtcp_sender_report(mapped_ssrc, first);
        }
    }

    /// The hot path: deliver one packet to every subscribed consumer, then to
    /// every observing RTP observer, both in insertion order.
    pub(crate) fn on_transport_producer_rtp_packet_received(
        &self,
        producer: &Producer,
        packet: &RtpPacket,
    ) {
        for consumer in self.consumers_of(producer.id()) {
            consumer.send_rtp_packet(packet);
        }
        for observer in self.observers_of(producer.id()) {
            observer.receive_rtp_packet(producer.id(), packet);
        }
    }

    /// Worst (maximum) remote fraction lost across all subscribed consumers
    /// for the given stream; 0 when nobody reports.
    pub(crate) fn on_transport_need_worst_remote_fraction_lost(
        &self,
        producer_id: &ProducerId,
        mapped_ssrc: u32,
    ) -> u8 {
        self.consumers_of(producer_id)
            .into_iter()
            .filter_map(|consumer| consumer.remote_fraction_lost_for(mapped_ssrc))
            .max()
            .unwrap_or(0)
    }

    /// A transport created a consumer; bind it to its producer in both index
    /// directions. Fails when the producer is missing or the id is taken.
    pub(crate) fn on_transport_new_consumer(
        &self,
        consumer: &Consumer,
    ) -> Result<(), RequestError> {
        if !self
            .inner
            .producers
            .lock()
            .contains_key(consumer.producer_id())
        {
            return Err(RequestError::NotFound(format!(
                "producer with id \"{}\" not found",
                consumer.producer_id()
            )));
        }

        let mut consumer_producer = self.inner.consumer_producer.lock();
        if consumer_producer.contains_key(consumer.id()) {
            return Err(RequestError::DuplicateId(format!(
                "a consumer with same id \"{}\" already exists",
                consumer.id()
            )));
        }

        // Both index directions are updated atomically with respect to the
        // control plane.
        consumer_producer.insert(consumer.id().clone(), consumer.producer_id().clone());
        self.inner
            .producer_consumers
            .lock()
            .entry(consumer.producer_id().clone())
            .or_default()
            .push((consumer.id().clone(), consumer.downgrade()));

        Ok(())
    }

    /// A consumer was closed from its own side; unlink both directions.
    pub(crate) fn on_transport_consumer_closed(&self, consumer_id: &ConsumerId) {
        let producer_id = self.inner.consumer_producer.lock().remove(consumer_id);
        if let Some(producer_id) = producer_id {
            let mut producer_consumers = self.inner.producer_consumers.lock();
            if let Some(consumers) = producer_consumers.get_mut(&producer_id) {
                consumers.retain(|(id, _)| id != consumer_id);
            }
        }
    }

    /// A consumer asks for a keyframe; resolve its producer and forward.
    pub(crate) fn on_transport_consumer_key_frame_requested(
        &self,
        consumer_id: &ConsumerId,
        mapped_ssrc: u32,
    ) {
        let producer = {
            let consumer_producer = self.inner.consumer_producer.lock();
            consumer_producer.get(consumer_id).cloned()
        }
        .and_then(|producer_id| self.get_producer(&producer_id));

        if let Some(producer) = producer {
            producer.request_key_frame(mapped_ssrc);
        }
    }

    /// A transport created a data producer; index it.
    pub(crate) fn on_transport_new_data_producer(
        &self,
        data_producer: &DataProducer,
    ) -> Result<(), RequestError> {
        let mut data_producers = self.inner.data_producers.lock();
        if data_producers.contains_key(data_producer.id()) {
            return Err(RequestError::DuplicateId(format!(
                "a data producer with same id \"{}\" already exists",
                data_producer.id()
            )));
        }
        data_producers.insert(data_producer.id().clone(), data_producer.downgrade());
        drop(data_producers);

        self.inner
            .data_producer_data_consumers
            .lock()
            .entry(data_producer.id().clone())
            .or_default();

        Ok(())
    }

    /// A data producer is gone: destroy every subscribed data consumer, then
    /// erase the indices.
    pub(crate) fn on_transport_data_producer_closed(&self, data_producer: &DataProducer) {
        debug!(
            "on_transport_data_producer_closed() [dataProducerId:{}]",
            data_producer.id()
        );

        let data_consumers = self
            .inner
            .data_producer_data_consumers
            .lock()
            .remove(data_producer.id())
            .unwrap_or_default();
        self.inner.data_producers.lock().remove(data_producer.id());
        {
            let mut data_consumer_data_producer =
                self.inner.data_consumer_data_producer.lock();
            for (data_consumer_id, _) in &data_consumers {
                data_consumer_data_producer.remove(data_consumer_id);
            }
        }

        for (_, data_consumer) in data_consumers {
            if let Some(data_consumer) = data_consumer.upgrade() {
                data_consumer.data_producer_closed();
            }
        }
    }

    /// Fan one message out to every subscribed data consumer. No ordering
    /// guarantee across consumers beyond insertion order of the index.
    pub(crate) fn on_transport_data_producer_message_received(
        &self,
        data_producer_id: &DataProducerId,
        ppid: u32,
        payload: &Bytes,
        subchannels: Option<&[u16]>,
        required_subchannel: Option<u16>,
    ) {
        for data_consumer in self.data_consumers_of(data_producer_id) {
            data_consumer.send_message(ppid, payload, subchannels, required_subchannel);
        }
    }

    /// A transport created a data consumer; bind both index directions.
    pub(crate) fn on_transport_new_data_consumer(
        &self,
        data_consumer: &DataConsumer,
    ) -> Result<(), RequestError> {
        if !self
            .inner
            .data_producers
            .lock()
            .contains_key(data_consumer.data_producer_id())
        {
            return Err(RequestError::NotFound(format!(
                "data producer with id \"{}\" not found",
                data_consumer.data_producer_id()
            )));
        }

        let mut data_consumer_data_producer = self.inner.data_consumer_data_producer.lock();
        if data_consumer_data_producer.contains_key(data_consumer.id()) {
            return Err(RequestError::DuplicateId(format!(
                "a data consumer with same id \"{}\" already exists",
                data_consumer.id()
            )));
        }

        data_consumer_data_producer.insert(
            data_consumer.id().clone(),
            data_consumer.data_producer_id().clone(),
        );
        self.inner
            .data_producer_data_consumers
            .lock()
            .entry(data_consumer.data_producer_id().clone())
            .or_default()
            .push((data_consumer.id().clone(), data_consumer.downgrade()));

        Ok(())
    }

    /// A data consumer was closed from its own side; unlink both directions.
    pub(crate) fn on_transport_data_consumer_closed(&self, data_consumer_id: &DataConsumerId) {
        let data_producer_id = self
            .inner
            .data_consumer_data_producer
            .lock()
            .remove(data_consumer_id);
        if let Some(data_producer_id) = data_producer_id {
            let mut data_producer_data_consumers =
                self.inner.data_producer_data_consumers.lock();
            if let Some(data_consumers) = data_producer_data_consumers.get_mut(&data_producer_id)
            {
                data_consumers.retain(|(id, _)| id != data_consumer_id);
            }
        }
    }

    /// A transport self-destructed because its listen server closed; drop it
    /// from the registry.
    pub(crate) fn on_transport_listen_server_closed(&self, transport_id: &TransportId) {
        debug!(
            "on_transport_listen_server_closed() [transportId:{}]",
            transport_id
        );

        self.inner.transports.lock().remove(transport_id);
    }

    // ===== Helpers =====

    fn consumers_of(&self, producer_id: &ProducerId) -> Vec<Consumer> {
        let producer_consumers = self.inner.producer_consumers.lock();
        match producer_consumers.get(producer_id) {
            Some(consumers) => consumers
                .iter()
                .filter_map(|(_, consumer)| consumer.upgrade())
                .collect(),
            None => Vec::new(),
        }
    }

    fn observers_of(&self, producer_id: &ProducerId) -> Vec<RtpObserver> {
        let producer_rtp_observers = self.inner.producer_rtp_observers.lock();
        match producer_rtp_observers.get(producer_id) {
            Some(observers) => observers
                .iter()
                .filter_map(|(_, observer)| observer.upgrade())
                .collect(),
            None => Vec::new(),
        }
    }

    fn data_consumers_of(&self, data_producer_id: &DataProducerId) -> Vec<DataConsumer> {
        let data_producer_data_consumers = self.inner.data_producer_data_consumers.lock();
        match data_producer_data_consumers.get(data_producer_id) {
            Some(data_consumers) => data_consumers
                .iter()
                .filter_map(|(_, data_consumer)| data_consumer.upgrade())
                .collect(),
            None => Vec::new(),
        }
    }

    fn rtp_observer_from_internal(
        &self,
        internal: &Internal,
    ) -> Result<RtpObserver, RequestError> {
        let rtp_observer_id = internal.rtp_observer_id()?;
        self.rtp_observer(rtp_observer_id).ok_or_else(|| {
            RequestError::NotFound(format!(
                "RtpObserver with id \"{}\" not found",
                rtp_observer_id
            ))
        })
    }

    fn detach_rtp_observer_everywhere(&self, rtp_observer_id: &RtpObserverId) {
        let mut producer_rtp_observers = self.inner.producer_rtp_observers.lock();
        for observers in producer_rtp_observers.values_mut() {
            observers.retain(|(id, _)| id != rtp_observer_id);
        }
    }
}
