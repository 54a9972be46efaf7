//! Shared harness: in-memory capability implementations and request helpers.

#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sfu_worker::prelude::*;
use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub fn init() {
    let mut builder = env_logger::builder();
    if env::var(env_logger::DEFAULT_FILTER_ENV).is_err() {
        builder.filter_level(log::LevelFilter::Off);
    }
    let _ = builder.is_test(true).try_init();
}

#[derive(Default)]
pub struct ResponseLog {
    pub entries: Mutex<Vec<(u32, RequestResult)>>,
}

impl ResponseSink for ResponseLog {
    fn respond(&self, id: u32, result: RequestResult) {
        self.entries.lock().push((id, result));
    }
}

#[derive(Default)]
pub struct NotificationLog {
    pub entries: Mutex<Vec<(String, String, Value)>>,
}

impl NotificationLog {
    /// Events recorded for the given target, in order.
    pub fn events_for(&self, target_id: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(target, _, _)| target == target_id)
            .map(|(_, event, _)| event.clone())
            .collect()
    }

    pub fn count(&self, target_id: &str, event: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|(target, recorded, _)| target == target_id && recorded == event)
            .count()
    }

    pub fn last_data(&self, target_id: &str, event: &str) -> Option<Value> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|(target, recorded, _)| target == target_id && recorded == event)
            .map(|(_, _, data)| data.clone())
    }
}

impl ChannelNotificationSink for NotificationLog {
    fn notify(&self, target_id: &str, event: &'static str, data: Value) {
        self.entries
            .lock()
            .push((target_id.to_string(), event.to_string(), data));
    }
}

#[derive(Default)]
pub struct PayloadLog {
    pub entries: Mutex<Vec<(String, String, Value, Bytes)>>,
}

impl PayloadLog {
    pub fn payloads_for(&self, target_id: &str, event: &str) -> Vec<Bytes> {
        self.entries
            .lock()
            .iter()
            .filter(|(target, recorded, _, _)| target == target_id && recorded == event)
            .map(|(_, _, _, payload)| payload.clone())
            .collect()
    }
}

impl PayloadNotificationSink for PayloadLog {
    fn notify(&self, target_id: &str, event: &'static str, data: Value, payload: Bytes) {
        self.entries
            .lock()
            .push((target_id.to_string(), event.to_string(), data, payload));
    }
}

/// Recording driver: captures everything the core asks the wire level to do.
pub struct TestDriver {
    transport_id: TransportId,
    ice_generation: AtomicU32,
    pub sent_rtp: Mutex<Vec<RtpPacket>>,
    pub sent_messages: Mutex<Vec<(u16, u32, Bytes)>>,
    pub key_frame_requests: Mutex<Vec<u32>>,
}

impl TestDriver {
    fn new(transport_id: TransportId) -> Self {
        Self {
            transport_id,
            ice_generation: AtomicU32::new(0),
            sent_rtp: Mutex::default(),
            sent_messages: Mutex::default(),
            key_frame_requests: Mutex::default(),
        }
    }

    fn make_ice_parameters(&self, generation: u32) -> IceParameters {
        IceParameters {
            username_fragment: format!("ufrag-{}-{}", self.transport_id, generation),
            password: "not-a-real-password".to_string(),
            ice_lite: Some(true),
        }
    }

    pub fn sent_rtp_ssrcs(&self) -> Vec<u32> {
        self.sent_rtp.lock().iter().map(|packet| packet.ssrc).collect()
    }
}

impl TransportDriver for TestDriver {
    fn connect(
        &self,
        _parameters: &TransportRemoteParameters,
    ) -> Result<Option<TransportTuple>, TransportDriverError> {
        Ok(None)
    }

    fn send_rtp_packet(&self, packet: &RtpPacket) {
        self.sent_rtp.lock().push(packet.clone());
    }

    fn send_sctp_message(&self, stream_id: u16, ppid: u32, payload: &Bytes) {
        self.sent_messages.lock().push((stream_id, ppid, payload.clone()));
    }

    fn request_key_frame(&self, ssrc: u32) {
        self.key_frame_requests.lock().push(ssrc);
    }

    fn ice_parameters(&self) -> Option<IceParameters> {
        Some(self.make_ice_parameters(self.ice_generation.load(Ordering::SeqCst)))
    }

    fn restart_ice(&self) -> Result<IceParameters, TransportDriverError> {
        let generation = self.ice_generation.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.make_ice_parameters(generation))
    }
}

#[derive(Default)]
pub struct TestDriverFactory {
    pub drivers: Mutex<HashMap<TransportId, Arc<TestDriver>>>,
}

impl TestDriverFactory {
    pub fn driver(&self, transport_id: &TransportId) -> Arc<TestDriver> {
        self.drivers
            .lock()
            .get(transport_id)
            .cloned()
            .expect("no driver created for transport")
    }
}

impl TransportDriverFactory for TestDriverFactory {
    fn create_driver(
        &self,
        transport_id: &TransportId,
        _options: &TransportDriverOptions<'_>,
    ) -> Result<Arc<dyn TransportDriver>, TransportDriverError> {
        let driver = Arc::new(TestDriver::new(transport_id.clone()));
        self.drivers
            .lock()
            .insert(transport_id.clone(), Arc::clone(&driver));
        Ok(driver)
    }
}

/// Byte layout: ssrc (4, BE) | seq (2, BE) | timestamp (4, BE) | payload.
pub struct TestDecoder;

impl RtpPacketDecoder for TestDecoder {
    fn decode(&self, data: &[u8]) -> Result<RtpPacket, RtpPacketDecodeError> {
        if data.len() < 10 {
            return Err(RtpPacketDecodeError("too short".to_string()));
        }
        Ok(RtpPacket {
            ssrc: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            sequence_number: u16::from_be_bytes([data[4], data[5]]),
            timestamp: u32::from_be_bytes([data[6], data[7], data[8], data[9]]),
            payload_type: 100,
            marker: false,
            is_key_frame: false,
            rid: None,
            spatial_layer: None,
            temporal_layer: None,
            audio_level: None,
            video_orientation: None,
            payload: Bytes::copy_from_slice(&data[10..]),
        })
    }
}

pub struct TestSetup {
    pub worker: Worker,
    pub responses: Arc<ResponseLog>,
    pub notifications: Arc<NotificationLog>,
    pub payloads: Arc<PayloadLog>,
    pub factory: Arc<TestDriverFactory>,
    next_request_id: AtomicU32,
}

pub fn setup() -> TestSetup {
    init();

    let responses = Arc::new(ResponseLog::default());
    let notifications = Arc::new(NotificationLog::default());
    let payloads = Arc::new(PayloadLog::default());
    let factory = Arc::new(TestDriverFactory::default());

    let worker = Worker::new(
        WorkerSettings::default(),
        ControlPipe {
            responses: Arc::clone(&responses) as Arc<dyn ResponseSink>,
            notifications: Arc::clone(&notifications) as Arc<dyn ChannelNotificationSink>,
            payload_notifications: Arc::clone(&payloads) as Arc<dyn PayloadNotificationSink>,
        },
        Arc::clone(&factory) as Arc<dyn TransportDriverFactory>,
        Arc::new(TestDecoder),
    );

    TestSetup {
        worker,
        responses,
        notifications,
        payloads,
        factory,
        next_request_id: AtomicU32::new(1),
    }
}

impl TestSetup {
    pub fn request(
        &self,
        method: RequestMethod,
        internal: impl Into<Internal>,
        data: Value,
    ) -> RequestResult {
        self.worker.handle_request(&ChannelRequest {
            id: self.next_request_id.fetch_add(1, Ordering::SeqCst),
            method,
            internal: internal.into(),
            data,
        })
    }

    pub fn expect_ok(
        &self,
        method: RequestMethod,
        internal: impl Into<Internal>,
        data: Value,
    ) -> Option<Value> {
        self.request(method, internal, data)
            .unwrap_or_else(|error| panic!("{:?} failed: {}", method, error))
    }

    pub fn driver(&self, transport_id: &str) -> Arc<TestDriver> {
        self.factory.driver(&TransportId::from(transport_id))
    }

    // Fixture wiring shared by most tests: a router with producers and
    // consumers spread over webrtc transports.

    pub fn create_router(&self, router_id: &str) {
        self.expect_ok(
            RequestMethod::WorkerCreateRouter,
            internal().router(router_id),
            Value::Null,
        );
    }

    pub fn create_webrtc_transport(&self, router_id: &str, transport_id: &str) {
        self.expect_ok(
            RequestMethod::RouterCreateWebRtcTransport,
            internal().router(router_id).transport(transport_id),
            json!({ "listenIps": [{ "ip": "127.0.0.1" }], "enableSctp": true }),
        );
    }

    pub fn create_audio_producer(
        &self,
        router_id: &str,
        transport_id: &str,
        producer_id: &str,
        ssrc: u32,
        mapped_ssrc: u32,
    ) {
        self.expect_ok(
            RequestMethod::TransportProduce,
            internal()
                .router(router_id)
                .transport(transport_id)
                .producer(producer_id),
            audio_producer_data(ssrc, mapped_ssrc),
        );
    }

    pub fn create_audio_consumer(
        &self,
        router_id: &str,
        transport_id: &str,
        consumer_id: &str,
        producer_id: &str,
        mapped_ssrc: u32,
        outbound_ssrc: u32,
    ) {
        self.expect_ok(
            RequestMethod::TransportConsume,
            internal()
                .router(router_id)
                .transport(transport_id)
                .consumer(consumer_id),
            audio_consumer_data(producer_id, mapped_ssrc, outbound_ssrc),
        );
    }
}

/// Builder-style shorthand for the addressing record.
pub struct InternalBuilder(Internal);

pub fn internal() -> InternalBuilder {
    InternalBuilder(Internal::default())
}

impl InternalBuilder {
    pub fn web_rtc_server(mut self, id: &str) -> Self {
        self.0.web_rtc_server_id = Some(id.into());
        self
    }

    pub fn router(mut self, id: &str) -> Self {
        self.0.router_id = Some(id.into());
        self
    }

    pub fn transport(mut self, id: &str) -> Self {
        self.0.transport_id = Some(id.into());
        self
    }

    pub fn producer(mut self, id: &str) -> Self {
        self.0.producer_id = Some(id.into());
        self
    }

    pub fn consumer(mut self, id: &str) -> Self {
        self.0.consumer_id = Some(id.into());
        self
    }

    pub fn data_producer(mut self, id: &str) -> Self {
        self.0.data_producer_id = Some(id.into());
        self
    }

    pub fn data_consumer(mut self, id: &str) -> Self {
        self.0.data_consumer_id = Some(id.into());
        self
    }

    pub fn rtp_observer(mut self, id: &str) -> Self {
        self.0.rtp_observer_id = Some(id.into());
        self
    }
}

impl From<InternalBuilder> for Internal {
    fn from(builder: InternalBuilder) -> Self {
        builder.0
    }
}

pub fn audio_producer_data(ssrc: u32, mapped_ssrc: u32) -> Value {
    json!({
        "kind": "audio",
        "rtpParameters": {
            "mid": "AUDIO",
            "codecs": [{
                "mimeType": "audio/opus",
                "payloadType": 111,
                "clockRate": 48000,
                "channels": 2,
            }],
            "encodings": [{ "ssrc": ssrc }],
        },
        "rtpMapping": {
            "codecs": [{ "payloadType": 111, "mappedPayloadType": 100 }],
            "encodings": [{ "ssrc": ssrc, "mappedSsrc": mapped_ssrc }],
        },
    })
}

pub fn audio_consumer_data(producer_id: &str, mapped_ssrc: u32, outbound_ssrc: u32) -> Value {
    json!({
        "producerId": producer_id,
        "kind": "audio",
        "type": "simple",
        "rtpParameters": {
            "codecs": [{
                "mimeType": "audio/opus",
                "payloadType": 100,
                "clockRate": 48000,
                "channels": 2,
            }],
            "encodings": [{ "ssrc": outbound_ssrc }],
        },
        "consumableRtpEncodings": [{ "ssrc": mapped_ssrc }],
    })
}

pub fn video_producer_data(ssrcs: &[u32], mapped_ssrcs: &[u32]) -> Value {
    let encodings = ssrcs
        .iter()
        .map(|ssrc| json!({ "ssrc": ssrc, "scalabilityMode": "S1T3" }))
        .collect::<Vec<_>>();
    let mapped_encodings = ssrcs
        .iter()
        .zip(mapped_ssrcs)
        .map(|(ssrc, mapped_ssrc)| json!({ "ssrc": ssrc, "mappedSsrc": mapped_ssrc }))
        .collect::<Vec<_>>();

    json!({
        "kind": "video",
        "rtpParameters": {
            "mid": "VIDEO",
            "codecs": [{
                "mimeType": "video/VP8",
                "payloadType": 96,
                "clockRate": 90000,
            }],
            "encodings": encodings,
        },
        "rtpMapping": {
            "codecs": [{ "payloadType": 96, "mappedPayloadType": 101 }],
            "encodings": mapped_encodings,
        },
    })
}

pub fn simulcast_consumer_data(
    producer_id: &str,
    mapped_ssrcs: &[u32],
    outbound_ssrc: u32,
    preferred_spatial_layer: u8,
) -> Value {
    let consumable = mapped_ssrcs
        .iter()
        .map(|ssrc| json!({ "ssrc": ssrc, "scalabilityMode": "S1T3" }))
        .collect::<Vec<_>>();

    json!({
        "producerId": producer_id,
        "kind": "video",
        "type": "simulcast",
        "rtpParameters": {
            "codecs": [{
                "mimeType": "video/VP8",
                "payloadType": 101,
                "clockRate": 90000,
            }],
            "encodings": [{ "ssrc": outbound_ssrc }],
        },
        "consumableRtpEncodings": consumable,
        "preferredLayers": { "spatialLayer": preferred_spatial_layer },
    })
}

pub fn audio_packet(ssrc: u32, seq: u16) -> RtpPacket {
    RtpPacket {
        ssrc,
        sequence_number: seq,
        timestamp: u32::from(seq) * 960,
        payload_type: 111,
        marker: false,
        is_key_frame: false,
        rid: None,
        spatial_layer: None,
        temporal_layer: None,
        audio_level: Some(-50),
        video_orientation: None,
        payload: Bytes::from_static(&[0u8; 100]),
    }
}

pub fn video_packet(ssrc: u32, seq: u16, key_frame: bool) -> RtpPacket {
    RtpPacket {
        ssrc,
        sequence_number: seq,
        timestamp: u32::from(seq) * 3000,
        payload_type: 96,
        marker: false,
        is_key_frame: key_frame,
        rid: None,
        spatial_layer: None,
        temporal_layer: Some(0),
        audio_level: None,
        video_orientation: None,
        payload: Bytes::from_static(&[0u8; 1000]),
    }
}
