//! A consumer applies one subscriber's forwarding policy to the packets of
//! its bound producer: pause state, spatial/temporal layer selection with
//! keyframe-gated switches, and header rewriting to the negotiated outbound
//! values.

use crate::channel::RequestError;
use crate::messages::to_response_data;
use crate::router::producer::ProducerId;
use crate::router::transport::WeakTransport;
use crate::rtp_packet::RtpPacket;
use crate::rtp_parameters::{MediaKind, RtpEncodingParameters, RtpParameters};
use crate::string_based_wrapper_type;
use crate::worker::WorkerContext;
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

string_based_wrapper_type!(
    /// [`Consumer`] identifier.
    ConsumerId
);

/// Spatial and temporal layer selection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    /// The spatial layer index (from 0 to N).
    pub spatial_layer: u8,
    /// The temporal layer index (from 0 to N).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporal_layer: Option<u8>,
}

/// Forwarding policy variant of a consumer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    /// One stream in, one stream out.
    Simple,
    /// Picks among the producer's spatial encodings.
    Simulcast,
    /// Layered single-stream selection.
    Svc,
    /// Forwards every layer verbatim.
    Pipe,
}

/// Score of the consumer and of its producer's streams.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerScore {
    /// Score of the outbound RTP stream of the consumer.
    pub score: u8,
    /// Score of the currently selected RTP stream of the producer.
    pub producer_score: u8,
    /// Scores of all producer RTP streams, ordered by encoding.
    pub producer_scores: Vec<u8>,
}

/// Creation data of a consumer, as sent by the controller.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerOptions {
    /// The id of the producer to consume.
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    /// RTP parameters offered to the consuming endpoint. For non-pipe
    /// consumers the first encoding carries the outbound SSRC.
    pub rtp_parameters: RtpParameters,
    pub r#type: ConsumerType,
    /// The producer's encodings in mapped (router-unique) SSRC space.
    pub consumable_rtp_encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_layers: Option<ConsumerLayers>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ConsumerDump {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub r#type: ConsumerType,
    pub rtp_parameters: RtpParameters,
    pub consumable_rtp_encodings: Vec<RtpEncodingParameters>,
    pub paused: bool,
    pub producer_paused: bool,
    pub priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_layers: Option<ConsumerLayers>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_layers: Option<ConsumerLayers>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_layers: Option<ConsumerLayers>,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStat {
    pub ssrc: Option<u32>,
    pub kind: MediaKind,
    pub packet_count: u64,
    pub byte_count: u64,
    pub remote_fraction_lost: u8,
    pub score: ConsumerScore,
}

#[derive(Debug, Default)]
struct Layers {
    preferred: Option<ConsumerLayers>,
    target: Option<ConsumerLayers>,
    current: Option<ConsumerLayers>,
    /// Producer stream scores by encoding index. `None` until the stream has
    /// been seen; a declared encoding is a valid target before its first
    /// packet, a scored-zero one is not.
    producer_scores: Vec<Option<u8>>,
}

#[derive(Debug, Default)]
struct Rewrite {
    initialized: bool,
    seq_offset: u16,
    ts_offset: u32,
    last_out_seq: u16,
    last_out_ts: u32,
    last_source_ssrc: Option<u32>,
}

#[derive(Default)]
struct Handlers {
    pause: Bag<Arc<dyn Fn() + Send + Sync>>,
    resume: Bag<Arc<dyn Fn() + Send + Sync>>,
    producer_pause: Bag<Arc<dyn Fn() + Send + Sync>>,
    producer_resume: Bag<Arc<dyn Fn() + Send + Sync>>,
    score: Bag<Arc<dyn Fn(&ConsumerScore) + Send + Sync>>,
    layers_change: Bag<Arc<dyn Fn(Option<ConsumerLayers>) + Send + Sync>>,
    producer_close: BagOnce<Box<dyn FnOnce() + Send>>,
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

pub(crate) struct Inner {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    r#type: ConsumerType,
    rtp_parameters: RtpParameters,
    consumable_rtp_encodings: Vec<RtpEncodingParameters>,
    paused: AtomicBool,
    producer_paused: AtomicBool,
    priority: AtomicU8,
    layers: Mutex<Layers>,
    rewrite: Mutex<Rewrite>,
    remote_fraction_lost: AtomicU8,
    packet_count: AtomicU64,
    byte_count: AtomicU64,
    context: Arc<WorkerContext>,
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

/// A subscriber of one producer within a router.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakConsumer {
    inner: Weak<Inner>,
}

impl WeakConsumer {
    pub(crate) fn upgrade(&self) -> Option<Consumer> {
        Some(Consumer {
            inner: self.inner.upgrade()?,
        })
    }
}

impl Consumer {
    pub(crate) fn new(
        id: ConsumerId,
        options: ConsumerOptions,
        producer_paused: bool,
        context: Arc<WorkerContext>,
        transport: WeakTransport,
    ) -> Result<Self, RequestError> {
        debug!("new()");

        let ConsumerOptions {
            producer_id,
            kind,
            rtp_parameters,
            r#type,
            consumable_rtp_encodings,
            paused,
            preferred_layers,
        } = options;

        if consumable_rtp_encodings.is_empty() {
            return Err(RequestError::TypeError(
                "consumableRtpEncodings must not be empty".into(),
            ));
        }
        if r#type != ConsumerType::Pipe {
            let has_outbound_ssrc = rtp_parameters
                .encodings
                .first()
                .map(|encoding| encoding.ssrc.is_some())
                .unwrap_or_default();
            if !has_outbound_ssrc {
                return Err(RequestError::TypeError(
                    "rtpParameters must include an encoding with ssrc".into(),
                ));
            }
        }

        let layers = Layers {
            preferred: preferred_layers,
            target: None,
            current: None,
            producer_scores: vec![None; consumable_rtp_encodings.len()],
        };

        let inner = Arc::new(Inner {
            id,
            producer_id,
            kind,
            r#type,
            rtp_parameters,
            consumable_rtp_encodings,
            paused: AtomicBool::new(paused),
            producer_paused: AtomicBool::new(producer_paused),
            priority: AtomicU8::new(1),
            layers: Mutex::new(layers),
            rewrite: Mutex::default(),
            remote_fraction_lost: AtomicU8::new(0),
            packet_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
            context,
            transport,
            handlers: Handlers::default(),
            closed: AtomicBool::new(false),
        });

        let consumer = Self { inner };
        consumer.recompute_target_layers();

        Ok(consumer)
    }

    /// Consumer identifier.
    pub fn id(&self) -> &ConsumerId {
        &self.inner.id
    }

    /// Bound producer id.
    pub fn producer_id(&self) -> &ProducerId {
        &self.inner.producer_id
    }

    /// Media kind.
    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    /// Consumer type.
    pub fn r#type(&self) -> ConsumerType {
        self.inner.r#type
    }

    /// RTP parameters offered to the consuming endpoint.
    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.inner.rtp_parameters
    }

    /// Whether the consumer is paused by its own side.
    pub fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Whether the bound producer is paused.
    pub fn producer_paused(&self) -> bool {
        self.inner.producer_paused.load(Ordering::SeqCst)
    }

    /// Whether the consumer is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Current priority for the external bitrate allocator.
    pub fn priority(&self) -> u8 {
        self.inner.priority.load(Ordering::SeqCst)
    }

    /// Preferred spatial/temporal layers.
    pub fn preferred_layers(&self) -> Option<ConsumerLayers> {
        self.inner.layers.lock().preferred
    }

    /// Layers the consumer is trying to reach.
    pub fn target_layers(&self) -> Option<ConsumerLayers> {
        self.inner.layers.lock().target
    }

    /// Layers currently being forwarded.
    pub fn current_layers(&self) -> Option<ConsumerLayers> {
        self.inner.layers.lock().current
    }

    /// Consumer score.
    pub fn score(&self) -> ConsumerScore {
        let layers = self.inner.layers.lock();
        self.score_with(&layers)
    }

    /// Outbound SSRC (absent for pipe consumers, which keep source SSRCs).
    pub fn outbound_ssrc(&self) -> Option<u32> {
        if self.inner.r#type == ConsumerType::Pipe {
            return None;
        }
        self.inner
            .rtp_parameters
            .encodings
            .first()
            .and_then(|encoding| encoding.ssrc)
    }

    pub(crate) fn downgrade(&self) -> WeakConsumer {
        WeakConsumer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn active(&self) -> bool {
        !self.closed() && !self.paused() && !self.producer_paused()
    }

    /// Forward one packet from the bound producer.
    ///
    /// The packet arrives in mapped SSRC space. Drops it unless the consumer
    /// is deliverable and the packet belongs to the selected layer; otherwise
    /// rewrites SSRC, payload type, sequence number and timestamp and hands
    /// the result to the owning transport.
    pub(crate) fn send_rtp_packet(&self, packet: &RtpPacket) {
        if !self.active() {
            return;
        }

        match self.inner.r#type {
            ConsumerType::Pipe => {
                self.transmit(packet.clone());
            }
            ConsumerType::Simple => {
                let expected_ssrc = self
                    .inner
                    .consumable_rtp_encodings
                    .first()
                    .and_then(|encoding| encoding.ssrc);
                if Some(packet.ssrc) != expected_ssrc {
                    return;
                }
                self.rewrite_and_transmit(packet);
            }
            ConsumerType::Simulcast => {
                let spatial_idx = match self.spatial_idx_of_ssrc(packet.ssrc) {
                    Some(idx) => idx,
                    None => return,
                };
                if !self.select_layered_packet(packet, spatial_idx) {
                    return;
                }
                self.rewrite_and_transmit(packet);
            }
            ConsumerType::Svc => {
                let spatial_idx = packet.spatial_layer.unwrap_or(0);
                if !self.select_layered_packet(packet, spatial_idx) {
                    return;
                }
                self.rewrite_and_transmit(packet);
            }
        }
    }

    /// Layer filter for simulcast and SVC. Swaps `current ← target` only on
    /// a keyframe boundary: for simulcast a keyframe of the target stream,
    /// for SVC any keyframe (every spatial layer shares the stream).
    fn select_layered_packet(&self, packet: &RtpPacket, spatial_idx: u8) -> bool {
        let svc = self.inner.r#type == ConsumerType::Svc;
        let mut switched_to = None;
        let accepted = {
            let mut layers = self.inner.layers.lock();

            let target = match layers.target {
                Some(target) => target,
                None => return false,
            };

            let reaching_target = match layers.current {
                Some(current) => current.spatial_layer != target.spatial_layer,
                None => true,
            };

            let switch_boundary = if svc {
                packet.is_key_frame
            } else {
                spatial_idx == target.spatial_layer && packet.is_key_frame
            };
            if reaching_target && switch_boundary {
                layers.current = Some(target);
                switched_to = Some(target);
            }

            match layers.current {
                Some(current) => {
                    // SVC layers are nested; simulcast streams are exclusive.
                    let spatial_ok = if svc {
                        spatial_idx <= current.spatial_layer
                    } else {
                        spatial_idx == current.spatial_layer
                    };
                    spatial_ok
                        && match (packet.temporal_layer, current.temporal_layer) {
                            (Some(temporal), Some(max_temporal)) => temporal <= max_temporal,
                            _ => true,
                        }
                }
                None => false,
            }
        };

        if let Some(layers) = switched_to {
            self.emit_layers_change(Some(layers));
        }

        accepted
    }

    fn rewrite_and_transmit(&self, packet: &RtpPacket) {
        let mut out = packet.clone();

        if let Some(ssrc) = self.outbound_ssrc() {
            out.ssrc = ssrc;
        }
        if let Some(codec) = self
            .inner
            .rtp_parameters
            .codecs
            .iter()
            .find(|codec| !codec.is_rtx())
        {
            out.payload_type = codec.payload_type;
        }

        {
            let mut rewrite = self.inner.rewrite.lock();

            if !rewrite.initialized {
                rewrite.initialized = true;
            } else if rewrite.last_source_ssrc != Some(packet.ssrc) {
                // Source stream switch: keep outbound sequence numbers and
                // timestamps monotonically non-decreasing.
                rewrite.seq_offset = rewrite
                    .last_out_seq
                    .wrapping_add(1)
                    .wrapping_sub(packet.sequence_number);
                rewrite.ts_offset = rewrite.last_out_ts.wrapping_sub(packet.timestamp);
            }

            out.sequence_number = packet.sequence_number.wrapping_add(rewrite.seq_offset);
            out.timestamp = packet.timestamp.wrapping_add(rewrite.ts_offset);
            rewrite.last_out_seq = out.sequence_number;
            rewrite.last_out_ts = out.timestamp;
            rewrite.last_source_ssrc = Some(packet.ssrc);
        }

        self.transmit(out);
    }

    fn transmit(&self, packet: RtpPacket) {
        self.inner.packet_count.fetch_add(1, Ordering::Relaxed);
        self.inner
            .byte_count
            .fetch_add(packet.size() as u64, Ordering::Relaxed);

        if let Some(transport) = self.inner.transport.upgrade() {
            transport.send_rtp_packet_for_consumer(&self.inner.id, packet);
        }
    }

    fn spatial_idx_of_ssrc(&self, mapped_ssrc: u32) -> Option<u8> {
        self.inner
            .consumable_rtp_encodings
            .iter()
            .position(|encoding| encoding.ssrc == Some(mapped_ssrc))
            .map(|idx| idx as u8)
    }

    /// The encoding that carries the given spatial layer. SVC packs every
    /// layer into its single encoding; simulcast has one encoding per layer.
    fn encoding_for_spatial_layer(
        &self,
        spatial_layer: u8,
    ) -> Option<&crate::rtp_parameters::RtpEncodingParameters> {
        match self.inner.r#type {
            ConsumerType::Svc => self.inner.consumable_rtp_encodings.first(),
            _ => self
                .inner
                .consumable_rtp_encodings
                .get(usize::from(spatial_layer)),
        }
    }

    fn max_spatial_layer(&self) -> u8 {
        match self.inner.r#type {
            ConsumerType::Svc => self
                .inner
                .consumable_rtp_encodings
                .first()
                .and_then(|encoding| encoding.scalability_mode)
                .map(|mode| mode.spatial_layers.saturating_sub(1))
                .unwrap_or(0),
            _ => (self.inner.consumable_rtp_encodings.len() - 1) as u8,
        }
    }

    fn max_temporal_layer(&self, spatial_layer: u8) -> Option<u8> {
        self.encoding_for_spatial_layer(spatial_layer)
            .and_then(|encoding| encoding.scalability_mode)
            .map(|mode| mode.temporal_layers.saturating_sub(1))
    }

    /// Re-derive target layers from preferences and stream health. For video
    /// an upward spatial switch requests a keyframe on the target layer.
    fn recompute_target_layers(&self) {
        if !matches!(
            self.inner.r#type,
            ConsumerType::Simulcast | ConsumerType::Svc
        ) {
            return;
        }

        let mut request_key_frame_for = None;
        {
            let mut layers = self.inner.layers.lock();

            let preferred = layers.preferred.unwrap_or(ConsumerLayers {
                spatial_layer: self.max_spatial_layer(),
                temporal_layer: None,
            });

            let mut spatial = preferred.spatial_layer.min(self.max_spatial_layer());

            // Avoid simulcast streams scored dead; unseen declared encodings
            // stay valid targets.
            if self.inner.r#type == ConsumerType::Simulcast {
                let highest_usable = layers
                    .producer_scores
                    .iter()
                    .rposition(|score| !matches!(score, Some(0)))
                    .map(|idx| idx as u8);
                if let Some(highest_usable) = highest_usable {
                    spatial = spatial.min(highest_usable);
                }
            }

            let temporal = match (preferred.temporal_layer, self.max_temporal_layer(spatial)) {
                (Some(preferred_temporal), Some(max_temporal)) => {
                    Some(preferred_temporal.min(max_temporal))
                }
                (None, max_temporal) => max_temporal,
                (preferred_temporal, None) => preferred_temporal,
            };

            let target = ConsumerLayers {
                spatial_layer: spatial,
                temporal_layer: temporal,
            };

            if layers.target == Some(target) {
                return;
            }
            layers.target = Some(target);

            let needs_key_frame = match layers.current {
                Some(current) => current.spatial_layer != target.spatial_layer,
                None => true,
            };
            if needs_key_frame && self.inner.kind == MediaKind::Video {
                request_key_frame_for = self
                    .encoding_for_spatial_layer(target.spatial_layer)
                    .and_then(|encoding| encoding.ssrc);
            }
        }

        if let Some(mapped_ssrc) = request_key_frame_for {
            self.key_frame_requested(mapped_ssrc);
        }
    }

    fn key_frame_requested(&self, mapped_ssrc: u32) {
        if let Some(transport) = self.inner.transport.upgrade() {
            transport.on_consumer_key_frame_requested(&self.inner.id, mapped_ssrc);
        }
    }

    /// Ask the producing endpoint for a keyframe on the layer currently being
    /// targeted (or forwarded).
    pub(crate) fn request_key_frame(&self) {
        if self.inner.kind != MediaKind::Video {
            return;
        }

        let mapped_ssrc = match self.inner.r#type {
            ConsumerType::Simple | ConsumerType::Pipe => self
                .inner
                .consumable_rtp_encodings
                .first()
                .and_then(|encoding| encoding.ssrc),
            ConsumerType::Simulcast | ConsumerType::Svc => {
                let selected = {
                    let layers = self.inner.layers.lock();
                    layers.target.or(layers.current)
                };
                selected
                    .and_then(|selected| self.encoding_for_spatial_layer(selected.spatial_layer))
                    .and_then(|encoding| encoding.ssrc)
            }
        };

        if let Some(mapped_ssrc) = mapped_ssrc {
            self.key_frame_requested(mapped_ssrc);
        }
    }

    pub(crate) fn set_preferred_layers(
        &self,
        preferred: ConsumerLayers,
    ) -> Result<ConsumerLayers, RequestError> {
        debug!("set_preferred_layers()");

        if !matches!(
            self.inner.r#type,
            ConsumerType::Simulcast | ConsumerType::Svc
        ) {
            return Err(RequestError::IllegalState(
                "setPreferredLayers is only valid for simulcast and SVC consumers".into(),
            ));
        }

        let clamped = ConsumerLayers {
            spatial_layer: preferred.spatial_layer.min(self.max_spatial_layer()),
            temporal_layer: preferred.temporal_layer,
        };

        self.inner.layers.lock().preferred = Some(clamped);
        self.recompute_target_layers();

        Ok(clamped)
    }

    pub(crate) fn set_priority(&self, priority: u8) -> Result<(), RequestError> {
        if priority == 0 {
            return Err(RequestError::TypeError("priority must be 1 or higher".into()));
        }
        self.inner.priority.store(priority, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn unset_priority(&self) {
        self.inner.priority.store(1, Ordering::SeqCst);
    }

    pub(crate) fn pause(&self) {
        debug!("pause()");

        let was_paused = self.inner.paused.swap(true, Ordering::SeqCst);
        if !was_paused {
            self.inner.handlers.pause.call_simple();
        }
    }

    pub(crate) fn resume(&self) {
        debug!("resume()");

        let was_paused = self.inner.paused.swap(false, Ordering::SeqCst);
        if was_paused {
            self.inner.handlers.resume.call_simple();
            // Resuming into a layered stream starts from a fresh keyframe.
            if self.inner.kind == MediaKind::Video {
                self.request_key_frame();
            }
        }
    }

    /// Remote receiver report for the outbound stream.
    pub(crate) fn receive_rtcp_receiver_report(&self, fraction_lost: u8) {
        self.inner
            .remote_fraction_lost
            .store(fraction_lost, Ordering::SeqCst);
    }

    /// Contribution to the producer's worst-remote-fraction-lost query.
    ///
    /// Layered consumers only answer for the stream they currently forward.
    pub(crate) fn remote_fraction_lost_for(&self, mapped_ssrc: u32) -> Option<u8> {
        match self.inner.r#type {
            ConsumerType::Simple | ConsumerType::Pipe => {
                Some(self.inner.remote_fraction_lost.load(Ordering::SeqCst))
            }
            ConsumerType::Simulcast | ConsumerType::Svc => {
                let current = self.inner.layers.lock().current?;
                let current_ssrc = self
                    .encoding_for_spatial_layer(current.spatial_layer)
                    .and_then(|encoding| encoding.ssrc)?;
                if current_ssrc == mapped_ssrc {
                    Some(self.inner.remote_fraction_lost.load(Ordering::SeqCst))
                } else {
                    None
                }
            }
        }
    }

    // Producer-side events, delivered through the router.

    pub(crate) fn on_producer_paused(&self) {
        let was_paused = self.inner.producer_paused.swap(true, Ordering::SeqCst);
        if was_paused {
            return;
        }

        self.inner.handlers.producer_pause.call_simple();
        self.notify("producerpause", Value::Null);

        if matches!(
            self.inner.r#type,
            ConsumerType::Simulcast | ConsumerType::Svc
        ) {
            self.inner.layers.lock().current = None;
            self.emit_layers_change(None);
        }
    }

    pub(crate) fn producer_resumed(&self) {
        let was_paused = self.inner.producer_paused.swap(false, Ordering::SeqCst);
        if !was_paused {
            return;
        }

        self.inner.handlers.producer_resume.call_simple();
        self.notify("producerresume", Value::Null);

        if self.inner.kind == MediaKind::Video {
            self.request_key_frame();
        }
    }

    pub(crate) fn producer_new_rtp_stream(&self, mapped_ssrc: u32, score: u8) {
        if let Some(idx) = self.spatial_idx_of_ssrc(mapped_ssrc) {
            let mut layers = self.inner.layers.lock();
            if let Some(slot) = layers.producer_scores.get_mut(usize::from(idx)) {
                *slot = Some(score);
            }
        }
        self.recompute_target_layers();
    }

    pub(crate) fn producer_rtp_stream_score(&self, mapped_ssrc: u32, score: u8, _previous: u8) {
        let consumer_score = {
            let mut layers = self.inner.layers.lock();
            if let Some(idx) = self.spatial_idx_of_ssrc(mapped_ssrc) {
                if let Some(slot) = layers.producer_scores.get_mut(usize::from(idx)) {
                    *slot = Some(score);
                }
            }
            self.score_with(&layers)
        };

        self.inner.handlers.score.call(|callback| {
            callback(&consumer_score);
        });
        self.notify(
            "score",
            serde_json::to_value(&consumer_score).unwrap_or_default(),
        );

        self.recompute_target_layers();
    }

    pub(crate) fn producer_rtcp_sender_report(&self, _mapped_ssrc: u32, _first: bool) {
        // Timing alignment point for the outbound stream; the rewrite offsets
        // already keep outbound timestamps monotonic, so nothing to do here.
    }

    /// The bound producer closed: self-destruct. The owning transport drops
    /// the consumer; router index cleanup is the caller's responsibility.
    pub(crate) fn producer_closed(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("producer_closed()");

        self.inner.handlers.producer_close.call_simple();
        self.notify("producerclose", Value::Null);

        if let Some(transport) = self.inner.transport.upgrade() {
            transport.remove_consumer(&self.inner.id);
        }
    }

    /// Mark closed without producer-side cleanup (request path and transport
    /// teardown).
    pub(crate) fn mark_closed(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn dump(&self) -> Result<Option<Value>, RequestError> {
        debug!("dump()");

        let layers = self.inner.layers.lock();
        to_response_data(&ConsumerDump {
            id: self.inner.id.clone(),
            producer_id: self.inner.producer_id.clone(),
            kind: self.inner.kind,
            r#type: self.inner.r#type,
            rtp_parameters: self.inner.rtp_parameters.clone(),
            consumable_rtp_encodings: self.inner.consumable_rtp_encodings.clone(),
            paused: self.paused(),
            producer_paused: self.producer_paused(),
            priority: self.priority(),
            preferred_layers: layers.preferred,
            target_layers: layers.target,
            current_layers: layers.current,
        })
    }

    pub(crate) fn stats(&self) -> ConsumerStat {
        ConsumerStat {
            ssrc: self.outbound_ssrc(),
            kind: self.inner.kind,
            packet_count: self.inner.packet_count.load(Ordering::Relaxed),
            byte_count: self.inner.byte_count.load(Ordering::Relaxed),
            remote_fraction_lost: self.inner.remote_fraction_lost.load(Ordering::SeqCst),
            score: self.score(),
        }
    }

    /// Callback is called when the consumer is paused.
    pub fn on_pause<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.pause.add(Arc::new(callback))
    }

    /// Callback is called when the consumer is resumed.
    pub fn on_resume<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.resume.add(Arc::new(callback))
    }

    /// Callback is called when the bound producer is paused.
    pub fn on_producer_pause<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.producer_pause.add(Arc::new(callback))
    }

    /// Callback is called when the bound producer is resumed.
    pub fn on_producer_resume<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.producer_resume.add(Arc::new(callback))
    }

    /// Callback is called when the consumer score changes.
    pub fn on_score<F: Fn(&ConsumerScore) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.score.add(Arc::new(callback))
    }

    /// Callback is called when the forwarded layers change.
    pub fn on_layers_change<F: Fn(Option<ConsumerLayers>) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.layers_change.add(Arc::new(callback))
    }

    /// Callback is called when the bound producer closes.
    pub fn on_producer_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.producer_close.add(Box::new(callback))
    }

    /// Callback is called when the consumer is closed for whatever reason.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }

    fn score_with(&self, layers: &Layers) -> ConsumerScore {
        let fraction_lost = self.inner.remote_fraction_lost.load(Ordering::SeqCst);
        let producer_scores = layers
            .producer_scores
            .iter()
            .map(|score| score.unwrap_or(0))
            .collect::<Vec<_>>();
        let producer_score = layers
            .current
            .and_then(|current| producer_scores.get(usize::from(current.spatial_layer)).copied())
            .unwrap_or_else(|| producer_scores.iter().copied().max().unwrap_or(0));

        ConsumerScore {
            score: 10u8.saturating_sub(fraction_lost / 25),
            producer_score,
            producer_scores,
        }
    }

    fn emit_layers_change(&self, layers: Option<ConsumerLayers>) {
        self.inner.handlers.layers_change.call(|callback| {
            callback(layers);
        });
        self.notify(
            "layerschange",
            serde_json::to_value(layers).unwrap_or_default(),
        );
    }

    fn notify(&self, event: &'static str, data: Value) {
        self.inner
            .context
            .control
            .notifications
            .notify(self.inner.id.as_str(), event, data);
    }
}
