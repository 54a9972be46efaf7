//! A producer ingests one publisher's RTP streams, scores them, rewrites
//! their SSRCs to router-unique mapped values and hands every packet to the
//! router for fan-out.

use crate::channel::RequestError;
use crate::messages::to_response_data;
use crate::router::transport::WeakTransport;
use crate::router::WeakRouter;
use crate::rtp_packet::{RtpPacket, VideoOrientation};
use crate::rtp_parameters::{MediaKind, RtpMapping, RtpParameters};
use crate::string_based_wrapper_type;
use crate::worker::WorkerContext;
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use log::{debug, warn};
use nohash_hasher::IntMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

string_based_wrapper_type!(
    /// [`Producer`] identifier.
    ProducerId
);

/// Default hold-off between upstream keyframe requests for the same SSRC.
const DEFAULT_KEY_FRAME_REQUEST_DELAY: Duration = Duration::from_millis(250);

/// Creation data of a producer, as sent by the controller.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerOptions {
    pub kind: MediaKind,
    /// RTP parameters defining what the endpoint is sending.
    pub rtp_parameters: RtpParameters,
    /// Translation table to router-unique payload types and SSRCs.
    pub rtp_mapping: RtpMapping,
    /// Milliseconds before a repeated keyframe request for the same SSRC is
    /// forwarded upstream again. Absent means the default (250 ms), zero
    /// disables coalescing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_frame_request_delay: Option<u32>,
    /// Whether the producer starts paused.
    #[serde(default)]
    pub paused: bool,
}

/// Producer type, derived from its encodings.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerType {
    /// A single RTP stream with no spatial/temporal layers.
    Simple,
    /// Two or more RTP streams, each with one or more temporal layers.
    Simulcast,
    /// A single RTP stream with spatial/temporal layers.
    Svc,
}

impl ProducerType {
    fn from_parameters(rtp_parameters: &RtpParameters) -> Self {
        if rtp_parameters.encodings.len() > 1 {
            return ProducerType::Simulcast;
        }

        let layered = rtp_parameters
            .encodings
            .first()
            .and_then(|encoding| encoding.scalability_mode)
            .map(|mode| mode.spatial_layers > 1)
            .unwrap_or_default();

        if layered {
            ProducerType::Svc
        } else {
            ProducerType::Simple
        }
    }
}

/// Score of one RTP stream of the producer (0 to 10).
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerScore {
    /// RTP stream SSRC (as sent by the endpoint).
    pub ssrc: u32,
    /// RTP stream RID value, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    /// Transmission quality, 10 is perfect.
    pub score: u8,
}

/// Per-stream state for one inbound SSRC.
#[derive(Debug, Clone)]
pub(crate) struct RtpStreamRecv {
    pub(crate) ssrc: u32,
    pub(crate) rid: Option<String>,
    pub(crate) encoding_idx: usize,
    pub(crate) mapped_ssrc: u32,
    pub(crate) score: u8,
    packet_count: u64,
    byte_count: u64,
    // Sequence accounting for the loss ratio between sender reports.
    received_since_report: u64,
    highest_seen_since_report: Option<u16>,
    first_seq_since_report: Option<u16>,
    got_sender_report: bool,
}

impl RtpStreamRecv {
    fn new(ssrc: u32, rid: Option<String>, encoding_idx: usize, mapped_ssrc: u32) -> Self {
        Self {
            ssrc,
            rid,
            encoding_idx,
            mapped_ssrc,
            score: 10,
            packet_count: 0,
            byte_count: 0,
            received_since_report: 0,
            highest_seen_since_report: None,
            first_seq_since_report: None,
            got_sender_report: false,
        }
    }

    fn record_packet(&mut self, packet: &RtpPacket) {
        self.packet_count += 1;
        self.byte_count += packet.size() as u64;
        self.received_since_report += 1;

        let seq = packet.sequence_number;
        if self.first_seq_since_report.is_none() {
            self.first_seq_since_report = Some(seq);
        }
        match self.highest_seen_since_report {
            Some(highest) if seq.wrapping_sub(highest) >= 0x8000 => (),
            _ => self.highest_seen_since_report = Some(seq),
        }
    }

    /// Recompute the health score from the loss ratio observed since the
    /// previous sender report. Returns `Some((score, previous))` on change.
    fn update_score(&mut self) -> Option<(u8, u8)> {
        let expected = match (self.first_seq_since_report, self.highest_seen_since_report) {
            (Some(first), Some(highest)) => u64::from(highest.wrapping_sub(first)) + 1,
            _ => 0,
        };
        let received = self.received_since_report;
        self.first_seq_since_report = None;
        self.highest_seen_since_report = None;
        self.received_since_report = 0;

        if expected == 0 {
            return None;
        }

        let lost = expected.saturating_sub(received);
        let delivered = ((expected - lost) * 10 + expected / 2) / expected;
        let score = delivered.min(10) as u8;

        if score == self.score {
            return None;
        }

        let previous_score = self.score;
        self.score = score;

        Some((score, previous_score))
    }
}

/// Snapshot of one stream for dump/stats.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerStat {
    pub ssrc: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    pub mapped_ssrc: u32,
    pub score: u8,
    pub packet_count: u64,
    pub byte_count: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ProducerDump {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub r#type: ProducerType,
    pub paused: bool,
    pub rtp_parameters: RtpParameters,
    pub rtp_mapping: RtpMapping,
    pub rtp_streams: Vec<ProducerStat>,
}

/// An RTCP sender report delivered by the transport driver.
#[derive(Debug, Copy, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpSenderReport {
    pub ssrc: u32,
    pub ntp_sec: u32,
    pub ntp_frac: u32,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

#[derive(Default)]
struct Handlers {
    score: Bag<Arc<dyn Fn(&[ProducerScore]) + Send + Sync>>,
    pause: Bag<Arc<dyn Fn() + Send + Sync>>,
    resume: Bag<Arc<dyn Fn() + Send + Sync>>,
    video_orientation_change: Bag<Arc<dyn Fn(VideoOrientation) + Send + Sync>>,
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

pub(crate) struct Inner {
    id: ProducerId,
    kind: MediaKind,
    r#type: ProducerType,
    rtp_parameters: RtpParameters,
    rtp_mapping: RtpMapping,
    key_frame_request_delay: Option<Duration>,
    paused: AtomicBool,
    streams: Mutex<IntMap<u32, RtpStreamRecv>>,
    last_key_frame_request: Mutex<IntMap<u32, Instant>>,
    video_orientation: Mutex<Option<VideoOrientation>>,
    dropped_packets: AtomicUsize,
    context: Arc<WorkerContext>,
    transport: WeakTransport,
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

/// An audio or video source being injected into a router.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakProducer {
    inner: Weak<Inner>,
}

impl WeakProducer {
    pub(crate) fn upgrade(&self) -> Option<Producer> {
        Some(Producer {
            inner: self.inner.upgrade()?,
        })
    }
}

impl Producer {
    pub(crate) fn new(
        id: ProducerId,
        options: ProducerOptions,
        context: Arc<WorkerContext>,
        transport: WeakTransport,
        router: WeakRouter,
    ) -> Result<Self, RequestError> {
        debug!("new()");

        let ProducerOptions {
            kind,
            rtp_parameters,
            rtp_mapping,
            key_frame_request_delay,
            paused,
        } = options;

        if rtp_parameters.codecs.is_empty() {
            return Err(RequestError::TypeError(
                "rtpParameters must include at least one codec".into(),
            ));
        }
        if rtp_parameters.encodings.is_empty() {
            return Err(RequestError::TypeError(
                "rtpParameters must include at least one encoding".into(),
            ));
        }
        if rtp_mapping.encodings.len() != rtp_parameters.encodings.len() {
            return Err(RequestError::TypeError(
                "rtpMapping does not match rtpParameters encodings".into(),
            ));
        }

        let key_frame_request_delay = match key_frame_request_delay {
            None => Some(DEFAULT_KEY_FRAME_REQUEST_DELAY),
            Some(0) => None,
            Some(delay) => Some(Duration::from_millis(u64::from(delay))),
        };

        let r#type = ProducerType::from_parameters(&rtp_parameters);

        let inner = Arc::new(Inner {
            id,
            kind,
            r#type,
            rtp_parameters,
            rtp_mapping,
            key_frame_request_delay,
            paused: AtomicBool::new(paused),
            streams: Mutex::default(),
            last_key_frame_request: Mutex::default(),
            video_orientation: Mutex::default(),
            dropped_packets: AtomicUsize::new(0),
            context,
            transport,
            router,
            handlers: Handlers::default(),
            closed: AtomicBool::new(false),
        });

        Ok(Self { inner })
    }

    /// Producer identifier.
    pub fn id(&self) -> &ProducerId {
        &self.inner.id
    }

    /// Media kind.
    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    /// Producer type.
    pub fn r#type(&self) -> ProducerType {
        self.inner.r#type
    }

    /// RTP parameters the endpoint is sending with.
    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.inner.rtp_parameters
    }

    /// Translation table to router-unique values.
    pub fn rtp_mapping(&self) -> &RtpMapping {
        &self.inner.rtp_mapping
    }

    /// Whether the producer is paused.
    pub fn paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Whether the producer is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Current score of every RTP stream, ordered by encoding.
    pub fn score(&self) -> Vec<ProducerScore> {
        let streams = self.inner.streams.lock();
        let mut scores = streams
            .values()
            .map(|stream| {
                (
                    stream.encoding_idx,
                    ProducerScore {
                        ssrc: stream.ssrc,
                        rid: stream.rid.clone(),
                        score: stream.score,
                    },
                )
            })
            .collect::<Vec<_>>();
        scores.sort_by_key(|(encoding_idx, _)| *encoding_idx);

        scores.into_iter().map(|(_, score)| score).collect()
    }

    pub(crate) fn downgrade(&self) -> WeakProducer {
        WeakProducer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Ingest one decoded RTP packet from the owning transport.
    ///
    /// Rewrites the SSRC to its mapped value and hands the packet to the
    /// router, which fans it out to subscribed consumers and RTP observers.
    pub fn receive_rtp_packet(&self, mut packet: RtpPacket) {
        if self.inner.closed.load(Ordering::SeqCst) || self.paused() {
            self.inner.dropped_packets.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mapped_ssrc = loop {
            {
                let mut streams = self.inner.streams.lock();
                if let Some(stream) = streams.get_mut(&packet.ssrc) {
                    stream.record_packet(&packet);
                    break stream.mapped_ssrc;
                }
            }

            // Unknown SSRC: match it against the declared encodings or drop
            // the packet silently.
            let (encoding_idx, encoding) = match self
                .inner
                .rtp_mapping
                .encoding_for(packet.ssrc, packet.rid.as_deref())
            {
                Some(found) => found,
                None => {
                    self.inner.dropped_packets.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "receive_rtp_packet() | ignoring packet with unknown ssrc {}",
                        packet.ssrc
                    );
                    return;
                }
            };

            let stream = RtpStreamRecv::new(
                packet.ssrc,
                encoding.rid.clone(),
                encoding_idx,
                encoding.mapped_ssrc,
            );
            let (mapped_ssrc, score) = (stream.mapped_ssrc, stream.score);
            let inserted = {
                let mut streams = self.inner.streams.lock();
                if streams.contains_key(&packet.ssrc) {
                    false
                } else {
                    streams.insert(packet.ssrc, stream);
                    true
                }
            };

            // The new-stream event is raised at most once per SSRC.
            if inserted {
                if let Some(router) = self.inner.router.upgrade() {
                    router.on_transport_producer_new_rtp_stream(self, mapped_ssrc, score);
                }
            }
        };

        if packet.is_key_frame {
            // A keyframe satisfies any pending upstream request for this SSRC.
            self.inner.last_key_frame_request.lock().remove(&packet.ssrc);
        }

        if self.inner.kind == MediaKind::Video {
            if let Some(orientation) = packet.video_orientation {
                self.update_video_orientation(orientation);
            }
        }

        packet.ssrc = mapped_ssrc;

        if let Some(router) = self.inner.router.upgrade() {
            router.on_transport_producer_rtp_packet_received(self, &packet);
        }
    }

    /// Process an RTCP sender report from the publishing endpoint.
    ///
    /// Recomputes the stream's health score from the loss ratio observed
    /// since the previous report and fans out score and timing updates.
    pub fn receive_rtcp_sender_report(&self, report: RtcpSenderReport) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let (mapped_ssrc, first, score_change) = {
            let mut streams = self.inner.streams.lock();
            let stream = match streams.get_mut(&report.ssrc) {
                Some(stream) => stream,
                None => {
                    warn!(
                        "receive_rtcp_sender_report() | ignoring report for unknown ssrc {}",
                        report.ssrc
                    );
                    return;
                }
            };

            let first = !stream.got_sender_report;
            stream.got_sender_report = true;
            let score_change = stream.update_score();

            (stream.mapped_ssrc, first, score_change)
        };

        let router = match self.inner.router.upgrade() {
            Some(router) => router,
            None => return,
        };

        router.on_transport_producer_rtcp_sender_report(self, mapped_ssrc, first);

        if let Some((score, previous_score)) = score_change {
            let scores = self.score();
            self.inner.handlers.score.call(|callback| {
                callback(&scores);
            });
            self.notify("score", serde_json::to_value(&scores).unwrap_or_default());

            router.on_transport_producer_rtp_stream_score(self, mapped_ssrc, score, previous_score);
        }
    }

    /// Forward a keyframe request upstream, coalescing repeats.
    ///
    /// `mapped_ssrc` is reverse-mapped to the SSRC the endpoint sends with;
    /// a request within the hold-off window of a previous one for the same
    /// SSRC is dropped.
    pub(crate) fn request_key_frame(&self, mapped_ssrc: u32) {
        if self.inner.kind != MediaKind::Video || self.paused() {
            return;
        }

        // Reverse map through the declared encodings so a layer can be
        // requested before its first packet; fall back to live streams for
        // RID-announced encodings.
        let ssrc = self
            .inner
            .rtp_mapping
            .encodings
            .iter()
            .find(|encoding| encoding.mapped_ssrc == mapped_ssrc)
            .and_then(|encoding| encoding.ssrc)
            .or_else(|| {
                let streams = self.inner.streams.lock();
                streams
                    .values()
                    .find(|stream| stream.mapped_ssrc == mapped_ssrc)
                    .map(|stream| stream.ssrc)
            });
        let ssrc = match ssrc {
            Some(ssrc) => ssrc,
            None => return,
        };

        if let Some(delay) = self.inner.key_frame_request_delay {
            let mut last_requests = self.inner.last_key_frame_request.lock();
            let now = Instant::now();
            if let Some(last) = last_requests.get(&ssrc) {
                if now.duration_since(*last) < delay {
                    return;
                }
            }
            last_requests.insert(ssrc, now);
        }

        if let Some(transport) = self.inner.transport.upgrade() {
            transport.request_key_frame_upstream(ssrc);
        }
    }

    /// Worst (maximum) remote fraction lost reported by any consumer of this
    /// producer for the given mapped SSRC, for the RTCP feedback generator.
    pub fn worst_remote_fraction_lost(&self, mapped_ssrc: u32) -> u8 {
        match self.inner.router.upgrade() {
            Some(router) => router.on_transport_need_worst_remote_fraction_lost(&self.inner.id, mapped_ssrc),
            None => 0,
        }
    }

    pub(crate) fn pause(&self) {
        debug!("pause()");

        let was_paused = self.inner.paused.swap(true, Ordering::SeqCst);

        if !was_paused {
            self.inner.handlers.pause.call_simple();

            if let Some(router) = self.inner.router.upgrade() {
                router.on_transport_producer_paused(&self.inner.id);
            }
        }
    }

    pub(crate) fn resume(&self) {
        debug!("resume()");

        let was_paused = self.inner.paused.swap(false, Ordering::SeqCst);

        if was_paused {
            self.inner.handlers.resume.call_simple();

            if let Some(router) = self.inner.router.upgrade() {
                router.on_transport_producer_resumed(&self.inner.id);
            }
        }
    }

    /// Mark closed. Index and subscriber cleanup is driven by the router
    /// through `on_transport_producer_closed`.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn dump(&self) -> Result<Option<Value>, RequestError> {
        debug!("dump()");

        to_response_data(&ProducerDump {
            id: self.inner.id.clone(),
            kind: self.inner.kind,
            r#type: self.inner.r#type,
            paused: self.paused(),
            rtp_parameters: self.inner.rtp_parameters.clone(),
            rtp_mapping: self.inner.rtp_mapping.clone(),
            rtp_streams: self.stats(),
        })
    }

    pub(crate) fn stats(&self) -> Vec<ProducerStat> {
        let streams = self.inner.streams.lock();
        let mut stats = streams
            .values()
            .map(|stream| ProducerStat {
                ssrc: stream.ssrc,
                rid: stream.rid.clone(),
                mapped_ssrc: stream.mapped_ssrc,
                score: stream.score,
                packet_count: stream.packet_count,
                byte_count: stream.byte_count,
            })
            .collect::<Vec<_>>();
        stats.sort_by_key(|stat| stat.mapped_ssrc);

        stats
    }

    /// Callback is called when a stream score changes.
    pub fn on_score<F: Fn(&[ProducerScore]) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.score.add(Arc::new(callback))
    }

    /// Callback is called when the producer is paused.
    pub fn on_pause<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.pause.add(Arc::new(callback))
    }

    /// Callback is called when the producer is resumed.
    pub fn on_resume<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.resume.add(Arc::new(callback))
    }

    /// Callback is called when the video orientation changes.
    pub fn on_video_orientation_change<F: Fn(VideoOrientation) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner
            .handlers
            .video_orientation_change
            .add(Arc::new(callback))
    }

    /// Callback is called when the producer is closed for whatever reason.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }

    fn update_video_orientation(&self, orientation: VideoOrientation) {
        let mut current = self.inner.video_orientation.lock();
        if *current == Some(orientation) {
            return;
        }
        current.replace(orientation);
        drop(current);

        self.inner.handlers.video_orientation_change.call(|callback| {
            callback(orientation);
        });
        self.notify(
            "videoorientationchange",
            serde_json::to_value(orientation).unwrap_or_default(),
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
