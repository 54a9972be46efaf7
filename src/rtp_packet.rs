//! Decoded view of an RTP packet as it travels through the forwarding core.
//!
//! The core never parses RTP itself. The embedder supplies an
//! [`RtpPacketDecoder`] that turns raw bytes into [`RtpPacket`]s with the
//! codec-specific bits (keyframe flag, layer ids) already extracted, and the
//! core only rewrites the routing-relevant header fields on the way out.

use bytes::Bytes;
use serde_repr::{Deserialize_repr, Serialize_repr};
use thiserror::Error;

/// Rotation angle from the video orientation header extension.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize_repr, Serialize_repr)]
#[repr(u16)]
pub enum Rotation {
    /// 0
    None = 0,
    /// 90 (clockwise)
    Clockwise = 90,
    /// 180
    Rotate180 = 180,
    /// 270 (90 counter-clockwise)
    CounterClockwise = 270,
}

/// Video orientation as signalled by the `urn:3gpp:video-orientation` RTP
/// header extension.
#[derive(Debug, Copy, Clone, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct VideoOrientation {
    /// Whether the source is a video camera.
    pub camera: bool,
    /// Whether the video source is flipped.
    pub flip: bool,
    /// Rotation degrees.
    pub rotation: Rotation,
}

/// A decoded RTP packet.
///
/// Header fields the core rewrites (SSRC, sequence number, timestamp) are
/// plain values; the payload is an opaque buffer shared between all consumers
/// of the packet.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub ssrc: u32,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub payload_type: u8,
    pub marker: bool,
    /// Whether this packet starts an independently decodable frame.
    pub is_key_frame: bool,
    /// RID header extension value, when present (simulcast stream tag).
    pub rid: Option<String>,
    /// Spatial layer id for layered encodings.
    pub spatial_layer: Option<u8>,
    /// Temporal layer id for layered encodings.
    pub temporal_layer: Option<u8>,
    /// Audio level in negative dBov from the audio-level header extension.
    pub audio_level: Option<i8>,
    /// Video orientation header extension, when present.
    pub video_orientation: Option<VideoOrientation>,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Error produced by an [`RtpPacketDecoder`] on unparseable input.
#[derive(Debug, Error)]
#[error("malformed RTP packet: {0}")]
pub struct RtpPacketDecodeError(pub String);

/// Capability that turns raw RTP bytes into decoded packets.
///
/// Codec-specific payload inspection (keyframe detection, layer extraction)
/// happens behind this trait; the forwarding core treats its output as ground
/// truth.
pub trait RtpPacketDecoder: Send + Sync {
    fn decode(&self, data: &[u8]) -> Result<RtpPacket, RtpPacketDecodeError>;
}
