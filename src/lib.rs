//! Selective Forwarding Unit media worker core.
//!
//! An in-process engine that routes real-time media and data streams between
//! network transports without transcoding. Peers connect via WebRTC-style
//! transports; the engine multiplexes their RTP/RTCP and SCTP streams through
//! named routing domains ([`router::Router`]s), selectively forwarding
//! packets from producers to consumers with per-subscriber layer selection,
//! keyframe coordination, and feedback aggregation.
//!
//! Wire-level concerns (ICE, DTLS, SRTP, SCTP packetization, RTP parsing)
//! and the parent-process IPC live behind capability traits the embedder
//! implements: [`transport::TransportDriver`],
//! [`rtp_packet::RtpPacketDecoder`] and the sinks in [`channel`].

pub mod channel;
pub mod data_structures;
mod macros;
pub mod messages;
pub mod prelude;
pub mod router;
pub mod rtp_packet;
pub mod rtp_parameters;
pub mod scalability_modes;
pub mod sctp_parameters;
pub mod srtp_parameters;
pub mod webrtc_server;
pub mod worker;

pub use router::active_speaker_observer;
pub use router::audio_level_observer;
pub use router::consumer;
pub use router::data_consumer;
pub use router::data_producer;
pub use router::direct_transport;
pub use router::pipe_transport;
pub use router::plain_transport;
pub use router::producer;
pub use router::rtp_observer;
pub use router::transport;
pub use router::webrtc_transport;
