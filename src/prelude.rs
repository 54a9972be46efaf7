//! Common types, re-exported for convenience.

pub use crate::channel::{
    ChannelNotificationSink, ChannelRequest, ControlMessage, ControlPipe,
    PayloadChannelNotification, PayloadChannelRequest, PayloadNotificationSink, RequestError,
    RequestResult, ResponseSink,
};
pub use crate::consumer::{Consumer, ConsumerId, ConsumerLayers, ConsumerType};
pub use crate::data_consumer::{DataConsumer, DataConsumerId, DataConsumerType};
pub use crate::data_producer::{DataProducer, DataProducerId, DataProducerType};
pub use crate::data_structures::{
    DtlsParameters, DtlsState, IceParameters, IceState, ListenIp, Protocol, SctpState,
    TransportTuple,
};
pub use crate::messages::{Internal, PayloadEvent, PayloadMethod, RequestMethod};
pub use crate::producer::{Producer, ProducerId, ProducerType};
pub use crate::router::{Router, RouterId};
pub use crate::rtp_observer::{RtpObserver, RtpObserverId};
pub use crate::rtp_packet::{RtpPacket, RtpPacketDecodeError, RtpPacketDecoder};
pub use crate::rtp_parameters::{MediaKind, RtpMapping, RtpParameters};
pub use crate::sctp_parameters::SctpStreamParameters;
pub use crate::transport::{
    Transport, TransportDriver, TransportDriverError, TransportDriverFactory,
    TransportDriverOptions, TransportId, TransportRemoteParameters,
};
pub use crate::webrtc_server::{WebRtcServer, WebRtcServerId};
pub use crate::worker::{Worker, WorkerLogLevel, WorkerLogTag, WorkerSettings};
