//! Typed request methods and the addressing chain.
//!
//! The controller addresses entities through the `internal` record carrying
//! the minimal chain of ids needed to resolve the target. It is validated
//! once at each dispatch boundary; handlers past that point work with typed
//! ids only.

use crate::channel::RequestError;
use crate::router::consumer::ConsumerId;
use crate::router::data_consumer::DataConsumerId;
use crate::router::data_producer::DataProducerId;
use crate::router::producer::ProducerId;
use crate::router::rtp_observer::RtpObserverId;
use crate::router::transport::TransportId;
use crate::router::RouterId;
use crate::webrtc_server::WebRtcServerId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Methods of the control channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum RequestMethod {
    #[serde(rename = "worker.close")]
    WorkerClose,
    #[serde(rename = "worker.dump")]
    WorkerDump,
    #[serde(rename = "worker.getResourceUsage")]
    WorkerGetResourceUsage,
    #[serde(rename = "worker.updateSettings")]
    WorkerUpdateSettings,
    #[serde(rename = "worker.createWebRtcServer")]
    WorkerCreateWebRtcServer,
    #[serde(rename = "worker.createRouter")]
    WorkerCreateRouter,
    #[serde(rename = "webRtcServer.close")]
    WebRtcServerClose,
    #[serde(rename = "webRtcServer.dump")]
    WebRtcServerDump,
    #[serde(rename = "router.close")]
    RouterClose,
    #[serde(rename = "router.dump")]
    RouterDump,
    #[serde(rename = "router.createWebRtcTransport")]
    RouterCreateWebRtcTransport,
    #[serde(rename = "router.createPlainTransport")]
    RouterCreatePlainTransport,
    #[serde(rename = "router.createPipeTransport")]
    RouterCreatePipeTransport,
    #[serde(rename = "router.createDirectTransport")]
    RouterCreateDirectTransport,
    #[serde(rename = "router.createAudioLevelObserver")]
    RouterCreateAudioLevelObserver,
    #[serde(rename = "router.createActiveSpeakerObserver")]
    RouterCreateActiveSpeakerObserver,
    #[serde(rename = "rtpObserver.close")]
    RtpObserverClose,
    #[serde(rename = "rtpObserver.pause")]
    RtpObserverPause,
    #[serde(rename = "rtpObserver.resume")]
    RtpObserverResume,
    #[serde(rename = "rtpObserver.addProducer")]
    RtpObserverAddProducer,
    #[serde(rename = "rtpObserver.removeProducer")]
    RtpObserverRemoveProducer,
    #[serde(rename = "transport.close")]
    TransportClose,
    #[serde(rename = "transport.dump")]
    TransportDump,
    #[serde(rename = "transport.getStats")]
    TransportGetStats,
    #[serde(rename = "transport.connect")]
    TransportConnect,
    #[serde(rename = "transport.restartIce")]
    TransportRestartIce,
    #[serde(rename = "transport.setMaxIncomingBitrate")]
    TransportSetMaxIncomingBitrate,
    #[serde(rename = "transport.produce")]
    TransportProduce,
    #[serde(rename = "transport.consume")]
    TransportConsume,
    #[serde(rename = "transport.produceData")]
    TransportProduceData,
    #[serde(rename = "transport.consumeData")]
    TransportConsumeData,
    #[serde(rename = "producer.close")]
    ProducerClose,
    #[serde(rename = "producer.dump")]
    ProducerDump,
    #[serde(rename = "producer.getStats")]
    ProducerGetStats,
    #[serde(rename = "producer.pause")]
    ProducerPause,
    #[serde(rename = "producer.resume")]
    ProducerResume,
    #[serde(rename = "consumer.close")]
    ConsumerClose,
    #[serde(rename = "consumer.dump")]
    ConsumerDump,
    #[serde(rename = "consumer.getStats")]
    ConsumerGetStats,
    #[serde(rename = "consumer.pause")]
    ConsumerPause,
    #[serde(rename = "consumer.resume")]
    ConsumerResume,
    #[serde(rename = "consumer.setPreferredLayers")]
    ConsumerSetPreferredLayers,
    #[serde(rename = "consumer.setPriority")]
    ConsumerSetPriority,
    #[serde(rename = "consumer.unsetPriority")]
    ConsumerUnsetPriority,
    #[serde(rename = "consumer.requestKeyFrame")]
    ConsumerRequestKeyFrame,
    #[serde(rename = "dataProducer.close")]
    DataProducerClose,
    #[serde(rename = "dataProducer.dump")]
    DataProducerDump,
    #[serde(rename = "dataProducer.getStats")]
    DataProducerGetStats,
    #[serde(rename = "dataConsumer.close")]
    DataConsumerClose,
    #[serde(rename = "dataConsumer.dump")]
    DataConsumerDump,
    #[serde(rename = "dataConsumer.getStats")]
    DataConsumerGetStats,
    #[serde(rename = "dataConsumer.getBufferedAmount")]
    DataConsumerGetBufferedAmount,
    #[serde(rename = "dataConsumer.setBufferedAmountLowThreshold")]
    DataConsumerSetBufferedAmountLowThreshold,
    #[serde(rename = "dataConsumer.setSubchannels")]
    DataConsumerSetSubchannels,
}

impl RequestMethod {
    /// Wire name of the method, for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMethod::WorkerClose => "worker.close",
            RequestMethod::WorkerDump => "worker.dump",
            RequestMethod::WorkerGetResourceUsage => "worker.getResourceUsage",
            RequestMethod::WorkerUpdateSettings => "worker.updateSettings",
            RequestMethod::WorkerCreateWebRtcServer => "worker.createWebRtcServer",
            RequestMethod::WorkerCreateRouter => "worker.createRouter",
            RequestMethod::WebRtcServerClose => "webRtcServer.close",
            RequestMethod::WebRtcServerDump => "webRtcServer.dump",
            RequestMethod::RouterClose => "router.close",
            RequestMethod::RouterDump => "router.dump",
            RequestMethod::RouterCreateWebRtcTransport => "router.createWebRtcTransport",
            RequestMethod::RouterCreatePlainTransport => "router.createPlainTransport",
            RequestMethod::RouterCreatePipeTransport => "router.createPipeTransport",
            RequestMethod::RouterCreateDirectTransport => "router.createDirectTransport",
            RequestMethod::RouterCreateAudioLevelObserver => "router.createAudioLevelObserver",
            RequestMethod::RouterCreateActiveSpeakerObserver => {
                "router.createActiveSpeakerObserver"
            }
            RequestMethod::RtpObserverClose => "rtpObserver.close",
            RequestMethod::RtpObserverPause => "rtpObserver.pause",
            RequestMethod::RtpObserverResume => "rtpObserver.resume",
            RequestMethod::RtpObserverAddProducer => "rtpObserver.addProducer",
            RequestMethod::RtpObserverRemoveProducer => "rtpObserver.removeProducer",
            RequestMethod::TransportClose => "transport.close",
            RequestMethod::TransportDump => "transport.dump",
            RequestMethod::TransportGetStats => "transport.getStats",
            RequestMethod::TransportConnect => "transport.connect",
            RequestMethod::TransportRestartIce => "transport.restartIce",
            RequestMethod::TransportSetMaxIncomingBitrate => "transport.setMaxIncomingBitrate",
            RequestMethod::TransportProduce => "transport.produce",
            RequestMethod::TransportConsume => "transport.consume",
            RequestMethod::TransportProduceData => "transport.produceData",
            RequestMethod::TransportConsumeData => "transport.consumeData",
            RequestMethod::ProducerClose => "producer.close",
            RequestMethod::ProducerDump => "producer.dump",
            RequestMethod::ProducerGetStats => "producer.getStats",
            RequestMethod::ProducerPause => "producer.pause",
            RequestMethod::ProducerResume => "producer.resume",
            RequestMethod::ConsumerClose => "consumer.close",
            RequestMethod::ConsumerDump => "consumer.dump",
            RequestMethod::ConsumerGetStats => "consumer.getStats",
            RequestMethod::ConsumerPause => "consumer.pause",
            RequestMethod::ConsumerResume => "consumer.resume",
            RequestMethod::ConsumerSetPreferredLayers => "consumer.setPreferredLayers",
            RequestMethod::ConsumerSetPriority => "consumer.setPriority",
            RequestMethod::ConsumerUnsetPriority => "consumer.unsetPriority",
            RequestMethod::ConsumerRequestKeyFrame => "consumer.requestKeyFrame",
            RequestMethod::DataProducerClose => "dataProducer.close",
            RequestMethod::DataProducerDump => "dataProducer.dump",
            RequestMethod::DataProducerGetStats => "dataProducer.getStats",
            RequestMethod::DataConsumerClose => "dataConsumer.close",
            RequestMethod::DataConsumerDump => "dataConsumer.dump",
            RequestMethod::DataConsumerGetStats => "dataConsumer.getStats",
            RequestMethod::DataConsumerGetBufferedAmount => "dataConsumer.getBufferedAmount",
            RequestMethod::DataConsumerSetBufferedAmountLowThreshold => {
                "dataConsumer.setBufferedAmountLowThreshold"
            }
            RequestMethod::DataConsumerSetSubchannels => "dataConsumer.setSubchannels",
        }
    }
}

/// Methods of the payload channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum PayloadMethod {
    #[serde(rename = "dataProducer.send")]
    DataProducerSend,
}

/// Notification events of the payload channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
pub enum PayloadEvent {
    #[serde(rename = "producer.send")]
    ProducerSend,
    #[serde(rename = "dataProducer.send")]
    DataProducerSend,
}

/// The addressing record of a request or notification.
///
/// Carries the minimal chain of ids needed to resolve the target entity.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Internal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_rtc_server_id: Option<WebRtcServerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_id: Option<RouterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<TransportId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<ProducerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<ConsumerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_producer_id: Option<DataProducerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_consumer_id: Option<DataConsumerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtp_observer_id: Option<RtpObserverId>,
}

impl Internal {
    pub fn web_rtc_server_id(&self) -> Result<&WebRtcServerId, RequestError> {
        self.web_rtc_server_id
            .as_ref()
            .ok_or_else(|| RequestError::InvalidRequest("missing internal.webRtcServerId".into()))
    }

    pub fn router_id(&self) -> Result<&RouterId, RequestError> {
        self.router_id
            .as_ref()
            .ok_or_else(|| RequestError::InvalidRequest("missing internal.routerId".into()))
    }

    pub fn transport_id(&self) -> Result<&TransportId, RequestError> {
        self.transport_id
            .as_ref()
            .ok_or_else(|| RequestError::InvalidRequest("missing internal.transportId".into()))
    }

    pub fn producer_id(&self) -> Result<&ProducerId, RequestError> {
        self.producer_id
            .as_ref()
            .ok_or_else(|| RequestError::InvalidRequest("missing internal.producerId".into()))
    }

    pub fn consumer_id(&self) -> Result<&ConsumerId, RequestError> {
        self.consumer_id
            .as_ref()
            .ok_or_else(|| RequestError::InvalidRequest("missing internal.consumerId".into()))
    }

    pub fn data_producer_id(&self) -> Result<&DataProducerId, RequestError> {
        self.data_producer_id
            .as_ref()
            .ok_or_else(|| RequestError::InvalidRequest("missing internal.dataProducerId".into()))
    }

    pub fn data_consumer_id(&self) -> Result<&DataConsumerId, RequestError> {
        self.data_consumer_id
            .as_ref()
            .ok_or_else(|| RequestError::InvalidRequest("missing internal.dataConsumerId".into()))
    }

    pub fn rtp_observer_id(&self) -> Result<&RtpObserverId, RequestError> {
        self.rtp_observer_id
            .as_ref()
            .ok_or_else(|| RequestError::InvalidRequest("missing internal.rtpObserverId".into()))
    }
}

/// Deserialize a request's `data` into its typed form.
pub(crate) fn parse_request_data<T: DeserializeOwned>(data: &Value) -> Result<T, RequestError> {
    serde_json::from_value(data.clone()).map_err(|error| RequestError::TypeError(error.to_string()))
}

/// Serialize a typed response into the `accept` data.
pub(crate) fn to_response_data<T: Serialize>(data: &T) -> Result<Option<Value>, RequestError> {
    serde_json::to_value(data)
        .map(Some)
        .map_err(|error| RequestError::Fatal(format!("failed to serialize response: {}", error)))
}
