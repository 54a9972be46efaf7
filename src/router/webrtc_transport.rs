//! WEBRTC transport variant: ICE + DTLS session state, optionally attached
//! to a shared [`WebRtcServer`](crate::webrtc_server::WebRtcServer) listener.

use crate::data_structures::{DtlsParameters, DtlsState, IceParameters, IceRole, IceState, ListenIp};
use crate::sctp_parameters::NumSctpStreams;
use crate::webrtc_server::{WeakWebRtcServer, WebRtcServerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Creation data of a WebRTC transport.
///
/// Either `listen_ips` or `web_rtc_server_id` must be given: dedicated
/// sockets, or attachment to a shared listen server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listen_ips: Vec<ListenIp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_rtc_server_id: Option<WebRtcServerId>,
    #[serde(default = "default_true")]
    pub enable_udp: bool,
    #[serde(default)]
    pub enable_tcp: bool,
    #[serde(default = "default_true")]
    pub prefer_udp: bool,
    #[serde(default)]
    pub prefer_tcp: bool,
    #[serde(default)]
    pub enable_sctp: bool,
    #[serde(default)]
    pub num_sctp_streams: NumSctpStreams,
    #[serde(default = "default_max_sctp_message_size")]
    pub max_sctp_message_size: u32,
}

fn default_true() -> bool {
    true
}

fn default_max_sctp_message_size() -> u32 {
    262_144
}

pub(crate) struct WebRtcTransportData {
    pub(crate) ice_role: IceRole,
    pub(crate) ice_parameters: Mutex<Option<IceParameters>>,
    pub(crate) ice_state: Mutex<IceState>,
    pub(crate) dtls_state: Mutex<DtlsState>,
    pub(crate) dtls_remote_parameters: Mutex<Option<DtlsParameters>>,
    pub(crate) sctp_enabled: bool,
    pub(crate) web_rtc_server: Mutex<Option<WeakWebRtcServer>>,
}

impl WebRtcTransportData {
    pub(crate) fn new(
        options: &WebRtcTransportOptions,
        ice_parameters: Option<IceParameters>,
    ) -> Self {
        Self {
            ice_role: IceRole::Controlled,
            ice_parameters: Mutex::new(ice_parameters),
            ice_state: Mutex::new(IceState::New),
            dtls_state: Mutex::new(DtlsState::New),
            dtls_remote_parameters: Mutex::default(),
            sctp_enabled: options.enable_sctp,
            web_rtc_server: Mutex::default(),
        }
    }
}
