//! PLAIN transport variant: raw RTP/RTCP over UDP, optionally in comedia
//! mode (remote address learned from the first packet).

use crate::data_structures::{ListenIp, TransportTuple};
use crate::sctp_parameters::NumSctpStreams;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;

/// Creation data of a plain transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainTransportOptions {
    pub listen_ip: ListenIp,
    /// Use the same socket for RTP and RTCP. Default true.
    #[serde(default = "default_true")]
    pub rtcp_mux: bool,
    /// Learn the remote address from the first received packet instead of a
    /// `connect` request. Default false.
    #[serde(default)]
    pub comedia: bool,
    #[serde(default)]
    pub enable_sctp: bool,
    #[serde(default)]
    pub num_sctp_streams: NumSctpStreams,
    #[serde(default)]
    pub enable_srtp: bool,
}

fn default_true() -> bool {
    true
}

pub(crate) struct PlainTransportData {
    pub(crate) comedia: bool,
    pub(crate) sctp_enabled: bool,
    pub(crate) tuple: Mutex<Option<TransportTuple>>,
    pub(crate) connected: AtomicBool,
}

impl PlainTransportData {
    pub(crate) fn new(options: &PlainTransportOptions) -> Self {
        Self {
            comedia: options.comedia,
            sctp_enabled: options.enable_sctp,
            tuple: Mutex::default(),
            connected: AtomicBool::new(false),
        }
    }
}
