//! PIPE transport variant: router-to-router plumbing on the same host or
//! between hosts, forwarding every layer verbatim.

use crate::data_structures::{ListenIp, TransportTuple};
use crate::sctp_parameters::NumSctpStreams;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;

/// Creation data of a pipe transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipeTransportOptions {
    pub listen_ip: ListenIp,
    #[serde(default)]
    pub enable_sctp: bool,
    #[serde(default)]
    pub num_sctp_streams: NumSctpStreams,
    /// Enable RTX and NACK for RTP retransmission. Default false.
    #[serde(default)]
    pub enable_rtx: bool,
    /// Enable SRTP. Default false.
    #[serde(default)]
    pub enable_srtp: bool,
}

pub(crate) struct PipeTransportData {
    pub(crate) rtx: bool,
    pub(crate) srtp: bool,
    pub(crate) sctp_enabled: bool,
    pub(crate) tuple: Mutex<Option<TransportTuple>>,
    pub(crate) connected: AtomicBool,
}

impl PipeTransportData {
    pub(crate) fn new(options: &PipeTransportOptions) -> Self {
        Self {
            rtx: options.enable_rtx,
            srtp: options.enable_srtp,
            sctp_enabled: options.enable_sctp,
            tuple: Mutex::default(),
            connected: AtomicBool::new(false),
        }
    }
}
