//! A WebRTC server is a shared listener resource: one set of UDP/TCP sockets
//! that many WebRTC transports across routers can attach to, with a
//! demultiplexer keyed by local ICE username fragment.
//!
//! The server does not own the transports that reference it. It keeps a
//! back-link set of attached transports; on close every attached transport
//! observes the closure and self-closes.

use crate::channel::RequestError;
use crate::data_structures::ListenIp;
use crate::data_structures::Protocol;
use crate::messages::to_response_data;
use crate::router::transport::{Transport, TransportId, WeakTransport};
use crate::string_based_wrapper_type;
use event_listener_primitives::{BagOnce, HandlerId};
use hash_hasher::HashedMap;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

string_based_wrapper_type!(
    /// [`WebRtcServer`] identifier.
    WebRtcServerId
);

/// Listening protocol, IP and port for a [`WebRtcServer`].
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcServerListenInfo {
    pub protocol: Protocol,
    #[serde(flatten)]
    pub listen_ip: ListenIp,
    pub port: u16,
}

/// Creation data of a WebRTC server, as sent by the controller.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcServerOptions {
    /// Listening infos, in order of preference.
    pub listen_infos: Vec<WebRtcServerListenInfo>,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcServerIceUsernameFragment {
    pub local_ice_username_fragment: String,
    #[serde(rename = "webRtcTransportId")]
    pub web_rtc_transport_id: TransportId,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct WebRtcServerDump {
    pub id: WebRtcServerId,
    pub listen_infos: Vec<WebRtcServerListenInfo>,
    #[serde(rename = "webRtcTransportIds")]
    pub web_rtc_transport_ids: Vec<TransportId>,
    pub local_ice_username_fragments: Vec<WebRtcServerIceUsernameFragment>,
}

#[derive(Default)]
struct Handlers {
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

pub(crate) struct Inner {
    id: WebRtcServerId,
    listen_infos: Vec<WebRtcServerListenInfo>,
    /// Attached transports (not owned).
    transports: Mutex<HashedMap<TransportId, WeakTransport>>,
    /// Local ICE ufrag to transport, for STUN/DTLS demultiplexing.
    ice_username_fragments: Mutex<HashedMap<String, TransportId>>,
    handlers: Handlers,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("drop()");

        self.handlers.close.call_simple();
    }
}

/// Shared listener resource for WebRTC transports.
#[derive(Clone)]
pub struct WebRtcServer {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakWebRtcServer {
    inner: Weak<Inner>,
}

impl WeakWebRtcServer {
    pub(crate) fn upgrade(&self) -> Option<WebRtcServer> {
        Some(WebRtcServer {
            inner: self.inner.upgrade()?,
        })
    }
}

impl WebRtcServer {
    pub(crate) fn new(
        id: WebRtcServerId,
        options: WebRtcServerOptions,
    ) -> Result<Self, RequestError> {
        debug!("new()");

        if options.listen_infos.is_empty() {
            return Err(RequestError::TypeError(
                "listenInfos must not be empty".into(),
            ));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                listen_infos: options.listen_infos,
                transports: Mutex::default(),
                ice_username_fragments: Mutex::default(),
                handlers: Handlers::default(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// WebRtcServer identifier.
    pub fn id(&self) -> &WebRtcServerId {
        &self.inner.id
    }

    /// Whether the server is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolve an incoming STUN/DTLS packet to the attached transport by its
    /// local ICE username fragment.
    pub fn lookup_transport(&self, ice_username_fragment: &str) -> Option<Transport> {
        let transport_id = self
            .inner
            .ice_username_fragments
            .lock()
            .get(ice_username_fragment)
            .cloned()?;
        self.inner
            .transports
            .lock()
            .get(&transport_id)?
            .upgrade()
    }

    pub(crate) fn downgrade(&self) -> WeakWebRtcServer {
        WeakWebRtcServer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn register_web_rtc_transport(&self, transport: &Transport) {
        self.inner
            .transports
            .lock()
            .insert(transport.id().clone(), transport.downgrade());

        if let Some(ufrag) = transport.ice_username_fragment() {
            self.inner
                .ice_username_fragments
                .lock()
                .insert(ufrag, transport.id().clone());
        }
    }

    pub(crate) fn unregister_web_rtc_transport(&self, transport_id: &TransportId) {
        self.inner.transports.lock().remove(transport_id);
        self.inner
            .ice_username_fragments
            .lock()
            .retain(|_, id| id != transport_id);
    }

    /// ICE restart on an attached transport: swap the registered ufrag.
    pub(crate) fn update_ice_username_fragment(
        &self,
        transport_id: &TransportId,
        previous_ufrag: Option<&str>,
        new_ufrag: &str,
    ) {
        let mut ice_username_fragments = self.inner.ice_username_fragments.lock();
        if let Some(previous_ufrag) = previous_ufrag {
            ice_username_fragments.remove(previous_ufrag);
        }
        ice_username_fragments.insert(new_ufrag.to_string(), transport_id.clone());
    }

    /// Close the server: every attached transport observes the closure and
    /// self-closes. Idempotent.
    pub(crate) fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("close()");

        let transports = {
            let mut transports = self.inner.transports.lock();
            transports
                .drain()
                .filter_map(|(_, transport)| transport.upgrade())
                .collect::<Vec<_>>()
        };
        self.inner.ice_username_fragments.lock().clear();

        for transport in transports {
            transport.listen_server_closed();
        }

        self.inner.handlers.close.call_simple();
    }

    pub(crate) fn dump(&self) -> Result<Option<Value>, RequestError> {
        debug!("dump()");

        let mut web_rtc_transport_ids = self
            .inner
            .transports
            .lock()
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        web_rtc_transport_ids.sort();

        let mut local_ice_username_fragments = self
            .inner
            .ice_username_fragments
            .lock()
            .iter()
            .map(|(ufrag, transport_id)| WebRtcServerIceUsernameFragment {
                local_ice_username_fragment: ufrag.clone(),
                web_rtc_transport_id: transport_id.clone(),
            })
            .collect::<Vec<_>>();
        local_ice_username_fragments
            .sort_by(|a, b| a.local_ice_username_fragment.cmp(&b.local_ice_username_fragment));

        to_response_data(&WebRtcServerDump {
            id: self.inner.id.clone(),
            listen_infos: self.inner.listen_infos.clone(),
            web_rtc_transport_ids,
            local_ice_username_fragments,
        })
    }

    /// Callback is called when the server is closed for whatever reason.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }
}
