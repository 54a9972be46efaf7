//! The worker: top-level registry of routers and WebRTC servers, and the
//! entry point for every control-plane message.
//!
//! One worker runs per process. All entities live on its event loop; the
//! embedder feeds parsed requests through [`Worker::process`] (or the
//! [`Worker::run`] pump) and wires the outbound sinks and media capabilities
//! in at construction.

use crate::channel::{
    ChannelRequest, ControlMessage, ControlPipe, PayloadChannelNotification,
    PayloadChannelRequest, RequestError, RequestResult,
};
use crate::messages::{parse_request_data, to_response_data, PayloadEvent, PayloadMethod, RequestMethod};
use crate::router::transport::TransportDriverFactory;
use crate::router::{Router, RouterId, WebRtcServerProvider};
use crate::rtp_packet::RtpPacketDecoder;
use crate::webrtc_server::{WebRtcServer, WebRtcServerId, WebRtcServerOptions};
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use hash_hasher::HashedMap;
use log::{debug, warn};
use nix::sys::resource::{getrusage, UsageWho};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Exit codes for an executable embedding the worker.
pub mod exit_code {
    /// Orderly close.
    pub const CLEAN: i32 = 0;
    /// Invalid settings or configuration.
    pub const CONFIGURATION_ERROR: i32 = 40;
    /// The controller side of the pipe went away.
    pub const CHANNEL_DISCONNECTED: i32 = 41;
    /// Invariant violation or unexpected panic.
    pub const UNCAUGHT_ERROR: i32 = 42;
}

/// Log verbosity requested by the controller.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLogLevel {
    Debug,
    Warn,
    Error,
    None,
}

impl Default for WorkerLogLevel {
    fn default() -> Self {
        Self::Error
    }
}

impl WorkerLogLevel {
    /// Mapping for embedders that drive the `log` facade.
    pub fn as_level_filter(self) -> log::LevelFilter {
        match self {
            WorkerLogLevel::Debug => log::LevelFilter::Debug,
            WorkerLogLevel::Warn => log::LevelFilter::Warn,
            WorkerLogLevel::Error => log::LevelFilter::Error,
            WorkerLogLevel::None => log::LevelFilter::Off,
        }
    }
}

/// Log tags the controller can toggle.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLogTag {
    Info,
    Ice,
    Dtls,
    Rtp,
    Srtp,
    Rtcp,
    Rtx,
    Bwe,
    Score,
    Simulcast,
    Svc,
    Sctp,
    Message,
}

/// Settings the worker starts with.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSettings {
    #[serde(default)]
    pub log_level: WorkerLogLevel,
    #[serde(default)]
    pub log_tags: Vec<WorkerLogTag>,
}

/// Hot-update of the settings, all fields optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerUpdateSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<WorkerLogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_tags: Option<Vec<WorkerLogTag>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct WorkerDump {
    pub pid: u32,
    #[serde(rename = "webRtcServerIds")]
    pub web_rtc_server_ids: BTreeSet<WebRtcServerId>,
    pub router_ids: BTreeSet<RouterId>,
}

/// `getrusage(2)` snapshot, field names as reported on the wire.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
#[non_exhaustive]
#[allow(missing_docs)]
pub struct WorkerResourceUsage {
    /// User CPU time in ms.
    pub ru_utime: u64,
    /// System CPU time in ms.
    pub ru_stime: u64,
    /// Maximum resident set size.
    pub ru_maxrss: u64,
    /// Integral shared memory size.
    pub ru_ixrss: u64,
    /// Integral unshared data size.
    pub ru_idrss: u64,
    /// Integral unshared stack size.
    pub ru_isrss: u64,
    /// Soft page faults.
    pub ru_minflt: u64,
    /// Hard page faults.
    pub ru_majflt: u64,
    /// Swaps.
    pub ru_nswap: u64,
    /// Block input operations.
    pub ru_inblock: u64,
    /// Block output operations.
    pub ru_oublock: u64,
    /// IPC messages sent.
    pub ru_msgsnd: u64,
    /// IPC messages received.
    pub ru_msgrcv: u64,
    /// Signals received.
    pub ru_nsignals: u64,
    /// Voluntary context switches.
    pub ru_nvcsw: u64,
    /// Involuntary context switches.
    pub ru_nivcsw: u64,
}

/// Worker-scoped state and capabilities, passed explicitly into every entity
/// constructor instead of living as process globals.
pub(crate) struct WorkerContext {
    pub(crate) pid: u32,
    pub(crate) version: String,
    pub(crate) settings: Mutex<WorkerSettings>,
    pub(crate) control: ControlPipe,
    pub(crate) transport_driver_factory: Arc<dyn TransportDriverFactory>,
    pub(crate) rtp_packet_decoder: Arc<dyn RtpPacketDecoder>,
}

#[derive(Default)]
struct Handlers {
    new_router: Bag<Arc<dyn Fn(&Router) + Send + Sync>>,
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    context: Arc<WorkerContext>,
    routers: Mutex<HashedMap<RouterId, Router>>,
    web_rtc_servers: Mutex<HashedMap<WebRtcServerId, WebRtcServer>>,
    handlers: Handlers,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("drop()");

        self.handlers.close.call_simple();
    }
}

/// The media worker.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    /// Create a worker wired to the given controller pipe and media
    /// capabilities.
    ///
    /// Emits the `running` notification before returning, matching what the
    /// controller expects at startup.
    pub fn new(
        settings: WorkerSettings,
        control: ControlPipe,
        transport_driver_factory: Arc<dyn TransportDriverFactory>,
        rtp_packet_decoder: Arc<dyn RtpPacketDecoder>,
    ) -> Self {
        debug!("new()");

        let pid = std::process::id();
        let version = std::env::var("SFU_WORKER_VERSION")
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

        let context = Arc::new(WorkerContext {
            pid,
            version,
            settings: Mutex::new(settings),
            control,
            transport_driver_factory,
            rtp_packet_decoder,
        });

        let worker = Self {
            inner: Arc::new(Inner {
                context: Arc::clone(&context),
                routers: Mutex::default(),
                web_rtc_servers: Mutex::default(),
                handlers: Handlers::default(),
                closed: AtomicBool::new(false),
            }),
        };

        context.control.notifications.notify(
            &pid.to_string(),
            "running",
            serde_json::json!({ "version": context.version }),
        );

        worker
    }

    /// Worker process id.
    pub fn pid(&self) -> u32 {
        self.inner.context.pid
    }

    /// Whether the worker is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Current settings.
    pub fn settings(&self) -> WorkerSettings {
        self.inner.context.settings.lock().clone()
    }

    /// Router owned by this worker.
    pub fn router(&self, router_id: &RouterId) -> Option<Router> {
        self.inner.routers.lock().get(router_id).cloned()
    }

    /// WebRTC server owned by this worker.
    pub fn web_rtc_server(&self, web_rtc_server_id: &WebRtcServerId) -> Option<WebRtcServer> {
        self.inner
            .web_rtc_servers
            .lock()
            .get(web_rtc_server_id)
            .cloned()
    }

    /// Callback is called when a router is created.
    pub fn on_new_router<F: Fn(&Router) + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.new_router.add(Arc::new(callback))
    }

    /// Callback is called when the worker is closed for whatever reason.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }

    /// Process control messages one at a time, in arrival order, until the
    /// pipe closes or a `worker.close` request arrives.
    ///
    /// Returns the exit code an embedding executable should report.
    pub async fn run(&self, receiver: async_channel::Receiver<ControlMessage>) -> i32 {
        debug!("run()");

        loop {
            match receiver.recv().await {
                Ok(message) => {
                    self.process(message);
                    if self.closed() {
                        return exit_code::CLEAN;
                    }
                }
                Err(_) => {
                    // Remote side of the pipe is gone; the controller died or
                    // dropped us, so shut down in turn.
                    warn!("run() | control pipe closed remotely, closing myself");
                    self.close();
                    return exit_code::CHANNEL_DISCONNECTED;
                }
            }
        }
    }

    /// Process a single control message, responding where a response is due.
    pub fn process(&self, message: ControlMessage) {
        match message {
            ControlMessage::Request(request) => {
                let result = self.handle_request(&request);
                self.inner
                    .context
                    .control
                    .responses
                    .respond(request.id, result);
            }
            ControlMessage::PayloadRequest(request) => {
                let result = self.handle_payload_request(&request);
                self.inner
                    .context
                    .control
                    .responses
                    .respond(request.id, result);
            }
            ControlMessage::PayloadNotification(notification) => {
                if let Err(error) = self.handle_payload_notification(&notification) {
                    warn!("process() | payload notification failed: {}", error);
                }
            }
        }
    }

    /// Handle one control-channel request addressed by its `internal` record.
    pub fn handle_request(&self, request: &ChannelRequest) -> RequestResult {
        debug!(
            "handle_request() [method:{}, id:{}]",
            request.method.as_str(),
            request.id
        );

        match request.method {
            RequestMethod::WorkerClose => {
                self.close();
                Ok(None)
            }
            RequestMethod::WorkerDump => to_response_data(&self.dump_data()),
            RequestMethod::WorkerGetResourceUsage => to_response_data(&self.resource_usage()?),
            RequestMethod::WorkerUpdateSettings => {
                let update: WorkerUpdateSettings = parse_request_data(&request.data)?;
                let mut settings = self.inner.context.settings.lock();
                if let Some(log_level) = update.log_level {
                    settings.log_level = log_level;
                }
                if let Some(log_tags) = update.log_tags {
                    settings.log_tags = log_tags;
                }
                Ok(None)
            }
            RequestMethod::WorkerCreateWebRtcServer => {
                let web_rtc_server_id = request.internal.web_rtc_server_id()?.clone();

                let mut web_rtc_servers = self.inner.web_rtc_servers.lock();
                if web_rtc_servers.contains_key(&web_rtc_server_id) {
                    return Err(RequestError::DuplicateId(format!(
                        "a WebRtcServer with same id \"{}\" already exists",
                        web_rtc_server_id
                    )));
                }

                let options: WebRtcServerOptions = parse_request_data(&request.data)?;
                let web_rtc_server = WebRtcServer::new(web_rtc_server_id.clone(), options)?;
                web_rtc_servers.insert(web_rtc_server_id.clone(), web_rtc_server);

                debug!(
                    "handle_request() | WebRtcServer created [webRtcServerId:{}]",
                    web_rtc_server_id
                );

                Ok(None)
            }
            RequestMethod::WebRtcServerClose => {
                let web_rtc_server_id = request.internal.web_rtc_server_id()?;
                // Closing an already-closed entity is a no-op returning
                // success.
                let web_rtc_server = self.inner.web_rtc_servers.lock().remove(web_rtc_server_id);
                if let Some(web_rtc_server) = web_rtc_server {
                    web_rtc_server.close();

                    debug!(
                        "handle_request() | WebRtcServer closed [webRtcServerId:{}]",
                        web_rtc_server_id
                    );
                }
                Ok(None)
            }
            RequestMethod::WebRtcServerDump => {
                let web_rtc_server_id = request.internal.web_rtc_server_id()?;
                self.web_rtc_server(web_rtc_server_id)
                    .ok_or_else(|| {
                        RequestError::NotFound(format!(
                            "WebRtcServer with id \"{}\" not found",
                            web_rtc_server_id
                        ))
                    })?
                    .dump()
            }
            RequestMethod::WorkerCreateRouter => {
                let router_id = request.internal.router_id()?.clone();

                let mut routers = self.inner.routers.lock();
                if routers.contains_key(&router_id) {
                    return Err(RequestError::DuplicateId(format!(
                        "a Router with same id \"{}\" already exists",
                        router_id
                    )));
                }

                let router = Router::new(
                    router_id.clone(),
                    Arc::clone(&self.inner.context),
                    self.web_rtc_server_provider(),
                );
                routers.insert(router_id.clone(), router.clone());
                drop(routers);

                self.inner.handlers.new_router.call(|callback| {
                    callback(&router);
                });

                debug!("handle_request() | Router created [routerId:{}]", router_id);

                Ok(None)
            }
            RequestMethod::RouterClose => {
                let router_id = request.internal.router_id()?;
                let router = self.inner.routers.lock().remove(router_id);
                if let Some(router) = router {
                    router.close();

                    debug!("handle_request() | Router closed [routerId:{}]", router_id);
                }
                Ok(None)
            }
            // Any other request is delivered to the corresponding router.
            _ => {
                let router_id = request.internal.router_id()?;
                let router = self.router(router_id).ok_or_else(|| {
                    RequestError::NotFound(format!("Router with id \"{}\" not found", router_id))
                })?;

                router.handle_request(request.method, &request.internal, &request.data)
            }
        }
    }

    /// Handle one payload-channel request.
    pub fn handle_payload_request(&self, request: &PayloadChannelRequest) -> RequestResult {
        debug!(
            "handle_payload_request() [method:{:?}, id:{}]",
            request.method, request.id
        );

        match request.method {
            PayloadMethod::DataProducerSend => {
                let notification = PayloadChannelNotification {
                    event: PayloadEvent::DataProducerSend,
                    internal: request.internal.clone(),
                    data: request.data.clone(),
                    payload: request.payload.clone(),
                };
                self.handle_payload_notification(&notification)?;
                Ok(None)
            }
        }
    }

    /// Handle one payload-channel notification.
    pub fn handle_payload_notification(
        &self,
        notification: &PayloadChannelNotification,
    ) -> Result<(), RequestError> {
        let router_id = notification.internal.router_id()?;
        let router = self.router(router_id).ok_or_else(|| {
            RequestError::NotFound(format!("Router with id \"{}\" not found", router_id))
        })?;

        router.handle_payload_notification(notification)
    }

    /// Orderly teardown: destroy all routers, then all WebRTC servers.
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("close()");

        let routers = {
            let mut routers = self.inner.routers.lock();
            routers.drain().map(|(_, router)| router).collect::<Vec<_>>()
        };
        for router in routers {
            router.close();
        }

        let web_rtc_servers = {
            let mut web_rtc_servers = self.inner.web_rtc_servers.lock();
            web_rtc_servers
                .drain()
                .map(|(_, web_rtc_server)| web_rtc_server)
                .collect::<Vec<_>>()
        };
        for web_rtc_server in web_rtc_servers {
            web_rtc_server.close();
        }

        self.inner.handlers.close.call_simple();
    }

    fn dump_data(&self) -> WorkerDump {
        WorkerDump {
            pid: self.inner.context.pid,
            web_rtc_server_ids: self.inner.web_rtc_servers.lock().keys().cloned().collect(),
            router_ids: self.inner.routers.lock().keys().cloned().collect(),
        }
    }

    fn resource_usage(&self) -> Result<WorkerResourceUsage, RequestError> {
        let usage = getrusage(UsageWho::RUSAGE_SELF)
            .map_err(|error| RequestError::Fatal(format!("getrusage() failed: {}", error)))?;

        fn to_ms(time: nix::sys::time::TimeVal) -> u64 {
            time.tv_sec() as u64 * 1000 + time.tv_usec() as u64 / 1000
        }

        Ok(WorkerResourceUsage {
            ru_utime: to_ms(usage.user_time()),
            ru_stime: to_ms(usage.system_time()),
            ru_maxrss: usage.max_rss() as u64,
            ru_ixrss: usage.shared_integral() as u64,
            ru_idrss: usage.unshared_data_integral() as u64,
            ru_isrss: usage.unshared_stack_integral() as u64,
            ru_minflt: usage.minor_page_faults() as u64,
            ru_majflt: usage.major_page_faults() as u64,
            ru_nswap: usage.full_swaps() as u64,
            ru_inblock: usage.block_reads() as u64,
            ru_oublock: usage.block_writes() as u64,
            ru_msgsnd: usage.ipc_sends() as u64,
            ru_msgrcv: usage.ipc_receives() as u64,
            ru_nsignals: usage.signals() as u64,
            ru_nvcsw: usage.voluntary_context_switches() as u64,
            ru_nivcsw: usage.involuntary_context_switches() as u64,
        })
    }

    fn web_rtc_server_provider(&self) -> WebRtcServerProvider {
        let inner_weak = Arc::downgrade(&self.inner);

        Box::new(move |web_rtc_server_id| {
            inner_weak.upgrade().and_then(|inner| {
                inner
                    .web_rtc_servers
                    .lock()
                    .get(web_rtc_server_id)
                    .cloned()
            })
        })
    }
}
