mod common;

use common::{internal, setup};
use futures_lite::future;
use serde_json::{json, Value};
use sfu_worker::channel::{ControlMessage, RequestError};
use sfu_worker::messages::RequestMethod;
use sfu_worker::worker::{exit_code, WorkerLogLevel};

#[test]
fn emits_running_on_startup() {
    let env = setup();

    let pid = env.worker.pid().to_string();
    assert_eq!(env.notifications.events_for(&pid), vec!["running"]);
}

#[test]
fn dump_lists_servers_and_routers() {
    let env = setup();

    env.create_router("r1");
    env.create_router("r2");
    env.expect_ok(
        RequestMethod::WorkerCreateWebRtcServer,
        internal().web_rtc_server("s1"),
        json!({ "listenInfos": [{ "protocol": "udp", "ip": "127.0.0.1", "port": 44444 }] }),
    );

    let dump = env
        .expect_ok(RequestMethod::WorkerDump, internal(), Value::Null)
        .unwrap();

    assert_eq!(dump["routerIds"], json!(["r1", "r2"]));
    assert_eq!(dump["webRtcServerIds"], json!(["s1"]));
    assert_eq!(dump["pid"], json!(env.worker.pid()));
}

#[test]
fn duplicate_router_id_is_rejected() {
    let env = setup();

    env.create_router("r1");

    let error = env
        .request(
            RequestMethod::WorkerCreateRouter,
            internal().router("r1"),
            Value::Null,
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::DuplicateId(_)));

    // The original router still works.
    let dump = env
        .expect_ok(RequestMethod::RouterDump, internal().router("r1"), Value::Null)
        .unwrap();
    assert_eq!(dump["id"], json!("r1"));
    env.create_webrtc_transport("r1", "t1");
}

#[test]
fn duplicate_web_rtc_server_id_is_rejected() {
    let env = setup();

    let listen_infos =
        json!({ "listenInfos": [{ "protocol": "udp", "ip": "127.0.0.1", "port": 44444 }] });
    env.expect_ok(
        RequestMethod::WorkerCreateWebRtcServer,
        internal().web_rtc_server("s1"),
        listen_infos.clone(),
    );

    let error = env
        .request(
            RequestMethod::WorkerCreateWebRtcServer,
            internal().web_rtc_server("s1"),
            listen_infos,
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::DuplicateId(_)));
}

#[test]
fn resource_usage_reports_os_counters() {
    let env = setup();

    let usage = env
        .expect_ok(RequestMethod::WorkerGetResourceUsage, internal(), Value::Null)
        .unwrap();

    assert!(usage["ru_maxrss"].as_u64().unwrap() > 0);
    assert!(usage.get("ru_utime").is_some());
    assert!(usage.get("ru_nvcsw").is_some());
}

#[test]
fn update_settings_applies_hot() {
    let env = setup();

    env.expect_ok(
        RequestMethod::WorkerUpdateSettings,
        internal(),
        json!({ "logLevel": "debug", "logTags": ["rtp", "score"] }),
    );

    let settings = env.worker.settings();
    assert_eq!(settings.log_level, WorkerLogLevel::Debug);
    assert_eq!(settings.log_tags.len(), 2);
}

#[test]
fn close_is_idempotent_and_cascades() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport = router.transport(&"t1".into()).unwrap();

    env.expect_ok(RequestMethod::WorkerClose, internal(), Value::Null);
    assert!(env.worker.closed());
    assert!(router.closed());
    assert!(transport.closed());

    // Second close is a no-op returning success.
    env.expect_ok(RequestMethod::WorkerClose, internal(), Value::Null);
}

#[test]
fn requests_after_close_fail_with_not_found() {
    let env = setup();

    env.create_router("r1");
    env.expect_ok(RequestMethod::WorkerClose, internal(), Value::Null);

    let error = env
        .request(RequestMethod::RouterDump, internal().router("r1"), Value::Null)
        .unwrap_err();
    assert!(matches!(error, RequestError::NotFound(_)));
}

#[test]
fn run_processes_in_order_and_exits_on_disconnect() {
    let env = setup();

    let (sender, receiver) = async_channel::unbounded();

    let requests = vec![
        (1, RequestMethod::WorkerCreateRouter, internal().router("r1")),
        (2, RequestMethod::RouterDump, internal().router("r1")),
        (3, RequestMethod::WorkerDump, internal()),
    ];
    for (id, method, builder) in requests {
        sender
            .try_send(ControlMessage::Request(sfu_worker::channel::ChannelRequest {
                id,
                method,
                internal: builder.into(),
                data: Value::Null,
            }))
            .unwrap();
    }
    drop(sender);

    let status = future::block_on(env.worker.run(receiver));
    assert_eq!(status, exit_code::CHANNEL_DISCONNECTED);
    assert!(env.worker.closed());

    let responses = env.responses.entries.lock();
    let ids = responses.iter().map(|(id, _)| *id).collect::<Vec<_>>();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(responses.iter().all(|(_, result)| result.is_ok()));
}

#[test]
fn run_returns_clean_after_close_request() {
    let env = setup();

    let (sender, receiver) = async_channel::unbounded();
    sender
        .try_send(ControlMessage::Request(sfu_worker::channel::ChannelRequest {
            id: 1,
            method: RequestMethod::WorkerClose,
            internal: internal().into(),
            data: Value::Null,
        }))
        .unwrap();

    let status = future::block_on(env.worker.run(receiver));
    assert_eq!(status, exit_code::CLEAN);
    drop(sender);
}
