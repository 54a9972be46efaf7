mod common;

use common::{internal, setup};
use serde_json::{json, Value};
use sfu_worker::channel::RequestError;
use sfu_worker::messages::RequestMethod;

fn server_data() -> Value {
    json!({
        "listenInfos": [
            { "protocol": "udp", "ip": "127.0.0.1", "port": 44444 },
            { "protocol": "tcp", "ip": "127.0.0.1", "port": 44444 },
        ],
    })
}

fn attached_transport_data() -> Value {
    json!({ "webRtcServerId": "s1" })
}

#[test]
fn empty_listen_infos_are_rejected() {
    let env = setup();

    let error = env
        .request(
            RequestMethod::WorkerCreateWebRtcServer,
            internal().web_rtc_server("s1"),
            json!({ "listenInfos": [] }),
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::TypeError(_)));
}

#[test]
fn attached_transport_is_resolvable_by_ufrag() {
    let env = setup();

    env.expect_ok(
        RequestMethod::WorkerCreateWebRtcServer,
        internal().web_rtc_server("s1"),
        server_data(),
    );
    env.create_router("r1");
    let created = env
        .expect_ok(
            RequestMethod::RouterCreateWebRtcTransport,
            internal().router("r1").transport("t1"),
            attached_transport_data(),
        )
        .unwrap();

    let ufrag = created["iceParameters"]["usernameFragment"]
        .as_str()
        .unwrap()
        .to_string();

    let server = env.worker.web_rtc_server(&"s1".into()).unwrap();
    let transport = server.lookup_transport(&ufrag).unwrap();
    assert_eq!(transport.id().as_str(), "t1");
    assert!(server.lookup_transport("unknown-ufrag").is_none());

    let dump = env
        .expect_ok(
            RequestMethod::WebRtcServerDump,
            internal().web_rtc_server("s1"),
            Value::Null,
        )
        .unwrap();
    assert_eq!(dump["webRtcTransportIds"], json!(["t1"]));
    assert_eq!(
        dump["localIceUsernameFragments"][0]["webRtcTransportId"],
        json!("t1")
    );
}

#[test]
fn missing_server_fails_transport_creation() {
    let env = setup();

    env.create_router("r1");
    let error = env
        .request(
            RequestMethod::RouterCreateWebRtcTransport,
            internal().router("r1").transport("t1"),
            attached_transport_data(),
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::TypeError(_)));

    // Nothing was allocated.
    let dump = env
        .expect_ok(RequestMethod::RouterDump, internal().router("r1"), Value::Null)
        .unwrap();
    assert_eq!(dump["transportIds"], json!([]));
}

#[test]
fn server_close_cascades_to_attached_transports() {
    let env = setup();

    env.expect_ok(
        RequestMethod::WorkerCreateWebRtcServer,
        internal().web_rtc_server("s1"),
        server_data(),
    );
    env.create_router("r1");
    env.expect_ok(
        RequestMethod::RouterCreateWebRtcTransport,
        internal().router("r1").transport("t1"),
        attached_transport_data(),
    );
    env.create_audio_producer("r1", "t1", "p1", 1111, 2222);

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport = router.transport(&"t1".into()).unwrap();

    env.expect_ok(
        RequestMethod::WebRtcServerClose,
        internal().web_rtc_server("s1"),
        Value::Null,
    );

    // The transport observed the server closure and self-closed; the router
    // dropped it after its entities detached.
    assert!(transport.closed());
    assert_eq!(env.notifications.count("t1", "listenserverclose"), 1);

    let dump = env
        .expect_ok(RequestMethod::RouterDump, internal().router("r1"), Value::Null)
        .unwrap();
    assert_eq!(dump["transportIds"], json!([]));
    assert_eq!(dump["mapProducerIdConsumerIds"], json!({}));

    // Server close is idempotent.
    env.expect_ok(
        RequestMethod::WebRtcServerClose,
        internal().web_rtc_server("s1"),
        Value::Null,
    );
}

#[test]
fn restart_ice_re_registers_the_ufrag() {
    let env = setup();

    env.expect_ok(
        RequestMethod::WorkerCreateWebRtcServer,
        internal().web_rtc_server("s1"),
        server_data(),
    );
    env.create_router("r1");
    let created = env
        .expect_ok(
            RequestMethod::RouterCreateWebRtcTransport,
            internal().router("r1").transport("t1"),
            attached_transport_data(),
        )
        .unwrap();
    let old_ufrag = created["iceParameters"]["usernameFragment"]
        .as_str()
        .unwrap()
        .to_string();

    let restarted = env
        .expect_ok(
            RequestMethod::TransportRestartIce,
            internal().router("r1").transport("t1"),
            Value::Null,
        )
        .unwrap();
    let new_ufrag = restarted["iceParameters"]["usernameFragment"]
        .as_str()
        .unwrap()
        .to_string();
    assert_ne!(old_ufrag, new_ufrag);

    let server = env.worker.web_rtc_server(&"s1".into()).unwrap();
    assert!(server.lookup_transport(&old_ufrag).is_none());
    assert_eq!(
        server.lookup_transport(&new_ufrag).unwrap().id().as_str(),
        "t1"
    );
}

#[test]
fn restart_ice_is_rejected_on_non_webrtc_transports() {
    let env = setup();

    env.create_router("r1");
    env.expect_ok(
        RequestMethod::RouterCreateDirectTransport,
        internal().router("r1").transport("t1"),
        json!({}),
    );

    let error = env
        .request(
            RequestMethod::TransportRestartIce,
            internal().router("r1").transport("t1"),
            Value::Null,
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::IllegalState(_)));
}
