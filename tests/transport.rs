mod common;

use common::{internal, setup};
use serde_json::{json, Value};
use sfu_worker::channel::RequestError;
use sfu_worker::data_structures::{DtlsState, IceState, SctpState};
use sfu_worker::messages::RequestMethod;

#[test]
fn webrtc_connect_accepts_once() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");

    let connect_data = json!({
        "dtlsParameters": {
            "role": "client",
            "fingerprints": [{ "algorithm": "sha-256", "value": "AA:BB:CC" }],
        },
    });

    let response = env
        .expect_ok(
            RequestMethod::TransportConnect,
            internal().router("r1").transport("t1"),
            connect_data.clone(),
        )
        .unwrap();
    assert_eq!(response["dtlsLocalRole"], json!("server"));

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport = router.transport(&"t1".into()).unwrap();
    assert_eq!(transport.dtls_state(), Some(DtlsState::Connecting));

    let error = env
        .request(
            RequestMethod::TransportConnect,
            internal().router("r1").transport("t1"),
            connect_data,
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::IllegalState(_)));
}

#[test]
fn connect_is_rejected_on_direct_transports() {
    let env = setup();

    env.create_router("r1");
    env.expect_ok(
        RequestMethod::RouterCreateDirectTransport,
        internal().router("r1").transport("t1"),
        json!({}),
    );

    let error = env
        .request(
            RequestMethod::TransportConnect,
            internal().router("r1").transport("t1"),
            json!({}),
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::IllegalState(_)));
}

#[test]
fn malformed_connect_data_is_a_type_error() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");

    let error = env
        .request(
            RequestMethod::TransportConnect,
            internal().router("r1").transport("t1"),
            json!({ "dtlsParameters": { "role": "nonsense" } }),
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::TypeError(_)));
}

#[test]
fn state_changes_are_reported_to_the_controller() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport = router.transport(&"t1".into()).unwrap();

    transport.on_ice_state_change(IceState::Connected);
    transport.on_dtls_state_change(DtlsState::Connected);
    transport.on_sctp_state_change(SctpState::Connected);

    assert_eq!(
        env.notifications.last_data("t1", "icestatechange").unwrap()["iceState"],
        json!("connected")
    );
    assert_eq!(
        env.notifications.last_data("t1", "dtlsstatechange").unwrap()["dtlsState"],
        json!("connected")
    );
    assert_eq!(
        env.notifications.last_data("t1", "sctpstatechange").unwrap()["sctpState"],
        json!("connected")
    );
    assert_eq!(transport.ice_state(), Some(IceState::Connected));
}

#[test]
fn set_max_incoming_bitrate_reaches_the_driver_hook() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");

    env.expect_ok(
        RequestMethod::TransportSetMaxIncomingBitrate,
        internal().router("r1").transport("t1"),
        json!({ "bitrate": 3_000_000 }),
    );

    let stats = env
        .expect_ok(
            RequestMethod::TransportGetStats,
            internal().router("r1").transport("t1"),
            Value::Null,
        )
        .unwrap();
    assert_eq!(stats[0]["maxIncomingBitrate"], json!(3_000_000));
}

#[test]
fn producing_with_a_conflicting_ssrc_fails() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_audio_producer("r1", "t1", "p1", 1111, 2222);

    let error = env
        .request(
            RequestMethod::TransportProduce,
            internal().router("r1").transport("t1").producer("p2"),
            common::audio_producer_data(1111, 4444),
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::TypeError(_)));
}

#[test]
fn dump_reports_listener_tables() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_audio_producer("r1", "t1", "p1", 1111, 2222);

    let dump = env
        .expect_ok(
            RequestMethod::TransportDump,
            internal().router("r1").transport("t1"),
            Value::Null,
        )
        .unwrap();

    assert_eq!(dump["kind"], json!("webrtc"));
    assert_eq!(dump["producerIds"], json!(["p1"]));
    assert_eq!(dump["rtpListener"]["1111"], json!("p1"));
    assert_eq!(dump["iceState"], json!("new"));
}
