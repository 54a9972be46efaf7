mod common;

use common::{audio_consumer_data, internal, setup};
use serde_json::{json, Value};
use sfu_worker::channel::RequestError;
use sfu_worker::messages::RequestMethod;

#[test]
fn dump_reports_transports_and_observers() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.expect_ok(
        RequestMethod::RouterCreateDirectTransport,
        internal().router("r1").transport("t2"),
        json!({}),
    );
    env.expect_ok(
        RequestMethod::RouterCreateAudioLevelObserver,
        internal().router("r1").rtp_observer("o1"),
        json!({}),
    );

    let dump = env
        .expect_ok(RequestMethod::RouterDump, internal().router("r1"), Value::Null)
        .unwrap();

    assert_eq!(dump["transportIds"], json!(["t1", "t2"]));
    assert_eq!(dump["rtpObserverIds"], json!(["o1"]));
}

#[test]
fn duplicate_transport_id_is_rejected() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");

    let error = env
        .request(
            RequestMethod::RouterCreateWebRtcTransport,
            internal().router("r1").transport("t1"),
            json!({ "listenIps": [{ "ip": "127.0.0.1" }] }),
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::DuplicateId(_)));
}

#[test]
fn duplicate_producer_id_is_rejected_without_state_change() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_webrtc_transport("r1", "t2");
    env.create_audio_producer("r1", "t1", "p1", 1111, 2222);

    // Same producer id on another transport of the same router.
    let error = env
        .request(
            RequestMethod::TransportProduce,
            internal().router("r1").transport("t2").producer("p1"),
            common::audio_producer_data(3333, 4444),
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::DuplicateId(_)));

    // The rejected transport did not allocate anything.
    let dump = env
        .expect_ok(
            RequestMethod::TransportDump,
            internal().router("r1").transport("t2"),
            Value::Null,
        )
        .unwrap();
    assert_eq!(dump["producerIds"], json!([]));
}

#[test]
fn consume_unknown_producer_fails() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");

    let error = env
        .request(
            RequestMethod::TransportConsume,
            internal().router("r1").transport("t1").consumer("c1"),
            audio_consumer_data("nope", 2222, 3333),
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::NotFound(_)));
}

#[test]
fn subscription_index_is_bidirectional() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_webrtc_transport("r1", "t2");
    env.create_audio_producer("r1", "t1", "p1", 1111, 2222);
    env.create_audio_consumer("r1", "t2", "c1", "p1", 2222, 3331);
    env.create_audio_consumer("r1", "t2", "c2", "p1", 2222, 3332);

    let dump = env
        .expect_ok(RequestMethod::RouterDump, internal().router("r1"), Value::Null)
        .unwrap();

    assert_eq!(dump["mapProducerIdConsumerIds"]["p1"], json!(["c1", "c2"]));
    assert_eq!(dump["mapConsumerIdProducerId"]["c1"], json!("p1"));
    assert_eq!(dump["mapConsumerIdProducerId"]["c2"], json!("p1"));

    // Closing one consumer updates both directions.
    env.expect_ok(
        RequestMethod::ConsumerClose,
        internal().router("r1").transport("t2").consumer("c1"),
        Value::Null,
    );

    let dump = env
        .expect_ok(RequestMethod::RouterDump, internal().router("r1"), Value::Null)
        .unwrap();
    assert_eq!(dump["mapProducerIdConsumerIds"]["p1"], json!(["c2"]));
    assert_eq!(dump["mapConsumerIdProducerId"].get("c1"), None);
}

#[test]
fn producer_close_cascades_to_consumers() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_webrtc_transport("r1", "t2");
    env.create_audio_producer("r1", "t1", "p1", 1111, 2222);
    env.create_audio_consumer("r1", "t2", "c1", "p1", 2222, 3331);
    env.create_audio_consumer("r1", "t2", "c2", "p1", 2222, 3332);

    let router = env.worker.router(&"r1".into()).unwrap();
    let consumer_1 = router
        .transport(&"t2".into())
        .unwrap()
        .consumer(&"c1".into())
        .unwrap();

    env.expect_ok(
        RequestMethod::ProducerClose,
        internal().router("r1").transport("t1").producer("p1"),
        Value::Null,
    );

    // Both consumers were destroyed and the controller was told.
    assert!(consumer_1.closed());
    assert_eq!(env.notifications.count("c1", "producerclose"), 1);
    assert_eq!(env.notifications.count("c2", "producerclose"), 1);

    let transport_2 = router.transport(&"t2".into()).unwrap();
    assert!(transport_2.consumer(&"c1".into()).is_none());
    assert!(transport_2.consumer(&"c2".into()).is_none());

    let dump = env
        .expect_ok(RequestMethod::RouterDump, internal().router("r1"), Value::Null)
        .unwrap();
    assert_eq!(dump["mapProducerIdConsumerIds"].get("p1"), None);
    assert_eq!(dump["mapConsumerIdProducerId"], json!({}));
}

#[test]
fn transport_close_removes_all_owned_entities_from_indices() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_webrtc_transport("r1", "t2");
    env.create_audio_producer("r1", "t1", "p1", 1111, 2222);
    env.create_audio_consumer("r1", "t2", "c1", "p1", 2222, 3331);

    env.expect_ok(
        RequestMethod::TransportClose,
        internal().router("r1").transport("t1"),
        Value::Null,
    );

    let dump = env
        .expect_ok(RequestMethod::RouterDump, internal().router("r1"), Value::Null)
        .unwrap();
    assert_eq!(dump["transportIds"], json!(["t2"]));
    assert_eq!(dump["mapProducerIdConsumerIds"], json!({}));
    assert_eq!(dump["mapConsumerIdProducerId"], json!({}));

    // The consumer on the surviving transport self-destructed.
    assert_eq!(env.notifications.count("c1", "producerclose"), 1);

    // Closing the same transport again succeeds without touching anything.
    env.expect_ok(
        RequestMethod::TransportClose,
        internal().router("r1").transport("t1"),
        Value::Null,
    );
}

#[test]
fn audio_level_observer_reports_volumes_and_silence() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_audio_producer("r1", "t1", "p1", 1111, 2222);
    env.expect_ok(
        RequestMethod::RouterCreateAudioLevelObserver,
        internal().router("r1").rtp_observer("o1"),
        json!({ "maxEntries": 2, "threshold": -70, "interval": 800 }),
    );
    env.expect_ok(
        RequestMethod::RtpObserverAddProducer,
        internal().router("r1").rtp_observer("o1"),
        json!({ "producerId": "p1" }),
    );

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport = router.transport(&"t1".into()).unwrap();
    let observer = router.rtp_observer(&"o1".into()).unwrap();
    assert_eq!(observer.interval(), 800);

    for seq in 0..5 {
        transport.receive_rtp_packet(common::audio_packet(1111, seq));
    }
    observer.on_interval_timer();

    let volumes = env.notifications.last_data("o1", "volumes").unwrap();
    assert_eq!(volumes[0]["producerId"], json!("p1"));
    assert_eq!(volumes[0]["volume"], json!(-50));

    // No audio in the next interval: one silence edge, not repeated.
    observer.on_interval_timer();
    observer.on_interval_timer();
    assert_eq!(env.notifications.count("o1", "silence"), 1);
}

#[test]
fn observer_rejects_video_and_unknown_producers() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.expect_ok(
        RequestMethod::RouterCreateActiveSpeakerObserver,
        internal().router("r1").rtp_observer("o1"),
        json!({}),
    );
    env.expect_ok(
        RequestMethod::TransportProduce,
        internal().router("r1").transport("t1").producer("v1"),
        common::video_producer_data(&[10], &[110]),
    );

    let error = env
        .request(
            RequestMethod::RtpObserverAddProducer,
            internal().router("r1").rtp_observer("o1"),
            json!({ "producerId": "v1" }),
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::TypeError(_)));

    let error = env
        .request(
            RequestMethod::RtpObserverAddProducer,
            internal().router("r1").rtp_observer("o1"),
            json!({ "producerId": "nope" }),
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::NotFound(_)));
}

#[test]
fn dominant_speaker_changes_are_reported() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_audio_producer("r1", "t1", "p1", 1111, 2221);
    env.create_audio_producer("r1", "t1", "p2", 1112, 2223);
    env.expect_ok(
        RequestMethod::RouterCreateActiveSpeakerObserver,
        internal().router("r1").rtp_observer("o1"),
        json!({}),
    );
    for producer_id in ["p1", "p2"] {
        env.expect_ok(
            RequestMethod::RtpObserverAddProducer,
            internal().router("r1").rtp_observer("o1"),
            json!({ "producerId": producer_id }),
        );
    }

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport = router.transport(&"t1".into()).unwrap();
    let observer = router.rtp_observer(&"o1".into()).unwrap();

    // p1 louder than p2.
    let mut loud = common::audio_packet(1111, 1);
    loud.audio_level = Some(-20);
    let mut quiet = common::audio_packet(1112, 1);
    quiet.audio_level = Some(-90);
    transport.receive_rtp_packet(loud);
    transport.receive_rtp_packet(quiet);
    observer.on_interval_timer();

    let dominant = env.notifications.last_data("o1", "dominantspeaker").unwrap();
    assert_eq!(dominant["producerId"], json!("p1"));

    // p2 takes over.
    let mut quiet = common::audio_packet(1111, 2);
    quiet.audio_level = Some(-90);
    let mut loud = common::audio_packet(1112, 2);
    loud.audio_level = Some(-20);
    transport.receive_rtp_packet(quiet);
    transport.receive_rtp_packet(loud);
    observer.on_interval_timer();

    let dominant = env.notifications.last_data("o1", "dominantspeaker").unwrap();
    assert_eq!(dominant["producerId"], json!("p2"));
    assert_eq!(env.notifications.count("o1", "dominantspeaker"), 2);
}
