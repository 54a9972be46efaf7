mod common;

use bytes::Bytes;
use common::{internal, setup};
use serde_json::{json, Value};
use sfu_worker::channel::{PayloadChannelNotification, RequestError};
use sfu_worker::messages::{Internal, PayloadEvent, RequestMethod};

fn data_producer_data(stream_id: u16) -> Value {
    json!({
        "type": "sctp",
        "sctpStreamParameters": { "streamId": stream_id, "ordered": true },
        "label": "chat",
        "protocol": "chat-v1",
    })
}

fn data_consumer_data(data_producer_id: &str, stream_id: u16) -> Value {
    json!({
        "dataProducerId": data_producer_id,
        "type": "sctp",
        "sctpStreamParameters": { "streamId": stream_id, "ordered": true },
        "label": "chat",
        "protocol": "chat-v1",
    })
}

fn sctp_setup(env: &common::TestSetup) {
    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_webrtc_transport("r1", "t2");
    env.create_webrtc_transport("r1", "t3");
    env.expect_ok(
        RequestMethod::TransportProduceData,
        internal().router("r1").transport("t1").data_producer("dp1"),
        data_producer_data(5),
    );
    env.expect_ok(
        RequestMethod::TransportConsumeData,
        internal().router("r1").transport("t2").data_consumer("dc1"),
        data_consumer_data("dp1", 1),
    );
    env.expect_ok(
        RequestMethod::TransportConsumeData,
        internal().router("r1").transport("t3").data_consumer("dc2"),
        data_consumer_data("dp1", 2),
    );
}

#[test]
fn fans_out_messages_to_every_data_consumer() {
    let env = setup();
    sctp_setup(&env);

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport_1 = router.transport(&"t1".into()).unwrap();

    transport_1.receive_sctp_message(5, 51, Bytes::from_static(b"hello"));

    for (transport_id, stream_id) in [("t2", 1u16), ("t3", 2u16)] {
        let sent = env.driver(transport_id).sent_messages.lock().clone();
        assert_eq!(sent.len(), 1, "{} got no message", transport_id);
        assert_eq!(sent[0].0, stream_id);
        assert_eq!(sent[0].1, 51);
        assert_eq!(&sent[0].2[..], b"hello");
    }

    let data_producer = transport_1.data_producer(&"dp1".into()).unwrap();
    assert_eq!(data_producer.messages_received(), 1);
    assert_eq!(data_producer.bytes_received(), 5);

    let stats = env
        .expect_ok(
            RequestMethod::DataProducerGetStats,
            internal().router("r1").transport("t1").data_producer("dp1"),
            Value::Null,
        )
        .unwrap();
    assert_eq!(stats[0]["messagesReceived"], json!(1));
    assert_eq!(stats[0]["bytesReceived"], json!(5));
}

#[test]
fn counters_update_without_subscribers() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.expect_ok(
        RequestMethod::TransportProduceData,
        internal().router("r1").transport("t1").data_producer("dp1"),
        data_producer_data(5),
    );

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport_1 = router.transport(&"t1".into()).unwrap();
    transport_1.receive_sctp_message(5, 53, Bytes::from_static(&[0, 1, 2]));

    let data_producer = transport_1.data_producer(&"dp1".into()).unwrap();
    assert_eq!(data_producer.messages_received(), 1);
    assert_eq!(data_producer.bytes_received(), 3);
}

#[test]
fn unknown_stream_id_is_ignored() {
    let env = setup();
    sctp_setup(&env);

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport_1 = router.transport(&"t1".into()).unwrap();
    transport_1.receive_sctp_message(9, 51, Bytes::from_static(b"nope"));

    assert!(env.driver("t2").sent_messages.lock().is_empty());
    let data_producer = transport_1.data_producer(&"dp1".into()).unwrap();
    assert_eq!(data_producer.messages_received(), 0);
}

#[test]
fn data_producer_close_cascades_to_data_consumers() {
    let env = setup();
    sctp_setup(&env);

    let router = env.worker.router(&"r1".into()).unwrap();
    let data_consumer_1 = router
        .transport(&"t2".into())
        .unwrap()
        .data_consumer(&"dc1".into())
        .unwrap();

    env.expect_ok(
        RequestMethod::DataProducerClose,
        internal().router("r1").transport("t1").data_producer("dp1"),
        Value::Null,
    );

    assert!(data_consumer_1.closed());
    assert_eq!(env.notifications.count("dc1", "dataproducerclose"), 1);
    assert_eq!(env.notifications.count("dc2", "dataproducerclose"), 1);

    let dump = env
        .expect_ok(RequestMethod::RouterDump, internal().router("r1"), Value::Null)
        .unwrap();
    assert_eq!(dump["mapDataProducerIdDataConsumerIds"].get("dp1"), None);
    assert_eq!(dump["mapDataConsumerIdDataProducerId"], json!({}));

    // Closing again is a no-op returning success.
    env.expect_ok(
        RequestMethod::DataProducerClose,
        internal().router("r1").transport("t1").data_producer("dp1"),
        Value::Null,
    );
}

#[test]
fn subchannels_filter_fanout() {
    let env = setup();

    env.create_router("r1");
    for transport_id in ["t1", "t2", "t3"] {
        env.expect_ok(
            RequestMethod::RouterCreateDirectTransport,
            internal().router("r1").transport(transport_id),
            json!({}),
        );
    }
    env.expect_ok(
        RequestMethod::TransportProduceData,
        internal().router("r1").transport("t1").data_producer("dp1"),
        json!({ "type": "direct", "label": "events", "protocol": "" }),
    );
    for (transport_id, data_consumer_id, subchannel) in
        [("t2", "dc1", 1u16), ("t3", "dc2", 2u16)]
    {
        env.expect_ok(
            RequestMethod::TransportConsumeData,
            internal()
                .router("r1")
                .transport(transport_id)
                .data_consumer(data_consumer_id),
            json!({
                "dataProducerId": "dp1",
                "type": "direct",
                "label": "events",
                "protocol": "",
                "subchannels": [subchannel],
            }),
        );
    }

    // Tagged message reaches only the matching subscriber.
    env.worker
        .handle_payload_notification(&PayloadChannelNotification {
            event: PayloadEvent::DataProducerSend,
            internal: Internal::from(internal().router("r1").transport("t1").data_producer("dp1")),
            data: json!({ "ppid": 51, "subchannels": [1] }),
            payload: Bytes::from_static(b"tagged"),
        })
        .unwrap();

    assert_eq!(env.payloads.payloads_for("dc1", "message").len(), 1);
    assert_eq!(env.payloads.payloads_for("dc2", "message").len(), 0);

    // Untagged messages reach everyone.
    env.worker
        .handle_payload_notification(&PayloadChannelNotification {
            event: PayloadEvent::DataProducerSend,
            internal: Internal::from(internal().router("r1").transport("t1").data_producer("dp1")),
            data: json!({ "ppid": 51 }),
            payload: Bytes::from_static(b"broadcast"),
        })
        .unwrap();

    assert_eq!(env.payloads.payloads_for("dc1", "message").len(), 2);
    assert_eq!(env.payloads.payloads_for("dc2", "message").len(), 1);

    // Replacing the subscription set changes the filter.
    env.expect_ok(
        RequestMethod::DataConsumerSetSubchannels,
        internal().router("r1").transport("t3").data_consumer("dc2"),
        json!({ "subchannels": [1, 7] }),
    );
    env.worker
        .handle_payload_notification(&PayloadChannelNotification {
            event: PayloadEvent::DataProducerSend,
            internal: Internal::from(internal().router("r1").transport("t1").data_producer("dp1")),
            data: json!({ "ppid": 51, "subchannels": [1] }),
            payload: Bytes::from_static(b"tagged"),
        })
        .unwrap();
    assert_eq!(env.payloads.payloads_for("dc2", "message").len(), 2);
}

#[test]
fn buffered_amount_low_fires_on_downward_crossing() {
    let env = setup();
    sctp_setup(&env);

    env.expect_ok(
        RequestMethod::DataConsumerSetBufferedAmountLowThreshold,
        internal().router("r1").transport("t2").data_consumer("dc1"),
        json!({ "threshold": 100 }),
    );

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport_2 = router.transport(&"t2".into()).unwrap();

    transport_2.on_sctp_buffered_amount(1, 500);
    assert_eq!(env.notifications.count("dc1", "bufferedamountlow"), 0);

    transport_2.on_sctp_buffered_amount(1, 50);
    assert_eq!(env.notifications.count("dc1", "bufferedamountlow"), 1);
    let data = env
        .notifications
        .last_data("dc1", "bufferedamountlow")
        .unwrap();
    assert_eq!(data["bufferedAmount"], json!(50));

    let amount = env
        .expect_ok(
            RequestMethod::DataConsumerGetBufferedAmount,
            internal().router("r1").transport("t2").data_consumer("dc1"),
            Value::Null,
        )
        .unwrap();
    assert_eq!(amount["bufferedAmount"], json!(50));
}

#[test]
fn sctp_data_entities_require_stream_parameters() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");

    let error = env
        .request(
            RequestMethod::TransportProduceData,
            internal().router("r1").transport("t1").data_producer("dp1"),
            json!({ "type": "sctp", "label": "chat", "protocol": "" }),
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::TypeError(_)));

    // A direct-type data producer does not belong on an SCTP transport.
    let error = env
        .request(
            RequestMethod::TransportProduceData,
            internal().router("r1").transport("t1").data_producer("dp1"),
            json!({ "type": "direct", "label": "chat", "protocol": "" }),
        )
        .unwrap_err();
    assert!(matches!(error, RequestError::TypeError(_)));
}
