mod common;

use common::{audio_packet, internal, setup, video_packet};
use serde_json::{json, Value};
use sfu_worker::messages::RequestMethod;
use sfu_worker::producer::RtcpSenderReport;

fn sender_report(ssrc: u32) -> RtcpSenderReport {
    RtcpSenderReport {
        ssrc,
        ntp_sec: 100,
        ntp_frac: 0,
        rtp_timestamp: 0,
        packet_count: 0,
        octet_count: 0,
    }
}

#[test]
fn forwards_audio_with_rewritten_ssrc() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_webrtc_transport("r1", "t2");
    env.create_audio_producer("r1", "t1", "p1", 1111, 2222);
    env.create_audio_consumer("r1", "t2", "c1", "p1", 2222, 2222);

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport_1 = router.transport(&"t1".into()).unwrap();

    transport_1.receive_rtp_packet(audio_packet(1111, 100));

    let sent = env.driver("t2").sent_rtp.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ssrc, 2222);
    assert_eq!(sent[0].sequence_number, 100);
    assert_eq!(sent[0].payload_type, 100);

    // Nothing left through the ingress transport.
    assert!(env.driver("t1").sent_rtp.lock().is_empty());
}

#[test]
fn forwards_decoded_bytes() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_webrtc_transport("r1", "t2");
    env.create_audio_producer("r1", "t1", "p1", 1111, 2222);
    env.create_audio_consumer("r1", "t2", "c1", "p1", 2222, 2222);

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport_1 = router.transport(&"t1".into()).unwrap();

    // ssrc 1111, seq 7, timestamp 1000 in the test decoder's layout.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&1111u32.to_be_bytes());
    bytes.extend_from_slice(&7u16.to_be_bytes());
    bytes.extend_from_slice(&1000u32.to_be_bytes());
    bytes.extend_from_slice(b"opus");
    transport_1.receive_rtp_data(&bytes);

    let sent = env.driver("t2").sent_rtp.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ssrc, 2222);
    assert_eq!(&sent[0].payload[..], b"opus");

    // Garbage is counted and dropped silently.
    transport_1.receive_rtp_data(&[1, 2, 3]);
    assert_eq!(env.driver("t2").sent_rtp.lock().len(), 1);
}

#[test]
fn paused_producer_drops_packets() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_webrtc_transport("r1", "t2");
    env.create_audio_producer("r1", "t1", "p1", 1111, 2222);
    env.create_audio_consumer("r1", "t2", "c1", "p1", 2222, 2222);

    env.expect_ok(
        RequestMethod::ProducerPause,
        internal().router("r1").transport("t1").producer("p1"),
        Value::Null,
    );
    assert_eq!(env.notifications.count("c1", "producerpause"), 1);

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport_1 = router.transport(&"t1".into()).unwrap();
    transport_1.receive_rtp_packet(audio_packet(1111, 100));
    assert!(env.driver("t2").sent_rtp.lock().is_empty());

    env.expect_ok(
        RequestMethod::ProducerResume,
        internal().router("r1").transport("t1").producer("p1"),
        Value::Null,
    );
    assert_eq!(env.notifications.count("c1", "producerresume"), 1);

    transport_1.receive_rtp_packet(audio_packet(1111, 101));
    assert_eq!(env.driver("t2").sent_rtp.lock().len(), 1);
}

#[test]
fn unknown_ssrc_is_dropped_silently() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_webrtc_transport("r1", "t2");
    env.create_audio_producer("r1", "t1", "p1", 1111, 2222);
    env.create_audio_consumer("r1", "t2", "c1", "p1", 2222, 2222);

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport_1 = router.transport(&"t1".into()).unwrap();
    transport_1.receive_rtp_packet(audio_packet(9999, 1));

    assert!(env.driver("t2").sent_rtp.lock().is_empty());

    let stats = env
        .expect_ok(
            RequestMethod::TransportGetStats,
            internal().router("r1").transport("t1"),
            Value::Null,
        )
        .unwrap();
    assert_eq!(stats[0]["recvRtpPacketCount"], json!(1));
    assert_eq!(stats[0]["ignoredRtpPacketCount"], json!(1));
}

#[test]
fn stream_score_fans_out_once_per_consumer() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_webrtc_transport("r1", "t2");
    env.create_audio_producer("r1", "t1", "p1", 1111, 2222);
    env.create_audio_consumer("r1", "t2", "c1", "p1", 2222, 3331);
    env.create_audio_consumer("r1", "t2", "c2", "p1", 2222, 3332);

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport_1 = router.transport(&"t1".into()).unwrap();

    // Half the packets missing: the score drops below 10 on the next sender
    // report.
    for seq in 0..10u16 {
        transport_1.receive_rtp_packet(audio_packet(1111, seq * 2));
    }
    transport_1.receive_rtcp_sender_report(sender_report(1111));

    assert_eq!(env.notifications.count("p1", "score"), 1);
    assert_eq!(env.notifications.count("c1", "score"), 1);
    assert_eq!(env.notifications.count("c2", "score"), 1);

    let producer_scores = env.notifications.last_data("p1", "score").unwrap();
    assert_eq!(producer_scores[0]["ssrc"], json!(1111));
    assert!(producer_scores[0]["score"].as_u64().unwrap() < 10);

    let consumer_score = env.notifications.last_data("c1", "score").unwrap();
    assert_eq!(consumer_score["producerScores"][0], producer_scores[0]["score"]);
}

#[test]
fn key_frame_requests_are_coalesced() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_webrtc_transport("r1", "t2");
    env.expect_ok(
        RequestMethod::TransportProduce,
        internal().router("r1").transport("t1").producer("p1"),
        common::video_producer_data(&[10], &[110]),
    );
    env.expect_ok(
        RequestMethod::TransportConsume,
        internal().router("r1").transport("t2").consumer("c1"),
        {
            let mut data = common::simulcast_consumer_data("p1", &[110], 500, 0);
            data["type"] = json!("simple");
            data["paused"] = json!(true);
            data
        },
    );

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport_1 = router.transport(&"t1".into()).unwrap();

    // The stream must exist before its SSRC can be reverse-mapped.
    transport_1.receive_rtp_packet(video_packet(10, 1, true));

    for _ in 0..3 {
        env.expect_ok(
            RequestMethod::ConsumerRequestKeyFrame,
            internal().router("r1").transport("t2").consumer("c1"),
            Value::Null,
        );
    }

    // Repeats within the hold-off window collapse into one upstream request.
    assert_eq!(env.driver("t1").key_frame_requests.lock().clone(), vec![10]);
}

#[test]
fn video_orientation_changes_are_reported_once() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.expect_ok(
        RequestMethod::TransportProduce,
        internal().router("r1").transport("t1").producer("p1"),
        common::video_producer_data(&[10], &[110]),
    );

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport_1 = router.transport(&"t1".into()).unwrap();

    let orientation = sfu_worker::rtp_packet::VideoOrientation {
        camera: true,
        flip: false,
        rotation: sfu_worker::rtp_packet::Rotation::Clockwise,
    };

    for seq in 0..3 {
        let mut packet = video_packet(10, seq, seq == 0);
        packet.video_orientation = Some(orientation);
        transport_1.receive_rtp_packet(packet);
    }

    assert_eq!(env.notifications.count("p1", "videoorientationchange"), 1);
    let data = env
        .notifications
        .last_data("p1", "videoorientationchange")
        .unwrap();
    assert_eq!(data["rotation"], json!(90));
}

#[test]
fn worst_remote_fraction_lost_is_the_maximum() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_webrtc_transport("r1", "t2");
    env.create_webrtc_transport("r1", "t3");
    env.create_audio_producer("r1", "t1", "p1", 1111, 2222);
    env.create_audio_consumer("r1", "t2", "c1", "p1", 2222, 3331);
    env.create_audio_consumer("r1", "t3", "c2", "p1", 2222, 3332);

    let router = env.worker.router(&"r1".into()).unwrap();
    let producer = router
        .transport(&"t1".into())
        .unwrap()
        .producer(&"p1".into())
        .unwrap();

    // Nobody reported yet.
    assert_eq!(producer.worst_remote_fraction_lost(2222), 0);

    router
        .transport(&"t2".into())
        .unwrap()
        .receive_rtcp_receiver_report(3331, 5);
    router
        .transport(&"t3".into())
        .unwrap()
        .receive_rtcp_receiver_report(3332, 17);

    assert_eq!(producer.worst_remote_fraction_lost(2222), 17);
}

#[test]
fn dump_reports_streams_and_counters() {
    let env = setup();

    env.create_router("r1");
    env.create_webrtc_transport("r1", "t1");
    env.create_audio_producer("r1", "t1", "p1", 1111, 2222);

    let router = env.worker.router(&"r1".into()).unwrap();
    let transport_1 = router.transport(&"t1".into()).unwrap();
    for seq in 0..4 {
        transport_1.receive_rtp_packet(audio_packet(1111, seq));
    }

    let dump = env
        .expect_ok(
            RequestMethod::ProducerDump,
            internal().router("r1").transport("t1").producer("p1"),
            Value::Null,
        )
        .unwrap();

    assert_eq!(dump["id"], json!("p1"));
    assert_eq!(dump["kind"], json!("audio"));
    assert_eq!(dump["type"], json!("simple"));
    assert_eq!(dump["rtpStreams"][0]["ssrc"], json!(1111));
    assert_eq!(dump["rtpStreams"][0]["mappedSsrc"], json!(2222));
    assert_eq!(dump["rtpStreams"][0]["packetCount"], json!(4));
    assert_eq!(dump["rtpStreams"][0]["score"], json!(10));
}
