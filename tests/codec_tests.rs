use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use dags::protocol::codec::WireCodec;
use dags::protocol::message::{Body, Envelope, GroupMessage, JobPayload, RequestKind};
use dags::protocol::wire;

fn group_envelope() -> Envelope {
    Envelope {
        client_id: 7,
        kind: RequestKind::Group,
        code: wire::NO_ERROR,
        app_name: "onemax".to_string(),
        version: "0.1.0".to_string(),
        compression: 6,
        group_id: Some(3),
        generation: Some(12),
        body: Body::Group(GroupMessage {
            group_id: 3,
            generation: 12,
            environment: "weights=[0.5, 0.25]".repeat(64),
            distribute_env: true,
            jobs: (0..16)
                .map(|i| JobPayload {
                    id: i,
                    evaluate: i % 2 == 0,
                    data: Some(format!("genome-{i}-{}", "ACGT".repeat(32))),
                    score: (i % 2 != 0).then(|| format!("{}.25", i)),
                })
                .collect(),
        }),
    }
}

fn round_trip(level: u32) -> Envelope {
    let mut codec = WireCodec::new(level);
    let mut buf = BytesMut::new();
    codec.encode(group_envelope(), &mut buf).unwrap();
    codec.decode(&mut buf).unwrap().unwrap()
}

#[test]
fn group_round_trip_preserves_everything() {
    for level in [0, 6, 9] {
        let decoded = round_trip(level);
        let original = group_envelope();
        assert_eq!(decoded, original, "level {level}");
        let (Body::Group(got), Body::Group(want)) = (&decoded.body, &original.body) else {
            panic!("body variant changed");
        };
        assert_eq!(got.environment, want.environment);
        assert_eq!(got.generation, want.generation);
        for (g, w) in got.jobs.iter().zip(&want.jobs) {
            assert_eq!(g.data, w.data);
            assert_eq!(g.score, w.score);
        }
    }
}

#[test]
fn mixed_levels_interoperate() {
    // A compressing sender and a plain sender share one receiving codec.
    let mut receiver = WireCodec::new(0);
    let mut buf = BytesMut::new();
    WireCodec::new(9).encode(group_envelope(), &mut buf).unwrap();
    WireCodec::new(0).encode(group_envelope(), &mut buf).unwrap();
    assert_eq!(receiver.decode(&mut buf).unwrap().unwrap(), group_envelope());
    assert_eq!(receiver.decode(&mut buf).unwrap().unwrap(), group_envelope());
}

#[test]
fn byte_by_byte_delivery_decodes_once_complete() {
    let mut sender = WireCodec::new(6);
    let mut wire_bytes = BytesMut::new();
    sender.encode(group_envelope(), &mut wire_bytes).unwrap();

    let mut receiver = WireCodec::new(0);
    let mut buf = BytesMut::new();
    let total = wire_bytes.len();
    for (i, byte) in wire_bytes.iter().enumerate() {
        buf.extend_from_slice(&[*byte]);
        let decoded = receiver.decode(&mut buf).unwrap();
        if i + 1 < total {
            assert!(decoded.is_none(), "decoded early at byte {i}");
        } else {
            assert_eq!(decoded.unwrap(), group_envelope());
        }
    }
}

#[test]
fn corrupt_compressed_body_is_a_protocol_error() {
    let mut codec = WireCodec::new(6);
    let mut buf = BytesMut::new();
    codec.encode(group_envelope(), &mut buf).unwrap();
    // Flip a byte inside the zlib stream.
    let mid = buf.len() / 2;
    buf[mid] ^= 0xFF;
    assert!(codec.decode(&mut buf).is_err());
}
