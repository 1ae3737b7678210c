//! Integration tests for the JSON wire format through the `Codec` trait.

use std::collections::BTreeMap;

use hostlink_protocol::{
    Codec, Envelope, JOIN_CODE_KEY, JsonCodec, Payload, PlayerId, SessionDescriptor, SessionId,
    SignalErrorKind, SignalMessage, SignalResponse, Visibility,
};

// ===========================================================================
// Helpers
// ===========================================================================

fn lobby() -> SessionDescriptor {
    SessionDescriptor {
        id: SessionId("s-42".into()),
        name: "Test Lobby".into(),
        code: "LOBBY1".into(),
        max_participants: 4,
        participants: vec![PlayerId("host".into())],
        visibility: Visibility::Public,
        host: PlayerId("host".into()),
        metadata: BTreeMap::from([(JOIN_CODE_KEY.to_string(), "KX7P2M".to_string())]),
    }
}

// ===========================================================================
// Signal envelopes
// ===========================================================================

#[test]
fn test_signal_response_preserves_join_code_metadata() {
    let codec = JsonCodec;
    let envelope = Envelope {
        seq: 3,
        timestamp: 1200,
        payload: Payload::Signal(SignalMessage::Response {
            id: 11,
            body: SignalResponse::Sessions {
                sessions: vec![lobby()],
            },
        }),
    };

    let bytes = codec.encode(&envelope).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["payload"]["kind"], "Signal");
    assert_eq!(
        json["payload"]["data"]["body"]["sessions"][0]["metadata"]["joinCode"],
        "KX7P2M"
    );

    let decoded: Envelope = codec.decode(&bytes).unwrap();
    let Payload::Signal(SignalMessage::Response {
        body: SignalResponse::Sessions { sessions },
        ..
    }) = decoded.payload
    else {
        panic!("expected a sessions response");
    };
    assert_eq!(sessions[0].join_token(), Some("KX7P2M"));
}

#[test]
fn test_signal_error_decodes_from_handwritten_json() {
    let codec = JsonCodec;
    let raw = br#"{
        "seq": 1,
        "timestamp": 0,
        "payload": {
            "kind": "Signal",
            "data": {
                "type": "Response",
                "id": 5,
                "body": { "op": "Error", "kind": "InvalidJoinCode", "message": "unknown code" }
            }
        }
    }"#;

    let envelope: Envelope = codec.decode(raw).unwrap();
    assert_eq!(
        envelope.payload,
        Payload::Signal(SignalMessage::Response {
            id: 5,
            body: SignalResponse::Error {
                kind: SignalErrorKind::InvalidJoinCode,
                message: "unknown code".into(),
            },
        })
    );
}

#[test]
fn test_session_descriptor_metadata_defaults_to_empty() {
    let codec = JsonCodec;
    let raw = br#"{
        "id": "s-1", "name": "Bare", "code": "BARE01", "max_participants": 2,
        "participants": [], "visibility": "Public", "host": "h"
    }"#;
    let session: SessionDescriptor = codec.decode(raw).unwrap();
    assert!(session.metadata.is_empty());
    assert_eq!(session.join_token(), None);
}
