#![expect(clippy::unwrap_used, reason = "test code")]

use bytes::Bytes;
use esphome_api_proto::*;
use proptest::prelude::*;

const HELLO_REQUEST_PAYLOAD: &[u8] = &[
    0x0a, 0x0d, b'a', b'i', b'o', b'e', b's', b'p', b'h', b'o', b'm', b'e', b'a', b'p', b'i', 0x10, 0x01, 0x18, 0x0a,
];

#[test]
fn decode_hello_request() {
    let raw = RawMessage::new(1, Bytes::from_static(HELLO_REQUEST_PAYLOAD));

    let ProtoMessage::HelloRequest(hello) = raw.decode().unwrap() else {
        panic!("unexpected message");
    };

    assert_eq!(hello.client_info, "aioesphomeapi");
    assert_eq!(hello.api_version_major, 1);
    assert_eq!(hello.api_version_minor, 10);
}

#[test]
fn encode_hello_response() {
    let msg = ProtoMessage::from(HelloResponse {
        api_version_major: 1,
        api_version_minor: 1,
        server_info: "Test Server".to_owned(),
        name: "Test Server".to_owned(),
    });

    let raw = RawMessage::from(&msg);

    assert_eq!(raw.message_type, 2);
    let mut expected = vec![8, 1, 16, 1, 26, 11];
    expected.extend_from_slice(b"Test Server");
    expected.extend_from_slice(&[34, 11]);
    expected.extend_from_slice(b"Test Server");
    assert_eq!(raw.payload, expected);
}

#[test]
fn empty_messages_have_empty_payloads() {
    for msg in [
        ProtoMessage::from(PingRequest {}),
        ProtoMessage::from(ListEntitiesRequest {}),
        ProtoMessage::from(DisconnectResponse {}),
    ] {
        assert!(msg.encode_payload().is_empty(), "{:?}", msg.message_type());
    }
}

#[test]
fn unknown_message_type() {
    let err = RawMessage::new(14, Bytes::new()).decode().unwrap_err();
    assert!(matches!(err, Error::UnknownMessageType(14)));
    assert_eq!(err.to_string(), "unknown message type 14");
}

#[test]
fn truncated_payload_names_the_message() {
    let err = RawMessage::new(1, Bytes::from_static(&HELLO_REQUEST_PAYLOAD[..5]))
        .decode()
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Decode {
            message_type: MessageType::HelloRequest,
            ..
        }
    ));
    assert_eq!(err.to_string(), "malformed HelloRequest payload");
}

#[test]
fn message_type_ids() {
    assert_eq!(MessageType::try_from(10).unwrap(), MessageType::DeviceInfoResponse);
    assert_eq!(MessageType::try_from(62).unwrap(), MessageType::ButtonCommandRequest);
    assert_eq!(u16::from(MessageType::ListEntitiesButtonResponse), 61);
    assert_eq!(MessageType::SubscribeStatesRequest.name(), "SubscribeStatesRequest");
}

#[test]
fn light_listing_keeps_color_modes() {
    let listing = ListEntitiesLightResponse {
        object_id: "test_light_object_id".to_owned(),
        key: 4,
        supported_color_modes: vec![ColorMode::OnOff as i32, ColorMode::Brightness as i32],
        entity_category: EntityCategory::Config as i32,
        ..Default::default()
    };

    let raw = RawMessage::from(ProtoMessage::from(listing.clone()));
    let ProtoMessage::ListEntitiesLightResponse(decoded) = raw.decode().unwrap() else {
        panic!("unexpected message");
    };

    assert_eq!(decoded, listing);
    assert_eq!(decoded.entity_category(), EntityCategory::Config);
}

#[test]
fn sensor_state_survives_transport() {
    proptest!(|(key in any::<u32>(), state in -1.0e6f32..1.0e6f32)| {
        let msg = ProtoMessage::from(SensorStateResponse { key, state, missing_state: false });
        let decoded = RawMessage::from(&msg).decode().map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(decoded, msg);
    })
}
