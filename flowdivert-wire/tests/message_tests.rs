//! Message framing and body layout tests.

use bytes::{Bytes, BytesMut};
use flowdivert_wire::tlv::{self, types};
use flowdivert_wire::*;
use std::net::SocketAddr;

fn sample_connect() -> Connect {
    Connect {
        traffic_class: 0,
        flow_type: FlowType::Stream,
        target: Target::Address("1.2.3.4:443".parse().unwrap()),
        local_addr: None,
        out_if_index: Some(4),
        signing_id: Some("com.example.browser".to_string()),
        cdhash: Some(Bytes::from_static(&[0xCD; 20])),
        audit_token: None,
        flags: message::CONNECT_FLAG_BOUND,
        cfil_id: Some([7; 16]),
        token: None,
    }
}

#[test]
fn test_connect_carries_target_address_record() {
    let raw = Message::Connect(sample_connect()).encode(FlowId(42)).unwrap();
    let frame = Frame::parse(raw).unwrap();
    assert_eq!(frame.header.kind, MessageType::Connect);
    assert_eq!(frame.flow_id(), FlowId(42));

    let target = tlv::get_slice(&frame.body, 0, types::TARGET_ADDRESS).unwrap();
    let expected: SocketAddr = "1.2.3.4:443".parse().unwrap();
    assert_eq!(addr::decode(target).unwrap(), expected);
    assert_eq!(tlv::get_u32(&frame.body, 0, types::FLOW_TYPE).unwrap(), 1);
}

#[test]
fn test_connect_decodes_back() {
    let connect = sample_connect();
    let frame = Frame::parse(Message::Connect(connect.clone()).encode(FlowId(1)).unwrap()).unwrap();
    assert_eq!(frame.message().unwrap(), Message::Connect(connect));
}

#[test]
fn test_connect_with_hostname_target() {
    let mut connect = sample_connect();
    connect.target = Target::Host {
        name: "example.org".to_string(),
        port: 8443,
    };
    let frame = Frame::parse(Message::Connect(connect.clone()).encode(FlowId(1)).unwrap()).unwrap();
    assert_eq!(
        tlv::get_slice(&frame.body, 0, types::TARGET_HOSTNAME).unwrap(),
        b"example.org"
    );
    assert_eq!(frame.message().unwrap(), Message::Connect(connect));
}

#[test]
fn test_connect_token_records_kept_verbatim() {
    let mut token = BytesMut::new();
    tlv::append_u32(&mut token, types::CTL_UNIT, 3).unwrap();
    tlv::append(&mut token, types::APP_DATA, b"resume").unwrap();
    tlv::append(&mut token, types::HMAC, &[0xAB; 32]).unwrap();

    let mut connect = sample_connect();
    connect.token = Some(token.freeze());
    let frame = Frame::parse(Message::Connect(connect.clone()).encode(FlowId(9)).unwrap()).unwrap();
    let Message::Connect(decoded) = frame.message().unwrap() else {
        panic!("expected connect");
    };
    assert_eq!(decoded.token, connect.token);
    assert_eq!(decoded.signing_id, connect.signing_id);
}

#[test]
fn test_connect_without_target_is_rejected() {
    let mut body = BytesMut::new();
    tlv::append_u32(&mut body, types::FLOW_TYPE, 1).unwrap();
    assert_eq!(
        Message::decode(MessageType::Connect, body.freeze()),
        Err(Error::MissingField(types::TARGET_ADDRESS))
    );
}

#[test]
fn test_connect_result_fields() {
    let result = ConnectResult {
        error_code: 0,
        space_available: Some(65536),
        control_unit: Some(5),
        local_addr: Some("10.0.0.2:50000".parse().unwrap()),
        remote_addr: Some("1.2.3.4:443".parse().unwrap()),
        out_if_index: None,
        app_data: Some(Bytes::from_static(b"ticket")),
    };
    let frame = Frame::parse(
        Message::ConnectResult(result.clone())
            .encode(FlowId(77))
            .unwrap(),
    )
    .unwrap();
    assert_eq!(
        tlv::get_u32(&frame.body, 0, types::SPACE_AVAILABLE).unwrap(),
        65536
    );
    assert_eq!(frame.message().unwrap(), Message::ConnectResult(result));
}

#[test]
fn test_close_layout() {
    let raw = Message::Close(Close {
        error_code: 54,
        how: How::Write,
    })
    .encode(FlowId(5))
    .unwrap();
    assert_eq!(
        &raw[..],
        &[
            4, 0, 0, 0, 5, // header
            5, 0, 0, 0, 4, 0, 0, 0, 54, // ERROR_CODE
            7, 0, 0, 0, 4, 0, 0, 0, 1, // HOW
        ]
    );
}

#[test]
fn test_close_rejects_unknown_direction() {
    let mut body = BytesMut::new();
    tlv::append_u32(&mut body, types::ERROR_CODE, 0).unwrap();
    tlv::append_u32(&mut body, types::HOW, 9).unwrap();
    assert!(matches!(
        Message::decode(MessageType::Close, body.freeze()),
        Err(Error::BadValue { ty: types::HOW, .. })
    ));
}

#[test]
fn test_group_init_and_identity_map() {
    let init = GroupInit {
        key: Some(Bytes::from_static(&[1; 32])),
        flags: Some(message::GROUP_FLAG_NO_APP_MAP),
        order: Some(10),
        log_level: Some(7),
    };
    let frame = Frame::parse(Message::GroupInit(init.clone()).encode(FlowId::GROUP).unwrap()).unwrap();
    assert!(frame.flow_id().is_group());
    assert_eq!(frame.message().unwrap(), Message::GroupInit(init));

    let map = IdentityMap {
        prefix_count: 2,
        signing_ids: vec![
            Bytes::from_static(b"com.example.a"),
            Bytes::from_static(b"com.example.b"),
            Bytes::from_static(b"org.other"),
        ],
    };
    let frame = Frame::parse(Message::AppMapCreate(map.clone()).encode(FlowId::GROUP).unwrap()).unwrap();
    assert_eq!(frame.message().unwrap(), Message::AppMapCreate(map));
}

#[test]
fn test_flow_states_reply() {
    let states = vec![
        FlowStateSnapshot {
            flow_id: FlowId(1),
            flags: 0x1,
            bytes_written: 100,
            bytes_sent: 90,
            bytes_received: 5,
            send_window: 4000,
        },
        FlowStateSnapshot {
            flow_id: FlowId(2),
            ..Default::default()
        },
    ];
    let raw = Message::FlowStates(states.clone())
        .encode(FlowId::GROUP)
        .unwrap();
    // header + two records of 5 + 36 bytes
    assert_eq!(raw.len(), HEADER_LEN + 2 * (5 + 36));
    let frame = Frame::parse(raw).unwrap();
    assert_eq!(frame.message().unwrap(), Message::FlowStates(states));
}

#[test]
fn test_oversized_record_in_inbound_message() {
    // READ_NOTIFY for flow 3 whose READ_COUNT declares 0xFFFFFFFF bytes
    // with only 10 bytes behind it.
    let mut raw = vec![5, 0, 0, 0, 3, types::READ_COUNT, 0xFF, 0xFF, 0xFF, 0xFF];
    raw.extend_from_slice(&[0u8; 10]);
    let frame = Frame::parse(Bytes::from(raw)).unwrap();
    assert_eq!(
        frame.message(),
        Err(Error::LengthOverflow {
            ty: types::READ_COUNT,
            declared: u32::MAX,
            remaining: 10
        })
    );
}

#[test]
fn test_datagram_continuation_carries_fragment_flag_only() {
    let continuation = Data {
        fragment: true,
        payload: Bytes::from_static(b"tail"),
        ..Default::default()
    };
    let frame = Frame::parse(Message::Data(continuation.clone()).encode(FlowId(8)).unwrap()).unwrap();
    assert!(tlv::find(&frame.body, 0, types::REMOTE_ADDR, false).is_none());
    let Message::Data(view) = frame.message().unwrap() else {
        panic!("expected data");
    };
    assert_eq!(view.into_datagram().unwrap(), continuation);
}
