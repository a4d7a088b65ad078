//! # Control-Channel Messages
//!
//! One variant per message kind. Encoding writes the 5-byte header followed
//! by the body records; decoding is split in two steps because a DATA body
//! can only be interpreted once the owning flow's type is known:
//!
//! 1. [`Frame::parse`] splits header and body and checks the message type.
//! 2. [`Frame::message`] decodes the body into a [`Message`]. DATA bodies
//!    come back as stream payload; datagram flows re-read them with
//!    [`Data::into_datagram`].

#![forbid(unsafe_code)]

use crate::addr;
use crate::error::{Error, Result};
use crate::tlv::{self, types, Records};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;

/// Size of the message header (type byte + 32-bit flow id).
pub const HEADER_LEN: usize = 5;

/// Size of one encoded [`FlowStateSnapshot`].
pub const FLOW_STATE_LEN: usize = 36;

/// Connect flag: the application supplied data that is safe to replay.
pub const CONNECT_FLAG_DATA_IDEMPOTENT: u32 = 0x0000_0002;
/// Connect flag: the socket was explicitly bound before connecting.
pub const CONNECT_FLAG_BOUND: u32 = 0x0000_0008;

/// Group-init flag: the group does not enforce an app identity map.
pub const GROUP_FLAG_NO_APP_MAP: u32 = 0x0000_0001;

/// Identifier of a flow within its provider group.
///
/// Zero is reserved for group-scoped messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FlowId(pub u32);

impl FlowId {
    /// Id carried by group-scoped messages.
    pub const GROUP: FlowId = FlowId(0);

    pub fn is_group(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Message type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Connect = 1,
    ConnectResult = 2,
    Data = 3,
    Close = 4,
    ReadNotify = 5,
    GroupInit = 6,
    PropertiesUpdate = 7,
    AppMapCreate = 9,
    FlowStatesRequest = 10,
    FlowStates = 11,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            1 => MessageType::Connect,
            2 => MessageType::ConnectResult,
            3 => MessageType::Data,
            4 => MessageType::Close,
            5 => MessageType::ReadNotify,
            6 => MessageType::GroupInit,
            7 => MessageType::PropertiesUpdate,
            9 => MessageType::AppMapCreate,
            10 => MessageType::FlowStatesRequest,
            11 => MessageType::FlowStates,
            other => return Err(Error::UnknownMessageType(other)),
        })
    }
}

/// Flow type carried in CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FlowType {
    Stream = 1,
    Datagram = 3,
}

impl FlowType {
    fn from_wire(v: u32) -> Result<Self> {
        match v {
            1 => Ok(FlowType::Stream),
            3 => Ok(FlowType::Datagram),
            _ => Err(Error::BadValue {
                ty: types::FLOW_TYPE,
                reason: "unknown flow type",
            }),
        }
    }
}

/// Shutdown direction carried in CLOSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum How {
    Read = 0,
    Write = 1,
    Both = 2,
}

impl How {
    fn from_wire(v: u32) -> Result<Self> {
        match v {
            0 => Ok(How::Read),
            1 => Ok(How::Write),
            2 => Ok(How::Both),
            _ => Err(Error::BadValue {
                ty: types::HOW,
                reason: "unknown shutdown direction",
            }),
        }
    }

    pub fn includes_read(&self) -> bool {
        !matches!(self, How::Write)
    }

    pub fn includes_write(&self) -> bool {
        !matches!(self, How::Read)
    }
}

/// Destination of a diverted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Address(SocketAddr),
    Host { name: String, port: u16 },
}

/// Message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageType,
    pub flow_id: FlowId,
}

impl Header {
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if buf.remaining_mut() < HEADER_LEN {
            return Err(Error::BufferFull {
                needed: HEADER_LEN,
                remaining: buf.remaining_mut(),
            });
        }
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.flow_id.0);
        Ok(())
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_LEN {
            return Err(Error::Truncated {
                needed: HEADER_LEN,
                remaining: raw.len(),
            });
        }
        let kind = MessageType::try_from(raw[0])?;
        let flow_id = FlowId(u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]));
        Ok(Self { kind, flow_id })
    }
}

/// A received message whose body has not been decoded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    pub fn parse(raw: Bytes) -> Result<Self> {
        let header = Header::decode(&raw)?;
        let body = raw.slice(HEADER_LEN..);
        Ok(Self { header, body })
    }

    pub fn flow_id(&self) -> FlowId {
        self.header.flow_id
    }

    pub fn message(&self) -> Result<Message> {
        Message::decode(self.header.kind, self.body.clone())
    }
}

/// CONNECT: ask the provider to open a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub traffic_class: u32,
    pub flow_type: FlowType,
    pub target: Target,
    pub local_addr: Option<SocketAddr>,
    pub out_if_index: Option<u32>,
    pub signing_id: Option<String>,
    pub cdhash: Option<Bytes>,
    pub audit_token: Option<Bytes>,
    pub flags: u32,
    pub cfil_id: Option<[u8; 16]>,
    /// Token records appended verbatim, HMAC record last.
    pub token: Option<Bytes>,
}

/// CONNECT_RESULT: the provider's answer to a CONNECT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectResult {
    pub error_code: u32,
    pub space_available: Option<u32>,
    pub control_unit: Option<u32>,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub out_if_index: Option<u32>,
    pub app_data: Option<Bytes>,
}

/// DATA: payload in either direction.
///
/// Address and fragment records are only meaningful for datagram flows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Data {
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    /// Total size of a datagram split across several DATA messages.
    pub datagram_size: Option<u32>,
    /// Continuation of the datagram started by an earlier DATA message.
    pub fragment: bool,
    pub payload: Bytes,
}

impl Data {
    pub fn stream(payload: Bytes) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    /// Re-read a stream-decoded body as a datagram body: consume leading
    /// address and fragment records, the rest is payload.
    pub fn into_datagram(self) -> Result<Self> {
        let raw = self.payload;
        let mut out = Data::default();
        let mut records = Records::new(&raw);
        loop {
            let offset = records.offset();
            let ty = match raw.get(offset) {
                Some(ty) => *ty,
                None => break,
            };
            if !matches!(
                ty,
                types::REMOTE_ADDR | types::LOCAL_ADDR | types::DATAGRAM_SIZE | types::IS_FRAGMENT
            ) {
                break;
            }
            let Some(record) = records.next() else { break };
            let (ty, value) = record?;
            match ty {
                types::REMOTE_ADDR => out.remote_addr = Some(addr::decode(value)?),
                types::LOCAL_ADDR => out.local_addr = Some(addr::decode(value)?),
                types::DATAGRAM_SIZE => out.datagram_size = Some(tlv::be_u32(ty, value)?),
                _ => out.fragment = value.first().copied().unwrap_or(0) != 0,
            }
        }
        out.payload = raw.slice(records.offset().min(raw.len())..);
        Ok(out)
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        if let Some(remote) = &self.remote_addr {
            addr::append(buf, types::REMOTE_ADDR, remote)?;
        }
        if let Some(local) = &self.local_addr {
            addr::append(buf, types::LOCAL_ADDR, local)?;
        }
        if let Some(size) = self.datagram_size {
            tlv::append_u32(buf, types::DATAGRAM_SIZE, size)?;
        }
        if self.fragment {
            tlv::append(buf, types::IS_FRAGMENT, &[1])?;
        }
        if buf.remaining_mut() < self.payload.len() {
            return Err(Error::BufferFull {
                needed: self.payload.len(),
                remaining: buf.remaining_mut(),
            });
        }
        buf.put_slice(&self.payload);
        Ok(())
    }
}

/// CLOSE: one or both directions of a flow are shut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Close {
    pub error_code: u32,
    pub how: How,
}

/// READ_NOTIFY: send credit (provider to engine) or consumed bytes
/// (engine to provider).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadNotify {
    pub read_count: u32,
}

/// PROPERTIES_UPDATE: mid-flow changes pushed by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertiesUpdate {
    pub out_if_index: Option<u32>,
    pub app_data: Option<Bytes>,
}

/// GROUP_INIT: provider-wide settings for a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupInit {
    pub key: Option<Bytes>,
    pub flags: Option<u32>,
    pub order: Option<u32>,
    pub log_level: Option<u32>,
}

/// APP_MAP_CREATE: the set of signing identities allowed to divert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMap {
    pub prefix_count: u32,
    pub signing_ids: Vec<Bytes>,
}

/// One flow's counters in a FLOW_STATES reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStateSnapshot {
    pub flow_id: FlowId,
    pub flags: u32,
    pub bytes_written: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_window: u32,
}

impl FlowStateSnapshot {
    pub fn encode(&self) -> [u8; FLOW_STATE_LEN] {
        let mut out = [0u8; FLOW_STATE_LEN];
        let mut cursor = &mut out[..];
        cursor.put_u32(self.flow_id.0);
        cursor.put_u32(self.flags);
        cursor.put_u64(self.bytes_written);
        cursor.put_u64(self.bytes_sent);
        cursor.put_u64(self.bytes_received);
        cursor.put_u32(self.send_window);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let raw: &[u8; FLOW_STATE_LEN] = raw.try_into().map_err(|_| Error::BadValue {
            ty: types::FLOW_STATE,
            reason: "expected 36 bytes",
        })?;
        let u32_at = |i: usize| u32::from_be_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[i..i + 8]);
            u64::from_be_bytes(b)
        };
        Ok(Self {
            flow_id: FlowId(u32_at(0)),
            flags: u32_at(4),
            bytes_written: u64_at(8),
            bytes_sent: u64_at(16),
            bytes_received: u64_at(24),
            send_window: u32_at(32),
        })
    }
}

/// Every message the control channel carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Connect(Connect),
    ConnectResult(ConnectResult),
    Data(Data),
    Close(Close),
    ReadNotify(ReadNotify),
    PropertiesUpdate(PropertiesUpdate),
    GroupInit(GroupInit),
    AppMapCreate(IdentityMap),
    FlowStatesRequest,
    FlowStates(Vec<FlowStateSnapshot>),
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Connect(_) => MessageType::Connect,
            Message::ConnectResult(_) => MessageType::ConnectResult,
            Message::Data(_) => MessageType::Data,
            Message::Close(_) => MessageType::Close,
            Message::ReadNotify(_) => MessageType::ReadNotify,
            Message::PropertiesUpdate(_) => MessageType::PropertiesUpdate,
            Message::GroupInit(_) => MessageType::GroupInit,
            Message::AppMapCreate(_) => MessageType::AppMapCreate,
            Message::FlowStatesRequest => MessageType::FlowStatesRequest,
            Message::FlowStates(_) => MessageType::FlowStates,
        }
    }

    /// Encode header and body into a fresh buffer.
    pub fn encode(&self, flow_id: FlowId) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        Header {
            kind: self.kind(),
            flow_id,
        }
        .encode(&mut buf)?;
        self.encode_body(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode only the body records.
    pub fn encode_body<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Message::Connect(c) => encode_connect(c, buf),
            Message::ConnectResult(r) => {
                tlv::append_u32(buf, types::ERROR_CODE, r.error_code)?;
                if let Some(space) = r.space_available {
                    tlv::append_u32(buf, types::SPACE_AVAILABLE, space)?;
                }
                if let Some(unit) = r.control_unit {
                    tlv::append_u32(buf, types::CTL_UNIT, unit)?;
                }
                if let Some(local) = &r.local_addr {
                    addr::append(buf, types::LOCAL_ADDR, local)?;
                }
                if let Some(remote) = &r.remote_addr {
                    addr::append(buf, types::REMOTE_ADDR, remote)?;
                }
                if let Some(index) = r.out_if_index {
                    tlv::append_u32(buf, types::OUT_IF_INDEX, index)?;
                }
                if let Some(app_data) = &r.app_data {
                    tlv::append(buf, types::APP_DATA, app_data)?;
                }
                Ok(())
            }
            Message::Data(d) => d.encode_body(buf),
            Message::Close(c) => {
                tlv::append_u32(buf, types::ERROR_CODE, c.error_code)?;
                tlv::append_u32(buf, types::HOW, c.how as u32)
            }
            Message::ReadNotify(n) => tlv::append_u32(buf, types::READ_COUNT, n.read_count),
            Message::PropertiesUpdate(p) => {
                if let Some(index) = p.out_if_index {
                    tlv::append_u32(buf, types::OUT_IF_INDEX, index)?;
                }
                if let Some(app_data) = &p.app_data {
                    tlv::append(buf, types::APP_DATA, app_data)?;
                }
                Ok(())
            }
            Message::GroupInit(g) => {
                if let Some(key) = &g.key {
                    tlv::append(buf, types::TOKEN_KEY, key)?;
                }
                if let Some(flags) = g.flags {
                    tlv::append_u32(buf, types::FLAGS, flags)?;
                }
                if let Some(order) = g.order {
                    tlv::append_u32(buf, types::ORDER, order)?;
                }
                if let Some(level) = g.log_level {
                    tlv::append_u32(buf, types::LOG_LEVEL, level)?;
                }
                Ok(())
            }
            Message::AppMapCreate(m) => {
                tlv::append_u32(buf, types::PREFIX_COUNT, m.prefix_count)?;
                for id in &m.signing_ids {
                    tlv::append(buf, types::SIGNING_ID, id)?;
                }
                Ok(())
            }
            Message::FlowStatesRequest => Ok(()),
            Message::FlowStates(states) => {
                for state in states {
                    tlv::append(buf, types::FLOW_STATE, &state.encode())?;
                }
                Ok(())
            }
        }
    }

    /// Decode a body of the given type.
    pub fn decode(kind: MessageType, body: Bytes) -> Result<Self> {
        Ok(match kind {
            MessageType::Connect => Message::Connect(decode_connect(&body)?),
            MessageType::ConnectResult => {
                let mut r = ConnectResult::default();
                let mut saw_error = false;
                for record in Records::new(&body) {
                    let (ty, value) = record?;
                    match ty {
                        types::ERROR_CODE => {
                            r.error_code = tlv::be_u32(ty, value)?;
                            saw_error = true;
                        }
                        types::SPACE_AVAILABLE => r.space_available = Some(tlv::be_u32(ty, value)?),
                        types::CTL_UNIT => r.control_unit = Some(tlv::be_u32(ty, value)?),
                        types::LOCAL_ADDR => r.local_addr = Some(addr::decode(value)?),
                        types::REMOTE_ADDR => r.remote_addr = Some(addr::decode(value)?),
                        types::OUT_IF_INDEX => r.out_if_index = Some(tlv::be_u32(ty, value)?),
                        types::APP_DATA => r.app_data = Some(body.slice_ref(value)),
                        _ => {}
                    }
                }
                if !saw_error {
                    return Err(Error::MissingField(types::ERROR_CODE));
                }
                Message::ConnectResult(r)
            }
            MessageType::Data => Message::Data(Data::stream(body)),
            MessageType::Close => {
                let error_code = tlv::get_u32(&body, 0, types::ERROR_CODE)?;
                let how = How::from_wire(tlv::get_u32(&body, 0, types::HOW)?)?;
                Message::Close(Close { error_code, how })
            }
            MessageType::ReadNotify => Message::ReadNotify(ReadNotify {
                read_count: tlv::get_u32(&body, 0, types::READ_COUNT)?,
            }),
            MessageType::PropertiesUpdate => {
                let mut p = PropertiesUpdate::default();
                for record in Records::new(&body) {
                    let (ty, value) = record?;
                    match ty {
                        types::OUT_IF_INDEX => p.out_if_index = Some(tlv::be_u32(ty, value)?),
                        types::APP_DATA => p.app_data = Some(body.slice_ref(value)),
                        _ => {}
                    }
                }
                Message::PropertiesUpdate(p)
            }
            MessageType::GroupInit => {
                let mut g = GroupInit::default();
                for record in Records::new(&body) {
                    let (ty, value) = record?;
                    match ty {
                        types::TOKEN_KEY => g.key = Some(body.slice_ref(value)),
                        types::FLAGS => g.flags = Some(tlv::be_u32(ty, value)?),
                        types::ORDER => g.order = Some(tlv::be_u32(ty, value)?),
                        types::LOG_LEVEL => g.log_level = Some(tlv::be_u32(ty, value)?),
                        _ => {}
                    }
                }
                Message::GroupInit(g)
            }
            MessageType::AppMapCreate => Message::AppMapCreate(decode_identity_map(&body)?),
            MessageType::FlowStatesRequest => Message::FlowStatesRequest,
            MessageType::FlowStates => {
                let mut states = Vec::new();
                for record in Records::new(&body) {
                    let (ty, value) = record?;
                    if ty == types::FLOW_STATE {
                        states.push(FlowStateSnapshot::decode(value)?);
                    }
                }
                Message::FlowStates(states)
            }
        })
    }
}

fn encode_connect<B: BufMut>(c: &Connect, buf: &mut B) -> Result<()> {
    tlv::append_u32(buf, types::TRAFFIC_CLASS, c.traffic_class)?;
    tlv::append_u32(buf, types::FLOW_TYPE, c.flow_type as u32)?;
    match &c.target {
        Target::Address(target) => addr::append(buf, types::TARGET_ADDRESS, target)?,
        Target::Host { name, port } => {
            tlv::append(buf, types::TARGET_HOSTNAME, name.as_bytes())?;
            tlv::append(buf, types::TARGET_PORT, &port.to_be_bytes())?;
        }
    }
    if let Some(local) = &c.local_addr {
        addr::append(buf, types::LOCAL_ADDR, local)?;
    }
    if let Some(index) = c.out_if_index {
        tlv::append_u32(buf, types::OUT_IF_INDEX, index)?;
    }
    if let Some(signing_id) = &c.signing_id {
        tlv::append(buf, types::SIGNING_ID, signing_id.as_bytes())?;
    }
    if let Some(cdhash) = &c.cdhash {
        tlv::append(buf, types::CDHASH, cdhash)?;
    }
    if let Some(audit_token) = &c.audit_token {
        tlv::append(buf, types::APP_AUDIT_TOKEN, audit_token)?;
    }
    if c.flags != 0 {
        tlv::append_u32(buf, types::FLAGS, c.flags)?;
    }
    if let Some(cfil_id) = &c.cfil_id {
        tlv::append(buf, types::CFIL_ID, cfil_id)?;
    }
    if let Some(token) = &c.token {
        if buf.remaining_mut() < token.len() {
            return Err(Error::BufferFull {
                needed: token.len(),
                remaining: buf.remaining_mut(),
            });
        }
        buf.put_slice(token);
    }
    Ok(())
}

fn decode_connect(body: &Bytes) -> Result<Connect> {
    let mut traffic_class = 0;
    let mut flow_type = None;
    let mut target_addr = None;
    let mut hostname = None;
    let mut port = None;
    let mut c = Connect {
        traffic_class: 0,
        flow_type: FlowType::Stream,
        target: Target::Host {
            name: String::new(),
            port: 0,
        },
        local_addr: None,
        out_if_index: None,
        signing_id: None,
        cdhash: None,
        audit_token: None,
        flags: 0,
        cfil_id: None,
        token: None,
    };

    let mut records = Records::new(body);
    loop {
        let offset = records.offset();
        // Token records start at the first control-unit record.
        if matches!(body.get(offset), Some(&types::CTL_UNIT) | Some(&types::KEY_UNIT)) {
            c.token = Some(body.slice(offset..));
            break;
        }
        let Some(record) = records.next() else { break };
        let (ty, value) = record?;
        match ty {
            types::TRAFFIC_CLASS => traffic_class = tlv::be_u32(ty, value)?,
            types::FLOW_TYPE => flow_type = Some(FlowType::from_wire(tlv::be_u32(ty, value)?)?),
            types::TARGET_ADDRESS => target_addr = Some(addr::decode(value)?),
            types::TARGET_HOSTNAME => {
                hostname = Some(String::from_utf8(value.to_vec()).map_err(|_| Error::BadValue {
                    ty,
                    reason: "hostname is not UTF-8",
                })?)
            }
            types::TARGET_PORT => {
                let raw: [u8; 2] = value.try_into().map_err(|_| Error::BadValue {
                    ty,
                    reason: "expected 2 bytes",
                })?;
                port = Some(u16::from_be_bytes(raw));
            }
            types::LOCAL_ADDR => c.local_addr = Some(addr::decode(value)?),
            types::OUT_IF_INDEX => c.out_if_index = Some(tlv::be_u32(ty, value)?),
            types::SIGNING_ID => {
                c.signing_id = Some(String::from_utf8(value.to_vec()).map_err(|_| {
                    Error::BadValue {
                        ty,
                        reason: "signing identity is not UTF-8",
                    }
                })?)
            }
            types::CDHASH => c.cdhash = Some(body.slice_ref(value)),
            types::APP_AUDIT_TOKEN => c.audit_token = Some(body.slice_ref(value)),
            types::FLAGS => c.flags = tlv::be_u32(ty, value)?,
            types::CFIL_ID => {
                c.cfil_id = Some(value.try_into().map_err(|_| Error::BadValue {
                    ty,
                    reason: "expected 16 bytes",
                })?)
            }
            _ => {}
        }
    }

    c.traffic_class = traffic_class;
    c.flow_type = flow_type.ok_or(Error::MissingField(types::FLOW_TYPE))?;
    c.target = match (target_addr, hostname, port) {
        (Some(target), _, _) => Target::Address(target),
        (None, Some(name), Some(port)) => Target::Host { name, port },
        _ => return Err(Error::MissingField(types::TARGET_ADDRESS)),
    };
    Ok(c)
}

fn decode_identity_map(body: &Bytes) -> Result<IdentityMap> {
    let prefix_count = tlv::get_u32(body, 0, types::PREFIX_COUNT)?;
    let mut signing_ids = Vec::new();
    let mut cursor = tlv::find(body, 0, types::SIGNING_ID, false);
    while let Some(at) = cursor {
        let (ty, value) = tlv::value_at(body, at)?;
        if ty == types::SIGNING_ID {
            signing_ids.push(body.slice_ref(value));
        }
        cursor = tlv::find(body, at + tlv::TLV_HEADER_LEN + value.len(), types::SIGNING_ID, true);
    }
    Ok(IdentityMap {
        prefix_count,
        signing_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let raw = Message::ReadNotify(ReadNotify { read_count: 7 })
            .encode(FlowId(0x0102_0304))
            .unwrap();
        assert_eq!(&raw[..HEADER_LEN], &[5, 1, 2, 3, 4]);
    }

    #[test]
    fn test_unknown_message_type() {
        let raw = Bytes::from_static(&[8, 0, 0, 0, 1]);
        assert_eq!(Frame::parse(raw), Err(Error::UnknownMessageType(8)));
    }

    #[test]
    fn test_truncated_header() {
        let raw = Bytes::from_static(&[1, 0, 0]);
        assert!(matches!(Frame::parse(raw), Err(Error::Truncated { .. })));
    }

    #[test]
    fn test_connect_result_requires_error_code() {
        let mut body = BytesMut::new();
        tlv::append_u32(&mut body, types::SPACE_AVAILABLE, 10).unwrap();
        assert_eq!(
            Message::decode(MessageType::ConnectResult, body.freeze()),
            Err(Error::MissingField(types::ERROR_CODE))
        );
    }

    #[test]
    fn test_stream_data_body_is_all_payload() {
        // A stream payload whose first byte happens to look like an address record.
        let payload = Bytes::from_static(&[types::REMOTE_ADDR, 0, 0, 0, 0, 9, 9]);
        let frame = Frame::parse(Message::Data(Data::stream(payload.clone())).encode(FlowId(3)).unwrap())
            .unwrap();
        match frame.message().unwrap() {
            Message::Data(d) => assert_eq!(d.payload, payload),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_datagram_body_splits_leading_records() {
        let data = Data {
            remote_addr: Some("9.9.9.9:53".parse().unwrap()),
            datagram_size: Some(9000),
            payload: Bytes::from_static(b"query"),
            ..Default::default()
        };
        let frame = Frame::parse(Message::Data(data.clone()).encode(FlowId(3)).unwrap()).unwrap();
        let Message::Data(stream_view) = frame.message().unwrap() else {
            panic!("expected data");
        };
        assert_eq!(stream_view.into_datagram().unwrap(), data);
    }

    #[test]
    fn test_flow_state_snapshot_layout() {
        let snapshot = FlowStateSnapshot {
            flow_id: FlowId(1),
            flags: 2,
            bytes_written: 3,
            bytes_sent: 4,
            bytes_received: 5,
            send_window: 6,
        };
        let raw = snapshot.encode();
        assert_eq!(&raw[..4], &[0, 0, 0, 1]);
        assert_eq!(raw[35], 6);
        assert_eq!(FlowStateSnapshot::decode(&raw).unwrap(), snapshot);
        assert!(FlowStateSnapshot::decode(&raw[..35]).is_err());
    }
}
