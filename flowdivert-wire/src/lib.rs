//! flowdivert-wire: Control-Channel Wire Format
//!
//! This crate implements the binary protocol spoken between the flow-divert
//! engine and a policy provider. It is pure: no state, no I/O.
//!
//! # Framing
//!
//! ```text
//! +------+-------------+----------------------------------+
//! | type | flow id (BE)| TLV records ...                  |
//! | u8   | u32         | (u8 type, u32 BE length, value)* |
//! +------+-------------+----------------------------------+
//! ```
//!
//! Flow id 0 is reserved for group-scoped messages that are not tied to a
//! flow (group initialisation, identity map updates, flow-state dumps).
//!
//! # Module Organization
//!
//! - `tlv`: record append / find / bounds-checked get
//! - `addr`: socket address images carried in address records
//! - `message`: tagged-union message type with one variant per message kind

#![forbid(unsafe_code)]

pub mod addr;
pub mod error;
pub mod message;
pub mod tlv;

pub use error::{Error, Result};
pub use message::{
    Close, Connect, ConnectResult, Data, FlowId, FlowStateSnapshot, FlowType, Frame, GroupInit,
    Header, How, IdentityMap, Message, MessageType, PropertiesUpdate, ReadNotify, Target,
    HEADER_LEN,
};
