//! flowdivert: Flow-Diversion Engine
//!
//! Intercepts application socket connections and routes their handshake and
//! data through a policy provider over a private control channel. The
//! provider authorizes, redirects or proxies each flow and answers with
//! connect results, data and close notifications.
//!
//! # Features
//!
//! - **Multi-tenant**: providers register as groups; each flow belongs to
//!   exactly one group at a time and can fail over to another.
//! - **Backpressure-aware**: a blocked control channel queues messages per
//!   group and releases them in order once it drains.
//! - **Half-close**: read and write directions close independently, locally
//!   and in the tunnel.
//! - **Identity policy**: a compressed trie of signing identities decides
//!   which applications a group accepts.
//! - **Tokens**: HMAC-signed tokens hand a flow to a new provider instance
//!   without repeating authorization.
//!
//! # Example
//!
//! ```rust
//! use flowdivert::testing::{MemorySocket, RecordingChannel};
//! use flowdivert::{ConnectOptions, Engine, EngineConfig, FlowPolicy, FlowRequest, GroupOwner, Registry};
//! use flowdivert_wire::{FlowType, Target};
//! use std::sync::Arc;
//!
//! let channel = Arc::new(RecordingChannel::new());
//! let engine = Engine::new(EngineConfig::default(), Arc::new(Registry::new()), channel.clone());
//! let unit = engine.attach_provider(GroupOwner::Kernel).unwrap();
//!
//! let socket = MemorySocket::new(FlowType::Stream);
//! let policy = FlowPolicy { control_unit: Some(unit), aggregate_mask: 0 };
//! let flow = engine.create_flow(Arc::downgrade(&socket), FlowRequest::new(FlowType::Stream, policy));
//!
//! // A group without an identity map or the no-app-map flag admits nobody.
//! let target = Target::Address("1.2.3.4:443".parse().unwrap());
//! assert!(engine.connect(&flow, target, ConnectOptions::default()).is_err());
//! ```
//!
//! # Module Organization
//!
//! - `engine`: orchestration of connect, data, close and provider messages
//! - `flow`: per-flow state, flags and buffers
//! - `group` / `registry`: provider groups and the table that owns them
//! - `trie`: signing-identity matching
//! - `auth`: HMAC signing and verification of tokens
//! - `channel` / `socket`: the two collaborator boundaries
//! - `testing`: in-memory channel and socket

#![forbid(unsafe_code)]

pub mod auth;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod group;
pub mod id;
pub mod observer;
pub mod registry;
pub mod socket;
pub mod testing;
pub mod trie;

pub use channel::{ChannelError, ControlChannel};
pub use config::EngineConfig;
pub use engine::{ConnectOptions, ConnectStatus, Engine};
pub use error::{Error, Result};
pub use flow::{AppIdentity, FlowFlags, FlowPolicy, FlowRecord, FlowRequest};
pub use group::ProviderGroup;
pub use observer::{EngineEvent, EngineObserver, NoopObserver};
pub use registry::{ControlUnit, GroupOwner, Registry};
pub use socket::DivertSocket;
