//! # Flow Records
//!
//! One [`FlowRecord`] per diverted socket. The record is shared through
//! `Arc`: the socket side holds one reference, the owning provider group
//! holds another while the flow is in its index, and in-flight message
//! handling holds transient ones. All mutable state sits behind the
//! record's own mutex.
//!
//! ## Lock order
//!
//! flow → socket, and flow → registry → group. Group and registry locks are
//! never held while a flow lock is taken; callers clone the `Arc`s they need
//! out of the group and release it first.

pub mod buffer;
pub mod flags;

pub use buffer::{DatagramChunk, Reassembled, RecvBuffer, SendBuffer};
pub use flags::FlowFlags;

use crate::config::EngineConfig;
use crate::registry::ControlUnit;
use crate::socket::DivertSocket;
use bytes::Bytes;
use flowdivert_wire::{FlowId, FlowStateSnapshot, FlowType};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

/// Where a flow may be diverted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowPolicy {
    /// Explicit provider unit.
    pub control_unit: Option<ControlUnit>,
    /// Candidate units for policy-chosen groups; bit `i` is unit `i + 1`.
    pub aggregate_mask: u32,
}

/// Code-signing attestation of the process that owns the socket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppIdentity {
    pub signing_id: Option<String>,
    pub cdhash: Option<Bytes>,
    pub audit_token: Option<Bytes>,
}

/// Everything needed to open a flow for a socket.
#[derive(Debug, Clone)]
pub struct FlowRequest {
    pub kind: FlowType,
    pub policy: FlowPolicy,
    /// Process that owns the socket; needed to reach in-process groups.
    pub owner_pid: Option<u32>,
    pub identity: AppIdentity,
    pub traffic_class: u32,
    pub out_if_index: Option<u32>,
    /// Content-filter correlation id.
    pub cfil_id: Option<[u8; 16]>,
}

impl FlowRequest {
    pub fn new(kind: FlowType, policy: FlowPolicy) -> Self {
        Self {
            kind,
            policy,
            owner_pid: None,
            identity: AppIdentity::default(),
            traffic_class: 0,
            out_if_index: None,
            cfil_id: None,
        }
    }
}

/// Mutable state of one flow.
pub struct FlowState {
    pub id: FlowId,
    pub kind: FlowType,
    /// Group the flow is currently a member of.
    pub group: Option<ControlUnit>,
    pub policy: FlowPolicy,
    /// The current group was picked from `policy.aggregate_mask`.
    pub via_aggregate: bool,
    pub owner_pid: Option<u32>,
    pub identity: AppIdentity,
    pub traffic_class: u32,
    pub out_if_index: Option<u32>,
    pub cfil_id: Option<[u8; 16]>,
    pub flags: FlowFlags,
    /// First successful CONNECT_RESULT seen.
    pub connected: bool,
    /// Fail-over ran out of candidates; the socket connected directly.
    pub bypassed: bool,
    /// The socket released the flow.
    pub detached: bool,
    /// Both tunnel halves are closed and the flow has left its group.
    pub finished: bool,
    pub bytes_written: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Send credit granted by the provider.
    pub send_window: u32,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    /// Remote endpoint originally requested, for direct fallback.
    pub original_remote: Option<SocketAddr>,
    pub app_data: Option<Bytes>,
    /// CONNECT body without header, re-framed on fail-over.
    pub connect_body: Option<Bytes>,
    /// Imported token, appended to the CONNECT body.
    pub token: Option<Bytes>,
    /// Verbosity requested by the group, syslog scale.
    pub log_level: u32,
    /// Bytes consumed by the application since the last READ_NOTIFY.
    pub consumed: u64,
    pub send_buf: SendBuffer,
    pub recv_buf: RecvBuffer,
    socket: Weak<dyn DivertSocket>,
}

impl FlowState {
    /// The socket, if it is still alive.
    pub fn socket(&self) -> Option<Arc<dyn DivertSocket>> {
        self.socket.upgrade()
    }

    /// Counters as reported in FLOW_STATES.
    pub fn snapshot(&self) -> FlowStateSnapshot {
        FlowStateSnapshot {
            flow_id: self.id,
            flags: self.flags.bits(),
            bytes_written: self.bytes_written,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            send_window: self.send_window,
        }
    }
}

/// A diverted flow.
pub struct FlowRecord {
    state: Mutex<FlowState>,
}

impl FlowRecord {
    pub fn new(
        socket: Weak<dyn DivertSocket>,
        request: FlowRequest,
        config: &EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FlowState {
                id: FlowId::GROUP,
                kind: request.kind,
                group: None,
                policy: request.policy,
                via_aggregate: false,
                owner_pid: request.owner_pid,
                identity: request.identity,
                traffic_class: request.traffic_class,
                out_if_index: request.out_if_index,
                cfil_id: request.cfil_id,
                flags: FlowFlags::empty(),
                connected: false,
                bypassed: false,
                detached: false,
                finished: false,
                bytes_written: 0,
                bytes_sent: 0,
                bytes_received: 0,
                send_window: 0,
                local_addr: None,
                remote_addr: None,
                original_remote: None,
                app_data: None,
                connect_body: None,
                token: None,
                log_level: 0,
                consumed: 0,
                send_buf: SendBuffer::new(config.send_buffer_limit),
                recv_buf: RecvBuffer::new(config.recv_pending_limit),
                socket,
            }),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock()
    }

    pub fn id(&self) -> FlowId {
        self.state.lock().id
    }

    pub fn flags(&self) -> FlowFlags {
        self.state.lock().flags
    }

    pub fn group(&self) -> Option<ControlUnit> {
        self.state.lock().group
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn send_window(&self) -> u32 {
        self.state.lock().send_window
    }

    pub fn app_data(&self) -> Option<Bytes> {
        self.state.lock().app_data.clone()
    }

    pub fn snapshot(&self) -> FlowStateSnapshot {
        self.state.lock().snapshot()
    }
}

impl fmt::Debug for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_lock() {
            Some(state) => f
                .debug_struct("FlowRecord")
                .field("id", &state.id)
                .field("group", &state.group)
                .field("flags", &state.flags)
                .finish(),
            None => f.debug_struct("FlowRecord").finish_non_exhaustive(),
        }
    }
}
