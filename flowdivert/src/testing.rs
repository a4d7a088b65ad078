//! In-memory channel and socket.
//!
//! [`RecordingChannel`] records every message it accepts and can be made to
//! block or fail. [`MemorySocket`] keeps its receive buffer and lifecycle
//! notifications in memory so they can be inspected.

use crate::channel::{ChannelError, ControlChannel};
use crate::registry::ControlUnit;
use crate::socket::DivertSocket;
use bytes::{Bytes, BytesMut};
use flowdivert_wire::{Frame, FlowType, Message};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Default)]
struct ChannelState {
    sent: Vec<(ControlUnit, Bytes)>,
    blocked: bool,
    capacity: Option<usize>,
    disconnected: bool,
}

/// Channel that records what it is given.
#[derive(Default)]
pub struct RecordingChannel {
    state: Mutex<ChannelState>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every send with `WouldBlock`, or accept everything again.
    pub fn set_blocked(&self, blocked: bool) {
        let mut state = self.state.lock();
        state.blocked = blocked;
        state.capacity = None;
    }

    /// Accept `n` more sends, then block.
    pub fn set_capacity(&self, n: usize) {
        let mut state = self.state.lock();
        state.blocked = false;
        state.capacity = Some(n);
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.state.lock().disconnected = disconnected;
    }

    pub fn sent(&self) -> Vec<(ControlUnit, Bytes)> {
        self.state.lock().sent.clone()
    }

    /// Decoded messages sent to `unit`, with their flow ids.
    pub fn messages_to(&self, unit: ControlUnit) -> Vec<(flowdivert_wire::FlowId, Message)> {
        self.sent()
            .into_iter()
            .filter(|(u, _)| *u == unit)
            .filter_map(|(_, raw)| {
                let frame = Frame::parse(raw).ok()?;
                Some((frame.flow_id(), frame.message().ok()?))
            })
            .collect()
    }

    pub fn clear(&self) {
        self.state.lock().sent.clear();
    }
}

impl ControlChannel for RecordingChannel {
    fn send(&self, unit: ControlUnit, message: Bytes) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.disconnected {
            return Err(ChannelError::Disconnected(unit));
        }
        if state.blocked {
            return Err(ChannelError::WouldBlock);
        }
        if let Some(capacity) = state.capacity.as_mut() {
            if *capacity == 0 {
                return Err(ChannelError::WouldBlock);
            }
            *capacity -= 1;
        }
        state.sent.push((unit, message));
        Ok(())
    }
}

/// Observable socket state.
#[derive(Debug, Default)]
pub struct SocketState {
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub recv_capacity: usize,
    pub received: Vec<(Bytes, Option<SocketAddr>)>,
    pub received_len: usize,
    pub connected: bool,
    /// Set once; the inner option is the error kind, if any.
    pub disconnected: Option<Option<io::ErrorKind>>,
    pub cant_send_more: bool,
    pub cant_recv_more: bool,
    pub direct_connect: Option<SocketAddr>,
    /// Writes handed over with a direct connect.
    pub direct_sent: Vec<(Bytes, Option<SocketAddr>)>,
    pub writer_wakeups: usize,
}

/// Socket kept entirely in memory.
pub struct MemorySocket {
    kind: FlowType,
    state: Mutex<SocketState>,
}

impl MemorySocket {
    pub fn new(kind: FlowType) -> Arc<Self> {
        Self::with_capacity(kind, 1 << 20)
    }

    pub fn with_capacity(kind: FlowType, recv_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state: Mutex::new(SocketState {
                recv_capacity,
                ..Default::default()
            }),
        })
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, SocketState> {
        self.state.lock()
    }

    /// Application read: drain up to `max` bytes of received data.
    pub fn read(&self, max: usize) -> Bytes {
        let mut state = self.state.lock();
        let mut out = BytesMut::new();
        while out.len() < max && !state.received.is_empty() {
            let want = max - out.len();
            let (data, _) = &mut state.received[0];
            if data.len() <= want {
                out.extend_from_slice(data);
                state.received.remove(0);
            } else {
                out.extend_from_slice(&data.split_to(want));
            }
        }
        state.received_len -= out.len();
        out.freeze()
    }

    pub fn received_bytes(&self) -> Bytes {
        let state = self.state.lock();
        let mut out = BytesMut::new();
        for (data, _) in &state.received {
            out.extend_from_slice(data);
        }
        out.freeze()
    }
}

impl DivertSocket for MemorySocket {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().local
    }

    fn set_local_addr(&self, addr: SocketAddr) {
        self.state.lock().local = Some(addr);
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.state.lock().remote
    }

    fn set_remote_addr(&self, addr: SocketAddr) {
        self.state.lock().remote = Some(addr);
    }

    fn deliver(&self, mut data: Bytes, from: Option<SocketAddr>) -> usize {
        let mut state = self.state.lock();
        let space = state.recv_capacity.saturating_sub(state.received_len);
        let n = match self.kind {
            FlowType::Stream => data.len().min(space),
            FlowType::Datagram if data.len() <= space => data.len(),
            FlowType::Datagram => 0,
        };
        if n == 0 {
            return 0;
        }
        data.truncate(n);
        state.received_len += n;
        state.received.push((data, from));
        n
    }

    fn on_connected(&self) {
        self.state.lock().connected = true;
    }

    fn on_disconnected(&self, error: Option<io::Error>) {
        let mut state = self.state.lock();
        if state.disconnected.is_none() {
            state.disconnected = Some(error.map(|e| e.kind()));
        }
    }

    fn cant_send_more(&self) {
        self.state.lock().cant_send_more = true;
    }

    fn cant_recv_more(&self) {
        self.state.lock().cant_recv_more = true;
    }

    fn connect_direct(
        &self,
        remote: SocketAddr,
        pending: Vec<(Bytes, Option<SocketAddr>)>,
    ) -> io::Result<()> {
        let mut state = self.state.lock();
        state.direct_connect = Some(remote);
        state.remote = Some(remote);
        state.direct_sent.extend(pending);
        Ok(())
    }

    fn wake_writer(&self) {
        self.state.lock().writer_wakeups += 1;
    }
}

/// Socket type that is never instantiated; gives `Weak::new()` a concrete type.
pub struct NullSocket;

impl DivertSocket for NullSocket {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
    fn set_local_addr(&self, _addr: SocketAddr) {}
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
    fn set_remote_addr(&self, _addr: SocketAddr) {}
    fn deliver(&self, _data: Bytes, _from: Option<SocketAddr>) -> usize {
        0
    }
    fn on_connected(&self) {}
    fn on_disconnected(&self, _error: Option<io::Error>) {}
    fn cant_send_more(&self) {}
    fn cant_recv_more(&self) {}
    fn connect_direct(
        &self,
        _remote: SocketAddr,
        _pending: Vec<(Bytes, Option<SocketAddr>)>,
    ) -> io::Result<()> {
        Ok(())
    }
}
