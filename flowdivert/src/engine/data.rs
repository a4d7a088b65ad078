//! Data path.
//!
//! Outbound: application writes land in the flow's send buffer and leave it
//! in `chunk_size` pieces as the provider's send window allows. A blocked
//! group leaves the data where it is; [`Engine::on_drained`] drains again.
//!
//! Inbound: provider data goes straight to the socket when it fits. The
//! rest is held on the flow and flushed by [`Engine::received`] as the
//! application reads, after which the provider gets one READ_NOTIFY.

use super::Engine;
use crate::error::{Error, Result};
use crate::flow::{FlowFlags, FlowRecord, FlowState, Reassembled};
use crate::group::{DataSend, ProviderGroup};
use crate::observer::EngineEvent;
use crate::socket::DivertSocket;
use bytes::Bytes;
use flowdivert_wire::{Data, FlowType, Message, ReadNotify};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

impl Engine {
    /// Queue application data for the provider.
    ///
    /// Returns the number of bytes accepted. Stream writes may be accepted
    /// partially; a datagram is accepted whole or refused. `to` is only
    /// meaningful for datagram flows.
    pub fn send(
        &self,
        flow: &Arc<FlowRecord>,
        data: Bytes,
        to: Option<SocketAddr>,
    ) -> Result<usize> {
        let mut state = flow.lock();
        if state.bypassed {
            return Err(Error::NotConnected);
        }
        if state.finished || state.detached || state.flags.contains(FlowFlags::WRITE_CLOSED) {
            return Err(Error::Closed);
        }
        let started = state.flags.contains(FlowFlags::CONNECT_STARTED);
        let deferred = !started && state.flags.contains(FlowFlags::IMPLICIT_CONNECT);
        if !started && !deferred {
            return Err(Error::NotConnected);
        }
        let group = self.current_group(&state).ok_or(Error::NoProviderGroup)?;

        if deferred {
            if let Err(e) = self.send_connect(&mut state, &group) {
                self.terminate(&mut state, Error::Reset);
                return Err(e);
            }
        }

        let accepted = match state.kind {
            FlowType::Stream => state.send_buf.push_stream(data)?,
            FlowType::Datagram => state.send_buf.push_datagram(data, to)?,
        };
        state.bytes_written += accepted as u64;
        trace!(flow_id = %state.id, accepted, buffered = state.send_buf.len(), "application write");
        self.drain(&mut state, &group);
        Ok(accepted)
    }

    /// Release buffered data within the send window, then send any CLOSE
    /// that was waiting for the buffer to empty.
    pub(super) fn drain(&self, state: &mut FlowState, group: &ProviderGroup) {
        self.drain_data(state, group);
        if !state.finished {
            self.send_close_if_needed(state);
        }
    }

    fn drain_data(&self, state: &mut FlowState, group: &ProviderGroup) {
        if state.finished
            || !state.connected
            || !state.flags.contains(FlowFlags::CONNECT_STARTED)
            || state.flags.contains(FlowFlags::TUNNEL_WR_CLOSED)
        {
            return;
        }
        // A detached flow has no writer left to wait for credit; flush it all.
        let force = state.detached;
        let mut sent = 0usize;

        while !state.send_buf.is_empty() {
            let window = if force {
                usize::MAX
            } else {
                state.send_window as usize
            };
            let max = window.min(self.config.chunk_size);
            if max == 0 {
                trace!(flow_id = %state.id, buffered = state.send_buf.len(), "send window closed");
                break;
            }

            let outcome = match state.kind {
                FlowType::Stream => {
                    let chunk = state.send_buf.take_stream(max);
                    let len = chunk.len();
                    let result = self.send_data_chunk(state, group, Data::stream(chunk.clone()));
                    if matches!(result, Ok(DataSend::Blocked)) {
                        state.send_buf.unget_stream(chunk);
                    }
                    result.map(|outcome| (outcome, len))
                }
                FlowType::Datagram => {
                    let Some(chunk) = state.send_buf.peek_datagram_chunk(max) else {
                        break;
                    };
                    let len = chunk.payload.len();
                    let data = Data {
                        remote_addr: chunk.to,
                        local_addr: None,
                        datagram_size: chunk.datagram_size,
                        fragment: chunk.fragment,
                        payload: chunk.payload,
                    };
                    let result = self.send_data_chunk(state, group, data);
                    if matches!(result, Ok(DataSend::Sent)) {
                        state.send_buf.consume_datagram(len);
                    }
                    result.map(|outcome| (outcome, len))
                }
            };

            match outcome {
                Ok((DataSend::Sent, len)) => {
                    sent += len;
                    state.bytes_sent += len as u64;
                    state.send_window = state.send_window.saturating_sub(len as u32);
                    self.emit(EngineEvent::BytesToProvider(len));
                }
                Ok((DataSend::Blocked, _)) => {
                    debug!(flow_id = %state.id, unit = %group.unit(), "group blocked, holding data");
                    break;
                }
                Err(e) => {
                    warn!(flow_id = %state.id, unit = %group.unit(), error = %e, "data send failed");
                    self.terminate(state, Error::Reset);
                    return;
                }
            }
        }

        if sent > 0 {
            trace!(flow_id = %state.id, sent, window = state.send_window, "drained");
            if let Some(socket) = state.socket() {
                socket.wake_writer();
            }
        }
    }

    fn send_data_chunk(
        &self,
        state: &FlowState,
        group: &ProviderGroup,
        data: Data,
    ) -> Result<DataSend> {
        let raw = Message::Data(data).encode(state.id)?;
        Ok(group.send_data(&*self.channel, raw)?)
    }

    pub(super) fn handle_data(
        &self,
        state: &mut FlowState,
        _group: &Arc<ProviderGroup>,
        data: Data,
    ) -> Result<()> {
        if state.flags.contains(FlowFlags::READ_CLOSED) || !state.connected {
            debug!(flow_id = %state.id, bytes = data.payload.len(), "data after read close, dropped");
            return Ok(());
        }
        let Some(socket) = state.socket() else {
            return Ok(());
        };

        match state.kind {
            FlowType::Stream => {
                self.account_inbound(state, data.payload.len());
                self.deliver_or_hold(state, &*socket, data.payload, None)
            }
            FlowType::Datagram => {
                let data = data.into_datagram().map_err(|e| {
                    warn!(flow_id = %state.id, error = %e, "malformed datagram header");
                    e
                })?;
                if let Some(local) = data.local_addr {
                    if socket.local_addr().is_none() {
                        socket.set_local_addr(local);
                        state.local_addr = Some(local);
                        state.flags.insert(FlowFlags::DID_SET_LOCAL_ADDR);
                    }
                }
                self.account_inbound(state, data.payload.len());
                let reassembled = state.recv_buf.reassemble(
                    data.payload,
                    data.remote_addr,
                    data.datagram_size,
                    data.fragment,
                    self.config.recv_pending_limit,
                );
                match reassembled {
                    Reassembled::Complete(datagram, from) => {
                        let from = from.or(state.remote_addr);
                        self.deliver_or_hold(state, &*socket, datagram, from)
                    }
                    Reassembled::Partial => Ok(()),
                    Reassembled::Dropped(reason) => {
                        warn!(flow_id = %state.id, reason, "datagram dropped");
                        Ok(())
                    }
                }
            }
        }
    }

    fn account_inbound(&self, state: &mut FlowState, len: usize) {
        state.bytes_received += len as u64;
        self.emit(EngineEvent::BytesFromProvider(len));
    }

    /// Hand data to the socket, holding what it cannot take. Data already
    /// held goes first, so new data queues behind it.
    fn deliver_or_hold(
        &self,
        state: &mut FlowState,
        socket: &dyn DivertSocket,
        data: Bytes,
        from: Option<SocketAddr>,
    ) -> Result<()> {
        let rest = if state.recv_buf.is_empty() {
            let taken = socket.deliver(data.clone(), from);
            match state.kind {
                _ if taken >= data.len() => return Ok(()),
                FlowType::Stream => data.slice(taken..),
                FlowType::Datagram => data,
            }
        } else {
            data
        };

        if let Err(e) = state.recv_buf.hold(rest, from) {
            warn!(
                flow_id = %state.id,
                held = state.recv_buf.len(),
                error = %e,
                "receive backlog over limit, resetting flow"
            );
            self.terminate(state, Error::Reset);
            return Err(Error::Reset);
        }
        state.flags.insert(FlowFlags::NOTIFY_ON_RECEIVED);
        trace!(flow_id = %state.id, held = state.recv_buf.len(), "socket full, holding data");
        Ok(())
    }

    /// The application consumed `consumed` bytes from the socket.
    ///
    /// Moves held provider data into the freed space. Once nothing is held,
    /// tells the provider how much was consumed with a single READ_NOTIFY.
    pub fn received(&self, flow: &Arc<FlowRecord>, consumed: usize) -> Result<()> {
        let mut state = flow.lock();
        state.consumed = state.consumed.saturating_add(consumed as u64);
        if let Some(socket) = state.socket() {
            flush_held(&mut state, &*socket);
        }
        if state.finished
            || !state.flags.contains(FlowFlags::NOTIFY_ON_RECEIVED)
            || !state.recv_buf.is_empty()
            || state.consumed == 0
        {
            return Ok(());
        }
        let Some(group) = self.current_group(&state) else {
            return Ok(());
        };
        let read_count = u32::try_from(state.consumed).unwrap_or(u32::MAX);
        let notify = Message::ReadNotify(ReadNotify { read_count });
        if let Err(e) = self.send_flow_control(&state, &group, &notify) {
            warn!(flow_id = %state.id, error = %e, "read notify not sent");
            self.terminate(&mut state, Error::Reset);
            return Err(Error::Reset);
        }
        flow_log!(state, read_count, "read notify sent");
        state.consumed = 0;
        state.flags.remove(FlowFlags::NOTIFY_ON_RECEIVED);
        Ok(())
    }
}

fn flush_held(state: &mut FlowState, socket: &dyn DivertSocket) {
    while let Some((data, from)) = state.recv_buf.front().cloned() {
        let taken = socket.deliver(data.clone(), from);
        if taken >= data.len() {
            state.recv_buf.pop_front();
            continue;
        }
        if state.kind == FlowType::Stream && taken > 0 {
            state.recv_buf.advance_front(taken);
        }
        break;
    }
}
