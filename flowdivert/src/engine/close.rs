//! Half-close bookkeeping.
//!
//! Each direction has two bits: the local half (`READ_CLOSED`,
//! `WRITE_CLOSED`) and whether the provider has been told or has told us
//! (`TUNNEL_RD_CLOSED`, `TUNNEL_WR_CLOSED`). A CLOSE goes out for a local
//! half that is closed but not yet tunnel-closed; the write half waits
//! until the send buffer is empty. With both tunnel halves closed the flow
//! is finished.

use super::Engine;
use crate::error::{Error, Result};
use crate::flow::{FlowFlags, FlowRecord, FlowState};
use crate::observer::EngineEvent;
use flowdivert_wire::{Close, How, Message};
use std::sync::Arc;
use tracing::{debug, warn};

impl Engine {
    /// Close one or both directions of the flow. Idempotent.
    pub fn shutdown(&self, flow: &Arc<FlowRecord>, how: How) -> Result<()> {
        let mut state = flow.lock();
        if state.finished || state.bypassed {
            return Ok(());
        }
        self.update_closed_state(&mut state, how, false);
        flow_log!(state, ?how, "local shutdown");
        self.settle(&mut state);
        Ok(())
    }

    /// The socket is going away. Buffered data is still flushed to the
    /// provider before the final CLOSE, without waiting for send credit.
    pub fn close(&self, flow: &Arc<FlowRecord>) {
        let mut state = flow.lock();
        if state.detached {
            return;
        }
        state.detached = true;
        if state.finished || state.bypassed {
            return;
        }
        self.update_closed_state(&mut state, How::Both, false);
        flow_log!(state, buffered = state.send_buf.len(), "flow detached");
        self.settle(&mut state);
    }

    fn settle(&self, state: &mut FlowState) {
        match self.current_group(state) {
            Some(group) => self.drain(state, &group),
            None => self.send_close_if_needed(state),
        }
    }

    /// Mark `how` closed locally, and in the tunnel too when the provider
    /// is the one closing.
    pub(super) fn update_closed_state(&self, state: &mut FlowState, how: How, tunnel: bool) {
        if how.includes_read() {
            state.flags.insert(FlowFlags::READ_CLOSED);
            if tunnel {
                state.flags.insert(FlowFlags::TUNNEL_RD_CLOSED);
            } else {
                state.recv_buf.clear();
            }
        }
        if how.includes_write() {
            state.flags.insert(FlowFlags::WRITE_CLOSED);
            if tunnel {
                state.flags.insert(FlowFlags::TUNNEL_WR_CLOSED);
                state.send_buf.clear();
            }
        }
    }

    /// Tell the provider about locally closed halves it does not know about
    /// yet, and finish the flow once both tunnel halves are closed.
    pub(super) fn send_close_if_needed(&self, state: &mut FlowState) {
        if state.finished {
            return;
        }
        let flags = state.flags;
        let read = flags.contains(FlowFlags::READ_CLOSED) && !flags.contains(FlowFlags::TUNNEL_RD_CLOSED);
        let write = flags.contains(FlowFlags::WRITE_CLOSED)
            && !flags.contains(FlowFlags::TUNNEL_WR_CLOSED);

        if !flags.contains(FlowFlags::CONNECT_STARTED) {
            // The provider never heard of this flow.
            if read {
                state.flags.insert(FlowFlags::TUNNEL_RD_CLOSED);
            }
            if write {
                state.flags.insert(FlowFlags::TUNNEL_WR_CLOSED);
                state.send_buf.clear();
            }
        } else {
            let write = write && state.send_buf.is_empty();
            let how = match (read, write) {
                (true, true) => Some(How::Both),
                (true, false) => Some(How::Read),
                (false, true) => Some(How::Write),
                (false, false) => None,
            };
            if let Some(how) = how {
                if let Some(group) = self.current_group(state) {
                    let close = Message::Close(Close { error_code: 0, how });
                    if let Err(e) = self.send_flow_control(state, &group, &close) {
                        warn!(flow_id = %state.id, error = %e, "close not sent");
                        self.terminate(state, Error::Reset);
                        return;
                    }
                    flow_log!(state, ?how, "close sent");
                }
                if how.includes_read() {
                    state.flags.insert(FlowFlags::TUNNEL_RD_CLOSED);
                }
                if how.includes_write() {
                    state.flags.insert(FlowFlags::TUNNEL_WR_CLOSED);
                }
            }
        }

        if state.flags.tunnel_closed() {
            self.finish(state, None);
        }
    }

    /// CLOSE from the provider. Its `how` names the provider's own half:
    /// a provider that stops reading ends our writes, one that stops
    /// writing ends our reads.
    pub(super) fn handle_close(&self, state: &mut FlowState, close: Close) {
        let local = match close.how {
            How::Read => How::Write,
            How::Write => How::Read,
            How::Both => How::Both,
        };
        flow_log!(state, how = ?close.how, code = close.error_code, "close received");
        self.update_closed_state(state, local, true);
        if let Some(socket) = state.socket() {
            if local.includes_write() {
                socket.cant_send_more();
            }
            if local.includes_read() {
                socket.cant_recv_more();
            }
        }

        let both = state
            .flags
            .contains(FlowFlags::READ_CLOSED | FlowFlags::WRITE_CLOSED);
        if close.error_code != 0 && both {
            self.finish(state, Some(Error::Refused(close.error_code)));
        } else {
            self.send_close_if_needed(state);
        }
    }

    /// Leave the group and report the end of the flow to the socket.
    pub(super) fn finish(&self, state: &mut FlowState, error: Option<Error>) {
        if state.finished {
            return;
        }
        if let Some(group) = self.current_group(state) {
            group.remove(state.id);
        }
        state.group = None;
        state.finished = true;
        state.send_buf.clear();
        match &error {
            Some(e) => flow_log!(state, error = %e, "flow finished"),
            None => flow_log!(state, "flow finished"),
        }
        if let Some(socket) = state.socket() {
            socket.on_disconnected(error.map(Into::into));
        } else {
            debug!(flow_id = %state.id, "socket gone before flow finished");
        }
        self.emit(EngineEvent::FlowClosed);
    }
}
