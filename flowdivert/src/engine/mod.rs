//! # Flow Engine
//!
//! Orchestrates flows between application sockets and provider groups.
//!
//! ## Inputs
//!
//! - **Socket side**: [`Engine::connect`], [`Engine::send`],
//!   [`Engine::received`], [`Engine::shutdown`], [`Engine::close`], token
//!   export/import.
//! - **Channel side**: [`Engine::handle_message`] for inbound provider
//!   traffic, [`Engine::on_drained`] when a blocked channel has room again,
//!   [`Engine::attach_provider`] / [`Engine::detach_provider`] for group
//!   lifecycle.
//!
//! ## Message Dispatch
//!
//! Inbound frames are routed by the delivering unit and the header's flow
//! id. Flow id 0 goes to the group handlers (init, identity map, flow-state
//! dump); anything else is looked up in that group, locked, and matched on
//! its [`Message`] variant.
//!
//! ## Sub-modules
//!
//! - `connect`: flow creation, CONNECT, CONNECT_RESULT, fail-over
//! - `data`: send window, chunking, inbound data and receive backpressure
//! - `close`: half-close bookkeeping and CLOSE messages
//! - `provider`: group-scoped messages and per-flow property updates
//! - `token`: token export and import

macro_rules! flow_log {
    ($state:expr, $($arg:tt)+) => {
        if $state.log_level >= $crate::group::LOG_LEVEL_INFO {
            tracing::info!(flow_id = %$state.id, $($arg)+)
        } else {
            tracing::debug!(flow_id = %$state.id, $($arg)+)
        }
    };
}

mod close;
mod connect;
mod data;
mod provider;
mod token;


pub use connect::{ConnectOptions, ConnectStatus};

use crate::channel::ControlChannel;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::flow::{FlowFlags, FlowState};
use crate::group::ProviderGroup;
use crate::id::FlowIdGenerator;
use crate::observer::{EngineEvent, EngineObserver, NoopObserver};
use crate::registry::{ControlUnit, GroupOwner, Registry};
use bytes::{Bytes, BytesMut};
use flowdivert_wire::{
    Close, FlowId, Frame, Header, How, Message, MessageType,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The flow-divert engine.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<Registry>,
    channel: Arc<dyn ControlChannel>,
    observer: Arc<dyn EngineObserver>,
    ids: FlowIdGenerator,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<Registry>,
        channel: Arc<dyn ControlChannel>,
    ) -> Self {
        Self {
            config,
            registry,
            channel,
            observer: Arc::new(NoopObserver),
            ids: FlowIdGenerator::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn EngineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_id_generator(mut self, ids: FlowIdGenerator) -> Self {
        self.ids = ids;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Register a new provider and return its unit.
    pub fn attach_provider(&self, owner: GroupOwner) -> Result<ControlUnit> {
        let group = self.registry.create_group(owner)?;
        self.emit(EngineEvent::GroupAttached { unit: group.unit() });
        Ok(group.unit())
    }

    /// The provider for `unit` is gone: reset every member flow and free
    /// the group.
    pub fn detach_provider(&self, unit: ControlUnit) {
        match self.registry.remove(unit) {
            Some(group) => self.reset_group(&group),
            None => debug!(%unit, "detach for unknown unit"),
        }
    }

    /// Detach every provider at once.
    pub fn detach_all(&self) {
        let groups = self.registry.shutdown();
        info!(groups = groups.len(), "detaching all providers");
        for group in groups {
            self.reset_group(&group);
        }
    }

    fn reset_group(&self, group: &ProviderGroup) {
        let unit = group.unit();
        let flows = group.mark_defunct();
        info!(%unit, flows = flows.len(), "provider detached, resetting flows");
        for flow in flows {
            let mut state = flow.lock();
            if state.group != Some(unit) {
                continue;
            }
            state.group = None;
            self.update_closed_state(&mut state, How::Both, true);
            self.terminate(&mut state, Error::Reset);
        }
        self.emit(EngineEvent::GroupDetached { unit });
    }

    /// The channel for `unit` can take messages again.
    ///
    /// Flushes the group's queue in order, then lets every member flow
    /// drain its send buffer.
    pub fn on_drained(&self, unit: ControlUnit) {
        let Some(group) = self.registry.get(unit) else {
            return;
        };
        match group.flush(&*self.channel) {
            Ok(true) => {}
            Ok(false) => {
                debug!(%unit, queued = group.queued(), "channel blocked again during flush");
                return;
            }
            Err(e) => {
                warn!(%unit, error = %e, "flush failed");
                return;
            }
        }
        self.emit(EngineEvent::BackpressureDrained { unit });
        for flow in group.flows() {
            let mut state = flow.lock();
            if state.group == Some(unit) && !state.finished {
                self.drain(&mut state, &group);
            }
        }
    }

    /// Handle one message delivered by the provider on `unit`.
    ///
    /// A malformed message is rejected whole and changes nothing.
    pub fn handle_message(&self, unit: ControlUnit, raw: Bytes) -> Result<()> {
        let group = self.registry.get(unit).ok_or(Error::NoProviderGroup)?;
        let frame = Frame::parse(raw).map_err(|e| {
            warn!(%unit, error = %e, "dropping malformed message");
            e
        })?;

        let flow_id = frame.flow_id();
        if flow_id.is_group() {
            let message = frame.message().map_err(|e| {
                warn!(%unit, error = %e, "dropping malformed group message");
                e
            })?;
            return self.handle_group_message(&group, message);
        }

        let flow = group.lookup(flow_id).ok_or_else(|| {
            debug!(%unit, %flow_id, kind = ?frame.header.kind, "message for unknown flow");
            Error::UnknownFlow(flow_id)
        })?;
        let message = frame.message().map_err(|e| {
            warn!(%unit, %flow_id, error = %e, "dropping malformed message");
            e
        })?;

        let mut state = flow.lock();
        // The flow may have moved or finished between lookup and lock.
        if state.group != Some(unit) || state.id != flow_id {
            return Err(Error::UnknownFlow(flow_id));
        }
        match message {
            Message::ConnectResult(result) => {
                self.handle_connect_result(&flow, &mut state, &group, result)
            }
            Message::Data(data) => self.handle_data(&mut state, &group, data),
            Message::Close(close) => {
                self.handle_close(&mut state, close);
                Ok(())
            }
            Message::ReadNotify(notify) => {
                state.send_window = state.send_window.saturating_add(notify.read_count);
                self.drain(&mut state, &group);
                Ok(())
            }
            Message::PropertiesUpdate(update) => {
                self.handle_properties_update(&mut state, update);
                Ok(())
            }
            other => {
                warn!(%unit, %flow_id, kind = ?other.kind(), "unexpected message on flow");
                Ok(())
            }
        }
    }

    fn emit(&self, event: EngineEvent) {
        self.observer.on_event(event);
    }

    fn current_group(&self, state: &FlowState) -> Option<Arc<ProviderGroup>> {
        state.group.and_then(|unit| self.registry.get(unit))
    }

    /// Frame and send a control message for this flow on `group`.
    fn send_flow_control(
        &self,
        state: &FlowState,
        group: &ProviderGroup,
        message: &Message,
    ) -> Result<()> {
        let raw = message.encode(state.id)?;
        self.send_group_control(group, raw)
    }

    fn send_group_control(&self, group: &ProviderGroup, raw: Bytes) -> Result<()> {
        if group.send_control(&*self.channel, raw)? {
            self.emit(EngineEvent::BackpressureEngaged { unit: group.unit() });
        }
        Ok(())
    }

    /// Tear the flow down with `error`, telling the provider if it had
    /// accepted the flow.
    fn terminate(&self, state: &mut FlowState, error: Error) {
        if state.finished {
            return;
        }
        if let Some(group) = self.current_group(state) {
            if state.connected && !state.flags.tunnel_closed() {
                let close = Message::Close(Close {
                    error_code: error.wire_code(),
                    how: How::Both,
                });
                if let Err(e) = self.send_flow_control(state, &group, &close) {
                    debug!(flow_id = %state.id, error = %e, "close on reset not sent");
                }
            }
            group.remove(state.id);
        }
        state.group = None;
        state.flags.insert(
            FlowFlags::READ_CLOSED
                | FlowFlags::WRITE_CLOSED
                | FlowFlags::TUNNEL_RD_CLOSED
                | FlowFlags::TUNNEL_WR_CLOSED,
        );
        state.send_buf.clear();
        state.recv_buf.clear();
        state.finished = true;
        flow_log!(state, error = %error, "flow terminated");
        if let Some(socket) = state.socket() {
            socket.on_disconnected(Some(error.into()));
        }
        self.emit(EngineEvent::FlowClosed);
    }
}

/// Header plus an already-encoded body.
fn frame(kind: MessageType, flow_id: FlowId, body: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(flowdivert_wire::HEADER_LEN + body.len());
    Header { kind, flow_id }.encode(&mut buf)?;
    buf.extend_from_slice(body);
    Ok(buf.freeze())
}
