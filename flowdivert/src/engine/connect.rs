//! Flow creation, CONNECT and fail-over.
//!
//! A connect picks a group (explicit unit first, then the lowest-order
//! candidate from the aggregate mask), checks the caller's identity against
//! that group's map, reserves an id, and stores the CONNECT body unframed
//! so that fail-over can re-frame it for a different group or id.
//!
//! When a policy-chosen group rejects the flow, the next candidate is tried.
//! The sequence stops when a group accepts, when the freshly chosen unit is
//! the one that just rejected, or when no candidate is left; in the last
//! case diversion is abandoned and the socket connects directly.

use super::{frame, Engine};
use crate::error::{Error, Result};
use crate::flow::{FlowFlags, FlowRecord, FlowRequest, FlowState};
use crate::group::ProviderGroup;
use crate::id;
use crate::observer::EngineEvent;
use crate::socket::DivertSocket;
use bytes::{Bytes, BytesMut};
use flowdivert_wire::message::{CONNECT_FLAG_BOUND, CONNECT_FLAG_DATA_IDEMPOTENT};
use flowdivert_wire::{Connect, ConnectResult, Message, MessageType, Target};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Connect behaviour requested by the socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Hold the CONNECT until the first write.
    pub implicit: bool,
    /// Data sent with the connect may safely be replayed.
    pub idempotent_data: bool,
}

/// Where a successful [`Engine::connect`] left the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    /// CONNECT sent or queued; waiting for the provider's answer.
    InProgress,
    /// CONNECT stored; it goes out with the first write.
    Deferred,
}

impl Engine {
    /// Create the flow record for a socket that opts into diversion.
    pub fn create_flow<S: DivertSocket + 'static>(
        &self,
        socket: Weak<S>,
        request: FlowRequest,
    ) -> Arc<FlowRecord> {
        let socket: Weak<dyn DivertSocket> = socket;
        let flow = FlowRecord::new(socket, request, &self.config);
        self.emit(EngineEvent::FlowCreated);
        flow
    }

    /// Start diverting `flow` to `target`.
    pub fn connect(
        &self,
        flow: &Arc<FlowRecord>,
        target: Target,
        options: ConnectOptions,
    ) -> Result<ConnectStatus> {
        let mut state = flow.lock();
        if state.detached || state.finished || state.flags.contains(FlowFlags::WRITE_CLOSED) {
            return Err(Error::Closed);
        }
        if state.connect_body.is_some() || state.bypassed {
            return Err(Error::AlreadyConnected);
        }
        self.validate_target(&target)?;

        let group = self.derive_group(&mut state)?;
        self.check_identity(&state, &group)?;
        let flow_id = id::reserve(
            &self.ids,
            &self.registry,
            &group,
            flow,
            None,
            self.config.flow_id_attempts,
        )?;
        state.id = flow_id;
        state.group = Some(group.unit());
        state.log_level = group.log_level();
        if let Target::Address(remote) = target {
            state.original_remote = Some(remote);
            state.remote_addr = Some(remote);
        }

        let body = match self.build_connect_body(&state, &target, options) {
            Ok(body) => body,
            Err(e) => {
                group.remove(flow_id);
                state.group = None;
                return Err(e);
            }
        };
        state.connect_body = Some(body);

        if options.implicit {
            state.flags.insert(FlowFlags::IMPLICIT_CONNECT);
            flow_log!(state, unit = %group.unit(), "connect deferred to first write");
            return Ok(ConnectStatus::Deferred);
        }
        if let Err(e) = self.send_connect(&mut state, &group) {
            self.terminate(&mut state, Error::Reset);
            return Err(e);
        }
        Ok(ConnectStatus::InProgress)
    }

    fn validate_target(&self, target: &Target) -> Result<()> {
        match target {
            Target::Address(addr) if addr.ip().is_unspecified() || addr.port() == 0 => {
                Err(Error::InvalidDestination)
            }
            Target::Address(_) => Ok(()),
            Target::Host { name, port } => {
                if name.is_empty() || name.len() > self.config.max_name_size || *port == 0 {
                    Err(Error::InvalidDestination)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Pick the group for a new connect: the explicit unit if it is live,
    /// otherwise the best candidate from the aggregate mask.
    fn derive_group(&self, state: &mut FlowState) -> Result<Arc<ProviderGroup>> {
        if let Some(unit) = state.policy.control_unit {
            match self.registry.lookup(unit, state.owner_pid) {
                Some(group) if !group.is_defunct() => {
                    state.via_aggregate = false;
                    return Ok(group);
                }
                _ => debug!(%unit, "requested unit unavailable"),
            }
        }
        if state.policy.aggregate_mask != 0 {
            let pid = state.owner_pid;
            if let Some(group) = self
                .registry
                .select_candidate(&mut state.policy.aggregate_mask, pid)
            {
                state.via_aggregate = true;
                return Ok(group);
            }
        }
        Err(Error::NoProviderGroup)
    }

    /// Unless the group waives it or a verified token vouches for the flow,
    /// the caller's signing identity must be in the group's map.
    fn check_identity(&self, state: &FlowState, group: &ProviderGroup) -> Result<()> {
        if group.no_app_map() || state.flags.contains(FlowFlags::HAS_HMAC) {
            return Ok(());
        }
        let allowed = state
            .identity
            .signing_id
            .as_deref()
            .is_some_and(|id| group.identity_allowed(id.as_bytes()));
        if allowed {
            Ok(())
        } else {
            debug!(
                unit = %group.unit(),
                signing_id = ?state.identity.signing_id,
                "identity not in group map"
            );
            Err(Error::PermissionDenied)
        }
    }

    fn build_connect_body(
        &self,
        state: &FlowState,
        target: &Target,
        options: ConnectOptions,
    ) -> Result<Bytes> {
        let bound = state.socket().and_then(|s| s.local_addr());
        let mut flags = 0;
        if options.idempotent_data {
            flags |= CONNECT_FLAG_DATA_IDEMPOTENT;
        }
        if bound.is_some() {
            flags |= CONNECT_FLAG_BOUND;
        }
        let connect = Message::Connect(Connect {
            traffic_class: state.traffic_class,
            flow_type: state.kind,
            target: target.clone(),
            local_addr: bound,
            out_if_index: state.out_if_index,
            signing_id: state.identity.signing_id.clone(),
            cdhash: state.identity.cdhash.clone(),
            audit_token: state.identity.audit_token.clone(),
            flags,
            cfil_id: state.cfil_id,
            token: state.token.clone(),
        });
        let mut body = BytesMut::new();
        connect.encode_body(&mut body)?;
        Ok(body.freeze())
    }

    /// Frame the stored CONNECT with the flow's current id and send it.
    /// A hard channel failure takes the flow out of the group.
    pub(super) fn send_connect(&self, state: &mut FlowState, group: &ProviderGroup) -> Result<()> {
        let body = state.connect_body.clone().ok_or(Error::NotConnected)?;
        let raw = frame(MessageType::Connect, state.id, &body)?;
        if let Err(e) = self.send_group_control(group, raw) {
            warn!(flow_id = %state.id, unit = %group.unit(), error = %e, "connect not sent");
            group.remove(state.id);
            state.group = None;
            return Err(Error::Reset);
        }
        state.flags.insert(FlowFlags::CONNECT_STARTED);
        flow_log!(state, unit = %group.unit(), "connect sent");
        self.emit(EngineEvent::ConnectSent { unit: group.unit() });
        Ok(())
    }

    pub(super) fn handle_connect_result(
        &self,
        flow: &Arc<FlowRecord>,
        state: &mut FlowState,
        group: &Arc<ProviderGroup>,
        result: ConnectResult,
    ) -> Result<()> {
        if !state.flags.contains(FlowFlags::CONNECT_STARTED) || state.connected {
            debug!(flow_id = %state.id, "unexpected connect result ignored");
            return Ok(());
        }
        if result.error_code != 0 {
            self.emit(EngineEvent::ConnectRejected {
                unit: group.unit(),
                code: result.error_code,
            });
            flow_log!(state, unit = %group.unit(), code = result.error_code, "connect rejected");
            self.fail_over(flow, state, group, result.error_code);
            return Ok(());
        }

        state.flags.remove(FlowFlags::TRANSPARENT_FAILOVER);
        let mut home = group.clone();
        if let Some(unit) = result.control_unit.map(crate::registry::ControlUnit) {
            if unit != group.unit() {
                if let Some(new_home) = self.migrate(flow, state, group, unit) {
                    home = new_home;
                }
            }
        }

        let socket = state.socket();
        if let Some(local) = result.local_addr {
            if socket.as_ref().and_then(|s| s.local_addr()).is_none() {
                state.flags.insert(FlowFlags::DID_SET_LOCAL_ADDR);
            }
            state.local_addr = Some(local);
            if let Some(socket) = &socket {
                socket.set_local_addr(local);
            }
        }
        if let Some(remote) = result.remote_addr {
            state.remote_addr = Some(remote);
            if let Some(socket) = &socket {
                socket.set_remote_addr(remote);
            }
        }
        if let Some(index) = result.out_if_index {
            state.out_if_index = Some(index);
        }
        if let Some(app_data) = result.app_data {
            state.app_data = Some(app_data);
        }
        state.send_window = result.space_available.unwrap_or(0);
        state.connected = true;
        flow_log!(state, unit = %home.unit(), window = state.send_window, "flow connected");
        if let Some(socket) = &socket {
            socket.on_connected();
        }
        self.emit(EngineEvent::ConnectAccepted { unit: home.unit() });
        self.drain(state, &home);
        Ok(())
    }

    /// Move an accepted flow to the group the provider names as its home.
    /// Stays put if that group is unavailable or already uses the id.
    fn migrate(
        &self,
        flow: &Arc<FlowRecord>,
        state: &mut FlowState,
        from: &ProviderGroup,
        unit: crate::registry::ControlUnit,
    ) -> Option<Arc<ProviderGroup>> {
        let Some(to) = self.registry.lookup(unit, state.owner_pid) else {
            warn!(flow_id = %state.id, %unit, "connect result names unknown group");
            return None;
        };
        if let Err(e) = to.insert(state.id, flow.clone()) {
            warn!(flow_id = %state.id, %unit, error = %e, "cannot migrate flow");
            return None;
        }
        from.remove(state.id);
        state.group = Some(unit);
        state.log_level = to.log_level();
        info!(flow_id = %state.id, from = %from.unit(), to = %unit, "flow migrated");
        Some(to)
    }

    /// React to a rejection from `group`.
    fn fail_over(
        &self,
        flow: &Arc<FlowRecord>,
        state: &mut FlowState,
        group: &ProviderGroup,
        code: u32,
    ) {
        let current = group.unit();
        let has_alternates = state.via_aggregate || state.policy.aggregate_mask != 0;
        if !has_alternates || state.detached {
            self.terminate(state, Error::Refused(code));
            return;
        }

        group.remove(state.id);
        state.group = None;
        state.flags.remove(FlowFlags::CONNECT_STARTED);
        state.flags.insert(FlowFlags::TRANSPARENT_FAILOVER);

        let pid = state.owner_pid;
        loop {
            let Some(next) = self
                .registry
                .select_candidate(&mut state.policy.aggregate_mask, pid)
            else {
                self.fall_back(state, code);
                return;
            };
            if next.unit() == current {
                warn!(flow_id = %state.id, unit = %current, "fail-over picked the rejecting group, aborting");
                self.terminate(state, Error::Refused(code));
                return;
            }
            if let Err(e) = self.check_identity(state, &next) {
                debug!(flow_id = %state.id, unit = %next.unit(), error = %e, "skipping candidate");
                continue;
            }
            let preferred = Some(state.id);
            let flow_id = match id::reserve(
                &self.ids,
                &self.registry,
                &next,
                flow,
                preferred,
                self.config.flow_id_attempts,
            ) {
                Ok(flow_id) => flow_id,
                Err(e) => {
                    debug!(flow_id = %state.id, unit = %next.unit(), error = %e, "skipping candidate");
                    continue;
                }
            };
            state.id = flow_id;
            state.group = Some(next.unit());
            state.log_level = next.log_level();
            if self.send_connect(state, &next).is_err() {
                continue;
            }
            info!(flow_id = %state.id, from = %current, to = %next.unit(), "flow failed over");
            self.emit(EngineEvent::FailOver {
                from: current,
                to: next.unit(),
            });
            return;
        }
    }

    /// No provider will take the flow: stop diverting and connect directly.
    fn fall_back(&self, state: &mut FlowState, code: u32) {
        let Some(remote) = state.original_remote else {
            self.terminate(state, Error::Refused(code));
            return;
        };
        state.bypassed = true;
        state.finished = true;
        state.flags.remove(FlowFlags::TRANSPARENT_FAILOVER);
        let pending = state.send_buf.take_all();
        info!(
            flow_id = %state.id,
            %remote,
            pending = pending.len(),
            "diversion disabled, connecting directly"
        );
        self.emit(EngineEvent::Fallback);
        if let Some(socket) = state.socket() {
            if let Err(e) = socket.connect_direct(remote, pending) {
                socket.on_disconnected(Some(e));
            }
        }
    }
}
