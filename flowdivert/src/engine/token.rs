//! Flow tokens.
//!
//! A token lets a flow be handed to another provider instance without
//! repeating authorization. It is a TLV buffer signed with the secret of
//! the group named by its KEY_UNIT (or CTL_UNIT when there is none); the
//! HMAC record comes last. An imported token travels verbatim at the end
//! of the flow's CONNECT.

use super::Engine;
use crate::auth::{self, AuthError};
use crate::error::{Error, Result};
use crate::flow::{FlowFlags, FlowRecord};
use crate::registry::ControlUnit;
use bytes::{Bytes, BytesMut};
use flowdivert_wire::tlv::{self, types};
use std::sync::Arc;
use tracing::{debug, warn};

impl Engine {
    /// Describe the flow's current group, app data and id in a token signed
    /// with that group's secret.
    pub fn export_token(&self, flow: &Arc<FlowRecord>) -> Result<Bytes> {
        let state = flow.lock();
        let group = self.current_group(&state).ok_or(Error::NoProviderGroup)?;
        let key = group.secret().ok_or(AuthError::NotSupported)?;

        let mut buf = BytesMut::new();
        tlv::append_u32(&mut buf, types::CTL_UNIT, group.unit().0)?;
        if state.policy.aggregate_mask != 0 {
            tlv::append_u32(&mut buf, types::AGGREGATE_UNIT, state.policy.aggregate_mask)?;
        }
        if let Some(app_data) = &state.app_data {
            tlv::append(&mut buf, types::APP_DATA, app_data)?;
        }
        tlv::append_u32(&mut buf, types::LOG_LEVEL, state.log_level)?;
        if !state.id.is_group() {
            tlv::append_u32(&mut buf, types::FLOW_ID, state.id.0)?;
        }
        auth::sign(&mut buf, &key)?;
        flow_log!(state, unit = %group.unit(), len = buf.len(), "token exported");
        Ok(buf.freeze())
    }

    /// Attach a token to a flow that has not connected yet.
    ///
    /// The token's HMAC is checked against the secret of the group that
    /// signed it. Any failure is `NotAuthorized`; the only exception is a
    /// token whose group has no secret, which is accepted unverified when
    /// `require_token_hmac` is off.
    pub fn import_token(&self, flow: &Arc<FlowRecord>, token: Bytes) -> Result<()> {
        let mut state = flow.lock();
        if state.finished || state.detached {
            return Err(Error::Closed);
        }
        if state.connect_body.is_some() || state.flags.contains(FlowFlags::CONNECT_STARTED) {
            return Err(Error::AlreadyConnected);
        }

        let (first, _) = tlv::value_at(&token, 0).map_err(|e| {
            debug!(error = %e, "token unreadable");
            Error::NotAuthorized
        })?;
        if first != types::CTL_UNIT && first != types::KEY_UNIT {
            debug!(first, "token does not start with a unit record");
            return Err(Error::NotAuthorized);
        }
        let ctl_unit = optional_u32(&token, types::CTL_UNIT)?;
        let key_unit = optional_u32(&token, types::KEY_UNIT)?
            .or(ctl_unit)
            .ok_or(Error::NotAuthorized)?;
        let aggregate = optional_u32(&token, types::AGGREGATE_UNIT)?;
        let log_level = optional_u32(&token, types::LOG_LEVEL)?;
        let app_data = match tlv::get_slice(&token, 0, types::APP_DATA) {
            Ok(value) => Some(Bytes::copy_from_slice(value)),
            Err(flowdivert_wire::Error::MissingField(_)) => None,
            Err(_) => return Err(Error::NotAuthorized),
        };

        let key = self
            .registry
            .lookup(ControlUnit(key_unit), state.owner_pid)
            .and_then(|group| group.secret());
        let mut unsigned = BytesMut::from(&token[..]);
        let verified = match auth::verify(&mut unsigned, key.as_deref()) {
            Ok(()) => true,
            Err(AuthError::NotSupported) if !self.config.require_token_hmac => {
                warn!(key_unit, "token accepted without verification");
                false
            }
            Err(e) => {
                warn!(key_unit, error = %e, "token rejected");
                return Err(Error::NotAuthorized);
            }
        };

        state.flags.insert(FlowFlags::HAS_TOKEN);
        if verified {
            state.flags.insert(FlowFlags::HAS_HMAC);
        }
        if let Some(unit) = ctl_unit.filter(|u| *u != 0) {
            state.policy.control_unit = Some(ControlUnit(unit));
        }
        if let Some(mask) = aggregate {
            state.policy.aggregate_mask = mask;
        }
        if let Some(level) = log_level {
            state.log_level = level;
        }
        if app_data.is_some() {
            state.app_data = app_data;
        }
        state.token = Some(token);
        flow_log!(state, key_unit, verified, "token imported");
        Ok(())
    }
}

fn optional_u32(token: &[u8], ty: u8) -> Result<Option<u32>> {
    match tlv::get_u32(token, 0, ty) {
        Ok(value) => Ok(Some(value)),
        Err(flowdivert_wire::Error::MissingField(_)) => Ok(None),
        Err(_) => Err(Error::NotAuthorized),
    }
}
