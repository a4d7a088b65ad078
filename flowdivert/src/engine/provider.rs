//! Group-scoped messages and per-flow property updates.

use super::{frame, Engine};
use crate::error::{Error, Result};
use crate::flow::FlowState;
use crate::group::ProviderGroup;
use crate::trie::Trie;
use bytes::BytesMut;
use flowdivert_wire::{FlowId, GroupInit, IdentityMap, Message, MessageType, PropertiesUpdate};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Engine {
    pub(super) fn handle_group_message(
        &self,
        group: &Arc<ProviderGroup>,
        message: Message,
    ) -> Result<()> {
        match message {
            Message::GroupInit(init) => self.handle_group_init(group, init),
            Message::AppMapCreate(map) => self.handle_app_map(group, map),
            Message::FlowStatesRequest => self.send_flow_states(group),
            other => {
                warn!(unit = %group.unit(), kind = ?other.kind(), "unexpected group message");
                Ok(())
            }
        }
    }

    /// Settings are applied only after every field has been checked.
    fn handle_group_init(&self, group: &ProviderGroup, init: GroupInit) -> Result<()> {
        if let Some(key) = &init.key {
            if key.len() > self.config.max_key_size {
                warn!(
                    unit = %group.unit(),
                    len = key.len(),
                    max = self.config.max_key_size,
                    "group key too large"
                );
                return Err(Error::MessageTooLarge);
            }
        }
        if let Some(key) = init.key {
            group.set_secret(key);
        }
        if let Some(flags) = init.flags {
            group.set_flags(flags);
        }
        if let Some(order) = init.order {
            group.set_order(order);
        }
        if let Some(level) = init.log_level {
            group.set_log_level(level);
        }
        info!(
            unit = %group.unit(),
            has_key = group.secret().is_some(),
            order = group.order(),
            flags = group.flags(),
            log_level = group.log_level(),
            "group initialized"
        );
        Ok(())
    }

    /// Rebuild the identity trie. A map that does not fit the memory budget
    /// leaves the current trie installed.
    fn handle_app_map(&self, group: &ProviderGroup, map: IdentityMap) -> Result<()> {
        let count = map.signing_ids.len();
        let trie = Trie::build(
            map.signing_ids.iter(),
            map.prefix_count as usize,
            self.config.max_trie_memory,
        )
        .map_err(|e| {
            warn!(unit = %group.unit(), identities = count, error = %e, "identity map rejected");
            Error::Trie(e)
        })?;
        info!(unit = %group.unit(), identities = count, nodes = trie.node_count(), "identity map installed");
        group.install_trie(trie);
        Ok(())
    }

    fn send_flow_states(&self, group: &ProviderGroup) -> Result<()> {
        let snapshots: Vec<_> = group.flows().iter().map(|flow| flow.snapshot()).collect();
        debug!(unit = %group.unit(), flows = snapshots.len(), "reporting flow states");
        let mut body = BytesMut::new();
        Message::FlowStates(snapshots).encode_body(&mut body)?;
        let raw = frame(MessageType::FlowStates, FlowId::GROUP, &body)?;
        self.send_group_control(group, raw)
    }

    pub(super) fn handle_properties_update(&self, state: &mut FlowState, update: PropertiesUpdate) {
        if let Some(index) = update.out_if_index {
            state.out_if_index = Some(index);
        }
        if let Some(app_data) = update.app_data {
            state.app_data = Some(app_data);
        }
        flow_log!(state, out_if_index = ?state.out_if_index, "properties updated");
    }
}
