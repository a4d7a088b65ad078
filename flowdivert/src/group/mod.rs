//! # Provider Groups
//!
//! A group is one provider's multiplexed channel context: the flows routed
//! to it, the secret it signs tokens with, its identity map, and the queue
//! of control messages waiting out backpressure.
//!
//! One reader/writer lock covers all of it. Lookups take the read side;
//! insert, remove, trie rebuild and secret changes take the write side.
//! No flow lock is ever taken while this lock is held.

mod backpressure;

pub use backpressure::DataSend;

use crate::error::{Error, Result};
use crate::flow::FlowRecord;
use crate::registry::{ControlUnit, GroupOwner};
use crate::trie::Trie;
use bytes::Bytes;
use flowdivert_wire::message::GROUP_FLAG_NO_APP_MAP;
use flowdivert_wire::FlowId;
use parking_lot::RwLock;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Syslog-style level at which per-flow diagnostics are logged at `info`.
pub const LOG_LEVEL_INFO: u32 = 6;

struct GroupInner {
    flows: BTreeMap<FlowId, Arc<FlowRecord>>,
    secret: Option<Bytes>,
    trie: Trie,
    send_queue: VecDeque<Bytes>,
    blocked: bool,
    order: u32,
    flags: u32,
    log_level: u32,
    defunct: bool,
}

pub struct ProviderGroup {
    unit: ControlUnit,
    owner: GroupOwner,
    inner: RwLock<GroupInner>,
}

impl ProviderGroup {
    pub fn new(unit: ControlUnit, owner: GroupOwner) -> Arc<Self> {
        Arc::new(Self {
            unit,
            owner,
            inner: RwLock::new(GroupInner {
                flows: BTreeMap::new(),
                secret: None,
                trie: Trie::empty(),
                send_queue: VecDeque::new(),
                blocked: false,
                order: u32::MAX,
                flags: 0,
                log_level: 0,
                defunct: false,
            }),
        })
    }

    pub fn unit(&self) -> ControlUnit {
        self.unit
    }

    pub fn owner(&self) -> GroupOwner {
        self.owner
    }

    /// Add `flow` under `id`.
    ///
    /// Fails if the group is defunct or already holds `id`; on a collision
    /// the caller draws a new id and retries.
    pub fn insert(&self, id: FlowId, flow: Arc<FlowRecord>) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.defunct {
            return Err(Error::GroupDefunct(self.unit));
        }
        if inner.flows.contains_key(&id) {
            return Err(Error::FlowIdCollision(id));
        }
        inner.flows.insert(id, flow);
        Ok(())
    }

    /// Remove the flow with `id`. Removing an absent flow is a no-op.
    pub fn remove(&self, id: FlowId) -> Option<Arc<FlowRecord>> {
        self.inner.write().flows.remove(&id)
    }

    pub fn lookup(&self, id: FlowId) -> Option<Arc<FlowRecord>> {
        self.inner.read().flows.get(&id).cloned()
    }

    pub fn contains(&self, id: FlowId) -> bool {
        self.inner.read().flows.contains_key(&id)
    }

    pub fn flow_count(&self) -> usize {
        self.inner.read().flows.len()
    }

    /// Snapshot of member flows in id order.
    pub fn flows(&self) -> Vec<Arc<FlowRecord>> {
        self.inner.read().flows.values().cloned().collect()
    }

    /// Refuse new flows from now on and hand back the current members.
    pub fn mark_defunct(&self) -> Vec<Arc<FlowRecord>> {
        let mut inner = self.inner.write();
        inner.defunct = true;
        inner.send_queue.clear();
        inner.blocked = false;
        std::mem::take(&mut inner.flows).into_values().collect()
    }

    pub fn is_defunct(&self) -> bool {
        self.inner.read().defunct
    }

    pub fn secret(&self) -> Option<Bytes> {
        self.inner.read().secret.clone()
    }

    pub fn set_secret(&self, secret: Bytes) {
        self.inner.write().secret = Some(secret);
    }

    pub fn order(&self) -> u32 {
        self.inner.read().order
    }

    pub fn set_order(&self, order: u32) {
        self.inner.write().order = order;
    }

    pub fn flags(&self) -> u32 {
        self.inner.read().flags
    }

    pub fn set_flags(&self, flags: u32) {
        self.inner.write().flags = flags;
    }

    /// The provider does not restrict which applications may divert.
    pub fn no_app_map(&self) -> bool {
        self.flags() & GROUP_FLAG_NO_APP_MAP != 0
    }

    pub fn log_level(&self) -> u32 {
        self.inner.read().log_level
    }

    pub fn set_log_level(&self, level: u32) {
        self.inner.write().log_level = level;
    }

    /// Replace the identity map wholesale.
    pub fn install_trie(&self, trie: Trie) {
        self.inner.write().trie = trie;
    }

    /// Whether an application with this signing identity may divert here.
    pub fn identity_allowed(&self, signing_id: &[u8]) -> bool {
        self.inner.read().trie.contains(signing_id)
    }
}

impl std::fmt::Debug for ProviderGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderGroup")
            .field("unit", &self.unit)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
