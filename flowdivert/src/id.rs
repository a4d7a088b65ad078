//! Flow id generation.
//!
//! Ids are a SipHash-1-3 of a monotonically increasing counter under a key
//! drawn from the OS at startup, folded to 32 bits. Zero is reserved for
//! group messages and is never returned. Uniqueness is enforced separately
//! by [`reserve`], which checks every group and then inserts under the
//! target group's write lock.

use crate::error::{Error, Result};
use crate::flow::FlowRecord;
use crate::group::ProviderGroup;
use crate::registry::Registry;
use flowdivert_wire::FlowId;
use siphasher::sip::SipHasher13;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Source of candidate flow ids.
pub struct FlowIdGenerator {
    counter: AtomicU64,
    keys: (u64, u64),
}

impl Default for FlowIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowIdGenerator {
    pub fn new() -> Self {
        let mut salt = [0u8; 16];
        if let Err(e) = getrandom::getrandom(&mut salt) {
            // Ids stay unique via the collision check, only less
            // unpredictable.
            warn!("failed to get random bytes for flow id salt: {:?}", e);
            for (i, byte) in salt.iter_mut().enumerate() {
                *byte = (i as u8).wrapping_mul(137);
            }
        }
        let mut k0 = [0u8; 8];
        let mut k1 = [0u8; 8];
        k0.copy_from_slice(&salt[..8]);
        k1.copy_from_slice(&salt[8..]);
        Self::with_keys(u64::from_le_bytes(k0), u64::from_le_bytes(k1))
    }

    /// Deterministic generator, for tests.
    pub fn with_keys(k0: u64, k1: u64) -> Self {
        Self {
            counter: AtomicU64::new(0),
            keys: (k0, k1),
        }
    }

    /// Next candidate id. Never zero.
    pub fn next_id(&self) -> FlowId {
        loop {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let mut hasher = SipHasher13::new_with_keys(self.keys.0, self.keys.1);
            hasher.write_u64(n);
            let hash = hasher.finish();
            let id = (hash as u32) ^ ((hash >> 32) as u32);
            if id != 0 {
                return FlowId(id);
            }
        }
    }
}

/// Draw an id not used by any group and insert `flow` under it in `group`.
///
/// `preferred` is tried first, so a flow moving between groups keeps its id
/// when it can. Gives up after `attempts` fresh draws.
pub fn reserve(
    generator: &FlowIdGenerator,
    registry: &Registry,
    group: &ProviderGroup,
    flow: &Arc<FlowRecord>,
    preferred: Option<FlowId>,
    attempts: u32,
) -> Result<FlowId> {
    if let Some(id) = preferred.filter(|id| !id.is_group() && !registry.contains_flow_id(*id)) {
        match group.insert(id, flow.clone()) {
            Ok(()) => return Ok(id),
            Err(Error::FlowIdCollision(_)) => {
                trace!(flow_id = %id, unit = %group.unit(), "kept id collides in new group");
            }
            Err(e) => return Err(e),
        }
    }
    for _ in 0..attempts {
        let id = generator.next_id();
        if registry.contains_flow_id(id) {
            trace!(flow_id = %id, "flow id in use elsewhere, redrawing");
            continue;
        }
        match group.insert(id, flow.clone()) {
            Ok(()) => return Ok(id),
            Err(Error::FlowIdCollision(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::FlowIdExhausted(attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_nonzero_and_distinct() {
        let generator = FlowIdGenerator::new();
        let ids: HashSet<_> = (0..10_000).map(|_| generator.next_id()).collect();
        assert!(!ids.contains(&FlowId::GROUP));
        // Birthday bound for 10k draws from 2^32 is well under one collision.
        assert!(ids.len() >= 9_990);
    }

    #[test]
    fn test_same_keys_same_sequence() {
        let a = FlowIdGenerator::with_keys(1, 2);
        let b = FlowIdGenerator::with_keys(1, 2);
        for _ in 0..10 {
            assert_eq!(a.next_id(), b.next_id());
        }
        let c = FlowIdGenerator::with_keys(3, 4);
        assert_ne!(
            (0..4).map(|_| a.next_id()).collect::<Vec<_>>(),
            (0..4).map(|_| c.next_id()).collect::<Vec<_>>()
        );
    }
}
