//! # Group Registry
//!
//! Process-wide table of provider groups:
//!
//! - a slot table for units `1..=MAX_KERNEL_UNIT`, used by out-of-process
//!   providers;
//! - a list of in-process groups with units from `IN_PROCESS_UNIT_MIN`,
//!   each owned by one process and only visible to lookups made on behalf
//!   of that process.
//!
//! The registry is an ordinary value injected into the engine, so tests
//! build isolated ones. Lookups hand out `Arc`s cloned under the registry
//! lock; a group removed concurrently stays alive until the last holder
//! drops it.

use crate::error::{Error, Result};
use crate::group::ProviderGroup;
use flowdivert_wire::FlowId;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Highest unit in the out-of-process namespace.
pub const MAX_KERNEL_UNIT: u32 = 30;
/// Lowest unit in the in-process namespace.
pub const IN_PROCESS_UNIT_MIN: u32 = 0xFB00;
/// Highest unit in the in-process namespace.
pub const IN_PROCESS_UNIT_MAX: u32 = 0xFFFF;

/// Identifier of a provider group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlUnit(pub u32);

impl ControlUnit {
    pub fn is_in_process(&self) -> bool {
        self.0 >= IN_PROCESS_UNIT_MIN
    }

    /// Bit of this unit in an aggregate mask, if it has one.
    pub fn mask_bit(&self) -> Option<u32> {
        (1..=32).contains(&self.0).then(|| 1u32 << (self.0 - 1))
    }
}

impl fmt::Display for ControlUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who created a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOwner {
    /// An out-of-process provider on the shared control channel.
    Kernel,
    /// An in-process provider owned by this process id.
    Process(u32),
}

#[derive(Default)]
struct RegistryInner {
    /// Indexed by unit; slot 0 is never used.
    slots: Vec<Option<Arc<ProviderGroup>>>,
    in_process: Vec<Arc<ProviderGroup>>,
}

/// Table of active provider groups.
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                slots: vec![None; MAX_KERNEL_UNIT as usize + 1],
                in_process: Vec::new(),
            }),
        }
    }

    /// Create a group in the next free unit of the owner's namespace.
    pub fn create_group(&self, owner: GroupOwner) -> Result<Arc<ProviderGroup>> {
        let mut inner = self.inner.write();
        let group = match owner {
            GroupOwner::Kernel => {
                let unit = (1..=MAX_KERNEL_UNIT)
                    .find(|u| inner.slots[*u as usize].is_none())
                    .ok_or(Error::NoFreeUnit)?;
                let group = ProviderGroup::new(ControlUnit(unit), owner);
                inner.slots[unit as usize] = Some(group.clone());
                group
            }
            GroupOwner::Process(_) => {
                let unit = (IN_PROCESS_UNIT_MIN..=IN_PROCESS_UNIT_MAX)
                    .find(|u| inner.in_process.iter().all(|g| g.unit().0 != *u))
                    .ok_or(Error::NoFreeUnit)?;
                let group = ProviderGroup::new(ControlUnit(unit), owner);
                inner.in_process.push(group.clone());
                group
            }
        };
        info!(unit = %group.unit(), ?owner, "provider group created");
        Ok(group)
    }

    /// Group for `unit`, regardless of owner. For traffic arriving from the
    /// group's own channel.
    pub fn get(&self, unit: ControlUnit) -> Option<Arc<ProviderGroup>> {
        let inner = self.inner.read();
        if unit.is_in_process() {
            inner.in_process.iter().find(|g| g.unit() == unit).cloned()
        } else {
            inner.slots.get(unit.0 as usize).and_then(|slot| slot.clone())
        }
    }

    /// Group for `unit` as seen by process `pid`.
    ///
    /// In-process groups are only returned to their owning process.
    pub fn lookup(&self, unit: ControlUnit, pid: Option<u32>) -> Option<Arc<ProviderGroup>> {
        let group = self.get(unit)?;
        match group.owner() {
            GroupOwner::Kernel => Some(group),
            GroupOwner::Process(owner) if Some(owner) == pid => Some(group),
            GroupOwner::Process(_) => None,
        }
    }

    /// Remove and return the group for `unit`.
    pub fn remove(&self, unit: ControlUnit) -> Option<Arc<ProviderGroup>> {
        let mut inner = self.inner.write();
        let removed = if unit.is_in_process() {
            let pos = inner.in_process.iter().position(|g| g.unit() == unit)?;
            Some(inner.in_process.remove(pos))
        } else {
            inner.slots.get_mut(unit.0 as usize).and_then(Option::take)
        };
        if removed.is_some() {
            debug!(%unit, "provider group removed");
        }
        removed
    }

    /// Pick the registered, live group with the lowest order among the
    /// units set in `mask`, and clear its bit.
    pub fn select_candidate(&self, mask: &mut u32, pid: Option<u32>) -> Option<Arc<ProviderGroup>> {
        let mut best: Option<Arc<ProviderGroup>> = None;
        let mut bits = *mask;
        while bits != 0 {
            let bit = bits.trailing_zeros();
            bits &= !(1u32 << bit);
            let Some(group) = self.lookup(ControlUnit(bit + 1), pid) else {
                continue;
            };
            if group.is_defunct() {
                continue;
            }
            if best.as_ref().map_or(true, |b| group.order() < b.order()) {
                best = Some(group);
            }
        }
        let chosen = best?;
        if let Some(bit) = chosen.unit().mask_bit() {
            *mask &= !bit;
        }
        Some(chosen)
    }

    /// True if any group holds a flow with this id.
    pub fn contains_flow_id(&self, id: FlowId) -> bool {
        self.groups().iter().any(|g| g.contains(id))
    }

    /// Snapshot of every registered group.
    pub fn groups(&self) -> Vec<Arc<ProviderGroup>> {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .flatten()
            .chain(inner.in_process.iter())
            .cloned()
            .collect()
    }

    /// Remove every group. Returns them so the caller can tear down flows.
    pub fn shutdown(&self) -> Vec<Arc<ProviderGroup>> {
        let mut inner = self.inner.write();
        let mut groups: Vec<_> = inner.slots.iter_mut().filter_map(Option::take).collect();
        groups.append(&mut inner.in_process);
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_units_allocated_in_order() {
        let registry = Registry::new();
        let a = registry.create_group(GroupOwner::Kernel).unwrap();
        let b = registry.create_group(GroupOwner::Kernel).unwrap();
        assert_eq!(a.unit(), ControlUnit(1));
        assert_eq!(b.unit(), ControlUnit(2));

        registry.remove(ControlUnit(1));
        let c = registry.create_group(GroupOwner::Kernel).unwrap();
        assert_eq!(c.unit(), ControlUnit(1));
    }

    #[test]
    fn test_kernel_namespace_exhaustion() {
        let registry = Registry::new();
        for _ in 0..MAX_KERNEL_UNIT {
            registry.create_group(GroupOwner::Kernel).unwrap();
        }
        assert!(matches!(
            registry.create_group(GroupOwner::Kernel),
            Err(Error::NoFreeUnit)
        ));
    }

    #[test]
    fn test_in_process_groups_filtered_by_pid() {
        let registry = Registry::new();
        let group = registry.create_group(GroupOwner::Process(100)).unwrap();
        assert!(group.unit().is_in_process());

        assert!(registry.lookup(group.unit(), Some(100)).is_some());
        assert!(registry.lookup(group.unit(), Some(200)).is_none());
        assert!(registry.lookup(group.unit(), None).is_none());
        assert!(registry.get(group.unit()).is_some());

        let other = registry.create_group(GroupOwner::Process(200)).unwrap();
        assert_ne!(other.unit(), group.unit());
    }

    #[test]
    fn test_select_candidate_by_order() {
        let registry = Registry::new();
        let g1 = registry.create_group(GroupOwner::Kernel).unwrap();
        let g2 = registry.create_group(GroupOwner::Kernel).unwrap();
        let g3 = registry.create_group(GroupOwner::Kernel).unwrap();
        g1.set_order(30);
        g2.set_order(10);
        g3.set_order(20);

        // Units 1, 2, 3 and the unregistered unit 9.
        let mut mask = 0b1_0000_0111;
        let picks: Vec<_> = std::iter::from_fn(|| registry.select_candidate(&mut mask, None))
            .map(|g| g.unit().0)
            .collect();
        assert_eq!(picks, vec![2, 3, 1]);
        assert_eq!(mask, 0b1_0000_0000);
    }

    #[test]
    fn test_select_candidate_skips_defunct() {
        let registry = Registry::new();
        let g1 = registry.create_group(GroupOwner::Kernel).unwrap();
        registry.create_group(GroupOwner::Kernel).unwrap();
        g1.mark_defunct();

        let mut mask = 0b11;
        assert_eq!(
            registry.select_candidate(&mut mask, None).unwrap().unit(),
            ControlUnit(2)
        );
        assert!(registry.select_candidate(&mut mask, None).is_none());
    }

    #[test]
    fn test_shutdown_empties_registry() {
        let registry = Registry::new();
        registry.create_group(GroupOwner::Kernel).unwrap();
        registry.create_group(GroupOwner::Process(1)).unwrap();
        assert_eq!(registry.shutdown().len(), 2);
        assert!(registry.groups().is_empty());
    }
}
