//! The execution table and views derived from it.

use std::collections::BTreeMap;

use serde::Serialize;

use tabula_core::{ContractId, Region, RegionMap};

use crate::key::{ExecutionKey, Role};
use crate::slot::ExecutionSlot;

/// What this server is doing, keyed by execution key.
///
/// Owned by the executor's update task; nothing else mutates it.
#[derive(Default)]
pub struct ExecutionTable {
    slots: BTreeMap<ExecutionKey, ExecutionSlot>,
}

impl ExecutionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ExecutionKey) -> Option<&ExecutionSlot> {
        self.slots.get(key)
    }

    pub fn get_mut(&mut self, key: &ExecutionKey) -> Option<&mut ExecutionSlot> {
        self.slots.get_mut(key)
    }

    /// Insert a new slot. Panics if the key is already present.
    pub fn insert(&mut self, key: ExecutionKey, slot: ExecutionSlot) {
        if self.slots.contains_key(&key) {
            panic!("execution table already holds {key}");
        }
        self.slots.insert(key, slot);
    }

    pub fn remove(&mut self, key: &ExecutionKey) -> Option<ExecutionSlot> {
        self.slots.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ExecutionKey> {
        self.slots.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ExecutionKey, &ExecutionSlot)> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn summaries(&self) -> Vec<SlotSummary> {
        self.slots
            .iter()
            .map(|(key, slot)| SlotSummary {
                key: key.clone(),
                slot_id: slot.slot_id(),
                contract_id: slot.contract_id(),
            })
            .collect()
    }
}

/// A point-in-time description of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSummary {
    pub key: ExecutionKey,
    pub slot_id: u64,
    pub contract_id: ContractId,
}

/// Roles held over one stretch of the key space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShardStatus {
    pub primary: bool,
    pub secondary: bool,
    /// Data is being erased.
    pub transitioning: bool,
}

/// Merge the roles of `keys` into a map over the whole key space.
pub fn shard_status<'a>(keys: impl IntoIterator<Item = &'a ExecutionKey>) -> RegionMap<ShardStatus> {
    let mut map = RegionMap::new(Region::universe(), ShardStatus::default());
    for key in keys {
        map.visit_mut(&key.region, |_, status| match key.role {
            Role::Primary => status.primary = true,
            Role::Secondary => status.secondary = true,
            Role::Erase => status.transitioning = true,
        });
    }
    map
}
