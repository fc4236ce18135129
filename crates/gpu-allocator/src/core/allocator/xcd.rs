//! Ownership map of the compute dies of one partitioned device.

use crate::core::types::XCD_COUNT;

/// Maps each XCD index to the allocation that holds it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XcdSlotMap {
    slots: [Option<String>; XCD_COUNT as usize],
}

impl XcdSlotMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn free_count(&self) -> u8 {
        self.slots.iter().filter(|slot| slot.is_none()).count() as u8
    }

    pub fn claimed_count(&self) -> u8 {
        XCD_COUNT - self.free_count()
    }

    /// Claims the `count` lowest free indices for `owner`.
    ///
    /// Returns `None` and leaves the map untouched when fewer are free.
    pub fn claim(&mut self, owner: &str, count: u8) -> Option<Vec<u8>> {
        if count > self.free_count() {
            return None;
        }
        let indices = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index as u8)
            .take(usize::from(count))
            .collect::<Vec<_>>();
        for index in &indices {
            self.slots[usize::from(*index)] = Some(owner.to_string());
        }
        Some(indices)
    }

    /// Frees every index held by `owner` and returns them.
    pub fn release(&mut self, owner: &str) -> Vec<u8> {
        let mut freed = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.as_deref() == Some(owner) {
                *slot = None;
                freed.push(index as u8);
            }
        }
        freed
    }

    pub fn owner_of(&self, index: u8) -> Option<&str> {
        self.slots.get(usize::from(index))?.as_deref()
    }

    pub fn owned_by(&self, owner: &str) -> Vec<u8> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.as_deref() == Some(owner))
            .map(|(index, _)| index as u8)
            .collect()
    }
}
