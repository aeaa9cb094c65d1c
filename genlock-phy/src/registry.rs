//! Ownership of hardware PLL instances.
//!
//! Every PHY session claims its `(family, index)` slot before touching
//! registers and holds a [`PllGuard`] until it is dropped, so two sessions can
//! never program the same PLL.

use std::sync::Arc;

use genlock_if::platform::PhyType;
use id_arena::{Arena, Id};
use spin::Mutex;

use crate::err::{PllError, Result};

/// Upper bound on distinct PLL slots, one bit each in the owned bitmap.
const MAX_SLOTS: usize = u64::BITS as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PllSlot {
    family: PhyType,
    index: u8,
}

#[derive(Default)]
struct Table {
    slots: Arena<PllSlot>,
    owned: u64,
}

impl Table {
    fn find(&self, slot: PllSlot) -> Option<Id<PllSlot>> {
        self.slots
            .iter()
            .find(|(_, s)| **s == slot)
            .map(|(id, _)| id)
    }
}

#[derive(Default)]
pub struct PllRegistry {
    table: Mutex<Table>,
}

impl PllRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn claim(self: &Arc<Self>, family: PhyType, index: u8) -> Result<PllGuard> {
        let slot = PllSlot { family, index };
        let mut table = self.table.lock();

        let id = match table.find(slot) {
            Some(id) => id,
            None if table.slots.len() >= MAX_SLOTS => {
                error!("PLL registry full, cannot track {family:?} PLL {index}");
                return Err(PllError::InvalidArgument("too many PLL slots"));
            }
            None => table.slots.alloc(slot),
        };

        let bit = 1u64 << id.index();
        if table.owned & bit != 0 {
            error!("{family:?} PLL {index} is already in use");
            return Err(PllError::ResourceConflict { family, index });
        }
        table.owned |= bit;
        drop(table);

        debug!("Claimed {family:?} PLL {index}");
        Ok(PllGuard {
            registry: self.clone(),
            id,
            family,
            index,
        })
    }

    pub fn is_claimed(&self, family: PhyType, index: u8) -> bool {
        let table = self.table.lock();
        table
            .find(PllSlot { family, index })
            .is_some_and(|id| table.owned & (1u64 << id.index()) != 0)
    }

    fn release(&self, id: Id<PllSlot>) {
        self.table.lock().owned &= !(1u64 << id.index());
    }
}

/// Exclusive ownership of one PLL. Released on drop.
pub struct PllGuard {
    registry: Arc<PllRegistry>,
    id: Id<PllSlot>,
    family: PhyType,
    index: u8,
}

impl PllGuard {
    pub fn family(&self) -> PhyType {
        self.family
    }

    pub fn index(&self) -> u8 {
        self.index
    }
}

impl core::fmt::Debug for PllGuard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PllGuard")
            .field("family", &self.family)
            .field("index", &self.index)
            .finish()
    }
}

impl Drop for PllGuard {
    fn drop(&mut self) {
        self.registry.release(self.id);
        debug!("Released {:?} PLL {}", self.family, self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_conflicts_until_release() {
        let registry = PllRegistry::new();
        let guard = registry.claim(PhyType::Dkl, 2).unwrap();
        assert!(registry.is_claimed(PhyType::Dkl, 2));

        assert_eq!(
            registry.claim(PhyType::Dkl, 2).unwrap_err(),
            PllError::ResourceConflict {
                family: PhyType::Dkl,
                index: 2
            }
        );

        drop(guard);
        assert!(!registry.is_claimed(PhyType::Dkl, 2));
        let again = registry.claim(PhyType::Dkl, 2).unwrap();
        assert_eq!(again.index(), 2);
    }

    #[test]
    fn families_do_not_share_slots() {
        let registry = PllRegistry::new();
        let _combo = registry.claim(PhyType::Combo, 0).unwrap();
        let _dkl = registry.claim(PhyType::Dkl, 0).unwrap();
        assert!(registry.is_claimed(PhyType::Combo, 0));
        assert!(!registry.is_claimed(PhyType::C20, 0));
    }

    #[test]
    fn registry_bounds_slot_count() {
        let registry = PllRegistry::new();
        let guards: Vec<_> = (0..MAX_SLOTS as u8)
            .map(|i| registry.claim(PhyType::DpMn, i).unwrap())
            .collect();
        assert!(matches!(
            registry.claim(PhyType::C10, 0),
            Err(PllError::InvalidArgument(_))
        ));
        drop(guards);
        // Released slots stay tracked and can be claimed again.
        assert!(registry.claim(PhyType::DpMn, 7).is_ok());
    }
}
