//! Synthetic PCs for edges that have no machine address.
//!
//! libFuzzer wants a PC table entry per counter. Managed code has no stable native
//! instruction addresses, so each edge gets the address of a word in an arena that
//! is allocated for nothing else and therefore cannot collide with real code.
//! Both arenas are reserved in one piece and leaked: the engine may read them for
//! as long as the process lives, and a single block keeps `pc -> edge` a
//! subtraction across every growth step.
use core::ptr::NonNull;

use crate::{EdgeId, error::ProtocolViolation, sanitizer_coverage::PcTableEntry};

/// Storage cell whose address stands in for an instruction. Never executed or read.
pub type FakeInstruction = u32;

const FAKE_INSTRUCTION_SIZE: usize = core::mem::size_of::<FakeInstruction>();

#[derive(Debug)]
struct Arena {
    instructions: NonNull<FakeInstruction>,
    entries: NonNull<PcTableEntry>,
    capacity: usize,
}

impl Arena {
    fn leak(capacity: usize) -> Self {
        let instructions: &'static mut [FakeInstruction] =
            Box::leak(vec![0; capacity].into_boxed_slice());
        let entries: &'static mut [PcTableEntry] =
            Box::leak(vec![PcTableEntry::default(); capacity].into_boxed_slice());
        Self {
            instructions: NonNull::from(instructions).cast(),
            entries: NonNull::from(entries).cast(),
            capacity,
        }
    }
}

/// Append-only `edge -> synthetic pc` table. Entry `i` belongs to counter byte `i`.
#[derive(Debug, Default)]
pub struct SyntheticPcTable {
    arena: Option<Arena>,
    len: usize,
}

// The arenas are leaked and only ever written below `len` through `&mut self`.
unsafe impl Send for SyntheticPcTable {}

impl SyntheticPcTable {
    pub const fn new() -> Self {
        Self { arena: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Synthetic PC of `edge_id`, if it has been registered.
    pub fn address_of(&self, edge_id: EdgeId) -> Option<usize> {
        let index = edge_id as usize;
        let arena = self.arena.as_ref()?;
        (index < self.len).then(|| arena.instructions.as_ptr().wrapping_add(index) as usize)
    }

    /// Inverse of [`Self::address_of`].
    pub fn edge_id_of(&self, address: usize) -> Result<EdgeId, ProtocolViolation> {
        let first = match (&self.arena, self.len) {
            (Some(arena), len) if len > 0 => arena.instructions.as_ptr() as usize,
            _ => return Err(ProtocolViolation::EmptyTable),
        };
        let offset = address
            .checked_sub(first)
            .filter(|offset| offset % FAKE_INSTRUCTION_SIZE == 0)
            .ok_or(ProtocolViolation::ForeignAddress { address })?;
        let index = offset / FAKE_INSTRUCTION_SIZE;
        if index >= self.len {
            return Err(ProtocolViolation::ForeignAddress { address });
        }
        EdgeId::try_from(index).map_err(|_| ProtocolViolation::ForeignAddress { address })
    }

    /// Registered entries in edge order.
    pub fn entries(&self) -> &[PcTableEntry] {
        match &self.arena {
            Some(arena) => unsafe { core::slice::from_raw_parts(arena.entries.as_ptr(), self.len) },
            None => &[],
        }
    }

    /// Append entries for edges `[old, new)` and return the half-open range of the
    /// freshly written entries. `capacity` is only consulted on first growth, when
    /// the arena is reserved.
    pub fn extend(
        &mut self,
        old: usize,
        new: usize,
        capacity: usize,
    ) -> Result<(*const PcTableEntry, *const PcTableEntry), ProtocolViolation> {
        if new < old {
            return Err(ProtocolViolation::CountDecreased { old, new });
        }
        if old != self.len {
            return Err(ProtocolViolation::CountMismatch {
                old,
                new,
                registered: self.len,
            });
        }
        let arena = self.arena.get_or_insert_with(|| Arena::leak(capacity));
        if new > arena.capacity {
            return Err(ProtocolViolation::CapacityExceeded {
                requested: new,
                capacity: arena.capacity,
            });
        }

        let entries = arena.entries.as_ptr();
        for index in old..new {
            unsafe {
                entries.add(index).write(PcTableEntry {
                    pc: arena.instructions.as_ptr().add(index) as usize,
                    // TODO: flag function entry edges once the instrumentor reports them.
                    flags: 0,
                });
            }
        }
        self.len = new;
        unsafe { Ok((entries.add(old).cast_const(), entries.add(new).cast_const())) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_monotonic_across_growth() {
        let mut table = SyntheticPcTable::new();
        table.extend(0, 3, 32).unwrap();
        table.extend(3, 3, 32).unwrap();
        table.extend(3, 10, 32).unwrap();

        let addresses: Vec<usize> = (0..10).map(|id| table.address_of(id).unwrap()).collect();
        assert!(addresses.windows(2).all(|w| w[0] < w[1]));
        assert!(table.entries().iter().all(|entry| entry.flags == 0));
        for id in 0..10 {
            assert_eq!(table.edge_id_of(addresses[id as usize]), Ok(id));
            assert_eq!(table.entries()[id as usize].pc, addresses[id as usize]);
        }
        assert_eq!(table.address_of(10), None);
    }

    #[test]
    fn extend_returns_only_new_entries() {
        let mut table = SyntheticPcTable::new();
        table.extend(0, 4, 16).unwrap();
        let (start, end) = table.extend(4, 9, 16).unwrap();
        assert_eq!(unsafe { end.offset_from(start) }, 5);
        assert_eq!(unsafe { (*start).pc }, table.address_of(4).unwrap());
    }

    #[test]
    fn lookup_on_empty_table_fails() {
        let table = SyntheticPcTable::new();
        assert_eq!(table.edge_id_of(0x1000), Err(ProtocolViolation::EmptyTable));
    }

    #[test]
    fn foreign_addresses_are_rejected() {
        let mut table = SyntheticPcTable::new();
        table.extend(0, 2, 4).unwrap();
        let first = table.address_of(0).unwrap();
        for address in [first - FAKE_INSTRUCTION_SIZE, first + 1, first + 2 * FAKE_INSTRUCTION_SIZE] {
            assert_eq!(
                table.edge_id_of(address),
                Err(ProtocolViolation::ForeignAddress { address })
            );
        }
    }

    #[test]
    fn growth_is_validated_without_mutation() {
        let mut table = SyntheticPcTable::new();
        table.extend(0, 5, 8).unwrap();
        assert_eq!(
            table.extend(5, 3, 8).unwrap_err(),
            ProtocolViolation::CountDecreased { old: 5, new: 3 }
        );
        assert_eq!(
            table.extend(2, 6, 8).unwrap_err(),
            ProtocolViolation::CountMismatch {
                old: 2,
                new: 6,
                registered: 5
            }
        );
        assert_eq!(
            table.extend(5, 9, 8).unwrap_err(),
            ProtocolViolation::CapacityExceeded {
                requested: 9,
                capacity: 8
            }
        );
        assert_eq!(table.len(), 5);
    }

    mod property_tests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn prop_growth_keeps_addresses_injective_and_invertible(
                steps in proptest::collection::vec(0usize..24, 1..12)
            ) {
                let capacity: usize = steps.iter().sum();
                let mut table = SyntheticPcTable::new();
                let mut registered = 0;
                for step in steps {
                    table.extend(registered, registered + step, capacity).unwrap();
                    registered += step;
                    prop_assert_eq!(table.len(), registered);

                    let mut previous = None;
                    for id in 0..registered as EdgeId {
                        let address = table.address_of(id).unwrap();
                        if let Some(previous) = previous {
                            prop_assert!(address > previous);
                        }
                        prop_assert_eq!(table.edge_id_of(address), Ok(id));
                        prop_assert_eq!(table.entries()[id as usize].pc, address);
                        previous = Some(address);
                    }
                    prop_assert_eq!(table.address_of(registered as EdgeId), None);
                }
            }
        }
    }
}
