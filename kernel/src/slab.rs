/// Fixed-capacity device tables with generation-checked handles.
///
/// The PCI, virtio and network-card tables are all small arrays scanned
/// linearly for a free slot. A slot is either Free or Used; every release
/// bumps the slot's generation so a handle kept across a recycle no longer
/// resolves.
use core::fmt;
use core::marker::PhantomData;

/// Returned when every slot of a table is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfCapacity;

impl fmt::Display for OutOfCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device table full")
    }
}

/// Lifecycle state of a table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Used,
}

/// Index + generation into a `Slab<T, N>`.
pub struct Handle<T> {
    index: u16,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

// Manual impls: deriving would put bounds on `T`.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}#{})", self.index, self.generation)
    }
}

enum Slot<T> {
    Free { generation: u32 },
    Used { generation: u32, value: T },
}

/// A fixed array of `N` slots.
pub struct Slab<T, const N: usize> {
    slots: [Slot<T>; N],
    used: usize,
}

impl<T, const N: usize> Slab<T, N> {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| Slot::Free { generation: 0 }),
            used: 0,
        }
    }

    /// Place `value` in the first free slot.
    pub fn alloc(&mut self, value: T) -> Result<Handle<T>, OutOfCapacity> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Slot::Free { generation } = *slot {
                *slot = Slot::Used { generation, value };
                self.used += 1;
                return Ok(Handle {
                    index: i as u16,
                    generation,
                    _marker: PhantomData,
                });
            }
        }
        Err(OutOfCapacity)
    }

    /// Return a slot to Free. Stale handles are ignored.
    pub fn release(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index())?;
        let current = match slot {
            Slot::Used { generation, .. } => *generation,
            Slot::Free { .. } => return None,
        };
        if current != handle.generation {
            return None;
        }
        let next = Slot::Free {
            generation: current.wrapping_add(1),
        };
        self.used -= 1;
        match core::mem::replace(slot, next) {
            Slot::Used { value, .. } => Some(value),
            Slot::Free { .. } => None,
        }
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        match self.slots.get(handle.index())? {
            Slot::Used { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.index())? {
            Slot::Used { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).map(|slot| match slot {
            Slot::Free { .. } => SlotState::Free,
            Slot::Used { .. } => SlotState::Used,
        })
    }

    /// Number of Used slots.
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Iterate over Used slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Used { generation, value } => Some((
                Handle {
                    index: i as u16,
                    generation: *generation,
                    _marker: PhantomData,
                },
                value,
            )),
            Slot::Free { .. } => None,
        })
    }
}

impl<T, const N: usize> Default for Slab<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_until_full() {
        let mut slab: Slab<u32, 3> = Slab::new();
        let a = slab.alloc(10).unwrap();
        let b = slab.alloc(20).unwrap();
        let c = slab.alloc(30).unwrap();
        assert_eq!(slab.alloc(40), Err(OutOfCapacity));

        // Earlier slots untouched by the failed call
        assert_eq!(slab.get(a), Some(&10));
        assert_eq!(slab.get(b), Some(&20));
        assert_eq!(slab.get(c), Some(&30));
        assert_eq!(slab.len(), 3);
    }

    #[test]
    fn release_reuses_slot_with_new_generation() {
        let mut slab: Slab<u32, 2> = Slab::new();
        let a = slab.alloc(1).unwrap();
        assert_eq!(slab.release(a), Some(1));
        assert_eq!(slab.state(0), Some(SlotState::Free));

        let b = slab.alloc(2).unwrap();
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);

        // The stale handle no longer resolves or releases
        assert_eq!(slab.get(a), None);
        assert_eq!(slab.release(a), None);
        assert_eq!(slab.get(b), Some(&2));
    }

    #[test]
    fn iter_skips_free_slots() {
        let mut slab: Slab<u32, 4> = Slab::new();
        let a = slab.alloc(1).unwrap();
        let _b = slab.alloc(2).unwrap();
        let _c = slab.alloc(3).unwrap();
        slab.release(a);

        let values: alloc::vec::Vec<u32> = slab.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, [2, 3]);
    }
}
