// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Generation-stamped slot arena backing heap-owned kernel objects
//! OWNERS: @kernel-team
//! PUBLIC API: Tid (typed key); (crate) RawKey, Arena
//! INVARIANTS: A removed slot bumps its generation, so stale keys never resolve
//!
//! PTCBs, pipes, sockets, connection requests and file control blocks all live
//! in arenas. Their identities are `(index, generation)` pairs instead of
//! addresses; a recycled slot rejects the old identity.

use core::fmt;
use core::marker::PhantomData;

/// Untyped arena identity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RawKey {
    index: u32,
    generation: u32,
}

impl RawKey {
    /// Packs the key into a single integer (generation in the high half).
    #[inline]
    pub const fn to_u64(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn from_u64(raw: u64) -> Self {
        Self { index: raw as u32, generation: (raw >> 32) as u32 }
    }
}

/// Typed key stored in an [`Arena`].
pub(crate) trait ArenaKey: Copy {
    fn from_key(key: RawKey) -> Self;
    fn key(self) -> RawKey;
}

macro_rules! arena_key {
    ($(#[$meta:meta])* $vis:vis $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(transparent)]
        $vis struct $name($crate::arena::RawKey);

        impl $crate::arena::ArenaKey for $name {
            #[inline]
            fn from_key(key: $crate::arena::RawKey) -> Self {
                Self(key)
            }
            #[inline]
            fn key(self) -> $crate::arena::RawKey {
                self.0
            }
        }
    };
}

pub(crate) use arena_key;

arena_key!(
    /// Thread identity: stable for the lifetime of its PTCB, rejected afterwards.
    pub Tid
);

impl Tid {
    /// Encodes the identity so it can travel through an argument blob.
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0.to_u64()
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(RawKey::from_u64(raw))
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0.index, self.0.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot vector with a free list; `capacity` bounds the number of live entries.
pub(crate) struct Arena<K, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
    capacity: usize,
    _key: PhantomData<K>,
}

impl<K: ArenaKey, T> Arena<K, T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { slots: Vec::new(), free: Vec::new(), live: 0, capacity, _key: PhantomData }
    }

    /// Arena limited only by memory.
    pub fn unbounded() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stores `value`, or hands it back when the arena is full.
    pub fn insert(&mut self, value: T) -> Result<K, T> {
        if self.live >= self.capacity {
            return Err(value);
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot { generation: 0, value: None });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.live += 1;
        Ok(K::from_key(RawKey { index, generation: slot.generation }))
    }

    pub fn get(&self, key: K) -> Option<&T> {
        let raw = key.key();
        self.slots
            .get(raw.index as usize)
            .filter(|slot| slot.generation == raw.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        let raw = key.key();
        self.slots
            .get_mut(raw.index as usize)
            .filter(|slot| slot.generation == raw.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn remove(&mut self, key: K) -> Option<T> {
        let raw = key.key();
        let slot = self.slots.get_mut(raw.index as usize)?;
        if slot.generation != raw.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(raw.index);
        self.live -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    arena_key!(TestKey);

    #[test]
    fn stale_key_is_rejected_after_reuse() {
        let mut arena: Arena<TestKey, &str> = Arena::with_capacity(4);
        let first = arena.insert("a").unwrap();
        assert_eq!(arena.remove(first), Some("a"));
        let second = arena.insert("b").unwrap();
        assert_eq!(first.key().index, second.key().index);
        assert!(arena.get(first).is_none());
        assert_eq!(arena.get(second), Some(&"b"));
        assert_eq!(arena.remove(first), None);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut arena: Arena<TestKey, u8> = Arena::with_capacity(2);
        arena.insert(1).unwrap();
        arena.insert(2).unwrap();
        assert_eq!(arena.insert(3), Err(3));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn tid_raw_roundtrip_preserves_generation() {
        let key = RawKey { index: 7, generation: 3 };
        let tid = Tid::from_key(key);
        assert_eq!(Tid::from_raw(tid.as_raw()), tid);
    }
}
