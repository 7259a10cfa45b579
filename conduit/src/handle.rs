//! Generational handle maps ("safe references").
//!
//! A [`HandleMap`] hands out opaque [`SafeRef`] values in place of addresses.
//! Handles are checked on every lookup, so a stale, forged or foreign handle
//! resolves to nothing instead of to someone else's object.
//!
//! # Encoding
//!
//! ```text
//! 63      56 55                    32 31                        1   0
//! ┌─────────┬────────────────────────┬───────────────────────────┬───┐
//! │ map tag │ generation (24 bits)   │ slot index (31 bits)      │ 1 │
//! └─────────┴────────────────────────┴───────────────────────────┴───┘
//! ```
//!
//! Bit 0 is always set and the map tag always has its top bit set. User-space
//! pointers on 64-bit Linux never have bit 63 set, so no address can be
//! mistaken for a live handle.

use core::fmt;
use core::marker::PhantomData;
use core::num::NonZeroU64;

use thiserror::Error;

use crate::trace::{trace, warn};

const INDEX_BITS: u32 = 31;
const GENERATION_BITS: u32 = 24;
const GENERATION_SHIFT: u32 = 32;
const TAG_SHIFT: u32 = 56;

const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;

/// Largest number of slots a single map can hold.
pub const MAX_SLOTS: usize = 1 << INDEX_BITS;

/// Errors from handle allocation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandleError {
    /// Every slot index is in use.
    #[error("handle map '{map}' exhausted ({slots} slots)")]
    Exhausted { map: String, slots: usize },
}

/// Opaque reference to a value stored in a [`HandleMap<T>`].
///
/// The type parameter only prevents handles of one map kind from being
/// passed to another; the tag embedded in the value catches handles from a
/// different map of the same kind.
// Manual Copy/Clone/Eq: derive would require the same bounds on T.
pub struct SafeRef<T>(NonZeroU64, PhantomData<fn() -> T>);

impl<T> Copy for SafeRef<T> {}

impl<T> Clone for SafeRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for SafeRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> Eq for SafeRef<T> {}

impl<T> core::hash::Hash for SafeRef<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> fmt::Debug for SafeRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SafeRef({:#018x})", self.0)
    }
}

impl<T> fmt::Display for SafeRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl<T> SafeRef<T> {
    fn encode(tag: u8, generation: u32, index: u32) -> Self {
        let raw = (u64::from(tag) << TAG_SHIFT)
            | (u64::from(generation & GENERATION_MASK) << GENERATION_SHIFT)
            | ((u64::from(index) & INDEX_MASK) << 1);
        // NonZeroU64::MIN is 1, which sets the odd bit.
        Self(NonZeroU64::MIN | raw, PhantomData)
    }

    /// Rebuild a handle from its raw value. Zero yields `None`.
    ///
    /// This performs no validation; the owning map rejects anything it did
    /// not issue.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(v) => Some(Self(v, PhantomData)),
            None => None,
        }
    }

    /// Raw value for crossing process or FFI boundaries.
    #[must_use]
    pub const fn into_raw(self) -> u64 {
        self.0.get()
    }

    const fn tag(self) -> u8 {
        (self.0.get() >> TAG_SHIFT) as u8
    }

    const fn generation(self) -> u32 {
        ((self.0.get() >> GENERATION_SHIFT) as u32) & GENERATION_MASK
    }

    const fn index(self) -> usize {
        ((self.0.get() >> 1) & INDEX_MASK) as usize
    }

    const fn is_well_formed(self) -> bool {
        self.0.get() & 1 == 1
    }
}

enum Entry<T> {
    Occupied { value: T, generation: u32 },
    Free { next: Option<u32>, generation: u32 },
}

/// Growable slot table issuing [`SafeRef`] handles.
///
/// Deleted slots are recycled through an intrusive free list; each reuse
/// bumps the slot generation so earlier handles to it stop resolving.
pub struct HandleMap<T> {
    name: String,
    tag: u8,
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> HandleMap<T> {
    /// Creates an empty map. `capacity` is a hint; the map grows on demand.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            tag: rand::random::<u8>() | 0x80,
            entries: Vec::with_capacity(capacity.min(MAX_SLOTS)),
            free_head: None,
            len: 0,
        }
    }

    /// Diagnostic name given at creation.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of live handles.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `value` and returns a new handle to it.
    ///
    /// # Errors
    ///
    /// Returns [`HandleError::Exhausted`] once every slot index is live.
    pub fn create_ref(&mut self, value: T) -> Result<SafeRef<T>, HandleError> {
        let (index, generation) = match self.free_head {
            Some(head) => {
                let slot = &mut self.entries[head as usize];
                let (next, generation) = match slot {
                    Entry::Free { next, generation } => (*next, *generation),
                    Entry::Occupied { .. } => unreachable!("free_head must point to free slot"),
                };
                self.free_head = next;
                *slot = Entry::Occupied { value, generation };
                (head, generation)
            }
            None => {
                if self.entries.len() >= MAX_SLOTS {
                    return Err(HandleError::Exhausted {
                        map: self.name.clone(),
                        slots: self.entries.len(),
                    });
                }
                if self.entries.len() == self.entries.capacity() {
                    let extra = self.entries.len().max(1);
                    self.entries.reserve_exact(extra);
                }
                // In range: checked against MAX_SLOTS above.
                let index = self.entries.len() as u32;
                self.entries.push(Entry::Occupied {
                    value,
                    generation: 0,
                });
                (index, 0)
            }
        };
        self.len += 1;
        Ok(SafeRef::encode(self.tag, generation, index))
    }

    fn slot_of(&self, handle: SafeRef<T>) -> Option<usize> {
        if !handle.is_well_formed() || handle.tag() != self.tag {
            return None;
        }
        let index = handle.index();
        match self.entries.get(index)? {
            Entry::Occupied { generation, .. } if *generation == handle.generation() => {
                Some(index)
            }
            _ => None,
        }
    }

    /// Resolves a handle.
    #[must_use]
    pub fn lookup(&self, handle: SafeRef<T>) -> Option<&T> {
        let index = self.slot_of(handle)?;
        match &self.entries[index] {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Free { .. } => None,
        }
    }

    /// Resolves a handle mutably.
    pub fn lookup_mut(&mut self, handle: SafeRef<T>) -> Option<&mut T> {
        let index = self.slot_of(handle)?;
        match &mut self.entries[index] {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Free { .. } => None,
        }
    }

    /// Resolves a raw handle value, e.g. one that came back through a
    /// poll token or over the wire.
    #[must_use]
    pub fn lookup_raw(&self, raw: u64) -> Option<&T> {
        self.lookup(SafeRef::from_raw(raw)?)
    }

    /// Whether `handle` currently resolves.
    #[must_use]
    pub fn contains(&self, handle: SafeRef<T>) -> bool {
        self.slot_of(handle).is_some()
    }

    /// Invalidates a handle and hands back the value it referred to.
    ///
    /// Unknown handles are logged and ignored.
    pub fn delete_ref(&mut self, handle: SafeRef<T>) -> Option<T> {
        let Some(index) = self.slot_of(handle) else {
            warn!(map = %self.name, handle = %handle, "delete of unknown handle");
            return None;
        };
        let generation = handle.generation().wrapping_add(1) & GENERATION_MASK;
        let freed = core::mem::replace(
            &mut self.entries[index],
            Entry::Free {
                next: self.free_head,
                generation,
            },
        );
        // Slot indices fit in 31 bits.
        self.free_head = Some(index as u32);
        self.len -= 1;
        trace!(map = %self.name, handle = %handle, "handle deleted");
        match freed {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Free { .. } => None,
        }
    }

    /// Live handles and their values, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (SafeRef<T>, &T)> + '_ {
        let tag = self.tag;
        self.entries
            .iter()
            .enumerate()
            .filter_map(move |(index, entry)| match entry {
                Entry::Occupied { value, generation } => {
                    Some((SafeRef::encode(tag, *generation, index as u32), value))
                }
                Entry::Free { .. } => None,
            })
    }

    /// Live handles, in slot order.
    pub fn refs(&self) -> impl Iterator<Item = SafeRef<T>> + '_ {
        self.iter().map(|(handle, _)| handle)
    }
}

impl<T> fmt::Debug for HandleMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleMap")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("slots", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_lookup() {
        let mut map = HandleMap::new("test", 4);
        let a = map.create_ref("a").unwrap();
        let b = map.create_ref("b").unwrap();

        assert_ne!(a, b);
        assert_eq!(map.lookup(a), Some(&"a"));
        assert_eq!(map.lookup(b), Some(&"b"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn handles_are_odd_and_tagged() {
        let mut map = HandleMap::new("test", 1);
        for i in 0..100 {
            let h = map.create_ref(i).unwrap().into_raw();
            assert_eq!(h & 1, 1);
            assert_ne!(h & (1 << 63), 0);
        }
    }

    #[test]
    fn deleted_handle_no_longer_resolves() {
        let mut map = HandleMap::new("test", 4);
        let a = map.create_ref(10).unwrap();

        assert_eq!(map.delete_ref(a), Some(10));
        assert_eq!(map.lookup(a), None);
        assert_eq!(map.delete_ref(a), None);
        assert!(map.is_empty());
    }

    #[test]
    fn reused_slot_rejects_stale_handle() {
        let mut map = HandleMap::new("test", 1);
        let old = map.create_ref(1).unwrap();
        map.delete_ref(old);
        let new = map.create_ref(2).unwrap();

        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert_eq!(map.lookup(old), None);
        assert_eq!(map.lookup(new), Some(&2));
    }

    #[test]
    fn zero_and_garbage_do_not_resolve() {
        let mut map = HandleMap::new("test", 4);
        let _live = map.create_ref(1u32).unwrap();

        assert!(SafeRef::<u32>::from_raw(0).is_none());
        assert_eq!(map.lookup_raw(0), None);
        assert_eq!(map.lookup_raw(2), None);
        assert_eq!(map.lookup_raw(u64::MAX), None);
    }

    #[test]
    fn local_address_never_resolves() {
        let mut map = HandleMap::new("test", 16);
        let local = 0u32;
        for i in 0..16 {
            map.create_ref(i).unwrap();
        }

        let addr = &local as *const u32 as u64;
        assert_eq!(map.lookup_raw(addr), None);
    }

    #[test]
    fn handles_from_other_map_are_rejected() {
        let mut a = HandleMap::new("a", 1);
        let mut b = HandleMap::new("b", 1);
        // Force distinct tags so the check is deterministic.
        b.tag = a.tag ^ 0x01;
        let ha = a.create_ref(1).unwrap();
        let _hb = b.create_ref(2).unwrap();

        assert_eq!(b.lookup(ha), None);
    }

    #[test]
    fn growth_keeps_handles_valid() {
        let mut map = HandleMap::new("grow", 1);
        let handles: Vec<_> = (0..1000).map(|i| map.create_ref(i).unwrap()).collect();

        for (i, h) in handles.iter().enumerate() {
            assert_eq!(map.lookup(*h), Some(&i));
        }
    }

    #[test]
    fn raw_round_trip() {
        let mut map = HandleMap::new("raw", 1);
        let h = map.create_ref('x').unwrap();
        let back = SafeRef::<char>::from_raw(h.into_raw()).unwrap();

        assert_eq!(back, h);
        assert_eq!(map.lookup(back), Some(&'x'));
    }

    #[test]
    fn iter_visits_live_entries_only() {
        let mut map = HandleMap::new("iter", 4);
        let a = map.create_ref(1).unwrap();
        let b = map.create_ref(2).unwrap();
        let c = map.create_ref(3).unwrap();
        map.delete_ref(b);

        let seen: Vec<_> = map.iter().map(|(h, v)| (h, *v)).collect();
        assert_eq!(seen, vec![(a, 1), (c, 3)]);
    }

    #[test]
    fn lookup_mut_updates_value() {
        let mut map = HandleMap::new("mut", 1);
        let h = map.create_ref(String::from("a")).unwrap();
        map.lookup_mut(h).unwrap().push('b');

        assert_eq!(map.lookup(h).map(String::as_str), Some("ab"));
    }
}
