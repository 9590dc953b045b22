// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Open hash table giving persistent identity to unordered pairs of box handles.

use core::fmt::Debug;

use tracing::warn;

const INVALID: u32 = u32::MAX;

bitflags::bitflags! {
    /// Per-frame state of a pair tracked by the sweep-and-prune engine.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PairState: u8 {
        /// The pair index was pushed to the frame's touched list.
        const IN_ARRAY = 0b0000_0001;
        /// The last event seen for the pair this frame was a removal.
        const REMOVED  = 0b0000_0010;
        /// The pair was created this frame.
        const NEW      = 0b0000_0100;
        /// Freshly inserted; not yet classified.
        const UNKNOWN  = 0b0000_1000;
    }
}

/// A stored pair: ids in ascending order plus a caller-defined payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pair<S> {
    /// Smaller id.
    pub id0: u32,
    /// Larger id.
    pub id1: u32,
    /// Payload, usually state bits.
    pub state: S,
}

/// Thomas Wang style 32-bit integer mix.
#[inline(always)]
pub(crate) fn hash32(key: u32) -> u32 {
    #[allow(
        clippy::cast_possible_wrap,
        reason = "The mix is defined on signed integers with arithmetic shifts."
    )]
    let mut key = key as i32;
    key = key.wrapping_add(!(key << 15));
    key ^= key >> 10;
    key = key.wrapping_add(key << 3);
    key ^= key >> 6;
    key = key.wrapping_add(!(key << 11));
    key ^= key >> 16;
    #[allow(
        clippy::cast_sign_loss,
        reason = "Reinterpreting the mixed bits as an unsigned bucket value."
    )]
    let out = key as u32;
    out
}

#[inline(always)]
fn pair_hash(id0: u32, id1: u32) -> u32 {
    hash32((id0 & 0xffff) | (id1 << 16))
}

/// Hash table of unordered `(u32, u32)` pairs with O(1) expected add/find/remove.
///
/// Pairs are stored densely: removal moves the last pair into the hole, so indices
/// returned by [`add`][Self::add] are only stable until the next removal.
pub struct PairManager<S> {
    table: Vec<u32>,
    next: Vec<u32>,
    active: Vec<Pair<S>>,
    mask: u32,
    max_pairs: usize,
    min_capacity: usize,
    overflow_warned: bool,
}

impl<S: Debug> Debug for PairManager<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PairManager")
            .field("pairs", &self.active.len())
            .field("hash_size", &self.table.len())
            .field("max_pairs", &self.max_pairs)
            .finish_non_exhaustive()
    }
}

impl<S: Copy> Default for PairManager<S> {
    fn default() -> Self {
        Self::new(usize::MAX, 0)
    }
}

impl<S: Copy> PairManager<S> {
    /// Create an empty table.
    ///
    /// `max_pairs` caps the number of live pairs; extra pairs are dropped with a one-time
    /// warning. `min_capacity` is the floor used by [`shrink_memory`][Self::shrink_memory].
    pub fn new(max_pairs: usize, min_capacity: usize) -> Self {
        Self {
            table: Vec::new(),
            next: Vec::new(),
            active: Vec::new(),
            mask: 0,
            max_pairs,
            min_capacity,
            overflow_warned: false,
        }
    }

    /// Number of live pairs.
    #[inline]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no pair is stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Current hash table size (a power of two, or zero).
    #[inline]
    pub fn hash_size(&self) -> usize {
        self.table.len()
    }

    /// Iterate over live pairs in storage order.
    pub fn iter(&self) -> impl Iterator<Item = &Pair<S>> + '_ {
        self.active.iter()
    }

    /// The pair stored at `index`.
    #[inline]
    pub fn get(&self, index: usize) -> &Pair<S> {
        &self.active[index]
    }

    /// Mutable access to the payload of the pair stored at `index`.
    #[inline]
    pub fn state_mut(&mut self, index: usize) -> &mut S {
        &mut self.active[index].state
    }

    /// Find a pair. The ids may be given in any order.
    pub fn find(&self, id0: u32, id1: u32) -> Option<usize> {
        let (id0, id1) = if id0 > id1 { (id1, id0) } else { (id0, id1) };
        if self.table.is_empty() {
            return None;
        }
        self.find_hashed(id0, id1, pair_hash(id0, id1) & self.mask)
    }

    fn find_hashed(&self, id0: u32, id1: u32, bucket: u32) -> Option<usize> {
        let mut offset = self.table[bucket as usize];
        while offset != INVALID {
            let p = &self.active[offset as usize];
            if p.id0 == id0 && p.id1 == id1 {
                return Some(offset as usize);
            }
            offset = self.next[offset as usize];
        }
        None
    }

    /// Add a pair, or find it if already present.
    ///
    /// Returns the pair index and whether it was inserted by this call. Returns `None`
    /// when the table is at capacity; this is reported once through `tracing`.
    pub fn add(&mut self, id0: u32, id1: u32, init: S) -> Option<(usize, bool)> {
        debug_assert_ne!(id0, id1, "a box cannot pair with itself");
        let (id0, id1) = if id0 > id1 { (id1, id0) } else { (id0, id1) };
        let hash = pair_hash(id0, id1);

        if !self.table.is_empty()
            && let Some(index) = self.find_hashed(id0, id1, hash & self.mask)
        {
            return Some((index, false));
        }

        if self.active.len() >= self.max_pairs {
            if !self.overflow_warned {
                warn!(
                    max_pairs = self.max_pairs,
                    "pair table full; further overlapping pairs are dropped"
                );
                self.overflow_warned = true;
            }
            return None;
        }

        if self.active.len() >= self.table.len() {
            let new_size = (self.active.len() + 1).next_power_of_two();
            self.rehash(new_size);
        }

        #[allow(
            clippy::cast_possible_truncation,
            reason = "Pair counts are bounded by max_pairs, far below u32::MAX."
        )]
        let index = self.active.len() as u32;
        let bucket = (hash & self.mask) as usize;
        self.active.push(Pair { id0, id1, state: init });
        self.next.push(self.table[bucket]);
        self.table[bucket] = index;
        Some((index as usize, true))
    }

    /// Remove a pair. Returns whether it was present.
    pub fn remove(&mut self, id0: u32, id1: u32) -> bool {
        match self.find(id0, id1) {
            Some(index) => {
                self.remove_at(index);
                true
            }
            None => false,
        }
    }

    /// Remove the pair stored at `index`; the last pair moves into its slot.
    pub fn remove_at(&mut self, index: usize) {
        let p = self.active[index];
        self.unlink(index, pair_hash(p.id0, p.id1) & self.mask);

        let last = self.active.len() - 1;
        if index != last {
            let moved = self.active[last];
            let moved_bucket = pair_hash(moved.id0, moved.id1) & self.mask;
            self.unlink(last, moved_bucket);
            self.active.swap_remove(index);
            self.next.swap_remove(index);
            #[allow(
                clippy::cast_possible_truncation,
                reason = "Pair indices fit in u32 by construction."
            )]
            let index_u32 = index as u32;
            self.next[index] = self.table[moved_bucket as usize];
            self.table[moved_bucket as usize] = index_u32;
        } else {
            self.active.pop();
            self.next.pop();
        }
    }

    fn unlink(&mut self, index: usize, bucket: u32) {
        let mut previous = INVALID;
        let mut offset = self.table[bucket as usize];
        while offset as usize != index {
            debug_assert_ne!(offset, INVALID, "pair table invariant violated: pair not in its chain");
            previous = offset;
            offset = self.next[offset as usize];
        }
        if previous == INVALID {
            self.table[bucket as usize] = self.next[index];
        } else {
            self.next[previous as usize] = self.next[index];
        }
    }

    /// Keep only the pairs for which `keep` returns true.
    ///
    /// The closure sees every pair exactly once, including pairs moved by earlier removals.
    pub fn retain<F: FnMut(&mut Pair<S>) -> bool>(&mut self, mut keep: F) {
        let mut i = 0;
        while i < self.active.len() {
            if keep(&mut self.active[i]) {
                i += 1;
            } else {
                self.remove_at(i);
            }
        }
    }

    /// Remove every pair touching an id for which `removed` returns true.
    pub fn remove_pairs_with<F: Fn(u32) -> bool>(&mut self, removed: F) {
        self.retain(|p| !removed(p.id0) && !removed(p.id1));
    }

    /// Shrink the table to the smallest power of two holding the live pairs, but not
    /// below the configured floor.
    pub fn shrink_memory(&mut self) {
        let wanted = self
            .active
            .len()
            .next_power_of_two()
            .max(self.min_capacity.next_power_of_two());
        if wanted == self.table.len() {
            return;
        }
        if wanted < self.table.len() {
            self.active.shrink_to(wanted);
            self.next.shrink_to(wanted);
        }
        self.rehash(wanted);
    }

    /// Drop all pairs and release the table.
    pub fn purge(&mut self) {
        self.table = Vec::new();
        self.next = Vec::new();
        self.active = Vec::new();
        self.mask = 0;
        self.overflow_warned = false;
    }

    fn rehash(&mut self, size: usize) {
        debug_assert!(size.is_power_of_two(), "hash size must be a power of two");
        debug_assert!(size >= self.active.len(), "hash size below pair count");
        #[allow(
            clippy::cast_possible_truncation,
            reason = "Hash sizes are bounded by max_pairs."
        )]
        let mask = (size - 1) as u32;
        self.mask = mask;
        self.table.clear();
        self.table.resize(size, INVALID);
        self.active.reserve(size.saturating_sub(self.active.len()));
        self.next.reserve(size.saturating_sub(self.next.len()));
        for (i, p) in self.active.iter().enumerate() {
            let bucket = (pair_hash(p.id0, p.id1) & mask) as usize;
            #[allow(
                clippy::cast_possible_truncation,
                reason = "Pair indices fit in u32 by construction."
            )]
            let i_u32 = i as u32;
            self.next[i] = self.table[bucket];
            self.table[bucket] = i_u32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_find_remove() {
        let mut pm: PairManager<PairState> = PairManager::default();
        let (i, new) = pm.add(3, 1, PairState::UNKNOWN).unwrap();
        assert!(new);
        assert_eq!(pm.get(i).id0, 1);
        assert_eq!(pm.get(i).id1, 3);
        let (j, new) = pm.add(1, 3, PairState::empty()).unwrap();
        assert!(!new);
        assert_eq!(i, j);
        assert_eq!(pm.find(3, 1), Some(i));
        assert!(pm.remove(1, 3));
        assert!(!pm.remove(1, 3));
        assert!(pm.is_empty());
    }

    #[test]
    fn grows_and_keeps_every_pair_reachable() {
        let mut pm: PairManager<()> = PairManager::default();
        for a in 0..40_u32 {
            for b in (a + 1)..40 {
                pm.add(a, b, ());
            }
        }
        assert_eq!(pm.len(), 40 * 39 / 2);
        assert!(pm.hash_size() >= pm.len());
        for a in 0..40_u32 {
            for b in (a + 1)..40 {
                assert!(pm.find(b, a).is_some(), "pair ({a}, {b}) lost after growth");
            }
        }
    }

    #[test]
    fn removal_relinks_moved_pair() {
        let mut pm: PairManager<u8> = PairManager::default();
        for b in 1..20_u32 {
            pm.add(0, b, 0);
        }
        assert!(pm.remove(0, 5));
        assert!(pm.remove(0, 19));
        assert!(pm.remove(0, 1));
        for b in 1..20_u32 {
            let present = pm.find(0, b).is_some();
            assert_eq!(present, !matches!(b, 1 | 5 | 19), "pair (0, {b})");
        }
    }

    #[test]
    fn remove_pairs_touching_ids() {
        let mut pm: PairManager<()> = PairManager::default();
        pm.add(0, 1, ());
        pm.add(1, 2, ());
        pm.add(2, 3, ());
        pm.add(3, 4, ());
        pm.remove_pairs_with(|id| id == 2);
        assert_eq!(pm.len(), 2);
        assert!(pm.find(0, 1).is_some());
        assert!(pm.find(3, 4).is_some());
    }

    #[test]
    fn overflow_drops_pairs() {
        let mut pm: PairManager<()> = PairManager::new(2, 0);
        assert!(pm.add(0, 1, ()).is_some());
        assert!(pm.add(0, 2, ()).is_some());
        assert!(pm.add(0, 3, ()).is_none());
        // Existing pairs are still found at capacity.
        assert_eq!(pm.add(0, 1, ()).map(|(_, new)| new), Some(false));
        assert_eq!(pm.len(), 2);
    }

    #[test]
    fn shrink_respects_floor() {
        let mut pm: PairManager<()> = PairManager::new(usize::MAX, 16);
        for b in 1..100_u32 {
            pm.add(0, b, ());
        }
        pm.retain(|p| p.id1 < 4);
        pm.shrink_memory();
        assert_eq!(pm.hash_size(), 16);
        assert_eq!(pm.len(), 3);
        assert!(pm.find(0, 3).is_some());
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash32(0), hash32(0));
        assert_ne!(pair_hash(1, 2), pair_hash(2, 1));
    }
}
