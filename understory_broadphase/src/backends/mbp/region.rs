// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Box pruning inside one region of space.

use core::fmt::Debug;

use crate::radix::RadixSort;
use crate::sweep;
use crate::types::{BpPair, Group, IntegerAabb};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Kind {
    Static,
    Dynamic,
}

#[derive(Copy, Clone, Debug)]
struct Entry {
    index: u32,
    owner: u32,
    kind: Kind,
}

/// Parallel arrays of boxes, each remembering the entry slot that points at it.
#[derive(Debug, Default)]
struct BoxList {
    bounds: Vec<IntegerAabb>,
    owners: Vec<u32>,
    slots: Vec<u32>,
}

impl BoxList {
    fn len(&self) -> usize {
        self.bounds.len()
    }

    fn push(&mut self, bounds: IntegerAabb, owner: u32, slot: u32) -> u32 {
        self.bounds.push(bounds);
        self.owners.push(owner);
        self.slots.push(slot);
        #[allow(
            clippy::cast_possible_truncation,
            reason = "Region populations are bounded by 32-bit box handles."
        )]
        let index = (self.bounds.len() - 1) as u32;
        index
    }

    fn swap(&mut self, a: usize, b: usize, entries: &mut [Entry]) {
        if a == b {
            return;
        }
        self.bounds.swap(a, b);
        self.owners.swap(a, b);
        self.slots.swap(a, b);
        #[allow(
            clippy::cast_possible_truncation,
            reason = "Region populations are bounded by 32-bit box handles."
        )]
        {
            entries[self.slots[a] as usize].index = a as u32;
            entries[self.slots[b] as usize].index = b as u32;
        }
    }

    fn swap_remove(&mut self, i: usize, entries: &mut [Entry]) {
        self.bounds.swap_remove(i);
        self.owners.swap_remove(i);
        self.slots.swap_remove(i);
        if i < self.slots.len() {
            #[allow(
                clippy::cast_possible_truncation,
                reason = "Region populations are bounded by 32-bit box handles."
            )]
            {
                entries[self.slots[i] as usize].index = i as u32;
            }
        }
    }
}

/// Box with its owner, in a list sorted by min x.
#[derive(Copy, Clone, Debug)]
struct SortedBox {
    bounds: IntegerAabb,
    owner: u32,
}

impl SortedBox {
    #[inline]
    fn x(&self) -> (u32, u32) {
        (self.bounds.min[0], self.bounds.max[0])
    }
}

/// Boxes resident in one region, split into statics and dynamics.
///
/// Dynamics keep the boxes updated this frame in a prefix `[0, updated)`. Sleeping boxes
/// (the rest) are cached in min-x order and only resorted when the sleeping set changes.
pub(super) struct Region {
    entries: Vec<Entry>,
    free_entries: Vec<u32>,
    statics: BoxList,
    dynamics: BoxList,
    updated: usize,
    prev_updated: usize,
    statics_dirty: bool,
    needs_sorting_sleeping: bool,
    sorted_statics: Vec<SortedBox>,
    sorted_sleeping: Vec<SortedBox>,
    sorted_updated: Vec<SortedBox>,
    keys: Vec<u32>,
    radix: RadixSort,
    /// Pairs found by the last [`find_overlaps`][Self::find_overlaps].
    pub(super) found: Vec<BpPair>,
}

impl Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("statics", &self.statics.len())
            .field("dynamics", &self.dynamics.len())
            .field("updated", &self.updated)
            .finish_non_exhaustive()
    }
}

impl Region {
    pub(super) fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_entries: Vec::new(),
            statics: BoxList::default(),
            dynamics: BoxList::default(),
            updated: 0,
            prev_updated: 0,
            statics_dirty: false,
            needs_sorting_sleeping: false,
            sorted_statics: Vec::new(),
            sorted_sleeping: Vec::new(),
            sorted_updated: Vec::new(),
            keys: Vec::new(),
            radix: RadixSort::new(),
            found: Vec::new(),
        }
    }

    /// Number of resident boxes.
    pub(super) fn len(&self) -> usize {
        self.statics.len() + self.dynamics.len()
    }

    /// Owners of every resident box.
    pub(super) fn owners(&self) -> impl Iterator<Item = u32> + '_ {
        self.statics.owners.iter().chain(&self.dynamics.owners).copied()
    }

    /// Add a box; dynamic boxes start out updated. Returns the entry slot.
    pub(super) fn add(&mut self, owner: u32, bounds: IntegerAabb, is_static: bool) -> u32 {
        let entry = Entry {
            index: 0,
            owner,
            kind: if is_static { Kind::Static } else { Kind::Dynamic },
        };
        #[allow(
            clippy::cast_possible_truncation,
            reason = "Region populations are bounded by 32-bit box handles."
        )]
        let slot = match self.free_entries.pop() {
            Some(slot) => {
                self.entries[slot as usize] = entry;
                slot
            }
            None => {
                self.entries.push(entry);
                (self.entries.len() - 1) as u32
            }
        };
        if is_static {
            self.entries[slot as usize].index = self.statics.push(bounds, owner, slot);
            self.statics_dirty = true;
        } else {
            let i = self.dynamics.push(bounds, owner, slot);
            self.entries[slot as usize].index = i;
            self.promote(i as usize);
        }
        slot
    }

    /// Move the dynamic box at `i` into the updated prefix.
    fn promote(&mut self, i: usize) {
        if i < self.updated {
            return;
        }
        if i >= self.prev_updated {
            self.needs_sorting_sleeping = true;
        }
        self.dynamics.swap(i, self.updated, &mut self.entries);
        self.updated += 1;
    }

    /// Store new bounds for the box in `slot` and mark it updated.
    pub(super) fn update(&mut self, slot: u32, bounds: IntegerAabb) {
        let Entry { index, kind, .. } = self.entries[slot as usize];
        match kind {
            Kind::Static => {
                self.statics.bounds[index as usize] = bounds;
                self.statics_dirty = true;
            }
            Kind::Dynamic => {
                self.dynamics.bounds[index as usize] = bounds;
                self.promote(index as usize);
            }
        }
    }

    /// Remove the box in `slot`.
    pub(super) fn remove(&mut self, slot: u32) {
        let Entry { index, kind, owner } = self.entries[slot as usize];
        debug_assert_ne!(owner, u32::MAX, "region entry removed twice");
        match kind {
            Kind::Static => {
                self.statics.swap_remove(index as usize, &mut self.entries);
                self.statics_dirty = true;
            }
            Kind::Dynamic => {
                let mut i = index as usize;
                if i < self.updated {
                    self.dynamics.swap(i, self.updated - 1, &mut self.entries);
                    i = self.updated - 1;
                    self.updated -= 1;
                }
                self.dynamics.swap_remove(i, &mut self.entries);
                self.needs_sorting_sleeping = true;
            }
        }
        self.entries[slot as usize].owner = u32::MAX;
        self.free_entries.push(slot);
    }

    /// Reload stored bounds after an origin shift. Every sorted cache is rebuilt.
    pub(super) fn reload_bounds(&mut self, bounds_of: impl Fn(u32) -> IntegerAabb) {
        for list in [&mut self.statics, &mut self.dynamics] {
            for (b, &owner) in list.bounds.iter_mut().zip(&list.owners) {
                *b = bounds_of(owner);
            }
        }
        self.needs_sorting_sleeping = true;
        self.resort_statics();
    }

    fn sort_into(radix: &mut RadixSort, keys: &mut Vec<u32>, list: &BoxList, range: core::ops::Range<usize>, out: &mut Vec<SortedBox>) {
        keys.clear();
        keys.extend(list.bounds[range.clone()].iter().map(|b| b.min[0]));
        out.clear();
        for &r in radix.sort_u32(keys) {
            let i = range.start + r as usize;
            out.push(SortedBox {
                bounds: list.bounds[i],
                owner: list.owners[i],
            });
        }
    }

    fn resort_statics(&mut self) {
        Self::sort_into(
            &mut self.radix,
            &mut self.keys,
            &self.statics,
            0..self.statics.len(),
            &mut self.sorted_statics,
        );
    }

    /// Collect the pairs involving boxes updated since the last call into [`found`][Self::found].
    ///
    /// Updated boxes are tested against each other, against sleeping boxes, and against
    /// statics. When statics changed, sleeping boxes are tested against statics too.
    pub(super) fn find_overlaps(&mut self, groups: &[Group]) {
        self.found.clear();
        let dynamics_total = self.dynamics.len();

        if self.statics_dirty {
            self.resort_statics();
        }
        if self.updated != self.prev_updated {
            self.needs_sorting_sleeping = true;
        }
        if self.needs_sorting_sleeping {
            Self::sort_into(
                &mut self.radix,
                &mut self.keys,
                &self.dynamics,
                self.updated..dynamics_total,
                &mut self.sorted_sleeping,
            );
            self.needs_sorting_sleeping = false;
        }
        Self::sort_into(
            &mut self.radix,
            &mut self.keys,
            &self.dynamics,
            0..self.updated,
            &mut self.sorted_updated,
        );

        let found = &mut self.found;
        let mut report = |a: &SortedBox, b: &SortedBox| {
            if a.bounds.intersects_yz(&b.bounds) && groups[a.owner as usize] != groups[b.owner as usize] {
                found.push(BpPair::ordered(a.owner, b.owner));
            }
        };

        sweep::complete(&self.sorted_updated, SortedBox::x, &mut report);
        sweep::bipartite(&self.sorted_updated, &self.sorted_sleeping, SortedBox::x, SortedBox::x, &mut report);
        sweep::bipartite(&self.sorted_updated, &self.sorted_statics, SortedBox::x, SortedBox::x, &mut report);
        if self.statics_dirty {
            sweep::bipartite(&self.sorted_sleeping, &self.sorted_statics, SortedBox::x, SortedBox::x, &mut report);
        }

        self.statics_dirty = false;
        self.prev_updated = self.updated;
        self.updated = 0;
    }

    pub(super) fn free_buffers(&mut self) {
        self.found = Vec::new();
        self.sorted_updated = Vec::new();
        self.keys = Vec::new();
        self.radix.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bounds3;

    fn aabb(lo: f32, hi: f32) -> IntegerAabb {
        IntegerAabb::encode(&Bounds3::new([lo; 3], [hi; 3]))
    }

    fn found(region: &Region) -> Vec<BpPair> {
        let mut f = region.found.clone();
        f.sort_unstable();
        f
    }

    #[test]
    fn updated_boxes_pair_with_all_kinds() {
        let groups = [Group(0), Group(1), Group(2), Group(3)];
        let mut r = Region::new();
        r.add(0, aabb(0.0, 10.0), true);
        let s1 = r.add(1, aabb(1.0, 2.0), false);
        r.add(2, aabb(5.0, 6.0), false);
        r.find_overlaps(&groups);
        assert_eq!(found(&r), vec![BpPair { a: 0, b: 1 }, BpPair { a: 0, b: 2 }]);

        // Nothing moved: nothing is retested.
        r.find_overlaps(&groups);
        assert!(found(&r).is_empty());

        r.update(s1, aabb(5.5, 7.0));
        r.add(3, aabb(6.5, 8.0), false);
        r.find_overlaps(&groups);
        assert_eq!(
            found(&r),
            vec![BpPair { a: 0, b: 1 }, BpPair { a: 0, b: 3 }, BpPair { a: 1, b: 2 }, BpPair { a: 1, b: 3 }]
        );
    }

    #[test]
    fn moving_a_static_retests_sleepers() {
        let groups = [Group(0), Group(1)];
        let mut r = Region::new();
        let s0 = r.add(0, aabb(0.0, 1.0), true);
        r.add(1, aabb(5.0, 6.0), false);
        r.find_overlaps(&groups);
        assert!(found(&r).is_empty());
        r.update(s0, aabb(4.0, 5.5));
        r.find_overlaps(&groups);
        assert_eq!(found(&r), vec![BpPair { a: 0, b: 1 }]);
    }

    #[test]
    fn removal_keeps_slots_consistent() {
        let groups = [Group(1), Group(2), Group(3)];
        let mut r = Region::new();
        let a = r.add(0, aabb(0.0, 1.0), false);
        let b = r.add(1, aabb(0.5, 1.5), false);
        let c = r.add(2, aabb(1.2, 3.0), false);
        r.find_overlaps(&groups);
        r.remove(a);
        r.update(c, aabb(1.0, 2.0));
        r.find_overlaps(&groups);
        assert_eq!(found(&r), vec![BpPair { a: 1, b: 2 }]);
        r.remove(b);
        r.remove(c);
        assert_eq!(r.len(), 0);
        assert_eq!(r.add(2, aabb(0.0, 1.0), false), c);
    }
}
