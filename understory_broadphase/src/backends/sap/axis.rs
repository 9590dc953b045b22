// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Sorted endpoint storage for one axis.

use crate::bitmap::BitMap;
use crate::radix::RadixSort;
use crate::types::{Group, IntegerAabb};

/// Owner id of the two sentinel endpoints.
pub(super) const SENTINEL: u32 = u32::MAX >> 1;
const SENTINEL_DATA: u32 = SENTINEL << 1;

#[inline(always)]
const fn owner(data: u32) -> u32 {
    data >> 1
}

#[inline(always)]
const fn is_max(data: u32) -> bool {
    data & 1 == 1
}

/// A one-axis overlap change found while moving endpoints.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) struct AxisEvent {
    pub(super) a: u32,
    pub(super) b: u32,
    pub(super) start: bool,
}

/// Endpoints of every live box along one axis, kept sorted by value.
///
/// Index 0 and the last index hold sentinels with values `0` and `u32::MAX`, so endpoint
/// moves never need bounds checks.
#[derive(Debug)]
pub(super) struct Axis {
    pub(super) values: Vec<u32>,
    pub(super) data: Vec<u32>,
    /// Per box handle: indices of its min and max endpoints.
    pub(super) box_ends: Vec<[u32; 2]>,
    pub(super) events: Vec<AxisEvent>,
    new_keys: Vec<u32>,
    new_data: Vec<u32>,
}

impl Axis {
    pub(super) fn new(capacity: usize, list_capacity: usize) -> Self {
        let mut values = Vec::with_capacity(capacity);
        let mut data = Vec::with_capacity(capacity);
        values.extend([0, u32::MAX]);
        data.extend([SENTINEL_DATA, SENTINEL_DATA]);
        Self {
            values,
            data,
            box_ends: Vec::new(),
            events: Vec::with_capacity(list_capacity),
            new_keys: Vec::new(),
            new_data: Vec::new(),
        }
    }

    /// Number of real endpoints.
    pub(super) fn endpoint_count(&self) -> usize {
        self.values.len() - 2
    }

    pub(super) fn ensure_capacity(&mut self, boxes: usize) {
        if self.box_ends.len() < boxes {
            self.box_ends.resize(boxes, [0, 0]);
        }
    }

    #[inline]
    fn place(&mut self, i: usize, value: u32, data: u32) {
        self.values[i] = value;
        self.data[i] = data;
        if owner(data) != SENTINEL {
            #[allow(
                clippy::cast_possible_truncation,
                reason = "Endpoint indices are bounded by twice the 32-bit box count."
            )]
            let idx = i as u32;
            self.box_ends[owner(data) as usize][usize::from(is_max(data))] = idx;
        }
    }

    /// Remove every endpoint owned by a flagged box, compacting from the first one.
    pub(super) fn remove_boxes(&mut self, removed: &[u32], flags: &BitMap) {
        let Some(first) = removed.iter().map(|&h| self.box_ends[h as usize][0] as usize).min()
        else {
            return;
        };
        let mut w = first;
        for r in first..self.values.len() {
            let d = self.data[r];
            if owner(d) != SENTINEL && flags.test(owner(d) as usize) {
                continue;
            }
            let v = self.values[r];
            self.place(w, v, d);
            w += 1;
        }
        self.values.truncate(w);
        self.data.truncate(w);
    }

    /// Move the endpoints of box `h` to its new bounds, recording one-axis events.
    pub(super) fn update_box(&mut self, axis: usize, h: u32, bounds: &[IntegerAabb], groups: &[Group]) {
        let b = &bounds[h as usize];
        let (new_min, new_max) = (b.min[axis], b.max[axis]);
        let [min_idx, max_idx] = self.box_ends[h as usize];
        let (old_min, old_max) = (self.values[min_idx as usize], self.values[max_idx as usize]);
        if new_min == old_min && new_max == old_max {
            return;
        }
        // Move the leading endpoint first so min and max never cross each other.
        if new_min > old_min {
            self.move_endpoint(h, true, new_max, bounds, groups);
            self.move_endpoint(h, false, new_min, bounds, groups);
        } else {
            self.move_endpoint(h, false, new_min, bounds, groups);
            self.move_endpoint(h, true, new_max, bounds, groups);
        }
    }

    fn move_endpoint(&mut self, h: u32, max: bool, value: u32, bounds: &[IntegerAabb], groups: &[Group]) {
        let mut i = self.box_ends[h as usize][usize::from(max)] as usize;
        let own = self.data[i];
        if value < self.values[i] {
            while self.values[i - 1] > value {
                let d = self.data[i - 1];
                // A min passing a max to its left starts an overlap; a max passing a min stops one.
                if is_max(d) != max {
                    self.push_event(h, owner(d), !max, bounds, groups);
                }
                let v = self.values[i - 1];
                self.place(i, v, d);
                i -= 1;
            }
        } else {
            while self.values[i + 1] < value {
                let d = self.data[i + 1];
                if is_max(d) != max {
                    self.push_event(h, owner(d), max, bounds, groups);
                }
                let v = self.values[i + 1];
                self.place(i, v, d);
                i += 1;
            }
        }
        self.place(i, value, own);
    }

    #[inline]
    fn push_event(&mut self, h: u32, other: u32, start: bool, bounds: &[IntegerAabb], groups: &[Group]) {
        if other == h || groups[h as usize] == groups[other as usize] {
            return;
        }
        if start && !bounds[h as usize].intersects(&bounds[other as usize]) {
            return;
        }
        self.events.push(AxisEvent { a: h, b: other, start });
    }

    /// Merge the endpoints of newly created boxes into the sorted array.
    pub(super) fn insert_boxes(&mut self, axis: usize, created: &[u32], bounds: &[IntegerAabb], radix: &mut RadixSort) {
        if created.is_empty() {
            return;
        }
        self.new_keys.clear();
        self.new_data.clear();
        for &h in created {
            let b = &bounds[h as usize];
            self.new_keys.extend([b.min[axis], b.max[axis]]);
            self.new_data.extend([h << 1, (h << 1) | 1]);
        }
        let ranks = radix.sort_u32(&self.new_keys);

        let old_len = self.values.len();
        let new_len = old_len + self.new_keys.len();
        self.values.resize(new_len, 0);
        self.data.resize(new_len, SENTINEL_DATA);
        self.place(new_len - 1, u32::MAX, SENTINEL_DATA);

        // Merge from the back; `r` walks old endpoints, `j` new ones.
        let mut r = old_len - 2;
        let mut w = new_len - 2;
        let mut j = ranks.len();
        while j > 0 {
            let k = ranks[j - 1] as usize;
            let nv = self.new_keys[k];
            if r > 0 && self.values[r] > nv {
                let (v, d) = (self.values[r], self.data[r]);
                self.place(w, v, d);
                r -= 1;
            } else {
                let d = self.new_data[k];
                self.place(w, nv, d);
                j -= 1;
            }
            w -= 1;
        }
        debug_assert_eq!(w, r, "merge must end where the untouched prefix begins");
    }

    /// Reload endpoint values from shifted bounds and repair any order inversions.
    pub(super) fn shift(&mut self, axis: usize, bounds: &[IntegerAabb]) {
        let last = self.values.len() - 1;
        for i in 1..last {
            let d = self.data[i];
            let b = &bounds[owner(d) as usize];
            self.values[i] = if is_max(d) { b.max[axis] } else { b.min[axis] };
        }
        for i in 2..last {
            let prev = self.values[i - 1];
            if self.values[i] < prev {
                let same_kind = is_max(self.data[i - 1]) == is_max(self.data[i]);
                self.values[i] = prev + u32::from(!same_kind);
            }
        }
    }

    /// Whether values are sorted and `box_ends` points back at each box's endpoints.
    pub(super) fn is_consistent(&self, live: &BitMap) -> bool {
        if self.values.windows(2).any(|w| w[0] > w[1]) {
            return false;
        }
        let last = self.values.len() - 1;
        for i in 1..last {
            let d = self.data[i];
            let o = owner(d) as usize;
            if !live.test(o) || self.box_ends[o][usize::from(is_max(d))] as usize != i {
                return false;
            }
            if !is_max(d) && self.box_ends[o][0] >= self.box_ends[o][1] {
                return false;
            }
        }
        true
    }

    pub(super) fn free_buffers(&mut self, list_capacity: usize) {
        self.events = Vec::with_capacity(list_capacity);
        self.new_keys = Vec::new();
        self.new_data = Vec::new();
    }
}
