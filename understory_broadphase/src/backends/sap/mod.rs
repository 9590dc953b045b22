// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Incremental sweep-and-prune.
//!
//! Every live box has two endpoints on each of the three axes. Each axis keeps its
//! endpoints sorted; moving a box bubbles its endpoints to their new place and every
//! crossing of a min over a max is an overlap change along that axis. The crossings are
//! confirmed against the boxes' final bounds and folded into a persistent pair table.
//!
//! The three axes are independent during the move pass, so they run through the
//! executor's [`join`][crate::Executor::join]. The resulting events are replayed in axis
//! order, which makes the last event per pair decide its state.
//!
//! New boxes are merged into the sorted arrays in one batch and paired by box pruning
//! along the first axis, which is cheaper than bubbling each endpoint in from infinity.

mod axis;
mod pairs;

use core::fmt::Debug;

use tracing::debug;

use crate::bitmap::BitMap;
use crate::broadphase::{BroadPhase, CHECKED, UpdateData, validate_liveness};
use crate::error::Result;
use crate::pipeline::Executor;
use crate::radix::RadixSort;
use crate::sweep;
use crate::types::{BpPair, Group, IntegerAabb};

use axis::Axis;
use pairs::SapPairs;

/// Tuning knobs for [`Sap`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SapConfig {
    /// Maximum number of live pairs; extra pairs are dropped with a warning.
    pub max_pairs: usize,
    /// Smallest pair-table size kept when the table shrinks.
    pub min_hash_capacity: usize,
    /// Initial endpoint capacity per axis.
    pub data_capacity: usize,
    /// Default capacity of the created and deleted pair lists.
    pub pair_list_capacity: usize,
    /// Default capacity of the per-axis event lists.
    pub axis_list_capacity: usize,
}

impl Default for SapConfig {
    fn default() -> Self {
        Self {
            max_pairs: 1 << 24,
            min_hash_capacity: 64,
            data_capacity: 1024,
            pair_list_capacity: 64,
            axis_list_capacity: 8192,
        }
    }
}

impl SapConfig {
    /// Set the maximum number of live pairs.
    pub fn with_max_pairs(mut self, max_pairs: usize) -> Self {
        self.max_pairs = max_pairs;
        self
    }

    /// Set the smallest pair-table size kept when buffers are freed.
    pub fn with_min_hash_capacity(mut self, capacity: usize) -> Self {
        self.min_hash_capacity = capacity;
        self
    }

    /// Set the initial endpoint capacity per axis.
    pub fn with_data_capacity(mut self, capacity: usize) -> Self {
        self.data_capacity = capacity;
        self
    }
}

/// Box used by the creation pruning pass: endpoint indices per axis.
#[derive(Copy, Clone, Debug)]
struct PruneBox {
    owner: u32,
    min: [u32; 3],
    max: [u32; 3],
}

impl PruneBox {
    #[inline]
    fn x(&self) -> (u32, u32) {
        (self.min[0], self.max[0])
    }

    #[inline]
    fn overlaps_yz(&self, other: &Self) -> bool {
        (1..3).all(|a| self.min[a] < other.max[a] && other.min[a] < self.max[a])
    }
}

/// Sweep-and-prune broadphase over three sorted endpoint axes.
pub struct Sap {
    config: SapConfig,
    axes: [Axis; 3],
    pairs: SapPairs,
    live: BitMap,
    groups: Vec<Group>,
    box_count: usize,
    created: Vec<BpPair>,
    deleted: Vec<BpPair>,
    radix: RadixSort,
    flags: BitMap,
    prune_new: Vec<PruneBox>,
    prune_old: Vec<PruneBox>,
}

impl Debug for Sap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Sap")
            .field("boxes", &self.box_count)
            .field("pairs", &self.pairs.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for Sap {
    fn default() -> Self {
        Self::new(SapConfig::default())
    }
}

impl Sap {
    /// Create an empty engine.
    pub fn new(config: SapConfig) -> Self {
        let axis = || Axis::new(config.data_capacity, config.axis_list_capacity);
        Self {
            config,
            axes: [axis(), axis(), axis()],
            pairs: SapPairs::new(config.max_pairs, config.min_hash_capacity, config.pair_list_capacity),
            live: BitMap::new(),
            groups: Vec::new(),
            box_count: 0,
            created: Vec::with_capacity(config.pair_list_capacity),
            deleted: Vec::with_capacity(config.pair_list_capacity),
            radix: RadixSort::new(),
            flags: BitMap::new(),
            prune_new: Vec::new(),
            prune_old: Vec::new(),
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &SapConfig {
        &self.config
    }

    /// Number of currently overlapping pairs.
    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Iterate over currently overlapping pairs.
    pub fn pairs(&self) -> impl Iterator<Item = BpPair> + '_ {
        self.pairs.iter()
    }

    /// Whether `a` and `b` currently overlap.
    pub fn has_pair(&self, a: u32, b: u32) -> bool {
        self.pairs.contains(a, b)
    }

    /// Check the sorted order, the endpoint back-references, and the pair table against a
    /// brute-force overlap test on the stored endpoints. Quadratic; meant for tests.
    pub fn is_self_consistent(&self) -> bool {
        if !self.axes.iter().all(|a| a.is_consistent(&self.live)) {
            return false;
        }
        if self.axes.iter().any(|a| a.endpoint_count() != 2 * self.box_count) {
            return false;
        }
        #[allow(
            clippy::cast_possible_truncation,
            reason = "Box handles are 32-bit."
        )]
        let live: Vec<u32> = self.live.iter().map(|h| h as u32).collect();
        let mut expected = 0;
        for (i, &a) in live.iter().enumerate() {
            for &b in &live[i + 1..] {
                if self.groups[a as usize] == self.groups[b as usize] {
                    continue;
                }
                let overlap = self.axes.iter().all(|axis| {
                    let ea = axis.box_ends[a as usize];
                    let eb = axis.box_ends[b as usize];
                    ea[0] < eb[1] && eb[0] < ea[1]
                });
                if overlap != self.pairs.contains(a, b) {
                    return false;
                }
                expected += usize::from(overlap);
            }
        }
        expected == self.pairs.len()
    }

    fn ensure_capacity(&mut self, capacity: usize) {
        for axis in &mut self.axes {
            axis.ensure_capacity(capacity);
        }
        if self.groups.len() < capacity {
            self.groups.resize(capacity, Group::INVALID);
        }
        self.live.resize(capacity);
    }

    fn batch_remove(&mut self, removed: &[u32]) {
        if removed.is_empty() {
            return;
        }
        for &h in removed {
            self.flags.set(h as usize);
        }
        for axis in &mut self.axes {
            axis.remove_boxes(removed, &self.flags);
        }
        self.pairs.remove_boxes(&self.flags, &mut self.deleted);
        for &h in removed {
            self.live.reset(h as usize);
            self.flags.reset(h as usize);
            self.groups[h as usize] = Group::INVALID;
        }
        self.box_count -= removed.len();
    }

    fn batch_update<E: Executor>(&mut self, data: &UpdateData<'_>, exec: &E) {
        if data.updated.is_empty() {
            return;
        }
        let [a0, a1, a2] = &mut self.axes;
        let run = |axis: &mut Axis, index: usize| {
            for &h in data.updated {
                axis.update_box(index, h, data.bounds, data.groups);
            }
        };
        exec.join(|| run(a0, 0), || exec.join(|| run(a1, 1), || run(a2, 2)));

        for axis in &mut self.axes {
            for ev in axis.events.drain(..) {
                if ev.start {
                    self.pairs.add_pair(ev.a, ev.b, data.groups);
                } else {
                    self.pairs.remove_pair(ev.a, ev.b);
                }
            }
        }
    }

    fn batch_create(&mut self, data: &UpdateData<'_>) {
        let created = data.created;
        if created.is_empty() {
            return;
        }
        for &h in created {
            self.live.set(h as usize);
            self.groups[h as usize] = data.groups[h as usize];
        }
        for (index, axis) in self.axes.iter_mut().enumerate() {
            axis.insert_boxes(index, created, data.bounds, &mut self.radix);
        }
        self.box_count += created.len();

        let prune_box = |axes: &[Axis; 3], h: u32| {
            let e = [axes[0].box_ends[h as usize], axes[1].box_ends[h as usize], axes[2].box_ends[h as usize]];
            PruneBox {
                owner: h,
                min: [e[0][0], e[1][0], e[2][0]],
                max: [e[0][1], e[1][1], e[2][1]],
            }
        };

        // New boxes sorted by their axis-0 min endpoint.
        self.prune_new.clear();
        let keys: Vec<u32> = created.iter().map(|&h| self.axes[0].box_ends[h as usize][0]).collect();
        for &r in self.radix.sort_u32(&keys) {
            self.prune_new.push(prune_box(&self.axes, created[r as usize]));
        }

        let groups = data.groups;
        let all_static = created.iter().all(|&h| groups[h as usize].is_static());
        let pairs = &mut self.pairs;
        if !all_static {
            sweep::complete(&self.prune_new, PruneBox::x, |a, b| {
                if a.overlaps_yz(b) {
                    pairs.add_pair(a.owner, b.owner, groups);
                }
            });
        }

        // Old boxes overlapping the union of the new ones along axis 0, already in min order.
        let union_min = self.prune_new.iter().map(|b| b.min[0]).min().unwrap_or(0);
        let union_max = self.prune_new.iter().map(|b| b.max[0]).max().unwrap_or(0);
        for h in created {
            self.flags.set(*h as usize);
        }
        self.prune_old.clear();
        let axis0 = &self.axes[0];
        for i in 1..union_max as usize {
            let d = axis0.data[i];
            let owner = d >> 1;
            if d & 1 == 1 || self.flags.test(owner as usize) {
                continue;
            }
            if axis0.box_ends[owner as usize][1] > union_min {
                self.prune_old.push(prune_box(&self.axes, owner));
            }
        }
        for h in created {
            self.flags.reset(*h as usize);
        }

        sweep::bipartite(&self.prune_new, &self.prune_old, PruneBox::x, PruneBox::x, |a, b| {
            if a.overlaps_yz(b) {
                pairs.add_pair(a.owner, b.owner, groups);
            }
        });
    }
}

impl BroadPhase for Sap {
    fn update<E: Executor>(&mut self, data: &UpdateData<'_>, exec: &E) {
        if CHECKED
            && let Err(err) = self.validate(data)
        {
            panic!("invalid broadphase update: {err}");
        }
        self.created.clear();
        self.deleted.clear();
        self.ensure_capacity(data.capacity);

        self.batch_remove(data.removed);
        self.batch_update(data, exec);
        self.batch_create(data);
        self.pairs.compute_created_deleted(&mut self.created, &mut self.deleted);

        debug!(
            created_boxes = data.created.len(),
            updated_boxes = data.updated.len(),
            removed_boxes = data.removed.len(),
            created_pairs = self.created.len(),
            deleted_pairs = self.deleted.len(),
            "sap update"
        );
    }

    fn created_pairs(&self) -> &[BpPair] {
        &self.created
    }

    fn deleted_pairs(&self) -> &[BpPair] {
        &self.deleted
    }

    fn free_buffers(&mut self) {
        let cfg = self.config;
        self.created = Vec::with_capacity(cfg.pair_list_capacity);
        self.deleted = Vec::with_capacity(cfg.pair_list_capacity);
        for axis in &mut self.axes {
            axis.free_buffers(cfg.axis_list_capacity);
        }
        self.pairs.shrink(cfg.pair_list_capacity);
        self.radix.reset();
        self.prune_new = Vec::new();
        self.prune_old = Vec::new();
    }

    fn shift_origin(&mut self, _shift: [f32; 3], bounds: &[IntegerAabb]) {
        for (index, axis) in self.axes.iter_mut().enumerate() {
            axis.shift(index, bounds);
        }
    }

    fn validate(&self, data: &UpdateData<'_>) -> Result<()> {
        validate_liveness(data, |h| self.live.test(h as usize))
    }

    fn len(&self) -> usize {
        self.box_count
    }
}
