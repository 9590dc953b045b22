// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Multi box pruning: a region-partitioned broadphase.
//!
//! Space is split into user-provided regions. Each object is resident in every region it
//! touches, and each region runs box pruning over its residents. Overlaps found in any
//! region are merged into one pair table, so a pair seen in two regions is reported once.
//!
//! Objects that touch no region are reported through
//! [`out_of_bounds`][crate::BroadPhase::out_of_bounds] and take part in no pair until they
//! enter a region again.

mod region;

use core::fmt::Debug;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::bitmap::BitMap;
use crate::broadphase::{BroadPhase, CHECKED, UpdateData, validate_liveness};
use crate::error::{BroadPhaseError, Result};
use crate::pair_manager::PairManager;
use crate::pipeline::Executor;
use crate::types::{BpPair, Group, IntegerAabb};

use region::Region;

/// Upper bound on the number of regions.
pub const MAX_REGIONS: usize = 256;

bitflags::bitflags! {
    /// Per-frame state of an MBP pair.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MbpPairFlags: u8 {
        /// First found this frame.
        const NEW     = 0b01;
        /// Found again this frame.
        const UPDATED = 0b10;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    struct ObjectFlags: u8 {
        const LIVE         = 0b001;
        const STATIC       = 0b010;
        const FULLY_INSIDE = 0b100;
    }
}

/// Tuning knobs for [`Mbp`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MbpConfig {
    /// Maximum number of live regions, clamped to [`MAX_REGIONS`].
    pub max_regions: usize,
    /// Maximum number of live pairs; extra pairs are dropped with a warning.
    pub max_pairs: usize,
    /// Smallest pair-table size kept when the table shrinks.
    pub min_hash_capacity: usize,
    /// Maximum number of parallel region batches per update.
    pub max_tasks: usize,
}

impl Default for MbpConfig {
    fn default() -> Self {
        Self {
            max_regions: MAX_REGIONS,
            max_pairs: 1 << 24,
            min_hash_capacity: 64,
            max_tasks: 8,
        }
    }
}

impl MbpConfig {
    /// Set the maximum number of regions (at most [`MAX_REGIONS`]).
    pub fn with_max_regions(mut self, max_regions: usize) -> Self {
        self.max_regions = max_regions.min(MAX_REGIONS);
        self
    }

    /// Set the maximum number of live pairs.
    pub fn with_max_pairs(mut self, max_pairs: usize) -> Self {
        self.max_pairs = max_pairs;
        self
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct RegionHandle {
    region: u32,
    slot: u32,
}

#[derive(Clone, Debug, Default)]
struct MbpObject {
    bounds: IntegerAabb,
    handles: SmallVec<[RegionHandle; 4]>,
    flags: ObjectFlags,
}

#[derive(Debug)]
struct RegionSlot {
    bounds: IntegerAabb,
    overlaps_other: bool,
    region: Option<Region>,
}

/// Region-partitioned broadphase.
pub struct Mbp {
    config: MbpConfig,
    regions: Vec<RegionSlot>,
    free_regions: Vec<u32>,
    region_count: usize,
    objects: Vec<MbpObject>,
    object_count: usize,
    pairs: PairManager<MbpPairFlags>,
    updated: BitMap,
    removed: BitMap,
    created: Vec<BpPair>,
    deleted: Vec<BpPair>,
    out_of_bounds: Vec<u32>,
    /// Residents of removed regions, revisited by the next update.
    stripped: Vec<u32>,
}

impl Debug for Mbp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mbp")
            .field("regions", &self.region_count)
            .field("objects", &self.object_count)
            .field("pairs", &self.pairs.len())
            .finish_non_exhaustive()
    }
}

impl Default for Mbp {
    fn default() -> Self {
        Self::new(MbpConfig::default())
    }
}

impl Mbp {
    /// Create an engine without regions.
    pub fn new(config: MbpConfig) -> Self {
        let config = MbpConfig {
            max_regions: config.max_regions.min(MAX_REGIONS),
            ..config
        };
        Self {
            config,
            regions: Vec::new(),
            free_regions: Vec::new(),
            region_count: 0,
            objects: Vec::new(),
            object_count: 0,
            pairs: PairManager::new(config.max_pairs, config.min_hash_capacity),
            updated: BitMap::new(),
            removed: BitMap::new(),
            created: Vec::new(),
            deleted: Vec::new(),
            out_of_bounds: Vec::new(),
            stripped: Vec::new(),
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &MbpConfig {
        &self.config
    }

    /// Live regions as `(handle, bounds)`.
    pub fn regions(&self) -> impl Iterator<Item = (u32, IntegerAabb)> + '_ {
        self.regions.iter().enumerate().filter_map(|(i, slot)| {
            #[allow(
                clippy::cast_possible_truncation,
                reason = "Region handles are bounded by MAX_REGIONS."
            )]
            let handle = i as u32;
            slot.region.as_ref().map(|_| (handle, slot.bounds))
        })
    }

    /// Number of currently overlapping pairs.
    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// Whether `a` and `b` currently overlap.
    pub fn has_pair(&self, a: u32, b: u32) -> bool {
        self.pairs.find(a, b).is_some()
    }

    /// Number of regions box `h` is resident in.
    pub fn region_membership(&self, h: u32) -> usize {
        self.objects.get(h as usize).map_or(0, |o| o.handles.len())
    }

    fn ensure_capacity(&mut self, capacity: usize) {
        if self.objects.len() < capacity {
            self.objects.resize_with(capacity, MbpObject::default);
        }
        self.updated.resize(capacity);
        self.removed.resize(capacity);
    }

    fn refresh_region_overlaps(&mut self) {
        let live: Vec<(usize, IntegerAabb)> = self
            .regions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.region.is_some())
            .map(|(i, s)| (i, s.bounds))
            .collect();
        for &(i, bounds) in &live {
            self.regions[i].overlaps_other = live
                .iter()
                .any(|&(j, other)| j != i && bounds.overlaps_interior(&other));
        }
    }

    fn is_fully_inside(&self, bounds: &IntegerAabb, handles: &[RegionHandle]) -> bool {
        handles
            .iter()
            .any(|h| bounds.is_inside(&self.regions[h.region as usize].bounds))
    }

    fn add_object(&mut self, h: u32, bounds: IntegerAabb, group: Group) {
        let is_static = group.is_static();
        let mut handles = SmallVec::new();
        for (i, slot) in self.regions.iter_mut().enumerate() {
            if let Some(region) = &mut slot.region
                && slot.bounds.intersects(&bounds)
            {
                #[allow(
                    clippy::cast_possible_truncation,
                    reason = "Region handles are bounded by MAX_REGIONS."
                )]
                let region_index = i as u32;
                handles.push(RegionHandle {
                    region: region_index,
                    slot: region.add(h, bounds, is_static),
                });
            }
        }
        if handles.is_empty() {
            self.out_of_bounds.push(h);
        }
        let mut flags = ObjectFlags::LIVE;
        flags.set(ObjectFlags::STATIC, is_static);
        flags.set(ObjectFlags::FULLY_INSIDE, self.is_fully_inside(&bounds, &handles));
        self.objects[h as usize] = MbpObject { bounds, handles, flags };
        self.object_count += 1;
    }

    fn update_object(&mut self, h: u32, bounds: IntegerAabb) {
        let object = &mut self.objects[h as usize];
        object.bounds = bounds;
        let is_static = object.flags.contains(ObjectFlags::STATIC);

        // One region that overlaps no other and still contains the box: update in place.
        if let [only] = object.handles.as_slice() {
            let slot = &mut self.regions[only.region as usize];
            if !slot.overlaps_other
                && bounds.is_inside(&slot.bounds)
                && let Some(region) = &mut slot.region
            {
                region.update(only.slot, bounds);
                object.flags.insert(ObjectFlags::FULLY_INSIDE);
                return;
            }
        }

        let old = core::mem::take(&mut object.handles);
        let mut handles: SmallVec<[RegionHandle; 4]> = SmallVec::new();
        for (i, slot) in self.regions.iter_mut().enumerate() {
            let Some(region) = &mut slot.region else {
                continue;
            };
            #[allow(
                clippy::cast_possible_truncation,
                reason = "Region handles are bounded by MAX_REGIONS."
            )]
            let region_index = i as u32;
            let existing = old.iter().find(|rh| rh.region == region_index);
            match (slot.bounds.intersects(&bounds), existing) {
                (true, Some(rh)) => {
                    region.update(rh.slot, bounds);
                    handles.push(*rh);
                }
                (true, None) => handles.push(RegionHandle {
                    region: region_index,
                    slot: region.add(h, bounds, is_static),
                }),
                (false, Some(rh)) => region.remove(rh.slot),
                (false, None) => {}
            }
        }
        if handles.is_empty() && !old.is_empty() {
            self.out_of_bounds.push(h);
        }
        let fully_inside = self.is_fully_inside(&bounds, &handles);
        let object = &mut self.objects[h as usize];
        object.flags.set(ObjectFlags::FULLY_INSIDE, fully_inside);
        object.handles = handles;
    }

    fn remove_object(&mut self, h: u32) {
        let object = core::mem::take(&mut self.objects[h as usize]);
        for rh in object.handles {
            if let Some(region) = &mut self.regions[rh.region as usize].region {
                region.remove(rh.slot);
            }
        }
        self.object_count -= 1;
    }

    fn find_overlaps<E: Executor>(&mut self, groups: &[Group], exec: &E) {
        exec.for_each_batch(&mut self.regions, 1, self.config.max_tasks, |_, batch| {
            for slot in batch {
                if let Some(region) = &mut slot.region {
                    region.find_overlaps(groups);
                }
            }
        });
        for slot in &self.regions {
            let Some(region) = &slot.region else {
                continue;
            };
            for p in &region.found {
                if let Some((index, false)) = self.pairs.add(p.a, p.b, MbpPairFlags::NEW) {
                    self.pairs.state_mut(index).insert(MbpPairFlags::UPDATED);
                }
            }
        }
    }

    fn finalize(&mut self) {
        let (created, deleted) = (&mut self.created, &mut self.deleted);
        let (updated, removed) = (&self.updated, &self.removed);
        let touched = |id: u32| updated.test(id as usize) || removed.test(id as usize);
        self.pairs.retain(|p| {
            let pair = BpPair { a: p.id0, b: p.id1 };
            if p.state.contains(MbpPairFlags::NEW) {
                created.push(pair);
            } else if !p.state.contains(MbpPairFlags::UPDATED) && (touched(p.id0) || touched(p.id1)) {
                deleted.push(pair);
                return false;
            }
            p.state = MbpPairFlags::empty();
            true
        });
        self.pairs.shrink_memory();
    }
}

impl BroadPhase for Mbp {
    fn update<E: Executor>(&mut self, data: &UpdateData<'_>, exec: &E) {
        if CHECKED
            && let Err(err) = self.validate(data)
        {
            panic!("invalid broadphase update: {err}");
        }
        self.created.clear();
        self.deleted.clear();
        self.out_of_bounds.clear();
        self.ensure_capacity(data.capacity);

        for &h in data.removed {
            self.remove_object(h);
            self.removed.set(h as usize);
        }
        // Residents of a removed region may have lost pairs or every region.
        let mut stripped = core::mem::take(&mut self.stripped);
        stripped.sort_unstable();
        stripped.dedup();
        stripped.retain(|&h| self.objects[h as usize].flags.contains(ObjectFlags::LIVE));
        for &h in data.updated {
            self.update_object(h, data.bounds[h as usize]);
            self.updated.set(h as usize);
        }
        for &h in data.created {
            self.add_object(h, data.bounds[h as usize], data.groups[h as usize]);
            self.updated.set(h as usize);
        }
        for &h in &stripped {
            self.updated.set(h as usize);
            let object = &self.objects[h as usize];
            if object.handles.is_empty() {
                self.out_of_bounds.push(h);
            }
            for rh in &object.handles {
                if let Some(region) = &mut self.regions[rh.region as usize].region {
                    region.update(rh.slot, object.bounds);
                }
            }
        }

        self.find_overlaps(data.groups, exec);
        self.finalize();

        for &h in data.removed {
            self.removed.reset(h as usize);
        }
        for &h in data.updated.iter().chain(data.created).chain(&stripped) {
            self.updated.reset(h as usize);
        }
        stripped.clear();
        self.stripped = stripped;

        debug!(
            regions = self.region_count,
            created_boxes = data.created.len(),
            updated_boxes = data.updated.len(),
            removed_boxes = data.removed.len(),
            created_pairs = self.created.len(),
            deleted_pairs = self.deleted.len(),
            out_of_bounds = self.out_of_bounds.len(),
            "mbp update"
        );
    }

    fn created_pairs(&self) -> &[BpPair] {
        &self.created
    }

    fn deleted_pairs(&self) -> &[BpPair] {
        &self.deleted
    }

    fn out_of_bounds(&self) -> &[u32] {
        &self.out_of_bounds
    }

    fn free_buffers(&mut self) {
        self.created = Vec::new();
        self.deleted = Vec::new();
        self.out_of_bounds = Vec::new();
        for slot in &mut self.regions {
            if let Some(region) = &mut slot.region {
                region.free_buffers();
            }
        }
        self.pairs.shrink_memory();
    }

    fn shift_origin(&mut self, shift: [f32; 3], bounds: &[IntegerAabb]) {
        for slot in &mut self.regions {
            if slot.region.is_some() {
                slot.bounds = slot.bounds.shifted(shift);
            }
        }
        for (h, object) in self.objects.iter_mut().enumerate() {
            if object.flags.contains(ObjectFlags::LIVE) {
                object.bounds = bounds[h];
            }
        }
        let objects = &self.objects;
        for slot in &mut self.regions {
            if let Some(region) = &mut slot.region {
                region.reload_bounds(|owner| objects[owner as usize].bounds);
            }
        }
        self.refresh_region_overlaps();
    }

    fn validate(&self, data: &UpdateData<'_>) -> Result<()> {
        validate_liveness(data, |h| {
            self.objects
                .get(h as usize)
                .is_some_and(|o| o.flags.contains(ObjectFlags::LIVE))
        })
    }

    fn add_region(&mut self, bounds: IntegerAabb, populate: bool, _all_bounds: &[IntegerAabb]) -> Result<u32> {
        if self.region_count >= self.config.max_regions {
            warn!(max = self.config.max_regions, "region limit reached; region not added");
            return Err(BroadPhaseError::RegionLimit {
                max: self.config.max_regions,
            });
        }
        let slot = RegionSlot {
            bounds,
            overlaps_other: false,
            region: Some(Region::new()),
        };
        #[allow(
            clippy::cast_possible_truncation,
            reason = "Region handles are bounded by MAX_REGIONS."
        )]
        let handle = match self.free_regions.pop() {
            Some(handle) => {
                self.regions[handle as usize] = slot;
                handle
            }
            None => {
                self.regions.push(slot);
                (self.regions.len() - 1) as u32
            }
        };
        self.region_count += 1;
        self.refresh_region_overlaps();

        if populate {
            let RegionSlot { region, .. } = &mut self.regions[handle as usize];
            if let Some(region) = region {
                for (h, object) in self.objects.iter_mut().enumerate() {
                    if !object.flags.contains(ObjectFlags::LIVE)
                        || object.flags.contains(ObjectFlags::FULLY_INSIDE)
                        || !bounds.intersects(&object.bounds)
                    {
                        continue;
                    }
                    #[allow(
                        clippy::cast_possible_truncation,
                        reason = "Box handles are 32-bit."
                    )]
                    let owner = h as u32;
                    let slot = region.add(owner, object.bounds, object.flags.contains(ObjectFlags::STATIC));
                    object.handles.push(RegionHandle { region: handle, slot });
                    if object.bounds.is_inside(&bounds) {
                        object.flags.insert(ObjectFlags::FULLY_INSIDE);
                    }
                }
            }
        }
        debug!(handle, populate, regions = self.region_count, "mbp region added");
        Ok(handle)
    }

    fn remove_region(&mut self, handle: u32) -> Result<()> {
        let Some(slot) = self.regions.get_mut(handle as usize) else {
            return Err(BroadPhaseError::InvalidRegion(handle));
        };
        let Some(region) = slot.region.take() else {
            return Err(BroadPhaseError::InvalidRegion(handle));
        };
        for owner in region.owners() {
            self.objects[owner as usize].handles.retain(|rh| rh.region != handle);
            self.stripped.push(owner);
        }
        self.free_regions.push(handle);
        self.region_count -= 1;
        self.refresh_region_overlaps();
        let regions = &self.regions;
        for owner in region.owners() {
            let object = &mut self.objects[owner as usize];
            let inside = object
                .handles
                .iter()
                .any(|rh| object.bounds.is_inside(&regions[rh.region as usize].bounds));
            object.flags.set(ObjectFlags::FULLY_INSIDE, inside);
        }
        debug!(handle, regions = self.region_count, "mbp region removed");
        Ok(())
    }

    fn region_count(&self) -> usize {
        self.region_count
    }

    fn len(&self) -> usize {
        self.object_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::InlineExecutor;
    use crate::types::Bounds3;

    fn aabb(min: [f32; 3], max: [f32; 3]) -> IntegerAabb {
        IntegerAabb::encode(&Bounds3::new(min, max))
    }

    struct World {
        bounds: Vec<IntegerAabb>,
        groups: Vec<Group>,
    }

    impl World {
        fn run(&self, mbp: &mut Mbp, created: &[u32], updated: &[u32], removed: &[u32]) -> (Vec<BpPair>, Vec<BpPair>) {
            let data = UpdateData::new(created, updated, removed, &self.bounds, &self.groups);
            mbp.update(&data, &InlineExecutor);
            let mut c = mbp.created_pairs().to_vec();
            let mut d = mbp.deleted_pairs().to_vec();
            c.sort_unstable();
            d.sort_unstable();
            (c, d)
        }
    }

    fn two_regions() -> Mbp {
        let mut mbp = Mbp::default();
        mbp.add_region(aabb([-100.0; 3], [0.0, 100.0, 100.0]), false, &[]).unwrap();
        mbp.add_region(aabb([0.0, -100.0, -100.0], [100.0; 3]), false, &[]).unwrap();
        mbp
    }

    #[test]
    fn pair_across_regions_is_reported_once() {
        let mut mbp = two_regions();
        let w = World {
            bounds: vec![aabb([-1.0; 3], [1.0; 3]), aabb([-0.5; 3], [2.0; 3])],
            groups: vec![Group(1), Group(2)],
        };
        let (c, _) = w.run(&mut mbp, &[0, 1], &[], &[]);
        assert_eq!(c, vec![BpPair { a: 0, b: 1 }]);
        assert_eq!(mbp.region_membership(0), 2);
    }

    #[test]
    fn moving_apart_and_removal_delete_pairs() {
        let mut mbp = two_regions();
        let mut w = World {
            bounds: vec![
                aabb([10.0; 3], [12.0; 3]),
                aabb([11.0; 3], [13.0; 3]),
                aabb([11.5; 3], [14.0; 3]),
            ],
            groups: vec![Group(1), Group(2), Group(3)],
        };
        let (c, _) = w.run(&mut mbp, &[0, 1, 2], &[], &[]);
        assert_eq!(c.len(), 3);

        w.bounds[0] = aabb([-50.0; 3], [-40.0; 3]);
        let (c, d) = w.run(&mut mbp, &[], &[0], &[]);
        assert!(c.is_empty());
        assert_eq!(d, vec![BpPair { a: 0, b: 1 }, BpPair { a: 0, b: 2 }]);

        let (_, d) = w.run(&mut mbp, &[], &[], &[2]);
        assert_eq!(d, vec![BpPair { a: 1, b: 2 }]);
        assert_eq!(mbp.pair_count(), 0);
        assert_eq!(mbp.len(), 2);
    }

    #[test]
    fn statics_never_pair_with_statics() {
        let mut mbp = two_regions();
        let w = World {
            bounds: vec![aabb([1.0; 3], [2.0; 3]); 3],
            groups: vec![Group::STATIC, Group::STATIC, Group(4)],
        };
        let (c, _) = w.run(&mut mbp, &[0, 1, 2], &[], &[]);
        assert_eq!(c, vec![BpPair { a: 0, b: 2 }, BpPair { a: 1, b: 2 }]);
    }

    #[test]
    fn out_of_bounds_objects_are_reported() {
        let mut mbp = two_regions();
        let mut w = World {
            bounds: vec![aabb([500.0; 3], [501.0; 3]), aabb([1.0; 3], [2.0; 3])],
            groups: vec![Group(1), Group(2)],
        };
        w.run(&mut mbp, &[0, 1], &[], &[]);
        assert_eq!(mbp.out_of_bounds(), &[0]);

        w.bounds[1] = aabb([300.0; 3], [301.0; 3]);
        w.run(&mut mbp, &[], &[1], &[]);
        assert_eq!(mbp.out_of_bounds(), &[1]);

        w.run(&mut mbp, &[], &[], &[]);
        assert!(mbp.out_of_bounds().is_empty());
    }

    #[test]
    fn region_add_populates_and_remove_strips() {
        let mut mbp = Mbp::default();
        let w = World {
            bounds: vec![aabb([1.0; 3], [2.0; 3]), aabb([1.5; 3], [3.0; 3])],
            groups: vec![Group(1), Group(2)],
        };
        let (c, _) = w.run(&mut mbp, &[0, 1], &[], &[]);
        assert!(c.is_empty());
        assert_eq!(mbp.out_of_bounds(), &[0, 1]);

        let r = mbp.add_region(aabb([0.0; 3], [10.0; 3]), true, &w.bounds).unwrap();
        assert_eq!(mbp.region_membership(0), 1);
        let (c, _) = w.run(&mut mbp, &[], &[], &[]);
        assert_eq!(c, vec![BpPair { a: 0, b: 1 }]);

        mbp.remove_region(r).unwrap();
        assert_eq!(mbp.region_count(), 0);
        w.run(&mut mbp, &[], &[], &[]);
        assert_eq!(mbp.out_of_bounds(), &[0, 1]);
        assert_eq!(mbp.remove_region(r), Err(BroadPhaseError::InvalidRegion(r)));
    }

    #[test]
    fn region_limit_is_enforced() {
        let mut mbp = Mbp::new(MbpConfig::default().with_max_regions(1));
        assert!(mbp.add_region(aabb([0.0; 3], [1.0; 3]), false, &[]).is_ok());
        assert_eq!(
            mbp.add_region(aabb([2.0; 3], [3.0; 3]), false, &[]),
            Err(BroadPhaseError::RegionLimit { max: 1 })
        );
    }

    #[test]
    fn fast_path_keeps_pairs_in_isolated_region() {
        let mut mbp = Mbp::default();
        mbp.add_region(aabb([0.0; 3], [10.0; 3]), false, &[]).unwrap();
        let mut w = World {
            bounds: vec![aabb([1.0; 3], [2.0; 3]), aabb([1.5; 3], [3.0; 3])],
            groups: vec![Group(1), Group(2)],
        };
        w.run(&mut mbp, &[0, 1], &[], &[]);
        w.bounds[0] = aabb([1.2; 3], [2.2; 3]);
        let (c, d) = w.run(&mut mbp, &[], &[0], &[]);
        assert!(c.is_empty() && d.is_empty());
        assert!(mbp.has_pair(0, 1));
    }
}
