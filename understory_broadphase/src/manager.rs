// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The AABB manager: shapes, actors, and aggregates on top of a broadphase engine.
//!
//! The manager owns the mapping from user volumes to broadphase boxes. Single volumes get
//! one box each. An aggregate gets one box covering all of its shapes; when that box
//! overlaps something, the aggregate's shapes are resolved against the other side and
//! only shape-level pairs are reported.
//!
//! Bounds changes are batched: [`set_volume_bounds`][AabbManagerGeneric::set_volume_bounds]
//! and [`mark_dirty`][AabbManagerGeneric::mark_dirty] only record what changed, and
//! [`update_aabbs_and_bp`][AabbManagerGeneric::update_aabbs_and_bp] runs the whole
//! pipeline once.

use core::fmt::Debug;

use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::aggregate::{self, PairDiff, SortedElement};
use crate::arena::FrameArena;
use crate::backends::{Mbp, Sap};
use crate::bitmap::{BitMap, PairBitmap, SelfCollisionBitmap};
use crate::broadphase::{BroadPhase, UpdateData};
use crate::error::{BroadPhaseError, Result};
use crate::pipeline::{DefaultExecutor, Executor, Stage};
use crate::radix::RadixSort;
use crate::slot_map::{SlotKey, SlotMap};
use crate::types::{Bounds3, BpPair, Group, IntegerAabb};

/// Hard cap on the number of shapes per aggregate.
pub const MAX_AGGREGATE_SHAPES: usize = 128;

/// Handle to a volume: a single shape or a shape inside an aggregate.
///
/// The low bit of the tagged id says whether the volume is aggregated. Handles go stale
/// when their volume is released.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VolumeHandle {
    tagged: u32,
    generation: u32,
}

impl VolumeHandle {
    fn single(key: SlotKey) -> Self {
        Self {
            tagged: key.index << 1,
            generation: key.generation,
        }
    }

    fn aggregated(key: SlotKey) -> Self {
        Self {
            tagged: (key.index << 1) | 1,
            generation: key.generation,
        }
    }

    /// Whether the volume belongs to an aggregate.
    pub const fn is_aggregated(self) -> bool {
        self.tagged & 1 == 1
    }

    const fn key(self) -> SlotKey {
        SlotKey {
            index: self.tagged >> 1,
            generation: self.generation,
        }
    }
}

/// Handle to an actor inside an aggregate: the shapes of one rigid body.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ActorHandle(SlotKey);

/// Handle to an aggregate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AggregateId(SlotKey);

/// Tuning knobs for the manager.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Smallest batch a stage hands to a parallel task.
    pub min_batch_size: usize,
    /// Maximum number of parallel tasks per stage.
    pub max_tasks: usize,
    /// Maximum number of live shapes per aggregate, clamped to [`MAX_AGGREGATE_SHAPES`].
    pub max_aggregate_shapes: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 128,
            max_tasks: 8,
            max_aggregate_shapes: MAX_AGGREGATE_SHAPES,
        }
    }
}

impl ManagerConfig {
    /// Set the smallest parallel batch.
    pub fn with_min_batch_size(mut self, min_batch_size: usize) -> Self {
        self.min_batch_size = min_batch_size;
        self
    }

    /// Set the maximum number of parallel tasks per stage.
    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    /// Set the per-aggregate shape limit (at most [`MAX_AGGREGATE_SHAPES`]).
    pub fn with_max_aggregate_shapes(mut self, max: usize) -> Self {
        self.max_aggregate_shapes = max.min(MAX_AGGREGATE_SHAPES);
        self
    }
}

/// World geometry queried during an update.
///
/// `U` is the userdata given to [`create_volume`][AabbManagerGeneric::create_volume].
/// The defaults treat every actor frame as the world frame.
pub trait BoundsSource<U> {
    /// World bounds of a shape.
    fn shape_bounds(&self, shape: U) -> Bounds3;

    /// Bounds of a shape in the frame of the actor that owns it.
    fn shape_local_bounds(&self, shape: U) -> Bounds3 {
        self.shape_bounds(shape)
    }

    /// World bounds of an actor-local box, using the pose of the actor that owns `shape`.
    fn actor_world_bounds(&self, shape: U, local: &Bounds3) -> Bounds3 {
        let _ = shape;
        *local
    }
}

/// Two volumes, identified by their userdata.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumePair<U> {
    /// First volume.
    pub a: U,
    /// Second volume.
    pub b: U,
}

/// Output of one update.
#[derive(Clone, Debug)]
pub struct Overlaps<U> {
    created: Vec<VolumePair<U>>,
    deleted: Vec<VolumePair<U>>,
    out_of_bounds: Vec<U>,
    out_of_bounds_aggregates: Vec<AggregateId>,
}

impl<U> Default for Overlaps<U> {
    fn default() -> Self {
        Self {
            created: Vec::new(),
            deleted: Vec::new(),
            out_of_bounds: Vec::new(),
            out_of_bounds_aggregates: Vec::new(),
        }
    }
}

impl<U> Overlaps<U> {
    /// Pairs that started overlapping.
    pub fn created(&self) -> &[VolumePair<U>] {
        &self.created
    }

    /// Pairs that stopped overlapping, including pairs of released volumes.
    pub fn deleted(&self) -> &[VolumePair<U>] {
        &self.deleted
    }

    /// Single volumes that left every broadphase region.
    pub fn out_of_bounds(&self) -> &[U] {
        &self.out_of_bounds
    }

    /// Aggregates that left every broadphase region.
    pub fn out_of_bounds_aggregates(&self) -> &[AggregateId] {
        &self.out_of_bounds_aggregates
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.deleted.is_empty()
            && self.out_of_bounds.is_empty()
            && self.out_of_bounds_aggregates.is_empty()
    }

    fn clear(&mut self) {
        self.created.clear();
        self.deleted.clear();
        self.out_of_bounds.clear();
        self.out_of_bounds_aggregates.clear();
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ElementState {
    Free,
    Created,
    Live,
    Removed,
}

#[derive(Copy, Clone, Debug)]
enum Owner<U> {
    Free,
    Single(U),
    Aggregate(SlotKey),
}

/// Broadphase boxes and the per-update change lists handed to the engine.
#[derive(Debug)]
struct Elements<U> {
    world: Vec<Bounds3>,
    bounds: Vec<IntegerAabb>,
    groups: Vec<Group>,
    owners: Vec<Owner<U>>,
    states: Vec<ElementState>,
    free: Vec<u32>,
    created: Vec<u32>,
    updated: Vec<u32>,
    removed: Vec<u32>,
    /// Boxes with an entry in `updated`.
    dirty: BitMap,
    /// Boxes with an entry in `created`, possibly stale until [`Elements::compact`].
    queued: BitMap,
}

impl<U: Copy> Elements<U> {
    fn new() -> Self {
        Self {
            world: Vec::new(),
            bounds: Vec::new(),
            groups: Vec::new(),
            owners: Vec::new(),
            states: Vec::new(),
            free: Vec::new(),
            created: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            dirty: BitMap::new(),
            queued: BitMap::new(),
        }
    }

    fn alloc(&mut self, owner: Owner<U>, group: Group, world: Bounds3) -> u32 {
        let bounds = IntegerAabb::encode(&world);
        let e = match self.free.pop() {
            Some(e) => {
                let i = e as usize;
                self.world[i] = world;
                self.bounds[i] = bounds;
                self.groups[i] = group;
                self.owners[i] = owner;
                e
            }
            None => {
                self.world.push(world);
                self.bounds.push(bounds);
                self.groups.push(group);
                self.owners.push(owner);
                self.states.push(ElementState::Free);
                #[allow(
                    clippy::cast_possible_truncation,
                    reason = "Box handles are 32-bit."
                )]
                let e = (self.states.len() - 1) as u32;
                e
            }
        };
        let i = e as usize;
        self.states[i] = ElementState::Created;
        if !self.queued.test(i) {
            self.queued.set(i);
            self.created.push(e);
        }
        e
    }

    fn set_bounds(&mut self, e: u32, world: Bounds3) {
        let i = e as usize;
        self.world[i] = world;
        self.bounds[i] = IntegerAabb::encode(&world);
        if self.states[i] == ElementState::Live && !self.dirty.test(i) {
            self.dirty.set(i);
            self.updated.push(e);
        }
    }

    fn release(&mut self, e: u32) {
        let i = e as usize;
        debug_assert!(
            matches!(self.states[i], ElementState::Created | ElementState::Live),
            "box {e} released twice"
        );
        match self.states[i] {
            ElementState::Created => {
                // Never seen by the engine: recycle at once. Its `created` entry stays
                // queued and is dropped by `compact` unless the slot is reused first.
                self.free_now(e);
            }
            ElementState::Live => {
                self.states[i] = ElementState::Removed;
                self.removed.push(e);
            }
            ElementState::Free | ElementState::Removed => {}
        }
    }

    /// Drop `created` and `updated` entries whose box was released since it was queued.
    fn compact(&mut self) {
        let Self {
            states,
            created,
            updated,
            dirty,
            queued,
            ..
        } = self;
        created.retain(|&e| {
            let i = e as usize;
            let pending = states[i] == ElementState::Created;
            if !pending {
                queued.reset(i);
            }
            pending
        });
        updated.retain(|&e| {
            let i = e as usize;
            let live = states[i] == ElementState::Live;
            if !live {
                dirty.reset(i);
            }
            live
        });
    }

    fn free_now(&mut self, e: u32) {
        let i = e as usize;
        self.states[i] = ElementState::Free;
        self.owners[i] = Owner::Free;
        self.free.push(e);
    }

    fn user(&self, e: u32) -> Option<U> {
        match self.owners[e as usize] {
            Owner::Single(u) => Some(u),
            _ => None,
        }
    }

    /// Whether the box entered the engine or moved in the current update.
    fn changed(&self, e: u32) -> bool {
        let i = e as usize;
        self.states[i] == ElementState::Created || self.dirty.test(i)
    }

    /// Retire this update's lists: removed boxes become free, created boxes live.
    fn finish(&mut self) {
        let mut removed = core::mem::take(&mut self.removed);
        for &e in &removed {
            self.free_now(e);
        }
        removed.clear();
        self.removed = removed;
        for &e in &self.created {
            self.states[e as usize] = ElementState::Live;
            self.queued.reset(e as usize);
        }
        self.created.clear();
        for &e in &self.updated {
            self.dirty.reset(e as usize);
        }
        self.updated.clear();
    }

    fn shift(&mut self, shift: [f32; 3]) {
        for ((world, bounds), state) in self.world.iter_mut().zip(&mut self.bounds).zip(&self.states) {
            if *state != ElementState::Free {
                *world = world.shifted(shift);
                *bounds = IntegerAabb::encode(world);
            }
        }
    }
}

#[derive(Debug)]
struct Single<U> {
    user: U,
    element: u32,
    pull: bool,
}

#[derive(Copy, Clone, Debug)]
struct Shape {
    aggregate: SlotKey,
    actor: SlotKey,
    position: u32,
}

#[derive(Debug)]
struct Actor {
    aggregate: SlotKey,
    positions: SmallVec<[u32; 4]>,
    /// Union of the shapes' actor-local bounds; dropped when the shape set changes.
    local: Option<Bounds3>,
    world: Bounds3,
    dirty: bool,
}

#[derive(Debug)]
struct Aggregate<U> {
    key: SlotKey,
    user: U,
    self_collide: bool,
    group: Group,
    element: Option<u32>,
    world: Bounds3,
    actors: SmallVec<[SlotKey; 4]>,
    // Per position. Released positions keep their slot with `Group::INVALID`.
    elem_world: Vec<Bounds3>,
    elem_bounds: Vec<IntegerAabb>,
    elem_groups: Vec<Group>,
    elem_user: Vec<U>,
    elem_stale: Vec<bool>,
    active: usize,
    released: Vec<u32>,
    available: Vec<u32>,
    self_pairs: SelfCollisionBitmap,
    dirty: bool,
    stale_shapes: bool,
    overlap_count: usize,
    has_bp_overlap: bool,
    doomed: bool,
}

impl<U: Copy> Aggregate<U> {
    fn new(user: U, self_collide: bool, group: Group) -> Self {
        Self {
            key: SlotKey {
                index: u32::MAX,
                generation: 0,
            },
            user,
            self_collide,
            group,
            element: None,
            world: Bounds3::EMPTY,
            actors: SmallVec::new(),
            elem_world: Vec::new(),
            elem_bounds: Vec::new(),
            elem_groups: Vec::new(),
            elem_user: Vec::new(),
            elem_stale: Vec::new(),
            active: 0,
            released: Vec::new(),
            available: Vec::new(),
            self_pairs: SelfCollisionBitmap::default(),
            dirty: false,
            stale_shapes: false,
            overlap_count: 0,
            has_bp_overlap: false,
            doomed: false,
        }
    }

    fn len(&self) -> usize {
        self.elem_user.len()
    }

    fn is_tombstone(&self, p: u32) -> bool {
        self.elem_groups[p as usize].is_invalid()
    }

    fn insert_element(&mut self, user: U, group: Group, world: Bounds3) -> u32 {
        let bounds = IntegerAabb::encode(&world);
        let p = match self.available.pop() {
            Some(p) => {
                let i = p as usize;
                self.elem_world[i] = world;
                self.elem_bounds[i] = bounds;
                self.elem_groups[i] = group;
                self.elem_user[i] = user;
                self.elem_stale[i] = false;
                p
            }
            None => {
                self.elem_world.push(world);
                self.elem_bounds.push(bounds);
                self.elem_groups.push(group);
                self.elem_user.push(user);
                self.elem_stale.push(false);
                #[allow(
                    clippy::cast_possible_truncation,
                    reason = "Aggregate positions are bounded by the shape limit plus one update's releases."
                )]
                let p = (self.elem_user.len() - 1) as u32;
                p
            }
        };
        self.active += 1;
        self.dirty = true;
        p
    }

    fn tombstone(&mut self, p: u32) {
        let i = p as usize;
        self.elem_groups[i] = Group::INVALID;
        self.elem_bounds[i] = IntegerAabb::EMPTY;
        self.elem_stale[i] = false;
        self.released.push(p);
        self.active -= 1;
        self.dirty = true;
    }

    fn set_element_bounds(&mut self, p: u32, world: Bounds3) {
        let i = p as usize;
        self.elem_world[i] = world;
        self.elem_bounds[i] = IntegerAabb::encode(&world);
        self.elem_stale[i] = false;
    }

    /// World bounds of an actor from its shapes, or `None` while any of them is stale.
    fn actor_bounds(&self, positions: &[u32]) -> Option<Bounds3> {
        if positions.iter().any(|&p| self.elem_stale[p as usize]) {
            return None;
        }
        Some(
            positions
                .iter()
                .fold(Bounds3::EMPTY, |acc, &p| acc.union(&self.elem_world[p as usize])),
        )
    }

    fn reset_storage(&mut self) {
        self.elem_world.clear();
        self.elem_bounds.clear();
        self.elem_groups.clear();
        self.elem_user.clear();
        self.elem_stale.clear();
        self.released.clear();
        self.available.clear();
        self.self_pairs.clear();
        self.stale_shapes = false;
        self.world = Bounds3::EMPTY;
    }
}

/// The non-aggregate side of an aggregate pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Participant {
    Aggregate(SlotKey),
    Single(u32),
}

/// Shape-level state of one broadphase pair involving an aggregate.
#[derive(Debug)]
struct AggregatePair {
    lhs: SlotKey,
    rhs: Participant,
    bitmap: PairBitmap,
    fresh: bool,
}

#[derive(Debug)]
struct ActorJob<U> {
    actor: SlotKey,
    per_shape: bool,
    shapes: SmallVec<[(u32, U); 4]>,
    local: Option<Bounds3>,
    shape_world: SmallVec<[Bounds3; 4]>,
    world: Bounds3,
}

impl<U: Copy> ActorJob<U> {
    fn run<S: BoundsSource<U> + ?Sized>(&mut self, source: &S) {
        if self.per_shape {
            self.shape_world.clear();
            self.shape_world
                .extend(self.shapes.iter().map(|&(_, u)| source.shape_bounds(u)));
            self.world = self
                .shape_world
                .iter()
                .fold(Bounds3::EMPTY, |acc, b| acc.union(b));
        } else if let Some(&(_, first)) = self.shapes.first() {
            let shapes = &self.shapes;
            let local = *self.local.get_or_insert_with(|| {
                shapes
                    .iter()
                    .fold(Bounds3::EMPTY, |acc, &(_, u)| acc.union(&source.shape_local_bounds(u)))
            });
            self.world = source.actor_world_bounds(first, &local);
        }
    }
}

#[derive(Debug)]
struct BoundsJob<U> {
    owner: usize,
    target: u32,
    user: U,
    bounds: Bounds3,
}

#[derive(Copy, Clone, Debug)]
enum JobKind {
    SelfPairs,
    Pair(BpPair),
}

#[derive(Debug)]
struct OverlapJob<U> {
    kind: JobKind,
    lhs: SlotKey,
    rhs: Participant,
    single: Option<(SortedElement, U)>,
    self_pairs: SelfCollisionBitmap,
    pair_bitmap: PairBitmap,
    diff: PairDiff,
    created: Vec<VolumePair<U>>,
    deleted: Vec<VolumePair<U>>,
}

impl<U: Copy> OverlapJob<U> {
    fn run(&mut self, sorted: &HashMap<u32, Vec<SortedElement>>, aggregates: &SlotMap<Aggregate<U>>) {
        let Some(lhs) = aggregates.get(self.lhs) else {
            return;
        };
        let lhs_sorted = sorted.get(&self.lhs.index).map_or(&[][..], Vec::as_slice);
        self.diff.clear();
        match (self.kind, self.rhs) {
            (JobKind::SelfPairs, _) => {
                aggregate::self_collide(
                    lhs_sorted,
                    lhs.len(),
                    &mut self.self_pairs,
                    |p| lhs.is_tombstone(p),
                    &mut self.diff,
                );
                let user = |p: u32| lhs.elem_user[p as usize];
                self.emit(user, user);
            }
            (JobKind::Pair(_), Participant::Aggregate(key)) => {
                let Some(rhs) = aggregates.get(key) else {
                    return;
                };
                let rhs_sorted = sorted.get(&key.index).map_or(&[][..], Vec::as_slice);
                aggregate::aggregate_aggregate(
                    lhs_sorted,
                    rhs_sorted,
                    (lhs.len(), rhs.len()),
                    &mut self.pair_bitmap,
                    |i, j| lhs.is_tombstone(i) || rhs.is_tombstone(j),
                    &mut self.diff,
                );
                self.emit(|p| lhs.elem_user[p as usize], |p| rhs.elem_user[p as usize]);
            }
            (JobKind::Pair(_), Participant::Single(_)) => {
                let Some((single, user)) = self.single else {
                    return;
                };
                aggregate::aggregate_single(
                    lhs_sorted,
                    lhs.len(),
                    single,
                    &mut self.pair_bitmap,
                    |p| lhs.is_tombstone(p),
                    &mut self.diff,
                );
                self.emit(|p| lhs.elem_user[p as usize], |_| user);
            }
        }
    }

    fn emit(&mut self, lhs: impl Fn(u32) -> U, rhs: impl Fn(u32) -> U) {
        if self.diff.is_empty() {
            return;
        }
        let pair = |&(i, j): &(u32, u32)| VolumePair { a: lhs(i), b: rhs(j) };
        self.created.extend(self.diff.created.iter().map(pair));
        self.deleted.extend(self.diff.lost.iter().map(pair));
    }
}

fn participant_user<U: Copy>(
    aggregates: &SlotMap<Aggregate<U>>,
    elements: &Elements<U>,
    participant: Participant,
    position: usize,
) -> Option<U> {
    match participant {
        Participant::Single(e) => elements.user(e),
        Participant::Aggregate(key) => aggregates.get(key)?.elem_user.get(position).copied(),
    }
}

/// Shape, actor, and aggregate bookkeeping over a broadphase engine `B`, running parallel
/// work on executor `E`.
///
/// `U` is per-volume userdata; overlaps are reported as pairs of it.
pub struct AabbManagerGeneric<U, B, E> {
    config: ManagerConfig,
    bp: B,
    exec: E,
    elements: Elements<U>,
    singles: SlotMap<Single<U>>,
    shapes: SlotMap<Shape>,
    actors: SlotMap<Actor>,
    aggregates: SlotMap<Aggregate<U>>,
    records: HashMap<BpPair, AggregatePair>,
    group_pool: Vec<u32>,
    next_group: u32,
    pull_singles: Vec<SlotKey>,
    dirty_actors: Vec<SlotKey>,
    overlaps: Overlaps<U>,
    arena: FrameArena,
    radix: RadixSort,
    sort_keys: Vec<u32>,
    sorted: HashMap<u32, Vec<SortedElement>>,
    actor_jobs: Vec<ActorJob<U>>,
    bounds_jobs: Vec<BoundsJob<U>>,
    overlap_jobs: Vec<OverlapJob<U>>,
}

/// A manager over sweep-and-prune with the default executor.
pub type AabbManager<U> = AabbManagerGeneric<U, Sap, DefaultExecutor>;

impl<U, B: Debug, E: Debug> Debug for AabbManagerGeneric<U, B, E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AabbManager")
            .field("singles", &self.singles.len())
            .field("shapes", &self.shapes.len())
            .field("aggregates", &self.aggregates.len())
            .field(
                "aggregated_shapes",
                &self.aggregates.iter().map(|(_, a)| a.active).sum::<usize>(),
            )
            .field("aggregate_pairs", &self.records.len())
            .field("broadphase", &self.bp)
            .field("executor", &self.exec)
            .finish_non_exhaustive()
    }
}

impl<U> AabbManager<U>
where
    U: Copy + Debug + Send + Sync,
{
    /// Create a manager over sweep-and-prune.
    pub fn new() -> Self {
        Self::with_broadphase(Sap::default())
    }

    /// Create a manager over multi box pruning. Add regions before creating volumes.
    pub fn with_mbp() -> AabbManagerGeneric<U, Mbp, DefaultExecutor> {
        AabbManagerGeneric::with_broadphase(Mbp::default())
    }
}

impl<U> Default for AabbManager<U>
where
    U: Copy + Debug + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<U, B, E> AabbManagerGeneric<U, B, E>
where
    U: Copy + Debug + Send + Sync,
    B: BroadPhase,
    E: Executor,
{
    /// Create a manager over `bp` with the default executor.
    pub fn with_broadphase(bp: B) -> Self
    where
        E: Default,
    {
        Self::with_config(ManagerConfig::default(), bp, E::default())
    }

    /// Create a manager with explicit configuration, engine, and executor.
    pub fn with_config(config: ManagerConfig, bp: B, exec: E) -> Self {
        let config = ManagerConfig {
            max_aggregate_shapes: config.max_aggregate_shapes.min(MAX_AGGREGATE_SHAPES),
            ..config
        };
        Self {
            config,
            bp,
            exec,
            elements: Elements::new(),
            singles: SlotMap::default(),
            shapes: SlotMap::default(),
            actors: SlotMap::default(),
            aggregates: SlotMap::default(),
            records: HashMap::new(),
            group_pool: Vec::new(),
            next_group: u32::MAX - 1,
            pull_singles: Vec::new(),
            dirty_actors: Vec::new(),
            overlaps: Overlaps::default(),
            arena: FrameArena::default(),
            radix: RadixSort::new(),
            sort_keys: Vec::new(),
            sorted: HashMap::new(),
            actor_jobs: Vec::new(),
            bounds_jobs: Vec::new(),
            overlap_jobs: Vec::new(),
        }
    }

    /// The manager's configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The broadphase engine.
    pub fn broadphase(&self) -> &B {
        &self.bp
    }

    /// Number of live volumes.
    pub fn len(&self) -> usize {
        self.singles.len() + self.shapes.len()
    }

    /// Whether no volume is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_aggregate(&self, id: AggregateId) -> Result<&Aggregate<U>> {
        self.aggregates
            .get(id.0)
            .filter(|a| !a.doomed)
            .ok_or(BroadPhaseError::StaleHandle)
    }

    /// Create a volume.
    ///
    /// Without an aggregate the volume is a single box and `actor` must be `None`. With an
    /// aggregate, the shape joins `actor`, or a new actor when `actor` is `None`; the
    /// actor in use is returned. A full aggregate drops the shape with a warning.
    pub fn create_volume(
        &mut self,
        aggregate: Option<AggregateId>,
        actor: Option<ActorHandle>,
        group: Group,
        userdata: U,
        bounds: Bounds3,
    ) -> Result<(VolumeHandle, Option<ActorHandle>)> {
        let Some(id) = aggregate else {
            if actor.is_some() {
                return Err(BroadPhaseError::ActorMismatch);
            }
            let element = self.elements.alloc(Owner::Single(userdata), group, bounds);
            let key = self.singles.insert(Single {
                user: userdata,
                element,
                pull: false,
            });
            return Ok((VolumeHandle::single(key), None));
        };

        let agg = self.live_aggregate(id)?;
        let max = self.config.max_aggregate_shapes;
        if agg.active >= max {
            warn!(max, aggregate = ?agg.user, "aggregate shape limit reached; shape not added");
            return Err(BroadPhaseError::AggregateFull { max });
        }
        let actor_key = match actor {
            Some(ActorHandle(key)) => match self.actors.get(key) {
                Some(a) if a.aggregate == id.0 => key,
                Some(_) => return Err(BroadPhaseError::ActorMismatch),
                None => return Err(BroadPhaseError::StaleHandle),
            },
            None => self.actors.insert(Actor {
                aggregate: id.0,
                positions: SmallVec::new(),
                local: None,
                world: Bounds3::EMPTY,
                dirty: false,
            }),
        };
        let (Some(agg), Some(actor)) = (self.aggregates.get_mut(id.0), self.actors.get_mut(actor_key))
        else {
            return Err(BroadPhaseError::StaleHandle);
        };
        if actor.positions.is_empty() {
            agg.actors.push(actor_key);
        }
        let position = agg.insert_element(userdata, group, bounds);
        actor.positions.push(position);
        actor.local = None;
        refit_actor(agg, actor, actor_key, &mut self.dirty_actors);
        let key = self.shapes.insert(Shape {
            aggregate: id.0,
            actor: actor_key,
            position,
        });
        Ok((VolumeHandle::aggregated(key), Some(ActorHandle(actor_key))))
    }

    /// Release a volume.
    ///
    /// Returns whether it was the last shape of its actor, which releases the actor too.
    /// Single volumes have no actor and return `false`.
    pub fn release_volume(&mut self, handle: VolumeHandle) -> Result<bool> {
        if !handle.is_aggregated() {
            let single = self
                .singles
                .remove(handle.key())
                .ok_or(BroadPhaseError::StaleHandle)?;
            self.elements.release(single.element);
            return Ok(false);
        }
        let shape = self
            .shapes
            .remove(handle.key())
            .ok_or(BroadPhaseError::StaleHandle)?;
        let (Some(agg), Some(actor)) = (
            self.aggregates.get_mut(shape.aggregate),
            self.actors.get_mut(shape.actor),
        ) else {
            return Err(BroadPhaseError::StaleHandle);
        };
        agg.tombstone(shape.position);
        actor.positions.retain(|p| *p != shape.position);
        if actor.positions.is_empty() {
            agg.actors.retain(|a| *a != shape.actor);
            self.actors.remove(shape.actor);
            return Ok(true);
        }
        actor.local = None;
        refit_actor(agg, actor, shape.actor, &mut self.dirty_actors);
        Ok(false)
    }

    /// Set the world bounds of a volume directly.
    pub fn set_volume_bounds(&mut self, handle: VolumeHandle, bounds: Bounds3) -> Result<()> {
        if !handle.is_aggregated() {
            let single = self.singles.get(handle.key()).ok_or(BroadPhaseError::StaleHandle)?;
            self.elements.set_bounds(single.element, bounds);
            return Ok(());
        }
        let shape = *self.shapes.get(handle.key()).ok_or(BroadPhaseError::StaleHandle)?;
        let (Some(agg), Some(actor)) = (
            self.aggregates.get_mut(shape.aggregate),
            self.actors.get_mut(shape.actor),
        ) else {
            return Err(BroadPhaseError::StaleHandle);
        };
        agg.set_element_bounds(shape.position, bounds);
        agg.dirty = true;
        refit_actor(agg, actor, shape.actor, &mut self.dirty_actors);
        Ok(())
    }

    /// Schedule a volume's bounds to be pulled from the [`BoundsSource`] at the next update.
    ///
    /// For an aggregated shape the whole actor is recomputed.
    pub fn mark_dirty(&mut self, handle: VolumeHandle) -> Result<()> {
        if !handle.is_aggregated() {
            let key = handle.key();
            let single = self.singles.get_mut(key).ok_or(BroadPhaseError::StaleHandle)?;
            if !single.pull {
                single.pull = true;
                self.pull_singles.push(key);
            }
            return Ok(());
        }
        let shape = self.shapes.get(handle.key()).ok_or(BroadPhaseError::StaleHandle)?;
        let actor = self
            .actors
            .get_mut(shape.actor)
            .ok_or(BroadPhaseError::StaleHandle)?;
        if !actor.dirty {
            actor.dirty = true;
            self.dirty_actors.push(shape.actor);
        }
        Ok(())
    }

    /// Current world bounds of a volume. Bounds of aggregated shapes that were skipped by
    /// the actor-level path may lag until the aggregate overlaps something.
    pub fn volume_bounds(&self, handle: VolumeHandle) -> Result<Bounds3> {
        if !handle.is_aggregated() {
            let single = self.singles.get(handle.key()).ok_or(BroadPhaseError::StaleHandle)?;
            return Ok(self.elements.world[single.element as usize]);
        }
        let shape = self.shapes.get(handle.key()).ok_or(BroadPhaseError::StaleHandle)?;
        let agg = self
            .aggregates
            .get(shape.aggregate)
            .ok_or(BroadPhaseError::StaleHandle)?;
        Ok(agg.elem_world[shape.position as usize])
    }

    /// Create an aggregate. Shapes of one aggregate only pair with each other when
    /// `self_collide` is set.
    pub fn create_aggregate(&mut self, userdata: U, self_collide: bool) -> AggregateId {
        let group = self.group_pool.pop().unwrap_or_else(|| {
            let g = self.next_group;
            self.next_group = self.next_group.saturating_sub(1);
            g
        });
        let key = self
            .aggregates
            .insert(Aggregate::new(userdata, self_collide, Group(group)));
        if let Some(agg) = self.aggregates.get_mut(key) {
            agg.key = key;
        }
        AggregateId(key)
    }

    /// Delete an empty aggregate. The id goes stale immediately.
    pub fn delete_aggregate(&mut self, id: AggregateId) -> Result<()> {
        let active = self.live_aggregate(id)?.active;
        if active > 0 {
            return Err(BroadPhaseError::AggregateNotEmpty(active));
        }
        if let Some(agg) = self.aggregates.get_mut(id.0) {
            agg.doomed = true;
        }
        Ok(())
    }

    /// Number of live shapes in an aggregate.
    pub fn aggregate_len(&self, id: AggregateId) -> Result<usize> {
        Ok(self.live_aggregate(id)?.active)
    }

    /// Bounds of an aggregate as of the last update.
    pub fn aggregate_bounds(&self, id: AggregateId) -> Result<Bounds3> {
        Ok(self.live_aggregate(id)?.world)
    }

    /// Add a broadphase region. See [`BroadPhase::add_region`].
    pub fn add_region(&mut self, bounds: Bounds3, populate: bool) -> Result<u32> {
        self.bp
            .add_region(IntegerAabb::encode(&bounds), populate, &self.elements.bounds)
    }

    /// Remove a broadphase region.
    pub fn remove_region(&mut self, handle: u32) -> Result<()> {
        self.bp.remove_region(handle)
    }

    /// Translate every stored bound by `-shift`. Overlaps are not recomputed.
    pub fn shift_origin(&mut self, shift: [f32; 3]) {
        self.elements.shift(shift);
        for (_, agg) in self.aggregates.iter_mut() {
            agg.world = agg.world.shifted(shift);
            for (world, bounds) in agg.elem_world.iter_mut().zip(&mut agg.elem_bounds) {
                *world = world.shifted(shift);
                if *bounds != IntegerAabb::EMPTY {
                    *bounds = IntegerAabb::encode(world);
                }
            }
        }
        for (_, actor) in self.actors.iter_mut() {
            actor.world = actor.world.shifted(shift);
        }
        self.bp.shift_origin(shift, &self.elements.bounds);
        debug!(?shift, boxes = self.bp.len(), "origin shifted");
    }

    /// Release scratch and per-frame buffers.
    pub fn free_buffers(&mut self) {
        self.bp.free_buffers();
        self.arena.release();
        self.overlaps = Overlaps::default();
        self.sorted = HashMap::new();
        self.sort_keys = Vec::new();
        self.actor_jobs = Vec::new();
        self.bounds_jobs = Vec::new();
        self.overlap_jobs = Vec::new();
        self.radix.reset();
    }

    /// Bring every bound up to date, run the broadphase, and resolve aggregate overlaps.
    ///
    /// Returns the pairs created and deleted since the previous update.
    pub fn update_aabbs_and_bp<S>(&mut self, source: &S) -> &Overlaps<U>
    where
        S: BoundsSource<U> + Sync + ?Sized,
    {
        self.overlaps.clear();
        let arena = core::mem::take(&mut self.arena);

        Stage::ComputeUpdateLists.run(|| self.compute_update_lists());
        Stage::UpdateActorBounds.run(|| self.update_actor_bounds(source));
        Stage::UpdateShapeBounds.run(|| self.update_shape_bounds(source));
        Stage::UpdateAggregateBounds.run(|| self.update_aggregate_bounds());
        let counts = (
            self.elements.created.len(),
            self.elements.updated.len(),
            self.elements.removed.len(),
        );
        Stage::RunBroadphase.run(|| self.run_broadphase());
        Stage::ProcessBpResults.run(|| self.process_bp_results());
        {
            let mut sweeps = arena.pairs();
            Stage::UpdateDirtyAggregateShapes
                .run(|| self.update_dirty_aggregate_shapes(source, &arena, &mut sweeps));
            Stage::AggregateOverlaps.run(|| self.aggregate_overlaps(&sweeps));
        }
        Stage::Finish.run(|| self.finish());

        self.arena = arena;
        self.arena.trim();
        debug!(
            created_boxes = counts.0,
            updated_boxes = counts.1,
            removed_boxes = counts.2,
            created_pairs = self.overlaps.created.len(),
            deleted_pairs = self.overlaps.deleted.len(),
            aggregate_pairs = self.records.len(),
            "aabb manager update"
        );
        &self.overlaps
    }

    fn compute_update_lists(&mut self) {
        for (_, agg) in self.aggregates.iter_mut() {
            if agg.active == 0 {
                if let Some(e) = agg.element.take() {
                    self.elements.release(e);
                }
            } else if agg.element.is_none() {
                let owner = Owner::Aggregate(agg.key);
                agg.element = Some(self.elements.alloc(owner, agg.group, Bounds3::EMPTY));
                agg.dirty = true;
            }
        }
        self.elements.compact();
    }

    fn update_actor_bounds<S>(&mut self, source: &S)
    where
        S: BoundsSource<U> + Sync + ?Sized,
    {
        let mut jobs = core::mem::take(&mut self.actor_jobs);
        jobs.clear();
        for key in self.dirty_actors.drain(..) {
            let Some(actor) = self.actors.get_mut(key) else {
                continue;
            };
            actor.dirty = false;
            let Some(agg) = self.aggregates.get(actor.aggregate) else {
                continue;
            };
            let per_shape = agg.self_collide || agg.has_bp_overlap;
            jobs.push(ActorJob {
                actor: key,
                per_shape,
                shapes: actor
                    .positions
                    .iter()
                    .map(|&p| (p, agg.elem_user[p as usize]))
                    .collect(),
                local: actor.local,
                shape_world: SmallVec::new(),
                world: Bounds3::EMPTY,
            });
        }

        let (min_batch, max_tasks) = (self.config.min_batch_size, self.config.max_tasks);
        self.exec.for_each_batch(&mut jobs, min_batch, max_tasks, |_, batch| {
            for job in batch {
                job.run(source);
            }
        });

        for job in &jobs {
            let Some(actor) = self.actors.get_mut(job.actor) else {
                continue;
            };
            let Some(agg) = self.aggregates.get_mut(actor.aggregate) else {
                continue;
            };
            actor.world = job.world;
            agg.dirty = true;
            if job.per_shape {
                for (&(p, _), world) in job.shapes.iter().zip(&job.shape_world) {
                    agg.set_element_bounds(p, *world);
                }
            } else {
                actor.local = job.local;
                for &(p, _) in &job.shapes {
                    agg.elem_stale[p as usize] = true;
                }
                agg.stale_shapes = true;
            }
        }
        self.actor_jobs = jobs;
    }

    fn update_shape_bounds<S>(&mut self, source: &S)
    where
        S: BoundsSource<U> + Sync + ?Sized,
    {
        let mut jobs = core::mem::take(&mut self.bounds_jobs);
        jobs.clear();
        for key in self.pull_singles.drain(..) {
            if let Some(single) = self.singles.get_mut(key) {
                single.pull = false;
                jobs.push(BoundsJob {
                    owner: 0,
                    target: single.element,
                    user: single.user,
                    bounds: Bounds3::EMPTY,
                });
            }
        }
        pull_bounds(&self.exec, &self.config, &mut jobs, source);
        for job in &jobs {
            self.elements.set_bounds(job.target, job.bounds);
        }
        self.bounds_jobs = jobs;
    }

    fn update_aggregate_bounds(&mut self) {
        for (_, agg) in self.aggregates.iter_mut() {
            if !agg.dirty || agg.active == 0 {
                continue;
            }
            agg.world = agg
                .actors
                .iter()
                .filter_map(|&a| self.actors.get(a))
                .fold(Bounds3::EMPTY, |acc, a| acc.union(&a.world));
            if let Some(e) = agg.element {
                self.elements.set_bounds(e, agg.world);
            }
        }
    }

    fn run_broadphase(&mut self) {
        let e = &self.elements;
        let data = UpdateData::new(&e.created, &e.updated, &e.removed, &e.bounds, &e.groups);
        self.bp.update(&data, &self.exec);
    }

    fn process_bp_results(&mut self) {
        let Self {
            aggregates,
            records,
            elements,
            overlaps,
            bp,
            ..
        } = self;

        // Pairs of released aggregate shapes are reported here, before any sweep sees
        // their tombstones.
        for (_, agg) in aggregates.iter_mut() {
            let Aggregate {
                self_pairs,
                elem_user,
                released,
                ..
            } = agg;
            for &p in released.iter() {
                let p = p as usize;
                self_pairs.drain_element(p, |k| {
                    overlaps.deleted.push(VolumePair {
                        a: elem_user[p],
                        b: elem_user[k],
                    });
                });
            }
        }
        let (shared, boxes) = (&*aggregates, &*elements);
        for record in records.values_mut() {
            let Some(lhs) = shared.get(record.lhs) else {
                continue;
            };
            let rhs = record.rhs;
            for &p in &lhs.released {
                let p = p as usize;
                record.bitmap.drain_row(p, |j| {
                    if let Some(b) = participant_user(shared, boxes, rhs, j) {
                        overlaps.deleted.push(VolumePair {
                            a: lhs.elem_user[p],
                            b,
                        });
                    }
                });
            }
            if let Participant::Aggregate(key) = rhs
                && let Some(rhs) = shared.get(key)
            {
                for &p in &rhs.released {
                    let p = p as usize;
                    record.bitmap.drain_col(p, |i| {
                        overlaps.deleted.push(VolumePair {
                            a: lhs.elem_user[i],
                            b: rhs.elem_user[p],
                        });
                    });
                }
            }
        }

        for p in bp.deleted_pairs() {
            match (elements.owners[p.a as usize], elements.owners[p.b as usize]) {
                (Owner::Single(a), Owner::Single(b)) => overlaps.deleted.push(VolumePair { a, b }),
                _ => {
                    let Some(record) = records.remove(p) else {
                        continue;
                    };
                    for (i, j) in record.bitmap.iter() {
                        let a = participant_user(aggregates, elements, Participant::Aggregate(record.lhs), i);
                        let b = participant_user(aggregates, elements, record.rhs, j);
                        if let (Some(a), Some(b)) = (a, b) {
                            overlaps.deleted.push(VolumePair { a, b });
                        }
                    }
                    for key in [Participant::Aggregate(record.lhs), record.rhs] {
                        if let Participant::Aggregate(key) = key
                            && let Some(agg) = aggregates.get_mut(key)
                        {
                            agg.overlap_count = agg.overlap_count.saturating_sub(1);
                        }
                    }
                }
            }
        }

        for p in bp.created_pairs() {
            let (oa, ob) = (elements.owners[p.a as usize], elements.owners[p.b as usize]);
            let (lhs, other) = match (oa, ob) {
                (Owner::Single(a), Owner::Single(b)) => {
                    overlaps.created.push(VolumePair { a, b });
                    continue;
                }
                (Owner::Aggregate(key), _) => (key, p.b),
                (_, Owner::Aggregate(key)) => (key, p.a),
                _ => continue,
            };
            let rhs = match elements.owners[other as usize] {
                Owner::Aggregate(key) => Participant::Aggregate(key),
                _ => Participant::Single(other),
            };
            for key in [Participant::Aggregate(lhs), rhs] {
                if let Participant::Aggregate(key) = key
                    && let Some(agg) = aggregates.get_mut(key)
                {
                    agg.overlap_count += 1;
                }
            }
            records.insert(
                *p,
                AggregatePair {
                    lhs,
                    rhs,
                    bitmap: PairBitmap::default(),
                    fresh: true,
                },
            );
        }

        for &e in bp.out_of_bounds() {
            match elements.owners[e as usize] {
                Owner::Single(u) => overlaps.out_of_bounds.push(u),
                Owner::Aggregate(key) => overlaps.out_of_bounds_aggregates.push(AggregateId(key)),
                Owner::Free => {}
            }
        }
    }

    fn update_dirty_aggregate_shapes<S>(&mut self, source: &S, arena: &FrameArena, sweeps: &mut Vec<BpPair>)
    where
        S: BoundsSource<U> + Sync + ?Sized,
    {
        let changed = |p: Participant| match p {
            Participant::Aggregate(key) => self.aggregates.get(key).is_some_and(|a| a.dirty),
            Participant::Single(e) => self.elements.changed(e),
        };
        for (key, record) in &self.records {
            if record.fresh || changed(Participant::Aggregate(record.lhs)) || changed(record.rhs) {
                sweeps.push(*key);
            }
        }
        sweeps.sort_unstable();

        // Aggregates on the actor-level path kept stale shape bounds; refresh the ones
        // about to be swept.
        let mut stale = arena.ids();
        let mut seen = arena.bitmap();
        for key in sweeps.iter() {
            let Some(record) = self.records.get(key) else {
                continue;
            };
            for p in [Participant::Aggregate(record.lhs), record.rhs] {
                if let Participant::Aggregate(key) = p
                    && !seen.test(key.idx())
                    && self.aggregates.get(key).is_some_and(|a| a.stale_shapes)
                {
                    seen.set(key.idx());
                    stale.push(key.index);
                }
            }
        }

        let mut jobs = core::mem::take(&mut self.bounds_jobs);
        jobs.clear();
        for &index in stale.iter() {
            let Some(agg) = self.aggregates.at(index as usize) else {
                continue;
            };
            for (p, _) in agg.elem_stale.iter().enumerate().filter(|(_, s)| **s) {
                #[allow(
                    clippy::cast_possible_truncation,
                    reason = "Aggregate positions are bounded by the shape limit plus one update's releases."
                )]
                let target = p as u32;
                jobs.push(BoundsJob {
                    owner: index as usize,
                    target,
                    user: agg.elem_user[p],
                    bounds: Bounds3::EMPTY,
                });
            }
        }
        pull_bounds(&self.exec, &self.config, &mut jobs, source);
        for job in &jobs {
            if let Some(agg) = self.aggregates.at_mut(job.owner) {
                agg.set_element_bounds(job.target, job.bounds);
            }
        }
        for &index in stale.iter() {
            if let Some(agg) = self.aggregates.at_mut(index as usize) {
                agg.stale_shapes = false;
            }
        }
        self.bounds_jobs = jobs;
    }

    fn aggregate_overlaps(&mut self, sweeps: &[BpPair]) {
        let mut jobs = core::mem::take(&mut self.overlap_jobs);
        jobs.clear();

        for (_, agg) in self.aggregates.iter_mut() {
            if agg.self_collide && agg.dirty && agg.active > 0 {
                jobs.push(OverlapJob {
                    kind: JobKind::SelfPairs,
                    lhs: agg.key,
                    rhs: Participant::Aggregate(agg.key),
                    single: None,
                    self_pairs: core::mem::take(&mut agg.self_pairs),
                    pair_bitmap: PairBitmap::default(),
                    diff: PairDiff::default(),
                    created: Vec::new(),
                    deleted: Vec::new(),
                });
            }
        }
        for key in sweeps {
            let Some(record) = self.records.get_mut(key) else {
                continue;
            };
            let single = match record.rhs {
                Participant::Single(e) => self.elements.user(e).map(|user| {
                    let element = SortedElement {
                        position: e,
                        bounds: self.elements.bounds[e as usize],
                        group: self.elements.groups[e as usize],
                    };
                    (element, user)
                }),
                Participant::Aggregate(_) => None,
            };
            jobs.push(OverlapJob {
                kind: JobKind::Pair(*key),
                lhs: record.lhs,
                rhs: record.rhs,
                single,
                self_pairs: SelfCollisionBitmap::default(),
                pair_bitmap: core::mem::take(&mut record.bitmap),
                diff: PairDiff::default(),
                created: Vec::new(),
                deleted: Vec::new(),
            });
        }
        if jobs.is_empty() {
            self.overlap_jobs = jobs;
            return;
        }

        // Sort every aggregate taking part once.
        self.sorted.clear();
        for job in &jobs {
            for p in [Participant::Aggregate(job.lhs), job.rhs] {
                let Participant::Aggregate(key) = p else {
                    continue;
                };
                if self.sorted.contains_key(&key.index) {
                    continue;
                }
                let Some(agg) = self.aggregates.get(key) else {
                    continue;
                };
                let mut out = Vec::new();
                aggregate::sort_aggregate(
                    &agg.elem_bounds,
                    &agg.elem_groups,
                    &mut self.radix,
                    &mut self.sort_keys,
                    &mut out,
                );
                self.sorted.insert(key.index, out);
            }
        }

        let (sorted, aggregates) = (&self.sorted, &self.aggregates);
        self.exec.for_each_batch(
            &mut jobs,
            self.config.min_batch_size,
            self.config.max_tasks,
            |_, batch| {
                for job in batch {
                    job.run(sorted, aggregates);
                }
            },
        );

        for job in &mut jobs {
            match job.kind {
                JobKind::SelfPairs => {
                    if let Some(agg) = self.aggregates.get_mut(job.lhs) {
                        agg.self_pairs = core::mem::take(&mut job.self_pairs);
                    }
                }
                JobKind::Pair(key) => {
                    if let Some(record) = self.records.get_mut(&key) {
                        record.bitmap = core::mem::take(&mut job.pair_bitmap);
                        record.fresh = false;
                    }
                }
            }
            self.overlaps.created.append(&mut job.created);
            self.overlaps.deleted.append(&mut job.deleted);
        }
        self.overlap_jobs = jobs;
    }

    fn finish(&mut self) {
        self.elements.finish();
        let mut doomed: SmallVec<[SlotKey; 4]> = SmallVec::new();
        for (_, agg) in self.aggregates.iter_mut() {
            let mut released = core::mem::take(&mut agg.released);
            agg.available.append(&mut released);
            agg.released = released;
            agg.dirty = false;
            agg.has_bp_overlap = agg.overlap_count > 0;
            if agg.active == 0 && agg.element.is_none() && agg.len() > 0 {
                agg.reset_storage();
            }
            if agg.doomed && agg.element.is_none() {
                doomed.push(agg.key);
            }
        }
        for key in doomed {
            if let Some(agg) = self.aggregates.remove(key) {
                self.group_pool.push(agg.group.0);
            }
        }
    }
}

/// Recompute an actor's world bound from its shapes, or queue a pull from the source when
/// some of them only carry bounds from an earlier frame.
fn refit_actor<U: Copy>(
    agg: &Aggregate<U>,
    actor: &mut Actor,
    key: SlotKey,
    pulls: &mut Vec<SlotKey>,
) {
    match agg.actor_bounds(&actor.positions) {
        Some(world) => actor.world = world,
        None if !actor.dirty => {
            actor.dirty = true;
            pulls.push(key);
        }
        None => {}
    }
}

fn pull_bounds<U, E, S>(exec: &E, config: &ManagerConfig, jobs: &mut [BoundsJob<U>], source: &S)
where
    U: Copy + Send,
    E: Executor,
    S: BoundsSource<U> + Sync + ?Sized,
{
    exec.for_each_batch(jobs, config.min_batch_size, config.max_tasks, |_, batch| {
        for job in batch {
            job.bounds = source.shape_bounds(job.user);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::InlineExecutor;

    /// Shapes are boxes in their actor's frame; actors are translated by an offset.
    #[derive(Default)]
    struct Scene {
        local: Vec<Bounds3>,
        actor_of: Vec<usize>,
        offsets: Vec<[f32; 3]>,
    }

    impl Scene {
        fn shape(&mut self, actor: usize, lo: f32, hi: f32) -> u32 {
            if self.offsets.len() <= actor {
                self.offsets.resize(actor + 1, [0.0; 3]);
            }
            self.local.push(Bounds3::new([lo; 3], [hi; 3]));
            self.actor_of.push(actor);
            u32::try_from(self.local.len() - 1).unwrap()
        }

        fn translate(&self, b: &Bounds3, actor: usize) -> Bounds3 {
            let o = self.offsets[actor];
            b.shifted([-o[0], -o[1], -o[2]])
        }
    }

    impl BoundsSource<u32> for Scene {
        fn shape_bounds(&self, shape: u32) -> Bounds3 {
            let s = shape as usize;
            self.translate(&self.local[s], self.actor_of[s])
        }

        fn shape_local_bounds(&self, shape: u32) -> Bounds3 {
            self.local[shape as usize]
        }

        fn actor_world_bounds(&self, shape: u32, local: &Bounds3) -> Bounds3 {
            self.translate(local, self.actor_of[shape as usize])
        }
    }

    type TestManager = AabbManagerGeneric<u32, Sap, InlineExecutor>;

    fn manager() -> TestManager {
        AabbManagerGeneric::with_broadphase(Sap::default())
    }

    fn cube(lo: f32, hi: f32) -> Bounds3 {
        Bounds3::new([lo; 3], [hi; 3])
    }

    fn norm(pairs: &[VolumePair<u32>]) -> Vec<(u32, u32)> {
        let mut v: Vec<_> = pairs.iter().map(|p| (p.a.min(p.b), p.a.max(p.b))).collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn singles_create_and_delete_pairs() {
        let mut m = manager();
        let scene = Scene::default();
        let a = m.create_volume(None, None, Group(1), 10, cube(0.0, 1.0)).unwrap().0;
        m.create_volume(None, None, Group(2), 20, cube(0.5, 1.5)).unwrap();
        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.created()), vec![(10, 20)]);

        m.set_volume_bounds(a, cube(5.0, 6.0)).unwrap();
        let out = m.update_aabbs_and_bp(&scene);
        assert!(out.created().is_empty());
        assert_eq!(norm(out.deleted()), vec![(10, 20)]);

        assert!(m.update_aabbs_and_bp(&scene).is_empty());
    }

    #[test]
    fn release_reports_deleted_and_stales_handle() {
        let mut m = manager();
        let scene = Scene::default();
        let a = m.create_volume(None, None, Group(1), 1, cube(0.0, 1.0)).unwrap().0;
        m.create_volume(None, None, Group(2), 2, cube(0.5, 1.5)).unwrap();
        m.update_aabbs_and_bp(&scene);

        assert_eq!(m.release_volume(a), Ok(false));
        assert_eq!(m.release_volume(a), Err(BroadPhaseError::StaleHandle));
        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.deleted()), vec![(1, 2)]);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn created_and_released_before_update_is_silent() {
        let mut m = manager();
        let scene = Scene::default();
        m.create_volume(None, None, Group(1), 1, cube(0.0, 1.0)).unwrap();
        let b = m.create_volume(None, None, Group(2), 2, cube(0.5, 1.5)).unwrap().0;
        m.release_volume(b).unwrap();
        let c = m.create_volume(None, None, Group(3), 3, cube(0.5, 1.5)).unwrap().0;
        assert!(!c.is_aggregated());
        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.created()), vec![(1, 3)]);
        assert!(out.deleted().is_empty());
    }

    #[test]
    fn mass_release_of_queued_boxes_compacts_lists() {
        let mut m = manager();
        let scene = Scene::default();
        let handles: Vec<_> = (0_u32..8)
            .map(|i| {
                m.create_volume(None, None, Group(i + 1), i, cube(0.0, 1.0))
                    .unwrap()
                    .0
            })
            .collect();
        assert_eq!(m.update_aabbs_and_bp(&scene).created().len(), 28);

        for &h in &handles {
            m.set_volume_bounds(h, cube(0.2, 1.2)).unwrap();
        }
        // Released while queued as created, then its slot is reused.
        let gone = m.create_volume(None, None, Group(50), 50, cube(0.0, 1.0)).unwrap().0;
        m.release_volume(gone).unwrap();
        m.create_volume(None, None, Group(60), 60, cube(100.0, 101.0)).unwrap();
        for &h in &handles {
            m.release_volume(h).unwrap();
        }
        assert_eq!(m.elements.updated.len(), 8);

        m.compute_update_lists();
        assert_eq!(m.elements.created.len(), 1);
        assert!(m.elements.updated.is_empty());
        assert_eq!(m.elements.removed.len(), 8);
        assert!(m.elements.dirty.is_clear());

        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(out.deleted().len(), 28);
        assert!(out.created().is_empty());
        assert_eq!(m.len(), 1);
        assert!(m.update_aabbs_and_bp(&scene).is_empty());
    }

    #[test]
    fn mark_dirty_pulls_from_source() {
        let mut m = manager();
        let mut scene = Scene::default();
        let s0 = scene.shape(0, 0.0, 1.0);
        let s1 = scene.shape(1, 0.0, 1.0);
        scene.offsets[1] = [10.0; 3];
        let h0 = m.create_volume(None, None, Group(1), s0, scene.shape_bounds(s0)).unwrap().0;
        m.create_volume(None, None, Group(2), s1, scene.shape_bounds(s1)).unwrap();
        assert!(m.update_aabbs_and_bp(&scene).created().is_empty());

        scene.offsets[0] = [9.5; 3];
        m.mark_dirty(h0).unwrap();
        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.created()), vec![(s0, s1)]);
        assert_eq!(m.volume_bounds(h0).unwrap(), cube(9.5, 10.5));
    }

    #[test]
    fn self_colliding_aggregate_tracks_shape_pairs() {
        let mut m = manager();
        let scene = Scene::default();
        let agg = m.create_aggregate(100, true);
        let (h0, _) = m
            .create_volume(Some(agg), None, Group(1), 0, cube(0.0, 1.0))
            .unwrap();
        m.create_volume(Some(agg), None, Group(2), 1, cube(0.5, 1.5)).unwrap();
        m.create_volume(Some(agg), None, Group(3), 2, cube(10.0, 11.0)).unwrap();
        assert!(h0.is_aggregated());

        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.created()), vec![(0, 1)]);

        assert_eq!(m.release_volume(h0), Ok(true));
        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.deleted()), vec![(0, 1)]);
        assert!(out.created().is_empty());
        assert_eq!(m.aggregate_len(agg), Ok(2));

        assert!(m.update_aabbs_and_bp(&scene).is_empty());
    }

    #[test]
    fn aggregate_without_self_collision_pairs_with_singles() {
        let mut m = manager();
        let scene = Scene::default();
        let agg = m.create_aggregate(100, false);
        let (_, actor) = m
            .create_volume(Some(agg), None, Group(1), 0, cube(0.0, 1.0))
            .unwrap();
        m.create_volume(Some(agg), actor, Group(1), 1, cube(0.5, 1.5)).unwrap();
        m.create_volume(Some(agg), None, Group(2), 2, cube(5.0, 6.0)).unwrap();
        let single = m.create_volume(None, None, Group(7), 7, cube(5.5, 6.5)).unwrap().0;

        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.created()), vec![(2, 7)]);

        m.set_volume_bounds(single, cube(1.2, 1.4)).unwrap();
        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.created()), vec![(1, 7)]);
        assert_eq!(norm(out.deleted()), vec![(2, 7)]);

        m.set_volume_bounds(single, cube(50.0, 51.0)).unwrap();
        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.deleted()), vec![(1, 7)]);
    }

    #[test]
    fn aggregates_pair_shape_by_shape() {
        let mut m = manager();
        let scene = Scene::default();
        let a = m.create_aggregate(100, false);
        let b = m.create_aggregate(200, false);
        m.create_volume(Some(a), None, Group(1), 0, cube(0.0, 1.0)).unwrap();
        m.create_volume(Some(a), None, Group(2), 1, cube(4.0, 5.0)).unwrap();
        let (hb, _) = m
            .create_volume(Some(b), None, Group(3), 10, cube(4.5, 5.5))
            .unwrap();
        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.created()), vec![(1, 10)]);

        m.release_volume(hb).unwrap();
        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.deleted()), vec![(1, 10)]);
        assert!(m.delete_aggregate(b).is_ok());
        assert_eq!(m.aggregate_len(b), Err(BroadPhaseError::StaleHandle));
        assert!(m.update_aabbs_and_bp(&scene).is_empty());
    }

    #[test]
    fn actor_level_path_defers_shape_bounds() {
        let mut m = manager();
        let mut scene = Scene::default();
        let s0 = scene.shape(0, 0.0, 1.0);
        let s1 = scene.shape(0, 2.0, 3.0);
        let agg = m.create_aggregate(100, false);
        let (h0, actor) = m
            .create_volume(Some(agg), None, Group(1), s0, scene.shape_bounds(s0))
            .unwrap();
        m.create_volume(Some(agg), actor, Group(1), s1, scene.shape_bounds(s1)).unwrap();
        m.update_aabbs_and_bp(&scene);

        // No overlap yet: moving the actor only updates the aggregate bound.
        scene.offsets[0] = [100.0; 3];
        m.mark_dirty(h0).unwrap();
        m.update_aabbs_and_bp(&scene);
        assert_eq!(m.aggregate_bounds(agg).unwrap(), cube(100.0, 103.0));
        assert_eq!(m.volume_bounds(h0).unwrap(), cube(0.0, 1.0));

        // An overlap refreshes the stale shapes before they are swept.
        let other = scene.shape(1, 100.5, 100.8);
        m.create_volume(None, None, Group(9), other, scene.shape_bounds(other)).unwrap();
        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.created()), vec![(s0, other)]);
        assert_eq!(m.volume_bounds(h0).unwrap(), cube(100.0, 101.0));
    }

    #[test]
    fn releasing_beside_stale_shapes_refits_the_actor() {
        let mut m = manager();
        let mut scene = Scene::default();
        let s0 = scene.shape(0, 0.0, 1.0);
        let s1 = scene.shape(0, 2.0, 3.0);
        let agg = m.create_aggregate(100, false);
        let (h0, actor) = m
            .create_volume(Some(agg), None, Group(1), s0, scene.shape_bounds(s0))
            .unwrap();
        let h1 = m
            .create_volume(Some(agg), actor, Group(1), s1, scene.shape_bounds(s1))
            .unwrap()
            .0;
        m.update_aabbs_and_bp(&scene);
        scene.offsets[0] = [100.0; 3];
        m.mark_dirty(h0).unwrap();
        m.update_aabbs_and_bp(&scene);
        assert_eq!(m.aggregate_bounds(agg).unwrap(), cube(100.0, 103.0));

        // The released shape's extent must not linger in the actor bound.
        assert_eq!(m.release_volume(h1), Ok(false));
        let other = scene.shape(1, 102.0, 103.0);
        m.create_volume(None, None, Group(9), other, scene.shape_bounds(other))
            .unwrap();
        assert!(m.update_aabbs_and_bp(&scene).is_empty());
        assert_eq!(m.aggregate_bounds(agg).unwrap(), cube(100.0, 101.0));
        assert_eq!(m.volume_bounds(h0).unwrap(), cube(0.0, 1.0));
    }

    #[test]
    fn aggregate_limit_drops_shapes() {
        let mut m: TestManager = AabbManagerGeneric::with_config(
            ManagerConfig::default().with_max_aggregate_shapes(2),
            Sap::default(),
            InlineExecutor,
        );
        let agg = m.create_aggregate(0, false);
        m.create_volume(Some(agg), None, Group(1), 0, cube(0.0, 1.0)).unwrap();
        m.create_volume(Some(agg), None, Group(1), 1, cube(0.0, 1.0)).unwrap();
        assert_eq!(
            m.create_volume(Some(agg), None, Group(1), 2, cube(0.0, 1.0)),
            Err(BroadPhaseError::AggregateFull { max: 2 })
        );
        assert_eq!(m.aggregate_len(agg), Ok(2));
        assert_eq!(m.delete_aggregate(agg), Err(BroadPhaseError::AggregateNotEmpty(2)));
    }

    #[test]
    fn actor_handles_are_checked() {
        let mut m = manager();
        let a = m.create_aggregate(0, false);
        let b = m.create_aggregate(1, false);
        let (_, actor) = m.create_volume(Some(a), None, Group(1), 0, cube(0.0, 1.0)).unwrap();
        assert_eq!(
            m.create_volume(Some(b), actor, Group(1), 1, cube(0.0, 1.0)),
            Err(BroadPhaseError::ActorMismatch)
        );
        assert_eq!(
            m.create_volume(None, actor, Group(1), 1, cube(0.0, 1.0)),
            Err(BroadPhaseError::ActorMismatch)
        );
    }

    #[test]
    fn released_positions_are_reused_after_update() {
        let mut m = manager();
        let scene = Scene::default();
        let agg = m.create_aggregate(0, true);
        let (h0, _) = m.create_volume(Some(agg), None, Group(1), 0, cube(0.0, 1.0)).unwrap();
        m.create_volume(Some(agg), None, Group(2), 1, cube(0.5, 1.5)).unwrap();
        m.update_aabbs_and_bp(&scene);
        m.release_volume(h0).unwrap();
        m.update_aabbs_and_bp(&scene);

        m.create_volume(Some(agg), None, Group(3), 2, cube(0.6, 0.8)).unwrap();
        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.created()), vec![(1, 2)]);
        let agg_len = m.aggregates.get(agg.0).map(|a| a.len());
        assert_eq!(agg_len, Some(2));
    }

    #[test]
    fn emptied_aggregate_leaves_the_broadphase() {
        let mut m = manager();
        let scene = Scene::default();
        let agg = m.create_aggregate(0, false);
        let (h, _) = m.create_volume(Some(agg), None, Group(1), 0, cube(0.0, 1.0)).unwrap();
        m.create_volume(None, None, Group(2), 1, cube(0.5, 1.5)).unwrap();
        assert_eq!(norm(m.update_aabbs_and_bp(&scene).created()), vec![(0, 1)]);
        assert_eq!(m.broadphase().len(), 2);

        m.release_volume(h).unwrap();
        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.deleted()), vec![(0, 1)]);
        assert_eq!(m.broadphase().len(), 1);
        assert!(m.records.is_empty());
    }

    #[test]
    fn origin_shift_keeps_overlaps() {
        let mut m = manager();
        let scene = Scene::default();
        let agg = m.create_aggregate(0, true);
        m.create_volume(Some(agg), None, Group(1), 0, cube(0.0, 1.0)).unwrap();
        m.create_volume(Some(agg), None, Group(2), 1, cube(0.5, 1.5)).unwrap();
        m.create_volume(None, None, Group(3), 2, cube(1.2, 2.0)).unwrap();
        m.create_volume(None, None, Group(4), 3, cube(30.0, 31.0)).unwrap();
        assert_eq!(norm(m.update_aabbs_and_bp(&scene).created()), vec![(0, 1), (1, 2)]);

        m.shift_origin([10.0, -4.0, 2.5]);
        assert!(m.update_aabbs_and_bp(&scene).is_empty());
    }

    #[test]
    fn mbp_manager_reports_out_of_bounds() {
        let mut m: AabbManagerGeneric<u32, Mbp, InlineExecutor> =
            AabbManagerGeneric::with_broadphase(Mbp::default());
        let scene = Scene::default();
        m.add_region(cube(-10.0, 10.0), false).unwrap();
        m.create_volume(None, None, Group(1), 1, cube(0.0, 1.0)).unwrap();
        m.create_volume(None, None, Group(2), 2, cube(0.5, 1.5)).unwrap();
        let far = m.create_volume(None, None, Group(3), 3, cube(50.0, 51.0)).unwrap().0;
        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.created()), vec![(1, 2)]);
        assert_eq!(out.out_of_bounds(), &[3]);

        m.set_volume_bounds(far, cube(0.8, 2.0)).unwrap();
        let out = m.update_aabbs_and_bp(&scene);
        assert_eq!(norm(out.created()), vec![(1, 3), (2, 3)]);
    }
}
