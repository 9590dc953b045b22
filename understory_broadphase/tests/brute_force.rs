// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Randomized equivalence against an all-pairs overlap test.
//!
//! Every frame applies a random mix of creations, moves, and removals, then checks that the
//! pairs accumulated from the created and deleted lists equal the brute-force overlap set.

use std::collections::BTreeSet;

use proptest::prelude::*;
use understory_broadphase::{
    AabbManagerGeneric, AggregateId, Bounds3, BoundsSource, BpPair, BroadPhase, DefaultExecutor,
    Executor, Group, InlineExecutor, IntegerAabb, Mbp, Sap, UpdateData, VolumeHandle, VolumePair,
};

const SLOTS: usize = 24;

/// One slot's action in a frame: 0 = idle, 1-2 = create or move, 3 = remove.
#[derive(Copy, Clone, Debug)]
struct Op {
    kind: u8,
    min: [u8; 3],
    size: [u8; 3],
}

impl Op {
    /// Half-unit grid coordinates, so touching faces and point boxes are common.
    fn bounds(&self) -> Bounds3 {
        let min = self.min.map(|v| f32::from(v) * 0.5);
        let mut max = min;
        for (m, s) in max.iter_mut().zip(self.size) {
            *m += f32::from(s) * 0.5;
        }
        Bounds3::new(min, max)
    }
}

fn arb_op() -> impl Strategy<Value = Op> {
    (
        0_u8..4,
        prop::array::uniform3(0_u8..40),
        prop::array::uniform3(0_u8..12),
    )
        .prop_map(|(kind, min, size)| Op { kind, min, size })
}

fn arb_frames() -> impl Strategy<Value = Vec<Vec<Op>>> {
    prop::collection::vec(prop::collection::vec(arb_op(), SLOTS), 1..10)
}

fn handle(slot: usize) -> u32 {
    u32::try_from(slot).unwrap()
}

/// Handle lists of one engine update.
#[derive(Clone, Debug, Default)]
struct Frame {
    created: Vec<u32>,
    updated: Vec<u32>,
    removed: Vec<u32>,
}

impl Frame {
    fn reversed(&self) -> Self {
        let rev = |v: &[u32]| v.iter().rev().copied().collect();
        Self {
            created: rev(&self.created),
            updated: rev(&self.updated),
            removed: rev(&self.removed),
        }
    }
}

/// Fold an engine's output into the running pair set.
fn accumulate<B: BroadPhase>(bp: &B, pairs: &mut BTreeSet<BpPair>) -> Result<(), TestCaseError> {
    for p in bp.deleted_pairs() {
        prop_assert!(pairs.remove(p), "deleted {:?} was never created", p);
    }
    for p in bp.created_pairs() {
        prop_assert!(pairs.insert(*p), "created {:?} twice", p);
    }
    Ok(())
}

/// Engine-level world: raw handles, encoded bounds, and groups.
struct EngineHarness {
    bounds: Vec<IntegerAabb>,
    groups: Vec<Group>,
    live: Vec<bool>,
    pairs: BTreeSet<BpPair>,
}

impl EngineHarness {
    fn new() -> Self {
        Self {
            bounds: vec![IntegerAabb::EMPTY; SLOTS],
            // Five groups including the static group, so equal-group filtering is exercised.
            groups: (0..SLOTS).map(|s| Group(handle(s % 5))).collect(),
            live: vec![false; SLOTS],
            pairs: BTreeSet::new(),
        }
    }

    fn expected(&self) -> BTreeSet<BpPair> {
        let mut out = BTreeSet::new();
        for i in 0..SLOTS {
            for j in i + 1..SLOTS {
                if self.live[i]
                    && self.live[j]
                    && self.groups[i] != self.groups[j]
                    && self.bounds[i].intersects(&self.bounds[j])
                {
                    out.insert(BpPair::ordered(handle(i), handle(j)));
                }
            }
        }
        out
    }

    /// Apply one frame of ops to the world and return the resulting handle lists.
    fn apply(&mut self, ops: &[Op]) -> Frame {
        let mut frame = Frame::default();
        for (slot, op) in ops.iter().enumerate() {
            match (op.kind, self.live[slot]) {
                (1 | 2, live) => {
                    self.bounds[slot] = IntegerAabb::encode(&op.bounds());
                    if live {
                        frame.updated.push(handle(slot));
                    } else {
                        self.live[slot] = true;
                        frame.created.push(handle(slot));
                    }
                }
                (3, true) => {
                    self.live[slot] = false;
                    frame.removed.push(handle(slot));
                }
                _ => {}
            }
        }
        frame
    }

    fn feed<B: BroadPhase, E: Executor>(&self, bp: &mut B, exec: &E, frame: &Frame) {
        let data = UpdateData::new(
            &frame.created,
            &frame.updated,
            &frame.removed,
            &self.bounds,
            &self.groups,
        );
        bp.update(&data, exec);
    }

    fn step<B: BroadPhase, E: Executor>(
        &mut self,
        bp: &mut B,
        exec: &E,
        ops: &[Op],
    ) -> Result<(), TestCaseError> {
        let frame = self.apply(ops);
        self.feed(bp, exec, &frame);
        let mut pairs = core::mem::take(&mut self.pairs);
        accumulate(bp, &mut pairs)?;
        self.pairs = pairs;
        prop_assert_eq!(&self.pairs, &self.expected());
        Ok(())
    }

    /// Feed every frame to `forward` as built and to `backward` with each list reversed.
    fn step_both_orders<B: BroadPhase>(
        &mut self,
        forward: &mut B,
        backward: &mut B,
        mirror: &mut BTreeSet<BpPair>,
        ops: &[Op],
    ) -> Result<(), TestCaseError> {
        let frame = self.apply(ops);
        self.feed(forward, &InlineExecutor, &frame);
        self.feed(backward, &InlineExecutor, &frame.reversed());
        let mut pairs = core::mem::take(&mut self.pairs);
        accumulate(forward, &mut pairs)?;
        self.pairs = pairs;
        accumulate(backward, mirror)?;
        prop_assert_eq!(&self.pairs, &*mirror);
        prop_assert_eq!(&self.pairs, &self.expected());
        Ok(())
    }
}

/// 4 x 4 tiles covering every box the strategy can produce.
fn tiled_mbp() -> Mbp {
    let mut mbp = Mbp::default();
    for x in 0_u8..4 {
        for y in 0_u8..4 {
            let (x, y) = (f32::from(x) * 7.0, f32::from(y) * 7.0);
            let tile = Bounds3::new([x, y, -1.0], [x + 7.0, y + 7.0, 30.0]);
            mbp.add_region(IntegerAabb::encode(&tile), false, &[]).unwrap();
        }
    }
    mbp
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn sap_matches_brute_force(frames in arb_frames()) {
        let mut sap = Sap::default();
        let mut world = EngineHarness::new();
        for ops in &frames {
            world.step(&mut sap, &InlineExecutor, ops)?;
            prop_assert!(sap.is_self_consistent());
        }
    }

    #[test]
    fn mbp_matches_brute_force(frames in arb_frames()) {
        let mut mbp = tiled_mbp();
        let mut world = EngineHarness::new();
        for ops in &frames {
            world.step(&mut mbp, &DefaultExecutor::default(), ops)?;
            prop_assert!(mbp.out_of_bounds().is_empty());
        }
    }

    #[test]
    fn sap_ignores_list_order(frames in arb_frames()) {
        let (mut forward, mut backward) = (Sap::default(), Sap::default());
        let mut mirror = BTreeSet::new();
        let mut world = EngineHarness::new();
        for ops in &frames {
            world.step_both_orders(&mut forward, &mut backward, &mut mirror, ops)?;
        }
    }

    #[test]
    fn mbp_ignores_list_order(frames in arb_frames()) {
        let (mut forward, mut backward) = (tiled_mbp(), tiled_mbp());
        let mut mirror = BTreeSet::new();
        let mut world = EngineHarness::new();
        for ops in &frames {
            world.step_both_orders(&mut forward, &mut backward, &mut mirror, ops)?;
        }
    }

    #[test]
    fn manager_matches_brute_force(frames in arb_frames()) {
        let mut world = ManagerHarness::new();
        for ops in &frames {
            world.step(ops)?;
        }
    }

    #[test]
    fn actor_path_over_sap_matches_brute_force(locals in arb_locals(), frames in arb_poses()) {
        let mut world = ActorHarness::new(Sap::default(), locals);
        world.step(&[None; ACTORS])?;
        for poses in &frames {
            world.step(poses)?;
        }
    }

    #[test]
    fn actor_path_over_mbp_matches_brute_force(locals in arb_locals(), frames in arb_poses()) {
        let mut mbp = Mbp::default();
        for x in 0_u8..4 {
            for y in 0_u8..4 {
                let (x, y) = (f32::from(x) * 12.0 - 1.0, f32::from(y) * 12.0 - 1.0);
                let tile = Bounds3::new([x, y, -1.0], [x + 12.0, y + 12.0, 50.0]);
                mbp.add_region(IntegerAabb::encode(&tile), false, &[]).unwrap();
            }
        }
        let mut world = ActorHarness::new(mbp, locals);
        world.step(&[None; ACTORS])?;
        for poses in &frames {
            world.step(poses)?;
        }
    }
}

/// Bounds are always pushed explicitly in these tests.
struct Pushed;

impl BoundsSource<u32> for Pushed {
    fn shape_bounds(&self, _: u32) -> Bounds3 {
        Bounds3::EMPTY
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Membership {
    SelfColliding,
    Plain,
    Single,
}

fn membership(slot: usize) -> Membership {
    match slot % 4 {
        0 => Membership::SelfColliding,
        1 => Membership::Plain,
        _ => Membership::Single,
    }
}

/// Manager-level world: singles plus two aggregates, one of them self-colliding.
struct ManagerHarness {
    manager: AabbManagerGeneric<u32, Sap, InlineExecutor>,
    aggregates: [AggregateId; 2],
    volumes: Vec<Option<(VolumeHandle, IntegerAabb)>>,
    pairs: BTreeSet<(u32, u32)>,
}

impl ManagerHarness {
    fn new() -> Self {
        let mut manager = AabbManagerGeneric::with_broadphase(Sap::default());
        let aggregates = [
            manager.create_aggregate(1000, true),
            manager.create_aggregate(1001, false),
        ];
        Self {
            manager,
            aggregates,
            volumes: vec![None; SLOTS],
            pairs: BTreeSet::new(),
        }
    }

    fn group(slot: usize) -> Group {
        Group(handle(slot % 3 + 1))
    }

    fn expected(&self) -> BTreeSet<(u32, u32)> {
        let mut out = BTreeSet::new();
        for i in 0..SLOTS {
            for j in i + 1..SLOTS {
                let (Some((_, a)), Some((_, b))) = (self.volumes[i], self.volumes[j]) else {
                    continue;
                };
                let same_aggregate =
                    membership(i) == membership(j) && membership(i) != Membership::Single;
                if same_aggregate && membership(i) == Membership::Plain {
                    continue;
                }
                if Self::group(i) != Self::group(j) && a.intersects(&b) {
                    out.insert((handle(i), handle(j)));
                }
            }
        }
        out
    }

    fn step(&mut self, ops: &[Op]) -> Result<(), TestCaseError> {
        for (slot, op) in ops.iter().enumerate() {
            let bounds = op.bounds();
            match (op.kind, self.volumes[slot]) {
                (1 | 2, None) => {
                    let aggregate = match membership(slot) {
                        Membership::SelfColliding => Some(self.aggregates[0]),
                        Membership::Plain => Some(self.aggregates[1]),
                        Membership::Single => None,
                    };
                    let (h, _) = self
                        .manager
                        .create_volume(aggregate, None, Self::group(slot), handle(slot), bounds)
                        .unwrap();
                    self.volumes[slot] = Some((h, IntegerAabb::encode(&bounds)));
                }
                (1 | 2, Some((h, _))) => {
                    self.manager.set_volume_bounds(h, bounds).unwrap();
                    self.volumes[slot] = Some((h, IntegerAabb::encode(&bounds)));
                }
                (3, Some((h, _))) => {
                    self.manager.release_volume(h).unwrap();
                    self.volumes[slot] = None;
                }
                _ => {}
            }
        }

        let out = self.manager.update_aabbs_and_bp(&Pushed);
        let norm = |p: &VolumePair<u32>| (p.a.min(p.b), p.a.max(p.b));
        for p in out.deleted() {
            prop_assert!(self.pairs.remove(&norm(p)), "deleted {:?} was never created", p);
        }
        for p in out.created() {
            prop_assert!(self.pairs.insert(norm(p)), "created {:?} twice", p);
        }
        prop_assert_eq!(&self.pairs, &self.expected());
        Ok(())
    }
}

const ACTORS: usize = 6;
const SHAPES_PER_ACTOR: usize = 2;
const SHAPES: usize = ACTORS * SHAPES_PER_ACTOR;

/// Aggregate joined by each actor's shapes; `None` makes them single volumes.
const LAYOUT: [Option<usize>; ACTORS] = [Some(0), Some(0), Some(1), Some(2), None, None];
/// Self-collision flag per aggregate.
const SELF_COLLIDE: [bool; 3] = [false, true, false];

/// Actor-local shape boxes and per-actor translations, both on the half-unit grid.
struct Poses {
    local: Vec<Bounds3>,
    offsets: [[f32; 3]; ACTORS],
}

impl BoundsSource<u32> for Poses {
    fn shape_bounds(&self, shape: u32) -> Bounds3 {
        self.actor_world_bounds(shape, &self.local[shape as usize])
    }

    fn shape_local_bounds(&self, shape: u32) -> Bounds3 {
        self.local[shape as usize]
    }

    fn actor_world_bounds(&self, shape: u32, local: &Bounds3) -> Bounds3 {
        let offset = self.offsets[shape as usize / SHAPES_PER_ACTOR];
        local.shifted(offset.map(|v| -v))
    }
}

fn arb_locals() -> impl Strategy<Value = Vec<Bounds3>> {
    let shape = (
        prop::array::uniform3(0_u8..20),
        prop::array::uniform3(0_u8..8),
    )
        .prop_map(|(min, size)| Op { kind: 1, min, size }.bounds());
    prop::collection::vec(shape, SHAPES)
}

/// Per frame, an optional new translation for each actor.
fn arb_poses() -> impl Strategy<Value = Vec<[Option<[u8; 3]>; ACTORS]>> {
    let pose = prop::option::of(prop::array::uniform3(0_u8..60));
    prop::collection::vec(prop::array::uniform6(pose), 1..16)
}

/// Manager-level world whose bounds are only ever pulled through [`BoundsSource`].
struct ActorHarness<B> {
    manager: AabbManagerGeneric<u32, B, InlineExecutor>,
    poses: Poses,
    volumes: Vec<VolumeHandle>,
    pairs: BTreeSet<(u32, u32)>,
}

impl<B: BroadPhase> ActorHarness<B> {
    fn new(bp: B, local: Vec<Bounds3>) -> Self {
        let mut manager = AabbManagerGeneric::with_broadphase(bp);
        let poses = Poses {
            local,
            offsets: [[0.0; 3]; ACTORS],
        };
        let aggregates: Vec<AggregateId> = SELF_COLLIDE
            .iter()
            .enumerate()
            .map(|(i, &self_collide)| manager.create_aggregate(1000 + handle(i), self_collide))
            .collect();
        let mut volumes = Vec::with_capacity(SHAPES);
        for (actor, layout) in LAYOUT.iter().enumerate() {
            let aggregate = layout.map(|a| aggregates[a]);
            let mut actor_handle = None;
            for s in actor * SHAPES_PER_ACTOR..(actor + 1) * SHAPES_PER_ACTOR {
                let shape = handle(s);
                let (h, owner) = manager
                    .create_volume(
                        aggregate,
                        actor_handle,
                        Self::group(s),
                        shape,
                        poses.shape_bounds(shape),
                    )
                    .unwrap();
                actor_handle = owner;
                volumes.push(h);
            }
        }
        Self {
            manager,
            poses,
            volumes,
            pairs: BTreeSet::new(),
        }
    }

    fn group(shape: usize) -> Group {
        Group(handle(shape % 3 + 1))
    }

    fn expected(&self) -> BTreeSet<(u32, u32)> {
        let world: Vec<IntegerAabb> = (0..SHAPES)
            .map(|s| IntegerAabb::encode(&self.poses.shape_bounds(handle(s))))
            .collect();
        let aggregate = |s: usize| LAYOUT[s / SHAPES_PER_ACTOR];
        let mut out = BTreeSet::new();
        for i in 0..SHAPES {
            for j in i + 1..SHAPES {
                if let (Some(a), Some(b)) = (aggregate(i), aggregate(j))
                    && a == b
                    && !SELF_COLLIDE[a]
                {
                    continue;
                }
                if Self::group(i) != Self::group(j) && world[i].intersects(&world[j]) {
                    out.insert((handle(i), handle(j)));
                }
            }
        }
        out
    }

    fn step(&mut self, poses: &[Option<[u8; 3]>; ACTORS]) -> Result<(), TestCaseError> {
        for (actor, pose) in poses.iter().enumerate() {
            let Some(offset) = pose else {
                continue;
            };
            self.poses.offsets[actor] = offset.map(|v| f32::from(v) * 0.5);
            let shapes = actor * SHAPES_PER_ACTOR..(actor + 1) * SHAPES_PER_ACTOR;
            if LAYOUT[actor].is_some() {
                // One shape is enough: the whole actor is pulled.
                self.manager.mark_dirty(self.volumes[shapes.start]).unwrap();
            } else {
                for s in shapes {
                    self.manager.mark_dirty(self.volumes[s]).unwrap();
                }
            }
        }

        let out = self.manager.update_aabbs_and_bp(&self.poses);
        prop_assert!(out.out_of_bounds().is_empty());
        let norm = |p: &VolumePair<u32>| (p.a.min(p.b), p.a.max(p.b));
        for p in out.deleted() {
            prop_assert!(self.pairs.remove(&norm(p)), "deleted {:?} was never created", p);
        }
        for p in out.created() {
            prop_assert!(self.pairs.insert(norm(p)), "created {:?} twice", p);
        }
        prop_assert_eq!(&self.pairs, &self.expected());
        Ok(())
    }
}
