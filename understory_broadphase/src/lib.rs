// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

// After you edit the crate's doc comment, run this command, then check README.md for any missing links
// cargo rdme --workspace-project=understory_broadphase --heading-base-level=0

//! Understory Broadphase: incremental 3D overlap tracking for physics simulation.
//!
//! The broadphase answers one question per frame: which pairs of axis-aligned boxes
//! started or stopped overlapping since the last frame?
//!
//! - Two engines behind the [`BroadPhase`] trait: incremental sweep-and-prune ([`Sap`]) and
//!   region-partitioned multi box pruning ([`Mbp`]).
//! - An [`AabbManager`] that maps shapes, actors, and aggregates onto engine boxes and turns
//!   bounds changes into created and deleted [`VolumePair`]s.
//! - Aggregates: groups of shapes that occupy a single engine box. Their shape-level overlaps
//!   are resolved with persistent bitmaps, so only changes are reported.
//!
//! Bounds are stored as order-preserving integer encodings of `f32` corners
//! ([`IntegerAabb`]), so every comparison in the engines is an integer comparison. Boxes
//! that share a [`Group`] never pair.
//!
//! ## Features
//!
//! - `parallel` *(default)*: runs independent stage work on the rayon pool through
//!   [`RayonExecutor`]. Without it, [`DefaultExecutor`] is [`InlineExecutor`].
//! - `checked`: validate engine input in release builds too. Debug builds always validate;
//!   a malformed update panics with the offending [`BroadPhaseError`].
//!
//! # Example
//!
//! ```rust
//! use understory_broadphase::{AabbManager, Bounds3, BoundsSource, Group};
//!
//! // Bounds are pushed explicitly, so the source is never consulted.
//! struct NoSource;
//! impl BoundsSource<u32> for NoSource {
//!     fn shape_bounds(&self, _: u32) -> Bounds3 {
//!         Bounds3::EMPTY
//!     }
//! }
//!
//! let mut m: AabbManager<u32> = AabbManager::new();
//! let cube = |lo: f32, hi: f32| Bounds3::new([lo; 3], [hi; 3]);
//! let (a, _) = m.create_volume(None, None, Group(1), 1, cube(0.0, 1.0)).unwrap();
//! m.create_volume(None, None, Group(2), 2, cube(0.5, 1.5)).unwrap();
//!
//! let out = m.update_aabbs_and_bp(&NoSource);
//! assert_eq!(out.created().len(), 1);
//!
//! // Move the first box away: the pair is deleted.
//! m.set_volume_bounds(a, cube(10.0, 11.0)).unwrap();
//! let out = m.update_aabbs_and_bp(&NoSource);
//! assert_eq!(out.deleted().len(), 1);
//! ```
//!
//! Aggregates report shape pairs, not aggregate pairs:
//!
//! ```rust
//! use understory_broadphase::{AabbManager, Bounds3, BoundsSource, Group};
//!
//! struct NoSource;
//! impl BoundsSource<u32> for NoSource {
//!     fn shape_bounds(&self, _: u32) -> Bounds3 {
//!         Bounds3::EMPTY
//!     }
//! }
//!
//! let mut m: AabbManager<u32> = AabbManager::new();
//! let cube = |lo: f32, hi: f32| Bounds3::new([lo; 3], [hi; 3]);
//! let ragdoll = m.create_aggregate(100, true);
//! m.create_volume(Some(ragdoll), None, Group(1), 0, cube(0.0, 1.0)).unwrap();
//! m.create_volume(Some(ragdoll), None, Group(2), 1, cube(0.5, 1.5)).unwrap();
//! m.create_volume(Some(ragdoll), None, Group(3), 2, cube(10.0, 11.0)).unwrap();
//!
//! let out = m.update_aabbs_and_bp(&NoSource);
//! let pair = out.created()[0];
//! assert_eq!((pair.a.min(pair.b), pair.a.max(pair.b)), (0, 1));
//! ```
//!
//! ## Choosing an engine
//!
//! - [`Sap`] (default): keeps three sorted endpoint axes and patches them incrementally. Cheap
//!   when motion between frames is small and coherent.
//! - [`Mbp`]: partitions the world into user-supplied regions and brute-sweeps each region.
//!   Scales better with large worlds and fast movers. Boxes outside every region are
//!   reported out of bounds and tracked no further.
//!
//! ### Float semantics
//!
//! Bounds must not contain NaN. A box with `min > max` on any axis is malformed.

mod aggregate;
mod arena;
pub mod backends;
mod bitmap;
mod broadphase;
mod error;
mod manager;
mod pair_manager;
mod pipeline;
mod radix;
mod slot_map;
mod sweep;
mod types;

pub use backends::{MAX_REGIONS, Mbp, MbpConfig, MbpPairFlags, Sap, SapConfig};
pub use bitmap::{BitMap, PairBitmap, SelfCollisionBitmap};
pub use broadphase::{BroadPhase, UpdateData};
pub use error::{BroadPhaseError, Result};
pub use manager::{
    AabbManager, AabbManagerGeneric, ActorHandle, AggregateId, BoundsSource, MAX_AGGREGATE_SHAPES,
    ManagerConfig, Overlaps, VolumeHandle, VolumePair,
};
pub use pair_manager::{Pair, PairManager, PairState};
#[cfg(feature = "parallel")]
pub use pipeline::RayonExecutor;
pub use pipeline::{DefaultExecutor, Executor, InlineExecutor};
pub use radix::RadixSort;
pub use types::{BpPair, Bounds3, Group, IntegerAabb, decode_float, encode_float, encode_max, encode_min};
