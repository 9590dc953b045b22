// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error type shared by the broadphase engines and the AABB manager.

/// Errors reported by broadphase and manager operations.
///
/// Capacity errors are also logged, and the offending addition is dropped. Contract
/// violations are only detected when input validation runs (debug builds or the
/// `checked` feature).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum BroadPhaseError {
    /// The engine already holds the maximum number of regions.
    #[error("maximum number of broadphase regions reached ({max})")]
    RegionLimit {
        /// Configured region capacity.
        max: usize,
    },

    /// The region handle does not name a live region.
    #[error("invalid region handle {0}")]
    InvalidRegion(u32),

    /// The engine does not partition space into regions.
    #[error("this broadphase does not support regions")]
    RegionsUnsupported,

    /// The aggregate already holds the maximum number of shapes.
    #[error("aggregate exceeded the limit of {max} shapes; shape not added to the broadphase")]
    AggregateFull {
        /// Configured per-aggregate shape capacity.
        max: usize,
    },

    /// A handle refers to a slot that was freed or reused.
    #[error("stale or unknown handle")]
    StaleHandle,

    /// An actor handle was passed for a shape that does not belong to the actor's aggregate.
    #[error("actor does not belong to the given aggregate")]
    ActorMismatch,

    /// The aggregate still has live shapes.
    #[error("aggregate still owns {0} live shapes")]
    AggregateNotEmpty(usize),

    /// A created or updated box has min >= max on some axis.
    #[error("malformed bounds for box {handle}")]
    MalformedBounds {
        /// Offending box handle.
        handle: u32,
    },

    /// A box handle appears twice across the created, updated, and removed lists.
    #[error("box {handle} listed more than once in one update")]
    DuplicateHandle {
        /// Offending box handle.
        handle: u32,
    },

    /// A box handle lies beyond the bounds and group arrays.
    #[error("box {handle} out of range (capacity {capacity})")]
    HandleOutOfRange {
        /// Offending box handle.
        handle: u32,
        /// Length of the bounds and group arrays.
        capacity: usize,
    },

    /// A created box is already live, or an updated/removed box is not.
    #[error("box {handle} has the wrong liveness for its update list")]
    Liveness {
        /// Offending box handle.
        handle: u32,
    },
}

/// Result alias used throughout the crate.
pub type Result<T, E = BroadPhaseError> = core::result::Result<T, E>;
