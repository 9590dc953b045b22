// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Broadphase engine abstraction and per-update input.

use crate::bitmap::BitMap;
use crate::error::{BroadPhaseError, Result};
use crate::pipeline::Executor;
use crate::types::{BpPair, Group, IntegerAabb};

/// One update's worth of input for a broadphase engine.
///
/// `bounds` and `groups` are indexed by box handle and cover every live box; the three
/// lists name the boxes that changed since the previous update.
#[derive(Copy, Clone, Debug)]
pub struct UpdateData<'a> {
    /// Boxes entering the broadphase.
    pub created: &'a [u32],
    /// Live boxes whose bounds changed.
    pub updated: &'a [u32],
    /// Boxes leaving the broadphase.
    pub removed: &'a [u32],
    /// Current encoded bounds per box handle.
    pub bounds: &'a [IntegerAabb],
    /// Collision group per box handle.
    pub groups: &'a [Group],
    /// Number of box handles the arrays are sized for.
    pub capacity: usize,
}

impl<'a> UpdateData<'a> {
    /// Build input for an update.
    pub fn new(
        created: &'a [u32],
        updated: &'a [u32],
        removed: &'a [u32],
        bounds: &'a [IntegerAabb],
        groups: &'a [Group],
    ) -> Self {
        Self {
            created,
            updated,
            removed,
            bounds,
            groups,
            capacity: bounds.len().min(groups.len()),
        }
    }

    /// Whether the update carries no change.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Check the handle ranges, list disjointness, and bounds validity.
    ///
    /// Liveness of the handles is checked by [`BroadPhase::validate`], which knows which
    /// boxes the engine holds.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BitMap::new();
        seen.resize(self.capacity);
        let lists = [self.created, self.updated, self.removed];
        for (list_index, list) in lists.iter().enumerate() {
            for &handle in *list {
                let h = handle as usize;
                if h >= self.capacity {
                    return Err(BroadPhaseError::HandleOutOfRange {
                        handle,
                        capacity: self.capacity,
                    });
                }
                if seen.test(h) {
                    return Err(BroadPhaseError::DuplicateHandle { handle });
                }
                seen.set(h);
                // Removed boxes may carry any bounds.
                if list_index < 2 && !self.bounds[h].is_valid() {
                    return Err(BroadPhaseError::MalformedBounds { handle });
                }
            }
        }
        Ok(())
    }
}

/// Validate liveness of an update against a per-handle liveness test.
pub(crate) fn validate_liveness(data: &UpdateData<'_>, is_live: impl Fn(u32) -> bool) -> Result<()> {
    data.validate()?;
    for &handle in data.created {
        if is_live(handle) {
            return Err(BroadPhaseError::Liveness { handle });
        }
    }
    for &handle in data.updated.iter().chain(data.removed) {
        if !is_live(handle) {
            return Err(BroadPhaseError::Liveness { handle });
        }
    }
    Ok(())
}

/// Whether input validation runs on every update.
pub(crate) const CHECKED: bool = cfg!(any(debug_assertions, feature = "checked"));

/// A broadphase engine: maintains the set of overlapping box pairs across updates.
///
/// After each [`update`][Self::update], [`created_pairs`][Self::created_pairs] and
/// [`deleted_pairs`][Self::deleted_pairs] describe how the overlap set changed. Pairs are
/// reported once, never between boxes of the same group, and pairs of removed boxes are
/// reported as deleted in the update that removes them.
pub trait BroadPhase {
    /// Apply one update and compute the created and deleted pairs.
    fn update<E: Executor>(&mut self, data: &UpdateData<'_>, exec: &E);

    /// Pairs that started overlapping during the last update.
    fn created_pairs(&self) -> &[BpPair];

    /// Pairs that stopped overlapping during the last update.
    fn deleted_pairs(&self) -> &[BpPair];

    /// Boxes that left every region during the last update.
    fn out_of_bounds(&self) -> &[u32] {
        &[]
    }

    /// Release per-frame buffers back to their default capacities.
    fn free_buffers(&mut self);

    /// Translate stored bounds by `-shift`.
    ///
    /// `bounds` holds the already shifted encoded bounds of every live box. Pair state is
    /// not recomputed.
    fn shift_origin(&mut self, shift: [f32; 3], bounds: &[IntegerAabb]);

    /// Check an update against the engine's state before it is applied.
    fn validate(&self, data: &UpdateData<'_>) -> Result<()>;

    /// Add a region. Engines without regions return [`BroadPhaseError::RegionsUnsupported`].
    fn add_region(
        &mut self,
        bounds: IntegerAabb,
        populate: bool,
        all_bounds: &[IntegerAabb],
    ) -> Result<u32> {
        let _ = (bounds, populate, all_bounds);
        Err(BroadPhaseError::RegionsUnsupported)
    }

    /// Remove a region. Engines without regions return [`BroadPhaseError::RegionsUnsupported`].
    fn remove_region(&mut self, handle: u32) -> Result<()> {
        let _ = handle;
        Err(BroadPhaseError::RegionsUnsupported)
    }

    /// Number of live regions.
    fn region_count(&self) -> usize {
        0
    }

    /// Number of live boxes.
    fn len(&self) -> usize;

    /// Whether the engine holds no box.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
