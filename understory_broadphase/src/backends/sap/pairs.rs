// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pair bookkeeping for the sweep-and-prune engine.
//!
//! Events of one update are folded into pair states; the frame's touched list is then
//! turned into created and deleted pairs. A pair both created and removed within the
//! same update is never reported.

use crate::bitmap::BitMap;
use crate::pair_manager::{PairManager, PairState};
use crate::types::{BpPair, Group};

#[derive(Debug)]
pub(super) struct SapPairs {
    table: PairManager<PairState>,
    touched: Vec<BpPair>,
    doomed: Vec<BpPair>,
}

impl SapPairs {
    pub(super) fn new(max_pairs: usize, min_capacity: usize, list_capacity: usize) -> Self {
        Self {
            table: PairManager::new(max_pairs, min_capacity),
            touched: Vec::with_capacity(list_capacity),
            doomed: Vec::new(),
        }
    }

    pub(super) fn len(&self) -> usize {
        self.table.len()
    }

    pub(super) fn contains(&self, a: u32, b: u32) -> bool {
        self.table.find(a, b).is_some()
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = BpPair> + '_ {
        self.table.iter().map(|p| BpPair { a: p.id0, b: p.id1 })
    }

    /// Record that `a` and `b` overlap.
    pub(super) fn add_pair(&mut self, a: u32, b: u32, groups: &[Group]) {
        if groups[a as usize] == groups[b as usize] {
            return;
        }
        let Some((index, _)) = self.table.add(a, b, PairState::UNKNOWN) else {
            return;
        };
        let state = self.table.state_mut(index);
        if state.contains(PairState::UNKNOWN) {
            *state = PairState::NEW | PairState::IN_ARRAY;
            self.touched.push(BpPair::ordered(a, b));
        }
        state.remove(PairState::REMOVED);
    }

    /// Record that `a` and `b` stopped overlapping.
    pub(super) fn remove_pair(&mut self, a: u32, b: u32) {
        let Some(index) = self.table.find(a, b) else {
            return;
        };
        let state = self.table.state_mut(index);
        if !state.contains(PairState::IN_ARRAY) {
            state.insert(PairState::IN_ARRAY);
            self.touched.push(BpPair::ordered(a, b));
        }
        state.insert(PairState::REMOVED);
    }

    /// Resolve the touched pairs into created and deleted lists.
    pub(super) fn compute_created_deleted(&mut self, created: &mut Vec<BpPair>, deleted: &mut Vec<BpPair>) {
        let mut doomed = core::mem::take(&mut self.doomed);
        for &p in &self.touched {
            let Some(index) = self.table.find(p.a, p.b) else {
                continue;
            };
            let state = self.table.state_mut(index);
            state.remove(PairState::IN_ARRAY);
            if state.contains(PairState::REMOVED) {
                if !state.contains(PairState::NEW) {
                    deleted.push(p);
                }
                doomed.push(p);
            } else {
                if state.contains(PairState::NEW) {
                    created.push(p);
                }
                state.remove(PairState::NEW);
            }
        }
        for p in doomed.drain(..) {
            self.table.remove(p.a, p.b);
        }
        self.doomed = doomed;
        self.touched.clear();
        self.table.shrink_memory();
    }

    /// Drop every pair touching a flagged box and report it as deleted.
    pub(super) fn remove_boxes(&mut self, removed: &BitMap, deleted: &mut Vec<BpPair>) {
        self.table.retain(|p| {
            let gone = removed.test(p.id0 as usize) || removed.test(p.id1 as usize);
            if gone {
                deleted.push(BpPair { a: p.id0, b: p.id1 });
            }
            !gone
        });
    }

    pub(super) fn shrink(&mut self, list_capacity: usize) {
        self.table.shrink_memory();
        self.touched = Vec::with_capacity(list_capacity);
        self.doomed = Vec::new();
    }
}
