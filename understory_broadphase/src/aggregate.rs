// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shape-level overlap resolution for aggregates.
//!
//! The broadphase only sees one box per aggregate. When that box overlaps something, the
//! aggregate's elements are swept against the other side and the result is diffed against
//! a bitmap of the previous update's overlaps. Positions are indices into the aggregate's
//! element table; a tombstoned position never appears in a sorted list.

use crate::bitmap::{PairBitmap, SelfCollisionBitmap};
use crate::radix::RadixSort;
use crate::sweep;
use crate::types::{Group, IntegerAabb};

/// One element of a sorted aggregate list.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct SortedElement {
    pub(crate) position: u32,
    pub(crate) bounds: IntegerAabb,
    pub(crate) group: Group,
}

impl SortedElement {
    #[inline]
    fn x(&self) -> (u32, u32) {
        (self.bounds.min[0], self.bounds.max[0])
    }

    #[inline]
    fn confirms(&self, other: &Self) -> bool {
        self.group != other.group && self.bounds.intersects_yz(&other.bounds)
    }
}

/// Overlap changes of one relationship, as pairs of positions.
#[derive(Clone, Debug, Default)]
pub(crate) struct PairDiff {
    pub(crate) created: Vec<(u32, u32)>,
    pub(crate) lost: Vec<(u32, u32)>,
}

impl PairDiff {
    pub(crate) fn is_empty(&self) -> bool {
        self.created.is_empty() && self.lost.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.created.clear();
        self.lost.clear();
    }
}

/// Fill `out` with the live elements of an aggregate, ordered by encoded min x.
pub(crate) fn sort_aggregate(
    bounds: &[IntegerAabb],
    groups: &[Group],
    radix: &mut RadixSort,
    keys: &mut Vec<u32>,
    out: &mut Vec<SortedElement>,
) {
    out.clear();
    keys.clear();
    let live = groups
        .iter()
        .enumerate()
        .filter(|(_, g)| !g.is_invalid())
        .map(|(i, &group)| SortedElement {
            position: position(i),
            bounds: bounds[i],
            group,
        });
    out.extend(live);
    keys.extend(out.iter().map(|e| e.bounds.min[0]));
    let ranks = radix.sort_u32(keys);
    let unsorted: Vec<SortedElement> = core::mem::take(out);
    out.extend(ranks.iter().map(|&r| unsorted[r as usize]));
}

/// Sweep an aggregate against itself and update its self-collision bitmap.
///
/// `tombstoned` names positions released since the bitmap was last updated; their old
/// bits are dropped without being reported lost.
pub(crate) fn self_collide(
    sorted: &[SortedElement],
    len: usize,
    bitmap: &mut SelfCollisionBitmap,
    tombstoned: impl Fn(u32) -> bool,
    diff: &mut PairDiff,
) {
    bitmap.promote(len);
    let mut fresh = SelfCollisionBitmap::default();
    fresh.promote(len);
    sweep::complete(sorted, SortedElement::x, |a, b| {
        if a.confirms(b) {
            let (i, j) = (a.position as usize, b.position as usize);
            fresh.set(i, j);
            if !bitmap.test(i, j) {
                diff.created.push(ordered(a.position, b.position));
            }
        }
    });
    for (i, j) in bitmap.iter() {
        let (i, j) = (position(i), position(j));
        if !fresh.test(i as usize, j as usize) && !tombstoned(i) && !tombstoned(j) {
            diff.lost.push((i, j));
        }
    }
    *bitmap = fresh;
}

/// Sweep two sorted lists against each other and update their pair bitmap.
///
/// `rows` and `cols` are the element counts of the two sides; the bitmap is promoted to
/// cover them first.
pub(crate) fn aggregate_aggregate(
    lhs: &[SortedElement],
    rhs: &[SortedElement],
    (rows, cols): (usize, usize),
    bitmap: &mut PairBitmap,
    tombstoned: impl Fn(u32, u32) -> bool,
    diff: &mut PairDiff,
) {
    bitmap.promote(rows, cols);
    let mut fresh = PairBitmap::new(rows, cols);
    sweep::bipartite(lhs, rhs, SortedElement::x, SortedElement::x, |a, b| {
        if a.confirms(b) {
            let (i, j) = (a.position as usize, b.position as usize);
            fresh.set(i, j);
            if !bitmap.test(i, j) {
                diff.created.push((a.position, b.position));
            }
        }
    });
    for (i, j) in bitmap.iter() {
        let (i, j) = (position(i), position(j));
        if !fresh.test(i as usize, j as usize) && !tombstoned(i, j) {
            diff.lost.push((i, j));
        }
    }
    *bitmap = fresh;
}

/// Sweep an aggregate against one single box. The single occupies column 0.
pub(crate) fn aggregate_single(
    lhs: &[SortedElement],
    rows: usize,
    single: SortedElement,
    bitmap: &mut PairBitmap,
    tombstoned: impl Fn(u32) -> bool,
    diff: &mut PairDiff,
) {
    let rhs = [SortedElement { position: 0, ..single }];
    aggregate_aggregate(lhs, &rhs, (rows, 1), bitmap, |i, _| tombstoned(i), diff);
}

#[inline]
#[allow(
    clippy::cast_possible_truncation,
    reason = "Aggregate positions are bounded by the per-aggregate shape limit."
)]
fn position(i: usize) -> u32 {
    i as u32
}

#[inline]
fn ordered(a: u32, b: u32) -> (u32, u32) {
    if a < b { (a, b) } else { (b, a) }
}
