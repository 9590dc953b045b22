// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Primitive bound types and the order-preserving float encoding.

use core::fmt::Debug;

/// Axis-aligned bounding box in 3D with `f32` corners.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Bounds3 {
    /// Minimum corner (x, y, z).
    pub min: [f32; 3],
    /// Maximum corner (x, y, z).
    pub max: [f32; 3],
}

impl Bounds3 {
    /// An inverted box that acts as the identity for [`union`][Self::union].
    pub const EMPTY: Self = Self {
        min: [f32::MAX; 3],
        max: [-f32::MAX; 3],
    };

    /// Create a new box from min/max corners.
    #[inline(always)]
    pub const fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, max }
    }

    /// The smallest box enclosing both boxes.
    #[inline]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: [
                self.min[0].min(other.min[0]),
                self.min[1].min(other.min[1]),
                self.min[2].min(other.min[2]),
            ],
            max: [
                self.max[0].max(other.max[0]),
                self.max[1].max(other.max[1]),
                self.max[2].max(other.max[2]),
            ],
        }
    }

    /// Return true if the box is inverted on any axis. Assumes no NaN.
    #[inline]
    pub fn is_empty(&self) -> bool {
        (0..3).any(|axis| self.max[axis] < self.min[axis])
    }

    /// Translate the box by `-shift`.
    #[inline]
    pub fn shifted(&self, shift: [f32; 3]) -> Self {
        Self {
            min: [
                self.min[0] - shift[0],
                self.min[1] - shift[1],
                self.min[2] - shift[2],
            ],
            max: [
                self.max[0] - shift[0],
                self.max[1] - shift[1],
                self.max[2] - shift[2],
            ],
        }
    }
}

/// Map a float onto a `u32` so that unsigned integer order matches float order.
#[inline(always)]
pub const fn encode_float(f: f32) -> u32 {
    let bits = f.to_bits();
    if bits & 0x8000_0000 != 0 {
        !bits
    } else {
        bits | 0x8000_0000
    }
}

/// Inverse of [`encode_float`].
#[inline(always)]
pub const fn decode_float(v: u32) -> f32 {
    let bits = if v & 0x8000_0000 != 0 {
        v & 0x7fff_ffff
    } else {
        !v
    };
    f32::from_bits(bits)
}

/// Encode a minimum coordinate, nudging it down to an even value.
#[inline(always)]
pub const fn encode_min(f: f32) -> u32 {
    encode_float(f) & !1
}

/// Encode a maximum coordinate, forcing the result odd.
#[inline(always)]
pub const fn encode_max(f: f32) -> u32 {
    encode_float(f) | 1
}

/// Axis-aligned box stored as order-preserving integers.
///
/// Minima are nudged down to even values and maxima up to odd values, so a min endpoint
/// never compares equal to a max endpoint and every box, even a zero-width one, keeps
/// min < max. Zero-width boxes therefore still sort deterministically.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct IntegerAabb {
    /// Encoded minimum per axis.
    pub min: [u32; 3],
    /// Encoded maximum per axis.
    pub max: [u32; 3],
}

impl Default for IntegerAabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl IntegerAabb {
    /// An inverted box: identity for [`include`][Self::include], and the bound given to tombstones.
    pub const EMPTY: Self = Self {
        min: [u32::MAX; 3],
        max: [0; 3],
    };

    /// Encode float bounds with the min-even/max-odd bias.
    #[inline]
    pub fn encode(bounds: &Bounds3) -> Self {
        Self {
            min: [
                encode_min(bounds.min[0]),
                encode_min(bounds.min[1]),
                encode_min(bounds.min[2]),
            ],
            max: [
                encode_max(bounds.max[0]),
                encode_max(bounds.max[1]),
                encode_max(bounds.max[2]),
            ],
        }
    }

    /// Decode back to float bounds. Lossy in the last bit because of the bias.
    #[inline]
    pub fn decode(&self) -> Bounds3 {
        Bounds3 {
            min: [
                decode_float(self.min[0]),
                decode_float(self.min[1]),
                decode_float(self.min[2]),
            ],
            max: [
                decode_float(self.max[0]),
                decode_float(self.max[1]),
                decode_float(self.max[2]),
            ],
        }
    }

    /// Whether the two boxes overlap on all three axes.
    #[inline]
    pub fn intersects(&self, other: &Self) -> bool {
        self.min[0] <= other.max[0]
            && other.min[0] <= self.max[0]
            && self.min[1] <= other.max[1]
            && other.min[1] <= self.max[1]
            && self.min[2] <= other.max[2]
            && other.min[2] <= self.max[2]
    }

    /// Overlap test that treats boxes touching within encoding precision as disjoint.
    #[inline]
    pub fn overlaps_interior(&self, other: &Self) -> bool {
        (0..3).all(|axis| {
            (self.min[axis] | 1) < other.max[axis] && (other.min[axis] | 1) < self.max[axis]
        })
    }

    /// Overlap test restricted to the y and z axes, for sweeps that already ordered x.
    #[inline(always)]
    pub fn intersects_yz(&self, other: &Self) -> bool {
        self.min[1] <= other.max[1]
            && other.min[1] <= self.max[1]
            && self.min[2] <= other.max[2]
            && other.min[2] <= self.max[2]
    }

    /// Whether `self` lies within `other` on all axes.
    #[inline]
    pub fn is_inside(&self, other: &Self) -> bool {
        (0..3).all(|axis| other.min[axis] <= self.min[axis] && self.max[axis] <= other.max[axis])
    }

    /// Grow `self` to enclose `other`.
    #[inline]
    pub fn include(&mut self, other: &Self) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(other.min[axis]);
            self.max[axis] = self.max[axis].max(other.max[axis]);
        }
    }

    /// The smallest box enclosing both boxes.
    #[inline]
    pub fn union(&self, other: &Self) -> Self {
        let mut out = *self;
        out.include(other);
        out
    }

    /// Whether min < max on every axis.
    #[inline]
    pub fn is_valid(&self) -> bool {
        (0..3).all(|axis| self.min[axis] < self.max[axis])
    }

    /// Decode, translate by `-shift`, and re-encode.
    #[inline]
    pub fn shifted(&self, shift: [f32; 3]) -> Self {
        Self::encode(&self.decode().shifted(shift))
    }
}

/// Collision filter group.
///
/// Two boxes in the same group never form a pair. Group 0 is reserved for statics, so
/// statics never pair with each other.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Group(pub u32);

impl Group {
    /// The group shared by all static boxes.
    pub const STATIC: Self = Self(0);
    /// Marks a released aggregate element that keeps its position.
    pub const INVALID: Self = Self(u32::MAX);

    /// Whether this is the static group.
    #[inline(always)]
    pub const fn is_static(self) -> bool {
        self.0 == Self::STATIC.0
    }

    /// Whether this marks a tombstone.
    #[inline(always)]
    pub const fn is_invalid(self) -> bool {
        self.0 == Self::INVALID.0
    }
}

/// A broadphase-level pair of box handles.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BpPair {
    /// First box handle.
    pub a: u32,
    /// Second box handle.
    pub b: u32,
}

impl BpPair {
    /// Create a pair with ids in ascending order.
    #[inline(always)]
    pub fn ordered(a: u32, b: u32) -> Self {
        if a < b { Self { a, b } } else { Self { a: b, b: a } }
    }
}
