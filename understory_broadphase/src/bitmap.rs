// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bitmaps used for liveness flags and for persistent overlap state inside aggregates.

/// Growable bitmap backed by `u32` words.
///
/// Reads past the end return `false`; [`set`][Self::set] grows the map as needed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitMap {
    words: Vec<u32>,
}

impl BitMap {
    /// Create an empty bitmap.
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Make room for at least `bits` bits without changing existing ones.
    pub fn resize(&mut self, bits: usize) {
        let words = bits.div_ceil(32);
        if words > self.words.len() {
            self.words.resize(words, 0);
        }
    }

    /// Number of addressable bits.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.words.len() * 32
    }

    /// Set bit `i`.
    #[inline]
    pub fn set(&mut self, i: usize) {
        let w = i / 32;
        if w >= self.words.len() {
            self.words.resize(w + 1, 0);
        }
        self.words[w] |= 1 << (i % 32);
    }

    /// Clear bit `i`.
    #[inline]
    pub fn reset(&mut self, i: usize) {
        if let Some(word) = self.words.get_mut(i / 32) {
            *word &= !(1 << (i % 32));
        }
    }

    /// Test bit `i`.
    #[inline]
    pub fn test(&self, i: usize) -> bool {
        self.words
            .get(i / 32)
            .is_some_and(|word| word & (1 << (i % 32)) != 0)
    }

    /// Clear every bit, keeping the storage.
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Release the storage.
    pub fn release(&mut self) {
        self.words = Vec::new();
    }

    /// Whether no bit is set.
    pub fn is_clear(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Iterate over set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &word)| {
            let mut bits = word;
            core::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let b = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(w * 32 + b)
            })
        })
    }
}

/// Persistent overlap state between the elements of one aggregate.
///
/// A flattened upper-triangular matrix: pair `(i, j)` with `i < j` lives at bit
/// `j * (j - 1) / 2 + i`. Bits of existing pairs never move when elements are appended,
/// so growth only extends the storage.
#[derive(Clone, Debug, Default)]
pub struct SelfCollisionBitmap {
    len: usize,
    bits: BitMap,
}

#[inline(always)]
fn tri_index(i: usize, j: usize) -> usize {
    let (i, j) = if i < j { (i, j) } else { (j, i) };
    j * (j - 1) / 2 + i
}

impl SelfCollisionBitmap {
    /// Number of elements covered.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the bitmap covers no element.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grow to cover `new_len` elements. Shrinking is ignored.
    pub fn promote(&mut self, new_len: usize) {
        if new_len > self.len {
            self.len = new_len;
            self.bits.resize(new_len * new_len.saturating_sub(1) / 2);
        }
    }

    /// Test pair `(i, j)`.
    #[inline]
    pub fn test(&self, i: usize, j: usize) -> bool {
        debug_assert_ne!(i, j, "an element never pairs with itself");
        self.bits.test(tri_index(i, j))
    }

    /// Set pair `(i, j)`.
    #[inline]
    pub fn set(&mut self, i: usize, j: usize) {
        debug_assert_ne!(i, j, "an element never pairs with itself");
        self.bits.set(tri_index(i, j));
    }

    /// Clear pair `(i, j)`.
    #[inline]
    pub fn reset(&mut self, i: usize, j: usize) {
        self.bits.reset(tri_index(i, j));
    }

    /// Clear every pair involving element `e`, calling `f` with the partner of each set pair.
    pub fn drain_element(&mut self, e: usize, mut f: impl FnMut(usize)) {
        for k in 0..self.len {
            if k != e && self.test(e, k) {
                self.reset(e, k);
                f(k);
            }
        }
    }

    /// Clear all pairs and forget the element count.
    pub fn clear(&mut self) {
        self.len = 0;
        self.bits.release();
    }

    /// Iterate over set pairs as `(i, j)` with `i < j`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.bits.iter().map(|bit| {
            // Column j holds bits [j(j-1)/2, j(j+1)/2).
            let j = (1 + (1 + 8 * bit).isqrt()) / 2;
            (bit - j * (j - 1) / 2, j)
        })
    }
}

/// Persistent overlap state between two element sets.
///
/// A dense `rows × cols` matrix; pair `(i, j)` lives at bit `i * cols + j`.
#[derive(Clone, Debug, Default)]
pub struct PairBitmap {
    rows: usize,
    cols: usize,
    bits: BitMap,
}

impl PairBitmap {
    /// Create a bitmap sized for `rows × cols` pairs.
    pub fn new(rows: usize, cols: usize) -> Self {
        let mut bits = BitMap::new();
        bits.resize(rows * cols);
        Self { rows, cols, bits }
    }

    /// Current dimensions.
    pub fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Grow to `rows × cols`, appending empty rows and columns and keeping every set pair.
    pub fn promote(&mut self, rows: usize, cols: usize) {
        let rows = rows.max(self.rows);
        let cols = cols.max(self.cols);
        if rows == self.rows && cols == self.cols {
            return;
        }
        if cols == self.cols {
            self.rows = rows;
            self.bits.resize(rows * cols);
            return;
        }
        let mut bits = BitMap::new();
        bits.resize(rows * cols);
        for bit in self.bits.iter() {
            let (i, j) = (bit / self.cols, bit % self.cols);
            bits.set(i * cols + j);
        }
        self.rows = rows;
        self.cols = cols;
        self.bits = bits;
    }

    /// Test pair `(i, j)`.
    #[inline]
    pub fn test(&self, i: usize, j: usize) -> bool {
        i < self.rows && j < self.cols && self.bits.test(i * self.cols + j)
    }

    /// Set pair `(i, j)`. The bitmap must already cover the pair.
    #[inline]
    pub fn set(&mut self, i: usize, j: usize) {
        debug_assert!(i < self.rows && j < self.cols, "pair bitmap not promoted");
        self.bits.set(i * self.cols + j);
    }

    /// Clear pair `(i, j)`.
    #[inline]
    pub fn reset(&mut self, i: usize, j: usize) {
        if i < self.rows && j < self.cols {
            self.bits.reset(i * self.cols + j);
        }
    }

    /// Clear row `i`, calling `f` with the column of every set pair.
    pub fn drain_row(&mut self, i: usize, mut f: impl FnMut(usize)) {
        for j in 0..self.cols {
            if self.test(i, j) {
                self.reset(i, j);
                f(j);
            }
        }
    }

    /// Clear column `j`, calling `f` with the row of every set pair.
    pub fn drain_col(&mut self, j: usize, mut f: impl FnMut(usize)) {
        for i in 0..self.rows {
            if self.test(i, j) {
                self.reset(i, j);
                f(i);
            }
        }
    }

    /// Iterate over set pairs as `(row, col)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        let cols = self.cols;
        self.bits.iter().map(move |bit| (bit / cols, bit % cols))
    }
}
