// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stable LSD radix sort returning ranks.

use crate::types::encode_float;

/// Reusable radix sorter.
///
/// The sorter never moves the input. It produces ranks: `ranks[k]` is the index of the
/// k-th smallest key, and equal keys keep their input order. Rank buffers are kept
/// between calls, so sorting similar sizes every frame does not allocate.
#[derive(Debug, Default, Clone)]
pub struct RadixSort {
    ranks: Vec<u32>,
    ranks2: Vec<u32>,
    scratch: Vec<u32>,
}

impl RadixSort {
    /// Create an empty sorter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sort unsigned keys and return their ranks.
    pub fn sort_u32(&mut self, keys: &[u32]) -> &[u32] {
        let n = keys.len();
        self.ranks.clear();
        #[allow(
            clippy::cast_possible_truncation,
            reason = "Key counts are bounded by 32-bit box handles."
        )]
        self.ranks.extend(0..n as u32);

        if keys.windows(2).all(|w| w[0] <= w[1]) {
            return &self.ranks;
        }

        self.ranks2.clear();
        self.ranks2.resize(n, 0);

        for pass in 0..4 {
            let shift = pass * 8;
            let mut counts = [0_u32; 256];
            for &k in keys {
                counts[((k >> shift) & 0xff) as usize] += 1;
            }
            // A single full bucket means this byte is constant; the pass would be the identity.
            if counts.iter().any(|&c| c as usize == n) {
                continue;
            }
            let mut offsets = [0_u32; 256];
            let mut running = 0;
            for (o, c) in offsets.iter_mut().zip(counts.iter()) {
                *o = running;
                running += c;
            }
            for &r in &self.ranks {
                let bucket = ((keys[r as usize] >> shift) & 0xff) as usize;
                self.ranks2[offsets[bucket] as usize] = r;
                offsets[bucket] += 1;
            }
            core::mem::swap(&mut self.ranks, &mut self.ranks2);
        }
        &self.ranks
    }

    /// Sort float keys through the order-preserving encoding and return their ranks.
    pub fn sort_f32(&mut self, keys: &[f32]) -> &[u32] {
        let mut scratch = core::mem::take(&mut self.scratch);
        scratch.clear();
        scratch.extend(keys.iter().map(|&k| encode_float(k)));
        self.sort_u32(&scratch);
        self.scratch = scratch;
        &self.ranks
    }

    /// Ranks produced by the last sort.
    pub fn ranks(&self) -> &[u32] {
        &self.ranks
    }

    /// Release all buffers.
    pub fn reset(&mut self) {
        self.ranks = Vec::new();
        self.ranks2 = Vec::new();
        self.scratch = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_and_is_stable() {
        let keys = [5_u32, 1, 0x0100_0000, 1, 0, 300, 5];
        let mut rs = RadixSort::new();
        let ranks = rs.sort_u32(&keys).to_vec();
        let sorted: Vec<u32> = ranks.iter().map(|&r| keys[r as usize]).collect();
        assert_eq!(sorted, vec![0, 1, 1, 5, 5, 300, 0x0100_0000]);
        // Equal keys keep input order.
        assert_eq!(&ranks[1..3], &[1, 3]);
        assert_eq!(&ranks[3..5], &[0, 6]);
    }

    #[test]
    fn presorted_input_yields_identity() {
        let keys = [1_u32, 2, 2, 9];
        let mut rs = RadixSort::new();
        assert_eq!(rs.sort_u32(&keys), &[0, 1, 2, 3]);
    }

    #[test]
    fn floats_sort_by_value() {
        let keys = [3.5_f32, -2.0, 0.0, -7.25, 1.0];
        let mut rs = RadixSort::new();
        let ranks = rs.sort_f32(&keys).to_vec();
        assert_eq!(ranks, vec![3, 1, 2, 4, 0]);
        assert_eq!(rs.ranks(), ranks.as_slice());
    }

    #[test]
    fn empty_input() {
        let mut rs = RadixSort::new();
        assert!(rs.sort_u32(&[]).is_empty());
        rs.reset();
        assert!(rs.ranks().is_empty());
    }
}
