// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! One-axis sweeps over lists sorted by their minimum on that axis.
//!
//! The sweeps only establish overlap along the sorted axis; callers confirm the other
//! axes and apply their own filters in the callback.

/// Report every pair of items whose `[min, max]` intervals overlap.
///
/// `sorted` must be ordered by `min`. Each pair is reported once, earlier item first.
pub(crate) fn complete<T>(sorted: &[T], interval: impl Fn(&T) -> (u32, u32), mut f: impl FnMut(&T, &T)) {
    for (i, a) in sorted.iter().enumerate() {
        let (_, max) = interval(a);
        for b in &sorted[i + 1..] {
            if interval(b).0 > max {
                break;
            }
            f(a, b);
        }
    }
}

/// Report every pair `(a, b)` with `a` from `lhs` and `b` from `rhs` whose intervals overlap.
///
/// Both lists must be ordered by `min`. The first pass finds partners starting inside
/// `a`, the second partners that start strictly before `a`; each pair is reported once.
pub(crate) fn bipartite<A, B>(
    lhs: &[A],
    rhs: &[B],
    lhs_interval: impl Fn(&A) -> (u32, u32),
    rhs_interval: impl Fn(&B) -> (u32, u32),
    mut f: impl FnMut(&A, &B),
) {
    let mut running = 0;
    for a in lhs {
        let (min, max) = lhs_interval(a);
        while running < rhs.len() && rhs_interval(&rhs[running]).0 < min {
            running += 1;
        }
        if running == rhs.len() {
            break;
        }
        for b in &rhs[running..] {
            if rhs_interval(b).0 > max {
                break;
            }
            f(a, b);
        }
    }

    let mut running = 0;
    for b in rhs {
        let (min, max) = rhs_interval(b);
        while running < lhs.len() && lhs_interval(&lhs[running]).0 <= min {
            running += 1;
        }
        if running == lhs.len() {
            break;
        }
        for a in &lhs[running..] {
            if lhs_interval(a).0 > max {
                break;
            }
            f(a, b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute(lhs: &[(u32, u32)], rhs: &[(u32, u32)]) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for (i, a) in lhs.iter().enumerate() {
            for (j, b) in rhs.iter().enumerate() {
                if a.0 <= b.1 && b.0 <= a.1 {
                    out.push((i, j));
                }
            }
        }
        out
    }

    #[test]
    fn bipartite_matches_brute_force() {
        let lhs = [(0, 3), (2, 9), (2, 3), (10, 11), (14, 21)];
        let rhs = [(1, 1), (2, 5), (4, 13), (12, 13), (20, 31)];
        let lhs_idx: Vec<_> = (0..lhs.len()).collect();
        let rhs_idx: Vec<_> = (0..rhs.len()).collect();
        let mut got = Vec::new();
        bipartite(&lhs_idx, &rhs_idx, |&i| lhs[i], |&j| rhs[j], |&i, &j| got.push((i, j)));
        got.sort_unstable();
        assert_eq!(got, brute(&lhs, &rhs));
    }

    #[test]
    fn complete_reports_each_pair_once() {
        let items = [(0_u32, 5_u32), (2, 3), (4, 9), (4, 5), (10, 11)];
        let idx: Vec<_> = (0..items.len()).collect();
        let mut got = Vec::new();
        complete(&idx, |&i| items[i], |&i, &j| got.push((i.min(j), i.max(j))));
        got.sort_unstable();
        let mut want = Vec::new();
        for i in 0..items.len() {
            for j in i + 1..items.len() {
                if items[i].0 <= items[j].1 && items[j].0 <= items[i].1 {
                    want.push((i, j));
                }
            }
        }
        assert_eq!(got, want);
    }
}
