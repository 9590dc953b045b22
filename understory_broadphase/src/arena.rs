// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-update scratch storage.

use core::cell::RefCell;
use core::fmt::Debug;
use core::ops::{Deref, DerefMut};

use crate::bitmap::BitMap;
use crate::types::BpPair;

/// Scratch value that can be emptied for reuse and trimmed back to a capacity.
pub(crate) trait Recycle: Default {
    fn recycle(&mut self);
    fn trim(&mut self, capacity: usize);
}

impl<T> Recycle for Vec<T> {
    fn recycle(&mut self) {
        self.clear();
    }

    fn trim(&mut self, capacity: usize) {
        self.shrink_to(capacity);
    }
}

impl Recycle for BitMap {
    fn recycle(&mut self) {
        self.clear_all();
    }

    fn trim(&mut self, capacity: usize) {
        if self.capacity() > capacity {
            self.release();
        }
    }
}

#[derive(Debug)]
struct Pool<T> {
    free: RefCell<Vec<T>>,
}

impl<T: Recycle> Pool<T> {
    fn new() -> Self {
        Self {
            free: RefCell::new(Vec::new()),
        }
    }

    fn acquire(&self) -> ArenaScope<'_, T> {
        let value = self.free.borrow_mut().pop().unwrap_or_default();
        ArenaScope {
            pool: self,
            value: Some(value),
        }
    }

    fn trim(&mut self, keep: usize, capacity: usize) {
        let free = self.free.get_mut();
        free.truncate(keep);
        for v in free.iter_mut() {
            v.trim(capacity);
        }
    }
}

/// A buffer borrowed from a [`FrameArena`]; returned to the arena when dropped.
pub(crate) struct ArenaScope<'a, T: Recycle> {
    pool: &'a Pool<T>,
    value: Option<T>,
}

impl<T: Recycle> Debug for ArenaScope<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArenaScope").finish_non_exhaustive()
    }
}

impl<T: Recycle> Deref for ArenaScope<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(v) => v,
            None => unreachable!("arena buffer taken before drop"),
        }
    }
}

impl<T: Recycle> DerefMut for ArenaScope<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(v) => v,
            None => unreachable!("arena buffer taken before drop"),
        }
    }
}

impl<T: Recycle> Drop for ArenaScope<'_, T> {
    fn drop(&mut self) {
        if let Some(mut v) = self.value.take() {
            v.recycle();
            self.pool.free.borrow_mut().push(v);
        }
    }
}

/// Scratch buffers shared by the stages of one update.
///
/// Buffers keep their capacity between updates; [`trim`][Self::trim] bounds what is
/// retained.
#[derive(Debug)]
pub(crate) struct FrameArena {
    ids: Pool<Vec<u32>>,
    pairs: Pool<Vec<BpPair>>,
    bitmaps: Pool<BitMap>,
    retained_capacity: usize,
}

impl Default for FrameArena {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl FrameArena {
    /// Buffers kept per pool after trimming.
    const RETAINED_BUFFERS: usize = 8;

    pub(crate) fn new(retained_capacity: usize) -> Self {
        Self {
            ids: Pool::new(),
            pairs: Pool::new(),
            bitmaps: Pool::new(),
            retained_capacity,
        }
    }

    pub(crate) fn ids(&self) -> ArenaScope<'_, Vec<u32>> {
        self.ids.acquire()
    }

    pub(crate) fn pairs(&self) -> ArenaScope<'_, Vec<BpPair>> {
        self.pairs.acquire()
    }

    pub(crate) fn bitmap(&self) -> ArenaScope<'_, BitMap> {
        self.bitmaps.acquire()
    }

    /// Drop surplus buffers and shrink the rest to the retained capacity.
    pub(crate) fn trim(&mut self) {
        let cap = self.retained_capacity;
        self.ids.trim(Self::RETAINED_BUFFERS, cap);
        self.pairs.trim(Self::RETAINED_BUFFERS, cap);
        self.bitmaps.trim(Self::RETAINED_BUFFERS, cap);
    }

    /// Release every pooled buffer.
    pub(crate) fn release(&mut self) {
        self.ids.trim(0, 0);
        self.pairs.trim(0, 0);
        self.bitmaps.trim(0, 0);
    }

    #[cfg(test)]
    fn pooled_ids(&self) -> usize {
        self.ids.free.borrow().len()
    }
}
