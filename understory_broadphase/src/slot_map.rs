// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Generation-counted slot storage behind the manager's public handles.

/// Index plus generation. A key goes stale once its slot is freed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SlotKey {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl SlotKey {
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Slot indices are intentionally 32-bit; handles above u32::MAX are not supported."
    )]
    const fn new(idx: usize, generation: u32) -> Self {
        Self {
            index: idx as u32,
            generation,
        }
    }

    #[inline(always)]
    pub(crate) const fn idx(self) -> usize {
        self.index as usize
    }
}

#[derive(Clone, Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Dense storage with a free list; freed slots are reused with a bumped generation.
#[derive(Clone, Debug)]
pub(crate) struct SlotMap<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<usize>,
    len: usize,
}

impl<T> Default for SlotMap<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            len: 0,
        }
    }
}

impl<T> SlotMap<T> {
    pub(crate) fn insert(&mut self, value: T) -> SlotKey {
        self.len += 1;
        if let Some(idx) = self.free_list.pop() {
            let slot = &mut self.slots[idx];
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = Some(value);
            SlotKey::new(idx, slot.generation)
        } else {
            self.slots.push(Slot {
                generation: 1,
                value: Some(value),
            });
            SlotKey::new(self.slots.len() - 1, 1)
        }
    }

    pub(crate) fn remove(&mut self, key: SlotKey) -> Option<T> {
        let slot = self.slots.get_mut(key.idx())?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        self.free_list.push(key.idx());
        self.len -= 1;
        Some(value)
    }

    pub(crate) fn get(&self, key: SlotKey) -> Option<&T> {
        let slot = self.slots.get(key.idx())?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub(crate) fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        let slot = self.slots.get_mut(key.idx())?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Access by raw index, skipping the generation check. For internal links only.
    #[inline]
    pub(crate) fn at(&self, idx: usize) -> Option<&T> {
        self.slots.get(idx)?.value.as_ref()
    }

    #[inline]
    pub(crate) fn at_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.slots.get_mut(idx)?.value.as_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.value.as_ref().map(|v| (i, v)))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.value.as_mut().map(|v| (i, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_keys_are_rejected() {
        let mut m = SlotMap::default();
        let a = m.insert(10);
        let b = m.insert(20);
        assert_eq!(m.remove(a), Some(10));
        assert_eq!(m.get(a), None);
        let c = m.insert(30);
        assert_eq!(c.index, a.index);
        assert_ne!(c.generation, a.generation);
        assert_eq!(m.get(a), None);
        assert_eq!(m.get(c), Some(&30));
        assert_eq!(m.get(b), Some(&20));
        assert_eq!(m.len(), 2);
        assert_eq!(m.remove(a), None);
    }

    #[test]
    fn iter_skips_free_slots() {
        let mut m = SlotMap::default();
        let a = m.insert('a');
        m.insert('b');
        m.remove(a);
        let seen: Vec<_> = m.iter().map(|(_, v)| *v).collect();
        assert_eq!(seen, vec!['b']);
        if let Some(v) = m.at_mut(1) {
            *v = 'c';
        }
        assert_eq!(m.at(1), Some(&'c'));
    }
}
