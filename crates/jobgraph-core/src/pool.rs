//! Fixed-size object pool with O(1) acquire/release
//!
//! Blocks live in group-sized strips; a free-block-pointer array `fbp`
//! (a permutation of block ids) tracks which blocks are in use:
//!
//! ```text
//!              fbp
//!           +-------+
//!           |   F   | <- index [size-1]
//!           +-------+
//!           |  ...  |
//!    fbi -> |   F   |   entries at [fbi, size) point to free blocks
//!           +-------+
//!           |  ...  |
//!           +-------+
//!           |   U   | <- index [0]    entries at [0, fbi) point to used blocks
//!           +-------+
//! ```
//!
//! `get` pops the entry at `fbi`; `put` swaps the freed block's entry with
//! the last used one, so both are O(1). The pool grows one group at a time
//! and opportunistically releases trailing all-free groups when usage drops
//! below half a group per allocated group.
//!
//! Block ids are stable for the lifetime of the block: shrinking never
//! relocates a live block, it only drops trailing groups in which every
//! block is free.

use std::sync::Mutex;

use crate::error::{JgError, JgResult};

/// Stable identifier of a pool block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(u32);

impl BlockId {
    #[inline]
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

/// Growable pool of fixed-size blocks
///
/// Freed blocks keep their id reserved until the owning group is released;
/// the payload of a freed block is reset to `T::default()` so resources
/// held by it are dropped promptly.
pub struct Pool<T> {
    /// Blocks per group
    grpsz: usize,

    /// Optional cap on the number of groups; `None` = unbounded
    max_groups: Option<usize>,

    /// Block storage, `grpsz * nrgrp` entries
    slots: Vec<T>,

    /// Free-block pointers: a permutation of all block ids
    fbp: Vec<u32>,

    /// Inverse permutation: block id -> its index in `fbp`
    slot_of: Vec<u32>,

    /// Watermark: `fbp[0..fbi]` used, `fbp[fbi..]` free
    fbi: usize,
}

impl<T: Default> Pool<T> {
    /// Create a pool with one group of `grpsz` blocks pre-allocated
    pub fn new(grpsz: usize) -> Self {
        Self::with_max_groups(grpsz, None)
    }

    /// Create a pool capped at `max_groups` groups
    ///
    /// With a cap in place, `get` returns `Err(OutOfMemory)` once every
    /// block of every allowed group is in use.
    pub fn with_max_groups(grpsz: usize, max_groups: Option<usize>) -> Self {
        assert!(grpsz > 0, "group size must be positive");
        let mut pool = Pool {
            grpsz,
            max_groups,
            slots: Vec::new(),
            fbp: Vec::new(),
            slot_of: Vec::new(),
            fbi: 0,
        };
        // one group for the initial state
        pool.expand().expect("initial group within any cap");
        pool
    }

    /// Total number of blocks (used + free)
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of blocks currently in use
    #[inline]
    pub fn used(&self) -> usize {
        self.fbi
    }

    /// Number of allocated groups
    #[inline]
    pub fn groups(&self) -> usize {
        self.slots.len() / self.grpsz
    }

    #[inline]
    fn is_used(&self, id: BlockId) -> bool {
        let i = id.0 as usize;
        i < self.slots.len() && (self.slot_of[i] as usize) < self.fbi
    }

    /// Acquire one block
    pub fn get(&mut self) -> JgResult<BlockId> {
        if self.fbi == self.slots.len() {
            self.expand()?;
        }
        let id = self.fbp[self.fbi];
        self.fbi += 1;
        Ok(BlockId(id))
    }

    /// Return a block to the pool
    ///
    /// Panics if `id` does not refer to a block currently in use.
    pub fn put(&mut self, id: BlockId) {
        let slot = self.slot_of[id.0 as usize] as usize;
        assert!(self.fbi > 0 && slot < self.fbi, "put of free or stale block");

        self.fbi -= 1;
        let displaced = self.fbp[self.fbi];
        self.fbp.swap(slot, self.fbi);
        self.slot_of[displaced as usize] = slot as u32;
        self.slot_of[id.0 as usize] = self.fbi as u32;

        self.slots[id.0 as usize] = T::default();

        if self.need_shrink() {
            self.shrink(1);
        }
    }

    /// Access a block's payload
    ///
    /// Panics if the block is not in use.
    #[inline]
    pub fn at(&self, id: BlockId) -> &T {
        assert!(self.is_used(id), "access to free or stale block");
        &self.slots[id.0 as usize]
    }

    /// Mutable access to a block's payload
    #[inline]
    pub fn at_mut(&mut self, id: BlockId) -> &mut T {
        assert!(self.is_used(id), "access to free or stale block");
        &mut self.slots[id.0 as usize]
    }

    /// Release trailing groups beyond the used watermark plus `margin`
    ///
    /// A group is released only if every block in it is free; the scan
    /// stops at the first trailing group pinned by a live block, so live
    /// block ids are never invalidated.
    pub fn shrink(&mut self, margin: usize) {
        let nrgrp = self.groups();
        let mut from = if self.fbi == 0 {
            1 + margin
        } else {
            (self.fbi - 1) / self.grpsz + 1 + margin
        };
        if from > nrgrp {
            from = nrgrp;
        }

        let mut keep = nrgrp;
        while keep > from && self.group_is_free(keep - 1) {
            keep -= 1;
        }
        if keep == nrgrp {
            return;
        }

        // drop the dying ids out of the free region, highest group first
        for id in (keep * self.grpsz..nrgrp * self.grpsz).rev() {
            let s = self.slot_of[id] as usize;
            let end = self.fbp.len() - 1;
            let moved = self.fbp[end];
            self.fbp.swap(s, end);
            self.fbp.pop();
            self.slot_of[moved as usize] = s as u32;
        }
        self.slots.truncate(keep * self.grpsz);
        self.slot_of.truncate(keep * self.grpsz);
    }

    /// Shrink trigger: less than half a group in use per allocated group
    #[inline]
    fn need_shrink(&self) -> bool {
        self.fbi * 2 / self.grpsz < self.groups()
    }

    fn group_is_free(&self, grp: usize) -> bool {
        let base = grp * self.grpsz;
        (base..base + self.grpsz).all(|id| self.slot_of[id] as usize >= self.fbi)
    }

    /// Grow by one group
    fn expand(&mut self) -> JgResult<()> {
        if let Some(max) = self.max_groups {
            if self.groups() >= max {
                return Err(JgError::OutOfMemory);
            }
        }
        let base = self.slots.len();
        self.slots.reserve(self.grpsz);
        self.fbp.reserve(self.grpsz);
        self.slot_of.reserve(self.grpsz);
        for i in 0..self.grpsz {
            self.slots.push(T::default());
            self.fbp.push((base + i) as u32);
            self.slot_of.push((base + i) as u32);
        }
        Ok(())
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        assert_eq!(self.slots.len(), self.fbp.len());
        assert_eq!(self.slots.len(), self.slot_of.len());
        assert!(self.fbi <= self.slots.len());
        // fbp is a permutation and slot_of is its inverse
        let mut seen = vec![false; self.fbp.len()];
        for (slot, &id) in self.fbp.iter().enumerate() {
            assert!(!seen[id as usize]);
            seen[id as usize] = true;
            assert_eq!(self.slot_of[id as usize] as usize, slot);
        }
    }
}

/// Thread-safe pool: a `Pool` behind a mutex
///
/// The C-era `mt_safe` creation flag, expressed in the type system.
pub struct SyncPool<T> {
    inner: Mutex<Pool<T>>,
}

impl<T: Default> SyncPool<T> {
    pub fn new(grpsz: usize) -> Self {
        SyncPool {
            inner: Mutex::new(Pool::new(grpsz)),
        }
    }

    pub fn with_max_groups(grpsz: usize, max_groups: Option<usize>) -> Self {
        SyncPool {
            inner: Mutex::new(Pool::with_max_groups(grpsz, max_groups)),
        }
    }

    pub fn get(&self) -> JgResult<BlockId> {
        self.inner.lock().unwrap().get()
    }

    pub fn put(&self, id: BlockId) {
        self.inner.lock().unwrap().put(id)
    }

    /// Run `f` with mutable access to the block's payload
    pub fn with<R>(&self, id: BlockId, f: impl FnOnce(&mut T) -> R) -> R {
        f(self.inner.lock().unwrap().at_mut(id))
    }

    pub fn shrink(&self, margin: usize) {
        self.inner.lock().unwrap().shrink(margin)
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity()
    }

    pub fn used(&self) -> usize {
        self.inner.lock().unwrap().used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TESTSZ: usize = 1024;
    const TESTGRPSZ: usize = 7;

    #[test]
    fn test_round_trip() {
        let mut mp: Pool<i32> = Pool::new(TESTGRPSZ);

        let b = mp.get().unwrap();
        mp.put(b);
        let b0 = mp.get().unwrap();
        let b1 = mp.get().unwrap();
        mp.put(b0);
        mp.put(b1);
        assert_eq!(mp.used(), 0);
        mp.check_invariants();
    }

    #[test]
    fn test_interleaved_halves() {
        let mut mp: Pool<i32> = Pool::new(TESTGRPSZ);
        let mut b = Vec::with_capacity(TESTSZ);

        for i in 0..TESTSZ {
            let id = mp.get().unwrap();
            *mp.at_mut(id) = i as i32;
            b.push(id);
        }

        for i in 0..TESTSZ / 2 {
            mp.put(b[i]);
        }
        for i in 0..TESTSZ / 2 {
            b[i] = mp.get().unwrap();
            *mp.at_mut(b[i]) = i as i32;
        }
        for i in TESTSZ / 2..TESTSZ {
            mp.put(b[i]);
        }
        for i in 0..TESTSZ / 2 {
            mp.put(b[i]);
            b[i] = mp.get().unwrap();
            *mp.at_mut(b[i]) = i as i32;
        }
        for i in TESTSZ / 2..TESTSZ {
            b[i] = mp.get().unwrap();
            *mp.at_mut(b[i]) = i as i32;
        }

        for i in 0..TESTSZ {
            assert_eq!(*mp.at(b[i]), i as i32);
        }
        mp.check_invariants();
        assert_eq!(mp.used(), TESTSZ);
    }

    #[test]
    fn test_used_plus_free_is_capacity() {
        let mut mp: Pool<u64> = Pool::new(5);
        let mut held = Vec::new();
        for _ in 0..23 {
            held.push(mp.get().unwrap());
        }
        assert_eq!(mp.used(), 23);
        assert!(mp.capacity() >= 23);
        assert_eq!(mp.capacity() % 5, 0);
        for id in held.drain(..) {
            mp.put(id);
        }
        assert_eq!(mp.used(), 0);
        mp.check_invariants();
    }

    #[test]
    fn test_defragmentation() {
        const MAGIC: i64 = 0x1234_5678;
        const POISON: i64 = -0x2152_4111;

        let mut mp: Pool<i64> = Pool::new(TESTGRPSZ);
        let mut b: Vec<Option<BlockId>> = Vec::with_capacity(TESTSZ);
        for _ in 0..TESTSZ {
            let id = mp.get().unwrap();
            *mp.at_mut(id) = MAGIC;
            b.push(Some(id));
        }

        // churn with a cheap deterministic pseudo-random walk
        let mut seed: u64 = 0x9e37_79b9;
        let mut next = |m: usize| {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize % m
        };
        for _ in 0..100 {
            for _ in 0..TESTSZ / 2 {
                let k = next(TESTSZ);
                if let Some(id) = b[k].take() {
                    *mp.at_mut(id) = POISON;
                    mp.put(id);
                }
            }
            for j in 0..TESTSZ {
                if b[j].is_none() {
                    let id = mp.get().unwrap();
                    *mp.at_mut(id) = MAGIC;
                    b[j] = Some(id);
                }
            }
        }

        // free everything, shrink all the way down
        for j in 0..TESTSZ {
            if let Some(id) = b[j].take() {
                mp.put(id);
            }
        }
        mp.shrink(0);
        mp.check_invariants();
        assert_eq!(mp.used(), 0);
        assert_eq!(mp.groups(), 1);
    }

    #[test]
    fn test_shrink_never_drops_live_blocks() {
        let mut mp: Pool<i32> = Pool::new(4);
        let mut held = Vec::new();
        for _ in 0..16 {
            held.push(mp.get().unwrap());
        }
        // keep only a block in the last group live
        let keeper = held.pop().unwrap();
        *mp.at_mut(keeper) = 99;
        for id in held.drain(..) {
            mp.put(id);
        }
        mp.shrink(0);
        // the live block pins its group
        assert_eq!(*mp.at(keeper), 99);
        mp.check_invariants();
    }

    #[test]
    fn test_max_groups_exhaustion() {
        let mut mp: Pool<i32> = Pool::with_max_groups(4, Some(2));
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(mp.get().unwrap());
        }
        assert_eq!(mp.get(), Err(JgError::OutOfMemory));
        mp.put(held.pop().unwrap());
        assert!(mp.get().is_ok());
    }

    #[test]
    #[should_panic(expected = "put of free or stale block")]
    fn test_double_put_panics() {
        let mut mp: Pool<i32> = Pool::new(4);
        let id = mp.get().unwrap();
        mp.put(id);
        mp.put(id);
    }

    #[test]
    fn test_sync_pool_concurrent_churn() {
        use std::sync::Arc;
        use std::thread;

        let mp: Arc<SyncPool<usize>> = Arc::new(SyncPool::new(TESTGRPSZ));
        let mut handles = vec![];
        for t in 0..4 {
            let mp = Arc::clone(&mp);
            handles.push(thread::spawn(move || {
                for round in 0..200 {
                    let ids: Vec<_> = (0..8).map(|_| mp.get().unwrap()).collect();
                    for (k, &id) in ids.iter().enumerate() {
                        mp.with(id, |v| *v = t * 1000 + round + k);
                    }
                    for (k, &id) in ids.iter().enumerate() {
                        mp.with(id, |v| assert_eq!(*v, t * 1000 + round + k));
                        mp.put(id);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(mp.used(), 0);
    }
}
