//! Tiny fully-associative write-back cache of (object, logical chunk) ->
//! data. Only partial-chunk traffic (and everything, when aligned bypass is
//! off) flows through here.

use crate::lffs_lib::types::{ChunkId, ObjectId};

/// Stamp ceiling; when the use counter passes this, all stamps renormalize.
const LAST_USE_RENORM: u32 = 100_000_000;

#[derive(Debug)]
pub struct ChunkCache {
    /// 0 marks a free slot.
    pub object_id: ObjectId,
    pub chunk_id: ChunkId,
    pub last_use: u32,
    pub dirty: bool,
    /// Set for the exact span of a copy to/from caller memory so a yield can
    /// never evict a slot whose buffer is in use.
    pub locked: bool,
    pub n_bytes: usize,
    pub data: Vec<u8>,
}

impl ChunkCache {
    fn new(chunk_bytes: usize) -> Self {
        Self {
            object_id: 0,
            chunk_id: 0,
            last_use: 0,
            dirty: false,
            locked: false,
            n_bytes: 0,
            data: vec![0u8; chunk_bytes],
        }
    }

    pub fn is_free(&self) -> bool {
        self.object_id == 0
    }

    pub fn release(&mut self) {
        self.object_id = 0;
        self.chunk_id = 0;
        self.dirty = false;
        self.locked = false;
        self.n_bytes = 0;
    }
}

pub struct CacheSet {
    slots: Vec<ChunkCache>,
    use_counter: u32,
    pub n_hits: u64,
    pub n_misses: u64,
}

impl CacheSet {
    pub fn new(n_caches: usize, chunk_bytes: usize) -> Self {
        Self {
            slots: (0..n_caches).map(|_| ChunkCache::new(chunk_bytes)).collect(),
            use_counter: 0,
            n_hits: 0,
            n_misses: 0,
        }
    }

    pub fn n_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, idx: usize) -> &ChunkCache {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut ChunkCache {
        &mut self.slots[idx]
    }

    fn touch(&mut self, idx: usize) {
        self.use_counter += 1;
        if self.use_counter > LAST_USE_RENORM {
            for slot in &mut self.slots {
                slot.last_use = 0;
            }
            self.use_counter = 1;
        }
        self.slots[idx].last_use = self.use_counter;
    }

    /// Look a chunk up and stamp it used.
    pub fn find(&mut self, object_id: ObjectId, chunk_id: ChunkId) -> Option<usize> {
        let hit = self
            .slots
            .iter()
            .position(|s| !s.is_free() && s.object_id == object_id && s.chunk_id == chunk_id);
        match hit {
            Some(idx) => {
                self.n_hits += 1;
                self.touch(idx);
                Some(idx)
            }
            None => {
                self.n_misses += 1;
                None
            }
        }
    }

    /// Slot to (re)use for a new binding: a free slot if any, else the LRU
    /// unlocked one. The caller must flush the victim if it is dirty, then
    /// call `bind`. None when every slot is locked.
    pub fn grab(&self) -> Option<usize> {
        if let Some(idx) = self.slots.iter().position(|s| s.is_free()) {
            return Some(idx);
        }
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.locked)
            .min_by_key(|(_, s)| s.last_use)
            .map(|(idx, _)| idx)
    }

    pub fn bind(&mut self, idx: usize, object_id: ObjectId, chunk_id: ChunkId) {
        let slot = &mut self.slots[idx];
        slot.object_id = object_id;
        slot.chunk_id = chunk_id;
        slot.dirty = false;
        slot.locked = false;
        slot.n_bytes = 0;
        slot.data.fill(0);
        self.touch(idx);
    }

    /// Lowest-stamp dirty unlocked slot, for whole-device flushing.
    pub fn oldest_dirty(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_free() && s.dirty && !s.locked)
            .min_by_key(|(_, s)| s.last_use)
            .map(|(idx, _)| idx)
    }

    pub fn slots_of_object(&self, object_id: ObjectId) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_free() && s.object_id == object_id)
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn invalidate_chunk(&mut self, object_id: ObjectId, chunk_id: ChunkId) {
        for slot in &mut self.slots {
            if !slot.is_free() && slot.object_id == object_id && slot.chunk_id == chunk_id {
                slot.release();
            }
        }
    }

    pub fn invalidate_object(&mut self, object_id: ObjectId) {
        for slot in &mut self.slots {
            if !slot.is_free() && slot.object_id == object_id {
                slot.release();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_and_miss() {
        let mut cache = CacheSet::new(3, 64);
        assert!(cache.find(10, 0).is_none());
        let idx = cache.grab().unwrap();
        cache.bind(idx, 10, 0);
        assert_eq!(cache.find(10, 0), Some(idx));
        assert_eq!(cache.n_hits, 1);
        assert_eq!(cache.n_misses, 1);
    }

    #[test]
    fn grab_prefers_free_then_lru() {
        let mut cache = CacheSet::new(2, 16);
        let a = cache.grab().unwrap();
        cache.bind(a, 1, 0);
        let b = cache.grab().unwrap();
        assert_ne!(a, b);
        cache.bind(b, 1, 1);
        // both bound: oldest stamp (a) is the victim
        assert_eq!(cache.grab(), Some(a));
        cache.find(1, 0);
        assert_eq!(cache.grab(), Some(b));
    }

    #[test]
    fn locked_slots_are_never_victims() {
        let mut cache = CacheSet::new(2, 16);
        let a = cache.grab().unwrap();
        cache.bind(a, 1, 0);
        let b = cache.grab().unwrap();
        cache.bind(b, 1, 1);
        cache.slot_mut(a).locked = true;
        assert_eq!(cache.grab(), Some(b));
        cache.slot_mut(b).locked = true;
        assert_eq!(cache.grab(), None);
    }

    #[test]
    fn renormalization_keeps_order() {
        let mut cache = CacheSet::new(2, 16);
        cache.use_counter = LAST_USE_RENORM;
        let a = cache.grab().unwrap();
        cache.bind(a, 1, 0);
        // stamp overflowed the ceiling: everything reset, a stamped 1
        assert_eq!(cache.slot(a).last_use, 1);
        assert!(cache.use_counter < LAST_USE_RENORM);
    }

    #[test]
    fn invalidation() {
        let mut cache = CacheSet::new(4, 16);
        for chunk in 0..3u32 {
            let idx = cache.grab().unwrap();
            cache.bind(idx, 7, chunk);
        }
        cache.invalidate_chunk(7, 1);
        assert!(cache.find(7, 1).is_none());
        cache.invalidate_object(7);
        assert!(cache.find(7, 0).is_none());
        assert!(cache.find(7, 2).is_none());
    }
}
