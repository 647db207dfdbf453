//! Garbage collection: pick a victim block, relocate whatever is still live
//! in it, surrender the block for erasure. Policy has three tiers plus an
//! oldest-dirty fallback for the aging tail of the log.

use crate::lffs_lib::desc::*;
use crate::lffs_lib::types::{FsResult, ObjectId};
use crate::lffs_lib::Lffs;
use log::*;
use nand_driver::NandDriver;

/// Live-chunk ceiling under which leisurely GC copies per invocation.
const LEISURELY_MAX_COPIES: usize = 5;
/// Futile-invocation counts that trigger the oldest-dirty fallback.
const FUTILE_BACKGROUND: u32 = 10;
const FUTILE_FOREGROUND: u32 = 20;
/// "Good enough": stop scanning once a candidate is this clean.
const GOOD_ENOUGH_LIVE: u32 = 2;

impl<T: NandDriver> Lffs<T> {
    fn block_live_pages(&self, block: usize) -> u32 {
        let info = self.blocks.get_block_info(block);
        info.pages_in_use.saturating_sub(info.soft_del_pages)
    }

    /// Opportunistic entry point: called around writes and on demand. Keeps
    /// collecting while the device is in the aggressive zone.
    pub(crate) fn check_gc(&mut self, background: bool) -> FsResult<()> {
        if self.gc_disable || self.read_only || self.gc_running {
            return Ok(());
        }
        let mut tries = 0usize;
        loop {
            tries += 1;
            let aggressive = self.n_erased_blocks < self.reserve_blocks_needed();
            if self.gc_block.is_none() {
                self.gc_block = self.select_gc_block(aggressive, background);
                self.gc_chunk = 0;
            }
            let Some(block) = self.gc_block else { break };
            self.stats.n_gcs += 1;
            self.gc_block_worker(block, aggressive)?;
            if !aggressive
                || self.n_erased_blocks >= self.reserve_blocks_needed()
                || tries > self.n_blocks * 2
            {
                break;
            }
        }
        Ok(())
    }

    /// Collect until the chosen block is finished (used by tests and the
    /// sync path when the log tail should be compacted).
    pub fn gc_once(&mut self, aggressive: bool) -> FsResult<bool> {
        if self.gc_block.is_none() {
            self.gc_block = self.select_gc_block(aggressive, false);
            self.gc_chunk = 0;
        }
        let Some(block) = self.gc_block else { return Ok(false) };
        while self.gc_block == Some(block) {
            self.stats.n_gcs += 1;
            self.gc_block_worker(block, true)?;
        }
        Ok(true)
    }

    fn collectible(&self, block: usize) -> bool {
        let info = self.blocks.get_block_info(block);
        info.state == BlockState::Full
    }

    fn select_gc_block(&mut self, aggressive: bool, background: bool) -> Option<usize> {
        // priority pass: blocks flagged by the ECC policy come first
        for block in 0..self.n_blocks {
            let info = self.blocks.get_block_info(block);
            if info.gc_prioritise && matches!(info.state, BlockState::Full | BlockState::Dirty) {
                debug!("gc: prioritised block {}", block);
                self.gc_not_done = 0;
                return Some(block);
            }
        }
        let cpb = self.chunks_per_block as u32;
        let mut best: Option<(usize, u32)> = None;
        if aggressive {
            // whole-device sweep for the block with the fewest live pages;
            // a fully-live block reclaims nothing and is never worth copying
            for block in 0..self.n_blocks {
                if !self.collectible(block) {
                    continue;
                }
                let live = self.block_live_pages(block);
                if live >= cpb {
                    continue;
                }
                if best.map(|(_, l)| live < l).unwrap_or(true) {
                    best = Some((block, live));
                }
            }
        } else {
            let mut threshold = if background { cpb / 2 } else { cpb / 8 };
            threshold = (threshold + 2 * (self.gc_not_done + 2)).min(cpb);
            let samples = (self.n_blocks / 16 + 1).min(100);
            for _ in 0..samples {
                let block = self.gc_finder;
                self.gc_finder = (self.gc_finder + 1) % self.n_blocks;
                if !self.collectible(block) {
                    continue;
                }
                if self.blocks.get_block_info(block).has_shrink_hdr {
                    continue;
                }
                let live = self.block_live_pages(block);
                if live >= threshold {
                    continue;
                }
                if best.map(|(_, l)| live < l).unwrap_or(true) {
                    best = Some((block, live));
                }
                if live <= GOOD_ENOUGH_LIVE {
                    break;
                }
            }
        }
        if let Some((block, live)) = best {
            debug!("gc: selected block {} with {} live pages", block, live);
            self.gc_not_done = 0;
            return Some(block);
        }
        self.gc_not_done += 1;
        let futile_limit = if background { FUTILE_BACKGROUND } else { FUTILE_FOREGROUND };
        if self.gc_not_done >= futile_limit {
            // reclaim the aging tail: oldest sequence number with any slack
            let mut oldest: Option<(usize, u32)> = None;
            for block in 0..self.n_blocks {
                if !self.collectible(block) {
                    continue;
                }
                let info = self.blocks.get_block_info(block);
                if self.block_live_pages(block) >= cpb {
                    continue;
                }
                if oldest.map(|(_, s)| info.seq_number < s).unwrap_or(true) {
                    oldest = Some((block, info.seq_number));
                }
            }
            if let Some((block, seq)) = oldest {
                debug!("gc: oldest-dirty fallback, block {} seq {}", block, seq);
                self.gc_not_done = 0;
                return Some(block);
            }
        }
        None
    }

    /// Relocate up to max-copies live chunks out of `block`; when the whole
    /// block has been walked, run the soft-delete cleanup list and hand the
    /// block over for erasure.
    fn gc_block_worker(&mut self, block: usize, aggressive: bool) -> FsResult<()> {
        // relocation moves chunks out from under any on-flash snapshot
        self.invalidate_checkpoint();
        self.gc_running = true;
        let result = self.gc_block_worker_inner(block, aggressive);
        self.gc_running = false;
        result
    }

    fn gc_block_worker_inner(&mut self, block: usize, aggressive: bool) -> FsResult<()> {
        self.blocks.set_state(block, BlockState::Collecting);
        if !self.blocks.still_some_chunks(block) {
            self.finish_gc_block(block);
            return Ok(());
        }
        let max_copies = if aggressive { self.chunks_per_block } else { LEISURELY_MAX_COPIES };
        let mut copies = 0usize;
        let start = self.gc_chunk;
        for offset in start..self.chunks_per_block {
            if copies >= max_copies {
                // partial pass; resume here next invocation
                self.gc_chunk = offset;
                return Ok(());
            }
            if !self.blocks.check_chunk_bit(block, offset) {
                continue;
            }
            let chunk = self.join_chunk(block, offset);
            let mut data = vec![0u8; self.payload_bytes];
            let read = self.read_chunk_raw(chunk, Some(&mut data))?;
            let Some((tags, _ecc)) = read else {
                // bitmap said live but the chunk is erased; drop the bit
                self.chunk_del(chunk, false);
                continue;
            };
            let owner = if tags.obj_id == 0 || tags.is_deleted {
                None
            } else {
                self.objects.get(tags.obj_id).map(|o| (o.soft_del, o.id))
            };
            match owner {
                None => {
                    // nobody owns this; plain stale data
                    self.chunk_del(chunk, false);
                }
                Some((true, obj_id)) if !tags.is_header() => {
                    // soft-deleted file data: fix the accounting, remember
                    // the object for the cleanup pass
                    self.blocks.clear_chunk_bit(block, offset);
                    let info = self.blocks.get_block_info_mut(block);
                    info.pages_in_use = info.pages_in_use.saturating_sub(1);
                    info.soft_del_pages = info.soft_del_pages.saturating_sub(1);
                    if let Some(obj) = self.objects.get_mut(obj_id) {
                        if let Ok(f) = obj.file_mut() {
                            f.n_data_chunks = f.n_data_chunks.saturating_sub(1);
                        }
                    }
                    if !self.gc_cleanup.contains(&obj_id) {
                        self.gc_cleanup.push(obj_id);
                    }
                }
                Some((_, obj_id)) => {
                    copies += 1;
                    self.stats.n_gc_copies += 1;
                    if tags.is_header() {
                        // a header rewrite also refreshes size/shrink/shadow
                        // state from RAM before it lands
                        self.update_header(obj_id, false, NO_SHADOW, true)?;
                    } else {
                        self.relocate_data_chunk(chunk, &data, &tags, obj_id)?;
                    }
                }
            }
        }
        self.finish_gc_block(block);
        Ok(())
    }

    fn relocate_data_chunk(
        &mut self,
        old_chunk: u32,
        data: &[u8],
        tags: &ExtTags,
        obj_id: ObjectId,
    ) -> FsResult<()> {
        let logical = tags.logical_chunk();
        let is_file_chunk = self
            .objects
            .get(obj_id)
            .map(|o| o.file().is_ok())
            .unwrap_or(false);
        if !is_file_chunk {
            // data chunk tagged for a non-file object: garbage from a
            // crash-interrupted retype
            self.chunk_del(old_chunk, false);
            return Ok(());
        }
        let mut new_tags = ExtTags::new_data(
            obj_id,
            logical,
            tags.n_bytes,
            (tags.serial_number + 1) & 3,
        );
        let new_chunk = self.write_new_chunk(data, &mut new_tags, true)?;
        let value = self.tnode_value(new_chunk);
        let width = self.tnode_width;
        let file = self.objects.require_mut(obj_id)?.file_mut()?;
        file.tnodes.put(logical, value, width);
        self.chunk_del(old_chunk, false);
        Ok(())
    }

    fn finish_gc_block(&mut self, block: usize) {
        self.gc_block = None;
        self.gc_chunk = 0;
        // objects whose last soft-deleted chunk just left the device
        let cleanup = std::mem::take(&mut self.gc_cleanup);
        for obj_id in cleanup {
            let done = self
                .objects
                .get(obj_id)
                .and_then(|o| o.file().ok().map(|f| f.n_data_chunks == 0))
                .unwrap_or(false);
            if done {
                debug!("gc: soft-deleted object {} fully reclaimed", obj_id);
                if let Err(e) = self.delete_object_now(obj_id) {
                    warn!("gc cleanup of object {} failed: {:?}", obj_id, e);
                }
            }
        }
        let info = self.blocks.get_block_info(block);
        if info.pages_in_use == 0 {
            self.block_became_dirty(block);
        } else {
            // copies limit or a straggler kept it alive; try again later
            self.blocks.set_state(block, BlockState::Full);
        }
    }

    /// Background tick: give the collector a slice of idle time.
    pub fn background_gc(&mut self) -> FsResult<()> {
        self.check_gc(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::lffs_lib::desc::*;
    use crate::lffs_lib::test_support::*;

    #[test]
    fn empty_device_has_nothing_to_collect() {
        let mut dev = small_device();
        assert!(!dev.gc_once(true).unwrap());
        assert_eq!(dev.stats.n_gc_copies, 0);
    }

    #[test]
    fn deleted_data_block_gets_erased() {
        let mut dev = small_device();
        let file = dev
            .create(OBJECTID_ROOT, "victim", ObjectType::File, 0o644, 0, 0, Default::default())
            .unwrap();
        let payload = dev.chunk_bytes();
        let data = vec![0x33u8; payload * 8];
        dev.write(file, 0, &data, false).unwrap();
        dev.flush(file, false, false, false).unwrap();
        dev.unlink(OBJECTID_ROOT, "victim").unwrap();
        let erased_before = dev.stats.n_erasures;
        // drive the collector until it runs dry
        while dev.gc_once(true).unwrap() {}
        assert!(dev.stats.n_erasures > erased_before);
        // the object is gone from the table once its chunks are reclaimed
        assert!(dev.objects.get(file).is_none());
    }

    #[test]
    fn live_chunks_survive_collection() {
        let mut dev = small_device();
        let file = dev
            .create(OBJECTID_ROOT, "keeper", ObjectType::File, 0o644, 0, 0, Default::default())
            .unwrap();
        let payload = dev.chunk_bytes();
        let data: Vec<u8> = (0..payload * 3).map(|i| (i % 251) as u8).collect();
        dev.write(file, 0, &data, false).unwrap();
        dev.flush(file, false, false, false).unwrap();
        // rewrite the first chunk a few times to dirty its old copies
        for round in 0..4u8 {
            dev.write(file, 0, &vec![round; payload], false).unwrap();
            dev.flush(file, false, false, false).unwrap();
        }
        while dev.gc_once(true).unwrap() {}
        let mut back = vec![0u8; payload * 3];
        let n = dev.read(file, 0, payload * 3, &mut back).unwrap();
        assert_eq!(n, payload * 3);
        assert_eq!(&back[..payload], &vec![3u8; payload][..]);
        assert_eq!(&back[payload..], &data[payload..]);
    }
}
