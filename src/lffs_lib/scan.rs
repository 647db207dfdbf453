//! Mount-time scan: read every non-bad block, ordered by sequence number,
//! and replay the log into the block table, object table and index trees.
//! V2 walks newest-first (first observation wins); V1 walks oldest-first and
//! arbitrates collisions with the 2-bit serial.

use crate::lffs_lib::blocks::BlockTable;
use crate::lffs_lib::desc::*;
use crate::lffs_lib::objects::{Object, ObjectVariant};
use crate::lffs_lib::types::{FsError, FsResult, ObjectId};
use crate::lffs_lib::Lffs;
use log::*;
use nand_driver::NandDriver;

impl<T: NandDriver> Lffs<T> {
    fn begin_scan(&mut self) {
        self.during_scan = true;
        self.gc_disable = true;
        self.blocks = BlockTable::new(self.n_blocks, self.chunks_per_block);
        self.checkpoint_blocks.clear();
        self.checkpoint_loaded = false;
        self.alloc_block = None;
        self.alloc_page = 0;
        self.seq_number = SEQ_NUMBER_START;
        self.gc_block = None;
        self.gc_cleanup.clear();
    }

    fn end_scan(&mut self) {
        self.recompute_space();
        self.during_scan = false;
        self.gc_disable = false;
    }

    /// Classify every block by its first chunk: erased, checkpoint data, or
    /// in need of a scan. Returns the scan list as (seq, block).
    fn classify_blocks(&mut self) -> FsResult<Vec<(u32, usize)>> {
        let mut scan_list = Vec::new();
        for block in 0..self.n_blocks {
            if self.opts.version == crate::FlashVersion::V2
                && self.driver.check_bad(block).map_err(|e| FsError::Io(e.to_string()))?
            {
                self.blocks.set_state(block, BlockState::Dead);
                continue;
            }
            self.blocks.set_state(block, BlockState::NeedsScan);
            let chunk = self.join_chunk(block, 0);
            match self.read_chunk_raw(chunk, None) {
                Ok(None) => self.blocks.set_state(block, BlockState::Empty),
                Ok(Some((tags, _))) if tags.seq_number == SEQ_CHECKPOINT_DATA => {
                    self.blocks.set_state(block, BlockState::Checkpoint);
                    self.checkpoint_blocks.push(block);
                }
                Ok(Some((tags, _))) => {
                    self.blocks.get_block_info_mut(block).seq_number = tags.seq_number;
                    self.seq_number = self.seq_number.max(tags.seq_number);
                    scan_list.push((tags.seq_number, block));
                }
                Err(e) => {
                    warn!("block {} first chunk unreadable ({:?}), scanning anyway", block, e);
                    scan_list.push((0, block));
                }
            }
        }
        Ok(scan_list)
    }

    fn scan_find_or_create(&mut self, obj_id: ObjectId, obj_type: ObjectType) {
        if !self.objects.contains(obj_id) {
            let mut obj = Object::new(obj_id, obj_type);
            obj.lazy_name = true;
            self.objects.insert(obj);
        }
    }

    /// A header declares it shadows an older id: that id's state is dead.
    fn scan_handle_shadow(&mut self, shadows: ObjectId) {
        if shadows == 0 || shadows == NO_SHADOW {
            return;
        }
        debug!("scan: object {} is shadowed", shadows);
        self.scan_find_or_create(shadows, ObjectType::File);
        if let Some(obj) = self.objects.get_mut(shadows) {
            obj.deleted = true;
            obj.soft_del = true;
        }
    }

    fn accept_chunk(&mut self, block: usize, offset: usize) {
        self.blocks.set_chunk_bit(block, offset);
        self.blocks.get_block_info_mut(block).pages_in_use += 1;
    }

    /// Shared header bookkeeping once a header chunk has won arbitration.
    fn scan_adopt_header(
        &mut self,
        block: usize,
        offset: usize,
        tags: &ExtTags,
        hardlink_fixups: &mut Vec<ObjectId>,
    ) -> FsResult<()> {
        let obj_id = tags.obj_id;
        let chunk = self.join_chunk(block, offset);
        self.accept_chunk(block, offset);
        let obj = self.objects.require_mut(obj_id)?;
        obj.hdr_chunk = Some(chunk);
        obj.serial = tags.serial_number;
        obj.lazy_name = true;
        if tags.extra_available {
            // retype if the header disagrees with what data chunks implied
            if obj.obj_type() != tags.extra_obj_type {
                let empty_file = obj
                    .file()
                    .map(|f| f.n_data_chunks == 0)
                    .unwrap_or(false);
                if empty_file || tags.extra_obj_type != ObjectType::File {
                    obj.variant = ObjectVariant::for_type(tags.extra_obj_type);
                }
            }
            obj.parent = tags.extra_parent_id;
            if obj.parent == OBJECTID_DELETED {
                obj.deleted = true;
                obj.soft_del = true;
            }
            if obj.parent == OBJECTID_UNLINKED {
                obj.unlinked = true;
            }
            match &mut obj.variant {
                ObjectVariant::File(f) => {
                    if tags.extra_is_shrink {
                        f.file_size = tags.extra_file_size;
                        f.shrink_size = f.shrink_size.min(tags.extra_file_size);
                    } else {
                        f.file_size = f.file_size.max(tags.extra_file_size);
                    }
                }
                ObjectVariant::Hardlink { equiv_id } => {
                    *equiv_id = tags.extra_equiv_id;
                    hardlink_fixups.push(obj_id);
                }
                _ => {}
            }
            if tags.extra_is_shrink {
                self.blocks.get_block_info_mut(block).has_shrink_hdr = true;
            }
        }
        Ok(())
    }

    pub(crate) fn scan_backward(&mut self) -> FsResult<()> {
        info!("backward scan starting");
        self.begin_scan();
        let mut scan_list = self.classify_blocks()?;
        // newest first; block number breaks sequence ties the same way
        scan_list.sort_by(|a, b| b.cmp(a));
        let mut hardlink_fixups: Vec<ObjectId> = Vec::new();
        for (_, block) in scan_list {
            self.blocks.set_state(block, BlockState::Scanning);
            for offset in (0..self.chunks_per_block).rev() {
                let chunk = self.join_chunk(block, offset);
                let read = match self.read_chunk_raw(chunk, None) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("scan: chunk {} unreadable: {:?}", chunk, e);
                        continue;
                    }
                };
                let Some((tags, _)) = read else { continue };
                if tags.obj_id == 0 || tags.obj_id <= OBJECTID_LOST_N_FOUND || tags.is_deleted {
                    continue;
                }
                if tags.is_header() {
                    self.scan_handle_shadow(if tags.extra_available {
                        tags.extra_shadows
                    } else {
                        NO_SHADOW
                    });
                    self.scan_find_or_create(tags.obj_id, tags.extra_obj_type);
                    let obj = self.objects.require(tags.obj_id)?;
                    if obj.hdr_chunk.is_some() || obj.deleted {
                        // an older header, or the header of a dead id
                        continue;
                    }
                    self.scan_adopt_header(block, offset, &tags, &mut hardlink_fixups)?;
                } else {
                    self.scan_data_backward(block, offset, &tags)?;
                }
            }
            self.blocks.set_state(block, BlockState::Full);
        }
        self.scan_fixups(hardlink_fixups)?;
        self.end_scan();
        Ok(())
    }

    fn scan_data_backward(&mut self, block: usize, offset: usize, tags: &ExtTags) -> FsResult<()> {
        let obj_id = tags.obj_id;
        let logical = tags.logical_chunk();
        let payload = self.payload_bytes as u64;
        let chunk = self.join_chunk(block, offset);
        let value = self.tnode_value(chunk);
        let width = self.tnode_width;
        self.scan_find_or_create(obj_id, ObjectType::File);
        let obj = self.objects.require(obj_id)?;
        if obj.deleted || obj.soft_del {
            // data of a dying object stays accounted soft until GC gets it
            self.accept_chunk(block, offset);
            let info = self.blocks.get_block_info_mut(block);
            info.soft_del_pages += 1;
            let obj = self.objects.require_mut(obj_id)?;
            if let Ok(f) = obj.file_mut() {
                f.n_data_chunks += 1;
            }
            return Ok(());
        }
        let hdr_seen = obj.hdr_chunk.is_some();
        let Ok(file) = obj.file() else {
            // data tagged for a non-file object: leftovers of a retype
            return Ok(());
        };
        if hdr_seen {
            let live_chunks = (file.file_size + payload - 1) / payload;
            if logical as u64 >= live_chunks {
                // beyond the newest size: truncated-away history
                return Ok(());
            }
        }
        if file.tnodes.find(logical, width) != 0 {
            // a newer copy has already been seen
            return Ok(());
        }
        let file = self.objects.require_mut(obj_id)?.file_mut()?;
        file.tnodes.put(logical, value, width);
        file.n_data_chunks += 1;
        let end = logical as u64 * payload + tags.n_bytes as u64;
        if !hdr_seen {
            file.file_size = file.file_size.max(end);
        }
        file.stored_size = file.stored_size.max(end);
        self.accept_chunk(block, offset);
        Ok(())
    }

    pub(crate) fn scan_forward(&mut self) -> FsResult<()> {
        info!("forward scan starting");
        self.begin_scan();
        let mut scan_list = self.classify_blocks()?;
        scan_list.sort();
        let mut hardlink_fixups: Vec<ObjectId> = Vec::new();
        for (_, block) in scan_list {
            self.blocks.set_state(block, BlockState::Scanning);
            for offset in 0..self.chunks_per_block {
                let chunk = self.join_chunk(block, offset);
                let read = match self.read_chunk_raw(chunk, None) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("scan: chunk {} unreadable: {:?}", chunk, e);
                        continue;
                    }
                };
                let Some((tags, _)) = read else { continue };
                if tags.obj_id == 0 || tags.obj_id <= OBJECTID_LOST_N_FOUND {
                    continue;
                }
                if tags.is_deleted {
                    // v1 deletion marker: discard on sight
                    continue;
                }
                if tags.is_header() {
                    self.scan_handle_shadow(if tags.extra_available {
                        tags.extra_shadows
                    } else {
                        NO_SHADOW
                    });
                    self.scan_find_or_create(tags.obj_id, tags.extra_obj_type);
                    let obj = self.objects.require(tags.obj_id)?;
                    if obj.deleted {
                        continue;
                    }
                    // forward scan: the later header wins
                    if let Some(old_hdr) = obj.hdr_chunk {
                        self.chunk_del(old_hdr, false);
                        self.objects.require_mut(tags.obj_id)?.hdr_chunk = None;
                    }
                    self.scan_adopt_header(block, offset, &tags, &mut hardlink_fixups)?;
                    if tags.extra_available && tags.extra_is_shrink {
                        self.scan_apply_shrink(tags.obj_id)?;
                    }
                } else {
                    self.scan_data_forward(block, offset, &tags)?;
                }
            }
            self.blocks.set_state(block, BlockState::Full);
        }
        self.scan_fixups(hardlink_fixups)?;
        self.end_scan();
        Ok(())
    }

    /// A shrink header seen mid-forward-scan invalidates every recorded
    /// chunk past the new size.
    fn scan_apply_shrink(&mut self, obj_id: ObjectId) -> FsResult<()> {
        let payload = self.payload_bytes as u64;
        let width = self.tnode_width;
        let (size, slots): (u64, Vec<u32>) = {
            let obj = self.objects.require(obj_id)?;
            let Ok(file) = obj.file() else { return Ok(()) };
            let mut slots = Vec::new();
            file.tnodes.walk(width, &mut |chunk_id, _| slots.push(chunk_id));
            (file.file_size, slots)
        };
        let live_chunks = (size + payload - 1) / payload;
        for logical in slots {
            if (logical as u64) < live_chunks {
                continue;
            }
            if let Some(chunk) = self.find_data_chunk(obj_id, logical)? {
                self.chunk_del(chunk, false);
            }
            let file = self.objects.require_mut(obj_id)?.file_mut()?;
            if file.tnodes.clear(logical, width) != 0 {
                file.n_data_chunks = file.n_data_chunks.saturating_sub(1);
            }
        }
        let file = self.objects.require_mut(obj_id)?.file_mut()?;
        file.tnodes.prune();
        file.stored_size = file.stored_size.min(size);
        Ok(())
    }

    fn scan_data_forward(&mut self, block: usize, offset: usize, tags: &ExtTags) -> FsResult<()> {
        let obj_id = tags.obj_id;
        let logical = tags.logical_chunk();
        let payload = self.payload_bytes as u64;
        let chunk = self.join_chunk(block, offset);
        let value = self.tnode_value(chunk);
        let width = self.tnode_width;
        self.scan_find_or_create(obj_id, ObjectType::File);
        let obj = self.objects.require(obj_id)?;
        if obj.deleted {
            return Ok(());
        }
        let Ok(file) = obj.file() else { return Ok(()) };
        let existing = file.tnodes.find(logical, width);
        if existing != 0 {
            // two live candidates for one logical chunk: 2-bit serial
            // arithmetic decides, the loser is dropped
            let old_chunk = self.find_chunk_in_group(existing, obj_id, logical + 1)?;
            let old_serial = match old_chunk {
                Some(c) => match self.read_chunk_raw(c, None)? {
                    Some((t, _)) => t.serial_number,
                    None => 0,
                },
                None => 0,
            };
            if serial_newer(old_serial, tags.serial_number) {
                if let Some(c) = old_chunk {
                    self.chunk_del(c, false);
                }
                let file = self.objects.require_mut(obj_id)?.file_mut()?;
                file.tnodes.put(logical, value, width);
                self.accept_chunk(block, offset);
            }
            return Ok(());
        }
        let file = self.objects.require_mut(obj_id)?.file_mut()?;
        file.tnodes.put(logical, value, width);
        file.n_data_chunks += 1;
        let end = logical as u64 * payload + tags.n_bytes as u64;
        file.file_size = file.file_size.max(end);
        file.stored_size = file.stored_size.max(end);
        self.accept_chunk(block, offset);
        Ok(())
    }

    /// Post-walk repairs: hard-link targets, orphans to lost+found, broken
    /// parent chains, and the half-deleted leftovers under the pseudo dirs.
    fn scan_fixups(&mut self, hardlink_fixups: Vec<ObjectId>) -> FsResult<()> {
        for link in hardlink_fixups {
            if self.objects.register_hardlink(link).is_err() {
                warn!("scan: hard link {} has no target, dropping it", link);
                let _ = self.delete_object_now(link);
            }
        }
        // make sure every referenced parent exists before linking
        for id in self.objects.ids() {
            let parent = self.objects.get(id).map(|o| o.parent).unwrap_or(0);
            if parent != 0 && !self.objects.contains(parent) {
                debug!("scan: conjuring lost parent directory {}", parent);
                let mut dir = Object::new(parent, ObjectType::Directory);
                dir.lazy_name = true;
                self.objects.insert(dir);
            }
        }
        for id in self.objects.ids() {
            let Some(obj) = self.objects.get(id) else { continue };
            if obj.is_pseudo() {
                continue;
            }
            let parent = obj.parent;
            let target = if obj.deleted {
                OBJECTID_DELETED
            } else if obj.unlinked {
                OBJECTID_UNLINKED
            } else if parent == 0 {
                OBJECTID_LOST_N_FOUND
            } else if self.objects.get(parent).map(|p| p.dir().is_ok()).unwrap_or(false) {
                parent
            } else {
                OBJECTID_LOST_N_FOUND
            };
            self.objects.add_child(target, id)?;
        }
        // re-home anything whose parent chain never reaches a real anchor
        for id in self.objects.ids() {
            let Some(obj) = self.objects.get(id) else { continue };
            if obj.is_pseudo() || self.reaches_anchor(id) {
                continue;
            }
            warn!("scan: object {} has a broken parent chain, re-homing", id);
            let old_parent = obj.parent;
            if old_parent != 0 {
                self.objects.remove_child(old_parent, id)?;
            }
            self.objects.add_child(OBJECTID_LOST_N_FOUND, id)?;
        }
        // finish off whatever was mid-deletion when the power went
        for pseudo in [OBJECTID_DELETED, OBJECTID_UNLINKED] {
            let members = self.objects.require(pseudo)?.dir()?.children.clone();
            for id in members {
                let keep = self
                    .objects
                    .get(id)
                    .and_then(|o| o.file().ok().map(|f| f.n_data_chunks > 0))
                    .unwrap_or(false);
                if keep {
                    if let Some(obj) = self.objects.get_mut(id) {
                        obj.soft_del = true;
                        obj.deleted = true;
                    }
                } else {
                    debug!("scan: stripping fully-deleted object {}", id);
                    let _ = self.delete_object_now(id);
                }
            }
        }
        Ok(())
    }

    /// Walk parents until ROOT or a deletion pseudo-dir is reached.
    fn reaches_anchor(&self, id: ObjectId) -> bool {
        let mut cur = id;
        for _ in 0..MAX_OBJECT_DEPTH {
            if cur == OBJECTID_ROOT || cur == OBJECTID_DELETED || cur == OBJECTID_UNLINKED {
                return true;
            }
            match self.objects.get(cur) {
                Some(obj) if obj.parent != 0 => cur = obj.parent,
                _ => return false,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use crate::lffs_lib::desc::*;
    use crate::lffs_lib::test_support::*;
    use crate::lffs_lib::types::LffsOptions;
    use crate::lffs_lib::Lffs;
    use nand_driver::RamNandDriver;

    /// Pull the media out of a device and remount it fresh, as after power
    /// loss: all RAM state is discarded.
    fn remount(dev: Lffs<RamNandDriver>) -> Lffs<RamNandDriver> {
        let media = dev.driver.media().clone();
        let opts = dev.opts.clone();
        let mut fresh = Lffs::new(RamNandDriver::from_media(media), opts).unwrap();
        fresh.mount(&unique_name("rescan")).unwrap();
        fresh
    }

    #[test]
    fn scan_rebuilds_files_without_checkpoint() {
        let mut dev = small_device();
        let file = dev
            .create(OBJECTID_ROOT, "persisted", ObjectType::File, 0o644, 0, 0, Default::default())
            .unwrap();
        let data: Vec<u8> = (0..1300).map(|i| (i % 256) as u8).collect();
        dev.write(file, 0, &data, false).unwrap();
        dev.flush(file, false, false, false).unwrap();
        dev.sync(false).unwrap();

        let mut fresh = remount(dev);
        let found = fresh.lookup(OBJECTID_ROOT, "persisted").unwrap();
        let attr = fresh.stat(found).unwrap();
        assert_eq!(attr.size, 1300);
        let mut back = vec![0u8; 1300];
        assert_eq!(fresh.read(found, 0, 1300, &mut back).unwrap(), 1300);
        assert_eq!(back, data);
    }

    #[test]
    fn newest_copy_wins_after_remount() {
        let mut dev = small_device();
        let file = dev
            .create(OBJECTID_ROOT, "rewrite", ObjectType::File, 0o644, 0, 0, Default::default())
            .unwrap();
        let payload = dev.chunk_bytes();
        dev.write(file, 0, &vec![0xAA; payload], false).unwrap();
        dev.flush(file, false, false, false).unwrap();
        dev.write(file, 0, &vec![0xBB; payload], false).unwrap();
        dev.flush(file, false, false, false).unwrap();
        dev.sync(false).unwrap();

        let mut fresh = remount(dev);
        let found = fresh.lookup(OBJECTID_ROOT, "rewrite").unwrap();
        let mut back = vec![0u8; payload];
        fresh.read(found, 0, payload, &mut back).unwrap();
        assert!(back.iter().all(|b| *b == 0xBB));
    }

    #[test]
    fn forward_scan_v1_round_trip() {
        let mut dev = device_with(
            16,
            32,
            512,
            LffsOptions {
                version: crate::FlashVersion::V1,
                ..Default::default()
            },
        );
        let file = dev
            .create(OBJECTID_ROOT, "v1file", ObjectType::File, 0o644, 0, 0, Default::default())
            .unwrap();
        let payload = dev.chunk_bytes();
        dev.write(file, 0, &vec![0x11; payload * 2], false).unwrap();
        dev.flush(file, false, false, false).unwrap();
        // rewrite chunk 0 so the serial arbitration has work to do
        dev.write(file, 0, &vec![0x22; payload], false).unwrap();
        dev.flush(file, false, false, false).unwrap();
        dev.sync(false).unwrap();

        let mut fresh = remount(dev);
        let found = fresh.lookup(OBJECTID_ROOT, "v1file").unwrap();
        let mut back = vec![0u8; payload * 2];
        fresh.read(found, 0, payload * 2, &mut back).unwrap();
        assert!(back[..payload].iter().all(|b| *b == 0x22));
        assert!(back[payload..].iter().all(|b| *b == 0x11));
    }

    #[test]
    fn directories_and_symlinks_come_back() {
        let mut dev = small_device();
        let sub = dev
            .create(OBJECTID_ROOT, "subdir", ObjectType::Directory, 0o755, 0, 0, Default::default())
            .unwrap();
        dev.create(
            sub,
            "inner",
            ObjectType::File,
            0o600,
            10,
            20,
            Default::default(),
        )
        .unwrap();
        dev.create(
            OBJECTID_ROOT,
            "sl",
            ObjectType::Symlink,
            0o777,
            0,
            0,
            crate::lffs_lib::fs::CreateExtra {
                alias: Some("subdir/inner".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        dev.sync(false).unwrap();

        let mut fresh = remount(dev);
        let sub2 = fresh.lookup(OBJECTID_ROOT, "subdir").unwrap();
        let inner = fresh.lookup(sub2, "inner").unwrap();
        let attr = fresh.stat(inner).unwrap();
        assert_eq!(attr.uid, 10);
        assert_eq!(attr.gid, 20);
        let sl = fresh.lookup(OBJECTID_ROOT, "sl").unwrap();
        assert_eq!(fresh.stat(sl).unwrap().obj_type, ObjectType::Symlink);
        assert_eq!(fresh.readlink(sl).unwrap(), "subdir/inner");
    }
}
