//! Caller-facing operations. The POSIX façade above translates paths and
//! file descriptors; everything here speaks object ids.

use crate::lffs_lib::desc::*;
use crate::lffs_lib::objects::{Object, ObjectAttr, ObjectVariant};
use crate::lffs_lib::types::{FsError, FsResult, ObjectId};
use crate::lffs_lib::utils::now_secs;
use crate::lffs_lib::Lffs;
use log::*;
use nand_driver::NandDriver;

/// Per-type creation payload.
#[derive(Debug, Default, Clone)]
pub struct CreateExtra {
    pub alias: Option<String>,
    pub equiv: Option<ObjectId>,
    pub rdev: Option<u32>,
}

impl<T: NandDriver> Lffs<T> {
    pub fn max_file_size(&self) -> u64 {
        (crate::lffs_lib::tnodes::MAX_CHUNK_ID as u64 + 1) * self.payload_bytes as u64
    }

    /// Resolve any lazily-loaded names among a directory's children so the
    /// checksum prefilter and exact compare both work.
    fn load_dir_names(&mut self, dir: ObjectId) -> FsResult<()> {
        let children = self.objects.require(dir)?.dir()?.children.clone();
        for child in children {
            if self.objects.get(child).map(|o| o.lazy_name).unwrap_or(false) {
                self.ensure_header_loaded(child)?;
            }
        }
        Ok(())
    }

    /// Single-component name lookup in a directory.
    pub fn lookup(&mut self, dir: ObjectId, name: &str) -> FsResult<ObjectId> {
        if name.len() > MAX_NAME_LENGTH {
            return Err(FsError::NameTooLong);
        }
        let dir = self.objects.equivalent(dir)?;
        self.load_dir_names(dir)?;
        self.objects
            .find_child_by_name(dir, name, self.opts.case_insensitive)?
            .ok_or(FsError::NotFound)
    }

    pub fn create(
        &mut self,
        parent: ObjectId,
        name: &str,
        obj_type: ObjectType,
        mode: u32,
        uid: u32,
        gid: u32,
        extra: CreateExtra,
    ) -> FsResult<ObjectId> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        if name.is_empty() {
            return Err(FsError::Range);
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(FsError::NameTooLong);
        }
        let parent = self.objects.equivalent(parent)?;
        self.objects.require(parent)?.dir()?;
        match self.lookup(parent, name) {
            Ok(_) => return Err(FsError::Exists),
            Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
        // per-type payload validation up front
        let alias = match obj_type {
            ObjectType::Symlink => {
                let alias = extra.alias.clone().ok_or(FsError::Range)?;
                if alias.len() > MAX_ALIAS_LENGTH {
                    return Err(FsError::NameTooLong);
                }
                Some(alias)
            }
            _ => None,
        };
        let equiv = match obj_type {
            ObjectType::Hardlink => {
                let target = self.objects.equivalent(extra.equiv.ok_or(FsError::Range)?)?;
                let tobj = self.objects.require(target)?;
                if !matches!(tobj.variant, ObjectVariant::File(_) | ObjectVariant::Directory(_)) {
                    return Err(FsError::BadHandle);
                }
                Some(target)
            }
            _ => None,
        };
        if obj_type == ObjectType::Unknown {
            return Err(FsError::Range);
        }
        self.invalidate_checkpoint();
        self.check_gc(false)?;
        let id = self.objects.alloc_id()?;
        let mut obj = Object::new(id, obj_type);
        obj.set_name(name, self.opts.case_insensitive);
        obj.mode = mode;
        obj.uid = uid;
        obj.gid = gid;
        let now = now_secs();
        obj.atime = now;
        obj.mtime = now;
        obj.ctime = now;
        match &mut obj.variant {
            ObjectVariant::Symlink { alias: a } => *a = alias.unwrap(),
            ObjectVariant::Hardlink { equiv_id } => *equiv_id = equiv.unwrap(),
            ObjectVariant::Special { rdev } => *rdev = extra.rdev.unwrap_or(0),
            _ => {}
        }
        self.objects.insert(obj);
        self.objects.add_child(parent, id)?;
        if obj_type == ObjectType::Hardlink {
            self.objects.register_hardlink(id)?;
        }
        if let Err(e) = self.update_header(id, false, NO_SHADOW, false) {
            // roll the half-born object back out
            self.objects.unregister_hardlink(id);
            let _ = self.objects.remove_child(parent, id);
            self.objects.remove(id);
            return Err(e);
        }
        self.mark_dir_dirty(parent);
        debug!("created object {} ({:?}) '{}' under {}", id, obj_type, name, parent);
        Ok(id)
    }

    pub fn unlink(&mut self, dir: ObjectId, name: &str) -> FsResult<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        let dir = self.objects.equivalent(dir)?;
        let id = self.lookup(dir, name)?;
        if self.objects.require(id)?.is_pseudo() || id == OBJECTID_ROOT {
            return Err(FsError::Busy);
        }
        if let Ok(d) = self.objects.require(id)?.dir() {
            if !d.children.is_empty() {
                return Err(FsError::NotEmpty);
            }
        }
        self.invalidate_checkpoint();
        self.check_gc(false)?;
        self.delete_object(id)?;
        self.mark_dir_dirty(dir);
        Ok(())
    }

    /// Object teardown with hard-link promotion and soft delete.
    pub(crate) fn delete_object(&mut self, id: ObjectId) -> FsResult<()> {
        self.ensure_header_loaded(id)?;
        if !self.objects.require(id)?.hard_links.is_empty() {
            return self.promote_hardlink(id);
        }
        self.cache.invalidate_object(id);
        let has_data = self
            .objects
            .require(id)?
            .file()
            .map(|f| f.n_data_chunks > 0)
            .unwrap_or(false);
        if has_data {
            // data chunks are released lazily: park the object in the
            // deleted pseudo-dir, persist that fact, then soft-delete
            let parent = self.objects.require(id)?.parent;
            if parent != 0 {
                self.objects.remove_child(parent, id)?;
            }
            self.objects.add_child(OBJECTID_DELETED, id)?;
            self.objects.require_mut(id)?.deleted = true;
            self.update_header(id, false, NO_SHADOW, true)?;
            self.soft_delete_file(id)?;
        } else {
            self.delete_object_now(id)?;
        }
        Ok(())
    }

    /// Deleting an object that has hard links promotes the first link: the
    /// original takes over the link's name and place.
    fn promote_hardlink(&mut self, id: ObjectId) -> FsResult<()> {
        let link = self.objects.require(id)?.hard_links[0];
        self.ensure_header_loaded(link)?;
        let lobj = self.objects.require(link)?;
        let link_name = lobj.name.clone().unwrap_or_default();
        let link_parent = lobj.parent;
        debug!("promoting hard link {} for object {}", link, id);
        self.delete_object_now(link)?;
        let old_parent = self.objects.require(id)?.parent;
        if old_parent != 0 {
            self.objects.remove_child(old_parent, id)?;
        }
        let fold = self.opts.case_insensitive;
        self.objects.require_mut(id)?.set_name(&link_name, fold);
        self.objects.add_child(link_parent, id)?;
        self.update_header(id, false, NO_SHADOW, true)?;
        self.mark_dir_dirty(link_parent);
        Ok(())
    }

    pub fn rename(
        &mut self,
        olddir: ObjectId,
        oldname: &str,
        newdir: ObjectId,
        newname: &str,
    ) -> FsResult<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        if newname.is_empty() {
            return Err(FsError::Range);
        }
        if newname.len() > MAX_NAME_LENGTH {
            return Err(FsError::NameTooLong);
        }
        let olddir = self.objects.equivalent(olddir)?;
        let newdir = self.objects.equivalent(newdir)?;
        self.objects.require(newdir)?.dir()?;
        let id = self.lookup(olddir, oldname)?;
        let moving_dir = self.objects.require(id)?.dir().is_ok();
        if moving_dir {
            // a directory cannot move into its own subtree
            let mut cur = newdir;
            for _ in 0..MAX_OBJECT_DEPTH {
                if cur == id {
                    return Err(FsError::Range);
                }
                match self.objects.get(cur) {
                    Some(obj) if obj.parent != 0 => cur = obj.parent,
                    _ => break,
                }
            }
        }
        let mut shadows = NO_SHADOW;
        match self.lookup(newdir, newname) {
            Ok(target) if target == id => return Ok(()),
            Ok(target) => {
                let target_is_dir = self.objects.require(target)?.dir().is_ok();
                if target_is_dir {
                    if !self.objects.require(target)?.dir()?.children.is_empty() {
                        return Err(FsError::NotEmpty);
                    }
                    if !moving_dir {
                        return Err(FsError::IsDir);
                    }
                } else if moving_dir {
                    return Err(FsError::NotDir);
                }
                shadows = target;
            }
            Err(FsError::NotFound) => {}
            Err(e) => return Err(e),
        }
        self.invalidate_checkpoint();
        self.check_gc(false)?;
        self.objects.remove_child(olddir, id)?;
        let fold = self.opts.case_insensitive;
        self.objects.require_mut(id)?.set_name(newname, fold);
        self.objects.add_child(newdir, id)?;
        // the new header declares it shadows the overwritten id, so a crash
        // in between resolves cleanly at the next mount
        self.update_header(id, false, shadows, false)?;
        if shadows != NO_SHADOW {
            self.delete_object(shadows)?;
        }
        self.mark_dir_dirty(olddir);
        self.mark_dir_dirty(newdir);
        Ok(())
    }

    fn require_file(&self, obj_id: ObjectId) -> FsResult<()> {
        let obj = self.objects.require(obj_id)?;
        match obj.variant {
            ObjectVariant::File(_) => Ok(()),
            ObjectVariant::Directory(_) => Err(FsError::IsDir),
            _ => Err(FsError::BadHandle),
        }
    }

    /// Bring a (object, logical chunk) into a cache slot, evicting (and
    /// flushing) the LRU victim if needed.
    fn cache_load(&mut self, obj_id: ObjectId, chunk_id: u32) -> FsResult<usize> {
        if let Some(idx) = self.cache.find(obj_id, chunk_id) {
            return Ok(idx);
        }
        let idx = self
            .cache
            .grab()
            .ok_or_else(|| FsError::Fatal("all cache slots locked".into()))?;
        if self.cache.slot(idx).dirty {
            self.flush_cache_slot(idx)?;
        }
        let mut buf = vec![0u8; self.payload_bytes];
        let n = self.read_data_chunk(obj_id, chunk_id, &mut buf)?;
        self.cache.bind(idx, obj_id, chunk_id);
        let slot = self.cache.slot_mut(idx);
        slot.data.copy_from_slice(&buf);
        slot.n_bytes = n;
        Ok(idx)
    }

    fn flush_cache_slot(&mut self, idx: usize) -> FsResult<()> {
        let slot = self.cache.slot(idx);
        if slot.is_free() || !slot.dirty {
            return Ok(());
        }
        let obj_id = slot.object_id;
        let chunk_id = slot.chunk_id;
        let n_bytes = slot.n_bytes;
        let data = slot.data.clone();
        self.check_gc(false)?;
        self.write_data_chunk(obj_id, chunk_id, &data, n_bytes as u32, false)?;
        self.cache.slot_mut(idx).dirty = false;
        Ok(())
    }

    pub(crate) fn flush_file_cache(&mut self, obj_id: ObjectId, discard: bool) -> FsResult<()> {
        for idx in self.cache.slots_of_object(obj_id) {
            self.flush_cache_slot(idx)?;
            if discard {
                self.cache.slot_mut(idx).release();
            }
        }
        Ok(())
    }

    /// Iterate until no dirty slot remains.
    pub(crate) fn flush_whole_cache(&mut self, _keep_bindings: bool) -> FsResult<()> {
        while let Some(idx) = self.cache.oldest_dirty() {
            self.flush_cache_slot(idx)?;
        }
        Ok(())
    }

    pub fn read(
        &mut self,
        obj_id: ObjectId,
        offset: u64,
        len: usize,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        let obj_id = self.objects.equivalent(obj_id)?;
        self.require_file(obj_id)?;
        let file_size = self.objects.require(obj_id)?.file()?.file_size;
        if offset >= file_size || len == 0 {
            return Ok(0);
        }
        let len = len.min(buf.len());
        let end = (offset + len as u64).min(file_size);
        let payload = self.payload_bytes as u64;
        let mut done = 0u64;
        while offset + done < end {
            let pos = offset + done;
            let chunk_id = (pos / payload) as u32;
            let start = (pos % payload) as usize;
            let n = ((payload as usize - start) as u64).min(end - pos) as usize;
            let whole = start == 0 && n == payload as usize;
            if whole && self.cache.find(obj_id, chunk_id).is_none() {
                let out = &mut buf[done as usize..done as usize + n];
                self.read_data_chunk(obj_id, chunk_id, out)?;
            } else {
                let idx = self.cache_load(obj_id, chunk_id)?;
                let slot = self.cache.slot_mut(idx);
                slot.locked = true;
                buf[done as usize..done as usize + n]
                    .copy_from_slice(&slot.data[start..start + n]);
                slot.locked = false;
            }
            done += n as u64;
        }
        Ok(done as usize)
    }

    pub fn write(
        &mut self,
        obj_id: ObjectId,
        offset: u64,
        data: &[u8],
        writethrough: bool,
    ) -> FsResult<usize> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        let obj_id = self.objects.equivalent(obj_id)?;
        self.require_file(obj_id)?;
        if data.is_empty() {
            return Ok(0);
        }
        if offset + data.len() as u64 > self.max_file_size() {
            return Err(FsError::Range);
        }
        self.invalidate_checkpoint();
        self.check_gc(false)?;
        let payload = self.payload_bytes;
        let mut done = 0usize;
        while done < data.len() {
            // long writes give the collector a slice between chunks
            if done > 0 {
                self.check_gc(false)?;
            }
            let pos = offset + done as u64;
            let chunk_id = (pos / payload as u64) as u32;
            let start = (pos % payload as u64) as usize;
            let n = (payload - start).min(data.len() - done);
            let whole = start == 0 && n == payload;
            if whole && self.opts.cache_bypass_aligned && !self.opts.inband_tags {
                // invalidation is mandatory on a whole-chunk write
                self.cache.invalidate_chunk(obj_id, chunk_id);
                self.write_data_chunk(obj_id, chunk_id, &data[done..done + n], n as u32, false)?;
            } else {
                let idx = self.cache_load(obj_id, chunk_id)?;
                let slot = self.cache.slot_mut(idx);
                slot.locked = true;
                slot.data[start..start + n].copy_from_slice(&data[done..done + n]);
                slot.locked = false;
                slot.dirty = true;
                slot.n_bytes = slot.n_bytes.max(start + n);
                if writethrough {
                    self.flush_cache_slot(idx)?;
                }
            }
            done += n;
            let end_pos = pos + n as u64;
            let file = self.objects.require_mut(obj_id)?.file_mut()?;
            file.file_size = file.file_size.max(end_pos);
            file.stored_size = file.stored_size.max(end_pos);
        }
        let obj = self.objects.require_mut(obj_id)?;
        obj.mtime = now_secs();
        obj.dirty = true;
        Ok(done)
    }

    pub fn resize(&mut self, obj_id: ObjectId, new_size: u64) -> FsResult<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        let obj_id = self.objects.equivalent(obj_id)?;
        self.require_file(obj_id)?;
        if new_size > self.max_file_size() {
            return Err(FsError::Range);
        }
        let old_size = self.objects.require(obj_id)?.file()?.file_size;
        if new_size == old_size {
            return Ok(());
        }
        self.invalidate_checkpoint();
        self.check_gc(false)?;
        if new_size < old_size {
            self.flush_file_cache(obj_id, false)?;
            self.cache.invalidate_object(obj_id);
            let payload = self.payload_bytes as u64;
            let keep_chunks = ((new_size + payload - 1) / payload) as u32;
            let width = self.tnode_width;
            let mut beyond: Vec<u32> = Vec::new();
            self.objects.require(obj_id)?.file()?.tnodes.walk(width, &mut |logical, _| {
                if logical >= keep_chunks {
                    beyond.push(logical);
                }
            });
            for logical in beyond {
                self.delete_data_chunk(obj_id, logical)?;
            }
            // the clipped final chunk is rewritten at its shorter length
            let rem = (new_size % payload) as usize;
            if rem != 0 {
                let last = (new_size / payload) as u32;
                let mut buf = vec![0u8; self.payload_bytes];
                let n = self.read_data_chunk(obj_id, last, &mut buf)?;
                if n > rem {
                    buf[rem..].fill(0);
                    self.write_data_chunk(obj_id, last, &buf, rem as u32, false)?;
                }
            }
            let file = self.objects.require_mut(obj_id)?.file_mut()?;
            file.file_size = new_size;
            file.stored_size = file.stored_size.min(new_size);
            file.shrink_size = file.shrink_size.min(new_size);
            file.tnodes.prune();
            self.update_header(obj_id, true, NO_SHADOW, false)?;
        } else {
            let file = self.objects.require_mut(obj_id)?.file_mut()?;
            file.file_size = new_size;
            self.update_header(obj_id, false, NO_SHADOW, false)?;
        }
        let obj = self.objects.require_mut(obj_id)?;
        obj.mtime = now_secs();
        Ok(())
    }

    pub fn flush(
        &mut self,
        obj_id: ObjectId,
        update_time: bool,
        data_sync: bool,
        discard_cache: bool,
    ) -> FsResult<()> {
        let obj_id = self.objects.equivalent(obj_id)?;
        if self.objects.require(obj_id)?.file().is_ok() {
            self.flush_file_cache(obj_id, discard_cache)?;
        }
        if update_time {
            let obj = self.objects.require_mut(obj_id)?;
            obj.mtime = now_secs();
            obj.dirty = true;
        }
        let needs_header = self.objects.require(obj_id)?.dirty;
        if needs_header && !data_sync && !self.read_only && !self.objects.require(obj_id)?.is_pseudo()
        {
            self.update_header(obj_id, false, NO_SHADOW, false)?;
        }
        Ok(())
    }

    pub fn stat(&mut self, obj_id: ObjectId) -> FsResult<ObjectAttr> {
        let obj_id = self.objects.equivalent(obj_id)?;
        self.ensure_header_loaded(obj_id)?;
        self.objects.attr_of(obj_id)
    }

    /// Cursor-style directory iteration; None at end.
    pub fn readdir(&mut self, dir: ObjectId, cursor: usize) -> FsResult<Option<(String, ObjectId)>> {
        let dir = self.objects.equivalent(dir)?;
        let children = self.objects.require(dir)?.dir()?.children.clone();
        let Some(&id) = children.get(cursor) else {
            return Ok(None);
        };
        self.ensure_header_loaded(id)?;
        let name = self.objects.require(id)?.name.clone().unwrap_or_default();
        Ok(Some((name, id)))
    }

    pub fn readlink(&mut self, obj_id: ObjectId) -> FsResult<String> {
        self.ensure_header_loaded(obj_id)?;
        match &self.objects.require(obj_id)?.variant {
            ObjectVariant::Symlink { alias } => Ok(alias.clone()),
            _ => Err(FsError::BadHandle),
        }
    }

    /// Slash-separated path walk from the root, following symlinks when
    /// asked (bounded depth, for the library's own callers and the CLI; the
    /// full façade has its own path layer).
    pub fn resolve_path(&mut self, path: &str, follow: bool) -> FsResult<ObjectId> {
        self.resolve_path_from(OBJECTID_ROOT, path, follow, 0)
    }

    fn resolve_path_from(
        &mut self,
        start: ObjectId,
        path: &str,
        follow: bool,
        depth: usize,
    ) -> FsResult<ObjectId> {
        if depth > MAX_SYMLINK_DEPTH {
            return Err(FsError::Loop);
        }
        let mut cur = if path.starts_with('/') { OBJECTID_ROOT } else { start };
        let comps: Vec<&str> = path.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
        for (i, comp) in comps.iter().enumerate() {
            if *comp == ".." {
                let parent = self.objects.require(cur)?.parent;
                cur = if parent == 0 { OBJECTID_ROOT } else { parent };
                continue;
            }
            let next = self.lookup(cur, comp)?;
            let is_symlink = matches!(
                self.objects.require(next)?.variant,
                ObjectVariant::Symlink { .. }
            );
            if is_symlink && (follow || i + 1 < comps.len()) {
                let alias = self.readlink(next)?;
                cur = self.resolve_path_from(cur, &alias, true, depth + 1)?;
            } else {
                cur = next;
            }
        }
        Ok(cur)
    }

    /// fsck-style sweep over the structural invariants; returns the list of
    /// violations (empty on a healthy volume).
    pub fn check_consistency(&mut self) -> Vec<String> {
        let mut problems = Vec::new();
        let cpb = self.chunks_per_block as i64;
        let mut live = 0i64;
        let mut ckpt = 0i64;
        let mut dead = 0i64;
        let mut allocating = 0usize;
        for block in 0..self.n_blocks {
            let info = self.blocks.get_block_info(block);
            match info.state {
                BlockState::Dead => dead += cpb,
                BlockState::Checkpoint => ckpt += cpb,
                _ => live += (info.pages_in_use - info.soft_del_pages) as i64,
            }
            if info.state == BlockState::Allocating {
                allocating += 1;
                if Some(block) != self.alloc_block {
                    problems.push(format!("block {} allocating but not the allocator's", block));
                }
            }
            if info.state == BlockState::Full && info.seq_number > self.seq_number {
                problems.push(format!(
                    "full block {} seq {} beyond device seq {}",
                    block, info.seq_number, self.seq_number
                ));
            }
        }
        if allocating > 1 {
            problems.push(format!("{} blocks allocating at once", allocating));
        }
        let total = self.total_chunks() as i64;
        if live + self.n_free_chunks + ckpt + dead != total {
            problems.push(format!(
                "chunk accounting off: live {} + free {} + checkpoint {} + dead {} != {}",
                live, self.n_free_chunks, ckpt, dead, total
            ));
        }
        let width = self.tnode_width;
        for id in self.objects.ids() {
            let Some(obj) = self.objects.get(id) else { continue };
            if obj.soft_del {
                continue;
            }
            if let Ok(file) = obj.file() {
                let counted = file.tnodes.count_nonzero(width);
                if counted != file.n_data_chunks {
                    problems.push(format!(
                        "object {}: {} tree entries vs {} recorded data chunks",
                        id, counted, file.n_data_chunks
                    ));
                }
                let mut slots: Vec<(u32, u32)> = Vec::new();
                file.tnodes.walk(width, &mut |logical, value| slots.push((logical, value)));
                for (logical, value) in slots {
                    match self.find_chunk_in_group(value, id, logical + 1) {
                        Ok(Some(_)) => {}
                        _ => problems.push(format!(
                            "object {} chunk {} does not resolve on flash",
                            id, logical
                        )),
                    }
                }
            }
            let Some(obj) = self.objects.get(id) else { continue };
            if !obj.is_pseudo() && !obj.deleted && !obj.unlinked {
                if self.objects.depth_to_root(id).is_none() {
                    problems.push(format!("object {} does not reach the root", id));
                }
            }
            if matches!(obj.variant, ObjectVariant::Hardlink { .. }) {
                match self.objects.equivalent(id) {
                    Ok(target) => {
                        let t = self.objects.get(target).map(|o| o.obj_type());
                        if !matches!(t, Some(ObjectType::File) | Some(ObjectType::Directory)) {
                            problems.push(format!("hard link {} target has bad type", id));
                        }
                    }
                    Err(_) => problems.push(format!("hard link {} is part of a chain", id)),
                }
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lffs_lib::test_support::*;
    use crate::lffs_lib::types::LffsOptions;
    use nand_driver::RamNandDriver;

    fn remount(dev: Lffs<RamNandDriver>) -> Lffs<RamNandDriver> {
        let media = dev.driver.media().clone();
        let opts = dev.opts.clone();
        let mut fresh = Lffs::new(RamNandDriver::from_media(media), opts).unwrap();
        fresh.mount(&unique_name("remount")).unwrap();
        fresh
    }

    fn mkfile(dev: &mut Lffs<RamNandDriver>, parent: ObjectId, name: &str) -> ObjectId {
        dev.create(parent, name, ObjectType::File, 0o644, 0, 0, Default::default())
            .unwrap()
    }

    #[test]
    fn s1_create_write_read() {
        let mut dev = small_device();
        let file = mkfile(&mut dev, OBJECTID_ROOT, "a");
        let data = vec![0x41u8; 1500];
        assert_eq!(dev.write(file, 0, &data, false).unwrap(), 1500);
        let mut back = vec![0u8; 1500];
        assert_eq!(dev.read(file, 0, 1500, &mut back).unwrap(), 1500);
        assert_eq!(back, data);
        let attr = dev.stat(file).unwrap();
        assert_eq!(attr.size, 1500);
        dev.flush(file, false, false, false).unwrap();
        // 1500 bytes over 512-byte chunks: exactly 3 data chunks
        assert_eq!(dev.objects.require(file).unwrap().file().unwrap().n_data_chunks, 3);
        assert!(dev.check_consistency().is_empty());
    }

    #[test]
    fn s2_partial_overwrite() {
        let mut dev = small_device();
        let file = mkfile(&mut dev, OBJECTID_ROOT, "a");
        dev.write(file, 0, &vec![0x41u8; 1500], false).unwrap();
        assert_eq!(dev.write(file, 200, &vec![0xFFu8; 100], false).unwrap(), 100);
        let mut back = vec![0u8; 1500];
        dev.read(file, 0, 1500, &mut back).unwrap();
        assert!(back[..200].iter().all(|b| *b == 0x41));
        assert!(back[200..300].iter().all(|b| *b == 0xFF));
        assert!(back[300..].iter().all(|b| *b == 0x41));
        assert_eq!(dev.stat(file).unwrap().size, 1500);
    }

    #[test]
    fn s3_many_files_survive_power_loss() {
        let mut dev = device_with(64, 32, 512, LffsOptions::default());
        for i in 0..300 {
            let name = format!("f{:03}", i);
            let file = mkfile(&mut dev, OBJECTID_ROOT, &name);
            dev.write(file, 0, &[i as u8], false).unwrap();
        }
        for i in (0..300).step_by(2) {
            dev.unlink(OBJECTID_ROOT, &format!("f{:03}", i)).unwrap();
        }
        dev.sync(true).unwrap();

        let mut fresh = remount(dev);
        let mut found = Vec::new();
        let mut cursor = 0;
        while let Some((name, id)) = fresh.readdir(OBJECTID_ROOT, cursor).unwrap() {
            cursor += 1;
            if fresh.stat(id).unwrap().obj_type == ObjectType::File {
                found.push(name);
            }
        }
        assert_eq!(found.len(), 150);
        for name in &found {
            let n: usize = name[1..].parse().unwrap();
            assert_eq!(n % 2, 1, "file {} should have been unlinked", name);
            let id = fresh.lookup(OBJECTID_ROOT, name).unwrap();
            assert_eq!(fresh.stat(id).unwrap().size, 1);
            let mut b = [0u8; 4];
            assert_eq!(fresh.read(id, 0, 4, &mut b).unwrap(), 1);
            assert_eq!(b[0], n as u8);
        }
    }

    #[test]
    fn s4_truncate_then_refill_runs_gc() {
        let mut dev = small_device();
        let file = mkfile(&mut dev, OBJECTID_ROOT, "big");
        let payload = dev.chunk_bytes();
        // push free space down toward the reserve
        let mut n = 0u64;
        loop {
            if !dev.check_alloc_available(8) {
                break;
            }
            dev.write(file, n * payload as u64, &vec![0x5A; payload], false).unwrap();
            n += 1;
        }
        assert!(n > 0);
        dev.flush(file, false, false, false).unwrap();
        dev.resize(file, 0).unwrap();
        assert_eq!(dev.stat(file).unwrap().size, 0);
        // the same amount fits again
        for i in 0..n {
            dev.write(file, i * payload as u64, &vec![0xA5; payload], false).unwrap();
        }
        dev.flush(file, false, false, false).unwrap();
        assert!(dev.stats.n_gcs >= 1, "GC was never invoked");
        let mut back = vec![0u8; payload];
        dev.read(file, 0, payload, &mut back).unwrap();
        assert!(back.iter().all(|b| *b == 0xA5));
    }

    #[test]
    fn s5_hardlink_promotion() {
        let mut dev = small_device();
        let x = mkfile(&mut dev, OBJECTID_ROOT, "x");
        dev.write(x, 0, b"0123456789", false).unwrap();
        dev.flush(x, false, false, false).unwrap();
        dev.create(
            OBJECTID_ROOT,
            "y",
            ObjectType::Hardlink,
            0o644,
            0,
            0,
            CreateExtra {
                equiv: Some(x),
                ..Default::default()
            },
        )
        .unwrap();
        dev.unlink(OBJECTID_ROOT, "x").unwrap();
        assert!(matches!(dev.lookup(OBJECTID_ROOT, "x"), Err(FsError::NotFound)));
        let y = dev.lookup(OBJECTID_ROOT, "y").unwrap();
        let attr = dev.stat(y).unwrap();
        assert_eq!(attr.obj_type, ObjectType::File);
        assert_eq!(attr.size, 10);
        let mut back = vec![0u8; 10];
        dev.read(y, 0, 10, &mut back).unwrap();
        assert_eq!(&back, b"0123456789");
    }

    #[test]
    fn s6_symlink_loop_detected() {
        let mut dev = small_device();
        dev.create(
            OBJECTID_ROOT,
            "s",
            ObjectType::Symlink,
            0o777,
            0,
            0,
            CreateExtra {
                alias: Some("/s".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(matches!(dev.resolve_path("/s", true), Err(FsError::Loop)));
        // not following is fine
        assert!(dev.resolve_path("/s", false).is_ok());
    }

    #[test]
    fn zero_write_and_eof_read_are_noops() {
        let mut dev = small_device();
        let file = mkfile(&mut dev, OBJECTID_ROOT, "f");
        assert_eq!(dev.write(file, 0, &[], false).unwrap(), 0);
        dev.write(file, 0, b"abc", false).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(dev.read(file, 100, 8, &mut buf).unwrap(), 0);
        let writes_before = dev.stats.n_page_writes;
        dev.resize(file, 3).unwrap();
        assert_eq!(dev.stats.n_page_writes, writes_before, "resize to same size wrote");
    }

    #[test]
    fn exact_chunk_multiple_has_no_padding_chunk() {
        let mut dev = small_device();
        let file = mkfile(&mut dev, OBJECTID_ROOT, "aligned");
        let payload = dev.chunk_bytes();
        dev.write(file, 0, &vec![7u8; payload * 4], false).unwrap();
        dev.flush(file, false, false, false).unwrap();
        while dev.gc_once(true).unwrap() {}
        let f = dev.objects.require(file).unwrap().file().unwrap();
        assert_eq!(f.n_data_chunks, 4);
        assert_eq!(f.file_size, payload as u64 * 4);
    }

    #[test]
    fn rename_moves_and_overwrites() {
        let mut dev = small_device();
        let sub = dev
            .create(OBJECTID_ROOT, "d", ObjectType::Directory, 0o755, 0, 0, Default::default())
            .unwrap();
        let a = mkfile(&mut dev, OBJECTID_ROOT, "a");
        dev.write(a, 0, b"payload", false).unwrap();
        let b = mkfile(&mut dev, sub, "b");
        dev.write(b, 0, b"old", false).unwrap();
        dev.flush(a, false, false, false).unwrap();
        dev.flush(b, false, false, false).unwrap();
        dev.rename(OBJECTID_ROOT, "a", sub, "b").unwrap();
        assert!(matches!(dev.lookup(OBJECTID_ROOT, "a"), Err(FsError::NotFound)));
        let moved = dev.lookup(sub, "b").unwrap();
        assert_eq!(moved, a);
        let mut back = vec![0u8; 7];
        dev.read(moved, 0, 7, &mut back).unwrap();
        assert_eq!(&back, b"payload");
        assert!(dev.check_consistency().is_empty());
    }

    #[test]
    fn rename_into_own_subtree_fails() {
        let mut dev = small_device();
        let d1 = dev
            .create(OBJECTID_ROOT, "d1", ObjectType::Directory, 0o755, 0, 0, Default::default())
            .unwrap();
        let d2 = dev
            .create(d1, "d2", ObjectType::Directory, 0o755, 0, 0, Default::default())
            .unwrap();
        assert!(dev.rename(OBJECTID_ROOT, "d1", d2, "inner").is_err());
    }

    #[test]
    fn unlink_nonempty_dir_fails() {
        let mut dev = small_device();
        let d = dev
            .create(OBJECTID_ROOT, "d", ObjectType::Directory, 0o755, 0, 0, Default::default())
            .unwrap();
        mkfile(&mut dev, d, "child");
        assert!(matches!(
            dev.unlink(OBJECTID_ROOT, "d"),
            Err(FsError::NotEmpty)
        ));
        dev.unlink(d, "child").unwrap();
        dev.unlink(OBJECTID_ROOT, "d").unwrap();
    }

    #[test]
    fn xattr_round_trip_and_errors() {
        let mut dev = small_device();
        let file = mkfile(&mut dev, OBJECTID_ROOT, "x");
        assert!(matches!(dev.getxattr(file, "user.k"), Err(FsError::NoData)));
        dev.setxattr(file, "user.k", b"v1").unwrap();
        assert_eq!(dev.getxattr(file, "user.k").unwrap(), b"v1");
        dev.setxattr(file, "user.k", b"v2").unwrap();
        assert_eq!(dev.getxattr(file, "user.k").unwrap(), b"v2");
        assert_eq!(dev.listxattr(file).unwrap(), vec!["user.k".to_string()]);
        dev.removexattr(file, "user.k").unwrap();
        assert!(matches!(dev.removexattr(file, "user.k"), Err(FsError::NoData)));
    }

    #[test]
    fn xattrs_survive_remount() {
        let mut dev = small_device();
        let file = mkfile(&mut dev, OBJECTID_ROOT, "x");
        dev.setxattr(file, "user.tag", b"sticky").unwrap();
        dev.sync(false).unwrap();
        let mut fresh = remount(dev);
        let found = fresh.lookup(OBJECTID_ROOT, "x").unwrap();
        assert_eq!(fresh.getxattr(found, "user.tag").unwrap(), b"sticky");
    }

    #[test]
    fn checkpoint_fast_mount_restores_state() {
        let mut dev = small_device();
        let file = mkfile(&mut dev, OBJECTID_ROOT, "ck");
        dev.write(file, 0, &vec![9u8; 700], false).unwrap();
        dev.sync(true).unwrap();
        let mut fast = remount(dev);
        assert!(fast.checkpoint_loaded, "checkpoint was not used");
        let id = fast.lookup(OBJECTID_ROOT, "ck").unwrap();
        assert_eq!(fast.stat(id).unwrap().size, 700);
        let mut back = vec![0u8; 700];
        assert_eq!(fast.read(id, 0, 700, &mut back).unwrap(), 700);
        assert!(back.iter().all(|b| *b == 9));
        // the first modification kills the snapshot; the next mount scans
        let f2 = fast
            .create(OBJECTID_ROOT, "later", ObjectType::File, 0o644, 0, 0, Default::default())
            .unwrap();
        assert!(!fast.checkpoint_loaded);
        fast.write(f2, 0, b"x", false).unwrap();
        fast.sync(false).unwrap();
        let mut scanned = remount(fast);
        assert!(!scanned.checkpoint_loaded);
        assert!(scanned.lookup(OBJECTID_ROOT, "later").is_ok());
        let ck = scanned.lookup(OBJECTID_ROOT, "ck").unwrap();
        assert_eq!(scanned.stat(ck).unwrap().size, 700);
    }

    #[test]
    fn mount_unmount_cycle() {
        let mut dev = small_device();
        let file = mkfile(&mut dev, OBJECTID_ROOT, "persist");
        dev.write(file, 0, b"data!", false).unwrap();
        dev.unmount().unwrap();
        assert!(matches!(dev.unmount(), Err(FsError::Busy)));
        let name = unique_name("again");
        dev.mount(&name).unwrap();
        let found = dev.lookup(OBJECTID_ROOT, "persist").unwrap();
        assert_eq!(dev.stat(found).unwrap().size, 5);
        let mut buf = [0u8; 5];
        dev.read(found, 0, 5, &mut buf).unwrap();
        assert_eq!(&buf, b"data!");
    }

    #[test]
    fn format_then_mount_is_empty_root() {
        let mut dev = small_device();
        // root has only lost+found
        let mut cursor = 0;
        let mut names = Vec::new();
        while let Some((name, _)) = dev.readdir(OBJECTID_ROOT, cursor).unwrap() {
            names.push(name);
            cursor += 1;
        }
        assert_eq!(names, vec!["lost+found".to_string()]);
        assert!(dev.check_consistency().is_empty());
    }

    #[test]
    fn case_insensitive_volume() {
        let mut dev = device_with(
            16,
            32,
            512,
            LffsOptions {
                case_insensitive: true,
                ..Default::default()
            },
        );
        mkfile(&mut dev, OBJECTID_ROOT, "MixedCase");
        assert!(dev.lookup(OBJECTID_ROOT, "mixedcase").is_ok());
        assert!(matches!(
            dev.create(OBJECTID_ROOT, "MIXEDCASE", ObjectType::File, 0o644, 0, 0, Default::default()),
            Err(FsError::Exists)
        ));
    }

    #[test]
    fn write_beyond_max_is_range() {
        let mut dev = small_device();
        let file = mkfile(&mut dev, OBJECTID_ROOT, "far");
        let max = dev.max_file_size();
        assert!(matches!(
            dev.write(file, max, b"x", false),
            Err(FsError::Range)
        ));
    }

    #[test]
    fn invariants_hold_through_churn() {
        let mut dev = small_device();
        let payload = dev.chunk_bytes();
        for round in 0..6u8 {
            let name = format!("churn{}", round);
            let f = mkfile(&mut dev, OBJECTID_ROOT, &name);
            dev.write(f, 0, &vec![round; payload * 2 + 37], false).unwrap();
            dev.flush(f, false, false, false).unwrap();
            if round % 2 == 0 {
                dev.unlink(OBJECTID_ROOT, &name).unwrap();
            }
            let problems = dev.check_consistency();
            assert!(problems.is_empty(), "round {}: {:?}", round, problems);
        }
        while dev.gc_once(true).unwrap() {}
        let problems = dev.check_consistency();
        assert!(problems.is_empty(), "after gc: {:?}", problems);
    }
}
