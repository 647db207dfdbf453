//! Fast-mount checkpoint: device counters, the block table, and every
//! object (with a flattened index tree) serialized into blocks labelled
//! Checkpoint. The stream is host-endian; it never outlives the device it
//! was written on, and any doubt at all falls back to the full scan.

use crate::lffs_lib::blocks::BlockTable;
use crate::lffs_lib::desc::*;
use crate::lffs_lib::objects::{Object, ObjectVariant};
use crate::lffs_lib::types::{FsError, FsResult, ObjectId};
use crate::lffs_lib::Lffs;
use log::*;
use nand_driver::NandDriver;
use zerocopy::AsBytes;

const CKPT_MAGIC: u32 = 0x4C46_4350;
const CKPT_VERSION: u32 = 1;
const CKPT_END_MAGIC: u32 = 0x454E_4421;

const OBJ_FLAG_SOFT_DEL: u8 = 0x01;
const OBJ_FLAG_DELETED: u8 = 0x02;
const OBJ_FLAG_UNLINKED: u8 = 0x04;

const BLK_FLAG_SHRINK: u8 = 0x01;
const BLK_FLAG_PRIORITISE: u8 = 0x02;
const BLK_FLAG_RETIRING: u8 = 0x04;

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> FsResult<u8> {
        let v = *self.buf.get(self.pos).ok_or(FsError::Io("short checkpoint".into()))?;
        self.pos += 1;
        Ok(v)
    }

    fn take(&mut self, n: usize) -> FsResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(FsError::Io("short checkpoint".into()));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u16(&mut self) -> FsResult<u16> {
        Ok(u16::from_ne_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> FsResult<u32> {
        Ok(u32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> FsResult<u64> {
        Ok(u64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }
}

fn stream_checksum(buf: &[u8]) -> u32 {
    buf.iter().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as u32))
}

impl<T: NandDriver> Lffs<T> {
    /// Pre-mount/allocation estimate of how many blocks a checkpoint takes;
    /// the reserve policy keeps this many erased on top of the caller
    /// reserve.
    pub(crate) fn calc_checkpt_blocks_required(&self) -> usize {
        let row_bytes = (self.chunks_per_block + 7) / 8;
        let live_chunks = (self.total_chunks() as i64
            - self.n_free_chunks
            - (self.checkpoint_blocks.len() * self.chunks_per_block) as i64)
            .max(0) as usize;
        let bytes = 32
            + self.n_blocks * 14
            + self.n_blocks * row_bytes
            + self.objects.len() * 64
            + live_chunks * 8
            + 8;
        let block_bytes = self.payload_bytes * self.chunks_per_block;
        bytes / block_bytes + 1
    }

    fn serialize_checkpoint(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.u32(CKPT_MAGIC);
        w.u32(CKPT_VERSION);
        w.u32(self.seq_number);
        w.u32(self.n_blocks as u32);
        w.u32(self.chunks_per_block as u32);
        for block in 0..self.n_blocks {
            let info = self.blocks.get_block_info(block);
            w.u8(info.state.into());
            let mut flags = 0u8;
            if info.has_shrink_hdr {
                flags |= BLK_FLAG_SHRINK;
            }
            if info.gc_prioritise {
                flags |= BLK_FLAG_PRIORITISE;
            }
            if info.needs_retiring {
                flags |= BLK_FLAG_RETIRING;
            }
            w.u8(flags);
            w.u32(info.seq_number);
            w.u32(info.pages_in_use);
            w.u32(info.soft_del_pages);
        }
        for block in 0..self.n_blocks {
            w.bytes(self.blocks.bitmap_row(block));
        }
        let real: Vec<&Object> = self.objects.iter().filter(|o| !o.is_pseudo()).collect();
        w.u32(real.len() as u32);
        for obj in real {
            w.u32(obj.id);
            w.u32(obj.parent);
            w.u32(obj.obj_type().into());
            w.u32(obj.hdr_chunk.unwrap_or(!0));
            w.u8(obj.serial);
            let mut flags = 0u8;
            if obj.soft_del {
                flags |= OBJ_FLAG_SOFT_DEL;
            }
            if obj.deleted {
                flags |= OBJ_FLAG_DELETED;
            }
            if obj.unlinked {
                flags |= OBJ_FLAG_UNLINKED;
            }
            w.u8(flags);
            w.u16(obj.name_checksum);
            match &obj.variant {
                ObjectVariant::File(f) => {
                    w.u64(f.file_size);
                    w.u64(f.stored_size);
                    w.u64(f.shrink_size);
                    w.u32(f.n_data_chunks);
                    let mut pairs: Vec<u32> = Vec::new();
                    f.tnodes.walk(self.tnode_width, &mut |chunk, value| {
                        pairs.push(chunk);
                        pairs.push(value);
                    });
                    w.u32((pairs.len() / 2) as u32);
                    w.bytes(pairs.as_bytes());
                }
                ObjectVariant::Hardlink { equiv_id } => w.u32(*equiv_id),
                _ => {}
            }
        }
        w.u32(CKPT_END_MAGIC);
        let sum = stream_checksum(&w.buf);
        w.u32(sum);
        w.buf
    }

    /// Write the snapshot into erased blocks. Failure leaves the volume
    /// scannable; the caller logs and moves on.
    pub(crate) fn write_checkpoint(&mut self) -> FsResult<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        if !self.checkpoint_blocks.is_empty() {
            // a valid checkpoint is already on flash
            return Ok(());
        }
        self.gc_disable = true;
        let result = self.write_checkpoint_inner();
        self.gc_disable = false;
        result
    }

    fn write_checkpoint_inner(&mut self) -> FsResult<()> {
        let stream = self.serialize_checkpoint();
        let payload = self.payload_bytes;
        let chunks_needed = (stream.len() + payload - 1) / payload;
        let blocks_needed = (chunks_needed + self.chunks_per_block - 1) / self.chunks_per_block;
        if self.n_erased_blocks < blocks_needed + 1 {
            return Err(FsError::NoSpace);
        }
        debug!(
            "checkpoint: {} bytes over {} chunks in {} blocks",
            stream.len(),
            chunks_needed,
            blocks_needed
        );
        let mut taken: Vec<usize> = Vec::new();
        for block in 0..self.n_blocks {
            if taken.len() == blocks_needed {
                break;
            }
            if self.blocks.get_block_info(block).state == BlockState::Empty {
                self.blocks.set_state(block, BlockState::Checkpoint);
                self.n_erased_blocks -= 1;
                self.n_free_chunks -= self.chunks_per_block as i64;
                taken.push(block);
            }
        }
        let mut stream_idx = 0u32;
        let mut written = 0usize;
        for &block in &taken {
            for offset in 0..self.chunks_per_block {
                if written >= stream.len() {
                    break;
                }
                let end = (written + payload).min(stream.len());
                let tags = ExtTags {
                    chunk_used: true,
                    obj_id: 0,
                    chunk_id: stream_idx + 1,
                    n_bytes: (end - written) as u32,
                    seq_number: SEQ_CHECKPOINT_DATA,
                    ..Default::default()
                };
                // the marker sequence number skips the allocator entirely
                let chunk = self.join_chunk(block, offset);
                let slice = stream[written..end].to_vec();
                if let Err(e) = self.write_chunk_raw(chunk, &slice, &tags) {
                    warn!("checkpoint chunk write failed: {:?}", e);
                    self.checkpoint_blocks = taken;
                    self.invalidate_checkpoint();
                    return Err(e);
                }
                written = end;
                stream_idx += 1;
            }
        }
        info!("checkpoint written into blocks {:?}", taken);
        self.checkpoint_blocks = taken;
        self.checkpoint_loaded = true;
        Ok(())
    }

    /// Try a checkpoint restore at mount; Ok(false) means "no valid
    /// checkpoint, do the scan".
    pub(crate) fn restore_from_checkpoint(&mut self) -> FsResult<bool> {
        let mut found: Vec<(u32, usize)> = Vec::new();
        for block in 0..self.n_blocks {
            if self.driver.check_bad(block).map_err(|e| FsError::Io(e.to_string()))? {
                continue;
            }
            let chunk = self.join_chunk(block, 0);
            if let Ok(Some((tags, _))) = self.read_chunk_raw(chunk, None) {
                if tags.seq_number == SEQ_CHECKPOINT_DATA {
                    found.push((tags.chunk_id, block));
                }
            }
        }
        if found.is_empty() {
            return Ok(false);
        }
        found.sort();
        let mut stream: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; self.payload_bytes];
        for &(_, block) in &found {
            for offset in 0..self.chunks_per_block {
                let chunk = self.join_chunk(block, offset);
                match self.read_chunk_raw(chunk, Some(&mut buf)) {
                    Ok(Some((tags, _))) if tags.seq_number == SEQ_CHECKPOINT_DATA => {
                        stream.extend_from_slice(&buf[..tags.n_bytes as usize]);
                    }
                    _ => break,
                }
            }
        }
        match self.apply_checkpoint(&stream) {
            Ok(()) => {
                self.checkpoint_blocks = found.iter().map(|(_, b)| *b).collect();
                // the snapshot predates its own placement: the blocks now
                // holding it are recorded Empty in the restored table
                for &(_, block) in &found {
                    self.blocks.set_state(block, BlockState::Checkpoint);
                }
                self.checkpoint_loaded = true;
                self.recompute_space();
                info!("restored from checkpoint: {} objects", self.objects.len());
                Ok(true)
            }
            Err(e) => {
                warn!("checkpoint invalid: {:?}", e);
                Ok(false)
            }
        }
    }

    fn apply_checkpoint(&mut self, stream: &[u8]) -> FsResult<()> {
        if stream.len() < 16 {
            return Err(FsError::Io("checkpoint too short".into()));
        }
        let mut r = Reader::new(stream);
        if r.u32()? != CKPT_MAGIC || r.u32()? != CKPT_VERSION {
            return Err(FsError::Io("bad checkpoint magic".into()));
        }
        let seq = r.u32()?;
        let n_blocks = r.u32()? as usize;
        let cpb = r.u32()? as usize;
        if n_blocks != self.n_blocks || cpb != self.chunks_per_block {
            return Err(FsError::Io("checkpoint geometry mismatch".into()));
        }
        let mut table = BlockTable::new(n_blocks, cpb);
        for block in 0..n_blocks {
            let state = BlockState::try_from(r.u8()?)
                .map_err(|_| FsError::Io("bad block state".into()))?;
            let flags = r.u8()?;
            let info = table.get_block_info_mut(block);
            // a block mid-allocation at checkpoint time is closed off
            info.state = if state == BlockState::Allocating { BlockState::Full } else { state };
            info.has_shrink_hdr = flags & BLK_FLAG_SHRINK != 0;
            info.gc_prioritise = flags & BLK_FLAG_PRIORITISE != 0;
            info.needs_retiring = flags & BLK_FLAG_RETIRING != 0;
            info.seq_number = r.u32()?;
            info.pages_in_use = r.u32()?;
            info.soft_del_pages = r.u32()?;
        }
        let row_bytes = (cpb + 7) / 8;
        for block in 0..n_blocks {
            let row = r.take(row_bytes)?;
            table.bitmap_row_mut(block).copy_from_slice(row);
        }
        let n_objects = r.u32()? as usize;
        let mut objects = crate::lffs_lib::objects::ObjectTable::new();
        let mut hardlinks: Vec<ObjectId> = Vec::new();
        for _ in 0..n_objects {
            let id = r.u32()?;
            let parent = r.u32()?;
            let obj_type = ObjectType::try_from(r.u32()?)
                .map_err(|_| FsError::Io("bad object type".into()))?;
            let hdr = r.u32()?;
            let serial = r.u8()?;
            let flags = r.u8()?;
            let name_checksum = r.u16()?;
            let mut obj = Object::new(id, obj_type);
            obj.parent = parent;
            obj.hdr_chunk = if hdr == !0 { None } else { Some(hdr) };
            obj.serial = serial;
            obj.soft_del = flags & OBJ_FLAG_SOFT_DEL != 0;
            obj.deleted = flags & OBJ_FLAG_DELETED != 0;
            obj.unlinked = flags & OBJ_FLAG_UNLINKED != 0;
            obj.name_checksum = name_checksum;
            obj.lazy_name = true;
            match &mut obj.variant {
                ObjectVariant::File(f) => {
                    f.file_size = r.u64()?;
                    f.stored_size = r.u64()?;
                    f.shrink_size = r.u64()?;
                    f.n_data_chunks = r.u32()?;
                    let n_pairs = r.u32()? as usize;
                    for _ in 0..n_pairs {
                        let chunk = r.u32()?;
                        let value = r.u32()?;
                        f.tnodes.put(chunk, value, self.tnode_width);
                    }
                }
                ObjectVariant::Hardlink { equiv_id } => {
                    *equiv_id = r.u32()?;
                    hardlinks.push(id);
                }
                _ => {}
            }
            objects.insert(obj);
        }
        if r.u32()? != CKPT_END_MAGIC {
            return Err(FsError::Io("bad checkpoint end".into()));
        }
        let sum = r.u32()?;
        if sum != stream_checksum(&stream[..r.pos - 4]) {
            return Err(FsError::Io("checkpoint checksum mismatch".into()));
        }
        // commit
        self.blocks = table;
        self.seq_number = seq.max(SEQ_NUMBER_START);
        self.alloc_block = None;
        self.alloc_page = 0;
        // rebuild the namespace links
        let ids = objects.ids();
        for id in ids {
            let parent = objects.get(id).map(|o| o.parent).unwrap_or(0);
            if parent == 0 {
                continue;
            }
            if objects.get(parent).map(|p| p.dir().is_ok()).unwrap_or(false) {
                objects.add_child(parent, id)?;
            } else if !objects.get(id).map(|o| o.is_pseudo()).unwrap_or(true) {
                objects.add_child(OBJECTID_LOST_N_FOUND, id)?;
            }
        }
        self.objects = objects;
        for link in hardlinks {
            if self.objects.register_hardlink(link).is_err() {
                warn!("checkpoint hard link {} has no target, dropping", link);
                self.objects.remove(link);
            }
        }
        Ok(())
    }

    /// Rebuild the free/erased counters from the block table.
    pub(crate) fn recompute_space(&mut self) {
        let mut free = 0i64;
        let mut erased = 0usize;
        for block in 0..self.n_blocks {
            let info = self.blocks.get_block_info(block);
            match info.state {
                BlockState::Empty => {
                    free += self.chunks_per_block as i64;
                    erased += 1;
                }
                BlockState::Dead | BlockState::Checkpoint => {}
                _ => {
                    free += self.chunks_per_block as i64
                        - (info.pages_in_use - info.soft_del_pages) as i64;
                }
            }
        }
        self.n_free_chunks = free;
        self.n_erased_blocks = erased;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable() {
        let a = stream_checksum(b"hello");
        let b = stream_checksum(b"hello");
        let c = stream_checksum(b"hellp");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
