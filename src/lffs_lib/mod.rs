/// Log-structured flash filesystem core.
use anyhow::Result as AnyResult;
use log::*;
use nand_driver::{EccResult, NandDriver};

pub mod alloc;
pub mod blocks;
pub mod cache;
pub mod checkpoint;
pub mod desc;
pub mod fs;
pub mod gc;
pub mod objects;
pub mod scan;
pub mod tnodes;
pub mod types;
pub mod utils;
pub mod xattr;

use blocks::BlockTable;
use cache::CacheSet;
use desc::*;
use objects::*;
use types::*;
use utils::now_secs;

pub use desc::{BlockState, ObjectType};
pub use objects::{DirVariant, FileVariant, Object, ObjectAttr, ObjectVariant};
pub use types::{Endianness, FlashVersion, FsError, FsResult, LffsOptions, ObjectId, PhysChunk};

#[derive(Debug, Default)]
pub struct DeviceStats {
    pub n_page_writes: u64,
    pub n_page_reads: u64,
    pub n_erasures: u64,
    pub n_gcs: u64,
    pub n_gc_copies: u64,
    pub n_retired_blocks: u32,
    pub n_ecc_fixed: u32,
    pub n_ecc_unfixed: u32,
    pub n_erase_failures: u32,
    pub n_write_failures: u32,
    pub n_unmanaged_buffers: u32,
}

/// Small pool of chunk-sized scratch buffers. A borrower takes one for the
/// span of an operation and must hand it back on every exit path; when the
/// pool runs dry a one-shot heap buffer is handed out and counted.
pub(crate) struct TempBuffers {
    bufs: Vec<Option<Vec<u8>>>,
}

pub(crate) const N_TEMP_BUFFERS: usize = 6;

impl TempBuffers {
    fn new(chunk_bytes: usize) -> Self {
        Self {
            bufs: (0..N_TEMP_BUFFERS).map(|_| Some(vec![0u8; chunk_bytes])).collect(),
        }
    }

    fn get(&mut self, stats: &mut DeviceStats, chunk_bytes: usize) -> Vec<u8> {
        for slot in &mut self.bufs {
            if let Some(mut buf) = slot.take() {
                buf.fill(0xFF);
                return buf;
            }
        }
        stats.n_unmanaged_buffers += 1;
        vec![0xFF; chunk_bytes]
    }

    fn put(&mut self, buf: Vec<u8>) {
        for slot in &mut self.bufs {
            if slot.is_none() {
                *slot = Some(buf);
                return;
            }
        }
        // unmanaged buffer, just drop it
    }
}

pub struct Lffs<T: NandDriver> {
    pub driver: T,
    pub opts: LffsOptions,
    pub stats: DeviceStats,

    pub(crate) mounted: bool,
    pub(crate) read_only: bool,
    pub(crate) device_name: String,

    // geometry derived at construction
    pub(crate) n_blocks: usize,
    pub(crate) chunks_per_block: usize,
    /// Usable payload per chunk (raw size minus inband tags).
    pub(crate) payload_bytes: usize,
    pub(crate) chunk_grp_bits: u32,
    pub(crate) chunk_grp_size: u32,
    pub(crate) tnode_width: u32,

    pub blocks: BlockTable,
    pub objects: ObjectTable,
    pub(crate) cache: CacheSet,

    // allocator state
    pub(crate) seq_number: u32,
    pub(crate) alloc_block: Option<usize>,
    pub(crate) alloc_page: usize,
    pub(crate) alloc_finder: usize,
    pub(crate) n_erased_blocks: usize,
    pub(crate) n_free_chunks: i64,

    // checkpoint state
    pub(crate) checkpoint_blocks: Vec<usize>,
    pub(crate) checkpoint_loaded: bool,

    // gc state
    pub(crate) gc_block: Option<usize>,
    pub(crate) gc_chunk: usize,
    pub(crate) gc_finder: usize,
    pub(crate) gc_not_done: u32,
    pub(crate) gc_cleanup: Vec<ObjectId>,
    pub(crate) gc_disable: bool,
    pub(crate) gc_running: bool,

    pub(crate) dirty_dirs: Vec<ObjectId>,
    pub(crate) during_scan: bool,

    temp: TempBuffers,
}

impl<T: NandDriver> Lffs<T> {
    pub fn new(driver: T, opts: LffsOptions) -> FsResult<Self> {
        let geom = driver.geometry().clone();
        let n_blocks = geom.n_blocks;
        let chunks_per_block = geom.chunks_per_block;
        if n_blocks < 4 || chunks_per_block < 2 || !chunks_per_block.is_power_of_two() {
            return Err(FsError::Range);
        }
        let payload_bytes = if opts.inband_tags {
            geom.data_bytes_per_chunk.saturating_sub(PACKED_TAGS_BYTES)
        } else {
            if geom.spare_bytes_per_chunk < PACKED_TAGS_BYTES {
                return Err(FsError::Range);
            }
            geom.data_bytes_per_chunk
        };
        if payload_bytes < HEADER_BYTES {
            return Err(FsError::Range);
        }
        let total_chunks = (n_blocks * chunks_per_block) as u32;
        let tnode_width = opts.tnode_width.clamp(16, 32);
        let mut chunk_grp_bits = 0u32;
        while tnode_width < 32 && ((total_chunks - 1) >> chunk_grp_bits) + 1 > (1u32 << tnode_width) - 1
        {
            chunk_grp_bits += 1;
        }
        info!(
            "lffs: {} blocks x {} chunks x {}B, tnode width {} group bits {}",
            n_blocks, chunks_per_block, payload_bytes, tnode_width, chunk_grp_bits
        );
        Ok(Self {
            driver,
            stats: DeviceStats::default(),
            mounted: false,
            read_only: false,
            device_name: String::new(),
            n_blocks,
            chunks_per_block,
            payload_bytes,
            chunk_grp_bits,
            chunk_grp_size: 1 << chunk_grp_bits,
            tnode_width,
            blocks: BlockTable::new(n_blocks, chunks_per_block),
            objects: ObjectTable::new(),
            cache: CacheSet::new(opts.n_caches.max(1), payload_bytes),
            seq_number: SEQ_NUMBER_START,
            alloc_block: None,
            alloc_page: 0,
            alloc_finder: 0,
            n_erased_blocks: 0,
            n_free_chunks: 0,
            checkpoint_blocks: Vec::new(),
            checkpoint_loaded: false,
            gc_block: None,
            gc_chunk: 0,
            gc_finder: 0,
            gc_not_done: 0,
            gc_cleanup: Vec::new(),
            gc_disable: false,
            gc_running: false,
            dirty_dirs: Vec::new(),
            during_scan: false,
            temp: TempBuffers::new(geom.data_bytes_per_chunk),
            opts,
        })
    }

    /*
     * Geometry helpers.
     */

    pub fn chunk_bytes(self: &Self) -> usize {
        self.payload_bytes
    }

    pub fn total_chunks(self: &Self) -> usize {
        self.n_blocks * self.chunks_per_block
    }

    pub fn is_mounted(self: &Self) -> bool {
        self.mounted
    }

    pub(crate) fn split_chunk(self: &Self, chunk: PhysChunk) -> (usize, usize) {
        let block = chunk as usize / self.chunks_per_block;
        (block, chunk as usize % self.chunks_per_block)
    }

    pub(crate) fn join_chunk(self: &Self, block: usize, offset: usize) -> PhysChunk {
        (block * self.chunks_per_block + offset) as PhysChunk
    }

    /// Leaf-slot encoding of a physical chunk: group base + 1 so 0 can mean
    /// "no chunk".
    pub(crate) fn tnode_value(self: &Self, chunk: PhysChunk) -> u32 {
        (chunk >> self.chunk_grp_bits) + 1
    }

    pub(crate) fn temp_buffer(&mut self) -> Vec<u8> {
        let raw = self.driver.geometry().data_bytes_per_chunk;
        self.temp.get(&mut self.stats, raw)
    }

    pub(crate) fn release_buffer(&mut self, buf: Vec<u8>) {
        self.temp.put(buf);
    }

    /*
     * Raw chunk I/O with tag marshalling. The inband strategy packs the tags
     * into the tail of the data area; OOB puts them through the spare area.
     */

    pub(crate) fn write_chunk_raw(
        &mut self,
        chunk: PhysChunk,
        data: &[u8],
        tags: &ExtTags,
    ) -> FsResult<()> {
        let (block, offset) = self.split_chunk(chunk);
        let raw_bytes = self.driver.geometry().data_bytes_per_chunk;
        let mut buf = self.temp_buffer();
        buf[..raw_bytes].fill(0xFF);
        buf[..data.len().min(self.payload_bytes)]
            .copy_from_slice(&data[..data.len().min(self.payload_bytes)]);
        let res = if self.opts.inband_tags {
            tags.pack(&mut buf[raw_bytes - PACKED_TAGS_BYTES..raw_bytes], self.opts.endian);
            self.driver.write_chunk(block, offset, Some(&buf[..raw_bytes]), None)
        } else {
            let mut spare = [0xFFu8; PACKED_TAGS_BYTES];
            tags.pack(&mut spare, self.opts.endian);
            self.driver
                .write_chunk(block, offset, Some(&buf[..raw_bytes]), Some(&spare))
        };
        self.stats.n_page_writes += 1;
        let verify = match res {
            Ok(()) if self.opts.verify_writes => self.verify_chunk(chunk, &buf[..raw_bytes]),
            Ok(()) => Ok(()),
            Err(e) => Err(FsError::Io(format!("chunk write failed: {}", e))),
        };
        self.release_buffer(buf);
        verify
    }

    fn verify_chunk(&mut self, chunk: PhysChunk, expect: &[u8]) -> FsResult<()> {
        let (block, offset) = self.split_chunk(chunk);
        let mut back = self.temp_buffer();
        let res = self
            .driver
            .read_chunk(block, offset, Some(&mut back[..expect.len()]), None);
        self.stats.n_page_reads += 1;
        let ok = matches!(res, Ok(ecc) if ecc.data_valid()) && &back[..expect.len()] == expect;
        self.release_buffer(back);
        if ok {
            Ok(())
        } else {
            Err(FsError::Io(format!("write verify mismatch at chunk {}", chunk)))
        }
    }

    /// Read a chunk's tags and optionally its payload. Returns None when the
    /// chunk is still erased. ECC outcomes feed the retire policy.
    pub(crate) fn read_chunk_raw(
        &mut self,
        chunk: PhysChunk,
        mut data: Option<&mut [u8]>,
    ) -> FsResult<Option<(ExtTags, EccResult)>> {
        let (block, offset) = self.split_chunk(chunk);
        let raw_bytes = self.driver.geometry().data_bytes_per_chunk;
        let inband = self.opts.inband_tags;
        let mut buf = self.temp_buffer();
        let mut spare = [0u8; PACKED_TAGS_BYTES];
        let want_data = data.is_some() || inband;
        let res = self.driver.read_chunk(
            block,
            offset,
            if want_data { Some(&mut buf[..raw_bytes]) } else { None },
            if inband { None } else { Some(&mut spare) },
        );
        self.stats.n_page_reads += 1;
        let ecc = match res {
            Ok(ecc) => ecc,
            Err(e) => {
                self.release_buffer(buf);
                return Err(FsError::Io(format!("chunk read failed: {}", e)));
            }
        };
        self.note_ecc(block, ecc);
        let tag_area: &[u8] = if inband {
            &buf[raw_bytes - PACKED_TAGS_BYTES..raw_bytes]
        } else {
            &spare
        };
        let tags = ExtTags::unpack(tag_area, self.opts.endian);
        if let Some(out) = data.as_deref_mut() {
            let n = out.len().min(self.payload_bytes);
            out[..n].copy_from_slice(&buf[..n]);
        }
        self.release_buffer(buf);
        match tags {
            Ok(Some(t)) => Ok(Some((t, ecc))),
            Ok(None) => Ok(None),
            // written but corrupt tag area: report as used-but-unreadable
            Err(_) if ecc == EccResult::Unfixed => Ok(Some((ExtTags::default(), ecc))),
            Err(e) => Err(e),
        }
    }

    fn note_ecc(&mut self, block: usize, ecc: EccResult) {
        match ecc {
            EccResult::NoError => {}
            EccResult::Fixed => self.stats.n_ecc_fixed += 1,
            EccResult::FixedSuspect => {
                self.stats.n_ecc_fixed += 1;
                self.blocks.get_block_info_mut(block).gc_prioritise = true;
            }
            EccResult::Unfixed => {
                self.stats.n_ecc_unfixed += 1;
                let info = self.blocks.get_block_info_mut(block);
                info.gc_prioritise = true;
                info.chunk_error_strikes = info.chunk_error_strikes.saturating_add(1);
                if info.chunk_error_strikes >= BLOCK_STRIKES_MAX {
                    info.needs_retiring = true;
                }
            }
        }
    }

    /*
     * Logged writes: allocate, program, verify, retry on a fresh chunk when
     * the device misbehaves. The failed block is flagged for retirement and
     * closed off so no partial block straddles a bad programming event.
     */

    pub(crate) fn write_new_chunk(
        &mut self,
        data: &[u8],
        tags: &mut ExtTags,
        use_reserve: bool,
    ) -> FsResult<PhysChunk> {
        let attempts = match self.opts.wr_attempts {
            0 => WR_ATTEMPTS_CAP,
            n => n.min(WR_ATTEMPTS_CAP),
        };
        for attempt in 0..attempts {
            let chunk = self.alloc_chunk(use_reserve)?;
            let (block, _) = self.split_chunk(chunk);
            tags.seq_number = self.blocks.get_block_info(block).seq_number;
            match self.write_chunk_raw(chunk, data, tags) {
                Ok(()) => return Ok(chunk),
                Err(e) => {
                    self.stats.n_write_failures += 1;
                    warn!(
                        "write attempt {} failed at chunk {}: {}, retrying on a new chunk",
                        attempt, chunk, e
                    );
                    self.handle_write_failure(chunk);
                }
            }
        }
        Err(FsError::Io("write retries exhausted".into()))
    }

    fn handle_write_failure(&mut self, chunk: PhysChunk) {
        let (block, _) = self.split_chunk(chunk);
        self.blocks.get_block_info_mut(block).needs_retiring = true;
        // drop the failed chunk and close the block off
        self.chunk_del(chunk, false);
        self.skip_rest_of_block();
    }

    /*
     * Chunk deletion and the block lifecycle around it.
     */

    /// Hard-delete a chunk: it no longer holds the live copy of anything.
    /// With v1 layout the deletion marker is also programmed into the tags.
    pub(crate) fn chunk_del(&mut self, chunk: PhysChunk, mark_flash: bool) {
        let (block, offset) = self.split_chunk(chunk);
        if mark_flash && self.opts.version == FlashVersion::V1 && !self.during_scan {
            let marker = ExtTags::deletion_marker();
            let res = if self.opts.inband_tags {
                // inband marker rides at the tag offset inside the data area
                let raw = self.driver.geometry().data_bytes_per_chunk;
                let mut buf = self.temp_buffer();
                buf[..raw].fill(0xFF);
                buf[raw - PACKED_TAGS_BYTES..raw].copy_from_slice(&marker);
                let r = self.driver.write_chunk(block, offset, Some(&buf[..raw]), None);
                self.release_buffer(buf);
                r
            } else {
                self.driver.write_chunk(block, offset, None, Some(&marker))
            };
            if let Err(e) = res {
                warn!("deletion marker write failed at chunk {}: {}", chunk, e);
            }
        }
        if self.blocks.check_chunk_bit(block, offset) {
            self.blocks.clear_chunk_bit(block, offset);
            let info = self.blocks.get_block_info_mut(block);
            info.pages_in_use = info.pages_in_use.saturating_sub(1);
            self.n_free_chunks += 1;
        }
        let info = self.blocks.get_block_info(block);
        if info.pages_in_use == 0
            && matches!(info.state, BlockState::Full | BlockState::Dirty)
            && !self.during_scan
        {
            self.block_became_dirty(block);
        }
    }

    /// Release a file data chunk by accounting only; the tags stay on flash
    /// until GC relocates the block.
    pub(crate) fn soft_delete_chunk(&mut self, chunk: PhysChunk) {
        let (block, offset) = self.split_chunk(chunk);
        if !self.blocks.check_chunk_bit(block, offset) {
            return;
        }
        let info = self.blocks.get_block_info_mut(block);
        info.soft_del_pages += 1;
        self.n_free_chunks += 1;
    }

    pub(crate) fn block_became_dirty(&mut self, block: usize) {
        debug!("block {} became dirty", block);
        self.blocks.set_state(block, BlockState::Dirty);
        self.erase_and_recycle(block);
    }

    pub(crate) fn erase_and_recycle(&mut self, block: usize) {
        if self.blocks.get_block_info(block).needs_retiring {
            self.retire_block(block);
            return;
        }
        match self.driver.erase_block(block) {
            Ok(()) => {
                self.stats.n_erasures += 1;
                self.blocks.clear_chunk_bits(block);
                let info = self.blocks.get_block_info_mut(block);
                info.state = BlockState::Empty;
                info.seq_number = 0;
                info.pages_in_use = 0;
                info.soft_del_pages = 0;
                info.has_shrink_hdr = false;
                info.gc_prioritise = false;
                info.chunk_error_strikes = 0;
                self.n_erased_blocks += 1;
            }
            Err(e) => {
                error!("erase of block {} failed: {}", block, e);
                self.stats.n_erase_failures += 1;
                self.retire_block(block);
            }
        }
    }

    /// Take a block out of service permanently.
    pub(crate) fn retire_block(&mut self, block: usize) {
        let info = self.blocks.get_block_info(block);
        let live = info.pages_in_use.saturating_sub(info.soft_del_pages) as i64;
        let was_empty = info.state == BlockState::Empty;
        // everything not live in this block was counted free; it is gone now
        self.n_free_chunks -= self.chunks_per_block as i64 - live;
        if was_empty {
            self.n_erased_blocks = self.n_erased_blocks.saturating_sub(1);
        }
        if self.opts.version == FlashVersion::V2 {
            if let Err(e) = self.driver.mark_bad(block) {
                warn!("mark_bad({}) failed: {}", block, e);
            }
        }
        let info = self.blocks.get_block_info_mut(block);
        info.state = BlockState::Dead;
        info.needs_retiring = false;
        info.gc_prioritise = false;
        self.stats.n_retired_blocks += 1;
        warn!("block {} retired", block);
    }

    /*
     * Chunk-group resolution: a tnode slot names a group of adjacent
     * chunks; the bitmap (and, for groups > 1, the tags) pin down which one
     * actually holds the wanted (object, chunk).
     */

    pub(crate) fn find_chunk_in_group(
        &mut self,
        value: u32,
        obj_id: ObjectId,
        tag_chunk_id: u32,
    ) -> FsResult<Option<PhysChunk>> {
        if value == 0 {
            return Ok(None);
        }
        let base = (value - 1) << self.chunk_grp_bits;
        let end = (base + self.chunk_grp_size).min(self.total_chunks() as u32);
        for chunk in base..end {
            let (block, offset) = self.split_chunk(chunk);
            if !self.blocks.check_chunk_bit(block, offset) {
                continue;
            }
            if self.chunk_grp_size == 1 {
                return Ok(Some(chunk));
            }
            if let Some((tags, _)) = self.read_chunk_raw(chunk, None)? {
                if tags.obj_id == obj_id && tags.chunk_id == tag_chunk_id && !tags.is_deleted {
                    return Ok(Some(chunk));
                }
            }
        }
        Ok(None)
    }

    /// Physical chunk currently holding a file's logical chunk, if any.
    pub(crate) fn find_data_chunk(
        &mut self,
        obj_id: ObjectId,
        logical: u32,
    ) -> FsResult<Option<PhysChunk>> {
        let width = self.tnode_width;
        let value = self.objects.require(obj_id)?.file()?.tnodes.find(logical, width);
        self.find_chunk_in_group(value, obj_id, logical + 1)
    }

    /*
     * Data chunk write/read/delete against the index tree.
     */

    pub(crate) fn write_data_chunk(
        &mut self,
        obj_id: ObjectId,
        logical: u32,
        data: &[u8],
        n_bytes: u32,
        use_reserve: bool,
    ) -> FsResult<()> {
        let prev = self.find_data_chunk(obj_id, logical)?;
        let serial = match (self.opts.version, prev) {
            (FlashVersion::V1, Some(prev_chunk)) => match self.read_chunk_raw(prev_chunk, None)? {
                Some((tags, _)) => (tags.serial_number + 1) & 3,
                None => 0,
            },
            _ => 0,
        };
        let mut tags = ExtTags::new_data(obj_id, logical, n_bytes, serial);
        let new_chunk = self.write_new_chunk(data, &mut tags, use_reserve)?;
        let value = self.tnode_value(new_chunk);
        let width = self.tnode_width;
        let file = self.objects.require_mut(obj_id)?.file_mut()?;
        let old_slot = file.tnodes.put(logical, value, width);
        if prev.is_none() && old_slot == 0 {
            file.n_data_chunks += 1;
        }
        if let Some(prev_chunk) = prev {
            self.chunk_del(prev_chunk, true);
        }
        Ok(())
    }

    /// Read a logical chunk into `buf` (payload-sized). Returns the stored
    /// byte count; holes read as zeros with length 0.
    pub(crate) fn read_data_chunk(
        &mut self,
        obj_id: ObjectId,
        logical: u32,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        match self.find_data_chunk(obj_id, logical)? {
            None => {
                buf.fill(0);
                Ok(0)
            }
            Some(chunk) => match self.read_chunk_raw(chunk, Some(buf))? {
                Some((tags, ecc)) => {
                    if ecc == EccResult::Unfixed {
                        return Err(FsError::Io(format!("uncorrectable data at chunk {}", chunk)));
                    }
                    // a short chunk's tail is erased flash, not file data
                    let n = (tags.n_bytes as usize).min(buf.len());
                    buf[n..].fill(0);
                    Ok(n)
                }
                None => Err(FsError::Fatal(format!(
                    "bitmap said chunk {} is live but it reads erased",
                    chunk
                ))),
            },
        }
    }

    pub(crate) fn delete_data_chunk(&mut self, obj_id: ObjectId, logical: u32) -> FsResult<()> {
        let prev = self.find_data_chunk(obj_id, logical)?;
        let width = self.tnode_width;
        let file = self.objects.require_mut(obj_id)?.file_mut()?;
        let old_slot = file.tnodes.clear(logical, width);
        if old_slot != 0 {
            file.n_data_chunks = file.n_data_chunks.saturating_sub(1);
        }
        if let Some(chunk) = prev {
            self.chunk_del(chunk, true);
        }
        Ok(())
    }

    /*
     * Object headers.
     */

    /// Serialize the object's current state into a fresh header chunk and
    /// retire the previous one. `shadows` marks an id this header replaces.
    pub(crate) fn update_header(
        &mut self,
        obj_id: ObjectId,
        is_shrink: bool,
        shadows: u32,
        use_reserve: bool,
    ) -> FsResult<PhysChunk> {
        self.ensure_header_loaded(obj_id)?;
        let obj = self.objects.require(obj_id)?;
        if obj.is_pseudo() {
            return Err(FsError::Fatal(format!("header write for pseudo object {}", obj_id)));
        }
        let hdr = ObjectHeader {
            obj_type: obj.obj_type(),
            parent_id: if obj.parent == 0 { OBJECTID_LOST_N_FOUND } else { obj.parent },
            name_checksum: obj.name_checksum,
            name: obj.name.clone().unwrap_or_default(),
            mode: obj.mode,
            uid: obj.uid,
            gid: obj.gid,
            atime: obj.atime,
            mtime: obj.mtime,
            ctime: obj.ctime,
            file_size: match &obj.variant {
                ObjectVariant::File(f) => f.file_size,
                _ => 0,
            },
            equiv_id: match &obj.variant {
                ObjectVariant::Hardlink { equiv_id } => *equiv_id,
                _ => 0,
            },
            alias: match &obj.variant {
                ObjectVariant::Symlink { alias } => alias.clone(),
                _ => String::new(),
            },
            rdev: match &obj.variant {
                ObjectVariant::Special { rdev } => *rdev,
                _ => 0,
            },
            shadows_obj: shadows,
            inband_shadows_obj: if self.opts.inband_tags { shadows } else { NO_SHADOW },
            is_shrink,
        };
        let old_hdr = obj.hdr_chunk;
        let serial = (obj.serial + 1) & 3;
        let endian = self.opts.endian;
        let payload = self.payload_bytes;
        let xattrs = obj.xattrs.clone();

        let mut buf = vec![0xFFu8; payload];
        hdr.serialize(&mut buf, endian);
        xattr::pack_xattrs(&xattrs, &mut buf[HEADER_XATTR_OFFSET..], endian)?;

        let mut tags = ExtTags::new_header(obj_id, serial);
        tags.n_bytes = payload as u32;
        tags.extra_available = true;
        tags.extra_parent_id = hdr.parent_id;
        tags.extra_file_size = hdr.file_size;
        tags.extra_obj_type = hdr.obj_type;
        tags.extra_is_shrink = is_shrink;
        tags.extra_shadows = shadows;
        tags.extra_equiv_id = hdr.equiv_id;

        let new_chunk = self.write_new_chunk(&buf, &mut tags, use_reserve)?;
        let (block, _) = self.split_chunk(new_chunk);
        if is_shrink {
            self.blocks.get_block_info_mut(block).has_shrink_hdr = true;
        }
        let obj = self.objects.require_mut(obj_id)?;
        obj.hdr_chunk = Some(new_chunk);
        obj.serial = serial;
        obj.dirty = false;
        if let Some(old) = old_hdr {
            self.chunk_del(old, true);
        }
        Ok(new_chunk)
    }

    /// Parse the header body of an object whose scan only saw the tags: the
    /// real name, times, alias, xattrs. One read, first time it is needed.
    pub(crate) fn ensure_header_loaded(&mut self, obj_id: ObjectId) -> FsResult<()> {
        let obj = self.objects.require(obj_id)?;
        if !obj.lazy_name {
            return Ok(());
        }
        let Some(hdr_chunk) = obj.hdr_chunk else {
            // header was lost; give the object a synthetic name
            let obj = self.objects.require_mut(obj_id)?;
            let name = format!("obj{}", obj_id);
            let fold = self.opts.case_insensitive;
            obj.set_name(&name, fold);
            return Ok(());
        };
        let mut buf = vec![0u8; self.payload_bytes];
        let read = self.read_chunk_raw(hdr_chunk, Some(&mut buf))?;
        if read.is_none() {
            return Err(FsError::Fatal(format!(
                "header chunk {} of object {} reads erased",
                hdr_chunk, obj_id
            )));
        }
        let endian = self.opts.endian;
        let hdr = ObjectHeader::deserialize(&buf, endian)?;
        let xattrs = xattr::unpack_xattrs(&buf[HEADER_XATTR_OFFSET..], endian)?;
        let fold = self.opts.case_insensitive;
        let obj = self.objects.require_mut(obj_id)?;
        obj.set_name(&hdr.name, fold);
        obj.mode = hdr.mode;
        obj.uid = hdr.uid;
        obj.gid = hdr.gid;
        obj.atime = hdr.atime;
        obj.mtime = hdr.mtime;
        obj.ctime = hdr.ctime;
        obj.xattrs = xattrs;
        match &mut obj.variant {
            ObjectVariant::Symlink { alias } => *alias = hdr.alias,
            ObjectVariant::Special { rdev } => *rdev = hdr.rdev,
            _ => {}
        }
        Ok(())
    }

    /*
     * Object teardown.
     */

    /// Remove an object that holds no live data chunks: unlink from parent,
    /// drop its header chunk, forget it.
    pub(crate) fn delete_object_now(&mut self, obj_id: ObjectId) -> FsResult<()> {
        let obj = self.objects.require(obj_id)?;
        if obj.is_pseudo() {
            return Err(FsError::BadHandle);
        }
        let parent = obj.parent;
        let hdr = obj.hdr_chunk;
        self.cache.invalidate_object(obj_id);
        self.objects.unregister_hardlink(obj_id);
        if parent != 0 {
            self.objects.remove_child(parent, obj_id)?;
        }
        if let Some(hdr_chunk) = hdr {
            self.chunk_del(hdr_chunk, true);
        }
        self.dirty_dirs.retain(|d| *d != obj_id);
        self.objects.remove(obj_id);
        Ok(())
    }

    /// Soft delete: the file keeps its id and header until GC has walked all
    /// of its chunks off the device.
    pub(crate) fn soft_delete_file(&mut self, obj_id: ObjectId) -> FsResult<()> {
        let width = self.tnode_width;
        let obj = self.objects.require_mut(obj_id)?;
        obj.soft_del = true;
        let file = obj.file_mut()?;
        let mut tree = std::mem::take(&mut file.tnodes);
        let mut slots: Vec<(u32, u32)> = Vec::new();
        tree.take_all(width, &mut |logical, value| slots.push((logical, value)));
        for (logical, value) in slots {
            if let Some(chunk) = self.find_chunk_in_group(value, obj_id, logical + 1)? {
                self.soft_delete_chunk(chunk);
            }
        }
        Ok(())
    }

    /*
     * Checkpoint invalidation: the snapshot dies the moment anything is
     * written after mount.
     */

    pub(crate) fn invalidate_checkpoint(&mut self) {
        if self.checkpoint_blocks.is_empty() {
            return;
        }
        debug!("invalidating checkpoint ({} blocks)", self.checkpoint_blocks.len());
        let blocks = std::mem::take(&mut self.checkpoint_blocks);
        for block in blocks {
            // checkpoint blocks never held live data; back to the pool
            self.blocks.set_state(block, BlockState::Dirty);
            self.n_free_chunks += self.chunks_per_block as i64;
            self.erase_and_recycle(block);
        }
        self.checkpoint_loaded = false;
    }

    /*
     * Mount / format / unmount / sync.
     */

    pub fn format(&mut self) -> FsResult<()> {
        if self.mounted {
            return Err(FsError::Busy);
        }
        info!("formatting device: erasing {} blocks", self.n_blocks);
        self.blocks = BlockTable::new(self.n_blocks, self.chunks_per_block);
        self.objects = ObjectTable::new();
        self.cache = CacheSet::new(self.opts.n_caches.max(1), self.payload_bytes);
        self.seq_number = SEQ_NUMBER_START;
        self.alloc_block = None;
        self.alloc_page = 0;
        self.n_erased_blocks = 0;
        self.n_free_chunks = 0;
        self.checkpoint_blocks.clear();
        self.checkpoint_loaded = false;
        for block in 0..self.n_blocks {
            let bad = self
                .driver
                .check_bad(block)
                .map_err(|e| FsError::Io(e.to_string()))?;
            if bad {
                self.blocks.set_state(block, BlockState::Dead);
                continue;
            }
            match self.driver.erase_block(block) {
                Ok(()) => {
                    self.stats.n_erasures += 1;
                    self.blocks.set_state(block, BlockState::Empty);
                    self.n_erased_blocks += 1;
                    self.n_free_chunks += self.chunks_per_block as i64;
                }
                Err(e) => {
                    warn!("format: erase of block {} failed: {}", block, e);
                    self.stats.n_erase_failures += 1;
                    self.blocks.set_state(block, BlockState::Dead);
                    self.stats.n_retired_blocks += 1;
                    if self.opts.version == FlashVersion::V2 {
                        let _ = self.driver.mark_bad(block);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn mount(&mut self, name: &str) -> FsResult<()> {
        if self.mounted {
            return Err(FsError::Busy);
        }
        if crate::register_device(name).is_err() {
            return Err(FsError::Busy);
        }
        self.device_name = name.to_string();
        self.objects = ObjectTable::new();
        self.cache = CacheSet::new(self.opts.n_caches.max(1), self.payload_bytes);
        self.dirty_dirs.clear();
        self.gc_cleanup.clear();
        self.gc_block = None;
        let restored = self.restore_from_checkpoint().unwrap_or_else(|e| {
            warn!("checkpoint restore failed: {}, falling back to scan", e);
            false
        });
        if !restored {
            match self.opts.version {
                FlashVersion::V2 => self.scan_backward()?,
                FlashVersion::V1 => self.scan_forward()?,
            }
        }
        // sanity: the root must be a directory
        if self.objects.require(OBJECTID_ROOT)?.dir().is_err() {
            crate::deregister_device(&self.device_name).ok();
            return Err(FsError::Fatal("root directory did not load".into()));
        }
        self.mounted = true;
        info!(
            "mounted {}: {} objects, {} erased blocks, {} free chunks",
            name,
            self.objects.len(),
            self.n_erased_blocks,
            self.n_free_chunks
        );
        Ok(())
    }

    pub fn unmount(&mut self) -> FsResult<()> {
        if !self.mounted {
            return Err(FsError::Busy);
        }
        self.sync(true)?;
        crate::deregister_device(&self.device_name).ok();
        self.mounted = false;
        Ok(())
    }

    /// Flush everything dirty; optionally leave a checkpoint for fast mount.
    pub fn sync(&mut self, write_checkpoint: bool) -> FsResult<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        self.flush_whole_cache(true)?;
        // deferred directory mtime updates
        let dirs = std::mem::take(&mut self.dirty_dirs);
        for dir in dirs {
            if self.objects.contains(dir) && !self.objects.require(dir)?.is_pseudo() {
                self.update_header(dir, false, NO_SHADOW, false)?;
            }
        }
        let dirty: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|o| o.dirty && !o.is_pseudo())
            .map(|o| o.id)
            .collect();
        for obj_id in dirty {
            self.update_header(obj_id, false, NO_SHADOW, false)?;
        }
        if write_checkpoint && !self.checkpoint_loaded {
            if let Err(e) = self.write_checkpoint() {
                warn!("checkpoint write failed: {:?}, volume stays scannable", e);
            }
        }
        Ok(())
    }

    /// Stamp a directory for a deferred mtime header refresh at next sync.
    pub(crate) fn mark_dir_dirty(&mut self, dir: ObjectId) {
        if dir <= OBJECTID_LOST_N_FOUND {
            return;
        }
        if let Some(obj) = self.objects.get_mut(dir) {
            obj.mtime = now_secs();
            if !self.dirty_dirs.contains(&dir) {
                self.dirty_dirs.push(dir);
            }
        }
    }

    pub fn set_read_only(&mut self, ro: bool) {
        self.read_only = ro;
    }

    /// Free space visible to callers, net of the allocator reserve.
    pub fn free_bytes(self: &Self) -> u64 {
        let reserve_chunks =
            (self.opts.n_reserved_blocks + self.calc_checkpt_blocks_required()) * self.chunks_per_block;
        let free = (self.n_free_chunks - reserve_chunks as i64).max(0);
        free as u64 * self.payload_bytes as u64
    }
}

/// Convenience: anyhow adapter for CLI callers.
pub fn map_fs_err<R>(res: FsResult<R>) -> AnyResult<R> {
    res.map_err(|e| anyhow::anyhow!("{} (errno {})", e, e.errno()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use nand_driver::{NandGeometry, RamNandDriver};
    use std::sync::atomic::{AtomicU32, Ordering};

    static NAME_SEQ: AtomicU32 = AtomicU32::new(0);

    pub fn unique_name(prefix: &str) -> String {
        format!("{}-{}", prefix, NAME_SEQ.fetch_add(1, Ordering::Relaxed))
    }

    pub fn geometry(n_blocks: usize, chunks_per_block: usize, data_bytes: usize) -> NandGeometry {
        NandGeometry {
            n_blocks,
            chunks_per_block,
            data_bytes_per_chunk: data_bytes,
            spare_bytes_per_chunk: 64,
        }
    }

    pub fn device_with(
        n_blocks: usize,
        chunks_per_block: usize,
        data_bytes: usize,
        opts: LffsOptions,
    ) -> Lffs<RamNandDriver> {
        let driver = RamNandDriver::new(geometry(n_blocks, chunks_per_block, data_bytes));
        let mut dev = Lffs::new(driver, opts).unwrap();
        dev.format().unwrap();
        dev.mount(&unique_name("test-dev")).unwrap();
        dev
    }

    /// The S1 geometry: 16 blocks of 32 chunks of 512 bytes.
    pub fn small_device() -> Lffs<RamNandDriver> {
        device_with(16, 32, 512, LffsOptions::default())
    }
}
