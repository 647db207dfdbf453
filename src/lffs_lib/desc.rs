//! On-flash structures: extended tags, tag marshalling, the object header
//! chunk layout, and the constants both share.
#![allow(dead_code)]

use crate::lffs_lib::types::{Endianness, FsError, FsResult, ObjectId};
use crate::lffs_lib::utils::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/*
 * Special object numbers. 1..=4 are the fake pseudo-directories that exist
 * on every volume and are never written to flash.
 */
pub const OBJECTID_UNLINKED: ObjectId = 1;
pub const OBJECTID_DELETED: ObjectId = 2;
pub const OBJECTID_ROOT: ObjectId = 3;
pub const OBJECTID_LOST_N_FOUND: ObjectId = 4;
pub const FIRST_ALLOCATABLE_ID: ObjectId = 5;
/// IDs with the top bit set are reserved for higher layers.
pub const ID_RESERVED_TOP: ObjectId = 0x8000_0000;

pub const N_BUCKETS: usize = 256;
/// Buckets sampled when picking the least-populated one for a new id.
pub const BUCKET_PROBES: usize = 10;

pub const SHORT_NAME_LEN: usize = 15;
pub const MAX_NAME_LENGTH: usize = 255;
pub const MAX_ALIAS_LENGTH: usize = 159;
pub const NAME_FIELD_BYTES: usize = 256;
pub const ALIAS_FIELD_BYTES: usize = 160;

/// Parent-chain walks longer than this are treated as corruption.
pub const MAX_OBJECT_DEPTH: usize = 100;
pub const MAX_SYMLINK_DEPTH: usize = 5;

/// Clamp for `wr_attempts == 0` ("unlimited" in older configurations).
pub const WR_ATTEMPTS_CAP: usize = 32;

/*
 * Block sequence numbers. Real data sequences start high so that the low
 * range can hold marker values.
 */
pub const SEQ_NUMBER_START: u32 = 0x1000;
pub const SEQ_CHECKPOINT_DATA: u32 = 0x21;

/// ECC-strike budget before a block is retired.
pub const BLOCK_STRIKES_MAX: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Default)]
#[repr(u32)]
pub enum ObjectType {
    #[default]
    Unknown = 0,
    File = 1,
    Symlink = 2,
    Directory = 3,
    Hardlink = 4,
    Special = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive, Default)]
#[repr(u8)]
pub enum BlockState {
    #[default]
    Unknown = 0,
    NeedsScan = 1,
    Scanning = 2,
    Empty = 3,
    Allocating = 4,
    Full = 5,
    Dirty = 6,
    Checkpoint = 7,
    Collecting = 8,
    Dead = 9,
}

/// 2-bit write-generation arithmetic: `new` supersedes `old` iff it is one
/// step ahead modulo 4.
pub fn serial_newer(old: u8, new: u8) -> bool {
    ((old + 1) & 3) == new
}

/// In-memory form of the per-chunk tags.
#[derive(Debug, Clone, Default)]
pub struct ExtTags {
    /// False when the chunk's tag area is still erased.
    pub chunk_used: bool,
    pub obj_id: ObjectId,
    /// 0 = object header; data chunks carry logical index + 1.
    pub chunk_id: u32,
    pub n_bytes: u32,
    pub serial_number: u8,
    pub is_deleted: bool,
    /// Copy of the owning block's sequence number.
    pub seq_number: u32,
    // Scan hints, valid when extra_available.
    pub extra_available: bool,
    pub extra_parent_id: ObjectId,
    pub extra_file_size: u64,
    pub extra_obj_type: ObjectType,
    pub extra_is_shrink: bool,
    /// Object id this header supersedes; NO_SHADOW when none.
    pub extra_shadows: ObjectId,
    pub extra_equiv_id: ObjectId,
}

pub const NO_SHADOW: u32 = !0;

/*
 * Packed tag layout (all multi-byte fields in the mount endianness):
 *   0..4    obj_id
 *   4..8    chunk_id
 *   8..12   n_bytes
 *   12..16  seq_number
 *   16..20  parent id (equiv id for hardlink headers)
 *   20..24  file size low
 *   24..28  file size high
 *   28..32  shadows
 *   32      flags: bit0 live (programmed to 0 marks deletion, v1),
 *                  bits1-2 serial, bit3 extra_available, bit4 is_shrink
 *   33      object type
 *   34..36  checksum over bytes 0..32
 *
 * The flags and type bytes are outside the checksum so the v1 deletion
 * marker can be programmed after the fact without invalidating the tags.
 */
pub const PACKED_TAGS_BYTES: usize = 36;

const FLAG_LIVE: u8 = 0x01;
const FLAG_SERIAL_SHIFT: u8 = 1;
const FLAG_SERIAL_MASK: u8 = 0x06;
const FLAG_EXTRA: u8 = 0x08;
const FLAG_SHRINK: u8 = 0x10;

fn tags_checksum(buf: &[u8]) -> u16 {
    let mut sum: u16 = 0;
    for b in &buf[..32] {
        sum = sum.wrapping_mul(31).wrapping_add(*b as u16);
    }
    sum
}

impl ExtTags {
    pub fn new_data(obj_id: ObjectId, logical_chunk: u32, n_bytes: u32, serial: u8) -> Self {
        Self {
            chunk_used: true,
            obj_id,
            chunk_id: logical_chunk + 1,
            n_bytes,
            serial_number: serial & 3,
            ..Default::default()
        }
    }

    pub fn new_header(obj_id: ObjectId, serial: u8) -> Self {
        Self {
            chunk_used: true,
            obj_id,
            chunk_id: 0,
            serial_number: serial & 3,
            extra_shadows: NO_SHADOW,
            ..Default::default()
        }
    }

    pub fn is_header(&self) -> bool {
        self.chunk_id == 0
    }

    /// Logical data chunk index; callers must check `is_header` first.
    pub fn logical_chunk(&self) -> u32 {
        debug_assert!(self.chunk_id > 0);
        self.chunk_id - 1
    }

    pub fn pack(&self, buf: &mut [u8], endian: Endianness) {
        assert!(buf.len() >= PACKED_TAGS_BYTES);
        buf[..PACKED_TAGS_BYTES].fill(0xFF);
        put_u32(buf, 0, self.obj_id, endian);
        put_u32(buf, 4, self.chunk_id, endian);
        put_u32(buf, 8, self.n_bytes, endian);
        put_u32(buf, 12, self.seq_number, endian);
        put_u32(buf, 16, self.extra_parent_id, endian);
        // hard-link headers have no size; the equiv id overlays that field
        if self.extra_obj_type == ObjectType::Hardlink {
            put_u32(buf, 20, self.extra_equiv_id, endian);
            put_u32(buf, 24, 0, endian);
        } else {
            put_u32(buf, 20, self.extra_file_size as u32, endian);
            put_u32(buf, 24, (self.extra_file_size >> 32) as u32, endian);
        }
        put_u32(buf, 28, self.extra_shadows, endian);
        let mut flags = 0u8;
        if !self.is_deleted {
            flags |= FLAG_LIVE;
        }
        flags |= (self.serial_number & 3) << FLAG_SERIAL_SHIFT;
        if self.extra_available {
            flags |= FLAG_EXTRA;
        }
        if self.extra_is_shrink {
            flags |= FLAG_SHRINK;
        }
        buf[32] = flags;
        buf[33] = u32::from(self.extra_obj_type) as u8;
        put_u16(buf, 34, tags_checksum(buf), endian);
    }

    /// Unpack tags from a spare-area (or inband) image. `Ok(None)` means the
    /// area is still erased; Err means it is written but corrupt.
    pub fn unpack(buf: &[u8], endian: Endianness) -> FsResult<Option<ExtTags>> {
        assert!(buf.len() >= PACKED_TAGS_BYTES);
        if buf[..PACKED_TAGS_BYTES].iter().all(|b| *b == 0xFF) {
            return Ok(None);
        }
        let sum = get_u16(buf, 34, endian);
        if sum != tags_checksum(buf) {
            return Err(FsError::Io("tag checksum mismatch".into()));
        }
        let flags = buf[32];
        let size_low = get_u32(buf, 20, endian) as u64;
        let size_high = get_u32(buf, 24, endian) as u64;
        let obj_type = ObjectType::try_from(buf[33] as u32).unwrap_or(ObjectType::Unknown);
        let extra_available = flags & FLAG_EXTRA != 0;
        let (extra_file_size, extra_equiv_id) = if obj_type == ObjectType::Hardlink {
            (0, size_low as u32)
        } else {
            (
                ((size_high) << 32) | size_low,
                0,
            )
        };
        Ok(Some(ExtTags {
            chunk_used: true,
            obj_id: get_u32(buf, 0, endian),
            chunk_id: get_u32(buf, 4, endian),
            n_bytes: get_u32(buf, 8, endian),
            seq_number: get_u32(buf, 12, endian),
            serial_number: (flags & FLAG_SERIAL_MASK) >> FLAG_SERIAL_SHIFT,
            is_deleted: flags & FLAG_LIVE == 0,
            extra_available,
            extra_parent_id: get_u32(buf, 16, endian),
            extra_file_size,
            extra_obj_type: obj_type,
            extra_is_shrink: flags & FLAG_SHRINK != 0,
            extra_shadows: get_u32(buf, 28, endian),
            extra_equiv_id,
        }))
    }

    /// Spare image that programs only the v1 deletion marker bit.
    pub fn deletion_marker() -> [u8; PACKED_TAGS_BYTES] {
        let mut buf = [0xFFu8; PACKED_TAGS_BYTES];
        buf[32] = !FLAG_LIVE;
        buf
    }
}

/*
 * Object header chunk layout. A fixed record at the front of the data
 * payload, the remainder carrying the extended-attribute blob.
 */
pub const HEADER_BYTES: usize = 484;
pub const HEADER_XATTR_OFFSET: usize = HEADER_BYTES;

const OFF_TYPE: usize = 0;
const OFF_PARENT: usize = 4;
const OFF_NAME_SUM: usize = 8;
const OFF_NAME: usize = 12;
const OFF_MODE: usize = OFF_NAME + NAME_FIELD_BYTES; // 268
const OFF_UID: usize = 272;
const OFF_GID: usize = 276;
const OFF_ATIME: usize = 280;
const OFF_MTIME: usize = 284;
const OFF_CTIME: usize = 288;
const OFF_FSIZE_LOW: usize = 292;
const OFF_EQUIV: usize = 296;
const OFF_ALIAS: usize = 300;
const OFF_RDEV: usize = OFF_ALIAS + ALIAS_FIELD_BYTES; // 460
const OFF_SHADOWS: usize = 464;
const OFF_INBAND_SHADOWS: usize = 468;
const OFF_SHRINK: usize = 472;
const OFF_FSIZE_HIGH: usize = 476;
const OFF_RESERVED: usize = 480;

/// 32-bit sentinel in the high size word: the low word alone is the size.
pub const FSIZE_32BIT_SENTINEL: u32 = !0;

pub fn fsize_combine(high: u32, low: u32) -> u64 {
    if high == FSIZE_32BIT_SENTINEL {
        low as u64
    } else {
        ((high as u64) << 32) | low as u64
    }
}

pub fn fsize_split(size: u64) -> (u32, u32) {
    if size <= u32::MAX as u64 {
        (FSIZE_32BIT_SENTINEL, size as u32)
    } else {
        // sizes whose high word collides with the sentinel are clamped
        let high = ((size >> 32) as u32).min(FSIZE_32BIT_SENTINEL - 1);
        (high, size as u32)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ObjectHeader {
    pub obj_type: ObjectType,
    pub parent_id: ObjectId,
    pub name_checksum: u16,
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub file_size: u64,
    pub equiv_id: ObjectId,
    pub alias: String,
    pub rdev: u32,
    pub shadows_obj: u32,
    pub inband_shadows_obj: u32,
    pub is_shrink: bool,
}

impl ObjectHeader {
    /// Serialize the fixed record into the front of a chunk payload. The
    /// xattr blob is appended by the caller from HEADER_XATTR_OFFSET on.
    pub fn serialize(&self, buf: &mut [u8], endian: Endianness) {
        assert!(buf.len() >= HEADER_BYTES, "chunk too small for a header");
        buf[..HEADER_BYTES].fill(0xFF);
        put_u32(buf, OFF_TYPE, self.obj_type.into(), endian);
        put_u32(buf, OFF_PARENT, self.parent_id, endian);
        put_u16(buf, OFF_NAME_SUM, self.name_checksum, endian);
        put_name(&mut buf[OFF_NAME..OFF_NAME + NAME_FIELD_BYTES], &self.name);
        put_u32(buf, OFF_MODE, self.mode, endian);
        put_u32(buf, OFF_UID, self.uid, endian);
        put_u32(buf, OFF_GID, self.gid, endian);
        put_u32(buf, OFF_ATIME, self.atime, endian);
        put_u32(buf, OFF_MTIME, self.mtime, endian);
        put_u32(buf, OFF_CTIME, self.ctime, endian);
        let (high, low) = fsize_split(self.file_size);
        put_u32(buf, OFF_FSIZE_LOW, low, endian);
        put_u32(buf, OFF_FSIZE_HIGH, high, endian);
        put_u32(buf, OFF_EQUIV, self.equiv_id, endian);
        put_name(&mut buf[OFF_ALIAS..OFF_ALIAS + ALIAS_FIELD_BYTES], &self.alias);
        put_u32(buf, OFF_RDEV, self.rdev, endian);
        put_u32(buf, OFF_SHADOWS, self.shadows_obj, endian);
        put_u32(buf, OFF_INBAND_SHADOWS, self.inband_shadows_obj, endian);
        put_u32(buf, OFF_SHRINK, self.is_shrink as u32, endian);
        put_u32(buf, OFF_RESERVED, 0, endian);
    }

    pub fn deserialize(buf: &[u8], endian: Endianness) -> FsResult<Self> {
        if buf.len() < HEADER_BYTES {
            return Err(FsError::Io("short header chunk".into()));
        }
        let obj_type = ObjectType::try_from(get_u32(buf, OFF_TYPE, endian))
            .map_err(|_| FsError::Io("bad object type in header".into()))?;
        let low = get_u32(buf, OFF_FSIZE_LOW, endian);
        let high = get_u32(buf, OFF_FSIZE_HIGH, endian);
        Ok(Self {
            obj_type,
            parent_id: get_u32(buf, OFF_PARENT, endian),
            name_checksum: get_u16(buf, OFF_NAME_SUM, endian),
            name: get_name(&buf[OFF_NAME..OFF_NAME + NAME_FIELD_BYTES]),
            mode: get_u32(buf, OFF_MODE, endian),
            uid: get_u32(buf, OFF_UID, endian),
            gid: get_u32(buf, OFF_GID, endian),
            atime: get_u32(buf, OFF_ATIME, endian),
            mtime: get_u32(buf, OFF_MTIME, endian),
            ctime: get_u32(buf, OFF_CTIME, endian),
            file_size: fsize_combine(high, low),
            equiv_id: get_u32(buf, OFF_EQUIV, endian),
            alias: get_name(&buf[OFF_ALIAS..OFF_ALIAS + ALIAS_FIELD_BYTES]),
            rdev: get_u32(buf, OFF_RDEV, endian),
            shadows_obj: get_u32(buf, OFF_SHADOWS, endian),
            inband_shadows_obj: get_u32(buf, OFF_INBAND_SHADOWS, endian),
            is_shrink: get_u32(buf, OFF_SHRINK, endian) != 0,
        })
    }
}

pub fn utc_time(timestamp_seconds: u32) -> std::time::SystemTime {
    use chrono::{DateTime, NaiveDateTime, Utc};
    let naive = NaiveDateTime::from_timestamp_millis(timestamp_seconds as i64 * 1000).unwrap();
    let datetime: DateTime<Utc> = DateTime::from_utc(naive, Utc);
    std::time::SystemTime::from(datetime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        let mut tags = ExtTags::new_data(42, 7, 512, 2);
        tags.seq_number = SEQ_NUMBER_START + 3;
        let mut buf = [0u8; PACKED_TAGS_BYTES];
        tags.pack(&mut buf, Endianness::Little);
        let back = ExtTags::unpack(&buf, Endianness::Little).unwrap().unwrap();
        assert_eq!(back.obj_id, 42);
        assert_eq!(back.logical_chunk(), 7);
        assert_eq!(back.n_bytes, 512);
        assert_eq!(back.serial_number, 2);
        assert_eq!(back.seq_number, SEQ_NUMBER_START + 3);
        assert!(!back.is_deleted);
    }

    #[test]
    fn erased_tags_read_as_unused() {
        let buf = [0xFFu8; PACKED_TAGS_BYTES];
        assert!(ExtTags::unpack(&buf, Endianness::Little).unwrap().is_none());
    }

    #[test]
    fn corrupt_tags_are_rejected() {
        let mut buf = [0u8; PACKED_TAGS_BYTES];
        ExtTags::new_data(1, 0, 10, 0).pack(&mut buf, Endianness::Little);
        buf[2] ^= 0x40;
        assert!(ExtTags::unpack(&buf, Endianness::Little).is_err());
    }

    #[test]
    fn deletion_marker_survives_checksum() {
        let mut buf = [0u8; PACKED_TAGS_BYTES];
        ExtTags::new_data(9, 3, 100, 1).pack(&mut buf, Endianness::Little);
        // simulate the tags-only follow-up program
        let marker = ExtTags::deletion_marker();
        for (b, m) in buf.iter_mut().zip(marker.iter()) {
            *b &= *m;
        }
        let back = ExtTags::unpack(&buf, Endianness::Little).unwrap().unwrap();
        assert!(back.is_deleted);
        assert_eq!(back.obj_id, 9);
    }

    #[test]
    fn serial_wrap_rule() {
        assert!(serial_newer(0, 1));
        assert!(serial_newer(3, 0));
        assert!(!serial_newer(1, 0));
        assert!(!serial_newer(1, 3));
    }

    #[test]
    fn header_round_trip_big_endian() {
        let hdr = ObjectHeader {
            obj_type: ObjectType::Symlink,
            parent_id: OBJECTID_ROOT,
            name_checksum: 0x1234,
            name: "link".into(),
            mode: 0o777,
            uid: 1000,
            gid: 100,
            atime: 1,
            mtime: 2,
            ctime: 3,
            file_size: 0,
            equiv_id: 0,
            alias: "/target/elsewhere".into(),
            rdev: 0,
            shadows_obj: NO_SHADOW,
            inband_shadows_obj: NO_SHADOW,
            is_shrink: false,
        };
        let mut buf = vec![0u8; 512];
        hdr.serialize(&mut buf, Endianness::Big);
        let back = ObjectHeader::deserialize(&buf, Endianness::Big).unwrap();
        assert_eq!(back.obj_type, ObjectType::Symlink);
        assert_eq!(back.name, "link");
        assert_eq!(back.alias, "/target/elsewhere");
        assert_eq!(back.shadows_obj, NO_SHADOW);
    }

    #[test]
    fn fsize_sentinel() {
        let (high, low) = fsize_split(1500);
        assert_eq!(high, FSIZE_32BIT_SENTINEL);
        assert_eq!(fsize_combine(high, low), 1500);
        let big = 5u64 << 32 | 77;
        let (high, low) = fsize_split(big);
        assert_eq!(fsize_combine(high, low), big);
    }
}
