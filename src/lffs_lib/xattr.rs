//! Extended attributes ride in the object header chunk, packed after the
//! fixed header record: [name_len u8 | value_len u16 | name | value]*,
//! terminated by a zero name_len.

use crate::lffs_lib::desc::{HEADER_XATTR_OFFSET, NO_SHADOW};
use crate::lffs_lib::types::{Endianness, FsError, FsResult, ObjectId};
use crate::lffs_lib::utils::{get_u16, put_u16};
use crate::lffs_lib::Lffs;
use nand_driver::NandDriver;

const XATTR_ENTRY_OVERHEAD: usize = 3;

pub fn packed_size(xattrs: &[(String, Vec<u8>)]) -> usize {
    xattrs
        .iter()
        .map(|(n, v)| XATTR_ENTRY_OVERHEAD + n.len() + v.len())
        .sum::<usize>()
        + 1
}

pub fn pack_xattrs(
    xattrs: &[(String, Vec<u8>)],
    buf: &mut [u8],
    endian: Endianness,
) -> FsResult<()> {
    if packed_size(xattrs) > buf.len() {
        return Err(FsError::NoSpace);
    }
    let mut pos = 0usize;
    for (name, value) in xattrs {
        buf[pos] = name.len() as u8;
        put_u16(buf, pos + 1, value.len() as u16, endian);
        pos += XATTR_ENTRY_OVERHEAD;
        buf[pos..pos + name.len()].copy_from_slice(name.as_bytes());
        pos += name.len();
        buf[pos..pos + value.len()].copy_from_slice(value);
        pos += value.len();
    }
    buf[pos] = 0;
    Ok(())
}

pub fn unpack_xattrs(buf: &[u8], endian: Endianness) -> FsResult<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let name_len = buf[pos] as usize;
        // 0 terminates; 0xFF is erased fill
        if name_len == 0 || name_len == 0xFF {
            break;
        }
        if pos + XATTR_ENTRY_OVERHEAD > buf.len() {
            break;
        }
        let value_len = get_u16(buf, pos + 1, endian) as usize;
        pos += XATTR_ENTRY_OVERHEAD;
        if pos + name_len + value_len > buf.len() {
            break;
        }
        let name = String::from_utf8_lossy(&buf[pos..pos + name_len]).to_string();
        pos += name_len;
        let value = buf[pos..pos + value_len].to_vec();
        pos += value_len;
        out.push((name, value));
    }
    Ok(out)
}

impl<T: NandDriver> Lffs<T> {
    fn xattr_capacity(&self) -> usize {
        self.chunk_bytes() - HEADER_XATTR_OFFSET
    }

    pub fn setxattr(&mut self, obj_id: ObjectId, name: &str, value: &[u8]) -> FsResult<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        if name.is_empty() || name.len() > 255 || value.len() > u16::MAX as usize {
            return Err(FsError::Range);
        }
        let obj_id = self.objects.equivalent(obj_id)?;
        self.ensure_header_loaded(obj_id)?;
        let obj = self.objects.require(obj_id)?;
        let mut next = obj.xattrs.clone();
        match next.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value.to_vec(),
            None => next.push((name.to_string(), value.to_vec())),
        }
        if packed_size(&next) > self.xattr_capacity() {
            return Err(FsError::NoSpace);
        }
        self.invalidate_checkpoint();
        self.objects.require_mut(obj_id)?.xattrs = next;
        self.update_header(obj_id, false, NO_SHADOW, false)?;
        Ok(())
    }

    pub fn getxattr(&mut self, obj_id: ObjectId, name: &str) -> FsResult<Vec<u8>> {
        let obj_id = self.objects.equivalent(obj_id)?;
        self.ensure_header_loaded(obj_id)?;
        let obj = self.objects.require(obj_id)?;
        obj.xattrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or(FsError::NoData)
    }

    pub fn listxattr(&mut self, obj_id: ObjectId) -> FsResult<Vec<String>> {
        let obj_id = self.objects.equivalent(obj_id)?;
        self.ensure_header_loaded(obj_id)?;
        let obj = self.objects.require(obj_id)?;
        Ok(obj.xattrs.iter().map(|(n, _)| n.clone()).collect())
    }

    pub fn removexattr(&mut self, obj_id: ObjectId, name: &str) -> FsResult<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        let obj_id = self.objects.equivalent(obj_id)?;
        self.ensure_header_loaded(obj_id)?;
        let obj = self.objects.require_mut(obj_id)?;
        let before = obj.xattrs.len();
        obj.xattrs.retain(|(n, _)| n != name);
        if obj.xattrs.len() == before {
            return Err(FsError::NoData);
        }
        self.invalidate_checkpoint();
        self.update_header(obj_id, false, NO_SHADOW, false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip() {
        let xattrs = vec![
            ("user.a".to_string(), vec![1, 2, 3]),
            ("user.b".to_string(), b"value".to_vec()),
        ];
        let mut buf = vec![0xFFu8; 64];
        pack_xattrs(&xattrs, &mut buf, Endianness::Little).unwrap();
        let back = unpack_xattrs(&buf, Endianness::Little).unwrap();
        assert_eq!(back, xattrs);
    }

    #[test]
    fn erased_area_is_empty() {
        let buf = vec![0xFFu8; 32];
        assert!(unpack_xattrs(&buf, Endianness::Little).unwrap().is_empty());
    }

    #[test]
    fn overflow_is_no_space() {
        let xattrs = vec![("name".to_string(), vec![0u8; 64])];
        let mut buf = vec![0xFFu8; 16];
        assert!(matches!(
            pack_xattrs(&xattrs, &mut buf, Endianness::Little),
            Err(FsError::NoSpace)
        ));
    }
}
