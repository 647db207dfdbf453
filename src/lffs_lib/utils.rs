use crate::lffs_lib::types::Endianness;

/// Initialise env_logger once; safe to call repeatedly (tests).
pub fn init_logs() {
    let _ = env_logger::builder().is_test(false).try_init();
}

pub fn put_u16(buf: &mut [u8], off: usize, v: u16, endian: Endianness) {
    let bytes = match endian {
        Endianness::Little => v.to_le_bytes(),
        Endianness::Big => v.to_be_bytes(),
    };
    buf[off..off + 2].copy_from_slice(&bytes);
}

pub fn get_u16(buf: &[u8], off: usize, endian: Endianness) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&buf[off..off + 2]);
    match endian {
        Endianness::Little => u16::from_le_bytes(b),
        Endianness::Big => u16::from_be_bytes(b),
    }
}

pub fn put_u32(buf: &mut [u8], off: usize, v: u32, endian: Endianness) {
    let bytes = match endian {
        Endianness::Little => v.to_le_bytes(),
        Endianness::Big => v.to_be_bytes(),
    };
    buf[off..off + 4].copy_from_slice(&bytes);
}

pub fn get_u32(buf: &[u8], off: usize, endian: Endianness) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    match endian {
        Endianness::Little => u32::from_le_bytes(b),
        Endianness::Big => u32::from_be_bytes(b),
    }
}

/// 16-bit directory-scan prefilter checksum over a name. Case folding is
/// applied before summing when the volume is case-insensitive, so both sides
/// of a compare agree.
pub fn name_checksum(name: &str, fold_case: bool) -> u16 {
    let mut sum: u16 = 0;
    for b in name.bytes() {
        let b = if fold_case { b.to_ascii_lowercase() } else { b };
        sum = sum.wrapping_mul(31).wrapping_add(b as u16);
    }
    sum
}

pub fn names_equal(a: &str, b: &str, fold_case: bool) -> bool {
    if fold_case {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

/// Copy a string into a fixed NUL-terminated byte field.
pub fn put_name(buf: &mut [u8], name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf[n..].fill(0);
}

/// Read a NUL-terminated byte field back into a String.
pub fn get_name(buf: &[u8]) -> String {
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).to_string()
}

pub fn now_secs() -> u32 {
    chrono::Utc::now().timestamp() as u32
}

#[macro_export]
macro_rules! prv {
    ($($e:expr),+) => {
        {
            $(log::debug!("{} = {:?}", stringify!($e), $e);)+
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_folds_case_when_asked() {
        assert_eq!(name_checksum("File", true), name_checksum("fILE", true));
        assert_ne!(name_checksum("File", false), name_checksum("file", false));
    }

    #[test]
    fn endian_round_trip() {
        let mut buf = [0u8; 8];
        put_u32(&mut buf, 0, 0xDEAD_BEEF, Endianness::Big);
        put_u32(&mut buf, 4, 0xDEAD_BEEF, Endianness::Little);
        assert_eq!(get_u32(&buf, 0, Endianness::Big), 0xDEAD_BEEF);
        assert_eq!(get_u32(&buf, 4, Endianness::Little), 0xDEAD_BEEF);
        assert_eq!(&buf[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn name_field_round_trip() {
        let mut buf = [0xFFu8; 16];
        put_name(&mut buf, "hello");
        assert_eq!(get_name(&buf), "hello");
        // over-long names are clipped to the field
        put_name(&mut buf, "0123456789abcdefgh");
        assert_eq!(get_name(&buf).len(), 15);
    }
}
