use anyhow::Result;

#[derive(Default, Debug)]
pub struct NandStats {
    pub read_cnt: u32,
    pub write_cnt: u32,
    pub erase_cnt: u32,
}

/// Physical shape of one NAND device.
#[derive(Debug, Clone)]
pub struct NandGeometry {
    pub n_blocks: usize,
    pub chunks_per_block: usize,
    pub data_bytes_per_chunk: usize,
    pub spare_bytes_per_chunk: usize,
}

impl Default for NandGeometry {
    fn default() -> Self {
        Self {
            n_blocks: 128,
            chunks_per_block: 32,
            data_bytes_per_chunk: 512,
            spare_bytes_per_chunk: 64,
        }
    }
}

impl NandGeometry {
    pub fn total_chunks(&self) -> usize {
        self.n_blocks * self.chunks_per_block
    }

    pub fn chunk_index(&self, block: usize, chunk: usize) -> usize {
        block * self.chunks_per_block + chunk
    }
}

/// Outcome of the ECC pass on a chunk read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccResult {
    /// Data read back clean.
    NoError,
    /// One or more bits corrected, data is good.
    Fixed,
    /// Corrected, but the correction count suggests the block is going.
    FixedSuspect,
    /// Uncorrectable. Data returned is whatever came off the bus.
    Unfixed,
}

impl EccResult {
    pub fn data_valid(self) -> bool {
        !matches!(self, EccResult::Unfixed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NandError {
    #[error("address out of range: block {block} chunk {chunk}")]
    OutOfRange { block: usize, chunk: usize },
    #[error("program failed at block {block} chunk {chunk}")]
    ProgramFailed { block: usize, chunk: usize },
    #[error("erase failed at block {0}")]
    EraseFailed(usize),
    #[error("block {0} is marked bad")]
    BadBlock(usize),
}

/// NandDriver abstract interface.
///
/// A chunk is one NAND page: the unit of programming. `data` is the main
/// payload area, `spare` the out-of-band area the filesystem keeps its tags
/// in. Either may be absent on a call; a program with only `spare` is a
/// tags-only update (bits can still only go 1 -> 0).
pub trait NandDriver {
    fn geometry(&self) -> &NandGeometry;
    fn write_chunk(
        &mut self,
        block: usize,
        chunk: usize,
        data: Option<&[u8]>,
        spare: Option<&[u8]>,
    ) -> Result<()>;
    fn read_chunk(
        &mut self,
        block: usize,
        chunk: usize,
        data: Option<&mut [u8]>,
        spare: Option<&mut [u8]>,
    ) -> Result<EccResult>;
    fn erase_block(&mut self, block: usize) -> Result<()>;
    fn mark_bad(&mut self, block: usize) -> Result<()>;
    /// Returns true when the block carries a factory or runtime bad mark.
    fn check_bad(&mut self, block: usize) -> Result<bool>;
}

pub mod file;
pub mod ram;

pub use file::FileNandDriver;
pub use ram::{NandMedia, RamNandDriver};

#[cfg(test)]
pub(crate) fn driver_tester(driver: &mut dyn NandDriver) -> Result<()> {
    let geom = driver.geometry().clone();
    let data = vec![0xA5u8; geom.data_bytes_per_chunk];
    let spare = vec![0x5Au8; geom.spare_bytes_per_chunk];
    driver.write_chunk(0, 0, Some(&data), Some(&spare))?;
    let mut data_rd = vec![0u8; geom.data_bytes_per_chunk];
    let mut spare_rd = vec![0u8; geom.spare_bytes_per_chunk];
    let ecc = driver.read_chunk(0, 0, Some(&mut data_rd), Some(&mut spare_rd))?;
    assert!(ecc.data_valid());
    assert_eq!(data, data_rd);
    assert_eq!(spare, spare_rd);
    driver.erase_block(0)?;
    driver.read_chunk(0, 0, Some(&mut data_rd), None)?;
    assert!(data_rd.iter().all(|b| *b == 0xFF));
    assert!(!driver.check_bad(1)?);
    driver.mark_bad(1)?;
    assert!(driver.check_bad(1)?);
    Ok(())
}
