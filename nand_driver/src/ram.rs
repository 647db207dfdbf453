use crate::{EccResult, NandDriver, NandError, NandGeometry, NandStats};
use anyhow::{bail, Result};
use log::*;

/// The raw cell state of a simulated device, split from the driver so tests
/// can clone it and remount (power-loss simulation: RAM state is discarded,
/// the media survives).
#[derive(Clone)]
pub struct NandMedia {
    pub geom: NandGeometry,
    pub data: Vec<u8>,
    pub spare: Vec<u8>,
    /// Program count per chunk; NAND allows very few before an erase.
    pub writes: Vec<u8>,
    pub bad: Vec<bool>,
    pub erase_count: Vec<u32>,
    /// Test hooks: force the next program/erase on a location to fail.
    pub fail_program: Vec<bool>,
    pub fail_erase: Vec<bool>,
    /// Test hook: ECC verdict to report for a chunk instead of NoError.
    pub ecc_forced: Vec<Option<EccResult>>,
}

impl NandMedia {
    pub fn new(geom: NandGeometry) -> Self {
        let n_chunks = geom.total_chunks();
        let n_blocks = geom.n_blocks;
        Self {
            data: vec![0xFF; n_chunks * geom.data_bytes_per_chunk],
            spare: vec![0xFF; n_chunks * geom.spare_bytes_per_chunk],
            writes: vec![0; n_chunks],
            bad: vec![false; n_blocks],
            erase_count: vec![0; n_blocks],
            fail_program: vec![false; n_chunks],
            fail_erase: vec![false; n_blocks],
            ecc_forced: vec![None; n_chunks],
            geom,
        }
    }
}

/// In-memory NAND with real programming semantics: a program can only clear
/// bits, an erase sets the whole block back to 0xFF.
pub struct RamNandDriver {
    pub info: NandStats,
    media: NandMedia,
}

impl RamNandDriver {
    pub fn new(geom: NandGeometry) -> Self {
        Self {
            info: NandStats::default(),
            media: NandMedia::new(geom),
        }
    }

    pub fn from_media(media: NandMedia) -> Self {
        Self {
            info: NandStats::default(),
            media,
        }
    }

    /// Clone of the cell state, for power-loss tests.
    pub fn media(&self) -> &NandMedia {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut NandMedia {
        &mut self.media
    }

    fn check_range(&self, block: usize, chunk: usize) -> Result<usize> {
        let geom = &self.media.geom;
        if block >= geom.n_blocks || chunk >= geom.chunks_per_block {
            bail!(NandError::OutOfRange { block, chunk });
        }
        Ok(geom.chunk_index(block, chunk))
    }
}

impl NandDriver for RamNandDriver {
    fn geometry(&self) -> &NandGeometry {
        &self.media.geom
    }

    fn write_chunk(
        &mut self,
        block: usize,
        chunk: usize,
        data: Option<&[u8]>,
        spare: Option<&[u8]>,
    ) -> Result<()> {
        let ci = self.check_range(block, chunk)?;
        self.info.write_cnt += 1;
        if self.media.fail_program[ci] {
            self.media.fail_program[ci] = false;
            bail!(NandError::ProgramFailed { block, chunk });
        }
        let geom = self.media.geom.clone();
        if let Some(data) = data {
            assert!(data.len() <= geom.data_bytes_per_chunk);
            let base = ci * geom.data_bytes_per_chunk;
            for (i, b) in data.iter().enumerate() {
                // program: bits only go 1 -> 0
                self.media.data[base + i] &= *b;
            }
        }
        if let Some(spare) = spare {
            assert!(spare.len() <= geom.spare_bytes_per_chunk);
            let base = ci * geom.spare_bytes_per_chunk;
            for (i, b) in spare.iter().enumerate() {
                self.media.spare[base + i] &= *b;
            }
        }
        self.media.writes[ci] = self.media.writes[ci].saturating_add(1);
        Ok(())
    }

    fn read_chunk(
        &mut self,
        block: usize,
        chunk: usize,
        data: Option<&mut [u8]>,
        spare: Option<&mut [u8]>,
    ) -> Result<EccResult> {
        let ci = self.check_range(block, chunk)?;
        self.info.read_cnt += 1;
        let geom = self.media.geom.clone();
        if let Some(data) = data {
            let base = ci * geom.data_bytes_per_chunk;
            let n = data.len().min(geom.data_bytes_per_chunk);
            data[..n].copy_from_slice(&self.media.data[base..base + n]);
        }
        if let Some(spare) = spare {
            let base = ci * geom.spare_bytes_per_chunk;
            let n = spare.len().min(geom.spare_bytes_per_chunk);
            spare[..n].copy_from_slice(&self.media.spare[base..base + n]);
        }
        Ok(self.media.ecc_forced[ci].unwrap_or(EccResult::NoError))
    }

    fn erase_block(&mut self, block: usize) -> Result<()> {
        if block >= self.media.geom.n_blocks {
            bail!(NandError::OutOfRange { block, chunk: 0 });
        }
        self.info.erase_cnt += 1;
        if self.media.fail_erase[block] {
            self.media.fail_erase[block] = false;
            bail!(NandError::EraseFailed(block));
        }
        let geom = self.media.geom.clone();
        let c0 = geom.chunk_index(block, 0);
        let c1 = c0 + geom.chunks_per_block;
        self.media.data[c0 * geom.data_bytes_per_chunk..c1 * geom.data_bytes_per_chunk].fill(0xFF);
        self.media.spare[c0 * geom.spare_bytes_per_chunk..c1 * geom.spare_bytes_per_chunk]
            .fill(0xFF);
        self.media.writes[c0..c1].fill(0);
        for f in &mut self.media.ecc_forced[c0..c1] {
            *f = None;
        }
        self.media.erase_count[block] += 1;
        Ok(())
    }

    fn mark_bad(&mut self, block: usize) -> Result<()> {
        if block >= self.media.geom.n_blocks {
            bail!(NandError::OutOfRange { block, chunk: 0 });
        }
        warn!("marking block {} bad", block);
        self.media.bad[block] = true;
        Ok(())
    }

    fn check_bad(&mut self, block: usize) -> Result<bool> {
        if block >= self.media.geom.n_blocks {
            bail!(NandError::OutOfRange { block, chunk: 0 });
        }
        Ok(self.media.bad[block])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver_tester;

    #[test]
    fn simple_test() -> Result<()> {
        let mut driver = RamNandDriver::new(NandGeometry::default());
        driver_tester(&mut driver)
    }

    #[test]
    fn program_only_clears_bits() -> Result<()> {
        let mut driver = RamNandDriver::new(NandGeometry::default());
        let sz = driver.geometry().data_bytes_per_chunk;
        driver.write_chunk(2, 3, Some(&vec![0xF0; sz]), None)?;
        driver.write_chunk(2, 3, Some(&vec![0x0F; sz]), None)?;
        let mut back = vec![0u8; sz];
        driver.read_chunk(2, 3, Some(&mut back), None)?;
        assert!(back.iter().all(|b| *b == 0x00));
        Ok(())
    }

    #[test]
    fn media_survives_driver() -> Result<()> {
        let mut driver = RamNandDriver::new(NandGeometry::default());
        let sz = driver.geometry().data_bytes_per_chunk;
        driver.write_chunk(1, 0, Some(&vec![0x42; sz]), None)?;
        let media = driver.media().clone();
        let mut driver2 = RamNandDriver::from_media(media);
        let mut back = vec![0u8; sz];
        driver2.read_chunk(1, 0, Some(&mut back), None)?;
        assert!(back.iter().all(|b| *b == 0x42));
        Ok(())
    }
}
