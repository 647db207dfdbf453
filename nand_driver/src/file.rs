use crate::{EccResult, NandDriver, NandGeometry, NandMedia, NandStats, RamNandDriver};
use anyhow::{Context, Result};
use log::*;
use std::fs;
use std::path::PathBuf;

/// Image-file backed NAND. The whole image is held in RAM behind a
/// `RamNandDriver` and written back on `flush`/drop, so program-once
/// semantics are enforced the same way in both drivers.
///
/// Image layout: all data pages, then all spare areas, then one bad-block
/// byte per block.
pub struct FileNandDriver {
    pub info: NandStats,
    path: PathBuf,
    inner: RamNandDriver,
}

impl FileNandDriver {
    pub fn new(path: &str, geom: NandGeometry) -> Result<Self> {
        let path = PathBuf::from(path);
        let media = match fs::read(&path) {
            Ok(image) => {
                info!("loading NAND image {} ({} bytes)", path.display(), image.len());
                Self::unpack(&geom, &image)
                    .with_context(|| format!("bad NAND image {}", path.display()))?
            }
            Err(_) => {
                info!("creating blank NAND image {}", path.display());
                NandMedia::new(geom)
            }
        };
        Ok(Self {
            info: NandStats::default(),
            path,
            inner: RamNandDriver::from_media(media),
        })
    }

    pub fn flush(&mut self) -> Result<()> {
        let image = Self::pack(self.inner.media());
        fs::write(&self.path, image)
            .with_context(|| format!("writing NAND image {}", self.path.display()))?;
        Ok(())
    }

    fn image_len(geom: &NandGeometry) -> usize {
        geom.total_chunks() * (geom.data_bytes_per_chunk + geom.spare_bytes_per_chunk)
            + geom.n_blocks
    }

    fn pack(media: &NandMedia) -> Vec<u8> {
        let mut image = Vec::with_capacity(Self::image_len(&media.geom));
        image.extend_from_slice(&media.data);
        image.extend_from_slice(&media.spare);
        image.extend(media.bad.iter().map(|b| if *b { 0u8 } else { 0xFFu8 }));
        image
    }

    fn unpack(geom: &NandGeometry, image: &[u8]) -> Result<NandMedia> {
        anyhow::ensure!(
            image.len() == Self::image_len(geom),
            "image is {} bytes, geometry wants {}",
            image.len(),
            Self::image_len(geom)
        );
        let mut media = NandMedia::new(geom.clone());
        let data_len = geom.total_chunks() * geom.data_bytes_per_chunk;
        let spare_len = geom.total_chunks() * geom.spare_bytes_per_chunk;
        media.data.copy_from_slice(&image[..data_len]);
        media
            .spare
            .copy_from_slice(&image[data_len..data_len + spare_len]);
        for (i, b) in image[data_len + spare_len..].iter().enumerate() {
            media.bad[i] = *b != 0xFF;
        }
        Ok(media)
    }
}

impl Drop for FileNandDriver {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!("NAND image flush failed: {:?}", e);
        }
    }
}

impl NandDriver for FileNandDriver {
    fn geometry(&self) -> &NandGeometry {
        self.inner.geometry()
    }

    fn write_chunk(
        &mut self,
        block: usize,
        chunk: usize,
        data: Option<&[u8]>,
        spare: Option<&[u8]>,
    ) -> Result<()> {
        self.info.write_cnt += 1;
        self.inner.write_chunk(block, chunk, data, spare)
    }

    fn read_chunk(
        &mut self,
        block: usize,
        chunk: usize,
        data: Option<&mut [u8]>,
        spare: Option<&mut [u8]>,
    ) -> Result<EccResult> {
        self.info.read_cnt += 1;
        self.inner.read_chunk(block, chunk, data, spare)
    }

    fn erase_block(&mut self, block: usize) -> Result<()> {
        self.info.erase_cnt += 1;
        self.inner.erase_block(block)
    }

    fn mark_bad(&mut self, block: usize) -> Result<()> {
        self.inner.mark_bad(block)
    }

    fn check_bad(&mut self, block: usize) -> Result<bool> {
        self.inner.check_bad(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver_tester;

    #[test]
    fn simple_test() -> Result<()> {
        let dir = std::env::temp_dir().join("lffs_file_driver_test.img");
        let _ = fs::remove_file(&dir);
        let mut driver = FileNandDriver::new(dir.to_str().unwrap(), NandGeometry::default())?;
        driver_tester(&mut driver)?;
        let _ = fs::remove_file(&dir);
        Ok(())
    }

    #[test]
    fn image_round_trip() -> Result<()> {
        let path = std::env::temp_dir().join("lffs_file_driver_rt.img");
        let _ = fs::remove_file(&path);
        let geom = NandGeometry::default();
        let sz = geom.data_bytes_per_chunk;
        {
            let mut driver = FileNandDriver::new(path.to_str().unwrap(), geom.clone())?;
            driver.write_chunk(3, 1, Some(&vec![0x17; sz]), None)?;
            driver.mark_bad(7)?;
            driver.flush()?;
        }
        let mut driver = FileNandDriver::new(path.to_str().unwrap(), geom)?;
        let mut back = vec![0u8; sz];
        driver.read_chunk(3, 1, Some(&mut back), None)?;
        assert!(back.iter().all(|b| *b == 0x17));
        assert!(driver.check_bad(7)?);
        let _ = fs::remove_file(&path);
        Ok(())
    }
}
