//! Out-of-place write allocator: chunks are handed out sequentially within a
//! single open erase block; a fresh block is opened when it fills.

use crate::lffs_lib::desc::BlockState;
use crate::lffs_lib::types::{FsError, FsResult, PhysChunk};
use crate::lffs_lib::Lffs;
use log::*;
use nand_driver::NandDriver;

impl<T: NandDriver> Lffs<T> {
    /// Blocks that must stay erased: the caller-visible reserve plus room
    /// for a checkpoint.
    pub(crate) fn reserve_blocks_needed(&self) -> usize {
        self.opts.n_reserved_blocks + self.calc_checkpt_blocks_required()
    }

    /// Reserve policy over the free-chunk account. GC and deletion writes
    /// bypass it so that reclaiming space can never be blocked by the lack
    /// of the very space it reclaims.
    pub(crate) fn check_alloc_available(&self, n_chunks: usize) -> bool {
        let reserved = (self.reserve_blocks_needed() * self.chunks_per_block) as i64;
        self.n_free_chunks - reserved >= n_chunks as i64
    }

    fn find_alloc_block(&mut self) -> Option<usize> {
        let n = self.n_blocks;
        for i in 0..n {
            let block = (self.alloc_finder + i) % n;
            if self.blocks.get_block_info(block).state == BlockState::Empty {
                self.alloc_finder = (block + 1) % n;
                self.seq_number += 1;
                let seq = self.seq_number;
                let info = self.blocks.get_block_info_mut(block);
                info.state = BlockState::Allocating;
                info.seq_number = seq;
                self.n_erased_blocks = self.n_erased_blocks.saturating_sub(1);
                debug!("block {} now allocating, seq {}", block, seq);
                return Some(block);
            }
        }
        None
    }

    /// Hand out the next sequential chunk. At most one block is ever in the
    /// Allocating state.
    pub(crate) fn alloc_chunk(&mut self, use_reserve: bool) -> FsResult<PhysChunk> {
        if !use_reserve && !self.check_alloc_available(1) {
            return Err(FsError::NoSpace);
        }
        if self.alloc_block.is_none() {
            self.alloc_block = self.find_alloc_block();
            self.alloc_page = 0;
        }
        let Some(block) = self.alloc_block else {
            return Err(FsError::NoSpace);
        };
        let chunk = self.join_chunk(block, self.alloc_page);
        self.blocks.set_chunk_bit(block, self.alloc_page);
        self.blocks.get_block_info_mut(block).pages_in_use += 1;
        self.n_free_chunks -= 1;
        self.alloc_page += 1;
        if self.alloc_page == self.chunks_per_block {
            self.blocks.set_state(block, BlockState::Full);
            self.alloc_block = None;
            self.alloc_page = 0;
        }
        Ok(chunk)
    }

    /// Close the current block without programming its remaining chunks.
    /// Used after a failed write or erase check so that no partial block
    /// straddles a confirmed-bad programming event.
    pub(crate) fn skip_rest_of_block(&mut self) {
        if let Some(block) = self.alloc_block.take() {
            debug!("skipping rest of block {}", block);
            self.blocks.set_state(block, BlockState::Full);
            self.alloc_page = 0;
            if self.blocks.get_block_info(block).pages_in_use == 0 {
                self.block_became_dirty(block);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::lffs_lib::desc::BlockState;
    use crate::lffs_lib::test_support::*;
    use crate::lffs_lib::types::FsError;

    #[test]
    fn chunks_come_out_sequentially() {
        let mut dev = small_device();
        let a = dev.alloc_chunk(false).unwrap();
        let b = dev.alloc_chunk(false).unwrap();
        assert_eq!(b, a + 1);
        let (block, _) = dev.split_chunk(a);
        assert_eq!(dev.blocks.get_block_info(block).state, BlockState::Allocating);
        assert_eq!(dev.blocks.get_block_info(block).pages_in_use, 2);
        assert!(dev.blocks.check_chunk_bit(block, 0));
    }

    #[test]
    fn exactly_one_allocating_block() {
        let mut dev = small_device();
        // fill more than one block
        for _ in 0..40 {
            dev.alloc_chunk(false).unwrap();
        }
        let allocating = (0..16)
            .filter(|b| dev.blocks.get_block_info(*b).state == BlockState::Allocating)
            .count();
        assert_eq!(allocating, 1);
    }

    #[test]
    fn full_block_has_lower_seq_than_current() {
        let mut dev = small_device();
        for _ in 0..33 {
            dev.alloc_chunk(false).unwrap();
        }
        let full: Vec<usize> = (0..16)
            .filter(|b| dev.blocks.get_block_info(*b).state == BlockState::Full)
            .collect();
        let allocating: Vec<usize> = (0..16)
            .filter(|b| dev.blocks.get_block_info(*b).state == BlockState::Allocating)
            .collect();
        assert_eq!(full.len(), 1);
        assert_eq!(allocating.len(), 1);
        assert!(
            dev.blocks.get_block_info(full[0]).seq_number
                < dev.blocks.get_block_info(allocating[0]).seq_number
        );
    }

    #[test]
    fn reserve_refuses_without_flag() {
        let mut dev = small_device();
        dev.gc_disable = true;
        let mut allocated = 0usize;
        loop {
            match dev.alloc_chunk(false) {
                Ok(_) => allocated += 1,
                Err(FsError::NoSpace) => break,
                Err(e) => panic!("unexpected error {:?}", e),
            }
            assert!(allocated <= 16 * 32, "allocator never refused");
        }
        // the reserve is still intact for privileged callers
        assert!(dev.alloc_chunk(true).is_ok());
        assert!(dev.n_erased_blocks > 0 || dev.alloc_block.is_some());
    }

    #[test]
    fn skip_rest_promotes_to_full() {
        let mut dev = small_device();
        let chunk = dev.alloc_chunk(false).unwrap();
        let (block, _) = dev.split_chunk(chunk);
        dev.skip_rest_of_block();
        assert_eq!(dev.blocks.get_block_info(block).state, BlockState::Full);
        // next allocation opens a different block
        let next = dev.alloc_chunk(false).unwrap();
        let (next_block, _) = dev.split_chunk(next);
        assert_ne!(block, next_block);
    }
}
