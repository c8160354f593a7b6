use super::*;
use crate::err;

/// Free-block bitmap, one bit per block: 1 = free, 0 = in use.
impl Snapfs {
	pub fn block_is_free(&self, bno: u32) -> bool {
		if bno == 0 || bno >= self.nblocks {
			return false;
		}
		let blk = self.store().block(2 + bno / BLKBITSIZE as u32);
		let bit = bno as usize % BLKBITSIZE;
		blk[bit / 8] & (1 << (bit % 8)) != 0
	}

	fn set_free(&mut self, bno: u32, free: bool) {
		let blk = self.store_mut().block_mut(2 + bno / BLKBITSIZE as u32);
		let bit = bno as usize % BLKBITSIZE;
		if free {
			blk[bit / 8] |= 1 << (bit % 8);
		} else {
			blk[bit / 8] &= !(1 << (bit % 8));
		}
	}

	/// Allocate the first free block and immediately flush the bitmap block
	/// holding its bit.
	pub(crate) fn alloc_block(&mut self) -> IoResult<u32> {
		for bno in 1..self.nblocks {
			if self.block_is_free(bno) {
				self.set_free(bno, false);
				self.store_mut().flush_block(2 + bno / BLKBITSIZE as u32)?;
				log::trace!("alloc_block() = {bno}");
				return Ok(bno);
			}
		}

		log::warn!("alloc_block(): out of blocks");
		Err(err!(ENOSPC))
	}

	/// Mark `bno` free. Does not flush.
	pub(crate) fn free_block(&mut self, bno: u32) {
		if bno == 0 {
			panic!("attempt to free the zero block");
		}
		if self.block_is_free(bno) {
			panic!("freeing free block {bno}");
		}
		log::trace!("free_block({bno})");
		self.set_free(bno, true);
	}

	/// All reserved blocks -- 0, the superblock and the bitmap blocks
	/// themselves -- must be marked in-use.
	pub(crate) fn check_bitmap(&self) {
		assert!(!self.block_is_free(0), "block 0 marked free");
		assert!(!self.block_is_free(1), "superblock marked free");
		for i in 0..self.nbitblocks() {
			assert!(!self.block_is_free(2 + i), "bitmap block {} marked free", 2 + i);
		}
		log::debug!("bitmap is good");
	}

	pub(crate) fn count_free_blocks(&self) -> u64 {
		(1..self.nblocks).filter(|&b| self.block_is_free(b)).count() as u64
	}
}
