use std::{
	fs::{File, OpenOptions},
	io::{Error, ErrorKind, Result as IoResult},
	os::unix::fs::FileExt,
	path::Path,
};

use crate::data::BLKSIZE;

/// Block-level window over the disk image.
///
/// The whole image is held in memory; `block_mut` marks the containing block
/// dirty and `flush_block` is the only path that writes a block back to the
/// backing file.
#[derive(Debug)]
pub struct BlockStore {
	file:    File,
	buf:     Vec<u8>,
	dirty:   Vec<bool>,
	nblocks: u32,
}

impl BlockStore {
	pub fn open(path: &Path) -> IoResult<Self> {
		let file = OpenOptions::new().read(true).write(true).open(path)?;
		let len = file.metadata()?.len() as usize;
		if len == 0 || len % BLKSIZE != 0 {
			return Err(Error::new(
				ErrorKind::InvalidInput,
				format!("image size {len} is not a positive multiple of {BLKSIZE}"),
			));
		}

		let mut buf = vec![0u8; len];
		file.read_exact_at(&mut buf, 0)?;

		let nblocks = (len / BLKSIZE) as u32;
		Ok(Self {
			file,
			buf,
			dirty: vec![false; nblocks as usize],
			nblocks,
		})
	}

	/// Build a zeroed image of `nblocks` blocks, replacing `path`.
	pub fn create(path: &Path, nblocks: u32) -> IoResult<Self> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(true)
			.open(path)?;
		let len = nblocks as usize * BLKSIZE;
		file.set_len(len as u64)?;

		Ok(Self {
			file,
			buf: vec![0u8; len],
			dirty: vec![false; nblocks as usize],
			nblocks,
		})
	}

	pub fn nblocks(&self) -> u32 {
		self.nblocks
	}

	pub fn block(&self, bno: u32) -> &[u8] {
		assert!(bno < self.nblocks, "block {bno} out of range");
		let off = bno as usize * BLKSIZE;
		&self.buf[off..off + BLKSIZE]
	}

	pub fn block_mut(&mut self, bno: u32) -> &mut [u8] {
		assert!(bno < self.nblocks, "block {bno} out of range");
		self.dirty[bno as usize] = true;
		let off = bno as usize * BLKSIZE;
		&mut self.buf[off..off + BLKSIZE]
	}

	/// Write `bno` back to the backing file. A no-op for clean blocks.
	pub fn flush_block(&mut self, bno: u32) -> IoResult<()> {
		assert!(bno < self.nblocks, "block {bno} out of range");
		if !self.dirty[bno as usize] {
			return Ok(());
		}

		let off = bno as usize * BLKSIZE;
		self.file.write_all_at(&self.buf[off..off + BLKSIZE], off as u64)?;
		self.dirty[bno as usize] = false;
		Ok(())
	}

	/// Flush every block in [1, nblocks). The big hammer.
	pub fn sync(&mut self) -> IoResult<()> {
		for bno in 1..self.nblocks {
			self.flush_block(bno)?;
		}
		Ok(())
	}

	#[cfg(test)]
	pub(crate) fn is_dirty(&self, bno: u32) -> bool {
		self.dirty[bno as usize]
	}
}

#[cfg(test)]
mod t {
	use super::*;

	const NBLOCKS: u32 = 16;

	fn harness() -> (tempfile::NamedTempFile, BlockStore) {
		let f = tempfile::NamedTempFile::new().unwrap();
		let bs = BlockStore::create(f.path(), NBLOCKS).unwrap();
		(f, bs)
	}

	#[test]
	fn flush_persists() {
		let (f, mut bs) = harness();
		bs.block_mut(3).fill(0x5a);
		bs.flush_block(3).unwrap();

		let bs2 = BlockStore::open(f.path()).unwrap();
		assert_eq!(bs2.nblocks(), NBLOCKS);
		assert!(bs2.block(3).iter().all(|&b| b == 0x5a));
		assert!(bs2.block(4).iter().all(|&b| b == 0));
	}

	#[test]
	fn unflushed_writes_stay_in_memory() {
		let (f, mut bs) = harness();
		bs.block_mut(2).fill(0x11);
		assert!(bs.is_dirty(2));

		let bs2 = BlockStore::open(f.path()).unwrap();
		assert!(bs2.block(2).iter().all(|&b| b == 0));
	}

	#[test]
	fn sync_flushes_everything() {
		let (f, mut bs) = harness();
		bs.block_mut(1).fill(1);
		bs.block_mut(7).fill(7);
		bs.sync().unwrap();
		assert!(!bs.is_dirty(1));
		assert!(!bs.is_dirty(7));

		let bs2 = BlockStore::open(f.path()).unwrap();
		assert!(bs2.block(7).iter().all(|&b| b == 7));
	}

	#[test]
	#[should_panic]
	fn out_of_range_panics() {
		let (_f, bs) = harness();
		bs.block(NBLOCKS);
	}
}
