use std::{
	io::{Error as IoError, ErrorKind, Result as IoResult},
	path::Path,
};

mod balloc;
mod cow;
mod dir;
mod fsck;
mod graph;
mod inode;
mod lifecycle;

pub use dir::name_is_legal;
pub use lifecycle::SnapshotEntry;

use crate::{blockstore::BlockStore, codec, data::*};

/// (INTERNAL) Constructs an [`std::io::Error`] from an `errno`.
#[macro_export]
macro_rules! err {
	($name:ident) => {
		::std::io::Error::from_raw_os_error(libc::$name)
	};
}

macro_rules! iobail {
	($kind:expr, $($tk:tt)+) => {
		return Err(IoError::new($kind, format!($($tk)+)))
	};
}

/// Summary of filesystem statistics.
#[derive(Debug, Clone)]
#[doc(alias = "Statfs")]
pub struct Info {
	/// Number of blocks.
	pub blocks: u64,

	/// Number of free blocks.
	pub bfree: u64,

	/// Block size.
	pub bsize: u32,
}

/// The four snapshot slots trailing the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SnapSlot {
	Root    = 0,
	Dir     = 1,
	Cfg     = 2,
	Current = 3,
}

/// Block filesystem with branching copy-on-write snapshots.
#[derive(Debug)]
pub struct Snapfs {
	store:   BlockStore,
	nblocks: u32,
}

impl Snapfs {
	/// Mount the image at `path`: validate the superblock and bitmap, then
	/// bootstrap the snapshot engine.
	pub fn open(path: &Path) -> IoResult<Self> {
		let store = BlockStore::open(path)?;
		let mut s = Self {
			nblocks: store.nblocks(),
			store,
		};
		s.check()?;
		s.snap_init()?;
		Ok(s)
	}

	/// Build a fresh filesystem image: superblock, bitmap and an empty root
	/// directory. Snapshot structures are created at first mount.
	pub fn format(path: &Path, nblocks: u32) -> IoResult<()> {
		let nbitblocks = (nblocks as usize).div_ceil(BLKBITSIZE) as u32;
		if nblocks < 2 + nbitblocks + 6 {
			iobail!(ErrorKind::InvalidInput, "{nblocks} blocks is too small");
		}

		let mut store = BlockStore::create(path, nblocks)?;

		let sb = Superblock {
			magic: FS_MAGIC,
			nblocks,
			root: Inode::named("/", FTYPE_DIR),
			root_snapshot_file: 0,
			snapshot_dir: 0,
			snapshot_config_file: 0,
			current_snapshot_file: 0,
		};
		codec::encode(&sb, store.block_mut(1))?;

		// Everything starts free, then the reserved blocks -- 0, the
		// superblock and the bitmap itself -- are marked in-use. Bits past
		// nblocks stay in-use so they can never be allocated.
		for i in 0..nbitblocks {
			store.block_mut(2 + i).fill(0xff);
		}
		let mut reserve = |bno: u32| {
			let blk = store.block_mut(2 + bno / BLKBITSIZE as u32);
			let bit = bno as usize % BLKBITSIZE;
			blk[bit / 8] &= !(1 << (bit % 8));
		};
		reserve(0);
		reserve(1);
		for i in 0..nbitblocks {
			reserve(2 + i);
		}
		for bno in nblocks..nbitblocks * BLKBITSIZE as u32 {
			reserve(bno);
		}

		store.sync()?;
		log::info!("formatted {path:?}: {nblocks} blocks, {nbitblocks} bitmap blocks");
		Ok(())
	}

	/// Mount-time validation. A corrupt superblock fails the mount with EIO
	/// and the server exits; it never panics. Reserved-bitmap violations
	/// still panic, as does freeing block 0.
	fn check(&mut self) -> IoResult<()> {
		let sb = self.super_block()?;

		macro_rules! sbassert {
			($e:expr) => {
				if !($e) {
					log::error!("superblock corrupted: {}", stringify!($e));
					return Err(err!(EIO));
				}
			};
		}

		sbassert!(sb.magic == FS_MAGIC);
		sbassert!(sb.nblocks == self.nblocks);
		sbassert!(sb.root.is_dir());
		sbassert!(sb.root.size as usize % BLKSIZE == 0);

		self.check_bitmap();

		log::info!("Summary:");
		log::info!("Block Size: {BLKSIZE}");
		log::info!("# Blocks: {}", sb.nblocks);
		log::info!("# Bitmap Blocks: {}", self.nbitblocks());
		log::info!("# Free Blocks: {}", self.count_free_blocks());
		Ok(())
	}

	pub(crate) fn super_block(&self) -> IoResult<Superblock> {
		codec::decode(self.store.block(1))
	}

	pub(crate) fn nbitblocks(&self) -> u32 {
		(self.nblocks as usize).div_ceil(BLKBITSIZE) as u32
	}

	/// Id of the root directory inode embedded in the superblock.
	pub(crate) fn root_id(&self) -> InodeId {
		InodeId::new(1, SB_ROOT_OFF)
	}

	pub(crate) fn store(&self) -> &BlockStore {
		&self.store
	}

	pub(crate) fn store_mut(&mut self) -> &mut BlockStore {
		&mut self.store
	}

	pub(crate) fn snap_slot(&self, slot: SnapSlot) -> Option<InodeId> {
		let off = SB_SLOTS_OFF + 8 * slot as usize;
		let raw = u64::from_le_bytes(self.store.block(1)[off..off + 8].try_into().unwrap());
		InodeId::from_raw(raw)
	}

	pub(crate) fn set_snap_slot(&mut self, slot: SnapSlot, id: Option<InodeId>) -> IoResult<()> {
		let off = SB_SLOTS_OFF + 8 * slot as usize;
		let raw = id.map_or(0, InodeId::raw);
		self.store.block_mut(1)[off..off + 8].copy_from_slice(&raw.to_le_bytes());
		self.store.flush_block(1)
	}

	/// Get filesystem metadata.
	#[doc(alias("statfs", "statvfs"))]
	pub fn info(&self) -> Info {
		Info {
			blocks: self.nblocks as u64,
			bfree:  self.count_free_blocks(),
			bsize:  BLKSIZE as u32,
		}
	}

	pub fn free_bytes(&self) -> u64 {
		self.count_free_blocks() * BLKSIZE as u64
	}

	pub fn busy_bytes(&self) -> u64 {
		(self.nblocks as u64 - 1 - self.count_free_blocks()) * BLKSIZE as u64
	}

	/// Sync the entire filesystem. A big hammer.
	pub fn fs_sync(&mut self) -> IoResult<()> {
		log::debug!("fs_sync()");
		self.store.sync()
	}
}

#[cfg(test)]
pub(crate) fn test_harness(nblocks: u32) -> (tempfile::NamedTempFile, Snapfs) {
	let f = tempfile::NamedTempFile::new().unwrap();
	Snapfs::format(f.path(), nblocks).unwrap();
	let fs = Snapfs::open(f.path()).unwrap();
	(f, fs)
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn format_and_mount() {
		let (_f, fs) = test_harness(64);
		let info = fs.info();
		assert_eq!(info.blocks, 64);
		assert_eq!(info.bsize, BLKSIZE as u32);
		assert!(info.bfree > 0);
	}

	#[test]
	fn corrupt_superblock_fails_the_mount() {
		let f = tempfile::NamedTempFile::new().unwrap();
		Snapfs::format(f.path(), 64).unwrap();

		let mut store = BlockStore::open(f.path()).unwrap();
		store.block_mut(1)[0] ^= 0xff;
		store.flush_block(1).unwrap();

		// refused with an error, not a panic
		let e = Snapfs::open(f.path()).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::EIO));
	}

	#[test]
	fn format_rejects_tiny_disks() {
		let f = tempfile::NamedTempFile::new().unwrap();
		assert!(Snapfs::format(f.path(), 4).is_err());
	}

	#[test]
	fn df_accounting() {
		let (_f, fs) = test_harness(64);
		assert_eq!(
			fs.free_bytes() + fs.busy_bytes(),
			(64 - 1) * BLKSIZE as u64
		);
	}
}
