use std::{fmt, num::NonZeroU64};

use bincode::{
	de::Decoder,
	enc::Encoder,
	error::{DecodeError, EncodeError},
	Decode, Encode,
};

/// Bytes per filesystem block, same as the page size.
pub const BLKSIZE: usize = 4096;

/// Number of blocks described by a single bitmap block.
pub const BLKBITSIZE: usize = BLKSIZE * 8;

/// Maximum length of a file name (a single path component), including NUL.
pub const MAXNAMELEN: usize = 128;

/// Maximum length of a complete path.
pub const MAXPATHLEN: usize = 1024;

/// Number of direct block pointers in an inode.
pub const NDIRECT: usize = 10;

/// Number of block pointers in an indirect block.
pub const NINDIRECT: usize = BLKSIZE / 4;

/// Largest file the direct+indirect scheme can address.
pub const MAXFILESIZE: u32 = ((NDIRECT + NINDIRECT) * BLKSIZE) as u32;

/// Size of an on-disk inode record.
pub const INOSZ: usize = 256;

/// Inode records per block.
pub const BLKINODES: usize = BLKSIZE / INOSZ;

/// Superblock magic number.
pub const FS_MAGIC: u32 = 0x534e_4150;

/// Regular file.
pub const FTYPE_REG: u32 = 0;

/// Directory.
pub const FTYPE_DIR: u32 = 1;

/// Name of the snapshot directory in the root directory.
pub const SNAPDIR: &str = ".snapshots";

/// Name of the snapshot config file inside [`SNAPDIR`].
pub const SNAPCFG: &str = "cfg";

/// Name of the permanent root snapshot.
pub const ROOTSNAP: &str = "root_snapshot";

/// Placeholder name of the working snapshot between promotions.
pub const TMPSNAP: &str = "tmp_snapshot";

/// Separator between the original file name and the snapshot name inside a
/// shadow's name. Forbidden in user file names and snapshot names.
pub const SNAPSEP: u8 = b'@';

/// Maximum number of children a snapshot may have.
pub const MAXBRANCHES: usize = 10;

/// Maximum number of shadow / created-file records per snapshot.
pub const MAXSNAPFILES: usize = 10;

/// Maximum length of a snapshot name or comment in a request.
pub const MAX_SH_LENGTH: usize = 256;

/// Length of the comment field in a snapshot header.
pub const COMMENTLEN: usize = 256;

/// Encoded size of [`SnapshotHeader`].
pub const SNAPHDRSIZE: usize = 8 + COMMENTLEN + 1 + 4 + 8
	+ 8 * MAXBRANCHES
	+ 8 * MAXSNAPFILES
	+ 8 * MAXSNAPFILES
	+ MAXNAMELEN * MAXSNAPFILES;

/// Encoded size of [`SnapshotConfig`].
pub const SNAPCFGSIZE: usize = 2 * MAXNAMELEN;

/// Byte offset of the root directory inode inside the superblock.
pub const SB_ROOT_OFF: u32 = 8;

/// Byte offset of the first snapshot slot inside the superblock.
pub(crate) const SB_SLOTS_OFF: usize = 8 + INOSZ;

/// Disk-stable identifier of an inode record: the block number and the byte
/// offset of the record inside that block, packed into a `u64`. The all-zero
/// value is the null id, so headers can store `Option<InodeId>` as a plain
/// word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeId(NonZeroU64);

impl InodeId {
	pub fn new(blk: u32, off: u32) -> Self {
		assert!(blk != 0, "inode in the null block");
		assert!((off as usize) < BLKSIZE);
		Self(NonZeroU64::new((blk as u64) << 32 | off as u64).unwrap())
	}

	pub fn from_raw(raw: u64) -> Option<Self> {
		NonZeroU64::new(raw).map(Self)
	}

	pub fn raw(self) -> u64 {
		self.0.get()
	}

	pub fn blk(self) -> u32 {
		(self.0.get() >> 32) as u32
	}

	pub fn off(self) -> u32 {
		self.0.get() as u32
	}
}

impl fmt::Display for InodeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}+{}", self.blk(), self.off())
	}
}

impl fmt::Debug for InodeId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "InodeId({}+{})", self.blk(), self.off())
	}
}

/// The part of a shadow's name before the separator, i.e. the name of the
/// live file it shadows. Names without a separator are returned whole.
pub(crate) fn shadow_base(name: &str) -> &str {
	match name.find(SNAPSEP as char) {
		Some(i) => &name[..i],
		None => name,
	}
}

/// NUL-terminate `s` into a fixed name field.
pub(crate) fn pack_name<const N: usize>(s: &str) -> [u8; N] {
	let b = s.as_bytes();
	assert!(b.len() < N, "name too long: {s:?}");
	let mut out = [0u8; N];
	out[..b.len()].copy_from_slice(b);
	out
}

/// The string stored in a fixed name field, up to the first NUL.
pub(crate) fn unpack_name(b: &[u8]) -> &str {
	let len = b.iter().position(|&c| c == 0).unwrap_or(b.len());
	std::str::from_utf8(&b[..len]).unwrap_or("")
}

/// On-disk file record, fixed 256 bytes. An inode owns its data blocks; the
/// indirect block owns the data blocks it references.
#[derive(Debug, Clone)]
pub struct Inode {
	pub name:     [u8; MAXNAMELEN],
	pub size:     u32,
	pub ftype:    u32,
	pub direct:   [u32; NDIRECT],
	pub indirect: u32,
}

const INOPAD: usize = INOSZ - MAXNAMELEN - 8 - 4 * NDIRECT - 4;

impl Inode {
	pub fn empty() -> Self {
		Self {
			name:     [0; MAXNAMELEN],
			size:     0,
			ftype:    FTYPE_REG,
			direct:   [0; NDIRECT],
			indirect: 0,
		}
	}

	pub fn named(name: &str, ftype: u32) -> Self {
		let mut ino = Self::empty();
		ino.set_name(name);
		ino.ftype = ftype;
		ino
	}

	pub fn name(&self) -> &str {
		unpack_name(&self.name)
	}

	pub fn set_name(&mut self, name: &str) {
		self.name = pack_name(name);
	}

	pub fn is_dir(&self) -> bool {
		self.ftype == FTYPE_DIR
	}
}

impl Encode for Inode {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.name.encode(e)?;
		self.size.encode(e)?;
		self.ftype.encode(e)?;
		self.direct.encode(e)?;
		self.indirect.encode(e)?;
		[0u8; INOPAD].encode(e)
	}
}

impl<Context> Decode<Context> for Inode {
	fn decode<D: Decoder<Context = Context>>(d: &mut D) -> Result<Self, DecodeError> {
		let name = <[u8; MAXNAMELEN]>::decode(d)?;
		let size = u32::decode(d)?;
		let ftype = u32::decode(d)?;
		let direct = <[u32; NDIRECT]>::decode(d)?;
		let indirect = u32::decode(d)?;
		let _pad = <[u8; INOPAD]>::decode(d)?;

		Ok(Self {
			name,
			size,
			ftype,
			direct,
			indirect,
		})
	}
}

bincode::impl_borrow_decode!(Inode);

/// On-disk superblock, block 1. The root directory inode is embedded in
/// place; the four trailing slots form the snapshot engine's persistent
/// entry vector and are reached only through the typed accessor on the
/// filesystem handle.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Superblock {
	pub magic:   u32,
	pub nblocks: u32,
	pub root:    Inode,

	pub root_snapshot_file:   u64,
	pub snapshot_dir:         u64,
	pub snapshot_config_file: u64,
	pub current_snapshot_file: u64,
}

/// Header at offset 0 of every snapshot file under `.snapshots/`.
///
/// All link fields hold [`InodeId`] words (0 = absent). `old_bitmap` is a
/// reserved field: the blockno of a one-block copy of the bitmap taken at
/// creation time, written but never consulted.
#[derive(Clone, Encode, Decode)]
pub struct SnapshotHeader {
	pub date:       i64,
	pub comment:    [u8; COMMENTLEN],
	pub is_deleted: bool,
	pub old_bitmap: u32,

	pub prev: u64,
	pub next: [u64; MAXBRANCHES],

	pub modified_files: [u64; MAXSNAPFILES],
	pub created_files:  [u64; MAXSNAPFILES],
	pub created_names:  [[u8; MAXNAMELEN]; MAXSNAPFILES],
}

impl SnapshotHeader {
	pub fn new(date: i64, prev: Option<InodeId>, old_bitmap: u32) -> Self {
		Self {
			date,
			comment: [0; COMMENTLEN],
			is_deleted: false,
			old_bitmap,
			prev: prev.map_or(0, InodeId::raw),
			next: [0; MAXBRANCHES],
			modified_files: [0; MAXSNAPFILES],
			created_files: [0; MAXSNAPFILES],
			created_names: [[0; MAXNAMELEN]; MAXSNAPFILES],
		}
	}

	pub fn comment(&self) -> &str {
		unpack_name(&self.comment)
	}

	pub fn set_comment(&mut self, comment: &str) {
		self.comment = pack_name(comment);
	}

	pub fn prev_id(&self) -> Option<InodeId> {
		InodeId::from_raw(self.prev)
	}

	pub fn children(&self) -> impl Iterator<Item = InodeId> + '_ {
		self.next.iter().filter_map(|&w| InodeId::from_raw(w))
	}

	pub fn modified(&self) -> impl Iterator<Item = InodeId> + '_ {
		self.modified_files.iter().filter_map(|&w| InodeId::from_raw(w))
	}

	pub fn created(&self) -> impl Iterator<Item = (usize, InodeId)> + '_ {
		self.created_files
			.iter()
			.enumerate()
			.filter_map(|(i, &w)| InodeId::from_raw(w).map(|id| (i, id)))
	}

	pub fn created_name(&self, i: usize) -> &str {
		unpack_name(&self.created_names[i])
	}

	pub fn push_child(&mut self, id: InodeId) -> bool {
		push(&mut self.next, id)
	}

	pub fn remove_child(&mut self, id: InodeId) -> bool {
		remove(&mut self.next, id)
	}

	pub fn push_modified(&mut self, id: InodeId) -> bool {
		push(&mut self.modified_files, id)
	}

	pub fn remove_modified(&mut self, id: InodeId) -> bool {
		remove(&mut self.modified_files, id)
	}

	pub fn modified_full(&self) -> bool {
		self.modified_files.iter().all(|&w| w != 0)
	}

	pub fn push_created(&mut self, id: InodeId, name: &str) -> bool {
		for i in 0..MAXSNAPFILES {
			if self.created_files[i] == 0 && self.created_names[i][0] == 0 {
				self.created_files[i] = id.raw();
				self.created_names[i] = pack_name(name);
				return true;
			}
		}
		false
	}

	pub fn remove_created(&mut self, id: InodeId) -> bool {
		for i in 0..MAXSNAPFILES {
			if self.created_files[i] == id.raw() {
				self.created_files[i] = 0;
				self.created_names[i] = [0; MAXNAMELEN];
				return true;
			}
		}
		false
	}
}

fn push(slots: &mut [u64], id: InodeId) -> bool {
	for w in slots.iter_mut() {
		if *w == 0 {
			*w = id.raw();
			return true;
		}
	}
	false
}

fn remove(slots: &mut [u64], id: InodeId) -> bool {
	for w in slots.iter_mut() {
		if *w == id.raw() {
			*w = 0;
			return true;
		}
	}
	false
}

/// Content of `.snapshots/cfg`: the durable identity of the root and
/// working snapshots across mount cycles.
#[derive(Clone, Encode, Decode)]
pub struct SnapshotConfig {
	pub root_snapshot_name:    [u8; MAXNAMELEN],
	pub current_snapshot_name: [u8; MAXNAMELEN],
}

impl SnapshotConfig {
	pub fn new(root: &str, current: &str) -> Self {
		Self {
			root_snapshot_name:    pack_name(root),
			current_snapshot_name: pack_name(current),
		}
	}

	pub fn current(&self) -> &str {
		unpack_name(&self.current_snapshot_name)
	}

	pub fn set_current(&mut self, name: &str) {
		self.current_snapshot_name = pack_name(name);
	}
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::codec;

	#[test]
	fn encoded_sizes() {
		let mut buf = [0u8; 2 * BLKSIZE];

		let n = codec::encode(&Inode::empty(), &mut buf).unwrap();
		assert_eq!(n, INOSZ);

		let n = codec::encode(&SnapshotHeader::new(0, None, 0), &mut buf).unwrap();
		assert_eq!(n, SNAPHDRSIZE);

		let n = codec::encode(&SnapshotConfig::new(ROOTSNAP, ROOTSNAP), &mut buf).unwrap();
		assert_eq!(n, SNAPCFGSIZE);

		let sb = Superblock {
			magic: FS_MAGIC,
			nblocks: 0,
			root: Inode::empty(),
			root_snapshot_file: 0,
			snapshot_dir: 0,
			snapshot_config_file: 0,
			current_snapshot_file: 0,
		};
		let n = codec::encode(&sb, &mut buf).unwrap();
		assert_eq!(n, SB_SLOTS_OFF + 32);
	}

	#[test]
	fn inode_roundtrip() {
		let mut ino = Inode::named("motd", FTYPE_REG);
		ino.size = 17;
		ino.direct[0] = 42;
		ino.indirect = 99;

		let mut buf = [0u8; INOSZ];
		codec::encode(&ino, &mut buf).unwrap();
		let back: Inode = codec::decode(&buf).unwrap();

		assert_eq!(back.name(), "motd");
		assert_eq!(back.size, 17);
		assert_eq!(back.direct[0], 42);
		assert_eq!(back.indirect, 99);
	}

	#[test]
	fn inode_id_packing() {
		let id = InodeId::new(7, 512);
		assert_eq!(id.blk(), 7);
		assert_eq!(id.off(), 512);
		assert_eq!(InodeId::from_raw(id.raw()), Some(id));
		assert_eq!(InodeId::from_raw(0), None);
	}

	#[test]
	fn shadow_base_prefix() {
		assert_eq!(shadow_base("motd@first"), "motd");
		assert_eq!(shadow_base("motd@first@17"), "motd");
		assert_eq!(shadow_base("motd"), "motd");
	}

	#[test]
	fn header_slots() {
		let mut hdr = SnapshotHeader::new(1, None, 0);
		let a = InodeId::new(3, 0);
		let b = InodeId::new(3, 256);

		assert!(hdr.push_child(a));
		assert!(hdr.push_child(b));
		assert_eq!(hdr.children().collect::<Vec<_>>(), vec![a, b]);
		assert!(hdr.remove_child(a));
		assert_eq!(hdr.children().collect::<Vec<_>>(), vec![b]);

		assert!(hdr.push_created(a, "x"));
		assert_eq!(hdr.created_name(0), "x");
		assert!(hdr.remove_created(a));
		assert_eq!(hdr.created_name(0), "");
	}
}
