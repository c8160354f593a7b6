mod blockstore;
mod codec;
mod data;
mod fs;

pub mod client;
pub mod proto;

pub use crate::{
	blockstore::BlockStore,
	data::{
		InodeId, BLKSIZE, MAXNAMELEN, MAXPATHLEN, MAX_SH_LENGTH, ROOTSNAP, SNAPDIR, SNAPSEP,
		TMPSNAP,
	},
	fs::{name_is_legal, Info, Snapfs, SnapshotEntry},
};
