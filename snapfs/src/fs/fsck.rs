use std::collections::HashMap;

use super::*;
use crate::err;

const BS: u32 = BLKSIZE as u32;

/// Whole-filesystem consistency check, run by the test suite after operation
/// sequences: every bitmap bit matches reachability, the snapshot graph is a
/// coherent tree, and every shadow belongs to exactly one snapshot.
impl Snapfs {
	pub fn fsck(&self) -> IoResult<()> {
		self.check_block_references()?;
		self.check_graph()?;
		self.check_shadows()
	}

	/// A block is free iff nothing reachable references it: inode direct
	/// slots, indirect blocks and their entries, and the reserved
	/// `old_bitmap` copies. Double references fail too.
	fn check_block_references(&self) -> IoResult<()> {
		let n = self.nblocks as usize;
		let mut used = vec![false; n];
		used[0] = true;
		used[1] = true;
		for i in 0..self.nbitblocks() as usize {
			used[2 + i] = true;
		}

		let mut claim = |bno: u32, what: &str| -> IoResult<()> {
			let i = bno as usize;
			if i == 0 || i >= n {
				log::error!("fsck: {what} references invalid block {bno}");
				return Err(err!(EINVAL));
			}
			if used[i] {
				log::error!("fsck: block {bno} referenced twice ({what})");
				return Err(err!(EINVAL));
			}
			used[i] = true;
			Ok(())
		};

		let mut inodes = vec![self.root_id()];
		inodes.extend(self.dir_entries(self.root_id())?);
		if let Ok(snapdir) = self.snapdir() {
			inodes.extend(self.dir_entries(snapdir)?);
		}

		for id in inodes {
			let ino = self.read_inode(id)?;
			let what = ino.name().to_string();
			for filebno in 0..ino.size.div_ceil(BS) {
				if let Some(bno) = self.find_block(id, filebno)? {
					claim(bno, &what)?;
				}
			}
			if ino.indirect != 0 {
				claim(ino.indirect, &what)?;
			}
		}

		for id in self.walk_snapshots()? {
			let hdr = self.read_header(id)?;
			if hdr.old_bitmap != 0 {
				claim(hdr.old_bitmap, "old_bitmap")?;
			}
		}

		for bno in 1..self.nblocks {
			if self.block_is_free(bno) == used[bno as usize] {
				log::error!(
					"fsck: block {bno} is {} but {}",
					if used[bno as usize] { "referenced" } else { "unreferenced" },
					if self.block_is_free(bno) { "free" } else { "in use" },
				);
				return Err(err!(EINVAL));
			}
		}
		Ok(())
	}

	/// Finite acyclic parent chains; every node appears in its parent's
	/// `next[]`; the working leaf has no children and no tombstone.
	fn check_graph(&self) -> IoResult<()> {
		let root = self.root_snapshot()?;
		for id in self.walk_snapshots()? {
			let hdr = self.read_header(id)?;
			match hdr.prev_id() {
				None => {
					if id != root {
						log::error!("fsck: snapshot {id} has no parent but is not the root");
						return Err(err!(EINVAL));
					}
				}
				Some(parent) => {
					let phdr = self.read_header(parent)?;
					if !phdr.children().any(|k| k == id) {
						log::error!("fsck: snapshot {id} missing from next[] of {parent}");
						return Err(err!(EINVAL));
					}
				}
			}
		}

		if let Some(cur) = self.current_snapshot() {
			let hdr = self.read_header(cur)?;
			if hdr.children().count() != 0 || hdr.is_deleted {
				log::error!("fsck: working snapshot {cur} is not a live leaf");
				return Err(err!(EINVAL));
			}
		}
		Ok(())
	}

	/// Every shadow is tracked by exactly one snapshot, parses as
	/// `<base><SEP><suffix>`, and its base names a file some ancestor of the
	/// owner (or the live tree) knows about.
	fn check_shadows(&self) -> IoResult<()> {
		let mut owners: HashMap<InodeId, InodeId> = HashMap::new();

		for id in self.walk_snapshots()? {
			let hdr = self.read_header(id)?;
			for m in hdr.modified() {
				if let Some(prev) = owners.insert(m, id) {
					log::error!("fsck: shadow {m} tracked by both {prev} and {id}");
					return Err(err!(EINVAL));
				}

				let name = self.inode_name(m)?;
				let base = shadow_base(&name);
				if base.len() == name.len() {
					log::error!("fsck: shadow {m} has unparsable name {name:?}");
					return Err(err!(EINVAL));
				}

				if !self.ancestry_knows_file(id, base)? {
					log::error!("fsck: shadow {name:?} has no originating file");
					return Err(err!(EINVAL));
				}
			}
		}
		Ok(())
	}

	fn ancestry_knows_file(&self, snap: InodeId, base: &str) -> IoResult<bool> {
		if self.dir_lookup(self.root_id(), base).is_ok() {
			return Ok(true);
		}
		let mut node = Some(snap);
		while let Some(id) = node {
			let hdr = self.read_header(id)?;
			for i in 0..MAXSNAPFILES {
				if hdr.created_name(i) == base {
					return Ok(true);
				}
			}
			node = hdr.prev_id();
		}
		Ok(false)
	}
}
