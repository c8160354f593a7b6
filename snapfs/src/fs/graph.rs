use std::collections::HashSet;

use super::*;
use crate::err;

/// The snapshot graph: a tree of header files under `.snapshots/`, linked by
/// `prev`/`next[]` inode ids, rooted at the permanent root snapshot. All
/// traversal is over ids; nothing here follows memory addresses.
impl Snapfs {
	pub(crate) fn read_header(&self, id: InodeId) -> IoResult<SnapshotHeader> {
		let mut buf = [0u8; SNAPHDRSIZE];
		let n = self.raw_read(id, &mut buf, 0)?;
		if n < SNAPHDRSIZE {
			log::error!("snapshot header at {id} is truncated ({n} bytes)");
			return Err(err!(EINVAL));
		}
		codec::decode(&buf)
	}

	pub(crate) fn write_header(&mut self, id: InodeId, hdr: &SnapshotHeader) -> IoResult<()> {
		let mut buf = [0u8; SNAPHDRSIZE];
		codec::encode(hdr, &mut buf)?;
		self.raw_write(id, &buf, 0)?;
		self.raw_flush(id)
	}

	pub(crate) fn root_snapshot(&self) -> IoResult<InodeId> {
		self.snap_slot(SnapSlot::Root).ok_or(err!(EINVAL))
	}

	pub(crate) fn current_snapshot(&self) -> Option<InodeId> {
		self.snap_slot(SnapSlot::Current)
	}

	pub(crate) fn snapdir(&self) -> IoResult<InodeId> {
		self.snap_slot(SnapSlot::Dir).ok_or(err!(ENOENT))
	}

	/// Every snapshot in the graph, preorder from the root. A node seen
	/// twice means the graph is corrupt.
	pub(crate) fn walk_snapshots(&self) -> IoResult<Vec<InodeId>> {
		let mut out = Vec::new();
		let mut seen = HashSet::new();
		let mut stack = vec![self.root_snapshot()?];

		while let Some(id) = stack.pop() {
			if !seen.insert(id) {
				log::error!("snapshot graph cycle through {id}");
				return Err(err!(EINVAL));
			}
			out.push(id);

			let hdr = self.read_header(id)?;
			let kids: Vec<_> = hdr.children().collect();
			for kid in kids.into_iter().rev() {
				stack.push(kid);
			}
		}

		Ok(out)
	}

	/// Find a snapshot by exact name. Deleted nodes and the working leaf
	/// never match (their children are still searched).
	pub(crate) fn find_by_name(&self, name: &str) -> IoResult<Option<InodeId>> {
		let current = self.current_snapshot();
		for id in self.walk_snapshots()? {
			if Some(id) == current {
				continue;
			}
			if self.read_header(id)?.is_deleted {
				continue;
			}
			if self.inode_name(id)? == name {
				return Ok(Some(id));
			}
		}
		Ok(None)
	}

	pub(crate) fn link_child(&mut self, parent: InodeId, child: InodeId) -> IoResult<()> {
		let mut hdr = self.read_header(parent)?;
		if !hdr.push_child(child) {
			log::warn!("snapshot {parent} already has {MAXBRANCHES} branches");
			return Err(err!(ENOSPC));
		}
		self.write_header(parent, &hdr)
	}

	pub(crate) fn unlink_child(&mut self, parent: InodeId, child: InodeId) -> IoResult<()> {
		let mut hdr = self.read_header(parent)?;
		if !hdr.remove_child(child) {
			log::warn!("unlink_child({parent}, {child}): not a child");
		}
		self.write_header(parent, &hdr)
	}
}
