use super::*;
use crate::err;

/// The copy-on-write resolver. Every client read or write of a live file is
/// redirected to the shadow appropriate for the current working snapshot; a
/// shadow is materialised by a full file copy on the first write under a
/// snapshot.
impl Snapfs {
	/// The shadow of `file_name` recorded on `snap`, if any. Shadow names
	/// are matched on the part before the separator.
	fn shadow_on(&self, snap: InodeId, file_name: &str) -> IoResult<Option<InodeId>> {
		let hdr = self.read_header(snap)?;
		for m in hdr.modified() {
			if shadow_base(&self.inode_name(m)?) == file_name {
				return Ok(Some(m));
			}
		}
		Ok(None)
	}

	/// Walk the chain working -> root; the first shadow found on the way
	/// shadows the live file. Falls back to the live inode. Never allocates.
	pub(crate) fn resolve_for_read(&self, f: InodeId) -> IoResult<InodeId> {
		let ino = self.read_inode(f)?;
		if ino.is_dir() {
			return Ok(f);
		}

		let name = ino.name().to_string();
		let mut snap = self.current_snapshot();
		while let Some(id) = snap {
			if let Some(m) = self.shadow_on(id, &name)? {
				log::trace!("resolve_for_read({f}): shadow {m} on {id}");
				return Ok(m);
			}
			snap = self.read_header(id)?.prev_id();
		}

		Ok(f)
	}

	/// Like [`Self::resolve_for_read`], but a shadow further up the chain is
	/// a read-only ancestor: writes must land on a shadow owned by the
	/// working snapshot, materialising one if needed.
	pub(crate) fn resolve_for_write(&mut self, f: InodeId) -> IoResult<InodeId> {
		let ino = self.read_inode(f)?;
		if ino.is_dir() {
			return Ok(f);
		}

		let Some(cur) = self.current_snapshot() else {
			return Ok(f);
		};
		let name = ino.name().to_string();
		if let Some(m) = self.shadow_on(cur, &name)? {
			return Ok(m);
		}

		let src = self.resolve_for_read(f)?;
		self.create_and_copy(src, &name, cur)
	}

	/// Materialise the shadow of `name` on `snap`, copying every byte from
	/// `src`. The `modified_files[]` append is the last step, after the copy
	/// completes; a failed copy is unwound so no partial shadow remains.
	fn create_and_copy(&mut self, src: InodeId, name: &str, snap: InodeId) -> IoResult<InodeId> {
		let snap_name = self.inode_name(snap)?;
		let shadow = format!("{name}{}{snap_name}", SNAPSEP as char);
		if shadow.len() >= MAXNAMELEN {
			return Err(err!(ENAMETOOLONG));
		}

		let dir = self.snapdir()?;
		if self.dir_lookup(dir, &shadow).is_ok() {
			log::error!("create_and_copy: shadow {shadow:?} already exists");
			return Err(err!(EEXIST));
		}

		let mut hdr = self.read_header(snap)?;
		if hdr.modified_full() {
			log::warn!("snapshot {snap} already tracks {MAXSNAPFILES} shadows");
			return Err(err!(ENOSPC));
		}

		let dst = self.dir_alloc(dir)?;
		self.write_inode(dst, &Inode::named(&shadow, FTYPE_REG))?;

		if let Err(e) = self.copy_contents(src, dst) {
			let _ = self.raw_set_size(dst, 0);
			let _ = self.write_inode(dst, &Inode::empty());
			let _ = self.flush_inode(dst);
			return Err(e);
		}
		self.raw_flush(dst)?;
		self.raw_flush(dir)?;

		hdr.push_modified(dst);
		self.write_header(snap, &hdr)?;
		log::debug!("create_and_copy({name:?}): shadow {dst} ({shadow:?}) on {snap}");
		Ok(dst)
	}

	fn copy_contents(&mut self, src: InodeId, dst: InodeId) -> IoResult<()> {
		let size = self.read_inode(src)?.size;
		self.raw_set_size(dst, size)?;

		let mut buf = vec![0u8; BLKSIZE];
		let mut pos = 0;
		while pos < size {
			let n = self.raw_read(src, &mut buf, pos)?;
			self.raw_write(dst, &buf[..n], pos)?;
			pos += n as u32;
		}
		Ok(())
	}

	/// Read from the live file `f` through the resolver.
	pub fn read(&self, f: InodeId, buf: &mut [u8], offset: u32) -> IoResult<usize> {
		let target = self.resolve_for_read(f)?;
		self.raw_read(target, buf, offset)
	}

	/// Read without resolving: the identity path used for the read-only view
	/// of snapshot internals.
	pub fn read_raw(&self, f: InodeId, buf: &mut [u8], offset: u32) -> IoResult<usize> {
		self.raw_read(f, buf, offset)
	}

	/// Write to the live file `f` through the resolver.
	pub fn write(&mut self, f: InodeId, buf: &[u8], offset: u32) -> IoResult<usize> {
		let target = self.resolve_for_write(f)?;
		self.raw_write(target, buf, offset)
	}

	/// Truncate or extend the live file `f` through the resolver.
	pub fn set_size(&mut self, f: InodeId, size: u32) -> IoResult<()> {
		let target = self.resolve_for_write(f)?;
		self.raw_set_size(target, size)
	}

	/// Flush the resolved target of the live file `f`.
	pub fn flush(&mut self, f: InodeId) -> IoResult<()> {
		let target = self.resolve_for_read(f)?;
		self.raw_flush(target)
	}

	/// Live name, resolved size, directory flag.
	pub fn stat(&self, f: InodeId) -> IoResult<(String, u32, bool)> {
		let ino = self.read_inode(f)?;
		let target = self.resolve_for_read(f)?;
		let size = self.read_inode(target)?.size;
		Ok((ino.name().to_string(), size, ino.is_dir()))
	}

	/// Open the live file at `path`.
	pub fn open_path(&self, path: &str) -> IoResult<InodeId> {
		self.file_open(path)
	}

	/// Create a live file de novo, recording it (with its name) in the
	/// working snapshot so accept can undo and restore the creation.
	pub fn create_file(&mut self, path: &str) -> IoResult<InodeId> {
		let id = self.file_create(path)?;

		if let Some(cur) = self.current_snapshot() {
			let name = self.inode_name(id)?;
			let mut hdr = self.read_header(cur)?;
			if !hdr.push_created(id, &name) {
				log::warn!("snapshot {cur} already tracks {MAXSNAPFILES} creations");
				let _ = self.zero_inode(id);
				return Err(err!(ENOSPC));
			}
			self.write_header(cur, &hdr)?;
		}

		Ok(id)
	}

	/// Remove the live file at `path`, dropping the working snapshot's
	/// bookkeeping for it. Shadows held by ancestor snapshots stay in place.
	pub fn remove_file(&mut self, path: &str) -> IoResult<()> {
		let (_, file, _) = self.walk_path(path)?;
		let Some(f) = file else {
			return Err(err!(ENOENT));
		};
		let ino = self.read_inode(f)?;
		if ino.is_dir() {
			return Err(err!(EINVAL));
		}

		if let Some(cur) = self.current_snapshot() {
			let mut hdr = self.read_header(cur)?;
			let mut changed = false;
			if let Some(m) = self.shadow_on(cur, ino.name())? {
				self.zero_inode(m)?;
				hdr.remove_modified(m);
				changed = true;
			}
			if hdr.remove_created(f) {
				changed = true;
			}
			if changed {
				self.write_header(cur, &hdr)?;
			}
		}

		self.zero_inode(f)?;
		log::debug!("remove_file({path:?})");
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::fs::test_harness;

	fn read_str(fs: &Snapfs, f: InodeId, n: usize) -> Vec<u8> {
		let mut buf = vec![0u8; n];
		let got = fs.read(f, &mut buf, 0).unwrap();
		buf.truncate(got);
		buf
	}

	#[test]
	fn writes_never_touch_the_live_inode() {
		let (_f, mut fs) = test_harness(64);
		let f = fs.create_file("test").unwrap();
		fs.write(f, b"hello", 0).unwrap();

		assert_eq!(fs.read_inode(f).unwrap().size, 0);
		assert_eq!(read_str(&fs, f, 16), b"hello");
	}

	#[test]
	fn shadow_is_named_after_the_working_snapshot() {
		let (_f, mut fs) = test_harness(64);
		let f = fs.create_file("test").unwrap();
		fs.write(f, b"x", 0).unwrap();

		let dir = fs.snapdir().unwrap();
		let shadow = format!("test{}{TMPSNAP}", SNAPSEP as char);
		fs.dir_lookup(dir, &shadow).unwrap();
	}

	#[test]
	fn stat_reports_the_resolved_size() {
		let (_f, mut fs) = test_harness(64);
		let f = fs.create_file("test").unwrap();
		fs.write(f, b"abc", 0).unwrap();

		let (name, size, isdir) = fs.stat(f).unwrap();
		assert_eq!(name, "test");
		assert_eq!(size, 3);
		assert!(!isdir);
	}

	#[test]
	fn full_disk_leaves_no_partial_shadow() {
		let (_f, mut fs) = test_harness(32);
		let f = fs.create_file("test").unwrap();
		fs.write(f, b"seed", 0).unwrap();
		fs.create_snapshot("s1", "").unwrap();

		// eat the remaining free blocks, so materialising a new shadow from
		// the s1 copy cannot complete
		while fs.alloc_block().is_ok() {}

		let e = fs.write(f, b"doomed", 0).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::ENOSPC));

		let cur = fs.current_snapshot().unwrap();
		let hdr = fs.read_header(cur).unwrap();
		assert_eq!(hdr.modified().count(), 0);

		// the abandoned shadow is not lingering in the snapshot directory
		let dir = fs.snapdir().unwrap();
		let shadow = format!("test{}{TMPSNAP}", SNAPSEP as char);
		assert!(fs.dir_lookup(dir, &shadow).is_err());
	}

	#[test]
	fn removing_a_file_drops_its_working_bookkeeping() {
		let (_f, mut fs) = test_harness(64);
		let f = fs.create_file("test").unwrap();
		fs.write(f, b"x", 0).unwrap();
		fs.remove_file("test").unwrap();

		let cur = fs.current_snapshot().unwrap();
		let hdr = fs.read_header(cur).unwrap();
		assert_eq!(hdr.modified().count(), 0);
		assert_eq!(hdr.created().count(), 0);
		assert!(fs.open_path("test").is_err());
	}
}
