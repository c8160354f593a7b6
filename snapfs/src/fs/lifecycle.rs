use std::time::{SystemTime, UNIX_EPOCH};

use super::*;
use crate::err;

/// A non-deleted snapshot as reported by the listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
	pub name:    String,
	pub comment: String,
	pub date:    i64,
}

fn now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map_or(0, |d| d.as_secs() as i64)
}

/// Snapshot lifecycle: bootstrap, promotion, accept, soft-delete, listing.
impl Snapfs {
	/// Bootstrap the snapshot engine after mount: create `.snapshots/`, the
	/// config file and the root snapshot when absent, then install (or
	/// reuse) the working leaf named by the config.
	pub(crate) fn snap_init(&mut self) -> IoResult<()> {
		let root = self.root_id();
		let dir = match self.dir_lookup(root, SNAPDIR) {
			Ok(id) => id,
			Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
				log::info!("creating {SNAPDIR:?}");
				let id = self.dir_alloc(root)?;
				self.write_inode(id, &Inode::named(SNAPDIR, FTYPE_DIR))?;
				self.raw_flush(root)?;
				self.flush_inode(id)?;
				id
			}
			Err(e) => return Err(e),
		};
		self.set_snap_slot(SnapSlot::Dir, Some(dir))?;

		let cfg = match self.dir_lookup(dir, SNAPCFG) {
			Ok(id) => id,
			Err(_) => {
				log::info!("writing initial snapshot config");
				let id = self.create_in_snapdir(SNAPCFG)?;
				self.write_config_at(id, &SnapshotConfig::new(ROOTSNAP, ROOTSNAP))?;
				id
			}
		};
		self.set_snap_slot(SnapSlot::Cfg, Some(cfg))?;

		let rsnap = match self.dir_lookup(dir, ROOTSNAP) {
			Ok(id) => id,
			Err(_) => {
				log::info!("creating the root snapshot");
				let id = self.create_in_snapdir(ROOTSNAP)?;
				let ob = self.save_bitmap_copy()?;
				self.write_header(id, &SnapshotHeader::new(now(), None, ob))?;
				id
			}
		};
		self.set_snap_slot(SnapSlot::Root, Some(rsnap))?;

		let config = self.read_config()?;
		let cur_name = config.current().to_string();
		let cur = match self.dir_lookup(dir, &cur_name) {
			Ok(id) => id,
			Err(_) => {
				log::warn!("config names unknown snapshot {cur_name:?}, using the root snapshot");
				rsnap
			}
		};

		if self.inode_name(cur)? == TMPSNAP {
			log::debug!("reusing persisted working snapshot {cur}");
			self.set_snap_slot(SnapSlot::Current, Some(cur))?;
		} else {
			self.set_snap_slot(SnapSlot::Current, None)?;
			self.create_tmp_snapshot(cur)?;
		}
		Ok(())
	}

	fn create_in_snapdir(&mut self, name: &str) -> IoResult<InodeId> {
		let dir = self.snapdir()?;
		if self.dir_lookup(dir, name).is_ok() {
			return Err(err!(EEXIST));
		}
		let id = self.dir_alloc(dir)?;
		self.write_inode(id, &Inode::named(name, FTYPE_REG))?;
		self.raw_flush(dir)?;
		self.flush_inode(id)?;
		Ok(id)
	}

	/// One-block copy of the bitmap for the reserved `old_bitmap` field.
	fn save_bitmap_copy(&mut self) -> IoResult<u32> {
		let bno = self.alloc_block()?;
		let copy = self.store().block(2).to_vec();
		self.store_mut().block_mut(bno).copy_from_slice(&copy);
		self.store_mut().flush_block(bno)?;
		Ok(bno)
	}

	pub(crate) fn read_config(&self) -> IoResult<SnapshotConfig> {
		let cfg = self.snap_slot(SnapSlot::Cfg).ok_or(err!(EINVAL))?;
		let mut buf = [0u8; SNAPCFGSIZE];
		let n = self.raw_read(cfg, &mut buf, 0)?;
		if n < SNAPCFGSIZE {
			log::error!("snapshot config is truncated ({n} bytes)");
			return Err(err!(EINVAL));
		}
		codec::decode(&buf)
	}

	fn write_config(&mut self, config: &SnapshotConfig) -> IoResult<()> {
		let cfg = self.snap_slot(SnapSlot::Cfg).ok_or(err!(EINVAL))?;
		self.write_config_at(cfg, config)
	}

	fn write_config_at(&mut self, id: InodeId, config: &SnapshotConfig) -> IoResult<()> {
		let mut buf = [0u8; SNAPCFGSIZE];
		codec::encode(config, &mut buf)?;
		self.raw_write(id, &buf, 0)?;
		self.raw_flush(id)
	}

	/// Install a fresh working leaf under `parent` and make it current, both
	/// in the superblock slot and in the config.
	pub(crate) fn create_tmp_snapshot(&mut self, parent: InodeId) -> IoResult<()> {
		log::debug!("installing working snapshot under {parent}");

		if self.read_header(parent)?.children().count() >= MAXBRANCHES {
			log::warn!("snapshot {parent} already has {MAXBRANCHES} branches");
			return Err(err!(ENOSPC));
		}

		let id = self.create_in_snapdir(TMPSNAP)?;
		let ob = self.save_bitmap_copy()?;
		self.write_header(id, &SnapshotHeader::new(now(), Some(parent), ob))?;
		self.link_child(parent, id)?;

		self.set_snap_slot(SnapSlot::Current, Some(id))?;
		let mut config = self.read_config()?;
		config.set_current(TMPSNAP);
		self.write_config(&config)?;
		Ok(())
	}

	/// Promote the working snapshot into the named, persistent snapshot and
	/// install a fresh working leaf under it.
	pub fn create_snapshot(&mut self, name: &str, comment: &str) -> IoResult<()> {
		log::info!("creating snapshot {name:?}");

		if !name_is_legal(name) || name == TMPSNAP || comment.len() >= COMMENTLEN {
			return Err(err!(EINVAL));
		}
		if self.find_by_name(name)?.is_some() {
			return Err(err!(EEXIST));
		}
		let dir = self.snapdir()?;
		if self.dir_lookup(dir, name).is_ok() {
			return Err(err!(EEXIST));
		}

		let cur = self.current_snapshot().ok_or(err!(EINVAL))?;
		let mut hdr = self.read_header(cur)?;

		// every shadow rename must fit before anything is committed
		for m in hdr.modified() {
			let base_len = shadow_base(&self.inode_name(m)?).len();
			if base_len + 1 + name.len() >= MAXNAMELEN {
				return Err(err!(ENAMETOOLONG));
			}
		}

		let mut ino = self.read_inode(cur)?;
		ino.set_name(name);
		self.write_inode(cur, &ino)?;
		self.flush_inode(cur)?;

		hdr.date = now();
		hdr.set_comment(comment);
		self.write_header(cur, &hdr)?;

		for m in hdr.modified() {
			let mut mino = self.read_inode(m)?;
			let renamed = format!("{}{}{name}", shadow_base(mino.name()), SNAPSEP as char);
			mino.set_name(&renamed);
			self.write_inode(m, &mino)?;
			self.flush_inode(m)?;
		}

		self.create_tmp_snapshot(cur)
	}

	/// Restore the filesystem's observable state to the named snapshot:
	/// discard the working leaf, undo creations back to the root, restore
	/// the target chain's creations, and install a fresh working leaf under
	/// the target.
	pub fn accept_snapshot(&mut self, name: &str) -> IoResult<()> {
		log::info!("accepting snapshot {name:?}");

		let target = self.find_by_name(name)?.ok_or(err!(ENOENT))?;
		let cur = self.current_snapshot().ok_or(err!(EINVAL))?;
		let hdr = self.read_header(cur)?;
		let parent = hdr.prev_id().ok_or(err!(EINVAL))?;

		// discard the working leaf: every write since the last promotion
		for m in hdr.modified() {
			self.zero_inode(m)?;
		}
		for (i, c) in hdr.created() {
			if self.inode_name(c)? == hdr.created_name(i) {
				self.zero_inode(c)?;
			}
		}
		if hdr.old_bitmap != 0 {
			self.free_block(hdr.old_bitmap);
		}
		self.unlink_child(parent, cur)?;
		self.zero_inode(cur)?;
		self.set_snap_slot(SnapSlot::Current, None)?;

		// undo: files created on the abandoned path cease to exist
		let mut node = Some(parent);
		while let Some(id) = node {
			let mut h = self.read_header(id)?;
			let entries: Vec<(usize, InodeId)> = h.created().collect();
			for &(i, c) in &entries {
				if self.inode_name(c)? == h.created_name(i) {
					self.zero_inode(c)?;
				}
				h.created_files[i] = 0;
			}
			if !entries.is_empty() {
				self.write_header(id, &h)?;
			}
			node = h.prev_id();
		}

		// restore: walk root -> target re-creating the recorded names
		let mut chain = Vec::new();
		let mut node = Some(target);
		while let Some(id) = node {
			chain.push(id);
			node = self.read_header(id)?.prev_id();
		}
		for id in chain.into_iter().rev() {
			let mut h = self.read_header(id)?;
			let mut changed = false;
			for i in 0..MAXSNAPFILES {
				let cname = h.created_name(i).to_string();
				if cname.is_empty() {
					continue;
				}
				let live = match self.dir_lookup(self.root_id(), &cname) {
					Ok(f) => f,
					Err(_) => self.file_create(&cname)?,
				};
				if h.created_files[i] != live.raw() {
					h.created_files[i] = live.raw();
					changed = true;
				}
			}
			if changed {
				self.write_header(id, &h)?;
			}
		}

		self.create_tmp_snapshot(target)
	}

	/// Soft-delete: tombstone the header and mangle the snapshot's and its
	/// shadows' names with the creation date so the name can be reused. The
	/// node stays linked so mid-tree deletes do not break chains.
	pub fn delete_snapshot(&mut self, name: &str) -> IoResult<()> {
		log::info!("deleting snapshot {name:?}");

		let id = self.find_by_name(name)?.ok_or(err!(ENOENT))?;
		if id == self.root_snapshot()? {
			return Err(err!(EINVAL));
		}

		let mut hdr = self.read_header(id)?;
		let stamp = hdr.date.to_string();

		if name.len() + 1 + stamp.len() >= MAXNAMELEN {
			return Err(err!(ENAMETOOLONG));
		}
		for m in hdr.modified() {
			if self.inode_name(m)?.len() + 1 + stamp.len() >= MAXNAMELEN {
				return Err(err!(ENAMETOOLONG));
			}
		}

		hdr.is_deleted = true;
		self.write_header(id, &hdr)?;

		let mut ino = self.read_inode(id)?;
		ino.set_name(&format!("{name}{}{stamp}", SNAPSEP as char));
		self.write_inode(id, &ino)?;
		self.flush_inode(id)?;

		for m in hdr.modified() {
			let mut mino = self.read_inode(m)?;
			let renamed = format!("{}{}{stamp}", mino.name(), SNAPSEP as char);
			mino.set_name(&renamed);
			self.write_inode(m, &mino)?;
			self.flush_inode(m)?;
		}
		Ok(())
	}

	/// Every non-deleted snapshot except the working leaf, preorder.
	pub fn snapshot_list(&self) -> IoResult<Vec<SnapshotEntry>> {
		let current = self.current_snapshot();
		let mut out = Vec::new();

		for id in self.walk_snapshots()? {
			if Some(id) == current {
				continue;
			}
			let hdr = self.read_header(id)?;
			if hdr.is_deleted {
				continue;
			}
			out.push(SnapshotEntry {
				name:    self.inode_name(id)?,
				comment: hdr.comment().to_string(),
				date:    hdr.date,
			});
		}
		Ok(out)
	}
}

#[cfg(test)]
mod t {
	use super::*;
	use crate::fs::test_harness;

	fn read_at(fs: &Snapfs, path: &str, n: usize) -> Vec<u8> {
		let f = fs.open_path(path).unwrap();
		let mut buf = vec![0u8; n];
		let got = fs.read(f, &mut buf, 0).unwrap();
		buf.truncate(got);
		buf
	}

	fn write_at(fs: &mut Snapfs, path: &str, data: &[u8]) {
		let f = match fs.open_path(path) {
			Ok(f) => f,
			Err(_) => fs.create_file(path).unwrap(),
		};
		fs.set_size(f, 0).unwrap();
		fs.write(f, data, 0).unwrap();
	}

	#[test]
	fn bootstrap_installs_a_working_leaf() {
		let (_f, fs) = test_harness(64);

		let cur = fs.current_snapshot().unwrap();
		assert_eq!(fs.inode_name(cur).unwrap(), TMPSNAP);

		let root = fs.root_snapshot().unwrap();
		let hdr = fs.read_header(root).unwrap();
		assert_eq!(hdr.prev_id(), None);
		assert_eq!(hdr.children().collect::<Vec<_>>(), vec![cur]);

		assert_eq!(fs.read_config().unwrap().current(), TMPSNAP);
	}

	#[test]
	fn remount_reuses_the_working_leaf() {
		let f = tempfile::NamedTempFile::new().unwrap();
		Snapfs::format(f.path(), 64).unwrap();

		let mut fs = Snapfs::open(f.path()).unwrap();
		write_at(&mut fs, "keep", b"k");
		fs.fs_sync().unwrap();
		let cur = fs.current_snapshot().unwrap();
		drop(fs);

		let fs = Snapfs::open(f.path()).unwrap();
		assert_eq!(fs.current_snapshot(), Some(cur));
		assert_eq!(read_at(&fs, "keep", 8), b"k");
	}

	#[test]
	fn create_then_accept_restores_content() {
		// E1/E2: two snapshots of the same file, accepted in both orders
		let (_f, mut fs) = test_harness(128);

		write_at(&mut fs, "test", b"1\0");
		fs.create_snapshot("first", "comment1").unwrap();
		write_at(&mut fs, "test", b"2\0");
		fs.create_snapshot("second", "comment2").unwrap();

		fs.accept_snapshot("first").unwrap();
		assert_eq!(read_at(&fs, "test", 2), b"1\0");

		fs.accept_snapshot("second").unwrap();
		assert_eq!(read_at(&fs, "test", 2), b"2\0");
	}

	#[test]
	fn linear_history_rolls_back_and_forward() {
		// E3
		let (_f, mut fs) = test_harness(128);

		write_at(&mut fs, "a", b"A");
		fs.create_snapshot("s1", "").unwrap();
		write_at(&mut fs, "a", b"B");
		fs.create_snapshot("s2", "").unwrap();
		write_at(&mut fs, "a", b"C");
		fs.create_snapshot("s3", "").unwrap();

		fs.accept_snapshot("s1").unwrap();
		assert_eq!(read_at(&fs, "a", 1), b"A");

		fs.accept_snapshot("s3").unwrap();
		assert_eq!(read_at(&fs, "a", 1), b"C");
	}

	#[test]
	fn branches_diverge_and_switch() {
		// E4: a second branch forked off s1
		let (_f, mut fs) = test_harness(128);

		write_at(&mut fs, "a", b"A");
		fs.create_snapshot("s1", "").unwrap();
		write_at(&mut fs, "a", b"B");
		fs.create_snapshot("s2", "").unwrap();

		fs.accept_snapshot("s1").unwrap();
		write_at(&mut fs, "a", b"Z");
		fs.create_snapshot("s1b", "").unwrap();

		let s1 = fs.find_by_name("s1").unwrap().unwrap();
		let hdr = fs.read_header(s1).unwrap();
		let kids: Vec<String> = hdr
			.children()
			.map(|k| fs.inode_name(k).unwrap())
			.collect();
		assert!(kids.contains(&"s2".to_string()));
		assert!(kids.contains(&"s1b".to_string()));

		assert_eq!(read_at(&fs, "a", 1), b"Z");
		fs.accept_snapshot("s2").unwrap();
		assert_eq!(read_at(&fs, "a", 1), b"B");
	}

	#[test]
	fn deleted_names_can_be_reused() {
		// E5
		let (_f, mut fs) = test_harness(128);
		fs.create_snapshot("x", "").unwrap();
		fs.delete_snapshot("x").unwrap();
		fs.create_snapshot("x", "").unwrap();

		let names: Vec<_> = fs
			.snapshot_list()
			.unwrap()
			.into_iter()
			.map(|e| e.name)
			.collect();
		assert_eq!(names.iter().filter(|n| *n == "x").count(), 1);
	}

	#[test]
	fn duplicate_snapshot_name_is_eexist() {
		let (_f, mut fs) = test_harness(128);
		fs.create_snapshot("x", "").unwrap();
		let e = fs.create_snapshot("x", "").unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::EEXIST));
	}

	#[test]
	fn bad_snapshot_names_are_rejected() {
		let (_f, mut fs) = test_harness(128);
		for bad in ["", "a@b", "a/b", TMPSNAP] {
			let e = fs.create_snapshot(bad, "").unwrap_err();
			assert_eq!(e.raw_os_error(), Some(libc::EINVAL), "{bad:?}");
		}
	}

	#[test]
	fn accept_of_unknown_name_is_enoent() {
		let (_f, mut fs) = test_harness(128);
		let e = fs.accept_snapshot("ghost").unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::ENOENT));
	}

	#[test]
	fn the_root_snapshot_cannot_be_deleted() {
		let (_f, mut fs) = test_harness(128);
		let e = fs.delete_snapshot(ROOTSNAP).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::EINVAL));
	}

	#[test]
	fn promotion_renames_shadow_suffixes() {
		let (_f, mut fs) = test_harness(128);
		write_at(&mut fs, "motd", b"hi");
		fs.create_snapshot("v1", "").unwrap();

		let dir = fs.snapdir().unwrap();
		let shadow = format!("motd{}v1", SNAPSEP as char);
		fs.dir_lookup(dir, &shadow).unwrap();
	}

	#[test]
	fn accept_undoes_and_restores_creations() {
		let (_f, mut fs) = test_harness(128);

		fs.create_snapshot("s1", "").unwrap();
		write_at(&mut fs, "b", b"bb");
		fs.create_snapshot("s2", "").unwrap();

		fs.accept_snapshot("s1").unwrap();
		assert!(fs.open_path("b").is_err());

		fs.accept_snapshot("s2").unwrap();
		assert_eq!(read_at(&fs, "b", 2), b"bb");
	}

	#[test]
	fn accept_discards_uncommitted_writes() {
		// spec property 6 round-trip
		let (_f, mut fs) = test_harness(128);

		write_at(&mut fs, "f", b"old");
		fs.create_snapshot("n", "").unwrap();
		write_at(&mut fs, "f", b"new");

		fs.accept_snapshot("n").unwrap();
		assert_eq!(read_at(&fs, "f", 3), b"old");
	}

	#[test]
	fn deletion_keeps_ancestor_shadows_resolvable() {
		let (_f, mut fs) = test_harness(128);

		write_at(&mut fs, "a", b"A");
		fs.create_snapshot("s1", "").unwrap();
		write_at(&mut fs, "a", b"B");
		fs.create_snapshot("s2", "").unwrap();

		fs.delete_snapshot("s1").unwrap();
		// the live view still resolves through s2's shadow
		assert_eq!(read_at(&fs, "a", 1), b"B");
		// and the listing hides the tombstone
		let names: Vec<_> = fs
			.snapshot_list()
			.unwrap()
			.into_iter()
			.map(|e| e.name)
			.collect();
		assert!(!names.contains(&"s1".to_string()));
		assert!(names.contains(&"s2".to_string()));
	}

	#[test]
	fn listing_skips_the_working_leaf() {
		let (_f, fs) = test_harness(64);
		let names: Vec<_> = fs
			.snapshot_list()
			.unwrap()
			.into_iter()
			.map(|e| e.name)
			.collect();
		assert_eq!(names, vec![ROOTSNAP.to_string()]);
	}

	#[test]
	fn branch_limit_is_enospc() {
		let (_f, mut fs) = test_harness(512);
		fs.create_snapshot("base", "").unwrap();

		let mut last = Ok(());
		for i in 0..MAXBRANCHES {
			last = fs
				.accept_snapshot("base")
				.and_then(|_| fs.create_snapshot(&format!("b{i}"), ""));
			if last.is_err() {
				break;
			}
		}
		let e = last.and_then(|_| fs.accept_snapshot("base")).unwrap_err();
		assert_eq!(e.raw_os_error(), Some(libc::ENOSPC));
	}
}
