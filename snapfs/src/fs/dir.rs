use super::*;
use crate::err;

const BS: u32 = BLKSIZE as u32;

/// A name a client may use for a file or a snapshot: a single non-empty
/// component without slashes, NULs or the shadow separator.
pub fn name_is_legal(name: &str) -> bool {
	let b = name.as_bytes();
	!b.is_empty()
		&& b.len() < MAXNAMELEN
		&& !b.contains(&b'/')
		&& !b.contains(&0)
		&& !b.contains(&SNAPSEP)
}

/// A directory is a regular inode whose content is an array of inode
/// records; a record whose name starts with NUL is a free slot.
impl Snapfs {
	fn slot_name<'a>(&'a self, bno: u32, off: usize) -> &'a str {
		unpack_name(&self.store().block(bno)[off..off + MAXNAMELEN])
	}

	/// Find the record named `name` in `dir`.
	pub(crate) fn dir_lookup(&self, dir: InodeId, name: &str) -> IoResult<InodeId> {
		log::trace!("dir_lookup({dir}, {name:?});");
		let dino = self.read_inode(dir)?;
		if !dino.is_dir() {
			return Err(err!(ENOENT));
		}
		assert_eq!(dino.size % BS, 0, "directory size not block-aligned");

		for filebno in 0..dino.size / BS {
			let Some(bno) = self.find_block(dir, filebno)? else {
				continue;
			};
			for j in 0..BLKINODES {
				let off = j * INOSZ;
				if self.slot_name(bno, off) == name {
					return Ok(InodeId::new(bno, off as u32));
				}
			}
		}

		Err(err!(ENOENT))
	}

	/// Every allocated record in `dir`, in slot order.
	pub(crate) fn dir_entries(&self, dir: InodeId) -> IoResult<Vec<InodeId>> {
		let dino = self.read_inode(dir)?;
		assert_eq!(dino.size % BS, 0, "directory size not block-aligned");

		let mut out = Vec::new();
		for filebno in 0..dino.size / BS {
			let Some(bno) = self.find_block(dir, filebno)? else {
				continue;
			};
			for j in 0..BLKINODES {
				let off = j * INOSZ;
				if !self.slot_name(bno, off).is_empty() {
					out.push(InodeId::new(bno, off as u32));
				}
			}
		}
		Ok(out)
	}

	/// First free record in `dir`, extending the directory by one block when
	/// every slot is taken. The caller fills in the record.
	pub(crate) fn dir_alloc(&mut self, dir: InodeId) -> IoResult<InodeId> {
		let dino = self.read_inode(dir)?;
		assert_eq!(dino.size % BS, 0, "directory size not block-aligned");

		for filebno in 0..dino.size / BS {
			let bno = self.get_block(dir, filebno)?;
			for j in 0..BLKINODES {
				let off = j * INOSZ;
				if self.slot_name(bno, off).is_empty() {
					return Ok(InodeId::new(bno, off as u32));
				}
			}
		}

		let nblock = dino.size / BS;
		self.raw_set_size(dir, dino.size + BS)?;
		let bno = self.get_block(dir, nblock)?;
		Ok(InodeId::new(bno, 0))
	}

	/// Resolve a slash-delimited path from the root directory.
	///
	/// Returns the enclosing directory and the file; when only the final
	/// component is missing the file is `None` and the component is returned
	/// for creation.
	pub(crate) fn walk_path(&self, path: &str) -> IoResult<(InodeId, Option<InodeId>, String)> {
		log::trace!("walk_path({path:?});");
		if path.len() >= MAXPATHLEN {
			return Err(err!(ENAMETOOLONG));
		}

		let comps: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
		let mut dir = self.root_id();
		let mut file = self.root_id();
		let mut last = String::new();

		for (i, comp) in comps.iter().enumerate() {
			if comp.len() >= MAXNAMELEN {
				return Err(err!(ENAMETOOLONG));
			}
			if !self.read_inode(file)?.is_dir() {
				return Err(err!(ENOENT));
			}
			dir = file;
			last = comp.to_string();

			match self.dir_lookup(dir, comp) {
				Ok(id) => file = id,
				Err(e) if e.raw_os_error() == Some(libc::ENOENT) && i == comps.len() - 1 => {
					return Ok((dir, None, last));
				}
				Err(e) => return Err(e),
			}
		}

		Ok((dir, Some(file), last))
	}

	/// Create the regular file at `path`.
	pub(crate) fn file_create(&mut self, path: &str) -> IoResult<InodeId> {
		let (dir, file, name) = self.walk_path(path)?;
		if file.is_some() {
			return Err(err!(EEXIST));
		}

		let id = self.dir_alloc(dir)?;
		self.write_inode(id, &Inode::named(&name, FTYPE_REG))?;
		self.raw_flush(dir)?;
		self.flush_inode(id)?;
		log::debug!("file_create({path:?}) = {id}");
		Ok(id)
	}

	/// Open the file at `path`.
	pub(crate) fn file_open(&self, path: &str) -> IoResult<InodeId> {
		let (_, file, _) = self.walk_path(path)?;
		file.ok_or(err!(ENOENT))
	}
}
