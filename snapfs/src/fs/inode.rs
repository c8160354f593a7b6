use super::*;
use crate::err;

const BS: u32 = BLKSIZE as u32;

/// Where the disk-block slot for a file block lives.
#[derive(Debug, Clone, Copy)]
enum BlockSlot {
	Direct(usize),
	Indirect(usize),
}

fn block_slot(filebno: u32) -> IoResult<BlockSlot> {
	let n = filebno as usize;
	if n < NDIRECT {
		Ok(BlockSlot::Direct(n))
	} else if n < NDIRECT + NINDIRECT {
		Ok(BlockSlot::Indirect(n - NDIRECT))
	} else {
		Err(err!(EINVAL))
	}
}

fn pslot(blk: &[u8], i: usize) -> u32 {
	u32::from_le_bytes(blk[i * 4..i * 4 + 4].try_into().unwrap())
}

/// Raw, shadow-unaware inode operations. Client-facing reads and writes
/// reach this code through the copy-on-write resolver.
impl Snapfs {
	pub(crate) fn read_inode(&self, id: InodeId) -> IoResult<Inode> {
		let off = id.off() as usize;
		if id.blk() >= self.nblocks || off + INOSZ > BLKSIZE {
			return Err(err!(EINVAL));
		}
		codec::decode(&self.store().block(id.blk())[off..off + INOSZ])
	}

	pub(crate) fn write_inode(&mut self, id: InodeId, ino: &Inode) -> IoResult<()> {
		log::trace!("write_inode({id}, {:?});", ino.name());
		let off = id.off() as usize;
		if id.blk() >= self.nblocks || off + INOSZ > BLKSIZE {
			return Err(err!(EINVAL));
		}
		codec::encode(ino, &mut self.store_mut().block_mut(id.blk())[off..off + INOSZ])?;
		Ok(())
	}

	pub(crate) fn flush_inode(&mut self, id: InodeId) -> IoResult<()> {
		self.store_mut().flush_block(id.blk())
	}

	pub(crate) fn inode_name(&self, id: InodeId) -> IoResult<String> {
		Ok(self.read_inode(id)?.name().to_string())
	}

	/// The disk block backing the `filebno`'th block of the file, without
	/// allocating. `None` is a hole.
	pub(crate) fn find_block(&self, id: InodeId, filebno: u32) -> IoResult<Option<u32>> {
		let ino = self.read_inode(id)?;
		match block_slot(filebno)? {
			BlockSlot::Direct(i) => Ok(nonzero(ino.direct[i])),
			BlockSlot::Indirect(i) => {
				if ino.indirect == 0 {
					return Ok(None);
				}
				Ok(nonzero(pslot(self.store().block(ino.indirect), i)))
			}
		}
	}

	/// The disk block backing the `filebno`'th block of the file, allocating
	/// the data block (and the indirect block) as needed. Fresh blocks are
	/// zeroed.
	pub(crate) fn get_block(&mut self, id: InodeId, filebno: u32) -> IoResult<u32> {
		if let Some(bno) = self.find_block(id, filebno)? {
			return Ok(bno);
		}

		let mut ino = self.read_inode(id)?;
		let bno = self.alloc_block()?;
		self.store_mut().block_mut(bno).fill(0);

		match block_slot(filebno)? {
			BlockSlot::Direct(i) => {
				ino.direct[i] = bno;
				self.write_inode(id, &ino)?;
			}
			BlockSlot::Indirect(i) => {
				if ino.indirect == 0 {
					let ib = match self.alloc_block() {
						Ok(ib) => ib,
						Err(e) => {
							self.free_block(bno);
							return Err(e);
						}
					};
					self.store_mut().block_mut(ib).fill(0);
					ino.indirect = ib;
					self.write_inode(id, &ino)?;
				}
				let blk = self.store_mut().block_mut(ino.indirect);
				blk[i * 4..i * 4 + 4].copy_from_slice(&bno.to_le_bytes());
			}
		}

		Ok(bno)
	}

	/// Read up to `buf.len()` bytes at `offset`, clamped to the file size.
	/// Holes read as zeros.
	pub(crate) fn raw_read(&self, id: InodeId, buf: &mut [u8], offset: u32) -> IoResult<usize> {
		log::trace!("raw_read({id}, {offset}, {});", buf.len());
		let ino = self.read_inode(id)?;
		if offset >= ino.size {
			return Ok(0);
		}

		let count = (buf.len() as u32).min(ino.size - offset);
		let mut pos = offset;
		let mut boff = 0usize;
		while pos < offset + count {
			let n = (BS - pos % BS).min(offset + count - pos) as usize;
			let o = (pos % BS) as usize;
			match self.find_block(id, pos / BS)? {
				Some(bno) => {
					let blk = self.store().block(bno);
					buf[boff..boff + n].copy_from_slice(&blk[o..o + n]);
				}
				None => buf[boff..boff + n].fill(0),
			}
			pos += n as u32;
			boff += n;
		}

		Ok(count as usize)
	}

	/// Write `buf` at `offset`, extending the file if necessary.
	pub(crate) fn raw_write(&mut self, id: InodeId, buf: &[u8], offset: u32) -> IoResult<usize> {
		log::trace!("raw_write({id}, {offset}, {});", buf.len());
		let end = offset
			.checked_add(buf.len() as u32)
			.filter(|&e| e <= MAXFILESIZE)
			.ok_or(err!(EINVAL))?;

		let ino = self.read_inode(id)?;
		if end > ino.size {
			self.raw_set_size(id, end)?;
		}

		let mut pos = offset;
		let mut boff = 0usize;
		while pos < end {
			let n = (BS - pos % BS).min(end - pos) as usize;
			let o = (pos % BS) as usize;
			let bno = self.get_block(id, pos / BS)?;
			let blk = self.store_mut().block_mut(bno);
			blk[o..o + n].copy_from_slice(&buf[boff..boff + n]);
			pos += n as u32;
			boff += n;
		}

		Ok(buf.len())
	}

	/// Set the file size, truncating or extending as necessary.
	pub(crate) fn raw_set_size(&mut self, id: InodeId, newsize: u32) -> IoResult<()> {
		log::trace!("raw_set_size({id}, {newsize});");
		if newsize > MAXFILESIZE {
			return Err(err!(EINVAL));
		}

		let mut ino = self.read_inode(id)?;
		if ino.size > newsize {
			self.truncate_blocks(&mut ino, newsize)?;
		}
		ino.size = newsize;
		self.write_inode(id, &ino)?;
		self.flush_inode(id)
	}

	/// Free the blocks a file of size `newsize` no longer needs, including
	/// the indirect block once it holds no slots.
	fn truncate_blocks(&mut self, ino: &mut Inode, newsize: u32) -> IoResult<()> {
		let old_n = ino.size.div_ceil(BS);
		let new_n = newsize.div_ceil(BS);

		for filebno in new_n..old_n {
			match block_slot(filebno)? {
				BlockSlot::Direct(i) => {
					if ino.direct[i] != 0 {
						self.free_block(ino.direct[i]);
						ino.direct[i] = 0;
					}
				}
				BlockSlot::Indirect(i) => {
					if ino.indirect == 0 {
						continue;
					}
					let bno = pslot(self.store().block(ino.indirect), i);
					if bno != 0 {
						self.free_block(bno);
						let blk = self.store_mut().block_mut(ino.indirect);
						blk[i * 4..i * 4 + 4].fill(0);
					}
				}
			}
		}

		if new_n as usize <= NDIRECT && ino.indirect != 0 {
			self.free_block(ino.indirect);
			ino.indirect = 0;
		}
		Ok(())
	}

	/// Flush the contents and metadata of the file out to disk.
	pub(crate) fn raw_flush(&mut self, id: InodeId) -> IoResult<()> {
		log::trace!("raw_flush({id});");
		let ino = self.read_inode(id)?;
		for filebno in 0..ino.size.div_ceil(BS) {
			if let Some(bno) = self.find_block(id, filebno)? {
				self.store_mut().flush_block(bno)?;
			}
		}
		if ino.indirect != 0 {
			self.store_mut().flush_block(ino.indirect)?;
		}
		self.flush_inode(id)
	}

	/// Truncate the file and clear its record, returning the directory slot
	/// to the free pool.
	pub(crate) fn zero_inode(&mut self, id: InodeId) -> IoResult<()> {
		log::trace!("zero_inode({id});");
		self.raw_set_size(id, 0)?;
		self.write_inode(id, &Inode::empty())?;
		self.flush_inode(id)
	}
}

fn nonzero(bno: u32) -> Option<u32> {
	if bno == 0 {
		None
	} else {
		Some(bno)
	}
}
