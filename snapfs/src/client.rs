//! Client-side shim: a blocking connection to the server speaking the
//! page-framed request protocol. One outstanding request at a time.

use std::{
	io::{Error, Result as IoResult},
	os::unix::net::UnixStream,
	path::Path,
};

use crate::{
	err,
	proto::{self, Reply, Request},
};

#[derive(Debug, Clone)]
pub struct Stat {
	pub name:  String,
	pub size:  u32,
	pub isdir: bool,
}

pub struct Client {
	stream: UnixStream,
}

impl Client {
	pub fn connect(socket: &Path) -> IoResult<Self> {
		Ok(Self {
			stream: UnixStream::connect(socket)?,
		})
	}

	fn call(&mut self, req: &Request) -> IoResult<Reply> {
		proto::write_frame(&mut self.stream, req)?;
		match proto::read_frame(&mut self.stream)? {
			Reply::Err(errno) => Err(Error::from_raw_os_error(errno)),
			reply => Ok(reply),
		}
	}

	pub fn open(&mut self, path: &str, mode: u32) -> IoResult<u32> {
		match self.call(&Request::Open {
			path: path.into(),
			mode,
		})? {
			Reply::Fd(fd) => Ok(fd),
			_ => Err(err!(EIO)),
		}
	}

	/// Read up to `n` bytes from the current position, looping over
	/// page-sized requests.
	pub fn read(&mut self, fileid: u32, n: usize) -> IoResult<Vec<u8>> {
		let mut out = Vec::new();
		while out.len() < n {
			let want = (n - out.len()).min(proto::IOMAX) as u32;
			let data = match self.call(&Request::Read { fileid, n: want })? {
				Reply::Data(data) => data,
				_ => return Err(err!(EIO)),
			};
			let done = data.len() < want as usize;
			out.extend_from_slice(&data);
			if data.is_empty() || done {
				break;
			}
		}
		Ok(out)
	}

	/// Write all of `buf` at the current position, looping over page-sized
	/// requests.
	pub fn write(&mut self, fileid: u32, buf: &[u8]) -> IoResult<usize> {
		let mut done = 0;
		while done < buf.len() {
			let chunk = &buf[done..(done + proto::IOMAX).min(buf.len())];
			let n = match self.call(&Request::Write {
				fileid,
				data: chunk.to_vec(),
			})? {
				Reply::Len(n) => n as usize,
				_ => return Err(err!(EIO)),
			};
			if n == 0 {
				break;
			}
			done += n;
		}
		Ok(done)
	}

	pub fn set_size(&mut self, fileid: u32, size: u32) -> IoResult<()> {
		self.call(&Request::SetSize { fileid, size })?;
		Ok(())
	}

	pub fn stat(&mut self, fileid: u32) -> IoResult<Stat> {
		match self.call(&Request::Stat { fileid })? {
			Reply::Stat { name, size, isdir } => Ok(Stat { name, size, isdir }),
			_ => Err(err!(EIO)),
		}
	}

	pub fn flush(&mut self, fileid: u32) -> IoResult<()> {
		self.call(&Request::Flush { fileid })?;
		Ok(())
	}

	pub fn remove(&mut self, path: &str) -> IoResult<()> {
		self.call(&Request::Remove { path: path.into() })?;
		Ok(())
	}

	pub fn create_snapshot(&mut self, comment: &str, name: &str) -> IoResult<()> {
		if comment.len() > crate::MAX_SH_LENGTH || name.len() > crate::MAX_SH_LENGTH {
			return Err(err!(EINVAL));
		}
		self.call(&Request::ShCreate {
			comment: comment.into(),
			name: name.into(),
		})?;
		Ok(())
	}

	/// The rendered snapshot listing; the server logs it as well.
	pub fn print_snapshot_list(&mut self) -> IoResult<String> {
		match self.call(&Request::ShPrint)? {
			Reply::List(text) => Ok(text),
			_ => Err(err!(EIO)),
		}
	}

	pub fn accept_snapshot(&mut self, name: &str) -> IoResult<()> {
		if name.len() > crate::MAX_SH_LENGTH {
			return Err(err!(EINVAL));
		}
		self.call(&Request::ShAccept { name: name.into() })?;
		Ok(())
	}

	pub fn delete_snapshot(&mut self, name: &str) -> IoResult<()> {
		if name.len() > crate::MAX_SH_LENGTH {
			return Err(err!(EINVAL));
		}
		self.call(&Request::ShDelete { name: name.into() })?;
		Ok(())
	}

	pub fn free_space_bytes(&mut self) -> IoResult<u64> {
		match self.call(&Request::DfFree)? {
			Reply::Bytes(n) => Ok(n),
			_ => Err(err!(EIO)),
		}
	}

	pub fn busy_space_bytes(&mut self) -> IoResult<u64> {
		match self.call(&Request::DfBusy)? {
			Reply::Bytes(n) => Ok(n),
			_ => Err(err!(EIO)),
		}
	}

	/// Ask the server to write out every dirty block.
	pub fn sync(&mut self) -> IoResult<()> {
		self.call(&Request::Sync)?;
		Ok(())
	}
}
