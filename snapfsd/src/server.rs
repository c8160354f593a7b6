use std::{
	collections::HashMap,
	io::{ErrorKind, Result as IoResult},
	os::unix::net::{UnixListener, UnixStream},
	path::Path,
};

use chrono::DateTime;
use snapfs::{
	err,
	proto::{self, Reply, Request, IOMAX, O_ACCMODE, O_CREAT, O_EXCL, O_MKDIR, O_RDONLY, O_TRUNC},
	InodeId, Snapfs, MAXPATHLEN, MAX_SH_LENGTH, SNAPDIR, SNAPSEP,
};

struct OpenFile {
	ino:  InodeId,
	pos:  u32,
	mode: u32,
	/// Opened under `.snapshots/`: no resolver, never writable.
	raw:  bool,
}

/// Single-threaded cooperative server: one connection at a time, one
/// outstanding request per connection. Handles live for the duration of
/// their connection.
pub struct Server {
	fs: Snapfs,
}

impl Server {
	pub fn new(fs: Snapfs) -> Self {
		Self { fs }
	}

	pub fn serve(&mut self, socket: &Path) -> IoResult<()> {
		if socket.exists() {
			std::fs::remove_file(socket)?;
		}
		let listener = UnixListener::bind(socket)?;
		log::info!("serving on {socket:?}");

		for stream in listener.incoming() {
			match stream {
				Ok(stream) => self.serve_client(stream),
				Err(e) => log::warn!("accept failed: {e}"),
			}
		}
		Ok(())
	}

	fn serve_client(&mut self, mut stream: UnixStream) {
		log::debug!("client connected");
		let mut files = HashMap::new();
		let mut next_fd = 1u32;

		loop {
			let req: Request = match proto::read_frame(&mut stream) {
				Ok(req) => req,
				Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
				Err(e) => {
					log::warn!("bad frame: {e}");
					break;
				}
			};

			let reply = match self.handle(&mut files, &mut next_fd, req) {
				Ok(reply) => reply,
				Err(e) => Reply::Err(e.raw_os_error().unwrap_or(libc::EIO)),
			};

			if let Err(e) = proto::write_frame(&mut stream, &reply) {
				log::warn!("reply failed: {e}");
				break;
			}
		}
		log::debug!("client disconnected");
	}

	fn handle(
		&mut self,
		files: &mut HashMap<u32, OpenFile>,
		next_fd: &mut u32,
		req: Request,
	) -> IoResult<Reply> {
		match req {
			Request::Open { path, mode } => {
				let of = self.do_open(&path, mode)?;
				let fd = *next_fd;
				*next_fd += 1;
				files.insert(fd, of);
				Ok(Reply::Fd(fd))
			}
			Request::Read { fileid, n } => {
				let of = lookup_mut(files, fileid)?;
				let mut buf = vec![0u8; (n as usize).min(IOMAX)];
				let got = if of.raw {
					self.fs.read_raw(of.ino, &mut buf, of.pos)?
				} else {
					self.fs.read(of.ino, &mut buf, of.pos)?
				};
				buf.truncate(got);
				of.pos += got as u32;
				Ok(Reply::Data(buf))
			}
			Request::Write { fileid, data } => {
				let of = lookup_mut(files, fileid)?;
				if of.raw || of.mode & O_ACCMODE == O_RDONLY {
					return Err(err!(EINVAL));
				}
				if data.len() > IOMAX {
					return Err(err!(EINVAL));
				}
				let n = self.fs.write(of.ino, &data, of.pos)?;
				of.pos += n as u32;
				Ok(Reply::Len(n as u32))
			}
			Request::SetSize { fileid, size } => {
				let of = lookup(files, fileid)?;
				if of.raw || of.mode & O_ACCMODE == O_RDONLY {
					return Err(err!(EINVAL));
				}
				self.fs.set_size(of.ino, size)?;
				Ok(Reply::Len(0))
			}
			Request::Stat { fileid } => {
				let of = lookup(files, fileid)?;
				let (name, size, isdir) = self.fs.stat(of.ino)?;
				Ok(Reply::Stat { name, size, isdir })
			}
			Request::Flush { fileid } => {
				let of = lookup(files, fileid)?;
				self.fs.flush(of.ino)?;
				Ok(Reply::Len(0))
			}
			Request::Remove { path } => {
				check_user_path(&path)?;
				self.fs.remove_file(&path)?;
				Ok(Reply::Ok)
			}
			Request::ShCreate { comment, name } => {
				check_sh_arg(&name)?;
				if comment.len() > MAX_SH_LENGTH {
					return Err(err!(EINVAL));
				}
				self.fs.create_snapshot(&name, &comment)?;
				Ok(Reply::Ok)
			}
			Request::ShPrint => {
				let text = self.render_snapshot_list()?;
				for line in text.lines() {
					log::info!("{line}");
				}
				Ok(Reply::List(text))
			}
			Request::ShAccept { name } => {
				check_sh_arg(&name)?;
				self.fs.accept_snapshot(&name)?;
				Ok(Reply::Ok)
			}
			Request::ShDelete { name } => {
				check_sh_arg(&name)?;
				self.fs.delete_snapshot(&name)?;
				Ok(Reply::Ok)
			}
			Request::DfFree => Ok(Reply::Bytes(self.fs.free_bytes())),
			Request::DfBusy => Ok(Reply::Bytes(self.fs.busy_bytes())),
			Request::Sync => {
				self.fs.fs_sync()?;
				Ok(Reply::Len(0))
			}
		}
	}

	fn do_open(&mut self, path: &str, mode: u32) -> IoResult<OpenFile> {
		log::debug!("open({path:?}, {mode:#x})");
		if path.len() >= MAXPATHLEN || mode & O_MKDIR != 0 {
			return Err(err!(EINVAL));
		}

		let raw = in_snapdir(path);
		if raw {
			// snapshot internals are visible read-only
			if mode & O_ACCMODE != O_RDONLY || mode & (O_CREAT | O_TRUNC) != 0 {
				return Err(err!(EINVAL));
			}
		} else {
			check_user_path(path)?;
		}

		let ino = match self.fs.open_path(path) {
			Ok(ino) => {
				if mode & (O_CREAT | O_EXCL) == (O_CREAT | O_EXCL) {
					return Err(err!(EEXIST));
				}
				ino
			}
			Err(e) if e.raw_os_error() == Some(libc::ENOENT) && mode & O_CREAT != 0 => {
				self.fs.create_file(path)?
			}
			Err(e) => return Err(e),
		};

		let (_, _, isdir) = self.fs.stat(ino)?;
		if isdir && mode & O_ACCMODE != O_RDONLY {
			return Err(err!(EINVAL));
		}
		if mode & O_TRUNC != 0 {
			self.fs.set_size(ino, 0)?;
		}

		Ok(OpenFile {
			ino,
			pos: 0,
			mode,
			raw,
		})
	}

	fn render_snapshot_list(&mut self) -> IoResult<String> {
		let mut out = String::new();
		for entry in self.fs.snapshot_list()? {
			let when = DateTime::from_timestamp(entry.date, 0)
				.map_or_else(|| entry.date.to_string(), |t| t.format("%d/%m/%Y %H:%M:%S").to_string());
			out.push_str(&format!(
				"   Name: {}\nComment: {}\n   Time: {}\n{}\n",
				entry.name,
				entry.comment,
				when,
				"_".repeat(45),
			));
		}
		Ok(out)
	}
}

fn lookup<'a>(files: &'a HashMap<u32, OpenFile>, fileid: u32) -> IoResult<&'a OpenFile> {
	files.get(&fileid).ok_or(err!(EINVAL))
}

fn lookup_mut<'a>(files: &'a mut HashMap<u32, OpenFile>, fileid: u32) -> IoResult<&'a mut OpenFile> {
	files.get_mut(&fileid).ok_or(err!(EINVAL))
}

fn in_snapdir(path: &str) -> bool {
	match path.trim_start_matches('/').strip_prefix(SNAPDIR) {
		Some(rest) => rest.is_empty() || rest.starts_with('/'),
		None => false,
	}
}

fn check_user_path(path: &str) -> IoResult<()> {
	if path.bytes().any(|b| b == SNAPSEP) || in_snapdir(path) {
		return Err(err!(EINVAL));
	}
	Ok(())
}

fn check_sh_arg(name: &str) -> IoResult<()> {
	if name.is_empty() || name.len() > MAX_SH_LENGTH {
		return Err(err!(EINVAL));
	}
	Ok(())
}
