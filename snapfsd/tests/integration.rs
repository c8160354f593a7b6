use std::{
	fmt,
	path::PathBuf,
	process::{Child, Command},
	thread::sleep,
	time::{Duration, Instant},
};

use assert_cmd::cargo::CommandCargoExt;
use snapfs::{client::Client, proto};
use tempfile::TempDir;

#[derive(Clone, Copy, Debug)]
pub struct WaitForError;

impl fmt::Display for WaitForError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "timeout waiting for condition")
	}
}

impl std::error::Error for WaitForError {}

/// Wait for a limited amount of time for the given condition to be true.
pub fn waitfor<C>(timeout: Duration, condition: C) -> Result<(), WaitForError>
where
	C: Fn() -> bool,
{
	let start = Instant::now();
	loop {
		if condition() {
			break Ok(());
		}
		if start.elapsed() > timeout {
			break Err(WaitForError);
		}
		sleep(Duration::from_millis(50));
	}
}

struct Harness {
	child:  Child,
	_dir:   TempDir,
	socket: PathBuf,
}

impl Harness {
	fn new() -> Self {
		let dir = TempDir::new().unwrap();
		let image = dir.path().join("disk.img");
		let socket = dir.path().join("snapfs.sock");

		Command::cargo_bin("mksnapfs")
			.unwrap()
			.arg(&image)
			.args(["--blocks", "512"])
			.status()
			.unwrap()
			.success()
			.then_some(())
			.unwrap();

		let child = Command::cargo_bin("snapfsd")
			.unwrap()
			.arg(&image)
			.arg("--socket")
			.arg(&socket)
			.spawn()
			.unwrap();

		let s = socket.clone();
		waitfor(Duration::from_secs(10), move || s.exists()).unwrap();

		Self {
			child,
			_dir: dir,
			socket,
		}
	}

	fn client(&self) -> Client {
		Client::connect(&self.socket).unwrap()
	}
}

impl Drop for Harness {
	fn drop(&mut self) {
		let _ = self.child.kill();
		let _ = self.child.wait();
	}
}

fn put(client: &mut Client, path: &str, data: &[u8]) {
	let fd = client
		.open(path, proto::O_WRONLY | proto::O_CREAT | proto::O_TRUNC)
		.unwrap();
	client.write(fd, data).unwrap();
	client.flush(fd).unwrap();
}

fn get(client: &mut Client, path: &str, n: usize) -> Vec<u8> {
	let fd = client.open(path, proto::O_RDONLY).unwrap();
	client.read(fd, n).unwrap()
}

#[test]
fn snapshots_roll_back_and_forward() {
	let h = Harness::new();
	let mut c = h.client();

	put(&mut c, "test", b"1\0");
	c.create_snapshot("comment1", "first").unwrap();
	put(&mut c, "test", b"2\0");
	c.create_snapshot("comment2", "second").unwrap();

	c.accept_snapshot("first").unwrap();
	assert_eq!(get(&mut c, "test", 2), b"1\0");

	c.accept_snapshot("second").unwrap();
	assert_eq!(get(&mut c, "test", 2), b"2\0");
}

#[test]
fn listing_names_every_snapshot() {
	let h = Harness::new();
	let mut c = h.client();

	c.create_snapshot("one", "s1").unwrap();
	c.create_snapshot("two", "s2").unwrap();

	let listing = c.print_snapshot_list().unwrap();
	assert!(listing.contains("s1"));
	assert!(listing.contains("s2"));
	assert!(listing.contains("one"));
}

#[test]
fn deleted_snapshot_names_are_reusable() {
	let h = Harness::new();
	let mut c = h.client();

	c.create_snapshot("", "x").unwrap();
	c.delete_snapshot("x").unwrap();
	c.create_snapshot("", "x").unwrap();

	let e = c.accept_snapshot("ghost").unwrap_err();
	assert_eq!(e.raw_os_error(), Some(libc::ENOENT));
}

#[test]
fn stat_and_df_report_sane_numbers() {
	let h = Harness::new();
	let mut c = h.client();

	put(&mut c, "motd", b"hello");
	let fd = c.open("motd", proto::O_RDONLY).unwrap();
	let st = c.stat(fd).unwrap();
	assert_eq!(st.name, "motd");
	assert_eq!(st.size, 5);
	assert!(!st.isdir);

	let free = c.free_space_bytes().unwrap();
	let busy = c.busy_space_bytes().unwrap();
	assert_eq!(free + busy, 511 * 4096);

	c.sync().unwrap();
}

#[test]
fn large_io_crosses_page_frames() {
	let h = Harness::new();
	let mut c = h.client();

	let data: Vec<u8> = (0..3 * proto::PAGESIZE).map(|i| i as u8).collect();
	put(&mut c, "big", &data);
	assert_eq!(get(&mut c, "big", data.len()), data);
}

#[test]
fn snapshot_internals_are_read_only() {
	let h = Harness::new();
	let mut c = h.client();

	let e = c.open(".snapshots/cfg", proto::O_WRONLY).unwrap_err();
	assert_eq!(e.raw_os_error(), Some(libc::EINVAL));

	// but visible
	c.open(".snapshots/cfg", proto::O_RDONLY).unwrap();

	// and user names may not carry the shadow separator
	let e = c.open("a@b", proto::O_CREAT | proto::O_RDWR).unwrap_err();
	assert_eq!(e.raw_os_error(), Some(libc::EINVAL));
}

#[test]
fn removed_files_are_gone() {
	let h = Harness::new();
	let mut c = h.client();

	put(&mut c, "junk", b"zzz");
	c.remove("junk").unwrap();
	let e = c.open("junk", proto::O_RDONLY).unwrap_err();
	assert_eq!(e.raw_os_error(), Some(libc::ENOENT));
}
