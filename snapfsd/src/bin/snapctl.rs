use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use snapfs::{client::Client, proto};

#[derive(Parser)]
#[command(version, about = "User commands for a running snapfs server")]
struct Cli {
	/// Path of the server socket
	#[arg(short, long, default_value = "snapfs.sock")]
	socket: PathBuf,

	#[command(flatten)]
	verbose: Verbosity<WarnLevel>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Create a named snapshot of the current state
	Create {
		/// Snapshot name
		#[arg(short, long)]
		name:    String,
		/// Human-readable comment
		#[arg(short, long, default_value = "")]
		comment: String,
	},
	/// Roll back (or forward) to a named snapshot
	Accept { name: String },
	/// Soft-delete a named snapshot
	Delete { name: String },
	/// List snapshots
	List,
	/// Report free (or busy) space
	Df {
		#[arg(long)]
		busy: bool,
	},
	/// Flush every dirty block to disk
	Sync,
	/// Write DATA to PATH, replacing its content
	Write { path: String, data: String },
	/// Print the content of PATH
	Read { path: String },
	/// Remove PATH
	Rm { path: String },
	/// Print name, size and kind of PATH
	Stat { path: String },
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	let mut client =
		Client::connect(&cli.socket).with_context(|| format!("connecting to {:?}", cli.socket))?;

	match cli.command {
		Command::Create { name, comment } => {
			client
				.create_snapshot(&comment, &name)
				.context("snapshot is not created")?;
		}
		Command::Accept { name } => {
			client
				.accept_snapshot(&name)
				.context("snapshot is not accepted")?;
		}
		Command::Delete { name } => {
			client
				.delete_snapshot(&name)
				.context("snapshot is not deleted")?;
		}
		Command::List => {
			print!("{}", client.print_snapshot_list()?);
		}
		Command::Df { busy } => {
			if busy {
				println!("busy {} bytes on disk", client.busy_space_bytes()?);
			} else {
				println!("free {} bytes on disk", client.free_space_bytes()?);
			}
		}
		Command::Sync => client.sync()?,
		Command::Write { path, data } => {
			let fd = client.open(
				&path,
				proto::O_WRONLY | proto::O_CREAT | proto::O_TRUNC,
			)?;
			client.write(fd, data.as_bytes())?;
			client.flush(fd)?;
		}
		Command::Read { path } => {
			let fd = client.open(&path, proto::O_RDONLY)?;
			let size = client.stat(fd)?.size;
			let data = client.read(fd, size as usize)?;
			print!("{}", String::from_utf8_lossy(&data));
		}
		Command::Rm { path } => client.remove(&path)?,
		Command::Stat { path } => {
			let fd = client.open(&path, proto::O_RDONLY)?;
			let st = client.stat(fd)?;
			println!(
				"{} {} {}",
				st.name,
				st.size,
				if st.isdir { "dir" } else { "file" },
			);
		}
	}

	Ok(())
}
