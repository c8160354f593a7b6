use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
	/// Path to the disk image
	pub image: PathBuf,

	/// Path of the listening socket
	#[arg(short, long, default_value = "snapfs.sock")]
	pub socket: PathBuf,

	#[command(flatten)]
	pub verbose: Verbosity<WarnLevel>,
}
