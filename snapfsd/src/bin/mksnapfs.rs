use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use snapfs::Snapfs;

#[derive(Parser)]
#[command(version, about = "Format a snapfs disk image")]
struct Cli {
	/// Path of the image to create
	image: PathBuf,

	/// Total number of blocks
	#[arg(short, long, default_value_t = 1024)]
	blocks: u32,

	#[command(flatten)]
	verbose: Verbosity<WarnLevel>,
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	Snapfs::format(&cli.image, cli.blocks)?;
	println!("{}: {} blocks", cli.image.display(), cli.blocks);
	Ok(())
}
