use anyhow::Result;
use clap::Parser;
use snapfs::Snapfs;

use crate::{cli::Cli, server::Server};

mod cli;
mod server;

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	let fs = Snapfs::open(&cli.image)?;
	let mut server = Server::new(fs);
	server.serve(&cli.socket)?;

	Ok(())
}
