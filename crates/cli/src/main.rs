//! The `osimg` command line, a thin frontend over the image building
//! substrate crates for inspection and manual operation.

use anyhow::Result;
use clap::Parser;

mod cli;
mod config;

fn run() -> Result<()> {
    osimg_utils::initialize_tracing();
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    cli::run_from_opt(cli::Cli::parse())
}

fn main() {
    if let Err(e) = run() {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
