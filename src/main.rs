// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use clap::Parser;
use sparrow::cli::{Cli, Command};
use sparrow::config::Config;
use sparrow::{daemon, logger};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    logger::setup_logger(&cfg.log);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    match cli.cmd {
        Command::Run { dev } => rt.block_on(daemon::start(cfg, dev)),
    }
}
