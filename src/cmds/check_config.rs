use std::path::PathBuf;

use base::Error;
use clap::Args as ClapArgs;
use core_engine::config::Config;
use tracing::info;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Path to the config file.
    #[arg(long, value_name = "PATH")]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;
    // Loading already validated the TOML shape; exercise the byte-budget
    // parsing too since it's deferred until first use otherwise.
    config.download_budget_bytes()?;
    config.clip_budget_bytes()?;
    info!(path = %args.config.display(), "config is valid");
    Ok(0)
}
