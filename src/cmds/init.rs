use std::path::PathBuf;

use base::Error;
use clap::Args as ClapArgs;
use core_engine::config::Config;
use core_engine::store::SqliteStore;
use tracing::info;

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Path to the config file.
    #[arg(long, value_name = "PATH")]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;

    std::fs::create_dir_all(&config.download_dir)?;
    std::fs::create_dir_all(&config.clip_dir)?;
    if let Some(parent) = config.store_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    SqliteStore::open(&config.store_path)?;
    info!(
        download_dir = %config.download_dir.display(),
        clip_dir = %config.clip_dir.display(),
        store_path = %config.store_path.display(),
        "initialized",
    );
    Ok(0)
}
