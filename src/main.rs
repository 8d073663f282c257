use base::Error;
use clap::{Parser, Subcommand};
use tracing::{debug, error};

mod cmds;

/// A multi-tenant live-stream clipping service.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the watcher/downloader/clipper engine and the redirector web
    /// server until shutdown.
    Run(cmds::run::Args),
    /// Loads and validates a config file without starting anything.
    CheckConfig(cmds::check_config::Args),
    /// Creates the download/clip directories and an empty store database.
    Init(cmds::init::Args),
}

fn main() {
    base::tracing_setup::install();

    let cli = Cli::parse();
    tracing::trace!("parsed command-line arguments: {cli:#?}");

    let result = match cli.command {
        Command::Run(args) => run_async(cmds::run::run(args)),
        Command::CheckConfig(args) => cmds::check_config::run(args),
        Command::Init(args) => cmds::init::run(args),
    };

    match result {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {rv}");
            std::process::exit(rv);
        }
    }
}

fn run_async<F: std::future::Future<Output = Result<i32, Error>>>(fut: F) -> Result<i32, Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start tokio runtime")
        .block_on(fut)
}
