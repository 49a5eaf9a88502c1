use std::process;
use std::sync::Arc;

use rsprovision::cli::{self, Commands};
use rsprovision::executor::RealCommandExecutor;
use rsprovision::probe::HostProbe;
use tracing::error;

fn main() {
    let args = cli::parse_args();

    if let Some(logging) = args.command.logging()
        && let Err(e) = rsprovision::init_logging(logging)
    {
        eprintln!("{:#}", e);
        process::exit(1);
    }

    let dry_run = match &args.command {
        Commands::Run(opts) => opts.dry_run,
        Commands::Mount(opts) | Commands::Umount(opts) => opts.dry_run,
        Commands::Validate(_) | Commands::Completions(_) => false,
    };
    let executor = Arc::new(RealCommandExecutor { dry_run });

    if let Err(e) = rsprovision::run(&args, executor, Arc::new(HostProbe)) {
        error!("{:#}", e);
        process::exit(1);
    }
}
