//! Kern - store inspection and reset tool.

use clap::Parser;
use std::process::ExitCode;

use kern::cli::Commands;
use kern::logging;

fn main() -> ExitCode {
    // Parse command line arguments
    let args = Commands::parse();

    let data_dir = match args.resolved_data_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let _guard = match logging::init(&data_dir) {
        Ok((guard, _)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Run the command
    match args.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
