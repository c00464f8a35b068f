use clap::Parser;
use std::process::ExitCode;

use chunk_sync::cli::{run, Cli};

fn main() -> ExitCode {
    // Credentials for the AWS CLI may come from a local .env file.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[ERROR] {e:#}");
            ExitCode::FAILURE
        }
    }
}
