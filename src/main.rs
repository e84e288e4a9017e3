use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use timecast::{app, config::AppConfig, error::AppError};
use tracing::error;

#[derive(Parser, Debug)]
#[command(
    name = "timecast",
    version,
    about = "Streams a time-API-synchronised clock over server-sent events"
)]
struct Cli {
    /// YAML config file; defaults apply when omitted
    #[arg(env = "TIMECAST_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    app::init_logging();
    let result = AppConfig::load(cli.config.as_deref())
        .map_err(AppError::from)
        .and_then(|config| app::run(&config));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "timecast exited with an error");
            ExitCode::FAILURE
        }
    }
}
