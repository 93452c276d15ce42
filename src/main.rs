//! Main entry point for the rbdvol binary.
//!
//! This binary provides the `rbdvol` command-line interface,
//! and otherwise serves as a thin dispatch layer for `rbdvol`
use clap::Parser;
use rbdvol::cmd;
use rbdvol::cmd::{Cli, Command};
use rbdvol::error::RbdVolError;
use std::process::{ExitCode, Termination};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result: Result<(), RbdVolError> = match cli.cmd {
        Command::Serve(args) => cmd::serve(*args).await,
    };
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => AppError(e).report(),
    }
}

#[derive(Debug)]
struct AppError(RbdVolError);

impl Termination for AppError {
    fn report(self) -> ExitCode {
        let code = self.exit_code();
        tracing::error!(exit_code = code, "{}", self.0);
        ExitCode::from(code)
    }
}

impl AppError {
    fn exit_code(&self) -> u8 {
        match &self.0 {
            RbdVolError::Io(_) => sysexits::ExitCode::IoErr.into(),
            RbdVolError::Logging(_) => sysexits::ExitCode::Config.into(),
        }
    }
}
