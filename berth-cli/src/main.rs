mod apps;
mod cli;
mod commands;

use std::process::ExitCode;

use berth::BerthError;
use berth::runtime::constants::exit_codes;
use clap::Parser;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match cli.global.init_logging() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(exit_codes::FAILURE as u8);
        }
    };

    let result = match cli.command {
        Commands::Build(args) => commands::build::execute(args, &cli.global).await,
        Commands::Run(args) => commands::run::execute(args, &cli.global).await,
        Commands::Images(args) => commands::images::execute(args, &cli.global).await,
        Commands::Inspect(args) => commands::inspect::execute(args, &cli.global).await,
        Commands::Pull(args) => commands::pull::execute(args, &cli.global).await,
        Commands::Import(args) => commands::import::execute(args, &cli.global).await,
        Commands::Rmi(args) => commands::rmi::execute(args, &cli.global).await,
    };

    match result {
        Ok(()) => ExitCode::from(exit_codes::OK as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code_for(&e) as u8)
        }
    }
}

/// Startup failures of `run` get their own exit code so supervisors can tell
/// a broken image from a crash.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<BerthError>() {
        Some(e) if e.is_startup_failure() => exit_codes::STARTUP_FAILURE,
        _ => exit_codes::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth::EntryPointError;

    #[test]
    fn test_exit_code_mapping() {
        let import = anyhow::Error::from(BerthError::from(EntryPointError::ModuleNotFound {
            module: "server".into(),
        }));
        assert_eq!(exit_code_for(&import), exit_codes::STARTUP_FAILURE);

        let bind = anyhow::Error::from(BerthError::PortInUse {
            addr: "0.0.0.0:8080".into(),
        })
        .context("failed to start container");
        assert_eq!(exit_code_for(&bind), exit_codes::STARTUP_FAILURE);

        let missing = anyhow::Error::from(BerthError::NotFound("image svc:1".into()));
        assert_eq!(exit_code_for(&missing), exit_codes::FAILURE);
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), exit_codes::FAILURE);
    }
}
