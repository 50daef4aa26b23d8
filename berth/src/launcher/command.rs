//! The image startup command (`serve <module:attr> --host --port`).

use berth_shared::errors::{BerthError, BerthResult};
use clap::Parser;

use crate::runtime::constants::service;

/// Arguments of the `serve` startup command.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "serve", no_binary_name = true, disable_help_flag = true)]
pub struct ServeCommand {
    /// Application reference, `module:attribute`.
    pub app: String,

    #[arg(long, default_value = service::BIND_HOST)]
    pub host: String,

    #[arg(long, default_value_t = service::PORT)]
    pub port: u16,
}

impl ServeCommand {
    /// Parse an image `CMD`.
    ///
    /// The only supported command is `serve`, and it binds all interfaces.
    pub fn from_cmd(cmd: &[String]) -> BerthResult<Self> {
        let (program, args) = cmd
            .split_first()
            .ok_or_else(|| BerthError::Config("image has no startup command".into()))?;
        if program != service::SERVE_COMMAND {
            return Err(BerthError::Config(format!(
                "unsupported startup command '{}': expected '{}'",
                program,
                service::SERVE_COMMAND
            )));
        }

        let command = Self::try_parse_from(args)
            .map_err(|e| BerthError::Config(format!("invalid startup command: {}", e.render())))?;

        if command.host != service::BIND_HOST {
            return Err(BerthError::Config(format!(
                "serve must bind {}, got {}",
                service::BIND_HOST,
                command.host
            )));
        }
        if command.port == 0 {
            return Err(BerthError::Config("serve port must not be 0".into()));
        }
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_canonical_command() {
        let command = ServeCommand::from_cmd(&cmd(&[
            "serve",
            "server:app",
            "--host",
            "0.0.0.0",
            "--port",
            "8080",
        ]))
        .unwrap();
        assert_eq!(command.app, "server:app");
        assert_eq!(command.port, 8080);
    }

    #[test]
    fn test_defaults() {
        let command = ServeCommand::from_cmd(&cmd(&["serve", "server:app"])).unwrap();
        assert_eq!(command.host, "0.0.0.0");
        assert_eq!(command.port, 8080);
    }

    #[test]
    fn test_rejects_other_hosts_and_commands() {
        assert!(ServeCommand::from_cmd(&cmd(&["serve", "server:app", "--host", "127.0.0.1"])).is_err());
        assert!(ServeCommand::from_cmd(&cmd(&["python", "server.py"])).is_err());
        assert!(ServeCommand::from_cmd(&cmd(&["serve", "server:app", "--workers", "4"])).is_err());
        assert!(ServeCommand::from_cmd(&[]).is_err());
    }
}
