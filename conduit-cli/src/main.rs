//! Conduit CLI: host an RPC service or call one.

mod commands;
mod logging;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;

/// Conduit: lifecycle-managed transports and correlated RPC
#[derive(Parser, Debug)]
#[command(name = "conduit", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Serve the built-in RPC methods (echo, ping, sum) until Ctrl-C
    Serve {
        /// Listen host (overrides server.host)
        #[arg(long)]
        host: Option<String>,

        /// Listen port (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Maximum number of live connections
        #[arg(long)]
        max_connections: Option<usize>,
    },

    /// Call a remote method and print its JSON result
    Call {
        /// Method name
        method: String,

        /// Positional arguments; each is parsed as JSON, falling back to a string
        args: Vec<String>,

        /// Server address as host:port (defaults to server.host:server.port)
        #[arg(short, long)]
        addr: Option<String>,

        /// Seconds to wait for the response
        #[arg(short, long)]
        timeout: Option<f64>,

        /// Do not wait for a response
        #[arg(long, conflicts_with = "timeout")]
        notify: bool,

        /// Retry the connection with backoff until the server is reachable
        #[arg(long)]
        reconnect: bool,
    },

    /// Print the resolved configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = logging::init(cli.verbose, cli.quiet);

    let config = conduit_core::load_config(cli.config.as_deref(), None)
        .context("Configuration error")?;

    commands::handle_command(cli.command, config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_call() {
        let cli = Cli::try_parse_from([
            "conduit", "-v", "call", "sum", "[1,2]", "--timeout", "1.5", "--addr", "10.0.0.1:7400",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Call {
                method,
                args,
                addr,
                timeout,
                notify,
                reconnect,
            } => {
                assert_eq!(method, "sum");
                assert_eq!(args, vec!["[1,2]".to_string()]);
                assert_eq!(addr.as_deref(), Some("10.0.0.1:7400"));
                assert_eq!(timeout, Some(1.5));
                assert!(!notify);
                assert!(!reconnect);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_notify_conflicts_with_timeout() {
        let err = Cli::try_parse_from(["conduit", "call", "ping", "--notify", "--timeout", "1"]);
        assert!(err.is_err());
    }

    #[test]
    fn test_parse_serve_overrides() {
        let cli = Cli::try_parse_from(["conduit", "serve", "--port", "9000", "-q"]).unwrap();
        assert!(cli.quiet);
        assert!(matches!(
            cli.command,
            Commands::Serve {
                port: Some(9000),
                host: None,
                ..
            }
        ));
    }
}
