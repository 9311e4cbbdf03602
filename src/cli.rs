//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

/// Virtual MCP gateway - composite prompts over aggregated MCP backends
#[derive(Parser, Debug)]
#[command(name = "vmcp-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "VMCP_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "VMCP_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "VMCP_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "VMCP_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "VMCP_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Custom prompt tooling
    #[command(subcommand)]
    Prompts(PromptsCommand),

    /// Print shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

/// Prompt subcommands
#[derive(Subcommand, Debug)]
pub enum PromptsCommand {
    /// Check the custom prompts of the configured virtual servers
    Lint {
        /// Only this virtual server
        #[arg(short, long)]
        server: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

/// Report format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines
    Text,
    /// JSON document
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_lint_subcommand() {
        let cli = Cli::parse_from([
            "vmcp-gateway",
            "--config",
            "gateway.yaml",
            "prompts",
            "lint",
            "--server",
            "demo",
            "--format",
            "json",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("gateway.yaml")));
        match cli.command {
            Some(Command::Prompts(PromptsCommand::Lint { server, format })) => {
                assert_eq!(server.as_deref(), Some("demo"));
                assert_eq!(format, OutputFormat::Json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::parse_from(["vmcp-gateway", "--port", "4000"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(4000));
    }
}
