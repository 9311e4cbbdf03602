//! Virtual MCP gateway
//!
//! Serves virtual servers whose composite prompts embed tool calls,
//! resources and other prompts from aggregated MCP backends.

use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use tracing::{error, info};

use vmcp_gateway::{
    cli::{Cli, Command, OutputFormat, PromptsCommand},
    config::Config,
    gateway::Gateway,
    resolver::{PromptReport, TemplateCache, lint},
    setup_tracing,
    virtual_server::VirtualServer,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Completions { shell }) => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "vmcp-gateway",
                &mut std::io::stdout(),
            );
            ExitCode::SUCCESS
        }
        Some(Command::Prompts(PromptsCommand::Lint { ref server, format })) => {
            run_lint(&cli, server.as_deref(), format)
        }
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Lint the custom prompts of the configured virtual servers
fn run_lint(cli: &Cli, only: Option<&str>, format: OutputFormat) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let templates = TemplateCache::new();
    let mut reports: Vec<(String, Vec<PromptReport>)> = Vec::new();
    for definition in &config.virtual_servers {
        if only.is_some_and(|name| name != definition.name) {
            continue;
        }
        let server = VirtualServer::from_config(definition);
        reports.push((server.name.clone(), lint(&server, &definition.resources, &templates)));
    }
    if let Some(name) = only {
        if reports.is_empty() {
            eprintln!("❌ No virtual server named '{name}'");
            return ExitCode::FAILURE;
        }
    }

    let failed = reports
        .iter()
        .flat_map(|(_, r)| r)
        .any(|r| !r.issues.is_empty());

    match format {
        OutputFormat::Json => {
            let doc: serde_json::Map<String, serde_json::Value> = reports
                .iter()
                .map(|(name, r)| (name.clone(), serde_json::to_value(r).unwrap_or_default()))
                .collect();
            match serde_json::to_string_pretty(&doc) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("❌ Failed to serialize report: {e}");
                    return ExitCode::FAILURE;
                }
            }
        }
        OutputFormat::Text => {
            for (name, prompts) in &reports {
                println!("{name}:");
                for report in prompts {
                    if report.issues.is_empty() {
                        println!("  ✅ {} ({} directives)", report.prompt, report.directives);
                    } else {
                        println!("  ❌ {} ({} directives)", report.prompt, report.directives);
                        for issue in &report.issues {
                            println!("     - {issue}");
                        }
                    }
                }
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        virtual_servers = config.virtual_servers.len(),
        "Starting vMCP gateway"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
