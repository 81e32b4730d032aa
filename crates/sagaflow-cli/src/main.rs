//! sagaflow CLI entry point.
//!
//! Binary name: `sagaflow`
//!
//! Parses CLI arguments, installs tracing, then dispatches to the command
//! handler.

mod cli;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,sagaflow_core=debug",
        _ => "trace",
    };
    let otel = matches!(cli.command, Commands::Run { otel: true, .. });
    sagaflow_observe::tracing_setup::init_tracing(filter, otel)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = match cli.command {
        Commands::Run {
            file,
            inputs,
            inputs_file,
            config,
            latency_ms,
            events,
            otel: _,
        } => {
            let args = cli::run::RunArgs {
                file,
                inputs,
                inputs_file,
                config,
                latency_ms,
                events,
            };
            cli::run::handle_run(args, cli.json, cli.quiet).await
        }

        Commands::Validate { paths } => cli::validate::handle_validate(&paths, cli.json, cli.quiet),

        Commands::Schema => print_schema(),

        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "sagaflow", &mut std::io::stdout());
            Ok(())
        }
    };

    sagaflow_observe::tracing_setup::shutdown_tracing();
    result
}

fn print_schema() -> anyhow::Result<()> {
    let schema = sagaflow_core::workflow::definition::workflow_json_schema()?;
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
