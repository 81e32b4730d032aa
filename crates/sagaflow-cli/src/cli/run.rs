//! `sagaflow run`: execute a workflow file with the dry-run adapter.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use sagaflow_core::event::EventBus;
use sagaflow_core::workflow::adapter::DryRunAdapter;
use sagaflow_core::workflow::context::ExecutionContext;
use sagaflow_core::workflow::definition::load_workflow_file;
use sagaflow_core::workflow::executor::{RunOptions, WorkflowEngine};
use sagaflow_types::event::WorkflowEvent;
use sagaflow_types::workflow::{RunState, StepStatus};

use super::config::load_engine_config;

/// Arguments of `sagaflow run`.
#[derive(Debug)]
pub struct RunArgs {
    pub file: PathBuf,
    pub inputs: Option<String>,
    pub inputs_file: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub latency_ms: u64,
    pub events: bool,
}

/// Caller inputs from `--inputs` or `--inputs-file`; `{}` when neither is set.
pub async fn parse_inputs(inline: Option<&str>, file: Option<&Path>) -> Result<Value> {
    let raw = match (inline, file) {
        (Some(raw), _) => raw.to_string(),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read inputs file {}", path.display()))?,
        (None, None) => return Ok(Value::Object(Default::default())),
    };
    let inputs: Value = serde_json::from_str(&raw).context("Invalid JSON inputs")?;
    if !inputs.is_object() {
        bail!("Workflow inputs must be a JSON object");
    }
    Ok(inputs)
}

pub async fn handle_run(args: RunArgs, json: bool, quiet: bool) -> Result<()> {
    let def = load_workflow_file(&args.file)
        .with_context(|| format!("Failed to load workflow {}", args.file.display()))?;
    let inputs = parse_inputs(args.inputs.as_deref(), args.inputs_file.as_deref()).await?;
    let config = load_engine_config(args.config.as_deref()).await?;

    let adapter = DryRunAdapter::with_latency(Duration::from_millis(args.latency_ms));
    let engine = WorkflowEngine::new(adapter, config.clone());

    let bus = EventBus::new(config.event_capacity);
    let printer = args
        .events
        .then(|| tokio::spawn(print_events(bus.subscribe(), json)));

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };

    let options = RunOptions::default().with_events(bus).with_cancel(cancel);
    let outcome = engine.execute_with(&def, inputs, options).await;
    interrupt.abort();
    if let Some(printer) = printer {
        // The bus closes once the run drops its last sender.
        let _ = printer.await;
    }
    let ctx = outcome.with_context(|| format!("Workflow '{}' was rejected", def.id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&ctx)?);
    } else if !quiet {
        print_report(&def.name, &ctx);
    }

    if ctx.state != RunState::Completed {
        let reason = ctx
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        bail!("Workflow '{}' ended {}: {reason}", def.id, ctx.state);
    }
    Ok(())
}

/// Where `--events` lines go. With `--json`, stdout carries the final
/// context document, so event lines move to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventStream {
    Stdout,
    Stderr,
}

impl EventStream {
    fn for_output(json: bool) -> Self {
        if json { Self::Stderr } else { Self::Stdout }
    }
}

async fn print_events(mut rx: broadcast::Receiver<WorkflowEvent>, json: bool) {
    let stream = EventStream::for_output(json);
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Some(line) = format_event(&event, json) else {
                    continue;
                };
                match stream {
                    EventStream::Stdout => println!("{line}"),
                    EventStream::Stderr => eprintln!("{line}"),
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// One event as a JSON line or a styled row.
fn format_event(event: &WorkflowEvent, json: bool) -> Option<String> {
    if json {
        return serde_json::to_string(event)
            .inspect_err(|e| tracing::warn!(error = %e, "failed to serialize event"))
            .ok();
    }
    let name = event.name();
    let styled = if name.ends_with(":failed") {
        style(name).red()
    } else if name.ends_with(":complete") {
        style(name).green()
    } else {
        style(name).dim()
    };
    Some(match event.step_id() {
        Some(step_id) => format!("  {styled:<24} {}", style(step_id).cyan()),
        None => format!("  {styled}"),
    })
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

fn state_cell(state: RunState) -> Cell {
    let color = match state {
        RunState::Completed => Color::Green,
        RunState::Failed => Color::Red,
        RunState::Compensated | RunState::Compensating => Color::Yellow,
        RunState::Pending | RunState::Running => Color::White,
    };
    Cell::new(state).fg(color)
}

/// One row per executed step, followed by the skipped ones.
pub fn step_table(ctx: &ExecutionContext) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Duration"),
            Cell::new("Detail"),
        ]);

    let mut results: Vec<_> = ctx.step_results.values().collect();
    results.sort_by_key(|r| r.timestamp);
    for result in results {
        let status = match result.status {
            StepStatus::Completed => Cell::new("completed").fg(Color::Green),
            StepStatus::Failed => Cell::new("failed").fg(Color::Red),
        };
        table.add_row(vec![
            Cell::new(&result.step_id),
            status,
            Cell::new(result.attempts),
            Cell::new(format!("{}ms", result.duration_ms)),
            Cell::new(result.error.as_deref().unwrap_or("")),
        ]);
    }
    for skipped in &ctx.skipped {
        table.add_row(vec![
            Cell::new(&skipped.step_id),
            Cell::new("skipped").fg(Color::DarkGrey),
            Cell::new("-"),
            Cell::new("-"),
            Cell::new(skipped.reason.to_string()),
        ]);
    }
    table
}

fn print_report(name: &str, ctx: &ExecutionContext) {
    println!();
    println!(
        "  {} Workflow '{}' run {}",
        style("*").bold(),
        style(name).cyan(),
        style(ctx.run_id).dim()
    );
    println!();
    println!("{}", step_table(ctx));

    if !ctx.compensation_log.is_empty() {
        println!();
        println!("  Compensation:");
        for record in &ctx.compensation_log {
            let mark = match record.status {
                StepStatus::Completed => style("✓").green(),
                StepStatus::Failed => style("✗").red(),
            };
            println!(
                "  {mark} {} <- {}{}",
                record.step_id,
                record.compensation_step_id,
                record
                    .error
                    .as_deref()
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default()
            );
        }
    }

    println!();
    let mut summary = Table::new();
    summary.load_preset(presets::NOTHING).add_row(vec![
        Cell::new("State"),
        state_cell(ctx.state),
        Cell::new("Completed"),
        Cell::new(ctx.completed_count()),
        Cell::new("Duration"),
        Cell::new(format!("{}ms", ctx.duration_ms())),
    ]);
    println!("{summary}");
    println!();
}
