//! Runtime inspector
//!
//! Offline reader for the runtime repository: lists agents and runtimes and
//! prints snapshots, event logs and tool call records.

mod cli;

use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runtime_core::runtime::{EventPayload, RuntimeEvent, RuntimeRepository, ToolCallRecord};

use crate::cli::{Args, Command};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runtime_inspect=info,runtime_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = Args::parse();
    tracing::debug!("Using data directory: {:?}", args.data_dir);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    run(args, &mut out)
}

fn run(args: Args, out: &mut impl Write) -> Result<()> {
    let repository = RuntimeRepository::new(&args.data_dir);

    match args.command {
        Command::Agents => {
            let agents = repository.list_agents().context("Failed to list agents")?;
            if args.json {
                print_json(out, &agents)?;
            } else {
                for agent in agents {
                    writeln!(out, "{}", agent)?;
                }
            }
        }
        Command::List { agent_id } => {
            let summaries = repository
                .list_summaries(&agent_id)
                .with_context(|| format!("Failed to list runtimes of {}", agent_id))?;
            if args.json {
                print_json(out, &summaries)?;
            } else {
                for summary in summaries {
                    writeln!(
                        out,
                        "{}  {:<9}  {}  tools={}  {}",
                        summary.runtime_id,
                        summary.status.as_str(),
                        summary.created_at.format("%Y-%m-%d %H:%M:%S"),
                        summary.tool_call_count,
                        summary.query_preview
                    )?;
                }
            }
        }
        Command::Show {
            agent_id,
            runtime_id,
        } => {
            let runtime = repository
                .load(&agent_id, runtime_id)
                .with_context(|| format!("Failed to load runtime {}", runtime_id))?;
            if args.json {
                print_json(out, &runtime)?;
            } else {
                writeln!(out, "runtime  {}", runtime.runtime_id)?;
                writeln!(out, "agent    {} ({})", runtime.meta.agent_id, runtime.meta.model.name)?;
                writeln!(out, "status   {}", runtime.status)?;
                if let Some(ms) = runtime.duration_ms() {
                    writeln!(out, "duration {}ms", ms)?;
                }
                if let Some(error) = &runtime.error {
                    writeln!(out, "error    {}: {}", error.kind, error.message)?;
                }
                writeln!(out)?;
                for message in &runtime.messages {
                    writeln!(out, "[{:?}] {}", message.role, message.content)?;
                }
                if !runtime.tool_calls.is_empty() {
                    writeln!(out)?;
                    for record in &runtime.tool_calls {
                        writeln!(out, "{}", describe_call(record))?;
                    }
                }
            }
        }
        Command::Events {
            agent_id,
            runtime_id,
        } => {
            let events = repository
                .load_events(&agent_id, runtime_id)
                .with_context(|| format!("Failed to load events of {}", runtime_id))?;
            if args.json {
                print_json(out, &events)?;
            } else {
                for event in &events {
                    writeln!(out, "{}", describe_event(event))?;
                }
            }
        }
        Command::Calls {
            agent_id,
            runtime_id,
        } => {
            let records = repository
                .load_tool_calls(&agent_id, runtime_id)
                .with_context(|| format!("Failed to load tool calls of {}", runtime_id))?;
            if args.json {
                print_json(out, &records)?;
            } else {
                for record in &records {
                    writeln!(out, "{}", describe_call(record))?;
                }
            }
        }
        Command::Delete {
            agent_id,
            runtime_id,
        } => {
            repository
                .delete_runtime(&agent_id, runtime_id)
                .with_context(|| format!("Failed to delete runtime {}", runtime_id))?;
            writeln!(out, "Deleted {}", runtime_id)?;
        }
    }

    Ok(())
}

fn print_json(out: &mut impl Write, value: &impl serde::Serialize) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

fn describe_call(record: &ToolCallRecord) -> String {
    let outcome = match (&record.output, &record.error) {
        (_, Some(error)) => format!("failed ({}): {}", error.kind, error.message),
        (Some(output), None) => format!("ok: {}", preview(output)),
        (None, None) => "running".to_string(),
    };
    let duration = record
        .duration_ms()
        .map(|ms| format!(" {}ms", ms))
        .unwrap_or_default();

    format!("{}  {}{}  {}", record.call_id, record.tool, duration, outcome)
}

fn describe_event(event: &RuntimeEvent) -> String {
    let time = event.timestamp.format("%H:%M:%S%.3f");
    let detail = match &event.payload {
        EventPayload::BeforeInvocation { query } => query.clone(),
        EventPayload::AfterInvocation { status, .. } => status.to_string(),
        EventPayload::MessageAdded { message } => format!("{:?}: {}", message.role, message.content),
        EventPayload::ToolCalled {
            call_id,
            tool,
            input,
            ..
        } => format!("{} {} {}", call_id, tool, preview(input)),
        EventPayload::ToolResult {
            call_id,
            tool,
            error,
            ..
        } => match error {
            Some(error) => format!("{} {} failed: {}", call_id, tool, error.message),
            None => format!("{} {} ok", call_id, tool),
        },
        EventPayload::ErrorOccurred { error, origin, .. } => {
            format!("{:?} {}: {}", origin, error.kind, error.message)
        }
    };

    format!("{}  {:<17}  {}", time, event.kind().as_str(), detail)
}

/// Compact single-line rendering, cut at 80 chars
fn preview(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 80 {
        format!("{}...", text.chars().take(80).collect::<String>())
    } else {
        text
    }
}
