use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use pipeline_core::{
    ContentItem, EventSink, Graph, PipelineDefinition, PipelineEvent, RunStatus, Scheduler,
    UnitRegistry,
};
use serde_json::Value;

#[derive(Debug, Default)]
pub struct RunOptions {
    pub input: Option<String>,
    pub input_file: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    pub events: bool,
    pub report: bool,
}

/// Writes each event to stderr as one JSON line
struct StderrSink;

impl EventSink for StderrSink {
    fn emit(&self, event: PipelineEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            eprintln!("{line}");
        }
    }
}

fn load(file: &Path) -> Result<(PipelineDefinition, Graph)> {
    let definition = PipelineDefinition::from_file(file)
        .with_context(|| format!("Failed to load {}", file.display()))?;
    let graph = definition
        .build(&UnitRegistry::with_builtins())
        .with_context(|| format!("Pipeline '{}' is invalid", definition.name))?;
    Ok((definition, graph))
}

pub fn validate(file: &Path, out: &mut impl Write) -> Result<()> {
    let (definition, graph) = load(file)?;
    writeln!(
        out,
        "✓ {}: pipeline '{}' is valid ({} units, {} edges, {} sub-pipelines)",
        file.display(),
        graph.name(),
        graph.units().len(),
        graph.edges().len(),
        definition.pipelines.len()
    )?;
    Ok(())
}

pub fn inspect(file: &Path, out: &mut impl Write) -> Result<()> {
    let (definition, graph) = load(file)?;
    if let Some(description) = &definition.description {
        writeln!(out, "{description}")?;
    }
    write!(out, "{}", graph.describe())?;
    writeln!(out, "order: {}", graph.topological_order().join(" -> "))?;
    writeln!(out, "sinks: {}", graph.sinks().join(", "))?;
    for (name, pipeline) in &definition.pipelines {
        writeln!(
            out,
            "sub-pipeline '{name}' (start: {}, {} units)",
            pipeline.start,
            pipeline.units.len()
        )?;
    }
    Ok(())
}

fn read_input(options: &RunOptions) -> Result<ContentItem> {
    let raw = match (&options.input, &options.input_file) {
        (Some(json), _) => json.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read input from {}", path.display()))?,
        (None, None) => return Ok(ContentItem::new(Default::default())),
    };
    let value: Value = serde_json::from_str(&raw).context("Input is not valid JSON")?;
    if !value.is_object() {
        bail!("Input must be a JSON object");
    }
    Ok(ContentItem::from_value(value))
}

/// Runs the pipeline; Ctrl-C cancels the run cooperatively
pub async fn run(file: &Path, options: RunOptions, out: &mut impl Write) -> Result<RunStatus> {
    let (definition, graph) = load(file)?;
    let mut config = definition.runtime.clone().apply_env_overrides()?;
    if let Some(ms) = options.timeout_ms {
        config.run_timeout_ms = Some(ms);
    }
    let input = read_input(&options)?;

    let mut scheduler = Scheduler::new(config);
    if options.events {
        scheduler = scheduler.with_event_sink(Arc::new(StderrSink));
    }
    let ctx = scheduler.context();
    let interrupt = ctx.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            interrupt.cancel("interrupted");
        }
    });

    tracing::info!(pipeline = %graph.name(), run_id = %ctx.run_id(), "Starting run");
    let report = scheduler.run_with_context(&graph, input, &ctx).await;
    watcher.abort();

    if options.report {
        serde_json::to_writer_pretty(&mut *out, &report)?;
        writeln!(out)?;
    } else {
        for item in &report.outputs {
            serde_json::to_writer(&mut *out, &item.to_value())?;
            writeln!(out)?;
        }
    }

    match report.status {
        RunStatus::Completed => {}
        RunStatus::Failed => {
            if let Some(failure) = &report.failure {
                eprintln!("run failed: {}", failure.chain.join(": "));
            }
        }
        RunStatus::Cancelled => {
            eprintln!(
                "run cancelled: {}",
                report.cancel_reason.as_deref().unwrap_or("cancelled")
            );
        }
    }
    Ok(report.status)
}

pub fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Failed => ExitCode::from(1),
        RunStatus::Cancelled => ExitCode::from(2),
    }
}
