use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stepline_engine::{
    DocumentFormat, ValidationOptions, build_execution_plan, expand_pipeline, load_pipeline, parse_pipeline_file, render_pipeline,
    render_value,
};
use stepline_types::JobInstance;
use stepline_util::{StepLineConfig, is_sensitive_key, redact_sensitive};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_PIPELINES_DIR: &str = "pipelines";

#[derive(Debug, Parser)]
#[command(name = "stepline", version, about = "Validate, expand and plan declarative CI pipelines")]
struct Cli {
    /// Reject matrix steps that never reference a placeholder.
    #[arg(long, global = true)]
    strict: bool,
    /// Output format: yaml or json.
    #[arg(long, global = true)]
    format: Option<String>,
    /// Print environment values and commands without redaction.
    #[arg(long, global = true)]
    show_secrets: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check a pipeline for structural and referential errors
    Validate { file: PathBuf },
    /// Print every job instance produced by matrix expansion
    Expand { file: PathBuf },
    /// Print the staged, dependency-ordered execution plan
    Plan { file: PathBuf },
    /// Print the normalized pipeline document
    Render { file: PathBuf },
    /// List pipeline files in a directory
    List { dir: Option<PathBuf> },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = StepLineConfig::load().unwrap_or_else(|error| {
        warn!(error = %error, "Failed to load config; using defaults");
        StepLineConfig::default()
    });

    let output = run(&cli, &config)?;
    print!("{output}");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: &Cli, config: &StepLineConfig) -> Result<String> {
    let options = ValidationOptions {
        strict: cli.strict || config.strict,
    };
    let format = resolve_format(cli.format.as_deref(), config)?;
    debug!(?options, ?format, "running command");

    match &cli.command {
        Command::Validate { file } => {
            let pipeline = load_pipeline(file, &options)?;
            let plan = build_execution_plan(&pipeline);
            Ok(format!(
                "ok: {}: {} steps, {} jobs in {} stages\n",
                file.display(),
                pipeline.document().steps.len(),
                plan.job_count(),
                plan.stages.len()
            ))
        }
        Command::Expand { file } => {
            let pipeline = load_pipeline(file, &options)?;
            let mut jobs = expand_pipeline(&pipeline);
            if !cli.show_secrets {
                jobs.iter_mut().for_each(redact_job);
            }
            finish(render_value(&jobs, format)?)
        }
        Command::Plan { file } => {
            let pipeline = load_pipeline(file, &options)?;
            let mut plan = build_execution_plan(&pipeline);
            if !cli.show_secrets {
                plan.stages.iter_mut().flat_map(|stage| stage.jobs.iter_mut()).for_each(redact_job);
            }
            finish(render_value(&plan, format)?)
        }
        Command::Render { file } => {
            let document = parse_pipeline_file(file)?;
            finish(render_pipeline(&document, format)?)
        }
        Command::List { dir } => {
            let dir = dir
                .clone()
                .or_else(|| config.pipelines_dir())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PIPELINES_DIR));
            list_pipelines(&dir)
        }
    }
}

fn resolve_format(flag: Option<&str>, config: &StepLineConfig) -> Result<DocumentFormat> {
    match flag.or(config.default_format.as_deref()) {
        Some(raw) => raw.parse(),
        None => Ok(DocumentFormat::Yaml),
    }
}

fn finish(mut rendered: String) -> Result<String> {
    if !rendered.ends_with('\n') {
        rendered.push('\n');
    }
    Ok(rendered)
}

fn redact_job(job: &mut JobInstance) {
    for (key, value) in job.env.iter_mut() {
        if is_sensitive_key(key) {
            *value = "<redacted>".to_string();
        }
    }
    for command in job.commands.iter_mut() {
        *command = redact_sensitive(command);
    }
}

fn list_pipelines(dir: &Path) -> Result<String> {
    if !dir.exists() {
        return Ok(format!("No pipelines directory found at {}\n", dir.display()));
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))? {
        let path = entry?.path();
        let is_pipeline = path
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| matches!(extension.to_ascii_lowercase().as_str(), "yml" | "yaml" | "json"));
        if path.is_file() && is_pipeline {
            files.push(path);
        }
    }
    files.sort();

    Ok(files.iter().map(|path| format!("{}\n", path.display())).collect())
}
