//! commitprobe - score a commit's risk and check it with synthesized tests
//!
//! Usage:
//!   commitprobe run [--repo <dir>] [--rev <rev>] [--config <file>] [--all] [--full-tree]
//!   commitprobe config [--file <file>]

mod git;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use commitprobe_core::backend::http::{API_KEY_ENV, ENDPOINT_ENV, MODEL_ENV};
use commitprobe_core::sandbox::NetworkIsolation;
use commitprobe_core::{
    CancelToken, EngineConfig, FingerprintCache, FsCacheStore, HttpBackendConfig,
    HttpModelBackend, Orchestrator, ProcessSandbox, RunReport, SandboxPolicy,
};
use serde::Deserialize;
use tracing::{info, warn, Level};

/// Key of the sandbox table inside a config file.
const SANDBOX_TABLE: &str = "sandbox";

#[derive(Parser)]
#[command(name = "commitprobe")]
#[command(about = "Commit risk scoring and test synthesis")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze one commit and write a report
    Run(RunArgs),

    /// Print the effective configuration as TOML
    Config {
        /// Config file to load (defaults are printed when omitted)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Repository to read the commit from
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Revision to analyze
    #[arg(long, default_value = "HEAD")]
    rev: String,

    /// Analyze every tracked source file at the revision as if newly added
    #[arg(long)]
    all: bool,

    /// Give the sandbox the whole tree at the revision, not just changed files
    #[arg(long)]
    full_tree: bool,

    /// Config file (engine keys at top level, optional [sandbox] table)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Persist the fingerprint cache under this directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Where to write the JSON report
    #[arg(long, default_value = "commitprobe-report.json")]
    report: PathBuf,

    /// Also write a markdown summary here
    #[arg(long)]
    markdown: Option<PathBuf>,

    /// Write synthesized test files into this directory
    #[arg(long)]
    emit_tests: Option<PathBuf>,

    /// Model backend endpoint
    #[arg(long, env = ENDPOINT_ENV)]
    endpoint: String,

    /// Model name sent to the backend
    #[arg(long, env = MODEL_ENV, default_value = "default")]
    model: String,

    /// Bearer token for the backend
    #[arg(long, env = API_KEY_ENV, hide_env_values = true)]
    api_key: Option<String>,

    /// Run tests inside a fresh network namespace
    #[arg(long)]
    unshare: bool,
}

/// Parsed config file: engine keys plus the sandbox table.
#[derive(Debug, Default)]
struct LoadedConfig {
    engine: EngineConfig,
    sandbox: SandboxPolicy,
}

#[derive(Deserialize)]
struct SandboxSection {
    #[serde(default)]
    sandbox: SandboxPolicy,
}

fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let Some(path) = path else {
        return Ok(LoadedConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("Invalid config {}", path.display()))
}

fn parse_config(raw: &str) -> Result<LoadedConfig> {
    let mut table: toml::Table = toml::from_str(raw)?;
    let sandbox_raw = table.remove(SANDBOX_TABLE);
    let engine = EngineConfig::from_toml_str(&toml::to_string(&table)?)?;

    let sandbox = match sandbox_raw {
        Some(value) => {
            let mut wrapper = toml::Table::new();
            wrapper.insert(SANDBOX_TABLE.to_string(), value);
            let section: SandboxSection = toml::Value::Table(wrapper).try_into()?;
            section.sandbox
        }
        None => SandboxPolicy::default(),
    };
    sandbox.validate()?;
    Ok(LoadedConfig { engine, sandbox })
}

fn render_config(config: &LoadedConfig) -> Result<String> {
    let mut table = match toml::Value::try_from(&config.engine)? {
        toml::Value::Table(table) => table,
        other => anyhow::bail!("engine config rendered as {}", other.type_str()),
    };
    table.insert(
        SANDBOX_TABLE.to_string(),
        toml::Value::try_from(&config.sandbox)?,
    );
    Ok(toml::to_string_pretty(&table)?)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    commitprobe_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Config { file } => {
            let config = load_config(file.as_deref())?;
            print!("{}", render_config(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn cmd_run(args: RunArgs) -> Result<ExitCode> {
    let mut loaded = load_config(args.config.as_deref())?;
    if args.unshare {
        loaded.sandbox.network = NetworkIsolation::Unshare;
    }
    let LoadedConfig { engine, sandbox } = loaded;

    let collected = if args.all {
        git::collect_tree(&args.repo, &args.rev)
    } else {
        git::collect_commit(&args.repo, &args.rev)
    };
    let mut input = collected
        .with_context(|| format!("Failed to read {} from {}", args.rev, args.repo.display()))?;
    if args.full_tree {
        let files = git::collect_context(&args.repo, &mut input)
            .with_context(|| format!("Failed to export the tree of {}", args.rev))?;
        info!(files, "sandbox tree exported");
    }

    let mut backend_config =
        HttpBackendConfig::new(args.endpoint, args.model).with_timeout(engine.model_timeout());
    if let Some(key) = args.api_key {
        backend_config = backend_config.with_api_key(key);
    }
    let backend = Arc::new(HttpModelBackend::new(backend_config)?);

    let cache = match &args.cache_dir {
        Some(dir) => {
            let store = FsCacheStore::new(dir)
                .with_context(|| format!("Failed to open cache at {}", dir.display()))?;
            FingerprintCache::with_store(engine.cache_capacity, Arc::new(store))
        }
        None => FingerprintCache::new(engine.cache_capacity),
    };
    let executor = Arc::new(ProcessSandbox::new(sandbox)?);

    let orchestrator = Orchestrator::new(engine, backend, Arc::new(cache), executor)?;

    let cancel = CancelToken::new();
    let listener = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            listener.cancel();
        }
    });

    let run = orchestrator.run(input, cancel).await;
    let report = RunReport::from_run(&run, orchestrator.config());

    commitprobe_core::write_report_json(&args.report, &report)?;
    info!(path = %args.report.display(), "report written");
    if let Some(path) = &args.markdown {
        commitprobe_core::write_markdown(path, &report)?;
    }
    if let Some(dir) = &args.emit_tests {
        emit_tests(dir, &run.tests)?;
    }

    println!(
        "{} {} commit score {:.2} residual {:.2} ({} units, {} tests)",
        report.state,
        report.commit.get(..12).unwrap_or(&report.commit),
        report.commit_score,
        report.residual_commit_score,
        report.summary.units,
        report.summary.tests_synthesized,
    );

    if report.succeeded() {
        Ok(ExitCode::SUCCESS)
    } else {
        if let Some(failure) = &report.failure {
            eprintln!("run failed in {}: {}", failure.state, failure.reason);
        }
        Ok(ExitCode::FAILURE)
    }
}

fn emit_tests(dir: &Path, tests: &[commitprobe_core::SynthesizedTest]) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    for test in tests {
        let path = dir.join(&test.file_name);
        std::fs::write(&path, &test.source)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    info!(count = tests.len(), dir = %dir.display(), "synthesized tests written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_defaults_when_empty() {
        let loaded = parse_config("").unwrap();
        assert_eq!(loaded.engine, EngineConfig::default());
        assert_eq!(loaded.sandbox, SandboxPolicy::default());
    }

    #[test]
    fn parse_config_reads_engine_and_sandbox() {
        let raw = r#"
riskThreshold = 0.8
concurrencyLimit = 2

[sandbox]
network = "unshare"
maxOutputBytes = 1024
"#;
        let loaded = parse_config(raw).unwrap();
        assert_eq!(loaded.engine.risk_threshold, 0.8);
        assert_eq!(loaded.engine.concurrency_limit, 2);
        assert_eq!(loaded.sandbox.network, NetworkIsolation::Unshare);
        assert_eq!(loaded.sandbox.max_output_bytes, 1024);
        assert_eq!(loaded.sandbox.python, "python3");
    }

    #[test]
    fn parse_config_rejects_bad_threshold() {
        assert!(parse_config("riskThreshold = 1.5").is_err());
    }

    #[test]
    fn rendered_config_parses_back() {
        let mut config = LoadedConfig::default();
        config.engine.move_detection = true;
        config.sandbox.network = NetworkIsolation::Unshare;
        let rendered = render_config(&config).unwrap();
        assert!(rendered.contains("[sandbox]"));
        let parsed = parse_config(&rendered).unwrap();
        assert_eq!(parsed.engine, config.engine);
        assert_eq!(parsed.sandbox, config.sandbox);
    }

    #[test]
    fn load_config_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn cli_parses_run_args() {
        let parsed = Cli::try_parse_from([
            "commitprobe",
            "run",
            "--endpoint",
            "http://localhost:8080",
            "--rev",
            "HEAD~2",
        ])
        .unwrap();
        match parsed.command {
            Commands::Run(args) => {
                assert_eq!(args.rev, "HEAD~2");
                assert_eq!(args.report, PathBuf::from("commitprobe-report.json"));
                assert!(!args.all);
                assert!(!args.full_tree);
            }
            Commands::Config { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn cli_parses_baseline_flags() {
        let parsed = Cli::try_parse_from([
            "commitprobe",
            "run",
            "--endpoint",
            "http://localhost:8080",
            "--all",
            "--full-tree",
        ])
        .unwrap();
        let Commands::Run(args) = parsed.command else {
            panic!("expected run");
        };
        assert!(args.all);
        assert!(args.full_tree);
    }
}
