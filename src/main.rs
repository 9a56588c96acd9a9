//! covolve CLI - adversarial test-suite hardening.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use covolve::analyzer::AnalyzerBridge;
use covolve::config::{self, Config};
use covolve::context::RuntimeContext;
use covolve::knowledge::bugs;
use covolve::planner::Planner;
use covolve::preprocess::preprocess_targets;
use covolve::report;
use covolve::scanner::scan_project;
use covolve::store::Checkpoint;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "covolve")]
#[command(about = "Co-evolve unit tests against LLM-generated mutants", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full co-evolution pipeline
    Run {
        /// Path to the target project
        #[arg(long)]
        project_path: PathBuf,

        /// Configuration file path
        #[arg(short, long, default_value = "covolve.toml")]
        config: PathBuf,

        /// Override maximum planner rounds
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Override the LLM call budget
        #[arg(long)]
        budget: Option<u32>,

        /// Force-enable the parallel preprocessing phase
        #[arg(long)]
        parallel: bool,

        /// Override concurrently evaluated targets in the main loop
        #[arg(long)]
        parallel_targets: Option<usize>,

        /// Directory of bug reports to ingest
        #[arg(long)]
        bug_reports_dir: Option<PathBuf>,

        /// Resume from a checkpoint file
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Verbose (DEBUG) logging
        #[arg(long)]
        debug: bool,
    },

    /// Enumerate targets without running the loop
    Scan {
        /// Path to the target project
        #[arg(long)]
        project_path: PathBuf,

        /// Configuration file path
        #[arg(short, long, default_value = "covolve.toml")]
        config: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate the configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, default_value = "covolve.toml")]
        config: PathBuf,
    },

    /// Write a starter configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Run {
            project_path,
            config,
            max_iterations,
            budget,
            parallel,
            parallel_targets,
            bug_reports_dir,
            resume,
            debug,
        } => {
            setup_logging(debug)?;
            let overrides = Overrides {
                max_iterations,
                budget,
                parallel,
                parallel_targets,
                bug_reports_dir,
            };
            match run(&project_path, &config, overrides, resume).await {
                Ok(code) => code,
                Err(e) => {
                    error!("fatal: {e:#}");
                    1
                }
            }
        }
        Commands::Scan {
            project_path,
            config,
            format,
        } => {
            setup_logging(false)?;
            match scan(&project_path, &config, &format).await {
                Ok(()) => 0,
                Err(e) => {
                    error!("fatal: {e:#}");
                    1
                }
            }
        }
        Commands::Validate { config } => validate_config(&config),
        Commands::Init => init_config()?,
    };

    std::process::exit(exit_code);
}

fn setup_logging(debug: bool) -> Result<()> {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

struct Overrides {
    max_iterations: Option<u32>,
    budget: Option<u32>,
    parallel: bool,
    parallel_targets: Option<usize>,
    bug_reports_dir: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(n) = self.max_iterations {
            config.agent.max_iterations = n;
        }
        if let Some(n) = self.budget {
            config.agent.budget_llm_calls = n;
        }
        if self.parallel {
            config.preprocessing.enabled = true;
        }
        if let Some(n) = self.parallel_targets {
            config.agent.parallel_targets = n;
        }
        if let Some(dir) = self.bug_reports_dir {
            config.run.bug_reports_dir = Some(dir);
        }
    }
}

async fn run(
    project_path: &Path,
    config_path: &Path,
    overrides: Overrides,
    resume: Option<PathBuf>,
) -> Result<i32> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    overrides.apply(&mut config);
    let source_root = config.project.source_root.clone();
    let preprocessing_enabled = config.preprocessing.enabled;
    let bug_reports_dir = config.run.bug_reports_dir.clone();

    let ctx = RuntimeContext::initialize(config, project_path)
        .await
        .context("initialization failed")?;

    // Cooperative cancellation on Ctrl-C, honored between atomic steps.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("cancellation requested");
                cancel.cancel();
            }
        });
    }

    let resuming = resume.is_some();
    let workspace = ctx
        .sandboxes
        .create_workspace(&ctx.project_path, resuming)
        .await?;

    let mut planner = match &resume {
        Some(checkpoint_path) => {
            let checkpoint = Checkpoint::load(checkpoint_path)?;
            info!(
                round = checkpoint.round,
                targets = checkpoint.targets.len(),
                "resuming from checkpoint"
            );
            Planner::from_checkpoint(&ctx, workspace, checkpoint)
        }
        None => {
            let targets = scan_project(&ctx.project_path, &source_root, &ctx.analyzer).await?;
            Planner::new(&ctx, workspace, targets)
        }
    };

    // (Re)build this run's retrieval namespace.
    ctx.knowledge.clear();
    for state in planner.states() {
        ctx.knowledge.index_source(&state.target).await;
    }
    if let Some(dir) = &bug_reports_dir {
        let reports = bugs::load_bug_reports(dir)
            .with_context(|| format!("failed to read bug reports from {}", dir.display()))?;
        info!(reports = reports.len(), "ingesting bug reports");
        ctx.knowledge.index_bug_reports(&reports).await;
    }
    info!(chunks = ctx.knowledge.chunk_count(), "knowledge base ready");
    if ctx.knowledge.is_enabled() {
        ctx.knowledge.persist(&ctx.state_dir.join("chunks.json"))?;
    }

    if preprocessing_enabled && !resuming {
        let targets: Vec<covolve::Target> = planner
            .states()
            .iter()
            .map(|s| s.target.clone())
            .collect();
        let outcomes = preprocess_targets(&ctx, planner.workspace(), &targets, &cancel).await;
        planner.integrate_preprocessed(outcomes).await?;
    }

    let stop = planner.run(&cancel).await?;

    let summary = report::build_summary(planner.states(), planner.budget(), stop);
    report::print_summary(&summary);
    report::save_summary(&summary, &ctx.summary_path())?;

    Ok(stop.exit_code())
}

async fn scan(project_path: &Path, config_path: &Path, format: &str) -> Result<()> {
    let config = config::load_config(config_path)?;
    let analyzer = AnalyzerBridge::new(&config.analyzer)?;
    let project_path = PathBuf::from(
        shellexpand::tilde(&project_path.to_string_lossy()).into_owned(),
    );

    let targets = scan_project(&project_path, &config.project.source_root, &analyzer).await?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&targets)?;
            println!("{json}");
        }
        _ => {
            println!("Discovered {} targets:", targets.len());
            for target in &targets {
                println!(
                    "  {}  [{}:{}-{}]",
                    target.id,
                    target.source_file.display(),
                    target.line_start,
                    target.line_end
                );
            }
        }
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> i32 {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Model: {}", config.llm.model);
            println!("  Max rounds: {}", config.agent.max_iterations);
            println!("  LLM budget: {}", config.agent.budget_llm_calls);
            println!("  Parallel targets: {}", config.agent.parallel_targets);
            println!(
                "  Knowledge: {}",
                if config.knowledge.enabled { "enabled" } else { "disabled" }
            );
            println!(
                "  Preprocessing: {} ({} workers)",
                if config.preprocessing.enabled { "enabled" } else { "disabled" },
                config.preprocessing.max_workers
            );
            0
        }
        Err(e) => {
            eprintln!("Configuration error: {e}");
            1
        }
    }
}

fn init_config() -> Result<i32> {
    let content = r#"# covolve configuration file

[llm]
base_url = "${LLM_BASE_URL:-https://api.openai.com/v1}"
api_key = "${LLM_API_KEY}"
model = "gpt-4o"
temperature = 0.7

[knowledge]
enabled = true
top_k_contracts = 5
top_k_bugs = 3
alpha = 0.7

[preprocessing]
enabled = true
max_workers = 4

[formatting]
style = "GOOGLE"

[agent]
max_iterations = 30
budget_llm_calls = 200
stop_on_no_improvement_rounds = 3
parallel_targets = 2

[agent.excellence_thresholds]
mutation_score = 0.95
line_coverage = 0.90
branch_coverage = 0.85

[run]
state_dir = ".covolve"
"#;

    let path = PathBuf::from("covolve.toml");
    if path.exists() {
        eprintln!("covolve.toml already exists. Remove it first or edit manually.");
        return Ok(1);
    }

    std::fs::write(&path, content)?;
    println!("Created covolve.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  covolve run --project-path path/to/project");

    Ok(0)
}
