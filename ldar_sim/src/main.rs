//! LDAR Simulator CLI
//!
//! Run a configuration file or a built-in scenario across Monte-Carlo
//! replicates and write the result tables.

use clap::Parser;
use ldar_core::SimulationConfig;
use ldar_env::{InputCatalog, JsonCatalog, JsonLinesSink, MemorySink, ResultSink};
use ldar_sim::scenarios::ScenarioId;
use ldar_sim::{BatchReport, BatchRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Exit code for configuration errors.
const EXIT_CONFIG: i32 = 2;

/// Exit code when any replicate or scenario check failed.
const EXIT_FAILED: i32 = 1;

/// LDAR Monte-Carlo Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "ldar-sim")]
#[command(about = "Simulate methane leak detection and repair programs", long_about = None)]
struct Args {
    /// Simulation configuration (JSON)
    #[arg(short, long, conflicts_with = "scenario")]
    config: Option<PathBuf>,

    /// Built-in scenario to run (single_leak_ogi, zero_coverage, no_program, ogi_vs_truck, route_limited, all)
    #[arg(short = 'S', long)]
    scenario: Option<String>,

    /// Base seed; implies deterministic replicate seeds
    #[arg(short, long)]
    seed: Option<u64>,

    /// Number of replicates
    #[arg(short = 'n', long)]
    simulations: Option<u32>,

    /// Replicates run at once
    #[arg(short, long)]
    processes: Option<usize>,

    /// Directory for the result tables
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// JSON summary on stdout
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply_overrides(&self, config: &mut SimulationConfig) {
        if let Some(seed) = self.seed {
            config.base_seed = seed;
            config.preseed_random = true;
        }
        if let Some(n) = self.simulations {
            config.n_simulations = n;
        }
        if let Some(p) = self.processes {
            config.n_processes = Some(p);
        }
        if let Some(dir) = &self.output_dir {
            config.output_directory = Some(dir.clone());
        }
    }
}

/// One batch to run, with its optional scenario check.
struct Job {
    name: String,
    config: SimulationConfig,
    catalog: Arc<dyn InputCatalog>,
    injected: Vec<ldar_core::world::LeakSpawn>,
    scenario: Option<ScenarioId>,
}

fn load_jobs(args: &Args) -> Result<Vec<Job>, String> {
    if let Some(path) = &args.config {
        let config = SimulationConfig::from_path(path).map_err(|e| e.to_string())?;
        let root = config
            .input_directory
            .clone()
            .unwrap_or_else(|| path.parent().map(Path::to_path_buf).unwrap_or_default());
        return Ok(vec![Job {
            name: path.display().to_string(),
            config,
            catalog: Arc::new(JsonCatalog::new(root)),
            injected: Vec::new(),
            scenario: None,
        }]);
    }

    let ids = match args.scenario.as_deref() {
        None | Some("all") => ScenarioId::all(),
        Some(name) => vec![name.parse::<ScenarioId>()?],
    };
    Ok(ids
        .into_iter()
        .map(|id| {
            let scenario = id.build();
            Job {
                name: id.name().to_string(),
                config: scenario.config,
                catalog: Arc::new(scenario.catalog) as Arc<dyn InputCatalog>,
                injected: scenario.injected,
                scenario: Some(id),
            }
        })
        .collect())
}

async fn run_job(args: &Args, mut job: Job) -> Result<(BatchReport, Result<(), String>), String> {
    args.apply_overrides(&mut job.config);

    let sink: Arc<dyn ResultSink> = match &job.config.output_directory {
        Some(dir) => {
            let dir = if job.scenario.is_some() { dir.join(&job.name) } else { dir.clone() };
            Arc::new(JsonLinesSink::create(dir).await.map_err(|e| e.to_string())?)
        }
        None => Arc::new(MemorySink::new()),
    };

    // Scenario checks inspect full outcomes; config runs only need summaries
    let runner = BatchRunner::new(job.config, job.catalog, sink)
        .map_err(|e| e.to_string())?
        .with_injected_leaks(job.injected)
        .with_retained_outcomes(job.scenario.is_some());
    let report = runner.run().await.map_err(|e| e.to_string())?;

    let check = match job.scenario {
        Some(id) => id.verify(&report),
        None if report.failed() > 0 => Err(format!("{} replicate(s) failed", report.failed())),
        None => Ok(()),
    };
    Ok((report, check))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    if !args.json {
        info!("LDAR Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let jobs = match load_jobs(&args) {
        Ok(jobs) => jobs,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let mut failed = 0;
    let mut results = Vec::new();
    for job in jobs {
        let name = job.name.clone();
        let (report, check) = match run_job(&args, job).await {
            Ok(done) => done,
            Err(e) => {
                eprintln!("Error in {}: {}", name, e);
                std::process::exit(EXIT_CONFIG);
            }
        };

        if !args.json {
            for agg in &report.aggregates {
                info!(
                    "  {:<12} emitted {:>12.1} kg | cost {:>12} | avoided {}",
                    agg.program,
                    agg.mean_emitted_kg,
                    agg.mean_total_cost,
                    agg.mean_avoided_kg.map_or("-".to_string(), |kg| format!("{:.1} kg", kg)),
                );
            }
            match &check {
                Ok(()) => info!("✓ {} ({} replicates) PASSED", name, report.replicates.len()),
                Err(reason) => error!("✗ {} FAILED: {}", name, reason),
            }
        }
        if check.is_err() {
            failed += 1;
        }
        results.push(serde_json::json!({
            "name": name,
            "run_id": report.run_id.as_uuid(),
            "passed": check.is_ok(),
            "failure_reason": check.err(),
            "replicates": report.replicates,
            "programs": report.aggregates,
        }));
    }

    if args.json {
        let summary = serde_json::json!({
            "total": results.len(),
            "failed": failed,
            "results": results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to render summary: {}", e),
        }
    } else if failed == 0 {
        info!("✅ All {} batch(es) passed", results.len());
    } else {
        error!("❌ {}/{} batch(es) failed", failed, results.len());
    }

    if failed > 0 {
        std::process::exit(EXIT_FAILED);
    }
}
