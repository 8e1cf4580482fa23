use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;

use sweep_runner::{SearchReport, SearchRunner, StudyConfig};
use sweep_store::{FileLedger, Trial, TrialLedger};

#[derive(Parser)]
#[command(name = "sweep", version = "0.1.0", about = "Simulator configuration sweep CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a study.yaml template into the current directory
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Show the resolved search plan for a study
    Describe {
        study: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Run the search until the target trial count is reached
    Run {
        study: PathBuf,
        #[arg(long)]
        trials: Option<usize>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Report the minimum-objective configuration recorded so far
    Best {
        study: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List every recorded trial
    Trials {
        study: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Init { force } => {
            let path = PathBuf::from("study.yaml");
            if !force && path.exists() {
                return Err(anyhow::anyhow!(format!(
                    "init file already exists (use --force): {}",
                    path.display()
                )));
            }
            std::fs::write(&path, STUDY_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!(
                "next: edit {} \u{2014} fill in all fields marked REQUIRED",
                path.display()
            );
            println!("next: sweep describe {}", path.display());
        }
        Commands::Describe { study, json } => {
            let config = StudyConfig::load(&study)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "study": describe_to_json(&config)
                })));
            }
            print_describe(&config);
        }
        Commands::Run {
            study,
            trials,
            workers,
            json,
        } => {
            let config = StudyConfig::load(&study)?;
            let target = trials.unwrap_or(config.search.trials);
            let workers = workers.unwrap_or(config.search.workers);
            let runner = SearchRunner::from_config(config)?;
            let report = runner.run(target, workers)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "target": target,
                    "workers": workers,
                    "report": report_to_json(&report)
                })));
            }
            println!("issued: {}", report.issued);
            println!("completed: {}", report.completed);
            println!("pruned: {}", report.pruned);
            println!("failed: {}", report.failed);
            print_best(&report.best);
        }
        Commands::Best { study, json } => {
            let config = StudyConfig::load(&study)?;
            let ledger = FileLedger::open(&config.study_dir())?;
            let best = ledger.best_objective()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "best",
                    "best": best.as_ref().map(|(configuration, value)| json!({
                        "configuration": configuration,
                        "value": value
                    }))
                })));
            }
            print_best(&best);
        }
        Commands::Trials { study, json } => {
            let config = StudyConfig::load(&study)?;
            let ledger = FileLedger::open(&config.study_dir())?;
            let trials = ledger.all_trials()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "trials",
                    "count": trials.len(),
                    "trials": trials.iter().map(trial_to_json).collect::<Vec<_>>()
                })));
            }
            for trial in &trials {
                let detail = match trial.state {
                    sweep_store::TrialState::Complete => trial
                        .value
                        .map(|v| format!(" value={}", v))
                        .unwrap_or_default(),
                    sweep_store::TrialState::Pruned => trial
                        .prune_reason
                        .as_ref()
                        .map(|r| format!(" reason={}", r))
                        .unwrap_or_default(),
                    sweep_store::TrialState::Failed => trial
                        .exit_code
                        .map(|c| format!(" exit_code={}", c))
                        .unwrap_or_default(),
                    sweep_store::TrialState::Running => String::new(),
                };
                println!(
                    "trial_{:06} {} [{}]{}",
                    trial.id, trial.state, trial.configuration, detail
                );
            }
            println!("total: {}", trials.len());
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Run { json, .. }
        | Commands::Best { json, .. }
        | Commands::Trials { json, .. } => *json,
        _ => false,
    }
}

fn describe_to_json(config: &StudyConfig) -> Value {
    json!({
        "name": config.study.name,
        "state_dir": config.study_dir().display().to_string(),
        "sampler": config.search.sampler.as_str(),
        "trials": config.search.trials,
        "workers": config.search.workers,
        "per_worker_delay_secs": config.search.per_worker_delay_secs,
        "stale_running_secs": config.search.stale_running_secs,
        "combinations": config.domains().cardinality(),
        "domains": config.space.domains,
        "fixed": config.space.fixed,
        "runner": config.simulator.runner.display().to_string(),
        "timeout_secs": config.simulator.timeout_secs,
        "memory_limit_mb": config.simulator.memory_limit_mb,
        "logs_dir": config.simulator.logs_dir.display().to_string(),
        "validation": config.validation.as_ref().map(|v| json!({
            "token": v.token,
            "expected": v.expected
        }))
    })
}

fn report_to_json(report: &SearchReport) -> Value {
    json!({
        "issued": report.issued,
        "completed": report.completed,
        "pruned": report.pruned,
        "failed": report.failed,
        "best": report.best.as_ref().map(|(configuration, value)| json!({
            "configuration": configuration,
            "value": value
        }))
    })
}

fn trial_to_json(trial: &Trial) -> Value {
    json!({
        "id": trial.id,
        "state": trial.state.to_string(),
        "configuration": trial.configuration,
        "value": trial.value,
        "prune_reason": trial.prune_reason,
        "exit_code": trial.exit_code,
        "created_at": trial.created_at.to_rfc3339(),
        "completed_at": trial.completed_at.map(|t| t.to_rfc3339())
    })
}

fn print_describe(config: &StudyConfig) {
    println!("study: {}", config.study.name);
    println!("state_dir: {}", config.study_dir().display());
    println!("sampler: {}", config.search.sampler.as_str());
    println!("trials: {}", config.search.trials);
    println!("workers: {}", config.search.workers);
    println!(
        "per_worker_delay_secs: {}",
        config.search.per_worker_delay_secs
    );
    println!("combinations: {}", config.domains().cardinality());
    println!("domains:");
    for domain in &config.space.domains {
        println!("  {}: {:?}", domain.name, domain.choices);
    }
    if !config.space.fixed.is_empty() {
        println!("fixed:");
        for (name, value) in &config.space.fixed {
            println!("  {}: {}", name, value);
        }
    }
    println!("runner: {}", config.simulator.runner.display());
    println!("timeout_secs: {}", config.simulator.timeout_secs);
    if let Some(limit) = config.simulator.memory_limit_mb {
        println!("memory_limit_mb: {}", limit);
    }
    println!("logs_dir: {}", config.simulator.logs_dir.display());
    match &config.validation {
        Some(check) => println!("validation: {}={}", check.token, check.expected),
        None => println!("validation: none"),
    }
}

fn print_best(best: &Option<(sweep_core::Configuration, u64)>) {
    match best {
        Some((configuration, value)) => {
            println!("best_value: {}", value);
            println!("best_configuration: {}", configuration);
        }
        None => println!("best_value: none"),
    }
}

const STUDY_TEMPLATE: &str = "\
version: '0.1'
study:
  name: ''                           # REQUIRED
  dir: .sweep
search:
  trials: 0                          # REQUIRED: set > 0
  workers: 10
  per_worker_delay_secs: 60
  sampler: grid                      # grid | random
  stale_running_secs: 86400          # 0 keeps stale running trials blocking
  lock_wait_secs: 30
space:
  domains:
    - { name: cores, choices: [1, 2, 4, 8] }
    - { name: warps, choices: [2, 4, 8, 16, 32, 64] }
    - { name: threads, choices: [1, 2, 4, 8, 16, 32, 64] }
    - { name: clusters, choices: [1, 2, 4] }
    - { name: l2cache, choices: [0, 1] }
    - { name: l3cache, choices: [0, 1] }
  fixed: {}
simulator:
  runner: ''                         # REQUIRED: e.g. ./run_sim.sh
  simulator_path: ''                 # REQUIRED: simulator checkout
  library_path: ''                   # REQUIRED: kernel library checkout
  matrix_path: ''                    # REQUIRED: workload matrix file
  timeout_secs: 60000
  memory_limit_mb: null
  logs_dir: logs
validation: null
# validation:
#   token: errors
#   expected: 0
";
