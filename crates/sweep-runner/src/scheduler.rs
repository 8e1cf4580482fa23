use anyhow::{anyhow, bail, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sweep_core::{Configuration, Outcome, ParamDomains};
use sweep_store::{FileLedger, TrialLedger};

use crate::dedup::{Claim, ClaimError, DedupGuard};
use crate::invoke::Invoker;
use crate::parse::classify;
use crate::study::StudyConfig;
use crate::suggest::{build_suggester, SuggestError, Suggester};

/// Aggregate result of one search run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchReport {
    pub issued: usize,
    pub completed: usize,
    pub pruned: usize,
    pub failed: usize,
    pub best: Option<(Configuration, u64)>,
}

/// Deterministic launch offset for a slot: workers sharing one host start
/// their simulations `per_worker_delay` apart instead of all at once.
pub fn stagger_delay(slot: usize, workers: usize, per_worker_delay: Duration) -> Duration {
    per_worker_delay * ((slot % workers) as u32)
}

#[derive(Default)]
struct Counters {
    issued: AtomicUsize,
    completed: AtomicUsize,
    pruned: AtomicUsize,
    failed: AtomicUsize,
}

enum SlotStatus {
    Done,
    Drained,
}

/// Drives a bounded pool of workers pulling trial slots until the target
/// count is reached or the suggester runs dry.
pub struct SearchRunner {
    config: StudyConfig,
    ledger: Arc<dyn TrialLedger>,
    suggester: Arc<dyn Suggester>,
    invoker: Invoker,
}

impl SearchRunner {
    pub fn new(
        config: StudyConfig,
        ledger: Arc<dyn TrialLedger>,
        suggester: Arc<dyn Suggester>,
    ) -> Self {
        let invoker = Invoker::new(config.simulator.clone());
        Self {
            config,
            ledger,
            suggester,
            invoker,
        }
    }

    pub fn from_config(config: StudyConfig) -> Result<Self> {
        let ledger = Arc::new(FileLedger::open(&config.study_dir())?);
        let suggester: Arc<dyn Suggester> = Arc::from(build_suggester(config.search.sampler));
        Ok(Self::new(config, ledger, suggester))
    }

    pub fn run(&self, target: usize, workers: usize) -> Result<SearchReport> {
        if workers == 0 {
            bail!("worker_count must be at least 1");
        }
        let domains = self.config.domains();
        if domains.is_empty() {
            bail!("search space has no domains");
        }
        tracing::info!(target, workers, "starting search");

        let counters = Counters::default();
        let next_slot = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);

        thread::scope(|scope| {
            let counters = &counters;
            let next_slot = &next_slot;
            let abort = &abort;
            let domains = &domains;
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    scope.spawn(move || {
                        self.worker_loop(worker, target, workers, next_slot, counters, abort, domains)
                    })
                })
                .collect();

            let mut first_err = None;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        if first_err.is_none() {
                            first_err = Some(err);
                        }
                    }
                    Err(_) => {
                        if first_err.is_none() {
                            first_err = Some(anyhow!("worker thread panicked"));
                        }
                    }
                }
            }
            match first_err {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })?;

        let best = self.ledger.best_objective()?;
        match &best {
            Some((configuration, value)) => {
                tracing::info!(%configuration, value, "best configuration")
            }
            None => tracing::info!("no complete trials"),
        }
        Ok(SearchReport {
            issued: counters.issued.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            pruned: counters.pruned.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            best,
        })
    }

    fn worker_loop(
        &self,
        worker: usize,
        target: usize,
        workers: usize,
        next_slot: &AtomicUsize,
        counters: &Counters,
        abort: &AtomicBool,
        domains: &ParamDomains,
    ) -> Result<()> {
        let guard = DedupGuard::new(
            self.ledger.as_ref(),
            self.config.lock_path(),
            self.config.lock_wait(),
            self.config.stale_running(),
        );
        tracing::debug!(worker, "worker started");
        loop {
            if abort.load(Ordering::Relaxed) {
                break;
            }
            let slot = next_slot.fetch_add(1, Ordering::SeqCst);
            if slot >= target {
                break;
            }
            counters.issued.fetch_add(1, Ordering::Relaxed);
            match self.run_slot(slot, workers, &guard, domains, counters) {
                Ok(SlotStatus::Done) => {}
                Ok(SlotStatus::Drained) => {
                    counters.issued.fetch_sub(1, Ordering::Relaxed);
                    tracing::info!(worker, "search space exhausted, worker stopping");
                    break;
                }
                Err(err) => {
                    abort.store(true, Ordering::Relaxed);
                    return Err(err);
                }
            }
        }
        tracing::debug!(worker, "worker finished");
        Ok(())
    }

    fn run_slot(
        &self,
        slot: usize,
        workers: usize,
        guard: &DedupGuard<'_>,
        domains: &ParamDomains,
        counters: &Counters,
    ) -> Result<SlotStatus> {
        let claim = match guard.claim_unique(self.suggester.as_ref(), domains) {
            Ok(claim) => claim,
            Err(ClaimError::Suggest(SuggestError::Exhausted { .. })) => {
                return Ok(SlotStatus::Drained)
            }
            Err(ClaimError::Suggest(err)) => return Err(err.into()),
            Err(ClaimError::Store(err)) => return Err(err.into()),
        };
        match claim {
            Claim::Duplicate { configuration } => {
                tracing::info!(slot, %configuration, "configuration already attempted, slot pruned");
                counters.pruned.fetch_add(1, Ordering::Relaxed);
            }
            Claim::Claimed {
                trial_id,
                configuration,
            } => {
                let stagger = stagger_delay(slot, workers, self.config.per_worker_delay());
                if !stagger.is_zero() {
                    tracing::info!(
                        slot,
                        trial = trial_id,
                        delay_secs = stagger.as_secs(),
                        "staggering launch"
                    );
                    thread::sleep(stagger);
                }
                tracing::info!(slot, trial = trial_id, %configuration, "launching simulation");
                let outcome = match self
                    .invoker
                    .invoke(&configuration, &self.config.space.fixed)
                {
                    Ok(run) => classify(&run, self.config.validation.as_ref()),
                    Err(err) => {
                        tracing::error!(
                            slot,
                            trial = trial_id,
                            error = %err,
                            "simulator launch failed"
                        );
                        Outcome::Failed { exit_code: -1 }
                    }
                };
                self.ledger.complete_trial(trial_id, &outcome)?;
                self.suggester.observe(&configuration, &outcome);
                match &outcome {
                    Outcome::Objective { value } => {
                        tracing::info!(trial = trial_id, value = *value, "trial complete");
                        counters.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Outcome::Pruned { reason } => {
                        tracing::info!(trial = trial_id, reason = %reason, "trial pruned");
                        counters.pruned.fetch_add(1, Ordering::Relaxed);
                    }
                    Outcome::Failed { exit_code } => {
                        tracing::warn!(trial = trial_id, exit_code = *exit_code, "trial failed");
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    Outcome::Duplicate => {
                        counters.pruned.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        Ok(SlotStatus::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use sweep_core::{ensure_dir, ParamDomain};

    use crate::study::{
        SamplerKind, SearchSection, SimulatorSection, SpaceSection, StudySection,
    };

    #[test]
    fn stagger_is_slot_mod_workers_times_delay() {
        let delay = Duration::from_secs(60);
        assert_eq!(stagger_delay(3, 2, delay), Duration::from_secs(60));
        assert_eq!(stagger_delay(0, 2, delay), Duration::from_secs(0));
        assert_eq!(stagger_delay(2, 2, delay), Duration::from_secs(0));
        assert_eq!(
            stagger_delay(5, 3, Duration::from_secs(10)),
            Duration::from_secs(20)
        );
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sweep_sched_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        dir
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, body).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    fn study_config(
        dir: &Path,
        runner: &Path,
        sampler: SamplerKind,
        trials: usize,
        workers: usize,
        domains: Vec<ParamDomain>,
    ) -> StudyConfig {
        StudyConfig {
            version: "0.1".to_string(),
            study: StudySection {
                name: "test".to_string(),
                dir: dir.join("state"),
            },
            search: SearchSection {
                trials,
                workers,
                per_worker_delay_secs: 0,
                sampler,
                stale_running_secs: 3600,
                lock_wait_secs: 10,
            },
            space: SpaceSection {
                domains,
                fixed: [
                    ("warps".to_string(), 2u64),
                    ("threads".to_string(), 1),
                    ("clusters".to_string(), 1),
                    ("l2cache".to_string(), 0),
                    ("l3cache".to_string(), 0),
                ]
                .into_iter()
                .collect::<BTreeMap<_, _>>(),
            },
            simulator: SimulatorSection {
                runner: runner.to_path_buf(),
                simulator_path: PathBuf::from("/opt/sim"),
                library_path: PathBuf::from("/opt/spla"),
                matrix_path: PathBuf::from("/data/web.mtx"),
                timeout_secs: 30,
                memory_limit_mb: None,
                logs_dir: dir.join("logs"),
            },
            validation: None,
        }
    }

    #[test]
    fn zero_workers_is_rejected() {
        let dir = temp_dir("zero_workers");
        let config = study_config(
            &dir,
            Path::new("./run_sim.sh"),
            SamplerKind::Grid,
            1,
            1,
            vec![ParamDomain {
                name: "cores".to_string(),
                choices: vec![1],
            }],
        );
        let runner = SearchRunner::from_config(config).expect("build");
        let err = runner.run(1, 0).expect_err("must reject");
        assert!(err.to_string().contains("worker_count"));
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn grid_search_completes_the_space_and_reports_the_minimum() {
        let dir = temp_dir("grid_e2e");
        // objective is cores * 100, so cores=1 must win
        let script = write_script(&dir, "sim.sh", "#!/bin/sh\necho \"cycles=${1}00\"\n");
        let config = study_config(
            &dir,
            &script,
            SamplerKind::Grid,
            4,
            2,
            vec![ParamDomain {
                name: "cores".to_string(),
                choices: vec![1, 2],
            }],
        );
        let study_dir = config.study_dir();
        let runner = SearchRunner::from_config(config).expect("build");
        let report = runner.run(4, 2).expect("run");

        assert_eq!(report.completed, 2, "one trial per grid point");
        assert_eq!(report.failed, 0);
        let (best_configuration, best_value) = report.best.expect("a best value");
        assert_eq!(best_value, 100);
        assert_eq!(best_configuration.get("cores"), Some(1));

        let ledger = FileLedger::open(&study_dir).expect("reopen ledger");
        let complete = ledger
            .all_trials()
            .expect("snapshot")
            .into_iter()
            .filter(|t| t.state == sweep_store::TrialState::Complete)
            .count();
        assert_eq!(complete, 2);
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn repeated_candidates_are_pruned_not_rerun() {
        let dir = temp_dir("dup_e2e");
        let script = write_script(&dir, "sim.sh", "#!/bin/sh\necho \"cycles=500\"\n");
        // one-point space: the random sampler must resuggest the same
        // configuration, which dedup turns into pruned slots
        let config = study_config(
            &dir,
            &script,
            SamplerKind::Random,
            3,
            1,
            vec![ParamDomain {
                name: "cores".to_string(),
                choices: vec![4],
            }],
        );
        let runner = SearchRunner::from_config(config).expect("build");
        let report = runner.run(3, 1).expect("run");
        assert_eq!(report.issued, 3);
        assert_eq!(report.completed, 1);
        assert_eq!(report.pruned, 2);
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn a_failing_simulation_does_not_abort_the_search() {
        let dir = temp_dir("fail_e2e");
        // cores=1 exits non-zero, cores=2 succeeds
        let script = write_script(
            &dir,
            "sim.sh",
            "#!/bin/sh\nif [ \"$1\" = \"1\" ]; then exit 3; fi\necho \"cycles=200\"\n",
        );
        let config = study_config(
            &dir,
            &script,
            SamplerKind::Grid,
            2,
            1,
            vec![ParamDomain {
                name: "cores".to_string(),
                choices: vec![1, 2],
            }],
        );
        let runner = SearchRunner::from_config(config).expect("build");
        let report = runner.run(2, 1).expect("run");
        assert_eq!(report.failed, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.best.expect("best").1, 200);
        let _ = fs::remove_dir_all(dir);
    }
}
