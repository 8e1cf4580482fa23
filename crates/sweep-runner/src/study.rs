use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sweep_core::{ParamDomain, ParamDomains};

/// Parsed `study.yaml`. Built once, validated, then passed immutably into
/// the search runner; there is no ambient mutable state.
#[derive(Debug, Clone, Deserialize)]
pub struct StudyConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub study: StudySection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub space: SpaceSection,
    #[serde(default)]
    pub simulator: SimulatorSection,
    #[serde(default)]
    pub validation: Option<ValidationCheck>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StudySection {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for StudySection {
    fn default() -> Self {
        Self {
            name: String::new(),
            dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchSection {
    #[serde(default)]
    pub trials: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_delay_secs")]
    pub per_worker_delay_secs: u64,
    #[serde(default = "default_sampler")]
    pub sampler: SamplerKind,
    /// A Running trial older than this no longer blocks its configuration
    /// from being claimed again; 0 keeps stale trials blocking forever.
    #[serde(default = "default_stale_secs")]
    pub stale_running_secs: u64,
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            trials: 0,
            workers: default_workers(),
            per_worker_delay_secs: default_delay_secs(),
            sampler: default_sampler(),
            stale_running_secs: default_stale_secs(),
            lock_wait_secs: default_lock_wait_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    Grid,
    Random,
}

impl SamplerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplerKind::Grid => "grid",
            SamplerKind::Random => "random",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpaceSection {
    #[serde(default)]
    pub domains: Vec<ParamDomain>,
    #[serde(default)]
    pub fixed: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorSection {
    #[serde(default)]
    pub runner: PathBuf,
    #[serde(default)]
    pub simulator_path: PathBuf,
    #[serde(default)]
    pub library_path: PathBuf,
    #[serde(default)]
    pub matrix_path: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
}

impl Default for SimulatorSection {
    fn default() -> Self {
        Self {
            runner: PathBuf::new(),
            simulator_path: PathBuf::new(),
            library_path: PathBuf::new(),
            matrix_path: PathBuf::new(),
            timeout_secs: default_timeout_secs(),
            memory_limit_mb: None,
            logs_dir: default_logs_dir(),
        }
    }
}

/// Optional output correctness check: `<token>=<number>` must appear in the
/// captured output and equal `expected`, otherwise the trial is pruned.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationCheck {
    pub token: String,
    pub expected: f64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".sweep")
}

fn default_workers() -> usize {
    1
}

fn default_delay_secs() -> u64 {
    60
}

fn default_sampler() -> SamplerKind {
    SamplerKind::Grid
}

fn default_stale_secs() -> u64 {
    86_400
}

fn default_lock_wait_secs() -> u64 {
    30
}

fn default_timeout_secs() -> u64 {
    60_000
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl StudyConfig {
    pub fn load(path: &Path) -> Result<StudyConfig> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("cannot read study config: {}", path.display()))?;
        let config: StudyConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("cannot parse study config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reports every problem at once, in the order the file declares its
    /// sections.
    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();
        if self.study.name.trim().is_empty() {
            problems.push("study.name is required".to_string());
        }
        if self.search.trials == 0 {
            problems.push("search.trials must be greater than zero".to_string());
        }
        if self.search.workers == 0 {
            problems.push("search.workers must be greater than zero".to_string());
        }
        if self.space.domains.is_empty() {
            problems.push("space.domains must list at least one dimension".to_string());
        }
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for domain in &self.space.domains {
            if domain.choices.is_empty() {
                problems.push(format!("space.domains: '{}' has no choices", domain.name));
            }
            if !seen.insert(domain.name.as_str()) {
                problems.push(format!("space.domains: '{}' listed twice", domain.name));
            }
            if self.space.fixed.contains_key(&domain.name) {
                problems.push(format!(
                    "space.fixed: '{}' is also a searched domain",
                    domain.name
                ));
            }
        }
        for (field, path) in [
            ("simulator.runner", &self.simulator.runner),
            ("simulator.simulator_path", &self.simulator.simulator_path),
            ("simulator.library_path", &self.simulator.library_path),
            ("simulator.matrix_path", &self.simulator.matrix_path),
        ] {
            if path.as_os_str().is_empty() {
                problems.push(format!("{} is required", field));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "study config invalid:\n{}",
                problems
                    .iter()
                    .map(|p| format!("  - {}", p))
                    .collect::<Vec<_>>()
                    .join("\n")
            ))
        }
    }

    pub fn study_dir(&self) -> PathBuf {
        self.study.dir.join(&self.study.name)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.study_dir().join("study.lock")
    }

    pub fn domains(&self) -> ParamDomains {
        ParamDomains::new(self.space.domains.clone())
    }

    pub fn per_worker_delay(&self) -> Duration {
        Duration::from_secs(self.search.per_worker_delay_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.search.lock_wait_secs)
    }

    pub fn stale_running(&self) -> Option<Duration> {
        match self.search.stale_running_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
version: '0.1'
study:
  name: spmv-sweep
  dir: /tmp/sweep-state
search:
  trials: 40
  workers: 4
  per_worker_delay_secs: 30
  sampler: random
  stale_running_secs: 0
space:
  domains:
    - { name: warps, choices: [2, 4, 8] }
    - { name: threads, choices: [1, 2] }
  fixed:
    cores: 4
    clusters: 1
    l2cache: 1
    l3cache: 0
simulator:
  runner: ./run_sim.sh
  simulator_path: /opt/sim
  library_path: /opt/spla
  matrix_path: /data/web.mtx
  timeout_secs: 7200
  memory_limit_mb: 16384
validation:
  token: errors
  expected: 0
"#;

    #[test]
    fn full_config_parses_and_validates() {
        let config: StudyConfig = serde_yaml::from_str(FULL).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.study.name, "spmv-sweep");
        assert_eq!(config.search.sampler, SamplerKind::Random);
        assert_eq!(config.search.trials, 40);
        assert_eq!(config.space.fixed.get("cores"), Some(&4));
        assert_eq!(config.simulator.memory_limit_mb, Some(16_384));
        assert_eq!(config.domains().cardinality(), 6);
        assert!(config.stale_running().is_none());
        let check = config.validation.expect("validation section");
        assert_eq!(check.token, "errors");
        assert_eq!(check.expected, 0.0);
    }

    #[test]
    fn defaults_fill_unset_fields() {
        let config: StudyConfig = serde_yaml::from_str(
            r#"
study:
  name: tiny
search:
  trials: 1
space:
  domains:
    - { name: cores, choices: [1] }
simulator:
  runner: ./run_sim.sh
  simulator_path: /opt/sim
  library_path: /opt/spla
  matrix_path: /data/a.mtx
"#,
        )
        .expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.search.workers, 1);
        assert_eq!(config.search.per_worker_delay_secs, 60);
        assert_eq!(config.search.sampler, SamplerKind::Grid);
        assert_eq!(config.simulator.timeout_secs, 60_000);
        assert_eq!(config.simulator.logs_dir, PathBuf::from("logs"));
        assert_eq!(
            config.stale_running(),
            Some(Duration::from_secs(86_400))
        );
        assert_eq!(config.study_dir(), PathBuf::from(".sweep/tiny"));
    }

    #[test]
    fn validation_reports_all_problems_at_once() {
        let config: StudyConfig = serde_yaml::from_str("study:\n  name: ''\n").expect("parse");
        let err = config.validate().expect_err("must fail");
        let msg = err.to_string();
        for expected in [
            "study.name is required",
            "search.trials must be greater than zero",
            "space.domains must list at least one dimension",
            "simulator.runner is required",
            "simulator.matrix_path is required",
        ] {
            assert!(msg.contains(expected), "missing '{}' in: {}", expected, msg);
        }
    }

    #[test]
    fn searched_domain_cannot_also_be_fixed() {
        let config: StudyConfig = serde_yaml::from_str(
            r#"
study:
  name: clash
search:
  trials: 1
space:
  domains:
    - { name: cores, choices: [1, 2] }
  fixed:
    cores: 4
simulator:
  runner: ./run_sim.sh
  simulator_path: /opt/sim
  library_path: /opt/spla
  matrix_path: /data/a.mtx
"#,
        )
        .expect("parse");
        let err = config.validate().expect_err("must fail");
        assert!(err
            .to_string()
            .contains("space.fixed: 'cores' is also a searched domain"));
    }
}
