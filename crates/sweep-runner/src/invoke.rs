use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use sweep_core::{ensure_dir, Configuration};

use crate::study::SimulatorSection;

/// What one invocation produced. Ephemeral: consumed by the outcome parser
/// and the diagnostic artifact, never persisted in the ledger.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub timed_out: bool,
}

/// The full parameter vector the runner script expects, in argument order.
/// Values come from the claimed configuration overlaid on the study's fixed
/// map; a dimension covered by neither is a configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedParams {
    pub cores: u64,
    pub warps: u64,
    pub threads: u64,
    pub clusters: u64,
    pub l2cache: u64,
    pub l3cache: u64,
}

impl ResolvedParams {
    pub fn resolve(
        configuration: &Configuration,
        fixed: &BTreeMap<String, u64>,
    ) -> Result<ResolvedParams> {
        let lookup = |name: &str| configuration.get(name).or_else(|| fixed.get(name).copied());
        let mut missing = Vec::new();
        let mut take = |name: &'static str| match lookup(name) {
            Some(v) => v,
            None => {
                missing.push(name);
                0
            }
        };
        let params = ResolvedParams {
            cores: take("cores"),
            warps: take("warps"),
            threads: take("threads"),
            clusters: take("clusters"),
            l2cache: take("l2cache"),
            l3cache: take("l3cache"),
        };
        if missing.is_empty() {
            Ok(params)
        } else {
            Err(anyhow!(
                "configuration missing values for: {}",
                missing.join(", ")
            ))
        }
    }
}

/// Builds and executes one simulation command with a hard wall-clock
/// timeout, capturing output verbatim.
#[derive(Debug, Clone)]
pub struct Invoker {
    sim: SimulatorSection,
}

impl Invoker {
    pub fn new(sim: SimulatorSection) -> Self {
        Self { sim }
    }

    /// The fixed argument template:
    /// runner cores warps threads clusters l2 l3 simulator library matrix.
    pub fn command_args(&self, params: &ResolvedParams) -> Vec<String> {
        vec![
            self.sim.runner.display().to_string(),
            params.cores.to_string(),
            params.warps.to_string(),
            params.threads.to_string(),
            params.clusters.to_string(),
            params.l2cache.to_string(),
            params.l3cache.to_string(),
            self.sim.simulator_path.display().to_string(),
            self.sim.library_path.display().to_string(),
            self.sim.matrix_path.display().to_string(),
        ]
    }

    pub fn invoke(
        &self,
        configuration: &Configuration,
        fixed: &BTreeMap<String, u64>,
    ) -> Result<RunResult> {
        let params = ResolvedParams::resolve(configuration, fixed)?;
        let mut argv = self.command_args(&params);
        if let Some(limit_mb) = self.sim.memory_limit_mb {
            argv = wrap_with_memory_cap(&argv, limit_mb);
        }
        let cmdline = shell_join(&argv);

        let start = Instant::now();
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to launch simulator runner: {}", argv[0]))?;

        // Drain both pipes on their own threads so a chatty child cannot
        // fill a pipe buffer and stall before the deadline check runs.
        let stdout_pipe = child.stdout.take();
        let stdout_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        });
        let stderr_pipe = child.stderr.take();
        let stderr_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        });

        let deadline = start + Duration::from_secs(self.sim.timeout_secs);
        let mut timed_out = false;
        let status = loop {
            match child.try_wait().context("waiting for simulator process")? {
                Some(status) => break Some(status),
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        timed_out = true;
                        break None;
                    }
                    thread::sleep(Duration::from_millis(200));
                }
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_reader.join().unwrap_or_default())
            .into_owned();
        let stderr = String::from_utf8_lossy(&stderr_reader.join().unwrap_or_default())
            .into_owned();
        let result = RunResult {
            exit_code: status.and_then(|s| s.code()),
            stdout,
            stderr,
            elapsed: start.elapsed(),
            timed_out,
        };
        self.write_diagnostic_log(&params, &cmdline, &result)?;
        Ok(result)
    }

    /// Per-invocation diagnostic artifact: exact command, exit code, both
    /// streams, and elapsed wall time. Write-only, never read back.
    fn write_diagnostic_log(
        &self,
        params: &ResolvedParams,
        cmdline: &str,
        result: &RunResult,
    ) -> Result<PathBuf> {
        ensure_dir(&self.sim.logs_dir).with_context(|| {
            format!("cannot create logs dir: {}", self.sim.logs_dir.display())
        })?;
        let path = self.sim.logs_dir.join(diagnostic_log_name(
            Utc::now().timestamp(),
            params,
        ));
        let secs = result.elapsed.as_secs();
        let hours = secs / 3600;
        let minutes = (secs % 3600) / 60;
        let return_code = if result.timed_out {
            "timeout".to_string()
        } else {
            result
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string())
        };
        let body = format!(
            "CMD: {}\nRETURN CODE: {}\n\n---STDOUT---\n{}\n\n---STDERR---\n{}\n\n---EXECUTION TIME---\n{}h {}m\n",
            cmdline, return_code, result.stdout, result.stderr, hours, minutes
        );
        fs::write(&path, body)
            .with_context(|| format!("cannot write diagnostic log: {}", path.display()))?;
        Ok(path)
    }
}

pub fn diagnostic_log_name(timestamp: i64, params: &ResolvedParams) -> String {
    format!(
        "logs_{}_{}_{}_{}_{}_{}_{}.txt",
        timestamp,
        params.cores,
        params.warps,
        params.threads,
        params.clusters,
        params.l2cache,
        params.l3cache
    )
}

/// Wrap the command so the kernel enforces a virtual-memory ceiling on the
/// whole simulation, keeping one runaway trial from starving co-resident
/// workers.
fn wrap_with_memory_cap(argv: &[String], limit_mb: u64) -> Vec<String> {
    let script = format!(
        "ulimit -v {} && exec {}",
        limit_mb.saturating_mul(1024),
        shell_join(argv)
    );
    vec!["sh".to_string(), "-c".to_string(), script]
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn cfg(pairs: &[(&str, u64)]) -> Configuration {
        Configuration::from_pairs(pairs.iter().map(|(n, v)| (n.to_string(), *v)))
    }

    fn all_params() -> ResolvedParams {
        ResolvedParams {
            cores: 4,
            warps: 8,
            threads: 16,
            clusters: 2,
            l2cache: 1,
            l3cache: 0,
        }
    }

    fn sim_section(runner: &Path, logs_dir: &Path, timeout_secs: u64) -> SimulatorSection {
        SimulatorSection {
            runner: runner.to_path_buf(),
            simulator_path: PathBuf::from("/opt/sim"),
            library_path: PathBuf::from("/opt/spla"),
            matrix_path: PathBuf::from("/data/web.mtx"),
            timeout_secs,
            memory_limit_mb: None,
            logs_dir: logs_dir.to_path_buf(),
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sweep_invoke_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        dir
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    #[test]
    fn resolve_overlays_configuration_on_fixed_values() {
        let configuration = cfg(&[("warps", 8), ("threads", 16)]);
        let fixed: BTreeMap<String, u64> = [
            ("cores".to_string(), 4u64),
            ("clusters".to_string(), 2),
            ("l2cache".to_string(), 1),
            ("l3cache".to_string(), 0),
        ]
        .into_iter()
        .collect();
        let params = ResolvedParams::resolve(&configuration, &fixed).expect("resolve");
        assert_eq!(params, all_params());
    }

    #[test]
    fn resolve_reports_every_missing_dimension() {
        let configuration = cfg(&[("cores", 4)]);
        let err = ResolvedParams::resolve(&configuration, &BTreeMap::new())
            .expect_err("must fail");
        let msg = err.to_string();
        assert!(msg.contains("warps"), "missing warps in: {}", msg);
        assert!(msg.contains("l3cache"), "missing l3cache in: {}", msg);
        assert!(!msg.contains("cores,"), "cores was provided: {}", msg);
    }

    #[test]
    fn command_args_follow_the_fixed_template_order() {
        let invoker = Invoker::new(sim_section(
            Path::new("./run_sim.sh"),
            Path::new("logs"),
            60,
        ));
        let args = invoker.command_args(&all_params());
        assert_eq!(
            args,
            vec![
                "./run_sim.sh",
                "4",
                "8",
                "16",
                "2",
                "1",
                "0",
                "/opt/sim",
                "/opt/spla",
                "/data/web.mtx"
            ]
        );
    }

    #[test]
    fn memory_cap_wraps_with_ulimit_and_exec() {
        let argv = vec!["./run_sim.sh".to_string(), "4".to_string()];
        let wrapped = wrap_with_memory_cap(&argv, 2048);
        assert_eq!(wrapped[0], "sh");
        assert_eq!(wrapped[1], "-c");
        assert_eq!(wrapped[2], "ulimit -v 2097152 && exec ./run_sim.sh 4");
    }

    #[test]
    fn shell_quote_escapes_only_when_needed() {
        assert_eq!(shell_quote("plain-1.0/x:y"), "plain-1.0/x:y");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn log_name_is_deterministic_in_timestamp_and_values() {
        assert_eq!(
            diagnostic_log_name(1700000000, &all_params()),
            "logs_1700000000_4_8_16_2_1_0.txt"
        );
    }

    #[cfg(unix)]
    #[test]
    fn invoke_captures_output_and_writes_the_artifact() {
        let dir = temp_dir("capture");
        let script = write_script(
            &dir,
            "sim.sh",
            "#!/bin/sh\necho \"cycles=${1}00\"\necho \"warning: slow\" >&2\n",
        );
        let logs_dir = dir.join("logs");
        let invoker = Invoker::new(sim_section(&script, &logs_dir, 30));
        let configuration = cfg(&[
            ("cores", 4),
            ("warps", 8),
            ("threads", 16),
            ("clusters", 2),
            ("l2cache", 1),
            ("l3cache", 0),
        ]);
        let result = invoker
            .invoke(&configuration, &BTreeMap::new())
            .expect("invoke");
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.timed_out);
        assert!(result.stdout.contains("cycles=400"), "{}", result.stdout);
        assert!(result.stderr.contains("warning: slow"), "{}", result.stderr);

        let artifacts: Vec<_> = fs::read_dir(&logs_dir)
            .expect("logs dir")
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(artifacts.len(), 1);
        let body = fs::read_to_string(artifacts[0].path()).expect("read artifact");
        assert!(body.contains("CMD: "), "{}", body);
        assert!(body.contains("RETURN CODE: 0"), "{}", body);
        assert!(body.contains("cycles=400"), "{}", body);
        assert!(body.contains("---EXECUTION TIME---"), "{}", body);
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn invoke_kills_the_process_at_the_deadline() {
        let dir = temp_dir("timeout");
        let script = write_script(&dir, "slow.sh", "#!/bin/sh\nsleep 30\n");
        let invoker = Invoker::new(sim_section(&script, &dir.join("logs"), 1));
        let configuration = cfg(&[
            ("cores", 1),
            ("warps", 2),
            ("threads", 1),
            ("clusters", 1),
            ("l2cache", 0),
            ("l3cache", 0),
        ]);
        let result = invoker
            .invoke(&configuration, &BTreeMap::new())
            .expect("invoke");
        assert!(result.timed_out);
        assert!(result.elapsed < Duration::from_secs(10));
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn spawn_failure_surfaces_as_an_error() {
        let dir = temp_dir("nosuch");
        let invoker = Invoker::new(sim_section(
            &dir.join("does_not_exist.sh"),
            &dir.join("logs"),
            5,
        ));
        let configuration = cfg(&[
            ("cores", 1),
            ("warps", 2),
            ("threads", 1),
            ("clusters", 1),
            ("l2cache", 0),
            ("l3cache", 0),
        ]);
        let err = invoker
            .invoke(&configuration, &BTreeMap::new())
            .expect_err("launch must fail");
        assert!(err.to_string().contains("failed to launch simulator runner"));
        let _ = fs::remove_dir_all(dir);
    }
}
