use once_cell::sync::Lazy;
use regex::Regex;

use sweep_core::Outcome;

use crate::invoke::RunResult;
use crate::study::ValidationCheck;

/// Cached as a static to avoid recompilation on every classification.
static CYCLES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"cycles=([0-9]+)").expect("invalid cycles pattern"));

/// Lines introducing the per-core counter sections carry this token; they
/// are headers, not measurements, and are excluded from the aggregate.
const PER_CORE_HEADER: &str = "per-core";

/// Classify one captured run. Pure and idempotent: the same `RunResult`
/// always maps to the same `Outcome`.
pub fn classify(result: &RunResult, check: Option<&ValidationCheck>) -> Outcome {
    if result.timed_out {
        return Outcome::pruned(format!(
            "timed out after {}s",
            result.elapsed.as_secs()
        ));
    }
    match result.exit_code {
        Some(0) => {}
        Some(code) => return Outcome::Failed { exit_code: code },
        None => return Outcome::Failed { exit_code: -1 },
    }
    if let Some(check) = check {
        match scan_token(&result.stdout, &check.token) {
            None => {
                return Outcome::pruned(format!(
                    "validation token '{}' not found in output",
                    check.token
                ));
            }
            Some(found) if found != check.expected => {
                return Outcome::pruned(format!(
                    "validation mismatch: {}={} (expected {})",
                    check.token, found, check.expected
                ));
            }
            Some(_) => {}
        }
    }
    let total = sum_cycles(&result.stdout);
    if total == 0 {
        return Outcome::pruned("no cycles reported in simulator output");
    }
    Outcome::Objective { value: total }
}

/// Sum every `cycles=<integer>` occurrence across all non-header lines.
/// A line may carry several occurrences; non-numeric matches are skipped
/// rather than aborting the scan.
fn sum_cycles(output: &str) -> u64 {
    let mut total: u64 = 0;
    for line in output.lines() {
        if line.contains(PER_CORE_HEADER) {
            continue;
        }
        for cap in CYCLES.captures_iter(line) {
            if let Ok(v) = cap[1].parse::<u64>() {
                total = total.saturating_add(v);
            }
        }
    }
    total
}

/// First `<token>=<number>` occurrence in the output, parsed numerically.
fn scan_token(output: &str, token: &str) -> Option<f64> {
    let pattern = Regex::new(&format!(
        r"{}=(-?[0-9]+(?:\.[0-9]+)?)",
        regex::escape(token)
    ))
    .ok()?;
    pattern
        .captures(output)
        .and_then(|cap| cap[1].parse::<f64>().ok())
}
