//! Engine configuration.
//!
//! Defaults come from a named profile; every knob can be overridden with an
//! `UNLIST_*` environment variable. Cadences and budgets are engine-wide,
//! not per-broker.

use std::time::Duration;

const DEFAULT_PACING_MS: u64 = 1_500;
const DEFAULT_MAX_RETRIES_PER_RUN: u32 = 3;
const DEFAULT_RETRY_WAIT_MS: u64 = 3_000;
const DEFAULT_ACTION_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_JOB_DEADLINE_SECS: u64 = 600;
const DEFAULT_MAX_CONCURRENT_JOBS: usize = 2;
const DEFAULT_SCAN_CADENCE_HOURS: u64 = 24 * 7;
const DEFAULT_CONFIRM_CADENCE_HOURS: u64 = 24;
const DEFAULT_FAILURE_BACKOFF_HOURS: u64 = 4;
const DEFAULT_TICK_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineProfile {
    Desktop,
    Aggressive,
}

#[derive(Debug, Clone, Copy)]
struct ProfileDefaults {
    pacing_ms: u64,
    max_concurrent_jobs: usize,
    scan_cadence_hours: u64,
    confirm_cadence_hours: u64,
    tick_secs: u64,
}

impl EngineProfile {
    fn from_env(name: &str) -> Self {
        let raw = read_env_string(name).unwrap_or_else(|| "desktop".to_string());
        match raw.trim().to_ascii_lowercase().as_str() {
            "aggressive" => Self::Aggressive,
            _ => Self::Desktop,
        }
    }

    fn defaults(self) -> ProfileDefaults {
        match self {
            Self::Desktop => ProfileDefaults {
                pacing_ms: DEFAULT_PACING_MS,
                max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
                scan_cadence_hours: DEFAULT_SCAN_CADENCE_HOURS,
                confirm_cadence_hours: DEFAULT_CONFIRM_CADENCE_HOURS,
                tick_secs: DEFAULT_TICK_SECS,
            },
            Self::Aggressive => ProfileDefaults {
                pacing_ms: 500,
                max_concurrent_jobs: 6,
                scan_cadence_hours: 24,
                confirm_cadence_hours: 6,
                tick_secs: 60,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Aggressive => "aggressive",
        }
    }
}

/// All scheduling and job-execution knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub profile: EngineProfile,
    /// Fixed pause between consecutive actions in a script.
    pub pacing: Duration,
    /// Same-action retry budget inside a single run.
    pub max_retries_per_run: u32,
    /// Pause before re-issuing a failed action.
    pub retry_wait: Duration,
    /// Budget for one action, services included.
    pub action_timeout: Duration,
    /// Wall-clock budget for one whole job run.
    pub job_deadline: Duration,
    /// Concurrent browser sessions.
    pub max_concurrent_jobs: usize,
    /// How long after a successful scan the next one is due.
    pub scan_cadence: Duration,
    /// How long after a submitted opt-out its confirmation scan is due.
    pub confirm_cadence: Duration,
    /// How long after a failed run the tuple becomes due again.
    pub failure_backoff: Duration,
    /// Scheduler tick interval.
    pub tick_every: Duration,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let profile = EngineProfile::from_env("UNLIST_PROFILE");
        let defaults = profile.defaults();
        Self {
            profile,
            pacing: Duration::from_millis(read_env_u64("UNLIST_PACING_MS", defaults.pacing_ms)),
            max_retries_per_run: read_env_u32(
                "UNLIST_MAX_RETRIES_PER_RUN",
                DEFAULT_MAX_RETRIES_PER_RUN,
            ),
            retry_wait: Duration::from_millis(read_env_u64(
                "UNLIST_RETRY_WAIT_MS",
                DEFAULT_RETRY_WAIT_MS,
            )),
            action_timeout: Duration::from_millis(
                read_env_u64("UNLIST_ACTION_TIMEOUT_MS", DEFAULT_ACTION_TIMEOUT_MS).max(1_000),
            ),
            job_deadline: Duration::from_secs(
                read_env_u64("UNLIST_JOB_DEADLINE_SECS", DEFAULT_JOB_DEADLINE_SECS).max(30),
            ),
            max_concurrent_jobs: read_env_usize(
                "UNLIST_MAX_CONCURRENT_JOBS",
                defaults.max_concurrent_jobs,
            )
            .max(1),
            scan_cadence: Duration::from_secs(
                read_env_u64("UNLIST_SCAN_CADENCE_HOURS", defaults.scan_cadence_hours).max(1)
                    * 3600,
            ),
            confirm_cadence: Duration::from_secs(
                read_env_u64(
                    "UNLIST_CONFIRM_CADENCE_HOURS",
                    defaults.confirm_cadence_hours,
                )
                .max(1)
                    * 3600,
            ),
            failure_backoff: Duration::from_secs(
                read_env_u64("UNLIST_FAILURE_BACKOFF_HOURS", DEFAULT_FAILURE_BACKOFF_HOURS).max(1)
                    * 3600,
            ),
            tick_every: Duration::from_secs(
                read_env_u64("UNLIST_TICK_SECS", defaults.tick_secs).max(1),
            ),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let profile = EngineProfile::Desktop;
        let defaults = profile.defaults();
        Self {
            profile,
            pacing: Duration::from_millis(defaults.pacing_ms),
            max_retries_per_run: DEFAULT_MAX_RETRIES_PER_RUN,
            retry_wait: Duration::from_millis(DEFAULT_RETRY_WAIT_MS),
            action_timeout: Duration::from_millis(DEFAULT_ACTION_TIMEOUT_MS),
            job_deadline: Duration::from_secs(DEFAULT_JOB_DEADLINE_SECS),
            max_concurrent_jobs: defaults.max_concurrent_jobs,
            scan_cadence: Duration::from_secs(defaults.scan_cadence_hours * 3600),
            confirm_cadence: Duration::from_secs(defaults.confirm_cadence_hours * 3600),
            failure_backoff: Duration::from_secs(DEFAULT_FAILURE_BACKOFF_HOURS * 3600),
            tick_every: Duration::from_secs(defaults.tick_secs),
        }
    }
}

fn read_env_u64(name: &str, default_value: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn read_env_u32(name: &str, default_value: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default_value)
}

fn read_env_usize(name: &str, default_value: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default_value)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile_is_desktop() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.profile, EngineProfile::Desktop);
        assert_eq!(cfg.max_concurrent_jobs, 2);
        assert_eq!(cfg.retry_wait, Duration::from_millis(3_000));
    }

    #[test]
    fn test_aggressive_profile_defaults() {
        let defaults = EngineProfile::Aggressive.defaults();
        assert!(defaults.pacing_ms < DEFAULT_PACING_MS);
        assert!(defaults.max_concurrent_jobs > DEFAULT_MAX_CONCURRENT_JOBS);
        assert!(defaults.tick_secs < DEFAULT_TICK_SECS);
    }
}
