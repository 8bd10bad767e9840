use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TrellisError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

// ── Scheduler policy ──────────────────────────────────────────

/// Which scheduling policy the engine instantiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Multi-queue FIFO with duplicate suppression.
    #[default]
    Fifo,
    /// Highest pending priority first.
    Priority,
}

impl FromStr for SchedulerKind {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" | "queued_fifo" | "sweep" => Ok(SchedulerKind::Fifo),
            "priority" => Ok(SchedulerKind::Priority),
            other => Err(TrellisError::Config(format!("unknown scheduler '{other}'"))),
        }
    }
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerKind::Fifo => write!(f, "fifo"),
            SchedulerKind::Priority => write!(f, "priority"),
        }
    }
}

// ── Engine options ────────────────────────────────────────────

/// Options accepted by the asynchronous engine.
///
/// Parsed from TOML (`[engine]` table or a bare table), from `TRELLIS_*`
/// environment variables, or set one at a time with [`EngineOptions::set_option`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Wall-clock limit in seconds. `None` runs until the task pool drains.
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Skip the distributed lock manager and rely on edge-level locking only.
    #[serde(default = "default_factorized")]
    pub factorized: bool,
    /// Worker tasks per machine.
    #[serde(default = "default_nfibers")]
    pub nfibers: usize,
    /// Stack size in bytes for runtime worker threads.
    #[serde(default = "default_stacksize")]
    pub stacksize: usize,
    /// Cache gather results per vertex and accept deltas.
    #[serde(default)]
    pub use_cache: bool,
    /// Scheduler lanes. 0 = available parallelism.
    #[serde(default)]
    pub ncpus: usize,
    #[serde(default)]
    pub scheduler: SchedulerKind,
    /// Priority scheduler only: ignore schedule requests below this priority.
    #[serde(default)]
    pub min_priority: Option<f64>,
    /// Record wall time per executed vertex program.
    #[serde(default)]
    pub track_task_time: bool,
    /// How often workers poll the aggregator, in milliseconds.
    #[serde(default = "default_aggregator_tick_ms")]
    pub aggregator_tick_ms: u64,
}

fn default_factorized() -> bool { true }
fn default_nfibers() -> usize { 10_000 }
fn default_stacksize() -> usize { 131_072 }
fn default_aggregator_tick_ms() -> u64 { 100 }

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            factorized: default_factorized(),
            nfibers: default_nfibers(),
            stacksize: default_stacksize(),
            use_cache: false,
            ncpus: 0,
            scheduler: SchedulerKind::default(),
            min_priority: None,
            track_task_time: false,
            aggregator_tick_ms: default_aggregator_tick_ms(),
        }
    }
}

/// Option keys understood by [`EngineOptions::set_option`], paired with
/// the environment variable suffix read by [`EngineOptions::from_env`].
const OPTION_KEYS: &[(&str, &str)] = &[
    ("timeout", "TIMEOUT"),
    ("factorized", "FACTORIZED"),
    ("nfibers", "NFIBERS"),
    ("stacksize", "STACKSIZE"),
    ("use_cache", "USE_CACHE"),
    ("ncpus", "NCPUS"),
    ("scheduler", "SCHEDULER"),
    ("min_priority", "MIN_PRIORITY"),
    ("track_task_time", "TRACK_TASK_TIME"),
    ("aggregator_tick_ms", "AGGREGATOR_TICK_MS"),
];

impl EngineOptions {
    /// Parse options from a TOML string. Accepts either a bare table or an
    /// `[engine]` section.
    pub fn from_toml(toml_str: &str) -> Result<Self, TrellisError> {
        #[derive(Deserialize)]
        struct Wrapped {
            engine: EngineOptions,
        }

        let table: toml::Table = toml::from_str(toml_str)?;
        let options = if table.contains_key("engine") {
            toml::from_str::<Wrapped>(toml_str)?.engine
        } else {
            toml::from_str::<EngineOptions>(toml_str)?
        };
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TrellisError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Build options from environment variables (call `load_dotenv()` first).
    ///
    /// Profile is read from `TRELLIS_PROFILE`. Every key is looked up as
    /// `{PROFILE}_TRELLIS_{KEY}` first, then `TRELLIS_{KEY}`.
    pub fn from_env() -> Result<Self, TrellisError> {
        let profile = env_or("TRELLIS_PROFILE", "").to_uppercase();
        Self::from_lookup(|key| profiled_env_opt(&profile, key))
    }

    /// Build options from an arbitrary key lookup, starting from defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TrellisError> {
        let mut options = Self::default();
        for (key, env_suffix) in OPTION_KEYS {
            if let Some(value) = lookup(&format!("TRELLIS_{env_suffix}")) {
                options.set_option(key, &value)?;
            }
        }
        options.validate()?;
        Ok(options)
    }

    /// Set a single option from its string form. Unknown keys are rejected.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<(), TrellisError> {
        let bad = |what: &str| TrellisError::Config(format!("invalid {what} for '{key}': {value}"));
        match key {
            "timeout" => {
                let secs: f64 = value.trim().parse().map_err(|_| bad("seconds"))?;
                self.timeout = if secs > 0.0 { Some(secs) } else { None };
            }
            "factorized" => self.factorized = parse_bool(value).ok_or_else(|| bad("bool"))?,
            "nfibers" => self.nfibers = value.trim().parse().map_err(|_| bad("count"))?,
            "stacksize" => self.stacksize = value.trim().parse().map_err(|_| bad("size"))?,
            "use_cache" => self.use_cache = parse_bool(value).ok_or_else(|| bad("bool"))?,
            "ncpus" => self.ncpus = value.trim().parse().map_err(|_| bad("count"))?,
            "scheduler" => self.scheduler = value.parse()?,
            "min_priority" => {
                let p: f64 = value.trim().parse().map_err(|_| bad("priority"))?;
                self.min_priority = Some(p);
            }
            "track_task_time" => {
                self.track_task_time = parse_bool(value).ok_or_else(|| bad("bool"))?
            }
            "aggregator_tick_ms" => {
                self.aggregator_tick_ms = value.trim().parse().map_err(|_| bad("millis"))?
            }
            other => return Err(TrellisError::UnknownOption(other.to_string())),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), TrellisError> {
        if self.nfibers == 0 {
            return Err(TrellisError::Config("nfibers must be at least 1".into()));
        }
        if let Some(t) = self.timeout {
            if !t.is_finite() || t < 0.0 {
                return Err(TrellisError::Config(format!("timeout must be non-negative, got {t}")));
            }
        }
        Ok(())
    }

    /// Timeout as a [`Duration`], if one is set.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs_f64)
    }

    /// Resolve the number of scheduler lanes. Returns the available
    /// parallelism if `ncpus` is 0.
    pub fn resolved_ncpus(&self) -> usize {
        if self.ncpus == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.ncpus
        }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Engine options:");
        match self.timeout {
            Some(t) => tracing::info!("  timeout:     {t}s"),
            None => tracing::info!("  timeout:     unlimited"),
        }
        tracing::info!("  factorized:  {}", self.factorized);
        tracing::info!("  nfibers:     {}", self.nfibers);
        tracing::info!("  stacksize:   {}", self.stacksize);
        tracing::info!("  use_cache:   {}", self.use_cache);
        tracing::info!("  ncpus:       {}", self.resolved_ncpus());
        tracing::info!("  scheduler:   {}", self.scheduler);
    }

    /// Summary suitable for machine-readable run reports.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "timeout": self.timeout,
            "factorized": self.factorized,
            "nfibers": self.nfibers,
            "stacksize": self.stacksize,
            "use_cache": self.use_cache,
            "ncpus": self.resolved_ncpus(),
            "scheduler": self.scheduler.to_string(),
            "min_priority": self.min_priority,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults() {
        let o = EngineOptions::default();
        assert!(o.factorized);
        assert_eq!(o.nfibers, 10_000);
        assert_eq!(o.stacksize, 131_072);
        assert!(!o.use_cache);
        assert!(o.timeout.is_none());
        assert_eq!(o.scheduler, SchedulerKind::Fifo);
    }

    #[test]
    fn set_option_parses_values() {
        let mut o = EngineOptions::default();
        o.set_option("timeout", "2.5").unwrap();
        o.set_option("factorized", "false").unwrap();
        o.set_option("nfibers", "64").unwrap();
        o.set_option("use_cache", "yes").unwrap();
        o.set_option("scheduler", "priority").unwrap();
        o.set_option("min_priority", "0.25").unwrap();

        assert_eq!(o.timeout, Some(2.5));
        assert_eq!(o.timeout_duration(), Some(Duration::from_millis(2500)));
        assert!(!o.factorized);
        assert_eq!(o.nfibers, 64);
        assert!(o.use_cache);
        assert_eq!(o.scheduler, SchedulerKind::Priority);
        assert_eq!(o.min_priority, Some(0.25));
    }

    #[test]
    fn zero_timeout_means_unlimited() {
        let mut o = EngineOptions::default();
        o.set_option("timeout", "0").unwrap();
        assert!(o.timeout.is_none());
    }

    #[test]
    fn unknown_option_rejected() {
        let mut o = EngineOptions::default();
        let err = o.set_option("max_iterations", "3").unwrap_err();
        assert!(matches!(err, TrellisError::UnknownOption(k) if k == "max_iterations"));
    }

    #[test]
    fn bad_value_rejected() {
        let mut o = EngineOptions::default();
        assert!(o.set_option("factorized", "maybe").is_err());
        assert!(o.set_option("nfibers", "-1").is_err());
        assert!(o.set_option("scheduler", "lifo").is_err());
    }

    #[test]
    fn from_toml_bare_and_sectioned() {
        let bare = EngineOptions::from_toml("nfibers = 32\nfactorized = false\n").unwrap();
        assert_eq!(bare.nfibers, 32);
        assert!(!bare.factorized);
        assert_eq!(bare.stacksize, 131_072);

        let sectioned =
            EngineOptions::from_toml("[engine]\ntimeout = 0.5\nscheduler = \"priority\"\n").unwrap();
        assert_eq!(sectioned.timeout, Some(0.5));
        assert_eq!(sectioned.scheduler, SchedulerKind::Priority);
        assert!(sectioned.factorized);
    }

    #[test]
    fn from_toml_rejects_zero_fibers() {
        assert!(EngineOptions::from_toml("nfibers = 0\n").is_err());
    }

    #[test]
    fn from_lookup_reads_prefixed_keys() {
        let vars: HashMap<&str, &str> = [
            ("TRELLIS_NFIBERS", "128"),
            ("TRELLIS_USE_CACHE", "1"),
            ("TRELLIS_TIMEOUT", "10"),
        ]
        .into_iter()
        .collect();
        let o = EngineOptions::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(o.nfibers, 128);
        assert!(o.use_cache);
        assert_eq!(o.timeout, Some(10.0));
    }

    #[test]
    fn resolved_ncpus_explicit() {
        let o = EngineOptions { ncpus: 3, ..Default::default() };
        assert_eq!(o.resolved_ncpus(), 3);
        assert!(EngineOptions::default().resolved_ncpus() >= 1);
    }
}
