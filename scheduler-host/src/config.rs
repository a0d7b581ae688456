//! CLI flags plus a JSON config-file overlay (spec §6 "Configuration").
//!
//! Grounded on the teacher's `host::Cli` / `ProverState::init`: a
//! `clap::Parser` struct merged against a config file so operators can set
//! nested structures (here, `grouping[]`) that don't map cleanly onto flags.
//!
//! `RawCli` is what `clap` parses: every flag the operator can override is
//! `Option<T>` with *no* `default_value`, so a field is `None` unless the
//! operator actually passed the flag (or its `env` fallback fired). That's
//! what lets `Cli::load` apply the CLI over the file field-by-field instead
//! of whole-value: a flag the operator never touched must not stomp a value
//! the config file set, and `clap`'s own defaults can't be told apart from
//! "the operator typed this" any other way.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use scheduler_core::{GroupingStrategy, SchedulerError, SchedulerResult};
use serde::Deserialize;

fn default_database_type() -> String {
    "sqlite".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("scheduler.db")
}

fn default_port() -> u16 {
    8080
}

fn default_sink_type() -> String {
    "http".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_scan_interval_secs() -> u64 {
    10
}

fn default_batch_age_secs() -> u64 {
    5
}

fn default_parallelism() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What `clap` actually parses from argv/env. Every overridable setting is
/// `Option` so "unset" can be told apart from "set to the default value"
/// (see module docs).
#[derive(Clone, Debug, Parser)]
#[command(name = "scheduler-host", about = "Durable deferred task scheduler", long_about = None)]
pub struct RawCli {
    #[arg(long, require_equals = true)]
    pub database_type: Option<String>,

    #[arg(long, require_equals = true)]
    pub database_path: Option<PathBuf>,

    #[arg(long, require_equals = true)]
    pub port: Option<u16>,

    #[arg(long, require_equals = true)]
    pub sink_type: Option<String>,

    #[arg(long, require_equals = true)]
    pub sink_address: Option<String>,

    #[arg(long, require_equals = true)]
    pub sink_log: Option<PathBuf>,

    #[arg(long, require_equals = true)]
    pub scheduler_log: Option<PathBuf>,

    #[arg(long, require_equals = true)]
    pub batch_size: Option<usize>,

    #[arg(long, require_equals = true)]
    pub scan_interval_secs: Option<u64>,

    #[arg(long, require_equals = true)]
    pub batch_age_secs: Option<u64>,

    #[arg(long, require_equals = true)]
    pub parallelism: Option<usize>,

    #[arg(long, require_equals = true, env = "RUST_LOG")]
    pub log_level: Option<String>,

    /// Not a cap — the core never stops retrying (spec §9 open question 5).
    /// Purely an operator-visible log annotation once a task's retries
    /// cross this threshold.
    #[arg(long, require_equals = true)]
    pub max_retries: Option<u32>,

    /// `grouping[]` has no CLI flag — strategies are only ever loaded from
    /// the config file this path points at.
    #[arg(long, require_equals = true, default_value = "config/scheduler.json")]
    pub config_path: PathBuf,
}

impl RawCli {
    /// Overlays only the fields the operator actually supplied onto `cfg`
    /// (which has already been loaded from the config file, or defaulted if
    /// there was none). `grouping` is deliberately untouched: it has no CLI
    /// counterpart, so whatever the file set (or didn't) stands.
    fn apply_over(&self, cfg: &mut Cli) {
        if let Some(v) = &self.database_type {
            cfg.database_type = v.clone();
        }
        if let Some(v) = &self.database_path {
            cfg.database_path = v.clone();
        }
        if let Some(v) = self.port {
            cfg.port = v;
        }
        if let Some(v) = &self.sink_type {
            cfg.sink_type = v.clone();
        }
        if let Some(v) = &self.sink_address {
            cfg.sink_address = Some(v.clone());
        }
        if let Some(v) = &self.sink_log {
            cfg.sink_log = Some(v.clone());
        }
        if let Some(v) = &self.scheduler_log {
            cfg.scheduler_log = Some(v.clone());
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.scan_interval_secs {
            cfg.scan_interval_secs = v;
        }
        if let Some(v) = self.batch_age_secs {
            cfg.batch_age_secs = v;
        }
        if let Some(v) = self.parallelism {
            cfg.parallelism = v;
        }
        if let Some(v) = &self.log_level {
            cfg.log_level = v.clone();
        }
        if let Some(v) = self.max_retries {
            cfg.max_retries = Some(v);
        }
    }
}

/// The fully-resolved configuration: config-file values with any
/// operator-supplied CLI/env flags layered on top field-by-field.
#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct Cli {
    #[serde(default = "default_database_type")]
    pub database_type: String,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_sink_type")]
    pub sink_type: String,

    pub sink_address: Option<String>,
    pub sink_log: Option<PathBuf>,
    pub scheduler_log: Option<PathBuf>,

    #[serde(default)]
    pub grouping: Vec<GroupingStrategy>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    #[serde(default = "default_batch_age_secs")]
    pub batch_age_secs: u64,

    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    pub max_retries: Option<u32>,
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            database_type: default_database_type(),
            database_path: default_database_path(),
            port: default_port(),
            sink_type: default_sink_type(),
            sink_address: None,
            sink_log: None,
            scheduler_log: None,
            grouping: Vec::new(),
            batch_size: default_batch_size(),
            scan_interval_secs: default_scan_interval_secs(),
            batch_age_secs: default_batch_age_secs(),
            parallelism: default_parallelism(),
            log_level: default_log_level(),
            max_retries: None,
        }
    }
}

impl Cli {
    /// Loads the config file at `raw.config_path` (if any), then overlays
    /// whichever flags `raw` actually carries. A missing file is not an
    /// error — CLI flags, `env` fallbacks, and built-in defaults stand alone
    /// in that case.
    pub fn load(raw: &RawCli) -> SchedulerResult<Self> {
        let mut resolved = Self::from_file(&raw.config_path)?;
        raw.apply_over(&mut resolved);
        Ok(resolved)
    }

    fn from_file(path: &Path) -> SchedulerResult<Self> {
        let Ok(file) = std::fs::File::open(path) else {
            return Ok(Self::default());
        };
        let reader = std::io::BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Validates the fields spec §6 calls out as fatal configuration errors.
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.database_type != "sqlite" {
            return Err(SchedulerError::Other(format!(
                "unsupported database_type: {}",
                self.database_type
            )));
        }
        if self.sink_type != "http" {
            return Err(SchedulerError::Other(format!(
                "unsupported sink_type: {}",
                self.sink_type
            )));
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(SchedulerError::Other("database_path must not be empty".into()));
        }
        if self.port == 0 {
            return Err(SchedulerError::Other("port must not be zero".into()));
        }
        let sink_address = self
            .sink_address
            .as_deref()
            .ok_or_else(|| SchedulerError::Other("sink_address is required".into()))?;
        if sink_address.is_empty() {
            return Err(SchedulerError::Other("sink_address must not be empty".into()));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn batch_age(&self) -> Duration {
        Duration::from_secs(self.batch_age_secs)
    }
}
