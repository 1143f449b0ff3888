use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::digest::DigestBounds;
use crate::orchestration::stream::{StreamRole, StreamSpec};
use crate::{Error, Result};

pub const DEFAULT_MAX_UNIT_CONCURRENCY: usize = 8;
pub const DEFAULT_MAX_STREAM_CONCURRENCY: usize = 8;
pub const DEFAULT_PER_STREAM_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;
pub const DEFAULT_QUALITY_THRESHOLD: f64 = 75.0;

/// What happens to dependents when a unit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Dependents still run; the report flags the failure.
    #[default]
    Proceed,
    /// Units downstream of a failure stay pending and are reported as skipped.
    SkipDependents,
    /// Stop after the group containing the failure.
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_unit_concurrency: usize,
    pub max_stream_concurrency: usize,
    pub per_stream_timeout_ms: u64,
    pub max_retries: u32,
    /// Base delay before the first retry; doubled for each further retry.
    pub retry_backoff_ms: u64,
    pub max_summary_len: usize,
    pub max_decisions: usize,
    pub max_next_steps: usize,
    /// A completed unit scoring below this is reported as degraded.
    pub quality_threshold: f64,
    pub failure_policy: FailurePolicy,
    /// Directory for the file-backed detail store. In-memory when unset.
    pub detail_dir: Option<String>,
    /// Streams every unit runs.
    pub streams: Vec<StreamSpec>,
    /// Extra streams keyed by unit kind.
    pub specialists: BTreeMap<String, Vec<StreamSpec>>,
}

impl Default for Config {
    fn default() -> Self {
        let bounds = DigestBounds::default();
        Self {
            max_unit_concurrency: DEFAULT_MAX_UNIT_CONCURRENCY,
            max_stream_concurrency: DEFAULT_MAX_STREAM_CONCURRENCY,
            per_stream_timeout_ms: DEFAULT_PER_STREAM_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            max_summary_len: bounds.max_summary_len,
            max_decisions: bounds.max_decisions,
            max_next_steps: bounds.max_next_steps,
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            failure_policy: FailurePolicy::default(),
            detail_dir: None,
            streams: StreamRole::CORE.iter().cloned().map(StreamSpec::new).collect(),
            specialists: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn braid_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".braid"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::braid_dir()?.join("braid.toml"))
    }

    pub fn per_stream_timeout(&self) -> Duration {
        Duration::from_millis(self.per_stream_timeout_ms)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    pub fn digest_bounds(&self) -> DigestBounds {
        DigestBounds {
            max_summary_len: self.max_summary_len,
            max_decisions: self.max_decisions,
            max_next_steps: self.max_next_steps,
        }
    }

    pub fn detail_path(&self) -> Option<PathBuf> {
        self.detail_dir.as_deref().map(expand_tilde)
    }

    pub fn with_per_stream_timeout(mut self, timeout: Duration) -> Self {
        self.per_stream_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_streams(mut self, streams: Vec<StreamSpec>) -> Self {
        self.streams = streams;
        self
    }

    /// Register extra streams for units of `kind`.
    pub fn add_specialists(&mut self, kind: &str, specs: Vec<StreamSpec>) {
        self.specialists.entry(kind.to_string()).or_default().extend(specs);
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_unit_concurrency == 0 {
            return Err(Error::Validation(
                "max_unit_concurrency must be greater than 0".to_string(),
            ));
        }
        if self.max_stream_concurrency == 0 {
            return Err(Error::Validation(
                "max_stream_concurrency must be greater than 0".to_string(),
            ));
        }
        if self.per_stream_timeout_ms == 0 {
            return Err(Error::Validation(
                "per_stream_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_summary_len == 0 {
            return Err(Error::Validation(
                "max_summary_len must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.quality_threshold) {
            return Err(Error::Validation(format!(
                "quality_threshold must be within 0..=100, got {}",
                self.quality_threshold
            )));
        }
        if self.streams.is_empty() {
            return Err(Error::Validation("at least one stream is required".to_string()));
        }
        for spec in self.streams.iter().chain(self.specialists.values().flatten()) {
            if !spec.weight.is_finite() || spec.weight < 0.0 {
                return Err(Error::Validation(format!(
                    "stream {} has invalid weight {}",
                    spec.role, spec.weight
                )));
            }
        }
        Ok(())
    }

    /// Load `~/.braid/braid.toml`, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            tracing::debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(
            units = config.max_unit_concurrency,
            streams = config.max_stream_concurrency,
            retries = config.max_retries,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "config saved");
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
