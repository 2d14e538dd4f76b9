//! TOML-based configuration for revert runs.
//!
//! Structural-conflict policy, upload limits and retry behaviour are
//! run-level configuration, never auto-detected.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevertConfig {
    /// Revert / conflict-resolution behaviour.
    #[serde(default)]
    pub revert: RevertSection,

    /// Upload behaviour and retry budgets.
    #[serde(default)]
    pub upload: UploadSection,

    /// Discussion-comment behaviour.
    #[serde(default)]
    pub discussion: DiscussionSection,

    /// Concurrency and rate limits for outbound calls.
    #[serde(default)]
    pub runtime: RuntimeSection,
}

// ---------------------------------------------------------------------------
// Revert behaviour
// ---------------------------------------------------------------------------

/// What to do when restoring an element would leave a referrer with a
/// dangling member reference.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParentPolicy {
    /// Strip the missing reference from the referrer and proceed. May alter
    /// way shape / relation semantics; logged as a warning.
    #[default]
    ForceRemove,
    /// Abandon restoring the element, leaving it at its current live state.
    Skip,
}

impl std::fmt::Display for ParentPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ForceRemove => write!(f, "force_remove"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

/// Revert behaviour configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertSection {
    /// Structural-conflict policy.
    #[serde(default)]
    pub parent_policy: ParentPolicy,
}

impl Default for RevertSection {
    fn default() -> Self {
        Self {
            parent_policy: ParentPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Upload behaviour
// ---------------------------------------------------------------------------

/// Upload behaviour configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSection {
    /// When `false`, every step runs except the final submission; the
    /// ordered actions are serialized to a standalone change document.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Elements per upload request. Must stay under the server's
    /// per-request limit.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Re-resolution attempts per element on a version-conflict response.
    #[serde(default = "default_version_retry_limit")]
    pub version_retry_limit: u32,

    /// Attempts for transient (5xx / timeout / rate-limit) failures.
    #[serde(default = "default_transient_retry_limit")]
    pub transient_retry_limit: u32,

    /// Initial backoff delay in seconds.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: f64,

    /// Backoff ceiling in seconds.
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: f64,
}

fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    1000
}
fn default_version_retry_limit() -> u32 {
    1
}
fn default_transient_retry_limit() -> u32 {
    5
}
fn default_backoff_base_secs() -> f64 {
    1.0
}
fn default_backoff_max_secs() -> f64 {
    1800.0
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            batch_size: default_batch_size(),
            version_retry_limit: default_version_retry_limit(),
            transient_retry_limit: default_transient_retry_limit(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Discussion
// ---------------------------------------------------------------------------

/// Which source changesets receive the discussion comment.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionTarget {
    #[default]
    All,
    Newest,
    Oldest,
}

impl std::fmt::Display for DiscussionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Newest => write!(f, "newest"),
            Self::Oldest => write!(f, "oldest"),
        }
    }
}

/// Discussion-comment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscussionSection {
    /// Target selection for comments.
    #[serde(default)]
    pub target: DiscussionTarget,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Concurrency and rate limits for outbound API calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// Parallel history/referrer fetches (bounded worker pool).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Process-wide cap on outbound calls per second.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
}

fn default_concurrency() -> usize {
    2
}
fn default_requests_per_second() -> u32 {
    4
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            requests_per_second: default_requests_per_second(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl RevertConfig {
    /// Load a [`RevertConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: RevertConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "upload.batch_size".into(),
                detail: "batch size must be > 0".into(),
            });
        }
        if self.upload.backoff_base_secs <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "upload.backoff_base_secs".into(),
                detail: "backoff base must be > 0".into(),
            });
        }
        if self.upload.backoff_max_secs < self.upload.backoff_base_secs {
            return Err(ConfigError::InvalidValue {
                field: "upload.backoff_max_secs".into(),
                detail: "backoff ceiling must be >= the base delay".into(),
            });
        }
        if self.runtime.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "runtime.concurrency".into(),
                detail: "concurrency must be > 0".into(),
            });
        }
        if self.runtime.requests_per_second == 0 {
            return Err(ConfigError::InvalidValue {
                field: "runtime.requests_per_second".into(),
                detail: "rate limit must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}
