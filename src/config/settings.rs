//! Engine settings.
//!
//! This module defines the structs that map to `converge.yaml`: where state
//! lives, how many provider operations may run at once, and whether plans
//! refresh by default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use validator::Validate;

use crate::state::{Backend, LocalBackend, S3Backend, STATE_DIR};

/// Default parallelism.
pub const DEFAULT_PARALLELISM: usize = crate::executor::DEFAULT_PARALLELISM;

/// Default declarations file.
pub const DEFAULT_DECLARATIONS_FILE: &str = "declarations.yaml";

/// Root settings structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct Settings {
    /// State backend configuration.
    #[serde(default)]
    #[validate(nested)]
    pub state: StateSettings,
    /// Maximum provider operations in flight during apply.
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1, max = 256))]
    pub parallelism: usize,
    /// Read live objects before planning.
    #[serde(default = "default_refresh")]
    pub refresh: bool,
    /// Lock holder identity; generated when absent.
    #[serde(default)]
    pub lock_holder: Option<String>,
    /// Workspace to use instead of the persisted selection.
    #[serde(default)]
    pub workspace: Option<String>,
    /// Declarations file, relative to the settings file.
    #[serde(default = "default_declarations")]
    pub declarations: PathBuf,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct StateSettings {
    /// Backend type.
    #[serde(default)]
    pub backend: BackendKind,
    /// Local state directory (for the local backend).
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// S3 bucket name (required for the s3 backend).
    #[serde(default)]
    #[validate(length(min = 3, max = 63))]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses the AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

const fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

const fn default_refresh() -> bool {
    true
}

fn default_declarations() -> PathBuf {
    PathBuf::from(DEFAULT_DECLARATIONS_FILE)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state: StateSettings::default(),
            parallelism: DEFAULT_PARALLELISM,
            refresh: true,
            lock_holder: None,
            workspace: None,
            declarations: default_declarations(),
        }
    }
}

impl Settings {
    /// Local state directory, resolved against `base_dir`.
    #[must_use]
    pub fn state_dir(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(self.state.path.as_deref().unwrap_or_else(|| Path::new(STATE_DIR)))
    }

    /// Opens the configured state backend.
    pub async fn open_backend(&self, base_dir: &Path) -> Arc<dyn Backend> {
        match self.state.backend {
            BackendKind::Local => Arc::new(LocalBackend::new(self.state_dir(base_dir))),
            BackendKind::S3 => Arc::new(
                S3Backend::new(
                    self.state.bucket.as_deref().unwrap_or_default(),
                    self.state.prefix.as_deref(),
                    self.state.region.as_deref(),
                )
                .await,
            ),
        }
    }
}
