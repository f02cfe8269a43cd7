//! Application configuration.
//!
//! The configuration is a single JSON document loaded once at startup. It is
//! immutable for the process lifetime: the watch service, the processor
//! registry and the lifecycle manager all receive it (or parts of it) by
//! reference from the service that owns it.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::utils::fs;
use crate::{Error, Result};

fn default_polling_interval_seconds() -> u64 {
    5
}

fn default_staleness_threshold_count() -> u32 {
    3
}

fn default_worker_pool_size() -> usize {
    2
}

fn default_ffmpeg_path() -> String {
    std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string())
}

fn default_ffprobe_path() -> String {
    std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string())
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root of the watched tree. Rule subpaths are relative to it.
    pub input_root: PathBuf,
    /// Root under which rule output subpaths are created.
    pub output_root: PathBuf,
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Seconds between two scanner ticks.
    #[serde(default = "default_polling_interval_seconds")]
    pub polling_interval_seconds: u64,
    /// Consecutive identical size samples before a file is considered stable.
    #[serde(default = "default_staleness_threshold_count")]
    pub staleness_threshold_count: u32,
    /// Delete the source file once its task completes.
    #[serde(default)]
    pub purge_on_success: bool,
    /// Maximum number of transforms running at the same time.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// ffmpeg executable.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// ffprobe executable.
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Directory for daily rolling log files. Console only when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Transformation rules.
    pub rules: Vec<RuleConfig>,
}

/// One transformation rule as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Unique rule name, recorded on every task.
    pub name: String,
    /// Directory (relative to `input_root`) owned by this rule.
    pub input_subpath: PathBuf,
    /// Recipe identifier, e.g. `hevc_scale`.
    pub recipe: String,
    /// Directory (relative to `output_root`) receiving the outputs.
    pub output_subpath: PathBuf,
    /// Output extension. The source extension is kept when unset.
    #[serde(default)]
    pub output_extension: Option<String>,
    /// Recipe-specific options.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl RuleConfig {
    /// Output extension without a leading dot, if configured.
    pub fn normalized_extension(&self) -> Option<&str> {
        self.output_extension
            .as_deref()
            .map(|ext| ext.trim().trim_start_matches('.'))
            .filter(|ext| !ext.is_empty())
    }
}

impl AppConfig {
    /// Read, parse and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading configuration", path, e))?;
        let config = Self::from_json(&raw).map_err(|e| match e {
            Error::Serialization(inner) => {
                Error::config(format!("invalid JSON in {}: {}", path.display(), inner))
            }
            other => other,
        })?;
        debug!(path = %path.display(), rules = config.rules.len(), "Configuration loaded");
        Ok(config)
    }

    /// Parse and validate a configuration document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the scalar settings and the shape of every rule.
    ///
    /// Rule ownership conflicts (duplicate subpaths, unknown recipes) are
    /// checked by the processor registry when it is built.
    pub fn validate(&self) -> Result<()> {
        if self.polling_interval_seconds == 0 {
            return Err(Error::config("polling_interval_seconds must be at least 1"));
        }
        if self.staleness_threshold_count == 0 {
            return Err(Error::config("staleness_threshold_count must be at least 1"));
        }
        if self.worker_pool_size == 0 {
            return Err(Error::config("worker_pool_size must be at least 1"));
        }
        if self.rules.is_empty() {
            return Err(Error::config("at least one rule must be configured"));
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::config("database_path must not be empty"));
        }

        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(Error::config("rule name must not be empty"));
            }
            if rule.recipe.trim().is_empty() {
                return Err(Error::config(format!(
                    "rule '{}' does not name a recipe",
                    rule.name
                )));
            }
            let input = normalize_subpath(&rule.input_subpath).map_err(|e| {
                Error::config(format!("rule '{}' input_subpath: {}", rule.name, e))
            })?;
            if input.as_os_str().is_empty() {
                return Err(Error::config(format!(
                    "rule '{}' input_subpath must name a directory below input_root",
                    rule.name
                )));
            }
            normalize_subpath(&rule.output_subpath).map_err(|e| {
                Error::config(format!("rule '{}' output_subpath: {}", rule.name, e))
            })?;
        }

        Ok(())
    }

    /// Resolve and check the filesystem roots.
    ///
    /// The input root must be a readable directory. The output root and the
    /// database directory are created when missing. The output root may not
    /// live inside a rule directory, otherwise outputs would be rediscovered
    /// as new inputs.
    pub fn prepare_roots(&mut self) -> Result<()> {
        let input_meta = std::fs::metadata(&self.input_root)
            .map_err(|e| Error::io_path("reading input root", &self.input_root, e))?;
        if !input_meta.is_dir() {
            return Err(Error::config(format!(
                "input_root {} is not a directory",
                self.input_root.display()
            )));
        }
        std::fs::read_dir(&self.input_root)
            .map_err(|e| Error::io_path("listing input root", &self.input_root, e))?;
        self.input_root = std::fs::canonicalize(&self.input_root)
            .map_err(|e| Error::io_path("resolving input root", &self.input_root, e))?;

        fs::ensure_dir_all_sync_with_op("creating output root", &self.output_root)?;
        self.output_root = std::fs::canonicalize(&self.output_root)
            .map_err(|e| Error::io_path("resolving output root", &self.output_root, e))?;

        if let Some(parent) = self.database_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::ensure_dir_all_sync_with_op("creating database directory", parent)?;
        }

        for rule in &self.rules {
            let rule_dir = self.input_root.join(normalize_subpath(&rule.input_subpath)?);
            if self.output_root.starts_with(&rule_dir) {
                return Err(Error::config(format!(
                    "output_root {} lies inside the input directory of rule '{}'",
                    self.output_root.display(),
                    rule.name
                )));
            }
        }

        Ok(())
    }

    /// SQLite connection URL for `database_path`.
    pub fn database_url(&self) -> String {
        format!(
            "sqlite:{}?mode=rwc",
            self.database_path.to_string_lossy().replace('\\', "/")
        )
    }

    /// Interval between two scanner ticks.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_seconds)
    }
}

/// Normalize a configured subpath into plain relative components.
///
/// `.` components are dropped; absolute paths and `..` are rejected.
pub fn normalize_subpath(path: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(Error::validation(format!(
                    "'{}' must not contain '..'",
                    path.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::validation(format!(
                    "'{}' must be relative",
                    path.display()
                )));
            }
        }
    }
    Ok(normalized)
}
