//! Recipe trait and related types.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::Result;
use crate::pipeline::progress::ProgressTracker;

/// Free-form recipe configuration taken from a rule's `options`.
pub type RecipeOptions = serde_json::Map<String, serde_json::Value>;

/// Everything a recipe needs to transform one file.
#[derive(Debug, Clone)]
pub struct RecipeRequest {
    pub task_id: String,
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub options: RecipeOptions,
    /// First directory component below the rule directory, e.g. `720` for
    /// `scale/720/clip.mp4`.
    pub path_param: Option<String>,
    pub duration_secs: Option<f64>,
}

/// Result of a recipe invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipeOutcome {
    pub success: bool,
    /// Human-readable failure detail, usually the tail of the tool's stderr.
    pub diagnostic: Option<String>,
}

impl RecipeOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            diagnostic: None,
        }
    }

    pub fn failed(diagnostic: impl Into<String>) -> Self {
        Self {
            success: false,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

/// A named, statically known transformation.
#[async_trait]
pub trait Recipe: Send + Sync {
    /// Identifier used by rules to select this recipe.
    fn name(&self) -> &'static str;

    /// Check a rule's options at startup.
    fn validate(&self, options: &RecipeOptions) -> Result<()>;

    /// Transform `request.source_path` into `request.output_path`.
    ///
    /// Failures are reported through the outcome, never as a panic or an
    /// error, so the caller can always record a terminal status.
    async fn invoke(&self, request: &RecipeRequest, progress: &mut ProgressTracker)
    -> RecipeOutcome;
}
