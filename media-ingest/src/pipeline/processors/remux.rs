//! Stream copy into a different container.

use async_trait::async_trait;
use std::ffi::OsString;
use tracing::info;

use super::traits::{Recipe, RecipeOptions, RecipeOutcome, RecipeRequest};
use super::utils::{clear_output, ffmpeg_base_args, run_ffmpeg};
use crate::pipeline::progress::ProgressTracker;
use crate::{Error, Result};

/// Copies every stream into the output container without re-encoding.
/// The container follows the rule's `output_extension`.
pub struct RemuxRecipe {
    ffmpeg_path: String,
}

impl RemuxRecipe {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    fn build_args(request: &RecipeRequest) -> Vec<OsString> {
        let mut args = ffmpeg_base_args(&request.source_path);
        args.extend(["-map", "0", "-c", "copy"].map(OsString::from));

        let is_mp4_family = request
            .output_path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "mp4" | "m4v" | "mov"));
        let faststart = request
            .options
            .get("faststart")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if is_mp4_family && faststart {
            args.extend(["-movflags", "+faststart"].map(OsString::from));
        }

        args.push(request.output_path.as_os_str().to_owned());
        args
    }
}

#[async_trait]
impl Recipe for RemuxRecipe {
    fn name(&self) -> &'static str {
        "remux"
    }

    fn validate(&self, options: &RecipeOptions) -> Result<()> {
        if let Some(value) = options.get("faststart")
            && !value.is_boolean()
        {
            return Err(Error::validation("option 'faststart' must be a boolean"));
        }
        Ok(())
    }

    async fn invoke(
        &self,
        request: &RecipeRequest,
        progress: &mut ProgressTracker,
    ) -> RecipeOutcome {
        if request.output_path == request.source_path {
            return RecipeOutcome::failed("output path equals the source path");
        }
        if let Err(e) = clear_output(&request.output_path).await {
            return RecipeOutcome::failed(e);
        }

        info!(
            task_id = %request.task_id,
            output = %request.output_path.display(),
            "Remuxing"
        );
        run_ffmpeg(&self.ffmpeg_path, &Self::build_args(request), progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn request(output: &str, options: serde_json::Value) -> RecipeRequest {
        RecipeRequest {
            task_id: "t".to_string(),
            source_path: PathBuf::from("/in/remux/clip.flv"),
            output_path: PathBuf::from(output),
            options: options.as_object().cloned().unwrap(),
            path_param: None,
            duration_secs: None,
        }
    }

    fn joined(args: &[OsString]) -> String {
        args.iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_faststart_only_for_mp4_family() {
        let mp4 = joined(&RemuxRecipe::build_args(&request("/out/clip.mp4", json!({}))));
        assert!(mp4.contains("-map 0 -c copy -movflags +faststart /out/clip.mp4"));

        let mkv = joined(&RemuxRecipe::build_args(&request("/out/clip.mkv", json!({}))));
        assert!(!mkv.contains("faststart"));

        let off = joined(&RemuxRecipe::build_args(&request(
            "/out/clip.mp4",
            json!({"faststart": false}),
        )));
        assert!(!off.contains("faststart"));
    }

    #[test]
    fn test_validate() {
        let recipe = RemuxRecipe::new("ffmpeg");
        assert!(recipe.validate(json!({}).as_object().unwrap()).is_ok());
        assert!(recipe.validate(json!({"faststart": "yes"}).as_object().unwrap()).is_err());
    }
}
