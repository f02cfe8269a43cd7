//! Audio gain adjustment.

use async_trait::async_trait;
use std::ffi::OsString;
use tracing::info;

use super::traits::{Recipe, RecipeOptions, RecipeOutcome, RecipeRequest};
use super::utils::{clear_output, ffmpeg_base_args, positive_number_option, run_ffmpeg};
use crate::Result;
use crate::pipeline::progress::ProgressTracker;

/// Multiplies the audio volume by a factor and re-encodes audio as AAC.
/// Video is copied.
///
/// The factor comes from `options.factor`, or from a numeric directory
/// directly below the rule directory (`volume/1.5/clip.mp4`).
pub struct VolumeScaleRecipe {
    ffmpeg_path: String,
}

impl VolumeScaleRecipe {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    fn factor(request: &RecipeRequest) -> Option<f64> {
        if let Ok(Some(factor)) = positive_number_option(&request.options, "factor") {
            return Some(factor);
        }
        request
            .path_param
            .as_deref()
            .and_then(|param| param.parse::<f64>().ok())
            .filter(|factor| factor.is_finite() && *factor > 0.0)
    }

    fn build_args(request: &RecipeRequest, factor: f64) -> Vec<OsString> {
        let mut args = ffmpeg_base_args(&request.source_path);
        args.extend(
            [
                "-af".to_string(),
                format!("volume={}", factor),
                "-c:v".to_string(),
                "copy".to_string(),
                "-c:a".to_string(),
                "aac".to_string(),
            ]
            .map(OsString::from),
        );
        args.push(request.output_path.as_os_str().to_owned());
        args
    }
}

#[async_trait]
impl Recipe for VolumeScaleRecipe {
    fn name(&self) -> &'static str {
        "volume_scale"
    }

    fn validate(&self, options: &RecipeOptions) -> Result<()> {
        positive_number_option(options, "factor")?;
        Ok(())
    }

    async fn invoke(
        &self,
        request: &RecipeRequest,
        progress: &mut ProgressTracker,
    ) -> RecipeOutcome {
        let Some(factor) = Self::factor(request) else {
            return RecipeOutcome::failed(
                "no volume factor: set options.factor or place the file under a directory named after a positive number",
            );
        };
        if let Err(e) = clear_output(&request.output_path).await {
            return RecipeOutcome::failed(e);
        }

        info!(
            task_id = %request.task_id,
            factor,
            output = %request.output_path.display(),
            "Scaling volume"
        );
        run_ffmpeg(&self.ffmpeg_path, &Self::build_args(request, factor), progress).await
    }
}
