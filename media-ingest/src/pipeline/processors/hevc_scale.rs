//! HEVC re-encode with a target frame height.

use async_trait::async_trait;
use std::ffi::OsString;
use tracing::info;

use super::traits::{Recipe, RecipeOptions, RecipeOutcome, RecipeRequest};
use super::utils::{clear_output, ffmpeg_base_args, positive_integer_option, run_ffmpeg, string_option};
use crate::pipeline::progress::ProgressTracker;
use crate::{Error, Result};

const DEFAULT_CRF: u64 = 28;
const DEFAULT_PRESET: &str = "fast";
const MAX_CRF: u64 = 51;

const PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
    "placebo",
];

/// Scales video to a fixed height (keeping the aspect ratio) and encodes it
/// with libx265. Audio is copied.
///
/// The height comes from `options.height`, or from a numeric directory
/// directly below the rule directory (`scale/720/clip.mp4`).
pub struct HevcScaleRecipe {
    ffmpeg_path: String,
}

impl HevcScaleRecipe {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    fn target_height(request: &RecipeRequest) -> Option<u64> {
        if let Ok(Some(height)) = positive_integer_option(&request.options, "height") {
            return Some(height);
        }
        request
            .path_param
            .as_deref()
            .and_then(|param| param.parse::<u64>().ok())
            .filter(|height| *height > 0)
    }

    fn build_args(request: &RecipeRequest, height: u64) -> Vec<OsString> {
        let crf = positive_integer_option(&request.options, "crf")
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_CRF);
        let preset = string_option(&request.options, "preset")
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_PRESET);

        let mut args = ffmpeg_base_args(&request.source_path);
        args.extend(
            [
                "-vf".to_string(),
                format!("scale=-2:{}", height),
                "-c:v".to_string(),
                "libx265".to_string(),
                "-crf".to_string(),
                crf.to_string(),
                "-preset".to_string(),
                preset.to_string(),
                "-c:a".to_string(),
                "copy".to_string(),
            ]
            .map(OsString::from),
        );
        args.push(request.output_path.as_os_str().to_owned());
        args
    }
}

#[async_trait]
impl Recipe for HevcScaleRecipe {
    fn name(&self) -> &'static str {
        "hevc_scale"
    }

    fn validate(&self, options: &RecipeOptions) -> Result<()> {
        positive_integer_option(options, "height")?;
        if let Some(crf) = positive_integer_option(options, "crf")?
            && crf > MAX_CRF
        {
            return Err(Error::validation(format!(
                "option 'crf' must be between 1 and {}, got {}",
                MAX_CRF, crf
            )));
        }
        if let Some(preset) = string_option(options, "preset")?
            && !PRESETS.contains(&preset)
        {
            return Err(Error::validation(format!("unknown x265 preset '{}'", preset)));
        }
        Ok(())
    }

    async fn invoke(
        &self,
        request: &RecipeRequest,
        progress: &mut ProgressTracker,
    ) -> RecipeOutcome {
        let Some(height) = Self::target_height(request) else {
            return RecipeOutcome::failed(
                "no target height: set options.height or place the file under a numeric directory",
            );
        };
        if let Err(e) = clear_output(&request.output_path).await {
            return RecipeOutcome::failed(e);
        }

        info!(
            task_id = %request.task_id,
            height,
            output = %request.output_path.display(),
            "Encoding HEVC"
        );
        run_ffmpeg(&self.ffmpeg_path, &Self::build_args(request, height), progress).await
    }
}
