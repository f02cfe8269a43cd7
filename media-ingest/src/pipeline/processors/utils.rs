//! Utility functions for recipes.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::traits::{RecipeOptions, RecipeOutcome};
use crate::pipeline::progress::ProgressTracker;
use crate::utils::fs::remove_file_if_exists;
use crate::{Error, Result};

/// Number of stderr lines kept for the failure diagnostic.
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// Arguments every ffmpeg invocation starts with.
///
/// `-nostdin` and `-y` keep ffmpeg from ever waiting on a prompt; machine
/// readable progress goes to stdout.
pub fn ffmpeg_base_args(input: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        "-y",
        "-nostdin",
        "-hide_banner",
        "-nostats",
        "-loglevel",
        "error",
        "-progress",
        "pipe:1",
        "-i",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();
    args.push(input.as_os_str().to_owned());
    args
}

/// Remove an output left over from an earlier attempt.
pub async fn clear_output(output: &Path) -> std::result::Result<(), String> {
    match remove_file_if_exists(output).await {
        Ok(true) => {
            info!(output = %output.display(), "Removed pre-existing output");
            Ok(())
        }
        Ok(false) => Ok(()),
        Err(e) => Err(format!("cannot replace existing output: {}", e)),
    }
}

/// Run ffmpeg, feeding every output line to `progress`.
///
/// A non-zero exit, a spawn failure or an I/O error while waiting all yield a
/// failed outcome whose diagnostic is the tail of stderr.
pub async fn run_ffmpeg(
    ffmpeg_path: &str,
    args: &[OsString],
    progress: &mut ProgressTracker,
) -> RecipeOutcome {
    debug!(ffmpeg = %ffmpeg_path, ?args, "Spawning ffmpeg");

    let mut command = Command::new(ffmpeg_path);
    command
        .args(args)
        .env("LC_ALL", "C")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return RecipeOutcome::failed(format!("ffmpeg executable not found: {}", ffmpeg_path));
        }
        Err(e) => return RecipeOutcome::failed(format!("failed to spawn ffmpeg: {}", e)),
    };

    let mut stdout = child.stdout.take().map(OutputLines::new);
    let mut stderr = child.stderr.take().map(OutputLines::new);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL_LINES);

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            line = next_line(&mut stdout), if stdout.is_some() => match line {
                Some(line) => {
                    progress.observe_line(&line);
                }
                None => stdout = None,
            },
            line = next_line(&mut stderr), if stderr.is_some() => match line {
                Some(line) => {
                    debug!(task_id = %progress.task_id(), "ffmpeg: {}", line);
                    progress.observe_line(&line);
                    if tail.len() == DIAGNOSTIC_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                None => stderr = None,
            },
        }
    }

    let status = match child.wait().await {
        Ok(status) => status,
        Err(e) => return RecipeOutcome::failed(format!("failed to wait for ffmpeg: {}", e)),
    };

    if status.success() {
        return RecipeOutcome::succeeded();
    }

    let detail = tail
        .iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    warn!(%status, "ffmpeg exited unsuccessfully");
    if detail.is_empty() {
        RecipeOutcome::failed(format!("ffmpeg exited with {}", status))
    } else {
        RecipeOutcome::failed(format!("ffmpeg exited with {}: {}", status, detail))
    }
}

/// Line reader over a child pipe that tolerates invalid UTF-8.
///
/// Partial reads stay in `buf`, so a `select!` branch dropped mid-line
/// resumes where it stopped.
struct OutputLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> Option<String> {
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) if self.buf.is_empty() => None,
            Ok(_) => {
                let line = decode_line(&self.buf);
                self.buf.clear();
                Some(line)
            }
            Err(e) => {
                debug!(error = %e, "ffmpeg output stream failed");
                None
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

async fn next_line<R>(reader: &mut Option<OutputLines<R>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    reader.as_mut()?.next_line().await
}

/// Read an optional positive number from the recipe options.
pub fn positive_number_option(options: &RecipeOptions, key: &str) -> Result<Option<f64>> {
    let Some(value) = options.get(key) else {
        return Ok(None);
    };
    match value.as_f64() {
        Some(n) if n.is_finite() && n > 0.0 => Ok(Some(n)),
        _ => Err(Error::validation(format!(
            "option '{}' must be a positive number, got {}",
            key, value
        ))),
    }
}

/// Read an optional positive integer from the recipe options.
pub fn positive_integer_option(options: &RecipeOptions, key: &str) -> Result<Option<u64>> {
    let Some(value) = options.get(key) else {
        return Ok(None);
    };
    match value.as_u64() {
        Some(n) if n > 0 => Ok(Some(n)),
        _ => Err(Error::validation(format!(
            "option '{}' must be a positive integer, got {}",
            key, value
        ))),
    }
}

/// Read an optional string from the recipe options.
pub fn string_option<'a>(options: &'a RecipeOptions, key: &str) -> Result<Option<&'a str>> {
    let Some(value) = options.get(key) else {
        return Ok(None);
    };
    value
        .as_str()
        .map(Some)
        .ok_or_else(|| Error::validation(format!("option '{}' must be a string", key)))
}
