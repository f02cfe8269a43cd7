//! Process-wide panic hook.

use chrono::Local;
use std::backtrace::Backtrace;
use std::fmt;
use std::io::Write;
use std::panic::{PanicHookInfo, take_hook};
use std::path::{Path, PathBuf};

use crate::logging::LOG_FILE_PREFIX;

/// One panic, captured on the panicking thread.
struct PanicRecord {
    timestamp: String,
    thread: String,
    location: String,
    message: String,
    backtrace: Backtrace,
}

impl PanicRecord {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        Self {
            timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string(),
            thread: std::thread::current()
                .name()
                .unwrap_or("<unnamed>")
                .to_string(),
            location: info
                .location()
                .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            message: payload_message(info.payload()).unwrap_or_else(|| info.to_string()),
            backtrace: Backtrace::force_capture(),
        }
    }
}

impl fmt::Display for PanicRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} PANIC thread={} location={} payload={}\nBacktrace:\n{}",
            self.timestamp, self.thread, self.location, self.message, self.backtrace
        )
    }
}

fn payload_message(payload: &(dyn std::any::Any + Send)) -> Option<String> {
    payload
        .downcast_ref::<&'static str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
}

/// Route panics through `tracing`, then run the previous hook.
///
/// With `panic = "abort"` the non-blocking file writer may never flush, so the
/// record is also appended directly to today's log file when `log_dir` is set.
pub fn install(log_dir: Option<PathBuf>) {
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = PanicRecord::capture(info);
            tracing::error!(target: "media_ingest::panic", "{record}");

            if cfg!(panic = "abort")
                && let Some(dir) = &log_dir
            {
                let _ = append_to_daily_log(dir, &record.to_string());
            }
        }));

        previous_hook(info);
    }));
}

fn append_to_daily_log(log_dir: &Path, record: &str) -> std::io::Result<()> {
    let path = log_dir.join(format!(
        "{}.{}",
        LOG_FILE_PREFIX,
        Local::now().format("%Y-%m-%d")
    ));
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{record}")?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_message() {
        let s: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(payload_message(s.as_ref()).as_deref(), Some("boom"));

        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(payload_message(owned.as_ref()).as_deref(), Some("owned boom"));

        let other: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert!(payload_message(other.as_ref()).is_none());
    }

    #[test]
    fn test_append_to_daily_log() {
        let dir = tempfile::tempdir().unwrap();
        append_to_daily_log(dir.path(), "first").unwrap();
        append_to_daily_log(dir.path(), "second").unwrap();

        let name = format!("{}.{}", LOG_FILE_PREFIX, Local::now().format("%Y-%m-%d"));
        let contents = std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }
}
