pub mod agent_core;
pub mod config;
pub mod inference;
pub mod mcp_client;

use std::path::{Path, PathBuf};

/// Where and how to write logs.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Log to this file (rotated on startup) instead of stderr.
    pub log_file: Option<PathBuf>,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Default filter when `RUST_LOG` is unset.
    pub default_filter: Option<String>,
}

/// Default filter: our own crate at info, everything else at warn.
pub const DEFAULT_LOG_FILTER: &str = "mcp_bridge=info,warn";

/// Number of rotated log files kept next to the active one.
const LOG_FILES_KEPT: u32 = 3;

/// Initialize the tracing subscriber.
///
/// Logs go to stderr by default so stdout stays free for command output
/// (and for the JSON-RPC stream when the bridge itself runs as a backend).
/// With a log file:
/// 1. Rotates existing logs (bridge.log → bridge.log.1 → .2 → .3).
/// 2. Opens a fresh file with a line-flushing writer.
pub fn init_tracing(options: &LogOptions) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(options.default_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER))
    });
    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let installed = match &options.log_file {
        Some(path) => {
            let writer = open_log_file(path)?;
            if options.json {
                builder.json().with_writer(writer).with_ansi(false).try_init()
            } else {
                builder.with_writer(writer).with_ansi(false).try_init()
            }
        }
        None if options.json => builder.json().with_writer(std::io::stderr).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| std::io::Error::other(e.to_string()))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?options.log_file,
        pid = std::process::id(),
        "=== mcp-bridge starting ==="
    );
    Ok(())
}

fn open_log_file(path: &Path) -> std::io::Result<FlushingWriter> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    rotate_log_file(path, LOG_FILES_KEPT);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(FlushingWriter::new(file))
}

/// Rotate log files: `bridge.log` → `bridge.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// log lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_rotate_log_file_keeps_three() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("bridge.log");

        for generation in 0..5 {
            std::fs::write(&base, format!("gen {generation}")).unwrap();
            rotate_log_file(&base, 3);
        }

        assert!(!base.exists());
        let read = |suffix: u32| {
            std::fs::read_to_string(format!("{}.{suffix}", base.display())).unwrap()
        };
        assert_eq!(read(1), "gen 4");
        assert_eq!(read(2), "gen 3");
        assert_eq!(read(3), "gen 2");
        assert!(!Path::new(&format!("{}.4", base.display())).exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("logs").join("bridge.log");
        let mut writer = open_log_file(&path).unwrap();
        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }
}
