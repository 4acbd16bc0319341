//! Logging setup for the Uplink binary.
//!
//! Two layers: a size-rotated file under `$UPLINK_HOME/logs` and stderr.
//! `RUST_LOG` overrides the default filter for both.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "uplink=info,uplink_pipeline=info,uplink_ledger=info";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Mirror debug output to stderr
    pub verbose: bool,
    /// Write the rolling log file (disable for throwaway runs)
    pub log_to_file: bool,
}

/// Initialize tracing. Call once, before the pipeline starts.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let base_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };
    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        base_filter()
    };

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let file = if config.log_to_file {
        let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
        let writer = SharedRollingWriter::new(log_dir, config.app_name)
            .context("Failed to initialize rolling log writer")?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(base_filter()),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(())
}

/// Uplink home directory: `$UPLINK_HOME` or `~/.uplink`.
pub fn uplink_home() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var("UPLINK_HOME") {
        return Ok(PathBuf::from(override_path));
    }
    dirs::home_dir()
        .map(|home| home.join(".uplink"))
        .context("Could not determine home directory (set UPLINK_HOME)")
}

pub fn logs_dir() -> Result<PathBuf> {
    Ok(uplink_home()?.join("logs"))
}

pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir()?;
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

struct RollingFileAppender {
    dir: PathBuf,
    base_name: String,
    max_files: usize,
    max_size: u64,
    file: Option<File>,
    current_size: u64,
}

impl RollingFileAppender {
    fn new(dir: PathBuf, base_name: &str, max_files: usize, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut appender = Self {
            dir,
            base_name: sanitize_name(base_name),
            max_files: max_files.max(1),
            max_size,
            file: None,
            current_size: 0,
        };
        let (file, size) = appender.open_current_file()?;
        appender.file = Some(file);
        appender.current_size = size;
        if appender.current_size > appender.max_size {
            appender.rotate()?;
        }
        Ok(appender)
    }

    fn open_current_file(&self) -> io::Result<(File, u64)> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        let size = file.metadata()?.len();
        Ok((file, size))
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.base_name))
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.base_name, index))
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
        self.shift_rotated_files()?;
        let (file, size) = self.open_current_file()?;
        self.file = Some(file);
        self.current_size = size;
        Ok(())
    }

    /// `name.log` -> `name.log.1` -> ... -> `name.log.{max_files-1}` (dropped)
    fn shift_rotated_files(&self) -> io::Result<()> {
        let max_index = self.max_files.saturating_sub(1);
        if max_index == 0 {
            return fs::remove_file(self.current_path()).or_else(ignore_missing);
        }

        fs::remove_file(self.rotated_path(max_index)).or_else(ignore_missing)?;
        for idx in (1..max_index).rev() {
            move_if_exists(&self.rotated_path(idx), &self.rotated_path(idx + 1))?;
        }
        move_if_exists(&self.current_path(), &self.rotated_path(1))
    }
}

fn ignore_missing(err: io::Error) -> io::Result<()> {
    if err.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(err)
    }
}

fn move_if_exists(src: &Path, dst: &Path) -> io::Result<()> {
    fs::rename(src, dst).or_else(ignore_missing)
}

impl Write for RollingFileAppender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file unavailable"))?;
        let bytes = file.write(buf)?;
        self.current_size += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
struct SharedRollingWriter {
    inner: Arc<Mutex<RollingFileAppender>>,
}

impl SharedRollingWriter {
    fn new(dir: PathBuf, base_name: &str) -> Result<Self> {
        let appender = RollingFileAppender::new(dir, base_name, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
            .with_context(|| format!("Failed to open log file for {}", base_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(appender)),
        })
    }
}

struct SharedRollingWriterGuard {
    inner: Arc<Mutex<RollingFileAppender>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedRollingWriter {
    type Writer = SharedRollingWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedRollingWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl SharedRollingWriterGuard {
    fn with_appender<T>(
        &self,
        f: impl FnOnce(&mut RollingFileAppender) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        f(&mut guard)
    }
}

impl Write for SharedRollingWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_appender(|appender| appender.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_appender(|appender| appender.flush())
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("uplink serve/v1"), "uplink_serve_v1");
    }

    #[test]
    fn test_rotation_keeps_bounded_file_count() {
        let tmp = tempfile::tempdir().unwrap();
        let mut appender =
            RollingFileAppender::new(tmp.path().to_path_buf(), "uplink", 3, 16).unwrap();

        for _ in 0..10 {
            appender.write_all(b"0123456789\n").unwrap();
        }
        appender.flush().unwrap();

        assert!(tmp.path().join("uplink.log").exists());
        assert!(tmp.path().join("uplink.log.1").exists());
        assert!(tmp.path().join("uplink.log.2").exists());
        assert!(!tmp.path().join("uplink.log.3").exists());
    }
}
