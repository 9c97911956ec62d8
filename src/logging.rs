/// Tracing setup: stderr plus an optional per-launch log file.
///
/// Timestamps are relative to process start. The log file is opened on the first
/// record that passes the filter, so a quiet launch leaves nothing behind.
use crate::config::LoggingConfig;
use chrono::NaiveDateTime;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::fmt::{self, time, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// `<dir>/<app_name>-<YYYYmmddTHHMMSS>.log`
pub fn log_file_path(dir: &Path, app_name: &str, started: NaiveDateTime) -> PathBuf {
    dir.join(format!("{}-{}.log", app_name, started.format("%Y%m%dT%H%M%S")))
}

/// Append-only log file that is created on first write.
#[derive(Debug)]
pub struct LazyFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl LazyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_file<R>(&self, op: impl FnOnce(&mut File) -> io::Result<R>) -> io::Result<R> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let file = match guard.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?,
        };
        op(guard.insert(file))
    }
}

pub struct LazyFileWriter<'a> {
    target: &'a LazyFile,
}

impl Write for LazyFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.target.with_file(|f| f.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self.target.file.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LazyFile {
    type Writer = LazyFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LazyFileWriter { target: self }
    }
}

/// Install the global subscriber. Returns the log file path when file output is on.
///
/// `RUST_LOG` wins over everything; otherwise `debug` forces the debug level and the
/// configured level applies.
pub fn init(app_name: &str, config: &LoggingConfig, debug: bool) -> Option<PathBuf> {
    let level = if debug { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_timer(time::uptime())
        .with_thread_names(true);

    let path = config.file.then(|| {
        let dir = config.dir.clone().unwrap_or_else(std::env::temp_dir);
        log_file_path(&dir, app_name, chrono::Local::now().naive_local())
    });
    let file_layer = path.as_ref().map(|p| {
        fmt::layer()
            .with_writer(LazyFile::new(p.clone()))
            .with_ansi(false)
            .with_timer(time::uptime())
            .with_thread_names(true)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    path
}
