//! State shared by every task of a session: the run flag and the console.

use crate::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Session-wide "keep going" flag.
///
/// Starts out `true`. Once cleared it never becomes `true` again. Workers
/// poll [`RunFlag::is_running`] between units of work; sleeping tasks
/// await [`RunFlag::stopped`] so a stop wakes them immediately.
///
/// # Examples
///
/// ```
/// use miniperf::RunFlag;
///
/// let flag = RunFlag::new();
/// let worker_view = flag.clone();
///
/// assert!(worker_view.is_running());
/// flag.stop();
/// assert!(!worker_view.is_running());
/// ```
#[derive(Debug, Clone)]
pub struct RunFlag {
    running: Arc<AtomicBool>,
    wake: CancellationToken,
}

impl RunFlag {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            wake: CancellationToken::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clears the flag and wakes all waiters. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake.cancel();
    }

    /// Resolves once [`RunFlag::stop`] has been called.
    pub async fn stopped(&self) {
        self.wake.cancelled().await
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

struct ConsoleInner {
    file: Option<File>,
}

/// Serialized output sink.
///
/// Every line or block goes to stdout and, when configured, is appended to
/// an output file. Writes from different tasks never interleave.
#[derive(Clone)]
pub struct Console {
    inner: Arc<Mutex<ConsoleInner>>,
}

impl Console {
    /// Console writing to stdout only.
    pub fn stdout() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConsoleInner { file: None })),
        }
    }

    /// Console that also appends to `path`, creating it if needed.
    pub fn with_file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(ConsoleInner { file: Some(file) })),
        })
    }

    /// Builds a console from an optional output path.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::with_file(path),
            None => Ok(Self::stdout()),
        }
    }

    /// Writes one line.
    pub fn line(&self, text: &str) {
        self.block(&[text]);
    }

    /// Writes `value` as pretty-printed JSON.
    pub fn json<T: Serialize>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string_pretty(value)?;
        self.line(&text);
        Ok(())
    }

    /// Writes several lines without another writer getting in between.
    pub fn block<S: AsRef<str>>(&self, lines: &[S]) {
        let mut inner = self.inner.lock();
        if let Err(e) = write_lines(&mut std::io::stdout().lock(), lines) {
            log::warn!("Failed to write to stdout: {}", e);
        }
        if let Some(file) = inner.file.as_mut() {
            if let Err(e) = write_lines(file, lines) {
                log::warn!("Failed to write report file: {}", e);
            }
        }
    }
}

fn write_lines<W: Write, S: AsRef<str>>(out: &mut W, lines: &[S]) -> std::io::Result<()> {
    for line in lines {
        writeln!(out, "{}", line.as_ref())?;
    }
    out.flush()
}

impl Default for Console {
    fn default() -> Self {
        Self::stdout()
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("file", &self.inner.lock().file.is_some())
            .finish()
    }
}
