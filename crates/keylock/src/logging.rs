//! Tracing setup
//!
//! Log level comes from `RUST_LOG`, falling back to the caller's default. With a log
//! directory, output goes to `<dir>/YYYY-MM-DD.log`, switching files when the local date
//! changes; otherwise it goes to the given console stream. Colour is only used when that
//! stream is a terminal.

use std::{
    fs::{File, OpenOptions},
    io::{self, IsTerminal, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use tracing_subscriber::{fmt::MakeWriter, EnvFilter};

/// Console stream used when no log directory is configured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Console {
    Stdout,
    /// Keeps stdout for a wrapped command's own output
    Stderr,
}

impl Console {
    fn is_terminal(self) -> bool {
        match self {
            Self::Stdout => io::stdout().is_terminal(),
            Self::Stderr => io::stderr().is_terminal(),
        }
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns error if the log directory cannot be created or a subscriber is already set.
pub fn init(log_dir: Option<&Path>, console: Console, default_level: tracing::Level) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(default_level.into()));

    let installed = match log_dir {
        Some(dir) => {
            let writer = DailyFile::new(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .try_init()
        }
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(console.is_terminal());
            match console {
                Console::Stdout => subscriber.with_writer(io::stdout).try_init(),
                Console::Stderr => subscriber.with_writer(io::stderr).try_init(),
            }
        }
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to initialise logging: {e}"))
}

/// Append-only log file named after the current local date.
#[derive(Debug)]
pub struct DailyFile {
    dir: PathBuf,
    current: Mutex<Option<(NaiveDate, File)>>,
}

impl DailyFile {
    /// # Errors
    ///
    /// Returns error if `dir` cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            current: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.log", date.format("%Y-%m-%d")))
    }

    /// Write `buf` to the file for `date`, opening it first if the date moved on.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or written.
    pub fn write_dated(&self, date: NaiveDate, buf: &[u8]) -> io::Result<usize> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| io::Error::other("log writer poisoned"))?;
        let stale = current.as_ref().map_or(true, |(open, _)| *open != date);
        if stale {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(date))?;
            *current = Some((date, file));
        }
        match current.as_mut() {
            Some((_, file)) => file.write(buf),
            None => Ok(0),
        }
    }

    fn flush_current(&self) -> io::Result<()> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| io::Error::other("log writer poisoned"))?;
        match current.as_mut() {
            Some((_, file)) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Per-event handle returned by [`DailyFile`]'s `MakeWriter` impl.
#[derive(Debug)]
pub struct DailyFileWriter<'a> {
    target: &'a DailyFile,
}

impl Write for DailyFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.target.write_dated(Local::now().date_naive(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.target.flush_current()
    }
}

impl<'a> MakeWriter<'a> for DailyFile {
    type Writer = DailyFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        DailyFileWriter { target: self }
    }
}
