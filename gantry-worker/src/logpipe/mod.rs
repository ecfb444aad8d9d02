//! Log pipe
//!
//! Every stage (or fan-out task) writes its output into an append-only local
//! buffer file. A forwarder task tails that file and pushes each complete,
//! non-empty line to the controller over a persistent log stream, pinging the
//! stream while idle.
//!
//! Closing a pipe waits for the flush grace period first, so output written
//! right before the stage finished still reaches viewers.

mod forwarder;

use anyhow::{Context, Result};
use gantry_core::domain::log::LogStreamKey;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::repository::LogStreamConnector;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

/// Append-only handle on a stage log buffer
pub struct LogWriter {
    path: PathBuf,
    file: File,
}

impl LogWriter {
    /// Creates (or truncates) the buffer file, creating parent directories
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line to the buffer
    pub fn line(&self, text: &str) {
        let mut file = &self.file;
        if let Err(e) = writeln!(file, "{}", text) {
            warn!("Failed to write to log file {}: {}", self.path.display(), e);
        }
    }

    /// A handle child processes can write their stdout/stderr into
    pub fn stdio(&self) -> Result<Stdio> {
        let file = self
            .file
            .try_clone()
            .with_context(|| format!("Failed to clone log file {}", self.path.display()))?;
        Ok(Stdio::from(file))
    }
}

/// Opens log pipes for the stages of a run
pub struct LogPipeFactory {
    log_dir: PathBuf,
    connector: Arc<dyn LogStreamConnector>,
    grace: Duration,
    poll_interval: Duration,
    ping_interval: Duration,
}

impl LogPipeFactory {
    /// Creates a new factory
    ///
    /// # Arguments
    /// * `log_dir` - Directory holding the buffers, one sub-directory per run
    /// * `connector` - Opens the log streams towards the controller
    /// * `grace` - Delay between a stage finishing and its forwarder stopping
    pub fn new(log_dir: PathBuf, connector: Arc<dyn LogStreamConnector>, grace: Duration) -> Self {
        Self {
            log_dir,
            connector,
            grace,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    /// Overrides how often buffers are tailed and how long a stream may stay idle
    pub fn with_intervals(mut self, poll_interval: Duration, ping_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.ping_interval = ping_interval;
        self
    }

    /// Opens the buffer and forwarder for one stream
    ///
    /// A stream that cannot be connected only loses live forwarding: the
    /// buffer is still written and the stage carries on.
    pub async fn open(&self, key: LogStreamKey) -> Result<LogPipe> {
        let path = self.log_dir.join(&key.run).join(key.file_name());
        let writer = LogWriter::create(&path)?;

        let forwarder = match self.connector.connect(&key).await {
            Ok(sink) => {
                let reader = tokio::fs::File::open(&path)
                    .await
                    .with_context(|| format!("Failed to open log file {}", path.display()))?;
                let (stop_tx, stop_rx) = oneshot::channel();
                let handle = tokio::spawn(forwarder::forward(
                    reader,
                    sink,
                    stop_rx,
                    self.poll_interval,
                    self.ping_interval,
                    key.file_name(),
                ));
                Some((stop_tx, handle))
            }
            Err(e) => {
                warn!("Log stream {} unavailable, keeping local log only: {:#}", key.file_name(), e);
                None
            }
        };

        debug!("Opened log pipe {}", path.display());

        Ok(LogPipe {
            key,
            writer,
            forwarder,
            grace: self.grace,
        })
    }
}

/// A stage log buffer and its forwarder
pub struct LogPipe {
    key: LogStreamKey,
    writer: LogWriter,
    forwarder: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
    grace: Duration,
}

impl LogPipe {
    pub fn writer(&self) -> &LogWriter {
        &self.writer
    }

    /// Waits for the grace period, then drains and stops the forwarder
    pub async fn close(self) {
        let Some((stop, handle)) = self.forwarder else {
            return;
        };

        tokio::time::sleep(self.grace).await;
        let _ = stop.send(());

        if let Err(e) = handle.await {
            warn!("Log forwarder for {} panicked: {}", self.key.file_name(), e);
        }
    }
}
