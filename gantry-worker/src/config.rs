//! Worker configuration
//!
//! Defines all configurable parameters for the worker including polling,
//! concurrency bounds, local directories, log flushing and registry access.

use gantry_core::domain::event::LEASE_WINDOW_SECS;
use gantry_core::domain::pipeline::Registry;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this worker instance
    pub worker_id: String,

    /// Controller base URL (e.g., "http://localhost:8080")
    pub controller_url: String,

    /// Event to run in dispatch mode; the worker polls when unset
    pub event_id: Option<Uuid>,

    /// How often to ask the controller for the next event
    pub poll_interval: Duration,

    /// Maximum number of runs executed at the same time in poll mode
    pub max_parallel_runs: usize,

    /// Maximum number of image build/release tasks running at the same time
    pub max_parallel_tasks: usize,

    /// Directory holding one checkout workspace per run
    pub workspace_base: PathBuf,

    /// Directory holding the local stage log buffers
    pub log_dir: PathBuf,

    /// Delay between the end of a stage and the stop of its log forwarder
    pub log_flush_grace: Duration,

    /// How often the lease of a running event is renewed
    pub lease_renew_interval: Duration,

    /// Registry used when the project does not define one
    pub registry: Option<Registry>,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(worker_id: String, controller_url: String) -> Self {
        Self {
            worker_id,
            controller_url,
            event_id: None,
            poll_interval: Duration::from_secs(5),
            max_parallel_runs: 2,
            max_parallel_tasks: 4,
            workspace_base: PathBuf::from("/tmp/gantry/workspaces"),
            log_dir: PathBuf::from("/tmp/gantry/logs"),
            log_flush_grace: Duration::from_millis(3000),
            lease_renew_interval: Duration::from_secs(60),
            registry: None,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - WORKER_ID (required)
    /// - CONTROLLER_URL (required)
    /// - EVENT_ID (optional, runs that single event and exits)
    /// - POLL_INTERVAL (optional, seconds, default: 5)
    /// - MAX_PARALLEL_RUNS (optional, default: 2)
    /// - MAX_PARALLEL_TASKS (optional, default: 4)
    /// - WORKSPACE_BASE (optional, default: /tmp/gantry/workspaces)
    /// - LOG_DIR (optional, default: /tmp/gantry/logs)
    /// - LOG_FLUSH_GRACE_MS (optional, milliseconds, default: 3000)
    /// - LEASE_RENEW_INTERVAL (optional, seconds, default: 60)
    /// - REGISTRY_LOCATION, REGISTRY_USERNAME, REGISTRY_PASSWORD (optional)
    pub fn from_env() -> anyhow::Result<Self> {
        let worker_id = std::env::var("WORKER_ID")
            .map_err(|_| anyhow::anyhow!("WORKER_ID environment variable not set"))?;

        let controller_url = std::env::var("CONTROLLER_URL")
            .map_err(|_| anyhow::anyhow!("CONTROLLER_URL environment variable not set"))?;

        let event_id = Self::event_id_from_env()?;

        let defaults = Self::new(worker_id, controller_url);

        let poll_interval = env_parse::<u64>("POLL_INTERVAL")
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval);

        let max_parallel_runs =
            env_parse::<usize>("MAX_PARALLEL_RUNS").unwrap_or(defaults.max_parallel_runs);

        let max_parallel_tasks =
            env_parse::<usize>("MAX_PARALLEL_TASKS").unwrap_or(defaults.max_parallel_tasks);

        let workspace_base = std::env::var("WORKSPACE_BASE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| defaults.workspace_base.clone());

        let log_dir = std::env::var("LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| defaults.log_dir.clone());

        let log_flush_grace = env_parse::<u64>("LOG_FLUSH_GRACE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.log_flush_grace);

        let lease_renew_interval = env_parse::<u64>("LEASE_RENEW_INTERVAL")
            .map(Duration::from_secs)
            .unwrap_or(defaults.lease_renew_interval);

        let registry = std::env::var("REGISTRY_LOCATION")
            .ok()
            .filter(|location| !location.trim().is_empty())
            .map(|location| {
                registry_from_location(
                    &location,
                    std::env::var("REGISTRY_USERNAME").unwrap_or_default(),
                    std::env::var("REGISTRY_PASSWORD").unwrap_or_default(),
                )
            });

        Ok(Self {
            event_id,
            poll_interval,
            max_parallel_runs,
            max_parallel_tasks,
            workspace_base,
            log_dir,
            log_flush_grace,
            lease_renew_interval,
            registry,
            ..defaults
        })
    }

    /// Reads `EVENT_ID`; a value that is set but not a uuid is an error
    pub fn event_id_from_env() -> anyhow::Result<Option<Uuid>> {
        parse_event_id(std::env::var("EVENT_ID").ok().as_deref())
    }

    /// Picks the loaded configuration, or the defaults when loading failed
    ///
    /// The defaults keep the requested event, so a worker started for one
    /// event never falls back to polling.
    pub fn or_default(loaded: anyhow::Result<Self>, event_id: Option<Uuid>) -> Self {
        match loaded {
            Ok(config) => config,
            Err(e) => {
                tracing::info!("Failed to load config from environment ({}), using defaults", e);
                Self {
                    event_id,
                    ..Self::default()
                }
            }
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.is_empty() {
            anyhow::bail!("worker_id cannot be empty");
        }

        if self.controller_url.is_empty() {
            anyhow::bail!("controller_url cannot be empty");
        }

        if !self.controller_url.starts_with("http://") && !self.controller_url.starts_with("https://") {
            anyhow::bail!("controller_url must start with http:// or https://");
        }

        if self.poll_interval.as_secs() == 0 {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.max_parallel_runs == 0 {
            anyhow::bail!("max_parallel_runs must be greater than 0");
        }

        if self.max_parallel_tasks == 0 {
            anyhow::bail!("max_parallel_tasks must be greater than 0");
        }

        if self.lease_renew_interval.is_zero()
            || self.lease_renew_interval.as_secs() >= LEASE_WINDOW_SECS as u64
        {
            anyhow::bail!(
                "lease_renew_interval must be between 1s and the {}s lease window",
                LEASE_WINDOW_SECS
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Uuid::new_v4().to_string(), "http://localhost:8080".to_string())
    }
}

fn parse_event_id(raw: Option<&str>) -> anyhow::Result<Option<Uuid>> {
    match raw.map(str::trim) {
        Some(raw) if !raw.is_empty() => Uuid::parse_str(raw)
            .map(Some)
            .map_err(|e| anyhow::anyhow!("EVENT_ID is not a valid uuid: {}", e)),
        _ => Ok(None),
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

/// Splits `server[/repository]` into a registry definition
fn registry_from_location(location: &str, username: String, password: String) -> Registry {
    let location = location.trim().trim_end_matches('/');
    let (server, repository) = match location.split_once('/') {
        Some((server, repository)) => (server, repository),
        None => (location, ""),
    };

    Registry {
        server: server.to_string(),
        repository: repository.to_string(),
        username,
        password,
    }
}
