//! In-memory stand-ins for the controller, the container runtime and the
//! SCM, shared by the worker's unit tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use gantry_client::ClientError;
use gantry_core::domain::event::Event;
use gantry_core::domain::log::LogStreamKey;
use gantry_core::domain::pipeline::{
    BuildInfo, BuildSpec, BuildStages, BuilderImage, CodeCheckoutStage, CodeSource, ImageBuildInfo,
    ImageBuildStage, ImageReleaseStage, IntegrationService, IntegrationTestConfig, IntegrationTestStage,
    PackageStage, Pipeline, Project, ReleasePolicy, ScmConfig, UnitTestStage,
};
use gantry_core::domain::record::{CommitLog, PerformParams, PipelineRecord, StageName};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::logpipe::{LogPipeFactory, LogWriter};
use crate::repository::{EventRepository, LogStreamConnector, LogStreamSink};
use crate::runtime::{BuildOptions, ContainerRuntime, ContainerSpec, RegistryAuth};
use crate::scm::ScmProvider;
use crate::stage::StageManager;
use crate::worker::RunExecutor;

pub const COMMIT_ID: &str = "3e1f0a9c2b7d4e5f60718293a4b5c6d7e8f90123";

/// An event whose pipeline configures every stage
pub fn sample_event(stages: Vec<StageName>) -> Event {
    let project = Project {
        name: "acme".into(),
        scm: ScmConfig { token: "t0k".into() },
        ..Default::default()
    };

    let build_stages = BuildStages {
        code_checkout: Some(CodeCheckoutStage {
            main_repo: CodeSource {
                url: "https://git.example.com/acme/app.git".into(),
                reference: None,
            },
            dep_repos: Vec::new(),
        }),
        unit_test: Some(UnitTestStage {
            command: vec!["mvn test".into()],
        }),
        package: Some(PackageStage {
            command: vec!["mvn package".into()],
            outputs: Vec::new(),
        }),
        image_build: Some(ImageBuildStage {
            build_infos: vec![
                ImageBuildInfo {
                    task_name: "api".into(),
                    dockerfile: "FROM scratch".into(),
                    image_name: "reg.example.com/acme/api".into(),
                    ..Default::default()
                },
                ImageBuildInfo {
                    task_name: "web".into(),
                    dockerfile: "FROM scratch".into(),
                    image_name: "reg.example.com/acme/web".into(),
                    ..Default::default()
                },
            ],
        }),
        integration_test: Some(IntegrationTestStage {
            config: IntegrationTestConfig {
                image_name: "acme/api".into(),
                command: vec!["./it.sh".into()],
                env_vars: HashMap::new(),
            },
            services: vec![IntegrationService {
                name: "db".into(),
                image: "postgres:16".into(),
                command: Vec::new(),
                env_vars: HashMap::from([("POSTGRES_PASSWORD".to_string(), "secret".to_string())]),
            }],
        }),
        image_release: Some(ImageReleaseStage {
            release_policies: vec![ReleasePolicy {
                image_name: "api".into(),
            }],
        }),
    };

    let pipeline = Pipeline {
        name: "backend".into(),
        project_id: project.id,
        build: BuildSpec {
            builder_image: Some(BuilderImage {
                image: "maven:3-jdk-17".into(),
                env_vars: HashMap::new(),
            }),
            build_info: Some(BuildInfo::default()),
            stages: build_stages,
        },
        ..Default::default()
    };

    let params = PerformParams {
        reference: "main".into(),
        stages,
        ..Default::default()
    };
    let record = PipelineRecord::new(pipeline.id, params, "manual");

    Event::new(project, pipeline, record, Utc::now())
}

// =============================================================================
// Log streams
// =============================================================================

#[derive(Debug, Default)]
struct FakeStream {
    lines: Vec<String>,
    pings: usize,
    closed: bool,
}

type Streams = Arc<Mutex<HashMap<String, FakeStream>>>;

/// Records what each stream received, keyed by log file name
#[derive(Default)]
pub struct FakeConnector {
    unreachable: bool,
    streams: Streams,
}

impl FakeConnector {
    /// A connector whose streams all fail to open
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }

    pub fn lines(&self, name: &str) -> Vec<String> {
        self.streams
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.lines.clone())
            .unwrap_or_default()
    }

    pub fn pings(&self, name: &str) -> usize {
        self.streams.lock().unwrap().get(name).map_or(0, |s| s.pings)
    }

    pub fn closed(&self, name: &str) -> bool {
        self.streams.lock().unwrap().get(name).is_some_and(|s| s.closed)
    }
}

struct FakeSink {
    name: String,
    streams: Streams,
}

#[async_trait]
impl LogStreamSink for FakeSink {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        let mut streams = self.streams.lock().unwrap();
        streams.entry(self.name.clone()).or_default().lines.push(line.to_string());
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        let mut streams = self.streams.lock().unwrap();
        streams.entry(self.name.clone()).or_default().pings += 1;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut streams = self.streams.lock().unwrap();
        streams.entry(self.name.clone()).or_default().closed = true;
        Ok(())
    }
}

#[async_trait]
impl LogStreamConnector for FakeConnector {
    async fn connect(&self, key: &LogStreamKey) -> Result<Box<dyn LogStreamSink>> {
        if self.unreachable {
            anyhow::bail!("connection refused");
        }

        let name = key.file_name();
        self.streams.lock().unwrap().entry(name.clone()).or_default();

        Ok(Box::new(FakeSink {
            name,
            streams: Arc::clone(&self.streams),
        }))
    }
}

// =============================================================================
// Container runtime
// =============================================================================

#[derive(Debug, Default)]
struct RuntimeState {
    unavailable: bool,
    exit_codes: HashMap<String, i32>,
    failing_builds: HashSet<String>,
    failing_pushes: HashSet<String>,
    failing_removals: HashSet<String>,
    started: Vec<ContainerSpec>,
    execs: Vec<(String, String)>,
    copies: Vec<(String, String)>,
    built: Vec<BuildOptions>,
    pushed: Vec<String>,
    removal_attempts: Vec<String>,
    networks: Vec<String>,
    removed_networks: Vec<String>,
    op_delay: Duration,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Container runtime that records every call and never starts anything
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn unavailable() -> Self {
        let runtime = Self::default();
        runtime.state.lock().unwrap().unavailable = true;
        runtime
    }

    /// Makes `command` exit with `code`
    pub fn exit_with(&self, command: &str, code: i32) {
        self.state.lock().unwrap().exit_codes.insert(command.to_string(), code);
    }

    /// Fails builds of images whose reference contains `image`
    pub fn fail_build_of(&self, image: &str) {
        self.state.lock().unwrap().failing_builds.insert(image.to_string());
    }

    pub fn fail_push_of(&self, image: &str) {
        self.state.lock().unwrap().failing_pushes.insert(image.to_string());
    }

    pub fn fail_removal_of(&self, name: &str) {
        self.state.lock().unwrap().failing_removals.insert(name.to_string());
    }

    /// Makes every build and push take `delay`
    pub fn delay_ops(&self, delay: Duration) {
        self.state.lock().unwrap().op_delay = delay;
    }

    /// Most builds and pushes seen running at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.state.lock().unwrap().peak_in_flight
    }

    /// Holds an in-flight slot for the configured delay
    async fn occupy(&self) {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.in_flight += 1;
            state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
            state.op_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().unwrap().in_flight -= 1;
    }

    pub fn started(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().started.clone()
    }

    /// Commands executed, in order
    pub fn execs(&self) -> Vec<String> {
        self.state.lock().unwrap().execs.iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn copies(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().copies.clone()
    }

    /// Images built successfully
    pub fn built(&self) -> Vec<BuildOptions> {
        self.state.lock().unwrap().built.clone()
    }

    pub fn pushed(&self) -> Vec<String> {
        self.state.lock().unwrap().pushed.clone()
    }

    pub fn removal_attempts(&self) -> Vec<String> {
        self.state.lock().unwrap().removal_attempts.clone()
    }

    pub fn networks(&self) -> Vec<String> {
        self.state.lock().unwrap().networks.clone()
    }

    pub fn removed_networks(&self) -> Vec<String> {
        self.state.lock().unwrap().removed_networks.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn check_available(&self) -> Result<()> {
        if self.state.lock().unwrap().unavailable {
            anyhow::bail!("podman: command not found");
        }
        Ok(())
    }

    async fn pull_image(&self, image: &str, _auth: Option<&RegistryAuth>, log: &LogWriter) -> Result<()> {
        log.line(&format!("Pulling {}", image));
        Ok(())
    }

    async fn start_container(
        &self,
        spec: &ContainerSpec,
        _auth: Option<&RegistryAuth>,
        log: &LogWriter,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.started.push(spec.clone());
        log.line(&format!("Started {}", spec.name));
        Ok(spec.name.clone())
    }

    async fn exec(&self, container: &str, command: &str, _working_dir: Option<&str>, log: &LogWriter) -> Result<i32> {
        let mut state = self.state.lock().unwrap();
        state.execs.push((container.to_string(), command.to_string()));
        log.line(&format!("ran {}", command));
        Ok(state.exit_codes.get(command).copied().unwrap_or(0))
    }

    async fn copy_from_container(
        &self,
        container: &str,
        container_path: &str,
        _host_dir: &Path,
        _log: &LogWriter,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.copies.push((container.to_string(), container_path.to_string()));
        Ok(())
    }

    async fn build_image(&self, options: &BuildOptions, _auth: Option<&RegistryAuth>, log: &LogWriter) -> Result<()> {
        self.occupy().await;
        let mut state = self.state.lock().unwrap();
        if state.failing_builds.iter().any(|image| options.image.contains(image)) {
            log.line("Error: building at STEP \"RUN make\": exit status 2");
            anyhow::bail!("podman build failed with exit code 2");
        }
        log.line(&format!("Successfully tagged {}", options.image));
        state.built.push(options.clone());
        Ok(())
    }

    async fn push_image(&self, image: &str, _auth: Option<&RegistryAuth>, log: &LogWriter) -> Result<()> {
        self.occupy().await;
        let mut state = self.state.lock().unwrap();
        if state.failing_pushes.iter().any(|failing| image.contains(failing)) {
            anyhow::bail!("podman push failed with exit code 125");
        }
        log.line(&format!("Pushed {}", image));
        state.pushed.push(image.to_string());
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.removal_attempts.push(name.to_string());
        if state.failing_removals.contains(name) {
            anyhow::bail!("no such container {}", name);
        }
        Ok(())
    }

    async fn create_network(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().networks.push(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().removed_networks.push(name.to_string());
        Ok(())
    }
}

// =============================================================================
// SCM
// =============================================================================

/// SCM that creates empty checkouts at a fixed commit
#[derive(Default)]
pub struct FakeScm {
    fail_checkout: bool,
    fail_tag: bool,
    checkouts: Mutex<Vec<(String, Option<String>, PathBuf)>>,
    tags: Mutex<Vec<(String, String)>>,
}

impl FakeScm {
    pub fn failing_checkout() -> Self {
        Self {
            fail_checkout: true,
            ..Default::default()
        }
    }

    pub fn failing_tag() -> Self {
        Self {
            fail_tag: true,
            ..Default::default()
        }
    }

    /// Url, ref and destination of each checkout
    pub fn checkouts(&self) -> Vec<(String, Option<String>, PathBuf)> {
        self.checkouts.lock().unwrap().clone()
    }

    /// Tag and commit of each tag created
    pub fn tags(&self) -> Vec<(String, String)> {
        self.tags.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScmProvider for FakeScm {
    async fn checkout(
        &self,
        url: &str,
        reference: Option<&str>,
        dest: &Path,
        _token: &str,
        log: &LogWriter,
    ) -> Result<CommitLog> {
        self.checkouts
            .lock()
            .unwrap()
            .push((url.to_string(), reference.map(str::to_string), dest.to_path_buf()));

        if self.fail_checkout {
            log.line("fatal: repository not found");
            anyhow::bail!("git clone failed with exit code 128");
        }

        tokio::fs::create_dir_all(dest).await?;
        log.line(&format!("Cloning {}", url));

        Ok(CommitLog {
            id: COMMIT_ID.to_string(),
            author: "Jane Doe".into(),
            date: Some(Utc::now()),
            message: "Fix build".into(),
        })
    }

    async fn create_tag(&self, _repo: &Path, tag: &str, commit: &str, _log: &LogWriter) -> Result<()> {
        if self.fail_tag {
            anyhow::bail!("git push failed with exit code 1");
        }
        self.tags.lock().unwrap().push((tag.to_string(), commit.to_string()));
        Ok(())
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Event repository keeping every pushed snapshot
#[derive(Default)]
pub struct FakeEventRepository {
    queue: Mutex<VecDeque<Event>>,
    updates: Mutex<Vec<Event>>,
    resets: Mutex<Vec<Uuid>>,
    renewals: Mutex<Vec<Uuid>>,
    fail_updates: bool,
    gone_on_renewal: bool,
}

impl FakeEventRepository {
    pub fn with_events(events: Vec<Event>) -> Self {
        Self {
            queue: Mutex::new(events.into()),
            ..Default::default()
        }
    }

    pub fn failing_updates(mut self) -> Self {
        self.fail_updates = true;
        self
    }

    /// Answers lease renewals the way the controller does for a deleted event
    pub fn gone_on_renewal(mut self) -> Self {
        self.gone_on_renewal = true;
        self
    }

    pub fn updates(&self) -> Vec<Event> {
        self.updates.lock().unwrap().clone()
    }

    pub fn last_update(&self) -> Option<Event> {
        self.updates.lock().unwrap().last().cloned()
    }

    pub fn resets(&self) -> Vec<Uuid> {
        self.resets.lock().unwrap().clone()
    }

    pub fn renewals(&self) -> usize {
        self.renewals.lock().unwrap().len()
    }
}

#[async_trait]
impl EventRepository for FakeEventRepository {
    async fn get_event(&self, event_id: Uuid) -> Result<Event> {
        self.queue
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == event_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("event {} not found", event_id))
    }

    async fn next_event(&self) -> Result<Option<Event>> {
        Ok(self.queue.lock().unwrap().pop_front())
    }

    async fn update_event(&self, event: &Event) -> Result<()> {
        if self.fail_updates {
            anyhow::bail!("controller unavailable");
        }
        self.updates.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn renew_lease(&self, event_id: Uuid) -> Result<()> {
        self.renewals.lock().unwrap().push(event_id);
        if self.gone_on_renewal {
            return Err(ClientError::api_error(404, format!("{} not found", event_id)).into());
        }
        Ok(())
    }

    async fn reset_event(&self, event_id: Uuid) -> Result<Event> {
        self.resets.lock().unwrap().push(event_id);
        self.get_event(event_id).await
    }
}

/// Run executor over fakes, with workspaces and logs under `dir`
pub fn fake_executor(runtime: Arc<FakeRuntime>, events: Arc<FakeEventRepository>, dir: &Path) -> RunExecutor {
    fake_executor_with_lease(runtime, events, dir, Duration::from_secs(60))
}

pub fn fake_executor_with_lease(
    runtime: Arc<FakeRuntime>,
    events: Arc<FakeEventRepository>,
    dir: &Path,
    lease_renew_interval: Duration,
) -> RunExecutor {
    let pipes = LogPipeFactory::new(dir.join("logs"), Arc::new(FakeConnector::default()), Duration::ZERO);
    let stages = StageManager::new(
        runtime.clone(),
        Arc::new(FakeScm::default()),
        events.clone(),
        pipes,
        None,
        2,
    );
    RunExecutor::new(runtime, events, stages, dir.join("ws"), lease_renew_interval)
}
