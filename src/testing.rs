//! In-memory stand-ins for systemd, shadow-utils and HTTP, plus a harness
//! that wires a full daemon context over a temporary directory.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::TempDir;

use crate::accounts::AccountManager;
use crate::config::DaemonConfig;
use crate::daemon::{self, Backends, Context};
use crate::error::{Result, SupervisorError};
use crate::infection::{Infection, InfectionConfig, InfectionId, InfectionState, SourceDescriptor};
use crate::manifest::MANIFEST_FILE;
use crate::sources::{FetchError, Fetcher};
use crate::supervisor::command::render_command;
use crate::supervisor::{units, CommandOutput, CommandRunner, LogEntry, Supervisor, SupervisorStatus};

pub(crate) const DEMO_MANIFEST: &str = "metadata:
  name: demo
  version: 1.0.0
execution:
  command: ./run.sh
  environment:
    MODE: edge
";

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `CommandRunner` answering from canned outputs keyed by command prefix.
/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub(crate) struct ScriptedRunner {
    responses: Mutex<Vec<(String, CommandOutput)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    /// Later registrations win over earlier ones.
    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        locked(&self.responses).push((prefix.to_string(), output));
    }

    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        locked(&self.calls)
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[&str]) -> std::result::Result<CommandOutput, SupervisorError> {
        let line = render_command(program, args);
        locked(&self.calls).push(line.clone());
        let output = locked(&self.responses)
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| CommandOutput::ok(""));
        Ok(output)
    }
}

/// Serves registered URLs; everything else is a 404. `failing` turns every
/// request into a transient error.
#[derive(Default)]
pub(crate) struct FakeFetcher {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    attempts: AtomicUsize,
    failing: bool,
}

impl FakeFetcher {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn serve(&self, url: &str, body: Vec<u8>) {
        locked(&self.bodies).insert(url.to_string(), body);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(FetchError::Transient("connection refused".to_string()));
        }
        locked(&self.bodies).get(url).cloned().ok_or(FetchError::NotFound)
    }
}

/// What a unit does when started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartBehavior {
    Run,
    /// Exits straight away and lands in `failed`.
    Crash,
    /// Stays `activating` forever.
    Hang,
}

struct FakeUnit {
    dropin: Option<String>,
    status: SupervisorStatus,
}

fn inactive() -> SupervisorStatus {
    SupervisorStatus {
        active_state: "inactive".to_string(),
        sub_state: "dead".to_string(),
        ..SupervisorStatus::default()
    }
}

/// Supervisor that keeps units in memory and applies state changes
/// immediately.
pub(crate) struct FakeSupervisor {
    socket_path: PathBuf,
    units: Mutex<HashMap<String, FakeUnit>>,
    calls: Mutex<Vec<String>>,
    behavior: Mutex<StartBehavior>,
    next_pid: AtomicU32,
    stuck: AtomicBool,
}

impl FakeSupervisor {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            units: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            behavior: Mutex::new(StartBehavior::Run),
            next_pid: AtomicU32::new(4000),
            stuck: AtomicBool::new(false),
        }
    }

    /// Processes ignore stop requests and outlive their unit.
    pub fn set_stuck(&self, stuck: bool) {
        self.stuck.store(stuck, Ordering::SeqCst);
    }

    pub fn set_start_behavior(&self, behavior: StartBehavior) {
        *locked(&self.behavior) = behavior;
    }

    /// Force the reported state, as if systemd had changed it.
    pub fn set_status(&self, service: &str, active: &str, sub: &str) {
        let pid = (active == "active").then(|| self.pid());
        self.with_unit(service, |status| {
            status.active_state = active.to_string();
            status.sub_state = sub.to_string();
            status.pid = pid;
            if active != "active" {
                status.uptime = None;
            }
        });
    }

    pub fn set_restart_count(&self, service: &str, restarts: u32) {
        self.with_unit(service, |status| status.restart_count = restarts);
    }

    pub fn set_uptime(&self, service: &str, uptime: Option<u64>) {
        self.with_unit(service, |status| status.uptime = uptime);
    }

    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        locked(&self.calls)
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    /// Units created and not yet removed.
    pub fn unit_count(&self) -> usize {
        locked(&self.units)
            .values()
            .filter(|unit| unit.dropin.is_some())
            .count()
    }

    /// Register a unit without recording a call.
    fn adopt(&self, infection: &Infection, status: SupervisorStatus) {
        locked(&self.units).insert(
            infection.service_name.clone(),
            FakeUnit {
                dropin: Some(units::render_dropin(infection, &self.socket_path)),
                status,
            },
        );
    }

    fn pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    fn record(&self, action: &str, service: &str) {
        locked(&self.calls).push(format!("{action} {service}"));
    }

    fn with_unit(&self, service: &str, f: impl FnOnce(&mut SupervisorStatus)) {
        let mut units = locked(&self.units);
        let unit = units.entry(service.to_string()).or_insert_with(|| FakeUnit {
            dropin: None,
            status: inactive(),
        });
        f(&mut unit.status);
    }

    fn running(&self, restart_count: u32) -> SupervisorStatus {
        SupervisorStatus {
            active_state: "active".to_string(),
            sub_state: "running".to_string(),
            pid: Some(self.pid()),
            memory_usage: Some(8 * 1024 * 1024),
            cpu_usage: Some(1_000_000),
            uptime: None,
            restart_count,
        }
    }
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn create_service(&self, infection: &Infection) -> Result<bool> {
        units::validate_service_name(&infection.service_name)?;
        self.record("create", &infection.service_name);
        let dropin = units::render_dropin(infection, &self.socket_path);
        let mut units = locked(&self.units);
        let unit = units
            .entry(infection.service_name.clone())
            .or_insert_with(|| FakeUnit {
                dropin: None,
                status: inactive(),
            });
        let changed = unit.dropin.as_deref() != Some(dropin.as_str());
        unit.dropin = Some(dropin);
        Ok(changed)
    }

    async fn start(&self, service: &str) -> Result<()> {
        units::validate_service_name(service)?;
        let current = self.status(service).await?;
        if current.is_active() {
            return Ok(());
        }
        self.record("start", service);
        let behavior = *locked(&self.behavior);
        let restarts = current.restart_count;
        let next = match behavior {
            StartBehavior::Run => self.running(restarts),
            StartBehavior::Crash => SupervisorStatus {
                active_state: "failed".to_string(),
                sub_state: "failed".to_string(),
                restart_count: restarts,
                ..SupervisorStatus::default()
            },
            StartBehavior::Hang => SupervisorStatus {
                active_state: "activating".to_string(),
                sub_state: "start".to_string(),
                pid: Some(self.pid()),
                restart_count: restarts,
                ..SupervisorStatus::default()
            },
        };
        self.with_unit(service, |status| *status = next);
        Ok(())
    }

    async fn stop(&self, service: &str, force: bool) -> Result<()> {
        units::validate_service_name(service)?;
        self.record(if force { "stop --force" } else { "stop" }, service);
        if self.stuck.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.with_unit(service, |status| {
            let restarts = status.restart_count;
            *status = inactive();
            status.restart_count = restarts;
        });
        Ok(())
    }

    async fn restart(&self, service: &str) -> Result<()> {
        units::validate_service_name(service)?;
        self.record("restart", service);
        let current = self.status(service).await?;
        let next = self.running(current.restart_count);
        self.with_unit(service, |status| *status = next);
        Ok(())
    }

    async fn status(&self, service: &str) -> Result<SupervisorStatus> {
        units::validate_service_name(service)?;
        Ok(locked(&self.units)
            .get(service)
            .map(|unit| unit.status.clone())
            .unwrap_or_else(inactive))
    }

    async fn logs(&self, service: &str, lines: usize, _since: Option<&str>) -> Result<Vec<LogEntry>> {
        units::validate_service_name(service)?;
        Ok((0..lines)
            .map(|n| LogEntry {
                timestamp: "2026-01-01T00:00:00+00:00".to_string(),
                level: "INFO".to_string(),
                message: format!("line {n}"),
                pid: Some(4000),
            })
            .collect())
    }

    async fn remove_service(&self, service: &str) -> Result<()> {
        units::validate_service_name(service)?;
        self.record("remove", service);
        let mut units = locked(&self.units);
        if self.stuck.load(Ordering::SeqCst) {
            if let Some(unit) = units.get_mut(service) {
                unit.dropin = None;
            }
        } else {
            units.remove(service);
        }
        Ok(())
    }
}

/// Accounts tracked in a set instead of /etc/passwd.
#[derive(Default)]
pub(crate) struct FakeAccounts {
    users: Mutex<BTreeSet<String>>,
}

impl FakeAccounts {
    pub fn exists(&self, user: &str) -> bool {
        locked(&self.users).contains(user)
    }

    /// Accounts currently present.
    pub fn created(&self) -> Vec<String> {
        locked(&self.users).iter().cloned().collect()
    }
}

#[async_trait]
impl AccountManager for FakeAccounts {
    async fn ensure_account(&self, user: &str, _group: &str) -> Result<bool> {
        crate::accounts::validate_account_name(user)?;
        Ok(locked(&self.users).insert(user.to_string()))
    }

    async fn remove_account(&self, user: &str) -> Result<()> {
        locked(&self.users).remove(user);
        Ok(())
    }

    async fn grant_ownership(&self, path: &Path, user: &str, _group: &str) -> Result<()> {
        if !self.exists(user) {
            return Err(crate::error::PandemicError::validation(format!(
                "no such user '{user}'"
            )));
        }
        tokio::fs::metadata(path).await?;
        Ok(())
    }
}

/// A daemon context on fakes and a temporary directory.
pub(crate) struct Harness {
    pub dir: TempDir,
    pub config: DaemonConfig,
    pub supervisor: Arc<FakeSupervisor>,
    pub accounts: Arc<FakeAccounts>,
    pub fetcher: Arc<FakeFetcher>,
    pub context: Arc<Context>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_fetcher(FakeFetcher::default()).await
    }

    pub async fn with_fetcher(fetcher: FakeFetcher) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path();

        let mut config = DaemonConfig::default();
        config.daemon.socket_path = root.join("pandemic.sock");
        config.daemon.pid_file = root.join("pandemic.pid");
        config.daemon.socket_group = None;
        config.storage.infections_dir = root.join("infections");
        config.storage.state_dir = root.join("state");
        config.storage.unit_dir = root.join("units");
        config.supervisor.poll_interval_ms = 5;
        config.supervisor.start_timeout_secs = 1;
        config.supervisor.stop_timeout_secs = 1;
        config.fetch.initial_backoff_ms = 1;
        config.fetch.max_backoff_ms = 2;
        config.fetch.github_base_url = "https://github.test".to_string();
        config.events.enabled = true;
        config.events.capacity = 64;
        std::fs::create_dir_all(&config.storage.infections_dir).expect("infections dir");

        let supervisor = Arc::new(FakeSupervisor::new(config.daemon.socket_path.clone()));
        let accounts = Arc::new(FakeAccounts::default());
        let fetcher = Arc::new(fetcher);
        let backends = Backends {
            supervisor: Arc::clone(&supervisor) as Arc<dyn Supervisor>,
            accounts: Arc::clone(&accounts) as Arc<dyn AccountManager>,
            fetcher: Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        };
        let context = daemon::assemble(config.clone(), backends).expect("assemble");

        Self {
            dir,
            config,
            supervisor,
            accounts,
            fetcher,
            context,
        }
    }

    /// Put a record straight into the registry in `state`, with a matching
    /// unit on the fake supervisor.
    pub async fn seed(&self, name: &str, state: InfectionState) -> InfectionId {
        let id = InfectionId::generate();
        let install_path = id.install_path(&self.config.storage.infections_dir);
        std::fs::create_dir_all(&install_path).expect("install dir");
        let supervisor = &self.config.supervisor;
        let config = InfectionConfig {
            command: install_path.join("run.sh").display().to_string(),
            user: id.account_name(&supervisor.user_prefix),
            group: supervisor.group.clone(),
            working_directory: install_path.display().to_string(),
            ..InfectionConfig::default()
        };
        let source = SourceDescriptor::parse(&format!("local:///srv/bundles/{name}")).expect("source");
        let mut record = Infection::new(id.clone(), name.to_string(), source, install_path, config);
        record.state = state;

        let status = if state == InfectionState::Running {
            self.supervisor.running(0)
        } else {
            inactive()
        };
        self.supervisor.adopt(&record, status);
        self.context.registry.upsert(record).await.expect("seed");
        id
    }

    /// Write a bundle directory with `manifest` and return its source URI.
    pub fn local_bundle(&self, dirname: &str, manifest: &str) -> String {
        let path = self.dir.path().join("bundles").join(dirname);
        std::fs::create_dir_all(&path).expect("bundle dir");
        std::fs::write(path.join(MANIFEST_FILE), manifest).expect("manifest");
        std::fs::write(path.join("run.sh"), "#!/bin/sh\nexec sleep 1000\n").expect("run.sh");
        format!("local://{}", path.display())
    }

    /// Entries under the infections directory.
    pub fn install_dirs(&self) -> Vec<PathBuf> {
        entries(&self.config.storage.infections_dir)
    }

    pub fn staging_is_empty(&self) -> bool {
        entries(&self.config.staging_dir()).is_empty()
    }
}

fn entries(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
        .unwrap_or_default()
}
