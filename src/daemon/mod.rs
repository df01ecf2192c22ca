//! Pandemic daemon: the long-running process behind the IPC socket.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                  pandemic daemon                 │
//! ├──────────────────────────────────────────────────┤
//! │  IPC server  │    Router     │    Reconciler      │
//! │  (socket)    │ (per-id lock) │  (breaker, drift)  │
//! ├──────────────────────────────────────────────────┤
//! │  Pipeline ─▶ Lifecycle ─▶ Registry / Supervisor   │
//! ├──────────────────────────────────────────────────┤
//! │   pandemic-infection@<id>.service  (systemd)     │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod protocol;
pub mod reconciler;
pub mod router;
pub mod server;

use std::sync::Arc;
use std::time::Instant;

use crate::accounts::{AccountManager, SystemAccounts};
use crate::config::{self, DaemonConfig, SharedSettings};
use crate::error::Result;
use crate::events::{BroadcastSink, EventSink, NullSink};
use crate::lifecycle::Lifecycle;
use crate::locks::LockMap;
use crate::pipeline::Pipeline;
use crate::registry::InfectionRegistry;
use crate::sources::{Fetcher, HttpFetcher, SourceResolver};
use crate::supervisor::{CommandRunner, Supervisor, SystemdSupervisor, TokioCommandRunner};

pub use reconciler::Reconciler;
pub use router::Router;
pub use server::DaemonServer;

/// The system-facing collaborators. Tests substitute fakes.
pub struct Backends {
    pub supervisor: Arc<dyn Supervisor>,
    pub accounts: Arc<dyn AccountManager>,
    pub fetcher: Arc<dyn Fetcher>,
}

impl Backends {
    /// systemd, shadow-utils and HTTPS.
    pub fn system(config: &DaemonConfig) -> anyhow::Result<Self> {
        let runner: Arc<dyn CommandRunner> =
            Arc::new(TokioCommandRunner::new(config.supervisor.command_timeout()));
        let supervisor = SystemdSupervisor::new(
            Arc::clone(&runner),
            config.storage.unit_dir.clone(),
            config.daemon.socket_path.clone(),
        );
        let fetcher = HttpFetcher::new(config.fetch.attempt_timeout())?;
        Ok(Self {
            supervisor: Arc::new(supervisor),
            accounts: Arc::new(SystemAccounts::new(runner)),
            fetcher: Arc::new(fetcher),
        })
    }
}

/// Everything a request handler can reach.
pub struct Context {
    pub config: DaemonConfig,
    pub registry: Arc<InfectionRegistry>,
    pub lifecycle: Arc<Lifecycle>,
    pub pipeline: Pipeline,
    pub locks: Arc<LockMap>,
    pub events: Arc<dyn EventSink>,
    pub settings: SharedSettings,
    pub started_at: Instant,
}

impl Context {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Load the registry and wire the components together. Fails with
/// `StateCorruption` when the state file cannot be read.
pub fn assemble(config: DaemonConfig, backends: Backends) -> Result<Arc<Context>> {
    let registry = Arc::new(InfectionRegistry::load(&config.registry_path())?);
    let events: Arc<dyn EventSink> = if config.events.enabled {
        Arc::new(BroadcastSink::new(config.events.capacity))
    } else {
        Arc::new(NullSink)
    };
    let settings = config::shared(config.runtime_settings());
    let locks = Arc::new(LockMap::new());

    let lifecycle = Arc::new(Lifecycle::new(
        Arc::clone(&registry),
        backends.supervisor,
        Arc::clone(&events),
        Arc::clone(&settings),
        config.supervisor.poll_interval(),
        config.supervisor.healthy_uptime_secs,
    ));
    let resolver = SourceResolver::new(backends.fetcher, config.staging_dir(), config.fetch.clone());
    let pipeline = Pipeline::new(
        Arc::clone(&lifecycle),
        resolver,
        backends.accounts,
        Arc::clone(&locks),
        Arc::clone(&settings),
        config.storage.infections_dir.clone(),
        config.supervisor.user_prefix.clone(),
        config.supervisor.group.clone(),
    );

    Ok(Arc::new(Context {
        config,
        registry,
        lifecycle,
        pipeline,
        locks,
        events,
        settings,
        started_at: Instant::now(),
    }))
}
