//! Install, update and remove orchestration.
//!
//! ```text
//! allowlist ─▶ resolve ─▶ name check ─▶ account ─▶ copy ─▶ record ─▶ unit ─▶ start
//!                                          │          │        │        │       │
//!                                          └──────────┴────────┴────────┴───────┘
//!                                                  rolled back on any failure
//! ```
//!
//! An install either ends with a live record or leaves nothing behind:
//! every side effect is tracked in [`Progress`] and undone in reverse.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::accounts::AccountManager;
use crate::config::{self, SharedSettings};
use crate::error::{PandemicError, Result};
use crate::events::{Event, EventKind};
use crate::infection::{Infection, InfectionConfig, InfectionId, InfectionState, SourceDescriptor};
use crate::lifecycle::Lifecycle;
use crate::locks::LockMap;
use crate::manifest::{self, ConfigOverrides, RunAs};
use crate::sources::{archive, Bundle, SourceResolver};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    pub source: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Leave the install path in place when the install is rolled back.
    #[serde(default)]
    pub keep_files: bool,
    #[serde(default)]
    pub config_overrides: ConfigOverrides,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    /// New source; the recorded one when absent.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub config_overrides: ConfigOverrides,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallOutcome {
    pub infection_id: InfectionId,
    pub service_name: String,
    pub installation_path: PathBuf,
    pub state: InfectionState,
}

impl From<&Infection> for InstallOutcome {
    fn from(record: &Infection) -> Self {
        Self {
            infection_id: record.id.clone(),
            service_name: record.service_name.clone(),
            installation_path: record.install_path.clone(),
            state: record.state,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveOutcome {
    pub removed_files: Vec<String>,
    pub removed_services: Vec<String>,
}

struct InFlightInstall {
    name: String,
    cancel: Arc<AtomicBool>,
}

/// Installs that have been assigned an id but not yet committed.
#[derive(Default)]
struct InFlight {
    installs: Mutex<HashMap<InfectionId, InFlightInstall>>,
}

impl InFlight {
    fn register(&self, id: &InfectionId, name: &str) -> Result<InstallTicket<'_>> {
        let mut installs = self.installs.lock().unwrap_or_else(PoisonError::into_inner);
        if installs.values().any(|install| install.name == name) {
            return Err(PandemicError::conflict(format!(
                "an install of '{name}' is already in progress"
            )));
        }
        let cancel = Arc::new(AtomicBool::new(false));
        installs.insert(
            id.clone(),
            InFlightInstall {
                name: name.to_string(),
                cancel: Arc::clone(&cancel),
            },
        );
        Ok(InstallTicket {
            table: self,
            id: id.clone(),
            cancel,
        })
    }

    /// Flag the in-flight install of `id`. Returns whether one existed.
    fn cancel(&self, id: &InfectionId) -> bool {
        let installs = self.installs.lock().unwrap_or_else(PoisonError::into_inner);
        match installs.get(id) {
            Some(install) => {
                install.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

struct InstallTicket<'a> {
    table: &'a InFlight,
    id: InfectionId,
    cancel: Arc<AtomicBool>,
}

impl InstallTicket<'_> {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

impl Drop for InstallTicket<'_> {
    fn drop(&mut self) {
        self.table
            .installs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Side effects of an install so far, in the order they happened.
#[derive(Default)]
struct Progress {
    account: Option<String>,
    install_path: Option<PathBuf>,
    record: bool,
    service: Option<String>,
}

pub struct Pipeline {
    lifecycle: Arc<Lifecycle>,
    resolver: SourceResolver,
    accounts: Arc<dyn AccountManager>,
    locks: Arc<LockMap>,
    settings: SharedSettings,
    infections_dir: PathBuf,
    user_prefix: String,
    group: String,
    in_flight: InFlight,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        resolver: SourceResolver,
        accounts: Arc<dyn AccountManager>,
        locks: Arc<LockMap>,
        settings: SharedSettings,
        infections_dir: PathBuf,
        user_prefix: String,
        group: String,
    ) -> Self {
        Self {
            lifecycle,
            resolver,
            accounts,
            locks,
            settings,
            infections_dir,
            user_prefix,
            group,
            in_flight: InFlight::default(),
        }
    }

    pub async fn install(&self, request: InstallRequest) -> Result<InstallOutcome> {
        let descriptor = SourceDescriptor::parse(&request.source)?;
        let settings = config::snapshot(&self.settings);
        SourceResolver::check_allowed(&descriptor, &settings.allowed_sources)?;
        if let Some(name) = &request.name {
            manifest::validate_name(name)?;
        }
        request.config_overrides.validate()?;

        let bundle = self.resolver.resolve(&descriptor).await?;
        let name = request
            .name
            .clone()
            .or_else(|| bundle.manifest.name().map(str::to_string))
            .unwrap_or_else(|| descriptor.default_name());

        let id = self.allocate_id();
        let ticket = match self.in_flight.register(&id, &name) {
            Ok(ticket) => ticket,
            Err(e) => {
                bundle.discard().await;
                return Err(e);
            }
        };

        if let Some(existing) = self.lifecycle.registry().find_by_name(&name) {
            if !request.force {
                bundle.discard().await;
                return Err(PandemicError::conflict(format!(
                    "infection '{name}' already exists as {}",
                    existing.id
                )));
            }
            info!(name = %name, replaced = %existing.id, "Replacing existing infection");
            if let Err(e) = self.remove(&existing.id, true, false).await {
                bundle.discard().await;
                return Err(e);
            }
        }

        let _guard = self.locks.lock(&id).await;
        info!(infection_id = %id, name = %name, source = %descriptor.uri, "Installing infection");

        let mut progress = Progress::default();
        let result = self
            .install_steps(&id, name, descriptor, &request, &bundle, &ticket, &mut progress)
            .await;
        bundle.discard().await;

        match result {
            Ok(record) => {
                info!(infection_id = %id, state = %record.state, "Install complete");
                Ok(InstallOutcome::from(&record))
            }
            Err(e) => {
                let e = if ticket.cancelled() {
                    PandemicError::Cancelled(id.to_string())
                } else {
                    e
                };
                warn!(infection_id = %id, error = %e, "Install failed, rolling back");
                self.rollback(&id, progress, request.keep_files).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn install_steps(
        &self,
        id: &InfectionId,
        name: String,
        descriptor: SourceDescriptor,
        request: &InstallRequest,
        bundle: &Bundle,
        ticket: &InstallTicket<'_>,
        progress: &mut Progress,
    ) -> Result<Infection> {
        let install_path = id.install_path(&self.infections_dir);
        let default_user = id.account_name(&self.user_prefix);
        let config = bundle.manifest.to_config(
            &install_path,
            RunAs {
                user: &default_user,
                group: &self.group,
            },
            &request.config_overrides,
        );
        let manifest_version = bundle.manifest.metadata.version.clone();

        self.checkpoint(id, ticket)?;
        if self.accounts.ensure_account(&config.user, &config.group).await? {
            progress.account = Some(config.user.clone());
        }

        progress.install_path = Some(install_path.clone());
        place_tree(&bundle.root_dir, &install_path).await?;
        self.accounts
            .grant_ownership(&install_path, &config.user, &config.group)
            .await?;
        self.checkpoint(id, ticket)?;

        let mut record = Infection::new(id.clone(), name, descriptor, install_path, config);
        record.manifest_version = manifest_version;
        let registry = self.lifecycle.registry();
        let record = registry.upsert(record).await?;
        progress.record = true;
        self.publish(EventKind::Installing, &record);
        self.checkpoint(id, ticket)?;

        let supervisor = self.lifecycle.supervisor();
        progress.service = Some(record.service_name.clone());
        supervisor.create_service(&record).await?;
        let record = self.lifecycle.transition(id, InfectionState::Installed).await?;
        self.publish(EventKind::Installed, &record);
        self.checkpoint(id, ticket)?;

        if !request.auto_start {
            return Ok(record);
        }
        let record = self.lifecycle.start(id).await?;
        self.checkpoint(id, ticket)?;
        Ok(record)
    }

    /// Abort point for a concurrent remove.
    fn checkpoint(&self, id: &InfectionId, ticket: &InstallTicket<'_>) -> Result<()> {
        let removing = self
            .lifecycle
            .registry()
            .get(id)
            .is_ok_and(|r| r.state == InfectionState::Removing);
        if ticket.cancelled() || removing {
            info!(infection_id = %id, "Install cancelled");
            return Err(PandemicError::Cancelled(id.to_string()));
        }
        Ok(())
    }

    /// Undo `progress` in reverse. Every step is best-effort, but files and
    /// the account stay while the unit may still have a live process.
    async fn rollback(&self, id: &InfectionId, progress: Progress, keep_files: bool) {
        let stopped = match &progress.service {
            Some(service) => self.retire_unit(id, service).await,
            None => true,
        };
        if progress.record {
            if let Err(e) = self.lifecycle.registry().delete(id).await {
                warn!(infection_id = %id, error = %e, "Rollback: could not delete record");
            }
        }
        if let Some(path) = &progress.install_path {
            if keep_files {
                debug!(infection_id = %id, path = %path.display(), "Rollback: keeping files");
            } else if !stopped {
                warn!(infection_id = %id, path = %path.display(), "Rollback: unit not confirmed stopped, keeping files");
            } else if let Err(e) = remove_tree(path).await {
                warn!(infection_id = %id, error = %e, "Rollback: could not remove install path");
            }
        }
        if let Some(user) = &progress.account {
            if !stopped {
                warn!(infection_id = %id, user = %user, "Rollback: unit not confirmed stopped, keeping account");
            } else if let Err(e) = self.accounts.remove_account(user).await {
                warn!(infection_id = %id, error = %e, "Rollback: could not remove account");
            }
        }
        info!(infection_id = %id, "Rollback complete");
    }

    /// Remove `service` and report whether it is confirmed to have no
    /// live process left.
    async fn retire_unit(&self, id: &InfectionId, service: &str) -> bool {
        let supervisor = self.lifecycle.supervisor();
        if let Err(e) = supervisor.remove_service(service).await {
            warn!(infection_id = %id, error = %e, "Rollback: could not remove unit");
        }
        match supervisor.status(service).await {
            Ok(status) => match status.pid {
                Some(pid) => {
                    warn!(infection_id = %id, pid, "Rollback: unit still has a live process");
                    false
                }
                None => true,
            },
            Err(e) => {
                warn!(infection_id = %id, error = %e, "Rollback: could not query unit");
                false
            }
        }
    }

    /// Finish work a previous daemon process left half done: records still
    /// `installing` are rolled back, records still `removing` are removed.
    /// Returns how many records were settled.
    pub async fn recover_interrupted(&self) -> usize {
        let mut settled = 0;
        for record in self.lifecycle.registry().list() {
            let id = record.id.clone();
            match record.state {
                InfectionState::Installing => {
                    let guard = self.locks.lock(&id).await;
                    warn!(infection_id = %id, "Rolling back interrupted install");
                    let generated = id.account_name(&self.user_prefix);
                    let progress = Progress {
                        account: (record.config.user == generated).then_some(generated),
                        install_path: Some(record.install_path.clone()),
                        record: true,
                        service: Some(record.service_name.clone()),
                    };
                    self.rollback(&id, progress, false).await;
                    drop(guard);
                    settled += 1;
                }
                InfectionState::Removing => {
                    let guard = self.locks.lock(&id).await;
                    warn!(infection_id = %id, "Finishing interrupted remove");
                    match self.remove_locked(record, true, false).await {
                        Ok(_) => settled += 1,
                        Err(e) => warn!(infection_id = %id, error = %e, "Interrupted remove did not finish"),
                    }
                    drop(guard);
                }
                _ => {}
            }
        }
        settled
    }

    /// Stop (unless `force`), drop the unit, the files (unless
    /// `keep_files`) and the record. An install still in flight for `id`
    /// is cancelled and rolled back instead.
    pub async fn remove(&self, id: &InfectionId, force: bool, keep_files: bool) -> Result<RemoveOutcome> {
        let cancelled = self.in_flight.cancel(id);
        if cancelled {
            info!(infection_id = %id, "Cancelling in-flight install");
            let registry = self.lifecycle.registry();
            if registry.contains(id) {
                let marked = registry
                    .update(id, |r| {
                        if r.state.can_transition_to(InfectionState::Removing) {
                            r.state = InfectionState::Removing;
                        }
                        Ok(())
                    })
                    .await;
                if let Err(e) = marked {
                    debug!(infection_id = %id, error = %e, "Could not mark record removing");
                }
            }
        }

        let guard = self.locks.lock(id).await;
        let record = match self.lifecycle.registry().get(id) {
            Ok(record) => record,
            Err(PandemicError::NotFound(_)) if cancelled => {
                drop(guard);
                self.locks.forget(id);
                return Ok(RemoveOutcome::default());
            }
            Err(e) => return Err(e),
        };
        let outcome = self.remove_locked(record, force, keep_files).await;
        drop(guard);
        if outcome.is_ok() {
            self.locks.forget(id);
        }
        outcome
    }

    async fn remove_locked(&self, record: Infection, force: bool, keep_files: bool) -> Result<RemoveOutcome> {
        let id = &record.id;
        let service = record.service_name.as_str();
        let supervisor = self.lifecycle.supervisor();
        info!(infection_id = %id, force, keep_files, "Removing infection");

        let live = matches!(
            record.state,
            InfectionState::Starting | InfectionState::Running | InfectionState::Stopping
        );
        if live && !force {
            self.lifecycle.stop(id, false).await?;
        }
        self.lifecycle.transition(id, InfectionState::Removing).await?;
        if force {
            if let Err(e) = supervisor.stop(service, true).await {
                warn!(infection_id = %id, error = %e, "Force stop failed");
            }
        }

        let mut outcome = RemoveOutcome::default();
        supervisor.remove_service(service).await?;
        outcome.removed_services.push(service.to_string());

        // Files go only once no process can still be running from them.
        let status = supervisor.status(service).await?;
        if let Some(pid) = status.pid {
            return Err(PandemicError::conflict(format!(
                "{service} still has live process {pid}; retry the remove"
            )));
        }

        if keep_files {
            debug!(infection_id = %id, "Keeping install path");
        } else {
            remove_tree(&record.install_path).await?;
            outcome
                .removed_files
                .push(record.install_path.display().to_string());
        }

        if record.config.user == id.account_name(&self.user_prefix) {
            if let Err(e) = self.accounts.remove_account(&record.config.user).await {
                warn!(infection_id = %id, error = %e, "Could not remove account");
            }
        }

        self.lifecycle.transition(id, InfectionState::Removed).await?;
        self.lifecycle.registry().delete(id).await?;
        self.publish(EventKind::Removed, &record);
        info!(infection_id = %id, "Infection removed");
        Ok(outcome)
    }

    /// Replace an infection's payload with a freshly resolved bundle. The
    /// running infection is untouched until the new bundle is staged; the
    /// previous tree is restored if the new one fails to come up.
    pub async fn update(&self, id: &InfectionId, request: UpdateRequest) -> Result<InstallOutcome> {
        let _guard = self.locks.lock(id).await;
        let record = self.lifecycle.registry().get(id)?;
        if matches!(
            record.state,
            InfectionState::Installing | InfectionState::Removing | InfectionState::Removed
        ) {
            return Err(PandemicError::conflict(format!(
                "cannot update {id} while it is {}",
                record.state
            )));
        }

        let descriptor = match &request.source {
            Some(raw) => SourceDescriptor::parse(raw)?,
            None => record.source.clone(),
        };
        SourceResolver::check_allowed(&descriptor, &config::snapshot(&self.settings).allowed_sources)?;
        let bundle = self.resolver.resolve(&descriptor).await?;

        let install_path = record.install_path.clone();
        let staged = sibling(&install_path, "new");
        let previous = sibling(&install_path, "old");
        let config = bundle.manifest.to_config(
            &install_path,
            RunAs {
                user: &record.config.user,
                group: &record.config.group,
            },
            &request.config_overrides,
        );
        let manifest_version = bundle.manifest.metadata.version.clone();

        let placed = async {
            remove_tree(&staged).await?;
            place_tree(&bundle.root_dir, &staged).await?;
            self.accounts
                .grant_ownership(&staged, &config.user, &config.group)
                .await
        }
        .await;
        bundle.discard().await;
        if let Err(e) = placed {
            discard_staged(id, &staged).await;
            return Err(e);
        }

        let was_running = matches!(
            record.state,
            InfectionState::Starting | InfectionState::Running
        );
        if was_running {
            if let Err(e) = self.lifecycle.stop(id, false).await {
                discard_staged(id, &staged).await;
                return Err(e);
            }
        }

        if let Err(e) = swap_trees(&install_path, &staged, &previous).await {
            warn!(infection_id = %id, error = %e, "Could not swap in the new tree");
            discard_staged(id, &staged).await;
            if was_running {
                if let Err(e) = self.lifecycle.start(id).await {
                    warn!(infection_id = %id, error = %e, "Previous version did not restart");
                }
            }
            return Err(e);
        }

        let applied = self
            .apply_update(id, descriptor, config, manifest_version, was_running)
            .await;
        match applied {
            Ok(updated) => {
                if let Err(e) = remove_tree(&previous).await {
                    warn!(infection_id = %id, error = %e, "Could not remove previous tree");
                }
                info!(infection_id = %id, version = ?updated.manifest_version, "Infection updated");
                self.publish_with(EventKind::Updated, &updated, json!({ "version": updated.manifest_version }));
                Ok(InstallOutcome::from(&updated))
            }
            Err(e) => {
                warn!(infection_id = %id, error = %e, "Update failed, restoring previous version");
                self.restore(&record, &previous, was_running).await;
                Err(e)
            }
        }
    }

    async fn apply_update(
        &self,
        id: &InfectionId,
        descriptor: SourceDescriptor,
        config: InfectionConfig,
        manifest_version: Option<String>,
        start: bool,
    ) -> Result<Infection> {
        let updated = self
            .lifecycle
            .registry()
            .update(id, |r| {
                r.source = descriptor;
                r.config = config;
                r.manifest_version = manifest_version;
                Ok(())
            })
            .await?;
        self.lifecycle.supervisor().create_service(&updated).await?;
        if start {
            return self.lifecycle.start(id).await;
        }
        Ok(updated)
    }

    async fn restore(&self, original: &Infection, previous: &Path, start: bool) {
        let id = &original.id;
        let path = &original.install_path;
        if let Err(e) = remove_tree(path).await {
            warn!(infection_id = %id, error = %e, "Restore: could not clear new tree");
        }
        if let Err(e) = tokio::fs::rename(previous, path).await {
            warn!(infection_id = %id, error = %e, "Restore: could not put previous tree back");
        }

        let registry = self.lifecycle.registry();
        let current_state = registry.get(id).map(|r| r.state).unwrap_or(original.state);
        let mut restored = original.clone();
        restored.state = current_state;
        if let Err(e) = registry.upsert(restored.clone()).await {
            warn!(infection_id = %id, error = %e, "Restore: could not restore record");
            return;
        }
        if let Err(e) = self.lifecycle.supervisor().create_service(&restored).await {
            warn!(infection_id = %id, error = %e, "Restore: could not restore unit");
            return;
        }
        if start {
            if let Err(e) = self.lifecycle.start(id).await {
                warn!(infection_id = %id, error = %e, "Restore: previous version did not start");
            }
        }
    }

    /// Merge `overrides` into the infection's config, re-render its unit
    /// and restart it when running so the change takes effect.
    pub async fn configure(&self, id: &InfectionId, overrides: ConfigOverrides) -> Result<Infection> {
        let _guard = self.locks.lock(id).await;
        let current = self.lifecycle.registry().get(id)?;
        if matches!(
            current.state,
            InfectionState::Installing | InfectionState::Removing | InfectionState::Removed
        ) {
            return Err(PandemicError::conflict(format!(
                "cannot configure {id} while it is {}",
                current.state
            )));
        }

        overrides.validate()?;

        let record = self
            .lifecycle
            .registry()
            .update(id, |r| {
                r.config.environment.extend(overrides.environment);
                if overrides.resources.memory_limit.is_some() {
                    r.config.resources.memory_limit = overrides.resources.memory_limit;
                }
                if overrides.resources.cpu_quota.is_some() {
                    r.config.resources.cpu_quota = overrides.resources.cpu_quota;
                }
                Ok(())
            })
            .await?;

        let supervisor = self.lifecycle.supervisor();
        let changed = supervisor.create_service(&record).await?;
        if changed && record.state == InfectionState::Running {
            info!(infection_id = %id, "Restarting to apply new configuration");
            supervisor.restart(&record.service_name).await?;
            return self.lifecycle.reconcile(id).await;
        }
        Ok(record)
    }

    fn allocate_id(&self) -> InfectionId {
        loop {
            let id = InfectionId::generate();
            if !self.lifecycle.registry().contains(&id) {
                return id;
            }
        }
    }

    fn publish(&self, kind: EventKind, record: &Infection) {
        self.publish_with(
            kind,
            record,
            json!({ "name": record.name, "serviceName": record.service_name }),
        );
    }

    fn publish_with(&self, kind: EventKind, record: &Infection, extra: serde_json::Value) {
        self.lifecycle
            .events()
            .publish(Event::infection(kind, &record.id, extra));
    }
}

/// `<dir>/.<id>.<suffix>`, next to the install path so renames stay on
/// one filesystem.
fn sibling(install_path: &Path, suffix: &str) -> PathBuf {
    let name = install_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    install_path.with_file_name(format!(".{name}.{suffix}"))
}

/// Move (or copy across filesystems) a bundle tree to `dest` and tighten
/// its permissions.
async fn place_tree(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(src, dest).await.is_err() {
        let (src, dest) = (src.to_path_buf(), dest.to_path_buf());
        run_io(move || archive::copy_dir(&src, &dest)).await?;
    }
    let dest = dest.to_path_buf();
    run_io(move || archive::harden_permissions(&dest)).await
}

/// Move `install_path` aside to `previous` and `staged` into its place.
/// On error `install_path` holds the tree it held before.
async fn swap_trees(install_path: &Path, staged: &Path, previous: &Path) -> Result<()> {
    remove_tree(previous).await?;
    tokio::fs::rename(install_path, previous).await?;
    if let Err(e) = tokio::fs::rename(staged, install_path).await {
        tokio::fs::rename(previous, install_path).await?;
        return Err(e.into());
    }
    Ok(())
}

async fn discard_staged(id: &InfectionId, staged: &Path) {
    if let Err(e) = remove_tree(staged).await {
        warn!(infection_id = %id, error = %e, "Could not remove staged tree");
    }
}

async fn remove_tree(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn run_io<F>(f: F) -> Result<()>
where
    F: FnOnce() -> io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::other(e.to_string()))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::archive::fixtures;
    use crate::testing::{FakeFetcher, Harness, StartBehavior, DEMO_MANIFEST};

    fn request(source: &str) -> InstallRequest {
        InstallRequest {
            source: source.to_string(),
            name: None,
            force: false,
            auto_start: true,
            keep_files: false,
            config_overrides: ConfigOverrides::default(),
        }
    }

    #[tokio::test]
    async fn install_local_bundle_reaches_running() {
        let h = Harness::new().await;
        let source = h.local_bundle("demo", DEMO_MANIFEST);

        let outcome = h.context.pipeline.install(request(&source)).await.expect("install");
        assert_eq!(outcome.state, InfectionState::Running);
        assert!(outcome.installation_path.join("infection.yaml").is_file());
        assert_eq!(
            outcome.service_name,
            outcome.infection_id.service_name()
        );

        let record = h.context.registry.get(&outcome.infection_id).expect("record");
        assert_eq!(record.state, InfectionState::Running);
        assert_eq!(record.name, "demo");
        assert_eq!(record.manifest_version.as_deref(), Some("1.0.0"));
        assert!(h.accounts.exists(&record.config.user));
    }

    #[tokio::test]
    async fn missing_command_is_rejected_before_any_mutation() {
        let h = Harness::new().await;
        let source = h.local_bundle("demo", "metadata:\n  name: demo\n");

        let err = h.context.pipeline.install(request(&source)).await.expect_err("invalid");
        assert_eq!(err.kind(), "ValidationError");
        assert!(h.context.registry.list().is_empty());
        assert!(h.supervisor.calls().is_empty());
        assert!(h.install_dirs().is_empty());
    }

    #[tokio::test]
    async fn network_failure_exhausts_retries_and_leaves_nothing() {
        let h = Harness::with_fetcher(FakeFetcher::failing()).await;

        let err = h
            .context
            .pipeline
            .install(request("github://org/repo@v1.0.0"))
            .await
            .expect_err("network");
        assert_eq!(err.kind(), "SourceError");
        assert!(matches!(
            err,
            PandemicError::Source(crate::error::SourceError::Network { attempts: 3, .. })
        ));
        assert_eq!(h.fetcher.attempts(), 3);
        assert!(h.context.registry.list().is_empty());
        assert!(h.install_dirs().is_empty());
        assert!(h.staging_is_empty());
    }

    #[tokio::test]
    async fn github_archive_installs() {
        let h = Harness::new().await;
        h.fetcher.serve(
            "https://github.test/org/repo/archive/v1.0.0.tar.gz",
            fixtures::tar_gz(&[
                ("repo-1.0.0/infection.yaml", DEMO_MANIFEST),
                ("repo-1.0.0/run.sh", "#!/bin/sh\nsleep 1000\n"),
            ]),
        );

        let outcome = h
            .context
            .pipeline
            .install(request("github://org/repo@v1.0.0"))
            .await
            .expect("install");
        assert_eq!(outcome.state, InfectionState::Running);
        assert!(outcome.installation_path.join("run.sh").is_file());
        assert!(h.staging_is_empty());
    }

    #[tokio::test]
    async fn forbidden_source_is_rejected_before_fetch() {
        let h = Harness::new().await;
        h.context
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .allowed_sources = vec!["github://trusted/".to_string()];

        let err = h
            .context
            .pipeline
            .install(request("github://org/repo@v1.0.0"))
            .await
            .expect_err("forbidden");
        assert!(matches!(
            err,
            PandemicError::Source(crate::error::SourceError::Forbidden(_))
        ));
        assert_eq!(h.fetcher.attempts(), 0);
    }

    #[tokio::test]
    async fn crashed_start_rolls_back_everything() {
        let h = Harness::new().await;
        let source = h.local_bundle("demo", DEMO_MANIFEST);
        h.supervisor.set_start_behavior(StartBehavior::Crash);

        let err = h.context.pipeline.install(request(&source)).await.expect_err("crash");
        assert_eq!(err.kind(), "SupervisorError");
        assert!(h.context.registry.list().is_empty());
        assert!(h.install_dirs().is_empty());
        assert_eq!(h.supervisor.unit_count(), 0);
        assert!(h.accounts.created().is_empty());
    }

    #[tokio::test]
    async fn keep_files_survives_rollback() {
        let h = Harness::new().await;
        let source = h.local_bundle("demo", DEMO_MANIFEST);
        h.supervisor.set_start_behavior(StartBehavior::Crash);
        let mut req = request(&source);
        req.keep_files = true;

        h.context.pipeline.install(req).await.expect_err("crash");
        assert!(h.context.registry.list().is_empty());
        assert_eq!(h.install_dirs().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_name_conflicts_unless_forced() {
        let h = Harness::new().await;
        let source = h.local_bundle("demo", DEMO_MANIFEST);
        let first = h.context.pipeline.install(request(&source)).await.expect("install");

        let err = h.context.pipeline.install(request(&source)).await.expect_err("dup");
        assert_eq!(err.kind(), "ConflictError");

        let mut forced = request(&source);
        forced.force = true;
        let second = h.context.pipeline.install(forced).await.expect("forced");
        assert_ne!(first.infection_id, second.infection_id);
        assert!(h.context.registry.get(&first.infection_id).is_err());
        assert_eq!(h.context.registry.list().len(), 1);
    }

    #[tokio::test]
    async fn no_auto_start_ends_installed() {
        let h = Harness::new().await;
        let source = h.local_bundle("demo", DEMO_MANIFEST);
        let mut req = request(&source);
        req.auto_start = false;

        let outcome = h.context.pipeline.install(req).await.expect("install");
        assert_eq!(outcome.state, InfectionState::Installed);
        assert_eq!(h.supervisor.count("start "), 0);
    }

    #[tokio::test]
    async fn remove_cleans_files_units_and_record() {
        let h = Harness::new().await;
        let source = h.local_bundle("demo", DEMO_MANIFEST);
        let outcome = h.context.pipeline.install(request(&source)).await.expect("install");
        let id = outcome.infection_id.clone();

        let removed = h.context.pipeline.remove(&id, false, false).await.expect("remove");
        assert_eq!(removed.removed_services, vec![outcome.service_name.clone()]);
        assert_eq!(
            removed.removed_files,
            vec![outcome.installation_path.display().to_string()]
        );
        assert!(!outcome.installation_path.exists());
        assert_eq!(h.supervisor.unit_count(), 0);
        let err = h.context.registry.get(&id).expect_err("gone");
        assert_eq!(err.kind(), "NotFoundError");
        // stopped before the unit was removed
        let calls = h.supervisor.calls();
        let stop = calls.iter().position(|c| c.starts_with("stop ")).expect("stop");
        let remove = calls.iter().position(|c| c.starts_with("remove ")).expect("remove");
        assert!(stop < remove);
    }

    #[tokio::test]
    async fn remove_with_keep_files_leaves_install_path() {
        let h = Harness::new().await;
        let source = h.local_bundle("demo", DEMO_MANIFEST);
        let outcome = h.context.pipeline.install(request(&source)).await.expect("install");

        let removed = h
            .context
            .pipeline
            .remove(&outcome.infection_id, true, true)
            .await
            .expect("remove");
        assert!(removed.removed_files.is_empty());
        assert!(outcome.installation_path.exists());
        assert!(h.context.registry.list().is_empty());
    }

    #[tokio::test]
    async fn remove_unknown_is_not_found() {
        let h = Harness::new().await;
        let id = InfectionId::parse("infection-deadbeef").expect("id");
        let err = h.context.pipeline.remove(&id, false, false).await.expect_err("missing");
        assert_eq!(err.kind(), "NotFoundError");
    }

    #[tokio::test]
    async fn remove_cancels_in_flight_install() {
        let h = Harness::new().await;
        let source = h.local_bundle("demo", DEMO_MANIFEST);
        h.supervisor.set_start_behavior(StartBehavior::Hang);
        let ctx = Arc::clone(&h.context);

        let install = tokio::spawn(async move { ctx.pipeline.install(request(&source)).await });
        let id = loop {
            if let Some(record) = h.context.registry.list().into_iter().next() {
                break record.id;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };

        let removed = h.context.pipeline.remove(&id, false, false).await;
        let installed = install.await.expect("join");
        let err = installed.expect_err("install must not succeed");
        assert!(
            matches!(err.kind(), "CancelledError" | "SupervisorError"),
            "{err}"
        );
        assert!(removed.is_ok() || h.context.registry.get(&id).is_err());
        assert!(h.context.registry.list().is_empty());
        assert!(h.install_dirs().is_empty());
    }

    #[tokio::test]
    async fn update_swaps_tree_and_restarts() {
        let h = Harness::new().await;
        let source = h.local_bundle("demo", DEMO_MANIFEST);
        let outcome = h.context.pipeline.install(request(&source)).await.expect("install");

        let v2 = DEMO_MANIFEST.replace("1.0.0", "2.0.0");
        let source_v2 = h.local_bundle("demo-v2", &v2);
        let updated = h
            .context
            .pipeline
            .update(
                &outcome.infection_id,
                UpdateRequest {
                    source: Some(source_v2),
                    ..UpdateRequest::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(updated.state, InfectionState::Running);
        let record = h.context.registry.get(&outcome.infection_id).expect("record");
        assert_eq!(record.manifest_version.as_deref(), Some("2.0.0"));
        let text = std::fs::read_to_string(outcome.installation_path.join("infection.yaml"))
            .expect("manifest");
        assert!(text.contains("2.0.0"));
        assert!(!sibling(&outcome.installation_path, "old").exists());
        assert!(!sibling(&outcome.installation_path, "new").exists());
    }

    #[tokio::test]
    async fn failed_update_leaves_infection_untouched() {
        let h = Harness::new().await;
        let source = h.local_bundle("demo", DEMO_MANIFEST);
        let outcome = h.context.pipeline.install(request(&source)).await.expect("install");

        let broken = h.local_bundle("broken", "metadata:\n  name: demo\n");
        let err = h
            .context
            .pipeline
            .update(
                &outcome.infection_id,
                UpdateRequest {
                    source: Some(broken),
                    ..UpdateRequest::default()
                },
            )
            .await
            .expect_err("invalid");
        assert_eq!(err.kind(), "ValidationError");
        let record = h.context.registry.get(&outcome.infection_id).expect("record");
        assert_eq!(record.state, InfectionState::Running);
        assert_eq!(record.manifest_version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn rollback_keeps_files_while_the_process_lives() {
        let h = Harness::new().await;
        let source = h.local_bundle("demo", DEMO_MANIFEST);
        h.supervisor.set_start_behavior(StartBehavior::Hang);
        h.supervisor.set_stuck(true);

        let err = h.context.pipeline.install(request(&source)).await.expect_err("timeout");
        assert_eq!(err.kind(), "SupervisorError");
        assert!(h.context.registry.list().is_empty());
        assert_eq!(h.supervisor.unit_count(), 0);
        assert_eq!(h.install_dirs().len(), 1);
        assert_eq!(h.accounts.created().len(), 1);
    }

    #[tokio::test]
    async fn interrupted_install_and_remove_are_settled() {
        let h = Harness::new().await;
        let installing = h.seed("half-installed", InfectionState::Installing).await;
        let removing = h.seed("half-removed", InfectionState::Removing).await;
        let running = h.seed("web", InfectionState::Running).await;

        assert_eq!(h.context.pipeline.recover_interrupted().await, 2);
        assert!(h.context.registry.get(&installing).is_err());
        assert!(h.context.registry.get(&removing).is_err());
        assert_eq!(h.install_dirs().len(), 1);
        assert_eq!(h.supervisor.unit_count(), 1);

        assert_eq!(h.context.lifecycle.reconcile_all(&h.context.locks).await, 1);
        let record = h.context.registry.get(&running).expect("record");
        assert_eq!(record.state, InfectionState::Running);
        assert_eq!(h.context.pipeline.recover_interrupted().await, 0);
    }

    #[tokio::test]
    async fn failed_swap_restarts_the_previous_version() {
        let h = Harness::new().await;
        let source = h.local_bundle("demo", DEMO_MANIFEST);
        let outcome = h.context.pipeline.install(request(&source)).await.expect("install");
        // a plain file where the previous tree should be parked
        std::fs::write(sibling(&outcome.installation_path, "old"), "blocker").expect("blocker");

        let v2 = DEMO_MANIFEST.replace("1.0.0", "2.0.0");
        let source_v2 = h.local_bundle("demo-v2", &v2);
        h.context
            .pipeline
            .update(
                &outcome.infection_id,
                UpdateRequest {
                    source: Some(source_v2),
                    ..UpdateRequest::default()
                },
            )
            .await
            .expect_err("swap must fail");

        let record = h.context.registry.get(&outcome.infection_id).expect("record");
        assert_eq!(record.state, InfectionState::Running);
        assert_eq!(record.manifest_version.as_deref(), Some("1.0.0"));
        assert_eq!(h.supervisor.count("start "), 2);
        assert!(!sibling(&outcome.installation_path, "new").exists());
        let text = std::fs::read_to_string(outcome.installation_path.join("infection.yaml"))
            .expect("manifest");
        assert!(text.contains("1.0.0"));
    }

    #[tokio::test]
    async fn configure_merges_environment_and_rerenders() {
        let h = Harness::new().await;
        let source = h.local_bundle("demo", DEMO_MANIFEST);
        let outcome = h.context.pipeline.install(request(&source)).await.expect("install");

        let mut overrides = ConfigOverrides::default();
        overrides
            .environment
            .insert("LOG_LEVEL".to_string(), "debug".to_string());
        let record = h
            .context
            .pipeline
            .configure(&outcome.infection_id, overrides)
            .await
            .expect("configure");
        assert_eq!(record.config.environment.get("LOG_LEVEL").map(String::as_str), Some("debug"));
        assert_eq!(record.config.environment.get("MODE").map(String::as_str), Some("edge"));
        assert_eq!(h.supervisor.count("restart "), 1);
    }
}
