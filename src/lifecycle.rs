//! Lifecycle state machine and reconciliation.
//!
//! Every state change goes through [`Lifecycle`], which checks the edge
//! against [`InfectionState::can_transition_to`] before persisting it.
//! Observed supervisor state is folded in by `reconcile`, which only ever
//! follows edges of the graph and never pulls a record out of `failed`.
//!
//! Callers are expected to hold the per-id lock from [`LockMap`].

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{self, SharedSettings};
use crate::error::{PandemicError, Result, SupervisorError};
use crate::events::{Event, EventKind, EventSink};
use crate::infection::{Infection, InfectionId, InfectionState};
use crate::locks::LockMap;
use crate::registry::InfectionRegistry;
use crate::supervisor::{Supervisor, SupervisorStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Goal {
    Running,
    Stopped,
}

impl Goal {
    fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

enum PollOutcome {
    Reached(SupervisorStatus),
    Crashed,
    TimedOut,
}

pub struct Lifecycle {
    registry: Arc<InfectionRegistry>,
    supervisor: Arc<dyn Supervisor>,
    events: Arc<dyn EventSink>,
    settings: SharedSettings,
    poll_interval: Duration,
    healthy_uptime_secs: u64,
}

impl Lifecycle {
    pub fn new(
        registry: Arc<InfectionRegistry>,
        supervisor: Arc<dyn Supervisor>,
        events: Arc<dyn EventSink>,
        settings: SharedSettings,
        poll_interval: Duration,
        healthy_uptime_secs: u64,
    ) -> Self {
        Self {
            registry,
            supervisor,
            events,
            settings,
            poll_interval,
            healthy_uptime_secs,
        }
    }

    pub fn registry(&self) -> &Arc<InfectionRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<dyn Supervisor> {
        &self.supervisor
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Move `id` to `next`. Staying in the current state is a no-op; any
    /// edge outside the graph is a `ConflictError`.
    pub async fn transition(&self, id: &InfectionId, next: InfectionState) -> Result<Infection> {
        let current = self.registry.get(id)?;
        if current.state == next {
            return Ok(current);
        }
        let record = self
            .registry
            .update(id, |record| {
                if !record.state.can_transition_to(next) {
                    return Err(illegal(id, record.state, next));
                }
                record.state = next;
                Ok(())
            })
            .await?;
        info!(infection_id = %id, from = %current.state, to = %next, "State transition");
        Ok(record)
    }

    /// Start the infection and wait until the supervisor reports it
    /// running. Already running is a no-op without touching the supervisor.
    pub async fn start(&self, id: &InfectionId) -> Result<Infection> {
        let record = self.registry.get(id)?;
        match record.state {
            InfectionState::Running => {
                debug!(infection_id = %id, "Already running");
                return Ok(record);
            }
            InfectionState::Installing | InfectionState::Removing | InfectionState::Removed => {
                return Err(PandemicError::conflict(format!(
                    "cannot start {id} while it is {}",
                    record.state
                )));
            }
            _ => {}
        }

        self.transition(id, InfectionState::Starting).await?;
        let service = record.service_name.as_str();
        if let Err(e) = self.supervisor.start(service).await {
            return Err(self.mark_failed(id, e).await);
        }

        let timeout = config::snapshot(&self.settings).start_timeout();
        match self.poll_until(service, Goal::Running, timeout).await {
            PollOutcome::Reached(status) => {
                let record = self
                    .registry
                    .update(id, |record| {
                        if !record.state.can_transition_to(InfectionState::Running) {
                            return Err(illegal(id, record.state, InfectionState::Running));
                        }
                        record.state = InfectionState::Running;
                        record.failure_count = 0;
                        record.restart_baseline = status.restart_count;
                        record.last_error = None;
                        Ok(())
                    })
                    .await?;
                info!(infection_id = %id, pid = ?status.pid, "Infection running");
                self.events.publish(Event::infection(
                    EventKind::Started,
                    id,
                    json!({ "serviceName": service, "pid": status.pid }),
                ));
                Ok(record)
            }
            PollOutcome::Crashed => {
                let err = SupervisorError::Crashed {
                    service: service.to_string(),
                    action: "starting".to_string(),
                };
                Err(self.mark_failed(id, err.into()).await)
            }
            PollOutcome::TimedOut => {
                warn!(infection_id = %id, "Start timed out, leaving record in starting");
                Err(SupervisorError::Timeout {
                    service: service.to_string(),
                    target: Goal::Running.as_str().to_string(),
                    waited: timeout,
                }
                .into())
            }
        }
    }

    /// Stop the infection and wait for the unit to go inactive.
    pub async fn stop(&self, id: &InfectionId, force: bool) -> Result<Infection> {
        let record = self.registry.get(id)?;
        let service = record.service_name.as_str();
        match record.state {
            InfectionState::Stopped | InfectionState::Installed => {
                debug!(infection_id = %id, state = %record.state, "Already stopped");
                return Ok(record);
            }
            InfectionState::Installing | InfectionState::Removing | InfectionState::Removed => {
                return Err(PandemicError::conflict(format!(
                    "cannot stop {id} while it is {}",
                    record.state
                )));
            }
            InfectionState::Failed => {
                // Keep systemd from reviving a failed unit behind our back.
                self.supervisor.stop(service, force).await?;
                let record = self.transition(id, InfectionState::Stopped).await?;
                self.publish_stopped(id, service);
                return Ok(record);
            }
            _ => {}
        }

        self.transition(id, InfectionState::Stopping).await?;
        if let Err(e) = self.supervisor.stop(service, force).await {
            return Err(self.mark_failed(id, e).await);
        }

        let timeout = config::snapshot(&self.settings).stop_timeout();
        match self.poll_until(service, Goal::Stopped, timeout).await {
            PollOutcome::Reached(_) | PollOutcome::Crashed => {
                let record = self.transition(id, InfectionState::Stopped).await?;
                self.publish_stopped(id, service);
                Ok(record)
            }
            PollOutcome::TimedOut => Err(SupervisorError::Timeout {
                service: service.to_string(),
                target: Goal::Stopped.as_str().to_string(),
                waited: timeout,
            }
            .into()),
        }
    }

    /// Stop (when live) followed by start.
    pub async fn restart(&self, id: &InfectionId) -> Result<Infection> {
        let record = self.registry.get(id)?;
        if matches!(
            record.state,
            InfectionState::Starting | InfectionState::Running | InfectionState::Stopping
        ) {
            self.stop(id, false).await?;
        }
        let record = self.start(id).await?;
        self.events.publish(Event::infection(
            EventKind::Restarted,
            id,
            json!({ "serviceName": record.service_name }),
        ));
        Ok(record)
    }

    /// Record `err` on the infection and move it to `failed` when the graph
    /// allows. Returns `err` for propagation.
    pub async fn mark_failed(&self, id: &InfectionId, err: PandemicError) -> PandemicError {
        let message = err.to_string();
        let updated = self
            .registry
            .update(id, |record| {
                if record.state.can_transition_to(InfectionState::Failed) {
                    record.state = InfectionState::Failed;
                }
                record.last_error = Some(message.clone());
                Ok(())
            })
            .await;
        match updated {
            Ok(record) if record.state == InfectionState::Failed => {
                warn!(infection_id = %id, error = %message, "Infection failed");
                self.events.publish(Event::infection(
                    EventKind::Failed,
                    id,
                    json!({ "error": message }),
                ));
            }
            Ok(_) => {}
            Err(e) => warn!(infection_id = %id, error = %e, "Could not record failure"),
        }
        err
    }

    /// Fold the supervisor's view of one infection into its record.
    pub async fn reconcile(&self, id: &InfectionId) -> Result<Infection> {
        let record = self.registry.get(id)?;
        if matches!(
            record.state,
            InfectionState::Installing | InfectionState::Removing | InfectionState::Removed
        ) {
            return Ok(record);
        }
        let status = self.supervisor.status(&record.service_name).await?;
        self.apply_observation(record, &status).await
    }

    /// Reconcile every idle infection. Ids with an operation in flight are
    /// skipped until the next pass. Returns how many were reconciled.
    pub async fn reconcile_all(&self, locks: &LockMap) -> usize {
        let mut reconciled = 0;
        for record in self.registry.list() {
            let Some(_guard) = locks.try_lock(&record.id) else {
                debug!(infection_id = %record.id, "Busy, skipping reconcile");
                continue;
            };
            match self.reconcile(&record.id).await {
                Ok(_) => reconciled += 1,
                Err(e) => warn!(infection_id = %record.id, error = %e, "Reconcile failed"),
            }
        }
        reconciled
    }

    async fn apply_observation(&self, record: Infection, status: &SupervisorStatus) -> Result<Infection> {
        let id = record.id.clone();
        let threshold = config::snapshot(&self.settings).restart_threshold;

        let mut baseline = record.restart_baseline;
        if status.restart_count < baseline {
            // systemd's counter was reset (reset-failed, reload).
            baseline = status.restart_count;
        }
        let healthy = status.is_active()
            && status
                .uptime
                .is_some_and(|uptime| uptime >= self.healthy_uptime_secs);
        if healthy {
            baseline = status.restart_count;
        }
        let failures = status.restart_count - baseline;

        if record.state == InfectionState::Failed {
            if record.failure_count == failures && record.restart_baseline == baseline {
                return Ok(record);
            }
            return self
                .registry
                .update(&id, |r| {
                    r.failure_count = failures;
                    r.restart_baseline = baseline;
                    Ok(())
                })
                .await;
        }

        if failures > threshold {
            return self.trip_breaker(record, failures, baseline, threshold).await;
        }

        let path = transition_path(record.state, status);
        if path.is_empty() && record.failure_count == failures && record.restart_baseline == baseline {
            return Ok(record);
        }

        let reported_failure = path.last() == Some(&InfectionState::Failed);
        let service = record.service_name.clone();
        let updated = self
            .registry
            .update(&id, |r| {
                for next in &path {
                    if !r.state.can_transition_to(*next) {
                        return Err(illegal(&id, r.state, *next));
                    }
                    r.state = *next;
                }
                r.failure_count = failures;
                r.restart_baseline = baseline;
                if reported_failure {
                    r.last_error = Some(format!(
                        "{service} reported failed ({})",
                        status.sub_state
                    ));
                }
                Ok(())
            })
            .await?;

        if let Some(last) = path.last() {
            info!(
                infection_id = %id,
                from = %record.state,
                to = %last,
                active_state = %status.active_state,
                "Reconciled with supervisor"
            );
            match last {
                InfectionState::Running => self.events.publish(Event::infection(
                    EventKind::Started,
                    &id,
                    json!({ "serviceName": service, "pid": status.pid }),
                )),
                InfectionState::Stopped => self.publish_stopped(&id, &service),
                InfectionState::Failed => self.events.publish(Event::infection(
                    EventKind::Failed,
                    &id,
                    json!({ "error": updated.last_error }),
                )),
                _ => {}
            }
        }
        Ok(updated)
    }

    /// Too many supervisor restarts: fail the infection and stop the unit
    /// so `Restart=always` no longer revives it.
    async fn trip_breaker(
        &self,
        record: Infection,
        failures: u32,
        baseline: u32,
        threshold: u32,
    ) -> Result<Infection> {
        let id = record.id.clone();
        let reason = format!(
            "restarted {failures} times, exceeding the threshold of {threshold}"
        );
        warn!(infection_id = %id, failures, threshold, "Restart threshold exceeded");

        if let Err(e) = self.supervisor.stop(&record.service_name, false).await {
            warn!(infection_id = %id, error = %e, "Could not stop unit after tripping breaker");
        }

        let updated = self
            .registry
            .update(&id, |r| {
                if !r.state.can_transition_to(InfectionState::Failed) {
                    return Err(illegal(&id, r.state, InfectionState::Failed));
                }
                r.state = InfectionState::Failed;
                r.failure_count = failures;
                r.restart_baseline = baseline;
                r.last_error = Some(reason.clone());
                Ok(())
            })
            .await?;
        self.events.publish(Event::infection(
            EventKind::Failed,
            &id,
            json!({ "error": reason, "failureCount": failures }),
        ));
        Ok(updated)
    }

    async fn poll_until(&self, service: &str, goal: Goal, timeout: Duration) -> PollOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            match self.supervisor.status(service).await {
                Ok(status) => {
                    let observed = status.observed_state();
                    match (goal, observed) {
                        (Goal::Running, Some(InfectionState::Running)) => {
                            return PollOutcome::Reached(status)
                        }
                        (Goal::Running, Some(InfectionState::Failed)) => return PollOutcome::Crashed,
                        (Goal::Stopped, Some(InfectionState::Stopped)) => {
                            return PollOutcome::Reached(status)
                        }
                        (Goal::Stopped, Some(InfectionState::Failed)) if status.pid.is_none() => {
                            return PollOutcome::Crashed
                        }
                        _ => {}
                    }
                }
                // Status queries are retried until the deadline.
                Err(e) => debug!(service = %service, error = %e, "Status query failed"),
            }
            if Instant::now() >= deadline {
                return PollOutcome::TimedOut;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn publish_stopped(&self, id: &InfectionId, service: &str) {
        self.events.publish(Event::infection(
            EventKind::Stopped,
            id,
            json!({ "serviceName": service }),
        ));
    }
}

fn illegal(id: &InfectionId, from: InfectionState, to: InfectionState) -> PandemicError {
    PandemicError::conflict(format!("illegal transition for {id}: {from} -> {to}"))
}

/// Edges that carry `current` to what the supervisor reports. Empty when
/// nothing should change.
fn transition_path(current: InfectionState, status: &SupervisorStatus) -> Vec<InfectionState> {
    use InfectionState::*;

    let Some(observed) = status.observed_state() else {
        return Vec::new();
    };
    if observed == current {
        return Vec::new();
    }
    // A stopped record whose unit ended `failed` was stopped on request.
    if current == Stopped && observed == Failed && status.pid.is_none() {
        return Vec::new();
    }
    if current.can_transition_to(observed) {
        return vec![observed];
    }
    match observed {
        Running if current.can_transition_to(Starting) => vec![Starting, Running],
        Stopped if current.can_transition_to(Stopping) => vec![Stopping, Stopped],
        _ => Vec::new(),
    }
}
