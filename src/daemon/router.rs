//! Request dispatch.
//!
//! Validates the command name, decodes its payload, takes the per-id lock
//! for operations on one infection and turns every outcome into exactly one
//! correlated response.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::{Arc, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use super::protocol::{Request, Response};
use super::Context;
use crate::config::{self, RuntimeSettingsPatch};
use crate::error::{PandemicError, Result};
use crate::events::Event;
use crate::infection::{InfectionId, InfectionState};
use crate::manifest::ConfigOverrides;
use crate::pipeline::{InstallRequest, UpdateRequest};

const DEFAULT_LOG_LINES: usize = 100;
const MAX_LOG_LINES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Install,
    Remove,
    Start,
    Stop,
    Restart,
    Status,
    List,
    Logs,
    GetConfig,
    SetConfig,
    Health,
    Update,
    Metrics,
    SubscribeEvents,
    UnsubscribeEvents,
}

impl Command {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "install" => Self::Install,
            "remove" => Self::Remove,
            "start" => Self::Start,
            "stop" => Self::Stop,
            "restart" => Self::Restart,
            "status" => Self::Status,
            "list" => Self::List,
            "logs" => Self::Logs,
            "getConfig" => Self::GetConfig,
            "setConfig" => Self::SetConfig,
            "health" => Self::Health,
            "update" => Self::Update,
            "metrics" => Self::Metrics,
            "subscribeEvents" => Self::SubscribeEvents,
            "unsubscribeEvents" => Self::UnsubscribeEvents,
            _ => return None,
        })
    }
}

/// Which events a subscribed connection wants.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    #[serde(default)]
    pub infection_id: Option<String>,
    /// Exact types or `prefix.*` patterns; empty matches everything.
    #[serde(default)]
    pub event_types: Vec<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(id) = &self.infection_id {
            if event.infection_id() != Some(id.as_str()) {
                return false;
            }
        }
        self.event_types.is_empty()
            || self.event_types.iter().any(|pattern| match pattern.strip_suffix('*') {
                Some(prefix) => event.event_type.starts_with(prefix),
                None => event.event_type == *pattern,
            })
    }
}

/// What the connection should do with the outcome of a request.
pub enum Reply {
    Response(Response),
    Subscribe {
        response: Response,
        receiver: broadcast::Receiver<Event>,
        filter: EventFilter,
    },
    Unsubscribe(Response),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdPayload {
    infection_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopPayload {
    infection_id: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemovePayload {
    infection_id: String,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    cleanup: Option<bool>,
    #[serde(default)]
    keep_files: Option<bool>,
}

impl RemovePayload {
    fn keep_files(&self) -> bool {
        self.keep_files
            .unwrap_or_else(|| !self.cleanup.unwrap_or(true))
    }
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptionalIdPayload {
    #[serde(default)]
    infection_id: Option<String>,
}

#[derive(Default, Deserialize)]
struct ListFilter {
    #[serde(default)]
    state: Option<String>,
}

#[derive(Default, Deserialize)]
struct ListPayload {
    #[serde(default)]
    filter: Option<ListFilter>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsPayload {
    infection_id: String,
    #[serde(default)]
    lines: Option<usize>,
    #[serde(default)]
    since: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePayload {
    infection_id: String,
    #[serde(flatten)]
    request: UpdateRequest,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetConfigPayload {
    #[serde(default)]
    infection_id: Option<String>,
    #[serde(default)]
    config: Value,
}

pub struct Router {
    ctx: Arc<Context>,
}

impl Router {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Decode and handle one raw frame body.
    pub async fn handle_frame(&self, body: &[u8]) -> Reply {
        match serde_json::from_slice::<Request>(body) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                debug!(error = %e, "Undecodable request");
                Reply::Response(Response::failure(
                    recover_id(body),
                    None,
                    "ValidationError",
                    format!("malformed request: {e}"),
                ))
            }
        }
    }

    pub async fn handle(&self, request: Request) -> Reply {
        let Request {
            id,
            command: name,
            payload,
            ..
        } = request;

        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return Reply::Response(Response::failure(id, None, "ValidationError", "missing command"));
        };
        let Some(command) = Command::parse(&name) else {
            warn!(command = %name, "Unknown command");
            return Reply::Response(Response::failure(
                id,
                Some(name.clone()),
                "ValidationError",
                format!("unknown command '{name}'"),
            ));
        };
        trace!(request_id = %id, command = %name, "Dispatching");

        match command {
            Command::SubscribeEvents => self.subscribe(id, name, payload),
            Command::UnsubscribeEvents => {
                Reply::Unsubscribe(Response::success(id, Some(name), json!({ "subscribed": false })))
            }
            _ => {
                let response = match self.dispatch(command, payload).await {
                    Ok(payload) => Response::success(id, Some(name), payload),
                    Err(e) => {
                        debug!(command = %name, kind = e.kind(), error = %e, "Request failed");
                        Response::from_error(id, Some(name), &e)
                    }
                };
                Reply::Response(response)
            }
        }
    }

    fn subscribe(&self, id: String, name: String, payload: Value) -> Reply {
        let filter = match decode::<EventFilter>(&name, payload) {
            Ok(filter) => filter,
            Err(e) => return Reply::Response(Response::from_error(id, Some(name), &e)),
        };
        match self.ctx.events.subscribe() {
            Some(receiver) => {
                info!(infection_id = ?filter.infection_id, "Event subscription opened");
                Reply::Subscribe {
                    response: Response::success(id, Some(name), json!({ "subscribed": true })),
                    receiver,
                    filter,
                }
            }
            None => Reply::Response(Response::failure(
                id,
                Some(name),
                "ValidationError",
                "event streaming is disabled",
            )),
        }
    }

    async fn dispatch(&self, command: Command, payload: Value) -> Result<Value> {
        let ctx = &self.ctx;
        match command {
            Command::Install => {
                let request: InstallRequest = decode("install", payload)?;
                let outcome = ctx.pipeline.install(request).await?;
                Ok(serde_json::to_value(outcome)?)
            }
            Command::Remove => {
                let p: RemovePayload = decode("remove", payload)?;
                let id = InfectionId::parse(&p.infection_id)?;
                let outcome = ctx.pipeline.remove(&id, p.force, p.keep_files()).await?;
                Ok(serde_json::to_value(outcome)?)
            }
            Command::Start => {
                let p: IdPayload = decode("start", payload)?;
                let id = InfectionId::parse(&p.infection_id)?;
                ctx.registry.get(&id)?;
                let _guard = ctx.locks.lock(&id).await;
                let record = ctx.lifecycle.start(&id).await?;
                Ok(state_payload(&record.id, record.state))
            }
            Command::Stop => {
                let p: StopPayload = decode("stop", payload)?;
                let id = InfectionId::parse(&p.infection_id)?;
                ctx.registry.get(&id)?;
                let _guard = ctx.locks.lock(&id).await;
                let record = ctx.lifecycle.stop(&id, p.force).await?;
                Ok(state_payload(&record.id, record.state))
            }
            Command::Restart => {
                let p: IdPayload = decode("restart", payload)?;
                let id = InfectionId::parse(&p.infection_id)?;
                ctx.registry.get(&id)?;
                let _guard = ctx.locks.lock(&id).await;
                let record = ctx.lifecycle.restart(&id).await?;
                Ok(state_payload(&record.id, record.state))
            }
            Command::Status => self.status(decode("status", payload)?).await,
            Command::List => self.list(decode("list", payload)?),
            Command::Logs => self.logs(decode("logs", payload)?).await,
            Command::GetConfig => self.get_config(decode("getConfig", payload)?),
            Command::SetConfig => self.set_config(decode("setConfig", payload)?).await,
            Command::Health => self.health(decode("health", payload)?),
            Command::Update => {
                let p: UpdatePayload = decode("update", payload)?;
                let id = InfectionId::parse(&p.infection_id)?;
                let outcome = ctx.pipeline.update(&id, p.request).await?;
                Ok(serde_json::to_value(outcome)?)
            }
            Command::Metrics => self.metrics(decode("metrics", payload)?).await,
            Command::SubscribeEvents | Command::UnsubscribeEvents => Err(PandemicError::validation(
                "subscription commands are handled by the connection",
            )),
        }
    }

    async fn status(&self, p: OptionalIdPayload) -> Result<Value> {
        let ctx = &self.ctx;
        let Some(raw) = p.infection_id else {
            return Ok(json!({
                "daemon": "running",
                "version": env!("CARGO_PKG_VERSION"),
                "infections": ctx.registry.list().len(),
                "uptime": ctx.uptime_secs(),
            }));
        };

        let id = InfectionId::parse(&raw)?;
        ctx.registry.get(&id)?;
        let record = match ctx.locks.try_lock(&id) {
            Some(_guard) => ctx.lifecycle.reconcile(&id).await?,
            // An operation is in flight; report what we have.
            None => ctx.registry.get(&id)?,
        };
        let supervisor_status = match ctx.lifecycle.supervisor().status(&record.service_name).await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(infection_id = %id, error = %e, "Status query failed");
                None
            }
        };
        let mut body = serde_json::to_value(&record)?;
        if let Value::Object(fields) = &mut body {
            fields.insert(
                "supervisorStatus".to_string(),
                serde_json::to_value(supervisor_status)?,
            );
        }
        Ok(body)
    }

    fn list(&self, p: ListPayload) -> Result<Value> {
        let wanted = match p.filter.and_then(|f| f.state) {
            Some(raw) => Some(InfectionState::parse(&raw).ok_or_else(|| {
                PandemicError::validation(format!("unknown state filter '{raw}'"))
            })?),
            None => None,
        };
        let infections: Vec<_> = self
            .ctx
            .registry
            .list()
            .into_iter()
            .filter(|r| wanted.is_none_or(|state| r.state == state))
            .collect();
        let running = infections
            .iter()
            .filter(|r| r.state == InfectionState::Running)
            .count();
        Ok(json!({
            "totalCount": infections.len(),
            "runningCount": running,
            "infections": infections,
        }))
    }

    async fn logs(&self, p: LogsPayload) -> Result<Value> {
        let id = InfectionId::parse(&p.infection_id)?;
        let lines = p.lines.unwrap_or(DEFAULT_LOG_LINES);
        if lines == 0 || lines > MAX_LOG_LINES {
            return Err(PandemicError::validation(format!(
                "lines must be between 1 and {MAX_LOG_LINES}"
            )));
        }
        let record = self.ctx.registry.get(&id)?;
        let logs = self
            .ctx
            .lifecycle
            .supervisor()
            .logs(&record.service_name, lines, p.since.as_deref())
            .await?;
        Ok(json!({
            "infectionId": id,
            "totalLines": logs.len(),
            "logs": logs,
        }))
    }

    async fn metrics(&self, p: IdPayload) -> Result<Value> {
        let id = InfectionId::parse(&p.infection_id)?;
        let record = self.ctx.registry.get(&id)?;
        let status = self
            .ctx
            .lifecycle
            .supervisor()
            .status(&record.service_name)
            .await?;
        Ok(json!({
            "infectionId": id,
            "metrics": {
                "memoryUsage": status.memory_usage,
                "cpuUsage": status.cpu_usage,
                "uptime": status.uptime,
                "restartCount": status.restart_count,
                "pid": status.pid,
            },
        }))
    }

    fn health(&self, p: OptionalIdPayload) -> Result<Value> {
        let ctx = &self.ctx;
        if let Some(raw) = p.infection_id {
            let id = InfectionId::parse(&raw)?;
            let record = ctx.registry.get(&id)?;
            let healthy = record.state == InfectionState::Running;
            return Ok(json!({
                "infectionId": id,
                "status": if healthy { "healthy" } else { "unhealthy" },
                "state": record.state,
                "failureCount": record.failure_count,
                "lastError": record.last_error,
            }));
        }

        let records = ctx.registry.list();
        let count = |state: InfectionState| records.iter().filter(|r| r.state == state).count();
        Ok(json!({
            "status": "healthy",
            "daemon": true,
            "uptime": ctx.uptime_secs(),
            "infections": {
                "total": records.len(),
                "running": count(InfectionState::Running),
                "failed": count(InfectionState::Failed),
            },
            "events": ctx.events.enabled(),
        }))
    }

    fn get_config(&self, p: OptionalIdPayload) -> Result<Value> {
        match p.infection_id {
            Some(raw) => {
                let id = InfectionId::parse(&raw)?;
                let record = self.ctx.registry.get(&id)?;
                Ok(json!({ "infectionId": id, "config": record.config }))
            }
            None => Ok(json!({ "config": config::snapshot(&self.ctx.settings) })),
        }
    }

    async fn set_config(&self, p: SetConfigPayload) -> Result<Value> {
        let body = if p.config.is_null() {
            Value::Object(Map::new())
        } else {
            p.config
        };

        if let Some(raw) = p.infection_id {
            let id = InfectionId::parse(&raw)?;
            let overrides: ConfigOverrides = decode("setConfig", body)?;
            let record = self.ctx.pipeline.configure(&id, overrides).await?;
            return Ok(json!({ "infectionId": id, "config": record.config }));
        }

        let patch: RuntimeSettingsPatch = decode("setConfig", body)?;
        let updated = {
            let mut settings = self
                .ctx
                .settings
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            settings.apply(patch).map_err(|errors| {
                PandemicError::validation(format!("invalid config: {}", errors.join("; ")))
            })?;
            settings.clone()
        };
        info!(
            restart_threshold = updated.restart_threshold,
            allowed_sources = updated.allowed_sources.len(),
            "Runtime settings updated"
        );
        Ok(json!({ "config": updated }))
    }
}

fn state_payload(id: &InfectionId, state: InfectionState) -> Value {
    json!({ "infectionId": id, "state": state })
}

/// Payload decoding; a missing payload counts as `{}`.
fn decode<T: DeserializeOwned>(command: &str, payload: Value) -> Result<T> {
    let payload = if payload.is_null() {
        Value::Object(Map::new())
    } else {
        payload
    };
    serde_json::from_value(payload)
        .map_err(|e| PandemicError::validation(format!("invalid payload for {command}: {e}")))
}

/// Best-effort `id` from a request that failed to decode.
fn recover_id(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}
