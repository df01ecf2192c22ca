use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::command::CommandRunner;
use super::units;
use super::{LogEntry, Supervisor, SupervisorStatus};
use crate::error::{Result, SupervisorError};
use crate::infection::{Infection, SERVICE_PREFIX};

const SYSTEMCTL: &str = "systemctl";
const JOURNALCTL: &str = "journalctl";
const SHOW_PROPERTIES: &str = "--property=ActiveState,SubState,MainPID,MemoryCurrent,CPUUsageNSec,ActiveEnterTimestampMonotonic,NRestarts";

/// `Supervisor` backed by systemd.
///
/// Unit files are written only when their content changes, and every write
/// plus the following `daemon-reload` happens under one lock so concurrent
/// installs never race a reload.
pub struct SystemdSupervisor {
    runner: Arc<dyn CommandRunner>,
    unit_dir: PathBuf,
    socket_path: PathBuf,
    unit_lock: Mutex<()>,
}

impl SystemdSupervisor {
    pub fn new(runner: Arc<dyn CommandRunner>, unit_dir: PathBuf, socket_path: PathBuf) -> Self {
        Self {
            runner,
            unit_dir,
            socket_path,
            unit_lock: Mutex::new(()),
        }
    }

    async fn systemctl(&self, args: &[&str]) -> Result<String> {
        let out = self.runner.run(SYSTEMCTL, args).await?;
        Ok(out.check(SYSTEMCTL, args)?.stdout)
    }

    /// Like `systemctl` but failures are only logged.
    async fn systemctl_best_effort(&self, args: &[&str]) {
        if let Err(e) = self.systemctl(args).await {
            debug!(error = %e, "Ignoring systemctl failure");
        }
    }

    async fn other_instances_remain(&self, service: &str) -> io::Result<bool> {
        let own = format!("{service}.d");
        let mut entries = match tokio::fs::read_dir(&self.unit_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name != own && name.starts_with(SERVICE_PREFIX) && name.ends_with(".service.d") {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl Supervisor for SystemdSupervisor {
    async fn create_service(&self, infection: &Infection) -> Result<bool> {
        let service = infection.service_name.as_str();
        units::validate_service_name(service)?;

        let template = units::render_template();
        let dropin = units::render_dropin(infection, &self.socket_path);
        units::validate_unit_content(units::TEMPLATE_NAME, &template)?;
        units::validate_unit_content(service, &dropin)?;

        let _guard = self.unit_lock.lock().await;

        let mut changed = write_if_changed(&units::template_path(&self.unit_dir), &template).await?;
        tokio::fs::create_dir_all(units::dropin_dir(&self.unit_dir, service)).await?;
        changed |= write_if_changed(&units::dropin_path(&self.unit_dir, service), &dropin).await?;

        if changed {
            info!(service = %service, "Unit files changed, reloading systemd");
            self.systemctl(&["daemon-reload"]).await?;
            self.systemctl(&["enable", service]).await?;
        } else {
            debug!(service = %service, "Unit files unchanged");
        }
        Ok(changed)
    }

    async fn start(&self, service: &str) -> Result<()> {
        units::validate_service_name(service)?;
        let status = self.status(service).await?;
        match status.active_state.as_str() {
            "active" | "activating" | "reloading" => {
                debug!(service = %service, state = %status.active_state, "Already started");
                return Ok(());
            }
            "failed" => self.systemctl_best_effort(&["reset-failed", service]).await,
            _ => {}
        }
        info!(service = %service, "Starting unit");
        self.systemctl(&["start", "--no-block", service]).await?;
        Ok(())
    }

    async fn stop(&self, service: &str, force: bool) -> Result<()> {
        units::validate_service_name(service)?;
        let status = self.status(service).await?;
        let idle = matches!(status.active_state.as_str(), "inactive" | "failed");
        if idle && status.pid.is_none() {
            debug!(service = %service, "Already stopped");
            return Ok(());
        }
        if force {
            warn!(service = %service, "Killing unit with SIGKILL");
            self.systemctl_best_effort(&["kill", "--signal=SIGKILL", service])
                .await;
        }
        info!(service = %service, force, "Stopping unit");
        self.systemctl(&["stop", "--no-block", service]).await?;
        Ok(())
    }

    async fn restart(&self, service: &str) -> Result<()> {
        units::validate_service_name(service)?;
        info!(service = %service, "Restarting unit");
        self.systemctl(&["restart", "--no-block", service]).await?;
        Ok(())
    }

    async fn status(&self, service: &str) -> Result<SupervisorStatus> {
        units::validate_service_name(service)?;
        let stdout = self.systemctl(&["show", service, SHOW_PROPERTIES]).await?;
        Ok(parse_show(&stdout, monotonic_now_us())?)
    }

    async fn logs(&self, service: &str, lines: usize, since: Option<&str>) -> Result<Vec<LogEntry>> {
        units::validate_service_name(service)?;
        let count = lines.to_string();
        let mut args = vec!["-u", service, "-n", count.as_str(), "--output=json", "--no-pager"];
        if let Some(since) = since {
            args.push("--since");
            args.push(since);
        }
        let out = self.runner.run(JOURNALCTL, &args).await?;
        let out = out.check(JOURNALCTL, &args)?;
        Ok(out.stdout.lines().filter_map(parse_journal_line).collect())
    }

    async fn remove_service(&self, service: &str) -> Result<()> {
        units::validate_service_name(service)?;
        self.systemctl_best_effort(&["stop", service]).await;
        self.systemctl_best_effort(&["disable", service]).await;

        let _guard = self.unit_lock.lock().await;

        let dropin_dir = units::dropin_dir(&self.unit_dir, service);
        match tokio::fs::remove_dir_all(&dropin_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if !self.other_instances_remain(service).await? {
            let template = units::template_path(&self.unit_dir);
            match tokio::fs::remove_file(&template).await {
                Ok(()) => debug!(path = %template.display(), "Removed unit template"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.systemctl(&["daemon-reload"]).await?;
        self.systemctl_best_effort(&["reset-failed", service]).await;
        info!(service = %service, "Removed unit");
        Ok(())
    }
}

async fn write_if_changed(path: &Path, content: &str) -> io::Result<bool> {
    match tokio::fs::read(path).await {
        Ok(existing) if existing == content.as_bytes() => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let tmp = path.with_extension("pandemic-tmp");
    tokio::fs::write(&tmp, content).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).await?;
    }
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), "Wrote unit file");
    Ok(true)
}

/// Parse `systemctl show` key=value output.
fn parse_show(stdout: &str, now_us: Option<u64>) -> std::result::Result<SupervisorStatus, SupervisorError> {
    let mut status = SupervisorStatus::default();
    let mut active_since = None;
    let mut saw_active = false;

    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let number = || {
            value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|n| *n != u64::MAX)
        };
        match key.trim() {
            "ActiveState" => {
                status.active_state = value.trim().to_string();
                saw_active = true;
            }
            "SubState" => status.sub_state = value.trim().to_string(),
            "MainPID" => {
                status.pid = number()
                    .filter(|pid| *pid > 0)
                    .and_then(|pid| u32::try_from(pid).ok())
            }
            "MemoryCurrent" => status.memory_usage = number(),
            "CPUUsageNSec" => status.cpu_usage = number(),
            "ActiveEnterTimestampMonotonic" => active_since = number().filter(|t| *t > 0),
            "NRestarts" => {
                status.restart_count = number()
                    .and_then(|n| u32::try_from(n).ok())
                    .unwrap_or(0)
            }
            _ => {}
        }
    }

    if !saw_active || status.active_state.is_empty() {
        return Err(SupervisorError::Parse(format!(
            "missing ActiveState in systemctl output: {}",
            stdout.trim()
        )));
    }

    if status.is_active() {
        if let (Some(since), Some(now)) = (active_since, now_us) {
            status.uptime = now.checked_sub(since).map(|us| us / 1_000_000);
        }
    }
    Ok(status)
}

fn parse_journal_line(line: &str) -> Option<LogEntry> {
    let record: Value = serde_json::from_str(line).ok()?;

    let timestamp = record
        .get("__REALTIME_TIMESTAMP")
        .and_then(Value::as_str)
        .and_then(|us| us.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_micros)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();

    let level = record
        .get("PRIORITY")
        .and_then(Value::as_str)
        .map(syslog_level)
        .unwrap_or("INFO")
        .to_string();

    let message = match record.get("MESSAGE") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(bytes)) => {
            let raw: Vec<u8> = bytes
                .iter()
                .filter_map(Value::as_u64)
                .filter_map(|b| u8::try_from(b).ok())
                .collect();
            String::from_utf8_lossy(&raw).into_owned()
        }
        _ => String::new(),
    };

    let pid = record
        .get("_PID")
        .and_then(Value::as_str)
        .and_then(|p| p.parse().ok());

    Some(LogEntry {
        timestamp,
        level,
        message,
        pid,
    })
}

fn syslog_level(priority: &str) -> &'static str {
    match priority {
        "0" => "EMERG",
        "1" => "ALERT",
        "2" => "CRIT",
        "3" => "ERROR",
        "4" => "WARN",
        "5" => "NOTICE",
        "6" => "INFO",
        "7" => "DEBUG",
        _ => "INFO",
    }
}

#[cfg(unix)]
fn monotonic_now_us() -> Option<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return None;
    }
    let secs = u64::try_from(ts.tv_sec).ok()?;
    let nanos = u64::try_from(ts.tv_nsec).ok()?;
    Some(secs * 1_000_000 + nanos / 1_000)
}

#[cfg(not(unix))]
fn monotonic_now_us() -> Option<u64> {
    None
}
