//! Pure rendering and validation of systemd unit content.
//!
//! One template unit (`pandemic-infection@.service`) is shared by every
//! infection; per-infection settings live in a drop-in under
//! `pandemic-infection@<id>.service.d/pandemic.conf`.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::error::SupervisorError;
use crate::infection::{Infection, SERVICE_PREFIX};

pub const TEMPLATE_NAME: &str = "pandemic-infection@.service";
pub const DROPIN_FILE: &str = "pandemic.conf";
pub const MAX_UNIT_BYTES: usize = 64 * 1024;

static SERVICE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^pandemic-infection@[a-z0-9-]+\.service$").expect("valid regex")
});

const FORBIDDEN_FRAGMENTS: &[&str] = &["../", "/etc/passwd", "/etc/shadow"];
const FORBIDDEN_PROGRAMS: &[&str] = &["sudo", "su", "rm"];
const EXEC_PREFIXES: [char; 5] = ['@', '-', ':', '+', '!'];

/// Every directive the template and drop-in renderers emit.
const ALLOWED_KEYS: &[&str] = &[
    "Description",
    "After",
    "Wants",
    "Type",
    "Restart",
    "RestartSec",
    "StandardOutput",
    "StandardError",
    "SyslogIdentifier",
    "WantedBy",
    "User",
    "Group",
    "WorkingDirectory",
    "ExecStart",
    "Environment",
    "MemoryMax",
    "CPUQuota",
    "NoNewPrivileges",
    "ProtectSystem",
    "ReadWritePaths",
    "CapabilityBoundingSet",
    "AmbientCapabilities",
];

pub fn validate_service_name(service: &str) -> Result<(), SupervisorError> {
    if SERVICE_NAME_RE.is_match(service) {
        Ok(())
    } else {
        Err(SupervisorError::InvalidServiceName(service.to_string()))
    }
}

pub fn template_path(unit_dir: &Path) -> PathBuf {
    unit_dir.join(TEMPLATE_NAME)
}

pub fn dropin_dir(unit_dir: &Path, service: &str) -> PathBuf {
    unit_dir.join(format!("{service}.d"))
}

pub fn dropin_path(unit_dir: &Path, service: &str) -> PathBuf {
    dropin_dir(unit_dir, service).join(DROPIN_FILE)
}

/// Instance id portion of `pandemic-infection@<id>.service`.
pub fn instance_of(service: &str) -> Option<&str> {
    service
        .strip_prefix(SERVICE_PREFIX)?
        .strip_suffix(".service")
}

pub fn render_template() -> String {
    "\
# Managed by pandemic.
[Unit]
Description=Pandemic infection %i
After=network-online.target pandemic.service
Wants=network-online.target

[Service]
Type=simple
Restart=always
RestartSec=5
StandardOutput=journal
StandardError=journal
SyslogIdentifier=%i

[Install]
WantedBy=multi-user.target
"
    .to_string()
}

/// Per-infection override. Output depends only on the record, with
/// environment entries in key order.
pub fn render_dropin(infection: &Infection, socket_path: &Path) -> String {
    let config = &infection.config;
    let mut lines = vec![
        "# Managed by pandemic. Regenerated on install, update and setConfig.".to_string(),
        "[Service]".to_string(),
        format!("User={}", config.user),
        format!("Group={}", config.group),
        format!("WorkingDirectory={}", escape_specifiers(&config.working_directory)),
        "ExecStart=".to_string(),
        format!("ExecStart={}", exec_line(&config.command, &config.args)),
        format!("Restart={}", config.restart_policy.as_systemd()),
        format!("RestartSec={}", config.restart_sec),
    ];

    let mut environment: BTreeMap<&str, String> = config
        .environment
        .iter()
        .map(|(k, v)| (k.as_str(), v.clone()))
        .collect();
    environment.insert("PANDEMIC_INFECTION_ID", infection.id.to_string());
    environment.insert("PANDEMIC_SOCKET", socket_path.display().to_string());
    for (key, value) in &environment {
        lines.push(format!("Environment=\"{}\"", escape_quoted(&format!("{key}={value}"))));
    }

    if let Some(memory) = &config.resources.memory_limit {
        lines.push(format!("MemoryMax={memory}"));
    }
    if let Some(cpu) = &config.resources.cpu_quota {
        lines.push(format!("CPUQuota={}", escape_specifiers(cpu)));
    }

    let security = &config.security;
    if security.no_new_privileges {
        lines.push("NoNewPrivileges=yes".to_string());
    }
    if security.read_only_root {
        lines.push("ProtectSystem=strict".to_string());
        lines.push(format!(
            "ReadWritePaths={}",
            escape_specifiers(&infection.install_path.display().to_string())
        ));
    }
    if security.capabilities.is_empty() {
        lines.push("CapabilityBoundingSet=".to_string());
    } else {
        let caps = security.capabilities.join(" ");
        lines.push(format!("CapabilityBoundingSet={caps}"));
        lines.push(format!("AmbientCapabilities={caps}"));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Gate applied to every unit file before it is written.
pub fn validate_unit_content(service: &str, content: &str) -> Result<(), SupervisorError> {
    let reject = |reason: String| SupervisorError::InvalidUnit {
        service: service.to_string(),
        reason,
    };

    if content.len() > MAX_UNIT_BYTES {
        return Err(reject(format!(
            "content is {} bytes, limit is {MAX_UNIT_BYTES}",
            content.len()
        )));
    }

    let lowered = content.to_ascii_lowercase();
    for fragment in FORBIDDEN_FRAGMENTS {
        if lowered.contains(fragment) {
            return Err(reject(format!("content references '{fragment}'")));
        }
    }

    if content.chars().any(|c| c.is_control() && c != '\n') {
        return Err(reject("content contains control characters".to_string()));
    }

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(['#', ';']) || trimmed.starts_with('[') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(reject(format!("malformed line '{trimmed}'")));
        };
        let key = key.trim();
        if !ALLOWED_KEYS.contains(&key) {
            return Err(reject(format!("directive '{key}' is not allowed")));
        }
        if key != "ExecStart" {
            continue;
        }
        let value = value.trim();
        let prefix: String = value.chars().take_while(|c| EXEC_PREFIXES.contains(c)).collect();
        if prefix.contains(['+', '!']) {
            return Err(reject(format!("{key} requests elevated privileges with '{prefix}'")));
        }
        let program = value
            .trim_start_matches(EXEC_PREFIXES)
            .trim_matches('"')
            .split_whitespace()
            .next()
            .unwrap_or_default();
        let basename = program.rsplit('/').next().unwrap_or(program);
        if FORBIDDEN_PROGRAMS.contains(&basename) {
            return Err(reject(format!("{key} invokes '{basename}'")));
        }
    }

    Ok(())
}

fn exec_line(command: &str, args: &[String]) -> String {
    std::iter::once(command)
        .chain(args.iter().map(String::as_str))
        .map(quote_exec_arg)
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_exec_arg(arg: &str) -> String {
    let escaped = escape_specifiers(arg).replace('$', "$$");
    let needs_quotes = escaped.is_empty()
        || escaped
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | ';'));
    if needs_quotes {
        format!("\"{}\"", escape_quoted(&escaped))
    } else {
        escaped
    }
}

fn escape_specifiers(value: &str) -> String {
    value.replace('%', "%%")
}

fn escape_quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '%' => out.push_str("%%"),
            c => out.push(c),
        }
    }
    out
}
