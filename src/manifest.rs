//! `infection.yaml` descriptor parsing and schema validation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use crate::accounts::validate_account_name;
use crate::error::{PandemicError, Result};
use crate::infection::{InfectionConfig, ResourceLimits, RestartPolicy, SecurityFlags};

pub const MANIFEST_FILE: &str = "infection.yaml";

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,63}$").expect("valid regex")
});

static ENV_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex")
});

static MEMORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[0-9]+[KMGT]?$").expect("valid regex")
});

static CPU_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[0-9]+%$").expect("valid regex")
});

static CAPABILITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^CAP_[A-Z_]+$").expect("valid regex")
});

/// Infection names share the manifest's `metadata.name` rules.
pub fn validate_name(name: &str) -> Result<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(PandemicError::validation(format!(
            "name '{name}' must be alphanumeric with '-', '_' or '.'"
        )))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub execution: Execution,
    #[serde(default)]
    pub systemd: SystemdSection,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub security: SecurityFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub restart_policy: Option<RestartPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemdSection {
    pub user: Option<String>,
    pub group: Option<String>,
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// Per-request tweaks layered over the manifest (`configOverrides`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverrides {
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceLimits,
}

/// Identity the supervisor should run the infection under.
pub struct RunAs<'a> {
    pub user: &'a str,
    pub group: &'a str,
}

impl Manifest {
    /// Parse YAML text. Syntax errors are reported as a plain reason so the
    /// caller can attach the source URI.
    pub fn from_yaml(text: &str) -> std::result::Result<Self, String> {
        serde_yaml::from_str(text).map_err(|e| e.to_string())
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata.name.as_deref()
    }

    /// Check the required-field schema, listing every violation.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        match self.metadata.name.as_deref() {
            None | Some("") => errors.push("metadata.name is required".to_string()),
            Some(name) if !NAME_RE.is_match(name) => errors.push(format!(
                "metadata.name '{name}' must be alphanumeric with '-', '_' or '.'"
            )),
            Some(_) => {}
        }

        match self.execution.command.as_deref().map(str::trim) {
            None | Some("") => errors.push("execution.command is required".to_string()),
            Some(cmd) if cmd.contains("..") => {
                errors.push("execution.command escapes the bundle directory".to_string())
            }
            Some(cmd) if cmd.starts_with(['@', '-', ':', '+', '!']) => {
                errors.push("execution.command must not start with a unit prefix character".to_string())
            }
            Some(_) => {}
        }

        if let Some(dir) = &self.systemd.working_directory {
            if dir.contains("..") {
                errors.push("systemd.workingDirectory escapes the bundle directory".to_string());
            }
        }

        check_single_line("execution.command", self.execution.command.as_deref(), &mut errors);
        check_single_line(
            "systemd.workingDirectory",
            self.systemd.working_directory.as_deref(),
            &mut errors,
        );
        for arg in &self.execution.args {
            check_single_line("execution.args", Some(arg.as_str()), &mut errors);
        }
        for (field, account) in [("systemd.user", &self.systemd.user), ("systemd.group", &self.systemd.group)] {
            if let Some(account) = account {
                if validate_account_name(account).is_err() {
                    errors.push(format!("{field} '{}' is not a valid account name", account.escape_debug()));
                }
            }
        }
        for capability in &self.security.capabilities {
            if !CAPABILITY_RE.is_match(capability) {
                errors.push(format!(
                    "security.capabilities entry '{}' must look like CAP_NET_BIND_SERVICE",
                    capability.escape_debug()
                ));
            }
        }

        check_resources(&self.resources, &mut errors);
        check_environment(&self.execution.environment, &mut errors);
        check_environment(&self.systemd.environment, &mut errors);
        finish("manifest", errors)
    }

    /// Build the supervisor config for an infection installed at `install_path`.
    pub fn to_config(
        &self,
        install_path: &Path,
        run_as: RunAs<'_>,
        overrides: &ConfigOverrides,
    ) -> InfectionConfig {
        let command = self.execution.command.as_deref().unwrap_or_default().trim();

        let mut environment = self.execution.environment.clone();
        environment.extend(self.systemd.environment.clone());
        environment.extend(overrides.environment.clone());

        let resources = ResourceLimits {
            memory_limit: overrides
                .resources
                .memory_limit
                .clone()
                .or_else(|| self.resources.memory_limit.clone()),
            cpu_quota: overrides
                .resources
                .cpu_quota
                .clone()
                .or_else(|| self.resources.cpu_quota.clone()),
        };

        let working_directory = match self.systemd.working_directory.as_deref() {
            Some(dir) if dir.starts_with('/') => dir.to_string(),
            Some(dir) => install_path.join(dir).display().to_string(),
            None => install_path.display().to_string(),
        };

        InfectionConfig {
            command: resolve_command(command, install_path),
            args: self.execution.args.clone(),
            environment,
            resources,
            restart_policy: self.execution.restart_policy.unwrap_or_default(),
            restart_sec: 5,
            security: self.security.clone(),
            user: self
                .systemd
                .user
                .clone()
                .unwrap_or_else(|| run_as.user.to_string()),
            group: self
                .systemd
                .group
                .clone()
                .unwrap_or_else(|| run_as.group.to_string()),
            working_directory,
        }
    }
}

impl ConfigOverrides {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        check_resources(&self.resources, &mut errors);
        check_environment(&self.environment, &mut errors);
        finish("configOverrides", errors)
    }
}

fn check_resources(resources: &ResourceLimits, errors: &mut Vec<String>) {
    if let Some(mem) = &resources.memory_limit {
        if !MEMORY_RE.is_match(mem) {
            errors.push(format!("resources.memoryLimit '{mem}' must look like 256M"));
        }
    }
    if let Some(cpu) = &resources.cpu_quota {
        if !CPU_RE.is_match(cpu) {
            errors.push(format!("resources.cpuQuota '{cpu}' must look like 50%"));
        }
    }
}

fn check_environment(environment: &BTreeMap<String, String>, errors: &mut Vec<String>) {
    for (key, value) in environment {
        if !ENV_KEY_RE.is_match(key) {
            errors.push(format!(
                "environment key '{}' is not a valid variable name",
                key.escape_debug()
            ));
        }
        if value.chars().any(char::is_control) {
            errors.push(format!("environment value for '{key}' contains control characters"));
        }
    }
}

/// Values rendered into unit files must stay on one line.
fn check_single_line(field: &str, value: Option<&str>, errors: &mut Vec<String>) {
    if value.is_some_and(|v| v.chars().any(char::is_control)) {
        errors.push(format!("{field} contains control characters"));
    }
}

fn finish(what: &str, errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(PandemicError::validation(format!(
            "{what} validation failed: {}",
            errors.join("; ")
        )))
    }
}

/// Relative commands are anchored at the install path; bare program names
/// are left for the supervisor's search path.
fn resolve_command(command: &str, install_path: &Path) -> String {
    if command.starts_with('/') || !command.contains('/') {
        return command.to_string();
    }
    let relative = command.trim_start_matches("./");
    install_path.join(relative).display().to_string()
}
