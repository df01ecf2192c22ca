//! Infection records and the identifiers derived from them.
//!
//! Everything here is pure data: ids, service names, install paths and the
//! lifecycle state enum. Persistence lives in `registry`, transitions are
//! driven by `lifecycle`.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::error::{PandemicError, Result};

pub const SERVICE_PREFIX: &str = "pandemic-infection@";

static ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[a-z0-9][a-z0-9-]{0,62}$").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InfectionId(String);

impl InfectionId {
    /// Fresh id in the `infection-<8 hex>` form.
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("infection-{}", &uuid[..8]))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if ID_RE.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(PandemicError::validation(format!(
                "invalid infection id '{raw}'"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn service_name(&self) -> String {
        format!("{SERVICE_PREFIX}{}.service", self.0)
    }

    pub fn install_path(&self, infections_dir: &Path) -> PathBuf {
        infections_dir.join(&self.0)
    }

    /// OS account name, kept under the 32 character useradd limit.
    pub fn account_name(&self, prefix: &str) -> String {
        let suffix = self.0.strip_prefix("infection-").unwrap_or(&self.0);
        let mut name = format!("{prefix}{suffix}");
        name.truncate(32);
        name
    }
}

impl fmt::Display for InfectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfectionState {
    Installing,
    Installed,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Removing,
    Removed,
}

impl InfectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Removing => "removing",
            Self::Removed => "removed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "installing" => Self::Installing,
            "installed" => Self::Installed,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "failed" => Self::Failed,
            "removing" => Self::Removing,
            "removed" => Self::Removed,
            _ => return None,
        })
    }

    /// Edges of the lifecycle graph. Self-loops are not transitions.
    pub fn can_transition_to(self, next: Self) -> bool {
        use InfectionState::*;
        matches!(
            (self, next),
            (Installing, Installed | Failed | Removing)
                | (Installed, Starting | Failed | Removing)
                | (Starting, Running | Stopping | Stopped | Failed | Removing)
                | (Running, Stopping | Starting | Failed | Removing)
                | (Stopping, Stopped | Failed | Removing)
                | (Stopped, Starting | Failed | Removing)
                | (Failed, Starting | Stopped | Removing)
                | (Removing, Removed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Removed
    }
}

impl fmt::Display for InfectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Github,
    Http,
    Local,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Http => "http",
            Self::Local => "local",
        }
    }
}

/// Where an infection bundle comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    /// The URI exactly as the caller supplied it.
    pub uri: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
}

impl SourceDescriptor {
    /// Accepts `github://owner/repo[@ref]`, `http(s)://…`, `local:///abs`,
    /// `file:///abs` and bare absolute paths.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("github://") {
            let (repo, git_ref) = match rest.split_once('@') {
                Some((repo, r)) if !r.is_empty() => (repo, r.to_string()),
                Some(_) => {
                    return Err(PandemicError::validation(format!(
                        "empty ref in source '{raw}'"
                    )))
                }
                None => (rest, "main".to_string()),
            };
            let parts: Vec<&str> = repo.split('/').collect();
            if parts.len() != 2 || parts.iter().any(|p| p.is_empty() || *p == "..") {
                return Err(PandemicError::validation(format!(
                    "github source must look like github://owner/repo[@ref]: '{raw}'"
                )));
            }
            return Ok(Self {
                kind: SourceKind::Github,
                uri: raw.to_string(),
                git_ref: Some(git_ref),
            });
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(Self {
                kind: SourceKind::Http,
                uri: raw.to_string(),
                git_ref: None,
            });
        }
        if raw.starts_with("local://") || raw.starts_with("file://") || raw.starts_with('/') {
            let descriptor = Self {
                kind: SourceKind::Local,
                uri: raw.to_string(),
                git_ref: None,
            };
            descriptor.local_path()?;
            return Ok(descriptor);
        }
        Err(PandemicError::validation(format!(
            "unrecognised source '{raw}'"
        )))
    }

    /// `owner/repo` for github sources.
    pub fn github_repo(&self) -> Option<&str> {
        let rest = self.uri.strip_prefix("github://")?;
        Some(rest.split_once('@').map_or(rest, |(repo, _)| repo))
    }

    pub fn local_path(&self) -> Result<PathBuf> {
        let path = self
            .uri
            .strip_prefix("local://")
            .or_else(|| self.uri.strip_prefix("file://"))
            .unwrap_or(&self.uri);
        let path = PathBuf::from(path);
        if !path.is_absolute() {
            return Err(PandemicError::validation(format!(
                "local source must be an absolute path: '{}'",
                self.uri
            )));
        }
        Ok(path)
    }

    /// Name guess used when neither the request nor the manifest names it.
    pub fn default_name(&self) -> String {
        let stem = match self.kind {
            SourceKind::Github => self
                .github_repo()
                .and_then(|r| r.split('/').nth(1))
                .unwrap_or("unknown")
                .to_string(),
            SourceKind::Http | SourceKind::Local => {
                let trimmed = self.uri.trim_end_matches('/');
                let last = trimmed.rsplit('/').next().unwrap_or("unknown");
                last.trim_end_matches(".tar.gz")
                    .trim_end_matches(".tgz")
                    .trim_end_matches(".zip")
                    .to_string()
            }
        };
        if stem.is_empty() {
            "unknown".to_string()
        } else {
            stem
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_quota: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    No,
}

impl RestartPolicy {
    pub fn as_systemd(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::OnFailure => "on-failure",
            Self::No => "no",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityFlags {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub read_only_root: bool,
    #[serde(default = "default_true")]
    pub no_new_privileges: bool,
}

impl Default for SecurityFlags {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            read_only_root: false,
            no_new_privileges: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// How the supervisor runs an infection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfectionConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default = "default_restart_sec")]
    pub restart_sec: u32,
    #[serde(default)]
    pub security: SecurityFlags,
    pub user: String,
    pub group: String,
    pub working_directory: String,
}

fn default_restart_sec() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Infection {
    pub id: InfectionId,
    pub name: String,
    pub source: SourceDescriptor,
    pub state: InfectionState,
    pub install_path: PathBuf,
    pub service_name: String,
    pub config: InfectionConfig,
    /// Consecutive supervisor restarts since the last healthy observation.
    #[serde(default)]
    pub failure_count: u32,
    /// Supervisor restart counter value when `failure_count` was last reset.
    #[serde(default)]
    pub restart_baseline: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Infection {
    pub fn new(
        id: InfectionId,
        name: String,
        source: SourceDescriptor,
        install_path: PathBuf,
        config: InfectionConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            service_name: id.service_name(),
            id,
            name,
            source,
            state: InfectionState::Installing,
            install_path,
            config,
            failure_count: 0,
            restart_baseline: 0,
            last_error: None,
            manifest_version: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
