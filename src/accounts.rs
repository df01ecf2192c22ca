//! Dedicated OS accounts for infections.

use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use crate::error::{PandemicError, Result};
use crate::supervisor::CommandRunner;

const NOLOGIN_SHELL: &str = "/usr/sbin/nologin";

static ACCOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("valid regex")
});

#[async_trait]
pub trait AccountManager: Send + Sync {
    /// Make sure `user` exists with primary group `group`. Returns `true`
    /// when the account was created by this call.
    async fn ensure_account(&self, user: &str, group: &str) -> Result<bool>;

    async fn remove_account(&self, user: &str) -> Result<()>;

    /// Recursively hand `path` to `user:group`.
    async fn grant_ownership(&self, path: &Path, user: &str, group: &str) -> Result<()>;
}

pub fn validate_account_name(name: &str) -> Result<()> {
    if ACCOUNT_RE.is_match(name) {
        Ok(())
    } else {
        Err(PandemicError::validation(format!(
            "invalid account name '{name}'"
        )))
    }
}

/// Accounts managed with the shadow-utils binaries.
pub struct SystemAccounts {
    runner: Arc<dyn CommandRunner>,
}

impl SystemAccounts {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn group_exists(&self, group: &str) -> Result<bool> {
        Ok(self.runner.run("getent", &["group", group]).await?.success())
    }

    async fn user_exists(&self, user: &str) -> Result<bool> {
        Ok(self.runner.run("id", &["-u", user]).await?.success())
    }
}

#[async_trait]
impl AccountManager for SystemAccounts {
    async fn ensure_account(&self, user: &str, group: &str) -> Result<bool> {
        validate_account_name(user)?;
        validate_account_name(group)?;

        if !self.group_exists(group).await? {
            info!(group = %group, "Creating system group");
            let args = ["--system", group];
            self.runner.run("groupadd", &args).await?.check("groupadd", &args)?;
        }

        if self.user_exists(user).await? {
            debug!(user = %user, "Account already exists");
            return Ok(false);
        }

        info!(user = %user, group = %group, "Creating system user");
        let args = [
            "--system",
            "--no-create-home",
            "--shell",
            NOLOGIN_SHELL,
            "-g",
            group,
            user,
        ];
        self.runner.run("useradd", &args).await?.check("useradd", &args)?;
        Ok(true)
    }

    async fn remove_account(&self, user: &str) -> Result<()> {
        validate_account_name(user)?;
        if !self.user_exists(user).await? {
            return Ok(());
        }
        let args = [user];
        let out = self.runner.run("userdel", &args).await?;
        if !out.success() {
            warn!(user = %user, stderr = %out.stderr.trim(), "Failed to delete user");
        }
        Ok(())
    }

    async fn grant_ownership(&self, path: &Path, user: &str, group: &str) -> Result<()> {
        validate_account_name(user)?;
        validate_account_name(group)?;
        let owner = format!("{user}:{group}");
        let path = path.display().to_string();
        let args = ["-R", owner.as_str(), path.as_str()];
        self.runner.run("chown", &args).await?.check("chown", &args)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::CommandOutput;
    use crate::testing::ScriptedRunner;

    #[tokio::test]
    async fn creates_missing_group_and_user() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond("getent group", CommandOutput::failed(2, ""));
        runner.respond("id -u", CommandOutput::failed(1, "no such user"));
        let accounts = SystemAccounts::new(runner.clone());

        let created = accounts
            .ensure_account("pandemic-1a2b3c4d", "pandemic")
            .await
            .expect("ensure");
        assert!(created);
        assert_eq!(runner.count("groupadd --system pandemic"), 1);
        assert_eq!(
            runner.count(
                "useradd --system --no-create-home --shell /usr/sbin/nologin -g pandemic pandemic-1a2b3c4d"
            ),
            1
        );
    }

    #[tokio::test]
    async fn existing_account_is_left_alone() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.respond("id -u", CommandOutput::ok("998\n"));
        let accounts = SystemAccounts::new(runner.clone());

        let created = accounts
            .ensure_account("pandemic-1a2b3c4d", "pandemic")
            .await
            .expect("ensure");
        assert!(!created);
        assert_eq!(runner.count("useradd"), 0);
        assert_eq!(runner.count("groupadd"), 0);
    }

    #[tokio::test]
    async fn rejects_hostile_names() {
        let runner = Arc::new(ScriptedRunner::default());
        let accounts = SystemAccounts::new(runner.clone());
        assert!(accounts.ensure_account("-o root", "pandemic").await.is_err());
        assert!(accounts.ensure_account("Root", "pandemic").await.is_err());
        assert!(runner.calls().is_empty());
    }
}
