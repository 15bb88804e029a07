//! TOML-based configuration system for mergeflow.
//!
//! All sensitive values (webhook secrets, Slack URLs) are stored as `_env`
//! fields that reference environment variable names. The actual secrets are
//! resolved at runtime via [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / scheduling settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// The repository whose change requests are merged.
    pub repository: RepositoryConfig,

    /// Merge policy.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Who may do what.
    #[serde(default)]
    pub access: AccessConfig,

    /// Webhook receiver settings.
    #[serde(default)]
    pub web: WebConfig,

    /// Notification settings (Slack, email).
    #[serde(default)]
    pub notifications: NotificationConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between re-checks of deferred merges and stale locks (default 60).
    #[serde(default = "default_recheck_interval")]
    pub recheck_interval_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (database).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Number of merge workers (default 4).
    #[serde(default = "default_merge_workers")]
    pub merge_workers: usize,
}

fn default_recheck_interval() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/mergeflow")
}
fn default_merge_workers() -> usize {
    4
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            recheck_interval_secs: default_recheck_interval(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            merge_workers: default_merge_workers(),
        }
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Local repository and committer identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Path to the git repository (bare or with a work tree).
    pub path: PathBuf,

    /// Project name used in change request references (e.g. `group/app`).
    pub project: String,

    /// Name recorded on merge commits.
    #[serde(default = "default_committer_name")]
    pub committer_name: String,

    /// Email recorded on merge commits.
    #[serde(default = "default_committer_email")]
    pub committer_email: String,
}

fn default_committer_name() -> String {
    "mergeflow".into()
}
fn default_committer_email() -> String {
    "mergeflow@localhost".into()
}

// ---------------------------------------------------------------------------
// Merge policy
// ---------------------------------------------------------------------------

/// How the target branch is advanced.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    /// Always create a merge commit.
    #[default]
    MergeCommit,
    /// Only advance the target when it is an ancestor of the source.
    FastForward,
}

impl std::fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MergeCommit => write!(f, "merge_commit"),
            Self::FastForward => write!(f, "fast_forward"),
        }
    }
}

/// Merge policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub method: MergeMethod,

    /// Require a passing CI signal before any merge.
    #[serde(default)]
    pub ci_required: bool,

    /// Locks older than this are released and the change request closed
    /// (default one day).
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
}

fn default_lock_timeout() -> u64 {
    24 * 60 * 60
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            method: MergeMethod::default(),
            ci_required: false,
            lock_timeout_secs: default_lock_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Access
// ---------------------------------------------------------------------------

/// Static role assignment consumed by `ConfiguredAuthorizer`.
///
/// When both lists are empty every actor is allowed everything.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccessConfig {
    /// Actors allowed every action.
    #[serde(default)]
    pub maintainers: Vec<String>,

    /// Actors allowed to update change requests and resolve conflicts.
    #[serde(default)]
    pub developers: Vec<String>,

    /// Whether developers may also merge and cancel merges.
    #[serde(default)]
    pub developers_can_merge: bool,
}

// ---------------------------------------------------------------------------
// Webhook receiver
// ---------------------------------------------------------------------------

/// Webhook receiver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Listen address (default `127.0.0.1:3000`).
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Environment variable holding the HMAC secret for webhook payloads.
    #[serde(default)]
    pub webhook_secret_env: Option<String>,

    /// Resolved webhook secret.
    #[serde(skip)]
    pub webhook_secret: Option<String>,
}

fn default_listen() -> String {
    "127.0.0.1:3000".into()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            webhook_secret_env: None,
            webhook_secret: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Notification channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    /// Environment variable holding the Slack incoming-webhook URL.
    #[serde(default)]
    pub slack_webhook_url_env: Option<String>,

    /// SMTP server address for email notifications (e.g. `smtp.example.com:587`).
    #[serde(default)]
    pub email_smtp: Option<String>,

    /// Sender email address.
    #[serde(default)]
    pub email_from: Option<String>,

    /// Recipient email addresses.
    #[serde(default)]
    pub email_recipients: Vec<String>,

    /// Resolved Slack webhook URL.
    #[serde(skip)]
    pub slack_webhook_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables and populate the
    /// corresponding resolved fields.
    ///
    /// Fields that reference a missing variable will log a warning but will
    /// **not** fail -- callers can check the `Option` fields and decide what
    /// is required for their execution mode.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        // Webhook secret
        if let Some(ref env_name) = self.web.webhook_secret_env {
            self.web.webhook_secret = resolve_optional_env(env_name, "web.webhook_secret_env");
        }

        // Slack webhook URL
        if let Some(ref env_name) = self.notifications.slack_webhook_url_env {
            self.notifications.slack_webhook_url =
                resolve_optional_env(env_name, "notifications.slack_webhook_url_env");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.project.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "repository.project".into(),
                detail: "project name must not be empty".into(),
            });
        }
        if self.repository.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "repository.path".into(),
                detail: "repository path must not be empty".into(),
            });
        }
        if self.daemon.recheck_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.recheck_interval_secs".into(),
                detail: "recheck interval must be > 0".into(),
            });
        }
        if self.daemon.merge_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.merge_workers".into(),
                detail: "at least one merge worker is required".into(),
            });
        }
        if self.merge.lock_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "merge.lock_timeout_secs".into(),
                detail: "lock timeout must be > 0".into(),
            });
        }
        if self.notifications.email_smtp.is_some() && self.notifications.email_from.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "notifications.email_from".into(),
                detail: "a sender address is required when email_smtp is set".into(),
            });
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[daemon]
recheck_interval_secs = 30
log_level = "debug"
data_dir = "/tmp/mergeflow"
merge_workers = 2

[repository]
path = "/srv/git/app.git"
project = "group/app"
committer_name = "Merge Bot"
committer_email = "bot@example.com"

[merge]
method = "fast_forward"
ci_required = true
lock_timeout_secs = 3600

[access]
maintainers = ["alice"]
developers = ["bob", "carol"]
developers_can_merge = true

[web]
listen = "0.0.0.0:8080"
webhook_secret_env = "MERGEFLOW_WEBHOOK_SECRET"

[notifications]
slack_webhook_url_env = "SLACK_URL"
email_smtp = "smtp.example.com:587"
email_from = "merges@example.com"
email_recipients = ["team@example.com"]
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.daemon.recheck_interval_secs, 30);
        assert_eq!(config.daemon.merge_workers, 2);
        assert_eq!(config.repository.project, "group/app");
        assert_eq!(config.merge.method, MergeMethod::FastForward);
        assert!(config.merge.ci_required);
        assert_eq!(config.access.developers, vec!["bob", "carol"]);
        assert!(config.access.developers_can_merge);
        assert_eq!(config.web.listen, "0.0.0.0:8080");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.daemon.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_empty_project() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.repository.project = String::new();
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "repository.project"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.daemon.merge_workers = 0;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "daemon.merge_workers"
        ));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("TEST_MERGEFLOW_SECRET", "s3cret");

        let toml_str = r#"
[repository]
path = "/srv/git/app.git"
project = "group/app"
[web]
webhook_secret_env = "TEST_MERGEFLOW_SECRET"
[notifications]
slack_webhook_url_env = "TEST_MERGEFLOW_UNSET_SLACK"
"#;
        let mut config: AppConfig = toml::from_str(toml_str).unwrap();
        config.resolve_env_vars().unwrap();

        assert_eq!(config.web.webhook_secret.as_deref(), Some("s3cret"));
        assert!(config.notifications.slack_webhook_url.is_none());

        std::env::remove_var("TEST_MERGEFLOW_SECRET");
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[repository]
path = "/srv/git/app.git"
project = "group/app"
"#;
        let config: AppConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.daemon.recheck_interval_secs, 60);
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.merge_workers, 4);
        assert_eq!(config.repository.committer_name, "mergeflow");
        assert_eq!(config.merge.method, MergeMethod::MergeCommit);
        assert!(!config.merge.ci_required);
        assert_eq!(config.merge.lock_timeout_secs, 86_400);
        assert_eq!(config.web.listen, "127.0.0.1:3000");
        assert!(config.access.maintainers.is_empty());
        config.validate().unwrap();
    }
}
