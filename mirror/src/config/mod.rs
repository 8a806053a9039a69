use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::info;

use crate::error::MirrorError;

/// Mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// IMAP account to mirror
    pub imap: ImapConfig,

    /// SQLite database file the mirror writes into
    #[serde(default)]
    pub database: PathBuf,

    /// Concurrent fetch connections per mailbox
    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,

    /// Concurrent connections used for preflight
    #[serde(default = "default_preflight_workers")]
    pub preflight_workers: usize,

    /// UIDs per FETCH round trip
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Reconnect attempts per batch. Negative retries forever, zero disables retries.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: i32,

    /// Delay before the first reconnect, grows linearly per attempt
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Upper bound for the reconnect delay
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Bound for every protocol round trip
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,

    /// Capacity of the channel between fetch workers and the writer
    #[serde(default = "default_write_queue")]
    pub write_queue: usize,

    /// Hard ceiling of simultaneous connections the server accepts
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Delete local rows whose UID vanished from the server
    #[serde(default)]
    pub prune: bool,

    /// Delete local rows stored under an older UIDVALIDITY
    #[serde(default)]
    pub purge: bool,

    /// Propagate duplicate rows and unparseable messages instead of skipping them
    #[serde(default)]
    pub strict: bool,

    /// Mailbox allow-list (globs with `*` and `?`, case-insensitive). Empty allows all.
    #[serde(default)]
    pub only: Vec<String>,

    /// Mailbox deny-list, applied after `only`
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// IMAP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    /// IMAP server hostname
    pub host: String,

    /// IMAP server port (implicit TLS)
    #[serde(default = "default_imap_port")]
    pub port: u16,

    /// Login name, usually the email address
    pub user: String,

    pub password: PasswordSource,
}

/// Password source - can be raw value or command to execute
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PasswordSource {
    /// Raw password value
    Raw(String),
    /// Command to execute to get password
    Command { command: String },
}

impl PasswordSource {
    /// Resolve to the actual password. Commands run through `sh -c` and the
    /// first line of stdout is used.
    pub fn resolve(&self) -> Result<String, MirrorError> {
        match self {
            PasswordSource::Raw(password) => Ok(password.clone()),
            PasswordSource::Command { command } => {
                let output = Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .output()
                    .map_err(|e| MirrorError::Config(format!("Failed to run password command: {}", e)))?;

                if !output.status.success() {
                    return Err(MirrorError::Config(format!(
                        "Password command exited with {}",
                        output.status
                    )));
                }

                let stdout = String::from_utf8_lossy(&output.stdout);
                Ok(stdout.lines().next().unwrap_or_default().to_string())
            }
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            PasswordSource::Raw(password) => password.is_empty(),
            PasswordSource::Command { command } => command.trim().is_empty(),
        }
    }
}

fn default_imap_port() -> u16 {
    993
}

fn default_fetch_workers() -> usize {
    4
}

fn default_preflight_workers() -> usize {
    4
}

fn default_batch_size() -> usize {
    100
}

fn default_retry_attempts() -> i32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_io_timeout_secs() -> u64 {
    120
}

fn default_write_queue() -> usize {
    1024
}

fn default_max_connections() -> usize {
    // Gmail's per-account limit
    15
}

impl Settings {
    /// Settings for `host`/`user`/`password` writing into `database`, every
    /// tunable at its default.
    pub fn new(host: &str, user: &str, password: &str, database: impl Into<PathBuf>) -> Self {
        Self {
            imap: ImapConfig {
                host: host.to_string(),
                port: default_imap_port(),
                user: user.to_string(),
                password: PasswordSource::Raw(password.to_string()),
            },
            database: database.into(),
            fetch_workers: default_fetch_workers(),
            preflight_workers: default_preflight_workers(),
            batch_size: default_batch_size(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            io_timeout_secs: default_io_timeout_secs(),
            write_queue: default_write_queue(),
            max_connections: default_max_connections(),
            prune: false,
            purge: false,
            strict: false,
            only: Vec::new(),
            exclude: Vec::new(),
        }
    }

    /// Reject configurations that cannot work before any connection is made.
    pub fn validate(&self) -> Result<(), MirrorError> {
        if self.imap.host.trim().is_empty() {
            return Err(MirrorError::Config("imap.host is required".into()));
        }
        if self.imap.user.trim().is_empty() {
            return Err(MirrorError::Config("imap.user is required".into()));
        }
        if self.imap.password.is_empty() {
            return Err(MirrorError::Config("imap.password is required".into()));
        }
        if self.database.as_os_str().is_empty() {
            return Err(MirrorError::Config("database path is required".into()));
        }
        if self.fetch_workers == 0 || self.preflight_workers == 0 {
            return Err(MirrorError::Config("worker counts must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(MirrorError::Config("batch_size must be at least 1".into()));
        }
        if self.write_queue == 0 {
            return Err(MirrorError::Config("write_queue must be at least 1".into()));
        }
        for (name, count) in [
            ("fetch_workers", self.fetch_workers),
            ("preflight_workers", self.preflight_workers),
        ] {
            if count > self.max_connections {
                return Err(MirrorError::Config(format!(
                    "{} = {} exceeds max_connections = {}",
                    name, count, self.max_connections
                )));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

/// Reconnect budget for one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Negative: unlimited. Zero: fail on the first transient error.
    pub attempts: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// No retries and no delay
    pub fn none() -> Self {
        Self {
            attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Whether reconnect attempt number `attempt` (1-based) is allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        self.attempts < 0 || attempt <= self.attempts as u32
    }

    /// Linear backoff, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // XDG config path
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("eddie.mirror").join("config.toml"));
    }

    // Home directory fallback
    if let Some(home_dir) = dirs::home_dir() {
        paths.push(
            home_dir
                .join(".config")
                .join("eddie.mirror")
                .join("config.toml"),
        );
        paths.push(home_dir.join(".eddie.mirror.rc"));
    }

    paths
}

/// Load settings from the first default path that exists
pub fn load_default() -> Result<Settings, MirrorError> {
    for path in default_config_paths() {
        if path.exists() {
            info!("Found config at: {:?}", path);
            return load_from_path(&path);
        }
    }

    Err(MirrorError::Config(format!(
        "No config file found (looked in {:?})",
        default_config_paths()
    )))
}

/// Load settings from a specific path
pub fn load_from_path(path: &Path) -> Result<Settings, MirrorError> {
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .map_err(|e| MirrorError::Config(format!("Failed to read config: {}", e)))?;

    parse(&content)
}

pub fn parse(content: &str) -> Result<Settings, MirrorError> {
    toml::from_str(content)
        .map_err(|e| MirrorError::Config(format!("Failed to parse config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        database = "/tmp/mirror.db"

        [imap]
        host = "imap.example.com"
        user = "alice@example.com"
        password = "hunter2"
    "#;

    #[test]
    fn test_parse_applies_defaults() {
        let settings = parse(MINIMAL).expect("Failed to parse config");

        assert_eq!(settings.imap.port, 993);
        assert_eq!(settings.fetch_workers, 4);
        assert_eq!(settings.preflight_workers, 4);
        assert_eq!(settings.batch_size, 100);
        assert_eq!(settings.retry_attempts, 5);
        assert!(!settings.prune);
        assert!(!settings.purge);
        assert!(!settings.strict);
        assert!(settings.only.is_empty());
        settings.validate().expect("Minimal config should be valid");
    }

    #[test]
    fn test_parse_password_command() {
        let content = r#"
            database = "/tmp/mirror.db"
            only = ["INBOX", "Work*"]
            exclude = ["Work/Spam"]
            retry_attempts = -1

            [imap]
            host = "imap.example.com"
            user = "alice@example.com"
            password = { command = "echo s3cret; echo ignored" }
        "#;
        let settings = parse(content).expect("Failed to parse config");

        assert_eq!(settings.only, vec!["INBOX", "Work*"]);
        assert_eq!(settings.exclude, vec!["Work/Spam"]);
        assert_eq!(settings.retry_attempts, -1);
        match &settings.imap.password {
            PasswordSource::Command { command } => assert!(command.starts_with("echo")),
            other => panic!("Expected command password, got {:?}", other),
        }
        assert_eq!(settings.imap.password.resolve().expect("Failed to resolve"), "s3cret");
    }

    #[test]
    fn test_validate_rejects_missing_credentials() {
        let mut settings = Settings::new("imap.example.com", "", "pw", "/tmp/db");
        assert!(matches!(settings.validate(), Err(MirrorError::Config(_))));

        settings.imap.user = "alice".into();
        settings.database = PathBuf::new();
        assert!(matches!(settings.validate(), Err(MirrorError::Config(_))));
    }

    #[test]
    fn test_validate_enforces_connection_ceiling() {
        let mut settings = Settings::new("imap.example.com", "alice", "pw", "/tmp/db");
        settings.fetch_workers = 16;
        let err = settings.validate().expect_err("Should exceed ceiling");
        assert!(err.to_string().contains("max_connections"));

        settings.fetch_workers = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_retry_policy_budget() {
        let never = RetryPolicy::none();
        assert!(!never.allows(1));

        let three = RetryPolicy { attempts: 3, ..RetryPolicy::none() };
        assert!(three.allows(3));
        assert!(!three.allows(4));

        let forever = RetryPolicy { attempts: -1, ..RetryPolicy::none() };
        assert!(forever.allows(10_000));
    }

    #[test]
    fn test_retry_delay_is_linear_and_capped() {
        let policy = RetryPolicy {
            attempts: -1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(9), Duration::from_millis(250));
    }
}
