//! CourseHub configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CourseHubError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseHubConfig {
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub email: EmailConfig,
}

fn default_frontend_url() -> String { "http://localhost:3000".into() }

impl Default for CourseHubConfig {
    fn default() -> Self {
        Self {
            frontend_url: default_frontend_url(),
            database: DatabaseConfig::default(),
            gateway: GatewayConfig::default(),
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            email: EmailConfig::default(),
        }
    }
}

impl CourseHubConfig {
    /// Load config from the default path (~/.coursehub/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CourseHubError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse a TOML document.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CourseHubError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config.with_env_overrides())
    }

    /// Save config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CourseHubError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Secrets may come from the environment instead of the file.
    fn with_env_overrides(mut self) -> Self {
        if let Ok(pass) = std::env::var("SMTP_PASSWORD") {
            if !pass.is_empty() {
                self.email.password = pass;
            }
        }
        if let Ok(url) = std::env::var("COURSEHUB_FRONTEND_URL") {
            if !url.is_empty() {
                self.frontend_url = url;
            }
        }
        self
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the CourseHub home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".coursehub")
    }
}

/// Expand `~` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// SQLite database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.coursehub/coursehub.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 { 3000 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// Notification job queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts per job, first run included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubles on every further failure.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Newest completed jobs kept for inspection.
    #[serde(default = "default_keep_completed")]
    pub keep_completed: u32,
    #[serde(default = "default_completed_max_age_secs")]
    pub completed_max_age_secs: u64,
    #[serde(default = "default_failed_max_age_secs")]
    pub failed_max_age_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// An active job whose lock is older than this is considered stalled.
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_backoff_base_ms() -> u64 { 2_000 }
fn default_keep_completed() -> u32 { 100 }
fn default_completed_max_age_secs() -> u64 { 24 * 60 * 60 }
fn default_failed_max_age_secs() -> u64 { 7 * 24 * 60 * 60 }
fn default_poll_interval_ms() -> u64 { 1_000 }
fn default_jitter_ms() -> u64 { 100 }
fn default_stall_timeout_secs() -> u64 { 300 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            keep_completed: default_keep_completed(),
            completed_max_age_secs: default_completed_max_age_secs(),
            failed_max_age_secs: default_failed_max_age_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            jitter_ms: default_jitter_ms(),
            stall_timeout_secs: default_stall_timeout_secs(),
        }
    }
}

/// Sweep cadence and per-kind worker concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// How long before the due date the reminder goes out.
    #[serde(default = "default_reminder_lead_hours")]
    pub reminder_lead_hours: i64,
    #[serde(default = "default_reminder_concurrency")]
    pub reminder_concurrency: usize,
    #[serde(default = "default_overdue_alert_concurrency")]
    pub overdue_alert_concurrency: usize,
    #[serde(default = "default_submission_concurrency")]
    pub submission_concurrency: usize,
}

fn default_sweep_interval_secs() -> u64 { 30 * 60 }
fn default_cleanup_interval_secs() -> u64 { 60 * 60 }
fn default_reminder_lead_hours() -> i64 { 24 }
fn default_reminder_concurrency() -> usize { 5 }
fn default_overdue_alert_concurrency() -> usize { 10 }
fn default_submission_concurrency() -> usize { 3 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            reminder_lead_hours: default_reminder_lead_hours(),
            reminder_concurrency: default_reminder_concurrency(),
            overdue_alert_concurrency: default_overdue_alert_concurrency(),
            submission_concurrency: default_submission_concurrency(),
        }
    }
}

/// SMTP settings for outbound notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Log messages instead of sending them.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_smtp_host() -> String { "localhost".into() }
fn default_smtp_port() -> u16 { 587 }
fn default_display_name() -> String { "Course Management Platform".into() }

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from_address: String::new(),
            display_name: default_display_name(),
            dry_run: false,
        }
    }
}

impl EmailConfig {
    /// Sender address, falling back to the SMTP username.
    pub fn sender(&self) -> &str {
        if self.from_address.is_empty() {
            &self.username
        } else {
            &self.from_address
        }
    }
}
