//! Configuration types.

use crate::notifications::DEFAULT_CAPACITY;
use crate::session::{SessionContext, SessionOptions};
use crate::types::{ProjectId, Role, UserId};
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default base URL of the task service.
pub const DEFAULT_API_BASE: &str = "http://localhost:8000";

/// Connection settings for the task service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL shared by the CRUD API, the analysis service and the event streams.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token passed through on every request.
    #[serde(default)]
    pub token: Option<String>,

    /// Per-request timeout in milliseconds (default: 10000). Event streams
    /// are not subject to it.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_base_url() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

/// Who the session runs as. Unset fields are resolved from the service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub user_id: Option<UserId>,

    /// `admin`, `manager` or `executor`.
    #[serde(default)]
    pub role: Option<String>,

    #[serde(default)]
    pub selected_project: Option<ProjectId>,
}

impl SessionConfig {
    /// Parse the configured role, rejecting unknown names.
    pub fn parsed_role(&self) -> Result<Option<Role>> {
        match self.role {
            None => Ok(None),
            Some(ref name) => Role::from_str(name)
                .map(Some)
                .ok_or_else(|| anyhow!("unknown role '{}' (expected admin, manager or executor)", name)),
        }
    }

    /// Session context seeded from configuration.
    pub fn to_context(&self) -> Result<SessionContext> {
        Ok(SessionContext {
            user_id: self.user_id,
            role: self.parsed_role()?,
            selected_project: self.selected_project,
            visible_projects: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Maximum retained notifications (default: 200).
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionsConfig {
    /// Health reconcile period in milliseconds (default: 15000, 0 disables).
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    /// Fetch the critical-path analysis with every snapshot (default: true).
    #[serde(default = "default_true")]
    pub fetch_analysis: bool,
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: default_reconcile_interval_ms(),
            fetch_analysis: true,
        }
    }
}

fn default_reconcile_interval_ms() -> u64 {
    15_000
}

fn default_true() -> bool {
    true
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub subscriptions: SubscriptionsConfig,
}

impl Config {
    /// Load a single configuration file, without tier merging.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Empty or comment-only files parse as null
        let config: Option<Config> = serde_yaml::from_str(&content)?;
        Ok(config.unwrap_or_default())
    }

    /// Session tunables derived from this configuration.
    pub fn session_options(&self) -> SessionOptions {
        let interval = self.subscriptions.reconcile_interval_ms;
        SessionOptions {
            notification_capacity: self.notifications.capacity,
            reconcile_interval: (interval > 0).then(|| Duration::from_millis(interval)),
            fetch_analysis: self.subscriptions.fetch_analysis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.api.base_url, DEFAULT_API_BASE);
        assert_eq!(config.notifications.capacity, 200);
        assert_eq!(
            config.session_options().reconcile_interval,
            Some(Duration::from_secs(15))
        );
    }

    #[test]
    fn zero_interval_disables_health_tick() {
        let mut config = Config::default();
        config.subscriptions.reconcile_interval_ms = 0;
        assert!(config.session_options().reconcile_interval.is_none());
    }

    #[test]
    fn role_is_parsed_case_insensitively() {
        let session = SessionConfig {
            role: Some("Admin".to_string()),
            ..SessionConfig::default()
        };
        assert_eq!(session.parsed_role().unwrap(), Some(Role::Admin));
    }

    #[test]
    fn unknown_role_is_rejected() {
        let session = SessionConfig {
            role: Some("owner".to_string()),
            ..SessionConfig::default()
        };
        assert!(session.to_context().is_err());
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str("session:\n  selected_project: 4\n").unwrap();
        assert_eq!(config.session.selected_project, Some(4));
        assert_eq!(config.api.request_timeout_ms, 10_000);
    }
}
