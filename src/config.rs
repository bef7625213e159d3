//! Configuration module for Herald.
//!
//! Loads configuration from an optional TOML file with environment variable
//! substitution, then applies environment overrides on top.
//!
//! # Example
//!
//! ```toml
//! [broker]
//! url = "${REDIS_URL}"
//! source_stream = "herald:events"
//!
//! [repost]
//! interval_ms = 10000
//!
//! [api]
//! projects_url = "https://api.example.com/v5/projects"
//! users_url = "https://api.example.com/v5/users"
//!
//! [audience]
//! managers = [101, 102]
//! copilots = [201]
//! ```
//!
//! # Environment overrides
//!
//! | Variable                    | Default                      |
//! |-----------------------------|------------------------------|
//! | `HERALD_CONFIG`             | `config/herald.toml`         |
//! | `REDIS_URL`                 | `redis://localhost:6379`     |
//! | `HERALD_SOURCE_STREAM`      | `herald:events`              |
//! | `HERALD_CONSUMER_GROUP`     | `herald_workers`             |
//! | `HERALD_WORKER_NAME`        | `worker-<hostname>`          |
//! | `HERALD_PREFETCH`           | `10`                         |
//! | `HERALD_MAX_DELIVERIES`     | `3`                          |
//! | `HERALD_REPOST_INTERVAL_MS` | `10000`                      |
//! | `HERALD_PROJECTS_API_URL`   | `http://localhost:3000/v5/projects` |
//! | `HERALD_USERS_API_URL`      | `http://localhost:3000/v5/users`    |
//! | `HERALD_API_TOKEN`          | unset                        |
//! | `HERALD_API_TIMEOUT_MS`     | `10000`                      |
//! | `HERALD_API_RETRIES`        | `1`                          |
//! | `HERALD_MANAGER_IDS`        | empty                        |
//! | `HERALD_COPILOT_IDS`        | empty                        |
//! | `HERALD_PROJECT_URL`        | `http://localhost:3000/projects` |
//! | `HERALD_GENERAL_EXCHANGE`   | `herald:notifications`       |
//! | `HERALD_ROLE_EXCHANGE`      | `herald:roles`               |
//! | `HERALD_DELAYED_EXCHANGE`   | `herald:roles:delayed`       |
//! | `HERALD_DLQ_STREAM`         | `herald:events:dlq`          |

use crate::audience::AudiencePools;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HeraldConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub destinations: DestinationsConfig,

    #[serde(default)]
    pub repost: RepostConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub audience: AudienceConfig,

    #[serde(default)]
    pub slack: SlackConfig,
}

/// Source stream and consumer group settings
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_source_stream")]
    pub source_stream: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Consumer name inside the group; derived from the hostname when unset
    #[serde(default)]
    pub worker_name: Option<String>,

    /// Entries read per batch and processed concurrently
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    /// Deliveries after which a nacked event is dead-lettered
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u64,

    /// Idle time before a pending entry is reclaimed and redelivered
    #[serde(default = "default_claim_idle_ms")]
    pub claim_idle_ms: u64,

    #[serde(default = "default_dlq_stream")]
    pub dlq_stream: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            source_stream: default_source_stream(),
            consumer_group: default_consumer_group(),
            worker_name: None,
            prefetch: default_prefetch(),
            max_deliveries: default_max_deliveries(),
            claim_idle_ms: default_claim_idle_ms(),
            dlq_stream: default_dlq_stream(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_source_stream() -> String {
    crate::EVENT_STREAM_NAME.to_string()
}

fn default_consumer_group() -> String {
    crate::DEFAULT_CONSUMER_GROUP.to_string()
}

fn default_prefetch() -> usize {
    10
}

fn default_max_deliveries() -> u64 {
    3
}

fn default_claim_idle_ms() -> u64 {
    30000
}

fn default_dlq_stream() -> String {
    crate::DLQ_STREAM_NAME.to_string()
}

/// Outbound exchanges and routing keys
#[derive(Debug, Deserialize, Clone)]
pub struct DestinationsConfig {
    #[serde(default = "default_general_exchange")]
    pub general_exchange: String,

    #[serde(default = "default_general_routing_key")]
    pub general_routing_key: String,

    #[serde(default = "default_role_exchange")]
    pub role_exchange: String,

    #[serde(default = "default_delayed_exchange")]
    pub delayed_exchange: String,

    #[serde(default = "default_manager_routing_key")]
    pub manager_routing_key: String,

    #[serde(default = "default_copilot_routing_key")]
    pub copilot_routing_key: String,
}

impl Default for DestinationsConfig {
    fn default() -> Self {
        Self {
            general_exchange: default_general_exchange(),
            general_routing_key: default_general_routing_key(),
            role_exchange: default_role_exchange(),
            delayed_exchange: default_delayed_exchange(),
            manager_routing_key: default_manager_routing_key(),
            copilot_routing_key: default_copilot_routing_key(),
        }
    }
}

fn default_general_exchange() -> String {
    "herald:notifications".to_string()
}

fn default_general_routing_key() -> String {
    "notifications.project".to_string()
}

fn default_role_exchange() -> String {
    "herald:roles".to_string()
}

fn default_delayed_exchange() -> String {
    "herald:roles:delayed".to_string()
}

fn default_manager_routing_key() -> String {
    "notifications.manager".to_string()
}

fn default_copilot_routing_key() -> String {
    "notifications.copilot".to_string()
}

/// Repost scheduler settings
#[derive(Debug, Deserialize, Clone)]
pub struct RepostConfig {
    #[serde(default = "default_repost_interval_ms")]
    pub interval_ms: u64,
}

impl Default for RepostConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_repost_interval_ms(),
        }
    }
}

impl RepostConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_repost_interval_ms() -> u64 {
    10000
}

/// Project and user record API
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_projects_url")]
    pub projects_url: String,

    #[serde(default = "default_users_url")]
    pub users_url: String,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            projects_url: default_projects_url(),
            users_url: default_users_url(),
            token: None,
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
        }
    }
}

fn default_projects_url() -> String {
    "http://localhost:3000/v5/projects".to_string()
}

fn default_users_url() -> String {
    "http://localhost:3000/v5/users".to_string()
}

fn default_timeout_ms() -> u64 {
    10000
}

fn default_retries() -> u32 {
    1
}

/// Known manager and copilot user ids
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AudienceConfig {
    #[serde(default)]
    pub managers: Vec<i64>,

    #[serde(default)]
    pub copilots: Vec<i64>,
}

impl AudienceConfig {
    pub fn pools(&self) -> AudiencePools {
        AudiencePools {
            managers: self.managers.clone(),
            copilots: self.copilots.clone(),
        }
    }
}

/// Role channel message rendering
#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    /// Base for project links in summaries; the project id is appended
    #[serde(default = "default_project_url")]
    pub project_url: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            project_url: default_project_url(),
        }
    }
}

fn default_project_url() -> String {
    "http://localhost:3000/projects".to_string()
}

impl HeraldConfig {
    /// Load configuration from the default path or HERALD_CONFIG env var,
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("HERALD_CONFIG").unwrap_or_else(|_| "config/herald.toml".to_string());

        let mut config = Self::load_file(&config_path)?;
        config.apply_env(|var| env::var(var).ok())?;
        config.validate()?;

        info!(
            source_stream = %config.broker.source_stream,
            consumer_group = %config.broker.consumer_group,
            repost_interval_ms = config.repost.interval_ms,
            managers = config.audience.managers.len(),
            copilots = config.audience.copilots.len(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Load configuration from a specific path without environment overrides.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse TOML content after substituting `${VAR}` placeholders.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);
        debug!("Parsing TOML configuration");
        Ok(toml::from_str(&content)?)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |target: &mut String, var: &str| {
            if let Some(value) = lookup(var) {
                *target = value;
            }
        };

        set(&mut self.broker.url, "REDIS_URL");
        set(&mut self.broker.source_stream, "HERALD_SOURCE_STREAM");
        set(&mut self.broker.consumer_group, "HERALD_CONSUMER_GROUP");
        set(&mut self.broker.dlq_stream, "HERALD_DLQ_STREAM");
        set(&mut self.api.projects_url, "HERALD_PROJECTS_API_URL");
        set(&mut self.api.users_url, "HERALD_USERS_API_URL");
        set(&mut self.slack.project_url, "HERALD_PROJECT_URL");
        set(&mut self.destinations.general_exchange, "HERALD_GENERAL_EXCHANGE");
        set(&mut self.destinations.role_exchange, "HERALD_ROLE_EXCHANGE");
        set(&mut self.destinations.delayed_exchange, "HERALD_DELAYED_EXCHANGE");

        if let Some(name) = lookup("HERALD_WORKER_NAME") {
            self.broker.worker_name = Some(name);
        }
        if let Some(token) = lookup("HERALD_API_TOKEN") {
            self.api.token = Some(token);
        }

        if let Some(v) = parse_env(&lookup, "HERALD_PREFETCH")? {
            self.broker.prefetch = v;
        }
        if let Some(v) = parse_env(&lookup, "HERALD_MAX_DELIVERIES")? {
            self.broker.max_deliveries = v;
        }
        if let Some(v) = parse_env(&lookup, "HERALD_REPOST_INTERVAL_MS")? {
            self.repost.interval_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "HERALD_API_TIMEOUT_MS")? {
            self.api.timeout_ms = v;
        }
        if let Some(v) = parse_env(&lookup, "HERALD_API_RETRIES")? {
            self.api.retries = v;
        }
        if let Some(ids) = parse_id_list(&lookup, "HERALD_MANAGER_IDS")? {
            self.audience.managers = ids;
        }
        if let Some(ids) = parse_id_list(&lookup, "HERALD_COPILOT_IDS")? {
            self.audience.copilots = ids;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, url) in [
            ("api.projects_url", &self.api.projects_url),
            ("api.users_url", &self.api.users_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::ValidationError(format!(
                    "{} must start with http:// or https://",
                    name
                )));
            }
            if url.contains("${") {
                return Err(ConfigError::ValidationError(format!(
                    "{} contains an unsubstituted environment variable",
                    name
                )));
            }
        }

        if self.repost.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "repost.interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.broker.prefetch == 0 {
            return Err(ConfigError::ValidationError(
                "broker.prefetch must be greater than zero".to_string(),
            ));
        }

        let d = &self.destinations;
        for (name, value) in [
            ("destinations.general_exchange", &d.general_exchange),
            ("destinations.general_routing_key", &d.general_routing_key),
            ("destinations.role_exchange", &d.role_exchange),
            ("destinations.delayed_exchange", &d.delayed_exchange),
            ("destinations.manager_routing_key", &d.manager_routing_key),
            ("destinations.copilot_routing_key", &d.copilot_routing_key),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!("{} is empty", name)));
            }
        }

        if d.manager_routing_key == d.copilot_routing_key {
            return Err(ConfigError::ValidationError(
                "manager and copilot routing keys must differ".to_string(),
            ));
        }

        Ok(())
    }

    /// Consumer name for this worker: configured, else hostname, else a UUID.
    pub fn worker_name(&self) -> String {
        if let Some(name) = &self.broker.worker_name {
            return name.clone();
        }

        if let Ok(hostname) = hostname::get() {
            if let Some(name) = hostname.to_str() {
                return format!("worker-{}", name);
            }
        }

        format!("worker-{}", uuid::Uuid::new_v4())
    }
}

fn parse_env<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
    }
}

fn parse_id_list<F>(lookup: &F, var: &str) -> Result<Option<Vec<i64>>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };

    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>().map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value: value.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex is valid");

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("HERALD_TEST_SUBST", "substituted_value");
        let input = "url = \"${HERALD_TEST_SUBST}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("HERALD_TEST_SUBST");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${HERALD_NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"${HERALD_NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_default_config() {
        let config = HeraldConfig::default();
        assert_eq!(config.broker.url, "redis://localhost:6379");
        assert_eq!(config.broker.source_stream, "herald:events");
        assert_eq!(config.broker.consumer_group, "herald_workers");
        assert_eq!(config.repost.interval(), Duration::from_secs(10));
        assert_eq!(config.api.timeout_ms, 10000);
        assert!(config.audience.managers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sections() {
        let config = HeraldConfig::parse(
            r#"
            [broker]
            prefetch = 4

            [repost]
            interval_ms = 2500

            [destinations]
            copilot_routing_key = "slack.copilots"

            [audience]
            managers = [1, 2]
            copilots = [3]
        "#,
        )
        .unwrap();

        assert_eq!(config.broker.prefetch, 4);
        assert_eq!(config.repost.interval_ms, 2500);
        assert_eq!(config.destinations.copilot_routing_key, "slack.copilots");
        assert_eq!(config.destinations.manager_routing_key, "notifications.manager");
        assert_eq!(config.audience.pools().reviewers(), vec![1, 2, 3]);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = HeraldConfig::default();
        config
            .apply_env(lookup_from(&[
                ("REDIS_URL", "redis://cache:6379"),
                ("HERALD_REPOST_INTERVAL_MS", "500"),
                ("HERALD_MANAGER_IDS", "10, 11,"),
                ("HERALD_COPILOT_IDS", "12"),
                ("HERALD_WORKER_NAME", "w1"),
            ]))
            .unwrap();

        assert_eq!(config.broker.url, "redis://cache:6379");
        assert_eq!(config.repost.interval_ms, 500);
        assert_eq!(config.audience.managers, vec![10, 11]);
        assert_eq!(config.audience.copilots, vec![12]);
        assert_eq!(config.worker_name(), "w1");
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = HeraldConfig::default();
        let err = config
            .apply_env(lookup_from(&[("HERALD_COPILOT_IDS", "12,abc")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref var, .. } if var == "HERALD_COPILOT_IDS"));

        let err = config
            .apply_env(lookup_from(&[("HERALD_PREFETCH", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_validation_invalid_url() {
        let mut config = HeraldConfig::default();
        config.api.projects_url = "not-a-url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_interval() {
        let mut config = HeraldConfig::default();
        config.repost.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_same_role_keys() {
        let mut config = HeraldConfig::default();
        config.destinations.copilot_routing_key = config.destinations.manager_routing_key.clone();
        assert!(config.validate().is_err());
    }
}
