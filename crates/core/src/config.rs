use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::alert::{AlertPolicy, AlertRule, PolicyId, Severity};
use crate::domain::run::SourceName;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub webhook: WebhookConfig,
    pub scheduler: SchedulerConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub policies: Vec<AlertPolicy>,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub endpoint_url: Option<String>,
    /// Absent secret means unsigned deliveries; production configures one.
    pub secret: Option<SecretString>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub batch_size: u32,
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub evaluate_interval_secs: u64,
    pub dispatch_interval_secs: u64,
    pub lease_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub webhook_endpoint_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub scheduler_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://vigil.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            webhook: WebhookConfig {
                endpoint_url: None,
                secret: None,
                timeout_secs: 10,
                max_attempts: 8,
                base_delay_secs: 30,
                max_delay_secs: 900,
                batch_size: 25,
            },
            scheduler: SchedulerConfig {
                enabled: true,
                evaluate_interval_secs: 60,
                dispatch_interval_secs: 30,
                lease_ttl_secs: 120,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            policies: Vec::new(),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("vigil.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(webhook) = patch.webhook {
            if let Some(endpoint_url) = webhook.endpoint_url {
                self.webhook.endpoint_url = Some(endpoint_url);
            }
            if let Some(webhook_secret_value) = webhook.secret {
                self.webhook.secret = Some(webhook_secret_value.into());
            }
            if let Some(timeout_secs) = webhook.timeout_secs {
                self.webhook.timeout_secs = timeout_secs;
            }
            if let Some(max_attempts) = webhook.max_attempts {
                self.webhook.max_attempts = max_attempts;
            }
            if let Some(base_delay_secs) = webhook.base_delay_secs {
                self.webhook.base_delay_secs = base_delay_secs;
            }
            if let Some(max_delay_secs) = webhook.max_delay_secs {
                self.webhook.max_delay_secs = max_delay_secs;
            }
            if let Some(batch_size) = webhook.batch_size {
                self.webhook.batch_size = batch_size;
            }
        }

        if let Some(scheduler) = patch.scheduler {
            if let Some(enabled) = scheduler.enabled {
                self.scheduler.enabled = enabled;
            }
            if let Some(evaluate_interval_secs) = scheduler.evaluate_interval_secs {
                self.scheduler.evaluate_interval_secs = evaluate_interval_secs;
            }
            if let Some(dispatch_interval_secs) = scheduler.dispatch_interval_secs {
                self.scheduler.dispatch_interval_secs = dispatch_interval_secs;
            }
            if let Some(lease_ttl_secs) = scheduler.lease_ttl_secs {
                self.scheduler.lease_ttl_secs = lease_ttl_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format.parse()?;
            }
        }

        if let Some(policies) = patch.policies {
            self.policies =
                policies.into_iter().map(PolicyPatch::into_policy).collect::<Result<_, _>>()?;
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("VIGIL_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(level) = env::var("VIGIL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("VIGIL_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Ok(endpoint_url) = env::var("VIGIL_WEBHOOK_URL") {
            self.webhook.endpoint_url = Some(endpoint_url);
        }
        if let Ok(webhook_secret_value) = env::var("VIGIL_WEBHOOK_SECRET") {
            self.webhook.secret = Some(webhook_secret_value.into());
        }
        if let Ok(enabled) = env::var("VIGIL_SCHEDULER_ENABLED") {
            self.scheduler.enabled = match enabled.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                other => {
                    return Err(ConfigError::InvalidEnvOverride {
                        key: "VIGIL_SCHEDULER_ENABLED".to_string(),
                        value: other.to_string(),
                    })
                }
            };
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(url) = overrides.database_url {
            self.database.url = url;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        if let Some(endpoint_url) = overrides.webhook_endpoint_url {
            self.webhook.endpoint_url = Some(endpoint_url);
        }
        if let Some(webhook_secret_value) = overrides.webhook_secret {
            self.webhook.secret = Some(webhook_secret_value.into());
        }
        if let Some(enabled) = overrides.scheduler_enabled {
            self.scheduler.enabled = enabled;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Validation("database.url must not be empty".to_string()));
        }
        if self.webhook.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "webhook.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.webhook.batch_size == 0 {
            return Err(ConfigError::Validation(
                "webhook.batch_size must be at least 1".to_string(),
            ));
        }
        if self.webhook.base_delay_secs == 0 {
            return Err(ConfigError::Validation(
                "webhook.base_delay_secs must be at least 1".to_string(),
            ));
        }
        if self.webhook.max_delay_secs < self.webhook.base_delay_secs {
            return Err(ConfigError::Validation(
                "webhook.max_delay_secs must not be below webhook.base_delay_secs".to_string(),
            ));
        }
        if self.webhook.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "webhook.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.scheduler.enabled {
            let longest_interval = self
                .scheduler
                .evaluate_interval_secs
                .max(self.scheduler.dispatch_interval_secs);
            if longest_interval == 0 {
                return Err(ConfigError::Validation(
                    "scheduler intervals must be at least 1 second".to_string(),
                ));
            }
            // Lease expiry must outlast a slow tick, or two instances can
            // both believe they hold the lease.
            if self.scheduler.lease_ttl_secs <= longest_interval {
                return Err(ConfigError::Validation(format!(
                    "scheduler.lease_ttl_secs ({}) must exceed the longest tick interval ({})",
                    self.scheduler.lease_ttl_secs, longest_interval
                )));
            }
        }

        let mut seen_ids = Vec::with_capacity(self.policies.len());
        for policy in &self.policies {
            if seen_ids.contains(&&policy.id.0) {
                return Err(ConfigError::Validation(format!(
                    "duplicate policy id `{}`",
                    policy.id.0
                )));
            }
            seen_ids.push(&policy.id.0);
            validate_policy(policy)?;
        }

        Ok(())
    }

    pub fn policy(&self, id: &PolicyId) -> Option<&AlertPolicy> {
        self.policies.iter().find(|policy| &policy.id == id)
    }
}

fn validate_policy(policy: &AlertPolicy) -> Result<(), ConfigError> {
    if policy.id.0.trim().is_empty() {
        return Err(ConfigError::Validation("policy id must not be empty".to_string()));
    }
    if policy.source_name.0.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "policy `{}` must name a source",
            policy.id.0
        )));
    }
    if policy.pending_observations == 0 {
        return Err(ConfigError::Validation(format!(
            "policy `{}`: pending_observations must be at least 1",
            policy.id.0
        )));
    }
    match &policy.rule {
        AlertRule::ConsecutiveFailures { count } => {
            if *count == 0 {
                return Err(ConfigError::Validation(format!(
                    "policy `{}`: count must be at least 1",
                    policy.id.0
                )));
            }
        }
        AlertRule::FailureCount { window_runs, count } => {
            if *count == 0 || *window_runs < *count {
                return Err(ConfigError::Validation(format!(
                    "policy `{}`: requires 1 <= count <= window_runs",
                    policy.id.0
                )));
            }
        }
        AlertRule::FailureRatio { window_runs, min_runs, ratio } => {
            if *window_runs == 0 || *min_runs == 0 || *min_runs > *window_runs {
                return Err(ConfigError::Validation(format!(
                    "policy `{}`: requires 1 <= min_runs <= window_runs",
                    policy.id.0
                )));
            }
            if !(*ratio > 0.0 && *ratio <= 1.0) {
                return Err(ConfigError::Validation(format!(
                    "policy `{}`: ratio must be within (0, 1]",
                    policy.id.0
                )));
            }
        }
    }
    Ok(())
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    if let Ok(env_path) = env::var("VIGIL_CONFIG") {
        let path = PathBuf::from(env_path);
        return path.exists().then_some(path);
    }
    let default = PathBuf::from("vigil.toml");
    default.exists().then_some(default)
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    toml::from_str(&raw)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    webhook: Option<WebhookPatch>,
    scheduler: Option<SchedulerPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
    policies: Option<Vec<PolicyPatch>>,
}

#[derive(Debug, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WebhookPatch {
    endpoint_url: Option<String>,
    secret: Option<String>,
    timeout_secs: Option<u64>,
    max_attempts: Option<u32>,
    base_delay_secs: Option<u64>,
    max_delay_secs: Option<u64>,
    batch_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SchedulerPatch {
    enabled: Option<bool>,
    evaluate_interval_secs: Option<u64>,
    dispatch_interval_secs: Option<u64>,
    lease_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PolicyPatch {
    id: String,
    name: Option<String>,
    source: String,
    severity: String,
    kind: String,
    count: Option<u32>,
    window_runs: Option<u32>,
    min_runs: Option<u32>,
    ratio: Option<f64>,
    pending_observations: Option<u32>,
    enabled: Option<bool>,
}

impl PolicyPatch {
    fn into_policy(self) -> Result<AlertPolicy, ConfigError> {
        let severity = Severity::parse(&self.severity).ok_or_else(|| {
            ConfigError::Validation(format!(
                "policy `{}`: unsupported severity `{}` (expected high|medium|low)",
                self.id, self.severity
            ))
        })?;

        let rule = match self.kind.trim().to_ascii_lowercase().as_str() {
            "consecutive_failures" => AlertRule::ConsecutiveFailures {
                count: self.count.ok_or_else(|| missing_field(&self.id, "count"))?,
            },
            "failure_count" => AlertRule::FailureCount {
                window_runs: self
                    .window_runs
                    .ok_or_else(|| missing_field(&self.id, "window_runs"))?,
                count: self.count.ok_or_else(|| missing_field(&self.id, "count"))?,
            },
            "failure_ratio" => AlertRule::FailureRatio {
                window_runs: self
                    .window_runs
                    .ok_or_else(|| missing_field(&self.id, "window_runs"))?,
                min_runs: self.min_runs.ok_or_else(|| missing_field(&self.id, "min_runs"))?,
                ratio: self.ratio.ok_or_else(|| missing_field(&self.id, "ratio"))?,
            },
            other => {
                return Err(ConfigError::Validation(format!(
                    "policy `{}`: unsupported rule kind `{other}`",
                    self.id
                )))
            }
        };

        Ok(AlertPolicy {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: PolicyId(self.id),
            source_name: SourceName(self.source),
            rule,
            severity,
            pending_observations: self.pending_observations.unwrap_or(2),
            enabled: self.enabled.unwrap_or(true),
        })
    }
}

fn missing_field(policy_id: &str, field: &str) -> ConfigError {
    ConfigError::Validation(format!("policy `{policy_id}`: missing required field `{field}`"))
}
