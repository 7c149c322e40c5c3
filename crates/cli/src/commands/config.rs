use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use toml::Value;

use vigil_core::config::{AppConfig, LoadOptions};

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_key: Option<&str>| {
        field_source(key_path, env_key, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    lines.push(render_line(
        "database.url",
        &config.database.url,
        source("database.url", Some("VIGIL_DATABASE_URL")),
    ));
    lines.push(render_line(
        "database.max_connections",
        &config.database.max_connections.to_string(),
        source("database.max_connections", None),
    ));
    lines.push(render_line(
        "database.timeout_secs",
        &config.database.timeout_secs.to_string(),
        source("database.timeout_secs", None),
    ));

    lines.push(render_line(
        "webhook.endpoint_url",
        config.webhook.endpoint_url.as_deref().unwrap_or("<unset>"),
        source("webhook.endpoint_url", Some("VIGIL_WEBHOOK_URL")),
    ));
    let webhook_secret = if config.webhook.secret.is_some() { "<redacted>" } else { "<unset>" };
    lines.push(render_line(
        "webhook.secret",
        webhook_secret,
        source("webhook.secret", Some("VIGIL_WEBHOOK_SECRET")),
    ));
    lines.push(render_line(
        "webhook.timeout_secs",
        &config.webhook.timeout_secs.to_string(),
        source("webhook.timeout_secs", None),
    ));
    lines.push(render_line(
        "webhook.max_attempts",
        &config.webhook.max_attempts.to_string(),
        source("webhook.max_attempts", None),
    ));
    lines.push(render_line(
        "webhook.base_delay_secs",
        &config.webhook.base_delay_secs.to_string(),
        source("webhook.base_delay_secs", None),
    ));
    lines.push(render_line(
        "webhook.max_delay_secs",
        &config.webhook.max_delay_secs.to_string(),
        source("webhook.max_delay_secs", None),
    ));
    lines.push(render_line(
        "webhook.batch_size",
        &config.webhook.batch_size.to_string(),
        source("webhook.batch_size", None),
    ));

    lines.push(render_line(
        "scheduler.enabled",
        &config.scheduler.enabled.to_string(),
        source("scheduler.enabled", Some("VIGIL_SCHEDULER_ENABLED")),
    ));
    lines.push(render_line(
        "scheduler.evaluate_interval_secs",
        &config.scheduler.evaluate_interval_secs.to_string(),
        source("scheduler.evaluate_interval_secs", None),
    ));
    lines.push(render_line(
        "scheduler.dispatch_interval_secs",
        &config.scheduler.dispatch_interval_secs.to_string(),
        source("scheduler.dispatch_interval_secs", None),
    ));
    lines.push(render_line(
        "scheduler.lease_ttl_secs",
        &config.scheduler.lease_ttl_secs.to_string(),
        source("scheduler.lease_ttl_secs", None),
    ));

    lines.push(render_line(
        "server.bind_address",
        &config.server.bind_address,
        source("server.bind_address", None),
    ));
    lines.push(render_line("server.port", &config.server.port.to_string(), source("server.port", None)));
    lines.push(render_line(
        "server.graceful_shutdown_secs",
        &config.server.graceful_shutdown_secs.to_string(),
        source("server.graceful_shutdown_secs", None),
    ));

    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        source("logging.level", Some("VIGIL_LOG_LEVEL")),
    ));
    lines.push(render_line(
        "logging.format",
        &format!("{:?}", config.logging.format),
        source("logging.format", Some("VIGIL_LOG_FORMAT")),
    ));

    lines.push(render_line(
        "policies",
        &format!("{} configured", config.policies.len()),
        source("policies", None),
    ));

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    if let Ok(env_path) = env::var("VIGIL_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Some(path);
        }
    }

    let root = PathBuf::from("vigil.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/vigil.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
