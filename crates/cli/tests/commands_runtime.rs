use std::env;
use std::sync::{Mutex, OnceLock};

use serde_json::Value;
use vigil_cli::commands::{dispatch, doctor, evaluate, migrate, replay_dead};

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&[("VIGIL_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_on_invalid_env_override() {
    with_env(
        &[
            ("VIGIL_DATABASE_URL", "sqlite::memory:"),
            ("VIGIL_SCHEDULER_ENABLED", "maybe"),
        ],
        || {
            let result = migrate::run();
            assert_eq!(result.exit_code, 2, "expected config validation failure code");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "migrate");
            assert_eq!(payload["status"], "error");
            assert_eq!(payload["error_class"], "config_validation");
        },
    );
}

#[test]
fn migrate_returns_connectivity_failure_for_unreachable_database() {
    with_env(
        &[("VIGIL_DATABASE_URL", "sqlite:///nonexistent-dir/deep/vigil.db")],
        || {
            let result = migrate::run();
            assert_eq!(result.exit_code, 4, "expected database connectivity failure code");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "migrate");
            assert_eq!(payload["error_class"], "db_connectivity");
        },
    );
}

#[test]
fn evaluate_returns_connectivity_failure_for_unreachable_database() {
    with_env(
        &[("VIGIL_DATABASE_URL", "sqlite:///nonexistent-dir/deep/vigil.db")],
        || {
            let result = evaluate::run();
            assert_eq!(result.exit_code, 4, "expected database connectivity failure code");

            let payload = parse_payload(&result.output);
            assert_eq!(payload["command"], "evaluate");
            assert_eq!(payload["error_class"], "db_connectivity");
        },
    );
}

#[test]
fn evaluate_with_no_policies_reports_zero_activity() {
    with_env(&[("VIGIL_DATABASE_URL", "sqlite::memory:")], || {
        let result = evaluate::run();
        assert_eq!(result.exit_code, 0, "expected successful evaluate pass");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "evaluate");
        assert_eq!(payload["status"], "ok");

        let message = payload["message"].as_str().unwrap_or("");
        assert!(message.contains("evaluated 0 policies"), "unexpected message: {message}");
    });
}

#[test]
fn dispatch_without_endpoint_reports_nothing_to_do() {
    with_env(&[("VIGIL_DATABASE_URL", "sqlite::memory:")], || {
        let result = dispatch::run();
        assert_eq!(result.exit_code, 0, "expected successful dispatch no-op");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "dispatch");
        assert_eq!(payload["status"], "ok");

        let message = payload["message"].as_str().unwrap_or("");
        assert!(message.contains("no webhook endpoint configured"), "unexpected message: {message}");
    });
}

#[test]
fn replay_dead_with_empty_outbox_replays_nothing() {
    with_env(&[("VIGIL_DATABASE_URL", "sqlite::memory:")], || {
        let result = replay_dead::run(10);
        assert_eq!(result.exit_code, 0, "expected successful replay pass");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "replay-dead");
        assert_eq!(payload["status"], "ok");
        assert_eq!(payload["message"], "replayed 0 dead notifications");
    });
}

#[test]
fn replay_dead_rejects_a_zero_limit() {
    with_env(&[("VIGIL_DATABASE_URL", "sqlite::memory:")], || {
        let result = replay_dead::run(0);
        assert_eq!(result.exit_code, 2, "expected invalid argument failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "replay-dead");
        assert_eq!(payload["error_class"], "invalid_argument");
    });
}

#[test]
fn doctor_json_reports_pass_with_valid_env() {
    with_env(&[("VIGIL_DATABASE_URL", "sqlite::memory:")], || {
        let output = doctor::run(true);
        let payload: Value =
            serde_json::from_str(&output).expect("doctor output should be valid JSON");

        assert_eq!(payload["overall_status"], "pass");
        let checks = payload["checks"].as_array().expect("checks should be an array");
        assert!(checks.iter().any(|check| check["name"] == "database_connectivity"));
        assert!(checks.iter().any(|check| check["name"] == "webhook_readiness"));
    });
}

#[test]
fn doctor_human_output_marks_failed_config() {
    with_env(&[("VIGIL_SCHEDULER_ENABLED", "maybe")], || {
        let output = doctor::run(false);

        assert!(output.contains("one or more readiness checks failed"), "output: {output}");
        assert!(output.contains("- [fail] config_validation"), "output: {output}");
        assert!(output.contains("- [skip] database_connectivity"), "output: {output}");
    });
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "VIGIL_DATABASE_URL",
        "VIGIL_LOG_LEVEL",
        "VIGIL_LOG_FORMAT",
        "VIGIL_WEBHOOK_URL",
        "VIGIL_WEBHOOK_SECRET",
        "VIGIL_SCHEDULER_ENABLED",
        "VIGIL_CONFIG",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
