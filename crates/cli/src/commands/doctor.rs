use serde::Serialize;

use vigil_core::config::{AppConfig, LoadOptions};
use vigil_db::connect;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_webhook_readiness(&config));
            checks.push(check_policy_catalog(&config));
            checks.push(check_database_connectivity(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.push(skipped("webhook_readiness"));
            checks.push(skipped("policy_catalog"));
            checks.push(skipped("database_connectivity"));
        }
    }

    let all_ok = checks.iter().all(|check| check.status != CheckStatus::Fail);
    let overall_status = if all_ok { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_ok {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn skipped(name: &'static str) -> DoctorCheck {
    DoctorCheck {
        name,
        status: CheckStatus::Skipped,
        details: "skipped because configuration did not load".to_string(),
    }
}

fn check_webhook_readiness(config: &AppConfig) -> DoctorCheck {
    let details = match (&config.webhook.endpoint_url, &config.webhook.secret) {
        (Some(url), Some(_)) => format!("signed deliveries will be sent to `{url}`"),
        (Some(url), None) => format!("unsigned deliveries will be sent to `{url}`"),
        (None, _) => "no endpoint configured; dispatch ticks are skipped".to_string(),
    };
    DoctorCheck { name: "webhook_readiness", status: CheckStatus::Pass, details }
}

fn check_policy_catalog(config: &AppConfig) -> DoctorCheck {
    let enabled = config.policies.iter().filter(|policy| policy.enabled).count();
    DoctorCheck {
        name: "policy_catalog",
        status: CheckStatus::Pass,
        details: format!("{enabled} enabled of {} configured policies", config.policies.len()),
    }
}

fn check_database_connectivity(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let result = runtime.block_on(async {
        let pool = connect(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;

        pool.close().await;
        Ok::<(), String>(())
    });

    match result {
        Ok(()) => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        },
        Err(error) => {
            DoctorCheck { name: "database_connectivity", status: CheckStatus::Fail, details: error }
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
