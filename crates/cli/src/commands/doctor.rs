use salesrag_core::config::{AppConfig, LoadOptions};
use salesrag_db::connect_with_settings;
use serde::Serialize;

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
            checks.push(check_slack_token(&config));
            checks.push(check_crm_entities_file(&config));
            checks.push(check_database_connectivity(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["slack_token_readiness", "crm_entities_file", "database_connectivity"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_ok =
        checks.iter().all(|check| check.status != CheckStatus::Fail);
    let overall_status = if all_ok { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_ok {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_slack_token(config: &AppConfig) -> DoctorCheck {
    use secrecy::ExposeSecret;

    if config.slack.bot_token.expose_secret().is_empty() {
        return DoctorCheck {
            name: "slack_token_readiness",
            status: CheckStatus::Fail,
            details: "slack.bot_token is empty; set SALESRAG_SLACK_BOT_TOKEN".to_string(),
        };
    }
    DoctorCheck {
        name: "slack_token_readiness",
        status: CheckStatus::Pass,
        details: "token format validated by config contract".to_string(),
    }
}

fn check_crm_entities_file(config: &AppConfig) -> DoctorCheck {
    if !config.crm.enabled {
        return DoctorCheck {
            name: "crm_entities_file",
            status: CheckStatus::Skipped,
            details: "crm ingestion disabled".to_string(),
        };
    }

    // Validation guarantees the path is set when crm is enabled.
    match &config.crm.entities_file {
        Some(path) if path.exists() => DoctorCheck {
            name: "crm_entities_file",
            status: CheckStatus::Pass,
            details: format!("entities file present at `{}`", path.display()),
        },
        Some(path) => DoctorCheck {
            name: "crm_entities_file",
            status: CheckStatus::Fail,
            details: format!("entities file not found at `{}`", path.display()),
        },
        None => DoctorCheck {
            name: "crm_entities_file",
            status: CheckStatus::Fail,
            details: "crm.enabled is set but crm.entities_file is missing".to_string(),
        },
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
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
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
