//! Health and readiness command

use anyhow::Result;
use autoscaler_lib::{ComponentStatus, HealthResponse, ReadinessResponse};
use chrono::Utc;
use colored::Colorize;
use serde::Serialize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{
    color_state, format_age, format_timestamp, print_json, print_table, OutputFormat,
};

/// Row for components table
#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Affected")]
    subjects: String,
}

#[derive(Serialize)]
struct HealthReport {
    health: HealthResponse,
    readiness: ReadinessResponse,
}

fn status_label(status: ComponentStatus) -> &'static str {
    match status {
        ComponentStatus::Healthy => "healthy",
        ComponentStatus::Degraded => "degraded",
        ComponentStatus::Unhealthy => "unhealthy",
    }
}

/// Show component health and readiness
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let (health, readiness) = tokio::try_join!(client.health(), client.readiness())?;

    if format == OutputFormat::Json {
        return print_json(&HealthReport { health, readiness });
    }

    println!(
        "{} {}",
        "Overall:".bold(),
        color_state(status_label(health.status))
    );
    if let Some(at) = health.last_tick_at {
        println!(
            "{} {} ({} ago)",
            "Last tick:".bold(),
            format_timestamp(&at),
            format_age(&at, &Utc::now())
        );
    }
    let ready = if readiness.ready { "ready" } else { "not ready" };
    match &readiness.reason {
        Some(reason) => println!("{} {} ({})", "Readiness:".bold(), color_state(ready), reason),
        None => println!("{} {}", "Readiness:".bold(), color_state(ready)),
    }
    println!();

    let mut rows: Vec<ComponentRow> = health
        .components
        .iter()
        .map(|(name, component)| ComponentRow {
            name: name.clone(),
            status: color_state(status_label(component.status)),
            message: match component.consecutive_failures {
                0 | 1 => component.message.clone().unwrap_or_else(|| "-".to_string()),
                n => format!(
                    "{} ({} in a row)",
                    component.message.as_deref().unwrap_or("-"),
                    n
                ),
            },
            subjects: if component.subjects.is_empty() {
                "-".to_string()
            } else {
                component.subjects.join(", ")
            },
        })
        .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    print_table(&rows);

    Ok(())
}
