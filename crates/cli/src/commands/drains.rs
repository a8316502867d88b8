//! Drain listing command

use anyhow::Result;
use autoscaler_lib::{DrainState, NodeDrainStatus};
use chrono::Utc;
use colored::Colorize;
use std::collections::BTreeMap;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_state, format_age, print_json, print_table, OutputFormat};

/// Row for drains table
#[derive(Tabled)]
struct DrainRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Type")]
    instance_type: String,
    #[tabled(rename = "Reason")]
    reason: String,
    #[tabled(rename = "Age")]
    age: String,
    #[tabled(rename = "In State")]
    in_state: String,
    #[tabled(rename = "Blocked Pods")]
    blocked: String,
}

/// Keep drains in `state`, or every drain when no state is given
fn filter_drains(
    nodes: BTreeMap<String, NodeDrainStatus>,
    state: Option<DrainState>,
) -> BTreeMap<String, NodeDrainStatus> {
    nodes
        .into_iter()
        .filter(|(_, drain)| state.map_or(true, |s| drain.state == s))
        .collect()
}

/// List nodes the autoscaler is draining
pub async fn list_drains(
    client: &ApiClient,
    state: Option<DrainState>,
    format: OutputFormat,
) -> Result<()> {
    let status = client.status().await?;
    let drains = filter_drains(status.nodes, state);

    if format == OutputFormat::Json {
        return print_json(&drains);
    }

    let now = Utc::now();
    let rows: Vec<DrainRow> = drains
        .iter()
        .map(|(node, drain)| {
            let mut state = color_state(drain.state.as_str());
            if drain.forced {
                state = format!("{} {}", state, "(forced)".yellow());
            }
            DrainRow {
                node: node.clone(),
                state,
                instance_type: drain.instance_type.clone(),
                reason: drain.reason.clone(),
                age: format_age(&drain.started_at, &now),
                in_state: format_age(&drain.since, &now),
                blocked: if drain.blocked_pods.is_empty() {
                    "-".to_string()
                } else {
                    drain.blocked_pods.join(", ")
                },
            }
        })
        .collect();

    print_table(&rows);

    for (node, drain) in &drains {
        if let Some(error) = &drain.last_error {
            println!("{} {}: {}", "✗".red().bold(), node, error);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoscaler_lib::DrainRecord;

    #[test]
    fn test_filter_drains_by_state() {
        let now = Utc::now();
        let mut nodes = BTreeMap::new();
        let cordoned = DrainRecord::new("node-a", "i-a", "m5.xlarge", "idle for 900s", now);
        let mut failed = DrainRecord::new("node-b", "i-b", "m5.xlarge", "idle for 900s", now);
        failed.state = DrainState::Failed;
        nodes.insert("node-a".to_string(), NodeDrainStatus::from(&cordoned));
        nodes.insert("node-b".to_string(), NodeDrainStatus::from(&failed));

        let only_failed = filter_drains(nodes.clone(), Some(DrainState::Failed));
        assert_eq!(only_failed.keys().collect::<Vec<_>>(), vec!["node-b"]);
        assert_eq!(filter_drains(nodes, None).len(), 2);
    }
}
