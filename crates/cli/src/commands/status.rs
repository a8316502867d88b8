//! Status summary command

use anyhow::Result;
use autoscaler_lib::{DrainState, ScalerStatus};
use chrono::Utc;
use colored::Colorize;

use crate::client::ApiClient;
use crate::output::{
    color_state, format_age, format_bytes, format_cpu, format_timestamp, print_json,
    print_success, print_warning, OutputFormat,
};

/// Show the autoscaler's latest status summary
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status = client.status().await?;

    match format {
        OutputFormat::Json => print_json(&status)?,
        OutputFormat::Table => print_summary(&status),
    }

    Ok(())
}

fn print_summary(status: &ScalerStatus) {
    let now = Utc::now();

    println!("{}", "Fleet Autoscaler Status".bold());
    println!("{}", "=".repeat(50));
    println!("Cluster:        {}", status.cluster_id.cyan());
    println!("Policy:         {}", status.policy);
    match &status.last_tick_at {
        Some(at) => println!(
            "Last tick:      {} ({} ago)",
            format_timestamp(at),
            format_age(at, &now)
        ),
        None => println!("Last tick:      {}", "never".yellow()),
    }
    println!();

    println!("{}", "Fleet".bold());
    println!("{}", "-".repeat(50));
    println!("Nodes:          {}", status.fleet_size);
    println!("In flight:      {}", status.in_flight);
    println!(
        "Pending:        {} cpu / {} memory",
        format_cpu(status.pending_cpu_millis),
        format_bytes(status.pending_memory_bytes)
    );
    if status.hourly_cost > 0.0 {
        println!("Run rate:       {:.2}/h", status.hourly_cost);
    }
    for (instance_type, until) in &status.launch_backoff {
        println!(
            "Backed off:     {} until {}",
            instance_type.yellow(),
            format_timestamp(until)
        );
    }
    println!();

    println!("{}", "Drains".bold());
    println!("{}", "-".repeat(50));
    for state in DrainState::ALL {
        let count = status.drains_in(state);
        if count > 0 {
            println!("{:<15} {}", format!("{}:", color_state(state.as_str())), count);
        }
    }
    println!(
        "Totals:         {} launched, {} drained, {} terminated",
        status.launched_total, status.drained_total, status.terminated_total
    );
    println!();

    if !status.last_actions.is_empty() {
        println!("{}", "Last actions".bold());
        println!("{}", "-".repeat(50));
        for action in &status.last_actions {
            println!("  {}", action);
        }
        println!();
    }

    match &status.last_error {
        Some(error) => print_warning(&format!(
            "Last error at {}: {}",
            format_timestamp(&error.at),
            error.message
        )),
        None => print_success("No errors recorded"),
    }
}
