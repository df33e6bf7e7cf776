use chrono::{DateTime, Local};
use colored::*;
use serde_json::{json, Value};

use crate::connectivity::{ClientAuthRequirement, ServerConnectivityInfo};
use crate::scheduler::{ScanJob, ScanOutcome};

pub fn print_start_banner(start: DateTime<Local>) {
    println!("{}", "#".repeat(75));
    println!(
        " {} version {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    println!(" ({:x} {})", start.timestamp(), start.format("%Y-%m-%d %H:%M:%S"));
    println!();
    println!(" TLS server configuration auditing. USE IT AT YOUR OWN RISK!");
    println!();
    println!("{}", "#".repeat(75));
    println!();
    println!(" Using rustls v0.21");
    println!(" on {} {}", std::env::consts::OS, std::env::consts::ARCH);
    println!();
}

pub fn print_end_banner(start: DateTime<Local>, servers: usize) {
    let end_time = Local::now();
    let duration = end_time.signed_duration_since(start).num_seconds();

    println!();
    println!("{}", "#".repeat(75));
    println!(
        "Done {:<28}[ {}s] -->> {} server(s) <<--",
        end_time.format("%Y-%m-%d %H:%M:%S"),
        duration,
        servers
    );
    println!();
}

pub fn print_server_header(info: &ServerConnectivityInfo, rdns: Option<&str>) {
    let start_line = format!("Start {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    let target = format!(
        "{}:{} ({})",
        info.location.ip_address, info.location.port, info.location.hostname
    );
    println!("{:28} -->> {} <<--", start_line, target.green());
    println!("{}", "#".repeat(75));
    println!();
    if let Some(rdns) = rdns {
        println!(" rDNS ({}): {}", info.location.ip_address, rdns);
    }
    for line in connectivity_lines(info) {
        println!("{line}");
    }
    println!();
}

pub fn connectivity_lines(info: &ServerConnectivityInfo) -> Vec<String> {
    let client_auth = match info.client_auth {
        ClientAuthRequirement::None => "none".normal(),
        ClientAuthRequirement::Optional => "optional".yellow(),
        ClientAuthRequirement::Required if info.credentials.is_some() => {
            "required (credentials supplied)".green()
        }
        ClientAuthRequirement::Required => "required (no credentials supplied)".red(),
    };

    vec![
        format!(
            " {:<32} {}",
            "Highest protocol version",
            info.highest_version
        ),
        format!(
            " {:<32} {}",
            "Working cipher suite",
            info.cipher_suite
                .map(|c| c.to_string())
                .unwrap_or_else(|| "--".to_string())
        ),
        format!(
            " {:<32} {}",
            "Server name (SNI)",
            info.location.server_name().as_deref().unwrap_or("--")
        ),
        format!(" {:<32} {}", "Client authentication", client_auth),
    ]
}

pub fn print_connectivity_failure(target: &str, error: &dyn std::fmt::Display) {
    println!(
        " {} {} {}",
        "Connectivity failed:".red().bold(),
        target,
        error
    );
    println!();
}

pub fn print_outcome(job: &ScanJob, outcome: &ScanOutcome) {
    match outcome {
        Ok(result) => {
            for line in result.as_text() {
                println!("{line}");
            }
        }
        Err(error) => {
            println!(" {}", job.command.to_string().bold());
            println!(
                "     {} {}: {}",
                "ERROR".red().bold(),
                error.kind,
                error.message
            );
        }
    }
    println!();
}

/// One JSON document for every server and job of a run.
pub fn json_report(
    servers: &[ServerConnectivityInfo],
    failures: &[(String, String)],
    outcomes: &[(ScanJob, ScanOutcome)],
) -> Value {
    let results: Vec<Value> = outcomes
        .iter()
        .map(|(job, outcome)| {
            let mut entry = json!({
                "job_id": job.id,
                "server": format!("{}:{}", job.server_info.location.hostname, job.server_info.location.port),
                "command": job.command,
            });
            match outcome {
                Ok(result) => entry["result"] = result.as_structured(),
                Err(error) => {
                    entry["error"] = json!({ "kind": error.kind, "message": error.message })
                }
            }
            entry
        })
        .collect();

    json!({
        "tool": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "servers": servers,
        "connectivity_failures": failures
            .iter()
            .map(|(target, error)| json!({ "target": target, "error": error }))
            .collect::<Vec<_>>(),
        "results": results,
    })
}
