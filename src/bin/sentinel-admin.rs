//! One-shot admin CLI talking to a running sentinel server over HTTP.

use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser)]
#[command(name = "sentinel-admin")]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:7420")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Marker {
        #[command(subcommand)]
        action: MarkerAction,
    },
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },
}

#[derive(Subcommand)]
enum MarkerAction {
    Arm {
        account_id: u32,
        reason: String,
        #[arg(long)]
        level: Option<String>,
    },
    Check {
        account_id: u32,
    },
    RemoveAll {
        #[arg(long)]
        confirm: String,
    },
}

#[derive(Subcommand)]
enum RuleAction {
    Test {
        #[arg(value_name = "PATH")]
        path: String,
        #[arg(long)]
        days: Option<u32>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let exit_code = match cli.command {
        Command::Marker { action } => run_marker(&client, &cli.server, action).await,
        Command::Rule { action } => run_rule(&client, &cli.server, action).await,
    };
    std::process::exit(exit_code);
}

async fn run_marker(client: &reqwest::Client, server: &str, action: MarkerAction) -> i32 {
    match action {
        MarkerAction::Arm { account_id, reason, level } => {
            let body = json!({ "account_id": account_id, "reason": reason, "level": level });
            match client.post(format!("{server}/admin/marker/arm")).json(&body).send().await {
                Ok(resp) => match resp.json::<serde_json::Value>().await {
                    Ok(v) => {
                        let status = v["status"].as_str().unwrap_or("error").to_string();
                        println!("{status}");
                        match status.as_str() {
                            "armed" => 0,
                            "degraded" => 1,
                            _ => 2,
                        }
                    }
                    Err(e) => {
                        eprintln!("malformed response: {e}");
                        2
                    }
                },
                Err(e) => {
                    eprintln!("request failed: {e}");
                    2
                }
            }
        }
        MarkerAction::Check { account_id } => {
            match client
                .get(format!("{server}/admin/marker/check"))
                .query(&[("account_id", account_id.to_string())])
                .send()
                .await
            {
                Ok(resp) => match resp.json::<serde_json::Value>().await {
                    Ok(v) => {
                        println!(
                            "{} matched={}",
                            v["state"].as_str().unwrap_or("Unknown"),
                            v["detected_locations"].as_u64().unwrap_or(0)
                        );
                        0
                    }
                    Err(e) => {
                        eprintln!("malformed response: {e}");
                        2
                    }
                },
                Err(e) => {
                    eprintln!("request failed: {e}");
                    2
                }
            }
        }
        MarkerAction::RemoveAll { confirm } => {
            let body = json!({ "confirm": confirm });
            match client.post(format!("{server}/admin/marker/remove-all")).json(&body).send().await {
                Ok(resp) => match resp.json::<serde_json::Value>().await {
                    Ok(v) => {
                        println!("removed={}", v["removed"].as_u64().unwrap_or(0));
                        0
                    }
                    Err(e) => {
                        eprintln!("malformed response: {e}");
                        2
                    }
                },
                Err(e) => {
                    eprintln!("request failed: {e}");
                    2
                }
            }
        }
    }
}

async fn run_rule(client: &reqwest::Client, server: &str, action: RuleAction) -> i32 {
    match action {
        RuleAction::Test { path, days } => {
            // Recording file: a JSON array of
            // {"timestamp_ms": u64, "fields": {...}, "expected": bool}.
            let text = match std::fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("cannot read {path}: {e}");
                    return 2;
                }
            };
            let events: serde_json::Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("malformed recording file {path}: {e}");
                    return 2;
                }
            };
            let body = json!({ "days": days, "events": events });
            match client.post(format!("{server}/admin/rule/test")).json(&body).send().await {
                Ok(resp) => match resp.json::<serde_json::Value>().await {
                    Ok(v) => {
                        println!(
                            "precision={:.3} recall={:.3} events_replayed={}",
                            v["precision"].as_f64().unwrap_or(0.0),
                            v["recall"].as_f64().unwrap_or(0.0),
                            v["events_replayed"].as_u64().unwrap_or(0)
                        );
                        0
                    }
                    Err(e) => {
                        eprintln!("malformed response: {e}");
                        2
                    }
                },
                Err(e) => {
                    eprintln!("request failed: {e}");
                    2
                }
            }
        }
    }
}
