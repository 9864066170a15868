//! CLI entry point for raftguard-ctl: operator client for the control surface.

use clap::{Parser, Subcommand, ValueEnum};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "raftguard-ctl", about = "raftguard cluster control tool")]
struct Cli {
    /// Base URL of the node to talk to.
    #[arg(long, default_value = "http://127.0.0.1:7001", global = true)]
    endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the cluster status snapshot
    Status,
    /// Show the worker lifecycle state
    WorkerState,
    /// Report whether the node is healthy
    Healthy,
    /// Show leadership information
    Leader,
    /// List voting members
    Nodes,
    /// Show the latest health worker report
    Health,
    /// Bootstrap the node identity
    Init {
        #[arg(long)]
        node_id: u64,
        #[arg(long)]
        address: String,
        #[arg(long)]
        port: u16,
    },
    /// Add a voting member (leader only)
    AddNode {
        #[arg(long)]
        node_id: u64,
        #[arg(long)]
        address: String,
        #[arg(long)]
        port: u16,
    },
    /// Remove a voting member (leader only)
    RemoveNode {
        #[arg(long)]
        node_id: u64,
    },
    /// Toggle debug logging
    Debug {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Fetch one log entry
    LogEntry {
        #[arg(long)]
        index: u64,
    },
    /// Show log statistics
    LogStats,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let rc = match run(&cli.endpoint, cli.command).await {
        Ok(body) => {
            println!("{}", pretty(&body));
            0
        }
        Err(message) => {
            eprintln!("Error: {message}");
            1
        }
    };
    std::process::exit(rc);
}

async fn run(endpoint: &str, command: Commands) -> Result<Value, String> {
    let client = reqwest::Client::new();
    let (method, path, body) = match command {
        Commands::Status => (Method::GET, "/control/status".to_string(), None),
        Commands::WorkerState => (Method::GET, "/control/worker-state".to_string(), None),
        Commands::Healthy => (Method::GET, "/control/healthy".to_string(), None),
        Commands::Leader => (Method::GET, "/control/leader".to_string(), None),
        Commands::Nodes => (Method::GET, "/control/nodes".to_string(), None),
        Commands::Health => (Method::GET, "/control/health".to_string(), None),
        Commands::Init {
            node_id,
            address,
            port,
        } => (
            Method::POST,
            "/control/init".to_string(),
            Some(json!({ "node_id": node_id, "address": address, "port": port })),
        ),
        Commands::AddNode {
            node_id,
            address,
            port,
        } => (
            Method::POST,
            "/control/nodes".to_string(),
            Some(json!({ "node_id": node_id, "address": address, "port": port })),
        ),
        Commands::RemoveNode { node_id } => {
            (Method::DELETE, format!("/control/nodes/{node_id}"), None)
        }
        Commands::Debug { state } => (
            Method::PUT,
            "/control/debug".to_string(),
            Some(json!({ "enabled": matches!(state, Toggle::On) })),
        ),
        Commands::LogEntry { index } => (Method::GET, format!("/control/log/{index}"), None),
        Commands::LogStats => (Method::GET, "/control/log/stats".to_string(), None),
    };

    let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
    let mut request = client.request(method, &url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request
        .send()
        .await
        .map_err(|e| format!("request to {url} failed: {e}"))?;
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| format!("invalid response from {url}: {e}"))?;

    if status.is_success() {
        Ok(body)
    } else {
        Err(describe_error(status, &body))
    }
}

fn describe_error(status: StatusCode, body: &Value) -> String {
    let code = body["code"].as_str().unwrap_or("Unknown");
    let message = body["message"].as_str().unwrap_or("");
    match body["leader_id"].as_u64() {
        Some(leader) => format!("{status} {code}: {message} (leader is node {leader})"),
        None => format!("{status} {code}: {message}"),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
