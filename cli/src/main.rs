//! Operator command-line client for `caseflow-daemon`'s REST API. A thin
//! `reqwest`-based wrapper with one subcommand per route, in the spirit of
//! this workspace's RPC client: build a request, send it, print the JSON
//! response (or a colored error) and exit non-zero on failure.

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "caseflow")]
#[command(about = "Operator client for the caseflow ticket-workflow daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Base URL of the daemon's HTTP API
    #[arg(long, global = true, default_value = "http://127.0.0.1:8089")]
    base_url: String,

    /// Tenant id. Sent as `X-Customer-Id` when auth is disabled.
    #[arg(long, global = true)]
    customer_id: Uuid,

    /// Bearer token, used instead of `--customer-id` when the daemon has
    /// auth enabled.
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Move an issue to a new kanban column (e.g. todo, in_progress,
    /// ready_for_qa, in_qa, ready_for_uat, done, dismissed)
    Transition {
        issue_id: Uuid,
        #[arg(long)]
        to_col: String,
        #[arg(long)]
        note: Option<String>,
    },

    /// Shorthand for ready_for_uat_approval -> todo
    ApproveAndStart { issue_id: Uuid },

    /// Shorthand for ready_for_uat -> todo, bumping dev_fail_count
    UatReject {
        issue_id: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Print the full transition audit log for an issue
    Transitions { issue_id: Uuid },

    /// List an issue's chat history
    Messages { issue_id: Uuid },

    /// Post a message into an issue's chat (triggers the PM runner)
    Post { issue_id: Uuid, content: String },

    /// Check the daemon's health endpoint
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let client = reqwest::Client::new();

    let result = match args.command {
        Commands::Transition { issue_id, to_col, note } => {
            post(
                &client,
                &args,
                &format!("/issues/{issue_id}/transition"),
                json!({ "to_col": to_col, "note": note }),
            )
            .await
        }
        Commands::ApproveAndStart { issue_id } => {
            post(&client, &args, &format!("/issues/{issue_id}/approve-and-start"), json!({})).await
        }
        Commands::UatReject { issue_id, reason } => {
            post(
                &client,
                &args,
                &format!("/issues/{issue_id}/uat-reject"),
                json!({ "content": reason.unwrap_or_else(|| "customer rejected the result".into()) }),
            )
            .await
        }
        Commands::Transitions { issue_id } => get(&client, &args, &format!("/issues/{issue_id}/transitions")).await,
        Commands::Messages { issue_id } => get(&client, &args, &format!("/issues/{issue_id}/messages")).await,
        Commands::Post { issue_id, content } => {
            post(
                &client,
                &args,
                &format!("/issues/{issue_id}/messages"),
                json!({ "content": content }),
            )
            .await
        }
        Commands::Health => get(&client, &args, "/healthz").await,
    };

    match result {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Err(err) => {
            eprintln!("{} {err}", "error:".red().bold());
            std::process::exit(1);
        }
    }
}

fn auth_header(args: &Args, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match &args.token {
        Some(token) => builder.bearer_auth(token),
        None => builder.header("X-Customer-Id", args.customer_id.to_string()),
    }
}

async fn get(client: &reqwest::Client, args: &Args, path: &str) -> anyhow::Result<Value> {
    let request = auth_header(args, client.get(format!("{}{}", args.base_url, path)));
    respond(request.send().await?).await
}

async fn post(client: &reqwest::Client, args: &Args, path: &str, body: Value) -> anyhow::Result<Value> {
    let request = auth_header(args, client.post(format!("{}{}", args.base_url, path)).json(&body));
    respond(request.send().await?).await
}

async fn respond(response: reqwest::Response) -> anyhow::Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        anyhow::bail!("{status}: {body}");
    }
    Ok(body)
}
