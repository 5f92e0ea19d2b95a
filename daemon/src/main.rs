//! caseflow-daemon entry point: loads config, wires the engine's
//! dependency graph, and runs the HTTP/WebSocket server alongside the
//! dispatcher worker loops and the stall-recovery sweep. Grounded in this
//! workspace's clap-args + tracing-init + signal-handling main.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use caseflow_core::agent_runner::pm::PmRunner;
use caseflow_core::agent_runner::{AgentRunner, RoleConfig};
use caseflow_core::callback::CallbackHandler;
use caseflow_core::config::EngineConfig;
use caseflow_core::credentials::CredentialCipher;
use caseflow_core::dispatcher::{Dispatcher, QUEUE_AGENT, QUEUE_BACKEND};
use caseflow_core::event_bus::EventBus;
use caseflow_core::lock_service::SqliteLockService;
use caseflow_core::spawner::HttpSpawner;
use caseflow_core::stall_controller::StallController;
use caseflow_core::state_machine::StateMachine;
use caseflow_core::store::SqliteStore;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use caseflow_daemon::auth::AuthManager;
use caseflow_daemon::handlers::AppState;
use caseflow_daemon::llm_gateway::HttpGateway;
use caseflow_daemon::server::CaseflowServer;

#[derive(Parser, Debug)]
#[command(
    name = "caseflow-daemon",
    about = "Multi-tenant ticket-workflow engine daemon",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to configuration file (TOML)")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "PORT", help = "HTTP API port")]
    http_port: Option<u16>,

    #[arg(long, value_name = "PORT", help = "Realtime gateway WebSocket port")]
    ws_port: Option<u16>,

    #[arg(long, help = "Enable JWT authentication for customer routes")]
    enable_auth: bool,

    #[arg(long, value_name = "SECRET", help = "JWT secret (required if auth enabled)")]
    jwt_secret: Option<String>,

    #[arg(short, long, value_name = "LEVEL", default_value = "info", help = "Log level")]
    log_level: String,

    #[arg(short, long, help = "Enable verbose (debug) logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { &args.log_level };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.parse()?))
        .with_target(false)
        .with_line_number(true)
        .init();

    info!("starting caseflow-daemon v{}", caseflow_daemon::VERSION);

    let mut config = EngineConfig::load_or_default(args.config.as_deref())?;

    if let Some(port) = args.http_port {
        config.server.port = port;
    }
    if let Some(port) = args.ws_port {
        config.server.ws_port = port;
    }
    if args.enable_auth {
        config.auth.enabled = true;
        if let Some(secret) = args.jwt_secret {
            config.auth.jwt_secret = secret;
        } else {
            eprintln!("error: --jwt-secret is required when --enable-auth is set");
            std::process::exit(1);
        }
    }
    config.validate()?;

    info!(
        host = %config.server.host,
        http_port = config.server.port,
        ws_port = config.server.ws_port,
        auth_enabled = config.auth.enabled,
        "configuration loaded"
    );

    let store = Arc::new(SqliteStore::new(&config.database.path).await?);
    let lock_service = Arc::new(SqliteLockService::new(store.pool().clone()).await?);
    let dispatcher = Arc::new(
        Dispatcher::with_config(
            store.pool().clone(),
            config.dispatcher.max_retries,
            Duration::from_secs(config.dispatcher.backoff_base_seconds),
            Duration::from_secs(config.dispatcher.visibility_timeout_seconds),
        )
        .await?,
    );
    let event_bus = Arc::new(EventBus::new());
    let state_machine = Arc::new(StateMachine::new(store.clone(), event_bus.clone(), dispatcher.clone()));
    let credential_cipher = Arc::new(CredentialCipher::new(&config.credentials.encryption_key));
    let auth = Arc::new(AuthManager::new(config.auth.clone()));

    let callback_handler = Arc::new(CallbackHandler::new(
        store.clone(),
        state_machine.clone(),
        lock_service.clone(),
        event_bus.clone(),
        config.callback.internal_token.clone(),
    ));

    let spawner = Arc::new(HttpSpawner::new(
        config.agent_host.base_url.clone(),
        config.agent_host.shared_token.clone(),
    )?);
    let gateway = Arc::new(HttpGateway::new(
        config.agent_host.base_url.clone(),
        config.agent_host.shared_token.clone(),
    )?);

    let dev_runner = Arc::new(AgentRunner::new(
        RoleConfig::dev(),
        store.clone(),
        lock_service.clone(),
        spawner.clone(),
        state_machine.clone(),
        event_bus.clone(),
        config.agent_host.clone(),
    ));
    let qa_runner = Arc::new(AgentRunner::new(
        RoleConfig::qa(),
        store.clone(),
        lock_service.clone(),
        spawner.clone(),
        state_machine.clone(),
        event_bus.clone(),
        config.agent_host.clone(),
    ));
    let tech_lead_runner = Arc::new(AgentRunner::new(
        RoleConfig::tech_lead(),
        store.clone(),
        lock_service.clone(),
        spawner.clone(),
        state_machine.clone(),
        event_bus.clone(),
        config.agent_host.clone(),
    ));
    let pm_runner = Arc::new(PmRunner::new(
        store.clone(),
        lock_service.clone(),
        gateway.clone(),
        state_machine.clone(),
        event_bus.clone(),
        credential_cipher.clone(),
        config.agent_host.model_pm.clone(),
    ));

    let stall_controller = Arc::new(StallController::new(
        store.clone(),
        state_machine.clone(),
        dispatcher.clone(),
        config.stall.clone(),
    ));
    tokio::spawn(stall_controller.run_forever());

    spawn_workers(
        dispatcher.clone(),
        store.clone(),
        QUEUE_AGENT,
        config.dispatcher.agent_queue_workers,
        config.lock.poll_interval_ms,
        {
            let pm_runner = pm_runner.clone();
            move |_job_name: String, customer_id, issue_id| {
                let pm_runner = pm_runner.clone();
                async move { pm_runner.run(customer_id, issue_id).await }
            }
        },
    );

    spawn_workers(
        dispatcher.clone(),
        store.clone(),
        QUEUE_BACKEND,
        config.dispatcher.backend_queue_workers,
        config.lock.poll_interval_ms,
        move |job_name: String, customer_id, issue_id| {
            let dev_runner = dev_runner.clone();
            let qa_runner = qa_runner.clone();
            let tech_lead_runner = tech_lead_runner.clone();
            async move {
                match job_name.as_str() {
                    "dev_agent.run" => dev_runner.run(customer_id, issue_id).await,
                    "qa_agent.run" => qa_runner.run(customer_id, issue_id).await,
                    "tech_lead.run" => tech_lead_runner.run(customer_id, issue_id).await,
                    other => error!(job = other, "unknown backend job name"),
                }
            }
        },
    );

    let state = Arc::new(AppState {
        store: store.clone(),
        state_machine,
        lock_service,
        dispatcher,
        event_bus: event_bus.clone(),
        callback_handler,
        credential_cipher,
        auth,
        internal_token: config.callback.internal_token.clone(),
    });

    let server = CaseflowServer::new(
        state,
        config.server.host.clone(),
        config.server.port,
        config.server.ws_port,
        store,
        event_bus,
    );

    let server_handle = tokio::spawn(async move {
        if let Err(err) = server.run().await {
            error!(error = %err, "server terminated with an error");
        }
    });

    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received sigterm, shutting down"),
        _ = server_handle => info!("server task ended"),
    }

    Ok(())
}

/// Spawn `n` worker loops claiming from `queue`, each polling at
/// `poll_interval_ms` when idle. `handler` resolves the issue's tenant via
/// the unscoped lookup before invoking the caller-supplied per-job logic.
fn spawn_workers<F, Fut>(
    dispatcher: Arc<Dispatcher>,
    store: Arc<SqliteStore>,
    queue: &'static str,
    worker_count: usize,
    poll_interval_ms: u64,
    handler: F,
) where
    F: Fn(String, uuid::Uuid, uuid::Uuid) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    for _ in 0..worker_count.max(1) {
        let dispatcher = dispatcher.clone();
        let store = store.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            loop {
                match dispatcher.claim(queue).await {
                    Ok(Some(job)) => {
                        match store.get_issue_by_id(job.payload.issue_id).await {
                            Ok(issue) => {
                                handler(job.name.clone(), issue.customer_id, issue.id).await;
                            }
                            Err(err) => {
                                error!(job = %job.name, error = %err, "could not resolve issue for job");
                            }
                        }
                        if let Err(err) = dispatcher.complete(job.id).await {
                            error!(error = %err, "failed to mark job complete");
                        }
                    }
                    Ok(None) => {
                        tokio::time::sleep(Duration::from_millis(poll_interval_ms)).await;
                    }
                    Err(err) => {
                        error!(error = %err, "dispatcher claim failed");
                        tokio::time::sleep(Duration::from_millis(poll_interval_ms)).await;
                    }
                }
            }
        });
    }
}
