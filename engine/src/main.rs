mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use conclave_auth::{AuditLog, AuditLogConfig, AuthService, RbacStore, Role};
use conclave_bus::{spawn_redelivery_sweeper, EventBus, MessageBus};
use conclave_consensus::{spawn_proposal_reaper, ConsensusConfig, ConsensusEngine};
use conclave_crypto::{HmacAlgorithm, TokenSigner};
use conclave_limits::LimitRegistry;
use conclave_providers::{
    spawn_health_monitor, EchoProvider, OpenAiCompatProvider, ProviderManager,
};
use conclave_session::{spawn_heartbeat_sweeper, BusVoteTransport, SessionService};
use conclave_stream::{spawn_event_pump, spawn_keep_alive, SseServer};
use conclave_types::ProviderCapabilities;

use config::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "conclave-engine")]
#[command(about = "Headless Conclave coordination backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the SSE event stream and run the coordinator.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 7450, env = "CONCLAVE_PORT")]
        port: u16,
        #[arg(long, env = "CONCLAVE_STATE_DIR")]
        state_dir: Option<String>,
    },
    /// Validate the environment configuration and exit.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let (_log_guard, log_info) = conclave_observability::init_process_logging(
                "engine",
                &state_dir.join("logs"),
                14,
            )?;
            info!(logs_dir = %log_info.logs_dir, "logging initialized");

            let config = EngineConfig::from_env()?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            serve(addr, config, &state_dir).await?;
        }
        Command::Check => {
            conclave_observability::init_console_logging();
            let config = EngineConfig::from_env()?;
            println!(
                "configuration ok: strategy={:?} sse_clients={} openai={}",
                config.routing_strategy,
                config.max_sse_clients,
                if config.openai_api_key.is_some() {
                    "configured"
                } else {
                    "absent"
                }
            );
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    flag.map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".conclave"))
}

async fn serve(addr: SocketAddr, config: EngineConfig, state_dir: &PathBuf) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let events = EventBus::new();
    let bus = Arc::new(MessageBus::new());
    let transport = Arc::new(BusVoteTransport::new(bus.clone(), 5_000));
    let consensus = Arc::new(ConsensusEngine::new(
        transport,
        events.clone(),
        ConsensusConfig::default(),
    ));
    let limits = Arc::new(LimitRegistry::new(config.limit_config()));
    let sessions = Arc::new(SessionService::new(
        bus.clone(),
        consensus.clone(),
        limits.clone(),
        events.clone(),
        config.session_config(),
    ));
    let providers = Arc::new(ProviderManager::new(
        config.provider_config(),
        events.clone(),
    ));

    providers
        .register(Arc::new(EchoProvider::new()), 0, None)
        .await
        .map_err(|e| anyhow::anyhow!("echo provider registration failed: {e}"))?;
    if let Some(base_url) = &config.openai_base_url {
        let capabilities = ProviderCapabilities {
            supported_models: vec!["gpt-4o-mini".to_string()],
            supports_streaming: true,
            supports_tools: true,
            ..Default::default()
        };
        providers
            .register(
                Arc::new(OpenAiCompatProvider::new(
                    "openai",
                    base_url.clone(),
                    config.openai_api_key.clone(),
                    capabilities,
                )),
                10,
                Some(8),
            )
            .await
            .map_err(|e| anyhow::anyhow!("openai provider registration failed: {e}"))?;
    }

    let signer = TokenSigner::new(&config.jwt_secret, HmacAlgorithm::HS256)
        .map_err(|e| anyhow::anyhow!("JWT signer init failed: {e}"))?;
    let rbac = Arc::new(RbacStore::new());
    let audit = Arc::new(AuditLog::new(
        config.audit_key.clone(),
        AuditLogConfig::default(),
    ));
    let auth = Arc::new(AuthService::new(signer, rbac.clone(), audit.clone()));
    if let Some((user, password)) = &config.admin_user {
        auth.create_user(user, password, Role::Admin)
            .map_err(|e| anyhow::anyhow!("admin bootstrap failed: {e}"))?;
    }

    let sse = Arc::new(SseServer::new(config.sse_config()));

    // Background maintenance; all tasks observe the same cancel token.
    spawn_event_pump(sse.clone(), events.clone(), cancel.clone());
    spawn_keep_alive(sse.clone(), cancel.clone());
    spawn_heartbeat_sweeper(sessions.clone(), Duration::from_secs(5), cancel.clone());
    spawn_redelivery_sweeper(bus.clone(), Duration::from_secs(1), cancel.clone());
    spawn_proposal_reaper(consensus.clone(), Duration::from_secs(5), cancel.clone());
    spawn_health_monitor(providers.clone(), cancel.clone());

    log_startup(state_dir, &addr);
    let router = sse.router();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    let shutdown_cancel = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_cancel.cancel();
        })
        .await?;

    cancel.cancel();
    info!("conclave-engine stopped cleanly");
    Ok(())
}

fn log_startup(state_dir: &PathBuf, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting conclave-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={}",
        exe.display(),
        cwd.display(),
        state_dir.display()
    );
}
