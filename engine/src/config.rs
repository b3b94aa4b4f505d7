use std::time::Duration;

use anyhow::{bail, Context};

use conclave_limits::LimitConfig;
use conclave_providers::{ProviderManagerConfig, RoutingStrategy};
use conclave_session::SessionConfig;
use conclave_stream::SseServerConfig;

/// Engine configuration, read from `CONCLAVE_*` environment variables.
/// Anything malformed is a fatal init error, never a silent default.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub jwt_secret: Vec<u8>,
    pub audit_key: Vec<u8>,
    pub routing_strategy: RoutingStrategy,
    pub openai_base_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub cors_origins: Vec<String>,
    pub max_sse_clients: usize,
    pub heartbeat_timeout: Duration,
    pub admin_user: Option<(String, String)>,
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = match optional("CONCLAVE_JWT_SECRET") {
            Some(secret) => secret.into_bytes(),
            None => {
                // Boot-only secret: tokens do not survive a restart.
                tracing::warn!("CONCLAVE_JWT_SECRET not set; generating an ephemeral secret");
                random_secret()
            }
        };
        if jwt_secret.len() < 32 {
            bail!("CONCLAVE_JWT_SECRET must be at least 32 bytes");
        }

        let audit_key = match optional("CONCLAVE_AUDIT_KEY") {
            Some(key) => key.into_bytes(),
            None => {
                tracing::warn!("CONCLAVE_AUDIT_KEY not set; generating an ephemeral key");
                random_secret()
            }
        };

        let routing_strategy = match optional("CONCLAVE_ROUTING_STRATEGY").as_deref() {
            None | Some("round-robin") => RoutingStrategy::RoundRobin,
            Some("least-loaded") => RoutingStrategy::LeastLoaded,
            Some("latency-based") => RoutingStrategy::LatencyBased,
            Some("cost-based") => RoutingStrategy::CostBased,
            Some(other) => bail!("unknown CONCLAVE_ROUTING_STRATEGY `{other}`"),
        };

        let max_sse_clients = match optional("CONCLAVE_MAX_SSE_CLIENTS") {
            Some(raw) => raw
                .parse()
                .context("CONCLAVE_MAX_SSE_CLIENTS must be an integer")?,
            None => 1000,
        };

        let heartbeat_timeout = match optional("CONCLAVE_HEARTBEAT_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(
                raw.parse()
                    .context("CONCLAVE_HEARTBEAT_TIMEOUT_MS must be an integer")?,
            ),
            None => Duration::from_secs(30),
        };

        let cors_origins = optional("CONCLAVE_CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let admin_user = match (
            optional("CONCLAVE_ADMIN_USER"),
            optional("CONCLAVE_ADMIN_PASSWORD"),
        ) {
            (Some(user), Some(password)) => Some((user, password)),
            (None, None) => None,
            _ => bail!("CONCLAVE_ADMIN_USER and CONCLAVE_ADMIN_PASSWORD must be set together"),
        };

        Ok(Self {
            jwt_secret,
            audit_key,
            routing_strategy,
            openai_base_url: optional("CONCLAVE_OPENAI_BASE_URL"),
            openai_api_key: optional("CONCLAVE_OPENAI_API_KEY"),
            cors_origins,
            max_sse_clients,
            heartbeat_timeout,
            admin_user,
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_timeout_ms: self.heartbeat_timeout.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn provider_config(&self) -> ProviderManagerConfig {
        ProviderManagerConfig {
            strategy: self.routing_strategy,
            ..Default::default()
        }
    }

    pub fn sse_config(&self) -> SseServerConfig {
        SseServerConfig {
            max_clients: self.max_sse_clients,
            cors_origins: self.cors_origins.clone(),
            ..Default::default()
        }
    }

    pub fn limit_config(&self) -> LimitConfig {
        LimitConfig::default()
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn random_secret() -> Vec<u8> {
    // Two v4 UUIDs give 64 hex chars of entropy, comfortably past the
    // 32-byte floor.
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
    .into_bytes()
}
