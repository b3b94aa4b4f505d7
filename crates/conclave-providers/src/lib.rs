mod cache;
mod echo;
mod manager;
mod openai;
mod provider;

pub use cache::{cache_key, CompletionCache};
pub use echo::EchoProvider;
pub use manager::{
    spawn_health_monitor, ProviderManager, ProviderManagerConfig, ProviderMetricsSnapshot,
    RoutingStrategy,
};
pub use openai::OpenAiCompatProvider;
pub use provider::{estimate_from_pricing, EventStream, Provider};
