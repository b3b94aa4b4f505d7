use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use conclave_bus::EventBus;
use conclave_types::{
    CompletionRequest, CompletionResponse, Error, ProviderStatus, Result, RuntimeEvent,
};

use crate::cache::{cache_key, CompletionCache};
use crate::provider::{EventStream, Provider};

const EMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    RoundRobin,
    LeastLoaded,
    LatencyBased,
    CostBased,
}

#[derive(Debug, Clone)]
pub struct ProviderManagerConfig {
    pub strategy: RoutingStrategy,
    pub failover_enabled: bool,
    /// Fallback attempts after the primary fails.
    pub max_attempts: u32,
    pub cache_enabled: bool,
    pub cache_ttl: Duration,
    pub cache_max_size: usize,
    pub health_check_interval: Duration,
    /// Error-rate EMA above this demotes a provider to unhealthy.
    pub failure_threshold: f64,
}

impl Default for ProviderManagerConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::RoundRobin,
            failover_enabled: true,
            max_attempts: 2,
            cache_enabled: true,
            cache_ttl: Duration::from_secs(300),
            cache_max_size: 1000,
            health_check_interval: Duration::from_secs(60),
            failure_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ProviderMetrics {
    latency_ema_ms: f64,
    latency_samples: u64,
    error_rate_ema: f64,
    error_samples: u64,
    total_cost: f64,
    request_count: u64,
    success_count: u64,
    failure_count: u64,
    last_used: Option<DateTime<Utc>>,
}

/// Read-only view of a provider's accounting.
#[derive(Debug, Clone)]
pub struct ProviderMetricsSnapshot {
    pub latency_ema_ms: f64,
    pub error_rate_ema: f64,
    pub total_cost: f64,
    pub request_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub active_requests: usize,
    pub healthy: bool,
}

struct ProviderEntry {
    provider: Arc<dyn Provider>,
    priority: i32,
    concurrent_limit: Option<usize>,
    active_requests: AtomicUsize,
    healthy: AtomicBool,
    metrics: StdMutex<ProviderMetrics>,
}

impl ProviderEntry {
    fn current_load(&self) -> f64 {
        let active = self.active_requests.load(Ordering::Relaxed);
        match self.concurrent_limit {
            Some(limit) if limit > 0 => (active as f64 / limit as f64).min(1.0),
            _ => {
                if active == 0 {
                    0.0
                } else {
                    // Without a cap, load saturates softly with demand.
                    1.0 - 1.0 / (active as f64 + 1.0)
                }
            }
        }
    }

    fn at_capacity(&self) -> bool {
        match self.concurrent_limit {
            Some(limit) => self.active_requests.load(Ordering::Relaxed) >= limit,
            None => false,
        }
    }

    fn latency_ema(&self) -> f64 {
        self.metrics.lock().expect("metrics poisoned").latency_ema_ms
    }
}

/// Releases a provider slot on every exit path, including panics and
/// cancelled futures.
struct ActiveRequestGuard {
    entry: Arc<ProviderEntry>,
}

impl ActiveRequestGuard {
    fn acquire(entry: Arc<ProviderEntry>) -> Self {
        entry.active_requests.fetch_add(1, Ordering::SeqCst);
        Self { entry }
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.entry.active_requests.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry, router, and accountant for all providers.
pub struct ProviderManager {
    entries: RwLock<HashMap<String, Arc<ProviderEntry>>>,
    round_robin: AtomicUsize,
    cache: Mutex<CompletionCache>,
    config: ProviderManagerConfig,
    events: EventBus,
}

impl ProviderManager {
    pub fn new(config: ProviderManagerConfig, events: EventBus) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            round_robin: AtomicUsize::new(0),
            cache: Mutex::new(CompletionCache::new(config.cache_max_size, config.cache_ttl)),
            config,
            events,
        }
    }

    pub async fn register(
        &self,
        provider: Arc<dyn Provider>,
        priority: i32,
        concurrent_limit: Option<usize>,
    ) -> Result<()> {
        provider.initialize().await?;
        let name = provider.name().to_string();
        let entry = Arc::new(ProviderEntry {
            provider,
            priority,
            concurrent_limit,
            active_requests: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            metrics: StdMutex::new(ProviderMetrics::default()),
        });
        self.entries.write().await.insert(name.clone(), entry);
        self.events.publish(RuntimeEvent::new(
            "provider.registered",
            json!({ "provider": name }),
        ));
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> Result<()> {
        let entry = self
            .entries
            .write()
            .await
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("provider `{name}`")))?;
        entry.provider.destroy().await;
        Ok(())
    }

    pub async fn provider_names(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn get_status(&self, name: &str) -> Result<ProviderStatus> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("provider `{name}`")))?;
        Ok(ProviderStatus {
            available: entry.healthy.load(Ordering::Relaxed),
            current_load: entry.current_load(),
            active_requests: entry.active_requests.load(Ordering::Relaxed),
        })
    }

    pub async fn metrics(&self, name: &str) -> Result<ProviderMetricsSnapshot> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("provider `{name}`")))?;
        let metrics = entry.metrics.lock().expect("metrics poisoned").clone();
        Ok(ProviderMetricsSnapshot {
            latency_ema_ms: metrics.latency_ema_ms,
            error_rate_ema: metrics.error_rate_ema,
            total_cost: metrics.total_cost,
            request_count: metrics.request_count,
            success_count: metrics.success_count,
            failure_count: metrics.failure_count,
            last_used: metrics.last_used,
            active_requests: entry.active_requests.load(Ordering::Relaxed),
            healthy: entry.healthy.load(Ordering::Relaxed),
        })
    }

    /// Filter to healthy, uncapped, non-excluded providers (falling back to
    /// any non-excluded provider), order by priority, then apply the
    /// configured strategy.
    async fn select_provider(
        &self,
        request: &CompletionRequest,
        exclude: &HashSet<String>,
    ) -> Result<(String, Arc<ProviderEntry>)> {
        let entries = self.entries.read().await;
        if entries.is_empty() {
            return Err(Error::NotFound("no providers registered".to_string()));
        }

        // Cost-constrained requests route to the cheapest provider that fits.
        if let Some(max_cost) = request
            .cost_constraints
            .as_ref()
            .and_then(|c| c.max_cost)
        {
            let mut cheapest: Option<(String, Arc<ProviderEntry>, f64)> = None;
            for (name, entry) in entries.iter() {
                if exclude.contains(name) || entry.at_capacity() {
                    continue;
                }
                let estimate = entry.provider.estimate_cost(request).total;
                if estimate > max_cost {
                    continue;
                }
                let replace = match &cheapest {
                    Some((_, _, best)) => estimate < *best,
                    None => true,
                };
                if replace {
                    cheapest = Some((name.clone(), entry.clone(), estimate));
                }
            }
            return cheapest
                .map(|(name, entry, _)| (name, entry))
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "no provider meets the cost constraint of {max_cost}"
                    ))
                });
        }

        let mut filtered: Vec<(&String, &Arc<ProviderEntry>)> = entries
            .iter()
            .filter(|(name, entry)| {
                !exclude.contains(*name)
                    && entry.healthy.load(Ordering::Relaxed)
                    && !entry.at_capacity()
            })
            .collect();
        if filtered.is_empty() {
            // Degraded mode: anything not explicitly excluded.
            filtered = entries
                .iter()
                .filter(|(name, _)| !exclude.contains(*name))
                .collect();
        }
        if filtered.is_empty() {
            return Err(Error::NotFound(
                "no provider available for the request".to_string(),
            ));
        }
        filtered.sort_by(|a, b| {
            b.1.priority
                .cmp(&a.1.priority)
                .then_with(|| a.0.cmp(b.0))
        });

        let chosen = match self.config.strategy {
            RoutingStrategy::RoundRobin => {
                // The index only ever increments; modulo is over the current
                // filtered list, and the index is not reset when it changes.
                let index = self.round_robin.fetch_add(1, Ordering::Relaxed);
                &filtered[index % filtered.len()]
            }
            RoutingStrategy::LeastLoaded => filtered
                .iter()
                .min_by(|a, b| {
                    a.1.current_load()
                        .partial_cmp(&b.1.current_load())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("filtered is non-empty"),
            RoutingStrategy::LatencyBased => filtered
                .iter()
                .min_by(|a, b| {
                    a.1.latency_ema()
                        .partial_cmp(&b.1.latency_ema())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("filtered is non-empty"),
            RoutingStrategy::CostBased => filtered
                .iter()
                .min_by(|a, b| {
                    let cost_a = a.1.provider.estimate_cost(request).total;
                    let cost_b = b.1.provider.estimate_cost(request).total;
                    cost_a
                        .partial_cmp(&cost_b)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("filtered is non-empty"),
        };
        Ok(((*chosen.0).clone(), (*chosen.1).clone()))
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        if self.config.cache_enabled {
            let key = cache_key(request);
            if let Some(hit) = self.cache.lock().await.get(&key) {
                self.events.publish(RuntimeEvent::new(
                    "provider.cache_hit",
                    json!({ "provider": hit.provider, "model": hit.model }),
                ));
                return Ok(hit);
            }
        }

        let exclude = HashSet::new();
        let (name, entry) = self.select_provider(request, &exclude).await?;
        match self.complete_on(&name, &entry, request).await {
            Ok(response) => {
                self.store_in_cache(request, &response).await;
                Ok(response)
            }
            Err(err) if self.config.failover_enabled && err.retryable() => {
                self.complete_with_fallback(request, name, err).await
            }
            Err(err) => Err(err),
        }
    }

    /// Walk the remaining providers, best first, for up to `max_attempts`.
    async fn complete_with_fallback(
        &self,
        request: &CompletionRequest,
        failed: String,
        original: Error,
    ) -> Result<CompletionResponse> {
        let mut exclude: HashSet<String> = HashSet::new();
        exclude.insert(failed.clone());

        for _ in 0..self.config.max_attempts {
            let Ok((name, entry)) = self.select_provider(request, &exclude).await else {
                break;
            };
            match self.complete_on(&name, &entry, request).await {
                Ok(response) => {
                    self.events.publish(RuntimeEvent::new(
                        "provider.fallback_success",
                        json!({ "failed": failed, "provider": name }),
                    ));
                    self.store_in_cache(request, &response).await;
                    return Ok(response);
                }
                Err(err) => {
                    tracing::warn!(provider = %name, error = %err, "fallback attempt failed");
                    exclude.insert(name);
                }
            }
        }

        self.events.publish(RuntimeEvent::new(
            "provider.fallback_exhausted",
            json!({ "failed": failed, "attempts": self.config.max_attempts }),
        ));
        match original {
            Error::Provider {
                provider,
                message,
                retryable,
                ..
            } => Err(Error::Provider {
                provider,
                message,
                retryable,
                retried: true,
            }),
            other => Err(other),
        }
    }

    async fn complete_on(
        &self,
        name: &str,
        entry: &Arc<ProviderEntry>,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        let _guard = ActiveRequestGuard::acquire(entry.clone());
        let started = std::time::Instant::now();
        let result = entry.provider.complete(request).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        self.record_outcome(name, entry, &result, elapsed_ms);
        result
    }

    pub async fn stream_complete(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let exclude = HashSet::new();
        let (name, entry) = self.select_provider(request, &exclude).await?;
        let guard = ActiveRequestGuard::acquire(entry.clone());
        match entry.provider.stream_complete(request, cancel).await {
            Ok(mut inner) => {
                // The guard rides inside the stream so the slot frees when
                // the stream is exhausted or dropped.
                let stream = async_stream::stream! {
                    let _guard = guard;
                    while let Some(event) = futures::StreamExt::next(&mut inner).await {
                        yield event;
                    }
                };
                Ok(Box::pin(stream))
            }
            Err(err) => {
                drop(guard);
                self.note_failure(&name, entry.clone());
                Err(err)
            }
        }
    }

    fn record_outcome(
        &self,
        name: &str,
        entry: &Arc<ProviderEntry>,
        result: &Result<CompletionResponse>,
        elapsed_ms: f64,
    ) {
        let mut metrics = entry.metrics.lock().expect("metrics poisoned");
        metrics.request_count += 1;
        metrics.last_used = Some(Utc::now());
        let error_sample = match result {
            Ok(response) => {
                metrics.success_count += 1;
                metrics.total_cost += response.cost.total_cost;
                if metrics.latency_samples == 0 {
                    metrics.latency_ema_ms = elapsed_ms;
                } else {
                    metrics.latency_ema_ms =
                        EMA_ALPHA * elapsed_ms + (1.0 - EMA_ALPHA) * metrics.latency_ema_ms;
                }
                metrics.latency_samples += 1;
                0.0
            }
            Err(_) => {
                metrics.failure_count += 1;
                1.0
            }
        };
        if metrics.error_samples == 0 {
            metrics.error_rate_ema = error_sample;
        } else {
            metrics.error_rate_ema =
                EMA_ALPHA * error_sample + (1.0 - EMA_ALPHA) * metrics.error_rate_ema;
        }
        metrics.error_samples += 1;
        let error_rate = metrics.error_rate_ema;
        drop(metrics);

        let was_healthy = entry.healthy.load(Ordering::Relaxed);
        let is_healthy = error_rate <= self.config.failure_threshold;
        if was_healthy != is_healthy {
            entry.healthy.store(is_healthy, Ordering::Relaxed);
            let event_type = if is_healthy {
                "provider.recovered"
            } else {
                "provider.failed"
            };
            self.events.publish(RuntimeEvent::new(
                event_type,
                json!({ "provider": name, "errorRate": error_rate }),
            ));
        }
    }

    fn note_failure(&self, name: &str, entry: Arc<ProviderEntry>) {
        let failed: Result<CompletionResponse> =
            Err(Error::provider_failure(name, "stream setup failed"));
        self.record_outcome(name, &entry, &failed, 0.0);
    }

    async fn store_in_cache(&self, request: &CompletionRequest, response: &CompletionResponse) {
        if !self.config.cache_enabled {
            return;
        }
        self.cache
            .lock()
            .await
            .insert(cache_key(request), response.clone());
    }

    /// One health-check pass over every provider.
    pub async fn run_health_checks(&self) {
        let entries: Vec<(String, Arc<ProviderEntry>)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect();
        for (name, entry) in entries {
            let result = entry.provider.health_check().await;
            let error_rate = entry
                .metrics
                .lock()
                .expect("metrics poisoned")
                .error_rate_ema;
            let is_healthy = result.healthy && error_rate <= self.config.failure_threshold;
            let was_healthy = entry.healthy.load(Ordering::Relaxed);
            if was_healthy != is_healthy {
                entry.healthy.store(is_healthy, Ordering::Relaxed);
                let event_type = if is_healthy {
                    "provider.recovered"
                } else {
                    "provider.failed"
                };
                self.events.publish(RuntimeEvent::new(
                    event_type,
                    json!({
                        "provider": name,
                        "latencyMS": result.latency_ms,
                        "error": result.error,
                    }),
                ));
            }
        }
    }
}


/// Periodic health probing; demotions and recoveries land on the event bus.
pub fn spawn_health_monitor(
    manager: Arc<ProviderManager>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(manager.config.health_check_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            manager.run_health_checks().await;
        }
    })
}
