use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use conclave_types::AgentId;

use crate::bucket::TokenBucket;
use crate::window::SlidingWindow;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct LimitConfig {
    pub tasks_per_minute: u32,
    pub memory_ops_per_minute: u32,
    pub messages_per_minute: u32,
    /// CPU budget per real minute, in milliseconds.
    pub cpu_quota_ms: f64,
    pub max_concurrent_tasks: usize,
    pub memory_quota_bytes: u64,
    /// Burst capacity multiplies the sliding-window limits by 1.5.
    pub allow_burst: bool,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            tasks_per_minute: 30,
            memory_ops_per_minute: 100,
            messages_per_minute: 60,
            cpu_quota_ms: 60_000.0,
            max_concurrent_tasks: 5,
            memory_quota_bytes: 100 * 1024 * 1024,
            allow_burst: false,
        }
    }
}

/// The answer to a limit check. On deny, `wait_time_ms` tells the caller how
/// long until the check could pass; blocking, retrying, or surfacing
/// backpressure is the caller's choice.
#[derive(Debug, Clone, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_time_ms: Option<u64>,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            wait_time_ms: None,
        }
    }

    fn deny(reason: impl Into<String>, wait_time_ms: u64) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            wait_time_ms: Some(wait_time_ms),
        }
    }
}

struct Counters {
    tasks: SlidingWindow,
    memory_ops: SlidingWindow,
    messages: SlidingWindow,
    cpu: TokenBucket,
    running_tasks: usize,
    memory_in_use: u64,
}

/// The four limiters plus the hard concurrency and memory counters for one
/// agent.
pub struct AgentLimits {
    config: LimitConfig,
    counters: Mutex<Counters>,
}

impl AgentLimits {
    pub fn new(config: LimitConfig) -> Self {
        let burst = |max: u32| -> u32 {
            if config.allow_burst {
                (max as f64 * 1.5).ceil() as u32
            } else {
                max
            }
        };
        let counters = Counters {
            tasks: SlidingWindow::new(burst(config.tasks_per_minute), WINDOW),
            memory_ops: SlidingWindow::new(burst(config.memory_ops_per_minute), WINDOW),
            messages: SlidingWindow::new(burst(config.messages_per_minute), WINDOW),
            cpu: TokenBucket::new(config.cpu_quota_ms, config.cpu_quota_ms / 60.0),
            running_tasks: 0,
            memory_in_use: 0,
        };
        Self {
            config,
            counters: Mutex::new(counters),
        }
    }

    pub async fn can_start_task(&self) -> RateDecision {
        let mut counters = self.counters.lock().await;
        if counters.running_tasks >= self.config.max_concurrent_tasks {
            return RateDecision::deny(
                format!(
                    "concurrent task limit of {} reached",
                    self.config.max_concurrent_tasks
                ),
                0,
            );
        }
        if !counters.tasks.try_acquire() {
            let wait = counters.tasks.wait_time_ms();
            return RateDecision::deny("task rate limit exceeded", wait);
        }
        counters.running_tasks += 1;
        RateDecision::allow()
    }

    pub async fn task_finished(&self) {
        let mut counters = self.counters.lock().await;
        counters.running_tasks = counters.running_tasks.saturating_sub(1);
    }

    pub async fn can_perform_memory_op(&self, bytes: u64) -> RateDecision {
        let mut counters = self.counters.lock().await;
        if counters.memory_in_use + bytes > self.config.memory_quota_bytes {
            return RateDecision::deny(
                format!(
                    "memory quota of {} bytes exceeded",
                    self.config.memory_quota_bytes
                ),
                0,
            );
        }
        if !counters.memory_ops.try_acquire() {
            let wait = counters.memory_ops.wait_time_ms();
            return RateDecision::deny("memory op rate limit exceeded", wait);
        }
        counters.memory_in_use += bytes;
        RateDecision::allow()
    }

    pub async fn release_memory(&self, bytes: u64) {
        let mut counters = self.counters.lock().await;
        counters.memory_in_use = counters.memory_in_use.saturating_sub(bytes);
    }

    pub async fn can_send_message(&self) -> RateDecision {
        let mut counters = self.counters.lock().await;
        if counters.messages.try_acquire() {
            RateDecision::allow()
        } else {
            let wait = counters.messages.wait_time_ms();
            RateDecision::deny("message rate limit exceeded", wait)
        }
    }

    pub async fn can_use_cpu(&self, ms: f64) -> RateDecision {
        let mut counters = self.counters.lock().await;
        if counters.cpu.consume(ms) {
            RateDecision::allow()
        } else {
            let wait = counters.cpu.wait_time_ms(ms);
            RateDecision::deny("CPU quota exceeded", wait)
        }
    }
}

/// Per-agent limiter registry; agents get the default config on first touch.
pub struct LimitRegistry {
    default_config: LimitConfig,
    agents: Mutex<HashMap<AgentId, Arc<AgentLimits>>>,
}

impl LimitRegistry {
    pub fn new(default_config: LimitConfig) -> Self {
        Self {
            default_config,
            agents: Mutex::new(HashMap::new()),
        }
    }

    pub async fn for_agent(&self, agent_id: &str) -> Arc<AgentLimits> {
        let mut agents = self.agents.lock().await;
        agents
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(AgentLimits::new(self.default_config.clone())))
            .clone()
    }

    pub async fn set_agent_config(&self, agent_id: &str, config: LimitConfig) {
        self.agents
            .lock()
            .await
            .insert(agent_id.to_string(), Arc::new(AgentLimits::new(config)));
    }

    pub async fn remove_agent(&self, agent_id: &str) -> bool {
        self.agents.lock().await.remove(agent_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tasks_per_minute: u32, allow_burst: bool) -> LimitConfig {
        LimitConfig {
            tasks_per_minute,
            allow_burst,
            max_concurrent_tasks: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sixth_task_in_a_minute_is_denied() {
        let limits = AgentLimits::new(config(5, false));
        for _ in 0..5 {
            let decision = limits.can_start_task().await;
            assert!(decision.allowed);
        }
        let decision = limits.can_start_task().await;
        assert!(!decision.allowed);
        assert!(decision.reason.as_deref().unwrap().contains("rate limit"));
        assert!(decision.wait_time_ms.unwrap() > 0);
    }

    #[tokio::test]
    async fn burst_raises_the_window_capacity() {
        let limits = AgentLimits::new(config(4, true));
        // 1.5x burst capacity admits six.
        for _ in 0..6 {
            assert!(limits.can_start_task().await.allowed);
        }
        assert!(!limits.can_start_task().await.allowed);
    }

    #[tokio::test]
    async fn concurrent_task_ceiling_is_a_hard_counter() {
        let limits = AgentLimits::new(LimitConfig {
            max_concurrent_tasks: 2,
            ..Default::default()
        });
        assert!(limits.can_start_task().await.allowed);
        assert!(limits.can_start_task().await.allowed);
        let denied = limits.can_start_task().await;
        assert!(!denied.allowed);
        assert!(denied.reason.unwrap().contains("concurrent"));

        limits.task_finished().await;
        assert!(limits.can_start_task().await.allowed);
    }

    #[tokio::test]
    async fn memory_quota_tracks_outstanding_bytes() {
        let limits = AgentLimits::new(LimitConfig {
            memory_quota_bytes: 1_000,
            ..Default::default()
        });
        assert!(limits.can_perform_memory_op(800).await.allowed);
        let denied = limits.can_perform_memory_op(300).await;
        assert!(!denied.allowed);
        assert!(denied.reason.unwrap().contains("quota"));

        limits.release_memory(600).await;
        assert!(limits.can_perform_memory_op(300).await.allowed);
    }

    #[tokio::test]
    async fn cpu_budget_denies_with_a_refill_estimate() {
        let limits = AgentLimits::new(LimitConfig {
            cpu_quota_ms: 1_000.0,
            ..Default::default()
        });
        assert!(limits.can_use_cpu(1_000.0).await.allowed);
        let denied = limits.can_use_cpu(500.0).await;
        assert!(!denied.allowed);
        assert!(denied.wait_time_ms.unwrap() > 0);
    }

    #[tokio::test]
    async fn message_limit_is_independent_of_tasks() {
        let limits = AgentLimits::new(LimitConfig {
            tasks_per_minute: 1,
            messages_per_minute: 3,
            ..Default::default()
        });
        assert!(limits.can_start_task().await.allowed);
        assert!(!limits.can_start_task().await.allowed);
        for _ in 0..3 {
            assert!(limits.can_send_message().await.allowed);
        }
        assert!(!limits.can_send_message().await.allowed);
    }

    #[tokio::test]
    async fn registry_hands_out_one_limiter_per_agent() {
        let registry = LimitRegistry::new(LimitConfig {
            tasks_per_minute: 1,
            ..Default::default()
        });
        let a1 = registry.for_agent("a1").await;
        let a1_again = registry.for_agent("a1").await;
        assert!(Arc::ptr_eq(&a1, &a1_again));

        assert!(a1.can_start_task().await.allowed);
        assert!(!a1.can_start_task().await.allowed);
        // A different agent has a fresh budget.
        let a2 = registry.for_agent("a2").await;
        assert!(a2.can_start_task().await.allowed);
    }
}
