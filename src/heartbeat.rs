//! C14 — Heartbeat monitor: periodic per-component health probes with a
//! bounded history and an aggregated status (§4.9).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const HISTORY_LIMIT: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub component: String,
    pub health: ComponentHealth,
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatStatus {
    pub overall: OverallStatus,
    pub components: HashMap<String, ProbeResult>,
    pub running: bool,
}

/// A single component's health probe. Probes must be fast and side-effect
/// free; the monitor runs all of them every tick.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> ProbeResult;
}

struct ComponentHistory {
    probe: Arc<dyn HealthProbe>,
    history: VecDeque<ProbeResult>,
}

/// Wraps a boxed async closure as a `HealthProbe`, so callers wiring up a
/// concrete component (vector store, embedder, LLM client) don't each need
/// their own probe type.
pub struct FnProbe<F> {
    name: String,
    check_fn: F,
}

impl<F, Fut> FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = (ComponentHealth, Option<String>)> + Send,
{
    pub fn new(name: impl Into<String>, check_fn: F) -> Self {
        Self {
            name: name.into(),
            check_fn,
        }
    }
}

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = (ComponentHealth, Option<String>)> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> ProbeResult {
        let (health, message) = (self.check_fn)().await;
        ProbeResult {
            component: self.name.clone(),
            health,
            message,
            checked_at: Utc::now(),
            latency_ms: 0,
        }
    }
}

/// Periodically probes every registered component, keeping a bounded ring
/// of recent results per component and deriving an overall status: any
/// `Unhealthy` component makes the whole system unhealthy; any `Degraded`
/// (with no unhealthy component) makes it degraded; otherwise healthy.
pub struct HeartbeatMonitor {
    components: RwLock<Vec<ComponentHistory>>,
    interval: Duration,
    running: AtomicBool,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            components: RwLock::new(Vec::new()),
            interval,
            running: AtomicBool::new(false),
            handle: std::sync::Mutex::new(None),
        }
    }

    pub fn register(&self, probe: Arc<dyn HealthProbe>) {
        let mut components = self.components.write();
        if components.iter().any(|c| c.probe.name() == probe.name()) {
            return;
        }
        components.push(ComponentHistory {
            probe,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        });
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            loop {
                ticker.tick().await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.check_now().await;
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Runs every registered probe immediately and records the results.
    pub async fn check_now(&self) -> HeartbeatStatus {
        let probes: Vec<Arc<dyn HealthProbe>> =
            self.components.read().iter().map(|c| c.probe.clone()).collect();

        let mut results = Vec::with_capacity(probes.len());
        for probe in probes {
            let start = std::time::Instant::now();
            let mut result = probe.check().await;
            result.latency_ms = start.elapsed().as_millis() as u64;
            results.push(result);
        }

        {
            let mut components = self.components.write();
            for result in &results {
                if let Some(entry) = components.iter_mut().find(|c| c.probe.name() == result.component) {
                    if entry.history.len() == HISTORY_LIMIT {
                        entry.history.pop_front();
                    }
                    entry.history.push_back(result.clone());
                }
            }
        }

        self.status()
    }

    pub fn status(&self) -> HeartbeatStatus {
        let components = self.components.read();
        let mut latest = HashMap::new();
        let mut any_unhealthy = false;
        let mut any_degraded = false;

        for entry in components.iter() {
            if let Some(result) = entry.history.back() {
                match result.health {
                    ComponentHealth::Unhealthy => any_unhealthy = true,
                    ComponentHealth::Degraded => any_degraded = true,
                    ComponentHealth::Healthy => {}
                }
                latest.insert(entry.probe.name().to_string(), result.clone());
            }
        }

        let overall = if any_unhealthy {
            OverallStatus::Unhealthy
        } else if any_degraded {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };

        HeartbeatStatus {
            overall,
            components: latest,
            running: self.running.load(Ordering::SeqCst),
        }
    }

    /// Returns up to `limit` most recent results for `component`, newest last.
    pub fn history(&self, component: &str, limit: usize) -> Vec<ProbeResult> {
        let components = self.components.read();
        let Some(entry) = components.iter().find(|c| c.probe.name() == component) else {
            return Vec::new();
        };
        let len = entry.history.len();
        let skip = len.saturating_sub(limit);
        entry.history.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FlakyProbe {
        name: String,
        calls: AtomicU32,
        fail_every: u32,
    }

    #[async_trait]
    impl HealthProbe for FlakyProbe {
        fn name(&self) -> &str {
            &self.name
        }
        async fn check(&self) -> ProbeResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let health = if self.fail_every != 0 && n % self.fail_every == 0 {
                ComponentHealth::Unhealthy
            } else {
                ComponentHealth::Healthy
            };
            ProbeResult {
                component: self.name.clone(),
                health,
                message: None,
                checked_at: Utc::now(),
                latency_ms: 0,
            }
        }
    }

    #[tokio::test]
    async fn healthy_components_yield_overall_healthy() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(3600));
        monitor.register(Arc::new(FlakyProbe {
            name: "vector_store".to_string(),
            calls: AtomicU32::new(0),
            fail_every: 0,
        }));
        let status = monitor.check_now().await;
        assert_eq!(status.overall, OverallStatus::Healthy);
    }

    #[tokio::test]
    async fn one_unhealthy_component_makes_overall_unhealthy() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(3600));
        monitor.register(Arc::new(FlakyProbe {
            name: "llm".to_string(),
            calls: AtomicU32::new(0),
            fail_every: 1,
        }));
        monitor.register(Arc::new(FlakyProbe {
            name: "vector_store".to_string(),
            calls: AtomicU32::new(0),
            fail_every: 0,
        }));
        let status = monitor.check_now().await;
        assert_eq!(status.overall, OverallStatus::Unhealthy);
        assert_eq!(status.components.len(), 2);
    }

    #[tokio::test]
    async fn history_is_bounded_and_returns_newest_last() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(3600));
        monitor.register(Arc::new(FlakyProbe {
            name: "llm".to_string(),
            calls: AtomicU32::new(0),
            fail_every: 3,
        }));
        for _ in 0..30 {
            monitor.check_now().await;
        }
        let history = monitor.history("llm", 100);
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.last().unwrap().health, ComponentHealth::Unhealthy);
    }

    #[tokio::test]
    async fn registering_same_name_twice_is_idempotent() {
        let monitor = HeartbeatMonitor::new(Duration::from_secs(3600));
        monitor.register(Arc::new(FlakyProbe {
            name: "llm".to_string(),
            calls: AtomicU32::new(0),
            fail_every: 0,
        }));
        monitor.register(Arc::new(FlakyProbe {
            name: "llm".to_string(),
            calls: AtomicU32::new(0),
            fail_every: 0,
        }));
        monitor.check_now().await;
        assert_eq!(monitor.status().components.len(), 1);
    }
}
