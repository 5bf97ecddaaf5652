use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use anyhow::Result;
use log::{debug, error};

use crate::clock::Clock;

/// System health status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Unknown,
    Warning,
    Critical,
}

/// Individual health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub last_updated: u64, // Unix millis
    pub duration_ms: u64,
}

impl HealthCheck {
    pub fn new(name: &str, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            last_updated: 0,
            duration_ms: 0,
        }
    }
}

/// Overall system health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub timestamp: u64,
    pub uptime_seconds: u64,
}

/// Health check function type
pub type HealthCheckFn = Box<dyn Fn() -> Result<HealthCheck> + Send + Sync>;

/// Runs named checks over the device components and keeps the latest report.
pub struct HealthMonitor {
    checks: Mutex<Vec<(String, HealthCheckFn)>>,
    last_report: Mutex<Option<HealthReport>>,
    clock: Arc<dyn Clock>,
    start_time: Instant,
}

impl HealthMonitor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            checks: Mutex::new(Vec::new()),
            last_report: Mutex::new(None),
            clock,
            start_time: Instant::now(),
        }
    }

    /// Register a health check; a later registration under the same name replaces it.
    pub fn register_check<F>(&self, name: &str, check_fn: F)
    where
        F: Fn() -> Result<HealthCheck> + Send + Sync + 'static,
    {
        if let Ok(mut checks) = self.checks.lock() {
            checks.retain(|(existing, _)| existing != name);
            checks.push((name.to_string(), Box::new(check_fn)));
            debug!("Registered health check: {}", name);
        }
    }

    /// Run all health checks; the worst individual status wins.
    pub fn run_health_checks(&self) -> HealthReport {
        let mut results = Vec::new();
        let now = self.clock.now_millis();

        if let Ok(checks) = self.checks.lock() {
            for (name, check_fn) in checks.iter() {
                let start = Instant::now();
                let mut result = match check_fn() {
                    Ok(result) => result,
                    Err(e) => {
                        error!("Health check '{}' failed: {:#}", name, e);
                        HealthCheck::new(name, HealthStatus::Critical, format!("Health check failed: {:#}", e))
                    }
                };
                result.duration_ms = start.elapsed().as_millis() as u64;
                result.last_updated = now;
                results.push(result);
            }
        }

        let overall_status = results
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Unknown);

        let report = HealthReport {
            overall_status,
            checks: results,
            timestamp: now,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        };
        if let Ok(mut last) = self.last_report.lock() {
            *last = Some(report.clone());
        }
        report
    }

    pub fn get_latest_report(&self) -> Option<HealthReport> {
        self.last_report.lock().ok().and_then(|r| r.clone())
    }
}

/// Checks over the device components
pub mod checks {
    use super::{HealthCheck, HealthStatus};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use anyhow::Result;
    use tokio::sync::watch;

    use crate::alerting::{AlertStats, LockdownController, RemoteAlertSink};
    use crate::audio_session::AudioState;
    use crate::clock::Clock;
    use crate::error_recovery::CircuitBreakerState;
    use crate::failover::{ActiveHost, FailoverManager};

    pub fn clock_sync(clock: Arc<dyn Clock>) -> impl Fn() -> Result<HealthCheck> + Send + Sync {
        move || {
            Ok(if clock.is_synchronized() {
                HealthCheck::new("clock", HealthStatus::Healthy, "wall clock synchronised")
            } else {
                HealthCheck::new("clock", HealthStatus::Critical, "wall clock not synchronised; connects refused")
            })
        }
    }

    pub fn failover(manager: Arc<FailoverManager>) -> impl Fn() -> Result<HealthCheck> + Send + Sync {
        move || {
            let state = manager.snapshot()?;
            let active = manager.active_host()?;
            let (host, _) = manager.current_endpoint()?;
            let message = format!(
                "active {} ({:?}), {} consecutive failures, backoff level {}, {} lifetime failures",
                host, active, state.consecutive_failures, state.backoff_level, state.total_failures
            );
            let status = if active == ActiveHost::Secondary || state.consecutive_failures > 0 {
                HealthStatus::Warning
            } else {
                HealthStatus::Healthy
            };
            Ok(HealthCheck::new("failover", status, message))
        }
    }

    pub fn lockdown(controller: Arc<LockdownController>) -> impl Fn() -> Result<HealthCheck> + Send + Sync {
        move || {
            Ok(if controller.is_active() {
                HealthCheck::new("lockdown", HealthStatus::Critical, "lockdown active; streaming suspended")
            } else {
                HealthCheck::new("lockdown", HealthStatus::Healthy, "not in lockdown")
            })
        }
    }

    pub fn audio_pipeline(
        state: watch::Receiver<AudioState>,
        recovery_exhausted: Arc<AtomicBool>,
    ) -> impl Fn() -> Result<HealthCheck> + Send + Sync {
        move || {
            let current = *state.borrow();
            Ok(match current {
                AudioState::Error if recovery_exhausted.load(Ordering::Relaxed) => HealthCheck::new(
                    "audio",
                    HealthStatus::Critical,
                    "audio pipeline in ERROR; operator intervention required",
                ),
                AudioState::Error => HealthCheck::new("audio", HealthStatus::Warning, "audio pipeline recovering"),
                other => HealthCheck::new("audio", HealthStatus::Healthy, format!("audio pipeline {}", other)),
            })
        }
    }

    pub fn alert_delivery(
        remote: Option<Arc<RemoteAlertSink>>,
        stats: Arc<AlertStats>,
    ) -> impl Fn() -> Result<HealthCheck> + Send + Sync {
        move || {
            let snapshot = stats.snapshot();
            let summary = format!(
                "{} alerts raised, {} delivered, {} diverted, {} suppressed",
                snapshot.alerts_raised, snapshot.remote_delivered, snapshot.remote_diverted, snapshot.alerts_suppressed
            );
            let status = match remote.as_ref().map(|r| r.breaker_state()) {
                None => HealthStatus::Unknown,
                Some(CircuitBreakerState::Open) => HealthStatus::Warning,
                Some(_) if snapshot.audit_failures > 0 => HealthStatus::Warning,
                Some(_) => HealthStatus::Healthy,
            };
            Ok(HealthCheck::new("alerts", status, summary))
        }
    }
}
