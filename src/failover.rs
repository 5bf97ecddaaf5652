//! Primary/secondary host selection with bounded retry backoff.
//!
//! State lives in [`DeviceState`], so every transition is persisted before it takes
//! effect and a reboot mid-failover resumes from the last committed state. Observers
//! subscribe to [`FailoverEvent`]s instead of registering callbacks.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::store::{DeviceState, StoreError};

/// Consecutive failures on the active host before switching
pub const DEFAULT_FAILOVER_THRESHOLD: u32 = 3;

/// Ascending retry delays in milliseconds; the last entry is the cap.
pub const DEFAULT_BACKOFF_MS: [u64; 6] = [1_000, 2_000, 5_000, 10_000, 20_000, 30_000];

/// How long to stay on the secondary before probing the primary again
pub const DEFAULT_PRIMARY_RETRY_AFTER_MS: u64 = 30 * 60 * 1000;

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Host or backoff settings the failover manager cannot run with
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailoverConfigError {
    #[error("primary host is empty")]
    EmptyPrimary,
    #[error("port must be non-zero")]
    ZeroPort,
    #[error("has_secondary disagrees with secondary_host")]
    SecondaryMismatch,
    #[error("backoff table must not be empty")]
    EmptyBackoff,
    #[error("backoff table must be non-decreasing (entry {index})")]
    DecreasingBackoff { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfiguration {
    primary_host: String,
    secondary_host: Option<String>,
    port: u16,
    has_secondary: bool,
}

impl HostConfiguration {
    pub fn new(primary: impl Into<String>, secondary: Option<&str>, port: u16) -> Self {
        let secondary_host = secondary.filter(|s| !s.is_empty()).map(str::to_string);
        Self {
            primary_host: primary.into(),
            has_secondary: secondary_host.is_some(),
            secondary_host,
            port,
        }
    }

    pub fn primary_host(&self) -> &str {
        &self.primary_host
    }

    pub fn secondary_host(&self) -> Option<&str> {
        self.secondary_host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn has_secondary(&self) -> bool {
        self.has_secondary
    }

    pub fn host_at(&self, index: u8) -> Option<&str> {
        match index {
            0 => Some(&self.primary_host),
            1 => self.secondary_host.as_deref(),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), FailoverConfigError> {
        if self.primary_host.is_empty() {
            return Err(FailoverConfigError::EmptyPrimary);
        }
        if self.port == 0 {
            return Err(FailoverConfigError::ZeroPort);
        }
        if self.has_secondary != self.secondary_host.is_some() {
            return Err(FailoverConfigError::SecondaryMismatch);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverState {
    pub current_host_index: u8,
    pub consecutive_failures: u32,
    pub backoff_level: usize,
    pub last_failure_ms: Option<u64>,
    pub is_in_failover_mode: bool,
    pub failover_start_ms: Option<u64>,
    pub total_failures: u64,
    pub primary_successes: u64,
    pub secondary_successes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveHost {
    Primary,
    Secondary,
}

impl ActiveHost {
    fn from_index(index: u8) -> Self {
        if index == 1 { ActiveHost::Secondary } else { ActiveHost::Primary }
    }

    fn index(self) -> u8 {
        match self {
            ActiveHost::Primary => 0,
            ActiveHost::Secondary => 1,
        }
    }
}

/// Immutable, bounds-checked retry delay table
#[derive(Debug, Clone)]
pub struct BackoffTable {
    delays: Vec<Duration>,
}

impl BackoffTable {
    pub fn new(delays_ms: &[u64]) -> Result<Self, FailoverConfigError> {
        if delays_ms.is_empty() {
            return Err(FailoverConfigError::EmptyBackoff);
        }
        if let Some(index) = delays_ms.windows(2).position(|w| w[0] > w[1]) {
            return Err(FailoverConfigError::DecreasingBackoff { index: index + 1 });
        }
        Ok(Self {
            delays: delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        })
    }

    pub fn max_level(&self) -> usize {
        self.delays.len() - 1
    }

    pub fn cap(&self) -> Duration {
        self.delays[self.max_level()]
    }

    /// Delay for `level`, clamped to the table's last entry.
    pub fn delay(&self, level: usize) -> Duration {
        self.delays[level.min(self.max_level())]
    }
}

impl Default for BackoffTable {
    fn default() -> Self {
        Self {
            delays: DEFAULT_BACKOFF_MS.iter().map(|ms| Duration::from_millis(*ms)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverEvent {
    FailureRecorded {
        host: String,
        consecutive_failures: u32,
        backoff_level: usize,
    },
    SwitchedHost {
        from: String,
        to: String,
    },
    Recovered {
        host: String,
    },
    ForcedReconnect {
        reason: String,
    },
}

/// What a failure report resulted in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Stay on the current host and wait out the backoff delay
    Retry { delay: Duration },
    /// The active host changed; retry immediately against it
    Switched { to: String },
    /// Report concerned a host that is no longer active
    Stale,
}

#[derive(Debug, Clone)]
pub struct FailoverPolicy {
    pub threshold: u32,
    pub backoff: BackoffTable,
    pub primary_retry_after: Duration,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FAILOVER_THRESHOLD,
            backoff: BackoffTable::default(),
            primary_retry_after: Duration::from_millis(DEFAULT_PRIMARY_RETRY_AFTER_MS),
        }
    }
}

pub struct FailoverManager {
    state: Arc<DeviceState>,
    clock: Arc<dyn Clock>,
    policy: FailoverPolicy,
    events: broadcast::Sender<FailoverEvent>,
}

impl FailoverManager {
    pub fn new(state: Arc<DeviceState>, clock: Arc<dyn Clock>, policy: FailoverPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state,
            clock,
            policy,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FailoverEvent> {
        self.events.subscribe()
    }

    pub fn policy(&self) -> &FailoverPolicy {
        &self.policy
    }

    pub fn snapshot(&self) -> Result<FailoverState, StoreError> {
        self.state.failover()
    }

    pub fn active_host(&self) -> Result<ActiveHost, StoreError> {
        Ok(ActiveHost::from_index(self.state.failover()?.current_host_index))
    }

    /// Hostname and port the next connection attempt should use.
    pub fn current_endpoint(&self) -> Result<(String, u16), StoreError> {
        let snapshot = self.state.snapshot()?;
        let host = snapshot
            .hosts
            .host_at(snapshot.failover.current_host_index)
            .unwrap_or(snapshot.hosts.primary_host())
            .to_string();
        Ok((host, snapshot.hosts.port()))
    }

    pub fn report_failure(&self, host: &str) -> Result<FailureOutcome, StoreError> {
        let now = self.clock.now_millis();
        let threshold = self.policy.threshold;
        let max_level = self.policy.backoff.max_level();

        let (outcome, events) = self.state.update_failover(|hosts, f| {
            let mut events = Vec::new();
            let active = hosts.host_at(f.current_host_index).unwrap_or(hosts.primary_host());
            if active != host {
                return (FailureOutcome::Stale, events);
            }

            f.consecutive_failures += 1;
            f.total_failures += 1;
            f.backoff_level = (f.backoff_level + 1).min(max_level);
            f.last_failure_ms = Some(now);
            events.push(FailoverEvent::FailureRecorded {
                host: host.to_string(),
                consecutive_failures: f.consecutive_failures,
                backoff_level: f.backoff_level,
            });

            if f.consecutive_failures < threshold || !hosts.has_secondary() {
                let delay = self.policy.backoff.delay(f.backoff_level);
                return (FailureOutcome::Retry { delay }, events);
            }

            match ActiveHost::from_index(f.current_host_index) {
                ActiveHost::Primary => {
                    f.current_host_index = ActiveHost::Secondary.index();
                    f.consecutive_failures = 0;
                    f.backoff_level = 0;
                    f.is_in_failover_mode = true;
                    f.failover_start_ms = Some(now);
                }
                ActiveHost::Secondary => {
                    // Both hosts are failing: fall back rather than stall on the secondary.
                    f.current_host_index = ActiveHost::Primary.index();
                    f.consecutive_failures = 0;
                    f.is_in_failover_mode = false;
                    f.failover_start_ms = None;
                }
            }
            let to = hosts
                .host_at(f.current_host_index)
                .unwrap_or(hosts.primary_host())
                .to_string();
            events.push(FailoverEvent::SwitchedHost {
                from: host.to_string(),
                to: to.clone(),
            });
            (FailureOutcome::Switched { to }, events)
        })?;

        match &outcome {
            FailureOutcome::Stale => debug!("Ignoring failure report for inactive host {}", host),
            FailureOutcome::Retry { delay } => {
                warn!("Connection failure on {}; next retry in {:?}", host, delay)
            }
            FailureOutcome::Switched { to } => warn!("Failing over from {} to {}", host, to),
        }
        self.publish(events);
        Ok(outcome)
    }

    pub fn report_success(&self, host: &str) -> Result<(), StoreError> {
        let recovered = self.state.update_failover(|hosts, f| {
            let active = hosts.host_at(f.current_host_index).unwrap_or(hosts.primary_host());
            if active != host {
                return false;
            }
            let had_failures = f.consecutive_failures > 0 || f.backoff_level > 0;
            f.consecutive_failures = 0;
            f.backoff_level = 0;
            f.is_in_failover_mode = false;
            match ActiveHost::from_index(f.current_host_index) {
                ActiveHost::Primary => f.primary_successes += 1,
                ActiveHost::Secondary => f.secondary_successes += 1,
            }
            had_failures
        })?;

        if recovered {
            info!("Connection to {} recovered", host);
            self.publish(vec![FailoverEvent::Recovered {
                host: host.to_string(),
            }]);
        }
        Ok(())
    }

    pub fn is_ready_for_retry(&self) -> Result<bool, StoreError> {
        let f = self.state.failover()?;
        let Some(last) = f.last_failure_ms else {
            return Ok(true);
        };
        let now = self.clock.now_millis();
        if now < last {
            // Clock stepped backwards; do not wedge on a future timestamp.
            return Ok(true);
        }
        let delay = self.policy.backoff.delay(f.backoff_level);
        Ok(Duration::from_millis(now - last) >= delay)
    }

    pub fn next_retry_delay(&self) -> Result<Duration, StoreError> {
        Ok(self.policy.backoff.delay(self.state.failover()?.backoff_level))
    }

    /// Time left before [`is_ready_for_retry`](Self::is_ready_for_retry) turns true.
    pub fn remaining_backoff(&self) -> Result<Duration, StoreError> {
        let f = self.state.failover()?;
        let Some(last) = f.last_failure_ms else {
            return Ok(Duration::ZERO);
        };
        let elapsed = Duration::from_millis(self.clock.now_millis().saturating_sub(last));
        Ok(self.policy.backoff.delay(f.backoff_level).saturating_sub(elapsed))
    }

    /// True once the device has been on the secondary long enough to retry the primary.
    pub fn should_retry_primary(&self) -> Result<bool, StoreError> {
        let f = self.state.failover()?;
        if ActiveHost::from_index(f.current_host_index) != ActiveHost::Secondary {
            return Ok(false);
        }
        let Some(start) = f.failover_start_ms else {
            return Ok(false);
        };
        let elapsed = self.clock.now_millis().saturating_sub(start);
        Ok(Duration::from_millis(elapsed) >= self.policy.primary_retry_after)
    }

    pub fn return_to_primary(&self) -> Result<(), StoreError> {
        let switched = self.state.update_failover(|hosts, f| {
            if f.current_host_index == ActiveHost::Primary.index() {
                return None;
            }
            let from = hosts.host_at(f.current_host_index).unwrap_or_default().to_string();
            f.current_host_index = ActiveHost::Primary.index();
            f.consecutive_failures = 0;
            f.backoff_level = 0;
            f.is_in_failover_mode = false;
            f.failover_start_ms = None;
            Some((from, hosts.primary_host().to_string()))
        })?;

        if let Some((from, to)) = switched {
            info!("Returning from {} to primary host {}", from, to);
            self.publish(vec![FailoverEvent::SwitchedHost { from, to }]);
        }
        Ok(())
    }

    /// Run a committing operation on the blocking pool; state writes are fsynced.
    pub async fn commit_blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&FailoverManager) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&manager))
            .await
            .map_err(|e| StoreError::Writer(e.to_string()))?
    }

    /// Ask the connection owner to drop and re-establish the current session.
    pub fn force_reconnect(&self, reason: &str) {
        warn!("Forced reconnect requested: {}", reason);
        self.publish(vec![FailoverEvent::ForcedReconnect {
            reason: reason.to_string(),
        }]);
    }

    fn publish(&self, events: Vec<FailoverEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}
