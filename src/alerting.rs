//! Security alerting.
//!
//! Security events from every component feed a fixed registry of attack patterns. Each
//! pattern counts matching events in a fixed window; crossing its threshold raises one
//! alert and resets the counter. Alerts pass a per-type cooldown and then fan out to the
//! local indicator, the remote alert sink and the audit log, independently of each other.
//! Critical patterns can escalate to lockdown, which suspends audio streaming until an
//! operator clears it.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error_recovery::{CircuitBreaker, CircuitBreakerState, DEFAULT_BREAKER_THRESHOLD};
use crate::failover::{FailoverEvent, FailoverManager};
use crate::http;
use crate::indicator::Indicator;
use crate::store::{DeviceState, StoreError};
use crate::transport::Connector;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_ALERT_COOLDOWN: Duration = Duration::from_secs(60);
const ALERT_SOURCE: &str = "companion-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn blink_count(&self) -> u8 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 5,
        }
    }

    pub fn tone_hz(&self) -> u32 {
        match self {
            Severity::Low => 440,
            Severity::Medium => 660,
            Severity::High => 880,
            Severity::Critical => 1_200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AuthFailure,
    PairingFailure,
    TransportFailure,
    InvalidMessage,
    ConnectionRejected,
    TamperDetected,
    ClockDesync,
    FailoverTriggered,
}

/// Something security-relevant observed by another component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecurityEvent {
    AuthFailure { host: String, status: u16 },
    PairingFailure { host: String, reason: String },
    TransportFailure { host: String, reason: String },
    InvalidMessage { detail: String },
    /// Backend refused the streaming upgrade outright
    ConnectionRejected { host: String, reason: String },
    TamperDetected { detail: String },
    ClockDesync,
    FailoverTriggered { from: String, to: String },
}

impl SecurityEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SecurityEvent::AuthFailure { .. } => EventKind::AuthFailure,
            SecurityEvent::PairingFailure { .. } => EventKind::PairingFailure,
            SecurityEvent::TransportFailure { .. } => EventKind::TransportFailure,
            SecurityEvent::InvalidMessage { .. } => EventKind::InvalidMessage,
            SecurityEvent::ConnectionRejected { .. } => EventKind::ConnectionRejected,
            SecurityEvent::TamperDetected { .. } => EventKind::TamperDetected,
            SecurityEvent::ClockDesync => EventKind::ClockDesync,
            SecurityEvent::FailoverTriggered { .. } => EventKind::FailoverTriggered,
        }
    }
}

/// Cloneable, non-blocking handle components use to report security events.
#[derive(Clone)]
pub struct SecurityEvents {
    tx: mpsc::Sender<SecurityEvent>,
}

impl SecurityEvents {
    pub fn channel() -> (Self, mpsc::Receiver<SecurityEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    pub fn report(&self, event: SecurityEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("Security event dropped: {}", e);
        }
    }
}

/// What happens beyond the alert itself when a pattern fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternAction {
    AlertOnly,
    /// Drop the current session and re-authenticate
    ForceReconnect,
    Lockdown,
}

#[derive(Debug, Clone)]
pub struct AttackPattern {
    pub name: &'static str,
    pub title: &'static str,
    pub kinds: &'static [EventKind],
    pub threshold: u32,
    pub window: Duration,
    pub severity: Severity,
    pub action: PatternAction,
}

impl AttackPattern {
    pub fn matches(&self, event: &SecurityEvent) -> bool {
        self.kinds.contains(&event.kind())
    }
}

pub fn default_patterns() -> Vec<AttackPattern> {
    vec![
        AttackPattern {
            name: "brute_force_auth",
            title: "Repeated authentication failures",
            kinds: &[EventKind::AuthFailure],
            threshold: 5,
            window: Duration::from_secs(5 * 60),
            severity: Severity::High,
            action: PatternAction::AlertOnly,
        },
        AttackPattern {
            name: "pairing_abuse",
            title: "Repeated pairing failures",
            kinds: &[EventKind::PairingFailure],
            threshold: 3,
            window: Duration::from_secs(10 * 60),
            severity: Severity::Medium,
            action: PatternAction::AlertOnly,
        },
        AttackPattern {
            name: "connection_flood",
            title: "Connection flood",
            kinds: &[EventKind::ConnectionRejected],
            threshold: 20,
            window: Duration::from_secs(60),
            severity: Severity::Critical,
            action: PatternAction::Lockdown,
        },
        AttackPattern {
            name: "transport_instability",
            title: "Unstable backend transport",
            kinds: &[EventKind::TransportFailure, EventKind::ClockDesync],
            threshold: 10,
            window: Duration::from_secs(5 * 60),
            severity: Severity::Medium,
            action: PatternAction::AlertOnly,
        },
        AttackPattern {
            name: "malformed_traffic",
            title: "Malformed server traffic",
            kinds: &[EventKind::InvalidMessage],
            threshold: 10,
            window: Duration::from_secs(60),
            severity: Severity::Medium,
            action: PatternAction::ForceReconnect,
        },
        AttackPattern {
            name: "tamper",
            title: "Tamper indicator",
            kinds: &[EventKind::TamperDetected],
            threshold: 1,
            window: Duration::from_secs(60),
            severity: Severity::Critical,
            action: PatternAction::Lockdown,
        },
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityAlert {
    pub alert_id: Uuid,
    pub pattern: String,
    pub title: String,
    pub severity: Severity,
    pub action: PatternAction,
    pub count: u32,
    pub window_secs: u64,
    pub timestamp_ms: u64,
    pub trigger: SecurityEvent,
}

#[derive(Debug, Clone, Copy, Default)]
struct WindowCounter {
    window_start_ms: u64,
    count: u32,
}

/// Fixed-window threshold counters, one per registered pattern.
pub struct PatternEngine {
    patterns: Vec<AttackPattern>,
    counters: Vec<WindowCounter>,
}

impl PatternEngine {
    pub fn new(patterns: Vec<AttackPattern>) -> Self {
        let counters = vec![WindowCounter::default(); patterns.len()];
        Self { patterns, counters }
    }

    pub fn patterns(&self) -> &[AttackPattern] {
        &self.patterns
    }

    pub fn count(&self, pattern: &str) -> Option<u32> {
        self.patterns
            .iter()
            .position(|p| p.name == pattern)
            .map(|i| self.counters[i].count)
    }

    /// Count `event` against every matching pattern; returns the alerts it crossed.
    pub fn observe(&mut self, event: &SecurityEvent, now_ms: u64) -> Vec<SecurityAlert> {
        let mut alerts = Vec::new();
        for (pattern, counter) in self.patterns.iter().zip(self.counters.iter_mut()) {
            if !pattern.matches(event) {
                continue;
            }

            let window_ms = pattern.window.as_millis() as u64;
            // A clock step backwards also starts a new window
            let expired = now_ms < counter.window_start_ms
                || now_ms - counter.window_start_ms > window_ms
                || counter.count == 0;
            if expired {
                counter.window_start_ms = now_ms;
                counter.count = 0;
            }
            counter.count += 1;

            if counter.count >= pattern.threshold {
                alerts.push(SecurityAlert {
                    alert_id: Uuid::new_v4(),
                    pattern: pattern.name.to_string(),
                    title: pattern.title.to_string(),
                    severity: pattern.severity,
                    action: pattern.action,
                    count: counter.count,
                    window_secs: pattern.window.as_secs(),
                    timestamp_ms: now_ms,
                    trigger: event.clone(),
                });
                *counter = WindowCounter::default();
            }
        }
        alerts
    }
}

/// Per-alert-type rate limit applied after the pattern engine.
pub struct AlertCooldown {
    period_ms: u64,
    last_emitted: HashMap<String, u64>,
    suppressed: u64,
}

impl AlertCooldown {
    pub fn new(period: Duration) -> Self {
        Self {
            period_ms: period.as_millis() as u64,
            last_emitted: HashMap::new(),
            suppressed: 0,
        }
    }

    pub fn allow(&mut self, alert_type: &str, now_ms: u64) -> bool {
        if let Some(&last) = self.last_emitted.get(alert_type) {
            if now_ms >= last && now_ms - last < self.period_ms {
                self.suppressed += 1;
                return false;
            }
        }
        self.last_emitted.insert(alert_type.to_string(), now_ms);
        true
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

/// Append-only JSON lines file, flushed per record.
struct JsonLinesFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesFile {
    fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    fn append(&self, record: &serde_json::Value) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("{} lock poisoned", self.path.display()))?;
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }
}

/// Durable local record of alerts and lockdown transitions
pub struct AuditLog {
    file: JsonLinesFile,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            file: JsonLinesFile::open(path.as_ref())?,
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    pub fn record_alert(&self, alert: &SecurityAlert) -> Result<()> {
        self.file.append(&serde_json::json!({
            "timestamp_ms": self.clock.now_millis(),
            "entry": "alert",
            "alert": alert,
        }))
    }

    pub fn record_lockdown(&self, engaged: bool, detail: &str) -> Result<()> {
        self.file.append(&serde_json::json!({
            "timestamp_ms": self.clock.now_millis(),
            "entry": if engaged { "lockdown_engaged" } else { "lockdown_cleared" },
            "detail": detail,
        }))
    }
}

/// Local file alerts are diverted to while remote delivery is failing
pub struct FallbackChannel {
    file: JsonLinesFile,
}

impl FallbackChannel {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: JsonLinesFile::open(path.as_ref())?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.file.path
    }

    pub fn store(&self, payload: &AlertPayload) -> Result<()> {
        self.file.append(&serde_json::to_value(payload)?)
    }
}

/// Body of the alert sink POST
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertPayload {
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub source: String,
    pub timestamp: u64,
    pub device_id: String,
    pub evidence: serde_json::Value,
}

impl AlertPayload {
    pub fn from_alert(alert: &SecurityAlert, device_id: &str) -> Self {
        Self {
            alert_type: alert.pattern.clone(),
            severity: alert.severity,
            title: alert.title.clone(),
            description: format!(
                "{} matching events within {}s",
                alert.count, alert.window_secs
            ),
            source: ALERT_SOURCE.to_string(),
            timestamp: alert.timestamp_ms,
            device_id: device_id.to_string(),
            evidence: serde_json::json!({
                "alert_id": alert.alert_id,
                "count": alert.count,
                "window_secs": alert.window_secs,
                "trigger": alert.trigger,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Delivery failed; breaker still closed
    Failed,
    /// Stored in the fallback channel
    Diverted,
    Lost,
}

/// Best-effort HTTP alert delivery to the active backend host.
pub struct RemoteAlertSink {
    connector: Arc<dyn Connector>,
    failover: Arc<FailoverManager>,
    path: String,
    breaker: Mutex<CircuitBreaker>,
    fallback: Arc<FallbackChannel>,
}

impl RemoteAlertSink {
    pub fn new(
        connector: Arc<dyn Connector>,
        failover: Arc<FailoverManager>,
        path: impl Into<String>,
        failure_limit: u32,
        fallback: FallbackChannel,
    ) -> Self {
        Self {
            connector,
            failover,
            path: path.into(),
            breaker: Mutex::new(CircuitBreaker::new(
                "remote-alerts",
                if failure_limit == 0 { DEFAULT_BREAKER_THRESHOLD } else { failure_limit },
                Duration::from_secs(300),
            )),
            fallback: Arc::new(fallback),
        }
    }

    pub fn breaker_state(&self) -> CircuitBreakerState {
        self.breaker
            .lock()
            .map(|b| b.state())
            .unwrap_or(CircuitBreakerState::Open)
    }

    pub fn fallback_path(&self) -> &Path {
        self.fallback.path()
    }

    pub async fn deliver(&self, payload: &AlertPayload) -> DeliveryOutcome {
        let allowed = self.breaker.lock().map(|mut b| b.allow_request()).unwrap_or(false);
        if !allowed {
            return self.divert(payload).await;
        }

        let result = match self.failover.current_endpoint() {
            Ok((host, port)) => http::post_json(self.connector.as_ref(), &host, port, &self.path, payload)
                .await
                .map_err(|e| e.to_string())
                .and_then(|resp| {
                    if resp.is_success() {
                        Ok(())
                    } else {
                        Err(format!("HTTP {}", resp.status))
                    }
                }),
            Err(e) => Err(e.to_string()),
        };

        let now_open = match self.breaker.lock() {
            Ok(mut breaker) => {
                match &result {
                    Ok(()) => breaker.record_success(),
                    Err(_) => breaker.record_failure(),
                }
                breaker.state() == CircuitBreakerState::Open
            }
            Err(_) => true,
        };

        match result {
            Ok(()) => {
                debug!("Alert {} delivered", payload.alert_type);
                DeliveryOutcome::Delivered
            }
            Err(reason) => {
                warn!("Alert delivery failed: {}", reason);
                if now_open {
                    self.divert(payload).await
                } else {
                    DeliveryOutcome::Failed
                }
            }
        }
    }

    async fn divert(&self, payload: &AlertPayload) -> DeliveryOutcome {
        let fallback = Arc::clone(&self.fallback);
        let record = payload.clone();
        let stored = tokio::task::spawn_blocking(move || fallback.store(&record))
            .await
            .unwrap_or_else(|e| Err(anyhow::anyhow!("fallback writer: {}", e)));
        match stored {
            Ok(()) => {
                info!("Alert {} written to fallback channel", payload.alert_type);
                DeliveryOutcome::Diverted
            }
            Err(e) => {
                error!("Fallback channel write failed: {:#}", e);
                DeliveryOutcome::Lost
            }
        }
    }
}

/// Explicit, persisted, operator-cleared suspension of non-essential subsystems.
pub struct LockdownController {
    state: Arc<DeviceState>,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<AuditLog>>,
    enabled: bool,
    tx: watch::Sender<bool>,
}

impl LockdownController {
    pub fn new(
        state: Arc<DeviceState>,
        clock: Arc<dyn Clock>,
        audit: Option<Arc<AuditLog>>,
        enabled: bool,
    ) -> Result<Self, StoreError> {
        let active = state.lockdown()?.active;
        if active {
            warn!("Device starting in lockdown");
        }
        let (tx, _) = watch::channel(active);
        Ok(Self {
            state,
            clock,
            audit,
            enabled,
            tx,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_active(&self) -> bool {
        *self.tx.borrow()
    }

    /// Enter lockdown. Returns true if this call engaged it.
    pub fn engage(&self, reason: &str) -> Result<bool, StoreError> {
        if !self.enabled {
            warn!("Lockdown requested ({}) but disabled by configuration", reason);
            return Ok(false);
        }
        let now = self.clock.now_millis();
        let engaged = self.state.update_lockdown(|record| {
            if record.active {
                return false;
            }
            record.active = true;
            record.reason = Some(reason.to_string());
            record.engaged_at_ms = Some(now);
            true
        })?;
        if engaged {
            error!("LOCKDOWN engaged: {}", reason);
            self.audit_transition(true, reason);
        }
        self.tx.send_replace(true);
        Ok(engaged)
    }

    /// Leave lockdown; only an identified operator may do this.
    pub fn clear(&self, operator: &str) -> Result<bool, StoreError> {
        if operator.trim().is_empty() {
            return Err(StoreError::Invalid("operator name is required to clear lockdown".to_string()));
        }
        let cleared = self.state.update_lockdown(|record| {
            let was_active = record.active;
            *record = Default::default();
            was_active
        })?;
        if cleared {
            warn!("Lockdown cleared by operator {}", operator);
            self.audit_transition(false, &format!("cleared by {}", operator));
        }
        self.tx.send_replace(false);
        Ok(cleared)
    }

    /// Re-read the persisted flag, picking up an out-of-process clear.
    pub fn refresh(&self) -> Result<bool, StoreError> {
        let active = self.state.reload_lockdown()?.active;
        if active != self.is_active() {
            info!("Lockdown state changed externally: active={}", active);
            self.tx.send_replace(active);
        }
        Ok(active)
    }

    fn audit_transition(&self, engaged: bool, detail: &str) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record_lockdown(engaged, detail) {
                error!("Audit log write failed: {:#}", e);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct AlertStats {
    pub events_observed: AtomicU64,
    pub alerts_raised: AtomicU64,
    pub alerts_suppressed: AtomicU64,
    pub remote_delivered: AtomicU64,
    pub remote_diverted: AtomicU64,
    pub audit_failures: AtomicU64,
}

impl AlertStats {
    pub fn snapshot(&self) -> AlertStatsSnapshot {
        AlertStatsSnapshot {
            events_observed: self.events_observed.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
            alerts_suppressed: self.alerts_suppressed.load(Ordering::Relaxed),
            remote_delivered: self.remote_delivered.load(Ordering::Relaxed),
            remote_diverted: self.remote_diverted.load(Ordering::Relaxed),
            audit_failures: self.audit_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertStatsSnapshot {
    pub events_observed: u64,
    pub alerts_raised: u64,
    pub alerts_suppressed: u64,
    pub remote_delivered: u64,
    pub remote_diverted: u64,
    pub audit_failures: u64,
}

/// The alerting/housekeeping unit.
pub struct AlertingService {
    device_id: String,
    engine: PatternEngine,
    cooldown: AlertCooldown,
    clock: Arc<dyn Clock>,
    indicator: Arc<dyn Indicator>,
    remote: Option<Arc<RemoteAlertSink>>,
    audit: Option<Arc<AuditLog>>,
    lockdown: Arc<LockdownController>,
    failover: Option<Arc<FailoverManager>>,
    stats: Arc<AlertStats>,
}

impl AlertingService {
    pub fn new(
        device_id: impl Into<String>,
        patterns: Vec<AttackPattern>,
        cooldown: Duration,
        clock: Arc<dyn Clock>,
        indicator: Arc<dyn Indicator>,
        lockdown: Arc<LockdownController>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            engine: PatternEngine::new(patterns),
            cooldown: AlertCooldown::new(cooldown),
            clock,
            indicator,
            remote: None,
            audit: None,
            lockdown,
            failover: None,
            stats: Arc::new(AlertStats::default()),
        }
    }

    pub fn with_remote(mut self, remote: Arc<RemoteAlertSink>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_failover(mut self, failover: Arc<FailoverManager>) -> Self {
        self.failover = Some(failover);
        self
    }

    pub fn stats(&self) -> Arc<AlertStats> {
        Arc::clone(&self.stats)
    }

    pub fn engine(&self) -> &PatternEngine {
        &self.engine
    }

    /// Observe one event and fan out any resulting alerts. Returns the alerts emitted.
    pub fn handle_event(&mut self, event: SecurityEvent) -> Vec<SecurityAlert> {
        self.stats.events_observed.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_millis();
        debug!("Security event: {:?}", event);

        let mut emitted = Vec::new();
        for alert in self.engine.observe(&event, now) {
            self.apply_action(&alert);

            if !self.cooldown.allow(&alert.pattern, now) {
                self.stats.alerts_suppressed.fetch_add(1, Ordering::Relaxed);
                debug!("Alert {} suppressed by cooldown", alert.pattern);
                continue;
            }
            self.stats.alerts_raised.fetch_add(1, Ordering::Relaxed);
            warn!(
                "SECURITY ALERT [{:?}] {}: {} events in {}s",
                alert.severity, alert.pattern, alert.count, alert.window_secs
            );
            self.fan_out(&alert);
            emitted.push(alert);
        }
        emitted
    }

    fn apply_action(&self, alert: &SecurityAlert) {
        match alert.action {
            PatternAction::AlertOnly => {}
            PatternAction::ForceReconnect => {
                if let Some(failover) = &self.failover {
                    failover.force_reconnect(&alert.pattern);
                }
            }
            PatternAction::Lockdown => {
                if let Err(e) = self.lockdown.engage(&format!("{} ({})", alert.title, alert.pattern)) {
                    error!("Failed to persist lockdown: {}", e);
                }
            }
        }
    }

    fn fan_out(&self, alert: &SecurityAlert) {
        self.indicator.signal_alert(alert.severity);

        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record_alert(alert) {
                self.stats.audit_failures.fetch_add(1, Ordering::Relaxed);
                error!("Audit log write failed: {:#}", e);
            }
        }

        if let Some(remote) = &self.remote {
            let remote = Arc::clone(remote);
            let stats = Arc::clone(&self.stats);
            let payload = AlertPayload::from_alert(alert, &self.device_id);
            // Delivery runs on its own task so a slow backend never holds up the others
            tokio::spawn(async move {
                match remote.deliver(&payload).await {
                    DeliveryOutcome::Delivered => {
                        stats.remote_delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    DeliveryOutcome::Diverted => {
                        stats.remote_diverted.fetch_add(1, Ordering::Relaxed);
                    }
                    DeliveryOutcome::Failed | DeliveryOutcome::Lost => {}
                }
            });
        }
    }

    /// Run until `shutdown` flips to true, consuming security events and failover
    /// notifications and periodically re-reading the lockdown flag.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<SecurityEvent>,
        mut failover_events: broadcast::Receiver<FailoverEvent>,
        housekeeping_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Alerting service started with {} patterns", self.engine.patterns().len());
        let mut housekeeping = tokio::time::interval(housekeeping_interval);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failover_live = true;

        loop {
            let observed = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => Some(event),
                    None => break,
                },
                notice = failover_events.recv(), if failover_live => match notice {
                    Ok(FailoverEvent::SwitchedHost { from, to }) => Some(SecurityEvent::FailoverTriggered { from, to }),
                    Ok(_) => None,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Alerting lagged {} failover events", n);
                        None
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Manager dropped; keep serving security events
                        failover_live = false;
                        None
                    }
                },
                _ = housekeeping.tick() => {
                    if let Err(e) = self.lockdown.refresh() {
                        warn!("Lockdown refresh failed: {}", e);
                    }
                    None
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    None
                },
            };

            if let Some(event) = observed {
                // Lockdown commits and audit records are fsynced; keep them off the async workers
                self = match tokio::task::spawn_blocking(move || {
                    self.handle_event(event);
                    self
                })
                .await
                {
                    Ok(service) => service,
                    Err(e) => {
                        error!("Alerting worker failed: {}", e);
                        return;
                    }
                };
            }
        }
        info!("Alerting service stopped");
    }
}
