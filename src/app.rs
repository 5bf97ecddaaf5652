use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use crate::alerting::{
    AlertingService, AuditLog, FallbackChannel, LockdownController, RemoteAlertSink, SecurityEvent, SecurityEvents,
    default_patterns,
};
use crate::capture::{CaptureFactory, CpalCapture};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::failover::{FailoverManager, FailoverState, FailureOutcome};
use crate::indicator::{Indicator, IndicatorMode, LogIndicator};
use crate::monitoring::{HealthMonitor, HealthReport, checks};
use crate::pairing::{DeviceIdentity, PairingClient, PairingError, SessionTokens};
use crate::playback::{CpalSink, SinkFactory};
use crate::store::{DeviceState, FileStateStore, StateStore};
use crate::streaming::{self, ControlEvent, SessionEnd, SessionSignals, StreamingClient, StreamingError};
use crate::transport::{Connector, SecureTransport, TransportError};

pub const CONTROL_CHANNEL_CAPACITY: usize = 16;

/// Pluggable edges of the runtime; production uses TLS, the state file and cpal devices.
pub struct RuntimeParts {
    pub clock: Arc<dyn Clock>,
    pub connector: Arc<dyn Connector>,
    pub store: Box<dyn StateStore>,
    pub indicator: Arc<dyn Indicator>,
    pub capture: CaptureFactory,
    pub sink: SinkFactory,
}

impl RuntimeParts {
    pub fn production(config: &AppConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(config.transport.min_valid_epoch_secs));
        let transport = SecureTransport::new(config.to_transport_config(), Arc::clone(&clock))
            .context("initialising secure transport")?;
        Ok(Self {
            connector: Arc::new(transport),
            clock,
            store: Box::new(FileStateStore::new(config.state_path())),
            indicator: Arc::new(LogIndicator::new()),
            capture: CpalCapture::factory(config.audio.sample_rate),
            sink: CpalSink::factory(),
        })
    }
}

/// How one connection attempt ended
enum Attempt {
    Shutdown,
    /// Connection never became usable; counts against the host
    Failed { host: String },
    /// Session ran and then ended; reconnect
    Dropped { host: String, counts_as_failure: bool },
}

/// The device runtime: transport I/O, capture, playback and alerting/housekeeping
/// running concurrently over one shared device state.
pub struct DeviceRuntime {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    connector: Arc<dyn Connector>,
    state: Arc<DeviceState>,
    failover: Arc<FailoverManager>,
    pairing: Arc<PairingClient>,
    lockdown: Arc<LockdownController>,
    audit: Option<Arc<AuditLog>>,
    indicator: Arc<dyn Indicator>,
    health: Arc<HealthMonitor>,
    security: SecurityEvents,
    security_rx: Option<mpsc::Receiver<SecurityEvent>>,
    capture: CaptureFactory,
    sink: SinkFactory,
    shutdown: Arc<watch::Sender<bool>>,
}

impl DeviceRuntime {
    pub fn new(config: AppConfig) -> Result<Self> {
        let parts = RuntimeParts::production(&config)?;
        Self::assemble(config, parts)
    }

    pub fn assemble(config: AppConfig, parts: RuntimeParts) -> Result<Self> {
        config.validate()?;

        let state = Arc::new(
            DeviceState::init(parts.store, config.host_configuration()).context("loading persisted device state")?,
        );
        let failover = Arc::new(FailoverManager::new(
            Arc::clone(&state),
            Arc::clone(&parts.clock),
            config.to_failover_policy()?,
        ));

        let identity = DeviceIdentity::provision(config.device.device_id.clone())?;
        let pairing = Arc::new(PairingClient::new(
            Arc::clone(&parts.connector),
            Arc::clone(&parts.clock),
            identity,
            config.hosts.pairing_path.clone(),
            config.device.firmware_version.clone(),
        ));

        let audit = match AuditLog::open(config.audit_log_path(), Arc::clone(&parts.clock)) {
            Ok(log) => Some(Arc::new(log)),
            Err(e) => {
                error!("Audit log unavailable, continuing without it: {:#}", e);
                None
            }
        };
        let lockdown = Arc::new(LockdownController::new(
            Arc::clone(&state),
            Arc::clone(&parts.clock),
            audit.clone(),
            config.alerting.lockdown_enabled,
        )?);

        let (security, security_rx) = SecurityEvents::channel();
        let (shutdown, _) = watch::channel(false);

        let health = Arc::new(HealthMonitor::new(Arc::clone(&parts.clock)));
        health.register_check("clock", checks::clock_sync(Arc::clone(&parts.clock)));
        health.register_check("failover", checks::failover(Arc::clone(&failover)));
        health.register_check("lockdown", checks::lockdown(Arc::clone(&lockdown)));

        Ok(Self {
            config,
            clock: parts.clock,
            connector: parts.connector,
            state,
            failover,
            pairing,
            lockdown,
            audit,
            indicator: parts.indicator,
            health,
            security,
            security_rx: Some(security_rx),
            capture: parts.capture,
            sink: parts.sink,
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.failover
    }

    pub fn lockdown(&self) -> &Arc<LockdownController> {
        &self.lockdown
    }

    pub fn security_events(&self) -> SecurityEvents {
        self.security.clone()
    }

    /// Flip to true to stop [`run`](Self::run).
    pub fn shutdown_handle(&self) -> Arc<watch::Sender<bool>> {
        Arc::clone(&self.shutdown)
    }

    pub fn health_report(&self) -> HealthReport {
        self.health.run_health_checks()
    }

    pub fn failover_state(&self) -> Result<FailoverState> {
        Ok(self.failover.snapshot()?)
    }

    /// One pairing handshake against the active host, reported to failover and alerting.
    pub async fn pair_once(&self) -> Result<SessionTokens> {
        let (host, port) = self.failover.current_endpoint()?;
        let result = self.pair_with(&host, port).await;
        match &result {
            Ok(_) => self.record_success(&host).await,
            Err(_) => {
                self.record_failure(&host).await;
            }
        }
        Ok(result?)
    }

    async fn pair_with(&self, host: &str, port: u16) -> Result<SessionTokens, PairingError> {
        let result = self.pairing.pair(host, port, &self.config.device.child_id).await;
        if let Err(e) = &result {
            self.report_pairing_error(host, e);
        }
        result
    }

    fn report_pairing_error(&self, host: &str, err: &PairingError) {
        let event = match err {
            PairingError::Rejected { status } if err.is_auth_rejection() => SecurityEvent::AuthFailure {
                host: host.to_string(),
                status: *status,
            },
            PairingError::Transport(TransportError::ClockNotSynchronized) => SecurityEvent::ClockDesync,
            PairingError::Transport(t) => SecurityEvent::TransportFailure {
                host: host.to_string(),
                reason: t.reason_tag().to_string(),
            },
            other => SecurityEvent::PairingFailure {
                host: host.to_string(),
                reason: other.to_string(),
            },
        };
        self.security.report(event);
    }

    /// Run every unit until shutdown. `controls` carries capture start/stop requests.
    pub async fn run(mut self, controls: mpsc::Receiver<ControlEvent>) -> Result<()> {
        if self.config.device.child_id.trim().is_empty() {
            bail!("device.child_id must be set before the device can pair");
        }
        info!(
            "Starting device {} (primary {}, secondary {:?})",
            self.config.device.device_id, self.config.hosts.primary, self.config.hosts.secondary
        );

        let mut client = StreamingClient::start(
            self.config.to_streaming_settings(),
            Arc::clone(&self.capture),
            self.config.to_capture_settings(),
            Arc::clone(&self.sink),
            Arc::clone(&self.clock),
            Arc::clone(&self.indicator),
            self.security.clone(),
        )?;
        self.health.register_check(
            "audio",
            checks::audio_pipeline(client.watch_state(), client.exhaustion_flag()),
        );

        let alerting = self.spawn_alerting()?;
        let housekeeping = self.spawn_health_logging();

        let mut signals = SessionSignals {
            controls,
            lockdown: self.lockdown.subscribe(),
            failover: self.failover.subscribe(),
            shutdown: self.shutdown.subscribe(),
        };

        let result = self.connection_loop(&mut client, &mut signals).await;

        self.shutdown.send_replace(true);
        if let Err(e) = alerting.await {
            warn!("Alerting task ended abnormally: {}", e);
        }
        housekeeping.abort();
        if let Err(e) = self.state.flush() {
            error!("Final state flush failed: {}", e);
        }
        info!("Device runtime stopped");
        result
    }

    fn spawn_alerting(&mut self) -> Result<tokio::task::JoinHandle<()>> {
        let events = self
            .security_rx
            .take()
            .context("alerting already started for this runtime")?;

        let fallback = FallbackChannel::open(self.config.fallback_path())?;
        let remote = Arc::new(RemoteAlertSink::new(
            Arc::clone(&self.connector),
            Arc::clone(&self.failover),
            self.config.hosts.alert_path.clone(),
            self.config.alerting.remote_failure_limit,
            fallback,
        ));

        let mut service = AlertingService::new(
            self.config.device.device_id.clone(),
            default_patterns(),
            Duration::from_secs(self.config.alerting.cooldown_secs),
            Arc::clone(&self.clock),
            Arc::clone(&self.indicator),
            Arc::clone(&self.lockdown),
        )
        .with_remote(Arc::clone(&remote))
        .with_failover(Arc::clone(&self.failover));
        if let Some(audit) = &self.audit {
            service = service.with_audit(Arc::clone(audit));
        }
        self.health
            .register_check("alerts", checks::alert_delivery(Some(remote), service.stats()));

        let interval = Duration::from_secs(self.config.alerting.housekeeping_interval_secs.max(1));
        Ok(tokio::spawn(service.run(
            events,
            self.failover.subscribe(),
            interval,
            self.shutdown.subscribe(),
        )))
    }

    fn spawn_health_logging(&self) -> tokio::task::JoinHandle<()> {
        let health = Arc::clone(&self.health);
        let interval = Duration::from_secs(self.config.alerting.housekeeping_interval_secs.max(1) * 4);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let report = health.run_health_checks();
                for check in report.checks.iter().filter(|c| c.status != crate::monitoring::HealthStatus::Healthy) {
                    warn!("Health {:?} [{}]: {}", check.status, check.name, check.message);
                }
            }
        })
    }

    async fn connection_loop(&self, client: &mut StreamingClient, signals: &mut SessionSignals) -> Result<()> {
        // Failures the store refused to commit; backoff escalates locally until a write lands
        let mut uncommitted: usize = 0;
        let mut pending_wait: Option<Duration> = None;

        loop {
            if *signals.shutdown.borrow() {
                return Ok(());
            }

            if *signals.lockdown.borrow() {
                warn!("Streaming suspended: device is in lockdown");
                self.indicator.set_mode(IndicatorMode::Lockdown);
                self.pairing.invalidate();
                tokio::select! {
                    changed = signals.lockdown.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                    }
                    _ = signals.shutdown.changed() => {}
                }
                continue;
            }

            if self.failover.should_retry_primary().unwrap_or(false) {
                if let Err(e) = self.failover.commit_blocking(|f| f.return_to_primary()).await {
                    warn!("Return to primary not committed: {}", e);
                }
            }

            let wait = match pending_wait.take() {
                Some(wait) => wait,
                None => self.failover.remaining_backoff().unwrap_or_else(|e| {
                    warn!("Reading backoff state failed: {}", e);
                    self.failover.policy().backoff.cap()
                }),
            };
            if !wait.is_zero() {
                self.back_off(wait, signals).await;
                continue;
            }

            match self.attempt_session(client, signals).await? {
                Attempt::Shutdown => return Ok(()),
                Attempt::Failed { host }
                | Attempt::Dropped {
                    host,
                    counts_as_failure: true,
                } => {
                    if self.record_failure(&host).await {
                        uncommitted = 0;
                    } else {
                        uncommitted += 1;
                        pending_wait = Some(self.local_backoff(uncommitted));
                    }
                }
                Attempt::Dropped { .. } => {}
            }
        }
    }

    async fn back_off(&self, wait: Duration, signals: &mut SessionSignals) {
        debug!("Backing off {:?} before reconnecting", wait);
        self.discard_offline_controls(signals);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = signals.shutdown.changed() => {}
            _ = signals.lockdown.changed() => {}
        }
    }

    /// Backoff for the `extra`th failure in a row that never reached the store.
    fn local_backoff(&self, extra: usize) -> Duration {
        let level = self.failover.snapshot().map(|f| f.backoff_level).unwrap_or(0);
        self.failover.policy().backoff.delay(level.saturating_add(extra))
    }

    /// Returns false if the store refused the transition.
    async fn record_failure(&self, host: &str) -> bool {
        let reported = host.to_string();
        match self.failover.commit_blocking(move |f| f.report_failure(&reported)).await {
            Ok(FailureOutcome::Retry { delay }) => {
                debug!("Retrying {} in {:?}", host, delay);
                true
            }
            Ok(FailureOutcome::Switched { to }) => {
                info!("Reconnecting via {}", to);
                true
            }
            Ok(FailureOutcome::Stale) => true,
            Err(e) => {
                error!("Failure on {} not committed: {}", host, e);
                false
            }
        }
    }

    async fn record_success(&self, host: &str) {
        let reported = host.to_string();
        if let Err(e) = self.failover.commit_blocking(move |f| f.report_success(&reported)).await {
            warn!("Success on {} not committed: {}", host, e);
        }
    }

    /// Controls that arrive while no connection exists would start a doomed utterance.
    fn discard_offline_controls(&self, signals: &mut SessionSignals) {
        while let Ok(control) = signals.controls.try_recv() {
            info!("Ignoring {:?} while offline", control);
        }
    }

    async fn attempt_session(&self, client: &mut StreamingClient, signals: &mut SessionSignals) -> Result<Attempt> {
        let (host, port) = self.failover.current_endpoint()?;

        let tokens = match self.pair_with(&host, port).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("Pairing with {} failed: {}", host, e);
                return Ok(Attempt::Failed { host });
            }
        };

        let opened = streaming::open_stream(
            self.connector.as_ref(),
            &host,
            port,
            &self.config.hosts.streaming_path,
            &tokens,
        )
        .await;
        let mut ws = match opened {
            Ok(ws) => ws,
            Err(e) => {
                warn!("Streaming connection to {} failed: {}", host, e);
                self.report_streaming_error(&host, &e);
                self.pairing.invalidate();
                return Ok(Attempt::Failed { host });
            }
        };
        self.record_success(&host).await;

        let outcome = client.run_connection(&mut ws, signals).await;
        // Tokens are bound to the connection that just ended
        self.pairing.invalidate();

        Ok(match outcome {
            Ok(SessionEnd::Shutdown) => Attempt::Shutdown,
            Err(e) => {
                self.report_streaming_error(&host, &e);
                let counts_as_failure = !matches!(e, StreamingError::Lockdown | StreamingError::ForcedReconnect(_));
                Attempt::Dropped { host, counts_as_failure }
            }
        })
    }

    fn report_streaming_error(&self, host: &str, err: &StreamingError) {
        let event = match err {
            StreamingError::Lockdown | StreamingError::ForcedReconnect(_) => return,
            StreamingError::Transport(TransportError::ClockNotSynchronized) => SecurityEvent::ClockDesync,
            StreamingError::Transport(t) => SecurityEvent::TransportFailure {
                host: host.to_string(),
                reason: t.reason_tag().to_string(),
            },
            StreamingError::Handshake(reason) => SecurityEvent::ConnectionRejected {
                host: host.to_string(),
                reason: reason.clone(),
            },
            other => SecurityEvent::TransportFailure {
                host: host.to_string(),
                reason: other.to_string(),
            },
        };
        self.security.report(event);
    }
}

/// Map one console line to a control event.
pub fn parse_control(line: &str) -> Option<ControlEvent> {
    match line.trim().to_ascii_lowercase().as_str() {
        "start" | "s" => Some(ControlEvent::CaptureStart),
        "stop" | "x" => Some(ControlEvent::CaptureStop),
        "reset" => Some(ControlEvent::ResetAfterIntervention),
        _ => None,
    }
}

/// Push-to-talk from the console: `start`, `stop`, `reset`, one per line.
pub async fn read_console_controls(tx: mpsc::Sender<ControlEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_control(&line) {
                Some(control) => {
                    if tx.send(control).await.is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => println!("commands: start | stop | reset"),
            },
            Ok(None) => break,
            Err(e) => {
                error!("Console input failed: {}", e);
                break;
            }
        }
    }
    debug!("Console control reader finished");
}
