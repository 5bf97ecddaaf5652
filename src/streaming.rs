//! Audio streaming client.
//!
//! Owns the audio pipeline (capture thread, playback thread, outbound chunk queue and the
//! session state machine) and drives it over one authenticated WebSocket connection at a
//! time. The pipeline outlives connections; a dropped connection only abandons the
//! utterance in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{WebSocketStream, client_async};

use crate::alerting::{SecurityEvent, SecurityEvents};
use crate::audio_session::{AudioEvent, AudioState, AudioStateMachine};
use crate::capture::{CaptureFactory, CaptureHandle, CaptureReport, CaptureSettings};
use crate::chunk_queue::{AudioChunk, SharedChunkQueue};
use crate::clock::Clock;
use crate::error_recovery::{RecoveryDecision, RecoveryTracker};
use crate::failover::FailoverEvent;
use crate::indicator::{Indicator, IndicatorMode};
use crate::pairing::SessionTokens;
use crate::playback::{self, PlaybackHandle, PlaybackReport, SinkFactory};
use crate::protocol::{AudioChunkMessage, ServerMessage};
use crate::transport::{Connection, Connector, TransportError};

pub type WsStream = WebSocketStream<Connection>;

#[derive(Debug, Error)]
pub enum StreamingError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("websocket handshake failed: {0}")]
    Handshake(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("connection closed by server")]
    ConnectionClosed,
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),
    #[error("no server response within {0:?}")]
    ProcessingTimeout(Duration),
    #[error("device is in lockdown")]
    Lockdown,
    #[error("forced reconnect: {0}")]
    ForcedReconnect(String),
}

#[derive(Debug, Clone)]
pub struct StreamingSettings {
    pub path: String,
    pub queue_capacity: usize,
    pub send_timeout: Duration,
    pub processing_timeout: Duration,
    /// Extra time allowed past the computed playback duration
    pub playback_grace: Duration,
    pub volume: u8,
    pub recovery_attempts: u32,
    pub recovery_base_delay: Duration,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            path: "/ws/audio".to_string(),
            queue_capacity: 32,
            send_timeout: Duration::from_secs(10),
            processing_timeout: Duration::from_secs(30),
            playback_grace: Duration::from_secs(2),
            volume: playback::DEFAULT_VOLUME,
            recovery_attempts: 3,
            recovery_base_delay: Duration::from_millis(500),
        }
    }
}

/// User-facing triggers (push-to-talk button, operator console)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    CaptureStart,
    CaptureStop,
    /// Operator acknowledged a persistent fault; retry recovery from scratch
    ResetAfterIntervention,
}

/// Everything outside the pipeline that can end or steer a connection
pub struct SessionSignals {
    pub controls: mpsc::Receiver<ControlEvent>,
    pub lockdown: watch::Receiver<bool>,
    pub failover: broadcast::Receiver<FailoverEvent>,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Shutdown,
}

/// RFC 3986 unreserved characters pass through; everything else in the token is escaped
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

pub fn streaming_url(host: &str, port: u16, path: &str, tokens: &SessionTokens) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    format!(
        "wss://{}:{}{}?token={}",
        host,
        port,
        path,
        utf8_percent_encode(&tokens.access_token, QUERY_VALUE)
    )
}

/// Open the persistent streaming connection, presenting the session token once.
pub async fn open_stream(
    connector: &dyn Connector,
    host: &str,
    port: u16,
    path: &str,
    tokens: &SessionTokens,
) -> Result<WsStream, StreamingError> {
    let conn = connector.connect(host, port).await?;

    let mut request = streaming_url(host, port, path, tokens)
        .into_client_request()
        .map_err(|e| StreamingError::Handshake(e.to_string()))?;
    let bearer = HeaderValue::from_str(&tokens.authorization_header())
        .map_err(|e| StreamingError::Handshake(e.to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let budget = connector.request_timeout();
    let (ws, response) = match timeout(budget, client_async(request, conn)).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(StreamingError::Handshake(e.to_string())),
        Err(_) => return Err(StreamingError::Handshake(format!("no upgrade within {:?}", budget))),
    };
    info!("Streaming connection open to {}:{} ({})", host, port, response.status());
    Ok(ws)
}

pub struct StreamingClient {
    settings: StreamingSettings,
    machine: AudioStateMachine,
    queue: Arc<SharedChunkQueue>,
    capture: CaptureHandle,
    capture_reports: mpsc::Receiver<CaptureReport>,
    playback: PlaybackHandle,
    playback_reports: mpsc::Receiver<PlaybackReport>,
    recovery: RecoveryTracker,
    exhausted: Arc<AtomicBool>,
    recovery_due: Option<Instant>,
    processing_deadline: Option<Instant>,
    playback_deadline: Option<Instant>,
    indicator: Arc<dyn Indicator>,
    security: SecurityEvents,
    status: watch::Sender<AudioState>,
}

impl StreamingClient {
    /// Spawn the capture and playback threads and assemble an idle pipeline.
    pub fn start(
        settings: StreamingSettings,
        capture_factory: CaptureFactory,
        capture_settings: CaptureSettings,
        sink_factory: SinkFactory,
        clock: Arc<dyn Clock>,
        indicator: Arc<dyn Indicator>,
        security: SecurityEvents,
    ) -> Result<Self> {
        let queue = Arc::new(SharedChunkQueue::new(settings.queue_capacity));
        let (capture, capture_reports) =
            CaptureHandle::spawn(capture_factory, capture_settings, Arc::clone(&queue), clock)?;
        let (playback, playback_reports) =
            PlaybackHandle::spawn(sink_factory, settings.volume, Arc::clone(&indicator))?;
        let (status, _) = watch::channel(AudioState::Idle);
        indicator.set_mode(IndicatorMode::Idle);

        Ok(Self {
            recovery: RecoveryTracker::new(settings.recovery_attempts, settings.recovery_base_delay),
            exhausted: Arc::new(AtomicBool::new(false)),
            settings,
            machine: AudioStateMachine::new(),
            queue,
            capture,
            capture_reports,
            playback,
            playback_reports,
            recovery_due: None,
            processing_deadline: None,
            playback_deadline: None,
            indicator,
            security,
            status,
        })
    }

    pub fn state(&self) -> AudioState {
        self.machine.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<AudioState> {
        self.status.subscribe()
    }

    pub fn queue(&self) -> &Arc<SharedChunkQueue> {
        &self.queue
    }

    pub fn recovery_exhausted(&self) -> bool {
        self.recovery.is_exhausted()
    }

    /// Shared view of recovery exhaustion for health reporting.
    pub fn exhaustion_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exhausted)
    }

    pub fn settings(&self) -> &StreamingSettings {
        &self.settings
    }

    /// Drive the pipeline over `ws` until the connection fails or shutdown is requested.
    /// Any error return means the connection is unusable and the utterance was abandoned.
    pub async fn run_connection(
        &mut self,
        ws: &mut WsStream,
        signals: &mut SessionSignals,
    ) -> Result<SessionEnd, StreamingError> {
        let result = self.drive(ws, signals).await;
        match &result {
            Ok(SessionEnd::Shutdown) => {
                self.abandon_session();
                let _ = ws.close(None).await;
            }
            Err(e) => {
                warn!("Streaming connection ended: {}", e);
                self.abandon_session();
                if matches!(e, StreamingError::Lockdown | StreamingError::ForcedReconnect(_)) {
                    let _ = ws.close(None).await;
                }
            }
        }
        result
    }

    async fn drive(&mut self, ws: &mut WsStream, signals: &mut SessionSignals) -> Result<SessionEnd, StreamingError> {
        if *signals.lockdown.borrow() {
            return Err(StreamingError::Lockdown);
        }
        let mut failover_live = true;
        let mut controls_live = true;
        let mut lockdown_live = true;

        loop {
            let sending = matches!(self.machine.state(), AudioState::Recording | AudioState::Sending);
            let far_future = Instant::now() + Duration::from_secs(24 * 3600);
            let processing_deadline = self.processing_deadline;
            let playback_deadline = self.playback_deadline;
            let recovery_due = self.recovery_due;

            tokio::select! {
                biased;

                changed = signals.shutdown.changed() => {
                    if changed.is_err() || *signals.shutdown.borrow() {
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                changed = signals.lockdown.changed(), if lockdown_live => {
                    if changed.is_err() {
                        lockdown_live = false;
                    } else if *signals.lockdown.borrow() {
                        self.indicator.set_mode(IndicatorMode::Lockdown);
                        return Err(StreamingError::Lockdown);
                    }
                }
                notice = signals.failover.recv(), if failover_live => match notice {
                    Ok(FailoverEvent::ForcedReconnect { reason }) => {
                        return Err(StreamingError::ForcedReconnect(reason));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => debug!("Skipped {} failover events", n),
                    Err(broadcast::error::RecvError::Closed) => failover_live = false,
                },
                control = signals.controls.recv(), if controls_live => match control {
                    Some(control) => {
                        let locked = *signals.lockdown.borrow();
                        self.handle_control(control, locked);
                    }
                    None => controls_live = false,
                },
                Some(report) = self.capture_reports.recv() => self.handle_capture_report(report),
                Some(report) = self.playback_reports.recv() => self.handle_playback_report(report),
                chunk = self.queue.pop(), if sending => {
                    if let Some(chunk) = chunk {
                        self.send_chunk(ws, chunk).await?;
                    }
                }
                incoming = ws.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_server_text(&text),
                    Some(Ok(Message::Binary(bytes))) => {
                        self.security.report(SecurityEvent::InvalidMessage {
                            detail: format!("unexpected binary frame of {} bytes", bytes.len()),
                        });
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("Server closed streaming connection: {:?}", frame);
                        return Err(StreamingError::ConnectionClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(StreamingError::ConnectionClosed),
                },
                _ = sleep_until(processing_deadline.unwrap_or(far_future)), if processing_deadline.is_some() => {
                    self.processing_deadline = None;
                    let bound = self.settings.processing_timeout;
                    self.fail(format!("no server response within {:?}", bound));
                    return Err(StreamingError::ProcessingTimeout(bound));
                }
                _ = sleep_until(playback_deadline.unwrap_or(far_future)), if playback_deadline.is_some() => {
                    warn!("Playback did not report completion in time; forcing IDLE");
                    self.playback_deadline = None;
                    let _ = self.playback.stop();
                    self.transition(AudioEvent::PlaybackComplete);
                }
                _ = sleep_until(recovery_due.unwrap_or(far_future)), if recovery_due.is_some() => {
                    self.recovery_due = None;
                    info!("Re-initialising audio capture");
                    if let Err(e) = self.capture.reinitialize() {
                        error!("Capture thread unavailable: {:#}", e);
                        self.schedule_recovery();
                    }
                }
            }
        }
    }

    /// Reset after a lost connection: drop queued audio, stop devices, return to IDLE.
    pub fn abandon_session(&mut self) {
        match self.machine.state() {
            AudioState::Recording => {
                let _ = self.capture.stop();
            }
            AudioState::Playing => {
                let _ = self.playback.stop();
            }
            _ => {}
        }
        self.queue.reopen();
        self.processing_deadline = None;
        self.playback_deadline = None;
        self.transition(AudioEvent::ConnectionLost);
    }

    fn transition(&mut self, event: AudioEvent) -> bool {
        match self.machine.handle(event) {
            Ok(state) => {
                self.status.send_replace(state);
                match state {
                    AudioState::Idle => self.indicator.set_mode(IndicatorMode::Idle),
                    AudioState::Recording => self.indicator.set_mode(IndicatorMode::Listening),
                    AudioState::Sending | AudioState::Processing => self.indicator.set_mode(IndicatorMode::Thinking),
                    // The playback thread drives the speaking animation
                    AudioState::Playing => {}
                    AudioState::Error => self.indicator.set_mode(IndicatorMode::Error),
                }
                true
            }
            Err(invalid) => {
                debug!("Ignored: {}", invalid);
                false
            }
        }
    }

    /// Enter ERROR and start the bounded recovery sequence.
    fn fail(&mut self, reason: String) {
        error!("Audio pipeline failure: {}", reason);
        let _ = self.capture.stop();
        let _ = self.playback.stop();
        self.queue.reopen();
        self.processing_deadline = None;
        self.playback_deadline = None;
        self.transition(AudioEvent::Failure(reason));
        self.schedule_recovery();
    }

    fn schedule_recovery(&mut self) {
        match self.recovery.next_attempt() {
            RecoveryDecision::Attempt { attempt, delay } => {
                info!("Recovery attempt {} in {:?}", attempt, delay);
                self.recovery_due = Some(Instant::now() + delay);
            }
            RecoveryDecision::Exhausted => {
                self.recovery_due = None;
                self.indicator.set_mode(IndicatorMode::Error);
            }
        }
        self.exhausted.store(self.recovery.is_exhausted(), Ordering::Relaxed);
    }

    fn handle_control(&mut self, control: ControlEvent, locked: bool) {
        match control {
            ControlEvent::CaptureStart => {
                if locked {
                    warn!("Capture refused: device is in lockdown");
                    self.indicator.set_mode(IndicatorMode::Lockdown);
                    return;
                }
                if self.machine.state() != AudioState::Idle {
                    debug!("Capture start ignored in state {}", self.machine.state());
                    return;
                }
                self.queue.reopen();
                if !self.transition(AudioEvent::CaptureStart) {
                    return;
                }
                let session = match self.machine.session() {
                    Some(session) => session.clone(),
                    None => return,
                };
                if let Err(e) = self.capture.start(session) {
                    self.fail(format!("{:#}", e));
                }
            }
            ControlEvent::CaptureStop => {
                if self.machine.state() == AudioState::Recording {
                    if let Err(e) = self.capture.stop() {
                        self.fail(format!("{:#}", e));
                        return;
                    }
                    self.transition(AudioEvent::CaptureStop);
                }
            }
            ControlEvent::ResetAfterIntervention => {
                if self.machine.state() == AudioState::Error {
                    self.recovery.reset_after_intervention();
                    self.schedule_recovery();
                }
            }
        }
    }

    fn current_session_id(&self) -> Option<uuid::Uuid> {
        self.machine.session().map(|s| s.session_id())
    }

    fn handle_capture_report(&mut self, report: CaptureReport) {
        match report {
            CaptureReport::Started { session_id } => debug!("Capture running for {}", session_id),
            CaptureReport::ThresholdReached { session_id } => {
                if self.machine.state() == AudioState::Recording && self.current_session_id() == Some(session_id) {
                    self.transition(AudioEvent::BufferThreshold);
                }
            }
            CaptureReport::Finished { session_id, chunks, .. } => {
                debug!("Capture for {} finished with {} chunks", session_id, chunks);
            }
            CaptureReport::Failed { reason } => {
                if self.machine.state() != AudioState::Error {
                    self.fail(format!("capture: {}", reason));
                } else {
                    self.schedule_recovery();
                }
            }
            CaptureReport::Reinitialized => {
                if self.machine.state() == AudioState::Error && self.transition(AudioEvent::Recovered) {
                    self.recovery.record_success();
                    self.exhausted.store(false, Ordering::Relaxed);
                }
            }
            CaptureReport::ReinitFailed { reason } => {
                warn!("Capture re-initialisation failed: {}", reason);
                self.schedule_recovery();
            }
        }
    }

    fn handle_playback_report(&mut self, report: PlaybackReport) {
        match report {
            PlaybackReport::Started { duration } => debug!("Playback started ({:?})", duration),
            PlaybackReport::Completed => {
                if self.machine.state() == AudioState::Playing {
                    self.playback_deadline = None;
                    self.transition(AudioEvent::PlaybackComplete);
                }
            }
            PlaybackReport::Failed { reason } => {
                if self.machine.state() == AudioState::Playing {
                    self.fail(format!("playback: {}", reason));
                }
            }
        }
    }

    async fn send_chunk(&mut self, ws: &mut WsStream, chunk: AudioChunk) -> Result<(), StreamingError> {
        if self.current_session_id() != Some(chunk.session_id) {
            debug!("Dropping chunk {} of abandoned session {}", chunk.chunk_id, chunk.session_id);
            return Ok(());
        }
        let message = AudioChunkMessage::new(&chunk.pcm, chunk.chunk_id, chunk.is_final, chunk.timestamp);
        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                error!("Encoding chunk {} failed: {}", chunk.chunk_id, e);
                return Ok(());
            }
        };

        let bound = self.settings.send_timeout;
        match timeout(bound, ws.send(Message::Text(text))).await {
            Ok(result) => result?,
            Err(_) => return Err(StreamingError::SendTimeout(bound)),
        }
        debug!("Sent chunk {} (final={})", chunk.chunk_id, chunk.is_final);

        if chunk.is_final {
            if self.machine.state() == AudioState::Recording {
                // Capture stopped itself before its threshold report was handled
                self.transition(AudioEvent::BufferThreshold);
            }
            if self.transition(AudioEvent::FinalChunkSent) {
                self.processing_deadline = Some(Instant::now() + self.settings.processing_timeout);
            }
        }
        Ok(())
    }

    fn handle_server_text(&mut self, text: &str) {
        let message = match ServerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Unparseable server message: {}", e);
                self.security.report(SecurityEvent::InvalidMessage { detail: e.to_string() });
                return;
            }
        };
        debug!("Server message: {}", message.kind());

        match message {
            ServerMessage::AudioResponse {
                audio_data,
                text,
                format,
                sample_rate,
            } => {
                if self.machine.state() != AudioState::Processing {
                    warn!("Unexpected audio response in state {}", self.machine.state());
                    return;
                }
                if let Some(text) = text {
                    info!("Response: {}", text);
                }
                match playback::decode_response(&audio_data, &format, sample_rate) {
                    Ok(audio) => {
                        let duration = audio.duration();
                        self.processing_deadline = None;
                        self.transition(AudioEvent::ResponseReceived);
                        if let Err(e) = self.playback.play(audio) {
                            self.fail(format!("{:#}", e));
                            return;
                        }
                        self.playback_deadline = Some(Instant::now() + duration + self.settings.playback_grace);
                    }
                    Err(e) => self.fail(format!("undecodable response: {}", e)),
                }
            }
            // Progress never moves the processing deadline
            ServerMessage::ProcessingStatus { status, message } => {
                debug!("Processing status: {:?} {:?}", status, message);
            }
            ServerMessage::ProcessingProgress { progress, stage } => {
                debug!("Processing progress: {:?} {:?}", progress, stage);
            }
            ServerMessage::System { data } => {
                info!("System message: {}", data);
                if let Some(volume) = data.get("volume").and_then(|v| v.as_u64()) {
                    let _ = self.playback.set_volume(volume.min(100) as u8);
                }
            }
            ServerMessage::Error { message, code } => {
                warn!("Server error {:?}: {:?}", code, message);
                if matches!(self.machine.state(), AudioState::Sending | AudioState::Processing) {
                    self.fail(format!(
                        "server error {}",
                        code.or(message).unwrap_or_else(|| "unspecified".to_string())
                    ));
                }
            }
        }
    }
}
