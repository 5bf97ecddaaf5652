//! Audio capture unit.
//!
//! Runs on its own thread. Samples flow from the device callback through a lock-free ring
//! buffer into fixed-size frames, get a voice-activity estimate and gain normalisation,
//! and are handed to the [`SharedChunkQueue`] without ever waiting on the network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use dasp::Sample;
use log::{debug, error, info, warn};
use ringbuf::{traits::*, HeapCons, HeapRb};
use uuid::Uuid;

use crate::audio_session::AudioSession;
use crate::chunk_queue::{AudioChunk, PushOutcome, SharedChunkQueue};
use crate::clock::Clock;

pub const DEFAULT_FRAME_BYTES: usize = 4096;
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

const RING_BUFFER_SECONDS: usize = 2;
const REPORT_CHANNEL_CAPACITY: usize = 32;

/// A microphone, or anything that behaves like one.
///
/// Not `Send`: cpal streams are tied to the thread that built them, so sources are
/// created on the capture thread through a [`CaptureFactory`].
pub trait CaptureSource {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    /// Copy up to `buf.len()` captured samples into `buf` without blocking.
    fn read(&mut self, buf: &mut [i16]) -> Result<usize>;
}

pub type CaptureFactory = Arc<dyn Fn() -> Result<Box<dyn CaptureSource>> + Send + Sync>;

/// Default input device via cpal, mono i16 at the requested rate
pub struct CpalCapture {
    stream: Stream,
    consumer: HeapCons<i16>,
    overruns: Arc<AtomicU64>,
    stream_failed: Arc<AtomicBool>,
}

impl CpalCapture {
    pub fn open(sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow!("No default input device available"))?;
        info!(
            "Capture device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let config = StreamConfig {
            channels: 1,
            sample_rate: SampleRate(sample_rate),
            buffer_size: BufferSize::Default,
        };

        let rb = HeapRb::<i16>::new(sample_rate as usize * RING_BUFFER_SECONDS);
        let (mut producer, consumer) = rb.split();

        let overruns = Arc::new(AtomicU64::new(0));
        let stream_failed = Arc::new(AtomicBool::new(false));
        let overruns_cb = Arc::clone(&overruns);
        let failed_cb = Arc::clone(&stream_failed);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Real-time thread: push what fits, count the rest
                    let pushed = producer.push_iter(data.iter().map(|s| s.to_sample::<i16>()));
                    if pushed < data.len() {
                        overruns_cb.fetch_add((data.len() - pushed) as u64, Ordering::Relaxed);
                    }
                },
                move |err| {
                    error!("Audio input stream error: {}", err);
                    failed_cb.store(true, Ordering::Relaxed);
                },
                None,
            )
            .context("building input stream")?;

        Ok(Self {
            stream,
            consumer,
            overruns,
            stream_failed,
        })
    }

    pub fn factory(sample_rate: u32) -> CaptureFactory {
        Arc::new(move || Ok(Box::new(CpalCapture::open(sample_rate)?) as Box<dyn CaptureSource>))
    }
}

impl CaptureSource for CpalCapture {
    fn start(&mut self) -> Result<()> {
        self.consumer.clear();
        self.stream.play().context("starting input stream")?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stream.pause().context("pausing input stream")?;
        let overruns = self.overruns.swap(0, Ordering::Relaxed);
        if overruns > 0 {
            warn!("Capture ring buffer overran by {} samples", overruns);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize> {
        if self.stream_failed.load(Ordering::Relaxed) {
            return Err(anyhow!("input stream reported an error"));
        }
        Ok(self.consumer.pop_slice(buf))
    }
}

/// Plays back a fixed sample script, then goes quiet. Used by tests and dry runs.
pub struct ScriptedCapture {
    samples: VecDeque<i16>,
    per_read: usize,
    fail_on_start: bool,
    fail_after_reads: Option<usize>,
    reads: usize,
    running: bool,
}

impl ScriptedCapture {
    pub fn new(samples: Vec<i16>, per_read: usize) -> Self {
        Self {
            samples: samples.into(),
            per_read: per_read.max(1),
            fail_on_start: false,
            fail_after_reads: None,
            reads: 0,
            running: false,
        }
    }

    pub fn failing_on_start() -> Self {
        Self {
            fail_on_start: true,
            ..Self::new(Vec::new(), 1)
        }
    }

    pub fn fail_after_reads(mut self, reads: usize) -> Self {
        self.fail_after_reads = Some(reads);
        self
    }

    /// Factory producing a fresh copy of the script for every (re)initialisation.
    pub fn factory(samples: Vec<i16>, per_read: usize) -> CaptureFactory {
        Arc::new(move || Ok(Box::new(ScriptedCapture::new(samples.clone(), per_read)) as Box<dyn CaptureSource>))
    }
}

impl CaptureSource for ScriptedCapture {
    fn start(&mut self) -> Result<()> {
        if self.fail_on_start {
            return Err(anyhow!("scripted capture refused to start"));
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn read(&mut self, buf: &mut [i16]) -> Result<usize> {
        if !self.running {
            return Ok(0);
        }
        self.reads += 1;
        if let Some(limit) = self.fail_after_reads {
            if self.reads > limit {
                return Err(anyhow!("scripted capture device vanished"));
            }
        }
        let n = buf.len().min(self.per_read).min(self.samples.len());
        for (slot, sample) in buf.iter_mut().zip(self.samples.drain(..n)) {
            *slot = sample;
        }
        Ok(n)
    }
}

/// Cuts an arbitrary sample stream into fixed-size frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<i16>,
}

impl FrameAssembler {
    pub fn new(frame_bytes: usize) -> Self {
        let frame_samples = (frame_bytes / 2).max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        }
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        let mut frames = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.frame_samples - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.frame_samples {
                frames.push(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.frame_samples),
                ));
            }
        }
        frames
    }

    /// Partial frame left over when capture stops.
    pub fn take_remainder(&mut self) -> Option<Vec<i16>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalConfig {
    /// Peak level (fraction of full scale) voiced frames are normalised to
    pub gain_target: f32,
    pub max_gain: f32,
    /// RMS level (fraction of full scale) above which a frame counts as voice
    pub vad_threshold: f32,
    /// Samples below this level in unvoiced frames are gated to silence
    pub noise_gate: f32,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            gain_target: 0.7,
            max_gain: 4.0,
            vad_threshold: 0.02,
            noise_gate: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameAnalysis {
    pub rms: f32,
    pub peak: f32,
    pub voice_active: bool,
    pub gain: f32,
}

#[derive(Debug, Clone, Default)]
pub struct SignalProcessor {
    config: SignalConfig,
}

impl SignalProcessor {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    /// Estimate voice activity and normalise the frame in place.
    pub fn process(&self, frame: &mut [i16]) -> FrameAnalysis {
        if frame.is_empty() {
            return FrameAnalysis {
                rms: 0.0,
                peak: 0.0,
                voice_active: false,
                gain: 1.0,
            };
        }

        let mut sum_sq = 0.0f32;
        let mut peak = 0.0f32;
        for s in frame.iter() {
            let x = s.to_sample::<f32>();
            sum_sq += x * x;
            peak = peak.max(x.abs());
        }
        let rms = (sum_sq / frame.len() as f32).sqrt();
        let voice_active = rms >= self.config.vad_threshold;

        if !voice_active {
            for s in frame.iter_mut() {
                if s.to_sample::<f32>().abs() < self.config.noise_gate {
                    *s = 0;
                }
            }
            return FrameAnalysis {
                rms,
                peak,
                voice_active,
                gain: 1.0,
            };
        }

        let gain = if peak > 0.0 {
            (self.config.gain_target / peak).clamp(0.0, self.config.max_gain)
        } else {
            1.0
        };
        for s in frame.iter_mut() {
            let y = (s.to_sample::<f32>() * gain).clamp(-1.0, 1.0);
            *s = y.to_sample::<i16>();
        }

        FrameAnalysis {
            rms,
            peak,
            voice_active,
            gain,
        }
    }
}

pub fn samples_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub frame_bytes: usize,
    pub sample_rate: u32,
    pub max_recording: Duration,
    pub signal: SignalConfig,
    pub poll_interval: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            frame_bytes: DEFAULT_FRAME_BYTES,
            sample_rate: DEFAULT_SAMPLE_RATE,
            max_recording: Duration::from_secs(30),
            signal: SignalConfig::default(),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl CaptureSettings {
    fn max_samples(&self) -> u64 {
        self.max_recording.as_millis() as u64 * self.sample_rate as u64 / 1000
    }
}

#[derive(Debug)]
pub enum CaptureCommand {
    Start { session: AudioSession },
    Stop,
    Reinitialize,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureReport {
    Started { session_id: Uuid },
    /// Recording hit the maximum duration and stopped itself
    ThresholdReached { session_id: Uuid },
    /// The final chunk has been queued
    Finished {
        session_id: Uuid,
        chunks: u64,
        voiced_frames: u64,
    },
    Failed { reason: String },
    Reinitialized,
    ReinitFailed { reason: String },
}

/// Owner-side handle for the capture thread.
pub struct CaptureHandle {
    commands: Sender<CaptureCommand>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn spawn(
        factory: CaptureFactory,
        settings: CaptureSettings,
        queue: Arc<SharedChunkQueue>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, tokio::sync::mpsc::Receiver<CaptureReport>)> {
        let (commands_tx, commands_rx) = mpsc::channel();
        let (reports_tx, reports_rx) = tokio::sync::mpsc::channel(REPORT_CHANNEL_CAPACITY);

        // The worker owns a !Send source, so it is built on the capture thread itself
        let thread = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                CaptureWorker {
                    factory,
                    processor: SignalProcessor::new(settings.signal),
                    settings,
                    queue,
                    clock,
                    commands: commands_rx,
                    reports: reports_tx,
                    source: None,
                }
                .run()
            })
            .context("spawning capture thread")?;

        Ok((
            Self {
                commands: commands_tx,
                thread: Some(thread),
            },
            reports_rx,
        ))
    }

    pub fn start(&self, session: AudioSession) -> Result<()> {
        self.send(CaptureCommand::Start { session })
    }

    pub fn stop(&self) -> Result<()> {
        self.send(CaptureCommand::Stop)
    }

    pub fn reinitialize(&self) -> Result<()> {
        self.send(CaptureCommand::Reinitialize)
    }

    fn send(&self, command: CaptureCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("capture thread has exited"))
    }

    pub fn shutdown(&mut self) {
        let _ = self.commands.send(CaptureCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum StopReason {
    Released,
    Threshold,
    Shutdown,
    Failed(String),
}

struct CaptureWorker {
    factory: CaptureFactory,
    settings: CaptureSettings,
    processor: SignalProcessor,
    queue: Arc<SharedChunkQueue>,
    clock: Arc<dyn Clock>,
    commands: Receiver<CaptureCommand>,
    reports: tokio::sync::mpsc::Sender<CaptureReport>,
    source: Option<Box<dyn CaptureSource>>,
}

impl CaptureWorker {
    fn run(mut self) {
        debug!("Capture thread started");
        while let Ok(command) = self.commands.recv() {
            match command {
                CaptureCommand::Start { session } => {
                    if self.record(session) {
                        break;
                    }
                }
                CaptureCommand::Stop => debug!("Stop requested while not recording"),
                CaptureCommand::Reinitialize => self.reinitialize(),
                CaptureCommand::Shutdown => break,
            }
        }
        if let Some(mut source) = self.source.take() {
            let _ = source.stop();
        }
        debug!("Capture thread exiting");
    }

    fn report(&self, report: CaptureReport) {
        if let Err(e) = self.reports.try_send(report) {
            warn!("Dropping capture report: {}", e);
        }
    }

    fn reinitialize(&mut self) {
        if let Some(mut old) = self.source.take() {
            let _ = old.stop();
        }
        match (self.factory)() {
            Ok(source) => {
                info!("Capture source re-initialised");
                self.source = Some(source);
                self.report(CaptureReport::Reinitialized);
            }
            Err(e) => {
                warn!("Capture re-initialisation failed: {:#}", e);
                self.report(CaptureReport::ReinitFailed {
                    reason: format!("{:#}", e),
                });
            }
        }
    }

    /// Record one session. Returns true if the thread should exit.
    fn record(&mut self, mut session: AudioSession) -> bool {
        let session_id = session.session_id();
        let mut source = match self.source.take() {
            Some(source) => source,
            None => match (self.factory)() {
                Ok(source) => source,
                Err(e) => {
                    self.report(CaptureReport::Failed {
                        reason: format!("opening capture source: {:#}", e),
                    });
                    return false;
                }
            },
        };
        if let Err(e) = source.start() {
            self.report(CaptureReport::Failed {
                reason: format!("starting capture: {:#}", e),
            });
            return false;
        }
        self.report(CaptureReport::Started { session_id });
        info!("Recording session {}", session_id);

        let mut assembler = FrameAssembler::new(self.settings.frame_bytes);
        let mut buf = vec![0i16; assembler.frame_samples()];
        let mut held: Option<AudioChunk> = None;
        let mut captured: u64 = 0;
        let mut voiced_frames: u64 = 0;
        let max_samples = self.settings.max_samples();

        let reason = loop {
            match self.commands.try_recv() {
                Ok(CaptureCommand::Stop) => break StopReason::Released,
                Ok(CaptureCommand::Shutdown) | Err(TryRecvError::Disconnected) => break StopReason::Shutdown,
                Ok(other) => debug!("Ignoring {:?} while recording", other),
                Err(TryRecvError::Empty) => {}
            }

            let n = match source.read(&mut buf) {
                Ok(n) => n,
                Err(e) => break StopReason::Failed(format!("{:#}", e)),
            };
            captured += n as u64;
            for frame in assembler.push(&buf[..n]) {
                if self.stage_frame(frame, &mut session, &mut held) {
                    voiced_frames += 1;
                }
            }

            if max_samples > 0 && captured >= max_samples {
                info!("Recording reached maximum duration");
                self.report(CaptureReport::ThresholdReached { session_id });
                break StopReason::Threshold;
            }
            if n == 0 {
                thread::sleep(self.settings.poll_interval);
            }
        };

        if let Err(e) = source.stop() {
            warn!("Stopping capture source: {:#}", e);
        }

        if let StopReason::Failed(reason) = reason {
            // Source is discarded; recovery rebuilds it
            error!("Capture failed during session {}: {}", session_id, reason);
            self.report(CaptureReport::Failed { reason });
            return false;
        }
        self.source = Some(source);

        if let Some(rest) = assembler.take_remainder() {
            if self.stage_frame(rest, &mut session, &mut held) {
                voiced_frames += 1;
            }
        }
        let mut last = held.take().unwrap_or_else(|| AudioChunk {
            session_id,
            chunk_id: session.allocate_chunk_id(),
            pcm: Vec::new(),
            is_final: false,
            timestamp: self.clock.now_millis(),
        });
        if session.claim_final() {
            last.is_final = true;
        }
        self.queue.push(last);

        let chunks = session.chunks_allocated();
        debug!(
            "Session {} captured {} samples in {} chunks ({} voiced)",
            session_id, captured, chunks, voiced_frames
        );
        self.report(CaptureReport::Finished {
            session_id,
            chunks,
            voiced_frames,
        });
        matches!(reason, StopReason::Shutdown)
    }

    /// Process a frame and queue the one held before it. The newest frame is held back
    /// so it can be marked final when recording stops. Returns whether it was voiced.
    fn stage_frame(&self, mut samples: Vec<i16>, session: &mut AudioSession, held: &mut Option<AudioChunk>) -> bool {
        let analysis = self.processor.process(&mut samples);
        let chunk = AudioChunk {
            session_id: session.session_id(),
            chunk_id: session.allocate_chunk_id(),
            pcm: samples_to_le_bytes(&samples),
            is_final: false,
            timestamp: self.clock.now_millis(),
        };
        if let Some(previous) = held.replace(chunk) {
            if let PushOutcome::DroppedIncoming = self.queue.push(previous) {
                debug!("Chunk dropped under back-pressure");
            }
        }
        analysis.voice_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_session::{AudioEvent, AudioStateMachine};
    use crate::clock::ManualClock;

    fn new_session() -> AudioSession {
        let mut machine = AudioStateMachine::new();
        machine.handle(AudioEvent::CaptureStart).unwrap();
        machine.session().unwrap().clone()
    }

    async fn next_report(rx: &mut tokio::sync::mpsc::Receiver<CaptureReport>) -> CaptureReport {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("capture report timed out")
            .expect("capture channel closed")
    }

    #[test]
    fn test_frame_assembler_cuts_fixed_frames() {
        let mut assembler = FrameAssembler::new(8);
        assert_eq!(assembler.frame_samples(), 4);
        assert!(assembler.push(&[1, 2, 3]).is_empty());
        let frames = assembler.push(&[4, 5, 6, 7, 8, 9]);
        assert_eq!(frames, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
        assert_eq!(assembler.take_remainder(), Some(vec![9]));
        assert_eq!(assembler.take_remainder(), None);
    }

    #[test]
    fn test_signal_processor_gates_silence() {
        let processor = SignalProcessor::default();
        let mut frame = vec![10i16, -20, 15, 0];
        let analysis = processor.process(&mut frame);
        assert!(!analysis.voice_active);
        assert_eq!(frame, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_signal_processor_normalises_voiced_frames() {
        let processor = SignalProcessor::new(SignalConfig {
            gain_target: 0.5,
            max_gain: 4.0,
            vad_threshold: 0.01,
            noise_gate: 0.0,
        });
        // quarter-scale square wave
        let mut frame: Vec<i16> = (0..64).map(|i| if i % 2 == 0 { 8192 } else { -8192 }).collect();
        let analysis = processor.process(&mut frame);
        assert!(analysis.voice_active);
        assert!((analysis.gain - 2.0).abs() < 0.01);
        assert!(frame.iter().all(|s| (s.abs() - 16384).abs() <= 2));
    }

    #[test]
    fn test_signal_processor_clamps_gain() {
        let processor = SignalProcessor::new(SignalConfig {
            gain_target: 0.9,
            max_gain: 2.0,
            vad_threshold: 0.001,
            noise_gate: 0.0,
        });
        let mut frame = vec![1000i16; 32];
        let analysis = processor.process(&mut frame);
        assert_eq!(analysis.gain, 2.0);
    }

    #[tokio::test]
    async fn test_recording_queues_single_final_chunk() {
        let queue = Arc::new(SharedChunkQueue::new(16));
        let settings = CaptureSettings {
            frame_bytes: 8,
            poll_interval: Duration::from_millis(1),
            ..CaptureSettings::default()
        };
        // 2.5 frames worth of samples
        let factory = ScriptedCapture::factory(vec![3000; 10], 3);
        let (mut handle, mut reports) =
            CaptureHandle::spawn(factory, settings, Arc::clone(&queue), Arc::new(ManualClock::new(0))).unwrap();

        let session = new_session();
        let session_id = session.session_id();
        handle.start(session).unwrap();
        assert_eq!(next_report(&mut reports).await, CaptureReport::Started { session_id });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().unwrap();
        match next_report(&mut reports).await {
            CaptureReport::Finished { chunks, .. } => assert_eq!(chunks, 3),
            other => panic!("unexpected {:?}", other),
        }

        let mut chunks = Vec::new();
        while let Some(chunk) = queue.try_pop() {
            chunks.push(chunk);
        }
        assert_eq!(chunks.iter().map(|c| c.chunk_id).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(chunks.iter().filter(|c| c.is_final).count(), 1);
        assert!(chunks[2].is_final);
        assert_eq!(chunks[0].pcm.len(), 8);
        assert_eq!(chunks[2].pcm.len(), 4);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_threshold_stops_recording() {
        let queue = Arc::new(SharedChunkQueue::new(64));
        let settings = CaptureSettings {
            frame_bytes: 320,
            sample_rate: 16_000,
            max_recording: Duration::from_millis(20),
            poll_interval: Duration::from_millis(1),
            ..CaptureSettings::default()
        };
        let factory = ScriptedCapture::factory(vec![500; 16_000], 160);
        let (handle, mut reports) =
            CaptureHandle::spawn(factory, settings, Arc::clone(&queue), Arc::new(ManualClock::new(0))).unwrap();

        let session = new_session();
        let session_id = session.session_id();
        handle.start(session).unwrap();
        assert_eq!(next_report(&mut reports).await, CaptureReport::Started { session_id });
        assert_eq!(next_report(&mut reports).await, CaptureReport::ThresholdReached { session_id });
        assert!(matches!(next_report(&mut reports).await, CaptureReport::Finished { .. }));

        let mut finals = 0;
        while let Some(chunk) = queue.try_pop() {
            if chunk.is_final {
                finals += 1;
            }
        }
        assert_eq!(finals, 1);
    }

    #[tokio::test]
    async fn test_source_failure_is_reported_and_recoverable() {
        let queue = Arc::new(SharedChunkQueue::new(4));
        let factory: CaptureFactory = Arc::new(|| {
            Ok(Box::new(ScriptedCapture::new(vec![1; 100], 10).fail_after_reads(1)) as Box<dyn CaptureSource>)
        });
        let (handle, mut reports) = CaptureHandle::spawn(
            factory,
            CaptureSettings::default(),
            Arc::clone(&queue),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();

        handle.start(new_session()).unwrap();
        assert!(matches!(next_report(&mut reports).await, CaptureReport::Started { .. }));
        assert!(matches!(next_report(&mut reports).await, CaptureReport::Failed { .. }));

        handle.reinitialize().unwrap();
        assert_eq!(next_report(&mut reports).await, CaptureReport::Reinitialized);
    }
}
