//! Audio playback unit: response decoding, volume and the output sink thread.

use std::io::Cursor;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use dasp::Sample;
use hound::SampleFormat;
use log::{debug, error, info, warn};
use ringbuf::{traits::*, HeapRb};
use thiserror::Error;

use crate::indicator::{Indicator, IndicatorMode};

pub const DEFAULT_VOLUME: u8 = 70;
const REPORT_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("audio payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid WAV payload: {0}")]
    Wav(#[from] hound::Error),
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),
    #[error("invalid sample rate {0}")]
    InvalidSampleRate(u32),
}

/// Mono 16-bit PCM ready for the sink
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// RMS level in 0.0..=1.0, used to drive the speaking indicator.
    pub fn level(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = self
            .samples
            .iter()
            .map(|s| {
                let x = s.to_sample::<f32>();
                x * x
            })
            .sum();
        (sum_sq / self.samples.len() as f32).sqrt().min(1.0)
    }
}

/// Decode an `audio_response` payload. `wav` carries its own rate; raw PCM uses `sample_rate`.
pub fn decode_response(audio_data: &str, format: &str, sample_rate: u32) -> Result<DecodedAudio, PlaybackError> {
    let bytes = BASE64.decode(audio_data.trim())?;

    match format.to_ascii_lowercase().as_str() {
        "wav" | "wave" => decode_wav(&bytes),
        "pcm" | "pcm16" | "pcm_s16le" => {
            if sample_rate == 0 {
                return Err(PlaybackError::InvalidSampleRate(sample_rate));
            }
            let samples = bytes
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            Ok(DecodedAudio { samples, sample_rate })
        }
        other => Err(PlaybackError::UnsupportedFormat(other.to_string())),
    }
}

fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio, PlaybackError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(PlaybackError::InvalidSampleRate(0));
    }

    let interleaved: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader.samples::<i16>().collect::<Result<_, _>>()?,
        (SampleFormat::Int, 8) => reader
            .samples::<i8>()
            .map(|s| s.map(|v| v.to_sample::<i16>()))
            .collect::<Result<_, _>>()?,
        (SampleFormat::Int, bits @ (24 | 32)) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| (v >> (bits - 16)) as i16))
            .collect::<Result<_, _>>()?,
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|s| s.map(|v| v.clamp(-1.0, 1.0).to_sample::<i16>()))
            .collect::<Result<_, _>>()?,
        (format, bits) => {
            return Err(PlaybackError::UnsupportedFormat(format!("wav {:?} {}-bit", format, bits)));
        }
    };

    let channels = spec.channels.max(1) as usize;
    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| (frame.iter().map(|&s| s as i32).sum::<i32>() / frame.len() as i32) as i16)
            .collect()
    };

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Where decoded audio is rendered. Built on the playback thread via a [`SinkFactory`].
pub trait AudioSink {
    /// Begin rendering; must return without waiting for playback to finish.
    fn play(&mut self, audio: &DecodedAudio, volume: f32) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}

pub type SinkFactory = Arc<dyn Fn() -> Result<Box<dyn AudioSink>> + Send + Sync>;

/// Default output device via cpal
#[derive(Default)]
pub struct CpalSink {
    stream: Option<Stream>,
}

impl CpalSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory() -> SinkFactory {
        Arc::new(|| Ok(Box::new(CpalSink::new()) as Box<dyn AudioSink>))
    }
}

impl AudioSink for CpalSink {
    fn play(&mut self, audio: &DecodedAudio, volume: f32) -> Result<()> {
        self.stop()?;

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("No default output device available"))?;
        debug!(
            "Output device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let config = StreamConfig {
            channels: 1,
            sample_rate: SampleRate(audio.sample_rate),
            buffer_size: BufferSize::Default,
        };

        let rb = HeapRb::<f32>::new(audio.samples.len().max(1));
        let (mut producer, mut consumer) = rb.split();
        producer.push_iter(audio.samples.iter().map(|s| s.to_sample::<f32>() * volume));

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let written = consumer.pop_slice(data);
                    // Drained: output silence
                    data[written..].fill(0.0);
                },
                |err| {
                    error!("Audio output stream error: {}", err);
                },
                None,
            )
            .context("building output stream")?;
        stream.play().context("starting output stream")?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.pause().context("pausing output stream")?;
        }
        Ok(())
    }
}

/// Discards audio; for headless runs and tests. Remembers what it was asked to play.
#[derive(Default, Clone)]
pub struct NullSink {
    played: Arc<Mutex<Vec<(usize, u32, f32)>>>,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// (sample count, sample rate, volume) per play request
    pub fn played(&self) -> Vec<(usize, u32, f32)> {
        self.played.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn factory(&self) -> SinkFactory {
        let sink = self.clone();
        Arc::new(move || Ok(Box::new(sink.clone()) as Box<dyn AudioSink>))
    }
}

impl AudioSink for NullSink {
    fn play(&mut self, audio: &DecodedAudio, volume: f32) -> Result<()> {
        if let Ok(mut played) = self.played.lock() {
            played.push((audio.samples.len(), audio.sample_rate, volume));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub enum PlaybackCommand {
    Play(DecodedAudio),
    Stop,
    SetVolume(u8),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackReport {
    Started { duration: Duration },
    Completed,
    Failed { reason: String },
}

pub struct PlaybackHandle {
    commands: Sender<PlaybackCommand>,
    thread: Option<JoinHandle<()>>,
}

impl PlaybackHandle {
    pub fn spawn(
        factory: SinkFactory,
        volume: u8,
        indicator: Arc<dyn Indicator>,
    ) -> Result<(Self, tokio::sync::mpsc::Receiver<PlaybackReport>)> {
        let (commands_tx, commands_rx) = mpsc::channel();
        let (reports_tx, reports_rx) = tokio::sync::mpsc::channel(REPORT_CHANNEL_CAPACITY);

        let thread = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                PlaybackWorker {
                    factory,
                    volume: volume.min(100),
                    indicator,
                    commands: commands_rx,
                    reports: reports_tx,
                    sink: None,
                }
                .run()
            })
            .context("spawning playback thread")?;

        Ok((
            Self {
                commands: commands_tx,
                thread: Some(thread),
            },
            reports_rx,
        ))
    }

    pub fn play(&self, audio: DecodedAudio) -> Result<()> {
        self.send(PlaybackCommand::Play(audio))
    }

    pub fn stop(&self) -> Result<()> {
        self.send(PlaybackCommand::Stop)
    }

    pub fn set_volume(&self, volume: u8) -> Result<()> {
        self.send(PlaybackCommand::SetVolume(volume))
    }

    fn send(&self, command: PlaybackCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("playback thread has exited"))
    }

    pub fn shutdown(&mut self) {
        let _ = self.commands.send(PlaybackCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Playback thread panicked");
            }
        }
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct PlaybackWorker {
    factory: SinkFactory,
    volume: u8,
    indicator: Arc<dyn Indicator>,
    commands: Receiver<PlaybackCommand>,
    reports: tokio::sync::mpsc::Sender<PlaybackReport>,
    sink: Option<Box<dyn AudioSink>>,
}

impl PlaybackWorker {
    fn run(mut self) {
        while let Ok(command) = self.commands.recv() {
            match command {
                PlaybackCommand::Play(audio) => {
                    if self.play(audio) {
                        break;
                    }
                }
                PlaybackCommand::SetVolume(volume) => self.set_volume(volume),
                PlaybackCommand::Stop => {}
                PlaybackCommand::Shutdown => break,
            }
        }
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.stop();
        }
    }

    fn report(&self, report: PlaybackReport) {
        if let Err(e) = self.reports.try_send(report) {
            warn!("Dropping playback report: {}", e);
        }
    }

    fn set_volume(&mut self, volume: u8) {
        self.volume = volume.min(100);
        info!("Playback volume set to {}", self.volume);
    }

    /// Render one response and wait out its duration. Returns true on shutdown.
    fn play(&mut self, audio: DecodedAudio) -> bool {
        if self.sink.is_none() {
            match (self.factory)() {
                Ok(sink) => self.sink = Some(sink),
                Err(e) => {
                    self.report(PlaybackReport::Failed {
                        reason: format!("opening output: {:#}", e),
                    });
                    return false;
                }
            }
        }

        let duration = audio.duration();
        let volume = self.volume as f32 / 100.0;
        let started = match self.sink.as_mut() {
            Some(sink) => sink.play(&audio, volume),
            None => return false,
        };
        if let Err(e) = started {
            self.sink = None;
            self.report(PlaybackReport::Failed {
                reason: format!("{:#}", e),
            });
            return false;
        }

        info!("Playing {:.2}s of audio", duration.as_secs_f32());
        self.indicator.set_mode(IndicatorMode::Speaking { level: audio.level() });
        self.report(PlaybackReport::Started { duration });

        let deadline = Instant::now() + duration;
        let mut shutdown = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.commands.recv_timeout(remaining) {
                Ok(PlaybackCommand::Stop) => {
                    debug!("Playback interrupted");
                    break;
                }
                Ok(PlaybackCommand::SetVolume(volume)) => self.set_volume(volume),
                Ok(PlaybackCommand::Play(_)) => warn!("Already playing; ignoring new audio"),
                Ok(PlaybackCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    shutdown = true;
                    break;
                }
                Err(RecvTimeoutError::Timeout) => break,
            }
        }

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.stop() {
                warn!("Stopping output: {:#}", e);
            }
        }
        self.indicator.set_mode(IndicatorMode::Idle);
        self.report(PlaybackReport::Completed);
        shutdown
    }
}
