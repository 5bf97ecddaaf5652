//! # Companion Core
//!
//! Secure connectivity core for an embedded companion device.
//!
//! ## Overview
//!
//! The device pairs with its backend using a challenge-response handshake keyed by a
//! locally derived secret, keeps talking to a primary or secondary host with bounded
//! backoff, and streams push-to-talk audio over one authenticated WebSocket per session.
//! A security alerting layer watches every component and can force a reconnect or put
//! the device into lockdown.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use companion_core::{ConfigManager, DeviceRuntime};
//! use companion_core::streaming::ControlEvent;
//! use anyhow::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = ConfigManager::new()?.get_config().clone();
//!     let runtime = DeviceRuntime::new(config)?;
//!
//!     let (controls, rx) = tokio::sync::mpsc::channel(16);
//!     controls.send(ControlEvent::CaptureStart).await?;
//!
//!     runtime.run(rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`]: TLS connections validated against hostnames, gated on a synchronised clock
//! - [`failover`]: primary/secondary host selection and retry backoff, durably persisted via [`store`]
//! - [`pairing`]: OOB-secret MAC handshake producing session tokens
//! - [`streaming`]: the audio session state machine over a persistent WebSocket
//! - [`capture`] / [`playback`]: device threads feeding and draining the pipeline
//! - [`alerting`]: attack-pattern detection, alert fan-out and lockdown
//! - [`monitoring`]: health checks over all of the above
//! - [`app`]: the runtime wiring the concurrent units together
//!
//! ## Concurrency
//!
//! Transport I/O and alerting run as tokio tasks. Capture and playback run on dedicated
//! threads because audio device handles cannot move between threads; they talk to the
//! streaming task through bounded channels and the outbound [`chunk_queue`], so capture
//! never waits on the network.

/// Wall clock and the clock-synchronisation precondition
pub mod clock;

/// Secure transport: hostname-validated TLS with classified failures
pub mod transport;

/// Minimal HTTP/1.1 JSON exchange over a transport connection
pub mod http;

/// Durable device state: host configuration, failover counters, lockdown flag
pub mod store;

/// Host failover manager and failover event bus
pub mod failover;

/// Pairing and authentication client
pub mod pairing;

/// Streaming wire messages
pub mod protocol;

/// Bounded outbound chunk queue that never evicts the final chunk
pub mod chunk_queue;

/// Audio session state machine
pub mod audio_session;

/// Audio capture, frame assembly and signal conditioning
pub mod capture;

/// Response decoding and audio playback
pub mod playback;

/// Audio streaming client
pub mod streaming;

/// Local visual/audio indicator
pub mod indicator;

/// Circuit breaker and bounded recovery
pub mod error_recovery;

/// Security alerting, attack patterns and lockdown
pub mod alerting;

/// Health monitoring
pub mod monitoring;

/// Configuration management with persistence and validation
pub mod config;

/// Device runtime orchestration
pub mod app;

#[cfg(test)]
mod tests;

// Re-export main types for convenience
pub use app::{DeviceRuntime, RuntimeParts};
pub use config::{AppConfig, ConfigManager};
pub use failover::{FailoverManager, HostConfiguration};
pub use pairing::{PairingClient, SessionTokens};
pub use streaming::StreamingClient;
pub use transport::{Connector, SecureTransport, TransportError};
