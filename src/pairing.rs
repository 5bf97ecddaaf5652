//! Challenge-response pairing against the backend.
//!
//! The per-device OOB secret is derived locally from the provisioned device id and
//! never leaves the device. Each attempt proves possession of it with an
//! HMAC-SHA256 over `device_id ‖ child_id ‖ nonce` using a fresh random nonce.

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use rand::RngCore;
use rand::rngs::OsRng;
use ring::hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::clock::Clock;
use crate::http::{self, HttpError};
use crate::transport::{Connector, TransportError};

pub const NONCE_LEN: usize = 16;
pub const MAC_LEN: usize = 32;

const OOB_SALT: &[u8] = b"companion-core/oob-secret/v1";
const OOB_CHAIN_ROUNDS: usize = 64;

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("pairing transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("pairing rejected with HTTP {status}")]
    Rejected { status: u16 },
    #[error("malformed pairing response: {0}")]
    MalformedResponse(String),
    #[error("invalid device identity: {0}")]
    InvalidIdentity(String),
}

impl From<HttpError> for PairingError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Transport(e) => PairingError::Transport(e),
            HttpError::Malformed(msg) => PairingError::MalformedResponse(msg),
        }
    }
}

impl PairingError {
    /// 401/403: the server did not accept our proof of the OOB secret.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, PairingError::Rejected { status: 401 | 403 })
    }
}

/// Per-device pairing key. Deliberately has no `Serialize` and a redacted `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct OobSecret([u8; 32]);

impl OobSecret {
    /// Deterministic one-way derivation from the device id and a fixed salt.
    pub fn derive(device_id: &str) -> Self {
        let mut digest: [u8; 32] = Sha256::new()
            .chain_update(OOB_SALT)
            .chain_update(device_id.as_bytes())
            .finalize()
            .into();
        for _ in 0..OOB_CHAIN_ROUNDS {
            digest = Sha256::new()
                .chain_update(digest)
                .chain_update(OOB_SALT)
                .finalize()
                .into();
        }
        Self(digest)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for OobSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("OobSecret(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    device_id: String,
    oob_secret: OobSecret,
    child_id: Option<String>,
}

impl DeviceIdentity {
    pub fn provision(device_id: impl Into<String>) -> Result<Self, PairingError> {
        let device_id = device_id.into();
        if device_id.trim().is_empty() {
            return Err(PairingError::InvalidIdentity("device id is empty".to_string()));
        }
        let oob_secret = OobSecret::derive(&device_id);
        Ok(Self {
            device_id,
            oob_secret,
            child_id: None,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn child_id(&self) -> Option<&str> {
        self.child_id.as_deref()
    }

    pub fn oob_secret(&self) -> &OobSecret {
        &self.oob_secret
    }

    fn bind_child(&mut self, child_id: &str) {
        self.child_id = Some(child_id.to_string());
    }
}

/// HMAC-SHA256(oob_secret, device_id ‖ child_id ‖ nonce)
pub fn compute_mac(secret: &OobSecret, device_id: &str, child_id: &str, nonce: &[u8; NONCE_LEN]) -> [u8; MAC_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let mut ctx = hmac::Context::with_key(&key);
    ctx.update(device_id.as_bytes());
    ctx.update(child_id.as_bytes());
    ctx.update(nonce);
    let tag = ctx.sign();

    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(tag.as_ref());
    mac
}

/// Hands out nonces, never repeating the previous one within a process.
pub struct NonceSource<R: RngCore = OsRng> {
    rng: R,
    last: Option<[u8; NONCE_LEN]>,
}

impl NonceSource<OsRng> {
    pub fn new() -> Self {
        Self::with_rng(OsRng)
    }
}

impl Default for NonceSource<OsRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RngCore> NonceSource<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng, last: None }
    }

    pub fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        loop {
            let mut nonce = [0u8; NONCE_LEN];
            self.rng.fill_bytes(&mut nonce);
            if self.last != Some(nonce) {
                self.last = Some(nonce);
                return nonce;
            }
            warn!("Nonce collision with previous attempt; regenerating");
        }
    }
}

/// One handshake attempt. Built fresh per attempt and dropped once answered.
#[derive(Debug, Clone)]
pub struct PairingAttempt {
    pub nonce: [u8; NONCE_LEN],
    pub mac: [u8; MAC_LEN],
    pub timestamp: u64,
}

impl PairingAttempt {
    pub fn new(identity: &DeviceIdentity, child_id: &str, nonce: [u8; NONCE_LEN], timestamp: u64) -> Self {
        let mac = compute_mac(identity.oob_secret(), identity.device_id(), child_id, &nonce);
        Self {
            nonce,
            mac,
            timestamp,
        }
    }

    pub fn to_request(&self, identity: &DeviceIdentity, child_id: &str, firmware_version: Option<&str>) -> PairingRequest {
        PairingRequest {
            device_id: identity.device_id().to_string(),
            child_id: child_id.to_string(),
            nonce: hex::encode(self.nonce),
            hmac_hex: hex::encode(self.mac),
            firmware_version: firmware_version.map(str::to_string),
            timestamp: Some(self.timestamp),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRequest {
    pub device_id: String,
    pub child_id: String,
    pub nonce: String,
    pub hmac_hex: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PairingResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// Tokens bound to one authenticated connection lifetime
#[derive(Clone, PartialEq, Eq)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
}

impl SessionTokens {
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{}…({} chars)", prefix, token.chars().count())
}

impl std::fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokens")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("token_type", &self.token_type)
            .finish()
    }
}

pub struct PairingClient {
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    identity: Mutex<DeviceIdentity>,
    pairing_path: String,
    firmware_version: Option<String>,
    nonces: Mutex<NonceSource>,
    tokens: Mutex<Option<SessionTokens>>,
}

impl PairingClient {
    pub fn new(
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
        identity: DeviceIdentity,
        pairing_path: impl Into<String>,
        firmware_version: Option<String>,
    ) -> Self {
        Self {
            connector,
            clock,
            identity: Mutex::new(identity),
            pairing_path: pairing_path.into(),
            firmware_version,
            nonces: Mutex::new(NonceSource::new()),
            tokens: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity.lock().ok().map(|id| id.clone())
    }

    /// Tokens from the last successful pairing, if the session is still live.
    pub fn current_tokens(&self) -> Option<SessionTokens> {
        self.tokens.lock().ok().and_then(|t| t.clone())
    }

    /// Drop tokens when their connection goes away; the next session must re-pair.
    pub fn invalidate(&self) {
        if let Ok(mut tokens) = self.tokens.lock() {
            if tokens.take().is_some() {
                debug!("Session tokens invalidated");
            }
        }
    }

    /// Run one handshake against `host:port`. Never retries internally.
    pub async fn pair(&self, host: &str, port: u16, child_id: &str) -> Result<SessionTokens, PairingError> {
        if child_id.trim().is_empty() {
            return Err(PairingError::InvalidIdentity("child id is empty".to_string()));
        }
        self.invalidate();

        let identity = self
            .identity()
            .ok_or_else(|| PairingError::InvalidIdentity("identity lock poisoned".to_string()))?;
        let nonce = self
            .nonces
            .lock()
            .map_err(|_| PairingError::InvalidIdentity("nonce source lock poisoned".to_string()))?
            .next_nonce();
        let attempt = PairingAttempt::new(&identity, child_id, nonce, self.clock.now_millis() / 1000);
        let request = attempt.to_request(&identity, child_id, self.firmware_version.as_deref());
        drop(attempt);

        info!("Pairing device {} with {}:{}", identity.device_id(), host, port);
        let response = http::post_json(self.connector.as_ref(), host, port, &self.pairing_path, &request).await?;

        if !response.is_success() {
            warn!("Pairing rejected by {} with HTTP {}", host, response.status);
            return Err(PairingError::Rejected {
                status: response.status,
            });
        }

        let parsed: PairingResponse = serde_json::from_slice(&response.body)
            .map_err(|e| PairingError::MalformedResponse(e.to_string()))?;
        if parsed.access_token.is_empty() || parsed.refresh_token.is_empty() {
            return Err(PairingError::MalformedResponse("empty token".to_string()));
        }

        let tokens = SessionTokens {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            token_type: parsed.token_type,
        };
        if let Ok(mut id) = self.identity.lock() {
            id.bind_child(child_id);
        }
        if let Ok(mut slot) = self.tokens.lock() {
            *slot = Some(tokens.clone());
        }
        info!("Paired successfully: {:?}", tokens);
        Ok(tokens)
    }
}
