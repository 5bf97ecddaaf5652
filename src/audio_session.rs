use std::fmt;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audio pipeline states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioState {
    Idle,
    Recording,
    Sending,
    Processing,
    Playing,
    Error,
}

impl fmt::Display for AudioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioState::Idle => "IDLE",
            AudioState::Recording => "RECORDING",
            AudioState::Sending => "SENDING",
            AudioState::Processing => "PROCESSING",
            AudioState::Playing => "PLAYING",
            AudioState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioEvent {
    CaptureStart,
    CaptureStop,
    /// Buffered audio reached the recording cap
    BufferThreshold,
    FinalChunkSent,
    ResponseReceived,
    PlaybackComplete,
    /// Persistent connection dropped; the session is abandoned
    ConnectionLost,
    /// Capture or transport failure needing re-initialisation
    Failure(String),
    Recovered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: AudioState,
    pub event: AudioEvent,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event {:?} is not valid in state {}", self.event, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

/// One utterance/response exchange
#[derive(Debug, Clone)]
pub struct AudioSession {
    session_id: Uuid,
    next_chunk_id: u64,
    final_marked: bool,
}

impl AudioSession {
    fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            next_chunk_id: 0,
            final_marked: false,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Allocate the next chunk id; ids increase by one per chunk.
    pub fn allocate_chunk_id(&mut self) -> u64 {
        let id = self.next_chunk_id;
        self.next_chunk_id += 1;
        id
    }

    pub fn chunks_allocated(&self) -> u64 {
        self.next_chunk_id
    }

    /// Claim the single `is_final` flag of this session. Returns false if already claimed.
    pub fn claim_final(&mut self) -> bool {
        if self.final_marked {
            return false;
        }
        self.final_marked = true;
        true
    }

    pub fn final_marked(&self) -> bool {
        self.final_marked
    }
}

/// IDLE → RECORDING → SENDING → PROCESSING → PLAYING → IDLE, with ERROR reachable anywhere.
#[derive(Debug)]
pub struct AudioStateMachine {
    state: AudioState,
    session: Option<AudioSession>,
    last_error: Option<String>,
}

impl Default for AudioStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioStateMachine {
    pub fn new() -> Self {
        Self {
            state: AudioState::Idle,
            session: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> AudioState {
        self.state
    }

    pub fn session(&self) -> Option<&AudioSession> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut AudioSession> {
        self.session.as_mut()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn handle(&mut self, event: AudioEvent) -> Result<AudioState, InvalidTransition> {
        use AudioEvent as E;
        use AudioState as S;

        let next = match (self.state, &event) {
            (S::Idle, E::CaptureStart) => {
                self.session = Some(AudioSession::new());
                S::Recording
            }
            (S::Recording, E::CaptureStop | E::BufferThreshold) => S::Sending,
            (S::Sending, E::FinalChunkSent) => S::Processing,
            (S::Processing, E::ResponseReceived) => S::Playing,
            (S::Playing, E::PlaybackComplete) => {
                self.session = None;
                S::Idle
            }
            (S::Error, E::Recovered) => {
                self.last_error = None;
                S::Idle
            }
            (S::Error, E::ConnectionLost) => S::Error,
            (_, E::ConnectionLost) => {
                if let Some(session) = self.session.take() {
                    warn!("Connection lost; abandoning audio session {}", session.session_id());
                }
                S::Idle
            }
            (_, E::Failure(reason)) => {
                self.session = None;
                self.last_error = Some(reason.clone());
                S::Error
            }
            _ => {
                return Err(InvalidTransition {
                    from: self.state,
                    event: event.clone(),
                });
            }
        };

        if next != self.state {
            match next {
                S::Error => warn!("Audio state {} -> {} ({:?})", self.state, next, event),
                S::Recording | S::Idle => info!("Audio state {} -> {}", self.state, next),
                _ => debug!("Audio state {} -> {}", self.state, next),
            }
        }
        self.state = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_cycle() {
        let mut machine = AudioStateMachine::new();
        assert_eq!(machine.handle(AudioEvent::CaptureStart), Ok(AudioState::Recording));
        assert!(machine.session().is_some());
        assert_eq!(machine.handle(AudioEvent::CaptureStop), Ok(AudioState::Sending));
        assert_eq!(machine.handle(AudioEvent::FinalChunkSent), Ok(AudioState::Processing));
        assert_eq!(machine.handle(AudioEvent::ResponseReceived), Ok(AudioState::Playing));
        assert_eq!(machine.handle(AudioEvent::PlaybackComplete), Ok(AudioState::Idle));
        assert!(machine.session().is_none());
    }

    #[test]
    fn test_chunk_ids_increase_and_final_claimed_once() {
        let mut machine = AudioStateMachine::new();
        machine.handle(AudioEvent::CaptureStart).unwrap();
        let session = machine.session_mut().unwrap();
        assert_eq!(session.allocate_chunk_id(), 0);
        assert_eq!(session.allocate_chunk_id(), 1);
        assert!(session.claim_final());
        assert!(!session.claim_final());
    }
}
