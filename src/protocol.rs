//! Streaming wire messages, JSON text frames over the persistent connection.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

/// Client -> server audio chunk
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename = "audio_chunk")]
pub struct AudioChunkMessage {
    /// base64 of little-endian 16-bit PCM
    pub audio_data: String,
    pub chunk_id: u64,
    pub is_final: bool,
    pub timestamp: u64,
}

impl AudioChunkMessage {
    pub fn new(pcm: &[u8], chunk_id: u64, is_final: bool, timestamp: u64) -> Self {
        Self {
            audio_data: BASE64.encode(pcm),
            chunk_id,
            is_final,
            timestamp,
        }
    }
}

/// Server -> client messages
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AudioResponse {
        audio_data: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default = "default_format")]
        format: String,
        #[serde(default = "default_sample_rate")]
        sample_rate: u32,
    },
    ProcessingStatus {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    ProcessingProgress {
        #[serde(default)]
        progress: Option<f32>,
        #[serde(default)]
        stage: Option<String>,
    },
    System {
        #[serde(default)]
        data: serde_json::Value,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
}

fn default_format() -> String {
    "wav".to_string()
}

fn default_sample_rate() -> u32 {
    16_000
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::AudioResponse { .. } => "audio_response",
            ServerMessage::ProcessingStatus { .. } => "processing_status",
            ServerMessage::ProcessingProgress { .. } => "processing_progress",
            ServerMessage::System { .. } => "system",
            ServerMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_chunk_wire_shape() {
        let msg = AudioChunkMessage::new(&[1, 2, 3], 7, true, 1_700_000_000_000);
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "audio_chunk");
        assert_eq!(value["audio_data"], "AQID");
        assert_eq!(value["chunk_id"], 7);
        assert_eq!(value["is_final"], true);
        assert_eq!(value["timestamp"], 1_700_000_000_000u64);
    }

    #[test]
    fn test_parse_server_messages() {
        let response = ServerMessage::parse(
            r#"{"type":"audio_response","audio_data":"AAA=","text":"hi","format":"pcm","sample_rate":22050}"#,
        )
        .unwrap();
        assert_eq!(response.kind(), "audio_response");
        match response {
            ServerMessage::AudioResponse { format, sample_rate, text, .. } => {
                assert_eq!(format, "pcm");
                assert_eq!(sample_rate, 22050);
                assert_eq!(text.as_deref(), Some("hi"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let status = ServerMessage::parse(r#"{"type":"processing_status","status":"thinking","extra":1}"#).unwrap();
        assert_eq!(status.kind(), "processing_status");

        let system = ServerMessage::parse(r#"{"type":"system","data":{"volume":40}}"#).unwrap();
        assert_eq!(system.kind(), "system");

        let error = ServerMessage::parse(r#"{"type":"error","message":"bad"}"#).unwrap();
        assert_eq!(error.kind(), "error");
    }

    #[test]
    fn test_audio_response_defaults() {
        let response = ServerMessage::parse(r#"{"type":"audio_response","audio_data":""}"#).unwrap();
        assert_eq!(
            response,
            ServerMessage::AudioResponse {
                audio_data: String::new(),
                text: None,
                format: "wav".to_string(),
                sample_rate: 16_000,
            }
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(ServerMessage::parse(r#"{"type":"shell","cmd":"rm"}"#).is_err());
        assert!(ServerMessage::parse("not json").is_err());
    }
}
