//! Wire messages exchanged with the remote agent
//!
//! Every frame is a JSON object whose `action` field selects the variant.
//! Unrecognised actions decode to [`MessageKind::Unknown`] so that new remote
//! events never break the connection; the original object is always kept in
//! [`AgentMessage::raw`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Session parameters announced by the remote in `INIT_CONVERSATION`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConversationMetadata {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_output_audio_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_input_audio_format: Option<String>,
}

/// Synthesized agent speech, base64 PCM16 LE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioPayload {
    pub audio: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum MessageKind {
    // Inbound
    #[serde(rename = "INIT_CONVERSATION")]
    InitConversation(ConversationMetadata),
    #[serde(rename = "LOAD_AUDIO")]
    LoadAudio(AudioPayload),
    #[serde(rename = "agent_response")]
    AgentResponse { text: String },
    #[serde(rename = "user_transcript")]
    UserTranscript { text: String },
    #[serde(rename = "interruption")]
    Interruption {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<u64>,
    },
    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        event_id: u64,
    },

    // Outbound
    #[serde(rename = "initClientData")]
    InitClientData { overrides: Value },
    #[serde(rename = "userAudioChunk")]
    UserAudioChunk { audio: String },
    #[serde(rename = "userActivity")]
    UserActivity,
    #[serde(rename = "userTextMessage")]
    UserTextMessage {
        text: String,
        #[serde(rename = "clientEventId")]
        client_event_id: String,
    },
    #[serde(rename = "pong")]
    Pong { event_id: u64 },

    #[serde(other)]
    Unknown,
}

impl MessageKind {
    /// Wire name of the action
    pub fn action(&self) -> &'static str {
        match self {
            MessageKind::InitConversation(_) => "INIT_CONVERSATION",
            MessageKind::LoadAudio(_) => "LOAD_AUDIO",
            MessageKind::AgentResponse { .. } => "agent_response",
            MessageKind::UserTranscript { .. } => "user_transcript",
            MessageKind::Interruption { .. } => "interruption",
            MessageKind::Ping { .. } => "ping",
            MessageKind::InitClientData { .. } => "initClientData",
            MessageKind::UserAudioChunk { .. } => "userAudioChunk",
            MessageKind::UserActivity => "userActivity",
            MessageKind::UserTextMessage { .. } => "userTextMessage",
            MessageKind::Pong { .. } => "pong",
            MessageKind::Unknown => "unknown",
        }
    }
}

/// A decoded message together with the object it came from
#[derive(Debug, Clone, PartialEq)]
pub struct AgentMessage {
    pub kind: MessageKind,
    pub raw: Value,
}

impl AgentMessage {
    pub fn from_kind(kind: MessageKind) -> Self {
        let raw = serde_json::to_value(&kind).unwrap_or_default();
        Self { kind, raw }
    }

    /// Decode one text frame
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        let kind =
            MessageKind::deserialize(&raw).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(Self { kind, raw })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.kind)
    }

    /// Action as it appeared on the wire, including unknown ones
    pub fn action(&self) -> &str {
        self.raw
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_else(|| self.kind.action())
    }

    pub fn init_client_data(overrides: Value) -> Self {
        Self::from_kind(MessageKind::InitClientData { overrides })
    }

    pub fn user_audio_chunk(samples: &[i16]) -> Self {
        Self::from_kind(MessageKind::UserAudioChunk {
            audio: encode_pcm16(samples),
        })
    }

    pub fn user_activity() -> Self {
        Self::from_kind(MessageKind::UserActivity)
    }

    pub fn user_text_message(text: impl Into<String>, client_event_id: impl Into<String>) -> Self {
        Self::from_kind(MessageKind::UserTextMessage {
            text: text.into(),
            client_event_id: client_event_id.into(),
        })
    }

    pub fn pong(event_id: u64) -> Self {
        Self::from_kind(MessageKind::Pong { event_id })
    }
}

/// PCM16 samples to base64 of their little-endian bytes
pub fn encode_pcm16(samples: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    STANDARD.encode(bytes)
}

pub fn decode_pcm16(audio: &str) -> Result<Vec<i16>, ProtocolError> {
    let bytes = STANDARD
        .decode(audio)
        .map_err(|e| ProtocolError::Decode(format!("audio payload: {}", e)))?;

    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::Decode(format!(
            "audio payload has odd length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Sample rate of a `pcm_<rate>` format string
pub fn parse_pcm_format(format: &str) -> Result<u32, ProtocolError> {
    format
        .strip_prefix("pcm_")
        .and_then(|rate| rate.parse::<u32>().ok())
        .filter(|rate| *rate > 0)
        .ok_or_else(|| ProtocolError::InvalidMetadata(format!("unsupported audio format {:?}", format)))
}
