//! Conversation protocol state on top of a connection
//!
//! A `ConversationSession` exists only after the remote has announced the
//! conversation with `INIT_CONVERSATION`. Before that the caller holds a
//! [`ConversationState::waiting_on_meta_state`] and must refuse to send.
//! The session never talks to the connection directly: anything it wants to
//! transmit goes through the reply function handed to [`handle`].
//!
//! [`handle`]: ConversationSession::handle

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::messages::{decode_pcm16, parse_pcm_format, AgentMessage, ConversationMetadata, MessageKind};
use crate::playback::PlaybackEngine;

/// Agent audio rate when the metadata does not name one
const DEFAULT_OUTPUT_RATE: u32 = 16000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SendStatus {
    PendingMeta,
    Ready,
    Sending,
    Error,
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SendStatus::PendingMeta => "pendingMeta",
            SendStatus::Ready => "ready",
            SendStatus::Sending => "sending",
            SendStatus::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReceiveStatus {
    Idle,
    Receiving,
}

impl fmt::Display for ReceiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiveStatus::Idle => f.write_str("idle"),
            ReceiveStatus::Receiving => f.write_str("receiving"),
        }
    }
}

/// Snapshot of both lifecycle axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub send_status: SendStatus,
    pub receive_status: ReceiveStatus,
}

impl ConversationState {
    /// Initial state before the handshake
    pub fn waiting_on_meta_state() -> Self {
        Self {
            send_status: SendStatus::PendingMeta,
            receive_status: ReceiveStatus::Idle,
        }
    }

    /// State after a failed handshake or a protocol fault
    pub fn error_state(err: &ProtocolError) -> Self {
        warn!("Conversation error: {}", err);
        Self {
            send_status: SendStatus::Error,
            receive_status: ReceiveStatus::Idle,
        }
    }

    pub fn can_send(&self) -> bool {
        matches!(self.send_status, SendStatus::Ready | SendStatus::Sending)
    }
}

/// What the orchestration layer should do after [`ConversationSession::handle`]
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// Agent audio was queued; playback must not stay suspended
    EnsurePlayback { event_id: Option<u64>, samples: usize },
    /// Audio from an utterance the remote already cut off
    DroppedStaleAudio { event_id: u64 },
    AgentResponse(String),
    UserTranscript(String),
    /// The remote stopped speaking because the user barged in
    Interrupted { event_id: Option<u64> },
    /// A keepalive was answered
    Acknowledged { event_id: u64 },
    Ignored,
}

/// Live conversation after a successful handshake
pub struct ConversationSession {
    metadata: ConversationMetadata,
    output_rate: u32,
    input_rate: Option<u32>,
    send_status: SendStatus,
    receive_status: ReceiveStatus,
    last_audio_event: Option<u64>,
    interrupted_event: Option<u64>,
    playback: Option<Arc<dyn PlaybackEngine>>,
    /// Without an engine, when the queued agent audio would have finished
    audio_ends_at: Option<Instant>,
}

impl ConversationSession {
    /// Validate an `INIT_CONVERSATION` message and start a session
    pub fn from_agent_meta_info(message: &AgentMessage) -> Result<Self, ProtocolError> {
        let MessageKind::InitConversation(metadata) = &message.kind else {
            return Err(ProtocolError::UnexpectedMessage {
                expected: "INIT_CONVERSATION",
                actual: message.action().to_string(),
            });
        };

        if metadata.conversation_id.trim().is_empty() {
            return Err(ProtocolError::InvalidMetadata(
                "missing conversation_id".to_string(),
            ));
        }

        let output_rate = match &metadata.agent_output_audio_format {
            Some(format) => parse_pcm_format(format)?,
            None => DEFAULT_OUTPUT_RATE,
        };

        let input_rate = metadata
            .user_input_audio_format
            .as_deref()
            .map(parse_pcm_format)
            .transpose()?;

        info!(
            "Conversation {} started (agent audio {} Hz)",
            metadata.conversation_id, output_rate
        );

        Ok(Self {
            metadata: metadata.clone(),
            output_rate,
            input_rate,
            send_status: SendStatus::Ready,
            receive_status: ReceiveStatus::Idle,
            last_audio_event: None,
            interrupted_event: None,
            playback: None,
            audio_ends_at: None,
        })
    }

    /// Attach the engine that renders agent audio
    pub fn with_playback(mut self, playback: Arc<dyn PlaybackEngine>) -> Self {
        self.playback = Some(playback);
        self
    }

    pub fn to_state(&self) -> ConversationState {
        ConversationState {
            send_status: self.send_status,
            receive_status: self.receive_status,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.metadata.conversation_id
    }

    pub fn metadata(&self) -> &ConversationMetadata {
        &self.metadata
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Rate the remote expects for user audio, if it said
    pub fn input_rate(&self) -> Option<u32> {
        self.input_rate
    }

    /// Handle one inbound message.
    ///
    /// Acknowledgements go out through `reply`. A protocol fault moves the
    /// send axis to `error` and is returned to the caller.
    pub fn handle<R>(&mut self, message: &AgentMessage, mut reply: R) -> Result<SessionSignal, ProtocolError>
    where
        R: FnMut(AgentMessage),
    {
        let outcome = match &message.kind {
            MessageKind::LoadAudio(payload) => {
                self.load_audio(payload.event_id, &payload.audio, Instant::now())
            }
            MessageKind::AgentResponse { text } => Ok(SessionSignal::AgentResponse(text.clone())),
            MessageKind::UserTranscript { text } => Ok(SessionSignal::UserTranscript(text.clone())),
            MessageKind::Interruption { event_id } => {
                self.receive_status = ReceiveStatus::Idle;
                self.audio_ends_at = None;
                if let Some(id) = *event_id {
                    self.interrupted_event = Some(self.interrupted_event.map_or(id, |prev| prev.max(id)));
                }
                if let Some(playback) = &self.playback {
                    playback.stop();
                }
                debug!("Agent interrupted at event {:?}", event_id);
                Ok(SessionSignal::Interrupted { event_id: *event_id })
            }
            MessageKind::Ping { event_id } => {
                reply(AgentMessage::pong(*event_id));
                Ok(SessionSignal::Acknowledged { event_id: *event_id })
            }
            MessageKind::InitConversation(_) => Err(ProtocolError::UnexpectedMessage {
                expected: "conversation event",
                actual: "INIT_CONVERSATION".to_string(),
            }),
            MessageKind::InitClientData { .. }
            | MessageKind::UserAudioChunk { .. }
            | MessageKind::UserActivity
            | MessageKind::UserTextMessage { .. }
            | MessageKind::Pong { .. } => {
                debug!("Ignoring client-side action {} from remote", message.action());
                Ok(SessionSignal::Ignored)
            }
            MessageKind::Unknown => {
                debug!("Ignoring unknown action {}", message.action());
                Ok(SessionSignal::Ignored)
            }
        };

        if let Err(e) = &outcome {
            warn!("Protocol fault: {}", e);
            self.send_status = SendStatus::Error;
        }

        outcome
    }

    fn load_audio(
        &mut self,
        event_id: Option<u64>,
        audio: &str,
        now: Instant,
    ) -> Result<SessionSignal, ProtocolError> {
        // Only comparable when both sides carry an id
        if let (Some(id), Some(cut)) = (event_id, self.interrupted_event) {
            if id <= cut {
                return Ok(SessionSignal::DroppedStaleAudio { event_id: id });
            }
        }

        let pcm = decode_pcm16(audio)?;
        self.receive_status = ReceiveStatus::Receiving;
        if event_id.is_some() {
            self.last_audio_event = event_id;
        }

        match &self.playback {
            Some(playback) => {
                if playback.is_suspended() {
                    playback.resume();
                }
                if let Err(e) = playback.enqueue(&pcm, self.output_rate) {
                    warn!("Failed to queue agent audio: {}", e);
                }
            }
            None => {
                let length = Duration::from_secs_f64(pcm.len() as f64 / self.output_rate as f64);
                let start = self.audio_ends_at.map_or(now, |end| end.max(now));
                self.audio_ends_at = Some(start + length);
            }
        }

        Ok(SessionSignal::EnsurePlayback {
            event_id,
            samples: pcm.len(),
        })
    }

    /// Move the send axis. Legal: `pendingMeta -> ready`, `ready <-> sending`,
    /// anything `-> error`. `error` is terminal.
    pub fn update_send_status(&mut self, to: SendStatus) -> Result<(), ProtocolError> {
        let from = self.send_status;
        let legal = matches!(
            (from, to),
            (SendStatus::PendingMeta, SendStatus::Ready)
                | (SendStatus::Ready, SendStatus::Sending)
                | (SendStatus::Sending, SendStatus::Ready)
                | (_, SendStatus::Error)
        ) || (from == to && from != SendStatus::Error);

        if !legal {
            return Err(ProtocolError::IllegalTransition { from, to });
        }

        if from != to {
            debug!("Send status {} -> {}", from, to);
        }
        self.send_status = to;
        Ok(())
    }

    /// Drop back to `idle` once the agent audio has drained
    pub fn refresh_receive_status(&mut self) {
        self.refresh_receive_status_at(Instant::now());
    }

    /// Same as [`refresh_receive_status`](Self::refresh_receive_status) with
    /// an explicit clock. With no engine attached, the audio counts as drained
    /// once its duration at the output rate has elapsed.
    pub fn refresh_receive_status_at(&mut self, now: Instant) {
        if self.receive_status != ReceiveStatus::Receiving {
            return;
        }

        let drained = match &self.playback {
            Some(playback) => !playback.is_playing(),
            None => self.audio_ends_at.map_or(true, |end| now >= end),
        };
        if drained {
            self.receive_status = ReceiveStatus::Idle;
            self.audio_ends_at = None;
        }
    }

    /// Agent audio is arriving or audible
    pub fn agent_speaking(&self) -> bool {
        self.receive_status == ReceiveStatus::Receiving
            || self.playback.as_ref().map(|p| p.is_playing()).unwrap_or(false)
    }

    /// Ask the remote to stop speaking.
    ///
    /// Fire-and-forget: local playback is cut and a `userActivity` goes out,
    /// but neither status axis changes. The remote confirms with an
    /// `interruption` message, which is what moves `receive_status`.
    pub fn interrupt<R>(&mut self, mut reply: R)
    where
        R: FnMut(AgentMessage),
    {
        if let Some(playback) = &self.playback {
            playback.stop();
        }
        if let Some(event_id) = self.last_audio_event {
            debug!("Interrupting agent after event {}", event_id);
        }
        reply(AgentMessage::user_activity());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::encode_pcm16;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakePlayback {
        queued: Mutex<Vec<(usize, u32)>>,
        playing: AtomicBool,
        suspended: AtomicBool,
        stops: Mutex<usize>,
    }

    impl PlaybackEngine for FakePlayback {
        fn enqueue(&self, pcm: &[i16], sample_rate: u32) -> voxlink_audio::Result<()> {
            self.queued.lock().push((pcm.len(), sample_rate));
            self.playing.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn is_playing(&self) -> bool {
            self.playing.load(Ordering::SeqCst)
        }
        fn is_suspended(&self) -> bool {
            self.suspended.load(Ordering::SeqCst)
        }
        fn resume(&self) {
            self.suspended.store(false, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.playing.store(false, Ordering::SeqCst);
            *self.stops.lock() += 1;
        }
    }

    fn decode(value: serde_json::Value) -> AgentMessage {
        AgentMessage::decode(&value.to_string()).unwrap()
    }

    fn init_message() -> AgentMessage {
        decode(json!({
            "action": "INIT_CONVERSATION",
            "conversation_id": "conv-42",
            "agent_output_audio_format": "pcm_22050",
            "user_input_audio_format": "pcm_16000"
        }))
    }

    fn audio(event_id: u64) -> AgentMessage {
        decode(json!({
            "action": "LOAD_AUDIO",
            "audio": encode_pcm16(&[1, 2, 3, 4]),
            "event_id": event_id
        }))
    }

    fn no_reply(_: AgentMessage) {}

    #[test]
    fn test_waiting_state() {
        let state = ConversationState::waiting_on_meta_state();
        assert_eq!(state.send_status, SendStatus::PendingMeta);
        assert_eq!(state.receive_status, ReceiveStatus::Idle);
        assert!(!state.can_send());
    }

    #[test]
    fn test_handshake_yields_ready() {
        let session = ConversationSession::from_agent_meta_info(&init_message()).unwrap();
        assert_eq!(
            session.to_state(),
            ConversationState {
                send_status: SendStatus::Ready,
                receive_status: ReceiveStatus::Idle
            }
        );
        assert_eq!(session.conversation_id(), "conv-42");
        assert_eq!(session.output_rate(), 22050);
        assert_eq!(session.input_rate(), Some(16000));
    }

    #[test]
    fn test_handshake_rejects_other_messages() {
        let err = ConversationSession::from_agent_meta_info(&AgentMessage::pong(1))
            .err()
            .unwrap();
        assert!(matches!(err, ProtocolError::UnexpectedMessage { .. }));

        let state = ConversationState::error_state(&err);
        assert_eq!(state.send_status, SendStatus::Error);
        assert_eq!(state.receive_status, ReceiveStatus::Idle);
    }

    #[test]
    fn test_handshake_validates_metadata() {
        let missing_id = decode(json!({"action": "INIT_CONVERSATION"}));
        assert!(matches!(
            ConversationSession::from_agent_meta_info(&missing_id),
            Err(ProtocolError::InvalidMetadata(_))
        ));

        let bad_format = decode(json!({
            "action": "INIT_CONVERSATION",
            "conversation_id": "c",
            "agent_output_audio_format": "mp3_44100"
        }));
        assert!(matches!(
            ConversationSession::from_agent_meta_info(&bad_format),
            Err(ProtocolError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_load_audio_feeds_playback() {
        let playback = Arc::new(FakePlayback::default());
        playback.suspended.store(true, Ordering::SeqCst);

        let mut session = ConversationSession::from_agent_meta_info(&init_message())
            .unwrap()
            .with_playback(playback.clone());

        let signal = session.handle(&audio(1), no_reply).unwrap();
        assert_eq!(
            signal,
            SessionSignal::EnsurePlayback {
                event_id: Some(1),
                samples: 4
            }
        );
        assert_eq!(session.to_state().receive_status, ReceiveStatus::Receiving);
        assert_eq!(*playback.queued.lock(), vec![(4, 22050)]);
        assert!(!playback.is_suspended());
        assert!(session.agent_speaking());
    }

    #[test]
    fn test_transcripts_pass_through() {
        let mut session = ConversationSession::from_agent_meta_info(&init_message()).unwrap();
        let before = session.to_state();

        let signal = session
            .handle(&decode(json!({"action": "agent_response", "text": "Hi there"})), no_reply)
            .unwrap();
        assert_eq!(signal, SessionSignal::AgentResponse("Hi there".into()));

        let signal = session
            .handle(&decode(json!({"action": "user_transcript", "text": "hello"})), no_reply)
            .unwrap();
        assert_eq!(signal, SessionSignal::UserTranscript("hello".into()));
        assert_eq!(session.to_state(), before);
    }

    #[test]
    fn test_ping_answered_through_reply() {
        let mut session = ConversationSession::from_agent_meta_info(&init_message()).unwrap();
        let mut replies = Vec::new();

        let signal = session
            .handle(&decode(json!({"action": "ping", "event_id": 7})), |m| replies.push(m))
            .unwrap();

        assert_eq!(signal, SessionSignal::Acknowledged { event_id: 7 });
        assert_eq!(replies, vec![AgentMessage::pong(7)]);
    }

    #[test]
    fn test_interruption_drops_stale_audio() {
        let playback = Arc::new(FakePlayback::default());
        let mut session = ConversationSession::from_agent_meta_info(&init_message())
            .unwrap()
            .with_playback(playback.clone());

        session.handle(&audio(3), no_reply).unwrap();
        let signal = session
            .handle(&decode(json!({"action": "interruption", "event_id": 3})), no_reply)
            .unwrap();
        assert_eq!(signal, SessionSignal::Interrupted { event_id: Some(3) });
        assert_eq!(session.to_state().receive_status, ReceiveStatus::Idle);
        assert_eq!(*playback.stops.lock(), 1);

        assert_eq!(
            session.handle(&audio(3), no_reply).unwrap(),
            SessionSignal::DroppedStaleAudio { event_id: 3 }
        );
        assert!(matches!(
            session.handle(&audio(4), no_reply).unwrap(),
            SessionSignal::EnsurePlayback {
                event_id: Some(4),
                ..
            }
        ));
    }

    #[test]
    fn test_second_handshake_is_a_fault() {
        let mut session = ConversationSession::from_agent_meta_info(&init_message()).unwrap();
        assert!(session.handle(&init_message(), no_reply).is_err());
        assert_eq!(session.to_state().send_status, SendStatus::Error);
    }

    #[test]
    fn test_bad_audio_is_a_fault() {
        let mut session = ConversationSession::from_agent_meta_info(&init_message()).unwrap();
        let broken = decode(json!({"action": "LOAD_AUDIO", "audio": "AA==", "event_id": 1}));
        assert!(matches!(
            session.handle(&broken, no_reply),
            Err(ProtocolError::Decode(_))
        ));
        assert_eq!(session.to_state().send_status, SendStatus::Error);
    }

    #[test]
    fn test_unknown_ignored() {
        let mut session = ConversationSession::from_agent_meta_info(&init_message()).unwrap();
        let signal = session
            .handle(&decode(json!({"action": "vad_score", "score": 0.1})), no_reply)
            .unwrap();
        assert_eq!(signal, SessionSignal::Ignored);
        assert_eq!(session.to_state().send_status, SendStatus::Ready);
    }

    #[test]
    fn test_send_status_transitions() {
        let mut session = ConversationSession::from_agent_meta_info(&init_message()).unwrap();

        session.update_send_status(SendStatus::Sending).unwrap();
        session.update_send_status(SendStatus::Ready).unwrap();
        assert!(matches!(
            session.update_send_status(SendStatus::PendingMeta),
            Err(ProtocolError::IllegalTransition { .. })
        ));

        session.update_send_status(SendStatus::Error).unwrap();
        assert!(session.update_send_status(SendStatus::Ready).is_err());
        assert_eq!(session.to_state().send_status, SendStatus::Error);
    }

    #[test]
    fn test_interrupt_is_fire_and_forget() {
        let playback = Arc::new(FakePlayback::default());
        let mut session = ConversationSession::from_agent_meta_info(&init_message())
            .unwrap()
            .with_playback(playback.clone());
        session.handle(&audio(1), no_reply).unwrap();
        let before = session.to_state();

        let mut replies = Vec::new();
        session.interrupt(|m| replies.push(m));

        assert_eq!(replies, vec![AgentMessage::user_activity()]);
        assert_eq!(*playback.stops.lock(), 1);
        assert_eq!(session.to_state(), before);
    }

    #[test]
    fn test_receive_settles_when_playback_drains() {
        let playback = Arc::new(FakePlayback::default());
        let mut session = ConversationSession::from_agent_meta_info(&init_message())
            .unwrap()
            .with_playback(playback.clone());
        session.handle(&audio(1), no_reply).unwrap();

        session.refresh_receive_status();
        assert_eq!(session.to_state().receive_status, ReceiveStatus::Receiving);

        playback.playing.store(false, Ordering::SeqCst);
        session.refresh_receive_status();
        assert_eq!(session.to_state().receive_status, ReceiveStatus::Idle);
        assert!(!session.agent_speaking());
    }

    #[test]
    fn test_receive_settles_without_playback_engine() {
        // 1600 samples at 16 kHz is 100 ms of agent audio
        let mut session = ConversationSession::from_agent_meta_info(&decode(json!({
            "action": "INIT_CONVERSATION",
            "conversation_id": "conv-7"
        })))
        .unwrap();
        let start = Instant::now();
        session.load_audio(Some(1), &encode_pcm16(&[0; 1600]), start).unwrap();
        session.load_audio(Some(2), &encode_pcm16(&[0; 1600]), start).unwrap();

        session.refresh_receive_status_at(start + Duration::from_millis(150));
        assert_eq!(session.to_state().receive_status, ReceiveStatus::Receiving);
        assert!(session.agent_speaking());

        session.refresh_receive_status_at(start + Duration::from_millis(201));
        assert_eq!(session.to_state().receive_status, ReceiveStatus::Idle);
        assert!(!session.agent_speaking());
    }

    #[test]
    fn test_missing_event_ids_never_go_stale() {
        let mut session = ConversationSession::from_agent_meta_info(&init_message()).unwrap();
        let bare_audio = decode(json!({"action": "LOAD_AUDIO", "audio": encode_pcm16(&[1, 2])}));

        let signal = session
            .handle(&decode(json!({"action": "interruption"})), no_reply)
            .unwrap();
        assert_eq!(signal, SessionSignal::Interrupted { event_id: None });

        for _ in 0..2 {
            assert_eq!(
                session.handle(&bare_audio, no_reply).unwrap(),
                SessionSignal::EnsurePlayback {
                    event_id: None,
                    samples: 2
                }
            );
        }
    }
}
