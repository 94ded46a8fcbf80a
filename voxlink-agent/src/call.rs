//! Call orchestration
//!
//! `Call` is the single-threaded control side of a conversation. It owns the
//! one live [`Connection`] and at most one [`ConversationSession`], turns
//! connection events into [`CallUpdate`]s, and routes microphone chunks and
//! loudness levels. Every method takes `&mut self`, so handling and sending
//! are serialized by construction.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use uuid::Uuid;
use voxlink_audio::AudioChunk;
use voxlink_vad::{MonitorConfig, VoiceActivityMonitor};

use crate::connection::{Connection, ConnectionEvent, ConnectionFault, ConnectionState};
use crate::error::{CallError, ProtocolError};
use crate::messages::{AgentMessage, MessageKind};
use crate::options::ConnectionOptions;
use crate::playback::PlaybackEngine;
use crate::session::{ConversationSession, ConversationState, SendStatus, SessionSignal};

/// Pause after an activity ping so the remote can register it
const NUDGE_DELAY: Duration = Duration::from_millis(10);

/// Something the orchestration layer should surface
#[derive(Debug, Clone, PartialEq)]
pub enum CallUpdate {
    Status(ConnectionState),
    Conversation(ConversationState),
    AgentResponse(String),
    UserTranscript(String),
    /// The remote confirmed it stopped speaking
    Interrupted { event_id: Option<u64> },
    Error(String),
}

/// What happened to one microphone chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDisposition {
    Sent,
    /// Not sendable yet; the mic may stay open
    Dropped,
    /// The call cannot take audio; close the microphone
    CloseMic,
}

pub struct Call {
    connection: Connection,
    events: Option<UnboundedReceiver<ConnectionEvent>>,
    session: Option<ConversationSession>,
    state: ConversationState,
    options: ConnectionOptions,
    playback: Option<Arc<dyn PlaybackEngine>>,
    monitor: VoiceActivityMonitor,
    agent_error: Option<String>,
    pending: VecDeque<CallUpdate>,
    nudge_delay: Duration,
}

impl Call {
    pub fn new(
        options: ConnectionOptions,
        playback: Option<Arc<dyn PlaybackEngine>>,
        monitor: MonitorConfig,
    ) -> Result<Self, CallError> {
        Ok(Self {
            connection: Connection::new(),
            events: None,
            session: None,
            state: ConversationState::waiting_on_meta_state(),
            options,
            playback,
            monitor: VoiceActivityMonitor::new(monitor)?,
            agent_error: None,
            pending: VecDeque::new(),
            nudge_delay: NUDGE_DELAY,
        })
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Options for the next `connect`; the live connection keeps its own
    pub fn set_options(&mut self, options: ConnectionOptions) {
        self.options = options;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn conversation_state(&self) -> ConversationState {
        self.state
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.conversation_id())
    }

    /// Last transport failure, cleared by the next `connect`
    pub fn agent_error(&self) -> Option<&str> {
        self.agent_error.as_deref()
    }

    /// Tear down any previous connection and dial `url`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn connect(&mut self, url: &str) -> Result<(), CallError> {
        self.connection.cleanup();
        self.drop_session();
        self.pending.clear();
        self.agent_error = None;
        self.monitor.reset();

        self.events = Some(self.connection.subscribe());
        self.connection.open(url, &self.options)?;
        Ok(())
    }

    /// Begin a graceful close. Status updates follow through `next_event`.
    pub fn disconnect(&mut self) {
        info!("Disconnecting from agent");
        self.connection.close();
        self.drop_session();
    }

    /// Immediate teardown; no further connection events are reported
    pub fn cleanup(&mut self) {
        self.connection.cleanup();
        self.events = None;
        self.pending.clear();
        self.drop_session();
    }

    /// Wait for the next update.
    ///
    /// Cancel-safe, so it can sit in a `select!` next to other sources.
    /// Never resolves while there is no connection to listen to.
    pub async fn next_event(&mut self) -> CallUpdate {
        loop {
            if let Some(update) = self.pending.pop_front() {
                return update;
            }

            let event = match self.events.as_mut() {
                Some(events) => events.recv().await,
                None => None,
            };

            match event {
                Some(event) => self.apply(event),
                None => {
                    self.events = None;
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    fn apply(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Status(status) => {
                self.pending.push_back(CallUpdate::Status(status));
                if status == ConnectionState::Closed {
                    self.drop_session();
                }
            }
            ConnectionEvent::Message(message) => self.on_message(message),
            ConnectionEvent::Error(fault) => {
                if let ConnectionFault::Transport(reason) = &fault {
                    self.agent_error = Some(reason.clone());
                }
                self.pending.push_back(CallUpdate::Error(fault.to_string()));
            }
        }
    }

    fn on_message(&mut self, message: AgentMessage) {
        let Some(session) = self.session.as_mut() else {
            self.on_pre_session_message(&message);
            return;
        };

        let connection = &self.connection;
        let outcome = session.handle(&message, |reply| {
            if let Err(e) = connection.send(&reply) {
                warn!("Failed to send {}: {}", reply.action(), e);
            }
        });

        match outcome {
            Ok(SessionSignal::AgentResponse(text)) => {
                self.pending.push_back(CallUpdate::AgentResponse(text));
            }
            Ok(SessionSignal::UserTranscript(text)) => {
                self.pending.push_back(CallUpdate::UserTranscript(text));
            }
            Ok(SessionSignal::Interrupted { event_id }) => {
                self.pending.push_back(CallUpdate::Interrupted { event_id });
            }
            Ok(SessionSignal::EnsurePlayback { event_id, samples }) => {
                debug!("Queued {} samples of agent audio (event {:?})", samples, event_id);
            }
            Ok(SessionSignal::DroppedStaleAudio { event_id }) => {
                debug!("Dropped audio from interrupted event {}", event_id);
            }
            Ok(SessionSignal::Acknowledged { .. }) | Ok(SessionSignal::Ignored) => {}
            Err(e) => self.pending.push_back(CallUpdate::Error(e.to_string())),
        }

        self.sync_state();
    }

    fn on_pre_session_message(&mut self, message: &AgentMessage) {
        if self.state.send_status == SendStatus::Error {
            debug!("Ignoring {} after a protocol fault", message.action());
            return;
        }

        let result = match message.kind {
            MessageKind::InitConversation(_) => ConversationSession::from_agent_meta_info(message),
            _ => Err(ProtocolError::UnexpectedMessage {
                expected: "INIT_CONVERSATION",
                actual: message.action().to_string(),
            }),
        };

        match result {
            Ok(session) => {
                let session = match &self.playback {
                    Some(playback) => session.with_playback(Arc::clone(playback)),
                    None => session,
                };
                self.session = Some(session);
            }
            Err(e) => {
                self.state = ConversationState::error_state(&e);
                self.pending.push_back(CallUpdate::Conversation(self.state));
                self.pending.push_back(CallUpdate::Error(e.to_string()));
                return;
            }
        }

        self.sync_state();
    }

    /// Publish the session state if it moved
    fn sync_state(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let next = session.to_state();
        if next != self.state {
            self.state = next;
            self.pending.push_back(CallUpdate::Conversation(next));
        }
    }

    fn drop_session(&mut self) {
        if let Some(playback) = &self.playback {
            playback.stop();
        }
        self.session = None;

        let waiting = ConversationState::waiting_on_meta_state();
        if self.state != waiting {
            self.state = waiting;
            self.pending.push_back(CallUpdate::Conversation(waiting));
        }
    }

    /// Send a typed message.
    ///
    /// Empty text and a closed connection are absorbed as `Ok(false)`. Before
    /// the handshake, or after a protocol fault, the send is refused.
    pub fn send_text(&mut self, text: &str) -> Result<bool, CallError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(false);
        }

        let status = self.connection.state();
        if status != ConnectionState::Open {
            warn!("Not connected ({}); text not sent", status);
            return Ok(false);
        }

        if !self.state.can_send() {
            return Err(ProtocolError::NotReady(self.state.send_status).into());
        }

        let client_event_id = Uuid::new_v4().to_string();
        self.connection
            .send(&AgentMessage::user_text_message(text, client_event_id))?;
        Ok(true)
    }

    /// Poke the remote while waiting for the handshake.
    ///
    /// Returns `false` when there is nothing to wait for.
    pub async fn nudge(&mut self) -> Result<bool, CallError> {
        if self.state.send_status != SendStatus::PendingMeta
            || self.connection.state() != ConnectionState::Open
        {
            return Ok(false);
        }

        self.connection.send(&AgentMessage::user_activity())?;
        tokio::time::sleep(self.nudge_delay).await;
        Ok(true)
    }

    /// Route one microphone chunk to the remote
    pub fn on_audio_chunk(&mut self, chunk: &AudioChunk) -> ChunkDisposition {
        if matches!(
            self.state.send_status,
            SendStatus::PendingMeta | SendStatus::Error
        ) {
            return ChunkDisposition::Dropped;
        }

        if self.agent_error.is_some() || self.connection.state() != ConnectionState::Open {
            return ChunkDisposition::CloseMic;
        }

        if let Some(session) = self.session.as_mut() {
            if self.state.send_status == SendStatus::Ready {
                if let Err(e) = session.update_send_status(SendStatus::Sending) {
                    warn!("{}", e);
                }
            }
        }
        self.sync_state();

        match self.connection.send(&AgentMessage::user_audio_chunk(&chunk.samples)) {
            Ok(()) => ChunkDisposition::Sent,
            Err(e) => {
                warn!("Failed to send audio: {}", e);
                ChunkDisposition::CloseMic
            }
        }
    }

    /// The microphone was opened or closed by the user
    pub fn on_mic_toggled(&mut self, open: bool) {
        if open {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            if self.state.send_status == SendStatus::Sending {
                if let Err(e) = session.update_send_status(SendStatus::Ready) {
                    warn!("{}", e);
                }
            }
        }
        self.sync_state();
    }

    /// Feed one loudness level. Returns true if it triggered an interruption.
    pub fn on_level(&mut self, level: f32) -> bool {
        self.refresh_receive_status();

        let speaking = self.agent_speaking();
        let verdict = self.monitor.observe(level, speaking);
        if !verdict.should_interrupt() {
            return false;
        }

        info!("User barged in at level {:.3}", level);
        self.interrupt()
    }

    /// Settle the receive axis against live playback before reading it
    pub fn refresh_receive_status(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.refresh_receive_status();
        }
        self.sync_state();
    }

    /// Ask the remote to stop speaking. No-op when nothing is playing.
    pub fn interrupt(&mut self) -> bool {
        if self.connection.state() != ConnectionState::Open || !self.agent_speaking() {
            return false;
        }

        let connection = &self.connection;
        match self.session.as_mut() {
            Some(session) => {
                session.interrupt(|message| {
                    if let Err(e) = connection.send(&message) {
                        warn!("Failed to send {}: {}", message.action(), e);
                    }
                });
                true
            }
            None => false,
        }
    }

    /// Agent audio is arriving or still audible, read from live engine state
    pub fn agent_speaking(&self) -> bool {
        match &self.session {
            Some(session) => session.agent_speaking(),
            None => self
                .playback
                .as_ref()
                .map(|p| p.is_playing())
                .unwrap_or(false),
        }
    }

    pub fn set_interruption_enabled(&mut self, enabled: bool) {
        self.monitor.set_enabled(enabled);
    }

    pub fn interruption_enabled(&self) -> bool {
        self.monitor.is_enabled()
    }

    /// Interruptions requested so far
    pub fn interruptions(&self) -> u64 {
        self.monitor.interrupts()
    }
}
