//! The control task: one call, one microphone, one command stream

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use voxlink_agent::{
    Call, CallUpdate, ChunkDisposition, ConnectionState, PlaybackEngine, SendStatus,
};

use crate::config::{DaemonConfig, SIGNED_URL_ENV};
use crate::ipc::{IpcCommand, IpcRequest};
use crate::pipeline::{MicEvent, MicPipeline};

/// Whether the daemon loop keeps going after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Daemon {
    config: DaemonConfig,
    call: Call,
    mic: MicPipeline,
    mic_rx: mpsc::UnboundedReceiver<MicEvent>,
}

impl Daemon {
    pub fn new(config: DaemonConfig, playback: Option<Arc<dyn PlaybackEngine>>) -> Result<Self> {
        let call = Call::new(config.connection_options(), playback, config.monitor_config())?;
        let (mic, mic_rx) = MicPipeline::new(&config);

        Ok(Self {
            config,
            call,
            mic,
            mic_rx,
        })
    }

    /// Serve commands until `quit`, Ctrl-C, or the command stream ends
    pub async fn run(mut self, mut requests: mpsc::UnboundedReceiver<IpcRequest>) -> Result<()> {
        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    let (reply, flow) = self.handle_command(request.command).await;
                    let _ = request.reply.send(reply);
                    if flow == Flow::Quit {
                        info!("Received quit command");
                        break;
                    }
                }
                update = self.call.next_event() => self.on_update(update),
                Some(event) = self.mic_rx.recv() => self.on_mic_event(event),
                _ = tokio::signal::ctrl_c() => {
                    info!("🛑 Received shutdown signal");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    pub async fn handle_command(&mut self, command: IpcCommand) -> (String, Flow) {
        let reply = match command {
            IpcCommand::Connect(url) => self.connect(url),
            IpcCommand::Disconnect => {
                self.close_mic();
                self.call.disconnect();
                "Disconnecting".to_string()
            }
            IpcCommand::Mic => self.toggle_mic(),
            IpcCommand::Say(text) => self.say(&text).await,
            IpcCommand::Interrupt => {
                self.call.refresh_receive_status();
                if self.call.interrupt() {
                    "Interrupt requested".to_string()
                } else {
                    "Nothing to interrupt".to_string()
                }
            }
            IpcCommand::Status => {
                self.call.refresh_receive_status();
                self.status()
            }
            IpcCommand::BargeIn(enabled) => {
                self.call.set_interruption_enabled(enabled);
                format!("Barge-in {}", on_off(enabled))
            }
            IpcCommand::Record(enabled) => {
                self.mic.set_recording(enabled);
                if self.mic.is_open() {
                    format!("Recording {} (applies next time the mic opens)", on_off(enabled))
                } else {
                    format!("Recording {}", on_off(enabled))
                }
            }
            IpcCommand::Playback => match self.mic.playback() {
                Ok(seconds) => format!("Playing back {:.1}s", seconds),
                Err(e) => format!("Error: {:#}", e),
            },
            IpcCommand::StopPlayback => {
                self.mic.stop_playback();
                "Playback stopped".to_string()
            }
            IpcCommand::Quit => return ("Shutting down".to_string(), Flow::Quit),
        };

        (reply, Flow::Continue)
    }

    fn connect(&mut self, url: Option<String>) -> String {
        let Some(url) = url.or_else(|| self.config.signed_url.clone()) else {
            return format!(
                "Error: no signed URL configured (set signed_url or {})",
                SIGNED_URL_ENV
            );
        };

        self.close_mic();
        self.call.set_options(self.config.connection_options());
        match self.call.connect(&url) {
            Ok(()) => "Connecting".to_string(),
            Err(e) => format!("Error: {}", e),
        }
    }

    fn toggle_mic(&mut self) -> String {
        if self.mic.is_open() {
            self.close_mic();
            return "Microphone closed".to_string();
        }

        if self.call.connection_state() != ConnectionState::Open {
            return "Error: not connected".to_string();
        }

        match self.mic.open() {
            Ok(()) => {
                self.call.on_mic_toggled(true);
                "Microphone open".to_string()
            }
            Err(e) => format!("Error: {:#}", e),
        }
    }

    async fn say(&mut self, text: &str) -> String {
        if self.call.conversation_state().send_status == SendStatus::PendingMeta {
            if let Err(e) = self.call.nudge().await {
                warn!("Activity ping failed: {}", e);
            }
        }

        match self.call.send_text(text) {
            Ok(true) => "Sent".to_string(),
            Ok(false) => "Not sent: not connected".to_string(),
            Err(e) => format!("Error: {}", e),
        }
    }

    fn close_mic(&mut self) {
        if self.mic.is_open() {
            self.mic.close();
            self.call.on_mic_toggled(false);
        }
    }

    pub fn on_update(&mut self, update: CallUpdate) {
        match update {
            CallUpdate::Status(status) => {
                info!("Agent connection {}", status);
                if matches!(status, ConnectionState::Closed | ConnectionState::Error) {
                    self.close_mic();
                }
            }
            CallUpdate::Conversation(state) => {
                info!(
                    "Conversation send={} receive={}",
                    state.send_status, state.receive_status
                );
            }
            CallUpdate::AgentResponse(text) => info!("🤖 {}", text),
            CallUpdate::UserTranscript(text) => info!("🎙️ {}", text),
            CallUpdate::Interrupted { event_id } => {
                debug!("Agent confirmed interruption of event {:?}", event_id);
            }
            CallUpdate::Error(e) => warn!("Agent error: {}", e),
        }
    }

    pub fn on_mic_event(&mut self, event: MicEvent) {
        // Stragglers queued before the last close
        if !self.mic.is_open() {
            return;
        }

        match event {
            MicEvent::Level(level) => {
                self.call.on_level(level);
            }
            MicEvent::Chunk(chunk) => {
                if self.call.on_audio_chunk(&chunk) == ChunkDisposition::CloseMic {
                    warn!("Call cannot take audio; closing microphone");
                    self.close_mic();
                }
            }
        }
    }

    pub fn status(&self) -> String {
        let conversation = self.call.conversation_state();
        let mut lines = vec![
            format!("connection: {}", self.call.connection_state()),
            format!("send: {}", conversation.send_status),
            format!("receive: {}", conversation.receive_status),
            format!("mic: {}", if self.mic.is_open() { "open" } else { "closed" }),
            format!("barge-in: {}", on_off(self.call.interruption_enabled())),
            format!(
                "recording: {} ({})",
                on_off(self.mic.recording()),
                self.mic.recorder_state()
            ),
        ];
        if let Some(id) = self.call.conversation_id() {
            lines.push(format!("conversation: {}", id));
        }
        if let Some(error) = self.call.agent_error() {
            lines.push(format!("last error: {}", error));
        }
        lines.join("\n")
    }

    fn shutdown(&mut self) {
        info!("🧹 Shutting down...");
        self.close_mic();
        self.mic.stop_playback();
        self.call.cleanup();
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}
