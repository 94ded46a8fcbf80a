//! Conversation layer for a remote voice agent
//!
//! This crate owns the duplex websocket to the agent and the protocol on top
//! of it. Audio capture and barge-in policy live in `voxlink-audio` and
//! `voxlink-vad`; this crate only consumes their chunks and levels.
//!
//! # Layers
//!
//! - [`Connection`] - one websocket, state machine over
//!   `closed | connecting | open | closing | error`, events on a single
//!   subscriber channel
//! - [`ConversationSession`] - metadata handshake, independent send and
//!   receive status, exhaustive handling of [`MessageKind`]
//! - [`Call`] - orchestration: routes mic chunks and levels, gates sends on
//!   the handshake, reports [`CallUpdate`]s
//!
//! # Example Usage
//!
//! ```no_run
//! use voxlink_agent::{Call, CallUpdate, ConnectionOptions};
//! use voxlink_vad::MonitorConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ConnectionOptions::new().with_voice("voice-id");
//!     let mut call = Call::new(options, None, MonitorConfig::default())?;
//!
//!     call.connect("wss://agent.example/convai?signature=...")?;
//!
//!     loop {
//!         match call.next_event().await {
//!             CallUpdate::Conversation(state) if state.can_send() => {
//!                 call.send_text("Hello!")?;
//!             }
//!             CallUpdate::AgentResponse(text) => println!("agent: {}", text),
//!             CallUpdate::Status(status) => println!("connection {}", status),
//!             _ => {}
//!         }
//!     }
//! }
//! ```

pub mod call;
pub mod connection;
pub mod error;
pub mod messages;
pub mod options;
pub mod playback;
pub mod session;

// Re-exports
pub use call::{Call, CallUpdate, ChunkDisposition};
pub use connection::{Connection, ConnectionEvent, ConnectionFault, ConnectionState};
pub use error::{CallError, ConnectionError, ProtocolError, Result};
pub use messages::{AgentMessage, AudioPayload, ConversationMetadata, MessageKind};
pub use options::{AgentOverrides, ConnectionOptions, LlmOverrides};
pub use playback::PlaybackEngine;
pub use session::{
    ConversationSession, ConversationState, ReceiveStatus, SendStatus, SessionSignal,
};
