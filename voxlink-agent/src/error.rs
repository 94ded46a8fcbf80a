use thiserror::Error;

use crate::connection::ConnectionState;
use crate::session::SendStatus;

/// Transport-level failures of the duplex connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection is {0}; close it before opening again")]
    NotClosed(ConnectionState),

    #[error("Connection is {0}; message not sent")]
    NotOpen(ConnectionState),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Malformed or out-of-sequence conversation traffic
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Expected {expected} but received {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: String,
    },

    #[error("Invalid conversation metadata: {0}")]
    InvalidMetadata(String),

    #[error("Illegal send status transition {from} -> {to}")]
    IllegalTransition { from: SendStatus, to: SendStatus },

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Conversation is not ready to send ({0})")]
    NotReady(SendStatus),
}

/// Errors surfaced by the call orchestration
#[derive(Error, Debug)]
pub enum CallError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Voice activity monitor: {0}")]
    Monitor(#[from] voxlink_vad::VadError),
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
