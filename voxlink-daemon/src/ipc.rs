//! Unix socket control surface
//!
//! One text command per connection, one text reply. The server only parses;
//! commands are forwarded to the daemon loop together with a reply channel so
//! every call operation runs on the single control task.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::socket_utils::secure_socket_permissions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcCommand {
    /// Dial the agent, optionally with a URL other than the configured one
    Connect(Option<String>),
    Disconnect,
    /// Open or close the microphone
    Mic,
    Say(String),
    Interrupt,
    Status,
    BargeIn(bool),
    Record(bool),
    Playback,
    StopPlayback,
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("{command} expects {expected}")]
    BadArgument {
        command: &'static str,
        expected: &'static str,
    },
}

fn on_off(command: &'static str, arg: &str) -> std::result::Result<bool, CommandError> {
    match arg.to_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(CommandError::BadArgument {
            command,
            expected: "on|off",
        }),
    }
}

impl IpcCommand {
    pub fn parse(s: &str) -> std::result::Result<Self, CommandError> {
        let s = s.trim();
        let (verb, arg) = match s.split_once(char::is_whitespace) {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (s, ""),
        };

        match verb.to_lowercase().as_str() {
            "" => Err(CommandError::Empty),
            "connect" => Ok(Self::Connect((!arg.is_empty()).then(|| arg.to_string()))),
            "disconnect" => Ok(Self::Disconnect),
            "mic" | "toggle" => Ok(Self::Mic),
            "say" => {
                if arg.is_empty() {
                    Err(CommandError::BadArgument {
                        command: "say",
                        expected: "text",
                    })
                } else {
                    Ok(Self::Say(arg.to_string()))
                }
            }
            "interrupt" => Ok(Self::Interrupt),
            "status" => Ok(Self::Status),
            "barge-in" => on_off("barge-in", arg).map(Self::BargeIn),
            "record" => on_off("record", arg).map(Self::Record),
            "playback" => Ok(Self::Playback),
            "stop-playback" => Ok(Self::StopPlayback),
            "quit" | "exit" | "shutdown" => Ok(Self::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// A parsed command waiting for the daemon's answer
#[derive(Debug)]
pub struct IpcRequest {
    pub command: IpcCommand,
    pub reply: oneshot::Sender<String>,
}

/// Unix socket IPC server
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind the control socket, replacing a stale one
    pub fn new(socket_path: impl AsRef<Path>) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&socket_path);

        let listener = UnixListener::bind(&socket_path).context("Failed to bind Unix socket")?;
        secure_socket_permissions(&socket_path)?;

        info!("IPC server listening on {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path,
        })
    }

    /// Accept connections until the daemon stops listening
    pub async fn run(self, requests: mpsc::UnboundedSender<IpcRequest>) -> Result<()> {
        loop {
            let (stream, _) = self
                .listener
                .accept()
                .await
                .context("Failed to accept connection")?;

            let requests = requests.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, requests).await {
                    error!("IPC connection error: {}", e);
                }
            });
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Handle a single IPC connection
pub async fn handle_connection(
    mut stream: UnixStream,
    requests: mpsc::UnboundedSender<IpcRequest>,
) -> Result<()> {
    let mut buffer = [0u8; 4096];
    let n = stream.read(&mut buffer).await?;

    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..n]);
    debug!("Received IPC command: {}", request.trim());

    let response = match IpcCommand::parse(&request) {
        Ok(command) => {
            let (reply_tx, reply_rx) = oneshot::channel();
            if requests
                .send(IpcRequest {
                    command,
                    reply: reply_tx,
                })
                .is_err()
            {
                "Error: daemon is shutting down".to_string()
            } else {
                reply_rx
                    .await
                    .unwrap_or_else(|_| "Error: no reply".to_string())
            }
        }
        Err(e) => format!("Error: {}", e),
    };

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(IpcCommand::parse("status\n"), Ok(IpcCommand::Status));
        assert_eq!(IpcCommand::parse("  MIC "), Ok(IpcCommand::Mic));
        assert_eq!(IpcCommand::parse("stop-playback"), Ok(IpcCommand::StopPlayback));
        assert_eq!(IpcCommand::parse("exit"), Ok(IpcCommand::Quit));
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(IpcCommand::parse("connect"), Ok(IpcCommand::Connect(None)));
        assert_eq!(
            IpcCommand::parse("connect wss://agent.example/x?sig=1"),
            Ok(IpcCommand::Connect(Some("wss://agent.example/x?sig=1".into())))
        );
        assert_eq!(
            IpcCommand::parse("say  hello   there "),
            Ok(IpcCommand::Say("hello   there".into()))
        );
        assert_eq!(IpcCommand::parse("barge-in off"), Ok(IpcCommand::BargeIn(false)));
        assert_eq!(IpcCommand::parse("record ON"), Ok(IpcCommand::Record(true)));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(IpcCommand::parse("   "), Err(CommandError::Empty));
        assert_eq!(
            IpcCommand::parse("dance"),
            Err(CommandError::Unknown("dance".into()))
        );
        assert!(matches!(
            IpcCommand::parse("say"),
            Err(CommandError::BadArgument { command: "say", .. })
        ));
        assert!(matches!(
            IpcCommand::parse("barge-in maybe"),
            Err(CommandError::BadArgument { command: "barge-in", .. })
        ));
    }
}
