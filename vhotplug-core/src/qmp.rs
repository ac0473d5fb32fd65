//! Minimal QMP (QEMU Machine Protocol) client.
//!
//! QMP is a line-delimited JSON channel over a UNIX socket. On connect the
//! server sends a greeting carrying a `QMP` key; the client must then issue
//! `qmp_capabilities` before any other command. Replies carry either a
//! `return` or an `error` object; interleaved asynchronous events carry an
//! `event` key and are skipped while waiting for a reply.
//!
//! Reference: https://www.qemu.org/docs/master/interop/qemu-qmp-ref.html

use serde_json::{json, Value};
use std::io;
use std::path::Path;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

/// Transport or framing failure on the QMP channel.
#[derive(Debug, Error)]
pub enum QmpError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed QMP message: {0}")]
    Malformed(String),
}

/// Command outcome as reported by QEMU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QmpReply {
    /// The `return` payload of a successful command.
    Return(Value),
    /// A QMP error object, e.g. class `DeviceNotFound`.
    Error { class: String, desc: String },
}

impl QmpReply {
    pub fn is_error_class(&self, class: &str) -> bool {
        matches!(self, QmpReply::Error { class: c, .. } if c == class)
    }

    pub fn desc_starts_with(&self, prefix: &str) -> bool {
        matches!(self, QmpReply::Error { desc, .. } if desc.starts_with(prefix))
    }
}

/// One message read off the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Greeting,
    Event(String),
    Reply(QmpReply),
}

/// Classify a single line from the server.
pub fn parse_server_line(line: &str) -> Result<ServerMessage, QmpError> {
    let msg: Value =
        serde_json::from_str(line).map_err(|e| QmpError::Malformed(e.to_string()))?;
    if msg.get("QMP").is_some() {
        return Ok(ServerMessage::Greeting);
    }
    if let Some(event) = msg.get("event").and_then(Value::as_str) {
        return Ok(ServerMessage::Event(event.to_string()));
    }
    if let Some(ret) = msg.get("return") {
        return Ok(ServerMessage::Reply(QmpReply::Return(ret.clone())));
    }
    if let Some(error) = msg.get("error") {
        let class = error.get("class").and_then(Value::as_str).unwrap_or("GenericError");
        let desc = error.get("desc").and_then(Value::as_str).unwrap_or_default();
        return Ok(ServerMessage::Reply(QmpReply::Error {
            class: class.to_string(),
            desc: desc.to_string(),
        }));
    }
    Err(QmpError::Malformed(format!("unrecognized message: {}", line)))
}

/// A negotiated QMP connection.
pub struct QmpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl QmpClient {
    /// Connect, consume the greeting and negotiate capabilities.
    pub async fn connect(path: &Path) -> Result<Self, QmpError> {
        let stream = UnixStream::connect(path).await?;
        let (read, write) = stream.into_split();
        let mut client = Self { reader: BufReader::new(read), writer: write };

        match client.read_message().await? {
            ServerMessage::Greeting => {}
            other => {
                return Err(QmpError::Malformed(format!("expected greeting, got {:?}", other)))
            }
        }

        match client.execute("qmp_capabilities", None).await? {
            QmpReply::Return(_) => Ok(client),
            QmpReply::Error { class, desc } => Err(QmpError::Malformed(format!(
                "capabilities negotiation failed: {} ({})",
                desc, class
            ))),
        }
    }

    /// Execute one command and wait for its reply, skipping events.
    pub async fn execute(
        &mut self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<QmpReply, QmpError> {
        let mut msg = json!({"execute": command});
        if let Some(arguments) = arguments {
            msg["arguments"] = arguments;
        }
        let mut line = msg.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        loop {
            match self.read_message().await? {
                ServerMessage::Reply(reply) => return Ok(reply),
                ServerMessage::Event(event) => {
                    tracing::trace!(event = %event, "skipping QMP event");
                }
                ServerMessage::Greeting => {
                    return Err(QmpError::Malformed("unexpected greeting".to_string()))
                }
            }
        }
    }

    async fn read_message(&mut self) -> Result<ServerMessage, QmpError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(QmpError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "QMP peer closed the connection",
            )));
        }
        parse_server_line(line.trim_end())
    }
}
