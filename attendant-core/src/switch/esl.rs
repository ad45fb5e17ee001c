//! Event-socket wire protocol.
//!
//! Messages are a block of `Key: value` header lines terminated by a
//! blank line; a `Content-Length` header announces a body of exactly that
//! many bytes. Command replies carry `Reply-Text: +OK …` or
//! `Reply-Text: -ERR <code>`; anything else is a protocol error — the
//! core never guesses at unrecognized success strings.

use crate::error::SwitchError;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// Reply deadline for a single command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// One protocol message (either direction).
#[derive(Debug, Clone, Default)]
pub struct EslMessage {
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl EslMessage {
    pub fn content_type(&self) -> &str {
        self.headers.get("Content-Type").map(String::as_str).unwrap_or("")
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// `Reply-Text` parsed into success/failure. `+OK` text is returned
    /// verbatim; `-ERR` becomes `SwitchError::CommandFailed`.
    pub fn reply(&self) -> Result<String, SwitchError> {
        let text = self
            .header("Reply-Text")
            .ok_or_else(|| SwitchError::Protocol("reply without Reply-Text".into()))?;
        if let Some(ok) = text.strip_prefix("+OK") {
            Ok(ok.trim().to_string())
        } else if let Some(err) = text.strip_prefix("-ERR") {
            Err(SwitchError::CommandFailed(err.trim().to_string()))
        } else {
            Err(SwitchError::Protocol(format!("unrecognized reply: {text}")))
        }
    }
}

/// Read one message from the stream. Returns `ChannelClosed` on EOF at a
/// message boundary.
pub async fn read_message<R>(reader: &mut BufReader<R>) -> Result<EslMessage, SwitchError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut headers = HashMap::new();
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(SwitchError::ChannelClosed);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if headers.is_empty() {
                // Tolerate stray blank lines between messages.
                continue;
            }
            break;
        }
        match trimmed.split_once(':') {
            Some((key, value)) => {
                headers.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => {
                return Err(SwitchError::Protocol(format!("malformed header line: {trimmed}")));
            }
        }
    }

    let body = match headers.get("Content-Length") {
        Some(len) => {
            let len: usize = len
                .parse()
                .map_err(|_| SwitchError::Protocol("bad Content-Length".into()))?;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            Some(String::from_utf8_lossy(&buf).into_owned())
        }
        None => None,
    };

    Ok(EslMessage { headers, body })
}

/// Write a command: the verb line plus terminating blank line.
pub async fn write_command<W>(writer: &mut W, command: &str) -> Result<(), SwitchError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.write_all(command.as_bytes()).await?;
    writer.write_all(b"\n\n").await?;
    writer.flush().await?;
    Ok(())
}

/// The shared inbound control connection.
///
/// Commands are FIFO: each `command()` call enqueues a oneshot and the
/// reader task resolves them in order as `command/reply` / `api/response`
/// messages arrive. Events received on this connection are forwarded to
/// the event sink.
pub struct InboundClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: std::sync::Arc<std::sync::Mutex<VecDeque<oneshot::Sender<EslMessage>>>>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl InboundClient {
    /// Connect, authenticate, and subscribe to the event stream.
    pub async fn connect(
        addr: &str,
        password: &str,
        event_sink: mpsc::UnboundedSender<EslMessage>,
    ) -> Result<Self, SwitchError> {
        let stream = tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(addr))
            .await
            .map_err(|_| SwitchError::Timeout(Duration::from_secs(5)))??;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // The switch opens with an auth challenge.
        let challenge = read_message(&mut reader).await?;
        if challenge.content_type() != "auth/request" {
            return Err(SwitchError::Protocol(format!(
                "expected auth/request, got {}",
                challenge.content_type()
            )));
        }

        let mut writer = write_half;
        write_command(&mut writer, &format!("auth {password}")).await?;
        let reply = read_message(&mut reader).await?;
        reply.reply().map_err(|_| SwitchError::AuthRejected)?;

        write_command(&mut writer, "event json ALL").await?;
        let reply = read_message(&mut reader).await?;
        reply.reply()?;
        info!("switch control connected to {addr}");

        let pending: std::sync::Arc<std::sync::Mutex<VecDeque<oneshot::Sender<EslMessage>>>> =
            Default::default();

        let reader_pending = pending.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(msg) => match msg.content_type() {
                        "command/reply" | "api/response" => {
                            let waiter = reader_pending.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(msg);
                                }
                                None => warn!("switch reply with no pending command"),
                            }
                        }
                        "text/event-json" => {
                            if event_sink.send(msg).is_err() {
                                break;
                            }
                        }
                        "text/disconnect-notice" => {
                            warn!("switch sent disconnect notice");
                            break;
                        }
                        other => debug!("ignoring switch message type {other}"),
                    },
                    Err(SwitchError::ChannelClosed) => {
                        error!("switch control channel closed");
                        break;
                    }
                    Err(e) => {
                        error!("switch control read error: {e}");
                        break;
                    }
                }
            }
            // Fail every queued command so callers don't hang.
            let mut queue = reader_pending.lock().unwrap_or_else(|e| e.into_inner());
            queue.clear();
        });

        Ok(Self { writer: Mutex::new(writer), pending, reader_task })
    }

    /// Issue one command and await its reply (FIFO, 5 s deadline).
    pub async fn command(&self, command: &str) -> Result<EslMessage, SwitchError> {
        let (tx, rx) = oneshot::channel();
        {
            // Hold the writer lock across enqueue + write so the pending
            // queue order always matches the wire order.
            let mut writer = self.writer.lock().await;
            self.pending.lock().unwrap_or_else(|e| e.into_inner()).push_back(tx);
            write_command(&mut *writer, command).await?;
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(SwitchError::ChannelClosed),
            Err(_) => Err(SwitchError::Timeout(COMMAND_TIMEOUT)),
        }
    }

    /// Issue a command and require a `+OK` reply.
    pub async fn command_ok(&self, command: &str) -> Result<String, SwitchError> {
        let msg = self.command(command).await?;
        // api/response carries the result in the body instead.
        if msg.content_type() == "api/response" {
            let body = msg.body.unwrap_or_default();
            let body = body.trim();
            if let Some(ok) = body.strip_prefix("+OK") {
                return Ok(ok.trim().to_string());
            }
            if let Some(err) = body.strip_prefix("-ERR") {
                return Err(SwitchError::CommandFailed(err.trim().to_string()));
            }
            return Err(SwitchError::Protocol(format!("unrecognized api response: {body}")));
        }
        msg.reply()
    }
}

impl Drop for InboundClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
