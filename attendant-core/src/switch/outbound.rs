//! Outbound event-socket listener.
//!
//! The switch dials us once per inbound call. We send `connect` to fetch
//! the channel data block, answer the call, subscribe to the channel's
//! events, and park it — from then on the channel is driven entirely by
//! commands (media stream attach, conference moves, transfers). Channel
//! events arriving on this socket are normalized and handed to the
//! ingress callback's session.

use super::esl::{read_message, write_command, EslMessage};
use super::events;
use crate::error::SwitchError;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use uuid::Uuid;

/// Everything main needs to spin up a session for a new call.
#[derive(Debug, Clone)]
pub struct IngressCall {
    pub channel_uuid: Uuid,
    pub caller_number: String,
    pub caller_name: String,
    pub dialed_number: String,
}

/// Called for each accepted call with the ingress details and a stream of
/// normalized channel events. Returns false to reject the call.
pub type IngressHandler = Arc<
    dyn Fn(IngressCall, tokio::sync::mpsc::UnboundedReceiver<events::SwitchEvent>) -> bool
        + Send
        + Sync,
>;

pub struct OutboundListener {
    handler: IngressHandler,
}

impl OutboundListener {
    pub fn new(handler: IngressHandler) -> Self {
        Self { handler }
    }

    pub async fn run(self, bind: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind).await?;
        info!("📞 outbound event socket listening on {bind}");
        loop {
            let (stream, peer) = listener.accept().await?;
            let handler = self.handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_call_socket(stream, handler).await {
                    warn!("call socket from {peer} ended: {e}");
                }
            });
        }
    }
}

/// Pull a channel variable out of the connect block, trying the
/// variable_ prefix first.
fn channel_var<'a>(data: &'a EslMessage, name: &str) -> Option<&'a str> {
    data.header(&format!("variable_{name}")).or_else(|| data.header(name))
}

async fn handle_call_socket(stream: TcpStream, handler: IngressHandler) -> Result<(), SwitchError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // Ask for the channel data block.
    write_command(&mut write_half, "connect").await?;
    let data = read_message(&mut reader).await?;

    let uuid_str = data
        .header("Unique-ID")
        .or_else(|| channel_var(&data, "uuid"))
        .ok_or_else(|| SwitchError::Protocol("connect block missing Unique-ID".into()))?;
    let channel_uuid = Uuid::parse_str(uuid_str)
        .map_err(|_| SwitchError::Protocol(format!("bad channel uuid {uuid_str}")))?;

    let ingress = IngressCall {
        channel_uuid,
        caller_number: data
            .header("Caller-Caller-ID-Number")
            .unwrap_or("anonymous")
            .to_string(),
        caller_name: data.header("Caller-Caller-ID-Name").unwrap_or("").to_string(),
        dialed_number: data
            .header("Caller-Destination-Number")
            .unwrap_or("")
            .to_string(),
    };
    info!(
        "📞 inbound call {} from {} ({}) to {}",
        channel_uuid, ingress.caller_number, ingress.caller_name, ingress.dialed_number
    );

    // Answer, subscribe to this channel's events, park.
    write_command(&mut write_half, "answer").await?;
    expect_ok(&mut reader).await?;
    write_command(&mut write_half, "myevents json").await?;
    expect_ok(&mut reader).await?;
    write_command(&mut write_half, "park").await?;
    expect_ok(&mut reader).await?;

    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
    if !handler(ingress, event_rx) {
        warn!("call {channel_uuid} rejected by ingress handler");
        write_command(&mut write_half, "hangup CALL_REJECTED").await?;
        return Ok(());
    }

    // Event pump until hangup or socket close.
    loop {
        let msg = match read_message(&mut reader).await {
            Ok(msg) => msg,
            Err(SwitchError::ChannelClosed) => break,
            Err(e) => return Err(e),
        };
        match msg.content_type() {
            "text/event-json" => {
                let Some(body) = msg.body.as_deref() else { continue };
                if let Some(event) = events::normalize(body) {
                    let is_hangup = event.kind == crate::bus::EventKind::CallEnded;
                    if event_tx.send(event).is_err() {
                        break;
                    }
                    if is_hangup {
                        break;
                    }
                }
            }
            "text/disconnect-notice" => break,
            "command/reply" => {} // replies to late commands on this socket
            other => tracing::debug!("call socket: ignoring {other}"),
        }
    }
    Ok(())
}

async fn expect_ok<R>(reader: &mut BufReader<R>) -> Result<(), SwitchError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let reply = read_message(reader).await?;
    reply.reply().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_var_prefers_variable_prefix() {
        let mut msg = EslMessage::default();
        msg.headers.insert("variable_uuid".into(), "prefixed".into());
        msg.headers.insert("uuid".into(), "bare".into());
        assert_eq!(channel_var(&msg, "uuid"), Some("prefixed"));

        let mut bare = EslMessage::default();
        bare.headers.insert("uuid".into(), "bare".into());
        assert_eq!(channel_var(&bare, "uuid"), Some("bare"));
    }
}
