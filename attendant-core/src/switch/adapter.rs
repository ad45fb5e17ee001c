//! Data-plane-neutral switch commands.
//!
//! `SwitchControl` is the seam between the runtime and the switch: every
//! command is request/response with a timeout and a value-or-error
//! outcome. Sessions and the transfer orchestrator hold a borrowed
//! `Arc<dyn SwitchControl>` — they never own the connection. Tests swap
//! in a scripted mock.

use crate::error::SwitchError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::esl::InboundClient;

/// Commands the runtime may execute on the switch. No business logic —
/// the orchestrator decides *what* to do, the adapter only knows *how*.
#[async_trait]
pub trait SwitchControl: Send + Sync {
    /// Originate a new leg directly into a conference. Resolves once the
    /// leg answers; the returned string is the new leg's UUID.
    async fn originate_to_conference(
        &self,
        address: &str,
        conference: &str,
        timeout_secs: u64,
        caller_id_name: &str,
    ) -> Result<String, SwitchError>;

    /// Move an existing channel into a conference.
    /// `muted` joins the leg with its audio muted; `moderator` gives it
    /// conference-owner semantics (the room dies when it leaves).
    async fn conference_enter(
        &self,
        uuid: &str,
        conference: &str,
        muted: bool,
        moderator: bool,
    ) -> Result<(), SwitchError>;

    async fn conference_kick(&self, conference: &str, member: &str) -> Result<(), SwitchError>;
    async fn conference_mute(&self, conference: &str, member: &str) -> Result<(), SwitchError>;
    async fn conference_unmute(&self, conference: &str, member: &str) -> Result<(), SwitchError>;

    /// Member UUIDs currently in a conference (empty = room gone).
    async fn conference_list(&self, conference: &str) -> Result<Vec<String>, SwitchError>;

    async fn bridge(&self, leg_a: &str, leg_b: &str) -> Result<(), SwitchError>;
    async fn unbridge(&self, uuid: &str) -> Result<(), SwitchError>;

    /// Blind-transfer a channel to a dialplan destination.
    async fn transfer(&self, uuid: &str, destination: &str) -> Result<(), SwitchError>;

    async fn hold(&self, uuid: &str) -> Result<(), SwitchError>;
    async fn unhold(&self, uuid: &str) -> Result<(), SwitchError>;

    /// Attach / detach the per-call media stream to a WebSocket URL.
    async fn start_media_stream(&self, uuid: &str, url: &str) -> Result<(), SwitchError>;
    async fn stop_media_stream(&self, uuid: &str) -> Result<(), SwitchError>;

    /// Is the destination address registered/reachable right now?
    async fn registration_query(&self, address: &str) -> Result<bool, SwitchError>;

    /// Run a dialplan application on a live channel.
    async fn execute_on_uuid(&self, uuid: &str, app: &str, arg: &str) -> Result<(), SwitchError>;

    async fn hangup(&self, uuid: &str, cause: &str) -> Result<(), SwitchError>;
}

/// `SwitchControl` over the shared inbound event-socket connection.
pub struct EslAdapter {
    client: InboundClient,
}

impl EslAdapter {
    pub fn new(client: InboundClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SwitchControl for EslAdapter {
    async fn originate_to_conference(
        &self,
        address: &str,
        conference: &str,
        timeout_secs: u64,
        caller_id_name: &str,
    ) -> Result<String, SwitchError> {
        // Originate blocks until answer (or failure), so give the command
        // channel the dial timeout plus slack rather than the default 5 s.
        let cmd = format!(
            "api originate {{origination_caller_id_name='{caller_id_name}',originate_timeout={timeout_secs}}}user/{address} conference:{conference} inline"
        );
        debug!("originate → {address} into {conference}");
        let reply = tokio::time::timeout(
            Duration::from_secs(timeout_secs + 5),
            self.client.command_ok(&cmd),
        )
        .await
        .map_err(|_| SwitchError::Timeout(Duration::from_secs(timeout_secs + 5)))??;
        // "+OK <uuid>"
        let uuid = reply.split_whitespace().next().unwrap_or_default().to_string();
        if uuid.is_empty() {
            return Err(SwitchError::Protocol("originate reply missing uuid".into()));
        }
        Ok(uuid)
    }

    async fn conference_enter(
        &self,
        uuid: &str,
        conference: &str,
        muted: bool,
        moderator: bool,
    ) -> Result<(), SwitchError> {
        let mut flags: Vec<&str> = Vec::new();
        if muted {
            flags.push("mute");
        }
        if moderator {
            flags.push("moderator");
        }
        let arg = if flags.is_empty() {
            conference.to_string()
        } else {
            format!("{conference}+flags{{{}}}", flags.join("|"))
        };
        self.execute_on_uuid(uuid, "conference", &arg).await
    }

    async fn conference_kick(&self, conference: &str, member: &str) -> Result<(), SwitchError> {
        self.client
            .command_ok(&format!("api conference {conference} kick {member}"))
            .await
            .map(|_| ())
    }

    async fn conference_mute(&self, conference: &str, member: &str) -> Result<(), SwitchError> {
        self.client
            .command_ok(&format!("api conference {conference} mute {member}"))
            .await
            .map(|_| ())
    }

    async fn conference_unmute(&self, conference: &str, member: &str) -> Result<(), SwitchError> {
        self.client
            .command_ok(&format!("api conference {conference} unmute {member}"))
            .await
            .map(|_| ())
    }

    async fn conference_list(&self, conference: &str) -> Result<Vec<String>, SwitchError> {
        let reply = self.client.command(&format!("api conference {conference} list")).await?;
        let body = reply.body.unwrap_or_default();
        if body.contains("not found") {
            return Ok(Vec::new());
        }
        // One member per line: <id>;<uuid>;<flags>;…
        Ok(body
            .lines()
            .filter_map(|line| line.split(';').nth(1))
            .map(str::to_string)
            .collect())
    }

    async fn bridge(&self, leg_a: &str, leg_b: &str) -> Result<(), SwitchError> {
        self.client
            .command_ok(&format!("api uuid_bridge {leg_a} {leg_b}"))
            .await
            .map(|_| ())
    }

    async fn unbridge(&self, uuid: &str) -> Result<(), SwitchError> {
        self.client.command_ok(&format!("api uuid_park {uuid}")).await.map(|_| ())
    }

    async fn transfer(&self, uuid: &str, destination: &str) -> Result<(), SwitchError> {
        self.client
            .command_ok(&format!("api uuid_transfer {uuid} {destination}"))
            .await
            .map(|_| ())
    }

    async fn hold(&self, uuid: &str) -> Result<(), SwitchError> {
        self.client.command_ok(&format!("api uuid_hold {uuid}")).await.map(|_| ())
    }

    async fn unhold(&self, uuid: &str) -> Result<(), SwitchError> {
        self.client.command_ok(&format!("api uuid_hold off {uuid}")).await.map(|_| ())
    }

    async fn start_media_stream(&self, uuid: &str, url: &str) -> Result<(), SwitchError> {
        self.execute_on_uuid(uuid, "media_stream", &format!("start {url}")).await
    }

    async fn stop_media_stream(&self, uuid: &str) -> Result<(), SwitchError> {
        self.execute_on_uuid(uuid, "media_stream", "stop").await
    }

    async fn registration_query(&self, address: &str) -> Result<bool, SwitchError> {
        let reply = self.client.command(&format!("api sofia_contact {address}")).await?;
        let body = reply.body.unwrap_or_default();
        Ok(!body.trim().is_empty() && !body.contains("error/user_not_registered"))
    }

    async fn execute_on_uuid(&self, uuid: &str, app: &str, arg: &str) -> Result<(), SwitchError> {
        let cmd = format!(
            "sendmsg {uuid}\ncall-command: execute\nexecute-app-name: {app}\nexecute-app-arg: {arg}"
        );
        self.client.command_ok(&cmd).await.map(|_| ())
    }

    async fn hangup(&self, uuid: &str, cause: &str) -> Result<(), SwitchError> {
        self.client
            .command_ok(&format!("api uuid_kill {uuid} {cause}"))
            .await
            .map(|_| ())
    }
}
