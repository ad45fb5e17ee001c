//! Tenant configuration.
//!
//! One TOML file per tenant, scanned once at server start. Everything in
//! here is read-only for the duration of a call: the session snapshots
//! its tenant's profile at ingress and never re-reads it.

mod store;

pub use store::ConfigStore;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Turn-detection mode for the provider session.
///
/// `PushToTalk` disables provider-side VAD entirely; user turns are then
/// delimited by explicit commit + response-create messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum VadConfig {
    ServerVad {
        /// Activation threshold (0.0 to 1.0). Higher = louder audio needed.
        #[serde(default = "default_vad_threshold")]
        threshold: f32,
        /// Audio included before detected speech (ms).
        #[serde(default = "default_prefix_padding_ms")]
        prefix_padding_ms: u32,
        /// Silence needed to end a user turn (ms).
        #[serde(default = "default_silence_duration_ms")]
        silence_duration_ms: u32,
    },
    SemanticVad {
        /// low | medium | high — how eagerly the model ends the turn.
        #[serde(default = "default_eagerness")]
        eagerness: String,
    },
    PushToTalk,
}

fn default_vad_threshold() -> f32 {
    0.5
}
fn default_prefix_padding_ms() -> u32 {
    300
}
fn default_silence_duration_ms() -> u32 {
    500
}
fn default_eagerness() -> String {
    "medium".to_string()
}

impl Default for VadConfig {
    fn default() -> Self {
        Self::ServerVad {
            threshold: default_vad_threshold(),
            prefix_padding_ms: default_prefix_padding_ms(),
            silence_duration_ms: default_silence_duration_ms(),
        }
    }
}

/// What kind of endpoint a transfer destination is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Extension,
    RingGroup,
    Queue,
    External,
    Voicemail,
}

/// What to do when a destination can't take the call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    /// Ask the caller whether they'd like a ticket created.
    #[default]
    OfferTicket,
    /// Create a ticket without asking.
    AutoTicket,
    /// Send the caller to the destination's voicemail.
    Voicemail,
    /// Return to the AI agent and keep talking.
    ReturnToAgent,
    /// Apologize and hang up.
    HangUp,
}

/// Weekly working-hours window, local to the tenant.
/// `days` uses 1 = Monday … 7 = Sunday.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingHours {
    pub days: Vec<u8>,
    /// "HH:MM" 24-hour
    pub start: String,
    /// "HH:MM" 24-hour
    pub end: String,
}

impl WorkingHours {
    /// Is `now` inside the window? Malformed times fail closed.
    pub fn contains(&self, now: chrono::DateTime<chrono::Local>) -> bool {
        use chrono::{Datelike, Timelike};
        let weekday = now.weekday().number_from_monday() as u8;
        if !self.days.contains(&weekday) {
            return false;
        }
        let minutes = (now.hour() * 60 + now.minute()) as i32;
        match (parse_hhmm(&self.start), parse_hhmm(&self.end)) {
            (Some(start), Some(end)) => minutes >= start && minutes < end,
            _ => false,
        }
    }
}

fn parse_hhmm(s: &str) -> Option<i32> {
    let (h, m) = s.split_once(':')?;
    let h: i32 = h.parse().ok()?;
    let m: i32 = m.parse().ok()?;
    if (0..24).contains(&h) && (0..60).contains(&m) {
        Some(h * 60 + m)
    } else {
        None
    }
}

/// A routable transfer target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferDestination {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub kind: DestinationKind,
    pub address: String,
    #[serde(default = "default_ring_timeout")]
    pub ring_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default)]
    pub fallback: FallbackAction,
    #[serde(default)]
    pub working_hours: Option<WorkingHours>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub default: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_ring_timeout() -> u64 {
    25
}
fn default_max_retries() -> u32 {
    1
}
fn default_retry_delay() -> u64 {
    3
}
fn default_enabled() -> bool {
    true
}

impl TransferDestination {
    /// Case-insensitive match against name or any alias.
    pub fn matches(&self, requested: &str) -> bool {
        let req = requested.trim().to_lowercase();
        self.name.to_lowercase() == req || self.aliases.iter().any(|a| a.to_lowercase() == req)
    }

    /// Syntactic address validation per kind. Extensions, ring groups and
    /// queues are switch-local numerics; external is dialable digits with
    /// optional leading `+`; voicemail is `vm:<extension>` or a bare
    /// extension.
    pub fn validate_address(&self) -> Result<(), String> {
        let addr = self.address.trim();
        if addr.is_empty() {
            return Err(format!("destination {}: empty address", self.name));
        }
        let ok = match self.kind {
            DestinationKind::Extension | DestinationKind::RingGroup | DestinationKind::Queue => {
                addr.chars().all(|c| c.is_ascii_digit())
            }
            DestinationKind::External => {
                let digits = addr.strip_prefix('+').unwrap_or(addr);
                digits.len() >= 7 && digits.chars().all(|c| c.is_ascii_digit())
            }
            DestinationKind::Voicemail => {
                let ext = addr.strip_prefix("vm:").unwrap_or(addr);
                ext.chars().all(|c| c.is_ascii_digit())
            }
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "destination {}: address \"{}\" not valid for kind {:?}",
                self.name, addr, self.kind
            ))
        }
    }
}

/// The configured persona for a tenant's virtual secretary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretaryProfile {
    pub secretary_id: String,
    /// System instructions sent in the provider session configuration.
    pub instructions: String,
    /// Spoken right after the call connects.
    pub greeting: String,
    pub voice: String,
    #[serde(default)]
    pub vad: VadConfig,
    /// Tool names the model may invoke. Empty = all built-ins.
    #[serde(default)]
    pub tool_allow: Vec<String>,
    /// Phrases that should steer the model toward a handoff.
    #[serde(default)]
    pub handoff_keywords: Vec<String>,
    /// Maximum user turns before the secretary wraps up (0 = unlimited).
    #[serde(default)]
    pub max_turns: u32,
    /// Spoken on any abort path ("I'm having trouble connecting…").
    #[serde(default = "default_failure_message")]
    pub failure_message: String,
    /// Spoken when a transfer is rejected and a ticket is offered.
    #[serde(default = "default_ticket_offer")]
    pub ticket_offer_message: String,
}

fn default_failure_message() -> String {
    "I'm having trouble connecting. I'll log this and someone will call you back.".to_string()
}
fn default_ticket_offer() -> String {
    "They can't take the call right now. Would you like me to open a ticket so someone follows up?"
        .to_string()
}

/// Everything the runtime needs to know about one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    /// Dialed numbers (DIDs) that route to this tenant.
    pub numbers: Vec<String>,
    pub secretary: SecretaryProfile,
    #[serde(default)]
    pub destinations: Vec<TransferDestination>,
    /// Free-form fields served by the get_business_info tool
    /// (hours, address, website, …).
    #[serde(default)]
    pub business_info: std::collections::BTreeMap<String, String>,
    /// Webhook that receives the call record and tickets.
    pub record_sink_url: Option<String>,
    /// Create a ticket automatically on abort paths.
    #[serde(default)]
    pub ticket_on_error: bool,
}

impl TenantConfig {
    /// Validate everything we can check without the switch: destination
    /// addresses, exactly-one-default, alias collisions.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for dest in &self.destinations {
            dest.validate_address().map_err(|message| ConfigError::Invalid {
                tenant: self.tenant_id.clone(),
                message,
            })?;
        }
        let defaults = self.destinations.iter().filter(|d| d.default).count();
        if defaults > 1 {
            return Err(ConfigError::Invalid {
                tenant: self.tenant_id.clone(),
                message: format!("{defaults} destinations marked default, expected at most one"),
            });
        }
        if self.numbers.is_empty() {
            return Err(ConfigError::Invalid {
                tenant: self.tenant_id.clone(),
                message: "no inbound numbers configured".to_string(),
            });
        }
        Ok(())
    }

    /// Resolve a requested destination: alias match wins, then the
    /// highest-priority enabled match; with no match at all, the default
    /// entry.
    pub fn resolve_destination(&self, requested: &str) -> Option<&TransferDestination> {
        let mut matches: Vec<&TransferDestination> = self
            .destinations
            .iter()
            .filter(|d| d.enabled && d.matches(requested))
            .collect();
        matches.sort_by(|a, b| b.priority.cmp(&a.priority));
        matches
            .first()
            .copied()
            .or_else(|| self.destinations.iter().find(|d| d.enabled && d.default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(name: &str, kind: DestinationKind, address: &str) -> TransferDestination {
        TransferDestination {
            name: name.to_string(),
            aliases: vec![],
            kind,
            address: address.to_string(),
            ring_timeout_secs: 25,
            max_retries: 1,
            retry_delay_secs: 3,
            fallback: FallbackAction::OfferTicket,
            working_hours: None,
            priority: 0,
            default: false,
            enabled: true,
        }
    }

    fn tenant(destinations: Vec<TransferDestination>) -> TenantConfig {
        TenantConfig {
            tenant_id: "acme".to_string(),
            numbers: vec!["+15551234567".to_string()],
            secretary: SecretaryProfile {
                secretary_id: "front-desk".to_string(),
                instructions: "Be helpful.".to_string(),
                greeting: "Hello!".to_string(),
                voice: "alloy".to_string(),
                vad: VadConfig::default(),
                tool_allow: vec![],
                handoff_keywords: vec![],
                max_turns: 0,
                failure_message: default_failure_message(),
                ticket_offer_message: default_ticket_offer(),
            },
            destinations,
            business_info: Default::default(),
            record_sink_url: None,
            ticket_on_error: false,
        }
    }

    #[test]
    fn test_address_validation_per_kind() {
        assert!(dest("Sales", DestinationKind::Extension, "1001").validate_address().is_ok());
        assert!(dest("Sales", DestinationKind::Extension, "10a1").validate_address().is_err());
        assert!(dest("Cell", DestinationKind::External, "+15557654321").validate_address().is_ok());
        assert!(dest("Cell", DestinationKind::External, "123").validate_address().is_err());
        assert!(dest("VM", DestinationKind::Voicemail, "vm:1001").validate_address().is_ok());
        assert!(dest("VM", DestinationKind::Voicemail, "vm:10x1").validate_address().is_err());
    }

    #[test]
    fn test_resolution_prefers_alias_then_priority() {
        let mut sales_a = dest("Sales", DestinationKind::Extension, "1001");
        sales_a.priority = 1;
        let mut sales_b = dest("Sales Overflow", DestinationKind::RingGroup, "600");
        sales_b.aliases = vec!["sales".to_string()];
        sales_b.priority = 5;
        let t = tenant(vec![sales_a, sales_b]);

        let resolved = t.resolve_destination("sales").unwrap();
        assert_eq!(resolved.name, "Sales Overflow");
    }

    #[test]
    fn test_resolution_falls_back_to_default() {
        let mut reception = dest("Reception", DestinationKind::Extension, "1000");
        reception.default = true;
        let t = tenant(vec![dest("Sales", DestinationKind::Extension, "1001"), reception]);

        let resolved = t.resolve_destination("accounting").unwrap();
        assert_eq!(resolved.name, "Reception");
    }

    #[test]
    fn test_no_match_no_default() {
        let t = tenant(vec![dest("Sales", DestinationKind::Extension, "1001")]);
        assert!(t.resolve_destination("accounting").is_none());
    }

    #[test]
    fn test_two_defaults_rejected() {
        let mut a = dest("A", DestinationKind::Extension, "1");
        a.default = true;
        let mut b = dest("B", DestinationKind::Extension, "2");
        b.default = true;
        assert!(tenant(vec![a, b]).validate().is_err());
    }

    #[test]
    fn test_working_hours_parse() {
        let hours = WorkingHours {
            days: vec![1, 2, 3, 4, 5],
            start: "09:00".to_string(),
            end: "17:30".to_string(),
        };
        // Malformed times fail closed
        let bad = WorkingHours {
            days: vec![1, 2, 3, 4, 5, 6, 7],
            start: "9am".to_string(),
            end: "late".to_string(),
        };
        let now = chrono::Local::now();
        // Can't assert a fixed clock here; just exercise both paths.
        let _ = hours.contains(now);
        assert!(!bad.contains(now));
    }
}
