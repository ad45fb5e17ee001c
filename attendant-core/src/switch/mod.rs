//! Telephony switch integration.
//!
//! Two channels to the switch, both speaking the same newline-delimited
//! header/body text protocol:
//!
//! - **inbound** (`esl::InboundClient`): the core dials the switch's
//!   control port, authenticates, and issues commands. Shared across all
//!   sessions; commands are serialized FIFO at the connection.
//! - **outbound** (`outbound::OutboundListener`): the switch connects to
//!   the core once per call, the core answers and parks the channel, and
//!   channel events stream back on the same socket.
//!
//! Media travels separately over a per-call WebSocket (`media`).
//!
//! The adapter (`SwitchControl`) exposes only data-plane-neutral
//! commands — no business logic lives on this side of the boundary.

pub mod adapter;
pub mod esl;
pub mod events;
pub mod media;
pub mod outbound;

pub use adapter::{EslAdapter, SwitchControl};
