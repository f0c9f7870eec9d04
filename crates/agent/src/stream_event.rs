//! Turn-level events for a presentation layer.
//!
//! `TurnEvent` reports what the orchestrator did to the message log while
//! a turn streamed, so a UI can mirror it without polling.

use parlance_core::provider::Usage;
use serde::{Deserialize, Serialize};

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The stream ran to completion.
    Completed,
    /// The caller cancelled; partial content was kept.
    Stopped,
    /// The exchange failed; the reply holds the error text.
    Errored,
}

/// Events emitted by the orchestrator during a turn.
///
/// - `started`: placeholder reply created
/// - `delta`: content appended to the reply
/// - `usage`: final token usage recorded
/// - `error`: error text written to the log
/// - `finished`: the turn reached a terminal outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Started {
        conversation_id: String,
        message_id: String,
    },

    Delta { message_id: String, content: String },

    Usage { model: String, usage: Usage, cost: f64 },

    Error { message_id: String, message: String },

    Finished {
        message_id: String,
        outcome: TurnOutcome,
    },
}

impl TurnEvent {
    /// SSE-style event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Delta { .. } => "delta",
            Self::Usage { .. } => "usage",
            Self::Error { .. } => "error",
            Self::Finished { .. } => "finished",
        }
    }
}
