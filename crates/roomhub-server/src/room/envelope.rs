//! The `{id, message}` wire unit used for routing text frames.

use serde::{Deserialize, Serialize};

/// Recipient selector meaning "broadcast to all other members".
pub const BROADCAST_ID: &str = "-1";

/// Recipient selector meaning "tell me my own id".
pub const SELF_ID: &str = "0";

/// One chat envelope as carried in a text frame.
///
/// Decoding is best-effort: malformed or non-conforming JSON yields the
/// empty envelope instead of an error, so a bad payload routes as a
/// direct message to an unknown id and is dropped with a log line rather
/// than tearing the connection down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEnvelope {
    /// Recipient selector: `"-1"` broadcast, `"0"` self-id query, anything
    /// else a direct-message target member id.
    #[serde(default)]
    pub id: String,
    /// Free-text payload.
    #[serde(default)]
    pub message: String,
}

/// Where an envelope should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Deliver the message to every other member.
    Broadcast {
        /// The payload to fan out.
        message: String,
    },
    /// Answer the sender with its own id; never touches the group.
    SelfId,
    /// Deliver the message to exactly one member.
    Direct {
        /// Target member id.
        target: String,
        /// The payload to deliver.
        message: String,
    },
}

impl ChatEnvelope {
    /// Decode a raw text payload, falling back to the empty envelope.
    pub fn decode(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }

    /// Classify the envelope by its recipient selector.
    pub fn route(self) -> Route {
        match self.id.as_str() {
            BROADCAST_ID => Route::Broadcast {
                message: self.message,
            },
            SELF_ID => Route::SelfId,
            _ => Route::Direct {
                target: self.id,
                message: self.message,
            },
        }
    }
}
