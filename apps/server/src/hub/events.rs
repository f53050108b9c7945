//! Wire-format frames and their validation.
//!
//! Both directions are sum types tagged by `"type"`. Decoding centralizes
//! every field constraint at the perimeter, so the rest of the hub deals
//! only in well-formed values. Unknown fields are ignored for forward
//! compatibility; an unknown `type` is rejected.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::history::Message;

// ---------------------------------------------------------------------------
// Client → Server frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        room_id: String,
        #[serde(default)]
        since_ts: Option<i64>,
        #[serde(default)]
        before_id: Option<String>,
    },
    Message {
        room_id: String,
        text: String,
    },
    SetName {
        display_name: String,
    },
    TypingStart {
        room_id: String,
    },
    TypingStop {
        room_id: String,
    },
}

/// Why an inbound frame was refused. Surfaced to the sender as
/// `error{BAD_REQUEST}` and otherwise ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRejection {
    pub msg: String,
}

impl FrameRejection {
    fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

/// Field limits the codec enforces; sourced from `Config`.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub message_max_chars: usize,
    pub display_name_max_chars: usize,
}

/// Parse and validate one inbound frame.
///
/// The returned frame is normalized: message text and display names are
/// trimmed.
pub fn decode(raw: &str, limits: FrameLimits) -> Result<ClientFrame, FrameRejection> {
    let frame: ClientFrame = serde_json::from_str(raw)
        .map_err(|_| FrameRejection::new("malformed frame"))?;

    match frame {
        ClientFrame::Join {
            room_id,
            since_ts,
            before_id,
        } => {
            if room_id.is_empty() {
                return Err(FrameRejection::new("room_id is required"));
            }
            if since_ts.is_some() && before_id.is_some() {
                return Err(FrameRejection::new(
                    "join accepts at most one of since_ts and before_id",
                ));
            }
            if matches!(since_ts, Some(ts) if ts < 0) {
                return Err(FrameRejection::new("since_ts must be non-negative"));
            }
            Ok(ClientFrame::Join {
                room_id,
                since_ts,
                before_id,
            })
        }
        ClientFrame::Message { room_id, text } => {
            if room_id.is_empty() {
                return Err(FrameRejection::new("room_id is required"));
            }
            let text = text.trim();
            if text.is_empty() {
                return Err(FrameRejection::new("message text is empty"));
            }
            if text.chars().count() > limits.message_max_chars {
                return Err(FrameRejection::new(format!(
                    "message text exceeds {} characters",
                    limits.message_max_chars
                )));
            }
            Ok(ClientFrame::Message {
                room_id,
                text: text.to_string(),
            })
        }
        ClientFrame::SetName { display_name } => {
            let display_name = display_name.trim();
            if display_name.is_empty() {
                return Err(FrameRejection::new("display_name is empty"));
            }
            if display_name.chars().count() > limits.display_name_max_chars {
                return Err(FrameRejection::new(format!(
                    "display_name exceeds {} characters",
                    limits.display_name_max_chars
                )));
            }
            Ok(ClientFrame::SetName {
                display_name: display_name.to_string(),
            })
        }
        ClientFrame::TypingStart { room_id } | ClientFrame::TypingStop { room_id }
            if room_id.is_empty() =>
        {
            Err(FrameRejection::new("room_id is required"))
        }
        other => Ok(other),
    }
}

// ---------------------------------------------------------------------------
// Server → Client frames
// ---------------------------------------------------------------------------

/// One entry of a presence snapshot, ordered by `user_id`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MemberView {
    pub user_id: String,
    pub display_name: String,
}

/// Cursor for fetching an older page of history.
#[derive(Debug, Clone, Serialize, Default)]
pub struct HistoryCursor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_ts: Option<i64>,
}

/// Wire shape of one persisted message, used both as the `message` frame
/// payload and as `history.messages` entries.
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub display_name: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mentions: Option<Vec<String>>,
    pub ts: i64,
}

impl From<&Message> for MessageView {
    fn from(msg: &Message) -> Self {
        Self {
            id: msg.id.clone(),
            room_id: msg.room_id.clone(),
            user_id: msg.user_id.clone(),
            display_name: msg.display_name.clone(),
            text: msg.text.clone(),
            mentions: msg.mentions.clone(),
            ts: msg.ts,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Hello {
        self_id: String,
        room_id: String,
        members: Vec<MemberView>,
    },
    Presence {
        room_id: String,
        members: Vec<MemberView>,
    },
    Message(MessageView),
    History {
        room_id: String,
        /// Oldest-first.
        messages: Vec<MessageView>,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_cursor: Option<HistoryCursor>,
    },
    UserTyping {
        room_id: String,
        user_id: String,
        display_name: String,
    },
    UserTypingStop {
        room_id: String,
        user_id: String,
    },
    Error {
        code: ErrorCode,
        msg: String,
    },
}

impl ServerFrame {
    /// Build a `message` frame from a persisted row.
    pub fn message(msg: &Message) -> Self {
        ServerFrame::Message(MessageView::from(msg))
    }

    pub fn error(code: ErrorCode, msg: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            msg: msg.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("serialize server frame")
    }
}
