use serde::{ Serialize, Deserialize };

use crate::models::chat::{ ChatSession, Message };

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "chat")] Chat {
        content: String,
        /// Optional attached image as a data: URI.
        image: Option<String>,
    },
    #[serde(rename = "regenerate")] Regenerate {
        message_id: String,
    },
    #[serde(rename = "select_session")] SelectSession {
        session_id: String,
    },
    #[serde(rename = "new_chat")]
    NewChat,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// A new message entered the transcript (user echo or a pending AI
    /// frame the client should start rendering).
    #[serde(rename = "message")] Message {
        message: Message,
    },
    /// Incremental text for an in-flight AI message.
    #[serde(rename = "partial")] Partial {
        message_id: String,
        text: String,
    },
    /// An AI message settled: plain text or an itinerary card.
    #[serde(rename = "resolved")] Resolved {
        message: Message,
    },
    /// An in-flight message was abandoned after a stream failure; the
    /// client should drop its partial rendering.
    #[serde(rename = "removed")] Removed {
        message_id: String,
    },
    /// Full transcript after a session switch; `session_id` is absent for
    /// a fresh, not-yet-persisted chat.
    #[serde(rename = "history")] History {
        session_id: Option<String>,
        messages: Vec<Message>,
    },
    #[serde(rename = "sessions")] Sessions {
        sessions: Vec<ChatSession>,
    },
    #[serde(rename = "error")] Error {
        message: String,
    },
    #[serde(rename = "done")] Done {
        timestamp: i64,
    },
    #[serde(rename = "processing")]
    Processing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_chat_frame_round_trips() {
        let json = r#"{"type":"chat","content":"Plan a trip","image":null}"#;
        match serde_json::from_str::<ClientMessage>(json).unwrap() {
            ClientMessage::Chat { content, image } => {
                assert_eq!(content, "Plan a trip");
                assert!(image.is_none());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn server_frames_carry_type_tag() {
        let frame = ServerMessage::Partial {
            message_id: "m1".into(),
            text: "Sure! ".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"partial\""));
    }
}
