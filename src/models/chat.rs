use chrono::Utc;
use serde::{ Serialize, Deserialize };
use uuid::Uuid;

use crate::models::itinerary::Itinerary;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Ai,
}

/// What a message currently holds. A message is `Pending` from creation
/// until its stream settles it exactly once; the settled variants make the
/// text-vs-itinerary outcome a closed state instead of two nullable fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    /// Still streaming. `text` grows as deltas arrive.
    Pending {
        text: String,
    },
    /// Settled free text. User messages are always this; an empty string is
    /// the settled error-fallback state.
    Text {
        text: String,
    },
    /// Settled structured plan. `text` keeps whatever streamed alongside
    /// the function call; the client decides whether to show it.
    Plan {
        itinerary: Itinerary,
        text: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: Sender,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub content: MessageContent,
}

impl Message {
    pub fn user(text: String, image: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: Sender::User,
            timestamp: Utc::now().timestamp_millis(),
            image,
            content: MessageContent::Text { text },
        }
    }

    /// A fresh AI message in streaming state, empty until deltas arrive.
    pub fn pending_ai() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: Sender::Ai,
            timestamp: Utc::now().timestamp_millis(),
            image: None,
            content: MessageContent::Pending { text: String::new() },
        }
    }

    /// Settled AI message, used for fixed-text notices like the stream
    /// failure apology.
    pub fn settled_ai(text: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: Sender::Ai,
            timestamp: Utc::now().timestamp_millis(),
            image: None,
            content: MessageContent::Text { text },
        }
    }

    pub fn text(&self) -> &str {
        match &self.content {
            MessageContent::Pending { text } => text,
            MessageContent::Text { text } => text,
            MessageContent::Plan { text, .. } => text,
        }
    }

    pub fn itinerary(&self) -> Option<&Itinerary> {
        match &self.content {
            MessageContent::Plan { itinerary, .. } => Some(itinerary),
            _ => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.content, MessageContent::Pending { .. })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub created_at: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub email: String,
}

impl UserProfile {
    /// Display name resolution: profile name first, email handle as the
    /// fallback when the profile row carries no name at all.
    pub fn display_name(&self) -> String {
        if !self.first_name.trim().is_empty() {
            format!("{} {}", self.first_name, self.last_name).trim().to_string()
        } else {
            self.email.split('@').next().unwrap_or("Traveler").to_string()
        }
    }
}

/// Shape of one persisted message row as the storage backend returns it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub content: String,
    pub role: String,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_message_reports_streaming() {
        let msg = Message::pending_ai();
        assert!(msg.is_streaming());
        assert_eq!(msg.text(), "");
        assert!(msg.itinerary().is_none());
    }

    #[test]
    fn user_message_is_settled_text() {
        let msg = Message::user("hello".into(), None);
        assert!(!msg.is_streaming());
        assert_eq!(msg.text(), "hello");
    }

    #[test]
    fn display_name_falls_back_to_email_handle() {
        let profile = UserProfile {
            id: "u1".into(),
            first_name: "".into(),
            last_name: "".into(),
            email: "nomad@example.com".into(),
        };
        assert_eq!(profile.display_name(), "nomad");

        let named = UserProfile {
            id: "u2".into(),
            first_name: "Ada".into(),
            last_name: "Wong".into(),
            email: "ada@example.com".into(),
        };
        assert_eq!(named.display_name(), "Ada Wong");
    }
}
