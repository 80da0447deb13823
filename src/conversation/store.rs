use chrono::DateTime;
use log::error;

use crate::models::chat::{ Message, MessageContent, MessageRow, Sender };
use crate::models::itinerary::{ looks_like_persisted_itinerary, Itinerary };

/// Ordered transcript of the active session. The accumulator patches a
/// single message in place by id as chunks arrive; session switches replace
/// the whole list from persisted rows.
#[derive(Default)]
pub struct ConversationStore {
    messages: Vec<Message>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Message immediately before `id`, used by regeneration to locate the
    /// user prompt that produced an AI reply.
    pub fn predecessor(&self, id: &str) -> Option<&Message> {
        let index = self.messages.iter().position(|m| m.id == id)?;
        if index == 0 {
            return None;
        }
        self.messages.get(index - 1)
    }

    /// In-place update by identity. Returns false when the id is unknown
    /// (e.g. the transcript was replaced underneath an in-flight stream).
    pub fn update<F>(&mut self, id: &str, mutate: F) -> bool where F: FnOnce(&mut Message) {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                mutate(message);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let index = self.messages.iter().position(|m| m.id == id)?;
        Some(self.messages.remove(index))
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Rebuilds the transcript from persisted rows. Stored rows carry no
    /// content-type tag, so AI rows are classified by shape: content that
    /// sniffs as a serialized itinerary is decoded into a settled plan with
    /// the raw JSON hidden; anything else (including parse failures) loads
    /// as plain text.
    pub fn load_rows(&mut self, rows: Vec<MessageRow>) {
        self.messages.clear();

        for row in rows {
            let sender = if row.role == "user" { Sender::User } else { Sender::Ai };
            let timestamp = DateTime::parse_from_rfc3339(&row.created_at)
                .map(|t| t.timestamp_millis())
                .unwrap_or_default();

            let content = if sender == Sender::Ai && looks_like_persisted_itinerary(&row.content) {
                match serde_json::from_str::<Itinerary>(&row.content) {
                    Ok(itinerary) => MessageContent::Plan { itinerary, text: String::new() },
                    Err(e) => {
                        error!("Error parsing stored itinerary row {}: {}", row.id, e);
                        MessageContent::Text { text: row.content }
                    }
                }
            } else {
                MessageContent::Text { text: row.content }
            };

            self.messages.push(Message {
                id: row.id,
                sender,
                timestamp,
                image: None,
                content,
            });
        }
    }
}
