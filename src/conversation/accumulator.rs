use std::error::Error as StdError;

use futures::StreamExt;
use log::{ debug, warn };

use crate::config::persona::TOOL_NAME;
use crate::llm::chunk::{ Candidate, ChunkEvent };
use crate::llm::ChunkStream;
use crate::models::chat::MessageContent;
use crate::models::itinerary::Itinerary;
use super::store::ConversationStore;

/// Consumes the chunk stream for one in-flight AI message: text deltas are
/// appended to a running buffer and published to the transcript
/// immediately, while the most recent response candidate is retained for
/// the function-call scan that runs exactly once after the stream drains.
///
/// The message settles exactly once — to a structured plan when the
/// retained candidate carries a qualifying `propose_itinerary` call, to
/// plain text otherwise. A mid-stream failure leaves the partial buffer
/// unsettled and returns the error; disposition of the abandoned message
/// belongs to the caller, which knows whether this was a send or a
/// regeneration.
pub struct StreamAccumulator<'a> {
    store: &'a mut ConversationStore,
    message_id: String,
    full_text: String,
    last_candidate: Option<Candidate>,
}

impl<'a> StreamAccumulator<'a> {
    pub fn new(store: &'a mut ConversationStore, message_id: &str) -> Self {
        Self {
            store,
            message_id: message_id.to_string(),
            full_text: String::new(),
            last_candidate: None,
        }
    }

    /// Drains the stream to completion. `on_partial` fires after every
    /// published delta with the message id and the full buffer so far.
    pub async fn run<F>(
        mut self,
        mut stream: ChunkStream,
        mut on_partial: F
    ) -> Result<MessageContent, Box<dyn StdError + Send + Sync>>
        where F: FnMut(&str, &str)
    {
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => self.apply(event, &mut on_partial),
                Err(e) => {
                    warn!("Chunk stream failed for message {}: {}", self.message_id, e);
                    return Err(e);
                }
            }
        }

        let content = self.resolve();
        let settled = content.clone();
        let updated = self.store.update(&self.message_id, move |message| {
            message.content = settled;
        });
        if !updated {
            warn!("Message {} vanished before its stream settled", self.message_id);
        }

        Ok(content)
    }

    fn apply<F>(&mut self, event: ChunkEvent, on_partial: &mut F) where F: FnMut(&str, &str) {
        match event {
            ChunkEvent::TextDelta(delta) => {
                self.append_delta(&delta, on_partial);
            }
            ChunkEvent::CandidateUpdate(candidate) => {
                self.last_candidate = Some(candidate);
            }
            ChunkEvent::TextWithCandidate(delta, candidate) => {
                self.append_delta(&delta, on_partial);
                self.last_candidate = Some(candidate);
            }
            ChunkEvent::Empty => {
                debug!("Heartbeat chunk for message {}", self.message_id);
            }
        }
    }

    fn append_delta<F>(&mut self, delta: &str, on_partial: &mut F) where F: FnMut(&str, &str) {
        self.full_text.push_str(delta);

        let published = self.full_text.clone();
        self.store.update(&self.message_id, move |message| {
            message.content = MessageContent::Pending { text: published };
        });
        on_partial(&self.message_id, &self.full_text);
    }

    /// Termination rule: scan the retained candidate's parts in order.
    /// Every qualifying call overwrites the previous find, so the last one
    /// wins — the scan deliberately does not break early.
    fn resolve(&mut self) -> MessageContent {
        let mut found: Option<Itinerary> = None;

        if let Some(candidate) = &self.last_candidate {
            for part in &candidate.content.parts {
                let Some(call) = &part.function_call else {
                    continue;
                };
                if call.name != TOOL_NAME {
                    continue;
                }
                match serde_json::from_value::<Itinerary>(call.args.clone()) {
                    Ok(plan) => found = Some(plan),
                    Err(e) => warn!("Discarding malformed {} args: {}", TOOL_NAME, e),
                }
            }
        }

        let text = std::mem::take(&mut self.full_text);
        match found {
            Some(itinerary) => MessageContent::Plan { itinerary, text },
            None => MessageContent::Text { text },
        }
    }
}
