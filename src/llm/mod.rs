pub mod chunk;
pub mod gemini;

use async_trait::async_trait;
use futures::Stream;
use std::error::Error as StdError;
use std::pin::Pin;

use crate::models::chat::MessageContent;
use self::chunk::ChunkEvent;

pub type ChunkStream = Pin<
    Box<dyn Stream<Item = Result<ChunkEvent, Box<dyn StdError + Send + Sync>>> + Send>
>;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
}

impl GeminiConfig {
    pub fn new(api_key: String, model: Option<String>, base_url: Option<String>) -> Self {
        Self {
            api_key,
            model: model.unwrap_or_else(|| "gemini-2.5-flash".to_string()),
            base_url: base_url.unwrap_or_else(||
                "https://generativelanguage.googleapis.com/v1beta".to_string()
            ),
            temperature: crate::config::persona::TEMPERATURE,
        }
    }
}

/// One stateful model conversation. The session accumulates wire history
/// across calls, which is what makes follow-ups and regeneration
/// context-aware. Created and reset explicitly by whoever owns the
/// conversation lifecycle; there is no process-wide instance.
#[async_trait]
pub trait ModelSession: Send {
    /// Sends one user turn (text plus optional data-URI image) and returns
    /// the chunk stream for the reply. An outright call failure rejects
    /// here; mid-stream failures surface as stream items.
    async fn send(
        &mut self,
        text: &str,
        image: Option<&str>
    ) -> Result<ChunkStream, Box<dyn StdError + Send + Sync>>;

    /// Appends the resolved model turn to the wire history. Pending
    /// content is not a valid reply and is ignored.
    fn record_reply(&mut self, reply: &MessageContent);

    /// Drops all accumulated history (new chat, session switch, logout).
    fn reset(&mut self);
}
