use std::error::Error as StdError;

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use log::{ debug, info, warn };
use serde::Serialize;
use serde_json::{ json, Value as JsonValue };
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::persona::{ ITINERARY_TOOL, SYSTEM_INSTRUCTION, TOOL_NAME };
use crate::models::chat::MessageContent;
use super::chunk::{ decode, parse_stream_line };
use super::{ ChunkStream, GeminiConfig, ModelSession };

#[derive(Serialize, Debug, Clone)]
struct WireContent {
    role: String,
    parts: Vec<WirePart>,
}

#[derive(Serialize, Debug, Clone, Default)]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
    #[serde(rename = "functionCall", skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
}

#[derive(Serialize, Debug, Clone)]
struct InlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Serialize, Debug, Clone)]
struct WireFunctionCall {
    name: String,
    args: JsonValue,
}

impl WirePart {
    fn text(value: &str) -> Self {
        Self { text: Some(value.to_string()), ..Default::default() }
    }

    fn inline(mime_type: String, data: String) -> Self {
        Self {
            inline_data: Some(InlineData { mime_type, data }),
            ..Default::default()
        }
    }
}

/// Splits a `data:` URI into its MIME type and base64 payload, verifying
/// the payload actually decodes before it is forwarded to the backend.
pub fn parse_data_uri(uri: &str) -> Result<(String, String), Box<dyn StdError + Send + Sync>> {
    let (meta, data) = uri
        .split_once(',')
        .ok_or("Image is not a data: URI (missing comma separator)")?;

    let mime = meta
        .strip_prefix("data:")
        .and_then(|m| m.split(';').next())
        .filter(|m| !m.is_empty())
        .ok_or("Image data: URI carries no MIME type")?;

    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| format!("Image payload is not valid base64: {}", e))?;

    Ok((mime.to_string(), data.to_string()))
}

/// Production model session speaking the streamGenerateContent wire
/// contract. Holds the cumulative conversation history plus the fixed
/// persona, tool declaration and sampling temperature.
pub struct GeminiSession {
    config: GeminiConfig,
    client: reqwest::Client,
    history: Vec<WireContent>,
}

impl GeminiSession {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            history: Vec::new(),
        }
    }

    fn request_body(&self) -> JsonValue {
        json!({
            "systemInstruction": { "parts": [{ "text": SYSTEM_INSTRUCTION }] },
            "contents": self.history,
            "tools": [{ "functionDeclarations": [ITINERARY_TOOL.clone()] }],
            "generationConfig": { "temperature": self.config.temperature }
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.model,
            self.config.api_key
        )
    }
}

#[async_trait]
impl ModelSession for GeminiSession {
    async fn send(
        &mut self,
        text: &str,
        image: Option<&str>
    ) -> Result<ChunkStream, Box<dyn StdError + Send + Sync>> {
        let mut parts = vec![WirePart::text(text)];
        if let Some(uri) = image {
            let (mime, data) = parse_data_uri(uri)?;
            parts.push(WirePart::inline(mime, data));
        }
        self.history.push(WireContent { role: "user".to_string(), parts });

        info!(
            "GeminiSession::send() → model={} history_turns={}",
            self.config.model,
            self.history.len()
        );

        let resp = self.client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(&self.request_body())
            .send().await?
            .error_for_status()?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            // SSE events may split across network reads, so an incomplete
            // trailing line is carried into the next read.
            let mut pending = String::new();

            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(buf) => {
                        if let Ok(text) = std::str::from_utf8(&buf) {
                            pending.push_str(text);
                        }
                        while let Some(pos) = pending.find('\n') {
                            let line: String = pending.drain(..=pos).collect();
                            if let Some(raw) = parse_stream_line(&line) {
                                if tx.send(Ok(decode(raw))).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Box::new(e) as _)).await;
                        return;
                    }
                }
            }

            if let Some(raw) = parse_stream_line(&pending) {
                let _ = tx.send(Ok(decode(raw))).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn record_reply(&mut self, reply: &MessageContent) {
        let parts = match reply {
            MessageContent::Text { text } if !text.is_empty() => {
                vec![WirePart::text(text)]
            }
            MessageContent::Plan { itinerary, text } => {
                let mut parts = Vec::new();
                if !text.is_empty() {
                    parts.push(WirePart::text(text));
                }
                match serde_json::to_value(itinerary) {
                    Ok(args) => parts.push(WirePart {
                        function_call: Some(WireFunctionCall {
                            name: TOOL_NAME.to_string(),
                            args,
                        }),
                        ..Default::default()
                    }),
                    Err(e) => {
                        warn!("Failed to serialize itinerary for history: {}", e);
                    }
                }
                parts
            }
            _ => {
                debug!("Ignoring unsettled reply for session history");
                return;
            }
        };

        if !parts.is_empty() {
            self.history.push(WireContent { role: "model".to_string(), parts });
        }
    }

    fn reset(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_uri_splits_into_mime_and_payload() {
        let (mime, data) = parse_data_uri("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(data, "aGVsbG8=");
    }

    #[test]
    fn data_uri_without_separator_is_rejected() {
        assert!(parse_data_uri("image/png;base64").is_err());
    }

    #[test]
    fn data_uri_with_bad_payload_is_rejected() {
        assert!(parse_data_uri("data:image/png;base64,???not-base64???").is_err());
    }

    #[test]
    fn request_body_carries_persona_tool_and_temperature() {
        let session = GeminiSession::new(GeminiConfig::new("k".into(), None, None));
        let body = session.request_body();
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            TOOL_NAME
        );
        assert!((body["generationConfig"]["temperature"].as_f64().unwrap() - 0.5).abs() < 1e-6);
        assert!(
            body["systemInstruction"]["parts"][0]["text"]
                .as_str()
                .unwrap()
                .contains("Travel Planner")
        );
    }

    #[test]
    fn recorded_replies_accumulate_as_model_turns() {
        let mut session = GeminiSession::new(GeminiConfig::new("k".into(), None, None));
        session.record_reply(&MessageContent::Text { text: "Hi there".into() });
        assert_eq!(session.history.len(), 1);
        assert_eq!(session.history[0].role, "model");

        session.reset();
        assert!(session.history.is_empty());
    }
}
