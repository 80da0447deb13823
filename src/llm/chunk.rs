use serde::Deserialize;
use serde_json::Value as JsonValue;

/// One raw streamed payload from the model backend. A chunk optionally
/// exposes an incremental text string and a list of response candidates;
/// the stream may also emit heartbeat chunks carrying neither.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct RawChunk {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Candidate {
    pub content: CandidateContent,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Part {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(rename = "functionCall", default)]
    pub function_call: Option<FunctionCall>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: JsonValue,
}

/// Closed set of things a chunk can mean to the accumulator. Decoding
/// happens once at the boundary so the core never probes optional fields
/// on arbitrary payloads.
#[derive(Debug, Clone)]
pub enum ChunkEvent {
    TextDelta(String),
    CandidateUpdate(Candidate),
    TextWithCandidate(String, Candidate),
    Empty,
}

impl Candidate {
    /// Concatenated text of this candidate's parts, the same aggregate the
    /// backend SDK exposes as the chunk's `.text`.
    pub fn joined_text(&self) -> String {
        self.content.parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect()
    }
}

pub fn decode(raw: RawChunk) -> ChunkEvent {
    let candidate = raw.candidates.into_iter().next();

    let delta = match raw.text {
        Some(text) if !text.is_empty() => Some(text),
        _ => {
            candidate
                .as_ref()
                .map(|c| c.joined_text())
                .filter(|t| !t.is_empty())
        }
    };

    match (delta, candidate) {
        (Some(text), Some(candidate)) => ChunkEvent::TextWithCandidate(text, candidate),
        (Some(text), None) => ChunkEvent::TextDelta(text),
        (None, Some(candidate)) => ChunkEvent::CandidateUpdate(candidate),
        (None, None) => ChunkEvent::Empty,
    }
}

/// Extracts one JSON chunk from a stream line. The backend frames the
/// stream either as SSE (`data: {...}`) or as a JSON array printed one
/// object per line; bare brackets, commas and blank lines separate chunks
/// and carry no payload.
pub fn parse_stream_line(line: &str) -> Option<RawChunk> {
    let line = line.trim();
    if line.is_empty() || line == "[" || line == "]" || line == "," {
        return None;
    }

    let body = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if body.is_empty() || body == "[DONE]" {
        return None;
    }

    let json_obj = if body.ends_with("},") || body.ends_with("],") {
        &body[..body.len() - 1]
    } else {
        body
    };

    serde_json::from_str::<RawChunk>(json_obj).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(json: &str) -> RawChunk {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn text_only_chunk_decodes_to_delta() {
        let event = decode(chunk(r#"{"text": "Sure! "}"#));
        match event {
            ChunkEvent::TextDelta(text) => assert_eq!(text, "Sure! "),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn candidate_with_text_parts_decodes_to_both() {
        let event = decode(chunk(
            r#"{"candidates":[{"content":{"parts":[{"text":"Pla"},{"text":"nning"}]}}]}"#,
        ));
        match event {
            ChunkEvent::TextWithCandidate(text, candidate) => {
                assert_eq!(text, "Planning");
                assert_eq!(candidate.content.parts.len(), 2);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn function_call_candidate_without_text_is_candidate_update() {
        let event = decode(chunk(
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"propose_itinerary","args":{"destination":"Lisbon"}}}]}}]}"#,
        ));
        match event {
            ChunkEvent::CandidateUpdate(candidate) => {
                let call = candidate.content.parts[0].function_call.as_ref().unwrap();
                assert_eq!(call.name, "propose_itinerary");
                assert_eq!(call.args["destination"], "Lisbon");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn heartbeat_decodes_to_empty() {
        assert!(matches!(decode(chunk("{}")), ChunkEvent::Empty));
        assert!(matches!(decode(chunk(r#"{"text": ""}"#)), ChunkEvent::Empty));
    }

    #[test]
    fn stream_line_framing_variants() {
        assert!(parse_stream_line("[").is_none());
        assert!(parse_stream_line("]").is_none());
        assert!(parse_stream_line(",").is_none());
        assert!(parse_stream_line("").is_none());
        assert!(parse_stream_line("data: [DONE]").is_none());
        assert!(parse_stream_line("not json").is_none());

        let sse = parse_stream_line(r#"data: {"text": "hi"}"#).unwrap();
        assert_eq!(sse.text.as_deref(), Some("hi"));

        let array_row = parse_stream_line(r#"{"text": "hi"},"#).unwrap();
        assert_eq!(array_row.text.as_deref(), Some("hi"));
    }
}
