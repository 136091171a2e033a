//! SSE framing: one `data: <json>\n\n` record per stream event.

use bytes::Bytes;
use serde_json::Value;

use crate::events::UiStreamEvent;

/// Serialize one event as an SSE data frame.
pub fn sse_frame(event: &UiStreamEvent) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_string(event)?;
    Ok(Bytes::from(format!("data: {json}\n\n")))
}

/// Outcome of parsing one incoming SSE payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    Event(UiStreamEvent),
    /// Legacy `[DONE]` sentinel; stream end itself is the real signal.
    Done,
    /// Valid JSON that is not a known record type; passed through so new
    /// record types never break old consumers.
    Unknown(Value),
}

/// Parse one SSE data payload (the text after `data:`).
pub fn parse_frame(payload: &str) -> Result<ParsedFrame, serde_json::Error> {
    let trimmed = payload.trim();
    if trimmed == "[DONE]" {
        return Ok(ParsedFrame::Done);
    }
    let value: Value = serde_json::from_str(trimmed)?;
    match serde_json::from_value::<UiStreamEvent>(value.clone()) {
        Ok(event) => Ok(ParsedFrame::Event(event)),
        Err(_) => Ok(ParsedFrame::Unknown(value)),
    }
}

/// Parse one raw SSE line. Lines without a `data:` prefix (blank
/// separators, comments) yield `None`.
pub fn parse_sse_line(line: &str) -> Result<Option<ParsedFrame>, serde_json::Error> {
    match line.strip_prefix("data:") {
        Some(payload) => parse_frame(payload).map(Some),
        None => Ok(None),
    }
}
