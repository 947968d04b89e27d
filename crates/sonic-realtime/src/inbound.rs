//! Inbound message decoding and classification.
//!
//! Inbound messages arrive as `{"event": {"<kind>": {...}}}`. Classification
//! looks at which key is present, in a fixed priority order, so a message that
//! carries several keys is always routed the same way.

use crate::error::DecodeError;
use serde::Deserialize;
use serde_json::{Map, Value};
use voicebridge_core::TokenUsage;

/// The text content the service emits when the user talks over the model.
const BARGE_IN_MARKER: &str = "{ \"interrupted\" : true }";

/// Speech/text token counts for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenCounts {
    pub speech_tokens: u64,
    pub text_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct UsageBreakdown {
    pub input: TokenCounts,
    pub output: TokenCounts,
}

impl UsageBreakdown {
    pub fn to_usage(&self) -> TokenUsage {
        TokenUsage::new(
            self.input.speech_tokens,
            self.input.text_tokens,
            self.output.speech_tokens,
            self.output.text_tokens,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct UsageDetails {
    pub delta: Option<UsageBreakdown>,
    pub total: Option<UsageBreakdown>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageEvent {
    pub completion_id: Option<String>,
    pub details: UsageDetails,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMarker {
    pub completion_id: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    pub tool_name: String,
    pub tool_use_id: String,
    /// JSON-encoded tool input, as sent by the model.
    #[serde(default)]
    pub content: String,
}

impl ToolUse {
    /// The decoded tool input; content that is not JSON is passed as a string.
    pub fn payload(&self) -> Value {
        if self.content.trim().is_empty() {
            return Value::Object(Map::new());
        }
        serde_json::from_str(&self.content).unwrap_or_else(|_| Value::String(self.content.clone()))
    }
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Usage { body: Value, usage: UsageEvent },
    CompletionStart { body: Value, marker: CompletionMarker },
    CompletionEnd { body: Value, marker: CompletionMarker },
    ContentStart(Value),
    TextOutput(Value),
    AudioOutput(Value),
    ToolUse { body: Value, tool_use: ToolUse },
    /// `contentEnd` of type `TOOL`; releases a cached tool invocation.
    ToolContentEnd(Value),
    ContentEnd(Value),
    /// The first key, in wire order, that the engine does not classify.
    Other { kind: String, body: Value },
    /// An empty event envelope.
    Unknown(Value),
}

fn typed<T: for<'de> Deserialize<'de>>(kind: &'static str, body: &Value) -> Result<T, DecodeError> {
    serde_json::from_value(body.clone()).map_err(|source| DecodeError::Malformed { kind, source })
}

/// Parses raw bytes and classifies the message.
pub fn decode(raw: &[u8]) -> Result<InboundEvent, DecodeError> {
    let value: Value = serde_json::from_slice(raw)?;
    classify(&value)
}

/// Classifies an already-parsed message envelope.
pub fn classify(message: &Value) -> Result<InboundEvent, DecodeError> {
    let event = message
        .get("event")
        .and_then(Value::as_object)
        .ok_or(DecodeError::MissingEnvelope)?;

    if let Some(body) = event.get("usageEvent") {
        return Ok(InboundEvent::Usage {
            body: body.clone(),
            usage: typed("usageEvent", body)?,
        });
    }
    if let Some(body) = event.get("completionStart") {
        return Ok(InboundEvent::CompletionStart {
            body: body.clone(),
            marker: typed("completionStart", body)?,
        });
    }
    if let Some(body) = event.get("completionEnd") {
        return Ok(InboundEvent::CompletionEnd {
            body: body.clone(),
            marker: typed("completionEnd", body)?,
        });
    }
    if let Some(body) = event.get("contentStart") {
        return Ok(InboundEvent::ContentStart(body.clone()));
    }
    if let Some(body) = event.get("textOutput") {
        return Ok(InboundEvent::TextOutput(body.clone()));
    }
    if let Some(body) = event.get("audioOutput") {
        return Ok(InboundEvent::AudioOutput(body.clone()));
    }
    if let Some(body) = event.get("toolUse") {
        return Ok(InboundEvent::ToolUse {
            body: body.clone(),
            tool_use: typed("toolUse", body)?,
        });
    }
    if let Some(body) = event.get("contentEnd") {
        if body.get("type").and_then(Value::as_str) == Some("TOOL") {
            return Ok(InboundEvent::ToolContentEnd(body.clone()));
        }
        return Ok(InboundEvent::ContentEnd(body.clone()));
    }
    match event.iter().next() {
        Some((kind, body)) => Ok(InboundEvent::Other {
            kind: kind.clone(),
            body: body.clone(),
        }),
        None => Ok(InboundEvent::Unknown(Value::Object(event.clone()))),
    }
}

/// True when a `textOutput` body is the barge-in marker.
pub fn is_barge_in(text_output: &Value) -> bool {
    text_output
        .get("content")
        .and_then(Value::as_str)
        .is_some_and(|content| content.trim() == BARGE_IN_MARKER)
}
