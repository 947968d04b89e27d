//! Outbound Event Codec
//!
//! Typed builders for every message the engine sends to the inference service.
//! Each builder is pure; the only allocation of note is the fresh content name
//! generated for tool results and system prompts.
//!
//! On the wire every message is wrapped as `{"event": {"<kind>": {...}}}`.

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use voicebridge_core::ToolSpec;

/// Allocates a fresh opaque prompt or content name.
pub fn new_name() -> String {
    Uuid::new_v4().to_string()
}

// --- Configuration blocks ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    pub max_tokens: u32,
    pub top_p: f32,
    pub temperature: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            top_p: 0.9,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextConfig {
    pub media_type: String,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            media_type: "text/plain".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioOutputConfig {
    pub media_type: String,
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u16,
    pub channel_count: u16,
    pub voice_id: String,
    pub encoding: String,
    pub audio_type: String,
}

impl Default for AudioOutputConfig {
    fn default() -> Self {
        Self {
            media_type: "audio/lpcm".to_string(),
            sample_rate_hertz: 24000,
            sample_size_bits: 16,
            channel_count: 1,
            voice_id: "matthew".to_string(),
            encoding: "base64".to_string(),
            audio_type: "SPEECH".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInputConfig {
    pub media_type: String,
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u16,
    pub channel_count: u16,
    pub audio_type: String,
    pub encoding: String,
}

impl Default for AudioInputConfig {
    fn default() -> Self {
        Self {
            media_type: "audio/lpcm".to_string(),
            sample_rate_hertz: 16000,
            sample_size_bits: 16,
            channel_count: 1,
            audio_type: "SPEECH".to_string(),
            encoding: "base64".to_string(),
        }
    }
}

// --- Wire records ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentType {
    Text,
    Audio,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    System,
    User,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStart {
    pub inference_configuration: InferenceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaType {
    pub media_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSchema {
    /// The JSON schema, itself serialized as a string.
    pub json: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEntry {
    pub tool_spec: WireToolSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolConfiguration {
    pub tools: Vec<ToolEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptStart {
    pub prompt_name: String,
    pub text_output_configuration: TextConfig,
    pub audio_output_configuration: AudioOutputConfig,
    pub tool_use_output_configuration: MediaType,
    pub tool_configuration: ToolConfiguration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultInputConfig {
    pub tool_use_id: String,
    #[serde(rename = "type")]
    pub kind: ContentType,
    pub text_input_configuration: TextConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStart {
    pub prompt_name: String,
    pub content_name: String,
    #[serde(rename = "type")]
    pub kind: ContentType,
    pub interactive: bool,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_input_configuration: Option<TextConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_input_configuration: Option<AudioInputConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result_input_configuration: Option<ToolResultInputConfig>,
}

/// Payload carried inside one content block (text, base64 audio, tool result).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentChunk {
    pub prompt_name: String,
    pub content_name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentEnd {
    pub prompt_name: String,
    pub content_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptEnd {
    pub prompt_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEnd {}

/// One outbound protocol message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OutboundEvent {
    SessionStart(SessionStart),
    PromptStart(PromptStart),
    ContentStart(ContentStart),
    TextInput(ContentChunk),
    AudioInput(ContentChunk),
    ToolResult(ContentChunk),
    ContentEnd(ContentEnd),
    PromptEnd(PromptEnd),
    SessionEnd(SessionEnd),
}

impl OutboundEvent {
    /// Wire name of the event, as it appears inside the envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::SessionStart(_) => "sessionStart",
            OutboundEvent::PromptStart(_) => "promptStart",
            OutboundEvent::ContentStart(_) => "contentStart",
            OutboundEvent::TextInput(_) => "textInput",
            OutboundEvent::AudioInput(_) => "audioInput",
            OutboundEvent::ToolResult(_) => "toolResult",
            OutboundEvent::ContentEnd(_) => "contentEnd",
            OutboundEvent::PromptEnd(_) => "promptEnd",
            OutboundEvent::SessionEnd(_) => "sessionEnd",
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    event: &'a OutboundEvent,
}

/// Serializes one event into its `{"event": {...}}` envelope.
pub fn encode(event: &OutboundEvent) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(&Envelope { event }).map(Bytes::from)
}

// --- Builders ---

pub fn session_start(inference: &InferenceConfig) -> OutboundEvent {
    OutboundEvent::SessionStart(SessionStart {
        inference_configuration: inference.clone(),
    })
}

/// Builds `promptStart`, advertising `tools` in the given order.
pub fn prompt_start(prompt_name: &str, audio: &AudioOutputConfig, tools: &[ToolSpec]) -> OutboundEvent {
    let tools = tools
        .iter()
        .map(|tool| ToolEntry {
            tool_spec: WireToolSpec {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: InputSchema {
                    json: tool.input_schema.to_string(),
                },
            },
        })
        .collect();

    OutboundEvent::PromptStart(PromptStart {
        prompt_name: prompt_name.to_string(),
        text_output_configuration: TextConfig::default(),
        audio_output_configuration: audio.clone(),
        tool_use_output_configuration: MediaType {
            media_type: "application/json".to_string(),
        },
        tool_configuration: ToolConfiguration { tools },
    })
}

/// Builds the system prompt triplet: content start, text input, content end.
pub fn system_prompt(prompt_name: &str, text_config: &TextConfig, text: &str) -> [OutboundEvent; 3] {
    let content_name = new_name();
    [
        OutboundEvent::ContentStart(ContentStart {
            prompt_name: prompt_name.to_string(),
            content_name: content_name.clone(),
            kind: ContentType::Text,
            interactive: true,
            role: Role::System,
            text_input_configuration: Some(text_config.clone()),
            audio_input_configuration: None,
            tool_result_input_configuration: None,
        }),
        OutboundEvent::TextInput(ContentChunk {
            prompt_name: prompt_name.to_string(),
            content_name: content_name.clone(),
            content: text.to_string(),
        }),
        content_end(prompt_name, &content_name),
    ]
}

pub fn audio_content_start(prompt_name: &str, content_name: &str, audio: &AudioInputConfig) -> OutboundEvent {
    OutboundEvent::ContentStart(ContentStart {
        prompt_name: prompt_name.to_string(),
        content_name: content_name.to_string(),
        kind: ContentType::Audio,
        interactive: true,
        role: Role::User,
        text_input_configuration: None,
        audio_input_configuration: Some(audio.clone()),
        tool_result_input_configuration: None,
    })
}

/// Builds one `audioInput` message, base64-encoding the raw PCM bytes.
pub fn audio_input(prompt_name: &str, content_name: &str, pcm: &[u8]) -> OutboundEvent {
    OutboundEvent::AudioInput(ContentChunk {
        prompt_name: prompt_name.to_string(),
        content_name: content_name.to_string(),
        content: base64::engine::general_purpose::STANDARD.encode(pcm),
    })
}

pub fn content_end(prompt_name: &str, content_name: &str) -> OutboundEvent {
    OutboundEvent::ContentEnd(ContentEnd {
        prompt_name: prompt_name.to_string(),
        content_name: content_name.to_string(),
    })
}

/// Reduces a tool's return value to the single text payload sent back.
///
/// A non-empty array contributes its first element; text is used verbatim;
/// anything else is serialized whole.
pub fn tool_result_text(value: &Value) -> String {
    match value {
        Value::Array(items) if !items.is_empty() => match &items[0] {
            Value::String(text) => text.clone(),
            first => first.to_string(),
        },
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Builds the tool result triplet under a freshly allocated content name.
pub fn tool_result(prompt_name: &str, tool_use_id: &str, result: &Value) -> [OutboundEvent; 3] {
    let content_name = new_name();
    [
        OutboundEvent::ContentStart(ContentStart {
            prompt_name: prompt_name.to_string(),
            content_name: content_name.clone(),
            kind: ContentType::Tool,
            interactive: false,
            role: Role::Tool,
            text_input_configuration: None,
            audio_input_configuration: None,
            tool_result_input_configuration: Some(ToolResultInputConfig {
                tool_use_id: tool_use_id.to_string(),
                kind: ContentType::Text,
                text_input_configuration: TextConfig::default(),
            }),
        }),
        OutboundEvent::ToolResult(ContentChunk {
            prompt_name: prompt_name.to_string(),
            content_name: content_name.clone(),
            content: tool_result_text(result),
        }),
        content_end(prompt_name, &content_name),
    ]
}

pub fn prompt_end(prompt_name: &str) -> OutboundEvent {
    OutboundEvent::PromptEnd(PromptEnd {
        prompt_name: prompt_name.to_string(),
    })
}

pub fn session_end() -> OutboundEvent {
    OutboundEvent::SessionEnd(SessionEnd {})
}
