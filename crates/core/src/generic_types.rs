use serde::{Deserialize, Serialize};

/// Running token counters for one session, split by modality and direction.
///
/// The inference service reports speech and text tokens separately for both
/// the input and output side. Every accounting operation in the engine works
/// component-wise over these four counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_speech: u64,
    pub input_text: u64,
    pub output_speech: u64,
    pub output_text: u64,
}

impl TokenUsage {
    pub fn new(input_speech: u64, input_text: u64, output_speech: u64, output_text: u64) -> Self {
        Self {
            input_speech,
            input_text,
            output_speech,
            output_text,
        }
    }

    /// Component-wise `self - earlier`, clamped at zero for each counter.
    pub fn saturating_sub(&self, earlier: &TokenUsage) -> TokenUsage {
        TokenUsage {
            input_speech: self.input_speech.saturating_sub(earlier.input_speech),
            input_text: self.input_text.saturating_sub(earlier.input_text),
            output_speech: self.output_speech.saturating_sub(earlier.output_speech),
            output_text: self.output_text.saturating_sub(earlier.output_text),
        }
    }

    /// Component-wise addition, saturating at `u64::MAX`.
    pub fn saturating_add(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            input_speech: self.input_speech.saturating_add(other.input_speech),
            input_text: self.input_text.saturating_add(other.input_text),
            output_speech: self.output_speech.saturating_add(other.output_speech),
            output_text: self.output_text.saturating_add(other.output_text),
        }
    }

    pub fn total_input(&self) -> u64 {
        self.input_speech.saturating_add(self.input_text)
    }

    pub fn total_output(&self) -> u64 {
        self.output_speech.saturating_add(self.output_text)
    }

    pub fn is_zero(&self) -> bool {
        *self == TokenUsage::default()
    }
}

/// Description of one tool the model may invoke during a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's input object.
    pub input_schema: serde_json::Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}
