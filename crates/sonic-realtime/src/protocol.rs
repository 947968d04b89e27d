//! Protocol State Machine
//!
//! The inference service rejects control messages that arrive out of order, so
//! every lifecycle call is checked against the session's current stage before
//! anything is enqueued. Stages only move forward; `Ended` is terminal.

/// Where a session is in the session → prompt → content → teardown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolStage {
    /// Created, nothing sent yet.
    Idle,
    /// `sessionStart` enqueued.
    SessionStarted,
    /// A prompt start is being assembled; later lifecycle calls wait on it.
    PromptStarting,
    /// `promptStart` enqueued; system prompts and audio start are allowed.
    PromptActive,
    /// Audio `contentStart` enqueued; audio input may flow.
    AudioActive,
    /// Audio `contentEnd` enqueued, prompt still open.
    ClosingContent,
    /// `promptEnd` enqueued.
    ClosingPrompt,
    /// `sessionEnd` enqueued, waiting for the transport to drain.
    ClosingSession,
    /// Torn down. No further outbound messages.
    Ended,
}

/// A lifecycle step that moves a session to its next stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    StartSession,
    BeginPrompt,
    CompletePrompt,
    StartAudio,
    EndContent,
    EndPrompt,
    EndSession,
    Terminate,
}

impl ProtocolStage {
    /// Returns the stage reached by applying `step`, or `None` when the step is
    /// not legal from this stage.
    pub fn advance(self, step: Lifecycle) -> Option<ProtocolStage> {
        use Lifecycle::*;
        use ProtocolStage::*;

        match (self, step) {
            (_, Terminate) => Some(Ended),
            (Idle, StartSession) => Some(SessionStarted),
            (SessionStarted, BeginPrompt) => Some(PromptStarting),
            (PromptStarting, CompletePrompt) => Some(PromptActive),
            (PromptActive, StartAudio) => Some(AudioActive),
            (AudioActive, EndContent) => Some(ClosingContent),
            (PromptActive | ClosingContent, EndPrompt) => Some(ClosingPrompt),
            (SessionStarted | ClosingPrompt, EndSession) => Some(ClosingSession),
            _ => None,
        }
    }

    /// `sessionStart` has been sent and `sessionEnd` has not.
    pub fn session_started(self) -> bool {
        matches!(
            self,
            ProtocolStage::SessionStarted
                | ProtocolStage::PromptStarting
                | ProtocolStage::PromptActive
                | ProtocolStage::AudioActive
                | ProtocolStage::ClosingContent
                | ProtocolStage::ClosingPrompt
        )
    }

    /// `promptStart` has been sent and `promptEnd` has not.
    pub fn prompt_started(self) -> bool {
        matches!(
            self,
            ProtocolStage::PromptActive | ProtocolStage::AudioActive | ProtocolStage::ClosingContent
        )
    }

    /// Audio `contentStart` has been sent and its `contentEnd` has not.
    pub fn audio_content_started(self) -> bool {
        self == ProtocolStage::AudioActive
    }

    pub fn prompt_in_flight(self) -> bool {
        self == ProtocolStage::PromptStarting
    }

    /// Tool results belong to the open prompt.
    pub fn accepts_tool_result(self) -> bool {
        self.prompt_started()
    }

    pub fn is_terminal(self) -> bool {
        self == ProtocolStage::Ended
    }
}
