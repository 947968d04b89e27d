//! Inbound Dispatcher
//!
//! Caller-facing notifications are delivered through a per-session handler
//! table: one handler per event kind plus an optional catch-all. A handler
//! that fails or panics is logged and never stops delivery to the others.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{error, warn};

/// The kinds of notification a caller can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    UsageEvent,
    CompletionStart,
    CompletionEnd,
    ContentStart,
    TextOutput,
    AudioOutput,
    ToolUse,
    ToolResult,
    ContentEnd,
    Error,
    StreamComplete,
    /// An inbound event key the engine does not model, by wire name.
    Other(String),
    /// An inbound message with an empty event envelope.
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::UsageEvent => "usageEvent",
            EventKind::CompletionStart => "completionStart",
            EventKind::CompletionEnd => "completionEnd",
            EventKind::ContentStart => "contentStart",
            EventKind::TextOutput => "textOutput",
            EventKind::AudioOutput => "audioOutput",
            EventKind::ToolUse => "toolUse",
            EventKind::ToolResult => "toolResult",
            EventKind::ContentEnd => "contentEnd",
            EventKind::Error => "error",
            EventKind::StreamComplete => "streamComplete",
            EventKind::Other(name) => name,
            EventKind::Unknown => "unknown",
        }
    }

    /// The kind an inbound wire name is delivered under. Names of modelled
    /// kinds map onto that kind; anything else stays `Other`.
    pub fn from_wire(name: &str) -> EventKind {
        match name {
            "usageEvent" => EventKind::UsageEvent,
            "completionStart" => EventKind::CompletionStart,
            "completionEnd" => EventKind::CompletionEnd,
            "contentStart" => EventKind::ContentStart,
            "textOutput" => EventKind::TextOutput,
            "audioOutput" => EventKind::AudioOutput,
            "toolUse" => EventKind::ToolUse,
            "toolResult" => EventKind::ToolResult,
            "contentEnd" => EventKind::ContentEnd,
            "error" => EventKind::Error,
            "streamComplete" => EventKind::StreamComplete,
            "unknown" => EventKind::Unknown,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification delivered to caller handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub session_id: String,
    pub kind: EventKind,
    pub data: Value,
}

pub type EventHandler = Arc<dyn Fn(&SessionEvent) -> anyhow::Result<()> + Send + Sync>;

/// Where a handler is registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerKey {
    Kind(EventKind),
    /// Receives every event, in addition to any kind-specific handler.
    Any,
}

impl From<EventKind> for HandlerKey {
    fn from(kind: EventKind) -> Self {
        HandlerKey::Kind(kind)
    }
}

#[derive(Default)]
pub(crate) struct HandlerTable {
    by_kind: HashMap<EventKind, EventHandler>,
    any: Option<EventHandler>,
}

impl HandlerTable {
    /// Registers `handler`, replacing any previous handler under the same key.
    pub(crate) fn register(&mut self, key: HandlerKey, handler: EventHandler) {
        match key {
            HandlerKey::Kind(kind) => {
                self.by_kind.insert(kind, handler);
            }
            HandlerKey::Any => self.any = Some(handler),
        }
    }

    /// The handlers an event of `kind` should reach, kind-specific first.
    pub(crate) fn targets(&self, kind: &EventKind) -> Vec<EventHandler> {
        self.by_kind
            .get(kind)
            .into_iter()
            .chain(self.any.as_ref())
            .cloned()
            .collect()
    }
}

/// Invokes each handler in turn, containing errors and panics per handler.
pub(crate) fn deliver(handlers: &[EventHandler], event: &SessionEvent) {
    for handler in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                session_id = %event.session_id,
                kind = %event.kind,
                error = ?e,
                "Event handler returned an error"
            ),
            Err(_) => error!(
                session_id = %event.session_id,
                kind = %event.kind,
                "Event handler panicked"
            ),
        }
    }
}
