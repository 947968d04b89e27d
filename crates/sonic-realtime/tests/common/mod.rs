//! Shared fixtures for the engine integration tests: a transport that records
//! everything the engine sends and lets the test script what comes back, and
//! a tool executor that counts its calls.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sonic_realtime::{
    EngineConfig, InboundStream, InferenceTransport, OutboundStream, SessionEvent, TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use voicebridge_core::{ToolError, ToolExecutor};

pub type InboundSender = mpsc::UnboundedSender<Result<Bytes, TransportError>>;

/// Records outbound messages as parsed JSON and replays scripted inbound ones.
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<Value>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Result<Bytes, TransportError>>>>,
}

impl RecordingTransport {
    pub fn new() -> (Arc<Self>, InboundSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            inbound: Mutex::new(Some(rx)),
        });
        (transport, tx)
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    /// The event kind of every recorded outbound message, in order.
    pub fn kinds(&self) -> Vec<String> {
        self.sent.lock().iter().map(event_kind).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().iter().filter(|k| k.as_str() == kind).count()
    }

    /// Bodies of every recorded message of `kind`.
    pub fn bodies(&self, kind: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|message| message["event"].get(kind).cloned())
            .collect()
    }
}

#[async_trait]
impl InferenceTransport for RecordingTransport {
    async fn open(
        &self,
        _session_id: &str,
        mut outbound: OutboundStream,
    ) -> Result<InboundStream, TransportError> {
        let rx = self
            .inbound
            .lock()
            .take()
            .ok_or_else(|| TransportError::Stream("transport already opened".into()))?;

        let sent = self.sent.clone();
        tokio::spawn(async move {
            while let Some(bytes) = outbound.next().await {
                let message: Value = serde_json::from_slice(&bytes).expect("engine sent invalid JSON");
                sent.lock().push(message);
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

pub fn event_kind(message: &Value) -> String {
    message["event"]
        .as_object()
        .and_then(|event| event.keys().next().cloned())
        .unwrap_or_default()
}

/// Wraps an inbound event body in its envelope.
pub fn inbound(kind: &str, body: Value) -> Result<Bytes, TransportError> {
    let message = json!({ "event": { kind: body } });
    Ok(Bytes::from(serde_json::to_vec(&message).unwrap()))
}

/// Short pauses and timeouts so tests run quickly.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        drain_pause: Duration::from_millis(5),
        prerequisite_timeout: Duration::from_secs(2),
        tool_timeout: Duration::from_secs(2),
        audio_backoff: Duration::from_millis(2),
        ..EngineConfig::default()
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Collects delivered events for later inspection.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<SessionEvent>>>);

impl EventLog {
    pub fn handler(&self) -> impl Fn(&SessionEvent) -> anyhow::Result<()> + Send + Sync + 'static {
        let log = self.0.clone();
        move |event: &SessionEvent| {
            log.lock().push(event.clone());
            Ok(())
        }
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// Returns a fixed result, or an error, and remembers every call.
pub struct FakeToolExecutor {
    result: Result<Value, String>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl FakeToolExecutor {
    pub fn returning(result: Value) -> Arc<Self> {
        Arc::new(Self {
            result: Ok(result),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Err(message.to_string()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ToolExecutor for FakeToolExecutor {
    async fn execute(&self, tool_name: &str, payload: Value) -> Result<Value, ToolError> {
        self.calls.lock().push((tool_name.to_string(), payload));
        self.result.clone().map_err(|message| ToolError::Failed {
            name: tool_name.to_string(),
            message,
        })
    }
}
