//! Session Registry and engine facade.
//!
//! `StreamEngine` owns every live session, drives each one's transport, and
//! exposes the lifecycle calls callers use to walk a session through
//! session → prompt → content → teardown.

use crate::audio::{self, DrainSettings};
use crate::codec::{self, AudioInputConfig, AudioOutputConfig, TextConfig};
use crate::config::EngineConfig;
use crate::dispatch::{EventKind, HandlerKey, SessionEvent};
use crate::error::{StreamError, TransportError};
use crate::inbound::{self, InboundEvent};
use crate::protocol::ProtocolStage;
use crate::queue::wait_closed;
use crate::session::{Session, SessionOptions};
use crate::tools::{self, ToolInvocation, ToolStage};
use crate::transport::{self, InboundStream, InferenceTransport};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, error, info, info_span, warn};
use voicebridge_core::{PricingModel, TokenPricing, TokenUsage, ToolCatalog, ToolExecutor};

struct EngineInner {
    config: EngineConfig,
    transport: Arc<dyn InferenceTransport>,
    tool_executor: Option<Arc<dyn ToolExecutor>>,
    catalog: ToolCatalog,
    pricing: Arc<dyn PricingModel>,
    sessions: DashMap<String, Arc<Session>>,
    /// Ids whose teardown (graceful or forced) is running.
    teardown_in_progress: Mutex<HashSet<String>>,
}

/// The streaming protocol engine. Cheap to clone; clones share all sessions.
#[derive(Clone)]
pub struct StreamEngine {
    inner: Arc<EngineInner>,
}

pub struct StreamEngineBuilder {
    config: EngineConfig,
    transport: Arc<dyn InferenceTransport>,
    tool_executor: Option<Arc<dyn ToolExecutor>>,
    catalog: ToolCatalog,
    pricing: Arc<dyn PricingModel>,
}

impl StreamEngineBuilder {
    /// Executes tool calls requested by the model.
    pub fn tool_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.tool_executor = Some(executor);
        self
    }

    /// Supplies the tools advertised in each prompt start.
    pub fn catalog(mut self, catalog: ToolCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn pricing(mut self, pricing: Arc<dyn PricingModel>) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn build(self) -> StreamEngine {
        StreamEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                transport: self.transport,
                tool_executor: self.tool_executor,
                catalog: self.catalog,
                pricing: self.pricing,
                sessions: DashMap::new(),
                teardown_in_progress: Mutex::new(HashSet::new()),
            }),
        }
    }
}

/// Adds `key` to an object payload; other payloads are returned unchanged.
fn annotate(mut body: Value, key: &str, value: Value) -> Value {
    if let Value::Object(map) = &mut body {
        map.insert(key.to_string(), value);
    }
    body
}

impl StreamEngine {
    pub fn builder(config: EngineConfig, transport: Arc<dyn InferenceTransport>) -> StreamEngineBuilder {
        StreamEngineBuilder {
            config,
            transport,
            tool_executor: None,
            catalog: ToolCatalog::new(),
            pricing: Arc::new(TokenPricing::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn session(&self, session_id: &str) -> Result<Arc<Session>, StreamError> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StreamError::SessionNotFound(session_id.to_string()))
    }

    // --- Registry ---

    /// Registers a new session. With no id, a UUID is allocated.
    pub fn create_session(
        &self,
        session_id: Option<&str>,
        options: SessionOptions,
    ) -> Result<String, StreamError> {
        let id = session_id.map(str::to_string).unwrap_or_else(codec::new_name);
        match self.inner.sessions.entry(id.clone()) {
            Entry::Occupied(_) => Err(StreamError::SessionExists(id)),
            Entry::Vacant(slot) => {
                let session = Session::new(
                    id.clone(),
                    options,
                    &self.inner.config.inference,
                    self.inner.config.audio_buffer_capacity,
                );
                slot.insert(Arc::new(session));
                info!(session_id = %id, "Session created");
                Ok(id)
            }
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.inner
            .sessions
            .get(session_id)
            .is_some_and(|entry| entry.value().is_active())
    }

    pub fn active_session_ids(&self) -> Vec<String> {
        self.inner
            .sessions
            .iter()
            .filter(|entry| entry.value().is_active())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn last_activity_time(&self, session_id: &str) -> Option<Instant> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| entry.value().last_activity())
    }

    pub fn protocol_stage(&self, session_id: &str) -> Option<ProtocolStage> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| entry.value().stage())
    }

    pub fn tool_stage(&self, session_id: &str) -> Option<ToolStage> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| entry.value().tool_stage())
    }

    pub fn usage_totals(&self, session_id: &str) -> Option<TokenUsage> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| entry.value().usage_totals())
    }

    pub fn dropped_audio_chunks(&self, session_id: &str) -> Option<u64> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| entry.value().dropped_audio_chunks())
    }

    /// Registers a callback for one event kind, or for every event with
    /// [`HandlerKey::Any`]. A later registration under the same key replaces
    /// the earlier one.
    pub fn register_handler<F>(
        &self,
        session_id: &str,
        key: impl Into<HandlerKey>,
        handler: F,
    ) -> Result<(), StreamError>
    where
        F: Fn(&SessionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let session = self.session(session_id)?;
        session.register_handler(key.into(), Arc::new(handler));
        Ok(())
    }

    // --- Transport ---

    /// Opens the transport for a session and processes inbound messages until
    /// the stream ends, fails, or the session closes.
    pub async fn start(&self, session_id: &str) -> Result<(), StreamError> {
        let session = self.session(session_id)?;
        if !session.is_active() {
            return Err(StreamError::SessionInactive(session_id.to_string()));
        }
        if !session.claim_stream() {
            return Err(StreamError::AlreadyStreaming(session_id.to_string()));
        }

        let span = info_span!("sonic_session", session_id = %session_id);
        async {
            let settings = DrainSettings {
                batch_size: self.inner.config.audio_batch_size,
                backoff: self.inner.config.audio_backoff,
            };
            tokio::spawn(
                audio::drain_audio(session.clone(), settings)
                    .instrument(info_span!("audio_drain", session_id = %session_id)),
            );

            let outbound = transport::outbound_stream(session.clone());
            let inbound = match self.inner.transport.open(session_id, outbound).await {
                Ok(inbound) => inbound,
                Err(e) => {
                    self.fail_session(&session, &e);
                    return Err(StreamError::from(e));
                }
            };
            info!("Transport opened");
            self.run_inbound(&session, inbound).await;
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn run_inbound(&self, session: &Arc<Session>, mut inbound: InboundStream) {
        let mut closed = session.queue.subscribe_closed();
        loop {
            let item = tokio::select! {
                item = inbound.next() => item,
                _ = wait_closed(&mut closed) => {
                    debug!("Session closed, leaving inbound loop");
                    break;
                }
            };
            match item {
                Some(Ok(raw)) => {
                    session.touch();
                    match inbound::decode(&raw) {
                        Ok(event) => self.handle_inbound(session, event),
                        Err(e) => warn!(error = %e, "Skipping malformed inbound message"),
                    }
                }
                Some(Err(e)) => {
                    self.fail_session(session, &e);
                    break;
                }
                None => {
                    info!("Inbound stream completed");
                    session.dispatch(EventKind::StreamComplete, json!({}));
                    break;
                }
            }
        }
    }

    /// Reports a transport failure to the caller and force-closes the session.
    fn fail_session(&self, session: &Arc<Session>, e: &TransportError) {
        error!(session_id = %session.id, kind = e.kind(), error = %e, "Transport error");
        session.dispatch(
            EventKind::Error,
            json!({ "kind": e.kind(), "message": e.detail() }),
        );
        self.force_close_session(&session.id);
    }

    fn handle_inbound(&self, session: &Arc<Session>, event: InboundEvent) {
        match event {
            InboundEvent::Usage { body, usage } => {
                let totals = session.record_usage(&usage);
                let totals = serde_json::to_value(totals).unwrap_or_default();
                session.dispatch(EventKind::UsageEvent, annotate(body, "totals", totals));
            }
            InboundEvent::CompletionStart { body, marker } => {
                session.begin_turn(&marker.completion_id);
                session.dispatch(EventKind::CompletionStart, body);
            }
            InboundEvent::CompletionEnd { body, marker } => {
                let mut turn = session.end_turn(&marker.completion_id);
                turn.cost = Some(self.inner.pricing.cost_of(&turn.delta));
                debug!(
                    completion_id = %turn.completion_id,
                    input_tokens = turn.delta.total_input(),
                    output_tokens = turn.delta.total_output(),
                    "Turn completed"
                );
                let turn = serde_json::to_value(&turn).unwrap_or_default();
                session.dispatch(EventKind::CompletionEnd, annotate(body, "turnUsage", turn));
            }
            InboundEvent::ContentStart(body) => session.dispatch(EventKind::ContentStart, body),
            InboundEvent::TextOutput(body) => {
                let body = if inbound::is_barge_in(&body) {
                    debug!("Barge-in detected");
                    annotate(body, "bargeIn", Value::Bool(true))
                } else {
                    body
                };
                session.dispatch(EventKind::TextOutput, body);
            }
            InboundEvent::AudioOutput(body) => session.dispatch(EventKind::AudioOutput, body),
            InboundEvent::ToolUse { body, tool_use } => {
                info!(
                    tool_name = %tool_use.tool_name,
                    tool_use_id = %tool_use.tool_use_id,
                    "Tool use requested"
                );
                session.cache_tool_use(ToolInvocation::from(&tool_use));
                session.dispatch(EventKind::ToolUse, body);
            }
            InboundEvent::ToolContentEnd(_) => {
                if session.release_tool() {
                    let worker = tools::run_tool_worker(
                        session.clone(),
                        self.inner.tool_executor.clone(),
                        self.inner.config.tool_timeout,
                    );
                    tokio::spawn(
                        worker.instrument(info_span!("tool_round_trip", session_id = %session.id)),
                    );
                }
            }
            InboundEvent::ContentEnd(body) => session.dispatch(EventKind::ContentEnd, body),
            InboundEvent::Other { kind, body } => {
                let kind = EventKind::from_wire(&kind);
                if matches!(kind, EventKind::Other(_)) {
                    debug!(kind = %kind, "Unrecognized inbound event");
                }
                session.dispatch(kind, body);
            }
            InboundEvent::Unknown(body) => session.dispatch(EventKind::Unknown, body),
        }
    }

    // --- Lifecycle ---

    /// Enqueues `sessionStart`.
    pub async fn setup_session_start(&self, session_id: &str) -> Result<(), StreamError> {
        let session = self.session(session_id)?;
        session.start_session()?;
        debug!(session_id, "Session start enqueued");
        Ok(())
    }

    /// Enqueues `promptStart` advertising this session's tools, starting the
    /// session first if needed.
    pub async fn setup_prompt_start(
        &self,
        session_id: &str,
        audio_output: AudioOutputConfig,
    ) -> Result<(), StreamError> {
        let session = self.session(session_id)?;
        session.ensure_session_started()?;
        session.begin_prompt()?;

        let tools = self
            .inner
            .catalog
            .enumerate(&session.enabled_tools, &session.user_tools)
            .await;
        let event = codec::prompt_start(&session.prompt_name, &audio_output, &tools);
        session.complete_prompt(event)?;
        info!(session_id, tools = tools.len(), "Prompt started");
        Ok(())
    }

    /// Enqueues a system prompt, waiting for an in-flight prompt start.
    pub async fn setup_system_prompt(
        &self,
        session_id: &str,
        text_config: TextConfig,
        text: &str,
    ) -> Result<(), StreamError> {
        let session = self.session(session_id)?;
        let _pending = session.reserve_system_prompt();
        session
            .wait_for_stage(
                ProtocolStage::PromptActive,
                self.inner.config.prerequisite_timeout,
                |stage| stage >= ProtocolStage::PromptActive,
            )
            .await?;
        session.send_system_prompt(codec::system_prompt(&session.prompt_name, &text_config, text))?;
        debug!(session_id, "System prompt enqueued");
        Ok(())
    }

    /// Opens the audio content block, waiting for an in-flight prompt start
    /// and for system prompts issued earlier. Audio buffered before this
    /// point is flushed right after.
    pub async fn setup_start_audio(
        &self,
        session_id: &str,
        audio_input: AudioInputConfig,
    ) -> Result<(), StreamError> {
        let session = self.session(session_id)?;
        session
            .wait_for_stage(
                ProtocolStage::PromptActive,
                self.inner.config.prerequisite_timeout,
                |stage| stage >= ProtocolStage::PromptActive && session.system_prompts_pending() == 0,
            )
            .await?;
        let event = codec::audio_content_start(
            &session.prompt_name,
            &session.audio_content_name,
            &audio_input,
        );
        session.start_audio(event)?;
        info!(session_id, "Audio content started");
        Ok(())
    }

    /// Buffers one chunk of raw PCM audio for this session.
    pub fn stream_audio_chunk(&self, session_id: &str, chunk: Bytes) -> Result<(), StreamError> {
        self.session(session_id)?.buffer_audio(chunk)
    }

    async fn drain_pause(&self) {
        tokio::time::sleep(self.inner.config.drain_pause).await;
    }

    /// Closes the audio content block. Does nothing if audio never started.
    pub async fn send_content_end(&self, session_id: &str) -> Result<(), StreamError> {
        let session = self.session(session_id)?;
        if session.end_audio_content()? {
            debug!(session_id, "Content end enqueued");
            self.drain_pause().await;
        }
        Ok(())
    }

    /// Closes the prompt. Does nothing if no prompt was started.
    pub async fn send_prompt_end(&self, session_id: &str) -> Result<(), StreamError> {
        let session = self.session(session_id)?;
        if session.stage().prompt_in_flight() {
            session
                .wait_for_stage(
                    ProtocolStage::PromptActive,
                    self.inner.config.prerequisite_timeout,
                    |stage| !stage.prompt_in_flight(),
                )
                .await?;
        }
        if session.end_prompt()? {
            debug!(session_id, "Prompt end enqueued");
            self.drain_pause().await;
        }
        Ok(())
    }

    /// Ends the session, stops its streams and removes it from the registry.
    pub async fn send_session_end(&self, session_id: &str) -> Result<(), StreamError> {
        let session = self.session(session_id)?;
        if session.end_session()? {
            debug!(session_id, "Session end enqueued");
            self.drain_pause().await;
        }
        session.terminate(false);
        self.inner.sessions.remove(session_id);
        info!(session_id, "Session ended");
        Ok(())
    }

    // --- Teardown ---

    /// Marks `session_id` as tearing down. Returns false if a teardown is
    /// already running.
    fn begin_teardown(&self, session_id: &str) -> Result<bool, StreamError> {
        let mut in_progress = self.inner.teardown_in_progress.lock();
        if !self.inner.sessions.contains_key(session_id) {
            return Err(StreamError::SessionNotFound(session_id.to_string()));
        }
        Ok(in_progress.insert(session_id.to_string()))
    }

    fn end_teardown(&self, session_id: &str) {
        self.inner.teardown_in_progress.lock().remove(session_id);
    }

    /// Gracefully closes a session: content end, prompt end, session end,
    /// each followed by the drain pause. On failure the session is
    /// force-closed.
    pub async fn close_session(&self, session_id: &str) -> Result<(), StreamError> {
        if !self.begin_teardown(session_id)? {
            debug!(session_id, "Teardown already in progress");
            return Ok(());
        }

        let result = self.graceful_teardown(session_id).await;
        if let Err(e) = &result {
            warn!(session_id, error = %e, "Graceful close failed, forcing close");
            self.remove_now(session_id);
        }
        self.end_teardown(session_id);
        result
    }

    async fn graceful_teardown(&self, session_id: &str) -> Result<(), StreamError> {
        self.send_content_end(session_id).await?;
        self.send_prompt_end(session_id).await?;
        self.send_session_end(session_id).await
    }

    /// Deactivates and removes a session immediately, without sending any
    /// teardown messages. Returns false when the session is unknown or
    /// already being torn down.
    pub fn force_close_session(&self, session_id: &str) -> bool {
        match self.begin_teardown(session_id) {
            Ok(true) => {
                let removed = self.remove_now(session_id);
                self.end_teardown(session_id);
                if removed {
                    info!(session_id, "Session force-closed");
                }
                removed
            }
            Ok(false) => {
                debug!(session_id, "Teardown already in progress, skipping forced close");
                false
            }
            Err(_) => false,
        }
    }

    fn remove_now(&self, session_id: &str) -> bool {
        match self.inner.sessions.remove(session_id) {
            Some((_, session)) => {
                session.terminate(true);
                true
            }
            None => false,
        }
    }

    /// Gracefully closes every live session.
    pub async fn close_all_sessions(&self) {
        let ids: Vec<String> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        info!(count = ids.len(), "Closing all sessions");
        let closes = ids.iter().map(|id| async move {
            if let Err(e) = self.close_session(id).await {
                warn!(session_id = %id, error = %e, "Failed to close session");
            }
        });
        futures::future::join_all(closes).await;
    }

    // --- Reaper ---

    /// Force-closes every session idle for longer than the configured
    /// timeout and returns their ids.
    pub fn reap_idle_sessions(&self) -> Vec<String> {
        let timeout = self.inner.config.idle_timeout;
        let idle: Vec<String> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = Vec::with_capacity(idle.len());
        for id in idle {
            warn!(session_id = %id, "Session idle past timeout, closing");
            if self.force_close_session(&id) {
                reaped.push(id);
            }
        }
        reaped
    }

    /// Spawns the background sweep. The task stops once every clone of the
    /// engine has been dropped.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // The first tick completes immediately.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(inner) = engine.upgrade() else {
                        debug!("Engine dropped, stopping reaper");
                        break;
                    };
                    let reaped = StreamEngine { inner }.reap_idle_sessions();
                    if !reaped.is_empty() {
                        info!(count = reaped.len(), "Reaped idle sessions");
                    }
                }
            }
            .instrument(info_span!("session_reaper")),
        )
    }
}
