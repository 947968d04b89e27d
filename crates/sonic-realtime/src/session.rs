//! Per-session state.
//!
//! Everything that mutates protocol state (the active flag, the stage, the
//! tool queue, the usage counters and the audio buffer) sits behind a single
//! lock, and every outbound enqueue happens while that lock is held. That is
//! what keeps a stage check and the enqueue it guards atomic with respect to
//! a concurrent teardown.

use crate::audio::{AudioBuffer, Flush};
use crate::codec::{self, InferenceConfig, OutboundEvent};
use crate::dispatch::{EventHandler, EventKind, HandlerKey, HandlerTable, SessionEvent, deliver};
use crate::error::StreamError;
use crate::inbound::UsageEvent;
use crate::protocol::{Lifecycle, ProtocolStage};
use crate::queue::OutboundQueue;
use crate::tools::{ToolInvocation, ToolQueue, ToolStage};
use crate::usage::{TurnUsage, UsageTracker};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, warn};
use voicebridge_core::{EnabledTools, TokenUsage, UserTool};

/// Per-session choices made by the caller at creation time.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Overrides the engine's default inference parameters.
    pub inference: Option<InferenceConfig>,
    /// Filters the built-in and external tool sources.
    pub enabled_tools: EnabledTools,
    pub user_tools: Vec<UserTool>,
}

struct SessionState {
    active: bool,
    tools: ToolQueue,
    usage: UsageTracker,
    audio: AudioBuffer,
}

pub(crate) struct Session {
    pub(crate) id: String,
    pub(crate) inference: InferenceConfig,
    pub(crate) enabled_tools: EnabledTools,
    pub(crate) user_tools: Vec<UserTool>,
    pub(crate) prompt_name: String,
    pub(crate) audio_content_name: String,
    pub(crate) queue: OutboundQueue,
    /// Wakes the audio drain loop.
    pub(crate) audio_ready: Notify,
    state: Mutex<SessionState>,
    stage: watch::Sender<ProtocolStage>,
    handlers: RwLock<HandlerTable>,
    last_activity: Mutex<Instant>,
    streaming: AtomicBool,
    /// System prompts issued but not yet enqueued. Audio start waits for
    /// these so it cannot overtake them.
    pending_system_prompts: AtomicUsize,
}

/// Marks one system prompt as in flight until dropped.
pub(crate) struct PendingSystemPrompt<'a> {
    session: &'a Session,
}

impl Drop for PendingSystemPrompt<'_> {
    fn drop(&mut self) {
        self.session.pending_system_prompts.fetch_sub(1, Ordering::SeqCst);
        // Re-run stage waiters so audio start sees the new count.
        self.session.stage.send_modify(|_| {});
    }
}

impl Session {
    pub(crate) fn new(
        id: String,
        options: SessionOptions,
        default_inference: &InferenceConfig,
        audio_capacity: usize,
    ) -> Self {
        let (stage, _) = watch::channel(ProtocolStage::Idle);
        Self {
            id,
            inference: options.inference.unwrap_or_else(|| default_inference.clone()),
            enabled_tools: options.enabled_tools,
            user_tools: options.user_tools,
            prompt_name: codec::new_name(),
            audio_content_name: codec::new_name(),
            queue: OutboundQueue::new(),
            audio_ready: Notify::new(),
            state: Mutex::new(SessionState {
                active: true,
                tools: ToolQueue::default(),
                usage: UsageTracker::new(),
                audio: AudioBuffer::new(audio_capacity),
            }),
            stage,
            handlers: RwLock::new(HandlerTable::default()),
            last_activity: Mutex::new(Instant::now()),
            streaming: AtomicBool::new(false),
            pending_system_prompts: AtomicUsize::new(0),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub(crate) fn stage(&self) -> ProtocolStage {
        *self.stage.borrow()
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub(crate) fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Claims the transport for this session. Returns false if it was
    /// already claimed.
    pub(crate) fn claim_stream(&self) -> bool {
        !self.streaming.swap(true, Ordering::SeqCst)
    }

    fn inactive(&self) -> StreamError {
        StreamError::SessionInactive(self.id.clone())
    }

    fn invalid(&self, action: &'static str, stage: ProtocolStage) -> StreamError {
        StreamError::InvalidStage {
            id: self.id.clone(),
            action,
            stage,
        }
    }

    /// Checks `step` against the current stage and, if legal, enqueues
    /// `events` and moves to the next stage. Caller holds the state lock.
    fn apply_locked<I>(
        &self,
        state: &SessionState,
        step: Lifecycle,
        action: &'static str,
        events: I,
    ) -> Result<ProtocolStage, StreamError>
    where
        I: IntoIterator<Item = OutboundEvent>,
    {
        if !state.active {
            return Err(self.inactive());
        }
        let current = self.stage();
        let next = current
            .advance(step)
            .ok_or_else(|| self.invalid(action, current))?;
        self.queue.push_all(events);
        self.stage.send_replace(next);
        debug!(session_id = %self.id, from = ?current, to = ?next, "Protocol stage advanced");
        Ok(next)
    }

    fn apply<I>(&self, step: Lifecycle, action: &'static str, events: I) -> Result<ProtocolStage, StreamError>
    where
        I: IntoIterator<Item = OutboundEvent>,
    {
        let state = self.state.lock();
        let next = self.apply_locked(&state, step, action, events)?;
        drop(state);
        self.touch();
        Ok(next)
    }

    pub(crate) fn start_session(&self) -> Result<(), StreamError> {
        let event = codec::session_start(&self.inference);
        self.apply(Lifecycle::StartSession, "start the session", [event])?;
        Ok(())
    }

    /// Starts the session if nothing has been sent yet; otherwise does nothing.
    pub(crate) fn ensure_session_started(&self) -> Result<(), StreamError> {
        let state = self.state.lock();
        if self.stage() != ProtocolStage::Idle {
            return Ok(());
        }
        let event = codec::session_start(&self.inference);
        self.apply_locked(&state, Lifecycle::StartSession, "start the session", [event])?;
        drop(state);
        self.touch();
        Ok(())
    }

    pub(crate) fn begin_prompt(&self) -> Result<(), StreamError> {
        self.apply(Lifecycle::BeginPrompt, "start a prompt", [])?;
        Ok(())
    }

    pub(crate) fn complete_prompt(&self, prompt_start: OutboundEvent) -> Result<(), StreamError> {
        self.apply(Lifecycle::CompletePrompt, "start a prompt", [prompt_start])?;
        Ok(())
    }

    pub(crate) fn reserve_system_prompt(&self) -> PendingSystemPrompt<'_> {
        self.pending_system_prompts.fetch_add(1, Ordering::SeqCst);
        PendingSystemPrompt { session: self }
    }

    pub(crate) fn system_prompts_pending(&self) -> usize {
        self.pending_system_prompts.load(Ordering::SeqCst)
    }

    pub(crate) fn send_system_prompt(&self, events: [OutboundEvent; 3]) -> Result<(), StreamError> {
        let state = self.state.lock();
        if !state.active {
            return Err(self.inactive());
        }
        let stage = self.stage();
        if stage != ProtocolStage::PromptActive {
            return Err(self.invalid("send a system prompt", stage));
        }
        self.queue.push_all(events);
        drop(state);
        self.touch();
        Ok(())
    }

    pub(crate) fn start_audio(&self, content_start: OutboundEvent) -> Result<(), StreamError> {
        self.apply(Lifecycle::StartAudio, "start audio", [content_start])?;
        self.audio_ready.notify_one();
        Ok(())
    }

    /// Buffers one chunk of caller audio for the drain loop.
    pub(crate) fn buffer_audio(&self, chunk: bytes::Bytes) -> Result<(), StreamError> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(self.inactive());
        }
        state.audio.push(chunk);
        drop(state);
        self.audio_ready.notify_one();
        self.touch();
        Ok(())
    }

    /// Moves up to `batch` buffered chunks into the outbound queue if the
    /// audio content block is open.
    pub(crate) fn flush_audio(&self, batch: usize) -> Flush {
        let mut state = self.state.lock();
        if !state.active {
            return Flush::Closed;
        }
        if state.audio.is_empty() {
            return Flush::Empty;
        }
        let stage = self.stage();
        if stage < ProtocolStage::AudioActive {
            return Flush::Deferred;
        }
        if stage > ProtocolStage::AudioActive {
            return Flush::Discarded(state.audio.clear());
        }
        let chunks = state.audio.take_batch(batch);
        let n = chunks.len();
        self.queue.push_all(
            chunks
                .iter()
                .map(|chunk| codec::audio_input(&self.prompt_name, &self.audio_content_name, chunk)),
        );
        drop(state);
        self.touch();
        Flush::Flushed(n)
    }

    /// Flushes remaining audio and closes the audio content block. Returns
    /// false when audio was never started or has already ended.
    pub(crate) fn end_audio_content(&self) -> Result<bool, StreamError> {
        let mut state = self.state.lock();
        if !state.active {
            return Err(self.inactive());
        }
        if !self.stage().audio_content_started() {
            return Ok(false);
        }
        let remaining = state.audio.take_all();
        let mut events: Vec<OutboundEvent> = remaining
            .iter()
            .map(|chunk| codec::audio_input(&self.prompt_name, &self.audio_content_name, chunk))
            .collect();
        events.push(codec::content_end(&self.prompt_name, &self.audio_content_name));
        self.apply_locked(&state, Lifecycle::EndContent, "end audio content", events)?;
        drop(state);
        self.touch();
        Ok(true)
    }

    /// Returns false when no prompt is open.
    pub(crate) fn end_prompt(&self) -> Result<bool, StreamError> {
        let state = self.state.lock();
        if !state.active {
            return Err(self.inactive());
        }
        let stage = self.stage();
        if !stage.prompt_started() {
            return Ok(false);
        }
        let event = codec::prompt_end(&self.prompt_name);
        self.apply_locked(&state, Lifecycle::EndPrompt, "end the prompt", [event])?;
        drop(state);
        self.touch();
        Ok(true)
    }

    /// Returns false when the session was never started or is already ending.
    pub(crate) fn end_session(&self) -> Result<bool, StreamError> {
        let state = self.state.lock();
        if !state.active {
            return Err(self.inactive());
        }
        let stage = self.stage();
        if !stage.session_started() {
            return Ok(false);
        }
        self.apply_locked(&state, Lifecycle::EndSession, "end the session", [codec::session_end()])?;
        drop(state);
        self.touch();
        Ok(true)
    }

    /// Deactivates the session and ends its outbound stream. With
    /// `discard_pending`, anything still queued is dropped instead of sent.
    /// Returns false if the session was already inactive.
    pub(crate) fn terminate(&self, discard_pending: bool) -> bool {
        let mut state = self.state.lock();
        let was_active = state.active;
        state.active = false;
        state.tools.clear();
        let late_audio = state.audio.clear();
        let ended = self.stage().advance(Lifecycle::Terminate).unwrap_or(ProtocolStage::Ended);
        self.stage.send_replace(ended);
        let discarded = if discard_pending { self.queue.abort() } else { self.queue.close(); 0 };
        drop(state);
        if discarded > 0 || late_audio > 0 {
            debug!(session_id = %self.id, discarded, late_audio, "Dropped unsent data on close");
        }
        was_active
    }

    /// Waits until `ready` holds for the current stage, the session ends, or
    /// `timeout` elapses.
    pub(crate) async fn wait_for_stage<F>(
        &self,
        expected: ProtocolStage,
        timeout: Duration,
        ready: F,
    ) -> Result<ProtocolStage, StreamError>
    where
        F: Fn(ProtocolStage) -> bool,
    {
        let mut stage_rx = self.stage.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            stage_rx.wait_for(|stage| ready(*stage) || stage.is_terminal()),
        )
        .await;
        match waited {
            Ok(Ok(stage)) if !stage.is_terminal() => Ok(*stage),
            Ok(_) => Err(self.inactive()),
            Err(_) => Err(StreamError::PrerequisiteTimeout {
                id: self.id.clone(),
                expected,
            }),
        }
    }

    /// Pops the next outbound event for the transport.
    pub(crate) async fn next_outbound(&self) -> Option<OutboundEvent> {
        let event = self.queue.next().await;
        if event.is_some() {
            self.touch();
        }
        event
    }

    // --- Usage ---

    pub(crate) fn record_usage(&self, event: &UsageEvent) -> TokenUsage {
        self.state.lock().usage.record(event)
    }

    pub(crate) fn begin_turn(&self, completion_id: &str) {
        self.state.lock().usage.begin_turn(completion_id);
    }

    pub(crate) fn end_turn(&self, completion_id: &str) -> TurnUsage {
        self.state.lock().usage.end_turn(completion_id)
    }

    pub(crate) fn usage_totals(&self) -> TokenUsage {
        self.state.lock().usage.totals()
    }

    pub(crate) fn dropped_audio_chunks(&self) -> u64 {
        self.state.lock().audio.dropped()
    }

    // --- Tools ---

    pub(crate) fn cache_tool_use(&self, invocation: ToolInvocation) {
        let mut state = self.state.lock();
        if state.active {
            state.tools.cache(invocation);
        }
    }

    /// Releases the oldest cached tool use. Returns true when a worker must
    /// be started.
    pub(crate) fn release_tool(&self) -> bool {
        let mut state = self.state.lock();
        state.active && state.tools.release()
    }

    pub(crate) fn next_ready_tool(&self) -> Option<ToolInvocation> {
        self.state.lock().tools.take_ready()
    }

    pub(crate) fn tool_stage(&self) -> ToolStage {
        self.state.lock().tools.stage()
    }

    /// Enqueues the tool-result triplet while the prompt is still open and
    /// notifies the caller.
    pub(crate) fn send_tool_result(&self, invocation: &ToolInvocation, result: Value) {
        let events = codec::tool_result(&self.prompt_name, &invocation.tool_use_id, &result);
        let sent = {
            let state = self.state.lock();
            let open = state.active && self.stage().accepts_tool_result();
            if open {
                self.queue.push_all(events);
            }
            open
        };
        if sent {
            self.touch();
        } else {
            warn!(
                session_id = %self.id,
                tool_use_id = %invocation.tool_use_id,
                "Prompt is no longer open, dropping tool result"
            );
        }
        self.dispatch(
            EventKind::ToolResult,
            json!({
                "toolUseId": invocation.tool_use_id,
                "toolName": invocation.tool_name,
                "result": result,
            }),
        );
    }

    // --- Handlers ---

    pub(crate) fn register_handler(&self, key: HandlerKey, handler: EventHandler) {
        self.handlers.write().register(key, handler);
    }

    /// Delivers one notification. Handlers run outside the handler lock so
    /// they may register further handlers.
    pub(crate) fn dispatch(&self, kind: EventKind, data: Value) {
        let targets = self.handlers.read().targets(&kind);
        if targets.is_empty() {
            return;
        }
        let event = SessionEvent {
            session_id: self.id.clone(),
            kind,
            data,
        };
        deliver(&targets, &event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn session() -> Session {
        Session::new(
            "s1".to_string(),
            SessionOptions::default(),
            &InferenceConfig::default(),
            4,
        )
    }

    fn kinds(session: &Session) -> Vec<&'static str> {
        let mut out = Vec::new();
        while let Some(event) = session.queue.try_pop() {
            out.push(event.kind());
        }
        out
    }

    fn open_prompt(session: &Session) {
        session.start_session().unwrap();
        session.begin_prompt().unwrap();
        session
            .complete_prompt(codec::prompt_start(&session.prompt_name, &Default::default(), &[]))
            .unwrap();
    }

    #[test]
    fn test_audio_is_deferred_until_content_starts() {
        let session = session();
        session.buffer_audio(Bytes::from_static(b"a")).unwrap();
        assert_eq!(session.flush_audio(10), Flush::Deferred);

        open_prompt(&session);
        assert_eq!(session.flush_audio(10), Flush::Deferred);

        session
            .start_audio(codec::audio_content_start(
                &session.prompt_name,
                &session.audio_content_name,
                &Default::default(),
            ))
            .unwrap();
        assert_eq!(session.flush_audio(10), Flush::Flushed(1));
        assert_eq!(session.flush_audio(10), Flush::Empty);

        assert_eq!(
            kinds(&session),
            vec!["sessionStart", "promptStart", "contentStart", "audioInput"]
        );
    }

    #[test]
    fn test_end_audio_content_flushes_remaining_audio_first() {
        let session = session();
        open_prompt(&session);
        session
            .start_audio(codec::audio_content_start(
                &session.prompt_name,
                &session.audio_content_name,
                &Default::default(),
            ))
            .unwrap();
        session.buffer_audio(Bytes::from_static(b"a")).unwrap();
        session.buffer_audio(Bytes::from_static(b"b")).unwrap();

        assert!(session.end_audio_content().unwrap());
        assert!(!session.end_audio_content().unwrap());
        assert_eq!(session.stage(), ProtocolStage::ClosingContent);

        let tail: Vec<_> = kinds(&session).into_iter().skip(3).collect();
        assert_eq!(tail, vec!["audioInput", "audioInput", "contentEnd"]);

        session.buffer_audio(Bytes::from_static(b"late")).unwrap();
        assert_eq!(session.flush_audio(10), Flush::Discarded(1));
    }

    #[test]
    fn test_teardown_steps_skip_unstarted_stages() {
        let session = session();
        assert!(!session.end_audio_content().unwrap());
        assert!(!session.end_prompt().unwrap());
        assert!(!session.end_session().unwrap());
        assert!(session.queue.is_empty());

        session.start_session().unwrap();
        assert!(!session.end_prompt().unwrap());
        assert!(session.end_session().unwrap());
        assert_eq!(kinds(&session), vec!["sessionStart", "sessionEnd"]);
    }

    #[test]
    fn test_system_prompt_requires_open_prompt() {
        let session = session();
        let events = codec::system_prompt(&session.prompt_name, &Default::default(), "hi");
        assert!(matches!(
            session.send_system_prompt(events),
            Err(StreamError::InvalidStage { stage: ProtocolStage::Idle, .. })
        ));
    }

    #[tokio::test]
    async fn test_pending_system_prompt_holds_back_audio_start() {
        let session = std::sync::Arc::new(session());
        open_prompt(&session);
        let pending = session.reserve_system_prompt();
        assert_eq!(session.system_prompts_pending(), 1);

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .wait_for_stage(ProtocolStage::PromptActive, Duration::from_secs(1), |stage| {
                        stage >= ProtocolStage::PromptActive && session.system_prompts_pending() == 0
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(pending);
        assert_eq!(session.system_prompts_pending(), 0);
        let stage = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap()
            .unwrap();
        assert_eq!(stage, ProtocolStage::PromptActive);
    }

    #[test]
    fn test_terminate_blocks_further_enqueue() {
        let session = session();
        session.start_session().unwrap();
        assert!(session.terminate(true));
        assert!(!session.terminate(true));

        assert!(matches!(session.begin_prompt(), Err(StreamError::SessionInactive(_))));
        assert!(matches!(
            session.buffer_audio(Bytes::from_static(b"x")),
            Err(StreamError::SessionInactive(_))
        ));
        assert_eq!(session.stage(), ProtocolStage::Ended);
        assert_eq!(session.flush_audio(1), Flush::Closed);
        assert!(session.queue.is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_stage_times_out_and_sees_termination() {
        let session = std::sync::Arc::new(session());
        let err = session
            .wait_for_stage(ProtocolStage::PromptActive, Duration::from_millis(10), |s| {
                s >= ProtocolStage::PromptActive
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::PrerequisiteTimeout { .. }));

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .wait_for_stage(ProtocolStage::PromptActive, Duration::from_secs(5), |s| {
                        s >= ProtocolStage::PromptActive
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.terminate(true);
        assert!(matches!(waiter.await.unwrap(), Err(StreamError::SessionInactive(_))));
    }

    #[test]
    fn test_tool_result_dropped_after_prompt_closes() {
        let session = session();
        let invocation = ToolInvocation {
            tool_use_id: "t1".into(),
            tool_name: "lookup".into(),
            payload: json!({}),
        };
        session.send_tool_result(&invocation, json!("ok"));
        assert!(session.queue.is_empty());

        open_prompt(&session);
        let before = session.queue.len();
        session.send_tool_result(&invocation, json!("ok"));
        assert_eq!(session.queue.len(), before + 3);
    }
}
