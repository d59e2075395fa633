//! Session bridge
//!
//! One bridge per session. It owns the session's lifecycle state, the
//! pending approval/input requests, the replay backlog and a single worker
//! task that drives the agent loop one queued message at a time.
//!
//! Every event goes through `record`, which stamps it with a sequence
//! number, appends it to the backlog, hands it to in-process listeners and
//! queues it for the per-bridge dispatcher. The dispatcher is the only task
//! that talks to the connection manager for this session, so live delivery
//! and new-socket admission (connected → state → backlog) never interleave.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vibecheck_connectors::{
    AgentCallbacks, AgentLoop, AgentRuntime, Answer, ApprovalReply, ConnectorError,
    MessageObserver, ObservedMessage, ToolArgs, UserInputReply, UserInputRequest,
};
use vibecheck_protocol::{
    new_event_id, AttachMode, BridgeState, Event, EventKind, PendingApprovalInfo,
    PendingInputInfo, StatePayload,
};

use crate::backlog::Backlog;
use crate::connections::{ClientSocket, ConnectionManager};
use crate::pending::PendingRequests;
use crate::transition::{next_state, Input};
use crate::translate::{args_to_map, translate, translate_observed};

const LISTENER_CAPACITY: usize = 256;
const DEFAULT_QUESTION: &str = "Input requested";
const EDIT_REJECTED_FEEDBACK: &str = "edited_args failed validation";

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("request {0} was cancelled before it was resolved")]
    RequestCancelled(String),

    #[error("agent runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("session {0} is observe-only")]
    NotControllable(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("session {0} has been stopped")]
    Stopped(String),
}

/// What a remote client decided about a tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub edited_args: Option<Map<String, Value>>,
}

#[derive(Debug, Clone)]
struct ApprovalContext {
    tool_name: String,
    args: Map<String, Value>,
}

#[derive(Debug, Clone)]
struct InputContext {
    question: String,
    options: Vec<String>,
}

enum Dispatch {
    Deliver {
        seq: u64,
        event: Event,
    },
    Admit {
        socket: ClientSocket,
        credential: Option<String>,
        reply: oneshot::Sender<bool>,
    },
}

struct BridgeInner {
    state: BridgeState,
    attach_mode: AttachMode,
    approvals: PendingRequests<ApprovalContext, ApprovalDecision>,
    inputs: PendingRequests<InputContext, String>,
    backlog: Backlog,
    injected: Vec<String>,
    seen_messages: HashSet<String>,
    agent: Option<Arc<dyn AgentLoop>>,
    structured_answers: bool,
    queue_tx: Option<mpsc::UnboundedSender<String>>,
    worker: Option<JoinHandle<()>>,
    outbox: Option<mpsc::UnboundedSender<Dispatch>>,
    dispatcher: Option<JoinHandle<()>>,
    next_seq: u64,
}

pub struct SessionBridge {
    session_id: String,
    inner: Mutex<BridgeInner>,
    turn_lock: tokio::sync::Mutex<()>,
    queued: AtomicUsize,
    drained: Notify,
    connections: Option<Arc<ConnectionManager>>,
    runtime: Option<Arc<dyn AgentRuntime>>,
    listeners: broadcast::Sender<Event>,
    weak_self: Weak<SessionBridge>,
}

impl SessionBridge {
    pub fn new(
        session_id: impl Into<String>,
        attach_mode: AttachMode,
        connections: Option<Arc<ConnectionManager>>,
        runtime: Option<Arc<dyn AgentRuntime>>,
    ) -> Arc<Self> {
        let session_id = session_id.into();
        let (listeners, _) = broadcast::channel(LISTENER_CAPACITY);
        Arc::new_cyclic(|weak_self| Self {
            session_id,
            inner: Mutex::new(BridgeInner {
                state: BridgeState::Idle,
                attach_mode,
                approvals: PendingRequests::default(),
                inputs: PendingRequests::default(),
                backlog: Backlog::default(),
                injected: Vec::new(),
                seen_messages: HashSet::new(),
                agent: None,
                structured_answers: false,
                queue_tx: None,
                worker: None,
                outbox: None,
                dispatcher: None,
                next_seq: 0,
            }),
            turn_lock: tokio::sync::Mutex::new(()),
            queued: AtomicUsize::new(0),
            drained: Notify::new(),
            connections,
            runtime,
            listeners,
            weak_self: weak_self.clone(),
        })
    }

    pub fn state(&self) -> BridgeState {
        self.lock().state
    }

    pub fn attach_mode(&self) -> AttachMode {
        self.lock().attach_mode
    }

    pub fn controllable(&self) -> bool {
        self.attach_mode().controllable()
    }

    pub fn pending_approval_ids(&self) -> Vec<String> {
        self.lock().approvals.ids()
    }

    pub fn pending_input_ids(&self) -> Vec<String> {
        self.lock().inputs.ids()
    }

    /// Every message ever passed to `inject_message`, controllable or not.
    pub fn injected_messages(&self) -> Vec<String> {
        self.lock().injected.clone()
    }

    /// Most recent events, oldest first. `None` returns the whole backlog.
    pub fn backlog(&self, limit: Option<usize>) -> Vec<Event> {
        self.lock().backlog.events(limit)
    }

    pub fn backlog_len(&self) -> usize {
        self.lock().backlog.len()
    }

    /// Append to the backlog without live delivery.
    pub fn add_event(&self, event: Event) {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.backlog.push(seq, event);
    }

    /// Subscribe to every event this bridge publishes from now on.
    pub fn listen(&self) -> broadcast::Receiver<Event> {
        self.listeners.subscribe()
    }

    pub fn state_payload(&self) -> StatePayload {
        let inner = self.lock();
        StatePayload {
            state: inner.state,
            attach_mode: inner.attach_mode,
            controllable: inner.attach_mode.controllable(),
            pending_approval: inner.approvals.first().map(|(call_id, ctx)| PendingApprovalInfo {
                call_id: call_id.to_string(),
                tool_name: ctx.tool_name.clone(),
                args: ctx.args.clone(),
            }),
            pending_input: inner.inputs.first().map(|(request_id, ctx)| PendingInputInfo {
                request_id: request_id.to_string(),
                question: ctx.question.clone(),
                options: ctx.options.clone(),
            }),
        }
    }

    /// Change the attach mode, announcing it with a `state` event.
    pub fn set_attach_mode(&self, mode: AttachMode) {
        let mut inner = self.lock();
        if inner.attach_mode == mode {
            return;
        }
        inner.attach_mode = mode;
        let event = Event::state(inner.state, mode);
        self.record(&mut inner, event);
    }

    // -----------------------------------------------------------------------
    // Approvals and input
    // -----------------------------------------------------------------------

    /// Publish an approval request and suspend until it is resolved.
    pub async fn request_approval(
        &self,
        call_id: &str,
        tool_name: &str,
        args: Map<String, Value>,
    ) -> Result<ApprovalDecision, BridgeError> {
        let rx = {
            let mut inner = self.lock();
            let rx = inner.approvals.register(
                call_id,
                ApprovalContext {
                    tool_name: tool_name.to_string(),
                    args: args.clone(),
                },
            );
            self.apply(&mut inner, Input::ApprovalRequested);
            self.record(
                &mut inner,
                Event::new(EventKind::ApprovalRequest {
                    call_id: call_id.to_string(),
                    tool_name: tool_name.to_string(),
                    args,
                }),
            );
            rx
        };
        info!(
            component = "session_bridge",
            event = "bridge.approval.requested",
            session_id = %self.session_id,
            call_id = %call_id,
            tool_name = %tool_name,
            "Waiting for tool approval"
        );
        rx.await
            .map_err(|_| BridgeError::RequestCancelled(call_id.to_string()))
    }

    /// Resolve a pending approval. Returns false if `call_id` is not pending.
    pub fn resolve_approval(
        &self,
        call_id: &str,
        approved: bool,
        edited_args: Option<Map<String, Value>>,
    ) -> bool {
        let mut inner = self.lock();
        let decision = ApprovalDecision {
            approved,
            edited_args: edited_args.clone(),
        };
        if !inner.approvals.resolve(call_id, decision) {
            return false;
        }
        self.apply(&mut inner, Input::ApprovalResolved);
        self.record(
            &mut inner,
            Event::new(EventKind::ApprovalResolution {
                call_id: call_id.to_string(),
                approved,
                edited_args,
            }),
        );
        info!(
            component = "session_bridge",
            event = "bridge.approval.resolved",
            session_id = %self.session_id,
            call_id = %call_id,
            approved,
            "Tool approval resolved"
        );
        true
    }

    /// Publish an input request and suspend until it is answered.
    pub async fn request_input(
        &self,
        request_id: &str,
        question: &str,
        options: Vec<String>,
    ) -> Result<String, BridgeError> {
        let rx = {
            let mut inner = self.lock();
            let rx = inner.inputs.register(
                request_id,
                InputContext {
                    question: question.to_string(),
                    options: options.clone(),
                },
            );
            self.apply(&mut inner, Input::InputRequested);
            self.record(
                &mut inner,
                Event::new(EventKind::InputRequest {
                    request_id: request_id.to_string(),
                    question: question.to_string(),
                    options,
                }),
            );
            rx
        };
        info!(
            component = "session_bridge",
            event = "bridge.input.requested",
            session_id = %self.session_id,
            request_id = %request_id,
            "Waiting for user input"
        );
        rx.await
            .map_err(|_| BridgeError::RequestCancelled(request_id.to_string()))
    }

    /// Answer a pending input request. Returns false if it is not pending.
    pub fn resolve_input(&self, request_id: &str, response: &str) -> bool {
        let mut inner = self.lock();
        if !inner.inputs.resolve(request_id, response.to_string()) {
            return false;
        }
        self.apply(&mut inner, Input::InputResolved);
        self.record(
            &mut inner,
            Event::new(EventKind::InputResolution {
                request_id: request_id.to_string(),
                response: response.to_string(),
            }),
        );
        info!(
            component = "session_bridge",
            event = "bridge.input.resolved",
            session_id = %self.session_id,
            request_id = %request_id,
            "User input resolved"
        );
        true
    }

    // -----------------------------------------------------------------------
    // Agent attachment and messages
    // -----------------------------------------------------------------------

    /// Hand an agent loop the host is already running to this bridge.
    pub fn attach_live(&self, agent: Arc<dyn AgentLoop>, structured_answers: bool) {
        let mut inner = self.lock();
        self.install(&mut inner, agent, AttachMode::Live, structured_answers);
    }

    /// The attached agent loop, building one from the runtime if needed.
    pub fn ensure_agent(&self) -> Result<Arc<dyn AgentLoop>, BridgeError> {
        let mut inner = self.lock();
        if let Some(agent) = &inner.agent {
            return Ok(agent.clone());
        }
        if !inner.attach_mode.controllable() {
            return Err(BridgeError::NotControllable(self.session_id.clone()));
        }
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| BridgeError::RuntimeUnavailable("no agent runtime configured".into()))?;
        let agent = runtime
            .create_loop()
            .map_err(|e| BridgeError::RuntimeUnavailable(e.to_string()))?;
        info!(
            component = "session_bridge",
            event = "bridge.agent.created",
            session_id = %self.session_id,
            runtime = %runtime.name(),
            "Built managed agent loop"
        );
        self.install(
            &mut inner,
            agent.clone(),
            AttachMode::Managed,
            runtime.supports_structured_answers(),
        );
        Ok(agent)
    }

    /// Queue a user message for the agent.
    ///
    /// Returns false when the message was not forwarded: the bridge is
    /// observe-only or stopped, or no agent could be built. In the latter
    /// case observers still see the message as a `user_message` event.
    pub fn inject_message(&self, content: &str) -> bool {
        {
            let mut inner = self.lock();
            inner.injected.push(content.to_string());
            if inner.state == BridgeState::Disconnected {
                return false;
            }
            if !inner.attach_mode.controllable() {
                self.record(&mut inner, Event::user_message(content));
                self.apply(&mut inner, Input::Rejected);
                return false;
            }
        }

        let result = self.ensure_agent().and_then(|_| self.enqueue(content));
        match result {
            Ok(()) => {
                debug!(
                    component = "session_bridge",
                    event = "bridge.message.queued",
                    session_id = %self.session_id,
                    "Queued user message"
                );
                true
            }
            Err(BridgeError::Stopped(_)) => false,
            Err(e) => {
                warn!(
                    component = "session_bridge",
                    event = "bridge.message.not_forwarded",
                    session_id = %self.session_id,
                    error = %e,
                    "Message not forwarded to agent"
                );
                let mut inner = self.lock();
                self.record(&mut inner, Event::user_message(content));
                self.apply(&mut inner, Input::Rejected);
                false
            }
        }
    }

    /// Queue `message` and wait until the worker has drained the queue.
    #[allow(dead_code)]
    pub async fn start_session(&self, message: &str) -> Result<(), BridgeError> {
        self.ensure_agent()?;
        self.enqueue(message)?;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.queued.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Tear the bridge down: cancel the worker and in-flight deliveries,
    /// fail every pending request and move to `disconnected`.
    pub fn stop(&self) {
        let (worker, dispatcher, cancelled) = {
            let mut inner = self.lock();
            let cancelled = inner.approvals.cancel_all() + inner.inputs.cancel_all();
            inner.queue_tx = None;
            inner.outbox = None;
            (inner.worker.take(), inner.dispatcher.take(), cancelled)
        };
        if let Some(worker) = worker {
            worker.abort();
        }
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
        self.queued.store(0, Ordering::Release);
        self.drained.notify_waiters();

        let mut inner = self.lock();
        self.apply(&mut inner, Input::Stopped);
        // Let the final state event drain, then release the dispatcher.
        inner.outbox = None;
        inner.dispatcher = None;
        info!(
            component = "session_bridge",
            event = "bridge.stopped",
            session_id = %self.session_id,
            cancelled_requests = cancelled,
            "Session bridge stopped"
        );
    }

    /// Admit a socket into this session's room. Runs on the dispatcher so
    /// the socket receives `connected`, the current `state` and the backlog
    /// before any live event.
    pub async fn admit(&self, socket: ClientSocket, credential: Option<String>) -> bool {
        let rx = {
            let mut inner = self.lock();
            let Some(outbox) = self.outbox(&mut inner) else {
                return false;
            };
            let (reply, rx) = oneshot::channel();
            if outbox
                .send(Dispatch::Admit {
                    socket,
                    credential,
                    reply,
                })
                .is_err()
            {
                return false;
            }
            rx
        };
        rx.await.unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, BridgeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: Event) {
        let mut inner = self.lock();
        self.record(&mut inner, event);
    }

    fn record(&self, inner: &mut BridgeInner, event: Event) {
        let outbox = self.outbox(inner);
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.backlog.push(seq, event.clone());
        let _ = self.listeners.send(event.clone());
        if let Some(outbox) = outbox {
            let _ = outbox.send(Dispatch::Deliver { seq, event });
        }
    }

    fn apply(&self, inner: &mut BridgeInner, input: Input) {
        let Some(next) = next_state(inner.state, input) else {
            return;
        };
        debug!(
            component = "session_bridge",
            event = "bridge.state.changed",
            session_id = %self.session_id,
            from = inner.state.as_str(),
            to = next.as_str(),
            "Bridge state changed"
        );
        inner.state = next;
        let event = Event::state(next, inner.attach_mode);
        self.record(inner, event);
    }

    /// Dispatcher queue, spawned lazily. `None` without a connection manager
    /// or outside a Tokio runtime; events then live only in the backlog.
    fn outbox(&self, inner: &mut BridgeInner) -> Option<mpsc::UnboundedSender<Dispatch>> {
        let connections = self.connections.as_ref()?;
        if let Some(outbox) = &inner.outbox {
            if !outbox.is_closed() {
                return Some(outbox.clone());
            }
        }
        let handle = Handle::try_current().ok()?;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.dispatcher = Some(handle.spawn(run_dispatcher(
            self.session_id.clone(),
            connections.clone(),
            self.weak_self.clone(),
            inner.next_seq,
            rx,
        )));
        inner.outbox = Some(tx.clone());
        Some(tx)
    }

    fn admission_snapshot(&self, delivered_seq: u64) -> (Event, Vec<Event>) {
        let inner = self.lock();
        (
            Event::state(inner.state, inner.attach_mode),
            inner.backlog.events_through(delivered_seq),
        )
    }

    fn install(
        &self,
        inner: &mut BridgeInner,
        agent: Arc<dyn AgentLoop>,
        mode: AttachMode,
        structured_answers: bool,
    ) {
        agent.set_callbacks(Arc::new(BridgeCallbacks {
            bridge: self.weak_self.clone(),
        }));
        let observer = Arc::new(BridgeObserver {
            bridge: self.weak_self.clone(),
            previous: OnceLock::new(),
        });
        if let Some(previous) = agent.set_message_observer(observer.clone()) {
            let _ = observer.previous.set(previous);
        }
        inner.agent = Some(agent);
        inner.structured_answers = structured_answers;
        if inner.attach_mode != mode {
            inner.attach_mode = mode;
            let event = Event::state(inner.state, mode);
            self.record(inner, event);
        }
    }

    fn enqueue(&self, content: &str) -> Result<(), BridgeError> {
        let mut inner = self.lock();
        let tx = self.ensure_worker(&mut inner)?;
        self.queued.fetch_add(1, Ordering::AcqRel);
        if tx.send(content.to_string()).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(BridgeError::RuntimeUnavailable("message worker stopped".into()));
        }
        self.apply(&mut inner, Input::MessageQueued);
        Ok(())
    }

    fn ensure_worker(
        &self,
        inner: &mut BridgeInner,
    ) -> Result<mpsc::UnboundedSender<String>, BridgeError> {
        if inner.state == BridgeState::Disconnected {
            return Err(BridgeError::Stopped(self.session_id.clone()));
        }
        if let (Some(tx), Some(worker)) = (&inner.queue_tx, &inner.worker) {
            if !tx.is_closed() && !worker.is_finished() {
                return Ok(tx.clone());
            }
        }
        let handle = Handle::try_current().map_err(|_| {
            BridgeError::RuntimeUnavailable("no async runtime to run the message worker".into())
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.worker = Some(handle.spawn(run_worker(self.weak_self.clone(), rx)));
        inner.queue_tx = Some(tx.clone());
        Ok(tx)
    }

    async fn run_turn(&self, content: String) {
        let Some(agent) = self.lock().agent.clone() else {
            return;
        };
        {
            let mut inner = self.lock();
            self.apply(&mut inner, Input::MessageQueued);
        }

        let _turn = self.turn_lock.lock().await;
        let outcome = AssertUnwindSafe(self.drive(agent.as_ref(), &content))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_reason(panic)),
        };
        if let Some(reason) = failure {
            warn!(
                component = "session_bridge",
                event = "bridge.turn.failed",
                session_id = %self.session_id,
                error = %reason,
                "Agent turn failed"
            );
            self.publish(Event::assistant(format!(
                "Bridge failed to process agent event: {reason}"
            )));
        }
    }

    async fn drive(&self, agent: &dyn AgentLoop, content: &str) -> Result<(), ConnectorError> {
        let mut events = agent.act(content);
        while let Some(item) = events.next().await {
            let event = item?;
            let kind = {
                let mut inner = self.lock();
                translate(event, &mut inner.seen_messages)
            };
            if let Some(kind) = kind {
                self.publish(Event::new(kind));
            }
        }
        Ok(())
    }

    fn settle(&self) {
        let remaining = self
            .queued
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        {
            let mut inner = self.lock();
            let has_pending = !inner.approvals.is_empty() || !inner.inputs.is_empty();
            self.apply(
                &mut inner,
                Input::TurnSettled {
                    queue_drained: remaining == 0,
                    has_pending,
                },
            );
        }
        if remaining == 0 {
            self.drained.notify_waiters();
        }
    }

    fn on_observed(&self, message: &ObservedMessage) {
        let mut inner = self.lock();
        if let Some(kind) = translate_observed(message, &mut inner.seen_messages) {
            self.record(&mut inner, Event::new(kind));
        }
    }

    fn structured_answers(&self) -> bool {
        self.lock().structured_answers
    }
}

async fn run_worker(bridge: Weak<SessionBridge>, mut queue: mpsc::UnboundedReceiver<String>) {
    while let Some(content) = queue.recv().await {
        let Some(bridge) = bridge.upgrade() else {
            break;
        };
        bridge.run_turn(content).await;
        bridge.settle();
    }
}

async fn run_dispatcher(
    session_id: String,
    connections: Arc<ConnectionManager>,
    bridge: Weak<SessionBridge>,
    mut delivered_seq: u64,
    mut commands: mpsc::UnboundedReceiver<Dispatch>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            Dispatch::Deliver { seq, event } => {
                connections.broadcast(&session_id, &event).await;
                delivered_seq = seq;
            }
            Dispatch::Admit {
                socket,
                credential,
                reply,
            } => {
                let Some(bridge) = bridge.upgrade() else {
                    let _ = reply.send(false);
                    continue;
                };
                if !connections.connect(&socket, &session_id, credential.as_deref()) {
                    let _ = reply.send(false);
                    continue;
                }
                let (state, replay) = bridge.admission_snapshot(delivered_seq);
                connections
                    .send_personal(&socket, &Event::connected(&session_id))
                    .await;
                connections.send_personal(&socket, &state).await;
                for event in &replay {
                    connections.send_personal(&socket, event).await;
                }
                debug!(
                    component = "session_bridge",
                    event = "bridge.socket.admitted",
                    session_id = %session_id,
                    connection_id = socket.id(),
                    replayed = replay.len(),
                    "Socket admitted with backlog replay"
                );
                let _ = reply.send(true);
            }
        }
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(reason) = payload.downcast_ref::<&str>() {
        return reason.to_string();
    }
    if let Some(reason) = payload.downcast_ref::<String>() {
        return reason.clone();
    }
    "agent turn panicked".to_string()
}

// ---------------------------------------------------------------------------
// Agent-facing adaptors
// ---------------------------------------------------------------------------

struct BridgeCallbacks {
    bridge: Weak<SessionBridge>,
}

impl BridgeCallbacks {
    fn bridge(&self) -> Result<Arc<SessionBridge>, ConnectorError> {
        self.bridge
            .upgrade()
            .ok_or_else(|| ConnectorError::Cancelled("session bridge dropped".into()))
    }
}

#[async_trait]
impl AgentCallbacks for BridgeCallbacks {
    async fn approve_tool(
        &self,
        tool_name: &str,
        args: &mut dyn ToolArgs,
        tool_call_id: &str,
    ) -> Result<ApprovalReply, ConnectorError> {
        let bridge = self.bridge()?;
        let decision = bridge
            .request_approval(tool_call_id, tool_name, args_to_map(args.to_value()))
            .await
            .map_err(|e| ConnectorError::Cancelled(e.to_string()))?;

        if decision.approved {
            if let Some(edits) = &decision.edited_args {
                if let Err(e) = args.apply_edits(edits) {
                    warn!(
                        component = "session_bridge",
                        event = "bridge.approval.edit_rejected",
                        session_id = %bridge.session_id,
                        call_id = %tool_call_id,
                        error = %e,
                        "Edited arguments rejected"
                    );
                    return Ok(ApprovalReply::reject(Some(EDIT_REJECTED_FEEDBACK.into())));
                }
            }
        }

        let feedback = decision
            .edited_args
            .as_ref()
            .and_then(|edits| serde_json::to_string(edits).ok());
        Ok(ApprovalReply {
            approved: decision.approved,
            feedback,
        })
    }

    async fn ask_user(
        &self,
        request: &UserInputRequest,
    ) -> Result<UserInputReply, ConnectorError> {
        let bridge = self.bridge()?;
        let first = request.questions.first();
        let question = first
            .map(|q| q.question.clone())
            .unwrap_or_else(|| DEFAULT_QUESTION.to_string());
        let options = first
            .map(|q| q.options.iter().map(|o| o.label.clone()).collect())
            .unwrap_or_default();

        let request_id = format!("req-{}", new_event_id());
        let response = bridge
            .request_input(&request_id, &question, options)
            .await
            .map_err(|e| ConnectorError::Cancelled(e.to_string()))?;

        if !bridge.structured_answers() {
            return Ok(UserInputReply::Plain { response });
        }
        let mut prompts: Vec<String> = request
            .questions
            .iter()
            .map(|q| q.question.clone())
            .filter(|q| !q.is_empty())
            .collect();
        if prompts.is_empty() {
            prompts.push(DEFAULT_QUESTION.to_string());
        }
        Ok(UserInputReply::Answers {
            answers: prompts
                .into_iter()
                .map(|question| Answer {
                    question,
                    answer: response.clone(),
                    is_other: false,
                })
                .collect(),
            cancelled: false,
        })
    }
}

/// Publishes observed messages, then forwards them to the observer the
/// agent had before the bridge attached.
struct BridgeObserver {
    bridge: Weak<SessionBridge>,
    previous: OnceLock<Arc<dyn MessageObserver>>,
}

impl MessageObserver for BridgeObserver {
    fn on_message(&self, message: &ObservedMessage) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.on_observed(message);
        }
        if let Some(previous) = self.previous.get() {
            previous.on_message(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use vibecheck_connectors::{
        AgentEvent, JsonArgs, MessageRole, Question, QuestionOption, TypedArgs, UnavailableRuntime,
    };

    use crate::test_support::{ScriptedAgent, ScriptedRuntime, Step};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct BashArgs {
        command: String,
        timeout: u64,
    }

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other:?}"),
        }
    }

    fn managed(agent: &Arc<ScriptedAgent>, structured: bool) -> Arc<SessionBridge> {
        let runtime: Arc<dyn AgentRuntime> = Arc::new(ScriptedRuntime::new(agent.clone(), structured));
        SessionBridge::new("s1", AttachMode::Managed, None, Some(runtime))
    }

    async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn count(events: &[Event], type_name: &str) -> usize {
        events.iter().filter(|e| e.type_name() == type_name).count()
    }

    fn assistant_texts(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Assistant { content } => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn approval_suspends_the_turn_until_resolved() {
        let agent = ScriptedAgent::new(vec![vec![
            Step::Emit(AgentEvent::ToolCall {
                tool_call_id: "tc-1".into(),
                tool_name: "bash".into(),
                args: json!({"command": "ls"}),
            }),
            Step::Approve {
                tool_call_id: "tc-1".into(),
                tool_name: "bash".into(),
                args: Box::new(JsonArgs(map(json!({"command": "ls"})))),
            },
            Step::Emit(AgentEvent::Assistant {
                message_id: None,
                content: "done".into(),
            }),
        ]]);
        let bridge = managed(&agent, true);

        assert!(bridge.inject_message("list files"));
        wait_for("approval", || bridge.state() == BridgeState::WaitingApproval).await;

        let payload = bridge.state_payload();
        let pending = payload.pending_approval.expect("pending approval");
        assert_eq!(pending.call_id, "tc-1");
        assert_eq!(pending.tool_name, "bash");
        assert_eq!(count(&bridge.backlog(None), "approval_request"), 1);
        assert_eq!(count(&bridge.backlog(None), "approval_resolution"), 0);

        assert!(bridge.resolve_approval("tc-1", true, Some(map(json!({"command": "ls -la"})))));
        assert!(!bridge.resolve_approval("tc-1", false, None));
        wait_for("idle", || bridge.state() == BridgeState::Idle).await;

        let backlog = bridge.backlog(None);
        assert_eq!(count(&backlog, "approval_request"), 1);
        assert_eq!(count(&backlog, "approval_resolution"), 1);
        assert_eq!(assistant_texts(&backlog), vec!["done".to_string()]);

        let approvals = agent.approvals();
        assert_eq!(approvals.len(), 1);
        let (reply, args) = &approvals[0];
        assert!(reply.approved);
        assert_eq!(reply.feedback.as_deref(), Some(r#"{"command":"ls -la"}"#));
        assert_eq!(args["command"], "ls -la");
        assert_eq!(agent.prompts(), vec!["list files".to_string()]);
    }

    #[tokio::test]
    async fn invalid_edits_become_a_rejection_with_feedback() {
        let agent = ScriptedAgent::new(vec![vec![Step::Approve {
            tool_call_id: "tc-1".into(),
            tool_name: "bash".into(),
            args: Box::new(TypedArgs(BashArgs {
                command: "npm test".into(),
                timeout: 30,
            })),
        }]]);
        let bridge = managed(&agent, true);

        assert!(bridge.inject_message("test it"));
        wait_for("approval", || bridge.state() == BridgeState::WaitingApproval).await;
        assert!(bridge.resolve_approval("tc-1", true, Some(map(json!({"timeout": "forever"})))));
        wait_for("idle", || bridge.state() == BridgeState::Idle).await;

        let approvals = agent.approvals();
        let (reply, args) = &approvals[0];
        assert!(!reply.approved);
        assert_eq!(reply.feedback.as_deref(), Some("edited_args failed validation"));
        assert_eq!(args["timeout"], 30);
    }

    #[tokio::test]
    async fn input_request_answers_every_question_with_the_response() {
        let agent = ScriptedAgent::new(vec![vec![Step::Ask(UserInputRequest {
            questions: vec![
                Question {
                    question: "Proceed?".into(),
                    options: vec![
                        QuestionOption {
                            label: "yes".into(),
                            description: None,
                        },
                        QuestionOption {
                            label: "no".into(),
                            description: None,
                        },
                    ],
                },
                Question {
                    question: "Really?".into(),
                    options: vec![],
                },
            ],
        })]]);
        let bridge = managed(&agent, true);

        assert!(bridge.inject_message("ask me"));
        wait_for("input", || bridge.state() == BridgeState::WaitingInput).await;

        let pending = bridge.state_payload().pending_input.expect("pending input");
        assert!(pending.request_id.starts_with("req-"));
        assert_eq!(pending.request_id.len(), 12);
        assert_eq!(pending.question, "Proceed?");
        assert_eq!(pending.options, vec!["yes".to_string(), "no".to_string()]);

        assert!(bridge.resolve_input(&pending.request_id, "yes"));
        assert!(!bridge.resolve_input(&pending.request_id, "again"));
        wait_for("idle", || bridge.state() == BridgeState::Idle).await;

        match &agent.answers()[0] {
            UserInputReply::Answers { answers, cancelled } => {
                assert!(!cancelled);
                assert_eq!(answers.len(), 2);
                assert_eq!(answers[0].question, "Proceed?");
                assert_eq!(answers[1].question, "Really?");
                assert!(answers.iter().all(|a| a.answer == "yes" && !a.is_other));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn plain_answers_when_the_runtime_has_no_structured_type() {
        let agent = ScriptedAgent::new(vec![vec![Step::Ask(UserInputRequest::default())]]);
        let bridge = managed(&agent, false);

        assert!(bridge.inject_message("ask me"));
        wait_for("input", || bridge.state() == BridgeState::WaitingInput).await;
        let pending = bridge.state_payload().pending_input.expect("pending input");
        assert_eq!(pending.question, "Input requested");
        assert!(bridge.resolve_input(&pending.request_id, "sure"));
        wait_for("idle", || bridge.state() == BridgeState::Idle).await;

        assert_eq!(
            agent.answers(),
            vec![UserInputReply::Plain {
                response: "sure".into()
            }]
        );
    }

    #[test]
    fn resolving_unknown_ids_changes_nothing() {
        let bridge = SessionBridge::new("s1", AttachMode::Managed, None, None);
        assert!(!bridge.resolve_approval("missing", true, None));
        assert!(!bridge.resolve_input("missing", "yes"));
        assert_eq!(bridge.state(), BridgeState::Idle);
        assert!(bridge.backlog(None).is_empty());
    }

    #[test]
    fn backlog_keeps_the_last_fifty_events() {
        let bridge = SessionBridge::new("s1", AttachMode::Managed, None, None);
        for i in 0..60 {
            bridge.add_event(Event::assistant(format!("message-{i}")));
        }
        let texts = assistant_texts(&bridge.backlog(None));
        assert_eq!(texts.len(), 50);
        assert_eq!(texts[0], "message-10");
        assert_eq!(texts[49], "message-59");
        assert_eq!(bridge.backlog(Some(3)).len(), 3);
    }

    #[test]
    fn observe_only_bridges_record_but_never_forward() {
        let bridge = SessionBridge::new("s1", AttachMode::ObserveOnly, None, None);
        assert!(!bridge.inject_message("hello?"));

        let backlog = bridge.backlog(None);
        let last = backlog.last().expect("user message recorded");
        assert_eq!(
            last.kind,
            EventKind::UserMessage {
                content: "hello?".into()
            }
        );
        assert_eq!(bridge.injected_messages(), vec!["hello?".to_string()]);
        assert!(bridge.lock().worker.is_none());
        assert!(bridge.lock().agent.is_none());
        assert_eq!(bridge.state(), BridgeState::Idle);
    }

    #[tokio::test]
    async fn unavailable_runtime_degrades_to_a_visible_user_message() {
        let runtime: Arc<dyn AgentRuntime> = Arc::new(UnavailableRuntime::new("not installed"));
        let bridge = SessionBridge::new("s1", AttachMode::Managed, None, Some(runtime));

        assert!(!bridge.inject_message("hello"));
        assert_eq!(bridge.state(), BridgeState::Idle);
        assert!(bridge.lock().worker.is_none());
        assert!(bridge
            .backlog(None)
            .iter()
            .any(|e| e.kind == EventKind::UserMessage { content: "hello".into() }));
        assert!(matches!(
            bridge.start_session("again").await,
            Err(BridgeError::RuntimeUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_messages_from_observer_and_turn_are_published_once() {
        let agent = ScriptedAgent::new(vec![vec![
            Step::Observe(ObservedMessage {
                message_id: Some("u-1".into()),
                role: MessageRole::User,
                content: Some("hi".into()),
            }),
            Step::Emit(AgentEvent::UserMessage {
                message_id: Some("u-1".into()),
                content: "hi".into(),
            }),
            Step::Emit(AgentEvent::Assistant {
                message_id: Some("a-1".into()),
                content: "hello".into(),
            }),
            Step::Observe(ObservedMessage {
                message_id: Some("a-1".into()),
                role: MessageRole::Assistant,
                content: Some("hello".into()),
            }),
        ]]);
        let bridge = managed(&agent, true);
        bridge
            .start_session("hi")
            .await
            .expect("session runs");

        let backlog = bridge.backlog(None);
        assert_eq!(count(&backlog, "user_message"), 1);
        assert_eq!(assistant_texts(&backlog), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn worker_survives_failed_and_panicking_turns() {
        let agent = ScriptedAgent::new(vec![
            vec![Step::Fail("boom".into())],
            vec![Step::Panic("kaboom")],
            vec![Step::Emit(AgentEvent::Assistant {
                message_id: None,
                content: "still here".into(),
            })],
        ]);
        let bridge = managed(&agent, true);

        assert!(bridge.inject_message("one"));
        assert!(bridge.inject_message("two"));
        assert!(bridge.inject_message("three"));
        wait_for("all turns", || agent.prompts().len() == 3 && bridge.state() == BridgeState::Idle)
            .await;

        let texts = assistant_texts(&bridge.backlog(None));
        assert_eq!(texts.len(), 3);
        assert!(texts[0].starts_with("Bridge failed to process agent event: "));
        assert!(texts[0].contains("boom"));
        assert!(texts[1].contains("kaboom"));
        assert_eq!(texts[2], "still here");
    }

    #[tokio::test]
    async fn start_session_returns_once_the_queue_drains() {
        let agent = ScriptedAgent::new(vec![vec![Step::Emit(AgentEvent::Assistant {
            message_id: None,
            content: "done".into(),
        })]]);
        let bridge = managed(&agent, true);

        tokio::time::timeout(Duration::from_secs(5), bridge.start_session("go"))
            .await
            .expect("drained in time")
            .expect("session runs");
        assert_eq!(assistant_texts(&bridge.backlog(None)), vec!["done".to_string()]);
        assert_eq!(bridge.state(), BridgeState::Idle);
        assert_eq!(bridge.attach_mode(), AttachMode::Managed);
    }

    #[tokio::test]
    async fn stop_fails_pending_requests_instead_of_hanging() {
        let bridge = SessionBridge::new("s1", AttachMode::Live, None, None);
        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.request_approval("tc-1", "bash", Map::new()).await })
        };
        wait_for("approval", || bridge.state() == BridgeState::WaitingApproval).await;

        bridge.stop();
        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter woke")
            .expect("task joined");
        assert!(matches!(result, Err(BridgeError::RequestCancelled(id)) if id == "tc-1"));
        assert_eq!(bridge.state(), BridgeState::Disconnected);
        assert!(bridge.pending_approval_ids().is_empty());
        assert!(!bridge.inject_message("too late"));

        let last = bridge.backlog(None).pop().expect("state event");
        assert!(matches!(
            last.kind,
            EventKind::State {
                state: BridgeState::Disconnected,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn detach_mid_approval_tears_down_the_suspended_turn() {
        let agent = ScriptedAgent::new(vec![vec![
            Step::Approve {
                tool_call_id: "tc-1".into(),
                tool_name: "bash".into(),
                args: Box::new(JsonArgs(map(json!({"command": "rm -rf build"})))),
            },
            Step::Emit(AgentEvent::Assistant {
                message_id: None,
                content: "never".into(),
            }),
        ]]);
        let tmp = tempfile::tempdir().expect("tempdir");
        let runtime: Arc<dyn AgentRuntime> = Arc::new(ScriptedRuntime::new(agent.clone(), true));
        let manager = crate::manager::SessionManager::new(tmp.path(), None, Some(runtime));
        let bridge = manager.attach("s1", Some(AttachMode::Managed));

        assert!(bridge.inject_message("clean up"));
        wait_for("approval", || bridge.state() == BridgeState::WaitingApproval).await;
        assert!(bridge.turn_lock.try_lock().is_err());

        assert!(manager.detach("s1"));
        wait_for("turn released", || bridge.turn_lock.try_lock().is_ok()).await;

        assert_eq!(bridge.state(), BridgeState::Disconnected);
        assert!(bridge.pending_approval_ids().is_empty());
        assert!(!bridge.resolve_approval("tc-1", true, None));
        assert!(agent.approvals().is_empty());
        assert!(assistant_texts(&bridge.backlog(None)).is_empty());
        assert_eq!(manager.detach_all(), 0);
        assert!(!manager.has_known_session("s1"));
    }

    #[tokio::test]
    async fn stopped_bridge_refuses_to_start_a_worker() {
        let agent = ScriptedAgent::new(vec![Vec::new()]);
        let bridge = managed(&agent, true);
        bridge.ensure_agent().expect("agent");
        bridge.stop();

        let result = bridge.start_session("after stop").await;
        assert!(matches!(result, Err(BridgeError::Stopped(id)) if id == "s1"));
        assert!(!bridge.inject_message("after stop"));
        assert!(bridge.lock().worker.is_none());
        assert!(agent.prompts().is_empty());
        assert_eq!(bridge.state(), BridgeState::Disconnected);
        assert_eq!(count(&bridge.backlog(None), "user_message"), 0);
    }

    #[tokio::test]
    async fn listeners_see_published_events() {
        let bridge = SessionBridge::new("s1", AttachMode::Live, None, None);
        let mut events = bridge.listen();
        bridge.publish(Event::assistant("hello"));
        let event = events.recv().await.expect("event");
        assert_eq!(event.kind, EventKind::Assistant { content: "hello".into() });
    }

    #[tokio::test]
    async fn attach_live_chains_the_previous_observer() {
        let agent = ScriptedAgent::new(vec![vec![Step::Observe(ObservedMessage {
            message_id: Some("a-1".into()),
            role: MessageRole::Assistant,
            content: Some("from host".into()),
        })]]);
        let host_observer = Arc::new(crate::test_support::RecordingObserver::default());
        agent.set_message_observer(host_observer.clone());

        let bridge = SessionBridge::new("s1", AttachMode::Managed, None, None);
        bridge.attach_live(agent.clone(), true);
        assert_eq!(bridge.attach_mode(), AttachMode::Live);

        bridge.start_session("go").await.expect("session runs");
        assert_eq!(assistant_texts(&bridge.backlog(None)), vec!["from host".to_string()]);
        assert_eq!(host_observer.seen().len(), 1);
    }

    #[tokio::test]
    async fn admitted_sockets_get_connected_state_then_backlog_then_live() {
        let connections = Arc::new(ConnectionManager::new("secret"));
        let bridge = SessionBridge::new("s1", AttachMode::Live, Some(connections.clone()), None);
        bridge.publish(Event::assistant("first"));
        bridge.publish(Event::assistant("second"));

        let (socket, mut rx) = ClientSocket::channel();
        assert!(bridge.admit(socket, Some("secret".into())).await);
        bridge.publish(Event::assistant("live"));

        let mut types = Vec::new();
        let mut texts = Vec::new();
        for _ in 0..5 {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("frame in time")
                .expect("frame");
            let crate::connections::OutboundMessage::Text(text) = frame else {
                panic!("unexpected frame");
            };
            let value: Value = serde_json::from_str(text.as_str()).expect("json");
            types.push(value["type"].as_str().unwrap_or_default().to_string());
            if let Some(content) = value["content"].as_str() {
                texts.push(content.to_string());
            }
        }
        assert_eq!(types, vec!["connected", "state", "assistant", "assistant", "assistant"]);
        assert_eq!(texts, vec!["first", "second", "live"]);
        assert_eq!(connections.session_clients("s1"), 1);
    }

    #[tokio::test]
    async fn admission_with_a_bad_credential_is_refused() {
        let connections = Arc::new(ConnectionManager::new("secret"));
        let bridge = SessionBridge::new("s1", AttachMode::Live, Some(connections.clone()), None);
        let (socket, _rx) = ClientSocket::channel();
        assert!(!bridge.admit(socket, Some("nope".into())).await);
        assert_eq!(connections.session_clients("s1"), 0);
    }
}
