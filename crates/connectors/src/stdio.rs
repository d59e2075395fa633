//! Stdio agent runtime
//!
//! Spawns an agent command as a subprocess and talks NDJSON over its
//! stdin/stdout, one JSON object per line in each direction.
//!
//! Stdin (bridge → agent):
//!   `{"type":"user","content":...}`
//!   `{"type":"approval_response","tool_call_id":...,"approved":...,"feedback":...,"args":{...}}`
//!   `{"type":"input_response","request_id":...,"reply":{...}}`
//!
//! Stdout (agent → bridge): `user_message`, `assistant`, `tool_call`,
//! `tool_result`, `approval_request`, `ask_user`, `error` and
//! `turn_complete`, which ends the current turn. Unknown types are skipped.
//!
//! Every turn ends with `turn_complete`, including turns that report an
//! `error`. When a turn stops early (an error, a failed callback, or the
//! consumer dropping the stream) the rest of its output is discarded at the
//! start of the next turn, up to and including its `turn_complete`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::{
    AgentCallbacks, AgentEvent, AgentLoop, AgentRuntime, ConnectorError, JsonArgs, MessageObserver,
    MessageRole, ObservedMessage, Question, ToolArgs, UserInputReply, UserInputRequest,
};

const ABANDONED_TURN_FEEDBACK: &str = "turn abandoned before approval";

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdinMessage {
    User {
        content: String,
    },
    ApprovalResponse {
        tool_call_id: String,
        approved: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
        args: Value,
    },
    InputResponse {
        request_id: String,
        reply: UserInputReply,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdoutMessage {
    UserMessage {
        #[serde(default)]
        message_id: Option<String>,
        content: String,
    },
    Assistant {
        #[serde(default)]
        message_id: Option<String>,
        content: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    ToolResult {
        tool_call_id: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    ApprovalRequest {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        args: Map<String, Value>,
    },
    AskUser {
        request_id: String,
        #[serde(default)]
        questions: Vec<Question>,
    },
    Error {
        message: String,
    },
    TurnComplete,
    #[serde(other)]
    Unknown,
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Builds one [`StdioAgent`] subprocess per loop.
#[derive(Debug, Clone)]
pub struct StdioRuntime {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl StdioRuntime {
    pub fn new(program: impl Into<String>, args: Vec<String>, cwd: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd,
        }
    }
}

impl AgentRuntime for StdioRuntime {
    fn name(&self) -> &str {
        &self.program
    }

    fn create_loop(&self) -> Result<Arc<dyn AgentLoop>, ConnectorError> {
        let agent = StdioAgent::spawn(&self.program, &self.args, self.cwd.as_deref())?;
        Ok(Arc::new(agent))
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

pub struct StdioAgent {
    stdin_tx: mpsc::Sender<String>,
    stdout_rx: Mutex<mpsc::Receiver<StdoutMessage>>,
    callbacks: RwLock<Option<Arc<dyn AgentCallbacks>>>,
    observer: RwLock<Option<Arc<dyn MessageObserver>>>,
    /// Set while a prompt has been sent and its `turn_complete` not yet read.
    turn_open: AtomicBool,
    _child: StdMutex<Child>,
}

impl StdioAgent {
    /// Spawn `program`. Must be called inside a Tokio runtime.
    pub fn spawn(program: &str, args: &[String], cwd: Option<&Path>) -> Result<Self, ConnectorError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ConnectorError::RuntimeUnavailable(
                "no async runtime to drive the agent process".into(),
            ));
        }

        info!(
            component = "stdio_connector",
            event = "stdio.spawn",
            program = %program,
            cwd = ?cwd,
            "Spawning agent process"
        );

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let mut child = command
            .spawn()
            .map_err(|e| ConnectorError::SpawnError(format!("{program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnectorError::SpawnError("No stdin on child".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectorError::SpawnError("No stdout on child".into()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(
                        component = "stdio_connector",
                        event = "stdio.stderr",
                        line = %line,
                        "Agent stderr"
                    );
                }
            });
        }

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(64);
        let (stdout_tx, stdout_rx) = mpsc::channel::<StdoutMessage>(256);
        tokio::spawn(stdin_writer(stdin, stdin_rx));
        tokio::spawn(stdout_reader(stdout, stdout_tx));

        Ok(Self {
            stdin_tx,
            stdout_rx: Mutex::new(stdout_rx),
            callbacks: RwLock::new(None),
            observer: RwLock::new(None),
            turn_open: AtomicBool::new(false),
            _child: StdMutex::new(child),
        })
    }

    async fn write(&self, message: &StdinMessage) -> Result<(), ConnectorError> {
        let json = serde_json::to_string(message)?;
        debug!(
            component = "stdio_connector",
            event = "stdio.stdin.write",
            payload_len = json.len(),
            "Writing to agent stdin"
        );
        self.stdin_tx
            .send(json)
            .await
            .map_err(|_| ConnectorError::ChannelClosed)
    }

    /// Skip what is left of an abandoned turn. Approval and input requests
    /// still get an answer so the agent does not wait on them.
    async fn discard_abandoned_turn(
        &self,
        stdout: &mut mpsc::Receiver<StdoutMessage>,
    ) -> Result<(), ConnectorError> {
        let mut skipped = 0usize;
        loop {
            let message = stdout.recv().await.ok_or(ConnectorError::ChannelClosed)?;
            match message {
                StdoutMessage::TurnComplete => break,
                StdoutMessage::ApprovalRequest { tool_call_id, args, .. } => {
                    self.write(&StdinMessage::ApprovalResponse {
                        tool_call_id,
                        approved: false,
                        feedback: Some(ABANDONED_TURN_FEEDBACK.into()),
                        args: Value::Object(args),
                    })
                    .await?;
                }
                StdoutMessage::AskUser { request_id, .. } => {
                    self.write(&StdinMessage::InputResponse {
                        request_id,
                        reply: UserInputReply::Answers {
                            answers: Vec::new(),
                            cancelled: true,
                        },
                    })
                    .await?;
                }
                _ => {}
            }
            skipped += 1;
        }
        self.turn_open.store(false, Ordering::Release);
        debug!(
            component = "stdio_connector",
            event = "stdio.turn.discarded",
            skipped,
            "Discarded output of an abandoned turn"
        );
        Ok(())
    }

    fn callbacks(&self) -> Option<Arc<dyn AgentCallbacks>> {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn observe(&self, role: MessageRole, message_id: &Option<String>, content: &str) {
        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer.on_message(&ObservedMessage {
                message_id: message_id.clone(),
                role,
                content: Some(content.to_string()),
            });
        }
    }
}

impl AgentLoop for StdioAgent {
    fn set_callbacks(&self, callbacks: Arc<dyn AgentCallbacks>) {
        *self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callbacks);
    }

    fn set_message_observer(
        &self,
        observer: Arc<dyn MessageObserver>,
    ) -> Option<Arc<dyn MessageObserver>> {
        self.observer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(observer)
    }

    fn act<'a>(&'a self, prompt: &'a str) -> BoxStream<'a, Result<AgentEvent, ConnectorError>> {
        let turn = Turn {
            agent: self,
            prompt: Some(prompt.to_string()),
            stdout: None,
            finished: false,
        };
        stream::unfold(turn, |mut turn| async move {
            if turn.finished {
                return None;
            }
            match turn.next_event().await {
                Ok(Some(event)) => Some((Ok(event), turn)),
                Ok(None) => None,
                Err(e) => {
                    turn.finished = true;
                    Some((Err(e), turn))
                }
            }
        })
        .boxed()
    }
}

/// State of one in-flight turn. Holds the stdout lock so turns never
/// interleave.
struct Turn<'a> {
    agent: &'a StdioAgent,
    prompt: Option<String>,
    stdout: Option<MutexGuard<'a, mpsc::Receiver<StdoutMessage>>>,
    finished: bool,
}

impl Turn<'_> {
    async fn next_event(&mut self) -> Result<Option<AgentEvent>, ConnectorError> {
        if self.stdout.is_none() {
            let mut stdout = self.agent.stdout_rx.lock().await;
            if self.agent.turn_open.load(Ordering::Acquire) {
                self.agent.discard_abandoned_turn(&mut stdout).await?;
            }
            self.stdout = Some(stdout);
        }
        if let Some(content) = self.prompt.take() {
            self.agent.turn_open.store(true, Ordering::Release);
            self.agent.write(&StdinMessage::User { content }).await?;
        }

        loop {
            let next = match self.stdout.as_mut() {
                Some(rx) => rx.recv().await,
                None => None,
            };
            let message = next.ok_or(ConnectorError::ChannelClosed)?;

            match message {
                StdoutMessage::UserMessage {
                    message_id,
                    content,
                } => {
                    self.agent.observe(MessageRole::User, &message_id, &content);
                    return Ok(Some(AgentEvent::UserMessage {
                        message_id,
                        content,
                    }));
                }
                StdoutMessage::Assistant {
                    message_id,
                    content,
                } => {
                    self.agent
                        .observe(MessageRole::Assistant, &message_id, &content);
                    return Ok(Some(AgentEvent::Assistant {
                        message_id,
                        content,
                    }));
                }
                StdoutMessage::ToolCall {
                    tool_call_id,
                    tool_name,
                    args,
                } => {
                    return Ok(Some(AgentEvent::ToolCall {
                        tool_call_id,
                        tool_name,
                        args,
                    }));
                }
                StdoutMessage::ToolResult {
                    tool_call_id,
                    result,
                    error,
                } => {
                    return Ok(Some(AgentEvent::ToolResult {
                        tool_call_id,
                        result,
                        error,
                    }));
                }
                StdoutMessage::ApprovalRequest {
                    tool_call_id,
                    tool_name,
                    args,
                } => {
                    let callbacks = self
                        .agent
                        .callbacks()
                        .ok_or(ConnectorError::MissingCallbacks("approval"))?;
                    let mut args = JsonArgs(args);
                    let reply = callbacks
                        .approve_tool(&tool_name, &mut args, &tool_call_id)
                        .await?;
                    self.agent
                        .write(&StdinMessage::ApprovalResponse {
                            tool_call_id,
                            approved: reply.approved,
                            feedback: reply.feedback,
                            args: args.to_value(),
                        })
                        .await?;
                }
                StdoutMessage::AskUser {
                    request_id,
                    questions,
                } => {
                    let callbacks = self
                        .agent
                        .callbacks()
                        .ok_or(ConnectorError::MissingCallbacks("input"))?;
                    let reply = callbacks
                        .ask_user(&UserInputRequest { questions })
                        .await?;
                    self.agent
                        .write(&StdinMessage::InputResponse { request_id, reply })
                        .await?;
                }
                StdoutMessage::Error { message } => {
                    return Err(ConnectorError::ProviderError(message));
                }
                StdoutMessage::TurnComplete => {
                    self.agent.turn_open.store(false, Ordering::Release);
                    return Ok(None);
                }
                StdoutMessage::Unknown => {
                    debug!(
                        component = "stdio_connector",
                        event = "stdio.stdout.unknown",
                        "Skipping unknown agent message"
                    );
                }
            }
        }
    }
}

async fn stdin_writer(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!(
                component = "stdio_connector",
                event = "stdio.stdin.write_error",
                error = %e,
                "Failed to write to agent stdin"
            );
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!(
                component = "stdio_connector",
                event = "stdio.stdin.flush_error",
                error = %e,
                "Failed to flush agent stdin"
            );
            break;
        }
    }
    debug!(
        component = "stdio_connector",
        event = "stdio.stdin.closed",
        "Stdin writer task ended"
    );
}

async fn stdout_reader(stdout: ChildStdout, tx: mpsc::Sender<StdoutMessage>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<StdoutMessage>(line) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            component = "stdio_connector",
                            event = "stdio.stdout.parse_error",
                            error = %e,
                            line_preview = %line.chars().take(200).collect::<String>(),
                            "Failed to parse agent stdout"
                        );
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(
                    component = "stdio_connector",
                    event = "stdio.stdout.read_error",
                    error = %e,
                    "Failed to read agent stdout"
                );
                break;
            }
        }
    }
    info!(
        component = "stdio_connector",
        event = "stdio.stdout.closed",
        "Agent stdout closed"
    );
}
