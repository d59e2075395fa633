//! Scripted agent loop for bridge, manager and API tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use vibecheck_connectors::{
    AgentCallbacks, AgentEvent, AgentLoop, AgentRuntime, ApprovalReply, ConnectorError,
    MessageObserver, ObservedMessage, ToolArgs, UserInputReply, UserInputRequest,
};

/// One scripted action inside a turn.
pub enum Step {
    Emit(AgentEvent),
    Observe(ObservedMessage),
    Approve {
        tool_call_id: String,
        tool_name: String,
        args: Box<dyn ToolArgs>,
    },
    Ask(UserInputRequest),
    Fail(String),
    Panic(&'static str),
}

/// Plays back one `Vec<Step>` per call to `act`.
#[derive(Default)]
pub struct ScriptedAgent {
    turns: Mutex<VecDeque<Vec<Step>>>,
    prompts: Mutex<Vec<String>>,
    callbacks: Mutex<Option<Arc<dyn AgentCallbacks>>>,
    observer: Mutex<Option<Arc<dyn MessageObserver>>>,
    approvals: Mutex<Vec<(ApprovalReply, Value)>>,
    answers: Mutex<Vec<UserInputReply>>,
}

impl ScriptedAgent {
    pub fn new(turns: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            ..Self::default()
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Approval replies with the arguments as they were after edits.
    pub fn approvals(&self) -> Vec<(ApprovalReply, Value)> {
        self.approvals.lock().unwrap().clone()
    }

    pub fn answers(&self) -> Vec<UserInputReply> {
        self.answers.lock().unwrap().clone()
    }

    fn callbacks(&self) -> Result<Arc<dyn AgentCallbacks>, ConnectorError> {
        self.callbacks
            .lock()
            .unwrap()
            .clone()
            .ok_or(ConnectorError::MissingCallbacks("scripted"))
    }

    fn observer(&self) -> Option<Arc<dyn MessageObserver>> {
        self.observer.lock().unwrap().clone()
    }

    async fn play(&self, step: Step) -> Option<Result<AgentEvent, ConnectorError>> {
        match step {
            Step::Emit(event) => Some(Ok(event)),
            Step::Observe(message) => {
                if let Some(observer) = self.observer() {
                    observer.on_message(&message);
                }
                None
            }
            Step::Approve {
                tool_call_id,
                tool_name,
                mut args,
            } => {
                let callbacks = match self.callbacks() {
                    Ok(callbacks) => callbacks,
                    Err(e) => return Some(Err(e)),
                };
                match callbacks
                    .approve_tool(&tool_name, args.as_mut(), &tool_call_id)
                    .await
                {
                    Ok(reply) => {
                        self.approvals.lock().unwrap().push((reply, args.to_value()));
                        None
                    }
                    Err(e) => Some(Err(e)),
                }
            }
            Step::Ask(request) => {
                let callbacks = match self.callbacks() {
                    Ok(callbacks) => callbacks,
                    Err(e) => return Some(Err(e)),
                };
                match callbacks.ask_user(&request).await {
                    Ok(reply) => {
                        self.answers.lock().unwrap().push(reply);
                        None
                    }
                    Err(e) => Some(Err(e)),
                }
            }
            Step::Fail(message) => Some(Err(ConnectorError::ProviderError(message))),
            Step::Panic(message) => panic!("{message}"),
        }
    }
}

impl AgentLoop for ScriptedAgent {
    fn set_callbacks(&self, callbacks: Arc<dyn AgentCallbacks>) {
        *self.callbacks.lock().unwrap() = Some(callbacks);
    }

    fn set_message_observer(
        &self,
        observer: Arc<dyn MessageObserver>,
    ) -> Option<Arc<dyn MessageObserver>> {
        self.observer.lock().unwrap().replace(observer)
    }

    fn act<'a>(&'a self, prompt: &'a str) -> BoxStream<'a, Result<AgentEvent, ConnectorError>> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let steps: VecDeque<Step> = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default()
            .into();

        stream::unfold((self, steps), |(agent, mut steps)| async move {
            while let Some(step) = steps.pop_front() {
                if let Some(item) = agent.play(step).await {
                    if item.is_err() {
                        steps.clear();
                    }
                    return Some((item, (agent, steps)));
                }
            }
            None
        })
        .boxed()
    }
}

/// Hands out the same scripted agent on every `create_loop`.
pub struct ScriptedRuntime {
    agent: Arc<ScriptedAgent>,
    structured_answers: bool,
}

impl ScriptedRuntime {
    pub fn new(agent: Arc<ScriptedAgent>, structured_answers: bool) -> Self {
        Self {
            agent,
            structured_answers,
        }
    }
}

impl AgentRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        "scripted"
    }

    fn create_loop(&self) -> Result<Arc<dyn AgentLoop>, ConnectorError> {
        Ok(self.agent.clone())
    }

    fn supports_structured_answers(&self) -> bool {
        self.structured_answers
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<ObservedMessage>>,
}

impl RecordingObserver {
    pub fn seen(&self) -> Vec<ObservedMessage> {
        self.seen.lock().unwrap().clone()
    }
}

impl MessageObserver for RecordingObserver {
    fn on_message(&self, message: &ObservedMessage) {
        self.seen.lock().unwrap().push(message.clone());
    }
}
