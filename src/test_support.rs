//! Fakes shared by the unit tests.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::gateway::{Agent, DispatchError, DispatchErrorKind};
use crate::llm::{ChatMessage, ChatOptions, ChatResponse, LlmClient, LlmError, Role};
use crate::registry::AgentKind;

/// Scripted reply of a fake agent.
#[derive(Debug, Clone)]
pub enum FakeReply {
    Ok(String),
    Status(u16),
    Fail(DispatchErrorKind),
}

impl FakeReply {
    pub fn ok(result: impl Into<String>) -> Self {
        FakeReply::Ok(result.into())
    }

    pub fn status(code: u16) -> Self {
        FakeReply::Status(code)
    }
}

/// Agent replaying a script; the last reply repeats once the script runs out.
pub struct FakeAgent {
    name: String,
    kind: AgentKind,
    replies: Mutex<VecDeque<FakeReply>>,
    last: Mutex<Option<FakeReply>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    payloads: Mutex<Vec<Map<String, Value>>>,
}

impl FakeAgent {
    pub fn new(name: &str, replies: Vec<FakeReply>) -> Self {
        Self {
            name: name.to_string(),
            kind: AgentKind::Http,
            replies: Mutex::new(replies.into()),
            last: Mutex::new(None),
            delay: None,
            calls: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Payloads received, in call order.
    pub fn payloads(&self) -> Vec<Map<String, Value>> {
        self.payloads.lock().unwrap().clone()
    }

    fn next_reply(&self) -> FakeReply {
        let mut replies = self.replies.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        match replies.pop_front() {
            Some(reply) => {
                *last = Some(reply.clone());
                reply
            }
            None => last.clone().unwrap_or(FakeReply::Status(500)),
        }
    }
}

#[async_trait]
impl Agent for FakeAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AgentKind {
        self.kind
    }

    async fn invoke(&self, payload: &Map<String, Value>) -> Result<String, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push(payload.clone());
        let reply = self.next_reply();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match reply {
            FakeReply::Ok(result) => Ok(result),
            FakeReply::Status(code) => Err(DispatchError::from_status(&self.name, code, "fake failure")),
            FakeReply::Fail(kind) => Err(DispatchError::new(&self.name, kind, "fake failure")),
        }
    }
}

/// One recorded completion request.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system: String,
    pub user: String,
    pub options: ChatOptions,
}

struct Rule {
    needle: String,
    replies: VecDeque<Result<String, LlmError>>,
}

/// Completion client answering by rule.
///
/// A rule matches when the system prompt contains its needle; each rule
/// replays its replies in order and repeats the last one. Requests that match
/// no rule get the default reply.
pub struct FakeLlm {
    rules: Mutex<Vec<Rule>>,
    default: Result<String, LlmError>,
    delay: Option<Duration>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl Default for FakeLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLlm {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            default: Err(LlmError::server_error(500, "no scripted reply".to_string())),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on(self, needle: &str, reply: impl Into<String>) -> Self {
        self.on_result(needle, Ok(reply.into()))
    }

    pub fn on_error(self, needle: &str, error: LlmError) -> Self {
        self.on_result(needle, Err(error))
    }

    pub fn on_result(self, needle: &str, reply: Result<String, LlmError>) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|r| r.needle == needle) {
                Some(rule) => rule.replies.push_back(reply),
                None => rules.push(Rule {
                    needle: needle.to_string(),
                    replies: VecDeque::from([reply]),
                }),
            }
        }
        self
    }

    pub fn with_default(mut self, reply: impl Into<String>) -> Self {
        self.default = Ok(reply.into());
        self
    }

    /// Latency added to every completion.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of requests whose system prompt contained `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.system.contains(needle)).count()
    }
}

#[async_trait]
impl LlmClient for FakeLlm {
    async fn chat_completion(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let join = |role: Role| {
            messages
                .iter()
                .filter(|m| m.role == role)
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        };
        let system = join(Role::System);
        let user = join(Role::User);
        self.calls.lock().unwrap().push(RecordedCall {
            system: system.clone(),
            user,
            options,
        });

        let reply = {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|r| system.contains(&r.needle)) {
                Some(rule) if rule.replies.len() > 1 => rule.replies.pop_front(),
                Some(rule) => rule.replies.front().cloned(),
                None => None,
            }
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        reply
            .unwrap_or_else(|| self.default.clone())
            .map(ChatResponse::text)
    }
}

/// Progress sink keeping every message.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    messages: Mutex<Vec<String>>,
}

impl RecordingProgress {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl crate::engine::ProgressSink for RecordingProgress {
    fn notify(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}
