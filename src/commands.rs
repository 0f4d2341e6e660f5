//! Housekeeping commands recognised before planning.

use std::sync::Arc;
use std::time::Duration;

use crate::history::ConversationHistory;
use crate::llm::{ChatMessage, ChatOptions, LlmClient};
use crate::prompts::COMMAND_PROMPT;

pub const NEW_TOPIC_MESSAGE: &str = "📝 New Topic Activated! The canvas is clean, and we're eager to explore a new topic with you. Go ahead, ask a question.";
pub const FORGET_ME_MESSAGE: &str = "🚀 Forget Me Activated! Your chat history has been cleared. We're ready to start fresh. Go ahead, ask a question.";
pub const SUPPORT_TICKET_MESSAGE: &str = "We're on it! 🚧 Exciting news: we're working on integrating with Case Management. Right now, creating it isn't an option, but don't worry! 🌟 We'll soon have that capability ready for you!";
pub const FEEDBACK_POSITIVE_MESSAGE: &str = " 😊 Thank you for your feedback! I'm glad you liked the response. Is there anything else you would like to know or discuss?";
pub const FEEDBACK_NEGATIVE_MESSAGE: &str = "📝 I appreciate your feedback! Could you please let me know what specific information you were looking for or how I can improve my response?";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    NewSession,
    NewTopic,
    ForgetMe,
    CreateSupportTicket,
    FeedbackPositive,
    FeedbackNegative,
    SetContext(String),
}

impl Command {
    /// Parse the recogniser's reply; `None` for `notfound` or anything unknown.
    pub fn parse(reply: &str) -> Option<Self> {
        let normalized = reply
            .trim()
            .trim_matches(|c| c == '"' || c == '\'' || c == '.')
            .to_ascii_lowercase();
        let command = match normalized.as_str() {
            "new session" => Command::NewSession,
            "new topic" => Command::NewTopic,
            "forget me" => Command::ForgetMe,
            "create support ticket" => Command::CreateSupportTicket,
            "feedbackpositive" => Command::FeedbackPositive,
            "feedbacknegative" => Command::FeedbackNegative,
            other => {
                let context = match other.strip_prefix("set context ")? {
                    "hr" => "HR",
                    "finance" => "Finance",
                    "sales" => "Sales",
                    "judiciary" => "Judiciary",
                    "procurement" => "Procurement",
                    _ => return None,
                };
                Command::SetContext(context.to_string())
            }
        };
        Some(command)
    }

    pub fn clears_history(&self) -> bool {
        matches!(self, Command::NewSession | Command::NewTopic | Command::ForgetMe)
    }

    /// Canned reply for the command.
    pub fn message(&self) -> String {
        match self {
            Command::NewSession | Command::NewTopic => NEW_TOPIC_MESSAGE.to_string(),
            Command::ForgetMe => FORGET_ME_MESSAGE.to_string(),
            Command::CreateSupportTicket => SUPPORT_TICKET_MESSAGE.to_string(),
            Command::FeedbackPositive => FEEDBACK_POSITIVE_MESSAGE.to_string(),
            Command::FeedbackNegative => FEEDBACK_NEGATIVE_MESSAGE.to_string(),
            Command::SetContext(context) => format!(
                "Current business function context is set to {}. If you need to change the context, \
                 just type 'Set Context' followed by your desired business function.",
                context
            ),
        }
    }
}

pub struct CommandProcessor {
    llm: Arc<dyn LlmClient>,
    history: Arc<dyn ConversationHistory>,
    model: String,
    timeout: Duration,
}

impl CommandProcessor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        history: Arc<dyn ConversationHistory>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            history,
            model: model.into(),
            timeout,
        }
    }

    /// Recognise and apply a command.
    ///
    /// Returns the canned reply, or `None` when planning should continue.
    /// A failed recognition call is logged and treated as "not a command".
    pub async fn process(&self, user_id: &str, query: &str) -> Option<String> {
        let messages = [ChatMessage::system(COMMAND_PROMPT), ChatMessage::user(query)];
        let options = ChatOptions::default().with_max_tokens(20).with_temperature(0.0);

        let reply = match tokio::time::timeout(
            self.timeout,
            self.llm.chat_completion(&self.model, &messages, options),
        )
        .await
        {
            Ok(Ok(response)) => response.text_content().to_string(),
            Ok(Err(e)) => {
                tracing::warn!("Command recognition failed: {}", e);
                return None;
            }
            Err(_) => {
                tracing::warn!("Command recognition timed out");
                return None;
            }
        };

        let command = Command::parse(&reply)?;
        tracing::info!(user_id = %user_id, command = ?command, "Command recognised");
        if command.clears_history() {
            self.history.clear(user_id).await;
        }
        Some(command.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{HistoryEntry, InMemoryHistory};
    use crate::llm::LlmError;
    use crate::test_support::FakeLlm;

    const NEEDLE: &str = "You classify a chat message";

    #[test]
    fn test_parse() {
        assert_eq!(Command::parse("Forget Me"), Some(Command::ForgetMe));
        assert_eq!(Command::parse(" \"new topic\" "), Some(Command::NewTopic));
        assert_eq!(
            Command::parse("set context finance"),
            Some(Command::SetContext("Finance".to_string()))
        );
        assert_eq!(Command::parse("set context marketing"), None);
        assert_eq!(Command::parse("notfound"), None);
        assert_eq!(Command::parse("What is my leave balance?"), None);
    }

    #[test]
    fn test_context_message() {
        let message = Command::SetContext("HR".to_string()).message();
        assert!(message.starts_with("Current business function context is set to HR."));
    }

    async fn processor(llm: FakeLlm) -> (CommandProcessor, Arc<InMemoryHistory>) {
        let history = Arc::new(InMemoryHistory::new());
        history.append("u1", HistoryEntry::user("query", "earlier")).await;
        (
            CommandProcessor::new(Arc::new(llm), history.clone(), "m", Duration::from_secs(5)),
            history,
        )
    }

    #[tokio::test]
    async fn test_forget_me_clears_history() {
        let (p, history) = processor(FakeLlm::new().on(NEEDLE, "forget me")).await;
        assert_eq!(p.process("u1", "please forget me").await.as_deref(), Some(FORGET_ME_MESSAGE));
        assert!(history.recent("u1", 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_feedback_keeps_history() {
        let (p, history) = processor(FakeLlm::new().on(NEEDLE, "feedbackpositive")).await;
        assert_eq!(p.process("u1", "great answer!").await.as_deref(), Some(FEEDBACK_POSITIVE_MESSAGE));
        assert_eq!(history.recent("u1", 10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_not_a_command_continues() {
        let (p, _) = processor(FakeLlm::new().on(NEEDLE, "notfound")).await;
        assert_eq!(p.process("u1", "Weather in Paris?").await, None);
    }

    #[tokio::test]
    async fn test_recognition_error_continues() {
        let (p, history) =
            processor(FakeLlm::new().on_error(NEEDLE, LlmError::network_error("down".to_string()))).await;
        assert_eq!(p.process("u1", "forget me").await, None);
        assert_eq!(history.recent("u1", 10).await.len(), 1);
    }
}
