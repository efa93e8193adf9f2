//! Dialogue engine
//!
//! Streams a reply from the chat model, speaks it sentence by sentence while
//! it arrives, then parses the full text for actions and a memory write.

pub mod llm;
pub mod protocol;
pub mod sentence;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

pub use llm::{ChatMessage, ChatModel, OpenAiChat, Role, TokenStream};
pub use protocol::{MemoryWrite, ParsedResponse, parse_response};
pub use sentence::SentenceSplitter;

use crate::Error;
use crate::config::LlmConfig;
use crate::memory::MemoryStore;
use crate::persona::Persona;
use crate::voice::SpeakOutcome;

/// Where spoken sentences go while a reply streams in
#[async_trait]
pub trait SpeechOutput: Send {
    async fn say(&mut self, sentence: &str) -> SpeakOutcome;
}

/// Result of one conversational turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Turn {
    /// The reply was spoken in full
    Completed(ParsedResponse),
    /// The wake word cut the reply short
    Interrupted,
    /// The model could not be reached; `apology` has not been spoken
    Unavailable { apology: String },
}

enum Streamed {
    Done(String),
    Interrupted,
    Failed(Error),
}

/// Conversation state and model access
pub struct DialogueEngine {
    model: Arc<dyn ChatModel>,
    memory: MemoryStore,
    base_prompt: String,
    apology: String,
    history: Vec<ChatMessage>,
    history_messages: usize,
    retries: u32,
    retry_delay: Duration,
}

impl DialogueEngine {
    #[must_use]
    pub fn new(
        model: Arc<dyn ChatModel>,
        memory: MemoryStore,
        persona: &Persona,
        config: &LlmConfig,
    ) -> Self {
        let mut engine = Self {
            model,
            memory,
            base_prompt: persona.system_prompt().to_string(),
            apology: persona.phrases.apology.clone(),
            history: Vec::new(),
            history_messages: config.history_messages,
            retries: config.retries.max(1),
            retry_delay: config.retry_delay,
        };
        engine.history.push(engine.system_message());
        engine
    }

    /// Conversation so far; index 0 is always the system turn
    #[must_use]
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Memory store used for prompt rendering and writes
    #[must_use]
    pub const fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Run one turn for `user_text`, speaking the reply through `output`
    pub async fn converse(&mut self, user_text: &str, output: &mut dyn SpeechOutput) -> Turn {
        self.history[0] = self.system_message();
        self.history.push(ChatMessage::user(user_text));
        tracing::debug!(history = self.history.len(), "starting turn");

        for attempt in 1..=self.retries {
            if attempt > 1 {
                tokio::time::sleep(self.retry_delay).await;
            }

            match self.stream_reply(output).await {
                Streamed::Done(text) => {
                    let parsed = parse_response(&text);
                    tracing::info!(
                        actions = ?parsed.actions,
                        has_memory = parsed.memory.is_some(),
                        "reply complete"
                    );
                    self.store_memory(&parsed);
                    self.history.push(ChatMessage::assistant(text));
                    self.prune();
                    return Turn::Completed(parsed);
                }
                Streamed::Interrupted => {
                    tracing::info!("turn interrupted by wake word");
                    self.prune();
                    return Turn::Interrupted;
                }
                Streamed::Failed(e) => {
                    tracing::warn!(attempt, attempts = self.retries, error = %e, "chat attempt failed");
                }
            }
        }

        if self.history.last().is_some_and(|m| m.role == Role::User) {
            self.history.pop();
        }
        tracing::error!("chat model unavailable");
        Turn::Unavailable {
            apology: self.apology.clone(),
        }
    }

    /// One-shot reaction to a system event or an exploration observation
    ///
    /// Conversation history is left untouched. A memory write in the reply is
    /// stored; speaking and acting on it is up to the caller.
    pub async fn react(&self, event: &str) -> Option<ParsedResponse> {
        let messages = [self.system_message(), ChatMessage::user(event)];
        match self.model.complete(&messages).await {
            Ok(text) => {
                let parsed = parse_response(&text);
                self.store_memory(&parsed);
                Some(parsed)
            }
            Err(e) => {
                tracing::warn!(error = %e, event, "system event reaction failed");
                None
            }
        }
    }

    async fn stream_reply(&self, output: &mut dyn SpeechOutput) -> Streamed {
        let mut stream = match self.model.stream_chat(&self.history).await {
            Ok(stream) => stream,
            Err(e) => return Streamed::Failed(e),
        };

        let mut splitter = SentenceSplitter::new();
        let mut text = String::new();
        let mut spoke = false;

        while let Some(token) = stream.next().await {
            let token = match token {
                Ok(token) => token,
                // Once something was said, keep what arrived instead of repeating it
                Err(e) if spoke => {
                    tracing::warn!(error = %e, "reply stream broke off");
                    break;
                }
                Err(e) => return Streamed::Failed(e),
            };
            text.push_str(&token);

            for sentence in splitter.push(&token) {
                spoke = true;
                if say(output, &sentence).await == SpeakOutcome::Interrupted {
                    return Streamed::Interrupted;
                }
            }
        }

        if let Some(rest) = splitter.finish() {
            if say(output, &rest).await == SpeakOutcome::Interrupted {
                return Streamed::Interrupted;
            }
        }

        Streamed::Done(text)
    }

    fn system_message(&self) -> ChatMessage {
        let memories = self.memory.format_for_prompt();
        if memories.is_empty() {
            ChatMessage::system(self.base_prompt.clone())
        } else {
            ChatMessage::system(format!("{}\n\n{memories}", self.base_prompt))
        }
    }

    fn store_memory(&self, parsed: &ParsedResponse) {
        if let Some(write) = &parsed.memory {
            match self.memory.add_observation(&write.entity, &write.observation) {
                Ok(()) => tracing::info!(entity = %write.entity, "memory stored"),
                Err(e) => tracing::warn!(error = %e, "failed to store memory"),
            }
        }
    }

    /// Keep the system turn plus the most recent messages
    fn prune(&mut self) {
        let keep = self.history_messages + 1;
        if self.history.len() > keep {
            let excess = self.history.len() - keep;
            self.history.drain(1..=excess);
            tracing::debug!(pruned = excess, "pruned conversation history");
        }
    }
}

async fn say(output: &mut dyn SpeechOutput, sentence: &str) -> SpeakOutcome {
    let outcome = output.say(sentence).await;
    if outcome == SpeakOutcome::Failed {
        tracing::warn!(sentence, "sentence could not be spoken");
    }
    outcome
}
