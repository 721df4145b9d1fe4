//! Dialogue Generation
//!
//! The generator turns a persona and the current topic node into the host's
//! next line. It is an external, possibly slow and unreliable collaborator, so
//! its outcome is an explicit [`Generation`] value rather than an error the
//! caller has to unwind through.

use crate::persona::HostPersona;
use anyhow::{Context, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;

/// Outcome of one generation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Generation {
    /// The host has something to say.
    Utterance(String),
    /// Nothing was produced; the reason is for the logs.
    Failed(String),
}

/// Defines the contract for anything that can voice a host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DialogueGenerator: Send + Sync {
    /// Produces the host's next utterance for a topic node.
    ///
    /// # Arguments
    ///
    /// * `persona` - Who is speaking.
    /// * `label` - The current node's label.
    /// * `content` - The current node's guidance text.
    async fn generate(&self, persona: &HostPersona, label: &str, content: &str) -> Generation;

    /// A human started talking; in-flight output should stop.
    async fn activity_started(&self) {}

    /// Every human participant has gone quiet again.
    async fn activity_ended(&self) {}
}

/// A `DialogueGenerator` backed by any OpenAI-compatible chat completion API.
pub struct OpenAICompatibleGenerator {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleGenerator {
    /// Creates a new generator.
    ///
    /// # Arguments
    ///
    /// * `config` - API key and base URL of the service.
    /// * `model` - Model identifier used for chat completions (e.g., "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }

    async fn complete(&self, persona: &HostPersona, label: &str, content: &str) -> Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(persona.instructions_for(label, content))
                    .build()?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content("It is your turn to speak. Say your next line, in character, and nothing else.")
                    .build()?
                    .into(),
            ])
            .build()?;

        let response = self.client.chat().create(request).await?;

        let text = response
            .choices
            .first()
            .context("No response choice from LLM")?
            .message
            .content
            .as_ref()
            .context("No content in LLM response")?
            .trim()
            .to_string();

        anyhow::ensure!(!text.is_empty(), "LLM returned an empty utterance");
        Ok(text)
    }
}

#[async_trait]
impl DialogueGenerator for OpenAICompatibleGenerator {
    async fn generate(&self, persona: &HostPersona, label: &str, content: &str) -> Generation {
        match self.complete(persona, label, content).await {
            Ok(text) => Generation::Utterance(text),
            Err(e) => Generation::Failed(format!("{e:#}")),
        }
    }
}

/// A deterministic generator for local runs without an LLM.
///
/// Each utterance names the speaker and restates the node guidance.
pub struct EchoDialogueGenerator;

#[async_trait]
impl DialogueGenerator for EchoDialogueGenerator {
    async fn generate(&self, persona: &HostPersona, label: &str, content: &str) -> Generation {
        Generation::Utterance(format!("{} on {}: {}", persona.name, label, content))
    }
}
