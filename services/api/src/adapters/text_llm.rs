//! services/api/src/adapters/text_llm.rs
//!
//! This module contains the adapter for the story-writing LLM.
//! It implements the `TextGenerationService` port from the `core` crate by replaying
//! the whole conversation as OpenAI chat messages on every call.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use bedtime_core::{
    domain::{ChatRole, ChatTurn, Completion, SamplingParams},
    ports::{PortError, PortResult, TextGenerationService},
};
use tracing::debug;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `TextGenerationService` using an OpenAI-compatible LLM.
#[derive(Clone)]
pub struct OpenAiTextAdapter {
    client: Client<OpenAIConfig>,
    model: String,
    system_prompt: Option<String>,
}

impl OpenAiTextAdapter {
    /// Creates a new `OpenAiTextAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self {
            client,
            model,
            system_prompt: None,
        }
    }

    /// Prepends a system message to every request.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    fn to_messages(&self, turns: &[ChatTurn]) -> PortResult<Vec<ChatCompletionRequestMessage>> {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        if let Some(system) = &self.system_prompt {
            messages.push(system_message(system)?);
        }
        for turn in turns {
            let message = match turn.role {
                ChatRole::System => system_message(&turn.content)?,
                ChatRole::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(turn.content.as_str())
                    .build()
                    .map_err(|e| PortError::Unexpected(e.to_string()))?
                    .into(),
                ChatRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(turn.content.as_str())
                    .build()
                    .map_err(|e| PortError::Unexpected(e.to_string()))?
                    .into(),
            };
            messages.push(message);
        }
        Ok(messages)
    }
}

fn system_message(content: &str) -> PortResult<ChatCompletionRequestMessage> {
    Ok(ChatCompletionRequestSystemMessageArgs::default()
        .content(content)
        .build()
        .map_err(|e| PortError::Unexpected(e.to_string()))?
        .into())
}

/// Network failures, rate limits and upstream server errors are transient.
pub fn map_openai_error(e: OpenAIError) -> PortError {
    match &e {
        OpenAIError::Reqwest(_) => PortError::Transient(e.to_string()),
        OpenAIError::ApiError(api) => match api.r#type.as_deref() {
            Some("rate_limit_exceeded") | Some("requests") | Some("tokens")
            | Some("server_error") => PortError::Transient(e.to_string()),
            _ => PortError::Unexpected(e.to_string()),
        },
        _ => PortError::Unexpected(e.to_string()),
    }
}

//=========================================================================================
// `TextGenerationService` Trait Implementation
//=========================================================================================

#[async_trait]
impl TextGenerationService for OpenAiTextAdapter {
    async fn generate(
        &self,
        turns: &[ChatTurn],
        params: &SamplingParams,
    ) -> PortResult<Completion> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .messages(self.to_messages(turns)?)
            .temperature(params.temperature)
            .top_p(params.top_p)
            .n(1);
        if let Some(max_tokens) = params.max_output_tokens {
            builder.max_completion_tokens(max_tokens);
        }
        let request = builder
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_openai_error)?;

        let (input_tokens, output_tokens) = response
            .usage
            .as_ref()
            .map(|u| (u.prompt_tokens as i64, u.completion_tokens as i64))
            .unwrap_or((0, 0));
        debug!(
            "Chat completion used {} input / {} output tokens",
            input_tokens, output_tokens
        );

        // Extract the text content from the first choice in the response.
        let text = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| {
                PortError::Unexpected("Story LLM returned no choices in its response.".to_string())
            })?
            .message
            .content
            .ok_or_else(|| {
                PortError::Unexpected("Story LLM response contained no text content.".to_string())
            })?;

        Ok(Completion {
            text: text.trim().to_string(),
            input_tokens,
            output_tokens,
        })
    }
}
