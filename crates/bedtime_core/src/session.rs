//! crates/bedtime_core/src/session.rs
//!
//! A stateful conversation with a text model, seeded with an adventure's
//! world-building context. The provider port is stateless; the history lives here.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::chunking;
use crate::domain::{ChatTurn, Completion, SamplingParams, TokenUsage};
use crate::ports::{PortResult, TextGenerationService};

/// Messages longer than this are fed to the model in pieces.
pub const OVERSIZE_THRESHOLD: usize = 100_000;
/// Size of each seed-context piece sent when a session opens.
pub const CONTEXT_CHUNK_SIZE: usize = 2_000;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub oversize_threshold: usize,
    pub context_chunk_size: usize,
    /// Used for story requests.
    pub sampling: SamplingParams,
    /// Used while loading the seed context.
    pub context_sampling: SamplingParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            oversize_threshold: OVERSIZE_THRESHOLD,
            context_chunk_size: CONTEXT_CHUNK_SIZE,
            sampling: SamplingParams {
                temperature: 0.7,
                top_p: 0.8,
                max_output_tokens: Some(2_048),
            },
            context_sampling: SamplingParams::with_temperature(0.1),
        }
    }
}

pub struct ModelSession {
    provider: Arc<dyn TextGenerationService>,
    config: SessionConfig,
    history: Vec<ChatTurn>,
}

impl ModelSession {
    /// Starts an empty conversation.
    pub fn new(provider: Arc<dyn TextGenerationService>, config: SessionConfig) -> Self {
        Self {
            provider,
            config,
            history: Vec::new(),
        }
    }

    /// Opens a session and feeds it `seed_context` piece by piece.
    /// Returns the tokens spent on seeding alongside the session.
    pub async fn open(
        provider: Arc<dyn TextGenerationService>,
        seed_context: &str,
        config: SessionConfig,
    ) -> PortResult<(Self, TokenUsage)> {
        let mut session = Self::new(provider, config);
        let mut usage = TokenUsage::default();
        let pieces = chunking::split(seed_context, session.config.context_chunk_size);
        info!("Seeding model session with {} context pieces", pieces.len());
        for piece in pieces {
            let message = format!("Here is part of the story context: {}", piece);
            let params = session.config.context_sampling;
            let completion = session.exchange(&message, &params).await?;
            usage += completion.usage();
        }
        Ok((session, usage))
    }

    /// Sends a message and returns the model's reply.
    ///
    /// Oversized messages are split; every piece but the last is sent as
    /// context, and only the last piece's reply is returned. Errors from the
    /// provider are returned as-is and leave the history untouched.
    pub async fn send(&mut self, message: &str) -> PortResult<Completion> {
        let params = self.config.sampling;
        if message.chars().count() <= self.config.oversize_threshold {
            return self.exchange(message, &params).await;
        }

        let mut pieces = chunking::split(message, self.config.context_chunk_size);
        let last = pieces.pop().unwrap_or_default();
        debug!("Oversized message split into {} pieces", pieces.len() + 1);
        for piece in pieces {
            self.exchange(&piece, &params).await?;
        }
        self.exchange(&last, &params).await
    }

    /// Drops the most recent user message and reply, so a large chapter does
    /// not stay in the context of later requests.
    pub fn forget_last_exchange(&mut self) -> Option<(ChatTurn, ChatTurn)> {
        if self.history.len() < 2 {
            return None;
        }
        let reply = self.history.pop()?;
        let request = self.history.pop()?;
        Some((request, reply))
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    async fn exchange(&mut self, message: &str, params: &SamplingParams) -> PortResult<Completion> {
        info!("Sending model request with prompt length: {}", message.len());
        let start = Instant::now();

        self.history.push(ChatTurn::user(message));
        let completion = match self.provider.generate(&self.history, params).await {
            Ok(completion) => completion,
            Err(e) => {
                self.history.pop();
                return Err(e);
            }
        };
        self.history.push(ChatTurn::assistant(completion.text.clone()));

        info!("Model responded in {:?}", start.elapsed());
        Ok(completion)
    }
}
