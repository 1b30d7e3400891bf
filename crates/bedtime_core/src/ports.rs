//! crates/bedtime_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the story pipeline.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific external implementations like databases, model
//! vendors or blob storage.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    Account, Adventure, ChapterContent, ChapterKey, ChatTurn, Completion, JobStatus,
    SamplingParams, Story, StoryContent, StoryImage, StoryJob, StoryStatus, TokenUsage, User,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    /// Rate limiting, timeouts, upstream 5xx. Worth another attempt.
    #[error("A transient error occurred: {0}")]
    Transient(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Unauthorized")]
    Unauthorized,
}

impl PortError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PortError::Transient(_))
    }
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Service Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait DatabaseService: Send + Sync {
    // --- Users and Adventures ---
    async fn get_user(&self, user_id: Uuid) -> PortResult<User>;

    async fn get_adventure(&self, adventure_id: Uuid) -> PortResult<Adventure>;

    // --- Story Lifecycle ---
    /// Creates a pending story and its queued job in one transaction.
    async fn create_story_with_job(
        &self,
        adventure_id: Uuid,
        prompt: &str,
        title: &str,
    ) -> PortResult<(Story, StoryJob)>;

    async fn get_story(&self, story_id: Uuid) -> PortResult<Story>;

    /// Stories of an adventure in the given status, newest first.
    async fn list_stories_by_status(
        &self,
        adventure_id: Uuid,
        status: StoryStatus,
    ) -> PortResult<Vec<Story>>;

    /// Counts stories across all of a user's adventures created in `[from, until)`,
    /// leaving out `exclude` when given.
    async fn count_stories_for_user(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> PortResult<i64>;

    /// Moves a story to `status`, recording `error` when given. Returns `false`
    /// and leaves the row alone when the current status cannot move there.
    async fn update_story_status(
        &self,
        story_id: Uuid,
        status: StoryStatus,
        error: Option<&str>,
    ) -> PortResult<bool>;

    async fn save_outline(&self, story_id: Uuid, title: &str, outline: &str) -> PortResult<()>;

    async fn save_summary(&self, story_id: Uuid, summary: &str) -> PortResult<()>;

    /// Marks a still-processing story completed with its token totals.
    /// Returns `false` if the story had already left `processing`.
    async fn complete_story(&self, story_id: Uuid, usage: TokenUsage) -> PortResult<bool>;

    // --- Content and Images ---
    /// Upserts one chapter, keeping every other chapter already stored.
    async fn save_chapter(
        &self,
        story_id: Uuid,
        key: ChapterKey,
        content: &ChapterContent,
    ) -> PortResult<()>;

    /// Returns empty content when nothing has been written yet.
    async fn get_story_content(&self, story_id: Uuid) -> PortResult<StoryContent>;

    /// Upserts by `(story_id, slot)`.
    async fn save_story_image(&self, image: &StoryImage) -> PortResult<()>;

    // --- Generation Jobs ---
    async fn list_unfinished_jobs(&self) -> PortResult<Vec<StoryJob>>;

    async fn get_job(&self, job_id: Uuid) -> PortResult<StoryJob>;

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> PortResult<()>;
}

#[async_trait]
pub trait AccountService: Send + Sync {
    /// Fetches the subscription tier and account creation time of a user.
    async fn get_account(&self, user_id: Uuid) -> PortResult<Account>;
}

#[async_trait]
pub trait TextGenerationService: Send + Sync {
    /// Sends the full conversation and returns the next assistant message.
    /// Implementations hold no conversation state.
    async fn generate(&self, turns: &[ChatTurn], params: &SamplingParams)
        -> PortResult<Completion>;
}

#[async_trait]
pub trait ImageGenerationService: Send + Sync {
    /// Generates one image and returns its encoded bytes.
    async fn generate_image(&self, prompt: &str) -> PortResult<Bytes>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> PortResult<()>;

    async fn get(&self, key: &str) -> PortResult<Bytes>;

    async fn exists(&self, key: &str) -> PortResult<bool>;
}

#[async_trait]
pub trait CoverDesigner: Send + Sync {
    /// Fits `image` onto the cover canvas and draws the title and author line.
    async fn compose_cover(&self, image: Bytes, title: &str, author: &str) -> PortResult<Bytes>;
}
