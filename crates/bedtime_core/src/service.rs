//! crates/bedtime_core/src/service.rs
//!
//! Entry points used by the web layer: queue a story, poll its status, read it.

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::domain::{Story, StoryContent, StoryJob, StoryStatus};
use crate::ports::{DatabaseService, PortError, PortResult};

/// Status snapshot returned to pollers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryProgress {
    pub story_id: Uuid,
    pub status: StoryStatus,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct StoryService {
    db: Arc<dyn DatabaseService>,
}

impl StoryService {
    pub fn new(db: Arc<dyn DatabaseService>) -> Self {
        Self { db }
    }

    /// Creates a pending story with a queued job. The caller hands the job to
    /// the worker pool; the job row makes the request survive a restart.
    pub async fn submit(
        &self,
        user_id: Uuid,
        adventure_id: Uuid,
        prompt: &str,
    ) -> PortResult<StoryJob> {
        let adventure = self.db.get_adventure(adventure_id).await?;
        if adventure.user_id != user_id {
            return Err(PortError::Unauthorized);
        }
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(PortError::InvalidInput("prompt must not be empty".to_string()));
        }

        let title = format!("Story {}", adventure.story_count + 1);
        let (story, job) = self
            .db
            .create_story_with_job(adventure_id, prompt, &title)
            .await?;
        info!("Queued story {} (job {}) for adventure {}", story.id, job.id, adventure_id);
        Ok(job)
    }

    pub async fn status(&self, story_id: Uuid) -> PortResult<StoryProgress> {
        let story = self.db.get_story(story_id).await?;
        Ok(StoryProgress {
            story_id: story.id,
            status: story.status,
            error: story.error,
        })
    }

    /// The story and whatever chapters have been written so far.
    pub async fn content(&self, story_id: Uuid) -> PortResult<(Story, StoryContent)> {
        let story = self.db.get_story(story_id).await?;
        let content = self.db.get_story_content(story_id).await?;
        Ok((story, content))
    }

    /// Owner of the adventure a story belongs to.
    pub async fn owner_of(&self, story_id: Uuid) -> PortResult<Uuid> {
        let story = self.db.get_story(story_id).await?;
        let adventure = self.db.get_adventure(story.adventure_id).await?;
        Ok(adventure.user_id)
    }
}
