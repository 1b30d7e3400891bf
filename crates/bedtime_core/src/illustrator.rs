//! crates/bedtime_core/src/illustrator.rs
//!
//! Generates story images, stores them under the owner's blob prefix, and
//! turns the stored cover into a titled book cover.
//!
//! Nothing here is fatal to a story: failures are logged and reported as
//! `None` / `false` to the caller.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::domain::{ImageSlot, Story, StoryImage, User};
use crate::ports::{
    BlobStore, CoverDesigner, DatabaseService, ImageGenerationService, PortError, PortResult,
};

pub const IMAGE_CONTENT_TYPE: &str = "image/jpeg";

/// The story an image belongs to, plus the owner that names its blob prefix.
#[derive(Debug, Clone, Copy)]
pub struct IllustrationTarget<'a> {
    pub story: &'a Story,
    pub owner: &'a User,
}

impl IllustrationTarget<'_> {
    pub fn blob_key(&self, slot: ImageSlot) -> String {
        blob_key(&self.owner.username, self.story.adventure_id, self.story.id, slot)
    }

    /// Title printed on the cover.
    pub fn cover_title(&self) -> String {
        let title = self.story.title.trim();
        if title.is_empty() {
            format!("Story #{}", self.story.id)
        } else {
            title.to_string()
        }
    }
}

/// `{username}/adventure_{adventure_id}/story_{story_id}/{file}`.
pub fn blob_key(username: &str, adventure_id: Uuid, story_id: Uuid, slot: ImageSlot) -> String {
    format!(
        "{}/adventure_{}/story_{}/{}",
        key_segment(username),
        adventure_id,
        story_id,
        slot.file_name()
    )
}

/// Keeps a user-supplied name to a single path segment of `[A-Za-z0-9_-]`.
fn key_segment(raw: &str) -> String {
    let segment: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if segment.is_empty() {
        "_".to_string()
    } else {
        segment
    }
}

pub struct ImageGenerator {
    images: Arc<dyn ImageGenerationService>,
    blobs: Arc<dyn BlobStore>,
    designer: Arc<dyn CoverDesigner>,
    db: Arc<dyn DatabaseService>,
}

impl ImageGenerator {
    pub fn new(
        images: Arc<dyn ImageGenerationService>,
        blobs: Arc<dyn BlobStore>,
        designer: Arc<dyn CoverDesigner>,
        db: Arc<dyn DatabaseService>,
    ) -> Self {
        Self {
            images,
            blobs,
            designer,
            db,
        }
    }

    /// Returns the generated image, or `None` when generation fails or yields nothing.
    pub async fn generate(&self, prompt: &str) -> Option<Bytes> {
        match self.try_generate(prompt).await {
            Ok(image) => Some(image),
            Err(e) => {
                error!("Image generation failed: {}", e);
                None
            }
        }
    }

    /// Writes the image to its slot, replacing any earlier one. Returns `false` on failure.
    pub async fn store(
        &self,
        target: IllustrationTarget<'_>,
        image: Bytes,
        slot: ImageSlot,
        text_marker: Option<&str>,
    ) -> bool {
        match self.try_store(target, image, slot, text_marker).await {
            Ok(()) => true,
            Err(e) => {
                error!("Error storing image for story {}: {}", target.story.id, e);
                false
            }
        }
    }

    /// One generate-then-store attempt. Errors are returned so callers can retry.
    pub async fn generate_and_store(
        &self,
        target: IllustrationTarget<'_>,
        prompt: &str,
        slot: ImageSlot,
    ) -> PortResult<()> {
        debug!("Generating image for story {} with prompt: {}", target.story.id, prompt);
        let image = self
            .generate(prompt)
            .await
            .ok_or_else(|| PortError::Unexpected("no image was generated".to_string()))?;
        if !self.store(target, image, slot, Some(prompt)).await {
            return Err(PortError::Unexpected(format!(
                "{} image could not be stored",
                slot.slot_key()
            )));
        }
        Ok(())
    }

    /// Reworks the stored cover into the final book cover. Returns `false` on failure.
    pub async fn decorate_cover(&self, target: IllustrationTarget<'_>) -> bool {
        match self.try_decorate_cover(target).await {
            Ok(()) => {
                info!("Added cover data for story {}", target.story.id);
                true
            }
            Err(e) => {
                error!("Failed to add cover data for story {}: {}", target.story.id, e);
                false
            }
        }
    }

    async fn try_generate(&self, prompt: &str) -> PortResult<Bytes> {
        info!("Starting image generation with prompt length: {}", prompt.len());
        let image = self.images.generate_image(prompt).await?;
        if image.is_empty() {
            return Err(PortError::Unexpected("Received empty image bytes".to_string()));
        }
        debug!("Received image bytes of length: {}", image.len());
        Ok(image)
    }

    async fn try_store(
        &self,
        target: IllustrationTarget<'_>,
        image: Bytes,
        slot: ImageSlot,
        text_marker: Option<&str>,
    ) -> PortResult<()> {
        let key = target.blob_key(slot);
        self.blobs.put(&key, image, IMAGE_CONTENT_TYPE).await?;
        self.db
            .save_story_image(&StoryImage {
                story_id: target.story.id,
                slot,
                blob_key: key.clone(),
                text_marker: text_marker.map(str::to_string),
            })
            .await?;
        debug!("Image saved for story {} as {}", target.story.id, key);
        Ok(())
    }

    async fn try_decorate_cover(&self, target: IllustrationTarget<'_>) -> PortResult<()> {
        let key = target.blob_key(ImageSlot::Cover);
        if !self.blobs.exists(&key).await? {
            return Err(PortError::NotFound(format!("cover image {}", key)));
        }
        let original = self.blobs.get(&key).await?;
        let cover = self
            .designer
            .compose_cover(original, &target.cover_title(), &target.owner.author_name())
            .await?;
        self.blobs.put(&key, cover, IMAGE_CONTENT_TYPE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChapterKey, StoryStatus};
    use chrono::Utc;

    fn story(title: &str) -> Story {
        Story {
            id: Uuid::nil(),
            adventure_id: Uuid::nil(),
            prompt: "a dragon learns to read".into(),
            title: title.into(),
            outline: None,
            summary: None,
            status: StoryStatus::Processing,
            error: None,
            input_tokens: 0,
            output_tokens: 0,
            audio_ref: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn owner() -> User {
        User {
            user_id: Uuid::nil(),
            username: "reader".into(),
            display_name: None,
        }
    }

    #[test]
    fn test_blob_keys_follow_layout() {
        let story = story("Title");
        let owner = owner();
        let target = IllustrationTarget { story: &story, owner: &owner };
        let nil = Uuid::nil();
        assert_eq!(
            target.blob_key(ImageSlot::Cover),
            format!("reader/adventure_{}/story_{}/cover.jpg", nil, nil)
        );
        assert_eq!(
            target.blob_key(ImageSlot::Chapter(ChapterKey::new(2, 4))),
            format!("reader/adventure_{}/story_{}/Part2_Chapter4.jpg", nil, nil)
        );
    }

    #[test]
    fn test_usernames_stay_inside_their_prefix() {
        let nil = Uuid::nil();
        assert_eq!(
            blob_key("../admin", nil, nil, ImageSlot::Cover),
            format!("___admin/adventure_{}/story_{}/cover.jpg", nil, nil)
        );
        assert!(blob_key("a/b\\c", nil, nil, ImageSlot::Cover).starts_with("a_b_c/"));
        assert!(blob_key("", nil, nil, ImageSlot::Cover).starts_with("_/adventure_"));
        assert!(blob_key("sam-o_k", nil, nil, ImageSlot::Cover).starts_with("sam-o_k/"));
    }

    #[test]
    fn test_cover_title_fallback() {
        let untitled = story("  ");
        let owner = owner();
        let target = IllustrationTarget { story: &untitled, owner: &owner };
        assert_eq!(target.cover_title(), format!("Story #{}", Uuid::nil()));
    }
}
