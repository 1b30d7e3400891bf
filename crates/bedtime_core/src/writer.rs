//! crates/bedtime_core/src/writer.rs
//!
//! Writes a story chapter by chapter from a validated outline.
//!
//! Every chapter is generated in the seeded session, summarized by a separate
//! stateless model, persisted, and illustrated. The running summary is what
//! carries continuity from one chapter to the next, so each chapter exchange is
//! dropped from the session once its text is saved.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::domain::{
    AgeBand, ChapterContent, ChapterKey, ChatTurn, Completion, ImageSlot, SamplingParams, Story,
    TokenUsage, User,
};
use crate::error::PipelineError;
use crate::illustrator::{IllustrationTarget, ImageGenerator};
use crate::outline::{Outline, OutlineSchema, OutlineViolation};
use crate::ports::{BlobStore, DatabaseService, PortResult, TextGenerationService};
use crate::retry::{self, RetryPolicy};
use crate::session::ModelSession;

pub const INITIAL_SUMMARY: &str = "This is the first chapter. ";
pub const INITIAL_LAST_SUMMARY: &str = "1st chapter";
pub const IMAGE_PROMPT_PREFIX: &str = "Create an image of: ";

#[derive(Debug, Clone)]
pub struct WriterSettings {
    /// Blob holding the house writing rules appended to every chapter request.
    pub rules_key: String,
    pub summary_sampling: SamplingParams,
    pub retry: RetryPolicy,
}

pub struct StoryWriter {
    db: Arc<dyn DatabaseService>,
    blobs: Arc<dyn BlobStore>,
    summary_model: Arc<dyn TextGenerationService>,
    illustrator: Arc<ImageGenerator>,
    settings: WriterSettings,
}

impl StoryWriter {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        blobs: Arc<dyn BlobStore>,
        summary_model: Arc<dyn TextGenerationService>,
        illustrator: Arc<ImageGenerator>,
        settings: WriterSettings,
    ) -> Self {
        Self {
            db,
            blobs,
            summary_model,
            illustrator,
            settings,
        }
    }

    /// Writes every chapter of `outline`, then the story summary and cover.
    /// Chapter text failures are fatal; image and summary failures are logged
    /// and skipped.
    pub async fn write(
        &self,
        outline: &Outline,
        band: AgeBand,
        session: &mut ModelSession,
        prompt: &str,
        story: &mut Story,
        owner: &User,
    ) -> Result<TokenUsage, PipelineError> {
        debug!("Starting story writing process for story {}", story.id);
        let schema = OutlineSchema::for_band(band);
        let rules = self.load_rules().await?;
        let outline_json = serde_json::to_string(outline)?;

        let mut usage = TokenUsage::default();
        let mut summary = INITIAL_SUMMARY.to_string();
        let mut last_summary = INITIAL_LAST_SUMMARY.to_string();

        for key in schema.chapter_keys() {
            let chapter_title = outline.chapter_title(key).ok_or_else(|| {
                OutlineViolation(format!("Missing {} in {}", key.chapter_key(), key.part_key()))
            })?;

            let request = chapter_request(&ChapterRequest {
                key,
                schema: &schema,
                chapter_title,
                summary: &summary,
                prompt,
                story_title: &story.title,
                outline: &outline_json,
                band,
                rules: &rules,
            });

            debug!("Generating content for {}", key);
            let completion = retry::send_with_retry(session, &request, &self.settings.retry).await?;
            usage += completion.usage();
            session.forget_last_exchange();
            let chapter_text = completion.text;

            let summary_request = format!(
                "You are writing a story about: {prompt}\n\
                 The summary response from the previous chapter: {last_summary}\n\
                 The content generated here will be for your own reference.\n\
                 Write and organize this response in the most concise way that you can still reference it easily.\n\
                 Each of these responses will be presented back to you to continue writing.\n\
                 They will also be collected for another instance of your model to reference. They are not for the reader.\n\
                 Please summarize the current chapter content concisely:\n{chapter_text}\n\
                 Add a note at the end to tell yourself about any plot elements that need to be continued or built upon based on the writing rules.\n\
                 Cross reference the previous summary and notes with the current chapter to write notes for the next chapter",
            );
            let summary_completion = self.complete(&summary_request).await?;
            usage += summary_completion.usage();
            let chapter_summary = clean_model_text(&summary_completion.text, &['`', '"', '\'']);

            self.db
                .save_chapter(
                    story.id,
                    key,
                    &ChapterContent {
                        full_text: chapter_text,
                        summary: chapter_summary.clone(),
                    },
                )
                .await?;
            debug!("Updated summary after {}", key);

            let target = IllustrationTarget {
                story: &*story,
                owner,
            };
            let image_request = format!(
                "Choose an element of this story summary: {}.\n\
                 Describe it visually as you would to someone not there.",
                chapter_summary
            );
            usage += self
                .illustrate(target, ImageSlot::Chapter(key), &image_request)
                .await;

            summary.push_str(&chapter_summary);
            summary.push(' ');
            last_summary = chapter_summary;
        }
        info!("Story writing completed successfully for story {}", story.id);

        usage += self.finish(story, owner, &summary).await;
        Ok(usage)
    }

    /// Short summary for listings, then the cover image and its title overlay.
    /// The chapters are already saved, so a failure here leaves the story
    /// without a summary or cover rather than failing it.
    async fn finish(&self, story: &mut Story, owner: &User, full_summary: &str) -> TokenUsage {
        let mut usage = TokenUsage::default();
        let request = format!(
            "Create a compelling 2 to 3 sentence summary of this story:\n{}\n\n\
             Provide ONLY the summary with no additional text or formatting.",
            full_summary
        );
        let short_summary = match self.summarize(story, &request, &mut usage).await {
            Ok(summary) => summary,
            Err(e) => {
                error!("Error creating story summary for story {}: {}", story.id, e);
                return usage;
            }
        };
        info!("Successfully created and saved summary for story {}", story.id);

        let target = IllustrationTarget {
            story: &*story,
            owner,
        };
        let cover_request = format!(
            "Pick an element from this story summary: {}.\n\
             Describe this choice visually as you would to someone not there.",
            short_summary
        );
        usage += self.illustrate(target, ImageSlot::Cover, &cover_request).await;
        self.illustrator.decorate_cover(target).await;

        usage
    }

    async fn summarize(
        &self,
        story: &mut Story,
        request: &str,
        usage: &mut TokenUsage,
    ) -> PortResult<String> {
        let completion = self.complete(request).await?;
        *usage += completion.usage();
        let short_summary = clean_model_text(&completion.text, &['`', '"', '\'']);
        self.db.save_summary(story.id, &short_summary).await?;
        story.summary = Some(short_summary.clone());
        Ok(short_summary)
    }

    async fn load_rules(&self) -> PortResult<String> {
        let raw = self.blobs.get(&self.settings.rules_key).await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    async fn complete(&self, request: &str) -> PortResult<Completion> {
        retry::generate_with_retry(
            self.summary_model.as_ref(),
            &[ChatTurn::user(request)],
            &self.settings.summary_sampling,
            &self.settings.retry,
        )
        .await
    }

    /// Up to `retry.max_attempts` tries at deriving a picture description and
    /// storing the image. Gives up quietly.
    async fn illustrate(
        &self,
        target: IllustrationTarget<'_>,
        slot: ImageSlot,
        description_request: &str,
    ) -> TokenUsage {
        let mut usage = TokenUsage::default();
        let mut delays = self.settings.retry.delays();
        let mut attempt = 1;
        loop {
            match self
                .illustrate_once(target, slot, description_request, &mut usage)
                .await
            {
                Ok(()) => {
                    debug!("Generated {} image for story {}", slot.slot_key(), target.story.id);
                    break;
                }
                Err(e) => {
                    error!(
                        "Error {} making {} image for story {}: {}",
                        attempt,
                        slot.slot_key(),
                        target.story.id,
                        e
                    );
                    match delays.next() {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => {
                            warn!(
                                "Giving up on {} image for story {}",
                                slot.slot_key(),
                                target.story.id
                            );
                            break;
                        }
                    }
                    attempt += 1;
                }
            }
        }
        usage
    }

    async fn illustrate_once(
        &self,
        target: IllustrationTarget<'_>,
        slot: ImageSlot,
        description_request: &str,
        usage: &mut TokenUsage,
    ) -> PortResult<()> {
        let description = self
            .summary_model
            .generate(
                &[ChatTurn::user(description_request)],
                &self.settings.summary_sampling,
            )
            .await?;
        *usage += description.usage();
        let cleaned = clean_model_text(&description.text, &['`', '"', '\'', '*', '#']);
        let prompt = format!("{}{}", IMAGE_PROMPT_PREFIX, cleaned);
        self.illustrator.generate_and_store(target, &prompt, slot).await
    }
}

struct ChapterRequest<'a> {
    key: ChapterKey,
    schema: &'a OutlineSchema,
    chapter_title: &'a str,
    summary: &'a str,
    prompt: &'a str,
    story_title: &'a str,
    outline: &'a str,
    band: AgeBand,
    rules: &'a str,
}

fn chapter_request(req: &ChapterRequest<'_>) -> String {
    format!(
        "Now write the content for {part_key}, {chapter_key}: \"{chapter_title}\"\n\n\
         Story context so far: {summary}\n\n\
         Remember:\n\
         - This is part of the story about: {prompt}, the title is: {title}, and the outline is: {outline}.\n\
         - This is Part {part} of {parts}, Chapter {chapter} of {chapters}\n\
         - The chapter should follow from the previous content\n\
         - Keep the style and tone consistent with the age group {age_group}\n\
         - The chapter should be about {words} words\n\
         - You are an expert assistant that provides direct and concise responses\n\
         - Do not include any introductory or conversational phrases such as 'Sure, here is a...', 'Here's the information you requested:', etc.\n\
         - Your responses should consist solely of the requested information or text, without any additional commentary or framing\n\
         - Ensure that the output contains only the actual content and nothing else\n\
         - Follow these rules as you construct the story: {rules}",
        part_key = req.key.part_key(),
        chapter_key = req.key.chapter_key(),
        chapter_title = req.chapter_title,
        summary = req.summary,
        prompt = req.prompt,
        title = req.story_title,
        outline = req.outline,
        part = req.key.part,
        parts = req.schema.parts,
        chapter = req.key.chapter,
        chapters = req.schema.chapters,
        age_group = req.band.label(),
        words = req.band.target_words(),
        rules = req.rules,
    )
}

/// Trims `strip` characters from both ends and folds the text onto one line.
pub fn clean_model_text(text: &str, strip: &[char]) -> String {
    text.trim()
        .trim_matches(|c| strip.contains(&c))
        .replace('\n', " ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_model_text() {
        assert_eq!(
            clean_model_text("  ```\"A dragon\nreads.\"```  ", &['`', '"', '\'']),
            "A dragon reads."
        );
        assert_eq!(
            clean_model_text("**# A castle at dusk #**", &['`', '"', '\'', '*', '#']),
            "A castle at dusk"
        );
    }

    #[test]
    fn test_chapter_request_mentions_position_and_rules() {
        let schema = OutlineSchema::for_band(AgeBand::ThreeToSix);
        let text = chapter_request(&ChapterRequest {
            key: ChapterKey::new(2, 3),
            schema: &schema,
            chapter_title: "The Library",
            summary: INITIAL_SUMMARY,
            prompt: "a dragon learns to read",
            story_title: "Ember Reads",
            outline: "{}",
            band: AgeBand::ThreeToSix,
            rules: "No cliffhangers.",
        });
        assert!(text.starts_with("Now write the content for Part 2, Chapter 3: \"The Library\""));
        assert!(text.contains("This is Part 2 of 2, Chapter 3 of 3"));
        assert!(text.contains("age group 3 through 6"));
        assert!(text.contains("about 150 words"));
        assert!(text.ends_with("No cliffhangers."));
    }
}
