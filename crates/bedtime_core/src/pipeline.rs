//! crates/bedtime_core/src/pipeline.rs
//!
//! Drives one story from admission to completion: duplicate reconciliation,
//! quota, session seeding, outline, chapters. Any failure lands on the story
//! as `failed` with the error text.

use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::{JobStatus, SamplingParams, Story, StoryStatus, TokenUsage};
use crate::error::PipelineError;
use crate::illustrator::ImageGenerator;
use crate::outline::OutlineEngine;
use crate::ports::{
    AccountService, BlobStore, CoverDesigner, DatabaseService, ImageGenerationService, PortResult,
    TextGenerationService,
};
use crate::quota::QuotaGate;
use crate::retry::RetryPolicy;
use crate::session::{ModelSession, SessionConfig};
use crate::writer::{StoryWriter, WriterSettings};

pub const DUPLICATE_MESSAGE: &str =
    "Story generation cancelled - duplicate processing story found";
pub const DEFAULT_RULES_KEY: &str = "rules/story_rules.txt";

/// The adapters a pipeline run talks to.
#[derive(Clone)]
pub struct PipelinePorts {
    pub db: Arc<dyn DatabaseService>,
    pub accounts: Arc<dyn AccountService>,
    /// Backs the stateful story session.
    pub story_model: Arc<dyn TextGenerationService>,
    /// Summaries, image descriptions and outline repair.
    pub helper_model: Arc<dyn TextGenerationService>,
    pub images: Arc<dyn ImageGenerationService>,
    pub blobs: Arc<dyn BlobStore>,
    pub cover_designer: Arc<dyn CoverDesigner>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub session: SessionConfig,
    pub retry: RetryPolicy,
    pub summary_sampling: SamplingParams,
    pub repair_sampling: SamplingParams,
    pub rules_key: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            retry: RetryPolicy::default(),
            summary_sampling: SamplingParams::with_temperature(0.3),
            repair_sampling: SamplingParams::with_temperature(0.1),
            rules_key: DEFAULT_RULES_KEY.to_string(),
        }
    }
}

/// How a run ended for the story it picked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub story_id: Uuid,
    pub status: StoryStatus,
    pub usage: TokenUsage,
    pub error: Option<String>,
}

pub struct Orchestrator {
    db: Arc<dyn DatabaseService>,
    story_model: Arc<dyn TextGenerationService>,
    quota: QuotaGate,
    outline: OutlineEngine,
    writer: StoryWriter,
    session_config: SessionConfig,
}

impl Orchestrator {
    pub fn new(ports: PipelinePorts, settings: PipelineSettings) -> Self {
        let illustrator = Arc::new(ImageGenerator::new(
            ports.images.clone(),
            ports.blobs.clone(),
            ports.cover_designer.clone(),
            ports.db.clone(),
        ));
        let writer = StoryWriter::new(
            ports.db.clone(),
            ports.blobs.clone(),
            ports.helper_model.clone(),
            illustrator,
            WriterSettings {
                rules_key: settings.rules_key.clone(),
                summary_sampling: settings.summary_sampling,
                retry: settings.retry.clone(),
            },
        );
        let outline = OutlineEngine::new(
            ports.db.clone(),
            ports.helper_model.clone(),
            settings.repair_sampling,
            settings.retry.clone(),
        );
        Self {
            quota: QuotaGate::new(ports.accounts.clone(), ports.db.clone()),
            db: ports.db,
            story_model: ports.story_model,
            outline,
            writer,
            session_config: settings.session,
        }
    }

    /// Moves a queued story into `processing`. Returns `false` when the story
    /// already finished, in which case there is nothing to run.
    pub async fn claim(&self, story_id: Uuid) -> PortResult<bool> {
        let story = self.db.get_story(story_id).await?;
        match story.status {
            StoryStatus::Pending => {
                if self
                    .db
                    .update_story_status(story_id, StoryStatus::Processing, None)
                    .await?
                {
                    return Ok(true);
                }
                // Another worker moved it first.
                let current = self.db.get_story(story_id).await?.status;
                Ok(current == StoryStatus::Processing)
            }
            StoryStatus::Processing => Ok(true),
            StoryStatus::Completed | StoryStatus::Failed => {
                info!("Story {} already {}, skipping", story_id, story.status);
                Ok(false)
            }
        }
    }

    /// Runs the pipeline for the newest processing story of an adventure,
    /// failing any older processing duplicates first.
    pub async fn run_for_adventure(&self, adventure_id: Uuid) -> PortResult<Option<RunOutcome>> {
        match self.reconcile(adventure_id).await? {
            Some(canonical) => Ok(Some(self.run_story(canonical).await)),
            None => Ok(None),
        }
    }

    /// Fails every processing story of the adventure except the newest one
    /// and returns that one.
    async fn reconcile(&self, adventure_id: Uuid) -> PortResult<Option<Story>> {
        let processing = self
            .db
            .list_stories_by_status(adventure_id, StoryStatus::Processing)
            .await?;
        let Some(canonical) = processing.iter().max_by_key(|s| s.created_at).cloned() else {
            warn!("No processing story found for adventure {}", adventure_id);
            return Ok(None);
        };

        for duplicate in processing.iter().filter(|s| s.id != canonical.id) {
            warn!(
                "Cancelling duplicate processing story {} for adventure {}",
                duplicate.id, adventure_id
            );
            if !self
                .db
                .update_story_status(duplicate.id, StoryStatus::Failed, Some(DUPLICATE_MESSAGE))
                .await?
            {
                info!("Story {} finished before it could be cancelled", duplicate.id);
            }
        }
        Ok(Some(canonical))
    }

    /// Executes one queued job: marks it running, claims its story, reconciles
    /// duplicates and marks the job done. The story only runs here when it is
    /// still the adventure's newest processing story; a newer one belongs to
    /// its own job. Jobs that are already done are ignored, so re-publishing a
    /// job is harmless.
    pub async fn run_job(&self, job_id: Uuid) -> PortResult<Option<RunOutcome>> {
        let job = self.db.get_job(job_id).await?;
        if job.status == JobStatus::Done {
            info!("Job {} already done, skipping", job_id);
            return Ok(None);
        }
        self.db.update_job_status(job_id, JobStatus::Running).await?;
        info!("Picked up job {} for story {}", job_id, job.story_id);

        let outcome = if self.claim(job.story_id).await? {
            let story = self.db.get_story(job.story_id).await?;
            match self.reconcile(story.adventure_id).await? {
                Some(canonical) if canonical.id == job.story_id => {
                    Some(self.run_story(canonical).await)
                }
                Some(canonical) => {
                    info!(
                        "Story {} superseded by {}; closing job {}",
                        job.story_id, canonical.id, job_id
                    );
                    None
                }
                None => None,
            }
        } else {
            None
        };

        self.db.update_job_status(job_id, JobStatus::Done).await?;
        Ok(outcome)
    }

    async fn run_story(&self, mut story: Story) -> RunOutcome {
        let story_id = story.id;
        info!("Starting generation for story {}", story_id);

        match self.generate(&mut story).await {
            Ok(Some(usage)) => {
                info!(
                    "Story {} completed ({} input / {} output tokens)",
                    story_id, usage.input, usage.output
                );
                RunOutcome {
                    story_id,
                    status: StoryStatus::Completed,
                    usage,
                    error: None,
                }
            }
            Ok(None) => {
                warn!("Story {} left processing during the run; result discarded", story_id);
                RunOutcome {
                    story_id,
                    status: StoryStatus::Failed,
                    usage: TokenUsage::default(),
                    error: Some(DUPLICATE_MESSAGE.to_string()),
                }
            }
            Err(e) => {
                let message = e.to_string();
                error!("Error in story generation for story {}: {}", story_id, message);
                // The quota gate records its own failure reason.
                let already_recorded = matches!(e, PipelineError::Admission(_));
                if !already_recorded {
                    match self
                        .db
                        .update_story_status(story_id, StoryStatus::Failed, Some(&message))
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => warn!(
                            "Story {} already left processing; keeping its recorded status",
                            story_id
                        ),
                        Err(db_err) => {
                            error!("Failed to mark story {} as failed: {}", story_id, db_err)
                        }
                    }
                }
                RunOutcome {
                    story_id,
                    status: StoryStatus::Failed,
                    usage: TokenUsage::default(),
                    error: Some(message),
                }
            }
        }
    }

    /// Returns `None` if the story was cancelled while this run was writing it.
    async fn generate(&self, story: &mut Story) -> Result<Option<TokenUsage>, PipelineError> {
        let adventure = self.db.get_adventure(story.adventure_id).await?;
        let owner = self.db.get_user(adventure.user_id).await?;

        if !self.quota.admit(adventure.user_id, Some(&*story)).await? {
            return Err(PipelineError::Admission(format!(
                "user {} has no stories left in the current window",
                adventure.user_id
            )));
        }

        let band = adventure.age_band();
        let seed = adventure.seed_context()?;
        let (mut session, mut usage) =
            ModelSession::open(self.story_model.clone(), &seed, self.session_config.clone())
                .await?;

        let prompt = story.prompt.clone();
        let (outline, outline_usage) = self
            .outline
            .generate(&prompt, &mut session, band, story)
            .await?;
        usage += outline_usage;

        usage += self
            .writer
            .write(&outline, band, &mut session, &prompt, story, &owner)
            .await?;

        if self.db.complete_story(story.id, usage).await? {
            Ok(Some(usage))
        } else {
            Ok(None)
        }
    }
}
