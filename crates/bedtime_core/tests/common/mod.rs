//! In-memory adapters for exercising the pipeline without a database or model vendor.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use bedtime_core::domain::{
    Account, Adventure, AgeBand, ChapterContent, ChapterKey, ChatTurn, Completion, JobStatus,
    SamplingParams, Story, StoryContent, StoryImage, StoryJob, StoryStatus, Style, Tier,
    TokenUsage, User, World,
};
use bedtime_core::outline::{OutlineSchema, TITLE_KEY};
use bedtime_core::pipeline::{PipelinePorts, PipelineSettings, DEFAULT_RULES_KEY};
use bedtime_core::ports::{
    AccountService, BlobStore, CoverDesigner, DatabaseService, ImageGenerationService, PortError,
    PortResult, TextGenerationService,
};
use bedtime_core::retry::RetryPolicy;

//=========================================================================================
// Database
//=========================================================================================

#[derive(Default)]
pub struct DbState {
    pub users: HashMap<Uuid, User>,
    pub accounts: HashMap<Uuid, Account>,
    pub adventures: HashMap<Uuid, Adventure>,
    pub stories: HashMap<Uuid, Story>,
    pub contents: HashMap<Uuid, StoryContent>,
    pub images: HashMap<(Uuid, String), StoryImage>,
    pub jobs: HashMap<Uuid, StoryJob>,
}

#[derive(Default)]
pub struct MemoryDb {
    pub state: Mutex<DbState>,
}

impl MemoryDb {
    pub fn add_user(&self, username: &str, tier: Tier, created_at: DateTime<Utc>) -> User {
        let user = User {
            user_id: Uuid::new_v4(),
            username: username.to_string(),
            display_name: None,
        };
        let mut state = self.state.lock().unwrap();
        state.users.insert(user.user_id, user.clone());
        state.accounts.insert(
            user.user_id,
            Account {
                user_id: user.user_id,
                tier,
                created_at,
            },
        );
        user
    }

    pub fn add_adventure(&self, user_id: Uuid, band: Option<AgeBand>) -> Adventure {
        let adventure = Adventure {
            id: Uuid::new_v4(),
            user_id,
            adventure_number: 1,
            style: Style {
                age_group: band,
                ..Style::default()
            },
            world: World {
                name: Some("Inkwood".to_string()),
                ..World::default()
            },
            characters: Vec::new(),
            settings: Vec::new(),
            story_count: 0,
            created_at: Utc::now(),
        };
        self.state
            .lock()
            .unwrap()
            .adventures
            .insert(adventure.id, adventure.clone());
        adventure
    }

    pub fn add_story(
        &self,
        adventure_id: Uuid,
        prompt: &str,
        status: StoryStatus,
        created_at: DateTime<Utc>,
    ) -> Story {
        let story = Story {
            status,
            created_at,
            updated_at: created_at,
            ..Story::new(adventure_id, prompt, "Story 1")
        };
        let mut state = self.state.lock().unwrap();
        state.stories.insert(story.id, story.clone());
        if let Some(adventure) = state.adventures.get_mut(&adventure_id) {
            adventure.story_count += 1;
        }
        story
    }

    pub fn story(&self, story_id: Uuid) -> Story {
        self.state.lock().unwrap().stories[&story_id].clone()
    }

    pub fn content(&self, story_id: Uuid) -> StoryContent {
        self.state
            .lock()
            .unwrap()
            .contents
            .get(&story_id)
            .cloned()
            .unwrap_or_else(|| StoryContent::new(story_id))
    }

    pub fn image_slots(&self, story_id: Uuid) -> Vec<String> {
        let mut slots: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .images
            .keys()
            .filter(|(id, _)| *id == story_id)
            .map(|(_, slot)| slot.clone())
            .collect();
        slots.sort();
        slots
    }

    fn with_story<T>(
        &self,
        story_id: Uuid,
        f: impl FnOnce(&mut Story) -> T,
    ) -> PortResult<T> {
        let mut state = self.state.lock().unwrap();
        let story = state
            .stories
            .get_mut(&story_id)
            .ok_or_else(|| PortError::NotFound(format!("Story {} not found", story_id)))?;
        story.updated_at = Utc::now();
        Ok(f(story))
    }
}

#[async_trait]
impl DatabaseService for MemoryDb {
    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        self.state
            .lock()
            .unwrap()
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("User {} not found", user_id)))
    }

    async fn get_adventure(&self, adventure_id: Uuid) -> PortResult<Adventure> {
        self.state
            .lock()
            .unwrap()
            .adventures
            .get(&adventure_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Adventure {} not found", adventure_id)))
    }

    async fn create_story_with_job(
        &self,
        adventure_id: Uuid,
        prompt: &str,
        title: &str,
    ) -> PortResult<(Story, StoryJob)> {
        let mut story = self.add_story(adventure_id, prompt, StoryStatus::Pending, Utc::now());
        story.title = title.to_string();
        let job = StoryJob {
            id: Uuid::new_v4(),
            story_id: story.id,
            status: JobStatus::Queued,
            created_at: Utc::now(),
        };
        let mut state = self.state.lock().unwrap();
        state.stories.insert(story.id, story.clone());
        state.jobs.insert(job.id, job.clone());
        Ok((story, job))
    }

    async fn get_story(&self, story_id: Uuid) -> PortResult<Story> {
        self.with_story(story_id, |s| s.clone())
    }

    async fn list_stories_by_status(
        &self,
        adventure_id: Uuid,
        status: StoryStatus,
    ) -> PortResult<Vec<Story>> {
        let mut stories: Vec<Story> = self
            .state
            .lock()
            .unwrap()
            .stories
            .values()
            .filter(|s| s.adventure_id == adventure_id && s.status == status)
            .cloned()
            .collect();
        stories.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(stories)
    }

    async fn count_stories_for_user(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> PortResult<i64> {
        let state = self.state.lock().unwrap();
        let count = state
            .stories
            .values()
            .filter(|s| Some(s.id) != exclude)
            .filter(|s| s.created_at >= from && s.created_at < until)
            .filter(|s| {
                state
                    .adventures
                    .get(&s.adventure_id)
                    .map_or(false, |a| a.user_id == user_id)
            })
            .count();
        Ok(count as i64)
    }

    async fn update_story_status(
        &self,
        story_id: Uuid,
        status: StoryStatus,
        error: Option<&str>,
    ) -> PortResult<bool> {
        self.with_story(story_id, |s| {
            if !s.status.can_transition_to(status) {
                return false;
            }
            s.status = status;
            if let Some(error) = error {
                s.error = Some(error.to_string());
            }
            true
        })
    }

    async fn save_outline(&self, story_id: Uuid, title: &str, outline: &str) -> PortResult<()> {
        self.with_story(story_id, |s| {
            s.title = title.to_string();
            s.outline = Some(outline.to_string());
        })
    }

    async fn save_summary(&self, story_id: Uuid, summary: &str) -> PortResult<()> {
        self.with_story(story_id, |s| s.summary = Some(summary.to_string()))
    }

    async fn complete_story(&self, story_id: Uuid, usage: TokenUsage) -> PortResult<bool> {
        self.with_story(story_id, |s| {
            if s.status != StoryStatus::Processing {
                return false;
            }
            s.status = StoryStatus::Completed;
            s.input_tokens = usage.input;
            s.output_tokens = usage.output;
            true
        })
    }

    async fn save_chapter(
        &self,
        story_id: Uuid,
        key: ChapterKey,
        content: &ChapterContent,
    ) -> PortResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .contents
            .entry(story_id)
            .or_insert_with(|| StoryContent::new(story_id))
            .chapters
            .insert(key, content.clone());
        Ok(())
    }

    async fn get_story_content(&self, story_id: Uuid) -> PortResult<StoryContent> {
        Ok(self.content(story_id))
    }

    async fn save_story_image(&self, image: &StoryImage) -> PortResult<()> {
        self.state
            .lock()
            .unwrap()
            .images
            .insert((image.story_id, image.slot.slot_key()), image.clone());
        Ok(())
    }

    async fn list_unfinished_jobs(&self) -> PortResult<Vec<StoryJob>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|j| j.status != JobStatus::Done)
            .cloned()
            .collect())
    }

    async fn get_job(&self, job_id: Uuid) -> PortResult<StoryJob> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Job {} not found", job_id)))
    }

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> PortResult<()> {
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| PortError::NotFound(format!("Job {} not found", job_id)))?;
        job.status = status;
        Ok(())
    }
}

#[async_trait]
impl AccountService for MemoryDb {
    async fn get_account(&self, user_id: Uuid) -> PortResult<Account> {
        self.state
            .lock()
            .unwrap()
            .accounts
            .get(&user_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Account {} not found", user_id)))
    }
}

//=========================================================================================
// Models
//=========================================================================================

/// A valid outline for `band`, optionally wrapped in a code fence.
pub fn outline_reply(band: AgeBand, title: &str) -> String {
    let schema = OutlineSchema::for_band(band);
    let mut value = schema.template();
    value[TITLE_KEY] = json!(title);
    for key in schema.chapter_keys() {
        value[key.part_key()][key.chapter_key()] = json!(format!("Heading for {}", key));
    }
    format!("```json\n{}\n```", serde_json::to_string_pretty(&value).unwrap())
}

/// Answers each request kind with canned text and records every request it sees.
pub struct ScriptedModel {
    pub outline_replies: Mutex<VecDeque<String>>,
    pub repair_replies: Mutex<VecDeque<String>>,
    pub chapter_failures: AtomicUsize,
    pub fail_story_summary: AtomicBool,
    pub requests: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(first_outline: String) -> Self {
        Self {
            outline_replies: Mutex::new(VecDeque::from(vec![first_outline])),
            repair_replies: Mutex::new(VecDeque::new()),
            chapter_failures: AtomicUsize::new(0),
            fail_story_summary: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_repair(self, reply: String) -> Self {
        self.repair_replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn requests_starting_with(&self, prefix: &str) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn count_requests(&self, prefix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl TextGenerationService for ScriptedModel {
    async fn generate(&self, turns: &[ChatTurn], _params: &SamplingParams) -> PortResult<Completion> {
        let request = turns.last().map(|t| t.content.clone()).unwrap_or_default();
        self.requests.lock().unwrap().push(request.clone());

        let text = if request.starts_with("Here is part of the story context") {
            "Understood.".to_string()
        } else if request.starts_with("Create an outline") {
            self.outline_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "{}".to_string())
        } else if request.starts_with("Please reformat") {
            self.repair_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "still not json".to_string())
        } else if request.starts_with("Now write the content for") {
            let pending = self.chapter_failures.load(Ordering::SeqCst);
            if pending > 0 {
                self.chapter_failures.store(pending - 1, Ordering::SeqCst);
                return Err(PortError::Transient("429 rate limited".to_string()));
            }
            let heading = request.lines().next().unwrap_or_default().to_string();
            format!("The dragon opened a book. ({})", heading)
        } else if request.starts_with("You are writing a story about") {
            // Chapter text carries its own heading, see the branch above.
            let label = request
                .split("Now write the content for ")
                .nth(1)
                .and_then(|rest| rest.split(':').next())
                .unwrap_or("an unknown chapter");
            format!("\"The dragon practised letters in {}.\nNext: visit the library.\"", label)
        } else if request.starts_with("Choose an element") || request.starts_with("Pick an element") {
            "**A green dragon reading by candlelight**".to_string()
        } else if request.starts_with("Create a compelling") {
            if self.fail_story_summary.load(Ordering::SeqCst) {
                return Err(PortError::Unexpected("summary model refused".to_string()));
            }
            "`A dragon learns to read and shares stories with the village.`".to_string()
        } else {
            return Err(PortError::Unexpected(format!("unscripted request: {}", request)));
        };

        Ok(Completion {
            text,
            input_tokens: 10,
            output_tokens: 5,
        })
    }
}

//=========================================================================================
// Images, Blobs, Covers
//=========================================================================================

pub struct StubImages {
    pub failures: AtomicUsize,
    pub calls: AtomicUsize,
}

impl StubImages {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ImageGenerationService for StubImages {
    async fn generate_image(&self, prompt: &str) -> PortResult<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(PortError::Unexpected("image service unavailable".to_string()));
        }
        Ok(Bytes::from(format!("jpeg:{}", prompt)))
    }
}

#[derive(Default)]
pub struct MemoryBlobs {
    pub objects: Mutex<HashMap<String, Bytes>>,
}

impl MemoryBlobs {
    pub fn with_rules(rules: &str) -> Self {
        let blobs = Self::default();
        blobs
            .objects
            .lock()
            .unwrap()
            .insert(DEFAULT_RULES_KEY.to_string(), Bytes::from(rules.to_string()));
        blobs
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn read(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobs {
    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> PortResult<()> {
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> PortResult<Bytes> {
        self.read(key)
            .ok_or_else(|| PortError::NotFound(format!("blob {} not found", key)))
    }

    async fn exists(&self, key: &str) -> PortResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }
}

pub struct StubCover;

#[async_trait]
impl CoverDesigner for StubCover {
    async fn compose_cover(&self, image: Bytes, title: &str, author: &str) -> PortResult<Bytes> {
        Ok(Bytes::from(format!(
            "cover[{}|By {}]<{}>",
            title,
            author,
            String::from_utf8_lossy(&image)
        )))
    }
}

//=========================================================================================
// Harness
//=========================================================================================

pub struct Harness {
    pub db: Arc<MemoryDb>,
    pub model: Arc<ScriptedModel>,
    pub images: Arc<StubImages>,
    pub blobs: Arc<MemoryBlobs>,
}

impl Harness {
    pub fn new(model: ScriptedModel, images: StubImages) -> Self {
        Self {
            db: Arc::new(MemoryDb::default()),
            model: Arc::new(model),
            images: Arc::new(images),
            blobs: Arc::new(MemoryBlobs::with_rules("Every chapter ends kindly.")),
        }
    }

    pub fn ports(&self) -> PipelinePorts {
        PipelinePorts {
            db: self.db.clone(),
            accounts: self.db.clone(),
            story_model: self.model.clone(),
            helper_model: self.model.clone(),
            images: self.images.clone(),
            blobs: self.blobs.clone(),
            cover_designer: Arc::new(StubCover),
        }
    }

    pub fn settings() -> PipelineSettings {
        PipelineSettings {
            retry: RetryPolicy::immediate(5),
            ..PipelineSettings::default()
        }
    }
}

/// The cleaned summary the scripted model writes for one chapter.
pub fn chapter_summary(part: usize, chapter: usize) -> String {
    format!(
        "The dragon practised letters in Part {}, Chapter {}. Next: visit the library.",
        part, chapter
    )
}

pub fn parse_outline(story: &Story) -> Value {
    serde_json::from_str(story.outline.as_deref().unwrap_or("null")).unwrap()
}
