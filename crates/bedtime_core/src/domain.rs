//! crates/bedtime_core/src/domain.rs
//!
//! Defines the pure, core data structures for the application.
//! These structs are independent of any database or model vendor; the only
//! serialization they carry is the JSON shape the rest of the system relies on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;
use uuid::Uuid;

//=========================================================================================
// Style Parameters
//=========================================================================================

/// One of the five target-audience bands. Controls outline size and prose length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AgeBand {
    ThreeToSix,
    FiveToEight,
    SevenToEleven,
    TenToThirteen,
    ThirteenToEighteen,
}

impl AgeBand {
    pub const ALL: [AgeBand; 5] = [
        AgeBand::ThreeToSix,
        AgeBand::FiveToEight,
        AgeBand::SevenToEleven,
        AgeBand::TenToThirteen,
        AgeBand::ThirteenToEighteen,
    ];

    /// Resolves a stored age-group label. A missing label means the middle band;
    /// an unrecognised one falls back to the largest schema.
    pub fn from_label(label: Option<&str>) -> Self {
        match label.map(str::trim) {
            None | Some("") => AgeBand::SevenToEleven,
            Some("3 through 6") => AgeBand::ThreeToSix,
            Some("5 through 8") => AgeBand::FiveToEight,
            Some("7 through 11") => AgeBand::SevenToEleven,
            Some("10 through 13") => AgeBand::TenToThirteen,
            Some(_) => AgeBand::ThirteenToEighteen,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AgeBand::ThreeToSix => "3 through 6",
            AgeBand::FiveToEight => "5 through 8",
            AgeBand::SevenToEleven => "7 through 11",
            AgeBand::TenToThirteen => "10 through 13",
            AgeBand::ThirteenToEighteen => "13 through 18",
        }
    }

    pub fn part_count(&self) -> usize {
        match self {
            AgeBand::ThreeToSix | AgeBand::FiveToEight => 2,
            AgeBand::SevenToEleven => 3,
            AgeBand::TenToThirteen => 4,
            AgeBand::ThirteenToEighteen => 5,
        }
    }

    pub fn chapter_count(&self) -> usize {
        match self {
            AgeBand::ThreeToSix => 3,
            _ => 5,
        }
    }

    /// Target length of a single chapter, in words.
    pub fn target_words(&self) -> usize {
        match self {
            AgeBand::ThreeToSix => 150,
            AgeBand::FiveToEight => 200,
            AgeBand::SevenToEleven | AgeBand::TenToThirteen => 250,
            AgeBand::ThirteenToEighteen => 300,
        }
    }
}

impl From<String> for AgeBand {
    fn from(label: String) -> Self {
        AgeBand::from_label(Some(&label))
    }
}

impl From<AgeBand> for String {
    fn from(band: AgeBand) -> Self {
        band.label().to_string()
    }
}

impl fmt::Display for AgeBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tone {
    #[serde(rename = "humourous")]
    Humourous,
    #[serde(rename = "whimsical")]
    Whimsical,
    #[serde(rename = "serious")]
    Serious,
    #[serde(rename = "dramatic")]
    Dramatic,
    #[serde(rename = "like a TED talk")]
    Educational,
    #[serde(rename = "very descriptive and artistic")]
    Artistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Genre {
    #[serde(rename = "educational")]
    Educational,
    #[serde(rename = "set in the real world")]
    RealLife,
    #[serde(rename = "historical fiction")]
    Historical,
    #[serde(rename = "fantasy")]
    Fantasy,
    #[serde(rename = "science fiction")]
    ScienceFiction,
    #[serde(rename = "mystery")]
    Mystery,
    #[serde(rename = "scary")]
    Scary,
}

/// Which readers the story leans toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenderSkew {
    Female,
    Male,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Temporal {
    #[serde(rename = "in the past")]
    Past,
    #[serde(rename = "in the present")]
    Present,
    #[serde(rename = "in the future")]
    Future,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Style {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_group: Option<AgeBand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<Tone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<Genre>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<GenderSkew>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct World {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal: Option<Temporal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub general: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backstory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_events: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Character {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub species: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub about: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_space_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_space_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub general_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub about: String,
}

//=========================================================================================
// Adventure
//=========================================================================================

/// Characters and settings allowed before the adventure has any story.
pub const INITIAL_ENTRY_LIMIT: usize = 5;
/// Characters and settings allowed once the adventure has produced a story.
pub const EXTENDED_ENTRY_LIMIT: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdventureError {
    #[error("Cannot add more {kind}. Limit is {limit}.")]
    LimitReached { kind: &'static str, limit: usize },
    #[error("Too many {kind}. Limit is {limit}")]
    TooMany { kind: &'static str, limit: usize },
    #[error("Missing required {0} fields")]
    MissingAbout(&'static str),
}

/// A user's world-building container from which stories are generated.
#[derive(Debug, Clone)]
pub struct Adventure {
    pub id: Uuid,
    pub user_id: Uuid,
    pub adventure_number: i32,
    pub style: Style,
    pub world: World,
    pub characters: Vec<Character>,
    pub settings: Vec<Setting>,
    /// Number of stories (of any status) generated from this adventure.
    pub story_count: i64,
    pub created_at: DateTime<Utc>,
}

impl Adventure {
    pub fn age_band(&self) -> AgeBand {
        self.style.age_group.unwrap_or(AgeBand::SevenToEleven)
    }

    pub fn character_limit(&self) -> usize {
        if self.story_count > 0 {
            EXTENDED_ENTRY_LIMIT
        } else {
            INITIAL_ENTRY_LIMIT
        }
    }

    pub fn setting_limit(&self) -> usize {
        self.character_limit()
    }

    pub fn add_character(&mut self, character: Character) -> Result<(), AdventureError> {
        if self.characters.len() >= self.character_limit() {
            return Err(AdventureError::LimitReached {
                kind: "characters",
                limit: self.character_limit(),
            });
        }
        if character.about.trim().is_empty() {
            return Err(AdventureError::MissingAbout("character"));
        }
        self.characters.push(character);
        Ok(())
    }

    pub fn add_setting(&mut self, setting: Setting) -> Result<(), AdventureError> {
        if self.settings.len() >= self.setting_limit() {
            return Err(AdventureError::LimitReached {
                kind: "settings",
                limit: self.setting_limit(),
            });
        }
        if setting.about.trim().is_empty() {
            return Err(AdventureError::MissingAbout("setting"));
        }
        self.settings.push(setting);
        Ok(())
    }

    /// Checks the entry counts only; content is free text.
    pub fn validate(&self) -> Result<(), AdventureError> {
        if self.characters.len() > self.character_limit() {
            return Err(AdventureError::TooMany {
                kind: "characters",
                limit: self.character_limit(),
            });
        }
        if self.settings.len() > self.setting_limit() {
            return Err(AdventureError::TooMany {
                kind: "settings",
                limit: self.setting_limit(),
            });
        }
        Ok(())
    }

    /// The world-building context a model session is seeded with.
    /// Absent fields are left out rather than sent as nulls.
    pub fn seed_context(&self) -> Result<String, serde_json::Error> {
        let mut context = Map::new();
        context.insert("style".to_string(), serde_json::to_value(&self.style)?);
        context.insert("world".to_string(), serde_json::to_value(&self.world)?);
        context.insert(
            "characters".to_string(),
            serde_json::to_value(&self.characters)?,
        );
        context.insert("settings".to_string(), serde_json::to_value(&self.settings)?);
        serde_json::to_string(&Value::Object(context))
    }
}

//=========================================================================================
// Accounts
//=========================================================================================

#[derive(Debug, Clone)]
pub struct User {
    pub user_id: Uuid,
    pub username: String,
    pub display_name: Option<String>,
}

impl User {
    /// The name printed on story covers.
    pub fn author_name(&self) -> String {
        match self.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ if !self.username.trim().is_empty() => self.username.clone(),
            _ => "Anonymous".to_string(),
        }
    }
}

/// Subscription tier supplied by the billing collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tier {
    Free,
    Daily,
    Family,
    Unlimited,
    Unknown(String),
}

impl Tier {
    pub fn as_str(&self) -> &str {
        match self {
            Tier::Free => "free",
            Tier::Daily => "daily",
            Tier::Family => "family",
            Tier::Unlimited => "unlimited",
            Tier::Unknown(other) => other,
        }
    }
}

impl From<&str> for Tier {
    fn from(value: &str) -> Self {
        match value {
            "free" => Tier::Free,
            "daily" => Tier::Daily,
            "family" => Tier::Family,
            "unlimited" => Tier::Unlimited,
            other => Tier::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Account {
    pub user_id: Uuid,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
}

//=========================================================================================
// Story
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryStatus::Pending => "pending",
            StoryStatus::Processing => "processing",
            StoryStatus::Completed => "completed",
            StoryStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StoryStatus::Completed | StoryStatus::Failed)
    }

    /// `pending → processing → {completed, failed}`; a pending story may also
    /// fail directly (admission denial before the run starts).
    pub fn can_transition_to(&self, next: StoryStatus) -> bool {
        matches!(
            (self, next),
            (StoryStatus::Pending, StoryStatus::Processing)
                | (StoryStatus::Pending, StoryStatus::Failed)
                | (StoryStatus::Processing, StoryStatus::Completed)
                | (StoryStatus::Processing, StoryStatus::Failed)
        )
    }

    /// The statuses a story may be in for a move to `next` to be applied.
    pub fn predecessors_of(next: StoryStatus) -> Vec<StoryStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }

    pub const ALL: [StoryStatus; 4] = [
        StoryStatus::Pending,
        StoryStatus::Processing,
        StoryStatus::Completed,
        StoryStatus::Failed,
    ];
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StoryStatus::Pending),
            "processing" => Ok(StoryStatus::Processing),
            "completed" => Ok(StoryStatus::Completed),
            "failed" => Ok(StoryStatus::Failed),
            other => Err(format!("unknown story status '{}'", other)),
        }
    }
}

/// One narrative generation attempt belonging to an adventure.
#[derive(Debug, Clone)]
pub struct Story {
    pub id: Uuid,
    pub adventure_id: Uuid,
    pub prompt: String,
    pub title: String,
    /// JSON-serialized outline, set once the outline validates.
    pub outline: Option<String>,
    pub summary: Option<String>,
    pub status: StoryStatus,
    pub error: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub audio_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Story {
    /// A fresh `pending` story with no outline or content yet.
    pub fn new(adventure_id: Uuid, prompt: &str, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            adventure_id,
            prompt: prompt.to_string(),
            title: title.to_string(),
            outline: None,
            summary: None,
            status: StoryStatus::Pending,
            error: None,
            input_tokens: 0,
            output_tokens: 0,
            audio_ref: None,
            created_at: now,
            updated_at: now,
        }
    }
}

//=========================================================================================
// Story Content
//=========================================================================================

/// Position of a chapter: 1-based part and chapter numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChapterKey {
    pub part: usize,
    pub chapter: usize,
}

impl ChapterKey {
    pub fn new(part: usize, chapter: usize) -> Self {
        Self { part, chapter }
    }

    /// `"Part <n>"`, the durable key used in outlines and stored content.
    pub fn part_key(&self) -> String {
        part_key(self.part)
    }

    /// `"Chapter <n>"`.
    pub fn chapter_key(&self) -> String {
        chapter_key(self.chapter)
    }

    /// Parses the `("Part 1", "Chapter 2")` pair back into a key.
    pub fn parse(part_key: &str, chapter_key: &str) -> Option<Self> {
        let part = part_key.strip_prefix("Part ")?.parse().ok()?;
        let chapter = chapter_key.strip_prefix("Chapter ")?.parse().ok()?;
        if part == 0 || chapter == 0 {
            return None;
        }
        Some(Self { part, chapter })
    }
}

impl fmt::Display for ChapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Part {}, Chapter {}", self.part, self.chapter)
    }
}

pub fn part_key(part: usize) -> String {
    format!("Part {}", part)
}

pub fn chapter_key(chapter: usize) -> String {
    format!("Chapter {}", chapter)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterContent {
    pub full_text: String,
    pub summary: String,
}

/// Accumulated chapter text of a story.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoryContent {
    pub story_id: Uuid,
    pub chapters: BTreeMap<ChapterKey, ChapterContent>,
}

impl StoryContent {
    pub fn new(story_id: Uuid) -> Self {
        Self {
            story_id,
            chapters: BTreeMap::new(),
        }
    }

    /// Chapters in reading order.
    pub fn ordered_chapters(&self) -> impl Iterator<Item = (&ChapterKey, &ChapterContent)> {
        self.chapters.iter()
    }

    /// Renders `{"Part 1": {"Chapter 1": {"full_text", "summary"}}}`.
    pub fn to_raw(&self) -> Value {
        let mut parts: Map<String, Value> = Map::new();
        for (key, content) in &self.chapters {
            let part = parts
                .entry(key.part_key())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(chapters) = part {
                chapters.insert(
                    key.chapter_key(),
                    serde_json::json!({
                        "full_text": content.full_text,
                        "summary": content.summary,
                    }),
                );
            }
        }
        Value::Object(parts)
    }

    /// Reads the stored raw layout. Entries whose keys do not follow the
    /// `Part n` / `Chapter m` format are skipped.
    pub fn from_raw(story_id: Uuid, raw: &Value) -> Result<Self, serde_json::Error> {
        let mut content = StoryContent::new(story_id);
        let Some(parts) = raw.as_object() else {
            return Ok(content);
        };
        for (part_name, chapters) in parts {
            let Some(chapters) = chapters.as_object() else {
                continue;
            };
            for (chapter_name, entry) in chapters {
                if let Some(key) = ChapterKey::parse(part_name, chapter_name) {
                    let chapter: ChapterContent = serde_json::from_value(entry.clone())?;
                    content.chapters.insert(key, chapter);
                }
            }
        }
        Ok(content)
    }
}

//=========================================================================================
// Images
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageSlot {
    Cover,
    Chapter(ChapterKey),
}

impl ImageSlot {
    /// File name under the story's blob prefix.
    pub fn file_name(&self) -> String {
        match self {
            ImageSlot::Cover => "cover.jpg".to_string(),
            ImageSlot::Chapter(key) => format!("Part{}_Chapter{}.jpg", key.part, key.chapter),
        }
    }

    /// Value stored in the image record's slot column.
    pub fn slot_key(&self) -> String {
        match self {
            ImageSlot::Cover => "cover".to_string(),
            ImageSlot::Chapter(key) => format!("{}/{}", key.part_key(), key.chapter_key()),
        }
    }
}

/// A stored illustration: the cover or one chapter picture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryImage {
    pub story_id: Uuid,
    pub slot: ImageSlot,
    pub blob_key: String,
    pub text_marker: Option<String>,
}

//=========================================================================================
// Generation Jobs
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Done,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// A durable request to run the pipeline for one story.
#[derive(Debug, Clone)]
pub struct StoryJob {
    pub id: Uuid,
    pub story_id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

//=========================================================================================
// Model Conversation
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling parameters passed with every model request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: Option<u32>,
}

impl SamplingParams {
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature,
            top_p: 0.8,
            max_output_tokens: None,
        }
    }
}

/// One model response plus its token counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl Completion {
    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            input: self.input_tokens,
            output: self.output_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: i64,
    pub output: i64,
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            input: self.input + rhs.input,
            output: self.output + rhs.output,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        self.input += rhs.input;
        self.output += rhs.output;
    }
}
