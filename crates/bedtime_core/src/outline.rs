//! crates/bedtime_core/src/outline.rs
//!
//! Outline generation: asks the session for a JSON outline sized by age band,
//! validates it against the band's schema, and falls back to a single repair
//! request when the first answer does not fit.

use regex::Regex;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock};
use tracing::{error, info, warn};

use crate::domain::{
    chapter_key, part_key, AgeBand, ChapterKey, ChatTurn, SamplingParams, Story, TokenUsage,
};
use crate::error::PipelineError;
use crate::ports::{DatabaseService, TextGenerationService};
use crate::retry::{self, RetryPolicy};
use crate::session::ModelSession;

pub const TITLE_KEY: &str = "title";

//=========================================================================================
// Schema and Validation
//=========================================================================================

/// Why an outline was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct OutlineViolation(pub String);

/// Required parts and chapters for one age band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutlineSchema {
    pub parts: usize,
    pub chapters: usize,
}

impl OutlineSchema {
    pub fn for_band(band: AgeBand) -> Self {
        Self {
            parts: band.part_count(),
            chapters: band.chapter_count(),
        }
    }

    /// Chapter positions in reading order.
    pub fn chapter_keys(&self) -> impl Iterator<Item = ChapterKey> {
        let chapters = self.chapters;
        (1..=self.parts)
            .flat_map(move |part| (1..=chapters).map(move |chapter| ChapterKey::new(part, chapter)))
    }

    /// The example shape shown to the model.
    pub fn template(&self) -> Value {
        let mut root = Map::new();
        root.insert(TITLE_KEY.to_string(), Value::from("title"));
        for part in 1..=self.parts {
            let chapters: Map<String, Value> = (1..=self.chapters)
                .map(|chapter| (chapter_key(chapter), Value::from("chapter_summary")))
                .collect();
            root.insert(part_key(part), Value::Object(chapters));
        }
        Value::Object(root)
    }

    /// Checks the required keys. Extra keys are tolerated.
    pub fn validate(&self, outline: &Value) -> Result<(), OutlineViolation> {
        let root = outline.as_object().ok_or_else(|| {
            OutlineViolation(format!("root is not a dictionary, but {}", json_type(outline)))
        })?;

        match root.get(TITLE_KEY) {
            None => return Err(OutlineViolation("Missing title key".to_string())),
            Some(Value::String(_)) => {}
            Some(_) => return Err(OutlineViolation("title should be a string".to_string())),
        }

        for part in 1..=self.parts {
            let part_name = part_key(part);
            let chapters = root
                .get(&part_name)
                .ok_or_else(|| OutlineViolation(format!("Missing {}", part_name)))?
                .as_object()
                .ok_or_else(|| OutlineViolation(format!("{} should be a dictionary", part_name)))?;

            for chapter in 1..=self.chapters {
                let chapter_name = chapter_key(chapter);
                let title = chapters.get(&chapter_name).ok_or_else(|| {
                    OutlineViolation(format!("Missing {} in {}", chapter_name, part_name))
                })?;
                let title = title.as_str().ok_or_else(|| {
                    OutlineViolation(format!("{}/{} should be a string", part_name, chapter_name))
                })?;
                if title.trim().is_empty() {
                    return Err(OutlineViolation(format!(
                        "{}/{} is empty",
                        part_name, chapter_name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

//=========================================================================================
// Typed Outline
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineChapter {
    pub number: usize,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlinePart {
    pub number: usize,
    pub chapters: Vec<OutlineChapter>,
}

/// A validated outline. Serializes back to `{"title", "Part n": {"Chapter m": ...}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outline {
    pub title: String,
    pub parts: Vec<OutlinePart>,
}

impl Outline {
    /// Validates `value` and keeps only the parts and chapters the schema asks for.
    pub fn from_value(value: &Value, schema: &OutlineSchema) -> Result<Self, OutlineViolation> {
        schema.validate(value)?;
        let title = value[TITLE_KEY].as_str().unwrap_or_default().to_string();
        let parts = (1..=schema.parts)
            .map(|part| OutlinePart {
                number: part,
                chapters: (1..=schema.chapters)
                    .map(|chapter| OutlineChapter {
                        number: chapter,
                        title: value[part_key(part)][chapter_key(chapter)]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                    })
                    .collect(),
            })
            .collect();
        Ok(Self { title, parts })
    }

    pub fn chapter_title(&self, key: ChapterKey) -> Option<&str> {
        self.parts
            .iter()
            .find(|p| p.number == key.part)?
            .chapters
            .iter()
            .find(|c| c.number == key.chapter)
            .map(|c| c.title.as_str())
    }
}

struct PartChapters<'a>(&'a [OutlineChapter]);

impl Serialize for PartChapters<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for chapter in self.0 {
            map.serialize_entry(&chapter_key(chapter.number), &chapter.title)?;
        }
        map.end()
    }
}

impl Serialize for Outline {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.parts.len() + 1))?;
        map.serialize_entry(TITLE_KEY, &self.title)?;
        for part in &self.parts {
            map.serialize_entry(&part_key(part.number), &PartChapters(&part.chapters))?;
        }
        map.end()
    }
}

//=========================================================================================
// Response Parsing
//=========================================================================================

fn fence_pattern() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("valid fence regex"))
}

/// Reads a model reply as JSON, tolerating code fences and stray whitespace.
pub fn parse_outline_text(raw: &str) -> Option<Value> {
    let body = match fence_pattern().captures(raw) {
        Some(caps) => caps.get(1).map_or("", |m| m.as_str()),
        None => raw.trim(),
    };
    if let Ok(value) = serde_json::from_str(body) {
        return Some(value);
    }
    let cleaned = body.trim().replace('\n', "").replace("  ", "");
    serde_json::from_str(&cleaned).ok()
}

//=========================================================================================
// Outline Engine
//=========================================================================================

pub struct OutlineEngine {
    db: Arc<dyn DatabaseService>,
    repair_model: Arc<dyn TextGenerationService>,
    repair_sampling: SamplingParams,
    retry: RetryPolicy,
}

impl OutlineEngine {
    pub fn new(
        db: Arc<dyn DatabaseService>,
        repair_model: Arc<dyn TextGenerationService>,
        repair_sampling: SamplingParams,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            repair_model,
            repair_sampling,
            retry,
        }
    }

    /// Produces a validated outline for `prompt`, persisting its title and
    /// serialized form on the story.
    pub async fn generate(
        &self,
        prompt: &str,
        session: &mut ModelSession,
        band: AgeBand,
        story: &mut Story,
    ) -> Result<(Outline, TokenUsage), PipelineError> {
        let schema = OutlineSchema::for_band(band);
        let mut usage = TokenUsage::default();

        let request = format!(
            "Create an outline for a story about: {prompt}\n\n\
             The outline MUST follow this exact JSON structure:\n{template}\n\n\
             Each string should be a descriptive title or chapter heading.\n\
             Provide ONLY the JSON outline with no additional text or explanation.\n\
             Use double quotes for all strings.",
            prompt = prompt,
            template = serde_json::to_string_pretty(&schema.template())?,
        );

        let completion = retry::send_with_retry(session, &request, &self.retry).await?;
        usage += completion.usage();
        info!("Outline response received for story {}", story.id);

        let parsed = parse_outline_text(&completion.text);
        let outline = match parsed.as_ref().map(|value| Outline::from_value(value, &schema)) {
            Some(Ok(outline)) => outline,
            Some(Err(violation)) => {
                warn!("Invalid outline structure: {}", violation);
                let (outline, repair_usage) =
                    self.repair(parsed.unwrap_or(Value::Null), &schema).await?;
                usage += repair_usage;
                outline
            }
            None => {
                warn!("Outline response was not valid JSON, requesting a reformat");
                let (outline, repair_usage) = self
                    .repair(Value::String(completion.text.clone()), &schema)
                    .await?;
                usage += repair_usage;
                outline
            }
        };

        let serialized = serde_json::to_string(&outline)?;
        self.db.save_outline(story.id, &outline.title, &serialized).await?;
        story.title = outline.title.clone();
        story.outline = Some(serialized);

        Ok((outline, usage))
    }

    /// One fresh request to reshape a rejected outline.
    async fn repair(
        &self,
        incorrect: Value,
        schema: &OutlineSchema,
    ) -> Result<(Outline, TokenUsage), PipelineError> {
        info!("Attempting to fix outline format...");
        let request = format!(
            "Please reformat the following story outline to match the required structure exactly.\n\n\
             Required structure format:\n{expected}\n\n\
             Current incorrect outline:\n{incorrect}\n\n\
             Please provide ONLY the reformatted outline as valid JSON with no additional text or explanation.\n\
             Preserve the story content but make it fit the required structure.",
            expected = serde_json::to_string_pretty(&schema.template())?,
            incorrect = serde_json::to_string_pretty(&incorrect)?,
        );

        let completion = retry::generate_with_retry(
            self.repair_model.as_ref(),
            &[ChatTurn::user(request)],
            &self.repair_sampling,
            &self.retry,
        )
        .await?;

        let value = parse_outline_text(&completion.text).ok_or_else(|| {
            error!("Failed to parse fixed outline as JSON");
            PipelineError::Parse("reformatted outline is not valid JSON".to_string())
        })?;
        let outline = Outline::from_value(&value, schema).map_err(|violation| {
            error!("Fixed outline still invalid: {}", violation);
            violation
        })?;
        Ok((outline, completion.usage()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_outline(schema: &OutlineSchema) -> Value {
        let mut value = schema.template();
        value[TITLE_KEY] = json!("The Dragon Who Read");
        for key in schema.chapter_keys() {
            value[key.part_key()][key.chapter_key()] = json!(format!("Heading {}", key));
        }
        value
    }

    #[test]
    fn test_template_matches_band_sizes() {
        let schema = OutlineSchema::for_band(AgeBand::ThreeToSix);
        let template = schema.template();
        assert_eq!(template.as_object().unwrap().len(), 3);
        assert_eq!(template["Part 2"].as_object().unwrap().len(), 3);
        assert_eq!(schema.chapter_keys().count(), 6);
        assert_eq!(OutlineSchema::for_band(AgeBand::ThirteenToEighteen).chapter_keys().count(), 25);
    }

    #[test]
    fn test_template_key_order() {
        let schema = OutlineSchema::for_band(AgeBand::FiveToEight);
        let keys: Vec<_> = schema.template().as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["title", "Part 1", "Part 2"]);
    }

    #[test]
    fn test_validation_messages() {
        let schema = OutlineSchema::for_band(AgeBand::ThreeToSix);
        let check = |value: Value| schema.validate(&value).unwrap_err().0;

        assert_eq!(check(json!([1, 2])), "root is not a dictionary, but list");
        assert_eq!(check(json!({"Part 1": {}})), "Missing title key");

        let mut missing_part = valid_outline(&schema);
        missing_part.as_object_mut().unwrap().remove("Part 2");
        assert_eq!(check(missing_part), "Missing Part 2");

        let mut flat_part = valid_outline(&schema);
        flat_part["Part 1"] = json!("everything happens");
        assert_eq!(check(flat_part), "Part 1 should be a dictionary");

        let mut missing_chapter = valid_outline(&schema);
        missing_chapter["Part 1"].as_object_mut().unwrap().remove("Chapter 3");
        assert_eq!(check(missing_chapter), "Missing Chapter 3 in Part 1");

        let mut number_chapter = valid_outline(&schema);
        number_chapter["Part 1"]["Chapter 2"] = json!(7);
        assert_eq!(check(number_chapter), "Part 1/Chapter 2 should be a string");

        let mut empty_chapter = valid_outline(&schema);
        empty_chapter["Part 1"]["Chapter 2"] = json!("   ");
        assert_eq!(check(empty_chapter), "Part 1/Chapter 2 is empty");
    }

    #[test]
    fn test_extra_keys_are_tolerated_and_dropped() {
        let schema = OutlineSchema::for_band(AgeBand::ThreeToSix);
        let mut value = valid_outline(&schema);
        value["Part 3"] = json!({"Chapter 1": "bonus"});
        value["Part 1"]["Chapter 9"] = json!("bonus");

        let outline = Outline::from_value(&value, &schema).unwrap();
        let serialized = serde_json::to_value(&outline).unwrap();
        assert!(serialized.get("Part 3").is_none());
        assert!(serialized["Part 1"].get("Chapter 9").is_none());
        assert_eq!(serialized, valid_outline(&schema));
    }

    #[test]
    fn test_chapter_titles_by_key() {
        let schema = OutlineSchema::for_band(AgeBand::FiveToEight);
        let outline = Outline::from_value(&valid_outline(&schema), &schema).unwrap();
        assert_eq!(
            outline.chapter_title(ChapterKey::new(2, 5)),
            Some("Heading Part 2, Chapter 5")
        );
        assert_eq!(outline.chapter_title(ChapterKey::new(3, 1)), None);
    }

    #[test]
    fn test_parse_strips_fences() {
        let raw = "Here you go:\n```json\n{\"title\": \"A\"}\n```\n";
        assert_eq!(parse_outline_text(raw), Some(json!({"title": "A"})));
        let bare = "```\n{\"title\": \"B\"}\n```";
        assert_eq!(parse_outline_text(bare), Some(json!({"title": "B"})));
    }

    #[test]
    fn test_parse_cleans_raw_newlines() {
        let raw = "{\"title\": \"A long\ntitle\"}";
        assert_eq!(parse_outline_text(raw), Some(json!({"title": "A longtitle"})));
        assert_eq!(parse_outline_text("not json at all"), None);
    }
}
