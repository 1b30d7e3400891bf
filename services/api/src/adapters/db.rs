//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `DatabaseService` and `AccountService` ports from the `core` crate. It
//! handles all interactions with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use bedtime_core::domain::{
    Account, Adventure, ChapterContent, ChapterKey, Character, JobStatus, Setting, Story,
    StoryContent, StoryImage, StoryJob, StoryStatus, Style, Tier, TokenUsage, User, World,
};
use bedtime_core::ports::{AccountService, DatabaseService, PortError, PortResult};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `DatabaseService` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Pool exhaustion and dropped connections are worth retrying; everything else is not.
fn db_error(e: sqlx::Error) -> PortError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => PortError::Transient(e.to_string()),
        sqlx::Error::Database(ref db) if db.is_unique_violation() => PortError::InvalidInput(
            format!(
                "Record already exists ({})",
                db.constraint().unwrap_or("unique constraint")
            ),
        ),
        _ => PortError::Unexpected(e.to_string()),
    }
}

fn not_found_or(what: String) -> impl FnOnce(sqlx::Error) -> PortError {
    move |e| match e {
        sqlx::Error::RowNotFound => PortError::NotFound(what),
        other => db_error(other),
    }
}

const STORY_COLUMNS: &str = "id, adventure_id, prompt, title, outline, summary, status, error, \
     input_tokens, output_tokens, audio_ref, created_at, updated_at";

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct UserRecord {
    user_id: Uuid,
    username: String,
    display_name: Option<String>,
}
impl UserRecord {
    fn to_domain(self) -> User {
        User {
            user_id: self.user_id,
            username: self.username,
            display_name: self.display_name,
        }
    }
}

#[derive(FromRow)]
struct AccountRecord {
    user_id: Uuid,
    tier: String,
    created_at: DateTime<Utc>,
}
impl AccountRecord {
    fn to_domain(self) -> Account {
        Account {
            user_id: self.user_id,
            tier: Tier::from(self.tier.as_str()),
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct AdventureRecord {
    id: Uuid,
    user_id: Uuid,
    adventure_number: i32,
    style: Json<Style>,
    world: Json<World>,
    characters: Json<Vec<Character>>,
    settings: Json<Vec<Setting>>,
    story_count: i64,
    created_at: DateTime<Utc>,
}
impl AdventureRecord {
    fn to_domain(self) -> Adventure {
        Adventure {
            id: self.id,
            user_id: self.user_id,
            adventure_number: self.adventure_number,
            style: self.style.0,
            world: self.world.0,
            characters: self.characters.0,
            settings: self.settings.0,
            story_count: self.story_count,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct StoryRecord {
    id: Uuid,
    adventure_id: Uuid,
    prompt: String,
    title: String,
    outline: Option<String>,
    summary: Option<String>,
    status: String,
    error: Option<String>,
    input_tokens: i64,
    output_tokens: i64,
    audio_ref: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl StoryRecord {
    fn to_domain(self) -> PortResult<Story> {
        Ok(Story {
            id: self.id,
            adventure_id: self.adventure_id,
            prompt: self.prompt,
            title: self.title,
            outline: self.outline,
            summary: self.summary,
            status: self.status.parse().map_err(PortError::Unexpected)?,
            error: self.error,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            audio_ref: self.audio_ref,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct JobRecord {
    id: Uuid,
    story_id: Uuid,
    status: String,
    created_at: DateTime<Utc>,
}
impl JobRecord {
    fn to_domain(self) -> PortResult<StoryJob> {
        Ok(StoryJob {
            id: self.id,
            story_id: self.story_id,
            status: self.status.parse().map_err(PortError::Unexpected)?,
            created_at: self.created_at,
        })
    }
}

//=========================================================================================
// `DatabaseService` Trait Implementation
//=========================================================================================

#[async_trait]
impl DatabaseService for DbAdapter {
    async fn get_user(&self, user_id: Uuid) -> PortResult<User> {
        let record = sqlx::query_as::<_, UserRecord>(
            "SELECT user_id, username, display_name FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found_or(format!("User {} not found", user_id)))?;
        Ok(record.to_domain())
    }

    async fn get_adventure(&self, adventure_id: Uuid) -> PortResult<Adventure> {
        let record = sqlx::query_as::<_, AdventureRecord>(
            "SELECT a.id, a.user_id, a.adventure_number, a.style, a.world, a.characters, a.settings, \
                    (SELECT COUNT(*) FROM stories s WHERE s.adventure_id = a.id) AS story_count, \
                    a.created_at \
             FROM adventures a WHERE a.id = $1",
        )
        .bind(adventure_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found_or(format!("Adventure {} not found", adventure_id)))?;
        Ok(record.to_domain())
    }

    async fn create_story_with_job(
        &self,
        adventure_id: Uuid,
        prompt: &str,
        title: &str,
    ) -> PortResult<(Story, StoryJob)> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let story = sqlx::query_as::<_, StoryRecord>(&format!(
            "INSERT INTO stories (id, adventure_id, prompt, title, status) \
             VALUES ($1, $2, $3, $4, 'pending') RETURNING {}",
            STORY_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(adventure_id)
        .bind(prompt)
        .bind(title)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        let job = sqlx::query_as::<_, JobRecord>(
            "INSERT INTO story_jobs (id, story_id, status) VALUES ($1, $2, 'queued') \
             RETURNING id, story_id, status, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(story.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok((story.to_domain()?, job.to_domain()?))
    }

    async fn get_story(&self, story_id: Uuid) -> PortResult<Story> {
        sqlx::query_as::<_, StoryRecord>(&format!(
            "SELECT {} FROM stories WHERE id = $1",
            STORY_COLUMNS
        ))
        .bind(story_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found_or(format!("Story {} not found", story_id)))?
        .to_domain()
    }

    async fn list_stories_by_status(
        &self,
        adventure_id: Uuid,
        status: StoryStatus,
    ) -> PortResult<Vec<Story>> {
        let records = sqlx::query_as::<_, StoryRecord>(&format!(
            "SELECT {} FROM stories WHERE adventure_id = $1 AND status = $2 ORDER BY created_at DESC",
            STORY_COLUMNS
        ))
        .bind(adventure_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        records.into_iter().map(StoryRecord::to_domain).collect()
    }

    async fn count_stories_for_user(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude: Option<Uuid>,
    ) -> PortResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM stories s \
             JOIN adventures a ON a.id = s.adventure_id \
             WHERE a.user_id = $1 AND s.created_at >= $2 AND s.created_at < $3 \
               AND ($4::uuid IS NULL OR s.id <> $4)",
        )
        .bind(user_id)
        .bind(from)
        .bind(until)
        .bind(exclude)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn update_story_status(
        &self,
        story_id: Uuid,
        status: StoryStatus,
        error: Option<&str>,
    ) -> PortResult<bool> {
        let allowed: Vec<String> = StoryStatus::predecessors_of(status)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let result = sqlx::query(
            "UPDATE stories SET status = $2, error = COALESCE($3, error), updated_at = NOW() \
             WHERE id = $1 AND status = ANY($4)",
        )
        .bind(story_id)
        .bind(status.as_str())
        .bind(error)
        .bind(&allowed)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM stories WHERE id = $1)")
            .bind(story_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        if !exists {
            return Err(PortError::NotFound(format!("Story {} not found", story_id)));
        }
        Ok(false)
    }

    async fn save_outline(&self, story_id: Uuid, title: &str, outline: &str) -> PortResult<()> {
        sqlx::query("UPDATE stories SET title = $2, outline = $3, updated_at = NOW() WHERE id = $1")
            .bind(story_id)
            .bind(title)
            .bind(outline)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn save_summary(&self, story_id: Uuid, summary: &str) -> PortResult<()> {
        sqlx::query("UPDATE stories SET summary = $2, updated_at = NOW() WHERE id = $1")
            .bind(story_id)
            .bind(summary)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn complete_story(&self, story_id: Uuid, usage: TokenUsage) -> PortResult<bool> {
        let result = sqlx::query(
            "UPDATE stories SET status = 'completed', input_tokens = $2, output_tokens = $3, \
                    updated_at = NOW() \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(story_id)
        .bind(usage.input)
        .bind(usage.output)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn save_chapter(
        &self,
        story_id: Uuid,
        key: ChapterKey,
        content: &ChapterContent,
    ) -> PortResult<()> {
        // Merges into the part object so sibling chapters survive.
        sqlx::query(
            "INSERT INTO story_contents (story_id, raw_content) \
             VALUES ($1, jsonb_build_object($2::text, jsonb_build_object($3::text, $4::jsonb))) \
             ON CONFLICT (story_id) DO UPDATE SET \
                raw_content = story_contents.raw_content || jsonb_build_object( \
                    $2::text, \
                    COALESCE(story_contents.raw_content -> $2::text, '{}'::jsonb) \
                        || jsonb_build_object($3::text, $4::jsonb)), \
                updated_at = NOW()",
        )
        .bind(story_id)
        .bind(key.part_key())
        .bind(key.chapter_key())
        .bind(Json(content))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_story_content(&self, story_id: Uuid) -> PortResult<StoryContent> {
        let raw = sqlx::query_scalar::<_, Json<serde_json::Value>>(
            "SELECT raw_content FROM story_contents WHERE story_id = $1",
        )
        .bind(story_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        match raw {
            Some(Json(value)) => StoryContent::from_raw(story_id, &value)
                .map_err(|e| PortError::Unexpected(e.to_string())),
            None => Ok(StoryContent::new(story_id)),
        }
    }

    async fn save_story_image(&self, image: &StoryImage) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO story_images (story_id, slot, blob_key, text_marker) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (story_id, slot) DO UPDATE SET \
                blob_key = EXCLUDED.blob_key, \
                text_marker = EXCLUDED.text_marker, \
                created_at = NOW()",
        )
        .bind(image.story_id)
        .bind(image.slot.slot_key())
        .bind(&image.blob_key)
        .bind(&image.text_marker)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn list_unfinished_jobs(&self) -> PortResult<Vec<StoryJob>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT id, story_id, status, created_at FROM story_jobs \
             WHERE status <> 'done' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        records.into_iter().map(JobRecord::to_domain).collect()
    }

    async fn get_job(&self, job_id: Uuid) -> PortResult<StoryJob> {
        sqlx::query_as::<_, JobRecord>(
            "SELECT id, story_id, status, created_at FROM story_jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found_or(format!("Job {} not found", job_id)))?
        .to_domain()
    }

    async fn update_job_status(&self, job_id: Uuid, status: JobStatus) -> PortResult<()> {
        sqlx::query("UPDATE story_jobs SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

//=========================================================================================
// `AccountService` Trait Implementation
//=========================================================================================

#[async_trait]
impl AccountService for DbAdapter {
    async fn get_account(&self, user_id: Uuid) -> PortResult<Account> {
        let record = sqlx::query_as::<_, AccountRecord>(
            "SELECT user_id, tier, created_at FROM accounts WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found_or(format!("Account for user {} not found", user_id)))?;
        Ok(record.to_domain())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::error::Error as StdError;

    #[derive(Debug, thiserror::Error)]
    #[error("duplicate key value violates unique constraint")]
    struct DuplicateKey;

    impl DatabaseError for DuplicateKey {
        fn message(&self) -> &str {
            "duplicate key value violates unique constraint"
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn constraint(&self) -> Option<&str> {
            Some("adventures_user_number_key")
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    #[test]
    fn test_unique_violation_is_reported_as_invalid_input() {
        let error = db_error(sqlx::Error::Database(Box::new(DuplicateKey)));
        match error {
            PortError::InvalidInput(msg) => assert!(msg.contains("adventures_user_number_key")),
            other => panic!("expected invalid input, got {:?}", other),
        }
        assert!(matches!(db_error(sqlx::Error::PoolTimedOut), PortError::Transient(_)));
        assert!(matches!(db_error(sqlx::Error::RowNotFound), PortError::Unexpected(_)));
    }

    #[test]
    fn test_adventure_numbers_are_unique_per_user() {
        let migration = include_str!("../../migrations/0002_adventure_numbering.sql");
        assert!(migration.contains("UNIQUE (user_id, adventure_number)"));
    }
}
