//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use bedtime_core::{
    domain::{Story, StoryContent},
    ports::PortError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        create_story_handler,
        story_status_handler,
        story_content_handler,
        health_handler,
    ),
    components(
        schemas(CreateStoryRequest, StoryStatusResponse, StoryContentResponse, ChapterView)
    ),
    tags(
        (name = "Bedtime Stories API", description = "Queue illustrated stories and read them back.")
    )
)]
pub struct ApiDoc;

/// Builds the API router over the shared state.
pub fn router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/adventures/{adventure_id}/stories", post(create_story_handler))
        .route("/stories/{story_id}/status", get(story_status_handler))
        .route("/stories/{story_id}/content", get(story_content_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct CreateStoryRequest {
    /// What the story should be about.
    pub prompt: String,
}

/// Returned when a story is queued and when its progress is polled.
#[derive(Debug, Serialize, ToSchema)]
pub struct StoryStatusResponse {
    pub story_id: Uuid,
    /// One of `pending`, `processing`, `completed`, `failed`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChapterView {
    pub part: usize,
    pub chapter: usize,
    pub part_key: String,
    pub chapter_key: String,
    pub full_text: String,
    pub summary: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StoryContentResponse {
    pub story_id: Uuid,
    pub title: String,
    pub summary: Option<String>,
    pub chapters: Vec<ChapterView>,
}

impl StoryContentResponse {
    /// Chapters come out in part, then chapter order.
    pub fn new(story: &Story, content: &StoryContent) -> Self {
        let chapters = content
            .ordered_chapters()
            .map(|(key, chapter)| ChapterView {
                part: key.part,
                chapter: key.chapter,
                part_key: key.part_key(),
                chapter_key: key.chapter_key(),
                full_text: chapter.full_text.clone(),
                summary: chapter.summary.clone(),
            })
            .collect();
        Self {
            story_id: story.id,
            title: story.title.clone(),
            summary: story.summary.clone(),
            chapters,
        }
    }
}

//=========================================================================================
// Error and Header Helpers
//=========================================================================================

/// Maps a port failure to an HTTP status and a client-safe message.
pub fn port_error_response(e: PortError) -> (StatusCode, String) {
    match e {
        PortError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        PortError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
        PortError::Unauthorized => (
            StatusCode::FORBIDDEN,
            "You do not own this adventure".to_string(),
        ),
        PortError::Transient(msg) => {
            error!("Transient failure while handling request: {}", msg);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable".to_string(),
            )
        }
        PortError::Unexpected(msg) => {
            error!("Unexpected failure while handling request: {}", msg);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    }
}

fn user_id_from(headers: &HeaderMap) -> Result<Uuid, (StatusCode, String)> {
    let user_id_str = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                "x-user-id header is required".to_string(),
            )
        })?;

    Uuid::parse_str(user_id_str).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            "Invalid x-user-id format".to_string(),
        )
    })
}

async fn ensure_owner(
    app_state: &AppState,
    user_id: Uuid,
    story_id: Uuid,
) -> Result<(), (StatusCode, String)> {
    let owner = app_state
        .stories
        .owner_of(story_id)
        .await
        .map_err(port_error_response)?;
    if owner != user_id {
        return Err(port_error_response(PortError::Unauthorized));
    }
    Ok(())
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Queue a new story for an adventure.
///
/// The story is created as `pending` and generated in the background; poll the
/// status endpoint to follow it.
#[utoipa::path(
    post,
    path = "/adventures/{adventure_id}/stories",
    request_body = CreateStoryRequest,
    responses(
        (status = 202, description = "Story queued", body = StoryStatusResponse),
        (status = 400, description = "Bad request (e.g., missing header or empty prompt)"),
        (status = 403, description = "The adventure belongs to another user"),
        (status = 404, description = "Adventure not found"),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("adventure_id" = Uuid, Path, description = "The adventure to write a story for."),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn create_story_handler(
    State(app_state): State<Arc<AppState>>,
    Path(adventure_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<CreateStoryRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = user_id_from(&headers)?;

    let job = app_state
        .stories
        .submit(user_id, adventure_id, &request.prompt)
        .await
        .map_err(port_error_response)?;
    app_state.jobs.publish(job.id).await;

    let response = StoryStatusResponse {
        story_id: job.story_id,
        status: "pending".to_string(),
        error: None,
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Get the generation status of a story.
#[utoipa::path(
    get,
    path = "/stories/{story_id}/status",
    responses(
        (status = 200, description = "Current status", body = StoryStatusResponse),
        (status = 403, description = "The story belongs to another user"),
        (status = 404, description = "Story not found")
    ),
    params(
        ("story_id" = Uuid, Path, description = "The story to inspect."),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn story_status_handler(
    State(app_state): State<Arc<AppState>>,
    Path(story_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<StoryStatusResponse>, (StatusCode, String)> {
    let user_id = user_id_from(&headers)?;
    ensure_owner(&app_state, user_id, story_id).await?;

    let progress = app_state
        .stories
        .status(story_id)
        .await
        .map_err(port_error_response)?;
    Ok(Json(StoryStatusResponse {
        story_id: progress.story_id,
        status: progress.status.as_str().to_string(),
        error: progress.error,
    }))
}

/// Get the chapters written so far for a story.
#[utoipa::path(
    get,
    path = "/stories/{story_id}/content",
    responses(
        (status = 200, description = "Story content in reading order", body = StoryContentResponse),
        (status = 403, description = "The story belongs to another user"),
        (status = 404, description = "Story not found")
    ),
    params(
        ("story_id" = Uuid, Path, description = "The story to read."),
        ("x-user-id" = Uuid, Header, description = "The unique ID of the user.")
    )
)]
pub async fn story_content_handler(
    State(app_state): State<Arc<AppState>>,
    Path(story_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<StoryContentResponse>, (StatusCode, String)> {
    let user_id = user_id_from(&headers)?;
    ensure_owner(&app_state, user_id, story_id).await?;

    let (story, content) = app_state
        .stories
        .content(story_id)
        .await
        .map_err(port_error_response)?;
    Ok(Json(StoryContentResponse::new(&story, &content)))
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up"))
)]
pub async fn health_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use bedtime_core::domain::{ChapterContent, ChapterKey};

    #[test]
    fn test_port_errors_map_to_status_codes() {
        let cases = [
            (PortError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (PortError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (PortError::Unauthorized, StatusCode::FORBIDDEN),
            (PortError::Transient("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (PortError::Unexpected("secret".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(port_error_response(error).0, expected);
        }
        let (_, message) = port_error_response(PortError::Unexpected("secret".into()));
        assert!(!message.contains("secret"));
    }

    #[test]
    fn test_user_header_is_required_and_parsed() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_id_from(&headers).unwrap_err().0, StatusCode::BAD_REQUEST);

        headers.insert("x-user-id", "not-a-uuid".parse().unwrap());
        assert_eq!(user_id_from(&headers).unwrap_err().0, StatusCode::BAD_REQUEST);

        let id = Uuid::new_v4();
        headers.insert("x-user-id", id.to_string().parse().unwrap());
        assert_eq!(user_id_from(&headers).unwrap(), id);
    }

    #[test]
    fn test_openapi_document_lists_story_routes() {
        let doc = ApiDoc::openapi();
        let routes: Vec<&str> = doc.paths.paths.keys().map(String::as_str).collect();
        assert_eq!(
            routes,
            vec![
                "/adventures/{adventure_id}/stories",
                "/health",
                "/stories/{story_id}/content",
                "/stories/{story_id}/status",
            ]
        );
    }

    #[test]
    fn test_content_lists_chapters_in_reading_order() {
        let story = Story::new(Uuid::new_v4(), "a dragon learns to read", "Story 1");
        let mut content = StoryContent::new(story.id);
        for (part, chapter) in [(2, 1), (1, 2), (1, 1)] {
            content.chapters.insert(
                ChapterKey::new(part, chapter),
                ChapterContent {
                    full_text: format!("text {}.{}", part, chapter),
                    summary: format!("summary {}.{}", part, chapter),
                },
            );
        }

        let response = StoryContentResponse::new(&story, &content);
        let order: Vec<(usize, usize)> = response
            .chapters
            .iter()
            .map(|c| (c.part, c.chapter))
            .collect();
        assert_eq!(order, vec![(1, 1), (1, 2), (2, 1)]);
        assert_eq!(response.chapters[0].part_key, "Part 1");
        assert_eq!(response.chapters[0].chapter_key, "Chapter 1");
        assert_eq!(response.title, "Story 1");
    }
}
