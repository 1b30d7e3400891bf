//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{
        blob::read_optional_text, DbAdapter, FsBlobStore, ImageCoverDesigner, OpenAiImageAdapter,
        OpenAiTextAdapter,
    },
    config::Config,
    error::ApiError,
    web::{rest::ApiDoc, router, state::AppState},
    worker::{spawn_workers, JobQueue},
};
use async_openai::{config::OpenAIConfig, Client};
use axum::{
    http::{header::CONTENT_TYPE, HeaderName, HeaderValue, Method},
    Router,
};
use bedtime_core::{
    pipeline::{Orchestrator, PipelinePorts, PipelineSettings},
    ports::BlobStore,
    service::StoryService,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let db_adapter = Arc::new(DbAdapter::new(db_pool));
    info!("Running database migrations...");
    db_adapter.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize Service Adapters ---
    let mut openai_config = OpenAIConfig::new().with_api_key(
        config
            .openai_api_key
            .as_ref()
            .ok_or(ApiError::MissingCredential("OPENAI_API_KEY"))?,
    );
    if let Some(base) = &config.openai_api_base {
        openai_config = openai_config.with_api_base(base);
    }
    let openai_client = Client::with_config(openai_config);
    let blob_store = Arc::new(FsBlobStore::new(&config.blob_root)?);

    let mut story_model = OpenAiTextAdapter::new(openai_client.clone(), config.story_model.clone());
    match read_optional_text(blob_store.as_ref(), &config.system_prompt_blob_key).await? {
        Some(instructions) => {
            info!(
                "Loaded story model instructions from '{}'",
                config.system_prompt_blob_key
            );
            story_model = story_model.with_system_prompt(instructions);
        }
        None => warn!(
            "No story model instructions at '{}'; running without a system prompt",
            config.system_prompt_blob_key
        ),
    }
    let story_model = Arc::new(story_model);
    let summary_model = Arc::new(OpenAiTextAdapter::new(
        openai_client.clone(),
        config.summary_model.clone(),
    ));
    let image_adapter = Arc::new(OpenAiImageAdapter::new(
        openai_client,
        config.image_model.clone(),
    ));
    let cover_designer = Arc::new(ImageCoverDesigner::from_font_path(
        config.cover_font_path.as_deref(),
    )?);

    if !blob_store.exists(&config.rules_blob_key).await? {
        warn!(
            "Story rules blob '{}' is missing under {}; generation will fail until it is added",
            config.rules_blob_key,
            config.blob_root.display()
        );
    }

    // --- 4. Start the Generation Workers ---
    let orchestrator = Arc::new(Orchestrator::new(
        PipelinePorts {
            db: db_adapter.clone(),
            accounts: db_adapter.clone(),
            story_model,
            helper_model: summary_model,
            images: image_adapter,
            blobs: blob_store,
            cover_designer,
        },
        PipelineSettings {
            rules_key: config.rules_blob_key.clone(),
            ..PipelineSettings::default()
        },
    ));
    let shutdown = CancellationToken::new();
    let (job_queue, receiver) = JobQueue::channel();
    let workers = spawn_workers(
        orchestrator,
        receiver,
        config.worker_concurrency,
        shutdown.clone(),
    );
    info!("Started {} generation workers", config.worker_concurrency);
    job_queue.republish_unfinished(db_adapter.as_ref()).await?;

    // --- 5. Build the Shared AppState ---
    let app_state = Arc::new(AppState {
        stories: StoryService::new(db_adapter),
        jobs: job_queue,
    });

    let cors_origin = config
        .cors_origin
        .parse::<HeaderValue>()
        .map_err(|e| ApiError::InvalidCorsOrigin {
            origin: config.cors_origin.clone(),
            reason: e.to_string(),
        })?;
    let cors = CorsLayer::new()
        .allow_origin(cors_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, HeaderName::from_static("x-user-id")]);

    // --- 6. Create the Web Router ---
    let app = Router::new()
        .merge(router(app_state).layer(cors))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 7. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await?;

    // --- 8. Let Running Jobs Finish ---
    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!("Worker task ended abnormally: {}", e);
        }
    }
    info!("Server stopped");
    Ok(())
}
