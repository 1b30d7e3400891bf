//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::worker::JobQueue;
use bedtime_core::service::StoryService;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub stories: StoryService,
    pub jobs: JobQueue,
}
