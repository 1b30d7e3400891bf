pub mod rest;
pub mod state;

pub use rest::{
    create_story_handler, health_handler, router, story_content_handler, story_status_handler,
};
