pub mod chunking;
pub mod domain;
pub mod error;
pub mod illustrator;
pub mod outline;
pub mod pipeline;
pub mod ports;
pub mod quota;
pub mod retry;
pub mod service;
pub mod session;
pub mod writer;

pub use domain::{
    Account, Adventure, AgeBand, ChapterContent, ChapterKey, ImageSlot, Story, StoryContent,
    StoryImage, StoryJob, StoryStatus, Tier, TokenUsage, User,
};
pub use error::PipelineError;
pub use pipeline::{Orchestrator, PipelinePorts, PipelineSettings, RunOutcome};
pub use ports::{
    AccountService, BlobStore, CoverDesigner, DatabaseService, ImageGenerationService, PortError,
    PortResult, TextGenerationService,
};
pub use service::{StoryProgress, StoryService};
