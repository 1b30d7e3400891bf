pub mod blob;
pub mod cover;
pub mod db;
pub mod image_llm;
pub mod text_llm;

pub use blob::FsBlobStore;
pub use cover::ImageCoverDesigner;
pub use db::DbAdapter;
pub use image_llm::OpenAiImageAdapter;
pub use text_llm::OpenAiTextAdapter;
