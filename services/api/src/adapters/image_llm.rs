//! services/api/src/adapters/image_llm.rs
//!
//! This module contains the adapter for the illustration model.
//! It implements the `ImageGenerationService` port from the `core` crate using the
//! OpenAI images endpoint, returning every image re-encoded as JPEG.

use crate::adapters::{cover::encode_jpeg, text_llm::map_openai_error};
use async_openai::{
    config::OpenAIConfig,
    types::{CreateImageRequestArgs, Image, ImageModel, ImageResponseFormat, ImageSize},
    Client,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bedtime_core::ports::{ImageGenerationService, PortError, PortResult};
use bytes::Bytes;
use tracing::info;

/// An adapter that implements `ImageGenerationService` using an OpenAI image model.
#[derive(Clone)]
pub struct OpenAiImageAdapter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiImageAdapter {
    /// Creates a new `OpenAiImageAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }

    fn image_model(&self) -> ImageModel {
        match self.model.as_str() {
            "dall-e-2" => ImageModel::DallE2,
            "dall-e-3" => ImageModel::DallE3,
            other => ImageModel::Other(other.to_string()),
        }
    }
}

/// Decodes whatever format the model returned and re-encodes it as JPEG.
fn to_jpeg(raw: &[u8]) -> PortResult<Vec<u8>> {
    let decoded = image::load_from_memory(raw)
        .map_err(|e| PortError::Unexpected(format!("Image model returned invalid image data: {}", e)))?;
    encode_jpeg(decoded.to_rgb8()).map_err(|e| PortError::Unexpected(e.to_string()))
}

#[async_trait]
impl ImageGenerationService for OpenAiImageAdapter {
    async fn generate_image(&self, prompt: &str) -> PortResult<Bytes> {
        let request = CreateImageRequestArgs::default()
            .prompt(prompt)
            .model(self.image_model())
            .n(1)
            .response_format(ImageResponseFormat::B64Json)
            .size(ImageSize::S1024x1024)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;

        let response = self
            .client
            .images()
            .create(request)
            .await
            .map_err(map_openai_error)?;

        let image = response.data.first().ok_or_else(|| {
            PortError::Unexpected("Image model returned no images in its response.".to_string())
        })?;
        let encoded = match image.as_ref() {
            Image::B64Json { b64_json, .. } => b64_json.clone(),
            Image::Url { .. } => {
                return Err(PortError::Unexpected(
                    "Image model returned a URL instead of inline data.".to_string(),
                ))
            }
        };
        let raw = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| PortError::Unexpected(format!("Invalid base64 image payload: {}", e)))?;

        let jpeg = tokio::task::spawn_blocking(move || to_jpeg(&raw))
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))??;
        info!("Generated a {} byte image with {}", jpeg.len(), self.model);
        Ok(Bytes::from(jpeg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

    #[test]
    fn test_png_payload_is_reencoded_as_jpeg() {
        let mut png = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 8, Rgb([10, 200, 10])))
            .write_to(&mut std::io::Cursor::new(&mut png), ImageFormat::Png)
            .unwrap();

        let jpeg = to_jpeg(&png).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        assert!(matches!(to_jpeg(b"nope"), Err(PortError::Unexpected(_))));
    }
}
