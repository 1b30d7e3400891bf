//! services/api/src/adapters/cover.rs
//!
//! This module contains the cover compositor.
//! It implements the `CoverDesigner` port from the `core` crate: the generated cover
//! art is letterboxed onto a fixed portrait canvas and, when a font is configured,
//! the story title and author line are drawn over it.

use ab_glyph::{FontVec, PxScale};
use async_trait::async_trait;
use bedtime_core::ports::{CoverDesigner, PortError, PortResult};
use bytes::Bytes;
use image::{
    codecs::jpeg::JpegEncoder, imageops, imageops::FilterType, DynamicImage, ImageResult, Rgb,
    RgbImage,
};
use imageproc::drawing::{draw_text_mut, text_size};
use std::{path::Path, sync::Arc};
use tracing::{info, warn};

/// JPEG quality used for every image the service writes.
pub const JPEG_QUALITY: u8 = 90;

/// Encodes an RGB buffer as a JPEG.
pub fn encode_jpeg(image: RgbImage) -> ImageResult<Vec<u8>> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY)
        .encode_image(&DynamicImage::ImageRgb8(image))?;
    Ok(bytes)
}

//=========================================================================================
// Layout
//=========================================================================================

/// Geometry of the cover canvas and its text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverLayout {
    pub width: u32,
    pub height: u32,
    pub title_top: u32,
    pub author_bottom_margin: u32,
}

impl Default for CoverLayout {
    fn default() -> Self {
        Self {
            width: 800,
            height: 1040,
            title_top: 50,
            author_bottom_margin: 50,
        }
    }
}

impl CoverLayout {
    /// Title size is 10% of the canvas width.
    pub fn title_px(&self) -> f32 {
        (self.width as f32 * 0.1).floor()
    }

    pub fn author_px(&self) -> f32 {
        (self.title_px() * 0.6).floor()
    }

    pub fn max_text_width(&self) -> u32 {
        (self.width as f32 * 0.8) as u32
    }

    pub fn line_advance(&self) -> f32 {
        self.title_px() * 1.2
    }

    /// Size and offset of a `src_width` x `src_height` image scaled to fit inside the
    /// canvas with its aspect ratio intact. Returns `(width, height, x, y)`.
    pub fn fit(&self, src_width: u32, src_height: u32) -> (u32, u32, u32, u32) {
        let scale = f64::min(
            self.width as f64 / src_width.max(1) as f64,
            self.height as f64 / src_height.max(1) as f64,
        );
        let width = ((src_width as f64 * scale).round() as u32).clamp(1, self.width);
        let height = ((src_height as f64 * scale).round() as u32).clamp(1, self.height);
        (
            width,
            height,
            (self.width - width) / 2,
            (self.height - height) / 2,
        )
    }

    /// Places `source` centred on a black canvas.
    pub fn letterbox(&self, source: &DynamicImage) -> RgbImage {
        let (width, height, x, y) = self.fit(source.width(), source.height());
        let resized = imageops::resize(&source.to_rgb8(), width, height, FilterType::Lanczos3);
        let mut canvas = RgbImage::from_pixel(self.width, self.height, Rgb([0, 0, 0]));
        imageops::overlay(&mut canvas, &resized, x as i64, y as i64);
        canvas
    }
}

/// Greedy word wrap. A single word wider than `max_width` gets a line of its own.
pub fn wrap_words<F>(text: &str, max_width: u32, measure: F) -> Vec<String>
where
    F: Fn(&str) -> u32,
{
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if current.is_empty() {
            current.push_str(word);
            continue;
        }
        let candidate = format!("{} {}", current, word);
        if measure(&candidate) > max_width {
            lines.push(std::mem::replace(&mut current, word.to_string()));
        } else {
            current = candidate;
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `CoverDesigner` with the `image` and `imageproc` crates.
#[derive(Clone)]
pub struct ImageCoverDesigner {
    font: Option<Arc<FontVec>>,
    layout: CoverLayout,
}

impl ImageCoverDesigner {
    /// Creates a new `ImageCoverDesigner`. Without a font, covers are letterboxed only.
    pub fn new(font: Option<FontVec>) -> Self {
        Self {
            font: font.map(Arc::new),
            layout: CoverLayout::default(),
        }
    }

    /// Loads the overlay font from a TTF/OTF file, or runs without text when `path` is unset.
    pub fn from_font_path(path: Option<&Path>) -> std::io::Result<Self> {
        let Some(path) = path else {
            warn!("No cover font configured. Covers will carry no title text.");
            return Ok(Self::new(None));
        };
        let data = std::fs::read(path)?;
        let font = FontVec::try_from_vec(data).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: {}", path.display(), e),
            )
        })?;
        info!("Loaded cover font from {}", path.display());
        Ok(Self::new(Some(font)))
    }

    /// Letterboxes the image and draws the title and author line. Blocking.
    pub fn compose(&self, image: &[u8], title: &str, author: &str) -> ImageResult<Vec<u8>> {
        let source = image::load_from_memory(image)?;
        let mut canvas = self.layout.letterbox(&source);
        if let Some(font) = &self.font {
            self.draw_text(&mut canvas, font, title, author);
        }
        encode_jpeg(canvas)
    }

    fn draw_text(&self, canvas: &mut RgbImage, font: &FontVec, title: &str, author: &str) {
        let layout = self.layout;
        let white = Rgb([255, 255, 255]);

        let title_scale = PxScale::from(layout.title_px());
        let lines = wrap_words(title, layout.max_text_width(), |line| {
            text_size(title_scale, font, line).0
        });
        let mut y = layout.title_top as f32;
        for line in &lines {
            let (line_width, _) = text_size(title_scale, font, line);
            let x = (layout.width as i32 - line_width as i32) / 2;
            draw_text_mut(canvas, white, x, y as i32, title_scale, font, line);
            y += layout.line_advance();
        }

        let author_scale = PxScale::from(layout.author_px());
        let author_line = format!("By {}", author);
        let (author_width, _) = text_size(author_scale, font, &author_line);
        let x = (layout.width as i32 - author_width as i32) / 2;
        let y = layout.height as i32 - layout.author_px() as i32 - layout.author_bottom_margin as i32;
        draw_text_mut(canvas, white, x, y, author_scale, font, &author_line);
    }
}

//=========================================================================================
// `CoverDesigner` Trait Implementation
//=========================================================================================

#[async_trait]
impl CoverDesigner for ImageCoverDesigner {
    async fn compose_cover(&self, image: Bytes, title: &str, author: &str) -> PortResult<Bytes> {
        let designer = self.clone();
        let title = title.to_string();
        let author = author.to_string();
        let composed = tokio::task::spawn_blocking(move || designer.compose(&image, &title, &author))
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?
            .map_err(|e| PortError::Unexpected(format!("Failed to compose cover: {}", e)))?;
        Ok(Bytes::from(composed))
    }
}
