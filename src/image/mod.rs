//! Image-generation collaborator boundary
//!
//! The image batch is the single-task analogue of extraction: one backend
//! call per character prompt, images written under a per-character folder.

pub mod comfy;
mod files;

pub use files::{next_image_number, sanitize_name, save_images};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by image backends.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image generation timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("image backend rejected the request: {0}")]
    Rejected(String),

    #[error("image backend unavailable: {0}")]
    Unavailable(String),
}

/// Result type for image operations
pub type ImageResult<T> = Result<T, ImageError>;

/// One character to render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterPrompt {
    pub name: String,
    pub prompt: String,
}

/// Load `[{"name": ..., "prompt": ...}, ...]` from a JSON file.
pub fn load_prompts(path: &Path) -> ImageResult<Vec<CharacterPrompt>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

/// Client trait for the image-generation collaborator.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Check if the backend is reachable.
    async fn is_available(&self) -> bool;

    /// Render `count` images for `prompt`, returning encoded image bytes.
    async fn generate(&self, prompt: &str, count: u32) -> ImageResult<Vec<Vec<u8>>>;
}

/// Mock backend for testing; returns tiny fake PNGs.
pub struct MockImageBackend {
    available: bool,
    reject_markers: Vec<String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockImageBackend {
    pub fn available() -> Self {
        Self {
            available: true,
            reject_markers: Vec::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::available()
        }
    }

    /// Reject every prompt containing `marker`.
    pub fn with_rejection_for(mut self, marker: impl Into<String>) -> Self {
        self.reject_markers.push(marker.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// PNG signature followed by one marker byte.
fn fake_png(index: u8) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.push(index);
    bytes
}

#[async_trait]
impl ImageBackend for MockImageBackend {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn generate(&self, prompt: &str, count: u32) -> ImageResult<Vec<Vec<u8>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if !self.available {
            return Err(ImageError::Unavailable("mock backend configured as unavailable".into()));
        }
        if self.reject_markers.iter().any(|m| prompt.contains(m.as_str())) {
            return Err(ImageError::Rejected("mock rejection".into()));
        }
        Ok((0..count).map(|i| fake_png(i as u8)).collect())
    }
}
