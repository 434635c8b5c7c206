//! Batch job: render one character's images

use super::runner::{BatchItem, BatchJob, JobFailure, JobOutput};
use crate::extract::ErrorKind;
use crate::image::{save_images, CharacterPrompt, ImageBackend, ImageError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

impl BatchItem for CharacterPrompt {
    fn id(&self) -> &str {
        &self.name
    }
}

/// One backend call per character, images saved under the output directory.
pub struct ImageJob {
    backend: Arc<dyn ImageBackend>,
    output_dir: PathBuf,
    images_per_character: u32,
    timeout: Duration,
}

impl ImageJob {
    pub fn new(backend: Arc<dyn ImageBackend>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            output_dir: output_dir.into(),
            images_per_character: 1,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_images_per_character(mut self, n: u32) -> Self {
        self.images_per_character = n.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn classify(err: &ImageError) -> ErrorKind {
    match err {
        ImageError::Timeout(_) => ErrorKind::CollaboratorTimeout,
        ImageError::Rejected(_) => ErrorKind::CollaboratorRefusal,
        ImageError::Http(_) | ImageError::Unavailable(_) => ErrorKind::CollaboratorUnavailable,
        ImageError::Json(_) => ErrorKind::CollaboratorRefusal,
        ImageError::Io(_) => ErrorKind::OutputWrite,
    }
}

#[async_trait]
impl BatchJob for ImageJob {
    type Item = CharacterPrompt;

    async fn process(&self, character: &CharacterPrompt) -> Result<JobOutput, JobFailure> {
        let failure = |e: ImageError| JobFailure::new(classify(&e), e.to_string());

        let images = tokio::time::timeout(
            self.timeout,
            self.backend.generate(&character.prompt, self.images_per_character),
        )
        .await
        .map_err(|_| failure(ImageError::Timeout(self.timeout)))?
        .map_err(failure)?;

        if images.is_empty() {
            return Err(failure(ImageError::Rejected("backend returned no images".into())));
        }

        let saved = save_images(&self.output_dir, &character.name, &images)
            .await
            .map_err(|e| failure(ImageError::Io(e)))?;

        Ok(JobOutput {
            row: serde_json::json!({
                "name": character.name,
                "prompt": character.prompt,
                "images": saved.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
            }),
            error_kinds: Vec::new(),
        })
    }
}
