//! Resumable batch pipelines
//!
//! `BatchRunner` drives any `BatchJob` over a set of inputs against a
//! shared checkpoint ledger. Two jobs are provided: `ExtractionJob` (text
//! files through the extraction graph) and `ImageJob` (character prompts
//! through an image backend).

mod cancel;
mod extraction_job;
mod image_job;
mod inputs;
mod runner;

pub use cancel::CancellationToken;
pub use extraction_job::ExtractionJob;
pub use image_job::ImageJob;
pub use inputs::{chapter_number, chinese_numeral, compare_chapters, enumerate_inputs, BatchInput};
pub use runner::{
    BatchError, BatchItem, BatchJob, BatchResult, BatchRunner, BatchStats, FailedPolicy,
    JobFailure, JobOutput,
};
