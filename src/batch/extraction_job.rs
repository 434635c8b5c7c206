//! Batch job: run the extraction graph over one input file

use super::inputs::BatchInput;
use super::runner::{BatchJob, JobFailure, JobOutput};
use crate::extract::{ErrorKind, ExtractionGraph, GraphError};
use async_trait::async_trait;
use tracing::debug;

/// Reads a document, runs it through the graph and hands back the merged row.
pub struct ExtractionJob {
    graph: ExtractionGraph,
}

impl ExtractionJob {
    pub fn new(graph: ExtractionGraph) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl BatchJob for ExtractionJob {
    type Item = BatchInput;

    async fn process(&self, input: &BatchInput) -> Result<JobOutput, JobFailure> {
        let text = tokio::fs::read_to_string(&input.path).await.map_err(|e| {
            JobFailure::new(
                ErrorKind::InputRead,
                format!("cannot read {}: {}", input.path.display(), e),
            )
        })?;
        debug!(document = %input.id, chars = text.chars().count(), "document read");

        // Graph errors are scheduling contract violations; all surface as missing input.
        let run = self
            .graph
            .execute(&text)
            .await
            .map_err(|e: GraphError| JobFailure::new(ErrorKind::MissingInput, e.to_string()))?;

        if run.document.all_analyses_failed() {
            return Err(JobFailure::new(
                ErrorKind::AllAnalysesFailed,
                run.document.errors.join("; "),
            ));
        }

        let row = serde_json::to_value(&run.document)
            .map_err(|e| JobFailure::new(ErrorKind::OutputWrite, e.to_string()))?;
        Ok(JobOutput {
            row,
            error_kinds: run.errors.iter().map(|e| e.kind).collect(),
        })
    }
}
