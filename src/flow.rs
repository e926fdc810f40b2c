use crate::error::{AgentError, AgentResult};
use crate::models::{ListingOutcome, OutcomeError, StageReport};
use serde_json::{Value, json};
use std::{future::Future, time::Instant};
use thiserror::Error;
use tracing::warn;

/// Value produced by a workflow stage plus the summary kept in the transcript.
#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    pub fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {source}")]
pub struct StageError {
    pub stage: &'static str,
    #[source]
    pub source: AgentError,
}

impl StageError {
    pub fn new(stage: &'static str, source: AgentError) -> Self {
        Self { stage, source }
    }

    pub fn outcome_error(&self) -> OutcomeError {
        OutcomeError {
            kind: self.source.kind().to_string(),
            stage: Some(self.stage.to_string()),
            message: self.source.to_string(),
            snapshot_key: match &self.source {
                AgentError::Extraction { snapshot_key, .. } => snapshot_key.clone(),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct StageTranscript {
    marketplace: String,
    stages: Vec<StageReport>,
}

impl StageTranscript {
    pub fn new(marketplace: &str) -> Self {
        Self {
            marketplace: marketplace.to_string(),
            stages: Vec::new(),
        }
    }

    pub async fn capture<T, Fut>(&mut self, name: &'static str, fut: Fut) -> Result<T, StageError>
    where
        Fut: Future<Output = AgentResult<StageOutcome<T>>>,
    {
        let started = Instant::now();
        let result = fut.await;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        match result {
            Ok(outcome) => {
                self.stages
                    .push(StageReport::new(name, elapsed_ms, outcome.output));
                Ok(outcome.value)
            }
            Err(err) => {
                warn!(
                    target = "agent.flow",
                    marketplace = %self.marketplace,
                    stage = name,
                    kind = err.kind(),
                    error = %err,
                    "stage_failed"
                );
                self.stages.push(StageReport::new(
                    name,
                    elapsed_ms,
                    json!({ "error": err.kind() }),
                ));
                Err(StageError::new(name, err))
            }
        }
    }

    pub fn stages(&self) -> &[StageReport] {
        &self.stages
    }

    /// Folds a workflow result into the caller-facing outcome.
    pub fn finish(self, result: Result<(String, String), StageError>) -> ListingOutcome {
        match result {
            Ok((listing_id, url)) => ListingOutcome::created(listing_id, url, self.stages),
            Err(err) => ListingOutcome::failed(err.outcome_error(), self.stages),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_stages_are_recorded_in_order() {
        let mut transcript = StageTranscript::new("alpha");
        let a: u8 = transcript
            .capture("first", async { Ok(StageOutcome::new(1, json!({"n": 1}))) })
            .await
            .unwrap();
        let b: u8 = transcript
            .capture("second", async { Ok(StageOutcome::new(2, json!({"n": 2}))) })
            .await
            .unwrap();
        assert_eq!((a, b), (1, 2));
        let names: Vec<&str> = transcript.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failure_carries_stage_and_kind() {
        let mut transcript = StageTranscript::new("alpha");
        let result: Result<(), StageError> = transcript
            .capture("resolve_region", async {
                Err(AgentError::validation("zipCode", "unresolved"))
            })
            .await;
        let err = result.unwrap_err();
        let outcome = transcript.finish(Err(err));
        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, "validation");
        assert_eq!(error.stage.as_deref(), Some("resolve_region"));
        assert_eq!(outcome.stages.len(), 1);
    }
}
