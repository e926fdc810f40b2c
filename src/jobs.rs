use crate::{
    agent::Agent,
    models::{ApiError, ListingOutcome, ListingPayload},
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    jobs: Arc<Mutex<HashMap<Uuid, JobInfo>>>,
}

struct Job {
    id: Uuid,
    marketplace: String,
    payload: ListingPayload,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed {
        result: ListingOutcome,
    },
    Failed {
        error: String,
        stage: Option<String>,
    },
}

impl JobState {
    fn from_outcome(outcome: ListingOutcome) -> Self {
        match &outcome.error {
            Some(error) if !outcome.success => JobState::Failed {
                error: error.message.clone(),
                stage: error.stage.clone(),
            },
            _ => JobState::Completed { result: outcome },
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed { .. } | JobState::Failed { .. })
    }
}

/// Who drives a job: the in-process worker, or an external browser-side
/// worker that reports back through [`JobQueue::complete`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Executor {
    Agent,
    External,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: String,
    pub marketplace: String,
    pub executor: Executor,
    #[serde(flatten)]
    pub state: JobState,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CompleteError {
    NotFound,
    NotExternal,
    AlreadyFinished,
}

impl JobQueue {
    pub fn spawn(agent: Agent) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity_from_env());
        let jobs: Arc<Mutex<HashMap<Uuid, JobInfo>>> = Arc::new(Mutex::new(HashMap::new()));
        let jobs_bg = jobs.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                set_state(&jobs_bg, job.id, JobState::Running).await;
                let outcome = agent.create_listing(&job.marketplace, &job.payload).await;
                info!(
                    target = "agent.jobs",
                    job_id = %job.id,
                    marketplace = %job.marketplace,
                    success = outcome.success,
                    "job_finished"
                );
                set_state(&jobs_bg, job.id, JobState::from_outcome(outcome)).await;
            }
        });

        (Self { tx, jobs }, handle)
    }

    pub async fn enqueue_listing(
        &self,
        marketplace: &str,
        payload: ListingPayload,
    ) -> Result<Uuid, ApiError> {
        let id = self.insert(marketplace, Executor::Agent).await;
        let job = Job {
            id,
            marketplace: marketplace.to_string(),
            payload,
        };
        if self.tx.send(job).await.is_err() {
            self.jobs.lock().await.remove(&id);
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
            });
        }
        Ok(id)
    }

    /// Records a job that an external worker will perform.
    pub async fn register_external(&self, marketplace: &str) -> Uuid {
        let id = self.insert(marketplace, Executor::External).await;
        info!(target = "agent.jobs", job_id = %id, marketplace, "external_job_registered");
        id
    }

    pub async fn complete(&self, id: Uuid, outcome: ListingOutcome) -> Result<JobInfo, CompleteError> {
        let mut guard = self.jobs.lock().await;
        let info = guard.get_mut(&id).ok_or(CompleteError::NotFound)?;
        if info.executor != Executor::External {
            return Err(CompleteError::NotExternal);
        }
        if info.state.is_finished() {
            warn!(target = "agent.jobs", job_id = %id, "job_already_finished");
            return Err(CompleteError::AlreadyFinished);
        }
        info.state = JobState::from_outcome(outcome);
        Ok(info.clone())
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        self.jobs.lock().await.get(&id).cloned()
    }

    async fn insert(&self, marketplace: &str, executor: Executor) -> Uuid {
        let id = Uuid::new_v4();
        self.jobs.lock().await.insert(
            id,
            JobInfo {
                id: id.to_string(),
                marketplace: marketplace.to_string(),
                executor,
                state: JobState::Queued,
            },
        );
        id
    }
}

async fn set_state(jobs: &Mutex<HashMap<Uuid, JobInfo>>, id: Uuid, state: JobState) {
    if let Some(info) = jobs.lock().await.get_mut(&id) {
        info.state = state;
    }
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::fixtures::agent;
    use crate::models::OutcomeError;
    use std::time::Duration;

    fn created() -> ListingOutcome {
        ListingOutcome::created("m1".into(), "https://m.example/item/m1".into(), vec![])
    }

    #[tokio::test]
    async fn worker_runs_queued_listing() {
        let (agent, _, _) = agent();
        let (queue, _handle) = JobQueue::spawn(agent);
        let id = queue
            .enqueue_listing("alpha", ListingPayload::default())
            .await
            .unwrap();
        let mut state = queue.get(id).await.unwrap().state;
        for _ in 0..50 {
            if state.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = queue.get(id).await.unwrap().state;
        }
        let JobState::Failed { stage, .. } = state else {
            panic!("empty payload must fail, got {state:?}");
        };
        assert_eq!(stage.as_deref(), Some("validate_payload"));
    }

    #[tokio::test]
    async fn external_jobs_complete_once() {
        let (agent, _, _) = agent();
        let (queue, _handle) = JobQueue::spawn(agent);
        let id = queue.register_external("beta").await;
        let info = queue.get(id).await.unwrap();
        assert_eq!(info.executor, Executor::External);
        assert_eq!(info.state, JobState::Queued);

        let done = queue.complete(id, created()).await.unwrap();
        assert!(matches!(done.state, JobState::Completed { .. }));
        assert_eq!(
            queue.complete(id, created()).await.unwrap_err(),
            CompleteError::AlreadyFinished
        );
        assert_eq!(
            queue.complete(Uuid::new_v4(), created()).await.unwrap_err(),
            CompleteError::NotFound
        );
    }

    #[tokio::test]
    async fn failed_external_outcome_is_reported_as_failure() {
        let (agent, _, _) = agent();
        let (queue, _handle) = JobQueue::spawn(agent);
        let id = queue.register_external("beta").await;
        let outcome = ListingOutcome::failed(
            OutcomeError {
                kind: "template_not_found".into(),
                stage: Some("select_template".into()),
                message: "no recorded requests".into(),
                snapshot_key: None,
            },
            vec![],
        );
        let info = queue.complete(id, outcome).await.unwrap();
        assert_eq!(
            info.state,
            JobState::Failed {
                error: "no recorded requests".into(),
                stage: Some("select_template".into()),
            }
        );
    }

    #[tokio::test]
    async fn agent_jobs_reject_external_completion() {
        let (agent, _, _) = agent();
        let (queue, _handle) = JobQueue::spawn(agent);
        let id = queue
            .enqueue_listing("alpha", ListingPayload::default())
            .await
            .unwrap();
        assert_eq!(
            queue.complete(id, created()).await.unwrap_err(),
            CompleteError::NotExternal
        );
    }
}
