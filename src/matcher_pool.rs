use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{EdgeError, Result};
use crate::recognition::MatchJob;
use crate::vision::{self, FaceEmbedder};

#[derive(Debug, Clone, PartialEq)]
pub struct MatchOutcome {
    pub token: Uuid,
    pub client_id: i64,
    /// `None` when no face could be extracted from the image
    pub similarity: Option<f32>,
}

/// Fixed set of long-lived comparison workers, one queue each. The caller
/// owns the round-robin cursor.
pub struct MatcherPool {
    queues: Vec<mpsc::UnboundedSender<MatchJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl MatcherPool {
    pub fn spawn(size: usize, embedder: Arc<dyn FaceEmbedder>, results: mpsc::UnboundedSender<MatchOutcome>) -> Self {
        let size = size.max(1);
        let mut queues = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.push(tx);
            workers.push(tokio::spawn(run_matcher(index, rx, Arc::clone(&embedder), results.clone())));
        }
        info!("Started {} client matcher workers", size);
        Self { queues, workers }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Sends `job` to the worker at `cursor` and advances the cursor
    pub fn dispatch(&self, cursor: &mut usize, job: MatchJob) -> Result<()> {
        let index = *cursor % self.queues.len();
        *cursor = (index + 1) % self.queues.len();
        self.queues[index]
            .send(job)
            .map_err(|_| EdgeError::worker(format!("matcher worker {} is gone", index)))
    }

    pub fn shutdown(self) {
        drop(self.queues);
        for worker in self.workers {
            worker.abort();
        }
    }
}

async fn run_matcher(
    index: usize,
    mut jobs: mpsc::UnboundedReceiver<MatchJob>,
    embedder: Arc<dyn FaceEmbedder>,
    results: mpsc::UnboundedSender<MatchOutcome>,
) {
    while let Some(job) = jobs.recv().await {
        let (token, client_id, image) = (job.token, job.client_id, job.image.clone());
        // a panicking comparison counts as a not-detected vote and leaves the worker running
        let embedder = Arc::clone(&embedder);
        let similarity = match tokio::spawn(async move { compare(&*embedder, &job).await }).await {
            Ok(Ok(similarity)) => similarity,
            Ok(Err(e)) => {
                warn!("Matcher {} failed on '{}': {}", index, image.display(), e);
                None
            }
            Err(e) => {
                error!("Matcher {} crashed on '{}': {}", index, image.display(), e);
                None
            }
        };
        let outcome = MatchOutcome { token, client_id, similarity };
        if results.send(outcome).is_err() {
            break;
        }
    }
    debug!("Matcher worker {} stopped", index);
}

async fn compare(embedder: &dyn FaceEmbedder, job: &MatchJob) -> Result<Option<f32>> {
    let jpeg = Bytes::from(tokio::fs::read(&job.image).await?);
    let Some(embedding) = embedder.embed(&jpeg).await? else {
        return Ok(None);
    };
    Ok(vision::match_embedding(&embedding, &job.matcher).map(|m| m.similarity))
}
