//! services/api/src/worker.rs
//!
//! The durable generation queue. Job ids travel over an in-process channel to a
//! fixed pool of workers; the `story_jobs` table is the source of truth, so any job
//! not yet `done` is re-published when the service starts.

use bedtime_core::{pipeline::Orchestrator, ports::DatabaseService, PortResult};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Capacity of the job channel. Senders wait when the workers fall this far behind.
pub const QUEUE_CAPACITY: usize = 256;

/// The sending half handed to request handlers.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<Uuid>,
}

impl JobQueue {
    /// Creates the queue and the receiver the worker pool drains.
    pub fn channel() -> (Self, mpsc::Receiver<Uuid>) {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        (Self { sender }, receiver)
    }

    /// Notifies the workers about a job. A closed channel only delays the job until
    /// the next restart, since it is still recorded in the database.
    pub async fn publish(&self, job_id: Uuid) {
        if self.sender.send(job_id).await.is_err() {
            warn!("Job queue is closed; job {} will run after restart", job_id);
        }
    }

    /// Re-publishes every job that never reached `done`.
    pub async fn republish_unfinished(&self, db: &dyn DatabaseService) -> PortResult<usize> {
        let jobs = db.list_unfinished_jobs().await?;
        let count = jobs.len();
        for job in jobs {
            self.publish(job.id).await;
        }
        if count > 0 {
            info!("Re-published {} unfinished generation jobs", count);
        }
        Ok(count)
    }
}

/// Spawns `concurrency` workers sharing one receiver. Workers exit when `shutdown`
/// is cancelled or every sender is dropped; a job already running is finished first.
pub fn spawn_workers(
    orchestrator: Arc<Orchestrator>,
    receiver: mpsc::Receiver<Uuid>,
    concurrency: usize,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));
    (0..concurrency)
        .map(|worker_id| {
            let orchestrator = orchestrator.clone();
            let receiver = receiver.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                info!("Worker {} started", worker_id);
                loop {
                    let next = tokio::select! {
                        _ = shutdown.cancelled() => None,
                        job = async { receiver.lock().await.recv().await } => job,
                    };
                    let Some(job_id) = next else {
                        break;
                    };
                    match orchestrator.run_job(job_id).await {
                        Ok(Some(outcome)) => info!(
                            "Worker {} finished job {}: story {} is {}",
                            worker_id, job_id, outcome.story_id, outcome.status
                        ),
                        Ok(None) => info!("Worker {} closed job {} with nothing to run", worker_id, job_id),
                        Err(e) => error!("Worker {} failed job {}: {}", worker_id, job_id, e),
                    }
                }
                info!("Worker {} stopped", worker_id);
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_delivers_job_ids_in_order() {
        let (queue, mut receiver) = JobQueue::channel();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        queue.publish(first).await;
        queue.publish(second).await;

        assert_eq!(receiver.recv().await, Some(first));
        assert_eq!(receiver.recv().await, Some(second));
    }

    #[tokio::test]
    async fn test_publish_after_close_does_not_panic() {
        let (queue, receiver) = JobQueue::channel();
        drop(receiver);
        queue.publish(Uuid::new_v4()).await;
    }
}
