//! In-process import dispatcher
//!
//! `LocalDispatcher` queues jobs on a bounded channel; an [`ImportWorker`]
//! drains it, running up to `worker_concurrency` jobs at once. Each run is
//! bounded by the job timeout and retried with exponential backoff when the
//! job store fails.

use crate::errors::ImportError;
use crate::orchestrator::{ImportOrchestrator, RunOutcome};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoffBuilder;
use librarium_common::config::ImportConfig;
use librarium_common::errors::{AppError, Result};
use librarium_common::metrics::{record_import_retry, record_running_jobs};
use librarium_common::{Dispatcher, ImportJobMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

/// Sends import jobs to the local worker
#[derive(Clone)]
pub struct LocalDispatcher {
    sender: mpsc::Sender<ImportJobMessage>,
}

impl LocalDispatcher {
    /// Create a dispatcher and the receiving end a worker drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ImportJobMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Create a dispatcher with a worker already running.
    ///
    /// The worker stops once every clone of the dispatcher is dropped and
    /// in-flight jobs have finished.
    pub fn start(orchestrator: Arc<ImportOrchestrator>, config: &ImportConfig) -> (Self, JoinHandle<()>) {
        let (dispatcher, receiver) = Self::new(config.queue_capacity);
        let worker = ImportWorker::from_config(orchestrator, config);
        let handle = tokio::spawn(worker.run(receiver));
        (dispatcher, handle)
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn enqueue(&self, message: ImportJobMessage) -> Result<()> {
        let job_id = message.job_id;
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AppError::ServiceUnavailable {
                message: "Import queue is full, try again later".to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => AppError::QueueError {
                message: "Import worker is not running".to_string(),
            },
        })?;

        debug!(job_id = %job_id, "Import job queued");
        Ok(())
    }
}

/// Executes queued import jobs
#[derive(Clone)]
pub struct ImportWorker {
    orchestrator: Arc<ImportOrchestrator>,
    concurrency: usize,
    job_timeout: Duration,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl ImportWorker {
    pub fn from_config(orchestrator: Arc<ImportOrchestrator>, config: &ImportConfig) -> Self {
        Self {
            orchestrator,
            concurrency: config.worker_concurrency.max(1),
            job_timeout: config.job_timeout(),
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(500),
        }
    }

    /// Delay before the first retry
    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Receive and execute jobs until the channel closes
    pub async fn run(self, mut receiver: mpsc::Receiver<ImportJobMessage>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        info!(concurrency = self.concurrency, "Import worker started");

        loop {
            tokio::select! {
                received = receiver.recv() => {
                    let Some(message) = received else { break };
                    let Ok(permit) = semaphore.clone().acquire_owned().await else { break };

                    let worker = self.clone();
                    let span = tracing::info_span!("import_job", job_id = %message.job_id);
                    tasks.spawn(
                        async move {
                            let _permit = permit;
                            worker.execute(message).await;
                        }
                        .instrument(span),
                    );
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Import task panicked");
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "Import queue closed, draining");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Import task panicked");
            }
        }
        info!("Import worker stopped");
    }

    /// Run one job with timeout and retries
    pub async fn execute(&self, message: ImportJobMessage) {
        record_running_jobs(1.0);

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(Duration::from_secs(30))
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 0u32;
        let result = retry(policy, || {
            attempt += 1;
            let current = attempt;
            let message = &message;
            async move {
                match self.attempt(message).await {
                    Ok(outcome) => Ok(outcome),
                    Err(e @ ImportError::Timeout { .. }) => Err(backoff::Error::permanent(e)),
                    Err(e) if current >= self.max_attempts => Err(backoff::Error::permanent(e)),
                    Err(e) => {
                        warn!(attempt = current, error = %e, "Import attempt failed, retrying");
                        record_import_retry();
                        Err(backoff::Error::transient(e))
                    }
                }
            }
        })
        .await;

        match result {
            Ok(RunOutcome::Finished(summary)) => {
                debug!(status = %summary.status, "Import job done");
            }
            Ok(RunOutcome::Skipped) => {}
            Err(e) => error!(error = %e, attempts = attempt, "Import job gave up"),
        }

        record_running_jobs(-1.0);
    }

    async fn attempt(&self, message: &ImportJobMessage) -> std::result::Result<RunOutcome, ImportError> {
        match tokio::time::timeout(self.job_timeout, self.orchestrator.run(message)).await {
            Ok(result) => result,
            Err(_) => {
                let err = ImportError::Timeout { secs: self.job_timeout.as_secs() };
                warn!(timeout_secs = self.job_timeout.as_secs(), "Import job timed out");

                match self.orchestrator.repository().fail_import_job(message.job_id, &err.to_string()).await {
                    Ok(true) => {}
                    Ok(false) => debug!("Timed out job was no longer processing"),
                    Err(store) => error!(error = %store, "Could not mark timed out job failed"),
                }
                Err(err)
            }
        }
    }
}
