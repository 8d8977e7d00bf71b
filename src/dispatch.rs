use crate::analysis::{AnalysisService, RunOutcome};
use crate::error::{self, PipelineError};
use crate::model::{ProcessImageMessage, QueueKind, RunAnalysisMessage};
use crate::queue::{QueueMessage, SqliteQueue};
use crate::worker::{ImageWorker, ProcessOutcome};
use anyhow::Result;
use chrono::Utc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Deliveries before a transiently failing message is dead-lettered.
    pub max_attempts: u32,
    pub max_backoff_secs: i64,
    /// Wall-clock limit for one image job. Keep below the queue visibility
    /// timeout so a slow job is not redelivered while still running.
    pub job_timeout: Duration,
}

pub struct Dispatcher {
    queue: SqliteQueue,
    worker: ImageWorker,
    analysis: AnalysisService,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        queue: SqliteQueue,
        worker: ImageWorker,
        analysis: AnalysisService,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            queue,
            worker,
            analysis,
            settings,
        }
    }

    /// Handle at most one due message. Returns false when the queue was empty.
    #[instrument(skip_all)]
    pub async fn process_next(&self) -> Result<bool> {
        let Some(msg) = self.queue.receive(Utc::now()).await? else {
            return Ok(false);
        };
        match msg.kind {
            QueueKind::ProcessImage => self.handle_image(&msg).await?,
            QueueKind::RunAnalysis => self.handle_analysis(&msg).await?,
        }
        Ok(true)
    }

    async fn handle_image(&self, msg: &QueueMessage) -> Result<()> {
        let payload: ProcessImageMessage = match msg.decode() {
            Ok(p) => p,
            Err(err) => {
                self.queue.dead_letter(msg, &format!("{:#}", err), Utc::now()).await?;
                return Ok(());
            }
        };

        let res = match tokio::time::timeout(self.settings.job_timeout, self.worker.process(&payload)).await {
            Ok(res) => res,
            Err(_) => Err(PipelineError::Transient(format!(
                "image job exceeded {}s",
                self.settings.job_timeout.as_secs()
            ))
            .into()),
        };

        match res {
            Ok(outcome) => {
                match &outcome {
                    ProcessOutcome::Processed { image_id, model } => {
                        info!(id = msg.id, job_id = payload.job_id, image_id, %model, "image job succeeded")
                    }
                    ProcessOutcome::AlreadyProcessed { image_id } => {
                        info!(id = msg.id, job_id = payload.job_id, ?image_id, "image job already done")
                    }
                    ProcessOutcome::Skipped(reason) => {
                        info!(id = msg.id, job_id = payload.job_id, %reason, "image job skipped")
                    }
                }
                self.queue.ack(msg.id).await?;
            }
            Err(err) if error::is_transient(&err) => {
                if (msg.attempt as u32) < self.settings.max_attempts {
                    let due = self
                        .queue
                        .retry_later(msg, self.settings.max_backoff_secs, Utc::now())
                        .await?;
                    warn!(?err, id = msg.id, job_id = payload.job_id, attempt = msg.attempt, %due, "image job failed; backoff");
                } else {
                    let text = format!("{:#}", err);
                    self.worker.fail(payload.job_id, &err).await?;
                    self.queue.dead_letter(msg, &text, Utc::now()).await?;
                }
            }
            Err(err) => {
                self.worker.fail(payload.job_id, &err).await?;
                self.queue.ack(msg.id).await?;
            }
        }
        Ok(())
    }

    async fn handle_analysis(&self, msg: &QueueMessage) -> Result<()> {
        let payload: RunAnalysisMessage = match msg.decode() {
            Ok(p) => p,
            Err(err) => {
                self.queue.dead_letter(msg, &format!("{:#}", err), Utc::now()).await?;
                return Ok(());
            }
        };
        // Generation failures are recorded on the job by the service. An error
        // here means the job state itself could not be updated.
        match self.analysis.run(payload.job_id).await {
            Ok(RunOutcome::Completed { truncated }) => {
                info!(id = msg.id, job_id = payload.job_id, truncated, "analysis job succeeded")
            }
            Ok(RunOutcome::Failed(reason)) => {
                warn!(id = msg.id, job_id = payload.job_id, %reason, "analysis job failed")
            }
            Ok(RunOutcome::Skipped(reason)) => {
                info!(id = msg.id, job_id = payload.job_id, %reason, "analysis job skipped")
            }
            Err(err) => {
                error!(?err, id = msg.id, job_id = payload.job_id, "analysis job errored");
                self.queue.dead_letter(msg, &format!("{:#}", err), Utc::now()).await?;
                return Ok(());
            }
        }
        self.queue.ack(msg.id).await
    }

    /// Poll the queue forever, sleeping `poll` whenever it is empty.
    pub async fn run(&self, poll: Duration) {
        info!("dispatcher started");
        loop {
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(poll).await,
                Err(err) => {
                    error!(?err, "dispatcher error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
