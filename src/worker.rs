// ============================================================================
// ANALYSIS WORKER POOL
// ============================================================================
// Fixed number of workers draining one bounded queue. Submission waits at
// most `submit_timeout` for queue space; past that the request is logged and
// dropped. Each accepted request gets a handle the caller may await.
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{AnalysisError, AnalysisResult};
use crate::pipeline::{AnalysisPipeline, AnalysisReport};
use crate::telemetry::EngineMetrics;
use crate::types::TimeWindow;

struct AnalysisJob {
    metric: String,
    tier: TimeWindow,
    reply: oneshot::Sender<AnalysisResult<AnalysisReport>>,
}

/// Awaitable result of a submitted analysis
#[derive(Debug)]
pub struct AnalysisHandle {
    metric: String,
    tier: TimeWindow,
    reply: oneshot::Receiver<AnalysisResult<AnalysisReport>>,
}

impl AnalysisHandle {
    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn tier(&self) -> TimeWindow {
        self.tier
    }

    /// Wait for the report. A request abandoned by a shutting-down pool
    /// resolves to `Cancelled`.
    pub async fn wait(self) -> AnalysisResult<AnalysisReport> {
        self.reply.await.unwrap_or(Err(AnalysisError::Cancelled))
    }
}

pub struct WorkerPool {
    sender: mpsc::Sender<AnalysisJob>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
    submit_timeout: Duration,
    metrics: Arc<EngineMetrics>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawn `workers` workers. They stop when `cancel` fires.
    pub fn start(
        workers: usize,
        capacity: usize,
        submit_timeout: Duration,
        pipeline: Arc<AnalysisPipeline>,
        metrics: Arc<EngineMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let workers = workers.max(1);
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel::<AnalysisJob>(capacity);
        let receiver = Arc::new(AsyncMutex::new(receiver));

        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&receiver),
                    Arc::clone(&pipeline),
                    cancel.clone(),
                ))
            })
            .collect();

        info!(target: "pulse::worker", workers, capacity, "Analysis worker pool started");
        Self {
            sender,
            workers: Mutex::new(handles),
            capacity,
            submit_timeout,
            metrics,
            cancel,
        }
    }

    /// Queue an analysis, waiting at most `submit_timeout` for space
    pub async fn submit(&self, metric: &str, tier: TimeWindow) -> AnalysisResult<AnalysisHandle> {
        if self.cancel.is_cancelled() {
            return Err(AnalysisError::PoolClosed);
        }
        let (reply, receiver) = oneshot::channel();
        let job = AnalysisJob {
            metric: metric.to_string(),
            tier,
            reply,
        };

        match self.sender.send_timeout(job, self.submit_timeout).await {
            Ok(()) => Ok(AnalysisHandle {
                metric: metric.to_string(),
                tier,
                reply: receiver,
            }),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                self.metrics.record_analysis_dropped();
                warn!(
                    target: "pulse::worker",
                    metric,
                    tier = %tier,
                    timeout_ms = self.submit_timeout.as_millis() as u64,
                    "Analysis queue full, request dropped"
                );
                Err(AnalysisError::QueueFull {
                    metric: metric.to_string(),
                    timeout_ms: self.submit_timeout.as_millis() as u64,
                })
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(AnalysisError::PoolClosed),
        }
    }

    /// Requests waiting for a worker
    pub fn queue_depth(&self) -> usize {
        self.capacity.saturating_sub(self.sender.capacity())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop the workers and wait up to `timeout` for them to exit. Returns
    /// false when some worker was still running at the deadline.
    pub async fn join(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let joined = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;
        match joined {
            Ok(_) => {
                debug!(target: "pulse::worker", "Worker pool stopped");
                true
            }
            Err(_) => {
                warn!(target: "pulse::worker", timeout_ms = timeout.as_millis() as u64, "Workers still running at shutdown deadline");
                false
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    receiver: Arc<AsyncMutex<mpsc::Receiver<AnalysisJob>>>,
    pipeline: Arc<AnalysisPipeline>,
    cancel: CancellationToken,
) {
    debug!(target: "pulse::worker", worker = id, "Worker started");
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = async { receiver.lock().await.recv().await } => job,
        };
        let Some(job) = job else { break };

        let result = pipeline.run(&job.metric, job.tier, cancel.child_token()).await;
        if let Err(e) = &result {
            debug!(target: "pulse::worker", worker = id, metric = %job.metric, error = %e, "Analysis failed");
        }
        // The requester may have stopped waiting.
        let _ = job.reply.send(result);
    }
    debug!(target: "pulse::worker", worker = id, "Worker stopped");
}
