//! Ingress stage: admission throttle in front of a bounded, back-pressured
//! queue drained by publish workers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use abstractgateway::{IngressSink, SubmitError, ValidationEvent};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::publisher::{BrokerPublisher, PublishOutcome};
use crate::config::DispatcherConfig;
use crate::metrics::PipelineMetrics;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no admission slot within {0:?}")]
    AdmissionTimeout(Duration),

    #[error("dispatch queue is closed")]
    QueueClosed,

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

impl From<DispatchError> for SubmitError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::AdmissionTimeout(d) => SubmitError::AdmissionTimeout(d),
            DispatchError::QueueClosed => SubmitError::Closed,
            DispatchError::ShuttingDown => SubmitError::ShuttingDown,
        }
    }
}

/// Queued event plus its arrival time, for end-to-end publish latency.
#[derive(Debug)]
pub struct Envelope {
    pub event: ValidationEvent,
    pub arrived_at: Instant,
}

/// Receiving half of the dispatch queue.
pub struct DispatchQueue {
    rx: mpsc::Receiver<Envelope>,
}

impl DispatchQueue {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Refuse new events; already queued ones can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

pub struct Dispatcher {
    cfg: DispatcherConfig,
    admission: Semaphore,
    tx: mpsc::Sender<Envelope>,
    shutdown: CancellationToken,
    metrics: Arc<dyn PipelineMetrics>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("cfg", &self.cfg)
            .field("free_slots", &self.admission.available_permits())
            .field("queue_free", &self.tx.capacity())
            .finish()
    }
}

impl Dispatcher {
    /// `shutdown` makes pending and future submissions fail with `ShuttingDown`.
    pub fn new(
        cfg: DispatcherConfig,
        shutdown: CancellationToken,
        metrics: Arc<dyn PipelineMetrics>,
    ) -> (Arc<Self>, DispatchQueue) {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        let dispatcher = Arc::new(Self {
            admission: Semaphore::new(cfg.admission_slots.max(1)),
            cfg,
            tx,
            shutdown,
            metrics,
        });
        (dispatcher, DispatchQueue { rx })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.cfg
    }

    /// Free slots in the bounded queue.
    pub fn queue_capacity_left(&self) -> usize {
        self.tx.capacity()
    }

    /// Admit and enqueue one event. Waits for an admission slot up to the
    /// configured timeout, then for queue space without limit.
    pub async fn submit(&self, event: ValidationEvent) -> Result<(), DispatchError> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }

        let timeout = self.cfg.admission_timeout;
        let _permit = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(DispatchError::ShuttingDown),
            acquired = tokio::time::timeout(timeout, self.admission.acquire()) => match acquired {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(DispatchError::ShuttingDown),
                Err(_) => {
                    self.metrics.admission_rejected();
                    warn!(equipment_id = %event.equipment_id, ?timeout, "admission timed out");
                    return Err(DispatchError::AdmissionTimeout(timeout));
                }
            },
        };

        let envelope = Envelope { event, arrived_at: Instant::now() };
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(DispatchError::ShuttingDown),
            sent = self.tx.send(envelope) => sent.map_err(|_| DispatchError::QueueClosed)?,
        }
        self.metrics.validation_received();
        Ok(())
    }

    /// Re-inject recovered events. Stops at the first refusal and reports how
    /// many went through.
    pub async fn replay(&self, events: Vec<ValidationEvent>) -> Result<usize, (usize, DispatchError)> {
        let total = events.len();
        let mut replayed = 0;
        for event in events {
            if let Err(e) = self.submit(event).await {
                warn!(replayed, total, error = %e, "replay interrupted");
                return Err((replayed, e));
            }
            replayed += 1;
        }
        if total > 0 {
            info!(events = total, "cached events replayed");
        }
        Ok(replayed)
    }

    /// Start one drain worker per publisher. Workers share the queue and stop
    /// once shutdown is signalled and everything queued has been published.
    pub fn spawn_workers(&self, queue: DispatchQueue, publishers: Vec<BrokerPublisher>) -> DispatchWorkers {
        let queue = Arc::new(Mutex::new(queue));
        let handles = publishers
            .into_iter()
            .enumerate()
            .map(|(id, publisher)| {
                tokio::spawn(run_worker(id, queue.clone(), publisher, self.shutdown.clone()))
            })
            .collect();
        DispatchWorkers { handles }
    }
}

#[async_trait]
impl IngressSink for Dispatcher {
    async fn submit(&self, event: ValidationEvent) -> Result<(), SubmitError> {
        Dispatcher::submit(self, event).await.map_err(SubmitError::from)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub published: u64,
    pub failed: u64,
}

pub struct DispatchWorkers {
    handles: Vec<JoinHandle<WorkerReport>>,
}

impl DispatchWorkers {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker; the shutdown token must have been cancelled.
    pub async fn join(self) -> Result<WorkerReport, tokio::task::JoinError> {
        let mut total = WorkerReport::default();
        for handle in self.handles {
            let r = handle.await?;
            total.published += r.published;
            total.failed += r.failed;
        }
        Ok(total)
    }
}

async fn run_worker(
    id: usize,
    queue: Arc<Mutex<DispatchQueue>>,
    publisher: BrokerPublisher,
    shutdown: CancellationToken,
) -> WorkerReport {
    let mut report = WorkerReport::default();
    debug!(worker = id, "dispatch worker started");

    loop {
        let next = {
            let mut q = queue.lock().await;
            tokio::select! {
                biased;
                env = q.recv() => env,
                _ = shutdown.cancelled() => {
                    // drain what is already queued, then stop
                    q.close();
                    q.recv().await
                }
            }
        };
        let Some(env) = next else { break };

        match publisher.publish(&env.event).await {
            PublishOutcome::Published { .. } => report.published += 1,
            PublishOutcome::Failed { .. } => report.failed += 1,
        }
        debug!(worker = id, queued_for = ?env.arrived_at.elapsed(), "dispatched");
    }

    publisher.close().await;
    info!(worker = id, published = report.published, failed = report.failed, "dispatch worker stopped");
    report
}
