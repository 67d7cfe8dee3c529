//! Isolated render workers.
//!
//! Each worker owns a dedicated OS thread driving a current-thread tokio
//! runtime. Requests are drained from an unbounded inbox strictly in arrival
//! order and every accepted request produces exactly one response on the
//! outbox. Parallelism comes from running several workers in a [`RenderPool`].

use std::{
    any::Any,
    num::NonZeroUsize,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::JoinHandle,
    time::Instant,
};

use futures::{FutureExt, future::try_join_all};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::engine::EngineSlot;
use super::service::{MathEngine, RenderPipelineConfig};
use super::types::{RenderError, RenderRequest, RenderResponse};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to build worker runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("render worker has shut down")]
    Closed,
    #[error("render worker thread panicked")]
    Panicked,
    #[error(transparent)]
    Initialization(#[from] RenderError),
}

/// Anything that accepts render requests for asynchronous processing.
pub trait RenderSink: Send + Sync {
    fn submit(&self, request: RenderRequest) -> Result<(), WorkerError>;
}

#[derive(Debug)]
pub enum WorkerMessage {
    Request(RenderRequest),
    /// An undecoded JSON frame; dropped without a response when malformed.
    Raw(String),
    /// Bring the engine up ahead of the first request.
    Initialize(oneshot::Sender<Result<(), RenderError>>),
}

/// Runs inside the worker thread: one request at a time, in order.
pub struct PipelineCoordinator {
    worker: usize,
    slot: EngineSlot,
    outbox: mpsc::UnboundedSender<RenderResponse>,
}

impl PipelineCoordinator {
    pub fn new(
        worker: usize,
        slot: EngineSlot,
        outbox: mpsc::UnboundedSender<RenderResponse>,
    ) -> Self {
        Self {
            worker,
            slot,
            outbox,
        }
    }

    pub async fn run(self, mut inbox: mpsc::UnboundedReceiver<WorkerMessage>) {
        debug!(
            target = "application::render::worker",
            worker = self.worker,
            "render worker started"
        );

        while let Some(message) = inbox.recv().await {
            let request = match message {
                WorkerMessage::Request(request) => request,
                WorkerMessage::Raw(frame) => match serde_json::from_str::<RenderRequest>(&frame) {
                    Ok(request) => request,
                    Err(err) => {
                        debug!(
                            target = "application::render::worker",
                            worker = self.worker,
                            error = %err,
                            "ignoring malformed render frame"
                        );
                        continue;
                    }
                },
                WorkerMessage::Initialize(reply) => {
                    let outcome = self.slot.ensure_ready().await.map(|_| ());
                    let _ = reply.send(outcome);
                    continue;
                }
            };

            let response = self.handle(request).await;
            if self.outbox.send(response).is_err() {
                debug!(
                    target = "application::render::worker",
                    worker = self.worker,
                    "response receiver dropped; stopping worker"
                );
                break;
            }
        }

        debug!(
            target = "application::render::worker",
            worker = self.worker,
            "render worker stopped"
        );
    }

    /// Render one request into its response. Never fails: pipeline errors
    /// and panics become `error` responses.
    pub async fn handle(&self, request: RenderRequest) -> RenderResponse {
        let started_at = Instant::now();
        counter!("mdworker_render_total").increment(1);

        let outcome = AssertUnwindSafe(self.render(&request.markdown))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(RenderError::Aborted {
                    message: panic_message(panic.as_ref()),
                })
            });

        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!("mdworker_render_ms").record(elapsed_ms);

        match outcome {
            Ok(html) => {
                debug!(
                    target = "application::render::worker",
                    worker = self.worker,
                    id = %request.id,
                    elapsed_ms = elapsed_ms as u64,
                    "render completed"
                );
                RenderResponse::html(request.id, html)
            }
            Err(err) => {
                counter!("mdworker_render_failed_total").increment(1);
                warn!(
                    target = "application::render::worker",
                    worker = self.worker,
                    id = %request.id,
                    error = %err,
                    "render failed"
                );
                RenderResponse::error(request.id, err.to_string())
            }
        }
    }

    async fn render(&self, markdown: &str) -> Result<String, RenderError> {
        let engine = self.slot.ensure_ready().await?;
        engine.render(markdown).await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "render panicked".to_string()
    }
}

/// Handle to one worker thread.
pub struct RenderWorker {
    inbox: mpsc::UnboundedSender<WorkerMessage>,
    thread: Option<JoinHandle<()>>,
}

impl RenderWorker {
    /// Spawn a worker with its own response channel.
    pub fn spawn(
        index: usize,
        config: RenderPipelineConfig,
        math: Arc<dyn MathEngine>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RenderResponse>), WorkerError> {
        let (outbox, responses) = mpsc::unbounded_channel();
        let worker = Self::spawn_with_outbox(index, config, math, outbox)?;
        Ok((worker, responses))
    }

    pub fn spawn_with_outbox(
        index: usize,
        config: RenderPipelineConfig,
        math: Arc<dyn MathEngine>,
        outbox: mpsc::UnboundedSender<RenderResponse>,
    ) -> Result<Self, WorkerError> {
        let (inbox, messages) = mpsc::unbounded_channel();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(WorkerError::Runtime)?;

        let thread = std::thread::Builder::new()
            .name(format!("mdworker-render-{index}"))
            .spawn(move || {
                let coordinator =
                    PipelineCoordinator::new(index, EngineSlot::new(config, math), outbox);
                runtime.block_on(coordinator.run(messages));
            })
            .map_err(WorkerError::Spawn)?;

        Ok(Self {
            inbox,
            thread: Some(thread),
        })
    }

    pub fn submit_raw(&self, frame: impl Into<String>) -> Result<(), WorkerError> {
        self.send(WorkerMessage::Raw(frame.into()))
    }

    /// Initialize the engine now instead of on the first request.
    pub async fn initialize(&self) -> Result<(), WorkerError> {
        let (reply, outcome) = oneshot::channel();
        self.send(WorkerMessage::Initialize(reply))?;
        outcome.await.map_err(|_| WorkerError::Closed)??;
        Ok(())
    }

    /// Close the inbox and wait for queued requests to drain. Blocks the
    /// calling thread.
    pub fn shutdown(mut self) -> Result<(), WorkerError> {
        let thread = self.thread.take();
        drop(self);
        match thread {
            Some(handle) => handle.join().map_err(|_| WorkerError::Panicked),
            None => Ok(()),
        }
    }

    fn send(&self, message: WorkerMessage) -> Result<(), WorkerError> {
        self.inbox.send(message).map_err(|_| WorkerError::Closed)
    }
}

impl RenderSink for RenderWorker {
    fn submit(&self, request: RenderRequest) -> Result<(), WorkerError> {
        self.send(WorkerMessage::Request(request))
    }
}

/// Independent workers behind round-robin dispatch, sharing one response
/// stream. Ordering holds per worker only.
pub struct RenderPool {
    workers: Vec<RenderWorker>,
    next: AtomicUsize,
}

impl RenderPool {
    pub fn spawn(
        instances: NonZeroUsize,
        config: RenderPipelineConfig,
        math: Arc<dyn MathEngine>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RenderResponse>), WorkerError> {
        let (outbox, responses) = mpsc::unbounded_channel();
        let workers = (0..instances.get())
            .map(|index| {
                RenderWorker::spawn_with_outbox(
                    index,
                    config.clone(),
                    Arc::clone(&math),
                    outbox.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            target = "application::render::worker",
            instances = workers.len(),
            "render pool started"
        );

        Ok((
            Self {
                workers,
                next: AtomicUsize::new(0),
            },
            responses,
        ))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub async fn initialize(&self) -> Result<(), WorkerError> {
        try_join_all(self.workers.iter().map(|worker| worker.initialize())).await?;
        Ok(())
    }

    pub fn submit_raw(&self, frame: impl Into<String>) -> Result<(), WorkerError> {
        self.pick()?.submit_raw(frame)
    }

    pub fn shutdown(self) -> Result<(), WorkerError> {
        let mut outcome = Ok(());
        for worker in self.workers {
            if let Err(err) = worker.shutdown() {
                outcome = Err(err);
            }
        }
        outcome
    }

    fn pick(&self) -> Result<&RenderWorker, WorkerError> {
        if self.workers.is_empty() {
            return Err(WorkerError::Closed);
        }
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Ok(&self.workers[slot])
    }
}

impl RenderSink for RenderPool {
    fn submit(&self, request: RenderRequest) -> Result<(), WorkerError> {
        self.pick()?.submit(request)
    }
}
