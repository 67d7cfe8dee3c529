use std::{sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::debug;
use uuid::Uuid;

use super::types::{RenderRequest, RenderResponse};
use super::worker::{RenderSink, WorkerError};

/// Pending render calls keyed by request id.
///
/// Each caller registers its id before submitting; the response dispatcher
/// hands the matching response to exactly that caller. Responses for ids
/// nobody is waiting on (late, cancelled or foreign) are rejected.
#[derive(Default, Clone)]
pub struct RenderMailbox {
    inner: Arc<DashMap<String, oneshot::Sender<RenderResponse>>>,
}

impl RenderMailbox {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    pub fn register(
        &self,
        id: String,
    ) -> Result<oneshot::Receiver<RenderResponse>, RenderMailboxError> {
        match self.inner.entry(id) {
            Entry::Occupied(occupied) => {
                Err(RenderMailboxError::DuplicateId(occupied.key().clone()))
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                vacant.insert(tx);
                Ok(rx)
            }
        }
    }

    pub fn deliver(&self, response: RenderResponse) -> Result<(), RenderMailboxError> {
        match self.inner.remove(response.id()) {
            Some((_id, sender)) => sender
                .send(response)
                .map_err(|_| RenderMailboxError::ChannelClosed),
            None => Err(RenderMailboxError::UnknownId(response.id().to_string())),
        }
    }

    /// Forget a pending id. Returns whether it was still pending.
    pub fn cancel(&self, id: &str) -> bool {
        self.inner.remove(id).is_some()
    }

    pub fn pending(&self) -> usize {
        self.inner.len()
    }

    /// Drop every pending sender, waking all waiters with a closed channel.
    fn close_all(&self) {
        self.inner.clear();
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderMailboxError {
    #[error("render mailbox channel already closed")]
    ChannelClosed,
    #[error("no pending render for id `{0}`")]
    UnknownId(String),
    #[error("render id `{0}` is already pending")]
    DuplicateId(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Mailbox(#[from] RenderMailboxError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("render `{id}` timed out after {}ms", .after.as_millis())]
    Timeout { id: String, after: Duration },
    #[error("render `{id}` failed: {message}")]
    Render { id: String, message: String },
    #[error("render workers went away before answering `{id}`")]
    Disconnected { id: String },
}

/// Request/response correlation on top of a worker or pool.
pub struct RenderClient<S> {
    sink: S,
    mailbox: RenderMailbox,
    dispatcher: JoinHandle<()>,
    timeout: Option<Duration>,
}

impl<S: RenderSink> RenderClient<S> {
    /// Take ownership of the sink's response stream. Must be called within a
    /// tokio runtime.
    pub fn new(sink: S, responses: mpsc::UnboundedReceiver<RenderResponse>) -> Self {
        let mailbox = RenderMailbox::new();
        let dispatcher = tokio::spawn(dispatch(mailbox.clone(), responses));
        Self {
            sink,
            mailbox,
            dispatcher,
            timeout: None,
        }
    }

    /// Default timeout applied by [`RenderClient::render`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn mailbox(&self) -> &RenderMailbox {
        &self.mailbox
    }

    /// Stop dispatching responses and hand back the sink, e.g. to shut a
    /// worker down.
    pub fn into_sink(self) -> S {
        self.dispatcher.abort();
        self.sink
    }

    pub async fn render(
        &self,
        id: impl Into<String>,
        markdown: impl Into<String>,
    ) -> Result<String, ClientError> {
        self.call(id.into(), markdown.into(), self.timeout).await
    }

    /// Render under a fresh random id.
    pub async fn render_markdown(
        &self,
        markdown: impl Into<String>,
    ) -> Result<String, ClientError> {
        self.render(Uuid::new_v4().to_string(), markdown).await
    }

    pub async fn render_with_timeout(
        &self,
        id: impl Into<String>,
        markdown: impl Into<String>,
        timeout: Duration,
    ) -> Result<String, ClientError> {
        self.call(id.into(), markdown.into(), Some(timeout)).await
    }

    async fn call(
        &self,
        id: String,
        markdown: String,
        timeout: Option<Duration>,
    ) -> Result<String, ClientError> {
        let receiver = self.mailbox.register(id.clone())?;
        if let Err(err) = self.sink.submit(RenderRequest::new(id.clone(), markdown)) {
            self.mailbox.cancel(&id);
            return Err(err.into());
        }

        let received = match timeout {
            Some(after) => match tokio::time::timeout(after, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    self.mailbox.cancel(&id);
                    return Err(ClientError::Timeout { id, after });
                }
            },
            None => receiver.await,
        };

        let response = received.map_err(|_| ClientError::Disconnected { id: id.clone() })?;
        response
            .into_result()
            .map_err(|message| ClientError::Render { id, message })
    }
}

async fn dispatch(
    mailbox: RenderMailbox,
    mut responses: mpsc::UnboundedReceiver<RenderResponse>,
) {
    while let Some(response) = responses.recv().await {
        if let Err(err) = mailbox.deliver(response) {
            debug!(
                target = "application::render::client",
                error = %err,
                "discarding render response"
            );
        }
    }
    mailbox.close_all();
}
