//! Request/response transport between the two sides of the boundary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use lore_core::errors::BridgeError;

use crate::envelope::{BridgeRequest, Envelope, Reply};
use crate::host::Host;

/// One request in, one reply out. Implementations correlate replies to
/// requests themselves.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn call(&self, envelope: Envelope) -> Result<Reply, BridgeError>;
}

/// Request queued for an in-process host.
pub struct HostRequest {
    pub envelope: Envelope,
    pub reply: oneshot::Sender<Reply>,
}

/// In-process channel backed by an `mpsc` queue and a `oneshot` per call.
#[derive(Clone)]
pub struct LocalChannel {
    tx: mpsc::Sender<HostRequest>,
}

impl LocalChannel {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<HostRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Channel wired to a task serving `host`. The task ends when every
    /// channel clone is dropped.
    pub fn spawn(host: Arc<Host>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (channel, rx) = Self::new(capacity);
        let task = tokio::spawn(serve_local(host, rx));
        (channel, task)
    }
}

#[async_trait]
impl Channel for LocalChannel {
    async fn call(&self, envelope: Envelope) -> Result<Reply, BridgeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(HostRequest {
                envelope,
                reply: reply_tx,
            })
            .await
            .map_err(|_| BridgeError::ChannelUnavailable("host closed".into()))?;
        reply_rx
            .await
            .map_err(|_| BridgeError::ChannelUnavailable("reply dropped".into()))
    }
}

/// Serve queued requests until the queue closes. Each request runs on its
/// own task so a slow search does not hold up checkpoint writes.
pub async fn serve_local(host: Arc<Host>, mut rx: mpsc::Receiver<HostRequest>) {
    while let Some(request) = rx.recv().await {
        let host = Arc::clone(&host);
        drop(tokio::spawn(async move {
            let reply = host.handle(request.envelope).await;
            let _ = request.reply.send(reply);
        }));
    }
    debug!("local host queue closed");
}

/// Typed calls over a [`Channel`] with a per-call timeout.
#[derive(Clone)]
pub struct BridgeClient {
    channel: Arc<dyn Channel>,
    timeout: Duration,
    next_id: Arc<AtomicU64>,
}

impl BridgeClient {
    pub fn new(channel: Arc<dyn Channel>, timeout: Duration) -> Self {
        Self {
            channel,
            timeout,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn request<Q, R>(&self, request: &Q) -> Result<R, BridgeError>
    where
        Q: BridgeRequest,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::request(request, Some(id))?;
        let reply = tokio::time::timeout(self.timeout, self.channel.call(envelope))
            .await
            .map_err(|_| BridgeError::Timeout(self.timeout))??;
        if reply.id.is_some_and(|got| got != id) {
            return Err(BridgeError::Codec(format!(
                "reply id {:?} does not match request {id}",
                reply.id
            )));
        }
        reply.into_typed()
    }
}
