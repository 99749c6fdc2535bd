//! Asynchronous outbound message dispatch.
//!
//! Report forwarders and the QoS manager produce outbound control traffic
//! on hot paths; the engine's RPC send can block on the network. The
//! dispatcher decouples the two: producers enqueue onto an unbounded FIFO
//! through a cheap [`DispatcherClient`] and a single long-lived worker
//! performs the sends.
//!
//! Outbound QoS messages are advisory. Send failures are logged at WARN and
//! the message is dropped; nothing retries.

use crate::engine::MessageTransport;
use crate::ids::InstanceId;
use crate::messages::StreamMessage;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One queued outbound item.
#[derive(Debug)]
pub(crate) struct OutboundItem {
    pub(crate) target: InstanceId,
    pub(crate) message: StreamMessage,
}

// =============================================================================
// Client
// =============================================================================

/// Fire-and-forget handle for enqueueing outbound messages.
///
/// Cheap to clone; never blocks. Enqueueing after shutdown silently drops
/// the message.
#[derive(Clone)]
pub struct DispatcherClient {
    tx: mpsc::UnboundedSender<OutboundItem>,
}

impl DispatcherClient {
    /// Enqueues a message for delivery to `target`.
    pub fn enqueue(&self, target: InstanceId, message: StreamMessage) {
        let _ = self.tx.send(OutboundItem { target, message });
    }
}

impl DispatcherClient {
    /// Client backed by a bare channel, for tests that inspect what a
    /// component enqueues without running the dispatch worker.
    #[cfg(test)]
    pub(crate) fn test_pair() -> (Self, mpsc::UnboundedReceiver<OutboundItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl std::fmt::Debug for DispatcherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherClient")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Owns the dispatch worker and its queue.
///
/// Created once per worker process at plugin start. [`shutdown`] drains the
/// queue (a final delivery attempt for every queued item) before stopping
/// the worker.
///
/// [`shutdown`]: MessageDispatcher::shutdown
pub struct MessageDispatcher {
    client: DispatcherClient,
    shutdown: CancellationToken,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MessageDispatcher {
    /// Creates the dispatcher and spawns its worker on the given runtime.
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        runtime_handle: &tokio::runtime::Handle,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let worker_shutdown = shutdown.clone();
        let worker_handle = runtime_handle.spawn(async move {
            run_dispatch_loop(rx, transport, worker_shutdown).await;
        });

        Self {
            client: DispatcherClient { tx },
            shutdown,
            worker_handle: Mutex::new(Some(worker_handle)),
        }
    }

    /// Returns a clone of the enqueue client.
    pub fn client(&self) -> DispatcherClient {
        self.client.clone()
    }

    /// Stops the worker after draining the queue. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.worker_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

async fn run_dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<OutboundItem>,
    transport: Arc<dyn MessageTransport>,
    shutdown: CancellationToken,
) {
    info!("QoS message dispatcher starting");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                break;
            }

            item = rx.recv() => {
                match item {
                    Some(item) => send_one(&*transport, item).await,
                    // All clients dropped.
                    None => break,
                }
            }
        }
    }

    // Drain whatever producers enqueued before the shutdown signal.
    let mut drained = 0usize;
    while let Ok(item) = rx.try_recv() {
        send_one(&*transport, item).await;
        drained += 1;
    }
    if drained > 0 {
        debug!(drained, "dispatcher drained queued messages on shutdown");
    }

    debug!("QoS message dispatcher stopped");
}

async fn send_one(transport: &dyn MessageTransport, item: OutboundItem) {
    if let Err(e) = transport.send(item.target, item.message).await {
        warn!(error = %e, "dropping undeliverable QoS message");
    }
}

// =============================================================================
// Tests
// =============================================================================
