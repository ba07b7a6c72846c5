//! Serialized broadcast dispatcher.
//!
//! Producers enqueue [`Message`]s with [`Dispatcher::queue_message`], which
//! never blocks and never touches a socket. A single worker task drains the
//! queue in FIFO order and fans each message out through the [`Registry`].
//! Because there is exactly one consumer, messages addressed to the same
//! project reach every recipient in the order they were enqueued.
//!
//! The queue is bounded. When it is full, new messages are rejected with
//! [`SyncError::QueueFull`]; clients recover anything they miss through the
//! change log.

use crate::error::{Result, SyncError};
use crate::message::Message;
use crate::registry::Registry;
use futures_util::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of messages the queue holds before rejecting.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub running: bool,
    pub queued: usize,
    pub capacity: usize,
    pub processed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub dropped_on_shutdown: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
}

enum Lifecycle {
    Idle(mpsc::Receiver<Message>),
    Running {
        token: CancellationToken,
        handle: JoinHandle<mpsc::Receiver<Message>>,
    },
    /// The worker task died and took the receiver with it.
    Lost,
}

/// Single-consumer broadcast queue with explicit start/stop.
pub struct Dispatcher {
    registry: Arc<Registry>,
    tx: mpsc::Sender<Message>,
    capacity: usize,
    lifecycle: Mutex<Lifecycle>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    /// Creates a stopped dispatcher delivering through `registry`.
    pub fn new(registry: Arc<Registry>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            registry,
            tx,
            capacity,
            lifecycle: Mutex::new(Lifecycle::Idle(rx)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Enqueues a message for delivery without waiting.
    pub fn queue_message(&self, message: Message) -> Result<()> {
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    kind = %message.kind(),
                    project = message.project_name.as_deref().unwrap_or("-"),
                    "Broadcast queue full, message rejected"
                );
                Err(SyncError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SyncError::QueueClosed),
        }
    }

    /// Number of messages waiting in the queue.
    pub fn pending(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Spawns the worker task.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let rx = match std::mem::replace(&mut *lifecycle, Lifecycle::Lost) {
            Lifecycle::Idle(rx) => rx,
            running @ Lifecycle::Running { .. } => {
                *lifecycle = running;
                return Err(SyncError::DispatcherRunning);
            }
            Lifecycle::Lost => {
                return Err(SyncError::DispatcherStopped(
                    "worker terminated abnormally".into(),
                ))
            }
        };

        let token = CancellationToken::new();
        let registry = self.registry.clone();
        let handle = tokio::spawn(run_worker(
            rx,
            token.clone(),
            self.counters.clone(),
            move |message| {
                let registry = registry.clone();
                async move { dispatch(&registry, &message).await }
            },
        ));
        *lifecycle = Lifecycle::Running { token, handle };

        info!(capacity = self.capacity, "Dispatcher started");
        Ok(())
    }

    /// Stops the worker and discards whatever is still queued.
    ///
    /// A message already being fanned out is allowed to finish. Returns the
    /// number of discarded messages. The dispatcher can be started again.
    pub async fn stop(&self) -> Result<usize> {
        let mut lifecycle = self.lifecycle.lock().await;
        let mut rx = match std::mem::replace(&mut *lifecycle, Lifecycle::Lost) {
            Lifecycle::Running { token, handle } => {
                token.cancel();
                handle
                    .await
                    .map_err(|e| SyncError::DispatcherStopped(e.to_string()))?
            }
            Lifecycle::Idle(rx) => rx,
            Lifecycle::Lost => {
                return Err(SyncError::DispatcherStopped(
                    "worker terminated abnormally".into(),
                ))
            }
        };

        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        *lifecycle = Lifecycle::Idle(rx);

        if dropped > 0 {
            self.counters
                .dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
            warn!(dropped, "Dispatcher stopped, discarded queued messages");
        } else {
            info!("Dispatcher stopped");
        }
        Ok(dropped)
    }

    pub async fn is_running(&self) -> bool {
        matches!(&*self.lifecycle.lock().await, Lifecycle::Running { .. })
    }

    pub async fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            running: self.is_running().await,
            queued: self.pending(),
            capacity: self.capacity,
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            dropped_on_shutdown: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Drains the queue until cancelled, handing the receiver back on exit.
///
/// `deliver` fans one message out and returns its recipient count. A panic
/// inside it is counted as a failure and the loop moves on to the next
/// message.
async fn run_worker<F, Fut>(
    mut rx: mpsc::Receiver<Message>,
    token: CancellationToken,
    counters: Arc<Counters>,
    deliver: F,
) -> mpsc::Receiver<Message>
where
    F: Fn(Message) -> Fut,
    Fut: Future<Output = usize>,
{
    debug!("Broadcast worker running");

    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        let kind = message.kind();
        match AssertUnwindSafe(deliver(message)).catch_unwind().await {
            Ok(recipients) => {
                counters.processed.fetch_add(1, Ordering::Relaxed);
                debug!(%kind, recipients, "Dispatched message");
            }
            Err(panic) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(%kind, "Broadcast worker panicked: {}", panic_message(&*panic));
            }
        }
    }

    debug!("Broadcast worker exiting");
    rx
}

async fn dispatch(registry: &Registry, message: &Message) -> usize {
    match message.project_name.as_deref() {
        Some(project) => registry.broadcast_to_project(project, message, None).await,
        None => registry.broadcast_global(message).await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Frame;
    use crate::registry::Outbox;
    use serde_json::Value;
    use std::time::Duration;

    async fn next(rx: &mut mpsc::Receiver<Frame>) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbox closed");
        serde_json::from_str(&frame).unwrap()
    }

    async fn connected(
        registry: &Registry,
        project: Option<&str>,
        user: Option<&str>,
    ) -> mpsc::Receiver<Frame> {
        let (outbox, mut rx) = Outbox::channel(512);
        registry.connect(outbox, project, user).await.unwrap();
        // Welcome.
        next(&mut rx).await;
        rx
    }

    #[tokio::test]
    async fn test_delivers_in_enqueue_order() {
        let registry = Arc::new(Registry::new());
        let mut rx = connected(&registry, Some("demo"), Some("alice")).await;

        let dispatcher = Dispatcher::new(registry.clone(), 128);
        dispatcher.start().await.unwrap();

        for i in 0..50 {
            let msg = Message::goal_changed("demo", None, "", &format!("goal-{}", i));
            dispatcher.queue_message(msg).unwrap();
        }

        for i in 0..50 {
            let frame = next(&mut rx).await;
            assert_eq!(frame["type"], "goal_changed");
            assert_eq!(frame["data"]["new_goal"], format!("goal-{}", i));
        }

        dispatcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_routes_by_project_name() {
        let registry = Arc::new(Registry::new());
        let mut project_rx = connected(&registry, Some("demo"), None).await;
        let mut global_rx = connected(&registry, None, None).await;

        let dispatcher = Dispatcher::new(registry.clone(), 16);
        dispatcher.start().await.unwrap();

        dispatcher
            .queue_message(Message::feature_completed("demo", None, "export"))
            .unwrap();
        dispatcher.queue_message(Message::heartbeat(None)).unwrap();

        assert_eq!(next(&mut project_rx).await["type"], "feature_completed");
        assert_eq!(next(&mut global_rx).await["type"], "heartbeat");

        dispatcher.stop().await.unwrap();
        assert!(project_rx.try_recv().is_err());
        assert!(global_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_queue_full_is_rejected() {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(registry, 2);

        dispatcher.queue_message(Message::heartbeat(None)).unwrap();
        dispatcher.queue_message(Message::heartbeat(None)).unwrap();
        let err = dispatcher
            .queue_message(Message::heartbeat(None))
            .unwrap_err();

        assert!(matches!(err, SyncError::QueueFull { capacity: 2 }));
        assert_eq!(dispatcher.pending(), 2);
        assert_eq!(dispatcher.stats().await.rejected, 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dispatcher = Dispatcher::new(Arc::new(Registry::new()), 4);
        dispatcher.start().await.unwrap();
        assert!(matches!(
            dispatcher.start().await,
            Err(SyncError::DispatcherRunning)
        ));
        assert!(dispatcher.is_running().await);
        dispatcher.stop().await.unwrap();
        assert!(!dispatcher.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_discards_backlog_and_restarts() {
        let registry = Arc::new(Registry::new());
        let mut rx = connected(&registry, Some("demo"), None).await;
        let dispatcher = Dispatcher::new(registry.clone(), 8);

        for _ in 0..3 {
            dispatcher
                .queue_message(Message::issue_resolved("demo", None, "stale"))
                .unwrap();
        }
        assert_eq!(dispatcher.stop().await.unwrap(), 3);
        assert_eq!(dispatcher.stats().await.dropped_on_shutdown, 3);

        dispatcher.start().await.unwrap();
        dispatcher
            .queue_message(Message::issue_resolved("demo", None, "fresh"))
            .unwrap();

        let frame = next(&mut rx).await;
        assert_eq!(frame["data"]["issue"], "fresh");
        dispatcher.stop().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_queue_before_start_is_delivered_on_start() {
        let registry = Arc::new(Registry::new());
        let mut rx = connected(&registry, None, None).await;
        let dispatcher = Dispatcher::new(registry.clone(), 8);

        dispatcher.queue_message(Message::heartbeat(None)).unwrap();
        dispatcher.start().await.unwrap();

        assert_eq!(next(&mut rx).await["type"], "heartbeat");
        dispatcher.stop().await.unwrap();

        let stats = dispatcher.stats().await;
        assert_eq!(stats.processed, 1);
        assert!(!stats.running);
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_message() {
        let (tx, rx) = mpsc::channel(8);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let token = CancellationToken::new();

        let worker = tokio::spawn(run_worker(
            rx,
            token.clone(),
            counters.clone(),
            move |message: Message| {
                let seen_tx = seen_tx.clone();
                async move {
                    if message.project_name.as_deref() == Some("poisoned") {
                        panic!("cannot deliver to poisoned");
                    }
                    let _ = seen_tx.send(message.project_name);
                    1
                }
            },
        ));

        tx.send(Message::goal_changed("poisoned", None, "a", "b"))
            .await
            .unwrap();
        tx.send(Message::goal_changed("demo", None, "a", "b"))
            .await
            .unwrap();

        let delivered = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
            .await
            .expect("worker stopped after a panic")
            .unwrap();
        assert_eq!(delivered.as_deref(), Some("demo"));

        token.cancel();
        worker.await.unwrap();
        assert_eq!(counters.failed.load(Ordering::Relaxed), 1);
        assert_eq!(counters.processed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*boxed), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*boxed), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*boxed), "unknown panic payload");
    }
}
