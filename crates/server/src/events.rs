//! Publish-subscribe hub for upload lifecycle events.

use depot_core::event::{EventKind, UploadEvent};
use depot_core::info::UploadInfo;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc, watch};

/// How many events can be unread by a subscriber before delivery starts
/// to block.
pub const SUBSCRIBER_BUFFER: usize = 16;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<UploadEvent>,
}

/// A handle to a subscriber's event channel.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<UploadEvent>,
}

impl Subscription {
    /// Identifier to pass to [`EventBus::unsubscribe`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event; `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<UploadEvent> {
        self.rx.recv().await
    }
}

/// Fan-out of create/progress/finish/terminate events.
///
/// Publishing feeds a single internal reader loop, which forwards every
/// event to each subscriber in turn with an awaited send. A slow
/// subscriber therefore backpressures the publisher once its buffer
/// fills, bounding memory, without stalling unrelated uploads beyond the
/// inlet buffer.
pub struct EventBus {
    inlet: mpsc::Sender<UploadEvent>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    // Unsubscribed senders are parked here so their channels only close
    // at shutdown.
    retired: RwLock<Vec<mpsc::Sender<UploadEvent>>>,
    next_id: AtomicU64,
    quit: watch::Sender<bool>,
}

impl EventBus {
    /// Create the bus and spawn its reader loop.
    pub fn new() -> Arc<Self> {
        let (inlet, mut inlet_rx) = mpsc::channel::<UploadEvent>(SUBSCRIBER_BUFFER);
        let (quit, mut quit_rx) = watch::channel(false);
        let subscribers: Arc<RwLock<Vec<Subscriber>>> = Arc::new(RwLock::new(Vec::new()));

        let reader_subs = subscribers.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = inlet_rx.recv() => match event {
                        Some(event) => {
                            let subs = reader_subs.read().await;
                            for sub in subs.iter() {
                                if sub.tx.send(event.clone()).await.is_err() {
                                    tracing::debug!(
                                        subscriber = sub.id,
                                        "dropping event for closed subscriber"
                                    );
                                }
                            }
                        }
                        None => break,
                    },
                    _ = quit_rx.changed() => break,
                }
            }
        });

        Arc::new(Self {
            inlet,
            subscribers,
            retired: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            quit,
        })
    }

    /// Register a new subscriber with a bounded event channel.
    pub async fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().await.push(Subscriber { id, tx });
        Subscription { id, rx }
    }

    /// Remove a subscriber from delivery without closing its channel.
    pub async fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscribers.write().await;
        if let Some(pos) = subs.iter().position(|s| s.id == id) {
            let sub = subs.remove(pos);
            self.retired.write().await.push(sub.tx);
        }
    }

    /// Publish an event to every current subscriber.
    pub async fn publish(&self, kind: EventKind, info: UploadInfo) {
        let _ = self.inlet.send(UploadEvent { kind, info }).await;
    }

    /// Close all subscriber channels and stop the reader loop.
    pub async fn close(&self) {
        let _ = self.quit.send(true);
        self.subscribers.write().await.clear();
        self.retired.write().await.clear();
    }
}

/// Subscribe to the bus and log every event. Mirrors what external
/// consumers (e.g. chat announcers) would do with a subscription.
pub fn spawn_event_logger(bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscription = bus.subscribe().await;
        while let Some(event) = subscription.recv().await {
            tracing::info!(
                event = event.kind.as_str(),
                id = %event.info.id,
                offset = event.info.offset,
                size = event.info.size,
                "upload event"
            );
        }
    })
}
