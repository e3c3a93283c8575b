//! Notification bus.
//!
//! Objects publish messages keyed by `(sender, message kind)` and any number of
//! callbacks subscribe to such a key. The framework only relies on the three
//! methods of [`NotificationBus`]; [`Dispatcher`] is the implementation used by
//! default.
//!
//! # Delivery
//!
//! ```text
//! send(sender, kind) ──► queue ──► dispatcher thread ──► callback(sender) ...
//! ```
//!
//! In [`Delivery::Threaded`] mode (the default) `send` only enqueues and
//! returns; callbacks run later on the dedicated `dispatcher` thread in the
//! order messages were sent. [`Delivery::Immediate`] runs callbacks inline on
//! the sending thread. Subscribers must not assume either.

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::config::{BusConfig, Delivery};
use crate::messaging::MessageKind;

/// Process-unique identity of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SenderId(u64);

static NEXT_SENDER_ID: AtomicU64 = AtomicU64::new(1);

impl SenderId {
    /// Allocate a fresh identity.
    pub fn next() -> Self {
        Self(NEXT_SENDER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Subscriber callback, invoked with the sender of the matching message.
///
/// Unsubscription compares callbacks by pointer, so keep the `Arc` that was
/// passed to `subscribe`.
pub type Callback = Arc<dyn Fn(SenderId) + Send + Sync>;

/// Keyed publish/subscribe contract.
pub trait NotificationBus: Send + Sync {
    /// Publish `message` from `sender`.
    fn send(&self, sender: SenderId, message: &MessageKind);

    /// Call `callback` whenever `sender` publishes `message`.
    fn subscribe(&self, sender: SenderId, message: MessageKind, callback: Callback);

    /// Remove a callback previously passed to [`NotificationBus::subscribe`].
    fn unsubscribe(&self, sender: SenderId, message: &MessageKind, callback: &Callback);
}

type SubscriberMap = HashMap<(SenderId, MessageKind), Vec<Callback>>;

enum Envelope {
    Message(SenderId, MessageKind),
    Flush(oneshot::Sender<()>),
}

/// Multi-subscriber fan-out registry.
pub struct Dispatcher {
    subscribers: Arc<RwLock<SubscriberMap>>,
    queue: Option<mpsc::UnboundedSender<Envelope>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

static GLOBAL: Lazy<Arc<Dispatcher>> = Lazy::new(|| Arc::new(Dispatcher::threaded()));

impl Dispatcher {
    /// Dispatcher delivering on its own background thread.
    pub fn threaded() -> Self {
        let subscribers: Arc<RwLock<SubscriberMap>> = Arc::default();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let subs = subscribers.clone();

        let worker = std::thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || {
                while let Some(envelope) = rx.blocking_recv() {
                    match envelope {
                        Envelope::Message(sender, kind) => deliver(&subs, sender, &kind),
                        Envelope::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
                debug!("dispatcher queue closed");
            });

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "failed to spawn dispatcher thread, delivering inline");
                None
            }
        };

        Self {
            subscribers,
            queue: worker.as_ref().map(|_| tx),
            worker: Mutex::new(worker),
        }
    }

    /// Dispatcher delivering synchronously inside `send`.
    pub fn immediate() -> Self {
        Self {
            subscribers: Arc::default(),
            queue: None,
            worker: Mutex::new(None),
        }
    }

    pub fn from_config(config: &BusConfig) -> Self {
        match config.delivery {
            Delivery::Threaded => Self::threaded(),
            Delivery::Immediate => Self::immediate(),
        }
    }

    /// The process-wide dispatcher used by parameters and devices unless
    /// another bus is supplied.
    pub fn global() -> Arc<Dispatcher> {
        GLOBAL.clone()
    }

    /// Block until every message sent before this call has been delivered.
    pub fn flush(&self) {
        let Some(queue) = &self.queue else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if queue.send(Envelope::Flush(done_tx)).is_ok() {
            let _ = done_rx.blocking_recv();
        }
    }

    /// Number of callbacks subscribed to `(sender, message)`.
    pub fn subscriber_count(&self, sender: SenderId, message: &MessageKind) -> usize {
        self.subscribers
            .read()
            .get(&(sender, message.clone()))
            .map_or(0, Vec::len)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::threaded()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Closing the queue ends the worker loop.
        self.queue.take();
        if let Some(handle) = self.worker.get_mut().take() {
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("threaded", &self.queue.is_some())
            .field("keys", &self.subscribers.read().len())
            .finish()
    }
}

fn deliver(subscribers: &RwLock<SubscriberMap>, sender: SenderId, kind: &MessageKind) {
    // Clone out so callbacks may (un)subscribe without deadlocking.
    let callbacks = subscribers
        .read()
        .get(&(sender, kind.clone()))
        .cloned()
        .unwrap_or_default();

    for callback in callbacks {
        if std::panic::catch_unwind(AssertUnwindSafe(|| callback(sender))).is_err() {
            error!(%sender, message = %kind, "subscriber callback panicked");
        }
    }
}

impl NotificationBus for Dispatcher {
    fn send(&self, sender: SenderId, message: &MessageKind) {
        match &self.queue {
            Some(queue) => {
                if queue
                    .send(Envelope::Message(sender, message.clone()))
                    .is_err()
                {
                    error!(%sender, %message, "dispatcher queue closed, message dropped");
                }
            }
            None => deliver(&self.subscribers, sender, message),
        }
    }

    fn subscribe(&self, sender: SenderId, message: MessageKind, callback: Callback) {
        self.subscribers
            .write()
            .entry((sender, message))
            .or_default()
            .push(callback);
    }

    fn unsubscribe(&self, sender: SenderId, message: &MessageKind, callback: &Callback) {
        let mut subscribers = self.subscribers.write();
        let key = (sender, message.clone());
        if let Some(callbacks) = subscribers.get_mut(&key) {
            callbacks.retain(|cb| !Arc::ptr_eq(cb, callback));
            if callbacks.is_empty() {
                subscribers.remove(&key);
            }
        }
    }
}

/// The process-wide bus as a trait object.
pub fn default_bus() -> Arc<dyn NotificationBus> {
    Dispatcher::global()
}

// =============================================================================
// RecordingBus - test double
// =============================================================================

/// Bus that records every message and delivers inline.
///
/// Meant for tests that count notifications.
#[derive(Debug)]
pub struct RecordingBus {
    sent: Mutex<Vec<(SenderId, MessageKind)>>,
    inner: Dispatcher,
}

impl RecordingBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            inner: Dispatcher::immediate(),
        })
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<(SenderId, MessageKind)> {
        self.sent.lock().clone()
    }

    /// How many times `sender` published `message`.
    pub fn count(&self, sender: SenderId, message: &MessageKind) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|(s, m)| *s == sender && m == message)
            .count()
    }
}

impl NotificationBus for RecordingBus {
    fn send(&self, sender: SenderId, message: &MessageKind) {
        self.sent.lock().push((sender, message.clone()));
        self.inner.send(sender, message);
    }

    fn subscribe(&self, sender: SenderId, message: MessageKind, callback: Callback) {
        self.inner.subscribe(sender, message, callback);
    }

    fn unsubscribe(&self, sender: SenderId, message: &MessageKind, callback: &Callback) {
        self.inner.unsubscribe(sender, message, callback);
    }
}
