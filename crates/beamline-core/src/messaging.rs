//! Message-capable objects.
//!
//! Any type can broadcast state changes by implementing [`MessageSource`]. A
//! type declares the message kinds it emits in a static table
//! ([`MessageSource::MESSAGES`]); each instance carries a [`MessageTable`]
//! seeded from that table, to which further kinds can be registered at run
//! time. Registration is bookkeeping for subscribers. Sending or subscribing
//! to an unregistered kind is allowed.
//!
//! ```rust
//! use beamline_core::bus::{Dispatcher, NotificationBus, SenderId};
//! use beamline_core::messaging::{MessageKind, MessageSource, MessageTable};
//! use std::sync::Arc;
//!
//! struct Shutter {
//!     id: SenderId,
//!     bus: Arc<dyn NotificationBus>,
//!     messages: MessageTable,
//! }
//!
//! impl MessageSource for Shutter {
//!     const MESSAGES: &'static [MessageKind] = &[MessageKind::from_static("opened")];
//!
//!     fn sender_id(&self) -> SenderId { self.id }
//!     fn bus(&self) -> &Arc<dyn NotificationBus> { &self.bus }
//!     fn message_table(&self) -> &MessageTable { &self.messages }
//! }
//!
//! let shutter = Shutter {
//!     id: SenderId::next(),
//!     bus: Arc::new(Dispatcher::immediate()),
//!     messages: MessageTable::for_type::<Shutter>(),
//! };
//! shutter.register_message(MessageKind::new("closed"));
//! assert_eq!(shutter.message_kinds().len(), 2);
//! ```

use parking_lot::RwLock;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::bus::{Callback, NotificationBus, SenderId};

/// Identifier of a message kind, e.g. `"changed"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKind(Cow<'static, str>);

impl MessageKind {
    /// Message kind usable in constants and static tables.
    pub const fn from_static(kind: &'static str) -> Self {
        Self(Cow::Borrowed(kind))
    }

    pub fn new(kind: impl Into<String>) -> Self {
        Self(Cow::Owned(kind.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for MessageKind {
    fn from(kind: &'static str) -> Self {
        Self::from_static(kind)
    }
}

/// Published by a parameter after every successful write.
pub const CHANGED: MessageKind = MessageKind::from_static("changed");

/// Instance-level set of registered message kinds.
#[derive(Debug, Default)]
pub struct MessageTable {
    kinds: RwLock<BTreeSet<MessageKind>>,
}

impl MessageTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table seeded with the static kinds declared by `T`.
    pub fn for_type<T: MessageSource>() -> Self {
        Self {
            kinds: RwLock::new(T::MESSAGES.iter().cloned().collect()),
        }
    }

    /// Add `kind`; returns false if it was already registered.
    pub fn register(&self, kind: MessageKind) -> bool {
        self.kinds.write().insert(kind)
    }

    pub fn contains(&self, kind: &MessageKind) -> bool {
        self.kinds.read().contains(kind)
    }

    pub fn kinds(&self) -> BTreeSet<MessageKind> {
        self.kinds.read().clone()
    }
}

/// Capability to register, send and listen for messages.
pub trait MessageSource {
    /// Message kinds every instance of the type emits.
    const MESSAGES: &'static [MessageKind] = &[];

    /// Identity used as the sender of every message from this object.
    fn sender_id(&self) -> SenderId;

    /// Bus this object publishes on.
    fn bus(&self) -> &Arc<dyn NotificationBus>;

    /// Registered message kinds of this instance.
    fn message_table(&self) -> &MessageTable;

    /// Register a message kind subscribers can wait on. Idempotent.
    fn register_message(&self, kind: MessageKind) {
        self.message_table().register(kind);
    }

    /// All registered message kinds (empty if none were ever registered).
    fn message_kinds(&self) -> BTreeSet<MessageKind> {
        self.message_table().kinds()
    }

    /// Send `message` with this object as sender.
    fn send(&self, message: &MessageKind) {
        self.bus().send(self.sender_id(), message);
    }

    /// Subscribe to `message` from this object. `callback` receives this
    /// object's [`SenderId`].
    fn subscribe(&self, message: MessageKind, callback: Callback) {
        self.bus().subscribe(self.sender_id(), message, callback);
    }

    /// Remove `callback` from `message` of this object.
    fn unsubscribe(&self, message: &MessageKind, callback: &Callback) {
        self.bus().unsubscribe(self.sender_id(), message, callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Dispatcher, RecordingBus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Pump {
        id: SenderId,
        bus: Arc<dyn NotificationBus>,
        messages: MessageTable,
    }

    impl MessageSource for Pump {
        const MESSAGES: &'static [MessageKind] = &[MessageKind::from_static("started")];

        fn sender_id(&self) -> SenderId {
            self.id
        }

        fn bus(&self) -> &Arc<dyn NotificationBus> {
            &self.bus
        }

        fn message_table(&self) -> &MessageTable {
            &self.messages
        }
    }

    struct Silent {
        id: SenderId,
        bus: Arc<dyn NotificationBus>,
        messages: MessageTable,
    }

    impl MessageSource for Silent {
        fn sender_id(&self) -> SenderId {
            self.id
        }

        fn bus(&self) -> &Arc<dyn NotificationBus> {
            &self.bus
        }

        fn message_table(&self) -> &MessageTable {
            &self.messages
        }
    }

    fn pump(bus: Arc<dyn NotificationBus>) -> Pump {
        Pump {
            id: SenderId::next(),
            bus,
            messages: MessageTable::for_type::<Pump>(),
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let p = pump(Arc::new(Dispatcher::immediate()));
        p.register_message(MessageKind::new("stopped"));
        p.register_message(MessageKind::new("stopped"));

        let kinds = p.message_kinds();
        assert_eq!(kinds.len(), 2);
        assert!(kinds.contains(&MessageKind::from_static("started")));
    }

    #[test]
    fn test_no_messages_is_empty() {
        let silent = Silent {
            id: SenderId::next(),
            bus: Arc::new(Dispatcher::immediate()),
            messages: MessageTable::for_type::<Silent>(),
        };
        assert!(silent.message_kinds().is_empty());
    }

    #[test]
    fn test_instances_do_not_leak_registrations() {
        let bus: Arc<dyn NotificationBus> = Arc::new(Dispatcher::immediate());
        let a = pump(bus.clone());
        let b = pump(bus);
        a.register_message(MessageKind::new("overheated"));

        assert!(!b.message_table().contains(&MessageKind::new("overheated")));
    }

    #[test]
    fn test_send_unregistered_kind_is_allowed() {
        let bus = RecordingBus::new();
        let p = pump(bus.clone());
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        let kind = MessageKind::new("not-registered");
        p.subscribe(
            kind.clone(),
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        p.send(&kind);

        assert_eq!(bus.count(p.sender_id(), &kind), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_through_source() {
        let bus = RecordingBus::new();
        let p = pump(bus);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let cb: Callback = Arc::new(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        let started = MessageKind::from_static("started");
        p.subscribe(started.clone(), cb.clone());
        p.unsubscribe(&started, &cb);
        p.send(&started);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
