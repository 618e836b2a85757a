//! One-shot message listeners.
//!
//! A listener is a predicate plus a delivery closure. Inbound messages are offered to the
//! listeners in installation order; the first one whose predicate accepts the message is
//! removed and receives it. Everyone else keeps waiting.
//!
//! Listeners are identified by the [`ListenerHandle`] returned at installation, never by
//! closure identity.

use peerlink_common::Message;

/// Identity of an installed listener, used to remove it before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

type Accepts = Box<dyn Fn(&Message) -> bool + Send + Sync>;
type Deliver = Box<dyn FnOnce(Message) + Send>;

struct Listener {
    handle: ListenerHandle,
    accepts: Accepts,
    deliver: Deliver,
}

/// Ordered set of pending one-shot listeners.
#[derive(Default)]
pub struct Listeners {
    next_id: u64,
    entries: Vec<Listener>,
}

/// A listener that matched and was removed; call [`Matched::deliver`] outside any lock.
pub struct Matched {
    deliver: Deliver,
    message: Message,
}

impl Matched {
    pub fn deliver(self) {
        (self.deliver)(self.message)
    }
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        accepts: impl Fn(&Message) -> bool + Send + Sync + 'static,
        deliver: impl FnOnce(Message) + Send + 'static,
    ) -> ListenerHandle {
        self.next_id += 1;
        let handle = ListenerHandle(self.next_id);
        self.entries.push(Listener {
            handle,
            accepts: Box::new(accepts),
            deliver: Box::new(deliver),
        });
        handle
    }

    /// Remove a listener. Returns `false` if it already fired or was removed.
    pub fn remove(&mut self, handle: ListenerHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|l| l.handle != handle);
        self.entries.len() != before
    }

    /// Take the first listener accepting `message`, if any.
    pub fn take_match(&mut self, message: Message) -> Option<Matched> {
        let pos = self.entries.iter().position(|l| (l.accepts)(&message))?;
        let listener = self.entries.remove(pos);
        Some(Matched {
            deliver: listener.deliver,
            message,
        })
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
