//! Observer lists for uploader lifecycle events.
//!
//! Listeners are kept per event kind in registration order, plus a list of
//! catch-all listeners that see every event. Events are queued and delivered
//! by a single dispatcher at a time, so a listener that emits (or calls back
//! into an uploader that emits) never re-enters itself: its events are
//! delivered after the one currently being dispatched.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::lock_or_recover;

/// An event that can be routed by kind.
pub trait Event: Send + 'static {
    type Kind: Copy + Eq + Hash + Debug + Send + 'static;

    fn kind(&self) -> Self::Kind;
}

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration<E> {
    id: ListenerId,
    active: Arc<AtomicBool>,
    callback: Listener<E>,
}

impl<E> Clone for Registration<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            active: Arc::clone(&self.active),
            callback: Arc::clone(&self.callback),
        }
    }
}

pub struct EventEmitter<E: Event> {
    next_id: AtomicU64,
    by_kind: Mutex<HashMap<E::Kind, Vec<Registration<E>>>>,
    any: Mutex<Vec<Registration<E>>>,
    outbox: Mutex<VecDeque<E>>,
    dispatching: AtomicBool,
}

impl<E: Event> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> EventEmitter<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            by_kind: Mutex::new(HashMap::new()),
            any: Mutex::new(Vec::new()),
            outbox: Mutex::new(VecDeque::new()),
            dispatching: AtomicBool::new(false),
        }
    }

    /// Register a listener for one event kind.
    pub fn on<F>(&self, kind: E::Kind, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let registration = self.registration(Arc::new(callback));
        let id = registration.id;
        lock_or_recover(&self.by_kind, "listener registration")
            .entry(kind)
            .or_default()
            .push(registration);
        id
    }

    /// Register a listener for every event.
    pub fn on_any<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let registration = self.registration(Arc::new(callback));
        let id = registration.id;
        lock_or_recover(&self.any, "listener registration").push(registration);
        id
    }

    /// Detach a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let removed = {
            let mut by_kind = lock_or_recover(&self.by_kind, "listener removal");
            let found = by_kind
                .values_mut()
                .find_map(|list| take_registration(list, id));
            found
        }
        .or_else(|| take_registration(&mut lock_or_recover(&self.any, "listener removal"), id));

        match removed {
            Some(registration) => {
                registration.active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        lock_or_recover(&self.by_kind, "listener count")
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Queue and deliver an event.
    pub fn emit(&self, event: E) {
        self.enqueue(event);
        self.dispatch();
    }

    /// Queue an event without delivering it. Pair with [`EventEmitter::dispatch`].
    pub fn enqueue(&self, event: E) {
        lock_or_recover(&self.outbox, "event enqueue").push_back(event);
    }

    /// Deliver queued events unless another dispatcher is already draining them.
    pub fn dispatch(&self) {
        loop {
            if self
                .dispatching
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            {
                let _guard = DispatchGuard(&self.dispatching);
                loop {
                    let next = lock_or_recover(&self.outbox, "event dispatch").pop_front();
                    match next {
                        Some(event) => self.deliver(&event),
                        None => break,
                    }
                }
            }

            // Another thread may have queued between the last pop and the reset
            if lock_or_recover(&self.outbox, "event dispatch").is_empty() {
                return;
            }
        }
    }

    fn deliver(&self, event: &E) {
        let mut snapshot: Vec<Registration<E>> = lock_or_recover(&self.by_kind, "event delivery")
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        snapshot.extend(lock_or_recover(&self.any, "event delivery").iter().cloned());

        for registration in snapshot {
            if registration.active.load(Ordering::Acquire) {
                (registration.callback)(event);
            }
        }
    }

    fn registration(&self, callback: Listener<E>) -> Registration<E> {
        Registration {
            id: ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            active: Arc::new(AtomicBool::new(true)),
            callback,
        }
    }
}

fn take_registration<E>(list: &mut Vec<Registration<E>>, id: ListenerId) -> Option<Registration<E>> {
    let position = list.iter().position(|r| r.id == id)?;
    Some(list.remove(position))
}

struct DispatchGuard<'a>(&'a AtomicBool);

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
