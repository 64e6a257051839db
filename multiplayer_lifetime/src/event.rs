// Typed publish/subscribe bound to lifetimes.
//
// `Event<T>` is a list of handlers, each owned by a lifetime. Ending the
// owning lifetime unsubscribes the handler. `fire` calls every live handler
// synchronously on the calling thread, in subscription order.
//
// Firing works on a snapshot of the list taken under the lock, then releases
// the lock before calling anything, so handlers may subscribe, unsubscribe or
// fire again. Each subscription carries a `live` flag that is cleared when its
// lifetime ends; the snapshot loop checks the flag right before each call, so
// a handler whose lifetime was ended by an earlier handler in the same round
// is skipped. Handlers added during a round are not part of that round.
//
// A once-subscription that fires withdraws its cleanup from the owning
// lifetime, so a long-lived scope does not collect entries for handlers that
// are already gone.
//
// `Event` is a cheap handle: clones share the same subscriber list.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::lifetime::{LifetimeManager, Registration};
use crate::promise::{Deferred, Promise};
use crate::sync::lock;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;
type Snapshot<T> = Vec<(Arc<AtomicBool>, bool, Handler<T>)>;

struct Subscriber<T> {
    id: u64,
    live: Arc<AtomicBool>,
    once: bool,
    handler: Handler<T>,
    registration: Option<Registration>,
}

struct EventInner<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
    next_id: AtomicU64,
}

impl<T> EventInner<T> {
    fn remove(&self, id: u64) {
        let removed: Option<Subscriber<T>> = {
            let mut subscribers = lock(&self.subscribers);
            let position = subscribers.iter().position(|s| s.id == id);
            position.map(|index| subscribers.remove(index))
        };
        // Handlers may own other handles; drop them outside the lock.
        drop(removed);
    }
}

/// A typed notification with lifetime-scoped subscriptions.
pub struct Event<T> {
    inner: Arc<EventInner<T>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Event<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Call `handler` on every fire until `lifetime` ends. Subscribing with an
    /// already-ended lifetime does nothing.
    pub fn subscribe<F>(&self, handler: F, lifetime: &LifetimeManager)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.add(Arc::new(handler), false, Some(lifetime));
    }

    /// Call `handler` on the next fire only.
    pub fn subscribe_once<F>(&self, handler: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.add(once_handler(handler), true, None);
    }

    /// Call `handler` on the next fire, unless `lifetime` ends first.
    pub fn subscribe_once_for<F>(&self, handler: F, lifetime: &LifetimeManager)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.add(once_handler(handler), true, Some(lifetime));
    }

    /// A promise for the next fired value.
    pub fn next(&self) -> Promise<T>
    where
        T: Clone + Send,
    {
        let deferred = Deferred::new();
        let promise = deferred.promise();
        self.subscribe_once(move |value: &T| {
            deferred.resolve(value.clone()).ok();
        });
        promise
    }

    /// Notify every live subscriber. A no-op without subscribers.
    pub fn fire(&self, value: &T) {
        let (snapshot, spent): (Snapshot<T>, Vec<Subscriber<T>>) = {
            let mut subscribers = lock(&self.inner.subscribers);
            let snapshot = subscribers
                .iter()
                .map(|s| (Arc::clone(&s.live), s.once, Arc::clone(&s.handler)))
                .collect();
            let (spent, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *subscribers)
                .into_iter()
                .partition(|s| s.once);
            *subscribers = kept;
            (snapshot, spent)
        };
        for subscriber in spent {
            if let Some(registration) = subscriber.registration {
                registration.withdraw();
            }
        }

        for (live, once, handler) in snapshot {
            let should_call = if once {
                live.swap(false, Ordering::AcqRel)
            } else {
                live.load(Ordering::Acquire)
            };
            if should_call {
                handler(value);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    fn add(&self, handler: Handler<T>, once: bool, lifetime: Option<&LifetimeManager>) {
        if lifetime.is_some_and(LifetimeManager::is_expired) {
            return;
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let live = Arc::new(AtomicBool::new(true));
        lock(&self.inner.subscribers).push(Subscriber {
            id,
            live: Arc::clone(&live),
            once,
            handler,
            registration: None,
        });

        let Some(lifetime) = lifetime else {
            return;
        };
        let event: Weak<EventInner<T>> = Arc::downgrade(&self.inner);
        let registration = lifetime.on_disposed_withdrawable(Box::new(move || {
            live.store(false, Ordering::Release);
            if let Some(event) = event.upgrade() {
                event.remove(id);
            }
        }));
        let Some(registration) = registration else {
            return;
        };
        let mut subscribers = lock(&self.inner.subscribers);
        match subscribers.iter_mut().find(|s| s.id == id) {
            Some(subscriber) => subscriber.registration = Some(registration),
            None => {
                // Already fired (once) or removed in the meantime.
                drop(subscribers);
                registration.withdraw();
            }
        }
    }
}

impl<T: 'static> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn once_handler<T, F>(handler: F) -> Handler<T>
where
    T: 'static,
    F: FnOnce(&T) + Send + 'static,
{
    let slot = Mutex::new(Some(handler));
    Arc::new(move |value: &T| {
        let handler = lock(&slot).take();
        if let Some(handler) = handler {
            handler(value);
        }
    })
}
