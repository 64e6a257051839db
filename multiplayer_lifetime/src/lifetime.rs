// Lifetimes: explicit scopes that own an ordered list of cleanups.
//
// A `Lifetime` is the owning handle of a scope. Ending it (`dispose`) runs
// every registered cleanup exactly once, in registration order, and then marks
// the scope expired. A `LifetimeManager` is the registration-only view of the
// same scope: code that only needs to attach cleanups or check expiry gets a
// manager and cannot end the scope itself.
//
// State machine: `Active` → `Ending(thread)` → `Expired`.
// - Registering while `Active` appends to the list.
// - Registering while `Ending` or `Expired` runs the cleanup immediately on the
//   registering thread; the returned promise is already resolved.
// - `dispose` from inside a cleanup (same thread, `Ending`) is a no-op.
// - `dispose` from another thread while `Ending` blocks until `Expired`, so
//   every caller returns with the scope fully torn down.
//
// Cleanup panics: every cleanup runs inside `catch_unwind`. A panic is logged,
// the remaining cleanups still run, the scope is marked expired, and the first
// panic is resumed on the thread that called `dispose`.
//
// Composition (`child`, `earliest_of`, `when_all`) links scopes by registering
// a cleanup on the source that ends (or counts down) the dependent. When the
// dependent ends first it unregisters that cleanup again, so long-lived
// parents do not accumulate entries for short-lived children.
//
// `forever()` is a process-wide scope that never ends. Registrations on it are
// dropped without running. Subscribing with `forever()` marks a subscription
// as intentionally permanent.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};

use tracing::warn;

use crate::promise::{Deferred, Promise};
use crate::sync::lock;

/// Something that can be torn down by a lifetime.
pub trait Disposable: Send + 'static {
    fn dispose(&self);
}

pub(crate) type Cleanup = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    cleanup: Cleanup,
    done: Deferred<()>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Ending(ThreadId),
    Expired,
}

struct Registry {
    phase: Phase,
    next_id: u64,
    entries: BTreeMap<u64, Entry>,
}

struct LifetimeInner {
    registry: Mutex<Registry>,
    ended: Condvar,
    immortal: bool,
}

static FOREVER: LazyLock<LifetimeManager> = LazyLock::new(|| LifetimeManager {
    inner: Arc::new(LifetimeInner::new(true)),
});

impl LifetimeInner {
    fn new(immortal: bool) -> Self {
        Self {
            registry: Mutex::new(Registry {
                phase: Phase::Active,
                next_id: 0,
                entries: BTreeMap::new(),
            }),
            ended: Condvar::new(),
            immortal,
        }
    }

    fn is_expired(&self) -> bool {
        lock(&self.registry).phase == Phase::Expired
    }

    /// Register a cleanup. Returns the entry id when the cleanup was queued,
    /// `None` when it already ran (scope ending or ended) or was dropped
    /// (immortal scope).
    fn register(&self, cleanup: Cleanup) -> (Option<u64>, Promise<()>) {
        let done = Deferred::new();
        let promise = done.promise();
        if self.immortal {
            return (None, promise);
        }

        let mut registry = lock(&self.registry);
        if registry.phase == Phase::Active {
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.insert(id, Entry { cleanup, done });
            return (Some(id), promise);
        }
        drop(registry);

        cleanup();
        done.resolve(()).ok();
        (None, promise)
    }

    fn unregister(&self, id: u64) {
        let removed = lock(&self.registry).entries.remove(&id);
        // Dropped outside the lock: the entry may own the last handle to
        // another lifetime.
        drop(removed);
    }

    fn dispose(&self) {
        if self.immortal {
            return;
        }
        let me = thread::current().id();

        let entries = {
            let mut registry = lock(&self.registry);
            let phase = registry.phase;
            match phase {
                Phase::Active => {}
                Phase::Expired => return,
                Phase::Ending(owner) if owner == me => return,
                Phase::Ending(_) => {
                    while registry.phase != Phase::Expired {
                        registry = self
                            .ended
                            .wait(registry)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    return;
                }
            }
            registry.phase = Phase::Ending(me);
            std::mem::take(&mut registry.entries)
        };

        let mut first_panic = None;
        for (_, Entry { cleanup, done }) in entries {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(cleanup)) {
                warn!("lifetime cleanup panicked; running the remaining cleanups");
                first_panic.get_or_insert(payload);
            }
            done.resolve(()).ok();
        }

        lock(&self.registry).phase = Phase::Expired;
        self.ended.notify_all();

        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        lock(&self.registry).entries.len()
    }
}

/// Registration-only view of a lifetime.
#[derive(Clone)]
pub struct LifetimeManager {
    inner: Arc<LifetimeInner>,
}

impl LifetimeManager {
    pub fn is_expired(&self) -> bool {
        self.inner.is_expired()
    }

    /// Register `cleanup` to run when the scope ends. The returned promise
    /// resolves once this particular cleanup has run.
    pub fn on_disposed<F>(&self, cleanup: F) -> Promise<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.register(Box::new(cleanup)).1
    }

    /// Register a `Disposable` to be disposed when the scope ends.
    pub fn on_disposed_disposable<D: Disposable>(&self, disposable: D) -> Promise<()> {
        self.on_disposed(move || disposable.dispose())
    }

    /// Like `on_disposed`, but the cleanup can be withdrawn again. `None`
    /// when nothing was queued: the scope already ended (the cleanup ran) or
    /// never ends (the cleanup was dropped).
    pub(crate) fn on_disposed_withdrawable(&self, cleanup: Cleanup) -> Option<Registration> {
        let (id, _) = self.inner.register(cleanup);
        id.map(|id| Registration {
            source: Arc::downgrade(&self.inner),
            id,
        })
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.inner.pending()
    }

    /// A new scope that ends when this one ends, and may end earlier.
    pub fn child(&self) -> Lifetime {
        let child = Lifetime::new();
        let target = child.clone();
        link(self, &child, Box::new(move || target.dispose()));
        child
    }
}

impl fmt::Debug for LifetimeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifetimeManager")
            .field("expired", &self.is_expired())
            .field("forever", &self.inner.immortal)
            .finish()
    }
}

/// A queued cleanup that has not run yet.
pub(crate) struct Registration {
    source: Weak<LifetimeInner>,
    id: u64,
}

impl Registration {
    /// Remove the cleanup without running it. A no-op once it ran.
    pub(crate) fn withdraw(self) {
        if let Some(source) = self.source.upgrade() {
            source.unregister(self.id);
        }
    }
}

/// Owning handle of a scope. Clones share the same scope.
#[derive(Clone, Debug)]
pub struct Lifetime {
    manager: LifetimeManager,
}

impl Lifetime {
    pub fn new() -> Self {
        Self {
            manager: LifetimeManager {
                inner: Arc::new(LifetimeInner::new(false)),
            },
        }
    }

    /// The process-wide scope that never ends.
    pub fn forever() -> LifetimeManager {
        FOREVER.clone()
    }

    /// A scope that ends as soon as any of `lifetimes` ends.
    pub fn earliest_of(lifetimes: &[LifetimeManager]) -> Lifetime {
        let result = Lifetime::new();
        for source in lifetimes {
            let target = result.clone();
            link(source, &result, Box::new(move || target.dispose()));
        }
        result
    }

    /// A scope that ends once every one of `lifetimes` has ended. Ends
    /// immediately for an empty slice.
    pub fn when_all(lifetimes: &[LifetimeManager]) -> Lifetime {
        let result = Lifetime::new();
        if lifetimes.is_empty() {
            result.dispose();
            return result;
        }
        let remaining = Arc::new(AtomicUsize::new(lifetimes.len()));
        for source in lifetimes {
            let remaining = Arc::clone(&remaining);
            let target = result.clone();
            link(
                source,
                &result,
                Box::new(move || {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        target.dispose();
                    }
                }),
            );
        }
        result
    }

    pub fn manager(&self) -> &LifetimeManager {
        &self.manager
    }

    pub fn is_expired(&self) -> bool {
        self.manager.is_expired()
    }

    pub fn on_disposed<F>(&self, cleanup: F) -> Promise<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.manager.on_disposed(cleanup)
    }

    pub fn on_disposed_disposable<D: Disposable>(&self, disposable: D) -> Promise<()> {
        self.manager.on_disposed_disposable(disposable)
    }

    pub fn child(&self) -> Lifetime {
        self.manager.child()
    }

    /// End the scope, running every registered cleanup exactly once.
    pub fn dispose(&self) {
        self.manager.inner.dispose();
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl Disposable for Lifetime {
    fn dispose(&self) {
        Lifetime::dispose(self);
    }
}

/// Run `on_source_end` when `source` ends, unless `dependent` ends first, in
/// which case the registration is withdrawn from `source`.
fn link(source: &LifetimeManager, dependent: &Lifetime, on_source_end: Cleanup) {
    if let Some(registration) = source.on_disposed_withdrawable(on_source_end) {
        dependent.on_disposed(move || registration.withdraw());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Cleanup) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let make = move |label: &'static str| -> Cleanup {
            let log = Arc::clone(&log_clone);
            Box::new(move || log.lock().unwrap().push(label))
        };
        (log, make)
    }

    #[test]
    fn cleanups_run_once_in_registration_order() {
        let (log, make) = recorder();
        let lifetime = Lifetime::new();
        lifetime.on_disposed(make("first"));
        lifetime.on_disposed(make("second"));
        lifetime.on_disposed(make("third"));
        assert!(!lifetime.is_expired());

        lifetime.dispose();
        lifetime.dispose();

        assert!(lifetime.is_expired());
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn registering_on_expired_lifetime_runs_immediately() {
        let (log, make) = recorder();
        let lifetime = Lifetime::new();
        lifetime.dispose();

        let done = lifetime.on_disposed(make("late"));
        assert!(done.is_resolved());
        assert_eq!(*log.lock().unwrap(), vec!["late"]);
    }

    #[test]
    fn cleanup_promise_resolves_after_cleanup_ran() {
        let lifetime = Lifetime::new();
        let done = lifetime.on_disposed(|| {});
        assert!(!done.is_settled());
        lifetime.dispose();
        assert!(done.is_resolved());
    }

    #[test]
    fn disposable_is_disposed_with_scope() {
        let outer = Lifetime::new();
        let inner = Lifetime::new();
        outer.on_disposed_disposable(inner.clone());
        outer.dispose();
        assert!(inner.is_expired());
    }

    #[test]
    fn dispose_from_inside_a_cleanup_is_a_noop() {
        let count = Arc::new(AtomicUsize::new(0));
        let lifetime = Lifetime::new();
        let reentrant = lifetime.clone();
        let count_clone = Arc::clone(&count);
        lifetime.on_disposed(move || {
            reentrant.dispose();
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        let late = lifetime.clone();
        let count_clone = Arc::clone(&count);
        lifetime.on_disposed(move || {
            // Registering during teardown runs right away.
            let counter = Arc::clone(&count_clone);
            late.on_disposed(move || {
                counter.fetch_add(10, Ordering::SeqCst);
            });
        });

        lifetime.dispose();
        assert_eq!(count.load(Ordering::SeqCst), 11);
        assert!(lifetime.is_expired());
    }

    #[test]
    fn concurrent_dispose_runs_each_cleanup_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let lifetime = Lifetime::new();
        for _ in 0..100 {
            let count = Arc::clone(&count);
            lifetime.on_disposed(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lifetime = lifetime.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    lifetime.dispose();
                    // Every caller returns with the scope fully ended.
                    assert!(lifetime.is_expired());
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn panicking_cleanup_does_not_stop_the_rest() {
        let (log, make) = recorder();
        let lifetime = Lifetime::new();
        lifetime.on_disposed(make("before"));
        lifetime.on_disposed(|| panic!("cleanup failure"));
        lifetime.on_disposed(make("after"));

        let result = panic::catch_unwind(AssertUnwindSafe(|| lifetime.dispose()));
        assert!(result.is_err(), "the panic reaches the disposer");
        assert!(lifetime.is_expired());
        assert_eq!(*log.lock().unwrap(), vec!["before", "after"]);
    }

    #[test]
    fn child_ends_with_parent() {
        let parent = Lifetime::new();
        let child = parent.child();
        let grandchild = child.child();
        parent.dispose();
        assert!(child.is_expired());
        assert!(grandchild.is_expired());
    }

    #[test]
    fn child_ending_early_withdraws_from_parent() {
        let parent = Lifetime::new();
        let children: Vec<_> = (0..5).map(|_| parent.child()).collect();
        assert_eq!(parent.manager().inner.pending(), 5);

        for child in &children {
            child.dispose();
        }
        assert_eq!(parent.manager().inner.pending(), 0);
        assert!(!parent.is_expired());
    }

    #[test]
    fn child_of_expired_parent_is_born_expired() {
        let parent = Lifetime::new();
        parent.dispose();
        assert!(parent.child().is_expired());
    }

    #[test]
    fn earliest_of_ends_with_first_input() {
        let a = Lifetime::new();
        let b = Lifetime::new();
        let either = Lifetime::earliest_of(&[a.manager().clone(), b.manager().clone()]);
        assert!(!either.is_expired());

        b.dispose();
        assert!(either.is_expired());
        assert!(!a.is_expired());
        // The link on `a` was withdrawn when `either` ended.
        assert_eq!(a.manager().inner.pending(), 0);
    }

    #[test]
    fn when_all_waits_for_every_input() {
        let inputs: Vec<Lifetime> = (0..3).map(|_| Lifetime::new()).collect();
        let managers: Vec<LifetimeManager> = inputs.iter().map(|l| l.manager().clone()).collect();
        let all = Lifetime::when_all(&managers);

        inputs[0].dispose();
        inputs[2].dispose();
        assert!(!all.is_expired());
        inputs[1].dispose();
        assert!(all.is_expired());
    }

    #[test]
    fn when_all_of_nothing_is_already_over() {
        assert!(Lifetime::when_all(&[]).is_expired());
    }

    #[test]
    fn forever_never_ends() {
        let forever = Lifetime::forever();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        let done = forever.on_disposed(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });

        let child = forever.child();
        assert!(!forever.is_expired());
        assert!(!child.is_expired());
        assert!(!done.is_settled());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(forever.inner.pending(), 0);
    }
}
