//! Lifecycle events, observers, and lifecycle-bound dispatch.
//!
//! A [`Lifecycle`] is a subscribable state machine emitting ordered
//! component-existence events (create through destroy). Platform
//! adapters forward their component's transitions into
//! [`Lifecycle::emit`]; library code subscribes with
//! [`Lifecycle::add_observer`].
//!
//! Observer bookkeeping lives in a concurrent map: observers may be
//! added from background threads while the main thread is delivering
//! events, with no external locking.
//!
//! [`BoundDispatch`] wraps a queued action so that the owning
//! lifecycle's terminal event removes it from its queue before it can
//! fire. The binding settles exactly once, through whichever of three
//! contenders claims it first: the action firing, the terminal event,
//! or an explicit [`BoundHandle::cancel`]. The losing contenders become
//! no-ops, so repeated lifecycle transitions can neither double-remove
//! nor leak the subscription.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::dispatch::{DispatchHandle, DispatchToken};
use crate::error::SchedulerError;

/// Component-existence events, in their natural order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LifecycleEvent {
    Create,
    Start,
    Resume,
    Pause,
    Stop,
    Destroy,
}

/// Identity of a registered observer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObserverId(u64);

/// Observer callback invoked for every emitted event.
pub type LifecycleObserver = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;

/// A subscribable lifecycle, affiliated with a main dispatch queue.
///
/// The affiliation is a convention, not an enforcement: events are
/// delivered synchronously on whichever thread calls [`emit`]
/// (platform adapters call it from the main thread). The observer map
/// itself is safe for concurrent mutation from any thread.
pub struct Lifecycle {
    observers: DashMap<u64, LifecycleObserver>,
    /// Times each event has been emitted; lets a deferred subscription
    /// detect a terminal event it was not yet registered to see.
    emissions: DashMap<LifecycleEvent, u64>,
    next_id: AtomicU64,
    destroyed: AtomicBool,
    main: DispatchHandle,
}

impl Lifecycle {
    /// Creates a lifecycle affiliated with the given main queue.
    pub fn new(main: DispatchHandle) -> Self {
        Self {
            observers: DashMap::new(),
            emissions: DashMap::new(),
            next_id: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
            main,
        }
    }

    /// Registers an observer; safe from any thread.
    pub fn add_observer(&self, observer: LifecycleObserver) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.insert(id, observer);
        trace!(observer = id, "lifecycle observer added");
        ObserverId(id)
    }

    /// Removes an observer; safe from any thread, idempotent.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let removed = self.observers.remove(&id.0).is_some();
        if removed {
            trace!(observer = id.0, "lifecycle observer removed");
        }
        removed
    }

    /// Number of currently registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// True once [`LifecycleEvent::Destroy`] has been emitted.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// The main queue this lifecycle is affiliated with.
    pub fn main_handle(&self) -> &DispatchHandle {
        &self.main
    }

    /// Times `event` has been emitted so far.
    fn emit_count(&self, event: LifecycleEvent) -> u64 {
        self.emissions.get(&event).map(|c| *c.value()).unwrap_or(0)
    }

    /// Delivers an event to every registered observer, synchronously on
    /// the calling thread.
    ///
    /// Observers may remove themselves (or others) during delivery;
    /// delivery iterates a snapshot taken before the first callback.
    pub fn emit(&self, event: LifecycleEvent) {
        if event == LifecycleEvent::Destroy {
            self.destroyed.store(true, Ordering::Release);
        }
        *self.emissions.entry(event).or_insert(0) += 1;
        // Snapshot first: callbacks routinely unsubscribe, and invoking
        // them while holding map shards would deadlock.
        let snapshot: Vec<LifecycleObserver> = self
            .observers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        debug!(?event, observers = snapshot.len(), "lifecycle event");
        for observer in snapshot {
            observer(event);
        }
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("observers", &self.observer_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

struct BoundShared {
    /// Settlement flag; the CAS winner is the only path that runs.
    fired: AtomicBool,
    token: OnceLock<DispatchToken>,
    observer: OnceLock<ObserverId>,
    /// Weak so a pending binding never keeps the lifecycle alive.
    lifecycle: Weak<Lifecycle>,
    queue: DispatchHandle,
}

impl BoundShared {
    fn claim(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn settled(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn remove_queued(&self) {
        if let Some(token) = self.token.get() {
            self.queue.remove(*token);
        }
    }

    fn unsubscribe(&self) {
        if let (Some(id), Some(lifecycle)) = (self.observer.get(), self.lifecycle.upgrade()) {
            lifecycle.remove_observer(*id);
        }
    }
}

/// Lifecycle-bound dispatch: posts an action whose pending entry is
/// removed if the bound terminal event arrives first.
pub struct BoundDispatch;

impl BoundDispatch {
    /// Posts `action` to `queue` after `delay`, bound to `lifecycle`:
    /// when `terminal` is emitted before the action fires, the pending
    /// entry is removed and the action never runs.
    ///
    /// Subscribing happens on the lifecycle's affiliated thread;
    /// cross-thread requests are forwarded through its main queue. The
    /// forwarded subscription is posted *before* the action, so on the
    /// main queue the observer is always live by the time the action
    /// could fire. A terminal event emitted while the subscription is
    /// still in flight is detected when it lands, settling the binding
    /// and removing the pending entry as if the observer had seen it.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::LifecycleDestroyed`] when the lifecycle has
    /// already been destroyed — a configuration error, reported at the
    /// call site rather than deferred.
    pub fn bind(
        queue: &DispatchHandle,
        lifecycle: &Arc<Lifecycle>,
        terminal: LifecycleEvent,
        delay: std::time::Duration,
        action: impl FnOnce() + Send + 'static,
    ) -> Result<BoundHandle, SchedulerError> {
        if lifecycle.is_destroyed() {
            return Err(SchedulerError::LifecycleDestroyed);
        }
        let shared = Arc::new(BoundShared {
            fired: AtomicBool::new(false),
            token: OnceLock::new(),
            observer: OnceLock::new(),
            lifecycle: Arc::downgrade(lifecycle),
            queue: queue.clone(),
        });

        let observer: LifecycleObserver = {
            let shared = Arc::clone(&shared);
            Arc::new(move |event| {
                if event == terminal && shared.claim() {
                    trace!(?event, "terminal event removed bound dispatch");
                    shared.remove_queued();
                    shared.unsubscribe();
                }
            })
        };

        // A terminal event delivered while the subscription is still in
        // flight has no observer to act on; the emission count lets the
        // deferred subscribe detect that it already happened.
        let baseline = lifecycle.emit_count(terminal);
        let subscribe = {
            let shared = Arc::clone(&shared);
            let lifecycle = Arc::clone(lifecycle);
            move || {
                if lifecycle.emit_count(terminal) != baseline && shared.claim() {
                    trace!(?terminal, "terminal event preceded deferred subscription");
                    shared.remove_queued();
                }
                if shared.settled() {
                    return;
                }
                let id = lifecycle.add_observer(observer);
                let _ = shared.observer.set(id);
                // Settlement (or the terminal event itself) may have
                // raced the registration; the winner could not see the
                // observer yet, so clean up here.
                if lifecycle.emit_count(terminal) != baseline && shared.claim() {
                    shared.remove_queued();
                }
                if shared.settled() {
                    lifecycle.remove_observer(id);
                }
            }
        };
        if lifecycle.main_handle().is_current_thread() {
            subscribe();
        } else {
            lifecycle.main_handle().post(subscribe);
        }

        let wrapper = {
            let shared = Arc::clone(&shared);
            move || {
                if shared.claim() {
                    action();
                    shared.unsubscribe();
                }
            }
        };
        let token = queue.post_delayed(wrapper, delay);
        let _ = shared.token.set(token);

        Ok(BoundHandle { shared })
    }
}

/// Handle to a pending lifecycle-bound dispatch.
pub struct BoundHandle {
    shared: Arc<BoundShared>,
}

impl BoundHandle {
    /// Cancels the pending dispatch early.
    ///
    /// Returns true if this call settled the binding; false if the
    /// action already ran, the terminal event already removed it, or it
    /// was already cancelled.
    pub fn cancel(&self) -> bool {
        if self.shared.claim() {
            self.shared.remove_queued();
            self.shared.unsubscribe();
            true
        } else {
            false
        }
    }

    /// True once the binding has settled through any path.
    pub fn is_settled(&self) -> bool {
        self.shared.settled()
    }
}

impl std::fmt::Debug for BoundHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundHandle")
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_observers_receive_events() {
        let dispatcher = Dispatcher::start("test-lc-main");
        let lifecycle = Lifecycle::new(dispatcher.handle());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let id = lifecycle.add_observer(Arc::new(move |event| {
            seen_clone.lock().push(event);
        }));
        lifecycle.emit(LifecycleEvent::Create);
        lifecycle.emit(LifecycleEvent::Start);
        assert_eq!(
            *seen.lock(),
            vec![LifecycleEvent::Create, LifecycleEvent::Start]
        );
        assert!(lifecycle.remove_observer(id));
        assert!(!lifecycle.remove_observer(id));
        lifecycle.emit(LifecycleEvent::Resume);
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_destroy_marks_lifecycle_destroyed() {
        let dispatcher = Dispatcher::start("test-lc-destroy");
        let lifecycle = Lifecycle::new(dispatcher.handle());
        assert!(!lifecycle.is_destroyed());
        lifecycle.emit(LifecycleEvent::Destroy);
        assert!(lifecycle.is_destroyed());
    }

    #[test]
    fn test_observer_can_unsubscribe_during_delivery() {
        let dispatcher = Dispatcher::start("test-lc-selfremove");
        let lifecycle = Arc::new(Lifecycle::new(dispatcher.handle()));
        let count = Arc::new(AtomicUsize::new(0));
        let id_slot: Arc<OnceLock<ObserverId>> = Arc::new(OnceLock::new());
        let observer = {
            let lifecycle = Arc::downgrade(&lifecycle);
            let count = Arc::clone(&count);
            let id_slot = Arc::clone(&id_slot);
            Arc::new(move |_event| {
                count.fetch_add(1, Ordering::SeqCst);
                if let (Some(lc), Some(id)) = (lifecycle.upgrade(), id_slot.get()) {
                    lc.remove_observer(*id);
                }
            }) as LifecycleObserver
        };
        let id = lifecycle.add_observer(observer);
        let _ = id_slot.set(id);
        lifecycle.emit(LifecycleEvent::Start);
        lifecycle.emit(LifecycleEvent::Resume);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.observer_count(), 0);
    }

    #[test]
    fn test_bind_to_destroyed_lifecycle_fails_fast() {
        let dispatcher = Dispatcher::start("test-lc-deadbind");
        let lifecycle = Arc::new(Lifecycle::new(dispatcher.handle()));
        lifecycle.emit(LifecycleEvent::Destroy);
        let result = BoundDispatch::bind(
            &dispatcher.handle(),
            &lifecycle,
            LifecycleEvent::Destroy,
            Duration::ZERO,
            || {},
        );
        assert!(matches!(result, Err(SchedulerError::LifecycleDestroyed)));
    }

    #[test]
    fn test_explicit_cancel_settles_once() {
        let dispatcher = Dispatcher::start("test-lc-cancel");
        let lifecycle = Arc::new(Lifecycle::new(dispatcher.handle()));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let handle = BoundDispatch::bind(
            &dispatcher.handle(),
            &lifecycle,
            LifecycleEvent::Destroy,
            Duration::from_millis(100),
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // The subscription was torn down by the cancel (possibly after
        // the deferred subscribe ran).
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while lifecycle.observer_count() != 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(lifecycle.observer_count(), 0);
    }
}
