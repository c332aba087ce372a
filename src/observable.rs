//! Consume-once observable values.
//!
//! [`EventValue`] holds an optional value and notifies subscribers when
//! it is set — with *event* semantics rather than *state* semantics: an
//! observer registered after a `set` does not receive that earlier
//! value. Each `set` is delivered at most once per observer, so a value
//! behaves like a consumable event (a navigation request, a one-shot
//! error toast) instead of sticky state that re-fires on every
//! re-subscription.
//!
//! The mechanism is an armed flag per subscription: `set` arms every
//! observer registered at that moment, then delivers by flipping the
//! flag back with a CAS. Late joiners were never armed, so they never
//! peek. [`EventValue::observe_sticky`] opts back into state semantics
//! for the callers that want the current value replayed on
//! registration.
//!
//! Subscription bookkeeping lives in concurrent maps keyed by an id and
//! by callback identity, so registration and removal are safe from any
//! thread without external locking. Delivery runs on the thread that
//! calls [`set`](EventValue::set) (intended: the main thread);
//! [`post`](EventValue::post) forwards a set to the main queue from
//! anywhere.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::dispatch::DispatchHandle;

/// Observer callback; receives a reference to the delivered value.
pub type ObserverFn<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Identity of a subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SubscriptionId(u64);

struct SubEntry<T> {
    callback: ObserverFn<T>,
    /// Set by `set`, consumed by delivery. An un-armed observer missed
    /// the set (it registered too late) and must not receive the value.
    armed: AtomicBool,
    sticky: bool,
}

/// A write-many, consume-once observable value.
///
/// `T` is cloned into the slot and handed to observers by reference;
/// observers clone what they need to keep.
pub struct EventValue<T> {
    value: RwLock<Option<T>>,
    subs: DashMap<u64, Arc<SubEntry<T>>>,
    /// Callback identity (the `Arc`'s pointer) to subscription id, for
    /// O(1) duplicate detection and removal by callback.
    by_identity: DashMap<usize, u64>,
    next_id: AtomicU64,
    main: DispatchHandle,
}

fn identity<T>(callback: &ObserverFn<T>) -> usize {
    Arc::as_ptr(callback) as *const () as usize
}

impl<T: Clone + Send + Sync + 'static> EventValue<T> {
    /// An empty value affiliated with the given main queue.
    pub fn new(main: DispatchHandle) -> Self {
        Self {
            value: RwLock::new(None),
            subs: DashMap::new(),
            by_identity: DashMap::new(),
            next_id: AtomicU64::new(1),
            main,
        }
    }

    /// Registers an event observer: it receives every `set` performed
    /// after this call, and nothing that happened before it.
    ///
    /// Registering the same callback (`Arc` identity) twice is a logged
    /// no-op returning the existing subscription.
    pub fn observe(&self, callback: ObserverFn<T>) -> SubscriptionId {
        self.register(callback, false)
    }

    /// Registers a sticky observer: the current value (if any) is
    /// delivered immediately on the calling thread, then every
    /// subsequent `set` as usual.
    pub fn observe_sticky(&self, callback: ObserverFn<T>) -> SubscriptionId {
        let replay = self.value.read().clone();
        let id = self.register(callback.clone(), true);
        if let Some(value) = replay {
            callback(&value);
        }
        id
    }

    fn register(&self, callback: ObserverFn<T>, sticky: bool) -> SubscriptionId {
        let key = identity(&callback);
        if let Some(existing) = self.by_identity.get(&key) {
            debug!(
                subscription = *existing.value(),
                "duplicate observer registration ignored"
            );
            return SubscriptionId(*existing.value());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.insert(
            id,
            Arc::new(SubEntry {
                callback,
                armed: AtomicBool::new(false),
                sticky,
            }),
        );
        self.by_identity.insert(key, id);
        trace!(subscription = id, sticky, "observer registered");
        SubscriptionId(id)
    }

    /// Stores a value and delivers it, on the calling thread, to every
    /// observer registered before this call. Each such observer
    /// receives the value exactly once; observers registering
    /// concurrently receive nothing from this set.
    pub fn set(&self, value: T) {
        // Arm first, snapshotting the entries; anything inserted after
        // this point stays un-armed for this set.
        let snapshot: Vec<Arc<SubEntry<T>>> = self
            .subs
            .iter()
            .map(|entry| {
                entry.value().armed.store(true, Ordering::Release);
                Arc::clone(entry.value())
            })
            .collect();
        *self.value.write() = Some(value.clone());
        trace!(observers = snapshot.len(), "value set");
        for entry in snapshot {
            // Consume the arming exactly once per observer.
            if entry
                .armed
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                (entry.callback)(&value);
            }
        }
    }

    /// Forwards a `set` to the main queue; usable from any thread.
    pub fn post(self: &Arc<Self>, value: T) {
        let this = Arc::clone(self);
        self.main.post(move || this.set(value));
    }

    /// The current value, if one was ever set.
    pub fn get(&self) -> Option<T> {
        self.value.read().clone()
    }

    /// Removes an observer by callback identity. Idempotent.
    pub fn remove_observer(&self, callback: &ObserverFn<T>) -> bool {
        match self.by_identity.remove(&identity(callback)) {
            Some((_, id)) => {
                self.subs.remove(&id);
                trace!(subscription = id, "observer removed");
                true
            }
            None => false,
        }
    }

    /// Removes an observer by subscription id. Idempotent.
    pub fn remove_by_id(&self, id: SubscriptionId) -> bool {
        match self.subs.remove(&id.0) {
            Some((_, entry)) => {
                self.by_identity.remove(&identity(&entry.callback));
                true
            }
            None => false,
        }
    }

    /// Removes every observer. The stored value is kept.
    pub fn clear(&self) {
        self.subs.clear();
        self.by_identity.clear();
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.subs.len()
    }
}

impl<T> std::fmt::Debug for EventValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventValue")
            .field("observers", &self.subs.len())
            .field("has_value", &self.value.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn value<T: Clone + Send + Sync + 'static>() -> (Dispatcher, EventValue<T>) {
        let dispatcher = Dispatcher::start("test-observable");
        let handle = dispatcher.handle();
        (dispatcher, EventValue::new(handle))
    }

    #[test]
    fn test_late_observer_does_not_peek() {
        let (_d, value) = value::<String>();
        value.set("first".into());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        value.observe(Arc::new(move |v: &String| {
            seen_clone.lock().push(v.clone());
        }));
        assert!(seen.lock().is_empty());
        value.set("second".into());
        assert_eq!(*seen.lock(), vec!["second".to_string()]);
    }

    #[test]
    fn test_sticky_observer_replays_current_value() {
        let (_d, value) = value::<i32>();
        value.set(7);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        value.observe_sticky(Arc::new(move |v: &i32| {
            seen_clone.lock().push(*v);
        }));
        assert_eq!(*seen.lock(), vec![7]);
        value.set(8);
        assert_eq!(*seen.lock(), vec![7, 8]);
    }

    #[test]
    fn test_duplicate_registration_is_a_no_op() {
        let (_d, value) = value::<i32>();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let callback: ObserverFn<i32> = Arc::new(move |v: &i32| {
            seen_clone.lock().push(*v);
        });
        let first = value.observe(Arc::clone(&callback));
        let second = value.observe(Arc::clone(&callback));
        assert_eq!(first, second);
        assert_eq!(value.observer_count(), 1);
        value.set(3);
        assert_eq!(*seen.lock(), vec![3]);
    }

    #[test]
    fn test_remove_by_callback_and_by_id() {
        let (_d, value) = value::<i32>();
        let callback: ObserverFn<i32> = Arc::new(|_| {});
        value.observe(Arc::clone(&callback));
        assert!(value.remove_observer(&callback));
        assert!(!value.remove_observer(&callback));
        assert_eq!(value.observer_count(), 0);

        let id = value.observe(Arc::new(|_| {}));
        assert!(value.remove_by_id(id));
        assert!(!value.remove_by_id(id));
        assert_eq!(value.observer_count(), 0);
    }

    #[test]
    fn test_post_delivers_on_main_queue() {
        let dispatcher = Dispatcher::start("test-observable-post");
        let handle = dispatcher.handle();
        let value = Arc::new(EventValue::<i32>::new(handle.clone()));
        let (tx, rx) = crossbeam_channel::bounded(1);
        let probe = handle.clone();
        value.observe(Arc::new(move |v: &i32| {
            let _ = tx.send((*v, probe.is_current_thread()));
        }));
        value.post(11);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            (11, true)
        );
    }

    #[test]
    fn test_get_returns_latest() {
        let (_d, value) = value::<i32>();
        assert_eq!(value.get(), None);
        value.set(1);
        value.set(2);
        assert_eq!(value.get(), Some(2));
    }
}
