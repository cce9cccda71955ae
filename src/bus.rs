//! Typed publish/subscribe hub shared by sessions, media pipelines, device
//! emulation and statistics sinks.
//!
//! The bus is an ordinary value: construct one per process (or per test) and share
//! it behind an `Arc`. Subscriber lists are copy-on-write snapshots, so publishing
//! never holds the registry lock while callbacks run, and subscribing or releasing
//! from inside a callback is allowed.
//!
//! Delivery guarantees:
//! * subscribers of one kind run in subscription order, on the publisher's thread,
//!   and `publish` returns only after all of them ran;
//! * once [`SubscriptionHandle::release`] returns, the callback is never invoked
//!   again, and a release racing an in-flight invocation on another thread waits
//!   for it to finish;
//! * a release made from inside a callback stops new invocations but does not wait,
//!   so two callbacks releasing each other on different threads cannot deadlock;
//! * a panicking subscriber is logged and skipped without affecting the others.
//!
//! Callbacks must not block. Long-running reactions belong on the subscriber's own
//! worker; the publisher is usually a session's time-sensitive dispatch loop.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{trace, warn};

use crate::events::{BusEvent, Event, EventKind};

type Callback = Box<dyn Fn(&Event) + Send + Sync>;

thread_local! {
    /// Number of bus callbacks currently running on this thread.
    static CALLBACK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get() + 1));
        DepthGuard
    }

    fn inside_callback() -> bool {
        CALLBACK_DEPTH.with(|depth| depth.get() > 0)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

#[derive(Debug)]
struct SlotState {
    active: bool,
    in_flight: usize,
}

struct Subscriber {
    id: u64,
    kinds: Vec<EventKind>,
    callback: Callback,
    /// `active` and the count of running invocations change together under this
    /// lock; it is never held while the callback runs.
    slot: Mutex<SlotState>,
    idle: Condvar,
}

impl Subscriber {
    /// Claims one invocation, or `None` once released.
    fn begin_call(&self) -> Option<()> {
        let mut slot = self.slot.lock();
        if !slot.active {
            return None;
        }
        slot.in_flight += 1;
        Some(())
    }

    fn end_call(&self) {
        let mut slot = self.slot.lock();
        slot.in_flight = slot.in_flight.saturating_sub(1);
        if slot.in_flight == 0 {
            self.idle.notify_all();
        }
    }

    /// Marks the subscriber released. Returns false if it already was.
    fn deactivate(&self) -> bool {
        let mut slot = self.slot.lock();
        std::mem::replace(&mut slot.active, false)
    }

    /// Waits for invocations on other threads to drain. Skipped from inside a
    /// callback, where waiting could form a cycle with another publisher.
    fn wait_idle(&self) {
        if DepthGuard::inside_callback() {
            return;
        }
        let mut slot = self.slot.lock();
        while slot.in_flight > 0 {
            self.idle.wait(&mut slot);
        }
    }

    fn is_active(&self) -> bool {
        self.slot.lock().active
    }
}

type SubscriberList = Arc<Vec<Arc<Subscriber>>>;

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<EventKind, SubscriberList>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to a single event kind; the callback receives its own copy of
    /// each payload.
    pub fn subscribe<E, F>(self: &Arc<Self>, callback: F) -> SubscriptionHandle
    where
        E: BusEvent,
        F: Fn(E) + Send + Sync + 'static,
    {
        self.register(
            vec![E::KIND],
            Box::new(move |event| {
                if let Some(payload) = E::extract(event) {
                    callback(payload.clone());
                }
            }),
        )
    }

    /// Subscribes one callback to several kinds, for subscribers that dispatch on
    /// the [`Event`] enum themselves.
    pub fn subscribe_many<F>(
        self: &Arc<Self>,
        kinds: &[EventKind],
        callback: F,
    ) -> SubscriptionHandle
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let mut unique = Vec::with_capacity(kinds.len());
        for kind in kinds {
            if !unique.contains(kind) {
                unique.push(*kind);
            }
        }
        self.register(unique, Box::new(move |event| callback(event.clone())))
    }

    fn register(self: &Arc<Self>, kinds: Vec<EventKind>, callback: Callback) -> SubscriptionHandle {
        let subscriber = Arc::new(Subscriber {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kinds,
            callback,
            slot: Mutex::new(SlotState {
                active: true,
                in_flight: 0,
            }),
            idle: Condvar::new(),
        });

        let mut map = self.subscribers.write();
        for kind in &subscriber.kinds {
            let entry = map.entry(*kind).or_default();
            let mut next = Vec::with_capacity(entry.len() + 1);
            next.extend(entry.iter().cloned());
            next.push(Arc::clone(&subscriber));
            *entry = Arc::new(next);
        }
        trace!(subscriber = subscriber.id, kinds = ?subscriber.kinds, "subscribed");

        SubscriptionHandle {
            bus: Arc::downgrade(self),
            subscriber,
        }
    }

    /// Delivers `event` to every subscriber of its kind registered at call time.
    pub fn publish(&self, event: impl Into<Event>) {
        let event = event.into();
        let snapshot = self.subscribers.read().get(&event.kind()).cloned();
        let Some(list) = snapshot else {
            trace!(kind = ?event.kind(), "no subscribers");
            return;
        };

        for subscriber in list.iter() {
            if subscriber.begin_call().is_none() {
                continue;
            }
            let outcome = {
                let _depth = DepthGuard::enter();
                catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(&event)))
            };
            subscriber.end_call();
            if outcome.is_err() {
                warn!(
                    subscriber = subscriber.id,
                    kind = ?event.kind(),
                    session_id = event.session_id(),
                    "event subscriber panicked"
                );
            }
        }
    }

    /// Releases `handle`. Equivalent to [`SubscriptionHandle::release`].
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.remove(&handle.subscriber);
    }

    /// Number of live subscribers for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .get(&kind)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    fn remove(&self, subscriber: &Arc<Subscriber>) {
        if subscriber.deactivate() {
            let mut map = self.subscribers.write();
            for kind in &subscriber.kinds {
                let Some(list) = map.get_mut(kind) else {
                    continue;
                };
                let next: Vec<_> = list
                    .iter()
                    .filter(|s| s.id != subscriber.id)
                    .cloned()
                    .collect();
                if next.is_empty() {
                    map.remove(kind);
                } else {
                    *list = Arc::new(next);
                }
            }
            trace!(subscriber = subscriber.id, "unsubscribed");
        }
        subscriber.wait_idle();
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.subscribers.read();
        let counts: HashMap<_, _> = map.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventBus")
            .field("subscribers", &counts)
            .finish()
    }
}

/// Registration token. Dropping it releases the subscription.
#[must_use = "dropping the handle immediately unsubscribes"]
pub struct SubscriptionHandle {
    bus: Weak<EventBus>,
    subscriber: Arc<Subscriber>,
}

impl SubscriptionHandle {
    /// Unregisters the callback. Safe to call repeatedly, from any thread, and from
    /// inside the callback itself.
    pub fn release(&self) {
        match self.bus.upgrade() {
            Some(bus) => bus.remove(&self.subscriber),
            None => {
                self.subscriber.deactivate();
                self.subscriber.wait_idle();
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.subscriber.is_active()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.subscriber.id)
            .field("kinds", &self.subscriber.kinds)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{IdrRequested, RgbLedRequested, Terminated, TerminationReason};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn led(session_id: u64, r: u8) -> RgbLedRequested {
        RgbLedRequested {
            session_id,
            controller: 0,
            r,
            g: 0,
            b: 0,
        }
    }

    #[test]
    fn delivers_in_publish_and_subscription_order() {
        let bus = Arc::new(EventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let log = Arc::clone(&log);
            bus.subscribe(move |ev: RgbLedRequested| log.lock().push(("first", ev.r)))
        };
        let second = {
            let log = Arc::clone(&log);
            bus.subscribe(move |ev: RgbLedRequested| log.lock().push(("second", ev.r)))
        };

        bus.publish(led(1, 0xA));
        bus.publish(led(1, 0xB));

        assert_eq!(
            *log.lock(),
            vec![("first", 0xA), ("second", 0xA), ("first", 0xB), ("second", 0xB)]
        );
        drop((first, second));
    }

    #[test]
    fn routes_by_kind_only() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _handle = bus.subscribe(move |_: IdrRequested| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(led(1, 0));
        bus.publish(IdrRequested { session_id: 1 });
        bus.publish(IdrRequested { session_id: 2 });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn release_is_idempotent_and_drop_unsubscribes() {
        let bus = Arc::new(EventBus::new());
        let handle = bus.subscribe(|_: IdrRequested| {});
        assert_eq!(bus.subscriber_count(EventKind::IdrRequested), 1);
        handle.release();
        handle.release();
        bus.unsubscribe(&handle);
        assert!(!handle.is_active());
        assert_eq!(bus.subscriber_count(EventKind::IdrRequested), 0);

        {
            let _scoped = bus.subscribe(|_: IdrRequested| {});
            assert_eq!(bus.subscriber_count(EventKind::IdrRequested), 1);
        }
        assert_eq!(bus.subscriber_count(EventKind::IdrRequested), 0);
    }

    #[test]
    fn handle_released_mid_publish_is_skipped() {
        let bus = Arc::new(EventBus::new());
        let later_hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

        let killer_slot = Arc::clone(&slot);
        let _killer = bus.subscribe(move |_: IdrRequested| {
            if let Some(handle) = killer_slot.lock().as_ref() {
                handle.release();
            }
        });
        let counter = Arc::clone(&later_hits);
        *slot.lock() = Some(bus.subscribe(move |_: IdrRequested| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(IdrRequested { session_id: 1 });
        assert_eq!(later_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_may_release_itself() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

        let own = Arc::clone(&slot);
        let counter = Arc::clone(&hits);
        *slot.lock() = Some(bus.subscribe(move |_: IdrRequested| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = own.lock().as_ref() {
                handle.release();
            }
        }));

        bus.publish(IdrRequested { session_id: 1 });
        bus.publish(IdrRequested { session_id: 1 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_invocation_after_release_returns() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handle = bus.subscribe(move |_: IdrRequested| {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_micros(50));
        });

        let stop = Arc::new(AtomicBool::new(false));
        let publishers: Vec<_> = (0..4)
            .map(|session_id| {
                let bus = Arc::clone(&bus);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        bus.publish(IdrRequested { session_id });
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        handle.release();
        let at_release = hits.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Relaxed);
        for publisher in publishers {
            publisher.join().unwrap();
        }
        assert!(at_release > 0);
        assert_eq!(hits.load(Ordering::SeqCst), at_release);
    }

    #[test]
    fn panicking_subscriber_does_not_starve_others() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let _bad = bus.subscribe(|_: Terminated| panic!("subscriber bug"));
        let counter = Arc::clone(&hits);
        let _good = bus.subscribe(move |_: Terminated| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Terminated {
            session_id: 9,
            reason: TerminationReason::External,
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_many_sees_each_kind_once() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let handle = bus.subscribe_many(
            &[EventKind::IdrRequested, EventKind::RgbLedRequested, EventKind::IdrRequested],
            move |event| log.lock().push(event.kind()),
        );

        bus.publish(IdrRequested { session_id: 1 });
        bus.publish(led(1, 1));
        assert_eq!(
            *seen.lock(),
            vec![EventKind::IdrRequested, EventKind::RgbLedRequested]
        );

        handle.release();
        assert_eq!(bus.subscriber_count(EventKind::IdrRequested), 0);
        assert_eq!(bus.subscriber_count(EventKind::RgbLedRequested), 0);
    }

    #[test]
    fn callbacks_releasing_each_other_across_threads_do_not_deadlock() {
        let bus = Arc::new(EventBus::new());
        let barrier = Arc::new(Barrier::new(2));
        let idr_slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
        let led_slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

        let on_idr = {
            let barrier = Arc::clone(&barrier);
            let other = Arc::clone(&led_slot);
            bus.subscribe(move |_: IdrRequested| {
                barrier.wait();
                if let Some(handle) = other.lock().as_ref() {
                    handle.release();
                }
            })
        };
        let on_led = {
            let barrier = Arc::clone(&barrier);
            let other = Arc::clone(&idr_slot);
            bus.subscribe(move |_: RgbLedRequested| {
                barrier.wait();
                if let Some(handle) = other.lock().as_ref() {
                    handle.release();
                }
            })
        };
        *idr_slot.lock() = Some(on_idr);
        *led_slot.lock() = Some(on_led);

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let publishers: Vec<_> = (0..2)
            .map(|n| {
                let bus = Arc::clone(&bus);
                let done = done_tx.clone();
                thread::spawn(move || {
                    if n == 0 {
                        bus.publish(IdrRequested { session_id: 1 });
                    } else {
                        bus.publish(led(1, 1));
                    }
                    let _ = done.send(n);
                })
            })
            .collect();

        for _ in 0..2 {
            done_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("publisher stuck releasing a peer subscriber");
        }
        for publisher in publishers {
            publisher.join().unwrap();
        }
        assert_eq!(bus.subscriber_count(EventKind::IdrRequested), 0);
        assert_eq!(bus.subscriber_count(EventKind::RgbLedRequested), 0);
    }
}
