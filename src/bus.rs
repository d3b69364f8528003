//! Typed publish/subscribe hub between sensor drivers and estimators.
//!
//! Every message type has its own fixed table of [`SUBSCRIBER_SLOTS`]
//! subscribers. [`MessageBus::publish`] hands the message to each subscriber
//! in subscription order, synchronously, under a bus-wide lock so that at most
//! one delivery is in flight. Failing to get the lock within
//! [`BUS_LOCK_TIMEOUT`] halts the device: dropping or reordering a sample is
//! not acceptable on this path.
//!
//! Subscribers are shared references, so estimators keep their mutable state
//! behind interior mutability. A subscriber may publish from inside
//! `on_receive`: the bus is `!Sync`, so a delivery already in flight can only
//! belong to the caller, and the nested message is delivered straight away
//! without taking the lock again.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU8, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};

use crate::error::BusError;
use crate::state::{Comment, GpsSentence, GroundVelocitySample, MotionSample, PressureSample};
use crate::time::{Clock, Duration};

/// Subscriber slots per message type.
pub const SUBSCRIBER_SLOTS: usize = 4;

/// Longest wait for the bus lock before giving up.
pub const BUS_LOCK_TIMEOUT: Duration = Duration::millis(3000);

/// Receives messages of type `M`.
pub trait Subscriber<M> {
    fn on_receive(&self, msg: &M);
}

/// Subscriber table for one message type.
pub struct Topic<'a, M> {
    slots: RefCell<heapless::Vec<&'a dyn Subscriber<M>, SUBSCRIBER_SLOTS>>,
}

impl<'a, M> Topic<'a, M> {
    const fn new() -> Self {
        Self { slots: RefCell::new(heapless::Vec::new()) }
    }

    fn subscribe(&self, subscriber: &'a dyn Subscriber<M>) -> Result<(), BusError> {
        let mut slots = self.slots.borrow_mut();
        if slots.iter().any(|s| same_subscriber(*s, subscriber)) {
            return Ok(());
        }
        slots.push(subscriber).map_err(|_| BusError::NoFreeSlot)
    }

    fn unsubscribe(&self, subscriber: &dyn Subscriber<M>) {
        self.slots
            .borrow_mut()
            .retain(|s| !same_subscriber(*s, subscriber));
    }

    fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    fn deliver(&self, msg: &M) {
        // Copy the table so subscribers may (un)subscribe while being called.
        let slots = self.slots.borrow().clone();
        for subscriber in slots.iter() {
            subscriber.on_receive(msg);
        }
    }
}

fn same_subscriber<M>(a: &dyn Subscriber<M>, b: &dyn Subscriber<M>) -> bool {
    core::ptr::addr_eq(a as *const dyn Subscriber<M>, b as *const dyn Subscriber<M>)
}

/// One table per message type carried by the bus.
pub struct Topics<'a> {
    pressure: Topic<'a, PressureSample>,
    motion: Topic<'a, MotionSample>,
    ground_velocity: Topic<'a, GroundVelocitySample>,
    gps_sentence: Topic<'a, GpsSentence>,
    comment: Topic<'a, Comment>,
}

impl Topics<'_> {
    const fn new() -> Self {
        Self {
            pressure: Topic::new(),
            motion: Topic::new(),
            ground_velocity: Topic::new(),
            gps_sentence: Topic::new(),
            comment: Topic::new(),
        }
    }
}

/// A message type the bus knows how to route.
pub trait BusMessage: Sized + 'static {
    fn topic<'t, 'a>(topics: &'t Topics<'a>) -> &'t Topic<'a, Self>;
}

macro_rules! route {
    ($msg:ty => $field:ident) => {
        impl BusMessage for $msg {
            fn topic<'t, 'a>(topics: &'t Topics<'a>) -> &'t Topic<'a, Self> {
                &topics.$field
            }
        }
    };
}

route!(PressureSample => pressure);
route!(MotionSample => motion);
route!(GroundVelocitySample => ground_velocity);
route!(GpsSentence => gps_sentence);
route!(Comment => comment);

pub struct MessageBus<'a, C: Clock> {
    clock: &'a C,
    lock: Mutex<CriticalSectionRawMutex, ()>,
    // Deliveries in flight on the lock holder's stack
    depth: AtomicU8,
    topics: Topics<'a>,
}

/// Lock and nesting depth for one delivery.
struct Delivery<'b> {
    depth: &'b AtomicU8,
    _guard: Option<MutexGuard<'b, CriticalSectionRawMutex, ()>>,
}

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        // Runs before the guard field drops, so the lock outlives the count
        let depth = self.depth.load(Ordering::Relaxed);
        self.depth.store(depth - 1, Ordering::Release);
    }
}

impl<'a, C: Clock> MessageBus<'a, C> {
    pub fn new(clock: &'a C) -> Self {
        Self {
            clock,
            lock: Mutex::new(()),
            depth: AtomicU8::new(0),
            topics: Topics::new(),
        }
    }

    pub fn clock(&self) -> &'a C {
        self.clock
    }

    /// Adds `subscriber` for messages of type `M`. Subscribing twice is a
    /// no-op.
    pub fn subscribe<M: BusMessage>(
        &self,
        subscriber: &'a dyn Subscriber<M>,
    ) -> Result<(), BusError> {
        M::topic(&self.topics).subscribe(subscriber)
    }

    /// Removes `subscriber` for messages of type `M`, if present.
    pub fn unsubscribe<M: BusMessage>(&self, subscriber: &dyn Subscriber<M>) {
        M::topic(&self.topics).unsubscribe(subscriber)
    }

    pub fn subscriber_count<M: BusMessage>(&self) -> usize {
        M::topic(&self.topics).len()
    }

    /// Delivers `msg` to every current subscriber of its type. Called from a
    /// subscriber, the nested delivery completes before the outer one moves on.
    pub fn publish<M: BusMessage>(&self, msg: &M) {
        let _delivery = self.enter();
        M::topic(&self.topics).deliver(msg);
    }

    fn enter(&self) -> Delivery<'_> {
        let depth = self.depth.load(Ordering::Acquire);
        let guard = if depth == 0 { Some(self.acquire()) } else { None };
        self.depth.store(depth + 1, Ordering::Release);
        Delivery { depth: &self.depth, _guard: guard }
    }

    fn acquire(&self) -> MutexGuard<'_, CriticalSectionRawMutex, ()> {
        let start = self.clock.now();
        loop {
            if let Ok(guard) = self.lock.try_lock() {
                return guard;
            }
            let waited = self.clock.now().checked_duration_since(start);
            if waited.is_some_and(|w| w >= BUS_LOCK_TIMEOUT) {
                fatal!("message bus lock not acquired within {} ms", BUS_LOCK_TIMEOUT.to_millis());
            }
            core::hint::spin_loop();
        }
    }
}
