//! Multicast broadcaster with last-value replay.
//!
//! Every component publishes its state through one of these without knowing
//! who listens. A new subscriber first sees the most recent value (if any),
//! then every later publish in order. Attached subscribers never miss a value:
//! each one owns an unbounded queue, so a slow observer cannot stall the
//! publisher.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Callback-style observer, for hosts that do not poll a [`Subscription`].
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait Listener<T>: Send + Sync {
    fn on_event(&self, value: T);
}

enum Sink<T> {
    Queue(mpsc::UnboundedSender<T>),
    Bus(EventBus<T>),
}

struct Shared<T> {
    latest: Option<T>,
    sinks: Vec<(u64, Sink<T>)>,
    next_id: u64,
}

pub struct EventBus<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(shared: &Mutex<Shared<T>>) -> MutexGuard<'_, Shared<T>> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                latest: None,
                sinks: Vec::new(),
                next_id: 0,
            })),
        }
    }

    /// Store `value` as the replay slot and hand it to every subscriber.
    pub fn publish(&self, value: T) {
        let mut shared = lock(&self.shared);
        shared.sinks.retain(|(_, sink)| match sink {
            Sink::Queue(tx) => tx.send(value.clone()).is_ok(),
            Sink::Bus(bus) => {
                bus.publish(value.clone());
                true
            }
        });
        shared.latest = Some(value);
    }

    /// Attach a new subscriber. The latest value, if any, is queued first.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = lock(&self.shared);
        if let Some(latest) = &shared.latest {
            let _ = tx.send(latest.clone());
        }
        let id = shared.next_id;
        shared.next_id += 1;
        shared.sinks.push((id, Sink::Queue(tx)));
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.shared),
            attached: true,
        }
    }

    /// Republish everything from this bus into `target`, synchronously and in
    /// call order. Sources merged into one target keep their own order and
    /// interleave by publish time. Do not build cycles.
    pub fn forward_to(&self, target: &EventBus<T>) {
        let mut shared = lock(&self.shared);
        if let Some(latest) = &shared.latest {
            target.publish(latest.clone());
        }
        let id = shared.next_id;
        shared.next_id += 1;
        shared.sinks.push((id, Sink::Bus(target.clone())));
    }

    /// Deliver values to `listener` on a spawned task.
    ///
    /// Must be called inside a tokio runtime. Abort the returned handle to
    /// detach the listener.
    pub fn add_listener(&self, listener: Arc<dyn Listener<T>>) -> JoinHandle<()> {
        let mut subscription = self.subscribe();
        tokio::spawn(async move {
            while let Some(value) = subscription.recv().await {
                listener.on_event(value);
            }
        })
    }

    /// The replay slot.
    pub fn latest(&self) -> Option<T> {
        lock(&self.shared).latest.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared)
            .sinks
            .iter()
            .filter(|(_, sink)| matches!(sink, Sink::Queue(tx) if !tx.is_closed()))
            .count()
    }
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    bus: Weak<Mutex<Shared<T>>>,
    attached: bool,
}

impl<T> Subscription<T> {
    /// Next value, or `None` once unsubscribed (or the bus is gone) and
    /// everything already queued has been drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next already-queued value without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Drain every value queued so far.
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Detach from the bus. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        self.rx.close();
        if let Some(shared) = self.bus.upgrade() {
            lock(&shared).sinks.retain(|(id, _)| *id != self.id);
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
