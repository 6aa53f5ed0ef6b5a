//! Virtual clock and subscription registry.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Weak;

use vinfra_core::error::Result;
use vinfra_core::time::SimTime;

/// A periodic callback driven by the virtual clock.
///
/// A tick body runs to completion; every cross-component call inside it is
/// synchronous. Returning an error aborts the simulation run with that
/// error.
pub trait Subscriber {
    fn on_tick(&self, now: SimTime) -> Result<()>;
}

/// Identity of one subscription.
///
/// Ids are handed out sequentially, and entries firing at the same virtual
/// instant fire in ascending id order, so co-firing subscribers have a
/// stable, reproducible ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

struct Registration {
    period: SimTime,
    generation: u64,
    subscriber: Weak<dyn Subscriber>,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    fire_at: SimTime,
    id: u64,
    generation: u64,
}

struct Timeline {
    clock: SimTime,
    next_id: u64,
    heap: BinaryHeap<Reverse<Entry>>,
    subscribers: HashMap<u64, Registration>,
}

/// The discrete-event scheduler.
///
/// Owns the virtual clock and the subscription registry. Components hold
/// an `Rc<Simulation>`; the scheduler holds only weak back-references, so
/// the driver stays the root owner of every component.
///
/// Rescheduling uses lazy deletion: `unsubscribe` and `update_frequency`
/// invalidate pending heap entries through a per-subscription generation
/// counter rather than searching the heap.
pub struct Simulation {
    inner: RefCell<Timeline>,
}

impl Simulation {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(Timeline {
                clock: 0,
                next_id: 0,
                heap: BinaryHeap::new(),
                subscribers: HashMap::new(),
            }),
        }
    }

    /// Current virtual time in milliseconds.
    pub fn now(&self) -> SimTime {
        self.inner.borrow().clock
    }

    /// Register a periodic subscriber. The first fire happens one period
    /// from now; a zero period fires at the current instant.
    pub fn subscribe(&self, subscriber: Weak<dyn Subscriber>, period_ms: SimTime) -> SubscriberId {
        let mut tl = self.inner.borrow_mut();
        let id = tl.next_id;
        tl.next_id += 1;
        tl.subscribers.insert(
            id,
            Registration {
                period: period_ms,
                generation: 0,
                subscriber,
            },
        );
        let fire_at = tl.clock + period_ms;
        tl.heap.push(Reverse(Entry {
            fire_at,
            id,
            generation: 0,
        }));
        tracing::trace!(id, period_ms, fire_at, "subscribed");
        SubscriberId(id)
    }

    /// Cancel a subscription. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut tl = self.inner.borrow_mut();
        if tl.subscribers.remove(&id.0).is_some() {
            tracing::trace!(id = id.0, "unsubscribed");
        }
    }

    /// Whether the id currently has a registration.
    pub fn is_subscribed(&self, id: SubscriberId) -> bool {
        self.inner.borrow().subscribers.contains_key(&id.0)
    }

    /// Change a subscription's period; the next fire moves to
    /// `now + new_period`. Unknown ids are a no-op.
    pub fn update_frequency(&self, id: SubscriberId, new_period_ms: SimTime) {
        let mut tl = self.inner.borrow_mut();
        let clock = tl.clock;
        if let Some(reg) = tl.subscribers.get_mut(&id.0) {
            reg.period = new_period_ms;
            reg.generation += 1;
            let generation = reg.generation;
            tl.heap.push(Reverse(Entry {
                fire_at: clock + new_period_ms,
                id: id.0,
                generation,
            }));
        }
    }

    /// Advance the clock to `time_ms` without firing anything earlier.
    /// Moving backwards is a no-op.
    pub fn skip_until(&self, time_ms: SimTime) {
        let mut tl = self.inner.borrow_mut();
        tl.clock = tl.clock.max(time_ms);
    }

    /// Fire the next pending subscription, advancing the clock to its
    /// fire time. Returns `None` when no live subscription remains, and
    /// surfaces a subscriber error without rescheduling it.
    pub fn fire_next(&self) -> Option<Result<SimTime>> {
        loop {
            let popped = {
                let mut tl = self.inner.borrow_mut();
                let Reverse(entry) = tl.heap.pop()?;
                let live = match tl.subscribers.get(&entry.id) {
                    Some(reg) if reg.generation == entry.generation => {
                        Some((reg.subscriber.upgrade(), reg.period))
                    }
                    _ => None, // stale entry
                };
                match live {
                    Some((Some(subscriber), period)) => {
                        tl.clock = tl.clock.max(entry.fire_at);
                        Some((entry.id, entry.generation, subscriber, period))
                    }
                    Some((None, _)) => {
                        // Owner dropped the component without unsubscribing.
                        tl.subscribers.remove(&entry.id);
                        None
                    }
                    None => None,
                }
            };
            let Some((id, generation, subscriber, _period)) = popped else {
                continue;
            };

            let now = self.now();
            if let Err(e) = subscriber.on_tick(now) {
                return Some(Err(e));
            }

            // Reschedule unless the tick body unsubscribed or retargeted.
            let mut tl = self.inner.borrow_mut();
            if let Some(reg) = tl.subscribers.get(&id) {
                if reg.generation == generation {
                    let fire_at = now + reg.period;
                    tl.heap.push(Reverse(Entry {
                        fire_at,
                        id,
                        generation,
                    }));
                }
            }
            return Some(Ok(now));
        }
    }

    /// Fire time of the next live entry, pruning stale and dead ones.
    pub fn next_fire_time(&self) -> Option<SimTime> {
        let mut tl = self.inner.borrow_mut();
        loop {
            let dead = match tl.heap.peek() {
                None => return None,
                Some(Reverse(top)) => match tl.subscribers.get(&top.id) {
                    Some(reg) if reg.generation == top.generation => {
                        if reg.subscriber.upgrade().is_some() {
                            return Some(top.fire_at);
                        }
                        Some(top.id)
                    }
                    _ => None,
                },
            };
            if let Some(id) = dead {
                tl.subscribers.remove(&id);
            }
            tl.heap.pop();
        }
    }

    /// Drain the event heap, returning the final virtual time. A
    /// subscriber error aborts the run.
    pub fn simulate_until_last_event(&self) -> Result<SimTime> {
        while let Some(outcome) = self.fire_next() {
            outcome?;
        }
        Ok(self.now())
    }

    /// Fire everything scheduled up to and including `time_ms`, then park
    /// the clock there. Periodic subscribers stay registered.
    pub fn simulate_until(&self, time_ms: SimTime) -> Result<SimTime> {
        while let Some(fire_at) = self.next_fire_time() {
            if fire_at > time_ms {
                break;
            }
            if let Some(outcome) = self.fire_next() {
                outcome?;
            }
        }
        self.skip_until(time_ms);
        Ok(self.now())
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}
