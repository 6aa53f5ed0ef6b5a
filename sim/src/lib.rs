//! vinfra discrete-event kernel.
//!
//! A single-threaded virtual clock with a subscription/fire mechanism.
//! Periodic components register a [`Subscriber`] with a period in
//! simulated milliseconds; [`Simulation`] advances the clock to the
//! earliest pending fire time and invokes `on_tick` callbacks serially.
//! There is no preemption and no wall-clock I/O on the hot path.

pub mod schedule;

pub use schedule::{Simulation, Subscriber, SubscriberId};
