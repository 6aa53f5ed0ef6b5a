//! Trace progress accounting and the drain notification.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use vinfra_core::error::{Result, SimError};
use vinfra_core::event::{events, EventEmitter, SimEvent};
use vinfra_sim::Simulation;

/// Counts dispatched and completed jobs against the trace total and
/// fires the all-finished hook exactly once when the trace drains.
pub struct Progress {
    sim: Rc<Simulation>,
    emitter: EventEmitter,
    total: Cell<Option<usize>>,
    dispatched: Cell<usize>,
    done: Cell<usize>,
    all_dispatched_emitted: Cell<bool>,
    finished_hook: RefCell<Option<Box<dyn FnOnce() -> Result<()>>>>,
}

impl Progress {
    pub fn new(sim: Rc<Simulation>, emitter: EventEmitter) -> Rc<Self> {
        Rc::new(Self {
            sim,
            emitter,
            total: Cell::new(None),
            dispatched: Cell::new(0),
            done: Cell::new(0),
            all_dispatched_emitted: Cell::new(false),
            finished_hook: RefCell::new(None),
        })
    }

    /// One-shot; a second call is a programming error.
    pub fn set_total(&self, total: usize) -> Result<()> {
        if self.total.get().is_some() {
            return Err(SimError::AlreadyInitialized);
        }
        self.total.set(Some(total));
        Ok(())
    }

    /// Install the hook run when every job has completed.
    pub fn on_all_finished(&self, hook: impl FnOnce() -> Result<()> + 'static) {
        *self.finished_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// A job reached a VM.
    pub fn register_dispatch(&self) {
        self.dispatched.set(self.dispatched.get() + 1);
        if Some(self.dispatched.get()) == self.total.get()
            && !self.all_dispatched_emitted.replace(true)
        {
            tracing::info!(total = self.dispatched.get(), "last job reached a vm");
            self.emitter
                .emit(SimEvent::empty(events::TRACE_DISPATCHED, self.sim.now()));
        }
    }

    /// A job's compute task completed.
    pub fn register_completion(&self) -> Result<()> {
        self.done.set(self.done.get() + 1);
        if Some(self.done.get()) == self.total.get() {
            tracing::info!(total = self.done.get(), "trace drained");
            self.emitter
                .emit(SimEvent::empty(events::TRACE_FINISHED, self.sim.now()));
            if let Some(hook) = self.finished_hook.borrow_mut().take() {
                hook()?;
            }
        }
        Ok(())
    }

    pub fn total(&self) -> Option<usize> {
        self.total.get()
    }

    pub fn dispatched_count(&self) -> usize {
        self.dispatched.get()
    }

    /// Monotonic completed-job count.
    pub fn done_count(&self) -> usize {
        self.done.get()
    }
}
