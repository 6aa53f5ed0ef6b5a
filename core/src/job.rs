//! Job and trace data model.

use crate::time::SimTime;
use std::cell::Cell;
use std::rc::Rc;

/// Kind tag used when a trace entry carries no executable id.
pub const DEFAULT_KIND: &str = "default";

/// One entry of the workload trace.
///
/// Submit time is interiorly mutable because the arrival handler shifts
/// late-loaded traces forward; the real queue time is stamped by the
/// launcher at dispatch.
#[derive(Debug)]
pub struct Job {
    id: String,
    kind: String,
    submit_ms: Cell<SimTime>,
    exec_ms: SimTime,
    queue_ms: Cell<Option<SimTime>>,
}

/// Shared handle to a job. The trace owner, the launcher and the retry
/// queue all hold the same allocation.
pub type JobRef = Rc<Job>;

impl Job {
    /// Create a job. An empty kind tag normalizes to [`DEFAULT_KIND`].
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        submit_ms: SimTime,
        exec_ms: SimTime,
    ) -> Self {
        let kind = kind.into();
        let kind = if kind.is_empty() {
            DEFAULT_KIND.to_string()
        } else {
            kind
        };
        Self {
            id: id.into(),
            kind,
            submit_ms: Cell::new(submit_ms),
            exec_ms,
            queue_ms: Cell::new(None),
        }
    }

    /// Job identity from the trace.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Executable tag; selects the VM pool.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Submission time on the virtual clock.
    pub fn submit_ms(&self) -> SimTime {
        self.submit_ms.get()
    }

    /// Expected execution time.
    pub fn exec_ms(&self) -> SimTime {
        self.exec_ms
    }

    /// Shift the submission time forward.
    pub fn shift_submit(&self, delta_ms: SimTime) {
        self.submit_ms.set(self.submit_ms.get() + delta_ms);
    }

    /// Record the dispatch moment; the real queue time is the distance
    /// from submission.
    pub fn mark_started(&self, now: SimTime) {
        self.queue_ms
            .set(Some(now.saturating_sub(self.submit_ms.get())));
    }

    /// Real queue time, present once the job reached a VM.
    pub fn queue_time_ms(&self) -> Option<SimTime> {
        self.queue_ms.get()
    }
}
