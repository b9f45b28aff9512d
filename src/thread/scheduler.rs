//! Level-ordered cooperative dispatch state.
//!
//! The scheduler always hands the virtual CPU to the deepest queue that
//! still has runnable threads, FIFO within a queue. A phase starts at the
//! deepest submitted level and the dispatch level generally descends from
//! there; it rises again only when a finishing thread requeues a join
//! waiter above the level currently draining. Forked children are appended
//! to the queue the scheduler is currently draining, so a child runs to
//! its first suspension before anything queued behind it and its spawner
//! resumes no earlier than that.
//!
//! This module is pure queue bookkeeping — it decides *who* runs next and
//! leaves the actual semaphore handoff to the tester.

use std::collections::{BTreeMap, VecDeque};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::{invariant_error, Result};
use crate::signal::ClockId;
use crate::thread::ThreadId;

/// Where control goes after the current thread yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Unblock this thread; it now owns the virtual CPU.
    Thread(ThreadId),
    /// Nothing is runnable (or a failure is pending): hand control back to
    /// the driver.
    Driver,
}

/// Run-queue state for one execution phase.
///
/// Exists in a meaningful state only between a `run_threads` entry and the
/// matching return to the driver; `is_idle` must hold in between.
#[derive(Debug, Default)]
pub struct SchedulerState {
    /// Level the scheduler is currently draining. `None` while idle.
    current_level: Option<u32>,
    /// FIFO run queue per level.
    active: BTreeMap<u32, VecDeque<ThreadId>>,
    /// Threads parked waiting for a clock edge, in parking order per clock.
    blocked: FxHashMap<ClockId, Vec<ThreadId>>,
    /// Thread currently holding the virtual CPU.
    current: Option<ThreadId>,
    /// Threads parked in `join`, keyed by join target.
    joined: FxHashMap<ThreadId, Vec<ThreadId>>,
}

impl SchedulerState {
    /// Create idle scheduler state.
    #[must_use]
    pub fn new() -> Self {
        SchedulerState::default()
    }

    /// Whether the scheduler is between execution phases.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.current_level.is_none()
            && self.current.is_none()
            && self.active.is_empty()
            && self.blocked.is_empty()
    }

    /// Thread currently holding the virtual CPU.
    #[must_use]
    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    pub(crate) fn clear_current(&mut self) {
        self.current = None;
    }

    /// Queue a thread at its own level for the upcoming phase.
    pub fn submit(&mut self, thread: ThreadId, level: u32) {
        self.active.entry(level).or_default().push_back(thread);
    }

    /// Append a freshly forked thread to the queue currently being drained,
    /// behind everything already waiting there.
    pub fn enqueue_at_current(&mut self, thread: ThreadId) -> Result<()> {
        let level = self
            .current_level
            .ok_or_else(|| invariant_error!("fork outside an execution phase"))?;
        self.active.entry(level).or_default().push_back(thread);
        Ok(())
    }

    /// Requeue a thread at its own level (used when a join target finishes).
    pub fn enqueue(&mut self, thread: ThreadId, level: u32) {
        self.active.entry(level).or_default().push_back(thread);
    }

    /// Park a thread until the driver advances `clock`.
    pub fn block_on(&mut self, clock: ClockId, thread: ThreadId) {
        self.blocked.entry(clock).or_default().push(thread);
    }

    /// Register `waiter` as joined on `target`.
    pub fn add_waiter(&mut self, target: ThreadId, waiter: ThreadId) {
        self.joined.entry(target).or_default().push(waiter);
    }

    /// Take all waiters joined on `target`.
    pub fn take_waiters(&mut self, target: ThreadId) -> Vec<ThreadId> {
        self.joined.remove(&target).unwrap_or_default()
    }

    /// Take the blocked-thread map for the driver.
    pub fn take_blocked(&mut self) -> FxHashMap<ClockId, Vec<ThreadId>> {
        std::mem::take(&mut self.blocked)
    }

    /// Return to the idle state between phases.
    pub fn reset(&mut self) {
        self.current_level = None;
        self.current = None;
        self.active.clear();
    }

    /// Pick the next owner of the virtual CPU.
    ///
    /// With `failure_pending` set, or with nothing left runnable, control
    /// goes back to the driver. Otherwise the head of the deepest non-empty
    /// queue runs. The dispatch level descends as queues drain and rises
    /// only when a join waiter was requeued above it.
    pub fn dispatch(&mut self, failure_pending: bool) -> Dispatch {
        self.active.retain(|_, queue| !queue.is_empty());

        if failure_pending || self.active.is_empty() {
            self.current = None;
            trace!(failure_pending, "handing control to driver");
            return Dispatch::Driver;
        }

        let (level, thread) = match self.active.iter_mut().next_back() {
            Some((&level, queue)) => match queue.pop_front() {
                Some(thread) => (level, thread),
                None => {
                    self.current = None;
                    return Dispatch::Driver;
                }
            },
            None => {
                self.current = None;
                return Dispatch::Driver;
            }
        };
        self.current_level = Some(level);
        self.current = Some(thread);
        trace!(%thread, level, "dispatch");
        Dispatch::Thread(thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deepest_level_dispatches_first() {
        let mut sched = SchedulerState::new();
        sched.submit(ThreadId(0), 0);
        sched.submit(ThreadId(1), 1);

        assert_eq!(sched.dispatch(false), Dispatch::Thread(ThreadId(1)));
        assert_eq!(sched.dispatch(false), Dispatch::Thread(ThreadId(0)));
        assert_eq!(sched.dispatch(false), Dispatch::Driver);
    }

    #[test]
    fn test_fifo_within_level() {
        let mut sched = SchedulerState::new();
        sched.submit(ThreadId(0), 0);
        sched.submit(ThreadId(1), 0);
        sched.submit(ThreadId(2), 0);

        assert_eq!(sched.dispatch(false), Dispatch::Thread(ThreadId(0)));
        assert_eq!(sched.dispatch(false), Dispatch::Thread(ThreadId(1)));
        assert_eq!(sched.dispatch(false), Dispatch::Thread(ThreadId(2)));
    }

    #[test]
    fn test_forked_child_runs_after_current_queue_yields() {
        let mut sched = SchedulerState::new();
        sched.submit(ThreadId(0), 0);
        assert_eq!(sched.dispatch(false), Dispatch::Thread(ThreadId(0)));

        // thread 0 forks thread 1, then blocks on a clock
        sched.enqueue_at_current(ThreadId(1)).unwrap();
        sched.block_on(ClockId(0), ThreadId(0));

        assert_eq!(sched.dispatch(false), Dispatch::Thread(ThreadId(1)));
        assert_eq!(sched.dispatch(false), Dispatch::Driver);
        assert_eq!(sched.take_blocked()[&ClockId(0)], vec![ThreadId(0)]);
    }

    #[test]
    fn test_failure_preempts_runnable_threads() {
        let mut sched = SchedulerState::new();
        sched.submit(ThreadId(0), 0);

        assert_eq!(sched.dispatch(true), Dispatch::Driver);
        assert_eq!(sched.current(), None);
    }

    #[test]
    fn test_deeper_requeue_raises_dispatch_level() {
        let mut sched = SchedulerState::new();
        sched.submit(ThreadId(0), 0);
        sched.submit(ThreadId(1), 0);
        assert_eq!(sched.dispatch(false), Dispatch::Thread(ThreadId(0)));

        // a finishing grandchild requeued this waiter above the level
        // currently draining: it must run before the rest of the queue
        sched.enqueue(ThreadId(2), 1);
        assert_eq!(sched.dispatch(false), Dispatch::Thread(ThreadId(2)));
        assert_eq!(sched.dispatch(false), Dispatch::Thread(ThreadId(1)));
    }

    #[test]
    fn test_requeued_waiter_runs_at_its_own_level() {
        let mut sched = SchedulerState::new();
        sched.submit(ThreadId(0), 0);
        assert_eq!(sched.dispatch(false), Dispatch::Thread(ThreadId(0)));

        // thread 0 forks thread 1 and joins it
        sched.enqueue_at_current(ThreadId(1)).unwrap();
        sched.add_waiter(ThreadId(1), ThreadId(0));
        assert_eq!(sched.dispatch(false), Dispatch::Thread(ThreadId(1)));

        // thread 1 finishes: the waiter is requeued at level 0
        for waiter in sched.take_waiters(ThreadId(1)) {
            sched.enqueue(waiter, 0);
        }
        assert_eq!(sched.dispatch(false), Dispatch::Thread(ThreadId(0)));
        assert_eq!(sched.dispatch(false), Dispatch::Driver);
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut sched = SchedulerState::new();
        sched.submit(ThreadId(0), 0);
        let _ = sched.dispatch(false);
        assert!(!sched.is_idle());

        let _ = sched.take_blocked();
        sched.reset();
        assert!(sched.is_idle());
    }
}
