//! Driver and stimulus surfaces of the tester core.
//!
//! The [`Tester`] is the driver-side handle: it owns the design metadata,
//! the simulator bridge, and all scheduler state, and it is what the outer
//! loop calls between timesteps. Each stimulus closure receives a
//! [`Context`] instead — the thread-side handle carrying poke/peek,
//! timescope, fork/join, and clock-step operations.
//!
//! # Control flow
//!
//! Every stimulus thread is an OS thread parked on its own semaphore. An
//! operation that suspends (join, clock step, completion) picks the next
//! runnable thread under the state lock, drops the lock, releases the
//! chosen thread's semaphore, and parks its own. When nothing is runnable
//! — or a failure is pending — control returns to the driver semaphore
//! instead. At most one permit exists in the system at any time, so all
//! state mutation is effectively single-threaded despite the OS threads.
//!
//! # Failure and teardown
//!
//! A stimulus body that returns an error or panics pushes onto a lock-free
//! failure queue and hands control to the driver; `run_threads` surfaces
//! one queued failure per call. Dropping the tester aborts every parked
//! thread silently: each one wakes, observes the teardown flag, and unwinds
//! with a private sentinel that the thread boundary swallows.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crossbeam::queue::SegQueue;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::actions::{ActionLog, Conflict, ConflictKind, ConflictReport, PeekRecord, PokeRecord};
use crate::error::{invariant_error, Error, Result};
use crate::scope::{Scope, ScopeArena, ScopeId};
use crate::signal::{ClockId, DesignInfo, SignalId, SignalValue};
use crate::sim::Simulator;
use crate::thread::{Dispatch, SchedulerState, Semaphore, TesterThread, ThreadId};
use crate::trace::CallSite;

/// Boxed stimulus body.
type ThreadBody = Box<dyn FnOnce(&Context) -> Result<()> + Send + 'static>;

/// Sentinel unwind payload used to abort parked threads during teardown.
struct Teardown;

/// Everything behind the state lock. Only the thread holding the virtual
/// CPU (or the driver, while no thread does) touches this.
struct CoreState {
    scopes: ScopeArena,
    threads: FxHashMap<ThreadId, TesterThread>,
    /// Live threads, for sanity assertions. Finished threads leave this set
    /// but stay in `threads` so `join` can still observe their done flag.
    all_threads: FxHashSet<ThreadId>,
    sched: SchedulerState,
    log: ActionLog,
    timestep: u64,
    next_thread_id: u32,
}

struct Shared {
    state: Mutex<CoreState>,
    /// The driver parks here while any stimulus thread runs.
    driver: Semaphore,
    /// Failures raised by stimulus threads. Lock-free because an exiting
    /// thread pushes here right before releasing the driver.
    failures: SegQueue<Error>,
    design: DesignInfo,
    sim: Mutex<Box<dyn Simulator>>,
    shutting_down: AtomicBool,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Shared {
    fn lock_state(&self) -> Result<MutexGuard<'_, CoreState>> {
        self.state
            .lock()
            .map_err(|e| Error::LockError(format!("core state lock poisoned: {e}")))
    }

    fn with_sim<R>(&self, f: impl FnOnce(&mut dyn Simulator) -> R) -> Result<R> {
        let mut sim = self
            .sim
            .lock()
            .map_err(|e| Error::LockError(format!("simulator lock poisoned: {e}")))?;
        Ok(f(sim.as_mut()))
    }

    /// Pick the next owner of the virtual CPU and wake it. Consumes the
    /// guard so the semaphore handoff happens with the state unlocked.
    fn hand_off(&self, mut state: MutexGuard<'_, CoreState>) -> Result<()> {
        let failure_pending = !self.failures.is_empty();
        match state.sched.dispatch(failure_pending) {
            Dispatch::Thread(id) => {
                let sem = match state.threads.get(&id) {
                    Some(thread) => thread.semaphore(),
                    None => {
                        self.failures.push(invariant_error!("dispatched unknown thread {id}"));
                        state.sched.clear_current();
                        drop(state);
                        return self.driver.release();
                    }
                };
                drop(state);
                sem.release()
            }
            Dispatch::Driver => {
                drop(state);
                self.driver.release()
            }
        }
    }

    /// Park the calling thread until the scheduler grants it the CPU again.
    fn park(&self, sem: &Semaphore) -> Result<()> {
        sem.acquire()?;
        if self.shutting_down.load(Ordering::Acquire) {
            // woken for teardown, not to run: unwind silently
            panic::resume_unwind(Box::new(Teardown));
        }
        Ok(())
    }

    /// Install a new stimulus thread and start its OS thread. The thread
    /// parks immediately and runs only once the scheduler dispatches it.
    fn create_thread(
        self: &Arc<Self>,
        state: &mut CoreState,
        parent: ScopeId,
        level: u32,
        parent_action_id: u64,
        body: ThreadBody,
    ) -> Result<ThreadId> {
        let id = ThreadId(state.next_thread_id);
        state.next_thread_id += 1;

        let root = state
            .scopes
            .alloc_thread_root(id, parent, state.timestep, parent_action_id);
        let thread = TesterThread::new(id, level, root);
        let sem = thread.semaphore();
        state.threads.insert(id, thread);
        state.all_threads.insert(id);

        let shared = Arc::clone(self);
        let handle = match thread::Builder::new()
            .name(format!("stimulus-{}", id.0))
            .spawn(move || thread_main(shared, id, sem, body))
        {
            Ok(handle) => handle,
            Err(e) => {
                state.threads.remove(&id);
                state.all_threads.remove(&id);
                return Err(Error::Spawn(e));
            }
        };
        self.handles
            .lock()
            .map_err(|e| Error::LockError(format!("handle table lock poisoned: {e}")))?
            .push(handle);

        debug!(%id, level, "thread created");
        Ok(id)
    }

    fn scope_info(&self, scope: ScopeId) -> Result<ScopeInfo> {
        let state = self.lock_state()?;
        Ok(match state.scopes.get(scope) {
            Scope::Root => ScopeInfo {
                parent: None,
                opened_step: 0,
                parent_action_id: 0,
                next_action_id: 0,
                closed_step: None,
            },
            Scope::ThreadRoot {
                parent,
                opened_step,
                parent_action_id,
                ..
            } => ScopeInfo {
                parent: Some(*parent),
                opened_step: *opened_step,
                parent_action_id: *parent_action_id,
                next_action_id: 0,
                closed_step: None,
            },
            Scope::Timescope(data) => ScopeInfo {
                parent: Some(data.parent),
                opened_step: data.opened_step,
                parent_action_id: data.parent_action_id,
                next_action_id: data.next_action_id,
                closed_step: data.closed_step,
            },
        })
    }
}

/// Snapshot of a scope's bookkeeping, for stimulus-side introspection and
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeInfo {
    /// Enclosing scope, `None` for the root.
    pub parent: Option<ScopeId>,
    /// Timestep at which the scope was opened.
    pub opened_step: u64,
    /// Action id consumed in the parent when this scope was opened.
    pub parent_action_id: u64,
    /// Next action id the scope will hand out.
    pub next_action_id: u64,
    /// Timestep at which the scope was closed, if it has been.
    pub closed_step: Option<u64>,
}

/// Driver-side handle to the tester core.
///
/// # Example
///
/// ```ignore
/// let mut design = DesignInfo::new();
/// design.name(SignalId(0), "io_in");
///
/// let tester = Tester::new(design, TableSimulator::new());
/// let t0 = tester.spawn(|ctx| {
///     ctx.poke(SignalId(0), SignalValue(1))?;
///     ctx.step(ClockId(0))
/// })?;
///
/// let blocked = tester.run_threads(&[t0])?;
/// tester.timestep()?;
/// // ... advance the simulator clock, then resume blocked[&ClockId(0)]
/// ```
pub struct Tester {
    shared: Arc<Shared>,
}

impl Tester {
    /// Create a tester over a design description and a simulator bridge.
    pub fn new(design: DesignInfo, sim: impl Simulator + 'static) -> Self {
        Tester {
            shared: Arc::new(Shared {
                state: Mutex::new(CoreState {
                    scopes: ScopeArena::new(),
                    threads: FxHashMap::default(),
                    all_threads: FxHashSet::default(),
                    sched: SchedulerState::new(),
                    log: ActionLog::new(),
                    timestep: 0,
                    next_thread_id: 0,
                }),
                driver: Semaphore::new(0),
                failures: SegQueue::new(),
                design,
                sim: Mutex::new(Box::new(sim)),
                shutting_down: AtomicBool::new(false),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a top-level (level 0) stimulus thread. The thread parks until
    /// it is first submitted to [`Tester::run_threads`].
    pub fn spawn(
        &self,
        body: impl FnOnce(&Context) -> Result<()> + Send + 'static,
    ) -> Result<ThreadId> {
        let mut state = self.shared.lock_state()?;
        if state.sched.current().is_some() {
            return Err(invariant_error!("spawn while a stimulus thread holds the cpu"));
        }
        self.shared
            .create_thread(&mut state, ScopeId::ROOT, 0, 0, Box::new(body))
    }

    /// Run one execution phase over the given threads.
    ///
    /// Threads are grouped into per-level FIFO queues and dispatched from
    /// the deepest level down; the call returns once every submitted thread
    /// has finished or parked on a clock edge. The returned map tells the
    /// driver which threads wait on which clock; after advancing simulated
    /// time it passes the resumed ones back into the next call.
    ///
    /// # Errors
    ///
    /// Returns the first failure any stimulus thread raised during the
    /// phase. Later failures stay queued and surface on following calls.
    /// Scheduler state is reset either way, so the next phase starts clean.
    pub fn run_threads(
        &self,
        threads: &[ThreadId],
    ) -> Result<FxHashMap<ClockId, Vec<ThreadId>>> {
        {
            let mut state = self.shared.lock_state()?;
            if !state.sched.is_idle() {
                return Err(invariant_error!("run_threads requires an idle scheduler"));
            }
            for &id in threads {
                let (level, done) = {
                    let thread = thread_ref(&state, id)?;
                    (thread.level(), thread.is_done())
                };
                if done {
                    return Err(invariant_error!("run_threads on finished thread {id}"));
                }
                state.sched.submit(id, level);
            }
            debug!(count = threads.len(), "execution phase start");
            self.shared.hand_off(state)?;
        }

        self.shared.driver.acquire()?;

        let blocked = {
            let mut state = self.shared.lock_state()?;
            let blocked = state.sched.take_blocked();
            state.sched.reset();
            blocked
        };
        if let Some(failure) = self.shared.failures.pop() {
            return Err(failure);
        }
        debug!(blocked_clocks = blocked.len(), "execution phase complete");
        Ok(blocked)
    }

    /// Run the end-of-timestep checks.
    ///
    /// Prunes closed timescopes from the active-poke lists, reports
    /// multi-writer and peek-after-poke conflicts for the timestep just
    /// ended, and forgets all recorded peeks. Peek conflicts propagate
    /// through registered combinational fan-in: peeking an output counts as
    /// peeking each of its inputs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] carrying every finding, sorted by signal
    /// name. Peeks are cleared even when conflicts are reported.
    pub fn timestep(&self) -> Result<()> {
        let mut state = self.shared.lock_state()?;
        let CoreState {
            ref scopes,
            ref mut log,
            timestep: step,
            ..
        } = *state;

        // closed scopes no longer drive anything
        log.prune(|scope| scopes.is_open(scope));

        let mut findings: Vec<(SignalId, ConflictKind)> = Vec::new();

        for (signal, drivers) in log.iter_active() {
            let fresh: Vec<ScopeId> = drivers
                .iter()
                .copied()
                .filter(|&scope| {
                    scopes
                        .timescope(scope)
                        .and_then(|data| data.pokes.get(&signal))
                        .is_some_and(|poke| poke.timestep == step)
                })
                .collect();
            if fresh.len() < 2 {
                continue;
            }
            let disjoint = fresh.iter().any(|&a| {
                fresh
                    .iter()
                    .any(|&b| a != b && !scopes.chain_contains(a, b) && !scopes.chain_contains(b, a))
            });
            if disjoint {
                let sites = fresh
                    .iter()
                    .filter_map(|&scope| Some(scopes.timescope(scope)?.pokes.get(&signal)?.site))
                    .collect();
                findings.push((signal, ConflictKind::MultipleDrivers { sites }));
            }
        }

        for (signal, peeks) in log.iter_peeks() {
            let mut targets = vec![signal];
            if let Some(fan_in) = self.shared.design.fan_in(signal) {
                targets.extend(fan_in.iter().copied());
            }
            for peek in peeks {
                for &target in &targets {
                    let Some((driver_scope, poke)) = live_driver(scopes, log, target) else {
                        continue;
                    };
                    if poke.timestep != peek.timestep {
                        continue;
                    }
                    let Some(poker) = scopes.owner(driver_scope) else {
                        continue;
                    };
                    if !scopes.lineage_contains(peek.scope, poker) {
                        findings.push((
                            target,
                            ConflictKind::PeekAfterPoke {
                                poke: poke.site,
                                peek: peek.site,
                            },
                        ));
                    }
                }
            }
        }

        log.clear_peeks();

        if findings.is_empty() {
            return Ok(());
        }
        let design = &self.shared.design;
        let mut conflicts: Vec<Conflict> = findings
            .into_iter()
            .map(|(signal, kind)| Conflict {
                signal: design.signal_name(signal),
                kind,
            })
            .collect();
        conflicts.sort_by(|a, b| a.signal.cmp(&b.signal));
        let report = ConflictReport { conflicts };
        debug!(%report, "timestep conflicts");
        Err(Error::Conflict(report))
    }

    /// The current timestep.
    pub fn current_timestep(&self) -> Result<u64> {
        Ok(self.shared.lock_state()?.timestep)
    }

    /// Assign the current timestep. Owned by the driver; stimulus threads
    /// only ever read it.
    pub fn set_timestep(&self, step: u64) -> Result<()> {
        self.shared.lock_state()?.timestep = step;
        Ok(())
    }

    /// Push an externally raised failure onto the queue drained by
    /// [`Tester::run_threads`].
    pub fn on_exception(&self, err: Error) {
        self.shared.failures.push(err);
    }

    /// Snapshot a scope's bookkeeping.
    pub fn scope_info(&self, scope: ScopeId) -> Result<ScopeInfo> {
        self.shared.scope_info(scope)
    }
}

impl Drop for Tester {
    /// Abort every remaining stimulus thread and join the OS threads.
    /// Parked threads wake, observe the teardown flag, and unwind without
    /// touching core state — an aborted test's drive state is not reverted.
    fn drop(&mut self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        if let Ok(state) = self.shared.lock_state() {
            for thread in state.threads.values() {
                let _ = thread.semaphore().release();
            }
        }
        let handles = match self.shared.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Stimulus-side handle, passed to every thread body.
///
/// All operations check that the calling thread actually holds the virtual
/// CPU; an operation invoked from anywhere else is an invariant violation.
pub struct Context {
    shared: Arc<Shared>,
    thread: ThreadId,
}

impl Context {
    /// Identifier of the thread this context belongs to.
    #[must_use]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    fn checked_state(&self) -> Result<MutexGuard<'_, CoreState>> {
        let state = self.shared.lock_state()?;
        if state.sched.current() != Some(self.thread) {
            return Err(invariant_error!(
                "thread {} acted without holding the virtual cpu",
                self.thread
            ));
        }
        Ok(state)
    }

    /// Drive a signal from the innermost open timescope.
    ///
    /// Overwrites the scope's previous poke on the same signal; the drive
    /// lasts until the scope closes or an inner scope overrides it.
    #[track_caller]
    pub fn poke(&self, signal: SignalId, value: SignalValue) -> Result<()> {
        let site = CallSite::capture();
        let mut state = self.checked_state()?;
        let step = state.timestep;
        let top = open_top(&state, self.thread)?;
        let serial = state.log.next_serial();
        let data = state
            .scopes
            .timescope_mut(top)
            .ok_or_else(|| invariant_error!("poke outside a timescope"))?;
        let action_id = data.next_action_id;
        data.next_action_id += 1;
        data.pokes.insert(
            signal,
            PokeRecord {
                timestep: step,
                action_id,
                serial,
                value,
                site,
            },
        );
        state.log.record_poke(signal, top);
        drop(state);
        self.shared.with_sim(|sim| sim.set(signal, value))?;
        trace!(%signal, %value, "poke");
        Ok(())
    }

    /// Read a signal's present value.
    #[track_caller]
    pub fn peek(&self, signal: SignalId) -> Result<SignalValue> {
        let site = CallSite::capture();
        let mut state = self.checked_state()?;
        let step = state.timestep;
        let top = open_top(&state, self.thread)?;
        let data = state
            .scopes
            .timescope_mut(top)
            .ok_or_else(|| invariant_error!("peek outside a timescope"))?;
        let action_id = data.next_action_id;
        data.next_action_id += 1;
        state.log.record_peek(
            signal,
            PeekRecord {
                scope: top,
                timestep: step,
                action_id,
                site,
            },
        );
        drop(state);
        self.shared.with_sim(|sim| sim.get(signal))
    }

    /// Open a timescope nested in the current one.
    pub fn new_timescope(&self) -> Result<ScopeId> {
        self.open_scope(false)
    }

    fn open_scope(&self, initial: bool) -> Result<ScopeId> {
        let mut state = self.checked_state()?;
        let step = state.timestep;
        let parent = thread_ref(&state, self.thread)?.top();
        let parent_action_id = if initial {
            match state.scopes.get(parent) {
                Scope::ThreadRoot { .. } => 0,
                _ => {
                    return Err(invariant_error!(
                        "thread {} opened its root timescope twice",
                        self.thread
                    ))
                }
            }
        } else {
            match state.scopes.timescope_mut(parent) {
                Some(data) if data.closed_step.is_none() => {
                    let action = data.next_action_id;
                    data.next_action_id += 1;
                    action
                }
                _ => {
                    return Err(invariant_error!(
                        "new_timescope requires an open timescope on top of the stack"
                    ))
                }
            }
        };
        let scope = state
            .scopes
            .alloc_timescope(parent, self.thread, step, parent_action_id);
        thread_mut(&mut state, self.thread)?.set_top(scope);
        trace!(thread = %self.thread, %scope, "timescope opened");
        Ok(scope)
    }

    /// Close the innermost timescope and revert its pokes.
    ///
    /// For every signal the scope drove, the live value reverts to the
    /// nearest enclosing drive — searching across thread roots into the
    /// spawning thread — or is released when no enclosing drive exists. The
    /// returned map records that decision per signal; the simulator bridge
    /// has already been told by the time this returns.
    pub fn close_timescope(
        &self,
        scope: ScopeId,
    ) -> Result<FxHashMap<SignalId, Option<SignalValue>>> {
        let mut state = self.checked_state()?;
        let step = state.timestep;
        if thread_ref(&state, self.thread)?.top() != scope {
            return Err(invariant_error!(
                "only the innermost timescope can be closed"
            ));
        }
        let (parent, poked) = match state.scopes.timescope_mut(scope) {
            Some(data) if data.closed_step.is_none() => {
                data.closed_step = Some(step);
                (data.parent, data.pokes.keys().copied().collect::<Vec<_>>())
            }
            _ => {
                return Err(invariant_error!(
                    "close of {scope} which is not an open timescope"
                ))
            }
        };
        thread_mut(&mut state, self.thread)?.set_top(parent);

        let mut reverts = FxHashMap::default();
        for signal in poked {
            reverts.insert(signal, state.scopes.revert_value(parent, signal));
        }
        drop(state);

        self.shared.with_sim(|sim| {
            for (&signal, value) in &reverts {
                match value {
                    Some(value) => sim.set(signal, *value),
                    None => sim.release(signal),
                }
            }
        })?;
        trace!(thread = %self.thread, %scope, reverted = reverts.len(), "timescope closed");
        Ok(reverts)
    }

    /// Open a timescope, run `body`, and close the scope on both normal
    /// and error exit.
    pub fn with_timescope<R>(&self, body: impl FnOnce(&Context) -> Result<R>) -> Result<R> {
        let scope = self.new_timescope()?;
        let result = body(self);
        let closed = self.close_timescope(scope);
        match (result, closed) {
            (Ok(value), Ok(_)) => Ok(value),
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
        }
    }

    /// Fork a child thread one level deeper than the caller.
    ///
    /// The child's scope stack chains into the caller's innermost
    /// timescope, so it inherits the caller's drive state. The caller keeps
    /// running; the child is queued behind the scheduler's current dispatch
    /// queue and runs to its first suspension once the caller yields.
    pub fn fork(
        &self,
        body: impl FnOnce(&Context) -> Result<()> + Send + 'static,
    ) -> Result<ThreadId> {
        let mut state = self.checked_state()?;
        let (level, parent) = {
            let me = thread_ref(&state, self.thread)?;
            (me.level() + 1, me.top())
        };
        // the fork consumes an action id in the spawning scope
        let parent_action_id = match state.scopes.timescope_mut(parent) {
            Some(data) if data.closed_step.is_none() => {
                let action = data.next_action_id;
                data.next_action_id += 1;
                action
            }
            _ => return Err(invariant_error!("fork requires an open timescope")),
        };
        let id =
            self.shared
                .create_thread(&mut state, parent, level, parent_action_id, Box::new(body))?;
        state.sched.enqueue_at_current(id)?;
        debug!(parent = %self.thread, child = %id, level, "fork");
        Ok(id)
    }

    /// Wait until `target` finishes.
    ///
    /// Only threads at a strictly shallower level may join a target; this
    /// keeps waits acyclic by construction. Returns immediately when the
    /// target already finished.
    pub fn join(&self, target: ThreadId) -> Result<()> {
        let sem;
        {
            let mut state = self.checked_state()?;
            let (my_level, my_sem) = {
                let me = thread_ref(&state, self.thread)?;
                (me.level(), me.semaphore())
            };
            let target_thread = thread_ref(&state, target)?;
            if my_level >= target_thread.level() {
                return Err(invariant_error!(
                    "join must target a deeper thread: level {my_level} cannot wait on level {}",
                    target_thread.level()
                ));
            }
            if target_thread.is_done() {
                return Ok(());
            }
            state.sched.add_waiter(target, self.thread);
            debug!(waiter = %self.thread, %target, "join");
            self.shared.hand_off(state)?;
            sem = my_sem;
        }
        self.shared.park(&sem)
    }

    /// Park until the driver advances `clock` by one edge.
    ///
    /// The thread reappears in the map [`Tester::run_threads`] returns;
    /// resuming it is the driver's decision.
    pub fn step(&self, clock: ClockId) -> Result<()> {
        let sem;
        {
            let mut state = self.checked_state()?;
            sem = thread_ref(&state, self.thread)?.semaphore();
            state.sched.block_on(clock, self.thread);
            trace!(thread = %self.thread, %clock, "blocked on clock edge");
            self.shared.hand_off(state)?;
        }
        self.shared.park(&sem)
    }

    /// Snapshot a scope's bookkeeping.
    pub fn scope_info(&self, scope: ScopeId) -> Result<ScopeInfo> {
        self.shared.scope_info(scope)
    }
}

fn thread_ref<'a>(state: &'a CoreState, id: ThreadId) -> Result<&'a TesterThread> {
    state
        .threads
        .get(&id)
        .ok_or_else(|| invariant_error!("unknown thread {id}"))
}

fn thread_mut<'a>(state: &'a mut CoreState, id: ThreadId) -> Result<&'a mut TesterThread> {
    state
        .threads
        .get_mut(&id)
        .ok_or_else(|| invariant_error!("unknown thread {id}"))
}

/// Innermost scope of `thread`, which must be an open timescope.
fn open_top(state: &CoreState, thread: ThreadId) -> Result<ScopeId> {
    let top = thread_ref(state, thread)?.top();
    if state.scopes.is_open(top) {
        Ok(top)
    } else {
        Err(invariant_error!("thread {thread} has no open timescope"))
    }
}

/// The open scope whose poke currently drives `signal`, with the poke.
/// Resolved by poke serial: the most recent live poke wins.
fn live_driver<'a>(
    scopes: &'a ScopeArena,
    log: &'a ActionLog,
    signal: SignalId,
) -> Option<(ScopeId, &'a PokeRecord)> {
    log.active_scopes(signal)
        .iter()
        .copied()
        .filter(|&scope| scopes.is_open(scope))
        .filter_map(|scope| {
            scopes
                .timescope(scope)?
                .pokes
                .get(&signal)
                .map(|poke| (scope, poke))
        })
        .max_by_key(|(_, poke)| poke.serial)
}

/// Requeue join waiters and drop the finished thread from the live set.
fn thread_finished(state: &mut CoreState, id: ThreadId) -> Result<()> {
    state.all_threads.remove(&id);
    let level = thread_ref(state, id)?.level();
    let waiters = state.sched.take_waiters(id);
    for waiter in waiters {
        let waiter_level = thread_ref(state, waiter)?.level();
        if waiter_level >= level {
            return Err(invariant_error!(
                "join waiter {waiter} at level {waiter_level} must be shallower than finished thread {id} at level {level}"
            ));
        }
        state.sched.enqueue(waiter, waiter_level);
    }
    Ok(())
}

/// Body of the OS thread backing one stimulus thread.
fn thread_main(shared: Arc<Shared>, id: ThreadId, sem: Arc<Semaphore>, body: ThreadBody) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_thread(&shared, id, &sem, body)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            shared.failures.push(e);
            finish_abnormal(&shared);
        }
        Err(payload) => {
            if payload.downcast_ref::<Teardown>().is_some() {
                // killed during teardown: swallowed, no handoff
                return;
            }
            shared.failures.push(Error::Panicked(panic_message(payload.as_ref())));
            finish_abnormal(&shared);
        }
    }
}

/// Normal-path thread lifecycle: park for the first dispatch, open the
/// root timescope, run the stimulus, unwind, and hand the CPU on.
fn run_thread(shared: &Arc<Shared>, id: ThreadId, sem: &Semaphore, body: ThreadBody) -> Result<()> {
    shared.park(sem)?;

    let ctx = Context {
        shared: Arc::clone(shared),
        thread: id,
    };
    let root = ctx.open_scope(true)?;
    body(&ctx)?;
    ctx.close_timescope(root)?;

    let mut state = shared.lock_state()?;
    {
        let me = thread_mut(&mut state, id)?;
        if me.top() != me.bottom() {
            return Err(invariant_error!("thread {id} finished with open timescopes"));
        }
        me.mark_done();
    }
    thread_finished(&mut state, id)?;
    debug!(thread = %id, "thread finished");
    shared.hand_off(state)?;
    Ok(())
}

/// Error-path exit: the failure is already queued; the thread is neither
/// marked done nor unwound — just pass the CPU on so the driver can see
/// the failure.
fn finish_abnormal(shared: &Shared) {
    match shared.lock_state() {
        Ok(state) => {
            let _ = shared.hand_off(state);
        }
        Err(_) => {
            let _ = shared.driver.release();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
