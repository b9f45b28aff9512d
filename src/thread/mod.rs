//! Cooperative thread model.
//!
//! Stimulus threads are real OS threads multiplexed onto a single virtual
//! CPU. The pieces:
//!
//! - **Thread state** ([`TesterThread`]): fork level, done flag, the
//!   bottom/top of the thread's timescope stack, and the parking semaphore.
//!
//! - **Scheduling** ([`SchedulerState`]): level-keyed FIFO run queues with
//!   deepest-level-first dispatch, clock-blocked queues, and join waiters.
//!
//! - **Parking** ([`Semaphore`]): the Condvar-based primitive every thread
//!   (and the driver) parks on. At most one permit exists in the whole
//!   system at any time.
//!
//! The actual thread bodies, semaphore handoff, and lifecycle live in the
//! tester module; everything here is state that can be tested without
//! spawning a single OS thread.

mod scheduler;
mod state;
mod sync;

pub use scheduler::{Dispatch, SchedulerState};
pub use state::{TesterThread, ThreadId};
pub use sync::Semaphore;
