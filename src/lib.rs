//! simscope — cooperative threading and timescope core for
//! hardware-simulation test drivers.
//!
//! A test driver lets stimulus code poke input signals, peek values, step
//! clocks, fork concurrent stimulus threads, and join them — against a
//! simulator that is sequential and non-reentrant. This crate is the core
//! that makes that safe: it multiplexes stimulus threads onto one virtual
//! CPU with deterministic ordering, scopes signal drives lexically so they
//! revert on exit, and records enough metadata to detect poke/poke and
//! poke/peek races between threads that share combinational fan-in.
//!
//! # Architecture
//!
//! - **Timescopes** ([`scope`]): a parented forest of drive scopes. Closing
//!   a scope reverts its pokes to the nearest enclosing drive or releases
//!   them. A forked thread's stack chains into its spawner's scope, so
//!   children inherit drive state.
//!
//! - **Action log** ([`actions`]): which scopes currently drive each
//!   signal, and every peek since the last timestep boundary, each tagged
//!   with its stimulus call site.
//!
//! - **Cooperative threads** ([`thread`]): one OS thread per stimulus
//!   thread, all but one parked on semaphores. Dispatch is deepest fork
//!   level first, FIFO within a level.
//!
//! - **The tester** ([`tester`]): the driver-side [`Tester`] handle and the
//!   stimulus-side [`Context`] handle tying the above together over a
//!   [`Simulator`] bridge.
//!
//! # Example
//!
//! ```ignore
//! use simscope::{ClockId, DesignInfo, SignalId, SignalValue, TableSimulator, Tester};
//!
//! let mut design = DesignInfo::new();
//! design.name(SignalId(0), "io_in");
//! design.name(SignalId(1), "io_out");
//!
//! let tester = Tester::new(design, TableSimulator::new());
//! let main = tester.spawn(|ctx| {
//!     ctx.with_timescope(|ctx| {
//!         ctx.poke(SignalId(0), SignalValue(1))?;
//!         let child = ctx.fork(|ctx| {
//!             // sees io_in driven to 1 through the spawning scope
//!             ctx.peek(SignalId(0)).map(|_| ())
//!         })?;
//!         ctx.step(ClockId(0))?;
//!         ctx.join(child)
//!     })
//! })?;
//!
//! let blocked = tester.run_threads(&[main])?;
//! tester.timestep()?;
//! // advance simulated time, then resume the threads in `blocked`
//! ```

pub mod actions;
pub mod error;
pub mod scope;
pub mod signal;
pub mod sim;
pub mod tester;
pub mod thread;
pub mod trace;

pub use actions::{Conflict, ConflictKind, ConflictReport};
pub use error::{Error, Result};
pub use scope::ScopeId;
pub use signal::{ClockId, DesignInfo, SignalId, SignalValue};
pub use sim::{Simulator, TableSimulator};
pub use tester::{Context, ScopeInfo, Tester};
pub use thread::ThreadId;
pub use trace::CallSite;
