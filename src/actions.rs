//! Per-signal action log and conflict records.
//!
//! The log is the metadata layer conflict detection runs on: which
//! timescopes currently drive each signal, and every peek observed since
//! the last timestep boundary. It stores no signal values of its own — the
//! values live in the timescopes and in the simulator.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::scope::ScopeId;
use crate::signal::{SignalId, SignalValue};
use crate::trace::CallSite;

/// A recorded poke. Stored as the latest-poke entry of the timescope that
/// made it.
#[derive(Debug, Clone, Copy)]
pub struct PokeRecord {
    /// Timestep at which the poke happened.
    pub timestep: u64,
    /// Action id within the poking scope.
    pub action_id: u64,
    /// Core-global poke ordinal. Action ids only order actions within one
    /// scope; the serial totally orders pokes across threads, which is what
    /// "currently driving" resolves against.
    pub serial: u64,
    /// The driven value.
    pub value: SignalValue,
    /// Stimulus call site, for conflict reports.
    pub site: CallSite,
}

/// A recorded peek. Unlike pokes, every peek of a signal is kept until the
/// next timestep boundary.
#[derive(Debug, Clone, Copy)]
pub struct PeekRecord {
    /// Innermost timescope of the peeking thread at the time of the peek.
    pub scope: ScopeId,
    /// Timestep at which the peek happened.
    pub timestep: u64,
    /// Action id within the peeking scope.
    pub action_id: u64,
    /// Stimulus call site, for conflict reports.
    pub site: CallSite,
}

/// Per-signal action bookkeeping for one test run.
#[derive(Debug, Default)]
pub struct ActionLog {
    /// Timescopes with an unreverted poke per signal, in first-poke order,
    /// without duplicates.
    active_pokes: FxHashMap<SignalId, Vec<ScopeId>>,
    /// Peeks observed since the last timestep boundary.
    signal_peeks: FxHashMap<SignalId, Vec<PeekRecord>>,
    next_serial: u64,
}

impl ActionLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        ActionLog::default()
    }

    /// Hand out the next poke serial.
    pub fn next_serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    /// Note that `scope` drives `signal`. Idempotent per (signal, scope).
    pub fn record_poke(&mut self, signal: SignalId, scope: ScopeId) {
        let scopes = self.active_pokes.entry(signal).or_default();
        if !scopes.contains(&scope) {
            scopes.push(scope);
        }
    }

    /// Append a peek record for `signal`.
    pub fn record_peek(&mut self, signal: SignalId, record: PeekRecord) {
        self.signal_peeks.entry(signal).or_default().push(record);
    }

    /// Timescopes currently registered as driving `signal`.
    #[must_use]
    pub fn active_scopes(&self, signal: SignalId) -> &[ScopeId] {
        self.active_pokes
            .get(&signal)
            .map_or(&[], |scopes| scopes.as_slice())
    }

    /// Iterate over all signals with registered drivers.
    pub fn iter_active(&self) -> impl Iterator<Item = (SignalId, &[ScopeId])> {
        self.active_pokes
            .iter()
            .map(|(signal, scopes)| (*signal, scopes.as_slice()))
    }

    /// Iterate over all signals with recorded peeks.
    pub fn iter_peeks(&self) -> impl Iterator<Item = (SignalId, &[PeekRecord])> {
        self.signal_peeks
            .iter()
            .map(|(signal, peeks)| (*signal, peeks.as_slice()))
    }

    /// Drop driver registrations that `keep` rejects, and any signal left
    /// with no drivers.
    pub fn prune(&mut self, keep: impl Fn(ScopeId) -> bool) {
        for scopes in self.active_pokes.values_mut() {
            scopes.retain(|&scope| keep(scope));
        }
        self.active_pokes.retain(|_, scopes| !scopes.is_empty());
    }

    /// Forget all recorded peeks. Called at every timestep boundary.
    pub fn clear_peeks(&mut self) {
        self.signal_peeks.clear();
    }
}

/// One conflict finding from a timestep boundary check.
#[derive(Debug)]
pub struct Conflict {
    /// Display name of the affected signal.
    pub signal: String,
    /// What went wrong.
    pub kind: ConflictKind,
}

/// The two kinds of cross-thread ordering violation the boundary check
/// detects. The checks are independent of each other.
#[derive(Debug)]
pub enum ConflictKind {
    /// Concurrent threads on disjoint spawn branches drove the signal in
    /// the same timestep.
    MultipleDrivers {
        /// Call sites of the competing pokes.
        sites: Vec<CallSite>,
    },
    /// A thread peeked the signal in the same timestep as a poke from a
    /// thread outside its spawn ancestry, so the observed value depends on
    /// scheduling order.
    PeekAfterPoke {
        /// Call site of the driving poke.
        poke: CallSite,
        /// Call site of the offending peek.
        peek: CallSite,
    },
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ConflictKind::MultipleDrivers { sites } => {
                write!(f, "{}: driven from multiple threads in one timestep (", self.signal)?;
                for (i, site) in sites.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{site}")?;
                }
                write!(f, ")")
            }
            ConflictKind::PeekAfterPoke { poke, peek } => write!(
                f,
                "{}: peeked at {peek} in the same timestep as a poke from an unrelated thread at {poke}",
                self.signal
            ),
        }
    }
}

/// All conflicts found at one timestep boundary, sorted by signal name.
#[derive(Debug)]
pub struct ConflictReport {
    /// The individual findings.
    pub conflicts: Vec<Conflict>,
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} signal conflict(s):", self.conflicts.len())?;
        for conflict in &self.conflicts {
            write!(f, "\n  {conflict}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_poke_is_idempotent() {
        let mut log = ActionLog::new();
        let x = SignalId(0);
        log.record_poke(x, ScopeId(1));
        log.record_poke(x, ScopeId(2));
        log.record_poke(x, ScopeId(1));

        assert_eq!(log.active_scopes(x), &[ScopeId(1), ScopeId(2)]);
    }

    #[test]
    fn test_prune_drops_empty_signals() {
        let mut log = ActionLog::new();
        let x = SignalId(0);
        let y = SignalId(1);
        log.record_poke(x, ScopeId(1));
        log.record_poke(y, ScopeId(2));

        log.prune(|scope| scope == ScopeId(2));

        assert!(log.active_scopes(x).is_empty());
        assert_eq!(log.active_scopes(y), &[ScopeId(2)]);
        assert_eq!(log.iter_active().count(), 1);
    }

    #[test]
    fn test_serials_are_strictly_increasing() {
        let mut log = ActionLog::new();
        let a = log.next_serial();
        let b = log.next_serial();
        let c = log.next_serial();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_clear_peeks() {
        let mut log = ActionLog::new();
        let x = SignalId(0);
        log.record_peek(
            x,
            PeekRecord {
                scope: ScopeId(1),
                timestep: 0,
                action_id: 0,
                site: CallSite::capture(),
            },
        );
        assert_eq!(log.iter_peeks().count(), 1);

        log.clear_peeks();
        assert_eq!(log.iter_peeks().count(), 0);
    }
}
