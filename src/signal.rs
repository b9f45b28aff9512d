//! Signal identifiers and design metadata.
//!
//! Newtypes for wires, clocks, and carried values prevent silent confusion
//! between the three id spaces. [`DesignInfo`] is the read-only description
//! of the design under test that conflict checking consults: human-readable
//! wire names for diagnostics and combinational fan-in sets for same-cycle
//! conflict propagation.

use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};

/// Identifier of a pokeable or peekable wire in the design under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(pub u32);

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "signal#{}", self.0)
    }
}

/// Identifier of a clock in the design under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClockId(pub u32);

impl fmt::Display for ClockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clock#{}", self.0)
    }
}

/// Value carried by a signal.
///
/// Wires wider than 64 bits are out of scope for the core; the bridge owns
/// any wider encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalValue(pub u64);

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Static metadata about the design under test.
///
/// Built once by the harness that elaborated the design, then handed to the
/// tester and never mutated again. The core reads two things from it: wire
/// names (for conflict reports) and combinational fan-in (so a peek of an
/// output is treated as a peek of each input it depends on).
#[derive(Debug, Default)]
pub struct DesignInfo {
    data_names: FxHashMap<SignalId, String>,
    combinational_paths: FxHashMap<SignalId, FxHashSet<SignalId>>,
}

impl DesignInfo {
    /// Create an empty design description.
    #[must_use]
    pub fn new() -> Self {
        DesignInfo::default()
    }

    /// Register a human-readable name for a wire.
    pub fn name(&mut self, signal: SignalId, name: impl Into<String>) {
        self.data_names.insert(signal, name.into());
    }

    /// Register a combinational dependency of `output` on `input`.
    ///
    /// The fan-in sets are consumed as given; a harness that wants deep
    /// propagation registers the transitive closure.
    pub fn comb_path(&mut self, output: SignalId, input: SignalId) {
        self.combinational_paths
            .entry(output)
            .or_default()
            .insert(input);
    }

    /// Display name for a wire, falling back to the numeric id.
    #[must_use]
    pub fn signal_name(&self, signal: SignalId) -> String {
        self.data_names
            .get(&signal)
            .cloned()
            .unwrap_or_else(|| signal.to_string())
    }

    /// Combinational fan-in of a wire, if any was registered.
    #[must_use]
    pub fn fan_in(&self, signal: SignalId) -> Option<&FxHashSet<SignalId>> {
        self.combinational_paths.get(&signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_name_fallback() {
        let mut design = DesignInfo::new();
        design.name(SignalId(0), "io_in");

        assert_eq!(design.signal_name(SignalId(0)), "io_in");
        assert_eq!(design.signal_name(SignalId(7)), "signal#7");
    }

    #[test]
    fn test_comb_path_accumulates() {
        let mut design = DesignInfo::new();
        design.comb_path(SignalId(2), SignalId(0));
        design.comb_path(SignalId(2), SignalId(1));

        let fan_in = design.fan_in(SignalId(2)).unwrap();
        assert_eq!(fan_in.len(), 2);
        assert!(fan_in.contains(&SignalId(0)));
        assert!(design.fan_in(SignalId(0)).is_none());
    }
}
