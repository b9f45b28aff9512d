//! Call-site capture for action diagnostics.
//!
//! Every poke and peek records where in the stimulus it happened. When a
//! timestep boundary detects conflicting accesses, these locations are what
//! the report prints — the alternative is telling the user "two of your
//! threads disagree" with no way to find either one.

use std::fmt;
use std::panic::Location;

/// Source location of a poke or peek, captured at the call site.
///
/// Captured with `#[track_caller]`, so the location is the stimulus line
/// that invoked the operation, not a frame inside this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallSite {
    file: &'static str,
    line: u32,
    column: u32,
}

impl CallSite {
    /// Capture the caller's source location.
    #[track_caller]
    #[must_use]
    pub fn capture() -> Self {
        let location = Location::caller();
        CallSite {
            file: location.file(),
            line: location.line(),
            column: location.column(),
        }
    }

    /// Source file of the call.
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.file
    }

    /// Line number of the call.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_points_at_caller() {
        let site = CallSite::capture();
        assert!(site.file().ends_with("trace.rs"));
        assert!(site.line() > 0);
    }

    #[test]
    fn test_display_format() {
        let site = CallSite::capture();
        let text = site.to_string();
        assert!(text.contains("trace.rs:"));
    }
}
