//! Error classification shared by every subsystem.
//!
//! Each module defines its own error enum; all of them map onto one of the
//! three [`ErrorKind`] categories so callers can react uniformly (reject the
//! input, fix the call order, or back off on resource pressure).

use std::fmt;

/// Broad category of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The arguments were unacceptable: absent or short buffer, out-of-bounds
    /// range, invalid handle, or a capability already held or missing.
    Validation,
    /// The object was in the wrong state for the call: double initialization,
    /// destroy with pending waiters, or access without an owned record.
    State,
    /// Memory or mappings could not be obtained.
    ResourceExhaustion,
}

impl ErrorKind {
    /// Get the category name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::State => "state",
            ErrorKind::ResourceExhaustion => "resource-exhaustion",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::Validation.to_string(), "validation");
        assert_eq!(ErrorKind::State.to_string(), "state");
        assert_eq!(ErrorKind::ResourceExhaustion.to_string(), "resource-exhaustion");
    }
}
