//! Result type definition and extension traits.

use crate::error::Error;

/// The standard Result type for bpfsync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing logging combinators for Results.
///
/// Used where a failure is tolerable (best-effort caches) but should still
/// leave a trace.
pub trait ResultExt<T> {
    /// Convert a Result to an Option, logging the error at warn level.
    fn into_option_logged(self) -> Option<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn into_option_logged(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring failed operation");
                None
            }
        }
    }
}
