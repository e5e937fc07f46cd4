//! Error types surfaced by the table and the cache map.

use std::collections::TryReserveError;
use std::fmt;

/// Failure of a structural operation. The operation that returned it had
/// no effect on the map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The bucket array could not be allocated.
    BucketAlloc {
        buckets: usize,
        source: TryReserveError,
    },
    /// The requested bucket count cannot be rounded to a power of two.
    CapacityOverflow { requested: usize },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::BucketAlloc { buckets, source } => {
                write!(f, "failed to allocate {} buckets: {}", buckets, source)
            }
            CacheError::CapacityOverflow { requested } => {
                write!(f, "bucket count {} overflows usize", requested)
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::BucketAlloc { source, .. } => Some(source),
            CacheError::CapacityOverflow { .. } => None,
        }
    }
}

/// Returned by `CacheMap::check_invariants` when internal bookkeeping
/// disagrees with itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantError(String);

impl InvariantError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for InvariantError {}
