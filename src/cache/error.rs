//! Error taxonomy shared by every cache operation.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Malformed sizes or parameters. Not retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An append was attempted without reserved capacity. This is a contract
    /// violation by the caller, not a recoverable condition.
    #[error("Capacity exceeded: need {required} slots, have {capacity}")]
    CapacityExceeded { required: usize, capacity: usize },

    /// Storage for the requested slot count could not be allocated.
    #[error("Allocation failure: could not allocate {slots} slots ({elements} elements)")]
    AllocationFailure { slots: usize, elements: usize },
}

impl CacheError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        CacheError::InvalidArgument(msg.into())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
