use super::vm::VmError;

/// Why an allocation request could not be satisfied.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// Every chunk is in use and the reservation is fully committed.
    /// Recoverable: a later free makes room again.
    #[error("slab of {chunk_size}-byte chunks is exhausted")]
    Exhausted { chunk_size: usize },

    /// Growth needed more pages and the OS refused to back them. The slab is
    /// left exactly as it was before the attempt.
    #[error("slab growth failed: {0}")]
    CommitFailed(#[source] VmError),

    /// An oversized request was forwarded to the heap and the heap refused.
    #[error("heap allocation of {size} bytes failed")]
    HeapFailed { size: usize },

    /// An oversized request with heap fallback disabled.
    #[error("request of {size} bytes exceeds the largest size class ({max} bytes)")]
    TooLarge { size: usize, max: usize },

    /// A lazily built allocator could not be created.
    #[error("allocator unavailable: {0}")]
    Init(#[from] InitError),
}

impl AllocError {
    /// True for the expected, recoverable out-of-chunks case.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Rejected configuration values.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk size must be non-zero")]
    ZeroChunkSize,

    #[error("{field} must be a power of two, got {value}")]
    NotPowerOfTwo { field: &'static str, value: usize },

    #[error("min_chunk ({min}) is larger than max_chunk ({max})")]
    MinAboveMax { min: usize, max: usize },

    #[error("starting size {starting} exceeds capacity {capacity}")]
    StartingAboveCapacity { starting: usize, capacity: usize },

    #[error("{field} ({value}) is not a multiple of the chunk size ({chunk_size})")]
    NotChunkMultiple {
        field: &'static str,
        value: usize,
        chunk_size: usize,
    },

    #[error("initial_chunks must be at least 1")]
    ZeroInitialChunks,

    #[error("initial window of {initial_chunks} x {chunk_size} bytes overflows")]
    CapacityOverflow {
        initial_chunks: usize,
        chunk_size: usize,
    },
}

/// Failure to construct a slab or a dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Vm(#[from] VmError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_commit_failure_keeps_source() {
        let vm_err = VmError::CommitFailed(std::io::Error::other("no pages"));
        let err = AllocError::CommitFailed(vm_err);
        assert!(!err.is_exhausted());
        let source = err.source().expect("source");
        assert!(source.to_string().contains("no pages"));
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            AllocError::Exhausted { chunk_size: 16 }.to_string(),
            "slab of 16-byte chunks is exhausted"
        );
        assert_eq!(
            InitError::from(ConfigError::MinAboveMax { min: 64, max: 8 }).to_string(),
            "invalid configuration: min_chunk (64) is larger than max_chunk (8)"
        );
    }
}
