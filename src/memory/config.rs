use super::error::ConfigError;

/// Committed bytes a slab keeps after [`ResetPolicy::Shrink`]'s bulk reset
/// unless told otherwise.
pub const DEFAULT_RETAIN_AFTER_RESET: usize = 1024 * 1024;

/// Address space reserved per slab by default.
pub const DEFAULT_MAX_CAPACITY: usize = 64 * 1024 * 1024 * 1024;

/// What a bulk reset (`free_all`) does with committed memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Keep every committed page; the next fill needs no commits.
    Keep,
    /// Decommit everything above `retain` bytes (rounded up to a page).
    Shrink { retain: usize },
}

impl Default for ResetPolicy {
    fn default() -> Self {
        Self::Shrink {
            retain: DEFAULT_RETAIN_AFTER_RESET,
        }
    }
}

/// Parameters of a single [`Slab`](super::slab::Slab).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlabConfig {
    /// Bytes per chunk.
    pub chunk_size: usize,
    /// Bytes committed up front. Must hold whole chunks; zero chunks makes a
    /// degenerate slab that reserves nothing and never allocates.
    pub starting_size: usize,
    /// Bytes of address space reserved; committed memory never exceeds it.
    pub max_capacity: usize,
    pub reset: ResetPolicy,
}

impl SlabConfig {
    #[must_use]
    pub fn new(chunk_size: usize, starting_size: usize, max_capacity: usize) -> Self {
        Self {
            chunk_size,
            starting_size,
            max_capacity,
            reset: ResetPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_reset(mut self, reset: ResetPolicy) -> Self {
        self.reset = reset;
        self
    }

    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.starting_size > self.max_capacity {
            return Err(ConfigError::StartingAboveCapacity {
                starting: self.starting_size,
                capacity: self.max_capacity,
            });
        }
        for (field, value) in [
            ("starting_size", self.starting_size),
            ("max_capacity", self.max_capacity),
        ] {
            if !value.is_multiple_of(self.chunk_size) {
                return Err(ConfigError::NotChunkMultiple {
                    field,
                    value,
                    chunk_size: self.chunk_size,
                });
            }
        }
        Ok(())
    }
}

/// Configuration for [`SizeClassAllocator`](super::size_class::SizeClassAllocator).
/// All fields have defaults; set at construction via `with_config()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SizeClassConfig {
    /// Chunk size of bucket 0. Power of two. Default: 8.
    pub min_chunk: usize,

    /// Chunk size of the last bucket; larger requests go to the heap.
    /// Power of two. Default: 32 KiB.
    pub max_chunk: usize,

    /// Chunks committed per bucket at construction. Default: 64.
    pub initial_chunks: usize,

    /// Address space reserved per bucket. Default: 64 GiB.
    pub max_capacity: usize,

    /// Bulk-reset behaviour of every bucket. Default: shrink to 1 MiB.
    pub reset: ResetPolicy,

    /// Forward requests above `max_chunk` to the heap. When false they fail
    /// with `AllocError::TooLarge` and unknown-size frees that no bucket owns
    /// are ignored. Default: true.
    pub heap_fallback: bool,
}

impl Default for SizeClassConfig {
    fn default() -> Self {
        Self {
            min_chunk: 8,
            max_chunk: 32 * 1024,
            initial_chunks: 64,
            max_capacity: DEFAULT_MAX_CAPACITY,
            reset: ResetPolicy::default(),
            heap_fallback: true,
        }
    }
}

impl SizeClassConfig {
    #[must_use]
    pub fn with_chunk_range(mut self, min_chunk: usize, max_chunk: usize) -> Self {
        self.min_chunk = min_chunk;
        self.max_chunk = max_chunk;
        self
    }

    #[must_use]
    pub fn with_max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    /// Number of buckets, one per power of two in `min_chunk..=max_chunk`.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        (self.max_chunk.trailing_zeros() - self.min_chunk.trailing_zeros() + 1) as usize
    }

    /// Slab parameters for bucket `index`.
    #[must_use]
    pub fn slab_config(&self, index: usize) -> SlabConfig {
        let chunk_size = self.min_chunk << index;
        SlabConfig::new(chunk_size, chunk_size * self.initial_chunks, self.max_capacity)
            .with_reset(self.reset)
    }

    /// # Errors
    ///
    /// Returns the first violated constraint, including any the per-bucket
    /// slab configs would fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("min_chunk", self.min_chunk), ("max_chunk", self.max_chunk)] {
            if !value.is_power_of_two() {
                return Err(ConfigError::NotPowerOfTwo { field, value });
            }
        }
        if self.min_chunk > self.max_chunk {
            return Err(ConfigError::MinAboveMax {
                min: self.min_chunk,
                max: self.max_chunk,
            });
        }
        if self.initial_chunks == 0 {
            return Err(ConfigError::ZeroInitialChunks);
        }
        if self.max_chunk.checked_mul(self.initial_chunks).is_none() {
            return Err(ConfigError::CapacityOverflow {
                initial_chunks: self.initial_chunks,
                chunk_size: self.max_chunk,
            });
        }
        // The largest bucket is the tightest: its window is the biggest and a
        // capacity divisible by it is divisible by every smaller power of two.
        self.slab_config(self.bucket_count() - 1).validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SizeClassConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bucket_count(), 13);
        assert_eq!(config.slab_config(0).chunk_size, 8);
        assert_eq!(config.slab_config(0).starting_size, 8 * 64);
        assert_eq!(config.slab_config(12).chunk_size, 32 * 1024);
    }

    #[test]
    fn test_single_bucket_range() {
        let config = SizeClassConfig::default().with_chunk_range(64, 64);
        config.validate().unwrap();
        assert_eq!(config.bucket_count(), 1);
    }

    #[test]
    fn test_rejects_bad_chunk_range() {
        let config = SizeClassConfig::default().with_chunk_range(12, 4096);
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPowerOfTwo {
                field: "min_chunk",
                value: 12
            })
        );

        let config = SizeClassConfig::default().with_chunk_range(4096, 4);
        assert_eq!(
            config.validate(),
            Err(ConfigError::MinAboveMax { min: 4096, max: 4 })
        );
    }

    #[test]
    fn test_rejects_window_above_capacity() {
        // 64 chunks of 4 KiB need 256 KiB.
        let config = SizeClassConfig::default()
            .with_chunk_range(4, 4096)
            .with_max_capacity(128 * 1024);
        assert_eq!(
            config.validate(),
            Err(ConfigError::StartingAboveCapacity {
                starting: 256 * 1024,
                capacity: 128 * 1024
            })
        );
    }

    #[test]
    fn test_rejects_zero_initial_chunks() {
        let config = SizeClassConfig {
            initial_chunks: 0,
            ..SizeClassConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroInitialChunks));
    }

    #[test]
    fn test_slab_config_validation() {
        assert_eq!(
            SlabConfig::new(0, 0, 0).validate(),
            Err(ConfigError::ZeroChunkSize)
        );
        assert_eq!(
            SlabConfig::new(16, 100, 4096).validate(),
            Err(ConfigError::NotChunkMultiple {
                field: "starting_size",
                value: 100,
                chunk_size: 16
            })
        );
        // A zero starting window is allowed: it makes a degenerate slab.
        SlabConfig::new(16, 0, 4096).validate().unwrap();
    }
}
