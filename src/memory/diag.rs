//! Human-readable views of allocator state.
//!
//! Everything here reads public accessors only; nothing in the allocation
//! paths depends on it.

use super::size_class::SizeClassAllocator;
use super::slab::Slab;
use super::vm::VmOps;
use std::fmt;

/// Slabs with more committed bytes than this print a one-line notice
/// instead of a map.
pub const MAX_PRINTABLE_COMMITTED: usize = 16 * 1024;

const CHUNKS_PER_ROW: usize = 64;
const CHUNKS_PER_GROUP: usize = 8;

/// Byte count rendered with a binary unit: `512 bytes`, `4.00 KiB`,
/// `1.50 MiB`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteSize(pub usize);

impl fmt::Display for ByteSize {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

        if self.0 < 1024 {
            return write!(f, "{} bytes", self.0);
        }
        let mut value = self.0 as f64 / 1024.0;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        write!(f, "{value:.2} {}", UNITS[unit])
    }
}

/// Occupancy map of one slab: `I` for a chunk in use, `.` for a free one,
/// 64 chunks per row in groups of 8.
pub struct OccupancyMap<'a, V: VmOps>(pub &'a Slab<V>);

impl<V: VmOps> fmt::Display for OccupancyMap<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slab = self.0;
        writeln!(
            f,
            "{}-byte chunks: {}/{} in use, {} committed of {} reserved",
            slab.chunk_size(),
            slab.chunks_in_use(),
            slab.chunk_count(),
            ByteSize(slab.committed_size()),
            ByteSize(slab.reserved_capacity()),
        )?;

        if slab.committed_size() > MAX_PRINTABLE_COMMITTED {
            return writeln!(f, "(too many chunks to print)");
        }

        for row in (0..slab.chunk_count()).step_by(CHUNKS_PER_ROW) {
            write!(f, "{row:6}:")?;
            let end = (row + CHUNKS_PER_ROW).min(slab.chunk_count());
            for index in row..end {
                if (index - row) % CHUNKS_PER_GROUP == 0 {
                    f.write_str(" ")?;
                }
                let cell = match slab.is_chunk_free(index) {
                    Some(false) => "I",
                    _ => ".",
                };
                f.write_str(cell)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// One line per bucket of a size-class allocator.
pub struct BucketTable<'a, V: VmOps + Clone>(pub &'a SizeClassAllocator<V>);

impl<V: VmOps + Clone> fmt::Display for BucketTable<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>6} {:>10} {:>10} {:>12}",
            "bucket", "chunk", "in use", "committed"
        )?;
        for (k, slab) in self.0.buckets().iter().enumerate() {
            writeln!(
                f,
                "{k:>6} {:>10} {:>10} {:>12}",
                ByteSize(slab.chunk_size()).to_string(),
                slab.chunks_in_use(),
                ByteSize(slab.committed_size()).to_string(),
            )?;
        }
        Ok(())
    }
}
