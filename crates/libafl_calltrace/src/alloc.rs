//! Shadow table of the traced code's live heap and `mmap` allocations.
//!
//! Fed by the C runtime decoders. Lets pointer arguments be attributed to the allocation
//! they point into, and dumps an allocation's contents when it is released.

use core::{fmt, ops::RangeInclusive};
use std::io::Write;

use rangemap::RangeInclusiveMap;
use serde::{Deserialize, Serialize};

use crate::{memory::MemoryReader, render::read_buffer_hexdump_from_address};

/// A live allocation, `start..=end` with `end = start + size`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationRecord {
    /// Sequence number, counting every accepted allocation
    pub index: u64,
    /// First byte
    pub start: u64,
    /// `start + size`
    pub end: u64,
}

impl AllocationRecord {
    /// Requested size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// The allocation shadow table. No two live records ever overlap.
#[derive(Default)]
pub struct AllocationTable {
    allocations: RangeInclusiveMap<u64, AllocationRecord>,
    next_index: u64,
    dump_sink: Option<Box<dyn Write>>,
}

impl fmt::Debug for AllocationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationTable")
            .field("live", &self.len())
            .field("next_index", &self.next_index)
            .field("dumping", &self.dump_sink.is_some())
            .finish()
    }
}

impl AllocationTable {
    /// An empty table without a dump sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty table hex-dumping every released allocation to `sink`
    #[must_use]
    pub fn with_dump_sink(sink: Box<dyn Write>) -> Self {
        Self {
            dump_sink: Some(sink),
            ..Self::default()
        }
    }

    /// Tracks `[address, address + size]`. Rejects the allocation if it overlaps a live one.
    pub fn add(&mut self, address: u64, size: u64) -> bool {
        let Some(end) = address.checked_add(size) else {
            log::debug!("allocation at {address:#x} with size {size:#x} overflows");
            return false;
        };
        let range: RangeInclusive<u64> = address..=end;
        if self.allocations.overlaps(&range) {
            log::debug!("allocation {address:#x}-{end:#x} overlaps a tracked one, dropped");
            return false;
        }
        let record = AllocationRecord {
            index: self.next_index,
            start: address,
            end,
        };
        self.next_index += 1;
        self.allocations.insert(range, record);
        true
    }

    /// Stops tracking the allocation starting exactly at `address`.
    ///
    /// With a dump sink, the allocation's bytes are hex-dumped to it first, while `memory`
    /// still holds them.
    pub fn remove(&mut self, address: u64, memory: &dyn MemoryReader) -> bool {
        let Some(record) = self.allocations.get(&address).copied() else {
            return false;
        };
        if record.start != address {
            return false;
        }
        if let Some(sink) = self.dump_sink.as_mut() {
            let dump = read_buffer_hexdump_from_address(memory, record.start, record.size() as usize);
            let written = writeln!(
                sink,
                "release alloc#{} {:#x}-{:#x} ({} bytes)\n{dump}",
                record.index,
                record.start,
                record.end,
                record.size()
            )
            .and_then(|()| sink.flush());
            if let Err(err) = written {
                log::warn!("Could not write allocation dump: {err}");
            }
        }
        self.allocations.remove(record.start..=record.end);
        true
    }

    /// Whether `address` lies inside a live allocation (bounds inclusive)
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        self.allocations.contains_key(&address)
    }

    /// `(offset, index)` of `address` inside the allocation containing it
    #[must_use]
    pub fn offset_of(&self, address: u64) -> Option<(u64, u64)> {
        self.allocations
            .get(&address)
            .map(|record| (address - record.start, record.index))
    }

    /// The live allocation containing `address`
    #[must_use]
    pub fn get(&self, address: u64) -> Option<&AllocationRecord> {
        self.allocations.get(&address)
    }

    /// Live allocations, ordered by address
    pub fn iter(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.allocations.iter().map(|(_, record)| record)
    }

    /// Number of live allocations
    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.iter().count()
    }

    /// No live allocations
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.iter().next().is_none()
    }
}
