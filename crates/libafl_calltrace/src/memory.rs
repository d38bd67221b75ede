//! Reading the traced process' memory.

use std::{
    collections::BTreeMap,
    os::fd::{AsRawFd, OwnedFd},
};

use crate::Error;

/// Read access to the memory of the traced code
pub trait MemoryReader {
    /// Reads `buf.len()` bytes at `address` without checking readability first.
    ///
    /// Callers that cannot vouch for `address` must check [`MemoryReader::is_readable`] first.
    fn read_bytes(&self, address: u64, buf: &mut [u8]);

    /// Whether the whole range `[address, address + len)` can be read
    fn is_readable(&self, address: u64, len: usize) -> bool;

    /// Reads a little-endian word of `width` bytes (at most 8)
    fn read_word(&self, address: u64, width: usize) -> u64 {
        let mut buf = [0u8; 8];
        let width = width.min(8);
        self.read_bytes(address, &mut buf[..width]);
        u64::from_le_bytes(buf)
    }

    /// Reads a NUL-terminated byte string of at most `max_len` bytes (terminator excluded)
    fn read_c_string(&self, address: u64, max_len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        while out.len() < max_len {
            self.read_bytes(address + out.len() as u64, &mut byte);
            if byte[0] == 0 {
                break;
            }
            out.push(byte[0]);
        }
        out
    }
}

/// The memory of the current process, for VMs tracing code in-process.
///
/// Readability is probed by letting the kernel copy the bytes into a pipe: a write from an
/// unmapped or unreadable page fails with `EFAULT` instead of faulting us.
#[derive(Debug)]
pub struct LocalMemory {
    probe_read: OwnedFd,
    probe_write: OwnedFd,
}

impl LocalMemory {
    /// Creates a reader for the current address space.
    ///
    /// # Safety
    /// [`MemoryReader::read_bytes`] dereferences whatever address it is given. The caller
    /// guarantees that addresses handed to it unchecked come from the traced code's own
    /// arguments and return values.
    pub unsafe fn new() -> Result<Self, Error> {
        let (probe_read, probe_write) = nix::unistd::pipe()?;
        Ok(Self {
            probe_read,
            probe_write,
        })
    }

    fn probe_byte(&self, address: u64) -> bool {
        if address == 0 {
            return false;
        }
        let written = unsafe {
            libc::write(
                self.probe_write.as_raw_fd(),
                address as usize as *const libc::c_void,
                1,
            )
        };
        if written != 1 {
            return false;
        }
        let mut drain = 0u8;
        unsafe {
            libc::read(
                self.probe_read.as_raw_fd(),
                core::ptr::addr_of_mut!(drain).cast::<libc::c_void>(),
                1,
            );
        }
        true
    }
}

fn page_size() -> u64 {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret <= 0 {
        4096
    } else {
        ret as u64
    }
}

impl MemoryReader for LocalMemory {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                address as usize as *const u8,
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
    }

    fn is_readable(&self, address: u64, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        let Some(end) = address.checked_add(len as u64) else {
            return false;
        };
        // Protection is per page, one byte per touched page decides.
        let page = page_size();
        let mut probe = address;
        while probe < end {
            if !self.probe_byte(probe) {
                return false;
            }
            probe = (probe / page + 1) * page;
        }
        true
    }
}

/// Memory made of captured regions, for replaying traces offline.
///
/// Bytes outside every region read as zero and are not readable.
#[derive(Clone, Debug, Default)]
pub struct SnapshotMemory {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl SnapshotMemory {
    /// Empty memory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the region starting at `address`
    pub fn map(&mut self, address: u64, bytes: Vec<u8>) {
        self.regions.insert(address, bytes);
    }

    /// Builder-style [`SnapshotMemory::map`]
    #[must_use]
    pub fn with_region(mut self, address: u64, bytes: Vec<u8>) -> Self {
        self.map(address, bytes);
        self
    }

    /// Overwrites bytes inside an existing region, returns `false` if the range is not mapped
    pub fn write(&mut self, address: u64, bytes: &[u8]) -> bool {
        let Some((start, region)) = self.regions.range_mut(..=address).next_back() else {
            return false;
        };
        let offset = (address - start) as usize;
        match region.get_mut(offset..offset + bytes.len()) {
            Some(slot) => {
                slot.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    fn byte(&self, address: u64) -> Option<u8> {
        let (start, region) = self.regions.range(..=address).next_back()?;
        region.get((address - start) as usize).copied()
    }
}

impl MemoryReader for SnapshotMemory {
    fn read_bytes(&self, address: u64, buf: &mut [u8]) {
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = self.byte(address + i as u64).unwrap_or(0);
        }
    }

    fn is_readable(&self, address: u64, len: usize) -> bool {
        (0..len as u64).all(|i| self.byte(address + i).is_some())
    }
}
