use core::{ffi::c_void, num::NonZeroUsize, ptr::NonNull};
use std::{
    cell::RefCell,
    io::{self, Write},
    rc::Rc,
};

use libafl_calltrace::{
    alloc::AllocationTable,
    memory::{LocalMemory, MemoryReader},
    render::{buffer_preview, read_buffer_hexdump_from_address},
};
use nix::sys::mman::{mmap_anonymous, mprotect, munmap, MapFlags, ProtFlags};

/// Two pages, the second one inaccessible
struct GuardedPages {
    base: NonNull<c_void>,
    page: usize,
}

impl GuardedPages {
    fn new() -> Self {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let base = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(2 * page).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
            .unwrap()
        };
        let bytes = unsafe { core::slice::from_raw_parts_mut(base.as_ptr().cast::<u8>(), page) };
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let guard = unsafe { NonNull::new_unchecked(base.as_ptr().cast::<u8>().add(page)) };
        unsafe { mprotect(guard.cast(), page, ProtFlags::PROT_NONE).unwrap() };
        Self { base, page }
    }

    /// Address `offset` bytes before the guard page
    fn before_guard(&self, offset: u64) -> u64 {
        self.base.as_ptr() as u64 + self.page as u64 - offset
    }
}

impl Drop for GuardedPages {
    fn drop(&mut self) {
        unsafe { munmap(self.base, 2 * self.page).unwrap() };
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn readability_stops_at_the_guard_page() {
    let pages = GuardedPages::new();
    let memory = unsafe { LocalMemory::new() }.unwrap();
    let address = pages.before_guard(8);

    assert!(memory.is_readable(address, 8));
    assert!(!memory.is_readable(address, 9));
    assert!(!memory.is_readable(pages.before_guard(0), 1));

    let dump = read_buffer_hexdump_from_address(&memory, address, 16);
    assert_eq!(dump.lines().count(), 1);
    assert!(dump.starts_with("00000000  f8 f9 fa fb fc fd fe ff  "));
    assert!(dump.ends_with("|........|"));

    let preview = buffer_preview(&memory, address, 16, 64);
    assert_eq!(
        preview,
        "\"\\xf8\\xf9\\xfa\\xfb\\xfc\\xfd\\xfe\\xff\"<unreadable>"
    );
}

#[test]
fn released_allocation_dump_is_truncated_at_the_guard_page() {
    let pages = GuardedPages::new();
    let memory = unsafe { LocalMemory::new() }.unwrap();
    let address = pages.before_guard(4);

    let dump = SharedBuf::default();
    let mut allocations = AllocationTable::with_dump_sink(Box::new(dump.clone()));
    assert!(allocations.add(address, 32));
    assert!(allocations.remove(address, &memory));
    assert!(allocations.is_empty());

    let dumped = String::from_utf8(dump.0.borrow().clone()).unwrap();
    let mut lines = dumped.lines();
    assert!(lines.next().unwrap().ends_with("(32 bytes)"));
    assert!(lines
        .next()
        .unwrap()
        .starts_with("00000000  fc fd fe ff    "));
    assert_eq!(lines.next(), None);
}
