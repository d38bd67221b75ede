//! The C runtime: allocator, string, stdio, file, dl, thread and socket functions.
//!
//! The allocator functions keep the [`crate::alloc::AllocationTable`] in sync. Releases are
//! handled when the call is decoded, while the memory is still live; new allocations once
//! the call returned. A resizing `realloc` only releases the old block once it succeeded.

#[allow(clippy::enum_glob_use)]
use super::ArgKind::*;
use super::{DecodeContext, Decoder, Signature};

decoder_table! {
    /// A decodable C runtime function
    pub enum LibcFunction {
        Malloc = "malloc"(size: Size) -> Pointer,
        Calloc = "calloc"(nmemb: Size, size: Size) -> Pointer,
        Realloc = "realloc"(ptr: Ptr, size: Size) -> Pointer,
        Free = "free"(ptr: Ptr) -> Void,
        Mmap = "mmap"(addr: Ptr, length: Size, prot: Prot, flags: MapFlags, fd: Fd, offset: Hex) -> Pointer,
        Mmap64 = "mmap64"(addr: Ptr, length: Size, prot: Prot, flags: MapFlags, fd: Fd, offset: Hex) -> Pointer,
        Munmap = "munmap"(addr: Ptr, length: Size) -> Number,
        Mprotect = "mprotect"(addr: Ptr, len: Size, prot: Prot) -> Number,
        Memcpy = "memcpy"(dest: Ptr, src: Buf(2), n: Size) -> Pointer,
        Memmove = "memmove"(dest: Ptr, src: Buf(2), n: Size) -> Pointer,
        Memset = "memset"(s: Ptr, c: Char, n: Size) -> Pointer,
        Memcmp = "memcmp"(s1: Buf(2), s2: Buf(2), n: Size) -> Number,
        Memchr = "memchr"(s: Buf(2), c: Char, n: Size) -> Pointer,
        Strlen = "strlen"(s: Str) -> Number,
        Strnlen = "strnlen"(s: Str, maxlen: Size) -> Number,
        Strcmp = "strcmp"(s1: Str, s2: Str) -> Number,
        Strncmp = "strncmp"(s1: Str, s2: Str, n: Size) -> Number,
        Strcasecmp = "strcasecmp"(s1: Str, s2: Str) -> Number,
        Strcpy = "strcpy"(dest: Ptr, src: Str) -> String,
        Strncpy = "strncpy"(dest: Ptr, src: Str, n: Size) -> Pointer,
        Strcat = "strcat"(dest: Str, src: Str) -> String,
        Strncat = "strncat"(dest: Str, src: Str, n: Size) -> String,
        Strchr = "strchr"(s: Str, c: Char) -> String,
        Strrchr = "strrchr"(s: Str, c: Char) -> String,
        Strstr = "strstr"(haystack: Str, needle: Str) -> String,
        Strdup = "strdup"(s: Str) -> String,
        Strndup = "strndup"(s: Str, n: Size) -> String,
        Atoi = "atoi"(nptr: Str) -> Number,
        Atol = "atol"(nptr: Str) -> Number,
        Strtol = "strtol"(nptr: Str, endptr: Ptr, base: Int) -> Number,
        Strtoul = "strtoul"(nptr: Str, endptr: Ptr, base: Int) -> Number,
        Printf = "printf"(format: Fmt) -> Number,
        Fprintf = "fprintf"(stream: Ptr, format: Fmt) -> Number,
        Sprintf = "sprintf"(str: Ptr, format: Fmt) -> Unknown,
        Snprintf = "snprintf"(str: Ptr, size: Size, format: Fmt) -> Unknown,
        Vsprintf = "vsprintf"(str: Ptr, format: Str, ap: Ptr) -> Unknown,
        Vsnprintf = "vsnprintf"(str: Ptr, size: Size, format: Str, ap: Ptr) -> Unknown,
        Puts = "puts"(s: Str) -> Number,
        Fopen = "fopen"(pathname: Str, mode: Str) -> Number,
        Fclose = "fclose"(stream: Ptr) -> Number,
        Fread = "fread"(ptr: Ptr, size: Size, nmemb: Size, stream: Ptr) -> Number,
        Fwrite = "fwrite"(ptr: Ptr, size: Size, nmemb: Size, stream: Ptr) -> Number,
        Fgets = "fgets"(s: Ptr, size: Int, stream: Ptr) -> String,
        Fputs = "fputs"(s: Str, stream: Ptr) -> Number,
        Fflush = "fflush"(stream: Ptr) -> Number,
        Open = "open"(pathname: Str, flags: OpenFlags, mode: Mode) -> Number,
        Openat = "openat"(dirfd: DirFd, pathname: Str, flags: OpenFlags, mode: Mode) -> Number,
        Close = "close"(fd: Fd) -> Number,
        Read = "read"(fd: Fd, buf: Ptr, count: Size) -> Number,
        Write = "write"(fd: Fd, buf: Buf(2), count: Size) -> Number,
        Lseek = "lseek"(fd: Fd, offset: Int, whence: Whence) -> Number,
        Access = "access"(pathname: Str, mode: Int) -> Number,
        Stat = "stat"(pathname: Str, statbuf: Ptr) -> Number,
        Fstat = "fstat"(fd: Fd, statbuf: Ptr) -> Number,
        Unlink = "unlink"(pathname: Str) -> Number,
        Dlopen = "dlopen"(filename: Str, flags: Hex) -> Number,
        Dlsym = "dlsym"(handle: Hex, symbol: Str) -> Number,
        Dlclose = "dlclose"(handle: Hex) -> Number,
        Dlerror = "dlerror"() -> String,
        Getenv = "getenv"(name: Str) -> String,
        Setenv = "setenv"(name: Str, value: Str, overwrite: Int) -> Number,
        PthreadCreate = "pthread_create"(thread: Ptr, attr: Ptr, start_routine: Hex, arg: Ptr) -> Number,
        PthreadMutexLock = "pthread_mutex_lock"(mutex: Ptr) -> Number,
        PthreadMutexUnlock = "pthread_mutex_unlock"(mutex: Ptr) -> Number,
        Gettimeofday = "gettimeofday"(tv: Ptr, tz: Ptr) -> Number,
        Time = "time"(tloc: Ptr) -> Number,
        ClockGettime = "clock_gettime"(clockid: Int, tp: Ptr) -> Number,
        Getpid = "getpid"() -> Number,
        Sleep = "sleep"(seconds: Size) -> Number,
        Usleep = "usleep"(usec: Size) -> Number,
        Socket = "socket"(domain: Int, sock_type: Int, protocol: Int) -> Number,
        Connect = "connect"(sockfd: Fd, addr: Ptr, addrlen: Size) -> Number,
        Send = "send"(sockfd: Fd, buf: Buf(2), len: Size, flags: Hex) -> Number,
        Recv = "recv"(sockfd: Fd, buf: Ptr, len: Size, flags: Hex) -> Number,
        Exit = "exit"(status: Int) -> Void,
        Abort = "abort"() -> Void,
    }
}

impl LibcFunction {
    /// Functions whose real output is the buffer passed as their first argument
    #[must_use]
    pub fn writes_first_argument(self) -> bool {
        matches!(
            self,
            Self::Sprintf | Self::Snprintf | Self::Vsprintf | Self::Vsnprintf
        )
    }
}

fn release(cx: &mut DecodeContext<'_>, address: u64) {
    if address != 0 && !cx.allocations.remove(address, cx.memory) {
        log::debug!("released {address:#x} is not a tracked allocation");
    }
}

fn track(cx: &mut DecodeContext<'_>, address: u64, size: u64) {
    if address != 0 && !cx.allocations.add(address, size) {
        log::debug!("allocation {address:#x} ({size:#x} bytes) not tracked");
    }
}

impl Decoder for LibcFunction {
    fn signature(&self) -> Signature {
        self.table_signature()
    }

    fn decode_args(&self, cx: &mut DecodeContext<'_>) -> Vec<String> {
        let args = cx.render_args(self.signature().args);
        let releases = match self {
            Self::Free | Self::Munmap => true,
            // realloc(ptr, 0) is free(ptr)
            Self::Realloc => cx.arg(1) == 0,
            _ => false,
        };
        if releases {
            let address = cx.arg(0);
            release(cx, address);
        }
        args
    }

    fn decode_ret(&self, cx: &mut DecodeContext<'_>) -> String {
        let ret = cx.ret();
        if *self == Self::Realloc && cx.arg(1) != 0 && ret != 0 {
            let old = cx.arg(0);
            release(cx, old);
        }
        let size = match self {
            Self::Malloc => Some(cx.arg(0)),
            Self::Calloc => Some(cx.arg(0).saturating_mul(cx.arg(1))),
            // realloc(ptr, 0) frees and returns nothing to track
            Self::Realloc if cx.arg(1) != 0 => Some(cx.arg(1)),
            Self::Mmap | Self::Mmap64 if cx.ret_signed() != -1 => Some(cx.arg(1)),
            _ => None,
        };
        if let Some(size) = size {
            track(cx, ret, size);
        }
        if self.writes_first_argument() {
            return format!("{} \"{}\"", cx.number(ret), cx.string_at(cx.arg(0)));
        }
        cx.render_ret(self.signature().ret)
    }
}

#[cfg(test)]
mod tests {
    use super::LibcFunction;
    use crate::{
        abi::AArch64Abi,
        alloc::AllocationTable,
        dispatch::{tests::with_context, Decoder, LibcDispatcher, ReturnType},
        memory::SnapshotMemory,
        module::{ModuleRange, ModuleSymbols},
        vm::GprState,
    };

    #[test]
    fn symbol_table() {
        assert_eq!(LibcFunction::from_symbol("strlen"), Some(LibcFunction::Strlen));
        assert_eq!(LibcFunction::from_symbol("mmap64"), Some(LibcFunction::Mmap64));
        assert_eq!(LibcFunction::from_symbol("strlen_chk"), None);
        assert!(LibcFunction::ALL
            .iter()
            .all(|f| LibcFunction::from_symbol(f.symbol()) == Some(*f)));
        assert_eq!(LibcFunction::Free.signature().ret, ReturnType::Void);
        assert_eq!(LibcFunction::Malloc.signature().ret, ReturnType::Pointer);
    }

    #[test]
    fn aliases_listed_first_do_not_hide_decoders() {
        let mut symbols = ModuleSymbols::new("libc.so", ModuleRange::from_base_size(0x1000, 0x1000));
        symbols.insert(0x1100, "__libc_malloc");
        symbols.insert(0x1100, "malloc");
        symbols.insert(0x1200, "__libc_calloc");
        symbols.insert(0x1200, "calloc");
        symbols.insert(0x1300, "__internal_helper");
        let dispatcher = LibcDispatcher::new(symbols, LibcFunction::from_symbol);

        assert_eq!(dispatcher.handler(0x1100), Some(LibcFunction::Malloc));
        assert_eq!(dispatcher.handler(0x1200), Some(LibcFunction::Calloc));
        assert_eq!(dispatcher.handler(0x1300), None);
        assert_eq!(dispatcher.symbols().resolve_symbol(0x1100), Some("malloc"));
        assert_eq!(dispatcher.symbols().resolve_symbol(0x1300), Some("__internal_helper"));
    }

    #[test]
    fn strlen_arguments() {
        let memory = SnapshotMemory::new().with_region(0x4000, b"abc\0".to_vec());
        let mut allocations = AllocationTable::new();
        let regs = GprState::with_args(&[0x4000]);
        let ret = GprState::with_args(&[3]);
        with_context(&AArch64Abi, &memory, &mut allocations, &regs, Some(&ret), |cx| {
            assert_eq!(LibcFunction::Strlen.decode_args(cx), vec!["s=abc"]);
            assert_eq!(LibcFunction::Strlen.decode_ret(cx), "0x3");
        });
    }

    #[test]
    fn allocator_calls_track_allocations() {
        let memory = SnapshotMemory::new().with_region(0x1000, vec![0xaa; 0x100]);
        let mut allocations = AllocationTable::new();

        let call = GprState::with_args(&[0x100]);
        let ret = GprState::with_args(&[0x1000]);
        let rendered = with_context(&AArch64Abi, &memory, &mut allocations, &call, Some(&ret), |cx| {
            LibcFunction::Malloc.decode_ret(cx)
        });
        assert!(rendered.starts_with("0x1000<alloc#0+0x0>\n00000000  aa aa"));
        let record = *allocations.get(0x1000).unwrap();
        assert_eq!((record.start, record.end), (0x1000, 0x1100));

        // realloc moves the allocation once it returned
        let call = GprState::with_args(&[0x1000, 0x200]);
        let ret = GprState::with_args(&[0x8000]);
        with_context(&AArch64Abi, &memory, &mut allocations, &call, None, |cx| {
            let args = LibcFunction::Realloc.decode_args(cx);
            assert_eq!(args[0], "ptr=0x1000<alloc#0+0x0>");
        });
        assert!(allocations.contains(0x1000));
        with_context(&AArch64Abi, &memory, &mut allocations, &call, Some(&ret), |cx| {
            LibcFunction::Realloc.decode_ret(cx);
        });
        assert!(!allocations.contains(0x1000));
        assert_eq!(allocations.offset_of(0x8010), Some((0x10, 1)));

        let call = GprState::with_args(&[0x8000]);
        with_context(&AArch64Abi, &memory, &mut allocations, &call, None, |cx| {
            LibcFunction::Free.decode_args(cx);
        });
        assert!(allocations.is_empty());
    }

    #[test]
    fn failed_realloc_keeps_the_old_block() {
        let memory = SnapshotMemory::new().with_region(0x1000, vec![0; 0x100]);
        let mut allocations = AllocationTable::new();
        assert!(allocations.add(0x1000, 0x100));

        let call = GprState::with_args(&[0x1000, 0x1_0000_0000]);
        let ret = GprState::with_args(&[0]);
        with_context(&AArch64Abi, &memory, &mut allocations, &call, Some(&ret), |cx| {
            LibcFunction::Realloc.decode_args(cx);
            assert_eq!(LibcFunction::Realloc.decode_ret(cx), "NULL");
        });
        assert_eq!(allocations.offset_of(0x1080), Some((0x80, 0)));

        // realloc(ptr, 0) releases like free
        let call = GprState::with_args(&[0x1000, 0]);
        with_context(&AArch64Abi, &memory, &mut allocations, &call, Some(&ret), |cx| {
            LibcFunction::Realloc.decode_args(cx);
            LibcFunction::Realloc.decode_ret(cx);
        });
        assert!(allocations.is_empty());
    }

    #[test]
    fn failed_mmap_is_not_tracked() {
        let memory = SnapshotMemory::new();
        let mut allocations = AllocationTable::new();
        let call = GprState::with_args(&[0, 0x1000, 3, 0x22, u64::MAX, 0]);
        let ret = GprState::with_args(&[u64::MAX]);
        with_context(&AArch64Abi, &memory, &mut allocations, &call, Some(&ret), |cx| {
            let args = LibcFunction::Mmap.decode_args(cx);
            assert_eq!(
                args,
                vec![
                    "addr=NULL",
                    "length=4096",
                    "prot=PROT_READ|PROT_WRITE",
                    "flags=MAP_PRIVATE|MAP_ANONYMOUS",
                    "fd=-1",
                    "offset=0x0",
                ]
            );
            LibcFunction::Mmap.decode_ret(cx);
        });
        assert!(allocations.is_empty());
    }

    #[test]
    fn sprintf_renders_the_destination() {
        let memory = SnapshotMemory::new()
            .with_region(0x1000, b"id=42\0".to_vec())
            .with_region(0x2000, b"id=%d\0".to_vec());
        let mut allocations = AllocationTable::new();
        let call = GprState::with_args(&[0x1000, 0x2000, 42]);
        let ret = GprState::with_args(&[5]);
        with_context(&AArch64Abi, &memory, &mut allocations, &call, Some(&ret), |cx| {
            assert_eq!(
                LibcFunction::Sprintf.decode_args(cx),
                vec!["str=0x1000", "format=id=%d", "%d=42"]
            );
            assert_eq!(LibcFunction::Sprintf.decode_ret(cx), "0x5 \"id=42\"");
        });
    }
}
