//! Raw system calls, trapped with `svc`.
//!
//! The syscall number is read from `x8` (AArch64) or `r7` (ARM EABI) and looked up in the
//! numbering of the traced architecture. Arguments always come from registers.

use hashbrown::HashMap;
use nix::errno::Errno;

#[allow(clippy::enum_glob_use)]
use super::ArgKind::*;
use super::{
    common_args, ArgSource, DecodeContext, Decoder, Dispatcher, ReturnType, Signature,
};
use crate::{trace::FunctionCall, vm::Arch};

/// Shown as the owning module of every syscall
pub const KERNEL_MODULE: &str = "kernel";

/// Largest errno the kernel returns as `-errno`
const MAX_ERRNO: i64 = 4095;

decoder_table! {
    /// A decodable system call
    pub enum Syscall {
        Open = "open"(pathname: Str, flags: OpenFlags, mode: Mode) -> Number,
        Openat = "openat"(dirfd: DirFd, pathname: Str, flags: OpenFlags, mode: Mode) -> Number,
        Close = "close"(fd: Fd) -> Number,
        Read = "read"(fd: Fd, buf: Ptr, count: Size) -> Number,
        Write = "write"(fd: Fd, buf: Buf(2), count: Size) -> Number,
        Lseek = "lseek"(fd: Fd, offset: Int, whence: Whence) -> Number,
        Pread64 = "pread64"(fd: Fd, buf: Ptr, count: Size, offset: Hex) -> Number,
        Pwrite64 = "pwrite64"(fd: Fd, buf: Buf(2), count: Size, offset: Hex) -> Number,
        Readv = "readv"(fd: Fd, iov: Ptr, iovcnt: Int) -> Number,
        Writev = "writev"(fd: Fd, iov: Ptr, iovcnt: Int) -> Number,
        Fstat = "fstat"(fd: Fd, statbuf: Ptr) -> Number,
        Fstatat = "fstatat"(dirfd: DirFd, pathname: Str, statbuf: Ptr, flags: Hex) -> Number,
        Faccessat = "faccessat"(dirfd: DirFd, pathname: Str, mode: Int) -> Number,
        Unlinkat = "unlinkat"(dirfd: DirFd, pathname: Str, flags: Hex) -> Number,
        Mkdirat = "mkdirat"(dirfd: DirFd, pathname: Str, mode: Mode) -> Number,
        Getdents64 = "getdents64"(fd: Fd, dirp: Ptr, count: Size) -> Number,
        Ioctl = "ioctl"(fd: Fd, request: Hex, arg: Hex) -> Number,
        Fcntl = "fcntl"(fd: Fd, cmd: Int, arg: Hex) -> Number,
        Dup = "dup"(oldfd: Fd) -> Number,
        Dup3 = "dup3"(oldfd: Fd, newfd: Fd, flags: OpenFlags) -> Number,
        Pipe2 = "pipe2"(pipefd: Ptr, flags: OpenFlags) -> Number,
        Mmap = "mmap"(addr: Ptr, length: Size, prot: Prot, flags: MapFlags, fd: Fd, offset: Hex) -> Number,
        Munmap = "munmap"(addr: Ptr, length: Size) -> Number,
        Mprotect = "mprotect"(addr: Ptr, len: Size, prot: Prot) -> Number,
        Madvise = "madvise"(addr: Ptr, length: Size, advice: Int) -> Number,
        Brk = "brk"(addr: Ptr) -> Number,
        Clone = "clone"(flags: Hex, stack: Ptr, parent_tid: Ptr, tls: Hex, child_tid: Ptr) -> Number,
        Execve = "execve"(pathname: Str, argv: Ptr, envp: Ptr) -> Number,
        Exit = "exit"(status: Int) -> Void,
        ExitGroup = "exit_group"(status: Int) -> Void,
        Wait4 = "wait4"(pid: Int, wstatus: Ptr, options: Hex, rusage: Ptr) -> Number,
        Getpid = "getpid"() -> Number,
        Gettid = "gettid"() -> Number,
        Getuid = "getuid"() -> Number,
        Kill = "kill"(pid: Int, sig: Int) -> Number,
        Tgkill = "tgkill"(tgid: Int, tid: Int, sig: Int) -> Number,
        RtSigaction = "rt_sigaction"(signum: Int, act: Ptr, oldact: Ptr, sigsetsize: Size) -> Number,
        RtSigprocmask = "rt_sigprocmask"(how: Int, set: Ptr, oldset: Ptr, sigsetsize: Size) -> Number,
        Nanosleep = "nanosleep"(req: Ptr, rem: Ptr) -> Number,
        ClockGettime = "clock_gettime"(clockid: Int, tp: Ptr) -> Number,
        Gettimeofday = "gettimeofday"(tv: Ptr, tz: Ptr) -> Number,
        Futex = "futex"(uaddr: Ptr, futex_op: Int, val: Int, timeout: Ptr, uaddr2: Ptr, val3: Int) -> Number,
        Socket = "socket"(domain: Int, sock_type: Int, protocol: Int) -> Number,
        Bind = "bind"(sockfd: Fd, addr: Ptr, addrlen: Size) -> Number,
        Connect = "connect"(sockfd: Fd, addr: Ptr, addrlen: Size) -> Number,
        Listen = "listen"(sockfd: Fd, backlog: Int) -> Number,
        Accept = "accept"(sockfd: Fd, addr: Ptr, addrlen: Ptr) -> Number,
        Sendto = "sendto"(sockfd: Fd, buf: Buf(2), len: Size, flags: Hex, dest_addr: Ptr, addrlen: Size) -> Number,
        Recvfrom = "recvfrom"(sockfd: Fd, buf: Ptr, len: Size, flags: Hex, src_addr: Ptr, addrlen: Ptr) -> Number,
        Prctl = "prctl"(option: Int, arg2: Hex, arg3: Hex, arg4: Hex, arg5: Hex) -> Number,
        Getrandom = "getrandom"(buf: Ptr, buflen: Size, flags: Hex) -> Number,
        SetTidAddress = "set_tid_address"(tidptr: Ptr) -> Number,
        Uname = "uname"(buf: Ptr) -> Number,
    }
}

/// asm-generic numbering used by AArch64
const AARCH64_SYSCALLS: &[(u64, Syscall)] = &[
    (23, Syscall::Dup),
    (24, Syscall::Dup3),
    (25, Syscall::Fcntl),
    (29, Syscall::Ioctl),
    (34, Syscall::Mkdirat),
    (35, Syscall::Unlinkat),
    (48, Syscall::Faccessat),
    (56, Syscall::Openat),
    (57, Syscall::Close),
    (59, Syscall::Pipe2),
    (61, Syscall::Getdents64),
    (62, Syscall::Lseek),
    (63, Syscall::Read),
    (64, Syscall::Write),
    (65, Syscall::Readv),
    (66, Syscall::Writev),
    (67, Syscall::Pread64),
    (68, Syscall::Pwrite64),
    (79, Syscall::Fstatat),
    (80, Syscall::Fstat),
    (93, Syscall::Exit),
    (94, Syscall::ExitGroup),
    (96, Syscall::SetTidAddress),
    (98, Syscall::Futex),
    (101, Syscall::Nanosleep),
    (113, Syscall::ClockGettime),
    (129, Syscall::Kill),
    (131, Syscall::Tgkill),
    (134, Syscall::RtSigaction),
    (135, Syscall::RtSigprocmask),
    (160, Syscall::Uname),
    (167, Syscall::Prctl),
    (169, Syscall::Gettimeofday),
    (172, Syscall::Getpid),
    (174, Syscall::Getuid),
    (178, Syscall::Gettid),
    (198, Syscall::Socket),
    (200, Syscall::Bind),
    (201, Syscall::Listen),
    (202, Syscall::Accept),
    (203, Syscall::Connect),
    (206, Syscall::Sendto),
    (207, Syscall::Recvfrom),
    (214, Syscall::Brk),
    (215, Syscall::Munmap),
    (220, Syscall::Clone),
    (221, Syscall::Execve),
    (222, Syscall::Mmap),
    (226, Syscall::Mprotect),
    (233, Syscall::Madvise),
    (260, Syscall::Wait4),
    (278, Syscall::Getrandom),
];

/// ARM EABI numbering; `mmap2`, `fstat64`, `fstatat64`, `fcntl64` and `getuid32` are shown
/// under their plain names
const ARM_SYSCALLS: &[(u64, Syscall)] = &[
    (1, Syscall::Exit),
    (3, Syscall::Read),
    (4, Syscall::Write),
    (5, Syscall::Open),
    (6, Syscall::Close),
    (11, Syscall::Execve),
    (19, Syscall::Lseek),
    (20, Syscall::Getpid),
    (37, Syscall::Kill),
    (41, Syscall::Dup),
    (45, Syscall::Brk),
    (54, Syscall::Ioctl),
    (78, Syscall::Gettimeofday),
    (91, Syscall::Munmap),
    (114, Syscall::Wait4),
    (120, Syscall::Clone),
    (122, Syscall::Uname),
    (125, Syscall::Mprotect),
    (145, Syscall::Readv),
    (146, Syscall::Writev),
    (162, Syscall::Nanosleep),
    (172, Syscall::Prctl),
    (174, Syscall::RtSigaction),
    (175, Syscall::RtSigprocmask),
    (180, Syscall::Pread64),
    (181, Syscall::Pwrite64),
    (192, Syscall::Mmap),
    (197, Syscall::Fstat),
    (199, Syscall::Getuid),
    (217, Syscall::Getdents64),
    (220, Syscall::Madvise),
    (221, Syscall::Fcntl),
    (224, Syscall::Gettid),
    (240, Syscall::Futex),
    (248, Syscall::ExitGroup),
    (256, Syscall::SetTidAddress),
    (263, Syscall::ClockGettime),
    (268, Syscall::Tgkill),
    (281, Syscall::Socket),
    (282, Syscall::Bind),
    (283, Syscall::Connect),
    (284, Syscall::Listen),
    (285, Syscall::Accept),
    (290, Syscall::Sendto),
    (292, Syscall::Recvfrom),
    (322, Syscall::Openat),
    (323, Syscall::Mkdirat),
    (327, Syscall::Fstatat),
    (328, Syscall::Unlinkat),
    (334, Syscall::Faccessat),
    (358, Syscall::Dup3),
    (359, Syscall::Pipe2),
    (384, Syscall::Getrandom),
];

/// `-N (ENAME)` for a kernel error return, `None` for anything else
#[must_use]
pub fn render_errno(value: i64) -> Option<String> {
    if (-MAX_ERRNO..=-1).contains(&value) {
        // in range, so the negation fits
        let errno = Errno::from_raw((-value) as i32);
        Some(format!("{value} ({errno:?})"))
    } else {
        None
    }
}

impl Decoder for Syscall {
    fn signature(&self) -> Signature {
        self.table_signature()
    }

    fn decode_ret(&self, cx: &mut DecodeContext<'_>) -> String {
        if self.signature().ret == ReturnType::Void {
            return "void".to_string();
        }
        render_errno(cx.ret_signed()).unwrap_or_else(|| cx.render_ret(self.signature().ret))
    }
}

/// Decodes every `svc`, regardless of where it happens
#[derive(Debug)]
pub struct SyscallDispatcher {
    arch: Arch,
    table: HashMap<u64, Syscall>,
}

impl SyscallDispatcher {
    /// The dispatcher for the syscall numbering of `arch`
    #[must_use]
    pub fn new(arch: Arch) -> Self {
        let numbers = match arch {
            Arch::Aarch64 => AARCH64_SYSCALLS,
            Arch::Arm => ARM_SYSCALLS,
        };
        Self {
            arch,
            table: numbers.iter().copied().collect(),
        }
    }

    /// The architecture whose numbering is used
    #[must_use]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// The syscall with number `nr`
    #[must_use]
    pub fn lookup(&self, nr: u64) -> Option<Syscall> {
        self.table.get(&nr).copied()
    }
}

impl Dispatcher for SyscallDispatcher {
    fn name(&self) -> &str {
        KERNEL_MODULE
    }

    fn is_owned(&self, _address: u64) -> bool {
        false
    }

    fn dispatch_args(&self, call: &mut FunctionCall, cx: &mut DecodeContext<'_>) -> bool {
        if !call.is_syscall {
            return false;
        }
        cx.source = ArgSource::Syscall;
        let nr = cx.abi.syscall_number(cx.call_regs);
        call.owning_module_name = KERNEL_MODULE.to_string();
        match self.lookup(nr) {
            Some(syscall) => {
                call.function_name = Some(syscall.symbol().to_string());
                call.arguments = syscall.decode_args(cx);
                call.return_type = syscall.signature().ret;
            }
            None => {
                call.function_name = Some(format!("syscall_{nr}"));
                common_args(call, cx);
            }
        }
        true
    }

    fn dispatch_ret(&self, call: &mut FunctionCall, cx: &mut DecodeContext<'_>) -> bool {
        if !call.is_syscall {
            return false;
        }
        cx.source = ArgSource::Syscall;
        let nr = cx.abi.syscall_number(cx.call_regs);
        let rendered = match self.lookup(nr) {
            Some(syscall) => syscall.decode_ret(cx),
            None => render_errno(cx.ret_signed()).unwrap_or_else(|| format!("{:#x}", cx.ret())),
        };
        call.return_value = Some(rendered);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::{render_errno, Syscall, SyscallDispatcher, AARCH64_SYSCALLS, ARM_SYSCALLS};
    use crate::{
        abi::{AArch64Abi, Arm32Abi},
        alloc::AllocationTable,
        dispatch::{tests::with_context, Dispatcher},
        memory::SnapshotMemory,
        trace::FunctionCall,
        vm::{Arch, GprState},
    };

    #[test]
    fn numbering_is_unique() {
        for table in [AARCH64_SYSCALLS, ARM_SYSCALLS] {
            let mut numbers: Vec<u64> = table.iter().map(|(nr, _)| *nr).collect();
            numbers.sort_unstable();
            numbers.dedup();
            assert_eq!(numbers.len(), table.len());
        }
        assert_eq!(SyscallDispatcher::new(Arch::Aarch64).lookup(56), Some(Syscall::Openat));
        assert_eq!(SyscallDispatcher::new(Arch::Arm).lookup(322), Some(Syscall::Openat));
        assert_eq!(SyscallDispatcher::new(Arch::Aarch64).lookup(5), None);
    }

    #[test]
    fn errno_rendering() {
        assert_eq!(render_errno(-2).as_deref(), Some("-2 (ENOENT)"));
        assert!(render_errno(-4095).is_some());
        assert_eq!(render_errno(-4096), None);
        assert_eq!(render_errno(0), None);
    }

    #[test]
    fn openat_on_aarch64() {
        let memory = SnapshotMemory::new().with_region(0x4000, b"/data/local/tmp/x\0".to_vec());
        let mut allocations = AllocationTable::new();
        let mut regs = GprState::with_args(&[(-100i64) as u64, 0x4000, 0o2000000, 0]);
        regs.regs[8] = 56;
        let mut ret = regs;
        ret.regs[0] = (-2i64) as u64;
        let dispatcher = SyscallDispatcher::new(Arch::Aarch64);
        let mut call = FunctionCall::syscall(0x100);
        with_context(&AArch64Abi, &memory, &mut allocations, &regs, Some(&ret), |cx| {
            assert!(dispatcher.dispatch_args(&mut call, cx));
            assert!(dispatcher.dispatch_ret(&mut call, cx));
        });
        assert_eq!(call.function_name.as_deref(), Some("openat"));
        assert_eq!(
            call.arguments,
            vec![
                "dirfd=AT_FDCWD",
                "pathname=/data/local/tmp/x",
                "flags=O_RDONLY|O_CLOEXEC",
                "mode=0o0",
            ]
        );
        assert_eq!(call.return_value.as_deref(), Some("-2 (ENOENT)"));
    }

    #[test]
    fn unknown_arm_syscall_dumps_registers() {
        let memory = SnapshotMemory::new();
        let mut allocations = AllocationTable::new();
        let mut regs = GprState::with_args(&[1, 2, 3, 4, 5, 6, 7]);
        regs.regs[7] = 999;
        let dispatcher = SyscallDispatcher::new(Arch::Arm);
        let mut call = FunctionCall::syscall(0x100);
        with_context(&Arm32Abi, &memory, &mut allocations, &regs, Some(&regs), |cx| {
            assert!(dispatcher.dispatch_args(&mut call, cx));
            assert!(dispatcher.dispatch_ret(&mut call, cx));
        });
        assert_eq!(call.function_name.as_deref(), Some("syscall_999"));
        assert_eq!(
            call.arguments,
            vec!["0x1", "0x2", "0x3", "0x4", "0x5", "0x6", "0x7"]
        );
        assert_eq!(call.return_value.as_deref(), Some("0x1"));
    }

    #[test]
    fn plain_calls_are_not_syscalls() {
        let memory = SnapshotMemory::new();
        let mut allocations = AllocationTable::new();
        let regs = GprState::default();
        let dispatcher = SyscallDispatcher::new(Arch::Arm);
        let mut call = FunctionCall::new(0x100);
        with_context(&Arm32Abi, &memory, &mut allocations, &regs, None, |cx| {
            assert!(!dispatcher.dispatch_args(&mut call, cx));
        });
        assert!(call.function_name.is_none());
    }
}
