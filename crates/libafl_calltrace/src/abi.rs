//! Calling conventions: where arguments and return values live.
//!
//! One [`Abi`] is picked per session with [`abi_for`]; nothing else in the crate needs to
//! know which architecture it is looking at.

use core::fmt::Debug;

use crate::{
    memory::MemoryReader,
    vm::{Arch, FprState, GprState, InstAnalysis},
};

/// Number of stack slots addressable as arguments, after the register arguments
pub const STACK_ARG_SLOTS: usize = 16;

const AARCH64_REGISTER_NAMES: [&str; 33] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "fp", "lr", "sp", "nzcv",
];

const ARM_REGISTER_NAMES: [&str; 16] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "lr", "sp",
    "cpsr",
];

#[inline]
fn align_up(value: u64, align: u64) -> u64 {
    value.wrapping_add(align - 1) & !(align - 1)
}

/// A calling convention
pub trait Abi: Debug {
    /// The architecture this convention belongs to
    fn arch(&self) -> Arch;

    /// Size of a general purpose register in bytes
    fn word_size(&self) -> usize;

    /// Number of arguments passed in registers
    fn arg_register_count(&self) -> usize;

    /// Register holding the syscall number
    fn syscall_number_register(&self) -> usize;

    /// Number of registers carrying syscall arguments
    fn syscall_arg_count(&self) -> usize;

    /// Names of the registers shown in register deltas, in [`Abi::register_values`] order
    fn register_names(&self) -> &'static [&'static str];

    /// Values of the registers named by [`Abi::register_names`]
    fn register_values(&self, regs: &GprState) -> Vec<u64>;

    /// The `index`-th floating point argument, if this convention passes them in FP registers
    fn float_arg(&self, fpr: &FprState, index: usize) -> Option<f64>;

    /// Whether `inst` traps into the kernel
    fn is_syscall(&self, inst: &InstAnalysis) -> bool {
        inst.mnemonic == "svc"
    }

    /// Truncates `value` to the register width
    fn mask(&self, value: u64) -> u64 {
        if self.word_size() == 8 {
            value
        } else {
            value & 0xffff_ffff
        }
    }

    /// Interprets `value` as a signed register value
    fn to_signed(&self, value: u64) -> i64 {
        if self.word_size() == 8 {
            value as i64
        } else {
            i64::from(value as u32 as i32)
        }
    }

    /// The `index`-th integer argument of a call about to happen with `regs`.
    ///
    /// Indices past the register arguments are read from the stack, relative to the stack
    /// pointer aligned up to 8 bytes. Indices past the stack window are logged and yield 0.
    fn get_arg_register_value(
        &self,
        regs: &GprState,
        memory: &dyn MemoryReader,
        index: usize,
    ) -> u64 {
        let in_regs = self.arg_register_count();
        if index < in_regs {
            return self.mask(regs.regs[index]);
        }
        if index >= in_regs + STACK_ARG_SLOTS {
            log::error!(
                "argument index {index} is out of range for {} (max {})",
                self.arch(),
                in_regs + STACK_ARG_SLOTS - 1
            );
            return 0;
        }
        let word = self.word_size();
        let slot = align_up(regs.sp, 8) + ((index - in_regs) * word) as u64;
        self.mask(memory.read_word(slot, word))
    }

    /// The `index`-th return register (0 is the return value, 1 its upper half)
    fn get_ret_register_value(&self, regs: &GprState, index: usize) -> u64 {
        if index > 1 {
            log::error!("return register index {index} is out of range");
            return 0;
        }
        self.mask(regs.regs[index])
    }

    /// The `index`-th syscall argument, always passed in registers
    fn syscall_arg(&self, regs: &GprState, index: usize) -> u64 {
        if index >= self.syscall_arg_count() {
            log::error!("syscall argument index {index} is out of range");
            return 0;
        }
        self.mask(regs.regs[index])
    }

    /// The syscall number of an `svc` about to execute with `regs`
    fn syscall_number(&self, regs: &GprState) -> u64 {
        self.mask(regs.regs[self.syscall_number_register()])
    }
}

/// AAPCS64: `x0`-`x7`, then 8-byte stack slots
#[derive(Clone, Copy, Debug, Default)]
pub struct AArch64Abi;

impl Abi for AArch64Abi {
    fn arch(&self) -> Arch {
        Arch::Aarch64
    }

    fn word_size(&self) -> usize {
        8
    }

    fn arg_register_count(&self) -> usize {
        8
    }

    fn syscall_number_register(&self) -> usize {
        8
    }

    fn syscall_arg_count(&self) -> usize {
        6
    }

    fn register_names(&self) -> &'static [&'static str] {
        &AARCH64_REGISTER_NAMES
    }

    fn register_values(&self, regs: &GprState) -> Vec<u64> {
        let mut values = regs.regs.to_vec();
        values.push(regs.sp);
        values.push(regs.flags);
        values
    }

    fn float_arg(&self, fpr: &FprState, index: usize) -> Option<f64> {
        (index < 8).then(|| f64::from_bits(fpr.v[index] as u64))
    }
}

/// AAPCS: `r0`-`r3`, then 4-byte stack slots; syscalls take `r0`-`r6` and `r7`
#[derive(Clone, Copy, Debug, Default)]
pub struct Arm32Abi;

impl Abi for Arm32Abi {
    fn arch(&self) -> Arch {
        Arch::Arm
    }

    fn word_size(&self) -> usize {
        4
    }

    fn arg_register_count(&self) -> usize {
        4
    }

    fn syscall_number_register(&self) -> usize {
        7
    }

    fn syscall_arg_count(&self) -> usize {
        7
    }

    fn register_names(&self) -> &'static [&'static str] {
        &ARM_REGISTER_NAMES
    }

    fn register_values(&self, regs: &GprState) -> Vec<u64> {
        let mut values: Vec<u64> = regs.regs[..13].iter().map(|r| self.mask(*r)).collect();
        values.push(self.mask(regs.regs[14]));
        values.push(self.mask(regs.sp));
        values.push(self.mask(regs.flags));
        values
    }

    fn float_arg(&self, _fpr: &FprState, _index: usize) -> Option<f64> {
        // Variadic doubles travel in core register pairs here
        None
    }
}

/// The calling convention for `arch`
#[must_use]
pub fn abi_for(arch: Arch) -> Box<dyn Abi> {
    match arch {
        Arch::Arm => Box::new(Arm32Abi),
        Arch::Aarch64 => Box::new(AArch64Abi),
    }
}
