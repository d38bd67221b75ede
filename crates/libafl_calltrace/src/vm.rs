//! The interface to the DBI VM the tracer runs on.
//!
//! The VM itself lives outside this crate. A backend hands the tracer register snapshots,
//! an [`InstAnalysis`] per instruction and the memory accesses the instruction performed,
//! and calls the [`InstrumentationHooks`] before and after every instrumented instruction.

use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::Error;

/// The architectures the tracer knows a calling convention for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// 32-bit ARM, AAPCS
    Arm,
    /// AArch64, AAPCS64
    Aarch64,
}

impl Arch {
    /// The architecture this crate was compiled for, if it is one we can trace
    #[must_use]
    pub fn host() -> Option<Self> {
        if cfg!(target_arch = "aarch64") {
            Some(Self::Aarch64)
        } else if cfg!(target_arch = "arm") {
            Some(Self::Arm)
        } else {
            None
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arm => f.write_str("arm"),
            Self::Aarch64 => f.write_str("aarch64"),
        }
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arm" | "arm32" | "armv7" => Ok(Self::Arm),
            "aarch64" | "arm64" => Ok(Self::Aarch64),
            _ => Err(Error::config(format!("unknown architecture '{s}'"))),
        }
    }
}

/// General purpose register snapshot.
///
/// On AArch64 `regs[0..=28]` are `x0`-`x28`, `regs[29]` is `fp` and `regs[30]` is `lr`.
/// On ARM `regs[0..=12]` are `r0`-`r12` and `regs[14]` is `lr`; values are zero-extended.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GprState {
    /// The numbered registers
    pub regs: [u64; 31],
    /// Stack pointer
    pub sp: u64,
    /// Program counter
    pub pc: u64,
    /// `nzcv` on AArch64, `cpsr` on ARM
    pub flags: u64,
}

impl GprState {
    /// A snapshot with the given argument registers set, everything else zero
    #[must_use]
    pub fn with_args(args: &[u64]) -> Self {
        let mut state = Self::default();
        for (slot, value) in state.regs.iter_mut().zip(args) {
            *slot = *value;
        }
        state
    }
}

/// Floating point / SIMD register snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FprState {
    /// `v0`-`v31` on AArch64, `q0`-`q15` (in the low 16 slots) on ARM
    pub v: [u128; 32],
    /// Floating point control register
    pub fpcr: u64,
    /// Floating point status register
    pub fpsr: u64,
}

/// What the VM found out about an instruction before executing it
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct InstAnalysis {
    /// Address of the instruction
    pub address: u64,
    /// Size in bytes
    pub size: u32,
    /// The mnemonic, lowercase (`bl`, `svc`, ...)
    pub mnemonic: String,
    /// Full disassembly
    pub disassembly: String,
    /// The instruction may change the program counter
    pub affects_control_flow: bool,
    /// Branch with link
    pub is_call: bool,
    /// Any branch
    pub is_branch: bool,
    /// Function return
    pub is_return: bool,
}

impl InstAnalysis {
    /// A plain instruction that does not change control flow
    #[must_use]
    pub fn new(address: u64, mnemonic: &str, disassembly: &str) -> Self {
        Self {
            address,
            size: 4,
            mnemonic: mnemonic.to_string(),
            disassembly: disassembly.to_string(),
            ..Self::default()
        }
    }

    /// A branch-with-link instruction
    #[must_use]
    pub fn call(address: u64, mnemonic: &str, disassembly: &str) -> Self {
        Self {
            affects_control_flow: true,
            is_call: true,
            is_branch: true,
            ..Self::new(address, mnemonic, disassembly)
        }
    }

    /// A branch without link
    #[must_use]
    pub fn branch(address: u64, mnemonic: &str, disassembly: &str) -> Self {
        Self {
            affects_control_flow: true,
            is_branch: true,
            ..Self::new(address, mnemonic, disassembly)
        }
    }

    /// A function return
    #[must_use]
    pub fn ret(address: u64) -> Self {
        Self {
            affects_control_flow: true,
            is_branch: true,
            is_return: true,
            ..Self::new(address, "ret", "ret")
        }
    }

    /// Whether this instruction starts a call boundary the tracer decodes.
    ///
    /// Returns are not call boundaries, the call they return from already is.
    #[must_use]
    pub fn is_call_boundary(&self) -> bool {
        self.affects_control_flow && (self.is_call || self.is_branch) && !self.is_return
    }
}

/// Direction of a memory access
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryAccessType {
    /// Load
    Read,
    /// Store
    Write,
}

/// One memory access performed by an instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryAccess {
    /// Address of the accessing instruction
    pub inst_address: u64,
    /// Accessed address
    pub access_address: u64,
    /// Value loaded or stored
    pub value: u64,
    /// Access size in bytes
    pub size: u16,
    /// Load or store
    pub kind: MemoryAccessType,
}

/// Tells the VM whether to keep going after a callback
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmAction {
    /// Continue instrumenting
    Continue,
    /// Stop the execution in the VM
    Stop,
}

/// The callbacks the VM drives for every instrumented instruction
pub trait InstrumentationHooks {
    /// Before `inst` executes
    fn pre_instruction(&mut self, inst: &InstAnalysis, gpr: &GprState, fpr: &FprState)
        -> VmAction;

    /// After `inst` executed, with the memory accesses it performed
    fn post_instruction(
        &mut self,
        inst: &InstAnalysis,
        gpr: &GprState,
        fpr: &FprState,
        accesses: &[MemoryAccess],
    ) -> VmAction;

    /// Execution leaves instrumented code towards `target`
    fn call_transfer(&mut self, _target: u64, _gpr: &GprState) -> VmAction {
        VmAction::Continue
    }
}

/// A DBI VM able to run code and report every instruction to [`InstrumentationHooks`]
pub trait Vm {
    /// The architecture of the code this VM runs
    fn arch(&self) -> Arch;

    /// Instrument the whole module containing `address`
    fn instrument_module_from_addr(&mut self, address: u64) -> Result<(), Error>;

    /// Call `target` with the given register state, reporting every instrumented
    /// instruction to `hooks`. Returns the value of the return register.
    fn call(
        &mut self,
        target: u64,
        state: &GprState,
        hooks: &mut dyn InstrumentationHooks,
    ) -> Result<u64, Error>;

    /// Redirect the entry point of `target` into the VM
    fn redirect_entry(&mut self, target: u64) -> Result<(), Error>;

    /// Undo a [`Vm::redirect_entry`]
    fn revert_entry(&mut self, target: u64) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::{Arch, InstAnalysis};

    #[test]
    fn call_boundaries() {
        assert!(InstAnalysis::call(0x1000, "bl", "bl #0x2000").is_call_boundary());
        assert!(InstAnalysis::branch(0x1000, "br", "br x16").is_call_boundary());
        assert!(!InstAnalysis::ret(0x1000).is_call_boundary());
        assert!(!InstAnalysis::new(0x1000, "add", "add x0, x0, #1").is_call_boundary());
    }

    #[test]
    fn arch_names() {
        assert_eq!("arm64".parse::<Arch>().unwrap(), Arch::Aarch64);
        assert_eq!("arm".parse::<Arch>().unwrap(), Arch::Arm);
        assert!("x86_64".parse::<Arch>().is_err());
    }
}
