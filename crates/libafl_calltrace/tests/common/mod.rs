#![allow(dead_code)]

use libafl_calltrace::{
    abi::abi_for,
    dispatch::DispatchRegistry,
    linker::StaticLinker,
    memory::SnapshotMemory,
    options::TraceOptions,
    sink::CollectingSink,
    vm::{
        Arch, FprState, GprState, InstAnalysis, InstrumentationHooks, MemoryAccess,
        MemoryAccessType, Vm, VmAction,
    },
    Error, TraceSession,
};

pub const TARGET_BASE: u64 = 0x10_0000;
pub const PARSE_HEADER: u64 = TARGET_BASE + 0x800;
pub const LIBC_BASE: u64 = 0x7000_0000;
pub const MALLOC: u64 = LIBC_BASE + 0x100;
pub const FREE: u64 = LIBC_BASE + 0x200;
pub const STRLEN: u64 = LIBC_BASE + 0x300;
pub const PRINTF: u64 = LIBC_BASE + 0x400;
pub const SPRINTF: u64 = LIBC_BASE + 0x500;
pub const EXIT: u64 = LIBC_BASE + 0x600;
pub const LIBZ_BASE: u64 = 0x7100_0000;
pub const COMPRESS_BOUND: u64 = LIBZ_BASE + 0x100;
pub const ART_BASE: u64 = 0x7200_0000;
pub const FIND_CLASS: u64 = ART_BASE + 0x100;
pub const NEW_BYTE_ARRAY: u64 = ART_BASE + 0x200;
pub const GET_STRING_UTF_CHARS: u64 = ART_BASE + 0x300;
pub const RELEASE_INT_ARRAY_ELEMENTS: u64 = ART_BASE + 0x400;
pub const CALL_STATIC_INT_METHOD_V: u64 = ART_BASE + 0x500;

/// A process with the traced library, the C runtime, zlib and ART
pub fn linker() -> StaticLinker {
    StaticLinker::new()
        .with_module(
            "libtarget.so",
            TARGET_BASE,
            0x1000,
            &[("entry", 0), ("parse_header", 0x800)],
        )
        .with_module(
            "libc.so",
            LIBC_BASE,
            0x1_0000,
            &[
                ("malloc", 0x100),
                ("free", 0x200),
                ("strlen", 0x300),
                ("printf", 0x400),
                ("sprintf", 0x500),
                ("exit", 0x600),
                ("__internal_helper", 0x700),
            ],
        )
        .with_module("libz.so.1", LIBZ_BASE, 0x1_0000, &[("compressBound", 0x100)])
        .with_module(
            "libart.so",
            ART_BASE,
            0x1_0000,
            &[
                ("_ZN3art3JNIILb0EE9FindClassEP7_JNIEnvPKc", 0x100),
                ("_ZN3art3JNIILb0EE12NewByteArrayEP7_JNIEnvi", 0x200),
                (
                    "_ZN3art3JNIILb0EE17GetStringUTFCharsEP7_JNIEnvP8_jstringPh",
                    0x300,
                ),
                (
                    "_ZN3art3JNIILb0EE23ReleaseIntArrayElementsEP7_JNIEnvP10_jintArrayPii",
                    0x400,
                ),
                (
                    "_ZN3art3JNIILb0EE19CallStaticIntMethodVEP7_JNIEnvP7_jclassP10_jmethodIDSt9__va_list",
                    0x500,
                ),
            ],
        )
}

pub fn options(arch: Arch) -> TraceOptions {
    TraceOptions::builder().arch(arch).build()
}

/// A session over `memory` whose lines end up in `sink`
pub fn session(arch: Arch, memory: SnapshotMemory, sink: &CollectingSink) -> TraceSession {
    session_with(&options(arch), memory, sink)
}

pub fn session_with(
    options: &TraceOptions,
    memory: SnapshotMemory,
    sink: &CollectingSink,
) -> TraceSession {
    let arch = options.resolved_arch().unwrap();
    let registry = DispatchRegistry::from_linker(&linker(), options, arch);
    TraceSession::new(abi_for(arch), registry, Box::new(memory), Box::new(sink.clone()))
        .with_options(options)
}

/// One instrumented instruction as the VM reports it
#[derive(Clone, Debug)]
pub struct Step {
    pub inst: InstAnalysis,
    pub pre: GprState,
    pub post: GprState,
    pub fpr: FprState,
    pub accesses: Vec<MemoryAccess>,
}

/// Builds the instruction stream of a traced function, one instruction every 4 bytes.
///
/// Register changes between two steps are what native, uninstrumented code did.
#[derive(Clone, Debug)]
pub struct Script {
    arch: Arch,
    pc: u64,
    regs: GprState,
    fpr: FprState,
    steps: Vec<Step>,
}

impl Script {
    /// A function starting at `entry`
    pub fn new(arch: Arch, entry: u64) -> Self {
        Self {
            arch,
            pc: entry,
            regs: GprState::default(),
            fpr: FprState::default(),
            steps: Vec::new(),
        }
    }

    fn lr(&self) -> usize {
        match self.arch {
            Arch::Aarch64 => 30,
            Arch::Arm => 14,
        }
    }

    fn push(&mut self, inst: InstAnalysis, change: impl FnOnce(&mut GprState)) {
        let mut pre = self.regs;
        pre.pc = inst.address;
        let mut post = pre;
        post.pc = inst.address + 4;
        change(&mut post);
        self.steps.push(Step {
            inst,
            pre,
            post,
            fpr: self.fpr,
            accesses: Vec::new(),
        });
        self.regs = post;
        self.pc += 4;
    }

    /// A plain instruction
    pub fn exec(mut self, disassembly: &str, change: impl FnOnce(&mut GprState)) -> Self {
        let mnemonic = disassembly.split_whitespace().next().unwrap_or("nop");
        self.push(InstAnalysis::new(self.pc, mnemonic, disassembly), change);
        self
    }

    /// An instruction loading the argument registers of the next call
    pub fn args(self, args: &[u64]) -> Self {
        self.exec("ldp x0, x1, [x19]", |regs| {
            for (slot, value) in regs.regs.iter_mut().zip(args) {
                *slot = *value;
            }
        })
    }

    /// Changes registers without an instrumented instruction
    pub fn native(mut self, change: impl FnOnce(&mut GprState)) -> Self {
        change(&mut self.regs);
        self
    }

    pub fn fpr(mut self, change: impl FnOnce(&mut FprState)) -> Self {
        change(&mut self.fpr);
        self
    }

    /// `bl target`; the callee runs natively and returns `ret`
    pub fn call(self, target: u64, ret: u64) -> Self {
        let lr = self.lr();
        self.call_no_return(target).native(|regs| {
            regs.regs[0] = ret;
            regs.pc = regs.regs[lr];
        })
    }

    /// `bl target` into a callee that never comes back
    pub fn call_no_return(mut self, target: u64) -> Self {
        let lr = self.lr();
        let pc = self.pc;
        let inst = InstAnalysis::call(pc, "bl", &format!("bl #{target:#x}"));
        self.push(inst, |post| {
            post.pc = target;
            post.regs[lr] = pc + 4;
        });
        self
    }

    /// `svc #0` with syscall number `nr`, returning `ret`
    pub fn svc(mut self, nr: u64, ret: u64) -> Self {
        let nr_register = match self.arch {
            Arch::Aarch64 => 8,
            Arch::Arm => 7,
        };
        self.regs.regs[nr_register] = nr;
        self.push(InstAnalysis::new(self.pc, "svc", "svc #0"), |post| {
            post.regs[0] = ret;
        });
        self
    }

    /// Memory access of the last instruction
    pub fn access(mut self, kind: MemoryAccessType, address: u64, value: u64) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.accesses.push(MemoryAccess {
                inst_address: step.inst.address,
                access_address: address,
                value,
                size: 8,
                kind,
            });
        }
        self
    }

    pub fn ret(mut self) -> Self {
        let lr = self.lr();
        self.push(InstAnalysis::ret(self.pc), |post| post.pc = post.regs[lr]);
        self
    }

    pub fn build(self) -> Vec<Step> {
        self.steps
    }
}

/// Replays a script through the hooks it is handed
#[derive(Debug)]
pub struct ScriptedVm {
    pub arch: Arch,
    pub steps: Vec<Step>,
    /// Report a different instruction in the post event of the step with this index
    pub corrupt_post: Option<(usize, InstAnalysis)>,
    pub instrumented: Vec<u64>,
    pub redirected: Vec<u64>,
    pub reverted: Vec<u64>,
    pub calls: Vec<(u64, GprState)>,
    pub executed: usize,
    pub stopped: bool,
}

impl ScriptedVm {
    pub fn new(arch: Arch, steps: Vec<Step>) -> Self {
        Self {
            arch,
            steps,
            corrupt_post: None,
            instrumented: Vec::new(),
            redirected: Vec::new(),
            reverted: Vec::new(),
            calls: Vec::new(),
            executed: 0,
            stopped: false,
        }
    }
}

impl Vm for ScriptedVm {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn instrument_module_from_addr(&mut self, address: u64) -> Result<(), Error> {
        self.instrumented.push(address);
        Ok(())
    }

    fn call(
        &mut self,
        target: u64,
        state: &GprState,
        hooks: &mut dyn InstrumentationHooks,
    ) -> Result<u64, Error> {
        self.calls.push((target, *state));
        let mut executed = 0;
        let mut stopped = false;
        for (index, step) in self.steps.iter().enumerate() {
            if hooks.pre_instruction(&step.inst, &step.pre, &step.fpr) == VmAction::Stop {
                stopped = true;
                break;
            }
            let reported = match &self.corrupt_post {
                Some((corrupt, inst)) if *corrupt == index => inst,
                _ => &step.inst,
            };
            if hooks.post_instruction(reported, &step.post, &step.fpr, &step.accesses)
                == VmAction::Stop
            {
                stopped = true;
                break;
            }
            executed += 1;
        }
        self.executed = executed;
        self.stopped = stopped;
        Ok(self.steps.last().map_or(0, |step| step.post.regs[0]))
    }

    fn redirect_entry(&mut self, target: u64) -> Result<(), Error> {
        self.redirected.push(target);
        Ok(())
    }

    fn revert_entry(&mut self, target: u64) -> Result<(), Error> {
        self.reverted.push(target);
        Ok(())
    }
}

/// A unique scratch file path for this test process
pub fn scratch_file(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("libafl_calltrace-{}-{name}", std::process::id()))
}
