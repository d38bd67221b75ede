//! Turning the VM's per-instruction callbacks into calls with arguments and return values.
//!
//! There is no call stack. A call is decoded in two steps: its arguments after the call
//! instruction executed, its return value at the next instrumented instruction, which is
//! the one control came back to. Between the two, the call record waits in the `previous`
//! slot of a two-slot ring.
//!
//! Only one call can wait for its return. A call made from inside an instrumented callee
//! is completed as soon as the callee's first instruction executes; nested and re-entrant
//! calls are not tracked.

use core::{fmt, ops::Range};
use std::{fs::File, io::BufWriter};

use crate::{
    abi::{abi_for, Abi},
    alloc::AllocationTable,
    dispatch::{ArgSource, DecodeContext, DispatchRegistry, ReturnType},
    linker::Linker,
    memory::MemoryReader,
    options::{RenderSettings, TraceOptions},
    sink::{sink_from_options, CallLine, RegisterDelta, TraceLine, TraceSink},
    vm::{FprState, GprState, InstAnalysis, InstrumentationHooks, MemoryAccess, VmAction},
    Error,
};

/// A call observed at a call boundary, filled in as it gets decoded
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FunctionCall {
    /// Address of the call instruction until it executed, the callee's entry afterwards
    pub target_address: u64,
    /// Resolved symbol
    pub function_name: Option<String>,
    /// Module the target belongs to, empty if unknown
    pub owning_module_name: String,
    /// Rendered arguments
    pub arguments: Vec<String>,
    /// How the return value is rendered
    pub return_type: ReturnType,
    /// Rendered return value, set once control came back
    pub return_value: Option<String>,
    /// Raised by an `svc`
    pub is_syscall: bool,
}

impl FunctionCall {
    /// A call made by the instruction at `pc`
    #[must_use]
    pub fn new(pc: u64) -> Self {
        Self {
            target_address: pc,
            ..Self::default()
        }
    }

    /// A syscall raised by the instruction at `pc`
    #[must_use]
    pub fn syscall(pc: u64) -> Self {
        Self {
            is_syscall: true,
            ..Self::new(pc)
        }
    }

    /// The call as it appears in a trace line
    #[must_use]
    pub fn to_line(&self) -> CallLine {
        CallLine {
            module: self.owning_module_name.clone(),
            function: self
                .function_name
                .clone()
                .unwrap_or_else(|| format!("{:#x}", self.target_address)),
            arguments: self.arguments.clone(),
            return_type: self.return_type,
            return_value: self.return_value.clone(),
            is_syscall: self.is_syscall,
        }
    }
}

impl fmt::Display for FunctionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.to_line().fmt(f)
    }
}

/// One instrumented instruction
#[derive(Clone, Debug)]
pub struct TraceRecord {
    /// Address of the instruction
    pub program_counter: u64,
    /// What the VM told us about it
    pub instruction: InstAnalysis,
    /// Registers before it executed
    pub pre_state: GprState,
    /// FP registers before it executed
    pub fpr: FprState,
    /// Registers after it executed
    pub post_state: Option<GprState>,
    /// The call it made
    pub call: Option<FunctionCall>,
    /// Already written to the sink
    pub emitted: bool,
}

impl TraceRecord {
    /// A record for `instruction`, about to execute with `pre_state`
    #[must_use]
    pub fn new(instruction: InstAnalysis, pre_state: GprState, fpr: FprState) -> Self {
        Self {
            program_counter: instruction.address,
            instruction,
            pre_state,
            fpr,
            post_state: None,
            call: None,
            emitted: false,
        }
    }

    /// The trace line of this record
    #[must_use]
    pub fn to_line(&self, abi: &dyn Abi, memory: Vec<MemoryAccess>, with_deltas: bool) -> TraceLine {
        let register_deltas = match (&self.post_state, with_deltas) {
            (Some(post), true) => abi
                .register_names()
                .iter()
                .zip(abi.register_values(&self.pre_state))
                .zip(abi.register_values(post))
                .filter(|((_, before), after)| before != after)
                .map(|((name, before), after)| RegisterDelta {
                    name: *name,
                    before,
                    after,
                })
                .collect(),
            _ => Vec::new(),
        };
        TraceLine {
            pc: self.program_counter,
            disassembly: self.instruction.disassembly.clone(),
            register_deltas,
            call: self.call.as_ref().map(FunctionCall::to_line),
            memory,
        }
    }
}

/// The two live records: the instruction being traced and the one before it
#[derive(Debug, Default)]
pub struct RecordSlots {
    current: Option<TraceRecord>,
    previous: Option<TraceRecord>,
}

impl RecordSlots {
    /// Both slots empty
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `record` current, shifting current to previous. Returns the record that fell
    /// out of the ring.
    pub fn push(&mut self, record: TraceRecord) -> Option<TraceRecord> {
        let retired = self.previous.take();
        self.previous = self.current.replace(record);
        retired
    }

    /// The instruction being traced
    #[must_use]
    pub fn current(&self) -> Option<&TraceRecord> {
        self.current.as_ref()
    }

    /// The instruction before it
    #[must_use]
    pub fn previous(&self) -> Option<&TraceRecord> {
        self.previous.as_ref()
    }

    /// `(previous, current)`, mutably
    pub fn pair_mut(&mut self) -> (Option<&mut TraceRecord>, Option<&mut TraceRecord>) {
        (self.previous.as_mut(), self.current.as_mut())
    }

    /// Number of live records, never more than 2
    #[must_use]
    pub fn live(&self) -> usize {
        usize::from(self.current.is_some()) + usize::from(self.previous.is_some())
    }

    /// Empties both slots, oldest record first
    pub fn drain(&mut self) -> impl Iterator<Item = TraceRecord> {
        [self.previous.take(), self.current.take()]
            .into_iter()
            .flatten()
    }
}

/// Decodes the arguments of `call`: full decoding for syscalls and module-owned targets,
/// the raw argument registers for everything else
fn decode_args(registry: &DispatchRegistry, call: &mut FunctionCall, cx: &mut DecodeContext<'_>) {
    let decoded = (call.is_syscall || registry.is_owned(call.target_address))
        && registry.dispatch_args(call, cx);
    if !decoded {
        registry.common_args(call, cx);
    }
}

/// Decodes the return value of `call`, routed like [`decode_args`]
fn decode_ret(registry: &DispatchRegistry, call: &mut FunctionCall, cx: &mut DecodeContext<'_>) {
    let decoded = (call.is_syscall || registry.is_owned(call.target_address))
        && registry.dispatch_ret(call, cx);
    if !decoded {
        registry.common_ret(call, cx);
    }
}

fn arg_source(call: &FunctionCall) -> ArgSource {
    if call.is_syscall {
        ArgSource::Syscall
    } else {
        ArgSource::Call
    }
}

/// The state of one trace: dispatchers, allocation table, sink and the two live records.
///
/// Implements [`InstrumentationHooks`]; the VM drives it in program order.
pub struct TraceSession {
    abi: Box<dyn Abi>,
    registry: DispatchRegistry,
    allocations: AllocationTable,
    memory: Box<dyn MemoryReader>,
    sink: Box<dyn TraceSink>,
    slots: RecordSlots,
    settings: RenderSettings,
    memory_accesses: bool,
    register_deltas: bool,
    stack: Option<Range<u64>>,
    halted: bool,
}

impl fmt::Debug for TraceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceSession")
            .field("abi", &self.abi)
            .field("registry", &self.registry)
            .field("allocations", &self.allocations)
            .field("slots", &self.slots)
            .field("stack", &self.stack)
            .field("halted", &self.halted)
            .finish_non_exhaustive()
    }
}

impl TraceSession {
    /// A session decoding with `abi` and `registry`, reading `memory` and writing to `sink`
    #[must_use]
    pub fn new(
        abi: Box<dyn Abi>,
        registry: DispatchRegistry,
        memory: Box<dyn MemoryReader>,
        sink: Box<dyn TraceSink>,
    ) -> Self {
        Self {
            abi,
            registry,
            allocations: AllocationTable::new(),
            memory,
            sink,
            slots: RecordSlots::new(),
            settings: RenderSettings::default(),
            memory_accesses: true,
            register_deltas: true,
            stack: None,
            halted: false,
        }
    }

    /// Everything `options` configure: architecture, dispatchers for the modules `linker`
    /// knows, output sink and allocation dump file
    pub fn from_options(
        options: &TraceOptions,
        linker: &dyn Linker,
        memory: Box<dyn MemoryReader>,
    ) -> Result<Self, Error> {
        let arch = options.resolved_arch()?;
        let registry = DispatchRegistry::from_linker(linker, options, arch);
        let sink = sink_from_options(options)?;
        let mut session = Self::new(abi_for(arch), registry, memory, sink).with_options(options);
        if let Some(path) = &options.allocation_dump {
            let dump = BufWriter::new(File::create(path)?);
            session.allocations = AllocationTable::with_dump_sink(Box::new(dump));
        }
        Ok(session)
    }

    /// Applies the rendering and line options of `options`
    #[must_use]
    pub fn with_options(mut self, options: &TraceOptions) -> Self {
        self.settings = options.render_settings();
        self.memory_accesses = options.memory_accesses;
        self.register_deltas = options.register_deltas;
        self
    }

    /// Replaces the allocation table
    #[must_use]
    pub fn with_allocations(mut self, allocations: AllocationTable) -> Self {
        self.allocations = allocations;
        self
    }

    /// Memory accesses inside `stack` are left out of trace lines
    pub fn set_stack_range(&mut self, stack: Option<Range<u64>>) {
        self.stack = stack;
    }

    /// The calling convention
    #[must_use]
    pub fn abi(&self) -> &dyn Abi {
        self.abi.as_ref()
    }

    /// The dispatchers
    #[must_use]
    pub fn registry(&self) -> &DispatchRegistry {
        &self.registry
    }

    /// The dispatchers, to register more
    pub fn registry_mut(&mut self) -> &mut DispatchRegistry {
        &mut self.registry
    }

    /// The allocation shadow table
    #[must_use]
    pub fn allocations(&self) -> &AllocationTable {
        &self.allocations
    }

    /// The live records
    #[must_use]
    pub fn slots(&self) -> &RecordSlots {
        &self.slots
    }

    /// Whether a protocol violation stopped this session
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Writes out the records still waiting and flushes the sink.
    ///
    /// Returns a protocol error if the session was halted; the next trace starts fresh.
    pub fn finish(&mut self) -> Result<(), Error> {
        let pending: Vec<TraceRecord> = self.slots.drain().collect();
        for record in pending {
            self.retire(record);
        }
        self.sink.flush();
        if core::mem::take(&mut self.halted) {
            return Err(Error::protocol("the trace was stopped by a protocol violation"));
        }
        Ok(())
    }

    fn emit(&mut self, record: &TraceRecord, accesses: &[MemoryAccess]) {
        let memory = self.filter_accesses(accesses);
        let line = record.to_line(self.abi.as_ref(), memory, self.register_deltas);
        self.sink.emit(&line);
    }

    fn filter_accesses(&self, accesses: &[MemoryAccess]) -> Vec<MemoryAccess> {
        if !self.memory_accesses {
            return Vec::new();
        }
        accesses
            .iter()
            .filter(|access| {
                self.stack
                    .as_ref()
                    .map_or(true, |stack| !stack.contains(&access.access_address))
            })
            .copied()
            .collect()
    }

    /// A record leaves the ring. A call whose return was never observed is written out
    /// without a return value.
    fn retire(&mut self, record: TraceRecord) {
        if record.emitted {
            return;
        }
        match &record.call {
            Some(call) => {
                log::warn!(
                    "call at {:#x} to {:#x} retired before its return was observed",
                    record.program_counter,
                    call.target_address
                );
                self.emit(&record, &[]);
            }
            None => log::debug!(
                "instruction at {:#x} never completed",
                record.program_counter
            ),
        }
    }

    fn violation(&mut self, err: &Error) -> VmAction {
        log::error!("{err}, stopping the trace");
        self.halted = true;
        VmAction::Stop
    }

    fn post(
        &mut self,
        inst: &InstAnalysis,
        gpr: &GprState,
        accesses: &[MemoryAccess],
    ) -> Result<(), Error> {
        let (previous, current) = self.slots.pair_mut();
        let Some(current) = current else {
            return Err(Error::protocol(format!(
                "post-instruction event at {:#x} without a traced instruction",
                inst.address
            )));
        };
        if current.program_counter != inst.address {
            return Err(Error::protocol(format!(
                "post-instruction event at {:#x} while tracing {:#x}",
                inst.address, current.program_counter
            )));
        }
        current.post_state = Some(*gpr);

        if let Some(call) = current.call.as_mut() {
            call.target_address = gpr.pc;
            let mut cx = DecodeContext {
                abi: self.abi.as_ref(),
                memory: self.memory.as_ref(),
                allocations: &mut self.allocations,
                settings: &self.settings,
                call_regs: &current.pre_state,
                call_fpr: &current.fpr,
                ret_regs: None,
                source: arg_source(call),
            };
            decode_args(&self.registry, call, &mut cx);
        }

        // control came back from the call made by the previous instruction
        let mut completed = None;
        if let Some(previous) = previous {
            if let (Some(call), false) = (previous.call.as_mut(), previous.emitted) {
                let mut cx = DecodeContext {
                    abi: self.abi.as_ref(),
                    memory: self.memory.as_ref(),
                    allocations: &mut self.allocations,
                    settings: &self.settings,
                    call_regs: &previous.pre_state,
                    call_fpr: &previous.fpr,
                    ret_regs: Some(&current.pre_state),
                    source: arg_source(call),
                };
                decode_ret(&self.registry, call, &mut cx);
                previous.emitted = true;
                completed = Some(previous.clone());
            }
        }
        let current = (current.call.is_none()).then(|| {
            current.emitted = true;
            current.clone()
        });

        if let Some(previous) = completed {
            self.emit(&previous, &[]);
        }
        if let Some(current) = current {
            self.emit(&current, accesses);
        }
        Ok(())
    }
}

impl InstrumentationHooks for TraceSession {
    fn pre_instruction(&mut self, inst: &InstAnalysis, gpr: &GprState, fpr: &FprState) -> VmAction {
        if self.halted {
            return VmAction::Stop;
        }
        let pending = self
            .slots
            .current()
            .filter(|record| record.post_state.is_none())
            .map(|record| record.program_counter);
        if let Some(pending) = pending {
            let err = Error::protocol(format!(
                "pre-instruction event at {:#x} before {pending:#x} completed",
                inst.address
            ));
            return self.violation(&err);
        }
        let mut record = TraceRecord::new(inst.clone(), *gpr, *fpr);
        if inst.is_call_boundary() {
            record.call = Some(FunctionCall::new(inst.address));
        }
        if self.abi.is_syscall(inst) && record.call.is_none() {
            record.call = Some(FunctionCall::syscall(inst.address));
        }
        if let Some(retired) = self.slots.push(record) {
            self.retire(retired);
        }
        VmAction::Continue
    }

    fn post_instruction(
        &mut self,
        inst: &InstAnalysis,
        gpr: &GprState,
        _fpr: &FprState,
        accesses: &[MemoryAccess],
    ) -> VmAction {
        if self.halted {
            return VmAction::Stop;
        }
        match self.post(inst, gpr, accesses) {
            Ok(()) => VmAction::Continue,
            Err(err) => self.violation(&err),
        }
    }

    fn call_transfer(&mut self, target: u64, _gpr: &GprState) -> VmAction {
        log::trace!("leaving instrumented code towards {target:#x}");
        VmAction::Continue
    }
}
