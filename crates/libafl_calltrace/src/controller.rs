//! Selecting the traced function and running it inside the VM.

use core::{ffi::c_void, num::NonZeroUsize, ops::Range, ptr::NonNull};

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::{
    linker::Linker,
    memory::MemoryReader,
    module::ModuleSymbols,
    options::TraceOptions,
    trace::TraceSession,
    vm::{GprState, Vm},
    Error,
};

/// The function to trace
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceTarget {
    /// An exported symbol of a module
    Symbol {
        /// Module name, as the linker knows it
        module: String,
        /// Exported name
        symbol: String,
    },
    /// An offset from a module's base
    Offset {
        /// Module name, as the linker knows it
        module: String,
        /// Offset from the base, smaller than the module size
        offset: u64,
    },
    /// An absolute address inside some loaded module
    Address(u64),
}

/// Whether the target's entry point currently leads into the VM
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AttachState {
    /// The target runs natively
    #[default]
    Detached,
    /// The next call of the target is traced
    Attached,
}

/// An anonymous mapping the traced code runs on
#[derive(Debug)]
pub struct ExecutionStack {
    base: NonNull<c_void>,
    size: usize,
}

impl ExecutionStack {
    /// Maps `size` bytes of read/write memory
    pub fn new(size: usize) -> Result<Self, Error> {
        let len = NonZeroUsize::new(size)
            .ok_or_else(|| Error::illegal_argument("the execution stack cannot be empty"))?;
        let base = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )?
        };
        log::debug!("execution stack at {:p}, {size:#x} bytes", base.as_ptr());
        Ok(Self { base, size })
    }

    /// The mapped interval
    #[must_use]
    pub fn range(&self) -> Range<u64> {
        let start = self.base.as_ptr() as u64;
        start..start + self.size as u64
    }

    /// Initial stack pointer: the end of the mapping, 16-byte aligned
    #[must_use]
    pub fn top(&self) -> u64 {
        self.range().end & !0xf
    }
}

impl Drop for ExecutionStack {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.base, self.size) } {
            log::error!("Could not unmap the execution stack: {err}");
        }
    }
}

/// Owns the VM, the trace session and the execution stack of one traced function
#[derive(Debug)]
pub struct ExecutionController<V: Vm> {
    vm: V,
    session: TraceSession,
    stack: ExecutionStack,
    target: Option<u64>,
    state: AttachState,
}

impl<V: Vm> ExecutionController<V> {
    /// A controller tracing into `session`, with a dedicated stack of `stack_size` bytes
    pub fn new(vm: V, session: TraceSession, stack_size: usize) -> Result<Self, Error> {
        if vm.arch() != session.abi().arch() {
            return Err(Error::config(format!(
                "the VM runs {} code but the trace decodes {}",
                vm.arch(),
                session.abi().arch()
            )));
        }
        Ok(Self {
            vm,
            session,
            stack: ExecutionStack::new(stack_size)?,
            target: None,
            state: AttachState::Detached,
        })
    }

    /// A controller with a session built from `options`
    pub fn from_options(
        vm: V,
        options: &TraceOptions,
        linker: &dyn Linker,
        memory: Box<dyn MemoryReader>,
    ) -> Result<Self, Error> {
        let session = TraceSession::from_options(options, linker, memory)?;
        Self::new(vm, session, options.stack_size)
    }

    /// Resolves `target` and instruments its module. Returns the target address.
    ///
    /// Calls into the target's own module that no dispatcher decodes are named after its exports.
    pub fn init(&mut self, linker: &dyn Linker, target: &TraceTarget) -> Result<u64, Error> {
        let address = resolve_target(linker, target)?;
        self.vm.instrument_module_from_addr(address)?;
        if let Some(module) = linker.find_module_by_address(address) {
            self.session
                .registry_mut()
                .add_named_module(ModuleSymbols::from_linker(linker, &module));
        }
        self.target = Some(address);
        log::info!("tracing {target:?} at {address:#x}");
        Ok(address)
    }

    /// Calls the target with `registers` on the dedicated stack and traces it.
    /// Returns the target's return value.
    pub fn run(&mut self, registers: &GprState) -> Result<u64, Error> {
        let target = self.require_target()?;
        let mut state = *registers;
        state.sp = self.stack.top();
        self.session.set_stack_range(Some(self.stack.range()));
        self.trace(target, &state)
    }

    /// Redirects the target's entry point into the VM; the next native call of the target
    /// arrives in [`ExecutionController::on_redirected_entry`]
    pub fn run_attach(&mut self) -> Result<(), Error> {
        let target = self.require_target()?;
        if self.state == AttachState::Attached {
            log::debug!("{target:#x} is already attached");
            return Ok(());
        }
        self.vm.redirect_entry(target)?;
        self.state = AttachState::Attached;
        Ok(())
    }

    /// Entry of a call through the redirected entry point, with the caller's registers.
    ///
    /// Reverts the redirect, then traces the call on the caller's own stack.
    pub fn on_redirected_entry(&mut self, registers: &GprState) -> Result<u64, Error> {
        let target = self.require_target()?;
        if self.state != AttachState::Attached {
            return Err(Error::illegal_state(format!(
                "{target:#x} entered through a redirect that was never installed"
            )));
        }
        self.vm.revert_entry(target)?;
        self.state = AttachState::Detached;
        self.session.set_stack_range(None);
        self.trace(target, registers)
    }

    fn trace(&mut self, target: u64, state: &GprState) -> Result<u64, Error> {
        let ret = self.vm.call(target, state, &mut self.session);
        let finished = self.session.finish();
        let ret = ret?;
        finished?;
        Ok(ret)
    }

    fn require_target(&self) -> Result<u64, Error> {
        self.target
            .ok_or_else(|| Error::illegal_state("no trace target, init must succeed first"))
    }

    /// The resolved target address
    #[must_use]
    pub fn target(&self) -> Option<u64> {
        self.target
    }

    /// Whether the entry point is redirected
    #[must_use]
    pub fn state(&self) -> AttachState {
        self.state
    }

    /// The dedicated stack
    #[must_use]
    pub fn stack(&self) -> &ExecutionStack {
        &self.stack
    }

    /// The VM
    pub fn vm(&self) -> &V {
        &self.vm
    }

    /// The VM, mutably
    pub fn vm_mut(&mut self) -> &mut V {
        &mut self.vm
    }

    /// The trace session
    pub fn session(&self) -> &TraceSession {
        &self.session
    }

    /// The trace session, mutably
    pub fn session_mut(&mut self) -> &mut TraceSession {
        &mut self.session
    }
}

fn resolve_target(linker: &dyn Linker, target: &TraceTarget) -> Result<u64, Error> {
    let module_named = |name: &str| {
        linker
            .find_module_by_name(name)
            .ok_or_else(|| Error::config(format!("module {name} is not loaded")))
    };
    match target {
        TraceTarget::Symbol { module, symbol } => {
            let info = module_named(module)?;
            linker
                .find_export(&info, symbol)
                .ok_or_else(|| Error::config(format!("{module} does not export {symbol}")))
        }
        TraceTarget::Offset { module, offset } => {
            let info = module_named(module)?;
            if *offset >= info.size {
                return Err(Error::config(format!(
                    "offset {offset:#x} is outside {module} ({:#x} bytes)",
                    info.size
                )));
            }
            Ok(info.base + offset)
        }
        TraceTarget::Address(address) => linker
            .find_module_by_address(*address)
            .map(|_| *address)
            .ok_or_else(|| Error::config(format!("{address:#x} is not inside a loaded module"))),
    }
}
