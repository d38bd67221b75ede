//! Decoding calls into known modules.
//!
//! Each [`Dispatcher`] owns one module (or the syscall interface) and knows how to turn the
//! registers of a call into named arguments, and the registers after its return into a
//! return value. The [`DispatchRegistry`] tries them in registration order.

use core::fmt::{self, Debug, Write as _};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::{
    abi::Abi,
    alloc::AllocationTable,
    linker::Linker,
    memory::MemoryReader,
    module::ModuleSymbols,
    options::{RenderSettings, TraceOptions},
    render::{buffer_preview, read_buffer_hexdump_from_address, read_string_from_address},
    trace::FunctionCall,
    vm::{Arch, FprState, GprState},
};

/// Declares the decodable functions of one module as an enum, one variant per export, with
/// the argument names, argument kinds and return type of each.
macro_rules! decoder_table {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $variant:ident = $symbol:literal ( $( $arg:ident : $kind:expr ),* ) -> $ret:ident
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        $vis enum $name {
            $(
                #[doc = concat!("`", $symbol, "`")]
                $variant,
            )*
        }

        impl $name {
            /// Every function of this table
            pub const ALL: &'static [Self] = &[$(Self::$variant),*];

            /// The function exported as `symbol`
            #[must_use]
            pub fn from_symbol(symbol: &str) -> Option<Self> {
                match symbol {
                    $($symbol => Some(Self::$variant),)*
                    _ => None,
                }
            }

            /// The exported name
            #[must_use]
            pub fn symbol(self) -> &'static str {
                match self {
                    $(Self::$variant => $symbol,)*
                }
            }

            fn table_signature(self) -> $crate::dispatch::Signature {
                match self {
                    $(Self::$variant => {
                        const ARGS: &[$crate::dispatch::Arg] = &[
                            $($crate::dispatch::Arg { name: stringify!($arg), kind: $kind }),*
                        ];
                        $crate::dispatch::Signature {
                            args: ARGS,
                            ret: $crate::dispatch::ReturnType::$ret,
                        }
                    })*
                }
            }
        }
    };
}

pub mod jni;
pub mod libc;
pub mod syscall;
pub mod zlib;

pub use jni::JniHandler;
pub use libc::LibcFunction;
pub use syscall::{Syscall, SyscallDispatcher};
pub use zlib::ZlibFunction;

/// How the return value of a decoded function is rendered
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReturnType {
    /// Not known, rendered raw unless the decoder knows better
    #[default]
    Unknown,
    /// Nothing is returned
    Void,
    /// An integer
    Number,
    /// A pointer, rendered as a hexdump of the memory it points to
    Pointer,
    /// A pointer to a NUL-terminated string
    String,
}

/// How one argument is rendered
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArgKind {
    /// Signed integer
    Int,
    /// Unsigned size or count
    Size,
    /// Raw hex value
    Hex,
    /// Data pointer, annotated with the allocation it points into
    Ptr,
    /// NUL-terminated string
    Str,
    /// Character
    Char,
    /// Buffer whose length is the argument with the given index
    Buf(usize),
    /// File descriptor
    Fd,
    /// Directory file descriptor of the `*at` family
    DirFd,
    /// `open` flags
    OpenFlags,
    /// File mode, octal
    Mode,
    /// `mmap` protection
    Prot,
    /// `mmap` flags
    MapFlags,
    /// `lseek` origin
    Whence,
    /// printf format string; the arguments after it are decoded from it
    Fmt,
    /// `z_stream *`
    ZStream,
    /// zlib flush mode
    ZFlush,
    /// JNI reference or ID
    JniRef,
    /// `JNINativeMethod *` whose element count is the argument with the given index
    JniNatives(usize),
    /// JNI array release mode
    JniRelease,
}

/// A named argument
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Arg {
    /// Parameter name as it appears in the trace
    pub name: &'static str,
    /// How to render it
    pub kind: ArgKind,
}

/// Arguments and return type of a function
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature {
    /// The fixed arguments
    pub args: &'static [Arg],
    /// The return type
    pub ret: ReturnType,
}

/// Where the arguments of the call being decoded are read from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgSource {
    /// The function calling convention, registers then stack
    Call,
    /// Syscall argument registers
    Syscall,
}

/// Everything a decoder may look at, or touch, while decoding one call
pub struct DecodeContext<'a> {
    /// Calling convention of the traced code
    pub abi: &'a dyn Abi,
    /// Memory of the traced code
    pub memory: &'a dyn MemoryReader,
    /// Allocation shadow table, updated by allocator functions
    pub allocations: &'a mut AllocationTable,
    /// Rendering limits
    pub settings: &'a RenderSettings,
    /// Registers at the call
    pub call_regs: &'a GprState,
    /// FP registers at the call
    pub call_fpr: &'a FprState,
    /// Registers once control came back, `None` while decoding arguments
    pub ret_regs: Option<&'a GprState>,
    /// How arguments are passed
    pub source: ArgSource,
}

impl Debug for DecodeContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeContext")
            .field("abi", &self.abi)
            .field("source", &self.source)
            .field("returned", &self.ret_regs.is_some())
            .finish_non_exhaustive()
    }
}

impl DecodeContext<'_> {
    /// The raw value of argument `index` of the call
    #[must_use]
    pub fn arg(&self, index: usize) -> u64 {
        match self.source {
            ArgSource::Call => self
                .abi
                .get_arg_register_value(self.call_regs, self.memory, index),
            ArgSource::Syscall => self.abi.syscall_arg(self.call_regs, index),
        }
    }

    /// The raw return value, 0 while the call has not returned
    #[must_use]
    pub fn ret(&self) -> u64 {
        self.ret_regs
            .map_or(0, |regs| self.abi.get_ret_register_value(regs, 0))
    }

    /// The return value as a signed register value
    #[must_use]
    pub fn ret_signed(&self) -> i64 {
        self.abi.to_signed(self.ret())
    }

    /// The string at `address`
    #[must_use]
    pub fn string_at(&self, address: u64) -> String {
        read_string_from_address(self.memory, address, self.settings.max_string_length)
    }

    /// A pointer, with the allocation it points into
    #[must_use]
    pub fn pointer(&self, address: u64) -> String {
        if address == 0 {
            return "NULL".to_string();
        }
        match self.allocations.offset_of(address) {
            Some((offset, index)) => format!("{address:#x}<alloc#{index}+{offset:#x}>"),
            None => format!("{address:#x}"),
        }
    }

    /// A number; negative values in decimal, everything else in hex
    #[must_use]
    pub fn number(&self, value: u64) -> String {
        let signed = self.abi.to_signed(value);
        if signed < 0 {
            signed.to_string()
        } else {
            format!("{value:#x}")
        }
    }

    /// Renders `value` as an argument of `kind`
    #[must_use]
    pub fn render(&self, kind: ArgKind, value: u64) -> String {
        match kind {
            ArgKind::Int => self.abi.to_signed(value).to_string(),
            ArgKind::Size => value.to_string(),
            ArgKind::Hex | ArgKind::JniRef => format!("{value:#x}"),
            ArgKind::Ptr => self.pointer(value),
            ArgKind::Str | ArgKind::Fmt => self.string_at(value),
            ArgKind::Char => render_char(value),
            ArgKind::Buf(len_index) => buffer_preview(
                self.memory,
                value,
                self.arg(len_index) as usize,
                self.settings.buffer_preview_size,
            ),
            ArgKind::Fd => self.abi.to_signed(value).to_string(),
            ArgKind::DirFd => {
                if self.abi.to_signed(value) == -100 {
                    "AT_FDCWD".to_string()
                } else {
                    self.abi.to_signed(value).to_string()
                }
            }
            ArgKind::OpenFlags => render_open_flags(value),
            ArgKind::Mode => format!("{value:#o}"),
            ArgKind::Prot => render_flags(value, PROT_FLAGS, "PROT_NONE"),
            ArgKind::MapFlags => render_flags(value, MAP_FLAGS, "0"),
            ArgKind::Whence => match value {
                0 => "SEEK_SET".to_string(),
                1 => "SEEK_CUR".to_string(),
                2 => "SEEK_END".to_string(),
                _ => value.to_string(),
            },
            ArgKind::ZStream => zlib::render_z_stream(self, value),
            ArgKind::ZFlush => zlib::render_flush(value),
            ArgKind::JniNatives(count_index) => {
                jni::render_native_methods(self, value, self.arg(count_index) as usize)
            }
            ArgKind::JniRelease => jni::render_release_mode(value),
        }
    }

    /// Renders the fixed arguments of `args`, expanding a trailing format string
    #[must_use]
    pub fn render_args(&self, args: &[Arg]) -> Vec<String> {
        let mut rendered = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            let value = self.arg(index);
            rendered.push(format!("{}={}", arg.name, self.render(arg.kind, value)));
            // a NULL format renders empty, like any other string
            if arg.kind == ArgKind::Fmt && value != 0 {
                let format = self.memory.read_c_string(value, self.settings.max_string_length);
                rendered.extend(self.render_varargs(&format, index + 1));
            }
        }
        rendered
    }

    /// Renders a return value of type `ret`
    #[must_use]
    pub fn render_ret(&self, ret: ReturnType) -> String {
        let value = self.ret();
        match ret {
            ReturnType::Void => "void".to_string(),
            ReturnType::Number => self.number(value),
            ReturnType::Unknown => format!("{value:#x}"),
            ReturnType::String => {
                if value == 0 {
                    "NULL".to_string()
                } else {
                    format!("{value:#x} \"{}\"", self.string_at(value))
                }
            }
            ReturnType::Pointer => {
                if value == 0 {
                    return "NULL".to_string();
                }
                let dump = read_buffer_hexdump_from_address(
                    self.memory,
                    value,
                    self.settings.return_dump_size,
                );
                if dump.is_empty() {
                    self.pointer(value)
                } else {
                    format!("{}\n{dump}", self.pointer(value))
                }
            }
        }
    }

    /// Decodes the variadic arguments described by a printf `format`, starting at `first`
    fn render_varargs(&self, format: &[u8], first: usize) -> Vec<String> {
        const MAX_CONVERSIONS: usize = 16;

        let mut out = Vec::new();
        let mut int_index = first;
        let mut float_index = 0;
        let mut chars = format.iter().copied().peekable();
        let narrow = self.abi.word_size() == 4;

        while let Some(c) = chars.next() {
            if c != b'%' || out.len() >= MAX_CONVERSIONS {
                continue;
            }
            let mut spec = String::from("%");
            let mut long_count = 0;
            let conversion = loop {
                let Some(next) = chars.next() else {
                    break None;
                };
                spec.push(next as char);
                match next {
                    b'%' if spec.len() == 2 => break None,
                    b'-' | b'+' | b' ' | b'#' | b'0'..=b'9' | b'.' | b'\'' => {}
                    b'*' => int_index += 1,
                    b'l' | b'q' | b'j' => long_count += 1,
                    b'h' | b'z' | b't' | b'L' => {}
                    _ => break Some(next),
                }
            };
            let Some(conversion) = conversion else {
                continue;
            };
            // 64-bit integers take an even register pair on 32-bit ARM
            let wide = narrow && (long_count >= 2 || spec.contains('j'));
            let value = match conversion {
                b'f' | b'F' | b'e' | b'E' | b'g' | b'G' | b'a' | b'A' => {
                    let rendered = if narrow {
                        int_index += int_index % 2;
                        let bits = self.arg(int_index) | (self.arg(int_index + 1) << 32);
                        int_index += 2;
                        f64::from_bits(bits).to_string()
                    } else {
                        let value = self.abi.float_arg(self.call_fpr, float_index);
                        float_index += 1;
                        value.map_or_else(|| "<double>".to_string(), |v| v.to_string())
                    };
                    out.push(format!("{spec}={rendered}"));
                    continue;
                }
                _ if wide => {
                    int_index += int_index % 2;
                    let value = self.arg(int_index) | (self.arg(int_index + 1) << 32);
                    int_index += 2;
                    value
                }
                _ => {
                    let value = self.arg(int_index);
                    int_index += 1;
                    value
                }
            };
            let rendered = match conversion {
                b'd' | b'i' => {
                    if wide || (!narrow && long_count > 0) {
                        (value as i64).to_string()
                    } else {
                        i64::from(value as u32 as i32).to_string()
                    }
                }
                b'u' => {
                    if wide || (!narrow && long_count > 0) {
                        value.to_string()
                    } else {
                        (value as u32).to_string()
                    }
                }
                b'x' | b'X' => format!("{value:#x}"),
                b'o' => format!("{value:#o}"),
                b'c' => render_char(value),
                b's' => self.string_at(value),
                b'p' | b'n' => self.pointer(value),
                _ => format!("{value:#x}"),
            };
            out.push(format!("{spec}={rendered}"));
        }
        out
    }
}

fn render_char(value: u64) -> String {
    let byte = value as u8;
    if byte.is_ascii_graphic() || byte == b' ' {
        format!("'{}'", byte as char)
    } else {
        format!("{byte:#x}")
    }
}

const PROT_FLAGS: &[(u64, &str)] = &[(1, "PROT_READ"), (2, "PROT_WRITE"), (4, "PROT_EXEC")];

const MAP_FLAGS: &[(u64, &str)] = &[
    (0x1, "MAP_SHARED"),
    (0x2, "MAP_PRIVATE"),
    (0x10, "MAP_FIXED"),
    (0x20, "MAP_ANONYMOUS"),
    (0x100, "MAP_GROWSDOWN"),
    (0x800, "MAP_DENYWRITE"),
    (0x1000, "MAP_EXECUTABLE"),
    (0x2000, "MAP_LOCKED"),
    (0x4000, "MAP_NORESERVE"),
    (0x8000, "MAP_POPULATE"),
    (0x20000, "MAP_STACK"),
    (0x10_0000, "MAP_FIXED_NOREPLACE"),
];

// ARM and AArch64 share these values
const OPEN_FLAGS: &[(u64, &str)] = &[
    (0o100, "O_CREAT"),
    (0o200, "O_EXCL"),
    (0o400, "O_NOCTTY"),
    (0o1000, "O_TRUNC"),
    (0o2000, "O_APPEND"),
    (0o4000, "O_NONBLOCK"),
    (0o40000, "O_DIRECTORY"),
    (0o100000, "O_NOFOLLOW"),
    (0o200000, "O_DIRECT"),
    (0o400000, "O_LARGEFILE"),
    (0o2000000, "O_CLOEXEC"),
];

/// `A|B|0x..` for the bits of `value` found in `table`
#[must_use]
pub fn render_flags(value: u64, table: &[(u64, &str)], zero: &str) -> String {
    if value == 0 {
        return zero.to_string();
    }
    let mut rest = value;
    let mut out = String::new();
    for (bit, name) in table {
        if rest & bit != 0 {
            if !out.is_empty() {
                out.push('|');
            }
            out.push_str(name);
            rest &= !bit;
        }
    }
    if rest != 0 {
        if !out.is_empty() {
            out.push('|');
        }
        let _ = write!(out, "{rest:#x}");
    }
    out
}

fn render_open_flags(value: u64) -> String {
    let access = match value & 3 {
        0 => "O_RDONLY",
        1 => "O_WRONLY",
        2 => "O_RDWR",
        _ => "O_ACCMODE",
    };
    let rest = value & !3;
    if rest == 0 {
        access.to_string()
    } else {
        format!("{access}|{}", render_flags(rest, OPEN_FLAGS, ""))
    }
}

/// Decoding of one function
pub trait Decoder: Copy + Debug {
    /// Arguments and return type
    fn signature(&self) -> Signature;

    /// Renders the arguments of a call
    fn decode_args(&self, cx: &mut DecodeContext<'_>) -> Vec<String> {
        cx.render_args(self.signature().args)
    }

    /// Renders the return value once the call returned
    fn decode_ret(&self, cx: &mut DecodeContext<'_>) -> String {
        cx.render_ret(self.signature().ret)
    }
}

/// The raw argument registers, for calls nobody knows how to decode
pub fn common_args(call: &mut FunctionCall, cx: &DecodeContext<'_>) {
    let count = match cx.source {
        ArgSource::Call => cx.abi.arg_register_count(),
        ArgSource::Syscall => cx.abi.syscall_arg_count(),
    };
    call.arguments = (0..count).map(|i| format!("{:#x}", cx.arg(i))).collect();
    call.return_type = ReturnType::Unknown;
}

/// The raw return register, for calls nobody knows how to decode
pub fn common_ret(call: &mut FunctionCall, cx: &DecodeContext<'_>) {
    call.return_value = Some(format!("{:#x}", cx.ret()));
}

/// Decodes the calls one module (or the syscall interface) is responsible for
pub trait Dispatcher: Debug {
    /// Name shown as the owning module
    fn name(&self) -> &str;

    /// Whether calls to `address` belong to this dispatcher
    fn is_owned(&self, address: u64) -> bool;

    /// Resolves and decodes the arguments of `call`. Returns `false` if not owned.
    fn dispatch_args(&self, call: &mut FunctionCall, cx: &mut DecodeContext<'_>) -> bool;

    /// Decodes the return value of `call`. Returns `false` if not owned.
    fn dispatch_ret(&self, call: &mut FunctionCall, cx: &mut DecodeContext<'_>) -> bool;
}

/// A module with a [`Decoder`] per exported function that has one
#[derive(Debug)]
pub struct ModuleDispatcher<D> {
    symbols: ModuleSymbols,
    handlers: HashMap<u64, D>,
}

impl<D: Decoder> ModuleDispatcher<D> {
    /// Binds a decoder to every address with an alias `resolve` knows.
    ///
    /// The first recognized alias becomes the name calls to that address are shown with.
    pub fn new(mut symbols: ModuleSymbols, resolve: impl Fn(&str) -> Option<D>) -> Self {
        let bound: Vec<(u64, String, D)> = symbols
            .iter()
            .filter_map(|(address, names)| {
                names.iter().find_map(|name| {
                    resolve(name).map(|decoder| (address, name.clone(), decoder))
                })
            })
            .collect();
        let mut handlers = HashMap::with_capacity(bound.len());
        for (address, name, decoder) in bound {
            symbols.prefer(address, &name);
            handlers.insert(address, decoder);
        }
        log::debug!(
            "{}: {} of {} symbols have decoders",
            symbols.name(),
            handlers.len(),
            symbols.len()
        );
        Self { symbols, handlers }
    }

    /// The module's symbols
    #[must_use]
    pub fn symbols(&self) -> &ModuleSymbols {
        &self.symbols
    }

    /// The decoder bound to `address`
    #[must_use]
    pub fn handler(&self, address: u64) -> Option<D> {
        self.handlers.get(&address).copied()
    }
}

impl<D: Decoder> Dispatcher for ModuleDispatcher<D> {
    fn name(&self) -> &str {
        self.symbols.name()
    }

    fn is_owned(&self, address: u64) -> bool {
        self.symbols.is_owned(address)
    }

    fn dispatch_args(&self, call: &mut FunctionCall, cx: &mut DecodeContext<'_>) -> bool {
        if !self.is_owned(call.target_address) {
            return false;
        }
        call.owning_module_name = self.name().to_string();
        call.function_name = self
            .symbols
            .resolve_symbol(call.target_address)
            .map(str::to_string);
        match self.handler(call.target_address) {
            Some(decoder) => {
                call.arguments = decoder.decode_args(cx);
                call.return_type = decoder.signature().ret;
            }
            None => common_args(call, cx),
        }
        true
    }

    fn dispatch_ret(&self, call: &mut FunctionCall, cx: &mut DecodeContext<'_>) -> bool {
        if !self.is_owned(call.target_address) {
            return false;
        }
        match self.handler(call.target_address) {
            Some(decoder) => call.return_value = Some(decoder.decode_ret(cx)),
            None => common_ret(call, cx),
        }
        true
    }
}

/// The C runtime dispatcher
pub type LibcDispatcher = ModuleDispatcher<LibcFunction>;
/// The compression library dispatcher
pub type ZlibDispatcher = ModuleDispatcher<ZlibFunction>;
/// The JNI bridge dispatcher
pub type JniDispatcher = ModuleDispatcher<JniHandler>;

/// All dispatchers of a session, tried in registration order; syscalls go first
#[derive(Debug, Default)]
pub struct DispatchRegistry {
    syscalls: Option<SyscallDispatcher>,
    dispatchers: Vec<Box<dyn Dispatcher>>,
    named_modules: Vec<ModuleSymbols>,
}

impl DispatchRegistry {
    /// No dispatchers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The dispatchers for the modules named in `options`, looked up through `linker`.
    ///
    /// Modules that are not loaded are skipped with a warning.
    #[must_use]
    pub fn from_linker(linker: &dyn Linker, options: &TraceOptions, arch: Arch) -> Self {
        let mut registry = Self::new();
        if options.trace_syscalls {
            registry.set_syscall_dispatcher(SyscallDispatcher::new(arch));
        }

        let symbols_of = |name: &str| {
            let module = linker.find_module_by_name(name);
            if module.is_none() {
                log::warn!("module {name} is not loaded, its calls will not be decoded");
            }
            module.map(|module| ModuleSymbols::from_linker(linker, &module))
        };
        if let Some(symbols) = symbols_of(&options.libc_module) {
            registry.register(Box::new(LibcDispatcher::new(
                symbols,
                LibcFunction::from_symbol,
            )));
        }
        if let Some(symbols) = symbols_of(&options.zlib_module) {
            registry.register(Box::new(ZlibDispatcher::new(
                symbols,
                ZlibFunction::from_symbol,
            )));
        }
        if let Some(symbols) = symbols_of(&options.jni_module) {
            let symbols = symbols.renamed(|name| jni::demangle_jni_name(name).map(str::to_string));
            registry.register(Box::new(JniDispatcher::new(symbols, JniHandler::from_symbol)));
        }
        registry
    }

    /// Routes every syscall to `syscalls`
    pub fn set_syscall_dispatcher(&mut self, syscalls: SyscallDispatcher) {
        self.syscalls = Some(syscalls);
    }

    /// Appends a module dispatcher; earlier ones win on overlapping ranges
    pub fn register(&mut self, dispatcher: Box<dyn Dispatcher>) {
        log::debug!("registering dispatcher {}", dispatcher.name());
        self.dispatchers.push(dispatcher);
    }

    /// A module used only to name call targets the dispatchers don't own.
    /// A module already known under the same name is not added twice.
    pub fn add_named_module(&mut self, symbols: ModuleSymbols) {
        if self.named_modules.iter().any(|m| m.name() == symbols.name()) {
            return;
        }
        log::debug!("naming calls into {}", symbols.name());
        self.named_modules.push(symbols);
    }

    /// Registered module dispatchers, in order
    #[must_use]
    pub fn dispatchers(&self) -> &[Box<dyn Dispatcher>] {
        &self.dispatchers
    }

    /// Whether some module dispatcher owns `address`
    #[must_use]
    pub fn is_owned(&self, address: u64) -> bool {
        self.dispatchers.iter().any(|d| d.is_owned(address))
    }

    /// Decodes the arguments of `call` with the syscall dispatcher or the first module
    /// dispatcher owning its target. Returns `false` if nobody handled it.
    pub fn dispatch_args(&self, call: &mut FunctionCall, cx: &mut DecodeContext<'_>) -> bool {
        if call.is_syscall {
            return self
                .syscalls
                .as_ref()
                .is_some_and(|syscalls| syscalls.dispatch_args(call, cx));
        }
        self.dispatchers
            .iter()
            .any(|dispatcher| dispatcher.dispatch_args(call, cx))
    }

    /// Decodes the return value of `call`, routed like [`DispatchRegistry::dispatch_args`]
    pub fn dispatch_ret(&self, call: &mut FunctionCall, cx: &mut DecodeContext<'_>) -> bool {
        if call.is_syscall {
            return self
                .syscalls
                .as_ref()
                .is_some_and(|syscalls| syscalls.dispatch_ret(call, cx));
        }
        self.dispatchers
            .iter()
            .any(|dispatcher| dispatcher.dispatch_ret(call, cx))
    }

    /// Raw register dump for a call no dispatcher decodes, named if the target is known
    pub fn common_args(&self, call: &mut FunctionCall, cx: &DecodeContext<'_>) {
        if call.is_syscall {
            call.owning_module_name = syscall::KERNEL_MODULE.to_string();
            call.function_name = Some(format!("syscall_{}", cx.abi.syscall_number(cx.call_regs)));
        } else if let Some(module) = self
            .named_modules
            .iter()
            .find(|m| m.is_owned(call.target_address))
        {
            call.owning_module_name = module.name().to_string();
            call.function_name = module
                .resolve_symbol(call.target_address)
                .map(str::to_string);
        }
        common_args(call, cx);
    }

    /// Raw return register for a call no dispatcher decodes
    pub fn common_ret(&self, call: &mut FunctionCall, cx: &DecodeContext<'_>) {
        common_ret(call, cx);
    }
}
