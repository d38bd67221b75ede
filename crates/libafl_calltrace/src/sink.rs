//! Where trace lines go.

use core::{cell::RefCell, fmt};
use std::{
    fs::File,
    io::{BufWriter, Write},
    rc::Rc,
};

use serde::Serialize;

use crate::{
    dispatch::ReturnType,
    options::{OutputFormat, TraceOptions},
    vm::{MemoryAccess, MemoryAccessType},
    Error,
};

/// Log target of [`LogSink`]
pub const LOG_TARGET: &str = "calltrace";

/// A register an instruction changed
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegisterDelta {
    /// Register name
    pub name: &'static str,
    /// Value before the instruction
    pub before: u64,
    /// Value after it
    pub after: u64,
}

/// A decoded call
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CallLine {
    /// Owning module, empty if unknown
    pub module: String,
    /// Symbol, or the target address in hex
    pub function: String,
    /// Rendered arguments
    pub arguments: Vec<String>,
    /// How the return value was rendered
    pub return_type: ReturnType,
    /// Rendered return value, `None` if the return was never observed
    pub return_value: Option<String>,
    /// Whether this was an `svc`
    pub is_syscall: bool,
}

impl fmt::Display for CallLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.module.is_empty() {
            write!(f, "{}!", self.module)?;
        }
        write!(f, "{}({})", self.function, self.arguments.join(", "))?;
        match &self.return_value {
            Some(value) => write!(f, " -> {}", value.replace('\n', "\n        ")),
            None => f.write_str(" -> ?"),
        }
    }
}

/// One traced instruction
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TraceLine {
    /// Address of the instruction
    pub pc: u64,
    /// Disassembly
    pub disassembly: String,
    /// Registers the instruction changed
    pub register_deltas: Vec<RegisterDelta>,
    /// The call this instruction made
    pub call: Option<CallLine>,
    /// Memory the instruction touched, outside the execution stack
    pub memory: Vec<MemoryAccess>,
}

impl fmt::Display for TraceLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}  {}", self.pc, self.disassembly)?;
        if !self.register_deltas.is_empty() {
            f.write_str(" ")?;
            for delta in &self.register_deltas {
                write!(f, " {}={:#x}->{:#x}", delta.name, delta.before, delta.after)?;
            }
        }
        if let Some(call) = &self.call {
            write!(f, "\n    {call}")?;
        }
        if !self.memory.is_empty() {
            f.write_str("\n    mem:")?;
            for access in &self.memory {
                let kind = match access.kind {
                    MemoryAccessType::Read => 'R',
                    MemoryAccessType::Write => 'W',
                };
                write!(
                    f,
                    " {kind} {:#x}[{}]={:#x}",
                    access.access_address, access.size, access.value
                )?;
            }
        }
        Ok(())
    }
}

/// Receives trace lines in program order
pub trait TraceSink {
    /// Writes one line; failures are logged, never returned
    fn emit(&mut self, line: &TraceLine);

    /// Flushes buffered lines
    fn flush(&mut self) {}
}

/// Emits lines through the `log` facade at info level
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl TraceSink for LogSink {
    fn emit(&mut self, line: &TraceLine) {
        log::info!(target: LOG_TARGET, "{line}");
    }
}

/// Writes text lines
#[derive(Debug)]
pub struct WriterSink<W: Write> {
    writer: W,
}

impl<W: Write> WriterSink<W> {
    /// Writes to `writer`
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// The underlying writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> TraceSink for WriterSink<W> {
    fn emit(&mut self, line: &TraceLine) {
        if let Err(err) = writeln!(self.writer, "{line}") {
            log::warn!("Could not write trace line: {err}");
        }
    }

    fn flush(&mut self) {
        if let Err(err) = self.writer.flush() {
            log::warn!("Could not flush trace: {err}");
        }
    }
}

/// Writes one JSON object per line
#[derive(Debug)]
pub struct JsonSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonSink<W> {
    /// Writes to `writer`
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// The underlying writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> TraceSink for JsonSink<W> {
    fn emit(&mut self, line: &TraceLine) {
        let written = serde_json::to_writer(&mut self.writer, line)
            .map_err(Error::from)
            .and_then(|()| writeln!(self.writer).map_err(Error::from));
        if let Err(err) = written {
            log::warn!("Could not write trace line: {err}");
        }
    }

    fn flush(&mut self) {
        if let Err(err) = self.writer.flush() {
            log::warn!("Could not flush trace: {err}");
        }
    }
}

/// Keeps every line in memory. Clones share the same lines.
#[derive(Clone, Debug, Default)]
pub struct CollectingSink {
    lines: Rc<RefCell<Vec<TraceLine>>>,
}

impl CollectingSink {
    /// No lines yet
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The lines collected so far
    #[must_use]
    pub fn lines(&self) -> Vec<TraceLine> {
        self.lines.borrow().clone()
    }

    /// The calls among the collected lines
    #[must_use]
    pub fn calls(&self) -> Vec<CallLine> {
        self.lines
            .borrow()
            .iter()
            .filter_map(|line| line.call.clone())
            .collect()
    }

    /// Number of lines collected
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.borrow().len()
    }

    /// Nothing collected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.borrow().is_empty()
    }
}

impl TraceSink for CollectingSink {
    fn emit(&mut self, line: &TraceLine) {
        self.lines.borrow_mut().push(line.clone());
    }
}

/// The sink `options` ask for: the log facade, or a text or JSON trace file
pub fn sink_from_options(options: &TraceOptions) -> Result<Box<dyn TraceSink>, Error> {
    let Some(path) = &options.output else {
        return Ok(Box::new(LogSink));
    };
    let file = BufWriter::new(File::create(path)?);
    log::info!("writing {:?} trace to {}", options.format, path.display());
    Ok(match options.format {
        OutputFormat::Text => Box::new(WriterSink::new(file)),
        OutputFormat::Json => Box::new(JsonSink::new(file)),
    })
}
