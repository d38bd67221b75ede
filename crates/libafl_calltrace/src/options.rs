//! Tracer configuration, built programmatically or read from `LIBAFL_CALLTRACE_OPTIONS`.

use std::{env, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{vm::Arch, Error};

/// Name of the environment variable read by [`TraceOptions::parse_env_options`]
pub const OPTIONS_ENV_VAR: &str = "LIBAFL_CALLTRACE_OPTIONS";

/// How trace lines are written
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One human readable block per instruction
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(Error::config(format!("unknown output format '{s}'"))),
        }
    }
}

/// The options of a trace session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[allow(clippy::struct_excessive_bools)]
pub struct TraceOptions {
    /// Calling convention to decode with, the host's if unset
    #[builder(default, setter(strip_option))]
    pub arch: Option<Arch>,
    /// Module decoded as the C runtime
    #[builder(default = "libc.so".to_string(), setter(into))]
    pub libc_module: String,
    /// Module decoded as the compression library
    #[builder(default = "libz.so".to_string(), setter(into))]
    pub zlib_module: String,
    /// Module decoded as the JNI bridge
    #[builder(default = "libart.so".to_string(), setter(into))]
    pub jni_module: String,
    /// Decode `svc` instructions
    #[builder(default = true)]
    pub trace_syscalls: bool,
    /// File released allocations are hex-dumped to
    #[builder(default, setter(strip_option, into))]
    pub allocation_dump: Option<PathBuf>,
    /// Trace file; trace lines go through `log` if unset
    #[builder(default, setter(strip_option, into))]
    pub output: Option<PathBuf>,
    /// Format of the trace file
    #[builder(default)]
    pub format: OutputFormat,
    /// Attach the memory accesses of each instruction
    #[builder(default = true)]
    pub memory_accesses: bool,
    /// Attach the registers each instruction changed
    #[builder(default = true)]
    pub register_deltas: bool,
    /// Size of the execution stack used by `run`
    #[builder(default = 0x10_0000)]
    pub stack_size: usize,
    /// Longest C string read
    #[builder(default = 1024)]
    pub max_string_length: usize,
    /// Bytes hex-dumped for pointer return values
    #[builder(default = 16)]
    pub return_dump_size: usize,
    /// Bytes shown for buffer arguments
    #[builder(default = 64)]
    pub buffer_preview_size: usize,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The limits decoders render values with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSettings {
    /// Longest C string read
    pub max_string_length: usize,
    /// Bytes hex-dumped for pointer return values
    pub return_dump_size: usize,
    /// Bytes shown for buffer arguments
    pub buffer_preview_size: usize,
}

impl Default for RenderSettings {
    fn default() -> Self {
        TraceOptions::default().render_settings()
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, Error> {
    value
        .parse()
        .map_err(|_| Error::config(format!("option '{name}' expects true or false, got '{value}'")))
}

fn parse_size(name: &str, value: &str) -> Result<usize, Error> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| Error::config(format!("option '{name}' expects a size, got '{value}'")))
}

impl TraceOptions {
    /// Reads the options from `LIBAFL_CALLTRACE_OPTIONS`, defaults if it is unset
    pub fn parse_env_options() -> Result<Self, Error> {
        match env::var(OPTIONS_ENV_VAR) {
            Ok(options) => Self::parse(&options),
            Err(env::VarError::NotPresent) => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Parses `name=value` pairs separated by `:`, on top of the defaults
    pub fn parse(options: &str) -> Result<Self, Error> {
        let mut parsed = Self::default();
        for option in options.trim().split(':').filter(|o| !o.is_empty()) {
            let Some((name, value)) = option.split_once('=') else {
                return Err(Error::config(format!(
                    "expected a '=' in option '{option}'"
                )));
            };
            match name {
                "arch" => parsed.arch = Some(value.parse()?),
                "libc" => parsed.libc_module = value.to_string(),
                "zlib" => parsed.zlib_module = value.to_string(),
                "jni" => parsed.jni_module = value.to_string(),
                "syscalls" => parsed.trace_syscalls = parse_bool(name, value)?,
                "allocation-dump" => parsed.allocation_dump = Some(PathBuf::from(value)),
                "output" => parsed.output = Some(PathBuf::from(value)),
                "format" => parsed.format = value.parse()?,
                "memory-accesses" => parsed.memory_accesses = parse_bool(name, value)?,
                "register-deltas" => parsed.register_deltas = parse_bool(name, value)?,
                "stack-size" => parsed.stack_size = parse_size(name, value)?,
                "max-string-length" => parsed.max_string_length = parse_size(name, value)?,
                "return-dump-size" => parsed.return_dump_size = parse_size(name, value)?,
                "buffer-preview-size" => parsed.buffer_preview_size = parse_size(name, value)?,
                _ => return Err(Error::config(format!("unknown option '{name}'"))),
            }
        }
        log::debug!("parsed trace options: {parsed:?}");
        Ok(parsed)
    }

    /// The configured architecture, or the host's
    pub fn resolved_arch(&self) -> Result<Arch, Error> {
        self.arch.or_else(Arch::host).ok_or_else(|| {
            Error::unsupported("no architecture configured and the host is neither ARM nor AArch64")
        })
    }

    /// The rendering limits
    #[must_use]
    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            max_string_length: self.max_string_length,
            return_dump_size: self.return_dump_size,
            buffer_preview_size: self.buffer_preview_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{OutputFormat, TraceOptions};
    use crate::vm::Arch;

    #[test]
    fn defaults() {
        let options = TraceOptions::default();
        assert_eq!(options.libc_module, "libc.so");
        assert_eq!(options.zlib_module, "libz.so");
        assert_eq!(options.jni_module, "libart.so");
        assert!(options.trace_syscalls);
        assert_eq!(options.stack_size, 0x10_0000);
        assert_eq!(options.return_dump_size, 16);
        assert_eq!(options.format, OutputFormat::Text);
        assert_eq!(TraceOptions::parse("").unwrap(), options);
    }

    #[test]
    fn parse_pairs() {
        let options = TraceOptions::parse(
            "arch=arm:libc=libc.so.6:syscalls=false:stack-size=0x2000:format=json:allocation-dump=/tmp/allocs",
        )
        .unwrap();
        assert_eq!(options.arch, Some(Arch::Arm));
        assert_eq!(options.libc_module, "libc.so.6");
        assert!(!options.trace_syscalls);
        assert_eq!(options.stack_size, 0x2000);
        assert_eq!(options.format, OutputFormat::Json);
        assert_eq!(options.allocation_dump, Some(PathBuf::from("/tmp/allocs")));
        assert_eq!(options.resolved_arch().unwrap(), Arch::Arm);
    }

    #[test]
    fn malformed_options_are_config_errors() {
        assert!(TraceOptions::parse("syscalls").unwrap_err().is_config());
        assert!(TraceOptions::parse("colour=red").unwrap_err().is_config());
        assert!(TraceOptions::parse("syscalls=maybe").unwrap_err().is_config());
        assert!(TraceOptions::parse("stack-size=big").unwrap_err().is_config());
        assert!(TraceOptions::parse("arch=x86").unwrap_err().is_config());
    }

    #[test]
    fn builder() {
        let options = TraceOptions::builder()
            .arch(Arch::Aarch64)
            .libc_module("libc.so.6")
            .max_string_length(8)
            .build();
        assert_eq!(options.render_settings().max_string_length, 8);
        assert_eq!(options.zlib_module, "libz.so");
    }
}
