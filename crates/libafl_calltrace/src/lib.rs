/*!
An instruction-level call tracer for ARM and AArch64 code running inside a DBI VM.

Every call and syscall the traced function makes is decoded into named arguments and a
return value, with heap allocations tracked along the way.
*/
#![doc = include_str!("../README.md")]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
))]
#![cfg_attr(test, deny(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
))]
#![cfg_attr(
    test,
    deny(
        bad_style,
        dead_code,
        improper_ctypes,
        non_shorthand_field_patterns,
        no_mangle_generic_items,
        overflowing_literals,
        path_statements,
        patterns_in_fns_without_body,
        unconditional_recursion,
        unused_allocation,
        unused_comparisons,
        unused_parens,
        while_true
    )
)]

pub mod error;
pub use error::Error;

pub mod abi;
pub mod alloc;
pub mod controller;
pub mod dispatch;
pub mod linker;
pub mod memory;
pub mod module;
pub mod options;
pub mod render;
pub mod sink;
pub mod trace;
pub mod vm;

pub use controller::{ExecutionController, TraceTarget};
pub use options::TraceOptions;
pub use trace::TraceSession;
