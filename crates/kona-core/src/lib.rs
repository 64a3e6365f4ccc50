//! Kona VM Interpreter Core
//!
//! This crate provides the dispatch engine of the Kona virtual machine:
//! - Tagged value model and heap object layouts
//! - Bump-allocating young/old spaces with a remembered-set write barrier
//! - Method-dispatch lookup cache and subtype-test cache
//! - Value stack, frame model and the entry/exit bridge to compiled code
//! - Parameter binding, call protocol and exception unwinding
//! - The KBC dispatch loop itself
//!
//! The surrounding managed runtime (full garbage collector, bytecode loader,
//! optimizing compiler, debugger) is out of scope; its contracts are modeled
//! by [`runtime::RuntimeEnv`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod gc;
pub mod object;
pub mod program;
pub mod runtime;
pub mod stack;
pub mod value;
pub mod vm;

pub use cache::LookupCache;
pub use gc::{ClassId, Heap};
pub use object::ArgsDescriptor;
pub use program::{Bytecode, Class, Field, Function, FunctionKind, Program};
pub use runtime::{NativeArguments, RuntimeEnv, RuntimeStats, Thread, Unwind};
pub use value::Value;
pub use vm::{Interpreter, InterpreterOptions};

/// Interpreter-level failures.
///
/// These are host-visible faults: malformed bytecode reaching the dispatch
/// loop, or misuse of the invocation API. Managed-language errors (thrown
/// exceptions, type errors, noSuchMethod, ...) are *values* returned from
/// [`Interpreter::call`] and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Malformed bytecode reached the dispatch loop.
    #[error("malformed bytecode: {0}")]
    Bytecode(#[from] kona_bytecode::DecodeError),

    /// A function without bytecode was passed to `call`.
    #[error("function {0} is not callable from the interpreter entry")]
    Uncallable(u32),

    /// The value stack cannot hold the entry frame.
    #[error("interpreter stack exhausted")]
    StackExhausted,

    /// Invariant violation; the interpreter state is no longer trustworthy.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Interpreter result alias.
pub type VmResult<T> = Result<T, VmError>;
