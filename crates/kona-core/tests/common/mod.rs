//! Shared harness for interpreter integration tests
//!
//! Assembles functions with `kona-bytecode` and runs them through
//! `Interpreter::call` against a bootstrapped `RuntimeEnv`.

#![allow(dead_code)]

use kona_bytecode::BytecodeWriter;
use kona_core::program::{ExceptionHandler, Function, FunctionData, FunctionKind};
use kona_core::{Interpreter, RuntimeEnv, Value};

pub struct World {
    pub env: RuntimeEnv,
    pub interp: Interpreter,
}

impl World {
    pub fn new() -> World {
        World {
            env: RuntimeEnv::new(),
            interp: Interpreter::default(),
        }
    }

    /// Declare a function without a body (so its id can appear in pools).
    pub fn declare(&mut self, name: &str, num_fixed_params: u32) -> u32 {
        let name = self.env.intern(name);
        self.env.program.add_function(Function {
            name,
            kind: FunctionKind::Regular,
            is_static: false,
            num_fixed_params,
            num_opt_positional_params: 0,
            num_opt_named_params: 0,
            num_type_params: 0,
            bytecode: None,
            code: None,
            parent: None,
            data: FunctionData::None,
        })
    }

    /// Attach assembled bytecode to a declared function.
    pub fn attach(&mut self, function: u32, writer: BytecodeWriter, pool: Vec<Value>) {
        self.attach_with_handlers(function, writer, pool, Vec::new());
    }

    pub fn attach_with_handlers(
        &mut self,
        function: u32,
        writer: BytecodeWriter,
        pool: Vec<Value>,
        handlers: Vec<ExceptionHandler>,
    ) {
        let bid = self.env.program.add_bytecode(writer.into_bytes(), pool, handlers);
        self.env.program.function_mut(function).bytecode = Some(bid);
    }

    /// Declare-and-attach in one step.
    pub fn function(
        &mut self,
        name: &str,
        num_fixed_params: u32,
        writer: BytecodeWriter,
        pool: Vec<Value>,
    ) -> u32 {
        let f = self.declare(name, num_fixed_params);
        self.attach(f, writer, pool);
        f
    }

    /// Canonical descriptor for `n` plain positional arguments.
    pub fn argdesc(&mut self, n: i64) -> Value {
        self.env.args_descriptor(0, n, &[])
    }

    /// Invoke with plain positional arguments.
    pub fn call(&mut self, function: u32, args: &[Value]) -> Value {
        let argdesc = self.argdesc(args.len() as i64);
        self.interp
            .call(&mut self.env, function, argdesc, args.len() as i64, args)
            .expect("interpreter fault")
    }

    /// Invoke with an explicit descriptor.
    pub fn call_with_descriptor(&mut self, function: u32, argdesc: Value, args: &[Value]) -> Value {
        self.interp
            .call(&mut self.env, function, argdesc, args.len() as i64, args)
            .expect("interpreter fault")
    }
}

/// Class id of a result value.
pub fn result_cid(v: Value) -> u32 {
    kona_core::object::class_id(v)
}

/// Unwrap an UnhandledException result into the wrapped exception.
pub fn unwrap_unhandled(v: Value) -> Value {
    assert_eq!(
        result_cid(v),
        kona_core::object::CID_UNHANDLED_EXCEPTION,
        "expected an unhandled exception, got {v:?}"
    );
    kona_core::object::UnhandledException(kona_core::gc::ObjRef::from_value(v)).exception()
}

/// Stack offset of argument `i` of a function taking `argc` arguments.
pub fn arg_offset(argc: i64, i: i64) -> i32 {
    (-(4 + argc) + i) as i32
}
