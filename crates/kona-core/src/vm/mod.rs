//! The interpreter
//!
//! [`Interpreter`] owns a value stack, the lookup cache and the two special
//! slots. [`Interpreter::call`] installs an entry frame, enters the dispatch
//! loop and returns either the result or an error object (distinguished by
//! class id), per the invocation API.
//!
//! The `fp_`/`pc_` mirrors are written at every suspension point (runtime
//! helper, native call, CheckStack) before control leaves the dispatch loop;
//! the exception sink and any profiler read them, never the loop's locals.

pub(crate) mod call;
pub(crate) mod dispatch;
pub(crate) mod fields;
pub(crate) mod natives;
pub(crate) mod typecheck;

use std::sync::Arc;

use crate::cache::LookupCache;
use crate::gc::ClassId;
use crate::object::{class_id, CID_UNHANDLED_EXCEPTION};
use crate::program::{BytecodeId, FunctionId};
use crate::runtime::{NativeArguments, RuntimeEntry, RuntimeEnv, Unwind};
use crate::stack::{
    ValueStack, DEFAULT_STACK_SLOTS, ENTRY_ARGC_SLOT, ENTRY_ARGDESC_SLOT, ENTRY_EXIT_LINK_SLOT,
    ENTRY_MARKER_PC, ENTRY_PP_SLOT, ENTRY_SAVED_SLOTS, FRAME_FIXED_SIZE,
};
use crate::value::Value;
use crate::{VmError, VmResult};

/// Index of the in-flight exception special slot.
pub const SPECIAL_EXCEPTION_INDEX: usize = 0;
/// Index of the in-flight stack trace special slot.
pub const SPECIAL_STACKTRACE_INDEX: usize = 1;

/// Interpreter configuration.
#[derive(Debug, Clone, Copy)]
pub struct InterpreterOptions {
    /// Value stack capacity in slots.
    pub stack_slots: usize,
    /// Prefer a captured receiver over the closure itself for non-static
    /// implicit closures whose parent is compiled (ABI compatibility).
    pub implicit_closure_compat: bool,
    /// Whether fields may hold unboxed doubles.
    pub supports_unboxed_doubles: bool,
    /// Whether fields may hold unboxed SIMD values.
    pub supports_unboxed_simd: bool,
    /// Whether `JumpIfNoAsserts` falls through.
    pub asserts_enabled: bool,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            stack_slots: DEFAULT_STACK_SLOTS,
            implicit_closure_compat: true,
            supports_unboxed_doubles: true,
            supports_unboxed_simd: false,
            asserts_enabled: true,
        }
    }
}

/// Dispatch-loop registers. Live in the loop, synced to the interpreter's
/// mirrors at suspension points.
pub(crate) struct Regs {
    pub fp: usize,
    pub sp: usize,
    pub pc: usize,
    pub bid: BytecodeId,
    pub code: Arc<[u8]>,
    pub pool: Arc<[Value]>,
}

impl Regs {
    pub(crate) fn load_bytecode(&mut self, env: &RuntimeEnv, bid: BytecodeId) {
        let bytecode = env.program.bytecode(bid);
        self.bid = bid;
        self.code = bytecode.instructions.clone();
        self.pool = bytecode.pool.clone();
    }

    #[inline]
    pub(crate) fn constant(&self, index: u32) -> Value {
        self.pool[index as usize]
    }
}

/// Outcome of a dispatch-loop sub-operation: a fatal interpreter error, a
/// pending unwind for the exception sink, or plain success.
pub(crate) type DispatchResult = VmResult<Result<(), Unwind>>;

/// Where an unwind landed.
pub(crate) enum UnwindTarget {
    /// A covering handler inside the interpreter.
    Handler {
        fp: usize,
        sp: usize,
        pc: usize,
        bid: BytecodeId,
    },
    /// The entry frame; the value is the `call` result (an error object).
    Entry(Value),
}

/// A per-thread bytecode interpreter.
pub struct Interpreter {
    pub(crate) stack: ValueStack,
    pub(crate) lookup_cache: LookupCache,
    pub(crate) special: [Value; 2],
    /// Frame-pointer mirror; between calls, the next entry-frame base.
    pub(crate) fp_: usize,
    /// Program-counter mirror.
    pub(crate) pc_: u32,
    /// Current arguments descriptor.
    pub(crate) argdesc_: Value,
    /// Owner of the current constant pool.
    pub(crate) pp_bid_: BytecodeId,
    pub(crate) options: InterpreterOptions,
    pub(crate) unwind_depth: usize,
}

impl Interpreter {
    /// Create an interpreter with the given options.
    pub fn new(options: InterpreterOptions) -> Interpreter {
        Interpreter {
            stack: ValueStack::new(options.stack_slots),
            lookup_cache: LookupCache::new(),
            special: [Value::smi(0); 2],
            fp_: 0,
            pc_: 0,
            argdesc_: Value::smi(0),
            pp_bid_: 0,
            options,
            unwind_depth: 0,
        }
    }

    /// The active configuration.
    pub fn options(&self) -> &InterpreterOptions {
        &self.options
    }

    /// Special slot contents (exception or stack trace).
    pub fn special_slot(&self, index: usize) -> Value {
        self.special[index]
    }

    /// Active unwind-record count; equals the number of helper invocations in
    /// flight.
    pub fn unwind_chain_depth(&self) -> usize {
        self.unwind_depth
    }

    /// Flush the method-dispatch cache. Must be called by the host whenever
    /// cache keys may have moved or the class hierarchy changed.
    pub fn clear_lookup_cache(&mut self) {
        self.lookup_cache.clear();
    }

    /// Invoke `function` with `argv` described by `argdesc`.
    ///
    /// A negative `argc` indicates `argv` is in reverse order. The result is
    /// either the function's return value or an error object (unhandled
    /// exceptions included), distinguished by class id.
    pub fn call(
        &mut self,
        env: &mut RuntimeEnv,
        function: FunctionId,
        argdesc: Value,
        argc: i64,
        argv: &[Value],
    ) -> VmResult<Value> {
        let count = argc.unsigned_abs() as usize;
        debug_assert_eq!(count, argv.len());
        let func = env.program.function(function);
        let Some(bid) = func.bytecode else {
            return Err(VmError::Uncallable(function));
        };

        // Set up the entry frame:
        //
        //   entry_base+0   saved top-exit-frame link
        //   entry_base+1   saved arguments descriptor
        //   entry_base+2   saved constant-pool owner
        //   entry_base+3   this frame's argc
        //   entry_base+4   arg 0 ... arg argc-1
        //   ...            function, bytecode, ENTRY_MARKER_PC, entry_base
        //   FP ->          callee locals
        let entry_base = if self.fp_ == 0 {
            self.stack.base()
        } else {
            self.fp_
        };
        let fp = entry_base + ENTRY_SAVED_SLOTS + count + FRAME_FIXED_SIZE;
        if fp >= self.stack.overflow_limit() {
            return Err(VmError::StackExhausted);
        }

        self.stack.put(
            entry_base + ENTRY_EXIT_LINK_SLOT,
            Value::smi(env.thread.top_exit_frame_info as i64),
        );
        self.stack.put(entry_base + ENTRY_ARGDESC_SLOT, self.argdesc_);
        self.stack
            .put(entry_base + ENTRY_PP_SLOT, Value::smi(self.pp_bid_ as i64));
        self.stack
            .put(entry_base + ENTRY_ARGC_SLOT, Value::smi(count as i64));
        env.thread.top_exit_frame_info = 0;

        for i in 0..count {
            let v = if argc < 0 { argv[count - 1 - i] } else { argv[i] };
            self.stack.put(entry_base + ENTRY_SAVED_SLOTS + i, v);
        }

        self.stack.set_frame(
            fp,
            Value::smi(function as i64),
            Value::smi(bid as i64),
            ENTRY_MARKER_PC,
            entry_base,
        );

        self.argdesc_ = argdesc;
        self.pp_bid_ = bid;
        self.fp_ = fp;
        self.pc_ = 0;

        self.dispatch(env, fp, bid)
    }

    // ===== Entry/exit bridge =====

    /// Restore the outer state saved by an entry frame. `fp` is the entry
    /// frame's FP.
    pub(crate) fn teardown_entry_frame(&mut self, env: &mut RuntimeEnv, fp: usize) {
        let entry_base = self.stack.saved_caller_fp(fp);
        env.thread.top_exit_frame_info =
            self.stack.at(entry_base + ENTRY_EXIT_LINK_SLOT).as_smi() as usize;
        self.argdesc_ = self.stack.at(entry_base + ENTRY_ARGDESC_SLOT);
        self.pp_bid_ = self.stack.at(entry_base + ENTRY_PP_SLOT).as_smi() as u32;
        self.fp_ = entry_base;
    }

    /// Mark the transition into external code: write a synthetic exit frame
    /// the rest of the runtime can walk, and link it from the thread.
    pub(crate) fn exit(&mut self, env: &mut RuntimeEnv, fp: usize, exit_at: usize, pc: usize) {
        let null = env.null_value();
        let exit_fp = exit_at + FRAME_FIXED_SIZE;
        self.stack.set_frame(exit_fp, null, null, pc as u32, fp);
        env.thread.top_exit_frame_info = exit_fp;
        self.fp_ = exit_fp;
        self.pc_ = pc as u32;
    }

    /// Clear the exit-frame link after a successful external call.
    pub(crate) fn unexit(&self, env: &mut RuntimeEnv) {
        env.thread.top_exit_frame_info = 0;
    }

    /// Call a runtime helper with arguments in stack slots
    /// `arg_base..arg_base+argc` and the return slot just above them.
    ///
    /// The exit frame is written above the return slot, so the argument block
    /// stays visible to the collector for the duration of the call. On the
    /// error path the exit frame is left in place for the exception sink.
    pub(crate) fn invoke_runtime(
        &mut self,
        env: &mut RuntimeEnv,
        entry: RuntimeEntry,
        fp: usize,
        pc: usize,
        arg_base: usize,
        argc: usize,
    ) -> Result<(), Unwind> {
        let exit_at = arg_base + argc + 1;
        self.exit(env, fp, exit_at, pc);
        self.unwind_depth += 1;
        let result = {
            let window = self.stack.window_mut(arg_base, arg_base + argc + 1);
            let mut args = NativeArguments::new(window);
            env.invoke(entry, &mut args)
        };
        match result {
            Ok(()) => {
                self.unwind_depth -= 1;
                self.unexit(env);
                Ok(())
            }
            Err(unwind) => Err(unwind),
        }
    }

    /// Call a registered native with the same discipline as
    /// [`Interpreter::invoke_runtime`].
    pub(crate) fn invoke_native(
        &mut self,
        env: &mut RuntimeEnv,
        native_index: usize,
        fp: usize,
        pc: usize,
        arg_base: usize,
        argc: usize,
    ) -> Result<(), Unwind> {
        let exit_at = arg_base + argc + 1;
        self.exit(env, fp, exit_at, pc);
        self.unwind_depth += 1;
        let f = env.native_by_index(native_index);
        let result = {
            let window = self.stack.window_mut(arg_base, arg_base + argc + 1);
            let mut args = NativeArguments::new(window);
            f(env, &mut args)
        };
        match result {
            Ok(()) => {
                self.unwind_depth -= 1;
                self.unexit(env);
                Ok(())
            }
            Err(unwind) => Err(unwind),
        }
    }

    // ===== Exception sink =====

    /// Walk frames from the synthetic exit frame left by a throwing helper to
    /// the innermost covering handler, or to the entry frame.
    pub(crate) fn unwind(&mut self, env: &mut RuntimeEnv) -> VmResult<UnwindTarget> {
        self.unwind_depth = self.unwind_depth.saturating_sub(1);
        let (exception, mut stacktrace, bypass_handlers) = env.take_pending();

        // The throwing helper ran behind an exit frame whose saved PC/FP name
        // the interpreter frame that was executing.
        let exit_fp = self.fp_;
        let throw_pc = self.stack.saved_caller_pc(exit_fp);
        let throw_fp = self.stack.saved_caller_fp(exit_fp);

        if stacktrace.identical(env.null_value()) {
            let mut frames = Vec::new();
            let mut wfp = throw_fp;
            let mut wpc = throw_pc;
            while wpc != ENTRY_MARKER_PC {
                frames.push(self.stack.frame_function(wfp));
                wpc = self.stack.saved_caller_pc(wfp);
                wfp = self.stack.saved_caller_fp(wfp);
            }
            stacktrace = env.new_stack_trace(&frames);
        }

        self.special[SPECIAL_EXCEPTION_INDEX] = exception;
        self.special[SPECIAL_STACKTRACE_INDEX] = stacktrace;

        if !bypass_handlers {
            let mut hfp = throw_fp;
            let mut hpc = throw_pc;
            while hpc != ENTRY_MARKER_PC {
                let bid = self.stack.frame_bytecode(hfp);
                let handlers = env.program.bytecode(bid).handlers.clone();
                if let Some(handler) = handlers.iter().find(|h| h.covers(hpc)) {
                    env.thread.top_exit_frame_info = 0;
                    self.fp_ = hfp;
                    self.pc_ = handler.handler_pc;
                    self.pp_bid_ = bid;
                    return Ok(UnwindTarget::Handler {
                        fp: hfp,
                        sp: hfp + handler.frame_size as usize - 1,
                        pc: handler.handler_pc as usize,
                        bid,
                    });
                }
                hpc = self.stack.saved_caller_pc(hfp);
                hfp = self.stack.saved_caller_fp(hfp);
            }
        }

        // No covering handler: pop the entry frame and hand the exception to
        // the caller of `call`.
        let mut efp = throw_fp;
        while self.stack.saved_caller_pc(efp) != ENTRY_MARKER_PC {
            efp = self.stack.saved_caller_fp(efp);
        }
        self.teardown_entry_frame(env, efp);
        let result = if bypass_handlers || class_id(exception) == CID_UNHANDLED_EXCEPTION {
            exception
        } else {
            env.new_unhandled_exception(exception, stacktrace)
                .unwrap_or(exception)
        };
        Ok(UnwindTarget::Entry(result))
    }

    /// Receiver class id for instance calls.
    #[inline]
    pub(crate) fn receiver_cid(&self, v: Value) -> ClassId {
        class_id(v)
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(InterpreterOptions::default())
    }
}
