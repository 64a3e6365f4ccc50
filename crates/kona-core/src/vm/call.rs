//! Call protocol
//!
//! The generic invoke picks between compiled code, bytecode and the
//! `compile_function` helper; instance calls resolve through the lookup
//! cache with a runtime miss handler and a noSuchMethod fallback. Synthetic
//! function bodies (method extractor, dispatchers, forwarders) are expressed
//! as tail calls that install a new callee in the current frame.

use kona_bytecode::{Instr, Opcode};

use crate::gc::ObjRef;
use crate::object::{
    class_id, ArgsDescriptor, Array, Closure, Context, Float, Mint, CID_CLOSURE, CID_CONTEXT,
    CID_FLOAT, CID_MINT, CID_UNHANDLED_EXCEPTION,
};
use crate::object::{is_error_cid, UnhandledException};
use crate::program::{BytecodeId, FunctionData, FunctionId, FunctionKind};
use crate::runtime::{RuntimeEntry, RuntimeEnv, Unwind};
use crate::stack::{ValueStack, FRAME_FIXED_SIZE};
use crate::value::Value;
use crate::vm::{DispatchResult, Interpreter, Regs};
use crate::{VmError, VmResult};

/// Convert a helper unwind into the dispatch-loop signal.
macro_rules! propagate {
    ($e:expr) => {
        if let Err(u) = $e {
            return Ok(Err(u));
        }
    };
}

impl Interpreter {
    // ===== Allocation fast paths =====

    /// Box `value` into `stack[at]`; immediates stay immediate.
    pub(crate) fn box_int64(
        &mut self,
        env: &mut RuntimeEnv,
        fp: usize,
        pc: usize,
        at: usize,
        value: i64,
    ) -> Result<(), Unwind> {
        if Value::fits_smi(value) {
            self.stack.put(at, Value::smi(value));
            return Ok(());
        }
        if let Some(obj) = env.heap.try_allocate(CID_MINT, Mint::SIZE_WORDS) {
            Mint(obj).set_value(value);
            self.stack.put(at, obj.value());
            return Ok(());
        }
        self.stack.put(at + 1, Value::smi(CID_MINT as i64));
        self.stack.put(at + 2, env.null_value());
        self.invoke_runtime(env, RuntimeEntry::AllocateObject, fp, pc, at + 1, 2)?;
        let obj = self.stack.at(at + 3);
        Mint(ObjRef::from_value(obj)).set_value(value);
        self.stack.put(at, obj);
        Ok(())
    }

    /// Box `value` into `stack[at]`.
    pub(crate) fn box_double_at(
        &mut self,
        env: &mut RuntimeEnv,
        fp: usize,
        pc: usize,
        at: usize,
        value: f64,
    ) -> Result<(), Unwind> {
        if let Some(obj) = env.heap.try_allocate(CID_FLOAT, Float::SIZE_WORDS) {
            Float(obj).set_value(value);
            self.stack.put(at, obj.value());
            return Ok(());
        }
        self.stack.put(at + 1, Value::smi(CID_FLOAT as i64));
        self.stack.put(at + 2, env.null_value());
        self.invoke_runtime(env, RuntimeEntry::AllocateObject, fp, pc, at + 1, 2)?;
        let obj = self.stack.at(at + 3);
        Float(ObjRef::from_value(obj)).set_value(value);
        self.stack.put(at, obj);
        Ok(())
    }

    /// Allocate an array of `length` into `stack[at]`.
    pub(crate) fn allocate_array_at(
        &mut self,
        env: &mut RuntimeEnv,
        fp: usize,
        pc: usize,
        at: usize,
        type_args: Value,
        length: Value,
    ) -> Result<(), Unwind> {
        if length.is_smi() {
            let len = length.as_smi();
            if (0..=Array::MAX_LENGTH).contains(&len) {
                if let Some(obj) = env
                    .heap
                    .try_allocate(crate::object::CID_ARRAY, Array::size_words(len as usize))
                {
                    Array::init(obj, type_args, len as usize, env.null_value());
                    self.stack.put(at, obj.value());
                    return Ok(());
                }
            }
        }
        self.stack.put(at + 1, length);
        self.stack.put(at + 2, type_args);
        self.invoke_runtime(env, RuntimeEntry::AllocateArray, fp, pc, at + 1, 2)?;
        let result = self.stack.at(at + 3);
        self.stack.put(at, result);
        Ok(())
    }

    /// Allocate a context with `num_vars` variables into `stack[at]`.
    pub(crate) fn allocate_context_at(
        &mut self,
        env: &mut RuntimeEnv,
        fp: usize,
        pc: usize,
        at: usize,
        num_vars: usize,
    ) -> Result<(), Unwind> {
        if let Some(obj) = env
            .heap
            .try_allocate(CID_CONTEXT, Context::size_words(num_vars))
        {
            Context::init(obj, num_vars, env.null_value());
            self.stack.put(at, obj.value());
            return Ok(());
        }
        self.stack.put(at + 1, Value::smi(num_vars as i64));
        self.invoke_runtime(env, RuntimeEntry::AllocateContext, fp, pc, at + 1, 1)?;
        let result = self.stack.at(at + 2);
        self.stack.put(at, result);
        Ok(())
    }

    /// Allocate a closure with null fields into `stack[at]`.
    pub(crate) fn allocate_closure_at(
        &mut self,
        env: &mut RuntimeEnv,
        fp: usize,
        pc: usize,
        at: usize,
    ) -> Result<(), Unwind> {
        if let Some(obj) = env.heap.try_allocate(CID_CLOSURE, Closure::SIZE_WORDS) {
            for slot in 0..Closure::SIZE_WORDS - 1 {
                obj.set_slot(slot, env.null_value());
            }
            self.stack.put(at, obj.value());
            return Ok(());
        }
        self.stack.put(at + 1, Value::smi(CID_CLOSURE as i64));
        self.stack.put(at + 2, env.null_value());
        self.invoke_runtime(env, RuntimeEntry::AllocateObject, fp, pc, at + 1, 2)?;
        let result = self.stack.at(at + 3);
        self.stack.put(at, result);
        Ok(())
    }

    /// Throw NullError with `selector`; never returns normally.
    pub(crate) fn throw_null_error(
        &mut self,
        env: &mut RuntimeEnv,
        fp: usize,
        pc: usize,
        sp: usize,
        selector: Value,
    ) -> Result<(), Unwind> {
        self.stack.put(sp + 1, selector);
        self.invoke_runtime(env, RuntimeEntry::NullErrorWithSelector, fp, pc, sp + 1, 1)
    }

    // ===== Generic invoke =====

    /// Invoke the function in the reserved slot `stack[call_top]` with
    /// arguments at `call_base..call_top`.
    pub(crate) fn invoke(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        call_base: usize,
        call_top: usize,
        call_pc: usize,
    ) -> DispatchResult {
        loop {
            let function = self.stack.at(call_top).as_smi() as FunctionId;
            let func = env.program.function(function);
            if func.has_code() {
                return self.invoke_compiled(env, regs, function, call_base, call_top, call_pc);
            }
            if let Some(bid) = func.bytecode {
                self.invoke_bytecode(env, regs, bid, call_top, call_pc);
                return Ok(Ok(()));
            }

            // Ask the runtime to compile, then re-read the possibly relocated
            // function handle and retry.
            self.stack.put(call_top + 1, self.stack.at(call_top));
            propagate!(self.invoke_runtime(
                env,
                RuntimeEntry::CompileFunction,
                regs.fp,
                call_pc,
                call_top + 1,
                1
            ));
            let function = self.stack.at(call_top + 1);
            self.stack.put(call_top, function);
        }
    }

    /// Install a callee frame over the reserved slot and enter its bytecode.
    fn invoke_bytecode(
        &mut self,
        env: &RuntimeEnv,
        regs: &mut Regs,
        bid: BytecodeId,
        call_top: usize,
        call_pc: usize,
    ) {
        let callee_fp = call_top + FRAME_FIXED_SIZE;
        let function = self.stack.at(call_top);
        self.stack.set_frame(
            callee_fp,
            function,
            Value::smi(bid as i64),
            call_pc as u32,
            regs.fp,
        );
        regs.load_bytecode(env, bid);
        regs.fp = callee_fp;
        regs.sp = callee_fp - 1;
        regs.pc = 0;
        self.fp_ = callee_fp;
        self.pc_ = 0;
        self.pp_bid_ = bid;
    }

    /// Call externally compiled code through the invocation stub.
    ///
    /// The arguments are collected into a heap array before the transition.
    /// An UnhandledException result is rethrown; any other error-class result
    /// unwinds to the entry frame and becomes the `call` result.
    pub(crate) fn invoke_compiled(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        function: FunctionId,
        call_base: usize,
        call_top: usize,
        call_pc: usize,
    ) -> DispatchResult {
        let Some(entry) = env.program.function(function).code else {
            return Err(VmError::Fatal(format!("function {function} has no code")));
        };
        let argc = call_top - call_base;

        self.exit(env, regs.fp, call_top + 1, call_pc);
        self.unwind_depth += 1;
        // Allocate first (may move objects), then copy the arguments from
        // their stack slots, which the collector keeps current.
        let null = env.null_value();
        let args_array = match env.new_array(argc, null) {
            Ok(v) => v,
            Err(u) => return Ok(Err(u)),
        };
        let array = Array(ObjRef::from_value(args_array));
        for i in 0..argc {
            array.set_at(i, self.stack.at(call_base + i));
        }
        let result = entry(env, self.argdesc_, args_array);

        // Pop the arguments and push the result.
        regs.sp = call_base;
        self.stack.put(call_base, result);

        if result.is_heap_object() {
            let cid = class_id(result);
            if cid == CID_UNHANDLED_EXCEPTION {
                let wrapper = UnhandledException(ObjRef::from_value(result));
                let unwind = env.rethrow(wrapper.exception(), wrapper.stacktrace());
                return Ok(Err(unwind));
            }
            if is_error_cid(cid) {
                return Ok(Err(env.set_pending_error(result)));
            }
        }
        self.unwind_depth -= 1;
        self.unexit(env);
        Ok(Ok(()))
    }

    // ===== Instance call =====

    /// Instance call: consult the lookup cache, fall back to the runtime miss
    /// handler, and route to noSuchMethod when resolution yields nothing.
    pub(crate) fn instance_call(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        name: Value,
        call_base: usize,
        call_top: usize,
        call_pc: usize,
    ) -> DispatchResult {
        let null = env.null_value();
        let desc = ArgsDescriptor::from_value(self.argdesc_);
        let receiver_idx = desc.receiver_index();
        let receiver = self.stack.at(call_base + receiver_idx);
        let receiver_cid = self.receiver_cid(receiver);

        let mut name = name;
        let mut target = self.lookup_cache.lookup(receiver_cid, name, self.argdesc_);
        if target.is_none() {
            // Table lookup miss. Clean the reserved slot, it stays visible to
            // the collector.
            self.stack.put(call_top, null);
            self.stack.put(call_top + 1, receiver);
            self.stack.put(call_top + 2, name);
            self.stack.put(call_top + 3, self.argdesc_);
            propagate!(self.invoke_runtime(
                env,
                RuntimeEntry::InstanceCallMissHandler,
                regs.fp,
                call_pc,
                call_top + 1,
                3
            ));
            name = self.stack.at(call_top + 2);
            self.argdesc_ = self.stack.at(call_top + 3);
            let resolved = self.stack.at(call_top + 4);
            if !resolved.identical(null) {
                target = Some(resolved.as_smi() as FunctionId);
            }
        }

        if let Some(target) = target {
            debug_assert!(
                env.heap.is_old(name) && env.heap.is_old(self.argdesc_),
                "lookup cache keys must be old-generation objects"
            );
            self.lookup_cache
                .insert(receiver_cid, name, self.argdesc_, target);
            self.stack.put(call_top, Value::smi(target as i64));
            return self.invoke(env, regs, call_base, call_top, call_pc);
        }

        // The miss handler only returns nothing when lazy dispatchers are
        // disabled; route through noSuchMethod with an argument array.
        let desc = ArgsDescriptor::from_value(self.argdesc_);
        let argc = desc.count_with_type_args() as usize;
        debug_assert_eq!(call_top - call_base, argc);

        self.stack.put(call_top + 5, Value::smi(argc as i64));
        self.stack.put(call_top + 6, null);
        propagate!(self.invoke_runtime(
            env,
            RuntimeEntry::AllocateArray,
            regs.fp,
            call_pc,
            call_top + 5,
            2
        ));
        let array = Array(ObjRef::from_value(self.stack.at(call_top + 7)));
        for i in 0..argc {
            array.set_at(i, self.stack.at(call_base + i));
        }
        self.stack.put(call_top + 4, array.0.value());

        propagate!(self.invoke_runtime(
            env,
            RuntimeEntry::InvokeNoSuchMethod,
            regs.fp,
            call_pc,
            call_top + 1,
            4
        ));
        let result = self.stack.at(call_top + 5);
        regs.sp = call_base;
        self.stack.put(call_base, result);
        Ok(Ok(()))
    }

    // ===== Parameter binding =====

    /// Bind fixed/optional/named parameters into locals, consuming the
    /// default-value `LoadConstant` instructions at `*pc`.
    ///
    /// Returns `Ok(false)` when the arguments do not match the signature (the
    /// caller routes to noSuchMethod).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn copy_parameters(
        &mut self,
        code: &[u8],
        pool: &[Value],
        pc: &mut usize,
        fp: usize,
        sp: &mut usize,
        num_fixed: usize,
        num_opt_positional: usize,
        num_opt_named: usize,
    ) -> VmResult<bool> {
        let desc = ArgsDescriptor::from_value(self.argdesc_);
        let arg_count = desc.count() as usize;
        let pos_count = desc.positional_count() as usize;
        let named_count = arg_count - pos_count;

        let min_pos = num_fixed;
        let max_pos = num_fixed + num_opt_positional;
        if pos_count < min_pos || pos_count > max_pos {
            return Ok(false);
        }

        // Copy all passed positional arguments into the locals.
        let first_arg = ValueStack::args_base(fp, arg_count);
        self.stack.copy_slots(first_arg, fp, pos_count);

        if num_opt_named != 0 {
            // Walk the declared named parameters (name/default LoadConstant
            // pairs) in order, matching the descriptor's name list.
            let mut i = 0; // passed named argument
            let mut j = 0; // declared named parameter
            while j < num_opt_named && i < named_count {
                let load_name = Instr::decode(code, *pc)?;
                let load_value = Instr::decode(code, load_name.next)?;
                *pc = load_value.next;
                debug_assert_eq!(load_name.op, Opcode::LoadConstant);
                debug_assert_eq!(load_value.op, Opcode::LoadConstant);
                let reg = load_name.a() as usize;
                debug_assert_eq!(reg, load_value.a() as usize);

                let declared_name = pool[load_name.e() as usize];
                if declared_name.identical(desc.name_at(i)) {
                    // Parameter was passed; fetch the actual argument.
                    let arg_index = desc.position_at(i) as usize;
                    let v = self.stack.at(first_arg + arg_index);
                    self.stack.put(fp + reg, v);
                    i += 1;
                } else {
                    // Not passed; bind the declared default.
                    self.stack.put(fp + reg, pool[load_value.e() as usize]);
                }
                j += 1;
            }

            // Remaining declared parameters all take their defaults.
            while j < num_opt_named {
                let load_name = Instr::decode(code, *pc)?;
                let load_value = Instr::decode(code, load_name.next)?;
                *pc = load_value.next;
                debug_assert_eq!(load_value.op, Opcode::LoadConstant);
                let reg = load_name.a() as usize;
                self.stack.put(fp + reg, pool[load_value.e() as usize]);
                j += 1;
            }

            // Unconsumed named arguments mean a signature mismatch.
            if i < named_count {
                return Ok(false);
            }
            *sp = fp + num_fixed + num_opt_named - 1;
        } else {
            debug_assert_ne!(num_opt_positional, 0);
            if named_count != 0 {
                return Ok(false);
            }

            // Skip the defaults of parameters that were passed, then load the
            // defaults of the rest.
            for _ in num_fixed..pos_count {
                let skip = Instr::decode(code, *pc)?;
                debug_assert_eq!(skip.op, Opcode::LoadConstant);
                *pc = skip.next;
            }
            for i in pos_count..max_pos {
                let load_value = Instr::decode(code, *pc)?;
                *pc = load_value.next;
                debug_assert_eq!(load_value.op, Opcode::LoadConstant);
                debug_assert_eq!(load_value.a() as usize, i);
                self.stack.put(fp + i, pool[load_value.e() as usize]);
            }
            *sp = fp + max_pos - 1;
        }

        Ok(true)
    }

    // ===== noSuchMethod from a failed prologue =====

    /// Route a prologue failure to noSuchMethod. The failing function must be
    /// in `stack[sp + 1]`.
    pub(crate) fn no_such_method_from_prologue(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        call_pc: usize,
    ) -> DispatchResult {
        let sp = regs.sp;
        let null = env.null_value();
        let desc = ArgsDescriptor::from_value(self.argdesc_);
        let argc = desc.count_with_type_args() as usize;
        let receiver_idx = desc.receiver_index();
        let args_base = ValueStack::args_base(regs.fp, argc);

        // Spill everything the noSuchMethod call needs below the allocation
        // scratch, so the collector keeps it current across the helper.
        self.stack.put(sp + 2, self.stack.at(args_base + receiver_idx));
        self.stack.put(sp + 3, self.stack.at(sp + 1));
        self.stack.put(sp + 4, self.argdesc_);
        self.stack.put(sp + 5, null);

        self.stack.put(sp + 7, Value::smi(argc as i64));
        self.stack.put(sp + 8, null);
        propagate!(self.invoke_runtime(
            env,
            RuntimeEntry::AllocateArray,
            regs.fp,
            call_pc,
            sp + 7,
            2
        ));
        let array = Array(ObjRef::from_value(self.stack.at(sp + 9)));
        for i in 0..argc {
            array.set_at(i, self.stack.at(args_base + i));
        }
        self.stack.put(sp + 5, array.0.value());

        propagate!(self.invoke_runtime(
            env,
            RuntimeEntry::NoSuchMethodFromPrologue,
            regs.fp,
            call_pc,
            sp + 2,
            4
        ));
        let result = self.stack.at(sp + 6);
        regs.sp = sp + 1;
        self.stack.put(regs.sp, result);
        Ok(Ok(()))
    }

    // ===== Tail calls =====

    /// Prefer the captured receiver over the closure itself for non-static
    /// implicit closures whose target went through the compiled-parent path.
    fn implicit_closure_fixup(
        &mut self,
        env: &RuntimeEnv,
        function: FunctionId,
        args_base: usize,
        receiver_idx: usize,
    ) -> FunctionId {
        let func = env.program.function(function);
        if func.kind != FunctionKind::ImplicitClosure || func.has_code() {
            return function;
        }
        if !func.is_static && self.options.implicit_closure_compat {
            let receiver = self.stack.at(args_base + receiver_idx);
            if class_id(receiver) == CID_CLOSURE {
                let closure = Closure(ObjRef::from_value(receiver));
                let context = closure.context();
                if closure.function().as_smi() as FunctionId == function
                    && class_id(context) == CID_CONTEXT
                {
                    let context = Context(ObjRef::from_value(context));
                    if context.len() > 0 {
                        let captured = context.var(0);
                        if !captured.identical(receiver) {
                            self.stack.put(args_base + receiver_idx, captured);
                        }
                    }
                }
            }
        }
        match func.parent {
            Some(parent) if env.program.function(parent).has_code() => parent,
            _ => function,
        }
    }

    /// Tail-call the function in `stack[sp + 1]`, reusing the current frame
    /// for bytecode targets.
    pub(crate) fn tail_call(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        call_pc: usize,
    ) -> DispatchResult {
        loop {
            let mut function = self.stack.at(regs.sp + 1).as_smi() as FunctionId;
            let desc = ArgsDescriptor::from_value(self.argdesc_);
            let receiver_idx = desc.receiver_index();
            let argc = desc.count_with_type_args() as usize;
            let args_base = ValueStack::args_base(regs.fp, argc);

            function = self.implicit_closure_fixup(env, function, args_base, receiver_idx);
            self.stack.put(regs.sp + 1, Value::smi(function as i64));

            let func = env.program.function(function);
            if func.has_code() {
                // Push copies of the frame arguments and transfer to the
                // compiled entry.
                let call_base = regs.sp + 1;
                for i in 0..argc {
                    self.stack.put(call_base + i, self.stack.at(args_base + i));
                }
                let call_top = call_base + argc;
                self.stack.put(call_top, Value::smi(function as i64));
                regs.sp = call_top - 1;
                return self.invoke_compiled(env, regs, function, call_base, call_top, call_pc);
            }
            if let Some(bid) = func.bytecode {
                // Replace the current frame's function and body in place; the
                // saved caller slots keep pointing at the original caller.
                self.stack.put(regs.fp - 4, Value::smi(function as i64));
                self.stack.put(regs.fp - 3, Value::smi(bid as i64));
                regs.load_bytecode(env, bid);
                regs.pc = 0;
                regs.sp = regs.fp - 1;
                self.pp_bid_ = bid;
                self.pc_ = 0;
                self.fp_ = regs.fp;
                return Ok(Ok(()));
            }

            self.stack.put(regs.sp + 2, Value::smi(function as i64));
            propagate!(self.invoke_runtime(
                env,
                RuntimeEntry::CompileFunction,
                regs.fp,
                call_pc,
                regs.sp + 2,
                1
            ));
            let recompiled = self.stack.at(regs.sp + 2);
            self.stack.put(regs.sp + 1, recompiled);
        }
    }

    // ===== Synthetic bodies =====

    fn frame_function_id(&self, fp: usize) -> FunctionId {
        self.stack.frame_function(fp).as_smi() as FunctionId
    }

    /// Synthetic body of a method extractor: allocate a closure binding the
    /// receiver in a one-slot context.
    pub(crate) fn method_extractor(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        call_pc: usize,
    ) -> DispatchResult {
        let function = self.frame_function_id(regs.fp);
        let FunctionData::Target(target) = env.program.function(function).data else {
            return Err(VmError::Fatal(format!(
                "extractor {function} has no target payload"
            )));
        };
        debug_assert_eq!(
            ArgsDescriptor::from_value(self.argdesc_).type_args_len(),
            0
        );

        regs.sp += 1;
        propagate!(self.allocate_closure_at(env, regs.fp, call_pc, regs.sp));
        regs.sp += 1;
        propagate!(self.allocate_context_at(env, regs.fp, call_pc, regs.sp, 1));

        let context = ObjRef::from_value(self.stack.at(regs.sp));
        regs.sp -= 1;
        let receiver = self.stack.at(ValueStack::args_base(regs.fp, 1));
        env.heap.store(context, Context::VARS_SLOT, receiver);

        let closure = ObjRef::from_value(self.stack.at(regs.sp));
        let instantiator = self.instance_type_arguments(env, receiver);
        env.heap
            .store(closure, Closure::INSTANTIATOR_TA_SLOT, instantiator);
        // function_type_args stays null.
        let empty = env.well_known().empty_type_args;
        env.heap.store(closure, Closure::DELAYED_TA_SLOT, empty);
        env.heap
            .store(closure, Closure::FUNCTION_SLOT, Value::smi(target as i64));
        env.heap
            .store(closure, Closure::CONTEXT_SLOT, context.value());
        Ok(Ok(()))
    }

    /// Synthetic body of an invoke-field dispatcher named `call` applied to a
    /// closure receiver.
    pub(crate) fn invoke_closure_dispatcher(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        call_pc: usize,
    ) -> DispatchResult {
        let function = self.frame_function_id(regs.fp);
        let name = env.program.function(function).name;
        let is_dynamic_call = env.is_dynamic_selector(name);

        let desc = ArgsDescriptor::from_value(self.argdesc_);
        let receiver_idx = desc.receiver_index();
        let argc = desc.count_with_type_args() as usize;
        let receiver = self.stack.at(ValueStack::args_base(regs.fp, argc) + receiver_idx);
        let closure = Closure(ObjRef::from_value(receiver));
        self.stack.put(regs.sp + 1, closure.function());

        if is_dynamic_call {
            let sp = regs.sp;
            self.stack.put(sp + 2, receiver);
            self.stack.put(sp + 3, self.argdesc_);
            propagate!(self.invoke_runtime(
                env,
                RuntimeEntry::ClosureArgumentsValid,
                regs.fp,
                call_pc,
                sp + 2,
                2
            ));
            self.argdesc_ = self.stack.at(sp + 3);
            if !self.stack.at(sp + 4).identical(env.true_value()) {
                return self.no_such_method_from_prologue(env, regs, call_pc);
            }
        }

        self.tail_call(env, regs, call_pc)
    }

    /// Synthetic body of an invoke-field dispatcher: load the field, then
    /// call its value (closure function or resolved `call`), else
    /// noSuchMethod.
    pub(crate) fn invoke_field_dispatcher(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        call_pc: usize,
    ) -> DispatchResult {
        let function = self.frame_function_id(regs.fp);
        let name = env.program.function(function).name;
        let desc = ArgsDescriptor::from_value(self.argdesc_);
        let receiver_idx = desc.receiver_index();
        let argc = desc.count_with_type_args() as usize;
        let args_base = ValueStack::args_base(regs.fp, argc);
        let receiver = self.stack.at(args_base + receiver_idx);
        let sp = regs.sp;
        let null = env.null_value();

        // Possibly demangle the field name and load the field.
        self.stack.put(sp + 1, receiver);
        self.stack.put(sp + 2, name);
        propagate!(self.invoke_runtime(
            env,
            RuntimeEntry::GetFieldForDispatch,
            regs.fp,
            call_pc,
            sp + 1,
            2
        ));
        let name_after = self.stack.at(sp + 2);
        let is_dynamic_call = !name_after.identical(name);
        let value = self.stack.at(sp + 3);

        // Replace the receiver with the field value and keep the rest.
        self.stack.put(args_base + receiver_idx, value);

        if class_id(value) == CID_CLOSURE {
            self.stack
                .put(sp + 1, Closure(ObjRef::from_value(value)).function());
            if is_dynamic_call {
                self.stack.put(sp + 2, value);
                self.stack.put(sp + 3, self.argdesc_);
                propagate!(self.invoke_runtime(
                    env,
                    RuntimeEntry::ClosureArgumentsValid,
                    regs.fp,
                    call_pc,
                    sp + 2,
                    2
                ));
                self.argdesc_ = self.stack.at(sp + 3);
                if !self.stack.at(sp + 4).identical(env.true_value()) {
                    return self.no_such_method_from_prologue(env, regs, call_pc);
                }
            }
            return self.tail_call(env, regs, call_pc);
        }

        // Resolve a `call` method on the field value.
        self.stack.put(sp + 1, value);
        self.stack.put(sp + 2, self.argdesc_);
        propagate!(self.invoke_runtime(
            env,
            RuntimeEntry::ResolveCallFunction,
            regs.fp,
            call_pc,
            sp + 1,
            2
        ));
        self.argdesc_ = self.stack.at(sp + 2);
        let resolved = self.stack.at(sp + 3);
        if !resolved.identical(null) {
            self.stack.put(sp + 1, resolved);
            return self.tail_call(env, regs, call_pc);
        }

        // No `call` function: noSuchMethod(receiver=value, 'call', args).
        // The field value is still spilled at sp+1.
        self.stack.put(sp + 2, env.well_known().call_selector);
        self.stack.put(sp + 3, self.argdesc_);
        self.stack.put(sp + 4, null);
        self.stack.put(sp + 7, Value::smi(argc as i64));
        self.stack.put(sp + 8, null);
        propagate!(self.invoke_runtime(
            env,
            RuntimeEntry::AllocateArray,
            regs.fp,
            call_pc,
            sp + 7,
            2
        ));
        let array = Array(ObjRef::from_value(self.stack.at(sp + 9)));
        for i in 0..argc {
            array.set_at(i, self.stack.at(args_base + i));
        }
        self.stack.put(sp + 4, array.0.value());
        propagate!(self.invoke_runtime(
            env,
            RuntimeEntry::InvokeNoSuchMethod,
            regs.fp,
            call_pc,
            sp + 1,
            4
        ));
        let result = self.stack.at(sp + 5);
        regs.sp = sp + 1;
        self.stack.put(regs.sp, result);
        Ok(Ok(()))
    }

    /// Synthetic body of a dynamic-invocation forwarder: re-run parameter
    /// binding against the target, then tail-call it.
    pub(crate) fn forward_dynamic_invocation(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        call_pc: usize,
    ) -> DispatchResult {
        let function = self.frame_function_id(regs.fp);
        let FunctionData::Target(target) = env.program.function(function).data else {
            return Err(VmError::Fatal(format!(
                "forwarder {function} has no target payload"
            )));
        };
        let Some(target_bid) = env.program.function(target).bytecode else {
            return Err(VmError::Fatal(format!(
                "forwarder target {target} has no bytecode"
            )));
        };

        let bytecode = env.program.bytecode(target_bid);
        let code = bytecode.instructions.clone();
        let pool = bytecode.pool.clone();
        let first = Instr::decode(&code, 0)?;
        if first.op == Opcode::EntryOptional {
            let mut pc2 = first.next;
            let mut sp2 = regs.sp;
            let bound = self.copy_parameters(
                &code,
                &pool,
                &mut pc2,
                regs.fp,
                &mut sp2,
                first.a() as usize,
                first.b() as usize,
                first.c() as usize,
            )?;
            if !bound {
                self.stack
                    .put(regs.sp + 1, Value::smi(function as i64));
                return self.no_such_method_from_prologue(env, regs, call_pc);
            }
        }

        regs.sp = regs.fp - 1;
        self.stack.put(regs.sp + 1, Value::smi(target as i64));
        self.tail_call(env, regs, call_pc)
    }

    /// Synthetic body of a noSuchMethod dispatcher.
    pub(crate) fn no_such_method_dispatcher(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        call_pc: usize,
    ) -> DispatchResult {
        let function = self.stack.frame_function(regs.fp);
        self.stack.put(regs.sp + 1, function);
        self.no_such_method_from_prologue(env, regs, call_pc)
    }
}
