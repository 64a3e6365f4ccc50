//! The dispatch loop
//!
//! One handler per opcode in a dense match; operand decoding is shared per
//! format by the `kona-bytecode` decoder, so the narrow and wide prologues
//! cannot diverge between handlers. Helper call sites follow the suspension
//! discipline: live values are written to stack slots before the call and
//! re-read afterwards, and the `fp_`/`pc_` mirrors are synced by
//! `invoke_runtime`/`exit`.

use kona_bytecode::{Instr, Opcode};

use crate::gc::ObjRef;
use crate::object::{
    class_id, ArgsDescriptor, Array, Closure, Context, Float, Mint, CID_FLOAT, CID_MINT,
};
use crate::runtime::{RuntimeEntry, RuntimeEnv};
use crate::stack::{ValueStack, ENTRY_MARKER_PC};
use crate::value::Value;
use crate::vm::typecheck::lookup_instantiation;
use crate::vm::{Interpreter, Regs, UnwindTarget};
use crate::{VmError, VmResult};

impl Interpreter {
    /// Run the dispatch loop starting at the frame installed by `call`.
    pub(crate) fn dispatch(
        &mut self,
        env: &mut RuntimeEnv,
        entry_fp: usize,
        entry_bid: u32,
    ) -> VmResult<Value> {
        let bytecode = env.program.bytecode(entry_bid);
        let mut regs = Regs {
            fp: entry_fp,
            sp: entry_fp - 1,
            pc: 0,
            bid: entry_bid,
            code: bytecode.instructions.clone(),
            pool: bytecode.pool.clone(),
        };

        let null_v = env.null_value();
        let true_v = env.true_value();
        let false_v = env.false_value();
        let sentinel_v = env.sentinel_value();

        'dispatch: loop {
            // Exception sink: restore at a covering handler or return the
            // error object through the entry frame.
            macro_rules! handle_exception {
                () => {{
                    match self.unwind(env)? {
                        UnwindTarget::Entry(result) => return Ok(result),
                        UnwindTarget::Handler { fp, sp, pc, bid } => {
                            regs.fp = fp;
                            regs.sp = sp;
                            regs.pc = pc;
                            regs.load_bytecode(env, bid);
                            continue 'dispatch;
                        }
                    }
                }};
            }
            // Helper call: `Result<(), Unwind>`.
            macro_rules! try_helper {
                ($e:expr) => {
                    if ($e).is_err() {
                        handle_exception!();
                    }
                };
            }
            // Sub-operation: `DispatchResult` (fatal errors propagate).
            macro_rules! try_call {
                ($e:expr) => {
                    if ($e)?.is_err() {
                        handle_exception!();
                    }
                };
            }

            let instr_start = regs.pc;
            let instr = Instr::decode(&regs.code, regs.pc)?;
            regs.pc = instr.next;

            macro_rules! jump {
                () => {{
                    regs.pc = (instr_start as i64 + instr.t() as i64) as usize;
                }};
            }
            // Unbox a 64-bit integer operand; null raises NullError with the
            // operator selector, anything else non-integer an ArgumentError.
            macro_rules! unbox_int64 {
                ($v:expr, $selector:expr) => {{
                    let v: Value = $v;
                    if v.is_smi() {
                        v.as_smi()
                    } else if class_id(v) == CID_MINT {
                        Mint(ObjRef::from_value(v)).value()
                    } else if v.identical(null_v) {
                        let selector = env.intern($selector);
                        try_helper!(self.throw_null_error(
                            env,
                            regs.fp,
                            instr_start,
                            regs.sp,
                            selector
                        ));
                        return Err(VmError::Fatal("null error helper returned".into()));
                    } else {
                        self.stack.put(regs.sp + 1, v);
                        try_helper!(self.invoke_runtime(
                            env,
                            RuntimeEntry::ArgumentError,
                            regs.fp,
                            instr_start,
                            regs.sp + 1,
                            1
                        ));
                        return Err(VmError::Fatal("argument error helper returned".into()));
                    }
                }};
            }
            // Unbox a double operand; null raises NullError.
            macro_rules! unbox_double {
                ($v:expr, $selector:expr) => {{
                    let v: Value = $v;
                    if v.is_heap_object() && class_id(v) == CID_FLOAT {
                        Float(ObjRef::from_value(v)).value()
                    } else if v.identical(null_v) {
                        let selector = env.intern($selector);
                        try_helper!(self.throw_null_error(
                            env,
                            regs.fp,
                            instr_start,
                            regs.sp,
                            selector
                        ));
                        return Err(VmError::Fatal("null error helper returned".into()));
                    } else {
                        self.stack.put(regs.sp + 1, v);
                        try_helper!(self.invoke_runtime(
                            env,
                            RuntimeEntry::ArgumentError,
                            regs.fp,
                            instr_start,
                            regs.sp + 1,
                            1
                        ));
                        return Err(VmError::Fatal("argument error helper returned".into()));
                    }
                }};
            }
            macro_rules! box_int64_result {
                ($value:expr) => {{
                    let value: i64 = $value;
                    try_helper!(self.box_int64(env, regs.fp, instr_start, regs.sp, value));
                }};
            }
            macro_rules! box_double_result {
                ($value:expr) => {{
                    let value: f64 = $value;
                    try_helper!(self.box_double_at(env, regs.fp, instr_start, regs.sp, value));
                }};
            }

            match instr.op {
                Opcode::Trap => {
                    return Err(VmError::Fatal(format!(
                        "trap executed at pc {instr_start}"
                    )));
                }

                // ===== Prologue & frame setup =====
                Opcode::Entry => {
                    let num_locals = instr.d() as usize;
                    for i in 0..num_locals {
                        self.stack.put(regs.fp + i, null_v);
                    }
                    regs.sp = regs.fp + num_locals - 1;
                }
                Opcode::EntryFixed => {
                    let num_fixed = instr.a() as i64;
                    let num_locals = instr.e() as usize;
                    let desc = ArgsDescriptor::from_value(self.argdesc_);
                    if desc.count() != num_fixed || desc.positional_count() != num_fixed {
                        let function = self.stack.frame_function(regs.fp);
                        self.stack.put(regs.sp + 1, function);
                        try_call!(self.no_such_method_from_prologue(env, &mut regs, instr_start));
                    } else {
                        for i in 0..num_locals {
                            self.stack.put(regs.fp + i, null_v);
                        }
                        regs.sp = regs.fp + num_locals - 1;
                    }
                }
                Opcode::EntryOptional => {
                    let code = regs.code.clone();
                    let pool = regs.pool.clone();
                    let mut pc2 = regs.pc;
                    let mut sp2 = regs.sp;
                    let bound = self.copy_parameters(
                        &code,
                        &pool,
                        &mut pc2,
                        regs.fp,
                        &mut sp2,
                        instr.a() as usize,
                        instr.b() as usize,
                        instr.c() as usize,
                    )?;
                    if bound {
                        regs.pc = pc2;
                        regs.sp = sp2;
                    } else {
                        let function = self.stack.frame_function(regs.fp);
                        self.stack.put(regs.sp + 1, function);
                        try_call!(self.no_such_method_from_prologue(env, &mut regs, instr_start));
                    }
                }
                Opcode::Frame => {
                    let num_locals = instr.d() as usize;
                    for i in 1..=num_locals {
                        self.stack.put(regs.sp + i, null_v);
                    }
                    regs.sp += num_locals;
                }
                Opcode::SetFrame => {
                    regs.sp = regs.fp + instr.a() as usize - 1;
                }
                Opcode::CheckStack => {
                    let overflowed = regs.sp >= self.stack.overflow_limit();
                    if overflowed || env.thread.has_scheduled_interrupts() {
                        self.stack.put(regs.sp + 1, Value::smi(overflowed as i64));
                        try_helper!(self.invoke_runtime(
                            env,
                            RuntimeEntry::StackOverflow,
                            regs.fp,
                            instr_start,
                            regs.sp + 1,
                            1
                        ));
                    }
                }
                Opcode::CheckFunctionTypeArgs => {
                    let declared = instr.a() as i64;
                    let first_local = instr.e() as usize;
                    let desc = ArgsDescriptor::from_value(self.argdesc_);
                    let passed = desc.type_args_len();
                    if passed != declared && passed != 0 {
                        let function = self.stack.frame_function(regs.fp);
                        self.stack.put(regs.sp + 1, function);
                        try_call!(self.no_such_method_from_prologue(env, &mut regs, instr_start));
                    } else if passed > 0 {
                        let arg_count = desc.count() as usize;
                        let type_args =
                            self.stack.at(ValueStack::args_base(regs.fp, arg_count + 1));
                        self.stack.put(regs.fp + first_local, type_args);
                    } else if declared > 0 {
                        self.stack.put(regs.fp + first_local, null_v);
                    }
                }

                // ===== Constants, stack & locals =====
                Opcode::LoadConstant => {
                    let value = regs.constant(instr.e());
                    self.stack.put(regs.fp + instr.a() as usize, value);
                }
                Opcode::PushConstant => {
                    regs.sp += 1;
                    let value = regs.constant(instr.d());
                    self.stack.put(regs.sp, value);
                }
                Opcode::PushNull => {
                    regs.sp += 1;
                    self.stack.put(regs.sp, null_v);
                }
                Opcode::PushTrue => {
                    regs.sp += 1;
                    self.stack.put(regs.sp, true_v);
                }
                Opcode::PushFalse => {
                    regs.sp += 1;
                    self.stack.put(regs.sp, false_v);
                }
                Opcode::PushInt => {
                    regs.sp += 1;
                    self.stack.put(regs.sp, Value::smi(instr.x() as i64));
                }
                Opcode::Push => {
                    let value = self.stack.at_offset(regs.fp, instr.x() as i64);
                    regs.sp += 1;
                    self.stack.put(regs.sp, value);
                }
                Opcode::StoreLocal => {
                    let value = self.stack.at(regs.sp);
                    self.stack.put_offset(regs.fp, instr.x() as i64, value);
                }
                Opcode::PopLocal => {
                    let value = self.stack.at(regs.sp);
                    self.stack.put_offset(regs.fp, instr.x() as i64, value);
                    regs.sp -= 1;
                }
                Opcode::Drop1 => {
                    regs.sp -= 1;
                }
                Opcode::MoveSpecial => {
                    let index = instr.a() as usize;
                    if index >= self.special.len() {
                        return Err(VmError::Fatal(format!("special slot {index} out of range")));
                    }
                    self.stack
                        .put_offset(regs.fp, instr.y() as i64, self.special[index]);
                }
                Opcode::BooleanNegateTOS => {
                    let value = self.stack.at(regs.sp);
                    let negated = if value.identical(true_v) { false_v } else { true_v };
                    self.stack.put(regs.sp, negated);
                }
                Opcode::PushUninitializedSentinel => {
                    regs.sp += 1;
                    self.stack.put(regs.sp, sentinel_v);
                }

                // ===== Calls & return =====
                Opcode::DirectCall | Opcode::UncheckedDirectCall => {
                    let kidx = instr.d();
                    let argc = instr.f() as usize;
                    regs.sp += 1;
                    let call_top = regs.sp;
                    let call_base = call_top - argc;
                    self.stack.put(call_top, regs.constant(kidx));
                    self.argdesc_ = regs.constant(kidx + 1);
                    try_call!(self.invoke(env, &mut regs, call_base, call_top, instr_start));
                }
                Opcode::InterfaceCall
                | Opcode::UncheckedInterfaceCall
                | Opcode::InstantiatedInterfaceCall => {
                    let kidx = instr.d();
                    let argc = instr.f() as usize;
                    let call_base = regs.sp - argc + 1;
                    let call_top = regs.sp + 1;
                    let target = regs.constant(kidx).as_smi() as u32;
                    let name = env.program.function(target).name;
                    self.argdesc_ = regs.constant(kidx + 1);
                    try_call!(self.instance_call(
                        env,
                        &mut regs,
                        name,
                        call_base,
                        call_top,
                        instr_start
                    ));
                }
                Opcode::UncheckedClosureCall => {
                    let kidx = instr.d();
                    let argc = instr.f() as usize;
                    let receiver = self.stack.at(regs.sp);
                    regs.sp -= 1;
                    let call_base = regs.sp - argc + 1;
                    let call_top = regs.sp + 1;
                    if receiver.identical(null_v) {
                        let selector = env.well_known().call_selector;
                        try_helper!(self.throw_null_error(
                            env,
                            regs.fp,
                            instr_start,
                            regs.sp,
                            selector
                        ));
                    }
                    self.argdesc_ = regs.constant(kidx);
                    let closure = Closure(ObjRef::from_value(receiver));
                    self.stack.put(call_top, closure.function());
                    try_call!(self.invoke(env, &mut regs, call_base, call_top, instr_start));
                }
                Opcode::DynamicCall => {
                    let kidx = instr.d();
                    let argc = instr.f() as usize;
                    let call_base = regs.sp - argc + 1;
                    let call_top = regs.sp + 1;
                    let name = regs.constant(kidx);
                    self.argdesc_ = regs.constant(kidx + 1);
                    try_call!(self.instance_call(
                        env,
                        &mut regs,
                        name,
                        call_base,
                        call_top,
                        instr_start
                    ));
                }
                Opcode::NativeCall => {
                    try_call!(self.native_call(env, &mut regs, instr_start, instr.d()));
                }
                Opcode::ReturnTOS => {
                    let result = self.stack.at(regs.sp);
                    let caller_pc = self.stack.saved_caller_pc(regs.fp);
                    if caller_pc == ENTRY_MARKER_PC {
                        self.teardown_entry_frame(env, regs.fp);
                        self.pc_ = caller_pc;
                        return Ok(result);
                    }
                    // Recover the popped argument count from the caller's
                    // call instruction.
                    let caller_fp = self.stack.saved_caller_fp(regs.fp);
                    let caller_bid = self.stack.frame_bytecode(caller_fp);
                    let caller_code = env.program.bytecode(caller_bid).instructions.clone();
                    let call_instr = Instr::decode(&caller_code, caller_pc as usize)?;
                    if !call_instr.op.is_call() {
                        return Err(VmError::Fatal(format!(
                            "return address {caller_pc} does not name a call"
                        )));
                    }
                    let argc = call_instr.f() as usize;
                    regs.sp = ValueStack::args_base(regs.fp, argc);
                    regs.fp = caller_fp;
                    regs.load_bytecode(env, caller_bid);
                    regs.pc = call_instr.next;
                    self.stack.put(regs.sp, result);
                    self.fp_ = regs.fp;
                    self.pc_ = regs.pc as u32;
                    self.pp_bid_ = caller_bid;
                }

                // ===== Jumps =====
                Opcode::Jump => jump!(),
                Opcode::JumpIfNoAsserts => {
                    if !self.options.asserts_enabled {
                        jump!();
                    }
                }
                Opcode::JumpIfNotZeroTypeArgs => {
                    if ArgsDescriptor::from_value(self.argdesc_).type_args_len() != 0 {
                        jump!();
                    }
                }
                Opcode::JumpIfEqStrict => {
                    let b = self.stack.at(regs.sp);
                    let a = self.stack.at(regs.sp - 1);
                    regs.sp -= 2;
                    if a.identical(b) {
                        jump!();
                    }
                }
                Opcode::JumpIfNeStrict => {
                    let b = self.stack.at(regs.sp);
                    let a = self.stack.at(regs.sp - 1);
                    regs.sp -= 2;
                    if !a.identical(b) {
                        jump!();
                    }
                }
                Opcode::JumpIfTrue => {
                    let v = self.stack.at(regs.sp);
                    regs.sp -= 1;
                    if v.identical(true_v) {
                        jump!();
                    }
                }
                Opcode::JumpIfFalse => {
                    let v = self.stack.at(regs.sp);
                    regs.sp -= 1;
                    if v.identical(false_v) {
                        jump!();
                    }
                }
                Opcode::JumpIfNull => {
                    let v = self.stack.at(regs.sp);
                    regs.sp -= 1;
                    if v.identical(null_v) {
                        jump!();
                    }
                }
                Opcode::JumpIfNotNull => {
                    let v = self.stack.at(regs.sp);
                    regs.sp -= 1;
                    if !v.identical(null_v) {
                        jump!();
                    }
                }
                Opcode::JumpIfUnchecked => {
                    // The interpreter never proves arguments checked.
                }
                Opcode::JumpIfInitialized => {
                    let v = self.stack.at(regs.sp);
                    regs.sp -= 1;
                    if !v.identical(sentinel_v) {
                        jump!();
                    }
                }

                // ===== Field, context & indexed access =====
                Opcode::LoadFieldTOS | Opcode::LoadTypeArgumentsField => {
                    let offset = regs.constant(instr.d()).as_smi() as usize;
                    let instance = ObjRef::from_value(self.stack.at(regs.sp));
                    self.stack.put(regs.sp, instance.slot(offset));
                }
                Opcode::StoreFieldTOS => {
                    try_call!(self.store_field_tos(env, &mut regs, instr_start, instr.d()));
                }
                Opcode::InitLateField => {
                    let field_id = regs.constant(instr.d() + 1).as_smi() as u32;
                    let offset = env.program.field(field_id).host_offset_or_field_id as usize;
                    let instance = ObjRef::from_value(self.stack.at(regs.sp));
                    env.heap.store(instance, offset, sentinel_v);
                    regs.sp -= 1;
                }
                Opcode::LoadContextParent => {
                    let context = Context(ObjRef::from_value(self.stack.at(regs.sp)));
                    self.stack.put(regs.sp, context.parent());
                }
                Opcode::StoreContextParent => {
                    let context = ObjRef::from_value(self.stack.at(regs.sp - 1));
                    let value = self.stack.at(regs.sp);
                    regs.sp -= 2;
                    env.heap.store(context, Context::PARENT_SLOT, value);
                }
                Opcode::LoadContextVar => {
                    let index = instr.e() as usize;
                    let context = Context(ObjRef::from_value(self.stack.at(regs.sp)));
                    debug_assert!(index < context.len());
                    self.stack.put(regs.sp, context.var(index));
                }
                Opcode::StoreContextVar => {
                    let index = instr.e() as usize;
                    let context = ObjRef::from_value(self.stack.at(regs.sp - 1));
                    let value = self.stack.at(regs.sp);
                    regs.sp -= 2;
                    debug_assert!(index < Context(context).len());
                    env.heap.store(context, Context::VARS_SLOT + index, value);
                }
                Opcode::StoreIndexedTOS => {
                    let array_v = self.stack.at(regs.sp - 2);
                    let index_v = self.stack.at(regs.sp - 1);
                    let value = self.stack.at(regs.sp);
                    let array = Array(ObjRef::from_value(array_v));
                    if !index_v.is_smi()
                        || index_v.as_smi() < 0
                        || index_v.as_smi() >= array.len() as i64
                    {
                        self.stack.put(regs.sp + 1, index_v);
                        try_helper!(self.invoke_runtime(
                            env,
                            RuntimeEntry::ArgumentError,
                            regs.fp,
                            instr_start,
                            regs.sp + 1,
                            1
                        ));
                    }
                    let index = index_v.as_smi() as usize;
                    regs.sp -= 3;
                    env.heap.store(array.0, Array::DATA_SLOT + index, value);
                }

                // ===== Allocation =====
                Opcode::AllocateContext => {
                    let num_vars = instr.e() as usize;
                    regs.sp += 1;
                    try_helper!(self.allocate_context_at(
                        env,
                        regs.fp,
                        instr_start,
                        regs.sp,
                        num_vars
                    ));
                }
                Opcode::CloneContext => {
                    let context = self.stack.at(regs.sp);
                    self.stack.put(regs.sp + 1, context);
                    try_helper!(self.invoke_runtime(
                        env,
                        RuntimeEntry::CloneContext,
                        regs.fp,
                        instr_start,
                        regs.sp + 1,
                        1
                    ));
                    let cloned = self.stack.at(regs.sp + 2);
                    self.stack.put(regs.sp, cloned);
                }
                Opcode::Allocate => {
                    let cid = regs.constant(instr.d()).as_smi() as u32;
                    let class = env.program.class(cid);
                    let size = class.instance_size_words as usize;
                    let mut done = false;
                    if class.allocate_finalized {
                        if let Some(obj) = env.heap.try_allocate(cid, size) {
                            for slot in 0..size - 1 {
                                obj.set_slot(slot, null_v);
                            }
                            regs.sp += 1;
                            self.stack.put(regs.sp, obj.value());
                            done = true;
                        }
                    }
                    if !done {
                        self.stack.put(regs.sp + 1, Value::smi(cid as i64));
                        self.stack.put(regs.sp + 2, null_v);
                        try_helper!(self.invoke_runtime(
                            env,
                            RuntimeEntry::AllocateObject,
                            regs.fp,
                            instr_start,
                            regs.sp + 1,
                            2
                        ));
                        let result = self.stack.at(regs.sp + 3);
                        regs.sp += 1;
                        self.stack.put(regs.sp, result);
                    }
                }
                Opcode::AllocateT => {
                    let cid = self.stack.at(regs.sp).as_smi() as u32;
                    let type_args = self.stack.at(regs.sp - 1);
                    let class = env.program.class(cid);
                    let size = class.instance_size_words as usize;
                    let ta_offset = class.type_args_field_offset_words;
                    let mut done = false;
                    if class.allocate_finalized {
                        if let Some(obj) = env.heap.try_allocate(cid, size) {
                            for slot in 0..size - 1 {
                                obj.set_slot(slot, null_v);
                            }
                            if ta_offset >= 0 {
                                obj.set_slot(ta_offset as usize, type_args);
                            }
                            regs.sp -= 1;
                            self.stack.put(regs.sp, obj.value());
                            done = true;
                        }
                    }
                    if !done {
                        self.stack.put(regs.sp + 1, Value::smi(cid as i64));
                        self.stack.put(regs.sp + 2, type_args);
                        try_helper!(self.invoke_runtime(
                            env,
                            RuntimeEntry::AllocateObject,
                            regs.fp,
                            instr_start,
                            regs.sp + 1,
                            2
                        ));
                        let result = self.stack.at(regs.sp + 3);
                        regs.sp -= 1;
                        self.stack.put(regs.sp, result);
                    }
                }
                Opcode::CreateArrayTOS => {
                    let length = self.stack.at(regs.sp);
                    let type_args = self.stack.at(regs.sp - 1);
                    regs.sp -= 1;
                    try_helper!(self.allocate_array_at(
                        env,
                        regs.fp,
                        instr_start,
                        regs.sp,
                        type_args,
                        length
                    ));
                }
                Opcode::AllocateClosure => {
                    regs.sp += 1;
                    try_helper!(self.allocate_closure_at(env, regs.fp, instr_start, regs.sp));
                }

                // ===== Type checks & throw =====
                Opcode::InstantiateType => {
                    let type_value = regs.constant(instr.d());
                    self.stack.put(regs.sp + 1, type_value);
                    self.stack.put(regs.sp + 2, self.stack.at(regs.sp - 1));
                    self.stack.put(regs.sp + 3, self.stack.at(regs.sp));
                    try_helper!(self.invoke_runtime(
                        env,
                        RuntimeEntry::InstantiateType,
                        regs.fp,
                        instr_start,
                        regs.sp + 1,
                        3
                    ));
                    let result = self.stack.at(regs.sp + 4);
                    regs.sp -= 1;
                    self.stack.put(regs.sp, result);
                }
                Opcode::InstantiateTypeArgumentsTOS => {
                    let type_args = regs.constant(instr.e());
                    let instantiator = self.stack.at(regs.sp - 1);
                    let function = self.stack.at(regs.sp);
                    // With a non-nullable vector (A=0) or any non-null
                    // instantiator, settle via cache or runtime; otherwise
                    // null instantiates to null.
                    if instr.a() == 0
                        || !instantiator.identical(null_v)
                        || !function.identical(null_v)
                    {
                        match lookup_instantiation(type_args, instantiator, function, null_v) {
                            Some(cached) => {
                                self.stack.put(regs.sp - 1, cached);
                            }
                            None => {
                                self.stack.put(regs.sp + 1, type_args);
                                self.stack.put(regs.sp + 2, instantiator);
                                self.stack.put(regs.sp + 3, function);
                                try_helper!(self.invoke_runtime(
                                    env,
                                    RuntimeEntry::InstantiateTypeArguments,
                                    regs.fp,
                                    instr_start,
                                    regs.sp + 1,
                                    3
                                ));
                                let result = self.stack.at(regs.sp + 4);
                                self.stack.put(regs.sp - 1, result);
                            }
                        }
                    }
                    regs.sp -= 1;
                }
                Opcode::AssertAssignable => {
                    let args_base = regs.sp - 4;
                    let instance = self.stack.at(args_base);
                    let may_be_smi = instr.a() == 1;
                    let smi_ok = instance.is_smi() && may_be_smi;
                    if !smi_ok && !instance.identical(null_v) {
                        let cache = regs.constant(instr.e());
                        try_helper!(self.assert_assignable(
                            env,
                            regs.fp,
                            instr_start,
                            args_base,
                            cache
                        ));
                    }
                    // The instance stays on the stack.
                    regs.sp -= 4;
                }
                Opcode::AssertSubtype => {
                    let args_base = regs.sp - 4;
                    try_helper!(self.invoke_runtime(
                        env,
                        RuntimeEntry::SubtypeCheck,
                        regs.fp,
                        instr_start,
                        args_base,
                        5
                    ));
                    regs.sp -= 5;
                }
                Opcode::AssertBoolean => {
                    let value = self.stack.at(regs.sp);
                    let ok = if instr.a() != 0 {
                        value.identical(true_v) || value.identical(false_v)
                    } else {
                        !value.identical(null_v)
                    };
                    if !ok {
                        self.stack.put(regs.sp + 1, value);
                        try_helper!(self.invoke_runtime(
                            env,
                            RuntimeEntry::NonBoolTypeError,
                            regs.fp,
                            instr_start,
                            regs.sp + 1,
                            1
                        ));
                    }
                }
                Opcode::NullCheck => {
                    let value = self.stack.at(regs.sp);
                    if value.identical(null_v) {
                        let selector = regs.constant(instr.d());
                        try_helper!(self.throw_null_error(
                            env,
                            regs.fp,
                            instr_start,
                            regs.sp,
                            selector
                        ));
                    }
                    regs.sp -= 1;
                }
                Opcode::Throw => {
                    if instr.a() == 0 {
                        try_helper!(self.invoke_runtime(
                            env,
                            RuntimeEntry::Throw,
                            regs.fp,
                            instr_start,
                            regs.sp,
                            1
                        ));
                    } else {
                        try_helper!(self.invoke_runtime(
                            env,
                            RuntimeEntry::ReThrow,
                            regs.fp,
                            instr_start,
                            regs.sp - 1,
                            2
                        ));
                    }
                }

                // ===== Integer arithmetic & comparison =====
                Opcode::AddInt => {
                    regs.sp -= 1;
                    let a = unbox_int64!(self.stack.at(regs.sp), "+");
                    let b = unbox_int64!(self.stack.at(regs.sp + 1), "+");
                    box_int64_result!(a.wrapping_add(b));
                }
                Opcode::SubInt => {
                    regs.sp -= 1;
                    let a = unbox_int64!(self.stack.at(regs.sp), "-");
                    let b = unbox_int64!(self.stack.at(regs.sp + 1), "-");
                    box_int64_result!(a.wrapping_sub(b));
                }
                Opcode::MulInt => {
                    regs.sp -= 1;
                    let a = unbox_int64!(self.stack.at(regs.sp), "*");
                    let b = unbox_int64!(self.stack.at(regs.sp + 1), "*");
                    box_int64_result!(a.wrapping_mul(b));
                }
                Opcode::TruncDivInt => {
                    regs.sp -= 1;
                    let a = unbox_int64!(self.stack.at(regs.sp), "~/");
                    let b = unbox_int64!(self.stack.at(regs.sp + 1), "~/");
                    if b == 0 {
                        try_helper!(self.invoke_runtime(
                            env,
                            RuntimeEntry::IntegerDivisionByZero,
                            regs.fp,
                            instr_start,
                            regs.sp + 1,
                            0
                        ));
                    }
                    let result = if a == i64::MIN && b == -1 {
                        i64::MIN
                    } else {
                        a / b
                    };
                    box_int64_result!(result);
                }
                Opcode::ModInt => {
                    regs.sp -= 1;
                    let a = unbox_int64!(self.stack.at(regs.sp), "%");
                    let b = unbox_int64!(self.stack.at(regs.sp + 1), "%");
                    if b == 0 {
                        try_helper!(self.invoke_runtime(
                            env,
                            RuntimeEntry::IntegerDivisionByZero,
                            regs.fp,
                            instr_start,
                            regs.sp + 1,
                            0
                        ));
                    }
                    // Euclidean remainder: never negative.
                    let result = if a == i64::MIN && b == -1 {
                        0
                    } else {
                        let mut r = a % b;
                        if r < 0 {
                            if b < 0 {
                                r -= b;
                            } else {
                                r += b;
                            }
                        }
                        r
                    };
                    box_int64_result!(result);
                }
                Opcode::BitAndInt => {
                    regs.sp -= 1;
                    let a = unbox_int64!(self.stack.at(regs.sp), "&");
                    let b = unbox_int64!(self.stack.at(regs.sp + 1), "&");
                    box_int64_result!(a & b);
                }
                Opcode::BitOrInt => {
                    regs.sp -= 1;
                    let a = unbox_int64!(self.stack.at(regs.sp), "|");
                    let b = unbox_int64!(self.stack.at(regs.sp + 1), "|");
                    box_int64_result!(a | b);
                }
                Opcode::BitXorInt => {
                    regs.sp -= 1;
                    let a = unbox_int64!(self.stack.at(regs.sp), "^");
                    let b = unbox_int64!(self.stack.at(regs.sp + 1), "^");
                    box_int64_result!(a ^ b);
                }
                Opcode::ShlInt => {
                    regs.sp -= 1;
                    let b_value = self.stack.at(regs.sp + 1);
                    let a = unbox_int64!(self.stack.at(regs.sp), "<<");
                    let b = unbox_int64!(b_value, "<<");
                    if b < 0 {
                        self.stack.put(regs.sp + 1, b_value);
                        try_helper!(self.invoke_runtime(
                            env,
                            RuntimeEntry::ArgumentError,
                            regs.fp,
                            instr_start,
                            regs.sp + 1,
                            1
                        ));
                    }
                    let result = if b >= 64 { 0 } else { a.wrapping_shl(b as u32) };
                    box_int64_result!(result);
                }
                Opcode::ShrInt => {
                    regs.sp -= 1;
                    let b_value = self.stack.at(regs.sp + 1);
                    let a = unbox_int64!(self.stack.at(regs.sp), ">>");
                    let b = unbox_int64!(b_value, ">>");
                    if b < 0 {
                        self.stack.put(regs.sp + 1, b_value);
                        try_helper!(self.invoke_runtime(
                            env,
                            RuntimeEntry::ArgumentError,
                            regs.fp,
                            instr_start,
                            regs.sp + 1,
                            1
                        ));
                    }
                    let result = a >> b.min(63);
                    box_int64_result!(result);
                }
                Opcode::CompareIntEq => {
                    regs.sp -= 1;
                    let a = unbox_int64!(self.stack.at(regs.sp), "==");
                    let b = unbox_int64!(self.stack.at(regs.sp + 1), "==");
                    self.stack.put(regs.sp, env.bool_value(a == b));
                }
                Opcode::CompareIntGt => {
                    regs.sp -= 1;
                    let a = unbox_int64!(self.stack.at(regs.sp), ">");
                    let b = unbox_int64!(self.stack.at(regs.sp + 1), ">");
                    self.stack.put(regs.sp, env.bool_value(a > b));
                }
                Opcode::CompareIntLt => {
                    regs.sp -= 1;
                    let a = unbox_int64!(self.stack.at(regs.sp), "<");
                    let b = unbox_int64!(self.stack.at(regs.sp + 1), "<");
                    self.stack.put(regs.sp, env.bool_value(a < b));
                }
                Opcode::CompareIntGe => {
                    regs.sp -= 1;
                    let a = unbox_int64!(self.stack.at(regs.sp), ">=");
                    let b = unbox_int64!(self.stack.at(regs.sp + 1), ">=");
                    self.stack.put(regs.sp, env.bool_value(a >= b));
                }
                Opcode::CompareIntLe => {
                    regs.sp -= 1;
                    let a = unbox_int64!(self.stack.at(regs.sp), "<=");
                    let b = unbox_int64!(self.stack.at(regs.sp + 1), "<=");
                    self.stack.put(regs.sp, env.bool_value(a <= b));
                }

                // ===== Double arithmetic & comparison =====
                Opcode::NegateDouble => {
                    let v = unbox_double!(self.stack.at(regs.sp), "unary-");
                    box_double_result!(-v);
                }
                Opcode::AddDouble => {
                    regs.sp -= 1;
                    let a = unbox_double!(self.stack.at(regs.sp), "+");
                    let b = unbox_double!(self.stack.at(regs.sp + 1), "+");
                    box_double_result!(a + b);
                }
                Opcode::SubDouble => {
                    regs.sp -= 1;
                    let a = unbox_double!(self.stack.at(regs.sp), "-");
                    let b = unbox_double!(self.stack.at(regs.sp + 1), "-");
                    box_double_result!(a - b);
                }
                Opcode::MulDouble => {
                    regs.sp -= 1;
                    let a = unbox_double!(self.stack.at(regs.sp), "*");
                    let b = unbox_double!(self.stack.at(regs.sp + 1), "*");
                    box_double_result!(a * b);
                }
                Opcode::DivDouble => {
                    regs.sp -= 1;
                    let a = unbox_double!(self.stack.at(regs.sp), "/");
                    let b = unbox_double!(self.stack.at(regs.sp + 1), "/");
                    box_double_result!(a / b);
                }
                Opcode::CompareDoubleEq => {
                    regs.sp -= 1;
                    let a = unbox_double!(self.stack.at(regs.sp), "==");
                    let b = unbox_double!(self.stack.at(regs.sp + 1), "==");
                    self.stack.put(regs.sp, env.bool_value(a == b));
                }
                Opcode::CompareDoubleGt => {
                    regs.sp -= 1;
                    let a = unbox_double!(self.stack.at(regs.sp), ">");
                    let b = unbox_double!(self.stack.at(regs.sp + 1), ">");
                    self.stack.put(regs.sp, env.bool_value(a > b));
                }
                Opcode::CompareDoubleLt => {
                    regs.sp -= 1;
                    let a = unbox_double!(self.stack.at(regs.sp), "<");
                    let b = unbox_double!(self.stack.at(regs.sp + 1), "<");
                    self.stack.put(regs.sp, env.bool_value(a < b));
                }
                Opcode::CompareDoubleGe => {
                    regs.sp -= 1;
                    let a = unbox_double!(self.stack.at(regs.sp), ">=");
                    let b = unbox_double!(self.stack.at(regs.sp + 1), ">=");
                    self.stack.put(regs.sp, env.bool_value(a >= b));
                }
                Opcode::CompareDoubleLe => {
                    regs.sp -= 1;
                    let a = unbox_double!(self.stack.at(regs.sp), "<=");
                    let b = unbox_double!(self.stack.at(regs.sp + 1), "<=");
                    self.stack.put(regs.sp, env.bool_value(a <= b));
                }

                // ===== Interpreter-internal synthetic bodies =====
                Opcode::IntrinsicImplicitGetter => {
                    try_call!(self.implicit_getter(env, &mut regs, instr_start));
                }
                Opcode::IntrinsicImplicitSetter => {
                    try_call!(self.implicit_setter(env, &mut regs, instr_start));
                }
                Opcode::IntrinsicImplicitStaticGetter => {
                    try_call!(self.implicit_static_getter(env, &mut regs, instr_start));
                }
                Opcode::IntrinsicMethodExtractor => {
                    try_call!(self.method_extractor(env, &mut regs, instr_start));
                }
                Opcode::IntrinsicInvokeClosure => {
                    try_call!(self.invoke_closure_dispatcher(env, &mut regs, instr_start));
                }
                Opcode::IntrinsicInvokeField => {
                    try_call!(self.invoke_field_dispatcher(env, &mut regs, instr_start));
                }
                Opcode::IntrinsicForwardDynamicInvocation => {
                    try_call!(self.forward_dynamic_invocation(env, &mut regs, instr_start));
                }
                Opcode::IntrinsicNoSuchMethodDispatcher => {
                    try_call!(self.no_such_method_dispatcher(env, &mut regs, instr_start));
                }
            }
        }
    }
}
