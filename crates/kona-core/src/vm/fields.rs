//! Field access with guards and unboxing
//!
//! Stores consult the field's guard state (observed class, nullability,
//! list length, exactness) and route through `update_field_cid` when a store
//! would change it. Unboxing-candidate double fields hold a private box
//! object: `StoreFieldTOS` installs a fresh box (initializing store), the
//! implicit setter mutates the existing box in place, and loads return a
//! fresh box so the field's box never escapes.

use crate::gc::ObjRef;
use crate::object::{class_id, Closure, Float, CID_CLOSURE, CID_FLOAT, CID_NULL};
use crate::program::{FieldId, FunctionData, FunctionId};
use crate::runtime::{RuntimeEntry, RuntimeEnv};
use crate::stack::ValueStack;
use crate::value::Value;
use crate::vm::{DispatchResult, Interpreter, Regs};
use crate::{VmError, VmResult};

impl Interpreter {
    /// `StoreFieldTOS`: store SP[0] into the field of SP[-1] named by the
    /// constant-pool pair at `d`.
    pub(crate) fn store_field_tos(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        call_pc: usize,
        d: u32,
    ) -> DispatchResult {
        let field_id = regs.constant(d + 1).as_smi() as FieldId;
        let offset = regs.constant(d).as_smi() as usize;
        let sp = regs.sp;

        let field = env.program.field(field_id);
        let value = self.stack.at(sp);
        if env.field_needs_guard_update(field, value) {
            self.stack.put(sp + 1, Value::smi(field_id as i64));
            self.stack.put(sp + 2, value);
            if let Err(u) =
                self.invoke_runtime(env, RuntimeEntry::UpdateFieldCid, regs.fp, call_pc, sp + 1, 2)
            {
                return Ok(Err(u));
            }
        }

        // Reload objects after the call which may have moved them.
        let instance = self.stack.at(sp - 1);
        let value = self.stack.at(sp);
        let field = env.program.field(field_id);
        let unboxing = field.is_unboxing_candidate && field.nullability_cid != CID_NULL;
        let guarded_cid = field.guarded_cid;

        if unboxing && guarded_cid == CID_FLOAT && self.options.supports_unboxed_doubles {
            let raw = Float(ObjRef::from_value(value)).value();
            // Initializing store: the slot must not hold a box yet.
            debug_assert!(ObjRef::from_value(instance)
                .slot(offset)
                .identical(env.null_value()));
            if let Err(u) = self.box_double_at(env, regs.fp, call_pc, sp + 1, raw) {
                return Ok(Err(u));
            }
            let boxed = self.stack.at(sp + 1);
            let instance = self.stack.at(sp - 1);
            env.heap.store(ObjRef::from_value(instance), offset, boxed);
        } else {
            env.heap.store(ObjRef::from_value(instance), offset, value);
        }

        regs.sp = sp - 2;
        Ok(Ok(()))
    }

    fn frame_field(&self, env: &RuntimeEnv, fp: usize) -> VmResult<FieldId> {
        let function = self.stack.frame_function(fp).as_smi() as FunctionId;
        match env.program.function(function).data {
            FunctionData::Field(field) => Ok(field),
            _ => Err(VmError::Fatal(format!(
                "function {function} has no field payload"
            ))),
        }
    }

    /// Synthetic body of an implicit getter.
    pub(crate) fn implicit_getter(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        call_pc: usize,
    ) -> DispatchResult {
        let field_id = self.frame_field(env, regs.fp)?;
        let field = env.program.field(field_id);
        let offset = field.host_offset_or_field_id as usize;
        let needs_load_guard = field.needs_load_guard;
        let unboxing = field.is_unboxing_candidate && field.nullability_cid != CID_NULL;
        let guarded_cid = field.guarded_cid;

        const ARGC: usize = 1;
        let args_base = ValueStack::args_base(regs.fp, ARGC);
        let mut instance = self.stack.at(args_base);
        let mut value = ObjRef::from_value(instance).slot(offset);

        if value.identical(env.sentinel_value()) {
            let sp = regs.sp;
            self.stack.put(sp + 1, instance);
            self.stack.put(sp + 2, Value::smi(field_id as i64));
            if let Err(u) = self.invoke_runtime(
                env,
                RuntimeEntry::InitInstanceField,
                regs.fp,
                call_pc,
                sp + 1,
                2,
            ) {
                return Ok(Err(u));
            }
            instance = self.stack.at(args_base);
            value = ObjRef::from_value(instance).slot(offset);
        }

        regs.sp += 1;
        self.stack.put(regs.sp, value);

        if needs_load_guard {
            if let Err(u) = self.assert_assignable_field(
                env,
                regs.fp,
                call_pc,
                regs.sp,
                instance,
                field_id,
                value,
                true,
            ) {
                return Ok(Err(u));
            }
            let instance = self.stack.at(args_base);
            value = ObjRef::from_value(instance).slot(offset);
            self.stack.put(regs.sp, value);
        }

        if unboxing && guarded_cid == CID_FLOAT && self.options.supports_unboxed_doubles {
            let raw = Float(ObjRef::from_value(value)).value();
            if let Err(u) = self.box_double_at(env, regs.fp, call_pc, regs.sp, raw) {
                return Ok(Err(u));
            }
        }
        Ok(Ok(()))
    }

    /// Synthetic body of an implicit setter.
    pub(crate) fn implicit_setter(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        call_pc: usize,
    ) -> DispatchResult {
        let field_id = self.frame_field(env, regs.fp)?;
        const ARGC: usize = 2;
        let args_base = ValueStack::args_base(regs.fp, ARGC);
        let instance = self.stack.at(args_base);
        let value = self.stack.at(args_base + 1);

        if let Err(u) = self.assert_assignable_field(
            env,
            regs.fp,
            call_pc,
            regs.sp,
            instance,
            field_id,
            value,
            false,
        ) {
            return Ok(Err(u));
        }
        let value = self.stack.at(args_base + 1);

        let field = env.program.field(field_id);
        let offset = field.host_offset_or_field_id as usize;
        if env.field_needs_guard_update(field, value) {
            let sp = regs.sp;
            self.stack.put(sp + 1, Value::smi(field_id as i64));
            self.stack.put(sp + 2, value);
            if let Err(u) = self.invoke_runtime(
                env,
                RuntimeEntry::UpdateFieldCid,
                regs.fp,
                call_pc,
                sp + 1,
                2,
            ) {
                return Ok(Err(u));
            }
        }

        let instance = self.stack.at(args_base);
        let value = self.stack.at(args_base + 1);
        let field = env.program.field(field_id);
        let unboxing = field.is_unboxing_candidate && field.nullability_cid != CID_NULL;
        let guarded_cid = field.guarded_cid;

        if unboxing && guarded_cid == CID_FLOAT && self.options.supports_unboxed_doubles {
            let raw = Float(ObjRef::from_value(value)).value();
            let boxed = ObjRef::from_value(instance).slot(offset);
            // Non-initializing store: the box was installed by StoreFieldTOS.
            debug_assert!(!boxed.identical(env.null_value()));
            Float(ObjRef::from_value(boxed)).set_value(raw);
        } else {
            env.heap.store(ObjRef::from_value(instance), offset, value);
        }

        regs.sp += 1;
        self.stack.put(regs.sp, env.null_value());
        Ok(Ok(()))
    }

    /// Synthetic body of an implicit static getter.
    pub(crate) fn implicit_static_getter(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        call_pc: usize,
    ) -> DispatchResult {
        let field_id = self.frame_field(env, regs.fp)?;
        let field = env.program.field(field_id);
        let static_id = field.host_offset_or_field_id;
        let needs_load_guard = field.needs_load_guard;

        let mut value = env.program.static_value(static_id);
        if value.identical(env.sentinel_value()) {
            let sp = regs.sp;
            self.stack.put(sp + 1, Value::smi(field_id as i64));
            if let Err(u) = self.invoke_runtime(
                env,
                RuntimeEntry::InitStaticField,
                regs.fp,
                call_pc,
                sp + 1,
                1,
            ) {
                return Ok(Err(u));
            }
            value = env.program.static_value(static_id);
        }

        regs.sp += 1;
        self.stack.put(regs.sp, value);

        if needs_load_guard {
            let null = env.null_value();
            if let Err(u) = self.assert_assignable_field(
                env,
                regs.fp,
                call_pc,
                regs.sp,
                null,
                field_id,
                value,
                true,
            ) {
                return Ok(Err(u));
            }
        }
        Ok(Ok(()))
    }

    /// Receiver type-argument vector read from the class-declared offset.
    pub(crate) fn instance_type_arguments(&self, env: &RuntimeEnv, instance: Value) -> Value {
        let null = env.null_value();
        if instance.is_smi() || instance.identical(null) {
            return null;
        }
        let cid = class_id(instance);
        if cid == CID_CLOSURE {
            let closure = Closure(ObjRef::from_value(instance));
            return closure.instantiator_type_args();
        }
        let class = env.program.class(cid);
        if class.type_args_field_offset_words >= 0 {
            ObjRef::from_value(instance).slot(class.type_args_field_offset_words as usize)
        } else {
            null
        }
    }
}
