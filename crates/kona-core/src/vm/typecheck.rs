//! Type assertions
//!
//! `AssertAssignable` settles on three levels: the dispatch loop's fast path
//! (Smi/null shortcuts), the six-key subtype-test cache scanned here, and the
//! `type_check` runtime helper, which either installs a new cache entry or
//! throws.

use crate::gc::ObjRef;
use crate::object::{
    class_id, instantiation, stc, Array, Closure, SubtypeTestCache, Type, TypeArguments,
    CID_CLOSURE, CID_TYPE, CID_TYPE_ARGUMENTS,
};
use crate::program::{FieldId, Program};
use crate::runtime::{RuntimeEntry, RuntimeEnv, Unwind};
use crate::value::Value;
use crate::vm::Interpreter;

/// Type-check caller tag passed to the `type_check` helper.
pub(crate) const TYPE_CHECK_FROM_INLINE: i64 = 0;

/// The six shape keys of a subtype-test cache entry for `instance`.
///
/// For closures the first key is the closure's function handle and the three
/// closure-side vectors fill the instance/parent/delayed key slots; for other
/// instances the first key is the class id and the instance vector is read
/// from the class-declared type-arguments slot.
pub(crate) fn stc_shape_keys(
    program: &Program,
    null_value: Value,
    instance: Value,
    instantiator_type_args: Value,
    function_type_args: Value,
) -> [Value; 6] {
    let cid = class_id(instance);
    if cid == CID_CLOSURE {
        let closure = Closure(ObjRef::from_value(instance));
        [
            closure.function(),
            closure.instantiator_type_args(),
            instantiator_type_args,
            function_type_args,
            closure.function_type_args(),
            closure.delayed_type_args(),
        ]
    } else {
        let class = program.class(cid);
        let instance_type_args = if class.num_type_arguments > 0
            && class.type_args_field_offset_words >= 0
        {
            ObjRef::from_value(instance).slot(class.type_args_field_offset_words as usize)
        } else {
            null_value
        };
        [
            Value::smi(cid as i64),
            instance_type_args,
            instantiator_type_args,
            function_type_args,
            null_value,
            null_value,
        ]
    }
}

/// Linear scan of a type-argument vector's instantiations cache.
///
/// Triples are terminated by the no-instantiator sentinel (or by the null
/// fill of a freshly grown cache).
pub(crate) fn lookup_instantiation(
    type_args: Value,
    instantiator_type_args: Value,
    function_type_args: Value,
    null_value: Value,
) -> Option<Value> {
    if !type_args.is_heap_object() || class_id(type_args) != CID_TYPE_ARGUMENTS {
        return None;
    }
    let cache = TypeArguments(ObjRef::from_value(type_args)).instantiations();
    if cache.identical(null_value) || !cache.is_heap_object() {
        return None;
    }
    let array = Array(ObjRef::from_value(cache));
    let sentinel = Value::smi(instantiation::NO_INSTANTIATOR);
    let mut i = 0;
    while i + instantiation::SIZE <= array.len() {
        let key = array.at(i + instantiation::INSTANTIATOR);
        if key.identical(sentinel) || key.identical(null_value) {
            return None;
        }
        if key.identical(instantiator_type_args)
            && array.at(i + instantiation::FUNCTION).identical(function_type_args)
        {
            return Some(array.at(i + instantiation::INSTANTIATED));
        }
        i += instantiation::SIZE;
    }
    None
}

impl Interpreter {
    /// Settle an assignability assertion for the argument block
    /// `[instance, type, instantiator type args, function type args, name]`
    /// at `args_base`, consulting `cache` before the runtime.
    pub(crate) fn assert_assignable(
        &mut self,
        env: &mut RuntimeEnv,
        fp: usize,
        pc: usize,
        args_base: usize,
        cache: Value,
    ) -> Result<(), Unwind> {
        let null_value = env.null_value();
        if !cache.identical(null_value) {
            let keys = stc_shape_keys(
                &env.program,
                null_value,
                self.stack.at(args_base),
                self.stack.at(args_base + 2),
                self.stack.at(args_base + 3),
            );
            let entries = SubtypeTestCache(ObjRef::from_value(cache)).entries();
            let entries = Array(ObjRef::from_value(entries));
            let mut at = 0;
            while at + stc::ENTRY_LENGTH <= entries.len()
                && !entries.at(at + stc::INSTANCE_CID_OR_SIGNATURE).identical(null_value)
            {
                let hit = keys
                    .iter()
                    .enumerate()
                    .all(|(i, key)| entries.at(at + i).identical(*key));
                if hit {
                    if entries.at(at + stc::RESULT).identical(env.true_value()) {
                        return Ok(());
                    }
                    break;
                }
                at += stc::ENTRY_LENGTH;
            }
        }

        // Cache miss: ask the runtime, which installs or throws.
        self.stack.put(args_base + 5, cache);
        self.stack
            .put(args_base + 6, Value::smi(TYPE_CHECK_FROM_INLINE));
        self.invoke_runtime(env, RuntimeEntry::TypeCheck, fp, pc, args_base, 7)
    }

    /// Assignability of a field load/store against the field's declared type,
    /// through the field's own subtype-test cache (allocated on first use).
    pub(crate) fn assert_assignable_field(
        &mut self,
        env: &mut RuntimeEnv,
        fp: usize,
        pc: usize,
        sp: usize,
        instance: Value,
        field_id: FieldId,
        value: Value,
        is_getter: bool,
    ) -> Result<(), Unwind> {
        let null_value = env.null_value();
        let field = env.program.field(field_id);
        let field_type = field.field_type;
        if field_type.identical(null_value) {
            return Ok(());
        }
        if class_id(field_type) == CID_TYPE && Type(ObjRef::from_value(field_type)).is_top() {
            return Ok(());
        }
        if value.identical(null_value) {
            return Ok(());
        }

        let mut cache = field.type_test_cache;
        let mut instance = instance;
        let mut value = value;
        if cache.identical(null_value) {
            // Preserve across the allocating call.
            self.stack.put(sp + 1, instance);
            self.stack.put(sp + 2, Value::smi(field_id as i64));
            self.stack.put(sp + 3, value);
            self.invoke_runtime(
                env,
                RuntimeEntry::AllocateSubtypeTestCache,
                fp,
                pc,
                sp + 4,
                0,
            )?;
            instance = self.stack.at(sp + 1);
            value = self.stack.at(sp + 3);
            cache = self.stack.at(sp + 4);
            env.program.field_mut(field_id).type_test_cache = cache;
        }

        let field = env.program.field(field_id);
        let field_type = field.field_type;
        let name = if is_getter {
            env.intern("function result")
        } else {
            env.program.field(field_id).name
        };
        let instance_type_args = if instance.identical(null_value) || instance.is_smi() {
            null_value
        } else {
            let class = env.program.class(class_id(instance));
            if class.type_args_field_offset_words >= 0 {
                ObjRef::from_value(instance).slot(class.type_args_field_offset_words as usize)
            } else {
                null_value
            }
        };

        self.stack.put(sp + 1, value);
        self.stack.put(sp + 2, field_type);
        self.stack.put(sp + 3, instance_type_args);
        self.stack.put(sp + 4, null_value);
        self.stack.put(sp + 5, name);
        self.assert_assignable(env, fp, pc, sp + 1, cache)
    }
}
