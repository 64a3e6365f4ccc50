//! NativeCall dispatch
//!
//! A `NativeCall` constant-pool entry is `[recognized_kind, name, argc,
//! link]`. Recognized methods are open-coded below; everything else goes
//! through a lazily linked trampoline into the registered native function.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::gc::ObjRef;
use crate::object::{
    class_id, ArgsDescriptor, Array, GrowableArray, HashBase, Str, TypedData, TypedDataView,
};
use crate::runtime::{RuntimeEntry, RuntimeEnv};
use crate::value::Value;
use crate::vm::{DispatchResult, Interpreter, Regs};
use crate::VmError;

/// Pool-entry slot: recognized-method kind.
pub(crate) const ENTRY_KIND: usize = 0;
/// Pool-entry slot: native name.
pub(crate) const ENTRY_NAME: usize = 1;
/// Pool-entry slot: argument count.
pub(crate) const ENTRY_ARGC: usize = 2;
/// Pool-entry slot: lazily linked registry index.
pub(crate) const ENTRY_LINK: usize = 3;

/// Recognized-method kinds with open-coded fast paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recognized {
    None = 0,
    ObjectEquals,
    StringLength,
    StringIsEmpty,
    ArrayLength,
    GrowableArrayLength,
    GrowableArrayCapacity,
    TypedDataLength,
    TypedDataViewOffsetInBytes,
    TypedDataViewTypedData,
    ClassIdGetId,
    ListFactory,
    ObjectArrayAllocate,
    GrowableArrayAllocate,
    TypedDataFactory,
    FfiAbi,
    HashBaseGetIndex,
    HashBaseSetIndex,
    HashBaseGetData,
    HashBaseSetData,
    HashBaseGetHashMask,
    HashBaseSetHashMask,
    HashBaseGetUsedData,
    HashBaseSetUsedData,
    HashBaseGetDeletedKeys,
    HashBaseSetDeletedKeys,
}

static RECOGNIZED: Lazy<FxHashMap<&'static str, Recognized>> = Lazy::new(|| {
    let mut table = FxHashMap::default();
    table.insert("Object_equals", Recognized::ObjectEquals);
    table.insert("String_getLength", Recognized::StringLength);
    table.insert("String_getIsEmpty", Recognized::StringIsEmpty);
    table.insert("List_getLength", Recognized::ArrayLength);
    table.insert("GrowableList_getLength", Recognized::GrowableArrayLength);
    table.insert("GrowableList_getCapacity", Recognized::GrowableArrayCapacity);
    table.insert("TypedData_getLength", Recognized::TypedDataLength);
    table.insert(
        "TypedDataView_offsetInBytes",
        Recognized::TypedDataViewOffsetInBytes,
    );
    table.insert("TypedDataView_typedData", Recognized::TypedDataViewTypedData);
    table.insert("ClassID_getID", Recognized::ClassIdGetId);
    table.insert("List_factory", Recognized::ListFactory);
    table.insert("ObjectArray_allocate", Recognized::ObjectArrayAllocate);
    table.insert("GrowableList_allocate", Recognized::GrowableArrayAllocate);
    table.insert("TypedData_factory", Recognized::TypedDataFactory);
    table.insert("Ffi_abi", Recognized::FfiAbi);
    table.insert("LinkedHashBase_getIndex", Recognized::HashBaseGetIndex);
    table.insert("LinkedHashBase_setIndex", Recognized::HashBaseSetIndex);
    table.insert("LinkedHashBase_getData", Recognized::HashBaseGetData);
    table.insert("LinkedHashBase_setData", Recognized::HashBaseSetData);
    table.insert("LinkedHashBase_getHashMask", Recognized::HashBaseGetHashMask);
    table.insert("LinkedHashBase_setHashMask", Recognized::HashBaseSetHashMask);
    table.insert("LinkedHashBase_getUsedData", Recognized::HashBaseGetUsedData);
    table.insert("LinkedHashBase_setUsedData", Recognized::HashBaseSetUsedData);
    table.insert(
        "LinkedHashBase_getDeletedKeys",
        Recognized::HashBaseGetDeletedKeys,
    );
    table.insert(
        "LinkedHashBase_setDeletedKeys",
        Recognized::HashBaseSetDeletedKeys,
    );
    table
});

/// Recognized kind for a native name, as stored in pool entries.
pub(crate) fn recognized_kind(name: &str) -> i64 {
    RECOGNIZED.get(name).copied().unwrap_or(Recognized::None) as i64
}

fn recognized_from_i64(kind: i64) -> Recognized {
    const TABLE: [Recognized; 25] = [
        Recognized::None,
        Recognized::ObjectEquals,
        Recognized::StringLength,
        Recognized::StringIsEmpty,
        Recognized::ArrayLength,
        Recognized::GrowableArrayLength,
        Recognized::GrowableArrayCapacity,
        Recognized::TypedDataLength,
        Recognized::TypedDataViewOffsetInBytes,
        Recognized::TypedDataViewTypedData,
        Recognized::ClassIdGetId,
        Recognized::ListFactory,
        Recognized::ObjectArrayAllocate,
        Recognized::GrowableArrayAllocate,
        Recognized::TypedDataFactory,
        Recognized::FfiAbi,
        Recognized::HashBaseGetIndex,
        Recognized::HashBaseSetIndex,
        Recognized::HashBaseGetData,
        Recognized::HashBaseSetData,
        Recognized::HashBaseGetHashMask,
        Recognized::HashBaseSetHashMask,
        Recognized::HashBaseGetUsedData,
        Recognized::HashBaseSetUsedData,
        Recognized::HashBaseGetDeletedKeys,
    ];
    TABLE
        .get(kind as usize)
        .copied()
        .unwrap_or(Recognized::HashBaseSetDeletedKeys)
}

/// Calling-convention identifier returned by the FFI ABI query.
fn host_abi() -> i64 {
    if cfg!(all(target_arch = "x86_64", target_os = "windows")) {
        1
    } else if cfg!(target_arch = "x86_64") {
        0
    } else if cfg!(target_arch = "aarch64") {
        2
    } else {
        3
    }
}

impl Interpreter {
    /// Execute a `NativeCall` against the pool entry at `d`.
    pub(crate) fn native_call(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        call_pc: usize,
        d: u32,
    ) -> DispatchResult {
        let entry = Array(ObjRef::from_value(regs.constant(d)));
        let kind = recognized_from_i64(entry.at(ENTRY_KIND).as_smi());
        let sp = regs.sp;
        let null = env.null_value();

        match kind {
            Recognized::ObjectEquals => {
                let eq = self.stack.at(sp - 1).identical(self.stack.at(sp));
                self.stack.put(sp - 1, env.bool_value(eq));
                regs.sp = sp - 1;
            }
            Recognized::StringLength => {
                let s = Str(ObjRef::from_value(self.stack.at(sp)));
                self.stack.put(sp, Value::smi(s.len() as i64));
            }
            Recognized::StringIsEmpty => {
                let s = Str(ObjRef::from_value(self.stack.at(sp)));
                let empty = env.bool_value(s.is_empty());
                self.stack.put(sp, empty);
            }
            Recognized::ArrayLength => {
                let a = Array(ObjRef::from_value(self.stack.at(sp)));
                self.stack.put(sp, Value::smi(a.len() as i64));
            }
            Recognized::GrowableArrayLength => {
                let g = GrowableArray(ObjRef::from_value(self.stack.at(sp)));
                let len = g.len();
                self.stack.put(sp, len);
            }
            Recognized::GrowableArrayCapacity => {
                let g = GrowableArray(ObjRef::from_value(self.stack.at(sp)));
                let data = Array(ObjRef::from_value(g.data()));
                self.stack.put(sp, Value::smi(data.len() as i64));
            }
            Recognized::TypedDataLength => {
                let t = TypedData(ObjRef::from_value(self.stack.at(sp)));
                let len = t.len();
                self.stack.put(sp, len);
            }
            Recognized::TypedDataViewOffsetInBytes => {
                let v = TypedDataView(ObjRef::from_value(self.stack.at(sp)));
                let offset = v.offset_in_bytes();
                self.stack.put(sp, offset);
            }
            Recognized::TypedDataViewTypedData => {
                let v = TypedDataView(ObjRef::from_value(self.stack.at(sp)));
                let backing = v.backing();
                self.stack.put(sp, backing);
            }
            Recognized::ClassIdGetId => {
                let cid = class_id(self.stack.at(sp));
                self.stack.put(sp, Value::smi(cid as i64));
            }
            Recognized::ListFactory => {
                // With an explicit length this is a fixed-length list; with
                // the length omitted (pushed as null by the wrapper) it is a
                // growable list.
                let desc = ArgsDescriptor::from_value(self.argdesc_);
                if desc.positional_count() == 2 {
                    let type_args = self.stack.at(sp - 1);
                    let length = self.stack.at(sp);
                    regs.sp = sp - 1;
                    if let Err(u) = self.allocate_array_at(
                        env,
                        regs.fp,
                        call_pc,
                        regs.sp,
                        type_args,
                        length,
                    ) {
                        return Ok(Err(u));
                    }
                } else {
                    debug_assert_eq!(desc.positional_count(), 1);
                    debug_assert!(self.stack.at(sp).identical(null));
                    let type_args = self.stack.at(sp - 1);
                    self.stack.put(sp + 1, Value::smi(0));
                    self.stack.put(sp + 2, type_args);
                    if let Err(u) = self.invoke_runtime(
                        env,
                        RuntimeEntry::AllocateGrowableArray,
                        regs.fp,
                        call_pc,
                        sp + 1,
                        2,
                    ) {
                        return Ok(Err(u));
                    }
                    let result = self.stack.at(sp + 3);
                    self.stack.put(sp - 1, result);
                    regs.sp = sp - 1;
                }
            }
            Recognized::ObjectArrayAllocate => {
                let type_args = self.stack.at(sp - 1);
                let length = self.stack.at(sp);
                regs.sp = sp - 1;
                if let Err(u) =
                    self.allocate_array_at(env, regs.fp, call_pc, regs.sp, type_args, length)
                {
                    return Ok(Err(u));
                }
            }
            Recognized::GrowableArrayAllocate => {
                let type_args = self.stack.at(sp - 1);
                let capacity = self.stack.at(sp);
                self.stack.put(sp + 1, capacity);
                self.stack.put(sp + 2, type_args);
                if let Err(u) = self.invoke_runtime(
                    env,
                    RuntimeEntry::AllocateGrowableArray,
                    regs.fp,
                    call_pc,
                    sp + 1,
                    2,
                ) {
                    return Ok(Err(u));
                }
                let growable = self.stack.at(sp + 3);
                // Backing sized to the capacity, no live elements yet.
                ObjRef::from_value(growable).set_slot(1, Value::smi(0));
                self.stack.put(sp - 1, growable);
                regs.sp = sp - 1;
            }
            Recognized::TypedDataFactory => {
                let elem_size = self.stack.at(sp - 1);
                let length = self.stack.at(sp);
                self.stack.put(sp + 1, elem_size);
                self.stack.put(sp + 2, length);
                if let Err(u) = self.invoke_runtime(
                    env,
                    RuntimeEntry::AllocateTypedData,
                    regs.fp,
                    call_pc,
                    sp + 1,
                    2,
                ) {
                    return Ok(Err(u));
                }
                let result = self.stack.at(sp + 3);
                self.stack.put(sp - 1, result);
                regs.sp = sp - 1;
            }
            Recognized::FfiAbi => {
                regs.sp = sp + 1;
                self.stack.put(regs.sp, Value::smi(host_abi()));
            }
            Recognized::HashBaseGetIndex => self.hash_base_get(sp, HashBase::INDEX_SLOT),
            Recognized::HashBaseGetData => self.hash_base_get(sp, HashBase::DATA_SLOT),
            Recognized::HashBaseGetHashMask => {
                self.hash_base_get(sp, HashBase::HASH_MASK_SLOT)
            }
            Recognized::HashBaseGetUsedData => {
                self.hash_base_get(sp, HashBase::USED_DATA_SLOT)
            }
            Recognized::HashBaseGetDeletedKeys => {
                self.hash_base_get(sp, HashBase::DELETED_KEYS_SLOT)
            }
            Recognized::HashBaseSetIndex => {
                self.hash_base_set(env, regs, HashBase::INDEX_SLOT)
            }
            Recognized::HashBaseSetData => self.hash_base_set(env, regs, HashBase::DATA_SLOT),
            Recognized::HashBaseSetHashMask => {
                self.hash_base_set(env, regs, HashBase::HASH_MASK_SLOT)
            }
            Recognized::HashBaseSetUsedData => {
                self.hash_base_set(env, regs, HashBase::USED_DATA_SLOT)
            }
            Recognized::HashBaseSetDeletedKeys => {
                self.hash_base_set(env, regs, HashBase::DELETED_KEYS_SLOT)
            }
            Recognized::None => {
                return self.native_call_trampoline(env, regs, call_pc, entry);
            }
        }
        Ok(Ok(()))
    }

    fn hash_base_get(&mut self, sp: usize, slot: usize) {
        let instance = ObjRef::from_value(self.stack.at(sp));
        self.stack.put(sp, instance.slot(slot));
    }

    fn hash_base_set(&mut self, env: &mut RuntimeEnv, regs: &mut Regs, slot: usize) {
        let sp = regs.sp;
        let instance = ObjRef::from_value(self.stack.at(sp - 1));
        let value = self.stack.at(sp);
        env.heap.store(instance, slot, value);
        regs.sp = sp - 1;
        self.stack.put(regs.sp, env.null_value());
    }

    /// Default branch: lazily link the native entry, then call through it.
    fn native_call_trampoline(
        &mut self,
        env: &mut RuntimeEnv,
        regs: &mut Regs,
        call_pc: usize,
        entry: Array,
    ) -> DispatchResult {
        let link = entry.at(ENTRY_LINK);
        let index = if link.identical(env.null_value()) {
            let name_value = entry.at(ENTRY_NAME);
            let name = Str(ObjRef::from_value(name_value)).as_str();
            let Some(index) = env.lookup_native(name) else {
                let unwind = env.throw_new(
                    env.well_known().unsupported_cid,
                    "no native function registered",
                    name_value,
                );
                return Ok(Err(unwind));
            };
            env.stats.native_links += 1;
            entry.set_at(ENTRY_LINK, Value::smi(index as i64));
            index
        } else {
            link.as_smi() as usize
        };

        let argc = entry.at(ENTRY_ARGC).as_smi() as usize;
        let sp = regs.sp;
        if sp + 1 < argc {
            return Err(VmError::Fatal("native call underflows the stack".into()));
        }
        self.stack.put(sp + 1, env.null_value());
        let arg_base = sp + 1 - argc;
        if let Err(u) = self.invoke_native(env, index, regs.fp, call_pc, arg_base, argc) {
            return Ok(Err(u));
        }
        let result = self.stack.at(sp + 1);
        regs.sp = sp + 1 - argc;
        self.stack.put(regs.sp, result);
        Ok(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recognized_table_round_trip() {
        for (name, kind) in RECOGNIZED.iter() {
            assert_eq!(recognized_from_i64(recognized_kind(name)), *kind);
        }
        assert_eq!(recognized_kind("definitely_not_native"), 0);
    }
}
