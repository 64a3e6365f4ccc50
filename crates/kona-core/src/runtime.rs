//! Runtime-environment contract
//!
//! The interpreter calls out of the dispatch loop for everything a managed
//! runtime normally owns: slow-path allocation, method resolution, type
//! checks, field guards, exception construction. [`RuntimeEnv`] implements
//! that helper surface with the [`NativeArguments`] shape: argument and
//! return slots alias interpreter stack slots, so values live on the stack
//! across any helper that may allocate, and are re-read afterwards.
//!
//! Helpers that throw record the pending exception here and signal with
//! [`Unwind`]; the interpreter's exception sink picks the pending values up
//! and walks frames to a handler.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::gc::{ClassId, Heap, HeapConfig, ObjRef};
use crate::object::{
    self, class_id, instantiation, nullability, stc, ArgsDescriptor, Array, Closure, Context,
    Float, GrowableArray, Mint, Str, SubtypeTestCache, Type, TypeArguments, TypeParameter,
    TypedData, CID_ARRAY, CID_BOOL, CID_CLOSURE, CID_CONTEXT, CID_FLOAT, CID_GROWABLE_ARRAY,
    CID_ILLEGAL, CID_MINT, CID_NULL, CID_SENTINEL, CID_SMI, CID_STACK_TRACE, CID_STR,
    CID_SUBTYPE_TEST_CACHE, CID_TYPE, CID_TYPED_DATA, CID_TYPE_ARGUMENTS, CID_TYPE_PARAMETER,
    CID_UNHANDLED_EXCEPTION, GUARDED_CID_ANY,
};
use crate::program::{
    Class, Field, FieldId, Function, FunctionData, FunctionId, FunctionKind, Program,
    EXACTNESS_NOT_TRACKING, EXACTNESS_UNINITIALIZED, NO_FIXED_LENGTH, UNKNOWN_FIXED_LENGTH,
};
use crate::value::Value;
use crate::vm::natives;
use crate::vm::typecheck::stc_shape_keys;

/// Non-local-unwind signal raised by throwing helpers.
///
/// The pending exception and stack trace are recorded on the environment
/// before the signal is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unwind;

/// Helper result alias.
pub type HelperResult = Result<(), Unwind>;

/// Argument/return marshalling for runtime helpers.
///
/// Wraps a window of interpreter stack slots laid out as
/// `[arg 0, ..., arg n-1, return]`.
pub struct NativeArguments<'a> {
    argv: &'a mut [Value],
}

impl<'a> NativeArguments<'a> {
    /// Wrap a stack window; the last slot is the return slot.
    pub fn new(argv: &'a mut [Value]) -> NativeArguments<'a> {
        debug_assert!(!argv.is_empty());
        NativeArguments { argv }
    }

    /// Argument count.
    #[inline]
    pub fn argc(&self) -> usize {
        self.argv.len() - 1
    }

    /// Argument `i`.
    #[inline]
    pub fn arg(&self, i: usize) -> Value {
        self.argv[i]
    }

    /// Overwrite argument `i` (helpers may relocate argument objects).
    #[inline]
    pub fn set_arg(&mut self, i: usize, v: Value) {
        self.argv[i] = v;
    }

    /// Write the return slot.
    #[inline]
    pub fn set_return(&mut self, v: Value) {
        let last = self.argv.len() - 1;
        self.argv[last] = v;
    }

    /// Read the return slot.
    #[inline]
    pub fn return_value(&self) -> Value {
        self.argv[self.argv.len() - 1]
    }
}

/// Runtime helper entry points, by the names the interpreter knows them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum RuntimeEntry {
    Throw,
    ReThrow,
    AllocateObject,
    AllocateArray,
    AllocateGrowableArray,
    AllocateContext,
    AllocateTypedData,
    AllocateSubtypeTestCache,
    CloneContext,
    CompileFunction,
    InitInstanceField,
    InitStaticField,
    UpdateFieldCid,
    StackOverflow,
    InstanceCallMissHandler,
    InvokeNoSuchMethod,
    NoSuchMethodFromPrologue,
    TypeCheck,
    SubtypeCheck,
    NonBoolTypeError,
    NullErrorWithSelector,
    IntegerDivisionByZero,
    ArgumentError,
    InstantiateType,
    InstantiateTypeArguments,
    GetFieldForDispatch,
    ResolveCallFunction,
    ClosureArgumentsValid,
}

/// Why a thread interrupt was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    /// Cooperative safepoint request (GC, snapshot, ...).
    Safepoint,
    /// Cross-thread message delivery.
    Message,
}

/// Per-thread execution state shared with the interpreter.
pub struct Thread {
    scheduled: AtomicBool,
    queue: Mutex<Vec<InterruptReason>>,
    /// Link to the innermost synthetic exit frame, 0 when none.
    pub top_exit_frame_info: usize,
}

impl Thread {
    /// Fresh thread state.
    pub fn new() -> Thread {
        Thread {
            scheduled: AtomicBool::new(false),
            queue: Mutex::new(Vec::new()),
            top_exit_frame_info: 0,
        }
    }

    /// Request an interrupt; sampled at the next `CheckStack`.
    pub fn schedule_interrupt(&self, reason: InterruptReason) {
        self.queue.lock().push(reason);
        self.scheduled.store(true, Ordering::Release);
    }

    /// Whether an interrupt is pending.
    #[inline]
    pub fn has_scheduled_interrupts(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Drain pending interrupts.
    pub fn take_interrupts(&self) -> Vec<InterruptReason> {
        let mut queue = self.queue.lock();
        self.scheduled.store(false, Ordering::Release);
        std::mem::take(&mut *queue)
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

/// Observability counters; tests use these to watch helper traffic.
#[derive(Debug, Default, Clone)]
pub struct RuntimeStats {
    /// `instance_call_miss_handler` invocations.
    pub miss_handler_calls: usize,
    /// noSuchMethod helper invocations.
    pub no_such_method_calls: usize,
    /// Exceptions raised by helpers.
    pub throws: usize,
    /// Allocations that fell off the bump fast path.
    pub slow_allocations: usize,
    /// Interrupts serviced by the stack-overflow helper.
    pub interrupts_serviced: usize,
    /// `type_check` invocations.
    pub type_checks: usize,
    /// Field guard updates.
    pub field_guard_updates: usize,
    /// `compile_function` invocations.
    pub compile_requests: usize,
    /// Lazily linked native entries.
    pub native_links: usize,
    /// Static field initializer runs.
    pub static_inits: usize,
    /// Instance field initializer runs.
    pub instance_inits: usize,
}

/// Bootstrap singletons and well-known class ids.
pub struct WellKnown {
    /// The null singleton.
    pub null: Value,
    /// The true singleton.
    pub true_value: Value,
    /// The false singleton.
    pub false_value: Value,
    /// The uninitialized-field sentinel.
    pub sentinel: Value,
    /// Canonical empty type-argument vector.
    pub empty_type_args: Value,
    /// Canonical empty instantiations cache.
    pub empty_instantiations: Value,
    /// The `dynamic` type.
    pub dynamic_type: Value,
    /// Preallocated out-of-memory error (thrown when allocation of an error
    /// would itself fail).
    pub out_of_memory: Value,
    /// Interned `call` selector.
    pub call_selector: Value,
    /// NoSuchMethodError class.
    pub nsm_error_cid: ClassId,
    /// Null-dereference error class.
    pub null_error_cid: ClassId,
    /// TypeError class.
    pub type_error_cid: ClassId,
    /// ArgumentError class.
    pub argument_error_cid: ClassId,
    /// IntegerDivisionByZero error class.
    pub division_by_zero_cid: ClassId,
    /// StackOverflowError class.
    pub stack_overflow_cid: ClassId,
    /// OutOfMemoryError class.
    pub out_of_memory_cid: ClassId,
    /// UnsupportedError class.
    pub unsupported_cid: ClassId,
    /// LateInitializationError class.
    pub late_init_cid: ClassId,
}

/// Registered native function.
pub type NativeFn = fn(&mut RuntimeEnv, &mut NativeArguments<'_>) -> HelperResult;

/// Field initializer run by `init_instance_field`/`init_static_field`.
pub type FieldInit = Rc<dyn Fn(&mut RuntimeEnv) -> Result<Value, Unwind>>;

/// Hook run by `compile_function` to attach code or bytecode.
pub type CompileHook = Rc<dyn Fn(&mut RuntimeEnv, FunctionId) -> HelperResult>;

type ArgDescKey = (i64, i64, Vec<(u64, i64)>);

/// The surrounding managed runtime, as seen by the interpreter.
pub struct RuntimeEnv {
    /// Managed heap fast paths.
    pub heap: Heap,
    /// Loaded-program metadata.
    pub program: Program,
    /// Per-thread state.
    pub thread: Thread,
    /// Helper-traffic counters.
    pub stats: RuntimeStats,
    /// Whether the miss handler may synthesize noSuchMethod dispatchers.
    pub lazy_dispatchers: bool,
    wk: WellKnown,
    symbols: FxHashMap<String, Value>,
    argdescs: FxHashMap<ArgDescKey, Value>,
    methods: FxHashMap<(ClassId, u64), FunctionId>,
    dispatch_fields: FxHashMap<(ClassId, u64), FieldId>,
    natives: Vec<NativeFn>,
    native_names: FxHashMap<String, usize>,
    field_inits: FxHashMap<FieldId, FieldInit>,
    compile_hooks: FxHashMap<FunctionId, CompileHook>,
    pending_exception: Value,
    pending_stacktrace: Value,
    pending_unwind_error: bool,
}

impl RuntimeEnv {
    /// Bootstrap an environment: singletons, canonical vectors, and the core
    /// error classes.
    pub fn new() -> RuntimeEnv {
        Self::with_heap_config(HeapConfig::default())
    }

    /// Bootstrap with explicit heap sizing.
    pub fn with_heap_config(config: HeapConfig) -> RuntimeEnv {
        let mut heap = Heap::new(config);
        let program = Program::new();

        let null = heap
            .allocate_old(CID_NULL, 1)
            .expect("old space exhausted during bootstrap")
            .value();
        let true_value = {
            let obj = heap.allocate_old(CID_BOOL, 2).expect("bootstrap");
            obj.set_slot(0, Value::smi(1));
            obj.value()
        };
        let false_value = {
            let obj = heap.allocate_old(CID_BOOL, 2).expect("bootstrap");
            obj.set_slot(0, Value::smi(0));
            obj.value()
        };
        let sentinel = heap.allocate_old(CID_SENTINEL, 1).expect("bootstrap").value();

        let empty_instantiations = {
            let obj = heap
                .allocate_old(CID_ARRAY, Array::size_words(1))
                .expect("bootstrap");
            Array::init(obj, null, 1, Value::smi(instantiation::NO_INSTANTIATOR));
            obj.value()
        };
        let empty_type_args = {
            let obj = heap
                .allocate_old(CID_TYPE_ARGUMENTS, TypeArguments::size_words(0))
                .expect("bootstrap");
            obj.set_slot(0, empty_instantiations);
            obj.set_slot(1, Value::smi(0));
            obj.value()
        };
        let dynamic_type = {
            let obj = heap
                .allocate_old(CID_TYPE, Type::SIZE_WORDS)
                .expect("bootstrap");
            obj.set_slot(0, Value::smi(Type::DYNAMIC_CLASS));
            obj.set_slot(1, null);
            obj.set_slot(2, Value::smi(nullability::NULLABLE));
            obj.value()
        };

        let mut env = RuntimeEnv {
            heap,
            program,
            thread: Thread::new(),
            stats: RuntimeStats::default(),
            lazy_dispatchers: false,
            wk: WellKnown {
                null,
                true_value,
                false_value,
                sentinel,
                empty_type_args,
                empty_instantiations,
                dynamic_type,
                out_of_memory: null,
                call_selector: null,
                nsm_error_cid: CID_ILLEGAL,
                null_error_cid: CID_ILLEGAL,
                type_error_cid: CID_ILLEGAL,
                argument_error_cid: CID_ILLEGAL,
                division_by_zero_cid: CID_ILLEGAL,
                stack_overflow_cid: CID_ILLEGAL,
                out_of_memory_cid: CID_ILLEGAL,
                unsupported_cid: CID_ILLEGAL,
                late_init_cid: CID_ILLEGAL,
            },
            symbols: FxHashMap::default(),
            argdescs: FxHashMap::default(),
            methods: FxHashMap::default(),
            dispatch_fields: FxHashMap::default(),
            natives: Vec::new(),
            native_names: FxHashMap::default(),
            field_inits: FxHashMap::default(),
            compile_hooks: FxHashMap::default(),
            pending_exception: null,
            pending_stacktrace: null,
            pending_unwind_error: false,
        };

        env.wk.call_selector = env.intern("call");
        env.wk.nsm_error_cid = env.register_class("NoSuchMethodError", 2, None);
        env.wk.null_error_cid = env.register_class("NullError", 2, None);
        env.wk.type_error_cid = env.register_class("TypeError", 2, None);
        env.wk.argument_error_cid = env.register_class("ArgumentError", 2, None);
        env.wk.division_by_zero_cid =
            env.register_class("IntegerDivisionByZeroException", 2, None);
        env.wk.stack_overflow_cid = env.register_class("StackOverflowError", 2, None);
        env.wk.out_of_memory_cid = env.register_class("OutOfMemoryError", 2, None);
        env.wk.unsupported_cid = env.register_class("UnsupportedError", 2, None);
        env.wk.late_init_cid = env.register_class("LateInitializationError", 2, None);

        // The OOM error must exist up front; throwing it cannot allocate.
        let message = env.intern("out of memory");
        let obj = env
            .heap
            .allocate_old(env.wk.out_of_memory_cid, 3)
            .expect("bootstrap");
        obj.set_slot(0, message);
        obj.set_slot(1, null);
        env.wk.out_of_memory = obj.value();

        env
    }

    // ===== Well-known values =====

    /// Well-known singletons and class ids.
    #[inline]
    pub fn well_known(&self) -> &WellKnown {
        &self.wk
    }

    /// The null singleton.
    #[inline]
    pub fn null_value(&self) -> Value {
        self.wk.null
    }

    /// The true singleton.
    #[inline]
    pub fn true_value(&self) -> Value {
        self.wk.true_value
    }

    /// The false singleton.
    #[inline]
    pub fn false_value(&self) -> Value {
        self.wk.false_value
    }

    /// Boolean singleton for `b`.
    #[inline]
    pub fn bool_value(&self, b: bool) -> Value {
        if b {
            self.wk.true_value
        } else {
            self.wk.false_value
        }
    }

    /// The uninitialized-field sentinel.
    #[inline]
    pub fn sentinel_value(&self) -> Value {
        self.wk.sentinel
    }

    // ===== Interning =====

    /// Intern a string in the old generation. Interned strings compare by
    /// identity, which is what the lookup cache and parameter binding need.
    pub fn intern(&mut self, s: &str) -> Value {
        if let Some(v) = self.symbols.get(s) {
            return *v;
        }
        let obj = self
            .heap
            .allocate_old(CID_STR, Str::size_words(s.len()))
            .expect("old space exhausted while interning");
        Str::init(obj, s);
        self.symbols.insert(s.to_string(), obj.value());
        obj.value()
    }

    /// Canonical arguments descriptor (old generation, interned by shape).
    pub fn args_descriptor(
        &mut self,
        type_args_len: i64,
        positional_count: i64,
        named: &[(&str, i64)],
    ) -> Value {
        let names: Vec<Value> = named.iter().map(|(n, _)| self.intern(n)).collect();
        let key: ArgDescKey = (
            type_args_len,
            positional_count,
            names
                .iter()
                .zip(named.iter())
                .map(|(n, (_, p))| (n.raw(), *p))
                .collect(),
        );
        if let Some(v) = self.argdescs.get(&key) {
            return *v;
        }
        let len = ArgsDescriptor::array_len(named.len());
        let obj = self
            .heap
            .allocate_old(CID_ARRAY, Array::size_words(len))
            .expect("old space exhausted while interning");
        Array::init(obj, self.wk.null, len, self.wk.null);
        let pairs: Vec<(Value, i64)> = names
            .iter()
            .zip(named.iter())
            .map(|(n, (_, p))| (*n, *p))
            .collect();
        ArgsDescriptor::init(Array(obj), type_args_len, positional_count, &pairs);
        self.argdescs.insert(key, obj.value());
        obj.value()
    }

    // ===== Registration =====

    /// Register a program class and return its id.
    pub fn register_class(
        &mut self,
        name: &str,
        fields: u32,
        super_class: Option<ClassId>,
    ) -> ClassId {
        let name = self.intern(name);
        let mut class = Class::plain(name, fields);
        class.super_class = super_class;
        self.program.add_class(class)
    }

    /// Register an instance method for dispatch.
    pub fn register_method(&mut self, cid: ClassId, name: &str, function: FunctionId) {
        let name = self.intern(name);
        self.methods.insert((cid, name.raw()), function);
    }

    /// Register a field for `get_field_for_dispatch`.
    pub fn register_dispatch_field(&mut self, cid: ClassId, name: &str, field: FieldId) {
        let name = self.intern(name);
        self.dispatch_fields.insert((cid, name.raw()), field);
    }

    /// Register a native function; `native_call_entry` links it lazily.
    pub fn register_native(&mut self, name: &str, f: NativeFn) {
        let index = self.natives.len();
        self.natives.push(f);
        self.native_names.insert(name.to_string(), index);
    }

    /// Register a field initializer.
    pub fn register_field_initializer(&mut self, field: FieldId, init: FieldInit) {
        self.field_inits.insert(field, init);
    }

    /// Register a compile hook for a function without code or bytecode.
    pub fn register_compile_hook(&mut self, function: FunctionId, hook: CompileHook) {
        self.compile_hooks.insert(function, hook);
    }

    /// Native entry descriptor for a `NativeCall` constant-pool slot:
    /// `[recognized_kind, name, argc, link]`.
    pub fn native_call_entry(&mut self, name: &str, argc: i64) -> Value {
        let kind = natives::recognized_kind(name);
        let name_value = self.intern(name);
        let obj = self
            .heap
            .allocate_old(CID_ARRAY, Array::size_words(4))
            .expect("old space exhausted while interning");
        Array::init(obj, self.wk.null, 4, self.wk.null);
        let entry = Array(obj);
        entry.set_at(natives::ENTRY_KIND, Value::smi(kind));
        entry.set_at(natives::ENTRY_NAME, name_value);
        entry.set_at(natives::ENTRY_ARGC, Value::smi(argc));
        entry.set_at(natives::ENTRY_LINK, self.wk.null);
        obj.value()
    }

    pub(crate) fn native_by_index(&self, index: usize) -> NativeFn {
        self.natives[index]
    }

    pub(crate) fn lookup_native(&self, name: &str) -> Option<usize> {
        self.native_names.get(name).copied()
    }

    // ===== Allocation =====

    /// Allocate with fallback: young bump, then (after the collector stand-in
    /// declines) old space, else a thrown OutOfMemoryError.
    pub fn allocate_any(&mut self, cid: ClassId, size_words: usize) -> Result<ObjRef, Unwind> {
        if let Some(obj) = self.heap.try_allocate(cid, size_words) {
            return Ok(obj);
        }
        self.stats.slow_allocations += 1;
        if let Some(obj) = self.heap.allocate_old(cid, size_words) {
            return Ok(obj);
        }
        Err(self.throw_value(self.wk.out_of_memory))
    }

    /// Allocate and initialize a string.
    pub fn new_str(&mut self, s: &str) -> Result<Value, Unwind> {
        let obj = self.allocate_any(CID_STR, Str::size_words(s.len()))?;
        Str::init(obj, s);
        Ok(obj.value())
    }

    /// Allocate a null-filled array.
    pub fn new_array(&mut self, len: usize, type_args: Value) -> Result<Value, Unwind> {
        let obj = self.allocate_any(CID_ARRAY, Array::size_words(len))?;
        Array::init(obj, type_args, len, self.wk.null);
        Ok(obj.value())
    }

    /// Allocate an array holding `values`.
    pub fn new_array_from(&mut self, values: &[Value]) -> Result<Value, Unwind> {
        let obj = self.allocate_any(CID_ARRAY, Array::size_words(values.len()))?;
        Array::init(obj, self.wk.null, values.len(), self.wk.null);
        for (i, v) in values.iter().enumerate() {
            Array(obj).set_at(i, *v);
        }
        Ok(obj.value())
    }

    /// Box an integer; immediates stay immediate.
    pub fn box_int(&mut self, v: i64) -> Result<Value, Unwind> {
        if Value::fits_smi(v) {
            return Ok(Value::smi(v));
        }
        let obj = self.allocate_any(CID_MINT, Mint::SIZE_WORDS)?;
        Mint(obj).set_value(v);
        Ok(obj.value())
    }

    /// Box a double.
    pub fn box_double(&mut self, v: f64) -> Result<Value, Unwind> {
        let obj = self.allocate_any(CID_FLOAT, Float::SIZE_WORDS)?;
        Float(obj).set_value(v);
        Ok(obj.value())
    }

    /// Build a Type value in the old generation (program setup).
    pub fn make_type(&mut self, type_class: i64, type_args: Value, nullable: bool) -> Value {
        let obj = self
            .heap
            .allocate_old(CID_TYPE, Type::SIZE_WORDS)
            .expect("old space exhausted during program setup");
        obj.set_slot(0, Value::smi(type_class));
        obj.set_slot(1, type_args);
        obj.set_slot(
            2,
            Value::smi(if nullable {
                nullability::NULLABLE
            } else {
                nullability::NON_NULLABLE
            }),
        );
        obj.value()
    }

    /// Build a type-argument vector in the old generation (program setup).
    pub fn make_type_args(&mut self, types: &[Value]) -> Value {
        let obj = self
            .heap
            .allocate_old(CID_TYPE_ARGUMENTS, TypeArguments::size_words(types.len()))
            .expect("old space exhausted during program setup");
        obj.set_slot(0, self.wk.empty_instantiations);
        obj.set_slot(1, Value::smi(types.len() as i64));
        for (i, t) in types.iter().enumerate() {
            obj.set_slot(TypeArguments::TYPES_SLOT + i, *t);
        }
        obj.value()
    }

    /// Build a type parameter in the old generation (program setup).
    pub fn make_type_param(&mut self, function_level: bool, index: i64) -> Value {
        let obj = self
            .heap
            .allocate_old(CID_TYPE_PARAMETER, TypeParameter::SIZE_WORDS)
            .expect("old space exhausted during program setup");
        obj.set_slot(0, Value::smi(function_level as i64));
        obj.set_slot(1, Value::smi(index));
        obj.value()
    }

    /// Allocate an error instance `[message, detail]`.
    pub fn new_error(&mut self, cid: ClassId, message: &str, detail: Value) -> Result<Value, Unwind> {
        let message = self.new_str(message)?;
        let obj = self.allocate_any(cid, 3)?;
        obj.set_slot(0, message);
        obj.set_slot(1, detail);
        Ok(obj.value())
    }

    /// Allocate an UnhandledException wrapper.
    pub fn new_unhandled_exception(
        &mut self,
        exception: Value,
        stacktrace: Value,
    ) -> Result<Value, Unwind> {
        let obj = self.allocate_any(
            CID_UNHANDLED_EXCEPTION,
            object::UnhandledException::SIZE_WORDS,
        )?;
        obj.set_slot(0, exception);
        obj.set_slot(1, stacktrace);
        Ok(obj.value())
    }

    // ===== Throwing =====

    /// Record `exception` as pending and signal unwind.
    pub fn throw_value(&mut self, exception: Value) -> Unwind {
        self.stats.throws += 1;
        self.pending_exception = exception;
        self.pending_stacktrace = self.wk.null;
        self.pending_unwind_error = false;
        Unwind
    }

    /// Allocate and throw an error instance.
    pub fn throw_new(&mut self, cid: ClassId, message: &str, detail: Value) -> Unwind {
        match self.new_error(cid, message, detail) {
            Ok(error) => self.throw_value(error),
            Err(unwind) => unwind,
        }
    }

    /// Re-raise an exception with its original stack trace (compiled code
    /// returned an UnhandledException wrapper).
    pub(crate) fn rethrow(&mut self, exception: Value, stacktrace: Value) -> Unwind {
        self.stats.throws += 1;
        self.pending_exception = exception;
        self.pending_stacktrace = stacktrace;
        self.pending_unwind_error = false;
        Unwind
    }

    /// Record an error object that must bypass handlers and unwind to the
    /// entry frame (compiled code returned a VM error).
    pub(crate) fn set_pending_error(&mut self, error: Value) -> Unwind {
        self.pending_exception = error;
        self.pending_stacktrace = self.wk.null;
        self.pending_unwind_error = true;
        Unwind
    }

    /// Take the pending exception state: `(exception, stacktrace,
    /// bypass_handlers)`.
    pub(crate) fn take_pending(&mut self) -> (Value, Value, bool) {
        let result = (
            self.pending_exception,
            self.pending_stacktrace,
            self.pending_unwind_error,
        );
        self.pending_exception = self.wk.null;
        self.pending_stacktrace = self.wk.null;
        self.pending_unwind_error = false;
        result
    }

    /// Record the stack trace the unwinder built for the pending exception.
    pub(crate) fn set_pending_stacktrace(&mut self, st: Value) {
        self.pending_stacktrace = st;
    }

    /// Build a stack-trace object from frame function handles.
    pub(crate) fn new_stack_trace(&mut self, frames: &[Value]) -> Value {
        let Ok(array) = self.new_array_from(frames) else {
            return self.wk.null;
        };
        match self.allocate_any(CID_STACK_TRACE, object::StackTrace::SIZE_WORDS) {
            Ok(obj) => {
                obj.set_slot(0, array);
                obj.value()
            }
            Err(_) => self.wk.null,
        }
    }

    // ===== Resolution =====

    /// Whether `name` is a dynamic-invocation-forwarder selector.
    pub fn is_dynamic_selector(&self, name: Value) -> bool {
        name.is_heap_object()
            && class_id(name) == CID_STR
            && Str(ObjRef::from_value(name)).as_str().starts_with("dyn:")
    }

    /// Strip the dynamic-invocation prefix.
    pub fn demangle_selector(&mut self, name: Value) -> Value {
        if !self.is_dynamic_selector(name) {
            return name;
        }
        let stripped = Str(ObjRef::from_value(name))
            .as_str()
            .trim_start_matches("dyn:")
            .to_string();
        self.intern(&stripped)
    }

    /// Walk the class chain for a method.
    pub fn resolve_method(&self, mut cid: ClassId, name: Value) -> Option<FunctionId> {
        loop {
            if let Some(f) = self.methods.get(&(cid, name.raw())) {
                return Some(*f);
            }
            cid = self.program.class(cid).super_class?;
        }
    }

    fn resolve_dispatch_field(&self, mut cid: ClassId, name: Value) -> Option<FieldId> {
        loop {
            if let Some(f) = self.dispatch_fields.get(&(cid, name.raw())) {
                return Some(*f);
            }
            cid = self.program.class(cid).super_class?;
        }
    }

    // ===== Subtype oracle =====

    fn cid_subtype_of_class(&self, mut cid: ClassId, type_class: ClassId) -> bool {
        // The boxed and immediate integer classes share the `int` interface.
        if type_class == CID_SMI || type_class == CID_MINT {
            return cid == CID_SMI || cid == CID_MINT;
        }
        loop {
            if cid == type_class {
                return true;
            }
            match self.program.class(cid).super_class {
                Some(super_cid) => cid = super_cid,
                None => return false,
            }
        }
    }

    fn type_args_compatible(&self, instance_args: Value, type_args: Value) -> bool {
        if type_args.identical(self.wk.null) {
            return true;
        }
        if instance_args.identical(type_args) {
            return true;
        }
        if !instance_args.is_heap_object() || class_id(instance_args) != CID_TYPE_ARGUMENTS {
            return false;
        }
        if class_id(type_args) != CID_TYPE_ARGUMENTS {
            return false;
        }
        let want = TypeArguments(ObjRef::from_value(type_args));
        // A vector of top types accepts any instantiation.
        for i in 0..want.len() {
            let t = want.type_at(i);
            if class_id(t) != CID_TYPE || !Type(ObjRef::from_value(t)).is_top() {
                return false;
            }
        }
        true
    }

    /// Assignability of `instance` to `type_value` under the given
    /// instantiator/function vectors.
    pub fn value_assignable_to(
        &mut self,
        instance: Value,
        type_value: Value,
        instantiator_type_args: Value,
        function_type_args: Value,
    ) -> bool {
        let type_value = match self.instantiate_type_value(
            type_value,
            instantiator_type_args,
            function_type_args,
        ) {
            Ok(t) => t,
            Err(_) => return false,
        };
        if type_value.identical(self.wk.null) {
            return true;
        }
        if class_id(type_value) != CID_TYPE {
            return false;
        }
        let ty = Type(ObjRef::from_value(type_value));
        if ty.is_top() {
            return true;
        }
        if instance.identical(self.wk.null) {
            return ty.type_nullability() == nullability::NULLABLE;
        }
        let cid = class_id(instance);
        if cid == CID_CLOSURE {
            // Function types are resolved by the runtime's full checker; the
            // core accepts closures only against the closure class itself.
            return ty.type_class() == CID_CLOSURE as i64;
        }
        if !self.cid_subtype_of_class(cid, ty.type_class() as ClassId) {
            return false;
        }
        let class = self.program.class(cid);
        if class.num_type_arguments > 0 && class.type_args_field_offset_words >= 0 {
            let instance_args =
                ObjRef::from_value(instance).slot(class.type_args_field_offset_words as usize);
            return self.type_args_compatible(instance_args, ty.type_args());
        }
        true
    }

    fn type_subtype_of(&mut self, sub: Value, super_: Value) -> bool {
        if super_.identical(self.wk.null) || sub.identical(super_) {
            return true;
        }
        if class_id(super_) != CID_TYPE {
            return false;
        }
        let sup = Type(ObjRef::from_value(super_));
        if sup.is_top() {
            return true;
        }
        if class_id(sub) != CID_TYPE {
            return false;
        }
        let sub = Type(ObjRef::from_value(sub));
        if sub.is_top() {
            return false;
        }
        if sub.type_nullability() == nullability::NULLABLE
            && sup.type_nullability() != nullability::NULLABLE
        {
            return false;
        }
        self.cid_subtype_of_class(sub.type_class() as ClassId, sup.type_class() as ClassId)
            && self.type_args_compatible(sub.type_args(), sup.type_args())
    }

    // ===== Type instantiation =====

    fn instantiate_type_value(
        &mut self,
        type_value: Value,
        instantiator_type_args: Value,
        function_type_args: Value,
    ) -> Result<Value, Unwind> {
        if !type_value.is_heap_object() {
            return Ok(type_value);
        }
        match class_id(type_value) {
            CID_TYPE_PARAMETER => {
                let param = TypeParameter(ObjRef::from_value(type_value));
                let vector = if param.is_function_level() {
                    function_type_args
                } else {
                    instantiator_type_args
                };
                if !vector.is_heap_object() || class_id(vector) != CID_TYPE_ARGUMENTS {
                    return Ok(self.wk.dynamic_type);
                }
                let args = TypeArguments(ObjRef::from_value(vector));
                if param.index() >= args.len() {
                    return Ok(self.wk.dynamic_type);
                }
                Ok(args.type_at(param.index()))
            }
            _ => Ok(type_value),
        }
    }

    fn instantiate_type_args_value(
        &mut self,
        type_args: Value,
        instantiator_type_args: Value,
        function_type_args: Value,
    ) -> Result<Value, Unwind> {
        if !type_args.is_heap_object() || class_id(type_args) != CID_TYPE_ARGUMENTS {
            return Ok(type_args);
        }
        let source = TypeArguments(ObjRef::from_value(type_args));
        let len = source.len();
        let obj = self.allocate_any(CID_TYPE_ARGUMENTS, TypeArguments::size_words(len))?;
        obj.set_slot(0, self.wk.null);
        obj.set_slot(1, Value::smi(len as i64));
        for i in 0..len {
            let source = TypeArguments(ObjRef::from_value(type_args));
            let instantiated = self.instantiate_type_value(
                source.type_at(i),
                instantiator_type_args,
                function_type_args,
            )?;
            obj.set_slot(TypeArguments::TYPES_SLOT + i, instantiated);
        }
        Ok(obj.value())
    }

    /// Install a result into a vector's instantiations cache.
    fn install_instantiation(
        &mut self,
        type_args: Value,
        instantiator_type_args: Value,
        function_type_args: Value,
        instantiated: Value,
    ) -> Result<(), Unwind> {
        let vector = TypeArguments(ObjRef::from_value(type_args));
        let cache = vector.instantiations();
        let null = self.wk.null;
        let sentinel = Value::smi(instantiation::NO_INSTANTIATOR);
        let is_terminator = |v: Value| v.identical(sentinel) || v.identical(null);
        let is_shared =
            cache.identical(self.wk.empty_instantiations) || cache.identical(null);

        if !is_shared {
            let array = Array(ObjRef::from_value(cache));
            let mut i = 0;
            while !is_terminator(array.at(i)) {
                i += instantiation::SIZE;
            }
            if i + instantiation::SIZE < array.len() {
                array.set_at(i + instantiation::INSTANTIATOR, instantiator_type_args);
                array.set_at(i + instantiation::FUNCTION, function_type_args);
                array.set_at(i + instantiation::INSTANTIATED, instantiated);
                array.set_at(i + instantiation::SIZE, sentinel);
                return Ok(());
            }
        }

        // Grow (or split off the shared empty cache).
        let used = if is_shared {
            0
        } else {
            let array = Array(ObjRef::from_value(cache));
            let mut i = 0;
            while !is_terminator(array.at(i)) {
                i += instantiation::SIZE;
            }
            i
        };
        let new_len = (used + instantiation::SIZE) * 2 + 1;
        let new_cache = self.new_array(new_len, null)?;
        let new_array = Array(ObjRef::from_value(new_cache));
        if !is_shared {
            let old_array = Array(ObjRef::from_value(cache));
            for i in 0..used {
                new_array.set_at(i, old_array.at(i));
            }
        }
        new_array.set_at(used + instantiation::INSTANTIATOR, instantiator_type_args);
        new_array.set_at(used + instantiation::FUNCTION, function_type_args);
        new_array.set_at(used + instantiation::INSTANTIATED, instantiated);
        new_array.set_at(used + instantiation::SIZE, sentinel);
        self.heap.store(ObjRef::from_value(type_args), 0, new_cache);
        Ok(())
    }

    // ===== Subtype-test cache =====

    fn stc_install(&mut self, cache: Value, keys: [Value; 6], result: bool) -> Result<(), Unwind> {
        let stc_obj = SubtypeTestCache(ObjRef::from_value(cache));
        let backing = Array(ObjRef::from_value(stc_obj.entries()));
        let null = self.wk.null;

        let mut at = 0;
        while at + stc::ENTRY_LENGTH <= backing.len()
            && !backing.at(at + stc::INSTANCE_CID_OR_SIGNATURE).identical(null)
        {
            at += stc::ENTRY_LENGTH;
        }
        let target = if at + stc::ENTRY_LENGTH <= backing.len() {
            backing
        } else {
            // Full: double the backing store.
            let new_backing = self.new_array(backing.len() * 2, null)?;
            let new_array = Array(ObjRef::from_value(new_backing));
            for i in 0..backing.len() {
                new_array.set_at(i, backing.at(i));
            }
            self.heap
                .store(ObjRef::from_value(cache), 0, new_backing);
            new_array
        };
        for (i, key) in keys.iter().enumerate() {
            target.set_at(at + i, *key);
        }
        target.set_at(at + stc::RESULT, self.bool_value(result));
        Ok(())
    }

    // ===== Field guards =====

    /// Whether a store of `value` requires a runtime guard update first.
    pub fn field_needs_guard_update(&self, field: &Field, value: Value) -> bool {
        if field.guarded_cid == CID_ILLEGAL {
            return true;
        }
        if field.exactness == EXACTNESS_UNINITIALIZED {
            return true;
        }
        if value.identical(self.wk.null) {
            return field.nullability_cid != CID_NULL;
        }
        let cid = class_id(value);
        if field.guarded_cid != GUARDED_CID_ANY && cid != field.guarded_cid {
            return true;
        }
        if field.guarded_list_length >= 0 || field.guarded_list_length == UNKNOWN_FIXED_LENGTH {
            if cid == CID_ARRAY {
                let len = Array(ObjRef::from_value(value)).len() as i64;
                return len != field.guarded_list_length;
            }
            return field.guarded_list_length != NO_FIXED_LENGTH;
        }
        false
    }

    fn update_field_guard(&mut self, field_id: FieldId, value: Value) {
        self.stats.field_guard_updates += 1;
        let null = self.wk.null;
        let (is_null, cid, list_len) = if value.identical(null) {
            (true, CID_NULL, None)
        } else {
            let cid = class_id(value);
            let len = if cid == CID_ARRAY {
                Some(Array(ObjRef::from_value(value)).len() as i64)
            } else {
                None
            };
            (false, cid, len)
        };
        let field = self.program.field_mut(field_id);
        if field.exactness == EXACTNESS_UNINITIALIZED {
            field.exactness = EXACTNESS_NOT_TRACKING;
        }
        if is_null {
            field.nullability_cid = CID_NULL;
            if field.guarded_cid == CID_ILLEGAL {
                // Nothing else observed yet.
                return;
            }
            return;
        }
        if field.guarded_cid == CID_ILLEGAL {
            field.guarded_cid = cid;
            field.guarded_list_length = list_len.unwrap_or(NO_FIXED_LENGTH);
        } else if field.guarded_cid != cid && field.guarded_cid != GUARDED_CID_ANY {
            field.guarded_cid = GUARDED_CID_ANY;
            field.guarded_list_length = NO_FIXED_LENGTH;
        } else if let Some(len) = list_len {
            if field.guarded_list_length >= 0 && field.guarded_list_length != len {
                field.guarded_list_length = NO_FIXED_LENGTH;
            }
        }
    }

    // ===== The helper entry table =====

    /// Invoke a runtime helper. Helpers may allocate (and thus trigger the
    /// collector) and may throw by returning `Err(Unwind)`.
    pub fn invoke(&mut self, entry: RuntimeEntry, args: &mut NativeArguments<'_>) -> HelperResult {
        match entry {
            RuntimeEntry::Throw => {
                let exception = args.arg(0);
                Err(self.throw_value(exception))
            }
            RuntimeEntry::ReThrow => {
                self.stats.throws += 1;
                self.pending_exception = args.arg(0);
                self.pending_stacktrace = args.arg(1);
                self.pending_unwind_error = false;
                Err(Unwind)
            }
            RuntimeEntry::AllocateObject => {
                let cid = args.arg(0).as_smi() as ClassId;
                let type_args = args.arg(1);
                let class = self.program.class(cid);
                let size = class.instance_size_words as usize;
                let ta_offset = class.type_args_field_offset_words;
                let obj = self.allocate_any(cid, size)?;
                for slot in 0..size - 1 {
                    obj.set_slot(slot, self.wk.null);
                }
                if ta_offset >= 0 {
                    obj.set_slot(ta_offset as usize, type_args);
                }
                args.set_return(obj.value());
                Ok(())
            }
            RuntimeEntry::AllocateArray => {
                let length = args.arg(0);
                let type_args = args.arg(1);
                if !length.is_smi()
                    || length.as_smi() < 0
                    || length.as_smi() > Array::MAX_LENGTH
                {
                    return Err(self.throw_new(
                        self.wk.argument_error_cid,
                        "invalid array length",
                        length,
                    ));
                }
                let array = self.new_array(length.as_smi() as usize, type_args)?;
                args.set_return(array);
                Ok(())
            }
            RuntimeEntry::AllocateGrowableArray => {
                let length = args.arg(0).as_smi();
                let type_args = args.arg(1);
                let data = self.new_array(length.max(0) as usize, self.wk.null)?;
                let obj = self.allocate_any(CID_GROWABLE_ARRAY, GrowableArray::SIZE_WORDS)?;
                obj.set_slot(0, type_args);
                obj.set_slot(1, Value::smi(length));
                obj.set_slot(GrowableArray::DATA_SLOT, data);
                args.set_return(obj.value());
                Ok(())
            }
            RuntimeEntry::AllocateContext => {
                let num_vars = args.arg(0).as_smi() as usize;
                let obj = self.allocate_any(CID_CONTEXT, Context::size_words(num_vars))?;
                Context::init(obj, num_vars, self.wk.null);
                args.set_return(obj.value());
                Ok(())
            }
            RuntimeEntry::AllocateTypedData => {
                let elem_size = args.arg(0).as_smi();
                let length = args.arg(1);
                if !length.is_smi()
                    || length.as_smi() < 0
                    || length.as_smi() > Array::MAX_LENGTH
                {
                    return Err(self.throw_new(
                        self.wk.argument_error_cid,
                        "invalid typed data length",
                        length,
                    ));
                }
                let len = length.as_smi() as usize;
                let obj = self.allocate_any(
                    CID_TYPED_DATA,
                    TypedData::size_words(len, elem_size as usize),
                )?;
                TypedData::init(obj, len, elem_size as usize);
                args.set_return(obj.value());
                Ok(())
            }
            RuntimeEntry::AllocateSubtypeTestCache => {
                let backing =
                    self.new_array(stc::ENTRY_LENGTH * stc::INITIAL_ENTRIES, self.wk.null)?;
                let obj =
                    self.allocate_any(CID_SUBTYPE_TEST_CACHE, SubtypeTestCache::SIZE_WORDS)?;
                obj.set_slot(0, backing);
                args.set_return(obj.value());
                Ok(())
            }
            RuntimeEntry::CloneContext => {
                let source = Context(ObjRef::from_value(args.arg(0)));
                let len = source.len();
                let obj = self.allocate_any(CID_CONTEXT, Context::size_words(len))?;
                let source = Context(ObjRef::from_value(args.arg(0)));
                obj.set_slot(Context::PARENT_SLOT, source.parent());
                obj.set_slot(1, Value::smi(len as i64));
                for i in 0..len {
                    obj.set_slot(Context::VARS_SLOT + i, source.var(i));
                }
                args.set_return(obj.value());
                Ok(())
            }
            RuntimeEntry::CompileFunction => {
                self.stats.compile_requests += 1;
                let function = args.arg(0).as_smi() as FunctionId;
                match self.compile_hooks.get(&function).cloned() {
                    Some(hook) => hook(self, function),
                    None => Err(self.throw_new(
                        self.wk.unsupported_cid,
                        "function has no code and no bytecode",
                        args.arg(0),
                    )),
                }
            }
            RuntimeEntry::InitInstanceField => {
                self.stats.instance_inits += 1;
                let field_id = args.arg(1).as_smi() as FieldId;
                let init = match self.field_inits.get(&field_id).cloned() {
                    Some(init) => init,
                    None => {
                        let name = self.program.field(field_id).name;
                        return Err(self.throw_new(
                            self.wk.late_init_cid,
                            "field accessed before initialization",
                            name,
                        ));
                    }
                };
                let value = init(self)?;
                let instance = ObjRef::from_value(args.arg(0));
                let offset = self.program.field(field_id).host_offset_or_field_id as usize;
                self.heap.store(instance, offset, value);
                args.set_return(value);
                Ok(())
            }
            RuntimeEntry::InitStaticField => {
                self.stats.static_inits += 1;
                let field_id = args.arg(0).as_smi() as FieldId;
                let init = match self.field_inits.get(&field_id).cloned() {
                    Some(init) => init,
                    None => {
                        let name = self.program.field(field_id).name;
                        return Err(self.throw_new(
                            self.wk.late_init_cid,
                            "field accessed before initialization",
                            name,
                        ));
                    }
                };
                let value = init(self)?;
                let static_id = self.program.field(field_id).host_offset_or_field_id;
                self.program.set_static_value(static_id, value);
                args.set_return(value);
                Ok(())
            }
            RuntimeEntry::UpdateFieldCid => {
                let field_id = args.arg(0).as_smi() as FieldId;
                let value = args.arg(1);
                self.update_field_guard(field_id, value);
                Ok(())
            }
            RuntimeEntry::StackOverflow => {
                if self.thread.has_scheduled_interrupts() {
                    let serviced = self.thread.take_interrupts();
                    self.stats.interrupts_serviced += serviced.len();
                }
                let overflowed = args.arg(0).as_smi() != 0;
                if overflowed {
                    return Err(self.throw_new(
                        self.wk.stack_overflow_cid,
                        "stack overflow",
                        self.wk.null,
                    ));
                }
                Ok(())
            }
            RuntimeEntry::InstanceCallMissHandler => {
                self.stats.miss_handler_calls += 1;
                let receiver = args.arg(0);
                let mut name = args.arg(1);
                let cid = class_id(receiver);
                if self.is_dynamic_selector(name) {
                    name = self.demangle_selector(name);
                }
                match self.resolve_method(cid, name) {
                    Some(target) => args.set_return(Value::smi(target as i64)),
                    None if self.lazy_dispatchers => {
                        let desc = ArgsDescriptor::from_value(args.arg(2));
                        let target = self.program.add_function(Function {
                            name,
                            kind: FunctionKind::NoSuchMethodDispatcher,
                            is_static: false,
                            num_fixed_params: desc.count() as u32,
                            num_opt_positional_params: 0,
                            num_opt_named_params: 0,
                            num_type_params: 0,
                            bytecode: None,
                            code: None,
                            parent: None,
                            data: FunctionData::None,
                        });
                        args.set_return(Value::smi(target as i64));
                    }
                    None => args.set_return(self.wk.null),
                }
                Ok(())
            }
            RuntimeEntry::InvokeNoSuchMethod => {
                self.stats.no_such_method_calls += 1;
                let name = args.arg(1);
                Err(self.throw_new(self.wk.nsm_error_cid, "method not found", name))
            }
            RuntimeEntry::NoSuchMethodFromPrologue => {
                self.stats.no_such_method_calls += 1;
                let function = args.arg(1).as_smi() as FunctionId;
                let name = self.program.function(function).name;
                Err(self.throw_new(self.wk.nsm_error_cid, "method not found", name))
            }
            RuntimeEntry::TypeCheck => {
                self.stats.type_checks += 1;
                let instance = args.arg(0);
                let type_value = args.arg(1);
                let instantiator_ta = args.arg(2);
                let function_ta = args.arg(3);
                let name = args.arg(4);
                let cache = args.arg(5);
                let ok = self.value_assignable_to(
                    instance,
                    type_value,
                    instantiator_ta,
                    function_ta,
                );
                if !ok {
                    return Err(self.throw_new(self.wk.type_error_cid, "type check failed", name));
                }
                if !cache.identical(self.wk.null) {
                    let keys = stc_shape_keys(
                        &self.program,
                        self.wk.null,
                        instance,
                        instantiator_ta,
                        function_ta,
                    );
                    self.stc_install(cache, keys, true)?;
                }
                args.set_return(instance);
                Ok(())
            }
            RuntimeEntry::SubtypeCheck => {
                let instantiator_ta = args.arg(0);
                let function_ta = args.arg(1);
                let sub = self
                    .instantiate_type_value(args.arg(2), instantiator_ta, function_ta)?;
                let super_ = self
                    .instantiate_type_value(args.arg(3), instantiator_ta, function_ta)?;
                if !self.type_subtype_of(sub, super_) {
                    let name = args.arg(4);
                    return Err(self.throw_new(self.wk.type_error_cid, "type check failed", name));
                }
                args.set_return(self.wk.true_value);
                Ok(())
            }
            RuntimeEntry::NonBoolTypeError => {
                let value = args.arg(0);
                Err(self.throw_new(
                    self.wk.type_error_cid,
                    "condition is not a bool",
                    value,
                ))
            }
            RuntimeEntry::NullErrorWithSelector => {
                let selector = args.arg(0);
                Err(self.throw_new(
                    self.wk.null_error_cid,
                    "method called on null",
                    selector,
                ))
            }
            RuntimeEntry::IntegerDivisionByZero => Err(self.throw_new(
                self.wk.division_by_zero_cid,
                "integer division by zero",
                self.wk.null,
            )),
            RuntimeEntry::ArgumentError => {
                let value = args.arg(0);
                Err(self.throw_new(self.wk.argument_error_cid, "invalid argument", value))
            }
            RuntimeEntry::InstantiateType => {
                let instantiated = self.instantiate_type_value(
                    args.arg(0),
                    args.arg(1),
                    args.arg(2),
                )?;
                args.set_return(instantiated);
                Ok(())
            }
            RuntimeEntry::InstantiateTypeArguments => {
                let type_args = args.arg(0);
                let instantiator_ta = args.arg(1);
                let function_ta = args.arg(2);
                let instantiated = self.instantiate_type_args_value(
                    type_args,
                    instantiator_ta,
                    function_ta,
                )?;
                self.install_instantiation(
                    type_args,
                    instantiator_ta,
                    function_ta,
                    instantiated,
                )?;
                args.set_return(instantiated);
                Ok(())
            }
            RuntimeEntry::GetFieldForDispatch => {
                let receiver = args.arg(0);
                let mut name = args.arg(1);
                if self.is_dynamic_selector(name) {
                    name = self.demangle_selector(name);
                    args.set_arg(1, name);
                }
                let cid = class_id(receiver);
                let field_id = match self.resolve_dispatch_field(cid, name) {
                    Some(f) => f,
                    None => {
                        return Err(self.throw_new(
                            self.wk.nsm_error_cid,
                            "method not found",
                            name,
                        ))
                    }
                };
                let field = self.program.field(field_id);
                let offset = field.host_offset_or_field_id as usize;
                let value = if field.is_static {
                    self.program.static_value(offset as u32)
                } else {
                    ObjRef::from_value(receiver).slot(offset)
                };
                if value.identical(self.wk.sentinel) {
                    let name = self.program.field(field_id).name;
                    return Err(self.throw_new(
                        self.wk.late_init_cid,
                        "field accessed before initialization",
                        name,
                    ));
                }
                args.set_return(value);
                Ok(())
            }
            RuntimeEntry::ResolveCallFunction => {
                let receiver = args.arg(0);
                let call = self.wk.call_selector;
                match self.resolve_method(class_id(receiver), call) {
                    Some(f) => args.set_return(Value::smi(f as i64)),
                    None => args.set_return(self.wk.null),
                }
                Ok(())
            }
            RuntimeEntry::ClosureArgumentsValid => {
                let closure = Closure(ObjRef::from_value(args.arg(0)));
                let desc = ArgsDescriptor::from_value(args.arg(1));
                let function = self
                    .program
                    .function(closure.function().as_smi() as FunctionId);
                let fixed = function.num_fixed_params as i64;
                let max_pos = fixed + function.num_opt_positional_params as i64;
                let pos = desc.positional_count();
                let ok = pos >= fixed
                    && pos <= max_pos
                    && (function.num_opt_named_params > 0 || desc.named_count() == 0);
                let result = self.bool_value(ok);
                args.set_return(result);
                Ok(())
            }
        }
    }
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_identity() {
        let mut env = RuntimeEnv::new();
        let a = env.intern("length");
        let b = env.intern("length");
        let c = env.intern("isEmpty");
        assert!(a.identical(b));
        assert!(!a.identical(c));
        assert!(env.heap.is_old(a));
        assert_eq!(Str(ObjRef::from_value(a)).as_str(), "length");
    }

    #[test]
    fn test_args_descriptor_canonical() {
        let mut env = RuntimeEnv::new();
        let a = env.args_descriptor(0, 1, &[("x", 1)]);
        let b = env.args_descriptor(0, 1, &[("x", 1)]);
        let c = env.args_descriptor(0, 1, &[("y", 1)]);
        assert!(a.identical(b));
        assert!(!a.identical(c));
        assert!(env.heap.is_old(a));
        let desc = ArgsDescriptor::from_value(a);
        assert_eq!(desc.count(), 2);
        assert_eq!(desc.positional_count(), 1);
    }

    #[test]
    fn test_box_int_immediate_invariant() {
        let mut env = RuntimeEnv::new();
        let small = env.box_int(12345).unwrap();
        assert!(small.is_smi());
        let big = env.box_int(i64::MAX).unwrap();
        assert!(big.is_heap_object());
        assert_eq!(class_id(big), CID_MINT);
        assert_eq!(Mint(ObjRef::from_value(big)).value(), i64::MAX);
        // Boundary: largest immediate stays immediate.
        let edge = env.box_int(crate::value::SMI_MAX).unwrap();
        assert!(edge.is_smi());
    }

    #[test]
    fn test_method_resolution_walks_supers() {
        let mut env = RuntimeEnv::new();
        let base = env.register_class("Base", 0, None);
        let derived = env.register_class("Derived", 0, Some(base));
        env.register_method(base, "m", 7);
        let name = env.intern("m");
        assert_eq!(env.resolve_method(derived, name), Some(7));
        assert_eq!(env.resolve_method(base, name), Some(7));
        let other = env.intern("other");
        assert_eq!(env.resolve_method(derived, other), None);
    }

    #[test]
    fn test_interrupts() {
        let env = RuntimeEnv::new();
        assert!(!env.thread.has_scheduled_interrupts());
        env.thread.schedule_interrupt(InterruptReason::Safepoint);
        assert!(env.thread.has_scheduled_interrupts());
        let taken = env.thread.take_interrupts();
        assert_eq!(taken, vec![InterruptReason::Safepoint]);
        assert!(!env.thread.has_scheduled_interrupts());
    }

    #[test]
    fn test_field_guard_transitions() {
        let mut env = RuntimeEnv::new();
        let owner = env.register_class("Box", 1, None);
        let name = env.intern("value");
        let field_id = env.program.add_field(Field {
            name,
            owner,
            is_static: false,
            host_offset_or_field_id: 0,
            guarded_cid: CID_ILLEGAL,
            nullability_cid: CID_ILLEGAL,
            guarded_list_length: UNKNOWN_FIXED_LENGTH,
            exactness: EXACTNESS_NOT_TRACKING,
            is_unboxing_candidate: false,
            needs_load_guard: false,
            field_type: env.null_value(),
            type_test_cache: env.null_value(),
        });

        // First assignment always needs an update.
        let field = env.program.field(field_id).clone();
        assert!(env.field_needs_guard_update(&field, Value::smi(1)));
        env.update_field_guard(field_id, Value::smi(1));
        let field = env.program.field(field_id).clone();
        assert_eq!(field.guarded_cid, CID_SMI);
        assert!(!env.field_needs_guard_update(&field, Value::smi(2)));

        // Polymorphic store widens to any.
        let s = env.intern("x");
        assert!(env.field_needs_guard_update(&field, s));
        env.update_field_guard(field_id, s);
        let field = env.program.field(field_id).clone();
        assert_eq!(field.guarded_cid, GUARDED_CID_ANY);

        // Null needs nullability update once.
        let null = env.null_value();
        assert!(env.field_needs_guard_update(&field, null));
        env.update_field_guard(field_id, null);
        let field = env.program.field(field_id).clone();
        assert_eq!(field.nullability_cid, CID_NULL);
        assert!(!env.field_needs_guard_update(&field, null));
    }

    #[test]
    fn test_assignability_basics() {
        let mut env = RuntimeEnv::new();
        let base = env.register_class("Base", 0, None);
        let derived = env.register_class("Derived", 0, Some(base));
        let base_type = env.make_type(base as i64, env.null_value(), false);
        let nullable_base = env.make_type(base as i64, env.null_value(), true);

        let instance = env.allocate_any(derived, 1).unwrap().value();
        let null = env.null_value();
        let none = env.null_value();

        assert!(env.value_assignable_to(instance, base_type, none, none));
        assert!(!env.value_assignable_to(null, base_type, none, none));
        assert!(env.value_assignable_to(null, nullable_base, none, none));
        assert!(env.value_assignable_to(instance, env.wk.dynamic_type, none, none));

        let int_type = env.make_type(CID_SMI as i64, env.null_value(), false);
        assert!(env.value_assignable_to(Value::smi(3), int_type, none, none));
        let big = env.box_int(i64::MAX).unwrap();
        assert!(env.value_assignable_to(big, int_type, none, none));
        assert!(!env.value_assignable_to(instance, int_type, none, none));
    }

    #[test]
    fn test_dynamic_selector_demangling() {
        let mut env = RuntimeEnv::new();
        let mangled = env.intern("dyn:add");
        assert!(env.is_dynamic_selector(mangled));
        let plain = env.demangle_selector(mangled);
        assert!(plain.identical(env.intern("add")));
        assert!(!env.is_dynamic_selector(plain));
    }
}
