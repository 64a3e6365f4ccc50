//! Loaded-program metadata tables
//!
//! The bytecode loader and class finalizer live outside this crate; what the
//! interpreter consumes are the finalized tables below. Constant pools and
//! frame slots refer to entries by Smi-encoded ids.

use std::sync::Arc;

use kona_bytecode::{BytecodeWriter, Opcode};

use crate::gc::ClassId;
use crate::object::{self, CID_FIRST_USER, CID_ILLEGAL};
use crate::value::Value;

/// Function table index.
pub type FunctionId = u32;
/// Field table index.
pub type FieldId = u32;
/// Bytecode table index.
pub type BytecodeId = u32;

/// Entry point of externally compiled code.
///
/// The invocation-stub ABI: `(environment, arguments descriptor, heap array
/// of arguments) -> tagged result`. An error-class result (class id in the
/// error range) propagates instead of returning normally.
pub type CompiledEntry =
    fn(&mut crate::runtime::RuntimeEnv, argdesc: Value, args: Value) -> Value;

/// What a function is, beyond its signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Ordinary function with explicit bytecode or compiled code.
    Regular,
    /// Synthetic body: load one instance field.
    ImplicitGetter,
    /// Synthetic body: store one instance field.
    ImplicitSetter,
    /// Synthetic body: load one static field.
    ImplicitStaticGetter,
    /// Synthetic body: allocate a closure binding the receiver.
    MethodExtractor,
    /// Synthetic body: call through a field (or a `call`-named closure).
    InvokeFieldDispatcher,
    /// Synthetic body: check dynamic arguments, then tail-call the target.
    DynamicInvocationForwarder,
    /// Tear-off body; parent carries the real code.
    ImplicitClosure,
    /// Synthetic body: route straight to noSuchMethod.
    NoSuchMethodDispatcher,
}

/// Per-kind payload of [`Function::data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionData {
    /// No payload.
    None,
    /// Field consumed by implicit getters/setters.
    Field(FieldId),
    /// Target of extractors and forwarders.
    Target(FunctionId),
}

/// Function metadata.
#[derive(Debug, Clone)]
pub struct Function {
    /// Function name (interned string value).
    pub name: Value,
    /// Kind; everything except `Regular` gets a synthetic body.
    pub kind: FunctionKind,
    /// Whether the function is static.
    pub is_static: bool,
    /// Fixed parameter count (receiver included for instance methods).
    pub num_fixed_params: u32,
    /// Optional positional parameter count.
    pub num_opt_positional_params: u32,
    /// Optional named parameter count.
    pub num_opt_named_params: u32,
    /// Declared type parameter count.
    pub num_type_params: u32,
    /// Bytecode, if any.
    pub bytecode: Option<BytecodeId>,
    /// Externally compiled entry point, if any.
    pub code: Option<CompiledEntry>,
    /// Enclosing function for closures and forwarders.
    pub parent: Option<FunctionId>,
    /// Kind-dependent payload.
    pub data: FunctionData,
}

impl Function {
    /// Whether compiled code exists for this function.
    #[inline]
    pub fn has_code(&self) -> bool {
        self.code.is_some()
    }

    /// Whether bytecode exists for this function.
    #[inline]
    pub fn has_bytecode(&self) -> bool {
        self.bytecode.is_some()
    }
}

/// One exception-table entry of a bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// First covered instruction offset.
    pub start: u32,
    /// One past the last covered instruction offset.
    pub end: u32,
    /// Handler entry offset.
    pub handler_pc: u32,
    /// Live frame size at the handler (SP is reset to it on entry).
    pub frame_size: u32,
}

impl ExceptionHandler {
    /// Whether this entry covers `pc`.
    #[inline]
    pub fn covers(&self, pc: u32) -> bool {
        self.start <= pc && pc < self.end
    }
}

/// Bytecode object: instructions, constant pool, exception table.
#[derive(Debug, Clone)]
pub struct Bytecode {
    /// Encoded instruction stream.
    pub instructions: Arc<[u8]>,
    /// Constant pool (tagged values; metadata handles are Smis).
    pub pool: Arc<[Value]>,
    /// Exception table, innermost entries first.
    pub handlers: Arc<[ExceptionHandler]>,
}

/// Guarded-list-length state: no length guard possible.
pub const NO_FIXED_LENGTH: i64 = -2;
/// Guarded-list-length state: not yet observed.
pub const UNKNOWN_FIXED_LENGTH: i64 = -1;

/// Static-type-exactness state: not tracked for this field.
pub const EXACTNESS_NOT_TRACKING: i8 = -1;
/// Static-type-exactness state: tracked but not yet initialized.
pub const EXACTNESS_UNINITIALIZED: i8 = -2;

/// Field metadata.
#[derive(Debug, Clone)]
pub struct Field {
    /// Field name (interned string value).
    pub name: Value,
    /// Owning class.
    pub owner: ClassId,
    /// Whether this is a static field.
    pub is_static: bool,
    /// Instance slot offset in words, or static-field table id.
    pub host_offset_or_field_id: u32,
    /// Only ever stored class (CID_ILLEGAL before first store,
    /// [`crate::object::GUARDED_CID_ANY`] once polymorphic).
    pub guarded_cid: ClassId,
    /// CID_NULL once a null has been stored, CID_ILLEGAL otherwise.
    pub nullability_cid: ClassId,
    /// Guarded list length, or one of the `*_FIXED_LENGTH` states.
    pub guarded_list_length: i64,
    /// Static-type-exactness state.
    pub exactness: i8,
    /// Whether the field may be stored in unboxed form.
    pub is_unboxing_candidate: bool,
    /// Whether loads must re-check assignability.
    pub needs_load_guard: bool,
    /// Declared type (Type value, or null for dynamic).
    pub field_type: Value,
    /// Subtype-test cache used by load/store guards (or null).
    pub type_test_cache: Value,
}

/// Class metadata.
#[derive(Debug, Clone)]
pub struct Class {
    /// Class name (interned string value).
    pub name: Value,
    /// Superclass, if any.
    pub super_class: Option<ClassId>,
    /// Instance size in words, header included.
    pub instance_size_words: u32,
    /// Declared type-argument count (-1 while unfinalized).
    pub num_type_arguments: i32,
    /// Slot offset of the type-arguments field in words (-1 for none).
    pub type_args_field_offset_words: i32,
    /// Whether instances may be allocated on the fast path.
    pub allocate_finalized: bool,
}

impl Class {
    /// A finalized, monomorphic class with `fields` value slots.
    pub fn plain(name: Value, fields: u32) -> Class {
        Class {
            name,
            super_class: None,
            instance_size_words: 1 + fields,
            num_type_arguments: 0,
            type_args_field_offset_words: -1,
            allocate_finalized: true,
        }
    }
}

/// The finalized metadata tables of a loaded program.
pub struct Program {
    classes: Vec<Class>,
    functions: Vec<Function>,
    fields: Vec<Field>,
    bytecodes: Vec<Bytecode>,
    statics: Vec<Value>,
    synthetic: [Option<BytecodeId>; 8],
}

impl Program {
    /// Create empty tables with entries for the built-in cids, so the
    /// `allocate_object` helper knows their instance sizes.
    pub fn new() -> Program {
        let placeholder = Class {
            name: Value::smi(0),
            super_class: None,
            instance_size_words: 1,
            num_type_arguments: 0,
            type_args_field_offset_words: -1,
            allocate_finalized: false,
        };
        let mut classes = vec![placeholder; CID_FIRST_USER as usize];
        for (cid, size) in [
            (object::CID_BOOL, 2u32),
            (object::CID_MINT, object::Mint::SIZE_WORDS as u32),
            (object::CID_FLOAT, object::Float::SIZE_WORDS as u32),
            (object::CID_GROWABLE_ARRAY, object::GrowableArray::SIZE_WORDS as u32),
            (object::CID_TYPED_DATA_VIEW, object::TypedDataView::SIZE_WORDS as u32),
            (object::CID_CLOSURE, object::Closure::SIZE_WORDS as u32),
            (object::CID_TYPE, object::Type::SIZE_WORDS as u32),
            (object::CID_TYPE_PARAMETER, object::TypeParameter::SIZE_WORDS as u32),
            (object::CID_HASH_BASE, object::HashBase::SIZE_WORDS as u32),
            (
                object::CID_SUBTYPE_TEST_CACHE,
                object::SubtypeTestCache::SIZE_WORDS as u32,
            ),
            (object::CID_STACK_TRACE, object::StackTrace::SIZE_WORDS as u32),
            (
                object::CID_UNHANDLED_EXCEPTION,
                object::UnhandledException::SIZE_WORDS as u32,
            ),
        ] {
            classes[cid as usize].instance_size_words = size;
        }
        Program {
            classes,
            functions: Vec::new(),
            fields: Vec::new(),
            bytecodes: Vec::new(),
            statics: Vec::new(),
            synthetic: [None; 8],
        }
    }

    // ===== Classes =====

    /// Register a program-defined class and return its id.
    pub fn add_class(&mut self, class: Class) -> ClassId {
        let cid = self.classes.len() as ClassId;
        self.classes.push(class);
        cid
    }

    /// Class by id.
    pub fn class(&self, cid: ClassId) -> &Class {
        &self.classes[cid as usize]
    }

    /// Mutable class by id.
    pub fn class_mut(&mut self, cid: ClassId) -> &mut Class {
        &mut self.classes[cid as usize]
    }

    /// Whether `cid` names a registered class.
    pub fn has_class(&self, cid: ClassId) -> bool {
        cid != CID_ILLEGAL && (cid as usize) < self.classes.len()
    }

    // ===== Functions =====

    /// Register a function. Synthetic kinds without bytecode get their
    /// one-instruction internal body here.
    pub fn add_function(&mut self, mut function: Function) -> FunctionId {
        if function.bytecode.is_none() && function.code.is_none() {
            if let Some(op) = synthetic_opcode(function.kind) {
                function.bytecode = Some(self.synthetic_body(op));
            }
        }
        let id = self.functions.len() as FunctionId;
        self.functions.push(function);
        id
    }

    /// Function by id.
    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id as usize]
    }

    /// Mutable function by id.
    pub fn function_mut(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[id as usize]
    }

    // ===== Fields =====

    /// Register a field.
    pub fn add_field(&mut self, field: Field) -> FieldId {
        let id = self.fields.len() as FieldId;
        self.fields.push(field);
        id
    }

    /// Field by id.
    pub fn field(&self, id: FieldId) -> &Field {
        &self.fields[id as usize]
    }

    /// Mutable field by id.
    pub fn field_mut(&mut self, id: FieldId) -> &mut Field {
        &mut self.fields[id as usize]
    }

    // ===== Bytecodes =====

    /// Register a bytecode object.
    pub fn add_bytecode(
        &mut self,
        instructions: Vec<u8>,
        pool: Vec<Value>,
        handlers: Vec<ExceptionHandler>,
    ) -> BytecodeId {
        let id = self.bytecodes.len() as BytecodeId;
        self.bytecodes.push(Bytecode {
            instructions: instructions.into(),
            pool: pool.into(),
            handlers: handlers.into(),
        });
        id
    }

    /// Bytecode by id.
    pub fn bytecode(&self, id: BytecodeId) -> &Bytecode {
        &self.bytecodes[id as usize]
    }

    // ===== Statics =====

    /// Register a static-field cell with an initial value and return its id.
    pub fn add_static(&mut self, initial: Value) -> u32 {
        let id = self.statics.len() as u32;
        self.statics.push(initial);
        id
    }

    /// Static cell value.
    pub fn static_value(&self, id: u32) -> Value {
        self.statics[id as usize]
    }

    /// Write a static cell.
    pub fn set_static_value(&mut self, id: u32, v: Value) {
        self.statics[id as usize] = v;
    }

    // ===== Synthetic bodies =====

    /// One-instruction internal body for a synthetic function kind.
    ///
    /// `op` must be one of the `Intrinsic*` opcodes; bodies are shared per
    /// opcode.
    pub fn synthetic_body(&mut self, op: Opcode) -> BytecodeId {
        let index = op as usize - Opcode::IntrinsicImplicitGetter as usize;
        if let Some(id) = self.synthetic[index] {
            return id;
        }
        let mut w = BytecodeWriter::new();
        w.emit_0(op);
        w.emit_0(Opcode::ReturnTOS);
        let id = self.add_bytecode(w.into_bytes(), Vec::new(), Vec::new());
        self.synthetic[index] = Some(id);
        id
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

fn synthetic_opcode(kind: FunctionKind) -> Option<Opcode> {
    match kind {
        FunctionKind::Regular | FunctionKind::ImplicitClosure => None,
        FunctionKind::ImplicitGetter => Some(Opcode::IntrinsicImplicitGetter),
        FunctionKind::ImplicitSetter => Some(Opcode::IntrinsicImplicitSetter),
        FunctionKind::ImplicitStaticGetter => Some(Opcode::IntrinsicImplicitStaticGetter),
        FunctionKind::MethodExtractor => Some(Opcode::IntrinsicMethodExtractor),
        FunctionKind::InvokeFieldDispatcher => Some(Opcode::IntrinsicInvokeField),
        FunctionKind::DynamicInvocationForwarder => {
            Some(Opcode::IntrinsicForwardDynamicInvocation)
        }
        FunctionKind::NoSuchMethodDispatcher => Some(Opcode::IntrinsicNoSuchMethodDispatcher),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_function(kind: FunctionKind) -> Function {
        Function {
            name: Value::smi(0),
            kind,
            is_static: false,
            num_fixed_params: 1,
            num_opt_positional_params: 0,
            num_opt_named_params: 0,
            num_type_params: 0,
            bytecode: None,
            code: None,
            parent: None,
            data: FunctionData::None,
        }
    }

    #[test]
    fn test_synthetic_body_assignment() {
        let mut program = Program::new();
        let getter = program.add_function(stub_function(FunctionKind::ImplicitGetter));
        let f = program.function(getter);
        assert!(f.has_bytecode());
        let bc = program.bytecode(f.bytecode.unwrap());
        assert_eq!(bc.instructions[0], Opcode::IntrinsicImplicitGetter as u8);
        assert_eq!(bc.instructions[1], Opcode::ReturnTOS as u8);

        // Same kind shares the body.
        let getter2 = program.add_function(stub_function(FunctionKind::ImplicitGetter));
        assert_eq!(
            program.function(getter).bytecode,
            program.function(getter2).bytecode
        );
    }

    #[test]
    fn test_regular_function_keeps_no_body() {
        let mut program = Program::new();
        let f = program.add_function(stub_function(FunctionKind::Regular));
        assert!(!program.function(f).has_bytecode());
        assert!(!program.function(f).has_code());
    }

    #[test]
    fn test_handler_covers() {
        let h = ExceptionHandler {
            start: 4,
            end: 10,
            handler_pc: 20,
            frame_size: 3,
        };
        assert!(!h.covers(3));
        assert!(h.covers(4));
        assert!(h.covers(9));
        assert!(!h.covers(10));
    }

    #[test]
    fn test_statics() {
        let mut program = Program::new();
        let id = program.add_static(Value::smi(0));
        assert_eq!(program.static_value(id).as_smi(), 0);
        program.set_static_value(id, Value::smi(9));
        assert_eq!(program.static_value(id).as_smi(), 9);
    }
}
