//! Object layouts and class-id assignments
//!
//! Heap objects are header-plus-slots; this module gives each built-in class
//! its id and a typed view over its payload. Slot 0 is always the first word
//! after the header.
//!
//! Metadata (functions, fields, classes, bytecodes) lives in Rust-side tables
//! (see [`crate::program`]); constant pools and frames reference it through
//! Smi-encoded handles.

use crate::gc::{ClassId, ObjRef};
use crate::value::Value;

// ===== Class ids =====

/// Sentinel for empty cache entries; never a real class.
pub const CID_ILLEGAL: ClassId = 0;
/// The null singleton.
pub const CID_NULL: ClassId = 1;
/// The true/false singletons.
pub const CID_BOOL: ClassId = 2;
/// Small immediate integers.
pub const CID_SMI: ClassId = 3;
/// Boxed 64-bit integers.
pub const CID_MINT: ClassId = 4;
/// Boxed 64-bit floats.
pub const CID_FLOAT: ClassId = 5;
/// Immutable strings.
pub const CID_STR: ClassId = 6;
/// Fixed-length arrays.
pub const CID_ARRAY: ClassId = 7;
/// Growable arrays (length + backing array).
pub const CID_GROWABLE_ARRAY: ClassId = 8;
/// Raw byte storage.
pub const CID_TYPED_DATA: ClassId = 9;
/// Views over typed data.
pub const CID_TYPED_DATA_VIEW: ClassId = 10;
/// Closure contexts.
pub const CID_CONTEXT: ClassId = 11;
/// Closures.
pub const CID_CLOSURE: ClassId = 12;
/// Type-argument vectors.
pub const CID_TYPE_ARGUMENTS: ClassId = 13;
/// Types.
pub const CID_TYPE: ClassId = 14;
/// Type parameters (uninstantiated type positions).
pub const CID_TYPE_PARAMETER: ClassId = 15;
/// Hash container base (fixed slots consumed by recognized natives).
pub const CID_HASH_BASE: ClassId = 16;
/// The uninitialized-field sentinel singleton.
pub const CID_SENTINEL: ClassId = 17;
/// Subtype-test caches.
pub const CID_SUBTYPE_TEST_CACHE: ClassId = 18;
/// Stack traces.
pub const CID_STACK_TRACE: ClassId = 19;
/// Language errors produced by the surrounding runtime.
pub const CID_LANGUAGE_ERROR: ClassId = 20;
/// Wrapper for exceptions that crossed an entry frame.
pub const CID_UNHANDLED_EXCEPTION: ClassId = 21;
/// Unwind requests from the surrounding runtime.
pub const CID_UNWIND_ERROR: ClassId = 22;
/// First id available for program-defined classes.
pub const CID_FIRST_USER: ClassId = 32;

/// Guard state for fields that have seen more than one class.
pub const GUARDED_CID_ANY: ClassId = u32::MAX;

/// Whether a class id names one of the VM error classes that must not be
/// caught by interpreter handlers.
#[inline]
pub fn is_error_cid(cid: ClassId) -> bool {
    (CID_LANGUAGE_ERROR..=CID_UNWIND_ERROR).contains(&cid)
}

/// Class id of any value.
#[inline]
pub fn class_id(v: Value) -> ClassId {
    if v.is_smi() {
        CID_SMI
    } else {
        ObjRef::from_value(v).class_id()
    }
}

const WORD_BYTES: usize = 8;

#[inline]
fn words_for_bytes(bytes: usize) -> usize {
    (bytes + WORD_BYTES - 1) / WORD_BYTES
}

// ===== Boxes =====

/// Boxed 64-bit integer: `[payload]`.
#[derive(Clone, Copy)]
pub struct Mint(pub ObjRef);

impl Mint {
    /// Object size in words.
    pub const SIZE_WORDS: usize = 2;

    /// Payload.
    #[inline]
    pub fn value(self) -> i64 {
        self.0.word(0) as i64
    }

    /// Set the payload.
    #[inline]
    pub fn set_value(self, v: i64) {
        self.0.set_word(0, v as u64)
    }
}

/// Boxed 64-bit float: `[bits]`.
#[derive(Clone, Copy)]
pub struct Float(pub ObjRef);

impl Float {
    /// Object size in words.
    pub const SIZE_WORDS: usize = 2;

    /// Payload.
    #[inline]
    pub fn value(self) -> f64 {
        f64::from_bits(self.0.word(0))
    }

    /// Set the payload.
    #[inline]
    pub fn set_value(self, v: f64) {
        self.0.set_word(0, v.to_bits())
    }
}

// ===== Strings =====

/// Immutable UTF-8 string: `[length, bytes...]`.
#[derive(Clone, Copy)]
pub struct Str(pub ObjRef);

impl Str {
    /// Object size in words for a string of `len` bytes.
    pub fn size_words(len: usize) -> usize {
        2 + words_for_bytes(len)
    }

    /// Byte length.
    #[inline]
    pub fn len(self) -> usize {
        self.0.slot(0).as_smi() as usize
    }

    /// Whether the string is empty.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// String contents.
    pub fn as_str(self) -> &'static str {
        // Contents are written once, from a valid &str, at allocation.
        unsafe { std::str::from_utf8_unchecked(self.0.bytes(1, self.len())) }
    }

    /// Initialize a freshly allocated string object.
    pub fn init(obj: ObjRef, s: &str) {
        obj.set_slot(0, Value::smi(s.len() as i64));
        obj.bytes_mut(1, s.len()).copy_from_slice(s.as_bytes());
    }
}

// ===== Arrays =====

/// Fixed-length array: `[type_args, length, elements...]`.
#[derive(Clone, Copy)]
pub struct Array(pub ObjRef);

impl Array {
    /// First element slot.
    pub const DATA_SLOT: usize = 2;
    /// Largest allocatable element count.
    pub const MAX_LENGTH: i64 = 1 << 20;

    /// Object size in words for `len` elements.
    pub fn size_words(len: usize) -> usize {
        3 + len
    }

    /// Type arguments.
    #[inline]
    pub fn type_args(self) -> Value {
        self.0.slot(0)
    }

    /// Element count.
    #[inline]
    pub fn len(self) -> usize {
        self.0.slot(1).as_smi() as usize
    }

    /// Whether the array has no elements.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Element `i`.
    #[inline]
    pub fn at(self, i: usize) -> Value {
        debug_assert!(i < self.len());
        self.0.slot(Self::DATA_SLOT + i)
    }

    /// Set element `i` without a write barrier (initializing stores).
    #[inline]
    pub fn set_at(self, i: usize, v: Value) {
        debug_assert!(i < self.len());
        self.0.set_slot(Self::DATA_SLOT + i, v)
    }

    /// Initialize a freshly allocated array.
    pub fn init(obj: ObjRef, type_args: Value, len: usize, fill: Value) {
        obj.set_slot(0, type_args);
        obj.set_slot(1, Value::smi(len as i64));
        for i in 0..len {
            obj.set_slot(Self::DATA_SLOT + i, fill);
        }
    }
}

/// Growable array: `[type_args, length, data]`.
#[derive(Clone, Copy)]
pub struct GrowableArray(pub ObjRef);

impl GrowableArray {
    /// Object size in words.
    pub const SIZE_WORDS: usize = 4;
    /// Slot holding the backing array.
    pub const DATA_SLOT: usize = 2;

    /// Live element count.
    #[inline]
    pub fn len(self) -> Value {
        self.0.slot(1)
    }

    /// Backing array.
    #[inline]
    pub fn data(self) -> Value {
        self.0.slot(Self::DATA_SLOT)
    }
}

/// Raw byte storage: `[length, elem_size, bytes...]`.
#[derive(Clone, Copy)]
pub struct TypedData(pub ObjRef);

impl TypedData {
    /// Object size in words for `len` elements of `elem_size` bytes.
    pub fn size_words(len: usize, elem_size: usize) -> usize {
        3 + words_for_bytes(len * elem_size)
    }

    /// Element count.
    #[inline]
    pub fn len(self) -> Value {
        self.0.slot(0)
    }

    /// Element width in bytes.
    #[inline]
    pub fn elem_size(self) -> usize {
        self.0.slot(1).as_smi() as usize
    }

    /// Initialize a freshly allocated typed-data object (zero-filled).
    pub fn init(obj: ObjRef, len: usize, elem_size: usize) {
        obj.set_slot(0, Value::smi(len as i64));
        obj.set_slot(1, Value::smi(elem_size as i64));
        obj.bytes_mut(2, len * elem_size).fill(0);
    }
}

/// View over typed data: `[backing, offset_in_bytes, length]`.
#[derive(Clone, Copy)]
pub struct TypedDataView(pub ObjRef);

impl TypedDataView {
    /// Object size in words.
    pub const SIZE_WORDS: usize = 4;

    /// Backing typed data.
    #[inline]
    pub fn backing(self) -> Value {
        self.0.slot(0)
    }

    /// Offset into the backing storage.
    #[inline]
    pub fn offset_in_bytes(self) -> Value {
        self.0.slot(1)
    }

    /// Element count.
    #[inline]
    pub fn len(self) -> Value {
        self.0.slot(2)
    }
}

// ===== Contexts & closures =====

/// Closure context: `[parent, length, variables...]`.
#[derive(Clone, Copy)]
pub struct Context(pub ObjRef);

impl Context {
    /// Parent slot index.
    pub const PARENT_SLOT: usize = 0;
    /// First variable slot.
    pub const VARS_SLOT: usize = 2;

    /// Object size in words for `n` variables.
    pub fn size_words(n: usize) -> usize {
        3 + n
    }

    /// Enclosing context.
    #[inline]
    pub fn parent(self) -> Value {
        self.0.slot(Self::PARENT_SLOT)
    }

    /// Variable count.
    #[inline]
    pub fn len(self) -> usize {
        self.0.slot(1).as_smi() as usize
    }

    /// Variable `i`.
    #[inline]
    pub fn var(self, i: usize) -> Value {
        debug_assert!(i < self.len());
        self.0.slot(Self::VARS_SLOT + i)
    }

    /// Initialize a freshly allocated context.
    pub fn init(obj: ObjRef, n: usize, null_value: Value) {
        obj.set_slot(Self::PARENT_SLOT, null_value);
        obj.set_slot(1, Value::smi(n as i64));
        for i in 0..n {
            obj.set_slot(Self::VARS_SLOT + i, null_value);
        }
    }
}

/// Closure: `[instantiator_ta, function_ta, delayed_ta, function, context]`.
#[derive(Clone, Copy)]
pub struct Closure(pub ObjRef);

impl Closure {
    /// Object size in words.
    pub const SIZE_WORDS: usize = 6;
    /// Instantiator type arguments slot.
    pub const INSTANTIATOR_TA_SLOT: usize = 0;
    /// Function type arguments slot.
    pub const FUNCTION_TA_SLOT: usize = 1;
    /// Delayed type arguments slot.
    pub const DELAYED_TA_SLOT: usize = 2;
    /// Function handle slot.
    pub const FUNCTION_SLOT: usize = 3;
    /// Context slot.
    pub const CONTEXT_SLOT: usize = 4;

    /// Instantiator type arguments.
    #[inline]
    pub fn instantiator_type_args(self) -> Value {
        self.0.slot(Self::INSTANTIATOR_TA_SLOT)
    }

    /// Function type arguments.
    #[inline]
    pub fn function_type_args(self) -> Value {
        self.0.slot(Self::FUNCTION_TA_SLOT)
    }

    /// Delayed type arguments.
    #[inline]
    pub fn delayed_type_args(self) -> Value {
        self.0.slot(Self::DELAYED_TA_SLOT)
    }

    /// Function handle (Smi-encoded function id).
    #[inline]
    pub fn function(self) -> Value {
        self.0.slot(Self::FUNCTION_SLOT)
    }

    /// Captured context.
    #[inline]
    pub fn context(self) -> Value {
        self.0.slot(Self::CONTEXT_SLOT)
    }
}

// ===== Types =====

/// Type-argument vector: `[instantiations, length, types...]`.
#[derive(Clone, Copy)]
pub struct TypeArguments(pub ObjRef);

impl TypeArguments {
    /// First type slot.
    pub const TYPES_SLOT: usize = 2;

    /// Object size in words for `n` types.
    pub fn size_words(n: usize) -> usize {
        3 + n
    }

    /// Instantiations cache (array of triples) or null.
    #[inline]
    pub fn instantiations(self) -> Value {
        self.0.slot(0)
    }

    /// Vector length.
    #[inline]
    pub fn len(self) -> usize {
        self.0.slot(1).as_smi() as usize
    }

    /// Type at `i`.
    #[inline]
    pub fn type_at(self, i: usize) -> Value {
        debug_assert!(i < self.len());
        self.0.slot(Self::TYPES_SLOT + i)
    }
}

/// Layout of one instantiations-cache triple.
pub mod instantiation {
    /// Instantiator type arguments key.
    pub const INSTANTIATOR: usize = 0;
    /// Function type arguments key.
    pub const FUNCTION: usize = 1;
    /// Cached result.
    pub const INSTANTIATED: usize = 2;
    /// Triple width.
    pub const SIZE: usize = 3;
    /// Terminator stored in the instantiator key slot.
    pub const NO_INSTANTIATOR: i64 = -1;
}

/// Nullability suffix of a type.
pub mod nullability {
    /// Non-nullable type.
    pub const NON_NULLABLE: i64 = 0;
    /// Nullable type.
    pub const NULLABLE: i64 = 1;
}

/// Type: `[class_id, type_args, nullability]`.
///
/// A class-id slot of [`Type::DYNAMIC_CLASS`] marks a top type.
#[derive(Clone, Copy)]
pub struct Type(pub ObjRef);

impl Type {
    /// Object size in words.
    pub const SIZE_WORDS: usize = 4;
    /// Class-id slot value marking `dynamic`.
    pub const DYNAMIC_CLASS: i64 = -1;

    /// Class id the type refers to, or [`Type::DYNAMIC_CLASS`].
    #[inline]
    pub fn type_class(self) -> i64 {
        self.0.slot(0).as_smi()
    }

    /// Type arguments (or null).
    #[inline]
    pub fn type_args(self) -> Value {
        self.0.slot(1)
    }

    /// Nullability (see [`nullability`]).
    #[inline]
    pub fn type_nullability(self) -> i64 {
        self.0.slot(2).as_smi()
    }

    /// Whether this is a top type that accepts every value.
    #[inline]
    pub fn is_top(self) -> bool {
        self.type_class() == Self::DYNAMIC_CLASS
    }
}

/// Type parameter: `[is_function_level, index]`.
#[derive(Clone, Copy)]
pub struct TypeParameter(pub ObjRef);

impl TypeParameter {
    /// Object size in words.
    pub const SIZE_WORDS: usize = 3;

    /// Whether the parameter binds at function level (else class level).
    #[inline]
    pub fn is_function_level(self) -> bool {
        self.0.slot(0).as_smi() != 0
    }

    /// Index into the corresponding type-argument vector.
    #[inline]
    pub fn index(self) -> usize {
        self.0.slot(1).as_smi() as usize
    }
}

// ===== Hash containers =====

/// Hash container base: `[index, hash_mask, data, used_data, deleted_keys]`.
///
/// The interpreter only moves these slots around for the recognized hash-base
/// natives; the hashing logic itself lives in the managed core library.
#[derive(Clone, Copy)]
pub struct HashBase(pub ObjRef);

impl HashBase {
    /// Object size in words.
    pub const SIZE_WORDS: usize = 6;
    /// Index slot.
    pub const INDEX_SLOT: usize = 0;
    /// Hash-mask slot.
    pub const HASH_MASK_SLOT: usize = 1;
    /// Data slot.
    pub const DATA_SLOT: usize = 2;
    /// Used-data slot.
    pub const USED_DATA_SLOT: usize = 3;
    /// Deleted-keys slot.
    pub const DELETED_KEYS_SLOT: usize = 4;
}

// ===== Caches & errors =====

/// Layout of one subtype-test cache entry (seven consecutive array slots).
pub mod stc {
    /// Receiver class id, or the closure's function handle.
    pub const INSTANCE_CID_OR_SIGNATURE: usize = 0;
    /// Instance type arguments.
    pub const INSTANCE_TYPE_ARGS: usize = 1;
    /// Instantiator type arguments.
    pub const INSTANTIATOR_TYPE_ARGS: usize = 2;
    /// Function type arguments.
    pub const FUNCTION_TYPE_ARGS: usize = 3;
    /// Closure parent-function type arguments.
    pub const PARENT_FUNCTION_TYPE_ARGS: usize = 4;
    /// Closure delayed type arguments.
    pub const DELAYED_FUNCTION_TYPE_ARGS: usize = 5;
    /// Cached outcome (true/false value).
    pub const RESULT: usize = 6;
    /// Entry width.
    pub const ENTRY_LENGTH: usize = 7;
    /// Entries in a freshly allocated cache.
    pub const INITIAL_ENTRIES: usize = 4;
}

/// Subtype-test cache: `[backing_array]`.
///
/// The backing array holds [`stc::ENTRY_LENGTH`]-wide entries and is
/// terminated by a null in the first key slot of the next entry.
#[derive(Clone, Copy)]
pub struct SubtypeTestCache(pub ObjRef);

impl SubtypeTestCache {
    /// Object size in words.
    pub const SIZE_WORDS: usize = 2;

    /// Backing entry array.
    #[inline]
    pub fn entries(self) -> Value {
        self.0.slot(0)
    }
}

/// Stack trace: `[frame_functions]` (array of function handles).
#[derive(Clone, Copy)]
pub struct StackTrace(pub ObjRef);

impl StackTrace {
    /// Object size in words.
    pub const SIZE_WORDS: usize = 2;

    /// Function handles from the throw point outward.
    #[inline]
    pub fn frames(self) -> Value {
        self.0.slot(0)
    }
}

/// Unhandled-exception wrapper: `[exception, stacktrace]`.
#[derive(Clone, Copy)]
pub struct UnhandledException(pub ObjRef);

impl UnhandledException {
    /// Object size in words.
    pub const SIZE_WORDS: usize = 3;

    /// The wrapped exception.
    #[inline]
    pub fn exception(self) -> Value {
        self.0.slot(0)
    }

    /// The wrapped stack trace.
    #[inline]
    pub fn stacktrace(self) -> Value {
        self.0.slot(1)
    }
}

// ===== Arguments descriptor =====

/// Semantic accessor over a heap-allocated arguments descriptor.
///
/// The descriptor is an array with slots
/// `[type_args_len, count, positional_count, (name_0, position_0), ...]`
/// where `count` covers positional plus named arguments (the receiver
/// included, type arguments excluded).
#[derive(Clone, Copy)]
pub struct ArgsDescriptor(pub Array);

impl ArgsDescriptor {
    const TYPE_ARGS_LEN: usize = 0;
    const COUNT: usize = 1;
    const POSITIONAL_COUNT: usize = 2;
    const FIRST_NAMED: usize = 3;

    /// View a descriptor value.
    #[inline]
    pub fn from_value(v: Value) -> ArgsDescriptor {
        ArgsDescriptor(Array(ObjRef::from_value(v)))
    }

    /// Array element count needed for `named` named arguments.
    pub fn array_len(named: usize) -> usize {
        Self::FIRST_NAMED + 2 * named
    }

    /// Length of the call's type-argument vector (0 for none).
    #[inline]
    pub fn type_args_len(self) -> i64 {
        self.0.at(Self::TYPE_ARGS_LEN).as_smi()
    }

    /// Total argument count (positional + named, receiver included).
    #[inline]
    pub fn count(self) -> i64 {
        self.0.at(Self::COUNT).as_smi()
    }

    /// Positional argument count.
    #[inline]
    pub fn positional_count(self) -> i64 {
        self.0.at(Self::POSITIONAL_COUNT).as_smi()
    }

    /// Named argument count.
    #[inline]
    pub fn named_count(self) -> i64 {
        self.count() - self.positional_count()
    }

    /// Name of named argument `i`.
    #[inline]
    pub fn name_at(self, i: usize) -> Value {
        self.0.at(Self::FIRST_NAMED + 2 * i)
    }

    /// Argument position of named argument `i`.
    #[inline]
    pub fn position_at(self, i: usize) -> i64 {
        self.0.at(Self::FIRST_NAMED + 2 * i + 1).as_smi()
    }

    /// Arguments on the stack, including the receiver/type-args prefix.
    #[inline]
    pub fn count_with_type_args(self) -> i64 {
        self.count() + if self.type_args_len() > 0 { 1 } else { 0 }
    }

    /// Index of the receiver within the argument block.
    #[inline]
    pub fn receiver_index(self) -> usize {
        if self.type_args_len() > 0 {
            1
        } else {
            0
        }
    }

    /// Fill a freshly allocated descriptor array.
    pub fn init(
        array: Array,
        type_args_len: i64,
        positional_count: i64,
        named: &[(Value, i64)],
    ) {
        array.set_at(Self::TYPE_ARGS_LEN, Value::smi(type_args_len));
        array.set_at(Self::COUNT, Value::smi(positional_count + named.len() as i64));
        array.set_at(Self::POSITIONAL_COUNT, Value::smi(positional_count));
        for (i, (name, position)) in named.iter().enumerate() {
            array.set_at(Self::FIRST_NAMED + 2 * i, *name);
            array.set_at(Self::FIRST_NAMED + 2 * i + 1, Value::smi(*position));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Heap;

    #[test]
    fn test_class_id_of_smi() {
        assert_eq!(class_id(Value::smi(17)), CID_SMI);
    }

    #[test]
    fn test_mint_payload() {
        let mut heap = Heap::default();
        let obj = heap.try_allocate(CID_MINT, Mint::SIZE_WORDS).unwrap();
        let mint = Mint(obj);
        mint.set_value(i64::MIN);
        assert_eq!(mint.value(), i64::MIN);
        assert_eq!(class_id(obj.value()), CID_MINT);
    }

    #[test]
    fn test_float_bit_identity() {
        let mut heap = Heap::default();
        let obj = heap.try_allocate(CID_FLOAT, Float::SIZE_WORDS).unwrap();
        let f = Float(obj);
        for v in [0.0f64, -0.0, 1.5, f64::NAN, f64::INFINITY] {
            f.set_value(v);
            assert_eq!(f.value().to_bits(), v.to_bits());
        }
    }

    #[test]
    fn test_str_layout() {
        let mut heap = Heap::default();
        let obj = heap
            .try_allocate(CID_STR, Str::size_words("length".len()))
            .unwrap();
        Str::init(obj, "length");
        let s = Str(obj);
        assert_eq!(s.len(), 6);
        assert_eq!(s.as_str(), "length");
        assert!(!s.is_empty());
    }

    #[test]
    fn test_args_descriptor_accessors() {
        let mut heap = Heap::default();
        let name_obj = heap.try_allocate(CID_STR, Str::size_words(1)).unwrap();
        Str::init(name_obj, "x");

        let len = ArgsDescriptor::array_len(1);
        let arr_obj = heap.try_allocate(CID_ARRAY, Array::size_words(len)).unwrap();
        Array::init(arr_obj, Value::smi(0), len, Value::smi(0));
        ArgsDescriptor::init(Array(arr_obj), 0, 1, &[(name_obj.value(), 1)]);

        let desc = ArgsDescriptor::from_value(arr_obj.value());
        assert_eq!(desc.type_args_len(), 0);
        assert_eq!(desc.count(), 2);
        assert_eq!(desc.positional_count(), 1);
        assert_eq!(desc.named_count(), 1);
        assert!(desc.name_at(0).identical(name_obj.value()));
        assert_eq!(desc.position_at(0), 1);
        assert_eq!(desc.receiver_index(), 0);
        assert_eq!(desc.count_with_type_args(), 2);
    }
}
