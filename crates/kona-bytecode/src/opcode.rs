//! KBC opcodes for the Kona VM
//!
//! This module defines the complete instruction set executed by the
//! interpreter core. Opcode values occupy the low seven bits of the first
//! instruction byte; bit 7 selects the wide encoding of the instruction's
//! 32-bit operands.

/// Bit 7 of the opcode byte selects the wide operand encoding.
pub const WIDE_BIT: u8 = 0x80;

/// Operand format of an instruction.
///
/// The letters name the operand slots of the KBC encoding: `A`, `B`, `C`
/// and `F` are unsigned byte operands, `D` and `E` are unsigned 32-bit
/// operands (one byte in the narrow form), `X` and `Y` are signed 32-bit
/// operands, and `T` is a signed jump offset relative to the start of the
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// No operands.
    Op0,
    /// Single unsigned byte operand.
    OpA,
    /// Single unsigned operand (constant pool index, count, ...).
    OpD,
    /// Single signed operand.
    OpX,
    /// Signed jump offset.
    OpT,
    /// Unsigned byte + unsigned operand.
    OpAE,
    /// Unsigned byte + signed operand.
    OpAY,
    /// Unsigned operand + unsigned byte.
    OpDF,
    /// Three unsigned byte operands.
    OpABC,
}

impl Format {
    /// Whether this format has a wide encoding.
    pub fn has_wide_form(self) -> bool {
        matches!(
            self,
            Format::OpD | Format::OpX | Format::OpT | Format::OpAE | Format::OpAY | Format::OpDF
        )
    }

    /// Encoded instruction width in bytes for the narrow form.
    pub fn narrow_width(self) -> usize {
        match self {
            Format::Op0 => 1,
            Format::OpA | Format::OpD | Format::OpX | Format::OpT => 2,
            Format::OpAE | Format::OpAY | Format::OpDF => 3,
            Format::OpABC => 4,
        }
    }

    /// Encoded instruction width in bytes for the wide form.
    ///
    /// Formats without a wide form report their narrow width.
    pub fn wide_width(self) -> usize {
        match self {
            Format::Op0 => 1,
            Format::OpA => 2,
            Format::OpD | Format::OpX | Format::OpT => 5,
            Format::OpAE | Format::OpAY | Format::OpDF => 6,
            Format::OpABC => 4,
        }
    }
}

/// KBC opcode enumeration.
///
/// Grouped by function:
/// - 0x00-0x07: prologue and frame setup
/// - 0x08-0x14: constants, stack and local moves
/// - 0x15-0x1D: calls and return
/// - 0x1E-0x28: jumps
/// - 0x29-0x31: field, context and indexed access
/// - 0x32-0x37: allocation
/// - 0x38-0x3E: type checks and throw
/// - 0x3F-0x4D: integer arithmetic and comparison
/// - 0x4E-0x57: double arithmetic and comparison
/// - 0x58-0x5F: interpreter-internal synthetic bodies
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Prologue & frame setup (0x00-0x07) =====
    /// Invalid instruction; executing it is a fatal error.
    Trap = 0x00,
    /// Set up a frame with D locals initialized to null.
    Entry = 0x01,
    /// Validate that exactly A positional arguments were passed, then set up
    /// a frame with E locals initialized to null.
    EntryFixed = 0x02,
    /// Bind fixed (A), optional positional (B) and optional named (C)
    /// parameters from the arguments descriptor, consuming the default-value
    /// `LoadConstant` instructions that follow.
    EntryOptional = 0x03,
    /// Extend the current frame by D null-initialized slots.
    Frame = 0x04,
    /// Reset SP so that the frame holds exactly A live slots.
    SetFrame = 0x05,
    /// Call the stack-overflow helper if SP crossed the overflow limit or the
    /// thread has scheduled interrupts.
    CheckStack = 0x06,
    /// Validate the passed function-type-argument vector against the declared
    /// count A and capture it in local E.
    CheckFunctionTypeArgs = 0x07,

    // ===== Constants, stack & locals (0x08-0x14) =====
    /// FP[A] = constant pool entry E. Also encodes parameter defaults after
    /// `EntryOptional`.
    LoadConstant = 0x08,
    /// Push constant pool entry D.
    PushConstant = 0x09,
    /// Push null.
    PushNull = 0x0A,
    /// Push true.
    PushTrue = 0x0B,
    /// Push false.
    PushFalse = 0x0C,
    /// Push the small integer X.
    PushInt = 0x0D,
    /// Push FP[X] (arguments live at negative X).
    Push = 0x0E,
    /// FP[X] = TOS without popping.
    StoreLocal = 0x0F,
    /// FP[X] = pop().
    PopLocal = 0x10,
    /// Drop the top stack value.
    Drop1 = 0x11,
    /// FP[Y] = special slot A (exception or stack trace).
    MoveSpecial = 0x12,
    /// TOS = !TOS for booleans.
    BooleanNegateTOS = 0x13,
    /// Push the uninitialized-field sentinel.
    PushUninitializedSentinel = 0x14,

    // ===== Calls & return (0x15-0x1D) =====
    /// Call the function at pool entry D with F arguments; the arguments
    /// descriptor is at pool entry D+1.
    DirectCall = 0x15,
    /// `DirectCall` without entry-side argument type checks.
    UncheckedDirectCall = 0x16,
    /// Instance call through the lookup cache; pool entry D names the
    /// interface target (selector source), D+1 the arguments descriptor.
    InterfaceCall = 0x17,
    /// `InterfaceCall` without entry-side argument type checks.
    UncheckedInterfaceCall = 0x18,
    /// `InterfaceCall` against an instantiated interface target.
    InstantiatedInterfaceCall = 0x19,
    /// Call the closure on top of the stack; pool entry D holds the arguments
    /// descriptor.
    UncheckedClosureCall = 0x1A,
    /// Dynamic call: pool entry D holds the (possibly mangled) selector, D+1
    /// the arguments descriptor.
    DynamicCall = 0x1B,
    /// Invoke the native method described by pool entry D.
    NativeCall = 0x1C,
    /// Return the top of stack to the caller.
    ReturnTOS = 0x1D,

    // ===== Jumps (0x1E-0x28) =====
    /// Unconditional jump by T.
    Jump = 0x1E,
    /// Jump by T when assertions are disabled.
    JumpIfNoAsserts = 0x1F,
    /// Jump by T when the call's type-argument count is non-zero.
    JumpIfNotZeroTypeArgs = 0x20,
    /// Pop two values, jump by T if identical.
    JumpIfEqStrict = 0x21,
    /// Pop two values, jump by T if not identical.
    JumpIfNeStrict = 0x22,
    /// Pop a value, jump by T if it is true.
    JumpIfTrue = 0x23,
    /// Pop a value, jump by T if it is false.
    JumpIfFalse = 0x24,
    /// Pop a value, jump by T if it is null.
    JumpIfNull = 0x25,
    /// Pop a value, jump by T if it is not null.
    JumpIfNotNull = 0x26,
    /// No-op in the interpreter (taken only by compiled code that proved its
    /// arguments checked).
    JumpIfUnchecked = 0x27,
    /// Pop a value, jump by T if it is not the uninitialized sentinel.
    JumpIfInitialized = 0x28,

    // ===== Field, context & indexed access (0x29-0x31) =====
    /// TOS = TOS.field; pool entry D holds the offset in words, D+1 the field
    /// handle.
    LoadFieldTOS = 0x29,
    /// Store TOS into SP[-1].field with guard and unboxing handling; pool
    /// entry D holds the offset in words, D+1 the field handle.
    StoreFieldTOS = 0x2A,
    /// Store the uninitialized sentinel into TOS.field; pool layout as for
    /// `StoreFieldTOS`.
    InitLateField = 0x2B,
    /// TOS = type arguments of TOS, read at the offset in pool entry D.
    LoadTypeArgumentsField = 0x2C,
    /// TOS = parent of the context at TOS.
    LoadContextParent = 0x2D,
    /// Store TOS into the parent slot of the context at SP[-1].
    StoreContextParent = 0x2E,
    /// TOS = context variable E of the context at TOS.
    LoadContextVar = 0x2F,
    /// Store TOS into variable E of the context at SP[-1].
    StoreContextVar = 0x30,
    /// array[index] = value with bounds check and write barrier
    /// (stack: array, index, value).
    StoreIndexedTOS = 0x31,

    // ===== Allocation (0x32-0x37) =====
    /// Push a new context with E variables.
    AllocateContext = 0x32,
    /// Replace the context at TOS with a shallow copy (E variables).
    CloneContext = 0x33,
    /// Push a new instance of the class at pool entry D.
    Allocate = 0x34,
    /// Pop type arguments and class, push a new parameterized instance.
    AllocateT = 0x35,
    /// Pop length and type arguments, push a new array.
    CreateArrayTOS = 0x36,
    /// Push a new closure with all fields null.
    AllocateClosure = 0x37,

    // ===== Type checks & throw (0x38-0x3E) =====
    /// TOS = pool type D instantiated with the two type-argument vectors on
    /// the stack.
    InstantiateType = 0x38,
    /// Instantiate the type-argument vector at pool entry E, consulting its
    /// instantiations cache (A=0 skips the all-dynamic shortcut).
    InstantiateTypeArgumentsTOS = 0x39,
    /// Assert that a stack-held instance is assignable to a type, consulting
    /// the subtype-test cache at pool entry E (A=1 admits Smi receivers).
    AssertAssignable = 0x3A,
    /// Assert a subtype relation between two stack-held types.
    AssertSubtype = 0x3B,
    /// Assert that TOS is a boolean (A selects the strict variant).
    AssertBoolean = 0x3C,
    /// Throw NullError with the selector at pool entry D if TOS is null,
    /// else pop.
    NullCheck = 0x3D,
    /// Throw TOS (A=0) or rethrow exception+trace at SP[-1]/SP[0] (A=1).
    Throw = 0x3E,

    // ===== Integer arithmetic & comparison (0x3F-0x4D) =====
    /// Wrap-around 64-bit addition.
    AddInt = 0x3F,
    /// Wrap-around 64-bit subtraction.
    SubInt = 0x40,
    /// Wrap-around 64-bit multiplication.
    MulInt = 0x41,
    /// Truncating division; throws on zero divisor, MIN/-1 yields MIN.
    TruncDivInt = 0x42,
    /// Euclidean modulo; throws on zero divisor, remainder never negative.
    ModInt = 0x43,
    /// Bitwise and.
    BitAndInt = 0x44,
    /// Bitwise or.
    BitOrInt = 0x45,
    /// Bitwise xor.
    BitXorInt = 0x46,
    /// Truncating left shift; negative shift throws ArgumentError.
    ShlInt = 0x47,
    /// Arithmetic right shift clamped at 63; negative shift throws
    /// ArgumentError.
    ShrInt = 0x48,
    /// Integer equality.
    CompareIntEq = 0x49,
    /// Integer greater-than.
    CompareIntGt = 0x4A,
    /// Integer less-than.
    CompareIntLt = 0x4B,
    /// Integer greater-or-equal.
    CompareIntGe = 0x4C,
    /// Integer less-or-equal.
    CompareIntLe = 0x4D,

    // ===== Double arithmetic & comparison (0x4E-0x57) =====
    /// IEEE-754 negation.
    NegateDouble = 0x4E,
    /// IEEE-754 addition.
    AddDouble = 0x4F,
    /// IEEE-754 subtraction.
    SubDouble = 0x50,
    /// IEEE-754 multiplication.
    MulDouble = 0x51,
    /// IEEE-754 division.
    DivDouble = 0x52,
    /// Double equality.
    CompareDoubleEq = 0x53,
    /// Double greater-than.
    CompareDoubleGt = 0x54,
    /// Double less-than.
    CompareDoubleLt = 0x55,
    /// Double greater-or-equal.
    CompareDoubleGe = 0x56,
    /// Double less-or-equal.
    CompareDoubleLe = 0x57,

    // ===== Interpreter-internal synthetic bodies (0x58-0x5F) =====
    //
    // Functions without explicit bytecode are given a one-instruction body
    // selecting the matching handler, followed by ReturnTOS where the body
    // produces a value.
    /// Load one instance field.
    IntrinsicImplicitGetter = 0x58,
    /// Store one instance field.
    IntrinsicImplicitSetter = 0x59,
    /// Load one static field, running its initializer if needed.
    IntrinsicImplicitStaticGetter = 0x5A,
    /// Allocate a closure binding the receiver to a target method.
    IntrinsicMethodExtractor = 0x5B,
    /// Tail-call the closure held by the receiver.
    IntrinsicInvokeClosure = 0x5C,
    /// Load a field from the receiver and call it (or its `call` method).
    IntrinsicInvokeField = 0x5D,
    /// Re-bind parameters against the forwarding target, then tail-call it.
    IntrinsicForwardDynamicInvocation = 0x5E,
    /// Route the call straight to noSuchMethod.
    IntrinsicNoSuchMethodDispatcher = 0x5F,
}

impl Opcode {
    /// Highest valid opcode value.
    pub const MAX: u8 = Opcode::IntrinsicNoSuchMethodDispatcher as u8;

    /// Decode an opcode from its numeric value (wide bit already stripped).
    pub fn from_u8(value: u8) -> Option<Opcode> {
        if value > Self::MAX {
            return None;
        }
        // Values 0x00..=MAX are contiguous by construction; checked by the
        // round-trip test below.
        Some(unsafe { std::mem::transmute::<u8, Opcode>(value) })
    }

    /// Operand format of this opcode.
    pub fn format(self) -> Format {
        use Opcode::*;
        match self {
            Trap | PushNull | PushTrue | PushFalse | Drop1 | BooleanNegateTOS
            | PushUninitializedSentinel | ReturnTOS | LoadContextParent | StoreContextParent
            | StoreIndexedTOS | AllocateT | CreateArrayTOS | AssertSubtype | AddInt | SubInt
            | MulInt | TruncDivInt | ModInt | BitAndInt | BitOrInt | BitXorInt | ShlInt
            | ShrInt | CompareIntEq | CompareIntGt | CompareIntLt | CompareIntGe | CompareIntLe
            | NegateDouble | AddDouble | SubDouble | MulDouble | DivDouble | CompareDoubleEq
            | CompareDoubleGt | CompareDoubleLt | CompareDoubleGe | CompareDoubleLe
            | IntrinsicImplicitGetter | IntrinsicImplicitSetter | IntrinsicImplicitStaticGetter
            | IntrinsicMethodExtractor | IntrinsicInvokeClosure | IntrinsicInvokeField
            | IntrinsicForwardDynamicInvocation | IntrinsicNoSuchMethodDispatcher => Format::Op0,

            SetFrame | CheckStack | AssertBoolean | Throw => Format::OpA,

            Entry | Frame | PushConstant | NativeCall | LoadFieldTOS | StoreFieldTOS
            | InitLateField | LoadTypeArgumentsField | Allocate | AllocateClosure
            | InstantiateType | NullCheck => Format::OpD,

            PushInt | Push | StoreLocal | PopLocal => Format::OpX,

            Jump | JumpIfNoAsserts | JumpIfNotZeroTypeArgs | JumpIfEqStrict | JumpIfNeStrict
            | JumpIfTrue | JumpIfFalse | JumpIfNull | JumpIfNotNull | JumpIfUnchecked
            | JumpIfInitialized => Format::OpT,

            EntryFixed | CheckFunctionTypeArgs | LoadConstant | LoadContextVar
            | StoreContextVar | AllocateContext | CloneContext
            | InstantiateTypeArgumentsTOS | AssertAssignable => Format::OpAE,

            MoveSpecial => Format::OpAY,

            DirectCall | UncheckedDirectCall | InterfaceCall | UncheckedInterfaceCall
            | InstantiatedInterfaceCall | UncheckedClosureCall | DynamicCall => Format::OpDF,

            EntryOptional => Format::OpABC,
        }
    }

    /// Whether this opcode is one of the call opcodes whose `F` operand gives
    /// the argument count popped on return.
    pub fn is_call(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            DirectCall
                | UncheckedDirectCall
                | InterfaceCall
                | UncheckedInterfaceCall
                | InstantiatedInterfaceCall
                | UncheckedClosureCall
                | DynamicCall
        )
    }
}
