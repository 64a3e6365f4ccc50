//! End-to-end interpreter scenarios

mod common;

use common::{arg_offset, result_cid, unwrap_unhandled, World};
use kona_bytecode::{BytecodeWriter, Label, Opcode};
use kona_core::object::{class_id, Mint, CID_MINT};
use kona_core::gc::ObjRef;
use kona_core::runtime::InterruptReason;
use kona_core::Value;

/// Recursive fib(10) through DirectCall returns the immediate 55.
#[test]
fn test_fibonacci() {
    let mut world = World::new();
    let fib = world.declare("fib", 1);
    let argdesc = world.argdesc(1);

    let mut w = BytecodeWriter::new();
    let mut recurse = Label::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_a(Opcode::CheckStack, 0);
    w.emit_x(Opcode::Push, arg_offset(1, 0));
    w.emit_x(Opcode::PushInt, 2);
    w.emit_0(Opcode::CompareIntLt);
    w.jump(Opcode::JumpIfFalse, &mut recurse);
    w.emit_x(Opcode::Push, arg_offset(1, 0));
    w.emit_0(Opcode::ReturnTOS);
    w.bind(&mut recurse);
    w.emit_x(Opcode::Push, arg_offset(1, 0));
    w.emit_x(Opcode::PushInt, 1);
    w.emit_0(Opcode::SubInt);
    w.emit_df(Opcode::DirectCall, 0, 1);
    w.emit_x(Opcode::Push, arg_offset(1, 0));
    w.emit_x(Opcode::PushInt, 2);
    w.emit_0(Opcode::SubInt);
    w.emit_df(Opcode::DirectCall, 0, 1);
    w.emit_0(Opcode::AddInt);
    w.emit_0(Opcode::ReturnTOS);

    world.attach(fib, w, vec![Value::smi(fib as i64), argdesc]);

    let result = world.call(fib, &[Value::smi(10)]);
    assert!(result.is_smi());
    assert_eq!(result.as_smi(), 55);
}

/// Adding 1 to the largest int64 wraps to INT64_MIN boxed as a Mint.
#[test]
fn test_integer_overflow_wraps_to_mint() {
    let mut world = World::new();
    let max = world.env.box_int(i64::MAX).unwrap();

    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_d(Opcode::PushConstant, 0);
    w.emit_x(Opcode::PushInt, 1);
    w.emit_0(Opcode::AddInt);
    w.emit_0(Opcode::ReturnTOS);
    let f = world.function("overflow", 0, w, vec![max]);

    let result = world.call(f, &[]);
    assert_eq!(class_id(result), CID_MINT);
    assert_eq!(Mint(ObjRef::from_value(result)).value(), i64::MIN);
}

/// Division by zero surfaces as an UnhandledException wrapping the
/// division-by-zero error.
#[test]
fn test_division_by_zero() {
    let mut world = World::new();
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::PushInt, 5);
    w.emit_x(Opcode::PushInt, 0);
    w.emit_0(Opcode::TruncDivInt);
    w.emit_0(Opcode::ReturnTOS);
    let f = world.function("div", 0, w, vec![]);

    let result = world.call(f, &[]);
    let exception = unwrap_unhandled(result);
    assert_eq!(
        result_cid(exception),
        world.env.well_known().division_by_zero_cid
    );
}

/// Named parameters bind from the descriptor when passed and from the
/// declared defaults otherwise.
#[test]
fn test_named_argument_binding() {
    let mut world = World::new();
    let name_x = world.env.intern("x");
    let name_y = world.env.intern("y");

    // f({x: 1, y: 2}) => x * 1000 + y
    let mut w = BytecodeWriter::new();
    w.emit_abc(Opcode::EntryOptional, 0, 0, 2);
    w.emit_ae(Opcode::LoadConstant, 0, 0); // name x
    w.emit_ae(Opcode::LoadConstant, 0, 1); // default 1
    w.emit_ae(Opcode::LoadConstant, 1, 2); // name y
    w.emit_ae(Opcode::LoadConstant, 1, 3); // default 2
    w.emit_x(Opcode::Push, 0);
    w.emit_x(Opcode::PushInt, 1000);
    w.emit_0(Opcode::MulInt);
    w.emit_x(Opcode::Push, 1);
    w.emit_0(Opcode::AddInt);
    w.emit_0(Opcode::ReturnTOS);
    let f = world.declare("f", 0);
    world.env.program.function_mut(f).num_opt_named_params = 2;
    world.attach(
        f,
        w,
        vec![name_x, Value::smi(1), name_y, Value::smi(2)],
    );

    // {x: 10} binds x from the call and y from its default.
    let with_x = world.env.args_descriptor(0, 0, &[("x", 0)]);
    let result = world.call_with_descriptor(f, with_x, &[Value::smi(10)]);
    assert_eq!(result.as_smi(), 10 * 1000 + 2);

    // {y: 7} binds y from the call and x from its default.
    let with_y = world.env.args_descriptor(0, 0, &[("y", 0)]);
    let result = world.call_with_descriptor(f, with_y, &[Value::smi(7)]);
    assert_eq!(result.as_smi(), 1000 + 7);

    // No named arguments: both defaults.
    let plain = world.argdesc(0);
    let result = world.call_with_descriptor(f, plain, &[]);
    assert_eq!(result.as_smi(), 1002);

    // {z: 0} does not match any declared parameter: noSuchMethod.
    let with_z = world.env.args_descriptor(0, 0, &[("z", 0)]);
    let result = world.call_with_descriptor(f, with_z, &[Value::smi(0)]);
    let exception = unwrap_unhandled(result);
    assert_eq!(result_cid(exception), world.env.well_known().nsm_error_cid);
}

/// The instance-call cache: first call misses and consults the resolver,
/// the second call hits without resolver traffic.
#[test]
fn test_instance_call_cache() {
    let mut world = World::new();
    let cid = world.env.register_class("Sized", 0, None);

    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::PushInt, 3);
    w.emit_0(Opcode::ReturnTOS);
    let length = world.function("length", 1, w, vec![]);
    world.env.register_method(cid, "length", length);

    let argdesc = world.argdesc(1);
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::Push, arg_offset(1, 0));
    w.emit_df(Opcode::InterfaceCall, 0, 1);
    w.emit_0(Opcode::ReturnTOS);
    let caller = world.function(
        "callLength",
        1,
        w,
        vec![Value::smi(length as i64), argdesc],
    );

    let receiver = world.env.allocate_any(cid, 1).unwrap().value();

    let first = world.call(caller, &[receiver]);
    assert_eq!(first.as_smi(), 3);
    assert_eq!(world.env.stats.miss_handler_calls, 1);

    let second = world.call(caller, &[receiver]);
    assert_eq!(second.as_smi(), 3);
    assert_eq!(world.env.stats.miss_handler_calls, 1, "second call must hit");
}

/// Unresolvable selectors route through invoke_no_such_method.
#[test]
fn test_instance_call_no_such_method() {
    let mut world = World::new();
    let cid = world.env.register_class("Empty", 0, None);
    let missing = world.declare("missing", 1);

    let argdesc = world.argdesc(1);
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::Push, arg_offset(1, 0));
    w.emit_df(Opcode::InterfaceCall, 0, 1);
    w.emit_0(Opcode::ReturnTOS);
    let caller = world.function(
        "callMissing",
        1,
        w,
        vec![Value::smi(missing as i64), argdesc],
    );

    let receiver = world.env.allocate_any(cid, 1).unwrap().value();
    let result = world.call(caller, &[receiver]);
    let exception = unwrap_unhandled(result);
    assert_eq!(result_cid(exception), world.env.well_known().nsm_error_cid);
    assert_eq!(world.env.stats.no_such_method_calls, 1);
}

/// A scheduled interrupt is serviced at CheckStack without throwing.
#[test]
fn test_check_stack_services_interrupts() {
    let mut world = World::new();
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_a(Opcode::CheckStack, 0);
    w.emit_x(Opcode::PushInt, 1);
    w.emit_0(Opcode::ReturnTOS);
    let f = world.function("poll", 0, w, vec![]);

    world
        .env
        .thread
        .schedule_interrupt(InterruptReason::Safepoint);
    let result = world.call(f, &[]);
    assert_eq!(result.as_smi(), 1);
    assert_eq!(world.env.stats.interrupts_serviced, 1);
    assert!(!world.env.thread.has_scheduled_interrupts());
}

/// Reversed argument order through a negative argc.
#[test]
fn test_reversed_argv() {
    let mut world = World::new();
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::Push, arg_offset(2, 0));
    w.emit_x(Opcode::Push, arg_offset(2, 1));
    w.emit_0(Opcode::SubInt);
    w.emit_0(Opcode::ReturnTOS);
    let f = world.function("sub", 2, w, vec![]);

    let argdesc = world.argdesc(2);
    // argv reversed: actual call is sub(10, 4).
    let result = world
        .interp
        .call(
            &mut world.env,
            f,
            argdesc,
            -2,
            &[Value::smi(4), Value::smi(10)],
        )
        .unwrap();
    assert_eq!(result.as_smi(), 6);
}

/// EntryFixed rejects a wrong positional count via noSuchMethod.
#[test]
fn test_entry_fixed_arity_mismatch() {
    let mut world = World::new();
    let mut w = BytecodeWriter::new();
    w.emit_ae(Opcode::EntryFixed, 1, 0);
    w.emit_x(Opcode::Push, arg_offset(1, 0));
    w.emit_0(Opcode::ReturnTOS);
    let f = world.function("one", 1, w, vec![]);

    let ok = world.call(f, &[Value::smi(5)]);
    assert_eq!(ok.as_smi(), 5);

    let result = world.call(f, &[Value::smi(5), Value::smi(6)]);
    let exception = unwrap_unhandled(result);
    assert_eq!(result_cid(exception), world.env.well_known().nsm_error_cid);
}
