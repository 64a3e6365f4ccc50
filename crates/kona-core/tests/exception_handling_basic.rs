//! Exception throwing, handler resumption and cross-stack propagation

mod common;

use common::{arg_offset, result_cid, unwrap_unhandled, World};
use kona_bytecode::{BytecodeWriter, Opcode};
use kona_core::gc::ObjRef;
use kona_core::object::{class_id, Array, UnhandledException, CID_UNHANDLED_EXCEPTION};
use kona_core::program::ExceptionHandler;
use kona_core::runtime::{NativeArguments, RuntimeEnv};
use kona_core::value::Value;
use kona_core::vm::SPECIAL_EXCEPTION_INDEX;

/// Uncaught throws surface from `call` as an UnhandledException wrapper.
#[test]
fn test_uncaught_throw() {
    let mut world = World::new();
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::PushInt, 42);
    w.emit_a(Opcode::Throw, 0);
    let f = world.function("thrower", 0, w, vec![]);

    let result = world.call(f, &[]);
    assert_eq!(result_cid(result), CID_UNHANDLED_EXCEPTION);
    let wrapper = UnhandledException(ObjRef::from_value(result));
    assert_eq!(wrapper.exception().as_smi(), 42);
    // The unwinder attached a stack trace naming the throwing function.
    let trace = wrapper.stacktrace();
    assert!(trace.is_heap_object());
    assert_eq!(world.interp.unwind_chain_depth(), 0);
}

/// A throw two frames down resumes at the covering handler with the
/// exception visible in the special slot, SP and FP restored.
#[test]
fn test_catch_two_frames_up() {
    let mut world = World::new();

    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::PushInt, 42);
    w.emit_a(Opcode::Throw, 0);
    let thrower = world.function("thrower", 0, w, vec![]);

    let argdesc0 = world.argdesc(0);
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_df(Opcode::DirectCall, 0, 0);
    w.emit_0(Opcode::ReturnTOS);
    let mid = world.function("mid", 0, w, vec![Value::smi(thrower as i64), argdesc0]);

    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 2);
    let try_start = w.offset() as u32;
    w.emit_df(Opcode::DirectCall, 0, 0);
    let try_end = w.offset() as u32;
    w.emit_0(Opcode::ReturnTOS); // normal path: mid's result
    let handler_pc = w.offset() as u32;
    w.emit_ay(Opcode::MoveSpecial, 0, 0); // local 0 = exception
    w.emit_ay(Opcode::MoveSpecial, 1, 1); // local 1 = stack trace
    w.emit_x(Opcode::Push, 0);
    w.emit_0(Opcode::ReturnTOS);
    let catcher = world.declare("catcher", 0);
    world.attach_with_handlers(
        catcher,
        w,
        vec![Value::smi(mid as i64), argdesc0],
        vec![ExceptionHandler {
            start: try_start,
            end: try_end,
            handler_pc,
            frame_size: 2,
        }],
    );

    let depth_before = world.interp.unwind_chain_depth();
    let result = world.call(catcher, &[]);
    assert_eq!(result.as_smi(), 42);
    assert_eq!(
        world
            .interp
            .special_slot(SPECIAL_EXCEPTION_INDEX)
            .as_smi(),
        42
    );
    // Every unwind record pushed for the throw was popped again.
    assert_eq!(world.interp.unwind_chain_depth(), depth_before);
}

/// Rethrow propagates the original exception and stack trace.
#[test]
fn test_rethrow_from_handler() {
    let mut world = World::new();

    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::PushInt, 7);
    w.emit_a(Opcode::Throw, 0);
    let thrower = world.function("thrower", 0, w, vec![]);

    let argdesc0 = world.argdesc(0);
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 2);
    let try_start = w.offset() as u32;
    w.emit_df(Opcode::DirectCall, 0, 0);
    let try_end = w.offset() as u32;
    w.emit_0(Opcode::ReturnTOS);
    let handler_pc = w.offset() as u32;
    w.emit_ay(Opcode::MoveSpecial, 0, 0);
    w.emit_ay(Opcode::MoveSpecial, 1, 1);
    w.emit_x(Opcode::Push, 0);
    w.emit_x(Opcode::Push, 1);
    w.emit_a(Opcode::Throw, 1); // rethrow
    let rethrower = world.declare("rethrower", 0);
    world.attach_with_handlers(
        rethrower,
        w,
        vec![Value::smi(thrower as i64), argdesc0],
        vec![ExceptionHandler {
            start: try_start,
            end: try_end,
            handler_pc,
            frame_size: 2,
        }],
    );

    let result = world.call(rethrower, &[]);
    let exception = unwrap_unhandled(result);
    assert_eq!(exception.as_smi(), 7);
}

fn native_ok(_env: &mut RuntimeEnv, args: &mut NativeArguments<'_>) -> Result<(), kona_core::Unwind> {
    let v = args.arg(0).as_smi();
    args.set_return(Value::smi(v * 2));
    Ok(())
}

fn native_throws(env: &mut RuntimeEnv, _args: &mut NativeArguments<'_>) -> Result<(), kona_core::Unwind> {
    let cid = env.well_known().argument_error_cid;
    Err(env.throw_new(cid, "native rejected", env.null_value()))
}

/// Natives throw through the same unwind protocol as runtime helpers.
#[test]
fn test_native_throw_unwinds() {
    let mut world = World::new();
    world.env.register_native("double", native_ok);
    world.env.register_native("reject", native_throws);
    let ok_entry = world.env.native_call_entry("double", 1);
    let throw_entry = world.env.native_call_entry("reject", 0);

    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::PushInt, 21);
    w.emit_d(Opcode::NativeCall, 0);
    w.emit_0(Opcode::ReturnTOS);
    let ok = world.function("callDouble", 0, w, vec![ok_entry]);
    assert_eq!(world.call(ok, &[]).as_smi(), 42);
    assert_eq!(world.env.stats.native_links, 1);

    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_d(Opcode::NativeCall, 0);
    w.emit_0(Opcode::ReturnTOS);
    let bad = world.function("callReject", 0, w, vec![throw_entry]);
    let result = world.call(bad, &[]);
    let exception = unwrap_unhandled(result);
    assert_eq!(result_cid(exception), world.env.well_known().argument_error_cid);
}

fn compiled_sum(_env: &mut RuntimeEnv, _argdesc: Value, args: Value) -> Value {
    let args = Array(ObjRef::from_value(args));
    Value::smi(args.at(0).as_smi() + args.at(1).as_smi())
}

fn compiled_raises(env: &mut RuntimeEnv, _argdesc: Value, _args: Value) -> Value {
    env.new_unhandled_exception(Value::smi(99), env.null_value())
        .unwrap()
}

/// The compiled-code bridge: normal results replace the call arguments;
/// an UnhandledException result is rethrown into interpreter handlers.
#[test]
fn test_compiled_bridge() {
    let mut world = World::new();
    let sum = world.declare("sum", 2);
    world.env.program.function_mut(sum).code = Some(compiled_sum);
    let argdesc2 = world.argdesc(2);

    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::PushInt, 3);
    w.emit_x(Opcode::PushInt, 4);
    w.emit_df(Opcode::DirectCall, 0, 2);
    w.emit_0(Opcode::ReturnTOS);
    let caller = world.function("callSum", 0, w, vec![Value::smi(sum as i64), argdesc2]);
    assert_eq!(world.call(caller, &[]).as_smi(), 7);

    let raises = world.declare("raises", 0);
    world.env.program.function_mut(raises).code = Some(compiled_raises);
    let argdesc0 = world.argdesc(0);

    // Uncaught: the rethrown exception surfaces wrapped again.
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_df(Opcode::DirectCall, 0, 0);
    w.emit_0(Opcode::ReturnTOS);
    let caller =
        world.function("callRaises", 0, w, vec![Value::smi(raises as i64), argdesc0]);
    let result = world.call(caller, &[]);
    assert_eq!(unwrap_unhandled(result).as_smi(), 99);

    // Caught: an interpreter handler covering the call site receives it.
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 1);
    let try_start = w.offset() as u32;
    w.emit_df(Opcode::DirectCall, 0, 0);
    let try_end = w.offset() as u32;
    w.emit_0(Opcode::ReturnTOS);
    let handler_pc = w.offset() as u32;
    w.emit_ay(Opcode::MoveSpecial, 0, 0);
    w.emit_x(Opcode::Push, 0);
    w.emit_0(Opcode::ReturnTOS);
    let catcher = world.declare("catchRaises", 0);
    world.attach_with_handlers(
        catcher,
        w,
        vec![Value::smi(raises as i64), argdesc0],
        vec![ExceptionHandler {
            start: try_start,
            end: try_end,
            handler_pc,
            frame_size: 1,
        }],
    );
    let result = world.call(catcher, &[]);
    assert_eq!(result.as_smi(), 99);
}

/// Handlers outside the covering range do not catch.
#[test]
fn test_handler_range_respected() {
    let mut world = World::new();

    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::PushInt, 13);
    w.emit_a(Opcode::Throw, 0);
    let thrower = world.function("thrower", 0, w, vec![]);
    let argdesc0 = world.argdesc(0);

    // The handler covers only the PushInt, not the call that throws.
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 1);
    let covered_start = w.offset() as u32;
    w.emit_x(Opcode::PushInt, 0);
    let covered_end = w.offset() as u32;
    w.emit_0(Opcode::Drop1);
    w.emit_df(Opcode::DirectCall, 0, 0);
    w.emit_0(Opcode::ReturnTOS);
    let handler_pc = w.offset() as u32;
    w.emit_x(Opcode::PushInt, -1);
    w.emit_0(Opcode::ReturnTOS);
    let f = world.declare("narrow", 0);
    world.attach_with_handlers(
        f,
        w,
        vec![Value::smi(thrower as i64), argdesc0],
        vec![ExceptionHandler {
            start: covered_start,
            end: covered_end,
            handler_pc,
            frame_size: 1,
        }],
    );

    let result = world.call(f, &[]);
    assert_eq!(unwrap_unhandled(result).as_smi(), 13);
}

/// A thrown plain value reaching the entry frame is wrapped exactly once.
#[test]
fn test_wrapper_not_double_wrapped() {
    let mut world = World::new();
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::PushInt, 5);
    w.emit_a(Opcode::Throw, 0);
    let f = world.function("thrower", 0, w, vec![]);

    let result = world.call(f, &[]);
    assert_eq!(result_cid(result), CID_UNHANDLED_EXCEPTION);
    let inner = UnhandledException(ObjRef::from_value(result)).exception();
    assert_ne!(class_id(inner), CID_UNHANDLED_EXCEPTION);
}
