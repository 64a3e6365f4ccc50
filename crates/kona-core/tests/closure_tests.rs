//! Closures, method extraction and the dispatcher bodies

mod common;

use common::{arg_offset, result_cid, unwrap_unhandled, World};
use kona_bytecode::{BytecodeWriter, Opcode};
use kona_core::gc::ObjRef;
use kona_core::object::{class_id, Closure, Context, CID_CLOSURE, CID_CONTEXT};
use kona_core::program::{FunctionData, FunctionKind};
use kona_core::Value;

/// Allocate a closure over `function` with a context holding `captured`.
fn make_closure(world: &mut World, function: u32, captured: Option<Value>) -> Value {
    let env = &mut world.env;
    let null = env.null_value();
    let context = match captured {
        Some(v) => {
            let obj = env
                .allocate_any(CID_CONTEXT, Context::size_words(1))
                .unwrap();
            Context::init(obj, 1, null);
            obj.set_slot(Context::VARS_SLOT, v);
            obj.value()
        }
        None => null,
    };
    let obj = env.allocate_any(CID_CLOSURE, Closure::SIZE_WORDS).unwrap();
    for slot in 0..Closure::SIZE_WORDS - 1 {
        obj.set_slot(slot, null);
    }
    obj.set_slot(Closure::FUNCTION_SLOT, Value::smi(function as i64));
    obj.set_slot(Closure::CONTEXT_SLOT, context);
    obj.value()
}

/// UncheckedClosureCall reads the receiver closure's function field.
#[test]
fn test_closure_call() {
    let mut world = World::new();

    // fn(closure, x) => x + 1
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::Push, arg_offset(2, 1));
    w.emit_x(Opcode::PushInt, 1);
    w.emit_0(Opcode::AddInt);
    w.emit_0(Opcode::ReturnTOS);
    let body = world.function("body", 2, w, vec![]);
    let closure = make_closure(&mut world, body, None);

    let argdesc2 = world.argdesc(2);
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_d(Opcode::PushConstant, 1); // closure as arg 0
    w.emit_x(Opcode::PushInt, 41); // x
    w.emit_d(Opcode::PushConstant, 1); // closure receiver for the call
    w.emit_df(Opcode::UncheckedClosureCall, 0, 2);
    w.emit_0(Opcode::ReturnTOS);
    let caller = world.function("callClosure", 0, w, vec![argdesc2, closure]);

    assert_eq!(world.call(caller, &[]).as_smi(), 42);
}

/// Calling a null closure receiver raises NullError for `call`.
#[test]
fn test_closure_call_on_null() {
    let mut world = World::new();
    let argdesc1 = world.argdesc(1);
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_0(Opcode::PushNull); // arg 0
    w.emit_0(Opcode::PushNull); // receiver closure
    w.emit_df(Opcode::UncheckedClosureCall, 0, 1);
    w.emit_0(Opcode::ReturnTOS);
    let caller = world.function("callNull", 0, w, vec![argdesc1]);

    let result = world.call(caller, &[]);
    let exception = unwrap_unhandled(result);
    assert_eq!(result_cid(exception), world.env.well_known().null_error_cid);
}

/// The method extractor allocates a closure capturing the receiver in a
/// one-slot context.
#[test]
fn test_method_extractor() {
    let mut world = World::new();
    let cid = world.env.register_class("Point", 1, None);

    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::PushInt, 11);
    w.emit_0(Opcode::ReturnTOS);
    let method = world.function("norm", 1, w, vec![]);

    let name = world.env.intern("get:norm");
    let extractor = world.env.program.add_function(kona_core::program::Function {
        name,
        kind: FunctionKind::MethodExtractor,
        is_static: false,
        num_fixed_params: 1,
        num_opt_positional_params: 0,
        num_opt_named_params: 0,
        num_type_params: 0,
        bytecode: None,
        code: None,
        parent: None,
        data: FunctionData::Target(method),
    });

    let receiver = world.env.allocate_any(cid, 2).unwrap();
    receiver.set_slot(0, world.env.null_value());
    let receiver = receiver.value();

    let result = world.call(extractor, &[receiver]);
    assert_eq!(class_id(result), CID_CLOSURE);
    let closure = Closure(ObjRef::from_value(result));
    assert_eq!(closure.function().as_smi(), method as i64);
    let context = Context(ObjRef::from_value(closure.context()));
    assert_eq!(context.len(), 1);
    assert!(context.var(0).identical(receiver));
    assert!(closure
        .delayed_type_args()
        .identical(world.env.well_known().empty_type_args));

    // The extracted closure is callable.
    let argdesc1 = world.argdesc(1);
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_d(Opcode::PushConstant, 1);
    w.emit_d(Opcode::PushConstant, 1);
    w.emit_df(Opcode::UncheckedClosureCall, 0, 1);
    w.emit_0(Opcode::ReturnTOS);
    let caller = world.function("callExtracted", 0, w, vec![argdesc1, result]);
    assert_eq!(world.call(caller, &[]).as_smi(), 11);
}

/// A noSuchMethod dispatcher routes straight to the noSuchMethod helper.
#[test]
fn test_no_such_method_dispatcher() {
    let mut world = World::new();
    let name = world.env.intern("ghost");
    let dispatcher = world.env.program.add_function(kona_core::program::Function {
        name,
        kind: FunctionKind::NoSuchMethodDispatcher,
        is_static: false,
        num_fixed_params: 1,
        num_opt_positional_params: 0,
        num_opt_named_params: 0,
        num_type_params: 0,
        bytecode: None,
        code: None,
        parent: None,
        data: FunctionData::None,
    });

    let result = world.call(dispatcher, &[Value::smi(1)]);
    let exception = unwrap_unhandled(result);
    assert_eq!(result_cid(exception), world.env.well_known().nsm_error_cid);
}

/// With lazy dispatchers enabled, the miss handler synthesizes a
/// noSuchMethod dispatcher instead of returning null.
#[test]
fn test_lazy_dispatcher_creation() {
    let mut world = World::new();
    world.env.lazy_dispatchers = true;
    let cid = world.env.register_class("Empty", 0, None);
    let missing = world.declare("missing", 1);

    let argdesc1 = world.argdesc(1);
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::Push, arg_offset(1, 0));
    w.emit_df(Opcode::InterfaceCall, 0, 1);
    w.emit_0(Opcode::ReturnTOS);
    let caller = world.function(
        "callMissing",
        1,
        w,
        vec![Value::smi(missing as i64), argdesc1],
    );

    let receiver = world.env.allocate_any(cid, 1).unwrap().value();
    let result = world.call(caller, &[receiver]);
    let exception = unwrap_unhandled(result);
    assert_eq!(result_cid(exception), world.env.well_known().nsm_error_cid);
    // The throw came through the prologue path of a synthesized dispatcher.
    assert_eq!(world.env.stats.miss_handler_calls, 1);
    assert_eq!(world.env.stats.no_such_method_calls, 1);
}

/// A dynamic-invocation forwarder re-binds parameters and tail-calls its
/// target.
#[test]
fn test_dynamic_invocation_forwarder() {
    let mut world = World::new();

    // target(x, {y: 5}) => x * 10 + y
    let name_y = world.env.intern("y");
    let mut w = BytecodeWriter::new();
    w.emit_abc(Opcode::EntryOptional, 1, 0, 1);
    w.emit_ae(Opcode::LoadConstant, 1, 0); // name y
    w.emit_ae(Opcode::LoadConstant, 1, 1); // default 5
    w.emit_x(Opcode::Push, 0);
    w.emit_x(Opcode::PushInt, 10);
    w.emit_0(Opcode::MulInt);
    w.emit_x(Opcode::Push, 1);
    w.emit_0(Opcode::AddInt);
    w.emit_0(Opcode::ReturnTOS);
    let target = world.declare("target", 1);
    world.env.program.function_mut(target).num_opt_named_params = 1;
    world.attach(target, w, vec![name_y, Value::smi(5)]);

    let name = world.env.intern("dyn:target");
    let forwarder = world.env.program.add_function(kona_core::program::Function {
        name,
        kind: FunctionKind::DynamicInvocationForwarder,
        is_static: false,
        num_fixed_params: 1,
        num_opt_positional_params: 0,
        num_opt_named_params: 1,
        num_type_params: 0,
        bytecode: None,
        code: None,
        parent: None,
        data: FunctionData::Target(target),
    });

    let result = world.call(forwarder, &[Value::smi(3)]);
    assert_eq!(result.as_smi(), 35);

    let with_y = world.env.args_descriptor(0, 1, &[("y", 1)]);
    let result =
        world.call_with_descriptor(forwarder, with_y, &[Value::smi(3), Value::smi(9)]);
    assert_eq!(result.as_smi(), 39);

    // A named argument the target does not declare is rejected.
    let with_z = world.env.args_descriptor(0, 1, &[("z", 1)]);
    let result =
        world.call_with_descriptor(forwarder, with_z, &[Value::smi(3), Value::smi(9)]);
    let exception = unwrap_unhandled(result);
    assert_eq!(result_cid(exception), world.env.well_known().nsm_error_cid);
}

/// An invoke-field dispatcher loads a closure-valued field and calls it.
#[test]
fn test_invoke_field_dispatcher() {
    let mut world = World::new();
    let cid = world.env.register_class("Holder", 1, None);

    // The closure body: fn(closure) => 77
    let mut w = BytecodeWriter::new();
    w.emit_d(Opcode::Entry, 0);
    w.emit_x(Opcode::PushInt, 77);
    w.emit_0(Opcode::ReturnTOS);
    let body = world.function("handlerBody", 1, w, vec![]);
    let closure = make_closure(&mut world, body, None);

    let field_name = world.env.intern("handler");
    let field = world.env.program.add_field(kona_core::program::Field {
        name: field_name,
        owner: cid,
        is_static: false,
        host_offset_or_field_id: 0,
        guarded_cid: kona_core::object::CID_ILLEGAL,
        nullability_cid: kona_core::object::CID_ILLEGAL,
        guarded_list_length: kona_core::program::UNKNOWN_FIXED_LENGTH,
        exactness: kona_core::program::EXACTNESS_NOT_TRACKING,
        is_unboxing_candidate: false,
        needs_load_guard: false,
        field_type: world.env.null_value(),
        type_test_cache: world.env.null_value(),
    });
    world.env.register_dispatch_field(cid, "handler", field);

    let dispatcher = world.env.program.add_function(kona_core::program::Function {
        name: field_name,
        kind: FunctionKind::InvokeFieldDispatcher,
        is_static: false,
        num_fixed_params: 1,
        num_opt_positional_params: 0,
        num_opt_named_params: 0,
        num_type_params: 0,
        bytecode: None,
        code: None,
        parent: None,
        data: FunctionData::None,
    });

    let receiver = world.env.allocate_any(cid, 2).unwrap();
    receiver.set_slot(0, closure);
    let receiver = receiver.value();

    let result = world.call(dispatcher, &[receiver]);
    assert_eq!(result.as_smi(), 77);
}
