//! Runner serialization, code validation at the boundary, and tracers.

mod common;

use coil::{
    CodeBuilder, Const, LoadError, NoLimitTracker, NoPrint, Object, Opcode, ProfilingTracer, RecordingTracer, Runner,
    TraceEvent,
};
use common::{Asm, function, module};
use pretty_assertions::assert_eq;

/// `def double(x): return x * 2; return double(21)`
fn double_program() -> coil::Code {
    let mut body = function("double", &["x"]);
    body.load_fast("x");
    body.int(2);
    body.emit(Opcode::BinaryMultiply);
    body.ret();

    let mut b = module();
    b.def("double", body.build(), &[]);
    b.load("double");
    b.int(21);
    b.call(1);
    b.ret();
    b.build()
}

// =============================================================================
// Runner
// =============================================================================

#[test]
fn runner_survives_dump_and_load() {
    let mut lib = module();
    lib.int(7);
    lib.store("seven");
    lib.ret_none();

    let mut main = module();
    let level = main.add_const(Const::Int(-1));
    main.emit_arg(Opcode::LoadConst, level);
    main.none();
    let lib_name = main.add_name("lib");
    main.emit_arg(Opcode::ImportName, lib_name);
    main.attr("seven");
    main.ret();

    let runner = Runner::new(main.build()).unwrap().with_module("lib", lib.build()).unwrap();
    let bytes = runner.dump().unwrap();
    let loaded = Runner::load(&bytes).unwrap();
    assert_eq!(loaded.code(), runner.code());
    assert_eq!(loaded.run(NoLimitTracker, &mut NoPrint).unwrap(), Object::Int(7));
    // each run starts from a fresh interpreter
    assert_eq!(loaded.run(NoLimitTracker, &mut NoPrint).unwrap(), Object::Int(7));
}

#[test]
fn runner_from_json() {
    let json = double_program().to_json().unwrap();
    let runner = Runner::from_json(&json).unwrap();
    assert_eq!(runner.run(NoLimitTracker, &mut NoPrint).unwrap(), Object::Int(42));
}

#[test]
fn load_rejects_garbage() {
    let err = Runner::load(&[0xff, 0xff, 0xff]).unwrap_err();
    assert!(matches!(err, LoadError::Decode(_)), "{err}");
}

#[test]
fn jump_past_the_end_is_rejected_before_running() {
    let mut b = CodeBuilder::new("<module>");
    let label = b.emit_jump(Opcode::JumpForward);
    b.patch_jump(label);
    assert!(Runner::new(b.build()).is_err());
}

// =============================================================================
// Tracers
// =============================================================================

#[test]
fn recording_tracer_sees_calls_and_returns() {
    let runner = Runner::new(double_program()).unwrap();
    let mut tracer = RecordingTracer::new();
    let result = runner.run_traced(NoLimitTracker, &mut NoPrint, &mut tracer).unwrap();
    assert_eq!(result, Object::Int(42));

    let frames: Vec<TraceEvent> = tracer
        .into_events()
        .into_iter()
        .filter(|event| matches!(event, TraceEvent::Call { .. } | TraceEvent::Return { .. }))
        .collect();
    assert_eq!(
        frames,
        vec![
            TraceEvent::Call {
                name: "<module>".to_owned(),
                depth: 1
            },
            TraceEvent::Call {
                name: "double".to_owned(),
                depth: 2
            },
            TraceEvent::Return { depth: 1 },
            TraceEvent::Return { depth: 0 },
        ]
    );
}

#[test]
fn first_instruction_is_recorded_at_offset_zero() {
    let runner = Runner::new(double_program()).unwrap();
    let mut tracer = RecordingTracer::with_limit(2);
    runner.run_traced(NoLimitTracker, &mut NoPrint, &mut tracer).unwrap();
    assert!(matches!(
        tracer.events().iter().find(|e| matches!(e, TraceEvent::Instruction { .. })),
        Some(TraceEvent::Instruction {
            ip: 0,
            opcode: Opcode::LoadConst,
            stack_depth: 0
        })
    ));
}

#[test]
fn profiler_counts_calls() {
    let runner = Runner::new(double_program()).unwrap();
    let mut tracer = ProfilingTracer::new();
    runner.run_traced(NoLimitTracker, &mut NoPrint, &mut tracer).unwrap();
    let report = tracer.report();
    assert_eq!(report.total_calls, 2);
    assert_eq!(report.max_depth, 2);
    assert!(report.call_counts.contains(&("double".to_owned(), 1)));
    assert!(report.to_string().starts_with("=== Profiling Report ===\n"));
}
