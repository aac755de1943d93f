//! Engine-level invariants beyond the scripted end-to-end scenarios in
//! `e2e.rs`: memory growth limits, reinterpret round trips, and the
//! call-stack depth trap.

mod common;

use common::*;
use rstest::rstest;
use wasmc::decode::decode_module;
use wasmc::engine::Instance;
use wasmc::host::EmptyHost;
use wasmc::storage::Buffer;
use wasmc::types::ExportDescriptor;
use wasmc::value::Value;

fn instantiate(bytes: &[u8]) -> Instance {
    let module = decode_module(Buffer::new(bytes)).unwrap();
    Instance::instantiate(&module, &EmptyHost).unwrap()
}

fn call(instance: &mut Instance, export: &str, args: &[Value]) -> Result<Vec<Value>, String> {
    let ExportDescriptor::Function(idx) = *instance.export(export).unwrap() else {
        panic!("not a function export");
    };
    instance.call(idx, args).map_err(|t| t.to_string())
}

#[test]
fn memory_grow_reports_prior_size_and_saturates_at_max() {
    // One page to start, capped at two.
    let body = {
        let mut b = vec![0x20, 0x00, 0x40];
        uleb(0, &mut b); // memory.grow (reserved byte)
        b.push(0x0b);
        b
    };
    let mut mem_payload = Vec::new();
    uleb(1, &mut mem_payload);
    mem_payload.push(0x01); // has_max
    uleb(1, &mut mem_payload); // min
    uleb(2, &mut mem_payload); // max

    let bytes = ModuleBuilder::new()
        .section(1, vec_payload(&[func_type(&[I32], &[I32])]))
        .section(3, vec_payload(&[{
            let mut v = Vec::new();
            uleb(0, &mut v);
            v
        }]))
        .section(5, mem_payload)
        .section(7, vec_payload(&[export_entry("grow", 0, 0)]))
        .section(10, vec_payload(&[code_entry(&[], &body)]))
        .build();

    let mut instance = instantiate(&bytes);
    // delta=0 is idempotent and reports the current page count.
    assert_eq!(call(&mut instance, "grow", &[Value::I32(0)]).unwrap(), vec![Value::I32(1)]);
    // Growing by one more page succeeds, reporting the prior count.
    assert_eq!(call(&mut instance, "grow", &[Value::I32(1)]).unwrap(), vec![Value::I32(1)]);
    // Now at the cap; any further growth fails with -1, leaving size unchanged.
    assert_eq!(call(&mut instance, "grow", &[Value::I32(1)]).unwrap(), vec![Value::I32(-1)]);
    assert_eq!(call(&mut instance, "grow", &[Value::I32(0)]).unwrap(), vec![Value::I32(2)]);
}

#[test]
fn f32_reinterpret_round_trips_through_i32() {
    // local.get 0 (f32) -> i32.reinterpret_f32 -> f32.reinterpret_i32 -> end
    let body = [0x20, 0x00, 0xbc, 0xbe, 0x0b];

    let bytes = ModuleBuilder::new()
        .section(1, vec_payload(&[func_type(&[F32], &[F32])]))
        .section(3, vec_payload(&[{
            let mut v = Vec::new();
            uleb(0, &mut v);
            v
        }]))
        .section(7, vec_payload(&[export_entry("roundtrip", 0, 0)]))
        .section(10, vec_payload(&[code_entry(&[], &body)]))
        .build();

    let mut instance = instantiate(&bytes);
    let results = call(&mut instance, "roundtrip", &[Value::F32(1.5)]).unwrap();
    assert_eq!(results, vec![Value::F32(1.5)]);
}

#[test]
fn unbounded_recursion_exhausts_call_stack() {
    let body = [0x10, 0x00, 0x00, 0x0b]; // call 0 (self); unreachable (never reached); end
    let bytes = ModuleBuilder::new()
        .section(1, vec_payload(&[func_type(&[], &[])]))
        .section(3, vec_payload(&[{
            let mut v = Vec::new();
            uleb(0, &mut v);
            v
        }]))
        .section(7, vec_payload(&[export_entry("loop_forever", 0, 0)]))
        .section(10, vec_payload(&[code_entry(&[], &body)]))
        .build();

    let mut instance = instantiate(&bytes);
    let err = call(&mut instance, "loop_forever", &[]).unwrap_err();
    assert_eq!(err, "call stack exhausted");
}

#[test]
fn select_picks_first_operand_when_condition_nonzero() {
    let body = [
        0x41, 0x07, // i32.const 7
        0x41, 0x2a, // i32.const 42
        0x20, 0x00, // local.get 0 (condition)
        0x1b, // select
        0x0b,
    ];
    let bytes = ModuleBuilder::new()
        .section(1, vec_payload(&[func_type(&[I32], &[I32])]))
        .section(3, vec_payload(&[{
            let mut v = Vec::new();
            uleb(0, &mut v);
            v
        }]))
        .section(7, vec_payload(&[export_entry("pick", 0, 0)]))
        .section(10, vec_payload(&[code_entry(&[], &body)]))
        .build();

    let mut instance = instantiate(&bytes);
    assert_eq!(
        call(&mut instance, "pick", &[Value::I32(1)]).unwrap(),
        vec![Value::I32(7)]
    );
    assert_eq!(
        call(&mut instance, "pick", &[Value::I32(0)]).unwrap(),
        vec![Value::I32(42)]
    );
}

#[test]
fn i32_extend8_s_sign_extends_from_the_low_byte() {
    let body = [0x20, 0x00, 0xc0, 0x0b]; // local.get 0; i32.extend8_s; end
    let bytes = ModuleBuilder::new()
        .section(1, vec_payload(&[func_type(&[I32], &[I32])]))
        .section(3, vec_payload(&[{
            let mut v = Vec::new();
            uleb(0, &mut v);
            v
        }]))
        .section(7, vec_payload(&[export_entry("ext8", 0, 0)]))
        .section(10, vec_payload(&[code_entry(&[], &body)]))
        .build();

    let mut instance = instantiate(&bytes);
    assert_eq!(
        call(&mut instance, "ext8", &[Value::I32(0xff)]).unwrap(),
        vec![Value::I32(-1)]
    );
    assert_eq!(
        call(&mut instance, "ext8", &[Value::I32(0x7f)]).unwrap(),
        vec![Value::I32(127)]
    );
}

#[rstest]
#[case::div_s(0x6d)]
#[case::div_u(0x6e)]
#[case::rem_s(0x6f)]
#[case::rem_u(0x70)]
fn i32_division_family_traps_on_zero_divisor(#[case] opcode: u8) {
    let body = [0x20, 0x00, 0x20, 0x01, opcode, 0x0b];
    let bytes = ModuleBuilder::new()
        .section(1, vec_payload(&[func_type(&[I32, I32], &[I32])]))
        .section(3, vec_payload(&[{
            let mut v = Vec::new();
            uleb(0, &mut v);
            v
        }]))
        .section(7, vec_payload(&[export_entry("op", 0, 0)]))
        .section(10, vec_payload(&[code_entry(&[], &body)]))
        .build();

    let mut instance = instantiate(&bytes);
    let err = call(&mut instance, "op", &[Value::I32(1), Value::I32(0)]).unwrap_err();
    assert_eq!(err, "integer divide by zero");
}
