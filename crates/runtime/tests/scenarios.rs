//! End-to-end scenarios: hand-assembled programs run through the real
//! assemble → execute pipeline, exercising the concrete walkthroughs this
//! core's data model and dispatch loop are meant to support. `encode.rs`'s
//! own unit tests already cover length consistency, `eqv?` constant-pool
//! dedup, and fusion transparency at the instruction level, so these focus
//! on whole programs instead.
//!
//! `svm_core::Primitive::call` has no heap access, so the arithmetic
//! primitives these scenarios need are backed by a small prebuilt
//! value↔`Ref` table built directly against the VM's heap before any
//! bytecode runs, rather than allocating at call time.

use std::collections::HashMap;
use std::rc::Rc;

use svm_core::{Arity, Cell, Heap, Operator, Primitive, PrimitiveError, Ref};
use svm_runtime::asm::{encode, Instr, LabelId, Program, Target};
use svm_runtime::{apply, EvalError, RefReg, Reg, Vm, VmConfig};

fn new_vm(gc_block: usize) -> Vm {
    Vm::new(VmConfig { gc_block, ..VmConfig::default() }).expect("vm construction")
}

/// A prebuilt, immutable `i64 <-> Ref` table for test-only primitives.
/// `gc_block` on the owning `Vm` must stay above the test's total
/// allocation count so the heap never sweeps mid-run — a sweep would be
/// free to reclaim any of these cells the live stacks aren't holding onto
/// at that instant, silently invalidating the table.
#[derive(Debug)]
struct NumTable {
    value_to_ref: HashMap<i64, Ref>,
    ref_to_value: HashMap<Ref, i64>,
}

impl NumTable {
    fn build(heap: &mut Heap, range: std::ops::RangeInclusive<i64>) -> Rc<NumTable> {
        let mut value_to_ref = HashMap::new();
        let mut ref_to_value = HashMap::new();
        for n in range {
            let r = heap.alloc(Cell::Fixnum(n), &[]).expect("prebuilt fixnum allocation");
            value_to_ref.insert(n, r);
            ref_to_value.insert(r, n);
        }
        Rc::new(NumTable { value_to_ref, ref_to_value })
    }

    fn value_of(&self, r: Ref) -> Result<i64, PrimitiveError> {
        self.ref_to_value.get(&r).copied().ok_or(PrimitiveError::WrongType {
            expected: "fixnum within this test's prebuilt range",
            got: "ref",
        })
    }

    fn ref_of(&self, n: i64) -> Result<Ref, PrimitiveError> {
        self.value_to_ref.get(&n).copied().ok_or_else(|| {
            PrimitiveError::Custom(format!("{n} falls outside this test's prebuilt range"))
        })
    }
}

#[derive(Debug)]
struct AddPrim(Rc<NumTable>);

impl Primitive for AddPrim {
    fn name(&self) -> &'static str {
        "+"
    }
    fn arity(&self) -> Arity {
        Arity::AtLeast(0)
    }
    fn call(&self, args: &mut dyn Iterator<Item = Ref>) -> Result<Ref, PrimitiveError> {
        let mut sum = 0i64;
        for a in args {
            sum += self.0.value_of(a)?;
        }
        self.0.ref_of(sum)
    }
}

#[derive(Debug)]
struct SubPrim(Rc<NumTable>);

impl Primitive for SubPrim {
    fn name(&self) -> &'static str {
        "-"
    }
    fn arity(&self) -> Arity {
        Arity::AtLeast(1)
    }
    fn call(&self, args: &mut dyn Iterator<Item = Ref>) -> Result<Ref, PrimitiveError> {
        let values = args.map(|a| self.0.value_of(a)).collect::<Result<Vec<_>, _>>()?;
        let (first, rest) = values
            .split_first()
            .ok_or(PrimitiveError::ArityMismatch { name: "-", argc: 0 })?;
        let result = if rest.is_empty() {
            -first
        } else {
            rest.iter().fold(*first, |acc, x| acc - x)
        };
        self.0.ref_of(result)
    }
}

#[derive(Debug)]
struct NumEqPrim {
    table: Rc<NumTable>,
    true_ref: Ref,
    false_ref: Ref,
}

impl Primitive for NumEqPrim {
    fn name(&self) -> &'static str {
        "="
    }
    fn arity(&self) -> Arity {
        Arity::AtLeast(1)
    }
    fn call(&self, args: &mut dyn Iterator<Item = Ref>) -> Result<Ref, PrimitiveError> {
        let values = args.map(|a| self.table.value_of(a)).collect::<Result<Vec<_>, _>>()?;
        let all_eq = values.windows(2).all(|w| w[0] == w[1]);
        Ok(if all_eq { self.true_ref } else { self.false_ref })
    }
}

#[test]
fn fixnum_literal_evaluates_to_itself() {
    let mut vm = new_vm(256);
    let forty_two = vm.heap.alloc(Cell::Fixnum(42), &[]).unwrap();
    let program = Program::new().instr(Instr::AssignConst(forty_two)).instr(Instr::Rtc);
    let code = encode(&mut vm.heap, &[], &program).unwrap();

    let env = vm.global_env;
    assert_eq!(vm.run(code, env).unwrap(), forty_two);
}

#[test]
fn tail_recursive_countdown_does_not_grow_the_stacks() {
    let mut vm = new_vm(50_000);
    let table = NumTable::build(&mut vm.heap, 0..=10_000);
    let zero = table.ref_of(0).unwrap();
    let one = table.ref_of(1).unwrap();
    let n_start = table.ref_of(10_000).unwrap();
    let true_ref = vm.heap.alloc(Cell::Boolean(true), &[]).unwrap();
    let false_ref = vm.heap.alloc(Cell::Boolean(false), &[]).unwrap();
    let eq_prim: Rc<dyn Primitive> =
        Rc::new(NumEqPrim { table: table.clone(), true_ref, false_ref });
    let eq_prim = vm.heap.alloc(Cell::Primitive(eq_prim), &[]).unwrap();
    let sub_prim: Rc<dyn Primitive> = Rc::new(SubPrim(table.clone()));
    let sub_prim = vm.heap.alloc(Cell::Primitive(sub_prim), &[]).unwrap();
    let loop_sym = vm.intern("loop").unwrap();
    let done_sym = vm.intern("done").unwrap();

    let continue_label = LabelId(0);
    let body = Program::new()
        .instr(Instr::ZeroArgc)
        .instr(Instr::Fref { dest: RefReg::Val, depth: 0, index: 0 })
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(zero))
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(eq_prim))
        .instr(Instr::Apply)
        .instr(Instr::PopArgs)
        .instr(Instr::TestFalse)
        .instr(Instr::Branch(Target::Label(continue_label)))
        .instr(Instr::AssignConst(done_sym))
        .instr(Instr::Rtc)
        .label(continue_label)
        .instr(Instr::ZeroArgc)
        .instr(Instr::Fref { dest: RefReg::Val, depth: 0, index: 0 })
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(one))
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(sub_prim))
        .instr(Instr::Apply)
        .instr(Instr::PopArgs)
        .instr(Instr::ZeroArgc)
        .instr(Instr::PushArg)
        .instr(Instr::Gref(loop_sym))
        .instr(Instr::ApplyCont);

    let driver = Program::new()
        .instr(Instr::MakeClosure { body, params: vm.null, numv: 1, rest: false })
        .instr(Instr::Gdef(loop_sym))
        .instr(Instr::ZeroArgc)
        .instr(Instr::AssignConst(n_start))
        .instr(Instr::PushArg)
        .instr(Instr::Gref(loop_sym))
        .instr(Instr::ApplyCont);

    let code = encode(&mut vm.heap, &[], &driver).unwrap();

    let reg_depth_before = vm.reg_stack.depth();
    let int_depth_before = vm.int_stack.depth();
    let env = vm.global_env;
    let result = vm.run(code, env).unwrap();

    assert_eq!(result, done_sym);
    // Every recursive step is a true tail call through `apply-cont`, so no
    // call frame is ever pushed across all ten thousand iterations.
    assert_eq!(vm.reg_stack.depth(), reg_depth_before);
    assert_eq!(vm.int_stack.depth(), int_depth_before);
}

#[test]
fn curried_closures_reach_free_variables_through_parent_frames() {
    let mut vm = new_vm(2_000);
    let table = NumTable::build(&mut vm.heap, 0..=20);
    let three = table.ref_of(3).unwrap();
    let four = table.ref_of(4).unwrap();
    let add_prim: Rc<dyn Primitive> = Rc::new(AddPrim(table.clone()));
    let add_prim = vm.heap.alloc(Cell::Primitive(add_prim), &[]).unwrap();

    // ((lambda (x) (lambda (y) (+ x y))) 3) 4
    let inner_body = Program::new()
        .instr(Instr::ZeroArgc)
        .instr(Instr::Fref { dest: RefReg::Val, depth: 1, index: 0 }) // x, the grandparent frame
        .instr(Instr::PushArg)
        .instr(Instr::Fref { dest: RefReg::Val, depth: 0, index: 0 }) // y, the local frame
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(add_prim))
        .instr(Instr::Apply)
        .instr(Instr::PopArgs)
        .instr(Instr::Rtc);

    let outer_body = Program::new()
        .instr(Instr::MakeClosure { body: inner_body, params: vm.null, numv: 1, rest: false })
        .instr(Instr::Rtc);

    let driver = Program::new()
        .instr(Instr::MakeClosure { body: outer_body, params: vm.null, numv: 1, rest: false })
        .instr(Instr::Save(Reg::Val))
        .instr(Instr::ZeroArgc)
        .instr(Instr::AssignConst(three))
        .instr(Instr::PushArg)
        .instr(Instr::Restore(Reg::Val))
        .instr(Instr::Apply)
        .instr(Instr::Save(Reg::Val))
        .instr(Instr::ZeroArgc)
        .instr(Instr::AssignConst(four))
        .instr(Instr::PushArg)
        .instr(Instr::Restore(Reg::Val))
        .instr(Instr::Apply)
        .instr(Instr::Rtc);

    let code = encode(&mut vm.heap, &[], &driver).unwrap();
    let env = vm.global_env;
    let result = vm.run(code, env).unwrap();

    assert_eq!(result, table.ref_of(7).unwrap());
}

#[test]
fn callcc_escape_discards_the_pending_computation() {
    let mut vm = new_vm(2_000);
    let table = NumTable::build(&mut vm.heap, 0..=200);
    let one = table.ref_of(1).unwrap();
    let ten = table.ref_of(10).unwrap();
    let add_prim: Rc<dyn Primitive> = Rc::new(AddPrim(table.clone()));
    let add_prim = vm.heap.alloc(Cell::Primitive(add_prim), &[]).unwrap();
    let callcc_op = vm.heap.alloc(Cell::Operator(Operator::CallCc), &[]).unwrap();

    // (lambda (k) (k 10)) — never returns normally, always escapes.
    let escape_body = Program::new()
        .instr(Instr::ZeroArgc)
        .instr(Instr::AssignConst(ten))
        .instr(Instr::PushArg)
        .instr(Instr::Fref { dest: RefReg::Val, depth: 0, index: 0 })
        .instr(Instr::ApplyCont);

    // (+ 1 (call/cc (lambda (k) (k 10))))
    let driver = Program::new()
        .instr(Instr::ZeroArgc)
        .instr(Instr::AssignConst(one))
        .instr(Instr::PushArg)
        .instr(Instr::Save(Reg::Argc))
        .instr(Instr::MakeClosure { body: escape_body, params: vm.null, numv: 1, rest: false })
        .instr(Instr::ZeroArgc)
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(callcc_op))
        .instr(Instr::Apply)
        .instr(Instr::Restore(Reg::Argc))
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(add_prim))
        .instr(Instr::Apply)
        .instr(Instr::PopArgs)
        .instr(Instr::Rtc);

    let code = encode(&mut vm.heap, &[], &driver).unwrap();
    let env = vm.global_env;
    let result = vm.run(code, env).unwrap();

    assert_eq!(result, table.ref_of(11).unwrap());
}

#[test]
fn callcc_without_invoking_the_continuation_returns_normally() {
    let mut vm = new_vm(2_000);
    let table = NumTable::build(&mut vm.heap, 0..=200);
    let one = table.ref_of(1).unwrap();
    let ninety_nine = table.ref_of(99).unwrap();
    let add_prim: Rc<dyn Primitive> = Rc::new(AddPrim(table.clone()));
    let add_prim = vm.heap.alloc(Cell::Primitive(add_prim), &[]).unwrap();
    let callcc_op = vm.heap.alloc(Cell::Operator(Operator::CallCc), &[]).unwrap();

    // (lambda (k) 99) — ignores k and returns through the same frame call/cc pushed.
    let escape_body = Program::new().instr(Instr::AssignConst(ninety_nine)).instr(Instr::Rtc);

    let driver = Program::new()
        .instr(Instr::ZeroArgc)
        .instr(Instr::AssignConst(one))
        .instr(Instr::PushArg)
        .instr(Instr::Save(Reg::Argc))
        .instr(Instr::MakeClosure { body: escape_body, params: vm.null, numv: 1, rest: false })
        .instr(Instr::ZeroArgc)
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(callcc_op))
        .instr(Instr::Apply)
        .instr(Instr::Restore(Reg::Argc))
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(add_prim))
        .instr(Instr::Apply)
        .instr(Instr::PopArgs)
        .instr(Instr::Rtc);

    let code = encode(&mut vm.heap, &[], &driver).unwrap();
    let env = vm.global_env;
    let result = vm.run(code, env).unwrap();

    assert_eq!(result, table.ref_of(100).unwrap());
}

#[test]
fn captured_continuation_can_be_invoked_more_than_once() {
    let mut vm = new_vm(2_000);
    let table = NumTable::build(&mut vm.heap, 0..=200);
    let callcc_op = vm.heap.alloc(Cell::Operator(Operator::CallCc), &[]).unwrap();
    let k_sym = vm.intern("k").unwrap();

    // (call/cc (lambda (k) k)) — a normal return that hands back the
    // continuation itself as a first-class value.
    let capture_body =
        Program::new().instr(Instr::Fref { dest: RefReg::Val, depth: 0, index: 0 }).instr(Instr::Rtc);
    let capture_driver = Program::new()
        .instr(Instr::MakeClosure { body: capture_body, params: vm.null, numv: 1, rest: false })
        .instr(Instr::ZeroArgc)
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(callcc_op))
        .instr(Instr::Apply)
        .instr(Instr::Gdef(k_sym))
        .instr(Instr::Rtc);
    let capture_code = encode(&mut vm.heap, &[], &capture_driver).unwrap();

    let env = vm.global_env;
    let captured = vm.run(capture_code, env).unwrap();
    assert!(matches!(vm.heap.get(captured).unwrap(), Cell::Continuation(_)));

    let forty_two = table.ref_of(42).unwrap();
    let invoke_42 = Program::new()
        .instr(Instr::ZeroArgc)
        .instr(Instr::AssignConst(forty_two))
        .instr(Instr::PushArg)
        .instr(Instr::Gref(k_sym))
        .instr(Instr::ApplyCont);
    let invoke_42 = encode(&mut vm.heap, &[], &invoke_42).unwrap();
    let env = vm.global_env;
    let first = vm.run(invoke_42, env).unwrap();

    let hundred = table.ref_of(100).unwrap();
    let invoke_100 = Program::new()
        .instr(Instr::ZeroArgc)
        .instr(Instr::AssignConst(hundred))
        .instr(Instr::PushArg)
        .instr(Instr::Gref(k_sym))
        .instr(Instr::ApplyCont);
    let invoke_100 = encode(&mut vm.heap, &[], &invoke_100).unwrap();
    let env = vm.global_env;
    let second = vm.run(invoke_100, env).unwrap();

    assert_eq!(first, forty_two);
    assert_eq!(second, hundred);
}

#[test]
fn map_applies_a_primitive_pairwise_across_two_lists() {
    let mut vm = new_vm(2_000);
    let table = NumTable::build(&mut vm.heap, 0..=200);
    let add_prim: Rc<dyn Primitive> = Rc::new(AddPrim(table.clone()));
    let add_prim = vm.heap.alloc(Cell::Primitive(add_prim), &[]).unwrap();
    let map_op = vm.heap.alloc(Cell::Operator(Operator::Map), &[]).unwrap();

    let firsts: Vec<Ref> = [1, 2, 3].iter().map(|&n| table.ref_of(n).unwrap()).collect();
    let seconds: Vec<Ref> = [10, 20, 30].iter().map(|&n| table.ref_of(n).unwrap()).collect();
    let list1 = apply::vec_to_list(&mut vm.heap, &[], vm.null, &firsts).unwrap();
    let list2 = apply::vec_to_list(&mut vm.heap, &[], vm.null, &seconds).unwrap();

    let driver = Program::new()
        .instr(Instr::ZeroArgc)
        .instr(Instr::AssignConst(add_prim))
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(list1))
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(list2))
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(map_op))
        .instr(Instr::Apply)
        .instr(Instr::Rtc);

    let code = encode(&mut vm.heap, &[], &driver).unwrap();
    let env = vm.global_env;
    let result = vm.run(code, env).unwrap();

    let values = apply::list_to_vec(&vm.heap, vm.null, result).unwrap();
    let expected: Vec<Ref> = [11, 22, 33].iter().map(|&n| table.ref_of(n).unwrap()).collect();
    assert_eq!(values, expected);
    // `map` always conses a fresh result list, never aliasing an input.
    assert_ne!(result, list1);
    assert_ne!(result, list2);
}

#[test]
fn delay_force_memoizes_and_only_evaluates_once() {
    let mut vm = new_vm(2_000);
    let table = NumTable::build(&mut vm.heap, 0..=10);
    let zero = table.ref_of(0).unwrap();
    let one = table.ref_of(1).unwrap();
    let add_prim: Rc<dyn Primitive> = Rc::new(AddPrim(table.clone()));
    let add_prim = vm.heap.alloc(Cell::Primitive(add_prim), &[]).unwrap();
    let force_op = vm.heap.alloc(Cell::Operator(Operator::Force), &[]).unwrap();
    let c_sym = vm.intern("c").unwrap();
    let p_sym = vm.intern("p").unwrap();
    match vm.heap.get_mut(c_sym).unwrap() {
        Cell::Symbol(s) => s.binding = zero,
        _ => panic!("expected symbol cell"),
    }

    // (delay (begin (set! c (+ c 1)) c))
    let promise_body = Program::new()
        .instr(Instr::ZeroArgc)
        .instr(Instr::Gref(c_sym))
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(one))
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(add_prim))
        .instr(Instr::Apply)
        .instr(Instr::PopArgs)
        .instr(Instr::Gset(c_sym))
        .instr(Instr::Rtc);

    // (let ((p (delay ...))) (list (force p) (force p)))
    let driver = Program::new()
        .instr(Instr::Delay(promise_body))
        .instr(Instr::Gdef(p_sym))
        .instr(Instr::ZeroArgc)
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(force_op))
        .instr(Instr::Apply)
        .instr(Instr::Save(Reg::Val))
        .instr(Instr::ZeroArgc)
        .instr(Instr::Gref(p_sym))
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(force_op))
        .instr(Instr::Apply)
        .instr(Instr::Rtc);

    let code = encode(&mut vm.heap, &[], &driver).unwrap();
    let env = vm.global_env;
    let second = vm.run(code, env).unwrap();
    let first = vm.reg_stack.pop().unwrap();

    assert_eq!(first, one);
    assert_eq!(second, one);
    match vm.heap.get(c_sym).unwrap() {
        Cell::Symbol(s) => assert_eq!(s.binding, one),
        _ => panic!("expected symbol cell"),
    }
}

#[test]
fn corrupted_branch_target_errors_instead_of_panicking() {
    let mut vm = new_vm(256);
    let after = LabelId(0);
    let program = Program::new()
        .instr(Instr::Goto(Target::Label(after)))
        .instr(Instr::ZeroArgc)
        .label(after)
        .instr(Instr::Rtc);
    let code_ref = encode(&mut vm.heap, &[], &program).unwrap();

    match vm.heap.get_mut(code_ref).unwrap() {
        Cell::Code(c) => {
            let bytes = Rc::get_mut(&mut c.bytecode).expect("sole owner right after assembly");
            // `goto`'s two-byte target follows its opcode byte; point it
            // far past the end of the buffer.
            bytes[1] = 0xFF;
            bytes[2] = 0xFF;
        }
        _ => panic!("expected code cell"),
    }

    let env = vm.global_env;
    let err = vm.run(code_ref, env).unwrap_err();
    assert!(matches!(err, EvalError::BadOpcode(_)));
}

#[test]
fn force_inside_a_non_tail_call_does_not_disturb_the_caller_s_frame() {
    // (+ 1 (g 0)) where (g _) = (force p) and p = (delay 99).
    //
    // The non-tail call into `g` pushes a call frame before control
    // transfers into its body, so `int_stack` already holds one entry by
    // the time `g`'s own body reaches `force`. `force` drives the promise
    // to completion via a nested `run` call of its own; that nested call
    // must return once *it* unwinds back to the depth it started at, not
    // once `int_stack` empties out globally — otherwise it would pop the
    // frame `g`'s own `rtc` still needs to get back to the driver.
    let mut vm = new_vm(2_000);
    let table = NumTable::build(&mut vm.heap, 0..=200);
    let zero = table.ref_of(0).unwrap();
    let one = table.ref_of(1).unwrap();
    let add_prim: Rc<dyn Primitive> = Rc::new(AddPrim(table.clone()));
    let add_prim = vm.heap.alloc(Cell::Primitive(add_prim), &[]).unwrap();
    let force_op = vm.heap.alloc(Cell::Operator(Operator::Force), &[]).unwrap();
    let p_sym = vm.intern("p").unwrap();
    let g_sym = vm.intern("g").unwrap();
    let ninety_nine = table.ref_of(99).unwrap();

    let promise_body = Program::new().instr(Instr::AssignConst(ninety_nine)).instr(Instr::Rtc);

    // (lambda (_) (force p))
    let g_body = Program::new()
        .instr(Instr::ZeroArgc)
        .instr(Instr::Gref(p_sym))
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(force_op))
        .instr(Instr::Apply)
        .instr(Instr::Rtc);

    let driver = Program::new()
        .instr(Instr::Delay(promise_body))
        .instr(Instr::Gdef(p_sym))
        .instr(Instr::MakeClosure { body: g_body, params: vm.null, numv: 1, rest: false })
        .instr(Instr::Gdef(g_sym))
        .instr(Instr::ZeroArgc)
        .instr(Instr::AssignConst(one))
        .instr(Instr::Save(Reg::Val))
        .instr(Instr::ZeroArgc)
        .instr(Instr::AssignConst(zero))
        .instr(Instr::PushArg)
        .instr(Instr::Gref(g_sym))
        .instr(Instr::Apply) // non-tail: pushes a call frame before entering g
        .instr(Instr::PushArg)
        .instr(Instr::Restore(Reg::Val))
        .instr(Instr::PushArg)
        .instr(Instr::AssignConst(add_prim))
        .instr(Instr::Apply)
        .instr(Instr::PopArgs)
        .instr(Instr::Rtc);

    let code = encode(&mut vm.heap, &[], &driver).unwrap();
    let reg_depth_before = vm.reg_stack.depth();
    let int_depth_before = vm.int_stack.depth();
    let env = vm.global_env;
    let result = vm.run(code, env).unwrap();

    assert_eq!(result, table.ref_of(100).unwrap());
    assert_eq!(vm.reg_stack.depth(), reg_depth_before);
    assert_eq!(vm.int_stack.depth(), int_depth_before);
}
