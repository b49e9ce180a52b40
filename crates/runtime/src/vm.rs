//! The register-based bytecode VM: the dispatch loop, its register file,
//! and the three explicit stacks it shares with the assembled bytecode.
//!
//! Grounded on `examples/original_source/src/eval/bceval.cxx`'s `bceval()`
//! main loop (`start_bceval`/`start_apply`/`start_apply_cont` reused as the
//! tail-call restart points) and the instruction semantics in `eval.hxx`.
//! This implementation drops the outer tree-walking interpreter the
//! original cooperates with (`next`/`EVAL_SEQUENCE`-style handoff): every
//! closure body is compiled bytecode, `rte` assembles identically to `rtc`
//! (see `asm::encode`), and `map`/`for-each`/`force` drive their callee
//! through a native recursive helper rather than hand-assembled
//! `map_code`/`for_code`/`fep_code` library routines (see `DESIGN.md`).

use crate::apply::{self, Callee};
use crate::code::{Code, Opcode, Reg, RefReg, OPCODE_LEN};
use crate::config::VmConfig;
use crate::continuation;
use crate::env;
use crate::error::EvalError;
use crate::primitive::ArgIter;
use crate::promise::{self, ForceOutcome};
use std::rc::Rc;
use svm_core::{
    ArgStack, Cell, Closure, Environment, Frame, Heap, IntStack, Ref, RegStack, RootSource,
    SymbolTable,
};

/// The VM's scalar registers, snapshotted by value so they can serve as a
/// GC root without holding any borrow of the `Vm` they came from.
struct RegRoots([Ref; 8]);

impl RootSource for RegRoots {
    fn roots(&self, out: &mut Vec<Ref>) {
        out.extend_from_slice(&self.0);
    }
}

/// What `apply`/`apply-cont` dispatch settled on, reported back to the
/// dispatch loop so it can decide whether to reload the current code cell
/// or fall straight through to the next instruction.
enum ApplyOutcome {
    /// `env`/`unev` now name a fresh call; `pc` should reset to zero.
    Entered,
    /// Handled without transferring control (a primitive call, a cached
    /// `force`, a completed `map`/`for-each`): `val` holds the result and
    /// the current code cell keeps running from where it left off.
    Inline,
    /// A captured continuation was invoked: every stack was just replaced
    /// wholesale. Resuming means popping the frame that was live when it
    /// was captured, exactly like `rtc`.
    ContinuationInvoked,
}

pub struct Vm {
    pub heap: Heap,
    pub symtab: SymbolTable,
    pub reg_stack: RegStack,
    pub arg_stack: ArgStack,
    pub int_stack: IntStack,

    pub val: Ref,
    pub aux: Ref,
    pub env: Ref,
    pub unev: Ref,
    pub exp: Ref,
    /// Vestigial per spec.md's own accounting: never an `assign`/`fref`
    /// operand, only `save-cont`/`restore-cont` and `branch-cont`/
    /// `goto-cont`'s implicit target.
    pub cont: i32,

    /// The one canonical null cell — `null?` is `Ref` equality against
    /// this, never a freshly allocated `Cell::Null`.
    pub null: Ref,
    pub unspecified: Ref,
    pub global_env: Ref,

    /// Set by `test-true`/`test-false`, read by `branch`/`branch-cont`.
    test_flag: bool,

    config: VmConfig,
}

impl Vm {
    pub fn new(config: VmConfig) -> Result<Self, EvalError> {
        let mut heap = Heap::new(config.gc_block);
        let null = heap.alloc(Cell::Null, &[])?;
        let unspecified = heap.alloc(Cell::Unspecified, &[])?;
        let global_env = heap.alloc(
            Cell::Environment(Environment { frame: Frame::new(vec![], false, null), parent: None }),
            &[],
        )?;
        Ok(Vm {
            heap,
            symtab: SymbolTable::new(),
            reg_stack: RegStack::new(config.reg_stack_capacity),
            arg_stack: ArgStack::new(config.arg_stack_capacity),
            int_stack: IntStack::new(config.int_stack_capacity),
            val: null,
            aux: null,
            env: global_env,
            unev: null,
            exp: null,
            cont: 0,
            null,
            unspecified,
            global_env,
            test_flag: false,
            config,
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Intern `name`, threading this VM's canonical `null` through so a
    /// freshly created symbol's plist never allocates a second null cell.
    pub fn intern(&mut self, name: &str) -> Result<Ref, EvalError> {
        let reg_roots = self.reg_roots();
        let roots: [&dyn RootSource; 4] =
            [&reg_roots, &self.reg_stack, &self.arg_stack, &self.symtab];
        Ok(self.symtab.intern(&mut self.heap, name, self.null, &roots)?)
    }

    fn reg_roots(&self) -> RegRoots {
        RegRoots([
            self.val,
            self.aux,
            self.env,
            self.unev,
            self.exp,
            self.null,
            self.unspecified,
            self.global_env,
        ])
    }

    fn alloc(&mut self, cell: Cell) -> Result<Ref, EvalError> {
        let reg_roots = self.reg_roots();
        let roots: [&dyn RootSource; 4] =
            [&reg_roots, &self.reg_stack, &self.arg_stack, &self.symtab];
        Ok(self.heap.alloc(cell, &roots)?)
    }

    fn load_code(&self, code_ref: Ref) -> Result<(Rc<[u8]>, Rc<[Ref]>), EvalError> {
        match self.heap.get(code_ref)? {
            Cell::Code(c) => Ok((c.bytecode.clone(), c.constants.clone())),
            other => Err(EvalError::WrongType { expected: "code", got: other.kind_name() }),
        }
    }

    fn constant(&self, constants: &[Ref], idx: u8) -> Result<Ref, EvalError> {
        constants.get(idx as usize).copied().ok_or(EvalError::BadConstantIndex {
            index: idx as usize,
            pool_size: constants.len(),
        })
    }

    fn reg_value(&self, r: Reg) -> Result<Ref, EvalError> {
        match r {
            Reg::Val => Ok(self.val),
            Reg::Aux => Ok(self.aux),
            Reg::Env => Ok(self.env),
            Reg::Unev => Ok(self.unev),
            Reg::Exp => Ok(self.exp),
            Reg::Argc => Err(EvalError::WrongType { expected: "ref register", got: "argc" }),
        }
    }

    fn set_ref_reg(&mut self, r: RefReg, value: Ref) {
        match r {
            RefReg::Val => self.val = value,
            RefReg::Aux => self.aux = value,
            RefReg::Env => self.env = value,
            RefReg::Unev => self.unev = value,
            RefReg::Exp => self.exp = value,
        }
    }

    fn push_call_frame(&mut self, pc: usize) -> Result<(), EvalError> {
        self.reg_stack.push(self.env)?;
        self.reg_stack.push(self.unev)?;
        self.int_stack.push(pc as i32)?;
        Ok(())
    }

    /// Pop the most recent `(env, unev, pc)` frame pushed by a non-tail
    /// `apply`, or report there is none left for *this* `run` invocation to
    /// pop. `floor` is the `int_stack` depth this invocation started at —
    /// comparing against that instead of a global zero is what lets `run`
    /// recurse (`force`/`map`/`for-each` driving a callee to completion)
    /// without a nested invocation mistaking its outer caller's frames for
    /// its own and popping past where it started.
    fn pop_call_frame(&mut self, floor: usize) -> Result<Option<(Ref, Ref, usize)>, EvalError> {
        if self.int_stack.depth() <= floor {
            return Ok(None);
        }
        let pc = self.int_stack.pop()? as usize;
        let unev = self.reg_stack.pop()?;
        let env = self.reg_stack.pop()?;
        Ok(Some((env, unev, pc)))
    }

    /// Run `code` with `env` as the initial lexical environment until it
    /// returns (`rtc`, or this invocation's call-frame stack empties back
    /// down to the depth it started at, after a `rtc`/continuation-invocation
    /// chain), yielding the final `val`.
    ///
    /// Re-entrant: `force`/`map`/`for-each` call this recursively to drive
    /// a callee to completion and get its value back, while an ordinary
    /// tail call within one `run` just loops in place (no Rust recursion,
    /// so arbitrarily long tail recursion does not grow the Rust stack). Each
    /// invocation remembers its own entry `int_stack` depth as `floor`, so a
    /// nested `run` returns to its own Rust caller once it unwinds back to
    /// that depth, never past it into frames an outer, still-suspended `run`
    /// pushed before recursing in.
    pub fn run(&mut self, code: Ref, env: Ref) -> Result<Ref, EvalError> {
        self.env = env;
        self.unev = code;
        let floor = self.int_stack.depth();
        let mut pc: usize = 0;
        let (mut bytecode, mut constants) = self.load_code(self.unev)?;

        loop {
            if pc >= bytecode.len() {
                return Err(EvalError::BadOpcode(0));
            }
            let op_byte = bytecode[pc];
            let opcode = Opcode::from_byte(op_byte).ok_or(EvalError::BadOpcode(op_byte))?;
            let len = OPCODE_LEN[op_byte as usize] as usize;
            if pc + len > bytecode.len() {
                return Err(EvalError::BadOpcode(op_byte));
            }
            let operand = bytecode[pc + 1..pc + len].to_vec();
            pc += len;

            #[cfg(feature = "trace-vm")]
            tracing::trace!(?opcode, pc = pc - len, "dispatch");

            match opcode {
                Opcode::SaveVal => self.reg_stack.push(self.val)?,
                Opcode::SaveAux => self.reg_stack.push(self.aux)?,
                Opcode::SaveEnv => self.reg_stack.push(self.env)?,
                Opcode::SaveUnev => self.reg_stack.push(self.unev)?,
                Opcode::SaveExp => self.reg_stack.push(self.exp)?,
                Opcode::RestoreVal => self.val = self.reg_stack.pop()?,
                Opcode::RestoreAux => self.aux = self.reg_stack.pop()?,
                Opcode::RestoreEnv => self.env = self.reg_stack.pop()?,
                Opcode::RestoreUnev => {
                    self.unev = self.reg_stack.pop()?;
                    let (bc, co) = self.load_code(self.unev)?;
                    bytecode = bc;
                    constants = co;
                }
                Opcode::RestoreExp => self.exp = self.reg_stack.pop()?,
                Opcode::SaveArgc => self.int_stack.push(self.arg_stack.argc() as i32)?,
                Opcode::RestoreArgc => {
                    let n = self.int_stack.pop()?;
                    self.arg_stack.set_argc(n as usize);
                }
                Opcode::SaveCont => self.int_stack.push(self.cont)?,
                Opcode::RestoreCont => self.cont = self.int_stack.pop()?,
                Opcode::ZeroArgc => self.arg_stack.set_argc(0),
                Opcode::PushArg => self.arg_stack.push(self.val)?,
                Opcode::PopArgs => {
                    let n = self.arg_stack.argc();
                    self.arg_stack.drain_call(n)?;
                }

                Opcode::AssignReg => self.val = self.reg_value(Reg::from_index(operand[0])
                    .ok_or(EvalError::BadOpcode(operand[0]))?)?,
                Opcode::AssignObj => self.val = self.constant(&constants, operand[0])?,
                Opcode::Gref => self.do_gref(&constants, operand[0])?,
                Opcode::Gset => self.do_gset(&constants, operand[0])?,
                Opcode::Gdef => self.do_gset(&constants, operand[0])?,
                Opcode::Fref => {
                    let dest = RefReg::from_index(operand[0])
                        .ok_or(EvalError::BadOpcode(operand[0]))?;
                    let v = env::fref(&self.heap, self.env, operand[1], operand[2])?;
                    self.set_ref_reg(dest, v);
                }
                Opcode::Fset => env::fset(&mut self.heap, self.env, operand[0], operand[1], self.val)?,
                Opcode::GetAccess => {
                    let sym = self.constant(&constants, operand[0])?;
                    self.val = env::access_lookup(&self.heap, self.val, sym)?;
                }
                Opcode::SetAccess => {
                    let sym = self.constant(&constants, operand[0])?;
                    env::access_set(&mut self.heap, self.exp, sym, self.val)?;
                }
                Opcode::MakeClosure => {
                    let code_ref = self.constant(&constants, operand[0])?;
                    let params = self.constant(&constants, operand[1])?;
                    let closure = Closure {
                        code: code_ref,
                        env: self.env,
                        params,
                        numv: operand[2],
                        rest: operand[3] != 0,
                    };
                    self.val = self.alloc(Cell::Closure(closure))?;
                }

                Opcode::Apply => {
                    match self.apply_dispatch(false, pc)? {
                        ApplyOutcome::Entered => {
                            pc = 0;
                            let (bc, co) = self.load_code(self.unev)?;
                            bytecode = bc;
                            constants = co;
                        }
                        ApplyOutcome::Inline => {}
                        ApplyOutcome::ContinuationInvoked => {
                            match self.pop_call_frame(floor)? {
                                Some((env, unev, saved_pc)) => {
                                    self.env = env;
                                    self.unev = unev;
                                    pc = saved_pc;
                                    let (bc, co) = self.load_code(self.unev)?;
                                    bytecode = bc;
                                    constants = co;
                                }
                                None => return Ok(self.val),
                            }
                        }
                    }
                }
                Opcode::ApplyCont => match self.apply_dispatch(true, pc)? {
                    ApplyOutcome::Entered => {
                        pc = 0;
                        let (bc, co) = self.load_code(self.unev)?;
                        bytecode = bc;
                        constants = co;
                    }
                    ApplyOutcome::Inline => {}
                    ApplyOutcome::ContinuationInvoked => match self.pop_call_frame(floor)? {
                        Some((env, unev, saved_pc)) => {
                            self.env = env;
                            self.unev = unev;
                            pc = saved_pc;
                            let (bc, co) = self.load_code(self.unev)?;
                            bytecode = bc;
                            constants = co;
                        }
                        None => return Ok(self.val),
                    },
                },

                Opcode::TestTrue => self.set_test_flag(false)?,
                Opcode::TestFalse => self.set_test_flag(true)?,
                Opcode::Branch => {
                    let target = u16::from_le_bytes([operand[0], operand[1]]) as usize;
                    if self.test_flag {
                        pc = target;
                    }
                }
                Opcode::BranchCont => {
                    if self.test_flag {
                        match self.pop_call_frame(floor)? {
                            Some((env, unev, saved_pc)) => {
                                self.env = env;
                                self.unev = unev;
                                pc = saved_pc;
                                let (bc, co) = self.load_code(self.unev)?;
                                bytecode = bc;
                                constants = co;
                            }
                            None => return Ok(self.val),
                        }
                    }
                }
                Opcode::Goto => {
                    let target = u16::from_le_bytes([operand[0], operand[1]]) as usize;
                    pc = target;
                }
                Opcode::GotoCont => match self.pop_call_frame(floor)? {
                    Some((env, unev, saved_pc)) => {
                        self.env = env;
                        self.unev = unev;
                        pc = saved_pc;
                        let (bc, co) = self.load_code(self.unev)?;
                        bytecode = bc;
                        constants = co;
                    }
                    None => return Ok(self.val),
                },

                Opcode::MapInit | Opcode::MapApply | Opcode::MapResult
                | Opcode::ForInit | Opcode::ForApply | Opcode::ForResult => {
                    // Reified as the `map`/`for-each` operator dispatch in
                    // `apply_dispatch` instead; these six opcodes exist for
                    // on-disk compatibility with hand-assembled library
                    // routines this implementation does not emit.
                    return Err(EvalError::BadOpcode(op_byte));
                }

                Opcode::ExtendEnv => {
                    let dest =
                        RefReg::from_index(operand[0]).ok_or(EvalError::BadOpcode(operand[0]))?;
                    let nvars = operand[1] as usize;
                    let vars = self.constant(&constants, operand[2])?;
                    let reg_roots = self.reg_roots();
                    let roots: [&dyn RootSource; 4] =
                        [&reg_roots, &self.reg_stack, &self.arg_stack, &self.symtab];
                    let new_env =
                        env::extend_env(&mut self.heap, &roots, self.env, self.null, nvars, vars)?;
                    self.set_ref_reg(dest, new_env);
                }
                Opcode::Eset => env::eset(&mut self.heap, &self.reg_stack, operand[0], self.val)?,
                Opcode::Delay => {
                    let expr = self.constant(&constants, operand[0])?;
                    let promise = svm_core::Promise { expr: Some(expr), env: self.env, value: None };
                    self.val = self.alloc(Cell::Promise(promise))?;
                }
                Opcode::ForceValue => {
                    // Paired with the force-operator dispatch below; kept
                    // for on-disk compatibility with a hand-assembled
                    // `fep_code` epilogue this implementation never emits.
                    return Err(EvalError::BadOpcode(op_byte));
                }
                Opcode::Rtc => match self.pop_call_frame(floor)? {
                    Some((env, unev, saved_pc)) => {
                        self.env = env;
                        self.unev = unev;
                        pc = saved_pc;
                        let (bc, co) = self.load_code(self.unev)?;
                        bytecode = bc;
                        constants = co;
                    }
                    None => return Ok(self.val),
                },

                // Fused opcodes: the prefix action, then the fold target.
                Opcode::AssignRegPushArg => {
                    self.val = self.reg_value(Reg::from_index(operand[0])
                        .ok_or(EvalError::BadOpcode(operand[0]))?)?;
                    self.arg_stack.push(self.val)?;
                }
                Opcode::AssignObjPushArg => {
                    self.val = self.constant(&constants, operand[0])?;
                    self.arg_stack.push(self.val)?;
                }
                Opcode::GrefPushArg => {
                    self.do_gref(&constants, operand[0])?;
                    self.arg_stack.push(self.val)?;
                }
                Opcode::FrefPushArg => {
                    let dest = RefReg::from_index(operand[0]).ok_or(EvalError::BadOpcode(operand[0]))?;
                    let v = env::fref(&self.heap, self.env, operand[1], operand[2])?;
                    self.set_ref_reg(dest, v);
                    self.arg_stack.push(self.val)?;
                }
                Opcode::GetAccessPushArg => {
                    let sym = self.constant(&constants, operand[0])?;
                    self.val = env::access_lookup(&self.heap, self.val, sym)?;
                    self.arg_stack.push(self.val)?;
                }

                Opcode::AssignRegApply | Opcode::AssignObjApply | Opcode::GrefApply
                | Opcode::FrefApply | Opcode::GetAccessApply
                | Opcode::AssignRegApplyCont | Opcode::AssignObjApplyCont
                | Opcode::GrefApplyCont | Opcode::FrefApplyCont | Opcode::GetAccessApplyCont => {
                    let tail = matches!(
                        opcode,
                        Opcode::AssignRegApplyCont
                            | Opcode::AssignObjApplyCont
                            | Opcode::GrefApplyCont
                            | Opcode::FrefApplyCont
                            | Opcode::GetAccessApplyCont
                    );
                    match opcode {
                        Opcode::AssignRegApply | Opcode::AssignRegApplyCont => {
                            self.val = self.reg_value(Reg::from_index(operand[0])
                                .ok_or(EvalError::BadOpcode(operand[0]))?)?;
                        }
                        Opcode::AssignObjApply | Opcode::AssignObjApplyCont => {
                            self.val = self.constant(&constants, operand[0])?;
                        }
                        Opcode::GrefApply | Opcode::GrefApplyCont => {
                            self.do_gref(&constants, operand[0])?;
                        }
                        Opcode::FrefApply | Opcode::FrefApplyCont => {
                            let dest = RefReg::from_index(operand[0])
                                .ok_or(EvalError::BadOpcode(operand[0]))?;
                            let v = env::fref(&self.heap, self.env, operand[1], operand[2])?;
                            self.set_ref_reg(dest, v);
                        }
                        Opcode::GetAccessApply | Opcode::GetAccessApplyCont => {
                            let sym = self.constant(&constants, operand[0])?;
                            self.val = env::access_lookup(&self.heap, self.val, sym)?;
                        }
                        _ => unreachable!(),
                    }
                    match self.apply_dispatch(tail, pc)? {
                        ApplyOutcome::Entered => {
                            pc = 0;
                            let (bc, co) = self.load_code(self.unev)?;
                            bytecode = bc;
                            constants = co;
                        }
                        ApplyOutcome::Inline => {}
                        ApplyOutcome::ContinuationInvoked => match self.pop_call_frame(floor)? {
                            Some((env, unev, saved_pc)) => {
                                self.env = env;
                                self.unev = unev;
                                pc = saved_pc;
                                let (bc, co) = self.load_code(self.unev)?;
                                bytecode = bc;
                                constants = co;
                            }
                            None => return Ok(self.val),
                        },
                    }
                }

                Opcode::Rte => unreachable!("asm::encode translates rte to rtc at assembly time"),
            }
        }
    }

    /// `test-true`/`test-false`: latch whether `val` is truthy (anything but
    /// `#f`) into the flag `branch`/`branch-cont` read, inverted for
    /// `test-false`.
    fn set_test_flag(&mut self, invert: bool) -> Result<(), EvalError> {
        let truthy = !matches!(self.heap.get(self.val)?, Cell::Boolean(false));
        self.test_flag = if invert { !truthy } else { truthy };
        Ok(())
    }

    fn do_gref(&mut self, constants: &[Ref], idx: u8) -> Result<(), EvalError> {
        let sym_ref = self.constant(constants, idx)?;
        let binding = match self.heap.get(sym_ref)? {
            Cell::Symbol(s) => s.binding,
            other => return Err(EvalError::WrongType { expected: "symbol", got: other.kind_name() }),
        };
        if matches!(self.heap.get(binding)?, Cell::Unbound) {
            return Err(EvalError::UnboundSymbol);
        }
        self.val = binding;
        Ok(())
    }

    fn do_gset(&mut self, constants: &[Ref], idx: u8) -> Result<(), EvalError> {
        let sym_ref = self.constant(constants, idx)?;
        match self.heap.get_mut(sym_ref)? {
            Cell::Symbol(s) => {
                s.binding = self.val;
                Ok(())
            }
            other => Err(EvalError::WrongType { expected: "symbol", got: other.kind_name() }),
        }
    }

    /// Resolve `self.val` through every operator hop (`apply`/`eval`/
    /// `call/cc`) until it settles on a primitive, closure, or captured
    /// continuation, then act on it. `tail` and `entry_pc` describe the
    /// original `apply`/`apply-cont` instruction that triggered this.
    fn apply_dispatch(&mut self, tail: bool, entry_pc: usize) -> Result<ApplyOutcome, EvalError> {
        let mut tail = tail;
        loop {
            match apply::classify(&self.heap, self.val)? {
                Callee::Primitive(p) => {
                    let argc = self.arg_stack.argc();
                    let args = self.arg_stack.top_n(argc)?.to_vec();
                    let mut iter = ArgIter::new(args);
                    self.val = p.call(&mut iter)?;
                    return Ok(ApplyOutcome::Inline);
                }
                Callee::Closure(closure) => {
                    let argc = self.arg_stack.argc();
                    apply::check_closure_arity(&closure, argc)?;
                    let args = self.arg_stack.drain_call(argc)?;
                    if !tail {
                        self.push_call_frame(entry_pc)?;
                    }
                    let reg_roots = self.reg_roots();
                    let roots: [&dyn RootSource; 4] =
                        [&reg_roots, &self.reg_stack, &self.arg_stack, &self.symtab];
                    let new_env =
                        apply::bind_closure_args(&mut self.heap, &roots, self.null, closure, args)?;
                    self.env = new_env;
                    self.unev = closure.code;
                    return Ok(ApplyOutcome::Entered);
                }
                Callee::Continuation(cont_ref) => {
                    let argc = self.arg_stack.argc();
                    let results = self.arg_stack.drain_call(argc)?;
                    let result = results.first().copied().unwrap_or(self.null);
                    let (env, unev) = continuation::restore(
                        &self.heap,
                        cont_ref,
                        &mut self.reg_stack,
                        &mut self.arg_stack,
                        &mut self.int_stack,
                    )?;
                    self.env = env;
                    self.unev = unev;
                    self.val = result;
                    return Ok(ApplyOutcome::ContinuationInvoked);
                }
                Callee::Apply => {
                    let argc = self.arg_stack.argc();
                    let mut args = self.arg_stack.drain_call(argc)?;
                    if args.len() < 2 {
                        return Err(EvalError::ArityMismatch { expected: "at least 2".into(), got: args.len() });
                    }
                    let new_callee = args.remove(0);
                    let spliced = args.pop().expect("checked len >= 2 above");
                    let mut new_args = args;
                    new_args.extend(apply::list_to_vec(&self.heap, self.null, spliced)?);
                    self.arg_stack.set_argc(0);
                    for a in &new_args {
                        self.arg_stack.push(*a)?;
                    }
                    self.val = new_callee;
                }
                Callee::Eval => {
                    let argc = self.arg_stack.argc();
                    let args = self.arg_stack.drain_call(argc)?;
                    let expr = *args
                        .first()
                        .ok_or(EvalError::ArityMismatch { expected: "at least 1".into(), got: 0 })?;
                    let eval_env = args.get(1).copied().unwrap_or(self.env);
                    match self.heap.get(expr)? {
                        Cell::Code(_) => {
                            if !tail {
                                self.push_call_frame(entry_pc)?;
                            }
                            self.env = eval_env;
                            self.unev = expr;
                            return Ok(ApplyOutcome::Entered);
                        }
                        other => {
                            return Err(EvalError::WrongType { expected: "code", got: other.kind_name() })
                        }
                    }
                }
                Callee::CallCc => {
                    let argc = self.arg_stack.argc();
                    let mut args = self.arg_stack.drain_call(argc)?;
                    let proc = args
                        .pop()
                        .ok_or(EvalError::ArityMismatch { expected: "1".into(), got: 0 })?;
                    // The frame a normal return from `proc` would pop and the
                    // frame invoking the captured continuation resumes at
                    // are the same place, so it has to exist *before*
                    // capture snapshots the stacks. Pushing it here and
                    // treating the call to `proc` below as a tail call
                    // (rather than letting the `Closure` arm push its own)
                    // is what makes both paths land on the instruction right
                    // after this `apply`.
                    if !tail {
                        self.push_call_frame(entry_pc)?;
                    }
                    let reg_roots = self.reg_roots();
                    let roots: [&dyn RootSource; 4] =
                        [&reg_roots, &self.reg_stack, &self.arg_stack, &self.symtab];
                    let cont_ref = continuation::capture(
                        &mut self.heap,
                        &roots,
                        &self.reg_stack,
                        &self.arg_stack,
                        &self.int_stack,
                        self.env,
                        self.unev,
                    )?;
                    self.arg_stack.set_argc(0);
                    self.arg_stack.push(cont_ref)?;
                    self.val = proc;
                    tail = true;
                }
                Callee::Force => {
                    let argc = self.arg_stack.argc();
                    let args = self.arg_stack.drain_call(argc)?;
                    let promise_ref = *args
                        .first()
                        .ok_or(EvalError::ArityMismatch { expected: "1".into(), got: 0 })?;
                    match promise::force(&self.heap, promise_ref)? {
                        ForceOutcome::Cached(v) => {
                            self.val = v;
                        }
                        ForceOutcome::NeedsEval { expr, env } => {
                            let v = self.run(expr, env)?;
                            promise::resolve(&mut self.heap, promise_ref, v)?;
                            self.val = v;
                        }
                    }
                    return Ok(ApplyOutcome::Inline);
                }
                Callee::Map => {
                    self.val = self.map_or_for_each(true)?;
                    return Ok(ApplyOutcome::Inline);
                }
                Callee::ForEach => {
                    self.val = self.map_or_for_each(false)?;
                    return Ok(ApplyOutcome::Inline);
                }
            }
        }
    }

    /// Drive `(map proc list...)` / `(for-each proc list...)` by applying
    /// `proc` to completion once per (zipped) element, natively in Rust
    /// rather than via hand-assembled `map_code`/`for_code` bytecode.
    fn map_or_for_each(&mut self, collect: bool) -> Result<Ref, EvalError> {
        let argc = self.arg_stack.argc();
        let mut args = self.arg_stack.drain_call(argc)?;
        if args.is_empty() {
            return Err(EvalError::ArityMismatch { expected: "at least 1".into(), got: 0 });
        }
        let proc = args.remove(0);
        let lists: Vec<Vec<Ref>> = args
            .iter()
            .map(|&l| apply::list_to_vec(&self.heap, self.null, l))
            .collect::<Result<_, _>>()?;
        let len = lists.iter().map(|l| l.len()).min().unwrap_or(0);
        let mut results = Vec::with_capacity(if collect { len } else { 0 });
        for i in 0..len {
            let call_args: Vec<Ref> = lists.iter().map(|l| l[i]).collect();
            let v = self.apply_to_completion(proc, call_args)?;
            if collect {
                results.push(v);
            }
        }
        if collect {
            let reg_roots = self.reg_roots();
            let roots: [&dyn RootSource; 4] =
                [&reg_roots, &self.reg_stack, &self.arg_stack, &self.symtab];
            apply::vec_to_list(&mut self.heap, &roots, self.null, &results)
        } else {
            Ok(self.unspecified)
        }
    }

    /// Apply `proc` to `args` and run it to completion, for callers (`map`,
    /// `for-each`) that need the resulting value back rather than a tail
    /// transfer of control.
    fn apply_to_completion(&mut self, proc: Ref, args: Vec<Ref>) -> Result<Ref, EvalError> {
        match apply::classify(&self.heap, proc)? {
            Callee::Primitive(p) => {
                let mut iter = ArgIter::new(args);
                Ok(p.call(&mut iter)?)
            }
            Callee::Closure(closure) => {
                apply::check_closure_arity(&closure, args.len())?;
                let reg_roots = self.reg_roots();
                let roots: [&dyn RootSource; 4] =
                    [&reg_roots, &self.reg_stack, &self.arg_stack, &self.symtab];
                let new_env =
                    apply::bind_closure_args(&mut self.heap, &roots, self.null, closure, args)?;
                self.run(closure.code, new_env)
            }
            _ => Err(EvalError::NotCallable { kind: self.heap.get(proc)?.kind_name() }),
        }
    }
}
