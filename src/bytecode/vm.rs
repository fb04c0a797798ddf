//! The goal virtual machine (COMPONENT DESIGN §4.3).
//!
//! A flat instruction loop over an explicit choice-point stack and a
//! continuation stack of pending clause invocations - deliberately not
//! recursion-as-coroutines (DESIGN NOTES §9 "Coroutines / backtracking").
//! `GoalVm::start` runs to the first solution; `GoalVm::next_solution`
//! resumes backtracking for subsequent ones, which is how the engine
//! implements disjunction and enumerable queries (SPEC_FULL.md §8 scenario 3/4).

use std::collections::HashMap;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::bytecode::chunk::BytecodeChunk;
use crate::bytecode::fvm::{self, FvmEnv, HostInterop};
use crate::bytecode::opcodes::Opcode;
use crate::error::VmError;
use crate::predicate::{ConstantPool, PredicateIndicator, PredicateKind, PredicateStore};
use crate::symbol::Symbol;
use crate::unify::{unify, unify_const};
use crate::value::{Cell, HostRef, Stack};

/// One pending clause invocation: bytecode, program counter, the base
/// address of its environment frame on the data stack, and the constant pool
/// its bytecode indexes into (the owning predicate's pool, cloned once on
/// entry - §4.6, §3 "once execution begins... its constant pool is
/// read-only").
#[derive(Clone)]
struct Frame {
    chunk: Rc<BytecodeChunk>,
    pc: usize,
    env_base: usize,
    pool: Rc<ConstantPool>,
    /// `choice_points.len()` as observed when this frame's predicate call
    /// was entered, i.e. before the clause-selection choice point (if any)
    /// for *this* call was pushed. `CCut` truncates back to this mark.
    cp_mark: usize,
}

/// A snapshot of pending clause invocations - the "continuation" a `CCall`
/// suspends into and a choice point carries for its retry. Clause nesting
/// rarely runs more than a handful of frames deep before last-call
/// optimisation reuses one, so this stays on the stack for the common case
/// rather than heap-allocating per `CCall`/backtrack (same role `smallvec`
/// plays in the teacher's own binding frames).
type ContinuationStack = SmallVec<[Frame; 8]>;

/// The F-VM comparison/builtin scratch area (§4.3, §4.4): almost always
/// holds 0-2 cells (one `BEvalExpr` result, or a compare's left/right pair).
type ExprScratch = SmallVec<[Cell; 4]>;

/// Which alternative a choice point retries: the next clause index of a
/// rule predicate, or the next row index of a table.
#[derive(Clone, Copy)]
enum AlternativeKind {
    Clause,
    TableRow,
}

struct ChoicePoint {
    pred: PredicateIndicator,
    kind: AlternativeKind,
    next_index: usize,
    args_base: usize,
    arity: usize,
    stack_mark: usize,
    trail_mark: usize,
    continuation: ContinuationStack,
}

/// A shared one-byte `CNoGoal` chunk, reused for every table-row "clause"
/// (a table row has no body - it is the spec's "single synthetic special
/// clause" collapsed to a no-op success).
fn table_row_chunk() -> Rc<BytecodeChunk> {
    thread_local! {
        static CHUNK: Rc<BytecodeChunk> = Rc::new(BytecodeChunk {
            name: "<table-row>".to_string(),
            code: vec![Opcode::CNoGoal as u8],
            lines: Vec::new(),
        });
    }
    CHUNK.with(|c| c.clone())
}

fn empty_pool() -> Rc<ConstantPool> {
    thread_local! {
        static POOL: Rc<ConstantPool> = Rc::new(ConstantPool::default());
    }
    POOL.with(|p| p.clone())
}

/// What a `CCall`/`CLastCall` resolves against: a compile-time predicate
/// indicator from `EmitGoal`, or a run-time lookup of the `Pred` cell pushed
/// right after `EmitMetaGoal` (meta-call, §4.3).
enum PendingCall {
    Static(PredicateIndicator, usize, usize),
    Meta(usize, usize),
}

pub struct GoalVm {
    pub stack: Stack,
    choice_points: Vec<ChoicePoint>,
    continuation: ContinuationStack,
    pending_call: Option<PendingCall>,
    /// Scratch area `BEvalExpr` pushes results onto and `BCompareLt`/etc. and
    /// aggregate updaters pop from (§4.3, §4.4) - distinct from the F-VM's
    /// own internal evaluation stack, which never leaves a single expression
    /// program.
    expr_scratch: ExprScratch,
    max_steps: usize,
    steps: usize,
    /// `EngineConfig::max_choice_points`; `0` means unbounded.
    max_choice_points: usize,
}

/// Adapts a [`Stack`] + environment base into the interface the F-VM needs
/// to resolve `Load`/`LoadGlobal`.
struct EnvAdapter<'a> {
    stack: &'a Stack,
    env_base: usize,
    globals: &'a HashMap<Symbol, Cell>,
}

impl FvmEnv for EnvAdapter<'_> {
    fn load_slot(&self, slot: u8) -> Option<Cell> {
        let addr = self.stack.deref(self.env_base + slot as usize);
        let cell = self.stack.get(addr);
        if cell.is_unbound() {
            None
        } else {
            Some(cell.clone())
        }
    }

    fn load_global(&self, name: Symbol) -> Option<Cell> {
        self.globals.get(&name).cloned()
    }
}

impl GoalVm {
    pub fn new(initial_stack_capacity: usize, initial_trail_capacity: usize, max_steps: usize) -> Self {
        Self::with_choice_point_bound(initial_stack_capacity, initial_trail_capacity, max_steps, 0)
    }

    pub fn with_choice_point_bound(
        initial_stack_capacity: usize,
        initial_trail_capacity: usize,
        max_steps: usize,
        max_choice_points: usize,
    ) -> Self {
        GoalVm {
            stack: Stack::with_capacity(initial_stack_capacity, initial_trail_capacity),
            choice_points: Vec::new(),
            continuation: ContinuationStack::new(),
            pending_call: None,
            expr_scratch: ExprScratch::new(),
            max_steps,
            steps: 0,
            max_choice_points,
        }
    }

    fn push_choice_point(&mut self, cp: ChoicePoint) -> Result<(), VmError> {
        if self.max_choice_points != 0 && self.choice_points.len() >= self.max_choice_points {
            return Err(VmError::ChoicePointLimitExceeded);
        }
        self.choice_points.push(cp);
        Ok(())
    }

    /// Run a fresh top-level goal. `args_base` is the address of the first
    /// of `pi.1` argument cells already pushed onto `self.stack`.
    pub fn start(
        &mut self,
        store: &PredicateStore,
        pi: PredicateIndicator,
        args_base: usize,
        host: &mut dyn HostInterop,
        globals: &HashMap<Symbol, Cell>,
    ) -> Result<bool, VmError> {
        self.continuation.clear();
        self.choice_points.clear();
        self.expr_scratch.clear();
        self.steps = 0;
        let cp_mark = self.choice_points.len();
        if !self.enter_call(store, pi, args_base, ContinuationStack::new(), cp_mark)? {
            return Ok(false);
        }
        self.run_loop(store, host, globals)
    }

    /// Run a standalone chunk that isn't a stored predicate's clause - a
    /// compiled top-level query, which has no caller argument list and so has
    /// no `enter_call` clause-selection step to go through (§6 `Run`).
    /// `env_base` is the address of the query's first environment cell,
    /// already pushed onto `self.stack` by the caller.
    pub fn run_query(
        &mut self,
        store: &PredicateStore,
        chunk: Rc<BytecodeChunk>,
        pool: Rc<ConstantPool>,
        env_base: usize,
        host: &mut dyn HostInterop,
        globals: &HashMap<Symbol, Cell>,
    ) -> Result<bool, VmError> {
        self.continuation.clear();
        self.choice_points.clear();
        self.expr_scratch.clear();
        self.steps = 0;
        let cp_mark = self.choice_points.len();
        self.continuation.push(Frame { chunk, pc: 0, env_base, pool, cp_mark });
        self.run_loop(store, host, globals)
    }

    /// Resume for the next solution of the goal most recently started.
    pub fn next_solution(
        &mut self,
        store: &PredicateStore,
        host: &mut dyn HostInterop,
        globals: &HashMap<Symbol, Cell>,
    ) -> Result<bool, VmError> {
        if !self.backtrack(store)? {
            return Ok(false);
        }
        self.run_loop(store, host, globals)
    }

    fn run_loop(
        &mut self,
        store: &PredicateStore,
        host: &mut dyn HostInterop,
        globals: &HashMap<Symbol, Cell>,
    ) -> Result<bool, VmError> {
        loop {
            let Some(frame) = self.continuation.last().cloned() else {
                return Ok(true);
            };
            if frame.pc >= frame.chunk.code.len() {
                self.continuation.pop();
                continue;
            }
            self.steps += 1;
            if self.max_steps != 0 && self.steps > self.max_steps {
                return Err(VmError::StepLimitExceeded);
            }

            let byte = frame.chunk.code[frame.pc];
            let op = Opcode::from_byte(byte).ok_or(VmError::BadOpcode(byte))?;
            let mut pc = frame.pc + 1;

            let outcome = self.step(
                store,
                op,
                &frame.chunk,
                &mut pc,
                frame.env_base,
                &frame.pool,
                host,
                globals,
            )?;
            match outcome {
                StepOutcome::Continue => {
                    if let Some(top) = self.continuation.last_mut() {
                        top.pc = pc;
                    }
                }
                StepOutcome::Entered => {
                    // A new frame was pushed (or the top replaced); nothing
                    // else to update - the new top's own `pc` is already set.
                }
                StepOutcome::ClauseSucceeded => {
                    self.continuation.pop();
                }
                StepOutcome::Fail => {
                    if !self.backtrack(store)? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step(
        &mut self,
        store: &PredicateStore,
        op: Opcode,
        chunk: &Rc<BytecodeChunk>,
        pc: &mut usize,
        env_base: usize,
        pool: &ConstantPool,
        host: &mut dyn HostInterop,
        globals: &HashMap<Symbol, Cell>,
    ) -> Result<StepOutcome, VmError> {
        match op {
            Opcode::EmitGoal => {
                let pool_idx = chunk.code[*pc];
                let arity = chunk.code[*pc + 1] as usize;
                *pc += 2;
                let pi = resolve_predicate_ref(pool, pool_idx)?;
                let args_base = self.stack.top();
                self.pending_call = Some(PendingCall::Static(pi, arity, args_base));
                Ok(StepOutcome::Continue)
            }
            Opcode::EmitMetaGoal => {
                let extra_arity = chunk.code[*pc] as usize;
                *pc += 1;
                let args_base = self.stack.top();
                self.pending_call = Some(PendingCall::Meta(extra_arity, args_base));
                Ok(StepOutcome::Continue)
            }
            Opcode::GoalVoid => {
                self.stack.push(Cell::Unbound);
                Ok(StepOutcome::Continue)
            }
            Opcode::GoalVarFirst | Opcode::GoalVarMatch => {
                let slot = chunk.code[*pc] as usize;
                *pc += 1;
                self.stack.push(Cell::StackRef(env_base + slot));
                Ok(StepOutcome::Continue)
            }
            Opcode::GoalConstInt => {
                let idx = chunk.code[*pc];
                *pc += 1;
                let v = *pool.ints.get(idx as usize).ok_or(VmError::BadConstantIndex(idx))?;
                self.stack.push(Cell::Int(v));
                Ok(StepOutcome::Continue)
            }
            Opcode::GoalConstFloat => {
                let idx = chunk.code[*pc];
                *pc += 1;
                let v = *pool.floats.get(idx as usize).ok_or(VmError::BadConstantIndex(idx))?;
                self.stack.push(Cell::Float(v));
                Ok(StepOutcome::Continue)
            }
            Opcode::GoalConstBool => {
                let v = chunk.code[*pc] != 0;
                *pc += 1;
                self.stack.push(Cell::Bool(v));
                Ok(StepOutcome::Continue)
            }
            Opcode::GoalConstObject | Opcode::GoalConstPredRef => {
                let idx = chunk.code[*pc];
                *pc += 1;
                let v = pool
                    .objects
                    .get(idx as usize)
                    .cloned()
                    .ok_or(VmError::BadConstantIndex(idx))?;
                self.stack.push(v);
                Ok(StepOutcome::Continue)
            }
            Opcode::GoalConstFexpr => {
                let adapter = EnvAdapter { stack: &self.stack, env_base, globals };
                let (value, next_pc) = fvm::eval(&chunk.code, *pc, pool, &adapter, host)
                    .map_err(VmError::from)?;
                *pc = next_pc;
                self.stack.push(value);
                Ok(StepOutcome::Continue)
            }

            Opcode::HeadVoid
            | Opcode::HeadVarFirst
            | Opcode::HeadVarMatch
            | Opcode::HeadConstInt
            | Opcode::HeadConstFloat
            | Opcode::HeadConstBool
            | Opcode::HeadConstObject
            | Opcode::HeadConstPredRef
            | Opcode::HeadConstFexpr => {
                // Head opcodes only ever execute from within `enter_call`
                // while matching a fresh clause; reaching one here means the
                // compiler mis-emitted the opcode stream.
                Err(VmError::BadOpcode(op as u8))
            }

            Opcode::CCall => {
                let pending = self.pending_call.take().ok_or(VmError::BadOpcode(op as u8))?;
                let (pi, args_base) = self.resolve_pending(pending)?;
                // Record the resume point past this `CCall` before snapshotting
                // the continuation, so returning into this frame later doesn't
                // replay the call.
                if let Some(top) = self.continuation.last_mut() {
                    top.pc = *pc;
                }
                let continuation_after = self.continuation.clone();
                let cp_mark = self.choice_points.len();
                if self.enter_call(store, pi, args_base, continuation_after, cp_mark)? {
                    Ok(StepOutcome::Entered)
                } else {
                    Ok(StepOutcome::Fail)
                }
            }
            Opcode::CLastCall => {
                let pending = self.pending_call.take().ok_or(VmError::BadOpcode(op as u8))?;
                let (pi, args_base) = self.resolve_pending(pending)?;
                // Last-call optimisation: drop the current frame's own entry
                // from the continuation before entering the callee, reusing
                // whatever the caller's caller already set up.
                self.continuation.pop();
                let continuation_after = self.continuation.clone();
                let cp_mark = self.choice_points.len();
                if self.enter_call(store, pi, args_base, continuation_after, cp_mark)? {
                    Ok(StepOutcome::Entered)
                } else {
                    Ok(StepOutcome::Fail)
                }
            }
            Opcode::CNoGoal => Ok(StepOutcome::ClauseSucceeded),
            Opcode::CCut => {
                let mark = self
                    .continuation
                    .last()
                    .map(|f| f.cp_mark)
                    .unwrap_or(0);
                self.choice_points.truncate(mark);
                Ok(StepOutcome::Continue)
            }
            Opcode::CSpecial => {
                let pending = self.pending_call.take().ok_or(VmError::BadOpcode(op as u8))?;
                let (pi, args_base) = self.resolve_pending(pending)?;
                let pred = store
                    .get(pi)
                    .ok_or(VmError::UnknownPredicate(pi.0, pi.1))?;
                match &pred.kind {
                    PredicateKind::Primop(f) => {
                        if f(&mut self.stack, args_base, pi.1)? {
                            Ok(StepOutcome::Continue)
                        } else {
                            Ok(StepOutcome::Fail)
                        }
                    }
                    _ => Err(VmError::BadOpcode(op as u8)),
                }
            }

            Opcode::BFail => Ok(StepOutcome::Fail),
            Opcode::BVar => {
                let slot = chunk.code[*pc] as usize;
                *pc += 1;
                let addr = self.stack.deref(env_base + slot);
                if self.stack.get(addr).is_unbound() {
                    Ok(StepOutcome::Continue)
                } else {
                    Ok(StepOutcome::Fail)
                }
            }
            Opcode::BNonvar => {
                let slot = chunk.code[*pc] as usize;
                *pc += 1;
                let addr = self.stack.deref(env_base + slot);
                if self.stack.get(addr).is_unbound() {
                    Ok(StepOutcome::Fail)
                } else {
                    Ok(StepOutcome::Continue)
                }
            }
            Opcode::BEvalExpr => {
                let adapter = EnvAdapter { stack: &self.stack, env_base, globals };
                let (value, next_pc) = fvm::eval(&chunk.code, *pc, pool, &adapter, host)
                    .map_err(VmError::from)?;
                *pc = next_pc;
                self.expr_scratch.push(value);
                Ok(StepOutcome::Continue)
            }
            Opcode::BCompareLt | Opcode::BCompareGt | Opcode::BCompareLe | Opcode::BCompareGe => {
                let right = self.expr_scratch_pop()?;
                let left = self.expr_scratch_pop()?;
                if compare(op, &left, &right)? {
                    Ok(StepOutcome::Continue)
                } else {
                    Ok(StepOutcome::Fail)
                }
            }
            Opcode::BTypeIsInteger
            | Opcode::BTypeIsFloat
            | Opcode::BTypeIsNumber
            | Opcode::BTypeIsString
            | Opcode::BTypeIsSymbol
            | Opcode::BTypeIsMissing => {
                let slot = chunk.code[*pc] as usize;
                *pc += 1;
                let addr = self.stack.deref(env_base + slot);
                let cell = self.stack.get(addr);
                let matches = match op {
                    Opcode::BTypeIsInteger => matches!(cell, Cell::Int(_)),
                    Opcode::BTypeIsFloat => matches!(cell, Cell::Float(_)),
                    Opcode::BTypeIsNumber => matches!(cell, Cell::Int(_) | Cell::Float(_)),
                    Opcode::BTypeIsString => {
                        matches!(cell, Cell::Reference(HostRef::Str(_)))
                    }
                    Opcode::BTypeIsSymbol => {
                        matches!(cell, Cell::Reference(HostRef::Symbol(_)))
                    }
                    Opcode::BTypeIsMissing => cell.is_unbound(),
                    _ => unreachable!(),
                };
                if matches {
                    Ok(StepOutcome::Continue)
                } else {
                    Ok(StepOutcome::Fail)
                }
            }
            Opcode::BUnsafeSet => {
                let slot = chunk.code[*pc] as usize;
                *pc += 1;
                let value = self.expr_scratch_pop()?;
                let addr = self.stack.deref(env_base + slot);
                self.stack.force_set(addr, value);
                Ok(StepOutcome::Continue)
            }
            Opcode::BUnsafeInitialize => {
                let slot = chunk.code[*pc] as usize;
                *pc += 1;
                let addr = self.stack.deref(env_base + slot);
                self.stack.force_set(addr, Cell::Unbound);
                Ok(StepOutcome::Continue)
            }
            Opcode::BUnsafeInitializeZero => {
                let slot = chunk.code[*pc] as usize;
                *pc += 1;
                let addr = self.stack.deref(env_base + slot);
                self.stack.force_set(addr, Cell::Float(0.0));
                Ok(StepOutcome::Continue)
            }
            Opcode::BUnsafeInitializeZeroInt => {
                let slot = chunk.code[*pc] as usize;
                *pc += 1;
                let addr = self.stack.deref(env_base + slot);
                self.stack.force_set(addr, Cell::Int(0));
                Ok(StepOutcome::Continue)
            }
            Opcode::BAggregateMaximizeUpdate | Opcode::BAggregateMinimizeUpdate => {
                let slot = chunk.code[*pc] as usize;
                *pc += 1;
                let candidate = self.expr_scratch_pop()?;
                let addr = self.stack.deref(env_base + slot);
                let current = self.stack.get(addr).clone();
                let winner = aggregate_extreme(op, current, candidate)?;
                self.stack.force_set(addr, winner);
                Ok(StepOutcome::Continue)
            }
            Opcode::BAggregateSumUpdateAndRepeat => {
                let slot = chunk.code[*pc] as usize;
                *pc += 1;
                let delta = self.expr_scratch_pop()?;
                let addr = self.stack.deref(env_base + slot);
                let current = self.stack.get(addr).clone();
                self.stack.force_set(addr, numeric_add(current, delta)?);
                Ok(StepOutcome::Continue)
            }
            Opcode::BAggregateIncAndRepeat => {
                let slot = chunk.code[*pc] as usize;
                *pc += 1;
                let addr = self.stack.deref(env_base + slot);
                let current = self.stack.get(addr).clone();
                self.stack.force_set(addr, numeric_add(current, Cell::Int(1))?);
                Ok(StepOutcome::Continue)
            }
            Opcode::BThrow => {
                let value = self.expr_scratch_pop()?;
                let term = cell_to_throw_term(value);
                Err(VmError::Thrown(term))
            }
            Opcode::BCallFailed => {
                tracing::warn!("call_failed reached; treating as ordinary failure");
                Ok(StepOutcome::Fail)
            }
        }
    }

    fn enter_call(
        &mut self,
        store: &PredicateStore,
        pi: PredicateIndicator,
        args_base: usize,
        continuation_after: ContinuationStack,
        cp_mark: usize,
    ) -> Result<bool, VmError> {
        let pred = store
            .get(pi)
            .ok_or(VmError::UnknownPredicate(pi.0, pi.1))?;
        match &pred.kind {
            PredicateKind::Rule(clauses) => {
                if clauses.is_empty() {
                    return Ok(false);
                }
                let stack_mark = self.stack.top();
                let trail_mark = self.stack.trail_top();
                if clauses.len() > 1 {
                    self.push_choice_point(ChoicePoint {
                        pred: pi,
                        kind: AlternativeKind::Clause,
                        next_index: 1,
                        args_base,
                        arity: pi.1,
                        stack_mark,
                        trail_mark,
                        continuation: continuation_after.clone(),
                    })?;
                }
                self.try_clause(store, clauses, 0, pi, args_base, continuation_after, cp_mark)
            }
            PredicateKind::TablePredicate(table) => {
                if table.rows.is_empty() {
                    return Ok(false);
                }
                let stack_mark = self.stack.top();
                let trail_mark = self.stack.trail_top();
                if table.rows.len() > 1 {
                    self.push_choice_point(ChoicePoint {
                        pred: pi,
                        kind: AlternativeKind::TableRow,
                        next_index: 1,
                        args_base,
                        arity: pi.1,
                        stack_mark,
                        trail_mark,
                        continuation: continuation_after.clone(),
                    })?;
                }
                self.try_table_row(table, 0, args_base, continuation_after, cp_mark)
            }
            PredicateKind::Primop(f) => {
                let succeeded = f(&mut self.stack, args_base, pi.1)?;
                if succeeded {
                    self.continuation = continuation_after;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn try_clause(
        &mut self,
        store: &PredicateStore,
        clauses: &[crate::predicate::CompiledClause],
        mut idx: usize,
        pi: PredicateIndicator,
        args_base: usize,
        continuation_after: ContinuationStack,
        cp_mark: usize,
    ) -> Result<bool, VmError> {
        let arity = pi.1;
        let pool = clause_pool(store, pi);
        while idx < clauses.len() {
            let clause = &clauses[idx];
            let env_base = self.stack.top();
            for _ in 0..clause.environment_size {
                self.stack.push(Cell::Unbound);
            }
            let mut pc = 0usize;
            let mut head_ok = true;
            for i in 0..arity {
                if !self.match_head_arg(&clause.bytecode.code, &mut pc, &pool, args_base + i, env_base)? {
                    head_ok = false;
                    break;
                }
            }
            if head_ok {
                self.continuation = continuation_after;
                self.continuation.push(Frame {
                    chunk: clause.bytecode.clone(),
                    pc,
                    env_base,
                    pool: pool.clone(),
                    cp_mark,
                });
                return Ok(true);
            }
            idx += 1;
            self.drop_failed_attempt(args_base, arity);
        }
        self.discard_exhausted_choice_point(pi);
        Ok(false)
    }

    fn try_table_row(
        &mut self,
        table: &crate::predicate::Table,
        mut idx: usize,
        args_base: usize,
        continuation_after: ContinuationStack,
        cp_mark: usize,
    ) -> Result<bool, VmError> {
        while idx < table.rows.len() {
            let row = &table.rows[idx];
            let mut ok = true;
            for (i, cell) in row.iter().enumerate() {
                if !unify_const(&mut self.stack, args_base + i, cell.clone()) {
                    ok = false;
                    break;
                }
            }
            if ok {
                self.continuation = continuation_after;
                self.continuation.push(Frame {
                    chunk: table_row_chunk(),
                    pc: 0,
                    env_base: args_base,
                    pool: empty_pool(),
                    cp_mark,
                });
                return Ok(true);
            }
            idx += 1;
        }
        Ok(false)
    }

    /// Truncate the failed clause attempt's partial bindings back to just
    /// past the caller's arguments, ready to try the next clause.
    fn drop_failed_attempt(&mut self, args_base: usize, arity: usize) {
        self.stack.truncate_to(args_base + arity);
    }

    fn discard_exhausted_choice_point(&mut self, pi: PredicateIndicator) {
        if let Some(cp) = self.choice_points.last() {
            if cp.pred == pi {
                self.choice_points.pop();
            }
        }
    }

    /// Pop the most recent choice point and try its remaining alternatives;
    /// pop exhausted choice points and keep going until one yields a match
    /// or none remain (overall failure).
    fn backtrack(&mut self, store: &PredicateStore) -> Result<bool, VmError> {
        while let Some(cp) = self.choice_points.pop() {
            self.stack.truncate_to(cp.stack_mark);
            self.stack.unwind_trail_to(cp.trail_mark);
            let pred = store.get(cp.pred);
            let found = match (pred.map(|p| &p.kind), cp.kind) {
                (Some(PredicateKind::Rule(clauses)), AlternativeKind::Clause) => {
                    let total = clauses.len();
                    if cp.next_index < total {
                        if cp.next_index + 1 < total {
                            self.choice_points.push(ChoicePoint {
                                next_index: cp.next_index + 1,
                                ..clone_cp(&cp)
                            });
                        }
                        let cp_mark = self.choice_points.len();
                        self.try_clause(
                            store,
                            clauses,
                            cp.next_index,
                            cp.pred,
                            cp.args_base,
                            cp.continuation.clone(),
                            cp_mark,
                        )?
                    } else {
                        false
                    }
                }
                (Some(PredicateKind::TablePredicate(table)), AlternativeKind::TableRow) => {
                    let total = table.rows.len();
                    if cp.next_index < total {
                        if cp.next_index + 1 < total {
                            self.choice_points.push(ChoicePoint {
                                next_index: cp.next_index + 1,
                                ..clone_cp(&cp)
                            });
                        }
                        let cp_mark = self.choice_points.len();
                        self.try_table_row(
                            table,
                            cp.next_index,
                            cp.args_base,
                            cp.continuation.clone(),
                            cp_mark,
                        )?
                    } else {
                        false
                    }
                }
                _ => false,
            };
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn match_head_arg(
        &mut self,
        code: &[u8],
        pc: &mut usize,
        pool: &ConstantPool,
        arg_addr: usize,
        env_base: usize,
    ) -> Result<bool, VmError> {
        let byte = code[*pc];
        let op = Opcode::from_byte(byte).ok_or(VmError::BadOpcode(byte))?;
        *pc += 1;
        match op {
            Opcode::HeadVoid => Ok(true),
            Opcode::HeadVarFirst | Opcode::HeadVarMatch => {
                let slot = code[*pc] as usize;
                *pc += 1;
                Ok(unify(&mut self.stack, env_base + slot, arg_addr))
            }
            Opcode::HeadConstInt => {
                let idx = code[*pc];
                *pc += 1;
                let v = *pool.ints.get(idx as usize).ok_or(VmError::BadConstantIndex(idx))?;
                Ok(unify_const(&mut self.stack, arg_addr, Cell::Int(v)))
            }
            Opcode::HeadConstFloat => {
                let idx = code[*pc];
                *pc += 1;
                let v = *pool.floats.get(idx as usize).ok_or(VmError::BadConstantIndex(idx))?;
                Ok(unify_const(&mut self.stack, arg_addr, Cell::Float(v)))
            }
            Opcode::HeadConstBool => {
                let v = code[*pc] != 0;
                *pc += 1;
                Ok(unify_const(&mut self.stack, arg_addr, Cell::Bool(v)))
            }
            Opcode::HeadConstObject | Opcode::HeadConstPredRef => {
                let idx = code[*pc];
                *pc += 1;
                let v = pool
                    .objects
                    .get(idx as usize)
                    .cloned()
                    .ok_or(VmError::BadConstantIndex(idx))?;
                Ok(unify_const(&mut self.stack, arg_addr, v))
            }
            Opcode::HeadConstFexpr => {
                let globals = HashMap::new();
                let adapter = EnvAdapter { stack: &self.stack, env_base, globals: &globals };
                let mut host = crate::bytecode::fvm::NoHostInterop;
                let (value, next_pc) =
                    fvm::eval(code, *pc, pool, &adapter, &mut host).map_err(VmError::from)?;
                *pc = next_pc;
                Ok(unify_const(&mut self.stack, arg_addr, value))
            }
            other => Err(VmError::BadOpcode(other as u8)),
        }
    }

    fn expr_scratch_pop(&mut self) -> Result<Cell, VmError> {
        self.expr_scratch.pop().ok_or(VmError::StackUnderflow)
    }

    /// Resolve a pending call into the predicate indicator and argument base
    /// `CCall`/`CLastCall`/`CSpecial` dispatch against. For `Meta`, the `Pred`
    /// cell pushed right after `EmitMetaGoal` must already have resolved to a
    /// `HostRef::PredicateRef` of matching arity (§4.3 meta-call).
    fn resolve_pending(&self, pending: PendingCall) -> Result<(PredicateIndicator, usize), VmError> {
        match pending {
            PendingCall::Static(pi, _arity, args_base) => Ok((pi, args_base)),
            PendingCall::Meta(extra_arity, args_base) => {
                let addr = self.stack.deref(args_base);
                match self.stack.get(addr) {
                    Cell::Reference(HostRef::PredicateRef(name, arity)) if *arity == extra_arity => {
                        Ok(((*name, *arity), args_base + 1))
                    }
                    Cell::Reference(HostRef::PredicateRef(name, _)) => {
                        Err(VmError::UnknownPredicate(*name, extra_arity))
                    }
                    other => Err(VmError::Fvm(crate::error::FvmError::TypeError(format!(
                        "call/N: Pred argument is not a predicate reference, got {other:?}"
                    )))),
                }
            }
        }
    }
}

enum StepOutcome {
    Continue,
    Entered,
    ClauseSucceeded,
    Fail,
}

fn clone_cp(cp: &ChoicePoint) -> ChoicePoint {
    ChoicePoint {
        pred: cp.pred,
        kind: cp.kind,
        next_index: cp.next_index,
        args_base: cp.args_base,
        arity: cp.arity,
        stack_mark: cp.stack_mark,
        trail_mark: cp.trail_mark,
        continuation: cp.continuation.clone(),
    }
}

fn clause_pool(store: &PredicateStore, pi: PredicateIndicator) -> Rc<ConstantPool> {
    store.get(pi).map(|p| p.pool.clone()).unwrap_or_else(empty_pool)
}

/// Resolve an `EmitGoal` object-pool entry (a `HostRef::PredicateRef`) into
/// the predicate indicator it names.
fn resolve_predicate_ref(pool: &ConstantPool, idx: u8) -> Result<PredicateIndicator, VmError> {
    match pool.objects.get(idx as usize) {
        Some(Cell::Reference(HostRef::PredicateRef(name, arity))) => Ok((*name, *arity)),
        _ => Err(VmError::BadConstantIndex(idx)),
    }
}

fn compare(op: Opcode, left: &Cell, right: &Cell) -> Result<bool, VmError> {
    let (l, r) = (as_f32(left)?, as_f32(right)?);
    Ok(match op {
        Opcode::BCompareLt => l < r,
        Opcode::BCompareGt => l > r,
        Opcode::BCompareLe => l <= r,
        Opcode::BCompareGe => l >= r,
        _ => unreachable!(),
    })
}

fn as_f32(c: &Cell) -> Result<f32, VmError> {
    match c {
        Cell::Int(n) => Ok(*n as f32),
        Cell::Float(f) => Ok(*f),
        other => Err(VmError::Fvm(crate::error::FvmError::TypeError(format!(
            "expected number, got {other:?}"
        )))),
    }
}

fn numeric_add(a: Cell, b: Cell) -> Result<Cell, VmError> {
    match (a, b) {
        (Cell::Int(x), Cell::Int(y)) => Ok(Cell::Int(x + y)),
        (a, b) => Ok(Cell::Float(as_f32(&a)? + as_f32(&b)?)),
    }
}

fn aggregate_extreme(op: Opcode, current: Cell, candidate: Cell) -> Result<Cell, VmError> {
    if current.is_unbound() {
        return Ok(candidate);
    }
    let (c, cand) = (as_f32(&current)?, as_f32(&candidate)?);
    let pick_candidate = match op {
        Opcode::BAggregateMaximizeUpdate => cand > c,
        Opcode::BAggregateMinimizeUpdate => cand < c,
        _ => unreachable!(),
    };
    Ok(if pick_candidate { candidate } else { current })
}

fn cell_to_throw_term(cell: Cell) -> crate::term::Term {
    match cell {
        Cell::Int(n) => crate::term::Term::Int(n),
        Cell::Float(f) => crate::term::Term::Float(f),
        Cell::Bool(b) => crate::term::Term::Bool(b),
        Cell::Reference(HostRef::Symbol(s)) => crate::term::Term::Atom(s),
        Cell::Reference(HostRef::Str(s)) => crate::term::Term::Str(s.to_string()),
        Cell::Reference(HostRef::PredicateRef(s, _)) => crate::term::Term::Atom(s),
        Cell::Unbound | Cell::StackRef(_) => crate::term::Term::Str("<unbound>".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::chunk::ChunkBuilder;
    use crate::bytecode::fvm::NoHostInterop;
    use crate::predicate::{CompiledClause, HeadSlot};
    use crate::symbol::SymbolTable;
    use crate::term::Term;

    fn fact_clause(arity_ops: &[(Opcode, &[u8])], env_size: usize) -> CompiledClause {
        let mut b = ChunkBuilder::new("fact");
        for (op, operands) in arity_ops {
            b.emit_op(*op, operands);
        }
        b.emit_op(Opcode::CNoGoal, &[]);
        CompiledClause {
            source: Term::Int(0),
            bytecode: Rc::new(b.build()),
            environment_size: env_size,
            head_model: vec![HeadSlot::Literal(Term::Int(0))],
            source_file: "<test>".into(),
            source_line: 1,
            singleton_warnings: Vec::new(),
        }
    }

    #[test]
    fn zero_arity_fact_succeeds_via_c_no_goal() {
        let mut table = SymbolTable::new();
        let p = table.intern("p");
        let mut store = PredicateStore::new();
        store.add_clause((p, 0), fact_clause(&[], 0));

        let mut vm = GoalVm::new(64, 64, 0);
        let base = vm.stack.top();
        let mut host = NoHostInterop;
        let globals = HashMap::new();
        let ok = vm.start(&store, (p, 0), base, &mut host, &globals).unwrap();
        assert!(ok);
    }

    #[test]
    fn matching_int_head_unifies_argument() {
        let mut table = SymbolTable::new();
        let p = table.intern("p");
        let mut store = PredicateStore::new();
        {
            let pred = store.entry_or_new_rule((p, 1));
            let idx = pred.pool_mut().intern_int(1).unwrap();
            pred.kind = PredicateKind::Rule(vec![fact_clause(
                &[(Opcode::HeadConstInt, &[idx])],
                0,
            )]);
        }

        let mut vm = GoalVm::new(64, 64, 0);
        let arg = vm.stack.push(Cell::Int(1));
        let mut host = NoHostInterop;
        let globals = HashMap::new();
        let ok = vm.start(&store, (p, 1), arg, &mut host, &globals).unwrap();
        assert!(ok);
    }

    #[test]
    fn mismatched_int_head_fails() {
        let mut table = SymbolTable::new();
        let p = table.intern("p");
        let mut store = PredicateStore::new();
        {
            let pred = store.entry_or_new_rule((p, 1));
            let idx = pred.pool_mut().intern_int(1).unwrap();
            pred.kind = PredicateKind::Rule(vec![fact_clause(
                &[(Opcode::HeadConstInt, &[idx])],
                0,
            )]);
        }

        let mut vm = GoalVm::new(64, 64, 0);
        let arg = vm.stack.push(Cell::Int(2));
        let mut host = NoHostInterop;
        let globals = HashMap::new();
        let ok = vm.start(&store, (p, 1), arg, &mut host, &globals).unwrap();
        assert!(!ok);
    }

    #[test]
    fn backtracking_tries_next_clause() {
        let mut table = SymbolTable::new();
        let p = table.intern("p");
        let mut store = PredicateStore::new();
        {
            let pred = store.entry_or_new_rule((p, 1));
            let one = pred.pool_mut().intern_int(1).unwrap();
            let two = pred.pool_mut().intern_int(2).unwrap();
            pred.kind = PredicateKind::Rule(vec![
                fact_clause(&[(Opcode::HeadConstInt, &[one])], 0),
                fact_clause(&[(Opcode::HeadConstInt, &[two])], 0),
            ]);
        }

        let mut vm = GoalVm::new(64, 64, 0);
        let arg = vm.stack.push(Cell::Int(2));
        let mut host = NoHostInterop;
        let globals = HashMap::new();
        let ok = vm.start(&store, (p, 1), arg, &mut host, &globals).unwrap();
        assert!(ok, "second clause should match after the first head fails");
    }

    #[test]
    fn unknown_predicate_is_an_error() {
        let mut table = SymbolTable::new();
        let p = table.intern("nope");
        let store = PredicateStore::new();
        let mut vm = GoalVm::new(64, 64, 0);
        let mut host = NoHostInterop;
        let globals = HashMap::new();
        let err = vm.start(&store, (p, 0), 0, &mut host, &globals).unwrap_err();
        assert!(matches!(err, VmError::UnknownPredicate(_, 0)));
    }
}
