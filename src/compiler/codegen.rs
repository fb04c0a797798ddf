//! Passes 2, 5, 6, 7: code generation (COMPONENT DESIGN §4.5).
//!
//! Pass 2 (macro transform) is a no-op here - macro expansion is out of
//! scope (§1 Non-goals), so a clause's head/body pass through unchanged.
//! Passes 3/4 (variable classification, slot assignment) are
//! [`super::variables::analyze`], run once per clause up front. This module
//! covers the rest: fact/rule emission (5), head-argument matching (6), and
//! body-goal emission - conjunction, disjunction, cut, the builtin opcode
//! family, and meta-call (7).

use std::collections::HashMap;
use std::rc::Rc;

use smallvec::smallvec;

use crate::bytecode::chunk::ChunkBuilder;
use crate::bytecode::fvm_opcodes::FOpcode;
use crate::bytecode::opcodes::Opcode;
use crate::compiler::declarations;
use crate::compiler::variables::{self, VarClass, VarInfo};
use crate::error::CompileError;
use crate::predicate::{
    CompiledClause, ConstantPool, HeadSlot, PredicateFlags, PredicateIndicator, PredicateKind,
    PredicateStore,
};
use crate::struct_decl::StructRegistry;
use crate::symbol::{Symbol, SymbolTable};
use crate::term::{Term, Variable};
use crate::value::{Cell, HostRef};

/// Everything code generation needs beyond one clause's own head/body: the
/// interner (declarations and gensyms mint new symbols), the predicate store
/// (disjunction creates nested predicates; ordinary calls check whether a
/// callee is a primop to pick `CSpecial` over `CCall`), and the struct
/// registry (§ struct_decl).
pub struct CodegenCtx<'a> {
    pub symtab: &'a mut SymbolTable,
    pub store: &'a mut PredicateStore,
    pub structs: &'a StructRegistry,
    gensym: u32,
    /// Compile-time diagnostics accumulated by [`emit_ordinary_call`] for
    /// calls into a `MandatoryInstantiation` predicate with a first-use
    /// variable argument (§4.5 Pass 7). Folded into the clause's
    /// `singleton_warnings` by [`compile_clause`].
    mandatory_warnings: Vec<String>,
}

impl<'a> CodegenCtx<'a> {
    pub fn new(symtab: &'a mut SymbolTable, store: &'a mut PredicateStore, structs: &'a StructRegistry) -> Self {
        CodegenCtx { symtab, store, structs, gensym: 0, mandatory_warnings: Vec::new() }
    }

    fn next_gensym(&mut self) -> u32 {
        self.gensym += 1;
        self.gensym
    }

    fn take_mandatory_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.mandatory_warnings)
    }
}

/// Head-argument vs. goal-argument opcode family (§4.3 Open Question: the
/// relationship is a lookup, [`Opcode::to_goal`], not byte arithmetic).
#[derive(Clone, Copy, PartialEq, Eq)]
enum Family {
    Head,
    Goal,
}

fn family_op(op: Opcode, family: Family) -> Opcode {
    match family {
        Family::Head => op,
        Family::Goal => op.to_goal(),
    }
}

/// Compile one clause - `head` alone for a fact, `head`/`body` for a rule -
/// into bytecode against `pi`'s predicate entry. Does not append the result
/// to the store; callers (`compiler::compile_program`, disjunction
/// expansion) do that once compilation succeeds.
pub fn compile_clause(
    ctx: &mut CodegenCtx,
    pi: PredicateIndicator,
    head: &Term,
    body: Option<&Term>,
    source_file: &str,
    source_line: u32,
) -> Result<CompiledClause, CompileError> {
    let info = variables::analyze(head, body);
    let environment_size = variables::environment_size(&info);
    let singleton_warnings = variables::singleton_warnings(&info);

    let mut pool = ctx.store.entry_or_new_rule(pi).pool.clone();
    let mut touched: HashMap<String, bool> = HashMap::new();
    let mut head_model = Vec::new();

    let chunk_name = ctx.symtab.resolve(pi.0).to_string();
    let mut b = ChunkBuilder::new(chunk_name);
    b.set_line(source_line);

    if let Term::Call(_, args) = head {
        for arg in args {
            emit_arg(ctx, &mut pool, &mut b, &info, &mut touched, arg, Some(&mut head_model), Family::Head)?;
        }
    }

    if let Some(body_term) = body {
        emit_body(ctx, &mut pool, &mut b, &info, &mut touched, body_term, true, source_line)?;
    }
    b.emit_op(Opcode::CNoGoal, &[]);

    ctx.store.entry_or_new_rule(pi).pool = pool;

    let source = match body {
        Some(body_term) => {
            let arrow = ctx.symtab.intern(":-");
            Term::Call(arrow, smallvec![head.clone(), body_term.clone()])
        }
        None => head.clone(),
    };

    let mut singleton_warnings = singleton_warnings;
    singleton_warnings.extend(ctx.take_mandatory_warnings());

    Ok(CompiledClause {
        source,
        bytecode: Rc::new(b.build()),
        environment_size,
        head_model,
        source_file: source_file.to_string(),
        source_line,
        singleton_warnings,
    })
}

fn intern_int(pool: &mut Rc<ConstantPool>, v: i64) -> Result<u8, CompileError> {
    Rc::make_mut(pool).intern_int(v).map_err(CompileError::ConstantPoolOverflow)
}

fn intern_float(pool: &mut Rc<ConstantPool>, v: f32) -> Result<u8, CompileError> {
    Rc::make_mut(pool).intern_float(v).map_err(CompileError::ConstantPoolOverflow)
}

fn intern_object(pool: &mut Rc<ConstantPool>, v: Cell) -> Result<u8, CompileError> {
    Rc::make_mut(pool).intern_object(v).map_err(CompileError::ConstantPoolOverflow)
}

/// Emit one head argument (Pass 6) or goal argument (part of Pass 7),
/// sharing the same per-variant logic and letting `family` pick head vs.
/// goal opcodes.
fn emit_arg(
    ctx: &mut CodegenCtx,
    pool: &mut Rc<ConstantPool>,
    b: &mut ChunkBuilder,
    info: &VarInfo,
    touched: &mut HashMap<String, bool>,
    term: &Term,
    mut head_model: Option<&mut Vec<HeadSlot>>,
    family: Family,
) -> Result<(), CompileError> {
    match term {
        Term::Var(v) => match info.classes.get(&v.name) {
            Some(VarClass::Permanent(slot)) => {
                let slot = *slot;
                let already_touched = *touched.get(&v.name).unwrap_or(&false);
                let op = if already_touched { Opcode::HeadVarMatch } else { Opcode::HeadVarFirst };
                b.emit_op(family_op(op, family), &[slot]);
                touched.insert(v.name.clone(), true);
                if let Some(hm) = head_model.as_deref_mut() {
                    hm.push(HeadSlot::EnvSlot(slot as usize));
                }
            }
            _ => {
                b.emit_op(family_op(Opcode::HeadVoid, family), &[]);
                if let Some(hm) = head_model.as_deref_mut() {
                    hm.push(HeadSlot::Literal(term.clone()));
                }
            }
        },
        Term::Int(n) => {
            let idx = intern_int(pool, *n)?;
            b.emit_op(family_op(Opcode::HeadConstInt, family), &[idx]);
            if let Some(hm) = head_model.as_deref_mut() {
                hm.push(HeadSlot::Literal(term.clone()));
            }
        }
        Term::Float(f) => {
            let idx = intern_float(pool, *f)?;
            b.emit_op(family_op(Opcode::HeadConstFloat, family), &[idx]);
            if let Some(hm) = head_model.as_deref_mut() {
                hm.push(HeadSlot::Literal(term.clone()));
            }
        }
        Term::Bool(v) => {
            b.emit_op(family_op(Opcode::HeadConstBool, family), &[*v as u8]);
            if let Some(hm) = head_model.as_deref_mut() {
                hm.push(HeadSlot::Literal(term.clone()));
            }
        }
        Term::Str(s) => {
            let idx = intern_object(pool, Cell::Reference(HostRef::Str(Rc::from(s.as_str()))))?;
            b.emit_op(family_op(Opcode::HeadConstObject, family), &[idx]);
            if let Some(hm) = head_model.as_deref_mut() {
                hm.push(HeadSlot::Literal(term.clone()));
            }
        }
        Term::Atom(sym) => {
            let idx = intern_object(pool, Cell::Reference(HostRef::Symbol(*sym)))?;
            b.emit_op(family_op(Opcode::HeadConstObject, family), &[idx]);
            if let Some(hm) = head_model.as_deref_mut() {
                hm.push(HeadSlot::Literal(term.clone()));
            }
        }
        Term::Call(..) => {
            if let Some(pref) = declarations::predicate_indicator(term, ctx.symtab) {
                let idx = intern_object(pool, Cell::Reference(HostRef::PredicateRef(pref.0, pref.1)))?;
                b.emit_op(family_op(Opcode::HeadConstPredRef, family), &[idx]);
            } else {
                b.emit_op(family_op(Opcode::HeadConstFexpr, family), &[]);
                compile_fexpr_into(ctx, pool, b, info, touched, term)?;
                b.emit_fop(FOpcode::Return, &[]);
            }
            if let Some(hm) = head_model.as_deref_mut() {
                hm.push(HeadSlot::Literal(term.clone()));
            }
        }
    }
    Ok(())
}

/// Compile one functional expression's F-VM program, without the
/// `HeadConstFexpr`/`GoalConstFexpr`/`BEvalExpr` wrapper opcode or the
/// trailing `Return` - callers add those, since `Return` isn't emitted here
/// for nested sub-expressions.
fn compile_fexpr_into(
    ctx: &mut CodegenCtx,
    pool: &mut Rc<ConstantPool>,
    b: &mut ChunkBuilder,
    info: &VarInfo,
    touched: &HashMap<String, bool>,
    term: &Term,
) -> Result<(), CompileError> {
    match term {
        Term::Int(n) => {
            if let Ok(small) = i8::try_from(*n) {
                b.emit_fop(FOpcode::PushSmallInt, &[small as u8]);
            } else {
                let idx = intern_int(pool, *n)?;
                b.emit_fop(FOpcode::PushInt, &[idx]);
            }
        }
        Term::Float(f) => {
            let idx = intern_float(pool, *f)?;
            b.emit_fop(FOpcode::PushFloat, &[idx]);
        }
        Term::Bool(v) => b.emit_fop(FOpcode::PushBoolean, &[*v as u8]),
        Term::Str(s) => {
            let idx = intern_object(pool, Cell::Reference(HostRef::Str(Rc::from(s.as_str()))))?;
            b.emit_fop(FOpcode::PushObject, &[idx]);
        }
        Term::Atom(sym) => {
            let idx = intern_object(pool, Cell::Reference(HostRef::Symbol(*sym)))?;
            b.emit_fop(FOpcode::PushObject, &[idx]);
        }
        Term::Var(v) => match info.classes.get(&v.name) {
            Some(VarClass::Permanent(slot)) => {
                let _ = touched;
                b.emit_fop(FOpcode::Load, &[*slot]);
            }
            _ => {
                return Err(CompileError::BadDeclaration(format!(
                    "variable {} has no prior binding to read in an expression",
                    v.name
                )))
            }
        },
        Term::Call(functor, args) => {
            let name = ctx.symtab.resolve(*functor).to_string();
            match (name.as_str(), args.len()) {
                ("+", 2) => emit_binary_arith(ctx, pool, b, info, touched, args, FOpcode::Add)?,
                ("-", 2) => emit_binary_arith(ctx, pool, b, info, touched, args, FOpcode::Subtract)?,
                ("*", 2) => emit_binary_arith(ctx, pool, b, info, touched, args, FOpcode::Multiply)?,
                ("/", 2) => emit_binary_arith(ctx, pool, b, info, touched, args, FOpcode::Divide)?,
                ("-", 1) => {
                    compile_fexpr_into(ctx, pool, b, info, touched, &args[0])?;
                    b.emit_fop(FOpcode::Negate, &[]);
                }
                _ => {
                    if ctx.structs.is_struct_shape((*functor, args.len())) {
                        let ty_idx = intern_object(pool, Cell::Reference(HostRef::Symbol(*functor)))?;
                        b.emit_fop(FOpcode::PushObject, &[ty_idx]);
                        for a in args {
                            compile_fexpr_into(ctx, pool, b, info, touched, a)?;
                        }
                        b.emit_fop(FOpcode::Constructor, &[args.len() as u8]);
                    } else {
                        return Err(CompileError::UnsupportedHead(format!(
                            "{name}/{} is not a known struct or arithmetic functor in expression position",
                            args.len()
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

fn emit_binary_arith(
    ctx: &mut CodegenCtx,
    pool: &mut Rc<ConstantPool>,
    b: &mut ChunkBuilder,
    info: &VarInfo,
    touched: &HashMap<String, bool>,
    args: &[Term],
    op: FOpcode,
) -> Result<(), CompileError> {
    compile_fexpr_into(ctx, pool, b, info, touched, &args[0])?;
    compile_fexpr_into(ctx, pool, b, info, touched, &args[1])?;
    b.emit_fop(op, &[]);
    Ok(())
}

fn emit_evalexpr(
    ctx: &mut CodegenCtx,
    pool: &mut Rc<ConstantPool>,
    b: &mut ChunkBuilder,
    info: &VarInfo,
    touched: &HashMap<String, bool>,
    term: &Term,
) -> Result<(), CompileError> {
    b.emit_op(Opcode::BEvalExpr, &[]);
    compile_fexpr_into(ctx, pool, b, info, touched, term)?;
    b.emit_fop(FOpcode::Return, &[]);
    Ok(())
}

fn require_permanent_slot(info: &VarInfo, term: &Term) -> Result<u8, CompileError> {
    match term {
        Term::Var(v) => match info.classes.get(&v.name) {
            Some(VarClass::Permanent(slot)) => Ok(*slot),
            _ => Err(CompileError::BadDeclaration(format!(
                "{} must occur more than once to be addressed by slot here",
                v.name
            ))),
        },
        _ => Err(CompileError::BadDeclaration("expected a variable argument".to_string())),
    }
}

#[derive(Clone, Copy)]
enum TypeTest {
    Var,
    Nonvar,
    Missing,
    Integer,
    Float,
    Number,
    String,
    Symbol,
}

/// `var/1`, `nonvar/1`, and the five type tests: specialize at compile time
/// whenever the argument is provably still fresh (never yet bound in this
/// clause) or is a literal constant, per §4.5's builtin specialization note.
fn emit_type_test(
    b: &mut ChunkBuilder,
    info: &VarInfo,
    touched: &HashMap<String, bool>,
    arg: &Term,
    kind: TypeTest,
) -> Result<(), CompileError> {
    match arg {
        Term::Var(v) => {
            let is_touched_permanent = matches!(info.classes.get(&v.name), Some(VarClass::Permanent(_)))
                && *touched.get(&v.name).unwrap_or(&false);
            if is_touched_permanent {
                let Some(VarClass::Permanent(slot)) = info.classes.get(&v.name) else { unreachable!() };
                let op = match kind {
                    TypeTest::Var => Opcode::BVar,
                    TypeTest::Nonvar => Opcode::BNonvar,
                    TypeTest::Missing => Opcode::BTypeIsMissing,
                    TypeTest::Integer => Opcode::BTypeIsInteger,
                    TypeTest::Float => Opcode::BTypeIsFloat,
                    TypeTest::Number => Opcode::BTypeIsNumber,
                    TypeTest::String => Opcode::BTypeIsString,
                    TypeTest::Symbol => Opcode::BTypeIsSymbol,
                };
                b.emit_op(op, &[*slot]);
            } else {
                // Never yet bound in this clause: statically known fresh/Unbound.
                match kind {
                    TypeTest::Var | TypeTest::Missing => {}
                    _ => {
                        b.emit_op(Opcode::BFail, &[]);
                    }
                }
            }
        }
        literal => {
            let succeeds = match kind {
                TypeTest::Var | TypeTest::Missing => false,
                TypeTest::Nonvar => true,
                TypeTest::Integer => matches!(literal, Term::Int(_)),
                TypeTest::Float => matches!(literal, Term::Float(_)),
                TypeTest::Number => matches!(literal, Term::Int(_) | Term::Float(_)),
                TypeTest::String => matches!(literal, Term::Str(_)),
                TypeTest::Symbol => matches!(literal, Term::Atom(_)),
            };
            if !succeeds {
                b.emit_op(Opcode::BFail, &[]);
            }
        }
    }
    Ok(())
}

/// Emit one body goal (Pass 7). `tail` marks whether this goal is in true
/// tail position (nothing left to run in the clause after it succeeds),
/// which picks `CLastCall` over `CCall` for ordinary predicate calls.
fn emit_body(
    ctx: &mut CodegenCtx,
    pool: &mut Rc<ConstantPool>,
    b: &mut ChunkBuilder,
    info: &VarInfo,
    touched: &mut HashMap<String, bool>,
    term: &Term,
    tail: bool,
    line: u32,
) -> Result<(), CompileError> {
    b.set_line(line);

    if let Term::Bool(v) = term {
        if !*v {
            b.emit_op(Opcode::BFail, &[]);
        }
        return Ok(());
    }

    if let Term::Atom(sym) = term {
        match ctx.symtab.resolve(*sym) {
            "!" => {
                b.emit_op(Opcode::CCut, &[]);
                return Ok(());
            }
            "fail" => {
                b.emit_op(Opcode::BFail, &[]);
                return Ok(());
            }
            "true" => return Ok(()),
            "call_failed" => {
                b.emit_op(Opcode::BCallFailed, &[]);
                return Ok(());
            }
            _ => {}
        }
    }

    if let Term::Call(functor, args) = term {
        let name = ctx.symtab.resolve(*functor).to_string();
        match (name.as_str(), args.len()) {
            (",", 2) => {
                emit_body(ctx, pool, b, info, touched, &args[0], false, line)?;
                return emit_body(ctx, pool, b, info, touched, &args[1], tail, line);
            }
            (";", 2) => return emit_disjunction(ctx, pool, b, info, touched, term, tail, line),
            ("var", 1) => return emit_type_test(b, info, touched, &args[0], TypeTest::Var),
            ("nonvar", 1) => return emit_type_test(b, info, touched, &args[0], TypeTest::Nonvar),
            ("missing", 1) => return emit_type_test(b, info, touched, &args[0], TypeTest::Missing),
            ("integer", 1) => return emit_type_test(b, info, touched, &args[0], TypeTest::Integer),
            ("float", 1) => return emit_type_test(b, info, touched, &args[0], TypeTest::Float),
            ("number", 1) => return emit_type_test(b, info, touched, &args[0], TypeTest::Number),
            ("string", 1) => return emit_type_test(b, info, touched, &args[0], TypeTest::String),
            ("symbol", 1) => return emit_type_test(b, info, touched, &args[0], TypeTest::Symbol),
            ("<", 2) | (">", 2) | ("=<", 2) | (">=", 2) => {
                emit_evalexpr(ctx, pool, b, info, touched, &args[0])?;
                emit_evalexpr(ctx, pool, b, info, touched, &args[1])?;
                let op = match name.as_str() {
                    "<" => Opcode::BCompareLt,
                    ">" => Opcode::BCompareGt,
                    "=<" => Opcode::BCompareLe,
                    ">=" => Opcode::BCompareGe,
                    _ => unreachable!(),
                };
                b.emit_op(op, &[]);
                return Ok(());
            }
            ("unsafe_set", 2) => {
                let slot = require_permanent_slot(info, &args[0])?;
                emit_evalexpr(ctx, pool, b, info, touched, &args[1])?;
                b.emit_op(Opcode::BUnsafeSet, &[slot]);
                if let Term::Var(v) = &args[0] {
                    touched.insert(v.name.clone(), true);
                }
                return Ok(());
            }
            ("unsafe_initialize", 1) => {
                let slot = require_permanent_slot(info, &args[0])?;
                b.emit_op(Opcode::BUnsafeInitialize, &[slot]);
                return Ok(());
            }
            ("unsafe_initialize_zero", 1) => {
                let slot = require_permanent_slot(info, &args[0])?;
                b.emit_op(Opcode::BUnsafeInitializeZero, &[slot]);
                return Ok(());
            }
            ("unsafe_initialize_zero_int", 1) => {
                let slot = require_permanent_slot(info, &args[0])?;
                b.emit_op(Opcode::BUnsafeInitializeZeroInt, &[slot]);
                return Ok(());
            }
            ("maximize_update", 2) => {
                let slot = require_permanent_slot(info, &args[0])?;
                emit_evalexpr(ctx, pool, b, info, touched, &args[1])?;
                b.emit_op(Opcode::BAggregateMaximizeUpdate, &[slot]);
                return Ok(());
            }
            ("minimize_update", 2) => {
                let slot = require_permanent_slot(info, &args[0])?;
                emit_evalexpr(ctx, pool, b, info, touched, &args[1])?;
                b.emit_op(Opcode::BAggregateMinimizeUpdate, &[slot]);
                return Ok(());
            }
            ("sum_update_and_repeat", 2) => {
                let slot = require_permanent_slot(info, &args[0])?;
                emit_evalexpr(ctx, pool, b, info, touched, &args[1])?;
                b.emit_op(Opcode::BAggregateSumUpdateAndRepeat, &[slot]);
                return Ok(());
            }
            ("inc_and_repeat", 1) => {
                let slot = require_permanent_slot(info, &args[0])?;
                b.emit_op(Opcode::BAggregateIncAndRepeat, &[slot]);
                return Ok(());
            }
            ("throw", 1) => {
                emit_evalexpr(ctx, pool, b, info, touched, &args[0])?;
                b.emit_op(Opcode::BThrow, &[]);
                return Ok(());
            }
            ("call", n) if n >= 1 => {
                return emit_meta_call(ctx, pool, b, info, touched, &args[0], &args[1..], tail);
            }
            _ => {}
        }
    }

    emit_ordinary_call(ctx, pool, b, info, touched, term, tail)
}

fn emit_ordinary_call(
    ctx: &mut CodegenCtx,
    pool: &mut Rc<ConstantPool>,
    b: &mut ChunkBuilder,
    info: &VarInfo,
    touched: &mut HashMap<String, bool>,
    term: &Term,
    tail: bool,
) -> Result<(), CompileError> {
    let (functor, args): (Symbol, &[Term]) = match term {
        Term::Atom(s) => (*s, &[]),
        Term::Call(s, a) => (*s, a.as_slice()),
        _ => return Err(CompileError::UnsupportedHead("body goal must be a callable term".to_string())),
    };
    let pi: PredicateIndicator = (functor, args.len());
    let flags = ctx.store.get(pi).map(|p| p.flags).unwrap_or(PredicateFlags::empty());
    if flags.contains(PredicateFlags::MANDATORY_INSTANTIATION) {
        for arg in args {
            if let Term::Var(v) = arg {
                if !*touched.get(&v.name).unwrap_or(&false) {
                    let callee = ctx.symtab.resolve(functor);
                    ctx.mandatory_warnings.push(format!(
                        "{callee}/{}: argument `{}` is a first-use variable but the predicate requires mandatory instantiation",
                        args.len(),
                        v.name
                    ));
                }
            }
        }
    }
    let idx = intern_object(pool, Cell::Reference(HostRef::PredicateRef(functor, args.len())))?;
    b.emit_op(Opcode::EmitGoal, &[idx, args.len() as u8]);
    for arg in args {
        emit_arg(ctx, pool, b, info, touched, arg, None, Family::Goal)?;
    }
    let is_primop = ctx
        .store
        .get(pi)
        .map(|p| matches!(p.kind, PredicateKind::Primop(_)))
        .unwrap_or(false);
    if is_primop {
        b.emit_op(Opcode::CSpecial, &[]);
    } else {
        b.emit_op(if tail { Opcode::CLastCall } else { Opcode::CCall }, &[]);
    }
    Ok(())
}

/// `call(Pred, Arg1, ..., ArgN)`: if `Pred` is a compile-time `Name/Arity`
/// literal, dispatch exactly like an ordinary call; otherwise emit
/// `EmitMetaGoal` and let the VM resolve `Pred` at run time (§4.3 meta-call).
fn emit_meta_call(
    ctx: &mut CodegenCtx,
    pool: &mut Rc<ConstantPool>,
    b: &mut ChunkBuilder,
    info: &VarInfo,
    touched: &mut HashMap<String, bool>,
    pred_term: &Term,
    extra_args: &[Term],
    tail: bool,
) -> Result<(), CompileError> {
    if let Some(pi) = declarations::predicate_indicator(pred_term, ctx.symtab) {
        if pi.1 != extra_args.len() {
            return Err(CompileError::ArityMismatch {
                name: format!("call/{}", extra_args.len() + 1),
                expected: pi.1,
                got: extra_args.len(),
            });
        }
        let idx = intern_object(pool, Cell::Reference(HostRef::PredicateRef(pi.0, pi.1)))?;
        b.emit_op(Opcode::EmitGoal, &[idx, pi.1 as u8]);
        for a in extra_args {
            emit_arg(ctx, pool, b, info, touched, a, None, Family::Goal)?;
        }
        b.emit_op(if tail { Opcode::CLastCall } else { Opcode::CCall }, &[]);
    } else {
        b.emit_op(Opcode::EmitMetaGoal, &[extra_args.len() as u8]);
        emit_arg(ctx, pool, b, info, touched, pred_term, None, Family::Goal)?;
        for a in extra_args {
            emit_arg(ctx, pool, b, info, touched, a, None, Family::Goal)?;
        }
        b.emit_op(if tail { Opcode::CLastCall } else { Opcode::CCall }, &[]);
    }
    Ok(())
}

fn flatten_disjunction(symtab: &SymbolTable, term: &Term, out: &mut Vec<Term>) {
    if let Term::Call(functor, args) = term {
        if symtab.resolve(*functor) == ";" && args.len() == 2 {
            flatten_disjunction(symtab, &args[0], out);
            flatten_disjunction(symtab, &args[1], out);
            return;
        }
    }
    out.push(term.clone());
}

fn substitute_vars(term: &Term, subst: &HashMap<String, String>) -> Term {
    match term {
        Term::Var(v) => match subst.get(&v.name) {
            Some(new_name) => Term::Var(Variable::generated(new_name.clone())),
            None => term.clone(),
        },
        Term::Call(functor, args) => {
            Term::Call(*functor, args.iter().map(|a| substitute_vars(a, subst)).collect())
        }
        other => other.clone(),
    }
}

/// `A ; B ; ...`: each disjunct becomes one clause of a fresh nested
/// predicate (§4.3), called with the enclosing clause's own permanent
/// variables passed through by reference (`StackRef`), so bindings made
/// inside a disjunct are visible to the rest of the enclosing clause. The
/// nested predicate inherits the enclosing clause's constant pool by
/// cloning its `Rc` at creation (§3 "disjunction... inherits the enclosing
/// predicate's constant pool").
///
/// Cut inside a disjunct only discards choice points created within that
/// nested call, not the enclosing clause's - see DESIGN.md for why
/// cut-transparency across the materialized nested predicate was not worth
/// the extra plumbing here.
fn emit_disjunction(
    ctx: &mut CodegenCtx,
    pool: &mut Rc<ConstantPool>,
    b: &mut ChunkBuilder,
    info: &VarInfo,
    touched: &mut HashMap<String, bool>,
    term: &Term,
    tail: bool,
    line: u32,
) -> Result<(), CompileError> {
    let mut disjuncts = Vec::new();
    flatten_disjunction(ctx.symtab, term, &mut disjuncts);

    let arity = variables::environment_size(info);
    let mut slot_names = vec![String::new(); arity];
    for (name, class) in info.classes.iter() {
        if let VarClass::Permanent(slot) = class {
            slot_names[*slot as usize] = name.clone();
        }
    }

    let nested_name = format!("$disj_{}", ctx.next_gensym());
    let nested_sym = ctx.symtab.intern(&nested_name);
    let nested_pi: PredicateIndicator = (nested_sym, arity);

    {
        let nested_pred = ctx.store.entry_or_new_rule(nested_pi);
        nested_pred.flags.insert(PredicateFlags::IS_NESTED_PREDICATE);
        if nested_pred.clauses().is_empty() {
            nested_pred.pool = pool.clone();
        }
    }

    let alias_names: Vec<String> = (0..arity).map(|i| format!("__d{i}")).collect();
    let subst: HashMap<String, String> = slot_names
        .iter()
        .cloned()
        .zip(alias_names.iter().cloned())
        .filter(|(name, _)| !name.is_empty())
        .collect();

    for disjunct in &disjuncts {
        let substituted_body = substitute_vars(disjunct, &subst);
        let nested_head = Term::Call(
            nested_sym,
            alias_names.iter().map(|n| Term::Var(Variable::generated(n.clone()))).collect(),
        );
        let compiled = compile_clause(ctx, nested_pi, &nested_head, Some(&substituted_body), "<disjunction>", line)?;
        ctx.store.add_clause(nested_pi, compiled);
    }

    let idx = intern_object(pool, Cell::Reference(HostRef::PredicateRef(nested_sym, arity)))?;
    b.emit_op(Opcode::EmitGoal, &[idx, arity as u8]);
    for name in &slot_names {
        let Some(VarClass::Permanent(slot)) = info.classes.get(name) else { unreachable!() };
        let already_touched = *touched.get(name).unwrap_or(&false);
        let op = if already_touched { Opcode::GoalVarMatch } else { Opcode::GoalVarFirst };
        b.emit_op(op, &[*slot]);
        touched.insert(name.clone(), true);
    }
    b.emit_op(if tail { Opcode::CLastCall } else { Opcode::CCall }, &[]);
    Ok(())
}

/// Compile a standalone top-level query: every variable in it (other than
/// `_`-prefixed ones) gets a permanent slot regardless of occurrence count,
/// since a query's whole point is reporting bindings back once it succeeds -
/// unlike a clause head/body, it has no caller argument list to fold
/// single-use variables away against. Returns the finished chunk, the pool it
/// was compiled against, and the `(name, slot)` pairs [`crate::engine::Engine`]
/// reads bindings back through.
pub fn compile_query(
    ctx: &mut CodegenCtx,
    term: &Term,
) -> Result<(Rc<crate::bytecode::chunk::BytecodeChunk>, Rc<ConstantPool>, Vec<(String, u8)>), CompileError> {
    let info = variables::analyze_query(term);
    let mut pool: Rc<ConstantPool> = Rc::new(ConstantPool::default());
    let mut touched: HashMap<String, bool> = HashMap::new();

    let mut b = ChunkBuilder::new("<query>");
    b.set_line(1);
    emit_body(ctx, &mut pool, &mut b, &info, &mut touched, term, true, 1)?;
    b.emit_op(Opcode::CNoGoal, &[]);

    let mut vars: Vec<(String, u8)> = info
        .classes
        .iter()
        .filter_map(|(name, class)| match class {
            VarClass::Permanent(slot) => Some((name.clone(), *slot)),
            VarClass::Void => None,
        })
        .collect();
    vars.sort_by_key(|(_, slot)| *slot);

    Ok((Rc::new(b.build()), pool, vars))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fact_compiles_head_consts_and_terminates() {
        let mut symtab = SymbolTable::new();
        let mut store = PredicateStore::new();
        let structs = StructRegistry::new();
        let p = symtab.intern("p");
        let head = Term::Call(p, smallvec![Term::Int(1), Term::Int(2)]);
        let mut ctx = CodegenCtx::new(&mut symtab, &mut store, &structs);
        let clause = compile_clause(&mut ctx, (p, 2), &head, None, "<test>", 1).unwrap();
        assert_eq!(clause.environment_size, 0);
        assert_eq!(clause.head_model.len(), 2);
        assert!(clause.bytecode.code.contains(&(Opcode::CNoGoal as u8)));
    }

    #[test]
    fn rule_with_comparison_body_compiles() {
        let mut symtab = SymbolTable::new();
        let mut store = PredicateStore::new();
        let structs = StructRegistry::new();
        let p = symtab.intern("p");
        let lt = symtab.intern("<");
        let head = Term::Call(p, smallvec![Term::Var(Variable::named("X"))]);
        let body = Term::Call(lt, smallvec![Term::Var(Variable::named("X")), Term::Int(10)]);
        let mut ctx = CodegenCtx::new(&mut symtab, &mut store, &structs);
        let clause = compile_clause(&mut ctx, (p, 1), &head, Some(&body), "<test>", 1).unwrap();
        assert!(clause.bytecode.code.contains(&(Opcode::BCompareLt as u8)));
    }

    #[test]
    fn disjunction_creates_a_nested_predicate() {
        let mut symtab = SymbolTable::new();
        let mut store = PredicateStore::new();
        let structs = StructRegistry::new();
        let q = symtab.intern("q");
        let semi = symtab.intern(";");
        let eq = symtab.intern("=");
        store.define_primop((eq, 2), |stack, base, _arity| Ok(crate::unify::unify(stack, base, base + 1)));
        let head = Term::Call(q, smallvec![Term::Var(Variable::named("X"))]);
        let left = Term::Call(eq, smallvec![Term::Var(Variable::named("X")), Term::Int(5)]);
        let right = Term::Call(eq, smallvec![Term::Var(Variable::named("X")), Term::Int(7)]);
        let body = Term::Call(semi, smallvec![left, right]);
        let mut ctx = CodegenCtx::new(&mut symtab, &mut store, &structs);
        let clause = compile_clause(&mut ctx, (q, 1), &head, Some(&body), "<test>", 1).unwrap();
        assert!(clause.bytecode.code.contains(&(Opcode::EmitGoal as u8)));
        let disj_count = store
            .get((symtab.intern("$disj_1"), 1))
            .map(|p| p.clauses().len())
            .unwrap_or(0);
        assert_eq!(disj_count, 2);
    }

    #[test]
    fn call_with_static_indicator_dispatches_like_an_ordinary_call() {
        let mut symtab = SymbolTable::new();
        let mut store = PredicateStore::new();
        let structs = StructRegistry::new();
        let q = symtab.intern("q");
        let p = symtab.intern("p");
        let call_sym = symtab.intern("call");
        let slash = symtab.intern("/");
        let pi_lit = Term::Call(slash, smallvec![Term::Atom(p), Term::Int(1)]);
        let head = Term::Atom(q);
        let body = Term::Call(call_sym, smallvec![pi_lit, Term::Int(1)]);
        let mut ctx = CodegenCtx::new(&mut symtab, &mut store, &structs);
        let clause = compile_clause(&mut ctx, (q, 0), &head, Some(&body), "<test>", 1).unwrap();
        assert!(!clause.bytecode.code.contains(&(Opcode::EmitMetaGoal as u8)));
        assert!(clause.bytecode.code.contains(&(Opcode::EmitGoal as u8)));
    }

    #[test]
    fn compile_query_keeps_single_use_variable_permanent() {
        let mut symtab = SymbolTable::new();
        let mut store = PredicateStore::new();
        let structs = StructRegistry::new();
        let p = symtab.intern("p");
        let term = Term::Call(p, smallvec![Term::Var(Variable::named("X"))]);
        let mut ctx = CodegenCtx::new(&mut symtab, &mut store, &structs);
        let (chunk, _pool, vars) = compile_query(&mut ctx, &term).unwrap();
        assert_eq!(vars, vec![("X".to_string(), 0)]);
        assert!(chunk.code.contains(&(Opcode::CNoGoal as u8)));
    }

    #[test]
    fn compile_query_ignores_underscore_variables() {
        let mut symtab = SymbolTable::new();
        let mut store = PredicateStore::new();
        let structs = StructRegistry::new();
        let p = symtab.intern("p");
        let term = Term::Call(p, smallvec![Term::Var(Variable::named("_")), Term::Var(Variable::named("Y"))]);
        let mut ctx = CodegenCtx::new(&mut symtab, &mut store, &structs);
        let (_chunk, _pool, vars) = compile_query(&mut ctx, &term).unwrap();
        assert_eq!(vars, vec![("Y".to_string(), 0)]);
    }

    #[test]
    fn call_with_variable_predicate_uses_meta_goal() {
        let mut symtab = SymbolTable::new();
        let mut store = PredicateStore::new();
        let structs = StructRegistry::new();
        let q = symtab.intern("q");
        let call_sym = symtab.intern("call");
        let head = Term::Call(q, smallvec![Term::Var(Variable::named("P"))]);
        let body = Term::Call(call_sym, smallvec![Term::Var(Variable::named("P"))]);
        let mut ctx = CodegenCtx::new(&mut symtab, &mut store, &structs);
        let clause = compile_clause(&mut ctx, (q, 1), &head, Some(&body), "<test>", 1).unwrap();
        assert!(clause.bytecode.code.contains(&(Opcode::EmitMetaGoal as u8)));
    }
}
