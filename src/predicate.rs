//! The predicate/clause store (COMPONENT DESIGN §4.6).
//!
//! Append-only per predicate indicator. A predicate is one of three tagged
//! kinds - rule clauses, a table (row-backed extension), or a primop (native
//! callback) - discriminated at call time rather than through an inheritance
//! hierarchy (DESIGN NOTES §9).

use std::collections::HashMap;
use std::rc::Rc;

use crate::bytecode::chunk::BytecodeChunk;
use crate::error::VmError;
use crate::symbol::Symbol;
use crate::term::Term;
use crate::value::{Cell, Stack};

/// `(Symbol, arity)` - the identity key for predicates.
pub type PredicateIndicator = (Symbol, usize);

/// One slot of a clause's head model: used to reconstruct the head term for
/// tracing/listing without re-walking the bytecode.
#[derive(Debug, Clone, PartialEq)]
pub enum HeadSlot {
    Literal(Term),
    EnvSlot(usize),
}

/// One compiled clause (COMPONENT DESIGN §3 `CompiledClause`).
#[derive(Debug, Clone)]
pub struct CompiledClause {
    pub source: Term,
    pub bytecode: Rc<BytecodeChunk>,
    pub environment_size: usize,
    pub head_model: Vec<HeadSlot>,
    pub source_file: String,
    pub source_line: u32,
    /// Singleton-variable names flagged after compilation (§4.5).
    pub singleton_warnings: Vec<String>,
}

/// The per-predicate literal pools bytecode constant-pool indices resolve
/// against. Capped at 255 entries per pool (DATA MODEL §3 invariant).
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    pub ints: Vec<i64>,
    pub floats: Vec<f32>,
    pub objects: Vec<Cell>,
}

impl ConstantPool {
    pub fn intern_int(&mut self, v: i64) -> Result<u8, String> {
        if let Some(idx) = self.ints.iter().position(|x| *x == v) {
            return Ok(idx as u8);
        }
        if self.ints.len() >= 255 {
            return Err("int pool overflow".to_string());
        }
        self.ints.push(v);
        Ok((self.ints.len() - 1) as u8)
    }

    pub fn intern_float(&mut self, v: f32) -> Result<u8, String> {
        if let Some(idx) = self.floats.iter().position(|x| *x == v) {
            return Ok(idx as u8);
        }
        if self.floats.len() >= 255 {
            return Err("float pool overflow".to_string());
        }
        self.floats.push(v);
        Ok((self.floats.len() - 1) as u8)
    }

    pub fn intern_object(&mut self, v: Cell) -> Result<u8, String> {
        if let Some(idx) = self.objects.iter().position(|x| *x == v) {
            return Ok(idx as u8);
        }
        if self.objects.len() >= 255 {
            return Err("object pool overflow".to_string());
        }
        self.objects.push(v);
        Ok((self.objects.len() - 1) as u8)
    }
}

/// A native callback backing a primop predicate. Receives the unification
/// stack and the `[args_base, args_base + arity)` range of the call's
/// argument cells; returns whether the call succeeds. Primops are
/// deterministic - unlike rule clauses they never create a choice point.
pub type PrimopFn = fn(&mut Stack, args_base: usize, arity: usize) -> Result<bool, VmError>;

/// A row-backed table extension (`LoadTable`/`DefineTable`, §6).
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub arity: usize,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(arity: usize) -> Self {
        Table { arity, rows: Vec::new() }
    }

    pub fn assert_row(&mut self, row: Vec<Cell>) -> Result<(), String> {
        if row.len() != self.arity {
            return Err(format!(
                "row width {} does not match table arity {}",
                row.len(),
                self.arity
            ));
        }
        self.rows.push(row);
        Ok(())
    }
}

/// The tagged predicate-kind variants (DESIGN NOTES §9).
#[derive(Debug, Clone)]
pub enum PredicateKind {
    Rule(Vec<CompiledClause>),
    TablePredicate(Table),
    Primop(PrimopFn),
}

/// Predicate flags (DATA MODEL §3). A plain bitset over `u8` - the flag set
/// is small and fixed, so a dependency on `bitflags` buys nothing here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PredicateFlags(u8);

impl PredicateFlags {
    pub const IS_SPECIAL: PredicateFlags = PredicateFlags(0b0000_0001);
    pub const IS_TABLE: PredicateFlags = PredicateFlags(0b0000_0010);
    pub const IS_TRACED: PredicateFlags = PredicateFlags(0b0000_0100);
    pub const IS_NESTED_PREDICATE: PredicateFlags = PredicateFlags(0b0000_1000);
    pub const IS_EXTERNALLY_CALLED: PredicateFlags = PredicateFlags(0b0001_0000);
    pub const MANDATORY_INSTANTIATION: PredicateFlags = PredicateFlags(0b0010_0000);

    pub const fn empty() -> Self {
        PredicateFlags(0)
    }

    pub fn contains(self, other: PredicateFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PredicateFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PredicateFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for PredicateFlags {
    type Output = PredicateFlags;
    fn bitor(self, rhs: PredicateFlags) -> PredicateFlags {
        PredicateFlags(self.0 | rhs.0)
    }
}

/// A predicate: its kind, flags, constant pools, and optional signature.
///
/// `pool` is `Rc<ConstantPool>` rather than a bare `ConstantPool`: a disjunction's
/// nested predicate (§4.3) inherits the enclosing predicate's pool by cloning this
/// `Rc` at creation time, and a running clause's [`crate::bytecode::vm::GoalVm`]
/// frame holds its own cheap clone for the lifetime of the call - matching "once
/// execution begins on a clause, its constant pool is treated as read-only"
/// (DATA MODEL invariants).
#[derive(Debug, Clone)]
pub struct Predicate {
    pub indicator: PredicateIndicator,
    pub kind: PredicateKind,
    pub flags: PredicateFlags,
    pub pool: Rc<ConstantPool>,
    /// `signature/1` declaration: a type-name tuple for documentation/tables.
    pub signature: Option<Vec<Symbol>>,
}

impl Predicate {
    pub fn new_rule(indicator: PredicateIndicator) -> Self {
        Predicate {
            indicator,
            kind: PredicateKind::Rule(Vec::new()),
            flags: PredicateFlags::empty(),
            pool: Rc::new(ConstantPool::default()),
            signature: None,
        }
    }

    pub fn clauses(&self) -> &[CompiledClause] {
        match &self.kind {
            PredicateKind::Rule(clauses) => clauses,
            _ => &[],
        }
    }

    /// Unique mutable access to this predicate's constant pool, cloning the
    /// underlying `ConstantPool` if it is still shared with a disjunction
    /// nested predicate that hasn't diverged yet (`Rc::make_mut`). Only ever
    /// called during compilation.
    pub fn pool_mut(&mut self) -> &mut ConstantPool {
        Rc::make_mut(&mut self.pool)
    }
}

/// Append-only predicate/clause store, owned by one [`Engine`].
#[derive(Debug, Default)]
pub struct PredicateStore {
    predicates: HashMap<PredicateIndicator, Predicate>,
}

impl PredicateStore {
    pub fn new() -> Self {
        PredicateStore::default()
    }

    /// Interns the predicate (as a rule predicate, if new) and appends `clause`.
    pub fn add_clause(&mut self, pi: PredicateIndicator, clause: CompiledClause) {
        let pred = self
            .predicates
            .entry(pi)
            .or_insert_with(|| Predicate::new_rule(pi));
        match &mut pred.kind {
            PredicateKind::Rule(clauses) => clauses.push(clause),
            _ => {
                // Re-declaring a table/primop as a rule clause is a user error
                // the declaration processor should have caught; defensively
                // no-op rather than corrupt the existing kind.
            }
        }
    }

    pub fn get(&self, pi: PredicateIndicator) -> Option<&Predicate> {
        self.predicates.get(&pi)
    }

    pub fn get_mut(&mut self, pi: PredicateIndicator) -> Option<&mut Predicate> {
        self.predicates.get_mut(&pi)
    }

    pub fn entry_or_new_rule(&mut self, pi: PredicateIndicator) -> &mut Predicate {
        self.predicates.entry(pi).or_insert_with(|| Predicate::new_rule(pi))
    }

    pub fn define_table(&mut self, pi: PredicateIndicator, arity: usize) -> &mut Predicate {
        let pred = self.predicates.entry(pi).or_insert_with(|| Predicate {
            indicator: pi,
            kind: PredicateKind::TablePredicate(Table::new(arity)),
            flags: PredicateFlags::IS_SPECIAL | PredicateFlags::IS_TABLE,
            pool: Rc::new(ConstantPool::default()),
            signature: None,
        });
        pred
    }

    pub fn define_primop(&mut self, pi: PredicateIndicator, f: PrimopFn) {
        self.predicates.insert(
            pi,
            Predicate {
                indicator: pi,
                kind: PredicateKind::Primop(f),
                flags: PredicateFlags::IS_SPECIAL,
                pool: Rc::new(ConstantPool::default()),
                signature: None,
            },
        );
    }

    pub fn contains(&self, pi: PredicateIndicator) -> bool {
        self.predicates.contains_key(&pi)
    }

    /// All predicates in arbitrary (hash-map) order, for `listing` with no
    /// argument.
    pub fn iter(&self) -> impl Iterator<Item = (&PredicateIndicator, &Predicate)> {
        self.predicates.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::chunk::ChunkBuilder;
    use crate::symbol::SymbolTable;

    fn dummy_clause(source: Term) -> CompiledClause {
        let mut builder = ChunkBuilder::new("p");
        builder.emit_u8(crate::bytecode::opcodes::Opcode::CNoGoal as u8);
        CompiledClause {
            source,
            bytecode: Rc::new(builder.build()),
            environment_size: 0,
            head_model: Vec::new(),
            source_file: "<test>".to_string(),
            source_line: 1,
            singleton_warnings: Vec::new(),
        }
    }

    #[test]
    fn add_clause_interns_predicate() {
        let mut table = SymbolTable::new();
        let p = table.intern("p");
        let mut store = PredicateStore::new();
        assert!(!store.contains((p, 1)));
        store.add_clause((p, 1), dummy_clause(Term::Atom(p)));
        assert!(store.contains((p, 1)));
        assert_eq!(store.get((p, 1)).unwrap().clauses().len(), 1);
    }

    #[test]
    fn clauses_append_in_source_order() {
        let mut table = SymbolTable::new();
        let p = table.intern("p");
        let mut store = PredicateStore::new();
        store.add_clause((p, 1), dummy_clause(Term::Int(1)));
        store.add_clause((p, 1), dummy_clause(Term::Int(2)));
        let clauses = store.get((p, 1)).unwrap().clauses();
        assert_eq!(clauses[0].source, Term::Int(1));
        assert_eq!(clauses[1].source, Term::Int(2));
    }

    #[test]
    fn constant_pool_dedups_entries() {
        let mut pool = ConstantPool::default();
        let a = pool.intern_int(42).unwrap();
        let b = pool.intern_int(42).unwrap();
        assert_eq!(a, b);
        let c = pool.intern_int(43).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn table_rejects_mismatched_row_width() {
        let mut t = Table::new(2);
        assert!(t.assert_row(vec![Cell::Int(1), Cell::Int(2)]).is_ok());
        assert!(t.assert_row(vec![Cell::Int(1)]).is_err());
    }
}
