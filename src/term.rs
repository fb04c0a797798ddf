//! Surface-syntax term model.
//!
//! Terms are what the reader (§4.7) produces and what the compiler (§4.5)
//! consumes. They are immutable functor+argument tuples - cyclic term graphs
//! are not representable here (DESIGN NOTES §9), which is the simplest safe
//! policy the spec allows.

use std::fmt;

use smallvec::SmallVec;

use crate::symbol::{Symbol, SymbolTable};

/// A clause/goal argument list. Most functors seen in practice are arity
/// 1-4 (struct fields, comparisons, `call/N` targets); inlining up to four
/// arguments avoids a heap allocation per term for the common case, same
/// role `smallvec` plays in the teacher's own AST node for its argument
/// lists.
pub type TermArgs = SmallVec<[Term; 4]>;

/// A surface variable occurrence, identified by name within one clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    /// Suppresses singleton warnings; set for compiler-introduced variables
    /// (disjunction flattening, meta-call resolution temporaries).
    pub generated: bool,
}

impl Variable {
    pub fn named(name: impl Into<String>) -> Self {
        Variable { name: name.into(), generated: false }
    }

    pub fn generated(name: impl Into<String>) -> Self {
        Variable { name: name.into(), generated: true }
    }

    /// `_`-prefixed or bare `_` names are conventionally void; the compiler
    /// still resolves identity through the variable's name so the caller's
    /// textual-identity rule (DATA MODEL §3) stays intact.
    pub fn is_anonymous(&self) -> bool {
        self.name == "_" || self.name.starts_with('_')
    }
}

/// One surface term.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Int(i64),
    Float(f32),
    Bool(bool),
    Str(String),
    Atom(Symbol),
    Var(Variable),
    /// A functor applied to one or more arguments. Arity 0 is `Term::Atom`.
    Call(Symbol, TermArgs),
}

impl Term {
    pub fn functor_arity(&self) -> Option<(Symbol, usize)> {
        match self {
            Term::Atom(s) => Some((*s, 0)),
            Term::Call(s, args) => Some((*s, args.len())),
            _ => None,
        }
    }

    pub fn is_call_named(&self, table: &SymbolTable, name: &str) -> bool {
        match self.functor_arity() {
            Some((s, _)) => table.resolve(s) == name,
            None => false,
        }
    }

    pub fn as_call(&self) -> Option<(Symbol, &[Term])> {
        match self {
            Term::Call(s, args) => Some((*s, args.as_slice())),
            _ => None,
        }
    }
}

/// Pretty-prints a term using a table to resolve symbols; mirrors the head
/// model reconstruction the round-trip law in §8 exercises.
pub struct TermDisplay<'a> {
    pub term: &'a Term,
    pub table: &'a SymbolTable,
}

impl fmt::Display for TermDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_term(self.term, self.table, f)
    }
}

fn fmt_term(term: &Term, table: &SymbolTable, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match term {
        Term::Int(n) => write!(f, "{n}"),
        Term::Float(x) => write!(f, "{x}"),
        Term::Bool(b) => write!(f, "{b}"),
        Term::Str(s) => write!(f, "{s:?}"),
        Term::Atom(s) => write!(f, "{}", table.resolve(*s)),
        Term::Var(v) => write!(f, "{}", v.name),
        Term::Call(functor, args) => {
            write!(f, "{}(", table.resolve(*functor))?;
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                fmt_term(arg, table, f)?;
            }
            write!(f, ")")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_zero_is_bare_atom() {
        let mut table = SymbolTable::new();
        let sym = table.intern("foo");
        let term = Term::Atom(sym);
        assert_eq!(term.functor_arity(), Some((sym, 0)));
    }

    #[test]
    fn call_reports_arity() {
        let mut table = SymbolTable::new();
        let sym = table.intern("p");
        let term = Term::Call(sym, smallvec::smallvec![Term::Int(1), Term::Int(2)]);
        assert_eq!(term.functor_arity(), Some((sym, 2)));
    }

    #[test]
    fn anonymous_variable_detection() {
        assert!(Variable::named("_").is_anonymous());
        assert!(Variable::named("_Foo").is_anonymous());
        assert!(!Variable::named("X").is_anonymous());
    }

    #[test]
    fn display_round_trips_functor_and_args() {
        let mut table = SymbolTable::new();
        let p = table.intern("p");
        let term = Term::Call(p, smallvec::smallvec![Term::Int(1), Term::Int(2)]);
        let shown = format!("{}", TermDisplay { term: &term, table: &table });
        assert_eq!(shown, "p(1,2)");
    }
}
