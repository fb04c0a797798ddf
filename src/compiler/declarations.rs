//! Pass 1: declaration recognition (COMPONENT DESIGN §4.5).
//!
//! A top-level term is either a declaration - a unary call whose functor is
//! one of the reserved names below - or an ordinary clause (fact or rule).
//! This pass only classifies; applying the resulting [`Declaration`] to the
//! engine's state (predicate store, struct registry, globals, ...) is the
//! caller's job, since that state lives on [`crate::engine::Engine`], not here.

use crate::predicate::PredicateIndicator;
use crate::symbol::{Symbol, SymbolTable};
use crate::term::Term;

/// One recognized declaration, already validated against its expected shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    /// `function(Name/Arity)` - marks a predicate as callable from `UserFunction`
    /// F-VM expressions in addition to ordinary goal position.
    Function(PredicateIndicator),
    /// `table(Name/Arity)` - declares a row-backed extension predicate.
    Table(PredicateIndicator),
    /// `require(Path)` - load another source file before continuing; the
    /// compiler canonicalizes the path and loads each one at most once.
    Require(String),
    /// `global(Name)` - reserves a name in the engine's global cell map.
    Global(Symbol),
    /// `report(Term)` - a compile-time diagnostic message, logged and otherwise
    /// inert.
    Report(Term),
    /// `struct(Name(Field1, ..., FieldN))` - registers a constructor/accessor
    /// family for a host-interop compound value.
    Struct { name: Symbol, fields: Vec<Symbol> },
    /// `signature(Name/Arity, (Type1, ..., TypeN))` - documentation metadata
    /// recorded on the predicate, otherwise unenforced.
    Signature(PredicateIndicator, Vec<Symbol>),
    Trace(PredicateIndicator),
    NoTrace(PredicateIndicator),
    ExternallyCalled(PredicateIndicator),
    /// `listing` or `listing(Name/Arity)` - dump compiled clauses as a
    /// diagnostic; `None` means "everything".
    Listing(Option<PredicateIndicator>),
}

/// Parse `name/arity` into a `PredicateIndicator`, if `term` has that shape.
pub fn predicate_indicator(term: &Term, symtab: &SymbolTable) -> Option<PredicateIndicator> {
    let (functor, args) = term.as_call()?;
    if symtab.resolve(functor) != "/" || args.len() != 2 {
        return None;
    }
    let name = match &args[0] {
        Term::Atom(s) => *s,
        _ => return None,
    };
    let arity = match &args[1] {
        Term::Int(n) if *n >= 0 => *n as usize,
        _ => return None,
    };
    Some((name, arity))
}

/// Classify a top-level term as a declaration, or `None` if it is an
/// ordinary clause.
pub fn classify(term: &Term, symtab: &SymbolTable) -> Option<Declaration> {
    let (functor, args) = term.as_call()?;
    if args.len() != 1 {
        return None;
    }
    let name = symtab.resolve(functor);
    let arg = &args[0];
    match name {
        "function" => predicate_indicator(arg, symtab).map(Declaration::Function),
        "table" => predicate_indicator(arg, symtab).map(Declaration::Table),
        "require" => match arg {
            Term::Str(path) => Some(Declaration::Require(canonicalize_path(path))),
            Term::Atom(s) => Some(Declaration::Require(canonicalize_path(symtab.resolve(*s)))),
            _ => None,
        },
        "global" => match arg {
            Term::Atom(s) => Some(Declaration::Global(*s)),
            _ => None,
        },
        "report" => Some(Declaration::Report(arg.clone())),
        "struct" => {
            let (struct_name, fields) = arg.as_call()?;
            let field_names = fields
                .iter()
                .map(|f| match f {
                    Term::Atom(s) => Some(*s),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()?;
            Some(Declaration::Struct { name: struct_name, fields: field_names })
        }
        "signature" => {
            let (pi_term, type_args) = arg.as_call()?;
            if type_args.len() != 2 {
                return None;
            }
            let pi = predicate_indicator(&type_args[0], symtab)?;
            let types = match &type_args[1] {
                Term::Call(_, type_list) => type_list
                    .iter()
                    .map(|t| match t {
                        Term::Atom(s) => Some(*s),
                        _ => None,
                    })
                    .collect::<Option<Vec<_>>>()?,
                Term::Atom(s) => vec![*s],
                _ => return None,
            };
            let _ = pi_term;
            Some(Declaration::Signature(pi, types))
        }
        "trace" => predicate_indicator(arg, symtab).map(Declaration::Trace),
        "notrace" => predicate_indicator(arg, symtab).map(Declaration::NoTrace),
        "externally_called" => predicate_indicator(arg, symtab).map(Declaration::ExternallyCalled),
        "listing" => predicate_indicator(arg, symtab).map(|pi| Declaration::Listing(Some(pi))),
        _ => None,
    }
}

/// Bare `listing` (arity 0) is also a declaration, handled separately from
/// [`classify`] since every other declaration here is unary.
pub fn is_bare_listing(term: &Term, symtab: &SymbolTable) -> bool {
    matches!(term, Term::Atom(s) if symtab.resolve(*s) == "listing")
}

/// Collapse `./` segments and a leading `./`; requiring the same logical path
/// twice (`require("a.pl")`, `require("./a.pl")`) must be idempotent (§4.5).
pub(crate) fn canonicalize_path(path: &str) -> String {
    let mut out = Vec::new();
    for segment in path.split('/') {
        match segment {
            "." | "" => continue,
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    out.join("/")
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;

    fn pi_term(symtab: &mut SymbolTable, name: &str, arity: i64) -> Term {
        let slash = symtab.intern("/");
        let n = symtab.intern(name);
        Term::Call(slash, smallvec![Term::Atom(n), Term::Int(arity)])
    }

    #[test]
    fn recognizes_table_declaration() {
        let mut table = SymbolTable::new();
        let table_fn = table.intern("table");
        let pi = pi_term(&mut table, "edges", 2);
        let term = Term::Call(table_fn, smallvec![pi]);
        let decl = classify(&term, &table).unwrap();
        let edges = table.intern("edges");
        assert_eq!(decl, Declaration::Table((edges, 2)));
    }

    #[test]
    fn recognizes_struct_declaration() {
        let mut table = SymbolTable::new();
        let struct_fn = table.intern("struct");
        let point = table.intern("point");
        let x = table.intern("x");
        let y = table.intern("y");
        let shape = Term::Call(point, smallvec![Term::Atom(x), Term::Atom(y)]);
        let term = Term::Call(struct_fn, smallvec![shape]);
        let decl = classify(&term, &table).unwrap();
        assert_eq!(decl, Declaration::Struct { name: point, fields: vec![x, y] });
    }

    #[test]
    fn ordinary_clause_is_not_a_declaration() {
        let mut table = SymbolTable::new();
        let p = table.intern("p");
        let term = Term::Call(p, smallvec![Term::Int(1)]);
        assert_eq!(classify(&term, &table), None);
    }

    #[test]
    fn require_path_canonicalizes_dot_segments() {
        assert_eq!(canonicalize_path("./a.pl"), "a.pl");
        assert_eq!(canonicalize_path("a/./b.pl"), "a/b.pl");
        assert_eq!(canonicalize_path("a.pl"), canonicalize_path("./a.pl"));
    }
}
