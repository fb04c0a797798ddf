//! The compiler: surface terms in, compiled clauses appended to the
//! predicate store out (COMPONENT DESIGN §4.5).
//!
//! Submodules mirror the passes: [`declarations`] is Pass 1, [`variables`]
//! is Passes 3/4, [`codegen`] is Passes 2/5/6/7. [`compile_term`] is the
//! driver [`crate::engine::Engine`] calls once per top-level term.

pub mod codegen;
pub mod declarations;
pub mod variables;

use crate::error::CompileError;
use crate::predicate::PredicateIndicator;
use crate::struct_decl::StructRegistry;
use crate::symbol::SymbolTable;
use crate::term::Term;

pub use codegen::CodegenCtx;
pub use declarations::Declaration;

/// What compiling one top-level term produced.
pub enum CompileOutcome {
    /// A declaration was processed; no clause was appended (Pass 1).
    Declaration(Declaration),
    /// An ordinary fact or rule was compiled and appended to `pi`'s clause
    /// list. `singleton_warnings` carries any singleton-variable names found
    /// (§4.5) for the caller to surface.
    Clause { pi: PredicateIndicator, singleton_warnings: Vec<String> },
}

/// Pass 5: split a top-level term into `(head, body)`. A term whose functor
/// is `:-`/2 is a rule; anything else is a fact (`body = None`).
fn split_fact_or_rule(term: &Term, symtab: &SymbolTable) -> (Term, Option<Term>) {
    if let Term::Call(functor, args) = term {
        if symtab.resolve(*functor) == ":-" && args.len() == 2 {
            return (args[0].clone(), Some(args[1].clone()));
        }
    }
    (term.clone(), None)
}

/// Compile one top-level term: Pass 1 (declaration filter) first, then - for
/// an ordinary clause - Pass 5 through 7 via [`codegen::compile_clause`].
///
/// Declarations are classified here but **not applied**: applying a
/// `Declaration` touches engine-level state (globals, tables, struct
/// registry, `require` file loading) that this module has no handle to -
/// [`crate::engine::Engine::compile`] matches on the returned
/// [`CompileOutcome`] and applies the side effect itself.
pub fn compile_term(
    ctx: &mut CodegenCtx,
    term: &Term,
    source_file: &str,
    source_line: u32,
) -> Result<CompileOutcome, CompileError> {
    if declarations::is_bare_listing(term, ctx.symtab) {
        return Ok(CompileOutcome::Declaration(Declaration::Listing(None)));
    }
    if let Some(decl) = declarations::classify(term, ctx.symtab) {
        return Ok(CompileOutcome::Declaration(decl));
    }

    let (head, body) = split_fact_or_rule(term, ctx.symtab);
    let pi = head
        .functor_arity()
        .ok_or_else(|| CompileError::UnsupportedHead("clause head must be callable".to_string()))?;

    let clause = codegen::compile_clause(ctx, pi, &head, body.as_ref(), source_file, source_line)?;
    let singleton_warnings = clause.singleton_warnings.clone();
    ctx.store.add_clause(pi, clause);
    Ok(CompileOutcome::Clause { pi, singleton_warnings })
}

/// Expand a `struct(Name(Field1, ..., FieldN))` declaration: register the
/// shape in `structs` and synthesize its field accessors into `store`.
pub fn apply_struct_declaration(
    symtab: &mut SymbolTable,
    store: &mut crate::predicate::PredicateStore,
    structs: &mut StructRegistry,
    name: crate::symbol::Symbol,
    fields: &[crate::symbol::Symbol],
    source_line: u32,
) {
    structs.register(name, fields.to_vec());
    crate::struct_decl::define_accessors(symtab, store, name, fields, source_line);
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::predicate::PredicateStore;
    use crate::term::Variable;

    #[test]
    fn fact_compiles_to_a_clause_outcome() {
        let mut symtab = SymbolTable::new();
        let mut store = PredicateStore::new();
        let structs = StructRegistry::new();
        let p = symtab.intern("p");
        let term = Term::Call(p, smallvec![Term::Int(1)]);
        let mut ctx = CodegenCtx::new(&mut symtab, &mut store, &structs);
        match compile_term(&mut ctx, &term, "<test>", 1).unwrap() {
            CompileOutcome::Clause { pi, .. } => assert_eq!(pi, (p, 1)),
            _ => panic!("expected a clause outcome"),
        }
        assert_eq!(store.get((p, 1)).unwrap().clauses().len(), 1);
    }

    #[test]
    fn declaration_term_is_classified_not_compiled() {
        let mut symtab = SymbolTable::new();
        let mut store = PredicateStore::new();
        let structs = StructRegistry::new();
        let table_fn = symtab.intern("table");
        let slash = symtab.intern("/");
        let edges = symtab.intern("edges");
        let pi_term = Term::Call(slash, smallvec![Term::Atom(edges), Term::Int(2)]);
        let term = Term::Call(table_fn, smallvec![pi_term]);
        let mut ctx = CodegenCtx::new(&mut symtab, &mut store, &structs);
        match compile_term(&mut ctx, &term, "<test>", 1).unwrap() {
            CompileOutcome::Declaration(Declaration::Table(pi)) => {
                assert_eq!(pi, (edges, 2))
            }
            _ => panic!("expected a declaration outcome"),
        }
        assert!(store.get((edges, 2)).is_none());
    }

    #[test]
    fn rule_splits_head_and_body_on_implication() {
        let mut symtab = SymbolTable::new();
        let mut store = PredicateStore::new();
        let structs = StructRegistry::new();
        let p = symtab.intern("p");
        let q = symtab.intern("q");
        let arrow = symtab.intern(":-");
        let head = Term::Call(p, smallvec![Term::Var(Variable::named("X"))]);
        let body = Term::Call(q, smallvec![Term::Var(Variable::named("X"))]);
        let term = Term::Call(arrow, smallvec![head, body]);
        let mut ctx = CodegenCtx::new(&mut symtab, &mut store, &structs);
        compile_term(&mut ctx, &term, "<test>", 1).unwrap();
        assert_eq!(store.get((p, 1)).unwrap().clauses().len(), 1);
    }
}
