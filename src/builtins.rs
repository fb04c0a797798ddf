//! Bootstrap primops installed into every fresh [`crate::engine::Engine`].
//!
//! `=`/2 is the one reserved functor (§6) that needs a runtime predicate
//! rather than an inline opcode: it is ordinary unification, dispatched
//! through `CSpecial` exactly like a user `table`/CSV-backed predicate would
//! be (§4.6 "Primops are constructed the same way but with a native
//! callback").

use crate::predicate::PredicateStore;
use crate::symbol::SymbolTable;
use crate::unify::unify;

/// Install the engine's built-in primops into `store`, interning their names
/// in `symtab` if not already present.
pub fn install(symtab: &mut SymbolTable, store: &mut PredicateStore) {
    let eq = symtab.intern("=");
    store.define_primop((eq, 2), |stack, base, _arity| Ok(unify(stack, base, base + 1)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Cell;

    #[test]
    fn equals_primop_unifies_its_two_arguments() {
        let mut symtab = SymbolTable::new();
        let mut store = PredicateStore::new();
        install(&mut symtab, &mut store);
        let eq = symtab.get("=").unwrap();
        let pred = store.get((eq, 2)).unwrap();
        let crate::predicate::PredicateKind::Primop(f) = &pred.kind else { panic!("expected a primop") };
        let f = *f;
        let mut stack = crate::value::Stack::default();
        let a = stack.push(Cell::Unbound);
        let b = stack.push(Cell::Int(9));
        assert!(f(&mut stack, a, 2).unwrap());
        assert_eq!(*stack.get(a), Cell::StackRef(b));
    }
}
