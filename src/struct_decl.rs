//! Struct declarations, compiled down to the host-interop F-VM opcodes
//! (`Constructor`/`FieldReference`, §4.4) that already existed for exactly
//! this purpose.
//!
//! `struct(point(x, y))` registers a constructor/accessor family:
//!
//! - Any occurrence of `point(A, B)` in head or goal *argument position*
//!   compiles to an inline F-VM program ending in `Constructor` rather than
//!   erroring as an unrecognized compound (see `compiler::codegen::compile_fexpr`).
//! - Each field gets a two-argument accessor predicate, `x(Struct, Value)`,
//!   synthesized here directly as two head opcodes and no body: the second
//!   argument is a `HeadConstFexpr` that runs `FieldReference` against the
//!   first argument's slot, which `vm::match_head_arg` then unifies with
//!   whatever the caller passed - exactly the mechanism that already handles
//!   "unify the caller's argument with a computed value".

use std::collections::HashMap;
use std::rc::Rc;

use smallvec::smallvec;

use crate::bytecode::chunk::ChunkBuilder;
use crate::bytecode::fvm_opcodes::FOpcode;
use crate::bytecode::opcodes::Opcode;
use crate::predicate::{CompiledClause, HeadSlot, PredicateIndicator, PredicateStore};
use crate::symbol::{Symbol, SymbolTable};
use crate::term::Term;
use crate::value::{Cell, HostRef};

/// Struct registry: functor/arity of the constructor shape to its declared
/// field names, in declaration order.
#[derive(Debug, Default, Clone)]
pub struct StructRegistry {
    fields_by_indicator: HashMap<PredicateIndicator, Vec<Symbol>>,
}

impl StructRegistry {
    pub fn new() -> Self {
        StructRegistry::default()
    }

    pub fn register(&mut self, name: Symbol, fields: Vec<Symbol>) {
        self.fields_by_indicator.insert((name, fields.len()), fields);
    }

    pub fn fields_of(&self, pi: PredicateIndicator) -> Option<&[Symbol]> {
        self.fields_by_indicator.get(&pi).map(|v| v.as_slice())
    }

    pub fn is_struct_shape(&self, pi: PredicateIndicator) -> bool {
        self.fields_by_indicator.contains_key(&pi)
    }
}

/// Define the constructor's field accessors as one-clause rule predicates,
/// and return the struct's field list for registration.
pub fn define_accessors(
    symtab: &mut SymbolTable,
    store: &mut PredicateStore,
    struct_name: Symbol,
    fields: &[Symbol],
    source_line: u32,
) {
    for (field_index, &field) in fields.iter().enumerate() {
        let pi: PredicateIndicator = (field, 2);
        let pred = store.entry_or_new_rule(pi);
        let pool = pred.pool_mut();
        let field_obj_idx = pool
            .intern_object(Cell::Reference(HostRef::Symbol(field)))
            .expect("struct field accessor pool overflow");

        let mut b = ChunkBuilder::new(symtab.resolve(field).to_string());
        b.set_line(source_line);
        b.emit_op(Opcode::HeadVarFirst, &[0]);
        b.emit_op(Opcode::HeadConstFexpr, &[]);
        b.emit_fop(FOpcode::PushObject, &[field_obj_idx]);
        b.emit_fop(FOpcode::Load, &[0]);
        b.emit_fop(FOpcode::FieldReference, &[]);
        b.emit_fop(FOpcode::Return, &[]);
        b.emit_op(Opcode::CNoGoal, &[]);

        let struct_term = Term::Atom(struct_name);
        let clause = CompiledClause {
            source: Term::Call(field, smallvec![Term::Var(crate::term::Variable::generated("S")), struct_term]),
            bytecode: Rc::new(b.build()),
            environment_size: 1,
            head_model: vec![HeadSlot::EnvSlot(0), HeadSlot::Literal(Term::Var(crate::term::Variable::generated("V")))],
            source_file: "<struct>".to_string(),
            source_line,
            singleton_warnings: Vec::new(),
        };
        match &mut pred.kind {
            crate::predicate::PredicateKind::Rule(clauses) => clauses.push(clause),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_round_trips_fields() {
        let mut table = SymbolTable::new();
        let point = table.intern("point");
        let x = table.intern("x");
        let y = table.intern("y");
        let mut reg = StructRegistry::new();
        reg.register(point, vec![x, y]);
        assert!(reg.is_struct_shape((point, 2)));
        assert_eq!(reg.fields_of((point, 2)), Some(&[x, y][..]));
    }

    #[test]
    fn define_accessors_produces_one_clause_per_field() {
        let mut table = SymbolTable::new();
        let point = table.intern("point");
        let x = table.intern("x");
        let y = table.intern("y");
        let mut store = PredicateStore::new();
        define_accessors(&mut table, &mut store, point, &[x, y], 1);
        assert_eq!(store.get((x, 2)).unwrap().clauses().len(), 1);
        assert_eq!(store.get((y, 2)).unwrap().clauses().len(), 1);
    }
}
