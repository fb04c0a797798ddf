//! Prolotron - an embeddable Prolog-family logic-programming runtime.
//!
//! A program is compiled from textual source into a compact bytecode and
//! executed by a dedicated virtual machine that performs unification,
//! choice-point management, and arithmetic/expression evaluation against an
//! in-memory knowledge base.
//!
//! # Architecture
//!
//! The pipeline runs in two stages:
//!
//! 1. **Reading & compiling** ([`reader`], [`compiler`])
//!    - The built-in [`reader`] turns source text into [`term::Term`] values
//!      (a minimal surface reader; an external parser can replace it).
//!    - [`compiler`] classifies each top-level term as a declaration or an
//!      ordinary clause, runs variable-lifetime analysis, and emits bytecode
//!      into a [`predicate::PredicateStore`].
//!
//! 2. **Execution** ([`bytecode`])
//!    - [`bytecode::vm::GoalVm`] runs the goal instruction set: head
//!      matching, choice points, cut, last-call optimisation, builtins.
//!    - [`bytecode::fvm`] runs the separate functional-expression machine
//!      used for arithmetic, comparisons, and host interop.
//!
//! # Example
//!
//! ```rust
//! use prolotron::engine::Engine;
//!
//! let mut engine = Engine::new();
//! engine.compile("p(1). p(2). p(3).").unwrap();
//! let first = engine.first_solution("p(X), X > 1").unwrap().unwrap();
//! assert_eq!(first[0].name, "X");
//! ```
//!
//! # Language Features
//!
//! - **Facts & rules**: `head.` and `head :- body.`
//! - **Unification**: `=`, structural matching with occurs-unsafe binding
//! - **Backtracking**: choice points, `;` disjunction, `!` cut
//! - **Arithmetic**: `+ - * /` and comparisons, evaluated by the F-VM
//! - **Tables**: CSV-backed row predicates (`table/1`, `LoadTable`)
//! - **Structs**: `struct/1` synthesizes constructor/accessor predicates
//! - **Meta-call**: `call(Pred, Arg1, ...)`
//!
//! Out of scope: a full standards-conformant surface parser, lists as
//! first-class terms, a persistent store, and multi-threaded execution - the
//! VM is single-threaded by design (§5).

pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod csv_table;
pub mod engine;
pub mod error;
pub mod predicate;
pub mod reader;
pub mod struct_decl;
pub mod symbol;
pub mod term;
pub mod unify;
pub mod value;

pub use engine::{Binding, Engine};
pub use error::EngineError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_reexports_cover_the_embedding_surface() {
        let mut engine = Engine::new();
        engine.compile("p(1).").unwrap();
        assert!(engine.run("p(1)").unwrap());
    }
}
