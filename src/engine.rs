//! Embedding surface (COMPONENT DESIGN §9 `Engine`).
//!
//! Everything the distilled specification treats as a process-wide
//! singleton - symbol table, predicate store, global-variable map - is
//! encapsulated here instead, so multiple engines can coexist. A
//! `thread_local!` ambient default plus free functions at the bottom of this
//! module give single-engine callers the ergonomic `compile`/`run` surface
//! the spec asks for without forcing every embedder to carry an `Engine`
//! value around.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::bytecode::fvm::{HostInterop, NoHostInterop};
use crate::bytecode::vm::GoalVm;
use crate::compiler::{self, CodegenCtx, CompileOutcome, Declaration};
use crate::config::EngineConfig;
use crate::csv_table;
use crate::error::EngineError;
use crate::predicate::{Predicate, PredicateFlags, PredicateIndicator, PredicateKind, PredicateStore};
use crate::reader;
use crate::struct_decl::StructRegistry;
use crate::symbol::{Symbol, SymbolTable};
use crate::term::{Term, TermDisplay};
use crate::value::{self, Cell};

/// One binding reported back from a successful query: a variable's surface
/// name paired with the term currently bound to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub value: Term,
}

/// Bookkeeping for the query currently open on this engine's VM, so
/// `next_solution` can re-read the same slots after a successful resume.
struct QueryMeta {
    env_base: usize,
    vars: Vec<(String, u8)>,
}

/// One embeddable logic-programming engine: its own symbol table, predicate
/// store, global-variable map, and goal VM (§5 "Shared resources... this
/// rewrite instead scopes them to one `Engine` value").
pub struct Engine {
    symtab: SymbolTable,
    store: PredicateStore,
    structs: StructRegistry,
    globals: HashMap<Symbol, Cell>,
    config: EngineConfig,
    host: Box<dyn HostInterop>,
    /// Canonical paths already loaded via `require`/`compile_file`, so a
    /// second `require` of the same file is a no-op (§4.5 "idempotent per
    /// canonical path").
    required_paths: HashSet<String>,
    /// Meta-call resolution cache: whether a `(Symbol, arity)` indicator
    /// names a defined predicate, bounded so long-running engines that probe
    /// many transient meta-call targets don't grow this without limit.
    meta_cache: LruCache<PredicateIndicator, bool>,
    vm: GoalVm,
    last_query: Option<QueryMeta>,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let vm = GoalVm::with_choice_point_bound(
            config.initial_stack_capacity,
            config.initial_trail_capacity,
            config.max_steps,
            config.max_choice_points,
        );
        let mut symtab = SymbolTable::new();
        let mut store = PredicateStore::new();
        crate::builtins::install(&mut symtab, &mut store);
        Engine {
            symtab,
            store,
            structs: StructRegistry::new(),
            globals: HashMap::new(),
            config,
            host: Box::new(NoHostInterop),
            required_paths: HashSet::new(),
            meta_cache: LruCache::new(NonZeroUsize::new(256).expect("256 != 0")),
            vm,
            last_query: None,
        }
    }

    pub fn from_config_str(text: &str) -> Result<Self, EngineError> {
        let config = EngineConfig::from_toml_str(text).map_err(|e| EngineError::SyntaxError(e.to_string()))?;
        Ok(Engine::with_config(config))
    }

    pub fn from_config_file(path: &str) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::SyntaxError(format!("cannot read {path}: {e}")))?;
        Engine::from_config_str(&text)
    }

    /// Install a host-interop capability, replacing the default that refuses
    /// every request (§4.4 "out of scope... a single `HostInterop` capability").
    pub fn with_host_interop(mut self, host: Box<dyn HostInterop>) -> Self {
        self.host = host;
        self
    }

    pub fn symtab(&self) -> &SymbolTable {
        &self.symtab
    }

    pub fn symtab_mut(&mut self) -> &mut SymbolTable {
        &mut self.symtab
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether `name/arity` names a currently defined predicate, answered
    /// through the bounded meta-call resolution cache.
    pub fn predicate_exists(&mut self, name: &str, arity: usize) -> bool {
        let Some(sym) = self.symtab.get(name) else { return false };
        let key = (sym, arity);
        if let Some(hit) = self.meta_cache.get(&key) {
            return *hit;
        }
        let exists = self.store.contains(key);
        self.meta_cache.put(key, exists);
        exists
    }

    /// Compile every top-level term in `source`. Returns diagnostic messages
    /// (singleton-variable warnings, `report/1` text) in source order.
    pub fn compile(&mut self, source: &str) -> Result<Vec<String>, EngineError> {
        self.compile_named(source, "<input>")
    }

    /// Compile a source file, idempotently: a file already loaded by
    /// canonical path is skipped (§6 `CompileFile`).
    pub fn compile_file(&mut self, path: &str) -> Result<Vec<String>, EngineError> {
        self.require_path(path)
    }

    /// Compile `query` as a standalone goal and run it to its first solution.
    pub fn run(&mut self, query: &str) -> Result<bool, EngineError> {
        Ok(self.first_solution(query)?.is_some())
    }

    /// Compile `query` and run it, returning the bindings of its first
    /// solution, or `None` if it fails outright.
    pub fn first_solution(&mut self, query: &str) -> Result<Option<Vec<Binding>>, EngineError> {
        let term = reader::read_one_term(&mut self.symtab, query).map_err(EngineError::from)?;
        let (chunk, pool, vars) = {
            let mut ctx = CodegenCtx::new(&mut self.symtab, &mut self.store, &self.structs);
            compiler::codegen::compile_query(&mut ctx, &term).map_err(EngineError::from)?
        };

        let env_base = self.vm.stack.top();
        for _ in 0..vars.len() {
            self.vm.stack.push(Cell::Unbound);
        }
        self.last_query = Some(QueryMeta { env_base, vars });

        let ok = self
            .vm
            .run_query(&self.store, chunk, pool, env_base, self.host.as_mut(), &self.globals)?;
        if ok {
            Ok(Some(self.extract_bindings()))
        } else {
            self.last_query = None;
            Ok(None)
        }
    }

    /// Resume backtracking into the most recently run query for its next
    /// solution. `None` once the query is exhausted or none is open.
    pub fn next_solution(&mut self) -> Result<Option<Vec<Binding>>, EngineError> {
        if self.last_query.is_none() {
            return Ok(None);
        }
        let ok = self.vm.next_solution(&self.store, self.host.as_mut(), &self.globals)?;
        if ok {
            Ok(Some(self.extract_bindings()))
        } else {
            self.last_query = None;
            Ok(None)
        }
    }

    /// Reserve `name` in the global-variable map if not already present,
    /// returning its interned symbol (§6 `DefineGlobal`).
    pub fn define_global(&mut self, name: &str, initial: Cell) -> Symbol {
        let sym = self.symtab.intern(name);
        self.globals.entry(sym).or_insert(initial);
        sym
    }

    /// Read a global's current value (§6 `Find`).
    pub fn find_global(&self, name: &str) -> Option<&Cell> {
        let sym = self.symtab.get(name)?;
        self.globals.get(&sym)
    }

    /// Declare a row-backed table predicate directly, with no data (§6
    /// `DefineTable`).
    pub fn define_table(&mut self, name: &str, arity: usize) -> PredicateIndicator {
        let sym = self.symtab.intern(name);
        let pi = (sym, arity);
        self.store.define_table(pi, arity);
        pi
    }

    /// Load a CSV file into a table predicate (§4.8, §6 `LoadTable`). `arity`
    /// fixes the table's column count up front; `None` infers it from the
    /// first data row.
    pub fn load_table(&mut self, name: &str, arity: Option<usize>, path: &str) -> Result<PredicateIndicator, EngineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::SyntaxError(format!("cannot read {path}: {e}")))?;
        let rows = csv_table::parse_rows(&text)?;
        let detected_arity = arity.or_else(|| rows.first().map(|r| r.len())).unwrap_or(0);
        let sym = self.symtab.intern(name);
        let pi = (sym, detected_arity);
        let pred = self.store.define_table(pi, detected_arity);
        if let PredicateKind::TablePredicate(table) = &mut pred.kind {
            for row in rows {
                table.assert_row(row).map_err(EngineError::SyntaxError)?;
            }
        }
        Ok(pi)
    }

    fn compile_named(&mut self, source: &str, source_file: &str) -> Result<Vec<String>, EngineError> {
        let terms = reader::read_program(&mut self.symtab, source).map_err(EngineError::from)?;
        let mut warnings = Vec::new();
        for (term, line) in terms {
            warnings.extend(self.compile_one_term(&term, source_file, line)?);
        }
        Ok(warnings)
    }

    fn compile_one_term(&mut self, term: &Term, source_file: &str, line: u32) -> Result<Vec<String>, EngineError> {
        let outcome = {
            let mut ctx = CodegenCtx::new(&mut self.symtab, &mut self.store, &self.structs);
            compiler::compile_term(&mut ctx, term, source_file, line).map_err(EngineError::from)?
        };
        match outcome {
            CompileOutcome::Clause { singleton_warnings, .. } => {
                let mut warnings = Vec::new();
                if self.config.warn_singletons {
                    for name in singleton_warnings {
                        let msg = format!("{source_file}:{line}: singleton variable `{name}`");
                        tracing::warn!("{msg}");
                        warnings.push(msg);
                    }
                }
                Ok(warnings)
            }
            CompileOutcome::Declaration(decl) => self.apply_declaration(decl, line),
        }
    }

    /// Apply a classified declaration's engine-level side effect (§4.5 Pass
    /// 1). Compilation itself never touches engine state directly - that
    /// indirection is why `compiler::compile_term` only classifies and
    /// returns a [`Declaration`] rather than applying one.
    fn apply_declaration(&mut self, decl: Declaration, line: u32) -> Result<Vec<String>, EngineError> {
        match decl {
            Declaration::Function(pi) => {
                tracing::debug!(pi = ?self.symtab.resolve(pi.0), arity = pi.1, "function declaration noted");
                Ok(Vec::new())
            }
            Declaration::Table(pi) => {
                self.store.define_table(pi, pi.1);
                Ok(Vec::new())
            }
            Declaration::Require(path) => self.require_path(&path),
            Declaration::Global(name) => {
                self.globals.entry(name).or_insert(Cell::Unbound);
                Ok(Vec::new())
            }
            Declaration::Report(term) => {
                let msg = format!("{}", TermDisplay { term: &term, table: &self.symtab });
                tracing::info!("{msg}");
                Ok(vec![msg])
            }
            Declaration::Struct { name, fields } => {
                compiler::apply_struct_declaration(&mut self.symtab, &mut self.store, &mut self.structs, name, &fields, line);
                Ok(Vec::new())
            }
            Declaration::Signature(pi, types) => {
                self.store.entry_or_new_rule(pi).signature = Some(types);
                Ok(Vec::new())
            }
            Declaration::Trace(pi) => {
                self.store.entry_or_new_rule(pi).flags.insert(PredicateFlags::IS_TRACED);
                Ok(Vec::new())
            }
            Declaration::NoTrace(pi) => {
                if let Some(pred) = self.store.get_mut(pi) {
                    pred.flags.remove(PredicateFlags::IS_TRACED);
                }
                Ok(Vec::new())
            }
            Declaration::ExternallyCalled(pi) => {
                self.store.entry_or_new_rule(pi).flags.insert(PredicateFlags::IS_EXTERNALLY_CALLED);
                Ok(Vec::new())
            }
            Declaration::Listing(pi) => Ok(self.listing(pi)),
        }
    }

    /// Load `path` relative to the process's current directory, skipping it
    /// if an equal canonical path was already loaded (§4.5 `require`).
    /// Extensionless paths default to `.pl`.
    fn require_path(&mut self, path: &str) -> Result<Vec<String>, EngineError> {
        let mut canonical = compiler::declarations::canonicalize_path(path);
        if !canonical.rsplit('/').next().unwrap_or(&canonical).contains('.') {
            canonical.push_str(".pl");
        }
        if !self.required_paths.insert(canonical.clone()) {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&canonical)
            .map_err(|e| EngineError::SyntaxError(format!("cannot read {canonical}: {e}")))?;
        self.compile_named(&text, &canonical)
    }

    fn listing(&self, pi: Option<PredicateIndicator>) -> Vec<String> {
        match pi {
            Some(pi) => match self.store.get(pi) {
                Some(pred) => vec![self.format_predicate(pi, pred)],
                None => vec![format!("% {}/{}: no clauses", self.symtab.resolve(pi.0), pi.1)],
            },
            None => self.store.iter().map(|(pi, pred)| self.format_predicate(*pi, pred)).collect(),
        }
    }

    fn format_predicate(&self, pi: PredicateIndicator, pred: &Predicate) -> String {
        let name = self.symtab.resolve(pi.0);
        let mut out = format!("% {name}/{}\n", pi.1);
        for clause in pred.clauses() {
            out.push_str(&format!("{}\n", TermDisplay { term: &clause.source, table: &self.symtab }));
        }
        tracing::info!(predicate = %format!("{name}/{}", pi.1), "listing");
        out
    }

    fn extract_bindings(&self) -> Vec<Binding> {
        let Some(meta) = &self.last_query else { return Vec::new() };
        meta.vars
            .iter()
            .map(|(name, slot)| {
                let addr = meta.env_base + *slot as usize;
                let value = value::cell_to_term(&self.vm.stack, addr);
                Binding { name: name.clone(), value }
            })
            .collect()
    }
}

thread_local! {
    static DEFAULT_ENGINE: RefCell<Engine> = RefCell::new(Engine::new());
}

/// Compile `source` against the ambient default engine (§5 "keep a
/// `thread_local!` ambient default `Engine` for ergonomic top-level
/// `compile`/`run` free functions").
pub fn compile(source: &str) -> Result<Vec<String>, EngineError> {
    DEFAULT_ENGINE.with(|engine| engine.borrow_mut().compile(source))
}

/// Run `query` against the ambient default engine.
pub fn run(query: &str) -> Result<bool, EngineError> {
    DEFAULT_ENGINE.with(|engine| engine.borrow_mut().run(query))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_a_fact_and_runs_a_query() {
        let mut engine = Engine::new();
        engine.compile("p(1). p(2).").unwrap();
        assert!(engine.run("p(1)").unwrap());
        assert!(!engine.run("p(3)").unwrap());
    }

    #[test]
    fn first_solution_reports_bindings() {
        let mut engine = Engine::new();
        engine.compile("p(1). p(2). p(3).").unwrap();
        let bindings = engine.first_solution("p(X)").unwrap().unwrap();
        assert_eq!(bindings, vec![Binding { name: "X".to_string(), value: Term::Int(1) }]);
    }

    #[test]
    fn next_solution_enumerates_remaining_matches() {
        let mut engine = Engine::new();
        engine.compile("p(1). p(2). p(3).").unwrap();
        engine.compile("q(X) :- p(X), X > 1.").unwrap();
        let first = engine.first_solution("q(Y)").unwrap().unwrap();
        assert_eq!(first[0].value, Term::Int(2));
        let second = engine.next_solution().unwrap().unwrap();
        assert_eq!(second[0].value, Term::Int(3));
        assert!(engine.next_solution().unwrap().is_none());
    }

    #[test]
    fn global_round_trips_through_define_and_find() {
        let mut engine = Engine::new();
        engine.define_global("counter", Cell::Int(0));
        assert_eq!(engine.find_global("counter"), Some(&Cell::Int(0)));
        assert_eq!(engine.find_global("missing"), None);
    }

    #[test]
    fn struct_declaration_synthesizes_accessors() {
        let mut engine = Engine::new();
        engine.compile("struct point(x, y).").unwrap();
        engine.compile("p(X, Y) :- x(point(X, Y), X).").unwrap();
        assert!(engine.run("p(1, 2)").unwrap());
    }

    #[test]
    fn define_table_then_query_succeeds_for_asserted_rows() {
        let mut engine = Engine::new();
        let pi = engine.define_table("edge", 2);
        if let Some(pred) = engine.store.get_mut(pi) {
            if let PredicateKind::TablePredicate(table) = &mut pred.kind {
                table.assert_row(vec![Cell::Int(1), Cell::Int(2)]).unwrap();
            }
        }
        assert!(engine.run("edge(1, 2)").unwrap());
        assert!(!engine.run("edge(2, 1)").unwrap());
    }

    #[test]
    fn require_is_idempotent_per_canonical_path() {
        let mut engine = Engine::new();
        engine.required_paths.insert("a.pl".to_string());
        let warnings = engine.require_path("./a.pl").unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn predicate_exists_reflects_compiled_clauses() {
        let mut engine = Engine::new();
        assert!(!engine.predicate_exists("p", 1));
        engine.compile("p(1).").unwrap();
        assert!(engine.predicate_exists("p", 1));
    }

    #[test]
    fn equals_is_a_built_in_predicate_on_every_fresh_engine() {
        let mut engine = Engine::new();
        let bindings = engine.first_solution("X = 5").unwrap().unwrap();
        assert_eq!(bindings[0].value, Term::Int(5));
    }

    #[test]
    fn backtracking_through_numeric_comparison_enumerates_in_source_order() {
        // §8 scenario 3.
        let mut engine = Engine::new();
        engine.compile("p(1). p(2). p(3).").unwrap();
        let first = engine.first_solution("p(X), X > 1").unwrap().unwrap();
        assert_eq!(first[0].value, Term::Int(2));
        let second = engine.next_solution().unwrap().unwrap();
        assert_eq!(second[0].value, Term::Int(3));
        assert!(engine.next_solution().unwrap().is_none());
    }

    #[test]
    fn disjunction_in_a_rule_body_yields_both_branches() {
        // §8 scenario 4.
        let mut engine = Engine::new();
        engine.compile("q(X) :- X = 5 ; X = 7.").unwrap();
        let first = engine.first_solution("q(Y)").unwrap().unwrap();
        assert_eq!(first[0].value, Term::Int(5));
        let second = engine.next_solution().unwrap().unwrap();
        assert_eq!(second[0].value, Term::Int(7));
        assert!(engine.next_solution().unwrap().is_none());
    }

    #[test]
    fn cut_commits_past_a_failing_guard_with_no_retry() {
        // §8 scenario 5.
        let mut engine = Engine::new();
        engine.compile("r(X) :- X > 0, !, X < 10.").unwrap();
        assert!(engine.run("r(5)").unwrap());
        assert!(!engine.run("r(-1)").unwrap());
        assert!(!engine.run("r(50)").unwrap());
    }

    #[test]
    fn bare_semicolon_terminated_facts_both_succeed() {
        // §8 scenario 6.
        let mut engine = Engine::new();
        engine.compile("delimited_code(a); delimited_code(b);;").unwrap();
        assert!(engine.run("delimited_code(a)").unwrap());
        assert!(engine.run("delimited_code(b)").unwrap());
        assert!(!engine.run("delimited_code(c)").unwrap());
    }
}
