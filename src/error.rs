//! Error taxonomy for the engine.
//!
//! Mirrors the layered error design of the bytecode backend this crate was grown
//! from: narrow errors (`CompileError`, `VmError`, `FvmError`) are raised close to
//! where they occur and convert into the broad `EngineError` that crosses the
//! embedding boundary. None of these reach for `thiserror` - manual `Display` and
//! `std::error::Error` impls keep the error surface visible at the call site.

use std::fmt;

use crate::symbol::{Symbol, SymbolTable};
use crate::term::Term;

/// Errors surfaced across the embedding API (`Engine::compile`, `Engine::run`, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Malformed declaration or expression. Carries the offending term when one
    /// is available.
    SyntaxError(String),
    /// A functional expression read an `Unbound` cell.
    InstantiationError(String),
    /// An operand's tag disagreed with the opcode that consumed it.
    TypeError(String),
    /// A meta-call (`call/N`) named an undefined predicate.
    UnknownPredicate(Symbol, usize),
    /// A bytecode-level invariant was violated. Reaching this indicates a
    /// compiler bug, not a user error.
    InvalidOperation(String),
    /// The `throw/1` builtin. Carries the thrown term.
    UserThrow(Term),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::SyntaxError(msg) => write!(f, "syntax error: {msg}"),
            EngineError::InstantiationError(msg) => write!(f, "instantiation error: {msg}"),
            EngineError::TypeError(msg) => write!(f, "type error: {msg}"),
            EngineError::UnknownPredicate(name, arity) => {
                write!(f, "unknown predicate: {name}/{arity}")
            }
            EngineError::InvalidOperation(msg) => write!(f, "invalid operation: {msg}"),
            EngineError::UserThrow(term) => write!(f, "uncaught throw: {term:?}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// An `EngineError` paired with the table that can resolve its symbols, for
/// user-facing diagnostics (mirrors [`crate::symbol::SymbolDisplay`] and
/// [`crate::term::TermDisplay`]).
pub struct EngineErrorDisplay<'a> {
    pub error: &'a EngineError,
    pub table: &'a SymbolTable,
}

impl fmt::Display for EngineErrorDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error {
            EngineError::UnknownPredicate(name, arity) => {
                write!(f, "unknown predicate: {}/{arity}", self.table.resolve(*name))
            }
            other => write!(f, "{other}"),
        }
    }
}

/// Errors raised during compilation (passes 1-7).
#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    /// A declaration term didn't match the shape its functor requires.
    BadDeclaration(String),
    /// A clause head used a construct the compiler can't encode.
    UnsupportedHead(String),
    /// A constant pool for one predicate would exceed 255 distinct entries.
    ConstantPoolOverflow(String),
    /// A meta-call or builtin was applied with the wrong arity.
    ArityMismatch { name: String, expected: usize, got: usize },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::BadDeclaration(msg) => write!(f, "bad declaration: {msg}"),
            CompileError::UnsupportedHead(msg) => write!(f, "unsupported head: {msg}"),
            CompileError::ConstantPoolOverflow(pred) => {
                write!(f, "constant pool overflow for predicate {pred}")
            }
            CompileError::ArityMismatch { name, expected, got } => write!(
                f,
                "arity mismatch for {name}: expected {expected}, got {got}"
            ),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<CompileError> for EngineError {
    fn from(e: CompileError) -> Self {
        EngineError::SyntaxError(e.to_string())
    }
}

/// Errors raised inside the goal VM while executing compiled bytecode.
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// Unification read past the end of the data stack or trail.
    StackUnderflow,
    /// A constant pool index had no corresponding entry.
    BadConstantIndex(u8),
    /// `CCall`/`CLastCall` named a predicate indicator with no matching entry.
    UnknownPredicate(Symbol, usize),
    /// The opcode decoded to a byte outside any known range.
    BadOpcode(u8),
    /// An F-VM sub-evaluation failed.
    Fvm(FvmError),
    /// The engine-level step bound (`EngineConfig::max_steps`) was exceeded.
    StepLimitExceeded,
    /// The engine-level choice-point bound (`EngineConfig::max_choice_points`)
    /// was exceeded.
    ChoicePointLimitExceeded,
    /// `throw/1` was reached.
    Thrown(Term),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::StackUnderflow => write!(f, "data stack underflow"),
            VmError::BadConstantIndex(i) => write!(f, "constant pool index {i} out of range"),
            VmError::UnknownPredicate(name, arity) => {
                write!(f, "unknown predicate: {name}/{arity}")
            }
            VmError::BadOpcode(b) => write!(f, "unrecognized opcode byte {b:#04x}"),
            VmError::Fvm(e) => write!(f, "{e}"),
            VmError::StepLimitExceeded => write!(f, "step limit exceeded"),
            VmError::ChoicePointLimitExceeded => write!(f, "choice point limit exceeded"),
            VmError::Thrown(term) => write!(f, "thrown: {term:?}"),
        }
    }
}

impl std::error::Error for VmError {}

impl From<FvmError> for VmError {
    fn from(e: FvmError) -> Self {
        VmError::Fvm(e)
    }
}

impl From<VmError> for EngineError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::Thrown(term) => EngineError::UserThrow(term),
            VmError::UnknownPredicate(name, arity) => EngineError::UnknownPredicate(name, arity),
            VmError::Fvm(FvmError::Instantiation(msg)) => EngineError::InstantiationError(msg),
            VmError::Fvm(FvmError::TypeError(msg)) => EngineError::TypeError(msg),
            other => EngineError::InvalidOperation(other.to_string()),
        }
    }
}

/// Errors raised inside the functional-expression VM.
#[derive(Debug, Clone, PartialEq)]
pub enum FvmError {
    /// A `Load` read an `Unbound` cell.
    Instantiation(String),
    /// An arithmetic or host-interop opcode received a cell of the wrong tag.
    TypeError(String),
    /// A host-interop opcode ran with no `HostInterop` capability installed.
    NoHostInterop,
    /// `Format`/`UserFunction` - pluggable extension points with no
    /// implementation wired in (see SPEC_FULL.md Open Questions).
    Unsupported(&'static str),
}

impl fmt::Display for FvmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FvmError::Instantiation(msg) => write!(f, "instantiation error: {msg}"),
            FvmError::TypeError(msg) => write!(f, "type error: {msg}"),
            FvmError::NoHostInterop => write!(f, "no host-interop capability installed"),
            FvmError::Unsupported(op) => write!(f, "unsupported f-vm opcode: {op}"),
        }
    }
}

impl std::error::Error for FvmError {}
