//! Goal-VM opcodes.
//!
//! Each instruction is an opcode byte followed by zero or more byte operands
//! (environment-slot indices, constant-pool indices, or small immediates).
//! Opcodes are grouped into contiguous ranges: head (0x00-0x0F), goal
//! (0x10-0x1F), control (0x20-0x2F), builtin (0x30-0x4F).
//!
//! SPEC_FULL.md's Open Question decision: the head/goal relationship is
//! captured by [`Opcode::to_goal`]/[`Opcode::to_head`] rather than by doing
//! arithmetic on the raw byte - the exact offset between the two families is
//! incidental, so there is no reason to bake it into a formula callers have
//! to reverse.

use std::fmt;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // === Head opcodes (0x00-0x0F) ===
    /// Skip one caller argument without binding anything.
    HeadVoid = 0x00,
    /// First occurrence of a permanent variable: copy the caller's cell into
    /// the environment slot.
    HeadVarFirst = 0x01,
    /// Later occurrence: unify the caller's cell with the slot.
    HeadVarMatch = 0x02,
    /// Unify the caller's cell with an integer constant (pool index follows).
    HeadConstInt = 0x03,
    /// Unify with a float constant (pool index follows).
    HeadConstFloat = 0x04,
    /// Unify with a boolean immediate (0/1 follows).
    HeadConstBool = 0x05,
    /// Unify with an object constant - string, predicate indicator, etc.
    HeadConstObject = 0x06,
    /// Unify with the result of inline F-VM code (terminated by `FReturn`).
    HeadConstFexpr = 0x07,
    /// Unify with a predicate-indicator literal (pool index follows).
    HeadConstPredRef = 0x08,

    // === Goal opcodes (0x10-0x1F) ===
    /// Push a fresh `Unbound` cell as the next call argument.
    GoalVoid = 0x10,
    /// First body occurrence of a permanent variable: initialize its slot to
    /// `Unbound`, then push a `StackRef` to it as the argument.
    GoalVarFirst = 0x11,
    /// Later occurrence: push a `StackRef` to the already-bound slot.
    GoalVarMatch = 0x12,
    GoalConstInt = 0x13,
    GoalConstFloat = 0x14,
    GoalConstBool = 0x15,
    GoalConstObject = 0x16,
    GoalConstFexpr = 0x17,
    GoalConstPredRef = 0x18,

    // === Control opcodes (0x20-0x2F) ===
    /// Begin a call: pool index names the predicate, next byte its arity.
    EmitGoal = 0x20,
    /// Invoke the predicate named by the preceding `EmitGoal`; push a choice
    /// point if more than one clause remains untried.
    CCall = 0x21,
    /// Tail-call optimisation: reuse the current environment frame.
    CLastCall = 0x22,
    /// Terminate the clause successfully.
    CNoGoal = 0x23,
    /// Discard all choice points created since this clause's entry.
    CCut = 0x24,
    /// Invoke a native primop for the predicate named by the preceding
    /// `EmitGoal`.
    CSpecial = 0x25,
    /// Meta-call prelude: like `EmitGoal`, but the predicate indicator is
    /// not a compile-time constant - it is read at run time from the first
    /// cell pushed after this opcode (the `Pred` argument of `call/N`).
    /// Operand is the count of extra arguments following `Pred`.
    EmitMetaGoal = 0x26,

    // === Builtin opcodes (0x30-0x4F) ===
    /// Unconditional failure.
    BFail = 0x30,
    /// Succeed iff the environment slot dereferences to `Unbound`.
    BVar = 0x31,
    /// Succeed iff the environment slot does not dereference to `Unbound`.
    BNonvar = 0x32,
    /// Evaluate inline F-VM code (terminated by `FReturn`), pushing its
    /// result onto the VM's expression scratch area.
    BEvalExpr = 0x33,
    BCompareLt = 0x34,
    BCompareGt = 0x35,
    BCompareLe = 0x36,
    BCompareGe = 0x37,
    BTypeIsInteger = 0x38,
    BTypeIsFloat = 0x39,
    BTypeIsNumber = 0x3A,
    BTypeIsString = 0x3B,
    BTypeIsSymbol = 0x3C,
    BTypeIsMissing = 0x3D,
    /// Pop one value off the expression scratch and force-write it into the
    /// slot regardless of its current binding state.
    BUnsafeSet = 0x3E,
    BUnsafeInitialize = 0x3F,
    BUnsafeInitializeZero = 0x40,
    BUnsafeInitializeZeroInt = 0x41,
    BAggregateMaximizeUpdate = 0x42,
    BAggregateMinimizeUpdate = 0x43,
    BAggregateSumUpdateAndRepeat = 0x44,
    BAggregateIncAndRepeat = 0x45,
    /// Pop one value off the expression scratch and raise it as a user throw.
    BThrow = 0x46,
    /// Informational failure - logs and fails, does not abort (§7 policy).
    BCallFailed = 0x47,
}

impl Opcode {
    /// Number of operand bytes following this opcode in the instruction
    /// stream, not counting any inline F-VM sub-program.
    pub fn operand_len(self) -> usize {
        use Opcode::*;
        match self {
            HeadVoid | CCall | CLastCall | CNoGoal | CCut | CSpecial | BFail | BEvalExpr
            | BCompareLt | BCompareGt | BCompareLe | BCompareGe | BThrow | BCallFailed
            | GoalVoid | HeadConstFexpr | GoalConstFexpr => 0,
            HeadVarFirst | HeadVarMatch | HeadConstInt | HeadConstFloat | HeadConstBool
            | HeadConstObject | HeadConstPredRef | GoalVarFirst | GoalVarMatch | GoalConstInt
            | GoalConstFloat | GoalConstBool | GoalConstObject | GoalConstPredRef | BVar
            | BNonvar | BTypeIsInteger | BTypeIsFloat | BTypeIsNumber | BTypeIsString
            | BTypeIsSymbol | BTypeIsMissing | BUnsafeSet | BUnsafeInitialize
            | BUnsafeInitializeZero | BUnsafeInitializeZeroInt | BAggregateMaximizeUpdate
            | BAggregateMinimizeUpdate | BAggregateSumUpdateAndRepeat
            | BAggregateIncAndRepeat | EmitMetaGoal => 1,
            EmitGoal => 2,
        }
    }

    /// Whether this is a goal-family opcode (body argument pushing) as
    /// opposed to a head-family opcode (caller-argument matching).
    pub fn is_goal_family(self) -> bool {
        (self as u8) & 0xF0 == 0x10
    }

    /// The goal-family counterpart of a head opcode, or `self` if `self` is
    /// already goal-family (or has none, e.g. control/builtin opcodes).
    pub fn to_goal(self) -> Opcode {
        use Opcode::*;
        match self {
            HeadVoid => GoalVoid,
            HeadVarFirst => GoalVarFirst,
            HeadVarMatch => GoalVarMatch,
            HeadConstInt => GoalConstInt,
            HeadConstFloat => GoalConstFloat,
            HeadConstBool => GoalConstBool,
            HeadConstObject => GoalConstObject,
            HeadConstFexpr => GoalConstFexpr,
            HeadConstPredRef => GoalConstPredRef,
            other => other,
        }
    }

    /// The head-family counterpart of a goal opcode, or `self` otherwise.
    pub fn to_head(self) -> Opcode {
        use Opcode::*;
        match self {
            GoalVoid => HeadVoid,
            GoalVarFirst => HeadVarFirst,
            GoalVarMatch => HeadVarMatch,
            GoalConstInt => HeadConstInt,
            GoalConstFloat => HeadConstFloat,
            GoalConstBool => HeadConstBool,
            GoalConstObject => HeadConstObject,
            GoalConstFexpr => HeadConstFexpr,
            GoalConstPredRef => HeadConstPredRef,
            other => other,
        }
    }

    pub fn from_byte(b: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match b {
            0x00 => HeadVoid,
            0x01 => HeadVarFirst,
            0x02 => HeadVarMatch,
            0x03 => HeadConstInt,
            0x04 => HeadConstFloat,
            0x05 => HeadConstBool,
            0x06 => HeadConstObject,
            0x07 => HeadConstFexpr,
            0x08 => HeadConstPredRef,
            0x10 => GoalVoid,
            0x11 => GoalVarFirst,
            0x12 => GoalVarMatch,
            0x13 => GoalConstInt,
            0x14 => GoalConstFloat,
            0x15 => GoalConstBool,
            0x16 => GoalConstObject,
            0x17 => GoalConstFexpr,
            0x18 => GoalConstPredRef,
            0x20 => EmitGoal,
            0x21 => CCall,
            0x22 => CLastCall,
            0x23 => CNoGoal,
            0x24 => CCut,
            0x25 => CSpecial,
            0x26 => EmitMetaGoal,
            0x30 => BFail,
            0x31 => BVar,
            0x32 => BNonvar,
            0x33 => BEvalExpr,
            0x34 => BCompareLt,
            0x35 => BCompareGt,
            0x36 => BCompareLe,
            0x37 => BCompareGe,
            0x38 => BTypeIsInteger,
            0x39 => BTypeIsFloat,
            0x3A => BTypeIsNumber,
            0x3B => BTypeIsString,
            0x3C => BTypeIsSymbol,
            0x3D => BTypeIsMissing,
            0x3E => BUnsafeSet,
            0x3F => BUnsafeInitialize,
            0x40 => BUnsafeInitializeZero,
            0x41 => BUnsafeInitializeZeroInt,
            0x42 => BAggregateMaximizeUpdate,
            0x43 => BAggregateMinimizeUpdate,
            0x44 => BAggregateSumUpdateAndRepeat,
            0x45 => BAggregateIncAndRepeat,
            0x46 => BThrow,
            0x47 => BCallFailed,
            _ => return None,
        })
    }

    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            HeadVoid => "head_void",
            HeadVarFirst => "head_var_first",
            HeadVarMatch => "head_var_match",
            HeadConstInt => "head_const_int",
            HeadConstFloat => "head_const_float",
            HeadConstBool => "head_const_bool",
            HeadConstObject => "head_const_object",
            HeadConstFexpr => "head_const_fexpr",
            HeadConstPredRef => "head_const_predref",
            GoalVoid => "goal_void",
            GoalVarFirst => "goal_var_first",
            GoalVarMatch => "goal_var_match",
            GoalConstInt => "goal_const_int",
            GoalConstFloat => "goal_const_float",
            GoalConstBool => "goal_const_bool",
            GoalConstObject => "goal_const_object",
            GoalConstFexpr => "goal_const_fexpr",
            GoalConstPredRef => "goal_const_predref",
            EmitGoal => "emit_goal",
            CCall => "c_call",
            CLastCall => "c_last_call",
            CNoGoal => "c_no_goal",
            CCut => "c_cut",
            CSpecial => "c_special",
            EmitMetaGoal => "emit_meta_goal",
            BFail => "b_fail",
            BVar => "b_var",
            BNonvar => "b_nonvar",
            BEvalExpr => "b_eval_expr",
            BCompareLt => "b_compare_lt",
            BCompareGt => "b_compare_gt",
            BCompareLe => "b_compare_le",
            BCompareGe => "b_compare_ge",
            BTypeIsInteger => "b_type_integer",
            BTypeIsFloat => "b_type_float",
            BTypeIsNumber => "b_type_number",
            BTypeIsString => "b_type_string",
            BTypeIsSymbol => "b_type_symbol",
            BTypeIsMissing => "b_type_missing",
            BUnsafeSet => "b_unsafe_set",
            BUnsafeInitialize => "b_unsafe_initialize",
            BUnsafeInitializeZero => "b_unsafe_initialize_zero",
            BUnsafeInitializeZeroInt => "b_unsafe_initialize_zero_int",
            BAggregateMaximizeUpdate => "b_aggregate_maximize_update",
            BAggregateMinimizeUpdate => "b_aggregate_minimize_update",
            BAggregateSumUpdateAndRepeat => "b_aggregate_sum_update_and_repeat",
            BAggregateIncAndRepeat => "b_aggregate_inc_and_repeat",
            BThrow => "b_throw",
            BCallFailed => "b_call_failed",
        }
    }

    pub fn is_terminator(self) -> bool {
        matches!(self, Opcode::CNoGoal | Opcode::BFail)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_byte_round_trips_every_variant() {
        let variants = [
            Opcode::HeadVoid,
            Opcode::HeadVarFirst,
            Opcode::HeadVarMatch,
            Opcode::HeadConstInt,
            Opcode::HeadConstFloat,
            Opcode::HeadConstBool,
            Opcode::HeadConstObject,
            Opcode::HeadConstFexpr,
            Opcode::HeadConstPredRef,
            Opcode::GoalVoid,
            Opcode::GoalVarFirst,
            Opcode::GoalVarMatch,
            Opcode::EmitGoal,
            Opcode::CCall,
            Opcode::CLastCall,
            Opcode::CNoGoal,
            Opcode::CCut,
            Opcode::CSpecial,
            Opcode::BFail,
            Opcode::BThrow,
        ];
        for op in variants {
            assert_eq!(Opcode::from_byte(op as u8), Some(op));
        }
    }

    #[test]
    fn head_to_goal_and_back_is_identity() {
        let heads = [
            Opcode::HeadVoid,
            Opcode::HeadVarFirst,
            Opcode::HeadVarMatch,
            Opcode::HeadConstInt,
        ];
        for head in heads {
            assert_eq!(head.to_goal().to_head(), head);
            assert!(head.to_goal().is_goal_family());
        }
    }

    #[test]
    fn unrecognized_byte_decodes_to_none() {
        assert_eq!(Opcode::from_byte(0xFF), None);
    }

    #[test]
    fn zero_arity_terminator_is_single_byte() {
        assert_eq!(Opcode::CNoGoal.operand_len(), 0);
    }
}
