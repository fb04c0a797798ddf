//! Functional-expression VM (F-VM) opcodes (COMPONENT DESIGN §4.4).
//!
//! A separate byte-oriented stack machine for arithmetic, host interop, and
//! aggregate construction. Kept as its own opcode space rather than folded
//! into [`super::opcodes::Opcode`] since the two machines operate on
//! disjoint stacks and never share an instruction pointer.

use std::fmt;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FOpcode {
    /// Signed immediate follows.
    PushSmallInt = 0x00,
    /// Int pool index follows.
    PushInt = 0x01,
    /// Float pool index follows.
    PushFloat = 0x02,
    /// 0/1 follows.
    PushBoolean = 0x03,
    /// Object pool index follows.
    PushObject = 0x04,
    /// Environment slot index follows; dereferences, errors if `Unbound`.
    Load = 0x05,
    /// Environment slot index follows; copies the raw cell, no deref check.
    LoadUnchecked = 0x06,
    /// Object pool index (of a global name) follows.
    LoadGlobal = 0x07,
    Add = 0x10,
    Subtract = 0x11,
    Multiply = 0x12,
    Divide = 0x13,
    Negate = 0x14,
    FieldReference = 0x20,
    MethodCall = 0x21,
    Constructor = 0x22,
    ComponentLookup = 0x23,
    /// Element count follows.
    Array = 0x30,
    ArrayList = 0x31,
    Hashset = 0x32,
    NonFalse = 0x33,
    Format = 0x40,
    UserFunction = 0x41,
    /// Hand the single result cell back to the goal VM.
    Return = 0x50,
}

impl FOpcode {
    pub fn operand_len(self) -> usize {
        use FOpcode::*;
        match self {
            PushSmallInt | PushInt | PushFloat | PushBoolean | PushObject | Load
            | LoadUnchecked | LoadGlobal | MethodCall | Constructor | Array | ArrayList
            | Hashset | Format | UserFunction => 1,
            Add | Subtract | Multiply | Divide | Negate | FieldReference | ComponentLookup
            | NonFalse | Return => 0,
        }
    }

    pub fn from_byte(b: u8) -> Option<FOpcode> {
        use FOpcode::*;
        Some(match b {
            0x00 => PushSmallInt,
            0x01 => PushInt,
            0x02 => PushFloat,
            0x03 => PushBoolean,
            0x04 => PushObject,
            0x05 => Load,
            0x06 => LoadUnchecked,
            0x07 => LoadGlobal,
            0x10 => Add,
            0x11 => Subtract,
            0x12 => Multiply,
            0x13 => Divide,
            0x14 => Negate,
            0x20 => FieldReference,
            0x21 => MethodCall,
            0x22 => Constructor,
            0x23 => ComponentLookup,
            0x30 => Array,
            0x31 => ArrayList,
            0x32 => Hashset,
            0x33 => NonFalse,
            0x40 => Format,
            0x41 => UserFunction,
            0x50 => Return,
            _ => return None,
        })
    }

    pub fn mnemonic(self) -> &'static str {
        use FOpcode::*;
        match self {
            PushSmallInt => "f_push_small_int",
            PushInt => "f_push_int",
            PushFloat => "f_push_float",
            PushBoolean => "f_push_bool",
            PushObject => "f_push_object",
            Load => "f_load",
            LoadUnchecked => "f_load_unchecked",
            LoadGlobal => "f_load_global",
            Add => "f_add",
            Subtract => "f_sub",
            Multiply => "f_mul",
            Divide => "f_div",
            Negate => "f_neg",
            FieldReference => "f_field_ref",
            MethodCall => "f_method_call",
            Constructor => "f_constructor",
            ComponentLookup => "f_component_lookup",
            Array => "f_array",
            ArrayList => "f_array_list",
            Hashset => "f_hashset",
            NonFalse => "f_non_false",
            Format => "f_format",
            UserFunction => "f_user_function",
            Return => "f_return",
        }
    }
}

impl fmt::Display for FOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant() {
        let variants = [
            FOpcode::PushSmallInt,
            FOpcode::PushInt,
            FOpcode::PushFloat,
            FOpcode::PushBoolean,
            FOpcode::PushObject,
            FOpcode::Load,
            FOpcode::LoadUnchecked,
            FOpcode::LoadGlobal,
            FOpcode::Add,
            FOpcode::Subtract,
            FOpcode::Multiply,
            FOpcode::Divide,
            FOpcode::Negate,
            FOpcode::FieldReference,
            FOpcode::MethodCall,
            FOpcode::Constructor,
            FOpcode::ComponentLookup,
            FOpcode::Array,
            FOpcode::ArrayList,
            FOpcode::Hashset,
            FOpcode::NonFalse,
            FOpcode::Format,
            FOpcode::UserFunction,
            FOpcode::Return,
        ];
        for op in variants {
            assert_eq!(FOpcode::from_byte(op as u8), Some(op));
        }
    }

    #[test]
    fn unrecognized_byte_is_none() {
        assert_eq!(FOpcode::from_byte(0xAA), None);
    }
}
