//! The bytecode layer: two opcode sets (goal ISA, F-VM ISA), the buffer/
//! builder that holds compiled instructions, and the two virtual machines
//! that execute them (COMPONENT DESIGN §4.3, §4.4).

pub mod chunk;
pub mod fvm;
pub mod fvm_opcodes;
pub mod opcodes;
pub mod vm;
