//! The functional-expression VM (COMPONENT DESIGN §4.4).
//!
//! Evaluates one expression program against a small local value stack - the
//! "scratch region" the spec describes as sitting above the caller's data
//! stack top. Keeping it a genuinely separate `Vec<Cell>` rather than a
//! window into [`crate::value::Stack`] is a deliberate implementation
//! simplification (noted in DESIGN.md): it guarantees arithmetic can never
//! perturb a unification cell, which is the property the spec actually asks
//! for, without needing to reserve and later truncate a stack region by hand.

use crate::error::FvmError;
use crate::predicate::ConstantPool;
use crate::symbol::Symbol;
use crate::value::Cell;

use super::fvm_opcodes::FOpcode;

/// Host-object reflection capability (`FieldReference`, `MethodCall`,
/// `Constructor`, `ComponentLookup`). Out of scope per SPEC_FULL.md §1/§4.4;
/// the default implementation simply refuses every request, which embedders
/// relying on host interop must override by supplying their own `dyn
/// HostInterop` to [`crate::engine::Engine`].
pub trait HostInterop {
    fn field_reference(&mut self, target: &Cell, name: &Cell) -> Result<Cell, FvmError> {
        let _ = (target, name);
        Err(FvmError::NoHostInterop)
    }

    fn method_call(&mut self, target: &Cell, name: &Cell, args: &[Cell]) -> Result<Cell, FvmError> {
        let _ = (target, name, args);
        Err(FvmError::NoHostInterop)
    }

    fn constructor(&mut self, ty: &Cell, args: &[Cell]) -> Result<Cell, FvmError> {
        let _ = (ty, args);
        Err(FvmError::NoHostInterop)
    }

    fn component_lookup(&mut self, target: &Cell) -> Result<Cell, FvmError> {
        let _ = target;
        Err(FvmError::NoHostInterop)
    }
}

/// Refuses all host interop (see [`HostInterop`]'s default methods).
#[derive(Debug, Default)]
pub struct NoHostInterop;

impl HostInterop for NoHostInterop {}

/// What an F-VM program needs from the enclosing clause invocation to
/// resolve `Load`/`LoadGlobal`.
pub trait FvmEnv {
    /// Dereferenced value currently held in environment slot `slot`.
    fn load_slot(&self, slot: u8) -> Option<Cell>;
    fn load_global(&self, name: Symbol) -> Option<Cell>;
}

/// Evaluate one F-VM program starting at `code[offset..]`, stopping at
/// `FOpcode::Return`. Returns the result cell and the offset just past
/// `Return`.
pub fn eval(
    code: &[u8],
    offset: usize,
    pool: &ConstantPool,
    env: &impl FvmEnv,
    host: &mut dyn HostInterop,
) -> Result<(Cell, usize), FvmError> {
    let mut stack: Vec<Cell> = Vec::new();
    let mut pc = offset;

    loop {
        let byte = code[pc];
        let op = FOpcode::from_byte(byte)
            .ok_or_else(|| FvmError::TypeError(format!("bad f-vm opcode {byte:#04x}")))?;
        pc += 1;
        match op {
            FOpcode::PushSmallInt => {
                let v = code[pc] as i8;
                pc += 1;
                stack.push(Cell::Int(v as i64));
            }
            FOpcode::PushInt => {
                let idx = code[pc] as usize;
                pc += 1;
                let v = *pool
                    .ints
                    .get(idx)
                    .ok_or_else(|| FvmError::TypeError("int pool index out of range".into()))?;
                stack.push(Cell::Int(v));
            }
            FOpcode::PushFloat => {
                let idx = code[pc] as usize;
                pc += 1;
                let v = *pool
                    .floats
                    .get(idx)
                    .ok_or_else(|| FvmError::TypeError("float pool index out of range".into()))?;
                stack.push(Cell::Float(v));
            }
            FOpcode::PushBoolean => {
                let v = code[pc] != 0;
                pc += 1;
                stack.push(Cell::Bool(v));
            }
            FOpcode::PushObject => {
                let idx = code[pc] as usize;
                pc += 1;
                let v = pool
                    .objects
                    .get(idx)
                    .ok_or_else(|| FvmError::TypeError("object pool index out of range".into()))?
                    .clone();
                stack.push(v);
            }
            FOpcode::Load => {
                let slot = code[pc];
                pc += 1;
                let v = env
                    .load_slot(slot)
                    .ok_or_else(|| FvmError::Instantiation(format!("slot {slot} is unbound")))?;
                stack.push(v);
            }
            FOpcode::LoadUnchecked => {
                let slot = code[pc];
                pc += 1;
                stack.push(env.load_slot(slot).unwrap_or(Cell::Unbound));
            }
            FOpcode::LoadGlobal => {
                let idx = code[pc] as usize;
                pc += 1;
                let name = match pool.objects.get(idx) {
                    Some(Cell::Reference(crate::value::HostRef::Symbol(s))) => *s,
                    _ => return Err(FvmError::TypeError("global name must be a symbol".into())),
                };
                let v = env
                    .load_global(name)
                    .ok_or_else(|| FvmError::Instantiation("unbound global".into()))?;
                stack.push(v);
            }
            FOpcode::Add | FOpcode::Subtract | FOpcode::Multiply => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                stack.push(arith(op, a, b)?);
            }
            FOpcode::Divide => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                let (af, bf) = (as_float(&a)?, as_float(&b)?);
                stack.push(Cell::Float(af / bf));
            }
            FOpcode::Negate => {
                let a = pop(&mut stack)?;
                stack.push(match a {
                    Cell::Int(n) => Cell::Int(-n),
                    Cell::Float(x) => Cell::Float(-x),
                    other => return Err(FvmError::TypeError(format!("cannot negate {other:?}"))),
                });
            }
            FOpcode::FieldReference => {
                let target = pop(&mut stack)?;
                let name = pop(&mut stack)?;
                stack.push(host.field_reference(&target, &name)?);
            }
            FOpcode::MethodCall => {
                let argc = code[pc] as usize;
                pc += 1;
                let mut args = pop_n(&mut stack, argc)?;
                args.reverse();
                let name = pop(&mut stack)?;
                let target = pop(&mut stack)?;
                stack.push(host.method_call(&target, &name, &args)?);
            }
            FOpcode::Constructor => {
                let argc = code[pc] as usize;
                pc += 1;
                let mut args = pop_n(&mut stack, argc)?;
                args.reverse();
                let ty = pop(&mut stack)?;
                stack.push(host.constructor(&ty, &args)?);
            }
            FOpcode::ComponentLookup => {
                let target = pop(&mut stack)?;
                stack.push(host.component_lookup(&target)?);
            }
            FOpcode::Array | FOpcode::ArrayList => {
                let n = code[pc] as usize;
                pc += 1;
                let items = pop_n(&mut stack, n)?;
                stack.push(Cell::Reference(crate::value::HostRef::Str(
                    format!("{items:?}").into(),
                )));
            }
            FOpcode::Hashset => {
                let n = code[pc] as usize;
                pc += 1;
                let items = pop_n(&mut stack, n)?;
                let unique: Vec<Cell> =
                    itertools::Itertools::unique_by(items.into_iter(), |c| format!("{c:?}"))
                        .collect();
                stack.push(Cell::Reference(crate::value::HostRef::Str(
                    format!("{unique:?}").into(),
                )));
            }
            FOpcode::NonFalse => {
                let top = pop(&mut stack)?;
                let coerced = match top {
                    Cell::Bool(false) => Cell::Bool(false),
                    _ => Cell::Bool(true),
                };
                stack.push(coerced);
            }
            FOpcode::Format => return Err(FvmError::Unsupported("format")),
            FOpcode::UserFunction => return Err(FvmError::Unsupported("user_function")),
            FOpcode::Return => {
                let result = pop(&mut stack)?;
                return Ok((result, pc));
            }
        }
    }
}

fn pop(stack: &mut Vec<Cell>) -> Result<Cell, FvmError> {
    stack
        .pop()
        .ok_or_else(|| FvmError::TypeError("f-vm stack underflow".into()))
}

fn pop_n(stack: &mut Vec<Cell>, n: usize) -> Result<Vec<Cell>, FvmError> {
    if stack.len() < n {
        return Err(FvmError::TypeError("f-vm stack underflow".into()));
    }
    Ok(stack.split_off(stack.len() - n))
}

fn as_float(c: &Cell) -> Result<f32, FvmError> {
    match c {
        Cell::Int(n) => Ok(*n as f32),
        Cell::Float(f) => Ok(*f),
        other => Err(FvmError::TypeError(format!("expected number, got {other:?}"))),
    }
}

/// `Add`/`Subtract`/`Multiply` stay integer iff both operands are Integer;
/// any float operand promotes both (§4.4 "Numeric tag discipline").
fn arith(op: FOpcode, a: Cell, b: Cell) -> Result<Cell, FvmError> {
    if let (Cell::Int(x), Cell::Int(y)) = (&a, &b) {
        let (x, y) = (*x, *y);
        return Ok(Cell::Int(match op {
            FOpcode::Add => x + y,
            FOpcode::Subtract => x - y,
            FOpcode::Multiply => x * y,
            _ => unreachable!(),
        }));
    }
    let (x, y) = (as_float(&a)?, as_float(&b)?);
    Ok(Cell::Float(match op {
        FOpcode::Add => x + y,
        FOpcode::Subtract => x - y,
        FOpcode::Multiply => x * y,
        _ => unreachable!(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::chunk::ChunkBuilder;

    struct EmptyEnv;
    impl FvmEnv for EmptyEnv {
        fn load_slot(&self, _slot: u8) -> Option<Cell> {
            None
        }
        fn load_global(&self, _name: Symbol) -> Option<Cell> {
            None
        }
    }

    fn run(builder: ChunkBuilder) -> Cell {
        let chunk = builder.build();
        let mut host = NoHostInterop;
        eval(&chunk.code, 0, &ConstantPool::default(), &EmptyEnv, &mut host)
            .unwrap()
            .0
    }

    #[test]
    fn integer_addition_stays_integer() {
        let mut b = ChunkBuilder::new("e");
        b.emit_fop(FOpcode::PushSmallInt, &[2]);
        b.emit_fop(FOpcode::PushSmallInt, &[3]);
        b.emit_fop(FOpcode::Add, &[]);
        b.emit_fop(FOpcode::Return, &[]);
        assert_eq!(run(b), Cell::Int(5));
    }

    #[test]
    fn divide_always_promotes_to_float() {
        let mut b = ChunkBuilder::new("e");
        b.emit_fop(FOpcode::PushSmallInt, &[4]);
        b.emit_fop(FOpcode::PushSmallInt, &[2]);
        b.emit_fop(FOpcode::Divide, &[]);
        b.emit_fop(FOpcode::Return, &[]);
        assert_eq!(run(b), Cell::Float(2.0));
    }

    #[test]
    fn mixed_integer_float_promotes() {
        let mut b = ChunkBuilder::new("e");
        b.emit_fop(FOpcode::PushSmallInt, &[2]);
        b.emit_fop(FOpcode::PushFloat, &[0]);
        let chunk_pool = {
            let mut p = ConstantPool::default();
            p.intern_float(0.5).unwrap();
            p
        };
        b.emit_fop(FOpcode::Add, &[]);
        b.emit_fop(FOpcode::Return, &[]);
        let chunk = b.build();
        let mut host = NoHostInterop;
        let (result, _) = eval(&chunk.code, 0, &chunk_pool, &EmptyEnv, &mut host).unwrap();
        assert_eq!(result, Cell::Float(2.5));
    }

    #[test]
    fn non_false_coerces_everything_but_false() {
        let mut b = ChunkBuilder::new("e");
        b.emit_fop(FOpcode::PushSmallInt, &[0]);
        b.emit_fop(FOpcode::NonFalse, &[]);
        b.emit_fop(FOpcode::Return, &[]);
        assert_eq!(run(b), Cell::Bool(true));
    }

    #[test]
    fn host_interop_without_capability_errors() {
        let mut b = ChunkBuilder::new("e");
        b.emit_fop(FOpcode::PushSmallInt, &[1]);
        b.emit_fop(FOpcode::PushSmallInt, &[2]);
        b.emit_fop(FOpcode::FieldReference, &[]);
        b.emit_fop(FOpcode::Return, &[]);
        let chunk = b.build();
        let mut host = NoHostInterop;
        let result = eval(&chunk.code, 0, &ConstantPool::default(), &EmptyEnv, &mut host);
        assert!(matches!(result, Err(FvmError::NoHostInterop)));
    }
}
