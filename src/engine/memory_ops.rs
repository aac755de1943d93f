//! Linear memory instructions (spec.md §4.5): the load/store family and
//! `memory.size`/`memory.grow`.

use crate::types::MemType;
use crate::value::Value;

use super::{Instance, Trap};

fn pop_i32(stack: &mut Vec<Value>) -> Result<i32, Trap> {
    stack.pop().and_then(|v| v.as_i32()).ok_or(Trap::TypeMismatch)
}

fn pop_i64(stack: &mut Vec<Value>) -> Result<i64, Trap> {
    stack.pop().and_then(|v| v.as_i64()).ok_or(Trap::TypeMismatch)
}

fn pop_f32(stack: &mut Vec<Value>) -> Result<f32, Trap> {
    stack.pop().and_then(|v| v.as_f32()).ok_or(Trap::TypeMismatch)
}

fn pop_f64(stack: &mut Vec<Value>) -> Result<f64, Trap> {
    stack.pop().and_then(|v| v.as_f64()).ok_or(Trap::TypeMismatch)
}

// Computes the effective byte address for `offset + dynamic`, trapping
// rather than wrapping on overflow; bounds against the memory's current
// size are checked by the caller against `bytes.len()`.
fn effective_addr(offset: u32, dynamic: i32) -> Result<usize, Trap> {
    let addr = (dynamic as u32).checked_add(offset).ok_or(Trap::TypeMismatch)?;
    Ok(addr as usize)
}

fn bytes_mut<'a>(instance: &'a mut Instance) -> Result<&'a mut Vec<u8>, Trap> {
    instance
        .memory
        .as_mut()
        .map(|m| &mut m.bytes)
        .ok_or(Trap::TypeMismatch)
}

fn bytes<'a>(instance: &'a Instance) -> Result<&'a [u8], Trap> {
    instance
        .memory
        .as_ref()
        .map(|m| m.bytes.as_slice())
        .ok_or(Trap::TypeMismatch)
}

fn load<const N: usize>(mem: &[u8], addr: usize) -> Result<[u8; N], Trap> {
    let end = addr.checked_add(N).ok_or(Trap::TypeMismatch)?;
    mem.get(addr..end)
        .map(|s| s.try_into().unwrap())
        .ok_or(Trap::TypeMismatch)
}

fn store(mem: &mut [u8], addr: usize, data: &[u8]) -> Result<(), Trap> {
    let end = addr.checked_add(data.len()).ok_or(Trap::TypeMismatch)?;
    let slot = mem.get_mut(addr..end).ok_or(Trap::TypeMismatch)?;
    slot.copy_from_slice(data);
    Ok(())
}

/// Executes a single load or store opcode (`0x28..=0x3e`). The alignment
/// hint has already been consumed and discarded by the caller; only
/// `offset` (the static immediate) matters for addressing, as this engine
/// makes no distinction between aligned and unaligned accesses.
pub(super) fn exec(
    opcode: u8,
    instance: &mut Instance,
    stack: &mut Vec<Value>,
    offset: u32,
) -> Result<(), Trap> {
    match opcode {
        0x28 => {
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            let v = i32::from_le_bytes(load::<4>(bytes(instance)?, addr)?);
            stack.push(Value::I32(v));
        }
        0x29 => {
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            let v = i64::from_le_bytes(load::<8>(bytes(instance)?, addr)?);
            stack.push(Value::I64(v));
        }
        0x2a => {
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            let v = f32::from_le_bytes(load::<4>(bytes(instance)?, addr)?);
            stack.push(Value::F32(v));
        }
        0x2b => {
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            let v = f64::from_le_bytes(load::<8>(bytes(instance)?, addr)?);
            stack.push(Value::F64(v));
        }
        0x2c => {
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            let v = i8::from_le_bytes(load::<1>(bytes(instance)?, addr)?);
            stack.push(Value::I32(v as i32));
        }
        0x2d => {
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            let v = u8::from_le_bytes(load::<1>(bytes(instance)?, addr)?);
            stack.push(Value::I32(v as i32));
        }
        0x2e => {
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            let v = i16::from_le_bytes(load::<2>(bytes(instance)?, addr)?);
            stack.push(Value::I32(v as i32));
        }
        0x2f => {
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            let v = u16::from_le_bytes(load::<2>(bytes(instance)?, addr)?);
            stack.push(Value::I32(v as i32));
        }
        0x30 => {
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            let v = i8::from_le_bytes(load::<1>(bytes(instance)?, addr)?);
            stack.push(Value::I64(v as i64));
        }
        0x31 => {
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            let v = u8::from_le_bytes(load::<1>(bytes(instance)?, addr)?);
            stack.push(Value::I64(v as i64));
        }
        0x32 => {
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            let v = i16::from_le_bytes(load::<2>(bytes(instance)?, addr)?);
            stack.push(Value::I64(v as i64));
        }
        0x33 => {
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            let v = u16::from_le_bytes(load::<2>(bytes(instance)?, addr)?);
            stack.push(Value::I64(v as i64));
        }
        0x34 => {
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            let v = i32::from_le_bytes(load::<4>(bytes(instance)?, addr)?);
            stack.push(Value::I64(v as i64));
        }
        0x35 => {
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            let v = u32::from_le_bytes(load::<4>(bytes(instance)?, addr)?);
            stack.push(Value::I64(v as i64));
        }
        0x36 => {
            let v = pop_i32(stack)?;
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            store(bytes_mut(instance)?, addr, &v.to_le_bytes())?;
        }
        0x37 => {
            let v = pop_i64(stack)?;
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            store(bytes_mut(instance)?, addr, &v.to_le_bytes())?;
        }
        0x38 => {
            let v = pop_f32(stack)?;
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            store(bytes_mut(instance)?, addr, &v.to_le_bytes())?;
        }
        0x39 => {
            let v = pop_f64(stack)?;
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            store(bytes_mut(instance)?, addr, &v.to_le_bytes())?;
        }
        0x3a => {
            let v = pop_i32(stack)? as u8;
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            store(bytes_mut(instance)?, addr, &v.to_le_bytes())?;
        }
        0x3b => {
            let v = pop_i32(stack)? as u16;
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            store(bytes_mut(instance)?, addr, &v.to_le_bytes())?;
        }
        0x3c => {
            let v = pop_i64(stack)? as u8;
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            store(bytes_mut(instance)?, addr, &v.to_le_bytes())?;
        }
        0x3d => {
            let v = pop_i64(stack)? as u16;
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            store(bytes_mut(instance)?, addr, &v.to_le_bytes())?;
        }
        0x3e => {
            let v = pop_i64(stack)? as u32;
            let addr = effective_addr(offset, pop_i32(stack)?)?;
            store(bytes_mut(instance)?, addr, &v.to_le_bytes())?;
        }
        op => return Err(Trap::InvalidOpcode(op)),
    }
    Ok(())
}

/// `memory.size`: the current size in 64 KiB pages.
pub(super) fn size(instance: &Instance) -> i32 {
    instance.memory.as_ref().map_or(0, |m| m.pages() as i32)
}

/// `memory.grow`: grows linear memory by `delta` pages, returning the prior
/// page count, or `-1` if growth would exceed the declared maximum. `delta
/// == 0` is a no-op that still reports the current size, matching the
/// general case rather than a special early return.
pub(super) fn grow(instance: &mut Instance, delta: i32) -> i32 {
    let Some(mem) = instance.memory.as_mut() else {
        return -1;
    };
    if delta < 0 {
        return -1;
    }
    let prior = mem.pages();
    let cap = mem.max_pages;
    let new_pages = match prior.checked_add(delta as u32) {
        Some(n) if n <= cap => n,
        _ => return -1,
    };
    mem.bytes
        .resize(new_pages as usize * MemType::PAGE_SIZE, 0);
    prior as i32
}
