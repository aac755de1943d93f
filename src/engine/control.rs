//! Structured control, branches, and calls (spec.md §4.5).

use crate::block_resolver::{Block, BlockKind};
use crate::value::Value;

use super::{
    leb_i32, leb_i64, leb_u32, memory_ops, numeric, Frame, Instance, Trap, BR_TABLE_CAP,
    OPERAND_STACK_CAP,
};

// An active structured-control construct, tracked as execution proceeds
// linearly through the function's bytecode.
struct Label {
    block: Block,
    stack_height: usize,
}

/// Runs `frame` to completion (fall off the end of the function, or a
/// `return`), returning its result values. `depth` is this call's nesting
/// depth, threaded through to nested `call`/`call_indirect`.
pub(super) fn run(
    instance: &mut Instance,
    frame: &mut Frame,
    operand_stack: &mut Vec<Value>,
    depth: usize,
    result_count: usize,
) -> Result<Vec<Value>, Trap> {
    let mut labels: Vec<Label> = Vec::new();
    let mut pc = 0usize;
    let code_len = frame.code.len();

    loop {
        if pc >= code_len {
            break;
        }
        let opcode = frame.code[pc];
        pc += 1;

        macro_rules! push {
            ($v:expr) => {{
                if operand_stack.len() >= OPERAND_STACK_CAP {
                    return Err(Trap::CallStackExhausted);
                }
                operand_stack.push($v);
            }};
        }
        macro_rules! pop {
            () => {
                operand_stack.pop().ok_or(Trap::TypeMismatch)?
            };
        }

        match opcode {
            0x00 => return Err(Trap::Unreachable),
            0x01 => {}
            0x02 | 0x03 | 0x04 => {
                let start = pc - 1;
                let block = *frame.blocks.get(start).ok_or(Trap::TypeMismatch)?;
                pc += 1; // skip blocktype byte
                if opcode == 0x04 {
                    let cond = pop!().as_i32().ok_or(Trap::TypeMismatch)?;
                    labels.push(Label {
                        block,
                        stack_height: operand_stack.len(),
                    });
                    if cond == 0 {
                        match block.else_addr {
                            Some(else_addr) => pc = else_addr + 1,
                            None => {
                                labels.pop();
                                pc = block.end_addr + 1;
                            }
                        }
                    }
                } else {
                    labels.push(Label {
                        block,
                        stack_height: operand_stack.len(),
                    });
                }
            }
            0x05 => {
                // Falling off the end of a taken `if` branch: behaves like
                // reaching that block's `end`.
                let label = labels.pop().ok_or(Trap::TypeMismatch)?;
                pc = label.block.end_addr + 1;
            }
            0x0b => {
                if labels.pop().is_none() {
                    break;
                }
            }
            0x0c | 0x0d => {
                let (label_idx, width) = leb_u32(&frame.code[pc..]);
                pc += width;
                let taken = if opcode == 0x0d {
                    pop!().as_i32().ok_or(Trap::TypeMismatch)? != 0
                } else {
                    true
                };
                if taken {
                    branch(&mut labels, operand_stack, &mut pc, label_idx as usize)?;
                }
            }
            0x0e => {
                let (count, mut width) = leb_u32(&frame.code[pc..]);
                if count as usize > BR_TABLE_CAP {
                    return Err(Trap::BrTableSizeExceeded);
                }
                let index = pop!().as_i32().ok_or(Trap::TypeMismatch)? as u32;
                let mut chosen = None;
                for i in 0..count {
                    let (label_idx, w) = leb_u32(&frame.code[pc + width..]);
                    width += w;
                    if i == index {
                        chosen = Some(label_idx);
                    }
                }
                let (default_idx, w) = leb_u32(&frame.code[pc + width..]);
                width += w;
                pc += width;
                let label_idx = chosen.unwrap_or(default_idx);
                branch(&mut labels, operand_stack, &mut pc, label_idx as usize)?;
            }
            0x0f => {
                let results = pop_results(operand_stack, result_count)?;
                return Ok(results);
            }
            0x10 => {
                let (func_idx, width) = leb_u32(&frame.code[pc..]);
                pc += width;
                call(instance, operand_stack, func_idx.into(), depth)?;
            }
            0x11 => {
                let (type_idx, w1) = leb_u32(&frame.code[pc..]);
                let (_table_idx, w2) = leb_u32(&frame.code[pc + w1..]);
                pc += w1 + w2;
                call_indirect(instance, operand_stack, type_idx, depth)?;
            }
            0x1a => {
                pop!();
            }
            0x1b => {
                let c = pop!().as_i32().ok_or(Trap::TypeMismatch)?;
                let b = pop!();
                let a = pop!();
                push!(if c != 0 { a } else { b });
            }
            0x20 => {
                let (idx, width) = leb_u32(&frame.code[pc..]);
                pc += width;
                push!(frame.locals[idx as usize]);
            }
            0x21 => {
                let (idx, width) = leb_u32(&frame.code[pc..]);
                pc += width;
                frame.locals[idx as usize] = pop!();
            }
            0x22 => {
                let (idx, width) = leb_u32(&frame.code[pc..]);
                pc += width;
                let v = pop!();
                frame.locals[idx as usize] = v;
                push!(v);
            }
            0x23 => {
                let (idx, width) = leb_u32(&frame.code[pc..]);
                pc += width;
                push!(instance.globals[idx as usize]);
            }
            0x24 => {
                let (idx, width) = leb_u32(&frame.code[pc..]);
                pc += width;
                instance.globals[idx as usize] = pop!();
            }
            0x28..=0x3e => {
                let (align, w1) = leb_u32(&frame.code[pc..]);
                let (offset, w2) = leb_u32(&frame.code[pc + w1..]);
                pc += w1 + w2;
                let _ = align; // alignment hint, ignored (spec.md §9)
                memory_ops::exec(opcode, instance, operand_stack, offset)?;
            }
            0x3f => {
                let (_reserved, width) = leb_u32(&frame.code[pc..]);
                pc += width;
                push!(Value::I32(memory_ops::size(instance)));
            }
            0x40 => {
                let (_reserved, width) = leb_u32(&frame.code[pc..]);
                pc += width;
                let delta = pop!().as_i32().ok_or(Trap::TypeMismatch)?;
                push!(Value::I32(memory_ops::grow(instance, delta)));
            }
            0x41 => {
                let (v, width) = leb_i32(&frame.code[pc..]);
                pc += width;
                push!(Value::I32(v));
            }
            0x42 => {
                let (v, width) = leb_i64(&frame.code[pc..]);
                pc += width;
                push!(Value::I64(v));
            }
            0x43 => {
                let bytes: [u8; 4] = frame.code[pc..pc + 4].try_into().unwrap();
                pc += 4;
                push!(Value::F32(f32::from_le_bytes(bytes)));
            }
            0x44 => {
                let bytes: [u8; 8] = frame.code[pc..pc + 8].try_into().unwrap();
                pc += 8;
                push!(Value::F64(f64::from_le_bytes(bytes)));
            }
            0xfc => {
                let (sub, width) = leb_u32(&frame.code[pc..]);
                pc += width;
                numeric::exec_bulk(sub, operand_stack)?;
            }
            _ => numeric::exec(opcode, operand_stack)?,
        }
    }

    pop_results(operand_stack, result_count)
}

fn pop_results(operand_stack: &mut Vec<Value>, result_count: usize) -> Result<Vec<Value>, Trap> {
    if operand_stack.len() < result_count {
        return Err(Trap::TypeMismatch);
    }
    Ok(operand_stack.split_off(operand_stack.len() - result_count))
}

fn branch(
    labels: &mut Vec<Label>,
    operand_stack: &mut Vec<Value>,
    pc: &mut usize,
    label_idx: usize,
) -> Result<(), Trap> {
    if label_idx >= labels.len() {
        return Err(Trap::TypeMismatch);
    }
    let target_pos = labels.len() - 1 - label_idx;
    let target = labels[target_pos].block;
    let stack_height = labels[target_pos].stack_height;

    if target.kind == BlockKind::Loop {
        labels.truncate(target_pos + 1);
        operand_stack.truncate(stack_height);
        *pc = target.branch_addr;
    } else {
        let arity = target.result.map_or(0, |_| 1);
        let preserved = operand_stack.split_off(operand_stack.len() - arity.min(operand_stack.len()));
        operand_stack.truncate(stack_height);
        operand_stack.extend(preserved);
        // Keep the target label itself on the stack: `pc` lands on its own
        // `end` opcode, which pops exactly one label when reached normally.
        labels.truncate(target_pos + 1);
        *pc = target.branch_addr;
    }
    Ok(())
}

fn call(
    instance: &mut Instance,
    operand_stack: &mut Vec<Value>,
    func_idx: crate::types::FuncIdx,
    depth: usize,
) -> Result<(), Trap> {
    let ty = instance.funcs[func_idx.index()].ty().clone();
    let args = operand_stack.split_off(operand_stack.len() - ty.param_count());
    let results = instance.call_with_depth(func_idx, &args, depth + 1)?;
    operand_stack.extend(results);
    Ok(())
}

fn call_indirect(
    instance: &mut Instance,
    operand_stack: &mut Vec<Value>,
    type_idx: u32,
    depth: usize,
) -> Result<(), Trap> {
    let index = operand_stack
        .pop()
        .and_then(|v| v.as_i32())
        .ok_or(Trap::TypeMismatch)? as u32;
    let max = instance.table.len() as u32;
    let func_idx = *instance
        .table
        .get(index as usize)
        .ok_or(Trap::UndefinedElement { index, max })?
        .as_ref()
        .ok_or(Trap::UndefinedElement { index, max })?;

    let expected = instance
        .types_at(type_idx)
        .ok_or(Trap::IndirectTypeMismatch)?;
    let actual = instance.funcs[func_idx.index()].ty();
    if !expected.types_match(actual) {
        return Err(Trap::IndirectTypeMismatch);
    }

    let param_count = actual.param_count();
    let args = operand_stack.split_off(operand_stack.len() - param_count);
    let results = instance.call_with_depth(func_idx, &args, depth + 1)?;
    operand_stack.extend(results);
    Ok(())
}
