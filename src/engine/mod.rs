//! The execution engine (spec.md §4.5): a stack-based interpreter that runs
//! a decoded [`crate::module::Module`] once it has been instantiated against
//! a [`crate::host::Host`].

mod control;
mod memory_ops;
mod numeric;

use std::fmt;
use std::rc::Rc;

use tracing::trace;

use crate::block_resolver::{self, BlockLookup};
use crate::host::{Host, HostFunc};
use crate::module::Module;
use crate::types::{ExportDescriptor, FuncIdx, FuncType, ImportDescriptor, MemType};
use crate::value::Value;

/// Maximum live operand-stack depth across all active calls. A real program
/// never approaches this; it exists so pathological/adversarial recursion
/// traps instead of exhausting host memory.
const OPERAND_STACK_CAP: usize = 1 << 16;

/// Maximum simultaneous call depth (spec.md §7, `CallStackExhausted`).
const CALL_STACK_CAP: usize = 1 << 12;

/// Scratch capacity for a single `br_table`'s label vector (spec.md §7,
/// `BrTableSizeExceeded`).
const BR_TABLE_CAP: usize = 1 << 16;

/// The full trap taxonomy a running instance can raise (spec.md §7).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Trap {
    Unreachable,
    IntegerDivideByZero,
    IntegerOverflow,
    InvalidConversionToInteger,
    UndefinedElement { index: u32, max: u32 },
    IndirectTypeMismatch,
    CallStackExhausted,
    TypeMismatch,
    BrTableSizeExceeded,
    InvalidOpcode(u8),
    InvalidBulkOpcode(u32),
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trap::Unreachable => write!(f, "unreachable"),
            Trap::IntegerDivideByZero => write!(f, "integer divide by zero"),
            Trap::IntegerOverflow => write!(f, "integer overflow"),
            Trap::InvalidConversionToInteger => write!(f, "invalid conversion to integer"),
            Trap::UndefinedElement { index, max } => {
                write!(f, "undefined element {index:#x} (max: {max:#x}) in table")
            }
            Trap::IndirectTypeMismatch => write!(f, "indirect call type mismatch"),
            Trap::CallStackExhausted => write!(f, "call stack exhausted"),
            Trap::TypeMismatch => write!(f, "type mismatch"),
            Trap::BrTableSizeExceeded => write!(f, "br_table size exceeded"),
            Trap::InvalidOpcode(op) => write!(f, "invalid opcode ({op:#x})"),
            Trap::InvalidBulkOpcode(op) => write!(f, "invalid bulk opcode ({op:#x})"),
        }
    }
}

impl std::error::Error for Trap {}

// A function as it exists inside a running instance: either bytecode owned
// by the module, with its control side-table resolved once at instantiation,
// or a host binding supplied through `Host::resolve_func`. `code`/`blocks`
// are `Rc`-shared so a recursive call can clone a cheap handle to its own
// bytecode and release its borrow of `self.funcs` before recursing.
enum FuncDef {
    Local {
        ty: FuncType,
        local_kinds: Rc<[crate::types::ValType]>,
        code: Rc<[u8]>,
        blocks: Rc<BlockLookup>,
    },
    Host {
        ty: FuncType,
        func: HostFunc,
    },
}

impl FuncDef {
    fn ty(&self) -> &FuncType {
        match self {
            FuncDef::Local { ty, .. } => ty,
            FuncDef::Host { ty, .. } => ty,
        }
    }
}

/// Linear memory: a growable byte vector capped at `max_pages` (default
/// 0x8000 = 4 GiB worth of pages, the WASM 1.0 address-space limit).
struct Memory {
    bytes: Vec<u8>,
    max_pages: u32,
}

impl Memory {
    fn pages(&self) -> u32 {
        (self.bytes.len() / crate::types::MemType::PAGE_SIZE) as u32
    }
}

/// An instantiated, runnable module: every import resolved, element/data
/// segments applied, and the start function (if any) not yet run.
pub struct Instance {
    types: Vec<FuncType>,
    funcs: Vec<FuncDef>,
    table: Vec<Option<FuncIdx>>,
    table_max: Option<u32>,
    memory: Option<Memory>,
    globals: Vec<Value>,
    exports: Vec<crate::types::Export>,
    start: Option<FuncIdx>,
}

/// One active call's bookkeeping (spec.md §4.5): where execution resumes in
/// the caller, and where this call's operand-stack working area begins.
/// Local variables are kept in their own per-call vector rather than on the
/// shared operand stack; Rust's own call stack stands in for the spec's flat
/// call-stack array, with `depth` enforcing the same `CallStackExhausted`
/// bound a hand-rolled array would.
struct Frame {
    locals: Vec<Value>,
    blocks: Rc<BlockLookup>,
    code: Rc<[u8]>,
}

impl Instance {
    /// Instantiates `module` against `host`: resolves every import, builds
    /// the table and memory, runs global initializers and active element/
    /// data segments, and resolves each function body's control side-table.
    /// Import-resolution failure is fatal, per spec.md §4.6.
    pub fn instantiate<H: Host>(module: &Module, host: &H) -> Result<Self, String> {
        let mut funcs = Vec::with_capacity(module.imports.len() + module.code.len());
        let mut table: Vec<Option<FuncIdx>> = Vec::new();
        let mut table_max = None;
        let mut memory: Option<Memory> = None;
        let mut globals = Vec::with_capacity(module.globals.len());

        for import in &module.imports {
            match &import.descriptor {
                ImportDescriptor::Function(type_idx) => {
                    let ty = module
                        .types
                        .get(type_idx.index())
                        .ok_or_else(|| format!("unknown type index {}", type_idx.index()))?
                        .clone();
                    let func = host.resolve_func(&import.module, &import.field, &ty).ok_or_else(|| {
                        format!(
                            "unresolved import: {}.{} (function)",
                            import.module, import.field
                        )
                    })?;
                    funcs.push(FuncDef::Host { ty, func });
                }
                ImportDescriptor::Table(ty) => {
                    table = host
                        .resolve_table(&import.module, &import.field, *ty)
                        .ok_or_else(|| {
                            format!(
                                "unresolved import: {}.{} (table)",
                                import.module, import.field
                            )
                        })?;
                    table_max = ty.limits.max;
                }
                ImportDescriptor::Memory(ty) => {
                    let bytes = host
                        .resolve_memory(&import.module, &import.field, *ty)
                        .ok_or_else(|| {
                            format!(
                                "unresolved import: {}.{} (memory)",
                                import.module, import.field
                            )
                        })?;
                    memory = Some(Memory {
                        bytes,
                        max_pages: ty.limits.max.unwrap_or(0x8000),
                    });
                }
                ImportDescriptor::Global(ty) => {
                    let value = host
                        .resolve_global(&import.module, &import.field, *ty)
                        .ok_or_else(|| {
                            format!(
                                "unresolved import: {}.{} (global)",
                                import.module, import.field
                            )
                        })?;
                    globals.push(value);
                }
            }
        }

        for body in &module.code {
            let type_idx = module.func_types[funcs.len() - module_import_func_count(module)];
            let ty = module.types[type_idx.index()].clone();
            let blocks = block_resolver::resolve(&body.code);
            funcs.push(FuncDef::Local {
                ty,
                local_kinds: Rc::from(body.local_kinds.clone()),
                code: Rc::from(body.code.clone()),
                blocks: Rc::new(blocks),
            });
        }

        for table_decl in &module.tables {
            if table.is_empty() {
                table = vec![None; table_decl.limits.min as usize];
                table_max = table_decl.limits.max;
            }
        }

        for mem_decl in &module.memories {
            if memory.is_none() {
                memory = Some(Memory {
                    bytes: vec![0u8; mem_decl.limits.min as usize * MemType::PAGE_SIZE],
                    max_pages: mem_decl.limits.max.unwrap_or(0x8000),
                });
            }
        }

        let mut instance = Instance {
            types: module.types.clone(),
            funcs,
            table,
            table_max,
            memory,
            globals,
            exports: module.exports.clone(),
            start: module.start,
        };

        for decl in &module.globals {
            let value = instance
                .eval_const_expr(&decl.init_expr)
                .map_err(|t| format!("global initializer trapped: {t}"))?;
            instance.globals.push(value);
        }

        for elem in &module.elements {
            let offset = instance
                .eval_const_expr(&elem.offset_expr)
                .map_err(|t| format!("element offset trapped: {t}"))?;
            let offset = offset.as_i32().ok_or("element offset must be i32")? as usize;
            for (i, func_idx) in elem.func_indices.iter().enumerate() {
                if let Some(slot) = instance.table.get_mut(offset + i) {
                    *slot = Some(*func_idx);
                }
            }
        }

        for data in &module.data {
            let offset = instance
                .eval_const_expr(&data.offset_expr)
                .map_err(|t| format!("data offset trapped: {t}"))?;
            let offset = offset.as_i32().ok_or("data offset must be i32")? as usize;
            if let Some(mem) = instance.memory.as_mut() {
                let end = offset + data.bytes.len();
                if end > mem.bytes.len() {
                    return Err("data segment out of memory bounds".to_string());
                }
                mem.bytes[offset..end].copy_from_slice(&data.bytes);
            }
        }

        Ok(instance)
    }

    /// Evaluates a constant-expression bytecode sequence (spec.md §4.4): the
    /// handful of `*.const`/`global.get` instructions legal in an
    /// initializer, terminated by `end`.
    fn eval_const_expr(&self, code: &[u8]) -> Result<Value, Trap> {
        let mut pos = 0usize;
        let mut value = Value::I32(0);
        loop {
            let opcode = code[pos];
            pos += 1;
            match opcode {
                0x41 => {
                    let (v, width) = read_leb_i32(&code[pos..]);
                    value = Value::I32(v);
                    pos += width;
                }
                0x42 => {
                    let (v, width) = read_leb_i64(&code[pos..]);
                    value = Value::I64(v);
                    pos += width;
                }
                0x43 => {
                    let bytes: [u8; 4] = code[pos..pos + 4].try_into().unwrap();
                    value = Value::F32(f32::from_le_bytes(bytes));
                    pos += 4;
                }
                0x44 => {
                    let bytes: [u8; 8] = code[pos..pos + 8].try_into().unwrap();
                    value = Value::F64(f64::from_le_bytes(bytes));
                    pos += 8;
                }
                0x23 => {
                    let (idx, width) = read_leb_u32(&code[pos..]);
                    value = self.globals[idx as usize];
                    pos += width;
                }
                0x0b => break,
                other => return Err(Trap::InvalidOpcode(other)),
            }
        }
        Ok(value)
    }

    /// Looks up an export by name.
    pub fn export(&self, field: &str) -> Option<&ExportDescriptor> {
        self.exports
            .iter()
            .find(|e| e.field == field)
            .map(|e| &e.descriptor)
    }

    pub fn func_type(&self, idx: FuncIdx) -> &FuncType {
        self.funcs[idx.index()].ty()
    }

    fn types_at(&self, idx: u32) -> Option<&FuncType> {
        self.types.get(idx as usize)
    }

    /// Runs the module's start function, if declared.
    pub fn run_start(&mut self) -> Result<(), Trap> {
        if let Some(idx) = self.start {
            self.call(idx, &[])?;
        }
        Ok(())
    }

    /// Calls function `idx` with `args`, returning its results (spec.md
    /// §4.5's call/return protocol).
    pub fn call(&mut self, idx: FuncIdx, args: &[Value]) -> Result<Vec<Value>, Trap> {
        self.call_with_depth(idx, args, 0)
    }

    fn call_with_depth(
        &mut self,
        idx: FuncIdx,
        args: &[Value],
        depth: usize,
    ) -> Result<Vec<Value>, Trap> {
        if depth >= CALL_STACK_CAP {
            return Err(Trap::CallStackExhausted);
        }

        match &self.funcs[idx.index()] {
            FuncDef::Host { func, .. } => {
                let func = Rc::clone(func);
                func(args)
            }
            FuncDef::Local {
                local_kinds,
                code,
                blocks,
                ..
            } => {
                trace!(func = idx.index(), "entering function");
                let result_count = self.funcs[idx.index()].ty().result_count();
                let local_kinds = Rc::clone(local_kinds);
                let code = Rc::clone(code);
                let blocks = Rc::clone(blocks);

                let mut locals = Vec::with_capacity(local_kinds.len());
                locals.extend_from_slice(args);
                for kind in &local_kinds[args.len()..] {
                    locals.push(Value::zero(*kind));
                }

                let mut frame = Frame {
                    locals,
                    blocks,
                    code,
                };
                let mut operand_stack = Vec::new();
                control::run(self, &mut frame, &mut operand_stack, depth, result_count)
            }
        }
    }
}

fn module_import_func_count(module: &Module) -> usize {
    module
        .imports
        .iter()
        .filter(|i| matches!(i.descriptor, ImportDescriptor::Function(_)))
        .count()
}

fn read_leb_u32(bytes: &[u8]) -> (u32, usize) {
    let mut result = 0u32;
    let mut shift = 0;
    for (i, &b) in bytes.iter().enumerate() {
        result |= u32::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return (result, i + 1);
        }
        shift += 7;
    }
    (result, bytes.len())
}

fn read_leb_i32(bytes: &[u8]) -> (i32, usize) {
    let mut result = 0i64;
    let mut shift = 0;
    for (i, &b) in bytes.iter().enumerate() {
        result |= i64::from(b & 0x7f) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            if shift < 32 && (b & 0x40) != 0 {
                result |= -(1i64 << shift);
            }
            return (result as i32, i + 1);
        }
    }
    (result as i32, bytes.len())
}

fn read_leb_i64(bytes: &[u8]) -> (i64, usize) {
    let mut result = 0i128;
    let mut shift = 0;
    for (i, &b) in bytes.iter().enumerate() {
        result |= i128::from(b & 0x7f) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            if shift < 64 && (b & 0x40) != 0 {
                result |= -(1i128 << shift);
            }
            return (result as i64, i + 1);
        }
    }
    (result as i64, bytes.len())
}

pub(crate) use read_leb_i32 as leb_i32;
pub(crate) use read_leb_i64 as leb_i64;
pub(crate) use read_leb_u32 as leb_u32;
