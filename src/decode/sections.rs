//! Per-section decoding (spec.md §4.2).

use num_enum::TryFromPrimitive;

use crate::module::Module;
use crate::storage::Stream;
use crate::types::*;

use super::{ContextId, ContextStack, Contextual, Decodable, Decoder, Error};

// Implementation-defined upper bound on locals per function; the format
// itself only bounds this by the section length.
const MAX_LOCALS_PER_FUNCTION: usize = 2000;

macro_rules! impl_byte_enum {
    ($type:ty, $make_err:path) => {
        impl Contextual for $type {
            const ID: ContextId = ContextId::Byte;
        }
        impl Decodable for $type {
            fn decode<Storage: Stream>(
                decoder: &mut Decoder<Storage>,
                _: &mut ContextStack,
            ) -> Result<Self, Error<Storage>> {
                let byte = decoder.read_byte_raw()?;
                Self::try_from(byte).map_err(|_| $make_err(byte))
            }
        }
    };
}

fn name<Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
) -> Result<String, Error<Storage>> {
    decoder.with_context(context, ContextId::Name, |decoder, context| {
        let bytes: Vec<u8> = decoder.read(context)?;
        // spec.md §4.2: string bytes are opaque, valid UTF-8 per spec but not
        // re-validated here, so malformed bytes are replaced rather than
        // rejected.
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    })
}

impl Contextual for ValType {
    const ID: ContextId = ContextId::ValType;
}
impl Decodable for ValType {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let byte = decoder.read_byte_raw()?;
        Self::try_from(byte).map_err(|_| Error::InvalidValType(byte))
    }
}

impl_byte_enum!(GlobalMutability, Error::InvalidToken);

impl Contextual for Limits {
    const ID: ContextId = ContextId::Limits;
}
impl Decodable for Limits {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let has_max = decoder.read_byte_raw()?;
        let min: u32 = decoder.read(context)?;
        let max = match has_max {
            0x00 => None,
            0x01 => Some(decoder.read(context)?),
            byte => return Err(Error::InvalidToken(byte)),
        };
        Ok(Limits { min, max })
    }
}

impl Contextual for TableType {
    const ID: ContextId = ContextId::TableType;
}
impl Decodable for TableType {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        // `funcref`, the only reference type in the MVP surface.
        const FUNCREF: u8 = 0x70;
        let byte = decoder.read_byte_raw()?;
        if byte != FUNCREF {
            return Err(Error::InvalidToken(byte));
        }
        Ok(TableType {
            limits: decoder.read(context)?,
        })
    }
}

impl Contextual for MemType {
    const ID: ContextId = ContextId::MemType;
}
impl Decodable for MemType {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        Ok(MemType {
            limits: decoder.read(context)?,
        })
    }
}

impl Contextual for GlobalType {
    const ID: ContextId = ContextId::GlobalType;
}
impl Decodable for GlobalType {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let value: ValType = decoder.read(context)?;
        let mutability: GlobalMutability = decoder.read(context)?;
        Ok(GlobalType { value, mutability })
    }
}

impl Contextual for FuncType {
    const ID: ContextId = ContextId::FuncType;
}
impl Decodable for FuncType {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        const TAG: u8 = 0x60;
        let byte = decoder.read_byte_raw()?;
        if byte != TAG {
            return Err(Error::InvalidToken(byte));
        }
        let params: Vec<ValType> = decoder.read(context)?;
        let results: Vec<ValType> = decoder.read(context)?;
        Ok(FuncType::new(params, results))
    }
}

impl Contextual for TypeIdx {
    const ID: ContextId = ContextId::TypeIdx;
}
impl Decodable for TypeIdx {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        Ok(TypeIdx(decoder.read(context)?))
    }
}

impl Contextual for FuncIdx {
    const ID: ContextId = ContextId::FuncIdx;
}
impl Decodable for FuncIdx {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        Ok(FuncIdx(decoder.read(context)?))
    }
}

impl Contextual for TableIdx {
    const ID: ContextId = ContextId::TableIdx;
}
impl Decodable for TableIdx {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        Ok(TableIdx(decoder.read(context)?))
    }
}

impl Contextual for MemIdx {
    const ID: ContextId = ContextId::MemIdx;
}
impl Decodable for MemIdx {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        Ok(MemIdx(decoder.read(context)?))
    }
}

impl Contextual for GlobalIdx {
    const ID: ContextId = ContextId::GlobalIdx;
}
impl Decodable for GlobalIdx {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        Ok(GlobalIdx(decoder.read(context)?))
    }
}

impl Contextual for ImportDescriptor {
    const ID: ContextId = ContextId::ImportDesc;
}
impl Decodable for ImportDescriptor {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let tag = decoder.read_byte_raw()?;
        match tag {
            0x00 => Ok(ImportDescriptor::Function(decoder.read(context)?)),
            0x01 => Ok(ImportDescriptor::Table(decoder.read(context)?)),
            0x02 => Ok(ImportDescriptor::Memory(decoder.read(context)?)),
            0x03 => Ok(ImportDescriptor::Global(decoder.read(context)?)),
            byte => Err(Error::InvalidToken(byte)),
        }
    }
}

impl Contextual for Import {
    const ID: ContextId = ContextId::Import;
}
impl Decodable for Import {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let module = name(decoder, context)?;
        let field = name(decoder, context)?;
        let descriptor = decoder.read(context)?;
        Ok(Import {
            module,
            field,
            descriptor,
        })
    }
}

impl Contextual for ExportDescriptor {
    const ID: ContextId = ContextId::ExportDesc;
}
impl Decodable for ExportDescriptor {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let tag = decoder.read_byte_raw()?;
        match tag {
            0x00 => Ok(ExportDescriptor::Function(decoder.read(context)?)),
            0x01 => Ok(ExportDescriptor::Table(decoder.read(context)?)),
            0x02 => Ok(ExportDescriptor::Memory(decoder.read(context)?)),
            0x03 => Ok(ExportDescriptor::Global(decoder.read(context)?)),
            byte => Err(Error::InvalidToken(byte)),
        }
    }
}

impl Contextual for Export {
    const ID: ContextId = ContextId::Export;
}
impl Decodable for Export {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let field = name(decoder, context)?;
        let descriptor = decoder.read(context)?;
        Ok(Export { field, descriptor })
    }
}

impl Contextual for LocalGroup {
    const ID: ContextId = ContextId::Locals;
}
impl Decodable for LocalGroup {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let count: u32 = decoder.read(context)?;
        let kind: ValType = decoder.read(context)?;
        Ok(LocalGroup { count, kind })
    }
}

/// Reads one instruction stream (a function body or a constant-expression
/// initializer) and returns its raw bytes verbatim, up to and including the
/// `end` opcode that closes the outer implicit block (spec.md §4.3). The
/// block-resolver pass walks these bytes again later to build the control
/// side-table; this pass only needs to know where the stream ends.
fn read_expr_bytes<Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
) -> Result<Vec<u8>, Error<Storage>> {
    decoder.with_context(context, ContextId::Expr, |decoder, _| {
        let mut bytes = Vec::new();
        let mut depth = 1u32;

        let mut read_byte = |decoder: &mut Decoder<Storage>,
                              bytes: &mut Vec<u8>|
         -> Result<u8, Error<Storage>> {
            let b = decoder.read_byte_raw()?;
            bytes.push(b);
            Ok(b)
        };
        // Reads a LEB128 u32, recording every consumed byte into `bytes` and
        // returning the decoded value (needed for br_table's label count).
        let mut read_leb_u32 = |decoder: &mut Decoder<Storage>,
                                 bytes: &mut Vec<u8>|
         -> Result<u32, Error<Storage>> {
            let mut result: u32 = 0;
            let mut shift = 0;
            loop {
                let b = read_byte(decoder, bytes)?;
                result |= u32::from(b & 0x7f) << shift;
                shift += 7;
                if b & 0x80 == 0 {
                    break;
                }
            }
            Ok(result)
        };

        loop {
            let op = read_byte(decoder, &mut bytes)?;
            match op {
                0x02 | 0x03 | 0x04 => {
                    // block/loop/if: one blocktype byte.
                    read_byte(decoder, &mut bytes)?;
                    depth += 1;
                }
                0x05 => {
                    // else: no immediate, no depth change.
                }
                0x0b => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                0x0c | 0x0d | 0x10 => {
                    // br/br_if/call: one LEB index.
                    read_leb_u32(decoder, &mut bytes)?;
                }
                0x0e => {
                    // br_table: vec(labelidx) + default labelidx.
                    let count = read_leb_u32(decoder, &mut bytes)?;
                    for _ in 0..count {
                        read_leb_u32(decoder, &mut bytes)?;
                    }
                    read_leb_u32(decoder, &mut bytes)?;
                }
                0x11 => {
                    // call_indirect: typeidx, reserved tableidx.
                    read_leb_u32(decoder, &mut bytes)?;
                    read_leb_u32(decoder, &mut bytes)?;
                }
                0x20..=0x24 => {
                    // local.get/set/tee, global.get/set: one LEB index.
                    read_leb_u32(decoder, &mut bytes)?;
                }
                0x28..=0x3e => {
                    // loads/stores: align, offset.
                    read_leb_u32(decoder, &mut bytes)?;
                    read_leb_u32(decoder, &mut bytes)?;
                }
                0x3f | 0x40 => {
                    // memory.size/memory.grow: reserved byte.
                    read_leb_u32(decoder, &mut bytes)?;
                }
                0x41 | 0x42 => {
                    // i32.const/i64.const: signed LEB (same bit layout as
                    // unsigned for our purposes; we only need to skip it).
                    read_leb_u32(decoder, &mut bytes)?;
                }
                0x43 => {
                    for _ in 0..4 {
                        read_byte(decoder, &mut bytes)?;
                    }
                }
                0x44 => {
                    for _ in 0..8 {
                        read_byte(decoder, &mut bytes)?;
                    }
                }
                0xfc => {
                    read_leb_u32(decoder, &mut bytes)?;
                }
                _ => {}
            }
        }
        Ok(bytes)
    })
}

impl Contextual for FunctionBody {
    const ID: ContextId = ContextId::Func;
}
impl Decodable for FunctionBody {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let expected_size: u32 = decoder.read(context)?;
        let offset_start = decoder.offset();

        let groups: Vec<LocalGroup> = decoder.read(context)?;
        let mut local_kinds = Vec::new();
        for group in groups {
            let subtotal = local_kinds.len() + group.count as usize;
            if subtotal > MAX_LOCALS_PER_FUNCTION {
                return Err(Error::TooManyLocals(subtotal));
            }
            local_kinds.resize(subtotal, group.kind);
        }

        let code = read_expr_bytes(decoder, context)?;

        let actual_size = decoder.offset() - offset_start;
        if actual_size != expected_size as usize {
            return Err(Error::InvalidFunctionLength {
                expected: expected_size,
                actual: actual_size as u32,
            });
        }
        Ok(FunctionBody { local_kinds, code })
    }
}

impl Contextual for GlobalDecl {
    const ID: ContextId = ContextId::Global;
}
impl Decodable for GlobalDecl {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let ty: GlobalType = decoder.read(context)?;
        let init_expr = read_expr_bytes(decoder, context)?;
        Ok(GlobalDecl { ty, init_expr })
    }
}

impl Contextual for ElementSegment {
    const ID: ContextId = ContextId::Elem;
}
impl Decodable for ElementSegment {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let table: TableIdx = decoder.read(context)?;
        let offset_expr = read_expr_bytes(decoder, context)?;
        let func_indices: Vec<FuncIdx> = decoder.read(context)?;
        Ok(ElementSegment {
            table,
            offset_expr,
            func_indices,
        })
    }
}

impl Contextual for DataSegment {
    const ID: ContextId = ContextId::Data;
}
impl Decodable for DataSegment {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let memory: MemIdx = decoder.read(context)?;
        let offset_expr = read_expr_bytes(decoder, context)?;
        let bytes: Vec<u8> = decoder.read(context)?;
        Ok(DataSegment {
            memory,
            offset_expr,
            bytes,
        })
    }
}

impl Contextual for u8 {
    const ID: ContextId = ContextId::Byte;
}
impl Decodable for u8 {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        decoder.read_byte_raw()
    }
}

/// Dispatches to the correct section decoder and folds the result into
/// `module`. Lengths/ordering are checked by the caller.
pub(super) fn decode_section<Storage: Stream>(
    decoder: &mut Decoder<Storage>,
    context: &mut ContextStack,
    id: SectionId,
    len: u32,
    module: &mut Module,
) -> Result<(), Error<Storage>> {
    match id {
        SectionId::Custom => {
            decoder.with_context(context, ContextId::CustomSec, |decoder, context| {
                let name_start = decoder.offset();
                let _name = name(decoder, context)?;
                let consumed = decoder.offset() - name_start;
                let remaining = (len as usize).saturating_sub(consumed);
                decoder.skip_bytes_raw(remaining)
            })?;
        }
        SectionId::Type => module.types = decoder.read(context)?,
        SectionId::Import => module.imports = decoder.read(context)?,
        SectionId::Function => module.func_types = decoder.read(context)?,
        SectionId::Table => module.tables = decoder.read(context)?,
        SectionId::Memory => module.memories = decoder.read(context)?,
        SectionId::Global => module.globals = decoder.read(context)?,
        SectionId::Export => module.exports = decoder.read(context)?,
        SectionId::Start => module.start = Some(decoder.read(context)?),
        SectionId::Element => module.elements = decoder.read(context)?,
        SectionId::Code => module.code = decoder.read(context)?,
        SectionId::Data => module.data = decoder.read(context)?,
    }
    Ok(())
}
