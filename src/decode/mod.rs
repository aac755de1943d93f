//! WebAssembly binary format parsing (spec.md §4).

mod leb128;
mod sections;

use std::fmt;

use num_enum::TryFromPrimitive;
use tracing::debug;

use leb128::Leb128;

use crate::module::Module;
use crate::storage::Stream;
use crate::types::{SectionId, Version};

// The maximum parsing depth, bounding the context stack used for error
// reporting. WASM modules don't nest deeply enough for this to ever bind in
// practice; it exists to give decode errors a bounded-size trace.
const MAX_DEPTH: usize = 6;

#[derive(Clone, Copy, Debug, TryFromPrimitive)]
#[repr(u32)]
enum Magic {
    Value = 0x6d_73_61_00, // '\0asm'
}

/// Labels for the parsing-context stack attached to decode errors.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum ContextId {
    #[default]
    Invalid,
    Byte,
    BlockType,
    BrTableOperands,
    BulkOpcode,
    CodeSec,
    CustomSec,
    Data,
    DataIdx,
    DataSec,
    Elem,
    ElemIdx,
    ElemKind,
    ElemSec,
    Export,
    ExportDesc,
    ExportSec,
    Expr,
    F32,
    F64,
    Func,
    FuncIdx,
    FuncType,
    FuncSec,
    Global,
    GlobalIdx,
    GlobalSec,
    GlobalType,
    I32,
    I64,
    Import,
    ImportDesc,
    ImportSec,
    LabelIdx,
    Limits,
    LocalIdx,
    Locals,
    Magic,
    MemArg,
    MemIdx,
    MemType,
    MemorySec,
    Mut,
    Name,
    Opcode,
    ReadingBytes,
    SectionId,
    SkippingBytes,
    StartSec,
    TableIdx,
    TableSec,
    TableType,
    TypeIdx,
    TypeSec,
    U32,
    ValType,
    Vec,
    Version,
}

impl From<ContextId> for &'static str {
    fn from(id: ContextId) -> Self {
        match id {
            ContextId::Invalid => unreachable!("invalid context somehow reached!?"),
            ContextId::Byte => "byte",
            ContextId::BlockType => "blocktype",
            ContextId::BrTableOperands => "br_table operands",
            ContextId::BulkOpcode => "bulk opcode",
            ContextId::CodeSec => "codesec",
            ContextId::CustomSec => "customsec",
            ContextId::Data => "data",
            ContextId::DataIdx => "dataidx",
            ContextId::DataSec => "datasec",
            ContextId::Elem => "elem",
            ContextId::ElemIdx => "elemidx",
            ContextId::ElemKind => "elemkind",
            ContextId::ElemSec => "elemsec",
            ContextId::Export => "export",
            ContextId::ExportDesc => "exportdesc",
            ContextId::ExportSec => "exportsec",
            ContextId::Expr => "expr",
            ContextId::F32 => "f32",
            ContextId::F64 => "f64",
            ContextId::Func => "func",
            ContextId::FuncIdx => "funcidx",
            ContextId::FuncType => "functype",
            ContextId::FuncSec => "funcsec",
            ContextId::Global => "global",
            ContextId::GlobalIdx => "globalidx",
            ContextId::GlobalSec => "globalsec",
            ContextId::GlobalType => "globaltype",
            ContextId::I32 => "i32",
            ContextId::I64 => "i64",
            ContextId::Import => "import",
            ContextId::ImportDesc => "importdesc",
            ContextId::ImportSec => "importsec",
            ContextId::LabelIdx => "labelidx",
            ContextId::Limits => "limits",
            ContextId::LocalIdx => "localidx",
            ContextId::Locals => "locals",
            ContextId::Magic => "magic",
            ContextId::MemArg => "memarg",
            ContextId::MemIdx => "memidx",
            ContextId::MemType => "memtype",
            ContextId::MemorySec => "memsec",
            ContextId::Mut => "mut",
            ContextId::Name => "name",
            ContextId::Opcode => "opcode",
            ContextId::ReadingBytes => "reading bytes",
            ContextId::SectionId => "section ID",
            ContextId::SkippingBytes => "skipping bytes",
            ContextId::StartSec => "startsec",
            ContextId::TableIdx => "tableidx",
            ContextId::TableSec => "tablesec",
            ContextId::TableType => "tabletype",
            ContextId::TypeIdx => "typeidx",
            ContextId::TypeSec => "typesec",
            ContextId::U32 => "u32",
            ContextId::ValType => "valtype",
            ContextId::Vec => "vec",
            ContextId::Version => "version",
        }
    }
}

trait Contextual {
    const ID: ContextId;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ContextFrame {
    context: &'static str,
    offset: usize,
}

/// Stack of "what's being parsed" frames, attached to decode errors so a
/// failure can be reported as a nested trace rather than a bare byte offset.
#[derive(Clone, Debug, Default)]
pub struct ContextStack {
    offsets: [usize; MAX_DEPTH],
    ids: [ContextId; MAX_DEPTH],
    depth: u8,
}

impl ContextStack {
    fn push(&mut self, id: ContextId, offset: usize) -> bool {
        let depth = self.depth as usize;
        if depth >= MAX_DEPTH {
            return false;
        }
        self.offsets[depth] = offset;
        self.ids[depth] = id;
        self.depth += 1;
        true
    }

    fn pop(&mut self) {
        debug_assert!(self.depth > 0);
        self.depth -= 1;
    }

    fn iter(&self) -> impl Iterator<Item = ContextFrame> + '_ {
        self.offsets
            .iter()
            .zip(&self.ids)
            .take(self.depth as usize)
            .map(|(&offset, &id)| ContextFrame {
                context: id.into(),
                offset,
            })
    }
}

/// A decode error together with the nested parsing context in effect when it
/// was raised.
pub struct ErrorWithContext<Storage: Stream> {
    pub error: Error<Storage>,
    context: ContextStack,
}

impl<Storage: Stream> fmt::Debug for ErrorWithContext<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.error)?;
        for (i, frame) in self.context.iter().enumerate() {
            write!(f, "\n{:#x}: ", frame.offset)?;
            for _ in 0..i {
                write!(f, "  ")?;
            }
            write!(f, "{}", frame.context)?;
        }
        Ok(())
    }
}

impl<Storage: Stream> fmt::Display for ErrorWithContext<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

/// Decode-time failures (spec.md §7's decode-time trap taxonomy, plus the
/// finer-grained section/encoding errors spec.md §4.2 calls for).
pub enum Error<Storage: Stream> {
    /// LEB128 encoding overflowed its declared bit width.
    DecodeOverflow,
    /// The 4-byte magic number wasn't `\0asm`.
    MagicMismatch(u32),
    /// The version field wasn't a version this crate understands.
    VersionMismatch(u32),
    /// A section ID byte this crate doesn't implement decoding for.
    SectionUnimplemented(u8),
    /// A given non-custom section appears more than once.
    DuplicateSection(SectionId),
    /// Non-custom sections appear out of their required order.
    OutOfOrderSection { before: SectionId, after: SectionId },
    /// A section's declared byte length didn't match what was consumed.
    InvalidSectionLength {
        id: SectionId,
        expected: u32,
        actual: u32,
    },
    /// A function body's declared byte length didn't match what was consumed.
    InvalidFunctionLength { expected: u32, actual: u32 },
    /// An opcode byte that isn't part of the supported instruction set.
    InvalidOpcode(u8),
    /// A bulk (`0xfc`-prefixed) sub-opcode outside the saturating-truncation
    /// family this crate supports.
    InvalidBulkOpcode(u32),
    /// A byte token expected to take one of a small set of values didn't.
    InvalidToken(u8),
    /// A value-type byte isn't one of `i32`/`i64`/`f32`/`f64`.
    InvalidValType(u8),
    /// A function declares more locals than this crate's static limit.
    TooManyLocals(usize),
    /// Context stack exceeded its maximum nesting depth.
    ExcessiveParsingDepth {
        context: &'static str,
        offset: usize,
    },
    /// Error surfaced by the underlying byte stream.
    Storage(Storage::Error),
}

impl<Storage: Stream> Clone for Error<Storage>
where
    Storage::Error: Clone,
{
    fn clone(&self) -> Self {
        match self {
            Error::DecodeOverflow => Error::DecodeOverflow,
            Error::MagicMismatch(m) => Error::MagicMismatch(*m),
            Error::VersionMismatch(v) => Error::VersionMismatch(*v),
            Error::SectionUnimplemented(id) => Error::SectionUnimplemented(*id),
            Error::DuplicateSection(id) => Error::DuplicateSection(*id),
            Error::OutOfOrderSection { before, after } => Error::OutOfOrderSection {
                before: *before,
                after: *after,
            },
            Error::InvalidSectionLength {
                id,
                expected,
                actual,
            } => Error::InvalidSectionLength {
                id: *id,
                expected: *expected,
                actual: *actual,
            },
            Error::InvalidFunctionLength { expected, actual } => Error::InvalidFunctionLength {
                expected: *expected,
                actual: *actual,
            },
            Error::InvalidOpcode(op) => Error::InvalidOpcode(*op),
            Error::InvalidBulkOpcode(op) => Error::InvalidBulkOpcode(*op),
            Error::InvalidToken(b) => Error::InvalidToken(*b),
            Error::InvalidValType(b) => Error::InvalidValType(*b),
            Error::TooManyLocals(n) => Error::TooManyLocals(*n),
            Error::ExcessiveParsingDepth { context, offset } => Error::ExcessiveParsingDepth {
                context,
                offset: *offset,
            },
            Error::Storage(e) => Error::Storage(e.clone()),
        }
    }
}

impl<Storage: Stream> fmt::Debug for Error<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl<Storage: Stream> fmt::Display for Error<Storage> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DecodeOverflow => write!(f, "LEB128 value overflowed its declared width"),
            Error::MagicMismatch(m) => write!(f, "invalid magic ({m:#x})"),
            Error::VersionMismatch(v) => write!(f, "unsupported version ({v:#x})"),
            Error::SectionUnimplemented(id) => write!(f, "unimplemented section id ({id:#x})"),
            Error::DuplicateSection(id) => write!(f, "duplicate of section ({id:?})"),
            Error::OutOfOrderSection { before, after } => {
                write!(f, "out-of-order sections: {after:?} after {before:?}")
            }
            Error::InvalidSectionLength {
                id,
                expected,
                actual,
            } => write!(
                f,
                "invalid section length for {id:?}: expected {expected:#x}; got {actual:#x}"
            ),
            Error::InvalidFunctionLength { expected, actual } => write!(
                f,
                "invalid func length: expected {expected:#x}; got {actual:#x}"
            ),
            Error::InvalidOpcode(op) => write!(f, "invalid opcode ({op:#x})"),
            Error::InvalidBulkOpcode(op) => write!(f, "invalid bulk opcode ({op:#x})"),
            Error::InvalidToken(b) => write!(f, "invalid byte token ({b:#x})"),
            Error::InvalidValType(b) => write!(f, "invalid valtype ({b:#x})"),
            Error::TooManyLocals(n) => write!(f, "too many locals: at least {n} were specified"),
            Error::ExcessiveParsingDepth { context, offset } => {
                write!(f, "unexpected frame at {offset:#x}: {context}")
            }
            Error::Storage(e) => write!(f, "{e:?}"),
        }
    }
}

impl<Storage: Stream> leb128::Error for Error<Storage> {
    fn invalid_leb128() -> Self {
        Error::DecodeOverflow
    }
}

/// Decoder state: the underlying byte stream plus the cursor operations every
/// section/instruction decoder is built from.
pub(crate) struct Decoder<Storage: Stream> {
    stream: Storage,
}

impl<Storage: Stream> Decoder<Storage> {
    fn new(stream: Storage) -> Self {
        Self { stream }
    }

    fn with_context<F, R>(
        &mut self,
        context: &mut ContextStack,
        id: ContextId,
        f: F,
    ) -> Result<R, Error<Storage>>
    where
        F: FnOnce(&mut Self, &mut ContextStack) -> Result<R, Error<Storage>>,
    {
        let offset = self.stream.offset();
        if !context.push(id, offset) {
            return Err(Error::ExcessiveParsingDepth {
                context: id.into(),
                offset,
            });
        }
        let val = f(self, context)?;
        context.pop();
        Ok(val)
    }

    pub(crate) fn offset(&mut self) -> usize {
        self.stream.offset()
    }

    fn read_byte_raw(&mut self) -> Result<u8, Error<Storage>> {
        self.stream.read_byte().map_err(Error::Storage)
    }

    fn read_leb128_raw<T: Leb128>(&mut self) -> Result<T, Error<Storage>> {
        leb128::read(|| self.read_byte_raw())
    }

    fn read_exact_raw(&mut self, buf: &mut [u8]) -> Result<(), Error<Storage>> {
        self.stream.read_exact(buf).map_err(Error::Storage)
    }

    fn skip_bytes_raw(&mut self, count: usize) -> Result<(), Error<Storage>> {
        self.stream.skip_bytes(count).map_err(Error::Storage)
    }

    fn read<T: Decodable>(&mut self, context: &mut ContextStack) -> Result<T, Error<Storage>> {
        self.with_context(context, T::ID, |decoder, context| {
            T::decode(decoder, context)
        })
    }
}

/// Types decodable from a byte stream given only a [`Decoder`] and a
/// [`ContextStack`].
pub(crate) trait Decodable: Sized + Contextual {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>>;
}

impl<T: Decodable> Contextual for Vec<T> {
    const ID: ContextId = ContextId::Vec;
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        context: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let len: u32 = decoder.read(context)?;
        let mut vec = Vec::with_capacity(len as usize);
        for _ in 0..len {
            vec.push(decoder.read(context)?);
        }
        Ok(vec)
    }
}

impl Contextual for u32 {
    const ID: ContextId = ContextId::U32;
}
impl Decodable for u32 {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        decoder.read_leb128_raw()
    }
}

impl Contextual for i32 {
    const ID: ContextId = ContextId::I32;
}
impl Decodable for i32 {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        decoder.read_leb128_raw()
    }
}

impl Contextual for i64 {
    const ID: ContextId = ContextId::I64;
}
impl Decodable for i64 {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        decoder.read_leb128_raw()
    }
}

impl Contextual for f32 {
    const ID: ContextId = ContextId::F32;
}
impl Decodable for f32 {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let mut buf = [0u8; 4];
        decoder.read_exact_raw(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }
}

impl Contextual for f64 {
    const ID: ContextId = ContextId::F64;
}
impl Decodable for f64 {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let mut buf = [0u8; 8];
        decoder.read_exact_raw(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }
}

impl Contextual for Magic {
    const ID: ContextId = ContextId::Magic;
}
impl Decodable for Magic {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let mut buf = [0u8; 4];
        decoder.read_exact_raw(&mut buf)?;
        let val = u32::from_le_bytes(buf);
        Self::try_from(val).map_err(|_| Error::MagicMismatch(val))
    }
}

impl Contextual for Version {
    const ID: ContextId = ContextId::Version;
}
impl Decodable for Version {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let mut buf = [0u8; 4];
        decoder.read_exact_raw(&mut buf)?;
        let val = u32::from_le_bytes(buf);
        Self::try_from(val).map_err(|_| Error::VersionMismatch(val))
    }
}

impl Contextual for SectionId {
    const ID: ContextId = ContextId::SectionId;
}
impl Decodable for SectionId {
    fn decode<Storage: Stream>(
        decoder: &mut Decoder<Storage>,
        _: &mut ContextStack,
    ) -> Result<Self, Error<Storage>> {
        let byte = decoder.read_byte_raw()?;
        Self::try_from(byte).map_err(|_| Error::SectionUnimplemented(byte))
    }
}

/// Parses a whole module from `storage` (spec.md §4.2): header, then every
/// section in id order, enforcing the "each non-custom section appears at
/// most once, in order" rule. Returns an [`ErrorWithContext`] on failure so
/// callers can report the nested parse trace.
pub fn decode_module<Storage: Stream>(storage: Storage) -> Result<Module, ErrorWithContext<Storage>> {
    let mut context = ContextStack::default();
    decode_module_inner(storage, &mut context).map_err(|error| ErrorWithContext { error, context })
}

fn decode_module_inner<Storage: Stream>(
    storage: Storage,
    context: &mut ContextStack,
) -> Result<Module, Error<Storage>> {
    let mut decoder = Decoder::new(storage);
    decoder.read::<Magic>(context)?;
    let version: Version = decoder.read(context)?;
    debug!(?version, "decoded module header");

    let mut module = Module::default();
    let mut last_id = None;
    loop {
        let id: Result<SectionId, _> = decoder.read(context);
        if let Err(Error::Storage(ref err)) = id {
            if Storage::is_eof(err) {
                break;
            }
        }
        let id = id?;

        if id != SectionId::Custom {
            if let Some(last_id) = last_id {
                if id == last_id {
                    return Err(Error::DuplicateSection(id));
                }
                if id < last_id {
                    return Err(Error::OutOfOrderSection {
                        before: last_id,
                        after: id,
                    });
                }
            }
            last_id = Some(id);
        }

        let len: u32 = decoder.read(context)?;
        let offset_start = decoder.offset();
        sections::decode_section(&mut decoder, context, id, len, &mut module)?;
        let actual = decoder.offset() - offset_start;
        if actual != len as usize {
            return Err(Error::InvalidSectionLength {
                id,
                expected: len,
                actual: actual as u32,
            });
        }
    }

    debug!(
        functions = module.code.len(),
        exports = module.exports.len(),
        "decoded module body"
    );
    Ok(module)
}
