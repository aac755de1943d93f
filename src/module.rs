//! The decoded, not-yet-instantiated form of a WebAssembly module
//! (spec.md §3).

use crate::types::{
    DataSegment, ElementSegment, Export, FuncIdx, FuncType, FunctionBody, GlobalDecl, Import,
    MemType, TableType, TypeIdx,
};

/// A module as produced by [`crate::decode::decode_module`]: every section's
/// contents, with custom sections discarded and no host resolution or
/// control-flow analysis performed yet. [`crate::engine::Instance`]
/// consumes this to build a runnable instance.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub types: Vec<FuncType>,
    pub imports: Vec<Import>,
    /// Type index for each function declared in the function section, i.e.
    /// the non-imported functions, in order.
    pub func_types: Vec<TypeIdx>,
    pub tables: Vec<TableType>,
    pub memories: Vec<MemType>,
    pub globals: Vec<GlobalDecl>,
    pub exports: Vec<Export>,
    pub start: Option<FuncIdx>,
    pub elements: Vec<ElementSegment>,
    pub code: Vec<FunctionBody>,
    pub data: Vec<DataSegment>,
}
