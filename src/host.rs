//! The host embedding interface (spec.md §4.6): how an instance's imports
//! get resolved against whatever environment is running it.

use std::rc::Rc;

use crate::engine::Trap;
use crate::types::{FuncType, GlobalType, MemType, TableType};
use crate::value::Value;

/// A host-provided function binding: takes the arguments a `call`/
/// `call_indirect` already validated against the import's declared type
/// and returns either results or a trap.
pub type HostFunc = Rc<dyn Fn(&[Value]) -> Result<Vec<Value>, Trap>>;

/// The environment an instance is instantiated against. Every import in a
/// module must resolve against exactly one of these four methods; failure
/// to resolve is fatal at instantiation (spec.md §4.6), not a deferred
/// trap.
pub trait Host {
    /// Resolves a function import. `ty` is the signature declared by the
    /// importing module; a host that finds a name match but a
    /// shape-mismatched signature should still return `None`.
    fn resolve_func(&self, module: &str, field: &str, ty: &FuncType) -> Option<HostFunc>;

    /// Resolves a table import, returning its initial contents.
    fn resolve_table(&self, module: &str, field: &str, ty: TableType) -> Option<Vec<Option<crate::types::FuncIdx>>>;

    /// Resolves a memory import, returning its initial byte contents
    /// (already sized to `ty.limits.min` pages).
    fn resolve_memory(&self, module: &str, field: &str, ty: MemType) -> Option<Vec<u8>>;

    /// Resolves a global import, returning its initial value.
    fn resolve_global(&self, module: &str, field: &str, ty: GlobalType) -> Option<Value>;
}

/// A host with no bindings: any module that imports anything fails to
/// instantiate against it. Useful for standalone modules and for the CLI's
/// default run mode, where nothing is imported.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyHost;

impl Host for EmptyHost {
    fn resolve_func(&self, _module: &str, _field: &str, _ty: &FuncType) -> Option<HostFunc> {
        None
    }

    fn resolve_table(
        &self,
        _module: &str,
        _field: &str,
        _ty: TableType,
    ) -> Option<Vec<Option<crate::types::FuncIdx>>> {
        None
    }

    fn resolve_memory(&self, _module: &str, _field: &str, _ty: MemType) -> Option<Vec<u8>> {
        None
    }

    fn resolve_global(&self, _module: &str, _field: &str, _ty: GlobalType) -> Option<Value> {
        None
    }
}
