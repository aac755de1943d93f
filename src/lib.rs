//! A standalone interpreter for WebAssembly 1.0: the MVP opcode set plus
//! the sign-extension operators and the non-trapping float-to-int
//! saturating conversions.
//!
//! [`decode::decode_module`] parses a binary module into a [`module::Module`];
//! [`engine::Instance::instantiate`] resolves its imports against a
//! [`host::Host`] and applies its element/data segments; [`engine::Instance::call`]
//! runs an exported function to completion, a [`engine::Trap`], or a result.

pub mod block_resolver;
pub mod decode;
pub mod engine;
pub mod host;
pub mod module;
pub mod storage;
pub mod types;
pub mod value;
