//! HashLink bytecode codec, resolved graph and patch contract
//!
//! This crate reads a HashLink `.hl` module into a structural, index-addressed
//! [`Module`], resolves it into a cross-referenced [`Graph`] that patches can
//! edit by identity, and flattens an edited graph back into a module with
//! every pool rebuilt and deduplicated.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod debug;
pub mod encoder;
pub mod graph;
pub mod module;
pub mod opcode;
pub mod parallel;
pub mod patch;
pub mod types;
pub mod verify;

pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError, EncodeError};
pub use graph::{FunctionId, GlobalId, Graph, GraphError, Op, Reg, TypeId};
pub use module::{Module, ModuleError};
pub use opcode::{Instruction, Opcode};
pub use parallel::ExecutionStrategy;
pub use patch::{apply_patches, Patch, PatchError, PatchInfo, PatchLogger, PatchMode};
pub use types::{TypeDef, TypeKind};
pub use verify::{verify_module, VerifyError};
