//! Code-generation and linking backend for version-3 Z-machine story files.
//!
//! A front end (parser, scope resolution, intrinsic lowering) drives the
//! [`program::Program`] and [`routine::Routine`] builder APIs with symbolic
//! labels and abstract operands. Everything here turns those calls into a
//! byte-exact, fully linked story image: instructions encode in their most
//! compact legal form, forward references go through relocatable-buffer
//! fixups, and one global link pass resolves every address at the end.

pub mod buffer;
pub mod dictionary;
pub mod error;
pub mod instruction;
pub mod opcodes;
pub mod program;
pub mod routine;
pub mod text;
pub mod zobject;

pub use buffer::{FixupKind, Label, LabelAllocator, ZBuffer};
pub use error::CodeGenError;
pub use instruction::{Arg, BranchTarget, Operand, StoreTarget, Variable};
pub use program::Program;
pub use routine::Routine;
pub use zobject::{PropertyDefault, PropertyValue, ZObject};
