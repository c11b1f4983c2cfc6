//! blockforge: compiler backend core
//!
//! Turns a sea-of-nodes method graph into laid-out LIR for ARM32 or AArch64.

pub mod cfg;
pub mod compiler;
pub mod config;
pub mod encoding;
pub mod error;
pub mod ir;
pub mod lir;
pub mod lirgen;
pub mod operand;
pub mod target;

pub use compiler::{CompileContext, CompiledMethod, Compiler};
pub use config::{BarrierConfig, CompileOptions};
pub use error::{CodegenError, CompileBudget, Result};
pub use ir::{Graph, GraphBuilder};
pub use target::{TargetDescriptor, TargetFamily};
