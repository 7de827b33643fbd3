//! Soul Polyglot: a compiler and stack-based virtual machine for a hybrid
//! dialect that mixes Python-style indentation with C/C++-style braces,
//! declarations, and pointer syntax.
//!
//! The pipeline:
//!
//! ```text
//! source text -> Preprocessor -> Lexer -> Compiler -> .casm bytes -> Vm
//! ```
//!
//! The compiler is single-pass: tokens are walked left to right and
//! bytecode is emitted directly, with forward jumps patched once their
//! targets are known. The VM executes the flat byte stream with an operand
//! stack, a chain of name->value frames, a linear memory with a free-list
//! allocator, and a one-byte-id syscall layer for host services.

pub mod bytecode;
pub mod frontend;
pub mod runtime;

pub use bytecode::compiler::Compiler;
pub use bytecode::loader::Loader;
pub use frontend::lexer::Lexer;
pub use frontend::preprocessor::Preprocessor;
pub use runtime::value::Value;
pub use runtime::vm::{Vm, VmConfig};
