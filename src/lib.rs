//! Code generation core for the Sable shading language.
//!
//! This crate lowers fully type-resolved shader/function ASTs into source
//! text for Tundra, a statically typed, data-parallel target language.
//! Parsing, type checking, and symbol resolution happen upstream; this
//! crate only decides what each AST shape becomes in the target, how
//! overloads are mangled into unique names, how the ambient shading state
//! is threaded explicitly through otherwise-pure target functions, and how
//! array lengths unknown at parse time are resolved before emission.
//!
//! Constructs outside the translated subset are fatal by design: lowering
//! returns an error naming the offending shape and no partial text.

pub mod arrays;
pub mod ast;
pub mod emit;
pub mod error;
pub mod mangle;
pub mod tundra;
pub mod types;





pub use error::{CodegenError, Result};
pub use tundra::{lower, TundraBackend, TundraOutput};
