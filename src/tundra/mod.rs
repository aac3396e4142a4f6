//! Tundra code generation backend.
//!
//! This module contains the lowering pass from the typed AST to Tundra
//! source text.

pub mod lowering;

pub use lowering::{lower, Scope, TundraBackend, TundraOutput};
