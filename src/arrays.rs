//! Array-size resolution.
//!
//! Unsized array types must be given a concrete element count before their
//! Tundra name can be formed or a length closure emitted at a call site.
//! The resolver handles exactly the shapes that arise from parameter and
//! local array initialization; anything else is an unimplemented case, not
//! a guess.

use crate::ast::{Arena, NodeId, NodeKind};
use crate::bail_unsupported;
use crate::error::Result;
use crate::types::TypeSpec;

/// Concrete element count of an array-typed node.
pub fn resolved_len(arena: &Arena, id: NodeId) -> Result<u32> {
    match arena.ty(id) {
        TypeSpec::Array { len: Some(n), .. } => Ok(*n),
        TypeSpec::Array { len: None, .. } => match arena.kind(id) {
            NodeKind::CompoundInitializer { elems } => Ok(elems.len() as u32),
            NodeKind::VariableRef { name, decl } => match arena.kind(*decl) {
                NodeKind::VariableDeclaration {
                    init: Some(init), ..
                } => resolved_len(arena, *init),
                NodeKind::VariableDeclaration { init: None, .. } => {
                    bail_unsupported!(
                        "array size of '{}': declaration has no initializer",
                        name
                    )
                }
                other => {
                    bail_unsupported!("array size through a reference to a {}", other.describe())
                }
            },
            other => bail_unsupported!("array size of a {}", other.describe()),
        },
        _ => bail_unsupported!("array size of a non-array value"),
    }
}
