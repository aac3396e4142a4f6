//! Canonical Tundra type names and overload mangling.
//!
//! The mangle is a pure function of the descriptor (plus an externally
//! resolved length for unsized arrays). Numerically distinguishable
//! descriptors must never collapse to one name: mangled names double as
//! overload suffixes, so a collision would merge two distinct functions.

use crate::bail_unsupported;
use crate::error::Result;
use crate::types::TypeSpec;

/// Canonical target type name for a descriptor.
///
/// `array_len` supplies a concrete element count for an unsized array type;
/// an unsized array with no supplied length falls back to the bare
/// `<elem>Array` name.
pub fn mangled_type(ts: &TypeSpec, array_len: Option<u32>) -> Result<String> {
    match ts {
        TypeSpec::Array { elem, len } => {
            let elem_name = mangled_type(elem, None)?;
            match len.or(array_len) {
                Some(n) => Ok(format!("[{}*{}]", elem_name, n)),
                None => Ok(format!("{}Array", elem_name)),
            }
        }
        TypeSpec::Closure => Ok("Closure".to_string()),
        TypeSpec::Struct(spec) => Ok(spec.name.clone()),
        TypeSpec::Triple(tag) => Ok(tag.name().to_string()),
        TypeSpec::Matrix => Ok("Matrix".to_string()),
        TypeSpec::Str => Ok("String".to_string()),
        TypeSpec::Float => Ok("f32".to_string()),
        TypeSpec::Int => Ok("i32".to_string()),
        TypeSpec::UInt => Ok("u32".to_string()),
        TypeSpec::Unit => Ok("()".to_string()),
        TypeSpec::Unknown => bail_unsupported!("unresolved type reached the code generator"),
    }
}

/// Make a mangled type name safe for use inside an identifier.
pub fn identifier_fragment(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '[' | ']' | '*' | '<' | '>' => '_',
            c => c,
        })
        .collect()
}

/// Overload suffix appended to a function's base name: one `_<type>` per
/// parameter, then `__<type>` for the return type.
///
/// Declarations and call sites must both build their suffix through this
/// function; it is the only thing keeping the two in agreement.
pub fn overload_suffix(param_types: &[String], return_type: &str) -> String {
    let mut suffix = String::new();
    for ty in param_types {
        suffix.push('_');
        suffix.push_str(&identifier_fragment(ty));
    }
    suffix.push_str("__");
    suffix.push_str(&identifier_fragment(return_type));
    suffix
}
