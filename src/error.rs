use thiserror::Error;

/// The one failure mode of code generation: the AST reached a shape,
/// operator, or type combination the generator does not translate. There is
/// no recovery path; callers propagate this out and abandon the unit.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("unsupported construct: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, CodegenError>;

#[macro_export]
macro_rules! bail_unsupported {
    ($($arg:tt)*) => {
        return Err($crate::error::CodegenError::Unsupported(format!($($arg)*)))
    };
}
