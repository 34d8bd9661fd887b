//! Runtime failure taxonomy.
//!
//! One failure terminates execution; there is no user-level error
//! handling in the language, so every variant surfaces to the host
//! together with the source location derived from the image's source
//! map.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("overflow")]
    Overflow,
    #[error("division by zero")]
    DivideByZero,
    #[error("subscript out of range")]
    BoundsViolation,
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("bad file number")]
    BadChannel,
    #[error("i/o error: {0}")]
    IoError(String),
    #[error("out of DATA")]
    OutOfData,
    #[error("RETURN without GOSUB")]
    ReturnWithoutGosub,
    #[error("stack overflow")]
    StackOverflow,
    #[error("interrupted")]
    Interrupted,
    #[error("feature unavailable on this host")]
    FeatureUnavailable,
    #[error("unsupported bytecode image")]
    UnsupportedImage,
}

impl RuntimeError {
    /// The stable failure name, for diagnostics and tests.
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeError::Overflow => "Overflow",
            RuntimeError::DivideByZero => "DivideByZero",
            RuntimeError::BoundsViolation => "BoundsViolation",
            RuntimeError::TypeMismatch(_) => "TypeMismatch",
            RuntimeError::BadChannel => "BadChannel",
            RuntimeError::IoError(_) => "IOError",
            RuntimeError::OutOfData => "OutOfData",
            RuntimeError::ReturnWithoutGosub => "ReturnWithoutGosub",
            RuntimeError::StackOverflow => "StackOverflow",
            RuntimeError::Interrupted => "Interrupted",
            RuntimeError::FeatureUnavailable => "FeatureUnavailable",
            RuntimeError::UnsupportedImage => "UnsupportedImage",
        }
    }
}

/// A runtime failure with the pc it occurred at; the driver resolves
/// the pc to a source span through the image's source map.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{error}")]
pub struct VmFailure {
    pub error: RuntimeError,
    pub pc: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_stable() {
        assert_eq!(RuntimeError::Overflow.name(), "Overflow");
        assert_eq!(RuntimeError::IoError(String::new()).name(), "IOError");
        assert_eq!(RuntimeError::ReturnWithoutGosub.name(), "ReturnWithoutGosub");
    }

    #[test]
    fn test_display() {
        assert_eq!(RuntimeError::DivideByZero.to_string(), "division by zero");
        let failure = VmFailure {
            error: RuntimeError::OutOfData,
            pc: 7,
        };
        assert_eq!(failure.to_string(), "out of DATA");
    }
}
