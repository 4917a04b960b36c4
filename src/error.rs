//! Error types shared by every fragdb module.

use thiserror::Error;

/// Result alias for fragdb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the vector codecs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid data length: {0} is not divisible by 8")]
    InvalidLength(usize),
    #[error("input is not a JSON array")]
    NotAnArray,
    #[error("invalid character {found:?} at offset {offset}")]
    InvalidCharacter { found: char, offset: usize },
    #[error("malformed number at offset {offset}")]
    InvalidNumber { offset: usize },
    #[error("number out of range at offset {offset}")]
    OutOfRange { offset: usize },
    #[error("expected a blob or text vector, got {0}")]
    UnsupportedType(&'static str),
    #[error("stored vector does not match the one written")]
    RoundTrip,
}

/// Failures raised while evaluating `vec_dist`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DistanceError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("expected equal length vectors, got {left} and {right}")]
    LengthMismatch { left: usize, right: usize },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("expected equal length vectors, got {left} and {right}")]
    LengthMismatch { left: usize, right: usize },

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("no client registered for provider '{0}'")]
    NotFound(String),

    #[error("no model was provided: {0}")]
    NoModel(String),

    #[error("invalid model name '{0}', expected provider/model")]
    InvalidModel(String),

    #[error("invalid limit '{0}', expected LABEL:N or N")]
    InvalidLimit(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DistanceError> for Error {
    fn from(err: DistanceError) -> Self {
        match err {
            DistanceError::Codec(codec) => Error::Codec(codec),
            DistanceError::LengthMismatch { left, right } => Error::LengthMismatch { left, right },
        }
    }
}

#[cfg(test)]
mod error_test {
    use super::*;

    #[test]
    fn test_distance_error_keeps_its_kind() {
        let err = Error::from(DistanceError::LengthMismatch { left: 2, right: 3 });
        assert!(matches!(err, Error::LengthMismatch { left: 2, right: 3 }));

        let err = Error::from(DistanceError::Codec(CodecError::InvalidLength(7)));
        assert!(matches!(err, Error::Codec(CodecError::InvalidLength(7))));
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            CodecError::InvalidLength(3).to_string(),
            "invalid data length: 3 is not divisible by 8"
        );
        assert_eq!(
            DistanceError::LengthMismatch { left: 2, right: 3 }.to_string(),
            "expected equal length vectors, got 2 and 3"
        );
        assert_eq!(
            DistanceError::Codec(CodecError::NotAnArray).to_string(),
            "input is not a JSON array"
        );
    }
}
