//! Error types for the inference engine.
//!
//! Every failure in the core is a programming error or an unrecoverable
//! resource failure; there is no local recovery. The CLI maps each kind to a
//! stable non-zero process exit code.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error type for all engine operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Shape/dimension mismatch, illegal argument, out-of-vocab index
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Element access past bounds
    #[error("index out of range: {0}")]
    Index(String),

    /// Allocation failure
    #[error("out of memory: {0}")]
    Memory(String),

    /// Weight-file open or read failure
    #[error("file error: {0}")]
    File(String),

    /// Malformed path or configuration string
    #[error("value error: {0}")]
    Value(String),
}

impl EngineError {
    /// Process exit code for this error kind. Zero is reserved for clean
    /// termination, so the tags start at one.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::InvalidInput(_) => 1,
            EngineError::Index(_) => 2,
            EngineError::Memory(_) => 3,
            EngineError::File(_) => 4,
            EngineError::Value(_) => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::InvalidInput("matrix rows do not match".to_string());
        assert!(err.to_string().contains("invalid input"));
        assert!(err.to_string().contains("rows do not match"));
    }

    #[test]
    fn test_error_equality() {
        let err1 = EngineError::Value("empty weights directory path".to_string());
        let err2 = EngineError::Value("empty weights directory path".to_string());
        assert_eq!(err1, err2);
    }

    #[test]
    fn test_exit_codes_are_distinct_and_nonzero() {
        let errors = [
            EngineError::InvalidInput(String::new()),
            EngineError::Index(String::new()),
            EngineError::Memory(String::new()),
            EngineError::File(String::new()),
            EngineError::Value(String::new()),
        ];
        let codes: Vec<i32> = errors.iter().map(EngineError::exit_code).collect();
        for (i, &code) in codes.iter().enumerate() {
            assert_ne!(code, 0);
            for &other in &codes[i + 1..] {
                assert_ne!(code, other);
            }
        }
    }
}
