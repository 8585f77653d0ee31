//! Error types for loess.

use thiserror::Error;

/// Result type alias using LoessError.
pub type Result<T> = std::result::Result<T, LoessError>;

/// Errors that can occur in loess operations.
#[derive(Debug, Error)]
pub enum LoessError {
    /// Surfaced from the block device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialized node or tree failed validation.
    #[error("corrupt node: {reason}")]
    CorruptNode { reason: String },

    /// An entry would not fit even in an empty node.
    #[error("entry too large: {key} byte key, {value} byte value")]
    TooLarge { key: usize, value: usize },

    /// A cache, lease, or configuration contract was broken by the caller.
    #[error("contract violation: {0}")]
    ContractViolation(String),
}

impl LoessError {
    /// Builds a CorruptNode error from any displayable reason.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        LoessError::CorruptNode {
            reason: reason.into(),
        }
    }

    /// Builds a ContractViolation error from any displayable message.
    pub fn contract(msg: impl Into<String>) -> Self {
        LoessError::ContractViolation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "block device gone");
        let err: LoessError = io_err.into();
        assert!(matches!(err, LoessError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_corrupt_node_display() {
        let err = LoessError::corrupt("root id out of range");
        assert_eq!(err.to_string(), "corrupt node: root id out of range");
    }

    #[test]
    fn test_too_large_display() {
        let err = LoessError::TooLarge {
            key: 40000,
            value: 12,
        };
        assert_eq!(
            err.to_string(),
            "entry too large: 40000 byte key, 12 byte value"
        );
    }

    #[test]
    fn test_contract_violation_display() {
        let err = LoessError::contract("no node for block 7");
        assert_eq!(err.to_string(), "contract violation: no node for block 7");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(LoessError::contract("test"))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LoessError>();
    }
}
