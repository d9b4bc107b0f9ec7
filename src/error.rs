//! Error types for lodestone.

use thiserror::Error;

use crate::script::ExecutionFault;

/// Common error type for lodestone.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Validation error for operator or script input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Lua API error outside guest code (table creation, registry access).
    #[error("script error: {0}")]
    Script(String),

    /// Guest code failed: syntax, runtime error or instruction limit.
    #[error(transparent)]
    Fault(#[from] ExecutionFault),

    /// Operation attempted on a closed context or a shut down manager.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),
}

impl From<mlua::Error> for SandboxError {
    fn from(e: mlua::Error) -> Self {
        SandboxError::Script(e.to_string())
    }
}

/// Result type alias for lodestone operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_display() {
        let err = SandboxError::InvalidState("context is closed".to_string());
        assert_eq!(err.to_string(), "invalid state: context is closed");
    }

    #[test]
    fn test_not_found_display() {
        let err = SandboxError::NotFound("script 'main.lua'".to_string());
        assert_eq!(err.to_string(), "script 'main.lua' not found");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SandboxError = io_err.into();
        assert!(matches!(err, SandboxError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_lua_error_conversion() {
        let lua_err = mlua::Error::RuntimeError("boom".to_string());
        let err: SandboxError = lua_err.into();
        assert!(matches!(err, SandboxError::Script(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_fault_conversion() {
        let fault = ExecutionFault::cancelled();
        let err: SandboxError = fault.into();
        assert!(matches!(err, SandboxError::Fault(_)));
        assert!(err.to_string().contains("instruction limit"));
    }

    #[test]
    fn test_result_alias() {
        fn sample_ok() -> Result<i32> {
            Ok(42)
        }

        fn sample_err() -> Result<i32> {
            Err(SandboxError::NotFound("utils.lua".to_string()))
        }

        assert_eq!(sample_ok().unwrap(), 42);
        assert!(sample_err().is_err());
    }
}
