//! Error taxonomy shared by every layer of the HAL.
//!
//! Handlers convert their failures into a [`HalError`], which travels back to
//! the framework inside an API result. The framework side only ever sees the
//! coarse [`Status`] code derived from it.

use thiserror::Error;

/// Convenience alias for results using the HAL error type.
pub type HalResult<T> = std::result::Result<T, HalError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Index {index} out of range [0, {len})")]
    OutOfRange { index: usize, len: usize },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Bad value: {0}")]
    BadValue(String),

    #[error("Out of memory: {0}")]
    NoMemory(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker has shut down")]
    Shutdown,
}

/// Framework-facing status code carried by every API result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    BadIndex,
    InvalidOperation,
    BadValue,
    NoMemory,
    UnknownError,
    NameNotFound,
    DeadObject,
}

impl HalError {
    pub fn status(&self) -> Status {
        match self {
            HalError::InvalidArgument(_) | HalError::BadValue(_) | HalError::Config(_) => {
                Status::BadValue
            }
            HalError::OutOfRange { .. } => Status::BadIndex,
            HalError::InvalidOperation(_) => Status::InvalidOperation,
            HalError::NoMemory(_) => Status::NoMemory,
            HalError::Transport(_) => Status::UnknownError,
            HalError::NotFound(_) => Status::NameNotFound,
            HalError::Shutdown => Status::DeadObject,
        }
    }

    pub(crate) fn invalid_in_state(op: impl std::fmt::Debug, state: impl std::fmt::Debug) -> Self {
        HalError::InvalidOperation(format!("cannot handle {op:?} in state {state:?}"))
    }
}

impl From<config::ConfigError> for HalError {
    fn from(e: config::ConfigError) -> Self {
        HalError::Config(e.to_string())
    }
}

impl From<std::io::Error> for HalError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::OutOfMemory => HalError::NoMemory(e.to_string()),
            _ => HalError::Transport(e.to_string()),
        }
    }
}

/// Status view of a result, `Ok` on success.
pub fn status_of<T>(result: &HalResult<T>) -> Status {
    match result {
        Ok(_) => Status::Ok,
        Err(e) => e.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_maps_to_invalid_operation() {
        let err = HalError::invalid_in_state("TakePicture", "PreviewStopped");
        assert_eq!(err.status(), Status::InvalidOperation);
        assert!(err.to_string().contains("TakePicture"));
    }

    #[test]
    fn out_of_range_maps_to_bad_index() {
        let err = HalError::OutOfRange { index: 7, len: 4 };
        assert_eq!(err.status(), Status::BadIndex);
        assert_eq!(status_of::<()>(&Err(err)), Status::BadIndex);
        assert_eq!(status_of(&Ok(3)), Status::Ok);
    }
}
