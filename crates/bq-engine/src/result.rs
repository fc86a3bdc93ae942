//! Native engine result codes and their diagnostic strings.

use thiserror::Error;

/// Failure code reported by a native engine.
///
/// Codes are only used for diagnostics; the stream layer collapses all of
/// them into its own error kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum EngineError {
    #[error("RESULT_PRECONDITIONS_VIOLATED")]
    PreconditionsViolated = 1,
    #[error("RESULT_PARAMETER_INVALID")]
    ParameterInvalid = 2,
    #[error("RESULT_MEMORY_FAILURE")]
    MemoryFailure = 3,
    #[error("RESULT_RESOURCE_ERROR")]
    ResourceError = 4,
    #[error("RESULT_RESOURCE_LOST")]
    ResourceLost = 5,
    #[error("RESULT_IO_ERROR")]
    IoError = 6,
    #[error("RESULT_BUFFER_INSUFFICIENT")]
    BufferInsufficient = 7,
    #[error("RESULT_CONTENT_CORRUPTED")]
    ContentCorrupted = 8,
    #[error("RESULT_CONTENT_UNSUPPORTED")]
    ContentUnsupported = 9,
    #[error("RESULT_CONTENT_NOT_FOUND")]
    ContentNotFound = 10,
    #[error("RESULT_PERMISSION_DENIED")]
    PermissionDenied = 11,
    #[error("RESULT_FEATURE_UNSUPPORTED")]
    FeatureUnsupported = 12,
    #[error("RESULT_INTERNAL_ERROR")]
    InternalError = 13,
    #[error("RESULT_UNKNOWN_ERROR")]
    UnknownError = 14,
    #[error("RESULT_OPERATION_ABORTED")]
    OperationAborted = 15,
    #[error("RESULT_CONTROL_LOST")]
    ControlLost = 16,
}

const SUCCESS_STR: &str = "RESULT_SUCCESS";
const UNKNOWN_STR: &str = "Unknown engine error";

impl EngineError {
    /// Numeric result code.
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        use EngineError::*;
        Some(match code {
            1 => PreconditionsViolated,
            2 => ParameterInvalid,
            3 => MemoryFailure,
            4 => ResourceError,
            5 => ResourceLost,
            6 => IoError,
            7 => BufferInsufficient,
            8 => ContentCorrupted,
            9 => ContentUnsupported,
            10 => ContentNotFound,
            11 => PermissionDenied,
            12 => FeatureUnsupported,
            13 => InternalError,
            14 => UnknownError,
            15 => OperationAborted,
            16 => ControlLost,
            _ => return None,
        })
    }

    /// Diagnostic name of the code.
    pub const fn as_str(self) -> &'static str {
        use EngineError::*;
        match self {
            PreconditionsViolated => "RESULT_PRECONDITIONS_VIOLATED",
            ParameterInvalid => "RESULT_PARAMETER_INVALID",
            MemoryFailure => "RESULT_MEMORY_FAILURE",
            ResourceError => "RESULT_RESOURCE_ERROR",
            ResourceLost => "RESULT_RESOURCE_LOST",
            IoError => "RESULT_IO_ERROR",
            BufferInsufficient => "RESULT_BUFFER_INSUFFICIENT",
            ContentCorrupted => "RESULT_CONTENT_CORRUPTED",
            ContentUnsupported => "RESULT_CONTENT_UNSUPPORTED",
            ContentNotFound => "RESULT_CONTENT_NOT_FOUND",
            PermissionDenied => "RESULT_PERMISSION_DENIED",
            FeatureUnsupported => "RESULT_FEATURE_UNSUPPORTED",
            InternalError => "RESULT_INTERNAL_ERROR",
            UnknownError => "RESULT_UNKNOWN_ERROR",
            OperationAborted => "RESULT_OPERATION_ABORTED",
            ControlLost => "RESULT_CONTROL_LOST",
        }
    }
}

/// Diagnostic string for a raw result code, including success (0).
pub fn result_code_str(code: u32) -> &'static str {
    if code == 0 {
        return SUCCESS_STR;
    }
    EngineError::from_code(code).map_or(UNKNOWN_STR, EngineError::as_str)
}
