//! Error types for the framework
//!
//! Recoverable failures are values. Misuse the framework can detect is a
//! contract violation: it is logged at the point of detection and returned as
//! [`CrucibleError::ContractViolation`]. With the `assert-contracts` feature the
//! same call panics instead, which is useful while developing against the API.

use ash::vk;

use crate::config::ConfigError;

/// Framework error type
#[derive(thiserror::Error, Debug)]
pub enum CrucibleError {
    /// Error code returned verbatim by the native graphics API
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// The caller broke a documented usage rule
    #[error("Contract violation: {reason}")]
    ContractViolation {
        /// Description of the broken rule
        reason: String,
    },

    /// Host-side allocation failed while baking an object
    #[error("Out of memory while baking {what}")]
    OutOfMemory {
        /// What was being baked
        what: String,
    },

    /// A batched bake failed; every handle of the batch was rolled back
    #[error("Pipeline batch failed at batch index {failed_index}: {result:?}")]
    BatchFailed {
        /// Position of the first failing item inside the submitted batch
        failed_index: usize,
        /// Result code returned by the driver for the batch
        result: vk::Result,
    },

    /// Referenced object does not exist
    #[error("Resource not found: {what}")]
    ResourceNotFound {
        /// Description of the missing object
        what: String,
    },

    /// The device lacks a capability the request depends on
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Offscreen frame snapshot could not be written
    #[error("Snapshot failed: {0}")]
    Snapshot(String),

    /// Configuration could not be loaded or is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CrucibleError {
    /// True for [`CrucibleError::ContractViolation`]
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::ContractViolation { .. })
    }
}

impl From<vk::Result> for CrucibleError {
    fn from(result: vk::Result) -> Self {
        Self::Api(result)
    }
}

/// Result type for framework operations
pub type CrucibleResult<T> = Result<T, CrucibleError>;

/// Report a contract violation
///
/// Logs the reason and builds the error. Panics instead when the
/// `assert-contracts` feature is enabled.
#[track_caller]
pub fn contract_violation(reason: impl Into<String>) -> CrucibleError {
    let reason = reason.into();
    log::error!("Contract violation: {}", reason);

    if cfg!(feature = "assert-contracts") {
        panic!("contract violation: {reason}");
    }

    CrucibleError::ContractViolation { reason }
}

/// Return early with a contract violation unless `cond` holds
macro_rules! ensure_contract {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::core::error::contract_violation(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_contract;

/// Log a driver error and convert it
pub(crate) fn api_error(context: &str, result: vk::Result) -> CrucibleError {
    log::error!("{} failed: {:?}", context, result);
    CrucibleError::Api(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checked(value: u32) -> CrucibleResult<u32> {
        ensure_contract!(value < 10, "value {} out of range", value);
        Ok(value)
    }

    #[test]
    fn test_ensure_contract_passes_through() {
        assert_eq!(checked(3).unwrap(), 3);
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_ensure_contract_reports_violation() {
        let err = checked(12).unwrap_err();
        assert!(err.is_contract_violation());
        assert!(err.to_string().contains("value 12 out of range"));
    }

    #[test]
    fn test_api_errors_convert_verbatim() {
        let err: CrucibleError = vk::Result::ERROR_DEVICE_LOST.into();
        assert!(matches!(err, CrucibleError::Api(vk::Result::ERROR_DEVICE_LOST)));
    }
}
