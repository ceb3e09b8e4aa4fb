//! Error handling for the closed-loop stimulation workspace
//!
//! Construction-time checks fail fast with one of these variants and are
//! propagated to the caller. "No spectral peak" is deliberately absent: it is
//! a regular control-flow result, not a failure.

use core::fmt;

/// Result type alias for closed-loop operations
pub type ClsResult<T> = Result<T, ClsError>;

/// Error type shared by every crate in the workspace
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ClsError {
    /// Invalid configuration value
    InvalidConfig {
        /// Description of the configuration error
        reason: String,
    },

    /// Two buffers that must agree on shape do not
    ShapeMismatch {
        /// Context in which the shapes were compared
        context: String,
        /// Expected (channels, samples)
        expected: (usize, usize),
        /// Actual (channels, samples)
        actual: (usize, usize),
    },

    /// A named buffer was not registered
    MissingBuffer {
        /// Requested buffer name
        name: String,
    },

    /// A named pipe or analysis stage was not registered
    MissingPipe {
        /// Requested pipe name
        name: String,
    },

    /// Decimation was configured with the same buffer as input and output
    InPlaceDecimation {
        /// Name of the offending buffer
        buffer: String,
    },

    /// The protocol block period does not match the data stream period
    PollingPeriodMismatch {
        /// Block period expected by the protocol (ms)
        protocol_ms: u64,
        /// Polling period of the data stream (ms)
        stream_ms: u64,
    },

    /// Analyzer input length differs from its configured length
    InputSizeMismatch {
        /// Configured input length in samples
        expected: usize,
        /// Received input length in samples
        actual: usize,
    },

    /// Channel labels are invalid (duplicate or wrong count)
    InvalidLabels {
        /// Description of the label problem
        reason: String,
    },

    /// Channel index or label does not exist
    ChannelNotFound {
        /// Requested channel (index or label)
        channel: String,
    },

    /// Stimulus device or transport failure
    DeviceError {
        /// Device-related error description
        reason: String,
    },

    /// Instruction encoding/decoding failure
    CodecError {
        /// Description of the wire format issue
        reason: String,
    },

    /// Worker pool construction failure
    WorkerPool {
        /// Description of the pool error
        reason: String,
    },

    /// Trial log output failure
    LogError {
        /// Description of the log error
        reason: String,
    },
}

impl fmt::Display for ClsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClsError::InvalidConfig { reason } => {
                write!(f, "Invalid configuration: {}", reason)
            }
            ClsError::ShapeMismatch { context, expected, actual } => {
                write!(f, "Shape mismatch in {}: expected {}x{}, got {}x{}",
                       context, expected.0, expected.1, actual.0, actual.1)
            }
            ClsError::MissingBuffer { name } => {
                write!(f, "Buffer '{}' is not registered", name)
            }
            ClsError::MissingPipe { name } => {
                write!(f, "Pipe '{}' is not registered", name)
            }
            ClsError::InPlaceDecimation { buffer } => {
                write!(f, "Decimation cannot write into its own input buffer '{}'", buffer)
            }
            ClsError::PollingPeriodMismatch { protocol_ms, stream_ms } => {
                write!(f, "Polling period mismatch: protocol expects {}ms blocks, stream delivers every {}ms",
                       protocol_ms, stream_ms)
            }
            ClsError::InputSizeMismatch { expected, actual } => {
                write!(f, "Input size mismatch: analyzer configured for {} samples, got {}",
                       expected, actual)
            }
            ClsError::InvalidLabels { reason } => {
                write!(f, "Invalid channel labels: {}", reason)
            }
            ClsError::ChannelNotFound { channel } => {
                write!(f, "Channel '{}' not found", channel)
            }
            ClsError::DeviceError { reason } => {
                write!(f, "Device error: {}", reason)
            }
            ClsError::CodecError { reason } => {
                write!(f, "Instruction codec error: {}", reason)
            }
            ClsError::WorkerPool { reason } => {
                write!(f, "Worker pool error: {}", reason)
            }
            ClsError::LogError { reason } => {
                write!(f, "Trial log error: {}", reason)
            }
        }
    }
}

impl std::error::Error for ClsError {}

/// Convenience macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::ClsError::InvalidConfig {
            reason: format!($($arg)*),
        }
    };
}

/// Convenience macro for creating device errors
#[macro_export]
macro_rules! device_error {
    ($($arg:tt)*) => {
        $crate::error::ClsError::DeviceError {
            reason: format!($($arg)*),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ClsError::ShapeMismatch {
            context: "filter bank".to_string(),
            expected: (4, 500),
            actual: (4, 250),
        };
        let display = format!("{}", error);
        assert!(display.contains("filter bank"));
        assert!(display.contains("4x500"));
        assert!(display.contains("4x250"));
    }

    #[test]
    fn test_error_macros() {
        let error = config_error!("order must be positive, got {}", 0);
        assert_eq!(error, ClsError::InvalidConfig {
            reason: "order must be positive, got 0".to_string(),
        });

        let error = device_error!("no port");
        assert!(format!("{}", error).contains("no port"));
    }
}
