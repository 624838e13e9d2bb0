use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur when working with fitness peripherals
#[derive(Error, Debug)]
pub enum TrainerError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found during scanning
    #[error("Fitness device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// The link is gone or no connection epoch has been started
    #[error("Device disconnected")]
    Disconnected,

    /// The peripheral does not expose the requested service
    #[error("Service {service} not found on device")]
    ServiceNotFound {
        /// Service UUID that was looked up
        service: Uuid,
    },

    /// The service does not expose the requested characteristic
    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound {
        /// Service UUID that was searched
        service: Uuid,
        /// Characteristic UUID that was looked up
        characteristic: Uuid,
    },

    /// The peripheral rejected a write
    #[error("Write to {characteristic} failed: {reason}")]
    WriteFailed {
        /// Characteristic the write was addressed to
        characteristic: Uuid,
        /// Transport-provided reason
        reason: String,
    },

    /// None of the advertised services match a supported device class
    #[error("Unrecognized device: no supported fitness service advertised")]
    UnrecognizedDevice,

    /// The power meter answered the zero-offset request with a failure code
    #[error("Zero offset failed - crank calibration response code 0x{code:02X}, try again")]
    CalibrationFailed {
        /// Result code from the control point response
        code: u8,
    },

    /// The power meter answered the zero-offset request with an unknown code
    #[error("Unknown zero offset response from crank: 0x{code:02X}")]
    CalibrationUnknownResult {
        /// Result code from the control point response
        code: u8,
    },

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The operation is not available on this device class
    #[error("{operation} is not supported by {device}")]
    Unsupported {
        /// Operation that was attempted
        operation: &'static str,
        /// Device type description
        device: &'static str,
    },

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),
}

/// Result type for trainerlink operations
pub type Result<T> = std::result::Result<T, TrainerError>;

impl TrainerError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound
                | Self::ServiceNotFound { .. }
                | Self::CharacteristicNotFound { .. }
                | Self::WriteFailed { .. }
        )
    }

    /// Check if this error is recoverable by simply trying again
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::CalibrationFailed { .. } | Self::WriteFailed { .. }
        )
    }

    /// Check if this error means the device answered a calibration request negatively
    #[must_use]
    pub const fn is_calibration_error(&self) -> bool {
        matches!(
            self,
            Self::CalibrationFailed { .. } | Self::CalibrationUnknownResult { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = TrainerError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_recoverable());
        assert!(!connection_error.is_calibration_error());

        let timeout_error = TrainerError::Timeout { timeout_ms: 5000 };
        assert!(!timeout_error.is_connection_error());
        assert!(timeout_error.is_recoverable());
        assert!(!timeout_error.is_calibration_error());

        let calibration_error = TrainerError::CalibrationFailed { code: 0x04 };
        assert!(!calibration_error.is_connection_error());
        assert!(calibration_error.is_recoverable());
        assert!(calibration_error.is_calibration_error());

        let unknown = TrainerError::CalibrationUnknownResult { code: 0x02 };
        assert!(unknown.is_calibration_error());
        assert!(!unknown.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = TrainerError::CalibrationFailed { code: 0x04 };
        let error_string = format!("{error}");
        assert!(error_string.contains("Zero offset failed"));
        assert!(error_string.contains("0x04"));

        let error = TrainerError::Unsupported {
            operation: "zero offset",
            device: "Bluetooth HRM",
        };
        assert_eq!(format!("{error}"), "zero offset is not supported by Bluetooth HRM");
    }
}
