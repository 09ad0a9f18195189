use thiserror::Error;

/// Broad classification of an [`AcqError`], used by callers to decide how a
/// failure is surfaced (startup abort, job abort, terminal shutdown error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Session startup failed; the session is unusable.
    Startup,
    /// Session shutdown completed but reported a terminal condition.
    Shutdown,
    /// A job request was rejected or a running job aborted.
    Job,
    /// Fieldbus collaborator failure outside of startup.
    Fieldbus,
    /// Persistence collaborator failure.
    Persistence,
    /// Sample file storage failure.
    Storage,
    /// Configuration or invalid state usage.
    Config,
}

/// Acquisition server error types covering startup, jobs and collaborators.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AcqError {
    /// No node answered on the adapter.
    #[error("no slave found on adapter {adapter}")]
    NoSlaveFound {
        /// Adapter that was opened.
        adapter: String,
    },

    /// A node does not match the expected topology.
    #[error(
        "unexpected slave layout at position {position}: expected {expected}, found vendor {vendor_id:#x} product {product_code:#x}"
    )]
    UnexpectedLayout {
        /// Network position of the offending node.
        position: u16,
        /// Human-readable description of the expected node.
        expected: String,
        /// Vendor id reported by the node.
        vendor_id: u32,
        /// Product code reported by the node.
        product_code: u32,
    },

    /// Not all nodes reached SAFE_OP within the bounded wait.
    #[error("not all slaves reached SAFE_OP within {timeout_ms}ms (lowest state {reached})")]
    SafeOpTimeout {
        /// Wait bound in milliseconds.
        timeout_ms: u64,
        /// Lowest state observed at the end of the wait.
        reached: String,
    },

    /// Full-operational state was never confirmed while the session was open.
    #[error("not all slaves reached OP state")]
    NotAllOperational,

    /// The session is not open or its background loops are not running.
    #[error("fieldbus session not open")]
    SessionClosed,

    /// Fieldbus collaborator error.
    #[error("fieldbus error: {0}")]
    Fieldbus(String),

    /// A job is already active for the device.
    #[error("{sn} is already running")]
    DuplicateJob {
        /// Device serial number.
        sn: String,
    },

    /// The single acquisition is driven by another device's job.
    #[error("acquisition busy with {active}")]
    AcquisitionBusy {
        /// Serial number of the device whose job is active.
        active: String,
    },

    /// The device is unknown to the persistence collaborator.
    #[error("device '{sn}' not found")]
    DeviceNotFound {
        /// Device serial number.
        sn: String,
    },

    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A completed sample buffer could not be converted.
    #[error("sample conversion failed: {0}")]
    Sample(String),

    /// Persistence collaborator error.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Sample file storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl AcqError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSlaveFound { .. } | Self::UnexpectedLayout { .. } | Self::SafeOpTimeout { .. } => {
                ErrorKind::Startup
            }
            Self::NotAllOperational => ErrorKind::Shutdown,
            Self::SessionClosed | Self::Fieldbus(_) => ErrorKind::Fieldbus,
            Self::DuplicateJob { .. }
            | Self::AcquisitionBusy { .. }
            | Self::DeviceNotFound { .. }
            | Self::InvalidRequest(_)
            | Self::Sample(_) => ErrorKind::Job,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Config(_) | Self::InvalidStateTransition { .. } => ErrorKind::Config,
        }
    }

    /// Returns true for errors that leave the session unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Startup | ErrorKind::Shutdown)
    }
}

/// Convenience type alias for acquisition operations.
pub type AcqResult<T> = Result<T, AcqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_errors_are_fatal() {
        let err = AcqError::NoSlaveFound {
            adapter: "sim0".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Startup);
        assert!(err.is_fatal());

        let err = AcqError::SafeOpTimeout {
            timeout_ms: 50,
            reached: "PRE_OP".into(),
        };
        assert!(err.is_fatal());
        assert!(AcqError::NotAllOperational.is_fatal());
    }

    #[test]
    fn test_job_errors_are_not_fatal() {
        let err = AcqError::DuplicateJob { sn: "1001".into() };
        assert_eq!(err.kind(), ErrorKind::Job);
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "1001 is already running");

        let err = AcqError::AcquisitionBusy {
            active: "1002".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Job);
        assert_eq!(err.to_string(), "acquisition busy with 1002");
    }

    #[test]
    fn test_layout_message() {
        let err = AcqError::UnexpectedLayout {
            position: 0,
            expected: "128+128".into(),
            vendor_id: 0x2,
            product_code: 0x1234,
        };
        let msg = err.to_string();
        assert!(msg.contains("position 0"));
        assert!(msg.contains("0x1234"));
    }
}
