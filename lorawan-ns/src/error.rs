//! Network server errors
//!
//! Every error carries a stable [`ErrorKind`] category and a named
//! [`Reason`]. Downlink scheduling failures may also carry one
//! [`PathErrorDetails`] entry per attempted downlink path. Error
//! classification anywhere in the crate is done on the kind, never on the
//! message text.

use core::fmt;

use thiserror::Error;

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller supplied something malformed
    InvalidArgument,
    /// A device, session, key, path or peer does not exist
    NotFound,
    /// The system is not in a state where the operation can proceed
    FailedPrecondition,
    /// Temporarily unable to serve; retrying later may succeed
    Unavailable,
    /// Broken invariant or encoding failure
    Internal,
    /// The entity already exists
    AlreadyExists,
    /// The operation was aborted, typically by a concurrency conflict
    Aborted,
    /// A quota or capacity limit was hit
    ResourceExhausted,
    /// Unrecoverable data loss or corruption
    DataLoss,
    /// Not implemented
    Unimplemented,
    /// A deadline expired before the operation completed
    DeadlineExceeded,
    /// The operation was cancelled by the caller
    Canceled,
}

impl ErrorKind {
    /// Lower-case name used in logs and events
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::FailedPrecondition => "failed_precondition",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Aborted => "aborted",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::DataLoss => "data_loss",
            ErrorKind::Unimplemented => "unimplemented",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named failure reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    /// Payload could not be decoded
    Decode,
    /// LoRaWAN major version is not supported
    UnsupportedMajor,
    /// Message type is not valid in this direction
    InvalidMType,
    /// Priority value out of range
    InvalidPriority,
    /// Application port outside 1..=223
    InvalidFPort,
    /// Payload longer than allowed
    PayloadTooLong,
    /// Data rate does not leave room for a frame
    InvalidDataRate,
    /// Device not found
    DeviceNotFound,
    /// Session not found
    SessionNotFound,
    /// Session key not found or could not be unwrapped
    KeyNotFound,
    /// Application downlink refers to an unknown session
    UnknownSession,
    /// No downlink path available
    NoDownlinkPath,
    /// Join Server not found in cluster or interop
    JoinServerNotFound,
    /// Device has no session
    EmptySession,
    /// Device has no MAC state
    UnknownMacState,
    /// Downlink absolute time already passed
    DownlinkExpired,
    /// Absolute time is not valid for the device class
    InvalidAbsoluteTime,
    /// Nothing needs to be sent
    NoDownlink,
    /// A confirmed class B/C downlink was sent too recently
    ConfirmedDownlinkTooSoon,
    /// Confirmed downlink queued for a multicast group
    ConfirmedMulticastDownlink,
    /// Application downlink frame counter already used
    FCntTooLow,
    /// Every downlink path failed
    SchedulingFailed,
    /// The application downlink failed terminally and was dropped
    ApplicationDownlinkFailed,
    /// MAC command encoding or encryption failed
    MacEncoding,
    /// Cryptographic operation failed
    Crypto,
    /// Read-modify-write conflict could not be resolved
    OutdatedData,
    /// Downlink was already scheduled
    DuplicateDownlink,
    /// Backing store failure
    Store,
    /// Uplink did not match any device
    DeviceNotMatched,
    /// Uplink frame counter already used
    Replay,
    /// Uplink frame counter jumped further than allowed
    FCntGap,
    /// First uplink of a 1.1 session did not carry RekeyInd
    MissingRekeyInd,
    /// Join-request from a device activated by personalization
    JoinNotSupported,
    /// Rejoin-request handling
    RejoinRequest,
    /// Invalid configuration value
    InvalidConfiguration,
    /// Remote peer failure
    Peer,
    /// Operation cancelled
    Canceled,
    /// Remote call exceeded its deadline
    Timeout,
}

/// Error of a single downlink path attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathErrorDetails {
    /// Category of the path failure
    pub kind: ErrorKind,
    /// Human-readable message from the peer
    pub message: String,
}

/// Network server error
#[derive(Debug, Clone, Error)]
#[error("{kind}: {reason:?}: {message}")]
pub struct Error {
    kind: ErrorKind,
    reason: Reason,
    message: String,
    path_errors: Vec<PathErrorDetails>,
}

impl Error {
    /// Create a new error
    pub fn new(kind: ErrorKind, reason: Reason, message: impl Into<String>) -> Self {
        Self {
            kind,
            reason,
            message: message.into(),
            path_errors: Vec::new(),
        }
    }

    /// Attach per-path failure details
    pub fn with_path_errors(mut self, path_errors: Vec<PathErrorDetails>) -> Self {
        self.path_errors = path_errors;
        self
    }

    /// Error category
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Error reason
    pub fn reason(&self) -> Reason {
        self.reason
    }

    /// Error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Per-path failure details, if any
    pub fn path_errors(&self) -> &[PathErrorDetails] {
        &self.path_errors
    }

    /// Shorthand for an `InvalidArgument` error
    pub fn invalid_argument(reason: Reason, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, reason, message)
    }

    /// Shorthand for a `NotFound` error
    pub fn not_found(reason: Reason, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, reason, message)
    }

    /// Shorthand for a `FailedPrecondition` error
    pub fn failed_precondition(reason: Reason, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FailedPrecondition, reason, message)
    }

    /// Shorthand for an `Unavailable` error
    pub fn unavailable(reason: Reason, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, reason, message)
    }

    /// Shorthand for an `Internal` error
    pub fn internal(reason: Reason, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, reason, message)
    }

    /// Read-modify-write conflict that survived the retry
    pub fn outdated_data() -> Self {
        Self::new(
            ErrorKind::Aborted,
            Reason::OutdatedData,
            "device changed during transaction",
        )
    }

    /// Cancellation observed at a suspension point
    pub fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, Reason::Canceled, "operation cancelled")
    }

    /// Backing store failure
    pub fn store(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, Reason::Store, message)
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::store(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_reason() {
        let err = Error::failed_precondition(Reason::NoDownlink, "nothing to send");
        let text = err.to_string();
        assert!(text.contains("failed_precondition"));
        assert!(text.contains("NoDownlink"));
        assert!(text.contains("nothing to send"));
    }

    #[test]
    fn test_path_errors_attached() {
        let err = Error::unavailable(Reason::SchedulingFailed, "all paths failed").with_path_errors(vec![
            PathErrorDetails {
                kind: ErrorKind::ResourceExhausted,
                message: "duty cycle".into(),
            },
        ]);
        assert_eq!(err.path_errors().len(), 1);
        assert_eq!(err.path_errors()[0].kind, ErrorKind::ResourceExhausted);
    }
}
