//! Error types for iotgate.

use std::io;

use crate::directory::DirectoryError;
use crate::types::Action;

/// Result type alias for iotgate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for iotgate operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The client was refused by a connect, publish or subscribe check.
    #[error("rejected: {0}")]
    Rejected(#[from] Rejection),

    /// The persistent directory failed; never conflated with a rejection.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// A forwarded body could not be parsed or lacks required fields.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Best-effort delivery over the transport failed.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// No tokio runtime to spawn background tasks on.
    #[error("no tokio runtime: {0}")]
    Runtime(String),

    /// The expiry sweeper is already running.
    #[error("gateway already running")]
    AlreadyRunning,
}

impl Error {
    /// Returns the rejection carried by this error, if any.
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Error::Rejected(r) => Some(r),
            _ => None,
        }
    }
}

/// Why a client operation was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// Unknown device or credential mismatch. Both cases look the same to the client.
    #[error("bad user name or password")]
    BadCredentials,

    /// Payload exceeds the configured maximum length.
    #[error("payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// Publish arrived before the minimum inter-publish interval elapsed.
    #[error("publish rate too high")]
    RateLimited,

    /// The client is not present in the device cache.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The topic ACL denied the action.
    #[error("{action} not allowed on {topic}")]
    Forbidden { action: Action, topic: String },
}

impl Rejection {
    /// Whether the session must be torn down rather than merely refused.
    pub fn disconnects(&self) -> bool {
        match self {
            Rejection::PayloadTooLarge { .. } | Rejection::RateLimited | Rejection::Forbidden { .. } => true,
            Rejection::BadCredentials | Rejection::NotAuthenticated => false,
        }
    }

    /// Machine-readable reason for the transport.
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Rejection::BadCredentials => ReasonCode::BadUserNameOrPassword,
            Rejection::PayloadTooLarge { .. } => ReasonCode::PacketTooLarge,
            Rejection::RateLimited => ReasonCode::MessageRateTooHigh,
            Rejection::NotAuthenticated | Rejection::Forbidden { .. } => ReasonCode::NotAuthorized,
        }
    }
}

/// MQTT 5.0 reason codes used for refusals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReasonCode {
    BadUserNameOrPassword = 0x86,
    NotAuthorized = 0x87,
    PacketTooLarge = 0x95,
    MessageRateTooHigh = 0x96,
}

impl ReasonCode {
    /// Raw MQTT 5.0 reason code.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// MQTT 3.1.1 CONNACK return code for this reason.
    ///
    /// 3.1.1 has no publish/subscribe reason codes, so only the connect
    /// refusals map to something other than "not authorized".
    pub fn v4_connect_code(self) -> u8 {
        match self {
            ReasonCode::BadUserNameOrPassword => 4,
            _ => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_disconnects() {
        assert!(!Rejection::BadCredentials.disconnects());
        assert!(!Rejection::NotAuthenticated.disconnects());
        assert!(Rejection::RateLimited.disconnects());
        assert!(Rejection::PayloadTooLarge { len: 10, max: 5 }.disconnects());
        assert!(
            Rejection::Forbidden {
                action: Action::Subscribe,
                topic: "/other".to_string()
            }
            .disconnects()
        );
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(Rejection::BadCredentials.reason_code().as_u8(), 0x86);
        assert_eq!(Rejection::BadCredentials.reason_code().v4_connect_code(), 4);
        assert_eq!(Rejection::RateLimited.reason_code().as_u8(), 0x96);
        assert_eq!(Rejection::NotAuthenticated.reason_code().v4_connect_code(), 5);
    }

    #[test]
    fn test_error_display() {
        let err = Error::from(Rejection::PayloadTooLarge { len: 2048, max: 1024 });
        assert_eq!(err.to_string(), "rejected: payload of 2048 bytes exceeds limit of 1024");
        assert!(err.rejection().is_some());

        let err = Error::Directory(DirectoryError::Storage("disk gone".to_string()));
        assert!(err.rejection().is_none());
    }
}
