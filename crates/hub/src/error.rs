//! Typed failures for the hub and the taxonomy they are logged under.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Category every failure is logged as, regardless of where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    SensorStale,
    SensorCommFailure,
    ProtocolParseError,
    ActionRejectedAllowlist,
    ActionRejectedLimit,
    ActionRejectedCostCap,
    ActionRejectedHardwareGuard,
    EmergencyStopActive,
    DispatchLinkFailure,
    RecoveryInProgress,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SensorStale => "SensorStale",
            Self::SensorCommFailure => "SensorCommFailure",
            Self::ProtocolParseError => "ProtocolParseError",
            Self::ActionRejectedAllowlist => "ActionRejectedAllowlist",
            Self::ActionRejectedLimit => "ActionRejectedLimit",
            Self::ActionRejectedCostCap => "ActionRejectedCostCap",
            Self::ActionRejectedHardwareGuard => "ActionRejectedHardwareGuard",
            Self::EmergencyStopActive => "EmergencyStopActive",
            Self::DispatchLinkFailure => "DispatchLinkFailure",
            Self::RecoveryInProgress => "RecoveryInProgress",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("link i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("no terminal reply within {0} ms")]
    Timeout(u64),
    #[error("link closed by node")]
    Closed,
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::DispatchLinkFailure
    }
}

// ---------------------------------------------------------------------------
// Status record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatusParseError {
    #[error("reply carried no status record")]
    MissingRecord,
    #[error("status record has {0} fields, expected at least 13")]
    FieldCount(usize),
    #[error("status field {index} unparseable: {value:?}")]
    Field { index: usize, value: String },
}

impl StatusParseError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ProtocolParseError
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher busy")]
    Busy,
    #[error("`{command}` failed: {source}")]
    Link {
        command: String,
        #[source]
        source: LinkError,
    },
    #[error("`{command}` refused by node: {reply}")]
    Device { command: String, reply: String },
    #[error(transparent)]
    Status(#[from] StatusParseError),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Status(e) => e.kind(),
            _ => ErrorKind::DispatchLinkFailure,
        }
    }
}

// ---------------------------------------------------------------------------
// Advisor
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("advisor unreachable: {0}")]
    Unreachable(String),
    #[error("advisor gave no answer within {0} s")]
    Timeout(u64),
    #[error("advisor reply unusable: {0}")]
    BadResponse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_kinds() {
        let link = DispatchError::Link {
            command: "lon".into(),
            source: LinkError::Timeout(2000),
        };
        assert_eq!(link.kind(), ErrorKind::DispatchLinkFailure);
        assert_eq!(
            DispatchError::from(StatusParseError::FieldCount(4)).kind(),
            ErrorKind::ProtocolParseError
        );
    }

    #[test]
    fn messages_name_the_command() {
        let err = DispatchError::Device {
            command: "hon".into(),
            reply: "ERR heater refused: sensor data stale".into(),
        };
        assert_eq!(
            err.to_string(),
            "`hon` refused by node: ERR heater refused: sensor data stale"
        );
    }
}
