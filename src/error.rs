use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

pub type BreakerResult<T> = Result<T, BreakerError>;

/// Which leg of a request/response exchange failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStage {
    Connect,
    Write,
    Read,
}

impl fmt::Display for TransportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportStage::Connect => f.write_str("connect"),
            TransportStage::Write => f.write_str("write"),
            TransportStage::Read => f.write_str("read"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockSource {
    /// Physical lock lever on the device (high byte of the status word).
    Local,
    /// Remote lock flag held in the persisted mirror.
    Remote,
}

impl fmt::Display for LockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockSource::Local => f.write_str("locally"),
            LockSource::Remote => f.write_str("remotely"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("transport failure during {stage} with {addr}: {source}")]
    Transport {
        addr: String,
        stage: TransportStage,
        #[source]
        source: io::Error,
    },

    #[error("device returned exception 0x{code:02X} for function 0x{function:02X}")]
    ProtocolException { function: u8, code: u8 },

    #[error("malformed response: {0}")]
    ResponseMalformed(String),

    #[error("state change not confirmed after {attempts} polls")]
    OperationTimedOut { attempts: u32 },

    #[error("breaker is {lock} locked")]
    DeviceLocked { lock: LockSource },

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("breaker {0} not found")]
    BreakerNotFound(u32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("store error: {0}")]
    Store(String),
}

/// Serializable tag of a [`BreakerError`], stored with failed operations so
/// callers can branch on the kind instead of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    ProtocolException,
    ResponseMalformed,
    OperationTimedOut,
    DeviceLocked,
    UnsupportedOperation,
    NotFound,
    InvalidConfig,
    Store,
}

impl BreakerError {
    pub fn transport(addr: impl Into<String>, stage: TransportStage, source: io::Error) -> Self {
        BreakerError::Transport {
            addr: addr.into(),
            stage,
            source,
        }
    }

    pub fn timed_out(addr: impl Into<String>, stage: TransportStage) -> Self {
        let source = io::Error::new(io::ErrorKind::TimedOut, format!("{} deadline elapsed", stage));
        Self::transport(addr, stage, source)
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        BreakerError::ResponseMalformed(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BreakerError::Transport { .. } => ErrorKind::Transport,
            BreakerError::ProtocolException { .. } => ErrorKind::ProtocolException,
            BreakerError::ResponseMalformed(_) => ErrorKind::ResponseMalformed,
            BreakerError::OperationTimedOut { .. } => ErrorKind::OperationTimedOut,
            BreakerError::DeviceLocked { .. } => ErrorKind::DeviceLocked,
            BreakerError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            BreakerError::BreakerNotFound(_) => ErrorKind::NotFound,
            BreakerError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            BreakerError::Store(_) => ErrorKind::Store,
        }
    }

    /// The gateway actively refused the TCP connection. This is the only
    /// failure that triggers an automatic gateway reset.
    pub fn is_connection_refused(&self) -> bool {
        matches!(
            self,
            BreakerError::Transport { stage: TransportStage::Connect, source, .. }
                if source.kind() == io::ErrorKind::ConnectionRefused
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_only_counts_on_connect() {
        let refused = || io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(BreakerError::transport("10.0.0.1:502", TransportStage::Connect, refused())
            .is_connection_refused());
        assert!(!BreakerError::transport("10.0.0.1:502", TransportStage::Read, refused())
            .is_connection_refused());
        assert!(!BreakerError::timed_out("10.0.0.1:502", TransportStage::Connect).is_connection_refused());
    }

    #[test]
    fn timeout_is_a_transport_kind() {
        let err = BreakerError::timed_out("10.0.0.1:502", TransportStage::Read);
        assert!(matches!(&err, BreakerError::Transport { source, .. } if source.kind() == io::ErrorKind::TimedOut));
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(
            BreakerError::ProtocolException { function: 0x04, code: 0x02 }.kind(),
            ErrorKind::ProtocolException
        );
    }

    #[test]
    fn locked_message_names_the_source() {
        let err = BreakerError::DeviceLocked { lock: LockSource::Local };
        assert_eq!(err.to_string(), "breaker is locally locked");
    }
}
