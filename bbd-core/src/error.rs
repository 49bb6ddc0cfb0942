//! Crate error type and the driver-side error policy.
//!
//! Codes are partitioned by layer: 100s registry, 300s channel, 500s protocol.

use crate::channel::ChannelError;
use crate::device::{DeviceKind, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("unexpected control code {got:#06x}{}", expected_suffix(.expected))]
    UnexpectedControlCode { expected: Option<u16>, got: u16 },
    #[error("bad message length {0}")]
    BadMessageLength(i32),
    #[error("{kind} record: bad length {len}")]
    BadRecord { kind: DeviceKind, len: i32 },
    #[error("{kind} handshake: sent {sent} devices, peer reported {reported}")]
    HandshakeMismatch {
        kind: DeviceKind,
        sent: i32,
        reported: i32,
    },
    #[error("protocol version {got}, expected {expected}")]
    VersionMismatch { expected: i32, got: i32 },
    #[error("peer aborted the session, reason {reason}")]
    PeerAborted { reason: i32 },
    #[error("correlation id space exhausted")]
    IdSpaceExhausted,
    #[error("no connection to peer")]
    NotConnected,
    #[error("empty message")]
    EmptyMessage,
}

impl Error {
    /// Transport failure that a caller could retry at a higher level.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Channel(_))
    }
}

/// Anything with a stable numeric diagnostic code.
pub trait Coded {
    fn code(&self) -> i32;
}

impl Coded for ChannelError {
    fn code(&self) -> i32 {
        ChannelError::code(self)
    }
}

impl Coded for RegistryError {
    fn code(&self) -> i32 {
        RegistryError::code(self)
    }
}

impl Coded for Error {
    fn code(&self) -> i32 {
        match self {
            Error::Channel(e) => e.code(),
            Error::Registry(e) => e.code(),
            Error::UnexpectedControlCode { .. } => 501,
            Error::BadMessageLength(_) => 502,
            Error::BadRecord { .. } => 503,
            Error::EmptyMessage => 504,
            Error::HandshakeMismatch { .. } => 510,
            Error::VersionMismatch { .. } => 511,
            Error::PeerAborted { reason } => *reason,
            Error::IdSpaceExhausted => 513,
            Error::NotConnected => 520,
        }
    }
}

/// What the driver does with a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Hand the error back.
    #[default]
    Propagate,
    /// Print one diagnostic line and exit with the error's code.
    AbortLoud,
    /// Exit with the error's code, printing nothing.
    AbortSilent,
}

impl ErrorPolicy {
    /// Apply the policy to the result of `operation`.
    pub fn apply<T, E>(self, operation: &str, result: Result<T, E>) -> Result<T, E>
    where
        E: Coded + std::fmt::Display,
    {
        let err = match result {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        match self {
            ErrorPolicy::Propagate => Err(err),
            ErrorPolicy::AbortLoud => {
                eprintln!("{}", diagnostic(operation, &err));
                std::process::exit(exit_status(err.code()))
            }
            ErrorPolicy::AbortSilent => std::process::exit(exit_status(err.code())),
        }
    }
}

/// The one-line form every fatal condition is reported in.
pub fn diagnostic<E: Coded + std::fmt::Display>(operation: &str, err: &E) -> String {
    format!("bbd: {operation}: {err} (code {})", err.code())
}

fn expected_suffix(expected: &Option<u16>) -> String {
    match expected {
        Some(code) => format!(", expected {code:#06x}"),
        None => String::new(),
    }
}

// The platform keeps only the low byte; a status that reads as success becomes 1.
fn exit_status(code: i32) -> i32 {
    if code.rem_euclid(256) == 0 {
        1
    } else {
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_keep_their_layer() {
        let e: Error = RegistryError::EmptyName.into();
        assert_eq!(e.code(), 102);
        let e: Error = ChannelError::NotImplemented("seek from end").into();
        assert_eq!(e.code(), 352);
        assert_eq!(Error::PeerAborted { reason: 7 }.code(), 7);
        assert_eq!(
            Error::UnexpectedControlCode {
                expected: Some(13),
                got: 0x3000
            }
            .code(),
            501
        );
    }

    #[test]
    fn diagnostic_line_format() {
        let err = Error::HandshakeMismatch {
            kind: DeviceKind::Sense,
            sent: 2,
            reported: -1,
        };
        assert_eq!(
            diagnostic("handshake", &err),
            "bbd: handshake: sense handshake: sent 2 devices, peer reported -1 (code 510)"
        );
        let err = Error::UnexpectedControlCode { expected: Some(13), got: 0x2001 };
        assert_eq!(err.to_string(), "unexpected control code 0x2001, expected 0x000d");
    }

    // Re-runs this test binary on one test with the policy to apply in the environment.
    fn run_aborting(policy: &str) -> std::process::Output {
        std::process::Command::new(std::env::current_exe().unwrap())
            .args(["--exact", "error::tests::aborting_child", "--nocapture", "--test-threads=1"])
            .env("BBD_ABORT_POLICY", policy)
            .output()
            .unwrap()
    }

    #[test]
    fn aborting_child() {
        let policy = match std::env::var("BBD_ABORT_POLICY").as_deref() {
            Ok("loud") => ErrorPolicy::AbortLoud,
            Ok("silent") => ErrorPolicy::AbortSilent,
            _ => return,
        };
        let r: Result<(), Error> = Err(Error::PeerAborted { reason: 42 });
        let _ = policy.apply("connect", r);
        unreachable!("abort policies exit");
    }

    #[test]
    fn abort_policies_exit_with_code() {
        let loud = run_aborting("loud");
        assert_eq!(loud.status.code(), Some(42));
        let stderr = String::from_utf8_lossy(&loud.stderr);
        assert!(stderr.contains("bbd: connect: peer aborted the session, reason 42 (code 42)"));

        let silent = run_aborting("silent");
        assert_eq!(silent.status.code(), Some(42));
        assert!(!String::from_utf8_lossy(&silent.stderr).contains("bbd:"));
    }

    #[test]
    fn exit_status_never_reads_as_success() {
        assert_eq!(exit_status(0), 1);
        assert_eq!(exit_status(256), 1);
        assert_eq!(exit_status(-512), 1);
        assert_eq!(exit_status(510), 510);
        assert_eq!(exit_status(-1), -1);
    }

    #[test]
    fn propagate_hands_error_back() {
        let r: Result<(), Error> = Err(Error::NotConnected);
        let out = ErrorPolicy::Propagate.apply("connect", r);
        assert!(matches!(out, Err(Error::NotConnected)));
        let ok: Result<u8, Error> = Ok(3);
        assert_eq!(ErrorPolicy::AbortLoud.apply("noop", ok).unwrap(), 3);
    }
}
