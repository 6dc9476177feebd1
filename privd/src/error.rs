use derive_more::{Display, From};
use serde_derive::{Deserialize, Serialize};
use std::{borrow::Cow, io};

/// Common errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    IoError(io::Error),
    #[display(fmt = "Permission denied, must run as root")]
    PermissionDenied,
    #[display(fmt = "{}", "_0")]
    UnixError(nix::Error),
    #[display(fmt = "Invalid argument: {}", "_0")]
    #[from(ignore)]
    InvalidArgument(Cow<'static, str>),
    #[display(fmt = "Invalid configuration: {}", "_0")]
    ConfigError(toml::de::Error),
    #[display(fmt = "Codec error: {}", "_0")]
    CodecError(bincode::Error),
    #[display(fmt = "{}", "_0")]
    JoinError(tokio::task::JoinError),
    #[display(fmt = "User '{}' not found", "_0")]
    #[from(ignore)]
    UserNotFound(String),
    #[display(fmt = "Group '{}' not found", "_0")]
    #[from(ignore)]
    GroupNotFound(String),
    #[display(fmt = "Failed to drop privileges ({}) - {}", "_0", "_1")]
    Privdrop(&'static str, nix::Error),
    #[display(fmt = "Authentication failed")]
    AuthenticationFailed,
    #[display(fmt = "Handshake timed out")]
    HandshakeTimeout,
    #[display(fmt = "{}", "_0")]
    Remote(Fault),
}

impl std::error::Error for Error {}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::HandshakeTimeout
    }
}

/// A per-call failure as it is transferred to the caller.
///
/// Faults are produced by operations, by the identity executor, and
/// by the daemon itself on behalf of a call.  They are passed to the
/// caller unchanged.
#[derive(Clone, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fault {
    /// An operating system error with its errno.
    #[display(fmt = "[Errno {}] {}", errno, message)]
    Os { errno: i32, message: String },
    /// A user or group could not be resolved.
    #[display(fmt = "Lookup error: {}", "_0")]
    Lookup(String),
    #[display(fmt = "Invalid argument: {}", "_0")]
    InvalidArgument(String),
    /// The worker did not deliver an outcome in time.
    #[display(fmt = "Timeout")]
    Timeout,
    /// The worker exited or crashed without delivering an outcome.
    #[display(fmt = "Worker died: {}", "_0")]
    WorkerDied(String),
    /// Any other failure reported by an operation.
    #[display(fmt = "{}", "_0")]
    Operation(String),
    #[display(fmt = "Protocol error: {}", "_0")]
    Protocol(String),
}

impl std::error::Error for Fault {}

impl Fault {
    /// Create an OS fault from an errno and a message.
    pub fn os<S: Into<String>>(errno: nix::errno::Errno, message: S) -> Self {
        Self::Os {
            errno: errno as i32,
            message: message.into(),
        }
    }

    /// Returns the errno of an OS fault.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Os { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

impl From<io::Error> for Fault {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => Self::Os {
                errno,
                message: err.to_string(),
            },
            None => Self::Operation(err.to_string()),
        }
    }
}

impl From<nix::Error> for Fault {
    fn from(err: nix::Error) -> Self {
        Self::os(err, err.desc())
    }
}

impl From<Error> for Fault {
    fn from(err: Error) -> Self {
        match err {
            Error::IoError(err) => err.into(),
            Error::UnixError(err) => err.into(),
            Error::Privdrop(call, errno) => {
                Self::os(errno, format!("{} failed: {}", call, errno.desc()))
            }
            Error::UserNotFound(_) | Error::GroupNotFound(_) => Self::Lookup(err.to_string()),
            Error::InvalidArgument(msg) => Self::InvalidArgument(msg.into_owned()),
            Error::CodecError(_) | Error::AuthenticationFailed | Error::HandshakeTimeout => {
                Self::Protocol(err.to_string())
            }
            Error::Remote(fault) => fault,
            err => Self::Operation(err.to_string()),
        }
    }
}
