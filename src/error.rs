//! Named D-Bus errors and the crate error type.

use crate::config::ConfigError;
use crate::value::ArgError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use zbus::zvariant;

/// Error names defined by the D-Bus specification.
pub mod well_known {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
    pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const LIMITS_EXCEEDED: &str = "org.freedesktop.DBus.Error.LimitsExceeded";
    pub const ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
    pub const NOT_SUPPORTED: &str = "org.freedesktop.DBus.Error.NotSupported";
    pub const TIMEOUT: &str = "org.freedesktop.DBus.Error.Timeout";
}

/// Classification of a [`MethodError`] by its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodErrorKind {
    Failed,
    NoReply,
    ServiceUnknown,
    NameHasNoOwner,
    UnknownObject,
    UnknownInterface,
    UnknownMethod,
    InvalidArgs,
    LimitsExceeded,
    AccessDenied,
    NotSupported,
    Timeout,
    /// Application-defined error name.
    Other,
}

/// An error carried by a D-Bus error reply: a dotted name plus a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError {
    name: String,
    message: String,
}

impl MethodError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(well_known::FAILED, message)
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(well_known::INVALID_ARGS, message)
    }

    pub fn unknown_object(path: &str) -> Self {
        Self::new(
            well_known::UNKNOWN_OBJECT,
            format!("Unknown object '{path}'."),
        )
    }

    pub fn unknown_interface(interface: &str) -> Self {
        Self::new(
            well_known::UNKNOWN_INTERFACE,
            format!("Unknown interface '{interface}'."),
        )
    }

    pub fn unknown_method(member: &str, interface: Option<&str>) -> Self {
        Self::new(
            well_known::UNKNOWN_METHOD,
            format!(
                "Unknown method '{member}' or interface '{}'.",
                interface.unwrap_or("")
            ),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> MethodErrorKind {
        match self.name.as_str() {
            well_known::FAILED => MethodErrorKind::Failed,
            well_known::NO_REPLY => MethodErrorKind::NoReply,
            well_known::SERVICE_UNKNOWN => MethodErrorKind::ServiceUnknown,
            well_known::NAME_HAS_NO_OWNER => MethodErrorKind::NameHasNoOwner,
            well_known::UNKNOWN_OBJECT => MethodErrorKind::UnknownObject,
            well_known::UNKNOWN_INTERFACE => MethodErrorKind::UnknownInterface,
            well_known::UNKNOWN_METHOD => MethodErrorKind::UnknownMethod,
            well_known::INVALID_ARGS => MethodErrorKind::InvalidArgs,
            well_known::LIMITS_EXCEEDED => MethodErrorKind::LimitsExceeded,
            well_known::ACCESS_DENIED => MethodErrorKind::AccessDenied,
            well_known::NOT_SUPPORTED => MethodErrorKind::NotSupported,
            well_known::TIMEOUT => MethodErrorKind::Timeout,
            _ => MethodErrorKind::Other,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.kind() == MethodErrorKind::Failed
    }

    /// Message text as it goes on the wire. D-Bus strings cannot carry NUL,
    /// so those become U+FFFD.
    pub(crate) fn wire_message(&self) -> String {
        self.message.replace('\0', "\u{fffd}")
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for MethodError {}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Remote error {0}")]
    Method(#[from] MethodError),

    #[error("D-Bus connection error: {0}")]
    Zbus(zbus::Error),

    #[error("Invalid value or signature: {0}")]
    Variant(#[from] zvariant::Error),

    #[error("Invalid name: {0}")]
    Name(#[from] zbus::names::Error),

    #[error("Invalid arguments: {0}")]
    Arg(#[from] ArgError),

    #[error("Method {0} is not declared on this interface")]
    UnknownMethod(String),

    #[error("Reply signature '{found}' does not match declared '{expected}'")]
    ReplySignatureMismatch { expected: String, found: String },

    #[error("Method call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    Disconnected,

    #[error("Interface {interface} is already exported at {path}")]
    AlreadyExported { path: String, interface: String },

    #[error("Method {method} of {interface} has no handler")]
    MissingHandler { interface: String, method: String },

    #[error("Invalid method declaration: {0}")]
    Declaration(String),

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<zbus::Error> for Error {
    fn from(err: zbus::Error) -> Self {
        match err {
            zbus::Error::MethodError(name, message, _) => {
                Error::Method(MethodError::new(name.to_string(), message.unwrap_or_default()))
            }
            zbus::Error::Variant(err) => Error::Variant(err),
            zbus::Error::Names(err) => Error::Name(err),
            other => Error::Zbus(other),
        }
    }
}

impl Error {
    /// The remote error, if the call failed with an error reply.
    pub fn method_error(&self) -> Option<&MethodError> {
        match self {
            Error::Method(err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
