//! Async D-Bus method bindings on top of zbus.
//!
//! Servers declare interfaces as sets of [`MethodSpec`]s, attach async
//! handlers and export them on a [`Connection`]. Clients call them through a
//! [`Proxy`] built from the same [`InterfaceSpec`]. Both sides check
//! arguments against the declared D-Bus signatures, and server-side failures
//! that are not named D-Bus errors reach the connection's unhandled-error hook
//! while the caller receives `org.freedesktop.DBus.Error.Failed`.
//!
//! A [`Connection`] wraps a `zbus::Connection`, either to the session or
//! system bus or peer to peer over a socket pair ([`Connection::pair`]).
//! Values are `zvariant` values.

pub mod config;
pub mod connection;
pub mod error;
pub mod interface;
pub mod introspect;
pub mod logging;
pub mod names;
pub mod object;
pub mod proxy;
pub mod value;

pub use config::{BusConfig, Config};
pub use connection::{Connection, UnhandledError};
pub use error::{Error, MethodError, MethodErrorKind, Result};
pub use interface::{
    current_message, Call, HandlerError, HandlerResult, Interface, InterfaceSpec, MethodFlags,
    MethodSpec,
};
pub use proxy::Proxy;
pub use value::{ArgError, Args};
pub use zbus;
pub use zbus::zvariant::{OwnedValue, Signature, Value};
