//! Client-side calls checked against an [`InterfaceSpec`].

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::interface::{InterfaceSpec, MethodFlags};
use crate::names::{validate_bus_name, validate_object_path};
use crate::value::{body_values, Args};
use std::time::Duration;
use tracing::debug;
use zbus::zvariant::{self, Value};

/// Handle to one interface of a remote object.
#[derive(Debug, Clone)]
pub struct Proxy {
    connection: Connection,
    destination: Option<String>,
    path: String,
    spec: InterfaceSpec,
    timeout: Duration,
}

impl Proxy {
    /// Proxy for `path` on the other end of `connection`. Calls carry no
    /// destination until [`with_destination`](Self::with_destination) sets one,
    /// which is what peer-to-peer connections want.
    pub fn new(connection: &Connection, path: &str, spec: InterfaceSpec) -> Result<Self> {
        validate_object_path(path)?;
        Ok(Self {
            connection: connection.clone(),
            destination: None,
            path: path.to_string(),
            spec,
            timeout: connection.config().method_call_timeout(),
        })
    }

    /// Address calls to `name` on the bus.
    pub fn with_destination(mut self, name: &str) -> Result<Self> {
        validate_bus_name(name)?;
        self.destination = Some(name.to_string());
        Ok(self)
    }

    /// Override the reply timeout taken from the bus configuration.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn spec(&self) -> &InterfaceSpec {
        &self.spec
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call `method` (Rust-side or member name) with `args`.
    ///
    /// Arguments are checked against the declared input signature before
    /// anything is sent. Methods declared no-reply return no values as soon
    /// as the call is sent.
    pub async fn call(&self, method: &str, args: Vec<Value<'_>>) -> Result<Args> {
        let spec = self
            .spec
            .method(method)
            .ok_or_else(|| Error::UnknownMethod(method.to_string()))?;
        spec.check_args(&args)?;

        let destination = self.destination.as_deref();
        let interface = Some(self.spec.name());

        if spec.flags().contains(MethodFlags::NO_REPLY) {
            self.connection
                .send_no_reply(destination, &self.path, interface, spec.member(), args)
                .await?;
            return Ok(Args::default());
        }

        debug!(
            "Calling {}.{} on {:?} at {}",
            self.spec.name(),
            spec.member(),
            destination,
            self.path
        );
        let reply = self
            .connection
            .call(
                destination,
                &self.path,
                interface,
                spec.member(),
                args,
                self.timeout,
            )
            .await?;

        let body = reply.body();
        if body.signature() != spec.result() {
            return Err(Error::ReplySignatureMismatch {
                expected: spec.result_signature().to_string(),
                found: body.signature().to_string(),
            });
        }
        Ok(Args::new(body_values(&reply, spec.result_types())?))
    }

    /// Call a method declared with exactly one result and convert it.
    pub async fn call_single<T>(&self, method: &str, args: Vec<Value<'_>>) -> Result<T>
    where
        T: TryFrom<Value<'static>>,
        T::Error: Into<zvariant::Error>,
    {
        Ok(self.call(method, args).await?.single()?)
    }
}
