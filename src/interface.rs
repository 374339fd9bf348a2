//! Method declarations and server-side interface implementations.
//!
//! A [`MethodSpec`] pins a method's D-Bus member name and its input and
//! result signatures. An [`InterfaceSpec`] groups them under an interface
//! name and is shared by both sides: [`Interface`] attaches async handlers
//! for exporting, [`Proxy`](crate::proxy::Proxy) validates outgoing calls
//! against it.
//!
//! # Usage
//!
//! ```ignore
//! let spec = InterfaceSpec::new("org.example.Greeter")?.with_method(
//!     MethodSpec::builder("greet")
//!         .input_signature("s")
//!         .result_signature("s")
//!         .build()?,
//! )?;
//!
//! async fn greet(call: Call) -> HandlerResult {
//!     let name: String = call.arg(0)?;
//!     Ok(vec![Value::from(format!("Hello, {name}"))])
//! }
//!
//! let object = Interface::builder(spec).handler("greet", greet)?.build()?;
//! connection.export("/org/example/Greeter", object)?;
//! ```

use crate::error::{Error, MethodError, Result};
use crate::names::{member_name_from_method, validate_interface_name, validate_member_name};
use crate::value::{check_values, complete_types, ArgError, Args};
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::ops::BitOr;
use std::sync::Arc;
use thiserror::Error;
use zbus::zvariant::{self, Signature, Value};
use zbus::Message;

/// Per-method behaviour flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodFlags(u8);

impl MethodFlags {
    pub const NONE: Self = Self(0);
    /// Callers send without waiting for a reply.
    pub const NO_REPLY: Self = Self(0x1);
    /// Annotated as deprecated in introspection data.
    pub const DEPRECATED: Self = Self(0x2);
    /// Callable but omitted from introspection data.
    pub const HIDDEN: Self = Self(0x4);
    pub const UNPRIVILEGED: Self = Self(0x8);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for MethodFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A validated signature, kept both parsed and split into complete types.
#[derive(Debug, Clone, PartialEq)]
struct Declared {
    text: String,
    signature: Signature,
    types: Vec<String>,
}

impl Declared {
    fn parse(method: &str, text: &str) -> Result<Self> {
        let signature = Signature::try_from(text).map_err(zvariant::Error::SignatureParse)?;
        if text.contains('h') {
            return Err(Error::Declaration(format!(
                "{method}: unix fd arguments are not supported"
            )));
        }
        Ok(Self {
            text: text.to_string(),
            signature,
            types: complete_types(text),
        })
    }
}

/// Declaration of one D-Bus method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSpec {
    name: String,
    member: String,
    input: Declared,
    result: Declared,
    input_names: Vec<String>,
    result_names: Vec<String>,
    flags: MethodFlags,
}

impl MethodSpec {
    /// Start declaring a method. `name` is the Rust-side name; the D-Bus
    /// member defaults to its CamelCase form.
    pub fn builder(name: impl Into<String>) -> MethodSpecBuilder {
        MethodSpecBuilder {
            name: name.into(),
            member: None,
            input: String::new(),
            result: String::new(),
            input_names: Vec::new(),
            result_names: Vec::new(),
            flags: MethodFlags::NONE,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn input_signature(&self) -> &str {
        &self.input.text
    }

    pub fn result_signature(&self) -> &str {
        &self.result.text
    }

    /// Complete types of the input signature, one per argument.
    pub fn input_types(&self) -> &[String] {
        &self.input.types
    }

    pub fn result_types(&self) -> &[String] {
        &self.result.types
    }

    pub(crate) fn input(&self) -> &Signature {
        &self.input.signature
    }

    pub(crate) fn result(&self) -> &Signature {
        &self.result.signature
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn result_names(&self) -> &[String] {
        &self.result_names
    }

    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    /// Check call arguments against the input signature.
    pub fn check_args(&self, args: &[Value<'_>]) -> Result<(), ArgError> {
        check_values(&self.input.types, args)
    }

    /// Check handler results against the result signature.
    pub fn check_results(&self, results: &[Value<'_>]) -> Result<(), ArgError> {
        check_values(&self.result.types, results)
    }
}

pub struct MethodSpecBuilder {
    name: String,
    member: Option<String>,
    input: String,
    result: String,
    input_names: Vec<String>,
    result_names: Vec<String>,
    flags: MethodFlags,
}

impl MethodSpecBuilder {
    pub fn input_signature(mut self, signature: &str) -> Self {
        self.input = signature.to_string();
        self
    }

    pub fn result_signature(mut self, signature: &str) -> Self {
        self.result = signature.to_string();
        self
    }

    pub fn input_names<I>(mut self, names: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.input_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn result_names<I>(mut self, names: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.result_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn flags(mut self, flags: MethodFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Override the derived D-Bus member name.
    pub fn member_name(mut self, member: &str) -> Self {
        self.member = Some(member.to_string());
        self
    }

    pub fn build(self) -> Result<MethodSpec> {
        let input = Declared::parse(&self.name, &self.input)?;
        let result = Declared::parse(&self.name, &self.result)?;
        let member = self
            .member
            .unwrap_or_else(|| member_name_from_method(&self.name));
        validate_member_name(&member)?;

        if !self.input_names.is_empty() && self.input_names.len() != input.types.len() {
            return Err(Error::Declaration(format!(
                "{}: {} input names for signature '{}'",
                self.name,
                self.input_names.len(),
                input.text
            )));
        }
        if !self.result_names.is_empty() && self.result_names.len() != result.types.len() {
            return Err(Error::Declaration(format!(
                "{}: {} result names for signature '{}'",
                self.name,
                self.result_names.len(),
                result.text
            )));
        }
        if self.flags.contains(MethodFlags::NO_REPLY) && !result.types.is_empty() {
            return Err(Error::Declaration(format!(
                "{}: no-reply method cannot return '{}'",
                self.name, result.text
            )));
        }

        Ok(MethodSpec {
            name: self.name,
            member,
            input,
            result,
            input_names: self.input_names,
            result_names: self.result_names,
            flags: self.flags,
        })
    }
}

/// A named set of method declarations.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceSpec {
    name: String,
    methods: Vec<MethodSpec>,
}

impl InterfaceSpec {
    pub fn new(name: &str) -> Result<Self> {
        validate_interface_name(name)?;
        Ok(Self {
            name: name.to_string(),
            methods: Vec::new(),
        })
    }

    pub fn with_method(mut self, method: MethodSpec) -> Result<Self> {
        if self.methods.iter().any(|m| m.member == method.member) {
            return Err(Error::Declaration(format!(
                "{} declares {} twice",
                self.name, method.member
            )));
        }
        self.methods.push(method);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[MethodSpec] {
        &self.methods
    }

    /// Look up a method by its Rust-side name or its D-Bus member name.
    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods
            .iter()
            .find(|m| m.name == name)
            .or_else(|| self.methods.iter().find(|m| m.member == name))
    }
}

/// Failure of a method handler.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Sent to the caller as an error reply with this name and message.
    #[error(transparent)]
    Dbus(#[from] MethodError),

    /// Anything else. The caller receives a generic `Failed` error and the
    /// connection's unhandled-error hook receives this error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ArgError> for HandlerError {
    fn from(err: ArgError) -> Self {
        HandlerError::Internal(anyhow::Error::new(err))
    }
}

pub type HandlerResult = std::result::Result<Vec<Value<'static>>, HandlerError>;

pub(crate) type Handler = Arc<dyn Fn(Call) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// An incoming method call as seen by a handler.
#[derive(Debug)]
pub struct Call {
    message: Message,
    path: String,
    interface: String,
    member: String,
    args: Args,
}

impl Call {
    pub(crate) fn new(
        message: Message,
        path: String,
        interface: String,
        member: String,
        args: Args,
    ) -> Self {
        Self {
            message,
            path,
            interface,
            member,
            args,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    /// Unique name of the caller. Peer-to-peer connections have none.
    pub fn sender(&self) -> Option<String> {
        self.message.header().sender().map(|name| name.to_string())
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    /// Typed access to argument `index`.
    pub fn arg<T>(&self, index: usize) -> Result<T, ArgError>
    where
        T: TryFrom<Value<'static>>,
        T::Error: Into<zvariant::Error>,
    {
        self.args.get(index)
    }
}

tokio::task_local! {
    static CURRENT_MESSAGE: Message;
}

/// The request being served, when called from inside a method handler.
pub fn current_message() -> Option<Message> {
    CURRENT_MESSAGE.try_with(Message::clone).ok()
}

pub(crate) async fn with_current_message<F: Future>(message: Message, fut: F) -> F::Output {
    CURRENT_MESSAGE.scope(message, fut).await
}

/// An interface implementation ready to be exported.
pub struct Interface {
    spec: InterfaceSpec,
    handlers: HashMap<String, Handler>,
}

impl Interface {
    pub fn builder(spec: InterfaceSpec) -> InterfaceBuilder {
        InterfaceBuilder {
            spec,
            handlers: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.spec.name()
    }

    pub fn spec(&self) -> &InterfaceSpec {
        &self.spec
    }

    pub(crate) fn lookup(&self, member: &str) -> Option<(&MethodSpec, &Handler)> {
        let spec = self.spec.methods.iter().find(|m| m.member == member)?;
        let handler = self.handlers.get(member)?;
        Some((spec, handler))
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("spec", &self.spec)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

pub struct InterfaceBuilder {
    spec: InterfaceSpec,
    handlers: HashMap<String, Handler>,
}

impl InterfaceBuilder {
    /// Attach the handler for `method` (Rust-side or member name).
    pub fn handler<F, Fut>(mut self, method: &str, handler: F) -> Result<Self>
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let member = self
            .spec
            .method(method)
            .ok_or_else(|| Error::UnknownMethod(method.to_string()))?
            .member
            .clone();
        let handler: Handler = Arc::new(move |call| handler(call).boxed());
        self.handlers.insert(member, handler);
        Ok(self)
    }

    /// Finish, requiring a handler for every declared method.
    pub fn build(self) -> Result<Interface> {
        if let Some(missing) = self
            .spec
            .methods
            .iter()
            .find(|m| !self.handlers.contains_key(&m.member))
        {
            return Err(Error::MissingHandler {
                interface: self.spec.name.clone(),
                method: missing.name.clone(),
            });
        }
        Ok(Interface {
            spec: self.spec,
            handlers: self.handlers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_spec() -> MethodSpec {
        MethodSpec::builder("echo")
            .input_signature("s")
            .result_signature("s")
            .input_names(["text"])
            .result_names(["echoed"])
            .build()
            .unwrap()
    }

    async fn echo(call: Call) -> HandlerResult {
        let text: String = call.arg(0)?;
        Ok(vec![Value::from(text)])
    }

    fn echo_call(args: Args) -> Call {
        let message = Message::method_call("/", "Echo")
            .unwrap()
            .interface("org.example.test")
            .unwrap()
            .build(&())
            .unwrap();
        Call::new(
            message,
            "/".into(),
            "org.example.test".into(),
            "Echo".into(),
            args,
        )
    }

    #[test]
    fn test_member_name_is_derived() {
        let spec = MethodSpec::builder("signature_mismatch")
            .result_signature("s")
            .build()
            .unwrap();
        assert_eq!(spec.member(), "SignatureMismatch");
        assert!(spec.input_signature().is_empty());
        assert!(spec.input_types().is_empty());
        assert_eq!(spec.result_types(), ["s"]);

        let spec = MethodSpec::builder("x").member_name("Custom").build().unwrap();
        assert_eq!(spec.member(), "Custom");
    }

    #[test]
    fn test_builder_validation() {
        assert!(matches!(
            MethodSpec::builder("bad").input_signature("a").build(),
            Err(Error::Variant(_))
        ));
        assert!(matches!(
            MethodSpec::builder("bad").input_signature("h").build(),
            Err(Error::Declaration(_))
        ));
        assert!(matches!(
            MethodSpec::builder("bad")
                .input_signature("ss")
                .input_names(["only_one"])
                .build(),
            Err(Error::Declaration(_))
        ));
        assert!(matches!(
            MethodSpec::builder("bad")
                .result_signature("s")
                .flags(MethodFlags::NO_REPLY)
                .build(),
            Err(Error::Declaration(_))
        ));
        assert!(matches!(
            MethodSpec::builder("x").member_name("not.valid").build(),
            Err(Error::Name(_))
        ));
    }

    #[test]
    fn test_check_args() {
        let spec = echo_spec();
        assert!(spec.check_args(&[Value::from("hi")]).is_ok());
        assert!(matches!(
            spec.check_args(&[]),
            Err(ArgError::Count {
                expected: 1,
                found: 0
            })
        ));
        assert!(matches!(
            spec.check_args(&[Value::from(1u32)]),
            Err(ArgError::TypeMismatch { .. })
        ));
        assert!(spec.check_results(&[Value::from("ok")]).is_ok());
        assert!(spec.check_results(&[]).is_err());
    }

    #[test]
    fn test_interface_spec_lookup() {
        let spec = InterfaceSpec::new("org.example.test")
            .unwrap()
            .with_method(echo_spec())
            .unwrap();
        assert_eq!(spec.method("echo").unwrap().member(), "Echo");
        assert_eq!(spec.method("Echo").unwrap().name(), "echo");
        assert!(spec.method("nope").is_none());
        assert!(spec.clone().with_method(echo_spec()).is_err());
        assert!(InterfaceSpec::new("notdotted").is_err());
    }

    #[test]
    fn test_flags() {
        let flags = MethodFlags::NO_REPLY | MethodFlags::DEPRECATED;
        assert!(flags.contains(MethodFlags::NO_REPLY));
        assert!(flags.contains(MethodFlags::DEPRECATED));
        assert!(!flags.contains(MethodFlags::HIDDEN));
        assert_eq!(flags.bits(), 0x3);
    }

    #[test]
    fn test_build_requires_all_handlers() {
        let spec = InterfaceSpec::new("org.example.test")
            .unwrap()
            .with_method(echo_spec())
            .unwrap();
        let err = Interface::builder(spec.clone()).build().unwrap_err();
        assert!(matches!(err, Error::MissingHandler { .. }));

        assert!(matches!(
            Interface::builder(spec.clone()).handler("unknown", echo),
            Err(Error::UnknownMethod(_))
        ));

        let iface = Interface::builder(spec).handler("echo", echo).unwrap().build().unwrap();
        assert!(iface.lookup("Echo").is_some());
        assert!(iface.lookup("echo").is_none());
    }

    #[tokio::test]
    async fn test_handler_arg_error_is_internal() {
        let result = echo(echo_call(Args::default())).await;
        match result {
            Err(HandlerError::Internal(err)) => {
                assert!(err.downcast_ref::<ArgError>().is_some());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_accessors() {
        let call = echo_call(Args::from_values(&[Value::from("hi")]).unwrap());
        assert_eq!(call.path(), "/");
        assert_eq!(call.interface(), "org.example.test");
        assert_eq!(call.member(), "Echo");
        assert!(call.sender().is_none());
        assert_eq!(call.arg::<String>(0).unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_current_message_scope() {
        assert!(current_message().is_none());
        let call = echo_call(Args::default());
        let seen = with_current_message(call.message().clone(), async { current_message() }).await;
        let seen = seen.unwrap();
        assert_eq!(seen.header().member().unwrap().as_str(), "Echo");
    }
}
