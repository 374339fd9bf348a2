//! A zbus connection that serves exported objects and makes checked calls.

use crate::config::BusConfig;
use crate::error::{Error, MethodError, Result};
use crate::interface::{with_current_message, Call, HandlerError, Interface};
use crate::names::is_valid_error_name;
use crate::object::{ObjectServer, Request, Resolution};
use crate::value::{body_values, into_body, signature_of, Args};
use futures_util::{FutureExt, StreamExt};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zbus::connection::Builder;
use zbus::message::{self, Flags};
use zbus::zvariant::Value;
use zbus::{Guid, Message, MessageStream};

/// A server-side failure that the caller only sees as a generic `Failed`
/// error: an internal handler error, a panic, or a result that does not
/// match the declared result signature.
#[derive(Debug)]
pub struct UnhandledError {
    pub path: String,
    pub interface: String,
    pub member: String,
    pub error: anyhow::Error,
}

impl UnhandledError {
    /// The underlying error, if it is of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

impl fmt::Display for UnhandledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} at {} failed: {:#}",
            self.interface, self.member, self.path, self.error
        )
    }
}

type ErrorHandler = Arc<dyn Fn(&UnhandledError) + Send + Sync>;

fn default_error_handler() -> ErrorHandler {
    Arc::new(|err: &UnhandledError| error!("Unhandled error in method handler: {}", err))
}

/// A D-Bus connection serving exported interfaces. Clones share the same
/// connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    conn: zbus::Connection,
    config: BusConfig,
    objects: RwLock<ObjectServer>,
    error_handler: RwLock<ErrorHandler>,
    closed: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Wrap an established zbus connection and start serving calls on it.
    pub fn new(conn: zbus::Connection, config: BusConfig) -> Self {
        let stream = MessageStream::from(&conn);
        let inner = Arc::new(ConnectionInner {
            conn,
            config,
            objects: RwLock::new(ObjectServer::new()),
            error_handler: RwLock::new(default_error_handler()),
            closed: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
        });
        let handle = tokio::spawn(dispatch_loop(Arc::downgrade(&inner), stream));
        *inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Self { inner }
    }

    /// Connect to the bus named by `config.address`: `session`, `system`, or
    /// a D-Bus address such as `unix:path=/run/user/1000/bus`.
    pub async fn connect(config: BusConfig) -> Result<Self> {
        config.validate()?;
        let builder = match config.address.as_str() {
            "session" => Builder::session()?,
            "system" => Builder::system()?,
            address => Builder::address(address)?,
        };
        let conn = builder.max_queued(config.max_queued).build().await?;
        info!(
            "Connected to {} as {:?}",
            config.address,
            conn.unique_name().map(|name| name.as_str())
        );
        Ok(Self::new(conn, config))
    }

    /// Two connections joined peer to peer over a socket pair, with no bus
    /// daemon in between. Returns `(server, client)`.
    pub async fn pair(config: BusConfig) -> Result<(Self, Self)> {
        config.validate()?;
        let guid = Guid::generate();
        let (server_end, client_end) = UnixStream::pair()?;
        let (server, client) = tokio::try_join!(
            Builder::unix_stream(server_end)
                .server(guid)?
                .p2p()
                .max_queued(config.max_queued)
                .build(),
            Builder::unix_stream(client_end)
                .p2p()
                .max_queued(config.max_queued)
                .build(),
        )?;
        debug!("Opened peer-to-peer connection pair");
        Ok((Self::new(server, config.clone()), Self::new(client, config)))
    }

    /// Unique bus name, if connected through a bus daemon.
    pub fn unique_name(&self) -> Option<&str> {
        self.inner.conn.unique_name().map(|name| name.as_str())
    }

    pub fn zbus_connection(&self) -> &zbus::Connection {
        &self.inner.conn
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Call a method and wait for its reply, using the configured timeout.
    ///
    /// Error replies become [`Error::Method`].
    pub async fn call_method(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
        args: Vec<Value<'_>>,
    ) -> Result<Args> {
        let timeout = self.inner.config.method_call_timeout();
        let reply = self
            .call(destination, path, interface, member, args, timeout)
            .await?;
        Ok(Args::new(body_values(&reply, &[])?))
    }

    pub(crate) async fn call(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
        args: Vec<Value<'_>>,
        timeout: Duration,
    ) -> Result<Message> {
        self.ensure_open()?;
        let body = into_body(args)?;
        let conn = &self.inner.conn;
        let call = async {
            match &body {
                Some(body) => {
                    conn.call_method(destination, path, interface, member, body)
                        .await
                }
                None => {
                    conn.call_method(destination, path, interface, member, &())
                        .await
                }
            }
        };
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) if self.is_closed() => Err(Error::Disconnected),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                debug!("Call {} at {} timed out after {:?}", member, path, timeout);
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Send a call flagged as expecting no reply.
    pub(crate) async fn send_no_reply(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
        args: Vec<Value<'_>>,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut builder = Message::method_call(path, member)?.with_flags(Flags::NoReplyExpected)?;
        if let Some(destination) = destination {
            builder = builder.destination(destination)?;
        }
        if let Some(interface) = interface {
            builder = builder.interface(interface)?;
        }
        let msg = match into_body(args)? {
            Some(body) => builder.build(&body)?,
            None => builder.build(&())?,
        };
        self.inner.conn.send(&msg).await?;
        Ok(())
    }

    /// Serve `interface` at `path`.
    pub fn export(&self, path: &str, interface: Interface) -> Result<()> {
        let name = interface.name().to_string();
        self.inner
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add(path, interface)?;
        info!("Exported {} at {}", name, path);
        Ok(())
    }

    /// Stop serving `interface` at `path`. Returns false if it was not exported.
    pub fn unexport(&self, path: &str, interface: &str) -> bool {
        let removed = self
            .inner
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path, interface);
        if removed {
            info!("Unexported {} at {}", interface, path);
        }
        removed
    }

    /// Replace the hook that receives failures not expressed as named errors.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&UnhandledError) + Send + Sync + 'static,
    {
        *self
            .inner
            .error_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    /// Stop serving and close the connection. Later calls on any clone fail
    /// with [`Error::Disconnected`].
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.stop_dispatcher();
        self.inner.conn.clone().close().await?;
        info!("Connection closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::Disconnected)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("unique_name", &self.unique_name())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionInner {
    fn stop_dispatcher(&self) {
        if let Some(handle) = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    fn report(&self, err: &UnhandledError) {
        let handler = self
            .error_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        handler(err);
    }

    /// Answer `call`, unless the caller asked for no reply.
    async fn reply(
        &self,
        call: &Message,
        no_reply: bool,
        result: std::result::Result<Vec<Value<'static>>, MethodError>,
    ) {
        if no_reply {
            return;
        }
        let header = call.header();
        let sent: zbus::Result<()> = match result {
            Ok(values) => match into_body(values) {
                Ok(Some(body)) => self.conn.reply(&header, &body).await,
                Ok(None) => self.conn.reply(&header, &()).await,
                Err(err) => Err(err.into()),
            },
            Err(err) => {
                self.conn
                    .reply_error(&header, err.name(), &err.wire_message())
                    .await
            }
        };
        if let Err(err) = sent {
            warn!("Failed to send reply to {:?}: {}", header.sender(), err);
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.stop_dispatcher();
    }
}

async fn dispatch_loop(inner: Weak<ConnectionInner>, mut stream: MessageStream) {
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                warn!("Failed to read message: {}", err);
                continue;
            }
        };
        if msg.message_type() != message::Type::MethodCall {
            continue;
        }
        let Some(conn) = inner.upgrade() else {
            break;
        };
        if conn.closed.load(Ordering::Acquire) {
            break;
        }
        tokio::spawn(handle_call(conn, msg));
    }
    debug!("Dispatcher stopped");
}

async fn handle_call(conn: Arc<ConnectionInner>, msg: Message) {
    let (path, interface, member, sender, no_reply) = {
        let header = msg.header();
        (
            header
                .path()
                .map(|path| path.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            header.interface().map(|name| name.to_string()),
            header
                .member()
                .map(|name| name.to_string())
                .unwrap_or_default(),
            header.sender().map(|name| name.to_string()),
            header.primary().flags().contains(Flags::NoReplyExpected),
        )
    };

    let resolution = {
        let body = msg.body();
        let request = Request {
            path: &path,
            interface: interface.as_deref(),
            member: &member,
            signature: body.signature(),
        };
        conn.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(request, &conn.config.machine_id)
    };

    let dispatch = match resolution {
        Resolution::Reply(result) => {
            if let Err(err) = &result {
                debug!("Rejecting {} from {:?}: {}", member, sender, err);
            }
            conn.reply(&msg, no_reply, result).await;
            return;
        }
        Resolution::Dispatch(dispatch) => dispatch,
    };

    let args = match body_values(&msg, dispatch.method.input_types()) {
        Ok(values) => Args::new(values),
        Err(err) => {
            conn.reply(&msg, no_reply, Err(MethodError::invalid_args(err.to_string())))
                .await;
            return;
        }
    };

    debug!(
        "Dispatching {}.{} from {:?}",
        dispatch.interface, member, sender
    );
    let call = Call::new(
        msg.clone(),
        path.clone(),
        dispatch.interface.clone(),
        member.clone(),
        args,
    );
    let handler_future = (dispatch.handler)(call);
    let outcome = AssertUnwindSafe(with_current_message(msg.clone(), handler_future))
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(values)) => match dispatch.method.check_results(&values) {
            Ok(()) => {
                conn.reply(&msg, no_reply, Ok(values)).await;
                return;
            }
            Err(_) => anyhow::Error::new(Error::ReplySignatureMismatch {
                expected: dispatch.method.result_signature().to_string(),
                found: signature_of(values.iter()),
            }),
        },
        Ok(Err(HandlerError::Dbus(err))) if is_valid_error_name(err.name()) => {
            conn.reply(&msg, no_reply, Err(err)).await;
            return;
        }
        Ok(Err(HandlerError::Dbus(err))) => {
            anyhow::anyhow!("Handler returned invalid error name '{}'", err.name())
        }
        Ok(Err(HandlerError::Internal(err))) => err,
        Err(panic) => anyhow::anyhow!("Handler panicked: {}", panic_message(panic.as_ref())),
    };

    // Report before replying so the hook has run by the time the caller sees
    // the error.
    conn.report(&UnhandledError {
        path,
        interface: dispatch.interface,
        member,
        error: failure,
    });
    conn.reply(&msg, no_reply, Err(MethodError::failed(""))).await;
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}
