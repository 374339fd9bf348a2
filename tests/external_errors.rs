//! Failures inside method handlers as seen by the caller and by the server's
//! unhandled-error hook.

use busrpc::config::BusConfig;
use busrpc::{
    ArgError, Call, Connection, Error, HandlerResult, Interface, InterfaceSpec, MethodSpec, Proxy,
    UnhandledError, Value,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

const NEVER_USED: &str = "never used";

fn interface_spec() -> InterfaceSpec {
    InterfaceSpec::new("org.example.test")
        .unwrap()
        .with_method(
            MethodSpec::builder("signature_mismatch")
                .input_signature("")
                .result_signature("s")
                .build()
                .unwrap(),
        )
        .unwrap()
}

/// Expects an argument the declared signature never delivers.
async fn signature_mismatch(call: Call) -> HandlerResult {
    let _wrong_param: String = call.arg(0)?;
    Ok(vec![Value::from(NEVER_USED)])
}

/// What the hook saw, minus the error itself.
#[derive(Debug)]
struct Reported {
    path: String,
    interface: String,
    member: String,
    arg_error: bool,
}

struct Harness {
    _server: Connection,
    proxy: Proxy,
    unhandled: Arc<Mutex<Vec<Reported>>>,
}

async fn setup() -> Harness {
    let (server, client) = Connection::pair(BusConfig::default()).await.unwrap();

    let object = Interface::builder(interface_spec())
        .handler("signature_mismatch", signature_mismatch)
        .unwrap()
        .build()
        .unwrap();
    server.export("/", object).unwrap();

    let unhandled = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&unhandled);
    server.set_error_handler(move |err: &UnhandledError| {
        sink.lock().unwrap().push(Reported {
            path: err.path.clone(),
            interface: err.interface.clone(),
            member: err.member.clone(),
            arg_error: err.downcast_ref::<ArgError>().is_some(),
        });
    });

    let proxy = Proxy::new(&client, "/", interface_spec()).unwrap();

    Harness {
        _server: server,
        proxy,
        unhandled,
    }
}

#[tokio::test]
async fn test_signature_mismatch() {
    let harness = setup().await;

    let result = timeout(
        Duration::from_secs(5),
        harness.proxy.call("signature_mismatch", vec![]),
    )
    .await
    .expect("call timed out");

    let err = result.unwrap_err();
    let method_err = err.method_error().expect("expected an error reply");
    assert!(method_err.is_failed());
    assert_eq!(method_err.name(), "org.freedesktop.DBus.Error.Failed");
    assert_eq!(method_err.message(), "");

    let unhandled = harness.unhandled.lock().unwrap();
    assert_eq!(unhandled.len(), 1);
    assert!(unhandled[0].arg_error);
    assert_eq!(unhandled[0].member, "SignatureMismatch");
    assert_eq!(unhandled[0].interface, "org.example.test");
    assert_eq!(unhandled[0].path, "/");
}

#[tokio::test]
async fn test_every_failure_reaches_hook() {
    let harness = setup().await;

    for _ in 0..3 {
        let err = harness
            .proxy
            .call("signature_mismatch", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Method(ref e) if e.is_failed()));
    }
    assert_eq!(harness.unhandled.lock().unwrap().len(), 3);
}
