//! Fuzz target for method declarations.
//!
//! Any accepted signature must split into complete types that join back to
//! the same text, and the method must introspect without panicking.

#![no_main]

use busrpc::introspect::node_xml;
use busrpc::{InterfaceSpec, MethodSpec};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(method) = MethodSpec::builder("fuzzed").input_signature(s).build() else {
        return;
    };
    assert_eq!(method.input_types().concat(), s);
    assert_eq!(method.input_signature(), s);

    let spec = InterfaceSpec::new("org.example.Fuzz")
        .and_then(|spec| spec.with_method(method))
        .expect("one method on a fresh interface");
    let xml = node_xml([&spec], []);
    assert!(xml.contains("<method name=\"Fuzzed\">"));
});
