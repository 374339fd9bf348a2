//! `org.freedesktop.DBus.Introspectable` XML generation.

use crate::interface::{InterfaceSpec, MethodFlags, MethodSpec};
use std::fmt::Write;

pub const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";
pub const PEER: &str = "org.freedesktop.DBus.Peer";

const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\
\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

const STANDARD_INTERFACES: &str = concat!(
    " <interface name=\"org.freedesktop.DBus.Peer\">\n",
    "  <method name=\"Ping\"/>\n",
    "  <method name=\"GetMachineId\">\n",
    "   <arg type=\"s\" name=\"machine_uuid\" direction=\"out\"/>\n",
    "  </method>\n",
    " </interface>\n",
    " <interface name=\"org.freedesktop.DBus.Introspectable\">\n",
    "  <method name=\"Introspect\">\n",
    "   <arg name=\"xml_data\" type=\"s\" direction=\"out\"/>\n",
    "  </method>\n",
    " </interface>\n",
);

/// Describe one object: its interfaces and the names of its child nodes.
pub fn node_xml<'a>(
    interfaces: impl IntoIterator<Item = &'a InterfaceSpec>,
    children: impl IntoIterator<Item = &'a str>,
) -> String {
    let mut xml = String::from(DOCTYPE);
    xml.push_str("<node>\n");
    xml.push_str(STANDARD_INTERFACES);
    for interface in interfaces {
        write_interface(&mut xml, interface);
    }
    for child in children {
        let _ = writeln!(xml, " <node name=\"{}\"/>", escape(child));
    }
    xml.push_str("</node>\n");
    xml
}

fn write_interface(xml: &mut String, interface: &InterfaceSpec) {
    let _ = writeln!(xml, " <interface name=\"{}\">", escape(interface.name()));
    for method in interface.methods() {
        if !method.flags().contains(MethodFlags::HIDDEN) {
            write_method(xml, method);
        }
    }
    xml.push_str(" </interface>\n");
}

fn write_method(xml: &mut String, method: &MethodSpec) {
    let _ = writeln!(xml, "  <method name=\"{}\">", escape(method.member()));
    write_args(xml, method.input_types(), method.input_names(), "in");
    write_args(xml, method.result_types(), method.result_names(), "out");
    if method.flags().contains(MethodFlags::DEPRECATED) {
        xml.push_str("   <annotation name=\"org.freedesktop.DBus.Deprecated\" value=\"true\"/>\n");
    }
    if method.flags().contains(MethodFlags::NO_REPLY) {
        xml.push_str(
            "   <annotation name=\"org.freedesktop.DBus.Method.NoReply\" value=\"true\"/>\n",
        );
    }
    xml.push_str("  </method>\n");
}

fn write_args(xml: &mut String, types: &[String], names: &[String], direction: &str) {
    for (i, ty) in types.iter().enumerate() {
        let _ = write!(xml, "   <arg type=\"{}\"", escape(ty));
        if let Some(name) = names.get(i) {
            let _ = write!(xml, " name=\"{}\"", escape(name));
        }
        let _ = writeln!(xml, " direction=\"{direction}\"/>");
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
