//! Exported objects and routing of incoming calls to their handlers.

use crate::error::{Error, MethodError, Result};
use crate::interface::{Handler, Interface, MethodSpec};
use crate::introspect::{self, INTROSPECTABLE, PEER};
use crate::names::{child_toward, validate_object_path};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use zbus::zvariant::{Signature, Value};

/// Header fields of an incoming call that routing looks at.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Request<'a> {
    pub path: &'a str,
    pub interface: Option<&'a str>,
    pub member: &'a str,
    pub signature: &'a Signature,
}

/// What to do with an incoming method call.
pub(crate) enum Resolution {
    /// Answer immediately without running user code.
    Reply(std::result::Result<Vec<Value<'static>>, MethodError>),
    /// Run a handler.
    Dispatch(Dispatch),
}

pub(crate) struct Dispatch {
    pub interface: String,
    pub handler: Handler,
    pub method: MethodSpec,
}

/// Interfaces exported per object path.
#[derive(Default)]
pub struct ObjectServer {
    objects: BTreeMap<String, BTreeMap<String, Arc<Interface>>>,
}

impl ObjectServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: &str, interface: Interface) -> Result<()> {
        validate_object_path(path)?;
        let interfaces = self.objects.entry(path.to_string()).or_default();
        if interfaces.contains_key(interface.name()) {
            return Err(Error::AlreadyExported {
                path: path.to_string(),
                interface: interface.name().to_string(),
            });
        }
        interfaces.insert(interface.name().to_string(), Arc::new(interface));
        Ok(())
    }

    /// Returns false if nothing was exported under that name.
    pub fn remove(&mut self, path: &str, interface: &str) -> bool {
        let Some(interfaces) = self.objects.get_mut(path) else {
            return false;
        };
        let removed = interfaces.remove(interface).is_some();
        if interfaces.is_empty() {
            self.objects.remove(path);
        }
        removed
    }

    pub fn contains(&self, path: &str, interface: &str) -> bool {
        self.objects
            .get(path)
            .is_some_and(|interfaces| interfaces.contains_key(interface))
    }

    /// Names of the nodes one level below `path` that lead to exported objects.
    pub fn children(&self, path: &str) -> Vec<String> {
        let names: BTreeSet<&str> = self
            .objects
            .keys()
            .filter_map(|exported| child_toward(path, exported))
            .collect();
        names.into_iter().map(str::to_string).collect()
    }

    /// Introspection data for `path`, or `None` if nothing lives at or below it.
    pub fn introspect(&self, path: &str) -> Option<String> {
        let children = self.children(path);
        let interfaces = self.objects.get(path);
        if interfaces.is_none() && children.is_empty() && path != "/" {
            return None;
        }
        let specs = interfaces
            .into_iter()
            .flat_map(|interfaces| interfaces.values().map(|interface| interface.spec()));
        Some(introspect::node_xml(
            specs,
            children.iter().map(String::as_str),
        ))
    }

    pub(crate) fn resolve(&self, request: Request<'_>, machine_id: &str) -> Resolution {
        Resolution::Reply(Err(match self.lookup(request, machine_id) {
            Ok(resolution) => return resolution,
            Err(err) => err,
        }))
    }

    fn lookup(
        &self,
        request: Request<'_>,
        machine_id: &str,
    ) -> std::result::Result<Resolution, MethodError> {
        let Request {
            path,
            interface,
            member,
            ..
        } = request;

        let standard = |name: &str, members: &[&str]| match interface {
            Some(interface) => interface == name,
            None => members.contains(&member),
        };

        if standard(PEER, &["Ping", "GetMachineId"]) {
            expect_no_args(request, PEER)?;
            return match member {
                "Ping" => Ok(Resolution::Reply(Ok(Vec::new()))),
                "GetMachineId" => Ok(Resolution::Reply(Ok(vec![Value::from(
                    machine_id.to_string(),
                )]))),
                _ => Err(MethodError::unknown_method(member, Some(PEER))),
            };
        }

        if standard(INTROSPECTABLE, &["Introspect"]) {
            if member != "Introspect" {
                return Err(MethodError::unknown_method(member, Some(INTROSPECTABLE)));
            }
            expect_no_args(request, INTROSPECTABLE)?;
            let xml = self
                .introspect(path)
                .ok_or_else(|| MethodError::unknown_object(path))?;
            return Ok(Resolution::Reply(Ok(vec![Value::from(xml)])));
        }

        let interfaces = self
            .objects
            .get(path)
            .ok_or_else(|| MethodError::unknown_object(path))?;

        let (name, (spec, handler)) = match interface {
            Some(name) => {
                let iface = interfaces
                    .get(name)
                    .ok_or_else(|| MethodError::unknown_interface(name))?;
                let found = iface
                    .lookup(member)
                    .ok_or_else(|| MethodError::unknown_method(member, Some(name)))?;
                (name, found)
            }
            None => interfaces
                .iter()
                .find_map(|(name, iface)| iface.lookup(member).map(|found| (name.as_str(), found)))
                .ok_or_else(|| MethodError::unknown_method(member, None))?,
        };

        if request.signature != spec.input() {
            return Err(invalid_args(request, name, spec.input_signature()));
        }

        Ok(Resolution::Dispatch(Dispatch {
            interface: name.to_string(),
            handler: Arc::clone(handler),
            method: spec.clone(),
        }))
    }
}

fn expect_no_args(request: Request<'_>, interface: &str) -> std::result::Result<(), MethodError> {
    if request.signature.to_string().is_empty() {
        Ok(())
    } else {
        Err(invalid_args(request, interface, ""))
    }
}

fn invalid_args(request: Request<'_>, interface: &str, expected: &str) -> MethodError {
    MethodError::invalid_args(format!(
        "Invalid arguments '{}' to call {}.{}(), expecting '{}'.",
        request.signature, interface, request.member, expected
    ))
}
