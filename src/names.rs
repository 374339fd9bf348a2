//! Naming helpers on top of the `zbus::names` validators.

use crate::error::Result;
use zbus::names::{BusName, ErrorName, InterfaceName, MemberName};
use zbus::zvariant::ObjectPath;

pub fn validate_object_path(path: &str) -> Result<()> {
    ObjectPath::try_from(path)?;
    Ok(())
}

pub fn validate_interface_name(name: &str) -> Result<()> {
    InterfaceName::try_from(name)?;
    Ok(())
}

pub fn validate_member_name(name: &str) -> Result<()> {
    MemberName::try_from(name)?;
    Ok(())
}

/// Accepts unique names (`:1.42`) and well-known names (`org.example.Service`).
pub fn validate_bus_name(name: &str) -> Result<()> {
    BusName::try_from(name)?;
    Ok(())
}

pub fn is_valid_error_name(name: &str) -> bool {
    ErrorName::try_from(name).is_ok()
}

/// Derive a D-Bus member name from a Rust method name.
///
/// `signature_mismatch` becomes `SignatureMismatch`. Names that are already
/// CamelCase pass through unchanged.
pub fn member_name_from_method(name: &str) -> String {
    name.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// First segment of `descendant` below `path`, if it lies strictly beneath it.
pub fn child_toward<'a>(path: &str, descendant: &'a str) -> Option<&'a str> {
    let rest = if path == "/" {
        descendant.strip_prefix('/')?
    } else {
        descendant.strip_prefix(path)?.strip_prefix('/')?
    };
    rest.split('/').next().filter(|segment| !segment.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_object_paths() {
        assert!(validate_object_path("/").is_ok());
        assert!(validate_object_path("/org/example/Thing_1").is_ok());
        assert!(validate_object_path("org").is_err());
        assert!(validate_object_path("/org/").is_err());
        assert!(validate_object_path("/org/ex-ample").is_err());
    }

    #[test]
    fn test_child_toward() {
        assert_eq!(child_toward("/", "/org"), Some("org"));
        assert_eq!(child_toward("/", "/org/example/Thing"), Some("org"));
        assert_eq!(child_toward("/org", "/org/example/Thing"), Some("example"));
        assert_eq!(child_toward("/", "/"), None);
        assert_eq!(child_toward("/org", "/org"), None);
        assert_eq!(child_toward("/org", "/organic"), None);
    }

    #[test]
    fn test_names() {
        assert!(validate_interface_name("org.example.test").is_ok());
        assert!(matches!(
            validate_interface_name("org"),
            Err(Error::Name(_))
        ));
        assert!(validate_member_name("SignatureMismatch").is_ok());
        assert!(validate_member_name("Get.Thing").is_err());
        assert!(validate_bus_name("org.test").is_ok());
        assert!(validate_bus_name(":1.42").is_ok());
        assert!(validate_bus_name("org").is_err());
        assert!(is_valid_error_name("org.example.Error.Bad"));
        assert!(!is_valid_error_name("Bad"));
    }

    #[test]
    fn test_member_name_from_method() {
        assert_eq!(member_name_from_method("signature_mismatch"), "SignatureMismatch");
        assert_eq!(member_name_from_method("ping"), "Ping");
        assert_eq!(member_name_from_method("GetAll"), "GetAll");
        assert_eq!(member_name_from_method("_private_thing"), "PrivateThing");
    }
}
