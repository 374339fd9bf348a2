//! Call and reply bodies as lists of `zvariant` values, checked against
//! declared signatures.

use crate::error::Result;
use thiserror::Error;
use zbus::zvariant::{self, OwnedValue, Structure, StructureBuilder, Value};
use zbus::Message;

#[derive(Error, Debug)]
pub enum ArgError {
    #[error("expected argument of type '{expected}', got '{found}'")]
    TypeMismatch { expected: String, found: String },

    #[error("argument {index} missing, message has {count} argument(s)")]
    Missing { index: usize, count: usize },

    #[error("expected {expected} argument(s), got {found}")]
    Count { expected: usize, found: usize },

    #[error("argument {index} cannot be converted: {source}")]
    Conversion {
        index: usize,
        #[source]
        source: zvariant::Error,
    },
}

/// Split a signature into its complete types: `sa{sv}(ii)` gives `s`,
/// `a{sv}` and `(ii)`. The input must already be a valid signature.
pub fn complete_types(signature: &str) -> Vec<String> {
    let mut types = Vec::new();
    let mut start = 0;
    let mut depth = 0usize;
    for (i, b) in signature.bytes().enumerate() {
        match b {
            b'a' => continue,
            b'(' | b'{' => {
                depth += 1;
                continue;
            }
            b')' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
        if depth == 0 {
            types.push(signature[start..=i].to_string());
            start = i + 1;
        }
    }
    types
}

/// Concatenated signature of `values`.
pub fn signature_of<'a>(values: impl IntoIterator<Item = &'a Value<'a>>) -> String {
    values
        .into_iter()
        .map(|value| value.value_signature().to_string())
        .collect()
}

/// Check `values` one by one against the complete types of a signature.
pub(crate) fn check_values(types: &[String], values: &[Value<'_>]) -> Result<(), ArgError> {
    if values.len() != types.len() {
        return Err(ArgError::Count {
            expected: types.len(),
            found: values.len(),
        });
    }
    for (value, expected) in values.iter().zip(types) {
        let found = value.value_signature().to_string();
        if found != *expected {
            return Err(ArgError::TypeMismatch {
                expected: expected.clone(),
                found,
            });
        }
    }
    Ok(())
}

/// Pack values into a message body. zbus sends the fields of a structure
/// body as separate arguments; no values means an empty body.
pub(crate) fn into_body(values: Vec<Value<'_>>) -> zvariant::Result<Option<Structure<'_>>> {
    if values.is_empty() {
        return Ok(None);
    }
    values
        .into_iter()
        .fold(StructureBuilder::new(), |builder, value| {
            builder.append_field(value)
        })
        .build()
        .map(Some)
}

/// Unpack the body of `message`. `types` are the declared complete types,
/// if known; they decide whether a lone structure is one argument or a
/// list of them.
pub(crate) fn body_values(message: &Message, types: &[String]) -> Result<Vec<OwnedValue>> {
    let body = message.body();
    if body.signature().to_string().is_empty() {
        return Ok(Vec::new());
    }
    let structure: Structure<'_> = body.deserialize()?;

    let lone_struct = match types {
        [only] if only.starts_with('(') => {
            let fields = structure.fields();
            fields.len() != 1 || fields[0].value_signature().to_string() != *only
        }
        _ => false,
    };
    let values = if lone_struct {
        vec![Value::Structure(structure)]
    } else {
        structure.into_fields()
    };

    let owned = values
        .iter()
        .map(Value::try_to_owned)
        .collect::<zvariant::Result<Vec<_>>>()?;
    Ok(owned)
}

/// Ordered values of a call or reply body.
#[derive(Debug, Default)]
pub struct Args {
    values: Vec<OwnedValue>,
}

impl Args {
    pub fn new(values: Vec<OwnedValue>) -> Self {
        Self { values }
    }

    /// Take ownership of borrowed values.
    pub fn from_values(values: &[Value<'_>]) -> zvariant::Result<Self> {
        let values = values
            .iter()
            .map(Value::try_to_owned)
            .collect::<zvariant::Result<Vec<_>>>()?;
        Ok(Self { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OwnedValue> {
        self.values.iter()
    }

    /// Typed access to the argument at `index`.
    pub fn get<T>(&self, index: usize) -> Result<T, ArgError>
    where
        T: TryFrom<Value<'static>>,
        T::Error: Into<zvariant::Error>,
    {
        let value = self.values.get(index).ok_or(ArgError::Missing {
            index,
            count: self.values.len(),
        })?;
        convert(index, value)
    }

    /// The only value, for single-result replies.
    pub fn single<T>(&self) -> Result<T, ArgError>
    where
        T: TryFrom<Value<'static>>,
        T::Error: Into<zvariant::Error>,
    {
        match self.values.as_slice() {
            [only] => convert(0, only),
            values => Err(ArgError::Count {
                expected: 1,
                found: values.len(),
            }),
        }
    }

    /// Signature describing these values.
    pub fn signature(&self) -> String {
        signature_of(self.values.iter().map(|value| &**value))
    }

    pub fn into_values(self) -> Vec<OwnedValue> {
        self.values
    }
}

fn convert<T>(index: usize, value: &OwnedValue) -> Result<T, ArgError>
where
    T: TryFrom<Value<'static>>,
    T::Error: Into<zvariant::Error>,
{
    let conversion = |source| ArgError::Conversion { index, source };
    let value: Value<'static> = (**value).try_clone().map_err(conversion)?;
    T::try_from(value).map_err(|err| conversion(err.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_complete_types() {
        assert!(complete_types("").is_empty());
        assert_eq!(complete_types("s"), vec!["s"]);
        assert_eq!(
            complete_types("sa{sv}(ii)aau"),
            vec!["s", "a{sv}", "(ii)", "aau"]
        );
        assert_eq!(complete_types("a(s(ii))v"), vec!["a(s(ii))", "v"]);
    }

    #[test]
    fn test_check_values() {
        let types = complete_types("sas");
        let words = vec!["a".to_string(), "b".to_string()];
        assert!(check_values(&types, &[Value::from("x"), Value::from(words)]).is_ok());
        assert!(matches!(
            check_values(&types, &[Value::from("x")]),
            Err(ArgError::Count {
                expected: 2,
                found: 1
            })
        ));
        match check_values(&types, &[Value::from("x"), Value::from(7u32)]) {
            Err(ArgError::TypeMismatch { expected, found }) => {
                assert_eq!(expected, "as");
                assert_eq!(found, "u");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_signature_of_containers() {
        let mut stats = HashMap::new();
        stats.insert("entries".to_string(), 3u32);
        let values = [
            Value::from(stats),
            Value::new(Value::from(1u8)),
            Value::from(Vec::<String>::new()),
        ];
        assert_eq!(signature_of(values.iter()), "a{su}vas");
    }

    #[test]
    fn test_into_body() {
        assert!(into_body(Vec::new()).unwrap().is_none());
        let body = into_body(vec![Value::from("x"), Value::from(2u32)])
            .unwrap()
            .unwrap();
        assert_eq!(body.fields().len(), 2);
    }

    #[test]
    fn test_args_access() {
        let args = Args::from_values(&[Value::from("key"), Value::from(42u32)]).unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args.signature(), "su");
        assert_eq!(args.get::<String>(0).unwrap(), "key");
        assert_eq!(args.get::<u32>(1).unwrap(), 42);
        assert!(matches!(
            args.get::<String>(2),
            Err(ArgError::Missing { index: 2, count: 2 })
        ));
        assert!(matches!(
            args.get::<u32>(0),
            Err(ArgError::Conversion { index: 0, .. })
        ));
        assert!(matches!(
            args.single::<String>(),
            Err(ArgError::Count { expected: 1, found: 2 })
        ));

        let single = Args::from_values(&[Value::from("only")]).unwrap();
        assert_eq!(single.single::<String>().unwrap(), "only");
        assert!(Args::default().is_empty());
    }
}
