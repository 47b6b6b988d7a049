//! Dotted member paths and batched reads

use crate::traits::{ObjectModel, ObjectRef, Value};
use diver_common::{BatchMembersResponse, Error, ObjectOrRemoteAddress, Result};
use tracing::debug;

/// Follow a dotted path like `Owner.Address.City` starting at `root`
pub fn read_path<M: ObjectModel + ?Sized>(model: &M, root: &ObjectRef, path: &str) -> Result<Value> {
    let mut current = Value::Object(root.clone());
    let mut walked = String::new();
    for segment in path.split('.') {
        let segment = segment.trim();
        if segment.is_empty() {
            return Err(Error::Protocol(format!("empty segment in member path '{}'", path)));
        }
        current = match current {
            Value::Object(object) => model.get_member(&object, segment)?,
            Value::Null => {
                return Err(Error::Protocol(format!(
                    "'{}' is null while reading '{}'",
                    walked, path
                )))
            }
            other => {
                return Err(Error::Protocol(format!(
                    "'{}' is a {} and has no member '{}'",
                    walked,
                    other.type_name(),
                    segment
                )))
            }
        };
        if !walked.is_empty() {
            walked.push('.');
        }
        walked.push_str(segment);
    }
    Ok(current)
}

/// Evaluate every path against `root`, one entry per distinct path.
///
/// A failed path yields a null value, type `"null"` and an entry in `errors`; it never fails
/// the batch. `encode` turns a read value into its wire form.
pub fn evaluate_batch<M, F>(
    model: &M,
    root: &ObjectRef,
    paths: &[&str],
    mut encode: F,
) -> BatchMembersResponse
where
    M: ObjectModel + ?Sized,
    F: FnMut(Value) -> Result<ObjectOrRemoteAddress>,
{
    let mut response = BatchMembersResponse::default();
    for path in paths {
        let outcome = read_path(model, root, path).and_then(|value| {
            let type_name = value.type_name();
            encode(value).map(|encoded| (encoded, type_name))
        });
        match outcome {
            Ok((encoded, type_name)) => {
                response.values.insert(path.to_string(), encoded);
                response.types.insert(path.to_string(), type_name);
            }
            Err(e) => {
                debug!(target: "diver_core::members", path, error = %e, "Member path failed");
                response
                    .values
                    .insert(path.to_string(), ObjectOrRemoteAddress::Null);
                response.types.insert(path.to_string(), "null".to_string());
                response.errors.insert(path.to_string(), e.to_string());
            }
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use diver_common::{HeapType, PrimitiveValue, TypeDump};
    use std::collections::HashMap;

    /// Objects 1 (user) -> 2 (owner) with a null manager
    struct Graph {
        members: HashMap<(u64, &'static str), Value>,
    }

    impl Graph {
        fn new() -> Self {
            let mut members = HashMap::new();
            members.insert(
                (1, "Name"),
                Value::Primitive(PrimitiveValue::String("alice".into())),
            );
            members.insert((1, "Owner"), Value::Object(ObjectRef::new(2, "App.Owner")));
            members.insert((1, "Manager"), Value::Null);
            members.insert(
                (2, "Name"),
                Value::Primitive(PrimitiveValue::String("bob".into())),
            );
            Self { members }
        }
    }

    impl ObjectModel for Graph {
        fn get_member(&self, object: &ObjectRef, name: &str) -> Result<Value> {
            self.members
                .iter()
                .find(|((id, member), _)| *id == object.id() && *member == name)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| Error::Protocol(format!("no member {}", name)))
        }

        fn set_member(&self, _: &ObjectRef, _: &str, _: Value) -> Result<()> {
            Err(Error::NotImplemented("read only".into()))
        }

        fn invoke(&self, _: Option<&ObjectRef>, _: &HeapType, _: &str, _: Vec<Value>) -> Result<Option<Value>> {
            Err(Error::NotImplemented("invoke".into()))
        }

        fn construct(&self, _: &HeapType, _: Vec<Value>, _: bool) -> Result<ObjectRef> {
            Err(Error::NotImplemented("construct".into()))
        }

        fn get_item(&self, _: &ObjectRef, _: Value) -> Result<Value> {
            Err(Error::NotImplemented("index".into()))
        }

        fn create_array(&self, _: &HeapType, _: usize) -> Result<ObjectRef> {
            Err(Error::NotImplemented("array".into()))
        }

        fn set_element(&self, _: &ObjectRef, _: usize, _: Value) -> Result<()> {
            Err(Error::NotImplemented("array".into()))
        }

        fn describe_type(&self, _: &HeapType) -> Result<TypeDump> {
            Err(Error::NotImplemented("describe".into()))
        }
    }

    fn encode(value: Value) -> Result<ObjectOrRemoteAddress> {
        Ok(match value {
            Value::Primitive(p) => ObjectOrRemoteAddress::primitive(&p),
            _ => ObjectOrRemoteAddress::Null,
        })
    }

    #[test]
    fn test_read_nested_path() {
        let graph = Graph::new();
        let value = read_path(&graph, &ObjectRef::new(1, "App.User"), "Owner.Name").unwrap();
        assert_eq!(value, Value::Primitive(PrimitiveValue::String("bob".into())));
    }

    #[test]
    fn test_read_through_null() {
        let graph = Graph::new();
        let err = read_path(&graph, &ObjectRef::new(1, "App.User"), "Manager.Name").unwrap_err();
        assert!(err.to_string().contains("Manager"));
    }

    #[test]
    fn test_read_empty_segment() {
        let graph = Graph::new();
        assert!(read_path(&graph, &ObjectRef::new(1, "App.User"), "Owner..Name").is_err());
    }

    #[test]
    fn test_batch_matches_single_reads() {
        let graph = Graph::new();
        let root = ObjectRef::new(1, "App.User");
        let paths = ["Name", "Owner.Name", "Missing"];
        let response = evaluate_batch(&graph, &root, &paths, encode);

        assert_eq!(response.len(), 3);
        assert_eq!(response.types.len(), 3);
        for path in &paths[..2] {
            let single = encode(read_path(&graph, &root, path).unwrap()).unwrap();
            assert_eq!(response.values[*path], single);
        }
        assert_eq!(response.types["Name"], "System.String");
        assert!(response.errors.contains_key("Missing"));
        assert_eq!(response.values["Missing"], ObjectOrRemoteAddress::Null);
    }
}
