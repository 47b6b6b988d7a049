//! Request/response records exchanged between controller and agent
//!
//! The records are plain data; the transport that carries them is not part of this crate.
//! Every record that references a remote object carries both its address and its last-known
//! type name so the agent can revalidate the address after a collection.

use crate::error::Error;
use crate::types::heap::{CandidateObject, RemoteAddress};
use crate::types::object::ObjectOrRemoteAddress;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Separator between paths in a [`BatchMembersRequest`]
pub const PATH_DELIMITER: char = '|';

/// Read a field or property
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldGetRequest {
    pub object_address: RemoteAddress,
    pub type_name: String,
    pub field_name: String,
    /// Identity hash recorded when the address was obtained
    #[serde(default)]
    pub hash_code: Option<i32>,
}

/// Write a field or property
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSetRequest {
    pub object_address: RemoteAddress,
    pub type_name: String,
    pub field_name: String,
    pub value: ObjectOrRemoteAddress,
    #[serde(default)]
    pub hash_code: Option<i32>,
}

/// Construct a new object in the target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtorInvocationRequest {
    pub type_full_name: String,
    #[serde(default)]
    pub parameters: Vec<ObjectOrRemoteAddress>,
    /// Construct on the target's UI thread; objects bound to a thread break when built elsewhere
    #[serde(default)]
    pub force_ui_thread: bool,
}

/// Call a method on a remote object, or a static method when `object_address` is null
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub object_address: RemoteAddress,
    pub type_name: String,
    pub method_name: String,
    #[serde(default)]
    pub parameters: Vec<ObjectOrRemoteAddress>,
    #[serde(default)]
    pub hash_code: Option<i32>,
}

/// Result of a field access, invocation or construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResults {
    pub void_return: bool,
    pub return_value: ObjectOrRemoteAddress,
}

impl InvocationResults {
    pub fn void() -> Self {
        Self {
            void_return: true,
            return_value: ObjectOrRemoteAddress::Null,
        }
    }

    pub fn value(value: ObjectOrRemoteAddress) -> Self {
        Self {
            void_return: false,
            return_value: value,
        }
    }
}

/// Read one item of a remote collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedItemAccessRequest {
    pub collection_address: RemoteAddress,
    pub type_name: String,
    pub index: ObjectOrRemoteAddress,
    /// Pin the returned item so its address stays valid
    #[serde(default)]
    pub pin_request: bool,
    #[serde(default)]
    pub hash_code: Option<i32>,
}

/// Several dotted property paths evaluated against one object in a single round trip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMembersRequest {
    pub object_address: RemoteAddress,
    pub type_name: String,
    /// Paths joined by [`PATH_DELIMITER`], e.g. `Name|Owner.Name|Items.Count`
    pub paths: String,
    #[serde(default)]
    pub hash_code: Option<i32>,
}

impl BatchMembersRequest {
    pub fn new(
        object_address: RemoteAddress,
        type_name: impl Into<String>,
        paths: &[&str],
    ) -> Self {
        Self {
            object_address,
            type_name: type_name.into(),
            paths: paths.join(PATH_DELIMITER.to_string().as_str()),
            hash_code: None,
        }
    }

    /// Individual paths, in request order, blanks dropped
    pub fn path_list(&self) -> Vec<&str> {
        self.paths
            .split(PATH_DELIMITER)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    }
}

/// Parallel maps keyed by path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMembersResponse {
    pub values: HashMap<String, ObjectOrRemoteAddress>,
    pub types: HashMap<String, String>,
    /// Paths that could not be evaluated; their value is null
    #[serde(default)]
    pub errors: HashMap<String, String>,
}

impl BatchMembersResponse {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// How a new array is sized and filled
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ArrayShape {
    /// Default-initialized elements
    Fixed { length: usize },
    /// One element per entry, each constructed from its argument list
    Constructed {
        elements: Vec<Vec<ObjectOrRemoteAddress>>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayCreationRequest {
    pub element_type: String,
    #[serde(flatten)]
    pub shape: ArrayShape,
}

impl ArrayCreationRequest {
    pub fn length(&self) -> usize {
        match &self.shape {
            ArrayShape::Fixed { length } => *length,
            ArrayShape::Constructed { elements } => elements.len(),
        }
    }
}

/// Describe a remote object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDumpRequest {
    pub address: RemoteAddress,
    pub type_name: String,
    #[serde(default)]
    pub pin_request: bool,
    #[serde(default)]
    pub hash_code: Option<i32>,
}

/// One field or property of an [`ObjectDump`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberDump {
    pub name: String,
    pub type_name: String,
    pub value: ObjectOrRemoteAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDump {
    pub type_name: String,
    /// Address at the time of the dump
    pub remote_address: RemoteAddress,
    /// Stable address when the object was pinned for this request
    pub pinned_address: Option<RemoteAddress>,
    pub hash_code: i32,
    /// Encoded value when the object itself is a primitive
    pub primitive_value: Option<String>,
    pub fields: Vec<MemberDump>,
    pub properties: Vec<MemberDump>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnpinRequest {
    pub address: RemoteAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpinResponse {
    /// False when the address was not pinned
    pub unpinned: bool,
}

/// Describe a type's members
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDumpRequest {
    pub type_full_name: String,
    #[serde(default)]
    pub module: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeMember {
    pub name: String,
    pub type_name: String,
    pub kind: MemberKind,
    #[serde(default)]
    pub is_static: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    Field,
    Property,
    Method,
    Constructor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDump {
    pub type_name: String,
    pub module: String,
    pub parent: Option<String>,
    pub members: Vec<TypeMember>,
}

/// List live objects whose full type name contains `type_filter`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapDumpRequest {
    pub type_filter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeapDump {
    pub objects: Vec<CandidateObject>,
}

/// Error reply, with enough detail for the caller to decide whether to retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiverError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&Error> for DiverError {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}
