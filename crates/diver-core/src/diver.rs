//! Agent-side request handling
//!
//! [`Diver`] answers protocol requests against the live heap. Every incoming address is
//! revalidated with [`SnapshotRuntime::get_heap_object`] using the type name the caller carried
//! along, and deferred cleanup is paused for the duration of each request.

use crate::gc::GcCoordinator;
use crate::members;
use crate::snapshot::SnapshotRuntime;
use crate::traits::{ObjectModel, ObjectRef, Value};
use diver_common::{
    ArrayCreationRequest, ArrayShape, BatchMembersRequest, BatchMembersResponse,
    CtorInvocationRequest, DiverError, Error, FieldGetRequest, FieldSetRequest, HeapDump, HeapDumpRequest,
    IndexedItemAccessRequest, InvocationRequest, InvocationResults, MemberDump, MemberKind,
    ObjectDump, ObjectDumpRequest, ObjectOrRemoteAddress, RemoteAddress, Result, TypeDump,
    TypeDumpRequest, UnpinRequest, UnpinResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parse `body` as `Req`, run `handler`, serialize its response
fn call<Req, Resp>(body: &str, handler: impl FnOnce(&Req) -> Result<Resp>) -> Result<String>
where
    Req: DeserializeOwned,
    Resp: Serialize,
{
    let request: Req = serde_json::from_str(body)?;
    let response = handler(&request)?;
    Ok(serde_json::to_string(&response)?)
}

pub struct Diver<M> {
    runtime: Arc<SnapshotRuntime>,
    gc: Arc<GcCoordinator>,
    model: M,
}

impl<M: ObjectModel> Diver<M> {
    pub fn new(runtime: Arc<SnapshotRuntime>, gc: Arc<GcCoordinator>, model: M) -> Self {
        Self { runtime, gc, model }
    }

    pub fn runtime(&self) -> &Arc<SnapshotRuntime> {
        &self.runtime
    }

    pub fn gc(&self) -> &Arc<GcCoordinator> {
        &self.gc
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Liveness probe
    pub fn ping(&self) -> bool {
        true
    }

    fn target(&self, address: RemoteAddress, type_name: &str, hash_code: Option<i32>) -> Result<ObjectRef> {
        if address.is_null() {
            return Err(Error::Protocol(format!(
                "null target address for '{}'",
                type_name
            )));
        }
        self.runtime.get_heap_object(address, type_name, hash_code)
    }

    fn decode(&self, argument: &ObjectOrRemoteAddress) -> Result<Value> {
        match argument {
            ObjectOrRemoteAddress::Null => Ok(Value::Null),
            ObjectOrRemoteAddress::Type { type_name, module } => Ok(Value::Type(
                self.runtime.resolve_type(type_name, module.as_deref())?,
            )),
            ObjectOrRemoteAddress::Remote { address, type_name } => Ok(Value::Object(
                self.runtime.get_heap_object(*address, type_name, None)?,
            )),
            encoded @ ObjectOrRemoteAddress::Encoded { .. } => {
                Ok(Value::Primitive(encoded.to_primitive()?))
            }
        }
    }

    fn decode_all(&self, arguments: &[ObjectOrRemoteAddress]) -> Result<Vec<Value>> {
        arguments.iter().map(|a| self.decode(a)).collect()
    }

    /// Wire form of `value`; objects are pinned when `pin` is set so the address stays valid
    fn encode(&self, value: Value, pin: bool) -> Result<ObjectOrRemoteAddress> {
        Ok(match value {
            Value::Null => ObjectOrRemoteAddress::Null,
            Value::Primitive(p) => ObjectOrRemoteAddress::primitive(&p),
            Value::Type(ty) => ObjectOrRemoteAddress::type_ref(ty.name, Some(ty.module)),
            Value::Object(object) => {
                if let Some(p) = self.model.as_primitive(&object) {
                    return Ok(ObjectOrRemoteAddress::primitive(&p));
                }
                let address = if pin {
                    self.runtime.pin_object(&object)?
                } else {
                    self.runtime.live().address_of(&object)?
                };
                ObjectOrRemoteAddress::remote(address, object.type_name())
            }
        })
    }

    pub fn field_get(&self, request: &FieldGetRequest) -> Result<InvocationResults> {
        let _pause = self.gc.pause();
        let object = self.target(request.object_address, &request.type_name, request.hash_code)?;
        let value = self.model.get_member(&object, &request.field_name)?;
        Ok(InvocationResults::value(self.encode(value, false)?))
    }

    /// Write a member and return the value read back
    pub fn field_set(&self, request: &FieldSetRequest) -> Result<InvocationResults> {
        let _pause = self.gc.pause();
        let object = self.target(request.object_address, &request.type_name, request.hash_code)?;
        let value = self.decode(&request.value)?;
        self.model.set_member(&object, &request.field_name, value)?;
        let current = self.model.get_member(&object, &request.field_name)?;
        debug!(target: "diver_core::diver", member = %request.field_name, "Member written");
        Ok(InvocationResults::value(self.encode(current, false)?))
    }

    /// Construct an object; the result is pinned so its address survives collections
    pub fn construct(&self, request: &CtorInvocationRequest) -> Result<InvocationResults> {
        let _pause = self.gc.pause();
        let ty = self.runtime.resolve_type(&request.type_full_name, None)?;
        let args = self.decode_all(&request.parameters)?;
        let object = self.model.construct(&ty, args, request.force_ui_thread)?;
        info!(
            target: "diver_core::diver",
            type_name = %ty.name,
            ui_thread = request.force_ui_thread,
            "Constructed object"
        );
        Ok(InvocationResults::value(self.encode(Value::Object(object), true)?))
    }

    pub fn invoke(&self, request: &InvocationRequest) -> Result<InvocationResults> {
        let _pause = self.gc.pause();
        let ty = self.runtime.resolve_type(&request.type_name, None)?;
        let target = if request.object_address.is_null() {
            None
        } else {
            Some(self.target(request.object_address, &request.type_name, request.hash_code)?)
        };
        let args = self.decode_all(&request.parameters)?;
        match self
            .model
            .invoke(target.as_ref(), &ty, &request.method_name, args)?
        {
            Some(value) => Ok(InvocationResults::value(self.encode(value, false)?)),
            None => Ok(InvocationResults::void()),
        }
    }

    pub fn indexed_item(&self, request: &IndexedItemAccessRequest) -> Result<InvocationResults> {
        let _pause = self.gc.pause();
        let collection =
            self.target(request.collection_address, &request.type_name, request.hash_code)?;
        let index = self.decode(&request.index)?;
        let item = self.model.get_item(&collection, index)?;
        Ok(InvocationResults::value(self.encode(item, request.pin_request)?))
    }

    pub fn batch_members(&self, request: &BatchMembersRequest) -> Result<BatchMembersResponse> {
        let _pause = self.gc.pause();
        let object = self.target(request.object_address, &request.type_name, request.hash_code)?;
        let paths = request.path_list();
        Ok(members::evaluate_batch(&self.model, &object, &paths, |value| {
            self.encode(value, false)
        }))
    }

    /// Create an array; the result is pinned
    pub fn create_array(&self, request: &ArrayCreationRequest) -> Result<InvocationResults> {
        let _pause = self.gc.pause();
        let element_type = self.runtime.resolve_type(&request.element_type, None)?;
        let array = self.model.create_array(&element_type, request.length())?;
        if let ArrayShape::Constructed { elements } = &request.shape {
            for (index, arguments) in elements.iter().enumerate() {
                let args = self.decode_all(arguments)?;
                let element = self.model.construct(&element_type, args, false)?;
                self.model.set_element(&array, index, Value::Object(element))?;
            }
        }
        debug!(
            target: "diver_core::diver",
            element_type = %element_type.name,
            length = request.length(),
            "Created array"
        );
        Ok(InvocationResults::value(self.encode(Value::Object(array), true)?))
    }

    pub fn dump_object(&self, request: &ObjectDumpRequest) -> Result<ObjectDump> {
        let _pause = self.gc.pause();
        let object = self.target(request.address, &request.type_name, request.hash_code)?;
        let ty = self.runtime.resolve_type(object.type_name(), None)?;
        let description = self.model.describe_type(&ty)?;
        let live = self.runtime.live();

        let pinned_address = if request.pin_request {
            Some(self.runtime.pin_object(&object)?)
        } else {
            None
        };

        let mut fields = Vec::new();
        let mut properties = Vec::new();
        for member in description.members.iter().filter(|m| !m.is_static) {
            let bucket = match member.kind {
                MemberKind::Field => &mut fields,
                MemberKind::Property => &mut properties,
                _ => continue,
            };
            let read = self
                .model
                .get_member(&object, &member.name)
                .and_then(|v| self.encode(v, false));
            bucket.push(match read {
                Ok(value) => MemberDump {
                    name: member.name.clone(),
                    type_name: member.type_name.clone(),
                    value,
                    retrieval_error: None,
                },
                Err(e) => MemberDump {
                    name: member.name.clone(),
                    type_name: member.type_name.clone(),
                    value: ObjectOrRemoteAddress::Null,
                    retrieval_error: Some(e.to_string()),
                },
            });
        }

        Ok(ObjectDump {
            type_name: ty.name,
            remote_address: live.address_of(&object)?,
            pinned_address,
            hash_code: live.hash_code(&object)?,
            primitive_value: self.model.as_primitive(&object).map(|p| p.encode()),
            fields,
            properties,
        })
    }

    pub fn dump_type(&self, request: &TypeDumpRequest) -> Result<TypeDump> {
        let ty = self
            .runtime
            .resolve_type(&request.type_full_name, request.module.as_deref())?;
        self.model.describe_type(&ty)
    }

    pub fn dump_heap(&self, request: &HeapDumpRequest) -> Result<HeapDump> {
        let _pause = self.gc.pause();
        let filter = request.type_filter.as_str();
        let objects = self
            .runtime
            .enumerate_objects(|ty| ty.name.contains(filter))?;
        debug!(target: "diver_core::diver", filter, found = objects.len(), "Heap dump");
        Ok(HeapDump { objects })
    }

    /// Drop a pin. The anchor is released from the deferred queue, not on the request path.
    pub fn unpin(&self, request: &UnpinRequest) -> UnpinResponse {
        match self.runtime.take_pin(request.address) {
            Some(anchor) => {
                self.gc.defer(move || anchor.release());
                UnpinResponse { unpinned: true }
            }
            None => {
                warn!(target: "diver_core::diver", address = %request.address, "Unpin of an address that is not pinned");
                UnpinResponse { unpinned: false }
            }
        }
    }

    /// Route a JSON request body to its handler by command name
    pub fn dispatch(&self, command: &str, body: &str) -> Result<String> {
        debug!(target: "diver_core::diver", command, "Dispatching request");
        match command {
            "ping" => Ok(serde_json::json!({ "alive": self.ping() }).to_string()),
            "get_field" => call(body, |r| self.field_get(r)),
            "set_field" => call(body, |r| self.field_set(r)),
            "create_object" => call(body, |r| self.construct(r)),
            "invoke" => call(body, |r| self.invoke(r)),
            "get_item" => call(body, |r| self.indexed_item(r)),
            "batch_members" => call(body, |r| self.batch_members(r)),
            "create_array" => call(body, |r| self.create_array(r)),
            "dump_object" => call(body, |r| self.dump_object(r)),
            "dump_type" => call(body, |r| self.dump_type(r)),
            "dump_heap" => call(body, |r| self.dump_heap(r)),
            "unpin" => call(body, |r| Ok(self.unpin(r))),
            other => Err(Error::Protocol(format!("unknown command '{}'", other))),
        }
    }

    /// [`Self::dispatch`] with failures rendered as a serialized [`DiverError`]
    pub fn dispatch_json(&self, command: &str, body: &str) -> String {
        self.dispatch(command, body).unwrap_or_else(|e| {
            warn!(target: "diver_core::diver", command, error = %e, "Request failed");
            serde_json::to_string(&DiverError::from(&e))
                .unwrap_or_else(|_| format!("{{\"kind\":\"{}\"}}", e.kind()))
        })
    }
}
