// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
use crate::id::IdGenerator;
use crate::marshal::{JsonMarshaller, Marshaller};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A task is a capability, not a class hierarchy: "has an identifier".
///
/// [`MapTask`] and [`Record<T>`] are the two canonical variants from the
/// data model; anything else a caller wants to push through the queue only
/// needs to implement this trait.
pub trait Task {
    /// The identifier, if one has already been minted.
    fn identifier(&self) -> Option<Vec<u8>>;

    /// Install a freshly minted identifier. Implementations must make
    /// subsequent `identifier()` calls return this same value.
    fn set_identifier(&mut self, id: Vec<u8>);
}

/// Read the task's identifier, minting and installing one via `gen` if it
/// doesn't have one yet. Mutates `task` in place.
pub fn ensure_identifier<T: Task + ?Sized>(task: &mut T, gen: &dyn IdGenerator) -> Vec<u8> {
    if let Some(id) = task.identifier() {
        return id;
    }
    let id = gen.generate().into_bytes();
    task.set_identifier(id.clone());
    id
}

/// An arbitrary task: a mapping from string key to untyped JSON value. The
/// identifier lives under a configurable key (`"id"` by default).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapTask {
    id_field: String,
    fields: Map<String, Value>,
}

impl MapTask {
    pub fn new() -> Self {
        Self::with_id_field("id")
    }

    pub fn with_id_field(id_field: impl Into<String>) -> Self {
        Self {
            id_field: id_field.into(),
            fields: Map::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }
}

impl Task for MapTask {
    fn identifier(&self) -> Option<Vec<u8>> {
        match self.fields.get(&self.id_field) {
            Some(Value::String(s)) => Some(s.as_bytes().to_vec()),
            _ => None,
        }
    }

    fn set_identifier(&mut self, id: Vec<u8>) {
        let s = String::from_utf8_lossy(&id).into_owned();
        self.fields.insert(self.id_field.clone(), Value::String(s));
    }
}

/// Marshals a [`MapTask`] as its bare field map (the identifier lives inside
/// it under `id_field`, so no wrapper envelope is needed). Unmarshalling
/// preserves the `id_field` name already configured on `out`, since that
/// configuration is a queue-level setting, not part of the wire format.
impl Marshaller<MapTask> for JsonMarshaller {
    fn marshal(&self, value: &MapTask) -> crate::error::Result<Vec<u8>> {
        serde_json::to_vec(&value.fields).map_err(crate::error::Error::Encoding)
    }

    fn unmarshal(&self, bytes: &[u8], out: &mut MapTask) -> crate::error::Result<()> {
        out.fields = serde_json::from_slice(bytes).map_err(crate::error::Error::Encoding)?;
        Ok(())
    }
}

/// A structured task type that carries its own identifier field. Implement
/// this on a plain `#[derive(Serialize, Deserialize)]` struct and wrap it in
/// [`Record`] to use it with the queue.
pub trait Identified {
    fn id(&self) -> Option<&str>;
    fn set_id(&mut self, id: String);
}

/// Wraps a structured [`Identified`] type so it can be pushed through the
/// queue. Transparent in serialized form: `Record<T>` serializes exactly
/// like `T`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Record<T>(pub T);

impl<T: Identified> Task for Record<T> {
    fn identifier(&self) -> Option<Vec<u8>> {
        self.0.id().map(|s| s.as_bytes().to_vec())
    }

    fn set_identifier(&mut self, id: Vec<u8>) {
        self.0.set_id(String::from_utf8_lossy(&id).into_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::UuidGenerator;

    #[test]
    fn map_task_mints_once_and_is_idempotent() {
        let mut t = MapTask::new();
        t.insert("f", "pleasure");
        assert_eq!(t.identifier(), None);

        let gen = UuidGenerator;
        let id1 = ensure_identifier(&mut t, &gen);
        let id2 = ensure_identifier(&mut t, &gen);
        assert_eq!(id1, id2);
        assert_eq!(t.identifier(), Some(id1));
    }

    #[test]
    fn map_task_respects_custom_id_field() {
        let mut t = MapTask::with_id_field("task_id");
        let gen = UuidGenerator;
        ensure_identifier(&mut t, &gen);
        assert!(t.get("task_id").is_some());
        assert!(t.get("id").is_none());
    }

    #[test]
    fn map_task_round_trips_through_json_marshaller() {
        let mut t = MapTask::new();
        t.insert("f", "pain");
        ensure_identifier(&mut t, &UuidGenerator);

        let m = JsonMarshaller;
        let bytes = Marshaller::<MapTask>::marshal(&m, &t).unwrap();

        let mut out = MapTask::new();
        Marshaller::<MapTask>::unmarshal(&m, &bytes, &mut out).unwrap();
        assert_eq!(out.get("f"), Some(&Value::String("pain".into())));
        assert_eq!(out.identifier(), t.identifier());
    }

    #[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
    struct Job {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        payload: String,
    }

    impl Identified for Job {
        fn id(&self) -> Option<&str> {
            self.id.as_deref()
        }
        fn set_id(&mut self, id: String) {
            self.id = Some(id);
        }
    }

    #[test]
    fn structured_task_mints_and_round_trips() {
        let mut rec = Record(Job {
            id: None,
            payload: "things".into(),
        });
        ensure_identifier(&mut rec, &UuidGenerator);
        assert!(rec.0.id.is_some());

        let m = JsonMarshaller;
        let bytes = Marshaller::marshal(&m, &rec).unwrap();
        let mut out = Record(Job::default());
        Marshaller::unmarshal(&m, &bytes, &mut out).unwrap();
        assert_eq!(out, rec);
    }
}
