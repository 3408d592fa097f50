// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
use deadpool_redis::Pool;
use redis::AsyncCommands;

use crate::error::{Error, Result};
use crate::marshal::{JsonMarshaller, Marshaller};
use crate::task::Task;

fn payload_key(prefix: &str, id: &[u8]) -> String {
    format!("{prefix}{}", String::from_utf8_lossy(id))
}

/// Maps an identifier to a marshalled task, keyed `{prefix}{delim}jobs{delim}{id}`.
///
/// There is no locking between `get` and `set`: the reliable-queue protocol
/// funnels mutations through the reference lists, so last-writer-wins here
/// is acceptable.
#[derive(Clone)]
pub struct PayloadStore<M = JsonMarshaller> {
    pool: Pool,
    prefix: String,
    marshaller: M,
}

impl PayloadStore<JsonMarshaller> {
    pub fn new(pool: Pool, jobs_prefix: impl Into<String>) -> Self {
        Self::with_marshaller(pool, jobs_prefix, JsonMarshaller)
    }
}

impl<M> PayloadStore<M> {
    pub fn with_marshaller(pool: Pool, jobs_prefix: impl Into<String>, marshaller: M) -> Self {
        Self {
            pool,
            prefix: jobs_prefix.into(),
            marshaller,
        }
    }

    fn key(&self, id: &[u8]) -> String {
        payload_key(&self.prefix, id)
    }

    /// Fetch and deserialize the payload for `id` into `out`.
    pub async fn get<T>(&self, id: &[u8], out: &mut T) -> Result<()>
    where
        T: Task,
        M: Marshaller<T>,
    {
        let mut conn = self.pool.get().await?;
        let bytes: Option<Vec<u8>> = conn.get(self.key(id)).await?;
        let bytes = bytes.ok_or_else(|| Error::MissingPayload(String::from_utf8_lossy(id).into_owned()))?;
        self.marshaller.unmarshal(&bytes, out)
    }

    /// Marshal and write `value` unconditionally. `value` must already
    /// carry its identifier.
    pub async fn set<T>(&self, value: &T) -> Result<()>
    where
        T: Task,
        M: Marshaller<T>,
    {
        let id = value
            .identifier()
            .ok_or(Error::Misconfiguration("task has no identifier"))?;
        let bytes = self.marshaller.marshal(value)?;
        let mut conn = self.pool.get().await?;
        let _: () = conn.set(self.key(&id), bytes).await?;
        Ok(())
    }

    /// Unconditional delete. Deleting a missing key is not an error.
    pub async fn delete(&self, id: &[u8]) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(self.key(id)).await?;
        Ok(())
    }

    /// Advisory. The underlying pool is reference counted and shared, so
    /// this is bookkeeping for symmetry with `List::clear`/`Listener::close`
    /// rather than a real teardown.
    pub fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_construction_uses_configured_prefix() {
        assert_eq!(payload_key("myq:jobs:", b"abc-123"), "myq:jobs:abc-123");
    }
}
