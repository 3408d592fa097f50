// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
use std::time::Duration;

use deadpool_redis::Pool;
use log::{debug, warn};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Atomically removes all occurrences of `value` from `source` and, iff any
/// were removed, prepends one copy of it onto `dest`. Returns the count
/// removed from `source`. A single Lua round-trip so a concurrent reader can
/// never observe the value removed from `source` without it (eventually)
/// landing in `dest`.
const PULL_PIPE_SCRIPT: &str = r#"
local removed = redis.call('LREM', KEYS[1], 0, ARGV[1])
if removed > 0 then
    redis.call('LPUSH', KEYS[2], ARGV[1])
end
return removed
"#;

/// A named, ordered sequence of opaque byte references in Redis.
///
/// Cheap to clone. Clones share the same connection pool and the same
/// connection URL (kept alongside the pool so [`List::pop_pipe_listen`] can
/// open a dedicated connection of its own).
#[derive(Clone)]
pub struct List {
    pool: Pool,
    redis_url: String,
    key: String,
}

impl List {
    pub fn new(pool: Pool, redis_url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            pool,
            redis_url: redis_url.into(),
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Prepend `value` to the head of the list. Returns the new length.
    pub async fn push(&self, value: &[u8]) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        let len: u64 = conn.lpush(&self.key, value).await?;
        Ok(len)
    }

    /// Remove and return the tail of the list, or `None` if empty.
    pub async fn pop(&self) -> Result<Option<Vec<u8>>> {
        let mut conn = self.pool.get().await?;
        let value: Option<Vec<u8>> = conn.rpop(&self.key, None).await?;
        Ok(value)
    }

    /// Atomically pop the tail of this list and push it onto `other`'s
    /// head, returning the moved value. `RPOPLPUSH`.
    pub async fn pop_pipe(&self, other: &List) -> Result<Option<Vec<u8>>> {
        let mut conn = self.pool.get().await?;
        let value: Option<Vec<u8>> = conn.rpoplpush(&self.key, &other.key).await?;
        Ok(value)
    }

    /// As [`List::pop_pipe`], but the server blocks up to `timeout` awaiting
    /// a value. `Duration::ZERO` blocks indefinitely. Holds one pooled
    /// connection for the duration of the block, so callers driving a
    /// perpetual loop on this should use [`List::pop_pipe_listen`] instead,
    /// not call this in a loop themselves.
    pub async fn blocking_pop_pipe(
        &self,
        other: &List,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let mut conn = self.pool.get().await?;
        let value: Option<Vec<u8>> = conn
            .brpoplpush(&self.key, &other.key, timeout.as_secs_f64())
            .await?;
        Ok(value)
    }

    /// Remove *all* occurrences of `value` from the list. `LREM key 0
    /// value`. Returns the count removed.
    pub async fn pull(&self, value: &[u8]) -> Result<i64> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = conn.lrem(&self.key, 0, value).await?;
        Ok(removed)
    }

    /// Atomically remove all occurrences of `value` from this list and, iff
    /// any were removed, prepend one copy onto `other`. Returns the count
    /// removed from this list.
    pub async fn pull_pipe(&self, other: &List, value: &[u8]) -> Result<i64> {
        let mut conn = self.pool.get().await?;
        let removed: i64 = redis::Script::new(PULL_PIPE_SCRIPT)
            .key(&self.key)
            .key(&other.key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed)
    }

    /// Snapshot enumeration, tail-to-head (`LRANGE key 0 -1`).
    pub async fn list(&self) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.pool.get().await?;
        let values: Vec<Vec<u8>> = conn.lrange(&self.key, 0, -1).await?;
        Ok(values)
    }

    pub async fn length(&self) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        let len: u64 = conn.llen(&self.key).await?;
        Ok(len)
    }

    pub async fn clear(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = conn.del(&self.key).await?;
        Ok(())
    }

    /// Spawn a push-driven listener that loops a `BRPOPLPUSH` into `other`
    /// and forwards every element it moves. The listener owns a connection
    /// of its own, opened directly against this list's Redis URL rather than
    /// checked out of the shared pool. An indefinite block on a pool slot
    /// would starve `process`/`finish`/`fail` and the listener's own
    /// finish/fail sinks, all of which draw from the same pool.
    pub fn pop_pipe_listen(&self, other: &List) -> Listener {
        Listener::spawn(self.redis_url.clone(), self.key.clone(), other.key.clone())
    }
}

async fn dedicated_connection(redis_url: &str) -> Result<MultiplexedConnection> {
    let client = redis::Client::open(redis_url).map_err(Error::Transport)?;
    client
        .get_multiplexed_tokio_connection()
        .await
        .map_err(Error::Transport)
}

/// A long-lived consumer of [`List::pop_pipe_listen`]. Exposes the moved
/// elements and any transport errors as two independent channels, and tears
/// the background task down cleanly on `close()`.
pub struct Listener {
    pub elements: mpsc::UnboundedReceiver<Vec<u8>>,
    pub errors: mpsc::UnboundedReceiver<Error>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    fn spawn(redis_url: String, source_key: String, dest_key: String) -> Self {
        let (elem_tx, elem_rx) = mpsc::unbounded_channel();
        let (err_tx, err_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            let mut conn = match dedicated_connection(&redis_url).await {
                Ok(conn) => conn,
                Err(e) => {
                    let _ = err_tx.send(e);
                    return;
                }
            };

            loop {
                let popped: redis::RedisResult<Option<Vec<u8>>> =
                    conn.brpoplpush(&source_key, &dest_key, 0.0).await;
                match popped {
                    Ok(Some(value)) => {
                        if elem_tx.send(value).is_err() {
                            debug!("listener on {source_key} has no more receivers");
                            break;
                        }
                    }
                    // A zero timeout blocks indefinitely, so `None` only
                    // happens if the server enforces its own cap. Keep
                    // looping rather than treating it as exhaustion.
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("listener on {source_key} observed error: {e}");
                        if err_tx.send(Error::Transport(e)).is_err() {
                            break;
                        }
                        // Back off briefly so a persistently broken
                        // connection doesn't spin the task hot, then
                        // reconnect since the socket may no longer be
                        // usable.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        match dedicated_connection(&redis_url).await {
                            Ok(fresh) => conn = fresh,
                            Err(e) => {
                                if err_tx.send(e).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });

        Self {
            elements: elem_rx,
            errors: err_rx,
            handle: Some(handle),
        }
    }

    /// Tear down the background task. The outstanding blocking pop is
    /// unblocked because aborting the task drops its dedicated connection,
    /// closing the underlying socket; any resulting error from the
    /// in-flight command is swallowed rather than forwarded. After this
    /// call both `elements` and `errors` close: no further elements or
    /// errors appear.
    pub async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
