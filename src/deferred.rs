// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT
use deadpool_redis::Pool;

use crate::error::Result;
use crate::list::List;
use crate::timestamp::Timestamp;

/// Moves every member of a sorted set scored at or before `now` onto a list,
/// atomically. `ZRANGEBYSCORE` + `LPUSH` + `ZREMRANGEBYSCORE` in one
/// round-trip, so a reader can never observe a member removed from the set
/// without it having already landed on the list.
const DEFER_MOVE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
if #due > 0 then
    for i = 1, #due do
        redis.call('LPUSH', KEYS[2], due[i])
    end
    redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
end
return due
"#;

/// Pulls every member due at or before `now` out of a recurring sorted set,
/// rescheduling each by its encoded interval, and returns the bare
/// identifiers (with the `|interval` suffix stripped). A member with no
/// encoded interval (or a non-positive one) is removed from the set instead
/// of rescheduled, since there is no interval to reschedule it by; leaving it
/// in place would re-emit it on every subsequent tick.
const RECUR_PULL_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local ids = {}
for i = 1, #due do
    local member = due[i]
    local sep = string.find(member, '|')
    local id = member
    local interval = nil
    if sep then
        id = string.sub(member, 1, sep - 1)
        interval = tonumber(string.sub(member, sep + 1))
    end
    if interval and interval > 0 then
        redis.call('ZINCRBY', KEYS[1], interval, member)
    else
        redis.call('ZREM', KEYS[1], member)
    end
    table.insert(ids, id)
end
return ids
"#;

/// Drives the `deferred` sorted set: identifiers scored by the millisecond
/// timestamp they become eligible for `todo`.
///
/// Grounded on the same deadpool-redis + `redis::Script` pattern as
/// [`crate::list::List`]; kept as its own type because its key has sorted-set
/// semantics rather than list semantics.
#[derive(Clone)]
pub struct DeferredEngine {
    pool: Pool,
    key: String,
}

impl DeferredEngine {
    pub fn new(pool: Pool, key: impl Into<String>) -> Self {
        Self {
            pool,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Schedule `id` to become eligible for `todo` at `when`.
    pub async fn add(&self, id: &[u8], when: Timestamp) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("ZADD")
            .arg(&self.key)
            .arg(when.as_millis())
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Move every identifier due at or before `now` onto `todo`. Returns the
    /// moved identifiers, already pushed. This is a single round-trip, not
    /// a pull-then-push pair.
    pub async fn tick(&self, todo: &List, now: Timestamp) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.pool.get().await?;
        let due: Vec<Vec<u8>> = redis::Script::new(DEFER_MOVE_SCRIPT)
            .key(&self.key)
            .key(todo.key())
            .arg(now.as_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(due)
    }

    pub async fn clear(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("DEL").arg(&self.key).query_async(&mut conn).await?;
        Ok(())
    }
}

/// Drives a recurring sorted set: members encode `{id}|{interval_ms}`, and a
/// due member is rescheduled by `ZINCRBY`ing its own score rather than
/// removed.
#[derive(Clone)]
pub struct RecurringEngine {
    pool: Pool,
    key: String,
}

impl RecurringEngine {
    pub fn new(pool: Pool, key: impl Into<String>) -> Self {
        Self {
            pool,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Register `id` to recur every `interval`, first becoming due at
    /// `first`.
    pub async fn add(
        &self,
        id: &str,
        first: Timestamp,
        interval: std::time::Duration,
    ) -> Result<()> {
        let member = format!("{id}|{}", interval.as_millis());
        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("ZADD")
            .arg(&self.key)
            .arg(first.as_millis())
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Pull every identifier due at or before `now`, rescheduling it for its
    /// next interval, then push the bare identifiers onto `todo`. Two
    /// round-trips: `recur_pull` only advances scores server-side, pushing
    /// onto `todo` is this method's job, not the script's.
    pub async fn tick(&self, todo: &List, now: Timestamp) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.pool.get().await?;
        let due: Vec<Vec<u8>> = redis::Script::new(RECUR_PULL_SCRIPT)
            .key(&self.key)
            .arg(now.as_millis())
            .invoke_async(&mut conn)
            .await?;
        for id in &due {
            todo.push(id).await?;
        }
        Ok(due)
    }

    pub async fn clear(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("DEL").arg(&self.key).query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recurring_member_encodes_id_and_interval() {
        let member = format!("{}|{}", "job-1", std::time::Duration::from_secs(60).as_millis());
        assert_eq!(member, "job-1|60000");
    }
}
