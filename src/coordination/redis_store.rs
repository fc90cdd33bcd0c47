use super::{CoordinationStore, StoreError};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, RedisError, Script};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const PUSH_BOUNDED: &str = r"
local n = redis.call('LLEN', KEYS[1])
if n >= tonumber(ARGV[2]) then
  return -1
end
return redis.call('RPUSH', KEYS[1], ARGV[1])
";

const PROMOTE_DUE: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, v in ipairs(due) do
  redis.call('ZREM', KEYS[1], v)
  redis.call('RPUSH', KEYS[2], v)
end
return #due
";

const RECOVER: &str = r"
local n = 0
while redis.call('LMOVE', KEYS[1], KEYS[2], 'RIGHT', 'LEFT') do
  n = n + 1
end
return n
";

const REPLACE_HEAD: &str = r"
if redis.call('LINDEX', KEYS[1], 0) == ARGV[1] then
  redis.call('LPOP', KEYS[1])
  redis.call('RPUSH', KEYS[2], ARGV[2])
  return 1
end
return 0
";

fn unavailable(e: RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Redis-backed coordination store, shared by every receiver and worker
/// process.
///
/// Blocking pops park a whole connection, so they run on dedicated
/// connections kept in `blocking`. A connection goes back to the pool only
/// after a clean reply; one dropped mid-command is discarded with its future.
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    blocking: Mutex<Vec<MultiplexedConnection>>,
    push_bounded: Script,
    promote_due: Script,
    recover: Script,
    replace_head: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(unavailable)?;
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            push_bounded: Script::new(PUSH_BOUNDED),
            promote_due: Script::new(PROMOTE_DUE),
            recover: Script::new(RECOVER),
            replace_head: Script::new(REPLACE_HEAD),
        })
    }

    fn idle_blocking(&self) -> MutexGuard<'_, Vec<MultiplexedConnection>> {
        self.blocking
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn take_blocking(&self) -> Result<MultiplexedConnection, StoreError> {
        let idle = self.idle_blocking().pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(unavailable),
        }
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let set: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(set == 1)
    }

    async fn push_bounded(
        &self,
        list: &str,
        value: &str,
        max_len: usize,
    ) -> Result<Option<usize>, StoreError> {
        let mut conn = self.conn.clone();
        let len: i64 = self
            .push_bounded
            .key(list)
            .arg(value)
            .arg(max_len)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(usize::try_from(len).ok())
    }

    async fn push(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("RPUSH")
            .arg(list)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(len)
    }

    async fn push_front(&self, list: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("LPUSH")
            .arg(list)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(len)
    }

    async fn pop_blocking(
        &self,
        list: &str,
        inflight: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.take_blocking().await?;
        let item: Option<String> = redis::cmd("BLMOVE")
            .arg(list)
            .arg(inflight)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64().max(0.01))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        self.idle_blocking().push(conn);
        Ok(item)
    }

    async fn ack(&self, inflight: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("LREM")
            .arg(inflight)
            .arg(1)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn recover(&self, inflight: &str, list: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let moved: usize = self
            .recover
            .key(inflight)
            .key(list)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(moved)
    }

    async fn replace_head(
        &self,
        from: &str,
        expected: &str,
        to: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .replace_head
            .key(from)
            .key(to)
            .arg(expected)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(moved == 1)
    }

    async fn len(&self, list: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("LLEN")
            .arg(list)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(len)
    }

    async fn range(&self, list: &str, count: usize) -> Result<Vec<String>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let items: Vec<String> = redis::cmd("LRANGE")
            .arg(list)
            .arg(0)
            .arg(count as i64 - 1)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(items)
    }

    async fn schedule(&self, set: &str, value: &str, ready_at_ms: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(set)
            .arg(ready_at_ms)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn promote_due(
        &self,
        set: &str,
        list: &str,
        now_ms: i64,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let moved: usize = self
            .promote_due
            .key(set)
            .key(list)
            .arg(now_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(moved)
    }

    async fn scheduled_len(&self, set: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("ZCARD")
            .arg(set)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(len)
    }
}
