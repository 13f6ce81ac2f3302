use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;

use super::{Backend, Namespace, StoreError, Versioned};

/// Lua scripts for the atomic primitives.
///
/// Each namespace is a data hash `{prefix}:{ns}` plus a version hash
/// `{prefix}:{ns}:ver`; versions come from the shared counter
/// `{prefix}:version` so they are never reused.
mod scripts {
    use ::redis::Script;

    /// Returns `{value, version}` read atomically.
    pub fn get() -> Script {
        Script::new(
            r#"
            return {
                redis.call('HGET', KEYS[1], ARGV[1]),
                redis.call('HGET', KEYS[2], ARGV[1])
            }
            "#,
        )
    }

    /// Returns `{data_pairs, version_pairs}` read atomically.
    pub fn scan() -> Script {
        Script::new(
            r#"
            return {
                redis.call('HGETALL', KEYS[1]),
                redis.call('HGETALL', KEYS[2])
            }
            "#,
        )
    }

    /// ARGV: field, expected version ('' = must be absent), value.
    /// Returns the new version or 0 on conflict.
    pub fn compare_and_swap() -> Script {
        Script::new(
            r#"
            local current = redis.call('HGET', KEYS[2], ARGV[1])
            if ARGV[2] == '' then
                if current then
                    return 0
                end
            elseif current ~= ARGV[2] then
                return 0
            end

            local version = redis.call('INCR', KEYS[3])
            redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
            redis.call('HSET', KEYS[2], ARGV[1], version)
            return version
            "#,
        )
    }

    /// ARGV: field, expected version. Returns 1 if deleted.
    pub fn compare_and_delete() -> Script {
        Script::new(
            r#"
            local current = redis.call('HGET', KEYS[2], ARGV[1])
            if current ~= ARGV[2] then
                return 0
            end

            redis.call('HDEL', KEYS[1], ARGV[1])
            redis.call('HDEL', KEYS[2], ARGV[1])
            return 1
            "#,
        )
    }

    /// KEYS: claim data, claim versions, counter, log list.
    /// ARGV: field, claim value, log entry. Returns 1 if claimed.
    pub fn claim_and_append() -> Script {
        Script::new(
            r#"
            if redis.call('HEXISTS', KEYS[2], ARGV[1]) == 1 then
                return 0
            end

            local version = redis.call('INCR', KEYS[3])
            redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
            redis.call('HSET', KEYS[2], ARGV[1], version)
            redis.call('RPUSH', KEYS[4], ARGV[3])
            return 1
            "#,
        )
    }
}

/// Redis-backed store shared by every worker process.
pub struct RedisBackend {
    conn: MultiplexedConnection,
    prefix: String,
    get: Script,
    scan: Script,
    cas: Script,
    cad: Script,
    claim: Script,
}

impl RedisBackend {
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            get: scripts::get(),
            scan: scripts::scan(),
            cas: scripts::compare_and_swap(),
            cad: scripts::compare_and_delete(),
            claim: scripts::claim_and_append(),
        })
    }

    fn data_key(&self, ns: Namespace) -> String {
        format!("{}:{}", self.prefix, ns.as_str())
    }

    fn version_key(&self, ns: Namespace) -> String {
        format!("{}:{}:ver", self.prefix, ns.as_str())
    }

    fn counter_key(&self) -> String {
        format!("{}:version", self.prefix)
    }
}

fn parse_version(raw: &str) -> Result<u64, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Protocol(format!("non-numeric version '{raw}'")))
}

#[async_trait]
impl Backend for RedisBackend {
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<Versioned>, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Vec<Option<String>> = self
            .get
            .key(self.data_key(ns))
            .key(self.version_key(ns))
            .arg(key)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [Some(value), Some(version)] => Ok(Some(Versioned {
                version: parse_version(version)?,
                value: value.clone(),
            })),
            [_, _] => Ok(None),
            other => Err(StoreError::Protocol(format!(
                "expected 2 elements from get, got {}",
                other.len()
            ))),
        }
    }

    async fn scan(&self, ns: Namespace) -> Result<Vec<(String, Versioned)>, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Vec<Vec<String>> = self
            .scan
            .key(self.data_key(ns))
            .key(self.version_key(ns))
            .invoke_async(&mut conn)
            .await?;

        let [data, versions] = reply.as_slice() else {
            return Err(StoreError::Protocol(format!(
                "expected 2 elements from scan, got {}",
                reply.len()
            )));
        };

        let versions: std::collections::HashMap<&str, &str> = versions
            .chunks_exact(2)
            .map(|pair| (pair[0].as_str(), pair[1].as_str()))
            .collect();

        data.chunks_exact(2)
            .filter_map(|pair| {
                let version = versions.get(pair[0].as_str())?;
                Some(parse_version(version).map(|version| {
                    (
                        pair[0].clone(),
                        Versioned {
                            version,
                            value: pair[1].clone(),
                        },
                    )
                }))
            })
            .collect()
    }

    async fn compare_and_swap(
        &self,
        ns: Namespace,
        key: &str,
        expected: Option<u64>,
        value: &str,
    ) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let expected = expected.map(|v| v.to_string()).unwrap_or_default();
        let version: u64 = self
            .cas
            .key(self.data_key(ns))
            .key(self.version_key(ns))
            .key(self.counter_key())
            .arg(key)
            .arg(expected)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok((version != 0).then_some(version))
    }

    async fn compare_and_delete(
        &self,
        ns: Namespace,
        key: &str,
        expected: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .cad
            .key(self.data_key(ns))
            .key(self.version_key(ns))
            .arg(key)
            .arg(expected.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn claim_and_append(
        &self,
        claim_ns: Namespace,
        claim_key: &str,
        claim_value: &str,
        log_ns: Namespace,
        entry: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let claimed: i64 = self
            .claim
            .key(self.data_key(claim_ns))
            .key(self.version_key(claim_ns))
            .key(self.counter_key())
            .key(self.data_key(log_ns))
            .arg(claim_key)
            .arg(claim_value)
            .arg(entry)
            .invoke_async(&mut conn)
            .await?;
        Ok(claimed == 1)
    }

    async fn read_log(
        &self,
        ns: Namespace,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let start = offset as isize;
        let stop = start + limit as isize - 1;
        let entries: Vec<String> = conn.lrange(self.data_key(ns), start, stop).await?;
        Ok(entries)
    }

    async fn log_len(&self, ns: Namespace) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.llen(self.data_key(ns)).await?;
        Ok(len)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
