use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult, Script};
use tokio::time::timeout;

use super::{with_timeout, BoundedAdd, Store, StoreOp};
use crate::error::{Error, ErrorDetails};

const SCAN_PAGE_SIZE: usize = 200;

/// Adds a member only if the set stays within its cap; undoes the add otherwise.
/// Returns 2 when the member was already present, 1 when it was added, 0 when it was rejected.
const BOUNDED_SADD_SCRIPT: &str = r#"
local key = KEYS[1]
local member = ARGV[1]
local cap = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

if redis.call('SADD', key, member) == 0 then
    return 2
end

if redis.call('SCARD', key) > cap then
    redis.call('SREM', key, member)
    return 0
end

redis.call('EXPIRE', key, ttl)
return 1
"#;

/// [`Store`] backed by a Redis instance shared by every gateway replica
pub struct RedisStore {
    conn: MultiplexedConnection,
    timeout: Duration,
    bounded_sadd_script: Script,
}

impl RedisStore {
    pub async fn new(url: &str, op_timeout: Duration) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = match timeout(op_timeout, client.get_multiplexed_async_connection()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!("Failed to get Redis connection: {e}"),
                }))
            }
            Err(_) => {
                return Err(Error::new(ErrorDetails::Config {
                    message: format!(
                        "Timed out connecting to Redis after {}ms",
                        op_timeout.as_millis()
                    ),
                }))
            }
        };
        tracing::info!("Connected to Redis");

        Ok(Self {
            conn,
            timeout: op_timeout,
            bounded_sadd_script: Script::new(BOUNDED_SADD_SCRIPT),
        })
    }

    /// Runs a single store interaction under the configured timeout
    async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T, Error>
    where
        F: Future<Output = RedisResult<T>>,
    {
        with_timeout(operation, self.timeout, fut).await
    }
}

fn ttl_seconds(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX)
}

/// Escapes glob metacharacters so that `prefix` is matched literally by `SCAN ... MATCH`
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

#[async_trait]
impl Store for RedisStore {
    async fn atomic_batch(&self, ops: &[StoreOp]) -> Result<(), Error> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                StoreOp::ZAdd { key, score, member } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                StoreOp::ZRemBelow { key, min_score } => {
                    pipe.zrembyscore(key, "-inf", format!("({min_score}"))
                        .ignore();
                }
                StoreOp::Incr { key } => {
                    pipe.incr(key, 1).ignore();
                }
                StoreOp::Expire { key, ttl } => {
                    pipe.expire(key, ttl_seconds(*ttl)).ignore();
                }
                StoreOp::SAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                StoreOp::SRem { key, member } => {
                    pipe.srem(key, member).ignore();
                }
                StoreOp::HSet { key, fields } => {
                    pipe.hset_multiple(key, fields.as_slice()).ignore();
                }
                StoreOp::Del { key } => {
                    pipe.del(key).ignore();
                }
            }
        }
        let mut conn = self.conn.clone();
        self.run("atomic_batch", pipe.query_async::<()>(&mut conn))
            .await
    }

    async fn zcount_since(&self, key: &str, min_score: i64) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        self.run("zcount", conn.zcount(key, min_score, "+inf")).await
    }

    async fn znth_since(
        &self,
        key: &str,
        min_score: i64,
        offset: u64,
    ) -> Result<Option<i64>, Error> {
        let offset = isize::try_from(offset).unwrap_or(isize::MAX);
        let mut conn = self.conn.clone();
        let nth: Vec<(String, f64)> = self
            .run(
                "zrangebyscore",
                conn.zrangebyscore_limit_withscores(key, min_score, "+inf", offset, 1),
            )
            .await?;
        Ok(nth.first().map(|(_, score)| *score as i64))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, Error> {
        let mut conn = self.conn.clone();
        let ttl: i64 = self.run("ttl", conn.ttl(key)).await?;
        // -2: no such key, -1: no expiry
        Ok(u64::try_from(ttl).ok().map(Duration::from_secs))
    }

    async fn get_i64(&self, key: &str) -> Result<Option<i64>, Error> {
        let mut conn = self.conn.clone();
        self.run("get", conn.get(key)).await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        self.run("sismember", conn.sismember(key, member)).await
    }

    async fn scard(&self, key: &str) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        self.run("scard", conn.scard(key)).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        self.run("smembers", conn.smembers(key)).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, Error> {
        let mut conn = self.conn.clone();
        self.run("hgetall", conn.hgetall(key)).await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let pattern = escape_glob(prefix);
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, page): (u64, Vec<String>) = self
                .run(
                    "scan",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_PAGE_SIZE)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(page);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn sadd_bounded(
        &self,
        key: &str,
        member: &str,
        cap: u64,
        ttl: Duration,
    ) -> Result<BoundedAdd, Error> {
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .run(
                "sadd_bounded",
                self.bounded_sadd_script
                    .key(key)
                    .arg(member)
                    .arg(cap)
                    .arg(ttl_seconds(ttl))
                    .invoke_async(&mut conn),
            )
            .await?;
        Ok(match outcome {
            2 => BoundedAdd::AlreadyMember,
            1 => BoundedAdd::Added,
            _ => BoundedAdd::Rejected,
        })
    }
}


#[cfg(all(test, feature = "e2e_tests"))]
mod e2e_tests {
    use super::*;
    use crate::config::ENV_REDIS_URL;

    async fn connect() -> RedisStore {
        let url = std::env::var(ENV_REDIS_URL).unwrap_or_else(|_| "redis://localhost:6379".into());
        RedisStore::new(&url, Duration::from_secs(2)).await.unwrap()
    }

    fn unique(prefix: &str) -> String {
        format!("e2e:{prefix}:{}", uuid::Uuid::now_v7())
    }

    #[tokio::test]
    async fn test_atomic_batch_and_counts() {
        let store = connect().await;
        let key = unique("zset");
        store
            .atomic_batch(&[
                StoreOp::ZAdd {
                    key: key.clone(),
                    score: 100,
                    member: "a".into(),
                },
                StoreOp::ZAdd {
                    key: key.clone(),
                    score: 200,
                    member: "b".into(),
                },
                StoreOp::Expire {
                    key: key.clone(),
                    ttl: Duration::from_secs(60),
                },
            ])
            .await
            .unwrap();

        assert_eq!(store.zcount_since(&key, 150).await.unwrap(), 1);
        assert_eq!(store.znth_since(&key, 0, 0).await.unwrap(), Some(100));
        assert_eq!(store.znth_since(&key, 0, 1).await.unwrap(), Some(200));
        assert_eq!(store.znth_since(&key, 0, 2).await.unwrap(), None);
        assert!(store.ttl(&key).await.unwrap().is_some());

        store
            .atomic_batch(&[StoreOp::ZRemBelow {
                key: key.clone(),
                min_score: 200,
            }])
            .await
            .unwrap();
        assert_eq!(store.zcount_since(&key, 0).await.unwrap(), 1);
        store
            .atomic_batch(&[StoreOp::Del { key: key.clone() }])
            .await
            .unwrap();
        assert_eq!(store.ttl(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sadd_bounded() {
        let store = connect().await;
        let key = unique("set");
        let ttl = Duration::from_secs(60);
        assert_eq!(
            store.sadd_bounded(&key, "a", 2, ttl).await.unwrap(),
            BoundedAdd::Added
        );
        assert_eq!(
            store.sadd_bounded(&key, "b", 2, ttl).await.unwrap(),
            BoundedAdd::Added
        );
        assert_eq!(
            store.sadd_bounded(&key, "c", 2, ttl).await.unwrap(),
            BoundedAdd::Rejected
        );
        assert_eq!(
            store.sadd_bounded(&key, "a", 2, ttl).await.unwrap(),
            BoundedAdd::AlreadyMember
        );
        assert_eq!(store.scard(&key).await.unwrap(), 2);

        let prefix = key.clone();
        assert_eq!(store.scan_prefix(&prefix).await.unwrap(), vec![key.clone()]);
        store
            .atomic_batch(&[StoreOp::Del { key }])
            .await
            .unwrap();
    }
}
