use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lazy_static::lazy_static;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use redis::Script;
use tokio::time::Instant;

use crate::error::{Error, ErrorDetails};

lazy_static! {
    /// Atomic fixed-window increment: the TTL is set only when the increment
    /// created the key, so the window start never moves.
    static ref INCR_WITH_TTL_SCRIPT: Script = Script::new(
        r"
        local count = redis.call('INCR', KEYS[1])
        if count == 1 then
            redis.call('EXPIRE', KEYS[1], ARGV[1])
        end
        return count
        ",
    );
}

/// Handle to the shared counter/cache store backing every distributed gate.
///
/// `Disabled` is the no-Redis development mode: callers are expected to check
/// `is_enabled()` and fail open. `Mock` is an in-memory stand-in for tests,
/// with a `healthy` switch to simulate outages.
#[derive(Clone)]
pub enum SharedStore {
    Disabled,
    Mock(Arc<MockStoreState>),
    Production {
        client: redis::Client,
        conn: MultiplexedConnection,
    },
}

impl SharedStore {
    pub async fn new(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to get Redis connection: {e}"),
                })
            })?;
        redis::cmd("PING")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to ping Redis: {e}"),
                })
            })?;
        Ok(Self::Production { client, conn })
    }

    pub fn new_disabled() -> Self {
        Self::Disabled
    }

    pub fn new_mock() -> Self {
        Self::Mock(Arc::new(MockStoreState::new()))
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// The store's view of its own reachability, for `/status` reporting.
    pub async fn health(&self) -> Result<(), Error> {
        match self {
            Self::Disabled => Err(Error::new_without_logging(ErrorDetails::StoreUnavailable {
                message: "shared store is disabled".to_string(),
            })),
            Self::Mock(state) => state.check_healthy(),
            Self::Production { conn, .. } => {
                let mut conn = conn.clone();
                redis::cmd("PING")
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(|e| {
                        Error::new(ErrorDetails::StoreUnavailable {
                            message: format!("ping failed: {e}"),
                        })
                    })
            }
        }
    }

    /// Increment `key` and return the post-increment count, starting a
    /// `ttl_secs` expiry only when this increment created the key.
    pub async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<u64, Error> {
        match self {
            Self::Disabled => Err(disabled_error()),
            Self::Mock(state) => state.incr(key, Some(Duration::from_secs(ttl_secs))),
            Self::Production { conn, .. } => {
                let mut conn = conn.clone();
                INCR_WITH_TTL_SCRIPT
                    .key(key)
                    .arg(ttl_secs)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(|e| store_error("INCR with TTL", e))
            }
        }
    }

    /// Increment `key` without touching its expiry. Used for counters that
    /// only an explicit reset may zero.
    pub async fn incr(&self, key: &str) -> Result<u64, Error> {
        match self {
            Self::Disabled => Err(disabled_error()),
            Self::Mock(state) => state.incr(key, None),
            Self::Production { conn, .. } => {
                let mut conn = conn.clone();
                conn.incr(key, 1)
                    .await
                    .map_err(|e| store_error("INCR", e))
            }
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        match self {
            Self::Disabled => Err(disabled_error()),
            Self::Mock(state) => state.get(key),
            Self::Production { conn, .. } => {
                let mut conn = conn.clone();
                conn.get(key).await.map_err(|e| store_error("GET", e))
            }
        }
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), Error> {
        match self {
            Self::Disabled => Err(disabled_error()),
            Self::Mock(state) => state.set(key, value, Some(Duration::from_secs(ttl_secs))),
            Self::Production { conn, .. } => {
                let mut conn = conn.clone();
                conn.set_ex(key, value, ttl_secs)
                    .await
                    .map_err(|e| store_error("SETEX", e))
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), Error> {
        match self {
            Self::Disabled => Err(disabled_error()),
            Self::Mock(state) => state.delete(key),
            Self::Production { conn, .. } => {
                let mut conn = conn.clone();
                conn.del(key).await.map_err(|e| store_error("DEL", e))
            }
        }
    }

    /// Append an entry to a stream, trimming it to roughly `maxlen` entries.
    pub async fn xadd_capped(
        &self,
        stream: &str,
        maxlen: usize,
        fields: &[(&str, String)],
    ) -> Result<(), Error> {
        match self {
            Self::Disabled => Err(disabled_error()),
            Self::Mock(state) => state.xadd(stream, fields),
            Self::Production { conn, .. } => {
                let mut conn = conn.clone();
                let mut cmd = redis::cmd("XADD");
                cmd.arg(stream)
                    .arg("MAXLEN")
                    .arg("~")
                    .arg(maxlen)
                    .arg("*");
                for (name, value) in fields {
                    cmd.arg(*name).arg(value);
                }
                cmd.query_async::<String>(&mut conn)
                    .await
                    .map(|_| ())
                    .map_err(|e| store_error("XADD", e))
            }
        }
    }

    /// Test-only view of the mock state. Returns `None` for real stores.
    pub fn mock_state(&self) -> Option<&MockStoreState> {
        match self {
            Self::Mock(state) => Some(state),
            _ => None,
        }
    }
}

fn disabled_error() -> Error {
    Error::new_without_logging(ErrorDetails::StoreUnavailable {
        message: "shared store is disabled".to_string(),
    })
}

fn store_error(op: &str, e: redis::RedisError) -> Error {
    Error::new(ErrorDetails::StoreUnavailable {
        message: format!("{op} failed: {e}"),
    })
}

struct MockEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MockEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory store double. Expirations use the tokio clock so tests can
/// drive them with `tokio::time::advance`.
pub struct MockStoreState {
    entries: Mutex<HashMap<String, MockEntry>>,
    streams: Mutex<HashMap<String, Vec<Vec<(String, String)>>>>,
    healthy: AtomicBool,
}

impl MockStoreState {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            healthy: AtomicBool::new(true),
        }
    }

    /// Flip the simulated outage switch.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    fn check_healthy(&self) -> Result<(), Error> {
        if self.healthy.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::new(ErrorDetails::StoreUnavailable {
                message: "mock store marked unhealthy".to_string(),
            }))
        }
    }

    fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<u64, Error> {
        self.check_healthy()?;
        // A poisoned lock indicates a panic in another thread while holding it,
        // which we treat as fatal.
        #[expect(clippy::expect_used)]
        let mut entries = self.entries.lock().expect("Mutex poisoned");
        match entries.get_mut(key).filter(|entry| !entry.is_expired()) {
            Some(entry) => {
                let count = entry.value.parse::<u64>().unwrap_or(0) + 1;
                entry.value = count.to_string();
                Ok(count)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    MockEntry {
                        value: "1".to_string(),
                        expires_at: ttl.map(|ttl| Instant::now() + ttl),
                    },
                );
                Ok(1)
            }
        }
    }

    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.check_healthy()?;
        #[expect(clippy::expect_used)]
        let mut entries = self.entries.lock().expect("Mutex poisoned");
        if entries.get(key).is_some_and(MockEntry::is_expired) {
            entries.remove(key);
        }
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error> {
        self.check_healthy()?;
        #[expect(clippy::expect_used)]
        let mut entries = self.entries.lock().expect("Mutex poisoned");
        entries.insert(
            key.to_string(),
            MockEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        self.check_healthy()?;
        #[expect(clippy::expect_used)]
        let mut entries = self.entries.lock().expect("Mutex poisoned");
        entries.remove(key);
        Ok(())
    }

    fn xadd(&self, stream: &str, fields: &[(&str, String)]) -> Result<(), Error> {
        self.check_healthy()?;
        #[expect(clippy::expect_used)]
        let mut streams = self.streams.lock().expect("Mutex poisoned");
        streams.entry(stream.to_string()).or_default().push(
            fields
                .iter()
                .map(|(name, value)| ((*name).to_string(), value.clone()))
                .collect(),
        );
        Ok(())
    }

    /// Current value of a plain entry, expired entries excluded.
    pub fn entry(&self, key: &str) -> Option<String> {
        #[expect(clippy::expect_used)]
        let entries = self.entries.lock().expect("Mutex poisoned");
        entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone())
    }

    /// Number of entries appended to a stream.
    pub fn stream_len(&self, stream: &str) -> usize {
        #[expect(clippy::expect_used)]
        let streams = self.streams.lock().expect("Mutex poisoned");
        streams.get(stream).map_or(0, Vec::len)
    }

    /// All entries appended to a stream, in order.
    pub fn stream_entries(&self, stream: &str) -> Vec<Vec<(String, String)>> {
        #[expect(clippy::expect_used)]
        let streams = self.streams.lock().expect("Mutex poisoned");
        streams.get(stream).cloned().unwrap_or_default()
    }
}
