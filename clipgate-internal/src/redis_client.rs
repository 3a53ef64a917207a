//! Live principal synchronization from the shared store.
//!
//! The control plane writes each tenant as a JSON document under
//! `principal:<credential-hash>`. The gateway bulk-loads those documents at
//! startup and then follows keyspace notifications, so key issuance,
//! revocation, and plan changes take effect without a restart. Block and
//! unblock commands arrive on a dedicated pub/sub channel.

use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::instrument;
use uuid::Uuid;

use crate::auth::{Auth, Principal};
use crate::error::{Error, ErrorDetails};

const PRINCIPAL_KEY_PREFIX: &str = "principal:";
const PRINCIPAL_UPDATES_CHANNEL: &str = "principal_updates";

pub struct RedisClient {
    client: redis::Client,
    conn: MultiplexedConnection,
    auth: Auth,
}

impl RedisClient {
    pub async fn new(url: &str, auth: Auth) -> Result<Self, Error> {
        let (client, conn) = Self::init_conn(url).await.map_err(|e| {
            tracing::error!("Failed to connect to Redis: {e}");
            Error::new(ErrorDetails::InternalError {
                message: format!("Redis connection failed: {e}"),
            })
        })?;
        Ok(Self { client, conn, auth })
    }

    async fn init_conn(url: &str) -> Result<(redis::Client, MultiplexedConnection), Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to get Redis connection: {e}"),
                })
            })?;

        Ok((client, conn))
    }

    fn parse_principal(json: &str) -> Result<Principal, Error> {
        serde_json::from_str(json).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse principal JSON from redis: {e}"),
            })
        })
    }

    /// A `set` event fires for every write in the database, including this
    /// gateway's own cache entries; anything outside the principal namespace
    /// is ignored.
    async fn handle_set_key_event(
        key: &str,
        conn: &mut MultiplexedConnection,
        auth: &Auth,
    ) -> Result<(), Error> {
        let Some(hashed_key) = key.strip_prefix(PRINCIPAL_KEY_PREFIX) else {
            return Ok(());
        };

        let value = conn.get::<_, String>(key).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to get value for key {key} from Redis: {e}"),
            })
        })?;

        match Self::parse_principal(&value) {
            Ok(principal) => {
                tracing::debug!(principal_id = %principal.id, "Upserting principal from keyspace event");
                auth.principals().upsert(hashed_key, principal);
            }
            Err(e) => {
                tracing::error!("Failed to parse principal from redis (key: {key}): {e}");
            }
        }

        Ok(())
    }

    fn handle_del_key_event(key: &str, auth: &Auth) {
        if let Some(hashed_key) = key.strip_prefix(PRINCIPAL_KEY_PREFIX) {
            auth.principals().remove(hashed_key);
            tracing::info!("Removed principal after keyspace event");
        }
    }

    /// Apply a block or unblock command published by the control plane.
    /// The payload is `{"principal_id": ..., "action": "block"|"unblock",
    /// "reason": ...}`.
    fn handle_principal_update(payload: &str, auth: &Auth) -> Result<(), Error> {
        let update: serde_json::Value = serde_json::from_str(payload).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse principal update: {e}"),
            })
        })?;

        let principal_id = update
            .get("principal_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                Error::new(ErrorDetails::Config {
                    message: "Principal update is missing a valid principal_id".to_string(),
                })
            })?;

        match update.get("action").and_then(|v| v.as_str()) {
            Some("block") => {
                let reason = update
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                if auth.principals().block(principal_id, reason) {
                    tracing::info!(%principal_id, "Blocked principal");
                } else {
                    tracing::warn!(%principal_id, "Block update for unknown principal");
                }
            }
            Some("unblock") => {
                if auth.principals().unblock(principal_id) {
                    tracing::info!(%principal_id, "Unblocked principal");
                } else {
                    tracing::warn!(%principal_id, "Unblock update for unknown principal");
                }
            }
            other => {
                tracing::warn!("Unknown principal update action: {other:?}");
            }
        }

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn start(mut self) -> Result<(), Error> {
        // Initial fetch: bulk-load every principal document
        if let Ok(keys) = self
            .conn
            .keys::<_, Vec<String>>(format!("{PRINCIPAL_KEY_PREFIX}*"))
            .await
        {
            let mut loaded = 0usize;
            for key in keys {
                if let Ok(json) = self.conn.get::<_, String>(&key).await {
                    match Self::parse_principal(&json) {
                        Ok(principal) => {
                            let hashed_key =
                                key.strip_prefix(PRINCIPAL_KEY_PREFIX).unwrap_or(&key);
                            self.auth.principals().upsert(hashed_key, principal);
                            loaded += 1;
                        }
                        Err(e) => tracing::error!(
                            "Failed to parse initial principal from redis (key: {key}): {e}"
                        ),
                    }
                }
            }
            tracing::info!("Loaded {loaded} principals from the shared store");
        }

        // Keyspace notifications require `notify-keyspace-events` to include
        // `Kg$x` (or `KEA`) on the server
        let mut pubsub_conn = self.client.get_async_pubsub().await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to connect to redis: {e}"),
            })
        })?;

        pubsub_conn
            .psubscribe("__keyevent@*__:set")
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to subscribe to redis: {e}"),
                })
            })?;

        pubsub_conn
            .psubscribe("__keyevent@*__:del")
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to subscribe to redis: {e}"),
                })
            })?;

        pubsub_conn
            .psubscribe("__keyevent@*__:expired")
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to subscribe to redis: {e}"),
                })
            })?;

        pubsub_conn
            .subscribe(PRINCIPAL_UPDATES_CHANNEL)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to subscribe to principal updates: {e}"),
                })
            })?;

        let auth = self.auth.clone();
        let mut conn = self.conn.clone();

        tokio::spawn(async move {
            let mut stream = pubsub_conn.on_message();
            while let Some(msg) = stream.next().await {
                let channel: String = msg.get_channel_name().to_string();

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::error!("Failed to decode redis message: {e}");
                        continue;
                    }
                };

                match channel.as_str() {
                    c if c.ends_with("__:set") => {
                        if let Err(e) =
                            Self::handle_set_key_event(payload.as_str(), &mut conn, &auth).await
                        {
                            tracing::error!("Failed to handle set key event: {e}");
                        }
                    }
                    c if c.ends_with("__:del") || c.ends_with("__:expired") => {
                        Self::handle_del_key_event(payload.as_str(), &auth);
                    }
                    PRINCIPAL_UPDATES_CHANNEL => {
                        if let Err(e) = Self::handle_principal_update(&payload, &auth) {
                            tracing::error!("Failed to handle principal update: {e}");
                        }
                    }
                    _ => {
                        tracing::warn!("Received message from unknown channel: {channel}");
                    }
                }
            }
        });

        Ok(())
    }
}
