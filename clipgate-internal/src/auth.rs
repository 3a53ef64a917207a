use axum::extract::{Request, State};
use axum::http::{header, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::gateway_util::{AppState, AuthenticationInfo};
use crate::usage::UsageRecord;

/// Header carrying the tenant credential.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Every issued credential starts with this prefix.
pub const API_KEY_PREFIX: &str = "tk_";

/// Hash an API key with SHA-256. The principal table never holds plaintext
/// credentials.
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Masked form of a credential, safe for logs and usage records.
/// Keys longer than 10 chars keep the first 6 and last 4; shorter ones keep
/// at most the first 3.
pub fn mask_api_key(api_key: &str) -> String {
    if api_key.len() > 10 {
        if let (Some(head), Some(tail)) = (api_key.get(..6), api_key.get(api_key.len() - 4..)) {
            return format!("{head}***{tail}");
        }
    }
    format!("{}***", api_key.get(..3).unwrap_or(""))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PlanTier {
    Free,
    Basic,
    Pro,
    Business,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PrincipalStatus {
    Active,
    Inactive,
    Suspended,
    Cancelled,
}

fn default_status() -> PrincipalStatus {
    PrincipalStatus::Active
}

/// Feature switches attached to a plan. The catalog grants country detection
/// to pro and business only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanFeatures {
    pub video_download: bool,
    pub basic_metadata: bool,
    pub country_detection: bool,
    pub priority_support: bool,
}

impl Default for PlanFeatures {
    fn default() -> Self {
        // Free-tier entitlements
        Self {
            video_download: true,
            basic_metadata: true,
            country_detection: false,
            priority_support: false,
        }
    }
}

/// A resolved tenant. Snapshots of this record flow through the request
/// pipeline; the canonical copy lives in the `PrincipalStore` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub email: String,
    /// Masked credential for logs and usage records.
    pub key_masked: String,
    pub plan: PlanTier,
    #[serde(default = "default_status")]
    pub status: PrincipalStatus,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub block_reason: Option<String>,
    /// End of the paid subscription window, when one applies.
    #[serde(default)]
    pub subscription_end: Option<DateTime<Utc>>,
    pub rate_limit_per_minute: u32,
    pub monthly_quota: u64,
    #[serde(default)]
    pub features: PlanFeatures,
    #[serde(default)]
    pub last_request_at: Option<DateTime<Utc>>,
}

/// Shared, hot-reloadable principal table keyed by credential hash.
///
/// Seeded from the config file at startup and kept current by the Redis
/// keyspace subscription in `redis_client`.
#[derive(Clone)]
pub struct PrincipalStore {
    principals: Arc<RwLock<HashMap<String, Principal>>>,
}

impl PrincipalStore {
    pub fn new(principals: HashMap<String, Principal>) -> Self {
        Self {
            principals: Arc::new(RwLock::new(principals)),
        }
    }

    pub fn empty() -> Self {
        Self::new(HashMap::new())
    }

    pub fn lookup_by_credential(&self, api_key: &str) -> Option<Principal> {
        let hashed_key = hash_api_key(api_key);
        self.lookup_by_hash(&hashed_key)
    }

    pub fn lookup_by_hash(&self, hashed_key: &str) -> Option<Principal> {
        // In practice, a poisoned RwLock indicates a panic in another thread while holding the lock.
        // This is a catastrophic failure that should not be recovered from.
        #[expect(clippy::expect_used)]
        let principals = self.principals.read().expect("RwLock poisoned");
        principals.get(hashed_key).cloned()
    }

    pub fn lookup_by_email(&self, email: &str) -> Option<Principal> {
        #[expect(clippy::expect_used)]
        let principals = self.principals.read().expect("RwLock poisoned");
        principals.values().find(|p| p.email == email).cloned()
    }

    pub fn upsert(&self, hashed_key: &str, principal: Principal) {
        #[expect(clippy::expect_used)]
        let mut principals = self.principals.write().expect("RwLock poisoned");
        principals.insert(hashed_key.to_string(), principal);
    }

    pub fn remove(&self, hashed_key: &str) {
        #[expect(clippy::expect_used)]
        let mut principals = self.principals.write().expect("RwLock poisoned");
        principals.remove(hashed_key);
    }

    /// Mark a principal blocked. Mirrors the control plane's block operation:
    /// the account is also suspended until `unblock` restores it.
    pub fn block(&self, principal_id: Uuid, reason: Option<String>) -> bool {
        #[expect(clippy::expect_used)]
        let mut principals = self.principals.write().expect("RwLock poisoned");
        match principals.values_mut().find(|p| p.id == principal_id) {
            Some(principal) => {
                principal.is_blocked = true;
                principal.block_reason = reason;
                principal.status = PrincipalStatus::Suspended;
                true
            }
            None => false,
        }
    }

    pub fn unblock(&self, principal_id: Uuid) -> bool {
        #[expect(clippy::expect_used)]
        let mut principals = self.principals.write().expect("RwLock poisoned");
        match principals.values_mut().find(|p| p.id == principal_id) {
            Some(principal) => {
                principal.is_blocked = false;
                principal.block_reason = None;
                principal.status = PrincipalStatus::Active;
                true
            }
            None => false,
        }
    }

    /// Update the last-activity timestamp on the canonical record.
    pub fn touch(&self, principal_id: Uuid) {
        #[expect(clippy::expect_used)]
        let mut principals = self.principals.write().expect("RwLock poisoned");
        if let Some(principal) = principals.values_mut().find(|p| p.id == principal_id) {
            principal.last_request_at = Some(Utc::now());
        }
    }

    pub fn count(&self) -> usize {
        #[expect(clippy::expect_used)]
        let principals = self.principals.read().expect("RwLock poisoned");
        principals.len()
    }
}

#[derive(Clone)]
pub struct Auth {
    principals: PrincipalStore,
    key_prefix: String,
}

impl Auth {
    pub fn new(principals: PrincipalStore, key_prefix: impl Into<String>) -> Self {
        Self {
            principals,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn principals(&self) -> &PrincipalStore {
        &self.principals
    }

    /// Resolve a credential to a principal.
    ///
    /// Checks run in a fixed order and short-circuit: presence and shape,
    /// table lookup, account status, block flag, subscription window. The
    /// shape check runs before any lookup, and nothing here mutates state.
    pub fn authenticate(&self, credential: Option<&str>) -> Result<Principal, Error> {
        let Some(api_key) = credential else {
            return Err(Error::new(ErrorDetails::ApiKeyMissing));
        };

        if !api_key.starts_with(&self.key_prefix) || api_key.len() <= self.key_prefix.len() {
            return Err(Error::new(ErrorDetails::ApiKeyInvalidFormat));
        }

        let Some(principal) = self.principals.lookup_by_credential(api_key) else {
            return Err(Error::new(ErrorDetails::ApiKeyNotFound));
        };

        if principal.status != PrincipalStatus::Active {
            return Err(Error::new(ErrorDetails::AccountInactive {
                status: principal.status.to_string(),
            }));
        }

        if principal.is_blocked {
            return Err(Error::new(ErrorDetails::AccountBlocked {
                reason: principal.block_reason.clone(),
            }));
        }

        if let Some(end) = principal.subscription_end {
            if end < Utc::now() {
                return Err(Error::new(ErrorDetails::SubscriptionExpired));
            }
        }

        Ok(principal)
    }
}

/// The development-mode principal used when authentication is disabled.
fn anonymous_principal() -> Principal {
    Principal {
        id: Uuid::nil(),
        email: "anonymous@localhost".to_string(),
        key_masked: "tk_***".to_string(),
        plan: PlanTier::Business,
        status: PrincipalStatus::Active,
        is_blocked: false,
        block_reason: None,
        subscription_end: None,
        rate_limit_per_minute: 500,
        monthly_quota: u64::MAX,
        features: PlanFeatures {
            video_download: true,
            basic_metadata: true,
            country_detection: true,
            priority_support: true,
        },
        last_request_at: None,
    }
}

/// Axum middleware guarding extraction routes.
///
/// On success the resolved `Principal` is inserted into request extensions
/// for the handler. Rejections where a principal was resolved (inactive,
/// blocked, expired) are still billed to it with a usage record; missing,
/// malformed, and unknown credentials are not, since there is nobody to
/// attribute them to.
pub async fn require_api_key(
    State(state): AppState,
    mut request: Request,
    next: Next,
) -> Result<Response, Response> {
    let auth = match &state.authentication_info {
        AuthenticationInfo::Enabled(auth) => auth,
        AuthenticationInfo::Disabled => {
            request.extensions_mut().insert(anonymous_principal());
            return Ok(next.run(request).await);
        }
    };

    let credential = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty());

    match auth.authenticate(credential) {
        Ok(principal) => {
            tracing::debug!(principal_id = %principal.id, email = %principal.email, "authenticated");
            request.extensions_mut().insert(principal);
            Ok(next.run(request).await)
        }
        Err(error) => {
            let billable = matches!(
                error.get_details(),
                ErrorDetails::AccountInactive { .. }
                    | ErrorDetails::AccountBlocked { .. }
                    | ErrorDetails::SubscriptionExpired
            );
            if billable {
                // The rejection happened after lookup, so the principal is
                // known and the attempt is recorded against it.
                if let Some(principal) =
                    credential.and_then(|key| auth.principals.lookup_by_credential(key))
                {
                    let record = UsageRecord::for_rejection(
                        &principal,
                        &request,
                        error.status_code().as_u16(),
                        error.kind(),
                    );
                    state.usage_recorder.append(record).await;
                }
            }

            let missing_key = matches!(error.get_details(), ErrorDetails::ApiKeyMissing);
            let mut response = error.into_response();
            if missing_key {
                response.headers_mut().insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("ApiKey"),
                );
            }
            Err(response)
        }
    }
}
