use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use uuid::Uuid;

use crate::auth::{hash_api_key, mask_api_key, PlanFeatures, PlanTier, Principal, PrincipalStatus};
use crate::error::{Error, ErrorDetails};

/// Deserialized `clipgate.toml`. Every section has a `Default` so the
/// gateway boots with no config file at all.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub quota: QuotaConfig,
    pub cache: CacheConfig,
    pub extractor: ExtractorConfig,
    pub plans: PlanCatalog,
    /// Seeded tenants, keyed by plaintext credential. The key is hashed at
    /// load time and never kept around.
    pub principals: HashMap<String, PrincipalSeed>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    /// Debug mode relaxes error redaction in responses.
    pub debug: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// `None` means enabled (the safe default).
    pub enabled: Option<bool>,
    pub key_prefix: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            key_prefix: crate::auth::API_KEY_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuotaConfig {
    pub enabled: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    /// TTL for cached extractions, in seconds.
    pub ttl_s: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_s: 3600,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractorConfig {
    /// Per-attempt deadline, in seconds.
    pub timeout_s: u64,
    /// Total attempts, including the first.
    pub max_retries: u32,
    /// Override for the upstream user-agent string.
    pub user_agent: Option<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            timeout_s: 30,
            max_retries: 3,
            user_agent: None,
        }
    }
}

/// Per-tier limits and entitlements.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanLimits {
    pub rate_limit_per_minute: u32,
    pub monthly_quota: u64,
    #[serde(default)]
    pub features: PlanFeatures,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlanCatalog {
    pub free: PlanLimits,
    pub basic: PlanLimits,
    pub pro: PlanLimits,
    pub business: PlanLimits,
}

impl PlanCatalog {
    pub fn limits(&self, tier: PlanTier) -> &PlanLimits {
        match tier {
            PlanTier::Free => &self.free,
            PlanTier::Basic => &self.basic,
            PlanTier::Pro => &self.pro,
            PlanTier::Business => &self.business,
        }
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        let free_features = PlanFeatures::default();
        let paid_features = PlanFeatures {
            country_detection: true,
            ..free_features
        };
        Self {
            free: PlanLimits {
                rate_limit_per_minute: 10,
                monthly_quota: 50,
                features: free_features,
            },
            basic: PlanLimits {
                rate_limit_per_minute: 30,
                monthly_quota: 1_000,
                features: free_features,
            },
            pro: PlanLimits {
                rate_limit_per_minute: 100,
                monthly_quota: 10_000,
                features: paid_features,
            },
            business: PlanLimits {
                rate_limit_per_minute: 500,
                monthly_quota: 100_000,
                features: PlanFeatures {
                    priority_support: true,
                    ..paid_features
                },
            },
        }
    }
}

/// A tenant seeded from the config file. Limits fall back to the plan
/// catalog unless overridden per principal.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrincipalSeed {
    pub email: String,
    #[serde(default = "PrincipalSeed::default_plan")]
    pub plan: PlanTier,
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub status: Option<PrincipalStatus>,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub subscription_end: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub monthly_quota: Option<u64>,
    #[serde(default)]
    pub features: Option<PlanFeatures>,
}

impl PrincipalSeed {
    fn default_plan() -> PlanTier {
        PlanTier::Free
    }

    pub fn into_principal(self, api_key: &str, catalog: &PlanCatalog) -> Principal {
        let limits = catalog.limits(self.plan);
        Principal {
            id: self.id.unwrap_or_else(Uuid::now_v7),
            email: self.email,
            key_masked: mask_api_key(api_key),
            plan: self.plan,
            status: self.status.unwrap_or(PrincipalStatus::Active),
            is_blocked: self.is_blocked,
            block_reason: self.block_reason,
            subscription_end: self.subscription_end,
            rate_limit_per_minute: self.rate_limit_per_minute.unwrap_or(limits.rate_limit_per_minute),
            monthly_quota: self.monthly_quota.unwrap_or(limits.monthly_quota),
            features: self.features.unwrap_or(limits.features),
            last_request_at: None,
        }
    }
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file {}: {e}", path.display()),
            })
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file {}: {e}", path.display()),
            })
        })?;
        config.verify()?;
        Ok(config)
    }

    fn verify(&self) -> Result<(), Error> {
        if self.auth.key_prefix.is_empty() {
            return Err(Error::new(ErrorDetails::Config {
                message: "auth.key_prefix must not be empty".to_string(),
            }));
        }
        if self.extractor.max_retries == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "extractor.max_retries must be at least 1".to_string(),
            }));
        }
        if self.extractor.timeout_s == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "extractor.timeout_s must be at least 1".to_string(),
            }));
        }
        if self.cache.enabled && self.cache.ttl_s == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "cache.ttl_s must be at least 1 when the cache is enabled".to_string(),
            }));
        }
        for api_key in self.principals.keys() {
            if !api_key.starts_with(&self.auth.key_prefix) {
                tracing::warn!(
                    api_key = %mask_api_key(api_key),
                    "Seeded credential does not carry the configured key prefix and will never authenticate"
                );
            }
        }
        Ok(())
    }

    /// Build the principal table seeded from `[principals.*]`, keyed by
    /// credential hash.
    pub fn principal_table(&self) -> HashMap<String, Principal> {
        self.principals
            .iter()
            .map(|(api_key, seed)| {
                (
                    hash_api_key(api_key),
                    seed.clone().into_principal(api_key, &self.plans),
                )
            })
            .collect()
    }
}
