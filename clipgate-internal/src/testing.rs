#![cfg(test)]

use std::sync::Arc;

use uuid::Uuid;

use crate::auth::{PlanTier, Principal, PrincipalStatus};
use crate::config_parser::{Config, PlanCatalog};
use crate::extractor::{ExtractionRetrier, VideoExtractor};
use crate::gateway_util::AppStateData;
use crate::store::SharedStore;

/// An active principal on the given plan, with the catalog's default limits
/// and entitlements.
pub fn test_principal(plan: PlanTier) -> Principal {
    let catalog = PlanCatalog::default();
    let limits = catalog.limits(plan);
    Principal {
        id: Uuid::now_v7(),
        email: format!("{plan}@example.com"),
        key_masked: "tk_tes***wxyz".to_string(),
        plan,
        status: PrincipalStatus::Active,
        is_blocked: false,
        block_reason: None,
        subscription_end: None,
        rate_limit_per_minute: limits.rate_limit_per_minute,
        monthly_quota: limits.monthly_quota,
        features: limits.features,
        last_request_at: None,
    }
}

/// App state over a mock store, with the extraction pipeline driven by the
/// given extractor double.
pub fn get_unit_test_app_state_data(
    config: Arc<Config>,
    extractor: Arc<dyn VideoExtractor>,
) -> AppStateData {
    get_unit_test_app_state_with_store(config, SharedStore::new_mock(), extractor)
}

pub fn get_unit_test_app_state_with_store(
    config: Arc<Config>,
    store: SharedStore,
    extractor: Arc<dyn VideoExtractor>,
) -> AppStateData {
    let retrier = Arc::new(ExtractionRetrier::new(extractor, &config.extractor));
    AppStateData::new_with_store(config, store)
        .expect("failed to build test app state")
        .with_retrier(retrier)
}
