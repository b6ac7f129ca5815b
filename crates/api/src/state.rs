//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use impactline_entitlement::{PgEntitlementStore, PgInheritanceLookup, TierCatalog};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub store: Arc<PgEntitlementStore>,
    pub inheritance: Arc<PgInheritanceLookup>,
    pub catalog: TierCatalog,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let store = Arc::new(PgEntitlementStore::new(pool.clone()));
        let inheritance = Arc::new(PgInheritanceLookup::new(pool.clone()));
        let catalog = config.tier_catalog();

        Self {
            pool,
            config,
            store,
            inheritance,
            catalog,
        }
    }
}
