//! Application configuration

use std::env;

use impactline_entitlement::TierCatalog;
use impactline_shared::PlanTier;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_direct_url: Option<String>,

    // Billing provider
    pub billing_webhook_secret: String,
    pub billing_price_starter: Option<String>,
    pub billing_price_professional: Option<String>,
    pub billing_price_enterprise: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_direct_url: env::var("DATABASE_DIRECT_URL").ok(),

            billing_webhook_secret: {
                let secret = env::var("BILLING_WEBHOOK_SECRET")
                    .map_err(|_| ConfigError::Missing("BILLING_WEBHOOK_SECRET"))?;
                if secret.len() < 16 {
                    return Err(ConfigError::WeakSecret(
                        "BILLING_WEBHOOK_SECRET must be at least 16 characters",
                    ));
                }
                secret
            },
            billing_price_starter: env::var("BILLING_PRICE_STARTER").ok(),
            billing_price_professional: env::var("BILLING_PRICE_PROFESSIONAL").ok(),
            billing_price_enterprise: env::var("BILLING_PRICE_ENTERPRISE").ok(),
        })
    }

    /// Build the price-ref to tier catalog from the configured price ids.
    pub fn tier_catalog(&self) -> TierCatalog {
        let mut catalog = TierCatalog::new();
        if let Some(price) = &self.billing_price_starter {
            catalog = catalog.with_price(price.clone(), PlanTier::Starter);
        }
        if let Some(price) = &self.billing_price_professional {
            catalog = catalog.with_price(price.clone(), PlanTier::Professional);
        }
        if let Some(price) = &self.billing_price_enterprise {
            catalog = catalog.with_price(price.clone(), PlanTier::Enterprise);
        }
        catalog
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_catalog_maps_configured_prices() {
        let config = Config {
            bind_address: "0.0.0.0:3000".into(),
            database_url: "postgres://localhost/test".into(),
            database_direct_url: None,
            billing_webhook_secret: "whsec_0123456789abcdef".into(),
            billing_price_starter: Some("price_starter".into()),
            billing_price_professional: Some("price_pro".into()),
            billing_price_enterprise: None,
        };

        let catalog = config.tier_catalog();
        assert_eq!(catalog.tier_for_price(Some("price_pro")), PlanTier::Professional);
        assert_eq!(catalog.tier_for_price(Some("price_starter")), PlanTier::Starter);
        assert_eq!(catalog.tier_for_price(Some("price_ent")), PlanTier::None);
    }
}
