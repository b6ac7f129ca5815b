//! Price-ref to plan-tier mapping
//!
//! The billing provider reports which price an owner pays for; the tier (and
//! the resource limit it implies) is derived locally from this catalog.

use std::collections::HashMap;

use impactline_shared::PlanTier;

#[derive(Debug, Clone, Default)]
pub struct TierCatalog {
    prices: HashMap<String, PlanTier>,
}

impl TierCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, price_ref: impl Into<String>, tier: PlanTier) -> Self {
        self.prices.insert(price_ref.into(), tier);
        self
    }

    /// Tier for a provider price ref. Unknown or absent refs map to
    /// `PlanTier::None`, which carries an unlimited resource cap.
    pub fn tier_for_price(&self, price_ref: Option<&str>) -> PlanTier {
        price_ref
            .and_then(|p| self.prices.get(p).copied())
            .unwrap_or(PlanTier::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_lookup() {
        let catalog = TierCatalog::new()
            .with_price("price_starter_monthly", PlanTier::Starter)
            .with_price("price_pro_monthly", PlanTier::Professional);

        assert_eq!(
            catalog.tier_for_price(Some("price_pro_monthly")),
            PlanTier::Professional
        );
        assert_eq!(catalog.tier_for_price(Some("price_unknown")), PlanTier::None);
        assert_eq!(catalog.tier_for_price(None), PlanTier::None);
    }
}
