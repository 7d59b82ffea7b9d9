use coinrun_core::{Coins, PriceRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("unknown coin pack '{0}'")]
    UnknownCoinPack(String),
}

/// A purchasable bundle of coins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinPack {
    pub id: String,
    pub coins: Coins,
    pub usd_cents: u64,
}

impl CoinPack {
    pub fn new(id: impl Into<String>, coins: u64, usd_cents: u64) -> Self {
        Self {
            id: id.into(),
            coins: Coins(coins),
            usd_cents,
        }
    }

    /// Pre-validated `(amount, price)` pair for a purchase.
    pub fn quote(&self) -> (Coins, PriceRef) {
        (
            self.coins,
            PriceRef::new(self.id.clone()).with_usd_cents(self.usd_cents),
        )
    }
}

/// Fixed price list standing in for a payment provider.
#[derive(Debug, Clone)]
pub struct CoinPackCatalog {
    packs: Vec<CoinPack>,
}

impl Default for CoinPackCatalog {
    fn default() -> Self {
        Self::new(vec![
            CoinPack::new("starter-100", 100, 1_000),
            CoinPack::new("builder-500", 500, 5_000),
            CoinPack::new("shipper-1000", 1_000, 10_000),
        ])
    }
}

impl CoinPackCatalog {
    pub fn new(packs: Vec<CoinPack>) -> Self {
        Self { packs }
    }

    pub fn packs(&self) -> &[CoinPack] {
        &self.packs
    }

    pub fn resolve(&self, pack_id: &str) -> Result<(Coins, PriceRef), PricingError> {
        self.packs
            .iter()
            .find(|pack| pack.id == pack_id)
            .map(CoinPack::quote)
            .ok_or_else(|| PricingError::UnknownCoinPack(pack_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_packs_resolve_to_coins_and_cents() {
        let catalog = CoinPackCatalog::default();
        let (coins, price) = catalog.resolve("builder-500").unwrap();
        assert_eq!(coins, Coins(500));
        assert_eq!(price.reference, "builder-500");
        assert_eq!(price.usd_cents, Some(5_000));
        assert_eq!(catalog.packs().len(), 3);
    }

    #[test]
    fn unknown_pack_is_rejected() {
        assert_eq!(
            CoinPackCatalog::default().resolve("mega-9000"),
            Err(PricingError::UnknownCoinPack("mega-9000".to_string()))
        );
    }
}
