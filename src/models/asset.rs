//! Asset reference data, keyed by ledger identifier.

use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::fixed_point::{self, Amount, ConversionError};

/// Identifier of a token ledger (its principal).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerId(pub String);

impl LedgerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata a ledger reports about its own token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LedgerMetadata {
    pub symbol: String,
    pub decimals: u32,
    /// Transfer fee in smallest units.
    pub fee: Amount,
}

/// A tradable asset.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Asset {
    pub symbol: String,
    pub decimals: u32,
    pub ledger: LedgerId,
    /// Transfer fee in smallest units.
    pub fee: Amount,
}

impl Asset {
    #[must_use]
    pub fn from_metadata(ledger: LedgerId, metadata: LedgerMetadata) -> Self {
        Self {
            symbol: metadata.symbol,
            decimals: metadata.decimals,
            ledger,
            fee: metadata.fee,
        }
    }

    /// Display value of an on-chain amount of this asset.
    #[must_use]
    pub fn to_display(&self, amount: Amount) -> Decimal {
        fixed_point::to_display(amount, self.decimals)
    }

    /// Exact display string of an on-chain amount of this asset.
    #[must_use]
    pub fn format(&self, amount: Amount) -> String {
        fixed_point::format_amount(amount, self.decimals)
    }

    /// Parses user input into an on-chain amount of this asset (truncating).
    pub fn parse(&self, display: &str) -> Result<Amount, ConversionError> {
        fixed_point::to_on_chain(display, self.decimals)
    }
}

/// Read-only asset table loaded once per login.
#[derive(Debug, Clone, Default)]
pub struct AssetRegistry {
    assets: BTreeMap<LedgerId, Asset>,
    quote: Option<LedgerId>,
}

impl AssetRegistry {
    #[must_use]
    pub fn new(quote: Option<LedgerId>, assets: impl IntoIterator<Item = Asset>) -> Self {
        Self {
            assets: assets
                .into_iter()
                .map(|asset| (asset.ledger.clone(), asset))
                .collect(),
            quote,
        }
    }

    pub fn get(&self, ledger: &LedgerId) -> Option<&Asset> {
        self.assets.get(ledger)
    }

    /// Looks an asset up by its ticker symbol.
    pub fn by_symbol(&self, symbol: &str) -> Option<&Asset> {
        self.assets.values().find(|a| a.symbol == symbol)
    }

    /// The asset every price and quote volume is denominated in.
    pub fn quote(&self) -> Option<&Asset> {
        self.quote.as_ref().and_then(|id| self.assets.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Asset> {
        self.assets.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ckbtc() -> Asset {
        Asset {
            symbol: "ckBTC".into(),
            decimals: 8,
            ledger: LedgerId::new("mxzaz-hqaaa-aaaar-qaada-cai"),
            fee: Amount(10),
        }
    }

    fn usdc() -> Asset {
        Asset {
            symbol: "ckUSDC".into(),
            decimals: 6,
            ledger: LedgerId::new("xevnm-gaaaa-aaaar-qafnq-cai"),
            fee: Amount(10_000),
        }
    }

    #[test]
    fn registry_lookups() {
        let quote = usdc().ledger;
        let registry = AssetRegistry::new(Some(quote.clone()), [ckbtc(), usdc()]);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.quote().map(|a| a.symbol.as_str()), Some("ckUSDC"));
        assert_eq!(registry.by_symbol("ckBTC"), Some(&ckbtc()));
        assert!(registry.get(&LedgerId::new("unknown")).is_none());
    }

    #[test]
    fn asset_conversions_use_its_decimals() {
        let asset = ckbtc();
        assert_eq!(asset.to_display(Amount(150_000_000)), dec!(1.5));
        assert_eq!(asset.format(Amount(10_000)), "0.0001");
        assert_eq!(asset.parse("0.123456789"), Ok(Amount(12_345_678)));
    }
}
