//! Exchange order settings.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::fixed_point::{self, Amount};

/// Order constraints enforced by the exchange.
///
/// Every order's quote volume must be an exact multiple of
/// `quote_volume_step` and at least `minimum_quote_volume`; every price
/// must have at most `price_digits_limit` significant digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSettings {
    pub minimum_quote_volume: Amount,
    pub quote_volume_step: Amount,
    pub price_digits_limit: u32,
}

impl OrderSettings {
    #[must_use]
    pub fn minimum_quote_volume_display(&self, quote_decimals: u32) -> Decimal {
        fixed_point::to_display(self.minimum_quote_volume, quote_decimals)
    }

    #[must_use]
    pub fn quote_volume_step_display(&self, quote_decimals: u32) -> Decimal {
        fixed_point::to_display(self.quote_volume_step, quote_decimals)
    }
}
