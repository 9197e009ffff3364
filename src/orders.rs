//! Client-side order validation.
//!
//! Enforces the exchange's [`OrderSettings`] before any network call so a
//! malformed order surfaces synchronously as a field error instead of a
//! remote rejection. Every check is exact: volumes and prices are
//! [`Decimal`] values converted to on-chain integers only after they are
//! known to be representable.

use std::fmt;

use rust_decimal::Decimal;

use crate::fixed_point::{self, ConversionError};
use crate::models::{Asset, OrderSettings, OrderSide, PlaceOrderRequest};

/// Reason an order was rejected before submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderValidationError {
    NonPositivePrice {
        price: Decimal,
    },
    TooManyPriceDigits {
        price: Decimal,
        limit: u32,
    },
    PricePrecision {
        price: Decimal,
        decimals: u32,
    },
    NonPositiveVolume {
        volume: Decimal,
    },
    VolumePrecision {
        volume: Decimal,
        decimals: u32,
    },
    BelowMinimum {
        quote_volume: Decimal,
        minimum: Decimal,
    },
    NotStepMultiple {
        quote_volume: Decimal,
        step: Decimal,
    },
    /// The base-unit equivalent of one quote step needs more decimals than
    /// the base asset has.
    StepOverflow {
        price: Decimal,
        step_in_base: Decimal,
    },
    Conversion(ConversionError),
}

impl fmt::Display for OrderValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositivePrice { price } => write!(f, "price must be positive, got {price}"),
            Self::TooManyPriceDigits { price, limit } => {
                write!(f, "price {price} exceeds {limit} significant digits")
            }
            Self::PricePrecision { price, decimals } => {
                write!(f, "price {price} has more than {decimals} decimal places")
            }
            Self::NonPositiveVolume { volume } => {
                write!(f, "volume must be positive, got {volume}")
            }
            Self::VolumePrecision { volume, decimals } => {
                write!(f, "volume {volume} has more than {decimals} decimal places")
            }
            Self::BelowMinimum {
                quote_volume,
                minimum,
            } => write!(f, "quote volume {quote_volume} is below minimum {minimum}"),
            Self::NotStepMultiple { quote_volume, step } => {
                write!(f, "quote volume {quote_volume} is not a multiple of {step}")
            }
            Self::StepOverflow {
                price,
                step_in_base,
            } => write!(
                f,
                "at price {price} one volume step is {step_in_base}, which the base asset cannot represent"
            ),
            Self::Conversion(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for OrderValidationError {}

impl From<ConversionError> for OrderValidationError {
    fn from(e: ConversionError) -> Self {
        Self::Conversion(e)
    }
}

/// Validates a limit order and converts it to on-chain integers.
///
/// `price` is in quote units per whole base token, `volume` in base units.
///
/// # Errors
///
/// Returns the first [`OrderValidationError`] the order violates.
pub fn validate_order(
    settings: &OrderSettings,
    base: &Asset,
    quote: &Asset,
    side: OrderSide,
    price: Decimal,
    volume: Decimal,
) -> Result<PlaceOrderRequest, OrderValidationError> {
    // 1. Price sanity and digit limit
    if price <= Decimal::ZERO {
        return Err(OrderValidationError::NonPositivePrice { price });
    }
    if !fixed_point::price_within_digit_limit(price, settings.price_digits_limit) {
        return Err(OrderValidationError::TooManyPriceDigits {
            price,
            limit: settings.price_digits_limit,
        });
    }
    if price.normalize().scale() > quote.decimals {
        return Err(OrderValidationError::PricePrecision {
            price,
            decimals: quote.decimals,
        });
    }

    // 2. Volume sanity and base precision
    if volume <= Decimal::ZERO {
        return Err(OrderValidationError::NonPositiveVolume { volume });
    }
    if volume.normalize().scale() > base.decimals {
        return Err(OrderValidationError::VolumePrecision {
            volume,
            decimals: base.decimals,
        });
    }

    // 3. Quote volume against minimum and step
    let quote_volume = volume
        .checked_mul(price)
        .ok_or_else(|| ConversionError::Overflow(format!("{volume} * {price}")))?;
    let minimum = settings.minimum_quote_volume_display(quote.decimals);
    if quote_volume < minimum {
        return Err(OrderValidationError::BelowMinimum {
            quote_volume,
            minimum,
        });
    }
    let step = settings.quote_volume_step_display(quote.decimals);
    if !step.is_zero() && !(quote_volume % step).is_zero() {
        return Err(OrderValidationError::NotStepMultiple { quote_volume, step });
    }

    Ok(PlaceOrderRequest {
        ledger: base.ledger.clone(),
        side,
        volume: fixed_point::to_on_chain_decimal(volume, base.decimals)?,
        price: fixed_point::to_on_chain_decimal(price, quote.decimals)?,
    })
}

/// Largest base volume at `price` whose quote value is a whole number of
/// steps and no more than `desired_quote`.
///
/// # Errors
///
/// Returns [`OrderValidationError::StepOverflow`] when the step cannot be
/// expressed in base units, or a conversion error for invalid inputs.
pub fn volume_for_quote(
    settings: &OrderSettings,
    base: &Asset,
    quote: &Asset,
    price: Decimal,
    desired_quote: Decimal,
) -> Result<Decimal, OrderValidationError> {
    let quantized = fixed_point::quantize_to_step(
        price,
        desired_quote,
        quote.decimals,
        settings.quote_volume_step,
        base.decimals,
    )?;
    if quantized.overflow {
        return Err(OrderValidationError::StepOverflow {
            price,
            step_in_base: quantized.step_size_in_base_units,
        });
    }
    Ok(quantized.quantized_amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_point::Amount;
    use crate::models::LedgerId;
    use rust_decimal_macros::dec;

    fn settings() -> OrderSettings {
        OrderSettings {
            // 5 USDC minimum, 0.01 USDC step
            minimum_quote_volume: Amount(5_000_000),
            quote_volume_step: Amount(10_000),
            price_digits_limit: 5,
        }
    }

    fn btc() -> Asset {
        Asset {
            symbol: "ckBTC".into(),
            decimals: 8,
            ledger: LedgerId::new("btc"),
            fee: Amount(10),
        }
    }

    fn usdc() -> Asset {
        Asset {
            symbol: "ckUSDC".into(),
            decimals: 6,
            ledger: LedgerId::new("usdc"),
            fee: Amount(10_000),
        }
    }

    #[test]
    fn approve_valid_order() {
        let order = validate_order(&settings(), &btc(), &usdc(), OrderSide::Bid, dec!(61250), dec!(0.001))
            .unwrap();
        assert_eq!(order.volume, Amount(100_000));
        assert_eq!(order.price, Amount(61_250_000_000));
        assert_eq!(order.ledger, LedgerId::new("btc"));
    }

    #[test]
    fn reject_too_many_price_digits() {
        let result = validate_order(&settings(), &btc(), &usdc(), OrderSide::Ask, dec!(61250.5), dec!(0.001));
        assert!(matches!(
            result,
            Err(OrderValidationError::TooManyPriceDigits { limit: 5, .. })
        ));
    }

    #[test]
    fn reject_non_positive_inputs() {
        let s = settings();
        assert!(matches!(
            validate_order(&s, &btc(), &usdc(), OrderSide::Bid, dec!(0), dec!(1)),
            Err(OrderValidationError::NonPositivePrice { .. })
        ));
        assert!(matches!(
            validate_order(&s, &btc(), &usdc(), OrderSide::Bid, dec!(100), dec!(-1)),
            Err(OrderValidationError::NonPositiveVolume { .. })
        ));
    }

    #[test]
    fn reject_volume_beyond_base_precision() {
        let result = validate_order(&settings(), &btc(), &usdc(), OrderSide::Bid, dec!(10000), dec!(0.000000001));
        assert!(matches!(
            result,
            Err(OrderValidationError::VolumePrecision { decimals: 8, .. })
        ));
    }

    #[test]
    fn reject_below_minimum() {
        // 0.00001 * 61250 = 0.6125 < 5
        let result = validate_order(&settings(), &btc(), &usdc(), OrderSide::Bid, dec!(61250), dec!(0.00001));
        assert!(matches!(result, Err(OrderValidationError::BelowMinimum { .. })));
    }

    #[test]
    fn reject_off_step_quote_volume() {
        // 0.00012345 * 61250 = 7.56131... not a multiple of 0.01
        let result = validate_order(&settings(), &btc(), &usdc(), OrderSide::Bid, dec!(61250), dec!(0.00012345));
        assert!(matches!(result, Err(OrderValidationError::NotStepMultiple { .. })));
    }

    #[test]
    fn volume_for_quote_rounds_down_to_step() {
        let volume = volume_for_quote(&settings(), &btc(), &usdc(), dec!(2), dec!(10.015)).unwrap();
        assert_eq!(volume, dec!(5.005));
    }

    #[test]
    fn volume_for_quote_rejects_unrepresentable_step() {
        let result = volume_for_quote(&settings(), &btc(), &usdc(), dec!(3), dec!(10));
        assert!(matches!(result, Err(OrderValidationError::StepOverflow { .. })));
    }

    #[test]
    fn display_errors() {
        let err = OrderValidationError::BelowMinimum {
            quote_volume: dec!(0.6125),
            minimum: dec!(5),
        };
        assert_eq!(err.to_string(), "quote volume 0.6125 is below minimum 5");
    }
}
