//! Exact conversion between on-chain integer amounts and display decimals.
//!
//! On-chain amounts are unsigned integers in an asset's smallest unit and
//! are the ground truth for every exchange call. Display amounts are
//! [`Decimal`] values (or exact strings) used only for presentation and for
//! parsing user input back into on-chain amounts. Every conversion toward
//! the chain truncates toward zero; nothing here ever rounds up.

use std::fmt;
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Largest scale a [`Decimal`] can carry.
const MAX_DECIMAL_SCALE: u32 = 28;

/// Largest mantissa a [`Decimal`] can carry (2^96 - 1).
const MAX_DECIMAL_MANTISSA: u128 = 79_228_162_514_264_337_593_543_950_335;

/// A non-negative amount in an asset's smallest unit.
///
/// Serialized as a decimal string so values beyond 2^53 survive JSON
/// round trips; JSON integers are accepted on read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(pub u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    #[must_use]
    pub const fn new(units: u128) -> Self {
        Self(units)
    }

    /// Raw integer value in smallest units.
    #[must_use]
    pub const fn get(self) -> u128 {
        self.0
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    #[must_use]
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    #[must_use]
    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    #[must_use]
    pub fn checked_mul(self, factor: u128) -> Option<Amount> {
        self.0.checked_mul(factor).map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(u128::from(value))
    }
}

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl FromStr for Amount {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ConversionError::Empty);
        }
        if s.starts_with('-') {
            return Err(ConversionError::Negative(s.to_string()));
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConversionError::Invalid(s.to_string()));
        }
        s.parse::<u128>()
            .map(Amount)
            .map_err(|_| ConversionError::Overflow(s.to_string()))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl Visitor<'_> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or decimal integer string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
                Ok(Amount::from(v))
            }

            fn visit_u128<E: de::Error>(self, v: u128) -> Result<Amount, E> {
                Ok(Amount(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
                u64::try_from(v)
                    .map(Amount::from)
                    .map_err(|_| E::custom(format!("negative amount: {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

/// Reason an amount could not be converted or quantized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("empty amount")]
    Empty,
    #[error("not a decimal number: {0}")]
    Invalid(String),
    #[error("negative amount: {0}")]
    Negative(String),
    #[error("amount out of range: {0}")]
    Overflow(String),
    #[error("price must be positive, got {0}")]
    InvalidPrice(Decimal),
    #[error("step size must be non-zero")]
    ZeroStep,
}

/// Converts an on-chain amount to its display decimal (`amount / 10^decimals`).
///
/// Exact for every amount that fits in 28 significant digits. Larger
/// values lose their least significant digits (toward zero); the result is
/// for presentation only. Never fails.
#[must_use]
pub fn to_display(amount: Amount, decimals: u32) -> Decimal {
    let mut units = amount.get();
    let mut scale = decimals;

    loop {
        if units == 0 {
            return Decimal::ZERO;
        }
        if scale <= MAX_DECIMAL_SCALE && units <= MAX_DECIMAL_MANTISSA {
            // Both bounds checked above, so construction cannot fail.
            if let Ok(value) = Decimal::try_from_i128_with_scale(units as i128, scale) {
                return value.normalize();
            }
        }
        if scale == 0 {
            return Decimal::MAX;
        }
        units /= 10;
        scale -= 1;
    }
}

/// Formats an on-chain amount as an exact decimal string with trailing
/// fractional zeros trimmed, e.g. `(150000000, 8)` → `"1.5"`.
#[must_use]
pub fn format_amount(amount: Amount, decimals: u32) -> String {
    let digits = amount.get().to_string();
    let decimals = decimals as usize;
    if decimals == 0 {
        return digits;
    }

    let padded = if digits.len() <= decimals {
        format!("{}{digits}", "0".repeat(decimals + 1 - digits.len()))
    } else {
        digits
    };
    let (int_part, frac_part) = padded.split_at(padded.len() - decimals);
    let frac_part = frac_part.trim_end_matches('0');

    if frac_part.is_empty() {
        int_part.to_string()
    } else {
        format!("{int_part}.{frac_part}")
    }
}

/// Parses a display decimal string into an on-chain amount, truncating any
/// digits beyond `decimals` places.
///
/// `to_on_chain("0.129", 2)` is `12`, never `13`.
///
/// # Errors
///
/// Returns a [`ConversionError`] for empty, negative, non-numeric, or
/// out-of-range input.
pub fn to_on_chain(display: &str, decimals: u32) -> Result<Amount, ConversionError> {
    let trimmed = display.trim();
    if trimmed.is_empty() {
        return Err(ConversionError::Empty);
    }
    if trimmed.starts_with('-') {
        return Err(ConversionError::Negative(trimmed.to_string()));
    }
    let body = trimmed.strip_prefix('+').unwrap_or(trimmed);

    let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !all_digits(int_part) || !all_digits(frac_part)
    {
        return Err(ConversionError::Invalid(trimmed.to_string()));
    }

    let decimals = decimals as usize;
    let kept = &frac_part[..frac_part.len().min(decimals)];

    let mut digits = String::with_capacity(int_part.len() + decimals);
    digits.push_str(int_part);
    digits.push_str(kept);
    digits.extend(std::iter::repeat_n('0', decimals - kept.len()));

    let significant = digits.trim_start_matches('0');
    if significant.is_empty() {
        return Ok(Amount::ZERO);
    }
    significant
        .parse::<u128>()
        .map(Amount)
        .map_err(|_| ConversionError::Overflow(trimmed.to_string()))
}

/// [`to_on_chain`] for a value that is already a [`Decimal`].
///
/// # Errors
///
/// Returns [`ConversionError::Negative`] for negative values or
/// [`ConversionError::Overflow`] when the result exceeds `u128`.
pub fn to_on_chain_decimal(value: Decimal, decimals: u32) -> Result<Amount, ConversionError> {
    to_on_chain(&value.to_string(), decimals)
}

/// Truncates a decimal string to `places` fractional digits without any
/// floating-point round trip. `("1.23999", 2)` → `"1.23"`.
#[must_use]
pub fn truncate_decimal(value: &str, places: u32) -> String {
    let value = value.trim();
    match value.split_once('.') {
        None => value.to_string(),
        Some((int_part, frac_part)) => {
            let kept: String = frac_part.chars().take(places as usize).collect();
            if kept.is_empty() {
                int_part.to_string()
            } else {
                format!("{int_part}.{kept}")
            }
        }
    }
}

/// Number of significant digits in `price`, ignoring leading zeros and any
/// trailing zeros. `123.456` → 6, `0.0012` → 2, `1200` → 2.
#[must_use]
pub fn significant_digits(price: Decimal) -> u32 {
    let mut mantissa = price.normalize().mantissa().unsigned_abs();
    if mantissa == 0 {
        return 0;
    }
    while mantissa % 10 == 0 {
        mantissa /= 10;
    }
    mantissa.ilog10() + 1
}

/// Returns `true` iff `price` has at most `digits_limit` significant digits.
#[must_use]
pub fn price_within_digit_limit(price: Decimal, digits_limit: u32) -> bool {
    significant_digits(price) <= digits_limit
}

/// Result of fitting a desired quote amount to the exchange's volume step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantized {
    /// Base-asset volume whose quote equivalent is a whole number of steps.
    pub quantized_amount: Decimal,
    /// The desired quote amount floored to a whole number of steps.
    pub floored_amount: Decimal,
    /// One quote step expressed in base-asset units (`step / price`).
    pub step_size_in_base_units: Decimal,
    /// The base-unit step cannot be represented within the base asset's
    /// decimals. Callers must reject the order instead of rounding.
    pub overflow: bool,
}

/// Computes the largest base volume at `price` whose quote equivalent is an
/// exact multiple of the exchange's quote step and representable within
/// `base_decimals`.
///
/// `raw_quote_amount` is the desired quote-denominated amount (display
/// units) and `step_on_chain` the quote volume step in smallest units.
///
/// # Errors
///
/// Returns [`ConversionError::InvalidPrice`] for a non-positive price,
/// [`ConversionError::ZeroStep`] for a zero step, and
/// [`ConversionError::Negative`] for a negative desired amount.
pub fn quantize_to_step(
    price: Decimal,
    raw_quote_amount: Decimal,
    quote_decimals: u32,
    step_on_chain: Amount,
    base_decimals: u32,
) -> Result<Quantized, ConversionError> {
    if price <= Decimal::ZERO {
        return Err(ConversionError::InvalidPrice(price));
    }
    if step_on_chain.is_zero() {
        return Err(ConversionError::ZeroStep);
    }
    if raw_quote_amount.is_sign_negative() && !raw_quote_amount.is_zero() {
        return Err(ConversionError::Negative(raw_quote_amount.to_string()));
    }

    let overflow = || ConversionError::Overflow(raw_quote_amount.to_string());
    let step_quote = to_display(step_on_chain, quote_decimals);

    let steps = raw_quote_amount
        .checked_div(step_quote)
        .ok_or_else(overflow)?
        .floor();
    let floored_amount = steps.checked_mul(step_quote).ok_or_else(overflow)?.normalize();

    let step_base = step_quote.checked_div(price).ok_or_else(overflow)?.normalize();
    let representable = step_base.scale() <= base_decimals
        && step_base.checked_mul(price).is_some_and(|q| q == step_quote);

    if !representable {
        let approximate = floored_amount
            .checked_div(price)
            .unwrap_or(Decimal::ZERO)
            .round_dp_with_strategy(base_decimals.min(MAX_DECIMAL_SCALE), RoundingStrategy::ToZero)
            .normalize();
        return Ok(Quantized {
            quantized_amount: approximate,
            floored_amount,
            step_size_in_base_units: step_base,
            overflow: true,
        });
    }

    let quantized_amount = steps.checked_mul(step_base).ok_or_else(overflow)?.normalize();
    Ok(Quantized {
        quantized_amount,
        floored_amount,
        step_size_in_base_units: step_base,
        overflow: false,
    })
}
