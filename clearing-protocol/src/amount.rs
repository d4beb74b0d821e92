//! Exact amount conversion between decimal strings and integer minor units
//!
//! The wire API carries human amounts ("5", "0.25"); the clearing network
//! expects the asset's integer minor-unit representation. Conversion uses
//! `rust_decimal` mantissa/scale arithmetic only, so repeated fractional
//! amounts never drift.

use crate::{Error, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Largest decimal exponent a settlement asset may declare
pub const MAX_ASSET_DECIMALS: u32 = 18;

/// Parse a non-negative decimal amount string
///
/// Digits are taken exactly: input that would need rounding to fit a
/// `Decimal` is rejected, as are `_` digit separators.
pub fn parse_amount(raw: &str) -> Result<Decimal> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Amount("amount is empty".to_string()));
    }
    if trimmed.contains('_') {
        return Err(Error::Amount(format!("'{}' is not a number", trimmed)));
    }

    let amount = Decimal::from_str_exact(trimmed)
        .map_err(|e| Error::Amount(format!("'{}' is not a number: {}", trimmed, e)))?;

    if amount < Decimal::ZERO {
        return Err(Error::Amount(format!("'{}' is negative", trimmed)));
    }

    Ok(amount)
}

/// Convert a decimal amount to integer minor units for an asset with `decimals`
///
/// Fails when the amount is negative, carries more fractional digits than the
/// asset supports, or does not fit in 128 bits.
pub fn to_minor_units(amount: Decimal, decimals: u32) -> Result<u128> {
    if decimals > MAX_ASSET_DECIMALS {
        return Err(Error::Amount(format!(
            "asset decimals {} exceed maximum {}",
            decimals, MAX_ASSET_DECIMALS
        )));
    }
    if amount < Decimal::ZERO {
        return Err(Error::Amount(format!("{} is negative", amount)));
    }

    let normalized = amount.normalize();
    let scale = normalized.scale();
    if scale > decimals {
        return Err(Error::Amount(format!(
            "{} has {} fractional digits, asset supports {}",
            amount, scale, decimals
        )));
    }

    let mantissa = u128::try_from(normalized.mantissa())
        .map_err(|_| Error::Amount(format!("{} is negative", amount)))?;

    10u128
        .checked_pow(decimals - scale)
        .and_then(|factor| mantissa.checked_mul(factor))
        .ok_or_else(|| Error::Amount(format!("{} overflows at {} decimals", amount, decimals)))
}

/// Convert integer minor units back to a decimal amount
pub fn from_minor_units(units: u128, decimals: u32) -> Result<Decimal> {
    if decimals > MAX_ASSET_DECIMALS {
        return Err(Error::Amount(format!(
            "asset decimals {} exceed maximum {}",
            decimals, MAX_ASSET_DECIMALS
        )));
    }

    let out_of_range = || Error::Amount(format!("{} minor units out of range", units));

    // Split so large whole parts do not need to fit the 96-bit mantissa at full scale
    let factor = 10u128.pow(decimals);
    let whole = i128::try_from(units / factor).map_err(|_| out_of_range())?;
    let whole = Decimal::try_from_i128_with_scale(whole, 0).map_err(|_| out_of_range())?;
    // remainder < 10^18 always fits i64
    let fraction = i64::try_from(units % factor).map_err(|_| out_of_range())?;

    whole
        .checked_add(Decimal::new(fraction, decimals))
        .map(|d| d.normalize())
        .ok_or_else(out_of_range)
}

/// Settlement assets known to the clearing network, keyed by lowercase code
#[derive(Debug, Clone, Default)]
pub struct AssetRegistry {
    assets: HashMap<String, u32>,
}

impl AssetRegistry {
    /// Create empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration
    pub fn with_asset(mut self, code: impl AsRef<str>, decimals: u32) -> Result<Self> {
        self.register(code, decimals)?;
        Ok(self)
    }

    /// Register (or replace) an asset
    pub fn register(&mut self, code: impl AsRef<str>, decimals: u32) -> Result<()> {
        if decimals > MAX_ASSET_DECIMALS {
            return Err(Error::Amount(format!(
                "asset {} declares {} decimals, maximum is {}",
                code.as_ref(),
                decimals,
                MAX_ASSET_DECIMALS
            )));
        }
        self.assets.insert(code.as_ref().to_ascii_lowercase(), decimals);
        Ok(())
    }

    /// Decimal exponent for an asset
    pub fn decimals(&self, code: &str) -> Option<u32> {
        self.assets.get(&code.to_ascii_lowercase()).copied()
    }

    /// Convert an amount of `code` to minor units
    pub fn to_minor_units(&self, code: &str, amount: Decimal) -> Result<u128> {
        let decimals = self
            .decimals(code)
            .ok_or_else(|| Error::Amount(format!("unknown asset '{}'", code)))?;
        to_minor_units(amount, decimals)
    }

    /// Number of registered assets
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    /// Whether no asset is registered
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}
