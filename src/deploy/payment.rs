use crate::config::DeployConfig;
use crate::deploy::types::ConversionRate;
use serde::{Deserialize, Serialize};

/// Token cost of creating an instance with a given amount of resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentQuote {
    /// Requested resource plus the creation overhead
    pub total_units: u128,
    /// Tokens moved to the minter
    pub amount: u128,
    pub fee: u128,
    /// Allowance the owner must have granted: `amount + fee`
    pub required: u128,
}

impl PaymentQuote {
    /// `None` on arithmetic overflow or a zero rate.
    pub fn compute(
        initial_cycles: u128,
        config: &DeployConfig,
        rate: &ConversionRate,
        fee: u128,
    ) -> Option<Self> {
        let total_units = initial_cycles.checked_add(config.creation_overhead)?;
        let divisor = config.overhead_constant.checked_mul(rate.denominator)?;
        if divisor == 0 {
            return None;
        }
        let amount = total_units.checked_mul(rate.numerator)? / divisor;
        let required = amount.checked_add(fee)?;

        Some(Self {
            total_units,
            amount,
            fee,
            required,
        })
    }
}
