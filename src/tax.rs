//! GST computation for financial documents.
//!
//! Intra-state supplies (the counterparty carries a tax number) split the tax
//! evenly into CGST and SGST; everything else is charged as IGST. Every output
//! is rounded to two places, midpoint away from zero, so repeated runs over
//! the same inputs give identical values.
use crate::error::{DocflowError, Result};
use crate::types::{Money, Percent};
use rust_decimal::{Decimal, RoundingStrategy};

pub const DECIMAL_PLACES: u32 = 2;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaxBreakdown {
    #[n(0)]
    pub tax_amount: Money,
    #[n(1)]
    pub cgst: Money,
    #[n(2)]
    pub sgst: Money,
    #[n(3)]
    pub igst: Money,
    #[n(4)]
    pub total_amount: Money,
}

fn round(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero)
}

fn overflow(amount: Money, rate: Percent) -> DocflowError {
    DocflowError::validation(format!("tax on {amount} at {rate}% is out of range"))
}

/// Fails with a validation error only when an intermediate value does not
/// fit a `Decimal`.
pub fn compute_tax(
    amount: Money,
    applicable: bool,
    rate: Percent,
    has_tax_number: bool,
) -> Result<TaxBreakdown> {
    let base = round(amount.value());
    let percent = rate.value();

    if !applicable || percent <= Decimal::ZERO || base <= Decimal::ZERO {
        return Ok(TaxBreakdown {
            total_amount: Money::new(base),
            ..TaxBreakdown::default()
        });
    }

    let tax = base
        .checked_mul(percent)
        .and_then(|product| product.checked_div(Decimal::ONE_HUNDRED))
        .map(round)
        .ok_or_else(|| overflow(amount, rate))?;
    let total = base
        .checked_add(tax)
        .map(round)
        .ok_or_else(|| overflow(amount, rate))?;
    let (cgst, sgst, igst) = if has_tax_number {
        let half = round(tax / Decimal::TWO);
        (half, half, Decimal::ZERO)
    } else {
        (Decimal::ZERO, Decimal::ZERO, tax)
    };

    Ok(TaxBreakdown {
        tax_amount: Money::new(tax),
        cgst: Money::new(cgst),
        sgst: Money::new(sgst),
        igst: Money::new(igst),
        total_amount: Money::new(total),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intra_state_splits_cgst_and_sgst() {
        let tax = compute_tax(Money::from(1000), true, Percent::from(18), true).unwrap();

        assert_eq!(tax.tax_amount, Money::from(180));
        assert_eq!(tax.cgst, Money::from(90));
        assert_eq!(tax.sgst, Money::from(90));
        assert_eq!(tax.igst, Money::ZERO);
        assert_eq!(tax.total_amount, Money::from(1180));
    }

    #[test]
    fn inter_state_charges_igst() {
        let tax = compute_tax(Money::from(1000), true, Percent::from(18), false).unwrap();

        assert_eq!(tax.tax_amount, Money::from(180));
        assert_eq!(tax.cgst, Money::ZERO);
        assert_eq!(tax.sgst, Money::ZERO);
        assert_eq!(tax.igst, Money::from(180));
        assert_eq!(tax.total_amount, Money::from(1180));
    }

    #[test]
    fn not_applicable_passes_amount_through() {
        let tax = compute_tax(Money::from(1000), false, Percent::from(18), true).unwrap();

        assert_eq!(tax.tax_amount, Money::ZERO);
        assert_eq!(tax.cgst, Money::ZERO);
        assert_eq!(tax.sgst, Money::ZERO);
        assert_eq!(tax.igst, Money::ZERO);
        assert_eq!(tax.total_amount, Money::from(1000));
    }

    #[test]
    fn zero_rate_and_zero_amount_are_untaxed() {
        let zero_rate = compute_tax(Money::from(500), true, Percent::ZERO, false).unwrap();
        assert_eq!(zero_rate.tax_amount, Money::ZERO);
        assert_eq!(zero_rate.total_amount, Money::from(500));

        let zero_amount = compute_tax(Money::ZERO, true, Percent::from(18), false).unwrap();
        assert_eq!(zero_amount, TaxBreakdown::default());
    }

    #[test]
    fn rounds_half_away_from_zero() {
        // 10.05 * 5% = 0.5025 -> 0.50, halves 0.25 each
        let amount: Money = "10.05".parse().unwrap();
        let tax = compute_tax(amount, true, Percent::from(5), true).unwrap();
        assert_eq!(tax.tax_amount.to_string(), "0.50");
        assert_eq!(tax.cgst.to_string(), "0.25");

        // 0.10 * 5% = 0.005 -> 0.01
        let amount: Money = "0.10".parse().unwrap();
        let tax = compute_tax(amount, true, Percent::from(5), false).unwrap();
        assert_eq!(tax.igst.to_string(), "0.01");
        assert_eq!(tax.total_amount.to_string(), "0.11");
    }

    #[test]
    fn fractional_rates_are_supported() {
        let rate: Percent = "2.5".parse().unwrap();
        let tax = compute_tax(Money::from(200), true, rate, false).unwrap();

        assert_eq!(tax.igst, Money::from(5));
        assert_eq!(tax.total_amount, Money::from(205));
    }

    #[test]
    fn amounts_too_large_to_tax_are_refused() {
        let huge: Money = "70000000000000000000000000000".parse().unwrap();

        let err = compute_tax(huge, true, Percent::from(18), false).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Validation);

        // untaxed, the amount passes straight through
        let untaxed = compute_tax(huge, false, Percent::from(18), false).unwrap();
        assert_eq!(untaxed.total_amount, huge);
    }
}
