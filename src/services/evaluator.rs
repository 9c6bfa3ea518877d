//! Threshold evaluation and deviation arithmetic.
//!
//! All arithmetic is decimal. Evaluation order is fixed: the rule is parsed
//! and validated, then the minimum-threshold gate runs, then deviation is
//! computed, then the rule's comparison decides the breach.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::{Comparison, Indicator, Priority, ThresholdRule, ThresholdType};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Outcome of a single evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub breached: bool,
    /// `None` when no historical value was available
    pub deviation_percent: Option<Decimal>,
    /// The minimum-threshold gate short-circuited the comparison
    pub below_minimum: bool,
}

/// Parse and validate the threshold rule stored on an indicator.
///
/// Also checks the indicator-level invariants the scheduler relies on, so a
/// misconfigured indicator fails the same way as a malformed rule.
pub fn parse_rule(indicator: &Indicator) -> Result<ThresholdRule> {
    if indicator.frequency_minutes <= 0 {
        return Err(AppError::EvaluationError(format!(
            "frequency_minutes must be positive, got {}",
            indicator.frequency_minutes
        )));
    }
    if indicator.cooldown_minutes < 0 {
        return Err(AppError::EvaluationError(format!(
            "cooldown_minutes must not be negative, got {}",
            indicator.cooldown_minutes
        )));
    }

    let threshold_type: ThresholdType = indicator
        .threshold_type
        .parse()
        .map_err(AppError::EvaluationError)?;
    let comparison: Comparison = indicator
        .threshold_comparison
        .parse()
        .map_err(AppError::EvaluationError)?;

    let field = indicator.threshold_field.trim();
    if field.is_empty() {
        return Err(AppError::EvaluationError(
            "threshold_field must not be empty".into(),
        ));
    }

    if threshold_type == ThresholdType::Count && indicator.threshold_value.is_sign_negative() {
        return Err(AppError::EvaluationError(format!(
            "count threshold must not be negative, got {}",
            indicator.threshold_value
        )));
    }
    if let Some(min) = indicator.minimum_threshold {
        if min.is_sign_negative() {
            return Err(AppError::EvaluationError(format!(
                "minimum_threshold must not be negative, got {min}"
            )));
        }
    }

    Ok(ThresholdRule {
        threshold_type,
        field: field.to_string(),
        comparison,
        value: indicator.threshold_value,
        minimum_threshold: indicator.minimum_threshold,
    })
}

/// Parse the alert priority, rejecting unknown levels
pub fn parse_priority(indicator: &Indicator) -> Result<Priority> {
    Priority::from_level(indicator.priority).ok_or_else(|| {
        AppError::EvaluationError(format!("unknown priority level {}", indicator.priority))
    })
}

/// Percentage difference between a reading and its baseline.
///
/// A zero baseline yields 100 for any non-zero reading and 0 otherwise.
/// Fails with `EvaluationError` when the result leaves the decimal range.
pub fn deviation_percent(current: Decimal, historical: Decimal) -> Result<Decimal> {
    if historical.is_zero() {
        return Ok(if current.is_zero() {
            Decimal::ZERO
        } else {
            HUNDRED
        });
    }
    current
        .checked_sub(historical)
        .and_then(|diff| diff.abs().checked_div(historical.abs()))
        .and_then(|ratio| ratio.checked_mul(HUNDRED))
        .map(|deviation| deviation.round_dp(4).normalize())
        .ok_or_else(|| {
            AppError::EvaluationError(format!(
                "deviation of {current} from {historical} is out of range"
            ))
        })
}

/// Evaluate a reading against a parsed rule.
///
/// `volume` is the sample size the source reported, if any; the minimum
/// threshold gate compares against it, falling back to `current`.
pub fn evaluate(
    current: Decimal,
    historical: Option<Decimal>,
    volume: Option<Decimal>,
    rule: &ThresholdRule,
) -> Result<Evaluation> {
    let below_minimum = rule
        .minimum_threshold
        .is_some_and(|min| volume.unwrap_or(current) < min);

    let deviation = historical
        .map(|h| deviation_percent(current, h))
        .transpose()?;

    let breached = !below_minimum && rule.comparison.check(current, rule.value);

    Ok(Evaluation {
        breached,
        deviation_percent: deviation,
        below_minimum,
    })
}
