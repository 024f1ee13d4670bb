use anyhow::Result;

use crate::cadence::format_ufix64;

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyConfig {
    pub auto_execute: bool,
    pub min_confidence: f64,
    /// Share of vault assets moved per recommendation, in percent.
    pub rebalance_percentage: f64,
    pub use_scheduled_tx: bool,
    pub execution_delay_secs: u64,
    pub emergency_pause_threshold: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            auto_execute: false,
            min_confidence: 80.0,
            rebalance_percentage: 50.0,
            use_scheduled_tx: false,
            execution_delay_secs: 300,
            emergency_pause_threshold: 10,
        }
    }
}

/// Why a recommendation was or was not acted on.
#[derive(Debug, Clone, PartialEq)]
pub enum Gate {
    Proceed,
    AutoExecuteDisabled,
    Paused,
    BelowThreshold { confidence: f64, min: f64 },
    MissingConfidence,
}

impl Gate {
    pub fn reason(&self) -> &'static str {
        match self {
            Gate::Proceed => "threshold_met",
            Gate::AutoExecuteDisabled => "auto_execute_disabled",
            Gate::Paused => "emergency_pause",
            Gate::BelowThreshold { .. } => "below_threshold",
            Gate::MissingConfidence => "missing_confidence",
        }
    }
}

pub fn meets_threshold(confidence: f64, min_confidence: f64) -> bool {
    confidence.is_finite() && confidence >= min_confidence
}

impl PolicyConfig {
    pub fn gate(&self, confidence: Option<f64>, circuit_closed: bool) -> Gate {
        if !self.auto_execute {
            return Gate::AutoExecuteDisabled;
        }
        if !circuit_closed {
            return Gate::Paused;
        }
        match confidence {
            None => Gate::MissingConfidence,
            Some(c) if meets_threshold(c, self.min_confidence) => Gate::Proceed,
            Some(c) => Gate::BelowThreshold { confidence: c, min: self.min_confidence },
        }
    }
}

/// `total * percentage / 100` as a `UFix64` string. A percentage of zero
/// means the whole vault.
pub fn rebalance_amount(total_assets: f64, percentage: f64) -> Result<String> {
    let pct = if percentage > 0.0 { percentage } else { 100.0 };
    format_ufix64(total_assets * pct / 100.0)
}

/// Renders a confidence the way it appears in rebalance reasons.
pub fn format_confidence(confidence: f64) -> String {
    if confidence.fract() == 0.0 {
        format!("{}", confidence as i64)
    } else {
        format!("{}", confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> PolicyConfig {
        PolicyConfig { auto_execute: true, ..PolicyConfig::default() }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let p = enabled();
        assert_eq!(p.gate(Some(80.0), true), Gate::Proceed);
        assert_eq!(p.gate(Some(79.0), true), Gate::BelowThreshold { confidence: 79.0, min: 80.0 });
        assert_eq!(p.gate(None, true), Gate::MissingConfidence);
        assert!(!meets_threshold(f64::NAN, 0.0));
    }

    #[test]
    fn test_gate_order() {
        assert_eq!(PolicyConfig::default().gate(Some(99.0), true), Gate::AutoExecuteDisabled);
        assert_eq!(enabled().gate(Some(99.0), false), Gate::Paused);
    }

    #[test]
    fn test_rebalance_amount() {
        assert_eq!(rebalance_amount(100.0, 50.0).unwrap(), "50.00000000");
        assert_eq!(rebalance_amount(100.0, 0.0).unwrap(), "100.00000000");
        assert_eq!(rebalance_amount(0.0, 50.0).unwrap(), "0.00000000");
        assert!(rebalance_amount(-5.0, 50.0).is_err());
    }

    #[test]
    fn test_confidence_text() {
        assert_eq!(format_confidence(85.0), "85");
        assert_eq!(format_confidence(85.5), "85.5");
    }
}
