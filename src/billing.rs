//! Billing meter
//!
//! Per-operation-kind invocation counters with configurable cycling
//! thresholds. Reaching a threshold resets the counter to zero and reports
//! the cycle to the caller layer, which emits the metering event. Kinds
//! without a configured threshold are counted but never cycle, and billing
//! never blocks dispatch by itself.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::error::{FacegateError, Result};

/// Counter state for one operation kind.
#[derive(Debug, Clone, Default)]
pub struct BillingRecord {
    /// Cycling counter, always strictly below the threshold after a commit.
    pub count: u64,
    /// Cycling threshold; `None` means the kind never cycles.
    pub threshold: Option<u64>,
    /// Total commits over the session lifetime, never reset. Feeds the
    /// optional hard operational cap.
    pub lifetime: u64,
}

/// Outcome of committing one call against the meter.
#[derive(Debug, Clone, Copy)]
pub struct BillingTick {
    pub count: u64,
    pub cycled: bool,
    pub lifetime: u64,
}

/// Per-session meter. Owned by its session and mutated only inside the
/// session's critical section.
#[derive(Debug, Default)]
pub struct BillingMeter {
    records: HashMap<String, BillingRecord>,
}

impl BillingMeter {
    /// Apply a threshold document: a JSON object mapping operation-kind
    /// names to strictly positive integers. The whole document is rejected
    /// atomically if any entry is invalid; existing state is untouched on
    /// failure.
    pub fn set_thresholds(&mut self, document: &str) -> Result<()> {
        let value: Value = serde_json::from_str(document)
            .map_err(|e| FacegateError::InvalidBillingConfig(e.to_string()))?;
        let map = value.as_object().ok_or_else(|| {
            FacegateError::InvalidBillingConfig("document is not an object".into())
        })?;

        let mut parsed = Vec::with_capacity(map.len());
        for (kind, raw) in map {
            match raw.as_u64() {
                Some(threshold) if threshold > 0 => parsed.push((kind.clone(), threshold)),
                _ => {
                    return Err(FacegateError::InvalidBillingConfig(format!(
                        "threshold for '{kind}' must be a strictly positive integer, got {raw}"
                    )))
                }
            }
        }

        for (kind, threshold) in parsed {
            let record = self.records.entry(kind).or_default();
            record.threshold = Some(threshold);
        }
        Ok(())
    }

    /// Count one call of `kind`. Cycles (count back to zero, `cycled` set)
    /// exactly when the new count reaches the threshold.
    pub fn record_and_check(&mut self, kind: &str) -> BillingTick {
        let record = self.records.entry(kind.to_string()).or_default();
        record.lifetime += 1;
        record.count += 1;
        let cycled = matches!(record.threshold, Some(t) if record.count >= t);
        if cycled {
            debug!(kind, lifetime = record.lifetime, "billing counter cycled");
            record.count = 0;
        }
        BillingTick {
            count: record.count,
            cycled,
            lifetime: record.lifetime,
        }
    }

    pub fn record(&self, kind: &str) -> Option<&BillingRecord> {
        self.records.get(kind)
    }

    pub fn lifetime_total(&self, kind: &str) -> u64 {
        self.records.get(kind).map_or(0, |r| r.lifetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_on_the_threshold_call_exactly() {
        let mut meter = BillingMeter::default();
        meter.set_thresholds(r#"{"validate": 3}"#).unwrap();

        let ticks: Vec<BillingTick> = (0..3).map(|_| meter.record_and_check("validate")).collect();
        assert_eq!(
            ticks.iter().map(|t| t.cycled).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(meter.record("validate").unwrap().count, 0);

        // The next call restarts the cycle at 1.
        let fourth = meter.record_and_check("validate");
        assert_eq!(fourth.count, 1);
        assert!(!fourth.cycled);
        assert_eq!(fourth.lifetime, 4);
    }

    #[test]
    fn unconfigured_kinds_never_cycle() {
        let mut meter = BillingMeter::default();
        for i in 1..=100u64 {
            let tick = meter.record_and_check("enroll");
            assert!(!tick.cycled);
            assert_eq!(tick.count, i);
        }
    }

    #[test]
    fn invalid_entries_reject_the_whole_document() {
        let mut meter = BillingMeter::default();
        meter.set_thresholds(r#"{"validate": 5}"#).unwrap();

        for bad in [
            r#"{"validate": 2, "enroll": 0}"#,
            r#"{"validate": -1}"#,
            r#"{"validate": 2.5}"#,
            r#"{"validate": "3"}"#,
            r#"[1]"#,
            "not json",
        ] {
            assert!(matches!(
                meter.set_thresholds(bad),
                Err(FacegateError::InvalidBillingConfig(_))
            ));
        }
        // The earlier threshold survived every rejected update.
        assert_eq!(meter.record("validate").unwrap().threshold, Some(5));
        assert!(meter.record("enroll").is_none());
    }

    #[test]
    fn lifetime_totals_ignore_cycling() {
        let mut meter = BillingMeter::default();
        meter.set_thresholds(r#"{"compare": 2}"#).unwrap();
        for _ in 0..5 {
            meter.record_and_check("compare");
        }
        assert_eq!(meter.lifetime_total("compare"), 5);
        assert_eq!(meter.record("compare").unwrap().count, 1);
    }
}
