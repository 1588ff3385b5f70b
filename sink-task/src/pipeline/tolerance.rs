use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::kafka::types::ConsumerRecord;
use crate::metrics_consts::RECORDS_TOLERATED;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    KeyConverter,
    ValueConverter,
    HeaderConverter,
    Transformation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::KeyConverter => "key_converter",
            Stage::ValueConverter => "value_converter",
            Stage::HeaderConverter => "header_converter",
            Stage::Transformation => "transformation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToleranceDecision {
    /// Drop the record and carry on.
    Tolerate,
    Fail,
}

/// Decides what happens to a record whose conversion or transformation failed.
pub trait ToleranceOperator: Send + Sync {
    fn on_failure(
        &self,
        stage: Stage,
        record: &ConsumerRecord,
        error: &anyhow::Error,
    ) -> ToleranceDecision;

    fn tolerated_count(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorTolerance {
    #[default]
    None,
    All,
}

impl FromStr for ErrorTolerance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(ErrorTolerance::None),
            "all" => Ok(ErrorTolerance::All),
            other => Err(format!("unknown error tolerance: {other}")),
        }
    }
}

#[derive(Debug, Default)]
pub struct ErrorToleranceOperator {
    tolerance: ErrorTolerance,
    tolerated: AtomicU64,
}

impl ErrorToleranceOperator {
    pub fn new(tolerance: ErrorTolerance) -> Self {
        Self {
            tolerance,
            tolerated: AtomicU64::new(0),
        }
    }
}

impl ToleranceOperator for ErrorToleranceOperator {
    fn on_failure(
        &self,
        stage: Stage,
        record: &ConsumerRecord,
        error: &anyhow::Error,
    ) -> ToleranceDecision {
        match self.tolerance {
            ErrorTolerance::None => ToleranceDecision::Fail,
            ErrorTolerance::All => {
                warn!(
                    topic = record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    stage = stage.as_str(),
                    "Dropping record that failed processing: {error:#}"
                );
                self.tolerated.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(RECORDS_TOLERATED, "stage" => stage.as_str()).increment(1);
                ToleranceDecision::Tolerate
            }
        }
    }

    fn tolerated_count(&self) -> u64 {
        self.tolerated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_fails_without_counting() {
        let operator = ErrorToleranceOperator::new(ErrorTolerance::None);
        let record = ConsumerRecord::new("test", 12, 45);

        let decision =
            operator.on_failure(Stage::ValueConverter, &record, &anyhow::anyhow!("bad bytes"));

        assert_eq!(decision, ToleranceDecision::Fail);
        assert_eq!(operator.tolerated_count(), 0);
    }

    #[test]
    fn all_tolerates_and_counts() {
        let operator = ErrorToleranceOperator::new(ErrorTolerance::All);
        let record = ConsumerRecord::new("test", 12, 45);

        for stage in [Stage::KeyConverter, Stage::Transformation] {
            assert_eq!(
                operator.on_failure(stage, &record, &anyhow::anyhow!("boom")),
                ToleranceDecision::Tolerate
            );
        }
        assert_eq!(operator.tolerated_count(), 2);
    }

    #[test]
    fn parses_config_values() {
        assert_eq!("ALL".parse::<ErrorTolerance>(), Ok(ErrorTolerance::All));
        assert_eq!("none".parse::<ErrorTolerance>(), Ok(ErrorTolerance::None));
        assert!("some".parse::<ErrorTolerance>().is_err());
    }
}
