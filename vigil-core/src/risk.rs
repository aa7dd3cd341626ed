use std::fmt;

use vigil_model::Severity;

/// Maps an asset's open findings to a 0..=100 risk score.
///
/// Implementations must be monotonic: adding an open finding never lowers
/// the score.
pub trait RiskScorer: Send + Sync + fmt::Debug {
    fn score(&self, open_findings: &[Severity]) -> u8;
}

/// Sums a fixed weight per severity and caps at 100.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeverityWeightedScorer;

impl SeverityWeightedScorer {
    pub fn weight(severity: Severity) -> u32 {
        match severity {
            Severity::Info => 0,
            Severity::Low => 5,
            Severity::Medium => 15,
            Severity::High => 30,
            Severity::Critical => 50,
        }
    }
}

impl RiskScorer for SeverityWeightedScorer {
    fn score(&self, open_findings: &[Severity]) -> u8 {
        let total: u32 = open_findings
            .iter()
            .map(|s| Self::weight(*s))
            .sum::<u32>()
            .min(100);
        total as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_and_caps() {
        let scorer = SeverityWeightedScorer;
        assert_eq!(scorer.score(&[]), 0);
        assert_eq!(scorer.score(&[Severity::Info, Severity::Low]), 5);
        assert_eq!(scorer.score(&[Severity::Critical, Severity::High]), 80);
        assert_eq!(
            scorer.score(&[Severity::Critical, Severity::Critical, Severity::High]),
            100
        );
    }

    #[test]
    fn adding_a_finding_never_lowers_the_score() {
        let scorer = SeverityWeightedScorer;
        let mut open = vec![Severity::Medium];
        for severity in Severity::ALL {
            let before = scorer.score(&open);
            open.push(*severity);
            assert!(scorer.score(&open) >= before);
        }
    }
}
