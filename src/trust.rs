//! Trust consensus over peer-reported values
//!
//! Several peers report a disputed numeric quantity; a plain mean would
//! let one dishonest report drag the result arbitrarily far. Votes are
//! gated against the median first, then combined as a weight-normalized
//! mean of what survives.

use serde::{Deserialize, Serialize};

/// One peer's report about a disputed quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustVote {
    pub host: String,
    pub value: f64,
    pub weight: f64,
}

impl TrustVote {
    pub fn new(host: impl Into<String>, value: f64, weight: f64) -> Self {
        Self {
            host: host.into(),
            value,
            weight,
        }
    }
}

/// Outcome of a consensus round.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusOutcome {
    /// Weight-normalized mean of the accepted votes, rounded to two
    /// decimals; `None` when nothing was accepted.
    pub value: Option<f64>,
    pub accepted: Vec<TrustVote>,
    pub rejected: Vec<TrustVote>,
}

/// Combine votes into a robust value.
///
/// With a tolerance, any vote deviating from the median by more than the
/// tolerance is rejected instead of averaged.
pub fn consensus(votes: &[TrustVote], tolerance: Option<f64>) -> ConsensusOutcome {
    if votes.is_empty() {
        return ConsensusOutcome {
            value: None,
            accepted: Vec::new(),
            rejected: Vec::new(),
        };
    }

    let mut values: Vec<f64> = votes.iter().map(|v| v.value).collect();
    values.sort_by(f64::total_cmp);
    let median = if values.len() % 2 == 0 {
        (values[values.len() / 2 - 1] + values[values.len() / 2]) / 2.0
    } else {
        values[values.len() / 2]
    };

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    let mut sum_weighted = 0.0;
    let mut sum_weights = 0.0;

    for vote in votes {
        if let Some(tolerance) = tolerance {
            if (vote.value - median).abs() > tolerance {
                rejected.push(vote.clone());
                continue;
            }
        }
        sum_weighted += vote.value * vote.weight;
        sum_weights += vote.weight;
        accepted.push(vote.clone());
    }

    let value = if sum_weights > 0.0 {
        Some((sum_weighted / sum_weights * 100.0).round() / 100.0)
    } else {
        None
    };

    ConsensusOutcome {
        value,
        accepted,
        rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outlier_excluded_by_tolerance() {
        let votes = vec![
            TrustVote::new("a.example.com", 10.0, 1.0),
            TrustVote::new("b.example.com", 10.0, 1.0),
            TrustVote::new("c.example.com", 1000.0, 1.0),
        ];
        let outcome = consensus(&votes, Some(5.0));
        assert_eq!(outcome.value, Some(10.0));
        assert_eq!(outcome.accepted.len(), 2);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].host, "c.example.com");
    }

    #[test]
    fn test_empty_votes_yield_none() {
        let outcome = consensus(&[], Some(5.0));
        assert_eq!(outcome.value, None);
        assert!(outcome.accepted.is_empty());
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn test_weighted_mean_without_tolerance() {
        let votes = vec![
            TrustVote::new("a", 10.0, 3.0),
            TrustVote::new("b", 20.0, 1.0),
        ];
        // (10*3 + 20*1) / 4 = 12.5
        let outcome = consensus(&votes, None);
        assert_eq!(outcome.value, Some(12.5));
        assert_eq!(outcome.accepted.len(), 2);
    }

    #[test]
    fn test_even_count_uses_middle_pair_median() {
        let votes = vec![
            TrustVote::new("a", 8.0, 1.0),
            TrustVote::new("b", 10.0, 1.0),
            TrustVote::new("c", 12.0, 1.0),
            TrustVote::new("d", 100.0, 1.0),
        ];
        // median = (10 + 12) / 2 = 11; 100 is out, 8 within tolerance 3
        let outcome = consensus(&votes, Some(3.0));
        assert_eq!(outcome.accepted.len(), 3);
        assert_eq!(outcome.value, Some(10.0));
    }

    #[test]
    fn test_all_rejected_yields_none() {
        let votes = vec![
            TrustVote::new("a", 0.0, 1.0),
            TrustVote::new("b", 100.0, 1.0),
        ];
        // median 50, nothing within 1
        let outcome = consensus(&votes, Some(1.0));
        assert_eq!(outcome.value, None);
        assert_eq!(outcome.accepted.len(), 0);
        assert_eq!(outcome.rejected.len(), 2);
    }

    #[test]
    fn test_rounding_to_two_decimals() {
        let votes = vec![
            TrustVote::new("a", 1.0, 1.0),
            TrustVote::new("b", 2.0, 1.0),
            TrustVote::new("c", 2.0, 1.0),
        ];
        // 5/3 = 1.666...
        let outcome = consensus(&votes, None);
        assert_eq!(outcome.value, Some(1.67));
    }

    #[test]
    fn test_zero_weight_votes_accepted_but_unweighted() {
        let votes = vec![TrustVote::new("a", 10.0, 0.0)];
        let outcome = consensus(&votes, None);
        assert_eq!(outcome.value, None);
        assert_eq!(outcome.accepted.len(), 1);
    }
}
