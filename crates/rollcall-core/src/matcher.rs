//! Probe-vs-gallery matching.
//!
//! Every metric is expressed as "higher is better" so a single threshold
//! semantics (`score > threshold` means known) applies regardless of how the
//! underlying comparison is computed.

use crate::store::Gallery;
use crate::types::{Fingerprint, MatchDecision};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Similarity strategy used to score a probe against a stored fingerprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Cosine similarity in [-1, 1].
    #[default]
    Cosine,
    /// Euclidean distance `d`, reported as `1 - d`.
    Euclidean,
}

impl Metric {
    pub fn score(self, a: &Fingerprint, b: &Fingerprint) -> f32 {
        match self {
            Metric::Cosine => a.cosine(b),
            Metric::Euclidean => 1.0 - a.euclidean_distance(b),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Cosine => f.write_str("cosine"),
            Metric::Euclidean => f.write_str("euclidean"),
        }
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" => Ok(Metric::Euclidean),
            other => Err(format!("unknown metric '{other}' (expected cosine or euclidean)")),
        }
    }
}

/// Strategy for finding the best identity for a probe fingerprint.
///
/// Implementations must pick the maximum score, break ties toward the
/// lexicographically smaller key, and only report a match when the best
/// score is strictly greater than `threshold`.
pub trait Matcher: Send + Sync {
    fn best_match(&self, probe: &Fingerprint, gallery: &Gallery, threshold: f32) -> MatchDecision;
}

/// Exhaustive O(N·D) scan over the whole gallery.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearMatcher {
    pub metric: Metric,
}

impl LinearMatcher {
    pub fn new(metric: Metric) -> Self {
        Self { metric }
    }
}

impl Matcher for LinearMatcher {
    fn best_match(&self, probe: &Fingerprint, gallery: &Gallery, threshold: f32) -> MatchDecision {
        let mut best: Option<(&str, f32)> = None;

        for (key, identity) in gallery.iter() {
            let score = self.metric.score(probe, &identity.fingerprint);
            let better = match best {
                None => true,
                Some((best_key, best_score)) => {
                    score > best_score || (score == best_score && key.as_str() < best_key)
                }
            };
            if better {
                best = Some((key.as_str(), score));
            }
        }

        match best {
            Some((key, score)) if score > threshold => MatchDecision {
                reg_no: Some(key.to_string()),
                score,
            },
            Some((_, score)) => MatchDecision::unknown(score),
            None => MatchDecision::unknown(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Identity, Profile};

    fn identity(key: &str, values: &[f32]) -> Identity {
        Identity {
            profile: Profile {
                reg_no: key.into(),
                name: format!("name-{key}"),
                cohort: "1".into(),
                phone: "".into(),
            },
            fingerprint: Fingerprint::new(values.to_vec()),
        }
    }

    fn gallery(entries: &[(&str, &[f32])]) -> Gallery {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), identity(k, v)))
            .collect()
    }

    #[test]
    fn test_exact_probe_matches_its_identity() {
        let g = gallery(&[("A", &[1.0, 0.0]), ("B", &[0.0, 1.0])]);
        let probe = Fingerprint::new(vec![1.0, 0.0]);
        let d = LinearMatcher::default().best_match(&probe, &g, 0.6);
        assert_eq!(d.reg_no.as_deref(), Some("A"));
        assert!((d.score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_weak_similarity_is_unknown() {
        // Cosine 0.3 to both A = e1 and B = e2.
        let g = gallery(&[("A", &[1.0, 0.0, 0.0]), ("B", &[0.0, 1.0, 0.0])]);
        let rest = (1.0f32 - 2.0 * 0.09).sqrt();
        let probe = Fingerprint::new(vec![0.3, 0.3, rest]);
        let d = LinearMatcher::default().best_match(&probe, &g, 0.6);
        assert!(!d.is_known());
        assert!((d.score - 0.3).abs() < 1e-5, "score = {}", d.score);
    }

    #[test]
    fn test_tie_prefers_smaller_key() {
        let g = gallery(&[("S002", &[1.0, 0.0]), ("S010", &[1.0, 0.0]), ("S001", &[2.0, 0.0])]);
        let probe = Fingerprint::new(vec![1.0, 0.0]);
        let d = LinearMatcher::default().best_match(&probe, &g, 0.5);
        assert_eq!(d.reg_no.as_deref(), Some("S001"));
    }

    #[test]
    fn test_score_equal_to_threshold_is_unknown() {
        let g = gallery(&[("A", &[1.0, 0.0])]);
        let probe = Fingerprint::new(vec![1.0, 0.0]);
        let d = LinearMatcher::default().best_match(&probe, &g, 1.0);
        assert!(!d.is_known());
    }

    #[test]
    fn test_best_match_is_last_entry() {
        let g = gallery(&[("1", &[0.0, 1.0, 0.0]), ("2", &[0.0, 0.0, 1.0]), ("3", &[1.0, 0.0, 0.0])]);
        let probe = Fingerprint::new(vec![1.0, 0.0, 0.0]);
        let d = LinearMatcher::default().best_match(&probe, &g, 0.5);
        assert_eq!(d.reg_no.as_deref(), Some("3"));
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let probe = Fingerprint::new(vec![1.0, 0.0]);
        let d = LinearMatcher::default().best_match(&probe, &Gallery::new(), 0.6);
        assert_eq!(d, MatchDecision::unknown(0.0));
    }

    #[test]
    fn test_euclidean_is_higher_is_better() {
        let g = gallery(&[("near", &[1.0, 0.1]), ("far", &[-1.0, 0.0])]);
        let probe = Fingerprint::new(vec![1.0, 0.0]);
        let d = LinearMatcher::new(Metric::Euclidean).best_match(&probe, &g, 0.4);
        assert_eq!(d.reg_no.as_deref(), Some("near"));
        assert!((d.score - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("Cosine".parse::<Metric>(), Ok(Metric::Cosine));
        assert_eq!(" euclidean ".parse::<Metric>(), Ok(Metric::Euclidean));
        assert!("manhattan".parse::<Metric>().is_err());
    }
}
