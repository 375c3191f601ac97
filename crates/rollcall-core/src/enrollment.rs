//! Enrollment aggregation: many samples of one person → one canonical fingerprint.

use crate::types::Fingerprint;
use thiserror::Error;

/// Default minimum number of usable samples per registration.
pub const DEFAULT_MIN_SAMPLES: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrollError {
    #[error("could not extract enough face samples: got {got}, need at least {need}")]
    InsufficientSamples { got: usize, need: usize },
}

/// Componentwise mean of the supplied fingerprints.
///
/// The caller has already dropped samples without a usable face; every entry
/// here counts. Fails if fewer than `min_samples` remain. All samples are
/// assumed to belong to the same person, so there is no outlier rejection.
///
/// The mean is accumulated incrementally in `f64`, which keeps identical
/// inputs exact: n copies of `F` average to `F`.
pub fn aggregate(samples: &[Fingerprint], min_samples: usize) -> Result<Fingerprint, EnrollError> {
    let need = min_samples.max(1);
    if samples.len() < need {
        return Err(EnrollError::InsufficientSamples {
            got: samples.len(),
            need,
        });
    }

    let dim = samples[0].dim();
    let mut mean = vec![0.0f64; dim];

    for (k, sample) in samples.iter().enumerate() {
        debug_assert_eq!(sample.dim(), dim, "fingerprint dimension mismatch");
        let n = (k + 1) as f64;
        for (m, &x) in mean.iter_mut().zip(sample.values.iter()) {
            *m += (x as f64 - *m) / n;
        }
    }

    Ok(Fingerprint::new(mean.into_iter().map(|m| m as f32).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_samples_average_to_themselves() {
        let f = Fingerprint::new(vec![0.1, -0.7, 0.333_333_34, 1e-7, 42.0]);
        for n in [3, 4, 7, 10] {
            let samples = vec![f.clone(); n];
            assert_eq!(aggregate(&samples, 3).unwrap(), f, "n = {n}");
        }
    }

    #[test]
    fn test_componentwise_mean() {
        let samples = vec![
            Fingerprint::new(vec![1.0, 0.0]),
            Fingerprint::new(vec![0.0, 1.0]),
            Fingerprint::new(vec![2.0, 2.0]),
        ];
        let mean = aggregate(&samples, 3).unwrap();
        assert!((mean.values[0] - 1.0).abs() < 1e-6);
        assert!((mean.values[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_too_few_samples() {
        let samples = vec![Fingerprint::new(vec![1.0]); 2];
        assert_eq!(
            aggregate(&samples, 3),
            Err(EnrollError::InsufficientSamples { got: 2, need: 3 })
        );
    }

    #[test]
    fn test_no_samples() {
        assert_eq!(
            aggregate(&[], 3),
            Err(EnrollError::InsufficientSamples { got: 0, need: 3 })
        );
    }

    #[test]
    fn test_zero_minimum_still_needs_one_sample() {
        assert!(aggregate(&[], 0).is_err());
        assert!(aggregate(&[Fingerprint::new(vec![1.0])], 0).is_ok());
    }
}
