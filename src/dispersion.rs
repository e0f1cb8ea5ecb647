//! Inter-expert score dispersion (§4.J "inter-expert score dispersion").
//!
//! Grounded on the teacher's `eval::bandit::BetaPosterior`: fit a Beta
//! distribution over the normalized scores by method of moments, then report
//! its credible-interval width as the dispersion signal. The teacher
//! approximates that width from the closed-form variance; here we go one
//! step further and use `statrs`'s actual inverse CDF, since we already
//! depend on it for confidence work and the teacher's approximation was only
//! needed because it didn't want the extra dependency.

use statrs::distribution::{Beta, ContinuousCDF};

/// Fits a Beta(alpha, beta) to the sample mean/variance of `scores` (already
/// normalized to `[0,1]`) and returns the width of its 95% interval — `0.0`
/// for a single or perfectly-agreeing sample, growing towards `1.0` as the
/// experts disagree more.
pub fn score_dispersion(scores: &[f64]) -> f64 {
    if scores.len() < 2 {
        return 0.0;
    }

    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64;

    if variance <= 0.0 {
        return 0.0;
    }

    // Method of moments: alpha = mean * (mean*(1-mean)/var - 1), beta analogous.
    // Clamp mean away from {0,1} and variance below the Beta-feasible ceiling
    // (mean*(1-mean)) so the moment equations stay solvable.
    let mean = mean.clamp(0.01, 0.99);
    let max_variance = mean * (1.0 - mean) * 0.999;
    let variance = variance.min(max_variance).max(1e-6);

    let common = mean * (1.0 - mean) / variance - 1.0;
    let alpha = (mean * common).max(0.01);
    let beta = ((1.0 - mean) * common).max(0.01);

    let Ok(dist) = Beta::new(alpha, beta) else {
        return variance.sqrt();
    };

    let lower = dist.inverse_cdf(0.025);
    let upper = dist.inverse_cdf(0.975);
    (upper - lower).clamp(0.0, 1.0)
}

/// Normalizes 0-100 evaluator scores to `[0,1]` before dispersion fitting.
pub fn normalize_scores(scores: impl Iterator<Item = f64>) -> Vec<f64> {
    scores.map(|s| (s / 100.0).clamp(0.0, 1.0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_scores_have_zero_dispersion() {
        let scores = normalize_scores([80.0, 80.0, 80.0].into_iter());
        assert_eq!(score_dispersion(&scores), 0.0);
    }

    #[test]
    fn single_score_has_zero_dispersion() {
        assert_eq!(score_dispersion(&[0.5]), 0.0);
    }

    #[test]
    fn widely_spread_scores_have_higher_dispersion_than_tight_ones() {
        let tight = normalize_scores([70.0, 72.0, 71.0].into_iter());
        let spread = normalize_scores([10.0, 50.0, 95.0].into_iter());
        assert!(score_dispersion(&spread) > score_dispersion(&tight));
    }
}
