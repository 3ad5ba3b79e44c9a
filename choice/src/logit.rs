// Copyright 2022 Lucas Javaudin
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// https://creativecommons.org/licenses/by-nc-nd/4.0/legalcode

//! Logit formulas shared by every level of a nested logit model.

/// Conditional Logit probabilities of a set of siblings and the log-sum of their parent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogitLevel {
    /// Probability of each value, given that the parent is chosen.
    pub probabilities: Vec<f64>,
    /// Log-sum `theta * ln(sum(exp(v / theta)))` of the values.
    pub logsum: f64,
}

/// Computes the conditional probabilities `exp(v_i / theta) / sum_j exp(v_j / theta)` and the
/// log-sum `theta * ln(sum_j exp(v_j / theta))` of a slice of values.
///
/// Returns `None` if the slice is empty.
///
/// The values must be finite and `theta` must be positive.
///
/// # Example
///
/// ```
/// use choice::logit::logit_level;
///
/// let level = logit_level(&[1.0, 2.0, 0.5], 1.0).unwrap();
/// assert!((level.probabilities[0] - 0.2312).abs() < 1e-4);
/// assert!((level.probabilities[1] - 0.6285).abs() < 1e-4);
/// assert!((level.probabilities[2] - 0.1402).abs() < 1e-4);
/// ```
pub fn logit_level(values: &[f64], theta: f64) -> Option<LogitLevel> {
    if values.is_empty() {
        return None;
    }
    // The maximum value is finite because all values are finite and there is at least one value.
    let max_value = values.iter().fold(f64::NEG_INFINITY, |m, &v| m.max(v));
    // Decrease the value of all alternatives by the maximum value to prevent overflow.
    // (v - max_value) is non-positive and theta is positive so the `exp` cannot overflow.
    // In the worse case, (v - max_value) / theta underflows to -Infinity and the exponential
    // yields 0.0, which is fine.
    let mut probabilities: Vec<f64> = values
        .iter()
        .map(|&v| ((v - max_value) / theta).exp())
        .collect();
    // Sigma is between 1.0 and values.len() because the exponential of the maximum value is 1.0.
    let sigma: f64 = probabilities.iter().sum();
    probabilities.iter_mut().for_each(|p| *p /= sigma);
    // Do not forget to add back the maximum value that was substracted.
    let logsum = max_value + theta * sigma.ln();
    Some(LogitLevel {
        probabilities,
        logsum,
    })
}

/// Returns the index whose cumulative-probability interval contains `u`, using the inverse
/// sampling theorem.
///
/// When `u` is larger than the sum of the probabilities (because of rounding errors), the last
/// index is returned. Returns `None` if the slice is empty.
pub fn draw_index(probabilities: &[f64], u: f64) -> Option<usize> {
    if probabilities.is_empty() {
        return None;
    }
    let choice_id = probabilities
        .iter()
        .scan(0.0, |sum, &p| {
            *sum += p;
            Some(*sum)
        })
        .position(|cum_prob| u < cum_prob)
        .unwrap_or(probabilities.len() - 1);
    Some(choice_id)
}
