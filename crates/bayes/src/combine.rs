/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The probability combiners: Robinson's geometric-mean formula and the
//! Fisher chi-squared variant. Products are accumulated in log domain, which
//! subsumes the exponent-rescaling the reference implementation needed once
//! intermediate products fell under 1e-200.

/// Robinson f(w) smoothing constants, per combiner.
const NAIVE_S: f64 = 0.160;
const NAIVE_X: f64 = 0.600;
const CHI2_S: f64 = 0.373;
const CHI2_X: f64 = 0.538;

#[derive(Debug, Clone, Copy)]
pub struct Combiner {
    chi2: bool,
    s: f64,
    x: f64,
}

impl Combiner {
    pub fn new(chi2: bool) -> Self {
        if chi2 {
            Combiner {
                chi2: true,
                s: CHI2_S,
                x: CHI2_X,
            }
        } else {
            Combiner {
                chi2: false,
                s: NAIVE_S,
                x: NAIVE_X,
            }
        }
    }

    /// f(w) = (s·x + n·p) / (s + n)
    pub fn smooth(&self, prob: f64, n: f64) -> f64 {
        (self.s * self.x + n * prob) / (self.s + n)
    }

    pub fn combine(&self, probs: impl Iterator<Item = f64>) -> f64 {
        let mut ln_prod_p = 0.0f64;
        let mut ln_prod_not_p = 0.0f64;
        let mut count = 0usize;
        for prob in probs {
            ln_prod_p += prob.ln();
            ln_prod_not_p += (1.0 - prob).ln();
            count += 1;
        }
        if count == 0 {
            return 0.5;
        }

        if self.chi2 {
            // Spamminess evidence is the product of (1-p), hamminess the
            // product of p; each is tested against the chi-squared survival
            // with 2N degrees of freedom.
            let s = 1.0 - chi2q(-2.0 * ln_prod_not_p, 2 * count as u32);
            let h = 1.0 - chi2q(-2.0 * ln_prod_p, 2 * count as u32);
            ((s - h) + 1.0) / 2.0
        } else {
            let n = count as f64;
            let h = 1.0 - (ln_prod_not_p / n).exp();
            let s = 1.0 - (ln_prod_p / n).exp();
            if h + s == 0.0 {
                0.5
            } else {
                (1.0 + (h - s) / (h + s)) / 2.0
            }
        }
    }
}

/// Right-tail chi-squared survival for even degrees of freedom: the
/// closed-form sum of Poisson terms.
pub fn chi2q(x2: f64, v: u32) -> f64 {
    let m = x2 / 2.0;
    let mut term = (-m).exp();
    let mut sum = term;
    for i in 1..(v / 2) {
        term *= m / f64::from(i);
        sum += term;
    }
    sum.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::{chi2q, Combiner};

    #[test]
    fn chi2q_limits() {
        assert!((chi2q(0.0, 300) - 1.0).abs() < 1e-12);
        assert!(chi2q(10_000.0, 300) < 1e-12);
        // Survival at the mean of the distribution is near one half.
        let mid = chi2q(300.0, 300);
        assert!(mid > 0.4 && mid < 0.6);
    }

    #[test]
    fn neutral_probabilities_stay_neutral() {
        for chi2 in [false, true] {
            let combiner = Combiner::new(chi2);
            let result = combiner.combine([0.5; 20].into_iter());
            assert!(
                (result - 0.5).abs() < 0.01,
                "combiner chi2={chi2} returned {result}"
            );
        }
    }

    #[test]
    fn strong_evidence_saturates() {
        for chi2 in [false, true] {
            let combiner = Combiner::new(chi2);
            let spam = combiner.combine([0.999; 50].into_iter());
            let ham = combiner.combine([0.001; 50].into_iter());
            assert!(spam > 0.99, "chi2={chi2} spam={spam}");
            assert!(ham < 0.01, "chi2={chi2} ham={ham}");
        }
    }

    #[test]
    fn smoothing_pulls_rare_tokens_to_the_prior() {
        let combiner = Combiner::new(true);
        // No observations: f(w) is exactly the assumed prior.
        assert!((combiner.smooth(1.0, 0.0) - 0.538).abs() < 1e-12);
        // Many observations: f(w) approaches the raw estimate.
        assert!((combiner.smooth(1.0, 1000.0) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn underflow_does_not_produce_nan() {
        let combiner = Combiner::new(true);
        let result = combiner.combine([0.001; 150].into_iter());
        assert!(result.is_finite());
        assert!(result < 0.01);
    }
}
