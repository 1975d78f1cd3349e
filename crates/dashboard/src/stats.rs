//! Descriptive statistics and normality tests.

use serde::Serialize;

/// Descriptive statistics over the current result window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Descriptive {
    pub n: usize,
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
    pub variance: f64,
    pub min: f64,
    pub max: f64,
    pub p25: f64,
    pub p75: f64,
    pub p95: f64,
    pub p99: f64,
    /// Normal-approximation 95% interval: mean ± 1.96·stddev/√n.
    pub ci95_lower: f64,
    pub ci95_upper: f64,
}

impl Descriptive {
    /// Compute over a sample. Returns `None` for an empty sample.
    pub fn compute(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len();
        let mut sorted: Vec<f64> = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mean = sorted.iter().sum::<f64>() / n as f64;
        let variance = sorted.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64;
        let stddev = variance.sqrt();
        let half_width = 1.96 * stddev / (n as f64).sqrt();

        Some(Self {
            n,
            mean,
            median: percentile(&sorted, 0.50),
            stddev,
            variance,
            min: sorted[0],
            max: sorted[n - 1],
            p25: percentile(&sorted, 0.25),
            p75: percentile(&sorted, 0.75),
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
            ci95_lower: mean - half_width,
            ci95_upper: mean + half_width,
        })
    }
}

/// Linear-interpolated percentile over a sorted slice.
pub fn percentile(sorted: &[f64], p01: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let p = p01.clamp(0.0, 1.0);
    let idx = p * (sorted.len().saturating_sub(1) as f64);
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let w = idx - lo as f64;
    sorted[lo] * (1.0 - w) + sorted[hi] * w
}

/// Running mean/variance accumulator over the full result stream
/// (Welford's algorithm). Unlike the bounded result window, this never
/// forgets, so convergence history reflects the entire run.
#[derive(Debug, Clone, Copy, Default)]
pub struct Welford {
    n: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    pub fn push(&mut self, value: f64) {
        self.n += 1;
        let delta = value - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            0.0
        } else {
            self.m2 / self.n as f64
        }
    }
}

/// One normality test verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalityTest {
    pub statistic: f64,
    pub pvalue: f64,
    pub is_normal_alpha_05: bool,
    pub is_normal_alpha_01: bool,
}

/// Normality tests over the current result window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalityTests {
    pub kolmogorov_smirnov: NormalityTest,
    pub jarque_bera: NormalityTest,
}

impl NormalityTests {
    /// Needs a minimally informative sample.
    pub fn compute(values: &[f64]) -> Option<Self> {
        if values.len() < 20 {
            return None;
        }
        Some(Self {
            kolmogorov_smirnov: kolmogorov_smirnov(values),
            jarque_bera: jarque_bera(values),
        })
    }
}

/// One-sample KS test against the normal fitted to the sample, with the
/// asymptotic Kolmogorov p-value.
fn kolmogorov_smirnov(values: &[f64]) -> NormalityTest {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n).sqrt();

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut d: f64 = 0.0;
    for (i, value) in sorted.iter().enumerate() {
        let cdf = if std > 0.0 {
            normal_cdf((value - mean) / std)
        } else {
            0.5
        };
        let upper = (i as f64 + 1.0) / n - cdf;
        let lower = cdf - i as f64 / n;
        d = d.max(upper).max(lower);
    }

    let pvalue = ks_pvalue(d, n);
    verdict(d, pvalue)
}

/// Jarque–Bera: skewness/kurtosis test; the statistic is asymptotically
/// χ²(2), whose survival function has the closed form exp(−x/2).
fn jarque_bera(values: &[f64]) -> NormalityTest {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let m2 = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let m3 = values.iter().map(|v| (v - mean).powi(3)).sum::<f64>() / n;
    let m4 = values.iter().map(|v| (v - mean).powi(4)).sum::<f64>() / n;

    let (skew, kurt) = if m2 > 0.0 {
        (m3 / m2.powf(1.5), m4 / (m2 * m2))
    } else {
        (0.0, 3.0)
    };
    let statistic = n / 6.0 * (skew * skew + (kurt - 3.0) * (kurt - 3.0) / 4.0);
    let pvalue = (-statistic / 2.0).exp();
    verdict(statistic, pvalue)
}

fn verdict(statistic: f64, pvalue: f64) -> NormalityTest {
    NormalityTest {
        statistic,
        pvalue,
        is_normal_alpha_05: pvalue > 0.05,
        is_normal_alpha_01: pvalue > 0.01,
    }
}

/// Standard normal CDF via the Abramowitz–Stegun erf approximation
/// (max error ≈ 1.5e-7, far below the test resolution).
fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - poly * (-x * x).exp())
}

/// Asymptotic Kolmogorov distribution: Q(λ) = 2·Σ (−1)^(k−1) e^(−2k²λ²).
fn ks_pvalue(d: f64, n: f64) -> f64 {
    let lambda = (n.sqrt() + 0.12 + 0.11 / n.sqrt()) * d;
    let mut sum = 0.0;
    for k in 1..=100 {
        let term = (-2.0 * (k as f64 * lambda).powi(2)).exp();
        sum += if k % 2 == 1 { term } else { -term };
    }
    (2.0 * sum).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptive_known_sample() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let stats = Descriptive::compute(&values).unwrap();
        assert_eq!(stats.n, 5);
        assert_eq!(stats.mean, 3.0);
        assert_eq!(stats.median, 3.0);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 5.0);
        assert_eq!(stats.variance, 2.0);
        assert_eq!(stats.p25, 2.0);
        assert_eq!(stats.p75, 4.0);
        assert!(stats.ci95_lower < stats.mean && stats.mean < stats.ci95_upper);
    }

    #[test]
    fn test_descriptive_empty() {
        assert!(Descriptive::compute(&[]).is_none());
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [0.0, 10.0];
        assert_eq!(percentile(&sorted, 0.5), 5.0);
        assert_eq!(percentile(&sorted, 0.0), 0.0);
        assert_eq!(percentile(&sorted, 1.0), 10.0);
    }

    #[test]
    fn test_welford_matches_direct() {
        let values: Vec<f64> = (0..1000).map(|i| (i as f64 * 0.37).sin()).collect();
        let mut acc = Welford::default();
        for v in &values {
            acc.push(*v);
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>()
            / values.len() as f64;
        assert!((acc.mean() - mean).abs() < 1e-12);
        assert!((acc.variance() - var).abs() < 1e-9);
        assert_eq!(acc.count(), 1000);
    }

    #[test]
    fn test_normal_cdf_reference_points() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-3);
        assert!((normal_cdf(-1.96) - 0.025).abs() < 1e-3);
    }

    #[test]
    fn test_normality_accepts_gaussian_sample() {
        // Deterministic near-normal sample via the probit of a uniform grid.
        let values: Vec<f64> = (1..=500)
            .map(|i| {
                let u = i as f64 / 501.0;
                // inverse CDF by bisection on normal_cdf
                let (mut lo, mut hi) = (-8.0f64, 8.0f64);
                for _ in 0..60 {
                    let mid = (lo + hi) / 2.0;
                    if normal_cdf(mid) < u {
                        lo = mid;
                    } else {
                        hi = mid;
                    }
                }
                (lo + hi) / 2.0
            })
            .collect();
        let tests = NormalityTests::compute(&values).unwrap();
        assert!(tests.kolmogorov_smirnov.is_normal_alpha_05);
        assert!(tests.jarque_bera.is_normal_alpha_01);
    }

    #[test]
    fn test_normality_rejects_uniform_sample() {
        let values: Vec<f64> = (0..2000).map(|i| i as f64 / 2000.0).collect();
        let tests = NormalityTests::compute(&values).unwrap();
        assert!(!tests.kolmogorov_smirnov.is_normal_alpha_05);
    }

    #[test]
    fn test_normality_needs_sample_size() {
        assert!(NormalityTests::compute(&[1.0; 10]).is_none());
    }
}
