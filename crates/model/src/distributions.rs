//! Seeded distribution generator.
//!
//! Pure mapping from `(distribution, params)` to variates, with all
//! randomness held in an explicit, seedable RNG. Parameter contracts are
//! checked before sampling; violations surface as `ConfigError`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Binomial, Distribution, Exp, LogNormal, Normal, Triangular};

use crate::error::ConfigError;
use crate::types::{DistributionKind, VariableKind, VariableSpec};

/// Draws variates for model variables from a seeded RNG.
pub struct Generator {
    rng: StdRng,
}

impl Generator {
    /// Seeded for reproducibility; unseeded models draw from OS entropy.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Draw one variate for a variable. `int`-kind variables round to the
    /// nearest integer.
    pub fn draw(&mut self, var: &VariableSpec) -> Result<f64, ConfigError> {
        let value = self.sample(var.distribution, &var.params)?;
        Ok(match var.kind {
            VariableKind::Int => value.round(),
            VariableKind::Float => value,
        })
    }

    /// `size` independent draws, equivalent to calling [`draw`] in a loop.
    pub fn draw_batch(&mut self, var: &VariableSpec, size: usize) -> Result<Vec<f64>, ConfigError> {
        (0..size).map(|_| self.draw(var)).collect()
    }

    fn sample(
        &mut self,
        distribution: DistributionKind,
        params: &indexmap::IndexMap<String, f64>,
    ) -> Result<f64, ConfigError> {
        let get = |name: &str| -> Result<f64, ConfigError> {
            params.get(name).copied().ok_or_else(|| {
                ConfigError::new(
                    distribution.name(),
                    format!("missing parameter '{name}'"),
                )
            })
        };

        match distribution {
            DistributionKind::Normal => {
                let mean = get("media")?;
                let std = get("std")?;
                if std <= 0.0 {
                    return Err(ConfigError::new("normal", "'std' must be > 0"));
                }
                let dist = Normal::new(mean, std)
                    .map_err(|e| ConfigError::new("normal", e.to_string()))?;
                Ok(dist.sample(&mut self.rng))
            }
            DistributionKind::Uniform => {
                let min = get("min")?;
                let max = get("max")?;
                if min >= max {
                    return Err(ConfigError::new("uniform", "'min' must be < 'max'"));
                }
                Ok(self.rng.gen_range(min..max))
            }
            DistributionKind::Exponential => {
                // Accepts 'lambda' or its reciprocal 'scale'.
                let lambda = if params.contains_key("lambda") {
                    let lambda = get("lambda")?;
                    if lambda <= 0.0 {
                        return Err(ConfigError::new("exponential", "'lambda' must be > 0"));
                    }
                    lambda
                } else if params.contains_key("scale") {
                    let scale = get("scale")?;
                    if scale <= 0.0 {
                        return Err(ConfigError::new("exponential", "'scale' must be > 0"));
                    }
                    1.0 / scale
                } else {
                    return Err(ConfigError::new(
                        "exponential",
                        "missing parameter 'lambda' (or 'scale')",
                    ));
                };
                let dist = Exp::new(lambda)
                    .map_err(|e| ConfigError::new("exponential", e.to_string()))?;
                Ok(dist.sample(&mut self.rng))
            }
            DistributionKind::Lognormal => {
                let mu = get("mu")?;
                let sigma = get("sigma")?;
                if sigma <= 0.0 {
                    return Err(ConfigError::new("lognormal", "'sigma' must be > 0"));
                }
                let dist = LogNormal::new(mu, sigma)
                    .map_err(|e| ConfigError::new("lognormal", e.to_string()))?;
                Ok(dist.sample(&mut self.rng))
            }
            DistributionKind::Triangular => {
                let left = get("left")?;
                let mode = get("mode")?;
                let right = get("right")?;
                if !(left <= mode && mode <= right) {
                    return Err(ConfigError::new(
                        "triangular",
                        "'left' <= 'mode' <= 'right' is required",
                    ));
                }
                if left >= right {
                    return Err(ConfigError::new("triangular", "'left' must be < 'right'"));
                }
                let dist = Triangular::new(left, right, mode)
                    .map_err(|e| ConfigError::new("triangular", e.to_string()))?;
                Ok(dist.sample(&mut self.rng))
            }
            DistributionKind::Binomial => {
                let n = get("n")?;
                let p = get("p")?;
                if n <= 0.0 || n.fract() != 0.0 {
                    return Err(ConfigError::new("binomial", "'n' must be a positive integer"));
                }
                if !(0.0..=1.0).contains(&p) {
                    return Err(ConfigError::new("binomial", "'p' must be in [0, 1]"));
                }
                let dist = Binomial::new(n as u64, p)
                    .map_err(|e| ConfigError::new("binomial", e.to_string()))?;
                Ok(dist.sample(&mut self.rng) as f64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    const M: usize = 100_000;

    fn var(kind: VariableKind, dist: DistributionKind, params: &[(&str, f64)]) -> VariableSpec {
        VariableSpec {
            name: "v".into(),
            kind,
            distribution: dist,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<IndexMap<_, _>>(),
        }
    }

    fn moments(values: &[f64]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        (mean, var)
    }

    /// Empirical mean within 3 standard errors of the theoretical mean, and
    /// variance within 10% of the theoretical variance.
    fn assert_moments(values: &[f64], expected_mean: f64, expected_var: f64) {
        let (mean, var) = moments(values);
        let se = (expected_var / values.len() as f64).sqrt();
        assert!(
            (mean - expected_mean).abs() < 3.0 * se,
            "mean {mean} not within 3 SE of {expected_mean}"
        );
        assert!(
            (var - expected_var).abs() < 0.1 * expected_var.max(0.01),
            "variance {var} too far from {expected_var}"
        );
    }

    #[test]
    fn test_determinism_with_fixed_seed() {
        let spec = var(VariableKind::Float, DistributionKind::Normal, &[("media", 0.0), ("std", 1.0)]);
        let a = Generator::new(Some(42)).draw_batch(&spec, 100).unwrap();
        let b = Generator::new(Some(42)).draw_batch(&spec, 100).unwrap();
        assert_eq!(a, b);
        let c = Generator::new(Some(43)).draw_batch(&spec, 100).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_normal_moments() {
        let spec = var(VariableKind::Float, DistributionKind::Normal, &[("media", 5.0), ("std", 2.0)]);
        let values = Generator::new(Some(1)).draw_batch(&spec, M).unwrap();
        assert_moments(&values, 5.0, 4.0);
    }

    #[test]
    fn test_uniform_moments_and_bounds() {
        let spec = var(VariableKind::Float, DistributionKind::Uniform, &[("min", 0.0), ("max", 10.0)]);
        let values = Generator::new(Some(2)).draw_batch(&spec, M).unwrap();
        assert!(values.iter().all(|v| (0.0..10.0).contains(v)));
        assert_moments(&values, 5.0, 100.0 / 12.0);
    }

    #[test]
    fn test_exponential_moments() {
        let spec = var(
            VariableKind::Float,
            DistributionKind::Exponential,
            &[("lambda", 2.0)],
        );
        let values = Generator::new(Some(3)).draw_batch(&spec, M).unwrap();
        assert!(values.iter().all(|v| *v >= 0.0));
        assert_moments(&values, 0.5, 0.25);
    }

    #[test]
    fn test_exponential_scale_alias() {
        let spec = var(
            VariableKind::Float,
            DistributionKind::Exponential,
            &[("scale", 0.5)],
        );
        let values = Generator::new(Some(3)).draw_batch(&spec, M).unwrap();
        assert_moments(&values, 0.5, 0.25);
    }

    #[test]
    fn test_lognormal_moments() {
        let (mu, sigma): (f64, f64) = (0.0, 0.5);
        let spec = var(
            VariableKind::Float,
            DistributionKind::Lognormal,
            &[("mu", mu), ("sigma", sigma)],
        );
        let values = Generator::new(Some(4)).draw_batch(&spec, M).unwrap();
        assert!(values.iter().all(|v| *v > 0.0));
        let expected_mean = (mu + sigma * sigma / 2.0).exp();
        let expected_var = ((sigma * sigma).exp() - 1.0) * (2.0 * mu + sigma * sigma).exp();
        assert_moments(&values, expected_mean, expected_var);
    }

    #[test]
    fn test_triangular_moments() {
        let spec = var(
            VariableKind::Float,
            DistributionKind::Triangular,
            &[("left", 0.0), ("mode", 5.0), ("right", 10.0)],
        );
        let values = Generator::new(Some(5)).draw_batch(&spec, M).unwrap();
        assert!(values.iter().all(|v| (0.0..=10.0).contains(v)));
        // mean = (a + b + c) / 3; var = (a² + b² + c² − ab − ac − bc) / 18
        assert_moments(&values, 5.0, 100.0 / 24.0);
    }

    #[test]
    fn test_binomial_moments_and_integrality() {
        let spec = var(
            VariableKind::Int,
            DistributionKind::Binomial,
            &[("n", 10.0), ("p", 0.5)],
        );
        let values = Generator::new(Some(6)).draw_batch(&spec, M).unwrap();
        assert!(values.iter().all(|v| v.fract() == 0.0 && (0.0..=10.0).contains(v)));
        assert_moments(&values, 5.0, 2.5);
    }

    #[test]
    fn test_int_kind_rounds() {
        let spec = var(VariableKind::Int, DistributionKind::Normal, &[("media", 100.0), ("std", 5.0)]);
        let values = Generator::new(Some(7)).draw_batch(&spec, 1000).unwrap();
        assert!(values.iter().all(|v| v.fract() == 0.0));
    }

    #[test]
    fn test_parameter_violations() {
        let cases = [
            var(VariableKind::Float, DistributionKind::Normal, &[("media", 0.0), ("std", 0.0)]),
            var(VariableKind::Float, DistributionKind::Uniform, &[("min", 5.0), ("max", 5.0)]),
            var(VariableKind::Float, DistributionKind::Exponential, &[("lambda", -1.0)]),
            var(VariableKind::Float, DistributionKind::Lognormal, &[("mu", 0.0), ("sigma", -0.1)]),
            var(
                VariableKind::Float,
                DistributionKind::Triangular,
                &[("left", 5.0), ("mode", 1.0), ("right", 10.0)],
            ),
            var(VariableKind::Int, DistributionKind::Binomial, &[("n", 10.0), ("p", 1.5)]),
            var(VariableKind::Int, DistributionKind::Binomial, &[("n", 0.0), ("p", 0.5)]),
        ];
        for spec in cases {
            let err = Generator::new(Some(0)).draw(&spec);
            assert!(err.is_err(), "expected ConfigError for {spec:?}");
        }
    }

    #[test]
    fn test_missing_parameter() {
        let spec = var(VariableKind::Float, DistributionKind::Normal, &[("media", 0.0)]);
        let err = Generator::new(Some(0)).draw(&spec).unwrap_err();
        assert!(err.message.contains("std"));
    }

    #[test]
    fn test_batch_equivalent_to_loop() {
        let spec = var(VariableKind::Float, DistributionKind::Uniform, &[("min", 0.0), ("max", 1.0)]);
        let batch = Generator::new(Some(9)).draw_batch(&spec, 50).unwrap();
        let mut gen = Generator::new(Some(9));
        let looped: Vec<f64> = (0..50).map(|_| gen.draw(&spec).unwrap()).collect();
        assert_eq!(batch, looped);
    }
}
