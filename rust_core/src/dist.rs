use crate::error::{Error, Result};
use crate::linalg;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

const LN_TAU: f64 = 1.837877066409345483560659472811; // ln(2π)

/// Escalating diagonal jitter applied when a covariance fails to factor.
/// Scales are relative to the mean absolute diagonal of the covariance.
const JITTER_SCALES: [f64; 4] = [1e-10, 1e-8, 1e-6, 1e-4];

/// Univariate normal log-density.
pub fn normal_log_density(x: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma;
    -0.5 * z * z - sigma.ln() - 0.5 * LN_TAU
}

/// Add `jitter·I` to a covariance with escalating jitter until it factors.
///
/// Returns the (possibly modified) covariance, its Cholesky factor, and the
/// jitter applied. Zero jitter means the input was already positive
/// definite. `SingularMatrix` only after every attempt fails.
pub fn regularize_covariance(cov: &[f64], dim: usize) -> Result<(Vec<f64>, Vec<f64>, f64)> {
    if let Ok(l) = linalg::cholesky(cov, dim) {
        return Ok((cov.to_vec(), l, 0.0));
    }

    let diag_scale = (0..dim)
        .map(|i| cov[i * dim + i].abs())
        .sum::<f64>()
        / dim as f64;
    let scale = diag_scale.max(1e-12);

    for &eps in &JITTER_SCALES {
        let jitter = eps * scale;
        let mut jittered = cov.to_vec();
        for i in 0..dim {
            jittered[i * dim + i] += jitter;
        }
        if let Ok(l) = linalg::cholesky(&jittered, dim) {
            return Ok((jittered, l, jitter));
        }
    }

    Err(Error::SingularMatrix(format!(
        "{dim}x{dim} covariance not positive definite after jitter up to {:e}",
        JITTER_SCALES[JITTER_SCALES.len() - 1] * scale
    )))
}

// ── Multivariate Gaussian ───────────────────────────────────────────

/// A multivariate Gaussian held in factored form: the Cholesky factor of
/// the covariance is computed once at construction and reused for both
/// density evaluation and sampling, so the covariance is never inverted.
#[derive(Debug, Clone)]
pub struct MultivariateNormal {
    mean: Vec<f64>,
    chol: Vec<f64>,
    half_log_det: f64,
    dim: usize,
}

impl MultivariateNormal {
    /// Strict construction: the covariance must be positive definite.
    pub fn new(mean: Vec<f64>, cov: &[f64]) -> Result<Self> {
        let dim = mean.len();
        if cov.len() != dim * dim {
            return Err(Error::ShapeMismatch(format!(
                "covariance has {} entries for dimension {}",
                cov.len(),
                dim
            )));
        }
        let chol = linalg::cholesky(cov, dim)?;
        let half_log_det = linalg::half_log_det(&chol, dim);
        Ok(Self {
            mean,
            chol,
            half_log_det,
            dim,
        })
    }

    /// Construction for fitting and sampling paths: a near-singular
    /// covariance is jittered into validity (a recoverable degeneracy)
    /// instead of failing. Returns the jitter applied.
    pub fn regularized(mean: Vec<f64>, cov: &[f64]) -> Result<(Self, f64)> {
        let dim = mean.len();
        if cov.len() != dim * dim {
            return Err(Error::ShapeMismatch(format!(
                "covariance has {} entries for dimension {}",
                cov.len(),
                dim
            )));
        }
        let (_, chol, jitter) = regularize_covariance(cov, dim)?;
        let half_log_det = linalg::half_log_det(&chol, dim);
        Ok((
            Self {
                mean,
                chol,
                half_log_det,
                dim,
            },
            jitter,
        ))
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Log-density via the Cholesky factor: solve L·z = (x − μ), then
    /// logp = −½·zᵀz − ½·d·ln 2π − ½·ln det Σ.
    pub fn log_density(&self, x: &[f64]) -> f64 {
        debug_assert_eq!(x.len(), self.dim);
        let centered: Vec<f64> = x.iter().zip(&self.mean).map(|(a, b)| a - b).collect();
        let z = linalg::forward_substitute(&self.chol, self.dim, &centered);
        let quad: f64 = z.iter().map(|v| v * v).sum();
        -0.5 * quad - 0.5 * self.dim as f64 * LN_TAU - self.half_log_det
    }

    pub fn density(&self, x: &[f64]) -> f64 {
        self.log_density(x).exp()
    }

    /// Draw one vector: x = μ + L·z with z standard normal.
    pub fn sample(&self, rng: &mut ChaCha8Rng) -> Vec<f64> {
        let z: Vec<f64> = (0..self.dim).map(|_| StandardNormal.sample(rng)).collect();
        let mut x = self.mean.clone();
        for i in 0..self.dim {
            for k in 0..=i {
                x[i] += self.chol[i * self.dim + k] * z[k];
            }
        }
        x
    }
}

// ── Categorical ─────────────────────────────────────────────────────

/// A discrete distribution over `0..k`, sampled by inverse-CDF lookup.
#[derive(Debug, Clone)]
pub struct Categorical {
    cumulative: Vec<f64>,
}

impl Categorical {
    /// Weights are normalized internally; they must be non-negative with a
    /// positive sum.
    pub fn new(weights: &[f64]) -> Result<Self> {
        if weights.is_empty() {
            return Err(Error::InvalidParameter(
                "categorical requires at least one weight".into(),
            ));
        }
        let mut total = 0.0;
        for w in weights {
            if !w.is_finite() || *w < 0.0 {
                return Err(Error::InvalidParameter(format!(
                    "categorical weight {} is negative or non-finite",
                    w
                )));
            }
            total += w;
        }
        if total <= 0.0 {
            return Err(Error::InvalidParameter(
                "categorical weights sum to zero".into(),
            ));
        }

        let mut cumulative = Vec::with_capacity(weights.len());
        let mut acc = 0.0;
        for w in weights {
            acc += w / total;
            cumulative.push(acc);
        }
        // Guard the top bin against accumulated rounding.
        *cumulative.last_mut().unwrap() = 1.0;
        Ok(Self { cumulative })
    }

    pub fn len(&self) -> usize {
        self.cumulative.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cumulative.is_empty()
    }

    pub fn sample(&self, rng: &mut ChaCha8Rng) -> usize {
        let u: f64 = rng.gen();
        match self
            .cumulative
            .iter()
            .position(|threshold| u < *threshold)
        {
            Some(idx) => idx,
            None => self.cumulative.len() - 1,
        }
    }
}
