use crate::data::DataMatrix;
use crate::dist::{self, Categorical, MultivariateNormal};
use crate::error::{Error, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

/// A component's responsibility mass below `COLLAPSE_FRACTION · n` triggers
/// reinitialization instead of a singular covariance update.
const COLLAPSE_FRACTION: f64 = 1e-8;

/// Rows per parallel work unit. Partial results are collected in chunk
/// order and merged sequentially, so fitting and likelihood evaluation
/// produce bit-identical output regardless of thread scheduling.
const PAR_CHUNK_ROWS: usize = 512;

/// One weighted Gaussian of a mixture. The covariance is flat d×d
/// row-major and is kept positive definite by the fitting routine.
#[derive(Debug, Clone)]
pub struct GaussianComponent {
    pub weight: f64,
    pub mean: Vec<f64>,
    pub cov: Vec<f64>,
}

/// A fitted Gaussian mixture. Never mutated after fitting; refitting
/// produces a new model.
#[derive(Debug, Clone)]
pub struct MixtureModel {
    pub components: Vec<GaussianComponent>,
    pub dim: usize,
    /// Data log-likelihood under the final parameters.
    pub log_likelihood: f64,
    /// Number of EM iterations performed.
    pub iterations: usize,
    /// Per-iteration data log-likelihood, evaluated before each update.
    pub log_likelihood_trace: Vec<f64>,
}

/// Configuration for EM fitting.
#[derive(Debug, Clone)]
pub struct MixtureFitConfig {
    pub n_components: usize,
    pub tolerance: f64,
    pub max_iterations: usize,
    pub seed: u64,
}

impl Default for MixtureFitConfig {
    fn default() -> Self {
        Self {
            n_components: 1,
            tolerance: 1e-6,
            max_iterations: 200,
            seed: 42,
        }
    }
}

/// Responsibility-weighted sufficient statistics accumulated per row chunk.
///
/// Each rayon worker folds rows into a private instance; instances are
/// merged at the end of the responsibility step, so no state is shared
/// while rows are being processed.
struct SuffStats {
    log_likelihood: f64,
    nk: Vec<f64>,
    sum_x: Vec<f64>,
    sum_xx: Vec<f64>,
}

impl SuffStats {
    fn zeros(k: usize, d: usize) -> Self {
        Self {
            log_likelihood: 0.0,
            nk: vec![0.0; k],
            sum_x: vec![0.0; k * d],
            sum_xx: vec![0.0; k * d * d],
        }
    }

    fn merge(mut self, other: Self) -> Self {
        self.log_likelihood += other.log_likelihood;
        for (a, b) in self.nk.iter_mut().zip(&other.nk) {
            *a += b;
        }
        for (a, b) in self.sum_x.iter_mut().zip(&other.sum_x) {
            *a += b;
        }
        for (a, b) in self.sum_xx.iter_mut().zip(&other.sum_xx) {
            *a += b;
        }
        self
    }

    fn accumulate(&mut self, row: &[f64], log_weights: &[f64], mvns: &[MultivariateNormal]) {
        let k = log_weights.len();
        let d = row.len();

        let mut log_post = vec![0.0; k];
        let mut max_lp = f64::NEG_INFINITY;
        for j in 0..k {
            let lp = log_weights[j] + mvns[j].log_density(row);
            log_post[j] = lp;
            if lp > max_lp {
                max_lp = lp;
            }
        }
        let lse = max_lp + log_post.iter().map(|lp| (lp - max_lp).exp()).sum::<f64>().ln();
        self.log_likelihood += lse;

        for j in 0..k {
            let resp = (log_post[j] - lse).exp();
            self.nk[j] += resp;
            for a in 0..d {
                self.sum_x[j * d + a] += resp * row[a];
                let base = j * d * d + a * d;
                for b in 0..d {
                    self.sum_xx[base + b] += resp * row[a] * row[b];
                }
            }
        }
    }
}

fn validate_fit_inputs(data: &DataMatrix, config: &MixtureFitConfig) -> Result<()> {
    if data.n_rows() == 0 || data.n_cols() == 0 {
        return Err(Error::InvalidParameter(
            "cannot fit a mixture to an empty data matrix".into(),
        ));
    }
    if data.column_types().iter().any(|t| t.is_discrete()) {
        return Err(Error::InvalidParameter(
            "mixture fitting requires all-continuous columns".into(),
        ));
    }
    if config.n_components == 0 {
        return Err(Error::InvalidParameter("n_components must be >= 1".into()));
    }
    if config.n_components > data.n_rows() {
        return Err(Error::InvalidParameter(format!(
            "n_components {} exceeds row count {}",
            config.n_components,
            data.n_rows()
        )));
    }
    if !config.tolerance.is_finite() || config.tolerance < 0.0 {
        return Err(Error::InvalidParameter(format!(
            "tolerance must be non-negative, got {}",
            config.tolerance
        )));
    }
    if config.max_iterations == 0 {
        return Err(Error::InvalidParameter("max_iterations must be >= 1".into()));
    }
    Ok(())
}

/// Global (biased) mean and covariance of the data.
fn global_moments(data: &DataMatrix) -> (Vec<f64>, Vec<f64>) {
    let n = data.n_rows();
    let d = data.n_cols();
    let mut mean = vec![0.0; d];
    for row in data.rows() {
        for (m, v) in mean.iter_mut().zip(row) {
            *m += v;
        }
    }
    for m in &mut mean {
        *m /= n as f64;
    }

    let mut cov = vec![0.0; d * d];
    for row in data.rows() {
        for a in 0..d {
            let da = row[a] - mean[a];
            for b in 0..d {
                cov[a * d + b] += da * (row[b] - mean[b]);
            }
        }
    }
    for c in &mut cov {
        *c /= n as f64;
    }
    (mean, cov)
}

/// Deterministic initialization: a seeded random row becomes the first
/// mean, then farthest-point selection spreads the remaining means across
/// the data. Every component starts at the global covariance with uniform
/// weight.
fn initial_components(data: &DataMatrix, k: usize, rng: &mut ChaCha8Rng) -> Vec<GaussianComponent> {
    let n = data.n_rows();
    let (_, global_cov) = global_moments(data);

    let mut chosen: Vec<usize> = vec![rng.gen_range(0..n)];
    while chosen.len() < k {
        let mut best_row = None;
        let mut best_dist = -1.0;
        for r in 0..n {
            let dist = chosen
                .iter()
                .map(|&c| {
                    data.row(r)
                        .iter()
                        .zip(data.row(c))
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f64>()
                })
                .fold(f64::INFINITY, f64::min);
            if dist > best_dist {
                best_dist = dist;
                best_row = Some(r);
            }
        }
        match best_row {
            Some(r) if best_dist > 0.0 => chosen.push(r),
            // Duplicated rows: fall back to an arbitrary seeded pick.
            _ => chosen.push(rng.gen_range(0..n)),
        }
    }

    chosen
        .into_iter()
        .map(|r| GaussianComponent {
            weight: 1.0 / k as f64,
            mean: data.row(r).to_vec(),
            cov: global_cov.clone(),
        })
        .collect()
}

fn build_mvns(components: &[GaussianComponent]) -> Result<Vec<MultivariateNormal>> {
    components
        .iter()
        .map(|c| MultivariateNormal::regularized(c.mean.clone(), &c.cov).map(|(m, _)| m))
        .collect()
}

/// Reinitialize component `idx` by splitting the highest-mass component:
/// copy its covariance, perturb its mean by one standard deviation per
/// axis, and share its weight.
fn split_largest(components: &mut [GaussianComponent], idx: usize, rng: &mut ChaCha8Rng) {
    let big = components
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != idx)
        .max_by(|(_, a), (_, b)| a.weight.partial_cmp(&b.weight).unwrap())
        .map(|(j, _)| j)
        .unwrap_or(idx);

    let d = components[big].mean.len();
    let mut mean = components[big].mean.clone();
    for a in 0..d {
        let sd = components[big].cov[a * d + a].max(1e-12).sqrt();
        let z: f64 = StandardNormal.sample(rng);
        mean[a] += sd * z;
    }
    let cov = components[big].cov.clone();
    let shared = components[big].weight / 2.0;
    components[big].weight = shared;
    components[idx] = GaussianComponent {
        weight: shared,
        mean,
        cov,
    };
}

fn responsibility_step(
    data: &DataMatrix,
    components: &[GaussianComponent],
) -> Result<SuffStats> {
    let k = components.len();
    let d = data.n_cols();
    let mvns = build_mvns(components)?;
    let log_weights: Vec<f64> = components.iter().map(|c| c.weight.ln()).collect();

    let partials: Vec<SuffStats> = data
        .values()
        .par_chunks(d * PAR_CHUNK_ROWS)
        .map(|rows| {
            let mut acc = SuffStats::zeros(k, d);
            for row in rows.chunks(d) {
                acc.accumulate(row, &log_weights, &mvns);
            }
            acc
        })
        .collect();
    let stats = partials
        .into_iter()
        .fold(SuffStats::zeros(k, d), SuffStats::merge);

    if !stats.log_likelihood.is_finite() {
        return Err(Error::NonFiniteResult("mixture responsibility step".into()));
    }
    Ok(stats)
}

fn update_step(
    components: &mut Vec<GaussianComponent>,
    stats: &SuffStats,
    n: usize,
    d: usize,
    rng: &mut ChaCha8Rng,
) {
    let k = components.len();
    for j in 0..k {
        let nk = stats.nk[j];
        if nk < COLLAPSE_FRACTION * n as f64 {
            split_largest(components, j, rng);
            continue;
        }
        components[j].weight = nk / n as f64;
        let mean: Vec<f64> = (0..d).map(|a| stats.sum_x[j * d + a] / nk).collect();
        let mut cov = vec![0.0; d * d];
        for a in 0..d {
            for b in 0..d {
                cov[a * d + b] = stats.sum_xx[j * d * d + a * d + b] / nk - mean[a] * mean[b];
            }
        }
        components[j].mean = mean;
        components[j].cov = cov;
    }

    let total: f64 = components.iter().map(|c| c.weight).sum();
    for c in components.iter_mut() {
        c.weight /= total;
    }
}

/// Log-density of one row under the weighted mixture, via log-sum-exp.
fn log_mixture_density(row: &[f64], log_weights: &[f64], mvns: &[MultivariateNormal]) -> f64 {
    let mut max_lp = f64::NEG_INFINITY;
    let lps: Vec<f64> = log_weights
        .iter()
        .zip(mvns)
        .map(|(lw, mvn)| {
            let lp = lw + mvn.log_density(row);
            if lp > max_lp {
                max_lp = lp;
            }
            lp
        })
        .collect();
    max_lp + lps.iter().map(|lp| (lp - max_lp).exp()).sum::<f64>().ln()
}

/// Data log-likelihood under the given components.
fn log_likelihood(data: &DataMatrix, components: &[GaussianComponent]) -> Result<f64> {
    let d = data.n_cols();
    let mvns = build_mvns(components)?;
    let log_weights: Vec<f64> = components.iter().map(|c| c.weight.ln()).collect();

    let partials: Vec<f64> = data
        .values()
        .par_chunks(d * PAR_CHUNK_ROWS)
        .map(|rows| {
            rows.chunks(d)
                .map(|row| log_mixture_density(row, &log_weights, &mvns))
                .sum::<f64>()
        })
        .collect();
    let ll: f64 = partials.iter().sum();

    if !ll.is_finite() {
        return Err(Error::NonFiniteResult("mixture likelihood evaluation".into()));
    }
    Ok(ll)
}

/// Fit a Gaussian mixture by expectation-maximization.
///
/// Initialization is deterministic in `config.seed`; the responsibility
/// step runs per-row-chunk in parallel with private partial sums. The
/// loop stops when the log-likelihood improvement falls below
/// `config.tolerance` (after at least one full update) or when
/// `max_iterations` is reached.
pub fn fit(data: &DataMatrix, config: &MixtureFitConfig) -> Result<MixtureModel> {
    validate_fit_inputs(data, config)?;
    let n = data.n_rows();
    let d = data.n_cols();
    let k = config.n_components;

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut components = initial_components(data, k, &mut rng);

    let mut trace = Vec::new();
    let mut prev_ll = f64::NEG_INFINITY;
    let mut iterations = 0;

    for _ in 0..config.max_iterations {
        let stats = responsibility_step(data, &components)?;
        trace.push(stats.log_likelihood);
        iterations += 1;

        update_step(&mut components, &stats, n, d, &mut rng);

        let improvement = stats.log_likelihood - prev_ll;
        prev_ll = stats.log_likelihood;
        if iterations > 1 && improvement.abs() < config.tolerance {
            break;
        }
    }

    // Leave every covariance factorable: fold any jitter the fit relied on
    // into the stored parameters.
    for c in &mut components {
        let (cov, _, _) = dist::regularize_covariance(&c.cov, d)?;
        c.cov = cov;
    }

    let final_ll = log_likelihood(data, &components)?;
    Ok(MixtureModel {
        components,
        dim: d,
        log_likelihood: final_ll,
        iterations,
        log_likelihood_trace: trace,
    })
}

impl MixtureModel {
    /// Log-likelihood of an arbitrary data matrix under this model.
    pub fn log_likelihood_of(&self, data: &DataMatrix) -> Result<f64> {
        if data.n_cols() != self.dim {
            return Err(Error::ShapeMismatch(format!(
                "model dimension {} vs data with {} columns",
                self.dim,
                data.n_cols()
            )));
        }
        log_likelihood(data, &self.components)
    }
}

/// Draw `n` synthetic rows from a fitted mixture.
///
/// Row `i` uses its own stream seeded `seed + i`, so output is identical
/// for a given seed regardless of how rows are scheduled across threads.
pub fn sample(model: &MixtureModel, n: usize, seed: u64) -> Result<DataMatrix> {
    let weights: Vec<f64> = model.components.iter().map(|c| c.weight).collect();
    let picker = Categorical::new(&weights)?;
    let mvns = build_mvns(&model.components)?;
    let d = model.dim;

    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(i as u64));
            let comp = picker.sample(&mut rng);
            mvns[comp].sample(&mut rng)
        })
        .collect();

    let mut values = Vec::with_capacity(n * d);
    for row in rows {
        values.extend(row);
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(Error::NonFiniteResult("mixture sampling".into()));
    }
    DataMatrix::continuous(values, n, d)
}
