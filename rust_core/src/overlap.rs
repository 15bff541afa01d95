//! Pairwise component overlap rate (OLR) for Gaussian mixtures.
//!
//! For every component pair, the two components are renormalized into a
//! standalone sub-mixture and its density is traced along the segment
//! through the two means. The ratio of the first saddle density to the
//! lowest peak density measures how separated the pair is: 1.0 means the
//! sub-mixture is effectively unimodal, values near 0 mean two cleanly
//! separated modes. Structure-search procedures use the average as a
//! fitness signal.

use crate::dist::MultivariateNormal;
use crate::error::{Error, Result};
use crate::mixture::MixtureModel;

/// The segment between the two means is divided into this many steps.
const SEGMENT_STEPS: usize = 1000;
/// The trace is extended this many steps beyond each mean.
const EXTEND_STEPS: usize = 10;

const TOTAL_STEPS: usize = SEGMENT_STEPS + 2 * EXTEND_STEPS;

/// Overlap rate for every component pair (i, j), i < j, in lexicographic
/// order.
///
/// `covs[c]` is the flat d×d row-major covariance of component `c`.
/// Covariances must be positive definite: this is a metric over
/// caller-supplied parameters, so a covariance that fails to factor is a
/// `SingularMatrix` error, never jittered into validity.
pub fn overlap_rates(
    weights: &[f64],
    means: &[Vec<f64>],
    covs: &[Vec<f64>],
) -> Result<Vec<f64>> {
    let n_comp = weights.len();
    if means.len() != n_comp || covs.len() != n_comp {
        return Err(Error::ShapeMismatch(format!(
            "{} weights, {} means, {} covariances",
            n_comp,
            means.len(),
            covs.len()
        )));
    }
    if n_comp == 0 {
        return Err(Error::InvalidParameter(
            "overlap rate requires at least one component".into(),
        ));
    }
    let dim = means[0].len();
    for (c, m) in means.iter().enumerate() {
        if m.len() != dim {
            return Err(Error::ShapeMismatch(format!(
                "component {} mean has dimension {}, expected {}",
                c,
                m.len(),
                dim
            )));
        }
    }

    let mvns: Vec<MultivariateNormal> = means
        .iter()
        .zip(covs)
        .map(|(mean, cov)| MultivariateNormal::new(mean.clone(), cov))
        .collect::<Result<_>>()?;

    let mut values = Vec::with_capacity(n_comp * (n_comp - 1) / 2);
    for i in 0..n_comp {
        for j in i + 1..n_comp {
            values.push(pair_overlap(
                weights[i], weights[j], &means[i], &means[j], &mvns[i], &mvns[j],
            ));
        }
    }
    Ok(values)
}

/// Overlap rates of a fitted mixture's component pairs.
pub fn overlap_rates_model(model: &MixtureModel) -> Result<Vec<f64>> {
    let weights: Vec<f64> = model.components.iter().map(|c| c.weight).collect();
    let means: Vec<Vec<f64>> = model.components.iter().map(|c| c.mean.clone()).collect();
    let covs: Vec<Vec<f64>> = model.components.iter().map(|c| c.cov.clone()).collect();
    overlap_rates(&weights, &means, &covs)
}

fn pair_overlap(
    w_a: f64,
    w_b: f64,
    mean_a: &[f64],
    mean_b: &[f64],
    mvn_a: &MultivariateNormal,
    mvn_b: &MultivariateNormal,
) -> f64 {
    let dim = mean_a.len();

    // Renormalize the pair into a standalone two-component mixture.
    let wa = w_a / (w_a + w_b);
    let wb = 1.0 - wa;

    let delta: Vec<f64> = (0..dim)
        .map(|k| (mean_b[k] - mean_a[k]) / SEGMENT_STEPS as f64)
        .collect();

    // Density along the segment, extended beyond both means.
    let mut pdf = Vec::with_capacity(TOTAL_STEPS + 1);
    let mut point = vec![0.0; dim];
    for step in 0..=TOTAL_STEPS {
        let offset = step as f64 - EXTEND_STEPS as f64;
        for k in 0..dim {
            point[k] = mean_a[k] + offset * delta[k];
        }
        pdf.push(wa * mvn_a.density(&point) + wb * mvn_b.density(&point));
    }

    let mut peaks = Vec::new();
    let mut saddles = Vec::new();
    for k in 1..TOTAL_STEPS {
        if pdf[k] > pdf[k - 1] && pdf[k] > pdf[k + 1] {
            peaks.push(pdf[k]);
        }
        if pdf[k] < pdf[k - 1] && pdf[k] < pdf[k + 1] {
            saddles.push(pdf[k]);
        }
    }

    if peaks.len() == 1 || saddles.is_empty() {
        1.0
    } else {
        let lowest_peak = peaks
            .iter()
            .cloned()
            .fold(f64::INFINITY, f64::min);
        saddles[0] / lowest_peak
    }
}
