use crate::data::{ColumnType, DataMatrix};
use crate::dist::normal_log_density;
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::linalg;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

/// Residual variances are floored here so a perfectly-predicted node still
/// yields a proper conditional density.
const NOISE_VAR_FLOOR: f64 = 1e-9;

/// Rows per parallel work unit in likelihood evaluation.
const PAR_CHUNK_ROWS: usize = 512;

/// The fitted local distribution of one node given its parents.
#[derive(Debug, Clone)]
pub enum ConditionalModel {
    /// Continuous node: mean affine in the parents, additive Gaussian
    /// noise.
    LinearGaussian {
        intercept: f64,
        slopes: Vec<f64>,
        noise_std: f64,
    },
    /// Discrete node: conditional probability table, one row per
    /// mixed-radix parent-value combination.
    Table {
        cardinality: usize,
        parent_cards: Vec<usize>,
        probs: Vec<f64>,
    },
}

impl ConditionalModel {
    /// Free parameters contributed to a structure score.
    fn parameter_count(&self) -> usize {
        match self {
            // Intercept + slopes + noise variance.
            ConditionalModel::LinearGaussian { slopes, .. } => slopes.len() + 2,
            ConditionalModel::Table {
                cardinality, probs, ..
            } => (probs.len() / cardinality) * (cardinality - 1),
        }
    }
}

/// Mixed-radix index of a parent-value combination, first parent most
/// significant.
fn combo_index(parent_values: &[usize], parent_cards: &[usize]) -> usize {
    let mut idx = 0;
    for (v, card) in parent_values.iter().zip(parent_cards) {
        idx = idx * card + v;
    }
    idx
}

/// Configuration for graphical-model fitting.
#[derive(Debug, Clone)]
pub struct GraphicalFitConfig {
    /// Additive smoothing added to every CPT cell before counting, so no
    /// parent combination is left with a zero-probability value.
    pub smoothing: f64,
}

impl Default for GraphicalFitConfig {
    fn default() -> Self {
        Self { smoothing: 1.0 }
    }
}

/// A dependency graph paired with one fitted conditional per node, plus
/// the cached topological order used by ancestral sampling.
#[derive(Debug, Clone)]
pub struct GraphicalModel {
    graph: DependencyGraph,
    order: Vec<usize>,
    nodes: Vec<ConditionalModel>,
    column_types: Vec<ColumnType>,
}

fn fit_node(
    data: &DataMatrix,
    node: usize,
    parents: &[usize],
    smoothing: f64,
) -> Result<ConditionalModel> {
    let n = data.n_rows();
    match data.column_types()[node] {
        ColumnType::Continuous => {
            let y = data.column(node);
            let parent_cols: Vec<Vec<f64>> = parents.iter().map(|&p| data.column(p)).collect();
            let col_refs: Vec<&[f64]> = parent_cols.iter().map(|c| c.as_slice()).collect();
            let beta = linalg::least_squares(&col_refs, &y)?;

            let mut resid_sq = 0.0;
            for r in 0..n {
                let mut mu = beta[0];
                for (j, &p) in parents.iter().enumerate() {
                    mu += beta[j + 1] * data.get(r, p);
                }
                let resid = y[r] - mu;
                resid_sq += resid * resid;
            }
            let noise_var = (resid_sq / n as f64).max(NOISE_VAR_FLOOR);
            if !noise_var.is_finite() {
                return Err(Error::NonFiniteResult(format!(
                    "residual variance of node {}",
                    node
                )));
            }

            Ok(ConditionalModel::LinearGaussian {
                intercept: beta[0],
                slopes: beta[1..].to_vec(),
                noise_std: noise_var.sqrt(),
            })
        }
        ColumnType::Discrete { cardinality } => {
            let mut parent_cards = Vec::with_capacity(parents.len());
            for &p in parents {
                match data.column_types()[p] {
                    ColumnType::Discrete { cardinality } => parent_cards.push(cardinality),
                    ColumnType::Continuous => {
                        return Err(Error::InvalidParameter(format!(
                            "discrete node {} has continuous parent {}",
                            node, p
                        )));
                    }
                }
            }

            let combos: usize = parent_cards.iter().product::<usize>().max(1);
            let mut counts = vec![smoothing; combos * cardinality];
            for r in 0..n {
                let parent_values: Vec<usize> =
                    parents.iter().map(|&p| data.get(r, p) as usize).collect();
                let combo = combo_index(&parent_values, &parent_cards);
                let value = data.get(r, node) as usize;
                counts[combo * cardinality + value] += 1.0;
            }
            for row in counts.chunks_mut(cardinality) {
                let total: f64 = row.iter().sum();
                for c in row {
                    *c /= total;
                }
            }

            Ok(ConditionalModel::Table {
                cardinality,
                parent_cards,
                probs: counts,
            })
        }
    }
}

/// Fit one conditional distribution per node of `graph` against `data`.
///
/// The topological order is computed (and cached on the model) before any
/// per-node work, so a cyclic graph fails without partial fitting. Nodes
/// are then fitted in parallel; each node's conditional depends only on
/// the data, never on another node's fitted parameters.
pub fn fit(
    data: &DataMatrix,
    graph: DependencyGraph,
    config: &GraphicalFitConfig,
) -> Result<GraphicalModel> {
    if graph.n_nodes() != data.n_cols() {
        return Err(Error::ShapeMismatch(format!(
            "graph has {} nodes, data has {} columns",
            graph.n_nodes(),
            data.n_cols()
        )));
    }
    if data.n_rows() == 0 || data.n_cols() == 0 {
        return Err(Error::InvalidParameter(
            "cannot fit a graphical model to an empty data matrix".into(),
        ));
    }
    if !config.smoothing.is_finite() || config.smoothing <= 0.0 {
        return Err(Error::InvalidParameter(format!(
            "smoothing must be positive, got {}",
            config.smoothing
        )));
    }

    let order = graph.topological_order()?;

    let nodes: Vec<ConditionalModel> = (0..graph.n_nodes())
        .into_par_iter()
        .map(|node| fit_node(data, node, graph.parents(node), config.smoothing))
        .collect::<Result<Vec<_>>>()?;

    Ok(GraphicalModel {
        column_types: data.column_types().to_vec(),
        order,
        nodes,
        graph,
    })
}

impl GraphicalModel {
    pub fn n_nodes(&self) -> usize {
        self.graph.n_nodes()
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn node(&self, node: usize) -> &ConditionalModel {
        &self.nodes[node]
    }

    pub fn column_types(&self) -> &[ColumnType] {
        &self.column_types
    }

    /// Total free parameters across all conditionals.
    pub fn parameter_count(&self) -> usize {
        self.nodes.iter().map(|n| n.parameter_count()).sum()
    }

    /// Log-likelihood of `data` under the fitted conditionals: the sum
    /// over rows and nodes of each node's conditional log-density given
    /// its parents' observed values.
    pub fn log_likelihood(&self, data: &DataMatrix) -> Result<f64> {
        if data.n_cols() != self.n_nodes() {
            return Err(Error::ShapeMismatch(format!(
                "model has {} nodes, data has {} columns",
                self.n_nodes(),
                data.n_cols()
            )));
        }
        if data.column_types() != self.column_types.as_slice() {
            return Err(Error::ShapeMismatch(
                "data column types differ from the fitted model's".into(),
            ));
        }

        // Partial sums are collected in chunk order and reduced
        // sequentially, keeping the score bit-identical across runs.
        let d = data.n_cols();
        let partials: Vec<f64> = data
            .values()
            .par_chunks(d * PAR_CHUNK_ROWS)
            .map(|rows| {
                rows.chunks(d)
                    .map(|row| {
                        (0..self.n_nodes())
                            .map(|node| self.node_log_density(node, row))
                            .sum::<f64>()
                    })
                    .sum::<f64>()
            })
            .collect();
        let ll: f64 = partials.iter().sum();

        if !ll.is_finite() {
            return Err(Error::NonFiniteResult(
                "graphical-model likelihood evaluation".into(),
            ));
        }
        Ok(ll)
    }

    fn node_log_density(&self, node: usize, row: &[f64]) -> f64 {
        let parents = self.graph.parents(node);
        match &self.nodes[node] {
            ConditionalModel::LinearGaussian {
                intercept,
                slopes,
                noise_std,
            } => {
                let mut mu = *intercept;
                for (slope, &p) in slopes.iter().zip(parents) {
                    mu += slope * row[p];
                }
                normal_log_density(row[node], mu, *noise_std)
            }
            ConditionalModel::Table {
                cardinality,
                parent_cards,
                probs,
            } => {
                let parent_values: Vec<usize> =
                    parents.iter().map(|&p| row[p] as usize).collect();
                let combo = combo_index(&parent_values, parent_cards);
                probs[combo * cardinality + row[node] as usize].ln()
            }
        }
    }
}

/// Draw `n` synthetic rows by ancestral sampling: each draw walks the
/// cached topological order so parents are always sampled before their
/// children. Row `i` uses its own stream seeded `seed + i`.
pub fn sample(model: &GraphicalModel, n: usize, seed: u64) -> Result<DataMatrix> {
    let d = model.n_nodes();

    let rows: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(i as u64));
            let mut vals = vec![0.0; d];
            for &node in &model.order {
                vals[node] = sample_node(model, node, &vals, &mut rng);
            }
            vals
        })
        .collect();

    let mut values = Vec::with_capacity(n * d);
    for row in rows {
        values.extend(row);
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(Error::NonFiniteResult("graphical-model sampling".into()));
    }
    DataMatrix::new(values, n, d, model.column_types.clone())
}

fn sample_node(model: &GraphicalModel, node: usize, vals: &[f64], rng: &mut ChaCha8Rng) -> f64 {
    let parents = model.graph.parents(node);
    match &model.nodes[node] {
        ConditionalModel::LinearGaussian {
            intercept,
            slopes,
            noise_std,
        } => {
            let mut mu = *intercept;
            for (slope, &p) in slopes.iter().zip(parents) {
                mu += slope * vals[p];
            }
            let z: f64 = StandardNormal.sample(rng);
            mu + noise_std * z
        }
        ConditionalModel::Table {
            cardinality,
            parent_cards,
            probs,
        } => {
            let parent_values: Vec<usize> = parents.iter().map(|&p| vals[p] as usize).collect();
            let combo = combo_index(&parent_values, parent_cards);
            let row = &probs[combo * cardinality..(combo + 1) * cardinality];

            let u: f64 = rng.gen();
            let mut acc = 0.0;
            for (value, p) in row.iter().enumerate() {
                acc += p;
                if u < acc {
                    return value as f64;
                }
            }
            (cardinality - 1) as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Two continuous columns with B = 2A + noise.
    fn linear_pair_data(n: usize, seed: u64) -> DataMatrix {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut values = Vec::with_capacity(n * 2);
        for _ in 0..n {
            let a: f64 = StandardNormal.sample(&mut rng);
            let noise: f64 = StandardNormal.sample(&mut rng);
            values.push(a);
            values.push(2.0 * a + 0.5 * noise);
        }
        DataMatrix::continuous(values, n, 2).unwrap()
    }

    #[test]
    fn test_fit_recovers_regression_slope() {
        let data = linear_pair_data(500, 21);
        let graph = DependencyGraph::new(2, &[(0, 1)]).unwrap();
        let model = fit(&data, graph, &GraphicalFitConfig::default()).unwrap();

        match model.node(1) {
            ConditionalModel::LinearGaussian {
                intercept,
                slopes,
                noise_std,
            } => {
                assert!((slopes[0] - 2.0).abs() < 0.2, "slope off: {}", slopes[0]);
                assert!(intercept.abs() < 0.2, "intercept off: {}", intercept);
                assert!((noise_std - 0.5).abs() < 0.2, "noise off: {}", noise_std);
            }
            other => panic!("expected LinearGaussian, got {:?}", other),
        }
    }

    #[test]
    fn test_cyclic_graph_rejected_before_fitting() {
        let data = linear_pair_data(50, 2);
        let graph = DependencyGraph::new(2, &[(0, 1), (1, 0)]).unwrap();
        let err = fit(&data, graph, &GraphicalFitConfig::default()).unwrap_err();
        assert!(matches!(err, Error::CyclicGraph));
    }

    #[test]
    fn test_node_count_must_match_columns() {
        let data = linear_pair_data(50, 2);
        let graph = DependencyGraph::new(3, &[]).unwrap();
        let err = fit(&data, graph, &GraphicalFitConfig::default()).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }

    fn discrete_pair_data() -> DataMatrix {
        // A in {0, 1}, B mostly equal to A.
        let values = vec![
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0,
        ];
        DataMatrix::new(
            values,
            8,
            2,
            vec![
                ColumnType::Discrete { cardinality: 2 },
                ColumnType::Discrete { cardinality: 2 },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_cpt_counts_with_smoothing() {
        let data = discrete_pair_data();
        let graph = DependencyGraph::new(2, &[(0, 1)]).unwrap();
        let model = fit(&data, graph, &GraphicalFitConfig { smoothing: 1.0 }).unwrap();

        match model.node(1) {
            ConditionalModel::Table {
                cardinality, probs, ..
            } => {
                assert_eq!(*cardinality, 2);
                // A=0 rows: 3 of B=0, 1 of B=1, plus smoothing 1 each.
                assert_abs_diff_eq!(probs[0], 4.0 / 6.0, epsilon = 1e-12);
                assert_abs_diff_eq!(probs[1], 2.0 / 6.0, epsilon = 1e-12);
                // A=1 rows: 1 of B=0, 3 of B=1.
                assert_abs_diff_eq!(probs[2], 2.0 / 6.0, epsilon = 1e-12);
                assert_abs_diff_eq!(probs[3], 4.0 / 6.0, epsilon = 1e-12);
            }
            other => panic!("expected Table, got {:?}", other),
        }
    }

    #[test]
    fn test_unseen_values_keep_positive_probability() {
        // Cardinality 3 but only codes 0 and 1 observed.
        let data = DataMatrix::new(
            vec![0.0, 1.0, 0.0, 1.0],
            4,
            1,
            vec![ColumnType::Discrete { cardinality: 3 }],
        )
        .unwrap();
        let graph = DependencyGraph::new(1, &[]).unwrap();
        let model = fit(&data, graph, &GraphicalFitConfig { smoothing: 0.5 }).unwrap();

        match model.node(0) {
            ConditionalModel::Table { probs, .. } => {
                assert!(probs[2] > 0.0, "unseen value got zero probability");
                assert_abs_diff_eq!(probs.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
            }
            other => panic!("expected Table, got {:?}", other),
        }
    }

    #[test]
    fn test_discrete_node_with_continuous_parent_rejected() {
        let data = DataMatrix::new(
            vec![0.5, 0.0, 1.5, 1.0],
            2,
            2,
            vec![
                ColumnType::Continuous,
                ColumnType::Discrete { cardinality: 2 },
            ],
        )
        .unwrap();
        let graph = DependencyGraph::new(2, &[(0, 1)]).unwrap();
        let err = fit(&data, graph, &GraphicalFitConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_continuous_node_with_discrete_parent_allowed() {
        // Discrete parent enters the regression by its integer code.
        let mut values = Vec::new();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for i in 0..200 {
            let a = (i % 2) as f64;
            let noise: f64 = StandardNormal.sample(&mut rng);
            values.push(a);
            values.push(3.0 * a + 0.1 * noise);
        }
        let data = DataMatrix::new(
            values,
            200,
            2,
            vec![
                ColumnType::Discrete { cardinality: 2 },
                ColumnType::Continuous,
            ],
        )
        .unwrap();
        let graph = DependencyGraph::new(2, &[(0, 1)]).unwrap();
        let model = fit(&data, graph, &GraphicalFitConfig::default()).unwrap();
        match model.node(1) {
            ConditionalModel::LinearGaussian { slopes, .. } => {
                assert!((slopes[0] - 3.0).abs() < 0.2, "slope off: {}", slopes[0]);
            }
            other => panic!("expected LinearGaussian, got {:?}", other),
        }
    }

    #[test]
    fn test_sampling_reproducible_and_typed() {
        let data = discrete_pair_data();
        let graph = DependencyGraph::new(2, &[(0, 1)]).unwrap();
        let model = fit(&data, graph, &GraphicalFitConfig::default()).unwrap();

        let a = sample(&model, 100, 4).unwrap();
        let b = sample(&model, 100, 4).unwrap();
        assert_eq!(a.values(), b.values());
        let c = sample(&model, 100, 5).unwrap();
        assert_ne!(a.values(), c.values());

        for v in a.values() {
            assert!(
                *v == 0.0 || *v == 1.0,
                "sampled discrete code {} outside cardinality",
                v
            );
        }
    }

    #[test]
    fn test_sampled_rows_reproduce_dependency() {
        let data = linear_pair_data(500, 33);
        let graph = DependencyGraph::new(2, &[(0, 1)]).unwrap();
        let model = fit(&data, graph, &GraphicalFitConfig::default()).unwrap();

        let out = sample(&model, 2000, 7).unwrap();
        let a_col = out.column(0);
        let b_col = out.column(1);
        let beta = linalg::least_squares(&[a_col.as_slice()], &b_col).unwrap();
        assert!(
            (beta[1] - 2.0).abs() < 0.2,
            "regenerated slope off: {}",
            beta[1]
        );
    }

    #[test]
    fn test_log_likelihood_prefers_true_structure() {
        let data = linear_pair_data(500, 8);
        let with_edge = fit(
            &data,
            DependencyGraph::new(2, &[(0, 1)]).unwrap(),
            &GraphicalFitConfig::default(),
        )
        .unwrap();
        let without_edge = fit(
            &data,
            DependencyGraph::new(2, &[]).unwrap(),
            &GraphicalFitConfig::default(),
        )
        .unwrap();

        let ll_edge = with_edge.log_likelihood(&data).unwrap();
        let ll_empty = without_edge.log_likelihood(&data).unwrap();
        assert!(
            ll_edge > ll_empty,
            "true structure should dominate: {} vs {}",
            ll_edge,
            ll_empty
        );
    }
}
