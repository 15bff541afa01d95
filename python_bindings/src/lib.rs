use ndarray::Array2;
use numpy::{IntoPyArray, PyArray1, PyArray2, PyReadonlyArray2};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyList;
use tabsynth_core::bayesnet::{self, GraphicalFitConfig};
use tabsynth_core::data::{ColumnType, DataMatrix};
use tabsynth_core::error::Error;
use tabsynth_core::graph::DependencyGraph;
use tabsynth_core::mixture::{self, MixtureFitConfig};
use tabsynth_core::overlap;
use tabsynth_core::score::{self, ScoreConfig};

fn to_py(err: Error) -> PyErr {
    PyValueError::new_err(err.to_string())
}

/// Column tags as they cross the boundary: 0 marks a continuous column,
/// a positive integer marks a discrete column with that cardinality.
fn parse_column_types(tags: Option<Vec<i64>>, n_cols: usize) -> PyResult<Vec<ColumnType>> {
    match tags {
        None => Ok(vec![ColumnType::Continuous; n_cols]),
        Some(tags) => {
            if tags.len() != n_cols {
                return Err(PyValueError::new_err(format!(
                    "{} column types for {} columns",
                    tags.len(),
                    n_cols
                )));
            }
            tags.iter()
                .map(|&t| match t {
                    0 => Ok(ColumnType::Continuous),
                    c if c > 0 => Ok(ColumnType::Discrete {
                        cardinality: c as usize,
                    }),
                    c => Err(PyValueError::new_err(format!(
                        "column type tag {} is negative",
                        c
                    ))),
                })
                .collect()
        }
    }
}

/// Copy a numpy array into the core's owned representation, validating
/// shape and column coding before any fitting routine runs.
fn extract_matrix(
    data: &PyReadonlyArray2<'_, f64>,
    tags: Option<Vec<i64>>,
) -> PyResult<DataMatrix> {
    let arr = data.as_array();
    let (n_rows, n_cols) = arr.dim();
    let types = parse_column_types(tags, n_cols)?;
    let values: Vec<f64> = arr.iter().copied().collect();
    DataMatrix::new(values, n_rows, n_cols, types).map_err(to_py)
}

fn matrix_to_numpy<'py>(py: Python<'py>, m: &DataMatrix) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let arr = Array2::from_shape_vec((m.n_rows(), m.n_cols()), m.values().to_vec())
        .map_err(|e| PyValueError::new_err(e.to_string()))?;
    Ok(arr.into_pyarray(py))
}

/// Opaque handle to a fitted Gaussian mixture. Immutable: refitting
/// produces a new handle, and accessors copy parameters out.
#[pyclass(frozen)]
struct MixtureModel {
    inner: mixture::MixtureModel,
}

#[pymethods]
impl MixtureModel {
    #[getter]
    fn n_components(&self) -> usize {
        self.inner.components.len()
    }

    #[getter]
    fn dim(&self) -> usize {
        self.inner.dim
    }

    #[getter]
    fn log_likelihood(&self) -> f64 {
        self.inner.log_likelihood
    }

    #[getter]
    fn n_iterations(&self) -> usize {
        self.inner.iterations
    }

    fn log_likelihood_trace<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray1<f64>> {
        PyArray1::from_vec(py, self.inner.log_likelihood_trace.clone())
    }

    fn weights(&self) -> Vec<f64> {
        self.inner.components.iter().map(|c| c.weight).collect()
    }

    fn means<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray2<f64>> {
        let k = self.inner.components.len();
        let d = self.inner.dim;
        let mut arr = Array2::<f64>::zeros((k, d));
        for (j, c) in self.inner.components.iter().enumerate() {
            for (a, v) in c.mean.iter().enumerate() {
                arr[[j, a]] = *v;
            }
        }
        arr.into_pyarray(py)
    }

    fn covariances<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyList>> {
        let d = self.inner.dim;
        let mut covs = Vec::with_capacity(self.inner.components.len());
        for c in &self.inner.components {
            let arr = Array2::from_shape_vec((d, d), c.cov.clone())
                .map_err(|e| PyValueError::new_err(e.to_string()))?;
            covs.push(arr.into_pyarray(py));
        }
        PyList::new(py, covs)
    }

    fn __repr__(&self) -> String {
        format!(
            "tabsynth MixtureModel ({} components × {} dims, log-likelihood {:.4}, {} iterations)",
            self.inner.components.len(),
            self.inner.dim,
            self.inner.log_likelihood,
            self.inner.iterations
        )
    }
}

/// Opaque handle to a fitted graphical model.
#[pyclass(frozen)]
struct GraphicalModel {
    inner: bayesnet::GraphicalModel,
}

#[pymethods]
impl GraphicalModel {
    #[getter]
    fn n_nodes(&self) -> usize {
        self.inner.n_nodes()
    }

    #[getter]
    fn parameter_count(&self) -> usize {
        self.inner.parameter_count()
    }

    fn edges(&self) -> Vec<(usize, usize)> {
        self.inner.graph().edges()
    }

    fn column_types(&self) -> Vec<i64> {
        self.inner
            .column_types()
            .iter()
            .map(|t| match t {
                ColumnType::Continuous => 0,
                ColumnType::Discrete { cardinality } => *cardinality as i64,
            })
            .collect()
    }

    fn __repr__(&self) -> String {
        format!(
            "tabsynth GraphicalModel ({} nodes, {} edges, {} free parameters)",
            self.inner.n_nodes(),
            self.inner.graph().edges().len(),
            self.inner.parameter_count()
        )
    }
}

#[pyfunction]
#[pyo3(signature = (data, k, tolerance=1e-6, max_iterations=200, seed=42, column_types=None))]
fn fit_mixture(
    py: Python<'_>,
    data: PyReadonlyArray2<'_, f64>,
    k: usize,
    tolerance: f64,
    max_iterations: usize,
    seed: u64,
    column_types: Option<Vec<i64>>,
) -> PyResult<MixtureModel> {
    let matrix = extract_matrix(&data, column_types)?;
    let config = MixtureFitConfig {
        n_components: k,
        tolerance,
        max_iterations,
        seed,
    };
    let inner = py
        .allow_threads(|| mixture::fit(&matrix, &config))
        .map_err(to_py)?;
    Ok(MixtureModel { inner })
}

#[pyfunction]
#[pyo3(signature = (model, n, seed=42))]
fn sample_mixture<'py>(
    py: Python<'py>,
    model: &MixtureModel,
    n: usize,
    seed: u64,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let out = py
        .allow_threads(|| mixture::sample(&model.inner, n, seed))
        .map_err(to_py)?;
    matrix_to_numpy(py, &out)
}

#[pyfunction]
#[pyo3(signature = (data, edges, column_types=None, smoothing=1.0))]
fn fit_graphical_model(
    py: Python<'_>,
    data: PyReadonlyArray2<'_, f64>,
    edges: Vec<(usize, usize)>,
    column_types: Option<Vec<i64>>,
    smoothing: f64,
) -> PyResult<GraphicalModel> {
    let matrix = extract_matrix(&data, column_types)?;
    let graph = DependencyGraph::new(matrix.n_cols(), &edges).map_err(to_py)?;
    let config = GraphicalFitConfig { smoothing };
    let inner = py
        .allow_threads(|| bayesnet::fit(&matrix, graph, &config))
        .map_err(to_py)?;
    Ok(GraphicalModel { inner })
}

#[pyfunction]
#[pyo3(signature = (model, n, seed=42))]
fn sample_graphical_model<'py>(
    py: Python<'py>,
    model: &GraphicalModel,
    n: usize,
    seed: u64,
) -> PyResult<Bound<'py, PyArray2<f64>>> {
    let out = py
        .allow_threads(|| bayesnet::sample(&model.inner, n, seed))
        .map_err(to_py)?;
    matrix_to_numpy(py, &out)
}

#[pyfunction]
#[pyo3(signature = (data, edges, penalty_weight=1.0, smoothing=1.0, column_types=None))]
fn score_structure(
    py: Python<'_>,
    data: PyReadonlyArray2<'_, f64>,
    edges: Vec<(usize, usize)>,
    penalty_weight: f64,
    smoothing: f64,
    column_types: Option<Vec<i64>>,
) -> PyResult<f64> {
    let matrix = extract_matrix(&data, column_types)?;
    let graph = DependencyGraph::new(matrix.n_cols(), &edges).map_err(to_py)?;
    let config = ScoreConfig {
        penalty_weight,
        smoothing,
    };
    py.allow_threads(|| score::score_structure(&matrix, &graph, &config))
        .map_err(to_py)
}

/// Pairwise component overlap rates for an externally-supplied mixture
/// parameterization (weights, per-component means, per-component square
/// covariance matrices).
#[pyfunction]
#[pyo3(name = "overlap_rate")]
fn overlap_rate_wrapper(
    py: Python<'_>,
    weights: Vec<f64>,
    means: Vec<Vec<f64>>,
    covariances: Vec<Vec<Vec<f64>>>,
) -> PyResult<Vec<f64>> {
    let mut covs = Vec::with_capacity(covariances.len());
    for (c, cov) in covariances.into_iter().enumerate() {
        let d = cov.len();
        let mut flat = Vec::with_capacity(d * d);
        for row in &cov {
            if row.len() != d {
                return Err(PyValueError::new_err(format!(
                    "covariance {} is not square",
                    c
                )));
            }
            flat.extend_from_slice(row);
        }
        covs.push(flat);
    }
    py.allow_threads(|| overlap::overlap_rates(&weights, &means, &covs))
        .map_err(to_py)
}

#[pymodule]
fn tabsynth(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<MixtureModel>()?;
    m.add_class::<GraphicalModel>()?;
    m.add_function(wrap_pyfunction!(fit_mixture, m)?)?;
    m.add_function(wrap_pyfunction!(sample_mixture, m)?)?;
    m.add_function(wrap_pyfunction!(fit_graphical_model, m)?)?;
    m.add_function(wrap_pyfunction!(sample_graphical_model, m)?)?;
    m.add_function(wrap_pyfunction!(score_structure, m)?)?;
    m.add_function(wrap_pyfunction!(overlap_rate_wrapper, m)?)?;
    Ok(())
}
