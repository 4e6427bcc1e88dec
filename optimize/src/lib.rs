//! Dense nonlinear least squares.
//!
//! Problems implement [`LeastSquaresProblem`]; the default Jacobian is a
//! central finite difference evaluated column-parallel with rayon.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, OptimizeError>;

#[derive(Debug, thiserror::Error)]
pub enum OptimizeError {
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Non-finite residuals: {0}")]
    NonFinite(String),
}

impl From<OptimizeError> for cv_core::Error {
    fn from(e: OptimizeError) -> Self {
        match e {
            OptimizeError::DimensionMismatch(m) => cv_core::Error::DimensionMismatch(m),
            OptimizeError::NonFinite(m) => cv_core::Error::NumericFailure(m),
        }
    }
}

pub trait LeastSquaresProblem: Sync {
    fn num_params(&self) -> usize;

    fn num_residuals(&self) -> usize;

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64>;

    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        numeric_jacobian(self, params)
    }
}

/// Central-difference Jacobian, one column per parameter.
pub fn numeric_jacobian<P: LeastSquaresProblem + ?Sized>(problem: &P, params: &DVector<f64>) -> DMatrix<f64> {
    let m = problem.num_residuals();
    let n = params.len();
    let columns: Vec<DVector<f64>> = (0..n)
        .into_par_iter()
        .map(|k| {
            let h = 1e-6 * (1.0 + params[k].abs());
            let mut plus = params.clone();
            let mut minus = params.clone();
            plus[k] += h;
            minus[k] -= h;
            (problem.residuals(&plus) - problem.residuals(&minus)) / (2.0 * h)
        })
        .collect();

    let mut jac = DMatrix::zeros(m, n);
    for (k, col) in columns.iter().enumerate() {
        jac.set_column(k, col);
    }
    jac
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LMConfig {
    pub max_iters: usize,
    pub lambda: f64,
    pub tolerance: f64,
}

impl Default for LMConfig {
    fn default() -> Self {
        Self {
            max_iters: 50,
            lambda: 0.001,
            tolerance: 1e-6,
        }
    }
}

impl LMConfig {
    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LMReport {
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub converged: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    pub config: LMConfig,
}

impl LevenbergMarquardt {
    pub fn new(config: LMConfig) -> Self {
        Self { config }
    }

    /// Minimizes `0.5 * |r(x)|^2` starting from `initial`.
    pub fn minimize<P: LeastSquaresProblem + ?Sized>(
        &self,
        problem: &P,
        initial: DVector<f64>,
    ) -> Result<(DVector<f64>, LMReport)> {
        if initial.len() != problem.num_params() {
            return Err(OptimizeError::DimensionMismatch(format!(
                "expected {} parameters, got {}",
                problem.num_params(),
                initial.len()
            )));
        }

        let mut params = initial;
        let mut residuals = problem.residuals(&params);
        if residuals.len() != problem.num_residuals() {
            return Err(OptimizeError::DimensionMismatch(format!(
                "expected {} residuals, got {}",
                problem.num_residuals(),
                residuals.len()
            )));
        }
        let mut cost = residuals.norm_squared();
        if !cost.is_finite() {
            return Err(OptimizeError::NonFinite("initial residuals".into()));
        }

        let initial_cost = cost;
        let mut lambda = self.config.lambda;
        let mut converged = false;
        let mut iterations = 0;

        while iterations < self.config.max_iters {
            iterations += 1;
            let jac = problem.jacobian(&params);
            let jtj = jac.transpose() * &jac;
            let jtr = jac.transpose() * &residuals;

            if jtr.amax() < self.config.tolerance * 1e-3 {
                converged = true;
                break;
            }

            // Retry with increasing damping until the cost drops.
            let mut improved = false;
            while lambda < 1e12 {
                let mut lhs = jtj.clone();
                for i in 0..lhs.nrows() {
                    lhs[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
                }
                let Some(delta) = lhs.lu().solve(&jtr) else {
                    lambda *= 10.0;
                    continue;
                };
                let candidate = &params - &delta;
                let next_residuals = problem.residuals(&candidate);
                let next_cost = next_residuals.norm_squared();

                if next_cost.is_finite() && next_cost < cost {
                    let step = delta.norm();
                    let rel_drop = (cost - next_cost) / cost.max(1e-300);
                    params = candidate;
                    residuals = next_residuals;
                    cost = next_cost;
                    lambda = (lambda / 10.0).max(1e-12);
                    improved = true;
                    if step < self.config.tolerance * (params.norm() + self.config.tolerance)
                        || rel_drop < self.config.tolerance * 1e-3
                    {
                        converged = true;
                    }
                    break;
                }
                lambda *= 10.0;
            }

            if !improved {
                // No descent direction left at any damping.
                converged = true;
                break;
            }
            if converged {
                break;
            }
        }

        tracing::debug!(iterations, initial_cost, final_cost = cost, converged, "levenberg-marquardt finished");

        Ok((
            params,
            LMReport {
                iterations,
                initial_cost,
                final_cost: cost,
                converged,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ExpFit {
        xs: Vec<f64>,
        ys: Vec<f64>,
    }

    impl LeastSquaresProblem for ExpFit {
        fn num_params(&self) -> usize {
            2
        }

        fn num_residuals(&self) -> usize {
            self.xs.len()
        }

        fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
            DVector::from_iterator(
                self.xs.len(),
                self.xs
                    .iter()
                    .zip(&self.ys)
                    .map(|(x, y)| p[0] * (p[1] * x).exp() - y),
            )
        }
    }

    #[test]
    fn fits_exponential_curve() {
        let xs: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let ys = xs.iter().map(|x| 2.5 * (-1.3 * x).exp()).collect();
        let problem = ExpFit { xs, ys };

        let lm = LevenbergMarquardt::new(LMConfig::default().with_max_iters(100));
        let (p, report) = lm.minimize(&problem, DVector::from_vec(vec![1.0, 0.0])).unwrap();

        assert!((p[0] - 2.5).abs() < 1e-5, "a = {}", p[0]);
        assert!((p[1] + 1.3).abs() < 1e-5, "b = {}", p[1]);
        assert!(report.final_cost < report.initial_cost);
    }

    #[test]
    fn numeric_jacobian_matches_analytic() {
        let problem = ExpFit {
            xs: vec![0.5, 1.0],
            ys: vec![0.0, 0.0],
        };
        let p = DVector::from_vec(vec![2.0, 0.3]);
        let j = numeric_jacobian(&problem, &p);
        assert!((j[(1, 0)] - (0.3f64).exp()).abs() < 1e-6);
        assert!((j[(1, 1)] - 2.0 * (0.3f64).exp()).abs() < 1e-5);
    }

    #[test]
    fn rejects_wrong_parameter_count() {
        let problem = ExpFit {
            xs: vec![0.0],
            ys: vec![1.0],
        };
        let lm = LevenbergMarquardt::default();
        assert!(matches!(
            lm.minimize(&problem, DVector::from_vec(vec![1.0])),
            Err(OptimizeError::DimensionMismatch(_))
        ));
    }
}
