use super::{check_rows, check_training_set, Classifier, ModelError, Probabilities};
use crate::emotion::{Emotion, NUM_CLASSES};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

const LOG_TARGET: &str = "model::svm";
const TAU: f64 = 1e-12;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Kernel {
    Linear,
    Rbf,
}

/// RBF width. `Scale` is `1 / (dim * Var(X))` over every entry of the
/// training matrix, `Auto` is `1 / dim`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Gamma {
    Scale,
    Auto,
    Value(f64),
}

impl Gamma {
    fn resolve(self, x: &[Vec<f64>], dim: usize) -> f64 {
        match self {
            Gamma::Value(g) => g,
            Gamma::Auto => 1.0 / dim as f64,
            Gamma::Scale => {
                let count = (x.len() * dim) as f64;
                let mean = x.iter().flatten().sum::<f64>() / count;
                let var = x.iter().flatten().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
                if var > 0.0 {
                    1.0 / (dim as f64 * var)
                } else {
                    1.0
                }
            }
        }
    }
}

impl fmt::Display for Gamma {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gamma::Scale => f.write_str("scale"),
            Gamma::Auto => f.write_str("auto"),
            Gamma::Value(g) => write!(f, "{g}"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SvmParams {
    pub kernel: Kernel,
    pub c: f64,
    pub gamma: Gamma,
    /// Stopping tolerance on the maximal KKT violation.
    pub tol: f64,
    /// Optimiser steps allowed per one-vs-rest problem.
    pub max_iter: usize,
}

impl Default for SvmParams {
    fn default() -> Self {
        Self {
            kernel: Kernel::Rbf,
            c: 1.0,
            gamma: Gamma::Scale,
            tol: 1e-3,
            max_iter: 1_000_000,
        }
    }
}

impl SvmParams {
    fn validate(&self) -> Result<(), ModelError> {
        if !(self.c.is_finite() && self.c > 0.0) {
            return Err(ModelError::InvalidParams(format!("C must be positive, got {}", self.c)));
        }
        if !(self.tol.is_finite() && self.tol > 0.0) {
            return Err(ModelError::InvalidParams(format!(
                "tolerance must be positive, got {}",
                self.tol
            )));
        }
        if let Gamma::Value(g) = self.gamma {
            if !(g.is_finite() && g > 0.0) {
                return Err(ModelError::InvalidParams(format!("gamma must be positive, got {g}")));
            }
        }
        Ok(())
    }
}

impl fmt::Display for SvmParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kernel {
            Kernel::Linear => write!(f, "kernel=linear, C={}", self.c),
            Kernel::Rbf => write!(f, "kernel=rbf, C={}, gamma={}", self.c, self.gamma),
        }
    }
}

#[derive(Clone, Copy)]
struct KernelFn {
    kind: Kernel,
    gamma: f64,
}

impl KernelFn {
    fn eval(&self, a: &[f64], b: &[f64]) -> f64 {
        match self.kind {
            Kernel::Linear => a.iter().zip(b).map(|(p, q)| p * q).sum(),
            Kernel::Rbf => {
                let dist: f64 = a.iter().zip(b).map(|(p, q)| (p - q).powi(2)).sum();
                (-self.gamma * dist).exp()
            }
        }
    }
}

/// One-vs-rest machine for a single class.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Machine {
    /// Class never seen in training; it can never win.
    Absent,
    /// Every training sample belonged to this class.
    Constant,
    Trained { coef: Vec<f64>, rho: f64 },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct FittedSvm {
    dim: usize,
    gamma: f64,
    support_vectors: Vec<Vec<f64>>,
    machines: Vec<Machine>,
}

/// Multi-class C-SVC built from one binary machine per emotion.
///
/// Each binary problem is solved with SMO using second-order working set
/// selection over a precomputed Gram matrix. Probabilities are a softmax
/// of the per-class decision values.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SvmClassifier {
    params: SvmParams,
    fitted: Option<FittedSvm>,
}

impl SvmClassifier {
    pub fn new(params: SvmParams) -> Self {
        Self {
            params,
            fitted: None,
        }
    }

    pub fn params(&self) -> &SvmParams {
        &self.params
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.fitted.as_ref().map(|f| f.dim)
    }

    pub fn support_vector_count(&self) -> usize {
        self.fitted.as_ref().map_or(0, |f| f.support_vectors.len())
    }

    /// Raw one-vs-rest decision values; absent classes score `-inf`.
    pub fn decision_function(&self, x: &[Vec<f64>]) -> Result<Vec<Probabilities>, ModelError> {
        let fitted = self.fitted.as_ref().ok_or(ModelError::NotFitted)?;
        check_rows(x, fitted.dim)?;
        let kernel = KernelFn {
            kind: self.params.kernel,
            gamma: fitted.gamma,
        };
        Ok(x.iter().map(|row| fitted.decision(&kernel, row)).collect())
    }
}

impl FittedSvm {
    fn decision(&self, kernel: &KernelFn, row: &[f64]) -> Probabilities {
        let kvals: Vec<f64> = self
            .support_vectors
            .iter()
            .map(|sv| kernel.eval(sv, row))
            .collect();
        let mut out = [f64::NEG_INFINITY; NUM_CLASSES];
        for (slot, machine) in out.iter_mut().zip(&self.machines) {
            *slot = match machine {
                Machine::Absent => f64::NEG_INFINITY,
                Machine::Constant => 1.0,
                Machine::Trained { coef, rho } => {
                    coef.iter().zip(&kvals).map(|(a, k)| a * k).sum::<f64>() - rho
                }
            };
        }
        out
    }
}

fn softmax(values: &Probabilities) -> Probabilities {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return [1.0 / NUM_CLASSES as f64; NUM_CLASSES];
    }
    let mut out = [0.0; NUM_CLASSES];
    let mut total = 0.0;
    for (o, v) in out.iter_mut().zip(values) {
        *o = (v - max).exp();
        total += *o;
    }
    out.iter_mut().for_each(|o| *o /= total);
    out
}

impl Classifier for SvmClassifier {
    fn fit(&mut self, x: &[Vec<f64>], y: &[Emotion]) -> Result<(), ModelError> {
        self.params.validate()?;
        let dim = check_training_set(x, y)?;
        if dim == 0 {
            return Err(ModelError::InvalidParams("feature vectors are empty".into()));
        }

        let n = x.len();
        let gamma = self.params.gamma.resolve(x, dim);
        let kernel = KernelFn {
            kind: self.params.kernel,
            gamma,
        };
        let mut gram = vec![0.0; n * n];
        gram.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
            for (j, slot) in row.iter_mut().enumerate() {
                *slot = kernel.eval(&x[i], &x[j]);
            }
        });

        // Dense alpha_i * y_i per class; compressed to support vectors below.
        let mut dense: Vec<Option<Vec<f64>>> = Vec::with_capacity(NUM_CLASSES);
        let mut machines = Vec::with_capacity(NUM_CLASSES);
        for emotion in Emotion::ALL {
            let signs: Vec<f64> = y
                .iter()
                .map(|&label| if label == emotion { 1.0 } else { -1.0 })
                .collect();
            let positives = signs.iter().filter(|s| **s > 0.0).count();
            if positives == 0 {
                machines.push(Machine::Absent);
                dense.push(None);
            } else if positives == n {
                machines.push(Machine::Constant);
                dense.push(None);
            } else {
                let solution =
                    solve_binary(&gram, &signs, self.params.c, self.params.tol, self.params.max_iter)?;
                tracing::trace!(
                    target: LOG_TARGET,
                    emotion = %emotion,
                    iterations = solution.iterations,
                    rho = solution.rho,
                    "binary problem solved"
                );
                let coef = solution
                    .alpha
                    .iter()
                    .zip(&signs)
                    .map(|(a, s)| a * s)
                    .collect();
                machines.push(Machine::Trained {
                    coef: Vec::new(),
                    rho: solution.rho,
                });
                dense.push(Some(coef));
            }
        }

        let support: Vec<usize> = (0..n)
            .filter(|&i| dense.iter().flatten().any(|coef| coef[i] != 0.0))
            .collect();
        for (machine, solved) in machines.iter_mut().zip(&dense) {
            if let (Machine::Trained { coef, .. }, Some(full)) = (machine, solved) {
                *coef = support.iter().map(|&i| full[i]).collect();
            }
        }

        tracing::debug!(
            target: LOG_TARGET,
            samples = n,
            support_vectors = support.len(),
            gamma,
            params = %self.params,
            "svm fitted"
        );

        self.fitted = Some(FittedSvm {
            dim,
            gamma,
            support_vectors: support.iter().map(|&i| x[i].clone()).collect(),
            machines,
        });
        Ok(())
    }

    fn predict_proba(&self, x: &[Vec<f64>]) -> Result<Vec<Probabilities>, ModelError> {
        Ok(self.decision_function(x)?.iter().map(softmax).collect())
    }
}

struct BinarySolution {
    alpha: Vec<f64>,
    rho: f64,
    iterations: usize,
}

/// Dual C-SVC: minimise `0.5 a'Qa - e'a` subject to `0 <= a <= C`, `y'a = 0`.
fn solve_binary(
    gram: &[f64],
    y: &[f64],
    c: f64,
    tol: f64,
    max_iter: usize,
) -> Result<BinarySolution, ModelError> {
    let n = y.len();
    let k = |i: usize, j: usize| gram[i * n + j];
    let mut alpha = vec![0.0; n];
    let mut grad = vec![-1.0; n];
    let mut iterations = 0;

    while let Some((i, j)) = select_working_set(gram, y, &alpha, &grad, c, tol) {
        if iterations >= max_iter {
            return Err(ModelError::NotConverged { iterations });
        }
        iterations += 1;

        let (old_i, old_j) = (alpha[i], alpha[j]);
        let mut quad = k(i, i) + k(j, j) - 2.0 * k(i, j);
        if quad <= 0.0 {
            quad = TAU;
        }

        if y[i] != y[j] {
            let delta = (-grad[i] - grad[j]) / quad;
            let diff = alpha[i] - alpha[j];
            alpha[i] += delta;
            alpha[j] += delta;
            if diff > 0.0 {
                if alpha[j] < 0.0 {
                    alpha[j] = 0.0;
                    alpha[i] = diff;
                }
            } else if alpha[i] < 0.0 {
                alpha[i] = 0.0;
                alpha[j] = -diff;
            }
            if diff > 0.0 {
                if alpha[i] > c {
                    alpha[i] = c;
                    alpha[j] = c - diff;
                }
            } else if alpha[j] > c {
                alpha[j] = c;
                alpha[i] = c + diff;
            }
        } else {
            let delta = (grad[i] - grad[j]) / quad;
            let sum = alpha[i] + alpha[j];
            alpha[i] -= delta;
            alpha[j] += delta;
            if sum > c {
                if alpha[i] > c {
                    alpha[i] = c;
                    alpha[j] = sum - c;
                }
            } else if alpha[j] < 0.0 {
                alpha[j] = 0.0;
                alpha[i] = sum;
            }
            if sum > c {
                if alpha[j] > c {
                    alpha[j] = c;
                    alpha[i] = sum - c;
                }
            } else if alpha[i] < 0.0 {
                alpha[i] = 0.0;
                alpha[j] = sum;
            }
        }

        let d_i = (alpha[i] - old_i) * y[i];
        let d_j = (alpha[j] - old_j) * y[j];
        for (t, g) in grad.iter_mut().enumerate() {
            *g += y[t] * (k(t, i) * d_i + k(t, j) * d_j);
        }
    }

    Ok(BinarySolution {
        rho: compute_rho(y, &alpha, &grad, c),
        alpha,
        iterations,
    })
}

/// Maximal violating `i`, then the `j` with the best second-order gain.
/// `None` once the KKT gap drops below `tol`.
fn select_working_set(
    gram: &[f64],
    y: &[f64],
    alpha: &[f64],
    grad: &[f64],
    c: f64,
    tol: f64,
) -> Option<(usize, usize)> {
    let n = y.len();
    let mut gmax = f64::NEG_INFINITY;
    let mut i = None;
    for t in 0..n {
        let up = if y[t] > 0.0 { alpha[t] < c } else { alpha[t] > 0.0 };
        if up && -y[t] * grad[t] >= gmax {
            gmax = -y[t] * grad[t];
            i = Some(t);
        }
    }
    let i = i?;

    let mut gmax2 = f64::NEG_INFINITY;
    let mut j = None;
    let mut best_obj = f64::INFINITY;
    for t in 0..n {
        let low = if y[t] > 0.0 { alpha[t] > 0.0 } else { alpha[t] < c };
        if !low {
            continue;
        }
        let yg = y[t] * grad[t];
        gmax2 = gmax2.max(yg);
        let grad_diff = gmax + yg;
        if grad_diff > 0.0 {
            let mut quad = gram[i * n + i] + gram[t * n + t] - 2.0 * gram[i * n + t];
            if quad <= 0.0 {
                quad = TAU;
            }
            let obj = -(grad_diff * grad_diff) / quad;
            if obj <= best_obj {
                best_obj = obj;
                j = Some(t);
            }
        }
    }

    if gmax + gmax2 < tol {
        return None;
    }
    j.map(|j| (i, j))
}

fn compute_rho(y: &[f64], alpha: &[f64], grad: &[f64], c: f64) -> f64 {
    let mut upper = f64::INFINITY;
    let mut lower = f64::NEG_INFINITY;
    let mut free = 0usize;
    let mut free_sum = 0.0;
    for t in 0..y.len() {
        let yg = y[t] * grad[t];
        if alpha[t] >= c {
            if y[t] < 0.0 {
                upper = upper.min(yg);
            } else {
                lower = lower.max(yg);
            }
        } else if alpha[t] <= 0.0 {
            if y[t] > 0.0 {
                upper = upper.min(yg);
            } else {
                lower = lower.max(yg);
            }
        } else {
            free += 1;
            free_sum += yg;
        }
    }
    if free > 0 {
        free_sum / free as f64
    } else {
        (upper + lower) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_data::blobs;

    fn accuracy(model: &SvmClassifier, x: &[Vec<f64>], y: &[Emotion]) -> f64 {
        let pred = model.predict(x).unwrap();
        pred.iter().zip(y).filter(|(p, t)| p == t).count() as f64 / y.len() as f64
    }

    #[test]
    fn separates_blobs_with_rbf_and_linear() {
        let (x, y) = blobs(10, 8, &Emotion::ALL);
        for kernel in [Kernel::Rbf, Kernel::Linear] {
            let mut svm = SvmClassifier::new(SvmParams {
                kernel,
                ..SvmParams::default()
            });
            svm.fit(&x, &y).unwrap();
            assert!(accuracy(&svm, &x, &y) >= 0.95, "{kernel:?}");
            assert!(svm.support_vector_count() > 0);
        }
    }

    #[test]
    fn probabilities_sum_to_one_and_follow_decision() {
        let (x, y) = blobs(10, 8, &Emotion::ALL);
        let mut svm = SvmClassifier::new(SvmParams::default());
        svm.fit(&x, &y).unwrap();
        let decisions = svm.decision_function(&x).unwrap();
        for (probs, dec) in svm.predict_proba(&x).unwrap().iter().zip(&decisions) {
            let total: f64 = probs.iter().sum();
            assert!((total - 1.0).abs() < 1e-9);
            assert_eq!(super::super::argmax_class(probs), super::super::argmax_class(dec));
        }
    }

    #[test]
    fn absent_class_is_never_predicted() {
        let classes = [Emotion::Neutral, Emotion::Happy, Emotion::Angry];
        let (x, y) = blobs(12, 6, &classes);
        let mut svm = SvmClassifier::new(SvmParams::default());
        svm.fit(&x, &y).unwrap();
        for probs in svm.predict_proba(&x).unwrap() {
            assert_eq!(probs[Emotion::Sad.index()], 0.0);
            assert_eq!(probs[Emotion::Surprised.index()], 0.0);
        }
        assert!(svm.predict(&x).unwrap().iter().all(|p| classes.contains(p)));
    }

    #[test]
    fn iteration_cap_reports_non_convergence() {
        let (x, y) = blobs(10, 8, &Emotion::ALL);
        let mut svm = SvmClassifier::new(SvmParams {
            max_iter: 1,
            ..SvmParams::default()
        });
        assert!(matches!(
            svm.fit(&x, &y),
            Err(ModelError::NotConverged { iterations: 1 })
        ));
        assert!(!svm.is_fitted());
    }

    #[test]
    fn rejects_bad_hyperparameters() {
        let (x, y) = blobs(3, 4, &Emotion::ALL);
        let mut svm = SvmClassifier::new(SvmParams {
            c: 0.0,
            ..SvmParams::default()
        });
        assert!(matches!(svm.fit(&x, &y), Err(ModelError::InvalidParams(_))));
    }

    #[test]
    fn fit_is_deterministic_and_serialises() {
        let (x, y) = blobs(8, 8, &Emotion::ALL);
        let mut a = SvmClassifier::new(SvmParams {
            gamma: Gamma::Value(0.05),
            c: 10.0,
            ..SvmParams::default()
        });
        let mut b = a.clone();
        a.fit(&x, &y).unwrap();
        b.fit(&x, &y).unwrap();
        assert_eq!(a, b);

        let json = serde_json::to_string(&a).unwrap();
        let back: SvmClassifier = serde_json::from_str(&json).unwrap();
        assert_eq!(a.predict_proba(&x).unwrap(), back.predict_proba(&x).unwrap());
    }

    #[test]
    fn wrong_width_is_rejected_at_predict() {
        let (x, y) = blobs(5, 8, &Emotion::ALL);
        let mut svm = SvmClassifier::new(SvmParams::default());
        svm.fit(&x, &y).unwrap();
        assert_eq!(
            svm.predict(&[vec![0.0; 3]]).unwrap_err(),
            ModelError::DimensionMismatch {
                expected: 8,
                found: 3
            }
        );
    }

    #[test]
    fn scale_gamma_uses_overall_variance() {
        let x = vec![vec![0.0, 2.0], vec![2.0, 0.0]];
        // mean 1, variance 1, two features
        assert!((Gamma::Scale.resolve(&x, 2) - 0.5).abs() < 1e-12);
        assert_eq!(Gamma::Auto.resolve(&x, 2), 0.5);
    }
}
