//! Limited memory BFGS over a flat parameter vector.
//!
//! The optimizer never sees tensors, it is handed the pixels of the working
//! image and an evaluation closure that computes the loss and its gradient at
//! the current pixels. The closure may be called several times per `step`, and
//! is allowed to modify the parameters it is handed (eg. clamp them) before
//! evaluating them.

use crate::Error;
use std::collections::VecDeque;

/// Minimum curvature `y.s` for a step to be added to the history
const CURVATURE_EPSILON: f64 = 1e-10;
/// Sufficient decrease constant of the Armijo condition
const ARMIJO_C1: f64 = 1e-4;
/// Maximum number of step halvings per iteration when backtracking
const MAX_BACKTRACKS: usize = 10;

/// The loss and the gradient of the loss at a set of parameters
#[derive(Clone, Debug)]
pub struct Evaluation {
    pub loss: f64,
    pub gradient: Vec<f32>,
}

/// How far along the search direction each iteration moves
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LineSearch {
    /// Always take the step of length `lr`
    None,
    /// Halve the step until the loss decreases sufficiently, and stay put if
    /// no such step is found
    Backtracking,
}

#[derive(Clone, Debug)]
pub struct LbfgsConfig {
    /// Step length
    pub lr: f64,
    /// Maximum iterations per `step`
    pub max_iter: usize,
    /// Maximum evaluations per `step`
    pub max_eval: usize,
    /// A `step` stops once every gradient component is at most this large
    pub tolerance_grad: f64,
    /// A `step` stops once the loss or the parameters change by less than this
    pub tolerance_change: f64,
    /// Number of curvature pairs kept to approximate the inverse hessian
    pub history_size: usize,
    pub line_search: LineSearch,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            lr: 1.0,
            max_iter: 20,
            max_eval: 25,
            tolerance_grad: 1e-7,
            tolerance_change: 1e-9,
            history_size: 100,
            line_search: LineSearch::None,
        }
    }
}

/// The outcome of a single `Lbfgs::step`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepStatus {
    /// The parameters moved, or may still move on the next step
    Progressed,
    /// The gradient vanished, further steps won't change the parameters
    Converged,
}

#[derive(Default)]
struct State {
    n_iter: usize,
    func_evals: usize,
    direction: Vec<f32>,
    // The displacement of the parameters in the last iteration
    last_step: Vec<f32>,
    old_dirs: VecDeque<Vec<f32>>,
    old_steps: VecDeque<Vec<f32>>,
    ro: VecDeque<f64>,
    h_diag: f64,
    prev_flat_grad: Vec<f32>,
}

pub struct Lbfgs {
    config: LbfgsConfig,
    state: State,
}

impl Lbfgs {
    pub fn new(config: LbfgsConfig) -> Self {
        Self {
            config,
            state: State::default(),
        }
    }

    /// The total number of times the closure has been evaluated
    pub fn func_evals(&self) -> usize {
        self.state.func_evals
    }

    /// Performs up to `max_iter` iterations, the curvature history carries
    /// over between calls
    pub fn step<F>(&mut self, params: &mut [f32], mut closure: F) -> Result<StepStatus, Error>
    where
        F: FnMut(&mut [f32]) -> Result<Evaluation, Error>,
    {
        let cfg = &self.config;
        let state = &mut self.state;

        let Evaluation {
            mut loss,
            gradient: mut flat_grad,
        } = closure(params)?;
        let mut current_evals = 1;
        state.func_evals += 1;

        if max_abs(&flat_grad) <= cfg.tolerance_grad {
            return Ok(StepStatus::Converged);
        }

        let mut n_iter = 0;
        while n_iter < cfg.max_iter {
            n_iter += 1;
            state.n_iter += 1;

            if state.n_iter == 1 {
                state.direction = flat_grad.iter().map(|g| -g).collect();
                state.old_dirs.clear();
                state.old_steps.clear();
                state.ro.clear();
                state.h_diag = 1.0;
            } else {
                let y: Vec<f32> = flat_grad
                    .iter()
                    .zip(state.prev_flat_grad.iter())
                    .map(|(g, p)| g - p)
                    .collect();
                let s = std::mem::take(&mut state.last_step);
                let ys = dot(&y, &s);

                if ys > CURVATURE_EPSILON {
                    if state.old_dirs.len() == cfg.history_size {
                        state.old_dirs.pop_front();
                        state.old_steps.pop_front();
                        state.ro.pop_front();
                    }

                    state.h_diag = ys / dot(&y, &y);
                    state.old_dirs.push_back(y);
                    state.old_steps.push_back(s);
                    state.ro.push_back(1.0 / ys);
                }

                state.direction = two_loop(state, &flat_grad);
            }

            state.prev_flat_grad.clone_from(&flat_grad);
            let prev_loss = loss;

            let mut t = if state.n_iter == 1 {
                (1.0f64).min(1.0 / abs_sum(&flat_grad)) * cfg.lr
            } else {
                cfg.lr
            };

            let gtd = dot(&flat_grad, &state.direction);
            if gtd > -cfg.tolerance_change {
                break;
            }

            let start = params.to_vec();
            let mut ls_evals = 0;

            match cfg.line_search {
                LineSearch::None => {
                    axpy(params, t, &state.direction);

                    if n_iter != cfg.max_iter {
                        let eval = closure(params)?;
                        loss = eval.loss;
                        flat_grad = eval.gradient;
                        ls_evals = 1;
                    }
                }
                LineSearch::Backtracking => {
                    let mut accepted = false;

                    for _ in 0..MAX_BACKTRACKS {
                        params.copy_from_slice(&start);
                        axpy(params, t, &state.direction);

                        let eval = closure(params)?;
                        ls_evals += 1;

                        if eval.loss <= prev_loss + ARMIJO_C1 * t * gtd {
                            loss = eval.loss;
                            flat_grad = eval.gradient;
                            accepted = true;
                            break;
                        }

                        if current_evals + ls_evals >= cfg.max_eval {
                            break;
                        }

                        t *= 0.5;
                    }

                    if !accepted {
                        tracing::debug!(evals = ls_evals, "line search found no descent");

                        params.copy_from_slice(&start);
                        state.func_evals += ls_evals;
                        state.last_step = vec![0.0; start.len()];
                        break;
                    }
                }
            }

            current_evals += ls_evals;
            state.func_evals += ls_evals;

            // Measured after the closure had a chance to modify the
            // parameters, so the history stays consistent with clamping
            state.last_step = params
                .iter()
                .zip(start.iter())
                .map(|(p, s)| p - s)
                .collect();

            if n_iter == cfg.max_iter || current_evals >= cfg.max_eval {
                break;
            }

            if ls_evals > 0 && max_abs(&flat_grad) <= cfg.tolerance_grad {
                return Ok(StepStatus::Converged);
            }

            if max_abs(&state.last_step) <= cfg.tolerance_change {
                break;
            }

            if (loss - prev_loss).abs() < cfg.tolerance_change {
                break;
            }
        }

        Ok(StepStatus::Progressed)
    }
}

// Approximates `-H * grad` from the curvature history
fn two_loop(state: &State, flat_grad: &[f32]) -> Vec<f32> {
    let num_old = state.old_dirs.len();
    let mut al = vec![0.0f64; num_old];

    let mut q: Vec<f32> = flat_grad.iter().map(|g| -g).collect();
    for i in (0..num_old).rev() {
        al[i] = dot(&state.old_steps[i], &q) * state.ro[i];
        axpy(&mut q, -al[i], &state.old_dirs[i]);
    }

    let mut r: Vec<f32> = q.iter().map(|v| (f64::from(*v) * state.h_diag) as f32).collect();
    for i in 0..num_old {
        let be_i = dot(&state.old_dirs[i], &r) * state.ro[i];
        axpy(&mut r, al[i] - be_i, &state.old_steps[i]);
    }

    r
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}

// y += alpha * x
fn axpy(y: &mut [f32], alpha: f64, x: &[f32]) {
    for (y, x) in y.iter_mut().zip(x.iter()) {
        *y = (f64::from(*y) + alpha * f64::from(*x)) as f32;
    }
}

fn abs_sum(a: &[f32]) -> f64 {
    a.iter().map(|v| f64::from(v.abs())).sum()
}

fn max_abs(a: &[f32]) -> f64 {
    a.iter().fold(0.0f64, |m, v| m.max(f64::from(v.abs())))
}

#[cfg(test)]
mod test {
    use super::*;

    // f(x) = sum_i w_i * (x_i - c_i)^2
    fn quadratic(params: &[f32]) -> Evaluation {
        let weights = [1.0f64, 10.0, 0.5, 3.0];
        let centers = [0.25f64, -0.5, 2.0, 1.0];

        let mut loss = 0.0;
        let mut gradient = Vec::with_capacity(params.len());
        for (i, p) in params.iter().enumerate() {
            let d = f64::from(*p) - centers[i];
            loss += weights[i] * d * d;
            gradient.push((2.0 * weights[i] * d) as f32);
        }

        Evaluation { loss, gradient }
    }

    #[test]
    fn minimizes_a_quadratic() {
        let mut params = vec![0.0f32; 4];
        let mut lbfgs = Lbfgs::new(LbfgsConfig::default());

        for _ in 0..5 {
            if lbfgs.step(&mut params, |p| Ok(quadratic(p))).unwrap() == StepStatus::Converged {
                break;
            }
        }

        let expected = [0.25, -0.5, 2.0, 1.0];
        for (p, e) in params.iter().zip(expected.iter()) {
            assert!((p - e).abs() < 1e-3, "{:?}", params);
        }
    }

    #[test]
    fn backtracking_never_increases_the_loss() {
        let mut params = vec![3.0f32, 3.0, -3.0, 0.0];
        let mut lbfgs = Lbfgs::new(LbfgsConfig {
            lr: 4.0,
            line_search: LineSearch::Backtracking,
            ..LbfgsConfig::default()
        });

        let mut losses = Vec::new();
        lbfgs
            .step(&mut params, |p| {
                let eval = quadratic(p);
                losses.push(eval.loss);
                Ok(eval)
            })
            .unwrap();

        let final_loss = quadratic(&params).loss;
        assert!(final_loss < losses[0]);
        assert!(losses.iter().all(|l| *l >= final_loss - 1e-9));
    }

    #[test]
    fn respects_evaluation_budget() {
        let mut params = vec![0.0f32; 4];
        let mut lbfgs = Lbfgs::new(LbfgsConfig {
            max_iter: 3,
            ..LbfgsConfig::default()
        });

        let mut evals = 0;
        lbfgs
            .step(&mut params, |p| {
                evals += 1;
                Ok(quadratic(p))
            })
            .unwrap();

        // the initial evaluation, plus one per iteration except the last
        assert_eq!(evals, 3);
        assert_eq!(lbfgs.func_evals(), 3);
    }

    #[test]
    fn clamping_closure_is_respected() {
        let mut params = vec![0.5f32; 4];
        let mut lbfgs = Lbfgs::new(LbfgsConfig::default());

        let mut losses = Vec::new();
        for _ in 0..3 {
            lbfgs
                .step(&mut params, |p| {
                    for v in p.iter_mut() {
                        *v = v.max(0.0).min(1.0);
                    }
                    assert!(p.iter().all(|v| (0.0..=1.0).contains(v)));

                    let eval = quadratic(p);
                    losses.push(eval.loss);
                    Ok(eval)
                })
                .unwrap();
        }

        let best = losses.iter().cloned().fold(f64::INFINITY, f64::min);
        assert!(best < losses[0]);
    }

    #[test]
    fn errors_propagate() {
        let mut params = vec![0.0f32; 4];
        let mut lbfgs = Lbfgs::new(LbfgsConfig::default());

        let result = lbfgs.step(&mut params, |_| Err(Error::NoLossTaps));
        assert!(matches!(result, Err(Error::NoLossTaps)));
    }
}
