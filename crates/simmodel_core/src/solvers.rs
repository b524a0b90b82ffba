//! Variable-order BDF integrator (orders 1 to 5) with Newton iteration on `I - c J`.
//!
//! The history is kept in backward-difference form `D` and rescaled whenever the step
//! size changes. Forward sensitivities are propagated in staggered fashion: once the
//! state step is accepted, every sensitivity block is solved with the same iteration
//! matrix. Sensitivities do not take part in the error test.

use log::debug;
use nalgebra::DMatrix;
use num_traits::Float;
use thiserror::Error;

use crate::linalg::LinearSolver;
use crate::options::SolverProperties;
use crate::traits::OdeSystem;

const MAX_ORDER: usize = 5;
const NEWTON_MAXITER: usize = 4;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;
const MAX_CONVERGENCE_FAILURES: usize = 10;
const MAX_ERROR_TEST_FAILURES: usize = 7;

#[derive(Debug, Error)]
pub enum IntegratorError {
    #[error("Newton iteration failed to converge repeatedly at t={time} (h={step:e})")]
    ConvergenceFailure { time: f64, step: f64 },

    #[error("Error test failed repeatedly at t={time} (h={step:e})")]
    ErrorTestFailure { time: f64, step: f64 },

    #[error("Step size too small at t={time}: h={step:e}")]
    StepTooSmall { time: f64, step: f64 },

    #[error("Too much work: {steps} internal steps taken before reaching t={target} (t={time})")]
    TooMuchWork { time: f64, target: f64, steps: usize },

    #[error("Iteration matrix is singular at t={time}")]
    SingularMatrix { time: f64 },

    #[error("Right-hand side evaluation failed at t={time}: {source}")]
    RhsFailure {
        time: f64,
        #[source]
        source: anyhow::Error,
    },
}

impl IntegratorError {
    pub fn time(&self) -> f64 {
        match self {
            IntegratorError::ConvergenceFailure { time, .. }
            | IntegratorError::ErrorTestFailure { time, .. }
            | IntegratorError::StepTooSmall { time, .. }
            | IntegratorError::TooMuchWork { time, .. }
            | IntegratorError::SingularMatrix { time }
            | IntegratorError::RhsFailure { time, .. } => *time,
        }
    }

    /// Convergence and error-test failures, the kinds tighter tolerances may cure.
    pub fn is_tolerance_reducible(&self) -> bool {
        matches!(
            self,
            IntegratorError::ConvergenceFailure { .. } | IntegratorError::ErrorTestFailure { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegratorStats {
    pub steps: usize,
    pub rhs_evaluations: usize,
    pub jacobian_evaluations: usize,
    pub factorizations: usize,
}

fn gamma(order: usize) -> f64 {
    (1..=order).map(|j| 1.0 / j as f64).sum()
}

fn error_const(order: usize) -> f64 {
    1.0 / (order as f64 + 1.0)
}

fn weighted_rms<T: Float>(values: &[T], scale: &[T]) -> T {
    if values.is_empty() {
        return T::zero();
    }
    let sum = values
        .iter()
        .zip(scale)
        .fold(T::zero(), |acc, (&v, &s)| acc + (v / s) * (v / s));
    (sum / T::from(values.len()).unwrap_or_else(T::one)).sqrt()
}

fn compute_r(order: usize, factor: f64) -> DMatrix<f64> {
    let mut m = DMatrix::zeros(order + 1, order + 1);
    for j in 0..=order {
        m[(0, j)] = 1.0;
    }
    for i in 1..=order {
        for j in 1..=order {
            m[(i, j)] = (i as f64 - 1.0 - factor * j as f64) / i as f64;
        }
    }
    for i in 1..=order {
        for j in 0..=order {
            m[(i, j)] *= m[(i - 1, j)];
        }
    }
    m
}

/// Rescales the difference array for a step size multiplied by `factor`.
fn change_d(d: &mut [Vec<f64>], order: usize, factor: f64) {
    let ru = compute_r(order, factor) * compute_r(order, 1.0);
    let old: Vec<Vec<f64>> = d[..=order].to_vec();
    for (i, row) in d.iter_mut().enumerate().take(order + 1) {
        for (col, value) in row.iter_mut().enumerate() {
            *value = (0..=order).map(|k| ru[(k, i)] * old[k][col]).sum();
        }
    }
}

fn eval_rhs<S: OdeSystem + ?Sized>(
    system: &mut S,
    stats: &mut IntegratorStats,
    t: f64,
    y: &[f64],
    f: &mut [f64],
) -> Result<(), IntegratorError> {
    stats.rhs_evaluations += 1;
    system
        .rhs(t, y, f)
        .map_err(|source| IntegratorError::RhsFailure { time: t, source })
}

struct NewtonOutcome {
    converged: bool,
    iterations: usize,
    y: Vec<f64>,
    d: Vec<f64>,
}

/// Simplified Newton iteration for `y - c f(y) = psi + y_predict`, solved block-wise.
#[allow(clippy::too_many_arguments)]
fn newton_solve(
    linear: &LinearSolver,
    block: usize,
    time: f64,
    y_predict: &[f64],
    c: f64,
    psi: &[f64],
    scale: &[f64],
    tol: f64,
    mut eval: impl FnMut(&[f64], &mut [f64]) -> Result<(), IntegratorError>,
) -> Result<NewtonOutcome, IntegratorError> {
    let len = y_predict.len();
    let mut y = y_predict.to_vec();
    let mut d = vec![0.0; len];
    let mut f = vec![0.0; len];
    let mut dy = vec![0.0; len];
    let mut dy_norm_old: Option<f64> = None;
    let mut iterations = 0;

    for k in 0..NEWTON_MAXITER {
        iterations = k + 1;
        eval(&y, &mut f)?;
        if f.iter().any(|v| !v.is_finite()) {
            break;
        }
        for i in 0..len {
            dy[i] = c * f[i] - psi[i] - d[i];
        }
        if block > 0 {
            for chunk in dy.chunks_mut(block) {
                linear
                    .solve_in_place(chunk)
                    .map_err(|_| IntegratorError::SingularMatrix { time })?;
            }
        }
        let dy_norm = weighted_rms(&dy, scale);
        let rate = dy_norm_old.map(|old| dy_norm / old);
        if let Some(rate) = rate {
            if rate >= 1.0
                || rate.powi((NEWTON_MAXITER - k) as i32) / (1.0 - rate) * dy_norm > tol
            {
                break;
            }
        }
        for i in 0..len {
            y[i] += dy[i];
            d[i] += dy[i];
        }
        if dy_norm == 0.0 || rate.is_some_and(|r| r / (1.0 - r) * dy_norm < tol) {
            return Ok(NewtonOutcome {
                converged: true,
                iterations,
                y,
                d,
            });
        }
        dy_norm_old = Some(dy_norm);
    }

    Ok(NewtonOutcome {
        converged: false,
        iterations,
        y,
        d,
    })
}

/// Stiff integrator over an [`OdeSystem`], advanced between output times with
/// [`BdfIntegrator::step_to`].
pub struct BdfIntegrator {
    n: usize,
    sensitivity_count: usize,
    props: SolverProperties,
    newton_tol: f64,
    t: f64,
    order: usize,
    h_abs: f64,
    n_equal_steps: usize,
    /// Backward differences, `MAX_ORDER + 3` rows over state then sensitivity columns.
    d: Vec<Vec<f64>>,
    linear: LinearSolver,
    factored_c: Option<f64>,
    last_factorization_failed: bool,
    stats: IntegratorStats,
}

impl BdfIntegrator {
    /// Creates the integrator and performs the initial cold start at `t0`.
    /// `s0` holds `sensitivity_count()` blocks of initial sensitivities.
    pub fn new<S: OdeSystem + ?Sized>(
        system: &mut S,
        linear: LinearSolver,
        props: SolverProperties,
        t0: f64,
        y0: &[f64],
        s0: &[f64],
    ) -> Result<Self, IntegratorError> {
        let n = system.dimension();
        let sensitivity_count = system.sensitivity_count();
        let mut integrator = Self {
            n,
            sensitivity_count,
            props,
            newton_tol: (10.0 * f64::EPSILON / props.rel_tol).max(0.03.min(props.rel_tol.sqrt())),
            t: t0,
            order: 1,
            h_abs: 0.0,
            n_equal_steps: 0,
            d: vec![vec![0.0; n * (1 + sensitivity_count)]; MAX_ORDER + 3],
            linear,
            factored_c: None,
            last_factorization_failed: false,
            stats: IntegratorStats::default(),
        };
        integrator.reinit(system, t0, y0, s0)?;
        Ok(integrator)
    }

    pub fn time(&self) -> f64 {
        self.t
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn step_size(&self) -> f64 {
        self.h_abs
    }

    pub fn state(&self) -> &[f64] {
        &self.d[0][..self.n]
    }

    /// Current sensitivities, parameter-major blocks of `dimension` values.
    pub fn sensitivities(&self) -> &[f64] {
        &self.d[0][self.n..]
    }

    pub fn stats(&self) -> IntegratorStats {
        self.stats
    }

    fn max_step(&self) -> f64 {
        if self.props.h_max > 0.0 {
            self.props.h_max
        } else {
            f64::INFINITY
        }
    }

    /// Cold restart: discards the history and restarts at order 1 from the given state.
    pub fn reinit<S: OdeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t0: f64,
        y0: &[f64],
        s0: &[f64],
    ) -> Result<(), IntegratorError> {
        let n = self.n;
        let total = n * (1 + self.sensitivity_count);
        self.t = t0;
        self.order = 1;
        self.n_equal_steps = 0;
        for row in &mut self.d {
            row.iter_mut().for_each(|v| *v = 0.0);
        }
        self.d[0][..n].copy_from_slice(&y0[..n]);
        self.d[0][n..total].copy_from_slice(&s0[..total - n]);

        let mut f0 = vec![0.0; n];
        eval_rhs(system, &mut self.stats, t0, y0, &mut f0)?;
        let h = if self.props.h0 > 0.0 {
            self.props.h0
        } else {
            self.select_initial_step(system, t0, y0, &f0)?
        };
        self.h_abs = h.min(self.max_step());

        for (slot, &rate) in self.d[1][..n].iter_mut().zip(&f0) {
            *slot = rate * self.h_abs;
        }
        if self.sensitivity_count > 0 {
            let mut sdot = vec![0.0; total - n];
            system
                .sensitivity_rhs(t0, y0, &s0[..total - n], &mut sdot)
                .map_err(|source| IntegratorError::RhsFailure { time: t0, source })?;
            for (slot, &rate) in self.d[1][n..].iter_mut().zip(&sdot) {
                *slot = rate * self.h_abs;
            }
        }
        self.update_jacobian(system, t0, y0)?;
        debug!("BDF integrator restarted at t={t0} with h={:e}", self.h_abs);
        Ok(())
    }

    fn select_initial_step<S: OdeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t0: f64,
        y0: &[f64],
        f0: &[f64],
    ) -> Result<f64, IntegratorError> {
        if y0.is_empty() {
            return Ok(1.0);
        }
        let (atol, rtol) = (self.props.abs_tol, self.props.rel_tol);
        let scale: Vec<f64> = y0.iter().map(|v| atol + v.abs() * rtol).collect();
        let d0 = weighted_rms(y0, &scale);
        let d1 = weighted_rms(f0, &scale);
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };
        let y1: Vec<f64> = y0.iter().zip(f0).map(|(y, f)| y + h0 * f).collect();
        let mut f1 = vec![0.0; y0.len()];
        eval_rhs(system, &mut self.stats, t0 + h0, &y1, &mut f1)?;
        let diff: Vec<f64> = f1.iter().zip(f0).map(|(a, b)| a - b).collect();
        let d2 = weighted_rms(&diff, &scale) / h0;
        let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).sqrt()
        };
        Ok((100.0 * h0).min(h1))
    }

    fn update_jacobian<S: OdeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t: f64,
        y: &[f64],
    ) -> Result<(), IntegratorError> {
        self.stats.jacobian_evaluations += 1;
        self.factored_c = None;
        if self.props.use_jacobian && system.has_jacobian() {
            let sink = self.linear.reset_jacobian();
            return system
                .jacobian(t, y, sink)
                .map_err(|source| IntegratorError::RhsFailure { time: t, source });
        }

        let n = self.n;
        let mut f0 = vec![0.0; n];
        eval_rhs(system, &mut self.stats, t, y, &mut f0)?;
        let mut perturbed = y.to_vec();
        let mut f1 = vec![0.0; n];
        let sqrt_eps = f64::EPSILON.sqrt();
        let floor = self.props.abs_tol;
        let sink = self.linear.reset_jacobian();
        for j in 0..n {
            let increment = (sqrt_eps * y[j].abs()).max(floor);
            perturbed[j] = y[j] + increment;
            eval_rhs(system, &mut self.stats, t, &perturbed, &mut f1)?;
            perturbed[j] = y[j];
            for i in 0..n {
                let entry = (f1[i] - f0[i]) / increment;
                if entry != 0.0 {
                    sink.add(i, j, entry);
                }
            }
        }
        Ok(())
    }

    /// Factors `I - c J` unless the current factorization already matches `c`.
    fn ensure_factored(&mut self, c: f64) -> bool {
        if self.linear.is_factored() && self.factored_c == Some(c) {
            return true;
        }
        self.stats.factorizations += 1;
        match self.linear.factor(c) {
            Ok(()) => {
                self.factored_c = Some(c);
                self.last_factorization_failed = false;
                true
            }
            Err(_) => {
                self.factored_c = None;
                self.last_factorization_failed = true;
                false
            }
        }
    }

    /// Advances to exactly `t_out`; steps never cross it.
    pub fn step_to<S: OdeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t_out: f64,
    ) -> Result<(), IntegratorError> {
        let mut steps = 0;
        while self.t < t_out {
            if steps >= self.props.mx_step {
                return Err(IntegratorError::TooMuchWork {
                    time: self.t,
                    target: t_out,
                    steps,
                });
            }
            self.step(system, t_out)?;
            steps += 1;
        }
        Ok(())
    }

    fn step<S: OdeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t_bound: f64,
    ) -> Result<(), IntegratorError> {
        let n = self.n;
        let total = n * (1 + self.sensitivity_count);
        let t = self.t;
        let max_step = self.max_step();
        let min_step = (10.0 * f64::EPSILON * t.abs().max(f64::MIN_POSITIVE)).max(self.props.h_min);
        let (atol, rtol) = (self.props.abs_tol, self.props.rel_tol);

        let mut h_abs = self.h_abs;
        if h_abs > max_step {
            change_d(&mut self.d, self.order, max_step / h_abs);
            h_abs = max_step;
            self.n_equal_steps = 0;
        } else if h_abs < min_step {
            change_d(&mut self.d, self.order, min_step / h_abs);
            h_abs = min_step;
            self.n_equal_steps = 0;
        }

        let order = self.order;
        let alpha = gamma(order);
        let mut current_jac = false;
        let mut convergence_failures = 0;
        let mut error_test_failures = 0;
        let mut clamped_from: Option<f64>;

        let (t_new, y_new, d_new, error_norm, safety, scale) = loop {
            if h_abs < min_step {
                return Err(IntegratorError::StepTooSmall {
                    time: t,
                    step: h_abs,
                });
            }
            clamped_from = None;
            let mut t_new = t + h_abs;
            if t_new > t_bound {
                clamped_from = Some(h_abs);
                t_new = t_bound;
                change_d(&mut self.d, order, (t_new - t) / h_abs);
                self.n_equal_steps = 0;
            }
            let h = t_new - t;
            h_abs = h;

            let y_predict: Vec<f64> = (0..total)
                .map(|col| (0..=order).map(|i| self.d[i][col]).sum())
                .collect();
            let psi: Vec<f64> = (0..total)
                .map(|col| (1..=order).map(|i| self.d[i][col] * gamma(i)).sum::<f64>() / alpha)
                .collect();
            let c = h / alpha;
            let predict_scale: Vec<f64> =
                y_predict.iter().map(|v| atol + rtol * v.abs()).collect();

            let mut state = None;
            loop {
                if self.ensure_factored(c) {
                    let stats = &mut self.stats;
                    let outcome = newton_solve(
                        &self.linear,
                        n,
                        t_new,
                        &y_predict[..n],
                        c,
                        &psi[..n],
                        &predict_scale[..n],
                        self.newton_tol,
                        |y, f| eval_rhs(system, stats, t_new, y, f),
                    )?;
                    if outcome.converged {
                        state = Some(outcome);
                        break;
                    }
                }
                if current_jac {
                    break;
                }
                self.update_jacobian(system, t_new, &y_predict[..n])?;
                current_jac = true;
            }

            let Some(outcome) = state else {
                convergence_failures += 1;
                if convergence_failures >= MAX_CONVERGENCE_FAILURES {
                    return Err(if self.last_factorization_failed {
                        IntegratorError::SingularMatrix { time: t }
                    } else {
                        IntegratorError::ConvergenceFailure { time: t, step: h_abs }
                    });
                }
                h_abs *= 0.5;
                change_d(&mut self.d, order, 0.5);
                self.n_equal_steps = 0;
                continue;
            };

            let safety = 0.9 * (2 * NEWTON_MAXITER + 1) as f64
                / (2 * NEWTON_MAXITER + outcome.iterations) as f64;
            let scale: Vec<f64> = outcome.y.iter().map(|v| atol + rtol * v.abs()).collect();
            let error_norm = error_const(order) * weighted_rms(&outcome.d, &scale);
            if error_norm > 1.0 {
                error_test_failures += 1;
                if error_test_failures >= MAX_ERROR_TEST_FAILURES {
                    return Err(IntegratorError::ErrorTestFailure { time: t, step: h_abs });
                }
                let factor =
                    MIN_FACTOR.max(safety * error_norm.powf(-1.0 / (order as f64 + 1.0)));
                h_abs *= factor;
                change_d(&mut self.d, order, factor);
                self.n_equal_steps = 0;
                continue;
            }

            let mut y_new = outcome.y;
            let mut d_new = outcome.d;
            if self.sensitivity_count > 0 {
                let solved = self.solve_sensitivities(
                    system,
                    t_new,
                    &y_new,
                    &y_predict[n..],
                    c,
                    &psi[n..],
                    &predict_scale[n..],
                    &mut current_jac,
                )?;
                let Some(sensitivities) = solved else {
                    convergence_failures += 1;
                    if convergence_failures >= MAX_CONVERGENCE_FAILURES {
                        return Err(IntegratorError::ConvergenceFailure { time: t, step: h_abs });
                    }
                    h_abs *= 0.5;
                    change_d(&mut self.d, order, 0.5);
                    self.n_equal_steps = 0;
                    continue;
                };
                y_new.extend(sensitivities.y);
                d_new.extend(sensitivities.d);
            }
            break (t_new, y_new, d_new, error_norm, safety, scale);
        };

        self.stats.steps += 1;
        self.n_equal_steps += 1;
        self.t = t_new;
        debug_assert_eq!(y_new.len(), total);

        for col in 0..total {
            self.d[order + 2][col] = d_new[col] - self.d[order + 1][col];
            self.d[order + 1][col] = d_new[col];
        }
        for i in (0..=order).rev() {
            for col in 0..total {
                let next = self.d[i + 1][col];
                self.d[i][col] += next;
            }
        }

        if self.n_equal_steps < order + 1 {
            if let Some(previous) = clamped_from {
                let target = previous.min(max_step).min(h_abs * MAX_FACTOR);
                if target > h_abs && h_abs > 0.0 {
                    change_d(&mut self.d, order, target / h_abs);
                    h_abs = target;
                }
            }
            self.h_abs = h_abs;
            return Ok(());
        }

        let error_m_norm = if order > 1 {
            error_const(order - 1) * weighted_rms(&self.d[order][..n], &scale)
        } else {
            f64::INFINITY
        };
        let error_p_norm = if order < MAX_ORDER {
            error_const(order + 1) * weighted_rms(&self.d[order + 2][..n], &scale)
        } else {
            f64::INFINITY
        };
        let factors: Vec<f64> = [error_m_norm, error_norm, error_p_norm]
            .iter()
            .enumerate()
            .map(|(i, e)| e.powf(-1.0 / (order + i) as f64))
            .collect();
        let (best, best_factor) = factors
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, (i, f)| {
                if f > acc.1 {
                    (i, f)
                } else {
                    acc
                }
            });
        let new_order = (order + best).saturating_sub(1).clamp(1, MAX_ORDER);
        let factor = MAX_FACTOR.min(safety * best_factor);
        h_abs *= factor;
        change_d(&mut self.d, new_order, factor);
        self.order = new_order;
        self.n_equal_steps = 0;
        self.h_abs = h_abs;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn solve_sensitivities<S: OdeSystem + ?Sized>(
        &mut self,
        system: &mut S,
        t_new: f64,
        y_new: &[f64],
        s_predict: &[f64],
        c: f64,
        psi: &[f64],
        scale: &[f64],
        current_jac: &mut bool,
    ) -> Result<Option<NewtonOutcome>, IntegratorError> {
        let n = self.n;
        loop {
            if self.ensure_factored(c) {
                let stats = &mut self.stats;
                let outcome = newton_solve(
                    &self.linear,
                    n,
                    t_new,
                    s_predict,
                    c,
                    psi,
                    scale,
                    self.newton_tol,
                    |s, sdot| {
                        stats.rhs_evaluations += 1;
                        system
                            .sensitivity_rhs(t_new, y_new, s, sdot)
                            .map_err(|source| IntegratorError::RhsFailure {
                                time: t_new,
                                source,
                            })
                    },
                )?;
                if outcome.converged {
                    return Ok(Some(outcome));
                }
            }
            if *current_jac {
                return Ok(None);
            }
            self.update_jacobian(system, t_new, y_new)?;
            *current_jac = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::JacobianMatrix;
    use anyhow::bail;
    use approx::assert_relative_eq;

    struct Decay {
        k: f64,
    }

    impl OdeSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn sensitivity_count(&self) -> usize {
            1
        }

        fn rhs(&mut self, _t: f64, y: &[f64], ydot: &mut [f64]) -> anyhow::Result<()> {
            ydot[0] = -self.k * y[0];
            Ok(())
        }

        fn has_jacobian(&self) -> bool {
            true
        }

        fn jacobian(
            &mut self,
            _t: f64,
            _y: &[f64],
            jac: &mut dyn JacobianMatrix,
        ) -> anyhow::Result<()> {
            jac.add(0, 0, -self.k);
            Ok(())
        }

        fn sensitivity_rhs(
            &mut self,
            _t: f64,
            y: &[f64],
            sens: &[f64],
            sdot: &mut [f64],
        ) -> anyhow::Result<()> {
            sdot[0] = -self.k * sens[0] - y[0];
            Ok(())
        }
    }

    struct Oscillator;

    impl OdeSystem for Oscillator {
        fn dimension(&self) -> usize {
            2
        }

        fn rhs(&mut self, _t: f64, y: &[f64], ydot: &mut [f64]) -> anyhow::Result<()> {
            ydot[0] = y[1];
            ydot[1] = -y[0];
            Ok(())
        }
    }

    struct StiffTracking;

    impl OdeSystem for StiffTracking {
        fn dimension(&self) -> usize {
            1
        }

        fn rhs(&mut self, t: f64, y: &[f64], ydot: &mut [f64]) -> anyhow::Result<()> {
            ydot[0] = -1e4 * (y[0] - t.cos());
            Ok(())
        }
    }

    struct Failing;

    impl OdeSystem for Failing {
        fn dimension(&self) -> usize {
            1
        }

        fn rhs(&mut self, t: f64, _y: &[f64], ydot: &mut [f64]) -> anyhow::Result<()> {
            if t > 0.5 {
                bail!("boom");
            }
            ydot[0] = 1.0;
            Ok(())
        }
    }

    fn props(abs_tol: f64, rel_tol: f64) -> SolverProperties {
        SolverProperties {
            abs_tol,
            rel_tol,
            ..Default::default()
        }
    }

    #[test]
    fn exponential_decay_and_its_sensitivity() {
        let mut system = Decay { k: 0.7 };
        let mut bdf = BdfIntegrator::new(
            &mut system,
            LinearSolver::dense(1),
            props(1e-12, 1e-9),
            0.0,
            &[2.0],
            &[0.0],
        )
        .unwrap();
        for &t in &[1.0, 2.5, 5.0] {
            bdf.step_to(&mut system, t).unwrap();
            assert_eq!(bdf.time(), t);
            let expected = 2.0 * (-0.7 * t).exp();
            assert_relative_eq!(bdf.state()[0], expected, max_relative = 1e-6);
            assert_relative_eq!(bdf.sensitivities()[0], -t * expected, max_relative = 1e-4);
        }
    }

    #[test]
    fn harmonic_oscillator_over_one_period() {
        let mut system = Oscillator;
        let period = 2.0 * std::f64::consts::PI;
        let mut bdf = BdfIntegrator::new(
            &mut system,
            LinearSolver::dense(2),
            props(1e-10, 1e-8),
            0.0,
            &[1.0, 0.0],
            &[],
        )
        .unwrap();
        bdf.step_to(&mut system, period).unwrap();
        assert!((bdf.state()[0] - 1.0).abs() < 1e-5);
        assert!(bdf.state()[1].abs() < 1e-5);
        assert!(bdf.order() > 1);
    }

    #[test]
    fn stiff_problem_takes_few_steps() {
        let mut system = StiffTracking;
        let mut bdf = BdfIntegrator::new(
            &mut system,
            LinearSolver::dense(1),
            props(1e-8, 1e-5),
            0.0,
            &[0.0],
            &[],
        )
        .unwrap();
        bdf.step_to(&mut system, 10.0).unwrap();
        assert!((bdf.state()[0] - 10.0f64.cos()).abs() < 1e-3);
        assert!(bdf.stats().steps < 2000, "steps: {}", bdf.stats().steps);
    }

    #[test]
    fn banded_and_dense_runs_agree() {
        let mut system = Oscillator;
        let mut dense = BdfIntegrator::new(
            &mut system,
            LinearSolver::dense(2),
            props(1e-10, 1e-7),
            0.0,
            &[1.0, 0.0],
            &[],
        )
        .unwrap();
        let mut banded = BdfIntegrator::new(
            &mut system,
            LinearSolver::banded(2, 1, 1),
            props(1e-10, 1e-7),
            0.0,
            &[1.0, 0.0],
            &[],
        )
        .unwrap();
        dense.step_to(&mut system, 3.0).unwrap();
        banded.step_to(&mut system, 3.0).unwrap();
        assert_relative_eq!(dense.state()[0], banded.state()[0], epsilon = 1e-9);
        assert_relative_eq!(dense.state()[1], banded.state()[1], epsilon = 1e-9);
    }

    #[test]
    fn step_limit_reports_too_much_work() {
        let mut system = Oscillator;
        let properties = SolverProperties {
            mx_step: 2,
            h0: 1e-6,
            ..props(1e-10, 1e-8)
        };
        let mut bdf = BdfIntegrator::new(
            &mut system,
            LinearSolver::dense(2),
            properties,
            0.0,
            &[1.0, 0.0],
            &[],
        )
        .unwrap();
        let err = bdf.step_to(&mut system, 100.0).expect_err("too few steps");
        assert!(matches!(err, IntegratorError::TooMuchWork { .. }));
        assert!(!err.is_tolerance_reducible());
    }

    #[test]
    fn rhs_failures_propagate_with_source() {
        let mut system = Failing;
        let mut bdf = BdfIntegrator::new(
            &mut system,
            LinearSolver::dense(1),
            props(1e-8, 1e-6),
            0.0,
            &[0.0],
            &[],
        )
        .unwrap();
        let err = bdf.step_to(&mut system, 1.0).expect_err("rhs fails");
        assert!(matches!(err, IntegratorError::RhsFailure { .. }));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn reinit_restarts_from_new_state() {
        let mut system = Decay { k: 1.0 };
        let mut bdf = BdfIntegrator::new(
            &mut system,
            LinearSolver::dense(1),
            props(1e-12, 1e-9),
            0.0,
            &[1.0],
            &[0.0],
        )
        .unwrap();
        bdf.step_to(&mut system, 1.0).unwrap();
        bdf.reinit(&mut system, 1.0, &[5.0], &[0.0]).unwrap();
        assert_eq!(bdf.order(), 1);
        bdf.step_to(&mut system, 2.0).unwrap();
        assert_relative_eq!(bdf.state()[0], 5.0 * (-1.0f64).exp(), max_relative = 1e-6);
    }
}
