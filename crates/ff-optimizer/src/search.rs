//! Derivative-free search drivers.
//!
//! Every driver minimizes a [`ScoredFunction`] inside box bounds and halts as
//! soon as the function answers [`Control::Stop`]. A stop is a normal
//! termination: the outcome still carries the best point seen.

use ff_types::{invalid_argument, FitResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Whether the search may keep going after this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Stop,
}

/// Objective as seen by a search driver.
pub trait ScoredFunction {
    fn call(&mut self, x: &[f64]) -> FitResult<(f64, Control)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// Tolerances were met.
    Converged,
    /// The driver's own iteration budget ran out.
    IterationLimit,
    /// The scored function asked to stop.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub x: Vec<f64>,
    pub fun: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub termination: Termination,
}

/// Common trait for all search strategies.
pub trait SearchStrategy: Send + Sync {
    /// Minimize `f` starting from `x0` inside `bounds`.
    fn minimize(
        &mut self,
        f: &mut dyn ScoredFunction,
        x0: &[f64],
        bounds: &[(f64, f64)],
    ) -> FitResult<SearchOutcome>;

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

fn check_problem(x0: &[f64], bounds: &[(f64, f64)]) -> FitResult<()> {
    if x0.is_empty() {
        return Err(invalid_argument!("search needs at least one dimension"));
    }
    if x0.len() != bounds.len() {
        return Err(invalid_argument!(
            "start point has {} components but {} bounds were given",
            x0.len(),
            bounds.len()
        ));
    }
    for (i, (lo, hi)) in bounds.iter().enumerate() {
        if !(lo.is_finite() && hi.is_finite()) || lo >= hi {
            return Err(invalid_argument!("invalid bounds for dimension {}: [{}, {}]", i, lo, hi));
        }
    }
    Ok(())
}

fn clip(x: &mut [f64], bounds: &[(f64, f64)]) {
    for (v, (lo, hi)) in x.iter_mut().zip(bounds) {
        *v = v.clamp(*lo, *hi);
    }
}

/// Counts calls, remembers the best point and latches a stop request.
struct Tracker<'a> {
    f: &'a mut dyn ScoredFunction,
    evaluations: usize,
    best_x: Vec<f64>,
    best_f: f64,
    stopped: bool,
}

impl<'a> Tracker<'a> {
    fn new(f: &'a mut dyn ScoredFunction) -> Self {
        Self {
            f,
            evaluations: 0,
            best_x: Vec::new(),
            best_f: f64::INFINITY,
            stopped: false,
        }
    }

    fn eval(&mut self, x: &[f64]) -> FitResult<f64> {
        let (value, control) = self.f.call(x)?;
        self.evaluations += 1;
        if value < self.best_f || self.best_x.is_empty() {
            self.best_f = value;
            self.best_x = x.to_vec();
        }
        if control == Control::Stop {
            self.stopped = true;
        }
        Ok(value)
    }

    fn finish(self, iterations: usize, termination: Termination) -> SearchOutcome {
        let termination = if self.stopped { Termination::Stopped } else { termination };
        SearchOutcome {
            x: self.best_x,
            fun: self.best_f,
            iterations,
            evaluations: self.evaluations,
            termination,
        }
    }
}

// ---- Bounded scalar (Brent) ----

/// Brent's bounded minimizer for a single coordinate.
///
/// Golden-section steps mixed with parabolic interpolation; the start point is
/// ignored and the first evaluation sits at the golden-section point of the bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundedScalar {
    pub xatol: f64,
    /// Maximum number of function evaluations.
    pub max_iter: usize,
}

impl Default for BoundedScalar {
    fn default() -> Self {
        Self {
            xatol: 1e-3,
            max_iter: 40,
        }
    }
}

impl SearchStrategy for BoundedScalar {
    fn minimize(
        &mut self,
        f: &mut dyn ScoredFunction,
        x0: &[f64],
        bounds: &[(f64, f64)],
    ) -> FitResult<SearchOutcome> {
        check_problem(x0, bounds)?;
        if bounds.len() != 1 {
            return Err(invalid_argument!(
                "bounded scalar search handles exactly one coordinate, got {}",
                bounds.len()
            ));
        }

        let sqrt_eps = f64::EPSILON.sqrt();
        let golden_mean = 0.5 * (3.0 - 5f64.sqrt());
        let (lo, hi) = bounds[0];
        let (mut a, mut b) = (lo, hi);
        let mut tracker = Tracker::new(f);

        let mut fulc = a + golden_mean * (b - a);
        let mut nfc = fulc;
        let mut xf = fulc;
        let mut rat: f64 = 0.0;
        let mut e: f64 = 0.0;
        let mut fx = tracker.eval(&[xf])?;
        let mut ffulc = fx;
        let mut fnfc = fx;
        let mut iterations = 0;

        let mut xm = 0.5 * (a + b);
        let mut tol1 = sqrt_eps * xf.abs() + self.xatol / 3.0;
        let mut tol2 = 2.0 * tol1;

        let mut termination = Termination::Converged;
        while (xf - xm).abs() > tol2 - 0.5 * (b - a) {
            if tracker.stopped {
                break;
            }
            if tracker.evaluations >= self.max_iter {
                termination = Termination::IterationLimit;
                break;
            }

            let mut golden = true;
            if e.abs() > tol1 {
                golden = false;
                let mut r = (xf - nfc) * (fx - ffulc);
                let mut q = (xf - fulc) * (fx - fnfc);
                let mut p = (xf - fulc) * q - (xf - nfc) * r;
                q = 2.0 * (q - r);
                if q > 0.0 {
                    p = -p;
                }
                q = q.abs();
                r = e;
                e = rat;

                if p.abs() < (0.5 * q * r).abs() && p > q * (a - xf) && p < q * (b - xf) {
                    rat = p / q;
                    let x = xf + rat;
                    if (x - a) < tol2 || (b - x) < tol2 {
                        rat = if xm >= xf { tol1 } else { -tol1 };
                    }
                } else {
                    golden = true;
                }
            }
            if golden {
                e = if xf >= xm { a - xf } else { b - xf };
                rat = golden_mean * e;
            }

            let sign = if rat >= 0.0 { 1.0 } else { -1.0 };
            let x = (xf + sign * rat.abs().max(tol1)).clamp(lo, hi);
            let fu = tracker.eval(&[x])?;
            iterations += 1;

            if fu <= fx {
                if x >= xf {
                    a = xf;
                } else {
                    b = xf;
                }
                fulc = nfc;
                ffulc = fnfc;
                nfc = xf;
                fnfc = fx;
                xf = x;
                fx = fu;
            } else {
                if x < xf {
                    a = x;
                } else {
                    b = x;
                }
                if fu <= fnfc || nfc == xf {
                    fulc = nfc;
                    ffulc = fnfc;
                    nfc = x;
                    fnfc = fu;
                } else if fu <= ffulc || fulc == xf || fulc == nfc {
                    fulc = x;
                    ffulc = fu;
                }
            }

            xm = 0.5 * (a + b);
            tol1 = sqrt_eps * xf.abs() + self.xatol / 3.0;
            tol2 = 2.0 * tol1;
        }

        debug!(x = xf, fun = fx, evaluations = tracker.evaluations, "Bounded scalar search finished");
        Ok(tracker.finish(iterations, termination))
    }

    fn name(&self) -> &str {
        "bounded_scalar"
    }
}

// ---- Nelder-Mead ----

/// Downhill simplex search with every vertex clipped to the bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NelderMead {
    pub max_iter: usize,
    pub xatol: f64,
    pub fatol: f64,
    /// Initial simplex edge as a fraction of each bound width.
    pub initial_step: f64,
}

impl Default for NelderMead {
    fn default() -> Self {
        Self {
            max_iter: 200,
            xatol: 1e-4,
            fatol: 1e-4,
            initial_step: 0.05,
        }
    }
}

const REFLECT: f64 = 1.0;
const EXPAND: f64 = 2.0;
const CONTRACT: f64 = 0.5;
const SHRINK: f64 = 0.5;

impl NelderMead {
    fn initial_simplex(&self, x0: &[f64], bounds: &[(f64, f64)]) -> Vec<Vec<f64>> {
        let mut start = x0.to_vec();
        clip(&mut start, bounds);

        let mut simplex = vec![start.clone()];
        for (i, (lo, hi)) in bounds.iter().enumerate() {
            let step = self.initial_step * (hi - lo);
            let mut vertex = start.clone();
            vertex[i] = if vertex[i] + step <= *hi {
                vertex[i] + step
            } else {
                vertex[i] - step
            };
            simplex.push(vertex);
        }
        simplex
    }
}

fn sort_simplex(simplex: &mut Vec<Vec<f64>>, values: &mut Vec<f64>) {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    *simplex = order.iter().map(|&i| simplex[i].clone()).collect();
    *values = order.iter().map(|&i| values[i]).collect();
}

fn combine(base: &[f64], toward: &[f64], coeff: f64, bounds: &[(f64, f64)]) -> Vec<f64> {
    let mut out: Vec<f64> = base
        .iter()
        .zip(toward)
        .map(|(b, t)| b + coeff * (t - b))
        .collect();
    clip(&mut out, bounds);
    out
}

impl SearchStrategy for NelderMead {
    fn minimize(
        &mut self,
        f: &mut dyn ScoredFunction,
        x0: &[f64],
        bounds: &[(f64, f64)],
    ) -> FitResult<SearchOutcome> {
        check_problem(x0, bounds)?;
        let n = x0.len();
        let mut tracker = Tracker::new(f);

        let mut simplex = self.initial_simplex(x0, bounds);
        let mut values = Vec::with_capacity(n + 1);
        for vertex in &simplex {
            values.push(tracker.eval(vertex)?);
            if tracker.stopped {
                return Ok(tracker.finish(0, Termination::Stopped));
            }
        }
        sort_simplex(&mut simplex, &mut values);

        let mut iterations = 0;
        let termination = loop {
            let x_spread = simplex[1..]
                .iter()
                .flat_map(|v| v.iter().zip(&simplex[0]).map(|(a, b)| (a - b).abs()))
                .fold(0.0f64, f64::max);
            let f_spread = values[1..]
                .iter()
                .map(|v| (v - values[0]).abs())
                .fold(0.0f64, f64::max);
            if x_spread <= self.xatol && f_spread <= self.fatol {
                break Termination::Converged;
            }
            if iterations >= self.max_iter {
                break Termination::IterationLimit;
            }
            iterations += 1;

            let centroid: Vec<f64> = (0..n)
                .map(|j| simplex[..n].iter().map(|v| v[j]).sum::<f64>() / n as f64)
                .collect();
            let worst = simplex[n].clone();

            let reflected = combine(&centroid, &worst, -REFLECT, bounds);
            let f_reflected = tracker.eval(&reflected)?;
            if tracker.stopped {
                break Termination::Stopped;
            }

            if f_reflected < values[0] {
                let expanded = combine(&centroid, &worst, -EXPAND, bounds);
                let f_expanded = tracker.eval(&expanded)?;
                if f_expanded < f_reflected {
                    simplex[n] = expanded;
                    values[n] = f_expanded;
                } else {
                    simplex[n] = reflected;
                    values[n] = f_reflected;
                }
            } else if f_reflected < values[n - 1] {
                simplex[n] = reflected;
                values[n] = f_reflected;
            } else {
                let (candidate, accept_below) = if f_reflected < values[n] {
                    (combine(&centroid, &reflected, CONTRACT, bounds), f_reflected)
                } else {
                    (combine(&centroid, &worst, CONTRACT, bounds), values[n])
                };
                let f_candidate = tracker.eval(&candidate)?;
                if tracker.stopped {
                    break Termination::Stopped;
                }

                if f_candidate <= accept_below {
                    simplex[n] = candidate;
                    values[n] = f_candidate;
                } else {
                    let best = simplex[0].clone();
                    for j in 1..=n {
                        simplex[j] = combine(&best, &simplex[j], SHRINK, bounds);
                        values[j] = tracker.eval(&simplex[j])?;
                        if tracker.stopped {
                            break;
                        }
                    }
                }
            }
            if tracker.stopped {
                break Termination::Stopped;
            }
            sort_simplex(&mut simplex, &mut values);
        };

        debug!(
            iterations,
            evaluations = tracker.evaluations,
            ?termination,
            "Nelder-Mead search finished"
        );
        Ok(tracker.finish(iterations, termination))
    }

    fn name(&self) -> &str {
        "nelder_mead"
    }
}

// ---- Random search ----

/// Independent uniform sampling inside the bounds, starting from `x0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomSearch {
    pub samples: usize,
    pub seed: Option<u64>,
}

impl Default for RandomSearch {
    fn default() -> Self {
        Self {
            samples: 50,
            seed: None,
        }
    }
}

impl SearchStrategy for RandomSearch {
    fn minimize(
        &mut self,
        f: &mut dyn ScoredFunction,
        x0: &[f64],
        bounds: &[(f64, f64)],
    ) -> FitResult<SearchOutcome> {
        check_problem(x0, bounds)?;
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut tracker = Tracker::new(f);

        let mut start = x0.to_vec();
        clip(&mut start, bounds);
        tracker.eval(&start)?;

        let mut iterations = 1;
        while iterations < self.samples && !tracker.stopped {
            let x: Vec<f64> = bounds.iter().map(|(lo, hi)| rng.gen_range(*lo..=*hi)).collect();
            tracker.eval(&x)?;
            iterations += 1;
        }

        Ok(tracker.finish(iterations, Termination::IterationLimit))
    }

    fn name(&self) -> &str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smooth bowl with an optional stop after `stop_after` calls.
    struct Bowl {
        center: Vec<f64>,
        calls: usize,
        stop_after: Option<usize>,
        seen: Vec<Vec<f64>>,
    }

    impl Bowl {
        fn new(center: &[f64]) -> Self {
            Self {
                center: center.to_vec(),
                calls: 0,
                stop_after: None,
                seen: Vec::new(),
            }
        }
    }

    impl ScoredFunction for Bowl {
        fn call(&mut self, x: &[f64]) -> FitResult<(f64, Control)> {
            self.calls += 1;
            self.seen.push(x.to_vec());
            let value = x.iter().zip(&self.center).map(|(a, c)| (a - c).powi(2)).sum();
            let control = match self.stop_after {
                Some(n) if self.calls >= n => Control::Stop,
                _ => Control::Continue,
            };
            Ok((value, control))
        }
    }

    #[test]
    fn bounded_scalar_finds_interior_minimum() {
        let mut f = Bowl::new(&[-3.2]);
        let outcome = BoundedScalar::default()
            .minimize(&mut f, &[-5.0], &[(-10.0, 0.0)])
            .unwrap();
        assert_eq!(outcome.termination, Termination::Converged);
        assert!((outcome.x[0] + 3.2).abs() < 2e-3);
        assert!(outcome.evaluations <= 40);
        assert_eq!(outcome.evaluations, f.calls);
    }

    #[test]
    fn bounded_scalar_respects_bounds() {
        let mut f = Bowl::new(&[5.0]);
        let outcome = BoundedScalar { xatol: 1e-5, max_iter: 100 }
            .minimize(&mut f, &[0.0], &[(-1.0, 1.0)])
            .unwrap();
        assert!(f.seen.iter().all(|x| (-1.0..=1.0).contains(&x[0])));
        assert!(outcome.x[0] > 0.99);
    }

    #[test]
    fn bounded_scalar_honours_evaluation_budget() {
        let mut f = Bowl::new(&[0.123]);
        let outcome = BoundedScalar { xatol: 1e-12, max_iter: 5 }
            .minimize(&mut f, &[0.0], &[(-10.0, 10.0)])
            .unwrap();
        assert_eq!(outcome.termination, Termination::IterationLimit);
        assert_eq!(f.calls, 5);
    }

    #[test]
    fn bounded_scalar_rejects_multiple_dimensions() {
        let mut f = Bowl::new(&[0.0, 0.0]);
        let err = BoundedScalar::default()
            .minimize(&mut f, &[0.0, 0.0], &[(-1.0, 1.0), (-1.0, 1.0)])
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn stop_request_ends_search_with_best_so_far() {
        let mut f = Bowl::new(&[-3.0]);
        f.stop_after = Some(3);
        let outcome = BoundedScalar::default()
            .minimize(&mut f, &[-5.0], &[(-10.0, 0.0)])
            .unwrap();
        assert_eq!(outcome.termination, Termination::Stopped);
        assert_eq!(outcome.evaluations, 3);
        assert_eq!(f.calls, 3);
        let best_seen = f
            .seen
            .iter()
            .map(|x| (x[0] + 3.0).powi(2))
            .fold(f64::INFINITY, f64::min);
        assert_eq!(outcome.fun, best_seen);
    }

    #[test]
    fn nelder_mead_converges_in_two_dimensions() {
        let mut f = Bowl::new(&[0.4, -1.5]);
        let outcome = NelderMead::default()
            .minimize(&mut f, &[2.0, 2.0], &[(-5.0, 5.0), (-5.0, 5.0)])
            .unwrap();
        assert_eq!(outcome.termination, Termination::Converged);
        assert!((outcome.x[0] - 0.4).abs() < 1e-2);
        assert!((outcome.x[1] + 1.5).abs() < 1e-2);
    }

    #[test]
    fn nelder_mead_stays_inside_bounds() {
        let mut f = Bowl::new(&[10.0, 10.0]);
        let outcome = NelderMead::default()
            .minimize(&mut f, &[0.0, 0.0], &[(-1.0, 1.0), (-1.0, 1.0)])
            .unwrap();
        assert!(f.seen.iter().flatten().all(|v| (-1.0..=1.0).contains(v)));
        assert!(outcome.x.iter().all(|v| *v > 0.5));
    }

    #[test]
    fn nelder_mead_stops_on_request() {
        let mut f = Bowl::new(&[0.0, 0.0]);
        f.stop_after = Some(5);
        let outcome = NelderMead::default()
            .minimize(&mut f, &[1.0, 1.0], &[(-2.0, 2.0), (-2.0, 2.0)])
            .unwrap();
        assert_eq!(outcome.termination, Termination::Stopped);
        assert_eq!(f.calls, 5);
    }

    #[test]
    fn seeded_random_search_is_reproducible() {
        let bounds = [(-1.0, 1.0), (10.0, 20.0)];
        let run = || {
            let mut f = Bowl::new(&[0.0, 15.0]);
            let outcome = RandomSearch { samples: 20, seed: Some(7) }
                .minimize(&mut f, &[0.5, 12.0], &bounds)
                .unwrap();
            (outcome, f.seen)
        };
        let (a, seen_a) = run();
        let (b, seen_b) = run();
        assert_eq!(seen_a, seen_b);
        assert_eq!(a, b);
        assert_eq!(a.evaluations, 20);
        assert_eq!(seen_a[0], vec![0.5, 12.0]);
        assert!(seen_a
            .iter()
            .all(|x| (-1.0..=1.0).contains(&x[0]) && (10.0..=20.0).contains(&x[1])));
    }

    #[test]
    fn mismatched_bounds_are_rejected() {
        let mut f = Bowl::new(&[0.0]);
        assert!(NelderMead::default().minimize(&mut f, &[0.0], &[]).is_err());
        assert!(NelderMead::default().minimize(&mut f, &[0.0], &[(1.0, 1.0)]).is_err());
    }
}
