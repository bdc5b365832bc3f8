use roots::{find_root_brent, SimpleConvergency};

/// Absolute tolerance, in deg C, on the sensed-temperature residual of a part load ratio search
pub const PART_LOAD_TOLERANCE: f64 = 0.001;
pub const PART_LOAD_MAX_ITERATIONS: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Converged<T> {
    pub value: T,
    pub iterations: usize,
}

/// The final iterate of a loop that ran out of iterations, and its remaining error.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LastValue<T> {
    pub value: T,
    pub iterations: usize,
    pub error: f64,
}

/// Run `step` until the error it reports drops below `tolerance`, at most `max_iterations` times.
///
/// `step` receives the 1-based iteration number and returns the new iterate together with its
/// convergence error. The loop always runs at least once.
pub fn iterate_until<T>(
    max_iterations: usize,
    tolerance: f64,
    mut step: impl FnMut(usize) -> (T, f64),
) -> Result<Converged<T>, LastValue<T>> {
    let max_iterations = max_iterations.max(1);
    let mut iteration = 1;
    loop {
        let (value, error) = step(iteration);
        if error < tolerance {
            return Ok(Converged {
                value,
                iterations: iteration,
            });
        }
        if iteration >= max_iterations {
            return Err(LastValue {
                value,
                iterations: iteration,
                error,
            });
        }
        iteration += 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PartLoadSolution {
    Root { plr: f64, iterations: usize },
    /// The residual is positive at both ends: the target is met with the source off.
    ClampedToZero,
    /// The residual is negative at both ends: full output cannot reach the target.
    ClampedToFull,
    /// The iteration cap was hit; `plr` is the last iterate.
    NotConverged { plr: f64, residual: f64 },
}

impl PartLoadSolution {
    pub fn part_load_ratio(&self) -> f64 {
        match *self {
            PartLoadSolution::Root { plr, .. } => plr,
            PartLoadSolution::ClampedToZero => 0.,
            PartLoadSolution::ClampedToFull => 1.,
            PartLoadSolution::NotConverged { plr, .. } => plr,
        }
    }
}

/// Find the part load ratio in [0, 1] at which `residual` crosses zero.
///
/// Uses regula falsi with the Illinois modification. The residual is evaluated at both ends first;
/// when the signs agree there is no root and the result is clamped without further evaluation.
pub fn solve_part_load_ratio(
    mut residual: impl FnMut(f64) -> f64,
    tolerance: f64,
    max_iterations: usize,
) -> PartLoadSolution {
    let (mut a, mut fa) = (0., residual(0.));
    if fa.abs() < tolerance {
        return PartLoadSolution::Root {
            plr: 0.,
            iterations: 0,
        };
    }
    let (mut b, mut fb) = (1., residual(1.));
    if fb.abs() < tolerance {
        return PartLoadSolution::Root {
            plr: 1.,
            iterations: 0,
        };
    }
    if fa * fb > 0. {
        return if fa > 0. {
            PartLoadSolution::ClampedToZero
        } else {
            PartLoadSolution::ClampedToFull
        };
    }

    // side of the bracket retained on the previous step: -1 for a, 1 for b
    let mut retained = 0;
    let search = iterate_until(max_iterations, tolerance, |_| {
        let c = ((a * fb - b * fa) / (fb - fa)).clamp(0., 1.);
        let fc = residual(c);
        if fc * fb > 0. {
            b = c;
            fb = fc;
            if retained == -1 {
                fa /= 2.;
            }
            retained = -1;
        } else {
            a = c;
            fa = fc;
            if retained == 1 {
                fb /= 2.;
            }
            retained = 1;
        }
        ((c, fc), fc.abs())
    });

    match search {
        Ok(Converged {
            value: (plr, _),
            iterations,
        }) => PartLoadSolution::Root { plr, iterations },
        Err(LastValue {
            value: (plr, residual),
            ..
        }) => PartLoadSolution::NotConverged { plr, residual },
    }
}

/// Find the root of a function bracketed by `[a, b]` with Brent's method.
pub(crate) fn find_root_in_bracket(
    func: impl FnMut(f64) -> f64,
    a: f64,
    b: f64,
    tolerance: f64,
    max_iterations: usize,
) -> anyhow::Result<f64> {
    let mut convergency = SimpleConvergency {
        eps: tolerance,
        max_iter: max_iterations,
    };

    find_root_brent::<f64, _>(a, b, func, &mut convergency).map_err(|e| anyhow::anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use std::cell::Cell;

    #[rstest]
    fn iterate_until_stops_at_tolerance() {
        // halves the error each pass
        let result = iterate_until(100, 0.1, |i| (i, 1. / 2f64.powi(i as i32)));
        assert_eq!(
            result,
            Ok(Converged {
                value: 4,
                iterations: 4
            })
        );
    }

    #[rstest]
    fn iterate_until_returns_last_value_at_cap() {
        let result = iterate_until(5, 0.1, |i| (i * 10, 1.));
        assert_eq!(
            result,
            Err(LastValue {
                value: 50,
                iterations: 5,
                error: 1.
            })
        );
    }

    #[rstest]
    fn iterate_until_runs_at_least_once() {
        let result = iterate_until(0, 0.1, |i| (i, 5.));
        assert_eq!(result.unwrap_err().iterations, 1);
    }

    #[rstest]
    #[case(0.37)]
    #[case(0.02)]
    #[case(0.999)]
    fn part_load_root_for_monotonic_residual(#[case] root: f64) {
        // a tank-like saturating response: sensed temperature minus setpoint
        let residual = |plr: f64| 40. * (1. - (-2. * plr).exp()) - 40. * (1. - (-2. * root).exp());

        let solution = solve_part_load_ratio(residual, PART_LOAD_TOLERANCE, PART_LOAD_MAX_ITERATIONS);

        match solution {
            PartLoadSolution::Root { plr, .. } => {
                assert!(residual(plr).abs() < PART_LOAD_TOLERANCE);
                assert_relative_eq!(plr, root, epsilon = 1e-3);
            }
            other => panic!("expected a root, got {other:?}"),
        }
    }

    #[rstest]
    #[case(5., PartLoadSolution::ClampedToZero, 0.)]
    #[case(-5., PartLoadSolution::ClampedToFull, 1.)]
    fn part_load_without_root_clamps_without_iterating(
        #[case] offset: f64,
        #[case] expected: PartLoadSolution,
        #[case] expected_plr: f64,
    ) {
        let evaluations = Cell::new(0);
        let residual = |plr: f64| {
            evaluations.set(evaluations.get() + 1);
            offset + plr
        };

        let solution = solve_part_load_ratio(residual, PART_LOAD_TOLERANCE, PART_LOAD_MAX_ITERATIONS);

        assert_eq!(solution, expected);
        assert_eq!(solution.part_load_ratio(), expected_plr);
        assert_eq!(evaluations.get(), 2);
    }

    #[rstest]
    fn part_load_reports_non_convergence() {
        // a step residual that regula falsi cannot settle within two iterations
        let residual = |plr: f64| if plr < 0.5 { -1. } else { 1. };

        let solution = solve_part_load_ratio(residual, PART_LOAD_TOLERANCE, 2);

        assert!(matches!(solution, PartLoadSolution::NotConverged { .. }));
        let plr = solution.part_load_ratio();
        assert!((0. ..=1.).contains(&plr));
    }

    #[rstest]
    fn brent_finds_bracketed_root() {
        let root = find_root_in_bracket(|x| x * x - 0.25, 0., 1., 1e-9, 50).unwrap();
        assert_relative_eq!(root, 0.5, epsilon = 1e-8);
    }
}
