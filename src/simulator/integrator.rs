//! Explicit embedded Runge–Kutta integration with PID step-size control
//!
//! One call integrates a single initial value problem from the first to the last save time. The
//! right-hand side is any closure `f(t, y, dy)`, which keeps the integrator free of the model and
//! argument types used by the solver.

use std::fmt;
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};

use crate::error::SimulationError;

const SAFETY: f64 = 0.9;
const FACTOR_MIN: f64 = 0.2;
const FACTOR_MAX: f64 = 10.0;
const ERROR_FLOOR: f64 = 1e-10;

/// Butcher tableau of an embedded pair
///
/// `e` holds the difference between the propagated and the embedded weights, so the local error
/// estimate is `h * sum(e_i * k_i)`.
struct Tableau {
    c: &'static [f64],
    a: &'static [&'static [f64]],
    b: &'static [f64],
    e: &'static [f64],
    /// The last stage is evaluated at the new solution
    fsal: bool,
    error_order: f64,
}

const DOPRI5: Tableau = Tableau {
    c: &[0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0],
    a: &[
        &[],
        &[1.0 / 5.0],
        &[3.0 / 40.0, 9.0 / 40.0],
        &[44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0],
        &[19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0],
        &[
            9017.0 / 3168.0,
            -355.0 / 33.0,
            46732.0 / 5247.0,
            49.0 / 176.0,
            -5103.0 / 18656.0,
        ],
        &[
            35.0 / 384.0,
            0.0,
            500.0 / 1113.0,
            125.0 / 192.0,
            -2187.0 / 6784.0,
            11.0 / 84.0,
        ],
    ],
    b: &[
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
        0.0,
    ],
    e: &[
        35.0 / 384.0 - 5179.0 / 57600.0,
        0.0,
        500.0 / 1113.0 - 7571.0 / 16695.0,
        125.0 / 192.0 - 393.0 / 640.0,
        -2187.0 / 6784.0 + 92097.0 / 339200.0,
        11.0 / 84.0 - 187.0 / 2100.0,
        -1.0 / 40.0,
    ],
    fsal: true,
    error_order: 5.0,
};

const TSIT5: Tableau = Tableau {
    c: &[0.0, 0.161, 0.327, 0.9, 0.9800255409045097, 1.0, 1.0],
    a: &[
        &[],
        &[0.161],
        &[-0.008480655492356989, 0.335480655492357],
        &[2.897153057105493, -6.359448489975075, 4.3622954328695815],
        &[
            5.325864828439257,
            -11.748883564062828,
            7.4955393428898365,
            -0.09249506636175525,
        ],
        &[
            5.86145544294642,
            -12.92096931784711,
            8.159367898576159,
            -0.071584973281401,
            -0.028269050394068383,
        ],
        &[
            0.09646076681806523,
            0.01,
            0.4798896504144996,
            1.379008574103742,
            -3.290069515436081,
            2.324710524099774,
        ],
    ],
    b: &[
        0.09646076681806523,
        0.01,
        0.4798896504144996,
        1.379008574103742,
        -3.290069515436081,
        2.324710524099774,
        0.0,
    ],
    e: &[
        -0.00178001105222577714,
        -0.0008164344596567469,
        0.007880878010261995,
        -0.1447110071732629,
        0.5823571654525552,
        -0.45808210592918697,
        0.015151515151515152,
    ],
    fsal: true,
    error_order: 5.0,
};

const BOSH3: Tableau = Tableau {
    c: &[0.0, 1.0 / 2.0, 3.0 / 4.0, 1.0],
    a: &[
        &[],
        &[1.0 / 2.0],
        &[0.0, 3.0 / 4.0],
        &[2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0],
    ],
    b: &[2.0 / 9.0, 1.0 / 3.0, 4.0 / 9.0, 0.0],
    e: &[
        2.0 / 9.0 - 7.0 / 24.0,
        1.0 / 3.0 - 1.0 / 4.0,
        4.0 / 9.0 - 1.0 / 3.0,
        -1.0 / 8.0,
    ],
    fsal: true,
    error_order: 3.0,
};

const HEUN: Tableau = Tableau {
    c: &[0.0, 1.0],
    a: &[&[], &[1.0]],
    b: &[0.5, 0.5],
    e: &[-0.5, 0.5],
    fsal: false,
    error_order: 2.0,
};

/// Integration method, selected by name in the settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    #[default]
    Dopri5,
    Tsit5,
    Bosh3,
    Heun,
}

impl Method {
    fn tableau(&self) -> &'static Tableau {
        match self {
            Method::Dopri5 => &DOPRI5,
            Method::Tsit5 => &TSIT5,
            Method::Bosh3 => &BOSH3,
            Method::Heun => &HEUN,
        }
    }
}

impl FromStr for Method {
    type Err = SimulationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dopri5" => Ok(Method::Dopri5),
            "tsit5" => Ok(Method::Tsit5),
            "bosh3" => Ok(Method::Bosh3),
            "heun" => Ok(Method::Heun),
            _ => Err(SimulationError::UnknownIdentifier {
                kind: "method",
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Method::Dopri5 => "Dopri5",
            Method::Tsit5 => "Tsit5",
            Method::Bosh3 => "Bosh3",
            Method::Heun => "Heun",
        };
        write!(f, "{}", name)
    }
}

/// Tolerances, controller coefficients and step budget of a single integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationOptions {
    pub method: Method,
    pub rtol: f64,
    pub atol: f64,
    pub pcoeff: f64,
    pub icoeff: f64,
    pub dcoeff: f64,
    /// Initial step size, chosen from the problem when `None`
    pub dt0: Option<f64>,
    /// Maximum number of attempted steps, rejected ones included
    pub max_steps: usize,
}

impl Default for IntegrationOptions {
    fn default() -> Self {
        IntegrationOptions {
            method: Method::Dopri5,
            rtol: 1e-6,
            atol: 1e-7,
            pcoeff: 0.0,
            icoeff: 1.0,
            dcoeff: 0.0,
            dt0: Some(0.1),
            max_steps: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Completed,
    /// The step budget ran out before the final time was reached
    Diverged { time: f64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub accepted: usize,
    pub rejected: usize,
    pub evaluations: usize,
}

/// States at the save times, indexed `[state][time]`
///
/// After divergence, every save time at or beyond the failing time holds `+inf`.
#[derive(Debug, Clone, PartialEq)]
pub struct Integration {
    pub ys: Vec<Vec<f64>>,
    pub outcome: Outcome,
    pub stats: Statistics,
}

impl Integration {
    pub fn diverged(&self) -> bool {
        matches!(self.outcome, Outcome::Diverged { .. })
    }
}

/// PID controller on the inverse of the scaled error
struct Controller {
    coeff1: f64,
    coeff2: f64,
    coeff3: f64,
    prev: f64,
    prev_prev: f64,
}

impl Controller {
    fn new(options: &IntegrationOptions, error_order: f64) -> Self {
        let (p, i, d) = (options.pcoeff, options.icoeff, options.dcoeff);
        Controller {
            coeff1: (i + p + d) / error_order,
            coeff2: -(p + 2.0 * d) / error_order,
            coeff3: d / error_order,
            prev: 1.0,
            prev_prev: 1.0,
        }
    }

    /// Step size factor for a scaled error, the history moves on accepted steps only
    fn factor(&mut self, error: f64, after_rejection: bool) -> (bool, f64) {
        if !error.is_finite() {
            return (false, FACTOR_MIN);
        }
        let accept = error <= 1.0;
        let inv = 1.0 / error.max(ERROR_FLOOR);
        let mut factor = SAFETY * inv.powf(self.coeff1);
        if self.coeff2 != 0.0 {
            factor *= self.prev.powf(self.coeff2);
        }
        if self.coeff3 != 0.0 {
            factor *= self.prev_prev.powf(self.coeff3);
        }
        let upper = if accept && !after_rejection {
            FACTOR_MAX
        } else {
            1.0
        };
        let factor = factor.clamp(FACTOR_MIN, upper);
        if accept {
            self.prev_prev = self.prev;
            self.prev = inv;
        }
        (accept, factor)
    }
}

fn error_norm(err: &[f64], y0: &[f64], y1: &[f64], options: &IntegrationOptions) -> f64 {
    if err.is_empty() {
        return 0.0;
    }
    let sum: f64 = err
        .iter()
        .zip(y0.iter().zip(y1))
        .map(|(e, (a, b))| {
            let scale = options.atol + options.rtol * a.abs().max(b.abs());
            (e / scale).powi(2)
        })
        .sum();
    (sum / err.len() as f64).sqrt()
}

fn rms(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    (v.iter().map(|x| x * x).sum::<f64>() / v.len() as f64).sqrt()
}

/// Initial step from the scale of the solution and its derivatives
fn initial_step<F>(
    f: &F,
    t0: f64,
    y0: &[f64],
    f0: &[f64],
    span: f64,
    options: &IntegrationOptions,
) -> f64
where
    F: Fn(f64, &[f64], &mut [f64]),
{
    let scale: Vec<f64> = y0.iter().map(|y| options.atol + options.rtol * y.abs()).collect();
    let scaled = |v: &[f64]| {
        let s: Vec<f64> = v.iter().zip(&scale).map(|(x, s)| x / s).collect();
        rms(&s)
    };
    let d0 = scaled(y0);
    let d1 = scaled(f0);
    let h0 = if d0 < 1e-5 || d1 < 1e-5 { 1e-6 } else { 0.01 * d0 / d1 };
    let h0 = h0.min(span);

    let y1: Vec<f64> = y0.iter().zip(f0).map(|(y, dy)| y + h0 * dy).collect();
    let mut f1 = vec![0.0; y0.len()];
    f(t0 + h0, &y1, &mut f1);
    let diff: Vec<f64> = f1.iter().zip(f0).map(|(a, b)| a - b).collect();
    let d2 = scaled(&diff) / h0;

    let order = options.method.tableau().error_order;
    let h1 = if d1.max(d2) <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(1.0 / order)
    };
    (100.0 * h0).min(h1).min(span)
}

fn left_of(t: f64) -> f64 {
    t - t.abs().max(1.0) * f64::EPSILON
}

fn hermite(theta: f64, h: f64, y0: f64, f0: f64, y1: f64, f1: f64) -> f64 {
    let t2 = theta * theta;
    let t3 = t2 * theta;
    (2.0 * t3 - 3.0 * t2 + 1.0) * y0
        + (t3 - 2.0 * t2 + theta) * h * f0
        + (-2.0 * t3 + 3.0 * t2) * y1
        + (t3 - t2) * h * f1
}

/// Integrate `dy/dt = f(t, y)` from the first to the last entry of `save_at`
///
/// `save_at` must be sorted. Steps land exactly on every entry of `jumps` that lies strictly
/// inside the integration range, and the derivative is evaluated afresh after each of them.
pub fn integrate<F>(
    f: F,
    y0: &[f64],
    save_at: &[f64],
    jumps: &[f64],
    options: &IntegrationOptions,
) -> Integration
where
    F: Fn(f64, &[f64], &mut [f64]),
{
    let n = y0.len();
    let nt = save_at.len();
    let mut ys = vec![vec![f64::INFINITY; nt]; n];
    let mut stats = Statistics::default();

    let (t_start, t_end) = match (save_at.first(), save_at.last()) {
        (Some(&a), Some(&b)) => (a, b),
        _ => {
            return Integration {
                ys,
                outcome: Outcome::Completed,
                stats,
            }
        }
    };

    let tableau = options.method.tableau();
    let stages = tableau.c.len();
    let mut controller = Controller::new(options, tableau.error_order);

    let mut stops: Vec<f64> = jumps
        .iter()
        .copied()
        .filter(|&j| j > t_start && j < t_end)
        .collect();
    stops.sort_by(|a, b| a.total_cmp(b));
    stops.dedup();
    let mut next_stop = 0;

    let mut t = t_start;
    let mut y = y0.to_vec();
    let mut k = vec![vec![0.0; n]; stages];
    f(t, &y, &mut k[0]);
    stats.evaluations += 1;

    let mut saved = 0;
    while saved < nt && save_at[saved] <= t {
        for (i, yi) in y.iter().enumerate() {
            ys[i][saved] = *yi;
        }
        saved += 1;
    }

    let span = t_end - t_start;
    let mut h = match options.dt0 {
        Some(dt0) if dt0 > 0.0 => dt0.min(span),
        _ => {
            stats.evaluations += 1;
            initial_step(&f, t, &y, &k[0], span, options)
        }
    };

    let mut ytmp = vec![0.0; n];
    let mut y1 = vec![0.0; n];
    let mut err = vec![0.0; n];
    let mut f1 = vec![0.0; n];
    let mut after_rejection = false;
    let mut steps = 0;

    while t < t_end {
        if steps >= options.max_steps {
            return Integration {
                ys,
                outcome: Outcome::Diverged { time: t },
                stats,
            };
        }
        steps += 1;

        let stop = stops.get(next_stop).copied().unwrap_or(t_end);
        let clipped = t + h >= stop;
        let h_step = if clipped { stop - t } else { h };
        // stages of a step ending on a jump see the left limit of the right-hand side
        let t_stage_max = if clipped && stop < t_end {
            left_of(stop)
        } else {
            f64::INFINITY
        };

        for s in 1..stages {
            let (done, rest) = k.split_at_mut(s);
            for i in 0..n {
                let incr: f64 = tableau.a[s]
                    .iter()
                    .zip(done.iter())
                    .map(|(a, ks)| a * ks[i])
                    .sum();
                ytmp[i] = y[i] + h_step * incr;
            }
            let ts = (t + tableau.c[s] * h_step).min(t_stage_max);
            f(ts, &ytmp, &mut rest[0]);
            stats.evaluations += 1;
        }
        for i in 0..n {
            let mut sol = 0.0;
            let mut est = 0.0;
            for s in 0..stages {
                sol += tableau.b[s] * k[s][i];
                est += tableau.e[s] * k[s][i];
            }
            y1[i] = y[i] + h_step * sol;
            err[i] = h_step * est;
        }

        let error = error_norm(&err, &y, &y1, options);
        let (accept, factor) = controller.factor(error, after_rejection);

        if !accept {
            stats.rejected += 1;
            after_rejection = true;
            h = h_step * factor;
            continue;
        }
        stats.accepted += 1;
        after_rejection = false;

        let t_new = if clipped { stop } else { t + h_step };
        let at_jump = clipped && stop < t_end;

        if tableau.fsal {
            f1.copy_from_slice(&k[stages - 1]);
        } else {
            f(t_new, &y1, &mut f1);
            stats.evaluations += 1;
        }

        while saved < nt && save_at[saved] <= t_new {
            let ts = save_at[saved];
            for i in 0..n {
                ys[i][saved] = if ts == t_new {
                    y1[i]
                } else {
                    let theta = (ts - t) / h_step;
                    hermite(theta, h_step, y[i], k[0][i], y1[i], f1[i])
                };
            }
            saved += 1;
        }

        t = t_new;
        y.copy_from_slice(&y1);
        if at_jump {
            next_stop += 1;
            // the forcing may be discontinuous in its derivative here
            f(t, &y, &mut k[0]);
            stats.evaluations += 1;
        } else {
            k[0].copy_from_slice(&f1);
        }

        let proposal = h_step * factor;
        h = if clipped { proposal.max(h) } else { proposal };
    }

    Integration {
        ys,
        outcome: Outcome::Completed,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid(n: usize, dt: f64) -> Vec<f64> {
        (0..n).map(|i| i as f64 * dt).collect()
    }

    fn decay(t_end: usize, method: Method) -> Integration {
        let options = IntegrationOptions {
            method,
            ..Default::default()
        };
        integrate(
            |_t, y, dy| dy[0] = -0.5 * y[0],
            &[2.0],
            &grid(t_end, 1.0),
            &[],
            &options,
        )
    }

    #[test]
    fn test_exponential_decay_all_methods() {
        for method in [Method::Dopri5, Method::Tsit5, Method::Bosh3, Method::Heun] {
            let result = decay(11, method);
            assert_eq!(result.outcome, Outcome::Completed);
            for (i, y) in result.ys[0].iter().enumerate() {
                let exact = 2.0 * (-0.5 * i as f64).exp();
                assert_relative_eq!(*y, exact, max_relative = 1e-3, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_first_save_is_initial_value() {
        let result = decay(5, Method::Dopri5);
        assert_eq!(result.ys[0][0], 2.0);
    }

    #[test]
    fn test_budget_exhaustion_fills_infinity() {
        let options = IntegrationOptions {
            max_steps: 10,
            ..Default::default()
        };
        let result = integrate(
            |_t, y, dy| dy[0] = -500.0 * y[0],
            &[1.0],
            &grid(100, 1.0),
            &[],
            &options,
        );
        assert!(result.diverged());
        assert!(result.ys[0].iter().any(|y| y.is_infinite()));
        assert!(result.ys[0][0].is_finite());
        assert_eq!(result.stats.accepted + result.stats.rejected, 10);
    }

    #[test]
    fn test_steps_land_on_jumps() {
        // piecewise constant input switching off at t = 2.5
        let options = IntegrationOptions::default();
        let result = integrate(
            |t, _y, dy| dy[0] = if t < 2.5 { 1.0 } else { 0.0 },
            &[0.0],
            &grid(6, 1.0),
            &[2.5],
            &options,
        );
        assert_eq!(result.outcome, Outcome::Completed);
        assert_relative_eq!(result.ys[0][2], 2.0, epsilon = 1e-9);
        assert_relative_eq!(result.ys[0][5], 2.5, epsilon = 1e-9);
    }

    #[test]
    fn test_automatic_initial_step() {
        let options = IntegrationOptions {
            dt0: None,
            ..Default::default()
        };
        let result = integrate(
            |_t, y, dy| {
                dy[0] = y[1];
                dy[1] = -y[0];
            },
            &[0.0, 1.0],
            &grid(4, 0.5),
            &[],
            &options,
        );
        assert_relative_eq!(result.ys[0][3], 1.5f64.sin(), max_relative = 1e-4);
        assert_relative_eq!(result.ys[1][3], 1.5f64.cos(), max_relative = 1e-4);
    }

    #[test]
    fn test_method_from_str() {
        assert_eq!("tsit5".parse::<Method>().unwrap(), Method::Tsit5);
        assert_eq!("Dopri5".parse::<Method>().unwrap(), Method::Dopri5);
        assert!(matches!(
            "Kvaerno5".parse::<Method>(),
            Err(SimulationError::UnknownIdentifier { .. })
        ));
    }
}
