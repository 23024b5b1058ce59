//! ---
//! mgd_section: "03-forecasting"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Demand history buffers and Fourier projection."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::f64::consts::TAU;

/// How the fit period is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodSelection {
    /// Use a fixed period in samples.
    Fixed(usize),
    /// Scan for the dominant period; fall back to the given one when the
    /// history carries no usable periodicity.
    Detect { fallback: usize },
}

/// Forecaster tuning. Mirrors the `[forecast]` configuration section.
#[derive(Debug, Clone)]
pub struct ForecastParams {
    /// Histories shorter than this are flat-filled from the latest sample.
    pub min_samples: usize,
    /// Fourier terms K, clamped to 1..=2.
    pub terms: usize,
    pub period: PeriodSelection,
    /// Projection horizon in ticks.
    pub horizon: usize,
    /// Residual-variance window W.
    pub residual_window: usize,
}

impl Default for ForecastParams {
    fn default() -> Self {
        Self {
            min_samples: 32,
            terms: 2,
            period: PeriodSelection::Fixed(120),
            horizon: 10,
            residual_window: 64,
        }
    }
}

/// Projection for one node: `values[t-1]` is the demand expected at future
/// tick t, plus the residual variance of the fit.
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    pub values: Vec<f64>,
    pub variance: f64,
}

impl Forecast {
    /// The single-step projection consumed by the solver.
    pub fn next_tick(&self) -> f64 {
        self.values.first().copied().unwrap_or(0.0)
    }

    fn flat(level: f64, horizon: usize) -> Self {
        Self {
            values: vec![level.max(0.0); horizon],
            variance: 0.0,
        }
    }
}

struct FourierFit {
    a0: f64,
    /// (a_k, b_k) for k = 1..=K.
    terms: Vec<(f64, f64)>,
    period: f64,
}

impl FourierFit {
    fn eval(&self, index: f64) -> f64 {
        let mut value = self.a0;
        for (k, (a, b)) in self.terms.iter().enumerate() {
            let omega = TAU * (k as f64 + 1.0) * index / self.period;
            value += a * omega.cos() + b * omega.sin();
        }
        value
    }
}

fn fit(history: &[f64], period: usize, terms: usize) -> FourierFit {
    let n = history.len() as f64;
    let period = period.max(2) as f64;
    let a0 = history.iter().sum::<f64>() / n;
    let terms = (1..=terms.clamp(1, 2))
        .map(|k| {
            let mut a = 0.0;
            let mut b = 0.0;
            for (i, sample) in history.iter().enumerate() {
                let omega = TAU * k as f64 * i as f64 / period;
                a += sample * omega.cos();
                b += sample * omega.sin();
            }
            (2.0 * a / n, 2.0 * b / n)
        })
        .collect();
    FourierFit {
        a0,
        terms,
        period,
    }
}

/// Scan integer candidate periods for the strongest spectral response over
/// the mean-centered history. Returns None when fewer than eight samples are
/// available or the history is flat.
pub fn detect_dominant_period(history: &[f64]) -> Option<usize> {
    let n = history.len();
    if n < 8 {
        return None;
    }
    let mean = history.iter().sum::<f64>() / n as f64;
    let centered: Vec<f64> = history.iter().map(|s| s - mean).collect();
    if centered.iter().all(|s| s.abs() < 1e-12) {
        return None;
    }

    let mut best: Option<(usize, f64)> = None;
    for period in 4..=n / 2 {
        let mut re = 0.0;
        let mut im = 0.0;
        for (i, sample) in centered.iter().enumerate() {
            let omega = TAU * i as f64 / period as f64;
            re += sample * omega.cos();
            im += sample * omega.sin();
        }
        let power = re * re + im * im;
        match best {
            Some((_, best_power)) if power <= best_power => {}
            _ => best = Some((period, power)),
        }
    }
    best.map(|(period, _)| period)
}

/// Project a node's demand over the horizon.
///
/// Flat-fills from the latest sample below `min_samples`; otherwise fits up
/// to K Fourier terms over the history and continues the sample phase into
/// the future, clamped at zero.
pub fn forecast(history: &[f64], params: &ForecastParams) -> Forecast {
    let horizon = params.horizon.max(1);
    let n = history.len();
    if n < params.min_samples.max(2) {
        return Forecast::flat(history.last().copied().unwrap_or(0.0), horizon);
    }

    let period = match params.period {
        PeriodSelection::Fixed(period) => period,
        PeriodSelection::Detect { fallback } => {
            detect_dominant_period(history).unwrap_or(fallback)
        }
    };
    let fitted = fit(history, period, params.terms);

    let values = (1..=horizon)
        .map(|t| fitted.eval((n - 1 + t) as f64).max(0.0))
        .collect();

    let window = params.residual_window.max(1).min(n);
    let variance = history[n - window..]
        .iter()
        .enumerate()
        .map(|(offset, sample)| {
            let residual = sample - fitted.eval((n - window + offset) as f64);
            residual * residual
        })
        .sum::<f64>()
        / window as f64;

    Forecast { values, variance }
}
