//! Yaw-rate based oversteer/understeer classification over a whole lap.
//!
//! Channels are smoothed with a centered moving average about
//! `smoothing_window_s` wide. The yaw rate the car should have at the
//! current speed and lateral acceleration is compared with the measured
//! one; a relative excess is oversteer, a relative shortfall understeer.

use ndarray::Array1;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::telemetry::TelemetryTable;
use crate::{HandlingThresholds, Params};

const KMH_TO_MS: f64 = 1000.0 / 3600.0;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandlingCounts {
    pub oversteer: usize,
    pub understeer: usize,
}

#[derive(Clone, Debug)]
pub struct HandlingTrace {
    pub window: usize,
    pub speed_ms: Array1<f64>,
    pub lat_g: Array1<f64>,
    pub yaw_rate: Array1<f64>,
    pub throttle: Array1<f64>,
    pub brake: Array1<f64>,
    pub steering: Array1<f64>,
    pub expected_yaw: Array1<f64>,
    pub yaw_error: Array1<f64>,
    pub rel_yaw_error: Array1<f64>,
    pub oversteer: Vec<bool>,
    pub understeer: Vec<bool>,
}

impl HandlingTrace {
    pub fn compute(table: &TelemetryTable, params: &Params) -> Self {
        let th = &params.handling;
        let time = table.time().to_vec();
        let window = smoothing_window(&time, th);

        let speed_ms = rolling_mean(&table.speed().mapv(|v| v * KMH_TO_MS), window);
        let yaw_raw = if params.yaw_rate_in_degrees {
            table.yaw_rate().mapv(f64::to_radians)
        } else {
            table.yaw_rate().clone()
        };
        let yaw_rate = rolling_mean(&yaw_raw, window);
        let lat_g = rolling_mean(table.lat_g(), window);
        let throttle = rolling_mean(table.throttle(), window);
        let brake = rolling_mean(table.brake(), window);
        let steering = rolling_mean(table.steering(), window);

        let expected_yaw = Array1::from_iter(
            lat_g
                .iter()
                .zip(speed_ms.iter())
                .map(|(&g, &v)| g / (v.abs() + th.speed_eps)),
        );
        let yaw_error = &yaw_rate - &expected_yaw;
        let rel_yaw_error = Array1::from_iter(
            yaw_error
                .iter()
                .zip(expected_yaw.iter())
                .map(|(&err, &exp)| err / (exp.abs() + th.yaw_eps)),
        );

        let n = table.len();
        let mut oversteer = Vec::with_capacity(n);
        let mut understeer = Vec::with_capacity(n);
        for i in 0..n {
            let (over, under) = classify(lat_g[i], yaw_rate[i], rel_yaw_error[i], th);
            oversteer.push(over);
            understeer.push(under);
        }

        let trace = Self {
            window,
            speed_ms,
            lat_g,
            yaw_rate,
            throttle,
            brake,
            steering,
            expected_yaw,
            yaw_error,
            rel_yaw_error,
            oversteer,
            understeer,
        };
        let counts = trace.counts();
        debug!(
            "{}: handling window {} samples, {} oversteer / {} understeer",
            table.origin, window, counts.oversteer, counts.understeer
        );
        trace
    }

    pub fn len(&self) -> usize {
        self.oversteer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oversteer.is_empty()
    }

    pub fn counts(&self) -> HandlingCounts {
        HandlingCounts {
            oversteer: self.oversteer.iter().filter(|&&f| f).count(),
            understeer: self.understeer.iter().filter(|&&f| f).count(),
        }
    }

    pub fn counts_in(&self, rows: &[usize]) -> HandlingCounts {
        HandlingCounts {
            oversteer: rows.iter().filter(|&&r| self.oversteer[r]).count(),
            understeer: rows.iter().filter(|&&r| self.understeer[r]).count(),
        }
    }
}

/// Per-sample flags `(oversteer, understeer)`. NaN inputs never flag.
pub fn classify(lat_g: f64, yaw_rate: f64, rel_yaw_error: f64, th: &HandlingThresholds) -> (bool, bool) {
    let in_corner = lat_g.abs() > th.lat_g_min;
    let rotating = yaw_rate.abs() > th.abs_yaw_rate;
    let over = in_corner && rotating && rel_yaw_error > th.rel_yaw_error;
    let under = in_corner && rotating && rel_yaw_error < -th.rel_yaw_error;
    (over, under)
}

/// Window width in samples: the configured duration over the median time
/// step, never below `min_window`.
pub fn smoothing_window(time: &[f64], th: &HandlingThresholds) -> usize {
    let mut steps: Vec<f64> = time
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|dt| dt.is_finite())
        .collect();
    if steps.is_empty() {
        return th.min_window;
    }
    steps.sort_by_key(|&dt| OrderedFloat(dt));
    let mid = steps.len() / 2;
    let median = if steps.len() % 2 == 0 {
        (steps[mid - 1] + steps[mid]) / 2.0
    } else {
        steps[mid]
    };
    if median <= 0.0 {
        return th.min_window;
    }
    let window = (th.smoothing_window_s / median).round();
    if window.is_finite() {
        (window as usize).max(th.min_window)
    } else {
        th.min_window
    }
}

/// Centered moving average that shrinks at the edges and skips NaN. Even
/// widths reach one sample further back than forward.
pub fn rolling_mean(data: &Array1<f64>, window: usize) -> Array1<f64> {
    let window = window.max(1);
    let before = window / 2;
    let after = (window - 1) / 2;
    let n = data.len();
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let start = i.saturating_sub(before);
        let end = (i + after + 1).min(n);
        let (sum, count) = data
            .slice(ndarray::s![start..end])
            .iter()
            .filter(|v| !v.is_nan())
            .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
        out.push(if count == 0 { f64::NAN } else { sum / count as f64 });
    }
    Array1::from_vec(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetrySample;

    fn steady(n: i64, speed_kmh: f64, lat_g: f64, yaw: f64) -> TelemetryTable {
        let samples: Vec<TelemetrySample> = (0..n)
            .map(|d| TelemetrySample {
                distance: d,
                time: d as f64 * 0.05,
                speed: speed_kmh,
                throttle: 50.0,
                brake: 0.0,
                steering: 20.0,
                lat_g,
                long_g: 0.0,
                yaw_rate: yaw,
            })
            .collect();
        TelemetryTable::from_samples("steady", &samples).unwrap()
    }

    fn radians() -> Params {
        Params {
            yaw_rate_in_degrees: false,
            ..Params::default()
        }
    }

    #[test]
    fn window_from_median_step() {
        let th = HandlingThresholds::default();
        let fast: Vec<f64> = (0..50).map(|i| i as f64 * 0.01).collect();
        assert_eq!(smoothing_window(&fast, &th), 10);
        let slow: Vec<f64> = (0..50).map(|i| i as f64 * 0.05).collect();
        assert_eq!(smoothing_window(&slow, &th), 3);
        assert_eq!(smoothing_window(&[0.0, 0.0, 0.0], &th), 3);
        assert_eq!(smoothing_window(&[], &th), 3);
    }

    #[test]
    fn centered_mean_shrinks_at_edges() {
        let data = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(rolling_mean(&data, 3).to_vec(), vec![1.5, 2.0, 3.0, 4.0, 4.5]);
        assert_eq!(rolling_mean(&data, 4).to_vec(), vec![1.5, 2.0, 2.5, 3.5, 4.0]);
    }

    #[test]
    fn rotation_beyond_prediction_is_oversteer() {
        // 20 m/s and 2 g predict 0.1 rad/s; the car yaws at 0.4
        let trace = HandlingTrace::compute(&steady(40, 72.0, 2.0, 0.4), &radians());
        assert!(trace.oversteer.iter().all(|&f| f));
        assert!(trace.understeer.iter().all(|&f| !f));
        assert_eq!(trace.counts().oversteer, 40);
    }

    #[test]
    fn rotation_short_of_prediction_is_understeer() {
        // 10 m/s and 5 g predict 0.5 rad/s; the car yaws at 0.35
        let trace = HandlingTrace::compute(&steady(40, 36.0, 5.0, 0.35), &radians());
        assert!(trace.understeer.iter().all(|&f| f));
        assert_eq!(trace.counts_in(&[0, 1, 2]).understeer, 3);
        assert_eq!(trace.counts().oversteer, 0);
    }

    #[test]
    fn straight_line_is_neutral() {
        let trace = HandlingTrace::compute(&steady(40, 200.0, 0.2, 0.4), &radians());
        assert_eq!(trace.counts(), HandlingCounts::default());
    }

    #[test]
    fn yaw_in_degrees_is_converted() {
        let degrees = 0.4_f64.to_degrees();
        let trace = HandlingTrace::compute(&steady(10, 72.0, 2.0, degrees), &Params::default());
        assert!((trace.yaw_rate[5] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn flags_are_mutually_exclusive() {
        let samples: Vec<TelemetrySample> = (0..500)
            .map(|d| {
                let x = d as f64;
                TelemetrySample {
                    distance: d,
                    time: x * 0.03,
                    speed: 60.0 + 80.0 * (x * 0.013).sin().abs(),
                    throttle: 0.0,
                    brake: 0.0,
                    steering: 0.0,
                    lat_g: 3.0 * (x * 0.1).sin(),
                    long_g: 0.0,
                    yaw_rate: 60.0 * (x * 0.37).sin(),
                }
            })
            .collect();
        let table = TelemetryTable::from_samples("wavy", &samples).unwrap();
        let trace = HandlingTrace::compute(&table, &Params::default());
        assert!(trace
            .oversteer
            .iter()
            .zip(&trace.understeer)
            .all(|(&o, &u)| !(o && u)));
    }
}
