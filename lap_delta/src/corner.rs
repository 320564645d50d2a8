//! Kinematic and driver-input features of one corner.

use serde::{Deserialize, Serialize};

use crate::align::LapSlice;
use crate::handling::HandlingCounts;
use crate::telemetry::TelemetryTable;
use crate::track_map::Corner;
use crate::{LapError, Params, SliceKind, Stats};

/// Span of the trail-braking run inside a corner. Zero when the driver
/// never trail-braked.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TrailBrake {
    pub delta_s: f64,
    pub delta_m: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Oversteer,
    Understeer,
    Neutral,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CornerBalance {
    pub oversteer_samples: usize,
    pub understeer_samples: usize,
    pub verdict: Verdict,
}

impl CornerBalance {
    pub fn from_counts(counts: HandlingCounts) -> Self {
        let verdict = if counts.oversteer > counts.understeer {
            Verdict::Oversteer
        } else if counts.understeer > counts.oversteer {
            Verdict::Understeer
        } else {
            Verdict::Neutral
        };
        Self {
            oversteer_samples: counts.oversteer,
            understeer_samples: counts.understeer,
            verdict,
        }
    }
}

/// Features of one corner on one lap. Speeds are in the recording's unit
/// (km/h for MoTeC), distances in meters, times in seconds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CornerMetrics {
    pub corner: Corner,
    pub samples: usize,
    pub entry_speed: f64,
    pub apex_speed: f64,
    pub exit_speed: f64,
    pub speed: Stats,
    pub min_speed_m: Option<i64>,
    pub lat_g: Stats,
    pub long_g: Stats,
    pub steering: Stats,
    pub max_steering_m: Option<i64>,
    pub brake: Stats,
    pub throttle: Stats,
    pub brake_point_m: Option<i64>,
    pub full_brake_point_m: Option<i64>,
    pub trail_brake: TrailBrake,
    pub full_throttle_s: f64,
    pub full_brake_s: f64,
    pub coast_s: f64,
    pub coast_m: f64,
    pub time_delta_s: f64,
    pub balance: Option<CornerBalance>,
}

impl CornerMetrics {
    /// A copy carrying the handling balance observed over this corner.
    pub fn with_balance(self, balance: CornerBalance) -> Self {
        Self {
            balance: Some(balance),
            ..self
        }
    }
}

/// Compute the features of `corner` from the rows attributed to it.
pub fn extract(slice: &LapSlice<'_>, corner: &Corner, params: &Params) -> Result<CornerMetrics, LapError> {
    if slice.is_empty() {
        return Err(LapError::EmptySlice {
            kind: SliceKind::Corner,
            id: corner.id,
        });
    }
    let table = slice.table().telemetry();
    let rows = slice.rows();
    let distance = table.distance();
    let speed = table.speed();

    let first = rows[0];
    let last = rows[rows.len() - 1];

    let apex_row = rows
        .iter()
        .copied()
        .find(|&r| corner.apex_m.fract() == 0.0 && distance[r] as f64 == corner.apex_m)
        .ok_or(LapError::ApexNotFound {
            corner_id: corner.id,
            apex_m: corner.apex_m,
        })?;

    let speed_stats = Stats::of(slice.values(speed));
    let steering_stats = Stats::of(slice.values(table.steering()));
    let min_speed_m = distance_where(slice, speed, speed_stats.min);
    let max_steering_m = distance_where(slice, table.steering(), steering_stats.max);

    let brake = slice.collect(table.brake());
    let bt = &params.brake;
    let brake_point_m = first_brake_edge(&brake, bt.release_below, bt.detect).map(|i| slice.distance_at(i));
    let full_brake_point_m =
        first_brake_edge(&brake, bt.release_below, bt.committed).map(|i| slice.distance_at(i));

    let trail_brake = trail_brake_window(&brake, bt.trail_band)
        .map(|(a, b)| TrailBrake {
            delta_s: table.time()[rows[b]] - table.time()[rows[a]],
            delta_m: (slice.distance_at(b) - slice.distance_at(a)) as f64,
        })
        .unwrap_or_default();

    let full = params.full_input_pct;
    let coast = params.coast_input_pct;
    let (full_throttle_s, _) = dwell(slice, |r| table.throttle()[r] >= full);
    let (full_brake_s, _) = dwell(slice, |r| table.brake()[r] >= full);
    let (coast_s, coast_m) = dwell(slice, |r| table.throttle()[r] < coast && table.brake()[r] < coast);

    let time_delta_s = boundary_time_delta(table, corner.start_m, corner.end_m, SliceKind::Corner, corner.id)?;

    Ok(CornerMetrics {
        corner: corner.clone(),
        samples: rows.len(),
        entry_speed: speed[first],
        apex_speed: speed[apex_row],
        exit_speed: speed[last],
        speed: speed_stats,
        min_speed_m,
        lat_g: Stats::of(slice.values(table.lat_g())),
        long_g: Stats::of(slice.values(table.long_g())),
        steering: steering_stats,
        max_steering_m,
        brake: Stats::of(brake.iter().copied()),
        throttle: Stats::of(slice.values(table.throttle())),
        brake_point_m,
        full_brake_point_m,
        trail_brake,
        full_throttle_s,
        full_brake_s,
        coast_s,
        coast_m,
        time_delta_s,
        balance: None,
    })
}

/// Time at `end_m` minus time at `start_m`, both looked up by exact distance
/// in the full table.
pub fn boundary_time_delta(
    table: &TelemetryTable,
    start_m: f64,
    end_m: f64,
    kind: SliceKind,
    id: u32,
) -> Result<f64, LapError> {
    let lookup = |distance_m: f64| {
        table.index_of(distance_m).ok_or(LapError::BoundaryNotFound {
            kind,
            id,
            distance_m,
        })
    };
    let start = lookup(start_m)?;
    let end = lookup(end_m)?;
    Ok(table.time()[end] - table.time()[start])
}

/// Indices where the previous sample was below `release_below` and the
/// current one reaches `threshold`. The first sample has no predecessor and
/// never qualifies.
pub fn brake_edges(brake: &[f64], release_below: f64, threshold: f64) -> impl Iterator<Item = usize> + '_ {
    (1..brake.len()).filter(move |&i| brake[i - 1] < release_below && brake[i] >= threshold)
}

pub fn first_brake_edge(brake: &[f64], release_below: f64, threshold: f64) -> Option<usize> {
    brake_edges(brake, release_below, threshold).next()
}

/// Longest run of samples with `0 < brake < band` that has at least one
/// interior sample, i.e. one whose neighbors are both inside the band.
/// Returns inclusive bounds; ties go to the earlier run.
pub fn trail_brake_window(brake: &[f64], band: f64) -> Option<(usize, usize)> {
    let in_band = |v: f64| v > 0.0 && v < band;
    let mut best: Option<(usize, usize)> = None;
    let mut i = 0;
    while i < brake.len() {
        if !in_band(brake[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i + 1 < brake.len() && in_band(brake[i + 1]) {
            i += 1;
        }
        let end = i;
        if end - start >= 2 && best.map_or(true, |(a, b)| end - start > b - a) {
            best = Some((start, end));
        }
        i += 1;
    }
    best
}

/// Time and distance covered after each qualifying sample, up to the next
/// sample of the slice.
fn dwell(slice: &LapSlice<'_>, qualifies: impl Fn(usize) -> bool) -> (f64, f64) {
    let table = slice.table().telemetry();
    let time = table.time();
    let distance = table.distance();
    slice
        .rows()
        .windows(2)
        .filter(|w| qualifies(w[0]))
        .fold((0.0, 0.0), |(s, m), w| {
            let dt = time[w[1]] - time[w[0]];
            let dm = (distance[w[1]] - distance[w[0]]) as f64;
            (s + if dt.is_nan() { 0.0 } else { dt }, m + dm)
        })
}

fn distance_where(slice: &LapSlice<'_>, column: &ndarray::Array1<f64>, value: f64) -> Option<i64> {
    let distance = slice.table().telemetry().distance();
    slice
        .rows()
        .iter()
        .find(|&&r| column[r] == value)
        .map(|&r| distance[r])
}
