//! Distance-domain lap telemetry pipeline.
//!
//! Raw MoTeC CSV exports are resampled onto a uniform distance grid, joined
//! against a track map (segments and corners), reduced to per-corner and
//! per-segment metrics, and finally compared between a reference lap and a
//! driven lap.

use std::fmt;
use std::path::PathBuf;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod align;
pub mod compare;
pub mod corner;
pub mod handling;
pub mod segment;
pub mod telemetry;
pub mod track_map;

pub use align::{align, AlignedTable, LapSlice};
pub use compare::{compare, CornerDelta, LapComparison, SegmentDelta};
pub use corner::{extract, CornerBalance, CornerMetrics, Verdict};
pub use handling::{HandlingCounts, HandlingTrace};
pub use segment::{aggregate, analyze_lap, CornerFault, SegmentMetrics, SegmentReport};
pub use telemetry::{load, parse_telemetry, LapMetadata, TelemetrySample, TelemetryTable};
pub use track_map::{
    validate, validate_segments, Corner, Segment, TrackMap, TrackMapCache, TrackMapPaths,
    ValidationIssue, ValidationReport,
};

#[derive(Error, Debug)]
pub enum LapError {
    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("failed to load telemetry from {origin}: {reason}")]
    Load { origin: String, reason: String },
    #[error("telemetry from {origin} has no `{column}` column")]
    MissingColumn { origin: String, column: String },
    #[error("no samples for {kind} {id}")]
    EmptySlice { kind: SliceKind, id: u32 },
    #[error("corner {corner_id}: no sample at apex distance {apex_m} m")]
    ApexNotFound { corner_id: u32, apex_m: f64 },
    #[error("{kind} {id}: no sample at boundary distance {distance_m} m")]
    BoundaryNotFound {
        kind: SliceKind,
        id: u32,
        distance_m: f64,
    },
    #[error("laps are on different tracks: record has {record_segments} segments, user has {user_segments}")]
    TrackMismatch {
        record_segments: usize,
        user_segments: usize,
    },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("{lap} lap: {source}")]
    Lap {
        lap: String,
        #[source]
        source: Box<LapError>,
    },
}

impl LapError {
    /// Tag an error with the lap it came from.
    pub fn in_lap(self, lap: impl Into<String>) -> Self {
        LapError::Lap {
            lap: lap.into(),
            source: Box::new(self),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SliceKind {
    Segment,
    Corner,
}

impl fmt::Display for SliceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SliceKind::Segment => f.write_str("segment"),
            SliceKind::Corner => f.write_str("corner"),
        }
    }
}

/// What the segment aggregator does when one corner cannot be extracted.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CornerFaultPolicy {
    Skip,
    Abort,
}

impl Default for CornerFaultPolicy {
    fn default() -> Self {
        CornerFaultPolicy::Skip
    }
}

/// Column names of the channels the pipeline reads from a recording.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelNames {
    pub distance: String,
    pub time: String,
    pub speed: String,
    pub throttle: String,
    pub brake: String,
    pub steering: String,
    pub lat_g: String,
    pub long_g: String,
    pub yaw_rate: String,
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self {
            distance: "Distance".to_string(),
            time: "Time".to_string(),
            speed: "SPEED".to_string(),
            throttle: "THROTTLE".to_string(),
            brake: "BRAKE".to_string(),
            steering: "STEERANGLE".to_string(),
            lat_g: "G_LAT".to_string(),
            long_g: "G_LON".to_string(),
            yaw_rate: "ROTY".to_string(),
        }
    }
}

impl ChannelNames {
    /// Every channel a recording must carry, distance first.
    pub fn required(&self) -> [&str; 9] {
        [
            self.distance.as_str(),
            self.time.as_str(),
            self.speed.as_str(),
            self.throttle.as_str(),
            self.brake.as_str(),
            self.steering.as_str(),
            self.lat_g.as_str(),
            self.long_g.as_str(),
            self.yaw_rate.as_str(),
        ]
    }
}

/// Brake-channel thresholds, all in percent of pedal travel.
///
/// `detect` locates the brake point, `committed` classifies a fully
/// committed stop. Both share `release_below` as the "was not braking"
/// condition on the previous sample.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrakeThresholds {
    pub release_below: f64,
    pub detect: f64,
    pub committed: f64,
    pub trail_band: f64,
}

impl Default for BrakeThresholds {
    fn default() -> Self {
        Self {
            release_below: 99.0,
            detect: 70.0,
            committed: 99.0,
            trail_band: 15.0,
        }
    }
}

/// Policy constants of the yaw-rate based balance classifier.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HandlingThresholds {
    pub lat_g_min: f64,
    pub rel_yaw_error: f64,
    pub abs_yaw_rate: f64,
    pub smoothing_window_s: f64,
    pub min_window: usize,
    pub speed_eps: f64,
    pub yaw_eps: f64,
}

impl Default for HandlingThresholds {
    fn default() -> Self {
        Self {
            lat_g_min: 1.5,
            rel_yaw_error: 0.25,
            abs_yaw_rate: 0.3,
            smoothing_window_s: 0.1,
            min_window: 3,
            speed_eps: 1e-6,
            yaw_eps: 1e-3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Params {
    pub header_lines: usize,
    pub step_m: u32,
    pub channels: ChannelNames,
    pub yaw_rate_in_degrees: bool,
    pub brake: BrakeThresholds,
    pub full_input_pct: f64,
    pub coast_input_pct: f64,
    pub handling: HandlingThresholds,
    pub fault_policy: CornerFaultPolicy,
    pub precision: u32,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            header_lines: 14,
            step_m: 1,
            channels: ChannelNames::default(),
            yaw_rate_in_degrees: true,
            brake: BrakeThresholds::default(),
            full_input_pct: 95.0,
            coast_input_pct: 1.0,
            handling: HandlingThresholds::default(),
            fault_policy: CornerFaultPolicy::Skip,
            precision: 3,
        }
    }
}

impl Params {
    pub fn check(&self) -> Result<(), LapError> {
        if self.step_m == 0 {
            return Err(LapError::InvalidParameter("step_m must be positive".into()));
        }
        if self.brake.detect > self.brake.committed {
            return Err(LapError::InvalidParameter(format!(
                "brake detect threshold {} exceeds committed threshold {}",
                self.brake.detect, self.brake.committed
            )));
        }
        if self.handling.rel_yaw_error < 0.0 {
            return Err(LapError::InvalidParameter(
                "rel_yaw_error must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// Round for presentation only.
pub fn round_to(value: f64, precision: u32) -> f64 {
    let scale = 10f64.powi(precision as i32);
    (value * scale).round() / scale
}

/// Summary statistics over the finite values of a channel.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Stats {
    pub mean: f64,
    pub max: f64,
    pub min: f64,
}

impl Stats {
    /// NaN entries are missing samples and are skipped. All fields are NaN
    /// when nothing finite remains.
    pub fn of<I: IntoIterator<Item = f64>>(values: I) -> Self {
        let mut sum = 0.0;
        let mut count = 0usize;
        let mut max: Option<OrderedFloat<f64>> = None;
        let mut min: Option<OrderedFloat<f64>> = None;
        for v in values.into_iter().filter(|v| !v.is_nan()) {
            sum += v;
            count += 1;
            let v = OrderedFloat(v);
            max = Some(max.map_or(v, |m| m.max(v)));
            min = Some(min.map_or(v, |m| m.min(v)));
        }
        Self {
            mean: if count == 0 { f64::NAN } else { sum / count as f64 },
            max: max.map_or(f64::NAN, |m| m.0),
            min: min.map_or(f64::NAN, |m| m.0),
        }
    }

    pub fn rounded(&self, precision: u32) -> Self {
        Self {
            mean: round_to(self.mean, precision),
            max: round_to(self.max, precision),
            min: round_to(self.min, precision),
        }
    }
}
