//! Per-segment aggregation and whole-lap analysis.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::align::{AlignedTable, LapSlice};
use crate::corner::{boundary_time_delta, extract, CornerMetrics};
use crate::track_map::{Corner, Segment};
use crate::{round_to, CornerFaultPolicy, LapError, Params, SliceKind, Stats};

/// A corner whose extraction failed and was skipped.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CornerFault {
    pub segment_id: u32,
    pub corner_id: u32,
    pub corner_name: String,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SegmentMetrics {
    pub segment: Segment,
    pub samples: usize,
    pub throttle: Stats,
    pub brake: Stats,
    pub speed: Stats,
    pub time_delta_s: f64,
    pub corners: Vec<CornerMetrics>,
    pub faults: Vec<CornerFault>,
}

/// Aggregate one segment and extract each of its corners, in corner-id
/// order. `corners` are the corners contained in `segment`; each is
/// extracted from its rows inside `slice`.
pub fn aggregate(
    slice: &LapSlice<'_>,
    segment: &Segment,
    corners: &[Corner],
    params: &Params,
) -> Result<SegmentMetrics, LapError> {
    if slice.is_empty() {
        return Err(LapError::EmptySlice {
            kind: SliceKind::Segment,
            id: segment.id,
        });
    }
    let table = slice.table().telemetry();
    let time_delta_s = boundary_time_delta(
        table,
        segment.start_m,
        segment.end_m,
        SliceKind::Segment,
        segment.id,
    )?;

    let mut ordered: Vec<&Corner> = corners.iter().collect();
    ordered.sort_by_key(|c| c.id);

    let mut metrics = Vec::with_capacity(ordered.len());
    let mut faults = Vec::new();
    for corner in ordered {
        let corner_slice = slice.filter_corner(corner.id);
        match extract(&corner_slice, corner, params) {
            Ok(m) => metrics.push(m),
            Err(err) if params.fault_policy == CornerFaultPolicy::Skip => {
                warn!(
                    "{}: skipping corner {} ({}) in segment {}: {}",
                    table.origin, corner.id, corner.name, segment.id, err
                );
                faults.push(CornerFault {
                    segment_id: segment.id,
                    corner_id: corner.id,
                    corner_name: corner.name.clone(),
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }

    Ok(SegmentMetrics {
        segment: segment.clone(),
        samples: slice.len(),
        throttle: Stats::of(slice.values(table.throttle())),
        brake: Stats::of(slice.values(table.brake())),
        speed: Stats::of(slice.values(table.speed())),
        time_delta_s,
        corners: metrics,
        faults,
    })
}

/// Aggregate every segment of the lap's track map, ordered by segment id.
pub fn analyze_lap(table: &AlignedTable, params: &Params) -> Result<Vec<SegmentMetrics>, LapError> {
    let mut segments: Vec<&Segment> = table.segments().iter().collect();
    segments.sort_by_key(|s| s.id);
    let mut out = Vec::with_capacity(segments.len());
    for segment in segments {
        let slice = table.segment_slice(segment.id);
        let corners: Vec<Corner> = table.corners_in(segment).into_iter().cloned().collect();
        let metrics = aggregate(&slice, segment, &corners, params)?;
        debug!(
            "{}: segment {} ({}) {:.3} s, {} corners",
            table.telemetry().origin,
            segment.id,
            segment.name,
            metrics.time_delta_s,
            metrics.corners.len()
        );
        out.push(metrics);
    }
    Ok(out)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CornerReport {
    pub id: u32,
    pub name: String,
    pub entry_speed: f64,
    pub apex_speed: f64,
    pub exit_speed: f64,
    pub min_speed: f64,
    pub brake_point_m: Option<i64>,
    pub trail_brake_s: f64,
    pub time_delta_s: f64,
}

/// Rounded presentation form of [`SegmentMetrics`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SegmentReport {
    pub id: u32,
    pub name: String,
    pub start_m: f64,
    pub end_m: f64,
    pub length_m: f64,
    pub avg_throttle: f64,
    pub avg_brake: f64,
    pub avg_speed: f64,
    pub top_speed: f64,
    pub min_speed: f64,
    pub time_delta_s: f64,
    pub corners: Vec<CornerReport>,
}

impl SegmentMetrics {
    pub fn report(&self, precision: u32) -> SegmentReport {
        let r = |v: f64| round_to(v, precision);
        SegmentReport {
            id: self.segment.id,
            name: self.segment.name.clone(),
            start_m: self.segment.start_m,
            end_m: self.segment.end_m,
            length_m: self.segment.end_m - self.segment.start_m,
            avg_throttle: r(self.throttle.mean),
            avg_brake: r(self.brake.mean),
            avg_speed: r(self.speed.mean),
            top_speed: r(self.speed.max),
            min_speed: r(self.speed.min),
            time_delta_s: r(self.time_delta_s),
            corners: self
                .corners
                .iter()
                .map(|c| CornerReport {
                    id: c.corner.id,
                    name: c.corner.name.clone(),
                    entry_speed: r(c.entry_speed),
                    apex_speed: r(c.apex_speed),
                    exit_speed: r(c.exit_speed),
                    min_speed: r(c.speed.min),
                    brake_point_m: c.brake_point_m,
                    trail_brake_s: r(c.trail_brake.delta_s),
                    time_delta_s: r(c.time_delta_s),
                })
                .collect(),
        }
    }
}
