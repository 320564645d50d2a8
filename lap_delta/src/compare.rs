//! Record-vs-user lap comparison.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::align::AlignedTable;
use crate::corner::{CornerBalance, CornerMetrics};
use crate::handling::{HandlingCounts, HandlingTrace};
use crate::segment::{analyze_lap, CornerFault, SegmentMetrics};
use crate::{LapError, Params};

pub const RECORD: &str = "record";
pub const USER: &str = "user";

/// Segment time of both laps; `delta_s` is user minus record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SegmentDelta {
    pub segment_id: u32,
    pub name: String,
    pub record_s: f64,
    pub user_s: f64,
    pub delta_s: f64,
}

/// Differences for one corner matched by id. All deltas are user minus
/// record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CornerDelta {
    pub corner_id: u32,
    pub name: String,
    pub record_brake_point_m: Option<i64>,
    pub user_brake_point_m: Option<i64>,
    pub brake_point_delta_m: Option<i64>,
    pub entry_speed_delta: f64,
    pub apex_speed_delta: f64,
    pub exit_speed_delta: f64,
    pub min_speed_delta: f64,
    pub time_delta_s: f64,
    pub record_balance: Option<CornerBalance>,
    pub user_balance: Option<CornerBalance>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LapComparison {
    pub record: Vec<SegmentMetrics>,
    pub user: Vec<SegmentMetrics>,
    pub segments: Vec<SegmentDelta>,
    pub corners: Vec<CornerDelta>,
    pub record_handling: HandlingCounts,
    pub user_handling: HandlingCounts,
}

impl LapComparison {
    /// Total lap time difference over all segments, user minus record.
    pub fn total_delta_s(&self) -> f64 {
        self.segments.iter().map(|s| s.delta_s).sum()
    }

    /// Skipped corners of both laps, labelled with the lap they came from.
    pub fn faults(&self) -> Vec<(&'static str, &CornerFault)> {
        let record = self.record.iter().flat_map(|s| &s.faults).map(|f| (RECORD, f));
        let user = self.user.iter().flat_map(|s| &s.faults).map(|f| (USER, f));
        record.chain(user).collect()
    }
}

/// Analyse both laps independently and pair segments and corners by id.
pub fn compare(record: &AlignedTable, user: &AlignedTable, params: &Params) -> Result<LapComparison, LapError> {
    params.check()?;
    let mismatch = || LapError::TrackMismatch {
        record_segments: record.segments().len(),
        user_segments: user.segments().len(),
    };
    if record.segments().len() != user.segments().len() {
        return Err(mismatch());
    }

    let record_trace = HandlingTrace::compute(record.telemetry(), params);
    let user_trace = HandlingTrace::compute(user.telemetry(), params);
    let record_laps = analyze_lap(record, params)
        .map(|laps| with_balance(record, laps, &record_trace))
        .map_err(|e| e.in_lap(RECORD))?;
    let user_laps = analyze_lap(user, params)
        .map(|laps| with_balance(user, laps, &user_trace))
        .map_err(|e| e.in_lap(USER))?;
    if record_laps.len() != user_laps.len() {
        return Err(mismatch());
    }

    let mut segments = Vec::with_capacity(record_laps.len());
    for r in &record_laps {
        let u = user_laps
            .iter()
            .find(|u| u.segment.id == r.segment.id)
            .ok_or_else(mismatch)?;
        segments.push(SegmentDelta {
            segment_id: r.segment.id,
            name: r.segment.name.clone(),
            record_s: r.time_delta_s,
            user_s: u.time_delta_s,
            delta_s: u.time_delta_s - r.time_delta_s,
        });
    }

    let record_corners = corners_by_id(&record_laps);
    let user_corners = corners_by_id(&user_laps);
    let corners: Vec<CornerDelta> = record_corners
        .iter()
        .filter_map(|(id, r)| user_corners.get(id).map(|u| corner_delta(r, u)))
        .collect();

    let comparison = LapComparison {
        record: record_laps,
        user: user_laps,
        segments,
        corners,
        record_handling: record_trace.counts(),
        user_handling: user_trace.counts(),
    };
    info!(
        "Compared {} segments and {} corners: {:+.3} s",
        comparison.segments.len(),
        comparison.corners.len(),
        comparison.total_delta_s()
    );
    Ok(comparison)
}

fn with_balance(table: &AlignedTable, laps: Vec<SegmentMetrics>, trace: &HandlingTrace) -> Vec<SegmentMetrics> {
    laps.into_iter()
        .map(|seg| {
            let slice = table.segment_slice(seg.segment.id);
            let corners = seg
                .corners
                .into_iter()
                .map(|c| {
                    let rows = slice.filter_corner(c.corner.id);
                    let balance = CornerBalance::from_counts(trace.counts_in(rows.rows()));
                    c.with_balance(balance)
                })
                .collect();
            SegmentMetrics { corners, ..seg }
        })
        .collect()
}

/// First occurrence of each corner, in segment order.
fn corners_by_id(laps: &[SegmentMetrics]) -> BTreeMap<u32, &CornerMetrics> {
    let mut out = BTreeMap::new();
    for c in laps.iter().flat_map(|s| &s.corners) {
        out.entry(c.corner.id).or_insert(c);
    }
    out
}

fn corner_delta(r: &CornerMetrics, u: &CornerMetrics) -> CornerDelta {
    let brake_point_delta_m = match (r.brake_point_m, u.brake_point_m) {
        (Some(r), Some(u)) => Some(u - r),
        _ => None,
    };
    CornerDelta {
        corner_id: r.corner.id,
        name: r.corner.name.clone(),
        record_brake_point_m: r.brake_point_m,
        user_brake_point_m: u.brake_point_m,
        brake_point_delta_m,
        entry_speed_delta: u.entry_speed - r.entry_speed,
        apex_speed_delta: u.apex_speed - r.apex_speed,
        exit_speed_delta: u.exit_speed - r.exit_speed,
        min_speed_delta: u.speed.min - r.speed.min,
        time_delta_s: u.time_delta_s - r.time_delta_s,
        record_balance: r.balance,
        user_balance: u.balance,
    }
}
