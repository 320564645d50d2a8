//! Backward nearest-boundary join of telemetry against the track map.
//!
//! Each row is attributed to the segment (and corner) with the greatest
//! start distance not exceeding the row's distance. This is deliberately
//! not interval containment: rows after a corner's end but before the next
//! corner's start still belong to the previous corner, and rows before the
//! first boundary belong to nothing.

use ndarray::Array1;
use tracing::debug;

use crate::telemetry::TelemetryTable;
use crate::track_map::{corners_within, Corner, Segment};
use crate::LapError;

#[derive(Clone, Debug)]
pub struct AlignedTable {
    telemetry: TelemetryTable,
    segments: Vec<Segment>,
    corners: Vec<Corner>,
    segment_of: Vec<Option<usize>>,
    corner_of: Vec<Option<usize>>,
}

/// Join telemetry with segment and corner boundaries. Both boundary lists
/// must be sorted ascending by start.
pub fn align(
    telemetry: TelemetryTable,
    segments: &[Segment],
    corners: &[Corner],
) -> Result<AlignedTable, LapError> {
    let segment_starts: Vec<f64> = segments.iter().map(|s| s.start_m).collect();
    let corner_starts: Vec<f64> = corners.iter().map(|c| c.start_m).collect();
    ensure_sorted(&segment_starts, "segments")?;
    ensure_sorted(&corner_starts, "corners")?;

    let segment_of = backward_join(telemetry.distance(), &segment_starts);
    let corner_of = backward_join(telemetry.distance(), &corner_starts);
    debug!(
        "{}: aligned {} rows ({} before first segment, {} before first corner)",
        telemetry.origin,
        telemetry.len(),
        segment_of.iter().take_while(|s| s.is_none()).count(),
        corner_of.iter().take_while(|c| c.is_none()).count()
    );
    Ok(AlignedTable {
        telemetry,
        segments: segments.to_vec(),
        corners: corners.to_vec(),
        segment_of,
        corner_of,
    })
}

fn ensure_sorted(starts: &[f64], what: &str) -> Result<(), LapError> {
    if starts.windows(2).all(|w| w[0] <= w[1]) {
        Ok(())
    } else {
        Err(LapError::InvalidParameter(format!(
            "{what} must be sorted by start distance before alignment"
        )))
    }
}

/// Merge-style scan over two ascending sequences. On equal starts the last
/// boundary wins.
fn backward_join(distance: &[i64], starts: &[f64]) -> Vec<Option<usize>> {
    let mut out = Vec::with_capacity(distance.len());
    let mut next = 0;
    for &d in distance {
        let d = d as f64;
        while next < starts.len() && starts[next] <= d {
            next += 1;
        }
        out.push(next.checked_sub(1));
    }
    out
}

impl AlignedTable {
    pub fn telemetry(&self) -> &TelemetryTable {
        &self.telemetry
    }

    /// Drop the join and hand back the underlying telemetry.
    pub fn into_telemetry(self) -> TelemetryTable {
        self.telemetry
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn corners(&self) -> &[Corner] {
        &self.corners
    }

    pub fn len(&self) -> usize {
        self.telemetry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.telemetry.is_empty()
    }

    pub fn segment_at(&self, row: usize) -> Option<&Segment> {
        self.segment_of[row].map(|i| &self.segments[i])
    }

    pub fn corner_at(&self, row: usize) -> Option<&Corner> {
        self.corner_of[row].map(|i| &self.corners[i])
    }

    /// Corners spatially contained in `segment`. Rows of such a corner that
    /// spill past the segment end are not part of the segment's slice.
    pub fn corners_in(&self, segment: &Segment) -> Vec<&Corner> {
        corners_within(&self.corners, segment)
    }

    pub fn all_rows(&self) -> LapSlice<'_> {
        LapSlice {
            table: self,
            rows: (0..self.len()).collect(),
        }
    }

    /// Rows attributed to segment `id`.
    pub fn segment_slice(&self, id: u32) -> LapSlice<'_> {
        self.all_rows().filter_segment(id)
    }

    /// Rows attributed to corner `id`.
    pub fn corner_slice(&self, id: u32) -> LapSlice<'_> {
        self.all_rows().filter_corner(id)
    }
}

/// A subset of rows of an aligned table, in ascending distance order.
#[derive(Clone, Debug)]
pub struct LapSlice<'a> {
    table: &'a AlignedTable,
    rows: Vec<usize>,
}

impl<'a> LapSlice<'a> {
    pub fn table(&self) -> &'a AlignedTable {
        self.table
    }

    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn filter_segment(&self, id: u32) -> LapSlice<'a> {
        self.filter(|row| self.table.segment_at(row).map(|s| s.id) == Some(id))
    }

    pub fn filter_corner(&self, id: u32) -> LapSlice<'a> {
        self.filter(|row| self.table.corner_at(row).map(|c| c.id) == Some(id))
    }

    fn filter(&self, keep: impl Fn(usize) -> bool) -> LapSlice<'a> {
        LapSlice {
            table: self.table,
            rows: self.rows.iter().copied().filter(|&row| keep(row)).collect(),
        }
    }

    /// Values of `column` at the slice's rows.
    pub fn values<'c>(&'c self, column: &'c Array1<f64>) -> impl Iterator<Item = f64> + 'c {
        self.rows.iter().map(move |&row| column[row])
    }

    pub fn collect(&self, column: &Array1<f64>) -> Vec<f64> {
        self.values(column).collect()
    }

    pub fn distance_at(&self, pos: usize) -> i64 {
        self.table.telemetry.distance()[self.rows[pos]]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::telemetry::TelemetrySample;

    pub(crate) fn flat_samples(from: i64, to: i64) -> Vec<TelemetrySample> {
        (from..to)
            .map(|d| TelemetrySample {
                distance: d,
                time: d as f64 * 0.05,
                speed: 100.0,
                throttle: 100.0,
                brake: 0.0,
                steering: 0.0,
                lat_g: 0.0,
                long_g: 0.0,
                yaw_rate: 0.0,
            })
            .collect()
    }

    pub(crate) fn segment(id: u32, start_m: f64, end_m: f64) -> Segment {
        Segment {
            id,
            name: format!("S{id}"),
            start_m,
            end_m,
        }
    }

    pub(crate) fn corner(id: u32, start_m: f64, apex_m: f64, end_m: f64) -> Corner {
        Corner {
            id,
            name: format!("T{id}"),
            start_m,
            apex_m,
            end_m,
            tolerance_m: None,
        }
    }

    fn brute_force(distance: &[i64], starts: &[f64]) -> Vec<Option<usize>> {
        distance
            .iter()
            .map(|&d| {
                let mut best = None;
                for (i, &s) in starts.iter().enumerate() {
                    if s <= d as f64 {
                        best = Some(i);
                    }
                }
                best
            })
            .collect()
    }

    #[test]
    fn rows_before_first_boundary_are_unassigned() {
        let table = TelemetryTable::from_samples("t", &flat_samples(0, 20)).unwrap();
        let aligned = align(table, &[segment(1, 5.0, 20.0)], &[corner(1, 8.0, 10.0, 12.0)]).unwrap();
        for row in 0..5 {
            assert!(aligned.segment_at(row).is_none());
            assert!(aligned.corner_at(row).is_none());
        }
        assert_eq!(aligned.segment_at(5).map(|s| s.id), Some(1));
        assert!(aligned.corner_at(7).is_none());
        assert_eq!(aligned.corner_at(8).map(|c| c.id), Some(1));
    }

    #[test]
    fn trailing_rows_stay_with_previous_corner() {
        let table = TelemetryTable::from_samples("t", &flat_samples(0, 40)).unwrap();
        let corners = [corner(1, 5.0, 8.0, 10.0), corner(2, 25.0, 28.0, 30.0)];
        let aligned = align(table, &[segment(1, 0.0, 40.0)], &corners).unwrap();
        // 15 is past T1's end but before T2's start
        assert_eq!(aligned.corner_at(15).map(|c| c.id), Some(1));
        assert_eq!(aligned.corner_at(24).map(|c| c.id), Some(1));
        assert_eq!(aligned.corner_at(25).map(|c| c.id), Some(2));
        assert_eq!(aligned.corner_at(39).map(|c| c.id), Some(2));
        assert_eq!(aligned.corner_slice(1).len(), 20);
    }

    #[test]
    fn merge_scan_matches_brute_force() {
        let distance: Vec<i64> = (-3..60).collect();
        let starts = [0.0, 0.0, 7.5, 10.0, 10.0, 33.0, 59.0, 80.0];
        assert_eq!(
            backward_join(&distance, &starts),
            brute_force(&distance, &starts)
        );
    }

    #[test]
    fn equal_starts_pick_the_last_boundary() {
        assert_eq!(backward_join(&[5], &[5.0, 5.0]), vec![Some(1)]);
    }

    #[test]
    fn realignment_is_idempotent() {
        let segments = [segment(1, 0.0, 10.0), segment(2, 10.0, 30.0)];
        let corners = [corner(1, 3.0, 5.0, 7.0), corner(2, 14.0, 16.0, 20.0)];
        let table = TelemetryTable::from_samples("t", &flat_samples(0, 30)).unwrap();
        let first = align(table, &segments, &corners).unwrap();
        let ids = |t: &AlignedTable| -> Vec<(Option<u32>, Option<u32>)> {
            (0..t.len())
                .map(|row| (t.segment_at(row).map(|x| x.id), t.corner_at(row).map(|x| x.id)))
                .collect()
        };
        let before = ids(&first);
        let again = align(first.into_telemetry(), &segments, &corners).unwrap();
        assert_eq!(before, ids(&again));
    }

    #[test]
    fn unsorted_boundaries_are_rejected() {
        let table = TelemetryTable::from_samples("t", &flat_samples(0, 10)).unwrap();
        let segments = [segment(2, 5.0, 10.0), segment(1, 0.0, 5.0)];
        assert!(align(table, &segments, &[]).is_err());
    }

    #[test]
    fn segment_corners_by_containment_not_by_rows() {
        let table = TelemetryTable::from_samples("t", &flat_samples(0, 40)).unwrap();
        let segments = [segment(1, 0.0, 20.0), segment(2, 20.0, 39.0)];
        let corners = [corner(1, 5.0, 8.0, 10.0), corner(2, 30.0, 32.0, 35.0)];
        let aligned = align(table, &segments, &corners).unwrap();
        // T1 owns rows 20..30 of S2 through the backward join
        let s2 = aligned.segment_slice(2);
        assert_eq!(s2.filter_corner(1).len(), 10);
        assert_eq!(s2.distance_at(0), 20);
        let ids: Vec<u32> = aligned.corners_in(&segments[1]).iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2]);
        let ids: Vec<u32> = aligned.corners_in(&segments[0]).iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1]);
    }
}
