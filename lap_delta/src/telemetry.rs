//! MoTeC CSV ingestion and distance-domain resampling.

use std::fs;
use std::path::Path;

use chrono::{NaiveDate, NaiveTime};
use ndarray::Array1;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{ChannelNames, LapError, Params};

/// Session information from the MoTeC header block. Every field is best
/// effort; a header that does not parse never fails a load.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LapMetadata {
    pub format: Option<String>,
    pub venue: Option<String>,
    pub vehicle: Option<String>,
    pub driver: Option<String>,
    pub log_date: Option<NaiveDate>,
    pub log_time: Option<NaiveTime>,
    pub sample_rate_hz: Option<f64>,
    pub duration_s: Option<f64>,
}

impl LapMetadata {
    fn parse(lines: &[&str]) -> Self {
        let mut meta = LapMetadata::default();
        for line in lines {
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .trim(csv::Trim::All)
                .from_reader(line.as_bytes());
            let Some(Ok(record)) = reader.records().next() else {
                continue;
            };
            let key = record.get(0).unwrap_or("");
            let value = record.get(1).unwrap_or("").trim();
            if value.is_empty() {
                continue;
            }
            match key {
                "Format" => meta.format = Some(value.to_string()),
                "Venue" => meta.venue = Some(value.to_string()),
                "Vehicle" => meta.vehicle = Some(value.to_string()),
                "Driver" => meta.driver = Some(value.to_string()),
                "Log Date" => meta.log_date = parse_date(value),
                "Log Time" => meta.log_time = NaiveTime::parse_from_str(value, "%H:%M:%S").ok(),
                "Sample Rate" => meta.sample_rate_hz = value.parse().ok(),
                "Duration" => meta.duration_s = value.parse().ok(),
                _ => {}
            }
        }
        meta
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    ["%d/%m/%Y", "%Y-%m-%d", "%d.%m.%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

/// One row of the resampled table.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySample {
    pub distance: i64,
    pub time: f64,
    pub speed: f64,
    pub throttle: f64,
    pub brake: f64,
    pub steering: f64,
    pub lat_g: f64,
    pub long_g: f64,
    pub yaw_rate: f64,
}

#[derive(Clone, Copy, Debug)]
struct ChannelIndex {
    time: usize,
    speed: usize,
    throttle: usize,
    brake: usize,
    steering: usize,
    lat_g: usize,
    long_g: usize,
    yaw_rate: usize,
}

impl ChannelIndex {
    fn resolve(names: &[String], channels: &ChannelNames, origin: &str) -> Result<Self, LapError> {
        let find = |column: &str| {
            names
                .iter()
                .position(|n| n == column)
                .ok_or_else(|| LapError::MissingColumn {
                    origin: origin.to_string(),
                    column: column.to_string(),
                })
        };
        Ok(Self {
            time: find(channels.time.as_str())?,
            speed: find(channels.speed.as_str())?,
            throttle: find(channels.throttle.as_str())?,
            brake: find(channels.brake.as_str())?,
            steering: find(channels.steering.as_str())?,
            lat_g: find(channels.lat_g.as_str())?,
            long_g: find(channels.long_g.as_str())?,
            yaw_rate: find(channels.yaw_rate.as_str())?,
        })
    }
}

/// Uniform distance-step telemetry of one lap.
///
/// `distance` is a gap-free integer sequence with a fixed step; every other
/// column (required channels and any extra ones from the recording) is
/// stored as an `Array1` aligned with it. Missing values are NaN.
#[derive(Clone, Debug)]
pub struct TelemetryTable {
    pub origin: String,
    pub metadata: LapMetadata,
    step_m: u32,
    distance: Vec<i64>,
    names: Vec<String>,
    columns: Vec<Array1<f64>>,
    index: ChannelIndex,
}

impl TelemetryTable {
    /// Build a table from already uniform samples, using the default
    /// channel names.
    pub fn from_samples(origin: &str, samples: &[TelemetrySample]) -> Result<Self, LapError> {
        let distance: Vec<i64> = samples.iter().map(|s| s.distance).collect();
        let step = match distance.as_slice() {
            [a, b, ..] => b - a,
            _ => 1,
        };
        if step <= 0 || distance.windows(2).any(|w| w[1] - w[0] != step) {
            return Err(LapError::InvalidParameter(format!(
                "{origin}: sample distances are not a uniform ascending grid"
            )));
        }
        let channels = ChannelNames::default();
        let names: Vec<String> = channels.required()[1..].iter().map(|s| s.to_string()).collect();
        let pick = |f: fn(&TelemetrySample) -> f64| Array1::from_iter(samples.iter().map(f));
        let columns = vec![
            pick(|s| s.time),
            pick(|s| s.speed),
            pick(|s| s.throttle),
            pick(|s| s.brake),
            pick(|s| s.steering),
            pick(|s| s.lat_g),
            pick(|s| s.long_g),
            pick(|s| s.yaw_rate),
        ];
        let index = ChannelIndex::resolve(&names, &channels, origin)?;
        Ok(Self {
            origin: origin.to_string(),
            metadata: LapMetadata::default(),
            step_m: step as u32,
            distance,
            names,
            columns,
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.distance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.distance.is_empty()
    }

    pub fn step_m(&self) -> u32 {
        self.step_m
    }

    pub fn distance(&self) -> &[i64] {
        &self.distance
    }

    /// Names of the non-distance columns, in file order.
    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self, name: &str) -> Option<&Array1<f64>> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.columns[i])
    }

    pub fn time(&self) -> &Array1<f64> {
        &self.columns[self.index.time]
    }

    pub fn speed(&self) -> &Array1<f64> {
        &self.columns[self.index.speed]
    }

    pub fn throttle(&self) -> &Array1<f64> {
        &self.columns[self.index.throttle]
    }

    pub fn brake(&self) -> &Array1<f64> {
        &self.columns[self.index.brake]
    }

    pub fn steering(&self) -> &Array1<f64> {
        &self.columns[self.index.steering]
    }

    pub fn lat_g(&self) -> &Array1<f64> {
        &self.columns[self.index.lat_g]
    }

    pub fn long_g(&self) -> &Array1<f64> {
        &self.columns[self.index.long_g]
    }

    pub fn yaw_rate(&self) -> &Array1<f64> {
        &self.columns[self.index.yaw_rate]
    }

    pub fn sample(&self, row: usize) -> TelemetrySample {
        TelemetrySample {
            distance: self.distance[row],
            time: self.time()[row],
            speed: self.speed()[row],
            throttle: self.throttle()[row],
            brake: self.brake()[row],
            steering: self.steering()[row],
            lat_g: self.lat_g()[row],
            long_g: self.long_g()[row],
            yaw_rate: self.yaw_rate()[row],
        }
    }

    /// Row whose distance equals `distance_m` exactly. Non-integral or
    /// off-grid distances never match.
    pub fn index_of(&self, distance_m: f64) -> Option<usize> {
        if !distance_m.is_finite() || distance_m.fract() != 0.0 {
            return None;
        }
        let first = *self.distance.first()?;
        let offset = distance_m as i64 - first;
        let step = self.step_m as i64;
        if offset < 0 || offset % step != 0 {
            return None;
        }
        let row = (offset / step) as usize;
        (row < self.distance.len()).then_some(row)
    }
}

/// Load and resample one MoTeC CSV export.
pub fn load(path: &Path, params: &Params) -> Result<TelemetryTable, LapError> {
    let origin = path.display().to_string();
    let bytes = fs::read(path).map_err(|e| LapError::Load {
        origin: origin.clone(),
        reason: e.to_string(),
    })?;
    let text = String::from_utf8_lossy(&bytes);
    let table = parse_telemetry(&text, &origin, params)?;
    info!(
        "Loaded {}: {} samples over {}..{} m (venue {})",
        origin,
        table.len(),
        table.distance.first().copied().unwrap_or(0),
        table.distance.last().copied().unwrap_or(0),
        table.metadata.venue.as_deref().unwrap_or("unknown")
    );
    Ok(table)
}

/// Parse recording text: `params.header_lines` metadata lines, a column
/// header row, a units row, then comma-delimited samples.
pub fn parse_telemetry(text: &str, origin: &str, params: &Params) -> Result<TelemetryTable, LapError> {
    params.check()?;
    let load_err = |reason: String| LapError::Load {
        origin: origin.to_string(),
        reason,
    };

    let mut header = Vec::with_capacity(params.header_lines);
    let mut rest = text;
    for _ in 0..params.header_lines {
        let Some((line, tail)) = rest.split_once('\n') else {
            return Err(load_err(format!(
                "file ends inside the {}-line header",
                params.header_lines
            )));
        };
        header.push(line.trim_end_matches('\r'));
        rest = tail;
    }
    let metadata = LapMetadata::parse(&header);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(rest.as_bytes());
    let names: Vec<String> = reader
        .headers()
        .map_err(|e| load_err(e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();

    let channels = &params.channels;
    let distance_col = names
        .iter()
        .position(|n| n == &channels.distance)
        .ok_or_else(|| LapError::MissingColumn {
            origin: origin.to_string(),
            column: channels.distance.clone(),
        })?;

    let mut raw: Vec<Vec<f64>> = vec![Vec::new(); names.len()];
    // The first row after the header carries units.
    for record in reader.records().skip(1) {
        let record = record.map_err(|e| load_err(e.to_string()))?;
        for (col, values) in raw.iter_mut().enumerate() {
            values.push(coerce(record.get(col)));
        }
    }

    let mut order: Vec<usize> = (0..raw[distance_col].len())
        .filter(|&i| !raw[distance_col][i].is_nan())
        .collect();
    if order.is_empty() {
        return Err(load_err("no numeric distance values".into()));
    }
    order.sort_by_key(|&i| OrderedFloat(raw[distance_col][i]));
    let dist: Vec<f64> = order.iter().map(|&i| raw[distance_col][i]).collect();

    let first = dist[0];
    let last = dist[dist.len() - 1];
    let start = first.floor() as i64;
    let end = last.ceil() as i64;
    let grid: Vec<i64> = (start..end).step_by(params.step_m as usize).collect();
    if grid.is_empty() {
        return Err(load_err(format!(
            "distance range {first}..{last} m is too short to resample"
        )));
    }
    let grid_f: Vec<f64> = grid.iter().map(|&d| d as f64).collect();

    let mut out_names = Vec::with_capacity(names.len() - 1);
    let mut columns = Vec::with_capacity(names.len() - 1);
    for (col, name) in names.iter().enumerate() {
        if col == distance_col {
            continue;
        }
        let values: Vec<f64> = order.iter().map(|&i| raw[col][i]).collect();
        columns.push(Array1::from_vec(interpolate(&dist, &values, &grid_f)));
        out_names.push(name.clone());
    }
    let index = ChannelIndex::resolve(&out_names, channels, origin)?;
    debug!(
        "{}: resampled {} raw rows onto {} grid points (step {} m)",
        origin,
        dist.len(),
        grid.len(),
        params.step_m
    );

    Ok(TelemetryTable {
        origin: origin.to_string(),
        metadata,
        step_m: params.step_m,
        distance: grid,
        names: out_names,
        columns,
        index,
    })
}

fn coerce(field: Option<&str>) -> f64 {
    field
        .and_then(|f| f.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(f64::NAN)
}

/// Linear interpolation of `values` (knots at ascending `dist`) onto `grid`.
/// Grid points at a knot take the knot value exactly; points outside the
/// knot range clamp to the nearest end. NaN knots propagate.
fn interpolate(dist: &[f64], values: &[f64], grid: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(grid.len());
    let mut idx = 0;
    for &target in grid {
        while idx + 1 < dist.len() && dist[idx + 1] < target {
            idx += 1;
        }
        if idx + 1 >= dist.len() || target <= dist[idx] {
            out.push(values[idx]);
            continue;
        }
        let (d0, v0) = (dist[idx], values[idx]);
        let (d1, v1) = (dist[idx + 1], values[idx + 1]);
        if d1 == target {
            out.push(v1);
        } else {
            let frac = ((target - d0) / (d1 - d0)).clamp(0.0, 1.0);
            out.push(v0 + (v1 - v0) * frac);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const HEADER: &str = "\"Format\",\"MoTeC CSV File\"\n\
\"Venue\",\"spa\"\n\
\"Vehicle\",\"ferrari_296_gt3\"\n\
\"Driver\",\"\"\n\
\"Device\",\"ADL\"\n\
\"Comment\",\"\"\n\
\"Log Date\",\"19/10/2025\"\n\
\"Log Time\",\"14:03:21\"\n\
\"Sample Rate\",\"20\",\"Hz\"\n\
\"Duration\",\"137.880\",\"s\"\n\
\"Range\",\"entire outing\"\n\
\"Beacon Markers\",\"137.880\"\n\
\"Segment Times\",\"2:17.880\"\n\
\n";

    const COLUMNS: &str = "\"Time\",\"Distance\",\"SPEED\",\"THROTTLE\",\"BRAKE\",\"STEERANGLE\",\"G_LAT\",\"G_LON\",\"ROTY\"\n\
\"s\",\"m\",\"km/h\",\"%\",\"%\",\"deg\",\"G\",\"G\",\"deg/s\"\n";

    fn recording(rows: &str) -> String {
        format!("{HEADER}{COLUMNS}{rows}")
    }

    #[test]
    fn resamples_onto_integer_grid() {
        let text = recording(
            "0.0,10.4,100,50,0,1,0.1,0.0,2\n\
             0.1,12.0,110,60,0,2,0.2,0.1,4\n\
             0.2,14.6,130,80,0,3,0.3,0.2,6\n",
        );
        let table = parse_telemetry(&text, "lap.csv", &Params::default()).unwrap();
        assert_eq!(table.distance(), &[10, 11, 12, 13, 14]);
        // knot at 12.0 is reproduced exactly
        assert_eq!(table.speed()[2], 110.0);
        // 10 lies before the first knot and clamps
        assert_eq!(table.speed()[0], 100.0);
        // 13 is 1/2.6 of the way from 12.0 to 14.6
        let expected = 110.0 + 20.0 * (1.0 / 2.6);
        assert!((table.speed()[3] - expected).abs() < 1e-9);
        assert_eq!(table.metadata.venue.as_deref(), Some("spa"));
        assert_eq!(table.metadata.sample_rate_hz, Some(20.0));
        assert_eq!(
            table.metadata.log_date,
            NaiveDate::from_ymd_opt(2025, 10, 19)
        );
    }

    #[test]
    fn grid_spans_floor_to_ceil_exclusive() {
        let text = recording(
            "0.0,0.5,1,0,0,0,0,0,0\n\
             1.0,3.2,2,0,0,0,0,0,0\n",
        );
        let table = parse_telemetry(&text, "lap.csv", &Params::default()).unwrap();
        assert_eq!(table.distance(), &[0, 1, 2, 3]);
    }

    #[test]
    fn unsorted_rows_and_bad_cells() {
        let text = recording(
            "0.2,2.0,30,0,0,0,0,0,0\n\
             0.0,0.0,10,x,0,0,0,0,0\n\
             0.1,,99,0,0,0,0,0,0\n\
             0.1,1.0,20,0,0,0,0,0,0\n\
             0.3,3.0,40,0,0,0,0,0,0\n",
        );
        let table = parse_telemetry(&text, "lap.csv", &Params::default()).unwrap();
        assert_eq!(table.distance(), &[0, 1, 2]);
        assert_eq!(table.speed().to_vec(), vec![10.0, 20.0, 30.0]);
        assert!(table.throttle()[0].is_nan());
        assert_eq!(table.time()[1], 0.1);
    }

    #[test]
    fn exact_at_knots_for_every_channel() {
        let text = recording(
            "0.00,0,100,10,0,5,0.5,-0.2,3\n\
             0.05,1,101,20,5,6,0.6,-0.3,4\n\
             0.10,2,102,30,10,7,0.7,-0.4,5\n\
             0.15,3,103,40,15,8,0.8,-0.5,6\n",
        );
        let table = parse_telemetry(&text, "lap.csv", &Params::default()).unwrap();
        let s = table.sample(1);
        assert_eq!(
            s,
            TelemetrySample {
                distance: 1,
                time: 0.05,
                speed: 101.0,
                throttle: 20.0,
                brake: 5.0,
                steering: 6.0,
                lat_g: 0.6,
                long_g: -0.3,
                yaw_rate: 4.0,
            }
        );
    }

    #[test]
    fn empty_recording_is_load_error() {
        let text = recording("");
        assert_matches!(
            parse_telemetry(&text, "lap.csv", &Params::default()),
            Err(LapError::Load { .. })
        );
    }

    #[test]
    fn non_numeric_distance_only_is_load_error() {
        let text = recording("0.0,a,1,0,0,0,0,0,0\n0.1,b,1,0,0,0,0,0,0\n");
        assert_matches!(
            parse_telemetry(&text, "lap.csv", &Params::default()),
            Err(LapError::Load { .. })
        );
    }

    #[test]
    fn missing_required_column() {
        let text = format!(
            "{HEADER}\"Time\",\"Distance\",\"SPEED\"\n\"s\",\"m\",\"km/h\"\n0,0,1\n0.1,2,2\n"
        );
        assert_matches!(
            parse_telemetry(&text, "lap.csv", &Params::default()),
            Err(LapError::MissingColumn { column, .. }) if column == "THROTTLE"
        );
    }

    #[test]
    fn truncated_header_is_load_error() {
        assert_matches!(
            parse_telemetry("\"Format\",\"MoTeC\"\n", "lap.csv", &Params::default()),
            Err(LapError::Load { .. })
        );
    }

    #[test]
    fn extra_columns_are_resampled_too() {
        let text = format!(
            "{HEADER}\"Time\",\"Distance\",\"SPEED\",\"THROTTLE\",\"BRAKE\",\"STEERANGLE\",\"G_LAT\",\"G_LON\",\"ROTY\",\"GEAR\"\n\
             \"s\",\"m\",\"km/h\",\"%\",\"%\",\"deg\",\"G\",\"G\",\"deg/s\",\"\"\n\
             0,0,1,0,0,0,0,0,0,2\n\
             1,2,1,0,0,0,0,0,0,4\n"
        );
        let table = parse_telemetry(&text, "lap.csv", &Params::default()).unwrap();
        assert_eq!(table.column("GEAR").unwrap().to_vec(), vec![2.0, 3.0]);
    }

    #[test]
    fn index_of_requires_exact_grid_point() {
        let samples: Vec<TelemetrySample> = (5..10)
            .map(|d| TelemetrySample {
                distance: d,
                time: d as f64,
                speed: 0.0,
                throttle: 0.0,
                brake: 0.0,
                steering: 0.0,
                lat_g: 0.0,
                long_g: 0.0,
                yaw_rate: 0.0,
            })
            .collect();
        let table = TelemetryTable::from_samples("t", &samples).unwrap();
        assert_eq!(table.index_of(7.0), Some(2));
        assert_eq!(table.index_of(7.5), None);
        assert_eq!(table.index_of(4.0), None);
        assert_eq!(table.index_of(10.0), None);
    }

    #[test]
    fn coarser_step() {
        let params = Params {
            step_m: 2,
            ..Params::default()
        };
        let text = recording("0,0,0,0,0,0,0,0,0\n1,5,50,0,0,0,0,0,0\n");
        let table = parse_telemetry(&text, "lap.csv", &params).unwrap();
        assert_eq!(table.distance(), &[0, 2, 4]);
        assert_eq!(table.speed()[1], 20.0);
        assert_eq!(table.index_of(3.0), None);
        assert_eq!(table.index_of(4.0), Some(2));
    }
}
