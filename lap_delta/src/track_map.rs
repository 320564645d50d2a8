//! Static track description: segments, corners and their consistency checks.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ordered_float::OrderedFloat;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::LapError;

/// A named stretch of track. Producers disagree on field names, so the
/// loader accepts every known variant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    #[serde(alias = "segment_id")]
    pub id: u32,
    #[serde(default, alias = "segmentName")]
    pub name: String,
    #[serde(alias = "segmentStart_m", alias = "start_d")]
    pub start_m: f64,
    #[serde(alias = "segmentEnd_m", alias = "end_d")]
    pub end_m: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Corner {
    #[serde(alias = "corner_id")]
    pub id: u32,
    #[serde(default, alias = "cornerName")]
    pub name: String,
    #[serde(alias = "start_d", alias = "cornerStart_m")]
    pub start_m: f64,
    #[serde(alias = "apex_d", alias = "cornerApex_m")]
    pub apex_m: f64,
    #[serde(alias = "end_d", alias = "cornerEnd_m")]
    pub end_m: f64,
    #[serde(default)]
    pub tolerance_m: Option<f64>,
}

#[derive(Deserialize)]
struct SegmentsDoc {
    segments: Vec<Segment>,
}

#[derive(Deserialize)]
struct CornersDoc {
    track_length_m: f64,
    corners: Vec<Corner>,
}

/// Location of the two JSON documents describing one track.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrackMapPaths {
    pub segments: PathBuf,
    pub corners: PathBuf,
}

impl TrackMapPaths {
    /// `<dir>/<track>/<track>_segments.json` and `<dir>/<track>/<track>_corners.json`.
    pub fn for_track(dir: &Path, track: &str) -> Self {
        let name = track.trim().to_lowercase();
        let folder = dir.join(&name);
        Self {
            segments: folder.join(format!("{name}_segments.json")),
            corners: folder.join(format!("{name}_corners.json")),
        }
    }
}

/// Segments and corners of one track, both sorted ascending by start.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrackMap {
    pub track_length_m: f64,
    pub segments: Vec<Segment>,
    pub corners: Vec<Corner>,
}

impl TrackMap {
    /// Build a map from records in any order; the join downstream needs
    /// monotone start keys.
    pub fn from_parts(track_length_m: f64, mut segments: Vec<Segment>, mut corners: Vec<Corner>) -> Self {
        segments.sort_by_key(|s| OrderedFloat(s.start_m));
        corners.sort_by_key(|c| OrderedFloat(c.start_m));
        Self {
            track_length_m,
            segments,
            corners,
        }
    }

    pub fn load(paths: &TrackMapPaths) -> Result<Self, LapError> {
        let segments_raw = read_file(&paths.segments)?;
        let corners_raw = read_file(&paths.corners)?;
        Self::from_documents(paths, &segments_raw, &corners_raw)
    }

    fn from_documents(
        paths: &TrackMapPaths,
        segments_raw: &[u8],
        corners_raw: &[u8],
    ) -> Result<Self, LapError> {
        let segments: SegmentsDoc = parse_doc(&paths.segments, segments_raw)?;
        let corners: CornersDoc = parse_doc(&paths.corners, corners_raw)?;
        let map = Self::from_parts(corners.track_length_m, segments.segments, corners.corners);
        info!(
            "Loaded track map {}: {} segments, {} corners, {:.0} m",
            paths.corners.display(),
            map.segments.len(),
            map.corners.len(),
            map.track_length_m
        );
        Ok(map)
    }
}

/// Corners whose start lies inside `[segment.start_m, segment.end_m)`. Each
/// corner of a contiguous segment map belongs to exactly one segment.
pub fn corners_within<'a>(corners: &'a [Corner], segment: &Segment) -> Vec<&'a Corner> {
    corners
        .iter()
        .filter(|c| c.start_m >= segment.start_m && c.start_m < segment.end_m)
        .collect()
}

/// Load the segments document, sorted by start.
pub fn load_segments(path: &Path) -> Result<Vec<Segment>, LapError> {
    let doc: SegmentsDoc = parse_doc(path, &read_file(path)?)?;
    let mut segments = doc.segments;
    segments.sort_by_key(|s| OrderedFloat(s.start_m));
    Ok(segments)
}

/// Load the corners document, sorted by start. Returns the track length too.
pub fn load_corners(path: &Path) -> Result<(f64, Vec<Corner>), LapError> {
    let doc: CornersDoc = parse_doc(path, &read_file(path)?)?;
    let mut corners = doc.corners;
    corners.sort_by_key(|c| OrderedFloat(c.start_m));
    Ok((doc.track_length_m, corners))
}

fn read_file(path: &Path) -> Result<Vec<u8>, LapError> {
    fs::read(path).map_err(|e| LapError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn parse_doc<T: DeserializeOwned>(path: &Path, raw: &[u8]) -> Result<T, LapError> {
    serde_json::from_slice(raw).map_err(|e| LapError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValidationIssue {
    ApexOutOfOrder {
        name: String,
        start_m: f64,
        apex_m: f64,
        end_m: f64,
    },
    OutOfRange {
        name: String,
        start_m: f64,
        end_m: f64,
        track_length_m: f64,
    },
    EmptySpan {
        name: String,
        start_m: f64,
        end_m: f64,
    },
    Overlap {
        name: String,
        prev_end_m: f64,
        start_m: f64,
    },
}

impl ValidationIssue {
    /// Overlaps are reported but never make a map inconsistent.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ValidationIssue::Overlap { .. })
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::ApexOutOfOrder {
                name,
                start_m,
                apex_m,
                end_m,
            } => write!(
                f,
                "{name}: start <= apex <= end violated ({start_m} <= {apex_m} <= {end_m})"
            ),
            ValidationIssue::OutOfRange {
                name,
                start_m,
                end_m,
                track_length_m,
            } => write!(
                f,
                "{name}: [{start_m}, {end_m}] outside [0, {track_length_m}]"
            ),
            ValidationIssue::EmptySpan {
                name,
                start_m,
                end_m,
            } => write!(f, "{name}: start {start_m} is not before end {end_m}"),
            ValidationIssue::Overlap {
                name,
                prev_end_m,
                start_m,
            } => write!(
                f,
                "{name}: may overlap previous entry (prev_end={prev_end_m}, start={start_m})"
            ),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_consistent(&self) -> bool {
        !self.issues.iter().any(ValidationIssue::is_fatal)
    }

    fn log(&self, path: &Path) {
        for issue in &self.issues {
            if issue.is_fatal() {
                error!("{}: {}", path.display(), issue);
            } else {
                warn!("{}: {}", path.display(), issue);
            }
        }
    }
}

/// Check corners in file order. The overlap scan keeps the previous end and
/// neither reorders nor rejects.
pub fn check_corners(track_length_m: f64, corners: &[Corner]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut prev_end = f64::NEG_INFINITY;
    for c in corners {
        let (s, a, e) = (c.start_m, c.apex_m, c.end_m);
        if !(s <= a && a <= e) {
            report.issues.push(ValidationIssue::ApexOutOfOrder {
                name: c.name.clone(),
                start_m: s,
                apex_m: a,
                end_m: e,
            });
        }
        if s < 0.0 || e > track_length_m {
            report.issues.push(ValidationIssue::OutOfRange {
                name: c.name.clone(),
                start_m: s,
                end_m: e,
                track_length_m,
            });
        }
        if s < prev_end && s >= 0.0 {
            report.issues.push(ValidationIssue::Overlap {
                name: c.name.clone(),
                prev_end_m: prev_end,
                start_m: s,
            });
        }
        prev_end = e;
    }
    report
}

pub fn check_segments(segments: &[Segment]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut prev_end = f64::NEG_INFINITY;
    for s in segments {
        if !(s.start_m < s.end_m) {
            report.issues.push(ValidationIssue::EmptySpan {
                name: s.name.clone(),
                start_m: s.start_m,
                end_m: s.end_m,
            });
        }
        if s.start_m < 0.0 {
            report.issues.push(ValidationIssue::OutOfRange {
                name: s.name.clone(),
                start_m: s.start_m,
                end_m: s.end_m,
                track_length_m: f64::INFINITY,
            });
        }
        if s.start_m < prev_end {
            report.issues.push(ValidationIssue::Overlap {
                name: s.name.clone(),
                prev_end_m: prev_end,
                start_m: s.start_m,
            });
        }
        prev_end = s.end_m;
    }
    report
}

/// Validate a corners document. Violations are logged, not raised; an
/// unreadable or malformed file is an error.
pub fn validate(path: &Path) -> Result<bool, LapError> {
    info!("Validating corner map {}", path.display());
    let doc: CornersDoc = parse_doc(path, &read_file(path)?)?;
    let report = check_corners(doc.track_length_m, &doc.corners);
    report.log(path);
    let ok = report.is_consistent();
    if ok {
        info!("Corner map {} is consistent", path.display());
    }
    Ok(ok)
}

pub fn validate_segments(path: &Path) -> Result<bool, LapError> {
    info!("Validating segment map {}", path.display());
    let doc: SegmentsDoc = parse_doc(path, &read_file(path)?)?;
    let report = check_segments(&doc.segments);
    report.log(path);
    Ok(report.is_consistent())
}

struct CachedMap {
    fingerprint: String,
    map: Arc<TrackMap>,
}

/// Process-wide cache of parsed track maps. An entry is reused only while
/// the content hash of both files is unchanged.
#[derive(Default)]
pub struct TrackMapCache {
    entries: HashMap<TrackMapPaths, CachedMap>,
}

impl TrackMapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, paths: &TrackMapPaths) -> Result<Arc<TrackMap>, LapError> {
        let segments_raw = read_file(&paths.segments)?;
        let corners_raw = read_file(&paths.corners)?;
        let fingerprint = fingerprint(&segments_raw, &corners_raw);
        if let Some(entry) = self.entries.get(paths) {
            if entry.fingerprint == fingerprint {
                debug!("Track map cache hit: {}", paths.corners.display());
                return Ok(Arc::clone(&entry.map));
            }
        }
        let map = Arc::new(TrackMap::from_documents(paths, &segments_raw, &corners_raw)?);
        self.entries.insert(
            paths.clone(),
            CachedMap {
                fingerprint,
                map: Arc::clone(&map),
            },
        );
        Ok(map)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn fingerprint(segments_raw: &[u8], corners_raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(Sha256::digest(segments_raw));
    hasher.update(Sha256::digest(corners_raw));
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
