use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use lap_delta::compare::{RECORD, USER};
use lap_delta::{
    align, analyze_lap, compare, round_to, AlignedTable, CornerBalance, CornerDelta,
    CornerFaultPolicy, LapComparison, LapError, Params, SegmentMetrics, TrackMap, TrackMapPaths,
};
use rayon::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Distance-domain lap comparison CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare a user lap against a record lap on the same track
    Compare(CompareArgs),
    /// Summarise the segments and corners of a single lap
    Analyze(AnalyzeArgs),
    /// Check a corner map (and optionally a segment map) for consistency
    Validate(ValidateArgs),
}

#[derive(Args, Debug)]
struct TrackArgs {
    /// Directory holding one folder of track map JSON files per track
    #[arg(long, default_value = "tracks", value_hint = ValueHint::DirPath)]
    tracks: PathBuf,

    /// Track name; resolves to <tracks>/<track>/<track>_{segments,corners}.json
    #[arg(long)]
    track: String,

    /// Optional pipeline parameters JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct CompareArgs {
    #[command(flatten)]
    track: TrackArgs,

    /// Reference lap (MoTeC CSV export)
    #[arg(long, value_hint = ValueHint::FilePath)]
    record: PathBuf,

    /// Lap to compare against the reference (MoTeC CSV export)
    #[arg(long, value_hint = ValueHint::FilePath)]
    user: PathBuf,

    /// Corner delta CSV path (`-` for stdout)
    #[arg(short, long, default_value = "corners.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Write the full comparison as JSON
    #[arg(long, value_hint = ValueHint::FilePath)]
    json: Option<PathBuf>,

    /// Fail the whole comparison when a single corner cannot be analysed
    #[arg(long, action = ArgAction::SetTrue)]
    abort_on_corner_fault: bool,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    #[command(flatten)]
    track: TrackArgs,

    /// Lap to analyse (MoTeC CSV export)
    #[arg(long, value_hint = ValueHint::FilePath)]
    lap: PathBuf,

    /// Segment summary CSV path (`-` for stdout)
    #[arg(short, long, default_value = "segments.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    /// Corner map JSON
    #[arg(value_hint = ValueHint::FilePath)]
    corners: PathBuf,

    /// Segment map JSON to check as well
    #[arg(long, value_hint = ValueHint::FilePath)]
    segments: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Compare(args) => args.verbose,
        Command::Analyze(args) => args.verbose,
        Command::Validate(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Compare(args) => handle_compare(args),
        Command::Analyze(args) => handle_analyze(args),
        Command::Validate(args) => handle_validate(args),
    }
}

fn handle_compare(args: CompareArgs) -> Result<()> {
    let mut params = load_params(args.track.config.as_deref())?;
    if args.abort_on_corner_fault {
        params.fault_policy = CornerFaultPolicy::Abort;
    }
    let map = load_track(&args.track)?;

    let t_load = Instant::now();
    let inputs = [(RECORD, args.record.as_path()), (USER, args.user.as_path())];
    let laps = inputs
        .par_iter()
        .map(|(label, path)| load_lap(path, &map, &params).map_err(|e| e.in_lap(*label)))
        .collect::<Result<Vec<_>, LapError>>()?;
    let [record, user]: [AlignedTable; 2] = laps
        .try_into()
        .map_err(|_| anyhow!("expected exactly two laps"))?;
    if args.verbose {
        info!(
            "Load stage: {:.1} ms",
            t_load.elapsed().as_secs_f64() * 1000.0
        );
    }

    let comparison = compare(&record, &user, &params)?;
    for (lap, fault) in comparison.faults() {
        warn!(
            "{} lap: corner {} ({}) skipped in segment {}: {}",
            lap, fault.corner_id, fault.corner_name, fault.segment_id, fault.reason
        );
    }
    for delta in &comparison.segments {
        info!(
            "Segment {} ({}): record {:.3} s, user {:.3} s, delta {:+.3} s",
            delta.segment_id, delta.name, delta.record_s, delta.user_s, delta.delta_s
        );
    }
    info!(
        "Handling: record {} oversteer / {} understeer, user {} oversteer / {} understeer",
        comparison.record_handling.oversteer,
        comparison.record_handling.understeer,
        comparison.user_handling.oversteer,
        comparison.user_handling.understeer
    );

    let mut writer = csv_writer(&args.output)?;
    write_corner_rows(&comparison.corners, params.precision, &mut writer)?;
    writer
        .flush()
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    if args.output.as_os_str() != "-" {
        info!("Corner deltas written: {}", args.output.display());
    }

    if let Some(path) = args.json.as_ref() {
        write_json(&comparison, path)?;
        info!("Comparison written: {}", path.display());
    }
    Ok(())
}

fn handle_analyze(args: AnalyzeArgs) -> Result<()> {
    let params = load_params(args.track.config.as_deref())?;
    let map = load_track(&args.track)?;
    let lap = load_lap(&args.lap, &map, &params)?;
    let segments = analyze_lap(&lap, &params)
        .with_context(|| format!("failed to analyse {}", args.lap.display()))?;
    for segment in &segments {
        for fault in &segment.faults {
            warn!(
                "Corner {} ({}) skipped in segment {}: {}",
                fault.corner_id, fault.corner_name, fault.segment_id, fault.reason
            );
        }
    }

    let mut writer = csv_writer(&args.output)?;
    write_segment_rows(&segments, params.precision, &mut writer)?;
    writer
        .flush()
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    if args.output.as_os_str() != "-" {
        info!("Segment summary written: {}", args.output.display());
    }
    Ok(())
}

fn handle_validate(args: ValidateArgs) -> Result<()> {
    let mut consistent = lap_delta::validate(&args.corners)?;
    if let Some(segments) = args.segments.as_ref() {
        consistent &= lap_delta::validate_segments(segments)?;
    }
    if consistent {
        Ok(())
    } else {
        Err(anyhow!("track map {} is inconsistent", args.corners.display()))
    }
}

fn load_params(path: Option<&Path>) -> Result<Params> {
    let Some(path) = path else {
        return Ok(Params::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let params: Params = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a valid parameter file", path.display()))?;
    params.check()?;
    Ok(params)
}

fn load_track(args: &TrackArgs) -> Result<TrackMap> {
    let paths = TrackMapPaths::for_track(&args.tracks, &args.track);
    TrackMap::load(&paths).with_context(|| format!("failed to load track map for '{}'", args.track))
}

fn load_lap(path: &Path, map: &TrackMap, params: &Params) -> Result<AlignedTable, LapError> {
    let table = lap_delta::load(path, params)?;
    align(table, &map.segments, &map.corners)
}

fn csv_writer(path: &Path) -> Result<csv::Writer<Box<dyn Write>>> {
    let sink: Box<dyn Write> = if path.as_os_str() == "-" {
        Box::new(io::stdout().lock())
    } else {
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        Box::new(BufWriter::new(file))
    };
    Ok(csv::Writer::from_writer(sink))
}

fn write_json(comparison: &LapComparison, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), comparison)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn write_corner_rows<W: Write>(
    corners: &[CornerDelta],
    precision: u32,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "corner_id",
        "corner_name",
        "record_brake_point_m",
        "user_brake_point_m",
        "brake_point_delta_m",
        "entry_speed_delta",
        "apex_speed_delta",
        "exit_speed_delta",
        "min_speed_delta",
        "time_delta_s",
        "record_balance",
        "user_balance",
    ])?;
    let num = |v: f64| round_to(v, precision).to_string();
    let opt = |v: Option<i64>| v.map(|v| v.to_string()).unwrap_or_default();
    for c in corners {
        writer.write_record([
            c.corner_id.to_string(),
            c.name.clone(),
            opt(c.record_brake_point_m),
            opt(c.user_brake_point_m),
            opt(c.brake_point_delta_m),
            num(c.entry_speed_delta),
            num(c.apex_speed_delta),
            num(c.exit_speed_delta),
            num(c.min_speed_delta),
            num(c.time_delta_s),
            balance_label(c.record_balance),
            balance_label(c.user_balance),
        ])?;
    }
    Ok(())
}

fn write_segment_rows<W: Write>(
    segments: &[SegmentMetrics],
    precision: u32,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "segment_id",
        "segment_name",
        "start_m",
        "end_m",
        "length_m",
        "avg_throttle",
        "avg_brake",
        "avg_speed",
        "top_speed",
        "min_speed",
        "time_s",
        "corners",
        "skipped_corners",
    ])?;
    for segment in segments {
        let report = segment.report(precision);
        writer.write_record([
            report.id.to_string(),
            report.name,
            report.start_m.to_string(),
            report.end_m.to_string(),
            report.length_m.to_string(),
            report.avg_throttle.to_string(),
            report.avg_brake.to_string(),
            report.avg_speed.to_string(),
            report.top_speed.to_string(),
            report.min_speed.to_string(),
            report.time_delta_s.to_string(),
            report.corners.len().to_string(),
            segment.faults.len().to_string(),
        ])?;
    }
    Ok(())
}

fn balance_label(balance: Option<CornerBalance>) -> String {
    balance
        .map(|b| format!("{:?}", b.verdict).to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_compare_flags() {
        let cli = Cli::try_parse_from([
            "lap-delta",
            "compare",
            "--track",
            "Spa",
            "--record",
            "rec.csv",
            "--user",
            "me.csv",
            "-o",
            "-",
            "--abort-on-corner-fault",
        ])
        .unwrap();
        match cli.command {
            Command::Compare(args) => {
                assert_eq!(args.track.tracks, PathBuf::from("tracks"));
                assert_eq!(args.track.track, "Spa");
                assert_eq!(args.output, PathBuf::from("-"));
                assert!(args.abort_on_corner_fault);
                assert!(args.json.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn validate_takes_positional_corner_map() {
        let cli = Cli::try_parse_from(["lap-delta", "validate", "spa_corners.json"]).unwrap();
        assert!(matches!(cli.command, Command::Validate(ValidateArgs { segments: None, .. })));
    }

    #[test]
    fn params_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        fs::write(&path, r#"{"precision": 1, "fault_policy": "abort"}"#).unwrap();
        let params = load_params(Some(&path)).unwrap();
        assert_eq!(params.precision, 1);
        assert_eq!(params.fault_policy, CornerFaultPolicy::Abort);
        assert_eq!(load_params(None).unwrap(), Params::default());
    }

    #[test]
    fn corner_rows_leave_missing_brake_points_blank() {
        let delta = CornerDelta {
            corner_id: 3,
            name: "Eau Rouge".into(),
            record_brake_point_m: Some(100),
            user_brake_point_m: None,
            brake_point_delta_m: None,
            entry_speed_delta: -1.23456,
            apex_speed_delta: 0.0,
            exit_speed_delta: 0.0,
            min_speed_delta: 0.0,
            time_delta_s: 0.1,
            record_balance: None,
            user_balance: None,
        };
        let mut writer = csv::Writer::from_writer(Vec::new());
        write_corner_rows(&[delta], 3, &mut writer).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let row = text.lines().nth(1).unwrap();
        assert_eq!(row, "3,Eau Rouge,100,,,-1.235,0,0,0,0.1,,");
    }
}
