use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use clap::Parser;
use flate2::read::GzDecoder;
use log::{info, warn};
use position_tracker_rs::config::FusionConfig;
use position_tracker_rs::geodesy::haversine_distance;
use position_tracker_rs::sensor_fusion::{FusionEvent, SensorFusion};
use position_tracker_rs::types::{AccelData, GeoPoint, GpsData};
use serde::Deserialize;
use serde_json::json;

#[derive(Parser, Debug)]
struct Args {
    /// Path to session_*.json[.gz] log
    #[arg(long, conflicts_with = "session_dir")]
    log: Option<PathBuf>,

    /// Directory of session logs to batch replay (processes session_*.json[.gz])
    #[arg(long)]
    session_dir: Option<PathBuf>,

    /// JSON config overriding the one recorded in the log
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, requires = "target_lon", allow_hyphen_values = true)]
    target_lat: Option<f64>,

    #[arg(long, requires = "target_lat", allow_hyphen_values = true)]
    target_lon: Option<f64>,
}

#[derive(Deserialize)]
struct Reading {
    timestamp: f64,
    accel: Option<AccelData>,
    gps: Option<GpsData>,
}

#[derive(Deserialize)]
struct LogFile {
    #[serde(default)]
    config: Option<FusionConfig>,
    readings: Vec<Reading>,
}

fn load_log(path: &Path) -> anyhow::Result<LogFile> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let gz = GzDecoder::new(file);
        let reader = BufReader::new(gz);
        Ok(serde_json::from_reader(reader)?)
    } else {
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

fn rms(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sum_sq: f64 = values.iter().map(|v| v * v).sum();
    Some((sum_sq / values.len() as f64).sqrt())
}

fn is_session_log(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.starts_with("session_") && (name.ends_with(".json") || name.ends_with(".json.gz"))
}

fn run_once(
    path: &Path,
    override_config: Option<&FusionConfig>,
    target: Option<GeoPoint>,
) -> anyhow::Result<serde_json::Value> {
    let mut log = load_log(path)?;
    let config = match override_config {
        Some(c) => c.clone(),
        None => log.config.take().unwrap_or_default(),
    };
    config.validate()?;

    // Logs are appended per channel, so interleave by timestamp before replay
    log.readings.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

    let mut fusion = SensorFusion::new(config);
    let mut fix_residuals = Vec::new();
    let mut max_innovation: f64 = 0.0;
    let mut timestamp_rejections = 0u64;
    let mut skipped_updates = 0u64;

    for r in &log.readings {
        if let Some(acc) = r.accel.as_ref() {
            for event in fusion.feed_accel(acc) {
                if matches!(event, FusionEvent::TimestampRejected { .. }) {
                    timestamp_rejections += 1;
                }
            }
        }

        if let Some(gps) = r.gps.as_ref() {
            let mut accepted = false;
            for event in fusion.feed_gps(gps) {
                match event {
                    FusionEvent::OriginSet { .. } => accepted = true,
                    FusionEvent::FixApplied { innovation_m } => {
                        accepted = true;
                        max_innovation = max_innovation.max(innovation_m);
                    }
                    FusionEvent::UpdateSkipped { .. } => skipped_updates += 1,
                    _ => {}
                }
            }
            if accepted {
                if let Some(fused) = fusion.fused_position() {
                    let raw = GeoPoint::new(gps.latitude, gps.longitude);
                    fix_residuals.push(haversine_distance(fused, raw));
                }
            }
        }
    }

    let snap = fusion.snapshot();
    let fused = fusion.fused_position();
    info!(
        "{}: {} readings, {} fixes accepted",
        path.display(),
        log.readings.len(),
        fix_residuals.len()
    );

    Ok(json!({
        "log": path.display().to_string(),
        "readings": log.readings.len(),
        "accel_samples": snap.accel_samples,
        "gps_fixes": snap.gps_fixes,
        "gps_accepted": fix_residuals.len(),
        "gps_rejected": snap.gps_rejected,
        "timestamp_rejections": timestamp_rejections,
        "dt_clamps": snap.dt_clamps,
        "skipped_updates": skipped_updates,
        "covariance_resets": snap.covariance_resets,
        "final_state": snap.state,
        "final_position": fused,
        "uncertainty_m": snap.ekf.uncertainty_m,
        "fix_rms_m": rms(&fix_residuals),
        "max_innovation_m": max_innovation,
        "distance_to_target_m": target.and_then(|t| fusion.distance_to(t)),
    }))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let override_config = args
        .config
        .as_ref()
        .map(|path| FusionConfig::from_json_file(path))
        .transpose()?;
    let target = args
        .target_lat
        .zip(args.target_lon)
        .map(|(lat, lon)| GeoPoint::new(lat, lon));

    let mut results = Vec::new();

    if let Some(dir) = args.session_dir.as_ref() {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && is_session_log(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        for path in paths {
            match run_once(&path, override_config.as_ref(), target) {
                Ok(res) => results.push(res),
                Err(e) => warn!("Failed {}: {}", path.display(), e),
            }
        }
    } else if let Some(log) = args.log.as_ref() {
        results.push(run_once(log, override_config.as_ref(), target)?);
    } else {
        anyhow::bail!("Provide --log or --session-dir");
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
