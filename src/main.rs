use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use position_tracker_rs::config::FusionConfig;
use position_tracker_rs::live_status::{current_timestamp, LiveStatus};
use position_tracker_rs::sensor_fusion::{FusionEvent, FusionSnapshot, SensorFusion};
use position_tracker_rs::sensors;
use position_tracker_rs::types::{AccelData, GeoPoint, GpsData};

#[derive(Parser, Debug)]
#[command(name = "position_tracker")]
#[command(about = "GPS + accelerometer position tracker (4-state EKF)", long_about = None)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON file overriding filter and gating parameters
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory
    #[arg(long, default_value = "position_tracker_sessions")]
    output_dir: PathBuf,

    #[arg(long, default_value = "50.0")]
    accel_rate: f64,

    #[arg(long, default_value = "5.0")]
    gps_rate: f64,

    /// Target latitude for distance reporting
    #[arg(long, requires = "target_lon", allow_hyphen_values = true)]
    target_lat: Option<f64>,

    /// Target longitude for distance reporting
    #[arg(long, requires = "target_lat", allow_hyphen_values = true)]
    target_lon: Option<f64>,
}

#[derive(Serialize, Clone)]
struct SensorReading {
    timestamp: f64,
    accel: Option<AccelData>,
    gps: Option<GpsData>,
}

#[derive(Serialize)]
struct SessionLog<'a> {
    config: &'a FusionConfig,
    readings: &'a [SensorReading],
    final_snapshot: FusionSnapshot,
}

/// Seconds between session log checkpoints
const AUTOSAVE_INTERVAL_SECS: i64 = 15;

fn write_session(
    path: &Path,
    config: &FusionConfig,
    readings: &[SensorReading],
    fusion: &SensorFusion,
) -> Result<()> {
    let session = SessionLog {
        config,
        readings,
        final_snapshot: fusion.snapshot(),
    };
    let json = serde_json::to_string_pretty(&session)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match args.config.as_ref() {
        Some(path) => FusionConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => FusionConfig::default(),
    };
    let target = args
        .target_lat
        .zip(args.target_lon)
        .map(|(lat, lon)| GeoPoint::new(lat, lon));

    info!("Position Tracker starting");
    info!("  Duration: {} seconds (0=continuous)", args.duration);
    info!("  Rates: accel {} Hz, GPS {} Hz", args.accel_rate, args.gps_rate);
    info!("  Output Dir: {}", args.output_dir.display());
    if let Some(t) = target {
        info!("  Target: {:.6}, {:.6}", t.lat, t.lon);
    }

    std::fs::create_dir_all(&args.output_dir)?;

    let mut fusion = SensorFusion::new(config.clone());
    let mut readings: Vec<SensorReading> = Vec::new();
    let mut last_hdop: Option<f64> = None;

    let (accel_tx, mut accel_rx) = mpsc::channel::<AccelData>(500);
    let (gps_tx, mut gps_rx) = mpsc::channel::<GpsData>(100);

    let sensor_start = current_timestamp();
    let _accel_handle = tokio::spawn(sensors::accel_loop(accel_tx, args.accel_rate, sensor_start));
    let _gps_handle = tokio::spawn(sensors::gps_loop(gps_tx, args.gps_rate, sensor_start));

    let start = Utc::now();
    let mut last_status_update = Utc::now();
    let mut last_save = Utc::now();
    let status_path = args.output_dir.join("live_status.json");
    // One file per session; checkpoints overwrite it, the final save completes it
    let session_path = args
        .output_dir
        .join(format!("session_{}.json", start.format("%Y%m%d_%H%M%S")));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ctrl_c_armed = true;

    info!("Starting data collection (Ctrl-C to stop)...");

    loop {
        if args.duration > 0 {
            let elapsed = Utc::now().signed_duration_since(start);
            if elapsed.num_seconds() as u64 >= args.duration {
                info!("Duration reached, stopping...");
                break;
            }
        }

        while let Ok(accel) = accel_rx.try_recv() {
            for event in fusion.feed_accel(&accel) {
                if let FusionEvent::TimestampRejected { timestamp, previous } = event {
                    warn!("Accel sample at {:.3} not after {:.3}, dropped", timestamp, previous);
                }
            }
            readings.push(SensorReading {
                timestamp: accel.timestamp,
                accel: Some(accel),
                gps: None,
            });
        }

        while let Ok(gps) = gps_rx.try_recv() {
            last_hdop = Some(gps.hdop);
            for event in fusion.feed_gps(&gps) {
                match event {
                    FusionEvent::OriginSet { lat, lon } => {
                        info!("Origin set at {:.6}, {:.6}", lat, lon)
                    }
                    FusionEvent::CovarianceReset => warn!("Filter covariance reset"),
                    _ => {}
                }
            }
            readings.push(SensorReading {
                timestamp: gps.timestamp,
                accel: None,
                gps: Some(gps),
            });
        }

        // Update live status every 2 seconds
        let now = Utc::now();
        if now.signed_duration_since(last_status_update).num_seconds() >= 2 {
            let uptime = now.signed_duration_since(start).num_seconds().max(0) as u64;
            let status = LiveStatus::from_fusion(&fusion, uptime, last_hdop, target);
            if let Err(e) = status.save(&status_path) {
                warn!("Failed to write {}: {}", status_path.display(), e);
            }
            last_status_update = now;
        }

        if now.signed_duration_since(last_save).num_seconds() >= AUTOSAVE_INTERVAL_SECS {
            match write_session(&session_path, &config, &readings, &fusion) {
                Ok(()) => info!(
                    "Auto-saved {} readings to {}",
                    readings.len(),
                    session_path.display()
                ),
                Err(e) => warn!("Auto-save failed: {:#}", e),
            }
            last_save = now;
        }

        tokio::select! {
            res = &mut ctrl_c, if ctrl_c_armed => match res {
                Ok(()) => {
                    info!("Ctrl-C received, stopping...");
                    break;
                }
                Err(e) => {
                    warn!("Ctrl-C handler unavailable: {}", e);
                    ctrl_c_armed = false;
                }
            },
            _ = sleep(Duration::from_millis(1)) => {}
        }
    }

    // Final save
    let snapshot = fusion.snapshot();
    write_session(&session_path, &config, &readings, &fusion)?;
    info!("Final save: {} readings to {}", readings.len(), session_path.display());

    let uptime = Utc::now().signed_duration_since(start).num_seconds().max(0) as u64;
    let final_status = LiveStatus::from_fusion(&fusion, uptime, last_hdop, target);
    final_status.save(&status_path)?;

    println!("\n=== Final Stats ===");
    println!("Accel samples: {}", snapshot.accel_samples);
    println!(
        "GPS fixes: {} ({} rejected)",
        snapshot.gps_fixes, snapshot.gps_rejected
    );
    match fusion.fused_position() {
        Some(p) => println!("Fused position: {:.6}, {:.6}", p.lat, p.lon),
        None => println!("Fused position: unavailable"),
    }
    println!("Speed: {:.2} m/s", snapshot.ekf.speed);
    println!("Position uncertainty: {:.2} m", snapshot.ekf.uncertainty_m);
    if let Some(d) = final_status.distance_to_target_m {
        println!("Distance to target: {:.1} m", d);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_log_is_written_and_replayable() {
        let path = std::env::temp_dir().join(format!(
            "session_live_test_{}.json",
            std::process::id()
        ));
        let config = FusionConfig::default();
        let mut fusion = SensorFusion::new(config.clone());
        let mut readings = Vec::new();
        for step in 0..=50u32 {
            let t = step as f64 * 0.02;
            let accel = sensors::mock_accel_data(t, t);
            fusion.feed_accel(&accel);
            readings.push(SensorReading {
                timestamp: t,
                accel: Some(accel),
                gps: None,
            });
            if step % 10 == 0 {
                let gps = sensors::mock_gps_data(t, t);
                fusion.feed_gps(&gps);
                readings.push(SensorReading {
                    timestamp: t,
                    accel: None,
                    gps: Some(gps),
                });
            }
        }

        write_session(&path, &config, &readings, &fusion).unwrap();
        // A checkpoint is overwritten in place by the next save
        write_session(&path, &config, &readings, &fusion).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let log: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(log["readings"].as_array().unwrap().len(), 57);
        assert_eq!(log["final_snapshot"]["accel_samples"], 51);
        assert_eq!(log["final_snapshot"]["gps_fixes"], 6);
        assert_eq!(log["config"]["max_dt"], 0.5);

        let gps: GpsData = serde_json::from_value(log["readings"][1]["gps"].clone()).unwrap();
        assert_eq!(gps.timestamp, 0.0);
        std::fs::remove_file(&path).ok();
    }
}
