use crate::engine::{EngineHandle, SensorEvent};
use crate::error::{Result, TelemetryError};
use crate::types::{PositionFix, RawMotion};
use flate2::read::GzDecoder;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tokio::time::{sleep, Duration};

/// Longest pause honoured between readings in realtime mode
const MAX_REPLAY_GAP_SECS: f64 = 5.0;

/// One line of a recorded drive
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub timestamp: f64,
    #[serde(default)]
    pub accel: Option<RawMotion>,
    #[serde(default)]
    pub gps: Option<PositionFix>,
}

#[derive(Deserialize)]
struct Recording {
    readings: Vec<SensorReading>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub readings: usize,
    pub motion_samples: usize,
    pub position_fixes: usize,
    /// Readings with neither accel nor gps
    pub empty: usize,
}

/// Parse a `{ "readings": [...] }` document or JSON lines
pub fn parse_readings(text: &str) -> Result<Vec<SensorReading>> {
    if let Ok(recording) = serde_json::from_str::<Recording>(text) {
        return Ok(recording.readings);
    }

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<SensorReading>(line).map_err(|e| {
                TelemetryError::InvalidInput(format!("line {}: {e}", i + 1))
            })
        })
        .collect()
}

/// Load a recording, transparently gunzipping `*.gz` files
pub fn load_readings(path: &Path) -> Result<Vec<SensorReading>> {
    let file = File::open(path)
        .map_err(|e| TelemetryError::InvalidInput(format!("{}: {e}", path.display())))?;

    let mut text = String::new();
    let read = if path.extension().is_some_and(|ext| ext == "gz") {
        GzDecoder::new(BufReader::new(file)).read_to_string(&mut text)
    } else {
        BufReader::new(file).read_to_string(&mut text)
    };
    read.map_err(|e| TelemetryError::InvalidInput(format!("{}: {e}", path.display())))?;

    let readings = parse_readings(&text)?;
    debug!("loaded {} readings from {}", readings.len(), path.display());
    Ok(readings)
}

/// Feed a recording into the engine, accel before gps within each reading.
///
/// Uses the awaiting send so no sample is dropped. With `realtime` the original
/// spacing between readings is reproduced.
pub async fn replay(
    readings: &[SensorReading],
    handle: &EngineHandle,
    realtime: bool,
) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    let mut previous: Option<f64> = None;

    for reading in readings {
        if realtime {
            if let Some(prev) = previous {
                let gap = (reading.timestamp - prev).clamp(0.0, MAX_REPLAY_GAP_SECS);
                if gap > 0.0 {
                    sleep(Duration::from_secs_f64(gap)).await;
                }
            }
            previous = Some(reading.timestamp);
        }

        stats.readings += 1;
        if reading.accel.is_none() && reading.gps.is_none() {
            stats.empty += 1;
            continue;
        }
        if let Some(accel) = reading.accel {
            handle.send(SensorEvent::Motion(accel)).await?;
            stats.motion_samples += 1;
        }
        if let Some(gps) = reading.gps {
            handle.send(SensorEvent::Position(gps)).await?;
            stats.position_fixes += 1;
        }

        if stats.readings % 1000 == 0 {
            debug!("[replay] {} readings", stats.readings);
        }
    }

    info!(
        "[replay] {} readings: {} motion, {} position",
        stats.readings, stats.motion_samples, stats.position_fixes
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::Engine;
    use crate::session::SessionController;
    use crate::sink::{LocalRegistry, MemorySink};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::sync::Arc;

    const LINES: &str = r#"
{"timestamp":0.0,"accel":{"timestamp":0.0,"x":0.0,"y":-9.8,"z":0.0}}
{"timestamp":0.5,"gps":{"timestamp":0.5,"latitude":35.0,"longitude":139.0,"speed":5.0,"bearing":90.0,"accuracy":4.0}}
{"timestamp":1.0}
"#;

    #[test]
    fn test_parse_json_lines() {
        let readings = parse_readings(LINES).unwrap();
        assert_eq!(readings.len(), 3);
        assert!(readings[0].accel.is_some());
        assert_eq!(readings[1].gps.unwrap().speed, Some(5.0));
        assert!(readings[2].accel.is_none() && readings[2].gps.is_none());
    }

    #[test]
    fn test_parse_wrapped_document() {
        let doc = r#"{"readings":[{"timestamp":1.0,"accel":{"timestamp":1.0,"x":1.0,"y":2.0,"z":3.0}}]}"#;
        let readings = parse_readings(doc).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].accel.unwrap().z, 3.0);
    }

    #[test]
    fn test_parse_error_names_line() {
        let err = parse_readings("{\"timestamp\":0.0}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[test]
    fn test_load_gzipped_recording() {
        let path = std::env::temp_dir().join(format!("drive_replay_{}.jsonl.gz", std::process::id()));
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(LINES.as_bytes()).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        let readings = load_readings(&path).unwrap();
        assert_eq!(readings.len(), 3);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_replay_into_engine() {
        let config = Config {
            orientation_override: Some(crate::calibration::OrientationMode::Default),
            ..Config::default()
        };
        let sink = Arc::new(MemorySink::new());
        let controller =
            SessionController::new(config.clone(), sink.clone(), Arc::new(LocalRegistry::new()));
        let (engine, handle) = Engine::new(controller, &config);
        tokio::spawn(engine.run());

        handle.start().await.unwrap();
        let stats = replay(&parse_readings(LINES).unwrap(), &handle, false)
            .await
            .unwrap();
        assert_eq!(stats.motion_samples, 1);
        assert_eq!(stats.position_fixes, 1);
        assert_eq!(stats.empty, 1);

        handle.end().await.unwrap();
        assert_eq!(sink.motion_records(), 1);
        assert_eq!(sink.position_records(), 1);
    }
}
