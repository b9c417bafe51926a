use crate::buffer::{MotionRecord, PositionRecord, RecordBatch, TelemetryBatch};
use crate::error::{Result, TelemetryError};
use crate::sink::{CloseRequest, SessionRegistry, TelemetrySink};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const USER_AGENT: &str = concat!("drive-telemetry/", env!("CARGO_PKG_VERSION"));

/// Wire form of a motion record. Axis names follow the logging server:
/// `g_x` lateral, `g_y` vertical, `g_z` longitudinal.
#[derive(Debug, Clone, PartialEq, Serialize)]
struct GLog {
    timestamp: i64,
    g_x: f64,
    g_y: f64,
    g_z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct GpsLog {
    timestamp: i64,
    latitude: f64,
    longitude: f64,
    speed: f64,
    event: &'static str,
    g_x: f64,
    g_y: f64,
    g_z: f64,
}

fn millis(timestamp: f64) -> i64 {
    (timestamp * 1000.0).round() as i64
}

impl From<&MotionRecord> for GLog {
    fn from(r: &MotionRecord) -> Self {
        Self {
            timestamp: millis(r.timestamp),
            g_x: r.side_g,
            g_y: r.up_g,
            g_z: r.forward_g,
        }
    }
}

impl From<&PositionRecord> for GpsLog {
    fn from(r: &PositionRecord) -> Self {
        Self {
            timestamp: millis(r.timestamp),
            latitude: r.latitude,
            longitude: r.longitude,
            speed: r.speed_kmh,
            event: r.event.as_str(),
            g_x: r.side_g,
            g_y: r.up_g,
            g_z: r.forward_g,
        }
    }
}

#[derive(Debug, Serialize)]
struct GLogBody<'a> {
    session_id: &'a str,
    g_logs: Vec<GLog>,
}

#[derive(Debug, Serialize)]
struct GpsLogBody<'a> {
    session_id: &'a str,
    gps_logs: Vec<GpsLog>,
}

#[derive(Debug, Serialize)]
struct EndBody<'a> {
    session_id: &'a str,
    distance: f64,
    sudden_accels: u32,
    sudden_brakes: u32,
    sharp_turns: u32,
    speed_violations: u32,
    stability: u32,
    duration_secs: f64,
}

impl<'a> From<&'a CloseRequest> for EndBody<'a> {
    fn from(r: &'a CloseRequest) -> Self {
        Self {
            session_id: &r.session_id,
            distance: r.distance_km,
            sudden_accels: r.counters.accel,
            sudden_brakes: r.counters.brake,
            sharp_turns: r.counters.turn,
            speed_violations: r.counters.violation,
            stability: r.stability_score,
            duration_secs: r.duration_secs,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    session_id: Option<String>,
}

/// Endpoint path and JSON body for one batch
fn batch_request(batch: &TelemetryBatch) -> Result<(&'static str, serde_json::Value)> {
    let session_id = batch.ticket.session_id.as_str();
    let body = match &batch.records {
        RecordBatch::Motion(records) => (
            "log_g_only",
            serde_json::to_value(GLogBody {
                session_id,
                g_logs: records.iter().map(GLog::from).collect(),
            }),
        ),
        RecordBatch::Position(records) => (
            "log_gps_bulk",
            serde_json::to_value(GpsLogBody {
                session_id,
                gps_logs: records.iter().map(GpsLog::from).collect(),
            }),
        ),
    };

    match body {
        (path, Ok(value)) => Ok((path, value)),
        (_, Err(e)) => Err(TelemetryError::SinkDeliveryFailure(format!(
            "failed to encode batch: {e}"
        ))),
    }
}

fn parse_start_response(body: &str) -> Result<String> {
    let response: StartResponse = serde_json::from_str(body)
        .map_err(|e| TelemetryError::SessionOpenFailure(format!("bad response: {e}")))?;

    if response.status.as_deref() == Some("warning") {
        // Server resumed an already active session for this user
        warn!(
            "session start warning: {}",
            response.message.as_deref().unwrap_or("existing session reused")
        );
    }

    response
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| TelemetryError::SessionOpenFailure("response missing session_id".into()))
}

/// Shared reqwest client bound to one server
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> std::result::Result<String, String> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    format!("{path}: request timed out")
                } else {
                    format!("{path}: {e}")
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| format!("{path}: failed to read response: {e}"))?;

        if !status.is_success() {
            return Err(format!("{path}: HTTP {}", status.as_u16()));
        }
        Ok(text)
    }
}

/// Delivers batches to `/log_g_only` and `/log_gps_bulk`
#[derive(Clone, Debug)]
pub struct HttpSink {
    http: HttpClient,
}

impl HttpSink {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

impl TelemetrySink for HttpSink {
    fn deliver<'a>(&'a self, batch: &'a TelemetryBatch) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let (path, body) = batch_request(batch)?;
            self.http
                .post(path, &body)
                .await
                .map_err(TelemetryError::SinkDeliveryFailure)?;
            debug!("posted {} records to /{}", batch.records.len(), path);
            Ok(())
        })
    }
}

/// Opens sessions with `/start` and closes them with `/end`
#[derive(Clone, Debug)]
pub struct HttpRegistry {
    http: HttpClient,
}

impl HttpRegistry {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

impl SessionRegistry for HttpRegistry {
    fn open(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let body = self
                .http
                .post("start", &serde_json::json!({}))
                .await
                .map_err(TelemetryError::SessionOpenFailure)?;
            let id = parse_start_response(&body)?;
            info!("server opened session {id}");
            Ok(id)
        })
    }

    fn close<'a>(&'a self, request: &'a CloseRequest) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let body = serde_json::to_value(EndBody::from(request))
                .map_err(|e| TelemetryError::SessionCloseFailure(e.to_string()))?;
            self.http
                .post("end", &body)
                .await
                .map_err(TelemetryError::SessionCloseFailure)?;
            Ok(())
        })
    }
}
