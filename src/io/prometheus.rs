//! Prometheus metrics and stream control HTTP endpoint
//!
//! Exposes facegate metrics in Prometheus text format at /metrics, plus a
//! small JSON control surface for pausing and resuming camera streams.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::io::mqtt::ConnectionState;
use crate::services::stream::{StreamControl, StreamHandle};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, streams: &[StreamHandle], site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_frame_metrics(&mut output, site_id, &summary);
    write_decision_metrics(&mut output, site_id, &summary);
    write_transport_metrics(&mut output, site_id, &summary);
    write_stream_metrics(&mut output, site_id, &summary, streams);

    output
}

fn write_frame_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "facegate_frames_received_total",
        "Frames received from the match source",
        MetricType::Counter,
        site,
        summary.frames_received,
    );
    write_metric(
        output,
        "facegate_frames_dropped_total",
        "Frames dropped while a classification was in flight",
        MetricType::Counter,
        site,
        summary.frames_dropped,
    );
    write_metric(
        output,
        "facegate_frames_processed_total",
        "Frames run through the decision step",
        MetricType::Counter,
        site,
        summary.frames_processed,
    );
    let _ = writeln!(output, "# HELP facegate_frames_per_sec Frames processed per second");
    let _ = writeln!(output, "# TYPE facegate_frames_per_sec gauge");
    let _ = writeln!(output, "facegate_frames_per_sec{{site=\"{site}\"}} {:.2}", summary.frames_per_sec);

    write_histogram(
        output,
        "facegate_step_latency_us",
        "Classification and decision step latency in microseconds",
        site,
        &summary.step_lat_buckets,
        summary.step_lat_avg_us,
    );
    write_metric(
        output,
        "facegate_step_latency_p99_us",
        "99th percentile step latency",
        MetricType::Gauge,
        site,
        summary.step_lat_p99_us,
    );
}

fn write_decision_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let _ = writeln!(output, "# HELP facegate_access_commands_total Access commands emitted");
    let _ = writeln!(output, "# TYPE facegate_access_commands_total counter");
    for (kind, val) in [
        ("unlock", summary.unlock_commands),
        ("deny", summary.deny_commands),
        ("cooldown", summary.cooldown_commands),
    ] {
        let _ = writeln!(output, "facegate_access_commands_total{{site=\"{site}\",type=\"{kind}\"}} {val}");
    }
    write_metric(
        output,
        "facegate_cooldown_suppressed_total",
        "Stable votes held back by a cooldown window",
        MetricType::Counter,
        site,
        summary.cooldown_suppressed,
    );
    write_metric(
        output,
        "facegate_commands_dropped_total",
        "Commands dropped because the command queue was full",
        MetricType::Counter,
        site,
        summary.commands_dropped,
    );
    write_metric(
        output,
        "facegate_roster_size",
        "Enrolled identities in the current roster",
        MetricType::Gauge,
        site,
        summary.roster_size,
    );
    write_metric(
        output,
        "facegate_roster_refresh_failures_total",
        "Roster loads that failed",
        MetricType::Counter,
        site,
        summary.roster_refresh_failures,
    );
    write_metric(
        output,
        "facegate_audit_failures_total",
        "Audit records that could not be written",
        MetricType::Counter,
        site,
        summary.audit_failures,
    );
}

fn write_transport_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    let _ = writeln!(output, "# HELP facegate_publish_total Access command publish attempts");
    let _ = writeln!(output, "# TYPE facegate_publish_total counter");
    let _ = writeln!(output, "facegate_publish_total{{site=\"{site}\",result=\"ok\"}} {}", summary.publish_ok);
    let _ = writeln!(output, "facegate_publish_total{{site=\"{site}\",result=\"failed\"}} {}", summary.publish_failed);

    write_metric(
        output,
        "facegate_mqtt_state",
        "MQTT connection state (0=disconnected, 1=connecting, 2=connected)",
        MetricType::Gauge,
        site,
        summary.mqtt_state,
    );
    write_metric(
        output,
        "facegate_mqtt_reconnects_total",
        "MQTT connection losses",
        MetricType::Counter,
        site,
        summary.mqtt_reconnects,
    );
    write_metric(
        output,
        "facegate_malformed_payloads_total",
        "Inbound payloads rejected as malformed",
        MetricType::Counter,
        site,
        summary.malformed_payloads,
    );
    write_metric(
        output,
        "facegate_inbound_dropped_total",
        "Inbound messages dropped because the consumer was busy",
        MetricType::Counter,
        site,
        summary.inbound_dropped,
    );
    write_metric(
        output,
        "facegate_motion_events_total",
        "Motion events received",
        MetricType::Counter,
        site,
        summary.motion_events,
    );
}

fn write_stream_metrics(output: &mut String, site: &str, summary: &MetricsSummary, streams: &[StreamHandle]) {
    write_metric(
        output,
        "facegate_stream_wakes_total",
        "Paused streams resumed by motion",
        MetricType::Counter,
        site,
        summary.stream_wakes,
    );
    write_metric(
        output,
        "facegate_auto_pauses_total",
        "Streams paused after the idle window",
        MetricType::Counter,
        site,
        summary.auto_pauses,
    );
    let _ = writeln!(output, "# HELP facegate_stream_paused Whether a camera stream is paused");
    let _ = writeln!(output, "# TYPE facegate_stream_paused gauge");
    for stream in streams {
        let _ = writeln!(
            output,
            "facegate_stream_paused{{site=\"{site}\",camera_id=\"{}\"}} {}",
            stream.camera_id(),
            u8::from(stream.is_paused())
        );
    }
}

#[derive(Serialize)]
struct StreamStatus<'a> {
    camera_id: &'a str,
    paused: bool,
}

#[derive(Serialize)]
struct StatusBody<'a> {
    site: &'a str,
    mqtt: &'static str,
    streams: Vec<StreamStatus<'a>>,
}

/// Shared state for request handlers
struct HttpState {
    metrics: Arc<Metrics>,
    site_id: String,
    connection: watch::Receiver<ConnectionState>,
    streams: Vec<StreamHandle>,
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn text_response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(body.into()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn status_body(state: &HttpState) -> String {
    let body = StatusBody {
        site: &state.site_id,
        mqtt: state.connection.borrow().as_str(),
        streams: state
            .streams
            .iter()
            .map(|s| StreamStatus { camera_id: s.camera_id(), paused: s.is_paused() })
            .collect(),
    };
    serde_json::to_string(&body).unwrap_or_default()
}

/// POST /streams/{camera_id}/{pause|resume}
fn stream_control(state: &HttpState, path: &str) -> Response<Full<Bytes>> {
    let Some(rest) = path.strip_prefix("/streams/") else {
        return text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found");
    };
    let (camera_id, control) = match rest.rsplit_once('/') {
        Some((camera_id, "pause")) => (camera_id, StreamControl::Pause),
        Some((camera_id, "resume")) => (camera_id, StreamControl::Resume),
        _ => return text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };

    let Some(stream) = state.streams.iter().find(|s| s.camera_id() == camera_id) else {
        return json_response(StatusCode::NOT_FOUND, r#"{"ok":false,"error":"unknown_camera"}"#.to_string());
    };

    if stream.send(control) {
        info!(camera_id = %camera_id, control = ?control, "stream_control_requested");
        json_response(StatusCode::ACCEPTED, r#"{"ok":true}"#.to_string())
    } else {
        json_response(StatusCode::SERVICE_UNAVAILABLE, r#"{"ok":false,"error":"stream_unavailable"}"#.to_string())
    }
}

fn route(method: &Method, path: &str, state: &HttpState) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&state.metrics, &state.streams, &state.site_id),
        ),
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "ok"),
        (&Method::GET, "/status") => json_response(StatusCode::OK, status_body(state)),
        (&Method::POST, p) if p.starts_with("/streams/") => stream_control(state, p),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<HttpState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), &state))
}

/// Start the metrics and control HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    connection: watch::Receiver<ConnectionState>,
    streams: Vec<StreamHandle>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, site = %site_id, streams = %streams.len(), "metrics_server_started");
    let state = Arc::new(HttpState { metrics, site_id, connection, streams });

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, state.clone()));

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "metrics_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "metrics_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{CommandType, Roster};
    use crate::services::classifier::MatchClassifier;
    use crate::services::command_worker::command_channel;
    use crate::services::cooldown::CooldownRegistry;
    use crate::services::decision::{DecisionEngine, DecisionPolicy};
    use crate::services::stream::{create_stream_worker, StreamWorker};
    use http_body_util::BodyExt;
    use tokio::sync::mpsc;

    fn stream(camera_id: &str, metrics: &Arc<Metrics>) -> (StreamHandle, StreamWorker) {
        let (_roster_tx, roster_rx) = watch::channel(Arc::new(Roster::default()));
        let (_frames_tx, frames_rx) = mpsc::channel(1);
        let (commands, _commands_rx) = command_channel(1, metrics.clone());
        let engine = DecisionEngine::new(camera_id, DecisionPolicy::default(), CooldownRegistry::shared());
        create_stream_worker(engine, MatchClassifier::default(), roster_rx, frames_rx, commands, metrics.clone())
    }

    fn state(streams: Vec<StreamHandle>, metrics: Arc<Metrics>) -> HttpState {
        let (_tx, connection) = watch::channel(ConnectionState::Connected);
        HttpState { metrics, site_id: "lab".to_string(), connection, streams }
    }

    async fn body_string(resp: Response<Full<Bytes>>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Arc::new(Metrics::new());
        metrics.record_step(150);
        metrics.record_step(250);
        metrics.record_command(CommandType::Unlock);
        metrics.record_publish(true);
        let (handle, _worker) = stream("front", &metrics);

        let output = format_prometheus_metrics(&metrics, &[handle], "lab");

        assert!(output.contains("facegate_frames_processed_total{site=\"lab\"} 2"));
        assert!(output.contains("facegate_step_latency_us_bucket{site=\"lab\",le=\"+Inf\"} 2"));
        assert!(output.contains("facegate_access_commands_total{site=\"lab\",type=\"unlock\"} 1"));
        assert!(output.contains("facegate_publish_total{site=\"lab\",result=\"ok\"} 1"));
        assert!(output.contains("facegate_stream_paused{site=\"lab\",camera_id=\"front\"} 0"));
    }

    #[tokio::test]
    async fn test_status_reports_connection_and_streams() {
        let metrics = Arc::new(Metrics::new());
        let (handle, _worker) = stream("front", &metrics);
        let state = state(vec![handle], metrics);

        let resp = route(&Method::GET, "/status", &state);
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["mqtt"], "connected");
        assert_eq!(body["streams"][0]["camera_id"], "front");
        assert_eq!(body["streams"][0]["paused"], false);
    }

    #[test]
    fn test_pause_request_reaches_worker() {
        let metrics = Arc::new(Metrics::new());
        let (handle, mut worker) = stream("front", &metrics);
        let state = state(vec![handle.clone()], metrics);

        let resp = route(&Method::POST, "/streams/front/pause", &state);
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(!handle.is_paused());

        assert_eq!(worker.poll_control(std::time::Instant::now()), 1);
        assert!(handle.is_paused());
    }

    #[test]
    fn test_unknown_camera_is_404() {
        let metrics = Arc::new(Metrics::new());
        let (handle, _worker) = stream("front", &metrics);
        let state = state(vec![handle], metrics);

        assert_eq!(route(&Method::POST, "/streams/back/resume", &state).status(), StatusCode::NOT_FOUND);
        assert_eq!(route(&Method::POST, "/streams/front/reboot", &state).status(), StatusCode::NOT_FOUND);
        assert_eq!(route(&Method::GET, "/nope", &state).status(), StatusCode::NOT_FOUND);
    }
}
