//! Raw timing mirror to a time-series store.
//!
//! Recording never blocks the measurement loop: points are handed to a
//! bounded channel and a background task batches them to InfluxDB.
//!
//! ```text
//!  EndpointLoop ──record()──► MetricsMirror ──try_send──► [channel] ──► InfluxWriter task
//!                                                                        │ every 20 points
//!                                                                        │ or every second
//!                                                                        ▼
//!                                                              POST /api/v2/write
//! ```

use crate::config::InfluxConfig;
use crate::error::{MonitorError, Result};
use crate::identity::Endpoint;
use crate::probe::{PhaseTimings, millis};
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};
use url::Url;

/// Points per write request.
pub const BATCH_SIZE: usize = 20;

/// Upper bound on how long a point waits in the batch.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

const CHANNEL_CAPACITY: usize = 1024;

/// One time-series sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, i64>,
    timestamp: DateTime<Utc>,
}

impl MetricPoint {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: i64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    #[must_use]
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, i64> {
        &self.fields
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Render as one line of InfluxDB line protocol with a nanosecond timestamp.
    #[must_use]
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            line.push_str(&escape(value, &[',', '=', ' ']));
        }

        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| format!("{}={}i", escape(key, &[',', '=', ' ']), value))
            .collect();
        line.push(' ');
        line.push_str(&fields.join(","));

        if let Some(nanos) = self.timestamp.timestamp_nanos_opt() {
            line.push(' ');
            line.push_str(&nanos.to_string());
        }
        line
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Destination for metric points.
pub trait MetricsSink: Send + Sync {
    /// Queue a point. Must not block.
    fn write_point(&self, point: MetricPoint);
}

/// Translates phase timings into points for an optional sink.
#[derive(Clone)]
pub struct MetricsMirror {
    sink: Option<Arc<dyn MetricsSink>>,
    measurement: String,
    monitor: String,
}

impl MetricsMirror {
    pub fn new(
        sink: Arc<dyn MetricsSink>,
        measurement: impl Into<String>,
        monitor: impl Into<String>,
    ) -> Self {
        Self {
            sink: Some(sink),
            measurement: measurement.into(),
            monitor: monitor.into(),
        }
    }

    /// A mirror that records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            sink: None,
            measurement: String::new(),
            monitor: String::new(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Point describing one measurement.
    #[must_use]
    pub fn point(&self, endpoint: &Endpoint, timings: &PhaseTimings, at: DateTime<Utc>) -> MetricPoint {
        let ms = |d| i64::try_from(millis(d)).unwrap_or(i64::MAX);
        MetricPoint::new(&self.measurement, at)
            .tag("relay", endpoint.normalized())
            .tag("monitor", &self.monitor)
            .field("dnslookup", ms(timings.dns_lookup))
            .field("tcpconnection", ms(timings.tcp_connection))
            .field("tlshandshake", ms(timings.tls_handshake))
            .field("wshandshake", ms(timings.ws_handshake))
            .field("wsrtt", ms(timings.message_round_trip))
            .field("totaltime", ms(timings.total()))
    }

    /// Hand the timings to the sink, if one is configured.
    pub fn record(&self, endpoint: &Endpoint, timings: &PhaseTimings, at: DateTime<Utc>) {
        if let Some(sink) = &self.sink {
            sink.write_point(self.point(endpoint, timings, at));
        }
    }
}

/// Batched InfluxDB v2 writer.
pub struct InfluxWriter {
    tx: mpsc::Sender<MetricPoint>,
}

impl InfluxWriter {
    /// Start the background flush task.
    ///
    /// The task exits, after a final flush, once every writer handle is dropped.
    pub fn spawn(config: &InfluxConfig) -> Result<(Self, JoinHandle<()>)> {
        let client = InfluxClient::new(config)?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(flush_loop(rx, client));
        Ok((Self { tx }, handle))
    }
}

impl MetricsSink for InfluxWriter {
    fn write_point(&self, point: MetricPoint) {
        if let Err(e) = self.tx.try_send(point) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("Metrics channel full, dropping point");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    warn!("Metrics writer stopped, dropping point");
                }
            }
        }
    }
}

struct InfluxClient {
    http: reqwest::Client,
    write_url: Url,
    token: String,
}

impl InfluxClient {
    fn new(config: &InfluxConfig) -> Result<Self> {
        let base = format!("{}/api/v2/write", config.url.trim_end_matches('/'));
        let write_url = Url::parse_with_params(
            &base,
            &[
                ("org", config.org.as_str()),
                ("bucket", config.bucket.as_str()),
                ("precision", "ns"),
            ],
        )
        .map_err(|e| MonitorError::InvalidConfig(format!("INFLUXDB_URL: {}", e)))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| MonitorError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            write_url,
            token: config.token.clone(),
        })
    }

    async fn write(&self, batch: &[MetricPoint]) -> std::result::Result<(), String> {
        let body = batch
            .iter()
            .map(MetricPoint::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");

        let resp = self
            .http
            .post(self.write_url.clone())
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", resp.status()))
        }
    }
}

async fn flush_loop(mut rx: mpsc::Receiver<MetricPoint>, client: InfluxClient) {
    let mut batch: Vec<MetricPoint> = Vec::with_capacity(BATCH_SIZE);
    let mut ticker = interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(point) => {
                    batch.push(point);
                    if batch.len() >= BATCH_SIZE {
                        flush(&client, &mut batch).await;
                    }
                }
                None => {
                    flush(&client, &mut batch).await;
                    debug!("Metrics writer stopped");
                    return;
                }
            },
            _ = ticker.tick() => flush(&client, &mut batch).await,
        }
    }
}

async fn flush(client: &InfluxClient, batch: &mut Vec<MetricPoint>) {
    if batch.is_empty() {
        return;
    }
    match client.write(batch).await {
        Ok(()) => debug!(points = batch.len(), "Metrics flushed"),
        Err(e) => warn!(points = batch.len(), "Metrics write failed: {}", e),
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoPoint;
    use crate::test_support::RecordingSink;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 5).unwrap()
    }

    #[test]
    fn test_line_protocol_rendering() {
        let point = MetricPoint::new("relay_latency", at())
            .tag("relay", "wss://relay.example/")
            .tag("monitor", "ams-1")
            .field("wsrtt", 15)
            .field("dnslookup", 5);
        assert_eq!(
            point.to_line_protocol(),
            "relay_latency,monitor=ams-1,relay=wss://relay.example/ dnslookup=5i,wsrtt=15i 1700000000000000005"
        );
    }

    #[test]
    fn test_line_protocol_escaping() {
        let point = MetricPoint::new("relay latency,v2", at())
            .tag("monitor", "home lab=1,a")
            .field("total time", 1);
        assert_eq!(
            point.to_line_protocol(),
            r"relay\ latency\,v2,monitor=home\ lab\=1\,a total\ time=1i 1700000000000000005"
        );
    }

    #[test]
    fn test_mirror_point_fields() {
        let sink = Arc::new(RecordingSink::default());
        let mirror = MetricsMirror::new(sink.clone(), "relay_latency", "ams-1");
        let endpoint = Endpoint::parse("ws://Relay.Test:80/sub", GeoPoint::default()).unwrap();

        mirror.record(&endpoint, &PhaseTimings::from_millis(5, 10, 0, 20, 15), at());

        let points = sink.points();
        assert_eq!(points.len(), 1);
        let point = &points[0];
        assert_eq!(point.measurement(), "relay_latency");
        assert_eq!(point.tags()["relay"], "ws://relay.test/sub");
        assert_eq!(point.tags()["monitor"], "ams-1");
        assert_eq!(point.fields()["dnslookup"], 5);
        assert_eq!(point.fields()["tcpconnection"], 10);
        assert_eq!(point.fields()["tlshandshake"], 0);
        assert_eq!(point.fields()["wshandshake"], 20);
        assert_eq!(point.fields()["wsrtt"], 15);
        assert_eq!(point.fields()["totaltime"], 50);
    }

    #[test]
    fn test_disabled_mirror_is_noop() {
        let mirror = MetricsMirror::disabled();
        assert!(!mirror.is_enabled());
        let endpoint = Endpoint::parse("wss://relay.example", GeoPoint::default()).unwrap();
        mirror.record(&endpoint, &PhaseTimings::default(), at());
    }

    #[test]
    fn test_write_point_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let writer = InfluxWriter { tx };
        writer.write_point(MetricPoint::new("m", at()).field("a", 1));
        writer.write_point(MetricPoint::new("m", at()).field("a", 2));
        assert_eq!(rx.try_recv().unwrap().fields()["a"], 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_writer_posts_batch() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;
        use tokio::sync::oneshot;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (request_tx, request_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&request).contains("wsrtt=15i") {
                    break;
                }
            }
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            let _ = request_tx.send(String::from_utf8_lossy(&request).into_owned());
        });

        let config = InfluxConfig {
            url: format!("http://{}/", addr),
            token: "secret-token".to_string(),
            org: "nostr".to_string(),
            bucket: "relays".to_string(),
            measurement: "relay_latency".to_string(),
        };
        let (writer, _handle) = InfluxWriter::spawn(&config).unwrap();
        writer.write_point(
            MetricPoint::new("relay_latency", at())
                .tag("relay", "wss://relay.example/")
                .field("wsrtt", 15),
        );

        let request = tokio::time::timeout(Duration::from_secs(5), request_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(request.starts_with("POST /api/v2/write?org=nostr&bucket=relays&precision=ns "));
        assert!(request.to_lowercase().contains("authorization: token secret-token"));
        assert!(request.contains("relay_latency,relay=wss://relay.example/ wsrtt=15i"));
    }
}
