//! Per-phase WebSocket latency probe.
//!
//! One probe opens a fresh connection and times each phase separately:
//!
//! ```text
//!   DNS lookup ─► TCP connect ─► TLS handshake ─► WS upgrade ─► REQ/first reply
//!   └──────────────────── open latency ────────────────────┘   └─ round trip ─┘
//! ```
//!
//! The TLS phase is zero for plain `ws://` relays.

use crate::error::{MonitorError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::{self, timeout, timeout_at};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::{WebSocketStream, client_async};
use tracing::debug;
use url::{Host, Url};

/// Subscription sent to measure the protocol round trip.
pub const PROBE_MESSAGE: &str = r#"["REQ", "1234abcdping", {"kinds": [1], "limit": 1}]"#;

/// Phase durations of one probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseTimings {
    pub dns_lookup: Duration,
    pub tcp_connection: Duration,
    pub tls_handshake: Duration,
    pub ws_handshake: Duration,
    pub message_round_trip: Duration,
}

impl PhaseTimings {
    /// Build timings from whole milliseconds.
    #[must_use]
    pub fn from_millis(dns: u64, tcp: u64, tls: u64, ws: u64, round_trip: u64) -> Self {
        Self {
            dns_lookup: Duration::from_millis(dns),
            tcp_connection: Duration::from_millis(tcp),
            tls_handshake: Duration::from_millis(tls),
            ws_handshake: Duration::from_millis(ws),
            message_round_trip: Duration::from_millis(round_trip),
        }
    }

    /// Sum of all phases.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.dns_lookup
            + self.tcp_connection
            + self.tls_handshake
            + self.ws_handshake
            + self.message_round_trip
    }

    /// Connection-open latency in milliseconds.
    ///
    /// Each phase is truncated to whole milliseconds before summing, so the
    /// value always matches the per-phase figures mirrored to the metrics sink.
    #[must_use]
    pub fn open_latency_ms(&self) -> u64 {
        millis(self.dns_lookup)
            + millis(self.tcp_connection)
            + millis(self.tls_handshake)
            + millis(self.ws_handshake)
    }

    /// Protocol round trip in milliseconds.
    #[must_use]
    pub fn round_trip_ms(&self) -> u64 {
        millis(self.message_round_trip)
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Outcome of a successful probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub timings: PhaseTimings,
    /// First frame the relay answered with
    pub response: String,
}

/// Latency measurement primitive.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Probe the relay at `url` by sending `message` and waiting for a reply.
    async fn measure(&self, url: &Url, message: &str, headers: &HeaderMap) -> Result<ProbeResult>;
}

/// Per-phase timeouts.
#[derive(Debug, Clone, Copy)]
pub struct ProbeTimeouts {
    /// Budget for the whole connection-open phase, DNS through WS upgrade
    pub open: Duration,
    /// Budget for the first reply
    pub read: Duration,
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            open: Duration::from_millis(5000),
            read: Duration::from_millis(15000),
        }
    }
}

/// Probe over a fresh TCP (+TLS) connection per measurement.
pub struct WebSocketProbe {
    tls: TlsConnector,
    timeouts: ProbeTimeouts,
}

impl WebSocketProbe {
    /// Create a probe trusting the webpki root set.
    pub fn new(timeouts: ProbeTimeouts) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| MonitorError::InvalidConfig(format!("TLS configuration: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
            timeouts,
        })
    }
}

/// Host in the form accepted by both `lookup_host` and rustls.
fn connect_host(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Domain(domain) => Some(domain.to_string()),
        Host::Ipv4(ip) => Some(ip.to_string()),
        Host::Ipv6(ip) => Some(ip.to_string()),
    }
}

fn build_request(url: &Url, headers: &HeaderMap) -> std::result::Result<Request, String> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| format!("invalid request: {}", e))?;
    request.headers_mut().extend(headers.clone());
    Ok(request)
}

#[async_trait]
impl LatencyProbe for WebSocketProbe {
    async fn measure(&self, url: &Url, message: &str, headers: &HeaderMap) -> Result<ProbeResult> {
        let target = url.as_str();
        let host = connect_host(url).ok_or_else(|| MonitorError::measurement(target, "missing host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| MonitorError::measurement(target, "missing port"))?;
        let request = build_request(url, headers).map_err(|e| MonitorError::measurement(target, e))?;
        let mut timings = PhaseTimings::default();
        let open_deadline = time::Instant::now() + self.timeouts.open;

        let started = Instant::now();
        let addr = timeout_at(open_deadline, lookup_host((host.as_str(), port)))
            .await
            .map_err(|_| MonitorError::measurement(target, "DNS lookup timed out"))?
            .map_err(|e| MonitorError::measurement(target, format!("DNS lookup: {}", e)))?
            .next()
            .ok_or_else(|| MonitorError::measurement(target, "DNS lookup returned no address"))?;
        timings.dns_lookup = started.elapsed();

        let started = Instant::now();
        let tcp = timeout_at(open_deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| MonitorError::measurement(target, "TCP connect timed out"))?
            .map_err(|e| MonitorError::measurement(target, format!("TCP connect: {}", e)))?;
        timings.tcp_connection = started.elapsed();
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(relay = %target, "set_nodelay failed: {}", e);
        }

        let exchanged = if url.scheme() == "wss" {
            let server_name = ServerName::try_from(host)
                .map_err(|e| MonitorError::measurement(target, format!("server name: {}", e)))?;

            let started = Instant::now();
            let tls = timeout_at(open_deadline, self.tls.connect(server_name, tcp))
                .await
                .map_err(|_| MonitorError::measurement(target, "TLS handshake timed out"))?
                .map_err(|e| MonitorError::measurement(target, format!("TLS handshake: {}", e)))?;
            timings.tls_handshake = started.elapsed();

            exchange(tls, request, message, open_deadline, self.timeouts.read, &mut timings).await
        } else {
            exchange(tcp, request, message, open_deadline, self.timeouts.read, &mut timings).await
        };

        let response = exchanged.map_err(|e| MonitorError::measurement(target, e))?;
        Ok(ProbeResult { timings, response })
    }
}

/// Upgrade `stream` before `open_deadline`, send the probe and wait up to
/// `read` for the first reply.
async fn exchange<S>(
    stream: S,
    request: Request,
    message: &str,
    open_deadline: time::Instant,
    read: Duration,
    timings: &mut PhaseTimings,
) -> std::result::Result<String, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let started = Instant::now();
    let (mut ws, _response) = timeout_at(open_deadline, client_async(request, stream))
        .await
        .map_err(|_| "WebSocket handshake timed out".to_string())?
        .map_err(|e| format!("WebSocket handshake: {}", e))?;
    timings.ws_handshake = started.elapsed();

    let started = Instant::now();
    ws.send(Message::Text(message.to_string()))
        .await
        .map_err(|e| format!("send probe: {}", e))?;
    let reply = timeout(read, first_reply(&mut ws))
        .await
        .map_err(|_| "no reply before read timeout".to_string())??;
    timings.message_round_trip = started.elapsed();

    match timeout(read, ws.close(None)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("close after probe: {}", e),
        Err(_) => debug!("close after probe timed out"),
    }
    Ok(reply)
}

async fn first_reply<S>(ws: &mut WebSocketStream<S>) -> std::result::Result<String, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = ws.next().await {
        match frame.map_err(|e| format!("read reply: {}", e))? {
            Message::Text(text) => return Ok(text),
            Message::Binary(data) => return Ok(String::from_utf8_lossy(&data).into_owned()),
            Message::Close(_) => return Err("relay closed the connection".to_string()),
            _ => continue,
        }
    }
    Err("stream ended before reply".to_string())
}
