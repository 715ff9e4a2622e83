//! Best-effort fan-out of signed events to destination relays.
//!
//! Every destination is attempted in configuration order. A failing
//! destination is recorded and skipped; it never prevents later destinations
//! from being tried.

use crate::error::{MonitorError, Result};
use crate::event::Event;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

/// Budget for opening a destination connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for the relay's `OK` acknowledgement.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

/// An open connection to one destination relay.
#[async_trait]
pub trait RelaySession: Send {
    /// Submit `event` and wait for the relay's verdict.
    async fn publish(&mut self, event: &Event) -> Result<()>;

    /// Close the connection. Errors are ignored.
    async fn close(&mut self);
}

/// Opens sessions to destination relays.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn RelaySession>>;
}

/// Per-destination results of one fan-out, in attempt order.
#[derive(Debug, Default)]
pub struct PublishOutcome {
    results: Vec<(String, Result<()>)>,
}

impl PublishOutcome {
    fn push(&mut self, destination: &str, result: Result<()>) {
        self.results.push((destination.to_string(), result));
    }

    /// Results in attempt order.
    #[must_use]
    pub fn results(&self) -> &[(String, Result<()>)] {
        &self.results
    }

    /// Destinations that accepted the event.
    pub fn accepted(&self) -> impl Iterator<Item = &str> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(d, _)| d.as_str())
    }

    /// Whether every destination accepted the event.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    /// `Ok` if every destination succeeded, otherwise the last failure.
    pub fn into_result(self) -> Result<()> {
        self.results
            .into_iter()
            .filter_map(|(_, r)| r.err())
            .last()
            .map_or(Ok(()), Err)
    }
}

/// Fans events out to a fixed destination list.
#[derive(Clone)]
pub struct Publisher {
    connector: Arc<dyn RelayConnector>,
    destinations: Vec<String>,
}

impl Publisher {
    pub fn new(connector: Arc<dyn RelayConnector>, destinations: Vec<String>) -> Self {
        Self {
            connector,
            destinations,
        }
    }

    #[must_use]
    pub fn destinations(&self) -> &[String] {
        &self.destinations
    }

    /// Publish `event` to every destination.
    pub async fn publish(&self, event: &Event) -> PublishOutcome {
        let mut outcome = PublishOutcome::default();

        for destination in &self.destinations {
            let mut session = match self.connector.connect(destination).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(destination = %destination, kind = event.kind, "Connect failed: {}", e);
                    outcome.push(destination, Err(e));
                    continue;
                }
            };

            let result = session.publish(event).await;
            session.close().await;

            match &result {
                Ok(()) => {
                    info!(destination = %destination, kind = event.kind, id = %event.id, "Event published");
                }
                Err(e) => {
                    warn!(destination = %destination, kind = event.kind, "Publish failed: {}", e);
                }
            }
            outcome.push(destination, result);
        }

        outcome
    }
}

/// Connector speaking the relay protocol over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
        }
    }
}

impl WebSocketConnector {
    #[must_use]
    pub fn new(connect_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            write_timeout,
        }
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn RelaySession>> {
        let (ws, _response) = timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| MonitorError::unreachable(url, "connect timed out"))?
            .map_err(|e| MonitorError::unreachable(url, e))?;

        debug!(destination = %url, "Connected");
        Ok(Box::new(WebSocketSession {
            url: url.to_string(),
            ws,
            write_timeout: self.write_timeout,
        }))
    }
}

struct WebSocketSession {
    url: String,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    write_timeout: Duration,
}

impl WebSocketSession {
    async fn await_ok(&mut self, id: &str) -> Result<()> {
        while let Some(frame) = self.ws.next().await {
            let text = match frame.map_err(|e| MonitorError::unreachable(&self.url, e))? {
                Message::Text(text) => text,
                Message::Close(_) => {
                    return Err(MonitorError::unreachable(
                        &self.url,
                        "relay closed the connection",
                    ));
                }
                _ => continue,
            };

            match parse_ok(&text, id) {
                Some(Ok(())) => return Ok(()),
                Some(Err(message)) => return Err(MonitorError::rejected(&self.url, message)),
                None => debug!(destination = %self.url, frame = %text, "Ignoring frame"),
            }
        }
        Err(MonitorError::unreachable(
            &self.url,
            "stream ended before acknowledgement",
        ))
    }
}

#[async_trait]
impl RelaySession for WebSocketSession {
    async fn publish(&mut self, event: &Event) -> Result<()> {
        let frame = serde_json::to_string(&("EVENT", event))
            .map_err(|e| MonitorError::rejected(&self.url, e))?;
        self.ws
            .send(Message::Text(frame))
            .await
            .map_err(|e| MonitorError::unreachable(&self.url, e))?;

        match timeout(self.write_timeout, self.await_ok(&event.id)).await {
            Ok(result) => result,
            Err(_) => Err(MonitorError::unreachable(
                &self.url,
                "no acknowledgement before write timeout",
            )),
        }
    }

    async fn close(&mut self) {
        match timeout(self.write_timeout, self.ws.close(None)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(destination = %self.url, "Close failed: {}", e),
            Err(_) => debug!(destination = %self.url, "Close timed out"),
        }
    }
}

/// Interpret a relay frame as the acknowledgement for `id`.
///
/// Returns `None` for anything that is not `["OK", id, ...]`, `Some(Ok)` when
/// the relay accepted, `Some(Err(message))` when it refused.
fn parse_ok(frame: &str, id: &str) -> Option<std::result::Result<(), String>> {
    let value: Value = serde_json::from_str(frame).ok()?;
    let items = value.as_array()?;
    if items.first()?.as_str()? != "OK" || items.get(1)?.as_str()? != id {
        return None;
    }

    let accepted = items.get(2).and_then(Value::as_bool).unwrap_or(false);
    if accepted {
        Some(Ok(()))
    } else {
        let message = items
            .get(3)
            .and_then(Value::as_str)
            .unwrap_or("rejected without message");
        Some(Err(message.to_string()))
    }
}
