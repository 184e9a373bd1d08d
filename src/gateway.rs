//! Gateway WebSocket link
//!
//! Owns the single outbound connection to the OneBot gateway. The link
//! splits into a reader (lazy inbound event sequence) and a writer
//! (outbound actions + keepalive pings) so the supervisor can service
//! both sides of the socket from one select loop.
//!
//! Reconnection is exponential backoff with jitter: the base delay
//! doubles from `reconnect_initial` up to `reconnect_max` and resets
//! after a successful connect.

use std::cmp;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::GatewayError;
use crate::onebot::{parse_event, InboundEvent, OutboundAction};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Interval between protocol-level keepalive pings
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Exponential reconnect backoff with a cap
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.reconnect_initial, config.reconnect_max)
    }

    /// Base delay for the next attempt; doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = cmp::min(delay.saturating_mul(2), self.max);
        delay
    }

    /// Back to the initial delay, called after a successful connect
    pub fn reset(&mut self) {
        self.next = self.initial;
    }

    /// Randomize a base delay into `[delay/2, delay]` so a fleet of
    /// reconnecting clients does not stampede the gateway
    pub fn jittered(delay: Duration) -> Duration {
        delay.mul_f64(0.5 + rand::random::<f64>() * 0.5)
    }
}

/// Inbound half of the gateway connection
pub struct GatewayReader {
    stream: WsSource,
    self_id: u64,
}

/// Outbound half of the gateway connection
pub struct GatewayWriter {
    sink: WsSink,
}

/// A live connection to the OneBot gateway
pub struct GatewayLink {
    reader: GatewayReader,
    writer: GatewayWriter,
}

impl GatewayLink {
    /// Dial the configured gateway address, bounding the handshake by
    /// `connect_timeout`
    pub async fn connect(config: &Config) -> Result<Self, GatewayError> {
        info!(url = %config.gateway_url, "connecting to gateway");

        let connect = connect_async(config.gateway_url.as_str());
        let (ws_stream, _response) = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| {
                GatewayError::Connect(format!(
                    "handshake timed out after {:?}",
                    config.connect_timeout
                ))
            })?
            .map_err(|e| GatewayError::Connect(e.to_string()))?;

        info!(url = %config.gateway_url, "gateway connected");

        let (sink, stream) = ws_stream.split();
        Ok(Self {
            reader: GatewayReader {
                stream,
                self_id: config.self_id,
            },
            writer: GatewayWriter { sink },
        })
    }

    /// Reconnect loop: retries `connect` with capped exponential
    /// backoff until it succeeds or `max_reconnects` attempts failed
    /// (0 means retry forever). Success resets the backoff.
    pub async fn connect_with_retry(
        config: &Config,
        backoff: &mut Backoff,
    ) -> Result<Self, GatewayError> {
        let mut attempts = 0u32;
        loop {
            match Self::connect(config).await {
                Ok(link) => {
                    backoff.reset();
                    return Ok(link);
                }
                Err(e) => {
                    attempts += 1;
                    if config.max_reconnects != 0 && attempts >= config.max_reconnects {
                        warn!(attempts, error = %e, "giving up on gateway reconnection");
                        return Err(e);
                    }
                    let delay = Backoff::jittered(backoff.next_delay());
                    warn!(error = %e, ?delay, "gateway connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Split into independently borrowable halves
    pub fn split(self) -> (GatewayReader, GatewayWriter) {
        (self.reader, self.writer)
    }

    /// Receive the next event without splitting (tests, simple callers)
    pub async fn next_event(&mut self) -> Option<InboundEvent> {
        self.reader.next_event().await
    }

    /// Send without splitting
    pub async fn send(&mut self, action: &OutboundAction) -> Result<(), GatewayError> {
        self.writer.send(action).await
    }
}

impl GatewayReader {
    /// Next classified-parseable inbound event.
    ///
    /// Malformed payloads and frames the bridge does not react to are
    /// logged and skipped; they never end the sequence. Returns `None`
    /// once the connection has dropped, after which the caller
    /// reconnects with a fresh link.
    pub async fn next_event(&mut self) -> Option<InboundEvent> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => match parse_event(&text, self.self_id) {
                    Ok(Some(event)) => {
                        trace!(key = %event.key, message_id = event.message_id, "inbound event");
                        return Some(event);
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "dropping malformed gateway payload");
                        continue;
                    }
                },
                Some(Ok(Message::Binary(_))) => {
                    trace!("ignoring binary frame");
                    continue;
                }
                // Pong for a received Ping is queued by the protocol
                // layer and flushed on the next outbound write
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "gateway closed the connection");
                    return None;
                }
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    warn!(error = %e, "gateway read error");
                    return None;
                }
                None => {
                    info!("gateway stream ended");
                    return None;
                }
            }
        }
    }
}

impl GatewayWriter {
    /// Transmit one outbound action. Fails fast when the connection is
    /// down; the caller logs and drops rather than queueing.
    pub async fn send(&mut self, action: &OutboundAction) -> Result<(), GatewayError> {
        let frame = action.to_json();
        debug!(len = frame.len(), "sending outbound action");
        self.sink
            .send(Message::Text(frame))
            .await
            .map_err(|e| GatewayError::Send(e.to_string()))
    }

    /// Keepalive ping; also flushes any queued pong replies
    pub async fn ping(&mut self) -> Result<(), GatewayError> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| GatewayError::Send(e.to_string()))
    }

    /// Close the outbound half cleanly during shutdown
    pub async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );
        // Non-decreasing, bounded by the cap
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
            assert!(pair[1] <= Duration::from_secs(10));
        }
    }

    #[test]
    fn backoff_reset_returns_to_initial() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let base = Duration::from_secs(8);
        for _ in 0..100 {
            let jittered = Backoff::jittered(base);
            assert!(jittered >= base / 2);
            assert!(jittered <= base);
        }
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_a_connect_error() {
        let config = Config {
            gateway_url: "ws://127.0.0.1:9".to_string(),
            connect_timeout: Duration::from_secs(2),
            ..Config::default()
        };
        match GatewayLink::connect(&config).await {
            Err(GatewayError::Connect(_)) => {}
            other => panic!("expected Connect error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn bounded_retry_gives_up() {
        let config = Config {
            gateway_url: "ws://127.0.0.1:9".to_string(),
            connect_timeout: Duration::from_millis(500),
            reconnect_initial: Duration::from_millis(1),
            reconnect_max: Duration::from_millis(2),
            max_reconnects: 2,
            ..Config::default()
        };
        let mut backoff = Backoff::from_config(&config);
        let result = GatewayLink::connect_with_retry(&config, &mut backoff).await;
        assert!(result.is_err());
    }
}
