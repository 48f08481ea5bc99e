use super::backoff::Backoff;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Published on every state change. `retry_in` is set while waiting out a
/// reconnection delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub retry_in: Option<Duration>,
}

impl ChannelStatus {
    const DISCONNECTED: Self = Self {
        state: ChannelState::Disconnected,
        retry_in: None,
    };
}

/// Conditions under which the channel may hold a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelGate {
    pub foreground: bool,
    pub online: bool,
}

impl ChannelGate {
    pub fn allows(&self) -> bool {
        self.foreground && self.online
    }
}

/// What an incoming message means to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Application `{"type":"ping"}` or protocol ping/pong; dropped
    Keepalive,
    /// Anything else; its content is not interpreted
    RefreshHint,
    Closed,
}

pub fn classify(message: &Message) -> Signal {
    match message {
        Message::Text(text) => {
            let is_ping = serde_json::from_str::<serde_json::Value>(text.as_str())
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "ping"))
                .unwrap_or(false);
            if is_ping {
                Signal::Keepalive
            } else {
                Signal::RefreshHint
            }
        }
        Message::Binary(_) => Signal::RefreshHint,
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Signal::Keepalive,
        Message::Close(_) => Signal::Closed,
    }
}

/// Derives the socket URL from the HTTP base: `https` → `wss`, `http` → `ws`,
/// with `path` appended to the base path.
pub fn realtime_url(base: &Url, path: &str) -> Option<Url> {
    let scheme = match base.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return None,
    };
    let mut url = base.clone();
    url.set_scheme(scheme).ok()?;
    {
        let mut segments = url.path_segments_mut().ok()?;
        segments
            .pop_if_empty()
            .extend(path.split('/').filter(|s| !s.is_empty()));
    }
    url.set_query(None);
    Some(url)
}

enum SessionEnd {
    Cancelled,
    /// Backgrounded or offline; no reconnection is scheduled
    Gated,
    Dropped(String),
}

/// Handshake and silence limits for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTimeouts {
    /// TCP connect plus websocket upgrade
    pub connect: Duration,
    /// Longest gap between frames (keepalives included) before the
    /// connection is presumed dead. `None` waits forever.
    pub idle: Option<Duration>,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(12),
            idle: Some(Duration::from_secs(90)),
        }
    }
}

/// Push-notification connection with exponential-backoff reconnection.
///
/// Carries no item data: every non-keepalive message becomes a unit hint on
/// `hints`. Failures are never surfaced, they only schedule a reconnect.
pub struct RealtimeChannel {
    url: Url,
    backoff: Backoff,
    timeouts: ChannelTimeouts,
    gate: ChannelGate,
    status_tx: watch::Sender<ChannelStatus>,
}

impl RealtimeChannel {
    pub fn new(url: Url, backoff: Backoff) -> Self {
        let (status_tx, _) = watch::channel(ChannelStatus::DISCONNECTED);
        Self {
            url,
            backoff,
            timeouts: ChannelTimeouts::default(),
            gate: ChannelGate {
                foreground: false,
                online: false,
            },
            status_tx,
        }
    }

    pub fn with_timeouts(mut self, timeouts: ChannelTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    fn set_status(&self, state: ChannelState, retry_in: Option<Duration>) {
        self.status_tx.send_replace(ChannelStatus { state, retry_in });
    }

    /// Reads the latest gate; regaining connectivity resets the backoff.
    fn observe_gate(&mut self, gate: &mut watch::Receiver<ChannelGate>) -> ChannelGate {
        let next = *gate.borrow_and_update();
        if next.online && !self.gate.online {
            self.backoff.reset();
        }
        self.gate = next;
        next
    }

    /// Runs until `cancel` fires or the gate sender is dropped.
    pub async fn run(
        mut self,
        mut gate: watch::Receiver<ChannelGate>,
        hints: mpsc::Sender<()>,
        cancel: CancellationToken,
    ) {
        loop {
            if !self.observe_gate(&mut gate).allows() {
                self.set_status(ChannelState::Disconnected, None);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = gate.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            self.set_status(ChannelState::Connecting, None);
            tracing::debug!(url = %self.url, "Connecting realtime channel");

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                changed = gate.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // Re-evaluate before trying again
                    continue;
                }
                result = tokio::time::timeout(
                    self.timeouts.connect,
                    connect_async(self.url.as_str()),
                ) => result,
            };

            match connected {
                Ok(Ok((socket, _response))) => {
                    self.backoff.reset();
                    self.set_status(ChannelState::Connected, None);
                    tracing::info!(url = %self.url, "Realtime channel connected");

                    match self.session(socket, &mut gate, &hints, &cancel).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Gated => {
                            tracing::info!("Realtime channel torn down (background or offline)");
                            continue;
                        }
                        SessionEnd::Dropped(reason) => {
                            tracing::info!(reason = %reason, "Realtime channel disconnected");
                        }
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(url = %self.url, error = %e, "Realtime connect failed");
                }
                Err(_) => {
                    tracing::debug!(
                        url = %self.url,
                        timeout_secs = self.timeouts.connect.as_secs_f64(),
                        "Realtime connect timed out"
                    );
                }
            }

            let delay = self.backoff.next_delay();
            self.set_status(ChannelState::Disconnected, Some(delay));
            tracing::debug!(delay_secs = delay.as_secs_f64(), "Scheduling realtime reconnect");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                changed = gate.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.set_status(ChannelState::Disconnected, None);
        tracing::debug!("Realtime channel stopped");
    }

    async fn session(
        &mut self,
        socket: Socket,
        gate: &mut watch::Receiver<ChannelGate>,
        hints: &mpsc::Sender<()>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (mut write, mut read) = socket.split();
        let idle = self.timeouts.idle;
        let silence = tokio::time::sleep(idle.unwrap_or(Duration::MAX));
        tokio::pin!(silence);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                changed = gate.changed() => {
                    if changed.is_err() {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Cancelled;
                    }
                    if !self.observe_gate(gate).allows() {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Gated;
                    }
                }
                _ = &mut silence, if idle.is_some() => {
                    return SessionEnd::Dropped("no frames within idle timeout".into());
                }
                message = read.next() => {
                    let message = match message {
                        None => return SessionEnd::Dropped("stream ended".into()),
                        Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                        Some(Ok(message)) => message,
                    };
                    if let Some(idle) = idle {
                        silence.as_mut().reset(Instant::now() + idle);
                    }
                    match classify(&message) {
                        Signal::Keepalive => tracing::trace!("Realtime keepalive"),
                        Signal::Closed => return SessionEnd::Dropped("closed by server".into()),
                        Signal::RefreshHint => {
                            tracing::debug!("Realtime refresh hint");
                            match hints.try_send(()) {
                                // A hint is already queued; it covers this one
                                Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
                                Err(mpsc::error::TrySendError::Closed(())) => {
                                    return SessionEnd::Cancelled;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ping_is_keepalive() {
        assert_eq!(classify(&Message::Text(r#"{"type":"ping"}"#.into())), Signal::Keepalive);
        assert_eq!(classify(&Message::Ping(Vec::new().into())), Signal::Keepalive);
    }

    #[test]
    fn test_classify_other_payloads_are_hints() {
        assert_eq!(
            classify(&Message::Text(r#"{"type":"item_updated","id":"a"}"#.into())),
            Signal::RefreshHint
        );
        assert_eq!(classify(&Message::Text("not json".into())), Signal::RefreshHint);
        assert_eq!(classify(&Message::Text(r#"{"type":5}"#.into())), Signal::RefreshHint);
    }

    #[test]
    fn test_classify_close() {
        assert_eq!(classify(&Message::Close(None)), Signal::Closed);
    }

    #[test]
    fn test_realtime_url_scheme_mapping() {
        let secure = Url::parse("https://api.example.com/").unwrap();
        assert_eq!(
            realtime_url(&secure, "/v1/realtime").unwrap().as_str(),
            "wss://api.example.com/v1/realtime"
        );

        let plain = Url::parse("http://localhost:8080/api/").unwrap();
        assert_eq!(
            realtime_url(&plain, "v1/realtime").unwrap().as_str(),
            "ws://localhost:8080/api/v1/realtime"
        );
    }

    #[test]
    fn test_realtime_url_rejects_other_schemes() {
        let ftp = Url::parse("ftp://example.com/").unwrap();
        assert!(realtime_url(&ftp, "/v1/realtime").is_none());
    }

    #[test]
    fn test_gate_requires_foreground_and_online() {
        let open = ChannelGate {
            foreground: true,
            online: true,
        };
        assert!(open.allows());
        assert!(!ChannelGate {
            foreground: false,
            ..open
        }
        .allows());
        assert!(!ChannelGate {
            online: false,
            ..open
        }
        .allows());
    }
}
