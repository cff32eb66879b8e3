//! Reference channel client.
//!
//! Connects to a termhost server, forwards input, and reconnects on loss
//! following [`protocol::Reconnector`]. Each successful open is immediately
//! followed by a resize carrying the current viewport, so a fresh shell
//! always starts at the right size.

use futures_util::{SinkExt, StreamExt};
use protocol::{
    ConnectionStatus, ControlFrame, ProtocolError, ReconnectAction, ReconnectPolicy, Reconnector,
    CONNECTION_LOST_MESSAGE,
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::SESSION_COOKIE;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid channel URL: {0}")]
    InvalidUrl(String),

    #[error("invalid session cookie")]
    InvalidCookie,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("gave up after {attempts} reconnection attempts")]
    GaveUp { attempts: u32 },
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Channel endpoint, e.g. `ws://127.0.0.1:3000/ws`.
    pub url: Url,
    /// Session token obtained from the login endpoint, if auth is enabled.
    pub session_token: Option<String>,
    /// Initial viewport width.
    pub cols: u16,
    /// Initial viewport height.
    pub rows: u16,
    /// Reconnection schedule.
    pub policy: ReconnectPolicy,
}

impl ClientConfig {
    /// Configuration with an 80x24 viewport and the default policy.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            session_token: None,
            cols: 80,
            rows: 24,
            policy: ReconnectPolicy::default(),
        }
    }
}

/// Input from the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInput {
    /// Keystrokes or pasted bytes.
    Data(Vec<u8>),
    /// Viewport change.
    Resize { cols: u16, rows: u16 },
}

/// Output for the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Terminal output.
    Output(Vec<u8>),
    /// A server notice or the final connection-lost message.
    Notice(String),
    /// Connection status changed.
    Status(ConnectionStatus),
}

/// How one connection ended.
enum ConnectionEnd {
    /// The user is done; do not reconnect.
    Quit,
    /// The channel dropped.
    Lost(String),
}

/// Reconnecting channel client.
pub struct ChannelClient {
    config: ClientConfig,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl ChannelClient {
    /// Creates a client. Only `ws` and `wss` URLs are accepted.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        match config.url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ClientError::InvalidUrl(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        }

        let (status_tx, _) = watch::channel(ConnectionStatus::Connecting);
        Ok(Self { config, status_tx })
    }

    /// Watches the connection status.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Runs until the user closes `input` or reconnection gives up.
    pub async fn run(
        &self,
        mut input: mpsc::Receiver<ClientInput>,
        events: mpsc::Sender<ClientEvent>,
    ) -> Result<(), ClientError> {
        let mut reconnector = Reconnector::new(self.config.policy);
        let mut viewport = (self.config.cols, self.config.rows);

        loop {
            reconnector.on_connecting();
            self.publish(reconnector.status(), &events).await;

            match self.connect().await {
                Ok(stream) => {
                    let resize = reconnector.on_open(viewport.0, viewport.1);
                    self.publish(reconnector.status(), &events).await;
                    info!(url = %self.config.url, "Channel connected");

                    match self
                        .drive(stream, resize, &mut input, &events, &mut viewport)
                        .await
                    {
                        ConnectionEnd::Quit => return Ok(()),
                        ConnectionEnd::Lost(reason) => {
                            warn!(reason = %reason, "Channel lost");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Connection attempt failed");
                }
            }

            match reconnector.on_close() {
                ReconnectAction::Retry { attempt, delay } => {
                    self.publish(reconnector.status(), &events).await;
                    info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
                    tokio::time::sleep(delay).await;
                }
                ReconnectAction::GiveUp => {
                    self.publish(reconnector.status(), &events).await;
                    let _ = events
                        .send(ClientEvent::Notice(CONNECTION_LOST_MESSAGE.to_string()))
                        .await;
                    return Err(ClientError::GaveUp {
                        attempts: self.config.policy.max_attempts,
                    });
                }
            }
        }
    }

    async fn connect(&self) -> Result<ClientStream, ClientError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;

        if let Some(ref token) = self.config.session_token {
            let cookie = HeaderValue::from_str(&format!("{}={}", SESSION_COOKIE, token))
                .map_err(|_| ClientError::InvalidCookie)?;
            request.headers_mut().insert(COOKIE, cookie);
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        Ok(stream)
    }

    /// Pumps one open connection.
    async fn drive(
        &self,
        stream: ClientStream,
        resize: ControlFrame,
        input: &mut mpsc::Receiver<ClientInput>,
        events: &mpsc::Sender<ClientEvent>,
        viewport: &mut (u16, u16),
    ) -> ConnectionEnd {
        let (mut sink, mut stream) = stream.split();

        let first = match resize.to_json() {
            Ok(json) => json,
            Err(e) => return ConnectionEnd::Lost(e.to_string()),
        };
        if let Err(e) = sink.send(Message::Text(first)).await {
            return ConnectionEnd::Lost(e.to_string());
        }

        loop {
            tokio::select! {
                local = input.recv() => {
                    let message = match local {
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            return ConnectionEnd::Quit;
                        }
                        Some(ClientInput::Data(bytes)) => Message::Binary(bytes),
                        Some(ClientInput::Resize { cols, rows }) => {
                            match ControlFrame::resize(cols, rows).to_json() {
                                Ok(json) => {
                                    *viewport = (cols, rows);
                                    Message::Text(json)
                                }
                                Err(e) => {
                                    debug!(error = %e, "Ignoring invalid resize");
                                    continue;
                                }
                            }
                        }
                    };
                    if let Err(e) = sink.send(message).await {
                        return ConnectionEnd::Lost(e.to_string());
                    }
                }

                remote = stream.next() => {
                    let event = match remote {
                        Some(Ok(Message::Binary(bytes))) => ClientEvent::Output(bytes),
                        Some(Ok(Message::Text(text))) => ClientEvent::Notice(text),
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_else(|| "closed by server".to_string());
                            return ConnectionEnd::Lost(reason);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return ConnectionEnd::Lost(e.to_string()),
                        None => return ConnectionEnd::Lost("stream ended".to_string()),
                    };
                    if events.send(event).await.is_err() {
                        let _ = sink.send(Message::Close(None)).await;
                        return ConnectionEnd::Quit;
                    }
                }
            }
        }
    }

    async fn publish(&self, status: ConnectionStatus, events: &mpsc::Sender<ClientEvent>) {
        self.status_tx.send_replace(status);
        let _ = events.send(ClientEvent::Status(status)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            max_attempts,
        }
    }

    #[test]
    fn test_rejects_non_websocket_url() {
        let config = ClientConfig::new(Url::parse("http://127.0.0.1:3000/ws").unwrap());
        assert!(matches!(
            ChannelClient::new(config),
            Err(ClientError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_gives_up_after_policy_attempts() {
        // Reserve a port, then free it so connections are refused.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config =
            ClientConfig::new(Url::parse(&format!("ws://127.0.0.1:{}/ws", port)).unwrap());
        config.policy = fast_policy(3);
        let client = ChannelClient::new(config).unwrap();
        let status = client.status();

        let (_input_tx, input_rx) = mpsc::channel(8);
        let (events_tx, mut events_rx) = mpsc::channel(64);

        let result = client.run(input_rx, events_tx).await;
        assert!(matches!(result, Err(ClientError::GaveUp { attempts: 3 })));
        assert_eq!(*status.borrow(), ConnectionStatus::Failed);

        let mut statuses = Vec::new();
        let mut notices = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            match event {
                ClientEvent::Status(s) => statuses.push(s),
                ClientEvent::Notice(n) => notices.push(n),
                ClientEvent::Output(_) => panic!("unexpected output"),
            }
        }

        let connecting = statuses
            .iter()
            .filter(|s| **s == ConnectionStatus::Connecting)
            .count();
        assert_eq!(connecting, 4);
        assert_eq!(statuses.last(), Some(&ConnectionStatus::Failed));
        assert_eq!(notices, vec![CONNECTION_LOST_MESSAGE.to_string()]);
    }
}
