//! WebSocket transport to the realtime voice service.
//!
//! [`connect`] spawns a background task that owns the socket. The session
//! talks to it through a [`TransportLink`]: commands go in, events come out.
//! There is no reconnection; a dropped socket ends the session.

use crate::config::TransportConfig;
use crate::error::{Result, VoiceError};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tracing::{debug, info, warn};

/// Beta header required by the realtime endpoint.
const BETA_HEADER: &str = "openai-beta";
const BETA_VALUE: &str = "realtime=v1";

/// Requests from the session to the socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    /// Write one JSON text frame.
    Send(String),
    /// Close the socket and end the task.
    Close,
}

/// Notifications from the socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The handshake completed; sends are now delivered.
    Opened,
    /// One inbound text frame.
    Message(String),
    /// The peer closed the socket.
    Closed,
    /// Connecting, reading or writing failed. No further events follow.
    Error(String),
}

/// Both ends of a running transport as seen by the session.
#[derive(Debug)]
pub struct TransportLink {
    pub commands: mpsc::UnboundedSender<TransportCommand>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportLink {
    /// Create a link with the far ends returned to the caller, for
    /// transports that are not WebSockets.
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<TransportCommand>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                commands: cmd_tx,
                events: event_rx,
            },
            cmd_rx,
            event_tx,
        )
    }
}

/// Build the handshake request: endpoint with the `model` query parameter,
/// bearer auth when a key is available, and the beta header.
///
/// # Errors
///
/// Returns [`VoiceError::Transport`] if the URL or a header value is invalid.
pub fn build_request(config: &TransportConfig, api_key: Option<&str>) -> Result<Request> {
    let mut url = url::Url::parse(&config.url)
        .map_err(|e| VoiceError::Transport(format!("invalid url '{}': {e}", config.url)))?;
    if !config.model.is_empty() {
        url.query_pairs_mut().append_pair("model", &config.model);
    }

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| VoiceError::Transport(format!("invalid request: {e}")))?;

    let headers = request.headers_mut();
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|e| VoiceError::Transport(format!("invalid api key: {e}")))?;
        headers.insert(AUTHORIZATION, value);
    }
    headers.insert(BETA_HEADER, HeaderValue::from_static(BETA_VALUE));
    Ok(request)
}

/// Open a transport in the background.
///
/// The returned link reports [`TransportEvent::Opened`] once the handshake
/// completes or [`TransportEvent::Error`] if it fails. Must be called from
/// within a tokio runtime.
///
/// # Errors
///
/// Returns [`VoiceError::Transport`] if the request cannot be built.
pub fn connect(config: &TransportConfig) -> Result<TransportLink> {
    let api_key = if config.api_key_env.is_empty() {
        None
    } else {
        std::env::var(&config.api_key_env).ok()
    };
    if api_key.is_none() && !config.api_key_env.is_empty() {
        warn!("{} is not set, connecting without authorization", config.api_key_env);
    }
    let request = build_request(config, api_key.as_deref())?;

    let (link, commands, events) = TransportLink::pair();
    tokio::spawn(async move {
        match run_socket(request, commands, &events).await {
            Ok(()) => debug!("transport task finished"),
            Err(e) => {
                warn!("transport failed: {e}");
                let _ = events.send(TransportEvent::Error(e));
            }
        }
    });
    Ok(link)
}

/// Connect, then pump frames both ways until either side closes.
async fn run_socket(
    request: Request,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> std::result::Result<(), String> {
    let host = request.uri().host().unwrap_or("<unknown>").to_owned();
    let (ws_stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| format!("connect: {e}"))?;
    info!(host, "transport connected");

    let (mut write, mut read) = ws_stream.split();
    if events.send(TransportEvent::Opened).is_err() {
        // Session already gone.
        let _ = write.send(Message::Close(None)).await;
        return Ok(());
    }

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(TransportEvent::Message(text)).is_err() {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "transport closed by server");
                        let _ = events.send(TransportEvent::Closed);
                        return Ok(());
                    }
                    None => {
                        let _ = events.send(TransportEvent::Closed);
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(format!("read error: {e}")),
                    _ => {} // Binary, Ping/Pong frames handled by tungstenite.
                }
            }
            command = commands.recv() => {
                match command {
                    Some(TransportCommand::Send(json)) => {
                        if let Err(e) = write.send(Message::Text(json)).await {
                            return Err(format!("send error: {e}"));
                        }
                    }
                    Some(TransportCommand::Close) | None => {
                        debug!("closing transport");
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
        }
    }
}
