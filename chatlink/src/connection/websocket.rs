//! WebSocket connector over `tokio-tungstenite`.
//!
//! Each open socket is split into a writer task, which drains
//! [`LinkCommand`]s into the sink, and a reader task, which turns incoming
//! text frames and closes into [`LinkEvent`]s. Binary frames are not part of
//! the chat protocol and are skipped.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::{ConnectionError, Connector, Link, LinkCommand, LinkEvent};

/// Write half of a WebSocket connection.
type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Read half of a WebSocket connection.
type WsStream = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Opens real WebSocket connections (`ws://` or `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    async fn open(&self, url: &Url) -> Result<Link, ConnectionError> {
        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            tracing::warn!(host = url.host_str().unwrap_or_default(), err = %e, "WebSocket connect failed");
            map_ws_connect_error(e)
        })?;

        let (sink, stream) = ws_stream.split();
        let (outbound, commands) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();

        tokio::spawn(writer_loop(sink, commands));
        tokio::spawn(reader_loop(stream, events));

        Ok(Link { outbound, inbound })
    }
}

async fn writer_loop(mut sink: WsSink, mut commands: mpsc::UnboundedReceiver<LinkCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            LinkCommand::Text(text) => {
                if let Err(e) = sink.send(Message::text(text)).await {
                    tracing::warn!(err = %e, "WebSocket write failed");
                    break;
                }
            }
            LinkCommand::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    tracing::debug!(err = %e, "WebSocket close frame not sent");
                }
                break;
            }
        }
    }
    let _ = sink.close().await;
    tracing::debug!("WebSocket writer task exiting");
}

async fn reader_loop(mut stream: WsStream, events: mpsc::UnboundedSender<LinkEvent>) {
    let mut code = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => {
                if events.send(LinkEvent::Text(text.to_string())).is_err() {
                    // Manager dropped the socket.
                    return;
                }
            }
            Ok(Message::Close(frame)) => {
                code = frame.map(|f| u16::from(f.code));
                break;
            }
            Ok(Message::Binary(data)) => {
                tracing::debug!(len = data.len(), "skipping binary WebSocket frame");
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                let _ = events.send(LinkEvent::Error(e.to_string()));
                break;
            }
        }
    }
    let _ = events.send(LinkEvent::Closed { code });
    tracing::debug!(?code, "WebSocket reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`ConnectionError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> ConnectionError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => ConnectionError::Transport(format!("I/O error: {io_err}")),
        WsError::Tls(_) => ConnectionError::Transport(format!("TLS error: {err}")),
        WsError::Http(response) => ConnectionError::Transport(format!(
            "HTTP error during upgrade: status {}",
            response.status()
        )),
        WsError::Url(e) => ConnectionError::Transport(format!("invalid socket URL: {e}")),
        other => ConnectionError::Transport(format!("WebSocket connect error: {other}")),
    }
}
