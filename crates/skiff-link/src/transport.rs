use futures_util::future::{self, BoxFuture};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use rustls::{ClientConfig, RootCertStore};
use std::pin::Pin;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,
    #[error("transport: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("connect to {url} failed: {reason}")]
    Failed { url: String, reason: String },
}

pub type LinkSink = Pin<Box<dyn Sink<String, Error = LinkError> + Send>>;
pub type LinkStream = Pin<Box<dyn Stream<Item = Result<String, LinkError>> + Send>>;

/// One established relay connection carrying text records both ways.
/// The stream ending, or yielding [`LinkError::Closed`], means the link is gone.
pub struct Link {
    pub tx: LinkSink,
    pub rx: LinkStream,
}

pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Link, ConnectError>>;
}

/// WebSocket transport; `wss://` is verified against the webpki roots.
pub struct WsConnector {
    tls: Arc<ClientConfig>,
}

impl WsConnector {
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let cfg = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
        Self { tls: Arc::new(cfg) }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for WsConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Link, ConnectError>> {
        Box::pin(async move {
            let tls = tokio_tungstenite::Connector::Rustls(self.tls.clone());
            let (ws, resp) = tokio_tungstenite::connect_async_tls_with_config(url, None, true, Some(tls))
                .await
                .map_err(|e| match e {
                    tungstenite::Error::Url(reason) => {
                        ConnectError::InvalidUrl { url: url.to_string(), reason: reason.to_string() }
                    }
                    other => ConnectError::Failed { url: url.to_string(), reason: other.to_string() },
                })?;
            debug!("link: websocket handshake status {}", resp.status());

            let (sink, stream) = ws.split();
            let tx = sink
                .sink_map_err(ws_error)
                .with(|text: String| future::ready(Ok::<_, LinkError>(Message::Text(text))));
            let rx = stream.filter_map(|frame| {
                future::ready(match frame {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Close(_)) => Some(Err(LinkError::Closed)),
                    // control frames are answered by tungstenite
                    Ok(_) => None,
                    Err(e) => Some(Err(ws_error(e))),
                })
            });
            Ok(Link { tx: Box::pin(tx), rx: Box::pin(rx) })
        })
    }
}

fn ws_error(e: tungstenite::Error) -> LinkError {
    match e {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Io(_)
        | tungstenite::Error::Protocol(tungstenite::error::ProtocolError::ResetWithoutClosingHandshake) => {
            LinkError::Closed
        }
        other => LinkError::Transport(other.to_string()),
    }
}
