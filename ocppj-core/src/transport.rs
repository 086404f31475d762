//! Frame transports
//!
//! A transport opens a `Link`: an ordered, reliable duplex pipe of text
//! frames. Writing a frame is a non-blocking push onto the link's outbound
//! channel, so the correlation queue can write while holding its lock.
//! The inbound channel ends when the peer goes away.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
};
use tracing::{debug, error, info, warn};

use crate::error::OcppError;

/// OCPP 2.0.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

/// Write half of a link
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<String>,
}

impl FrameSender {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Queue a frame for the wire
    pub fn send(&self, frame: String) -> Result<(), OcppError> {
        self.tx.send(frame).map_err(|_| OcppError::ConnectionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open duplex connection to a peer
#[derive(Debug)]
pub struct Link {
    pub outbound: FrameSender,
    pub inbound: mpsc::UnboundedReceiver<String>,
    /// Pump tasks that live as long as the link
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    pub fn new(outbound: FrameSender, inbound: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            outbound,
            inbound,
            tasks: Vec::new(),
        }
    }

    fn with_tasks(mut self, tasks: Vec<JoinHandle<()>>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn into_parts(
        self,
    ) -> (
        FrameSender,
        mpsc::UnboundedReceiver<String>,
        Vec<JoinHandle<()>>,
    ) {
        (self.outbound, self.inbound, self.tasks)
    }
}

/// Two links wired back to back
pub fn memory_pair() -> (Link, Link) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        Link::new(FrameSender::new(a_tx), a_rx),
        Link::new(FrameSender::new(b_tx), b_rx),
    )
}

/// Something that can open a link to an address
pub trait Transport: Send + Sync {
    fn open<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Link, OcppError>>;
}

/// Transport handing out one pre-built link, whatever the address
#[derive(Debug)]
pub struct MemoryTransport {
    link: Mutex<Option<Link>>,
}

impl MemoryTransport {
    pub fn new(link: Link) -> Self {
        Self {
            link: Mutex::new(Some(link)),
        }
    }
}

impl Transport for MemoryTransport {
    fn open<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Link, OcppError>> {
        let link = self.link.lock().take();
        Box::pin(async move {
            debug!("Opening in-memory link to {}", address);
            link.ok_or_else(|| OcppError::Transport("in-memory link already taken".to_string()))
        })
    }
}

/// OCPP-J over WebSocket text frames
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    subprotocol: String,
    max_message_size: Option<usize>,
    max_frame_size: Option<usize>,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self {
            subprotocol: OCPP_SUBPROTOCOL.to_string(),
            max_message_size: Some(64 * 1024),
            max_frame_size: Some(16 * 1024),
        }
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = subprotocol.into();
        self
    }

    pub fn with_max_message_size(mut self, size: Option<usize>) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_max_frame_size(mut self, size: Option<usize>) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    async fn connect(&self, address: &str) -> Result<Link, OcppError> {
        let mut request = address
            .into_client_request()
            .map_err(|e| OcppError::Transport(format!("invalid address {}: {}", address, e)))?;
        let protocol = HeaderValue::from_str(&self.subprotocol)
            .map_err(|e| OcppError::Transport(format!("invalid subprotocol: {}", e)))?;
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);

        let ws_config = WebSocketConfig {
            max_message_size: self.max_message_size,
            max_frame_size: self.max_frame_size,
            ..Default::default()
        };

        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false)
            .await
            .map_err(|e| {
                error!("WebSocket connection failed: {}", e);
                OcppError::Transport(e.to_string())
            })?;

        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted_protocol != Some(self.subprotocol.as_str()) {
            warn!(
                "Peer did not accept subprotocol {}, got: {:?}",
                self.subprotocol, accepted_protocol
            );
        }

        info!("WebSocket connected to {}", address);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        // Detached: ends once every FrameSender is dropped, then sends Close.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                debug!("Sending: {}", frame);
                if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                    error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            debug!("Outbound side released, closing WebSocket");
            let _ = ws_tx.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        debug!("Received: {}", text);
                        if in_tx.send(text.as_str().to_owned()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        warn!("Ignoring binary frame");
                    }
                    Ok(Message::Close(_)) => {
                        info!("WebSocket closed by peer");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Link::new(FrameSender::new(out_tx), in_rx).with_tasks(vec![reader]))
    }
}

impl Transport for WebSocketTransport {
    fn open<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<Link, OcppError>> {
        Box::pin(self.connect(address))
    }
}

/// Endpoint of a station: the CSMS base URL with the identity appended
pub fn station_url(base_url: &str, identity: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), identity)
}
