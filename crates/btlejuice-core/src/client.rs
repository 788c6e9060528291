//! WebSocket client for the relay proxy
//!
//! Sends [`ClientRequest`]s and receives [`ProxyEvent`]s, one JSON object per text frame.

use crate::error::{ProxyError, Result};
use crate::proxy::{ClientRequest, ProxyEvent};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const CHANNEL_DEPTH: usize = 64;

pub struct ProxyClient {
    requests: mpsc::Sender<ClientRequest>,
    events: mpsc::Receiver<ProxyEvent>,
    task: Option<JoinHandle<()>>,
}

impl ProxyClient {
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to proxy at {}", url);
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (request_tx, mut request_rx) = mpsc::channel::<ClientRequest>(CHANNEL_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_DEPTH);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = request_rx.recv() => {
                        let Some(request) = request else {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        };
                        let text = match serde_json::to_string(&request) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to encode {:?}: {}", request, e);
                                continue;
                            }
                        };
                        debug!("-> {}", text);
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!("Proxy connection lost: {}", e);
                            break;
                        }
                    }
                    frame = read.next() => {
                        let text = match frame {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) | None => {
                                info!("Proxy closed the connection");
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                warn!("Proxy connection lost: {}", e);
                                break;
                            }
                        };
                        debug!("<- {}", text);
                        match serde_json::from_str::<ProxyEvent>(&text) {
                            Ok(event) => {
                                if event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Ignoring malformed proxy message: {}", e),
                        }
                    }
                }
            }
        });

        Ok(Self {
            requests: request_tx,
            events: event_rx,
            task: Some(task),
        })
    }

    /// Client over plain channels, without a socket.
    pub fn from_channels(
        requests: mpsc::Sender<ClientRequest>,
        events: mpsc::Receiver<ProxyEvent>,
    ) -> Self {
        Self {
            requests,
            events,
            task: None,
        }
    }

    pub async fn send(&self, request: ClientRequest) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| ProxyError::ChannelUnavailable)
    }

    /// Next event from the proxy. `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<ProxyEvent> {
        self.events.recv().await
    }
}

impl Drop for ProxyClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
