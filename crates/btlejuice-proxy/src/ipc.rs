//! WebSocket channel to the controlling client
//!
//! Every accepted connection becomes the engine's controlling client; the engine drops
//! the previous one, which closes its socket here.

use anyhow::Result;
use btlejuice_core::proxy::{ClientRequest, EngineCommand};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

const EVENT_QUEUE: usize = 256;

pub async fn run_ws_server(listener: TcpListener, engine: mpsc::Sender<EngineCommand>) {
    let mut next_id: u64 = 0;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                next_id += 1;
                let id = next_id;
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(id, stream, peer, engine).await {
                        tracing::warn!("Client #{} ({}) failed: {}", id, peer, e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    engine: mpsc::Sender<EngineCommand>,
) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();
    tracing::info!("Client #{} connected from {}", id, peer);

    let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE);
    engine
        .send(EngineCommand::Attach {
            id,
            events: events_tx,
        })
        .await?;

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                // the engine dropped us for a newer client
                let Some(event) = event else {
                    tracing::info!("Client #{} replaced, closing", id);
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                let text = serde_json::to_string(&event)?;
                tracing::trace!("#{} <- {}", id, text);
                write.send(Message::Text(text)).await?;
            }
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!("Client #{} read error: {}", id, e);
                        break;
                    }
                };
                tracing::trace!("#{} -> {}", id, text);
                match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(request) => engine.send(EngineCommand::Request(request)).await?,
                    Err(e) => tracing::warn!("Client #{} sent a malformed message: {}", id, e),
                }
            }
        }
    }

    let _ = engine.send(EngineCommand::Detach { id }).await;
    tracing::info!("Client #{} disconnected", id);
    Ok(())
}
