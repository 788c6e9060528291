//! One-shot requests against the proxy

use anyhow::{Result, bail};
use btlejuice_core::proxy::{ClientRequest, ConnectionState, ProxyEvent};
use btlejuice_core::ProxyClient;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{Instant, timeout, timeout_at};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ScanHit {
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Collects `discover` events for `duration`, one entry per address.
pub async fn scan(url: &str, duration: Duration) -> Result<BTreeMap<String, ScanHit>> {
    let mut client = ProxyClient::connect(url).await?;
    client.send(ClientRequest::ScanDevices).await?;

    let deadline = Instant::now() + duration;
    let mut devices = BTreeMap::new();
    while let Ok(event) = timeout_at(deadline, client.next_event()).await {
        match event {
            Some(ProxyEvent::Discover {
                address,
                name,
                rssi,
            }) => {
                let hit = devices
                    .entry(address)
                    .or_insert(ScanHit { name: None, rssi });
                if name.is_some() {
                    hit.name = name;
                }
                hit.rssi = rssi.or(hit.rssi);
            }
            Some(_) => {}
            None => bail!("proxy closed the connection"),
        }
    }

    client.send(ClientRequest::Stop).await?;
    Ok(devices)
}

pub async fn status(url: &str) -> Result<ConnectionState> {
    let mut client = ProxyClient::connect(url).await?;
    client.send(ClientRequest::Status).await?;
    wait_for(&mut client, |event| match event {
        ProxyEvent::Status { state } => Some(*state),
        _ => None,
    })
    .await
}

pub async fn stop(url: &str) -> Result<()> {
    let mut client = ProxyClient::connect(url).await?;
    client.send(ClientRequest::Stop).await?;
    // a second stop emits nothing, so confirm through status
    client.send(ClientRequest::Status).await?;
    wait_for(&mut client, |event| match event {
        ProxyEvent::Status { .. } => Some(()),
        _ => None,
    })
    .await
}

async fn wait_for<T>(
    client: &mut ProxyClient,
    mut pick: impl FnMut(&ProxyEvent) -> Option<T>,
) -> Result<T> {
    let found = timeout(REPLY_TIMEOUT, async {
        while let Some(event) = client.next_event().await {
            if let Some(value) = pick(&event) {
                return Some(value);
            }
        }
        None
    })
    .await;

    match found {
        Ok(Some(value)) => Ok(value),
        Ok(None) => bail!("proxy closed the connection"),
        Err(_) => bail!("no reply from proxy within {:?}", REPLY_TIMEOUT),
    }
}
