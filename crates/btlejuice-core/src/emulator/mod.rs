//! Emulated peripheral
//!
//! [`FakeDevice`] clones a [`DeviceProfile`] onto a local [`PeripheralBackend`]: same
//! attribute tree, optionally the same handles, and the same advertising payloads. Incoming
//! requests from the intercepted central are turned into [`FakeRequest`]s; the caller
//! answers them later through `complete_read` / `complete_write`.

pub mod patch;

pub use patch::{HandlePatcher, property_flags};

use crate::ble::{PeripheralBackend, PeripheralEvent, RequestError};
use crate::error::Result;
use crate::gatt::{DeviceProfile, normalize};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot};

type CharKey = (String, String);

/// Request from the intercepted central, to be relayed towards the real device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeRequest {
    CentralConnected {
        address: String,
    },
    CentralDisconnected {
        address: String,
    },
    Read {
        service: String,
        characteristic: String,
        offset: u16,
    },
    Write {
        service: String,
        characteristic: String,
        data: Vec<u8>,
        offset: u16,
        without_response: bool,
    },
    Subscribe {
        service: String,
        characteristic: String,
    },
    Unsubscribe {
        service: String,
        characteristic: String,
    },
}

pub struct FakeDevice {
    backend: Box<dyn PeripheralBackend>,
    events: mpsc::Receiver<PeripheralEvent>,
    keep_handles: bool,
    reads: HashMap<CharKey, oneshot::Sender<Result<Vec<u8>, RequestError>>>,
    writes: HashMap<CharKey, oneshot::Sender<Result<(), RequestError>>>,
    subscriptions: HashSet<CharKey>,
    central: Option<String>,
    advertising: bool,
}

impl FakeDevice {
    pub fn new(
        backend: Box<dyn PeripheralBackend>,
        events: mpsc::Receiver<PeripheralEvent>,
        keep_handles: bool,
    ) -> Self {
        Self {
            backend,
            events,
            keep_handles,
            reads: HashMap::new(),
            writes: HashMap::new(),
            subscriptions: HashSet::new(),
            central: None,
            advertising: false,
        }
    }

    /// Serves the profile's attributes and starts advertising its payloads.
    pub async fn setup(&mut self, profile: &DeviceProfile) -> Result<()> {
        if self.advertising {
            self.stop().await?;
        }

        self.backend.set_services(&profile.attribute_tree)?;
        if self.keep_handles {
            HandlePatcher::patch(&profile.attribute_tree, self.backend.attribute_table_mut());
        }
        self.backend
            .start_advertising(&profile.ad_records, profile.scan_data.as_deref())
            .await?;
        self.advertising = true;

        info!(
            "Emulating {} ({}) with {} services",
            profile.address,
            profile.name.as_deref().unwrap_or("unnamed"),
            profile.attribute_tree.services().len()
        );
        Ok(())
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    /// Address of the connected central, if any.
    pub fn central(&self) -> Option<&str> {
        self.central.as_deref()
    }

    pub fn is_subscribed(&self, service: &str, characteristic: &str) -> bool {
        self.subscriptions
            .contains(&(service.to_string(), characteristic.to_string()))
    }

    /// Waits for the next request that needs relaying. `None` once the backend is gone.
    pub async fn next_request(&mut self) -> Option<FakeRequest> {
        loop {
            let event = self.events.recv().await?;
            if let Some(request) = self.accept(event) {
                return Some(request);
            }
        }
    }

    fn accept(&mut self, event: PeripheralEvent) -> Option<FakeRequest> {
        match event {
            PeripheralEvent::Accepted { address } => {
                info!("Central {} connected to the emulated device", address);
                self.central = Some(address.clone());
                Some(FakeRequest::CentralConnected { address })
            }
            PeripheralEvent::Disconnected { address } => {
                info!("Central {} disconnected", address);
                self.central = None;
                self.subscriptions.clear();
                self.fail_pending(RequestError::Unlikely);
                Some(FakeRequest::CentralDisconnected { address })
            }
            PeripheralEvent::Read {
                service,
                characteristic,
                offset,
                reply,
            } => {
                let (service, characteristic) = (normalize(&service), normalize(&characteristic));
                let key = (service.clone(), characteristic.clone());
                if self.reads.contains_key(&key) {
                    debug!("Read already in progress on {} {}", service, characteristic);
                    let _ = reply.send(Err(RequestError::InProgress));
                    return None;
                }
                self.reads.insert(key, reply);
                Some(FakeRequest::Read {
                    service,
                    characteristic,
                    offset,
                })
            }
            PeripheralEvent::Write {
                service,
                characteristic,
                data,
                offset,
                without_response,
                reply,
            } => {
                let (service, characteristic) = (normalize(&service), normalize(&characteristic));
                if without_response {
                    let _ = reply.send(Ok(()));
                } else {
                    let key = (service.clone(), characteristic.clone());
                    if self.writes.contains_key(&key) {
                        debug!("Write already in progress on {} {}", service, characteristic);
                        let _ = reply.send(Err(RequestError::InProgress));
                        return None;
                    }
                    self.writes.insert(key, reply);
                }
                Some(FakeRequest::Write {
                    service,
                    characteristic,
                    data,
                    offset,
                    without_response,
                })
            }
            PeripheralEvent::Subscribe {
                service,
                characteristic,
            } => {
                let (service, characteristic) = (normalize(&service), normalize(&characteristic));
                self.subscriptions
                    .insert((service.clone(), characteristic.clone()));
                Some(FakeRequest::Subscribe {
                    service,
                    characteristic,
                })
            }
            PeripheralEvent::Unsubscribe {
                service,
                characteristic,
            } => {
                let (service, characteristic) = (normalize(&service), normalize(&characteristic));
                self.subscriptions
                    .remove(&(service.clone(), characteristic.clone()));
                Some(FakeRequest::Unsubscribe {
                    service,
                    characteristic,
                })
            }
        }
    }

    /// Answers the read pending on this characteristic. Returns false if none was pending.
    pub fn complete_read(
        &mut self,
        service: &str,
        characteristic: &str,
        result: Result<Vec<u8>, RequestError>,
    ) -> bool {
        let key = (service.to_string(), characteristic.to_string());
        match self.reads.remove(&key) {
            Some(reply) => {
                if reply.send(result).is_err() {
                    debug!("Central gave up on read of {} {}", service, characteristic);
                }
                true
            }
            None => false,
        }
    }

    pub fn complete_write(
        &mut self,
        service: &str,
        characteristic: &str,
        result: Result<(), RequestError>,
    ) -> bool {
        let key = (service.to_string(), characteristic.to_string());
        match self.writes.remove(&key) {
            Some(reply) => {
                if reply.send(result).is_err() {
                    debug!("Central gave up on write of {} {}", service, characteristic);
                }
                true
            }
            None => false,
        }
    }

    /// Forwards a notification to the central if it subscribed to this characteristic.
    pub async fn notify(&self, service: &str, characteristic: &str, data: Vec<u8>) -> Result<bool> {
        if !self.is_subscribed(service, characteristic) {
            debug!(
                "Dropping notification on {} {}: central not subscribed",
                service, characteristic
            );
            return Ok(false);
        }
        self.backend.notify(service, characteristic, data).await
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.fail_pending(RequestError::Unlikely);
        self.subscriptions.clear();
        self.central = None;
        if self.advertising {
            self.advertising = false;
            self.backend.stop().await?;
            info!("Emulated device stopped");
        }
        Ok(())
    }

    fn fail_pending(&mut self, error: RequestError) {
        let reads = self.reads.len();
        let writes = self.writes.len();
        for (_, reply) in self.reads.drain() {
            let _ = reply.send(Err(error));
        }
        for (_, reply) in self.writes.drain() {
            let _ = reply.send(Err(error));
        }
        if reads + writes > 0 {
            warn!("Failed {} pending reads and {} pending writes", reads, writes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{AttributeTable, ServedAttribute};
    use crate::gatt::AttributeTree;
    use crate::gatt::tree::tests::sample_services;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        advertised: Vec<(Vec<u8>, Option<Vec<u8>>)>,
        notified: Vec<Vec<u8>>,
        stops: usize,
        table: Option<AttributeTable>,
    }

    struct MockPeripheral {
        table: AttributeTable,
        recorded: Arc<Mutex<Recorded>>,
    }

    #[async_trait]
    impl PeripheralBackend for MockPeripheral {
        fn set_services(&mut self, tree: &AttributeTree) -> Result<()> {
            self.table = AttributeTable::sequential(tree);
            Ok(())
        }

        fn attribute_table_mut(&mut self) -> &mut AttributeTable {
            &mut self.table
        }

        async fn start_advertising(
            &mut self,
            adv_data: &[u8],
            scan_data: Option<&[u8]>,
        ) -> Result<()> {
            let mut recorded = self.recorded.lock().unwrap();
            recorded
                .advertised
                .push((adv_data.to_vec(), scan_data.map(<[u8]>::to_vec)));
            recorded.table = Some(self.table.clone());
            Ok(())
        }

        async fn notify(&self, _: &str, _: &str, data: Vec<u8>) -> Result<bool> {
            self.recorded.lock().unwrap().notified.push(data);
            Ok(true)
        }

        async fn stop(&mut self) -> Result<()> {
            self.recorded.lock().unwrap().stops += 1;
            Ok(())
        }
    }

    fn fake(keep_handles: bool) -> (FakeDevice, mpsc::Sender<PeripheralEvent>, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let backend = MockPeripheral {
            table: AttributeTable::default(),
            recorded: recorded.clone(),
        };
        let (tx, rx) = mpsc::channel(8);
        (FakeDevice::new(Box::new(backend), rx, keep_handles), tx, recorded)
    }

    fn profile() -> DeviceProfile {
        DeviceProfile::new(
            "54:4a:16:6d:3d:23",
            vec![0x02, 0x01, 0x06],
            Some(vec![0x05, 0x09, b'l', b'a', b'm', b'p']),
            Some("lamp".to_string()),
            AttributeTree::new(sample_services()).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_setup_keeps_original_handles() {
        let (mut fake, _tx, recorded) = fake(true);
        fake.setup(&profile()).await.unwrap();

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.advertised.len(), 1);
        assert_eq!(recorded.advertised[0].0, vec![0x02, 0x01, 0x06]);
        let table = recorded.table.as_ref().unwrap();
        assert!(matches!(table.get(0x000c), Some(ServedAttribute::Service { .. })));
        assert!(table.get(0x0010).is_some());
    }

    #[tokio::test]
    async fn test_setup_without_patching_is_sequential() {
        let (mut fake, _tx, recorded) = fake(false);
        fake.setup(&profile()).await.unwrap();

        let recorded = recorded.lock().unwrap();
        let table = recorded.table.as_ref().unwrap();
        assert!(table.get(0x000c).is_none());
        assert_eq!(table.len(), 8);
    }

    #[tokio::test]
    async fn test_second_read_on_same_characteristic_is_rejected() {
        let (mut fake, tx, _) = fake(true);

        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        for reply in [first_tx, second_tx] {
            tx.send(PeripheralEvent::Read {
                service: "180a".to_string(),
                characteristic: "2a29".to_string(),
                offset: 0,
                reply,
            })
            .await
            .unwrap();
        }
        drop(tx);

        assert_eq!(
            fake.next_request().await,
            Some(FakeRequest::Read {
                service: "180a".to_string(),
                characteristic: "2a29".to_string(),
                offset: 0,
            })
        );
        // the duplicate is answered inline and never surfaces
        assert_eq!(fake.next_request().await, None);
        assert_eq!(second_rx.await.unwrap(), Err(RequestError::InProgress));

        assert!(fake.complete_read("180a", "2a29", Ok(b"ACME".to_vec())));
        assert_eq!(first_rx.await.unwrap(), Ok(b"ACME".to_vec()));
        assert!(!fake.complete_read("180a", "2a29", Ok(vec![])));
    }

    #[tokio::test]
    async fn test_write_command_is_acknowledged_immediately() {
        let (mut fake, tx, _) = fake(true);
        let (reply, ack) = oneshot::channel();
        tx.send(PeripheralEvent::Write {
            service: "180a".to_string(),
            characteristic: "2a29".to_string(),
            data: vec![0x01],
            offset: 0,
            without_response: true,
            reply,
        })
        .await
        .unwrap();

        assert!(matches!(
            fake.next_request().await,
            Some(FakeRequest::Write { without_response: true, .. })
        ));
        assert_eq!(ack.await.unwrap(), Ok(()));
        assert!(!fake.complete_write("180a", "2a29", Ok(())));
    }

    #[tokio::test]
    async fn test_disconnect_clears_subscriptions_and_pending() {
        let (mut fake, tx, recorded) = fake(true);
        let svc = "94e000015d5b11e4846f4437e6b36dfb";
        let chr = "94e000025d5b11e4846f4437e6b36dfb";

        tx.send(PeripheralEvent::Subscribe {
            service: svc.to_string(),
            characteristic: chr.to_string(),
        })
        .await
        .unwrap();
        fake.next_request().await;
        assert!(fake.notify(svc, chr, vec![0x42]).await.unwrap());

        let (reply, pending) = oneshot::channel();
        tx.send(PeripheralEvent::Write {
            service: svc.to_string(),
            characteristic: chr.to_string(),
            data: vec![0x01],
            offset: 0,
            without_response: false,
            reply,
        })
        .await
        .unwrap();
        fake.next_request().await;

        tx.send(PeripheralEvent::Disconnected {
            address: "11:22:33:44:55:66".to_string(),
        })
        .await
        .unwrap();
        assert!(matches!(
            fake.next_request().await,
            Some(FakeRequest::CentralDisconnected { .. })
        ));

        assert_eq!(pending.await.unwrap(), Err(RequestError::Unlikely));
        assert!(!fake.notify(svc, chr, vec![0x43]).await.unwrap());
        assert_eq!(recorded.lock().unwrap().notified, vec![vec![0x42]]);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (mut fake, _tx, recorded) = fake(true);
        fake.setup(&profile()).await.unwrap();
        fake.stop().await.unwrap();
        fake.stop().await.unwrap();
        assert_eq!(recorded.lock().unwrap().stops, 1);
        assert!(!fake.is_advertising());
    }
}
